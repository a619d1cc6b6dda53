// Copyright © 2019-2026 The Radicle Foundation <hello@radicle.foundation>
//
// This file is part of quic-reuse, distributed under the GPLv3 with Radicle
// Linking Exception. For full terms see the included LICENSE file.

//! A process-wide coordinator that lets multiple logical QUIC listeners,
//! dialers, and non-QUIC packet consumers share a small pool of underlying
//! UDP sockets.
//!
//! For any listen or dial it decides whether to bind a new socket, attach
//! to an existing one, or hand back one previously opened on the caller's
//! behalf, and reclaims sockets once their last user releases them. The
//! QUIC protocol engine itself — connection state machine, crypto, flow
//! control — is entirely [`quinn`]'s job; this crate only ever reaches far
//! enough into a connection to read its negotiated ALPN for routing.
//!
//! The pieces, leaves first:
//! - [`config`] — injectable collaborators ([`config::SocketBinder`],
//!   [`config::SourceIpSelector`], [`config::VerifySourceAddress`]) and the
//!   [`config::Config`] that wires them together.
//! - [`socket`] — the default socket binder and [`socket::DemuxSocket`],
//!   the `quinn::AsyncUdpSocket` implementation that lets one UDP socket be
//!   driven by the QUIC engine while also feeding a secondary, non-QUIC
//!   consumer.
//! - [`transport`] — [`transport::RefcountedTransport`], one bound socket
//!   plus QUIC endpoint, shared by reference count.
//! - [`pool`] — [`pool::ReusePool`], the per-family registry and
//!   transport-selection policy, one instance per IP family.
//! - [`listener`] — [`listener::Multiplexer`] and [`listener::QuicListener`],
//!   fanning one endpoint's inbound connections out by negotiated ALPN.
//! - [`manager`] — [`manager::ConnectionManager`], the public façade tying
//!   all of the above together.

pub mod addr;
pub mod config;
pub mod error;
pub mod listener;
pub mod manager;
pub mod pool;
pub mod rate_limit;
pub mod socket;
pub mod source_ip;
pub mod transport;

pub use config::Config;
pub use error::{Error, Result};
pub use listener::QuicListener;
pub use manager::{ConnectionManager, SharedPacketConn};
pub use transport::Association;
