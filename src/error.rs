// Copyright © 2019-2026 The Radicle Foundation <hello@radicle.foundation>
//
// This file is part of quic-reuse, distributed under the GPLv3 with Radicle
// Linking Exception. For full terms see the included LICENSE file.

use std::{io, net::SocketAddr};

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Transport selection was attempted for a family the pool set does
    /// not know about.
    #[error("unknown network family")]
    InvalidFamily,

    /// A second listener tried to claim a port already bound to a different
    /// local IP.
    #[error("address {0} is already in use by another transport on this port")]
    AddressInUse(SocketAddr),

    #[error("failed to bind socket")]
    BindFailure(#[source] io::Error),

    /// The remote multiaddress names a QUIC version we do not speak.
    #[error("unsupported quic version")]
    UnknownVersion,

    /// An operation was attempted on a transport whose refcount has already
    /// reached zero.
    #[error("transport closed")]
    TransportClosed,

    #[error("reuse pool is closed")]
    PoolClosed,

    /// The family's reuse pool already holds `Config::max_transports_per_family`
    /// live transports; refuses to bind another rather than growing unbounded.
    #[error("reuse pool has reached its configured transport limit")]
    TooManyTransports,

    /// Two logical listeners on the same bound address declared overlapping
    /// ALPNs.
    #[error("listener conflict: overlapping ALPN on the same bound address")]
    ListenerConflict,

    /// A non-QUIC share was requested against an address with no refcounted
    /// listener transport (absent, or reuseport disabled).
    #[error("address is not shareable with a non-QUIC consumer")]
    NotShareable,

    /// A transport that a caller expected to still be registered has already
    /// been released; this is the listen/release race the pool defends
    /// against.
    #[error("transport is no longer registered in its reuse pool")]
    ReuseAssertionFailed,

    #[error("invalid multiaddr: {0}")]
    InvalidMultiaddr(String),

    #[error(transparent)]
    Connect(#[from] quinn::ConnectError),

    #[error(transparent)]
    Connection(#[from] quinn::ConnectionError),

    #[error(transparent)]
    Io(#[from] io::Error),
}
