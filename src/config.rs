// Copyright © 2019-2026 The Radicle Foundation <hello@radicle.foundation>
//
// This file is part of quic-reuse, distributed under the GPLv3 with Radicle
// Linking Exception. For full terms see the included LICENSE file.

//! Injectable collaborators and defaults for the reuse manager.
//!
//! Mirrors the plain-fields-plus-`Default`-impl shape the rest of this
//! codebase uses for its config structs: simple values are public fields,
//! pluggable behaviour is an `Arc<dyn Trait>` with a concrete default.

use std::{
    any::Any,
    net::{IpAddr, SocketAddr},
    sync::Arc,
};

use governor::Quota;
use nonzero_ext::nonzero;

use crate::error::Result;

/// Binds a UDP socket for a given local address, handing back the raw
/// `std::net::UdpSocket` the rest of the pipeline wraps.
///
/// The default implementation lives in [`crate::socket::DefaultBinder`] and
/// uses `socket2` so it can set `SO_REUSEADDR` ahead of the bind.
pub trait SocketBinder: Send + Sync {
    fn bind(&self, addr: SocketAddr) -> Result<std::net::UdpSocket>;
}

/// Picks which local source IP a dial should prefer, given the destination
/// and the set of addresses already bound by reuse-pool transports.
///
/// The default implementation lives in [`crate::source_ip::DefaultSelector`].
pub trait SourceIpSelector: Send + Sync {
    fn prefer(&self, dest: IpAddr, candidates: &[IpAddr]) -> Option<IpAddr>;
}

/// Caller hook deciding whether an inbound connection attempt from `addr`
/// must present verification before it is allowed to proceed. Returns
/// `true` to require verification, `false` to let it through unchallenged.
///
/// Composed with a built-in token bucket by
/// [`crate::rate_limit::SourceAddressVerifier`]: the hook is only
/// consulted while the bucket has tokens; once exhausted every arrival is
/// required to verify regardless of what the hook would have said.
pub trait VerifySourceAddress: Send + Sync {
    fn verify(&self, addr: SocketAddr) -> bool;
}

/// Opaque per-connection context value threaded through
/// [`Config::conn_context`]. Carries whatever the caller's factory chooses
/// to stash; this crate never inspects the contents.
#[derive(Clone, Default)]
pub struct ConnContext(pub Option<Arc<dyn Any + Send + Sync>>);

/// Tunables for the reuse manager and the transports it hands out.
///
/// Clone is cheap: the trait-object fields are `Arc`s.
#[derive(Clone)]
pub struct Config {
    /// Disable reuse altogether: every `listen`/`dial` call gets a fresh,
    /// unshared transport bound to a fresh ephemeral port, and no reuse
    /// pool is consulted at all.
    pub disable_reuseport: bool,

    /// Upper bound on how many transports a single reuse pool may hold for
    /// one address family before a listen or dial that would bind another
    /// is refused with `Error::TooManyTransports`. Reuse (attaching to an
    /// existing transport) is never subject to this limit.
    pub max_transports_per_family: usize,

    /// Quota for the built-in source-address-verification token bucket:
    /// default 1000 tokens, refilling at 1000/s.
    pub source_address_rate_limit: Quota,

    pub socket_binder: Arc<dyn SocketBinder>,
    pub source_ip_selector: Arc<dyn SourceIpSelector>,

    /// Caller hook composed with the built-in rate limiter; `None` means
    /// never require verification while tokens remain (the default).
    pub verify_source_address: Option<Arc<dyn VerifySourceAddress>>,

    /// Per-connection context factory; defaults to the identity function.
    pub conn_context: Arc<dyn Fn(ConnContext) -> ConnContext + Send + Sync>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            disable_reuseport: false,
            max_transports_per_family: 256,
            source_address_rate_limit: Quota::per_second(nonzero!(1000u32)).allow_burst(nonzero!(1000u32)),
            socket_binder: Arc::new(crate::socket::DefaultBinder),
            source_ip_selector: Arc::new(crate::source_ip::DefaultSelector),
            verify_source_address: None,
            conn_context: Arc::new(|ctx| ctx),
        }
    }
}
