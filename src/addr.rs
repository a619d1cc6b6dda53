// Copyright © 2019-2026 The Radicle Foundation <hello@radicle.foundation>
//
// This file is part of quic-reuse, distributed under the GPLv3 with Radicle
// Linking Exception. For full terms see the included LICENSE file.

//! Resolution of `/ip4|ip6/.../udp/<port>/quic-v1` multiaddresses into the
//! `(family, SocketAddr)` pairs the rest of the crate operates on.
//!
//! ALPNs are not part of the multiaddr grammar here: they are passed
//! alongside the address by the listen caller, mirroring how quinn
//! negotiates them out of band from addressing.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use multiaddr::{Multiaddr, Protocol};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub fn of(addr: &SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(_) => Family::V4,
            SocketAddr::V6(_) => Family::V6,
        }
    }

    pub fn wildcard(self) -> IpAddr {
        match self {
            Family::V4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            Family::V6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        }
    }

    pub fn unspecified_addr(self, port: u16) -> SocketAddr {
        SocketAddr::new(self.wildcard(), port)
    }
}

/// The only QUIC version this subsystem implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuicVersion {
    V1,
}

/// Resolve a listen multiaddress of the form `/ip{4,6}/<ip>/udp/<port>/quic-v1`.
///
/// `port` may be `0` (ephemeral). Trailing protocol components beyond the
/// three above are rejected, as the caller is expected to pass ALPNs
/// separately.
pub fn resolve_listen(ma: &Multiaddr) -> Result<(Family, SocketAddr)> {
    let (addr, version) = parse(ma)?;
    match version {
        QuicVersion::V1 => Ok((Family::of(&addr), addr)),
    }
}

/// Resolve a dial multiaddress, additionally validating the QUIC version.
pub fn resolve_dial(ma: &Multiaddr) -> Result<(Family, SocketAddr, QuicVersion)> {
    let (addr, version) = parse(ma)?;
    Ok((Family::of(&addr), addr, version))
}

fn parse(ma: &Multiaddr) -> Result<(SocketAddr, QuicVersion)> {
    let mut iter = ma.iter();

    let ip = match iter.next() {
        Some(Protocol::Ip4(ip)) => IpAddr::V4(ip),
        Some(Protocol::Ip6(ip)) => IpAddr::V6(ip),
        _ => return Err(Error::InvalidMultiaddr(ma.to_string())),
    };
    let port = match iter.next() {
        Some(Protocol::Udp(port)) => port,
        _ => return Err(Error::InvalidMultiaddr(ma.to_string())),
    };
    let version = match iter.next() {
        Some(Protocol::QuicV1) => QuicVersion::V1,
        Some(Protocol::Quic) => return Err(Error::UnknownVersion),
        _ => return Err(Error::InvalidMultiaddr(ma.to_string())),
    };

    if iter.next().is_some() {
        return Err(Error::InvalidMultiaddr(ma.to_string()));
    }

    Ok((SocketAddr::new(ip, port), version))
}
