// Copyright © 2019-2026 The Radicle Foundation <hello@radicle.foundation>
//
// This file is part of quic-reuse, distributed under the GPLv3 with Radicle
// Linking Exception. For full terms see the included LICENSE file.

//! Default source-IP selection for dials against an unspecified-address
//! listener set.

use std::net::{IpAddr, SocketAddr, UdpSocket};

use crate::config::SourceIpSelector;

/// Asks the kernel's routing table which local address it would pick for
/// `dest`, by connecting a throwaway UDP socket (no packets are sent: UDP
/// `connect` only binds the route) and reading the chosen source back.
///
/// Falls back to the first listed candidate if the kernel query fails,
/// rather than refusing the dial outright.
pub struct DefaultSelector;

impl SourceIpSelector for DefaultSelector {
    fn prefer(&self, dest: IpAddr, candidates: &[IpAddr]) -> Option<IpAddr> {
        if candidates.is_empty() {
            return None;
        }
        if candidates.len() == 1 {
            return Some(candidates[0]);
        }

        let routed = route_to(dest).ok();
        match routed {
            Some(ip) if candidates.contains(&ip) => Some(ip),
            _ => Some(candidates[0]),
        }
    }
}

fn route_to(dest: IpAddr) -> std::io::Result<IpAddr> {
    let bind_addr: SocketAddr = match dest {
        IpAddr::V4(_) => "0.0.0.0:0".parse().unwrap(),
        IpAddr::V6(_) => "[::]:0".parse().unwrap(),
    };
    let probe = UdpSocket::bind(bind_addr)?;
    // Port 0 is rejected by `connect`; any valid port works, no traffic is
    // actually sent for an unconnected UDP socket's `connect` call.
    probe.connect(SocketAddr::new(dest, 9))?;
    Ok(probe.local_addr()?.ip())
}
