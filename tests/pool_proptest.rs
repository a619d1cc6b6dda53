// Copyright © 2019-2026 The Radicle Foundation <hello@radicle.foundation>
//
// This file is part of quic-reuse, distributed under the GPLv3 with Radicle
// Linking Exception. For full terms see the included LICENSE file.

//! Property-based checks that a single [`ReusePool`] never lets its
//! refcounts or bookkeeping drift, no matter what order listen/dial/release
//! calls arrive in.

use std::{
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    sync::Arc,
};

use proptest::prelude::*;
use quic_reuse::{error::Error, Association};

// `ReusePool` itself is a private collaborator of `ConnectionManager`, so
// these properties are checked the way an external caller would observe
// them: through repeated `listen_quic_and_associate` calls.
use quic_reuse::{Config, ConnectionManager};

fn alpn(tag: u32) -> Vec<u8> {
    format!("test/{tag}").into_bytes()
}

fn self_signed_server_config(alpns: &[Vec<u8>]) -> quinn::ServerConfig {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
    let cert_der = cert.cert.der().clone();
    let key_der = cert.key_pair.serialize_der();
    let key = rustls::pki_types::PrivateKeyDer::Pkcs8(key_der.into());
    let mut server_crypto = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key)
        .unwrap();
    server_crypto.alpn_protocols = alpns.to_vec();
    let quic_crypto = quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto).unwrap();
    quinn::ServerConfig::with_crypto(Arc::new(quic_crypto))
}

fn loopback(port: u16) -> multiaddr::Multiaddr {
    format!("/ip4/127.0.0.1/udp/{port}/quic-v1").parse().unwrap()
}

/// A listen followed immediately by a second listen on the *same* resolved
/// address (an ephemeral port discovered from the first call) must always
/// reuse the same transport and never error, regardless of how many
/// distinct association tags or ALPNs are interleaved across the calls.
///
/// This checks that a given bound address maps to at most one live
/// transport per pool, against randomized interleavings of association
/// tags.
fn run_repeated_listen_reuse(associations: Vec<Option<u64>>, alpn_tags: Vec<u32>) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async move {
        let manager = Arc::new(ConnectionManager::new(Config::default()));
        let mut bound_addr: Option<SocketAddr> = None;
        let mut listeners = Vec::new();

        for (assoc, tag) in associations.into_iter().zip(alpn_tags.into_iter()) {
            let target = match bound_addr {
                Some(addr) => loopback(addr.port()),
                None => loopback(0),
            };
            let association = assoc.map(|seed| Association::of(&seed));
            let listener = manager
                .listen_quic_and_associate(
                    association,
                    &target,
                    self_signed_server_config(&[alpn(tag)]),
                    vec![alpn(tag)],
                )
                .unwrap();
            let addr = listener.local_addr().unwrap();
            if let Some(prev) = bound_addr {
                prop_assert_eq!(prev, addr);
            }
            bound_addr = Some(addr);
            listeners.push(listener);
        }
        Ok::<_, TestCaseError>(())
    })
    .unwrap();
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn repeated_listen_on_same_address_always_reuses_one_transport(
        associations in prop::collection::vec(proptest::option::of(0u64..8), 1..6),
        alpn_tags in prop::collection::vec(0u32..10_000, 1..6),
    ) {
        let len = associations.len().min(alpn_tags.len()).max(1);
        // Re-tag alpns uniquely per step so ALPN-conflict logic never
        // rejects a re-listen for an unrelated reason.
        let tags: Vec<u32> = (0..len as u32).collect();
        run_repeated_listen_reuse(associations.into_iter().take(len).collect(), tags);
    }

    /// Releasing every listener that shares a transport must always bring
    /// its pool bookkeeping back to a state where the address can be
    /// listened on again from scratch (no stuck refcount, no leaked
    /// entry): a transport's count must reach zero only when nothing
    /// references it, and must then be promptly evicted.
    #[test]
    fn dropping_all_listeners_frees_the_address_for_reuse(n in 1usize..5) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async move {
            let manager = Arc::new(ConnectionManager::new(Config::default()));

            let first = manager
                .listen_quic_and_associate(None, &loopback(0), self_signed_server_config(&[alpn(0)]), vec![alpn(0)])
                .unwrap();
            let port = first.local_addr().unwrap().port();
            let mut listeners = vec![first];

            for i in 1..n {
                let listener = manager
                    .listen_quic_and_associate(
                        None,
                        &loopback(port),
                        self_signed_server_config(&[alpn(i as u32)]),
                        vec![alpn(i as u32)],
                    )
                    .unwrap();
                listeners.push(listener);
            }

            for listener in &listeners {
                listener.close();
            }

            // Give the idempotent close callbacks a chance to run; close()
            // itself is synchronous so this is just for clarity of intent.
            let reopened = manager
                .listen_quic_and_associate(None, &loopback(port), self_signed_server_config(&[alpn(999)]), vec![alpn(999)])
                .unwrap();
            prop_assert_eq!(reopened.local_addr().unwrap().port(), port);
            Ok::<_, TestCaseError>(())
        }).unwrap();
    }

    /// A second listen that reuses an address but supplies an ALPN already
    /// claimed by a live listener must fail with `ListenerConflict` and
    /// must not perturb the refcount of the shared transport.
    #[test]
    fn conflicting_alpn_on_shared_transport_is_rejected(tag in 0u32..10_000) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async move {
            let manager = Arc::new(ConnectionManager::new(Config::default()));
            let first = manager
                .listen_quic_and_associate(None, &loopback(0), self_signed_server_config(&[alpn(tag)]), vec![alpn(tag)])
                .unwrap();
            let port = first.local_addr().unwrap().port();

            let err = manager
                .listen_quic_and_associate(
                    None,
                    &loopback(port),
                    self_signed_server_config(&[alpn(tag)]),
                    vec![alpn(tag)],
                )
                .unwrap_err();
            prop_assert!(matches!(err, Error::ListenerConflict));
            Ok::<_, TestCaseError>(())
        }).unwrap();
    }
}
