// Copyright © 2019-2026 The Radicle Foundation <hello@radicle.foundation>
//
// This file is part of quic-reuse, distributed under the GPLv3 with Radicle
// Linking Exception. For full terms see the included LICENSE file.

use std::sync::Arc;

use quic_reuse::{error::Error, Config, ConnectionManager};

fn alpn(s: &str) -> Vec<u8> {
    s.as_bytes().to_vec()
}

fn self_signed_server_config() -> quinn::ServerConfig {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
    let cert_der = cert.cert.der().clone();
    let key_der = cert.key_pair.serialize_der();
    let key = rustls::pki_types::PrivateKeyDer::Pkcs8(key_der.into());
    let server_crypto = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key)
        .unwrap();
    let quic_crypto = quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto).unwrap();
    quinn::ServerConfig::with_crypto(Arc::new(quic_crypto))
}

#[tokio::test]
async fn sharing_an_absent_listener_fails() {
    let manager = Arc::new(ConnectionManager::new(Config::default()));
    let err = manager
        .shared_non_quic_packet_conn("127.0.0.1:59999".parse().unwrap())
        .unwrap_err();
    assert!(matches!(err, Error::NotShareable));
}

#[tokio::test]
async fn sharing_a_live_listener_yields_a_packet_conn() {
    let manager = Arc::new(ConnectionManager::new(Config::default()));
    let listener = manager
        .listen_quic_and_associate(
            None,
            &"/ip4/127.0.0.1/udp/0/quic-v1".parse().unwrap(),
            self_signed_server_config(),
            vec![alpn("test/1")],
        )
        .unwrap();
    let addr = listener.local_addr().unwrap();

    let mut shared = manager.shared_non_quic_packet_conn(addr).unwrap();
    assert_eq!(shared.local_addr(), addr);

    // A second share attempt must fail: only one non-QUIC sharer at a time.
    let err = manager.shared_non_quic_packet_conn(addr).unwrap_err();
    assert!(matches!(err, Error::NotShareable));

    shared.close();
    assert!(shared.recv_from().await.is_none());
}

#[tokio::test]
async fn closing_the_shared_conn_releases_its_transport_reference() {
    let manager = Arc::new(ConnectionManager::new(Config::default()));
    let listener = manager
        .listen_quic_and_associate(
            None,
            &"/ip4/127.0.0.1/udp/0/quic-v1".parse().unwrap(),
            self_signed_server_config(),
            vec![alpn("test/1")],
        )
        .unwrap();
    let addr = listener.local_addr().unwrap();

    let shared = manager.shared_non_quic_packet_conn(addr).unwrap();
    shared.close();
    drop(shared);
    listener.close();

    // If the share's reference had leaked, the transport would never have
    // been evicted from the pool and this would fail with `AddressInUse`.
    let maddr: multiaddr::Multiaddr = format!("/ip4/127.0.0.1/udp/{}/quic-v1", addr.port()).parse().unwrap();
    let reopened = manager
        .listen_quic_and_associate(None, &maddr, self_signed_server_config(), vec![alpn("test/1")])
        .unwrap();
    assert_eq!(reopened.local_addr().unwrap(), addr);
}
