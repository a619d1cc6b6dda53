// Copyright © 2019-2026 The Radicle Foundation <hello@radicle.foundation>
//
// This file is part of quic-reuse, distributed under the GPLv3 with Radicle
// Linking Exception. For full terms see the included LICENSE file.

//! Drives a full [`quic_reuse::ConnectionManager`] over real loopback UDP
//! sockets, exercising the listen/dial reuse scenarios the pool's
//! selection policy is supposed to guarantee.

use std::{sync::Arc, time::Duration};

use quic_reuse::{error::Error, Association, Config, ConnectionManager};

fn alpn(s: &str) -> Vec<u8> {
    s.as_bytes().to_vec()
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

fn insecure_client_config() -> quinn::ClientConfig {
    let mut client_crypto = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerify))
        .with_no_client_auth();
    client_crypto.alpn_protocols = vec![alpn("test/1")];
    let quic_crypto = quinn::crypto::rustls::QuicClientConfig::try_from(client_crypto).unwrap();
    quinn::ClientConfig::new(Arc::new(quic_crypto))
}

#[derive(Debug)]
struct NoVerify;

impl rustls::client::danger::ServerCertVerifier for NoVerify {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider().signature_verification_algorithms.supported_schemes()
    }
}

fn loopback_maddr(port: u16) -> multiaddr::Multiaddr {
    format!("/ip4/127.0.0.1/udp/{port}/quic-v1").parse().unwrap()
}

#[tokio::test]
async fn listen_share_listen_reuses_one_socket() {
    let manager = Arc::new(ConnectionManager::new(Config::default()));

    let a = manager
        .listen_quic_and_associate(None, &loopback_maddr(0), self_signed_server_config(&[alpn("a")]), vec![alpn("a")])
        .unwrap();
    let port = a.local_addr().unwrap().port();

    let b = manager
        .listen_quic_and_associate(
            None,
            &loopback_maddr(port),
            self_signed_server_config(&[alpn("b")]),
            vec![alpn("b")],
        )
        .unwrap();

    assert_eq!(a.local_addr().unwrap(), b.local_addr().unwrap());
}

#[tokio::test]
async fn listen_then_dial_reuses_listening_transport() {
    let manager = Arc::new(ConnectionManager::new(Config::default()));

    let listener = manager
        .listen_quic_and_associate(
            None,
            &loopback_maddr(0),
            self_signed_server_config(&[alpn("test/1")]),
            vec![alpn("test/1")],
        )
        .unwrap();
    let listen_addr = listener.local_addr().unwrap();

    let accept_task = tokio::spawn(async move {
        let conn = listener.accept().await;
        assert!(conn.is_some());
    });

    let _conn = manager
        .dial_quic(&loopback_maddr(listen_addr.port()), insecure_client_config(), None)
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), accept_task).await.unwrap().unwrap();
}

#[tokio::test]
async fn conflicting_listen_on_same_port_fails() {
    let manager = Arc::new(ConnectionManager::new(Config::default()));

    let first = manager
        .listen_quic_and_associate(
            None,
            &"/ip4/0.0.0.0/udp/0/quic-v1".parse().unwrap(),
            self_signed_server_config(&[alpn("a")]),
            vec![alpn("a")],
        )
        .unwrap();
    let port = first.local_addr().unwrap().port();

    let err = manager
        .listen_quic_and_associate(
            None,
            &loopback_maddr(port),
            self_signed_server_config(&[alpn("b")]),
            vec![alpn("b")],
        )
        .unwrap_err();

    assert!(matches!(err, Error::AddressInUse(_)));
}

#[tokio::test]
async fn unknown_quic_version_is_rejected_before_binding() {
    let manager = Arc::new(ConnectionManager::new(Config::default()));
    let ma: multiaddr::Multiaddr = "/ip4/1.2.3.4/udp/9000/quic".parse().unwrap();

    let err = manager.dial_quic(&ma, insecure_client_config(), None).await.unwrap_err();
    assert!(matches!(err, Error::UnknownVersion));
}

#[tokio::test]
async fn association_tag_is_visible_across_listen_calls() {
    let manager = Arc::new(ConnectionManager::new(Config::default()));
    let assoc_y = Association::of(&"peer-y");

    let listener_y = manager
        .listen_quic_and_associate(
            Some(assoc_y),
            &loopback_maddr(0),
            self_signed_server_config(&[alpn("y")]),
            vec![alpn("y")],
        )
        .unwrap();
    let y_port = listener_y.local_addr().unwrap().port();

    // Re-entering listen on the same bound address with the same
    // association must not error, and must not open a second socket.
    let second = manager
        .listen_quic_and_associate(
            Some(assoc_y),
            &loopback_maddr(y_port),
            self_signed_server_config(&[alpn("z")]),
            vec![alpn("z")],
        )
        .unwrap();
    assert_eq!(second.local_addr().unwrap().port(), y_port);
}
