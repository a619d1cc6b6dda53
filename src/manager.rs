// Copyright © 2019-2026 The Radicle Foundation <hello@radicle.foundation>
//
// This file is part of quic-reuse, distributed under the GPLv3 with Radicle
// Linking Exception. For full terms see the included LICENSE file.

//! Top-level façade: owns both reuse pools, the listener table, and the
//! QUIC endpoint templates, and enforces the source-address verification
//! rate limit ahead of inbound handshakes.

use std::{
    collections::HashMap,
    io,
    net::SocketAddr,
    sync::{atomic::{AtomicBool, Ordering}, Arc},
};

use bytes::Bytes;
use multiaddr::Multiaddr;
use parking_lot::Mutex as SyncMutex;
use quinn::AsyncUdpSocket as _;
use tokio::sync::oneshot;

use crate::{
    addr::{self, Family},
    config::Config,
    error::{Error, Result},
    listener::{Multiplexer, QuicListener},
    pool::ReusePool,
    rate_limit::SourceAddressVerifier,
    socket::{DemuxSocket, NonQuicPacketConn},
    transport::{Association, RefcountedTransport},
};

struct ListenerEntry {
    transport: Arc<RefcountedTransport>,
    multiplexer: Arc<Multiplexer>,
    ref_count: usize,
}

/// Process-wide coordinator sharing UDP sockets across listeners, dialers,
/// and non-QUIC consumers.
pub struct ConnectionManager {
    config: Config,
    pool_v4: Option<ReusePool>,
    pool_v6: Option<ReusePool>,
    listeners: SyncMutex<HashMap<SocketAddr, ListenerEntry>>,
    endpoint_config: quinn::EndpointConfig,
    verifier: SourceAddressVerifier,
    closed: AtomicBool,
}

impl ConnectionManager {
    pub fn new(config: Config) -> Self {
        // `EndpointConfig::default()` mints a fresh random stateless-reset
        // key internally; that key lives for the lifetime of this config,
        // satisfying the "process-long secret, immutable after
        // construction" requirement without us handling key material.
        let endpoint_config = quinn::EndpointConfig::default();

        let verifier = SourceAddressVerifier::new(
            config.verify_source_address.clone(),
            config.source_address_rate_limit,
        );

        let (pool_v4, pool_v6) = if config.disable_reuseport {
            (None, None)
        } else {
            let cap = config.max_transports_per_family;
            (Some(ReusePool::new(Family::V4, cap)), Some(ReusePool::new(Family::V6, cap)))
        };

        Self {
            config,
            pool_v4,
            pool_v6,
            listeners: SyncMutex::new(HashMap::new()),
            endpoint_config,
            verifier,
            closed: AtomicBool::new(false),
        }
    }

    fn pool_for(&self, family: Family) -> Option<&ReusePool> {
        match family {
            Family::V4 => self.pool_v4.as_ref(),
            Family::V6 => self.pool_v6.as_ref(),
        }
    }

    /// Returns `true` if verification must be required for an inbound
    /// attempt from `addr`, composing the caller's hook with the built-in
    /// token bucket.
    pub fn requires_source_verification(&self, addr: SocketAddr) -> bool {
        self.verifier.requires_verification(addr.ip())
    }

    #[tracing::instrument(level = "debug", skip(self, server_config))]
    fn bind_owned(
        &self,
        addr: SocketAddr,
        family: Family,
        server_config: Option<quinn::ServerConfig>,
    ) -> Result<Arc<RefcountedTransport>> {
        let std_socket = self.config.socket_binder.bind(addr)?;
        let (demux, non_quic) = DemuxSocket::new(std_socket, 256).map_err(Error::BindFailure)?;
        let bound_addr = demux.local_addr().map_err(Error::BindFailure)?;

        let runtime = quinn::default_runtime().expect("a tokio runtime must be active");
        let endpoint = quinn::Endpoint::new_with_abstract_socket(
            self.endpoint_config.clone(),
            server_config,
            demux,
            runtime,
        )
        .map_err(Error::Io)?;

        let (transport, _done) = RefcountedTransport::new(bound_addr, family, false, endpoint, Some(non_quic));
        Ok(Arc::new(transport))
    }

    /// Resolves `local_maddr`, reuses an existing
    /// transport at that bound address if one exists (tagging it with
    /// `association` for future dial reuse), or creates one, and attaches a
    /// new logical listener for `alpns`.
    #[tracing::instrument(level = "debug", skip(self, server_config))]
    pub fn listen_quic_and_associate(
        self: &Arc<Self>,
        association: Option<Association>,
        local_maddr: &Multiaddr,
        server_config: quinn::ServerConfig,
        alpns: Vec<Vec<u8>>,
    ) -> Result<QuicListener> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::PoolClosed);
        }
        let (family, local_addr) = addr::resolve_listen(local_maddr)?;

        let mut listeners = self.listeners.lock();
        if let Some(entry) = listeners.get_mut(&local_addr) {
            if let Some(assoc) = association {
                if let Some(pool) = self.pool_for(family) {
                    pool.assert_transport_exists(&entry.transport)?;
                }
                entry.transport.associate(assoc);
            }
            let manager = Arc::clone(self);
            let listener = entry
                .multiplexer
                .add_listener(&alpns, move || manager.on_listener_closed(local_addr, family))?;
            entry.ref_count += 1;
            return Ok(listener);
        }

        let transport = match self.pool_for(family) {
            Some(pool) => pool.transport_for_listen(local_addr, |addr| {
                self.bind_owned(addr, family, Some(server_config.clone()))
            })?,
            None => self.bind_owned(local_addr, family, Some(server_config))?,
        };
        if let Some(assoc) = association {
            transport.associate(assoc);
        }

        let multiplexer = Multiplexer::new(transport.endpoint.clone());
        let bound_addr = transport.local_addr;
        let manager = Arc::clone(self);
        let listener = multiplexer.add_listener(&alpns, move || manager.on_listener_closed(bound_addr, family))?;
        listeners.insert(
            bound_addr,
            ListenerEntry {
                transport,
                multiplexer,
                ref_count: 1,
            },
        );

        Ok(listener)
    }

    /// Called by a logical listener's close path: decrements the
    /// `ListenerEntry` refcount and, on last close, tears the multiplexer
    /// down and releases the underlying transport.
    pub fn on_listener_closed(&self, local_addr: SocketAddr, family: Family) {
        let mut listeners = self.listeners.lock();
        let Some(entry) = listeners.get_mut(&local_addr) else {
            return;
        };
        entry.ref_count = entry.ref_count.saturating_sub(1);
        if entry.ref_count == 0 && entry.multiplexer.is_idle() {
            let entry = listeners.remove(&local_addr).expect("just looked up");
            match self.pool_for(family) {
                Some(pool) => pool.release(&entry.transport),
                None => {
                    entry.transport.decrement_count();
                }
            }
        }
    }

    /// Resolves `remote_maddr`, validates the QUIC version,
    /// selects a transport per the reuse policy, and dials through it.
    #[tracing::instrument(level = "debug", skip(self, client_config))]
    pub async fn dial_quic(
        &self,
        remote_maddr: &Multiaddr,
        client_config: quinn::ClientConfig,
        association: Option<Association>,
    ) -> Result<quinn::Connection> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::PoolClosed);
        }
        let (family, remote_addr, _version) = addr::resolve_dial(remote_maddr)?;

        let preferred_ip = self
            .config
            .source_ip_selector
            .prefer(remote_addr.ip(), &self.candidate_source_ips(family));

        let transport = match self.pool_for(family) {
            Some(pool) => pool.transport_for_dial(association, preferred_ip, |addr| {
                self.bind_owned(addr, family, None)
            })?,
            None => self.bind_owned(family.unspecified_addr(0), family, None)?,
        };

        let server_name = remote_addr.ip().to_string();
        let connecting = transport
            .endpoint
            .connect_with(client_config, remote_addr, &server_name);

        let connecting = match connecting {
            Ok(connecting) => connecting,
            Err(err) => {
                self.release_dial_transport(family, &transport);
                return Err(Error::from(err));
            }
        };

        match connecting.await {
            Ok(conn) => Ok(conn),
            Err(err) => {
                self.release_dial_transport(family, &transport);
                Err(Error::from(err))
            }
        }
    }

    fn release_dial_transport(&self, family: Family, transport: &Arc<RefcountedTransport>) {
        match self.pool_for(family) {
            Some(pool) => pool.release(transport),
            None => {
                transport.decrement_count();
            }
        }
    }

    fn candidate_source_ips(&self, family: Family) -> Vec<std::net::IpAddr> {
        let listeners = self.listeners.lock();
        listeners
            .keys()
            .filter(|addr| Family::of(addr) == family)
            .map(|addr| addr.ip())
            .collect()
    }

    /// Wraps an externally owned endpoint as borrowed, registers it in the
    /// family pool, and pre-creates its listener entry so that the listen
    /// call the lender is expected to make next attaches to this exact
    /// reference instead of asking the pool for one: the pool's exact-match
    /// branch always increments, and the transport's initial count of 1
    /// already accounts for that one eventual listener (§4.4's
    /// `addBorrowedTransport` contract). Returns the done-signal that fires
    /// when the last local user releases it.
    ///
    /// Acquires the listener-table lock before the pool lock, matching the
    /// ordering `listen_quic_and_associate` uses, to avoid a lock-order
    /// inversion between the two call paths.
    pub fn lend_transport(
        &self,
        family: Family,
        external_endpoint: quinn::Endpoint,
        local_addr: SocketAddr,
    ) -> Result<oneshot::Receiver<()>> {
        let pool = self.pool_for(family).ok_or(Error::InvalidFamily)?;

        let mut listeners = self.listeners.lock();
        if listeners.contains_key(&local_addr) {
            return Err(Error::AddressInUse(local_addr));
        }

        let (transport, done_rx) = RefcountedTransport::new(local_addr, family, true, external_endpoint, None);
        let transport = Arc::new(transport);
        pool.add_borrowed_transport(Arc::clone(&transport))?;

        let multiplexer = Multiplexer::new(transport.endpoint.clone());
        listeners.insert(
            local_addr,
            ListenerEntry {
                transport,
                multiplexer,
                ref_count: 0,
            },
        );

        Ok(done_rx.expect("borrowed transports always get a done signal"))
    }

    /// Attaches a secondary, non-QUIC consumer
    /// to the transport already backing a listener at `local_addr`.
    pub fn shared_non_quic_packet_conn(self: &Arc<Self>, local_addr: SocketAddr) -> Result<SharedPacketConn> {
        let listeners = self.listeners.lock();
        let entry = listeners.get(&local_addr).ok_or(Error::NotShareable)?;
        if entry.transport.borrowed {
            return Err(Error::NotShareable);
        }
        entry.transport.try_increment().map_err(|_| Error::NotShareable)?;
        let transport = Arc::clone(&entry.transport);
        drop(listeners);

        match transport.take_non_quic() {
            Ok(conn) => Ok(SharedPacketConn {
                conn,
                transport,
                family: Family::of(&local_addr),
                manager: Arc::clone(self),
                closed: AtomicBool::new(false),
            }),
            Err(e) => {
                self.release_dial_transport(Family::of(&local_addr), &transport);
                Err(e)
            }
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        if let Some(pool) = &self.pool_v4 {
            pool.close();
        }
        if let Some(pool) = &self.pool_v6 {
            pool.close();
        }
    }
}

/// A non-QUIC packet socket sharing its underlying transport with a live
/// QUIC listener. Reads come from the datagrams the demultiplexer decided
/// were not QUIC; writes go straight through the shared socket. Closing it
/// (explicitly or via `Drop`) releases the transport reference taken when
/// it was handed out, the same way a dropped dialer or a closed listener
/// would.
pub struct SharedPacketConn {
    conn: NonQuicPacketConn,
    transport: Arc<RefcountedTransport>,
    family: Family,
    manager: Arc<ConnectionManager>,
    closed: AtomicBool,
}

impl SharedPacketConn {
    pub async fn recv_from(&mut self) -> Option<(Bytes, SocketAddr)> {
        self.conn.recv_from().await
    }

    pub async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        self.conn.send_to(buf, target).await
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.conn.local_addr()
    }

    /// Idempotent: a second close is a no-op.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.conn.close();
        self.manager.release_dial_transport(self.family, &self.transport);
    }
}

impl Drop for SharedPacketConn {
    fn drop(&mut self) {
        self.close();
    }
}
