// Copyright © 2019-2026 The Radicle Foundation <hello@radicle.foundation>
//
// This file is part of quic-reuse, distributed under the GPLv3 with Radicle
// Linking Exception. For full terms see the included LICENSE file.

//! Fans one QUIC endpoint out to several logical listeners, routed by the
//! ALPN the inbound connection negotiated.

use std::{
    collections::HashMap,
    sync::{atomic::{AtomicBool, Ordering}, Arc},
};

use parking_lot::Mutex;
use tokio::sync::{mpsc, Mutex as AsyncMutex};

use crate::error::{Error, Result};

/// One accepted connection, handed to whichever logical listener's ALPN
/// set it matched.
type Routed = quinn::Connection;

struct MultiplexerState {
    routes: HashMap<Vec<u8>, mpsc::UnboundedSender<Routed>>,
}

/// Owns the accept loop for one endpoint and dispatches each inbound
/// connection to the logical listener whose ALPN set it negotiated.
pub struct Multiplexer {
    endpoint: quinn::Endpoint,
    state: Arc<Mutex<MultiplexerState>>,
    accept_task: tokio::task::JoinHandle<()>,
}

impl Multiplexer {
    pub fn new(endpoint: quinn::Endpoint) -> Arc<Self> {
        let state = Arc::new(Mutex::new(MultiplexerState {
            routes: HashMap::new(),
        }));
        let accept_task = tokio::spawn(accept_loop(endpoint.clone(), Arc::clone(&state)));
        Arc::new(Self {
            endpoint,
            state,
            accept_task,
        })
    }

    /// Register a logical listener for `alpns`. Fails if any of them is
    /// already claimed by another logical listener on this endpoint.
    ///
    /// `on_close` runs exactly once, the first time the returned listener
    /// is closed (explicitly or via `Drop`); the connection manager uses it
    /// to decrement the owning `ListenerEntry`'s refcount.
    pub fn add_listener(
        self: &Arc<Self>,
        alpns: &[Vec<u8>],
        on_close: impl FnOnce() + Send + 'static,
    ) -> Result<QuicListener> {
        let mut state = self.state.lock();
        if alpns.iter().any(|a| state.routes.contains_key(a)) {
            return Err(Error::ListenerConflict);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        for alpn in alpns {
            state.routes.insert(alpn.clone(), tx.clone());
        }
        drop(state);

        Ok(QuicListener {
            multiplexer: Arc::clone(self),
            alpns: alpns.to_vec(),
            incoming: AsyncMutex::new(rx),
            on_close: Mutex::new(Some(Box::new(on_close))),
            closed: AtomicBool::new(false),
        })
    }

    fn remove_alpns(&self, alpns: &[Vec<u8>]) {
        let mut state = self.state.lock();
        for alpn in alpns {
            state.routes.remove(alpn);
        }
    }

    pub fn is_idle(&self) -> bool {
        self.state.lock().routes.is_empty()
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.endpoint.local_addr()
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn accept_loop(endpoint: quinn::Endpoint, state: Arc<Mutex<MultiplexerState>>) {
    loop {
        let incoming = match endpoint.accept().await {
            Some(incoming) => incoming,
            None => {
                tracing::debug!("endpoint closed, stopping accept loop");
                return;
            }
        };

        let state = Arc::clone(&state);
        tokio::spawn(async move {
            let conn = match incoming.await {
                Ok(conn) => conn,
                Err(err) => {
                    tracing::debug!(?err, "inbound handshake failed");
                    return;
                }
            };

            let alpn = match conn.handshake_data() {
                Some(data) => data
                    .downcast_ref::<quinn::crypto::rustls::HandshakeData>()
                    .and_then(|d| d.protocol.clone()),
                None => None,
            };

            let route = alpn.and_then(|alpn| state.lock().routes.get(&alpn).cloned());
            match route {
                Some(tx) => {
                    if tx.send(conn).is_err() {
                        tracing::debug!("logical listener dropped before connection could be delivered");
                    }
                }
                None => {
                    tracing::warn!("inbound connection matched no registered ALPN, dropping");
                    conn.close(0u32.into(), b"no matching listener");
                }
            }
        });
    }
}

/// The object returned to listen callers. Delivers connections that
/// negotiated one of this listener's ALPNs; dropping or closing it
/// unregisters those ALPNs from the shared multiplexer.
pub struct QuicListener {
    multiplexer: Arc<Multiplexer>,
    alpns: Vec<Vec<u8>>,
    incoming: AsyncMutex<mpsc::UnboundedReceiver<Routed>>,
    on_close: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    closed: AtomicBool,
}

impl QuicListener {
    pub async fn accept(&self) -> Option<quinn::Connection> {
        self.incoming.lock().await.recv().await
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.multiplexer.local_addr()
    }

    /// Idempotent: a second close is a no-op.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.multiplexer.remove_alpns(&self.alpns);
        if let Some(on_close) = self.on_close.lock().take() {
            on_close();
        }
    }
}

impl Drop for QuicListener {
    fn drop(&mut self) {
        self.close();
    }
}
