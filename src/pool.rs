// Copyright © 2019-2026 The Radicle Foundation <hello@radicle.foundation>
//
// This file is part of quic-reuse, distributed under the GPLv3 with Radicle
// Linking Exception. For full terms see the included LICENSE file.

//! Per-family registry of [`RefcountedTransport`]s and the transport
//! selection policy for listen and dial.
//!
//! Two instances exist, one per IP family; they never share state or a
//! lock. All state here is guarded by a single mutex per pool; critical
//! sections only do lookups and count adjustments, with socket binding
//! done outside the lock and rechecked afterwards for races.

use std::{collections::HashMap, net::IpAddr, net::SocketAddr, sync::Arc};

use parking_lot::Mutex;

use crate::{
    addr::Family,
    error::{Error, Result},
    transport::{Association, RefcountedTransport},
};

struct PoolState {
    closed: bool,
    listeners_by_port: HashMap<u16, Vec<Arc<RefcountedTransport>>>,
    global_dialers: Vec<Arc<RefcountedTransport>>,
}

pub struct ReusePool {
    family: Family,
    max_transports: usize,
    state: Mutex<PoolState>,
}

impl ReusePool {
    pub fn new(family: Family, max_transports: usize) -> Self {
        Self {
            family,
            max_transports,
            state: Mutex::new(PoolState {
                closed: false,
                listeners_by_port: HashMap::new(),
                global_dialers: Vec::new(),
            }),
        }
    }

    pub fn family(&self) -> Family {
        self.family
    }

    fn transport_count(state: &PoolState) -> usize {
        state.listeners_by_port.values().map(Vec::len).sum::<usize>() + state.global_dialers.len()
    }

    /// Find or create the transport backing a listen at `local_addr`.
    ///
    /// `bind` is invoked with the actual address to bind (unchanged unless
    /// `local_addr.port() == 0`, in which case it is free to pick any
    /// ephemeral port) only when no existing transport can be reused.
    #[tracing::instrument(level = "debug", skip(self, bind))]
    pub fn transport_for_listen(
        &self,
        local_addr: SocketAddr,
        bind: impl FnOnce(SocketAddr) -> Result<Arc<RefcountedTransport>>,
    ) -> Result<Arc<RefcountedTransport>> {
        {
            let state = self.state.lock();
            if state.closed {
                return Err(Error::PoolClosed);
            }
            if local_addr.port() != 0 {
                if let Some(existing) = Self::find_exact(&state.listeners_by_port, local_addr) {
                    if existing.try_increment().is_ok() {
                        tracing::debug!(addr = %local_addr, "reusing existing listener transport");
                        return Ok(existing);
                    }
                    // Stale: a concurrent release is tearing this entry
                    // down. Fall through as though nothing matched; the
                    // releaser's own eviction will remove it shortly.
                } else if let Some(list) = state.listeners_by_port.get(&local_addr.port()) {
                    if !list.is_empty() {
                        tracing::debug!(addr = %local_addr, "port already claimed by a different local ip");
                        return Err(Error::AddressInUse(local_addr));
                    }
                }
            }
            if Self::transport_count(&state) >= self.max_transports {
                tracing::warn!(family = ?self.family, "reuse pool at capacity, refusing to bind another transport");
                return Err(Error::TooManyTransports);
            }
        }

        let created = bind(local_addr)?;

        let mut state = self.state.lock();
        if state.closed {
            created.decrement_count();
            return Err(Error::PoolClosed);
        }
        let bound_addr = created.local_addr;
        let list = state.listeners_by_port.entry(bound_addr.port()).or_default();
        if let Some(existing) = list.iter().find(|t| t.local_addr == bound_addr) {
            if existing.try_increment().is_ok() {
                // Lost the race to another concurrent bind; drop ours.
                let winner = Arc::clone(existing);
                drop(state);
                created.decrement_count();
                tracing::debug!(addr = %bound_addr, "lost concurrent bind race, reusing winner");
                return Ok(winner);
            }
        }
        list.retain(|t| t.count() > 0);
        list.push(Arc::clone(&created));
        tracing::debug!(addr = %bound_addr, "bound new listener transport");
        Ok(created)
    }

    /// Select a transport for a dial per the four-step priority order:
    /// association match, any listener (by source-ip preference), any
    /// dialer (by source-ip preference), or a fresh ephemeral dialer.
    #[tracing::instrument(level = "debug", skip(self, bind_ephemeral))]
    pub fn transport_for_dial(
        &self,
        association: Option<Association>,
        preferred_ip: Option<IpAddr>,
        bind_ephemeral: impl FnOnce(SocketAddr) -> Result<Arc<RefcountedTransport>>,
    ) -> Result<Arc<RefcountedTransport>> {
        {
            let state = self.state.lock();
            if state.closed {
                return Err(Error::PoolClosed);
            }

            if let Some(assoc) = association {
                for list in state.listeners_by_port.values() {
                    for t in list {
                        if t.has_association(&assoc) && t.try_increment().is_ok() {
                            tracing::debug!("dial reusing transport by association match");
                            return Ok(Arc::clone(t));
                        }
                    }
                }
            }

            if let Some(t) = Self::pick_preferred(state.listeners_by_port.values().flatten(), preferred_ip) {
                tracing::debug!("dial reusing a listener transport");
                return Ok(t);
            }

            if let Some(t) = Self::pick_preferred(state.global_dialers.iter(), preferred_ip) {
                tracing::debug!("dial reusing a prior dialer transport");
                return Ok(t);
            }

            if Self::transport_count(&state) >= self.max_transports {
                tracing::warn!(family = ?self.family, "reuse pool at capacity, refusing to bind another transport");
                return Err(Error::TooManyTransports);
            }
        }

        let addr = self.family.unspecified_addr(0);
        let created = bind_ephemeral(addr)?;

        let mut state = self.state.lock();
        if state.closed {
            created.decrement_count();
            return Err(Error::PoolClosed);
        }
        state.global_dialers.push(Arc::clone(&created));
        tracing::debug!(addr = %created.local_addr, "bound new ephemeral dialer transport");
        Ok(created)
    }

    /// Register an externally bound, borrowed transport as a listener
    /// transport. Fails if something already occupies that exact address.
    pub fn add_borrowed_transport(&self, transport: Arc<RefcountedTransport>) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::PoolClosed);
        }
        let addr = transport.local_addr;
        let list = state.listeners_by_port.entry(addr.port()).or_default();
        if list.iter().any(|t| t.local_addr == addr) {
            return Err(Error::AddressInUse(addr));
        }
        list.push(transport);
        Ok(())
    }

    /// Confirms `transport` is still registered in this pool by identity.
    pub fn assert_transport_exists(&self, transport: &Arc<RefcountedTransport>) -> Result<()> {
        let state = self.state.lock();
        let in_listeners = state
            .listeners_by_port
            .get(&transport.local_addr.port())
            .map(|l| l.iter().any(|t| Arc::ptr_eq(t, transport)))
            .unwrap_or(false);
        let in_dialers = state.global_dialers.iter().any(|t| Arc::ptr_eq(t, transport));
        if in_listeners || in_dialers {
            Ok(())
        } else {
            Err(Error::ReuseAssertionFailed)
        }
    }

    /// Release a reference on `transport`. This is the only correct way to
    /// drop a reference obtained from this pool: it decrements the count
    /// and, only if that brought it to zero, re-acquires the pool lock to
    /// evict the now-dead entry. Never call `transport.decrement_count()`
    /// directly on a transport that came from a pool.
    pub fn release(&self, transport: &Arc<RefcountedTransport>) {
        if !transport.decrement_count() {
            return;
        }
        let mut state = self.state.lock();
        let port = transport.local_addr.port();
        if let Some(list) = state.listeners_by_port.get_mut(&port) {
            list.retain(|t| !Arc::ptr_eq(t, transport));
            if list.is_empty() {
                state.listeners_by_port.remove(&port);
            }
        }
        state.global_dialers.retain(|t| !Arc::ptr_eq(t, transport));
        tracing::debug!(addr = %transport.local_addr, "evicted released transport");
    }

    pub fn close(&self) {
        self.state.lock().closed = true;
    }

    fn find_exact(
        listeners_by_port: &HashMap<u16, Vec<Arc<RefcountedTransport>>>,
        addr: SocketAddr,
    ) -> Option<Arc<RefcountedTransport>> {
        listeners_by_port
            .get(&addr.port())?
            .iter()
            .find(|t| t.local_addr == addr)
            .map(Arc::clone)
    }

    /// Exact source-IP match first, then a wildcard-bound transport, then
    /// any transport at all; skips any whose count has already reached
    /// zero rather than handing out a dead transport.
    fn pick_preferred<'a>(
        candidates: impl Iterator<Item = &'a Arc<RefcountedTransport>>,
        preferred_ip: Option<IpAddr>,
    ) -> Option<Arc<RefcountedTransport>> {
        let items: Vec<_> = candidates.collect();

        if let Some(ip) = preferred_ip {
            for t in &items {
                if t.local_addr.ip() == ip && t.try_increment().is_ok() {
                    return Some(Arc::clone(t));
                }
            }
        }
        for t in &items {
            if t.local_addr.ip().is_unspecified() && t.try_increment().is_ok() {
                return Some(Arc::clone(t));
            }
        }
        for t in &items {
            if t.try_increment().is_ok() {
                return Some(Arc::clone(t));
            }
        }
        None
    }
}
