// Copyright © 2019-2026 The Radicle Foundation <hello@radicle.foundation>
//
// This file is part of quic-reuse, distributed under the GPLv3 with Radicle
// Linking Exception. For full terms see the included LICENSE file.

//! A single bound UDP socket and its quinn endpoint, shared by
//! reference count across every listener and dial that was routed to it by
//! the reuse pool.

use std::{
    collections::HashSet,
    net::SocketAddr,
    sync::atomic::{AtomicU64, Ordering},
};

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::{
    addr::Family,
    error::{Error, Result},
    socket::NonQuicPacketConn,
};

/// Opaque equality key a caller associates with a transport to express "I
/// already have a relationship with this remote, prefer routing my next
/// dial through the same local transport". Derived by hashing any
/// `Hash`-able marker the caller has on hand (a peer id, a connection id);
/// the pool never inspects the value beyond equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Association(pub u64);

impl Association {
    pub fn of<T: std::hash::Hash>(marker: &T) -> Self {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        marker.hash(&mut hasher);
        Association(hasher.finish())
    }
}

/// A transport entry tracked by a [`crate::pool::ReusePool`].
///
/// The refcount and the association set live behind their own lock so a
/// caller decrementing a transport to zero never needs to hold the pool's
/// lock, which is what would otherwise invite a lock-order inversion
/// against callers selecting a transport while holding the pool lock first.
pub struct RefcountedTransport {
    pub local_addr: SocketAddr,
    pub family: Family,
    /// `true` if this transport was handed out by the lend-transport path:
    /// its socket is owned by the caller, and this crate only tracks its
    /// reference count and association set, signalling `done` instead of
    /// closing anything on last release.
    pub borrowed: bool,
    pub endpoint: quinn::Endpoint,
    state: Mutex<State>,
    generation: AtomicU64,
    done_tx: Mutex<Option<oneshot::Sender<()>>>,
    non_quic: Mutex<Option<NonQuicPacketConn>>,
}

struct State {
    count: usize,
    associations: HashSet<Association>,
}

/// Why a try-increment failed.
#[derive(Debug, PartialEq, Eq)]
pub enum IncrementError {
    /// The transport's count had already reached zero; it is being (or has
    /// been) torn down and must not be handed out again.
    Dead,
}

impl RefcountedTransport {
    /// `non_quic` is `Some` for transports this crate bound itself (so a
    /// later non-QUIC share call can attach to it); `None` for
    /// borrowed transports, whose demultiplexing is the lender's business.
    pub fn new(
        local_addr: SocketAddr,
        family: Family,
        borrowed: bool,
        endpoint: quinn::Endpoint,
        non_quic: Option<NonQuicPacketConn>,
    ) -> (Self, Option<oneshot::Receiver<()>>) {
        let (done_tx, done_rx) = if borrowed {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        (
            Self {
                local_addr,
                family,
                borrowed,
                endpoint,
                state: Mutex::new(State {
                    count: 1,
                    associations: HashSet::new(),
                }),
                generation: AtomicU64::new(0),
                done_tx: Mutex::new(done_tx),
                non_quic: Mutex::new(non_quic),
            },
            done_rx,
        )
    }

    /// Monotonic generation counter, bumped every time the count returns to
    /// zero. Used by the pool to detect a stale entry: if the generation it
    /// last observed no longer matches, the slot has already been recycled
    /// and must be treated as absent.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Attempt to take a new reference. Fails iff the count has already
    /// reached zero: the only correct response is for the caller to treat
    /// this transport as gone and fall through to binding or selecting a
    /// different one. This is the transactional half of the
    /// try-increment-or-skip pattern the pool's selection steps rely on to
    /// stay race-free without taking the transport lock and the pool lock
    /// in the same order as the release path.
    pub fn try_increment(&self) -> std::result::Result<(), IncrementError> {
        let mut state = self.state.lock();
        if state.count == 0 {
            return Err(IncrementError::Dead);
        }
        state.count += 1;
        Ok(())
    }

    /// Record an association while holding a reference (callers must have
    /// called [`Self::try_increment`] or be the transport's creator first).
    pub fn associate(&self, assoc: Association) {
        self.state.lock().associations.insert(assoc);
    }

    pub fn has_association(&self, assoc: &Association) -> bool {
        self.state.lock().associations.contains(assoc)
    }

    /// Release a reference. Returns `true` iff this call brought the count
    /// to zero, i.e. the caller is now responsible for telling the pool to
    /// drop the entry and, for an owned transport, for closing the
    /// endpoint.
    ///
    /// Never called while holding the pool's lock: the pool always releases
    /// its own lock before calling this so that the only lock held here is
    /// the transport's own, and the subsequent pool-eviction callback is
    /// free to re-acquire the pool lock without risking the inverse order.
    pub fn decrement_count(&self) -> bool {
        let mut state = self.state.lock();
        debug_assert!(state.count > 0, "double release of a reuse-pool transport");
        state.count = state.count.saturating_sub(1);
        let went_to_zero = state.count == 0;
        if went_to_zero {
            self.generation.fetch_add(1, Ordering::AcqRel);
        }
        drop(state);

        if went_to_zero {
            if self.borrowed {
                if let Some(tx) = self.done_tx.lock().take() {
                    let _ = tx.send(());
                }
            } else {
                self.endpoint.close(0u32.into(), b"released");
            }
        }
        went_to_zero
    }

    pub fn count(&self) -> usize {
        self.state.lock().count
    }

    /// Detach and return this transport's non-QUIC packet conn, if one was
    /// created for it and nobody has already taken it.
    pub fn take_non_quic(&self) -> Result<NonQuicPacketConn> {
        self.non_quic.lock().take().ok_or(Error::NotShareable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn association_equality_is_by_hash() {
        let a = Association::of(&42u64);
        let b = Association::of(&42u64);
        let c = Association::of(&43u64);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn increment_error_is_comparable() {
        assert_eq!(IncrementError::Dead, IncrementError::Dead);
    }
}
