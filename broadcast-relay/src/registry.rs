//! Membership registry shared by a transport adapter and the fan-out engine.
//!
//! The adapter is the only writer (`observe` on first contact, `forget` on
//! disconnect). The engine only ever reads through [`Registry::snapshot`],
//! which copies the set under the lock so iteration never races a writer.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use tracing::info;

use crate::peer::Peer;

/// Set of live peers. Cloning yields another handle to the same set.
///
/// The lock is only held for the duration of one insert, remove, or copy;
/// nothing ever performs I/O while holding it.
pub struct Registry<P> {
    members: Arc<Mutex<HashSet<P>>>,
}

impl<P> Clone for Registry<P> {
    fn clone(&self) -> Self {
        Self {
            members: Arc::clone(&self.members),
        }
    }
}

impl<P: Peer> Default for Registry<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Peer> Registry<P> {
    pub fn new() -> Self {
        Self {
            members: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Registers `peer`. Returns `true` only the first time a live peer is seen.
    pub fn observe(&self, peer: &P) -> bool {
        let inserted = self.lock().insert(peer.clone());
        if inserted {
            info!(?peer, "client connected");
        }
        inserted
    }

    /// Removes `peer`. Unknown peers are ignored.
    pub fn forget(&self, peer: &P) -> bool {
        let removed = self.lock().remove(peer);
        if removed {
            info!(?peer, "client disconnected");
        }
        removed
    }

    /// Point-in-time copy of every registered peer, in no particular order.
    pub fn snapshot(&self) -> Vec<P> {
        self.lock().iter().cloned().collect()
    }

    pub fn contains(&self, peer: &P) -> bool {
        self.lock().contains(peer)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // A writer that panicked mid-insert still leaves a valid HashSet behind.
    fn lock(&self) -> MutexGuard<'_, HashSet<P>> {
        self.members.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
