//! Session index: local receiver index -> (peer, session)
//!
//! Indices are random 32-bit values; a collision with a live index is
//! retried. An entry exists exactly while its session is out of UNKNOWN.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::Rng;

use crate::device::peer::Peer;
use crate::protocol::session::Session;

/// What an index resolves to
#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub peer: Arc<Peer>,
    pub session: Arc<Session>,
}

#[derive(Debug, Default)]
pub struct SessionIndex {
    map: DashMap<u32, IndexEntry>,
}

impl SessionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `session` under a fresh random index
    pub fn allocate(&self, peer: &Arc<Peer>, session: &Arc<Session>) -> u32 {
        let mut rng = rand::thread_rng();
        loop {
            let index: u32 = rng.gen();
            if let Entry::Vacant(slot) = self.map.entry(index) {
                slot.insert(IndexEntry {
                    peer: Arc::clone(peer),
                    session: Arc::clone(session),
                });
                return index;
            }
            tracing::trace!(index, "session index collision, retrying");
        }
    }

    pub fn get(&self, index: u32) -> Option<IndexEntry> {
        self.map.get(&index).map(|entry| entry.value().clone())
    }

    /// Drop `index` if it still belongs to `session`
    pub fn remove(&self, index: u32, session: &Arc<Session>) -> bool {
        self.map
            .remove_if(&index, |_, entry| Arc::ptr_eq(&entry.session, session))
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
