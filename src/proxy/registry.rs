//! Live-connection table.
//!
//! Every accepted pair registers itself here for the lifetime between
//! accept and teardown; shutdown walks the table and cancels each
//! pair's token so the tasks run their normal close path.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

pub struct ConnTable {
    conns: DashMap<u64, CancellationToken>,
    next_id: AtomicU64,
}

impl ConnTable {
    pub fn new() -> Self {
        Self {
            conns: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn register(&self, token: CancellationToken) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.conns.insert(id, token);
        id
    }

    pub fn remove(&self, id: u64) {
        self.conns.remove(&id);
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    pub fn abort_all(&self) {
        for entry in self.conns.iter() {
            entry.value().cancel();
        }
    }
}

impl Default for ConnTable {
    fn default() -> Self {
        Self::new()
    }
}
