//! Blocking layer (C4): per-key FIFO wait-queues for BLPOP/BRPOP/BRPOPLPUSH.
//!
//! Waiters are modeled as suspended command continuations (§9 Design
//! notes): there is no async yield inside command dispatch. Registering a
//! wait just records bookkeeping and returns control to the event loop; a
//! later write to the same key (or the periodic tick, for timeouts) wakes
//! the waiter synchronously by sending its reply directly over its
//! outbound channel.

use std::collections::{HashMap, VecDeque};

/// Per-database map from key to the ordered list of connection ids
/// blocked on it. FIFO by registration time (§4.4 ordering guarantee).
#[derive(Default)]
pub struct BlockingMap {
    waiters: HashMap<Vec<u8>, VecDeque<u64>>,
}

impl BlockingMap {
    pub fn register(&mut self, key: &[u8], conn_id: u64) {
        self.waiters.entry(key.to_vec()).or_default().push_back(conn_id);
    }

    /// Pop the head waiter for `key`, if any. The caller is responsible for
    /// clearing the waiter's own `block_keys` bookkeeping on every key it
    /// had registered on (a BLPOP on multiple keys must be removed from
    /// all of them once served).
    pub fn pop_waiter(&mut self, key: &[u8]) -> Option<u64> {
        let waiter = self.waiters.get_mut(key).and_then(|q| q.pop_front());
        if let Some(q) = self.waiters.get(key) {
            if q.is_empty() {
                self.waiters.remove(key);
            }
        }
        waiter
    }

    pub fn has_waiter(&self, key: &[u8]) -> bool {
        self.waiters.get(key).map(|q| !q.is_empty()).unwrap_or(false)
    }

    /// Remove `conn_id` from every key's wait-queue (disconnect or timeout).
    pub fn remove_conn(&mut self, conn_id: u64, keys: &[Vec<u8>]) {
        for key in keys {
            if let Some(q) = self.waiters.get_mut(key) {
                q.retain(|&id| id != conn_id);
                if q.is_empty() {
                    self.waiters.remove(key);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn waiters_are_served_fifo() {
        let mut m = BlockingMap::default();
        m.register(b"q", 1);
        m.register(b"q", 2);
        assert_eq!(m.pop_waiter(b"q"), Some(1));
        assert_eq!(m.pop_waiter(b"q"), Some(2));
        assert_eq!(m.pop_waiter(b"q"), None);
    }

    #[test]
    fn remove_conn_clears_all_registrations() {
        let mut m = BlockingMap::default();
        m.register(b"a", 1);
        m.register(b"b", 1);
        m.register(b"b", 2);
        m.remove_conn(1, &[b"a".to_vec(), b"b".to_vec()]);
        assert!(!m.has_waiter(b"a"));
        assert_eq!(m.pop_waiter(b"b"), Some(2));
    }
}
