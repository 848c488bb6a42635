//! A single logical database (§3 Data model): the key→value map, the
//! expiry map, and the watch map. Expiry checks and the empty-container
//! invariant live here since every command handler needs them.

use crate::value::Value;
use std::collections::{HashMap, HashSet};

/// Keys whose expiry fired during a command, in the order they were
/// discovered. The caller (dispatch) turns each into a synthetic `DEL`
/// appended to write-propagation (§3 invariant: expiry-driven deletes are
/// logged before the triggering command's own effects).
pub type ExpiredKeys = Vec<Vec<u8>>;

pub struct Database {
    pub index: usize,
    data: HashMap<Vec<u8>, Value>,
    expires: HashMap<Vec<u8>, i64>,
    /// key -> set of connection ids watching it (§3: only non-empty entries exist).
    watches: HashMap<Vec<u8>, HashSet<u64>>,
    /// key -> last-access millisecond stamp, used by LRU eviction sampling.
    access: HashMap<Vec<u8>, i64>,
}

impl Database {
    pub fn new(index: usize) -> Self {
        Database {
            index,
            data: HashMap::new(),
            expires: HashMap::new(),
            watches: HashMap::new(),
            access: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Consult the expiry map for `key`, deleting it (and the matching
    /// expiry entry) if its deadline has passed. Returns true if the key
    /// was just expired.
    pub fn expire_if_needed(&mut self, key: &[u8], now_ms: i64) -> bool {
        if let Some(&deadline) = self.expires.get(key) {
            if deadline <= now_ms {
                self.data.remove(key);
                self.expires.remove(key);
                self.access.remove(key);
                return true;
            }
        }
        false
    }

    /// Run `expire_if_needed` over every key in `keys`, collecting the ones
    /// that fired so the caller can propagate synthetic DELs.
    pub fn expire_keys_if_needed(&mut self, keys: &[Vec<u8>], now_ms: i64) -> ExpiredKeys {
        let mut expired = Vec::new();
        for k in keys {
            if self.expire_if_needed(k, now_ms) {
                expired.push(k.clone());
            }
        }
        expired
    }

    /// Sweep every key with an expiry entry, used by the periodic tick.
    pub fn sweep_expired(&mut self, now_ms: i64) -> ExpiredKeys {
        let due: Vec<Vec<u8>> = self
            .expires
            .iter()
            .filter(|(_, &deadline)| deadline <= now_ms)
            .map(|(k, _)| k.clone())
            .collect();
        for k in &due {
            self.data.remove(k);
            self.expires.remove(k);
            self.access.remove(k);
        }
        due
    }

    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn get_mut(&mut self, key: &[u8]) -> Option<&mut Value> {
        self.data.get_mut(key)
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.data.contains_key(key)
    }

    pub fn insert(&mut self, key: Vec<u8>, value: Value) {
        self.data.insert(key, value);
    }

    /// Entry that creates the default container lazily, the way each typed
    /// handler does for e.g. LPUSH on a missing key.
    pub fn entry_or_insert_with(&mut self, key: &[u8], default: impl FnOnce() -> Value) -> &mut Value {
        if !self.data.contains_key(key) {
            self.data.insert(key.to_vec(), default());
        }
        self.data.get_mut(key).expect("just inserted")
    }

    /// Remove `key` entirely (value + expiry + access stamp). Returns true
    /// if the key existed.
    pub fn remove(&mut self, key: &[u8]) -> bool {
        let existed = self.data.remove(key).is_some();
        self.expires.remove(key);
        self.access.remove(key);
        existed
    }

    /// Remove `key` and hand back its value, for MOVE and similar
    /// key-transplant operations that need the owned value rather than a
    /// yes/no removal result.
    pub fn take(&mut self, key: &[u8]) -> Option<Value> {
        let value = self.data.remove(key);
        self.expires.remove(key);
        self.access.remove(key);
        value
    }

    /// §3 invariant: drop a container that became empty, along with its
    /// expiry entry, atomically. Call after every mutating handler.
    pub fn drop_if_empty_container(&mut self, key: &[u8]) {
        let empty = matches!(self.data.get(key), Some(v) if v.is_empty_container());
        if empty {
            self.data.remove(key);
            self.expires.remove(key);
            self.access.remove(key);
        }
    }

    pub fn set_expiry(&mut self, key: &[u8], deadline_ms: i64) {
        if self.data.contains_key(key) {
            self.expires.insert(key.to_vec(), deadline_ms);
        }
    }

    pub fn clear_expiry(&mut self, key: &[u8]) -> bool {
        self.expires.remove(key).is_some()
    }

    pub fn expiry_of(&self, key: &[u8]) -> Option<i64> {
        self.expires.get(key).copied()
    }

    pub fn rename_key(&mut self, from: &[u8], to: Vec<u8>) -> bool {
        let Some(v) = self.data.remove(from) else { return false };
        let expiry = self.expires.remove(from);
        self.access.remove(from);
        self.data.insert(to.clone(), v);
        match expiry {
            Some(e) => {
                self.expires.insert(to, e);
            }
            None => {
                self.expires.remove(&to);
            }
        }
        true
    }

    pub fn keys(&self) -> impl Iterator<Item = &Vec<u8>> {
        self.data.keys()
    }

    /// Every live key/value pair, used by snapshot save and AOF rewrite.
    pub fn iter(&self) -> impl Iterator<Item = (&Vec<u8>, &Value)> {
        self.data.iter()
    }

    pub fn flush(&mut self) {
        self.data.clear();
        self.expires.clear();
        self.watches.clear();
        self.access.clear();
    }

    // ---- watch map (§4.3) ----

    pub fn watch(&mut self, key: &[u8], conn_id: u64) {
        self.watches.entry(key.to_vec()).or_default().insert(conn_id);
    }

    /// Remove every key-watch entry this connection holds. The watch map
    /// only keeps keys with at least one watcher (§3 invariant).
    pub fn unwatch_all(&mut self, conn_id: u64, keys: &[Vec<u8>]) {
        for key in keys {
            if let Some(watchers) = self.watches.get_mut(key) {
                watchers.remove(&conn_id);
                if watchers.is_empty() {
                    self.watches.remove(key);
                }
            }
        }
    }

    /// Connections whose transactions must be poisoned because `key` was
    /// just mutated (or expired). The entry is removed as part of reading
    /// it: a watcher is touched once, then forgotten, matching EXEC/DISCARD
    /// clearing watch state.
    pub fn take_watchers(&mut self, key: &[u8]) -> Vec<u64> {
        self.watches.remove(key).map(|s| s.into_iter().collect()).unwrap_or_default()
    }

    pub fn has_watchers(&self, key: &[u8]) -> bool {
        self.watches.contains_key(key)
    }

    // ---- eviction access tracking (§4.8) ----

    pub fn touch_access(&mut self, key: &[u8], now_ms: i64) {
        if self.data.contains_key(key) {
            self.access.insert(key.to_vec(), now_ms);
        }
    }

    pub fn access_stamp(&self, key: &[u8]) -> Option<i64> {
        self.access.get(key).copied()
    }

    pub fn expiring_keys(&self) -> impl Iterator<Item = &Vec<u8>> {
        self.expires.keys()
    }

    pub fn approx_memory(&self) -> usize {
        self.data.iter().map(|(k, v)| k.len() + v.approx_size()).sum()
    }
}

/// §4.2 range clamping, shared by GETRANGE/LRANGE/LTRIM/ZRANGE's rank path.
/// `len` is the sequence length; returns the inclusive `[start, stop]`
/// 0-based range, or `None` if it is empty after clamping.
pub fn clamp_range(start: i64, stop: i64, len: i64) -> Option<(usize, usize)> {
    if len == 0 {
        return None;
    }
    let upper = len - 1;
    let lower = -len;
    if start > upper || stop < lower {
        return None;
    }
    let start = if start < 0 { (start + len).max(0) } else { start.min(upper) };
    let stop = if stop < 0 { (stop + len).max(0) } else { stop.min(upper) };
    if start > stop {
        None
    } else {
        Some((start as usize, stop as usize))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiry_entry_requires_live_key() {
        let mut db = Database::new(0);
        db.insert(b"k".to_vec(), Value::String(b"v".to_vec()));
        db.set_expiry(b"k", 1000);
        assert_eq!(db.expiry_of(b"k"), Some(1000));
        db.remove(b"k");
        assert_eq!(db.expiry_of(b"k"), None);
    }

    #[test]
    fn expire_if_needed_deletes_past_deadline() {
        let mut db = Database::new(0);
        db.insert(b"k".to_vec(), Value::String(b"v".to_vec()));
        db.set_expiry(b"k", 100);
        assert!(!db.expire_if_needed(b"k", 50));
        assert!(db.expire_if_needed(b"k", 200));
        assert!(!db.contains(b"k"));
        assert_eq!(db.expiry_of(b"k"), None);
    }

    #[test]
    fn watchers_are_taken_once() {
        let mut db = Database::new(0);
        db.watch(b"k", 1);
        db.watch(b"k", 2);
        assert!(db.has_watchers(b"k"));
        let mut w = db.take_watchers(b"k");
        w.sort();
        assert_eq!(w, vec![1, 2]);
        assert!(!db.has_watchers(b"k"));
    }

    #[test]
    fn clamp_range_matches_spec_examples() {
        assert_eq!(clamp_range(0, -1, 5), Some((0, 4)));
        assert_eq!(clamp_range(-100, -1, 5), Some((0, 4)));
        assert_eq!(clamp_range(3, 1, 5), None);
        assert_eq!(clamp_range(10, 20, 5), None);
        assert_eq!(clamp_range(-1, -100, 5), None);
    }

    #[test]
    fn drop_if_empty_container_removes_expiry_too() {
        use std::collections::VecDeque;
        let mut db = Database::new(0);
        db.insert(b"k".to_vec(), Value::List(VecDeque::new()));
        db.set_expiry(b"k", 1000);
        db.drop_if_empty_container(b"k");
        assert!(!db.contains(b"k"));
        assert_eq!(db.expiry_of(b"k"), None);
    }
}
