//! Append log writer/rewriter (C6 §4.6): every write re-serialized to the
//! wire request grammar and appended to a durable log, with a background
//! rewrite that compacts the log to its minimal reconstruction.

use crate::config::Config;
use crate::db::Database;
use crate::protocol::encode_request;
use crate::value::Value;
use std::io::Write;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsyncPolicy {
    Always,
    EverySec,
    No,
}

impl FsyncPolicy {
    pub fn from_config(cfg: &Config) -> Self {
        match cfg.get_string("appendfsync", "everysec").as_str() {
            "always" => FsyncPolicy::Always,
            "no" => FsyncPolicy::No,
            _ => FsyncPolicy::EverySec,
        }
    }
}

/// The append log's in-memory state: the live buffer, the secondary
/// "rewrite buffer" collected while a rewrite is in flight, and the
/// bookkeeping needed to decide when to trigger the next rewrite.
pub struct AppendLog {
    policy: FsyncPolicy,
    enabled: bool,
    buffer: Vec<u8>,
    rewrite_in_progress: bool,
    rewrite_buffer: Vec<u8>,
    last_fsync_secs: u64,
    size_at_last_rewrite: usize,
}

/// Automatic rewrite never fires below this many bytes, mirroring a
/// typical `auto-aof-rewrite-min-size` floor.
const MIN_REWRITE_SIZE: usize = 64 * 1024;
/// Growth factor over the size recorded at the previous rewrite.
const REWRITE_GROWTH_FACTOR: usize = 2;

impl AppendLog {
    pub fn new(policy: FsyncPolicy, enabled: bool) -> Self {
        AppendLog {
            policy,
            enabled,
            buffer: Vec::new(),
            rewrite_in_progress: false,
            rewrite_buffer: Vec::new(),
            last_fsync_secs: 0,
            size_at_last_rewrite: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Re-serialize one successfully executed write and append it. While a
    /// rewrite is running the command also lands in the rewrite buffer so
    /// it survives the swap (§4.6).
    pub fn append_command(&mut self, argv: &[Vec<u8>]) {
        if !self.enabled {
            return;
        }
        let bytes = encode_request(argv);
        self.buffer.extend_from_slice(&bytes);
        if self.rewrite_in_progress {
            self.rewrite_buffer.extend_from_slice(&bytes);
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Whether `now_secs` calls for an fsync under `EVERYSEC`.
    pub fn should_fsync_every_sec(&mut self, now_secs: u64) -> bool {
        if self.policy != FsyncPolicy::EverySec {
            return false;
        }
        if now_secs > self.last_fsync_secs {
            self.last_fsync_secs = now_secs;
            true
        } else {
            false
        }
    }

    pub fn policy(&self) -> FsyncPolicy {
        self.policy
    }

    /// Flush (and, per policy, fsync) the live buffer to `file`.
    pub fn flush_to(&mut self, file: &mut impl Write, fsync: impl FnOnce(&mut dyn Write) -> std::io::Result<()>) -> std::io::Result<()> {
        file.write_all(&self.buffer)?;
        self.buffer.clear();
        match self.policy {
            FsyncPolicy::Always => fsync(file),
            _ => Ok(()),
        }
    }

    /// §4.6 rewrite trigger: current size at or above the floor, and grown
    /// by the configured factor since the last rewrite.
    pub fn should_rewrite(&self, current_file_size: usize) -> bool {
        current_file_size >= MIN_REWRITE_SIZE
            && current_file_size >= self.size_at_last_rewrite.max(1) * REWRITE_GROWTH_FACTOR
    }

    pub fn begin_rewrite(&mut self) {
        self.rewrite_in_progress = true;
        self.rewrite_buffer.clear();
    }

    /// Complete a rewrite: the caller has already written `rewritten` (the
    /// minimal reconstruction) to the new file; this appends whatever
    /// arrived during the rewrite and returns the final bytes to persist.
    pub fn finish_rewrite(&mut self, mut rewritten: Vec<u8>, new_size_before_tail: usize) -> Vec<u8> {
        rewritten.extend_from_slice(&self.rewrite_buffer);
        self.size_at_last_rewrite = new_size_before_tail + self.rewrite_buffer.len();
        self.rewrite_buffer.clear();
        self.rewrite_in_progress = false;
        rewritten
    }
}

fn write_command(out: &mut Vec<u8>, argv: &[&[u8]]) {
    let owned: Vec<Vec<u8>> = argv.iter().map(|a| a.to_vec()).collect();
    out.extend_from_slice(&encode_request(&owned));
}

/// Emit the minimal command sequence reconstructing `databases` (§4.6
/// Rewrite): one `SELECT` per non-empty database, then for each key an
/// absolute-deadline expiry record followed by its minimal constructor.
pub fn rewrite(databases: &[Database]) -> Vec<u8> {
    let mut out = Vec::new();
    for db in databases {
        if db.is_empty() {
            continue;
        }
        write_command(&mut out, &[b"SELECT", db.index.to_string().as_bytes()]);
        for (key, value) in db.iter() {
            match value {
                Value::String(s) => write_command(&mut out, &[b"SET", key, s]),
                Value::List(list) => {
                    let mut argv: Vec<&[u8]> = vec![b"RPUSH", key];
                    for item in list {
                        argv.push(item);
                    }
                    write_command(&mut out, &argv);
                }
                Value::Set(set) => {
                    let mut argv: Vec<&[u8]> = vec![b"SADD", key];
                    for item in set {
                        argv.push(item);
                    }
                    write_command(&mut out, &argv);
                }
                Value::Hash(hash) => {
                    let mut argv: Vec<&[u8]> = vec![b"HMSET", key];
                    for (field, val) in hash {
                        argv.push(field);
                        argv.push(val);
                    }
                    write_command(&mut out, &argv);
                }
                Value::ZSet(zset) => {
                    let pairs = zset.order.iter_ascending();
                    let scores: Vec<String> = pairs.iter().map(|(score, _)| score.to_string()).collect();
                    let mut argv: Vec<&[u8]> = vec![b"ZADD", key];
                    for (score, (_, member)) in scores.iter().zip(pairs.iter()) {
                        argv.push(score.as_bytes());
                        argv.push(member);
                    }
                    write_command(&mut out, &argv);
                }
            }
            if let Some(deadline) = db.expiry_of(key) {
                write_command(&mut out, &[b"PEXPIREAT", key, deadline.to_string().as_bytes()]);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    #[test]
    fn append_command_encodes_wire_grammar() {
        let mut log = AppendLog::new(FsyncPolicy::No, true);
        log.append_command(&[b"SET".to_vec(), b"k".to_vec(), b"v".to_vec()]);
        assert_eq!(log.len(), encode_request(&[b"SET".to_vec(), b"k".to_vec(), b"v".to_vec()]).len());
    }

    #[test]
    fn disabled_log_drops_commands() {
        let mut log = AppendLog::new(FsyncPolicy::No, false);
        log.append_command(&[b"SET".to_vec(), b"k".to_vec(), b"v".to_vec()]);
        assert!(log.is_empty());
    }

    #[test]
    fn rewrite_in_progress_mirrors_to_rewrite_buffer() {
        let mut log = AppendLog::new(FsyncPolicy::No, true);
        log.begin_rewrite();
        log.append_command(&[b"SET".to_vec(), b"k".to_vec(), b"v".to_vec()]);
        let final_bytes = log.finish_rewrite(vec![], 0);
        assert_eq!(final_bytes, encode_request(&[b"SET".to_vec(), b"k".to_vec(), b"v".to_vec()]));
    }

    #[test]
    fn rewrite_emits_minimal_constructors() {
        let mut db = Database::new(0);
        db.insert(b"k".to_vec(), Value::String(b"v".to_vec()));
        db.insert(b"l".to_vec(), Value::List(VecDeque::from(vec![b"a".to_vec()])));
        let bytes = rewrite(&[db]);
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.contains("SELECT"));
        assert!(text.contains("SET"));
        assert!(text.contains("RPUSH"));
    }

    #[test]
    fn should_rewrite_requires_min_size_and_growth() {
        let log = AppendLog::new(FsyncPolicy::No, true);
        assert!(!log.should_rewrite(100));
        assert!(log.should_rewrite(MIN_REWRITE_SIZE + 1));
    }
}
