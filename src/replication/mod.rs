//! Replication (C7 §4.7): master-side backlog + slave bookkeeping, and the
//! slave-side handshake state machine. The actual socket I/O lives in
//! `server.rs`; this module holds the state both sides drive.

pub mod backlog;

use backlog::Backlog;
use std::collections::HashMap;

/// Per-slave state as tracked by the master.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlaveState {
    /// Connected, snapshot not yet sent (parked during a concurrent bgsave).
    Parked,
    /// Snapshot in flight.
    SyncFull,
    /// Caught up; receiving the live command stream.
    Streaming,
}

pub struct SlaveHandle {
    pub conn_id: u64,
    pub state: SlaveState,
    pub listening_port: Option<u16>,
    pub ack_offset: u64,
    pub last_ack_ms: i64,
}

/// Master-side replication state: one backlog ring shared by every slave,
/// plus per-slave bookkeeping.
pub struct MasterState {
    pub run_id: String,
    pub backlog: Backlog,
    pub slaves: HashMap<u64, SlaveHandle>,
}

impl MasterState {
    pub fn new(run_id: String, backlog_capacity: usize) -> Self {
        MasterState { run_id, backlog: Backlog::new(backlog_capacity), slaves: HashMap::new() }
    }

    pub fn add_slave(&mut self, conn_id: u64) {
        self.slaves.insert(
            conn_id,
            SlaveHandle { conn_id, state: SlaveState::Parked, listening_port: None, ack_offset: 0, last_ack_ms: 0 },
        );
    }

    pub fn remove_slave(&mut self, conn_id: u64) {
        self.slaves.remove(&conn_id);
    }

    /// Record a write's wire bytes in the backlog and return the conn ids
    /// of every slave currently streaming, so the caller can fan the bytes
    /// out to them directly (§4.7 Master to slave propagation).
    pub fn propagate(&mut self, bytes: &[u8]) -> Vec<u64> {
        self.backlog.append(bytes);
        self.slaves
            .values()
            .filter(|s| s.state == SlaveState::Streaming)
            .map(|s| s.conn_id)
            .collect()
    }

    /// Decide a PSYNC request's outcome. `requested_runid` of `None` means
    /// the first-contact `PSYNC ? -1` form.
    pub fn resolve_psync(&self, requested_runid: Option<&str>, requested_offset: u64) -> PsyncDecision {
        match requested_runid {
            Some(runid) if runid == self.run_id && self.backlog.can_serve_from(requested_offset) => {
                PsyncDecision::Continue { bytes: self.backlog.slice_from(requested_offset) }
            }
            _ => PsyncDecision::FullResync { run_id: self.run_id.clone(), offset: self.backlog.offset() },
        }
    }

    /// Handle `REPLCONF ACK <offset>`: update the slave's acked offset and
    /// decide whether a retransmit of the gap is possible, or a full
    /// resync is required instead (§4.7 Heartbeats).
    pub fn on_ack(&mut self, conn_id: u64, offset: u64, now_ms: i64) -> Option<AckOutcome> {
        let slave = self.slaves.get_mut(&conn_id)?;
        slave.ack_offset = offset;
        slave.last_ack_ms = now_ms;
        let master_offset = self.backlog.offset();
        if offset >= master_offset {
            return Some(AckOutcome::UpToDate);
        }
        if self.backlog.can_serve_from(offset) {
            Some(AckOutcome::Retransmit { bytes: self.backlog.slice_from(offset) })
        } else {
            Some(AckOutcome::NeedsFullResync)
        }
    }
}

pub enum PsyncDecision {
    FullResync { run_id: String, offset: u64 },
    Continue { bytes: Vec<u8> },
}

pub enum AckOutcome {
    UpToDate,
    Retransmit { bytes: Vec<u8> },
    NeedsFullResync,
}

/// Slave-side handshake state machine (§4.7 Roles).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlaveHandshake {
    SyncPing,
    SyncConf,
    SyncWait,
    SyncFull,
    Streaming,
}

impl SlaveHandshake {
    pub fn initial() -> Self {
        SlaveHandshake::SyncPing
    }

    pub fn advance(self) -> Self {
        match self {
            SlaveHandshake::SyncPing => SlaveHandshake::SyncConf,
            SlaveHandshake::SyncConf => SlaveHandshake::SyncWait,
            SlaveHandshake::SyncWait => SlaveHandshake::SyncFull,
            SlaveHandshake::SyncFull => SlaveHandshake::Streaming,
            SlaveHandshake::Streaming => SlaveHandshake::Streaming,
        }
    }
}

/// Slave-side replication state: the master's identity once known, the
/// running byte offset, and the handshake phase.
pub struct SlaveLink {
    pub master_host: String,
    pub master_port: u16,
    pub handshake: SlaveHandshake,
    pub master_run_id: Option<String>,
    pub slave_offset: u64,
}

impl SlaveLink {
    pub fn new(master_host: String, master_port: u16) -> Self {
        SlaveLink {
            master_host,
            master_port,
            handshake: SlaveHandshake::initial(),
            master_run_id: None,
            slave_offset: 0,
        }
    }

    /// Build the PSYNC request argv for the current state: the first
    /// contact form `PSYNC ? -1`, or a resuming form once a run id is
    /// known.
    pub fn psync_request(&self) -> Vec<Vec<u8>> {
        match &self.master_run_id {
            Some(runid) => vec![
                b"PSYNC".to_vec(),
                runid.clone().into_bytes(),
                self.slave_offset.to_string().into_bytes(),
            ],
            None => vec![b"PSYNC".to_vec(), b"?".to_vec(), b"-1".to_vec()],
        }
    }

    pub fn on_streamed_bytes(&mut self, n: usize) {
        self.slave_offset += n as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_advances_in_order() {
        let mut h = SlaveHandshake::initial();
        let order = [
            SlaveHandshake::SyncConf,
            SlaveHandshake::SyncWait,
            SlaveHandshake::SyncFull,
            SlaveHandshake::Streaming,
            SlaveHandshake::Streaming,
        ];
        for expected in order {
            h = h.advance();
            assert_eq!(h, expected);
        }
    }

    #[test]
    fn resolve_psync_falls_back_to_full_resync_on_runid_mismatch() {
        let mut master = MasterState::new("abc".into(), 1024);
        master.propagate(b"hello");
        match master.resolve_psync(Some("other"), 0) {
            PsyncDecision::FullResync { run_id, offset } => {
                assert_eq!(run_id, "abc");
                assert_eq!(offset, 5);
            }
            _ => panic!("expected full resync"),
        }
    }

    #[test]
    fn resolve_psync_continues_when_offset_is_in_window() {
        let mut master = MasterState::new("abc".into(), 1024);
        master.propagate(b"hello world");
        match master.resolve_psync(Some("abc"), 6) {
            PsyncDecision::Continue { bytes } => assert_eq!(bytes, b"world"),
            _ => panic!("expected partial resync"),
        }
    }

    #[test]
    fn on_ack_detects_full_resync_needed_outside_window() {
        let mut master = MasterState::new("abc".into(), 4);
        master.add_slave(1);
        master.propagate(b"abcdefgh");
        match master.on_ack(1, 0, 0) {
            Some(AckOutcome::NeedsFullResync) => {}
            _ => panic!("expected needs full resync"),
        }
    }
}
