//! Sentinel (C9 §4.9): down detection, Raft-style leader election, and
//! failover. This module holds the decision logic; `bin/sentinel.rs`
//! drives the actual PING/INFO/pub-sub connections.

pub mod election;

use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct MonitoredMaster {
    pub name: String,
    pub ip: String,
    pub port: u16,
    pub quorum: usize,
    pub down_after_ms: i64,
    pub last_heartbeat_ms: i64,
}

#[derive(Debug, Clone)]
pub struct SlaveRecord {
    pub ip: String,
    pub port: u16,
    pub priority: u32,
    pub run_id: String,
    pub replication_offset: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownState {
    Up,
    Sdown,
    Odown,
}

impl MonitoredMaster {
    /// Subjective down: no heartbeat within `down_after_ms` (§4.9 Down detection).
    pub fn is_sdown(&self, now_ms: i64) -> bool {
        now_ms - self.last_heartbeat_ms >= self.down_after_ms
    }
}

/// Objective down: the local sentinel has counted at least
/// `max(quorum, ceil((n+1)/2) + 1)` agreements among `n` known peer
/// sentinels, per §4.9.
pub fn is_odown(agreements: usize, peer_sentinel_count: usize, quorum: usize) -> bool {
    let majority = (peer_sentinel_count + 1 + 1) / 2 + 1;
    agreements >= quorum.max(majority)
}

/// Pick the failover target: the surviving slave ranked by replication
/// offset descending, then by (priority, run_id) ascending (§4.9
/// Failover, §9 Open Questions resolution).
pub fn pick_failover_candidate(slaves: &[SlaveRecord]) -> Option<&SlaveRecord> {
    slaves.iter().max_by(|a, b| {
        a.replication_offset
            .cmp(&b.replication_offset)
            .then_with(|| b.priority.cmp(&a.priority))
            .then_with(|| b.run_id.cmp(&a.run_id))
    })
}

pub struct SentinelState {
    pub masters: HashMap<String, MonitoredMaster>,
    pub slaves: HashMap<String, Vec<SlaveRecord>>,
}

impl SentinelState {
    pub fn new() -> Self {
        SentinelState { masters: HashMap::new(), slaves: HashMap::new() }
    }
}

impl Default for SentinelState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sdown_triggers_past_deadline() {
        let master = MonitoredMaster {
            name: "m".into(),
            ip: "127.0.0.1".into(),
            port: 6379,
            quorum: 2,
            down_after_ms: 1000,
            last_heartbeat_ms: 0,
        };
        assert!(!master.is_sdown(500));
        assert!(master.is_sdown(1000));
    }

    #[test]
    fn odown_requires_quorum_and_majority() {
        // 3 peers total (including self counted elsewhere): majority = ceil(4/2)+1 = 3
        assert!(!is_odown(2, 3, 2));
        assert!(is_odown(3, 3, 2));
        // quorum can demand more than the majority formula
        assert!(!is_odown(3, 1, 5));
    }

    #[test]
    fn failover_candidate_prefers_highest_offset() {
        let slaves = vec![
            SlaveRecord { ip: "a".into(), port: 1, priority: 1, run_id: "r1".into(), replication_offset: 10 },
            SlaveRecord { ip: "b".into(), port: 2, priority: 1, run_id: "r2".into(), replication_offset: 20 },
        ];
        let winner = pick_failover_candidate(&slaves).unwrap();
        assert_eq!(winner.ip, "b");
    }

    #[test]
    fn failover_candidate_breaks_tie_by_priority_then_runid() {
        let slaves = vec![
            SlaveRecord { ip: "a".into(), port: 1, priority: 5, run_id: "r2".into(), replication_offset: 10 },
            SlaveRecord { ip: "b".into(), port: 2, priority: 10, run_id: "r1".into(), replication_offset: 10 },
        ];
        let winner = pick_failover_candidate(&slaves).unwrap();
        assert_eq!(winner.ip, "a"); // lower priority value wins (ascending)
    }
}
