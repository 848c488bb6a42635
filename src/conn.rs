//! Per-connection state (§3): everything the engine tracks about one
//! client socket between requests. The connection task itself only frames
//! bytes off the wire; this struct lives inside the engine task and is
//! addressed by a stable numeric id so database-side wait-queues and watch
//! maps never hold a pointer into it (§9 Design notes).

use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplRole {
    Normal,
    /// This connection is the engine's outbound link to *its* master.
    ConnectedAsMaster,
    /// This connection is a slave that completed the handshake and is
    /// receiving streamed writes.
    ConnectedAsSlave,
}

/// A queued command inside a MULTI block, plus whether it carries a write
/// permission (used to decide if EXEC needs to bracket the log in
/// MULTI/EXEC markers).
#[derive(Debug, Clone)]
pub struct QueuedCommand {
    pub argv: Vec<Vec<u8>>,
    pub is_write: bool,
}

pub struct Conn {
    pub id: u64,
    pub db_index: usize,
    pub outbound: mpsc::UnboundedSender<Vec<u8>>,

    // Transaction state (§4.3).
    pub in_transaction: bool,
    pub poisoned: bool,
    pub queued: Vec<QueuedCommand>,
    pub watched_keys: Vec<(usize, Vec<u8>)>,

    // Blocking state (§4.4).
    pub blocked: bool,
    pub block_keys: Vec<Vec<u8>>,
    pub block_start_ms: i64,
    pub block_timeout_ms: i64,
    pub block_db: usize,
    pub block_dest: Option<Vec<u8>>,
    pub block_is_brpoplpush: bool,
    /// True for BLPOP (pop from the head); false for BRPOP/BRPOPLPUSH,
    /// which both pop from the tail (§4.4).
    pub block_pop_left: bool,

    // Replication role of this connection.
    pub repl_role: ReplRole,
    /// Port the peer reported via `REPLCONF listening-port`, when this
    /// connection turns out to be a slave.
    pub slave_listening_port: Option<u16>,
    /// Byte offset of the backlog this slave has acknowledged.
    pub slave_ack_offset: u64,
    /// Set once PSYNC has handed this connection a snapshot+streaming role.
    pub slave_streaming: bool,

    pub last_command: String,
}

impl Conn {
    pub fn new(id: u64, outbound: mpsc::UnboundedSender<Vec<u8>>) -> Self {
        Conn {
            id,
            db_index: 0,
            outbound,
            in_transaction: false,
            poisoned: false,
            queued: Vec::new(),
            watched_keys: Vec::new(),
            blocked: false,
            block_keys: Vec::new(),
            block_start_ms: 0,
            block_timeout_ms: 0,
            block_db: 0,
            block_dest: None,
            block_is_brpoplpush: false,
            block_pop_left: false,
            repl_role: ReplRole::Normal,
            slave_listening_port: None,
            slave_ack_offset: 0,
            slave_streaming: false,
            last_command: String::new(),
        }
    }

    pub fn send(&self, bytes: Vec<u8>) {
        // The outbound task may already be gone (client disconnected); the
        // engine loop does not treat that as an error, it just drops state
        // on the next disconnect notification.
        let _ = self.outbound.send(bytes);
    }

    pub fn reset_transaction(&mut self) {
        self.in_transaction = false;
        self.poisoned = false;
        self.queued.clear();
    }

    pub fn clear_block_state(&mut self) {
        self.blocked = false;
        self.block_keys.clear();
        self.block_dest = None;
        self.block_is_brpoplpush = false;
    }
}
