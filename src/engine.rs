//! The engine (§4 dataflow): owns every database, every connection's
//! bookkeeping, and the persistence/replication/eviction subsystems. This
//! is the only place that holds all of that simultaneously, so every
//! cross-database or stateful command (SELECT, MOVE, FLUSHALL,
//! transactions, blocking pops, server/persistence/replication commands)
//! is matched here; everything else falls through to
//! `commands::dispatch_on_db`.

use crate::blocking::BlockingMap;
use crate::commands::{self, check_arity, command_keys, spec_for};
use crate::config::Config;
use crate::conn::{Conn, QueuedCommand, ReplRole};
use crate::db::Database;
use crate::error::RedisError;
use crate::eviction::{self, EvictionPolicy};
use crate::persistence::aof::{AppendLog, FsyncPolicy};
use crate::persistence::rdb;
use crate::protocol::{encode_request, Reply};
use crate::protocol::ParseOutcome;
use crate::replication::{MasterState, PsyncDecision, SlaveLink, SlaveState};
use crate::util::now_ms;
use crate::value::Value;
use rand::rngs::SmallRng;
use rand::SeedableRng;
use std::collections::{HashMap, VecDeque};
use tokio::sync::mpsc;

/// Everything a freshly-woken blocked connection needs sent back to it.
pub struct Wakeup {
    pub conn_id: u64,
    pub reply: Reply,
}

/// Reserved connection id the engine dispatches through when applying
/// commands that did not arrive over a real client socket: AOF replay at
/// startup and the command stream from this server's own master (§4.6,
/// §4.7). Its outbound channel is a sink, since nothing ever reads replies
/// addressed to it.
pub const REPLICA_CONN_ID: u64 = u64::MAX;

pub struct Engine {
    pub databases: Vec<Database>,
    pub blocking: Vec<BlockingMap>,
    pub conns: HashMap<u64, Conn>,
    pub config: Config,
    pub run_id: String,
    pub dirty: u64,
    pub last_save_ms: i64,
    pub append_log: AppendLog,
    pub rng: SmallRng,
    pub master: Option<MasterState>,
    pub slave_link: Option<SlaveLink>,
    next_conn_id: u64,
    /// Set once SHUTDOWN is processed; `server.rs` polls this to stop the
    /// accept loop cleanly.
    pub shutting_down: bool,
}

impl Engine {
    pub fn new(config: Config) -> Self {
        let num_dbs = config.databases();
        let run_id = generate_run_id();
        let append_log = AppendLog::new(
            FsyncPolicy::from_config(&config),
            config.get_string("appendonly", "no") == "yes",
        );
        let backlog_size = config.get_usize("repl-backlog-size", 1024 * 1024);
        let mut conns = HashMap::new();
        let (sink, _) = mpsc::unbounded_channel();
        conns.insert(REPLICA_CONN_ID, Conn::new(REPLICA_CONN_ID, sink));
        Engine {
            databases: (0..num_dbs).map(Database::new).collect(),
            blocking: (0..num_dbs).map(|_| BlockingMap::default()).collect(),
            conns,
            config,
            master: Some(MasterState::new(run_id.clone(), backlog_size)),
            slave_link: None,
            run_id,
            dirty: 0,
            last_save_ms: 0,
            append_log,
            rng: SmallRng::seed_from_u64(0xA11CE),
            next_conn_id: 1,
            shutting_down: false,
        }
    }

    pub fn register_conn(&mut self, outbound: mpsc::UnboundedSender<Vec<u8>>) -> u64 {
        let id = self.next_conn_id;
        self.next_conn_id += 1;
        self.conns.insert(id, Conn::new(id, outbound));
        id
    }

    pub fn drop_conn(&mut self, conn_id: u64) {
        if let Some(conn) = self.conns.remove(&conn_id) {
            for db in &mut self.databases {
                db.unwatch_all(conn_id, &conn.watched_keys.iter().map(|(_, k)| k.clone()).collect::<Vec<_>>());
            }
            for b in &mut self.blocking {
                b.remove_conn(conn_id, &conn.block_keys);
            }
            if let Some(master) = &mut self.master {
                master.remove_slave(conn_id);
            }
        }
    }

    /// Entry point for one parsed request. Returns the bytes to write back
    /// to `conn_id` immediately (may be empty if the command blocked), plus
    /// any other connections that must be woken as a side effect.
    pub fn dispatch(&mut self, conn_id: u64, argv: Vec<Vec<u8>>) -> (Vec<u8>, Vec<Wakeup>) {
        let mut wakeups = Vec::new();
        let name = match std::str::from_utf8(&argv[0]) {
            Ok(s) => s.to_ascii_uppercase(),
            Err(_) => return (Reply::from(RedisError::Protocol("invalid command name".into())).to_bytes(), wakeups),
        };

        let Some(spec) = spec_for(&name) else {
            let reply = Reply::from(RedisError::UnknownCommand(name));
            return (reply.to_bytes(), wakeups);
        };
        if !check_arity(spec, argv.len()) {
            return (Reply::from(RedisError::WrongArity(name)).to_bytes(), wakeups);
        }

        // PSYNC's reply carries a raw RDB payload rather than a typed
        // `Reply`, so it bypasses the normal execute/encode path (§4.7
        // Full resync).
        if name == "PSYNC" {
            return (self.psync_bytes(conn_id, &argv), wakeups);
        }

        // Inside MULTI, everything except the control commands themselves
        // is queued rather than executed (§4.3).
        let in_transaction = self.conns.get(&conn_id).map(|c| c.in_transaction).unwrap_or(false);
        if in_transaction && spec.queueable && !matches!(name.as_str(), "MULTI" | "EXEC" | "DISCARD" | "WATCH" | "UNWATCH") {
            let conn = self.conns.get_mut(&conn_id).unwrap();
            conn.queued.push(QueuedCommand { argv, is_write: spec.write });
            return (Reply::Simple("QUEUED".into()).to_bytes(), wakeups);
        }

        let reply = self.execute(conn_id, &name, spec, argv, false, &mut wakeups);
        (reply.to_bytes(), wakeups)
    }

    fn execute(
        &mut self,
        conn_id: u64,
        name: &str,
        spec: &'static commands::CommandSpec,
        argv: Vec<Vec<u8>>,
        in_exec: bool,
        wakeups: &mut Vec<Wakeup>,
    ) -> Reply {
        let now = now_ms();

        match name {
            "MULTI" => {
                let conn = self.conns.get_mut(&conn_id).unwrap();
                if conn.in_transaction {
                    return Reply::from(RedisError::NestedMulti);
                }
                conn.in_transaction = true;
                conn.poisoned = false;
                conn.queued.clear();
                Reply::ok()
            }
            "DISCARD" => {
                let conn = self.conns.get_mut(&conn_id).unwrap();
                if !conn.in_transaction {
                    return Reply::from(RedisError::WithoutMulti("DISCARD".into()));
                }
                let watched = std::mem::take(&mut conn.watched_keys);
                conn.reset_transaction();
                self.unwatch_keys(conn_id, watched);
                Reply::ok()
            }
            "EXEC" => self.exec(conn_id, wakeups),
            "WATCH" => {
                let in_tx = self.conns.get(&conn_id).map(|c| c.in_transaction).unwrap_or(false);
                if in_tx {
                    return Reply::from(RedisError::Generic("WATCH inside MULTI is not allowed".into()));
                }
                for key in &argv[1..] {
                    let db_index = self.conns.get(&conn_id).unwrap().db_index;
                    self.databases[db_index].watch(key, conn_id);
                    self.conns.get_mut(&conn_id).unwrap().watched_keys.push((db_index, key.clone()));
                }
                Reply::ok()
            }
            "UNWATCH" => {
                let conn = self.conns.get_mut(&conn_id).unwrap();
                let watched = std::mem::take(&mut conn.watched_keys);
                conn.poisoned = false;
                self.unwatch_keys(conn_id, watched);
                Reply::ok()
            }

            "SELECT" => match parse_db_index(&argv[1], self.databases.len()) {
                Some(idx) => {
                    self.conns.get_mut(&conn_id).unwrap().db_index = idx;
                    Reply::ok()
                }
                None => Reply::from(RedisError::Generic("DB index is out of range".into())),
            },
            "MOVE" => self.move_key(conn_id, &argv),
            "FLUSHALL" => {
                for db in &mut self.databases {
                    db.flush();
                }
                self.after_write(&argv);
                Reply::ok()
            }

            "BLPOP" | "BRPOP" | "BRPOPLPUSH" => self.blocking_pop(conn_id, name, argv, now, in_exec, wakeups),

            "PING" => {
                if argv.len() > 1 {
                    Reply::from_bytes(argv[1].clone())
                } else {
                    Reply::Simple("PONG".into())
                }
            }
            "ECHO" => Reply::from_bytes(argv[1].clone()),
            "INFO" => Reply::from_string(self.info_text()),
            "CONFIG" => self.config_command(&argv),
            "SAVE" => self.save(),
            "BGSAVE" => self.save(), // foreground stand-in; see DESIGN.md
            "BGREWRITEAOF" => self.rewrite_aof(),
            "LASTSAVE" => Reply::Integer(self.last_save_ms / 1000),
            "SLAVEOF" => self.slaveof(&argv),
            "REPLCONF" => self.replconf(conn_id, &argv),
            "COMMAND" => self.command_introspection(),
            "SHUTDOWN" => {
                self.shutting_down = true;
                Reply::ok()
            }

            _ => {
                let db_index = self.conns.get(&conn_id).unwrap().db_index;
                self.run_on_db(db_index, now, name, spec, argv, wakeups)
            }
        }
    }

    /// Run a single-database command: expiry check, handler dispatch,
    /// empty-container cleanup, and write propagation.
    fn run_on_db(
        &mut self,
        db_index: usize,
        now: i64,
        name: &str,
        spec: &commands::CommandSpec,
        argv: Vec<Vec<u8>>,
        wakeups: &mut Vec<Wakeup>,
    ) -> Reply {
        let keys = command_keys(spec, &argv);
        let expired = self.databases[db_index].expire_keys_if_needed(&keys, now);
        self.propagate_expired(db_index, &expired);

        let result = commands::dispatch_on_db(&mut self.databases[db_index], now, name, &argv);
        let Some(result) = result else {
            return Reply::from(RedisError::UnknownCommand(name.to_string()));
        };
        match result {
            Ok((reply, mutated)) => {
                for key in &keys {
                    self.databases[db_index].drop_if_empty_container(key);
                    self.databases[db_index].touch_access(key, now);
                }
                if mutated {
                    self.touch_watchers(db_index, &keys);
                    for cmd in rewrite_for_propagation(name, &argv, now) {
                        self.after_write(&cmd);
                    }
                    self.maybe_evict(db_index, now);
                    if matches!(name, "LPUSH" | "RPUSH" | "LPUSHX" | "RPUSHX") {
                        self.serve_blocked_waiters(db_index, &argv[1], wakeups);
                    }
                }
                reply
            }
            Err(e) => Reply::from(e),
        }
    }

    /// §4.3 step 5: append to persistence + backlog, fan out to streaming
    /// slaves, poison any watchers already handled by `touch_watchers`.
    fn after_write(&mut self, argv: &[Vec<u8>]) {
        self.dirty += 1;
        self.append_log.append_command(argv);
        if let Some(master) = &mut self.master {
            let bytes = encode_request(argv);
            let targets = master.propagate(&bytes);
            for target in targets {
                if let Some(conn) = self.conns.get(&target) {
                    conn.send(bytes.clone());
                }
            }
        }
    }

    fn touch_watchers(&mut self, db_index: usize, keys: &[Vec<u8>]) {
        for key in keys {
            for watcher in self.databases[db_index].take_watchers(key) {
                if let Some(conn) = self.conns.get_mut(&watcher) {
                    conn.poisoned = true;
                }
            }
        }
    }

    fn propagate_expired(&mut self, db_index: usize, expired: &[Vec<u8>]) {
        for key in expired {
            self.touch_watchers(db_index, std::slice::from_ref(key));
            let del = vec![b"DEL".to_vec(), key.clone()];
            self.after_write(&del);
        }
    }

    fn maybe_evict(&mut self, db_index: usize, _now: i64) {
        let ceiling = self.config.get_usize("maxmemory", 0);
        if ceiling == 0 {
            return;
        }
        let policy = EvictionPolicy::from_str(&self.config.get_string("maxmemory-policy", "noeviction"));
        let evicted = eviction::evict_until_under_ceiling(&mut self.databases[db_index], policy, ceiling, &mut self.rng);
        for key in evicted {
            self.touch_watchers(db_index, std::slice::from_ref(&key));
            self.after_write(&[b"DEL".to_vec(), key]);
        }
    }

    fn unwatch_keys(&mut self, conn_id: u64, watched: Vec<(usize, Vec<u8>)>) {
        for (db_index, key) in watched {
            self.databases[db_index].unwatch_all(conn_id, std::slice::from_ref(&key));
        }
    }

    fn exec(&mut self, conn_id: u64, wakeups: &mut Vec<Wakeup>) -> Reply {
        let conn = self.conns.get_mut(&conn_id).unwrap();
        if !conn.in_transaction {
            return Reply::from(RedisError::WithoutMulti("EXEC".into()));
        }
        if conn.poisoned {
            let watched = std::mem::take(&mut conn.watched_keys);
            conn.reset_transaction();
            self.unwatch_keys(conn_id, watched);
            return Reply::from(RedisError::ExecAbort);
        }
        let queued = std::mem::take(&mut conn.queued);
        let watched = std::mem::take(&mut conn.watched_keys);
        conn.reset_transaction();
        self.unwatch_keys(conn_id, watched);

        // §4.3: a transaction with at least one write is bracketed in the
        // write log (and, via the same call, the replication backlog) by
        // MULTI/EXEC markers so a replaying slave or restarted server
        // re-applies the whole block atomically rather than interleaving
        // with anything else.
        let has_write = queued.iter().any(|c| c.is_write);
        if has_write {
            self.after_write(&[b"MULTI".to_vec()]);
        }

        let mut results = Vec::with_capacity(queued.len());
        for cmd in queued {
            let name = String::from_utf8_lossy(&cmd.argv[0]).to_ascii_uppercase();
            let Some(spec) = spec_for(&name) else {
                results.push(Reply::from(RedisError::UnknownCommand(name)));
                continue;
            };
            results.push(self.execute(conn_id, &name, spec, cmd.argv, true, wakeups));
        }
        if has_write {
            self.after_write(&[b"EXEC".to_vec()]);
        }
        Reply::Array(results)
    }

    fn move_key(&mut self, conn_id: u64, argv: &[Vec<u8>]) -> Reply {
        let Some(dest) = parse_db_index(&argv[2], self.databases.len()) else {
            return Reply::from(RedisError::Generic("DB index is out of range".into()));
        };
        let src = self.conns.get(&conn_id).unwrap().db_index;
        if src == dest {
            return Reply::from(RedisError::Generic("source and destination objects are the same".into()));
        }
        let key = &argv[1];
        if !self.databases[src].contains(key) || self.databases[dest].contains(key) {
            return Reply::Integer(0);
        }
        let expiry = self.databases[src].expiry_of(key);
        let value = self.databases[src].take(key).expect("checked contains above");
        self.databases[dest].insert(key.clone(), value);
        if let Some(deadline) = expiry {
            self.databases[dest].set_expiry(key, deadline);
        }
        self.after_write(argv);
        Reply::Integer(1)
    }

    fn blocking_pop(
        &mut self,
        conn_id: u64,
        name: &str,
        argv: Vec<Vec<u8>>,
        now: i64,
        in_exec: bool,
        wakeups: &mut Vec<Wakeup>,
    ) -> Reply {
        let db_index = self.conns.get(&conn_id).unwrap().db_index;
        let timeout_secs: f64 = match std::str::from_utf8(argv.last().unwrap()).ok().and_then(|s| s.parse().ok()) {
            Some(t) if t >= 0.0 => t,
            _ => return Reply::from(RedisError::InvalidTimeout),
        };
        // BRPOPLPUSH only ever waits on its source key; the destination is
        // a write target, not something it blocks on.
        let keys: &[Vec<u8>] = if name == "BRPOPLPUSH" { &argv[1..2] } else { &argv[1..argv.len() - 1] };

        // §4.4: a transaction can't yield, so a blocking pop running inside
        // EXEC degrades to its non-blocking counterpart — pop if something
        // is there, nil if not, never register a waiter.
        if in_exec {
            if name == "BRPOPLPUSH" {
                return match commands::lists::rpoplpush_move(&mut self.databases[db_index], &argv[1], &argv[2]) {
                    Ok(Some(item)) => {
                        self.after_write(&[b"RPOPLPUSH".to_vec(), argv[1].clone(), argv[2].clone()]);
                        Reply::from_bytes(item)
                    }
                    _ => Reply::NilBulk,
                };
            }
            let pop_left = name == "BLPOP";
            for key in keys {
                let popped = if pop_left {
                    commands::lists::pop_left(&mut self.databases[db_index], key)
                } else {
                    commands::lists::pop_right(&mut self.databases[db_index], key)
                };
                if let Ok(Some(item)) = popped {
                    let cmd_name = if pop_left { b"LPOP".to_vec() } else { b"RPOP".to_vec() };
                    self.after_write(&[cmd_name, key.clone()]);
                    return Reply::from_bytes(item);
                }
            }
            return Reply::NilBulk;
        }

        for key in keys {
            let popped = match name {
                "BRPOPLPUSH" => self.try_rpoplpush(db_index, &argv[1], &argv[2]),
                _ => self.try_list_pop(db_index, key, name == "BLPOP"),
            };
            if let Some(reply) = popped {
                self.after_write(&argv);
                return reply;
            }
        }

        let conn = self.conns.get_mut(&conn_id).unwrap();
        conn.blocked = true;
        conn.block_keys = keys.to_vec();
        conn.block_start_ms = now;
        conn.block_timeout_ms = (timeout_secs * 1000.0) as i64;
        conn.block_db = db_index;
        conn.block_pop_left = name == "BLPOP";
        conn.block_is_brpoplpush = name == "BRPOPLPUSH";
        conn.block_dest = if name == "BRPOPLPUSH" { Some(argv[2].clone()) } else { None };
        for key in keys {
            self.blocking[db_index].register(key, conn_id);
        }
        wakeups.clear(); // nothing to wake yet; this connection itself now waits.
        Reply::NilArray
    }

    /// §4.4: a write that adds list elements serves any parked
    /// BLPOP/BRPOP/BRPOPLPUSH waiters on that key synchronously, FIFO,
    /// before the writing command's own reply is sent. A single write
    /// with k new elements serves up to the first k waiters.
    fn serve_blocked_waiters(&mut self, db_index: usize, key: &[u8], wakeups: &mut Vec<Wakeup>) {
        loop {
            if !self.blocking[db_index].has_waiter(key) {
                break;
            }
            let has_elem = matches!(self.databases[db_index].get(key), Some(Value::List(l)) if !l.is_empty());
            if !has_elem {
                break;
            }
            let Some(waiter_id) = self.blocking[db_index].pop_waiter(key) else { break };
            let Some(conn) = self.conns.get(&waiter_id) else { continue };
            let is_brpoplpush = conn.block_is_brpoplpush;
            let pop_left = conn.block_pop_left;
            let dest = conn.block_dest.clone();
            let other_keys: Vec<Vec<u8>> = conn.block_keys.iter().filter(|k| k.as_slice() != key).cloned().collect();

            // §8's replay law and §5's in-order-propagation guarantee apply
            // to this pop exactly as to any other write: the master popped
            // an element here, so the log/backlog/slave stream must carry
            // that pop, not just the RPUSH/LPUSH that triggered it.
            let reply = if is_brpoplpush {
                let dest = dest.unwrap_or_default();
                match commands::lists::rpoplpush_move(&mut self.databases[db_index], key, &dest) {
                    Ok(Some(item)) => {
                        self.after_write(&[b"RPOPLPUSH".to_vec(), key.to_vec(), dest.clone()]);
                        Reply::from_bytes(item)
                    }
                    _ => Reply::NilBulk,
                }
            } else if pop_left {
                match commands::lists::pop_left(&mut self.databases[db_index], key) {
                    Ok(Some(item)) => {
                        self.after_write(&[b"LPOP".to_vec(), key.to_vec()]);
                        Reply::Array(vec![Reply::from_bytes(key.to_vec()), Reply::from_bytes(item)])
                    }
                    _ => Reply::NilArray,
                }
            } else {
                match commands::lists::pop_right(&mut self.databases[db_index], key) {
                    Ok(Some(item)) => {
                        self.after_write(&[b"RPOP".to_vec(), key.to_vec()]);
                        Reply::Array(vec![Reply::from_bytes(key.to_vec()), Reply::from_bytes(item)])
                    }
                    _ => Reply::NilArray,
                }
            };

            self.blocking[db_index].remove_conn(waiter_id, &other_keys);
            if let Some(conn) = self.conns.get_mut(&waiter_id) {
                conn.clear_block_state();
            }
            wakeups.push(Wakeup { conn_id: waiter_id, reply });
        }
    }

    fn try_list_pop(&mut self, db_index: usize, key: &[u8], from_left: bool) -> Option<Reply> {
        let db = &mut self.databases[db_index];
        let Some(Value::List(list)) = db.get_mut(key) else { return None };
        let popped = if from_left { list.pop_front() } else { list.pop_back() };
        let popped = popped?;
        db.drop_if_empty_container(key);
        Some(Reply::Array(vec![Reply::from_bytes(key.to_vec()), Reply::from_bytes(popped)]))
    }

    fn try_rpoplpush(&mut self, db_index: usize, src: &[u8], dest: &[u8]) -> Option<Reply> {
        let db = &mut self.databases[db_index];
        let Some(Value::List(list)) = db.get_mut(src) else { return None };
        let item = list.pop_back()?;
        db.drop_if_empty_container(src);
        db.entry_or_insert_with(dest, || Value::List(VecDeque::new()))
            .as_list_mut()
            .expect("just created as list")
            .push_front(item.clone());
        Some(Reply::from_bytes(item))
    }

    /// Drive the periodic tick (§5): blocking timeouts, expiry sweep,
    /// pending persistence work. Called by `server.rs` on an interval.
    pub fn tick(&mut self) -> Vec<Wakeup> {
        let now = now_ms();
        if self.append_log.policy() == FsyncPolicy::Always || self.append_log.should_fsync_every_sec((now / 1000) as u64) {
            self.aof_flush();
        }
        let mut wakeups = Vec::new();
        for db in &mut self.databases {
            let expired = db.sweep_expired(now);
            for key in &expired {
                for watcher in db.take_watchers(key) {
                    if let Some(conn) = self.conns.get_mut(&watcher) {
                        conn.poisoned = true;
                    }
                }
            }
            for key in expired {
                self.append_log.append_command(&[b"DEL".to_vec(), key]);
            }
        }
        let timed_out: Vec<u64> = self
            .conns
            .values()
            .filter(|c| c.blocked && c.block_timeout_ms > 0 && now - c.block_start_ms >= c.block_timeout_ms)
            .map(|c| c.id)
            .collect();
        for conn_id in timed_out {
            if let Some(conn) = self.conns.get_mut(&conn_id) {
                let keys = conn.block_keys.clone();
                let db_index = conn.block_db;
                conn.clear_block_state();
                self.blocking[db_index].remove_conn(conn_id, &keys);
                wakeups.push(Wakeup { conn_id, reply: Reply::NilArray });
            }
        }
        wakeups
    }

    /// §6 CLI surface: on SIGINT, flush whatever the append log is still
    /// holding and write a final RDB snapshot before the process exits.
    pub fn shutdown_persist(&mut self) {
        self.aof_flush();
        let _ = self.save();
    }

    /// Append whatever the in-memory AOF buffer is holding to the on-disk
    /// log (§4.6). Called from the periodic tick per `appendfsync` policy
    /// and once more on shutdown so nothing buffered since the last tick
    /// is lost.
    fn aof_flush(&mut self) {
        if !self.append_log.is_enabled() || self.append_log.is_empty() {
            return;
        }
        let path = self.aof_path();
        let policy = self.append_log.policy();
        let mut file = match std::fs::OpenOptions::new().create(true).append(true).open(&path) {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!(error = %e, "failed to open append log");
                return;
            }
        };
        if let Err(e) = self.append_log.flush_to(&mut file, |_| Ok(())) {
            tracing::warn!(error = %e, "failed to write append log");
            return;
        }
        if policy == FsyncPolicy::Always {
            let _ = file.sync_all();
        }
    }

    fn save(&mut self) -> Reply {
        let bytes = rdb::save(&self.databases);
        let path = self.snapshot_path();
        match std::fs::write(&path, bytes) {
            Ok(()) => {
                self.last_save_ms = now_ms();
                self.dirty = 0;
                Reply::ok()
            }
            Err(e) => Reply::from(RedisError::Persistence(e.to_string())),
        }
    }

    fn rewrite_aof(&mut self) -> Reply {
        self.append_log.begin_rewrite();
        let rewritten = crate::persistence::aof::rewrite(&self.databases);
        let size_before_tail = rewritten.len();
        let final_bytes = self.append_log.finish_rewrite(rewritten, size_before_tail);
        let path = self.aof_path();
        match std::fs::write(&path, final_bytes) {
            Ok(()) => Reply::ok(),
            Err(e) => Reply::from(RedisError::Persistence(e.to_string())),
        }
    }

    pub fn load_snapshot_if_present(&mut self) -> anyhow::Result<()> {
        let path = self.snapshot_path();
        if path.exists() {
            let bytes = std::fs::read(&path)?;
            self.load_snapshot_bytes(&bytes)?;
        }
        Ok(())
    }

    /// Replace every database with a decoded snapshot, used both for
    /// startup load and for applying the RDB body a `FULLRESYNC` hands the
    /// slave-side replication link (§4.7).
    pub fn load_snapshot_bytes(&mut self, bytes: &[u8]) -> anyhow::Result<()> {
        self.databases = rdb::load(bytes, self.config.databases(), now_ms())?;
        Ok(())
    }

    /// Replay the append log on startup (§4.6): re-dispatch every command
    /// it holds against freshly constructed databases, with persistence
    /// logging suspended so the replay doesn't re-append what it just read.
    pub fn replay_aof_if_present(&mut self) -> anyhow::Result<()> {
        let path = self.aof_path();
        if !path.exists() {
            return Ok(());
        }
        let bytes = std::fs::read(&path)?;
        let was_enabled = self.append_log.is_enabled();
        self.append_log.set_enabled(false);
        let mut pos = 0;
        while pos < bytes.len() {
            match crate::protocol::parse_request(&bytes[pos..])? {
                ParseOutcome::Complete { consumed, argv } => {
                    pos += consumed;
                    if !argv.is_empty() {
                        self.dispatch(REPLICA_CONN_ID, argv);
                    }
                }
                ParseOutcome::NeedMore => break,
            }
        }
        self.append_log.set_enabled(was_enabled);
        Ok(())
    }

    fn snapshot_path(&self) -> std::path::PathBuf {
        std::path::Path::new(&self.config.get_string("dir", ".")).join(self.config.get_string("dbfilename", "dump.rdb"))
    }

    fn aof_path(&self) -> std::path::PathBuf {
        std::path::Path::new(&self.config.get_string("dir", "."))
            .join(self.config.get_string("appendfilename", "appendonly.aof"))
    }

    fn info_text(&self) -> String {
        let role = if self.slave_link.is_some() { "slave" } else { "master" };
        format!(
            "# Server\r\nrun_id:{}\r\nrole:{}\r\nconnected_clients:{}\r\ndb_count:{}\r\n",
            self.run_id,
            role,
            self.conns.len(),
            self.databases.len()
        )
    }

    fn config_command(&mut self, argv: &[Vec<u8>]) -> Reply {
        let Some(sub) = argv.get(1).map(|s| s.to_ascii_uppercase()) else {
            return Reply::from(RedisError::Syntax);
        };
        match sub.as_slice() {
            b"GET" => {
                let Some(pattern) = argv.get(2) else { return Reply::from(RedisError::Syntax) };
                let pattern_str = String::from_utf8_lossy(pattern).to_string();
                let mut out = Vec::new();
                for (k, v) in self.config.all() {
                    if crate::util::glob_match(pattern_str.as_bytes(), k.as_bytes()) {
                        out.push(Reply::from_string(k.clone()));
                        out.push(Reply::from_string(v.clone()));
                    }
                }
                Reply::Array(out)
            }
            b"SET" => {
                let (Some(key), Some(value)) = (argv.get(2), argv.get(3)) else {
                    return Reply::from(RedisError::Syntax);
                };
                self.config.set(&String::from_utf8_lossy(key), &String::from_utf8_lossy(value));
                Reply::ok()
            }
            _ => Reply::from(RedisError::Syntax),
        }
    }

    fn slaveof(&mut self, argv: &[Vec<u8>]) -> Reply {
        let host = String::from_utf8_lossy(&argv[1]).to_string();
        let port_str = String::from_utf8_lossy(&argv[2]).to_string();
        if host.eq_ignore_ascii_case("no") && port_str.eq_ignore_ascii_case("one") {
            self.slave_link = None;
            return Reply::ok();
        }
        let Ok(port) = port_str.parse::<u16>() else { return Reply::from(RedisError::Syntax) };
        self.slave_link = Some(SlaveLink::new(host, port));
        Reply::ok()
    }

    /// §4.7 Full resync / partial resync: unlike every other command this
    /// writes its own raw bytes directly (a status line, optionally
    /// followed by a length-prefixed RDB payload or backlog slice) rather
    /// than going through `Reply`, since neither shape is a normal RESP
    /// reply type.
    fn psync_bytes(&mut self, conn_id: u64, argv: &[Vec<u8>]) -> Vec<u8> {
        let requested_runid = std::str::from_utf8(&argv[1]).ok().filter(|s| *s != "?");
        let requested_offset: u64 = std::str::from_utf8(&argv[2]).ok().and_then(|s| s.parse().ok()).unwrap_or(0);
        let Some(master) = &mut self.master else {
            return Reply::from(RedisError::Replication("not a master".into())).to_bytes();
        };
        match master.resolve_psync(requested_runid, requested_offset) {
            PsyncDecision::FullResync { run_id, offset } => {
                master.add_slave(conn_id);
                let snapshot = rdb::save(&self.databases);
                let mut out = format!("+FULLRESYNC {run_id} {offset}\r\n").into_bytes();
                out.extend_from_slice(format!("${}\r\n", snapshot.len()).as_bytes());
                out.extend_from_slice(&snapshot);
                if let Some(handle) = self.master.as_mut().unwrap().slaves.get_mut(&conn_id) {
                    handle.state = SlaveState::Streaming;
                }
                if let Some(conn) = self.conns.get_mut(&conn_id) {
                    conn.repl_role = ReplRole::ConnectedAsSlave;
                    conn.slave_streaming = true;
                }
                out
            }
            PsyncDecision::Continue { bytes } => {
                let master = self.master.as_mut().unwrap();
                match master.slaves.get_mut(&conn_id) {
                    Some(handle) => handle.state = SlaveState::Streaming,
                    None => {
                        master.add_slave(conn_id);
                        master.slaves.get_mut(&conn_id).unwrap().state = SlaveState::Streaming;
                    }
                }
                if let Some(conn) = self.conns.get_mut(&conn_id) {
                    conn.repl_role = ReplRole::ConnectedAsSlave;
                    conn.slave_streaming = true;
                }
                let mut out = b"+CONTINUE\r\n".to_vec();
                out.extend_from_slice(&bytes);
                out
            }
        }
    }

    fn replconf(&mut self, conn_id: u64, argv: &[Vec<u8>]) -> Reply {
        if argv.len() >= 3 && argv[1].eq_ignore_ascii_case(b"listening-port") {
            if let Ok(port) = String::from_utf8_lossy(&argv[2]).parse::<u16>() {
                if let Some(conn) = self.conns.get_mut(&conn_id) {
                    conn.slave_listening_port = Some(port);
                }
            }
            return Reply::ok();
        }
        if argv.len() >= 3 && argv[1].eq_ignore_ascii_case(b"ack") {
            if let Ok(offset) = String::from_utf8_lossy(&argv[2]).parse::<u64>() {
                if let Some(master) = &mut self.master {
                    master.on_ack(conn_id, offset, now_ms());
                }
            }
            return Reply::ok(); // REPLCONF ACK expects no reply in real protocol; harmless no-op here
        }
        Reply::ok()
    }

    fn command_introspection(&self) -> Reply {
        let out = commands::COMMAND_TABLE
            .iter()
            .map(|c| {
                Reply::Array(vec![
                    Reply::from_string(c.name.to_ascii_lowercase()),
                    Reply::Integer(c.arity as i64),
                ])
            })
            .collect();
        Reply::Array(out)
    }
}

impl Conn {
    pub fn repl_role(&self) -> ReplRole {
        self.repl_role
    }
}

fn parse_db_index(bytes: &[u8], num_databases: usize) -> Option<usize> {
    let idx: usize = std::str::from_utf8(bytes).ok()?.parse().ok()?;
    if idx < num_databases {
        Some(idx)
    } else {
        None
    }
}

fn generate_run_id() -> String {
    use rand::Rng;
    let mut rng = rand::rng();
    (0..40).map(|_| std::char::from_digit(rng.random_range(0..16), 16).unwrap()).collect()
}

/// Rewrite a just-executed write's argv into the form actually handed to
/// the append log and replication backlog (§4.6): EXPIRE/PEXPIRE collapse
/// to a single absolute-deadline PEXPIREAT, and a SET that carried EX/PX
/// splits into a bare SET plus a trailing PEXPIREAT. Both keep replay
/// idempotent under clock motion between the original execution and
/// whenever the log is replayed. Every other command propagates
/// unchanged. Returns one or more commands, in the order they must appear
/// in the log.
fn rewrite_for_propagation(name: &str, argv: &[Vec<u8>], now_ms: i64) -> Vec<Vec<Vec<u8>>> {
    match name {
        "EXPIRE" | "PEXPIRE" => match parse_i64(&argv[2]) {
            Some(n) => {
                let deadline = if name == "EXPIRE" { now_ms + n * 1000 } else { now_ms + n };
                vec![vec![b"PEXPIREAT".to_vec(), argv[1].clone(), deadline.to_string().into_bytes()]]
            }
            None => vec![argv.to_vec()],
        },
        "SET" => match set_expire_deadline(argv, now_ms) {
            Some(deadline) => vec![
                vec![b"SET".to_vec(), argv[1].clone(), argv[2].clone()],
                vec![b"PEXPIREAT".to_vec(), argv[1].clone(), deadline.to_string().into_bytes()],
            ],
            None => vec![argv.to_vec()],
        },
        _ => vec![argv.to_vec()],
    }
}

fn parse_i64(bytes: &[u8]) -> Option<i64> {
    std::str::from_utf8(bytes).ok()?.trim().parse().ok()
}

/// Scan a SET command's trailing options for EX/PX and compute the
/// absolute deadline it implies, if any.
fn set_expire_deadline(argv: &[Vec<u8>], now_ms: i64) -> Option<i64> {
    let mut i = 3;
    let mut deadline = None;
    while i < argv.len() {
        match argv[i].to_ascii_uppercase().as_slice() {
            b"EX" => {
                deadline = Some(now_ms + parse_i64(argv.get(i + 1)?)? * 1000);
                i += 2;
            }
            b"PX" => {
                deadline = Some(now_ms + parse_i64(argv.get(i + 1)?)?);
                i += 2;
            }
            _ => i += 1,
        }
    }
    deadline
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_engine() -> Engine {
        Engine::new(Config::default())
    }

    fn connect(engine: &mut Engine) -> (u64, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = engine.register_conn(tx);
        (id, rx)
    }

    #[test]
    fn ping_without_argument_replies_pong() {
        let mut engine = new_engine();
        let (id, _rx) = connect(&mut engine);
        let (bytes, _) = engine.dispatch(id, vec![b"PING".to_vec()]);
        assert_eq!(bytes, b"+PONG\r\n");
    }

    #[test]
    fn select_changes_connection_db_index() {
        let mut engine = new_engine();
        let (id, _rx) = connect(&mut engine);
        let (bytes, _) = engine.dispatch(id, vec![b"SELECT".to_vec(), b"2".to_vec()]);
        assert_eq!(bytes, b"+OK\r\n");
        assert_eq!(engine.conns.get(&id).unwrap().db_index, 2);
    }

    #[test]
    fn multi_queues_then_exec_runs_in_order() {
        let mut engine = new_engine();
        let (id, _rx) = connect(&mut engine);
        engine.dispatch(id, vec![b"MULTI".to_vec()]);
        let (q, _) = engine.dispatch(id, vec![b"SET".to_vec(), b"k".to_vec(), b"v".to_vec()]);
        assert_eq!(q, b"+QUEUED\r\n");
        let (bytes, _) = engine.dispatch(id, vec![b"EXEC".to_vec()]);
        assert_eq!(bytes, b"*1\r\n+OK\r\n");
        let (get_bytes, _) = engine.dispatch(id, vec![b"GET".to_vec(), b"k".to_vec()]);
        assert_eq!(get_bytes, b"$1\r\nv\r\n");
    }

    #[test]
    fn watch_then_external_write_poisons_transaction() {
        let mut engine = new_engine();
        let (a, _rxa) = connect(&mut engine);
        let (b, _rxb) = connect(&mut engine);
        engine.dispatch(a, vec![b"WATCH".to_vec(), b"k".to_vec()]);
        engine.dispatch(b, vec![b"SET".to_vec(), b"k".to_vec(), b"v".to_vec()]);
        engine.dispatch(a, vec![b"MULTI".to_vec()]);
        engine.dispatch(a, vec![b"GET".to_vec(), b"k".to_vec()]);
        let (bytes, _) = engine.dispatch(a, vec![b"EXEC".to_vec()]);
        assert_eq!(bytes, Reply::from(RedisError::ExecAbort).to_bytes());
    }

    #[test]
    fn blpop_on_empty_list_registers_waiter_and_blocks() {
        let mut engine = new_engine();
        let (id, _rx) = connect(&mut engine);
        let (bytes, _) = engine.dispatch(id, vec![b"BLPOP".to_vec(), b"q".to_vec(), b"0".to_vec()]);
        assert_eq!(bytes, Reply::NilArray.to_bytes());
        assert!(engine.conns.get(&id).unwrap().blocked);
        assert!(engine.blocking[0].has_waiter(b"q"));
    }

    #[test]
    fn move_transfers_key_between_databases() {
        let mut engine = new_engine();
        let (id, _rx) = connect(&mut engine);
        engine.dispatch(id, vec![b"SET".to_vec(), b"k".to_vec(), b"v".to_vec()]);
        let (bytes, _) = engine.dispatch(id, vec![b"MOVE".to_vec(), b"k".to_vec(), b"1".to_vec()]);
        assert_eq!(bytes, b":1\r\n");
        assert!(!engine.databases[0].contains(b"k"));
        assert!(engine.databases[1].contains(b"k"));
    }

    #[test]
    fn rpush_wakes_a_parked_blpop_waiter_synchronously() {
        let mut engine = new_engine();
        let (blocker, _rx_a) = connect(&mut engine);
        let (pusher, _rx_b) = connect(&mut engine);
        engine.dispatch(blocker, vec![b"BLPOP".to_vec(), b"q".to_vec(), b"0".to_vec()]);
        assert!(engine.conns.get(&blocker).unwrap().blocked);

        let (bytes, wakeups) = engine.dispatch(pusher, vec![b"RPUSH".to_vec(), b"q".to_vec(), b"hello".to_vec()]);
        assert_eq!(bytes, b":1\r\n");
        assert_eq!(wakeups.len(), 1);
        assert_eq!(wakeups[0].conn_id, blocker);
        assert_eq!(
            wakeups[0].reply,
            Reply::Array(vec![Reply::from_bytes(b"q".to_vec()), Reply::from_bytes(b"hello".to_vec())])
        );
        assert!(!engine.conns.get(&blocker).unwrap().blocked);
        assert!(!engine.databases[0].contains(b"q"));
    }

    #[test]
    fn brpoplpush_waiter_is_served_into_its_destination() {
        let mut engine = new_engine();
        let (blocker, _rx_a) = connect(&mut engine);
        let (pusher, _rx_b) = connect(&mut engine);
        engine.dispatch(blocker, vec![b"BRPOPLPUSH".to_vec(), b"src".to_vec(), b"dst".to_vec(), b"0".to_vec()]);
        engine.dispatch(pusher, vec![b"LPUSH".to_vec(), b"src".to_vec(), b"x".to_vec()]);

        let (bytes, _) = engine.dispatch(pusher, vec![b"LRANGE".to_vec(), b"dst".to_vec(), b"0".to_vec(), b"-1".to_vec()]);
        assert_eq!(bytes, b"*1\r\n$1\r\nx\r\n");
        assert!(!engine.conns.get(&blocker).unwrap().blocked);
    }

    #[test]
    fn two_waiters_on_one_key_are_served_fifo_by_one_multi_push() {
        let mut engine = new_engine();
        let (first, _rx_a) = connect(&mut engine);
        let (second, _rx_b) = connect(&mut engine);
        let (pusher, _rx_c) = connect(&mut engine);
        engine.dispatch(first, vec![b"BLPOP".to_vec(), b"q".to_vec(), b"0".to_vec()]);
        engine.dispatch(second, vec![b"BLPOP".to_vec(), b"q".to_vec(), b"0".to_vec()]);

        let (_, wakeups) = engine.dispatch(pusher, vec![b"RPUSH".to_vec(), b"q".to_vec(), b"a".to_vec(), b"b".to_vec()]);
        assert_eq!(wakeups.len(), 2);
        assert_eq!(wakeups[0].conn_id, first);
        assert_eq!(wakeups[1].conn_id, second);
    }
}
