//! The value store's command table and per-database dispatch (C2 §4.2).
//!
//! Commands that only ever touch one database are implemented as free
//! functions in the per-type modules below and routed through
//! `dispatch_on_db`. Commands that need the whole engine at once (SELECT,
//! MOVE, transactions, blocking pops, persistence, replication, server
//! introspection) are matched directly in `engine.rs`, which is the only
//! place that holds every database, every connection, and the background
//! subsystems simultaneously.

pub mod hashes;
pub mod keys;
pub mod lists;
pub mod sets;
pub mod sort;
pub mod strings;
pub mod zsets;

use crate::db::Database;
use crate::error::RedisError;
use crate::protocol::Reply;

/// One row of the command table: arity check plus the key-argument shape
/// used for expiry checks, watch-touch, and write propagation.
///
/// `arity` follows §4.2's convention literally: a non-negative value is a
/// *minimum* argument count (the command may take more, e.g. variadic
/// MSET); a negative value is an *exact* match of its absolute value.
#[derive(Debug, Clone, Copy)]
pub struct CommandSpec {
    pub name: &'static str,
    pub arity: i32,
    pub write: bool,
    /// Index of the first key argument, 0 if the command has none.
    pub first_key: i32,
    /// Index of the last key argument; -1 means "every key through the
    /// last argument" (variadic).
    pub last_key: i32,
    pub key_step: i32,
    /// Whether this command is queued inside MULTI rather than run inline.
    pub queueable: bool,
}

macro_rules! spec {
    ($name:expr, $arity:expr, $write:expr, $fk:expr, $lk:expr, $step:expr) => {
        CommandSpec {
            name: $name,
            arity: $arity,
            write: $write,
            first_key: $fk,
            last_key: $lk,
            key_step: $step,
            queueable: true,
        }
    };
    ($name:expr, $arity:expr, $write:expr, $fk:expr, $lk:expr, $step:expr, inline) => {
        CommandSpec {
            name: $name,
            arity: $arity,
            write: $write,
            first_key: $fk,
            last_key: $lk,
            key_step: $step,
            queueable: false,
        }
    };
}

pub const COMMAND_TABLE: &[CommandSpec] = &[
    // Strings
    spec!("GET", 2, false, 1, 1, 1),
    spec!("SET", -3, true, 1, 1, 1),
    spec!("SETNX", 3, true, 1, 1, 1),
    spec!("GETSET", 3, true, 1, 1, 1),
    spec!("STRLEN", 2, false, 1, 1, 1),
    spec!("APPEND", 3, true, 1, 1, 1),
    spec!("MSET", 3, true, 1, -1, 2),
    spec!("MGET", 2, false, 1, -1, 1),
    spec!("INCR", 2, true, 1, 1, 1),
    spec!("INCRBY", 3, true, 1, 1, 1),
    spec!("DECR", 2, true, 1, 1, 1),
    spec!("DECRBY", 3, true, 1, 1, 1),
    spec!("INCRBYFLOAT", 3, true, 1, 1, 1),
    spec!("SETRANGE", 4, true, 1, 1, 1),
    spec!("GETRANGE", 4, false, 1, 1, 1),
    // Lists
    spec!("LPUSH", 3, true, 1, 1, 1),
    spec!("LPUSHX", 3, true, 1, 1, 1),
    spec!("RPUSH", 3, true, 1, 1, 1),
    spec!("RPUSHX", 3, true, 1, 1, 1),
    spec!("LPOP", 2, true, 1, 1, 1),
    spec!("RPOP", 2, true, 1, 1, 1),
    spec!("RPOPLPUSH", 3, true, 1, 2, 1),
    spec!("LREM", 4, true, 1, 1, 1),
    spec!("LLEN", 2, false, 1, 1, 1),
    spec!("LINDEX", 3, false, 1, 1, 1),
    spec!("LSET", 4, true, 1, 1, 1),
    spec!("LRANGE", 4, false, 1, 1, 1),
    spec!("LTRIM", 4, true, 1, 1, 1),
    // Hashes
    spec!("HSET", 4, true, 1, 1, 1),
    spec!("HMSET", 4, true, 1, 1, 1),
    spec!("HSETNX", 4, true, 1, 1, 1),
    spec!("HGET", 3, false, 1, 1, 1),
    spec!("HEXISTS", 3, false, 1, 1, 1),
    spec!("HDEL", 3, true, 1, 1, 1),
    spec!("HLEN", 2, false, 1, 1, 1),
    spec!("HSTRLEN", 3, false, 1, 1, 1),
    spec!("HINCRBY", 4, true, 1, 1, 1),
    spec!("HMGET", 3, false, 1, 1, 1),
    spec!("HKEYS", 2, false, 1, 1, 1),
    spec!("HVALS", 2, false, 1, 1, 1),
    spec!("HGETALL", 2, false, 1, 1, 1),
    // Sets
    spec!("SADD", 3, true, 1, 1, 1),
    spec!("SISMEMBER", 3, false, 1, 1, 1),
    spec!("SPOP", 2, true, 1, 1, 1),
    spec!("SRANDMEMBER", 2, false, 1, 1, 1),
    spec!("SREM", 3, true, 1, 1, 1),
    spec!("SMOVE", 4, true, 1, 2, 1),
    spec!("SCARD", 2, false, 1, 1, 1),
    spec!("SMEMBERS", 2, false, 1, 1, 1),
    spec!("SINTER", 2, false, 1, -1, 1),
    spec!("SINTERSTORE", 3, true, 1, -1, 1),
    spec!("SUNION", 2, false, 1, -1, 1),
    spec!("SUNIONSTORE", 3, true, 1, -1, 1),
    // Sorted sets
    spec!("ZADD", 4, true, 1, 1, 1),
    spec!("ZSCORE", 3, false, 1, 1, 1),
    spec!("ZINCRBY", 4, true, 1, 1, 1),
    spec!("ZCARD", 2, false, 1, 1, 1),
    spec!("ZCOUNT", 4, false, 1, 1, 1),
    spec!("ZRANGE", 4, false, 1, 1, 1),
    spec!("ZREVRANGE", 4, false, 1, 1, 1),
    spec!("ZRANK", 3, false, 1, 1, 1),
    spec!("ZREVRANK", 3, false, 1, 1, 1),
    spec!("ZRANGEBYSCORE", 4, false, 1, 1, 1),
    spec!("ZREVRANGEBYSCORE", 4, false, 1, 1, 1),
    spec!("ZREM", 3, true, 1, 1, 1),
    spec!("ZREMRANGEBYRANK", 4, true, 1, 1, 1),
    spec!("ZREMRANGEBYSCORE", 4, true, 1, 1, 1),
    // Key-level
    spec!("EXISTS", 2, false, 1, -1, 1),
    spec!("TYPE", 2, false, 1, 1, 1),
    spec!("TTL", 2, false, 1, 1, 1),
    spec!("PTTL", 2, false, 1, 1, 1),
    spec!("EXPIRE", 3, true, 1, 1, 1),
    spec!("PEXPIRE", 3, true, 1, 1, 1),
    // Not part of the client-facing contract (§4.2): only ever reaches
    // dispatch via AOF replay or replication streaming, as the rewritten
    // absolute-deadline form of EXPIRE/PEXPIRE/SET EX|PX (§4.6).
    spec!("PEXPIREAT", 3, true, 1, 1, 1),
    spec!("PERSIST", 2, true, 1, 1, 1),
    spec!("DEL", 2, true, 1, -1, 1),
    spec!("KEYS", 2, false, 0, 0, 0),
    spec!("RENAME", 3, true, 1, 2, 1),
    spec!("RENAMENX", 3, true, 1, 2, 1),
    spec!("MOVE", 3, true, 1, 1, 1, inline),
    spec!("DBSIZE", 1, false, 0, 0, 0),
    spec!("SELECT", 2, false, 0, 0, 0, inline),
    spec!("FLUSHDB", 1, true, 0, 0, 0),
    spec!("FLUSHALL", 1, true, 0, 0, 0, inline),
    spec!("SORT", 2, false, 1, 1, 1),
    // Transactions
    spec!("MULTI", 1, false, 0, 0, 0, inline),
    spec!("EXEC", 1, false, 0, 0, 0, inline),
    spec!("DISCARD", 1, false, 0, 0, 0, inline),
    spec!("WATCH", 2, false, 1, -1, 1, inline),
    spec!("UNWATCH", 1, false, 0, 0, 0, inline),
    // Blocking list ops. Queueable: §4.3 requires MULTI to queue them like
    // any other data command; §4.4 then has EXEC degrade them to their
    // non-blocking counterparts rather than actually suspending.
    spec!("BLPOP", 3, true, 1, -2, 1),
    spec!("BRPOP", 3, true, 1, -2, 1),
    spec!("BRPOPLPUSH", 4, true, 1, 2, 1),
    // Server
    spec!("PING", 1, false, 0, 0, 0, inline),
    spec!("ECHO", 2, false, 0, 0, 0, inline),
    spec!("INFO", 1, false, 0, 0, 0, inline),
    spec!("CONFIG", 2, false, 0, 0, 0, inline),
    spec!("SAVE", 1, false, 0, 0, 0, inline),
    spec!("BGSAVE", 1, false, 0, 0, 0, inline),
    spec!("BGREWRITEAOF", 1, false, 0, 0, 0, inline),
    spec!("LASTSAVE", 1, false, 0, 0, 0, inline),
    spec!("SLAVEOF", 3, false, 0, 0, 0, inline),
    spec!("PSYNC", 3, false, 0, 0, 0, inline),
    spec!("REPLCONF", 2, false, 0, 0, 0, inline),
    spec!("COMMAND", 1, false, 0, 0, 0, inline),
    spec!("SHUTDOWN", 1, false, 0, 0, 0, inline),
];

pub fn spec_for(name: &str) -> Option<&'static CommandSpec> {
    COMMAND_TABLE.iter().find(|c| c.name == name)
}

pub fn check_arity(spec: &CommandSpec, argc: usize) -> bool {
    if spec.arity >= 0 {
        argc >= spec.arity as usize
    } else {
        argc == (-spec.arity) as usize
    }
}

/// Extract the declared key arguments of a command for expiry-checking
/// and watch-touch purposes (§4.2 step 3, §4.3).
pub fn command_keys(spec: &CommandSpec, argv: &[Vec<u8>]) -> Vec<Vec<u8>> {
    if spec.first_key == 0 {
        return Vec::new();
    }
    let first = spec.first_key as usize;
    let last = if spec.last_key < 0 { argv.len() as i64 + spec.last_key } else { spec.last_key as i64 };
    let last = last.max(0) as usize;
    let step = spec.key_step.max(1) as usize;
    let mut out = Vec::new();
    let mut i = first;
    while i <= last && i < argv.len() {
        out.push(argv[i].clone());
        i += step;
    }
    out
}

/// Dispatch a command known to touch only the current database. Returns
/// `None` for names engine.rs handles itself (cross-db or stateful
/// commands), so callers can fall through to that match.
pub fn dispatch_on_db(
    db: &mut Database,
    now_ms: i64,
    name: &str,
    argv: &[Vec<u8>],
) -> Option<Result<(Reply, bool), RedisError>> {
    use hashes::*;
    use keys::*;
    use lists::*;
    use sets::*;
    use strings::*;
    use zsets::*;

    Some(match name {
        "GET" => get(db, argv),
        "SET" => set(db, argv, now_ms),
        "SETNX" => setnx(db, argv),
        "GETSET" => getset(db, argv),
        "STRLEN" => strlen(db, argv),
        "APPEND" => append(db, argv),
        "MSET" => mset(db, argv),
        "MGET" => mget(db, argv),
        "INCR" => incr(db, argv),
        "INCRBY" => incrby(db, argv),
        "DECR" => decr(db, argv),
        "DECRBY" => decrby(db, argv),
        "INCRBYFLOAT" => incrbyfloat(db, argv),
        "SETRANGE" => setrange(db, argv),
        "GETRANGE" => getrange(db, argv),

        "LPUSH" => lpush(db, argv),
        "LPUSHX" => lpushx(db, argv),
        "RPUSH" => rpush(db, argv),
        "RPUSHX" => rpushx(db, argv),
        "LPOP" => lpop(db, argv),
        "RPOP" => rpop(db, argv),
        "RPOPLPUSH" => rpoplpush(db, argv),
        "LREM" => lrem(db, argv),
        "LLEN" => llen(db, argv),
        "LINDEX" => lindex(db, argv),
        "LSET" => lset(db, argv),
        "LRANGE" => lrange(db, argv),
        "LTRIM" => ltrim(db, argv),

        "HSET" => hset(db, argv),
        "HMSET" => hmset(db, argv),
        "HSETNX" => hsetnx(db, argv),
        "HGET" => hget(db, argv),
        "HEXISTS" => hexists(db, argv),
        "HDEL" => hdel(db, argv),
        "HLEN" => hlen(db, argv),
        "HSTRLEN" => hstrlen(db, argv),
        "HINCRBY" => hincrby(db, argv),
        "HMGET" => hmget(db, argv),
        "HKEYS" => hkeys(db, argv),
        "HVALS" => hvals(db, argv),
        "HGETALL" => hgetall(db, argv),

        "SADD" => sadd(db, argv),
        "SISMEMBER" => sismember(db, argv),
        "SPOP" => spop(db, argv),
        "SRANDMEMBER" => srandmember(db, argv),
        "SREM" => srem(db, argv),
        "SMOVE" => smove(db, argv),
        "SCARD" => scard(db, argv),
        "SMEMBERS" => smembers(db, argv),
        "SINTER" => sinter(db, argv),
        "SINTERSTORE" => sinterstore(db, argv),
        "SUNION" => sunion(db, argv),
        "SUNIONSTORE" => sunionstore(db, argv),

        "ZADD" => zadd(db, argv),
        "ZSCORE" => zscore(db, argv),
        "ZINCRBY" => zincrby(db, argv),
        "ZCARD" => zcard(db, argv),
        "ZCOUNT" => zcount(db, argv),
        "ZRANGE" => zrange(db, argv, false),
        "ZREVRANGE" => zrange(db, argv, true),
        "ZRANK" => zrank(db, argv, false),
        "ZREVRANK" => zrank(db, argv, true),
        "ZRANGEBYSCORE" => zrangebyscore(db, argv, false),
        "ZREVRANGEBYSCORE" => zrangebyscore(db, argv, true),
        "ZREM" => zrem(db, argv),
        "ZREMRANGEBYRANK" => zremrangebyrank(db, argv),
        "ZREMRANGEBYSCORE" => zremrangebyscore(db, argv),

        "EXISTS" => exists(db, argv),
        "TYPE" => key_type(db, argv),
        "TTL" => ttl(db, argv, now_ms),
        "PTTL" => pttl(db, argv, now_ms),
        "EXPIRE" => expire(db, argv, now_ms),
        "PEXPIRE" => pexpire(db, argv, now_ms),
        "PEXPIREAT" => pexpireat(db, argv),
        "PERSIST" => persist(db, argv),
        "DEL" => del(db, argv),
        "KEYS" => keys(db, argv),
        "RENAME" => rename(db, argv),
        "RENAMENX" => renamenx(db, argv),
        "DBSIZE" => dbsize(db, argv),
        "FLUSHDB" => flushdb(db, argv),

        "SORT" => match sort::sort(db, argv) {
            Ok((reply, mutated, store)) => {
                if let Some((dest, projection)) = store {
                    sort::store_projection(db, dest, projection);
                }
                Ok((reply, mutated))
            }
            Err(e) => Err(e),
        },

        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arity_check_follows_spec_convention() {
        let get = spec_for("GET").unwrap();
        assert!(!check_arity(get, 1));
        assert!(check_arity(get, 2));
        let mset = spec_for("MSET").unwrap();
        assert!(check_arity(mset, 5));
        assert!(!check_arity(mset, 2));
    }

    #[test]
    fn command_keys_handles_variadic_last_key() {
        let del = spec_for("DEL").unwrap();
        let argv = vec![b"DEL".to_vec(), b"a".to_vec(), b"b".to_vec(), b"c".to_vec()];
        assert_eq!(command_keys(del, &argv), vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn command_keys_handles_stepped_pairs() {
        let mset = spec_for("MSET").unwrap();
        let argv = vec![b"MSET".to_vec(), b"k1".to_vec(), b"v1".to_vec(), b"k2".to_vec(), b"v2".to_vec()];
        assert_eq!(command_keys(mset, &argv), vec![b"k1".to_vec(), b"k2".to_vec()]);
    }

    #[test]
    fn unknown_command_falls_through_to_engine() {
        let mut db = Database::new(0);
        assert!(dispatch_on_db(&mut db, 0, "SELECT", &[b"SELECT".to_vec(), b"1".to_vec()]).is_none());
    }
}
