//! Key-level command handlers (§4.2) that operate within a single
//! database. Cross-database commands (MOVE, SELECT, FLUSHALL) and
//! server-wide commands live in `engine.rs`, which has access to every
//! database at once.

use crate::db::Database;
use crate::error::RedisError;
use crate::protocol::Reply;
use crate::util::glob_match;

pub type Outcome = Result<(Reply, bool), RedisError>;

fn parse_i64(bytes: &[u8]) -> Result<i64, RedisError> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.trim().parse::<i64>().ok())
        .ok_or(RedisError::NotAnInteger)
}

pub fn exists(db: &mut Database, argv: &[Vec<u8>]) -> Outcome {
    let count = argv[1..].iter().filter(|k| db.contains(k)).count();
    Ok((Reply::Integer(count as i64), false))
}

pub fn key_type(db: &mut Database, argv: &[Vec<u8>]) -> Outcome {
    let reply = match db.get(&argv[1]) {
        Some(v) => Reply::Simple(v.type_tag().as_str().to_string()),
        None => Reply::Simple("none".to_string()),
    };
    Ok((reply, false))
}

pub fn ttl(db: &mut Database, argv: &[Vec<u8>], now_ms: i64) -> Outcome {
    if !db.contains(&argv[1]) {
        return Ok((Reply::Integer(-2), false));
    }
    let reply = match db.expiry_of(&argv[1]) {
        Some(deadline) => Reply::Integer(((deadline - now_ms).max(0) + 999) / 1000),
        None => Reply::Integer(-1),
    };
    Ok((reply, false))
}

pub fn pttl(db: &mut Database, argv: &[Vec<u8>], now_ms: i64) -> Outcome {
    if !db.contains(&argv[1]) {
        return Ok((Reply::Integer(-2), false));
    }
    let reply = match db.expiry_of(&argv[1]) {
        Some(deadline) => Reply::Integer((deadline - now_ms).max(0)),
        None => Reply::Integer(-1),
    };
    Ok((reply, false))
}

fn expire_at(db: &mut Database, key: &[u8], deadline_ms: i64) -> Outcome {
    if !db.contains(key) {
        return Ok((Reply::Integer(0), false));
    }
    db.set_expiry(key, deadline_ms);
    Ok((Reply::Integer(1), true))
}

pub fn expire(db: &mut Database, argv: &[Vec<u8>], now_ms: i64) -> Outcome {
    let secs = parse_i64(&argv[2])?;
    expire_at(db, &argv[1], now_ms + secs * 1000)
}

pub fn pexpire(db: &mut Database, argv: &[Vec<u8>], now_ms: i64) -> Outcome {
    let ms = parse_i64(&argv[2])?;
    expire_at(db, &argv[1], now_ms + ms)
}

/// Set an expiry directly from an absolute millisecond deadline. Not a
/// client-facing command in its own right: it's the form EXPIRE, PEXPIRE
/// and SET's EX/PX options are rewritten into before hitting the append
/// log or replication stream, so replay is idempotent under clock motion
/// (§4.6). A deadline already in the past is accepted here too: the next
/// expiry check simply deletes the key, matching how a freshly loaded
/// snapshot drops an already-expired pending key.
pub fn pexpireat(db: &mut Database, argv: &[Vec<u8>]) -> Outcome {
    let deadline = parse_i64(&argv[2])?;
    expire_at(db, &argv[1], deadline)
}

pub fn persist(db: &mut Database, argv: &[Vec<u8>]) -> Outcome {
    let cleared = db.clear_expiry(&argv[1]);
    Ok((Reply::Integer(cleared as i64), cleared))
}

pub fn del(db: &mut Database, argv: &[Vec<u8>]) -> Outcome {
    let mut removed = 0i64;
    for key in &argv[1..] {
        if db.remove(key) {
            removed += 1;
        }
    }
    Ok((Reply::Integer(removed), removed > 0))
}

pub fn keys(db: &mut Database, argv: &[Vec<u8>]) -> Outcome {
    let pattern = &argv[1];
    let out = db
        .keys()
        .filter(|k| glob_match(pattern, k))
        .cloned()
        .map(Reply::from_bytes)
        .collect();
    Ok((Reply::Array(out), false))
}

pub fn rename(db: &mut Database, argv: &[Vec<u8>]) -> Outcome {
    if !db.contains(&argv[1]) {
        return Err(RedisError::Generic("no such key".into()));
    }
    db.rename_key(&argv[1], argv[2].clone());
    Ok((Reply::ok(), true))
}

pub fn renamenx(db: &mut Database, argv: &[Vec<u8>]) -> Outcome {
    if !db.contains(&argv[1]) {
        return Err(RedisError::Generic("no such key".into()));
    }
    if db.contains(&argv[2]) {
        return Ok((Reply::Integer(0), false));
    }
    db.rename_key(&argv[1], argv[2].clone());
    Ok((Reply::Integer(1), true))
}

pub fn dbsize(db: &mut Database, _argv: &[Vec<u8>]) -> Outcome {
    Ok((Reply::Integer(db.len() as i64), false))
}

pub fn flushdb(db: &mut Database, _argv: &[Vec<u8>]) -> Outcome {
    db.flush();
    Ok((Reply::ok(), true))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn db() -> Database {
        Database::new(0)
    }

    #[test]
    fn ttl_reports_minus_two_for_missing_key() {
        let mut d = db();
        let (r, _) = ttl(&mut d, &[b"TTL".to_vec(), b"nope".to_vec()], 0).unwrap();
        assert_eq!(r, Reply::Integer(-2));
    }

    #[test]
    fn ttl_reports_minus_one_without_expiry() {
        let mut d = db();
        d.insert(b"k".to_vec(), Value::String(b"v".to_vec()));
        let (r, _) = ttl(&mut d, &[b"TTL".to_vec(), b"k".to_vec()], 0).unwrap();
        assert_eq!(r, Reply::Integer(-1));
    }

    #[test]
    fn rename_moves_value_and_expiry() {
        let mut d = db();
        d.insert(b"a".to_vec(), Value::String(b"v".to_vec()));
        d.set_expiry(b"a", 500);
        rename(&mut d, &[b"RENAME".to_vec(), b"a".to_vec(), b"b".to_vec()]).unwrap();
        assert!(!d.contains(b"a"));
        assert_eq!(d.expiry_of(b"b"), Some(500));
    }

    #[test]
    fn keys_glob_filters_by_star_pattern() {
        let mut d = db();
        d.insert(b"user:1".to_vec(), Value::String(b"v".to_vec()));
        d.insert(b"session:1".to_vec(), Value::String(b"v".to_vec()));
        let (r, _) = keys(&mut d, &[b"KEYS".to_vec(), b"user:*".to_vec()]).unwrap();
        assert_eq!(r, Reply::Array(vec![Reply::from_bytes(b"user:1".to_vec())]));
    }
}
