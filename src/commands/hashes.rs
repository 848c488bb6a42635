//! Hash command handlers (§4.2).

use crate::db::Database;
use crate::error::RedisError;
use crate::protocol::Reply;
use crate::value::Value;
use std::collections::HashMap;

pub type Outcome = Result<(Reply, bool), RedisError>;

fn parse_i64(bytes: &[u8]) -> Result<i64, RedisError> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.trim().parse::<i64>().ok())
        .ok_or(RedisError::NotAnInteger)
}

pub fn hset(db: &mut Database, argv: &[Vec<u8>]) -> Outcome {
    if (argv.len() - 2) % 2 != 0 || argv.len() < 4 {
        return Err(RedisError::Generic("wrong number of arguments for HSET".into()));
    }
    let key = &argv[1];
    let hash = db.entry_or_insert_with(key, || Value::Hash(HashMap::new())).as_hash_mut()?;
    let mut added = 0i64;
    for pair in argv[2..].chunks(2) {
        if hash.insert(pair[0].clone(), pair[1].clone()).is_none() {
            added += 1;
        }
    }
    Ok((Reply::Integer(added), true))
}

pub fn hmset(db: &mut Database, argv: &[Vec<u8>]) -> Outcome {
    let (reply, mutated) = hset(db, argv)?;
    let _ = reply;
    Ok((Reply::ok(), mutated))
}

pub fn hsetnx(db: &mut Database, argv: &[Vec<u8>]) -> Outcome {
    let key = &argv[1];
    let hash = db.entry_or_insert_with(key, || Value::Hash(HashMap::new())).as_hash_mut()?;
    if hash.contains_key(&argv[2]) {
        return Ok((Reply::Integer(0), false));
    }
    hash.insert(argv[2].clone(), argv[3].clone());
    Ok((Reply::Integer(1), true))
}

pub fn hget(db: &mut Database, argv: &[Vec<u8>]) -> Outcome {
    let reply = match db.get(&argv[1]) {
        Some(v) => v.as_hash()?.get(&argv[2]).cloned().map(Reply::from_bytes).unwrap_or(Reply::NilBulk),
        None => Reply::NilBulk,
    };
    Ok((reply, false))
}

pub fn hexists(db: &mut Database, argv: &[Vec<u8>]) -> Outcome {
    let exists = match db.get(&argv[1]) {
        Some(v) => v.as_hash()?.contains_key(&argv[2]),
        None => false,
    };
    Ok((Reply::Integer(exists as i64), false))
}

pub fn hdel(db: &mut Database, argv: &[Vec<u8>]) -> Outcome {
    let key = &argv[1];
    let Some(v) = db.get_mut(key) else { return Ok((Reply::Integer(0), false)) };
    let hash = v.as_hash_mut()?;
    let mut removed = 0i64;
    for field in &argv[2..] {
        if hash.remove(field).is_some() {
            removed += 1;
        }
    }
    db.drop_if_empty_container(key);
    Ok((Reply::Integer(removed), removed > 0))
}

pub fn hlen(db: &mut Database, argv: &[Vec<u8>]) -> Outcome {
    let len = match db.get(&argv[1]) {
        Some(v) => v.as_hash()?.len(),
        None => 0,
    };
    Ok((Reply::Integer(len as i64), false))
}

pub fn hstrlen(db: &mut Database, argv: &[Vec<u8>]) -> Outcome {
    let len = match db.get(&argv[1]) {
        Some(v) => v.as_hash()?.get(&argv[2]).map(|s| s.len()).unwrap_or(0),
        None => 0,
    };
    Ok((Reply::Integer(len as i64), false))
}

pub fn hincrby(db: &mut Database, argv: &[Vec<u8>]) -> Outcome {
    let delta = parse_i64(&argv[3])?;
    let key = &argv[1];
    let hash = db.entry_or_insert_with(key, || Value::Hash(HashMap::new())).as_hash_mut()?;
    let current = match hash.get(&argv[2]) {
        Some(v) => parse_i64(v)?,
        None => 0,
    };
    let next = current.checked_add(delta).ok_or(RedisError::NotAnInteger)?;
    hash.insert(argv[2].clone(), next.to_string().into_bytes());
    Ok((Reply::Integer(next), true))
}

pub fn hmget(db: &mut Database, argv: &[Vec<u8>]) -> Outcome {
    let hash = match db.get(&argv[1]) {
        Some(v) => Some(v.as_hash()?),
        None => None,
    };
    let out = argv[2..]
        .iter()
        .map(|f| {
            hash.and_then(|h| h.get(f)).cloned().map(Reply::from_bytes).unwrap_or(Reply::NilBulk)
        })
        .collect();
    Ok((Reply::Array(out), false))
}

pub fn hkeys(db: &mut Database, argv: &[Vec<u8>]) -> Outcome {
    let out = match db.get(&argv[1]) {
        Some(v) => v.as_hash()?.keys().cloned().map(Reply::from_bytes).collect(),
        None => vec![],
    };
    Ok((Reply::Array(out), false))
}

pub fn hvals(db: &mut Database, argv: &[Vec<u8>]) -> Outcome {
    let out = match db.get(&argv[1]) {
        Some(v) => v.as_hash()?.values().cloned().map(Reply::from_bytes).collect(),
        None => vec![],
    };
    Ok((Reply::Array(out), false))
}

pub fn hgetall(db: &mut Database, argv: &[Vec<u8>]) -> Outcome {
    let mut out = Vec::new();
    if let Some(v) = db.get(&argv[1]) {
        for (k, val) in v.as_hash()? {
            out.push(Reply::from_bytes(k.clone()));
            out.push(Reply::from_bytes(val.clone()));
        }
    }
    Ok((Reply::Array(out), false))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db() -> Database {
        Database::new(0)
    }

    #[test]
    fn hset_counts_only_new_fields() {
        let mut d = db();
        let (r, _) = hset(&mut d, &[b"HSET".to_vec(), b"h".to_vec(), b"f".to_vec(), b"1".to_vec()]).unwrap();
        assert_eq!(r, Reply::Integer(1));
        let (r, _) = hset(&mut d, &[b"HSET".to_vec(), b"h".to_vec(), b"f".to_vec(), b"2".to_vec()]).unwrap();
        assert_eq!(r, Reply::Integer(0));
    }

    #[test]
    fn hdel_removes_container_when_last_field_gone() {
        let mut d = db();
        hset(&mut d, &[b"HSET".to_vec(), b"h".to_vec(), b"f".to_vec(), b"1".to_vec()]).unwrap();
        hdel(&mut d, &[b"HDEL".to_vec(), b"h".to_vec(), b"f".to_vec()]).unwrap();
        assert!(!d.contains(b"h"));
    }

    #[test]
    fn hincrby_on_missing_field_starts_at_zero() {
        let mut d = db();
        let (r, _) = hincrby(&mut d, &[b"HINCRBY".to_vec(), b"h".to_vec(), b"f".to_vec(), b"5".to_vec()]).unwrap();
        assert_eq!(r, Reply::Integer(5));
    }
}
