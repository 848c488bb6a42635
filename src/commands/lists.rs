//! List command handlers (§4.2). The non-blocking pop primitives
//! (`pop_left`/`pop_right`) are reused directly by the blocking layer
//! (§4.4) both for BLPOP/BRPOP's immediate-data fast path and for serving
//! a parked waiter the moment a push supplies an element.

use crate::db::{clamp_range, Database};
use crate::error::RedisError;
use crate::protocol::Reply;
use crate::value::Value;
use std::collections::VecDeque;

pub type Outcome = Result<(Reply, bool), RedisError>;

fn parse_i64(bytes: &[u8]) -> Result<i64, RedisError> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.trim().parse::<i64>().ok())
        .ok_or(RedisError::NotAnInteger)
}

enum Side {
    Left,
    Right,
}

fn push(db: &mut Database, key: &[u8], values: &[Vec<u8>], side: Side, require_exists: bool) -> Outcome {
    if require_exists && !db.contains(key) {
        return Ok((Reply::Integer(0), false));
    }
    if db.contains(key) {
        db.get(key).unwrap().as_list()?;
    }
    let list = db.entry_or_insert_with(key, || Value::List(VecDeque::new())).as_list_mut()?;
    for v in values {
        match side {
            Side::Left => list.push_front(v.clone()),
            Side::Right => list.push_back(v.clone()),
        }
    }
    let len = list.len();
    Ok((Reply::Integer(len as i64), true))
}

pub fn lpush(db: &mut Database, argv: &[Vec<u8>]) -> Outcome {
    push(db, &argv[1], &argv[2..], Side::Left, false)
}

pub fn rpush(db: &mut Database, argv: &[Vec<u8>]) -> Outcome {
    push(db, &argv[1], &argv[2..], Side::Right, false)
}

pub fn lpushx(db: &mut Database, argv: &[Vec<u8>]) -> Outcome {
    push(db, &argv[1], &argv[2..], Side::Left, true)
}

pub fn rpushx(db: &mut Database, argv: &[Vec<u8>]) -> Outcome {
    push(db, &argv[1], &argv[2..], Side::Right, true)
}

/// Pop from the left (head) of `key`'s list, reestablishing the
/// empty-container invariant. Shared with BLPOP's wake path.
pub fn pop_left(db: &mut Database, key: &[u8]) -> Result<Option<Vec<u8>>, RedisError> {
    let Some(v) = db.get_mut(key) else { return Ok(None) };
    let list = v.as_list_mut()?;
    let popped = list.pop_front();
    db.drop_if_empty_container(key);
    Ok(popped)
}

pub fn pop_right(db: &mut Database, key: &[u8]) -> Result<Option<Vec<u8>>, RedisError> {
    let Some(v) = db.get_mut(key) else { return Ok(None) };
    let list = v.as_list_mut()?;
    let popped = list.pop_back();
    db.drop_if_empty_container(key);
    Ok(popped)
}

pub fn lpop(db: &mut Database, argv: &[Vec<u8>]) -> Outcome {
    match pop_left(db, &argv[1])? {
        Some(v) => Ok((Reply::from_bytes(v), true)),
        None => Ok((Reply::NilBulk, false)),
    }
}

pub fn rpop(db: &mut Database, argv: &[Vec<u8>]) -> Outcome {
    match pop_right(db, &argv[1])? {
        Some(v) => Ok((Reply::from_bytes(v), true)),
        None => Ok((Reply::NilBulk, false)),
    }
}

/// RPOPLPUSH's pure data-movement step, shared with BRPOPLPUSH's wake path.
pub fn rpoplpush_move(db: &mut Database, src: &[u8], dst: &[u8]) -> Result<Option<Vec<u8>>, RedisError> {
    if let Some(v) = db.get(dst) {
        v.as_list()?;
    }
    let Some(popped) = pop_right(db, src)? else { return Ok(None) };
    let dst_list = db.entry_or_insert_with(dst, || Value::List(VecDeque::new())).as_list_mut()?;
    dst_list.push_front(popped.clone());
    Ok(Some(popped))
}

pub fn rpoplpush(db: &mut Database, argv: &[Vec<u8>]) -> Outcome {
    match rpoplpush_move(db, &argv[1], &argv[2])? {
        Some(v) => Ok((Reply::from_bytes(v), true)),
        None => Ok((Reply::NilBulk, false)),
    }
}

pub fn llen(db: &mut Database, argv: &[Vec<u8>]) -> Outcome {
    let len = match db.get(&argv[1]) {
        Some(v) => v.as_list()?.len(),
        None => 0,
    };
    Ok((Reply::Integer(len as i64), false))
}

pub fn lindex(db: &mut Database, argv: &[Vec<u8>]) -> Outcome {
    let idx = parse_i64(&argv[2])?;
    let Some(v) = db.get(&argv[1]) else { return Ok((Reply::NilBulk, false)) };
    let list = v.as_list()?;
    let len = list.len() as i64;
    let real = if idx < 0 { idx + len } else { idx };
    if real < 0 || real >= len {
        return Ok((Reply::NilBulk, false));
    }
    Ok((Reply::from_bytes(list[real as usize].clone()), false))
}

pub fn lset(db: &mut Database, argv: &[Vec<u8>]) -> Outcome {
    let idx = parse_i64(&argv[2])?;
    let key = &argv[1];
    let Some(v) = db.get_mut(key) else {
        return Err(RedisError::Generic("no such key".into()));
    };
    let list = v.as_list_mut()?;
    let len = list.len() as i64;
    let real = if idx < 0 { idx + len } else { idx };
    if real < 0 || real >= len {
        return Err(RedisError::IndexOutOfRange);
    }
    list[real as usize] = argv[3].clone();
    Ok((Reply::ok(), true))
}

pub fn lrange(db: &mut Database, argv: &[Vec<u8>]) -> Outcome {
    let start = parse_i64(&argv[2])?;
    let stop = parse_i64(&argv[3])?;
    let Some(v) = db.get(&argv[1]) else { return Ok((Reply::Array(vec![]), false)) };
    let list = v.as_list()?;
    let Some((lo, hi)) = clamp_range(start, stop, list.len() as i64) else {
        return Ok((Reply::Array(vec![]), false));
    };
    let out = list.iter().skip(lo).take(hi - lo + 1).cloned().map(Reply::from_bytes).collect();
    Ok((Reply::Array(out), false))
}

pub fn ltrim(db: &mut Database, argv: &[Vec<u8>]) -> Outcome {
    let start = parse_i64(&argv[2])?;
    let stop = parse_i64(&argv[3])?;
    let key = &argv[1];
    let Some(v) = db.get_mut(key) else { return Ok((Reply::ok(), false)) };
    let list = v.as_list_mut()?;
    match clamp_range(start, stop, list.len() as i64) {
        Some((lo, hi)) => {
            let trimmed: VecDeque<Vec<u8>> = list.iter().skip(lo).take(hi - lo + 1).cloned().collect();
            *list = trimmed;
        }
        None => list.clear(),
    }
    db.drop_if_empty_container(key);
    Ok((Reply::ok(), true))
}

pub fn lrem(db: &mut Database, argv: &[Vec<u8>]) -> Outcome {
    let count = parse_i64(&argv[2])?;
    let target = &argv[3];
    let key = &argv[1];
    let Some(v) = db.get_mut(key) else { return Ok((Reply::Integer(0), false)) };
    let list = v.as_list_mut()?;
    let mut removed = 0i64;
    if count > 0 {
        let mut kept = VecDeque::with_capacity(list.len());
        for item in list.drain(..) {
            if removed < count && &item == target {
                removed += 1;
            } else {
                kept.push_back(item);
            }
        }
        *list = kept;
    } else if count < 0 {
        let limit = -count;
        let mut kept: VecDeque<Vec<u8>> = VecDeque::with_capacity(list.len());
        for item in list.drain(..).rev() {
            if removed < limit && &item == target {
                removed += 1;
            } else {
                kept.push_front(item);
            }
        }
        *list = kept;
    } else {
        let before = list.len();
        list.retain(|item| item != target);
        removed = (before - list.len()) as i64;
    }
    db.drop_if_empty_container(key);
    Ok((Reply::Integer(removed), removed > 0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db() -> Database {
        Database::new(0)
    }

    #[test]
    fn rpush_then_lrange_preserves_order() {
        let mut d = db();
        rpush(&mut d, &[b"RPUSH".to_vec(), b"q".to_vec(), b"a".to_vec(), b"b".to_vec()]).unwrap();
        let (r, _) = lrange(&mut d, &[b"LRANGE".to_vec(), b"q".to_vec(), b"0".to_vec(), b"-1".to_vec()]).unwrap();
        assert_eq!(r, Reply::Array(vec![Reply::from_bytes(b"a".to_vec()), Reply::from_bytes(b"b".to_vec())]));
    }

    #[test]
    fn lpop_empties_and_removes_container() {
        let mut d = db();
        lpush(&mut d, &[b"LPUSH".to_vec(), b"q".to_vec(), b"a".to_vec()]).unwrap();
        lpop(&mut d, &[b"LPOP".to_vec(), b"q".to_vec()]).unwrap();
        assert!(!d.contains(b"q"));
    }

    #[test]
    fn lrem_negative_count_removes_from_tail() {
        let mut d = db();
        rpush(&mut d, &[b"RPUSH".to_vec(), b"q".to_vec(), b"a".to_vec(), b"b".to_vec(), b"a".to_vec()]).unwrap();
        let (r, _) = lrem(&mut d, &[b"LREM".to_vec(), b"q".to_vec(), b"-1".to_vec(), b"a".to_vec()]).unwrap();
        assert_eq!(r, Reply::Integer(1));
        let (r, _) = lrange(&mut d, &[b"LRANGE".to_vec(), b"q".to_vec(), b"0".to_vec(), b"-1".to_vec()]).unwrap();
        assert_eq!(r, Reply::Array(vec![Reply::from_bytes(b"a".to_vec()), Reply::from_bytes(b"b".to_vec())]));
    }

    #[test]
    fn rpoplpush_moves_single_element() {
        let mut d = db();
        rpush(&mut d, &[b"RPUSH".to_vec(), b"src".to_vec(), b"x".to_vec()]).unwrap();
        let (r, _) = rpoplpush(&mut d, &[b"RPOPLPUSH".to_vec(), b"src".to_vec(), b"dst".to_vec()]).unwrap();
        assert_eq!(r, Reply::from_bytes(b"x".to_vec()));
        assert!(!d.contains(b"src"));
        let (r, _) = lrange(&mut d, &[b"LRANGE".to_vec(), b"dst".to_vec(), b"0".to_vec(), b"-1".to_vec()]).unwrap();
        assert_eq!(r, Reply::Array(vec![Reply::from_bytes(b"x".to_vec())]));
    }
}
