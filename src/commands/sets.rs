//! Set command handlers (§4.2). Multi-set operations pick the smallest
//! input set and probe the rest, as specified.

use crate::db::Database;
use crate::error::RedisError;
use crate::protocol::Reply;
use crate::value::Value;
use rand::seq::IteratorRandom;
use rand::Rng;
use std::collections::HashSet;

pub type Outcome = Result<(Reply, bool), RedisError>;

pub fn sadd(db: &mut Database, argv: &[Vec<u8>]) -> Outcome {
    let key = &argv[1];
    let set = db.entry_or_insert_with(key, || Value::Set(HashSet::new())).as_set_mut()?;
    let mut added = 0i64;
    for member in &argv[2..] {
        if set.insert(member.clone()) {
            added += 1;
        }
    }
    Ok((Reply::Integer(added), added > 0))
}

pub fn sismember(db: &mut Database, argv: &[Vec<u8>]) -> Outcome {
    let is_member = match db.get(&argv[1]) {
        Some(v) => v.as_set()?.contains(&argv[2]),
        None => false,
    };
    Ok((Reply::Integer(is_member as i64), false))
}

pub fn spop(db: &mut Database, argv: &[Vec<u8>]) -> Outcome {
    let key = &argv[1];
    let Some(v) = db.get_mut(key) else { return Ok((Reply::NilBulk, false)) };
    let set = v.as_set_mut()?;
    let Some(member) = set.iter().choose(&mut rand::rng()).cloned() else {
        return Ok((Reply::NilBulk, false));
    };
    set.remove(&member);
    db.drop_if_empty_container(key);
    Ok((Reply::from_bytes(member), true))
}

pub fn srandmember(db: &mut Database, argv: &[Vec<u8>]) -> Outcome {
    let Some(v) = db.get(&argv[1]) else {
        return Ok((if argv.len() > 2 { Reply::Array(vec![]) } else { Reply::NilBulk }, false));
    };
    let set = v.as_set()?;
    let members: Vec<&Vec<u8>> = set.iter().collect();
    if argv.len() == 2 {
        let Some(m) = members.iter().choose(&mut rand::rng()) else {
            return Ok((Reply::NilBulk, false));
        };
        return Ok((Reply::from_bytes((*m).clone()), false));
    }
    let count: i64 = std::str::from_utf8(&argv[2])
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(RedisError::NotAnInteger)?;
    let mut rng = rand::rng();
    let out: Vec<Reply> = if count >= 0 {
        let n = (count as usize).min(members.len());
        members.into_iter().choose_multiple(&mut rng, n).into_iter().map(|m| Reply::from_bytes(m.clone())).collect()
    } else {
        let n = (-count) as usize;
        if members.is_empty() {
            vec![]
        } else {
            (0..n).map(|_| Reply::from_bytes(members[rng.random_range(0..members.len())].clone())).collect()
        }
    };
    Ok((Reply::Array(out), false))
}

pub fn srem(db: &mut Database, argv: &[Vec<u8>]) -> Outcome {
    let key = &argv[1];
    let Some(v) = db.get_mut(key) else { return Ok((Reply::Integer(0), false)) };
    let set = v.as_set_mut()?;
    let mut removed = 0i64;
    for member in &argv[2..] {
        if set.remove(member) {
            removed += 1;
        }
    }
    db.drop_if_empty_container(key);
    Ok((Reply::Integer(removed), removed > 0))
}

pub fn smove(db: &mut Database, argv: &[Vec<u8>]) -> Outcome {
    let (src, dst, member) = (&argv[1], &argv[2], &argv[3]);
    if let Some(v) = db.get(dst) {
        v.as_set()?;
    }
    let removed = match db.get_mut(src) {
        Some(v) => v.as_set_mut()?.remove(member),
        None => false,
    };
    if !removed {
        return Ok((Reply::Integer(0), false));
    }
    db.drop_if_empty_container(src);
    db.entry_or_insert_with(dst, || Value::Set(HashSet::new())).as_set_mut()?.insert(member.clone());
    Ok((Reply::Integer(1), true))
}

pub fn scard(db: &mut Database, argv: &[Vec<u8>]) -> Outcome {
    let len = match db.get(&argv[1]) {
        Some(v) => v.as_set()?.len(),
        None => 0,
    };
    Ok((Reply::Integer(len as i64), false))
}

pub fn smembers(db: &mut Database, argv: &[Vec<u8>]) -> Outcome {
    let out = match db.get(&argv[1]) {
        Some(v) => v.as_set()?.iter().cloned().map(Reply::from_bytes).collect(),
        None => vec![],
    };
    Ok((Reply::Array(out), false))
}

fn collect_sets<'a>(db: &'a Database, keys: &[Vec<u8>]) -> Result<Vec<&'a HashSet<Vec<u8>>>, RedisError> {
    let mut out = Vec::with_capacity(keys.len());
    for k in keys {
        match db.get(k) {
            Some(v) => out.push(v.as_set()?),
            None => out.push(EMPTY_SET.get_or_init(HashSet::new)),
        }
    }
    Ok(out)
}

static EMPTY_SET: std::sync::OnceLock<HashSet<Vec<u8>>> = std::sync::OnceLock::new();

/// Intersect all sets, picking the smallest as the probe base (§4.2).
fn intersect(sets: &[&HashSet<Vec<u8>>]) -> HashSet<Vec<u8>> {
    if sets.is_empty() || sets.iter().any(|s| s.is_empty()) {
        return HashSet::new();
    }
    let (smallest_idx, _) = sets.iter().enumerate().min_by_key(|(_, s)| s.len()).unwrap();
    sets[smallest_idx]
        .iter()
        .filter(|m| sets.iter().enumerate().all(|(i, s)| i == smallest_idx || s.contains(*m)))
        .cloned()
        .collect()
}

fn union(sets: &[&HashSet<Vec<u8>>]) -> HashSet<Vec<u8>> {
    let mut out = HashSet::new();
    for s in sets {
        out.extend(s.iter().cloned());
    }
    out
}

pub fn sinter(db: &mut Database, argv: &[Vec<u8>]) -> Outcome {
    let sets = collect_sets(db, &argv[1..])?;
    let result = intersect(&sets);
    Ok((Reply::Array(result.into_iter().map(Reply::from_bytes).collect()), false))
}

pub fn sunion(db: &mut Database, argv: &[Vec<u8>]) -> Outcome {
    let sets = collect_sets(db, &argv[1..])?;
    let result = union(&sets);
    Ok((Reply::Array(result.into_iter().map(Reply::from_bytes).collect()), false))
}

pub fn sinterstore(db: &mut Database, argv: &[Vec<u8>]) -> Outcome {
    let sets = collect_sets(db, &argv[2..])?;
    let result = intersect(&sets);
    let len = result.len();
    let dest = argv[1].clone();
    if result.is_empty() {
        db.remove(&dest);
    } else {
        db.insert(dest, Value::Set(result));
    }
    Ok((Reply::Integer(len as i64), true))
}

pub fn sunionstore(db: &mut Database, argv: &[Vec<u8>]) -> Outcome {
    let sets = collect_sets(db, &argv[2..])?;
    let result = union(&sets);
    let len = result.len();
    let dest = argv[1].clone();
    if result.is_empty() {
        db.remove(&dest);
    } else {
        db.insert(dest, Value::Set(result));
    }
    Ok((Reply::Integer(len as i64), true))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db() -> Database {
        Database::new(0)
    }

    #[test]
    fn sadd_then_smembers_is_unique() {
        let mut d = db();
        sadd(&mut d, &[b"SADD".to_vec(), b"s".to_vec(), b"a".to_vec(), b"a".to_vec(), b"b".to_vec()]).unwrap();
        let (r, _) = scard(&mut d, &[b"SCARD".to_vec(), b"s".to_vec()]).unwrap();
        assert_eq!(r, Reply::Integer(2));
    }

    #[test]
    fn sinter_picks_smallest_and_probes_rest() {
        let mut d = db();
        sadd(&mut d, &[b"SADD".to_vec(), b"a".to_vec(), b"1".to_vec(), b"2".to_vec(), b"3".to_vec()]).unwrap();
        sadd(&mut d, &[b"SADD".to_vec(), b"b".to_vec(), b"2".to_vec(), b"3".to_vec(), b"4".to_vec()]).unwrap();
        let (r, _) = sinter(&mut d, &[b"SINTER".to_vec(), b"a".to_vec(), b"b".to_vec()]).unwrap();
        let Reply::Array(mut items) = r else { panic!() };
        items.sort_by(|a, b| format!("{a:?}").cmp(&format!("{b:?}")));
        assert_eq!(items, vec![Reply::from_bytes(b"2".to_vec()), Reply::from_bytes(b"3".to_vec())]);
    }

    #[test]
    fn smove_removes_from_source_only_on_success() {
        let mut d = db();
        sadd(&mut d, &[b"SADD".to_vec(), b"src".to_vec(), b"x".to_vec()]).unwrap();
        let (r, _) = smove(&mut d, &[b"SMOVE".to_vec(), b"src".to_vec(), b"dst".to_vec(), b"x".to_vec()]).unwrap();
        assert_eq!(r, Reply::Integer(1));
        assert!(!d.contains(b"src"));
        let (r, _) = sismember(&mut d, &[b"SISMEMBER".to_vec(), b"dst".to_vec(), b"x".to_vec()]).unwrap();
        assert_eq!(r, Reply::Integer(1));
    }
}
