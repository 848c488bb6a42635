//! String command handlers (§4.2).

use crate::db::{clamp_range, Database};
use crate::error::RedisError;
use crate::protocol::Reply;
use crate::value::Value;

pub type Outcome = Result<(Reply, bool), RedisError>;

fn parse_i64(bytes: &[u8]) -> Result<i64, RedisError> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.trim().parse::<i64>().ok())
        .ok_or(RedisError::NotAnInteger)
}

fn parse_f64(bytes: &[u8]) -> Result<f64, RedisError> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.trim().parse::<f64>().ok())
        .filter(|f| !f.is_nan())
        .ok_or(RedisError::NotAFloat)
}

fn get_string<'a>(db: &'a Database, key: &[u8]) -> Result<Option<&'a Vec<u8>>, RedisError> {
    match db.get(key) {
        Some(v) => Ok(Some(v.as_string()?)),
        None => Ok(None),
    }
}

pub fn get(db: &mut Database, argv: &[Vec<u8>]) -> Outcome {
    let val = get_string(db, &argv[1])?.cloned();
    Ok((val.map(Reply::from_bytes).unwrap_or(Reply::NilBulk), false))
}

pub struct SetOptions {
    pub nx: bool,
    pub xx: bool,
    pub expire_at_ms: Option<i64>,
}

fn parse_set_options(argv: &[Vec<u8>], now_ms: i64) -> Result<SetOptions, RedisError> {
    let mut opts = SetOptions { nx: false, xx: false, expire_at_ms: None };
    let mut i = 3;
    while i < argv.len() {
        let word = argv[i].to_ascii_uppercase();
        match word.as_slice() {
            b"NX" => opts.nx = true,
            b"XX" => opts.xx = true,
            b"EX" => {
                i += 1;
                let secs = argv.get(i).ok_or(RedisError::Syntax).and_then(|b| parse_i64(b))?;
                opts.expire_at_ms = Some(now_ms + secs * 1000);
            }
            b"PX" => {
                i += 1;
                let ms = argv.get(i).ok_or(RedisError::Syntax).and_then(|b| parse_i64(b))?;
                opts.expire_at_ms = Some(now_ms + ms);
            }
            _ => return Err(RedisError::Syntax),
        }
        i += 1;
    }
    if opts.nx && opts.xx {
        return Err(RedisError::Syntax);
    }
    Ok(opts)
}

pub fn set(db: &mut Database, argv: &[Vec<u8>], now_ms: i64) -> Outcome {
    let key = &argv[1];
    let value = argv[2].clone();
    let opts = parse_set_options(argv, now_ms)?;
    let exists = db.contains(key);
    if (opts.nx && exists) || (opts.xx && !exists) {
        return Ok((Reply::NilBulk, false));
    }
    db.insert(key.clone(), Value::String(value));
    db.clear_expiry(key);
    if let Some(deadline) = opts.expire_at_ms {
        db.set_expiry(key, deadline);
    }
    Ok((Reply::ok(), true))
}

pub fn setnx(db: &mut Database, argv: &[Vec<u8>]) -> Outcome {
    let key = &argv[1];
    if db.contains(key) {
        return Ok((Reply::Integer(0), false));
    }
    db.insert(key.clone(), Value::String(argv[2].clone()));
    Ok((Reply::Integer(1), true))
}

pub fn getset(db: &mut Database, argv: &[Vec<u8>]) -> Outcome {
    let key = &argv[1];
    let old = get_string(db, key)?.cloned();
    db.insert(key.clone(), Value::String(argv[2].clone()));
    db.clear_expiry(key);
    Ok((old.map(Reply::from_bytes).unwrap_or(Reply::NilBulk), true))
}

pub fn strlen(db: &mut Database, argv: &[Vec<u8>]) -> Outcome {
    let len = get_string(db, &argv[1])?.map(|v| v.len()).unwrap_or(0);
    Ok((Reply::Integer(len as i64), false))
}

pub fn append(db: &mut Database, argv: &[Vec<u8>]) -> Outcome {
    let key = &argv[1];
    match db.get_mut(key) {
        Some(v) => {
            let s = v.as_string_mut()?;
            s.extend_from_slice(&argv[2]);
            Ok((Reply::Integer(s.len() as i64), true))
        }
        None => {
            let v = argv[2].clone();
            let len = v.len();
            db.insert(key.clone(), Value::String(v));
            Ok((Reply::Integer(len as i64), true))
        }
    }
}

pub fn mset(db: &mut Database, argv: &[Vec<u8>]) -> Outcome {
    if (argv.len() - 1) % 2 != 0 {
        return Err(RedisError::Generic("wrong number of arguments for MSET".into()));
    }
    let mut pairs = argv[1..].chunks(2);
    while let Some([k, v]) = pairs.next() {
        db.insert(k.clone(), Value::String(v.clone()));
        db.clear_expiry(k);
    }
    Ok((Reply::ok(), true))
}

pub fn mget(db: &mut Database, argv: &[Vec<u8>]) -> Outcome {
    let mut out = Vec::with_capacity(argv.len() - 1);
    for key in &argv[1..] {
        let reply = match db.get(key) {
            Some(Value::String(s)) => Reply::from_bytes(s.clone()),
            _ => Reply::NilBulk,
        };
        out.push(reply);
    }
    Ok((Reply::Array(out), false))
}

fn incr_by(db: &mut Database, key: &[u8], delta: i64) -> Outcome {
    let current = match db.get(key) {
        Some(v) => parse_i64(v.as_string()?)?,
        None => 0,
    };
    let next = current.checked_add(delta).ok_or(RedisError::NotAnInteger)?;
    db.insert(key.to_vec(), Value::String(next.to_string().into_bytes()));
    Ok((Reply::Integer(next), true))
}

pub fn incr(db: &mut Database, argv: &[Vec<u8>]) -> Outcome {
    incr_by(db, &argv[1], 1)
}

pub fn decr(db: &mut Database, argv: &[Vec<u8>]) -> Outcome {
    incr_by(db, &argv[1], -1)
}

pub fn incrby(db: &mut Database, argv: &[Vec<u8>]) -> Outcome {
    let delta = parse_i64(&argv[2])?;
    incr_by(db, &argv[1], delta)
}

pub fn decrby(db: &mut Database, argv: &[Vec<u8>]) -> Outcome {
    let delta = parse_i64(&argv[2])?;
    incr_by(db, &argv[1], delta.checked_neg().ok_or(RedisError::NotAnInteger)?)
}

pub fn incrbyfloat(db: &mut Database, argv: &[Vec<u8>]) -> Outcome {
    let delta = parse_f64(&argv[2])?;
    let key = &argv[1];
    let current = match db.get(key) {
        Some(v) => parse_f64(v.as_string()?)?,
        None => 0.0,
    };
    let next = current + delta;
    let rendered = format!("{next}");
    db.insert(key.clone(), Value::String(rendered.clone().into_bytes()));
    Ok((Reply::from_string(rendered), true))
}

pub fn setrange(db: &mut Database, argv: &[Vec<u8>]) -> Outcome {
    let offset = parse_i64(&argv[2])?;
    if offset < 0 {
        return Err(RedisError::Generic("offset is out of range".into()));
    }
    let offset = offset as usize;
    let patch = &argv[3];
    let key = &argv[1];
    let needed = offset + patch.len();
    match db.get_mut(key) {
        Some(v) => {
            let s = v.as_string_mut()?;
            if s.len() < needed {
                s.resize(needed, 0);
            }
            s[offset..offset + patch.len()].copy_from_slice(patch);
            Ok((Reply::Integer(s.len() as i64), true))
        }
        None => {
            if patch.is_empty() {
                return Ok((Reply::Integer(0), false));
            }
            let mut s = vec![0u8; needed];
            s[offset..offset + patch.len()].copy_from_slice(patch);
            let len = s.len();
            db.insert(key.clone(), Value::String(s));
            Ok((Reply::Integer(len as i64), true))
        }
    }
}

pub fn getrange(db: &mut Database, argv: &[Vec<u8>]) -> Outcome {
    let start = parse_i64(&argv[2])?;
    let stop = parse_i64(&argv[3])?;
    let Some(s) = get_string(db, &argv[1])? else {
        return Ok((Reply::from_bytes(Vec::new()), false));
    };
    let len = s.len() as i64;
    let Some((lo, hi)) = clamp_range(start, stop, len) else {
        return Ok((Reply::from_bytes(Vec::new()), false));
    };
    Ok((Reply::from_bytes(s[lo..=hi].to_vec()), false))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db() -> Database {
        Database::new(0)
    }

    #[test]
    fn set_then_get_roundtrips() {
        let mut d = db();
        set(&mut d, &[b"SET".to_vec(), b"k".to_vec(), b"v".to_vec()], 0).unwrap();
        let (reply, _) = get(&mut d, &[b"GET".to_vec(), b"k".to_vec()]).unwrap();
        assert_eq!(reply, Reply::from_bytes(b"v".to_vec()));
    }

    #[test]
    fn set_nx_refuses_existing_key() {
        let mut d = db();
        set(&mut d, &[b"SET".to_vec(), b"k".to_vec(), b"1".to_vec()], 0).unwrap();
        let (reply, mutated) =
            set(&mut d, &[b"SET".to_vec(), b"k".to_vec(), b"2".to_vec(), b"NX".to_vec()], 0).unwrap();
        assert_eq!(reply, Reply::NilBulk);
        assert!(!mutated);
    }

    #[test]
    fn incr_overflow_is_rejected_without_mutation() {
        let mut d = db();
        d.insert(b"k".to_vec(), Value::String(i64::MAX.to_string().into_bytes()));
        let err = incr(&mut d, &[b"INCR".to_vec(), b"k".to_vec()]).unwrap_err();
        assert_eq!(err, RedisError::NotAnInteger);
        assert_eq!(d.get(b"k").unwrap().as_string().unwrap(), &i64::MAX.to_string().into_bytes());
    }

    #[test]
    fn incr_non_numeric_value_errors() {
        let mut d = db();
        set(&mut d, &[b"SET".to_vec(), b"k".to_vec(), b"abc".to_vec()], 0).unwrap();
        assert_eq!(incr(&mut d, &[b"INCR".to_vec(), b"k".to_vec()]).unwrap_err(), RedisError::NotAnInteger);
    }

    #[test]
    fn getrange_clamps_like_spec_example() {
        let mut d = db();
        set(&mut d, &[b"SET".to_vec(), b"k".to_vec(), b"Hello World".to_vec()], 0).unwrap();
        let (r, _) = getrange(&mut d, &[b"GETRANGE".to_vec(), b"k".to_vec(), b"-5".to_vec(), b"-1".to_vec()])
            .unwrap();
        assert_eq!(r, Reply::from_bytes(b"World".to_vec()));
    }

    #[test]
    fn setrange_zero_pads_missing_key() {
        let mut d = db();
        let (r, _) = setrange(
            &mut d,
            &[b"SETRANGE".to_vec(), b"k".to_vec(), b"5".to_vec(), b"hello".to_vec()],
        )
        .unwrap();
        assert_eq!(r, Reply::Integer(10));
        assert_eq!(d.get(b"k").unwrap().as_string().unwrap(), &vec![0, 0, 0, 0, 0, b'h', b'e', b'l', b'l', b'o']);
    }
}
