//! Snapshot writer/loader (C5 §4.5): a point-in-time binary dump of every
//! database, with a magic header, a `SELECTDB`-delimited record stream,
//! and an `EOF` trailer.

use crate::db::Database;
use crate::error::RedisError;
use crate::value::{Value, ZSet};
use std::collections::{HashMap, HashSet, VecDeque};

const MAGIC: &[u8] = b"ALICE";

const TAG_STRING: u8 = 0x00;
const TAG_LIST: u8 = 0x01;
const TAG_SET: u8 = 0x02;
const TAG_HASH: u8 = 0x03;
const TAG_ZSET: u8 = 0x04;
const TAG_EXPIRE: u8 = 0x05;
const TAG_SELECTDB: u8 = 0xFE;
const TAG_EOF: u8 = 0xFF;

/// Values below this size are never worth spending a compression flag
/// byte on; see `DESIGN.md` for why this implementation only ever emits
/// the raw encoding (flag `0`) and why it still parses the compressed
/// flag on load.
const COMPRESS_THRESHOLD: usize = usize::MAX;

fn write_length(out: &mut Vec<u8>, len: usize) {
    if len < (1 << 6) {
        out.push(len as u8);
    } else if len < (1 << 14) {
        let len = len as u16;
        out.push(0b01000000 | ((len >> 8) as u8));
        out.push((len & 0xFF) as u8);
    } else {
        out.push(0b10000000);
        out.extend_from_slice(&(len as u32).to_be_bytes());
    }
}

fn read_length(cur: &mut Cursor) -> Result<usize, RedisError> {
    let first = cur.read_u8()?;
    match first >> 6 {
        0b00 => Ok((first & 0b0011_1111) as usize),
        0b01 => {
            let second = cur.read_u8()?;
            Ok((((first & 0b0011_1111) as usize) << 8) | second as usize)
        }
        _ => {
            if first == 0b10000000 {
                let bytes = cur.read_exact(4)?;
                Ok(u32::from_be_bytes(bytes.try_into().unwrap()) as usize)
            } else {
                Err(RedisError::Persistence("malformed length encoding".into()))
            }
        }
    }
}

fn write_value_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    if bytes.len() >= COMPRESS_THRESHOLD {
        unreachable!("compression threshold never trips; see DESIGN.md");
    }
    out.push(0); // flag = raw
    write_length(out, bytes.len());
    out.extend_from_slice(bytes);
}

fn read_value_bytes(cur: &mut Cursor) -> Result<Vec<u8>, RedisError> {
    let flag = cur.read_u8()?;
    match flag {
        0 => {
            let len = read_length(cur)?;
            Ok(cur.read_exact(len)?.to_vec())
        }
        1 => Err(RedisError::Persistence(
            "compressed snapshot records are not supported by this build".into(),
        )),
        _ => Err(RedisError::Persistence("unknown value flag".into())),
    }
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Cursor { buf, pos: 0 }
    }

    fn read_u8(&mut self) -> Result<u8, RedisError> {
        let b = *self.buf.get(self.pos).ok_or_else(|| RedisError::Persistence("unexpected EOF".into()))?;
        self.pos += 1;
        Ok(b)
    }

    fn read_exact(&mut self, n: usize) -> Result<&'a [u8], RedisError> {
        if self.pos + n > self.buf.len() {
            return Err(RedisError::Persistence("unexpected EOF".into()));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_i64(&mut self) -> Result<i64, RedisError> {
        let bytes = self.read_exact(8)?;
        Ok(i64::from_be_bytes(bytes.try_into().unwrap()))
    }

    fn eof(&self) -> bool {
        self.pos >= self.buf.len()
    }
}

fn write_kv(out: &mut Vec<u8>, key: &[u8], value: &Value) {
    match value {
        Value::String(s) => {
            out.push(TAG_STRING);
            write_value_bytes(out, key);
            write_value_bytes(out, s);
        }
        Value::List(list) => {
            out.push(TAG_LIST);
            write_value_bytes(out, key);
            write_length(out, list.len());
            for item in list {
                write_value_bytes(out, item);
            }
        }
        Value::Set(set) => {
            out.push(TAG_SET);
            write_value_bytes(out, key);
            write_length(out, set.len());
            for item in set {
                write_value_bytes(out, item);
            }
        }
        Value::Hash(hash) => {
            out.push(TAG_HASH);
            write_value_bytes(out, key);
            write_length(out, hash.len());
            for (field, val) in hash {
                write_value_bytes(out, field);
                write_value_bytes(out, val);
            }
        }
        Value::ZSet(zset) => {
            out.push(TAG_ZSET);
            write_value_bytes(out, key);
            let pairs = zset.order.iter_ascending();
            write_length(out, pairs.len());
            for (score, member) in pairs {
                write_value_bytes(out, score.to_string().as_bytes());
                write_value_bytes(out, &member);
            }
        }
    }
}

/// Serialize every database into one snapshot buffer.
pub fn save(databases: &[Database]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(MAGIC);
    for db in databases {
        if db.is_empty() {
            continue;
        }
        out.push(TAG_SELECTDB);
        write_length(&mut out, db.index);
        for (key, value) in db.iter() {
            if let Some(deadline) = db.expiry_of(key) {
                out.push(TAG_EXPIRE);
                out.extend_from_slice(&deadline.to_be_bytes());
            }
            write_kv(&mut out, key, value);
        }
    }
    out.push(TAG_EOF);
    out
}

/// Load a snapshot into a fresh set of `num_databases` databases. A
/// pending expiry record that has already passed `now_ms` drops both the
/// expiry and the key it would have applied to (§4.5).
pub fn load(bytes: &[u8], num_databases: usize, now_ms: i64) -> Result<Vec<Database>, RedisError> {
    if bytes.len() < MAGIC.len() || &bytes[..MAGIC.len()] != MAGIC {
        return Err(RedisError::Persistence("bad snapshot magic".into()));
    }
    let mut databases: Vec<Database> = (0..num_databases).map(Database::new).collect();
    let mut cur = Cursor::new(&bytes[MAGIC.len()..]);
    let mut current_db = 0usize;
    let mut pending_expiry: Option<i64> = None;

    while !cur.eof() {
        let tag = cur.read_u8()?;
        match tag {
            TAG_EOF => break,
            TAG_SELECTDB => {
                current_db = read_length(&mut cur)?;
            }
            TAG_EXPIRE => {
                pending_expiry = Some(cur.read_i64()?);
            }
            TAG_STRING => {
                let key = read_value_bytes(&mut cur)?;
                let val = read_value_bytes(&mut cur)?;
                apply_kv(&mut databases, current_db, key, Value::String(val), &mut pending_expiry, now_ms)?;
            }
            TAG_LIST => {
                let key = read_value_bytes(&mut cur)?;
                let n = read_length(&mut cur)?;
                let mut list = VecDeque::with_capacity(n);
                for _ in 0..n {
                    list.push_back(read_value_bytes(&mut cur)?);
                }
                apply_kv(&mut databases, current_db, key, Value::List(list), &mut pending_expiry, now_ms)?;
            }
            TAG_SET => {
                let key = read_value_bytes(&mut cur)?;
                let n = read_length(&mut cur)?;
                let mut set = HashSet::with_capacity(n);
                for _ in 0..n {
                    set.insert(read_value_bytes(&mut cur)?);
                }
                apply_kv(&mut databases, current_db, key, Value::Set(set), &mut pending_expiry, now_ms)?;
            }
            TAG_HASH => {
                let key = read_value_bytes(&mut cur)?;
                let n = read_length(&mut cur)?;
                let mut hash = HashMap::with_capacity(n);
                for _ in 0..n {
                    let field = read_value_bytes(&mut cur)?;
                    let val = read_value_bytes(&mut cur)?;
                    hash.insert(field, val);
                }
                apply_kv(&mut databases, current_db, key, Value::Hash(hash), &mut pending_expiry, now_ms)?;
            }
            TAG_ZSET => {
                let key = read_value_bytes(&mut cur)?;
                let n = read_length(&mut cur)?;
                let mut zset = ZSet::new();
                for _ in 0..n {
                    let score_bytes = read_value_bytes(&mut cur)?;
                    let member = read_value_bytes(&mut cur)?;
                    let score: f64 = std::str::from_utf8(&score_bytes)
                        .ok()
                        .and_then(|s| s.parse().ok())
                        .ok_or_else(|| RedisError::Persistence("bad zset score".into()))?;
                    zset.insert(member, score);
                }
                apply_kv(&mut databases, current_db, key, Value::ZSet(zset), &mut pending_expiry, now_ms)?;
            }
            other => return Err(RedisError::Persistence(format!("unknown record tag {other:#x}"))),
        }
    }
    Ok(databases)
}

fn apply_kv(
    databases: &mut [Database],
    db_index: usize,
    key: Vec<u8>,
    value: Value,
    pending_expiry: &mut Option<i64>,
    now_ms: i64,
) -> Result<(), RedisError> {
    let db = databases
        .get_mut(db_index)
        .ok_or_else(|| RedisError::Persistence("snapshot references out-of-range database".into()))?;
    let expiry = pending_expiry.take();
    if let Some(deadline) = expiry {
        if deadline <= now_ms {
            return Ok(()); // already expired: key and expiry both dropped
        }
    }
    db.insert(key.clone(), value);
    if let Some(deadline) = expiry {
        db.set_expiry(&key, deadline);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_then_load_roundtrips_all_variants() {
        let mut dbs: Vec<Database> = (0..2).map(Database::new).collect();
        dbs[0].insert(b"s".to_vec(), Value::String(b"hello".to_vec()));
        dbs[0].insert(b"l".to_vec(), Value::List(VecDeque::from(vec![b"a".to_vec(), b"b".to_vec()])));
        dbs[0].set_expiry(b"l", 10_000);
        let mut set = HashSet::new();
        set.insert(b"x".to_vec());
        dbs[1].insert(b"st".to_vec(), Value::Set(set));

        let bytes = save(&dbs);
        let loaded = load(&bytes, 2, 0).unwrap();
        assert_eq!(loaded[0].get(b"s").unwrap().as_string().unwrap(), &b"hello".to_vec());
        assert_eq!(loaded[0].expiry_of(b"l"), Some(10_000));
        assert!(loaded[1].get(b"st").unwrap().as_set().unwrap().contains(&b"x".to_vec()));
    }

    #[test]
    fn expired_key_is_dropped_on_load() {
        let mut dbs: Vec<Database> = vec![Database::new(0)];
        dbs[0].insert(b"k".to_vec(), Value::String(b"v".to_vec()));
        dbs[0].set_expiry(b"k", 100);
        let bytes = save(&dbs);
        let loaded = load(&bytes, 1, 1_000_000).unwrap();
        assert!(!loaded[0].contains(b"k"));
    }

    #[test]
    fn bad_magic_is_rejected() {
        assert!(load(b"NOTRDB", 1, 0).is_err());
    }
}
