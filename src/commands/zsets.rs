//! Sorted-set command handlers (§4.2), backed by the order-statistic skip
//! list in `zset.rs`.

use crate::db::Database;
use crate::error::RedisError;
use crate::protocol::Reply;
use crate::value::{Value, ZSet};

pub type Outcome = Result<(Reply, bool), RedisError>;

fn parse_f64(bytes: &[u8]) -> Result<f64, RedisError> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.trim().parse::<f64>().ok())
        .filter(|f| !f.is_nan())
        .ok_or(RedisError::NotAFloat)
}

fn parse_i64(bytes: &[u8]) -> Result<i64, RedisError> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.trim().parse::<i64>().ok())
        .ok_or(RedisError::NotAnInteger)
}

/// Parse a ZRANGEBYSCORE-style bound: `-inf`, `+inf`, `(x` (exclusive), or `x`.
fn parse_bound(bytes: &[u8]) -> Result<(f64, bool), RedisError> {
    if bytes == b"-inf" {
        return Ok((f64::NEG_INFINITY, false));
    }
    if bytes == b"+inf" || bytes == b"inf" {
        return Ok((f64::INFINITY, false));
    }
    if bytes.first() == Some(&b'(') {
        Ok((parse_f64(&bytes[1..])?, true))
    } else {
        Ok((parse_f64(bytes)?, false))
    }
}

fn render_score(score: f64) -> Vec<u8> {
    if score == score.trunc() && score.is_finite() {
        format!("{}", score as i64).into_bytes()
    } else {
        format!("{score}").into_bytes()
    }
}

pub fn zadd(db: &mut Database, argv: &[Vec<u8>]) -> Outcome {
    if (argv.len() - 2) % 2 != 0 || argv.len() < 4 {
        return Err(RedisError::Generic("wrong number of arguments for ZADD".into()));
    }
    let mut pairs = Vec::new();
    for chunk in argv[2..].chunks(2) {
        pairs.push((parse_f64(&chunk[0])?, chunk[1].clone()));
    }
    let key = &argv[1];
    let zset = db.entry_or_insert_with(key, || Value::ZSet(ZSet::new())).as_zset_mut()?;
    let mut added = 0i64;
    for (score, member) in pairs {
        if zset.insert(member, score) {
            added += 1;
        }
    }
    Ok((Reply::Integer(added), added > 0))
}

pub fn zscore(db: &mut Database, argv: &[Vec<u8>]) -> Outcome {
    let reply = match db.get(&argv[1]) {
        Some(v) => v.as_zset()?.score(&argv[2]).map(|s| Reply::from_bytes(render_score(s))).unwrap_or(Reply::NilBulk),
        None => Reply::NilBulk,
    };
    Ok((reply, false))
}

pub fn zincrby(db: &mut Database, argv: &[Vec<u8>]) -> Outcome {
    let delta = parse_f64(&argv[2])?;
    let key = &argv[1];
    let zset = db.entry_or_insert_with(key, || Value::ZSet(ZSet::new())).as_zset_mut()?;
    let current = zset.score(&argv[3]).unwrap_or(0.0);
    let next = current + delta;
    zset.insert(argv[3].clone(), next);
    Ok((Reply::from_bytes(render_score(next)), true))
}

pub fn zcard(db: &mut Database, argv: &[Vec<u8>]) -> Outcome {
    let len = match db.get(&argv[1]) {
        Some(v) => v.as_zset()?.len(),
        None => 0,
    };
    Ok((Reply::Integer(len as i64), false))
}

pub fn zcount(db: &mut Database, argv: &[Vec<u8>]) -> Outcome {
    let (min, min_excl) = parse_bound(&argv[2])?;
    let (max, max_excl) = parse_bound(&argv[3])?;
    let count = match db.get(&argv[1]) {
        Some(v) => v.as_zset()?.order.count_by_score(min, min_excl, max, max_excl),
        None => 0,
    };
    Ok((Reply::Integer(count as i64), false))
}

fn render_pairs(pairs: Vec<(f64, Vec<u8>)>, with_scores: bool, reverse: bool) -> Reply {
    let mut pairs = pairs;
    if reverse {
        pairs.reverse();
    }
    let mut out = Vec::with_capacity(pairs.len() * if with_scores { 2 } else { 1 });
    for (score, member) in pairs {
        out.push(Reply::from_bytes(member));
        if with_scores {
            out.push(Reply::from_bytes(render_score(score)));
        }
    }
    Reply::Array(out)
}

pub fn zrange(db: &mut Database, argv: &[Vec<u8>], reverse: bool) -> Outcome {
    let start = parse_i64(&argv[2])?;
    let stop = parse_i64(&argv[3])?;
    let with_scores = argv.get(4).map(|a| a.eq_ignore_ascii_case(b"WITHSCORES")).unwrap_or(false);
    let Some(v) = db.get(&argv[1]) else { return Ok((Reply::Array(vec![]), false)) };
    let zset = v.as_zset()?;
    let len = zset.len() as i64;
    let Some((lo, hi)) = crate::db::clamp_range(start, stop, len) else {
        return Ok((Reply::Array(vec![]), false));
    };
    // Ranks run ascending regardless of direction; ZREVRANGE reverses after
    // slicing so `start`/`stop` still index from the requested end.
    let (lo, hi) = if reverse {
        (len as u64 - 1 - hi as u64, len as u64 - 1 - lo as u64)
    } else {
        (lo as u64, hi as u64)
    };
    let pairs = zset.order.range_by_rank(lo, hi);
    Ok((render_pairs(pairs, with_scores, reverse), false))
}

pub fn zrank(db: &mut Database, argv: &[Vec<u8>], reverse: bool) -> Outcome {
    let Some(v) = db.get(&argv[1]) else { return Ok((Reply::NilBulk, false)) };
    let zset = v.as_zset()?;
    let Some(score) = zset.score(&argv[2]) else { return Ok((Reply::NilBulk, false)) };
    let rank = zset.order.rank(score, &argv[2]).unwrap();
    let rank = if reverse { zset.len() - 1 - rank } else { rank };
    Ok((Reply::Integer(rank as i64), false))
}

struct RangeByScoreArgs {
    min: f64,
    min_excl: bool,
    max: f64,
    max_excl: bool,
    with_scores: bool,
    limit: Option<(i64, i64)>,
}

fn parse_range_by_score(argv: &[Vec<u8>], reverse: bool) -> Result<RangeByScoreArgs, RedisError> {
    let (lo_arg, hi_arg) = if reverse { (&argv[3], &argv[2]) } else { (&argv[2], &argv[3]) };
    let (min, min_excl) = parse_bound(lo_arg)?;
    let (max, max_excl) = parse_bound(hi_arg)?;
    let mut with_scores = false;
    let mut limit = None;
    let mut i = 4;
    while i < argv.len() {
        let word = argv[i].to_ascii_uppercase();
        match word.as_slice() {
            b"WITHSCORES" => with_scores = true,
            b"LIMIT" => {
                let offset = parse_i64(argv.get(i + 1).ok_or(RedisError::Syntax)?)?;
                let count = parse_i64(argv.get(i + 2).ok_or(RedisError::Syntax)?)?;
                limit = Some((offset, count));
                i += 2;
            }
            _ => return Err(RedisError::Syntax),
        }
        i += 1;
    }
    Ok(RangeByScoreArgs { min, min_excl, max, max_excl, with_scores, limit })
}

pub fn zrangebyscore(db: &mut Database, argv: &[Vec<u8>], reverse: bool) -> Outcome {
    let args = parse_range_by_score(argv, reverse)?;
    let Some(v) = db.get(&argv[1]) else { return Ok((Reply::Array(vec![]), false)) };
    let zset = v.as_zset()?;
    let mut pairs = zset.order.range_by_score(args.min, args.min_excl, args.max, args.max_excl);
    if reverse {
        pairs.reverse();
    }
    if let Some((offset, count)) = args.limit {
        let offset = offset.max(0) as usize;
        pairs = if offset >= pairs.len() {
            vec![]
        } else if count < 0 {
            pairs.split_off(offset)
        } else {
            pairs.into_iter().skip(offset).take(count as usize).collect()
        };
    }
    Ok((render_pairs(pairs, args.with_scores, false), false))
}

pub fn zrem(db: &mut Database, argv: &[Vec<u8>]) -> Outcome {
    let key = &argv[1];
    let Some(v) = db.get_mut(key) else { return Ok((Reply::Integer(0), false)) };
    let zset = v.as_zset_mut()?;
    let mut removed = 0i64;
    for member in &argv[2..] {
        if zset.remove(member) {
            removed += 1;
        }
    }
    db.drop_if_empty_container(key);
    Ok((Reply::Integer(removed), removed > 0))
}

pub fn zremrangebyrank(db: &mut Database, argv: &[Vec<u8>]) -> Outcome {
    let start = parse_i64(&argv[2])?;
    let stop = parse_i64(&argv[3])?;
    let key = &argv[1];
    let Some(v) = db.get_mut(key) else { return Ok((Reply::Integer(0), false)) };
    let zset = v.as_zset_mut()?;
    let len = zset.len() as i64;
    let Some((lo, hi)) = crate::db::clamp_range(start, stop, len) else {
        return Ok((Reply::Integer(0), false));
    };
    let victims = zset.order.range_by_rank(lo as u64, hi as u64);
    for (_, member) in &victims {
        zset.remove(member);
    }
    db.drop_if_empty_container(key);
    Ok((Reply::Integer(victims.len() as i64), !victims.is_empty()))
}

pub fn zremrangebyscore(db: &mut Database, argv: &[Vec<u8>]) -> Outcome {
    let (min, min_excl) = parse_bound(&argv[2])?;
    let (max, max_excl) = parse_bound(&argv[3])?;
    let key = &argv[1];
    let Some(v) = db.get_mut(key) else { return Ok((Reply::Integer(0), false)) };
    let zset = v.as_zset_mut()?;
    let victims = zset.order.range_by_score(min, min_excl, max, max_excl);
    for (_, member) in &victims {
        zset.remove(member);
    }
    db.drop_if_empty_container(key);
    Ok((Reply::Integer(victims.len() as i64), !victims.is_empty()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db() -> Database {
        Database::new(0)
    }

    #[test]
    fn zadd_then_zrangebyscore_matches_spec_example() {
        let mut d = db();
        zadd(
            &mut d,
            &[
                b"ZADD".to_vec(),
                b"z".to_vec(),
                b"1".to_vec(),
                b"a".to_vec(),
                b"2".to_vec(),
                b"b".to_vec(),
                b"3".to_vec(),
                b"c".to_vec(),
            ],
        )
        .unwrap();
        let (r, _) = zrangebyscore(
            &mut d,
            &[
                b"ZRANGEBYSCORE".to_vec(),
                b"z".to_vec(),
                b"(1".to_vec(),
                b"3".to_vec(),
                b"WITHSCORES".to_vec(),
                b"LIMIT".to_vec(),
                b"0".to_vec(),
                b"10".to_vec(),
            ],
            false,
        )
        .unwrap();
        assert_eq!(
            r,
            Reply::Array(vec![
                Reply::from_bytes(b"b".to_vec()),
                Reply::from_bytes(b"2".to_vec()),
                Reply::from_bytes(b"c".to_vec()),
                Reply::from_bytes(b"3".to_vec()),
            ])
        );
    }

    #[test]
    fn zrank_and_zrevrank_are_mirror_images() {
        let mut d = db();
        zadd(
            &mut d,
            &[b"ZADD".to_vec(), b"z".to_vec(), b"1".to_vec(), b"a".to_vec(), b"2".to_vec(), b"b".to_vec()],
        )
        .unwrap();
        let (r, _) = zrank(&mut d, &[b"ZRANK".to_vec(), b"z".to_vec(), b"a".to_vec()], false).unwrap();
        assert_eq!(r, Reply::Integer(0));
        let (r, _) = zrank(&mut d, &[b"ZREVRANK".to_vec(), b"z".to_vec(), b"a".to_vec()], true).unwrap();
        assert_eq!(r, Reply::Integer(1));
    }

    #[test]
    fn zremrangebyrank_keeps_score_map_consistent() {
        let mut d = db();
        zadd(
            &mut d,
            &[
                b"ZADD".to_vec(),
                b"z".to_vec(),
                b"1".to_vec(),
                b"a".to_vec(),
                b"2".to_vec(),
                b"b".to_vec(),
                b"3".to_vec(),
                b"c".to_vec(),
            ],
        )
        .unwrap();
        zremrangebyrank(&mut d, &[b"ZREMRANGEBYRANK".to_vec(), b"z".to_vec(), b"0".to_vec(), b"0".to_vec()]).unwrap();
        let zset = d.get(b"z").unwrap().as_zset().unwrap();
        assert_eq!(zset.len(), 2);
        assert_eq!(zset.score(b"a"), None);
        assert_eq!(zset.order.rank(2.0, b"b"), Some(0));
    }
}
