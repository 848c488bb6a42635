//! SORT (§4.2): materialize a list/set, optionally rank by an external
//! BY-pattern key, clamp with LIMIT, project with GET patterns, and either
//! reply with the projection or STORE it back as a list.

use crate::db::Database;
use crate::error::RedisError;
use crate::protocol::Reply;
use crate::value::Value;
use std::collections::VecDeque;

struct SortArgs {
    by: Option<Vec<u8>>,
    limit: Option<(i64, i64)>,
    gets: Vec<Vec<u8>>,
    desc: bool,
    alpha: bool,
    store: Option<Vec<u8>>,
}

fn parse_args(argv: &[Vec<u8>]) -> Result<SortArgs, RedisError> {
    let mut args = SortArgs { by: None, limit: None, gets: Vec::new(), desc: false, alpha: false, store: None };
    let mut i = 2;
    while i < argv.len() {
        let word = argv[i].to_ascii_uppercase();
        match word.as_slice() {
            b"ASC" => args.desc = false,
            b"DESC" => args.desc = true,
            b"ALPHA" => args.alpha = true,
            b"BY" => {
                args.by = Some(argv.get(i + 1).ok_or(RedisError::Syntax)?.clone());
                i += 1;
            }
            b"STORE" => {
                args.store = Some(argv.get(i + 1).ok_or(RedisError::Syntax)?.clone());
                i += 1;
            }
            b"LIMIT" => {
                let offset: i64 = parse_int(argv.get(i + 1).ok_or(RedisError::Syntax)?)?;
                let count: i64 = parse_int(argv.get(i + 2).ok_or(RedisError::Syntax)?)?;
                args.limit = Some((offset, count));
                i += 2;
            }
            b"GET" => {
                args.gets.push(argv.get(i + 1).ok_or(RedisError::Syntax)?.clone());
                i += 1;
            }
            _ => return Err(RedisError::Syntax),
        }
        i += 1;
    }
    Ok(args)
}

fn parse_int(bytes: &[u8]) -> Result<i64, RedisError> {
    std::str::from_utf8(bytes).ok().and_then(|s| s.parse().ok()).ok_or(RedisError::NotAnInteger)
}

fn parse_float(bytes: &[u8]) -> Result<f64, RedisError> {
    std::str::from_utf8(bytes).ok().and_then(|s| s.parse().ok()).ok_or(RedisError::Generic(
        "One or more scores can't be converted into double".into(),
    ))
}

/// Substitute the single `*` in `pattern` with `element`.
fn substitute(pattern: &[u8], element: &[u8]) -> Vec<u8> {
    let pat = String::from_utf8_lossy(pattern);
    let elem = String::from_utf8_lossy(element);
    pat.replacen('*', &elem, 1).into_bytes()
}

/// Look up a BY/GET pattern for one element: a bare `#` denotes the
/// element itself, a pattern containing `*` maps to a string key lookup.
fn lookup_pattern<'a>(db: &'a Database, pattern: &[u8], element: &'a [u8]) -> Result<Option<&'a [u8]>, RedisError> {
    if pattern == b"#" {
        return Ok(Some(element));
    }
    let key = substitute(pattern, element);
    match db.get(&key) {
        Some(Value::String(s)) => Ok(Some(s.as_slice())),
        _ => Ok(None),
    }
}

pub fn sort(db: &mut Database, argv: &[Vec<u8>]) -> Result<(Reply, bool, Option<(Vec<u8>, Vec<Vec<u8>>)>), RedisError> {
    let args = parse_args(argv)?;
    let key = &argv[1];
    let mut elements: Vec<Vec<u8>> = match db.get(key) {
        Some(Value::List(l)) => l.iter().cloned().collect(),
        Some(Value::Set(s)) => s.iter().cloned().collect(),
        Some(Value::ZSet(z)) => z.order.iter_ascending().into_iter().map(|(_, m)| m).collect(),
        Some(_) => return Err(RedisError::WrongType),
        None => Vec::new(),
    };

    if args.by.as_deref().map(|p| p.contains(&b'*')).unwrap_or(true) {
        // BY absent (sort by element) or BY with `*` (sort by lookup).
        if args.alpha {
            if let Some(by) = &args.by {
                elements.sort_by(|a, b| {
                    let ka = lookup_pattern(db, by, a).ok().flatten().map(|v| v.to_vec()).unwrap_or_default();
                    let kb = lookup_pattern(db, by, b).ok().flatten().map(|v| v.to_vec()).unwrap_or_default();
                    ka.cmp(&kb)
                });
            } else {
                elements.sort();
            }
        } else {
            let mut keyed: Vec<(f64, Vec<u8>)> = Vec::with_capacity(elements.len());
            for e in elements {
                let raw = match &args.by {
                    Some(by) => lookup_pattern(db, by, &e)?.map(|v| v.to_vec()).unwrap_or_default(),
                    None => e.clone(),
                };
                let score = parse_float(&raw)?;
                keyed.push((score, e));
            }
            keyed.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap());
            elements = keyed.into_iter().map(|(_, e)| e).collect();
        }
        if args.desc {
            elements.reverse();
        }
    }
    // BY pattern without `*`: skip sorting entirely (§4.2).

    if let Some((offset, count)) = args.limit {
        let offset = offset.max(0) as usize;
        elements = if offset >= elements.len() {
            vec![]
        } else if count < 0 {
            elements.split_off(offset)
        } else {
            elements.into_iter().skip(offset).take(count as usize).collect()
        };
    }

    let projected: Vec<Vec<u8>> = if args.gets.is_empty() {
        elements
    } else {
        let mut out = Vec::with_capacity(elements.len() * args.gets.len());
        for e in &elements {
            for pat in &args.gets {
                out.push(lookup_pattern(db, pat, e)?.map(|v| v.to_vec()).unwrap_or_default());
            }
        }
        out
    };

    if let Some(dest) = args.store {
        let count = projected.len();
        Ok((Reply::Integer(count as i64), true, Some((dest, projected))))
    } else {
        let reply = Reply::Array(projected.into_iter().map(Reply::from_bytes).collect());
        Ok((reply, false, None))
    }
}

/// Write the projection back as a list, matching STORE's "same container
/// type" requirement (the projection is always list-shaped: an ordered
/// sequence with possible duplicates from GET patterns).
pub fn store_projection(db: &mut Database, dest: Vec<u8>, projection: Vec<Vec<u8>>) {
    if projection.is_empty() {
        db.remove(&dest);
    } else {
        db.insert(dest, Value::List(VecDeque::from(projection)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db() -> Database {
        Database::new(0)
    }

    #[test]
    fn sort_numeric_ascending() {
        let mut d = db();
        d.insert(b"l".to_vec(), Value::List(VecDeque::from(vec![b"3".to_vec(), b"1".to_vec(), b"2".to_vec()])));
        let (reply, _, _) = sort(&mut d, &[b"SORT".to_vec(), b"l".to_vec()]).unwrap();
        assert_eq!(
            reply,
            Reply::Array(vec![
                Reply::from_bytes(b"1".to_vec()),
                Reply::from_bytes(b"2".to_vec()),
                Reply::from_bytes(b"3".to_vec())
            ])
        );
    }

    #[test]
    fn sort_alpha_orders_lexicographically() {
        let mut d = db();
        d.insert(b"l".to_vec(), Value::List(VecDeque::from(vec![b"banana".to_vec(), b"apple".to_vec()])));
        let (reply, _, _) = sort(&mut d, &[b"SORT".to_vec(), b"l".to_vec(), b"ALPHA".to_vec()]).unwrap();
        assert_eq!(
            reply,
            Reply::Array(vec![Reply::from_bytes(b"apple".to_vec()), Reply::from_bytes(b"banana".to_vec())])
        );
    }

    #[test]
    fn sort_by_pattern_without_star_skips_sorting() {
        let mut d = db();
        d.insert(b"l".to_vec(), Value::List(VecDeque::from(vec![b"3".to_vec(), b"1".to_vec()])));
        let (reply, _, _) = sort(&mut d, &[b"SORT".to_vec(), b"l".to_vec(), b"BY".to_vec(), b"nosort".to_vec()]).unwrap();
        assert_eq!(
            reply,
            Reply::Array(vec![Reply::from_bytes(b"3".to_vec()), Reply::from_bytes(b"1".to_vec())])
        );
    }
}
