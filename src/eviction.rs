//! Eviction (C8 §4.8): sample-based key eviction when a configured memory
//! ceiling is exceeded.

use crate::db::Database;
use rand::seq::IteratorRandom;
use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionPolicy {
    AllKeysLru,
    VolatileLru,
    AllKeysRandom,
    VolatileRandom,
    VolatileTtl,
    No,
}

impl EvictionPolicy {
    pub fn from_str(s: &str) -> Self {
        match s {
            "allkeys-lru" => EvictionPolicy::AllKeysLru,
            "volatile-lru" => EvictionPolicy::VolatileLru,
            "allkeys-random" => EvictionPolicy::AllKeysRandom,
            "volatile-random" => EvictionPolicy::VolatileRandom,
            "volatile-ttl" => EvictionPolicy::VolatileTtl,
            _ => EvictionPolicy::No,
        }
    }
}

/// How many keys a sampling policy looks at before picking a victim.
const SAMPLE_SIZE: usize = 5;

/// Evict keys from `db` under `policy` until `db.approx_memory()` is back
/// at or below `ceiling`, or no eligible key remains. Returns the evicted
/// keys so the caller can propagate synthetic DELs.
pub fn evict_until_under_ceiling(db: &mut Database, policy: EvictionPolicy, ceiling: usize, rng: &mut impl Rng) -> Vec<Vec<u8>> {
    let mut evicted = Vec::new();
    if policy == EvictionPolicy::No {
        return evicted;
    }
    while db.approx_memory() > ceiling {
        let Some(victim) = pick_victim(db, policy, rng) else { break };
        db.remove(&victim);
        evicted.push(victim);
    }
    evicted
}

fn pick_victim(db: &Database, policy: EvictionPolicy, rng: &mut impl Rng) -> Option<Vec<u8>> {
    match policy {
        EvictionPolicy::No => None,
        EvictionPolicy::AllKeysRandom => db.keys().choose(rng).cloned(),
        EvictionPolicy::VolatileRandom => db.expiring_keys().choose(rng).cloned(),
        EvictionPolicy::AllKeysLru => sample_oldest(db, db.keys().cloned().collect(), rng),
        EvictionPolicy::VolatileLru => sample_oldest(db, db.expiring_keys().cloned().collect(), rng),
        EvictionPolicy::VolatileTtl => sample_smallest_ttl(db, rng),
    }
}

fn sample_oldest(db: &Database, pool: Vec<Vec<u8>>, rng: &mut impl Rng) -> Option<Vec<u8>> {
    pool.into_iter()
        .choose_multiple(rng, SAMPLE_SIZE)
        .into_iter()
        .min_by_key(|k| db.access_stamp(k).unwrap_or(i64::MIN))
}

fn sample_smallest_ttl(db: &Database, rng: &mut impl Rng) -> Option<Vec<u8>> {
    db.expiring_keys()
        .cloned()
        .choose_multiple(rng, SAMPLE_SIZE)
        .into_iter()
        .min_by_key(|k| db.expiry_of(k).unwrap_or(i64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;
    use rand::{rngs::SmallRng, SeedableRng};

    fn db_with(n: usize) -> Database {
        let mut db = Database::new(0);
        for i in 0..n {
            db.insert(format!("k{i}").into_bytes(), Value::String(vec![b'x'; 100]));
        }
        db
    }

    #[test]
    fn no_policy_never_evicts() {
        let mut db = db_with(10);
        let mut rng = SmallRng::seed_from_u64(42);
        let evicted = evict_until_under_ceiling(&mut db, EvictionPolicy::No, 1, &mut rng);
        assert!(evicted.is_empty());
        assert_eq!(db.len(), 10);
    }

    #[test]
    fn allkeys_random_evicts_down_to_ceiling() {
        let mut db = db_with(20);
        let mut rng = SmallRng::seed_from_u64(42);
        let ceiling = db.approx_memory() / 2;
        let evicted = evict_until_under_ceiling(&mut db, EvictionPolicy::AllKeysRandom, ceiling, &mut rng);
        assert!(!evicted.is_empty());
        assert!(db.approx_memory() <= ceiling);
    }

    #[test]
    fn volatile_random_only_touches_expiring_keys() {
        let mut db = db_with(5);
        db.set_expiry(b"k0", 1000);
        let mut rng = SmallRng::seed_from_u64(42);
        let evicted = evict_until_under_ceiling(&mut db, EvictionPolicy::VolatileRandom, 0, &mut rng);
        assert_eq!(evicted, vec![b"k0".to_vec()]);
    }

    #[test]
    fn policy_from_str_maps_known_names() {
        assert_eq!(EvictionPolicy::from_str("allkeys-lru"), EvictionPolicy::AllKeysLru);
        assert_eq!(EvictionPolicy::from_str("volatile-ttl"), EvictionPolicy::VolatileTtl);
        assert_eq!(EvictionPolicy::from_str("garbage"), EvictionPolicy::No);
    }
}
