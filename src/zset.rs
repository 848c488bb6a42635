//! An order-statistic skip list for the ZSet value type.
//!
//! Mirrors the classic Redis `zskiplist`: each node carries, per level, a
//! forward pointer and the *span* (number of level-0 nodes) that link
//! crosses. Spans make rank queries and rank-indexed access O(log n)
//! expected, on top of the usual O(log n) insert/delete/search.
//!
//! Nodes live in an arena (`Vec<Option<Node>>`) addressed by index rather
//! than by raw pointer, with freed slots recycled through a free list, so
//! the whole structure is safe, ordinary Rust.

use rand::Rng;

const MAX_LEVEL: usize = 32;
const P: f64 = 0.25;

#[derive(Clone)]
struct Level {
    forward: Option<usize>,
    span: u64,
}

struct Node {
    member: Vec<u8>,
    score: f64,
    backward: Option<usize>,
    levels: Vec<Level>,
}

/// Total order over (score, member) pairs: score ascending, then member
/// lexicographic ascending.
fn less(a_score: f64, a_member: &[u8], b_score: f64, b_member: &[u8]) -> bool {
    a_score < b_score || (a_score == b_score && a_member < b_member)
}

fn less_or_eq(a_score: f64, a_member: &[u8], b_score: f64, b_member: &[u8]) -> bool {
    a_score < b_score || (a_score == b_score && a_member <= b_member)
}

pub struct ZSkipList {
    nodes: Vec<Option<Node>>,
    free: Vec<usize>,
    head: usize,
    tail: Option<usize>,
    level: usize,
    length: u64,
}

impl ZSkipList {
    pub fn new() -> Self {
        let head = Node {
            member: Vec::new(),
            score: f64::NEG_INFINITY,
            backward: None,
            levels: (0..MAX_LEVEL).map(|_| Level { forward: None, span: 0 }).collect(),
        };
        ZSkipList {
            nodes: vec![Some(head)],
            free: Vec::new(),
            head: 0,
            tail: None,
            level: 1,
            length: 0,
        }
    }

    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    fn node(&self, idx: usize) -> &Node {
        self.nodes[idx].as_ref().expect("dangling skip list index")
    }

    fn node_mut(&mut self, idx: usize) -> &mut Node {
        self.nodes[idx].as_mut().expect("dangling skip list index")
    }

    fn alloc(&mut self, node: Node) -> usize {
        if let Some(idx) = self.free.pop() {
            self.nodes[idx] = Some(node);
            idx
        } else {
            self.nodes.push(Some(node));
            self.nodes.len() - 1
        }
    }

    fn free(&mut self, idx: usize) {
        self.nodes[idx] = None;
        self.free.push(idx);
    }

    fn random_level() -> usize {
        let mut lvl = 1;
        let mut rng = rand::rng();
        while lvl < MAX_LEVEL && rng.random::<f64>() < P {
            lvl += 1;
        }
        lvl
    }

    /// Insert (score, member). Caller guarantees the pair is not already
    /// present (ZSet keeps the score map as the source of truth for that).
    pub fn insert(&mut self, score: f64, member: Vec<u8>) {
        let mut update = [0usize; MAX_LEVEL];
        let mut rank = [0u64; MAX_LEVEL];
        let mut x = self.head;

        for i in (0..self.level).rev() {
            rank[i] = if i == self.level - 1 { 0 } else { rank[i + 1] };
            while let Some(next) = self.node(x).levels[i].forward {
                let nn = self.node(next);
                if less(nn.score, &nn.member, score, &member) {
                    rank[i] += self.node(x).levels[i].span;
                    x = next;
                } else {
                    break;
                }
            }
            update[i] = x;
        }

        let new_level = Self::random_level();
        if new_level > self.level {
            for lvl in self.level..new_level {
                rank[lvl] = 0;
                update[lvl] = self.head;
                self.node_mut(self.head).levels[lvl].span = self.length;
            }
            self.level = new_level;
        }

        let new_node = Node {
            member: member.clone(),
            score,
            backward: None,
            levels: (0..new_level).map(|_| Level { forward: None, span: 0 }).collect(),
        };
        let new_idx = self.alloc(new_node);

        for i in 0..new_level {
            let upd = update[i];
            let upd_next = self.node(upd).levels[i].forward;
            let upd_span = self.node(upd).levels[i].span;
            self.node_mut(new_idx).levels[i].forward = upd_next;
            self.node_mut(upd).levels[i].forward = Some(new_idx);
            self.node_mut(new_idx).levels[i].span = upd_span - (rank[0] - rank[i]);
            self.node_mut(upd).levels[i].span = (rank[0] - rank[i]) + 1;
        }

        for i in new_level..self.level {
            self.node_mut(update[i]).levels[i].span += 1;
        }

        let back = if update[0] == self.head { None } else { Some(update[0]) };
        self.node_mut(new_idx).backward = back;
        match self.node(new_idx).levels[0].forward {
            Some(next) => self.node_mut(next).backward = Some(new_idx),
            None => self.tail = Some(new_idx),
        }
        self.length += 1;
    }

    /// Remove the exact (score, member) pair. Returns true if it was present.
    pub fn remove(&mut self, score: f64, member: &[u8]) -> bool {
        let mut update = [0usize; MAX_LEVEL];
        let mut x = self.head;

        for i in (0..self.level).rev() {
            while let Some(next) = self.node(x).levels[i].forward {
                let nn = self.node(next);
                if less(nn.score, &nn.member, score, member) {
                    x = next;
                } else {
                    break;
                }
            }
            update[i] = x;
        }

        let target = self.node(x).levels[0].forward;
        let Some(target) = target else { return false };
        {
            let tn = self.node(target);
            if tn.score != score || tn.member != member {
                return false;
            }
        }

        for i in 0..self.level {
            if self.node(update[i]).levels[i].forward == Some(target) {
                let target_span = self.node(target).levels[i].span;
                let upd = update[i];
                self.node_mut(upd).levels[i].span += target_span.saturating_sub(1);
                let target_next = self.node(target).levels[i].forward;
                self.node_mut(upd).levels[i].forward = target_next;
            } else {
                self.node_mut(update[i]).levels[i].span =
                    self.node(update[i]).levels[i].span.saturating_sub(1);
            }
        }

        match self.node(target).levels[0].forward {
            Some(next) => self.node_mut(next).backward = self.node(target).backward,
            None => self.tail = self.node(target).backward,
        }

        while self.level > 1 && self.node(self.head).levels[self.level - 1].forward.is_none() {
            self.level -= 1;
        }
        self.length -= 1;
        self.free(target);
        true
    }

    /// 0-based rank of the exact (score, member) pair, if present.
    pub fn rank(&self, score: f64, member: &[u8]) -> Option<u64> {
        let mut x = self.head;
        let mut rank = 0u64;
        for i in (0..self.level).rev() {
            while let Some(next) = self.node(x).levels[i].forward {
                let nn = self.node(next);
                if less_or_eq(nn.score, &nn.member, score, member) {
                    rank += self.node(x).levels[i].span;
                    x = next;
                } else {
                    break;
                }
            }
        }
        if x != self.head {
            let n = self.node(x);
            if n.score == score && n.member == member {
                return Some(rank - 1);
            }
        }
        None
    }

    /// The (score, member) at the given 0-based rank.
    pub fn by_rank(&self, rank: u64) -> Option<(f64, Vec<u8>)> {
        let target = rank + 1;
        let mut x = self.head;
        let mut traversed = 0u64;
        for i in (0..self.level).rev() {
            while let Some(next) = self.node(x).levels[i].forward {
                let span = self.node(x).levels[i].span;
                if traversed + span <= target {
                    traversed += span;
                    x = next;
                } else {
                    break;
                }
            }
            if traversed == target {
                break;
            }
        }
        if traversed == target && x != self.head {
            let n = self.node(x);
            Some((n.score, n.member.clone()))
        } else {
            None
        }
    }

    /// First node index with score > min (or >= min if `incl`), along with its rank.
    fn first_ge(&self, min: f64, incl: bool) -> Option<(usize, u64)> {
        let mut x = self.head;
        let mut rank = 0u64;
        for i in (0..self.level).rev() {
            while let Some(next) = self.node(x).levels[i].forward {
                let nn_score = self.node(next).score;
                let keep_going = if incl { nn_score < min } else { nn_score <= min };
                if keep_going {
                    rank += self.node(x).levels[i].span;
                    x = next;
                } else {
                    break;
                }
            }
        }
        let next = self.node(x).levels[0].forward?;
        Some((next, rank))
    }

    /// Last node index with score < max (or <= max if `incl`), along with its rank.
    fn last_le(&self, max: f64, incl: bool) -> Option<(usize, u64)> {
        let mut x = self.head;
        let mut rank = 0u64;
        for i in (0..self.level).rev() {
            while let Some(next) = self.node(x).levels[i].forward {
                let nn_score = self.node(next).score;
                let keep_going = if incl { nn_score <= max } else { nn_score < max };
                if keep_going {
                    rank += self.node(x).levels[i].span;
                    x = next;
                } else {
                    break;
                }
            }
        }
        if x == self.head {
            None
        } else {
            Some((x, rank - 1))
        }
    }

    /// All (score, member) pairs with `min (op) score (op) max`, ascending.
    /// `min_excl`/`max_excl` select whether each bound is open.
    pub fn range_by_score(
        &self,
        min: f64,
        min_excl: bool,
        max: f64,
        max_excl: bool,
    ) -> Vec<(f64, Vec<u8>)> {
        let Some((mut idx, _)) = self.first_ge(min, !min_excl) else { return Vec::new() };
        let mut out = Vec::new();
        loop {
            let n = self.node(idx);
            let over_max = if max_excl { n.score >= max } else { n.score > max };
            if over_max {
                break;
            }
            out.push((n.score, n.member.clone()));
            match n.levels[0].forward {
                Some(next) => idx = next,
                None => break,
            }
        }
        out
    }

    /// Count of members with `min (op) score (op) max`, in O(log n).
    pub fn count_by_score(&self, min: f64, min_excl: bool, max: f64, max_excl: bool) -> u64 {
        let Some((_, lo_rank)) = self.first_ge(min, !min_excl) else { return 0 };
        let Some((_, hi_rank)) = self.last_le(max, !max_excl) else { return 0 };
        if hi_rank < lo_rank {
            0
        } else {
            hi_rank - lo_rank + 1
        }
    }

    /// All (score, member) pairs at 0-based ranks `[start, stop]` inclusive, ascending.
    pub fn range_by_rank(&self, start: u64, stop: u64) -> Vec<(f64, Vec<u8>)> {
        let Some((mut idx, _)) = self.by_rank_idx(start) else { return Vec::new() };
        let count = (stop - start + 1) as usize;
        let mut out = Vec::with_capacity(count);
        loop {
            let n = self.node(idx);
            out.push((n.score, n.member.clone()));
            if out.len() >= count {
                break;
            }
            match n.levels[0].forward {
                Some(next) => idx = next,
                None => break,
            }
        }
        out
    }

    fn by_rank_idx(&self, rank: u64) -> Option<(usize, u64)> {
        let target = rank + 1;
        let mut x = self.head;
        let mut traversed = 0u64;
        for i in (0..self.level).rev() {
            while let Some(next) = self.node(x).levels[i].forward {
                let span = self.node(x).levels[i].span;
                if traversed + span <= target {
                    traversed += span;
                    x = next;
                } else {
                    break;
                }
            }
            if traversed == target {
                break;
            }
        }
        if traversed == target && x != self.head {
            Some((x, rank))
        } else {
            None
        }
    }

    /// Iterate all pairs ascending (used by RDB/AOF serialization and SMEMBERS-style dumps).
    pub fn iter_ascending(&self) -> Vec<(f64, Vec<u8>)> {
        let mut out = Vec::with_capacity(self.length as usize);
        let mut cur = self.node(self.head).levels[0].forward;
        while let Some(idx) = cur {
            let n = self.node(idx);
            out.push((n.score, n.member.clone()));
            cur = n.levels[0].forward;
        }
        out
    }
}

impl Default for ZSkipList {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(pairs: &[(f64, &str)]) -> ZSkipList {
        let mut sl = ZSkipList::new();
        for (score, member) in pairs {
            sl.insert(*score, member.as_bytes().to_vec());
        }
        sl
    }

    #[test]
    fn insert_and_rank_are_consistent() {
        let sl = build(&[(1.0, "a"), (2.0, "b"), (3.0, "c")]);
        assert_eq!(sl.rank(1.0, b"a"), Some(0));
        assert_eq!(sl.rank(2.0, b"b"), Some(1));
        assert_eq!(sl.rank(3.0, b"c"), Some(2));
        assert_eq!(sl.rank(9.0, b"z"), None);
    }

    #[test]
    fn ties_break_lexicographically() {
        let sl = build(&[(1.0, "b"), (1.0, "a"), (1.0, "c")]);
        assert_eq!(sl.by_rank(0), Some((1.0, b"a".to_vec())));
        assert_eq!(sl.by_rank(1), Some((1.0, b"b".to_vec())));
        assert_eq!(sl.by_rank(2), Some((1.0, b"c".to_vec())));
    }

    #[test]
    fn remove_then_reinsert_reuses_arena_slot_without_corruption() {
        let mut sl = build(&[(1.0, "a"), (2.0, "b"), (3.0, "c")]);
        assert!(sl.remove(2.0, b"b"));
        assert_eq!(sl.len(), 2);
        assert_eq!(sl.rank(3.0, b"c"), Some(1));
        sl.insert(2.5, b"d".to_vec());
        assert_eq!(sl.len(), 3);
        assert_eq!(sl.rank(2.5, b"d"), Some(1));
        assert_eq!(sl.rank(3.0, b"c"), Some(2));
    }

    #[test]
    fn range_by_score_respects_exclusive_bounds() {
        let sl = build(&[(1.0, "a"), (2.0, "b"), (3.0, "c")]);
        let got = sl.range_by_score(1.0, true, 3.0, false);
        assert_eq!(got, vec![(2.0, b"b".to_vec()), (3.0, b"c".to_vec())]);
    }

    #[test]
    fn count_by_score_matches_range_len() {
        let sl = build(&[(1.0, "a"), (2.0, "b"), (3.0, "c"), (4.0, "d")]);
        assert_eq!(sl.count_by_score(1.0, true, 4.0, true), 3);
        assert_eq!(sl.count_by_score(1.0, false, 4.0, false), 4);
    }

    #[test]
    fn range_by_rank_returns_inclusive_slice() {
        let sl = build(&[(1.0, "a"), (2.0, "b"), (3.0, "c"), (4.0, "d")]);
        let got = sl.range_by_rank(1, 2);
        assert_eq!(got, vec![(2.0, b"b".to_vec()), (3.0, b"c".to_vec())]);
    }
}
