//! Ranked set: members ordered by (score, member), with O(1) score lookup

use ahash::AHashMap;
use std::cmp::Ordering;
use std::collections::BTreeSet;

/// f64 with a total order so it can key a BTreeSet
#[derive(Clone, Copy, Debug)]
struct Score(f64);

impl PartialEq for Score {
    fn eq(&self, other: &Self) -> bool {
        self.0.total_cmp(&other.0) == Ordering::Equal
    }
}

impl Eq for Score {}

impl PartialOrd for Score {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Score {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// Sorted set with Redis rank semantics: ascending by score, ties broken
/// lexicographically by member.
#[derive(Clone, Debug, Default)]
pub struct RankedSet {
    /// Score lookup by member
    members: AHashMap<String, f64>,
    /// Ordered index over (score, member)
    ordered: BTreeSet<(Score, String)>,
}

impl RankedSet {
    pub fn new() -> Self {
        RankedSet {
            members: AHashMap::new(),
            ordered: BTreeSet::new(),
        }
    }

    #[cfg(debug_assertions)]
    fn verify_invariants(&self) {
        debug_assert_eq!(
            self.members.len(),
            self.ordered.len(),
            "Invariant violated: members.len() ({}) != ordered.len() ({})",
            self.members.len(),
            self.ordered.len()
        );

        for (member, score) in &self.members {
            debug_assert!(
                self.ordered.contains(&(Score(*score), member.clone())),
                "Invariant violated: member '{}' with score {} missing from ordered index",
                member,
                score
            );
        }
    }

    #[cfg(not(debug_assertions))]
    #[inline(always)]
    fn verify_invariants(&self) {}

    /// Set `member` to `score`. Returns true if the member is new.
    pub fn add(&mut self, member: &str, score: f64) -> bool {
        let added = match self.members.insert(member.to_string(), score) {
            Some(old) => {
                self.ordered.remove(&(Score(old), member.to_string()));
                false
            }
            None => true,
        };
        self.ordered.insert((Score(score), member.to_string()));
        self.verify_invariants();
        added
    }

    /// Add `delta` to the member's score (absent members start at 0). Returns the new score.
    pub fn incr_by(&mut self, member: &str, delta: f64) -> f64 {
        let score = self.members.get(member).copied().unwrap_or(0.0) + delta;
        self.add(member, score);
        score
    }

    /// Members by ascending score, ranks `[start, stop]` inclusive
    pub fn range(&self, start: isize, stop: isize) -> Vec<(String, f64)> {
        match self.normalize(start, stop) {
            Some((start, stop)) => self
                .ordered
                .iter()
                .skip(start)
                .take(stop - start + 1)
                .map(|(score, member)| (member.clone(), score.0))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Members by descending score, ranks `[start, stop]` inclusive
    pub fn rev_range(&self, start: isize, stop: isize) -> Vec<(String, f64)> {
        match self.normalize(start, stop) {
            Some((start, stop)) => self
                .ordered
                .iter()
                .rev()
                .skip(start)
                .take(stop - start + 1)
                .map(|(score, member)| (member.clone(), score.0))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Resolve negative ranks and clamp to the set; None when the range is empty
    fn normalize(&self, start: isize, stop: isize) -> Option<(usize, usize)> {
        let len = self.ordered.len() as isize;
        if len == 0 {
            return None;
        }

        let start = if start < 0 {
            (len + start).max(0)
        } else {
            start.min(len)
        };
        let stop = if stop < 0 {
            (len + stop).max(-1)
        } else {
            stop.min(len - 1)
        };

        if start > stop || start >= len {
            return None;
        }
        Some((start as usize, stop as usize))
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}
