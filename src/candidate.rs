//! Candidate instructions and the per-address candidate store.

use crate::{arm::Instruction, program::Program};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};

/// Aggregation policy over a candidate's recorded rule scores.
///
/// Discrete takes the minimum of the recorded scores, so a candidate is perfect only
/// when every rule agreed. Continuous takes the arithmetic mean. Both return 1.0 when
/// nothing has been recorded.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScoreMode {
    #[default]
    Discrete,
    Continuous,
}

/// An instruction hypothesis at some address, carrying its scoring state.
///
/// Several candidates may share an address; they differ by encoding.
#[derive(Debug, Clone)]
pub struct Candidate {
    instruction: Instruction,
    scores_by_rule: BTreeMap<&'static str, f64>,
    ignore: bool,
    mode: ScoreMode,
}

impl Candidate {
    pub fn new(instruction: Instruction) -> Self {
        Self {
            instruction,
            scores_by_rule: BTreeMap::new(),
            ignore: false,
            mode: ScoreMode::default(),
        }
    }

    pub fn instruction(&self) -> &Instruction {
        &self.instruction
    }

    pub fn encoding(&self) -> u32 {
        self.instruction.encoding()
    }

    /// Records the score a rule computed for this candidate.
    pub fn record(&mut self, rule: &'static str, score: f64) {
        debug_assert!((0.0..=1.0).contains(&score));
        self.scores_by_rule.insert(rule, score.clamp(0.0, 1.0));
    }

    pub fn score_for(&self, rule: &str) -> Option<f64> {
        self.scores_by_rule.get(rule).copied()
    }

    pub fn scores_by_rule(&self) -> impl Iterator<Item = (&'static str, f64)> + '_ {
        self.scores_by_rule.iter().map(|(k, v)| (*k, *v))
    }

    pub fn clear_scores(&mut self) {
        self.scores_by_rule.clear();
    }

    pub fn mode(&self) -> ScoreMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: ScoreMode) {
        self.mode = mode;
    }

    pub fn ignore(&self) -> bool {
        self.ignore
    }

    pub fn set_ignore(&mut self, ignore: bool) {
        self.ignore = ignore;
    }

    /// Aggregate score over the recorded rule results, in `[0, 1]`.
    pub fn score(&self) -> f64 {
        if self.scores_by_rule.is_empty() {
            return 1.0;
        }
        match self.mode {
            ScoreMode::Discrete => self
                .scores_by_rule
                .values()
                .fold(1.0f64, |acc, v| acc.min(*v)),
            ScoreMode::Continuous => {
                self.scores_by_rule.values().sum::<f64>() / self.scores_by_rule.len() as f64
            }
        }
    }
}

/// Maps every program address to a non-empty list of candidate instructions.
///
/// Uncorrupted addresses hold a singleton; corrupted addresses start with the shortlist
/// produced by the corruption model and shrink as the recuperator prunes.
#[derive(Debug, Clone, Default)]
pub struct CandidateStore {
    inner: BTreeMap<u32, Vec<Candidate>>,
    corrupted: BTreeSet<u32>,
}

impl CandidateStore {
    /// Builds a store with a singleton candidate at every program address.
    pub fn from_program(program: &Program) -> Self {
        let inner = program
            .instructions()
            .iter()
            .map(|i| (i.address(), vec![Candidate::new(i.clone())]))
            .collect();
        Self {
            inner,
            corrupted: BTreeSet::new(),
        }
    }

    /// Replaces the candidates at `address` with a corrupted shortlist. The list must
    /// not be empty.
    pub fn corrupt(&mut self, address: u32, candidates: Vec<Candidate>) {
        debug_assert!(!candidates.is_empty());
        if candidates.is_empty() {
            return;
        }
        self.inner.insert(address, candidates);
        self.corrupted.insert(address);
    }

    pub fn candidates(&self, address: u32) -> &[Candidate] {
        self.inner.get(&address).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn candidates_mut(&mut self, address: u32) -> &mut [Candidate] {
        self.inner
            .get_mut(&address)
            .map(Vec::as_mut_slice)
            .unwrap_or(&mut [])
    }

    pub fn addresses(&self) -> impl Iterator<Item = u32> + '_ {
        self.inner.keys().copied()
    }

    /// Addresses marked corrupted by the corruption model, in ascending order. An
    /// address stays in this set even once pruning narrows it to a single candidate.
    pub fn corrupted_addresses(&self) -> impl Iterator<Item = u32> + '_ {
        self.corrupted.iter().copied()
    }

    pub fn is_corrupted(&self, address: u32) -> bool {
        self.corrupted.contains(&address)
    }

    /// An address is known once exactly one candidate remains.
    pub fn is_known(&self, address: u32) -> bool {
        self.candidates(address).len() == 1
    }

    /// Number of addresses still holding more than one candidate.
    pub fn unresolved_count(&self) -> usize {
        self.corrupted
            .iter()
            .filter(|a| !self.is_known(**a))
            .count()
    }

    /// Switches the aggregation mode of every candidate.
    pub fn set_mode(&mut self, mode: ScoreMode) {
        for list in self.inner.values_mut() {
            for candidate in list.iter_mut() {
                candidate.set_mode(mode);
            }
        }
    }

    /// Candidates at `address` ordered by descending score, ties by ascending encoding.
    pub fn ranked(&self, address: u32) -> Vec<&Candidate> {
        let mut out: Vec<&Candidate> = self.candidates(address).iter().collect();
        out.sort_by(|a, b| {
            b.score()
                .partial_cmp(&a.score())
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.encoding().cmp(&b.encoding()))
        });
        out
    }

    /// Best candidate at `address` under the ranking order.
    pub fn best(&self, address: u32) -> Option<&Candidate> {
        self.ranked(address).into_iter().next()
    }

    /// Removes candidates at `address` that scored badly. Zero scores are removed
    /// eagerly; when at least one candidate reaches 1.0, every candidate below 1.0 is
    /// removed as well. Returns the number of candidates removed.
    ///
    /// The list never empties: the last remaining candidate is immune to pruning.
    pub fn remove_bad_candidates_at(&mut self, address: u32) -> usize {
        let Some(v) = self.inner.get_mut(&address) else {
            return 0;
        };
        debug_assert!(!v.is_empty());
        let previous = v.len();
        let one_count = v.iter().filter(|c| c.score() == 1.0).count();

        let mut i = 0;
        while i < v.len() {
            let score = v[i].score();
            let doomed = score == 0.0 || (score < 1.0 && one_count > 0);
            if doomed && v.len() > 1 {
                v.remove(i);
            } else {
                i += 1;
            }
        }
        previous - v.len()
    }
}

#[cfg(test)]
mod tests {
    use super::{Candidate, CandidateStore, ScoreMode};
    use crate::{arm::Instruction, program::Program};

    fn store_with_scores(scores: &[f64]) -> CandidateStore {
        let program = Program::from_encodings(0x8000, &[0xe3a00000]);
        let mut store = CandidateStore::from_program(&program);
        let candidates = scores
            .iter()
            .enumerate()
            .map(|(i, s)| {
                let mut c = Candidate::new(Instruction::new(0xe3a00000 + i as u32, 0x8000));
                c.record("test", *s);
                c
            })
            .collect();
        store.corrupt(0x8000, candidates);
        store
    }

    #[test]
    fn test_score_modes() {
        let mut c = Candidate::new(Instruction::new(0xe3a00000, 0x8000));
        assert_eq!(c.score(), 1.0);
        c.record("a", 1.0);
        c.record("b", 0.5);
        assert_eq!(c.score(), 0.5);
        c.set_mode(ScoreMode::Continuous);
        assert_eq!(c.score(), 0.75);
    }

    #[test]
    fn test_prune_keeps_only_perfect() {
        let mut store = store_with_scores(&[1.0, 0.6, 0.0]);
        assert_eq!(store.remove_bad_candidates_at(0x8000), 2);
        let left = store.candidates(0x8000);
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].score(), 1.0);
    }

    #[test]
    fn test_prune_without_perfect_keeps_partials() {
        let mut store = store_with_scores(&[0.6, 0.3, 0.0]);
        assert_eq!(store.remove_bad_candidates_at(0x8000), 1);
        assert_eq!(store.candidates(0x8000).len(), 2);
    }

    #[test]
    fn test_prune_never_empties() {
        let mut store = store_with_scores(&[0.0, 0.0]);
        assert_eq!(store.remove_bad_candidates_at(0x8000), 1);
        assert_eq!(store.candidates(0x8000).len(), 1);
    }

    #[test]
    fn test_prune_is_monotonic_and_reaches_fixpoint() {
        let mut store = store_with_scores(&[1.0, 0.9, 0.4, 0.0, 1.0]);
        let removed = store.remove_bad_candidates_at(0x8000);
        assert_eq!(removed, 3);
        assert_eq!(store.remove_bad_candidates_at(0x8000), 0);
        assert_eq!(store.candidates(0x8000).len(), 2);
    }

    #[test]
    fn test_ranked_breaks_ties_by_encoding() {
        let store = store_with_scores(&[0.5, 0.5, 0.7]);
        let ranked = store.ranked(0x8000);
        assert_eq!(ranked[0].encoding(), 0xe3a00002);
        assert_eq!(ranked[1].encoding(), 0xe3a00000);
        assert_eq!(ranked[2].encoding(), 0xe3a00001);
    }
}
