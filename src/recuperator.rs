//! Iterative probabilistic recovery driver.
//!
//! Each pass rebuilds the metadata and the partial CFG from the addresses that are
//! currently known, applies every rule to every candidate at every corrupted address,
//! then prunes. Newly resolved addresses sharpen their neighbours' scores on the next
//! pass, which is what makes iteration converge. Scores are computed against the
//! start-of-pass snapshot and written back afterwards, so rules never observe
//! mid-pass mutations.

use crate::{
    candidate::{CandidateStore, ScoreMode},
    cfg::CfgBuilder,
    metadata::MetadataCollector,
    program::Program,
    rules::{default_rules, ProbabilisticModel, Rule, RuleContext},
};
use log::{debug, info};
use serde::Deserialize;

/// Engine configuration knobs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub probabilistic_model: ProbabilisticModel,
    /// Bound on scoring passes. None iterates until stable.
    pub passes: Option<usize>,
    /// Aggregation mode of the final rescoring pass.
    pub score_mode: ScoreMode,
    /// Cap on the number of complete assignments the enumerator counts.
    pub max_solutions: usize,
    /// How many known conditionals the metadata remembers on each side of an address.
    pub window: usize,
    /// Shortlist size generated per corrupted address.
    pub candidates_per_address: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            probabilistic_model: ProbabilisticModel::default(),
            passes: None,
            score_mode: ScoreMode::Continuous,
            max_solutions: 64,
            window: 2,
            candidates_per_address: 4,
        }
    }
}

/// Outcome of the convergence loop.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Convergence {
    /// No pass removed anything anymore.
    Stable { passes: usize },
    /// The pass bound was reached first; the last pruned store stands.
    Unstable { passes: usize },
}

impl Convergence {
    pub fn is_stable(&self) -> bool {
        matches!(self, Convergence::Stable { .. })
    }

    pub fn passes(&self) -> usize {
        match self {
            Convergence::Stable { passes } | Convergence::Unstable { passes } => *passes,
        }
    }
}

/// Applies the scoring rules over the candidate store until it stops shrinking.
pub struct Recuperator<'a> {
    program: &'a Program,
    rules: Vec<Box<dyn Rule>>,
    config: RecoveryConfig,
}

impl<'a> Recuperator<'a> {
    pub fn new(program: &'a Program) -> Self {
        Self {
            program,
            rules: default_rules(),
            config: RecoveryConfig::default(),
        }
    }

    pub fn with_config(program: &'a Program, config: RecoveryConfig) -> Self {
        Self {
            program,
            rules: default_rules(),
            config,
        }
    }

    /// Replaces the rule set. Rule order is irrelevant: aggregation is commutative.
    pub fn rules(mut self, rules: Vec<Box<dyn Rule>>) -> Self {
        self.rules = rules;
        self
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    /// Runs discrete scoring passes until the store is stable or the pass bound is
    /// reached, then rescores once in the configured final mode.
    pub fn recover(&self, store: &mut CandidateStore) -> Convergence {
        let mut passes = 0;
        let outcome = loop {
            passes += 1;
            self.run_pass(store, ScoreMode::Discrete);

            let mut stable = true;
            let corrupted: Vec<u32> = store.corrupted_addresses().collect();
            for address in corrupted {
                if store.remove_bad_candidates_at(address) > 0 {
                    stable = false;
                }
            }
            info!(
                "heuristics computed (pass {}), {} addresses unresolved",
                passes,
                store.unresolved_count()
            );
            if stable {
                break Convergence::Stable { passes };
            }
            if let Some(bound) = self.config.passes {
                if passes >= bound {
                    break Convergence::Unstable { passes };
                }
            }
        };

        // Final rescoring so ties can be ranked by how plausible they look.
        self.run_pass(store, self.config.score_mode);
        debug!("final rescoring done in {:?} mode", self.config.score_mode);
        outcome
    }

    fn run_pass(&self, store: &mut CandidateStore, mode: ScoreMode) {
        store.set_mode(mode);
        let metadata =
            MetadataCollector::with_window(self.config.window).collect(self.program, store);
        let cfg = CfgBuilder::known_only(self.program, store).build();
        let ctx = RuleContext::new(
            self.program,
            store,
            &metadata,
            &cfg,
            &self.config.probabilistic_model,
        );

        // Double buffer: compute against the snapshot, apply afterwards.
        let mut updates: Vec<(u32, Vec<Vec<(&'static str, f64)>>)> = Vec::new();
        for address in store.corrupted_addresses() {
            let per_candidate = store
                .candidates(address)
                .iter()
                .map(|candidate| {
                    self.rules
                        .iter()
                        .filter_map(|rule| {
                            rule.score(candidate, address, &ctx)
                                .map(|score| (rule.id(), score))
                        })
                        .collect()
                })
                .collect();
            updates.push((address, per_candidate));
        }
        drop(ctx);

        for (address, per_candidate) in updates {
            for (candidate, scores) in store
                .candidates_mut(address)
                .iter_mut()
                .zip(per_candidate)
            {
                candidate.clear_scores();
                for (rule, score) in scores {
                    candidate.record(rule, score);
                }
            }
        }
    }
}
