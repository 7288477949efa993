//! Human-readable recovery diagnostics.
//!
//! Reports compare the candidate store against the ground-truth program, which the
//! corruption models keep around. Each corrupted address is classified as recovered,
//! lost (a wrong candidate leads) or tied, with per-rule score dumps so a misbehaving
//! rule can be spotted.

use crate::{candidate::CandidateStore, error::RecoverError, program::Program};
use log::info;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

/// Aggregate quality of a store against the ground truth.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SolutionQuality {
    /// Corrupted addresses in the store.
    pub corrupted: usize,
    /// Addresses where the ground-truth encoding is still among the candidates.
    pub present: usize,
    /// Addresses where the ground-truth candidate ranks first.
    pub leading: usize,
    /// Addresses where the leading score is shared by several distinct candidates.
    pub tied: usize,
}

impl SolutionQuality {
    pub fn measure(store: &CandidateStore, original: &Program) -> Self {
        let mut quality = SolutionQuality::default();
        for address in store.corrupted_addresses() {
            quality.corrupted += 1;
            let Some(truth) = original.instruction_at(address) else {
                continue;
            };
            let ranked = store.ranked(address);
            if ranked.iter().any(|c| c.encoding() == truth.encoding()) {
                quality.present += 1;
            }
            if ranked
                .first()
                .map(|c| c.encoding() == truth.encoding())
                .unwrap_or(false)
            {
                quality.leading += 1;
            }
            if ranked.len() > 1
                && ranked[0].score() == ranked[1].score()
                && ranked[0].encoding() != ranked[1].encoding()
            {
                quality.tied += 1;
            }
        }
        quality
    }

    pub fn report(&self) {
        info!(
            "quality: {} corrupted, {} still hold the truth, {} lead, {} tied",
            self.corrupted, self.present, self.leading, self.tied
        );
    }
}

/// Writes the per-address diagnostic dump.
pub struct ReportWriter<'a> {
    original: &'a Program,
}

impl<'a> ReportWriter<'a> {
    pub fn new(original: &'a Program) -> Self {
        Self { original }
    }

    pub fn write_to_path(
        &self,
        path: impl AsRef<Path>,
        store: &CandidateStore,
    ) -> Result<(), RecoverError> {
        let mut writer = BufWriter::new(File::create(path)?);
        self.write(&mut writer, store)?;
        Ok(())
    }

    pub fn write<W: Write>(&self, writer: &mut W, store: &CandidateStore) -> io::Result<()> {
        let mut errors = 0usize;
        let mut recovered = 0usize;
        let mut fail_loses = 0usize;
        let mut fail_ties = 0usize;
        let mut tie_sum = 0usize;
        let mut tie_count = 0usize;
        let mut bad_rules: BTreeMap<&'static str, usize> = BTreeMap::new();
        let mut depths: BTreeMap<usize, usize> = BTreeMap::new();

        for ins in self.original.instructions() {
            writeln!(writer, "Original instruction: {}", ins)?;
            let address = ins.address();
            let ranked = store.ranked(address);
            if ranked.len() > 1 {
                errors += 1;
                let truth = ranked.iter().find(|c| c.encoding() == ins.encoding());

                if ranked[0].encoding() != ins.encoding()
                    && ranked[0].encoding() != ranked[1].encoding()
                {
                    writeln!(writer, " * FAIL: leading candidate is not the original")?;
                    // Rules that scored the false winner above the truth are the ones
                    // to distrust.
                    if let Some(truth) = truth {
                        for (rule, score) in ranked[0].scores_by_rule() {
                            if let Some(truth_score) = truth.score_for(rule) {
                                if score > truth_score {
                                    writeln!(
                                        writer,
                                        " -> {}: {:.6} vs. {:.6}",
                                        rule, score, truth_score
                                    )?;
                                    *bad_rules.entry(rule).or_default() += 1;
                                }
                            }
                        }
                    }
                    fail_loses += 1;
                } else if ranked.len() > 1
                    && ranked[0].score() == ranked[1].score()
                    && ranked[0].encoding() != ranked[1].encoding()
                {
                    let ties = ranked
                        .iter()
                        .take_while(|c| c.score() == ranked[0].score())
                        .count();
                    writeln!(writer, " * TIE: {} candidates with equal score", ties)?;
                    tie_sum += ties;
                    tie_count += 1;
                    fail_ties += 1;
                } else {
                    recovered += 1;
                    writeln!(writer, " * OK")?;
                }

                let mut depth = 0;
                for candidate in &ranked {
                    let matches = candidate.encoding() == ins.encoding();
                    if matches {
                        depths.entry(depth).and_modify(|d| *d += 1).or_insert(1);
                    } else {
                        depth += 1;
                    }
                    writeln!(
                        writer,
                        "{:#010x} {} {} [{:#010x}] {} : {:.6}",
                        address,
                        if candidate.ignore() { "X" } else { " " },
                        if matches { "++" } else { "--" },
                        candidate.encoding(),
                        candidate.instruction(),
                        candidate.score(),
                    )?;
                    for (rule, score) in candidate.scores_by_rule() {
                        writeln!(writer, "    {}: {:.6}", rule, score)?;
                    }
                }
            }
            writeln!(writer, "------------")?;
        }

        writeln!(writer, "BAD RULES:")?;
        if bad_rules.is_empty() {
            writeln!(writer, "No rule scored a false winner above the original")?;
        }
        for (rule, count) in &bad_rules {
            writeln!(writer, "{}: {}", rule, count)?;
        }
        if tie_count > 0 {
            writeln!(
                writer,
                "AVERAGE TIE COUNT: {:.2}",
                tie_sum as f64 / tie_count as f64
            )?;
        }
        // The ratio divides by the error count, which may be zero on clean runs.
        let ratio = if errors > 0 {
            recovered as f64 / errors as f64
        } else {
            1.0
        };
        writeln!(
            writer,
            "ERRORS: {} -- LOSING: {} -- TIED: {} -- RECOVERED: {} -- RATIO: {:.4}",
            errors, fail_loses, fail_ties, recovered, ratio
        )?;
        writeln!(writer, "DEPTHS: {:?}", depths)?;
        Ok(())
    }
}
