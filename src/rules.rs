//! Scoring rules and the probabilistic model driving them.
//!
//! A rule is a pure function of a candidate and its surroundings: it evaluates a
//! predicate and records the model prior when the predicate holds, its complement when
//! it fails. Candidates aggregate the recorded scores by minimum during the pruning
//! passes and by arithmetic mean on the final pass; the pruner cuts only on exact 0.0
//! and 1.0 aggregates, so the default priors rank candidates without ever destroying
//! one, while hard rules (returning exact 0.0) remain free to prune.

use crate::{
    arm::BranchTarget,
    candidate::{Candidate, CandidateStore},
    cfg::Cfg,
    metadata::Metadata,
    program::Program,
};
use serde::Deserialize;

/// Values assigned to the probabilistic model variables.
///
/// Every field is a configuration knob; see [crate::recuperator::RecoveryConfig].
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ProbabilisticModel {
    /// Observed probability of a conditional branch after a flag write when both near
    /// conditionals are equal.
    pub branch_after_cpsr_and_near_cond_are_equals: f64,
    /// As above when the previous conditional is equal.
    pub branch_after_cpsr_and_prev_cond_are_equals: f64,
    /// As above when the following conditional is equal.
    pub branch_after_cpsr_and_after_cond_are_equals: f64,
    /// Probability of a conditional branch happening after a flag register write.
    pub branch_after_cpsr: f64,
    /// Probability that an instruction shares the conditional of both its neighbours.
    pub both_conditionals_are_equals: f64,
    /// Probability that an instruction shares the conditional of its predecessor.
    pub prev_conditionals_are_equals: f64,
    /// Score granted to a jump that stays inside the program yet cannot be reached.
    pub jump_is_valid: f64,
}

impl Default for ProbabilisticModel {
    fn default() -> Self {
        Self {
            branch_after_cpsr_and_near_cond_are_equals: 0.85,
            branch_after_cpsr_and_prev_cond_are_equals: 0.65,
            branch_after_cpsr_and_after_cond_are_equals: 0.76,
            branch_after_cpsr: 0.6,
            both_conditionals_are_equals: 0.7,
            prev_conditionals_are_equals: 0.65,
            jump_is_valid: 0.1,
        }
    }
}

/// Everything a rule may consult when scoring a candidate.
pub struct RuleContext<'a> {
    pub program: &'a Program,
    pub store: &'a CandidateStore,
    pub metadata: &'a Metadata,
    pub cfg: &'a Cfg,
    /// Nodes reachable from the CFG root, indexed by node id.
    pub reachable: Vec<bool>,
    pub model: &'a ProbabilisticModel,
}

impl<'a> RuleContext<'a> {
    pub fn new(
        program: &'a Program,
        store: &'a CandidateStore,
        metadata: &'a Metadata,
        cfg: &'a Cfg,
        model: &'a ProbabilisticModel,
    ) -> Self {
        let reachable = cfg.reachable_from_root();
        Self {
            program,
            store,
            metadata,
            cfg,
            reachable,
            model,
        }
    }
}

/// A scoring rule applied to every candidate at every corrupted address.
pub trait Rule {
    /// Stable identifier, used as the key in a candidate's score table.
    fn id(&self) -> &'static str;

    /// Returns the score to record in `[0, 1]`, or None when the rule does not apply
    /// to this candidate.
    fn score(&self, candidate: &Candidate, address: u32, ctx: &RuleContext) -> Option<f64>;
}

/// Resolves a predicate and its prior into the score to record.
fn resolve(holds: bool, probability: f64) -> f64 {
    if holds {
        probability
    } else {
        1.0 - probability
    }
}

/// Conditional branch right after a flag write, with both neighbour conditionals
/// matching the candidate's.
pub struct BranchAfterFlagWrite;

impl Rule for BranchAfterFlagWrite {
    fn id(&self) -> &'static str {
        "branch_after_flag_write"
    }

    fn score(&self, candidate: &Candidate, address: u32, ctx: &RuleContext) -> Option<f64> {
        let ins = candidate.instruction();
        if !(ins.is_branch() && ins.is_conditional()) {
            return None;
        }
        let prev = ctx.metadata.prev_conditional(address)?;
        let next = ctx.metadata.next_conditional(address)?;
        let holds = ctx.metadata.prev_writes_flags(address)
            && prev == ins.condition()
            && next == ins.condition();
        Some(resolve(holds, ctx.model.branch_after_cpsr_and_near_cond_are_equals))
    }
}

/// Conditional branch right after a flag write, judged from the previous conditional.
pub struct BranchAfterFlagWritePrev;

impl Rule for BranchAfterFlagWritePrev {
    fn id(&self) -> &'static str {
        "branch_after_flag_write_prev"
    }

    fn score(&self, candidate: &Candidate, address: u32, ctx: &RuleContext) -> Option<f64> {
        let ins = candidate.instruction();
        if !(ins.is_branch() && ins.is_conditional()) {
            return None;
        }
        let prev = ctx.metadata.prev_conditional(address)?;
        let holds = ctx.metadata.prev_writes_flags(address) && prev == ins.condition();
        Some(resolve(holds, ctx.model.branch_after_cpsr_and_prev_cond_are_equals))
    }
}

/// Conditional branch right after a flag write, judged from the following conditional.
pub struct BranchAfterFlagWriteAfter;

impl Rule for BranchAfterFlagWriteAfter {
    fn id(&self) -> &'static str {
        "branch_after_flag_write_after"
    }

    fn score(&self, candidate: &Candidate, address: u32, ctx: &RuleContext) -> Option<f64> {
        let ins = candidate.instruction();
        if !(ins.is_branch() && ins.is_conditional()) {
            return None;
        }
        let next = ctx.metadata.next_conditional(address)?;
        let holds = ctx.metadata.prev_writes_flags(address) && next == ins.condition();
        Some(resolve(holds, ctx.model.branch_after_cpsr_and_after_cond_are_equals))
    }
}

/// Conditional branch somewhere after a flag write inside the same function.
pub struct BranchAfterFlagWriteAny;

impl Rule for BranchAfterFlagWriteAny {
    fn id(&self) -> &'static str {
        "branch_after_flag_write_any"
    }

    fn score(&self, candidate: &Candidate, address: u32, ctx: &RuleContext) -> Option<f64> {
        let ins = candidate.instruction();
        if !(ins.is_branch() && ins.is_conditional()) {
            return None;
        }
        let holds = ctx.metadata.follows_flag_write(address);
        Some(resolve(holds, ctx.model.branch_after_cpsr))
    }
}

/// Candidate conditional equal to both neighbour conditionals.
pub struct BothConditionalsEqual;

impl Rule for BothConditionalsEqual {
    fn id(&self) -> &'static str {
        "both_conditionals_equal"
    }

    fn score(&self, candidate: &Candidate, address: u32, ctx: &RuleContext) -> Option<f64> {
        let cond = candidate.instruction().condition();
        let prev = ctx.metadata.prev_conditional(address)?;
        let next = ctx.metadata.next_conditional(address)?;
        let holds = prev == cond && next == cond;
        Some(resolve(holds, ctx.model.both_conditionals_are_equals))
    }
}

/// Candidate conditional equal to the previous neighbour conditional.
pub struct PrevConditionalEqual;

impl Rule for PrevConditionalEqual {
    fn id(&self) -> &'static str {
        "prev_conditional_equal"
    }

    fn score(&self, candidate: &Candidate, address: u32, ctx: &RuleContext) -> Option<f64> {
        let cond = candidate.instruction().condition();
        let prev = ctx.metadata.prev_conditional(address)?;
        let holds = prev == cond;
        Some(resolve(holds, ctx.model.prev_conditionals_are_equals))
    }
}

/// PC-relative branch staying inside the program image but landing somewhere the CFG
/// cannot justify: a misaligned word, an undefined instruction, or an unreachable
/// block. Applies to every candidate so siblings are always comparable; anything that
/// is not such a branch trivially satisfies the predicate.
pub struct JumpInProgramInvalid;

impl Rule for JumpInProgramInvalid {
    fn id(&self) -> &'static str {
        "jump_in_program_invalid"
    }

    fn score(&self, candidate: &Candidate, _address: u32, ctx: &RuleContext) -> Option<f64> {
        let ins = candidate.instruction();
        let violates = match ins.branch_target() {
            Some(BranchTarget::Absolute(target)) if ctx.program.contains_address(target) => {
                match ctx.program.instruction_at(target) {
                    None => true,
                    Some(t) if t.is_undefined() => true,
                    Some(t) => {
                        match ctx.program.index_of(t.address()).and_then(|i| ctx.cfg.block_of(i)) {
                            Some(node) => !ctx.reachable[node],
                            // Not placed in the partial CFG, typically still corrupted:
                            // give it the benefit of the doubt.
                            None => false,
                        }
                    }
                }
            }
            _ => false,
        };
        Some(resolve(!violates, 1.0 - ctx.model.jump_is_valid))
    }
}

/// The default rule set. Order is irrelevant: aggregation is commutative.
pub fn default_rules() -> Vec<Box<dyn Rule>> {
    vec![
        Box::new(BranchAfterFlagWrite),
        Box::new(BranchAfterFlagWritePrev),
        Box::new(BranchAfterFlagWriteAfter),
        Box::new(BranchAfterFlagWriteAny),
        Box::new(BothConditionalsEqual),
        Box::new(PrevConditionalEqual),
        Box::new(JumpInProgramInvalid),
    ]
}
