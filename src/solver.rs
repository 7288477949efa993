//! Forward-constraint enumeration over residual candidate ties.
//!
//! Scoring leaves some addresses tied between candidates with equal scores. The
//! enumerator walks the corrupted addresses in ascending order and branches over the
//! remaining choices, rejecting any choice that violates a hard constraint the rules
//! only approximated probabilistically. Complete assignments are counted up to a
//! configurable cap; the first one found becomes the solution.

use crate::{
    arm::{BranchTarget, Instruction},
    candidate::CandidateStore,
    condition::Condition,
    program::{Function, Program},
    registers::{RegisterIndex, RegisterSet},
};
use log::info;
use std::collections::BTreeMap;

/// One complete choice of candidate per corrupted address.
pub type Assignment = BTreeMap<u32, Instruction>;

/// Result of the enumeration.
#[derive(Debug, Clone)]
pub struct Solution {
    /// First complete assignment surviving all constraints, or the soft fallback.
    pub assignment: Assignment,
    /// Number of complete assignments found, bounded by `max_solutions`. Zero means
    /// the solution is the soft fallback of best-scored candidates.
    pub solution_size: usize,
}

impl Solution {
    pub fn is_soft(&self) -> bool {
        self.solution_size == 0
    }
}

pub struct ForwardConstraintEnumerator<'a> {
    program: &'a Program,
    max_solutions: usize,
}

impl<'a> ForwardConstraintEnumerator<'a> {
    pub fn new(program: &'a Program) -> Self {
        Self {
            program,
            max_solutions: 64,
        }
    }

    pub fn max_solutions(mut self, max_solutions: usize) -> Self {
        self.max_solutions = max_solutions.max(1);
        self
    }

    /// Runs the depth-first search. Candidates rejected on the path leading to the
    /// first surviving assignment are flagged ignored in the store for reporting.
    pub fn build(&self, store: &mut CandidateStore) -> Solution {
        let addresses: Vec<u32> = store.corrupted_addresses().collect();
        // Decision order at each address: descending score, ties by ascending
        // encoding, so the search is deterministic.
        let choices: Vec<Vec<Instruction>> = addresses
            .iter()
            .map(|a| {
                store
                    .ranked(*a)
                    .into_iter()
                    .map(|c| c.instruction().clone())
                    .collect()
            })
            .collect();

        let mut search = Search {
            program: self.program,
            addresses: &addresses,
            choices: &choices,
            max_solutions: self.max_solutions,
            found: 0,
            first: None,
            rejected: Vec::new(),
        };
        search.descend(0, &mut Assignment::new());

        info!("constrained solution size: {}", search.found);
        if let Some(assignment) = search.first {
            for (address, encoding) in search.rejected {
                for candidate in store.candidates_mut(address) {
                    if candidate.encoding() == encoding {
                        candidate.set_ignore(true);
                    }
                }
            }
            Solution {
                assignment,
                solution_size: search.found,
            }
        } else {
            // No assignment survived: fall back to the best-scored candidate at every
            // address.
            let assignment = addresses
                .iter()
                .map(|a| (*a, store.best(*a).unwrap().instruction().clone()))
                .collect();
            Solution {
                assignment,
                solution_size: 0,
            }
        }
    }
}

struct Search<'a> {
    program: &'a Program,
    addresses: &'a [u32],
    choices: &'a [Vec<Instruction>],
    max_solutions: usize,
    found: usize,
    first: Option<Assignment>,
    rejected: Vec<(u32, u32)>,
}

impl<'a> Search<'a> {
    fn descend(&mut self, depth: usize, chosen: &mut Assignment) {
        if self.found >= self.max_solutions {
            return;
        }
        if depth == self.addresses.len() {
            self.found += 1;
            if self.first.is_none() {
                self.first = Some(chosen.clone());
            }
            return;
        }
        let address = self.addresses[depth];
        for candidate in &self.choices[depth] {
            if !self.admissible(candidate, address, chosen) {
                if self.first.is_none() {
                    self.rejected.push((address, candidate.encoding()));
                }
                continue;
            }
            chosen.insert(address, candidate.clone());
            self.descend(depth + 1, chosen);
            chosen.remove(&address);
            if self.found >= self.max_solutions {
                return;
            }
        }
    }

    fn admissible(&self, candidate: &Instruction, address: u32, chosen: &Assignment) -> bool {
        self.registers_coherent(candidate, address, chosen)
            && self.branch_in_image(candidate)
            && self.conditional_agrees(candidate, address, chosen)
            && self.respects_function_boundaries(candidate, address)
    }

    /// Instruction at `address` as the search currently sees it: a choice made so
    /// far, or the program word when the address was never corrupted.
    fn view<'b>(&self, address: u32, chosen: &'b Assignment) -> Option<&'b Instruction>
    where
        'a: 'b,
    {
        if let Some(ins) = chosen.get(&address) {
            return Some(ins);
        }
        if self.addresses.contains(&address) {
            // Corrupted but not decided yet.
            return None;
        }
        self.program.instruction_at(address)
    }

    /// Closed world on the function: a register read must have been written by the
    /// preceding instruction chain, or be defined at entry (arguments, SP, LR, PC).
    fn registers_coherent(
        &self,
        candidate: &Instruction,
        address: u32,
        chosen: &Assignment,
    ) -> bool {
        let Some(function) = self.program.function_of(address) else {
            return true;
        };
        let mut defined = RegisterSet::of(&[
            RegisterIndex::R0,
            RegisterIndex::R1,
            RegisterIndex::R2,
            RegisterIndex::R3,
            RegisterIndex::Sp,
            RegisterIndex::Lr,
            RegisterIndex::Pc,
        ]);
        for index in function.range.clone() {
            let ins = &self.program.instructions()[index];
            if ins.address() >= address {
                break;
            }
            match self.view(ins.address(), chosen) {
                Some(ins) if !ins.is_undefined() => {
                    defined = defined.union(&ins.registers_written());
                }
                // Undecided or undefined words may write anything: stay permissive.
                _ => return true,
            }
        }
        candidate
            .registers_required()
            .iter()
            .all(|r| defined.contains(r))
    }

    /// A PC-relative branch must land inside the program image.
    fn branch_in_image(&self, candidate: &Instruction) -> bool {
        match candidate.branch_target() {
            Some(BranchTarget::Absolute(target)) => self.program.contains_address(target),
            _ => true,
        }
    }

    /// At join points the incoming conditionals must be consistent with the chosen
    /// candidate: always-executed candidates pass, and a conditional candidate needs a
    /// flag-writing, matching, inverse or always-executed fall-through predecessor.
    fn conditional_agrees(&self, candidate: &Instruction, address: u32, chosen: &Assignment) -> bool {
        if !candidate.is_conditional() {
            return true;
        }
        let Some(prev) = self.view(address.wrapping_sub(4), chosen) else {
            return true;
        };
        if prev.is_undefined() || prev.writes_flags() || prev.is_branch() {
            return true;
        }
        let incoming = prev.condition();
        incoming == Condition::Always
            || incoming == candidate.condition()
            || incoming.inverse() == Some(candidate.condition())
    }

    /// A branch must not land in the middle of another function unless it links.
    fn respects_function_boundaries(&self, candidate: &Instruction, address: u32) -> bool {
        let Some(BranchTarget::Absolute(target)) = candidate.branch_target() else {
            return true;
        };
        if candidate.is_branch_with_link() {
            return true;
        }
        let home = self.program.function_of(address);
        let landing = self.program.function_of(target);
        match (home, landing) {
            (Some(a), Some(b)) => same_function(a, b),
            _ => true,
        }
    }
}

fn same_function(a: &Function, b: &Function) -> bool {
    a.range == b.range
}

#[cfg(test)]
mod tests {
    use super::ForwardConstraintEnumerator;
    use crate::{
        arm::Instruction,
        candidate::{Candidate, CandidateStore},
        program::{Function, Program},
    };

    fn corrupt(store: &mut CandidateStore, address: u32, encodings: &[u32]) {
        let candidates = encodings
            .iter()
            .map(|e| Candidate::new(Instruction::new(*e, address)))
            .collect();
        store.corrupt(address, candidates);
    }

    #[test]
    fn test_ties_break_by_ascending_encoding() {
        let program = Program::from_encodings(
            0x8000,
            &[0xe3a00000, 0xe3a01001, 0xe3a02002, 0xe12fff1e],
        );
        let mut store = CandidateStore::from_program(&program);
        corrupt(&mut store, 0x8008, &[0xe3a02003, 0xe3a02002]);

        let solution = ForwardConstraintEnumerator::new(&program).build(&mut store);
        assert!(solution.solution_size >= 1);
        assert_eq!(solution.assignment[&0x8008].encoding(), 0xe3a02002);
    }

    #[test]
    fn test_undefined_register_read_is_rejected() {
        let program = Program::from_encodings(
            0x8000,
            &[0xe3a00000, 0xe3a01001, 0xe3a02002, 0xe12fff1e],
        );
        let mut store = CandidateStore::from_program(&program);
        // mov r3, r7 reads a register nothing defines; mov r3, r1 is fine.
        corrupt(&mut store, 0x8008, &[0xe1a03007, 0xe1a03001]);

        let solution = ForwardConstraintEnumerator::new(&program).build(&mut store);
        assert_eq!(solution.solution_size, 1);
        assert_eq!(solution.assignment[&0x8008].encoding(), 0xe1a03001);
    }

    #[test]
    fn test_out_of_image_branch_is_rejected() {
        let program = Program::from_encodings(
            0x8000,
            &[0xe3a00000, 0xe3a01001, 0xe3a02002, 0xe12fff1e],
        );
        let mut store = CandidateStore::from_program(&program);
        // b far outside the image against the original word.
        corrupt(&mut store, 0x8008, &[0xea000100, 0xe3a02002]);

        let solution = ForwardConstraintEnumerator::new(&program).build(&mut store);
        assert_eq!(solution.solution_size, 1);
        assert_eq!(solution.assignment[&0x8008].encoding(), 0xe3a02002);
    }

    #[test]
    fn test_branch_into_other_function_needs_link() {
        let instructions = vec![
            Instruction::new(0xe3a00000, 0x8000),
            Instruction::new(0xe12fff1e, 0x8004),
            Instruction::new(0xe3a01001, 0x8008),
            Instruction::new(0xe12fff1e, 0x800c),
        ];
        let functions = vec![Function::new("a", 0..2), Function::new("b", 2..4)];
        let program = Program::new(instructions, functions);
        let mut store = CandidateStore::from_program(&program);
        // A plain branch from function a into function b versus the original mov.
        corrupt(&mut store, 0x8000, &[0xea000000, 0xe3a00000]);

        let solution = ForwardConstraintEnumerator::new(&program).build(&mut store);
        assert!(solution.solution_size >= 1);
        assert_eq!(solution.assignment[&0x8000].encoding(), 0xe3a00000);
    }

    #[test]
    fn test_no_survivor_falls_back_to_best_score() {
        let program = Program::from_encodings(
            0x8000,
            &[0xe3a00000, 0xe3a01001, 0xe3a02002, 0xe12fff1e],
        );
        let mut store = CandidateStore::from_program(&program);
        // Both candidates read undefined registers.
        corrupt(&mut store, 0x8008, &[0xe1a03007, 0xe1a03008]);

        let solution = ForwardConstraintEnumerator::new(&program).build(&mut store);
        assert!(solution.is_soft());
        assert!(solution.assignment.contains_key(&0x8008));
    }
}
