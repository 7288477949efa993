//! Per-address neighbourhood metadata, collected in a single linear sweep.
//!
//! The scoring rules do not walk the program themselves; they consult this structure
//! for the conditionals of nearby known instructions and for flag-write witnesses. An
//! instruction counts as known when its address still holds exactly one candidate and
//! that candidate decodes to something defined.

use crate::{candidate::CandidateStore, condition::Condition, program::Program};
use std::collections::BTreeMap;

/// Neighbourhood facts for one address.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AddressMetadata {
    /// Conditionals of the nearest known instructions before this address, nearest
    /// first, bounded by the collector window and the function.
    pub conditionals_before: Vec<Condition>,
    /// Conditionals of the nearest known instructions after this address, nearest
    /// first, bounded likewise.
    pub conditionals_after: Vec<Condition>,
    /// Whether the nearest preceding known instruction writes the condition flags.
    pub prev_writes_flags: bool,
    /// Address of the most recent preceding known flag-writing instruction inside the
    /// same function.
    pub last_flag_write: Option<u32>,
}

/// Metadata for every program address.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Metadata {
    per_address: BTreeMap<u32, AddressMetadata>,
}

impl Metadata {
    pub fn at(&self, address: u32) -> Option<&AddressMetadata> {
        self.per_address.get(&address)
    }

    /// Conditional of the nearest preceding known instruction, if any.
    pub fn prev_conditional(&self, address: u32) -> Option<Condition> {
        self.at(address)?.conditionals_before.first().copied()
    }

    /// Conditional of the nearest following known instruction, if any.
    pub fn next_conditional(&self, address: u32) -> Option<Condition> {
        self.at(address)?.conditionals_after.first().copied()
    }

    pub fn prev_writes_flags(&self, address: u32) -> bool {
        self.at(address).map(|m| m.prev_writes_flags).unwrap_or(false)
    }

    pub fn follows_flag_write(&self, address: u32) -> bool {
        self.at(address)
            .map(|m| m.last_flag_write.is_some())
            .unwrap_or(false)
    }
}

/// Sweeps a program once and precomputes the per-address neighbourhoods.
///
/// Collection is idempotent: sweeping the same program and store twice yields equal
/// metadata.
pub struct MetadataCollector {
    window: usize,
}

impl MetadataCollector {
    pub fn new() -> Self {
        Self { window: 2 }
    }

    /// Sets how many known conditionals are remembered on each side of an address.
    pub fn with_window(window: usize) -> Self {
        Self { window }
    }

    pub fn collect(&self, program: &Program, store: &CandidateStore) -> Metadata {
        let instructions = program.instructions();
        let known: Vec<bool> = instructions
            .iter()
            .map(|i| store.is_known(i.address()) && !i.is_undefined())
            .collect();

        let mut per_address: BTreeMap<u32, AddressMetadata> = instructions
            .iter()
            .map(|i| (i.address(), AddressMetadata::default()))
            .collect();

        for function in program.functions().iter().filter(|f| !f.is_empty()) {
            let range = function.range.clone();

            // Forward sweep: conditionals before, flag-write witnesses.
            let mut before: Vec<Condition> = Vec::new();
            let mut prev_writes_flags = false;
            let mut last_flag_write = None;
            for index in range.clone() {
                let ins = &instructions[index];
                let meta = per_address.get_mut(&ins.address()).unwrap();
                meta.conditionals_before = before.iter().rev().take(self.window).copied().collect();
                meta.prev_writes_flags = prev_writes_flags;
                meta.last_flag_write = last_flag_write;
                if known[index] {
                    before.push(ins.condition());
                    prev_writes_flags = ins.writes_flags();
                    if ins.writes_flags() {
                        last_flag_write = Some(ins.address());
                    }
                }
            }

            // Backward sweep: conditionals after.
            let mut after: Vec<Condition> = Vec::new();
            for index in range.rev() {
                let ins = &instructions[index];
                let meta = per_address.get_mut(&ins.address()).unwrap();
                meta.conditionals_after = after.iter().rev().take(self.window).copied().collect();
                if known[index] {
                    after.push(ins.condition());
                }
            }
        }

        Metadata { per_address }
    }
}

impl Default for MetadataCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::MetadataCollector;
    use crate::{candidate::CandidateStore, condition::Condition, program::Program};

    fn sample() -> Program {
        // mov r0, #0 ; cmp r0, r1 ; bne -4 ; movne r2, #1 ; bx lr
        Program::from_encodings(
            0x8000,
            &[0xe3a00000, 0xe1500001, 0x1afffffa, 0x13a02001, 0xe12fff1e],
        )
    }

    #[test]
    fn test_neighbour_conditionals() {
        let program = sample();
        let store = CandidateStore::from_program(&program);
        let metadata = MetadataCollector::new().collect(&program, &store);

        assert_eq!(metadata.prev_conditional(0x8000), None);
        assert_eq!(metadata.prev_conditional(0x8004), Some(Condition::Always));
        assert_eq!(metadata.prev_conditional(0x800c), Some(Condition::NotEqual));
        assert_eq!(metadata.next_conditional(0x8008), Some(Condition::NotEqual));
        let at = metadata.at(0x8008).unwrap();
        assert_eq!(
            at.conditionals_before,
            vec![Condition::Always, Condition::Always]
        );
    }

    #[test]
    fn test_flag_write_witnesses() {
        let program = sample();
        let store = CandidateStore::from_program(&program);
        let metadata = MetadataCollector::new().collect(&program, &store);

        assert!(!metadata.prev_writes_flags(0x8004));
        assert!(metadata.prev_writes_flags(0x8008));
        assert!(!metadata.prev_writes_flags(0x800c));
        assert!(metadata.follows_flag_write(0x8010));
        assert_eq!(metadata.at(0x8010).unwrap().last_flag_write, Some(0x8004));
    }

    #[test]
    fn test_collect_is_idempotent() {
        let program = sample();
        let store = CandidateStore::from_program(&program);
        let collector = MetadataCollector::new();
        let first = collector.collect(&program, &store);
        let second = collector.collect(&program, &store);
        assert_eq!(first, second);
    }

    #[test]
    fn test_corrupted_neighbours_are_unknown() {
        let program = sample();
        let mut store = CandidateStore::from_program(&program);
        let cmp = program.instruction_at(0x8004).unwrap().clone();
        store.corrupt(
            0x8004,
            vec![
                crate::candidate::Candidate::new(cmp.clone()),
                crate::candidate::Candidate::new(crate::arm::Instruction::new(
                    0xe3a02001, 0x8004,
                )),
            ],
        );
        let metadata = MetadataCollector::new().collect(&program, &store);
        // The corrupted cmp no longer witnesses as previous instruction.
        assert!(!metadata.prev_writes_flags(0x8008));
        assert_eq!(metadata.prev_conditional(0x8008), Some(Condition::Always));
    }
}
