//! Corruption descriptors and candidate generation.
//!
//! Three descriptor forms produce the same in-memory candidate store: a packet-loss
//! model (every word of a lost packet is corrupted), a random model, and an explicit
//! JSON document listing the corrupted addresses with their candidate encodings. The
//! first two know the ground truth and keep exactly one matching candidate in each
//! shortlist, which tests and reports rely on.

use crate::{
    arm::Instruction,
    candidate::{Candidate, CandidateStore},
    error::RecoverError,
    program::Program,
};
use log::info;
use lru::LruCache;
use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::num::NonZeroUsize;

/// Produces decode-valid candidate encodings for corrupted addresses.
///
/// The same candidate encodings recur at every corrupted address, so validity
/// verdicts are cached by encoding.
pub struct CandidateGenerator {
    cache: LruCache<u32, bool>,
}

impl CandidateGenerator {
    pub fn new() -> Self {
        Self {
            cache: LruCache::new(NonZeroUsize::new(4096).unwrap()),
        }
    }

    /// Whether an encoding decodes to something defined. Validity does not depend on
    /// the address.
    pub fn is_valid(&mut self, encoding: u32) -> bool {
        if let Some(valid) = self.cache.get(&encoding) {
            return *valid;
        }
        let valid = !Instruction::new(encoding, 0).is_undefined();
        self.cache.put(encoding, valid);
        valid
    }

    /// Builds a shortlist of `count` decode-valid candidates at `address`, containing
    /// the ground-truth word exactly once. The other entries are mutations of the
    /// truth over the heuristic opcode families: condition swaps, opcode swaps,
    /// register and immediate perturbations.
    pub fn shortlist<R: Rng>(
        &mut self,
        truth: u32,
        address: u32,
        count: usize,
        rng: &mut R,
    ) -> Vec<Candidate> {
        let mut encodings = vec![truth];
        let mut attempts = 0;
        while encodings.len() < count.max(1) && attempts < 10_000 {
            attempts += 1;
            let variant = self.mutate(truth, rng);
            if variant != truth && !encodings.contains(&variant) && self.is_valid(variant) {
                encodings.push(variant);
            }
        }
        encodings.shuffle(rng);
        encodings
            .into_iter()
            .map(|e| Candidate::new(Instruction::new(e, address)))
            .collect()
    }

    fn mutate<R: Rng>(&mut self, truth: u32, rng: &mut R) -> u32 {
        match rng.random_range(0..4) {
            // New condition field.
            0 => (truth & 0x0fff_ffff) | (rng.random_range(0..15u32) << 28),
            // Single bit flip below the condition field.
            1 => truth ^ (1 << rng.random_range(0..28)),
            // Fresh register in one of the four register slots.
            2 => {
                let offset = [0, 8, 12, 16][rng.random_range(0..4)];
                (truth & !(0xf << offset)) | (rng.random_range(0..16u32) << offset)
            }
            // New opcode bits within the instruction family.
            _ => (truth & !(0xf << 21)) | (rng.random_range(0..16u32) << 21),
        }
    }

    /// Lazily enumerates every valid encoding whose fixed bits match
    /// `value` under `mask`, in ascending encoding order. No encoding below
    /// `value & mask` can match, so scanning starts there.
    pub fn enumerate(mask: u32, value: u32) -> ValidEncodings {
        let value = value & mask;
        ValidEncodings {
            next: value as u64,
            mask,
            value,
        }
    }
}

impl Default for CandidateGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterator over the decode-valid encodings matching a fixed-bit pattern.
pub struct ValidEncodings {
    next: u64,
    mask: u32,
    value: u32,
}

impl Iterator for ValidEncodings {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        while self.next <= u32::MAX as u64 {
            let encoding = self.next as u32;
            self.next += 1;
            if encoding & self.mask == self.value
                && !Instruction::new(encoding, 0).is_undefined()
            {
                return Some(encoding);
            }
        }
        None
    }
}

/// Packet-loss descriptor: the image is cut into fixed-size packets and whole packets
/// go missing.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PacketDescriptor {
    pub packet_size_words: usize,
    pub packets_lost: Vec<usize>,
    #[serde(default)]
    pub candidates_per_address: Option<usize>,
    #[serde(default)]
    pub seed: Option<u64>,
}

/// Random-loss descriptor: every word is lost independently with some probability.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RandomDescriptor {
    pub loss_percent: f64,
    pub candidates_per_address: usize,
    #[serde(default)]
    pub seed: Option<u64>,
}

/// The three corruption descriptor forms accepted on the wire.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum CorruptionSpec {
    Packet {
        packet: PacketDescriptor,
    },
    Random {
        random: RandomDescriptor,
    },
    /// Explicit corrupted addresses with their candidate encodings, keyed by decimal
    /// address.
    Explicit {
        corrupted: Vec<u32>,
        candidates: BTreeMap<String, Vec<u32>>,
    },
}

impl CorruptionSpec {
    pub fn from_json(json: &str) -> Result<Self, RecoverError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Applies the descriptor to a store freshly built from `program`.
    ///
    /// `candidates_per_address` is the fallback shortlist size for descriptors that do
    /// not carry their own.
    pub fn apply(
        &self,
        program: &Program,
        store: &mut CandidateStore,
        candidates_per_address: usize,
    ) -> Result<(), RecoverError> {
        match self {
            CorruptionSpec::Packet { packet } => {
                let count = packet.candidates_per_address.unwrap_or(candidates_per_address);
                let mut corruptor = PacketCorruptor::new(packet.clone(), count);
                corruptor.corrupt(program, store);
                Ok(())
            }
            CorruptionSpec::Random { random } => {
                let mut corruptor = RandomCorruptor::new(random.clone());
                corruptor.corrupt(program, store);
                Ok(())
            }
            CorruptionSpec::Explicit {
                corrupted,
                candidates,
            } => apply_explicit(corrupted, candidates, program, store),
        }
    }

    /// Captures the corruption of a store as an explicit descriptor, so a run can be
    /// replayed.
    pub fn from_store(store: &CandidateStore) -> Self {
        let corrupted: Vec<u32> = store.corrupted_addresses().collect();
        let candidates = corrupted
            .iter()
            .map(|a| {
                (
                    a.to_string(),
                    store.candidates(*a).iter().map(|c| c.encoding()).collect(),
                )
            })
            .collect();
        CorruptionSpec::Explicit {
            corrupted,
            candidates,
        }
    }
}

fn apply_explicit(
    corrupted: &[u32],
    candidates: &BTreeMap<String, Vec<u32>>,
    program: &Program,
    store: &mut CandidateStore,
) -> Result<(), RecoverError> {
    for address in corrupted {
        let encodings =
            candidates
                .get(&address.to_string())
                .ok_or_else(|| RecoverError::MalformedInput {
                    line: 0,
                    reason: format!("no candidates for corrupted address {:#x}", address),
                })?;
        if encodings.is_empty() {
            return Err(RecoverError::MalformedInput {
                line: 0,
                reason: format!("empty candidate list at address {:#x}", address),
            });
        }
        if program.instruction_at(*address).is_none() {
            return Err(RecoverError::MalformedInput {
                line: 0,
                reason: format!("corrupted address {:#x} outside the image", address),
            });
        }
        let list = encodings
            .iter()
            .map(|e| Candidate::new(Instruction::new(*e, *address)))
            .collect();
        store.corrupt(*address, list);
    }
    Ok(())
}

/// Marks every word of the lost packets corrupted and generates shortlists for them.
pub struct PacketCorruptor {
    descriptor: PacketDescriptor,
    candidates_per_address: usize,
    generator: CandidateGenerator,
}

impl PacketCorruptor {
    pub fn new(descriptor: PacketDescriptor, candidates_per_address: usize) -> Self {
        Self {
            descriptor,
            candidates_per_address,
            generator: CandidateGenerator::new(),
        }
    }

    pub fn corrupt(&mut self, program: &Program, store: &mut CandidateStore) {
        let mut rng = StdRng::seed_from_u64(self.descriptor.seed.unwrap_or(0));
        let size = self.descriptor.packet_size_words.max(1);
        let mut lost = 0;
        for packet in &self.descriptor.packets_lost {
            let start = packet * size;
            let end = ((packet + 1) * size).min(program.len());
            for index in start..end {
                let ins = &program.instructions()[index];
                let shortlist = self.generator.shortlist(
                    ins.encoding(),
                    ins.address(),
                    self.candidates_per_address,
                    &mut rng,
                );
                store.corrupt(ins.address(), shortlist);
                lost += 1;
            }
        }
        info!(
            "program corrupted: {} words lost over {} packets",
            lost,
            self.descriptor.packets_lost.len()
        );
    }
}

/// Corrupts every word independently with probability `loss_percent / 100`.
pub struct RandomCorruptor {
    descriptor: RandomDescriptor,
    generator: CandidateGenerator,
}

impl RandomCorruptor {
    pub fn new(descriptor: RandomDescriptor) -> Self {
        Self {
            descriptor,
            generator: CandidateGenerator::new(),
        }
    }

    pub fn corrupt(&mut self, program: &Program, store: &mut CandidateStore) {
        let mut rng = StdRng::seed_from_u64(self.descriptor.seed.unwrap_or(0));
        let mut lost = 0;
        for ins in program.instructions() {
            if rng.random::<f64>() * 100.0 >= self.descriptor.loss_percent {
                continue;
            }
            let shortlist = self.generator.shortlist(
                ins.encoding(),
                ins.address(),
                self.descriptor.candidates_per_address,
                &mut rng,
            );
            store.corrupt(ins.address(), shortlist);
            lost += 1;
        }
        info!("program corrupted: {} words lost at random", lost);
    }
}

#[cfg(test)]
mod tests {
    use super::{CandidateGenerator, CorruptionSpec, PacketCorruptor, PacketDescriptor};
    use crate::{arm::Instruction, candidate::CandidateStore, program::Program};
    use rand::{rngs::StdRng, SeedableRng};

    fn sample_program() -> Program {
        let encodings: Vec<u32> = (0..8)
            .map(|i| 0xe3a00000 | ((i as u32) << 12))
            .collect();
        Program::from_encodings(0x8000, &encodings)
    }

    #[test]
    fn test_shortlist_contains_truth_once() {
        let mut generator = CandidateGenerator::new();
        let mut rng = StdRng::seed_from_u64(7);
        let shortlist = generator.shortlist(0xe3a02001, 0x8008, 5, &mut rng);
        assert_eq!(shortlist.len(), 5);
        let truth = shortlist
            .iter()
            .filter(|c| c.encoding() == 0xe3a02001)
            .count();
        assert_eq!(truth, 1);
        for candidate in &shortlist {
            assert!(!candidate.instruction().is_undefined());
            assert_eq!(candidate.instruction().address(), 0x8008);
        }
    }

    #[test]
    fn test_enumeration_is_lazy_and_filtered() {
        // Branch family: condition always, bits 27:25 = 101.
        let some: Vec<u32> = CandidateGenerator::enumerate(0xfe000000, 0xea000000)
            .take(3)
            .collect();
        assert_eq!(some.len(), 3);
        for encoding in some {
            let ins = Instruction::new(encoding, 0);
            assert!(!ins.is_undefined());
            assert!(ins.is_branch());
        }
    }

    #[test]
    fn test_packet_corruptor_marks_whole_packet() {
        let program = sample_program();
        let mut store = CandidateStore::from_program(&program);
        let descriptor = PacketDescriptor {
            packet_size_words: 4,
            packets_lost: vec![1],
            candidates_per_address: None,
            seed: Some(1),
        };
        PacketCorruptor::new(descriptor, 3).corrupt(&program, &mut store);

        let corrupted: Vec<u32> = store.corrupted_addresses().collect();
        assert_eq!(corrupted, vec![0x8010, 0x8014, 0x8018, 0x801c]);
        for address in corrupted {
            assert_eq!(store.candidates(address).len(), 3);
        }
        assert!(store.is_known(0x8000));
    }

    #[test]
    fn test_explicit_descriptor_roundtrip() {
        let program = sample_program();
        let mut store = CandidateStore::from_program(&program);
        let json = r#"{
            "corrupted": [32776],
            "candidates": { "32776": [3818921985, 329261057] }
        }"#;
        let spec = CorruptionSpec::from_json(json).unwrap();
        spec.apply(&program, &mut store, 4).unwrap();
        assert_eq!(store.candidates(0x8008).len(), 2);
        assert!(store.is_corrupted(0x8008));

        // Capture and re-apply on a fresh store.
        let captured = CorruptionSpec::from_store(&store);
        let mut other = CandidateStore::from_program(&program);
        captured.apply(&program, &mut other, 4).unwrap();
        assert_eq!(other.candidates(0x8008).len(), 2);
    }

    #[test]
    fn test_explicit_descriptor_requires_candidates() {
        let program = sample_program();
        let mut store = CandidateStore::from_program(&program);
        let json = r#"{ "corrupted": [32776], "candidates": {} }"#;
        let spec = CorruptionSpec::from_json(json).unwrap();
        assert!(spec.apply(&program, &mut store, 4).is_err());
    }
}
