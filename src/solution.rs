//! Solution output in the compact binary exchange format.
//!
//! Records are address-sorted, 9 bytes each: `u32 address || u32 encoding ||
//! u8 confidence`, all little-endian. Confidence maps the candidate score onto
//! `0..=255`.

use crate::{candidate::CandidateStore, error::RecoverError, solver::Assignment};
use byteorder::{LittleEndian, WriteBytesExt};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

pub struct SolutionWriter;

impl SolutionWriter {
    pub fn new() -> Self {
        Self
    }

    /// Writes one record per program address. When an `assignment` is given, its
    /// choices override the store's ranking at the corrupted addresses it covers.
    pub fn write_binary<W: Write>(
        &self,
        writer: &mut W,
        store: &CandidateStore,
        assignment: Option<&Assignment>,
    ) -> io::Result<()> {
        for address in store.addresses().collect::<Vec<_>>() {
            let chosen = assignment.and_then(|a| a.get(&address));
            let (encoding, score) = match chosen {
                Some(ins) => {
                    let score = store
                        .candidates(address)
                        .iter()
                        .find(|c| c.encoding() == ins.encoding())
                        .map(|c| c.score())
                        .unwrap_or(1.0);
                    (ins.encoding(), score)
                }
                None => {
                    let best = store.best(address).expect("store address without candidates");
                    (best.encoding(), best.score())
                }
            };
            writer.write_u32::<LittleEndian>(address)?;
            writer.write_u32::<LittleEndian>(encoding)?;
            writer.write_u8(confidence(score))?;
        }
        Ok(())
    }

    pub fn write_binary_to_path(
        &self,
        path: impl AsRef<Path>,
        store: &CandidateStore,
        assignment: Option<&Assignment>,
    ) -> Result<(), RecoverError> {
        let mut writer = BufWriter::new(File::create(path)?);
        self.write_binary(&mut writer, store, assignment)?;
        Ok(())
    }
}

impl Default for SolutionWriter {
    fn default() -> Self {
        Self::new()
    }
}

fn confidence(score: f64) -> u8 {
    (score.clamp(0.0, 1.0) * 255.0).round() as u8
}

#[cfg(test)]
mod tests {
    use super::SolutionWriter;
    use crate::{
        arm::Instruction,
        candidate::{Candidate, CandidateStore},
        program::Program,
        solver::Assignment,
    };

    #[test]
    fn test_record_layout() {
        let program = Program::from_encodings(0x8000, &[0xe3a00000, 0xe12fff1e]);
        let store = CandidateStore::from_program(&program);
        let mut out = Vec::new();
        SolutionWriter::new()
            .write_binary(&mut out, &store, None)
            .unwrap();

        assert_eq!(out.len(), 18);
        assert_eq!(&out[0..4], &0x8000u32.to_le_bytes());
        assert_eq!(&out[4..8], &0xe3a00000u32.to_le_bytes());
        assert_eq!(out[8], 255);
        assert_eq!(&out[9..13], &0x8004u32.to_le_bytes());
        assert_eq!(&out[13..17], &0xe12fff1eu32.to_le_bytes());
    }

    #[test]
    fn test_assignment_overrides_ranking() {
        let program = Program::from_encodings(0x8000, &[0xe3a00000]);
        let mut store = CandidateStore::from_program(&program);
        let mut wrong = Candidate::new(Instruction::new(0xe3a00001, 0x8000));
        wrong.record("r", 1.0);
        let mut truth = Candidate::new(Instruction::new(0xe3a00000, 0x8000));
        truth.record("r", 0.5);
        store.corrupt(0x8000, vec![wrong, truth]);

        let mut assignment = Assignment::new();
        assignment.insert(0x8000, Instruction::new(0xe3a00000, 0x8000));
        let mut out = Vec::new();
        SolutionWriter::new()
            .write_binary(&mut out, &store, Some(&assignment))
            .unwrap();
        assert_eq!(&out[4..8], &0xe3a00000u32.to_le_bytes());
        assert_eq!(out[8], 128);
    }
}
