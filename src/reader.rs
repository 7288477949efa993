//! Readers of disassembled text listings.
//!
//! Accepts the text format produced by online disassemblers, for example:
//!
//! ```text
//! .text:000107ec f0 87 bd e8
//! ```
//!
//! Lines matching a function header pattern such as `.text:00010590 <main>:` open a new
//! function record; all following instruction lines belong to it until the next header.

use crate::{
    arm::Instruction,
    error::RecoverError,
    program::{Function, Program},
};
use regex::Regex;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// Byte order of an instruction word spelled as four hex byte tokens.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ByteOrder {
    LittleEndian,
    BigEndian,
}

/// Instruction sets a listing may carry. Only [InstructionSet::Arm] is accepted.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InstructionSet {
    Arm,
    Thumb,
}

/// Assembles a 32-bit encoding from four whitespace-separated hex byte tokens, such as
/// `"00 b0 a0 e3"`. Little-endian order yields `(b3 << 24) | (b2 << 16) | (b1 << 8) | b0`.
pub fn encoding_from_hex(bytes: &str, order: ByteOrder) -> Result<u32, RecoverError> {
    let mut raw = [0u8; 4];
    let mut count = 0;
    for token in bytes.split_whitespace() {
        let decoded = hex::decode(token).map_err(|_| RecoverError::MalformedInput {
            line: 0,
            reason: format!("bad hex byte {:?}", token),
        })?;
        for b in decoded {
            if count == 4 {
                return Err(RecoverError::MalformedInput {
                    line: 0,
                    reason: "more than four bytes in instruction word".into(),
                });
            }
            raw[count] = b;
            count += 1;
        }
    }
    if count != 4 {
        return Err(RecoverError::MalformedInput {
            line: 0,
            reason: "instruction word needs exactly four bytes".into(),
        });
    }
    let value = match order {
        ByteOrder::LittleEndian => u32::from_le_bytes(raw),
        ByteOrder::BigEndian => u32::from_be_bytes(raw),
    };
    Ok(value)
}

/// Reads the instructions and function partition of a disassembled text listing.
pub struct TextDisassembleReader {
    instruction_set: InstructionSet,
    header: Regex,
}

impl TextDisassembleReader {
    pub fn new(instruction_set: InstructionSet) -> Self {
        Self {
            instruction_set,
            header: Regex::new(r"^\.\w+:[0-9a-f]+\s*<[$\w]").unwrap(),
        }
    }

    pub fn open(&self, path: impl AsRef<Path>) -> Result<Program, RecoverError> {
        let file = File::open(path)?;
        self.parse(BufReader::new(file))
    }

    /// Parses a listing into a [Program]. Instructions appearing before the first
    /// function header are gathered in a leading `no_method` record; duplicated header
    /// titles are disambiguated with an incrementing suffix.
    pub fn parse<R: BufRead>(&self, input: R) -> Result<Program, RecoverError> {
        if self.instruction_set != InstructionSet::Arm {
            return Err(RecoverError::UnsupportedInstructionSet(format!(
                "{:?}",
                self.instruction_set
            )));
        }

        let mut instructions = Vec::new();
        let mut names = vec!["no_method".to_string()];
        let mut starts = vec![0usize];
        let mut duplicates = 0;

        for (number, line) in input.lines().enumerate() {
            let line = line?;
            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }
            if self.header.is_match(line) {
                let mut name = line.to_string();
                if names.contains(&name) {
                    duplicates += 1;
                    name = format!("{}{}", line, duplicates);
                }
                names.push(name);
                starts.push(instructions.len());
                continue;
            }
            let (address, encoding) =
                Self::parse_instruction_line(line).ok_or_else(|| RecoverError::MalformedInput {
                    line: number + 1,
                    reason: format!("unrecognized line {:?}", line),
                })?;
            instructions.push(Instruction::new(encoding, address));
        }

        starts.push(instructions.len());
        let functions = names
            .into_iter()
            .zip(starts.windows(2))
            .map(|(name, w)| Function::new(name, w[0]..w[1]))
            .collect();
        Ok(Program::new(instructions, functions))
    }

    /// Splits `.text:000107ec f0 87 bd e8  <trailing text>` into address and encoding.
    fn parse_instruction_line(line: &str) -> Option<(u32, u32)> {
        let rest = line.split_once(':')?.1;
        // Anything after a double space is disassembly text, not bytes.
        let rest = rest.split("  ").next()?;
        let (address, bytes) = rest.trim_start().split_once(' ')?;
        let address = u32::from_str_radix(address, 16).ok()?;
        let encoding = encoding_from_hex(bytes, ByteOrder::LittleEndian).ok()?;
        Some((address, encoding))
    }
}

impl Default for TextDisassembleReader {
    fn default() -> Self {
        Self::new(InstructionSet::Arm)
    }
}

#[cfg(test)]
mod tests {
    use super::{encoding_from_hex, ByteOrder, InstructionSet, TextDisassembleReader};
    use std::io::Cursor;

    const LISTING: &str = "\
.text:00010580 <start>:
.text:00010580 04 b0 2d e5
.text:00010584 00 b0 a0 e3
.text:00010588 01 00 50 e1
.text:0001058c <other>:
.text:0001058c fb ff ff 1a
.text:00010590 1e ff 2f e1
";

    #[test]
    fn test_create_hex_little_endian() {
        assert_eq!(
            encoding_from_hex("00 b0 a0 e3", ByteOrder::LittleEndian).unwrap(),
            3818958848
        );
    }

    #[test]
    fn test_create_hex_big_endian() {
        assert_eq!(
            encoding_from_hex("00 b0 a0 e3", ByteOrder::BigEndian).unwrap(),
            11575523
        );
    }

    #[test]
    fn test_rejects_bad_words() {
        assert!(encoding_from_hex("00 b0 a0", ByteOrder::LittleEndian).is_err());
        assert!(encoding_from_hex("00 b0 a0 e3 ff", ByteOrder::LittleEndian).is_err());
        assert!(encoding_from_hex("zz b0 a0 e3", ByteOrder::LittleEndian).is_err());
    }

    #[test]
    fn test_parse_functions() {
        let reader = TextDisassembleReader::default();
        let program = reader.parse(Cursor::new(LISTING)).unwrap();
        assert_eq!(program.len(), 5);
        assert_eq!(program.functions().len(), 3);
        assert_eq!(program.functions()[0].name, "no_method");
        assert!(program.functions()[0].is_empty());
        assert_eq!(program.functions()[1].range, 0..3);
        assert_eq!(program.functions()[2].range, 3..5);
        assert_eq!(program.first_address(), Some(0x10580));
        assert_eq!(program.instruction_at(0x10584).unwrap().encoding(), 0xe3a0b000);
    }

    #[test]
    fn test_thumb_is_rejected() {
        let reader = TextDisassembleReader::new(InstructionSet::Thumb);
        assert!(reader.parse(Cursor::new(LISTING)).is_err());
    }

    #[test]
    fn test_malformed_line_is_fatal() {
        let reader = TextDisassembleReader::default();
        assert!(reader.parse(Cursor::new("garbage line\n")).is_err());
    }
}
