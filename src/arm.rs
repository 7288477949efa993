//! ARM instruction model and A32 instruction decoding.
//!
//! [Instruction::new] is total: any 32-bit word decodes to an [Instruction]. Encodings
//! outside the supported ARMv7-A user-mode subset yield [OpcodeClass::Undefined] with
//! empty register sets instead of an error, since corrupted words routinely produce
//! garbage encodings and the recovery engine must keep going.

use crate::{
    condition::Condition,
    helpers::{is_word_aligned, sign_extend, BitAccess},
    program::Program,
    registers::{RegisterIndex, RegisterSet},
};
use std::fmt::{self, Display};

/// Broad family of an instruction encoding.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OpcodeClass {
    DataProcessing,
    /// MRS and MSR status register transfers.
    StatusTransfer,
    Multiply,
    Swap,
    Load,
    Store,
    LoadMultiple,
    StoreMultiple,
    Branch,
    /// BX and BLX register forms.
    BranchExchange,
    Coprocessor,
    SoftwareInterrupt,
    Undefined,
}

/// How a branch decides its destination.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BranchTarget {
    /// Absolute destination address computed from a PC-relative offset.
    Absolute(u32),
    /// Destination held in a register, unknown to static analysis.
    Register(RegisterIndex),
    /// Destination cannot be determined (PC written by a non-branch operation).
    Unknown,
}

/// A decoded 32-bit ARM instruction, identified by its address in the program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    encoding: u32,
    address: u32,
    class: OpcodeClass,
    condition: Condition,
    reads: RegisterSet,
    writes: RegisterSet,
    writes_flags: bool,
    branch: Option<BranchTarget>,
    link: bool,
}

const DP_NAMES: [&str; 16] = [
    "and", "eor", "sub", "rsb", "add", "adc", "sbc", "rsc", "tst", "teq", "cmp", "cmn", "orr",
    "mov", "bic", "mvn",
];

impl Instruction {
    /// Decodes a 32-bit word located at `address`.
    pub fn new(encoding: u32, address: u32) -> Self {
        debug_assert!(is_word_aligned(address));
        let condition = match Condition::try_from(encoding >> 28) {
            Ok(c) => c,
            // Condition value 15 selects the unconditional extension space, which is not
            // part of the accepted subset.
            Err(_) => return Self::undefined(encoding, address),
        };
        let mut ins = Self {
            encoding,
            address,
            class: OpcodeClass::Undefined,
            condition,
            reads: RegisterSet::default(),
            writes: RegisterSet::default(),
            writes_flags: false,
            branch: None,
            link: false,
        };
        match encoding.field(25, 3) {
            0b000 | 0b001 => ins.decode_data_processing(),
            0b010 | 0b011 => ins.decode_single_transfer(),
            0b100 => ins.decode_block_transfer(),
            0b101 => ins.decode_branch(),
            0b110 => ins.decode_coprocessor_transfer(),
            0b111 => ins.decode_coprocessor_or_swi(),
            _ => unreachable!(),
        }
        ins
    }

    fn undefined(encoding: u32, address: u32) -> Self {
        Self {
            encoding,
            address,
            class: OpcodeClass::Undefined,
            condition: Condition::Always,
            reads: RegisterSet::default(),
            writes: RegisterSet::default(),
            writes_flags: false,
            branch: None,
            link: false,
        }
    }

    fn mark_undefined(&mut self) {
        self.class = OpcodeClass::Undefined;
        self.reads = RegisterSet::default();
        self.writes = RegisterSet::default();
        self.writes_flags = false;
        self.branch = None;
        self.link = false;
    }

    fn rn(&self) -> RegisterIndex {
        RegisterIndex::new_main(self.encoding.field(16, 4))
    }

    fn rd(&self) -> RegisterIndex {
        RegisterIndex::new_main(self.encoding.field(12, 4))
    }

    fn rs(&self) -> RegisterIndex {
        RegisterIndex::new_main(self.encoding.field(8, 4))
    }

    fn rm(&self) -> RegisterIndex {
        RegisterIndex::new_main(self.encoding.field(0, 4))
    }

    fn decode_data_processing(&mut self) {
        let e = self.encoding;
        let immediate = e.bit(25);
        if !immediate && e.bit(7) && e.bit(4) {
            // Multiply, swap and halfword transfer space.
            return self.decode_multiply_or_extra_transfer();
        }
        let opcode = e.field(21, 4);
        let s = e.bit(20);
        if (8..=11).contains(&opcode) && !s {
            // Compare opcodes without the S bit hold the miscellaneous instructions.
            return self.decode_miscellaneous();
        }
        self.class = OpcodeClass::DataProcessing;
        self.writes_flags = s;
        // MOV and MVN ignore Rn.
        if opcode != 13 && opcode != 15 {
            self.reads.insert(self.rn());
        }
        if !(8..=11).contains(&opcode) {
            self.writes.insert(self.rd());
        }
        if !immediate {
            self.reads.insert(self.rm());
            if e.bit(4) {
                self.reads.insert(self.rs());
            }
        }
        if self.writes.has_pc() {
            // Writing PC turns the operation into a branch. Only the plain register MOV
            // has a destination static analysis can name.
            let target = if opcode == 13 && !immediate && e.field(4, 8) == 0 {
                BranchTarget::Register(self.rm())
            } else {
                BranchTarget::Unknown
            };
            self.branch = Some(target);
        }
    }

    fn decode_multiply_or_extra_transfer(&mut self) {
        let e = self.encoding;
        if e.field(5, 2) == 0 {
            // 1001 in bits 7:4 selects multiply and swap.
            if e.field(23, 5) == 0 {
                if e.bit(22) {
                    return self.mark_undefined();
                }
                // MUL / MLA. Rd lives in bits 19:16 here.
                self.class = OpcodeClass::Multiply;
                self.writes_flags = e.bit(20);
                self.writes.insert(self.rn());
                self.reads.insert(self.rm());
                self.reads.insert(self.rs());
                if e.bit(21) {
                    self.reads.insert(self.rd());
                }
            } else if e.field(23, 5) == 1 {
                // UMULL / UMLAL / SMULL / SMLAL.
                self.class = OpcodeClass::Multiply;
                self.writes_flags = e.bit(20);
                self.writes.insert(self.rn());
                self.writes.insert(self.rd());
                self.reads.insert(self.rm());
                self.reads.insert(self.rs());
                if e.bit(21) {
                    // Accumulating forms also read the destination pair.
                    self.reads.insert(self.rn());
                    self.reads.insert(self.rd());
                }
            } else if e.field(23, 5) == 2 && e.field(20, 2) == 0 && e.field(8, 4) == 0 {
                // SWP / SWPB.
                self.class = OpcodeClass::Swap;
                self.reads.insert(self.rn());
                self.reads.insert(self.rm());
                self.writes.insert(self.rd());
            } else {
                self.mark_undefined();
            }
        } else {
            // Halfword and signed byte transfers.
            let load = e.bit(20);
            if !load && e.field(5, 2) != 1 {
                // Dual transfers are outside the accepted subset.
                return self.mark_undefined();
            }
            self.reads.insert(self.rn());
            if !e.bit(22) {
                self.reads.insert(self.rm());
            }
            if load {
                self.class = OpcodeClass::Load;
                self.writes.insert(self.rd());
            } else {
                self.class = OpcodeClass::Store;
                self.reads.insert(self.rd());
            }
            if !e.bit(24) || e.bit(21) {
                self.writes.insert(self.rn());
            }
            if load && self.rd().is_pc() {
                self.branch = Some(BranchTarget::Unknown);
            }
        }
    }

    fn decode_miscellaneous(&mut self) {
        let e = self.encoding;
        if e & 0x0fbf0fff == 0x010f0000 {
            // MRS
            self.class = OpcodeClass::StatusTransfer;
            self.writes.insert(self.rd());
        } else if e & 0x0fb0fff0 == 0x0120f000 {
            // MSR (register)
            self.class = OpcodeClass::StatusTransfer;
            self.reads.insert(self.rm());
            self.writes_flags = true;
        } else if e & 0x0fb0f000 == 0x0320f000 {
            // MSR (immediate)
            self.class = OpcodeClass::StatusTransfer;
            self.writes_flags = true;
        } else if e & 0x0ff00000 == 0x03000000 {
            // MOVW
            self.class = OpcodeClass::DataProcessing;
            self.writes.insert(self.rd());
        } else if e & 0x0ff00000 == 0x03400000 {
            // MOVT
            self.class = OpcodeClass::DataProcessing;
            self.reads.insert(self.rd());
            self.writes.insert(self.rd());
        } else if e & 0x0ffffff0 == 0x012fff10 {
            // BX
            self.class = OpcodeClass::BranchExchange;
            self.reads.insert(self.rm());
            self.branch = Some(BranchTarget::Register(self.rm()));
        } else if e & 0x0ffffff0 == 0x012fff30 {
            // BLX (register)
            self.class = OpcodeClass::BranchExchange;
            self.reads.insert(self.rm());
            self.writes.insert(RegisterIndex::Lr);
            self.branch = Some(BranchTarget::Register(self.rm()));
            self.link = true;
        } else if e & 0x0fff0ff0 == 0x016f0f10 {
            // CLZ
            self.class = OpcodeClass::DataProcessing;
            self.reads.insert(self.rm());
            self.writes.insert(self.rd());
        } else {
            self.mark_undefined();
        }
    }

    fn decode_single_transfer(&mut self) {
        let e = self.encoding;
        let register_offset = e.bit(25);
        if register_offset && e.bit(4) {
            // Media space in ARMv6 and later.
            return self.mark_undefined();
        }
        let load = e.bit(20);
        self.reads.insert(self.rn());
        if register_offset {
            self.reads.insert(self.rm());
        }
        if load {
            self.class = OpcodeClass::Load;
            self.writes.insert(self.rd());
        } else {
            self.class = OpcodeClass::Store;
            self.reads.insert(self.rd());
        }
        // Post-indexed or explicit writeback updates the base register.
        if !e.bit(24) || e.bit(21) {
            self.writes.insert(self.rn());
        }
        if load && self.rd().is_pc() {
            self.branch = Some(BranchTarget::Unknown);
        }
    }

    fn decode_block_transfer(&mut self) {
        let e = self.encoding;
        let list = RegisterSet::new(e.field(0, 16) as u16);
        if list.is_empty() {
            return self.mark_undefined();
        }
        let load = e.bit(20);
        self.reads.insert(self.rn());
        if e.bit(21) {
            self.writes.insert(self.rn());
        }
        if load {
            self.class = OpcodeClass::LoadMultiple;
            self.writes = self.writes.union(&list);
            if list.has_pc() {
                self.branch = Some(BranchTarget::Unknown);
            }
        } else {
            self.class = OpcodeClass::StoreMultiple;
            self.reads = self.reads.union(&list);
        }
    }

    fn decode_branch(&mut self) {
        let e = self.encoding;
        self.class = OpcodeClass::Branch;
        self.link = e.bit(24);
        if self.link {
            self.writes.insert(RegisterIndex::Lr);
        }
        // ARM pipeline: PC reads as the instruction address plus 8.
        let offset = sign_extend(e.field(0, 24) << 2, 26);
        let target = self.address.wrapping_add(8).wrapping_add(offset as u32);
        self.branch = Some(BranchTarget::Absolute(target));
    }

    fn decode_coprocessor_transfer(&mut self) {
        self.class = OpcodeClass::Coprocessor;
        self.reads.insert(self.rn());
        if self.encoding.bit(21) {
            self.writes.insert(self.rn());
        }
    }

    fn decode_coprocessor_or_swi(&mut self) {
        let e = self.encoding;
        if e.bit(24) {
            self.class = OpcodeClass::SoftwareInterrupt;
            return;
        }
        self.class = OpcodeClass::Coprocessor;
        if e.bit(4) {
            if e.bit(20) {
                // MRC. With Rd 15 the flags receive the coprocessor result.
                if self.rd().is_pc() {
                    self.writes_flags = true;
                } else {
                    self.writes.insert(self.rd());
                }
            } else {
                // MCR
                self.reads.insert(self.rd());
            }
        }
    }

    pub fn encoding(&self) -> u32 {
        self.encoding
    }

    pub fn address(&self) -> u32 {
        self.address
    }

    pub fn class(&self) -> OpcodeClass {
        self.class
    }

    pub fn condition(&self) -> Condition {
        self.condition
    }

    pub fn is_undefined(&self) -> bool {
        self.class == OpcodeClass::Undefined
    }

    pub fn is_conditional(&self) -> bool {
        !self.condition.is_always()
    }

    /// Registers whose value the instruction consumes.
    pub fn registers_read(&self) -> RegisterSet {
        self.reads
    }

    /// Registers the instruction overwrites.
    pub fn registers_written(&self) -> RegisterSet {
        self.writes
    }

    /// Registers whose values must already be meaningful for the instruction to make
    /// sense. Everything the instruction reads, except the data a store spills: saving
    /// an untouched callee-saved register is how every prologue starts.
    pub fn registers_required(&self) -> RegisterSet {
        match self.class {
            OpcodeClass::Store => {
                let mut set = RegisterSet::of(&[self.rn()]);
                let e = self.encoding;
                if e.field(25, 3) >= 2 {
                    if e.bit(25) {
                        set.insert(self.rm());
                    }
                } else if !e.bit(22) {
                    set.insert(self.rm());
                }
                set
            }
            OpcodeClass::StoreMultiple | OpcodeClass::Swap => RegisterSet::of(&[self.rn()]),
            _ => self.registers_read(),
        }
    }

    /// Returns true when the instruction updates the condition flags.
    pub fn writes_flags(&self) -> bool {
        self.writes_flags
    }

    pub fn is_branch(&self) -> bool {
        self.branch.is_some()
    }

    pub fn is_branch_with_link(&self) -> bool {
        self.link
    }

    /// Destination of the branch, if the instruction is one.
    pub fn branch_target(&self) -> Option<BranchTarget> {
        self.branch
    }

    /// Returns the instruction this branch lands on, when the destination is a
    /// PC-relative address inside the program image. Register-indirect and unknown
    /// destinations return None, as does any address outside the image.
    pub fn branch_to<'a>(&self, program: &'a Program) -> Option<&'a Instruction> {
        match self.branch {
            Some(BranchTarget::Absolute(target)) => program.instruction_at(target),
            _ => None,
        }
    }

    /// Returns the name of the instruction, in lowercase, condition suffix included.
    pub fn mnemonic(&self) -> String {
        let cond = self.condition;
        match self.class {
            OpcodeClass::DataProcessing => {
                let opcode = self.encoding.field(21, 4) as usize;
                let name = if self.encoding & 0x0ff00000 == 0x03000000 {
                    "movw"
                } else if self.encoding & 0x0ff00000 == 0x03400000 {
                    "movt"
                } else if self.encoding & 0x0fff0ff0 == 0x016f0f10 {
                    "clz"
                } else {
                    DP_NAMES[opcode]
                };
                let s = if self.writes_flags && !(8..=11).contains(&opcode) {
                    "s"
                } else {
                    ""
                };
                format!("{}{}{}", name, s, cond)
            }
            OpcodeClass::StatusTransfer => {
                let name = if self.writes.is_empty() { "msr" } else { "mrs" };
                format!("{}{}", name, cond)
            }
            OpcodeClass::Multiply => {
                let name = match (self.encoding.bit(23), self.encoding.field(21, 2)) {
                    (false, 0) => "mul",
                    (false, _) => "mla",
                    (true, 0) => "umull",
                    (true, 1) => "umlal",
                    (true, 2) => "smull",
                    (true, _) => "smlal",
                };
                format!("{}{}", name, cond)
            }
            OpcodeClass::Swap => format!("swp{}", cond),
            OpcodeClass::Load => format!("ldr{}{}", cond, self.transfer_suffix()),
            OpcodeClass::Store => format!("str{}{}", cond, self.transfer_suffix()),
            OpcodeClass::LoadMultiple => format!("ldm{}", cond),
            OpcodeClass::StoreMultiple => format!("stm{}", cond),
            OpcodeClass::Branch => format!("b{}{}", if self.link { "l" } else { "" }, cond),
            OpcodeClass::BranchExchange => {
                format!("b{}x{}", if self.link { "l" } else { "" }, cond)
            }
            OpcodeClass::Coprocessor => format!("cdp{}", cond),
            OpcodeClass::SoftwareInterrupt => format!("svc{}", cond),
            OpcodeClass::Undefined => "udf".into(),
        }
    }

    fn transfer_suffix(&self) -> &'static str {
        let e = self.encoding;
        if e.field(25, 3) <= 1 {
            // Halfword and signed transfer space.
            match (e.bit(20), e.field(5, 2)) {
                (_, 1) => "h",
                (true, 2) => "sb",
                (true, _) => "sh",
                _ => "",
            }
        } else if e.bit(22) {
            "b"
        } else {
            ""
        }
    }
}

impl Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.branch {
            Some(BranchTarget::Absolute(target)) => {
                write!(f, "{} 0x{:x}", self.mnemonic(), target)
            }
            _ => write!(f, "{} <0x{:08x}>", self.mnemonic(), self.encoding),
        }
    }
}
