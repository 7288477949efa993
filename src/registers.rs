//! Defines ARM core register identifiers and small register sets.

use std::fmt::{self, Display};

/// Enumeration to identify a CPU core register.
///
/// Provides methods to convert to/from instruction encoding values.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RegisterIndex {
    R0,
    R1,
    R2,
    R3,
    R4,
    R5,
    R6,
    R7,
    R8,
    R9,
    R10,
    R11,
    R12,
    Sp,
    Lr,
    Pc,
}

impl RegisterIndex {
    pub fn new_main(index: u32) -> Self {
        match index {
            0 => Self::R0,
            1 => Self::R1,
            2 => Self::R2,
            3 => Self::R3,
            4 => Self::R4,
            5 => Self::R5,
            6 => Self::R6,
            7 => Self::R7,
            8 => Self::R8,
            9 => Self::R9,
            10 => Self::R10,
            11 => Self::R11,
            12 => Self::R12,
            13 => Self::Sp,
            14 => Self::Lr,
            15 => Self::Pc,
            _ => panic!("invalid main register index"),
        }
    }

    /// Index of the register in instruction encodings.
    pub fn index(&self) -> u32 {
        *self as u32
    }

    pub fn is_pc(&self) -> bool {
        *self == Self::Pc
    }
}

impl Display for RegisterIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::R0 => "r0",
            Self::R1 => "r1",
            Self::R2 => "r2",
            Self::R3 => "r3",
            Self::R4 => "r4",
            Self::R5 => "r5",
            Self::R6 => "r6",
            Self::R7 => "r7",
            Self::R8 => "r8",
            Self::R9 => "r9",
            Self::R10 => "r10",
            Self::R11 => "r11",
            Self::R12 => "r12",
            Self::Sp => "sp",
            Self::Lr => "lr",
            Self::Pc => "pc",
        };
        write!(f, "{}", s)
    }
}

/// Set of core registers, stored as a 16-bit mask. Bit 0 for R0, bit 1 for R1, etc.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct RegisterSet(u16);

impl RegisterSet {
    pub fn new(bits: u16) -> RegisterSet {
        RegisterSet(bits)
    }

    pub fn of(registers: &[RegisterIndex]) -> RegisterSet {
        let mut set = RegisterSet::default();
        for r in registers {
            set.insert(*r);
        }
        set
    }

    /// Returns `true` if the set contains no registers.
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Returns `true` if given register is in the set.
    pub fn contains(&self, x: RegisterIndex) -> bool {
        self.0 & (1 << x.index()) != 0
    }

    /// Returns the number of registers in the set.
    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    /// Adds a register to the set.
    pub fn insert(&mut self, x: RegisterIndex) {
        self.0 |= 1 << x.index();
    }

    /// Returns the union of both sets.
    pub fn union(&self, other: &RegisterSet) -> RegisterSet {
        RegisterSet(self.0 | other.0)
    }

    /// Returns whether the set contains the PC register (15).
    pub fn has_pc(&self) -> bool {
        self.contains(RegisterIndex::Pc)
    }

    /// Iterates over the registers present in the set, from R0 upward.
    pub fn iter(&self) -> RegisterSetIterator {
        RegisterSetIterator {
            set: self.0,
            position: 0,
        }
    }
}

impl Display for RegisterSet {
    /// Formats the set of registers, to produce a string such as "r0, r1, sp".
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for reg in self.iter() {
            if first {
                first = false;
            } else {
                f.write_str(", ")?;
            }
            f.write_str(&reg.to_string())?;
        }
        Ok(())
    }
}

impl FromIterator<RegisterIndex> for RegisterSet {
    fn from_iter<T: IntoIterator<Item = RegisterIndex>>(iter: T) -> Self {
        let mut set = RegisterSet::default();
        for r in iter {
            set.insert(r);
        }
        set
    }
}

pub struct RegisterSetIterator {
    /// Marks the registers present in the set. Bit 0 for R0, bit 1 for R1, etc.
    set: u16,
    /// Index of next register to be tested and returned if present.
    position: u32,
}

impl Iterator for RegisterSetIterator {
    type Item = RegisterIndex;

    fn next(&mut self) -> Option<Self::Item> {
        while self.position < 16 {
            let pos = self.position;
            self.position += 1;
            if self.set & (1 << pos) != 0 {
                return Some(RegisterIndex::new_main(pos));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::{RegisterIndex, RegisterSet};

    #[test]
    fn test_set_basics() {
        let mut set = RegisterSet::default();
        assert!(set.is_empty());
        set.insert(RegisterIndex::R0);
        set.insert(RegisterIndex::Sp);
        assert_eq!(set.len(), 2);
        assert!(set.contains(RegisterIndex::R0));
        assert!(!set.contains(RegisterIndex::Pc));
        assert_eq!(set.to_string(), "r0, sp");
    }

    #[test]
    fn test_set_from_mask() {
        // STMDB {r4, lr} style register list.
        let set = RegisterSet::new(0x4010);
        let regs: Vec<_> = set.iter().collect();
        assert_eq!(regs, vec![RegisterIndex::R4, RegisterIndex::Lr]);
        assert!(!set.has_pc());
        assert!(RegisterSet::new(0x8010).has_pc());
    }
}
