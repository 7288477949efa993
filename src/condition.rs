use num_enum::TryFromPrimitive;
use std::fmt::{self, Display};

/// Possible conditions for conditional execution.
///
/// The discriminant of each variant is its value in the condition field of an
/// instruction encoding. Value 15 selects the unconditional extension space and has no
/// variant here.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, TryFromPrimitive)]
#[repr(u32)]
pub enum Condition {
    Equal = 0,
    NotEqual,
    CarrySet,
    CarryClear,
    Minus,
    Plus,
    Overflow,
    NoOverflow,
    Higher,
    LowerOrSame,
    GreaterThanOrEqual,
    LessThan,
    GreaterThan,
    LessThanOrEqual,
    Always,
}

impl Condition {
    /// Returns inverse condition, or None if current condition is Always (there is no
    /// "Never" condition in ARMv7).
    pub fn inverse(&self) -> Option<Self> {
        Some(match self {
            Condition::Equal => Condition::NotEqual,
            Condition::NotEqual => Condition::Equal,
            Condition::CarrySet => Condition::CarryClear,
            Condition::CarryClear => Condition::CarrySet,
            Condition::Minus => Condition::Plus,
            Condition::Plus => Condition::Minus,
            Condition::Overflow => Condition::NoOverflow,
            Condition::NoOverflow => Condition::Overflow,
            Condition::Higher => Condition::LowerOrSame,
            Condition::LowerOrSame => Condition::Higher,
            Condition::GreaterThanOrEqual => Condition::LessThan,
            Condition::LessThan => Condition::GreaterThanOrEqual,
            Condition::GreaterThan => Condition::LessThanOrEqual,
            Condition::LessThanOrEqual => Condition::GreaterThan,
            Condition::Always => return None,
        })
    }

    /// Returns true for the Always condition.
    pub fn is_always(&self) -> bool {
        *self == Condition::Always
    }

    /// Condition field value of this condition in an instruction encoding.
    pub fn encode(&self) -> u32 {
        *self as u32
    }
}

impl Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Condition::Equal => "eq",
            Condition::NotEqual => "ne",
            Condition::CarrySet => "cs",
            Condition::CarryClear => "cc",
            Condition::Minus => "mi",
            Condition::Plus => "pl",
            Condition::Overflow => "vs",
            Condition::NoOverflow => "vc",
            Condition::Higher => "hi",
            Condition::LowerOrSame => "ls",
            Condition::GreaterThanOrEqual => "ge",
            Condition::LessThan => "lt",
            Condition::GreaterThan => "gt",
            Condition::LessThanOrEqual => "le",
            Condition::Always => "",
        };
        write!(f, "{}", s)
    }
}
