//! Runtime faults raised by the memory model and the executor.

use std::fmt;

/// The kind of memory access that raised a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
    Execute,
}

impl fmt::Display for AccessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
            Self::Execute => write!(f, "execute"),
        }
    }
}

/// A fault that stops execution. Guest programs cannot catch these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Unaligned word/halfword access under strict alignment.
    Alignment { addr: u32, size: u32 },
    /// Access outside every segment, or spanning a segment boundary.
    Segmentation { addr: u32, size: u32 },
    /// Access denied by segment permissions.
    Permission { addr: u32, kind: AccessKind },
    /// The decoder found no instruction form for the word.
    UndefinedInstruction { addr: u32, word: u32 },
    /// A stack-pointer-based access fell below the stack segment.
    StackOverflow { addr: u32 },
    /// A stack-pointer-based access fell above the stack segment.
    StackUnderflow { addr: u32 },
    /// The per-run instruction budget was exhausted.
    BudgetExceeded { limit: u64 },
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Alignment { addr, size } => {
                write!(f, "unaligned {size}-byte access at 0x{addr:08X}")
            }
            Self::Segmentation { addr, size } => {
                write!(f, "{size}-byte access outside mapped memory at 0x{addr:08X}")
            }
            Self::Permission { addr, kind } => {
                write!(f, "{kind} not permitted at 0x{addr:08X}")
            }
            Self::UndefinedInstruction { addr, word } => {
                write!(f, "undefined instruction 0x{word:08X} at 0x{addr:08X}")
            }
            Self::StackOverflow { addr } => {
                write!(f, "stack overflow: access at 0x{addr:08X} below stack segment")
            }
            Self::StackUnderflow { addr } => {
                write!(f, "stack underflow: access at 0x{addr:08X} above stack segment")
            }
            Self::BudgetExceeded { limit } => {
                write!(f, "instruction budget of {limit} exhausted")
            }
        }
    }
}

impl std::error::Error for Fault {}
