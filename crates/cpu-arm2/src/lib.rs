//! ARM2 (ARMv2) CPU core.
//!
//! Instruction-level emulation: segmented memory model, registers and CPSR
//! flags, the instruction set as a discriminated union, an encoder/decoder
//! pair over the 32-bit ARM word layout, and a fetch-decode-execute step
//! engine. PSR transfer (ARMv3) and long multiply (ARMv3M) are included;
//! Thumb, coprocessors and processor modes are not.

mod decode;
mod encode;
mod execute;
mod fault;
mod flags;
mod instruction;
mod memory;
mod registers;
mod shifter;

pub use decode::decode;
pub use encode::{branch_offset, encode, encode_immediate};
pub use execute::{Cpu, StepEvent};
pub use fault::{AccessKind, Fault};
pub use flags::{add_with_carry, Cpsr};
pub use instruction::{
    BlockMode, BlockTransfer, Branch, BranchExchange, Cond, DataProcessing, DpOpcode, HalfKind,
    HalfOffset, Instruction, LoadStore, LoadStoreHalf, LongMultiply, LsOffset, Mrs, Msr,
    MsrOperand, Multiply, Operand2, Shift, ShiftKind, Swap, Swi,
};
pub use memory::{Access, Memory, Perms, Segment, SegmentKind};
pub use registers::{Registers, LR, PC, SP};
