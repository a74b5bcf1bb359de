//! The ARM2 instruction set as a discriminated union.
//!
//! Each variant carries the decoded operand fields exactly as they appear
//! in the 32-bit word, so `decode(encode(i)) == i` holds for every
//! well-formed instruction. Disassembly lives here too: formatting needs
//! the instruction's address to resolve branch targets and PC-relative
//! offsets.

use std::fmt;
use std::fmt::Write as _;

/// The 16 ARM condition codes (bits 31-28).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cond {
    /// Z set (equal).
    Eq,
    /// Z clear (not equal).
    Ne,
    /// C set (unsigned higher or same; alias HS).
    Cs,
    /// C clear (unsigned lower; alias LO).
    Cc,
    /// N set (negative).
    Mi,
    /// N clear (positive or zero).
    Pl,
    /// V set (overflow).
    Vs,
    /// V clear (no overflow).
    Vc,
    /// C set and Z clear (unsigned higher).
    Hi,
    /// C clear or Z set (unsigned lower or same).
    Ls,
    /// N equals V (signed greater or equal).
    Ge,
    /// N differs from V (signed less than).
    Lt,
    /// Z clear and N equals V (signed greater than).
    Gt,
    /// Z set or N differs from V (signed less or equal).
    Le,
    /// Always.
    Al,
    /// Never (deprecated; executes nothing).
    Nv,
}

impl Cond {
    /// Condition field value for the encoder.
    #[must_use]
    pub const fn bits(self) -> u32 {
        self as u32
    }

    /// Decode a condition field (low 4 bits used).
    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        match bits & 0xF {
            0x0 => Self::Eq,
            0x1 => Self::Ne,
            0x2 => Self::Cs,
            0x3 => Self::Cc,
            0x4 => Self::Mi,
            0x5 => Self::Pl,
            0x6 => Self::Vs,
            0x7 => Self::Vc,
            0x8 => Self::Hi,
            0x9 => Self::Ls,
            0xA => Self::Ge,
            0xB => Self::Lt,
            0xC => Self::Gt,
            0xD => Self::Le,
            0xE => Self::Al,
            _ => Self::Nv,
        }
    }

    /// Parse a condition suffix, case-insensitive. Empty means AL.
    /// `HS`/`LO` are accepted as aliases of `CS`/`CC`.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s.to_ascii_uppercase().as_str() {
            "" | "AL" => Self::Al,
            "EQ" => Self::Eq,
            "NE" => Self::Ne,
            "CS" | "HS" => Self::Cs,
            "CC" | "LO" => Self::Cc,
            "MI" => Self::Mi,
            "PL" => Self::Pl,
            "VS" => Self::Vs,
            "VC" => Self::Vc,
            "HI" => Self::Hi,
            "LS" => Self::Ls,
            "GE" => Self::Ge,
            "LT" => Self::Lt,
            "GT" => Self::Gt,
            "LE" => Self::Le,
            "NV" => Self::Nv,
            _ => return None,
        })
    }

    /// Suffix used in disassembly; empty for AL.
    #[must_use]
    pub const fn suffix(self) -> &'static str {
        match self {
            Self::Eq => "EQ",
            Self::Ne => "NE",
            Self::Cs => "CS",
            Self::Cc => "CC",
            Self::Mi => "MI",
            Self::Pl => "PL",
            Self::Vs => "VS",
            Self::Vc => "VC",
            Self::Hi => "HI",
            Self::Ls => "LS",
            Self::Ge => "GE",
            Self::Lt => "LT",
            Self::Gt => "GT",
            Self::Le => "LE",
            Self::Al => "",
            Self::Nv => "NV",
        }
    }
}

/// Data-processing opcode (bits 24-21).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DpOpcode {
    And,
    Eor,
    Sub,
    Rsb,
    Add,
    Adc,
    Sbc,
    Rsc,
    Tst,
    Teq,
    Cmp,
    Cmn,
    Orr,
    Mov,
    Bic,
    Mvn,
}

impl DpOpcode {
    /// Opcode field value.
    #[must_use]
    pub const fn bits(self) -> u32 {
        self as u32
    }

    /// Decode an opcode field (low 4 bits used).
    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        match bits & 0xF {
            0x0 => Self::And,
            0x1 => Self::Eor,
            0x2 => Self::Sub,
            0x3 => Self::Rsb,
            0x4 => Self::Add,
            0x5 => Self::Adc,
            0x6 => Self::Sbc,
            0x7 => Self::Rsc,
            0x8 => Self::Tst,
            0x9 => Self::Teq,
            0xA => Self::Cmp,
            0xB => Self::Cmn,
            0xC => Self::Orr,
            0xD => Self::Mov,
            0xE => Self::Bic,
            _ => Self::Mvn,
        }
    }

    /// TST/TEQ/CMP/CMN: no destination, flags always written.
    #[must_use]
    pub const fn is_compare(self) -> bool {
        matches!(self, Self::Tst | Self::Teq | Self::Cmp | Self::Cmn)
    }

    /// MOV/MVN: no first operand register.
    #[must_use]
    pub const fn is_move(self) -> bool {
        matches!(self, Self::Mov | Self::Mvn)
    }

    #[must_use]
    pub const fn mnemonic(self) -> &'static str {
        match self {
            Self::And => "AND",
            Self::Eor => "EOR",
            Self::Sub => "SUB",
            Self::Rsb => "RSB",
            Self::Add => "ADD",
            Self::Adc => "ADC",
            Self::Sbc => "SBC",
            Self::Rsc => "RSC",
            Self::Tst => "TST",
            Self::Teq => "TEQ",
            Self::Cmp => "CMP",
            Self::Cmn => "CMN",
            Self::Orr => "ORR",
            Self::Mov => "MOV",
            Self::Bic => "BIC",
            Self::Mvn => "MVN",
        }
    }
}

/// Shift applied to a register operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftKind {
    Lsl,
    Lsr,
    Asr,
    Ror,
}

impl ShiftKind {
    #[must_use]
    pub const fn bits(self) -> u32 {
        self as u32
    }

    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        match bits & 0b11 {
            0b00 => Self::Lsl,
            0b01 => Self::Lsr,
            0b10 => Self::Asr,
            _ => Self::Ror,
        }
    }

    #[must_use]
    pub const fn mnemonic(self) -> &'static str {
        match self {
            Self::Lsl => "LSL",
            Self::Lsr => "LSR",
            Self::Asr => "ASR",
            Self::Ror => "ROR",
        }
    }
}

/// Shift specification inside a register shifter operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shift {
    /// Shift by a 5-bit immediate, as encoded: for LSR/ASR an amount of 0
    /// means 32; ROR #0 is RRX.
    Imm { kind: ShiftKind, amount: u8 },
    /// Shift by the low byte of a register.
    Reg { kind: ShiftKind, rs: u8 },
}

impl Shift {
    /// No shift: LSL #0.
    pub const NONE: Self = Self::Imm { kind: ShiftKind::Lsl, amount: 0 };
}

/// Second operand of a data-processing instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand2 {
    /// 8-bit value rotated right by `2 * rotate`, stored in encoded form.
    Immediate { value: u8, rotate: u8 },
    /// Register with shift.
    Register { rm: u8, shift: Shift },
}

impl Operand2 {
    /// The immediate's 32-bit value after rotation.
    #[must_use]
    pub const fn immediate_value(value: u8, rotate: u8) -> u32 {
        (value as u32).rotate_right(2 * rotate as u32)
    }
}

/// Data-processing instruction (AND..MVN).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataProcessing {
    pub cond: Cond,
    pub op: DpOpcode,
    /// Update flags. Compare opcodes always carry `s = true`.
    pub s: bool,
    pub rn: u8,
    pub rd: u8,
    pub op2: Operand2,
}

/// Offset of a word/byte load or store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LsOffset {
    /// 12-bit unsigned offset; direction comes from the U bit.
    Imm(u16),
    /// Register offset with an optional immediate shift.
    Reg { rm: u8, shift: Shift },
}

/// Word or unsigned-byte load/store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadStore {
    pub cond: Cond,
    pub load: bool,
    pub byte: bool,
    /// Pre-indexed addressing (P bit).
    pub pre: bool,
    /// Offset added rather than subtracted (U bit).
    pub up: bool,
    /// Base register writeback (W bit). Always effective for post-indexed.
    pub writeback: bool,
    pub rn: u8,
    pub rd: u8,
    pub offset: LsOffset,
}

/// Halfword and signed transfer flavor (SH bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HalfKind {
    /// Unsigned halfword (LDRH/STRH).
    Half,
    /// Signed byte (LDRSB).
    SignedByte,
    /// Signed halfword (LDRSH).
    SignedHalf,
}

/// Offset of a halfword/signed transfer: 8-bit split immediate or register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HalfOffset {
    Imm(u8),
    Reg(u8),
}

/// Halfword and signed-byte load/store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadStoreHalf {
    pub cond: Cond,
    pub load: bool,
    pub kind: HalfKind,
    pub pre: bool,
    pub up: bool,
    pub writeback: bool,
    pub rn: u8,
    pub rd: u8,
    pub offset: HalfOffset,
}

/// Block-transfer addressing mode (P and U bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockMode {
    /// Increment after.
    Ia,
    /// Increment before.
    Ib,
    /// Decrement after.
    Da,
    /// Decrement before.
    Db,
}

impl BlockMode {
    #[must_use]
    pub const fn pre(self) -> bool {
        matches!(self, Self::Ib | Self::Db)
    }

    #[must_use]
    pub const fn up(self) -> bool {
        matches!(self, Self::Ia | Self::Ib)
    }

    #[must_use]
    pub const fn from_bits(pre: bool, up: bool) -> Self {
        match (pre, up) {
            (false, true) => Self::Ia,
            (true, true) => Self::Ib,
            (false, false) => Self::Da,
            (true, false) => Self::Db,
        }
    }

    #[must_use]
    pub const fn suffix(self) -> &'static str {
        match self {
            Self::Ia => "IA",
            Self::Ib => "IB",
            Self::Da => "DA",
            Self::Db => "DB",
        }
    }
}

/// LDM/STM block transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockTransfer {
    pub cond: Cond,
    pub load: bool,
    pub mode: BlockMode,
    /// S bit of the encoding. Carried for round-trip fidelity; user-bank
    /// transfer is not modeled and the executor ignores it.
    pub s: bool,
    pub writeback: bool,
    pub rn: u8,
    /// Register bitmap: bit n set means Rn is in the list.
    pub regs: u16,
}

/// B / BL with a signed word displacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Branch {
    pub cond: Cond,
    pub link: bool,
    /// Sign-extended 24-bit displacement in words.
    pub offset: i32,
}

impl Branch {
    /// Branch target given the branch instruction's address.
    #[must_use]
    pub fn target(self, addr: u32) -> u32 {
        addr.wrapping_add(8).wrapping_add((self.offset as u32) << 2)
    }
}

/// BX: branch to register with bit 0 cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BranchExchange {
    pub cond: Cond,
    pub rm: u8,
}

/// MUL / MLA.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Multiply {
    pub cond: Cond,
    pub accumulate: bool,
    pub s: bool,
    pub rd: u8,
    pub rn: u8,
    pub rs: u8,
    pub rm: u8,
}

/// UMULL / UMLAL / SMULL / SMLAL (ARMv3M).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LongMultiply {
    pub cond: Cond,
    pub signed: bool,
    pub accumulate: bool,
    pub s: bool,
    pub rd_hi: u8,
    pub rd_lo: u8,
    pub rs: u8,
    pub rm: u8,
}

/// SWP / SWPB (ARMv2a atomic swap).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Swap {
    pub cond: Cond,
    pub byte: bool,
    pub rn: u8,
    pub rd: u8,
    pub rm: u8,
}

/// SWI with its 24-bit comment field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Swi {
    pub cond: Cond,
    pub imm: u32,
}

/// MRS (ARMv3 PSR read).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mrs {
    pub cond: Cond,
    /// SPSR selected. No banked PSRs exist here; executing this faults.
    pub spsr: bool,
    pub rd: u8,
}

/// Source operand of MSR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsrOperand {
    Register(u8),
    Immediate { value: u8, rotate: u8 },
}

/// MSR (ARMv3 PSR write). Only the flag field is modeled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Msr {
    pub cond: Cond,
    pub spsr: bool,
    /// True for `CPSR_flg`, false for `CPSR` / `CPSR_all`. Either way only
    /// N/Z/C/V change, since no other CPSR bits are modeled.
    pub flags_only: bool,
    pub op: MsrOperand,
}

/// A decoded ARM2 instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    DataProcessing(DataProcessing),
    LoadStore(LoadStore),
    LoadStoreHalf(LoadStoreHalf),
    BlockTransfer(BlockTransfer),
    Branch(Branch),
    BranchExchange(BranchExchange),
    Multiply(Multiply),
    LongMultiply(LongMultiply),
    Swap(Swap),
    Swi(Swi),
    Mrs(Mrs),
    Msr(Msr),
}

impl Instruction {
    /// Condition field of any instruction form.
    #[must_use]
    pub const fn cond(&self) -> Cond {
        match self {
            Self::DataProcessing(i) => i.cond,
            Self::LoadStore(i) => i.cond,
            Self::LoadStoreHalf(i) => i.cond,
            Self::BlockTransfer(i) => i.cond,
            Self::Branch(i) => i.cond,
            Self::BranchExchange(i) => i.cond,
            Self::Multiply(i) => i.cond,
            Self::LongMultiply(i) => i.cond,
            Self::Swap(i) => i.cond,
            Self::Swi(i) => i.cond,
            Self::Mrs(i) => i.cond,
            Self::Msr(i) => i.cond,
        }
    }

    /// Disassemble, resolving PC-relative targets against `addr`.
    #[must_use]
    pub fn disasm(&self, addr: u32) -> String {
        let mut out = String::new();
        self.fmt_disasm(&mut out, addr);
        out
    }

    fn fmt_disasm(&self, out: &mut String, addr: u32) {
        match self {
            Self::DataProcessing(i) => fmt_data_processing(out, i),
            Self::LoadStore(i) => fmt_load_store(out, i),
            Self::LoadStoreHalf(i) => fmt_load_store_half(out, i),
            Self::BlockTransfer(i) => fmt_block_transfer(out, i),
            Self::Branch(i) => {
                let _ = write!(
                    out,
                    "B{}{} 0x{:08X}",
                    if i.link { "L" } else { "" },
                    i.cond.suffix(),
                    i.target(addr)
                );
            }
            Self::BranchExchange(i) => {
                let _ = write!(out, "BX{} {}", i.cond.suffix(), reg_name(i.rm));
            }
            Self::Multiply(i) => {
                let _ = write!(
                    out,
                    "{}{}{} {}, {}, {}",
                    if i.accumulate { "MLA" } else { "MUL" },
                    i.cond.suffix(),
                    if i.s { "S" } else { "" },
                    reg_name(i.rd),
                    reg_name(i.rm),
                    reg_name(i.rs)
                );
                if i.accumulate {
                    let _ = write!(out, ", {}", reg_name(i.rn));
                }
            }
            Self::LongMultiply(i) => {
                let base = match (i.signed, i.accumulate) {
                    (false, false) => "UMULL",
                    (false, true) => "UMLAL",
                    (true, false) => "SMULL",
                    (true, true) => "SMLAL",
                };
                let _ = write!(
                    out,
                    "{}{}{} {}, {}, {}, {}",
                    base,
                    i.cond.suffix(),
                    if i.s { "S" } else { "" },
                    reg_name(i.rd_lo),
                    reg_name(i.rd_hi),
                    reg_name(i.rm),
                    reg_name(i.rs)
                );
            }
            Self::Swap(i) => {
                let _ = write!(
                    out,
                    "SWP{}{} {}, {}, [{}]",
                    i.cond.suffix(),
                    if i.byte { "B" } else { "" },
                    reg_name(i.rd),
                    reg_name(i.rm),
                    reg_name(i.rn)
                );
            }
            Self::Swi(i) => {
                let _ = write!(out, "SWI{} #0x{:X}", i.cond.suffix(), i.imm);
            }
            Self::Mrs(i) => {
                let _ = write!(
                    out,
                    "MRS{} {}, {}",
                    i.cond.suffix(),
                    reg_name(i.rd),
                    if i.spsr { "SPSR" } else { "CPSR" }
                );
            }
            Self::Msr(i) => {
                let psr = match (i.spsr, i.flags_only) {
                    (false, false) => "CPSR",
                    (false, true) => "CPSR_flg",
                    (true, false) => "SPSR",
                    (true, true) => "SPSR_flg",
                };
                let _ = write!(out, "MSR{} {}, ", i.cond.suffix(), psr);
                match i.op {
                    MsrOperand::Register(rm) => out.push_str(reg_name(rm)),
                    MsrOperand::Immediate { value, rotate } => {
                        let _ = write!(out, "#{}", fmt_imm(Operand2::immediate_value(value, rotate)));
                    }
                }
            }
        }
    }
}

impl fmt::Display for Instruction {
    /// Displays with a zero instruction address; use [`Instruction::disasm`]
    /// when the address is known.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.disasm(0))
    }
}

/// Conventional register name: SP/LR/PC for R13-R15.
#[must_use]
pub(crate) const fn reg_name(n: u8) -> &'static str {
    match n & 0xF {
        0 => "R0",
        1 => "R1",
        2 => "R2",
        3 => "R3",
        4 => "R4",
        5 => "R5",
        6 => "R6",
        7 => "R7",
        8 => "R8",
        9 => "R9",
        10 => "R10",
        11 => "R11",
        12 => "R12",
        13 => "SP",
        14 => "LR",
        _ => "PC",
    }
}

fn fmt_imm(value: u32) -> String {
    if value < 10 {
        format!("{value}")
    } else {
        format!("0x{value:X}")
    }
}

fn fmt_shift(out: &mut String, shift: Shift) {
    match shift {
        Shift::Imm { kind: ShiftKind::Lsl, amount: 0 } => {}
        Shift::Imm { kind: ShiftKind::Ror, amount: 0 } => out.push_str(", RRX"),
        Shift::Imm { kind, amount } => {
            // LSR/ASR encode #32 as 0.
            let shown = if amount == 0 { 32 } else { u32::from(amount) };
            let _ = write!(out, ", {} #{}", kind.mnemonic(), shown);
        }
        Shift::Reg { kind, rs } => {
            let _ = write!(out, ", {} {}", kind.mnemonic(), reg_name(rs));
        }
    }
}

fn fmt_operand2(out: &mut String, op2: Operand2) {
    match op2 {
        Operand2::Immediate { value, rotate } => {
            let _ = write!(out, "#{}", fmt_imm(Operand2::immediate_value(value, rotate)));
        }
        Operand2::Register { rm, shift } => {
            out.push_str(reg_name(rm));
            fmt_shift(out, shift);
        }
    }
}

fn fmt_data_processing(out: &mut String, i: &DataProcessing) {
    let _ = write!(out, "{}{}", i.op.mnemonic(), i.cond.suffix());
    if i.s && !i.op.is_compare() {
        out.push('S');
    }
    out.push(' ');
    if i.op.is_compare() {
        out.push_str(reg_name(i.rn));
    } else if i.op.is_move() {
        out.push_str(reg_name(i.rd));
    } else {
        let _ = write!(out, "{}, {}", reg_name(i.rd), reg_name(i.rn));
    }
    out.push_str(", ");
    fmt_operand2(out, i.op2);
}

fn fmt_load_store(out: &mut String, i: &LoadStore) {
    let _ = write!(
        out,
        "{}{}{} {}, ",
        if i.load { "LDR" } else { "STR" },
        i.cond.suffix(),
        if i.byte { "B" } else { "" },
        reg_name(i.rd)
    );
    let sign = if i.up { "" } else { "-" };
    match (&i.offset, i.pre) {
        (LsOffset::Imm(0), true) => {
            let _ = write!(out, "[{}]", reg_name(i.rn));
            if i.writeback {
                out.push('!');
            }
        }
        (LsOffset::Imm(off), true) => {
            let _ = write!(out, "[{}, #{}{}]", reg_name(i.rn), sign, fmt_imm(u32::from(*off)));
            if i.writeback {
                out.push('!');
            }
        }
        (LsOffset::Imm(off), false) => {
            let _ = write!(out, "[{}], #{}{}", reg_name(i.rn), sign, fmt_imm(u32::from(*off)));
        }
        (LsOffset::Reg { rm, shift }, true) => {
            let _ = write!(out, "[{}, {}{}", reg_name(i.rn), sign, reg_name(*rm));
            fmt_shift(out, *shift);
            out.push(']');
            if i.writeback {
                out.push('!');
            }
        }
        (LsOffset::Reg { rm, shift }, false) => {
            let _ = write!(out, "[{}], {}{}", reg_name(i.rn), sign, reg_name(*rm));
            fmt_shift(out, *shift);
        }
    }
}

fn fmt_load_store_half(out: &mut String, i: &LoadStoreHalf) {
    let mnem = match (i.load, i.kind) {
        (true, HalfKind::Half) => "LDRH",
        (true, HalfKind::SignedByte) => "LDRSB",
        (true, HalfKind::SignedHalf) => "LDRSH",
        (false, _) => "STRH",
    };
    // Mnemonic suffix order is LDRH-style: base, cond in the middle.
    let (head, tail) = mnem.split_at(3);
    let _ = write!(out, "{}{}{} {}, ", head, i.cond.suffix(), tail, reg_name(i.rd));
    let sign = if i.up { "" } else { "-" };
    match (&i.offset, i.pre) {
        (HalfOffset::Imm(0), true) => {
            let _ = write!(out, "[{}]", reg_name(i.rn));
            if i.writeback {
                out.push('!');
            }
        }
        (HalfOffset::Imm(off), true) => {
            let _ = write!(out, "[{}, #{}{}]", reg_name(i.rn), sign, fmt_imm(u32::from(*off)));
            if i.writeback {
                out.push('!');
            }
        }
        (HalfOffset::Imm(off), false) => {
            let _ = write!(out, "[{}], #{}{}", reg_name(i.rn), sign, fmt_imm(u32::from(*off)));
        }
        (HalfOffset::Reg(rm), true) => {
            let _ = write!(out, "[{}, {}{}]", reg_name(i.rn), sign, reg_name(*rm));
            if i.writeback {
                out.push('!');
            }
        }
        (HalfOffset::Reg(rm), false) => {
            let _ = write!(out, "[{}], {}{}", reg_name(i.rn), sign, reg_name(*rm));
        }
    }
}

fn fmt_block_transfer(out: &mut String, i: &BlockTransfer) {
    let _ = write!(
        out,
        "{}{}{} {}{}, {{",
        if i.load { "LDM" } else { "STM" },
        i.cond.suffix(),
        i.mode.suffix(),
        reg_name(i.rn),
        if i.writeback { "!" } else { "" }
    );
    let mut first = true;
    let mut n = 0u8;
    while n < 16 {
        if i.regs & (1 << n) != 0 {
            // Find the end of this run for range compression.
            let start = n;
            while n + 1 < 16 && i.regs & (1 << (n + 1)) != 0 {
                n += 1;
            }
            if !first {
                out.push_str(", ");
            }
            first = false;
            if n > start + 1 {
                let _ = write!(out, "{}-{}", reg_name(start), reg_name(n));
            } else if n == start + 1 {
                let _ = write!(out, "{}, {}", reg_name(start), reg_name(n));
            } else {
                out.push_str(reg_name(start));
            }
        }
        n += 1;
    }
    out.push('}');
    if i.s {
        out.push('^');
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cond_bits_round_trip() {
        for bits in 0..16 {
            assert_eq!(Cond::from_bits(bits).bits(), bits);
        }
    }

    #[test]
    fn cond_parse_aliases() {
        assert_eq!(Cond::parse("hs"), Some(Cond::Cs));
        assert_eq!(Cond::parse("LO"), Some(Cond::Cc));
        assert_eq!(Cond::parse(""), Some(Cond::Al));
        assert_eq!(Cond::parse("XX"), None);
    }

    #[test]
    fn disasm_data_processing() {
        let i = Instruction::DataProcessing(DataProcessing {
            cond: Cond::Eq,
            op: DpOpcode::Add,
            s: true,
            rn: 1,
            rd: 0,
            op2: Operand2::Register { rm: 2, shift: Shift::Imm { kind: ShiftKind::Lsl, amount: 3 } },
        });
        assert_eq!(i.disasm(0), "ADDEQS R0, R1, R2, LSL #3");
    }

    #[test]
    fn disasm_branch_target() {
        let i = Instruction::Branch(Branch { cond: Cond::Al, link: false, offset: -2 });
        assert_eq!(i.disasm(0x8008), "B 0x00008008");
    }

    #[test]
    fn disasm_register_list_ranges() {
        let i = Instruction::BlockTransfer(BlockTransfer {
            cond: Cond::Al,
            load: false,
            mode: BlockMode::Db,
            s: false,
            writeback: true,
            rn: 13,
            regs: 0b0000_0000_0010_1111,
        });
        assert_eq!(i.disasm(0), "STMDB SP!, {R0-R3, R5}");
    }

    #[test]
    fn disasm_post_indexed_store() {
        let i = Instruction::LoadStore(LoadStore {
            cond: Cond::Al,
            load: false,
            byte: true,
            pre: false,
            up: true,
            writeback: false,
            rn: 4,
            rd: 0,
            offset: LsOffset::Imm(1),
        });
        assert_eq!(i.disasm(0), "STRB R0, [R4], #1");
    }
}
