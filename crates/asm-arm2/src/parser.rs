//! Statement parser.
//!
//! Turns one preprocessed line into labels plus an instruction or
//! directive. Mnemonics are case-insensitive and carry optional condition
//! and flag suffixes (`ADDEQS`); suffix resolution tries the longest base
//! mnemonic first, which settles the classic `BLEQ` (BL + EQ) versus
//! `BLE` (B + LE) ambiguity. Parse errors are reported and the caller
//! moves to the next line, so one bad statement does not hide the rest.

use cpu_arm2::{BlockMode, Cond, DpOpcode, HalfKind, ShiftKind};

use crate::diag::{Diagnostics, Pos};
use crate::expr::{self, Expr};
use crate::lexer::{lex_line, Cursor, Token};
use crate::preprocess::Line;

/// Shift in operand position, before range checking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShiftAst {
    None,
    Imm(ShiftKind, Expr),
    Reg(ShiftKind, u8),
    Rrx,
}

/// Second operand of a data-processing instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op2Ast {
    Imm(Expr),
    Reg { rm: u8, shift: ShiftAst },
}

/// Addressing mode of a load/store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddrAst {
    /// `[Rn]`, `[Rn, #imm]`, `[Rn, #imm]!` — sign folds into the expression.
    PreImm { rn: u8, offset: Expr, writeback: bool },
    /// `[Rn], #imm`.
    PostImm { rn: u8, offset: Expr },
    /// `[Rn, ±Rm, shift]`, optionally with `!`.
    PreReg { rn: u8, neg: bool, rm: u8, shift: ShiftAst, writeback: bool },
    /// `[Rn], ±Rm`.
    PostReg { rn: u8, neg: bool, rm: u8, shift: ShiftAst },
    /// `LDR Rd, label` — PC-relative.
    PcRel(Expr),
    /// `LDR Rd, =value` — literal pool.
    Literal(Expr),
}

/// MSR source operand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MsrAst {
    Reg(u8),
    Imm(Expr),
}

/// Parsed instruction before symbol resolution and encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstrAst {
    DataProc { op: DpOpcode, s: bool, rd: u8, rn: u8, op2: Op2Ast },
    Mul { s: bool, rd: u8, rm: u8, rs: u8 },
    Mla { s: bool, rd: u8, rm: u8, rs: u8, rn: u8 },
    LongMul { signed: bool, accumulate: bool, s: bool, rd_lo: u8, rd_hi: u8, rm: u8, rs: u8 },
    LoadStore { load: bool, byte: bool, rd: u8, addr: AddrAst },
    LoadStoreHalf { load: bool, kind: HalfKind, rd: u8, addr: AddrAst },
    Block { load: bool, mode: BlockMode, rn: u8, writeback: bool, regs: u16 },
    Branch { link: bool, target: Expr },
    Bx { rm: u8 },
    Swp { byte: bool, rd: u8, rm: u8, rn: u8 },
    Swi { imm: Expr },
    Mrs { rd: u8 },
    Msr { flags_only: bool, op: MsrAst },
    Adr { rd: u8, target: Expr },
}

/// Instruction with its condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instr {
    pub cond: Cond,
    pub ast: InstrAst,
}

/// Assembler directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    Org(Expr),
    Equ { name: String, expr: Expr },
    Set { name: String, expr: Expr },
    Word(Vec<Expr>),
    Byte(Vec<Expr>),
    Ascii(Vec<u8>),
    Asciz(Vec<u8>),
    Skip { count: Expr, fill: Option<Expr> },
    Balign(Expr),
    Text,
    Data,
    Bss,
    Global(Vec<String>),
    Extern(Vec<String>),
    Ltorg,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Item {
    Instr(Instr),
    Directive(Directive),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LabelDef {
    Name(String),
    Numeric(u32),
}

/// One parsed line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    pub labels: Vec<LabelDef>,
    pub item: Option<Item>,
    pub pos: Pos,
}

// ---------------------------------------------------------------------------
// Registers
// ---------------------------------------------------------------------------

/// Parse a register name, including the procedure-call aliases.
#[must_use]
pub fn register_index(name: &str) -> Option<u8> {
    let up = name.to_ascii_uppercase();
    if let Some(num) = up.strip_prefix('R') {
        let n: u8 = num.parse().ok()?;
        return (n < 16).then_some(n);
    }
    if let Some(num) = up.strip_prefix('A') {
        let n: u8 = num.parse().ok()?;
        return (1..=4).contains(&n).then(|| n - 1);
    }
    if let Some(num) = up.strip_prefix('V') {
        let n: u8 = num.parse().ok()?;
        return (1..=6).contains(&n).then(|| n + 3);
    }
    match up.as_str() {
        "SB" => Some(9),
        "SL" => Some(10),
        "FP" => Some(11),
        "IP" => Some(12),
        "SP" => Some(13),
        "LR" => Some(14),
        "PC" => Some(15),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Mnemonics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MnemKind {
    Dp(DpOpcode, bool),
    Mul(bool),
    Mla(bool),
    LongMul { signed: bool, accumulate: bool, s: bool },
    Ldr { byte: bool },
    Str { byte: bool },
    LdrHalf(HalfKind),
    StrHalf,
    Ldm(BlockMode),
    Stm(BlockMode),
    Push,
    Pop,
    B,
    Bl,
    Bx,
    Swi,
    Swp { byte: bool },
    Mrs,
    Msr,
    Adr,
    Nop,
}

struct Mnemonic {
    cond: Cond,
    kind: MnemKind,
}

/// Candidate (condition, remaining-suffix) splits, longest cond first.
fn cond_splits(s: &str) -> Vec<(Cond, &str)> {
    let mut out = Vec::with_capacity(2);
    if s.len() >= 2 {
        if let Some(cond) = Cond::parse(&s[..2]) {
            out.push((cond, &s[2..]));
        }
    }
    out.push((Cond::Al, s));
    out
}

/// Map an LDM/STM mode suffix; the FD/ED/FA/EA stack aliases depend on
/// whether this is a load.
fn block_mode(suffix: &str, load: bool) -> Option<BlockMode> {
    Some(match (suffix, load) {
        ("" | "IA", _) => BlockMode::Ia,
        ("IB", _) => BlockMode::Ib,
        ("DA", _) => BlockMode::Da,
        ("DB", _) => BlockMode::Db,
        ("FD", true) | ("EA", false) => BlockMode::Ia,
        ("FD", false) | ("EA", true) => BlockMode::Db,
        ("ED", true) | ("FA", false) => BlockMode::Ib,
        ("ED", false) | ("FA", true) => BlockMode::Da,
        _ => return None,
    })
}

const DP_TABLE: [(&str, DpOpcode); 16] = [
    ("AND", DpOpcode::And),
    ("EOR", DpOpcode::Eor),
    ("SUB", DpOpcode::Sub),
    ("RSB", DpOpcode::Rsb),
    ("ADD", DpOpcode::Add),
    ("ADC", DpOpcode::Adc),
    ("SBC", DpOpcode::Sbc),
    ("RSC", DpOpcode::Rsc),
    ("TST", DpOpcode::Tst),
    ("TEQ", DpOpcode::Teq),
    ("CMP", DpOpcode::Cmp),
    ("CMN", DpOpcode::Cmn),
    ("ORR", DpOpcode::Orr),
    ("MOV", DpOpcode::Mov),
    ("BIC", DpOpcode::Bic),
    ("MVN", DpOpcode::Mvn),
];

fn parse_mnemonic(raw: &str) -> Option<Mnemonic> {
    let up = raw.to_ascii_uppercase();

    // Block transfers.
    for (base, load) in [("LDM", true), ("STM", false)] {
        if let Some(rest) = up.strip_prefix(base) {
            for (cond, suffix) in cond_splits(rest) {
                if let Some(mode) = block_mode(suffix, load) {
                    let kind = if load { MnemKind::Ldm(mode) } else { MnemKind::Stm(mode) };
                    return Some(Mnemonic { cond, kind });
                }
            }
            return None;
        }
    }

    // Word/byte/halfword loads and stores.
    for (base, load) in [("LDR", true), ("STR", false)] {
        if let Some(rest) = up.strip_prefix(base) {
            for (cond, suffix) in cond_splits(rest) {
                let kind = match (suffix, load) {
                    ("", true) => MnemKind::Ldr { byte: false },
                    ("B", true) => MnemKind::Ldr { byte: true },
                    ("", false) => MnemKind::Str { byte: false },
                    ("B", false) => MnemKind::Str { byte: true },
                    ("H", true) => MnemKind::LdrHalf(HalfKind::Half),
                    ("SB", true) => MnemKind::LdrHalf(HalfKind::SignedByte),
                    ("SH", true) => MnemKind::LdrHalf(HalfKind::SignedHalf),
                    ("H", false) => MnemKind::StrHalf,
                    _ => continue,
                };
                return Some(Mnemonic { cond, kind });
            }
            return None;
        }
    }

    // Long multiplies.
    for (base, signed, accumulate) in [
        ("UMULL", false, false),
        ("UMLAL", false, true),
        ("SMULL", true, false),
        ("SMLAL", true, true),
    ] {
        if let Some(rest) = up.strip_prefix(base) {
            for (cond, suffix) in cond_splits(rest) {
                match suffix {
                    "" | "S" => {
                        return Some(Mnemonic {
                            cond,
                            kind: MnemKind::LongMul { signed, accumulate, s: suffix == "S" },
                        });
                    }
                    _ => {}
                }
            }
            return None;
        }
    }

    for (base, op) in DP_TABLE {
        if let Some(rest) = up.strip_prefix(base) {
            for (cond, suffix) in cond_splits(rest) {
                match suffix {
                    "" => {
                        let s = op.is_compare();
                        return Some(Mnemonic { cond, kind: MnemKind::Dp(op, s) });
                    }
                    "S" => return Some(Mnemonic { cond, kind: MnemKind::Dp(op, true) }),
                    _ => {}
                }
            }
            return None;
        }
    }

    for (base, kind) in [
        ("PUSH", MnemKind::Push),
        ("POP", MnemKind::Pop),
        ("SWI", MnemKind::Swi),
        ("MRS", MnemKind::Mrs),
        ("MSR", MnemKind::Msr),
        ("ADR", MnemKind::Adr),
        ("NOP", MnemKind::Nop),
        ("BX", MnemKind::Bx),
    ] {
        if let Some(rest) = up.strip_prefix(base) {
            for (cond, suffix) in cond_splits(rest) {
                if suffix.is_empty() {
                    return Some(Mnemonic { cond, kind });
                }
            }
            return None;
        }
    }

    for (base, accumulate) in [("MUL", false), ("MLA", true)] {
        if let Some(rest) = up.strip_prefix(base) {
            for (cond, suffix) in cond_splits(rest) {
                match suffix {
                    "" | "S" => {
                        let s = suffix == "S";
                        let kind =
                            if accumulate { MnemKind::Mla(s) } else { MnemKind::Mul(s) };
                        return Some(Mnemonic { cond, kind });
                    }
                    _ => {}
                }
            }
            return None;
        }
    }

    if let Some(rest) = up.strip_prefix("SWP") {
        for (cond, suffix) in cond_splits(rest) {
            match suffix {
                "" => return Some(Mnemonic { cond, kind: MnemKind::Swp { byte: false } }),
                "B" => return Some(Mnemonic { cond, kind: MnemKind::Swp { byte: true } }),
                _ => {}
            }
        }
        return None;
    }

    // Branches last: every other B-prefixed mnemonic is handled above.
    for (base, kind) in [("BL", MnemKind::Bl), ("B", MnemKind::B)] {
        if let Some(rest) = up.strip_prefix(base) {
            for (cond, suffix) in cond_splits(rest) {
                if suffix.is_empty() {
                    return Some(Mnemonic { cond, kind });
                }
            }
            // `B` may still match where `BL` did not (e.g. BLS, BLT).
            if base == "BL" {
                continue;
            }
            return None;
        }
    }

    None
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

pub struct LineParser<'a> {
    cur: Cursor<'a>,
    pos: Pos,
}

impl<'a> LineParser<'a> {
    fn err(&self, diags: &mut Diagnostics, message: impl Into<String>) {
        self.err_with(diags, message, None);
    }

    fn err_with(
        &self,
        diags: &mut Diagnostics,
        message: impl Into<String>,
        suggestion: Option<String>,
    ) {
        let mut pos = self.pos.clone();
        pos.column = self.cur.column();
        diags.report_with(pos, message, suggestion);
    }

    fn expect_comma(&mut self, diags: &mut Diagnostics) -> Option<()> {
        if self.cur.eat(&Token::Comma) {
            Some(())
        } else {
            self.err(diags, "expected ','");
            None
        }
    }

    fn expect_register(&mut self, diags: &mut Diagnostics) -> Option<u8> {
        match self.cur.peek() {
            Some(Token::Ident(name)) => {
                if let Some(r) = register_index(name) {
                    self.cur.next();
                    Some(r)
                } else if name.to_ascii_uppercase().starts_with('R')
                    && name[1..].chars().all(|c| c.is_ascii_digit())
                {
                    self.err(diags, format!("register index out of range in '{name}'"));
                    None
                } else {
                    self.err(diags, format!("expected register, found '{name}'"));
                    None
                }
            }
            _ => {
                self.err(diags, "expected register");
                None
            }
        }
    }

    fn parse_expr(&mut self, diags: &mut Diagnostics) -> Option<Expr> {
        match expr::parse(&mut self.cur) {
            Ok(e) => Some(e),
            Err(msg) => {
                self.err(diags, msg);
                None
            }
        }
    }

    /// `LSL #n`, `LSL Rs`, `RRX` after a comma has been consumed.
    fn parse_shift(&mut self, diags: &mut Diagnostics) -> Option<ShiftAst> {
        let Some(Token::Ident(name)) = self.cur.peek() else {
            self.err(diags, "expected shift operator");
            return None;
        };
        let kind = match name.to_ascii_uppercase().as_str() {
            "LSL" => ShiftKind::Lsl,
            "LSR" => ShiftKind::Lsr,
            "ASR" => ShiftKind::Asr,
            "ROR" => ShiftKind::Ror,
            "RRX" => {
                self.cur.next();
                return Some(ShiftAst::Rrx);
            }
            other => {
                self.err(diags, format!("unknown shift operator '{other}'"));
                return None;
            }
        };
        self.cur.next();
        if self.cur.eat(&Token::Hash) {
            Some(ShiftAst::Imm(kind, self.parse_expr(diags)?))
        } else if let Some(Token::Ident(name)) = self.cur.peek() {
            if let Some(rs) = register_index(name) {
                self.cur.next();
                Some(ShiftAst::Reg(kind, rs))
            } else {
                self.err(diags, format!("expected shift amount, found '{name}'"));
                None
            }
        } else {
            self.err(diags, "expected '#' amount or register after shift");
            None
        }
    }

    fn parse_op2(&mut self, diags: &mut Diagnostics) -> Option<Op2Ast> {
        if self.cur.eat(&Token::Hash) {
            return Some(Op2Ast::Imm(self.parse_expr(diags)?));
        }
        let rm = self.expect_register(diags)?;
        let shift = if self.cur.eat(&Token::Comma) {
            self.parse_shift(diags)?
        } else {
            ShiftAst::None
        };
        Some(Op2Ast::Reg { rm, shift })
    }

    /// Everything after `LDR Rd,` / `STR Rd,`.
    fn parse_address(&mut self, diags: &mut Diagnostics) -> Option<AddrAst> {
        if self.cur.eat(&Token::Equals) {
            return Some(AddrAst::Literal(self.parse_expr(diags)?));
        }
        if !self.cur.eat(&Token::LBracket) {
            // PC-relative label form.
            return Some(AddrAst::PcRel(self.parse_expr(diags)?));
        }
        let rn = self.expect_register(diags)?;
        if self.cur.eat(&Token::RBracket) {
            if self.cur.eat(&Token::Comma) {
                // Post-indexed.
                if self.cur.eat(&Token::Hash) {
                    return Some(AddrAst::PostImm { rn, offset: self.parse_expr(diags)? });
                }
                let neg = self.parse_offset_sign();
                let rm = self.expect_register(diags)?;
                let shift = if self.cur.eat(&Token::Comma) {
                    self.parse_shift(diags)?
                } else {
                    ShiftAst::None
                };
                return Some(AddrAst::PostReg { rn, neg, rm, shift });
            }
            let writeback = self.cur.eat(&Token::Bang);
            return Some(AddrAst::PreImm { rn, offset: Expr::Int(0), writeback });
        }
        self.expect_comma(diags)?;
        if self.cur.eat(&Token::Hash) {
            let offset = self.parse_expr(diags)?;
            if !self.cur.eat(&Token::RBracket) {
                self.err(diags, "expected ']'");
                return None;
            }
            let writeback = self.cur.eat(&Token::Bang);
            return Some(AddrAst::PreImm { rn, offset, writeback });
        }
        let neg = self.parse_offset_sign();
        let rm = self.expect_register(diags)?;
        let shift = if self.cur.eat(&Token::Comma) {
            self.parse_shift(diags)?
        } else {
            ShiftAst::None
        };
        if !self.cur.eat(&Token::RBracket) {
            self.err(diags, "expected ']'");
            return None;
        }
        let writeback = self.cur.eat(&Token::Bang);
        Some(AddrAst::PreReg { rn, neg, rm, shift, writeback })
    }

    fn parse_offset_sign(&mut self) -> bool {
        if self.cur.eat(&Token::Minus) {
            true
        } else {
            self.cur.eat(&Token::Plus);
            false
        }
    }

    /// `{R0-R3, R5, LR}` register list bitmap.
    fn parse_reg_list(&mut self, diags: &mut Diagnostics) -> Option<u16> {
        if !self.cur.eat(&Token::LBrace) {
            self.err(diags, "expected '{' register list");
            return None;
        }
        let mut regs: u16 = 0;
        loop {
            let first = self.expect_register(diags)?;
            let last = if self.cur.eat(&Token::Minus) {
                let last = self.expect_register(diags)?;
                if last < first {
                    self.err(diags, "register range must ascend");
                    return None;
                }
                last
            } else {
                first
            };
            for r in first..=last {
                regs |= 1 << r;
            }
            if self.cur.eat(&Token::RBrace) {
                break;
            }
            self.expect_comma(diags)?;
        }
        if regs == 0 {
            self.err(diags, "empty register list");
            return None;
        }
        Some(regs)
    }

    fn parse_instruction(
        &mut self,
        mnemonic: &Mnemonic,
        diags: &mut Diagnostics,
    ) -> Option<InstrAst> {
        Some(match mnemonic.kind {
            MnemKind::Dp(op, s) => {
                if op.is_compare() {
                    let rn = self.expect_register(diags)?;
                    self.expect_comma(diags)?;
                    let op2 = self.parse_op2(diags)?;
                    InstrAst::DataProc { op, s: true, rd: 0, rn, op2 }
                } else if op.is_move() {
                    let rd = self.expect_register(diags)?;
                    self.expect_comma(diags)?;
                    let op2 = self.parse_op2(diags)?;
                    InstrAst::DataProc { op, s, rd, rn: 0, op2 }
                } else {
                    let rd = self.expect_register(diags)?;
                    self.expect_comma(diags)?;
                    let rn = self.expect_register(diags)?;
                    self.expect_comma(diags)?;
                    let op2 = self.parse_op2(diags)?;
                    InstrAst::DataProc { op, s, rd, rn, op2 }
                }
            }
            MnemKind::Mul(s) => {
                let rd = self.expect_register(diags)?;
                self.expect_comma(diags)?;
                let rm = self.expect_register(diags)?;
                self.expect_comma(diags)?;
                let rs = self.expect_register(diags)?;
                InstrAst::Mul { s, rd, rm, rs }
            }
            MnemKind::Mla(s) => {
                let rd = self.expect_register(diags)?;
                self.expect_comma(diags)?;
                let rm = self.expect_register(diags)?;
                self.expect_comma(diags)?;
                let rs = self.expect_register(diags)?;
                self.expect_comma(diags)?;
                let rn = self.expect_register(diags)?;
                InstrAst::Mla { s, rd, rm, rs, rn }
            }
            MnemKind::LongMul { signed, accumulate, s } => {
                let rd_lo = self.expect_register(diags)?;
                self.expect_comma(diags)?;
                let rd_hi = self.expect_register(diags)?;
                self.expect_comma(diags)?;
                let rm = self.expect_register(diags)?;
                self.expect_comma(diags)?;
                let rs = self.expect_register(diags)?;
                if rd_lo == rd_hi {
                    self.err(diags, "RdLo and RdHi must differ");
                    return None;
                }
                InstrAst::LongMul { signed, accumulate, s, rd_lo, rd_hi, rm, rs }
            }
            MnemKind::Ldr { byte } | MnemKind::Str { byte } => {
                let load = matches!(mnemonic.kind, MnemKind::Ldr { .. });
                let rd = self.expect_register(diags)?;
                self.expect_comma(diags)?;
                let addr = self.parse_address(diags)?;
                if !load && matches!(addr, AddrAst::Literal(_)) {
                    self.err(diags, "'=' literals only load");
                    return None;
                }
                InstrAst::LoadStore { load, byte, rd, addr }
            }
            MnemKind::LdrHalf(kind) => {
                let rd = self.expect_register(diags)?;
                self.expect_comma(diags)?;
                let addr = self.parse_address(diags)?;
                InstrAst::LoadStoreHalf { load: true, kind, rd, addr }
            }
            MnemKind::StrHalf => {
                let rd = self.expect_register(diags)?;
                self.expect_comma(diags)?;
                let addr = self.parse_address(diags)?;
                InstrAst::LoadStoreHalf { load: false, kind: HalfKind::Half, rd, addr }
            }
            MnemKind::Ldm(mode) | MnemKind::Stm(mode) => {
                let load = matches!(mnemonic.kind, MnemKind::Ldm(_));
                let rn = self.expect_register(diags)?;
                let writeback = self.cur.eat(&Token::Bang);
                self.expect_comma(diags)?;
                let regs = self.parse_reg_list(diags)?;
                if self.cur.eat(&Token::Caret) {
                    self.err(diags, "user-bank transfer '^' is not supported");
                    return None;
                }
                InstrAst::Block { load, mode, rn, writeback, regs }
            }
            MnemKind::Push => {
                let regs = self.parse_reg_list(diags)?;
                InstrAst::Block { load: false, mode: BlockMode::Db, rn: 13, writeback: true, regs }
            }
            MnemKind::Pop => {
                let regs = self.parse_reg_list(diags)?;
                InstrAst::Block { load: true, mode: BlockMode::Ia, rn: 13, writeback: true, regs }
            }
            MnemKind::B | MnemKind::Bl => {
                let target = self.parse_expr(diags)?;
                InstrAst::Branch { link: matches!(mnemonic.kind, MnemKind::Bl), target }
            }
            MnemKind::Bx => InstrAst::Bx { rm: self.expect_register(diags)? },
            MnemKind::Swi => {
                // The '#' is conventional but optional.
                self.cur.eat(&Token::Hash);
                InstrAst::Swi { imm: self.parse_expr(diags)? }
            }
            MnemKind::Swp { byte } => {
                let rd = self.expect_register(diags)?;
                self.expect_comma(diags)?;
                let rm = self.expect_register(diags)?;
                self.expect_comma(diags)?;
                if !self.cur.eat(&Token::LBracket) {
                    self.err(diags, "expected '[Rn]'");
                    return None;
                }
                let rn = self.expect_register(diags)?;
                if !self.cur.eat(&Token::RBracket) {
                    self.err(diags, "expected ']'");
                    return None;
                }
                InstrAst::Swp { byte, rd, rm, rn }
            }
            MnemKind::Mrs => {
                let rd = self.expect_register(diags)?;
                self.expect_comma(diags)?;
                match self.cur.next() {
                    Some(Token::Ident(name)) if name.eq_ignore_ascii_case("CPSR") => {}
                    _ => {
                        self.err(diags, "expected CPSR");
                        return None;
                    }
                }
                InstrAst::Mrs { rd }
            }
            MnemKind::Msr => {
                let flags_only = match self.cur.next() {
                    Some(Token::Ident(name)) => match name.to_ascii_uppercase().as_str() {
                        "CPSR" | "CPSR_ALL" => false,
                        "CPSR_FLG" | "CPSR_F" => true,
                        _ => {
                            self.err(diags, "expected CPSR, CPSR_all or CPSR_flg");
                            return None;
                        }
                    },
                    _ => {
                        self.err(diags, "expected CPSR, CPSR_all or CPSR_flg");
                        return None;
                    }
                };
                self.expect_comma(diags)?;
                let op = if self.cur.eat(&Token::Hash) {
                    MsrAst::Imm(self.parse_expr(diags)?)
                } else {
                    MsrAst::Reg(self.expect_register(diags)?)
                };
                InstrAst::Msr { flags_only, op }
            }
            MnemKind::Adr => {
                let rd = self.expect_register(diags)?;
                self.expect_comma(diags)?;
                InstrAst::Adr { rd, target: self.parse_expr(diags)? }
            }
            MnemKind::Nop => {
                // MOV R0, R0.
                InstrAst::DataProc {
                    op: DpOpcode::Mov,
                    s: false,
                    rd: 0,
                    rn: 0,
                    op2: Op2Ast::Reg { rm: 0, shift: ShiftAst::None },
                }
            }
        })
    }

    fn parse_directive(&mut self, name: &str, diags: &mut Diagnostics) -> Option<Directive> {
        let lower = name.to_ascii_lowercase();
        Some(match lower.as_str() {
            ".org" => Directive::Org(self.parse_expr(diags)?),
            ".equ" | ".set" => {
                let sym = match self.cur.next() {
                    Some(Token::Ident(n)) => n.clone(),
                    _ => {
                        self.err(diags, format!("{lower} expects a symbol name"));
                        return None;
                    }
                };
                self.expect_comma(diags)?;
                let expr = self.parse_expr(diags)?;
                if lower == ".equ" {
                    Directive::Equ { name: sym, expr }
                } else {
                    Directive::Set { name: sym, expr }
                }
            }
            ".word" | ".byte" => {
                let mut exprs = vec![self.parse_expr(diags)?];
                while self.cur.eat(&Token::Comma) {
                    exprs.push(self.parse_expr(diags)?);
                }
                if lower == ".word" {
                    Directive::Word(exprs)
                } else {
                    Directive::Byte(exprs)
                }
            }
            ".ascii" | ".asciz" | ".string" => {
                let mut bytes = Vec::new();
                loop {
                    match self.cur.next() {
                        Some(Token::Str(s)) => bytes.extend_from_slice(s),
                        _ => {
                            self.err(diags, format!("{lower} expects a string"));
                            return None;
                        }
                    }
                    if !self.cur.eat(&Token::Comma) {
                        break;
                    }
                }
                if lower == ".ascii" {
                    Directive::Ascii(bytes)
                } else {
                    Directive::Asciz(bytes)
                }
            }
            ".skip" | ".space" => {
                let count = self.parse_expr(diags)?;
                let fill = if self.cur.eat(&Token::Comma) {
                    Some(self.parse_expr(diags)?)
                } else {
                    None
                };
                Directive::Skip { count, fill }
            }
            ".balign" | ".align" => Directive::Balign(self.parse_expr(diags)?),
            ".text" => Directive::Text,
            ".data" => Directive::Data,
            ".bss" => Directive::Bss,
            ".global" | ".globl" | ".extern" => {
                let mut names = Vec::new();
                loop {
                    match self.cur.next() {
                        Some(Token::Ident(n)) => names.push(n.clone()),
                        _ => {
                            self.err(diags, format!("{lower} expects symbol names"));
                            return None;
                        }
                    }
                    if !self.cur.eat(&Token::Comma) {
                        break;
                    }
                }
                if lower == ".extern" {
                    Directive::Extern(names)
                } else {
                    Directive::Global(names)
                }
            }
            ".ltorg" => Directive::Ltorg,
            other => {
                self.err(diags, format!("unknown directive '{other}'"));
                return None;
            }
        })
    }
}

/// Parse one preprocessed line into a statement. Empty and comment-only
/// lines produce a statement with no item.
pub fn parse_line(line: &Line, diags: &mut Diagnostics) -> Statement {
    let toks = lex_line(&line.text, &line.file, line.line, diags);
    let pos = Pos::new(&line.file, line.line, 1);
    let mut parser = LineParser { cur: Cursor::new(&toks), pos: pos.clone() };
    let mut labels = Vec::new();

    // Leading labels: `name:` or `1:`.
    loop {
        match (parser.cur.peek(), parser.cur.peek_at(1)) {
            (Some(Token::Ident(name)), Some(Token::Colon)) => {
                labels.push(LabelDef::Name(name.clone()));
                parser.cur.next();
                parser.cur.next();
            }
            (Some(Token::Int(n)), Some(Token::Colon)) if *n >= 0 => {
                labels.push(LabelDef::Numeric(*n as u32));
                parser.cur.next();
                parser.cur.next();
            }
            _ => break,
        }
    }

    let item = match parser.cur.peek() {
        None => None,
        Some(Token::Ident(word)) => {
            let word = word.clone();
            parser.cur.next();
            if word.starts_with('.') {
                parser.parse_directive(&word, diags).map(Item::Directive)
            } else if let Some(mnemonic) = parse_mnemonic(&word) {
                parser
                    .parse_instruction(&mnemonic, diags)
                    .map(|ast| Item::Instr(Instr { cond: mnemonic.cond, ast }))
            } else {
                parser.err_with(
                    diags,
                    format!("unknown mnemonic '{word}'"),
                    suggest_mnemonic(&word),
                );
                None
            }
        }
        Some(other) => {
            parser.err(diags, format!("expected mnemonic or directive, found {other:?}"));
            None
        }
    };

    if item.is_some() && !parser.cur.at_end() {
        parser.err(diags, "trailing tokens after instruction");
    }

    Statement { labels, item, pos }
}

/// Suggest the closest mnemonic for a typo (edit distance one, prefix
/// match otherwise).
fn suggest_mnemonic(word: &str) -> Option<String> {
    let up = word.to_ascii_uppercase();
    let known = [
        "ADD", "ADC", "AND", "ADR", "B", "BL", "BX", "BIC", "CMP", "CMN", "EOR", "LDM", "LDR",
        "MLA", "MOV", "MRS", "MSR", "MUL", "MVN", "NOP", "ORR", "POP", "PUSH", "RSB", "RSC",
        "SBC", "SMULL", "SMLAL", "STM", "STR", "SUB", "SWI", "SWP", "TEQ", "TST", "UMULL",
        "UMLAL",
    ];
    known
        .iter()
        .find(|k| {
            k.len() == up.len()
                && k.chars().zip(up.chars()).filter(|(a, b)| a != b).count() == 1
        })
        .map(|k| format!("did you mean '{k}'?"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(text: &str) -> Statement {
        let mut diags = Diagnostics::new(10);
        let line = Line { file: "t.s".into(), line: 1, text: text.into() };
        let stmt = parse_line(&line, &mut diags);
        let errors = diags.into_vec();
        assert!(errors.is_empty(), "{text:?} -> {errors:?}");
        stmt
    }

    fn parse_err(text: &str) -> Vec<crate::diag::Diagnostic> {
        let mut diags = Diagnostics::new(10);
        let line = Line { file: "t.s".into(), line: 1, text: text.into() };
        let _ = parse_line(&line, &mut diags);
        let errors = diags.into_vec();
        assert!(!errors.is_empty(), "expected errors for {text:?}");
        errors
    }

    fn instr(stmt: &Statement) -> &Instr {
        match &stmt.item {
            Some(Item::Instr(i)) => i,
            other => panic!("expected instruction, got {other:?}"),
        }
    }

    #[test]
    fn cond_and_s_suffixes() {
        let stmt = parse_ok("ADDEQS R0, R1, #1");
        let i = instr(&stmt);
        assert_eq!(i.cond, Cond::Eq);
        assert!(matches!(
            i.ast,
            InstrAst::DataProc { op: DpOpcode::Add, s: true, rd: 0, rn: 1, .. }
        ));
    }

    #[test]
    fn branch_suffix_ambiguity() {
        // BLEQ is BL with EQ; BLE is B with LE; BLS is B with LS.
        assert_eq!(instr(&parse_ok("BLEQ 0x8000")).cond, Cond::Eq);
        assert!(matches!(instr(&parse_ok("BLEQ 0x8000")).ast, InstrAst::Branch { link: true, .. }));
        assert_eq!(instr(&parse_ok("BLE 0x8000")).cond, Cond::Le);
        assert!(matches!(instr(&parse_ok("BLE 0x8000")).ast, InstrAst::Branch { link: false, .. }));
        assert_eq!(instr(&parse_ok("BLS 0x8000")).cond, Cond::Ls);
        assert!(matches!(instr(&parse_ok("BLS 0x8000")).ast, InstrAst::Branch { link: false, .. }));
    }

    #[test]
    fn register_aliases() {
        assert_eq!(register_index("sp"), Some(13));
        assert_eq!(register_index("LR"), Some(14));
        assert_eq!(register_index("a1"), Some(0));
        assert_eq!(register_index("V6"), Some(9));
        assert_eq!(register_index("fp"), Some(11));
        assert_eq!(register_index("R16"), None);
    }

    #[test]
    fn addressing_modes() {
        let stmt = parse_ok("LDR R0, [R1, #-4]!");
        match &instr(&stmt).ast {
            InstrAst::LoadStore { addr: AddrAst::PreImm { rn: 1, writeback: true, offset }, .. } => {
                assert_eq!(
                    *offset,
                    Expr::Unary(crate::expr::UnOp::Neg, Box::new(Expr::Int(4)))
                );
            }
            other => panic!("{other:?}"),
        }

        let stmt = parse_ok("STR R2, [R3], #8");
        assert!(matches!(
            instr(&stmt).ast,
            InstrAst::LoadStore { load: false, addr: AddrAst::PostImm { rn: 3, .. }, .. }
        ));

        let stmt = parse_ok("LDR R0, [R1, R2, LSL #2]");
        assert!(matches!(
            instr(&stmt).ast,
            InstrAst::LoadStore {
                addr: AddrAst::PreReg { rn: 1, rm: 2, neg: false, shift: ShiftAst::Imm(ShiftKind::Lsl, _), writeback: false },
                ..
            }
        ));

        let stmt = parse_ok("LDR R0, [R1, -R2]");
        assert!(matches!(
            instr(&stmt).ast,
            InstrAst::LoadStore { addr: AddrAst::PreReg { neg: true, .. }, .. }
        ));

        let stmt = parse_ok("LDR R0, =0x12345678");
        assert!(matches!(
            instr(&stmt).ast,
            InstrAst::LoadStore { addr: AddrAst::Literal(Expr::Int(0x1234_5678)), .. }
        ));

        let stmt = parse_ok("LDR R0, msg");
        assert!(matches!(
            instr(&stmt).ast,
            InstrAst::LoadStore { addr: AddrAst::PcRel(Expr::Sym(_)), .. }
        ));
    }

    #[test]
    fn register_lists() {
        let stmt = parse_ok("STMFD SP!, {R0-R3, R5, LR}");
        match instr(&stmt).ast {
            InstrAst::Block { load: false, mode: BlockMode::Db, rn: 13, writeback: true, regs } => {
                assert_eq!(regs, 0b0100_0000_0010_1111);
            }
            ref other => panic!("{other:?}"),
        }
        // PUSH/POP desugar to the SP stack forms.
        let stmt = parse_ok("PUSH {R0, R1}");
        assert!(matches!(
            instr(&stmt).ast,
            InstrAst::Block { load: false, mode: BlockMode::Db, rn: 13, writeback: true, regs: 0b11 }
        ));
        let stmt = parse_ok("POP {R0, R1}");
        assert!(matches!(
            instr(&stmt).ast,
            InstrAst::Block { load: true, mode: BlockMode::Ia, rn: 13, writeback: true, regs: 0b11 }
        ));
    }

    #[test]
    fn labels_and_locals() {
        let stmt = parse_ok("loop: 1: ADD R0, R0, #1");
        assert_eq!(
            stmt.labels,
            vec![LabelDef::Name("loop".into()), LabelDef::Numeric(1)]
        );
        let stmt = parse_ok("B 1b");
        assert!(matches!(
            instr(&stmt).ast,
            InstrAst::Branch { target: Expr::LocalRef { n: 1, forward: false }, .. }
        ));
    }

    #[test]
    fn directives() {
        let stmt = parse_ok(".equ SIZE, 4 * 16");
        assert!(matches!(
            stmt.item,
            Some(Item::Directive(Directive::Equ { ref name, .. })) if name == "SIZE"
        ));
        let stmt = parse_ok("msg: .asciz \"Hi\\n\"");
        assert!(matches!(
            stmt.item,
            Some(Item::Directive(Directive::Asciz(ref b))) if b == b"Hi\n"
        ));
        let stmt = parse_ok(".word 1, 2, 3");
        assert!(matches!(
            stmt.item,
            Some(Item::Directive(Directive::Word(ref v))) if v.len() == 3
        ));
    }

    #[test]
    fn errors_are_helpful() {
        let errors = parse_err("MOV R16, #1");
        assert!(errors[0].message.contains("register index out of range"));

        let errors = parse_err("MOW R0, #1");
        assert!(errors[0].message.contains("unknown mnemonic"));
        assert_eq!(errors[0].suggestion.as_deref(), Some("did you mean 'MOV'?"));

        let errors = parse_err("LDMIA R0!, {R1} ^");
        assert!(errors[0].message.contains("user-bank"));
    }

    #[test]
    fn nop_and_swi() {
        assert!(matches!(
            instr(&parse_ok("NOP")).ast,
            InstrAst::DataProc { op: DpOpcode::Mov, rd: 0, op2: Op2Ast::Reg { rm: 0, .. }, .. }
        ));
        assert!(matches!(
            instr(&parse_ok("SWI #2")).ast,
            InstrAst::Swi { imm: Expr::Int(2) }
        ));
        assert!(matches!(
            instr(&parse_ok("SWI 0x10")).ast,
            InstrAst::Swi { imm: Expr::Int(0x10) }
        ));
    }

    #[test]
    fn msr_forms() {
        assert!(matches!(
            instr(&parse_ok("MSR CPSR, R0")).ast,
            InstrAst::Msr { flags_only: false, op: MsrAst::Reg(0) }
        ));
        assert!(matches!(
            instr(&parse_ok("MSR CPSR_flg, #0xF0000000")).ast,
            InstrAst::Msr { flags_only: true, op: MsrAst::Imm(_) }
        ));
    }
}
