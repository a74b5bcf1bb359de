//! The two-pass assembler.
//!
//! Pass 1 walks the statement stream tracking a location counter per
//! section, defines labels and constants, registers literal-pool entries
//! and records every emission with its position. Pass 2 runs under the
//! finalized symbol table: expressions evaluate, the encoder produces
//! machine words, and range failures become diagnostics. A run either
//! yields an image with every reference resolved or the full batch of
//! diagnostics and no image.

use cpu_arm2::{
    branch_offset, encode, encode_immediate, DpOpcode, HalfOffset, Instruction, LoadStore,
    LoadStoreHalf, LsOffset, MsrOperand, Operand2, Shift, ShiftKind,
};

use crate::diag::{Diagnostic, Diagnostics, Pos};
use crate::expr::{self, EvalError, Expr, Resolver};
use crate::parser::{
    self, AddrAst, Directive, Instr, InstrAst, Item, LabelDef, MsrAst, Op2Ast, ShiftAst,
    Statement,
};
use crate::preprocess::{Preprocessor, SourceProvider};
pub use crate::symbols::Section;
use crate::symbols::SymbolTable;

/// Assembler options.
#[derive(Debug, Clone)]
pub struct Options {
    /// Code origin (base of the text section).
    pub origin: u32,
    /// Diagnostic cap before further errors are summarized.
    pub max_errors: usize,
    /// `.include` nesting limit.
    pub max_include_depth: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self { origin: 0x8000, max_errors: 32, max_include_depth: 100 }
    }
}

/// The assembled binary image.
#[derive(Debug, Clone)]
pub struct Image {
    pub text_base: u32,
    pub text: Vec<u8>,
    pub data_base: u32,
    pub data: Vec<u8>,
    pub bss_base: u32,
    pub bss_size: u32,
    /// Entry point: `_start` when defined, else the text base.
    pub entry: u32,
}

/// A successful assembly: image plus the finalized symbol table.
#[derive(Debug)]
pub struct Program {
    pub image: Image,
    pub symbols: SymbolTable,
}

// ---------------------------------------------------------------------------
// Pass-1 records
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum EmitKind {
    Instr { instr: Instr, literal: Option<usize> },
    Word(Vec<Expr>),
    Byte(Vec<Expr>),
    Bytes(Vec<u8>),
    Skip { len: u32, fill: Option<Expr> },
    /// One literal-pool slot (index into the slot table).
    Pool(usize),
}

#[derive(Debug)]
struct Emission {
    section: Section,
    offset: u32,
    seq: u32,
    scope: String,
    pos: Pos,
    kind: EmitKind,
}

#[derive(Debug)]
struct LiteralSlot {
    expr: Expr,
    /// Filled in when the slot is flushed into a pool.
    place: Option<(Section, u32)>,
}

struct Pass1 {
    table: SymbolTable,
    emissions: Vec<Emission>,
    literals: Vec<LiteralSlot>,
    /// Unflushed literal indices, per section.
    pending: [Vec<usize>; 3],
    loc: [u32; 3],
    section: Section,
    text_base: u32,
    text_touched: bool,
    scope: String,
    seq: u32,
}

impl Pass1 {
    fn new(origin: u32) -> Self {
        Self {
            table: SymbolTable::new(),
            emissions: Vec::new(),
            literals: Vec::new(),
            pending: [Vec::new(), Vec::new(), Vec::new()],
            loc: [0; 3],
            section: Section::Text,
            text_base: origin,
            text_touched: false,
            scope: String::new(),
            seq: 0,
        }
    }

    fn loc(&self) -> u32 {
        self.loc[self.section.index()]
    }

    fn advance(&mut self, by: u32) {
        self.loc[self.section.index()] += by;
        if self.section == Section::Text {
            self.text_touched = true;
        }
    }

    fn emit(&mut self, kind: EmitKind, pos: Pos) -> u32 {
        let offset = self.loc();
        self.emissions.push(Emission {
            section: self.section,
            offset,
            seq: self.seq,
            scope: self.scope.clone(),
            pos,
            kind,
        });
        offset
    }

    /// Evaluate a pass-1 constant (alignment, sizes, .org). Labels are not
    /// yet placed, so only constants and already-defined `.equ`s work.
    fn const_eval(&self, e: &Expr, pos: &Pos, what: &str, diags: &mut Diagnostics) -> Option<i64> {
        struct ConstCtx<'a>(&'a SymbolTable);
        impl Resolver for ConstCtx<'_> {
            fn symbol(&self, name: &str) -> Result<i64, EvalError> {
                self.0.value(name)
            }
            fn local(&self, n: u32, forward: bool) -> Result<i64, EvalError> {
                Err(EvalError::NoLocalLabel { n, forward })
            }
            fn here(&self) -> Result<i64, EvalError> {
                Err(EvalError::NoLocation)
            }
        }
        match expr::eval(e, &ConstCtx(&self.table)) {
            Ok(v) => Some(v),
            Err(err) => {
                diags.report(pos.clone(), format!("{what} must be a constant: {err}"));
                None
            }
        }
    }

    /// Register a literal for `LDR Rd, =expr`, deduplicating within the
    /// pending pool.
    fn register_literal(&mut self, e: &Expr) -> usize {
        let pending = &self.pending[self.section.index()];
        if let Some(&idx) = pending.iter().find(|&&idx| self.literals[idx].expr == *e) {
            return idx;
        }
        let idx = self.literals.len();
        self.literals.push(LiteralSlot { expr: e.clone(), place: None });
        self.pending[self.section.index()].push(idx);
        idx
    }

    /// Flush pending literals of the current section into a pool here.
    fn flush_pool(&mut self, pos: &Pos) {
        let pending = std::mem::take(&mut self.pending[self.section.index()]);
        for idx in pending {
            let offset = self.emit(EmitKind::Pool(idx), pos.clone());
            self.literals[idx].place = Some((self.section, offset));
            self.advance(4);
        }
    }

    fn define_label(&mut self, def: &LabelDef, pos: &Pos, diags: &mut Diagnostics) {
        match def {
            LabelDef::Name(name) => {
                let full = if name.starts_with('.') {
                    format!("{}{name}", self.scope)
                } else {
                    self.scope = name.clone();
                    name.clone()
                };
                if let Err(original) =
                    self.table.define_label(&full, self.section, self.loc(), pos.clone())
                {
                    diags.report_with(
                        pos.clone(),
                        format!("duplicate symbol '{full}'"),
                        Some(format!("first defined at {original}")),
                    );
                }
            }
            LabelDef::Numeric(n) => {
                self.table.define_numeric(*n, self.seq, self.section, self.loc());
            }
        }
    }

    fn handle_directive(&mut self, d: &Directive, pos: &Pos, diags: &mut Diagnostics) {
        match d {
            Directive::Text => self.section = Section::Text,
            Directive::Data => self.section = Section::Data,
            Directive::Bss => self.section = Section::Bss,
            Directive::Org(e) => {
                if self.section != Section::Text {
                    diags.report(pos.clone(), ".org applies to the text section");
                    return;
                }
                let Some(v) = self.const_eval(e, pos, ".org address", diags) else { return };
                let target = v as u32;
                if !self.text_touched && self.loc[0] == 0 {
                    self.text_base = target;
                } else if target >= self.text_base + self.loc[0] {
                    let pad = target - self.text_base - self.loc[0];
                    self.emit(EmitKind::Skip { len: pad, fill: None }, pos.clone());
                    self.advance(pad);
                } else {
                    diags.report(pos.clone(), ".org cannot move the location backwards");
                }
            }
            Directive::Equ { name, expr } | Directive::Set { name, expr } => {
                let redefinable = matches!(d, Directive::Set { .. });
                if let Err(original) =
                    self.table.define_constant(name, expr.clone(), redefinable, pos.clone())
                {
                    diags.report_with(
                        pos.clone(),
                        format!("duplicate symbol '{name}'"),
                        Some(format!("first defined at {original}")),
                    );
                }
            }
            Directive::Word(exprs) => {
                if self.no_data_here(pos, diags) {
                    return;
                }
                let len = 4 * exprs.len() as u32;
                self.emit(EmitKind::Word(exprs.clone()), pos.clone());
                self.advance(len);
            }
            Directive::Byte(exprs) => {
                if self.no_data_here(pos, diags) {
                    return;
                }
                let len = exprs.len() as u32;
                self.emit(EmitKind::Byte(exprs.clone()), pos.clone());
                self.advance(len);
            }
            Directive::Ascii(bytes) => {
                if self.no_data_here(pos, diags) {
                    return;
                }
                let len = bytes.len() as u32;
                self.emit(EmitKind::Bytes(bytes.clone()), pos.clone());
                self.advance(len);
            }
            Directive::Asciz(bytes) => {
                if self.no_data_here(pos, diags) {
                    return;
                }
                let mut bytes = bytes.clone();
                bytes.push(0);
                let len = bytes.len() as u32;
                self.emit(EmitKind::Bytes(bytes), pos.clone());
                self.advance(len);
            }
            Directive::Skip { count, fill } => {
                let Some(v) = self.const_eval(count, pos, ".skip size", diags) else { return };
                if v < 0 {
                    diags.report(pos.clone(), ".skip size cannot be negative");
                    return;
                }
                let len = v as u32;
                self.emit(EmitKind::Skip { len, fill: fill.clone() }, pos.clone());
                self.advance(len);
            }
            Directive::Balign(e) => {
                let Some(v) = self.const_eval(e, pos, "alignment", diags) else { return };
                if v <= 0 || (v & (v - 1)) != 0 {
                    diags.report(pos.clone(), "alignment must be a power of two");
                    return;
                }
                let align = v as u32;
                let pad = (align - self.loc() % align) % align;
                if pad > 0 {
                    self.emit(EmitKind::Skip { len: pad, fill: None }, pos.clone());
                    self.advance(pad);
                }
            }
            Directive::Global(names) => {
                for name in names {
                    self.table.mark_global(name);
                }
            }
            // No linker: .extern is a declaration with nothing to record.
            Directive::Extern(_) => {}
            Directive::Ltorg => {
                if self.section == Section::Bss {
                    diags.report(pos.clone(), ".ltorg is not allowed in .bss");
                    return;
                }
                self.flush_pool(pos);
            }
        }
    }

    /// True (and diagnosed) when the current section cannot hold data.
    fn no_data_here(&mut self, pos: &Pos, diags: &mut Diagnostics) -> bool {
        if self.section == Section::Bss {
            diags.report_with(
                pos.clone(),
                "initialized data is not allowed in .bss",
                Some("use .skip, or move this to .data".to_string()),
            );
            return true;
        }
        false
    }

    fn handle_instruction(&mut self, instr: &Instr, pos: &Pos, diags: &mut Diagnostics) {
        if self.section != Section::Text {
            diags.report_with(
                pos.clone(),
                "instructions are only allowed in .text",
                Some("add a .text directive".to_string()),
            );
            return;
        }
        if self.loc() % 4 != 0 {
            diags.report_with(
                pos.clone(),
                "instruction at unaligned address",
                Some("insert .balign 4".to_string()),
            );
            return;
        }
        let literal = match &instr.ast {
            InstrAst::LoadStore { addr: AddrAst::Literal(e), .. } => Some(self.register_literal(e)),
            _ => None,
        };
        self.emit(EmitKind::Instr { instr: instr.clone(), literal }, pos.clone());
        self.advance(4);
    }

    fn run(&mut self, statements: &[Statement], diags: &mut Diagnostics) {
        for stmt in statements {
            self.seq += 1;
            for label in &stmt.labels {
                self.define_label(label, &stmt.pos, diags);
            }
            match &stmt.item {
                Some(Item::Instr(instr)) => self.handle_instruction(instr, &stmt.pos, diags),
                Some(Item::Directive(d)) => self.handle_directive(d, &stmt.pos, diags),
                None => {}
            }
        }
        // End of input flushes every pending pool into its section.
        for section in [Section::Text, Section::Data] {
            self.section = section;
            if !self.pending[section.index()].is_empty() {
                let pos = Pos::new("<end>", 0, 0);
                self.flush_pool(&pos);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Pass 2
// ---------------------------------------------------------------------------

struct EmitResolver<'a> {
    table: &'a SymbolTable,
    here: u32,
    seq: u32,
    scope: &'a str,
}

impl Resolver for EmitResolver<'_> {
    fn symbol(&self, name: &str) -> Result<i64, EvalError> {
        if name.starts_with('.') {
            let scoped = format!("{}{name}", self.scope);
            if let Ok(v) = self.table.value(&scoped) {
                return Ok(v);
            }
        }
        self.table.value(name)
    }
    fn local(&self, n: u32, forward: bool) -> Result<i64, EvalError> {
        self.table.numeric_ref(n, self.seq, forward)
    }
    fn here(&self) -> Result<i64, EvalError> {
        Ok(i64::from(self.here))
    }
}

/// Convert a parsed shift into the encoded form, with range checks.
fn build_shift(
    shift: &ShiftAst,
    resolver: &EmitResolver<'_>,
) -> Result<Shift, String> {
    Ok(match shift {
        ShiftAst::None => Shift::NONE,
        ShiftAst::Rrx => Shift::Imm { kind: ShiftKind::Ror, amount: 0 },
        ShiftAst::Reg(kind, rs) => Shift::Reg { kind: *kind, rs: *rs },
        ShiftAst::Imm(kind, e) => {
            let v = expr::eval(e, resolver).map_err(|e| e.to_string())?;
            match (kind, v) {
                (_, 0) => Shift::NONE,
                (ShiftKind::Lsl, 1..=31) => Shift::Imm { kind: *kind, amount: v as u8 },
                (ShiftKind::Lsr | ShiftKind::Asr, 1..=31) => {
                    Shift::Imm { kind: *kind, amount: v as u8 }
                }
                // The encoding spells #32 as 0 for LSR/ASR.
                (ShiftKind::Lsr | ShiftKind::Asr, 32) => Shift::Imm { kind: *kind, amount: 0 },
                (ShiftKind::Ror, 1..=31) => Shift::Imm { kind: *kind, amount: v as u8 },
                _ => return Err(format!("shift amount {v} out of range for {}", kind.mnemonic())),
            }
        }
    })
}

/// Rotated-immediate encoding with the conventional opcode rewrites
/// (MOV/MVN, ADD/SUB, CMP/CMN) when the raw value does not fit.
fn build_dp_immediate(op: DpOpcode, value: u32) -> Result<(DpOpcode, u8, u8), String> {
    if let Some((v, rot)) = encode_immediate(value) {
        return Ok((op, v, rot));
    }
    let twin = match op {
        DpOpcode::Mov => Some((DpOpcode::Mvn, !value)),
        DpOpcode::Mvn => Some((DpOpcode::Mov, !value)),
        DpOpcode::Add => Some((DpOpcode::Sub, value.wrapping_neg())),
        DpOpcode::Sub => Some((DpOpcode::Add, value.wrapping_neg())),
        DpOpcode::Cmp => Some((DpOpcode::Cmn, value.wrapping_neg())),
        DpOpcode::Cmn => Some((DpOpcode::Cmp, value.wrapping_neg())),
        _ => None,
    };
    if let Some((twin_op, twin_value)) = twin {
        if let Some((v, rot)) = encode_immediate(twin_value) {
            return Ok((twin_op, v, rot));
        }
    }
    Err(format!("immediate 0x{value:X} cannot be encoded as a rotated 8-bit value"))
}

/// Build the address operand of a word/byte load-store.
fn build_ls_address(
    addr: &AddrAst,
    abs: u32,
    literal_addr: Option<u32>,
    resolver: &EmitResolver<'_>,
) -> Result<(u8, bool, bool, bool, LsOffset), String> {
    // Returns (rn, pre, up, writeback, offset).
    Ok(match addr {
        AddrAst::PreImm { rn, offset, writeback } => {
            let v = expr::eval(offset, resolver).map_err(|e| e.to_string())?;
            let (up, mag) = signed_offset(v, 4095)?;
            (*rn, true, up, *writeback, LsOffset::Imm(mag as u16))
        }
        AddrAst::PostImm { rn, offset } => {
            let v = expr::eval(offset, resolver).map_err(|e| e.to_string())?;
            let (up, mag) = signed_offset(v, 4095)?;
            (*rn, false, up, false, LsOffset::Imm(mag as u16))
        }
        AddrAst::PreReg { rn, neg, rm, shift, writeback } => {
            let shift = build_reg_offset_shift(shift, resolver)?;
            (*rn, true, !neg, *writeback, LsOffset::Reg { rm: *rm, shift })
        }
        AddrAst::PostReg { rn, neg, rm, shift } => {
            let shift = build_reg_offset_shift(shift, resolver)?;
            (*rn, false, !neg, false, LsOffset::Reg { rm: *rm, shift })
        }
        AddrAst::PcRel(e) => {
            let target = expr::eval(e, resolver).map_err(|e| e.to_string())? as u32;
            let (up, mag) = pc_relative(abs, target, 4095)?;
            (15, true, up, false, LsOffset::Imm(mag as u16))
        }
        AddrAst::Literal(_) => {
            let pool = literal_addr.expect("literal slot placed in pass 1");
            let (up, mag) = pc_relative(abs, pool, 4095).map_err(|_| {
                "no literal pool in range; insert .ltorg nearer".to_string()
            })?;
            (15, true, up, false, LsOffset::Imm(mag as u16))
        }
    })
}

fn build_reg_offset_shift(
    shift: &ShiftAst,
    resolver: &EmitResolver<'_>,
) -> Result<Shift, String> {
    if matches!(shift, ShiftAst::Reg(..)) {
        return Err("register-shifted offsets are not encodable".to_string());
    }
    build_shift(shift, resolver)
}

fn signed_offset(v: i64, max: i64) -> Result<(bool, u32), String> {
    let mag = v.abs();
    if mag > max {
        return Err(format!("offset {v} exceeds ±{max}"));
    }
    Ok((v >= 0, mag as u32))
}

fn pc_relative(abs: u32, target: u32, max: i64) -> Result<(bool, u32), String> {
    let diff = i64::from(target) - i64::from(abs) - 8;
    signed_offset(diff, max).map_err(|_| {
        format!("target 0x{target:08X} out of PC-relative range (±{max})")
    })
}

/// Build and encode one instruction at absolute address `abs`.
fn build_instruction(
    instr: &Instr,
    abs: u32,
    literal_addr: Option<u32>,
    resolver: &EmitResolver<'_>,
) -> Result<Instruction, String> {
    let cond = instr.cond;
    Ok(match &instr.ast {
        InstrAst::DataProc { op, s, rd, rn, op2 } => {
            let (op, op2) = match op2 {
                Op2Ast::Imm(e) => {
                    let value = expr::eval(e, resolver).map_err(|e| e.to_string())? as u32;
                    let (op, v, rot) = build_dp_immediate(*op, value)?;
                    (op, Operand2::Immediate { value: v, rotate: rot })
                }
                Op2Ast::Reg { rm, shift } => {
                    (*op, Operand2::Register { rm: *rm, shift: build_shift(shift, resolver)? })
                }
            };
            Instruction::DataProcessing(cpu_arm2::DataProcessing {
                cond,
                op,
                s: *s,
                rn: *rn,
                rd: *rd,
                op2,
            })
        }
        InstrAst::Mul { s, rd, rm, rs } => Instruction::Multiply(cpu_arm2::Multiply {
            cond,
            accumulate: false,
            s: *s,
            rd: *rd,
            rn: 0,
            rs: *rs,
            rm: *rm,
        }),
        InstrAst::Mla { s, rd, rm, rs, rn } => Instruction::Multiply(cpu_arm2::Multiply {
            cond,
            accumulate: true,
            s: *s,
            rd: *rd,
            rn: *rn,
            rs: *rs,
            rm: *rm,
        }),
        InstrAst::LongMul { signed, accumulate, s, rd_lo, rd_hi, rm, rs } => {
            Instruction::LongMultiply(cpu_arm2::LongMultiply {
                cond,
                signed: *signed,
                accumulate: *accumulate,
                s: *s,
                rd_hi: *rd_hi,
                rd_lo: *rd_lo,
                rs: *rs,
                rm: *rm,
            })
        }
        InstrAst::LoadStore { load, byte, rd, addr } => {
            let (rn, pre, up, writeback, offset) =
                build_ls_address(addr, abs, literal_addr, resolver)?;
            Instruction::LoadStore(LoadStore {
                cond,
                load: *load,
                byte: *byte,
                pre,
                up,
                writeback,
                rn,
                rd: *rd,
                offset,
            })
        }
        InstrAst::LoadStoreHalf { load, kind, rd, addr } => {
            let (rn, pre, up, writeback, offset) = match addr {
                AddrAst::PreImm { rn, offset, writeback } => {
                    let v = expr::eval(offset, resolver).map_err(|e| e.to_string())?;
                    let (up, mag) = signed_offset(v, 255)?;
                    (*rn, true, up, *writeback, HalfOffset::Imm(mag as u8))
                }
                AddrAst::PostImm { rn, offset } => {
                    let v = expr::eval(offset, resolver).map_err(|e| e.to_string())?;
                    let (up, mag) = signed_offset(v, 255)?;
                    (*rn, false, up, false, HalfOffset::Imm(mag as u8))
                }
                AddrAst::PreReg { rn, neg, rm, shift, writeback } => {
                    if !matches!(shift, ShiftAst::None) {
                        return Err("halfword transfers take no shifted offset".to_string());
                    }
                    (*rn, true, !neg, *writeback, HalfOffset::Reg(*rm))
                }
                AddrAst::PostReg { rn, neg, rm, shift } => {
                    if !matches!(shift, ShiftAst::None) {
                        return Err("halfword transfers take no shifted offset".to_string());
                    }
                    (*rn, false, !neg, false, HalfOffset::Reg(*rm))
                }
                AddrAst::PcRel(e) => {
                    let target = expr::eval(e, resolver).map_err(|e| e.to_string())? as u32;
                    let (up, mag) = pc_relative(abs, target, 255)?;
                    (15, true, up, false, HalfOffset::Imm(mag as u8))
                }
                AddrAst::Literal(_) => {
                    return Err("'=' literals require a word LDR".to_string());
                }
            };
            Instruction::LoadStoreHalf(LoadStoreHalf {
                cond,
                load: *load,
                kind: *kind,
                pre,
                up,
                writeback,
                rn,
                rd: *rd,
                offset,
            })
        }
        InstrAst::Block { load, mode, rn, writeback, regs } => {
            Instruction::BlockTransfer(cpu_arm2::BlockTransfer {
                cond,
                load: *load,
                mode: *mode,
                s: false,
                writeback: *writeback,
                rn: *rn,
                regs: *regs,
            })
        }
        InstrAst::Branch { link, target } => {
            let target = expr::eval(target, resolver).map_err(|e| e.to_string())? as u32;
            let offset = branch_offset(abs, target).ok_or_else(|| {
                format!("branch target 0x{target:08X} out of the ±32 MiB range")
            })?;
            Instruction::Branch(cpu_arm2::Branch { cond, link: *link, offset })
        }
        InstrAst::Bx { rm } => {
            Instruction::BranchExchange(cpu_arm2::BranchExchange { cond, rm: *rm })
        }
        InstrAst::Swp { byte, rd, rm, rn } => Instruction::Swap(cpu_arm2::Swap {
            cond,
            byte: *byte,
            rn: *rn,
            rd: *rd,
            rm: *rm,
        }),
        InstrAst::Swi { imm } => {
            let v = expr::eval(imm, resolver).map_err(|e| e.to_string())?;
            if !(0..=0x00FF_FFFF).contains(&v) {
                return Err(format!("SWI number {v} exceeds 24 bits"));
            }
            Instruction::Swi(cpu_arm2::Swi { cond, imm: v as u32 })
        }
        InstrAst::Mrs { rd } => Instruction::Mrs(cpu_arm2::Mrs { cond, spsr: false, rd: *rd }),
        InstrAst::Msr { flags_only, op } => {
            let op = match op {
                MsrAst::Reg(rm) => MsrOperand::Register(*rm),
                MsrAst::Imm(e) => {
                    let value = expr::eval(e, resolver).map_err(|e| e.to_string())? as u32;
                    let (v, rot) = encode_immediate(value).ok_or_else(|| {
                        format!("immediate 0x{value:X} cannot be encoded as a rotated 8-bit value")
                    })?;
                    MsrOperand::Immediate { value: v, rotate: rot }
                }
            };
            Instruction::Msr(cpu_arm2::Msr { cond, spsr: false, flags_only: *flags_only, op })
        }
        InstrAst::Adr { rd, target } => {
            let target = expr::eval(target, resolver).map_err(|e| e.to_string())? as u32;
            let diff = i64::from(target) - i64::from(abs) - 8;
            let (op, mag) =
                if diff >= 0 { (DpOpcode::Add, diff as u32) } else { (DpOpcode::Sub, (-diff) as u32) };
            let (value, rotate) = encode_immediate(mag).ok_or_else(|| {
                format!("ADR target 0x{target:08X} is not a rotated-immediate offset away")
            })?;
            Instruction::DataProcessing(cpu_arm2::DataProcessing {
                cond,
                op,
                s: false,
                rn: 15,
                rd: *rd,
                op2: Operand2::Immediate { value, rotate },
            })
        }
    })
}

const fn align4(v: u32) -> u32 {
    (v + 3) & !3
}

/// Assemble a source file to a binary image.
///
/// # Errors
///
/// Returns the accumulated diagnostics when the source does not assemble;
/// no partial image is produced.
pub fn assemble(
    source: &str,
    file: &str,
    provider: &dyn SourceProvider,
    opts: &Options,
) -> Result<Program, Vec<Diagnostic>> {
    let mut diags = Diagnostics::new(opts.max_errors);

    let lines = Preprocessor::new(provider, opts.max_include_depth).run(source, file, &mut diags);
    let statements: Vec<Statement> =
        lines.iter().map(|line| parser::parse_line(line, &mut diags)).collect();

    let mut pass1 = Pass1::new(opts.origin);
    pass1.run(&statements, &mut diags);

    let Pass1 { mut table, emissions, literals, loc, text_base, .. } = pass1;

    let data_base = align4(text_base + loc[0]);
    let bss_base = align4(data_base + loc[1]);
    table.finalize([text_base, data_base, bss_base]);

    let mut text = vec![0u8; loc[0] as usize];
    let mut data = vec![0u8; loc[1] as usize];
    let bases = [text_base, data_base, bss_base];

    for emission in &emissions {
        let abs = bases[emission.section.index()] + emission.offset;
        let resolver = EmitResolver {
            table: &table,
            here: abs,
            seq: emission.seq,
            scope: &emission.scope,
        };
        let buf = match emission.section {
            Section::Text => &mut text,
            Section::Data => &mut data,
            Section::Bss => {
                // Only .skip reaches here; nothing to write.
                continue;
            }
        };
        let mut off = emission.offset as usize;
        let mut write_word = |buf: &mut Vec<u8>, off: &mut usize, w: u32| {
            buf[*off..*off + 4].copy_from_slice(&w.to_le_bytes());
            *off += 4;
        };
        match &emission.kind {
            EmitKind::Instr { instr, literal } => {
                let literal_addr = literal.map(|idx| {
                    let (section, offset) =
                        literals[idx].place.expect("pools flushed at end of pass 1");
                    bases[section.index()] + offset
                });
                match build_instruction(instr, abs, literal_addr, &resolver) {
                    Ok(built) => write_word(buf, &mut off, encode(&built)),
                    Err(msg) => diags.report(emission.pos.clone(), msg),
                }
            }
            EmitKind::Word(exprs) => {
                for e in exprs {
                    match expr::eval(e, &resolver) {
                        Ok(v) => write_word(buf, &mut off, v as u32),
                        Err(e) => diags.report(emission.pos.clone(), e.to_string()),
                    }
                }
            }
            EmitKind::Byte(exprs) => {
                for e in exprs {
                    match expr::eval(e, &resolver) {
                        Ok(v) => {
                            buf[off] = v as u8;
                            off += 1;
                        }
                        Err(e) => diags.report(emission.pos.clone(), e.to_string()),
                    }
                }
            }
            EmitKind::Bytes(bytes) => {
                buf[off..off + bytes.len()].copy_from_slice(bytes);
            }
            EmitKind::Skip { len, fill } => {
                let fill = match fill {
                    None => 0u8,
                    Some(e) => match expr::eval(e, &resolver) {
                        Ok(v) => v as u8,
                        Err(e) => {
                            diags.report(emission.pos.clone(), e.to_string());
                            0
                        }
                    },
                };
                buf[off..off + *len as usize].fill(fill);
            }
            EmitKind::Pool(idx) => match expr::eval(&literals[*idx].expr, &resolver) {
                Ok(v) => write_word(buf, &mut off, v as u32),
                Err(e) => diags.report(emission.pos.clone(), e.to_string()),
            },
        }
    }

    if !diags.is_empty() {
        return Err(diags.into_vec());
    }

    let entry = table.address_of("_start").unwrap_or(text_base);
    Ok(Program {
        image: Image {
            text_base,
            text,
            data_base,
            data,
            bss_base,
            bss_size: loc[2],
            entry,
        },
        symbols: table,
    })
}
