//! The virtual machine: loading, the run loop and fault reporting.
//!
//! Owns one CPU, one address space, the syscall layer and the debugger
//! tables. The run loop executes in chunks so a session can release its
//! lock at cooperative yield points; `step`, `step-over`, `finish` and
//! `continue` are all expressed over the same single-instruction body.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use asm_arm2::{assemble, Diagnostic, Options, Program, SourceProvider};
use cpu_arm2::{decode, Cpu, Fault, Memory, Perms, Segment, SegmentKind, StepEvent, LR, PC, SP};

use crate::config::VmConfig;
use crate::debugger::{Debugger, DisasmLine, WatchMode};
use crate::expr::{evaluate, MachineContext};
use crate::syscall::{HostIo, SysOutcome, SyscallLayer};

/// Depth of the recent-instruction ring kept for fault reports.
const RECENT_DEPTH: usize = 8;
/// Stack words included in a fault report.
const REPORT_STACK_WORDS: u32 = 8;

/// Machine lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    /// No program loaded.
    Idle,
    /// Loaded and ready to run.
    Ready,
    Running,
    Paused,
    Halted,
    Error,
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Halted => "halted",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

/// A runtime error that stops the machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmError {
    Fault(Fault),
    Assertion { message: String },
    UnknownSyscall { code: u32 },
    /// An operation was requested in a state that cannot serve it.
    BadState { state: VmState },
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fault(fault) => fault.fmt(f),
            Self::Assertion { message } => write!(f, "assertion failed: {message}"),
            Self::UnknownSyscall { code } => write!(f, "unknown syscall 0x{code:X}"),
            Self::BadState { state } => write!(f, "machine is {state}"),
        }
    }
}

impl std::error::Error for VmError {}

/// Why a run returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// The requested number of steps completed (single step).
    Step,
    Breakpoint { id: u32, addr: u32 },
    Watchpoint { id: u32, addr: u32 },
    Halted { code: u32 },
    Error(VmError),
    /// Cancellation was requested from another thread.
    Cancelled,
}

/// Run policies built on the single-step body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPolicy {
    Continue,
    /// Run until the instruction after a BL returns control.
    StepOver,
    /// Run until the address in LR at entry.
    Finish,
}

/// Register snapshot for the facade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterState {
    pub r: [u32; 16],
    pub n: bool,
    pub z: bool,
    pub c: bool,
    pub v: bool,
    pub cycles: u64,
}

/// Structured report produced when the machine enters `Error`.
#[derive(Debug, Clone)]
pub struct FaultReport {
    pub error: VmError,
    pub pc: u32,
    pub nearest_symbol: Option<(String, u32)>,
    /// Last executed instructions: (address, word, disassembly).
    pub recent: Vec<(u32, u32, String)>,
    pub registers: RegisterState,
    /// Words from the top of stack, lowest address first.
    pub stack_top: Vec<u32>,
}

/// Loading can fail in assembly or in layout.
#[derive(Debug)]
pub enum LoadError {
    Assemble(Vec<Diagnostic>),
    Layout(String),
}

/// One chunk of execution (internal to run loops).
enum Chunk {
    Stopped(StopReason),
    More,
}

pub struct Vm {
    config: VmConfig,
    cpu: Cpu,
    mem: Memory,
    state: VmState,
    program: Option<Program>,
    syscalls: SyscallLayer,
    debugger: Debugger,
    recent: VecDeque<(u32, u32)>,
    fault_report: Option<FaultReport>,
    /// Instructions spent in the current run (budget accounting).
    run_used: u64,
    /// Set when resuming at a breakpoint address so it does not re-fire.
    resume_skip: bool,
    heap_base: u32,
    exit_code: u32,
}

impl Vm {
    /// Create a machine with the given host I/O.
    ///
    /// # Errors
    ///
    /// Returns a [`crate::ConfigError`] for invalid configurations.
    pub fn new(config: VmConfig, io: Box<dyn HostIo>) -> Result<Self, crate::ConfigError> {
        config.validate()?;
        let syscalls = SyscallLayer::new(
            io,
            config.fs_root.clone(),
            config.max_file_size,
            config.args.clone(),
            config.env.clone(),
        );
        Ok(Self {
            mem: Memory::new(config.strict_alignment),
            cpu: Cpu::new(),
            state: VmState::Idle,
            program: None,
            syscalls,
            debugger: Debugger::new(),
            recent: VecDeque::with_capacity(RECENT_DEPTH),
            fault_report: None,
            run_used: 0,
            resume_skip: false,
            heap_base: 0,
            exit_code: 0,
            config,
        })
    }

    #[must_use]
    pub fn state(&self) -> VmState {
        self.state
    }

    #[must_use]
    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    #[must_use]
    pub fn fault_report(&self) -> Option<&FaultReport> {
        self.fault_report.as_ref()
    }

    #[must_use]
    pub fn symbols(&self) -> Option<&asm_arm2::SymbolTable> {
        self.program.as_ref().map(|p| &p.symbols)
    }

    /// Assemble and load a program.
    ///
    /// # Errors
    ///
    /// [`LoadError::Assemble`] carries the diagnostic batch;
    /// [`LoadError::Layout`] rejects images the configuration cannot map.
    pub fn load_source(
        &mut self,
        source: &str,
        name: &str,
        provider: &dyn SourceProvider,
    ) -> Result<(), LoadError> {
        let opts = Options {
            origin: self.config.origin,
            max_include_depth: self.config.max_include_depth,
            ..Options::default()
        };
        let program = assemble(source, name, provider, &opts).map_err(LoadError::Assemble)?;
        self.load_program(program)
    }

    /// Load an already-assembled program.
    ///
    /// # Errors
    ///
    /// [`LoadError::Layout`] when segments collide or exceed `memorySize`.
    pub fn load_program(&mut self, program: Program) -> Result<(), LoadError> {
        let image = &program.image;
        let heap_base = (image.bss_base + image.bss_size + 15) & !15;
        let heap_end = heap_base + self.config.heap_size;
        let stack_base = self.config.stack_top - self.config.stack_size;
        if heap_end > self.config.memory_size || self.config.stack_top > self.config.memory_size {
            return Err(LoadError::Layout(format!(
                "image needs 0x{heap_end:X} bytes but memorySize is 0x{:X}",
                self.config.memory_size
            )));
        }
        if heap_end > stack_base && image.text_base < self.config.stack_top {
            return Err(LoadError::Layout(
                "heap would overlap the stack segment".to_string(),
            ));
        }
        self.heap_base = heap_base;
        self.program = Some(program);
        self.reset();
        Ok(())
    }

    /// Reset to `Ready`: registers, flags and cycle counter zeroed, all
    /// writable segments zeroed, the loaded image re-mapped, PC at entry.
    pub fn reset(&mut self) {
        let Some(program) = &self.program else {
            self.state = VmState::Idle;
            return;
        };
        let image = &program.image;
        let stack_base = self.config.stack_top - self.config.stack_size;

        let mut mem = Memory::new(self.config.strict_alignment);
        mem.set_segment(Segment::new(
            SegmentKind::Code,
            image.text_base,
            image.text.len() as u32,
            Perms::RX,
        ));
        mem.set_segment(Segment::new(
            SegmentKind::Data,
            image.data_base,
            image.data.len() as u32,
            Perms::RW,
        ));
        mem.set_segment(Segment::new(SegmentKind::Bss, image.bss_base, image.bss_size, Perms::RW));
        mem.set_segment(Segment::new(
            SegmentKind::Heap,
            self.heap_base,
            self.config.heap_size,
            Perms::RW,
        ));
        mem.set_segment(Segment::new(
            SegmentKind::Stack,
            stack_base,
            self.config.stack_size,
            Perms::RW,
        ));
        if !image.text.is_empty() {
            mem.load_bytes(image.text_base, &image.text).expect("text segment maps its image");
        }
        if !image.data.is_empty() {
            mem.load_bytes(image.data_base, &image.data).expect("data segment maps its image");
        }

        self.mem = mem;
        self.cpu.reset();
        self.cpu.regs.write(PC, image.entry);
        self.cpu.regs.write(SP, self.config.stack_top);
        self.syscalls.reset(self.heap_base, self.config.heap_size);
        self.recent.clear();
        self.fault_report = None;
        self.run_used = 0;
        self.resume_skip = false;
        self.exit_code = 0;
        self.debugger.clear_temporaries();
        self.state = VmState::Ready;
    }

    // -----------------------------------------------------------------
    // Inspection
    // -----------------------------------------------------------------

    #[must_use]
    pub fn registers(&self) -> RegisterState {
        RegisterState {
            r: self.cpu.regs.r,
            n: self.cpu.cpsr.n,
            z: self.cpu.cpsr.z,
            c: self.cpu.cpsr.c,
            v: self.cpu.cpsr.v,
            cycles: self.cpu.cycles,
        }
    }

    pub fn write_register(&mut self, index: usize, value: u32) {
        self.cpu.regs.write(index & 0xF, value);
    }

    /// Side-effect-free memory read for inspection.
    #[must_use]
    pub fn read_memory(&self, addr: u32, len: u32) -> Vec<u8> {
        (0..len).map_while(|i| self.mem.peek_byte(addr.wrapping_add(i))).collect()
    }

    /// Checked memory write from the facade (permission rules apply).
    ///
    /// # Errors
    ///
    /// Propagates the memory fault for unmapped or read-only targets.
    pub fn write_memory(&mut self, addr: u32, bytes: &[u8]) -> Result<(), Fault> {
        for (i, b) in bytes.iter().enumerate() {
            self.mem.write_byte(addr.wrapping_add(i as u32), u32::from(*b))?;
        }
        let _ = self.mem.take_trace();
        Ok(())
    }

    /// Queue stdin bytes for the guest (FIFO).
    pub fn send_input(&mut self, bytes: &[u8]) {
        self.syscalls.stdin.extend(bytes.iter().copied());
    }

    /// Evaluate a debugger expression against the live machine.
    ///
    /// # Errors
    ///
    /// Returns the evaluator's message on bad syntax or unknown names.
    pub fn evaluate(&self, text: &str) -> Result<i64, String> {
        let peek = |addr: u32| self.mem.peek_word(addr);
        let ctx = MachineContext {
            cpu: &self.cpu,
            peek: &peek,
            symbols: self.symbols(),
        };
        evaluate(text, &ctx)
    }

    /// Disassemble `count` instructions starting at `addr`.
    #[must_use]
    pub fn disassemble(&self, addr: u32, count: u32) -> Vec<DisasmLine> {
        let symbols = self.symbols();
        (0..count)
            .map_while(|i| {
                let at = addr.wrapping_add(i * 4);
                let word = self.mem.peek_word(at)?;
                let text = decode(word)
                    .map_or_else(|| format!(".word 0x{word:08X}"), |instr| instr.disasm(at));
                let symbol = symbols
                    .and_then(|t| t.nearest(at))
                    .map(|(name, offset)| (name.to_string(), offset));
                Some(DisasmLine { addr: at, word, text, symbol })
            })
            .collect()
    }

    // -----------------------------------------------------------------
    // Debugger table passthrough
    // -----------------------------------------------------------------

    pub fn add_breakpoint(&mut self, addr: u32, condition: Option<String>) -> u32 {
        self.debugger.add_breakpoint(addr, condition, false)
    }

    pub fn add_watchpoint(
        &mut self,
        addr: u32,
        len: u32,
        mode: WatchMode,
        condition: Option<String>,
    ) -> u32 {
        self.debugger.add_watchpoint(addr, len, mode, condition)
    }

    pub fn remove_breakpoint(&mut self, id: u32) -> bool {
        self.debugger.remove(id)
    }

    pub fn set_breakpoint_enabled(&mut self, id: u32, enabled: bool) -> bool {
        self.debugger.set_enabled(id, enabled)
    }

    #[must_use]
    pub fn breakpoints(&self) -> &[crate::Breakpoint] {
        self.debugger.breakpoints()
    }

    #[must_use]
    pub fn watchpoints(&self) -> &[crate::Watchpoint] {
        self.debugger.watchpoints()
    }

    // -----------------------------------------------------------------
    // Execution
    // -----------------------------------------------------------------

    fn runnable(&self) -> Option<StopReason> {
        match self.state {
            VmState::Ready | VmState::Paused | VmState::Running => None,
            VmState::Halted => Some(StopReason::Halted { code: self.exit_code }),
            VmState::Error => Some(StopReason::Error(self.fault_report.as_ref().map_or(
                VmError::BadState { state: VmState::Error },
                |r| r.error.clone(),
            ))),
            VmState::Idle => {
                Some(StopReason::Error(VmError::BadState { state: VmState::Idle }))
            }
        }
    }

    fn enter_error(&mut self, error: VmError) -> StopReason {
        self.state = VmState::Error;
        self.fault_report = Some(self.build_report(error.clone()));
        StopReason::Error(error)
    }

    fn build_report(&self, error: VmError) -> FaultReport {
        let pc = self.cpu.regs.pc();
        let nearest_symbol = self
            .symbols()
            .and_then(|t| t.nearest(pc))
            .map(|(name, offset)| (name.to_string(), offset));
        let recent = self
            .recent
            .iter()
            .map(|&(addr, word)| {
                let text = decode(word)
                    .map_or_else(|| format!(".word 0x{word:08X}"), |i| i.disasm(addr));
                (addr, word, text)
            })
            .collect();
        let sp = self.cpu.regs.sp();
        let stack_top = (0..REPORT_STACK_WORDS)
            .map_while(|i| self.mem.peek_word(sp.wrapping_add(i * 4)))
            .collect();
        FaultReport {
            error,
            pc,
            nearest_symbol,
            recent,
            registers: self.registers(),
            stack_top,
        }
    }

    /// One instruction, shared by every policy. Does not consult
    /// breakpoints; callers that honor them do so before calling.
    fn step_once(&mut self, cancelled: bool) -> Option<StopReason> {
        let pc = self.cpu.regs.pc();
        if let Some(word) = self.mem.peek_word(pc) {
            if self.recent.len() == RECENT_DEPTH {
                self.recent.pop_front();
            }
            self.recent.push_back((pc, word));
        }

        let event = match self.cpu.step(&mut self.mem) {
            Ok(event) => event,
            Err(fault) => return Some(self.enter_error(VmError::Fault(fault))),
        };

        if let StepEvent::Swi { imm } = event {
            match self.syscalls.dispatch(&mut self.cpu, &mut self.mem, imm, cancelled) {
                SysOutcome::Continue => {}
                SysOutcome::Exit(code) => {
                    self.state = VmState::Halted;
                    self.exit_code = code;
                    let _ = self.mem.take_trace();
                    return Some(StopReason::Halted { code });
                }
                SysOutcome::Pause => {
                    self.state = VmState::Paused;
                    let _ = self.mem.take_trace();
                    return Some(StopReason::Breakpoint { id: 0, addr: pc });
                }
                SysOutcome::Error(error) => return Some(self.enter_error(error)),
            }
        }

        let trace = self.mem.take_trace();
        let peek = |addr: u32| self.mem.peek_word(addr);
        let ctx = MachineContext {
            cpu: &self.cpu,
            peek: &peek,
            symbols: self.program.as_ref().map(|p| &p.symbols),
        };
        if let Some(hit) = self.debugger.check_watchpoints(&trace, &ctx) {
            self.state = VmState::Paused;
            return Some(StopReason::Watchpoint { id: hit.id, addr: hit.addr });
        }
        None
    }

    /// Execute exactly one instruction regardless of breakpoints.
    pub fn step(&mut self) -> StopReason {
        if let Some(blocked) = self.runnable() {
            return blocked;
        }
        self.resume_skip = false;
        let reason = self.step_once(false).unwrap_or(StopReason::Step);
        if matches!(reason, StopReason::Step) {
            self.state = VmState::Paused;
        }
        reason
    }

    /// Run up to `max_steps` instructions, honoring breakpoints, the
    /// budget and the cancellation flag. Used by sessions between yield
    /// points and by [`Vm::run`] directly.
    fn run_chunk(&mut self, max_steps: u32, cancel: Option<&AtomicBool>) -> Chunk {
        for _ in 0..max_steps {
            let cancelled = cancel.is_some_and(|c| c.load(Ordering::Relaxed));
            if cancelled {
                self.state = VmState::Paused;
                return Chunk::Stopped(StopReason::Cancelled);
            }
            if self.run_used >= self.config.max_cycles {
                return Chunk::Stopped(
                    self.enter_error(VmError::Fault(Fault::BudgetExceeded {
                        limit: self.config.max_cycles,
                    })),
                );
            }

            let pc = self.cpu.regs.pc();
            if self.resume_skip {
                self.resume_skip = false;
            } else {
                let peek = |addr: u32| self.mem.peek_word(addr);
                let ctx = MachineContext {
                    cpu: &self.cpu,
                    peek: &peek,
                    symbols: self.program.as_ref().map(|p| &p.symbols),
                };
                if let Some(hit) = self.debugger.check_breakpoint(pc, &ctx) {
                    self.state = VmState::Paused;
                    self.resume_skip = true;
                    return Chunk::Stopped(StopReason::Breakpoint { id: hit.id, addr: hit.addr });
                }
            }

            self.run_used += 1;
            if let Some(reason) = self.step_once(false) {
                return Chunk::Stopped(reason);
            }
        }
        Chunk::More
    }

    /// Run under a policy until a stop condition.
    pub fn run(&mut self, policy: RunPolicy) -> StopReason {
        if let Some(early) = self.prepare_policy(policy) {
            return early;
        }
        self.state = VmState::Running;
        self.run_used = 0;
        loop {
            match self.run_chunk(self.config.steps_before_yield, None) {
                Chunk::Stopped(reason) => {
                    self.debugger.clear_temporaries();
                    return reason;
                }
                Chunk::More => {}
            }
        }
    }

    /// Session entry point: one cooperative chunk. Returns `None` while
    /// more work remains.
    pub(crate) fn run_session_chunk(&mut self, cancel: &AtomicBool) -> Option<StopReason> {
        if self.state != VmState::Running {
            if let Some(blocked) = self.runnable() {
                return Some(blocked);
            }
            self.state = VmState::Running;
            self.run_used = 0;
        }
        match self.run_chunk(self.config.steps_before_yield, Some(cancel)) {
            Chunk::Stopped(reason) => {
                self.debugger.clear_temporaries();
                Some(reason)
            }
            Chunk::More => None,
        }
    }

    /// Prepare a session run under a policy (temporary breakpoints).
    pub(crate) fn prepare_policy(&mut self, policy: RunPolicy) -> Option<StopReason> {
        if let Some(blocked) = self.runnable() {
            return Some(blocked);
        }
        match policy {
            RunPolicy::Continue => None,
            RunPolicy::StepOver => {
                let pc = self.cpu.regs.pc();
                let is_call = self
                    .mem
                    .peek_word(pc)
                    .and_then(decode)
                    .is_some_and(|i| matches!(i, cpu_arm2::Instruction::Branch(b) if b.link));
                if is_call {
                    self.debugger.add_breakpoint(pc.wrapping_add(4), None, true);
                    None
                } else {
                    Some(self.step())
                }
            }
            RunPolicy::Finish => {
                let lr = self.cpu.regs.read(LR);
                self.debugger.add_breakpoint(lr, None, true);
                None
            }
        }
    }
}
