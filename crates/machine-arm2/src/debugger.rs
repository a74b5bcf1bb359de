//! Breakpoints and watchpoints.
//!
//! Hit decisions are made in one place: lookup, condition evaluation,
//! hit counting and temporary deletion happen inside a single call that
//! returns the decision to the executor, so no second lookup can race
//! with table mutation.

use cpu_arm2::{Access, AccessKind};

use crate::expr::{evaluate, EvalContext};

/// A code breakpoint.
#[derive(Debug, Clone)]
pub struct Breakpoint {
    pub id: u32,
    pub addr: u32,
    pub enabled: bool,
    pub hits: u64,
    /// Condition expression; the breakpoint fires only when it is nonzero.
    pub condition: Option<String>,
    /// Deleted automatically on first hit (step-over / finish internals).
    pub temporary: bool,
}

/// Which accesses a watchpoint observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchMode {
    Read,
    Write,
    Access,
}

impl WatchMode {
    fn matches(self, kind: AccessKind) -> bool {
        match self {
            Self::Read => kind == AccessKind::Read,
            Self::Write => kind == AccessKind::Write,
            Self::Access => true,
        }
    }
}

/// A data watchpoint over an address range.
#[derive(Debug, Clone)]
pub struct Watchpoint {
    pub id: u32,
    pub addr: u32,
    pub len: u32,
    pub mode: WatchMode,
    pub enabled: bool,
    pub hits: u64,
    pub condition: Option<String>,
}

/// One line of disassembly for the facade.
#[derive(Debug, Clone)]
pub struct DisasmLine {
    pub addr: u32,
    pub word: u32,
    pub text: String,
    /// Nearest symbol at or below the address, with offset.
    pub symbol: Option<(String, u32)>,
}

/// The breakpoint decision handed back to the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BreakHit {
    pub id: u32,
    pub addr: u32,
}

/// Breakpoint and watchpoint tables.
///
/// A small vector suffices: real debugging sessions hold a handful of
/// entries, and the executor consults them once per step.
#[derive(Debug, Default)]
pub struct Debugger {
    breakpoints: Vec<Breakpoint>,
    watchpoints: Vec<Watchpoint>,
    next_id: u32,
}

impl Debugger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_breakpoint(
        &mut self,
        addr: u32,
        condition: Option<String>,
        temporary: bool,
    ) -> u32 {
        self.next_id += 1;
        let id = self.next_id;
        self.breakpoints.push(Breakpoint {
            id,
            addr,
            enabled: true,
            hits: 0,
            condition,
            temporary,
        });
        id
    }

    pub fn add_watchpoint(
        &mut self,
        addr: u32,
        len: u32,
        mode: WatchMode,
        condition: Option<String>,
    ) -> u32 {
        self.next_id += 1;
        let id = self.next_id;
        self.watchpoints.push(Watchpoint {
            id,
            addr,
            len: len.max(1),
            mode,
            enabled: true,
            hits: 0,
            condition,
        });
        id
    }

    /// Remove by id (either table). Returns whether anything was removed.
    pub fn remove(&mut self, id: u32) -> bool {
        let before = self.breakpoints.len() + self.watchpoints.len();
        self.breakpoints.retain(|b| b.id != id);
        self.watchpoints.retain(|w| w.id != id);
        before != self.breakpoints.len() + self.watchpoints.len()
    }

    /// Remove every temporary breakpoint (run teardown).
    pub fn clear_temporaries(&mut self) {
        self.breakpoints.retain(|b| !b.temporary);
    }

    pub fn set_enabled(&mut self, id: u32, enabled: bool) -> bool {
        if let Some(b) = self.breakpoints.iter_mut().find(|b| b.id == id) {
            b.enabled = enabled;
            return true;
        }
        if let Some(w) = self.watchpoints.iter_mut().find(|w| w.id == id) {
            w.enabled = enabled;
            return true;
        }
        false
    }

    pub fn breakpoints(&self) -> &[Breakpoint] {
        &self.breakpoints
    }

    pub fn watchpoints(&self) -> &[Watchpoint] {
        &self.watchpoints
    }

    /// Decide whether execution at `pc` hits a breakpoint. Hit counting
    /// and temporary deletion are part of the same decision; a false
    /// condition counts as no hit.
    pub(crate) fn check_breakpoint(
        &mut self,
        pc: u32,
        ctx: &dyn EvalContext,
    ) -> Option<BreakHit> {
        let idx = self
            .breakpoints
            .iter()
            .position(|b| b.enabled && b.addr == pc)?;
        if let Some(cond) = &self.breakpoints[idx].condition {
            // An unevaluable condition fires the breakpoint: stopping is
            // the safe direction for a debugging aid.
            if evaluate(cond, ctx).is_ok_and(|v| v == 0) {
                return None;
            }
        }
        let b = &mut self.breakpoints[idx];
        b.hits += 1;
        let hit = BreakHit { id: b.id, addr: b.addr };
        if b.temporary {
            self.breakpoints.swap_remove(idx);
        }
        Some(hit)
    }

    /// Match a step's memory accesses against the watchpoint table.
    pub(crate) fn check_watchpoints(
        &mut self,
        accesses: &[Access],
        ctx: &dyn EvalContext,
    ) -> Option<BreakHit> {
        for access in accesses {
            let end = access.addr.wrapping_add(u32::from(access.size));
            let idx = self.watchpoints.iter().position(|w| {
                w.enabled
                    && w.mode.matches(access.kind)
                    && access.addr < w.addr.wrapping_add(w.len)
                    && end > w.addr
            });
            if let Some(idx) = idx {
                if let Some(cond) = &self.watchpoints[idx].condition {
                    if evaluate(cond, ctx).is_ok_and(|v| v == 0) {
                        continue;
                    }
                }
                let w = &mut self.watchpoints[idx];
                w.hits += 1;
                return Some(BreakHit { id: w.id, addr: access.addr });
            }
        }
        None
    }
}
