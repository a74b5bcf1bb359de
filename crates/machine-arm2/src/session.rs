//! Sessions: thread-safe VM ownership for service facades.
//!
//! Each session owns its VM behind a reader-writer lock, a cancellation
//! flag and an ordered event queue. Long runs execute in chunks of
//! `stepsBeforeYield` instructions; the write lock is released between
//! chunks so readers (register and memory inspection) interleave with a
//! long `continue`.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use asm_arm2::FsProvider;

use crate::config::VmConfig;
use crate::debugger::WatchMode;
use crate::events::Event;
use crate::machine::{
    FaultReport, LoadError, RegisterState, RunPolicy, StopReason, Vm, VmState,
};
use crate::syscall::HostIo;

/// Per-request caps on facade reads.
const MAX_MEMORY_READ: u32 = 1024 * 1024;
const MAX_DISASM: u32 = 1000;
/// Queue bound; the oldest events fall off first.
const MAX_EVENTS: usize = 4096;

type EventQueue = Arc<Mutex<VecDeque<Event>>>;

/// Host I/O that publishes guest output as session events.
struct EventIo {
    events: EventQueue,
}

fn push_event(events: &EventQueue, event: Event) {
    let mut queue = events.lock().expect("event lock");
    if queue.len() >= MAX_EVENTS {
        queue.pop_front();
    }
    queue.push_back(event);
}

impl HostIo for EventIo {
    fn write_output(&mut self, bytes: &[u8]) {
        push_event(&self.events, Event::Output { bytes: bytes.to_vec() });
    }
    fn write_debug(&mut self, text: &str) {
        push_event(&self.events, Event::Debug { text: text.to_string() });
    }
}

/// One debugging session over one VM.
pub struct Session {
    vm: Arc<RwLock<Vm>>,
    cancel: Arc<AtomicBool>,
    events: EventQueue,
}

impl Session {
    /// Create a session; guest output flows into the event queue.
    ///
    /// # Errors
    ///
    /// Propagates configuration validation failures.
    pub fn new(config: VmConfig) -> Result<Self, crate::ConfigError> {
        let events: EventQueue = Arc::default();
        let io = EventIo { events: Arc::clone(&events) };
        let vm = Vm::new(config, Box::new(io))?;
        Ok(Self {
            vm: Arc::new(RwLock::new(vm)),
            cancel: Arc::new(AtomicBool::new(false)),
            events,
        })
    }

    fn publish_state(&self, state: VmState) {
        push_event(&self.events, Event::StateChange { state });
    }

    fn publish_stop(&self, reason: &StopReason) {
        match reason {
            StopReason::Breakpoint { id, addr } => {
                push_event(&self.events, Event::BreakpointHit { id: *id, addr: *addr });
            }
            StopReason::Watchpoint { id, addr } => {
                push_event(&self.events, Event::WatchpointHit { id: *id, addr: *addr });
            }
            StopReason::Halted { code } => {
                push_event(&self.events, Event::ProgramHalted { code: *code });
            }
            StopReason::Error(error) => {
                push_event(&self.events, Event::Error { message: error.to_string() });
            }
            StopReason::Step | StopReason::Cancelled => {}
        }
    }

    /// Load program source. Include resolution uses the filesystem
    /// relative to `name`.
    ///
    /// # Errors
    ///
    /// Returns the assembly diagnostics or the layout error.
    pub fn load_source(&self, source: &str, name: &str) -> Result<(), LoadError> {
        let mut vm = self.vm.write().expect("vm lock");
        let result = vm.load_source(source, name, &FsProvider);
        if result.is_ok() {
            self.publish_state(vm.state());
        }
        result
    }

    /// Run until a stop condition, yielding the write lock between
    /// cooperative chunks.
    pub fn run(&self, policy: RunPolicy) -> StopReason {
        self.cancel.store(false, Ordering::Relaxed);
        {
            let mut vm = self.vm.write().expect("vm lock");
            if let Some(early) = vm.prepare_policy(policy) {
                self.publish_stop(&early);
                self.publish_state(vm.state());
                return early;
            }
            self.publish_state(VmState::Running);
        }
        loop {
            // Lock per chunk: inspection requests interleave here.
            let outcome = {
                let mut vm = self.vm.write().expect("vm lock");
                vm.run_session_chunk(&self.cancel)
            };
            if let Some(reason) = outcome {
                let state = self.vm.read().expect("vm lock").state();
                self.publish_stop(&reason);
                self.publish_state(state);
                return reason;
            }
        }
    }

    /// Request cancellation of a run in progress.
    pub fn stop(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    /// Execute one instruction.
    pub fn step(&self) -> StopReason {
        let mut vm = self.vm.write().expect("vm lock");
        let reason = vm.step();
        self.publish_stop(&reason);
        self.publish_state(vm.state());
        reason
    }

    /// Reset to `Ready`, preserving the loaded image.
    pub fn reset(&self) {
        let mut vm = self.vm.write().expect("vm lock");
        vm.reset();
        self.publish_state(vm.state());
    }

    #[must_use]
    pub fn state(&self) -> VmState {
        self.vm.read().expect("vm lock").state()
    }

    #[must_use]
    pub fn registers(&self) -> RegisterState {
        self.vm.read().expect("vm lock").registers()
    }

    pub fn write_register(&self, index: usize, value: u32) {
        self.vm.write().expect("vm lock").write_register(index, value);
    }

    /// Read memory, capped at 1 MiB per request.
    #[must_use]
    pub fn read_memory(&self, addr: u32, len: u32) -> Vec<u8> {
        self.vm.read().expect("vm lock").read_memory(addr, len.min(MAX_MEMORY_READ))
    }

    /// Checked guest-memory write.
    ///
    /// # Errors
    ///
    /// Propagates the memory fault.
    pub fn write_memory(&self, addr: u32, bytes: &[u8]) -> Result<(), cpu_arm2::Fault> {
        self.vm.write().expect("vm lock").write_memory(addr, bytes)
    }

    /// Disassemble, capped at 1000 instructions per request.
    #[must_use]
    pub fn disassemble(&self, addr: u32, count: u32) -> Vec<crate::DisasmLine> {
        self.vm.read().expect("vm lock").disassemble(addr, count.min(MAX_DISASM))
    }

    /// Evaluate a debugger expression.
    ///
    /// # Errors
    ///
    /// Returns the evaluator's message.
    pub fn evaluate(&self, text: &str) -> Result<i64, String> {
        self.vm.read().expect("vm lock").evaluate(text)
    }

    pub fn add_breakpoint(&self, addr: u32, condition: Option<String>) -> u32 {
        self.vm.write().expect("vm lock").add_breakpoint(addr, condition)
    }

    pub fn add_watchpoint(
        &self,
        addr: u32,
        len: u32,
        mode: WatchMode,
        condition: Option<String>,
    ) -> u32 {
        self.vm.write().expect("vm lock").add_watchpoint(addr, len, mode, condition)
    }

    pub fn remove_breakpoint(&self, id: u32) -> bool {
        self.vm.write().expect("vm lock").remove_breakpoint(id)
    }

    pub fn set_breakpoint_enabled(&self, id: u32, enabled: bool) -> bool {
        self.vm.write().expect("vm lock").set_breakpoint_enabled(id, enabled)
    }

    #[must_use]
    pub fn breakpoints(&self) -> Vec<crate::Breakpoint> {
        self.vm.read().expect("vm lock").breakpoints().to_vec()
    }

    /// Queue stdin bytes (FIFO).
    pub fn send_input(&self, bytes: &[u8]) {
        self.vm.write().expect("vm lock").send_input(bytes);
    }

    /// Drain pending events in execution order.
    #[must_use]
    pub fn drain_events(&self) -> Vec<Event> {
        self.events.lock().expect("event lock").drain(..).collect()
    }

    #[must_use]
    pub fn fault_report(&self) -> Option<FaultReport> {
        self.vm.read().expect("vm lock").fault_report().cloned()
    }
}

/// Registry of live sessions for a multi-session facade.
#[derive(Default)]
pub struct SessionManager {
    sessions: Mutex<HashMap<u64, Arc<Session>>>,
    next_id: AtomicU64,
}

impl SessionManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a session and return its id.
    ///
    /// # Errors
    ///
    /// Propagates configuration validation failures.
    pub fn create(&self, config: VmConfig) -> Result<u64, crate::ConfigError> {
        let session = Arc::new(Session::new(config)?);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.sessions.lock().expect("sessions lock").insert(id, session);
        Ok(id)
    }

    #[must_use]
    pub fn get(&self, id: u64) -> Option<Arc<Session>> {
        self.sessions.lock().expect("sessions lock").get(&id).cloned()
    }

    /// Destroy a session. Returns whether it existed.
    pub fn destroy(&self, id: u64) -> bool {
        let session = self.sessions.lock().expect("sessions lock").remove(&id);
        if let Some(session) = &session {
            session.stop();
        }
        session.is_some()
    }

    #[must_use]
    pub fn ids(&self) -> Vec<u64> {
        self.sessions.lock().expect("sessions lock").keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hello_session() -> Arc<Session> {
        let manager = SessionManager::new();
        let id = manager.create(VmConfig::default()).expect("config");
        let session = manager.get(id).expect("session");
        session
            .load_source(
                "LDR R0, =msg\n\
                 SWI #2\n\
                 MOV R0, #0\n\
                 SWI #0\n\
                 .data\n\
                 msg: .asciz \"Hi\\n\"\n",
                "hello.s",
            )
            .expect("loads");
        session
    }

    #[test]
    fn run_to_halt_produces_output_events() {
        let session = hello_session();
        let reason = session.run(RunPolicy::Continue);
        assert_eq!(reason, StopReason::Halted { code: 0 });
        assert_eq!(session.state(), VmState::Halted);
        let events = session.drain_events();
        let output: Vec<u8> = events
            .iter()
            .filter_map(|e| match e {
                Event::Output { bytes } => Some(bytes.clone()),
                _ => None,
            })
            .flatten()
            .collect();
        assert_eq!(output, b"Hi\n");
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::ProgramHalted { code: 0 })));
    }

    #[test]
    fn sessions_are_isolated() {
        let a = hello_session();
        let b = hello_session();
        a.send_input(b"only for a");
        let _ = a.run(RunPolicy::Continue);
        assert_eq!(b.state(), VmState::Ready, "b never ran");
        let _ = b.run(RunPolicy::Continue);
        assert_eq!(b.state(), VmState::Halted);
    }

    #[test]
    fn destroy_removes_session() {
        let manager = SessionManager::new();
        let id = manager.create(VmConfig::default()).expect("config");
        assert!(manager.get(id).is_some());
        assert!(manager.destroy(id));
        assert!(manager.get(id).is_none());
        assert!(!manager.destroy(id));
    }
}
