//! ARM2 virtual machine.
//!
//! Ties the `cpu-arm2` core and the `asm-arm2` assembler into a debuggable
//! sandboxed machine: program loading, the software-interrupt syscall
//! layer with host I/O and a filesystem sandbox, breakpoints and
//! watchpoints, fault reports, and thread-safe sessions for service
//! facades.

mod config;
mod debugger;
mod events;
mod expr;
mod machine;
mod session;
mod syscall;

pub use config::{ConfigError, Endianness, VmConfig};
pub use debugger::{Breakpoint, DisasmLine, Watchpoint, WatchMode};
pub use events::Event;
pub use expr::{evaluate, EvalContext};
pub use machine::{
    FaultReport, LoadError, RegisterState, RunPolicy, StopReason, Vm, VmError, VmState,
};
pub use session::{Session, SessionManager};
pub use syscall::{BufferIo, HostIo, SharedIo, StdIo};
