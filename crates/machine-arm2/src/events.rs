//! Execution events published to session subscribers in program order.

use crate::machine::VmState;

/// One event on a session's stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    StateChange { state: VmState },
    /// Guest output bytes, in write order.
    Output { bytes: Vec<u8> },
    /// Debug-channel text (DEBUG_PRINT, register/memory dumps).
    Debug { text: String },
    BreakpointHit { id: u32, addr: u32 },
    WatchpointHit { id: u32, addr: u32 },
    ProgramHalted { code: u32 },
    Error { message: String },
}
