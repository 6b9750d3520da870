//! Commit events logged by a core at each retire, consumed by the trace
//! viewer and the differential tester.

use crate::word::Word;
use std::fmt;

/// The kind of a commit event. The meaning of the two value fields of an [`Event`] depends on
/// this tag.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum EventKind {
    /// Instruction issued. `val1`: raw instruction, `val2`: 0.
    Issue,
    /// Register written. `val1`: rd index, `val2`: value written.
    RegWrite,
    /// Memory load. `val1`: address, `val2`: zero-extended loaded value.
    Load,
    /// Memory store. `val1`: address, `val2`: zero-truncated stored value.
    Store,
    /// Function call. `val1`: target PC, `val2`: stack pointer.
    Call,
    /// Function return. `val1`: target PC, `val2`: stack pointer.
    CallRet,
    /// Trap delivered. `val1`: cause, `val2`: tval.
    Trap,
    /// Trap return (`mret`/`sret`). `val1`: target PC, `val2`: 0.
    TrapRet,
    /// Differential-test mismatch. `val1`: offending event kind, `val2`: raw instruction at the
    /// current PC.
    DiffError,
}

impl EventKind {
    /// Numeric tag recorded in the `val1` field of a [`DiffError`](EventKind::DiffError)
    /// event.
    pub fn code(self) -> u64 {
        match self {
            EventKind::Issue => 0,
            EventKind::RegWrite => 1,
            EventKind::Load => 2,
            EventKind::Store => 3,
            EventKind::Call => 4,
            EventKind::CallRet => 5,
            EventKind::Trap => 6,
            EventKind::TrapRet => 7,
            EventKind::DiffError => 8,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Issue => "issue",
            EventKind::RegWrite => "reg_write",
            EventKind::Load => "load",
            EventKind::Store => "store",
            EventKind::Call => "call",
            EventKind::CallRet => "call_ret",
            EventKind::Trap => "trap",
            EventKind::TrapRet => "trap_ret",
            EventKind::DiffError => "diff_error",
        }
    }

    /// Field labels used when rendering an event for the trace viewer.
    fn labels(self) -> (&'static str, &'static str) {
        match self {
            EventKind::Issue => ("instr", "-"),
            EventKind::RegWrite => ("rd_addr", "rd_data"),
            EventKind::Load | EventKind::Store => ("addr", "data"),
            EventKind::Call | EventKind::CallRet => ("target", "sp"),
            EventKind::Trap => ("cause", "tval"),
            EventKind::TrapRet => ("target", "-"),
            EventKind::DiffError => ("err_type", "instr"),
        }
    }
}

/// A single entry in a core's event log.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Event<W> {
    pub kind: EventKind,
    /// Program counter of the instruction that produced the event.
    pub pc: W,
    pub val1: W,
    pub val2: W,
}

impl<W: Word> fmt::Display for Event<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let digits = (W::BITS / 4) as usize;
        let (label1, label2) = self.kind.labels();
        write!(
            f,
            "{:<10} pc:0x{:0digits$x} {:<8}:0x{:0digits$x} {:<8}:0x{:0digits$x}",
            self.kind.as_str(),
            self.pc,
            label1,
            self.val1,
            label2,
            self.val2,
        )
    }
}
