//! A RISC-V instruction-set simulator library built around a staged
//! fetch→decode→execute→retire pipeline, with first-class support for
//! differential testing of two cores in lockstep.
//!
//! The crate is split along the RISC-V privileged architecture's own seam:
//! [`user_core`] interprets unprivileged instructions without any access to
//! CSRs or memory buses, while [`privilege`] performs every privileged
//! effect (memory access, CSR operations, traps, interrupts). The
//! [`system_cpu`] façade drives both through the [`op::Op`] record and logs
//! commit events to a [`ring_buffer::RingBuffer`], which [`difftest`]
//! cross-checks between a device-under-test and a reference core.

#[macro_use]
extern crate static_assertions;

use std::cmp::Ordering;
use std::fmt;

pub mod cpu;
pub mod debugger;
pub mod decode;
pub mod decode_cache;
pub mod difftest;
pub mod event;
pub mod io;
pub mod memory;
pub mod op;
pub mod privilege;
pub mod ring_buffer;
pub mod system_cpu;
pub mod user_core;
pub mod word;

pub use word::{Width, Word};

/// List of defined privilege levels for RISC-V.
///
/// A privilege level is always referenced by two bits, so only `0`, `1`, `2`, and `3` are valid
/// privilege levels. However, only levels `0`, `1`, and `3` are defined; level `2` is considered
/// *reserved* for now.
///
/// > The machine level has the highest privileges and is the only mandatory privilege level for a
/// > RISC-V hardware platform. Code run in machine-mode (M-mode) is usually inherently trusted, as
/// > it has low-level access to the machine implementation. M-mode can be used to manage secure
/// > execution environments on RISC-V. User-mode (U-mode) and supervisor-mode (S-mode) are intended
/// > for conventional application and operating system usage respectively.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PrivilegeLevel {
    /// User/application (abbreviated `U`) is the lowest privilege level.
    User = 0,
    /// Supervisor (abbreviated `S`) is an intermediate privilege level,
    /// that allows protection from the OS.
    Supervisor = 1,
    // Level 2 is reserved
    /// Machine (abbreviated `M`) is the highest privilege level.
    /// It is the only mandatory privilege level for a RISC-V hardware platform.
    Machine = 3,
}

impl PrivilegeLevel {
    /// Convert a 2-bit value into a [`PrivilegeLevel`].
    ///
    /// The reserved encoding `0b10` is coerced to `Machine`, matching the WARL treatment of the
    /// MPP field: illegal values are never stored.
    pub fn from_u2_coerced(value_u2: u8) -> Self {
        match value_u2 & 0b11 {
            0 => Self::User,
            1 => Self::Supervisor,
            _ => Self::Machine,
        }
    }
}

impl PartialOrd for PrivilegeLevel {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PrivilegeLevel {
    fn cmp(&self, other: &Self) -> Ordering {
        (*self as u8).cmp(&(*other as u8))
    }
}

impl fmt::Display for PrivilegeLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match *self {
            PrivilegeLevel::User => "U",
            PrivilegeLevel::Supervisor => "S",
            PrivilegeLevel::Machine => "M",
        })
    }
}

/// List of the synchronous exceptions this simulator can raise.
///
/// The discriminant of each variant is its exception code as stored in the mcause/scause
/// registers (with the interrupt bit clear).
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Exception {
    /// Instruction address is not on a four-byte aligned boundary in memory.
    InstructionAddressMisaligned = 0,
    InstructionAccessFault = 1,
    /// Generic exception used to communicate one of many possible scenarios:
    ///
    /// - Attempt to decode a reserved or unsupported instruction.
    /// - Attempt to access a non-existent CSR.
    /// - Attempt to access a CSR without the appropriate privilege level.
    /// - Attempt to execute `mret`/`sret` from an insufficient privilege level.
    IllegalInstruction = 2,
    /// `ebreak` was executed. Note that the system core treats this as a halt request rather
    /// than a deliverable trap.
    Breakpoint = 3,
    LoadAddressMisaligned = 4,
    LoadAccessFault = 5,
    StoreAddressMisaligned = 6,
    StoreAccessFault = 7,
    EnvironmentCallFromUMode = 8,
    EnvironmentCallFromSMode = 9,
    EnvironmentCallFromMMode = 11,
    InstructionPageFault = 12,
    LoadPageFault = 13,
    StorePageFault = 15,
}

impl Exception {
    /// Returns the exception code (cause) for this exception.
    pub fn code(self) -> u64 {
        self as u64
    }
}

/// List of the standard interrupt sources.
///
/// The discriminant of each variant is its interrupt code as stored in the mcause/scause
/// registers (with the interrupt bit set).
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Interrupt {
    SupervisorSoftware = 1,
    MachineSoftware = 3,
    SupervisorTimer = 5,
    MachineTimer = 7,
    SupervisorExternal = 9,
    MachineExternal = 11,
}

impl Interrupt {
    /// Returns the exception code (cause) for this interrupt, without the interrupt bit.
    pub fn code(self) -> u64 {
        self as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_privilege_ordering() {
        assert!(PrivilegeLevel::User < PrivilegeLevel::Supervisor);
        assert!(PrivilegeLevel::Supervisor < PrivilegeLevel::Machine);
    }

    #[test]
    fn test_privilege_coercion() {
        assert_eq!(PrivilegeLevel::from_u2_coerced(0), PrivilegeLevel::User);
        assert_eq!(
            PrivilegeLevel::from_u2_coerced(1),
            PrivilegeLevel::Supervisor
        );
        // The reserved level 2 must never be materialized.
        assert_eq!(PrivilegeLevel::from_u2_coerced(2), PrivilegeLevel::Machine);
        assert_eq!(PrivilegeLevel::from_u2_coerced(3), PrivilegeLevel::Machine);
    }

    #[test]
    fn test_exception_codes() {
        assert_eq!(Exception::IllegalInstruction.code(), 2);
        assert_eq!(Exception::Breakpoint.code(), 3);
        assert_eq!(Exception::EnvironmentCallFromMMode.code(), 11);
        assert_eq!(Exception::StorePageFault.code(), 15);
    }
}
