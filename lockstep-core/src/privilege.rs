//! The privilege module: CSR file, trap and interrupt delivery, privilege
//! transitions, and all memory access on behalf of the core.
//!
//! The module has no knowledge of the decoder; it consumes and produces
//! [`Op`] records. Memory accesses are funneled through the virtual-address
//! functions, whose translation hook currently returns identity — the hook
//! is retained because Sv32/Sv39 page-table walks are planned extensions,
//! so translation must not be inlined at the call sites.

use crate::io::IoAgent;
use crate::memory::SharedMemory;
use crate::op::{Op, Stage, SysOp};
use crate::word::{Width, Word};
use crate::{Exception, PrivilegeLevel};
use bitvec::field::BitField;
use bitvec::order::Lsb0;
use bitvec::view::BitView;
use log::trace;
use std::fmt;

/// Addresses of the implemented CSRs.
pub mod csr {
    /// Supervisor status register, a restricted view of mstatus.
    pub const SSTATUS: u16 = 0x100;
    /// Supervisor interrupt-enable register.
    pub const SIE: u16 = 0x104;
    /// Supervisor trap handler base address.
    pub const STVEC: u16 = 0x105;
    /// Supervisor scratch register.
    pub const SSCRATCH: u16 = 0x140;
    /// Supervisor exception program counter.
    pub const SEPC: u16 = 0x141;
    /// Supervisor trap cause register.
    pub const SCAUSE: u16 = 0x142;
    /// Supervisor bad address or instruction.
    pub const STVAL: u16 = 0x143;
    /// Supervisor interrupt-pending register.
    pub const SIP: u16 = 0x144;
    /// Machine status register.
    pub const MSTATUS: u16 = 0x300;
    /// ISA and extensions register. Read-only in this implementation.
    pub const MISA: u16 = 0x301;
    /// Machine exception delegation register.
    pub const MEDELEG: u16 = 0x302;
    /// Machine interrupt delegation register.
    pub const MIDELEG: u16 = 0x303;
    /// Machine interrupt-enable register.
    pub const MIE: u16 = 0x304;
    /// Machine trap handler base address; low bit selects vectored delivery.
    pub const MTVEC: u16 = 0x305;
    /// Machine scratch register.
    pub const MSCRATCH: u16 = 0x340;
    /// Machine exception program counter. The low bit always reads zero.
    pub const MEPC: u16 = 0x341;
    /// Machine trap cause register.
    pub const MCAUSE: u16 = 0x342;
    /// Machine bad address or instruction.
    pub const MTVAL: u16 = 0x343;
    /// Machine interrupt-pending register.
    pub const MIP: u16 = 0x344;
}

/// Bit indices of the mstatus fields this implementation supports.
mod idx {
    pub const SIE: usize = 1;
    pub const MIE: usize = 3;
    pub const SPIE: usize = 5;
    pub const MPIE: usize = 7;
    pub const SPP: usize = 8;
    pub const MPP: usize = 11;
}

/// The structured fields behind mstatus/sstatus.
///
/// > The mstatus register keeps track of and controls the hart's current operating state.
/// > A restricted view of mstatus appears as the sstatus register in the S-level ISA.
///
/// Reading either register packs the fields into the architectural bit layout; writing
/// re-packs, with invalid MPP encodings coerced to M (the field is **WARL**).
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Status {
    pub mpp: PrivilegeLevel,
    pub spp: bool,
    pub mpie: bool,
    pub spie: bool,
    pub mie: bool,
    pub sie: bool,
}

impl Status {
    fn new() -> Self {
        Self {
            mpp: PrivilegeLevel::Machine,
            spp: false,
            mpie: false,
            spie: false,
            mie: false,
            sie: false,
        }
    }

    fn pack_mstatus(&self) -> u64 {
        let mut value = 0u64;
        let bits = value.view_bits_mut::<Lsb0>();
        bits.set(idx::SIE, self.sie);
        bits.set(idx::MIE, self.mie);
        bits.set(idx::SPIE, self.spie);
        bits.set(idx::MPIE, self.mpie);
        bits.set(idx::SPP, self.spp);
        bits[idx::MPP..idx::MPP + 2].store_le(self.mpp as u8);
        value
    }

    fn unpack_mstatus(&mut self, value: u64) {
        let bits = value.view_bits::<Lsb0>();
        self.sie = bits[idx::SIE];
        self.mie = bits[idx::MIE];
        self.spie = bits[idx::SPIE];
        self.mpie = bits[idx::MPIE];
        self.spp = bits[idx::SPP];
        self.mpp = PrivilegeLevel::from_u2_coerced(bits[idx::MPP..idx::MPP + 2].load_le::<u8>());
    }

    fn pack_sstatus(&self) -> u64 {
        let mut value = 0u64;
        let bits = value.view_bits_mut::<Lsb0>();
        bits.set(idx::SIE, self.sie);
        bits.set(idx::SPIE, self.spie);
        bits.set(idx::SPP, self.spp);
        value
    }

    fn unpack_sstatus(&mut self, value: u64) {
        let bits = value.view_bits::<Lsb0>();
        self.sie = bits[idx::SIE];
        self.spie = bits[idx::SPIE];
        self.spp = bits[idx::SPP];
    }
}

impl Default for Status {
    fn default() -> Self {
        Self::new()
    }
}

/// The privileged half of a core.
///
/// Owns the CSR cells, the current privilege level, handles to the instruction and data
/// memory views, and an optional MMIO agent used as a fallback when an access misses RAM.
pub struct PrivilegeModule<W: Word> {
    pub priv_level: PrivilegeLevel,
    status: Status,

    mepc: W,
    mtvec: W,
    mcause: W,
    mtval: W,
    mscratch: W,
    mie: W,
    mip: W,
    medeleg: W,
    mideleg: W,

    sepc: W,
    stvec: W,
    scause: W,
    stval: W,
    sscratch: W,
    sie: W,
    sip: W,

    instr_bus: SharedMemory<W>,
    data_bus: SharedMemory<W>,
    mmio: Option<Box<dyn IoAgent>>,
}

impl<W: Word> fmt::Debug for PrivilegeModule<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivilegeModule")
            .field("priv_level", &self.priv_level)
            .field("status", &self.status)
            .field("mepc", &self.mepc)
            .field("mcause", &self.mcause)
            .finish_non_exhaustive()
    }
}

impl<W: Word> PrivilegeModule<W> {
    pub fn new(
        instr_bus: SharedMemory<W>,
        data_bus: SharedMemory<W>,
        mmio: Option<Box<dyn IoAgent>>,
    ) -> Self {
        Self {
            priv_level: PrivilegeLevel::Machine,
            status: Status::new(),
            mepc: W::ZERO,
            mtvec: W::ZERO,
            mcause: W::ZERO,
            mtval: W::ZERO,
            mscratch: W::ZERO,
            mie: W::ZERO,
            mip: W::ZERO,
            medeleg: W::ZERO,
            mideleg: W::ZERO,
            sepc: W::ZERO,
            stvec: W::ZERO,
            scause: W::ZERO,
            stval: W::ZERO,
            sscratch: W::ZERO,
            sie: W::ZERO,
            sip: W::ZERO,
            instr_bus,
            data_bus,
            mmio,
        }
    }

    /// Restores all privileged state to its reset values: M-mode, MPP=M, everything else
    /// zero. The bus handles are kept.
    pub fn reset(&mut self) {
        self.priv_level = PrivilegeLevel::Machine;
        self.status = Status::new();
        self.mepc = W::ZERO;
        self.mtvec = W::ZERO;
        self.mcause = W::ZERO;
        self.mtval = W::ZERO;
        self.mscratch = W::ZERO;
        self.mie = W::ZERO;
        self.mip = W::ZERO;
        self.medeleg = W::ZERO;
        self.mideleg = W::ZERO;
        self.sepc = W::ZERO;
        self.stvec = W::ZERO;
        self.scause = W::ZERO;
        self.stval = W::ZERO;
        self.sscratch = W::ZERO;
        self.sie = W::ZERO;
        self.sip = W::ZERO;
    }

    pub fn status(&self) -> &Status {
        &self.status
    }

    /// The MMIO agent, for per-cycle bookkeeping by the owning core.
    pub fn mmio_agent(&mut self) -> Option<&mut (dyn IoAgent + '_)> {
        match self.mmio.as_mut() {
            Some(agent) => Some(agent.as_mut()),
            None => None,
        }
    }

    /// Attaches or detaches the MMIO agent.
    pub fn set_mmio(&mut self, agent: Option<Box<dyn IoAgent>>) {
        self.mmio = agent;
    }

    /// Maps a virtual address to a physical address.
    ///
    /// Translation is the identity mapping for every privilege level until paged modes are
    /// implemented; callers must still go through this hook.
    pub fn vaddr_to_paddr(&self, vaddr: W) -> Option<W> {
        match self.priv_level {
            PrivilegeLevel::Machine => Some(vaddr),
            PrivilegeLevel::Supervisor => Some(vaddr),
            PrivilegeLevel::User => Some(vaddr),
        }
    }

    /// Fetches the instruction word at `op.pc` using physical addressing, for simulating
    /// processors without virtual memory.
    pub fn paddr_fetch(&self, op: &mut Op<W>) {
        self.fetch_at(op, op.pc, op.pc)
    }

    /// Fetches the instruction word at `op.pc`, translating the address first.
    pub fn vaddr_fetch(&self, op: &mut Op<W>) {
        match self.vaddr_to_paddr(op.pc) {
            Some(paddr) => self.fetch_at(op, op.pc, paddr),
            None => op.raise(Exception::InstructionPageFault, op.pc),
        }
    }

    fn fetch_at(&self, op: &mut Op<W>, vaddr: W, paddr: W) {
        // > The base RISC-V ISA has fixed-length 32-bit instructions that must be naturally
        // > aligned on 32-bit boundaries.
        //
        // Loads and stores carry no such check; misaligned data accesses are permitted.
        if paddr.to_u64() & 0b11 != 0 {
            return op.raise(Exception::InstructionAddressMisaligned, vaddr);
        }
        match self.instr_bus.borrow_mut().read(paddr, Width::Word) {
            Some(word) => {
                op.instr = word.to_u64() as u32;
                op.stage = Stage::Fetch;
            }
            None => op.raise(Exception::InstructionAccessFault, vaddr),
        }
    }

    /// Completes a staged load using physical addressing.
    pub fn paddr_load(&mut self, op: &mut Op<W>) {
        let Stage::Load {
            addr,
            width,
            sign_extend,
            rd,
        } = op.stage
        else {
            debug_assert!(false, "paddr_load requires a load record");
            return;
        };
        self.complete_load(op, addr, addr, width, sign_extend, rd);
    }

    /// Completes a staged load, translating the address first.
    pub fn vaddr_load(&mut self, op: &mut Op<W>) {
        let Stage::Load {
            addr,
            width,
            sign_extend,
            rd,
        } = op.stage
        else {
            debug_assert!(false, "vaddr_load requires a load record");
            return;
        };
        match self.vaddr_to_paddr(addr) {
            Some(paddr) => self.complete_load(op, addr, paddr, width, sign_extend, rd),
            None => op.raise(Exception::LoadPageFault, addr),
        }
    }

    fn complete_load(
        &mut self,
        op: &mut Op<W>,
        vaddr: W,
        paddr: W,
        width: Width,
        sign_extend: bool,
        rd: u8,
    ) {
        let mut data = self.data_bus.borrow_mut().read(paddr, width);
        // Fall back to MMIO if the address is outside RAM.
        if data.is_none() {
            if let Some(mmio) = self.mmio.as_mut() {
                data = mmio.read(paddr.to_u64(), width).map(W::from_u64);
            }
        }
        match data {
            Some(value) => {
                let value = if sign_extend {
                    value.sign_extend(width)
                } else {
                    value
                };
                op.stage = Stage::Retire { rd, value };
            }
            None => op.raise(Exception::LoadAccessFault, vaddr),
        }
    }

    /// Completes a staged store using physical addressing.
    pub fn paddr_store(&mut self, op: &mut Op<W>) {
        let Stage::Store { addr, width, data } = op.stage else {
            debug_assert!(false, "paddr_store requires a store record");
            return;
        };
        self.complete_store(op, addr, addr, width, data);
    }

    /// Completes a staged store, translating the address first.
    pub fn vaddr_store(&mut self, op: &mut Op<W>) {
        let Stage::Store { addr, width, data } = op.stage else {
            debug_assert!(false, "vaddr_store requires a store record");
            return;
        };
        match self.vaddr_to_paddr(addr) {
            Some(paddr) => self.complete_store(op, addr, paddr, width, data),
            None => op.raise(Exception::StorePageFault, addr),
        }
    }

    fn complete_store(&mut self, op: &mut Op<W>, vaddr: W, paddr: W, width: Width, data: W) {
        let mut success = self.data_bus.borrow_mut().write(paddr, width, data);
        if !success {
            if let Some(mmio) = self.mmio.as_mut() {
                success = mmio.write(paddr.to_u64(), width, data.to_u64());
            }
        }
        if success {
            op.stage = Stage::Retire {
                rd: 0,
                value: W::ZERO,
            };
        } else {
            op.raise(Exception::StoreAccessFault, vaddr);
        }
    }

    /// Performs a staged CSR operation.
    ///
    /// Read access requires the current privilege level to be at least the level encoded in
    /// address bits 9:8; writes additionally require the CSR not to be in the read-only
    /// quadrant (address bits 11:10 equal to `0b11`). Violations and unimplemented CSRs trap
    /// as illegal instructions. The destination register receives the pre-update value.
    pub fn csr_op(&mut self, op: &mut Op<W>) {
        let Stage::Csr(csr) = op.stage else {
            debug_assert!(false, "csr_op requires a csr record");
            return;
        };
        let instr = W::from_u64(op.instr as u64);

        let read_allowed = self.priv_level as u8 >= ((csr.addr >> 8) & 0x3) as u8;
        if csr.read && !read_allowed {
            return op.raise(Exception::IllegalInstruction, instr);
        }
        let modifies = csr.write || csr.set || csr.clear;
        let write_allowed = read_allowed && (csr.addr >> 10) != 0x3;
        if modifies && !write_allowed {
            return op.raise(Exception::IllegalInstruction, instr);
        }

        let Some(old) = self.csr_peek(csr.addr) else {
            return op.raise(Exception::IllegalInstruction, instr);
        };
        if modifies {
            let new = if csr.write {
                csr.value
            } else if csr.set {
                old | csr.value
            } else {
                old & !csr.value
            };
            self.csr_store(csr.addr, old, new);
        }
        op.stage = Stage::Retire {
            rd: csr.rd,
            value: old,
        };
    }

    /// Reads a CSR cell without access checks or side effects. `None` for unimplemented
    /// addresses.
    pub fn csr_peek(&self, addr: u16) -> Option<W> {
        Some(match addr {
            csr::MISA => Self::misa(),
            csr::MSTATUS => W::from_u64(self.status.pack_mstatus()),
            csr::SSTATUS => W::from_u64(self.status.pack_sstatus()),
            csr::MEDELEG => self.medeleg,
            csr::MIDELEG => self.mideleg,
            csr::MIE => self.mie,
            csr::MIP => self.mip,
            csr::MTVEC => self.mtvec,
            csr::MSCRATCH => self.mscratch,
            csr::MEPC => self.mepc,
            csr::MCAUSE => self.mcause,
            csr::MTVAL => self.mtval,
            csr::SIE => self.sie,
            csr::SIP => self.sip,
            csr::STVEC => self.stvec,
            csr::SSCRATCH => self.sscratch,
            csr::SEPC => self.sepc,
            csr::SCAUSE => self.scause,
            csr::STVAL => self.stval,
            _ => return None,
        })
    }

    /// Stores `new` into a CSR cell, preserving the current value of every bit outside the
    /// cell's writable mask. Must only be called for implemented addresses.
    fn csr_store(&mut self, addr: u16, old: W, new: W) {
        let mask = Self::writable_mask(addr);
        let effective = (old & !mask) | (new & mask);
        match addr {
            // misa is read-only; the write itself succeeds but changes nothing.
            csr::MISA => {}
            csr::MSTATUS => self.status.unpack_mstatus(effective.to_u64()),
            csr::SSTATUS => self.status.unpack_sstatus(effective.to_u64()),
            csr::MEDELEG => self.medeleg = effective,
            csr::MIDELEG => self.mideleg = effective,
            csr::MIE => self.mie = effective,
            csr::MIP => self.mip = effective,
            csr::MTVEC => self.mtvec = effective,
            csr::MSCRATCH => self.mscratch = effective,
            csr::MEPC => self.mepc = effective & !W::ONE,
            csr::MCAUSE => self.mcause = effective,
            csr::MTVAL => self.mtval = effective,
            csr::SIE => self.sie = effective,
            csr::SIP => self.sip = effective,
            csr::STVEC => self.stvec = effective,
            csr::SSCRATCH => self.sscratch = effective,
            csr::SEPC => self.sepc = effective & !W::ONE,
            csr::SCAUSE => self.scause = effective,
            csr::STVAL => self.stval = effective,
            _ => debug_assert!(false, "store to unimplemented CSR {addr:#05x}"),
        }
    }

    /// The bits of a CSR cell that instruction-level writes may change.
    fn writable_mask(addr: u16) -> W {
        match addr {
            csr::MISA => W::ZERO,
            csr::MIE | csr::MIP | csr::SIE | csr::SIP => W::from_u64(0xFFFF),
            _ => W::MAX,
        }
    }

    /// > The misa CSR is a WARL read-write register reporting the ISA supported by the hart.
    ///
    /// Reports MXL for the core's width and the I, M, S, and U extension bits.
    fn misa() -> W {
        if W::BITS == 64 {
            W::from_u64(2u64 << 62 | 0x0014_1100)
        } else {
            W::from_u64(0x4014_1100)
        }
    }

    /// Handles `ecall`, `mret`, and `sret`.
    pub fn sys_op(&mut self, op: &mut Op<W>) {
        let Stage::Sys(sys) = op.stage else {
            debug_assert!(false, "sys_op requires a sys record");
            return;
        };
        let instr = W::from_u64(op.instr as u64);
        match sys {
            SysOp::Ecall => {
                let cause = match self.priv_level {
                    PrivilegeLevel::User => Exception::EnvironmentCallFromUMode,
                    PrivilegeLevel::Supervisor => Exception::EnvironmentCallFromSMode,
                    PrivilegeLevel::Machine => Exception::EnvironmentCallFromMMode,
                };
                op.raise(cause, W::ZERO);
            }
            SysOp::Mret => {
                if self.priv_level != PrivilegeLevel::Machine {
                    return op.raise(Exception::IllegalInstruction, instr);
                }
                self.priv_level = self.status.mpp;
                self.status.mie = self.status.mpie;
                self.status.mpie = true;
                self.status.mpp = PrivilegeLevel::User;
                op.next_pc = self.mepc;
                op.stage = Stage::Retire {
                    rd: 0,
                    value: W::ZERO,
                };
            }
            SysOp::Sret => {
                if self.priv_level == PrivilegeLevel::User {
                    return op.raise(Exception::IllegalInstruction, instr);
                }
                self.priv_level = if self.status.spp {
                    PrivilegeLevel::Supervisor
                } else {
                    PrivilegeLevel::User
                };
                self.status.sie = self.status.spie;
                self.status.spie = true;
                self.status.spp = false;
                op.next_pc = self.sepc;
                op.stage = Stage::Retire {
                    rd: 0,
                    value: W::ZERO,
                };
            }
        }
    }

    /// Delivers a staged exception, leaving the record in a synthetic retire that redirects
    /// the PC to the handler.
    ///
    /// The target privilege is S when the exception's bit is set in medeleg and the trap did
    /// not occur in M-mode; otherwise M. Exception handlers are always entered at the vector
    /// base, never vectored, regardless of the tvec mode bit.
    pub fn handle_exception(&mut self, op: &mut Op<W>) {
        let Stage::Trap { cause, tval } = op.stage else {
            debug_assert!(false, "handle_exception requires a trap record");
            return;
        };
        let pc = op.pc;
        let code = (cause & !W::INTERRUPT_BIT).to_u64() as u32;

        let delegate = self.priv_level != PrivilegeLevel::Machine && self.medeleg.bit(code);
        let target = if delegate {
            PrivilegeLevel::Supervisor
        } else {
            PrivilegeLevel::Machine
        };

        let vector_base = match target {
            PrivilegeLevel::Supervisor => self.stvec & !W::from_u64(0b11),
            _ => self.mtvec & !W::from_u64(0b11),
        };

        match target {
            PrivilegeLevel::Supervisor => {
                self.scause = cause;
                self.stval = tval;
                self.sepc = pc;
                self.status.spp = self.priv_level == PrivilegeLevel::Supervisor;
                self.status.spie = self.status.sie;
                self.status.sie = false;
            }
            _ => {
                self.mcause = cause;
                self.mtval = tval;
                self.mepc = pc;
                self.status.mpp = self.priv_level;
                self.status.mpie = self.status.mie;
                self.status.mie = false;
            }
        }
        self.priv_level = target;

        op.next_pc = vector_base;
        op.stage = Stage::Retire {
            rd: 0,
            value: W::ZERO,
        };
    }

    /// Takes a pending-and-enabled interrupt, if any, after a retire has set `op.next_pc`.
    ///
    /// M-level interrupts are deliverable when `mie & mip` is non-empty and either MIE is set
    /// or the core runs below M. S-level interrupts are deliverable when `sie & sip` is
    /// non-empty, the core runs below M, and either SIE is set or the core runs in U. The
    /// cause is the lowest pending bit; the saved PC is the `next_pc` of the preceding
    /// retire. Unlike exceptions, interrupt delivery honors the tvec vectored mode bit.
    pub fn handle_interrupt(&mut self, op: &mut Op<W>) {
        debug_assert!(matches!(op.stage, Stage::Retire { .. }));
        let pc = op.next_pc;

        let m_pending = self.mie & self.mip;
        let s_pending = self.sie & self.sip;
        let (target, code) =
            if m_pending != W::ZERO && (self.status.mie || self.priv_level != PrivilegeLevel::Machine)
            {
                (PrivilegeLevel::Machine, m_pending.lowest_set_bit().unwrap())
            } else if s_pending != W::ZERO
                && self.priv_level != PrivilegeLevel::Machine
                && (self.status.sie || self.priv_level == PrivilegeLevel::User)
            {
                (
                    PrivilegeLevel::Supervisor,
                    s_pending.lowest_set_bit().unwrap(),
                )
            } else {
                return;
            };

        let tvec = match target {
            PrivilegeLevel::Supervisor => self.stvec,
            _ => self.mtvec,
        };
        let vector_base = tvec & !W::from_u64(0b11);
        let target_addr = if tvec.bit(0) {
            vector_base.wrapping_add(W::from_u64(4 * code as u64))
        } else {
            vector_base
        };

        let cause = W::from_u64(code as u64) | W::INTERRUPT_BIT;
        match target {
            PrivilegeLevel::Supervisor => {
                self.scause = cause;
                self.stval = W::ZERO;
                self.sepc = pc;
                self.status.spp = self.priv_level == PrivilegeLevel::Supervisor;
                self.status.spie = self.status.sie;
                self.status.sie = false;
            }
            _ => {
                self.mcause = cause;
                self.mtval = W::ZERO;
                self.mepc = pc;
                self.status.mpp = self.priv_level;
                self.status.mpie = self.status.mie;
                self.status.mie = false;
            }
        }
        self.priv_level = target;
        op.next_pc = target_addr;
    }

    /// External entry point for device agents: latches interrupt `cause` as pending, in sip
    /// when the cause is delegated by mideleg, in mip otherwise.
    pub fn raise_interrupt(&mut self, cause: W) {
        let code = (cause & !W::INTERRUPT_BIT).to_u64() as u32;
        let mask = W::ONE.shl(code);
        if self.mideleg & mask != W::ZERO {
            trace!("latching pending interrupt {code} in sip");
            self.sip = self.sip | mask;
        } else {
            trace!("latching pending interrupt {code} in mip");
            self.mip = self.mip | mask;
        }
    }

    /// The saved M-mode exception PC, the target of `mret`.
    pub fn mepc(&self) -> W {
        self.mepc
    }

    /// The saved S-mode exception PC, the target of `sret`.
    pub fn sepc(&self) -> W {
        self.sepc
    }
}
