//! The system-mode CPU façade, binding the unprivileged core, the privilege
//! module, the decode cache, the memory buses, and the event log.

use crate::cpu::Cpu;
use crate::decode_cache::DecodeCache;
use crate::event::{Event, EventKind};
use crate::io::IoAgent;
use crate::memory::SharedMemory;
use crate::op::{Op, Stage, SysOp};
use crate::privilege::PrivilegeModule;
use crate::ring_buffer::RingBuffer;
use crate::user_core::{self, UserCore};
use crate::word::{Width, Word};
use crate::Exception;
use std::fmt;

/// A single-issue RV32IM/RV64IM system-mode core.
///
/// Every instruction walks the staged pipeline: fetch through the privilege module, decode
/// through the PC-indexed cache, execute in the unprivileged core, privileged completion for
/// loads/stores/CSR/system operations, then exception or interrupt handling and the final
/// retire. Commit events are appended to the attached event buffer along the way, in the
/// order issue, then at most one of load/store/trap-return, then trap, then register write.
pub struct SystemCpu<W: Word> {
    user_core: UserCore<W>,
    privilege: PrivilegeModule<W>,
    decode_cache: DecodeCache,
    op: Op<W>,
    is_stopped: bool,
    last_trap: Option<W>,
    event_buffer: Option<RingBuffer<Event<W>>>,
    data_bus: SharedMemory<W>,
}

impl<W: Word> fmt::Debug for SystemCpu<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SystemCpu")
            .field("op", &self.op)
            .field("is_stopped", &self.is_stopped)
            .field("last_trap", &self.last_trap)
            .finish_non_exhaustive()
    }
}

impl<W: Word> SystemCpu<W> {
    /// Creates a core with its instruction and data buses attached (usually two handles to
    /// the same RAM). MMIO and event tracing are off until enabled.
    pub fn new(instr_bus: SharedMemory<W>, data_bus: SharedMemory<W>) -> Self {
        Self {
            user_core: UserCore::new(),
            privilege: PrivilegeModule::new(instr_bus, data_bus.clone(), None),
            decode_cache: DecodeCache::new(DecodeCache::DEFAULT_OFFSET_BITS, 2),
            op: Op::fetch_at(W::ZERO),
            is_stopped: false,
            last_trap: None,
            event_buffer: None,
            data_bus,
        }
    }

    /// Attaches an MMIO agent, used as a fallback for accesses outside RAM.
    pub fn with_mmio(mut self, agent: Box<dyn IoAgent>) -> Self {
        self.privilege.set_mmio(Some(agent));
        self
    }

    /// Enables event tracing with a log of `capacity` entries.
    pub fn with_event_buffer(mut self, capacity: usize) -> Self {
        self.event_buffer = Some(RingBuffer::new(capacity));
        self
    }

    /// The privileged half of the core, for CSR inspection.
    pub fn privilege(&self) -> &PrivilegeModule<W> {
        &self.privilege
    }

    /// Latches an external interrupt as pending.
    pub fn raise_interrupt(&mut self, cause: W) {
        self.privilege.raise_interrupt(cause);
    }

    fn push_event(&mut self, kind: EventKind, pc: W, val1: W, val2: W) {
        if let Some(buffer) = self.event_buffer.as_mut() {
            buffer.push_back(Event {
                kind,
                pc,
                val1,
                val2,
            });
        }
    }
}

impl<W: Word> Cpu<W> for SystemCpu<W> {
    fn reset(&mut self, init_pc: W) {
        self.user_core.reset();
        self.privilege.reset();
        self.decode_cache.clear();
        self.op = Op::fetch_at(init_pc);
        self.is_stopped = false;
        self.last_trap = None;
    }

    fn n_gpr(&self) -> u8 {
        32
    }

    fn gpr_name(&self, addr: u8) -> &'static str {
        user_core::gpr_name(addr)
    }

    fn gpr_addr(&self, name: &str) -> u8 {
        user_core::gpr_addr(name)
    }

    fn pc(&self) -> W {
        self.op.pc
    }

    fn gpr_file(&self) -> &[W] {
        self.user_core.gpr()
    }

    fn next_cycle(&mut self) {
        self.next_instruction();
    }

    fn next_instruction(&mut self) {
        if self.is_stopped {
            return;
        }
        let mut op = self.op;
        op.stage = Stage::Fetch;

        self.privilege.vaddr_fetch(&mut op);

        if matches!(op.stage, Stage::Fetch) {
            self.push_event(
                EventKind::Issue,
                op.pc,
                W::from_u64(op.instr as u64),
                W::ZERO,
            );
            self.decode_cache.decode(&mut op);
        }

        if matches!(op.stage, Stage::Decode(_)) {
            self.user_core.execute(&mut op);
        }

        // Privileged completion of the staged operation.
        match op.stage {
            Stage::Load { addr, width, .. } => {
                self.privilege.vaddr_load(&mut op);
                if let Stage::Retire { value, .. } = op.stage {
                    self.push_event(EventKind::Load, op.pc, addr, value.zero_truncate(width));
                }
            }
            Stage::Store { addr, data, .. } => {
                self.privilege.vaddr_store(&mut op);
                if matches!(op.stage, Stage::Retire { .. }) {
                    self.push_event(EventKind::Store, op.pc, addr, data);
                }
            }
            Stage::Csr(_) => self.privilege.csr_op(&mut op),
            Stage::Sys(sys) => {
                self.privilege.sys_op(&mut op);
                if matches!(op.stage, Stage::Retire { .. }) {
                    match sys {
                        SysOp::Mret => {
                            let target = self.privilege.mepc();
                            self.push_event(EventKind::TrapRet, op.pc, target, W::ZERO);
                        }
                        SysOp::Sret => {
                            let target = self.privilege.sepc();
                            self.push_event(EventKind::TrapRet, op.pc, target, W::ZERO);
                        }
                        SysOp::Ecall => {}
                    }
                }
            }
            _ => {}
        }

        if let Stage::Trap { cause, tval } = op.stage {
            // `ebreak` is a halt request for the simulator, not a trap to deliver.
            if cause == W::from_u64(Exception::Breakpoint.code()) {
                self.is_stopped = true;
                self.op = op;
                return;
            }
            self.push_event(EventKind::Trap, op.pc, cause, tval);
            self.last_trap = Some(cause);
            self.privilege.handle_exception(&mut op);
        } else {
            // Exceptions are synchronous and take priority; only a cleanly retiring
            // instruction may be interrupted.
            self.last_trap = None;
            self.privilege.handle_interrupt(&mut op);
        }

        let Stage::Retire { rd, value } = op.stage else {
            unreachable!("instruction ended the cycle in stage {:?}", op.stage);
        };
        if rd != 0 {
            self.push_event(EventKind::RegWrite, op.pc, W::from_u64(rd as u64), value);
            self.user_core.set_x(rd, value);
        }

        if let Some(agent) = self.privilege.mmio_agent() {
            agent.next_cycle();
        }

        op.pc = op.next_pc;
        op.stage = Stage::Fetch;
        self.op = op;
    }

    fn vaddr_to_paddr(&self, vaddr: W) -> Option<W> {
        self.privilege.vaddr_to_paddr(vaddr)
    }

    fn pmem_peek(&self, addr: W, width: Width) -> Option<W> {
        self.data_bus.borrow().peek(addr, width)
    }

    fn stopped(&self) -> bool {
        self.is_stopped
    }

    fn last_trap(&self) -> Option<W> {
        self.last_trap
    }

    fn event_buffer(&self) -> Option<&RingBuffer<Event<W>>> {
        self.event_buffer.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::ContiguousMemory;
    use crate::privilege::csr;

    const RAM_BASE: u32 = 0x8000_0000;

    fn cpu_with_program(program: &[u32]) -> SystemCpu<u32> {
        let ram = ContiguousMemory::<u32>::new_shared(RAM_BASE, 0x4000);
        for (i, word) in program.iter().enumerate() {
            ram.borrow_mut()
                .set(RAM_BASE + 4 * i as u32, Width::Word, *word);
        }
        let mut cpu = SystemCpu::new(ram.clone(), ram).with_event_buffer(64);
        cpu.reset(RAM_BASE);
        cpu
    }

    fn run_until_stopped(cpu: &mut SystemCpu<u32>) {
        for _ in 0..1000 {
            if cpu.stopped() {
                return;
            }
            cpu.next_instruction();
        }
        panic!("program did not stop");
    }

    #[test]
    fn test_load_immediate_and_add() {
        let mut cpu = cpu_with_program(&[
            0x0070_0093, // addi x1, x0, 7
            0x0230_0113, // addi x2, x0, 35
            0x0020_81B3, // add x3, x1, x2
            0x0010_0073, // ebreak
        ]);
        run_until_stopped(&mut cpu);
        assert_eq!(cpu.gpr(1), 7);
        assert_eq!(cpu.gpr(2), 35);
        assert_eq!(cpu.gpr(3), 42);
        assert_eq!(cpu.pc(), RAM_BASE + 0xC);
        assert!(cpu.stopped());
        assert_eq!(cpu.last_trap(), None);
        assert_eq!(cpu.gpr(0), 0);
    }

    #[test]
    fn test_csr_round_trip() {
        let mut cpu = cpu_with_program(&[
            0x340F_D0F3, // csrrwi x1, mscratch, 0x1F
            0x3400_2173, // csrrs x2, mscratch, x0
            0x0010_0073, // ebreak
        ]);
        run_until_stopped(&mut cpu);
        assert_eq!(cpu.gpr(1), 0);
        assert_eq!(cpu.gpr(2), 0x1F);
        assert_eq!(cpu.privilege().csr_peek(csr::MSCRATCH), Some(0x1F));
    }

    #[test]
    fn test_trap_delivery_from_machine_mode() {
        let mut cpu = cpu_with_program(&[
            0x8000_10B7, // lui x1, 0x80001
            0x3050_9073, // csrrw x0, mtvec, x1
            0x0000_0073, // ecall
        ]);
        cpu.next_instructions(3);

        let ecall_pc = RAM_BASE + 8;
        assert_eq!(cpu.privilege().csr_peek(csr::MEPC), Some(ecall_pc));
        assert_eq!(
            cpu.privilege().csr_peek(csr::MCAUSE),
            Some(Exception::EnvironmentCallFromMMode.code() as u32)
        );
        assert_eq!(cpu.pc(), 0x8000_1000);
        assert!(!cpu.stopped());

        // The event stream for the ecall contains issue then trap, in order.
        let buffer = cpu.event_buffer().unwrap();
        let events: Vec<_> = buffer
            .iter()
            .filter(|e| e.pc == ecall_pc)
            .copied()
            .collect();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, EventKind::Issue);
        assert_eq!(events[0].val1, 0x0000_0073);
        assert_eq!(events[1].kind, EventKind::Trap);
        assert_eq!(
            events[1].val1,
            Exception::EnvironmentCallFromMMode.code() as u32
        );
        assert_eq!(events[1].val2, 0);
    }

    #[test]
    fn test_mret_returns_and_logs_trap_ret() {
        let mut cpu = cpu_with_program(&[
            0x8000_10B7, // lui x1, 0x80001
            0x3050_9073, // csrrw x0, mtvec, x1
            0x0000_0073, // ecall -> vectors to 0x80001000
        ]);
        // Place `mret` at the handler.
        cpu.data_bus
            .borrow_mut()
            .set(0x8000_1000, Width::Word, 0x3020_0073);
        cpu.next_instructions(4);

        // mret lands back on the ecall; it would trap again, so only check the first pass.
        assert_eq!(cpu.pc(), RAM_BASE + 8);
        let trap_ret: Vec<_> = cpu
            .event_buffer()
            .unwrap()
            .iter()
            .filter(|e| e.kind == EventKind::TrapRet)
            .copied()
            .collect();
        assert_eq!(trap_ret.len(), 1);
        assert_eq!(trap_ret[0].pc, 0x8000_1000);
        assert_eq!(trap_ret[0].val1, RAM_BASE + 8);
    }

    #[test]
    fn test_load_store_events_and_memory() {
        let mut cpu = cpu_with_program(&[
            0x8000_00B7, // lui x1, 0x80000
            0x1230_0113, // addi x2, x0, 0x123
            0x2020_A023, // sw x2, 512(x1)
            0x2000_A183, // lw x3, 512(x1)
            0x0010_0073, // ebreak
        ]);
        run_until_stopped(&mut cpu);
        assert_eq!(cpu.gpr(3), 0x123);
        assert_eq!(cpu.pmem_peek(RAM_BASE + 512, Width::Word), Some(0x123));

        let buffer = cpu.event_buffer().unwrap();
        let store: Vec<_> = buffer
            .iter()
            .filter(|e| e.kind == EventKind::Store)
            .collect();
        assert_eq!(store.len(), 1);
        assert_eq!(store[0].val1, RAM_BASE + 512);
        assert_eq!(store[0].val2, 0x123);
        let load: Vec<_> = buffer.iter().filter(|e| e.kind == EventKind::Load).collect();
        assert_eq!(load.len(), 1);
        assert_eq!(load[0].val2, 0x123);
    }

    #[test]
    fn test_event_order_within_instruction() {
        let mut cpu = cpu_with_program(&[
            0x8000_00B7, // lui x1, 0x80000
            0x2000_A183, // lw x3, 512(x1)
            0x0010_0073, // ebreak
        ]);
        run_until_stopped(&mut cpu);
        let load_pc = RAM_BASE + 4;
        let kinds: Vec<_> = cpu
            .event_buffer()
            .unwrap()
            .iter()
            .filter(|e| e.pc == load_pc)
            .map(|e| e.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![EventKind::Issue, EventKind::Load, EventKind::RegWrite]
        );
    }

    #[test]
    fn test_illegal_instruction_traps_with_instr_tval() {
        let mut cpu = cpu_with_program(&[
            0xFFFF_FFFF, // not an instruction
        ]);
        cpu.next_instruction();
        assert_eq!(
            cpu.last_trap(),
            Some(Exception::IllegalInstruction.code() as u32)
        );
        assert_eq!(cpu.privilege().csr_peek(csr::MTVAL), Some(0xFFFF_FFFF));
        // mtvec is 0, so the core vectors to address 0; fetching there faults next.
        assert_eq!(cpu.pc(), 0);
    }

    #[test]
    fn test_branch_to_misaligned_target_faults() {
        // Jump to a halfword boundary; without the compressed extension the next fetch must
        // raise the misaligned-instruction exception.
        let mut cpu = cpu_with_program(&[
            0x8000_00B7, // lui x1, 0x80000
            0x0060_8093, // addi x1, x1, 6
            0x0000_80E7, // jalr x1, 0(x1)
        ]);
        cpu.next_instructions(4);
        // The fetch at base+6 misaligns; the trap records the target address.
        assert_eq!(
            cpu.privilege().csr_peek(csr::MCAUSE),
            Some(Exception::InstructionAddressMisaligned.code() as u32)
        );
        assert_eq!(cpu.privilege().csr_peek(csr::MTVAL), Some(RAM_BASE + 6));
    }

    #[test]
    fn test_exception_preferred_over_interrupt() {
        let mut cpu = cpu_with_program(&[
            0x8000_10B7, // lui x1, 0x80001
            0x3050_9073, // csrrw x0, mtvec, x1
            0x0800_0113, // addi x2, x0, 0x80
            0x3041_2073, // csrrs x0, mie, x2 (enable MTIE)
            0x0000_0073, // ecall (would also have a pending interrupt)
        ]);
        cpu.next_instructions(4);
        // MIE stays clear in mstatus, but pend the timer interrupt anyway; in M-mode with
        // mstatus.MIE clear it cannot be delivered, and the ecall exception must win even
        // when delivery were possible at this instruction.
        cpu.raise_interrupt(7);
        cpu.next_instruction();
        assert_eq!(
            cpu.privilege().csr_peek(csr::MCAUSE),
            Some(Exception::EnvironmentCallFromMMode.code() as u32)
        );
        assert_eq!(cpu.privilege().csr_peek(csr::MEPC), Some(RAM_BASE + 16));
    }

    #[test]
    fn test_interrupt_taken_after_clean_retire() {
        let mut cpu = cpu_with_program(&[
            0x8000_10B7, // lui x1, 0x80001
            0x3050_9073, // csrrw x0, mtvec, x1
            0x0800_0113, // addi x2, x0, 0x80
            0x3041_2073, // csrrs x0, mie, x2 (enable MTIE)
            0x0080_0193, // addi x3, x0, 8
            0x3001_A073, // csrrs x0, mstatus, x3 (set mstatus.MIE)
            0x0000_0013, // nop (addi x0, x0, 0)
        ]);
        cpu.next_instructions(6);
        cpu.raise_interrupt(7);
        cpu.next_instruction();
        assert_eq!(cpu.pc(), 0x8000_1000);
        // For interrupts the saved PC is the next_pc of the interrupted retire.
        assert_eq!(cpu.privilege().csr_peek(csr::MEPC), Some(RAM_BASE + 28));
        assert_eq!(cpu.privilege().csr_peek(csr::MCAUSE), Some(7 | (1 << 31)));
    }

    #[test]
    fn test_rv64_system_cpu() {
        let ram = ContiguousMemory::<u64>::new_shared(0x8000_0000, 0x1000);
        let program: [u32; 4] = [
            0x0070_0093, // addi x1, x0, 7
            0xFFF0_0113, // addi x2, x0, -1
            0x0020_81B3, // add x3, x1, x2
            0x0010_0073, // ebreak
        ];
        for (i, word) in program.iter().enumerate() {
            ram.borrow_mut()
                .set(0x8000_0000 + 4 * i as u64, Width::Word, *word as u64);
        }
        let mut cpu = SystemCpu::new(ram.clone(), ram);
        cpu.reset(0x8000_0000);
        while !cpu.stopped() {
            cpu.next_instruction();
        }
        assert_eq!(cpu.gpr(2), u64::MAX);
        assert_eq!(cpu.gpr(3), 6);
    }
}
