//! Lockstep differential testing of two cores through their commit-event
//! streams.

use crate::cpu::Cpu;
use crate::event::{Event, EventKind};
use crate::ring_buffer::RingBuffer;
use crate::word::{Width, Word};
use log::warn;
use std::cell::Cell;

/// Whether an event participates in commit-stream comparison.
///
/// Issue, load, and store events depend on microarchitectural detail (a reference model may
/// fuse or replay them); the architecturally visible commits are register writes, traps, and
/// trap returns.
fn is_commit(kind: EventKind) -> bool {
    matches!(
        kind,
        EventKind::RegWrite | EventKind::Trap | EventKind::TrapRet
    )
}

/// A CPU that steps a device-under-test and a reference model in lockstep and cross-checks
/// the commit events each appends to its own event buffer.
///
/// The DUT may retire zero, one, or many instructions per cycle; the reference model is
/// assumed to retire exactly one instruction per cycle and is stepped until it has produced
/// at least as many commit events as the DUT. Any difference in event count or content
/// latches an unrecoverable error.
///
/// Each child owns its event buffer; the tester maintains its own read cursor per child and
/// never consumes events, so a tracer can traverse the same buffers concurrently.
pub struct Difftest<W: Word> {
    dut: Box<dyn Cpu<W>>,
    reference: Box<dyn Cpu<W>>,
    event_buffer: Option<RingBuffer<Event<W>>>,
    dut_cursor: usize,
    ref_cursor: usize,
    error: bool,
    one_sided_warned: Cell<bool>,
}

impl<W: Word> Difftest<W> {
    /// Pairs a DUT with a reference model. The tester keeps its own event log of
    /// `event_capacity` entries, mirroring the DUT's stream plus any mismatch records.
    pub fn new(dut: Box<dyn Cpu<W>>, reference: Box<dyn Cpu<W>>, event_capacity: usize) -> Self {
        Self {
            dut,
            reference,
            event_buffer: Some(RingBuffer::new(event_capacity)),
            dut_cursor: 0,
            ref_cursor: 0,
            error: false,
            one_sided_warned: Cell::new(false),
        }
    }

    pub fn dut(&self) -> &dyn Cpu<W> {
        &*self.dut
    }

    pub fn dut_mut(&mut self) -> &mut dyn Cpu<W> {
        &mut *self.dut
    }

    pub fn reference(&self) -> &dyn Cpu<W> {
        &*self.reference
    }

    pub fn reference_mut(&mut self) -> &mut dyn Cpu<W> {
        &mut *self.reference
    }

    /// Whether a divergence has been latched. The offending events are recorded in the
    /// tester's event buffer.
    pub fn difftest_error(&self) -> bool {
        self.error
    }

    /// Drains new events from a child's buffer, returning them all and advancing the cursor.
    /// `None` if the child has no event buffer, which makes comparison impossible.
    fn drain(cpu: &dyn Cpu<W>, cursor: &mut usize) -> Option<Vec<Event<W>>> {
        let buffer = cpu.event_buffer()?;
        // If the buffer overwrote part of the unread window the tail is lost; resuming at
        // first_index is the best-effort recovery, the length comparison will catch real
        // divergence.
        *cursor = (*cursor).max(buffer.first_index());
        let mut events = Vec::new();
        while *cursor < buffer.last_index() {
            events.push(*buffer.get(*cursor).unwrap());
            *cursor += 1;
        }
        Some(events)
    }

    fn latch_error(&mut self, offending: EventKind) {
        self.error = true;
        let pc = self.dut.pc();
        let instr = self.dut.pmem_peek(pc, Width::Word).unwrap_or(W::ZERO);
        if let Some(buffer) = self.event_buffer.as_mut() {
            buffer.push_back(Event {
                kind: EventKind::DiffError,
                pc,
                val1: W::from_u64(offending.code()),
                val2: instr,
            });
        }
    }
}

impl<W: Word> Cpu<W> for Difftest<W> {
    fn reset(&mut self, init_pc: W) {
        self.dut.reset(init_pc);
        self.reference.reset(init_pc);
        self.dut_cursor = self.dut.event_buffer().map_or(0, |b| b.last_index());
        self.ref_cursor = self.reference.event_buffer().map_or(0, |b| b.last_index());
        self.error = false;
        self.one_sided_warned.set(false);
    }

    /// Running differential tests on CPUs with different register counts is allowed (for
    /// example RV32I against RV32E), limited to the smaller file.
    fn n_gpr(&self) -> u8 {
        self.dut.n_gpr().min(self.reference.n_gpr())
    }

    fn gpr_name(&self, addr: u8) -> &'static str {
        self.dut.gpr_name(addr)
    }

    fn gpr_addr(&self, name: &str) -> u8 {
        self.dut.gpr_addr(name)
    }

    fn pc(&self) -> W {
        self.dut.pc()
    }

    fn gpr_file(&self) -> &[W] {
        self.dut.gpr_file()
    }

    fn next_cycle(&mut self) {
        if self.error {
            return;
        }

        self.dut.next_cycle();
        let Some(dut_events) = Self::drain(&*self.dut, &mut self.dut_cursor) else {
            warn!("differential testing requires the DUT to have an event buffer");
            return self.latch_error(EventKind::DiffError);
        };
        // The DUT's stream is the canonical order the reference is aligned against.
        if let Some(buffer) = self.event_buffer.as_mut() {
            for event in &dut_events {
                buffer.push_back(*event);
            }
        }
        let dut_commits: Vec<_> = dut_events
            .iter()
            .copied()
            .filter(|e| is_commit(e.kind))
            .collect();

        let Some(mut ref_commits) = Self::drain(&*self.reference, &mut self.ref_cursor)
            .map(|events| {
                events
                    .into_iter()
                    .filter(|e| is_commit(e.kind))
                    .collect::<Vec<_>>()
            })
        else {
            warn!("differential testing requires the reference to have an event buffer");
            return self.latch_error(EventKind::DiffError);
        };
        while ref_commits.len() < dut_commits.len() && !self.reference.stopped() {
            self.reference.next_instruction();
            match Self::drain(&*self.reference, &mut self.ref_cursor) {
                Some(events) => {
                    ref_commits.extend(events.into_iter().filter(|e| is_commit(e.kind)))
                }
                None => {
                    warn!("differential testing requires the reference to have an event buffer");
                    return self.latch_error(EventKind::DiffError);
                }
            }
        }

        if dut_commits.len() != ref_commits.len() {
            warn!(
                "commit stream lengths diverge: dut {} vs ref {}",
                dut_commits.len(),
                ref_commits.len()
            );
            let offending = dut_commits
                .first()
                .or(ref_commits.first())
                .map_or(EventKind::DiffError, |e| e.kind);
            return self.latch_error(offending);
        }
        for (dut_event, ref_event) in dut_commits.iter().zip(&ref_commits) {
            if dut_event != ref_event {
                warn!("commit streams diverge:\n  dut: {dut_event}\n  ref: {ref_event}");
                return self.latch_error(dut_event.kind);
            }
        }
    }

    fn next_instruction(&mut self) {
        self.next_cycle();
    }

    fn vaddr_to_paddr(&self, vaddr: W) -> Option<W> {
        self.dut.vaddr_to_paddr(vaddr)
    }

    fn pmem_peek(&self, addr: W, width: Width) -> Option<W> {
        self.dut.pmem_peek(addr, width)
    }

    fn vmem_peek(&self, addr: W, width: Width) -> Option<W> {
        self.dut.vmem_peek(addr, width)
    }

    fn stopped(&self) -> bool {
        if self.error {
            return true;
        }
        let dut = self.dut.stopped();
        let reference = self.reference.stopped();
        if dut != reference && !self.one_sided_warned.get() {
            self.one_sided_warned.set(true);
            warn!(
                "one-sided stop: dut {}, reference {}",
                if dut { "stopped" } else { "running" },
                if reference { "stopped" } else { "running" },
            );
        }
        dut && reference
    }

    fn last_trap(&self) -> Option<W> {
        self.dut.last_trap()
    }

    fn event_buffer(&self) -> Option<&RingBuffer<Event<W>>> {
        self.event_buffer.as_ref()
    }
}
