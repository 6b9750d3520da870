//! Memory-mapped I/O: the device frontend/backend contract, the shared
//! dispatcher, and the reference console and timer devices.

pub mod console;
pub mod dispatcher;
pub mod mtime;

pub use dispatcher::{IoDispatcher, MmioAgent};

use crate::word::{zero_truncate, Width};
use log::warn;

/// The data source/sink behind a device frontend.
///
/// Each method takes a `req` tag whose meaning is defined per device family (see the `req`
/// modules of [`console`] and [`mtime`]). The behavior is undefined for tags a backend does
/// not recognize.
pub trait IoBackend {
    /// Blocking read of tagged input. Blocks until data becomes available.
    ///
    /// Used when the processor explicitly reads input via MMIO. The blocking behavior makes
    /// sure that simple programs assuming input is always available will work.
    fn request(&mut self, req: u64) -> u64;

    /// Blocking input-availability check.
    ///
    /// Used when the processor explicitly checks readiness via MMIO. Synchronous backends must
    /// block to wait for data here: if they returned "not available", the processor might
    /// conclude the device is busy and never perform the input.
    fn poll(&mut self, req: u64) -> bool;

    /// Non-blocking input-availability check, for the frontend's own use.
    fn check(&mut self, req: u64) -> bool;

    /// Non-blocking write of output data.
    fn put(&mut self, req: u64, data: u64);
}

/// What a resolved MMIO access asks of the backend.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum IoReqKind {
    Read,
    Write,
    PollIn,
    PollOut,
    IoctlGet,
    IoctlSet,
    Invalid,
}

/// A device-register access resolved to an abstract request record.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct IoRequest {
    pub kind: IoReqKind,
    /// Backend-specific request tag.
    pub req: u64,
}

impl IoRequest {
    pub const INVALID: Self = Self {
        kind: IoReqKind::Invalid,
        req: 0,
    };
}

/// Resolves MMIO register offsets to backend requests.
///
/// A frontend knows a device's register map; the backend does the actual I/O. `IoctlGet`/
/// `IoctlSet` requests are handled by the frontend itself (device state that has no backend
/// counterpart, such as a status register or a prescaler).
pub trait IoFrontend {
    fn resolve_read(&self, offset: u64, width: Width) -> IoRequest;
    fn resolve_write(&self, offset: u64, width: Width, data: u64) -> IoRequest;

    fn ioctl_get(&mut self, backend: &mut dyn IoBackend, req: u64) -> u64 {
        let _ = (backend, req);
        0
    }

    fn ioctl_set(&mut self, req: u64, value: u64) {
        let _ = (req, value);
    }
}

/// A frontend paired with the backend it drives; one MMIO device.
pub struct Device {
    frontend: Box<dyn IoFrontend>,
    backend: Box<dyn IoBackend>,
}

impl Device {
    pub fn new(frontend: Box<dyn IoFrontend>, backend: Box<dyn IoBackend>) -> Self {
        Self { frontend, backend }
    }

    /// Reads a device register. The result is zero-truncated to `width`.
    ///
    /// `PollOut` requests are hard-wired to `1`: software-emulated devices are always ready
    /// for output.
    pub fn read(&mut self, offset: u64, width: Width) -> Option<u64> {
        let request = self.frontend.resolve_read(offset, width);
        let data = match request.kind {
            IoReqKind::Read => Some(self.backend.request(request.req)),
            IoReqKind::PollIn => Some(self.backend.poll(request.req) as u64),
            IoReqKind::PollOut => Some(1),
            IoReqKind::IoctlGet => Some(self.frontend.ioctl_get(&mut *self.backend, request.req)),
            IoReqKind::Write | IoReqKind::IoctlSet => {
                warn!("MMIO read resolved as a write request kind");
                None
            }
            IoReqKind::Invalid => None,
        };
        data.map(|value| zero_truncate(value, width))
    }

    /// Writes a device register. Returns `false` if the register does not accept the access.
    pub fn write(&mut self, offset: u64, width: Width, data: u64) -> bool {
        let request = self.frontend.resolve_write(offset, width, data);
        match request.kind {
            IoReqKind::Write => {
                self.backend.put(request.req, data);
                true
            }
            IoReqKind::IoctlSet => {
                self.frontend.ioctl_set(request.req, data);
                true
            }
            IoReqKind::Read | IoReqKind::PollIn | IoReqKind::PollOut | IoReqKind::IoctlGet => {
                warn!("MMIO write resolved as a read request kind");
                false
            }
            IoReqKind::Invalid => false,
        }
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device").finish_non_exhaustive()
    }
}

/// MMIO interface handed to a simulated processor.
///
/// Each core in a differential test gets its own agent from the shared [`IoDispatcher`]; the
/// dispatcher memoizes device responses by request number so all agents observe identical
/// device behavior.
pub trait IoAgent {
    /// Performs a read on the device bus. `None` if no device claims the address or the
    /// access is rejected.
    fn read(&mut self, addr: u64, width: Width) -> Option<u64>;

    /// Performs a write on the device bus. `false` if no device claims the address or the
    /// access is rejected.
    fn write(&mut self, addr: u64, width: Width, data: u64) -> bool;

    /// Marks a cycle boundary, ending this agent's same-cycle request window.
    fn next_cycle(&mut self);
}
