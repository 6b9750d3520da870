//! Address-decoded fan-out to MMIO devices with cross-agent request
//! memoization.

use super::{Device, IoAgent};
use crate::ring_buffer::RingBuffer;
use crate::word::Width;
use log::warn;
use std::cell::RefCell;
use std::rc::Rc;

#[derive(Debug, Clone)]
struct ReadRequest {
    addr: u64,
    width: Width,
    data: Option<u64>,
}

#[derive(Debug, Clone)]
struct WriteRequest {
    addr: u64,
    width: Width,
    data: u64,
    success: bool,
}

#[derive(Debug)]
struct MmioDeviceDef {
    device: Device,
    addr_begin: u64,
    byte_span: u64,
}

/// Multiplexes device frontends over a shared address bus and memoizes per-request results.
///
/// The dispatcher keeps two ring buffers of past requests, keyed by a per-agent monotonically
/// increasing request number. For each request number, exactly one backend invocation is
/// performed; subsequent agents presenting the same request number receive the memoized
/// result without the device being consulted. This is what makes differential testing against
/// time-varying devices (console input, timers) possible: both cores observe the same
/// response as long as they issue the same request sequence. The buffer capacity bounds the
/// commit skew tolerated between agents.
#[derive(Debug)]
pub struct IoDispatcher {
    devices: Vec<MmioDeviceDef>,
    read_requests: RingBuffer<ReadRequest>,
    write_requests: RingBuffer<WriteRequest>,
}

impl IoDispatcher {
    pub const DEFAULT_BUFFER_SIZE: usize = 32;

    /// Creates a dispatcher whose request history retains `buffer_size` entries per
    /// direction.
    pub fn new(buffer_size: usize) -> Self {
        Self {
            devices: Vec::new(),
            read_requests: RingBuffer::new(buffer_size),
            write_requests: RingBuffer::new(buffer_size),
        }
    }

    /// Attaches `device` to the address window `[addr_begin, addr_begin + byte_span)`.
    pub fn attach(&mut self, device: Device, addr_begin: u64, byte_span: u64) {
        self.devices.push(MmioDeviceDef {
            device,
            addr_begin,
            byte_span,
        });
    }

    /// Chainable version of [`attach`](Self::attach).
    pub fn with_device(mut self, device: Device, addr_begin: u64, byte_span: u64) -> Self {
        self.attach(device, addr_begin, byte_span);
        self
    }

    /// Wraps the dispatcher for sharing between agents.
    pub fn into_shared(self) -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(self))
    }

    /// Routes an access to the first device whose window contains `addr`, handing it the
    /// offset within its window. No device claiming the address yields the default.
    fn dispatch<T: Default>(&mut self, addr: u64, f: impl FnOnce(&mut Device, u64) -> T) -> T {
        self.devices
            .iter_mut()
            .find(|def| addr >= def.addr_begin && addr < def.addr_begin + def.byte_span)
            .map(|def| f(&mut def.device, addr - def.addr_begin))
            .unwrap_or_default()
    }

    /// Issues a read request with sequence number `req_no`.
    ///
    /// The device is only consulted when `req_no` is the next unseen number; a request that
    /// was already performed is answered from the history, provided `(addr, width)` match
    /// the recorded tuple. Requests older than the retained window or ahead of the next
    /// number are dispatcher misuse and fail with a logged warning.
    pub fn request_read(&mut self, addr: u64, width: Width, req_no: usize) -> Option<u64> {
        if req_no < self.read_requests.first_index() {
            warn!("read request buffer underflow (req_no {req_no})");
            None
        } else if req_no < self.read_requests.last_index() {
            let cached = self.read_requests.get(req_no).unwrap();
            if cached.addr == addr && cached.width == width {
                cached.data
            } else {
                warn!(
                    "read request mismatch: cached addr={:#x} width={}, new addr={:#x} width={}",
                    cached.addr, cached.width, addr, width
                );
                None
            }
        } else if req_no == self.read_requests.last_index() {
            let data = self.dispatch(addr, |device, offset| device.read(offset, width));
            self.read_requests.push_back(ReadRequest { addr, width, data });
            data
        } else {
            warn!("read request buffer overflow (req_no {req_no})");
            None
        }
    }

    /// Issues a write request with sequence number `req_no`. Symmetric to
    /// [`request_read`](Self::request_read), with `(addr, width, data)` as the memoization
    /// key.
    pub fn request_write(&mut self, addr: u64, width: Width, data: u64, req_no: usize) -> bool {
        if req_no < self.write_requests.first_index() {
            warn!("write request buffer underflow (req_no {req_no})");
            false
        } else if req_no < self.write_requests.last_index() {
            let cached = self.write_requests.get(req_no).unwrap();
            if cached.addr == addr && cached.width == width && cached.data == data {
                cached.success
            } else {
                warn!(
                    "write request mismatch: cached addr={:#x} width={} data={:#x}, \
                     new addr={:#x} width={} data={:#x}",
                    cached.addr, cached.width, cached.data, addr, width, data
                );
                false
            }
        } else if req_no == self.write_requests.last_index() {
            let success = self.dispatch(addr, |device, offset| device.write(offset, width, data));
            self.write_requests.push_back(WriteRequest {
                addr,
                width,
                data,
                success,
            });
            success
        } else {
            warn!("write request buffer overflow (req_no {req_no})");
            false
        }
    }
}

/// A per-CPU handle to a shared [`IoDispatcher`].
///
/// The agent numbers its requests with its own counters, which is what aligns one core's
/// request stream with another's in the dispatcher's history. Within a single cycle, repeated
/// accesses to the same address are answered from the requests already made this cycle
/// without consuming a new request number; accessing the same address with a different shape
/// in one cycle is an error.
#[derive(Debug)]
pub struct MmioAgent {
    dispatcher: Rc<RefCell<IoDispatcher>>,
    read_count: usize,
    write_count: usize,
    old_read_count: usize,
    old_write_count: usize,
}

impl MmioAgent {
    pub fn new(dispatcher: Rc<RefCell<IoDispatcher>>) -> Self {
        Self {
            dispatcher,
            read_count: 0,
            write_count: 0,
            old_read_count: 0,
            old_write_count: 0,
        }
    }
}

impl IoAgent for MmioAgent {
    fn read(&mut self, addr: u64, width: Width) -> Option<u64> {
        let mut dispatcher = self.dispatcher.borrow_mut();
        // A simulator may replay the same access several times within one cycle; serve those
        // from this cycle's own requests.
        for req_no in self.old_read_count..self.read_count {
            let Some(cached) = dispatcher.read_requests.get(req_no) else {
                continue;
            };
            if cached.addr == addr {
                return if cached.width == width {
                    cached.data
                } else {
                    warn!(
                        "read of the same MMIO address with different widths \
                         in one cycle (addr {addr:#x})"
                    );
                    None
                };
            }
        }
        let req_no = self.read_count;
        self.read_count += 1;
        dispatcher.request_read(addr, width, req_no)
    }

    fn write(&mut self, addr: u64, width: Width, data: u64) -> bool {
        let mut dispatcher = self.dispatcher.borrow_mut();
        for req_no in self.old_write_count..self.write_count {
            let Some(cached) = dispatcher.write_requests.get(req_no) else {
                continue;
            };
            if cached.addr == addr {
                return if cached.width == width && cached.data == data {
                    cached.success
                } else {
                    warn!(
                        "write of the same MMIO address with different width or data \
                         in one cycle (addr {addr:#x})"
                    );
                    false
                };
            }
        }
        let req_no = self.write_count;
        self.write_count += 1;
        dispatcher.request_write(addr, width, data, req_no)
    }

    fn next_cycle(&mut self) {
        self.old_read_count = self.read_count;
        self.old_write_count = self.write_count;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{IoBackend, IoFrontend, IoReqKind, IoRequest};

    /// A device whose reads return a fresh value every time the backend is consulted, so a
    /// second backend invocation is observable.
    struct CountingBackend {
        reads: u64,
        writes: Vec<(u64, u64)>,
    }

    impl IoBackend for CountingBackend {
        fn request(&mut self, _req: u64) -> u64 {
            self.reads += 1;
            0x40 + self.reads
        }

        fn poll(&mut self, _req: u64) -> bool {
            true
        }

        fn check(&mut self, _req: u64) -> bool {
            true
        }

        fn put(&mut self, req: u64, data: u64) {
            self.writes.push((req, data));
        }
    }

    struct PlainFrontend;

    impl IoFrontend for PlainFrontend {
        fn resolve_read(&self, offset: u64, _width: Width) -> IoRequest {
            IoRequest {
                kind: IoReqKind::Read,
                req: offset,
            }
        }

        fn resolve_write(&self, offset: u64, _width: Width, _data: u64) -> IoRequest {
            IoRequest {
                kind: IoReqKind::Write,
                req: offset,
            }
        }
    }

    fn test_dispatcher() -> Rc<RefCell<IoDispatcher>> {
        IoDispatcher::new(4)
            .with_device(
                Device::new(
                    Box::new(PlainFrontend),
                    Box::new(CountingBackend {
                        reads: 0,
                        writes: Vec::new(),
                    }),
                ),
                0x1000,
                8,
            )
            .into_shared()
    }

    #[test]
    fn test_two_agents_observe_identical_responses() {
        let dispatcher = test_dispatcher();
        let mut a = MmioAgent::new(dispatcher.clone());
        let mut b = MmioAgent::new(dispatcher.clone());

        let first = a.read(0x1000, Width::Byte);
        assert_eq!(first, Some(0x41));
        // Same req_no from a different agent: memoized, the backend is not consulted again.
        assert_eq!(b.read(0x1000, Width::Byte), Some(0x41));

        a.next_cycle();
        b.next_cycle();
        assert_eq!(a.read(0x1000, Width::Byte), Some(0x42));
        assert_eq!(b.read(0x1000, Width::Byte), Some(0x42));
    }

    #[test]
    fn test_same_cycle_repeat_does_not_consume_req_no() {
        let dispatcher = test_dispatcher();
        let mut agent = MmioAgent::new(dispatcher.clone());

        assert_eq!(agent.read(0x1000, Width::Byte), Some(0x41));
        assert_eq!(agent.read(0x1000, Width::Byte), Some(0x41));
        assert_eq!(agent.read_count, 1);
        // Different width for the same address in one cycle is an error.
        assert_eq!(agent.read(0x1000, Width::Half), None);
    }

    #[test]
    fn test_underflow_and_mismatch() {
        let dispatcher = test_dispatcher();
        {
            let mut d = dispatcher.borrow_mut();
            // Fill the 4-entry history so req_no 0 falls out of the window.
            for req_no in 0..5 {
                d.request_read(0x1000, Width::Byte, req_no);
            }
            assert_eq!(d.read_requests.first_index(), 1);
            // Underflow.
            assert_eq!(d.request_read(0x1000, Width::Byte, 0), None);
            // Cached-tuple mismatch.
            assert_eq!(d.request_read(0x1004, Width::Byte, 2), None);
            // Overflow (skipping ahead).
            assert_eq!(d.request_read(0x1000, Width::Byte, 100), None);
        }
    }

    #[test]
    fn test_unmapped_address() {
        let dispatcher = test_dispatcher();
        let mut agent = MmioAgent::new(dispatcher);
        assert_eq!(agent.read(0x2000, Width::Byte), None);
        assert!(!agent.write(0x2000, Width::Byte, 0));
    }

    #[test]
    fn test_write_memoization() {
        let dispatcher = test_dispatcher();
        let mut a = MmioAgent::new(dispatcher.clone());
        let mut b = MmioAgent::new(dispatcher.clone());

        assert!(a.write(0x1002, Width::Byte, 0x55));
        assert!(b.write(0x1002, Width::Byte, 0x55));
        // Replaying req_no 0 with different data is an error for the second agent.
        let mut c = MmioAgent::new(dispatcher);
        assert!(!c.write(0x1002, Width::Byte, 0x56));
    }
}
