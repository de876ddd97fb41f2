//! Device block: per-priority rings, free lists and the transmit engine.
//!
//! One lock (`state`) covers every structure shared with the bottom half:
//! message and flow free lists, the send queue, both rings and the waiter
//! counts. Callers that have to wait for a message frame or a flow block give
//! the lock up while they wait so the bottom half can free one.

use std::sync::atomic::{fence, AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::config::RingGeometry;
use crate::error::{DriverError, Result};
use crate::flow::FlowPool;
use crate::hw::RegisterWindow;
use crate::layout::{frame, regs};
use crate::listener::Listeners;
use crate::memory::{copy_from_caller, CallerSpace, PhysicalMemory};
use crate::message::{Frame, ResponseId};
use crate::queue::Fifo;
use crate::request::{CancelToken, InlineBuffer, Pending, Reply, Request, RequestPool};
use crate::ring::{Ring, RingKind};
use crate::Priority;

/// Where a message frame currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    Free,
    CommandRing(u16),
    ResponseRing(u16),
    SendQueue,
    /// Taken by a transmitter or the bottom half and not yet placed.
    Held,
}

#[derive(Debug)]
pub(crate) struct MessageSlot {
    pub(crate) paddr: u64,
    pub(crate) location: Location,
}

/// Physical placement of one priority's rings and frames.
#[derive(Debug, Clone)]
pub struct PriorityLayout {
    pub command_base: u64,
    pub response_base: u64,
    pub frames: Vec<u64>,
}

#[derive(Debug)]
pub(crate) struct DeviceState {
    pub(crate) messages: Vec<MessageSlot>,
    pub(crate) free: Fifo<u16>,
    pub(crate) send_queue: Fifo<u16>,
    pub(crate) command: Ring,
    pub(crate) response: Ring,
    pub(crate) flows: FlowPool,
    pub(crate) message_waiters: usize,
    pub(crate) flow_waiters: usize,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) transmitted: AtomicU64,
    pub(crate) completed: AtomicU64,
    pub(crate) queued: AtomicU64,
    pub(crate) stale_responses: AtomicU64,
    pub(crate) unexpected: AtomicU64,
    pub(crate) error_reports: AtomicU64,
    pub(crate) unsolicited: AtomicU64,
    pub(crate) dispatch_runs: AtomicU64,
}

impl Counters {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Counter snapshot for one priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceStatistics {
    pub transmitted: u64,
    pub completed: u64,
    /// Messages that found the command ring full and went to the send queue.
    pub queued: u64,
    /// Responses dropped for a response-identifier mismatch.
    pub stale_responses: u64,
    pub unexpected: u64,
    pub error_reports: u64,
    pub unsolicited: u64,
    pub dispatch_runs: u64,
}

/// Occupancy snapshot, for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceSnapshot {
    pub free_messages: usize,
    pub send_queue: usize,
    pub command_outstanding: u16,
    pub response_outstanding: u16,
    pub free_flows: usize,
    pub message_waiters: usize,
    pub flow_waiters: usize,
}

pub struct DeviceBlock {
    pub(crate) priority: Priority,
    pub(crate) memory: Arc<dyn PhysicalMemory>,
    pub(crate) registers: Arc<dyn RegisterWindow>,
    pub(crate) caller: Arc<dyn CallerSpace>,
    pub(crate) state: Mutex<DeviceState>,
    pub(crate) message_freed: Condvar,
    pub(crate) flow_freed: Condvar,
    pub(crate) requests: RequestPool,
    pub(crate) listeners: Arc<Listeners>,
    pub(crate) stop: Arc<AtomicBool>,
    pub(crate) poll: Duration,
    pub(crate) counters: Counters,
}

impl std::fmt::Debug for DeviceBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceBlock")
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

impl DeviceBlock {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        priority: Priority,
        geometry: RingGeometry,
        layout: &PriorityLayout,
        memory: Arc<dyn PhysicalMemory>,
        registers: Arc<dyn RegisterWindow>,
        caller: Arc<dyn CallerSpace>,
        listeners: Arc<Listeners>,
        stop: Arc<AtomicBool>,
        poll: Duration,
    ) -> Self {
        debug_assert_eq!(layout.frames.len(), geometry.messages as usize);
        let messages = layout
            .frames
            .iter()
            .map(|paddr| MessageSlot {
                paddr: *paddr,
                location: Location::Free,
            })
            .collect();

        Self {
            priority,
            memory,
            registers,
            caller,
            state: Mutex::new(DeviceState {
                messages,
                free: (0..geometry.messages).collect(),
                send_queue: Fifo::with_capacity(geometry.messages as usize),
                command: Ring::new(RingKind::Command, layout.command_base, geometry.command_len),
                response: Ring::new(RingKind::Response, layout.response_base, geometry.response_len),
                flows: FlowPool::new(geometry.flows),
                message_waiters: 0,
                flow_waiters: 0,
            }),
            message_freed: Condvar::new(),
            flow_freed: Condvar::new(),
            requests: RequestPool::default(),
            listeners,
            stop,
            poll,
            counters: Counters::default(),
        }
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    fn doorbell(&self) -> u32 {
        match self.priority {
            Priority::High => regs::DOORBELL_HIGH,
            Priority::Low => regs::DOORBELL_LOW,
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fills the response ring with free frames so the device has somewhere
    /// to put its first responses.
    pub(crate) fn preload_responses(&self) -> Result<()> {
        let mut st = self.lock();
        while st.response.has_room() {
            let Some(msg) = st.free.dequeue() else {
                break;
            };
            self.insert_response(&mut st, msg)?;
        }
        Ok(())
    }

    /// Command ring insert plus doorbell.
    pub(crate) fn insert_command(&self, st: &mut DeviceState, msg: u16) -> Result<()> {
        let paddr = st.messages[msg as usize].paddr;
        let slot = st.command.insert(&*self.memory, msg, paddr)?;
        self.registers.write32(self.doorbell(), 0);
        fence(Ordering::SeqCst);
        st.messages[msg as usize].location = Location::CommandRing(slot);
        Ok(())
    }

    /// Response ring insert. The device polls the response ring, so there is
    /// no doorbell.
    pub(crate) fn insert_response(&self, st: &mut DeviceState, msg: u16) -> Result<()> {
        let paddr = st.messages[msg as usize].paddr;
        let slot = st.response.insert(&*self.memory, msg, paddr)?;
        st.messages[msg as usize].location = Location::ResponseRing(slot);
        Ok(())
    }

    /// Reclaims command slots the device has released, moving queued
    /// messages into the freed slots. Returns the number of slots reclaimed.
    pub(crate) fn poll_command_ring(&self, st: &mut DeviceState) -> Result<usize> {
        let mut reclaimed = 0;
        while let Some((_, msg)) = st.command.poll(&*self.memory)? {
            reclaimed += 1;
            st.messages[msg as usize].location = Location::Held;
            self.release_message(st, msg)?;
            if let Some(next) = st.send_queue.dequeue() {
                self.insert_command(st, next)?;
            }
        }
        Ok(reclaimed)
    }

    /// Returns a frame to circulation: into the response ring when it has
    /// room, otherwise onto the free queue, waking one blocked transmitter.
    pub(crate) fn release_message(&self, st: &mut DeviceState, msg: u16) -> Result<()> {
        if st.response.has_room() {
            return self.insert_response(st, msg);
        }
        st.messages[msg as usize].location = Location::Free;
        st.free.enqueue(msg);
        if st.message_waiters > 0 {
            self.message_freed.notify_one();
        }
        Ok(())
    }

    /// Queues `msg` for the device, going through the send queue when the
    /// command ring is full.
    pub(crate) fn send_to_device(&self, st: &mut DeviceState, msg: u16) -> Result<()> {
        if st.command.has_room() && st.send_queue.is_empty() {
            return self.insert_command(st, msg);
        }
        st.messages[msg as usize].location = Location::SendQueue;
        st.send_queue.enqueue(msg);
        Counters::bump(&self.counters.queued);
        // The frame is committed; a failed reclaim only delays it.
        if let Err(err) = self.poll_command_ring(st) {
            tracing::warn!(priority = ?self.priority, "command ring reclaim failed: {err}");
        }
        Ok(())
    }

    fn obtain_message<'a>(
        &'a self,
        mut st: MutexGuard<'a, DeviceState>,
        cancel: &CancelToken,
    ) -> (MutexGuard<'a, DeviceState>, Result<u16>) {
        loop {
            if self.stop.load(Ordering::SeqCst) {
                return (st, Err(DriverError::ShutDown));
            }
            if let Some(msg) = st.free.dequeue() {
                st.messages[msg as usize].location = Location::Held;
                return (st, Ok(msg));
            }
            if let Err(err) = self.poll_command_ring(&mut st) {
                return (st, Err(err));
            }
            if let Some(msg) = st.free.dequeue() {
                st.messages[msg as usize].location = Location::Held;
                return (st, Ok(msg));
            }
            if cancel.is_cancelled() {
                return (st, Err(DriverError::Interrupted));
            }

            st.message_waiters += 1;
            st = self
                .message_freed
                .wait_timeout(st, self.poll)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
            st.message_waiters -= 1;
        }
    }

    fn obtain_flow<'a>(
        &'a self,
        mut st: MutexGuard<'a, DeviceState>,
        mut pending: Pending,
        cancel: &CancelToken,
    ) -> (MutexGuard<'a, DeviceState>, Result<ResponseId>) {
        loop {
            if self.stop.load(Ordering::SeqCst) {
                return (st, Err(DriverError::ShutDown));
            }
            match st.flows.acquire(pending) {
                Ok(rspid) => return (st, Ok(rspid)),
                Err(back) => pending = back,
            }
            if cancel.is_cancelled() {
                return (st, Err(DriverError::Interrupted));
            }

            st.flow_waiters += 1;
            st = self
                .flow_freed
                .wait_timeout(st, self.poll)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
            st.flow_waiters -= 1;
        }
    }

    /// Copies the request's outbound payload out of its address space before
    /// any lock is taken.
    fn stage_payload(&self, request: &Request) -> Result<Vec<u8>> {
        let len = request.inline.len();
        if len > frame::PAYLOAD_CAPACITY {
            return Err(DriverError::PayloadTooLarge {
                len,
                capacity: frame::PAYLOAD_CAPACITY,
            });
        }
        if request.is_bus_master_read() {
            return Ok(Vec::new());
        }
        match &request.inline {
            InlineBuffer::None => Ok(Vec::new()),
            InlineBuffer::Driver(bytes) => Ok(bytes.clone()),
            InlineBuffer::Caller { vaddr, len } => {
                let mut bytes = vec![0u8; *len];
                copy_from_caller(&*self.caller, &*self.memory, *vaddr, &mut bytes)?;
                Ok(bytes)
            }
        }
    }

    /// Builds a frame for `request` and hands it to the device. Returns the
    /// response identifier the reply must carry.
    ///
    /// Every error path returns the frame and the flow block it took. A
    /// request whose previous transmit was abandoned waits here until that
    /// reply has landed, so it can never be mistaken for this one's.
    pub fn transmit(&self, request: &Request, cancel: &CancelToken) -> Result<ResponseId> {
        cancel.check()?;
        request
            .completion
            .wait_released(cancel, &self.stop, self.poll)?;
        let payload = self.stage_payload(request)?;

        let st = self.lock();
        let (st, msg) = self.obtain_message(st, cancel);
        let msg = match msg {
            Ok(msg) => msg,
            Err(err) => return Err(err),
        };

        let (mut st, rspid) = self.obtain_flow(st, request.pending(), cancel);
        let rspid = match rspid {
            Ok(rspid) => rspid,
            Err(err) => {
                if let Err(release_err) = self.release_message(&mut st, msg) {
                    tracing::error!(priority = ?self.priority, "failed to return frame: {release_err}");
                }
                return Err(err);
            }
        };

        let frame = Frame {
            opcode: request.opcode_word().encode(),
            rspid: rspid.to_bits(),
            exec_status: 0,
            dma_size: request.dma.size,
            dma_offset: request.dma.offset,
            dma_addr: request.dma.addr,
            payload_size: request.inline.len() as u32,
            payload,
        };
        let paddr = st.messages[msg as usize].paddr;
        let sent = frame
            .write_to(&*self.memory, paddr)
            .map_err(DriverError::from)
            .and_then(|()| self.send_to_device(&mut st, msg));
        if let Err(err) = sent {
            // Only a frame that never reached the device gives its flow back.
            if st.messages[msg as usize].location == Location::Held {
                st.flows.release(rspid);
                if let Err(release_err) = self.release_message(&mut st, msg) {
                    tracing::error!(priority = ?self.priority, "failed to return frame: {release_err}");
                }
            }
            return Err(err);
        }

        Counters::bump(&self.counters.transmitted);
        tracing::trace!(
            priority = ?self.priority,
            index = rspid.index,
            use_count = rspid.use_count,
            opcode = frame.opcode,
            "transmitted"
        );
        Ok(rspid)
    }

    /// [`DeviceBlock::transmit`] and wait for the reply. A nonzero execution
    /// status from the device becomes [`DriverError::CommunicationError`].
    pub fn transmit_and_wait(&self, request: &Request, cancel: &CancelToken) -> Result<Reply> {
        self.transmit(request, cancel)?;
        let reply = request.completion.wait(cancel, &self.stop, self.poll)?;
        if reply.exec_status != 0 {
            return Err(DriverError::CommunicationError {
                exec_status: reply.exec_status,
            });
        }
        Ok(reply)
    }

    /// A request whose completion primitive comes from this block's free list.
    pub fn alloc_request(&self, opcode: crate::message::Opcode) -> Request {
        self.requests.alloc(opcode)
    }

    pub fn free_request(&self, request: Request) {
        self.requests.free(request);
    }

    pub fn statistics(&self) -> DeviceStatistics {
        let c = &self.counters;
        let load = |v: &AtomicU64| v.load(Ordering::Relaxed);
        DeviceStatistics {
            transmitted: load(&c.transmitted),
            completed: load(&c.completed),
            queued: load(&c.queued),
            stale_responses: load(&c.stale_responses),
            unexpected: load(&c.unexpected),
            error_reports: load(&c.error_reports),
            unsolicited: load(&c.unsolicited),
            dispatch_runs: load(&c.dispatch_runs),
        }
    }

    pub fn snapshot(&self) -> DeviceSnapshot {
        let st = self.lock();
        DeviceSnapshot {
            free_messages: st.free.len(),
            send_queue: st.send_queue.len(),
            command_outstanding: st.command.outstanding(),
            response_outstanding: st.response.outstanding(),
            free_flows: st.flows.available(),
            message_waiters: st.message_waiters,
            flow_waiters: st.flow_waiters,
        }
    }

    /// Checks that every frame sits in exactly one place and that each place
    /// agrees with the frame's recorded location. A frame is held outside
    /// every queue and ring only by a transmitter waiting for a flow block.
    pub fn check_invariants(&self) -> std::result::Result<(), String> {
        let st = self.lock();
        let n = st.messages.len();
        let mut seen = vec![None::<Location>; n];

        let mut claim = |msg: u16, loc: Location| -> std::result::Result<(), String> {
            let slot = seen
                .get_mut(msg as usize)
                .ok_or_else(|| format!("message {msg} out of range"))?;
            if let Some(prev) = slot {
                return Err(format!("message {msg} in both {prev:?} and {loc:?}"));
            }
            *slot = Some(loc);
            Ok(())
        };

        for msg in st.free.iter() {
            claim(*msg, Location::Free)?;
        }
        for msg in st.send_queue.iter() {
            claim(*msg, Location::SendQueue)?;
        }
        for (slot, msg) in st.command.iter_outstanding() {
            claim(msg, Location::CommandRing(slot))?;
        }
        for (slot, msg) in st.response.iter_outstanding() {
            claim(msg, Location::ResponseRing(slot))?;
        }

        if st.command.outstanding() > st.command.len() || st.response.outstanding() > st.response.len() {
            return Err("ring outstanding count exceeds its length".into());
        }

        let held = st
            .messages
            .iter()
            .filter(|m| m.location == Location::Held)
            .count();
        if held != st.flow_waiters {
            return Err(format!(
                "{held} frames held but {} transmitters waiting for a flow",
                st.flow_waiters
            ));
        }

        for (msg, found) in seen.iter().enumerate() {
            let recorded = st.messages[msg].location;
            match found {
                Some(loc) if *loc != recorded => {
                    return Err(format!(
                        "message {msg} recorded at {recorded:?} but found in {loc:?}"
                    ))
                }
                None if recorded != Location::Held => {
                    return Err(format!("message {msg} recorded at {recorded:?} but found nowhere"))
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Wakes every blocked caller; they observe the stop flag and return.
    pub(crate) fn wake_all(&self) {
        let mut st = self.lock();
        for completion in st.flows.drain() {
            completion.wake();
        }
        self.message_freed.notify_all();
        self.flow_freed.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{DmaRegion, MemoryError, SharedRam};
    use crate::message::Opcode;
    use crate::sim::SimCallerSpace;

    const COMMAND_BASE: u64 = 0x100;
    const RESPONSE_BASE: u64 = 0x200;
    const FRAME_BASE: u64 = 0x1000;
    const RAM_BYTES: usize = 0x10000;

    /// RAM that fails any access covering an armed address.
    struct FlakyRam {
        inner: SharedRam,
        fail_read: Mutex<Option<u64>>,
        fail_write: Mutex<Option<u64>>,
    }

    impl FlakyRam {
        fn new() -> Self {
            Self {
                inner: SharedRam::new(RAM_BYTES),
                fail_read: Mutex::new(None),
                fail_write: Mutex::new(None),
            }
        }

        fn check(
            armed: &Mutex<Option<u64>>,
            paddr: u64,
            len: usize,
        ) -> std::result::Result<(), MemoryError> {
            match *armed.lock().unwrap() {
                Some(addr) if (paddr..paddr + len as u64).contains(&addr) => {
                    Err(MemoryError::OutOfRange { paddr, len, size: RAM_BYTES as u64 })
                }
                _ => Ok(()),
            }
        }
    }

    impl PhysicalMemory for FlakyRam {
        fn size(&self) -> u64 {
            self.inner.size()
        }

        fn read(&self, paddr: u64, buf: &mut [u8]) -> std::result::Result<(), MemoryError> {
            Self::check(&self.fail_read, paddr, buf.len())?;
            self.inner.read(paddr, buf)
        }

        fn write(&self, paddr: u64, buf: &[u8]) -> std::result::Result<(), MemoryError> {
            Self::check(&self.fail_write, paddr, buf.len())?;
            self.inner.write(paddr, buf)
        }
    }

    struct NullRegisters;

    impl RegisterWindow for NullRegisters {
        fn read32(&self, _offset: u32) -> u32 {
            0
        }

        fn write32(&self, _offset: u32, _value: u32) {}
    }

    fn block(ram: &Arc<FlakyRam>) -> DeviceBlock {
        let geometry = RingGeometry {
            command_len: 1,
            response_len: 1,
            messages: 4,
            flows: 4,
        };
        let layout = PriorityLayout {
            command_base: COMMAND_BASE,
            response_base: RESPONSE_BASE,
            frames: (0..4).map(|i| FRAME_BASE * (i + 1)).collect(),
        };
        let memory: Arc<dyn PhysicalMemory> = ram.clone();
        let caller = SimCallerSpace::new(
            Arc::clone(&memory),
            DmaRegion { base: 0x8000, len: 0x4000 },
            512,
        );
        DeviceBlock::new(
            Priority::High,
            geometry,
            &layout,
            memory,
            Arc::new(NullRegisters),
            Arc::new(caller),
            Arc::new(Listeners::default()),
            Arc::new(AtomicBool::new(false)),
            Duration::from_millis(1),
        )
    }

    #[test]
    fn queued_frame_keeps_its_flow_when_reclaim_fails() {
        let ram = Arc::new(FlakyRam::new());
        let device = block(&ram);
        let cancel = CancelToken::new();

        let first = Request::new(Opcode::DiagnosticLocal);
        device.transmit(&first, &cancel).unwrap();
        assert_eq!(device.snapshot().command_outstanding, 1);

        *ram.fail_read.lock().unwrap() = Some(COMMAND_BASE);
        let second = Request::new(Opcode::DiagnosticLocal);
        let rspid = device.transmit(&second, &cancel).unwrap();

        let snap = device.snapshot();
        assert_eq!(snap.send_queue, 1);
        assert_eq!(snap.free_messages, 2);
        assert_eq!(snap.free_flows, 2);
        assert!(device.lock().flows.is_bound(rspid.index));
        assert_eq!(device.statistics().transmitted, 2);
        device.check_invariants().unwrap();
    }

    #[test]
    fn unwritten_frame_returns_frame_and_flow() {
        let ram = Arc::new(FlakyRam::new());
        let device = block(&ram);

        *ram.fail_write.lock().unwrap() = Some(FRAME_BASE);
        let request = Request::new(Opcode::DiagnosticLocal);
        assert!(matches!(
            device.transmit(&request, &CancelToken::new()),
            Err(DriverError::Memory(_))
        ));

        let snap = device.snapshot();
        assert_eq!(snap.free_flows, 4);
        assert_eq!(snap.free_messages, 3);
        assert_eq!(snap.response_outstanding, 1);
        assert_eq!(snap.command_outstanding, 0);
        assert_eq!(device.statistics().transmitted, 0);
        device.check_invariants().unwrap();
    }

    #[test]
    fn frame_held_without_a_flow_waiter_is_reported() {
        let ram = Arc::new(FlakyRam::new());
        let device = block(&ram);
        {
            let mut st = device.lock();
            let msg = st.free.dequeue().unwrap();
            st.messages[msg as usize].location = Location::Held;
        }
        assert!(device.check_invariants().is_err());

        device.lock().flow_waiters = 1;
        device.check_invariants().unwrap();
    }
}
