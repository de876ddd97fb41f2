//! Emulated PCIL coprocessor and remote front-end controller.
//!
//! Register accesses are handled synchronously on the caller's thread. A
//! device thread does everything the real controller does asynchronously:
//! it consumes device-owned command slots, executes them, fills
//! device-owned response slots and raises the per-priority interrupt.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{fence, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use pcil_camac::decode_packet;

use super::crate_model::CrateModel;
use crate::channel::diag;
use crate::hw::{InterruptHandler, InterruptLine, RegisterWindow};
use crate::layout::{
    comm, frame, regs, BOOT_ASSERT, CMD_GO, COMM_MAGIC, INT_HIGH, INT_LOW, RING_ELEMENT_BYTES,
    RING_M_ADDR, RING_OWN, SELF_TEST_PASSED, STEP_HOST_ACK, STEP_RESET, STEP_RUNNING, VAM_TAG,
};
use crate::memory::{MemoryError, PhysicalMemory};
use crate::message::{Frame, Opcode, OpcodeWord, OpFlags};
use crate::vam::resolve;
use crate::Priority;

/// Execution status for an opcode the controller does not implement.
pub const EXEC_BAD_OPCODE: u32 = 0x0000_0010;
/// The inline CAMAC packet could not be decoded.
pub const EXEC_BAD_PACKET: u32 = 0x0000_0011;
/// A DMA address did not resolve.
pub const EXEC_DMA_FAULT: u32 = 0x0000_0012;
pub const EXEC_BAD_FUNCTION: u32 = 0x0000_0013;

/// Self-test value reported when a failure is forced.
pub const SELF_TEST_FAILED: u32 = 0x0000_0BAD;

pub const VERSION: &[u8] = b"FECC-SIM 1.0";
pub const REMOTE_MEMORY_BYTES: usize = 64 * 1024;

const TICK: Duration = Duration::from_millis(1);

/// Application message received from the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub priority: Priority,
    pub pattern: bool,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy)]
struct Cursor {
    base: u64,
    mask: u32,
    next: u32,
}

impl Cursor {
    fn new(base: u64, len: u32) -> Self {
        Self {
            base,
            mask: len.saturating_sub(1),
            next: 0,
        }
    }

    fn slot_addr(&self) -> u64 {
        self.base + (self.next & self.mask) as u64 * RING_ELEMENT_BYTES
    }
}

#[derive(Debug)]
struct Port {
    command: Cursor,
    response: Cursor,
    outbox: VecDeque<Frame>,
    commands: u32,
    responses: u32,
}

#[derive(Debug, Default)]
struct Hooks {
    fail_self_test: bool,
    corrupt_echo: bool,
    stall_handshake: bool,
    hold_commands: bool,
    fail_next: Option<u32>,
}

#[derive(Debug)]
struct FeccState {
    self_test: u32,
    step: u32,
    comm_area: u32,
    echo: u32,
    page_table_base: u32,
    page_shift: u32,
    interrupt_pending: u32,
    raise: bool,
    work: bool,
    stop: bool,
    running: bool,
    firmware_addr: u32,
    firmware_len: u32,
    firmware: HashMap<u32, Vec<u8>>,
    boots: u32,
    ports: [Option<Port>; 2],
    hooks: Hooks,
    crates: CrateModel,
    remote_memory: Vec<u8>,
    received: Vec<ReceivedMessage>,
    to_host: VecDeque<Vec<u8>>,
    loaded_registers: Vec<u32>,
    acknowledgements: usize,
    ticks: u64,
}

impl FeccState {
    fn new() -> Self {
        Self {
            self_test: 0,
            step: STEP_RESET,
            comm_area: 0,
            echo: 0,
            page_table_base: 0,
            page_shift: 12,
            interrupt_pending: 0,
            raise: false,
            work: false,
            stop: false,
            running: false,
            firmware_addr: 0,
            firmware_len: 0,
            firmware: HashMap::new(),
            boots: 0,
            ports: [None, None],
            hooks: Hooks::default(),
            crates: CrateModel::new(),
            remote_memory: vec![0; REMOTE_MEMORY_BYTES],
            received: Vec::new(),
            to_host: VecDeque::new(),
            loaded_registers: Vec::new(),
            acknowledgements: 0,
            ticks: 0,
        }
    }
}

fn port_index(priority: Priority) -> usize {
    match priority {
        Priority::High => 0,
        Priority::Low => 1,
    }
}

fn port_priority(index: usize) -> Priority {
    if index == 0 {
        Priority::High
    } else {
        Priority::Low
    }
}

fn interrupt_bit(index: usize) -> u32 {
    if index == 0 {
        INT_HIGH
    } else {
        INT_LOW
    }
}

struct Shared {
    memory: Arc<dyn PhysicalMemory>,
    state: Mutex<FeccState>,
    wake: Condvar,
    handler: Mutex<Option<InterruptHandler>>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, FeccState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn kick(&self, st: &mut FeccState) {
        st.work = true;
        self.wake.notify_all();
    }
}

pub struct Fecc {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Fecc {
    pub fn start(memory: Arc<dyn PhysicalMemory>) -> std::io::Result<Arc<Self>> {
        let shared = Arc::new(Shared {
            memory,
            state: Mutex::new(FeccState::new()),
            wake: Condvar::new(),
            handler: Mutex::new(None),
        });
        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("fecc-sim".into())
            .spawn(move || run(&worker_shared))?;
        Ok(Arc::new(Self {
            shared,
            worker: Mutex::new(Some(worker)),
        }))
    }

    /// Stops the device thread. Register accesses keep working.
    pub fn stop(&self) {
        {
            let mut st = self.shared.lock();
            st.stop = true;
            self.shared.wake.notify_all();
        }
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            let _ = worker.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.lock().running
    }

    pub fn boots(&self) -> u32 {
        self.shared.lock().boots
    }

    pub fn page_table_base(&self) -> u32 {
        self.shared.lock().page_table_base
    }

    /// Stops consuming command slots. Responses already queued, and injected
    /// ones, are still delivered.
    pub fn pause(&self) {
        self.shared.lock().hooks.hold_commands = true;
    }

    pub fn resume(&self) {
        let mut st = self.shared.lock();
        st.hooks.hold_commands = false;
        self.shared.kick(&mut st);
    }

    /// Next boot reports a failed self-test.
    pub fn fail_self_test(&self, fail: bool) {
        self.shared.lock().hooks.fail_self_test = fail;
    }

    /// Echo a wrong communication area address.
    pub fn corrupt_echo(&self, corrupt: bool) {
        self.shared.lock().hooks.corrupt_echo = corrupt;
    }

    /// Never acknowledge the communication area address.
    pub fn stall_handshake(&self, stall: bool) {
        self.shared.lock().hooks.stall_handshake = stall;
    }

    /// The next reply carries `exec_status`.
    pub fn fail_next_reply(&self, exec_status: u32) {
        self.shared.lock().hooks.fail_next = Some(exec_status);
    }

    pub fn inject_unsolicited(&self, priority: Priority, listener: u32, payload: Vec<u8>) {
        self.inject_response(
            priority,
            Frame {
                opcode: OpcodeWord::new(Opcode::SendFromRemote).encode(),
                rspid: listener,
                payload_size: payload.len() as u32,
                payload,
                ..Frame::default()
            },
        );
    }

    pub fn inject_error_report(&self, priority: Priority, status: u32) {
        self.inject_response(
            priority,
            Frame {
                opcode: OpcodeWord::new(Opcode::ErrorReport).encode(),
                exec_status: status,
                ..Frame::default()
            },
        );
    }

    /// Queues an arbitrary frame for the host's response ring.
    pub fn inject_response(&self, priority: Priority, frame: Frame) {
        let mut st = self.shared.lock();
        if let Some(port) = st.ports[port_index(priority)].as_mut() {
            port.outbox.push_back(frame);
        }
        self.shared.kick(&mut st);
    }

    /// Queues a message for the host's receive channels.
    pub fn queue_for_host(&self, payload: Vec<u8>) {
        self.shared.lock().to_host.push_back(payload);
    }

    pub fn received(&self) -> Vec<ReceivedMessage> {
        self.shared.lock().received.clone()
    }

    pub fn acknowledgements(&self) -> usize {
        self.shared.lock().acknowledgements
    }

    pub fn loaded_registers(&self) -> Vec<u32> {
        self.shared.lock().loaded_registers.clone()
    }

    pub fn firmware(&self, target: u32) -> Option<Vec<u8>> {
        self.shared.lock().firmware.get(&target).cloned()
    }

    pub fn remote_memory(&self, offset: usize, len: usize) -> Vec<u8> {
        let st = self.shared.lock();
        st.remote_memory
            .get(offset..offset + len)
            .map(<[u8]>::to_vec)
            .unwrap_or_default()
    }

    pub fn with_crates<R>(&self, f: impl FnOnce(&mut CrateModel) -> R) -> R {
        f(&mut self.shared.lock().crates)
    }

    /// Commands consumed on `priority` since "go".
    pub fn commands(&self, priority: Priority) -> u32 {
        self.shared.lock().ports[port_index(priority)]
            .as_ref()
            .map_or(0, |port| port.commands)
    }
}

impl Drop for Fecc {
    fn drop(&mut self) {
        self.stop();
    }
}

impl RegisterWindow for Fecc {
    fn read32(&self, offset: u32) -> u32 {
        let st = self.shared.lock();
        match offset {
            regs::SELF_TEST => st.self_test,
            regs::COMM_AREA => st.comm_area,
            regs::PROTOCOL_STEP => st.step,
            regs::ECHO => st.echo,
            regs::PAGE_TABLE_BASE => st.page_table_base,
            regs::INTERRUPT_TYPE => st.interrupt_pending,
            _ => 0,
        }
    }

    fn write32(&self, offset: u32, value: u32) {
        let mut st = self.shared.lock();
        match offset {
            regs::BOOT_CONTROL if value == BOOT_ASSERT => {
                st.boots += 1;
                st.running = false;
                st.ports = [None, None];
                st.step = STEP_RESET;
                st.interrupt_pending = 0;
                st.self_test = if st.hooks.fail_self_test {
                    SELF_TEST_FAILED
                } else {
                    SELF_TEST_PASSED
                };
            }
            regs::COMM_AREA => {
                st.comm_area = value;
                if !st.hooks.stall_handshake {
                    st.echo = if st.hooks.corrupt_echo { !value } else { value };
                    st.step = STEP_HOST_ACK;
                }
            }
            regs::PAGE_TABLE_BASE => st.page_table_base = value,
            regs::COMMAND if value == CMD_GO => {
                if st.step != STEP_HOST_ACK {
                    tracing::warn!(step = st.step, "go before the communication area was latched");
                    return;
                }
                match read_comm_area(&*self.shared.memory, st.comm_area as u64) {
                    Ok(Some((ports, page_shift))) => {
                        st.ports = ports.map(Some);
                        st.page_shift = page_shift;
                        st.step = STEP_RUNNING;
                        st.running = true;
                        st.interrupt_pending |= INT_LOW;
                        st.raise = true;
                        self.shared.kick(&mut st);
                    }
                    Ok(None) => tracing::warn!("communication area has a bad magic"),
                    Err(err) => tracing::warn!("communication area unreadable: {err}"),
                }
            }
            regs::DOORBELL_HIGH | regs::DOORBELL_LOW => self.shared.kick(&mut st),
            regs::INTERRUPT_ACK_HIGH | regs::INTERRUPT_ACK_LOW => st.interrupt_pending &= !value,
            regs::FIRMWARE_ADDR => st.firmware_addr = value,
            regs::FIRMWARE_LEN => st.firmware_len = value,
            regs::FIRMWARE_LOAD => {
                let mut image = vec![0u8; st.firmware_len as usize];
                match self.shared.memory.read(st.firmware_addr as u64, &mut image) {
                    Ok(()) => {
                        st.firmware.insert(value, image);
                    }
                    Err(err) => tracing::warn!(target = value, "firmware image unreadable: {err}"),
                }
            }
            _ => {}
        }
    }
}

impl InterruptLine for Fecc {
    fn attach(&self, handler: InterruptHandler) {
        *self
            .shared
            .handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    fn detach(&self) {
        self.shared
            .handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

type CommPorts = ([Port; 2], u32);

fn read_comm_area(
    memory: &dyn PhysicalMemory,
    base: u64,
) -> std::result::Result<Option<CommPorts>, MemoryError> {
    if memory.read_u32(base + comm::MAGIC)? != COMM_MAGIC {
        return Ok(None);
    }
    let port = |i: u64| -> std::result::Result<Port, MemoryError> {
        let block = base + comm::PRIORITY_BASE + i * comm::PRIORITY_BYTES;
        Ok(Port {
            command: Cursor::new(
                memory.read_u32(block + comm::CMD_BASE)? as u64,
                memory.read_u32(block + comm::CMD_LEN)?,
            ),
            response: Cursor::new(
                memory.read_u32(block + comm::RSP_BASE)? as u64,
                memory.read_u32(block + comm::RSP_LEN)?,
            ),
            outbox: VecDeque::new(),
            commands: 0,
            responses: 0,
        })
    };
    let ports = [port(0)?, port(1)?];
    let page_shift = memory.read_u32(base + comm::PAGE_SHIFT)?;
    Ok(Some((ports, page_shift)))
}

fn run(shared: &Shared) {
    loop {
        let handler = {
            let mut st = shared.lock();
            if !st.work && !st.stop {
                st = shared
                    .wake
                    .wait_timeout(st, TICK)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
            }
            if st.stop {
                break;
            }
            st.work = false;
            st.ticks += 1;
            if st.running {
                for index in 0..2 {
                    if let Err(err) = service(&*shared.memory, &mut st, index) {
                        tracing::warn!(priority = ?port_priority(index), "device ring access failed: {err}");
                    }
                }
            }
            if st.raise {
                st.raise = false;
                shared
                    .handler
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone()
            } else {
                None
            }
        };
        if let Some(handler) = handler {
            handler();
        }
    }
}

fn service(
    memory: &dyn PhysicalMemory,
    st: &mut FeccState,
    index: usize,
) -> std::result::Result<(), MemoryError> {
    let mut consumed = false;
    while !st.hooks.hold_commands {
        let Some(port) = st.ports[index].as_ref() else {
            return Ok(());
        };
        let slot = port.command.slot_addr();
        let word = memory.read_u32(slot)?;
        if word & RING_OWN == 0 {
            break;
        }
        fence(Ordering::SeqCst);
        let request = Frame::read_from(memory, (word & RING_M_ADDR) as u64)?;
        let reply = execute(memory, st, index, request);
        memory.write_u32(slot, word & !RING_OWN)?;
        consumed = true;

        if let Some(port) = st.ports[index].as_mut() {
            port.command.next = port.command.next.wrapping_add(1);
            port.commands += 1;
            if let Some(reply) = reply {
                port.outbox.push_back(reply);
            }
        }
    }

    let Some(port) = st.ports[index].as_mut() else {
        return Ok(());
    };
    let mut delivered = false;
    while !port.outbox.is_empty() {
        let slot = port.response.slot_addr();
        let word = memory.read_u32(slot)?;
        if word & RING_OWN == 0 {
            break;
        }
        let Some(reply) = port.outbox.pop_front() else {
            break;
        };
        reply.write_to(memory, (word & RING_M_ADDR) as u64)?;
        fence(Ordering::SeqCst);
        memory.write_u32(slot, word & !RING_OWN)?;
        port.response.next = port.response.next.wrapping_add(1);
        port.responses += 1;
        delivered = true;
    }
    // Command progress interrupts too, so the host can reclaim frames.
    if delivered || consumed {
        st.interrupt_pending |= interrupt_bit(index);
        st.raise = true;
    }
    Ok(())
}

/// Runs one command frame and builds its reply, if it gets one.
fn execute(
    memory: &dyn PhysicalMemory,
    st: &mut FeccState,
    index: usize,
    request: Frame,
) -> Option<Frame> {
    let word = match OpcodeWord::decode(request.opcode) {
        Ok(word) => word,
        Err(raw) => {
            tracing::debug!(opcode = format_args!("0x{raw:08x}"), "unknown opcode");
            return Some(error_report(EXEC_BAD_OPCODE));
        }
    };
    let echo_flags = word.flags & (OpFlags::BM_READ | OpFlags::PATTERN);
    let requested = request.payload_size as usize;

    let (flags, outcome) = match word.opcode {
        Opcode::SendFromRemote if word.is_remote_complete() => {
            st.acknowledgements += 1;
            return None;
        }
        Opcode::SendFromRemote | Opcode::ErrorReport => {
            return Some(error_report(EXEC_BAD_OPCODE));
        }
        Opcode::DiagnosticLocal => (echo_flags, diagnostic_local(st, word.function, &request)),
        Opcode::DiagnosticRemote => (
            echo_flags | OpFlags::REMOTE_COMPLETE,
            diagnostic_remote(st, word.function, &request),
        ),
        Opcode::SendToRemote if word.flags.contains(OpFlags::BM_READ) => {
            let mut payload = st.to_host.pop_front().unwrap_or_default();
            payload.truncate(requested);
            (echo_flags | OpFlags::REMOTE_COMPLETE, Ok(payload))
        }
        Opcode::SendToRemote => {
            st.received.push(ReceivedMessage {
                priority: port_priority(index),
                pattern: word.flags.contains(OpFlags::PATTERN),
                payload: request.payload.clone(),
            });
            (echo_flags | OpFlags::REMOTE_COMPLETE, Ok(Vec::new()))
        }
        Opcode::EmulateLegacy => (
            echo_flags | OpFlags::REMOTE_COMPLETE,
            Ok(request.payload.clone()),
        ),
        Opcode::RemoteMemoryAccess => (
            echo_flags | OpFlags::REMOTE_COMPLETE,
            remote_memory(st, &request, word.flags.contains(OpFlags::BM_READ)),
        ),
        Opcode::BusMasterEmulate if word.flags.contains(OpFlags::BM_READ) => {
            let len = requested.min(frame::PAYLOAD_CAPACITY);
            let mut payload = vec![0u8; len];
            let dma = Dma::new(memory, st);
            let result = dma
                .transfer(request.dma_addr, len, |paddr, range| {
                    memory.read(paddr, &mut payload[range])
                })
                .map(|()| payload.clone());
            (echo_flags | OpFlags::REMOTE_COMPLETE, result)
        }
        Opcode::BusMasterEmulate => (
            echo_flags | OpFlags::REMOTE_COMPLETE,
            run_package(memory, st, &request).map(|()| Vec::new()),
        ),
    };

    let (exec_status, payload) = match outcome {
        Ok(payload) => (st.hooks.fail_next.take().unwrap_or(0), payload),
        Err(status) => (status, Vec::new()),
    };
    Some(Frame {
        opcode: OpcodeWord::new(word.opcode)
            .with_flags(flags)
            .with_function(word.function)
            .encode(),
        rspid: request.rspid,
        exec_status,
        payload_size: payload.len() as u32,
        payload,
        ..Frame::default()
    })
}

fn error_report(status: u32) -> Frame {
    Frame {
        opcode: OpcodeWord::new(Opcode::ErrorReport).encode(),
        exec_status: status,
        ..Frame::default()
    }
}

fn fit(mut payload: Vec<u8>, requested: usize) -> Vec<u8> {
    if requested > 0 {
        payload.truncate(requested);
    }
    payload
}

fn diagnostic_local(st: &mut FeccState, function: u8, request: &Frame) -> Result<Vec<u8>, u32> {
    let requested = request.payload_size as usize;
    match function {
        diag::COUNTER_READ => {
            let mut out = Vec::with_capacity(8);
            for port in &st.ports {
                let commands = port.as_ref().map_or(0, |p| p.commands);
                out.extend_from_slice(&commands.to_le_bytes());
            }
            Ok(fit(out, requested))
        }
        diag::REGISTER_LOAD => {
            st.loaded_registers.extend(
                request
                    .payload
                    .chunks_exact(4)
                    .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]])),
            );
            Ok(Vec::new())
        }
        diag::VERSION_READ => Ok(fit(VERSION.to_vec(), requested)),
        _ => Err(EXEC_BAD_FUNCTION),
    }
}

fn diagnostic_remote(st: &mut FeccState, function: u8, request: &Frame) -> Result<Vec<u8>, u32> {
    let requested = request.payload_size as usize;
    match function {
        diag::MEMORY_DUMP => remote_memory(st, request, true),
        diag::MEMORY_LOAD => remote_memory(st, request, false),
        diag::CPU_STATS_READ => {
            let busy: u32 = st.ports.iter().flatten().map(|p| p.commands).sum();
            let mut out = busy.to_le_bytes().to_vec();
            out.extend_from_slice(&(st.ticks as u32).to_le_bytes());
            Ok(fit(out, requested))
        }
        diag::LINK_COUNTERS_READ => {
            let rx: u32 = st.ports.iter().flatten().map(|p| p.commands).sum();
            let tx: u32 = st.ports.iter().flatten().map(|p| p.responses).sum();
            let mut out = Vec::with_capacity(16);
            for counter in [rx, tx, 0, 0] {
                out.extend_from_slice(&counter.to_le_bytes());
            }
            Ok(fit(out, requested))
        }
        _ => Err(EXEC_BAD_FUNCTION),
    }
}

/// Reads or writes the remote controller's memory at the frame's DMA offset.
fn remote_memory(st: &mut FeccState, request: &Frame, read: bool) -> Result<Vec<u8>, u32> {
    let offset = request.dma_offset as usize;
    let len = if read {
        request.payload_size as usize
    } else {
        request.payload.len()
    };
    let range = offset..offset + len;
    if range.end > st.remote_memory.len() {
        return Err(EXEC_DMA_FAULT);
    }
    if read {
        Ok(st.remote_memory[range].to_vec())
    } else {
        st.remote_memory[range].copy_from_slice(&request.payload);
        Ok(Vec::new())
    }
}

fn run_package(memory: &dyn PhysicalMemory, st: &mut FeccState, request: &Frame) -> Result<(), u32> {
    let packet = decode_packet(&request.payload).map_err(|_| EXEC_BAD_PACKET)?;
    if packet.region_len > request.dma_size as usize {
        return Err(EXEC_BAD_PACKET);
    }

    let dma = Dma::new(memory, st);
    let mut region = vec![0u8; packet.region_len];
    dma.transfer(request.dma_addr, region.len(), |paddr, range| {
        memory.read(paddr, &mut region[range])
    })?;

    for op in &packet.ops {
        let data = op.data_offset()..op.data_offset() + op.bcnt as usize;
        let status = st.crates.execute(op.ctlw, &mut region[data]);
        let cstat = op.region_offset as usize;
        region[cstat..cstat + 4].copy_from_slice(&status.bits().to_le_bytes());
    }

    dma.transfer(request.dma_addr, region.len(), |paddr, range| {
        memory.write(paddr, &region[range])
    })
}

/// Device-side DMA through the published address map.
struct Dma<'a> {
    memory: &'a dyn PhysicalMemory,
    table: u64,
    page_shift: u32,
}

impl<'a> Dma<'a> {
    fn new(memory: &'a dyn PhysicalMemory, st: &FeccState) -> Self {
        Self {
            memory,
            table: st.page_table_base as u64,
            page_shift: st.page_shift,
        }
    }

    fn transfer(
        &self,
        addr: u64,
        len: usize,
        mut f: impl FnMut(u64, std::ops::Range<usize>) -> std::result::Result<(), MemoryError>,
    ) -> Result<(), u32> {
        if addr & VAM_TAG == 0 {
            return f(addr, 0..len).map_err(|_| EXEC_DMA_FAULT);
        }
        let page = 1u64 << self.page_shift;
        let mut done = 0usize;
        while done < len {
            let at = addr + done as u64;
            let chunk = ((page - (at & (page - 1))) as usize).min(len - done);
            let paddr = resolve(self.memory, self.table, self.page_shift, at)
                .map_err(|_| EXEC_DMA_FAULT)?
                .ok_or(EXEC_DMA_FAULT)?;
            f(paddr, done..done + chunk).map_err(|_| EXEC_DMA_FAULT)?;
            done += chunk;
        }
        Ok(())
    }
}
