//! Interrupt top half, per-priority bottom-half workers and the completion
//! dispatcher they run.

use std::sync::atomic::{fence, AtomicU8, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use crate::device::{Counters, DeviceBlock, DeviceState, Location};
use crate::error::Result;
use crate::hw::RegisterWindow;
use crate::layout::{regs, INT_HIGH, INT_LOW};
use crate::memory::copy_to_caller;
use crate::message::{Frame, Opcode, OpcodeWord, OpFlags, ResponseId};
use crate::request::{InlineBuffer, Reply};
use crate::Priority;

/// What a frame taken off the response ring turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Reply to a request this host issued.
    Reply { rspid: ResponseId },
    /// Remote-initiated message naming a listener (0 for none).
    Unsolicited { listener: u32 },
    /// An unsolicited message already handled and on its way back.
    Acknowledgement,
    ErrorReport { status: u32 },
    Unexpected { raw: u32 },
}

impl MessageKind {
    pub fn classify(frame: &Frame) -> Self {
        let word = match OpcodeWord::decode(frame.opcode) {
            Ok(word) => word,
            Err(raw) => return MessageKind::Unexpected { raw },
        };
        let reply = MessageKind::Reply {
            rspid: ResponseId::from_bits(frame.rspid),
        };
        match word.opcode {
            Opcode::SendFromRemote if word.is_remote_complete() => MessageKind::Acknowledgement,
            Opcode::SendFromRemote => MessageKind::Unsolicited {
                listener: frame.rspid,
            },
            Opcode::DiagnosticLocal => reply,
            Opcode::SendToRemote
            | Opcode::BusMasterEmulate
            | Opcode::EmulateLegacy
            | Opcode::RemoteMemoryAccess
            | Opcode::DiagnosticRemote
                if word.is_remote_complete() =>
            {
                reply
            }
            Opcode::ErrorReport => MessageKind::ErrorReport {
                status: frame.exec_status,
            },
            _ => MessageKind::Unexpected { raw: frame.opcode },
        }
    }
}

impl DeviceBlock {
    /// Bottom half: drains every response the device has released.
    pub fn dispatch(&self) {
        Counters::bump(&self.counters.dispatch_runs);
        let mut st = self.lock();
        if let Err(err) = self.dispatch_locked(&mut st) {
            tracing::error!(priority = ?self.priority, "dispatch aborted: {err}");
        }
    }

    fn dispatch_locked(&self, st: &mut DeviceState) -> Result<()> {
        while let Some((_, msg)) = st.response.poll(&*self.memory)? {
            st.messages[msg as usize].location = Location::Held;

            if let Some(free) = st.free.dequeue() {
                self.insert_response(st, free)?;
            } else {
                self.poll_command_ring(st)?;
            }

            let frame = Frame::read_from(&*self.memory, st.messages[msg as usize].paddr)?;
            match MessageKind::classify(&frame) {
                MessageKind::Unsolicited { listener } => {
                    self.deliver_unsolicited(listener, &frame);
                    self.bounce_to_device(st, msg, frame)?;
                    continue;
                }
                MessageKind::Reply { rspid } => self.complete_request(st, rspid, frame),
                MessageKind::Acknowledgement => {
                    tracing::trace!(priority = ?self.priority, "acknowledgement returned");
                }
                MessageKind::ErrorReport { status } => {
                    Counters::bump(&self.counters.error_reports);
                    tracing::warn!(
                        priority = ?self.priority,
                        status = format_args!("0x{status:08x}"),
                        "device error report"
                    );
                }
                MessageKind::Unexpected { raw } => {
                    Counters::bump(&self.counters.unexpected);
                    tracing::warn!(
                        priority = ?self.priority,
                        opcode = format_args!("0x{raw:08x}"),
                        "unexpected opcode"
                    );
                }
            }
            self.release_message(st, msg)?;
        }

        // Reclaimed command frames refill a short response ring first.
        if !st.send_queue.is_empty() || st.response.has_room() {
            self.poll_command_ring(st)?;
        }
        Ok(())
    }

    fn complete_request(&self, st: &mut DeviceState, rspid: ResponseId, frame: Frame) {
        let pending = match st.flows.complete(rspid) {
            Ok(pending) => pending,
            Err(mismatch) => {
                Counters::bump(&self.counters.stale_responses);
                tracing::error!(
                    priority = ?self.priority,
                    index = rspid.index,
                    use_count = rspid.use_count,
                    ?mismatch,
                    "bad response-id"
                );
                return;
            }
        };

        if let InlineBuffer::Caller { vaddr, len } = pending.reply_to {
            let n = len.min(frame.payload.len());
            if let Err(err) =
                copy_to_caller(&*self.caller, &*self.memory, vaddr, &frame.payload[..n])
            {
                tracing::warn!(priority = ?self.priority, "reply copy-out failed: {err}");
            }
        }
        pending.completion.complete(Reply {
            exec_status: frame.exec_status,
            payload: frame.payload,
        });
        Counters::bump(&self.counters.completed);

        if st.flow_waiters > 0 {
            self.flow_freed.notify_one();
        }
    }

    fn deliver_unsolicited(&self, listener: u32, frame: &Frame) {
        Counters::bump(&self.counters.unsolicited);
        if listener == 0 {
            tracing::debug!(priority = ?self.priority, "unsolicited message without listener");
            return;
        }
        if !self.listeners.signal(listener, frame.payload.clone()) {
            tracing::debug!(priority = ?self.priority, listener, "unsolicited message for unknown listener");
        }
    }

    /// Returns a handled unsolicited frame to the device, marked complete.
    /// The frame leaves this host's hands, so it is not released here.
    pub(crate) fn bounce_to_device(&self, st: &mut DeviceState, msg: u16, frame: Frame) -> Result<()> {
        let ack = Frame {
            opcode: OpcodeWord::new(Opcode::SendFromRemote)
                .with_flags(OpFlags::REMOTE_COMPLETE)
                .encode(),
            exec_status: 0,
            payload_size: 0,
            payload: Vec::new(),
            ..frame
        };
        debug_assert_eq!(
            MessageKind::classify(&ack),
            MessageKind::Acknowledgement
        );
        ack.write_to(&*self.memory, st.messages[msg as usize].paddr)?;
        self.send_to_device(st, msg)
    }
}

const IDLE: u8 = 0;
const PENDING: u8 = 1;
const DISPATCHED: u8 = 2;

/// Where a priority's dispatcher is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    Idle,
    InterruptPending,
    Dispatched,
}

enum Work {
    Dispatch,
    Stop,
}

struct BottomHalf {
    state: Arc<AtomicU8>,
    tx: Sender<Work>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl BottomHalf {
    fn spawn(device: Arc<DeviceBlock>) -> std::io::Result<Self> {
        let (tx, rx) = mpsc::channel();
        let state = Arc::new(AtomicU8::new(IDLE));
        let worker_state = Arc::clone(&state);
        let name = match device.priority() {
            Priority::High => "pcil-bh-high",
            Priority::Low => "pcil-bh-low",
        };
        let handle = thread::Builder::new()
            .name(name.into())
            .spawn(move || run_bottom_half(&device, &worker_state, &rx))?;
        Ok(Self {
            state,
            tx,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Schedules a run unless one is already pending or in progress.
    fn schedule(&self) {
        if self.state.swap(PENDING, Ordering::AcqRel) == IDLE {
            let _ = self.tx.send(Work::Dispatch);
        }
    }
}

fn run_bottom_half(device: &DeviceBlock, state: &AtomicU8, rx: &Receiver<Work>) {
    while let Ok(Work::Dispatch) = rx.recv() {
        loop {
            state.store(DISPATCHED, Ordering::Release);
            device.dispatch();
            if state
                .compare_exchange(DISPATCHED, IDLE, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }
    }
    tracing::debug!(priority = ?device.priority(), "bottom half stopped");
}

/// Interrupt top half plus the bottom-half workers it schedules.
pub(crate) struct InterruptController {
    registers: Arc<dyn RegisterWindow>,
    high: BottomHalf,
    low: BottomHalf,
    bringup: Mutex<Option<Sender<()>>>,
}

impl InterruptController {
    pub(crate) fn start(
        registers: Arc<dyn RegisterWindow>,
        high: Arc<DeviceBlock>,
        low: Arc<DeviceBlock>,
    ) -> std::io::Result<Self> {
        Ok(Self {
            registers,
            high: BottomHalf::spawn(high)?,
            low: BottomHalf::spawn(low)?,
            bringup: Mutex::new(None),
        })
    }

    /// Arms the one-shot bring-up rendezvous: the next low-priority interrupt
    /// is consumed by it instead of scheduling the bottom half.
    pub(crate) fn arm_bringup(&self) -> Receiver<()> {
        let (tx, rx) = mpsc::channel();
        *self.bringup.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);
        rx
    }

    pub(crate) fn disarm_bringup(&self) {
        self.bringup
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    /// Runs in interrupt context: acknowledge and hand off, nothing else.
    pub(crate) fn top_half(&self) {
        let pending = self.registers.read32(regs::INTERRUPT_TYPE);

        if pending & INT_HIGH != 0 {
            self.registers.write32(regs::INTERRUPT_ACK_HIGH, INT_HIGH);
            fence(Ordering::SeqCst);
            self.high.schedule();
        }

        if pending & INT_LOW != 0 {
            self.registers.write32(regs::INTERRUPT_ACK_LOW, INT_LOW);
            fence(Ordering::SeqCst);
            let rendezvous = self
                .bringup
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            match rendezvous {
                Some(tx) => {
                    let _ = tx.send(());
                }
                None => self.low.schedule(),
            }
        }
    }

    pub(crate) fn state(&self, priority: Priority) -> DispatchState {
        let bh = match priority {
            Priority::High => &self.high,
            Priority::Low => &self.low,
        };
        match bh.state.load(Ordering::Acquire) {
            PENDING => DispatchState::InterruptPending,
            DISPATCHED => DispatchState::Dispatched,
            _ => DispatchState::Idle,
        }
    }

    /// Stops both workers and waits for them.
    pub(crate) fn stop(&self) {
        for bh in [&self.high, &self.low] {
            let _ = bh.tx.send(Work::Stop);
            let handle = bh.handle.lock().unwrap_or_else(PoisonError::into_inner).take();
            if let Some(handle) = handle {
                if handle.join().is_err() {
                    tracing::error!("bottom half panicked");
                }
            }
        }
    }
}

impl Drop for InterruptController {
    fn drop(&mut self) {
        self.stop();
    }
}
