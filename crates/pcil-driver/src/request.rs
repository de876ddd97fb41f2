//! Caller-side request objects and the primitives callers block on.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::error::{DriverError, Result};
use crate::message::{Opcode, OpcodeWord, OpFlags};

/// Lets another thread interrupt a blocked call.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub(crate) fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(DriverError::Interrupted);
        }
        Ok(())
    }
}

/// DMA buffer descriptor. `addr` is physical or synthetic (see [`crate::vam`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DmaDescriptor {
    pub size: u32,
    pub offset: u32,
    pub addr: u64,
}

/// Where a request's inline payload lives.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum InlineBuffer {
    #[default]
    None,
    /// Driver-owned bytes.
    Driver(Vec<u8>),
    /// Bytes in the caller's address space.
    Caller { vaddr: u64, len: usize },
}

impl InlineBuffer {
    pub fn len(&self) -> usize {
        match self {
            InlineBuffer::None => 0,
            InlineBuffer::Driver(bytes) => bytes.len(),
            InlineBuffer::Caller { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Result of a completed request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Reply {
    pub exec_status: u32,
    /// Payload returned by the device. When the request's inline buffer is in
    /// caller space the payload is also written there.
    pub payload: Vec<u8>,
}

#[derive(Debug, Default)]
struct CompletionState {
    reply: Option<Reply>,
}

/// Single-slot completion signalled by the dispatcher.
#[derive(Debug, Default)]
pub struct Completion {
    state: Mutex<CompletionState>,
    cond: Condvar,
}

impl Completion {
    pub(crate) fn complete(&self, reply: Reply) {
        let mut state = self.lock();
        state.reply = Some(reply);
        self.cond.notify_all();
    }

    pub fn is_complete(&self) -> bool {
        self.lock().reply.is_some()
    }

    /// Blocks until completed, cancelled or `stop` is raised. Taking the reply
    /// clears the completion for reuse.
    pub(crate) fn wait(
        &self,
        cancel: &CancelToken,
        stop: &AtomicBool,
        poll: Duration,
    ) -> Result<Reply> {
        let mut state = self.lock();
        loop {
            if let Some(reply) = state.reply.take() {
                return Ok(reply);
            }
            if stop.load(Ordering::SeqCst) {
                return Err(DriverError::ShutDown);
            }
            cancel.check()?;
            state = self
                .cond
                .wait_timeout(state, poll)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Blocks until no flow block holds this completion any more, then drops
    /// whatever reply an earlier, abandoned transmit left behind.
    pub(crate) fn wait_released(
        self: &Arc<Self>,
        cancel: &CancelToken,
        stop: &AtomicBool,
        poll: Duration,
    ) -> Result<()> {
        let mut state = self.lock();
        loop {
            if Arc::strong_count(self) == 1 {
                state.reply = None;
                return Ok(());
            }
            if stop.load(Ordering::SeqCst) {
                return Err(DriverError::ShutDown);
            }
            cancel.check()?;
            state = self
                .cond
                .wait_timeout(state, poll)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Wakes waiters without completing; they re-check cancellation and the
    /// stop flag.
    pub(crate) fn wake(&self) {
        let _state = self.lock();
        self.cond.notify_all();
    }

    fn reset(&self) {
        self.lock().reply = None;
    }

    fn lock(&self) -> MutexGuard<'_, CompletionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// What the dispatcher holds for an in-flight request.
#[derive(Debug)]
pub(crate) struct Pending {
    pub(crate) completion: Arc<Completion>,
    pub(crate) reply_to: InlineBuffer,
}

/// A unit of work issued through a device block.
#[derive(Debug)]
pub struct Request {
    pub opcode: Opcode,
    pub flags: OpFlags,
    /// Function selector for diagnostic opcodes.
    pub function: u8,
    pub dma: DmaDescriptor,
    /// Outbound payload, or for bus-master reads the buffer the reply lands in.
    pub inline: InlineBuffer,
    pub(crate) completion: Arc<Completion>,
}

impl Request {
    pub fn new(opcode: Opcode) -> Self {
        Self::with_completion(opcode, Arc::new(Completion::default()))
    }

    pub(crate) fn with_completion(opcode: Opcode, completion: Arc<Completion>) -> Self {
        Self {
            opcode,
            flags: OpFlags::empty(),
            function: 0,
            dma: DmaDescriptor::default(),
            inline: InlineBuffer::None,
            completion,
        }
    }

    pub fn with_flags(mut self, flags: OpFlags) -> Self {
        self.flags |= flags;
        self
    }

    pub fn with_function(mut self, function: u8) -> Self {
        self.function = function;
        self
    }

    pub fn with_dma(mut self, dma: DmaDescriptor) -> Self {
        self.dma = dma;
        self
    }

    pub fn with_inline(mut self, inline: InlineBuffer) -> Self {
        self.inline = inline;
        self
    }

    /// Opcode word placed in the frame; reply-only status bits are masked.
    pub fn opcode_word(&self) -> OpcodeWord {
        OpcodeWord::new(self.opcode)
            .with_flags(self.flags - OpFlags::STATUS)
            .with_function(self.function)
    }

    pub fn is_bus_master_read(&self) -> bool {
        self.flags.contains(OpFlags::BM_READ)
    }

    pub fn completion(&self) -> &Arc<Completion> {
        &self.completion
    }

    pub(crate) fn pending(&self) -> Pending {
        Pending {
            completion: Arc::clone(&self.completion),
            reply_to: match self.inline {
                InlineBuffer::Caller { vaddr, len } => InlineBuffer::Caller { vaddr, len },
                _ => InlineBuffer::None,
            },
        }
    }
}

/// Recycled completion primitives, guarded by the request-queue lock.
#[derive(Debug, Default)]
pub(crate) struct RequestPool {
    free: Mutex<crate::queue::Fifo<Arc<Completion>>>,
}

impl RequestPool {
    pub(crate) fn alloc(&self, opcode: Opcode) -> Request {
        let completion = self
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .dequeue()
            .unwrap_or_default();
        Request::with_completion(opcode, completion)
    }

    /// Returns the request's completion for reuse unless a dispatcher still
    /// references it (an interrupted wait leaves the flow block bound).
    pub(crate) fn free(&self, request: Request) {
        if Arc::strong_count(&request.completion) != 1 {
            return;
        }
        request.completion.reset();
        self.free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .enqueue(request.completion);
    }

    pub(crate) fn len(&self) -> usize {
        self.free.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn opcode_word_masks_status_bits() {
        let req = Request::new(Opcode::SendToRemote)
            .with_flags(OpFlags::REMOTE_COMPLETE | OpFlags::PATTERN);
        let word = req.opcode_word();
        assert!(!word.is_remote_complete());
        assert!(word.flags.contains(OpFlags::PATTERN));
    }

    #[test]
    fn wait_returns_reply_from_another_thread() {
        let completion = Arc::new(Completion::default());
        let signaller = Arc::clone(&completion);
        let t = thread::spawn(move || {
            signaller.complete(Reply {
                exec_status: 0,
                payload: vec![1, 2],
            })
        });
        let stop = AtomicBool::new(false);
        let reply = completion
            .wait(&CancelToken::new(), &stop, Duration::from_millis(5))
            .unwrap();
        t.join().unwrap();
        assert_eq!(reply.payload, vec![1, 2]);
        assert!(!completion.is_complete());
    }

    #[test]
    fn cancelled_wait_reports_interrupted() {
        let completion = Completion::default();
        let cancel = CancelToken::new();
        cancel.cancel();
        let stop = AtomicBool::new(false);
        assert_eq!(
            completion.wait(&cancel, &stop, Duration::from_millis(1)),
            Err(DriverError::Interrupted)
        );
    }

    #[test]
    fn reuse_waits_for_the_bound_flow_and_drops_its_reply() {
        let request = Request::new(Opcode::DiagnosticLocal);
        let pending = request.pending();
        let stop = AtomicBool::new(false);

        let cancel = CancelToken::new();
        cancel.cancel();
        assert_eq!(
            request
                .completion
                .wait_released(&cancel, &stop, Duration::from_millis(1)),
            Err(DriverError::Interrupted)
        );

        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            pending.completion.complete(Reply {
                exec_status: 0,
                payload: vec![9],
            });
        });
        request
            .completion
            .wait_released(&CancelToken::new(), &stop, Duration::from_millis(1))
            .unwrap();
        t.join().unwrap();
        assert!(!request.completion().is_complete());
    }

    #[test]
    fn pool_skips_completions_still_referenced() {
        let pool = RequestPool::default();
        let req = pool.alloc(Opcode::DiagnosticLocal);
        let pending = req.pending();
        pool.free(req);
        assert_eq!(pool.len(), 0);
        drop(pending);

        let req = pool.alloc(Opcode::DiagnosticLocal);
        pool.free(req);
        assert_eq!(pool.len(), 1);
    }
}
