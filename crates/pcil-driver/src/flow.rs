//! Flow blocks bind in-flight requests to response identifiers.
//!
//! A response is applied only if it names a bound block *and* carries the
//! block's current use count. The count is bumped when a response is applied,
//! so a late duplicate of an old response can never reach the block's next
//! owner.

use std::sync::Arc;

use crate::message::ResponseId;
use crate::queue::Fifo;
use crate::request::Pending;

#[derive(Debug)]
struct FlowBlock {
    use_count: u16,
    bound: Option<Pending>,
}

/// Why a response was not applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowMismatch {
    /// The block is bound but its use count differs.
    StaleUseCount { current: u16 },
    /// Nothing is bound to the block.
    Unbound,
}

#[derive(Debug)]
pub struct FlowPool {
    blocks: Vec<FlowBlock>,
    free: Fifo<u16>,
    mask: u16,
}

impl FlowPool {
    /// `size` must be a power of two.
    pub fn new(size: u16) -> Self {
        assert!(size.is_power_of_two());
        Self {
            blocks: (0..size)
                .map(|_| FlowBlock {
                    use_count: 0,
                    bound: None,
                })
                .collect(),
            free: (0..size).collect(),
            mask: size - 1,
        }
    }

    pub fn capacity(&self) -> usize {
        self.blocks.len()
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Takes a free block and binds `pending` to it.
    pub(crate) fn acquire(&mut self, pending: Pending) -> Result<ResponseId, Pending> {
        let Some(index) = self.free.dequeue() else {
            return Err(pending);
        };
        let block = &mut self.blocks[index as usize];
        debug_assert!(block.bound.is_none());
        block.bound = Some(pending);
        Ok(ResponseId::new(index, block.use_count))
    }

    /// Returns capacity without applying a response; used on transmit
    /// failure paths. The use count is left alone.
    pub(crate) fn release(&mut self, rspid: ResponseId) {
        let block = &mut self.blocks[(rspid.index & self.mask) as usize];
        if block.bound.take().is_some() {
            self.free.enqueue(rspid.index & self.mask);
        }
    }

    /// Applies a response: on a match the bound request is handed back, the
    /// use count advances and the block returns to the free queue.
    pub(crate) fn complete(&mut self, rspid: ResponseId) -> Result<Pending, FlowMismatch> {
        let index = rspid.index & self.mask;
        let block = &mut self.blocks[index as usize];
        if block.bound.is_none() {
            return Err(FlowMismatch::Unbound);
        }
        if block.use_count != rspid.use_count {
            return Err(FlowMismatch::StaleUseCount {
                current: block.use_count,
            });
        }

        let pending = block.bound.take().ok_or(FlowMismatch::Unbound)?;
        block.use_count = block.use_count.wrapping_add(1);
        self.free.enqueue(index);
        Ok(pending)
    }

    /// Current response identifier of a block.
    pub fn current(&self, index: u16) -> ResponseId {
        let index = index & self.mask;
        ResponseId::new(index, self.blocks[index as usize].use_count)
    }

    pub fn is_bound(&self, index: u16) -> bool {
        self.blocks[(index & self.mask) as usize].bound.is_some()
    }

    /// Drops every binding at teardown and hands back the completions so
    /// their owners can be woken.
    pub(crate) fn drain(&mut self) -> Vec<Arc<crate::request::Completion>> {
        let mut completions = Vec::new();
        for (index, block) in self.blocks.iter_mut().enumerate() {
            if let Some(pending) = block.bound.take() {
                completions.push(pending.completion);
                self.free.enqueue(index as u16);
            }
        }
        completions
    }
}
