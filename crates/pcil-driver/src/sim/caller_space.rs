//! Caller address space whose buffers are backed by scattered physical pages.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::{DriverError, Result};
use crate::memory::{copy_from_caller, copy_to_caller, CallerSpace, DmaRegion, PhysicalMemory};

/// Virtual addresses handed out start here; zero stays unmapped.
const VIRTUAL_BASE: u64 = 0x1000_0000;

#[derive(Debug)]
struct Allocation {
    pages: Vec<u64>,
    /// Pages came from the pool and go back to it on release.
    owned: bool,
}

#[derive(Debug)]
struct SpaceState {
    free: VecDeque<u64>,
    pages: HashMap<u64, u64>,
    allocations: HashMap<u64, Allocation>,
    next_vaddr: u64,
}

pub struct SimCallerSpace {
    page_size: u64,
    memory: Arc<dyn PhysicalMemory>,
    state: Mutex<SpaceState>,
}

impl SimCallerSpace {
    /// Pages of `pool` are handed out even-indexed first, so consecutive
    /// pages of one allocation are never physically adjacent while the pool
    /// lasts.
    pub fn new(memory: Arc<dyn PhysicalMemory>, pool: DmaRegion, page_size: u64) -> Self {
        assert!(page_size.is_power_of_two());
        let first = (pool.base + page_size - 1) & !(page_size - 1);
        let count = (pool.base + pool.len).saturating_sub(first) / page_size;
        let all: Vec<u64> = (0..count).map(|i| first + i * page_size).collect();
        let free = all
            .iter()
            .step_by(2)
            .chain(all.iter().skip(1).step_by(2))
            .copied()
            .collect();

        Self {
            page_size,
            memory,
            state: Mutex::new(SpaceState {
                free,
                pages: HashMap::new(),
                allocations: HashMap::new(),
                next_vaddr: VIRTUAL_BASE,
            }),
        }
    }

    pub fn free_pages(&self) -> usize {
        self.lock().free.len()
    }

    /// Like [`CallerSpace::alloc`] but backed by physically adjacent pages.
    pub fn alloc_contiguous(&self, len: usize) -> Result<u64> {
        let mut st = self.lock();
        let need = self.pages_for(len);
        let mut sorted: Vec<u64> = st.free.iter().copied().collect();
        sorted.sort_unstable();
        let start = sorted
            .windows(need)
            .find(|run| run.windows(2).all(|p| p[1] == p[0] + self.page_size))
            .map(|run| run[0])
            .ok_or(DriverError::InvalidArgument("no contiguous run of caller pages"))?;

        let pages: Vec<u64> = (0..need as u64).map(|i| start + i * self.page_size).collect();
        st.free.retain(|p| !pages.contains(p));
        Ok(self.install(&mut st, pages, true))
    }

    /// Maps caller-chosen physical pages (page-aligned) at a fresh virtual
    /// address. Release leaves the pages alone.
    pub fn map_pages(&self, pages: &[u64]) -> u64 {
        let mut st = self.lock();
        self.install(&mut st, pages.to_vec(), false)
    }

    pub fn write(&self, vaddr: u64, bytes: &[u8]) -> Result<()> {
        copy_to_caller(self, &*self.memory, vaddr, bytes)
    }

    pub fn read(&self, vaddr: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        copy_from_caller(self, &*self.memory, vaddr, &mut buf)?;
        Ok(buf)
    }

    fn pages_for(&self, len: usize) -> usize {
        (len.max(1) as u64).div_ceil(self.page_size) as usize
    }

    fn install(&self, st: &mut SpaceState, pages: Vec<u64>, owned: bool) -> u64 {
        let vaddr = st.next_vaddr;
        for (i, page) in pages.iter().enumerate() {
            st.pages.insert(vaddr + i as u64 * self.page_size, *page);
        }
        // One unmapped guard page between allocations.
        st.next_vaddr += (pages.len() as u64 + 1) * self.page_size;
        st.allocations.insert(vaddr, Allocation { pages, owned });
        vaddr
    }

    fn lock(&self) -> MutexGuard<'_, SpaceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl CallerSpace for SimCallerSpace {
    fn page_size(&self) -> u64 {
        self.page_size
    }

    fn physical_page(&self, vaddr: u64) -> Option<u64> {
        self.lock().pages.get(&(vaddr & !(self.page_size - 1))).copied()
    }

    fn alloc(&self, len: usize) -> Result<u64> {
        let need = self.pages_for(len);
        let mut st = self.lock();
        if st.free.len() < need {
            return Err(DriverError::InvalidArgument("caller space exhausted"));
        }
        let pages: Vec<u64> = st.free.drain(..need).collect();
        Ok(self.install(&mut st, pages, true))
    }

    fn release(&self, vaddr: u64) {
        let mut st = self.lock();
        let Some(allocation) = st.allocations.remove(&vaddr) else {
            return;
        };
        for i in 0..allocation.pages.len() as u64 {
            st.pages.remove(&(vaddr + i * self.page_size));
        }
        if allocation.owned {
            st.free.extend(allocation.pages);
        }
    }
}
