//! Virtual address map.
//!
//! The remote DMA engine only understands a single contiguous address range.
//! Caller buffers that are physically contiguous are handed over as-is;
//! anything else gets a run of map entries, each naming one physical page, and
//! the device sees a synthetic address:
//!
//! ```text
//! VAM_TAG | (first_entry << page_shift) | offset_in_page
//! ```
//!
//! The device resolves synthetic addresses through the table whose physical
//! base was written to `PAGE_TABLE_BASE` at bring-up. Table entries are
//! `page_paddr | VAM_ENTRY_VALID`; zero marks a free entry.

use std::sync::{Arc, Mutex, PoisonError};

use crate::error::{DriverError, Result};
use crate::layout::{MAX_PHYSICAL, VAM_ENTRY_BYTES, VAM_TAG};
use crate::memory::{CallerSpace, MemoryError, PhysicalMemory};
use crate::request::CancelToken;

pub const VAM_ENTRY_VALID: u32 = 1;

/// Result of mapping a caller buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    /// Physical address, or synthetic address when `entries > 0`.
    pub addr: u64,
    /// Map entries consumed; zero for a direct physical mapping.
    pub entries: usize,
}

impl Mapping {
    pub fn is_synthetic(&self) -> bool {
        self.addr & VAM_TAG != 0
    }
}

struct VamState {
    entries: Vec<u32>,
    last: usize,
    table: Option<(Arc<dyn PhysicalMemory>, u64)>,
}

impl VamState {
    fn store(&mut self, slot: usize, value: u32) -> std::result::Result<(), MemoryError> {
        self.entries[slot] = value;
        if let Some((memory, base)) = &self.table {
            memory.write_u32(base + slot as u64 * VAM_ENTRY_BYTES, value)?;
        }
        Ok(())
    }

    fn find_free_run(&self, need: usize) -> Option<usize> {
        let n = self.entries.len();
        let start = (self.last + 1) % n;
        (0..n)
            .map(|step| (start + step) % n)
            .find(|&slot| {
                slot + need <= n && self.entries[slot..slot + need].iter().all(|e| *e == 0)
            })
    }
}

pub struct Vam {
    page_size: u64,
    page_shift: u32,
    state: Mutex<VamState>,
}

impl Vam {
    pub fn new(entries: usize, page_size: u64) -> Self {
        assert!(page_size.is_power_of_two());
        Self {
            page_size,
            page_shift: page_size.trailing_zeros(),
            state: Mutex::new(VamState {
                entries: vec![0; entries],
                last: entries.saturating_sub(1),
                table: None,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.lock().entries.len()
    }

    /// Mirrors the table into device-visible memory at `base`, writing the
    /// current contents.
    pub fn publish(&self, memory: Arc<dyn PhysicalMemory>, base: u64) -> Result<()> {
        let mut state = self.lock();
        for (slot, value) in state.entries.iter().enumerate() {
            memory.write_u32(base + slot as u64 * VAM_ENTRY_BYTES, *value)?;
        }
        state.table = Some((memory, base));
        Ok(())
    }

    /// Maps `[vaddr, vaddr + len)` of `space` into the device's address space.
    pub fn map_address(
        &self,
        space: &dyn CallerSpace,
        vaddr: u64,
        len: usize,
        cancel: &CancelToken,
    ) -> Result<Mapping> {
        if len == 0 {
            return Err(DriverError::InvalidArgument("cannot map an empty buffer"));
        }
        let pages = self.collect_pages(space, vaddr, len)?;
        let offset = vaddr & (self.page_size - 1);

        let contiguous = pages
            .windows(2)
            .all(|pair| pair[1] == pair[0] + self.page_size);
        let direct = pages[0] + offset;
        if contiguous && direct + len as u64 <= MAX_PHYSICAL {
            return Ok(Mapping {
                addr: direct,
                entries: 0,
            });
        }

        cancel.check()?;
        let mut state = self.lock();
        let need = pages.len();
        let first = state
            .find_free_run(need)
            .ok_or(DriverError::NoSpace { pages: need })?;
        for (i, page) in pages.iter().enumerate() {
            if let Err(err) = state.store(first + i, *page as u32 | VAM_ENTRY_VALID) {
                for slot in first..first + i {
                    let _ = state.store(slot, 0);
                }
                return Err(err.into());
            }
        }
        state.last = first + need - 1;

        Ok(Mapping {
            addr: VAM_TAG | ((first as u64) << self.page_shift) | offset,
            entries: need,
        })
    }

    /// Undoes [`Vam::map_address`]. Direct physical mappings are a no-op.
    pub fn release_address(&self, addr: u64, entries: usize, cancel: &CancelToken) -> Result<()> {
        if addr & VAM_TAG == 0 {
            return Ok(());
        }
        cancel.check()?;
        let first = ((addr & !VAM_TAG) >> self.page_shift) as usize;
        let mut state = self.lock();
        if first + entries > state.entries.len() {
            return Err(DriverError::InvalidArgument("mapping extends past the table"));
        }
        for slot in first..first + entries {
            state.store(slot, 0)?;
        }
        Ok(())
    }

    /// Snapshot of the table, for diagnostics.
    pub fn entries(&self) -> Vec<u32> {
        self.lock().entries.clone()
    }

    fn collect_pages(&self, space: &dyn CallerSpace, vaddr: u64, len: usize) -> Result<Vec<u64>> {
        let first_page = vaddr & !(self.page_size - 1);
        let end = vaddr + len as u64;
        let count = ((end - first_page) + self.page_size - 1) >> self.page_shift;

        (0..count)
            .map(|i| {
                let va = first_page + (i << self.page_shift);
                let page = space
                    .physical_page(va)
                    .ok_or(DriverError::Fault { vaddr: va })?;
                if page >= MAX_PHYSICAL {
                    return Err(DriverError::InvalidArgument(
                        "page lies outside the device-visible window",
                    ));
                }
                Ok(page)
            })
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VamState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Device-side resolution of a DMA address to a physical address. `addr` may
/// be physical or synthetic.
pub fn resolve(
    memory: &dyn PhysicalMemory,
    table_base: u64,
    page_shift: u32,
    addr: u64,
) -> std::result::Result<Option<u64>, MemoryError> {
    if addr & VAM_TAG == 0 {
        return Ok(Some(addr));
    }
    let synthetic = addr & !VAM_TAG;
    let slot = synthetic >> page_shift;
    let entry = memory.read_u32(table_base + slot * VAM_ENTRY_BYTES)?;
    if entry & VAM_ENTRY_VALID == 0 {
        return Ok(None);
    }
    let page = (entry & !VAM_ENTRY_VALID) as u64;
    Ok(Some(page + (synthetic & ((1 << page_shift) - 1))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct Pages {
        map: HashMap<u64, u64>,
    }

    impl CallerSpace for Pages {
        fn page_size(&self) -> u64 {
            4096
        }

        fn physical_page(&self, vaddr: u64) -> Option<u64> {
            self.map.get(&(vaddr & !0xFFF)).copied()
        }

        fn alloc(&self, _len: usize) -> Result<u64> {
            Err(DriverError::InvalidArgument("fixed test space"))
        }

        fn release(&self, _vaddr: u64) {}
    }

    fn space(pairs: &[(u64, u64)]) -> Pages {
        Pages {
            map: pairs.iter().copied().collect(),
        }
    }

    #[test]
    fn contiguous_buffer_maps_directly() {
        let vam = Vam::new(16, 4096);
        let s = space(&[(0x10000, 0x5000), (0x11000, 0x6000)]);
        let m = vam
            .map_address(&s, 0x10010, 0x1000, &CancelToken::new())
            .unwrap();
        assert_eq!(m, Mapping { addr: 0x5010, entries: 0 });
        assert!(vam.entries().iter().all(|e| *e == 0));
        vam.release_address(m.addr, m.entries, &CancelToken::new())
            .unwrap();
    }

    #[test]
    fn scattered_buffer_gets_synthetic_address() {
        let vam = Vam::new(16, 4096);
        let s = space(&[(0x10000, 0x9000), (0x11000, 0x3000), (0x12000, 0x7000)]);
        let m = vam
            .map_address(&s, 0x10000, 3 * 4096, &CancelToken::new())
            .unwrap();
        assert!(m.is_synthetic());
        assert_eq!(m.entries, 3);
        assert_eq!(m.addr & 0xFFF, 0);

        let first = ((m.addr & !VAM_TAG) >> 12) as usize;
        let entries = vam.entries();
        assert_eq!(
            &entries[first..first + 3],
            &[0x9001, 0x3001, 0x7001]
        );

        vam.release_address(m.addr, m.entries, &CancelToken::new())
            .unwrap();
        assert!(vam.entries().iter().all(|e| *e == 0));
    }

    #[test]
    fn search_wraps_once_then_fails() {
        let vam = Vam::new(4, 4096);
        let s = space(&[(0x0, 0x9000), (0x1000, 0x3000), (0x2000, 0xA000)]);
        let cancel = CancelToken::new();

        let a = vam.map_address(&s, 0x0, 0x2000, &cancel).unwrap();
        assert_eq!(a.entries, 2);
        // Two entries left, three needed.
        assert_eq!(
            vam.map_address(&s, 0x0, 0x3000, &cancel),
            Err(DriverError::NoSpace { pages: 3 })
        );
        let b = vam.map_address(&s, 0x0, 0x2000, &cancel).unwrap();
        assert_ne!(a.addr, b.addr);

        vam.release_address(a.addr, a.entries, &cancel).unwrap();
        // The free run now sits before the cursor; the search wraps to it.
        let c = vam.map_address(&s, 0x0, 0x2000, &cancel).unwrap();
        assert_eq!(c.addr, a.addr);
    }

    #[test]
    fn cancelled_map_leaves_table_untouched() {
        let vam = Vam::new(8, 4096);
        let s = space(&[(0x0, 0x9000), (0x1000, 0x3000)]);
        let cancel = CancelToken::new();
        cancel.cancel();
        assert_eq!(
            vam.map_address(&s, 0x0, 0x2000, &cancel),
            Err(DriverError::Interrupted)
        );
        assert!(vam.entries().iter().all(|e| *e == 0));
    }

    #[test]
    fn unmapped_page_faults() {
        let vam = Vam::new(8, 4096);
        let s = space(&[(0x0, 0x9000)]);
        assert_eq!(
            vam.map_address(&s, 0x0, 0x1001, &CancelToken::new()),
            Err(DriverError::Fault { vaddr: 0x1000 })
        );
    }

    #[test]
    fn device_resolves_through_published_table() {
        use crate::memory::SharedRam;

        let ram: Arc<dyn PhysicalMemory> = Arc::new(SharedRam::new(0x20000));
        let vam = Vam::new(8, 4096);
        vam.publish(Arc::clone(&ram), 0x100).unwrap();
        let s = space(&[(0x0, 0x9000), (0x1000, 0x3000)]);
        let m = vam
            .map_address(&s, 0x0ff0, 0x20, &CancelToken::new())
            .unwrap();

        assert_eq!(resolve(&*ram, 0x100, 12, m.addr).unwrap(), Some(0x9ff0));
        assert_eq!(
            resolve(&*ram, 0x100, 12, m.addr + 0x10).unwrap(),
            Some(0x3000)
        );
        assert_eq!(resolve(&*ram, 0x100, 12, 0x4444).unwrap(), Some(0x4444));
    }
}
