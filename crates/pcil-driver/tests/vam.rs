mod common;

use std::sync::Arc;
use std::thread;

use common::{fast_config, running};
use pcil_driver::layout::VAM_TAG;
use pcil_driver::memory::{DmaRegion, PhysicalMemory, SharedRam};
use pcil_driver::sim::SimCallerSpace;
use pcil_driver::vam::{resolve, VAM_ENTRY_VALID};
use pcil_driver::{CallerSpace, CancelToken, DriverError, Vam};
use proptest::prelude::*;

const PAGE: u64 = 4096;

struct Rng(u64);

impl Rng {
    fn new(seed: u64) -> Self {
        Self(seed)
    }

    fn next_u64(&mut self) -> u64 {
        // xorshift64*
        let mut x = self.0;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.0 = x;
        x.wrapping_mul(0x2545_f491_4f6c_dd1d)
    }

    fn gen_range(&mut self, start: u64, end: u64) -> u64 {
        start + self.next_u64() % (end - start)
    }
}

#[test]
fn page_aligned_contiguous_buffer_maps_to_its_physical_address() {
    let (board, driver) = running(fast_config());
    let cancel = CancelToken::new();

    let vaddr = board.caller.alloc_contiguous(PAGE as usize).unwrap();
    let mapping = driver.map_address(vaddr, PAGE as usize, &cancel).unwrap();
    assert_eq!(mapping.addr, board.caller.physical_page(vaddr).unwrap());
    assert_eq!(mapping.entries, 0);
    assert!(!mapping.is_synthetic());

    driver.release_address(mapping, &cancel).unwrap();
    assert!(driver.vam().entries().iter().all(|e| *e == 0));
}

#[test]
fn scattered_buffer_is_published_in_page_order() {
    let (board, driver) = running(fast_config());
    let cancel = CancelToken::new();

    let vaddr = board.caller.alloc(3 * PAGE as usize).unwrap();
    let pages: Vec<u64> = (0..3)
        .map(|i| board.caller.physical_page(vaddr + i * PAGE).unwrap())
        .collect();

    let mapping = driver.map_address(vaddr, 3 * PAGE as usize, &cancel).unwrap();
    assert!(mapping.is_synthetic());
    assert_eq!(mapping.entries, 3);

    let first = ((mapping.addr & !VAM_TAG) / PAGE) as usize;
    let expected: Vec<u32> = pages.iter().map(|p| *p as u32 | VAM_ENTRY_VALID).collect();
    assert_eq!(&driver.vam().entries()[first..first + 3], &expected[..]);

    // The device-visible copy matches.
    let table = driver.layout().vam_table;
    for (i, page) in pages.iter().enumerate() {
        let at = mapping.addr + i as u64 * PAGE + 0x10;
        assert_eq!(
            resolve(&*board.memory, table, 12, at).unwrap(),
            Some(page + 0x10)
        );
    }

    driver.release_address(mapping, &cancel).unwrap();
    assert!(driver.vam().entries().iter().all(|e| *e == 0));
    assert_eq!(
        resolve(&*board.memory, table, 12, mapping.addr).unwrap(),
        None
    );
}

#[test]
fn exhausted_map_reports_no_space_and_keeps_existing_entries() {
    let config = pcil_driver::DriverConfig {
        vam_entries: 4,
        ..fast_config()
    };
    let (board, driver) = running(config);
    let cancel = CancelToken::new();

    let a = board.caller.alloc(3 * PAGE as usize).unwrap();
    let held = driver.map_address(a, 3 * PAGE as usize, &cancel).unwrap();
    let before = driver.vam().entries();

    let b = board.caller.alloc(2 * PAGE as usize).unwrap();
    assert_eq!(
        driver.map_address(b, 2 * PAGE as usize, &cancel),
        Err(DriverError::NoSpace { pages: 2 })
    );
    assert_eq!(driver.vam().entries(), before);

    driver.release_address(held, &cancel).unwrap();
    let retry = driver.map_address(b, 2 * PAGE as usize, &cancel).unwrap();
    assert_eq!(retry.entries, 2);
}

#[test]
fn concurrent_mappings_never_share_entries() {
    let memory: Arc<dyn PhysicalMemory> = Arc::new(SharedRam::new(0x10_0000));
    let space = SimCallerSpace::new(
        Arc::clone(&memory),
        DmaRegion {
            base: 0x1_0000,
            len: 0xF_0000,
        },
        PAGE,
    );
    let vam = Vam::new(64, PAGE);
    vam.publish(Arc::clone(&memory), 0).unwrap();

    let memory = &*memory;
    thread::scope(|s| {
        for seed in 1..=4u64 {
            let (vam, space) = (&vam, &space);
            s.spawn(move || {
                let mut rng = Rng::new(seed.wrapping_mul(0x9E37_79B9_7F4A_7C15));
                let cancel = CancelToken::new();
                for _ in 0..200 {
                    let pages = rng.gen_range(1, 6);
                    let vaddr = space.alloc((pages * PAGE) as usize).unwrap();
                    let offset = rng.gen_range(0, PAGE);
                    let len = rng.gen_range(1, pages * PAGE - offset + 1) as usize;

                    let mapping = match vam.map_address(space, vaddr + offset, len, &cancel) {
                        Ok(mapping) => mapping,
                        Err(DriverError::NoSpace { .. }) => {
                            space.release(vaddr);
                            continue;
                        }
                        Err(err) => panic!("map failed: {err}"),
                    };
                    // Every byte resolves to the page backing it, whoever
                    // else is mapping at the same time.
                    for probe in [0, len as u64 / 2, len as u64 - 1] {
                        let va = vaddr + offset + probe;
                        let expected = space.physical_page(va).unwrap() + (va & (PAGE - 1));
                        assert_eq!(
                            resolve(memory, 0, 12, mapping.addr + probe).unwrap(),
                            Some(expected)
                        );
                    }
                    vam.release_address(mapping.addr, mapping.entries, &cancel)
                        .unwrap();
                    space.release(vaddr);
                }
            });
        }
    });

    assert!(vam.entries().iter().all(|e| *e == 0));
}

prop_compose! {
    fn buffer()(pages in prop::collection::vec(1u64..256, 1..8))
        (offset in 0..PAGE, fraction in 1u64..=100, pages in Just(pages)) -> (Vec<u64>, u64, usize) {
        let span = pages.len() as u64 * PAGE - offset;
        let len = (span * fraction / 100).max(1);
        (pages.into_iter().map(|p| p * PAGE).collect(), offset, len as usize)
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn map_then_release_restores_the_table((pages, offset, len) in buffer()) {
        let memory: Arc<dyn PhysicalMemory> = Arc::new(SharedRam::new(0x1_0000));
        let space = SimCallerSpace::new(Arc::clone(&memory), DmaRegion { base: 0, len: 0 }, PAGE);
        let vam = Vam::new(32, PAGE);
        vam.publish(Arc::clone(&memory), 0x100).unwrap();
        let cancel = CancelToken::new();

        let vaddr = space.map_pages(&pages) + offset;
        let spanned = ((offset + len as u64 + PAGE - 1) / PAGE) as usize;
        let contiguous = pages[..spanned].windows(2).all(|p| p[1] == p[0] + PAGE);

        let mapping = vam.map_address(&space, vaddr, len, &cancel).unwrap();
        if contiguous {
            prop_assert_eq!(mapping.entries, 0);
            prop_assert_eq!(mapping.addr, pages[0] + offset);
        } else {
            prop_assert_eq!(mapping.entries, spanned);
            prop_assert_eq!(mapping.addr & (PAGE - 1), offset);
        }

        let last = len as u64 - 1;
        let expected = pages[((offset + last) / PAGE) as usize] + (offset + last) % PAGE;
        prop_assert_eq!(
            resolve(&*memory, 0x100, 12, mapping.addr + last).unwrap(),
            Some(expected)
        );

        vam.release_address(mapping.addr, mapping.entries, &cancel).unwrap();
        prop_assert!(vam.entries().iter().all(|e| *e == 0));
    }
}
