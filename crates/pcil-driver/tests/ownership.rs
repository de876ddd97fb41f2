mod common;

use std::thread;

use common::{fast_config, geometry, running, wait_until};
use pcil_driver::{
    CancelToken, DriverConfig, DriverError, InlineBuffer, Opcode, Priority, Request,
};

struct Rng(u64);

impl Rng {
    fn new(seed: u64) -> Self {
        Self(seed)
    }

    fn next_u32(&mut self) -> u32 {
        // xorshift64*
        let mut x = self.0;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.0 = x;
        (x.wrapping_mul(0x2545_f491_4f6c_dd1d) >> 32) as u32
    }

    fn gen_range(&mut self, start: u32, end: u32) -> u32 {
        start + self.next_u32() % (end - start)
    }

    fn priority(&mut self) -> Priority {
        Priority::ALL[self.gen_range(0, 2) as usize]
    }
}

fn check_all(driver: &pcil_driver::Driver) {
    for priority in Priority::ALL {
        let device = driver.device(priority).unwrap();
        if let Err(err) = device.check_invariants() {
            panic!("{priority:?}: {err}");
        }
    }
}

#[test]
fn frames_stay_in_exactly_one_place_under_random_traffic() {
    let config = DriverConfig {
        high: geometry(4, 4, 12, 4),
        low: geometry(4, 8, 16, 8),
        ..fast_config()
    };
    let (board, driver) = running(config);
    let listener = driver.register_listener();
    let mut rng = Rng::new(0x5EED_0F_F00D);
    let mut unsolicited = 0usize;

    let driver = &driver;
    thread::scope(|s| {
        let mut inflight = Vec::new();

        for _ in 0..300 {
            match rng.gen_range(0, 10) {
                0 => board.fecc.pause(),
                1 | 2 => board.fecc.resume(),
                3 => {
                    let len = rng.gen_range(0, 16) as usize;
                    board
                        .fecc
                        .inject_unsolicited(rng.priority(), listener.id().0, vec![0x5A; len]);
                    unsolicited += 1;
                }
                4 => board
                    .fecc
                    .inject_error_report(rng.priority(), rng.next_u32() | 1),
                _ => {
                    let priority = rng.priority();
                    let payload = vec![rng.next_u32() as u8; rng.gen_range(1, 64) as usize];
                    let cancel = CancelToken::new();
                    let token = cancel.clone();
                    let handle = s.spawn(move || {
                        let request = Request::new(Opcode::EmulateLegacy)
                            .with_inline(InlineBuffer::Driver(payload.clone()));
                        match driver.transmit_and_wait(priority, &request, &token) {
                            Ok(reply) => assert_eq!(reply.payload, payload),
                            Err(DriverError::Interrupted) => {}
                            Err(err) => panic!("transmit failed: {err}"),
                        }
                    });
                    inflight.push((cancel, handle));
                }
            }

            if rng.gen_range(0, 8) == 0 && !inflight.is_empty() {
                let victim = rng.gen_range(0, inflight.len() as u32) as usize;
                inflight[victim].0.cancel();
            }
            check_all(driver);
        }

        board.fecc.resume();
        for (_, handle) in inflight {
            handle.join().unwrap();
        }
    });

    let cancel = CancelToken::new();
    for _ in 0..unsolicited {
        assert!(listener
            .recv_timeout(std::time::Duration::from_secs(5), &cancel)
            .unwrap()
            .is_some());
    }

    for priority in Priority::ALL {
        let device = driver.device(priority).unwrap();
        let geometry = driver.config().geometry(priority);
        wait_until("the device block to go quiet", || {
            let snapshot = device.snapshot();
            snapshot.free_flows == geometry.flows as usize
                && snapshot.send_queue == 0
                && snapshot.free_messages
                    + snapshot.command_outstanding as usize
                    + snapshot.response_outstanding as usize
                    == geometry.messages as usize
        });
        device.check_invariants().unwrap();
    }
}
