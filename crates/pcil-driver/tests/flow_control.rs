mod common;

use std::thread;
use std::time::Duration;

use common::{fast_config, geometry, running, wait_until};
use pcil_driver::channel::diag;
use pcil_driver::sim::VERSION;
use pcil_driver::{
    CancelToken, DriverConfig, DriverError, Frame, InlineBuffer, Opcode, OpcodeWord, OpFlags,
    Priority, Request, ResponseId,
};

fn version_read() -> Request {
    Request::new(Opcode::DiagnosticLocal)
        .with_flags(OpFlags::BM_READ)
        .with_function(diag::VERSION_READ)
        .with_inline(InlineBuffer::Driver(vec![0; VERSION.len()]))
}

fn high_geometry(
    command_len: u16,
    response_len: u16,
    messages: u16,
    flows: u16,
) -> DriverConfig {
    DriverConfig {
        high: geometry(command_len, response_len, messages, flows),
        ..fast_config()
    }
}

#[test]
fn stale_response_for_reused_flow_block_is_dropped() {
    let (board, driver) = running(high_geometry(4, 4, 8, 4));
    let device = driver.device(Priority::High).unwrap();
    let cancel = CancelToken::new();

    // Flow blocks are handed out round-robin: request k binds index k % 4.
    // Request 2 ("A") completes with use-count 0; request 6 ("B") rebinds
    // index 2 with use-count 1.
    for _ in 0..6 {
        let reply = driver
            .transmit_and_wait(Priority::High, &version_read(), &cancel)
            .unwrap();
        assert_eq!(reply.payload, VERSION);
    }

    board.fecc.pause();
    let b = version_read();
    thread::scope(|s| {
        let waiter = s.spawn(|| driver.transmit_and_wait(Priority::High, &b, &cancel));
        wait_until("request B to be transmitted", || {
            device.statistics().transmitted == 7
        });
        assert_eq!(device.snapshot().free_flows, 3);

        // A late duplicate of A's reply.
        board.fecc.inject_response(
            Priority::High,
            Frame {
                opcode: OpcodeWord::new(Opcode::DiagnosticLocal).encode(),
                rspid: ResponseId::new(2, 0).to_bits(),
                payload_size: 4,
                payload: vec![0xEE; 4],
                ..Frame::default()
            },
        );
        wait_until("the stale reply to be rejected", || {
            device.statistics().stale_responses == 1
        });
        assert!(!b.completion().is_complete());
        assert_eq!(device.snapshot().free_flows, 3);
        device.check_invariants().unwrap();

        board.fecc.resume();
        let reply = waiter.join().unwrap().unwrap();
        assert_eq!(reply.payload, VERSION);
    });

    let stats = device.statistics();
    assert_eq!(stats.completed, 7);
    assert_eq!(stats.stale_responses, 1);
    assert_eq!(device.snapshot().free_flows, 4);
}

#[test]
fn caller_beyond_the_message_pool_blocks_until_a_frame_frees() {
    // 8 frames, 4 preloaded into the response ring: 4 for commands.
    let (board, driver) = running(high_geometry(4, 4, 8, 16));
    let device = driver.device(Priority::High).unwrap();
    let cancel = CancelToken::new();

    let (driver, cancel) = (&driver, &cancel);
    board.fecc.pause();
    thread::scope(|s| {
        let callers: Vec<_> = (0..5)
            .map(|_| {
                s.spawn(move || {
                    driver.transmit_and_wait(Priority::High, &version_read(), cancel)
                })
            })
            .collect();

        wait_until("four transmitted and one waiting", || {
            let snapshot = device.snapshot();
            snapshot.message_waiters == 1 && snapshot.command_outstanding == 4
        });
        let snapshot = device.snapshot();
        assert_eq!(snapshot.free_messages, 0);
        assert_eq!(snapshot.free_flows, 12);
        assert_eq!(device.statistics().transmitted, 4);
        device.check_invariants().unwrap();

        board.fecc.resume();
        for caller in callers {
            assert_eq!(caller.join().unwrap().unwrap().payload, VERSION);
        }
    });

    assert_eq!(device.statistics().completed, 5);
    assert_eq!(board.fecc.commands(Priority::High), 5);
    wait_until("the pool to settle", || {
        let snapshot = device.snapshot();
        snapshot.message_waiters == 0 && snapshot.free_flows == 16
    });
    device.check_invariants().unwrap();
}

#[test]
fn full_command_ring_spills_into_the_send_queue() {
    let (board, driver) = running(high_geometry(2, 4, 12, 16));
    let device = driver.device(Priority::High).unwrap();
    let cancel = CancelToken::new();

    let (driver, cancel) = (&driver, &cancel);
    board.fecc.pause();
    thread::scope(|s| {
        let callers: Vec<_> = (0..5)
            .map(|_| {
                s.spawn(move || {
                    driver.transmit_and_wait(Priority::High, &version_read(), cancel)
                })
            })
            .collect();

        wait_until("all five transmitted", || device.statistics().transmitted == 5);
        let snapshot = device.snapshot();
        assert_eq!(snapshot.command_outstanding, 2);
        assert_eq!(snapshot.send_queue, 3);
        assert_eq!(device.statistics().queued, 3);
        device.check_invariants().unwrap();

        board.fecc.resume();
        for caller in callers {
            caller.join().unwrap().unwrap();
        }
    });

    wait_until("the send queue to drain", || device.snapshot().send_queue == 0);
    device.check_invariants().unwrap();
}

#[test]
fn cancelled_reply_wait_keeps_the_flow_until_the_reply_lands() {
    let (board, driver) = running(high_geometry(4, 4, 8, 4));
    let device = driver.device(Priority::High).unwrap();
    let cancel = CancelToken::new();

    board.fecc.pause();
    let request = version_read();
    thread::scope(|s| {
        let waiter = s.spawn(|| driver.transmit_and_wait(Priority::High, &request, &cancel));
        wait_until("transmit", || device.statistics().transmitted == 1);
        cancel.cancel();
        assert_eq!(waiter.join().unwrap(), Err(DriverError::Interrupted));
    });
    assert_eq!(device.snapshot().free_flows, 3);

    board.fecc.resume();
    wait_until("the orphaned reply", || device.statistics().completed == 1);
    assert!(request.completion().is_complete());
    assert_eq!(device.snapshot().free_flows, 4);
    assert_eq!(device.statistics().stale_responses, 0);
    device.check_invariants().unwrap();
}

#[test]
fn reused_request_ignores_a_reply_that_landed_after_cancel() {
    let (board, driver) = running(high_geometry(4, 4, 8, 4));
    let device = driver.device(Priority::High).unwrap();
    let request = version_read();
    let first = CancelToken::new();
    let second = CancelToken::new();

    board.fecc.pause();
    thread::scope(|s| {
        let waiter = s.spawn(|| driver.transmit_and_wait(Priority::High, &request, &first));
        wait_until("transmit", || device.statistics().transmitted == 1);
        first.cancel();
        assert_eq!(waiter.join().unwrap(), Err(DriverError::Interrupted));
    });
    board.fecc.resume();
    wait_until("the orphaned reply", || device.statistics().completed == 1);

    board.fecc.pause();
    thread::scope(|s| {
        let waiter = s.spawn(|| driver.transmit_and_wait(Priority::High, &request, &second));
        wait_until("the second transmit", || device.statistics().transmitted == 2);
        thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished());

        board.fecc.resume();
        assert_eq!(waiter.join().unwrap().unwrap().payload, VERSION);
    });

    let stats = device.statistics();
    assert_eq!(stats.completed, 2);
    assert_eq!(stats.stale_responses, 0);
    assert_eq!(device.snapshot().free_flows, 4);
    device.check_invariants().unwrap();
}

#[test]
fn reused_request_waits_for_its_outstanding_reply() {
    let (board, driver) = running(high_geometry(4, 4, 8, 4));
    let device = driver.device(Priority::High).unwrap();
    let request = version_read();
    let first = CancelToken::new();
    let second = CancelToken::new();

    board.fecc.pause();
    thread::scope(|s| {
        let waiter = s.spawn(|| driver.transmit_and_wait(Priority::High, &request, &first));
        wait_until("transmit", || device.statistics().transmitted == 1);
        first.cancel();
        assert_eq!(waiter.join().unwrap(), Err(DriverError::Interrupted));

        let again = s.spawn(|| driver.transmit_and_wait(Priority::High, &request, &second));
        thread::sleep(Duration::from_millis(50));
        assert!(!again.is_finished());
        assert_eq!(device.statistics().transmitted, 1);
        assert_eq!(device.snapshot().free_flows, 3);

        board.fecc.resume();
        assert_eq!(again.join().unwrap().unwrap().payload, VERSION);
    });

    let stats = device.statistics();
    assert_eq!(stats.transmitted, 2);
    assert_eq!(stats.completed, 2);
    assert_eq!(stats.stale_responses, 0);
    device.check_invariants().unwrap();
}

#[test]
fn cancelled_flow_wait_returns_its_frame() {
    let (board, driver) = running(high_geometry(4, 4, 8, 1));
    let device = driver.device(Priority::High).unwrap();
    let cancel = CancelToken::new();
    let own = CancelToken::new();

    let (driver, cancel) = (&driver, &cancel);
    board.fecc.pause();
    thread::scope(|s| {
        let holder = s.spawn(move || {
            driver.transmit_and_wait(Priority::High, &version_read(), cancel)
        });
        wait_until("the only flow to be bound", || {
            device.statistics().transmitted == 1
        });
        assert_eq!(device.snapshot().free_flows, 0);
        let free_messages = device.snapshot().free_messages;

        let blocked = s.spawn(|| driver.transmit_and_wait(Priority::High, &version_read(), &own));
        wait_until("the second caller to wait for a flow", || {
            device.snapshot().flow_waiters == 1
        });
        assert_eq!(device.snapshot().free_messages, free_messages - 1);
        device.check_invariants().unwrap();

        own.cancel();
        assert_eq!(blocked.join().unwrap(), Err(DriverError::Interrupted));
        let snapshot = device.snapshot();
        assert_eq!(snapshot.free_messages, free_messages);
        assert_eq!(snapshot.flow_waiters, 0);
        assert_eq!(device.statistics().transmitted, 1);
        device.check_invariants().unwrap();

        // A freed flow wakes the next waiter.
        let next = s.spawn(move || {
            driver.transmit_and_wait(Priority::High, &version_read(), cancel)
        });
        wait_until("the third caller to wait for a flow", || {
            device.snapshot().flow_waiters == 1
        });
        board.fecc.resume();
        assert_eq!(holder.join().unwrap().unwrap().payload, VERSION);
        assert_eq!(next.join().unwrap().unwrap().payload, VERSION);
    });

    let snapshot = device.snapshot();
    assert_eq!(snapshot.flow_waiters, 0);
    assert_eq!(snapshot.free_flows, 1);
    assert_eq!(device.statistics().completed, 2);
    device.check_invariants().unwrap();
}

#[test]
fn cancelled_message_wait_returns_without_side_effects() {
    let (board, driver) = running(high_geometry(4, 4, 8, 16));
    let device = driver.device(Priority::High).unwrap();
    let shared = CancelToken::new();
    let own = CancelToken::new();

    let (driver, shared) = (&driver, &shared);
    board.fecc.pause();
    thread::scope(|s| {
        let callers: Vec<_> = (0..4)
            .map(|_| {
                s.spawn(move || {
                    driver.transmit_and_wait(Priority::High, &version_read(), shared)
                })
            })
            .collect();
        wait_until("the ring to fill", || device.statistics().transmitted == 4);

        let blocked = s.spawn(|| driver.transmit_and_wait(Priority::High, &version_read(), &own));
        wait_until("the fifth caller to block", || {
            device.snapshot().message_waiters == 1
        });
        own.cancel();
        assert_eq!(blocked.join().unwrap(), Err(DriverError::Interrupted));
        assert_eq!(device.snapshot().free_flows, 12);
        assert_eq!(device.statistics().transmitted, 4);
        device.check_invariants().unwrap();

        board.fecc.resume();
        for caller in callers {
            caller.join().unwrap().unwrap();
        }
    });
}

#[test]
fn shutdown_releases_every_blocked_caller() {
    let (board, driver) = running(high_geometry(4, 4, 8, 16));
    let device = driver.device(Priority::High).unwrap();
    let cancel = CancelToken::new();

    let (driver, cancel) = (&driver, &cancel);
    board.fecc.pause();
    thread::scope(|s| {
        let callers: Vec<_> = (0..5)
            .map(|_| {
                s.spawn(move || {
                    driver.transmit_and_wait(Priority::High, &version_read(), cancel)
                })
            })
            .collect();
        wait_until("callers to block", || {
            let snapshot = device.snapshot();
            snapshot.message_waiters == 1 && snapshot.command_outstanding == 4
        });

        driver.shutdown();
        for caller in callers {
            assert_eq!(caller.join().unwrap(), Err(DriverError::ShutDown));
        }
    });

    assert_eq!(
        driver
            .transmit_and_wait(Priority::High, &version_read(), &cancel)
            .unwrap_err(),
        DriverError::NotInitialized
    );
}

#[test]
fn remote_failure_status_surfaces_as_communication_error() {
    let (board, driver) = running(fast_config());
    board.fecc.fail_next_reply(0x55);

    let err = driver
        .transmit_and_wait(Priority::High, &version_read(), &CancelToken::new())
        .unwrap_err();
    assert_eq!(err, DriverError::CommunicationError { exec_status: 0x55 });
    assert_eq!(err.vms_status(), pcil_camac::status::CAM_COMMERR);

    // The flow block was still retired normally.
    let device = driver.device(Priority::High).unwrap();
    assert_eq!(device.snapshot().free_flows, driver.config().high.flows as usize);
}

#[test]
fn oversized_payload_is_rejected_before_anything_is_taken() {
    let (_board, driver) = running(fast_config());
    let device = driver.device(Priority::Low).unwrap();
    let before = device.snapshot();

    let request = Request::new(Opcode::SendToRemote).with_inline(InlineBuffer::Driver(vec![
        0;
        pcil_driver::layout::frame::PAYLOAD_CAPACITY
            + 1
    ]));
    assert!(matches!(
        driver.transmit_and_wait(Priority::Low, &request, &CancelToken::new()),
        Err(DriverError::PayloadTooLarge { .. })
    ));
    assert_eq!(device.snapshot(), before);
    assert_eq!(device.statistics().transmitted, 0);
}
