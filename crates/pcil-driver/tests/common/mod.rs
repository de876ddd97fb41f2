#![allow(dead_code)]

use std::time::{Duration, Instant};

use pcil_driver::sim::{Board, BoardConfig};
use pcil_driver::{Driver, DriverConfig, RingGeometry};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Short timeouts so failure paths finish quickly.
pub fn fast_config() -> DriverConfig {
    DriverConfig {
        handshake_timeout: Duration::from_millis(500),
        boot_delay: Duration::from_millis(1),
        wait_poll_interval: Duration::from_millis(5),
        ..DriverConfig::default()
    }
}

pub fn geometry(command_len: u16, response_len: u16, messages: u16, flows: u16) -> RingGeometry {
    RingGeometry {
        command_len,
        response_len,
        messages,
        flows,
    }
}

/// Board plus a driver on it, not yet initialized.
pub fn board(config: DriverConfig) -> (Board, Driver) {
    init_tracing();
    let board = Board::new(BoardConfig::default()).unwrap();
    let driver = Driver::new(config, board.platform()).unwrap();
    (board, driver)
}

/// Board plus an initialized driver.
pub fn running(config: DriverConfig) -> (Board, Driver) {
    let (board, driver) = board(config);
    driver.initialize().unwrap();
    (board, driver)
}

#[track_caller]
pub fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(1));
    }
}
