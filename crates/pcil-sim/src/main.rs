#![forbid(unsafe_code)]

use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use pcil_camac::{io, ControlWord, CtlwFlags, ErrorMask, OpData, Package, PriorityHint};
use pcil_driver::sim::{Board, BoardConfig, VERSION};
use pcil_driver::{
    CancelToken, Channel, DmaDescriptor, Driver, DriverConfig, DriverStatistics, InlineBuffer,
    Priority, RingGeometry,
};

const F_READ: u8 = 0;
const F_WRITE: u8 = 16;

/// Brings up the driver against the in-process controller and runs CAMAC
/// traffic through it.
#[derive(Debug, Clone, Parser)]
#[command(name = "pcil-sim", version, about)]
struct Args {
    /// Log filter (tracing-subscriber EnvFilter syntax).
    ///
    /// Environment variable: `PCIL_LOG_LEVEL`. Falls back to `RUST_LOG`, then `info`.
    #[arg(long, env = "PCIL_LOG_LEVEL")]
    log_level: Option<String>,

    /// Command and response ring length for the high-priority level.
    ///
    /// Environment variable: `PCIL_HIGH_RING_LEN`.
    #[arg(long, env = "PCIL_HIGH_RING_LEN", default_value_t = 16)]
    high_ring_len: u16,

    /// Command and response ring length for the low-priority level.
    ///
    /// Environment variable: `PCIL_LOW_RING_LEN`.
    #[arg(long, env = "PCIL_LOW_RING_LEN", default_value_t = 32)]
    low_ring_len: u16,

    /// Flow blocks per priority level.
    ///
    /// Environment variable: `PCIL_FLOWS`.
    #[arg(long, env = "PCIL_FLOWS", default_value_t = 32)]
    flows: u16,

    /// Entries in the virtual address map.
    ///
    /// Environment variable: `PCIL_VAM_ENTRIES`.
    #[arg(long, env = "PCIL_VAM_ENTRIES", default_value_t = 1024)]
    vam_entries: usize,

    /// How often blocked callers re-check cancellation, in milliseconds.
    ///
    /// Environment variable: `PCIL_WAIT_POLL_MS`.
    #[arg(long, env = "PCIL_WAIT_POLL_MS", default_value_t = 20)]
    wait_poll_ms: u64,

    /// Handshake step timeout, in milliseconds.
    ///
    /// Environment variable: `PCIL_HANDSHAKE_TIMEOUT_MS`.
    #[arg(long, env = "PCIL_HANDSHAKE_TIMEOUT_MS", default_value_t = 2000)]
    handshake_timeout_ms: u64,

    /// Crate the demo module is installed in.
    #[arg(long, default_value_t = 1)]
    crate_addr: u8,

    /// Station of the demo module.
    #[arg(long, default_value_t = 5)]
    slot: u8,

    /// Write/read-back packages to run.
    #[arg(long, default_value_t = 8)]
    packages: u32,
}

impl Args {
    fn driver_config(&self) -> DriverConfig {
        let geometry = |len: u16| RingGeometry {
            command_len: len,
            response_len: len,
            messages: len.saturating_mul(3),
            flows: self.flows,
        };
        DriverConfig {
            high: geometry(self.high_ring_len),
            low: geometry(self.low_ring_len),
            vam_entries: self.vam_entries,
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
            wait_poll_interval: Duration::from_millis(self.wait_poll_ms),
            ..DriverConfig::default()
        }
    }
}

fn init_tracing(log_level: Option<&str>) {
    let filter = match log_level {
        Some(level) => tracing_subscriber::EnvFilter::new(level),
        None => tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_level.as_deref());

    let config = args.driver_config();
    config.validate().context("invalid driver configuration")?;

    let board = Board::new(BoardConfig {
        page_size: config.page_size,
        ..BoardConfig::default()
    })
    .context("failed to start the simulated controller")?;
    let driver = Driver::new(config, board.platform()).context("failed to create the driver")?;
    driver.initialize().context("controller bring-up failed")?;
    tracing::info!(
        page_table_base = board.fecc.page_table_base(),
        "controller running"
    );

    let result = run(&args, &board, &driver);

    report(&driver.statistics());
    driver.shutdown();
    board.fecc.stop();
    result
}

fn run(args: &Args, board: &Board, driver: &Driver) -> Result<()> {
    let cancel = CancelToken::new();

    let version = driver
        .channel_io(
            Channel::VersionRead,
            InlineBuffer::Driver(vec![0; VERSION.len()]),
            DmaDescriptor::default(),
            &cancel,
        )
        .context("version read failed")?;
    println!("controller firmware: {}", String::from_utf8_lossy(&version.payload));

    board.fecc.with_crates(|crates| {
        crates.install(args.crate_addr, args.slot);
    });

    for round in 0..args.packages {
        let value = 0x10_0000 | round.wrapping_mul(0x0101) & 0xFFFF;
        let hint = if round % 2 == 0 {
            PriorityHint::High
        } else {
            PriorityHint::Low
        };

        let mut package = Package::alloc(2, Some(hint))?;
        let write = ControlWord::new(args.crate_addr, args.slot, (round % 16) as u8, F_WRITE)?
            .with_flags(CtlwFlags::P24);
        let read = ControlWord::new(args.crate_addr, args.slot, (round % 16) as u8, F_READ)?
            .with_flags(CtlwFlags::P24);
        package.add(write, OpData::Write(value.to_le_bytes().to_vec()), ErrorMask::default())?;
        let readback = package.add(read, OpData::Read(4), ErrorMask::default())?;

        let status = package.go(driver);
        let data = package.data(readback).map(<[u8]>::to_vec).unwrap_or_default();
        package.delete();

        println!("package {round}: {status}");
        if !status.is_success() {
            bail!("package {round} failed: {status}");
        }
        if data != value.to_le_bytes() {
            bail!("package {round} read back {data:02x?}, wrote {value:#08x}");
        }
    }

    // An empty station answers without X.
    let empty = ControlWord::new(args.crate_addr, args.slot.wrapping_add(1) % 24 + 1, 0, F_READ)?;
    let (status, cstat, _) = io(
        driver,
        PriorityHint::Low,
        empty,
        OpData::Read(2),
        ErrorMask::default(),
    )?;
    println!("empty station: {status} (x={}, q={})", cstat.x(), cstat.q());

    let counters = driver
        .channel_io(
            Channel::CounterRead,
            InlineBuffer::Driver(vec![0; 8]),
            DmaDescriptor::default(),
            &cancel,
        )
        .context("counter read failed")?;
    if let [h0, h1, h2, h3, l0, l1, l2, l3] = counters.payload[..] {
        println!(
            "controller commands: high={} low={}",
            u32::from_le_bytes([h0, h1, h2, h3]),
            u32::from_le_bytes([l0, l1, l2, l3])
        );
    }

    for priority in Priority::ALL {
        let device = driver.device(priority)?;
        device
            .check_invariants()
            .map_err(|err| anyhow::anyhow!("{priority:?} frame accounting broken: {err}"))?;
    }
    Ok(())
}

fn report(statistics: &DriverStatistics) {
    for (name, s) in [("high", &statistics.high), ("low", &statistics.low)] {
        println!(
            "{name}: transmitted={} completed={} queued={} stale={} unexpected={} \
             error_reports={} unsolicited={} dispatch_runs={}",
            s.transmitted,
            s.completed,
            s.queued,
            s.stale_responses,
            s.unexpected,
            s.error_reports,
            s.unsolicited,
            s.dispatch_runs,
        );
    }
}
