//! Process-wide driver context owning both device blocks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use pcil_camac::{PackageExecutor, PriorityHint, VmsStatus};
use pcil_camac::status::CAM_OKOK;

use crate::bringup::{BringUp, CommLayout};
use crate::channel::Channel;
use crate::config::DriverConfig;
use crate::device::{DeviceBlock, DeviceStatistics};
use crate::dispatch::{DispatchState, InterruptController};
use crate::error::{DriverError, Result};
use crate::hw::Platform;
use crate::listener::{Listener, Listeners};
use crate::memory::{copy_from_caller, copy_to_caller};
use crate::message::Opcode;
use crate::request::{CancelToken, DmaDescriptor, InlineBuffer, Reply, Request};
use crate::vam::{Mapping, Vam};
use crate::Priority;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DriverStatistics {
    pub high: DeviceStatistics,
    pub low: DeviceStatistics,
}

/// State that exists only while the controller is running.
struct Engine {
    high: Arc<DeviceBlock>,
    low: Arc<DeviceBlock>,
    interrupts: Arc<InterruptController>,
    stop: Arc<AtomicBool>,
}

impl Engine {
    fn device(&self, priority: Priority) -> &Arc<DeviceBlock> {
        match priority {
            Priority::High => &self.high,
            Priority::Low => &self.low,
        }
    }

    fn halt(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.high.wake_all();
        self.low.wake_all();
        self.interrupts.stop();
    }
}

pub struct Driver {
    config: DriverConfig,
    platform: Platform,
    layout: CommLayout,
    vam: Vam,
    listeners: Arc<Listeners>,
    engine: RwLock<Option<Arc<Engine>>>,
}

impl Driver {
    /// Validates `config` against `platform` and plans the shared-memory
    /// layout. The controller is not touched until [`Driver::initialize`].
    pub fn new(config: DriverConfig, platform: Platform) -> Result<Self> {
        config.validate()?;
        if platform.caller.page_size() != config.page_size {
            return Err(DriverError::InvalidConfig(
                "caller address space page size differs from the configured page size",
            ));
        }
        let layout = CommLayout::plan(&config, platform.dma)?;
        let vam = Vam::new(config.vam_entries, config.page_size);
        Ok(Self {
            config,
            platform,
            layout,
            vam,
            listeners: Arc::new(Listeners::default()),
            engine: RwLock::new(None),
        })
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn layout(&self) -> &CommLayout {
        &self.layout
    }

    pub fn vam(&self) -> &Vam {
        &self.vam
    }

    /// Brings the controller up and starts the bottom halves. A no-op when
    /// already running. Self-test and handshake failures leave the driver
    /// uninitialized; retry through [`Driver::reinitialize`].
    pub fn initialize(&self) -> Result<()> {
        let mut slot = self.engine.write().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return Ok(());
        }

        let stop = Arc::new(AtomicBool::new(false));
        let block = |priority: Priority| {
            Arc::new(DeviceBlock::new(
                priority,
                self.config.geometry(priority),
                self.layout.priority(priority),
                Arc::clone(&self.platform.memory),
                Arc::clone(&self.platform.registers),
                Arc::clone(&self.platform.caller),
                Arc::clone(&self.listeners),
                Arc::clone(&stop),
                self.config.wait_poll_interval,
            ))
        };
        let high = block(Priority::High);
        let low = block(Priority::Low);
        let interrupts = InterruptController::start(
            Arc::clone(&self.platform.registers),
            Arc::clone(&high),
            Arc::clone(&low),
        )
        .map_err(|err| DriverError::WorkerSpawn(err.to_string()))?;
        let engine = Arc::new(Engine {
            high,
            low,
            interrupts: Arc::new(interrupts),
            stop,
        });

        let top_half = Arc::downgrade(&engine.interrupts);
        self.platform.interrupt.attach(Arc::new(move || {
            if let Some(controller) = top_half.upgrade() {
                controller.top_half();
            }
        }));

        if let Err(err) = self.bring_up(&engine) {
            engine.interrupts.disarm_bringup();
            self.platform.interrupt.detach();
            engine.halt();
            tracing::error!("bring-up failed: {err}");
            return Err(err);
        }

        *slot = Some(engine);
        tracing::info!("driver initialized");
        Ok(())
    }

    fn bring_up(&self, engine: &Engine) -> Result<()> {
        let bring_up = BringUp {
            config: &self.config,
            registers: &*self.platform.registers,
            memory: &*self.platform.memory,
            layout: &self.layout,
        };
        bring_up.handshake()?;
        self.vam
            .publish(Arc::clone(&self.platform.memory), self.layout.vam_table)?;
        bring_up.go(engine.interrupts.arm_bringup())?;
        engine.high.preload_responses()?;
        engine.low.preload_responses()?;
        Ok(())
    }

    /// Tears the running instance down and repeats bring-up.
    pub fn reinitialize(&self) -> Result<()> {
        self.shutdown();
        self.initialize()
    }

    /// Stops the bottom halves. Blocked callers return
    /// [`DriverError::ShutDown`].
    pub fn shutdown(&self) {
        let engine = self
            .engine
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(engine) = engine {
            self.platform.interrupt.detach();
            engine.halt();
            tracing::info!("driver shut down");
        }
    }

    pub fn is_ready(&self) -> bool {
        self.engine
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn engine(&self) -> Result<Arc<Engine>> {
        self.engine
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(DriverError::NotInitialized)
    }

    pub fn device(&self, priority: Priority) -> Result<Arc<DeviceBlock>> {
        Ok(Arc::clone(self.engine()?.device(priority)))
    }

    pub fn dispatch_state(&self, priority: Priority) -> Option<DispatchState> {
        self.engine()
            .ok()
            .map(|engine| engine.interrupts.state(priority))
    }

    pub fn transmit_and_wait(
        &self,
        priority: Priority,
        request: &Request,
        cancel: &CancelToken,
    ) -> Result<Reply> {
        self.device(priority)?.transmit_and_wait(request, cancel)
    }

    /// One request on `channel`. For read channels, `inline` only sizes the
    /// reply: its length is the number of bytes asked for.
    pub fn channel_io(
        &self,
        channel: Channel,
        inline: InlineBuffer,
        dma: DmaDescriptor,
        cancel: &CancelToken,
    ) -> Result<Reply> {
        let route = channel.route();
        let device = self.device(route.class.priority())?;
        let request = device
            .alloc_request(route.opcode)
            .with_flags(route.flags)
            .with_function(route.function)
            .with_dma(dma)
            .with_inline(inline);
        let reply = device.transmit_and_wait(&request, cancel);
        device.free_request(request);
        reply
    }

    pub fn register_listener(&self) -> Listener {
        self.listeners.register()
    }

    pub fn map_address(&self, vaddr: u64, len: usize, cancel: &CancelToken) -> Result<Mapping> {
        self.vam
            .map_address(&*self.platform.caller, vaddr, len, cancel)
    }

    pub fn release_address(&self, mapping: Mapping, cancel: &CancelToken) -> Result<()> {
        self.vam
            .release_address(mapping.addr, mapping.entries, cancel)
    }

    pub fn statistics(&self) -> DriverStatistics {
        match self.engine() {
            Ok(engine) => DriverStatistics {
                high: engine.high.statistics(),
                low: engine.low.statistics(),
            },
            Err(_) => DriverStatistics::default(),
        }
    }

    /// Ships a CAMAC packet to the bus-master emulation. The status/data
    /// region travels through caller space and the address map.
    fn execute_packet(&self, priority: Priority, packet: &[u8], region: &mut [u8]) -> Result<()> {
        let device = self.device(priority)?;
        let caller = &*self.platform.caller;
        let memory = &*self.platform.memory;
        let cancel = CancelToken::new();

        let vaddr = caller.alloc(region.len())?;
        let result = (|| {
            copy_to_caller(caller, memory, vaddr, region)?;
            let mapping = self.map_address(vaddr, region.len(), &cancel)?;

            let request = device
                .alloc_request(Opcode::BusMasterEmulate)
                .with_dma(DmaDescriptor {
                    size: region.len() as u32,
                    offset: 0,
                    addr: mapping.addr,
                })
                .with_inline(InlineBuffer::Driver(packet.to_vec()));
            let reply = device.transmit_and_wait(&request, &cancel);
            device.free_request(request);
            let released = self.release_address(mapping, &cancel);

            reply?;
            released?;
            copy_from_caller(caller, memory, vaddr, region)
        })();
        caller.release(vaddr);
        result
    }
}

impl PackageExecutor for Driver {
    fn execute(&self, priority: PriorityHint, packet: &[u8], region: &mut [u8]) -> VmsStatus {
        match self.execute_packet(priority.into(), packet, region) {
            Ok(()) => CAM_OKOK,
            Err(err) => {
                tracing::debug!("package execution failed: {err}");
                err.vms_status()
            }
        }
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        self.shutdown();
    }
}
