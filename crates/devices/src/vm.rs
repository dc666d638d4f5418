//! VM-scoped wiring: the device registry, the legacy port bus and the PM timer.

use crate::display::DisplayBackend;
use crate::opts::DeviceSpec;
use crate::pci::{DeviceRegistry, PciBdf, PciResourceAllocatorConfig};
use crate::pm_timer::{register_pm_timer, PmTimer, PmTimerConfig, PM_TIMER_PORT_LEN};
use crate::DeviceError;
use dm_platform::io::IoPortBus;
use dm_platform::memory::GuestMemoryMapper;
use dm_platform::time::Clock;
use std::sync::Arc;

/// Host services a device may use while it is initialized or torn down.
#[derive(Clone)]
pub struct VmContext {
    guest_memory: Arc<dyn GuestMemoryMapper>,
    display: Option<Arc<dyn DisplayBackend>>,
}

impl VmContext {
    /// A headless VM.
    pub fn new(guest_memory: Arc<dyn GuestMemoryMapper>) -> Self {
        Self {
            guest_memory,
            display: None,
        }
    }

    pub fn with_display(mut self, display: Arc<dyn DisplayBackend>) -> Self {
        self.display = Some(display);
        self
    }

    pub fn guest_memory(&self) -> &Arc<dyn GuestMemoryMapper> {
        &self.guest_memory
    }

    pub fn display(&self) -> Option<&Arc<dyn DisplayBackend>> {
        self.display.as_ref()
    }
}

#[derive(Debug, Clone, Default)]
pub struct DeviceModelConfig {
    pub pci: PciResourceAllocatorConfig,
    pub pm_timer: PmTimerConfig,
}

/// Every emulated device of one VM.
///
/// Devices are added while the VM is being built (`&mut self`); guest accesses go through `&self`
/// from any number of vCPU threads. [`DeviceModel::shutdown`] (or drop) tears everything down.
pub struct DeviceModel<C: Clock> {
    cfg: DeviceModelConfig,
    ctx: VmContext,
    registry: DeviceRegistry,
    io: IoPortBus,
    pm_timer: Option<PmTimer<C>>,
}

impl<C: Clock + Clone> DeviceModel<C> {
    pub fn new(cfg: DeviceModelConfig, ctx: VmContext, clock: C) -> Result<Self, DeviceError> {
        let registry = DeviceRegistry::with_builtin_classes(cfg.pci.clone());
        let pm_timer = PmTimer::start(clock, cfg.pm_timer.width)?;

        let mut io = IoPortBus::new();
        register_pm_timer(&mut io, &cfg.pm_timer, &pm_timer)?;

        Ok(Self {
            cfg,
            ctx,
            registry,
            io,
            pm_timer: Some(pm_timer),
        })
    }
}

impl<C: Clock> DeviceModel<C> {
    /// Adds a device from a `[slot[:func],]class[,opt]*` line.
    pub fn add_device(&mut self, line: &str) -> Result<PciBdf, DeviceError> {
        let spec = DeviceSpec::parse(line)?;
        self.add_device_spec(&spec)
    }

    pub fn add_device_spec(&mut self, spec: &DeviceSpec) -> Result<PciBdf, DeviceError> {
        self.registry.instantiate(spec, &self.ctx).map_err(|err| {
            tracing::error!(
                class = %spec.class,
                options = %spec.options,
                error = %err,
                "device creation failed"
            );
            err
        })
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut DeviceRegistry {
        &mut self.registry
    }

    /// `None` after [`Self::shutdown`].
    pub fn pm_timer(&self) -> Option<&PmTimer<C>> {
        self.pm_timer.as_ref()
    }

    pub fn context(&self) -> &VmContext {
        &self.ctx
    }

    pub fn mmio_read(&self, addr: u64, size: usize) -> u64 {
        self.registry.mmio_read(addr, size)
    }

    pub fn mmio_write(&self, addr: u64, size: usize, value: u64) {
        self.registry.mmio_write(addr, size, value);
    }

    /// Fixed legacy ports take precedence over I/O BARs.
    pub fn pio_read(&self, port: u16, size: u8) -> u32 {
        if self.io.is_mapped(port) {
            self.io.read(port, size)
        } else {
            self.registry.pio_read(port, size)
        }
    }

    pub fn pio_write(&self, port: u16, size: u8, value: u32) {
        if self.io.is_mapped(port) {
            self.io.write(port, size, value);
        } else {
            self.registry.pio_write(port, size, value);
        }
    }

    /// Destroys every device and stops the PM timer. Idempotent.
    pub fn shutdown(&mut self) {
        self.registry.teardown(&self.ctx);
        if let Some(timer) = self.pm_timer.take() {
            self.io.unregister_range(self.cfg.pm_timer.port, PM_TIMER_PORT_LEN);
            // Joins the expiration thread.
            drop(timer);
            tracing::info!("PM timer stopped");
        }
    }
}

impl<C: Clock> Drop for DeviceModel<C> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
