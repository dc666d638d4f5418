//! Linear framebuffer PCI device (`fbuf`).
//!
//! BAR0 is a 128-byte control block (see [`regs`]); BAR1 is a 16 MiB pixel store that is mapped
//! directly into guest-physical memory. The device tracks whether the guest is driving the legacy
//! VGA path or the linear framebuffer by watching the width/height registers, and answers render
//! requests from the console accordingly.

pub mod config;
pub mod regs;

pub use config::{FbufConfig, RfbEndpoint, VgaMode};
pub use regs::FbufRegisters;

use crate::display::{GraphicsContext, VgaRenderer};
use crate::pci::capabilities::MsiCapability;
use crate::pci::{PciBarDefinition, PciBarRange, PciDeviceClass, PciDeviceModel, PciInitContext};
use crate::vm::VmContext;
use crate::DeviceError;
use dm_platform::memory::{HostMemory, Protection};
use regs::FBUF_REGS_SIZE;
use std::any::Any;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub const FBUF_VENDOR_ID: u16 = 0xFB5D;
pub const FBUF_DEVICE_ID: u16 = 0x40FB;

pub const PCI_CLASS_DISPLAY: u8 = 0x03;
pub const PCI_SUBCLASS_DISPLAY_VGA: u8 = 0x00;

/// Size of the pixel store behind BAR1.
pub const FB_SIZE: u32 = 16 << 20;
pub const FBUF_MSI_MESSAGES: u8 = 4;
pub const FBUF_DEPTH: u16 = 32;

pub const BAR_REGS: u8 = 0;
pub const BAR_FB: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayMode {
    Vga,
    LinearFramebuffer,
}

/// The `fbuf` device class. At most one per VM.
pub struct FramebufferClass;

impl PciDeviceClass for FramebufferClass {
    fn name(&self) -> &'static str {
        "fbuf"
    }

    fn is_singleton(&self) -> bool {
        true
    }

    fn init(
        &self,
        ctx: &mut PciInitContext<'_>,
        options: &str,
    ) -> Result<Box<dyn PciDeviceModel>, DeviceError> {
        let cfg = FbufConfig::parse(options)?;
        let vm = ctx.vm();

        // Everything that can be refused without side effects is checked before mapping.
        if cfg.rfb.is_some() && vm.display().is_none() {
            return Err(DeviceError::Unsupported(
                "remote display requested without a display backend",
            ));
        }
        let full_vga = match (cfg.vga, vm.display()) {
            (VgaMode::On, Some(display)) => Some(
                display
                    .create_vga(false)
                    .ok_or(DeviceError::Unsupported("VGA rendering not enabled"))?,
            ),
            (VgaMode::On, None) => {
                return Err(DeviceError::Unsupported("VGA rendering not enabled"));
            }
            _ => None,
        };

        let cfg_space = ctx.config();
        cfg_space.set_vendor_device_id(FBUF_VENDOR_ID, FBUF_DEVICE_ID);
        cfg_space.set_class_code(PCI_CLASS_DISPLAY, PCI_SUBCLASS_DISPLAY_VGA, 0, 0);

        let regs_bar = ctx.alloc_bar(
            BAR_REGS,
            PciBarDefinition::Mmio32 {
                size: FBUF_REGS_SIZE as u32,
                prefetchable: false,
            },
        )?;
        let fb_bar = ctx.alloc_bar(
            BAR_FB,
            PciBarDefinition::Mmio32 {
                size: FB_SIZE,
                prefetchable: false,
            },
        )?;
        ctx.add_capability(Box::new(MsiCapability::new(FBUF_MSI_MESSAGES)));

        let pixels = Arc::new(HostMemory::new(FB_SIZE as usize));
        tracing::debug!(base = fb_bar.base, size = FB_SIZE, "mapping framebuffer");
        if let Err(err) = vm.guest_memory().map_direct(
            fb_bar.base,
            pixels.clone(),
            Protection::READ | Protection::WRITE,
        ) {
            tracing::error!(
                base = fb_bar.base,
                error = %err,
                "framebuffer mapping failed; try deleting the VM and restarting"
            );
            return Err(err.into());
        }
        pixels.fill(0);

        let vga = match vm.display() {
            Some(display) => {
                display.attach_console(cfg.width, cfg.height, pixels.clone());
                match cfg.vga {
                    VgaMode::On => full_vga,
                    VgaMode::Io => display.create_vga(true),
                    VgaMode::Off => None,
                }
            }
            None => None,
        };

        if let (Some(endpoint), Some(display)) = (&cfg.rfb, vm.display()) {
            if let Err(reason) =
                display.start_remote_display(endpoint, cfg.wait, cfg.password.as_deref())
            {
                if let Err(err) = vm.guest_memory().unmap(fb_bar.base) {
                    tracing::warn!(base = fb_bar.base, error = %err, "framebuffer unmap failed");
                }
                return Err(DeviceError::RemoteDisplay(reason));
            }
        }

        let mode = if cfg.vga.enabled() {
            DisplayMode::Vga
        } else {
            DisplayMode::LinearFramebuffer
        };
        tracing::info!(
            width = cfg.width,
            height = cfg.height,
            vga = ?cfg.vga,
            ?mode,
            "framebuffer initialized"
        );

        Ok(Box::new(Framebuffer {
            regs_bar,
            fb_bar,
            pixels,
            vga,
            state: Mutex::new(FbufState {
                regs: FbufRegisters::new(FB_SIZE, cfg.width, cfg.height, FBUF_DEPTH),
                mode,
                cached_width: 0,
                cached_height: 0,
            }),
            config: cfg,
        }))
    }
}

#[derive(Debug)]
struct FbufState {
    regs: FbufRegisters,
    mode: DisplayMode,
    /// Geometry the console surface was last resized to.
    cached_width: u16,
    cached_height: u16,
}

impl FbufState {
    fn update_mode(&mut self) {
        let (width, height) = (self.regs.width(), self.regs.height());
        match self.mode {
            DisplayMode::LinearFramebuffer if width == 0 && height == 0 => {
                tracing::info!("switching to VGA mode");
                self.mode = DisplayMode::Vga;
                self.cached_width = 0;
                self.cached_height = 0;
            }
            DisplayMode::Vga if width != 0 && height != 0 => {
                tracing::info!(width, height, "switching to linear framebuffer mode");
                self.mode = DisplayMode::LinearFramebuffer;
            }
            _ => {}
        }
    }
}

pub struct Framebuffer {
    regs_bar: PciBarRange,
    fb_bar: PciBarRange,
    pixels: Arc<HostMemory>,
    config: FbufConfig,
    vga: Option<Arc<dyn VgaRenderer>>,
    state: Mutex<FbufState>,
}

impl Framebuffer {
    fn state(&self) -> MutexGuard<'_, FbufState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn mode(&self) -> DisplayMode {
        self.state().mode
    }

    /// Snapshot of the control block.
    pub fn registers(&self) -> FbufRegisters {
        self.state().regs.clone()
    }

    /// Geometry of the console surface as of the last render.
    pub fn cached_size(&self) -> (u16, u16) {
        let state = self.state();
        (state.cached_width, state.cached_height)
    }

    pub fn pixels(&self) -> &Arc<HostMemory> {
        &self.pixels
    }

    pub fn config(&self) -> &FbufConfig {
        &self.config
    }

    pub fn regs_bar(&self) -> PciBarRange {
        self.regs_bar
    }

    pub fn fb_bar(&self) -> PciBarRange {
        self.fb_bar
    }

    /// Console render callback: either hands the frame to the VGA renderer or makes sure the
    /// surface matches the guest's linear framebuffer geometry.
    pub fn render(&self, gc: &mut dyn GraphicsContext) {
        let mut state = self.state();
        if self.config.vga.full() && state.mode == DisplayMode::Vga {
            if let Some(vga) = &self.vga {
                let vga = vga.clone();
                drop(state);
                vga.render(gc);
                return;
            }
        }

        let (width, height) = (state.regs.width(), state.regs.height());
        if (state.cached_width, state.cached_height) != (width, height) {
            tracing::debug!(width, height, "resizing console surface");
            gc.resize(width, height);
            state.cached_width = width;
            state.cached_height = height;
        }
    }

    fn pixel_read(&self, offset: u64, size: usize) -> u64 {
        let mut bytes = [0u8; 8];
        let Some(buf) = bytes.get_mut(..size) else {
            tracing::warn!(offset, size, "fbuf: unsupported pixel access size");
            return 0;
        };
        if let Err(err) = self.pixels.read(offset, buf) {
            tracing::warn!(error = %err, "fbuf: pixel read rejected");
            return 0;
        }
        u64::from_le_bytes(bytes)
    }

    fn pixel_write(&self, offset: u64, size: usize, value: u64) {
        let bytes = value.to_le_bytes();
        let Some(data) = bytes.get(..size) else {
            tracing::warn!(offset, size, "fbuf: unsupported pixel access size");
            return;
        };
        if let Err(err) = self.pixels.write(offset, data) {
            tracing::warn!(error = %err, "fbuf: pixel write rejected");
        }
    }
}

impl PciDeviceModel for Framebuffer {
    fn bar_read(&self, bar: u8, offset: u64, size: usize) -> u64 {
        match bar {
            BAR_REGS => match self.state().regs.read(offset, size) {
                Ok(value) => {
                    tracing::trace!(offset, size, value, "fbuf rd");
                    value
                }
                Err(err) => {
                    tracing::warn!(error = %err, "fbuf: register read rejected");
                    0
                }
            },
            BAR_FB => self.pixel_read(offset, size),
            _ => {
                tracing::warn!(bar, offset, size, "fbuf: read from unknown BAR");
                0
            }
        }
    }

    fn bar_write(&self, bar: u8, offset: u64, size: usize, value: u64) {
        match bar {
            BAR_REGS => {
                tracing::trace!(offset, size, value, "fbuf wr");
                let mut state = self.state();
                match state.regs.write(offset, size, value) {
                    Ok(()) => state.update_mode(),
                    Err(err) => tracing::warn!(error = %err, "fbuf: register write rejected"),
                }
            }
            BAR_FB => self.pixel_write(offset, size, value),
            _ => tracing::warn!(bar, offset, size, value, "fbuf: write to unknown BAR"),
        }
    }

    fn deinit(&self, vm: &VmContext) {
        match vm.guest_memory().unmap(self.fb_bar.base) {
            Ok(_) => tracing::debug!(base = self.fb_bar.base, "framebuffer unmapped"),
            Err(err) => {
                tracing::warn!(base = self.fb_bar.base, error = %err, "framebuffer unmap failed");
            }
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
