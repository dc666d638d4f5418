//! Seams to the host display stack.
//!
//! The device model does not draw pixels or speak RFB itself. A display backend supplies the
//! graphics surface, the legacy VGA renderer and the remote display server; the framebuffer
//! device only decides *when* to resize the surface or delegate to VGA rendering.

use crate::fbuf::RfbEndpoint;
use dm_platform::memory::HostMemory;
use std::sync::Arc;

/// Host drawing surface driven by the console's render loop.
pub trait GraphicsContext {
    fn resize(&mut self, width: u16, height: u16);
}

/// Legacy VGA renderer (text modes and planar graphics).
pub trait VgaRenderer: Send + Sync {
    fn render(&self, gc: &mut dyn GraphicsContext);
}

pub trait DisplayBackend: Send + Sync {
    /// Creates a VGA emulation. With `io_only` the VGA register ports are emulated but rendering
    /// stays with the linear framebuffer. Returns `None` if the backend has no VGA support.
    fn create_vga(&self, io_only: bool) -> Option<Arc<dyn VgaRenderer>>;

    /// Hands the guest-visible pixel store to the console at its initial geometry.
    fn attach_console(&self, width: u16, height: u16, pixels: Arc<HostMemory>);

    fn start_remote_display(
        &self,
        endpoint: &RfbEndpoint,
        wait: bool,
        password: Option<&str>,
    ) -> Result<(), String>;
}
