use dm_devices::fbuf::{DisplayMode, Framebuffer, BAR_FB, BAR_REGS, FB_SIZE};
use dm_devices::opts::DeviceSpec;
use dm_devices::pci::{DeviceRegistry, PciBarKind, PciResourceAllocatorConfig};
use dm_devices::vm::VmContext;
use dm_platform::memory::GuestPhysMap;
use std::sync::Arc;

#[test]
fn control_block_defaults() {
    let mem = Arc::new(GuestPhysMap::new());
    let vm = VmContext::new(mem.clone());
    let mut registry = DeviceRegistry::with_builtin_classes(PciResourceAllocatorConfig::default());
    let bdf = registry
        .instantiate(&DeviceSpec::new("fbuf", ""), &vm)
        .unwrap();

    let regs = registry.bar(bdf, BAR_REGS).unwrap();
    assert_eq!(regs.kind, PciBarKind::Mmio32);
    assert_eq!(regs.size, 128);

    assert_eq!(registry.mmio_read(regs.base, 4), 16 << 20);
    assert_eq!(registry.mmio_read(regs.base + 4, 2), 1024);
    assert_eq!(registry.mmio_read(regs.base + 6, 2), 768);
    assert_eq!(registry.mmio_read(regs.base + 8, 2), 32);
    assert_eq!(registry.mmio_read(regs.base + 10, 2), 0);

    let fb_bar = registry.bar(bdf, BAR_FB).unwrap();
    assert_eq!(fb_bar.size, u64::from(FB_SIZE));
    assert!(mem.is_mapped(fb_bar.base));
    assert!(mem.is_mapped(fb_bar.base + u64::from(FB_SIZE) - 1));

    let fb = registry.device::<Framebuffer>(bdf).unwrap();
    assert_eq!(fb.mode(), DisplayMode::Vga);
    assert!(fb.pixels().with_bytes(|px| px.iter().all(|&b| b == 0)));
}

#[test]
fn geometry_options_land_in_the_registers() {
    let vm = VmContext::new(Arc::new(GuestPhysMap::new()));
    let mut registry = DeviceRegistry::with_builtin_classes(PciResourceAllocatorConfig::default());
    let bdf = registry
        .instantiate(&DeviceSpec::new("fbuf", "w=0,h=0,vga=off"), &vm)
        .unwrap();

    let fb = registry.device::<Framebuffer>(bdf).unwrap();
    assert_eq!(fb.registers().width(), 1920);
    assert_eq!(fb.registers().height(), 1080);
    assert_eq!(fb.mode(), DisplayMode::LinearFramebuffer);
}
