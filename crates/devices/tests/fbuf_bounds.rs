use dm_devices::fbuf::{Framebuffer, BAR_REGS};
use dm_devices::opts::DeviceSpec;
use dm_devices::pci::{DeviceRegistry, PciDeviceModel, PciResourceAllocatorConfig};
use dm_devices::vm::VmContext;
use dm_platform::memory::GuestPhysMap;
use std::sync::Arc;

fn registry() -> (DeviceRegistry, dm_devices::pci::PciBdf) {
    let vm = VmContext::new(Arc::new(GuestPhysMap::new()));
    let mut registry = DeviceRegistry::with_builtin_classes(PciResourceAllocatorConfig::default());
    let bdf = registry
        .instantiate(&DeviceSpec::new("fbuf", ""), &vm)
        .unwrap();
    (registry, bdf)
}

#[test]
fn write_past_the_control_block_is_dropped() {
    let (registry, bdf) = registry();
    let fb = registry.device::<Framebuffer>(bdf).unwrap();

    fb.bar_write(BAR_REGS, 120, 4, 0x1122_3344);
    let before = fb.registers();

    // 124 + 8 > 128.
    fb.bar_write(BAR_REGS, 124, 8, u64::MAX);
    assert_eq!(fb.registers(), before);
    assert_eq!(fb.bar_read(BAR_REGS, 120, 4), 0x1122_3344);
    assert_eq!(fb.bar_read(BAR_REGS, 124, 4), 0);
    assert_eq!(fb.bar_read(BAR_REGS, 124, 8), 0);
}

#[test]
fn the_last_bytes_are_addressable() {
    let (registry, bdf) = registry();
    let fb = registry.device::<Framebuffer>(bdf).unwrap();

    fb.bar_write(BAR_REGS, 120, 8, 0x0102_0304_0506_0708);
    assert_eq!(fb.bar_read(BAR_REGS, 120, 8), 0x0102_0304_0506_0708);
    assert_eq!(fb.bar_read(BAR_REGS, 127, 1), 0x01);
}

#[test]
fn accesses_crossing_the_bar_never_reach_the_device() {
    let (registry, bdf) = registry();
    let base = registry.bar(bdf, BAR_REGS).unwrap().base;
    let fb = registry.device::<Framebuffer>(bdf).unwrap();
    let before = fb.registers();

    registry.mmio_write(base + 124, 8, u64::MAX);
    assert_eq!(fb.registers(), before);
    assert_eq!(registry.mmio_read(base + 124, 8), 0);
}
