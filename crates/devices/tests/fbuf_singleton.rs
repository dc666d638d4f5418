use dm_devices::fbuf::{Framebuffer, BAR_FB, BAR_REGS};
use dm_devices::opts::DeviceSpec;
use dm_devices::pci::{DeviceRegistry, PciResourceAllocatorConfig};
use dm_devices::vm::VmContext;
use dm_devices::DeviceError;
use dm_platform::memory::GuestPhysMap;
use std::sync::Arc;

#[test]
fn second_framebuffer_is_refused() {
    let mem = Arc::new(GuestPhysMap::new());
    let vm = VmContext::new(mem.clone());
    let mut registry = DeviceRegistry::with_builtin_classes(PciResourceAllocatorConfig::default());

    let bdf = registry
        .instantiate(&DeviceSpec::new("fbuf", "w=800,h=600"), &vm)
        .unwrap();
    let regs_base = registry.bar(bdf, BAR_REGS).unwrap().base;
    let fb_base = registry.bar(bdf, BAR_FB).unwrap().base;
    mem.write(fb_base, &[0x5A; 4]).unwrap();

    let err = registry
        .instantiate(&DeviceSpec::new("fbuf", ""), &vm)
        .unwrap_err();
    assert!(matches!(err, DeviceError::Duplicate { ref class } if class == "fbuf"));

    // The first instance is untouched.
    assert_eq!(registry.len(), 1);
    assert_eq!(mem.mapping_count(), 1);
    assert_eq!(registry.mmio_read(regs_base + 4, 4), (600 << 16) | 800);
    assert_eq!(registry.mmio_read(fb_base, 4), 0x5A5A_5A5A);
    let fb = registry.device::<Framebuffer>(bdf).unwrap();
    assert_eq!((fb.registers().width(), fb.registers().height()), (800, 600));
}

#[test]
fn teardown_frees_the_singleton() {
    let mem = Arc::new(GuestPhysMap::new());
    let vm = VmContext::new(mem.clone());
    let mut registry = DeviceRegistry::with_builtin_classes(PciResourceAllocatorConfig::default());

    registry
        .instantiate(&DeviceSpec::new("fbuf", ""), &vm)
        .unwrap();
    registry.teardown(&vm);
    assert_eq!(mem.mapping_count(), 0);

    registry
        .instantiate(&DeviceSpec::new("fbuf", ""), &vm)
        .unwrap();
    assert_eq!(mem.mapping_count(), 1);
}
