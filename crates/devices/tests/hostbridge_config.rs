use dm_devices::opts::DeviceSpec;
use dm_devices::pci::capabilities::PCI_CAP_ID_EXPRESS;
use dm_devices::pci::{DeviceRegistry, PciBdf, PciResourceAllocatorConfig};
use dm_devices::vm::VmContext;
use dm_platform::memory::GuestPhysMap;
use std::sync::Arc;

fn create(class: &str) -> (DeviceRegistry, PciBdf) {
    let vm = VmContext::new(Arc::new(GuestPhysMap::new()));
    let mut registry = DeviceRegistry::with_builtin_classes(PciResourceAllocatorConfig::default());
    let bdf = registry
        .instantiate(&DeviceSpec::new(class, ""), &vm)
        .unwrap();
    (registry, bdf)
}

#[test]
fn hostbridge_identity() {
    let (registry, bdf) = create("hostbridge");
    assert_eq!(bdf, PciBdf::new(0, 0, 0));

    assert_eq!(registry.config_read(bdf, 0x00, 2), 0x1275);
    assert_eq!(registry.config_read(bdf, 0x02, 2), 0x1275);
    // Class bridge/host, prog-if 0, revision 0x0b.
    assert_eq!(registry.config_read(bdf, 0x08, 4), 0x0600_000B);
    assert_eq!(registry.config_read(bdf, 0x0E, 1), 0x00);
    assert_eq!(registry.config_read(bdf, 0x2C, 4), 0);
    assert_eq!(registry.bar_entries().count(), 0);
}

#[test]
fn amd_hostbridge_identity() {
    let (registry, bdf) = create("amd_hostbridge");
    assert_eq!(registry.config_read(bdf, 0x00, 4), 0x7432_1022);
}

#[test]
fn pcie_root_port_capability() {
    let (registry, bdf) = create("hostbridge");

    // Capabilities list bit in status.
    assert_ne!(registry.config_read(bdf, 0x06, 2) & 0x10, 0);
    let cap = registry.config_read(bdf, 0x34, 1) as u16;
    assert_eq!(registry.config_read(bdf, cap, 1), u32::from(PCI_CAP_ID_EXPRESS));
    assert_eq!(registry.config_read(bdf, cap + 1, 1), 0);
    assert_eq!(registry.config_read(bdf, cap + 0x02, 2), 0x0042);
    assert_eq!(registry.config_read(bdf, cap + 0x0C, 4), 0x411);
    assert_eq!(registry.config_read(bdf, cap + 0x12, 2), 0x11);
}

#[test]
fn identity_is_read_only() {
    let (registry, bdf) = create("hostbridge");
    registry.config_write(bdf, 0x00, 4, 0xDEAD_BEEF);
    registry.config_write(bdf, 0x08, 4, 0);
    assert_eq!(registry.config_read(bdf, 0x00, 4), 0x1275_1275);
    assert_eq!(registry.config_read(bdf, 0x08, 4), 0x0600_000B);
}
