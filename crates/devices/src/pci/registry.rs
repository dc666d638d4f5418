//! Device classes, device instances and guest access dispatch.
//!
//! A [`PciDeviceClass`] is registered once per emulation kind at startup. Instantiating it from a
//! configuration line yields a [`PciDeviceModel`] owned by the [`DeviceRegistry`], together with
//! its config space and BAR assignments. Guest MMIO/PIO accesses are resolved through the
//! [`BarTable`] and forwarded to the owning model with a region-relative offset.
//!
//! The registry is only mutated while the VM is being built or torn down (`&mut self`). Guest
//! accesses take `&self`; per-device state synchronizes itself.

use super::bar_table::{BarEntry, BarSpace, BarTable};
use super::capabilities::PciCapability;
use super::config::{PciBarDefinition, PciBarRange, PciConfigSpace};
use super::resources::{PciResourceAllocator, PciResourceAllocatorConfig, PciResourceError};
use super::PciBdf;
use crate::opts::DeviceSpec;
use crate::vm::VmContext;
use crate::DeviceError;
use std::any::Any;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// A live device instance.
///
/// `offset` is relative to the start of BAR `bar`, and `offset + size` has already been checked
/// against the BAR size. The access width is whatever the guest used; rejecting widths the device
/// does not support is up to the device.
pub trait PciDeviceModel: Any + Send + Sync {
    fn bar_read(&self, bar: u8, offset: u64, size: usize) -> u64 {
        tracing::warn!(bar, offset, size, "read from a BAR without a handler");
        0
    }

    fn bar_write(&self, bar: u8, offset: u64, size: usize, value: u64) {
        tracing::warn!(bar, offset, size, value, "write to a BAR without a handler");
    }

    /// Releases host resources (guest mappings, display hooks). Called once, at teardown.
    fn deinit(&self, _vm: &VmContext) {}

    fn as_any(&self) -> &dyn Any;
}

/// An emulation kind, looked up by name from device configuration lines.
pub trait PciDeviceClass: Send + Sync {
    fn name(&self) -> &'static str;

    /// At most one instance per VM.
    fn is_singleton(&self) -> bool {
        false
    }

    /// Builds a device: sets up its config space, allocates its BARs through `ctx` and parses
    /// `options`. On error every resource taken through `ctx` is released by the registry; the
    /// class must undo any host-side effects itself.
    fn init(
        &self,
        ctx: &mut PciInitContext<'_>,
        options: &str,
    ) -> Result<Box<dyn PciDeviceModel>, DeviceError>;
}

/// What a device class can touch while it initializes.
pub struct PciInitContext<'a> {
    bdf: PciBdf,
    config: PciConfigSpace,
    bars: Vec<BarEntry>,
    allocator: &'a mut PciResourceAllocator,
    vm: &'a VmContext,
}

impl<'a> PciInitContext<'a> {
    pub fn bdf(&self) -> PciBdf {
        self.bdf
    }

    pub fn vm(&self) -> &'a VmContext {
        self.vm
    }

    pub fn config(&mut self) -> &mut PciConfigSpace {
        &mut self.config
    }

    /// Allocates guest address space for BAR `index` and programs the BAR register.
    pub fn alloc_bar(
        &mut self,
        index: u8,
        def: PciBarDefinition,
    ) -> Result<PciBarRange, DeviceError> {
        let range = self.allocator.allocate_bar(def)?;
        self.config.set_bar(index, def, range.base);
        self.bars.push(BarEntry {
            owner: self.bdf,
            bar: index,
            range,
        });
        Ok(range)
    }

    pub fn add_capability(&mut self, capability: Box<dyn PciCapability>) -> u8 {
        self.config.add_capability(capability)
    }
}

struct DeviceInstance {
    class: &'static str,
    config: Mutex<PciConfigSpace>,
    model: Box<dyn PciDeviceModel>,
}

impl DeviceInstance {
    fn config(&self) -> MutexGuard<'_, PciConfigSpace> {
        self.config.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct DeviceRegistry {
    classes: BTreeMap<&'static str, Box<dyn PciDeviceClass>>,
    allocator: PciResourceAllocator,
    bars: BarTable,
    devices: BTreeMap<PciBdf, DeviceInstance>,
    creation_order: Vec<PciBdf>,
}

impl DeviceRegistry {
    /// An empty registry with no device classes.
    pub fn new(cfg: PciResourceAllocatorConfig) -> Self {
        Self {
            classes: BTreeMap::new(),
            allocator: PciResourceAllocator::new(cfg),
            bars: BarTable::new(),
            devices: BTreeMap::new(),
            creation_order: Vec::new(),
        }
    }

    /// A registry with every device class this crate implements.
    pub fn with_builtin_classes(cfg: PciResourceAllocatorConfig) -> Self {
        let mut registry = Self::new(cfg);
        registry.register_class(Box::new(super::hostbridge::HostBridgeClass::netapp()));
        registry.register_class(Box::new(super::hostbridge::HostBridgeClass::amd()));
        registry.register_class(Box::new(crate::fbuf::FramebufferClass));
        registry
    }

    /// Registers a device class, returning the class it replaced.
    pub fn register_class(
        &mut self,
        class: Box<dyn PciDeviceClass>,
    ) -> Option<Box<dyn PciDeviceClass>> {
        self.classes.insert(class.name(), class)
    }

    pub fn class_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.classes.keys().copied()
    }

    /// Creates a device from a configuration line and returns where it was placed.
    ///
    /// Either the device is fully created (config space, BARs, model) or nothing changes.
    pub fn instantiate(&mut self, spec: &DeviceSpec, vm: &VmContext) -> Result<PciBdf, DeviceError> {
        let class = self
            .classes
            .get(spec.class.as_str())
            .ok_or_else(|| DeviceError::UnknownClass(spec.class.clone()))?;
        let class_name = class.name();

        if class.is_singleton() && self.find_by_class(class_name).is_some() {
            tracing::error!(class = class_name, "only one instance of this device is allowed");
            return Err(DeviceError::Duplicate {
                class: class_name.to_string(),
            });
        }

        let bdf = match spec.slot {
            Some(bdf) if self.devices.contains_key(&bdf) => {
                return Err(PciResourceError::SlotInUse(bdf).into());
            }
            Some(bdf) => bdf,
            None => (0..PciBdf::MAX_DEVICES)
                .map(|device| PciBdf::new(0, device, 0))
                .find(|bdf| !self.devices.contains_key(bdf))
                .ok_or(PciResourceError::NoFreeSlot)?,
        };

        let allocator_snapshot = self.allocator.clone();
        let mut ctx = PciInitContext {
            bdf,
            config: PciConfigSpace::new(0, 0),
            bars: Vec::new(),
            allocator: &mut self.allocator,
            vm,
        };

        let model = match class.init(&mut ctx, &spec.options) {
            Ok(model) => model,
            Err(err) => {
                drop(ctx);
                self.allocator = allocator_snapshot;
                return Err(err);
            }
        };
        let PciInitContext { config, bars, .. } = ctx;

        for entry in &bars {
            if let Err(err) = self.bars.insert(*entry) {
                self.bars.remove_owner(bdf);
                model.deinit(vm);
                self.allocator = allocator_snapshot;
                return Err(err.into());
            }
        }

        for entry in &bars {
            tracing::info!(
                class = class_name,
                %bdf,
                bar = entry.bar,
                kind = ?entry.range.kind,
                base = entry.range.base,
                size = entry.range.size,
                "BAR assigned"
            );
        }
        tracing::info!(class = class_name, %bdf, "PCI device created");

        self.devices.insert(
            bdf,
            DeviceInstance {
                class: class_name,
                config: Mutex::new(config),
                model,
            },
        );
        self.creation_order.push(bdf);
        Ok(bdf)
    }

    /// Destroys every device, newest first, and returns all address space to the allocator.
    pub fn teardown(&mut self, vm: &VmContext) {
        while let Some(bdf) = self.creation_order.pop() {
            if let Some(dev) = self.devices.remove(&bdf) {
                dev.model.deinit(vm);
                tracing::info!(class = dev.class, %bdf, "PCI device destroyed");
            }
        }
        self.devices.clear();
        self.bars.clear();
        self.allocator.reset();
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn devices(&self) -> impl Iterator<Item = (PciBdf, &'static str)> + '_ {
        self.devices.iter().map(|(bdf, dev)| (*bdf, dev.class))
    }

    pub fn find_by_class(&self, class: &str) -> Option<PciBdf> {
        self.devices
            .iter()
            .find(|(_, dev)| dev.class == class)
            .map(|(bdf, _)| *bdf)
    }

    /// Downcasts the model at `bdf`.
    pub fn device<T: 'static>(&self, bdf: PciBdf) -> Option<&T> {
        self.devices
            .get(&bdf)
            .and_then(|dev| dev.model.as_any().downcast_ref::<T>())
    }

    pub fn bar_entries(&self) -> impl Iterator<Item = &BarEntry> {
        self.bars.iter()
    }

    pub fn bar(&self, bdf: PciBdf, index: u8) -> Option<PciBarRange> {
        self.devices.get(&bdf)?.config().bar_range(index)
    }

    pub fn config_read(&self, bdf: PciBdf, offset: u16, size: usize) -> u32 {
        match self.devices.get(&bdf) {
            Some(dev) => dev.config().read(offset, size),
            None => 0xFFFF_FFFF,
        }
    }

    pub fn config_write(&self, bdf: PciBdf, offset: u16, size: usize, value: u32) {
        if let Some(dev) = self.devices.get(&bdf) {
            dev.config().write(offset, size, value);
        }
    }

    /// Runs `f` on the config space of `bdf` (e.g. to inspect a capability).
    pub fn with_config<R>(&self, bdf: PciBdf, f: impl FnOnce(&mut PciConfigSpace) -> R) -> Option<R> {
        let dev = self.devices.get(&bdf)?;
        let mut config = dev.config();
        Some(f(&mut config))
    }

    pub fn mmio_read(&self, addr: u64, size: usize) -> u64 {
        self.dispatch_read(BarSpace::Memory, addr, size)
    }

    pub fn mmio_write(&self, addr: u64, size: usize, value: u64) {
        self.dispatch_write(BarSpace::Memory, addr, size, value);
    }

    pub fn pio_read(&self, port: u16, size: u8) -> u32 {
        self.dispatch_read(BarSpace::Io, u64::from(port), usize::from(size)) as u32
    }

    pub fn pio_write(&self, port: u16, size: u8, value: u32) {
        self.dispatch_write(BarSpace::Io, u64::from(port), usize::from(size), u64::from(value));
    }

    /// Resolves `addr` to a device, BAR and in-bounds offset.
    fn resolve(
        &self,
        space: BarSpace,
        addr: u64,
        size: usize,
    ) -> Result<(&DeviceInstance, u8, u64), Unresolved> {
        let entry = self.bars.lookup(space, addr).ok_or(Unresolved::Unmapped)?;
        let offset = addr - entry.range.base;
        if offset.saturating_add(size as u64) > entry.range.size {
            tracing::warn!(
                bdf = %entry.owner,
                bar = entry.bar,
                offset,
                size,
                "access crosses the end of the BAR"
            );
            return Err(Unresolved::OutOfBounds);
        }
        let dev = self
            .devices
            .get(&entry.owner)
            .ok_or(Unresolved::Unmapped)?;
        Ok((dev, entry.bar, offset))
    }

    fn dispatch_read(&self, space: BarSpace, addr: u64, size: usize) -> u64 {
        match self.resolve(space, addr, size) {
            Ok((dev, bar, offset)) => {
                let value = dev.model.bar_read(bar, offset, size);
                tracing::trace!(class = dev.class, bar, offset, size, value, "BAR read");
                value
            }
            Err(Unresolved::Unmapped) => {
                tracing::debug!(?space, addr, size, "read from unmapped address");
                all_ones(size)
            }
            Err(Unresolved::OutOfBounds) => 0,
        }
    }

    fn dispatch_write(&self, space: BarSpace, addr: u64, size: usize, value: u64) {
        match self.resolve(space, addr, size) {
            Ok((dev, bar, offset)) => {
                tracing::trace!(class = dev.class, bar, offset, size, value, "BAR write");
                dev.model.bar_write(bar, offset, size, value);
            }
            Err(Unresolved::Unmapped) => {
                tracing::debug!(?space, addr, size, value, "write to unmapped address dropped");
            }
            Err(Unresolved::OutOfBounds) => {}
        }
    }
}

enum Unresolved {
    Unmapped,
    OutOfBounds,
}

fn all_ones(size: usize) -> u64 {
    match size {
        0 => 0,
        1..=7 => (1u64 << (size * 8)) - 1,
        _ => u64::MAX,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dm_platform::memory::GuestPhysMap;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    fn vm() -> VmContext {
        VmContext::new(Arc::new(GuestPhysMap::new()))
    }

    struct Scratch {
        last_write: AtomicU64,
    }

    impl PciDeviceModel for Scratch {
        fn bar_read(&self, bar: u8, offset: u64, _size: usize) -> u64 {
            (u64::from(bar) << 32) | offset
        }

        fn bar_write(&self, _bar: u8, _offset: u64, _size: usize, value: u64) {
            self.last_write.store(value, Ordering::SeqCst);
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    struct ScratchClass {
        fail: bool,
    }

    impl PciDeviceClass for ScratchClass {
        fn name(&self) -> &'static str {
            if self.fail {
                "broken"
            } else {
                "scratch"
            }
        }

        fn init(
            &self,
            ctx: &mut PciInitContext<'_>,
            options: &str,
        ) -> Result<Box<dyn PciDeviceModel>, DeviceError> {
            ctx.config().set_vendor_device_id(0x1234, 0x5678);
            ctx.alloc_bar(
                0,
                PciBarDefinition::Mmio32 {
                    size: 0x100,
                    prefetchable: false,
                },
            )?;
            ctx.alloc_bar(2, PciBarDefinition::Io { size: 0x10 })?;
            if self.fail {
                return Err(DeviceError::config(self.name(), options, "always fails"));
            }
            Ok(Box::new(Scratch {
                last_write: AtomicU64::new(0),
            }))
        }
    }

    fn registry() -> DeviceRegistry {
        let mut registry = DeviceRegistry::new(PciResourceAllocatorConfig::default());
        registry.register_class(Box::new(ScratchClass { fail: false }));
        registry.register_class(Box::new(ScratchClass { fail: true }));
        registry
    }

    #[test]
    fn dispatch_reaches_the_owning_bar_with_relative_offsets() {
        let vm = vm();
        let mut registry = registry();
        let bdf = registry
            .instantiate(&DeviceSpec::new("scratch", ""), &vm)
            .unwrap();

        assert_eq!(bdf, PciBdf::new(0, 0, 0));
        assert_eq!(registry.mmio_read(0xE000_0010, 4), 0x10);
        assert_eq!(registry.pio_read(0x1004, 2), (2u64 << 32 | 4) as u32);

        registry.mmio_write(0xE000_00F8, 8, 0xAABB);
        let dev = registry.device::<Scratch>(bdf).unwrap();
        assert_eq!(dev.last_write.load(Ordering::SeqCst), 0xAABB);
    }

    #[test]
    fn out_of_bounds_and_unmapped_accesses() {
        let vm = vm();
        let mut registry = registry();
        let bdf = registry
            .instantiate(&DeviceSpec::new("scratch", ""), &vm)
            .unwrap();

        // Crosses the end of BAR0: read 0, write dropped.
        assert_eq!(registry.mmio_read(0xE000_00FC, 8), 0);
        registry.mmio_write(0xE000_00FC, 8, 0x1);
        assert_eq!(
            registry
                .device::<Scratch>(bdf)
                .unwrap()
                .last_write
                .load(Ordering::SeqCst),
            0
        );

        assert_eq!(registry.mmio_read(0xD000_0000, 4), 0xFFFF_FFFF);
        assert_eq!(registry.pio_read(0x2000, 1), 0xFF);
    }

    #[test]
    fn failed_init_leaves_no_trace() {
        let vm = vm();
        let mut registry = registry();

        let err = registry
            .instantiate(&DeviceSpec::new("broken", "x"), &vm)
            .unwrap_err();
        assert!(matches!(err, DeviceError::ConfigParse { .. }));
        assert!(registry.is_empty());
        assert_eq!(registry.bar_entries().count(), 0);

        // The allocator was rolled back: the next device gets the first addresses.
        let bdf = registry
            .instantiate(&DeviceSpec::new("scratch", ""), &vm)
            .unwrap();
        assert_eq!(registry.bar(bdf, 0).unwrap().base, 0xE000_0000);
    }

    #[test]
    fn unknown_class_and_occupied_slot() {
        let vm = vm();
        let mut registry = registry();

        assert!(matches!(
            registry.instantiate(&DeviceSpec::new("nope", ""), &vm),
            Err(DeviceError::UnknownClass(name)) if name == "nope"
        ));

        let slot = PciBdf::new(0, 5, 0);
        registry
            .instantiate(&DeviceSpec::new("scratch", "").at(slot), &vm)
            .unwrap();
        assert!(matches!(
            registry.instantiate(&DeviceSpec::new("scratch", "").at(slot), &vm),
            Err(DeviceError::ResourceAllocation(PciResourceError::SlotInUse(bdf))) if bdf == slot
        ));
    }

    #[test]
    fn config_routing_and_absent_devices() {
        let vm = vm();
        let mut registry = registry();
        let bdf = registry
            .instantiate(&DeviceSpec::new("scratch", ""), &vm)
            .unwrap();

        assert_eq!(registry.config_read(bdf, 0x00, 4), 0x5678_1234);
        assert_eq!(registry.config_read(bdf, 0x10, 4), 0xE000_0000);
        assert_eq!(registry.config_read(bdf, 0x18, 4), 0x0000_1001);
        assert_eq!(registry.config_read(PciBdf::new(0, 9, 0), 0, 4), 0xFFFF_FFFF);

        registry.config_write(bdf, 0x3C, 1, 0x0B);
        assert_eq!(registry.config_read(bdf, 0x3C, 1), 0x0B);
    }

    #[test]
    fn teardown_releases_everything() {
        let vm = vm();
        let mut registry = registry();
        registry
            .instantiate(&DeviceSpec::new("scratch", ""), &vm)
            .unwrap();
        registry
            .instantiate(&DeviceSpec::new("scratch", ""), &vm)
            .unwrap();
        assert_eq!(registry.bar_entries().count(), 4);

        registry.teardown(&vm);
        assert!(registry.is_empty());
        assert_eq!(registry.bar_entries().count(), 0);
        assert_eq!(registry.mmio_read(0xE000_0000, 4), 0xFFFF_FFFF);
    }
}
