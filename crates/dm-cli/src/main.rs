#![forbid(unsafe_code)]

//! Native runner for the device model: builds a VM's devices from configuration lines, lets the
//! PM timer run for a while and prints what the guest would see.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use dm_devices::display::{DisplayBackend, VgaRenderer};
use dm_devices::fbuf::RfbEndpoint;
use dm_devices::pci::PciResourceAllocatorConfig;
use dm_devices::pm_timer::{PmTimerConfig, PmTimerWidth, PM_TIMER_FREQUENCY_HZ};
use dm_devices::vm::{DeviceModel, DeviceModelConfig, VmContext};
use dm_platform::memory::{GuestPhysMap, HostMemory};
use dm_platform::time::MonotonicClock;

#[derive(Debug, Parser)]
#[command(about = "Native runner for the virtual device model (bring-up/debugging)")]
struct Args {
    /// Device configuration line, `[slot[:func],]class[,opt]*`. Repeatable.
    #[arg(short = 's', long = "device", value_name = "LINE")]
    devices: Vec<String>,

    /// Use the legacy 24-bit PM timer instead of the 32-bit one.
    #[arg(long)]
    pm_timer_24bit: bool,

    /// I/O port of the PM timer.
    #[arg(long, default_value_t = dm_devices::pm_timer::PM_TIMER_PORT, value_parser = parse_u16)]
    pm_timer_port: u16,

    /// Base of the 32-bit MMIO window BARs are allocated from.
    #[arg(long, value_parser = parse_u64)]
    mmio_base: Option<u64>,

    /// Run for this many milliseconds of host time, sampling the PM timer.
    #[arg(long, default_value_t = 100)]
    run_ms: u64,

    /// Attach a logging display backend (no VGA renderer, no RFB server).
    #[arg(long)]
    display: bool,
}

fn parse_u16(s: &str) -> Result<u16, String> {
    parse_u64(s).and_then(|v| u16::try_from(v).map_err(|_| format!("{v:#x} is not a port")))
}

fn parse_u64(s: &str) -> Result<u64, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid number `{s}`: {e}"))
}

/// Display backend that only logs what the device model asks of it.
struct LogDisplay;

impl DisplayBackend for LogDisplay {
    fn create_vga(&self, io_only: bool) -> Option<Arc<dyn VgaRenderer>> {
        tracing::info!(io_only, "VGA emulation requested; not available in this runner");
        None
    }

    fn attach_console(&self, width: u16, height: u16, pixels: Arc<HostMemory>) {
        tracing::info!(width, height, bytes = pixels.len(), "console attached");
    }

    fn start_remote_display(
        &self,
        endpoint: &RfbEndpoint,
        wait: bool,
        password: Option<&str>,
    ) -> Result<(), String> {
        tracing::info!(
            host = endpoint.host.as_deref().unwrap_or("*"),
            port = endpoint.port,
            wait,
            password = password.is_some(),
            "remote display requested"
        );
        Err("this runner has no RFB server".to_string())
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let mut pci = PciResourceAllocatorConfig::default();
    if let Some(base) = args.mmio_base {
        pci.mmio_base = base;
    }
    let cfg = DeviceModelConfig {
        pci,
        pm_timer: PmTimerConfig {
            port: args.pm_timer_port,
            width: if args.pm_timer_24bit {
                PmTimerWidth::Bits24
            } else {
                PmTimerWidth::Bits32
            },
        },
    };

    let mut ctx = VmContext::new(Arc::new(GuestPhysMap::new()));
    if args.display {
        ctx = ctx.with_display(Arc::new(LogDisplay));
    }

    let mut model = DeviceModel::new(cfg.clone(), ctx, MonotonicClock::new())
        .context("failed to start the device model")?;
    for line in &args.devices {
        model
            .add_device(line)
            .with_context(|| format!("failed to create device `{line}`"))?;
    }

    print_devices(&model);
    sample_pm_timer(&model, &cfg, Duration::from_millis(args.run_ms));

    model.shutdown();
    Ok(())
}

fn print_devices(model: &DeviceModel<MonotonicClock>) {
    let registry = model.registry();
    if registry.is_empty() {
        println!("no PCI devices");
        return;
    }
    for (bdf, class) in registry.devices() {
        let id = registry.config_read(bdf, 0x00, 4);
        let class_code = registry.config_read(bdf, 0x08, 4) >> 8;
        println!(
            "{bdf} {class:<16} {:04x}:{:04x} class {class_code:06x}",
            id & 0xFFFF,
            id >> 16
        );
        for index in 0..6 {
            if let Some(bar) = registry.bar(bdf, index) {
                println!(
                    "    BAR{index} {:?} {:#010x}..{:#010x} ({:#x} bytes)",
                    bar.kind,
                    bar.base,
                    bar.end_exclusive(),
                    bar.size
                );
            }
        }
    }
}

fn sample_pm_timer(model: &DeviceModel<MonotonicClock>, cfg: &DeviceModelConfig, run: Duration) {
    let port = cfg.pm_timer.port;
    let mask = cfg.pm_timer.width.carry_mask() | cfg.pm_timer.width.no_carry_mask();

    let start = Instant::now();
    let first = model.pio_read(port, 4);
    thread::sleep(run);
    let last = model.pio_read(port, 4);
    let elapsed = start.elapsed();

    let ticks = u64::from(last.wrapping_sub(first) & mask);
    let expected = elapsed.as_nanos() * u128::from(PM_TIMER_FREQUENCY_HZ) / 1_000_000_000;
    println!(
        "PM timer @ {port:#x}: {first:#010x} -> {last:#010x}, {ticks} ticks in {elapsed:?} \
         (expected ~{expected})"
    );
}
