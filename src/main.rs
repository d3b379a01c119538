mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use cli::Cli;
use tracing::{Level, debug, info, warn};
use tracing_subscriber::FmtSubscriber;

use pciassignd::device::pci::assigned::DeviceOptions;
use pciassignd::device::pci::caps::find_capability;
use pciassignd::device::pci::constants::config_space::capability_id;
use pciassignd::device::pci::host::HostResource;

fn main() -> Result<()> {
    let args = Cli::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(match args.verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        })
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set global tracing subscriber")?;

    let options = DeviceOptions {
        prefer_msi: args.prefer_msi,
        share_intx: !args.no_share_intx,
        ..DeviceOptions::default()
    };
    debug!("assignment options: {options:?}");

    // Inspect each device the way the assignment path would see it. The
    // actual hand-over to a guest needs a virtual machine monitor around
    // us; this binary reports what that hand-over would work with.
    for identity in &args.devices {
        let host = HostResource::open(&args.sysfs_root, *identity)
            .with_context(|| format!("Failed to open device {identity}"))?;

        info!(
            "{identity}: vendor {:04x} device {:04x}",
            host.vendor_id, host.device_id
        );

        if let Some(driver) = host.bound_driver() {
            warn!("{identity}: bound to host driver '{driver}', assignment would fail");
        }

        for region in &host.regions {
            let kind = if region.is_io() { "port" } else { "memory" };
            info!(
                "{identity}: BAR {} is a {kind} resource of {:#x} bytes at {:#x}",
                region.index, region.size, region.base_addr
            );
        }

        let snapshot = host
            .config
            .try_read_snapshot()
            .with_context(|| format!("Failed to read config space of {identity}"))?;

        let known = [
            ("power management", capability_id::POWER_MANAGEMENT),
            ("VPD", capability_id::VPD),
            ("MSI", capability_id::MSI),
            ("PCI-X", capability_id::PCI_X),
            ("PCI Express", capability_id::EXPRESS),
            ("MSI-X", capability_id::MSI_X),
        ];
        for (name, id) in known {
            if let Some(pos) = find_capability(&snapshot, id, 0) {
                info!("{identity}: {name} capability at {pos:#x}");
            }
        }

        let mut start = 0;
        while let Some(pos) = find_capability(&snapshot, capability_id::VENDOR_SPECIFIC, start) {
            info!("{identity}: vendor specific capability at {pos:#x}");
            start = pos;
        }
    }

    Ok(())
}
