//! This module implements the CLI interface.

use std::path::PathBuf;

use clap::Parser;

use pciassignd::device::pci::host::HostIdentity;

#[derive(Parser, Debug)]
#[command(
    name = env!("CARGO_PKG_NAME"),
    version = env!("CARGO_PKG_VERSION"),
    author = env!("CARGO_PKG_AUTHORS"),
    about = env!("CARGO_PKG_DESCRIPTION"),
    long_about = None
)]
pub struct Cli {
    /// Enable verbose logging. Can be specified multiple times to
    /// increase verbosity.
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// The host address of a PCI device to inspect, as printed by
    /// `lspci -D` (dddd:bb:ss.f). Can be specified multiple times.
    #[arg(long = "device", value_name = "ADDRESS", required = true)]
    pub devices: Vec<HostIdentity>,

    /// Where the host exposes its PCI devices.
    #[arg(long, default_value = "/sys/bus/pci/devices")]
    pub sysfs_root: PathBuf,

    /// Back guest INTx delivery with a host-side MSI where the device
    /// supports it.
    #[arg(long)]
    pub prefer_msi: bool,

    /// Do not share the host interrupt line with other devices, even if
    /// the kernel could mask INTx per device.
    #[arg(long)]
    pub no_share_intx: bool,
}
