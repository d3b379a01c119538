//! # Host Device Access
//!
//! The host-side view of the physical device, obtained through pci-sysfs.
//! This module knows how to locate a device by its address, talk to its
//! configuration space and enumerate its BAR resources. It knows nothing
//! about guests; the emulation layers build on top of it.

use std::fmt;
use std::fs::{File, OpenOptions, read_link, read_to_string, write};
use std::io;
use std::num::ParseIntError;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use thiserror::Error;
use tracing::{debug, error, warn};

use crate::device::pci::constants::{config_space, resource_flags};

/// The address of a PCI device on the host, as printed by `lspci -D`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostIdentity {
    /// The PCI domain (also called segment).
    pub domain: u16,
    /// The bus number within the domain.
    pub bus: u8,
    /// The device (slot) number on the bus.
    pub slot: u8,
    /// The function number within the slot.
    pub function: u8,
}

impl HostIdentity {
    /// The combined device/function byte as used on the wire.
    #[must_use]
    pub fn devfn(&self) -> u8 {
        (self.slot << 3) | (self.function & 0x7)
    }

    /// The handle under which the host kernel tracks an assigned device.
    #[must_use]
    pub fn assigned_dev_id(&self) -> u32 {
        (u32::from(self.domain) << 16) | (u32::from(self.bus) << 8) | u32::from(self.devfn())
    }
}

impl fmt::Display for HostIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{:x}",
            self.domain, self.bus, self.slot, self.function
        )
    }
}

/// Failed to parse a PCI device address.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseIdentityError {
    /// The address does not have the `dddd:bb:ss.f` shape.
    #[error("expected an address of the form dddd:bb:ss.f")]
    MalformedAddress,
    /// One of the address components is not a hexadecimal number.
    #[error("address component is not a hex number: {0}")]
    MalformedComponent(#[from] ParseIntError),
    /// The slot or function number is out of range.
    #[error("slot must be below 0x20 and function below 0x8")]
    ComponentOutOfRange,
}

impl FromStr for HostIdentity {
    type Err = ParseIdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (domain, rest) = s
            .split_once(':')
            .ok_or(ParseIdentityError::MalformedAddress)?;
        let (bus, rest) = rest
            .split_once(':')
            .ok_or(ParseIdentityError::MalformedAddress)?;
        let (slot, function) = rest
            .split_once('.')
            .ok_or(ParseIdentityError::MalformedAddress)?;

        let identity = Self {
            domain: u16::from_str_radix(domain, 16)?,
            bus: u8::from_str_radix(bus, 16)?,
            slot: u8::from_str_radix(slot, 16)?,
            function: u8::from_str_radix(function, 16)?,
        };

        if identity.slot >= 0x20 || identity.function >= 0x8 {
            return Err(ParseIdentityError::ComponentOutOfRange);
        }

        Ok(identity)
    }
}

/// The device's configuration space, accessed through its sysfs `config`
/// file.
///
/// Transient `EINTR`/`EAGAIN` failures are always retried. Once a device
/// is live, any other configuration space failure leaves the guest and
/// the host device in disagreeing states that we cannot recover from, so
/// the infallible accessors terminate the process instead of limping on.
#[derive(Debug)]
pub struct ConfigResource {
    file: File,
}

impl ConfigResource {
    /// Wrap an already opened configuration space file.
    #[must_use]
    pub fn new(file: File) -> Self {
        Self { file }
    }

    fn is_transient(error: &io::Error) -> bool {
        matches!(
            error.raw_os_error(),
            Some(libc::EINTR) | Some(libc::EAGAIN)
        )
    }

    /// Read bytes from the configuration space, retrying transient
    /// failures.
    pub fn try_read(&self, offset: u32, buf: &mut [u8]) -> io::Result<()> {
        loop {
            match self.file.read_exact_at(buf, offset.into()) {
                Ok(()) => return Ok(()),
                Err(e) if Self::is_transient(&e) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Write bytes to the configuration space, retrying transient
    /// failures.
    pub fn try_write(&self, offset: u32, buf: &[u8]) -> io::Result<()> {
        loop {
            match self.file.write_all_at(buf, offset.into()) {
                Ok(()) => return Ok(()),
                Err(e) if Self::is_transient(&e) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Read bytes from the configuration space of a live device.
    pub fn read(&self, offset: u32, buf: &mut [u8]) {
        if let Err(e) = self.try_read(offset, buf) {
            error!("config space read at {offset:#x} failed: {e}");
            std::process::exit(1);
        }
    }

    /// Write bytes to the configuration space of a live device.
    pub fn write(&self, offset: u32, buf: &[u8]) {
        if let Err(e) = self.try_write(offset, buf) {
            error!("config space write at {offset:#x} failed: {e}");
            std::process::exit(1);
        }
    }

    /// Read a byte from the configuration space of a live device.
    #[must_use]
    pub fn read_byte(&self, offset: u32) -> u8 {
        let mut buf = [0u8; 1];
        self.read(offset, &mut buf);
        buf[0]
    }

    /// Read a little-endian word from the configuration space of a live
    /// device.
    #[must_use]
    pub fn read_word(&self, offset: u32) -> u16 {
        let mut buf = [0u8; 2];
        self.read(offset, &mut buf);
        u16::from_le_bytes(buf)
    }

    /// Read a little-endian doubleword from the configuration space of a
    /// live device.
    #[must_use]
    pub fn read_long(&self, offset: u32) -> u32 {
        let mut buf = [0u8; 4];
        self.read(offset, &mut buf);
        u32::from_le_bytes(buf)
    }

    /// Read the first 256 bytes of the configuration space.
    ///
    /// This is the initialization path; errors are reported to the
    /// caller instead of tearing the process down.
    pub fn try_read_snapshot(&self) -> io::Result<[u8; config_space::SIZE]> {
        let mut snapshot = [0u8; config_space::SIZE];
        self.try_read(0, &mut snapshot)?;
        Ok(snapshot)
    }
}

/// A single BAR resource of the host device.
#[derive(Debug)]
pub struct HostRegion {
    /// The BAR index this resource belongs to.
    pub index: usize,
    /// The host physical base address of the resource.
    pub base_addr: u64,
    /// The size of the resource in bytes.
    pub size: u64,
    /// The resource flags as reported by the host.
    pub flags: u64,
    /// The opened sysfs `resource<N>` file.
    pub resource: File,
}

impl HostRegion {
    /// Whether this resource lives in port I/O space.
    #[must_use]
    pub fn is_io(&self) -> bool {
        self.flags & resource_flags::IO != 0
    }

    /// Whether this resource lives in memory space.
    #[must_use]
    pub fn is_mem(&self) -> bool {
        self.flags & resource_flags::MEM != 0
    }

    /// Whether this memory resource is prefetchable.
    #[must_use]
    pub fn is_prefetchable(&self) -> bool {
        self.flags & resource_flags::PREFETCH != 0
    }
}

/// Failed to open the host device.
#[derive(Debug, Error)]
pub enum HostResourceError {
    /// Could not open the configuration space file.
    #[error("failed to open config space of {identity}")]
    OpenConfig {
        /// The device in question.
        identity: HostIdentity,
        /// The underlying I/O error.
        source: io::Error,
    },
    /// Could not read the configuration space during initialization.
    #[error("failed to read config space of {identity}")]
    ReadConfig {
        /// The device in question.
        identity: HostIdentity,
        /// The underlying I/O error.
        source: io::Error,
    },
    /// Could not read the resource descriptor file.
    #[error("failed to read resource descriptors of {identity}")]
    ReadResources {
        /// The device in question.
        identity: HostIdentity,
        /// The underlying I/O error.
        source: io::Error,
    },
    /// The resource descriptor file does not have the expected format.
    #[error("malformed resource descriptor line: {line}")]
    MalformedResource {
        /// The offending line.
        line: String,
    },
}

/// One parsed line of the sysfs `resource` descriptor file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceDescriptor {
    /// First address covered by the resource.
    pub start: u64,
    /// Last address covered by the resource (inclusive).
    pub end: u64,
    /// The resource flags.
    pub flags: u64,
}

impl ResourceDescriptor {
    /// The size of the resource in bytes, zero for an unused slot.
    #[must_use]
    pub fn size(&self) -> u64 {
        if self.flags == 0 {
            0
        } else {
            self.end - self.start + 1
        }
    }
}

/// Parse the contents of a sysfs `resource` descriptor file.
///
/// Each line holds three hexadecimal values for start address, end
/// address and flags. Unused slots are all zeroes.
pub fn parse_resource_descriptors(
    contents: &str,
) -> Result<Vec<ResourceDescriptor>, HostResourceError> {
    contents
        .lines()
        .map(|line| {
            let mut fields = line.split_whitespace().map(|field| {
                field
                    .strip_prefix("0x")
                    .and_then(|hex| u64::from_str_radix(hex, 16).ok())
            });

            match (fields.next(), fields.next(), fields.next()) {
                (Some(Some(start)), Some(Some(end)), Some(Some(flags))) => {
                    Ok(ResourceDescriptor { start, end, flags })
                }
                _ => Err(HostResourceError::MalformedResource {
                    line: line.to_owned(),
                }),
            }
        })
        .collect()
}

/// The host device as a bundle of opened sysfs resources.
#[derive(Debug)]
pub struct HostResource {
    /// The device's host address.
    pub identity: HostIdentity,
    /// The device's configuration space.
    pub config: ConfigResource,
    /// The usable BAR resources of the device.
    pub regions: Vec<HostRegion>,
    /// The device's vendor ID.
    pub vendor_id: u16,
    /// The device's device ID.
    pub device_id: u16,

    sysfs_path: PathBuf,
}

impl HostResource {
    /// Open the device below the given sysfs PCI devices directory
    /// (normally `/sys/bus/pci/devices`).
    pub fn open(sysfs_root: &Path, identity: HostIdentity) -> Result<Self, HostResourceError> {
        let sysfs_path = sysfs_root.join(identity.to_string());

        let config_file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(sysfs_path.join("config"))
            .map_err(|source| HostResourceError::OpenConfig { identity, source })?;
        let config = ConfigResource::new(config_file);

        let snapshot = config
            .try_read_snapshot()
            .map_err(|source| HostResourceError::ReadConfig { identity, source })?;
        let vendor_id = u16::from_le_bytes([
            snapshot[config_space::offset::VENDOR],
            snapshot[config_space::offset::VENDOR + 1],
        ]);
        let device_id = u16::from_le_bytes([
            snapshot[config_space::offset::DEVICE],
            snapshot[config_space::offset::DEVICE + 1],
        ]);

        let descriptors = read_to_string(sysfs_path.join("resource"))
            .map_err(|source| HostResourceError::ReadResources { identity, source })?;
        let descriptors = parse_resource_descriptors(&descriptors)?;

        let mut regions = Vec::new();
        for (index, descriptor) in descriptors
            .into_iter()
            .take(config_space::MAX_BARS)
            .enumerate()
        {
            if descriptor.flags & (resource_flags::IO | resource_flags::MEM) == 0 {
                continue;
            }

            let resource = match OpenOptions::new()
                .read(true)
                .write(true)
                .open(sysfs_path.join(format!("resource{index}")))
            {
                Ok(file) => file,
                Err(e) => {
                    warn!("cannot open resource {index} of {identity}, skipping it: {e}");
                    continue;
                }
            };

            let region = HostRegion {
                index,
                base_addr: descriptor.start,
                size: descriptor.size(),
                flags: descriptor.flags,
                resource,
            };

            if region.is_io() && !probe_port_io(&region.resource) {
                warn!(
                    "resource {index} of {identity} does not behave like port I/O, excluding it"
                );
                continue;
            }

            debug!(
                "resource {index} of {identity}: base {:#x}, size {:#x}, flags {:#x}",
                region.base_addr, region.size, region.flags
            );
            regions.push(region);
        }

        Ok(Self {
            identity,
            config,
            regions,
            vendor_id,
            device_id,
            sysfs_path,
        })
    }

    /// Trigger a function reset through sysfs.
    ///
    /// Not all devices support this; a failure is not actionable and is
    /// only logged.
    pub fn reset(&self) {
        if let Err(e) = write(self.sysfs_path.join("reset"), "1") {
            debug!("device {} does not support sysfs reset: {e}", self.identity);
        }
    }

    /// The name of the host driver currently bound to the device, if
    /// any. Useful to explain why assignment failed with `EBUSY`.
    #[must_use]
    pub fn bound_driver(&self) -> Option<String> {
        let target = read_link(self.sysfs_path.join("driver")).ok()?;
        target
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
    }
}

/// Check that a resource file rejects odd-sized accesses the way the
/// port I/O backend does.
///
/// Reading three bytes from a port resource must fail with `EINVAL`. A
/// file that accepts the read is not backed by port I/O and cannot be
/// forwarded safely.
fn probe_port_io(resource: &File) -> bool {
    let mut probe = [0u8; 3];
    matches!(resource.read_at(&mut probe, 0),
             Err(e) if e.raw_os_error() == Some(libc::EINVAL))
}
