//! # Capability Chain Reconstruction
//!
//! The guest must not see the host's capability list verbatim. Some
//! capabilities would let it touch host-global state (power management,
//! link control), others need virtualized interrupt registers. So the
//! guest chain is rebuilt from scratch. Every capability we understand is
//! re-added at its host offset with a sanitized register block; everything
//! else simply does not appear in the guest's list.

use thiserror::Error;

use crate::device::pci::config_space::EmulatedConfig;
use crate::device::pci::constants::config_space::{
    MAX_BARS, SIZE, capability_id, capability_list, express, msi, msix, offset, pci_x,
    power_management, quirk, status, vpd,
};

/// Cap on vectors the host kernel will route for a single device.
const MAX_MSIX_VECTORS_PER_DEVICE: u16 = 256;

/// A capability list cannot be rebuilt for the guest.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CapabilityError {
    /// The PCI Express capability reports a version we do not know.
    #[error("unsupported PCI Express capability version {0}")]
    UnsupportedExpressVersion(u8),
    /// The PCI Express register block is cut short by the end of the
    /// configuration space.
    #[error("invalid PCI Express capability size {0:#x}")]
    InvalidExpressSize(u8),
    /// The device is not an endpoint. Assigning bridges or ports is not
    /// supported.
    #[error("device type {0} is not an assignable endpoint")]
    NotAnEndpoint(u16),
    /// The MSI-X table indicator references a BAR the device does not
    /// have.
    #[error("MSI-X table lives in nonexistent BAR {0}")]
    MissingMsixBar(u32),
    /// A vendor-specific capability reports a length that cannot hold
    /// its own header or runs past the end of the configuration space.
    #[error("vendor specific capability at {0:#x} has invalid length {1}")]
    InvalidVendorLength(u8, u8),
}

/// Find a capability in a raw configuration space snapshot.
///
/// Returns the offset of the first matching capability above `start`,
/// which allows iterating over repeated capabilities. The walk is
/// bounded; hardware that reports a looping chain terminates the search
/// instead of us.
#[must_use]
pub fn find_capability(config: &[u8; SIZE], id: u8, start: u8) -> Option<u8> {
    let status = u16::from_le_bytes([config[offset::STATUS], config[offset::STATUS + 1]]);
    if status & status::CAPABILITIES == 0 {
        return None;
    }

    let mut link = offset::CAPABILITIES_POINTER;
    for _ in 0..capability_list::MAX_WALK {
        let pos = config[link];
        if pos < capability_list::FIRST_OFFSET {
            break;
        }
        let pos = pos & !3;

        let found = config[pos as usize];
        if found == capability_list::INVALID_ID {
            break;
        }
        if found == id && pos > start {
            return Some(pos);
        }

        link = pos as usize + capability_list::NEXT;
    }

    None
}

/// The interrupt-relevant capabilities discovered while rebuilding the
/// chain.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// The MSI capability, if present and usable.
    pub msi: Option<MsiCapability>,
    /// The MSI-X capability, if present and usable.
    pub msix: Option<MsixCapability>,
}

/// Location of the virtualized MSI capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsiCapability {
    /// Configuration space offset of the capability.
    pub offset: u8,
}

/// Location and geometry of the virtualized MSI-X capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsixCapability {
    /// Configuration space offset of the capability.
    pub offset: u8,
    /// Number of vectors in the table.
    pub max_vectors: u16,
    /// Host physical address of the vector table.
    pub table_addr: u64,
}

/// Inputs for rebuilding the guest capability chain.
#[derive(Debug)]
pub struct CapabilityBuilder {
    /// Host physical base addresses of the device's BARs, indexed by BAR
    /// number.
    pub bar_bases: [Option<u64>; MAX_BARS],
    /// The guest-visible bus number of the device.
    pub guest_bus: u8,
    /// The guest-visible device/function byte of the device.
    pub guest_devfn: u8,
    /// Whether the host kernel can route MSI for assigned devices.
    pub msi_supported: bool,
    /// Whether the host kernel can route MSI-X for assigned devices.
    pub msix_supported: bool,
}

impl CapabilityBuilder {
    /// Rebuild the guest capability chain inside `config`.
    ///
    /// The cached register file must hold the host snapshot; the
    /// capability bodies are sanitized in place and relinked. Guest
    /// offsets equal host offsets throughout.
    pub fn build(&self, config: &mut EmulatedConfig) -> Result<Capabilities, CapabilityError> {
        let snapshot = *config.bytes();

        // Start with an empty chain and insert at the head as we go.
        config.set_byte(offset::CAPABILITIES_POINTER, 0);
        let cleared = config.get_word(offset::STATUS) & !status::CAPABILITIES;
        config.set_word(offset::STATUS, cleared);

        let mut caps = Capabilities::default();

        if let Some(pos) = find_capability(&snapshot, capability_id::MSI, 0) {
            if self.msi_supported {
                caps.msi = Some(self.add_msi(config, pos));
            }
        }

        if let Some(pos) = find_capability(&snapshot, capability_id::MSI_X, 0) {
            if self.msix_supported {
                caps.msix = Some(self.add_msix(config, pos)?);
            }
        }

        if let Some(pos) = find_capability(&snapshot, capability_id::POWER_MANAGEMENT, 0) {
            self.add_power_management(config, pos);
        }

        if let Some(pos) = find_capability(&snapshot, capability_id::EXPRESS, 0) {
            self.add_express(config, pos)?;
        }

        if let Some(pos) = find_capability(&snapshot, capability_id::PCI_X, 0) {
            self.add_pci_x(config, pos);
        }

        if let Some(pos) = find_capability(&snapshot, capability_id::VPD, 0) {
            add_capability(config, capability_id::VPD, pos, vpd::SIZE);
            setup_passthrough_body(config, pos, vpd::SIZE);
        }

        let mut pos = 0;
        while let Some(found) = find_capability(&snapshot, capability_id::VENDOR_SPECIFIC, pos) {
            // The byte after the next pointer holds the full length,
            // which comes from hardware and cannot be trusted.
            let len = snapshot[found as usize + 2];
            if len < 3 || found as usize + len as usize > SIZE {
                return Err(CapabilityError::InvalidVendorLength(found, len));
            }
            add_capability(config, capability_id::VENDOR_SPECIFIC, found, len);
            setup_passthrough_body(config, found, len);
            pos = found;
        }

        Ok(caps)
    }

    fn add_msi(&self, config: &mut EmulatedConfig, pos: u8) -> MsiCapability {
        add_capability(config, capability_id::MSI, pos, msi::SIZE);
        let pos = pos as usize;

        // Advertise the plain 32-bit variant without per-vector masking,
        // whatever the hardware implements.
        let flags = config.get_word(pos + msi::FLAGS) & msi::flags::QMASK;
        config.set_word(pos + msi::FLAGS, flags);
        config.set_long(pos + msi::ADDRESS_LO, 0);
        config.set_word(pos + msi::DATA_32, 0);

        let wmask = config.wmask_mut();
        wmask[pos + msi::FLAGS..pos + msi::FLAGS + 2]
            .copy_from_slice(&(msi::flags::QSIZE | msi::flags::ENABLE).to_le_bytes());
        wmask[pos + msi::ADDRESS_LO..pos + msi::ADDRESS_LO + 4]
            .copy_from_slice(&0xffff_fffcu32.to_le_bytes());
        wmask[pos + msi::DATA_32..pos + msi::DATA_32 + 2]
            .copy_from_slice(&0xffffu16.to_le_bytes());

        MsiCapability { offset: pos as u8 }
    }

    fn add_msix(
        &self,
        config: &mut EmulatedConfig,
        pos: u8,
    ) -> Result<MsixCapability, CapabilityError> {
        add_capability(config, capability_id::MSI_X, pos, msix::SIZE);
        let pos = pos as usize;

        let flags = config.get_word(pos + msix::FLAGS) & msix::flags::QSIZE;
        config.set_word(pos + msix::FLAGS, flags);

        let max_vectors = (flags + 1).min(MAX_MSIX_VECTORS_PER_DEVICE);

        let wmask = config.wmask_mut();
        wmask[pos + msix::FLAGS..pos + msix::FLAGS + 2]
            .copy_from_slice(&(msix::flags::ENABLE | msix::flags::MASKALL).to_le_bytes());

        let table = config.get_long(pos + msix::TABLE);
        let bar = table & msix::BIR_MASK;
        let base = self.bar_bases[bar as usize].ok_or(CapabilityError::MissingMsixBar(bar))?;
        let table_addr = base + u64::from(table & !msix::BIR_MASK);

        Ok(MsixCapability {
            offset: pos as u8,
            max_vectors,
            table_addr,
        })
    }

    fn add_power_management(&self, config: &mut EmulatedConfig, pos: u8) {
        add_capability(config, capability_id::POWER_MANAGEMENT, pos, power_management::SIZE);
        setup_body_read(config, pos, power_management::SIZE);
        let pos = pos as usize;

        let pmc = config.get_word(pos + power_management::PMC)
            & (power_management::pmc::VERSION | power_management::pmc::DSI);
        config.set_word(pos + power_management::PMC, pmc);

        // The device is brought to D0 during assignment. Pretend power
        // state transitions do not reset anything and hide the bridge
        // and data registers.
        config.set_word(pos + power_management::CTRL, power_management::ctrl::NO_SOFT_RESET);
        config.set_byte(pos + power_management::PPB_EXTENSIONS, 0);
        config.set_byte(pos + power_management::DATA_REGISTER, 0);
    }

    fn add_express(&self, config: &mut EmulatedConfig, pos: u8) -> Result<(), CapabilityError> {
        let flags = config.get_word(pos as usize + express::FLAGS);
        let version = (flags & express::flags::VERSION) as u8;

        let v2_size = || -> Result<u8, CapabilityError> {
            let size = (SIZE - pos as usize).min(express::SIZE_V2 as usize) as u8;
            if size < express::MIN_SIZE_V2 {
                return Err(CapabilityError::InvalidExpressSize(size));
            }
            Ok(size)
        };

        let size = match version {
            1 => express::SIZE_V1,
            2 => v2_size()?,
            0 => {
                // The Intel 82599 VF reports version 0 but implements
                // the version 2 register block like its physical
                // function.
                let vendor = config.get_word(offset::VENDOR);
                let device = config.get_word(offset::DEVICE);
                if vendor == quirk::VENDOR_INTEL && device == quirk::DEVICE_82599_VF {
                    v2_size()?
                } else {
                    return Err(CapabilityError::UnsupportedExpressVersion(version));
                }
            }
            _ => return Err(CapabilityError::UnsupportedExpressVersion(version)),
        };

        let device_type = (flags & express::flags::TYPE) >> express::flags::TYPE_SHIFT;
        let endpoint = matches!(
            device_type,
            express::device_type::ENDPOINT
                | express::device_type::LEGACY_ENDPOINT
                | express::device_type::ROOT_COMPLEX_ENDPOINT
        );
        if !endpoint {
            return Err(CapabilityError::NotAnEndpoint(device_type));
        }

        add_capability(config, capability_id::EXPRESS, pos, size);
        setup_body_read(config, pos, size);
        let pos = pos as usize;

        // Function level reset is not forwarded, so do not advertise it.
        let devcap = config.get_long(pos + express::DEVCAP) & !express::devcap::FLR;
        config.set_long(pos + express::DEVCAP, devcap);

        let devctl = (config.get_word(pos + express::DEVCTL)
            & (express::devctl::READRQ | express::devctl::PAYLOAD))
            | express::devctl::RELAX_EN
            | express::devctl::NOSNOOP_EN;
        config.set_word(pos + express::DEVCTL, devctl);
        let writable = !(express::devctl::BCR_FLR | express::devctl::AUX_PME);
        config.wmask_mut()[pos + express::DEVCTL..pos + express::DEVCTL + 2]
            .copy_from_slice(&writable.to_le_bytes());
        config.set_word(pos + express::DEVSTA, 0);

        let lnkcap = config.get_long(pos + express::LNKCAP)
            & (express::lnkcap::SLS
                | express::lnkcap::MLW
                | express::lnkcap::ASPMS
                | express::lnkcap::L0SEL
                | express::lnkcap::L1EL);
        config.set_long(pos + express::LNKCAP, lnkcap);

        let lnksta = config.get_word(pos + express::LNKSTA)
            & (express::lnksta::CLS | express::lnksta::NLW);
        config.set_word(pos + express::LNKSTA, lnksta);

        if size >= express::MIN_SIZE_V2 {
            // Endpoints have no slot or root registers.
            config.set_long(pos + express::SLTCAP, 0);
            config.set_word(pos + express::SLTCTL, 0);
            config.set_word(pos + express::SLTSTA, 0);
            config.set_word(pos + express::RTCTL, 0);
            config.set_word(pos + express::RTCAP, 0);
            config.set_long(pos + express::RTSTA, 0);
        }

        Ok(())
    }

    fn add_pci_x(&self, config: &mut EmulatedConfig, pos: u8) {
        add_capability(config, capability_id::PCI_X, pos, pci_x::SIZE);
        setup_body_read(config, pos, pci_x::SIZE);
        let pos = pos as usize;

        let cmd = config.get_word(pos + pci_x::CMD)
            & (pci_x::cmd::DPERR_E
                | pci_x::cmd::ERO
                | pci_x::cmd::MAX_READ
                | pci_x::cmd::MAX_SPLIT);
        config.set_word(pos + pci_x::CMD, cmd);

        // The status register carries the device's own bus position and
        // sticky error bits from the host's past.
        let mut pcix_status = config.get_long(pos + pci_x::STATUS);
        pcix_status &= !(pci_x::status::BUS | pci_x::status::DEVFN);
        pcix_status |= (u32::from(self.guest_bus) << 8) | u32::from(self.guest_devfn);
        pcix_status &=
            !(pci_x::status::SPL_DISC | pci_x::status::UNX_SPL | pci_x::status::SPL_ERR);
        config.set_long(pos + pci_x::STATUS, pcix_status);
    }
}

/// Insert a capability at the head of the guest's chain.
///
/// The body becomes read-only until the caller opens individual fields
/// back up.
fn add_capability(config: &mut EmulatedConfig, id: u8, pos: u8, size: u8) {
    let head = config.get_byte(offset::CAPABILITIES_POINTER);
    let pos_usize = pos as usize;

    config.set_byte(pos_usize, id);
    config.set_byte(pos_usize + capability_list::NEXT, head);
    config.set_byte(offset::CAPABILITIES_POINTER, pos);

    let with_caps = config.get_word(offset::STATUS) | status::CAPABILITIES;
    config.set_word(offset::STATUS, with_caps);

    config.wmask_mut()[pos_usize..pos_usize + size as usize].fill(0);
}

/// Serve a capability body from the hardware, except for the next
/// pointer, which belongs to the rebuilt guest chain. Registers like
/// PM_CTRL or LNKSTA change underneath us; the snapshot must not
/// shadow them.
fn setup_body_read(config: &mut EmulatedConfig, pos: u8, size: u8) {
    let pos = pos as usize;
    config.direct_read(pos, size as usize);
    config.emulate_read(pos + capability_list::NEXT, 1);
}

/// Full read and write passthrough of a capability body. Writes still
/// never reach the id and next-pointer bytes.
fn setup_passthrough_body(config: &mut EmulatedConfig, pos: u8, size: u8) {
    setup_body_read(config, pos, size);
    config.direct_write(pos as usize + 2, size as usize - 2);
}
