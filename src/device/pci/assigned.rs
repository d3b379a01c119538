//! # Assigned Device Lifecycle
//!
//! [`AssignedDevice::open`] walks the whole gauntlet: set up the
//! configuration arbitration tables, snapshot the hardware, rebuild the
//! capability chain, map the BARs and hand the device to the kernel.
//! Failure anywhere unwinds cleanly. The open device then serves the
//! guest-facing configuration and BAR access paths and reacts to INTx
//! rerouting until it is closed.

use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::device::bus::{BusDevice, Request};
use crate::device::pci::caps::{Capabilities, CapabilityBuilder, CapabilityError};
use crate::device::pci::config_space::EmulatedConfig;
use crate::device::pci::constants::assignment::{device_flags, irq_flags};
use crate::device::pci::constants::config_space::{
    MAX_BARS, command, header_type, msi, msix, offset, status,
};
use crate::device::pci::host::{HostIdentity, HostResource, HostResourceError};
use crate::device::pci::interrupts::InterruptEngine;
use crate::device::pci::kernel::{DeviceAssignment, GuestIrqRouter};
use crate::device::pci::regions::{
    GuestRegionView, RegionError, RegionMapper, bar_size_mask, bar_type_bits,
};

/// Policy knobs for opening a device.
#[derive(Debug, Clone, Copy)]
pub struct DeviceOptions {
    /// Back guest INTx with a host-side MSI from the start.
    pub prefer_msi: bool,
    /// Allow sharing the host interrupt line via PCI 2.3 INTx masking.
    pub share_intx: bool,
    /// Expose the device as one function of a multifunction device.
    pub multifunction: bool,
    /// The guest bus number the device will appear on.
    pub guest_bus: u8,
    /// The guest device/function byte the device will appear as.
    pub guest_devfn: u8,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            prefer_msi: false,
            share_intx: true,
            multifunction: false,
            guest_bus: 0,
            guest_devfn: 0,
        }
    }
}

/// Opening a device for assignment failed.
#[derive(Debug, Error)]
pub enum DeviceInitError {
    /// The device lives outside PCI segment 0 and the host kernel
    /// cannot express that.
    #[error("devices outside PCI segment 0 are not supported by this host kernel")]
    UnsupportedDomain,
    /// The host-side sysfs resources could not be opened.
    #[error(transparent)]
    Host(#[from] HostResourceError),
    /// The initial configuration space snapshot failed.
    #[error("failed to snapshot the configuration space")]
    Snapshot(#[source] io::Error),
    /// The capability chain could not be rebuilt.
    #[error(transparent)]
    Capability(#[from] CapabilityError),
    /// A BAR could not be mapped.
    #[error(transparent)]
    Region(#[from] RegionError),
    /// DMA isolation is unavailable.
    #[error("no IOMMU found; device assignment requires DMA isolation")]
    NoIommu,
    /// The kernel refused the device.
    #[error("failed to assign {identity} to the guest")]
    Assign {
        /// The device in question.
        identity: HostIdentity,
        /// The underlying error.
        #[source]
        source: io::Error,
    },
    /// The initial interrupt assignment failed.
    #[error("failed to set up the initial interrupt of {identity}")]
    InitialInterrupt {
        /// The device in question.
        identity: HostIdentity,
        /// The underlying error.
        #[source]
        source: io::Error,
    },
}

/// Mark the registers whose reads can go straight to the hardware.
///
/// Everything identity-like or immutable passes through; registers whose
/// guest value diverges from the hardware (BARs, interrupt state, the
/// capability chain) stay emulated. Writes start out with the same
/// policy.
fn init_mask_policy(config: &mut EmulatedConfig) {
    config.direct_read(offset::STATUS, 2);
    config.direct_read(offset::REVISION, 1);
    config.direct_read(offset::PROG_IF, 3);
    config.direct_read(offset::CACHE_LINE_SIZE, 1);
    config.direct_read(offset::LATENCY_TIMER, 1);
    config.direct_read(offset::BIST, 1);
    config.direct_read(offset::CARDBUS_CIS, 4);
    config.direct_read(offset::SUBSYSTEM_VENDOR_ID, 2);
    config.direct_read(offset::SUBSYSTEM_ID, 2);
    config.direct_read(offset::CAPABILITIES_POINTER + 1, 7);
    config.direct_read(offset::MIN_GNT, 1);
    config.direct_read(offset::MAX_LAT, 1);
    config.copy_read_policy_to_writes();

    // Bus mastering and INTx disable act on the hardware immediately;
    // the remaining command bits stay virtual.
    config.direct_write_bits(offset::COMMAND, command::BUS_MASTER as u8);
    config.direct_write_bits(offset::COMMAND + 1, (command::INTX_DISABLE >> 8) as u8);
}

/// Guest-writable bits of the command register.
const COMMAND_WMASK: u16 = 0x0001 | 0x0002 | command::BUS_MASTER | command::INTX_DISABLE;

fn covers_byte(offset: usize, len: usize, byte: usize) -> bool {
    offset <= byte && byte < offset + len
}

/// A host PCI device currently passed through to the guest.
pub struct AssignedDevice {
    identity: HostIdentity,
    dev_id: u32,
    host: HostResource,
    kernel: Arc<dyn DeviceAssignment + Send + Sync>,
    config: Arc<Mutex<EmulatedConfig>>,
    engine: Arc<Mutex<InterruptEngine>>,
    caps: Capabilities,
    intx_mask_supported: bool,
    regions: Vec<Arc<GuestRegionView>>,
    assigned: AtomicBool,
}

impl std::fmt::Debug for AssignedDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssignedDevice")
            .field("identity", &self.identity)
            .field("caps", &self.caps)
            .field("regions", &self.regions.len())
            .finish_non_exhaustive()
    }
}

impl AssignedDevice {
    /// Open the host device below `sysfs_root` and assign it to the
    /// guest.
    pub fn open(
        sysfs_root: &Path,
        identity: HostIdentity,
        options: DeviceOptions,
        kernel: Arc<dyn DeviceAssignment + Send + Sync>,
        router: Arc<dyn GuestIrqRouter + Send + Sync>,
    ) -> Result<Arc<Self>, DeviceInitError> {
        if identity.domain != 0 && !kernel.has_pci_segments() {
            return Err(DeviceInitError::UnsupportedDomain);
        }

        let host = HostResource::open(sysfs_root, identity)?;

        let mut config = EmulatedConfig::new();
        init_mask_policy(&mut config);

        *config.bytes_mut() = host
            .config
            .try_read_snapshot()
            .map_err(DeviceInitError::Snapshot)?;

        let header = config.get_byte(offset::HEADER_TYPE);
        let header = if options.multifunction {
            header | header_type::MULTIFUNCTION
        } else {
            header & !header_type::MULTIFUNCTION
        };
        config.set_byte(offset::HEADER_TYPE, header);

        // The guest programs its own BAR addresses; host values and the
        // option ROM must not shine through.
        for bar in 0..MAX_BARS {
            config.set_long(offset::BAR_0 + 4 * bar, 0);
        }
        config.set_long(offset::ROM_BAR, 0);

        config.set_word(offset::VENDOR, host.vendor_id);
        config.set_word(offset::DEVICE, host.device_id);

        {
            let wmask = config.wmask_mut();
            wmask[offset::COMMAND..offset::COMMAND + 2]
                .copy_from_slice(&COMMAND_WMASK.to_le_bytes());
            wmask[offset::IRQ_LINE] = 0xff;
        }

        let mut bar_bases = [None; MAX_BARS];
        for region in &host.regions {
            bar_bases[region.index] = Some(region.base_addr);
        }

        let builder = CapabilityBuilder {
            bar_bases,
            guest_bus: options.guest_bus,
            guest_devfn: options.guest_devfn,
            msi_supported: kernel.has_irq_assignment(),
            msix_supported: kernel.probe_msix_support(),
        };
        let caps = builder.build(&mut config)?;

        // The hardware's capability-list bit stays visible through the
        // direct-read status register. If our rebuilt chain disagrees,
        // that single bit must come from the emulation.
        let mut real_status = [0u8; 2];
        host.config
            .try_read(offset::STATUS as u32, &mut real_status)
            .map_err(DeviceInitError::Snapshot)?;
        let real_status = u16::from_le_bytes(real_status);
        if (config.get_word(offset::STATUS) ^ real_status) & status::CAPABILITIES != 0 {
            config.emulate_read_bits(offset::STATUS, status::CAPABILITIES as u8);
        }

        for region in &host.regions {
            let reg = offset::BAR_0 + 4 * region.index;
            config.set_long(reg, bar_type_bits(region));
            config.wmask_mut()[reg..reg + 4]
                .copy_from_slice(&bar_size_mask(region.size).to_le_bytes());
        }

        let intx_pin = config.get_byte(offset::IRQ_PIN);

        let dev_id = identity.assigned_dev_id();
        let engine = InterruptEngine::new(
            kernel.clone(),
            router,
            dev_id,
            caps,
            intx_pin,
            options.prefer_msi,
        );

        let config = Arc::new(Mutex::new(config));
        let engine = Arc::new(Mutex::new(engine));

        let mapper = RegionMapper::new(
            config.clone(),
            engine.clone(),
            caps.msix.map(|cap| cap.table_addr),
        );
        let mut regions = Vec::new();
        for region in &host.regions {
            regions.push(Arc::new(mapper.map(region)?));
        }

        if !kernel.has_iommu() {
            return Err(DeviceInitError::NoIommu);
        }

        let intx_mask_supported = kernel.has_intx_mask();
        let mut flags = device_flags::ENABLE_IOMMU;
        if intx_mask_supported && options.share_intx {
            flags |= device_flags::PCI_2_3;
        }
        if let Err(source) = kernel.assign_device(dev_id, flags) {
            if source.raw_os_error() == Some(libc::EBUSY) {
                report_busy_device(&host);
            }
            return Err(DeviceInitError::Assign { identity, source });
        }

        let device = Arc::new(Self {
            identity,
            dev_id,
            host,
            kernel,
            config,
            engine,
            caps,
            intx_mask_supported,
            regions,
            assigned: AtomicBool::new(true),
        });

        if let Err(source) = device.engine.lock().unwrap().assign_intx() {
            device.close();
            return Err(DeviceInitError::InitialInterrupt { identity, source });
        }

        info!("assigned {identity} to the guest");
        Ok(device)
    }

    /// The host address of this device.
    #[must_use]
    pub fn identity(&self) -> HostIdentity {
        self.identity
    }

    /// The guest-visible BAR windows, for bus registration.
    #[must_use]
    pub fn regions(&self) -> &[Arc<GuestRegionView>] {
        &self.regions
    }

    /// Handle a guest configuration space read of 1, 2 or 4 bytes.
    #[must_use]
    pub fn read_config(&self, offset: usize, len: usize) -> u32 {
        let config = self.config.lock().unwrap();
        config.read(&self.host.config, offset, len)
    }

    /// Handle a guest configuration space write of 1, 2 or 4 bytes.
    pub fn write_config(&self, offset: usize, value: u32, len: usize) {
        let mut config = self.config.lock().unwrap();
        let mut engine = self.engine.lock().unwrap();
        self.write_config_locked(&mut config, &mut engine, offset, value, len);
    }

    fn write_config_locked(
        &self,
        config: &mut MutexGuard<'_, EmulatedConfig>,
        engine: &mut MutexGuard<'_, InterruptEngine>,
        reg: usize,
        value: u32,
        len: usize,
    ) {
        let old_command = config.get_word(offset::COMMAND);

        config.write(&self.host.config, reg, value, len);

        // The side effects below read the settled register file, so
        // they run strictly after the write landed.

        if self.intx_mask_supported && covers_byte(reg, len, offset::COMMAND + 1) {
            let masked = config.get_word(offset::COMMAND) & command::INTX_DISABLE != 0;
            if masked != (old_command & command::INTX_DISABLE != 0) {
                if let Err(e) = engine.set_guest_intx_mask(masked) {
                    warn!("failed to change the INTx mask of {}: {e}", self.identity);
                }
            }
        }

        if let Some(cap) = self.caps.msi {
            if covers_byte(reg, len, cap.offset as usize + msi::FLAGS) {
                engine.update_msi(config);
            }
        }

        if let Some(cap) = self.caps.msix {
            // The enable bit lives in the upper half of the control
            // word.
            if covers_byte(reg, len, cap.offset as usize + msix::FLAGS + 1) {
                engine.update_msix(config);
            }
        }
    }

    /// Handle a guest read of a BAR window.
    #[must_use]
    pub fn bar_read(&self, bar: usize, req: Request) -> u64 {
        match self.regions.iter().find(|region| region.bar == bar) {
            Some(region) => region.read(req),
            None => !0 >> (64 - 8 * u64::from(req.size)),
        }
    }

    /// Handle a guest write to a BAR window.
    pub fn bar_write(&self, bar: usize, req: Request, value: u64) {
        if let Some(region) = self.regions.iter().find(|region| region.bar == bar) {
            region.write(req, value);
        }
    }

    /// Bring the device back to a state a freshly booted guest expects.
    ///
    /// A guest that is reset without shutting down cleanly may leave
    /// MSI or MSI-X enabled; the hardware must stop delivering into the
    /// old vectors before anything else happens.
    pub fn reset(&self) {
        let mut config = self.config.lock().unwrap();
        let mut engine = self.engine.lock().unwrap();

        let flags = engine.current_flags();
        if flags & irq_flags::GUEST_MSIX != 0 {
            if let Some(cap) = self.caps.msix {
                let pos = cap.offset as usize + msix::FLAGS;
                let ctrl = config.get_word(pos) & !msix::flags::ENABLE;
                config.set_word(pos, ctrl);
                engine.update_msix(&config);
            }
        } else if flags & irq_flags::GUEST_MSI != 0 {
            if let Some(cap) = self.caps.msi {
                let pos = cap.offset as usize + msi::FLAGS;
                let ctrl = config.get_word(pos) & !msi::flags::ENABLE;
                config.set_word(pos, ctrl);
                engine.update_msi(&config);
            }
        }
        engine.msix_table.reset();

        self.host.reset();

        // Stop DMA.
        self.write_config_locked(&mut config, &mut engine, offset::COMMAND, 0, 1);
    }

    /// Revalidate the INTx wiring after the machine model may have
    /// rerouted interrupt pins.
    ///
    /// Devices currently delivering through MSI or MSI-X are not
    /// affected by pin routing.
    pub fn update_irqs(&self) -> io::Result<()> {
        let mut engine = self.engine.lock().unwrap();
        if engine.uses_host_intx_route() {
            engine.assign_intx()
        } else {
            Ok(())
        }
    }

    /// Return the device to the host. Idempotent.
    pub fn close(&self) {
        if !self.assigned.swap(false, Ordering::SeqCst) {
            return;
        }

        let mut engine = self.engine.lock().unwrap();
        engine.deassign_current();

        if let Err(e) = self.kernel.deassign_device(self.dev_id) {
            warn!("failed to deassign {}: {e}", self.identity);
        }
        debug!("released {}", self.identity);
    }
}

impl Drop for AssignedDevice {
    fn drop(&mut self) {
        self.close();
    }
}

fn report_busy_device(host: &HostResource) {
    let Some(driver) = host.bound_driver() else {
        return;
    };
    let identity = host.identity;
    error!("the driver '{driver}' is occupying the device {identity}");
    error!("you can try the following commands to free it:");
    error!(
        "$ echo \"{:04x} {:04x}\" > /sys/bus/pci/drivers/pci-stub/new_id",
        host.vendor_id, host.device_id
    );
    error!("$ echo \"{identity}\" > /sys/bus/pci/drivers/{driver}/unbind");
    error!("$ echo \"{identity}\" > /sys/bus/pci/drivers/pci-stub/bind");
    error!(
        "$ echo \"{:04x} {:04x}\" > /sys/bus/pci/drivers/pci-stub/remove_id",
        host.vendor_id, host.device_id
    );
}

/// All devices currently assigned to one guest.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: Vec<Arc<AssignedDevice>>,
}

impl DeviceRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an open device.
    pub fn add(&mut self, device: Arc<AssignedDevice>) {
        self.devices.push(device);
    }

    /// Remove a device by its host address, closing it.
    pub fn remove(&mut self, identity: HostIdentity) -> bool {
        let Some(index) = self
            .devices
            .iter()
            .position(|device| device.identity() == identity)
        else {
            return false;
        };
        self.devices.remove(index).close();
        true
    }

    /// The registered devices.
    #[must_use]
    pub fn devices(&self) -> &[Arc<AssignedDevice>] {
        &self.devices
    }

    /// Revalidate interrupt routing for every device.
    ///
    /// A device whose interrupt can no longer be assigned is unusable;
    /// it is closed and dropped from the registry.
    pub fn update_irqs(&mut self) {
        // Collect first; removal must not disturb the iteration.
        let failed: Vec<usize> = self
            .devices
            .iter()
            .enumerate()
            .filter(|(_, device)| device.update_irqs().is_err())
            .map(|(index, _)| index)
            .collect();

        for index in failed.into_iter().rev() {
            let device = self.devices.remove(index);
            warn!(
                "removing {} after its interrupt could not be reassigned",
                device.identity()
            );
            device.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs::create_dir;
    use std::path::PathBuf;

    use tempfile::TempDir;

    use crate::device::pci::constants::config_space::capability_id;
    use crate::device::pci::kernel::testing::{FakeKernel, FakeRouter};

    const IDENTITY: &str = "0000:03:02.0";

    fn identity() -> HostIdentity {
        IDENTITY.parse().unwrap()
    }

    /// A fake sysfs device with one page-sized memory BAR, an MSI
    /// capability at 0x50 and INTx pin A.
    fn fake_sysfs() -> (TempDir, PathBuf) {
        let root = TempDir::new().unwrap();
        let device = root.path().join(IDENTITY);
        create_dir(&device).unwrap();

        let mut config = [0u8; 256];
        config[0..2].copy_from_slice(&0x8086u16.to_le_bytes());
        config[2..4].copy_from_slice(&0x100eu16.to_le_bytes());
        config[offset::COMMAND..offset::COMMAND + 2].copy_from_slice(&0x0007u16.to_le_bytes());
        config[offset::STATUS] = status::CAPABILITIES as u8;
        config[offset::CAPABILITIES_POINTER] = 0x50;
        config[0x50] = capability_id::MSI;
        config[offset::IRQ_PIN] = 1;
        std::fs::write(device.join("config"), config).unwrap();

        std::fs::write(
            device.join("resource"),
            "0x00000000fe000000 0x00000000fe000fff 0x0000000000040200\n",
        )
        .unwrap();
        std::fs::write(device.join("resource0"), [0u8; 0x1000]).unwrap();

        let path = root.path().to_path_buf();
        (root, path)
    }

    fn open_device(
        kernel: Arc<FakeKernel>,
        root: &Path,
    ) -> Result<Arc<AssignedDevice>, DeviceInitError> {
        AssignedDevice::open(
            root,
            identity(),
            DeviceOptions::default(),
            kernel,
            Arc::new(FakeRouter::default()),
        )
    }

    #[test]
    fn opening_assigns_device_and_intx() {
        let (_root, path) = fake_sysfs();
        let kernel = Arc::new(FakeKernel::new());
        let device = open_device(kernel.clone(), &path).unwrap();

        let log = kernel.log.lock().unwrap();
        assert_eq!(
            log.assigned_devices,
            vec![(
                identity().assigned_dev_id(),
                device_flags::ENABLE_IOMMU | device_flags::PCI_2_3
            )]
        );
        // Pin A wired up during open.
        assert_eq!(log.assigned_irqs.len(), 1);
        assert_eq!(log.assigned_irqs[0].2, irq_flags::GUEST_INTX | irq_flags::HOST_INTX);

        assert_eq!(device.regions().len(), 1);
    }

    #[test]
    fn the_guest_sees_scrubbed_bars_and_real_ids() {
        let (_root, path) = fake_sysfs();
        let device = open_device(Arc::new(FakeKernel::new()), &path).unwrap();

        assert_eq!(device.read_config(offset::VENDOR, 2), 0x8086);
        assert_eq!(device.read_config(offset::DEVICE, 2), 0x100e);
        assert_eq!(device.read_config(offset::BAR_0, 4), 0);
        assert_eq!(device.read_config(offset::ROM_BAR, 4), 0);
    }

    #[test]
    fn bar_sizing_writes_read_back_the_mask() {
        let (_root, path) = fake_sysfs();
        let device = open_device(Arc::new(FakeKernel::new()), &path).unwrap();

        device.write_config(offset::BAR_0, 0xffff_ffff, 4);
        assert_eq!(device.read_config(offset::BAR_0, 4), 0xffff_f000);

        device.write_config(offset::BAR_0, 0xfe80_0000, 4);
        assert_eq!(device.read_config(offset::BAR_0, 4), 0xfe80_0000);
    }

    #[test]
    fn missing_iommu_fails_the_open() {
        let (_root, path) = fake_sysfs();
        let mut kernel = FakeKernel::new();
        kernel.iommu_present = false;

        let err = open_device(Arc::new(kernel), &path).unwrap_err();
        assert!(matches!(err, DeviceInitError::NoIommu));
    }

    #[test]
    fn busy_devices_fail_with_the_assign_error() {
        let (_root, path) = fake_sysfs();
        let kernel = FakeKernel::new();
        kernel.fail_assign_device(libc::EBUSY);

        let err = open_device(Arc::new(kernel), &path).unwrap_err();
        assert!(matches!(err, DeviceInitError::Assign { .. }));
    }

    #[test]
    fn intx_disable_toggles_the_mask_once_per_edge() {
        let (_root, path) = fake_sysfs();
        let kernel = Arc::new(FakeKernel::new());
        let device = open_device(kernel.clone(), &path).unwrap();

        let disabled = u32::from(command::INTX_DISABLE);
        device.write_config(offset::COMMAND, disabled, 2);
        device.write_config(offset::COMMAND, disabled, 2);
        device.write_config(offset::COMMAND, 0, 2);

        let log = kernel.log.lock().unwrap();
        let dev_id = identity().assigned_dev_id();
        assert_eq!(log.intx_masks, vec![(dev_id, true), (dev_id, false)]);
    }

    #[test]
    fn msi_control_writes_drive_the_engine() {
        let (_root, path) = fake_sysfs();
        let kernel = Arc::new(FakeKernel::new());
        let device = open_device(kernel.clone(), &path).unwrap();

        device.write_config(0x50 + msi::ADDRESS_LO, 0xfee0_0000, 4);
        device.write_config(0x50 + msi::DATA_32, 0x4022, 2);
        device.write_config(0x50 + msi::FLAGS, msi::flags::ENABLE.into(), 2);

        let log = kernel.log.lock().unwrap();
        assert_eq!(log.routes.len(), 1);
        let message = log.routes.values().next().unwrap();
        assert_eq!(message.address, 0xfee0_0000);
        assert_eq!(message.data, 0x4022);
    }

    #[test]
    fn reset_clears_bus_mastering_on_the_host() {
        let (_root, path) = fake_sysfs();
        let device = open_device(Arc::new(FakeKernel::new()), &path).unwrap();

        device.reset();

        let mut real = [0u8; 1];
        device.host.config.read(offset::COMMAND as u32, &mut real);
        assert_eq!(real[0] & command::BUS_MASTER as u8, 0);
    }

    #[test]
    fn closing_is_idempotent_and_deassigns() {
        let (_root, path) = fake_sysfs();
        let kernel = Arc::new(FakeKernel::new());
        let device = open_device(kernel.clone(), &path).unwrap();

        device.close();
        device.close();
        drop(device);

        let log = kernel.log.lock().unwrap();
        assert_eq!(log.deassigned_devices, vec![identity().assigned_dev_id()]);
    }

    #[test]
    fn rerouted_devices_are_revalidated() {
        let (_root, path) = fake_sysfs();
        let kernel = Arc::new(FakeKernel::new());
        let router = Arc::new(FakeRouter::default());
        let device = AssignedDevice::open(
            &path,
            identity(),
            DeviceOptions::default(),
            kernel.clone(),
            router.clone(),
        )
        .unwrap();

        let mut registry = DeviceRegistry::new();
        registry.add(device);

        *router.base.lock().unwrap() = 16;
        registry.update_irqs();

        assert_eq!(registry.devices().len(), 1);
        let log = kernel.log.lock().unwrap();
        assert_eq!(log.assigned_irqs.last().unwrap().1, 17);
    }

    #[test]
    fn devices_that_lose_their_interrupt_are_dropped() {
        let (_root, path) = fake_sysfs();
        let kernel = Arc::new(FakeKernel::new());
        let router = Arc::new(FakeRouter::default());
        let device = AssignedDevice::open(
            &path,
            identity(),
            DeviceOptions::default(),
            kernel.clone(),
            router.clone(),
        )
        .unwrap();

        let mut registry = DeviceRegistry::new();
        registry.add(device);

        *router.base.lock().unwrap() = 16;
        kernel.fail_assign_irq(libc::EINVAL);
        registry.update_irqs();

        assert!(registry.devices().is_empty());
        let log = kernel.log.lock().unwrap();
        assert_eq!(log.deassigned_devices, vec![identity().assigned_dev_id()]);
    }

    #[test]
    fn removal_by_identity_closes_the_device() {
        let (_root, path) = fake_sysfs();
        let kernel = Arc::new(FakeKernel::new());
        let device = open_device(kernel.clone(), &path).unwrap();

        let mut registry = DeviceRegistry::new();
        registry.add(device);

        assert!(registry.remove(identity()));
        assert!(!registry.remove(identity()));
        assert!(registry.devices().is_empty());
        assert_eq!(
            kernel.log.lock().unwrap().deassigned_devices,
            vec![identity().assigned_dev_id()]
        );
    }
}
