//! # Interrupt Virtualization
//!
//! An assigned device's interrupt can be delivered to the guest as INTx,
//! MSI or MSI-X, backed on the host by whatever the kernel supports. The
//! [`InterruptEngine`] tracks which combination is currently wired up and
//! rewires it when the guest flips capability control bits or the machine
//! model reroutes an INTx pin.
//!
//! The guest never touches the hardware MSI-X vector table. It writes to
//! a shadow page instead, and the engine translates unmasked entries into
//! host routing-table entries.

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::device::pci::caps::{Capabilities, MsixCapability};
use crate::device::pci::config_space::EmulatedConfig;
use crate::device::pci::constants::assignment::irq_flags;
use crate::device::pci::constants::config_space::{msi, msix};
use crate::device::pci::constants::msix_table;
use crate::device::pci::kernel::{DeviceAssignment, GuestIrqRouter, MsiMessage};

/// The guest-visible shadow of the MSI-X vector table, one page.
#[derive(Clone)]
pub struct MsixTablePage {
    data: [u8; msix_table::PAGE_SIZE],
}

impl fmt::Debug for MsixTablePage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MsixTablePage").finish_non_exhaustive()
    }
}

impl Default for MsixTablePage {
    fn default() -> Self {
        Self::new()
    }
}

impl MsixTablePage {
    /// Create a table with every vector masked.
    #[must_use]
    pub fn new() -> Self {
        let mut page = Self {
            data: [0; msix_table::PAGE_SIZE],
        };
        page.reset();
        page
    }

    /// Restore the power-on state: all fields zero, all vectors masked.
    pub fn reset(&mut self) {
        self.data = [0; msix_table::PAGE_SIZE];
        for vector in 0..(msix_table::PAGE_SIZE / msix_table::ENTRY_SIZE) {
            let ctrl = vector * msix_table::ENTRY_SIZE + msix_table::offset::CONTROL;
            self.data[ctrl..ctrl + 4].copy_from_slice(&msix_table::CONTROL_MASKED.to_le_bytes());
        }
    }

    /// Copy table contents into `buf`.
    pub fn read(&self, offset: usize, buf: &mut [u8]) {
        if let Some(source) = self.data.get(offset..offset + buf.len()) {
            buf.copy_from_slice(source);
        } else {
            buf.fill(0xff);
        }
    }

    /// Copy `buf` into the table.
    pub fn write(&mut self, offset: usize, buf: &[u8]) {
        if let Some(target) = self.data.get_mut(offset..offset + buf.len()) {
            target.copy_from_slice(buf);
        }
    }

    fn field(&self, vector: u16, offset: usize) -> u32 {
        let base = vector as usize * msix_table::ENTRY_SIZE + offset;
        u32::from_le_bytes(self.data[base..base + 4].try_into().unwrap())
    }

    /// Whether the given vector is masked.
    #[must_use]
    pub fn is_masked(&self, vector: u16) -> bool {
        self.field(vector, msix_table::offset::CONTROL) & msix_table::CONTROL_MASKED != 0
    }

    /// The MSI message programmed into the given vector.
    #[must_use]
    pub fn message(&self, vector: u16) -> MsiMessage {
        let address = u64::from(self.field(vector, msix_table::offset::ADDRESS_LO))
            | (u64::from(self.field(vector, msix_table::offset::ADDRESS_HI)) << 32);
        MsiMessage {
            address,
            data: self.field(vector, msix_table::offset::DATA),
        }
    }
}

/// The interrupt state machine of one assigned device.
pub struct InterruptEngine {
    kernel: Arc<dyn DeviceAssignment + Send + Sync>,
    router: Arc<dyn GuestIrqRouter + Send + Sync>,
    dev_id: u32,
    caps: Capabilities,
    /// The device's INTx pin, 0 if it has none.
    intx_pin: u8,
    /// The guest IRQ the pin is currently wired to.
    girq: Option<u32>,
    /// The interrupt type currently assigned in the kernel, as
    /// [`irq_flags`] bits. Zero when nothing is assigned.
    requested: u32,
    /// Back guest INTx with a host MSI. Set on request or after the
    /// kernel refused to share the host interrupt line; never reverts.
    prefer_msi: bool,
    /// Host routing-table entries by vector. Plain MSI uses vector 0.
    routes: BTreeMap<u16, u32>,
    /// The MSI-X shadow table. Unused when the device has no MSI-X.
    pub msix_table: MsixTablePage,
}

impl fmt::Debug for InterruptEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterruptEngine")
            .field("dev_id", &self.dev_id)
            .field("intx_pin", &self.intx_pin)
            .field("girq", &self.girq)
            .field("requested", &self.requested)
            .field("prefer_msi", &self.prefer_msi)
            .field("routes", &self.routes)
            .finish_non_exhaustive()
    }
}

impl InterruptEngine {
    /// Create an engine with nothing assigned yet.
    pub fn new(
        kernel: Arc<dyn DeviceAssignment + Send + Sync>,
        router: Arc<dyn GuestIrqRouter + Send + Sync>,
        dev_id: u32,
        caps: Capabilities,
        intx_pin: u8,
        prefer_msi: bool,
    ) -> Self {
        Self {
            kernel,
            router,
            dev_id,
            caps,
            intx_pin,
            girq: None,
            requested: 0,
            prefer_msi,
            routes: BTreeMap::new(),
            msix_table: MsixTablePage::new(),
        }
    }

    /// The interrupt type currently assigned, as [`irq_flags`] bits.
    #[must_use]
    pub fn current_flags(&self) -> u32 {
        self.requested
    }

    /// Whether the pin is wired through a host INTx line, so pin
    /// rerouting matters. A pin backed by host-side MSI keeps its
    /// route regardless of guest IRQ numbering.
    #[must_use]
    pub fn uses_host_intx_route(&self) -> bool {
        self.requested & irq_flags::HOST_INTX != 0
    }

    /// Whether host-side MSI substitution for INTx is in effect.
    #[must_use]
    pub fn prefers_msi(&self) -> bool {
        self.prefer_msi
    }

    /// Forward the guest's INTx mask state to the device.
    pub fn set_guest_intx_mask(&self, masked: bool) -> io::Result<()> {
        self.kernel.set_intx_mask(self.dev_id, masked)
    }

    /// Wire the device's INTx pin to the guest interrupt it is routed
    /// to.
    ///
    /// A device without a pin, or a pin whose routing did not change, is
    /// a no-op. If the kernel refuses to share the host line with `EIO`
    /// and the device has MSI, the assignment is retried once with a
    /// host-side MSI backing.
    pub fn assign_intx(&mut self) -> io::Result<()> {
        if self.intx_pin == 0 {
            return Ok(());
        }

        let girq = self.router.route_intx_pin(self.intx_pin);
        if self.girq == Some(girq) {
            return Ok(());
        }

        if self.requested & irq_flags::GUEST_INTX != 0 {
            self.deassign(self.requested);
            self.requested = 0;
        }

        loop {
            let host_msi = self.prefer_msi && self.caps.msi.is_some();
            let flags = irq_flags::GUEST_INTX
                | if host_msi {
                    irq_flags::HOST_MSI
                } else {
                    irq_flags::HOST_INTX
                };

            match self.kernel.assign_irq(self.dev_id, girq, flags) {
                Ok(()) => {
                    debug!("INTx pin {} wired to guest IRQ {girq}", self.intx_pin);
                    // The routing is only remembered once the kernel
                    // accepted it, so a failed attempt stays retryable.
                    self.girq = Some(girq);
                    self.requested = flags;
                    return Ok(());
                }
                Err(e) => {
                    if e.raw_os_error() == Some(libc::EIO)
                        && !self.prefer_msi
                        && self.caps.msi.is_some()
                    {
                        warn!(
                            "host-side INTx sharing not supported, using MSI instead; \
                             some devices do not work properly in this mode"
                        );
                        self.prefer_msi = true;
                        continue;
                    }
                    error!("failed to assign interrupt: {e}");
                    error!("perhaps the device shares its IRQ line with another host device");
                    return Err(e);
                }
            }
        }
    }

    fn deassign(&self, flags: u32) {
        if let Err(e) = self.kernel.deassign_irq(self.dev_id, flags) {
            // ENXIO just means nothing was assigned.
            if e.raw_os_error() != Some(libc::ENXIO) {
                warn!("failed to deassign interrupt: {e}");
            }
        }
    }

    /// Release all host routing-table entries held by this device.
    pub fn release_routes(&mut self) {
        for gsi in self.routes.values() {
            self.kernel.del_route(*gsi);
        }
        self.routes.clear();
    }

    /// Tear down whatever interrupt is currently assigned.
    pub fn deassign_current(&mut self) {
        if self.requested != 0 {
            self.deassign(self.requested);
            self.requested = 0;
        }
        self.release_routes();
    }

    /// React to a guest write of the MSI control register.
    pub fn update_msi(&mut self, config: &EmulatedConfig) {
        let Some(cap) = self.caps.msi else {
            return;
        };
        let pos = cap.offset as usize;
        let enabled = config.get_word(pos + msi::FLAGS) & msi::flags::ENABLE != 0;

        // Some guests disable MSI without ever having enabled it. Only
        // bother the kernel when the mode is in use or being entered.
        if self.requested & irq_flags::GUEST_MSI != 0 || enabled {
            let current = if self.requested != 0 {
                self.requested
            } else {
                irq_flags::HOST_MSI | irq_flags::GUEST_MSI
            };
            self.deassign(current);
            self.release_routes();
            self.requested = 0;
        }

        if enabled {
            let message = MsiMessage {
                address: config.get_long(pos + msi::ADDRESS_LO).into(),
                data: config.get_word(pos + msi::DATA_32).into(),
            };

            let gsi = match self.kernel.add_route(message) {
                Ok(gsi) => gsi,
                Err(e) => {
                    error!("failed to allocate an MSI route: {e}");
                    return;
                }
            };
            self.routes.insert(0, gsi);

            if let Err(e) = self.kernel.assign_irq(
                self.dev_id,
                gsi,
                irq_flags::HOST_MSI | irq_flags::GUEST_MSI,
            ) {
                error!("failed to enable MSI: {e}");
                return;
            }

            self.girq = None;
            self.requested = irq_flags::HOST_MSI | irq_flags::GUEST_MSI;
        } else {
            self.assign_intx().ok();
        }
    }

    /// React to a guest write of the MSI-X control register.
    pub fn update_msix(&mut self, config: &EmulatedConfig) {
        let Some(cap) = self.caps.msix else {
            return;
        };
        let pos = cap.offset as usize;
        let enabled = config.get_word(pos + msix::FLAGS) & msix::flags::ENABLE != 0;

        if self.requested & irq_flags::GUEST_MSIX != 0 || enabled {
            let current = if self.requested != 0 {
                self.requested
            } else {
                irq_flags::HOST_MSIX | irq_flags::GUEST_MSIX
            };
            self.deassign(current);
            self.release_routes();
            self.requested = 0;
        }

        if enabled {
            if let Err(e) = self.setup_msix_vectors(cap) {
                error!("failed to set up MSI-X vectors: {e}");
                return;
            }

            if !self.routes.is_empty() {
                if let Err(e) = self.kernel.assign_irq(
                    self.dev_id,
                    0,
                    irq_flags::HOST_MSIX | irq_flags::GUEST_MSIX,
                ) {
                    error!("failed to enable MSI-X: {e}");
                    return;
                }
            }

            self.girq = None;
            self.requested = irq_flags::HOST_MSIX | irq_flags::GUEST_MSIX;
        } else {
            self.assign_intx().ok();
        }
    }

    /// Translate the unmasked shadow-table entries into host routes.
    ///
    /// With every vector masked there is nothing to set up and the
    /// kernel is not involved at all. Routes only become visible to the
    /// device once the whole table was translated; a failure in the
    /// middle releases everything allocated so far.
    fn setup_msix_vectors(&mut self, cap: MsixCapability) -> io::Result<()> {
        let unmasked = (0..cap.max_vectors)
            .filter(|&vector| !self.msix_table.is_masked(vector))
            .count();
        if unmasked == 0 {
            return Ok(());
        }

        self.kernel
            .set_msix_vector_count(self.dev_id, unmasked as u16)?;

        self.release_routes();
        let mut routes = BTreeMap::new();
        let result = (|| {
            for vector in 0..cap.max_vectors {
                if self.msix_table.is_masked(vector) {
                    continue;
                }
                let gsi = self.kernel.add_route(self.msix_table.message(vector))?;
                routes.insert(vector, gsi);
                self.kernel.set_msix_entry(self.dev_id, vector, gsi)?;
            }
            Ok(())
        })();

        match result {
            Ok(()) => {
                self.kernel.commit_routes();
                self.routes = routes;
                Ok(())
            }
            Err(e) => {
                for gsi in routes.values() {
                    self.kernel.del_route(*gsi);
                }
                Err(e)
            }
        }
    }

    /// Handle a guest read of the MSI-X table page.
    pub fn msix_table_read(&self, offset: usize, buf: &mut [u8]) {
        self.msix_table.read(offset, buf);
    }

    /// Handle a guest write to the MSI-X table page.
    ///
    /// Writes to vectors beyond the table are dropped. While MSI-X is
    /// enabled, unmasking a vector activates it: an existing route is
    /// patched in place, a vector without one forces a full re-enable.
    pub fn msix_table_write(&mut self, config: &EmulatedConfig, offset: usize, data: &[u8]) {
        let Some(cap) = self.caps.msix else {
            return;
        };

        let vector = (offset >> 4) as u16;
        if vector >= cap.max_vectors {
            return;
        }

        let enabled = config.get_word(cap.offset as usize + msix::FLAGS) & msix::flags::ENABLE != 0;
        let was_masked = self.msix_table.is_masked(vector);

        self.msix_table.write(offset, data);

        if !enabled {
            return;
        }

        let now_masked = self.msix_table.is_masked(vector);
        if was_masked && !now_masked {
            match self.routes.get(&vector) {
                Some(&gsi) => {
                    if let Err(e) = self.kernel.update_route(gsi, self.msix_table.message(vector))
                    {
                        warn!("failed to update MSI-X route for vector {vector}: {e}");
                    }
                    self.kernel.commit_routes();
                }
                None => self.update_msix(config),
            }
        }
        // Masking a vector needs no action. Interrupts arriving while
        // masked are lost; pending bits are not emulated.
    }
}
