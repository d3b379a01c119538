//! # Host Kernel Interface
//!
//! The host kernel's device-assignment API, modeled as a trait so the
//! interrupt and lifecycle code can be exercised without a kernel. All
//! errors are [`std::io::Error`]s carrying the raw OS errno; callers
//! make policy decisions based on specific errnos (`EIO`, `ENXIO`,
//! `EBUSY`).

use std::io;

/// An MSI message as programmed by the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsiMessage {
    /// The 64-bit message address.
    pub address: u64,
    /// The 32-bit message data payload.
    pub data: u32,
}

/// The device-assignment and interrupt-routing operations the host
/// kernel offers.
///
/// `id` is the device handle from
/// [`HostIdentity::assigned_dev_id`](crate::device::pci::host::HostIdentity::assigned_dev_id).
/// IRQ `flags` use the
/// [`irq_flags`](crate::device::pci::constants::assignment::irq_flags)
/// encoding.
pub trait DeviceAssignment {
    /// Whether the kernel can assign device interrupts at all.
    fn has_irq_assignment(&self) -> bool;
    /// Whether the kernel can route MSI-X vectors for assigned devices.
    fn probe_msix_support(&self) -> bool;
    /// Whether the kernel can mask INTx at the device via PCI 2.3
    /// semantics.
    fn has_intx_mask(&self) -> bool;
    /// Whether an IOMMU is available for DMA isolation.
    fn has_iommu(&self) -> bool;
    /// Whether the kernel understands devices outside PCI segment 0.
    fn has_pci_segments(&self) -> bool;

    /// Hand the device to the kernel's assignment machinery.
    fn assign_device(&self, id: u32, flags: u32) -> io::Result<()>;
    /// Return the device to the host.
    fn deassign_device(&self, id: u32) -> io::Result<()>;

    /// Connect a host interrupt source to a guest interrupt.
    fn assign_irq(&self, id: u32, guest_irq: u32, flags: u32) -> io::Result<()>;
    /// Tear down the interrupt connection of the given type.
    fn deassign_irq(&self, id: u32, flags: u32) -> io::Result<()>;
    /// Mask or unmask the device's INTx line.
    fn set_intx_mask(&self, id: u32, masked: bool) -> io::Result<()>;

    /// Allocate a routing-table entry for an MSI message, returning its
    /// GSI number.
    fn add_route(&self, message: MsiMessage) -> io::Result<u32>;
    /// Change the message of an existing routing-table entry.
    fn update_route(&self, gsi: u32, message: MsiMessage) -> io::Result<()>;
    /// Delete a routing-table entry and free its GSI.
    fn del_route(&self, gsi: u32);
    /// Flush pending routing-table changes to the kernel.
    fn commit_routes(&self);

    /// Size the MSI-X vector table before populating it.
    fn set_msix_vector_count(&self, id: u32, count: u16) -> io::Result<()>;
    /// Bind one MSI-X vector to a routing-table entry.
    fn set_msix_entry(&self, id: u32, vector: u16, gsi: u32) -> io::Result<()>;
}

/// Resolves which guest interrupt line an INTx pin is wired to.
///
/// The wiring depends on where the machine model puts the device, which
/// is outside this crate; interrupt code asks through this trait
/// whenever the routing may have changed.
pub trait GuestIrqRouter {
    /// The guest IRQ for an INTx pin (1 through 4).
    fn route_intx_pin(&self, pin: u8) -> u32;
}

#[cfg(test)]
pub(crate) mod testing {
    //! A scriptable stand-in for the kernel interface.

    use super::*;

    use std::collections::BTreeMap;
    use std::sync::Mutex;

    /// What the fake kernel has been asked to do so far.
    #[derive(Debug, Default)]
    pub struct FakeKernelLog {
        pub assigned_devices: Vec<(u32, u32)>,
        pub deassigned_devices: Vec<u32>,
        pub assigned_irqs: Vec<(u32, u32, u32)>,
        pub deassigned_irqs: Vec<(u32, u32)>,
        pub intx_masks: Vec<(u32, bool)>,
        pub vector_counts: Vec<(u32, u16)>,
        pub msix_entries: Vec<(u32, u16, u32)>,
        pub commits: usize,
        pub routes: BTreeMap<u32, MsiMessage>,
        next_gsi: u32,
    }

    /// Errnos the fake kernel should fail with, consumed in order.
    #[derive(Debug, Default)]
    struct Failures {
        assign_device: Vec<i32>,
        assign_irq: Vec<i32>,
        deassign_irq: Vec<i32>,
        set_intx_mask: Vec<i32>,
        add_route: Vec<i32>,
        set_msix_vector_count: Vec<i32>,
        set_msix_entry: Vec<i32>,
    }

    #[derive(Debug, Default)]
    pub struct FakeKernel {
        pub log: Mutex<FakeKernelLog>,
        failures: Mutex<Failures>,
        pub msix_supported: bool,
        pub intx_mask_supported: bool,
        pub iommu_present: bool,
    }

    impl FakeKernel {
        pub fn new() -> Self {
            Self {
                msix_supported: true,
                intx_mask_supported: true,
                iommu_present: true,
                ..Self::default()
            }
        }

        pub fn fail_assign_device(&self, errno: i32) {
            self.failures.lock().unwrap().assign_device.push(errno);
        }

        pub fn fail_assign_irq(&self, errno: i32) {
            self.failures.lock().unwrap().assign_irq.push(errno);
        }

        pub fn fail_deassign_irq(&self, errno: i32) {
            self.failures.lock().unwrap().deassign_irq.push(errno);
        }

        pub fn fail_add_route(&self, errno: i32) {
            self.failures.lock().unwrap().add_route.push(errno);
        }

        pub fn fail_set_msix_entry(&self, errno: i32) {
            self.failures.lock().unwrap().set_msix_entry.push(errno);
        }

        fn take(queue: &mut Vec<i32>) -> io::Result<()> {
            if queue.is_empty() {
                Ok(())
            } else {
                Err(io::Error::from_raw_os_error(queue.remove(0)))
            }
        }
    }

    impl DeviceAssignment for FakeKernel {
        fn has_irq_assignment(&self) -> bool {
            true
        }

        fn probe_msix_support(&self) -> bool {
            self.msix_supported
        }

        fn has_intx_mask(&self) -> bool {
            self.intx_mask_supported
        }

        fn has_iommu(&self) -> bool {
            self.iommu_present
        }

        fn has_pci_segments(&self) -> bool {
            false
        }

        fn assign_device(&self, id: u32, flags: u32) -> io::Result<()> {
            Self::take(&mut self.failures.lock().unwrap().assign_device)?;
            self.log.lock().unwrap().assigned_devices.push((id, flags));
            Ok(())
        }

        fn deassign_device(&self, id: u32) -> io::Result<()> {
            self.log.lock().unwrap().deassigned_devices.push(id);
            Ok(())
        }

        fn assign_irq(&self, id: u32, guest_irq: u32, flags: u32) -> io::Result<()> {
            Self::take(&mut self.failures.lock().unwrap().assign_irq)?;
            self.log
                .lock()
                .unwrap()
                .assigned_irqs
                .push((id, guest_irq, flags));
            Ok(())
        }

        fn deassign_irq(&self, id: u32, flags: u32) -> io::Result<()> {
            Self::take(&mut self.failures.lock().unwrap().deassign_irq)?;
            self.log.lock().unwrap().deassigned_irqs.push((id, flags));
            Ok(())
        }

        fn set_intx_mask(&self, id: u32, masked: bool) -> io::Result<()> {
            Self::take(&mut self.failures.lock().unwrap().set_intx_mask)?;
            self.log.lock().unwrap().intx_masks.push((id, masked));
            Ok(())
        }

        fn add_route(&self, message: MsiMessage) -> io::Result<u32> {
            Self::take(&mut self.failures.lock().unwrap().add_route)?;
            let mut log = self.log.lock().unwrap();
            let gsi = log.next_gsi;
            log.next_gsi += 1;
            log.routes.insert(gsi, message);
            Ok(gsi)
        }

        fn update_route(&self, gsi: u32, message: MsiMessage) -> io::Result<()> {
            let mut log = self.log.lock().unwrap();
            match log.routes.get_mut(&gsi) {
                Some(entry) => {
                    *entry = message;
                    Ok(())
                }
                None => Err(io::Error::from_raw_os_error(libc::ENOENT)),
            }
        }

        fn del_route(&self, gsi: u32) {
            self.log.lock().unwrap().routes.remove(&gsi);
        }

        fn commit_routes(&self) {
            self.log.lock().unwrap().commits += 1;
        }

        fn set_msix_vector_count(&self, id: u32, count: u16) -> io::Result<()> {
            Self::take(&mut self.failures.lock().unwrap().set_msix_vector_count)?;
            self.log.lock().unwrap().vector_counts.push((id, count));
            Ok(())
        }

        fn set_msix_entry(&self, id: u32, vector: u16, gsi: u32) -> io::Result<()> {
            Self::take(&mut self.failures.lock().unwrap().set_msix_entry)?;
            self.log
                .lock()
                .unwrap()
                .msix_entries
                .push((id, vector, gsi));
            Ok(())
        }
    }

    /// A router that wires every pin to a fixed base IRQ plus the pin
    /// number, with an adjustable offset to simulate rerouting.
    #[derive(Debug, Default)]
    pub struct FakeRouter {
        pub base: Mutex<u32>,
    }

    impl GuestIrqRouter for FakeRouter {
        fn route_intx_pin(&self, pin: u8) -> u32 {
            *self.base.lock().unwrap() + u32::from(pin)
        }
    }
}
