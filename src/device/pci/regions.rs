//! # BAR Region Mapping
//!
//! Guest accesses to a BAR must end up at the device. For page-sized
//! memory BARs we mmap the host resource and alias it; odd-sized BARs
//! get a slower shim that restricts access widths; port I/O BARs are
//! forwarded through positioned reads and writes on the resource file.
//! Whatever the backing, the guest-visible window is a [`Bus`] so the
//! MSI-X table trap can shadow the page it lives on.

use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicU8, AtomicU16, AtomicU32, AtomicU64, Ordering},
};

use memmap2::{MmapMut, MmapOptions};
use thiserror::Error;
use tracing::{debug, warn};

use crate::device::bus::{AddBusDeviceError, Bus, BusDevice, BusDeviceRef, Request, RequestSize};
use crate::device::pci::config_space::EmulatedConfig;
use crate::device::pci::constants::config_space::bar;
use crate::device::pci::constants::msix_table;
use crate::device::pci::host::HostRegion;
use crate::device::pci::interrupts::InterruptEngine;

/// A BAR could not be turned into a guest-visible region.
#[derive(Debug, Error)]
pub enum RegionError {
    /// Mapping the resource file failed.
    #[error("failed to map BAR {bar}")]
    Map {
        /// The BAR index.
        bar: usize,
        /// The underlying I/O error.
        source: io::Error,
    },
    /// The resource file descriptor could not be duplicated.
    #[error("failed to duplicate the descriptor of BAR {bar}")]
    CloneDescriptor {
        /// The BAR index.
        bar: usize,
        /// The underlying I/O error.
        source: io::Error,
    },
    /// The region composition itself failed.
    #[error("failed to compose the window of BAR {bar}: {source}")]
    Compose {
        /// The BAR index.
        bar: usize,
        /// The composition error.
        source: AddBusDeviceError,
    },
}

/// An owned memory mapping of one BAR resource.
///
/// The file is mapped from offset zero; resources whose host address is
/// not page aligned carry their sub-page offset into the mapping, so all
/// accesses are shifted by it.
pub struct MappedRegion {
    mapping: MmapMut,
    page_offset: usize,
    size: u64,
}

impl std::fmt::Debug for MappedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedRegion")
            .field("page_offset", &self.page_offset)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

impl MappedRegion {
    /// Map `size` bytes of the resource behind `file`, which lives at
    /// `base_addr` on the host.
    pub fn new(file: &File, base_addr: u64, size: u64) -> io::Result<Self> {
        let page_offset = (base_addr & 0xfff) as usize;

        let mut options = MmapOptions::new();
        options.len(page_offset + usize::try_from(size).expect("BAR size fits usize"));

        // SAFETY: We only access mmap'ed memory via atomics, so the
        // warnings around UB in the MmapMut documentation do not apply.
        let mapping = unsafe { options.map_mut(file)? };

        Ok(Self {
            mapping,
            page_offset,
            size,
        })
    }

    fn ptr(&self, addr: u64, len: u64) -> *const u8 {
        assert!(addr.checked_add(len).unwrap() <= self.size);

        // SAFETY: The request was checked to fit into the mapping.
        unsafe {
            self.mapping
                .as_ptr()
                .add(self.page_offset + usize::try_from(addr).unwrap())
        }
    }

    /// Load a value from the mapping.
    #[must_use]
    pub fn load(&self, addr: u64, size: RequestSize) -> u64 {
        let ptr = self.ptr(addr, size.into());

        match size {
            RequestSize::Size1 => {
                // SAFETY:
                //
                // We make sure all accesses to the memory happen via
                // atomics, because the pointer never escapes from
                // MappedRegion. We also ensure above that the pointer
                // points to valid memory.
                let atomic = unsafe { &*(ptr as *const AtomicU8) };

                atomic.load(Ordering::Relaxed).into()
            }
            RequestSize::Size2 => {
                // SAFETY: See above.
                let atomic = unsafe { &*(ptr as *const AtomicU16) };

                atomic.load(Ordering::Relaxed).into()
            }
            RequestSize::Size4 => {
                // SAFETY: See above.
                let atomic = unsafe { &*(ptr as *const AtomicU32) };

                atomic.load(Ordering::Relaxed).into()
            }
            RequestSize::Size8 => {
                // SAFETY: See above.
                let atomic = unsafe { &*(ptr as *const AtomicU64) };

                atomic.load(Ordering::Relaxed)
            }
        }
    }

    /// Store a value into the mapping.
    pub fn store(&self, addr: u64, size: RequestSize, value: u64) {
        let ptr = self.ptr(addr, size.into());

        match size {
            RequestSize::Size1 => {
                // SAFETY: See [`MappedRegion::load`].
                let atomic = unsafe { &*(ptr as *const AtomicU8) };

                atomic.store(value as u8, Ordering::Relaxed);
            }
            RequestSize::Size2 => {
                // SAFETY: See above.
                let atomic = unsafe { &*(ptr as *const AtomicU16) };

                atomic.store(value as u16, Ordering::Relaxed);
            }
            RequestSize::Size4 => {
                // SAFETY: See above.
                let atomic = unsafe { &*(ptr as *const AtomicU32) };

                atomic.store(value as u32, Ordering::Relaxed);
            }
            RequestSize::Size8 => {
                // SAFETY: See above.
                let atomic = unsafe { &*(ptr as *const AtomicU64) };

                atomic.store(value, Ordering::Relaxed);
            }
        }
    }
}

/// A page-sized memory BAR, aliased directly to its mapping.
#[derive(Debug)]
struct AliasRegion {
    region: MappedRegion,
}

impl BusDevice for AliasRegion {
    fn size(&self) -> u64 {
        self.region.size
    }

    fn read(&self, req: Request) -> u64 {
        self.region.load(req.addr, req.size)
    }

    fn write(&self, req: Request, value: u64) {
        self.region.store(req.addr, req.size, value);
    }
}

/// A memory BAR that is not a whole number of pages.
///
/// Such a region cannot be aliased into the guest without exposing
/// neighbouring host state, so it takes this path, which only allows the
/// access widths a device register bank supports.
#[derive(Debug)]
struct SlowRegion {
    region: MappedRegion,
}

impl BusDevice for SlowRegion {
    fn size(&self) -> u64 {
        self.region.size
    }

    fn read(&self, req: Request) -> u64 {
        match req.size {
            RequestSize::Size1 | RequestSize::Size2 | RequestSize::Size4 => {
                self.region.load(req.addr, req.size)
            }
            RequestSize::Size8 => {
                warn!("unsupported 8-byte read at {:#x} of a slow BAR", req.addr);
                u64::MAX
            }
        }
    }

    fn write(&self, req: Request, value: u64) {
        match req.size {
            RequestSize::Size1 | RequestSize::Size2 | RequestSize::Size4 => {
                self.region.store(req.addr, req.size, value);
            }
            RequestSize::Size8 => {
                warn!("ignored 8-byte write at {:#x} of a slow BAR", req.addr);
            }
        }
    }
}

/// A port I/O BAR, forwarded through the resource file.
#[derive(Debug)]
struct PortIoRegion {
    file: File,
    size: u64,
}

impl BusDevice for PortIoRegion {
    fn size(&self) -> u64 {
        self.size
    }

    fn read(&self, req: Request) -> u64 {
        let len = u64::from(req.size);
        if len > 4 {
            warn!("unsupported {len}-byte port read at {:#x}", req.addr);
            return u64::MAX;
        }

        let mut buf = [0u8; 8];
        match self.file.read_at(&mut buf[..len as usize], req.addr) {
            Ok(_) => u64::from_le_bytes(buf),
            Err(e) => {
                warn!("port read at {:#x} failed: {e}", req.addr);
                !0 >> (64 - 8 * len)
            }
        }
    }

    fn write(&self, req: Request, value: u64) {
        let len = u64::from(req.size);
        if len > 4 {
            warn!("ignored {len}-byte port write at {:#x}", req.addr);
            return;
        }

        if let Err(e) = self
            .file
            .write_all_at(&value.to_le_bytes()[..len as usize], req.addr)
        {
            warn!("port write at {:#x} failed: {e}", req.addr);
        }
    }
}

/// The page intercepting guest access to the MSI-X vector table.
#[derive(Debug)]
struct MsixTrap {
    config: Arc<Mutex<EmulatedConfig>>,
    engine: Arc<Mutex<InterruptEngine>>,
    size: u64,
}

impl BusDevice for MsixTrap {
    fn size(&self) -> u64 {
        self.size
    }

    fn read(&self, req: Request) -> u64 {
        let engine = self.engine.lock().unwrap();

        let mut buf = [0u8; 8];
        let len = usize::from(u8::from(req.size));
        engine.msix_table_read(req.addr as usize, &mut buf[..len]);
        u64::from_le_bytes(buf)
    }

    fn write(&self, req: Request, value: u64) {
        // Lock order: configuration space before interrupt engine.
        let config = self.config.lock().unwrap();
        let mut engine = self.engine.lock().unwrap();

        let len = usize::from(u8::from(req.size));
        engine.msix_table_write(&config, req.addr as usize, &value.to_le_bytes()[..len]);
    }
}

/// The guest-visible window onto one BAR.
#[derive(Debug)]
pub struct GuestRegionView {
    /// The BAR index this window belongs to.
    pub bar: usize,
    bus: Bus,
}

impl BusDevice for GuestRegionView {
    fn size(&self) -> u64 {
        self.bus.size()
    }

    fn read(&self, req: Request) -> u64 {
        self.bus.read(req)
    }

    fn write(&self, req: Request, value: u64) {
        self.bus.write(req, value)
    }
}

/// Builds guest-visible windows for a device's BARs.
#[derive(Debug)]
pub struct RegionMapper {
    config: Arc<Mutex<EmulatedConfig>>,
    engine: Arc<Mutex<InterruptEngine>>,
    /// Host physical address of the MSI-X vector table, if the device
    /// has one.
    msix_table_addr: Option<u64>,
}

impl RegionMapper {
    /// Create a mapper for one device.
    #[must_use]
    pub fn new(
        config: Arc<Mutex<EmulatedConfig>>,
        engine: Arc<Mutex<InterruptEngine>>,
        msix_table_addr: Option<u64>,
    ) -> Self {
        Self {
            config,
            engine,
            msix_table_addr,
        }
    }

    /// Turn a host BAR resource into its guest-visible window.
    pub fn map(&self, region: &HostRegion) -> Result<GuestRegionView, RegionError> {
        let bar = region.index;
        let compose = |source| RegionError::Compose { bar, source };

        let backing: BusDeviceRef = if region.is_io() {
            let file = region
                .resource
                .try_clone()
                .map_err(|source| RegionError::CloneDescriptor { bar, source })?;
            Arc::new(PortIoRegion {
                file,
                size: region.size,
            })
        } else {
            let mapped = MappedRegion::new(&region.resource, region.base_addr, region.size)
                .map_err(|source| RegionError::Map { bar, source })?;

            if region.size % msix_table::PAGE_SIZE as u64 == 0 {
                Arc::new(AliasRegion { region: mapped })
            } else {
                warn!(
                    "BAR {bar} has odd size {:#x}, accesses take the slow path",
                    region.size
                );
                Arc::new(SlowRegion { region: mapped })
            }
        };

        let mut bus = Bus::new("bar", region.size);
        bus.add(0, backing).map_err(compose)?;

        if !region.is_io() {
            if let Some(table_addr) = self.msix_table_addr {
                let span = region.base_addr..region.base_addr + region.size;
                if span.contains(&table_addr) {
                    let offset = table_addr - region.base_addr;
                    let trap_size = (region.size - offset).min(msix_table::PAGE_SIZE as u64);

                    debug!("MSI-X table trap shadows BAR {bar} at {offset:#x}");
                    let trap = Arc::new(MsixTrap {
                        config: self.config.clone(),
                        engine: self.engine.clone(),
                        size: trap_size,
                    });
                    bus.add_overlapping(offset, trap, 1).map_err(compose)?;
                }
            }
        }

        Ok(GuestRegionView { bar, bus })
    }
}

/// The low type bits of the guest-visible BAR register.
#[must_use]
pub fn bar_type_bits(region: &HostRegion) -> u32 {
    if region.is_io() {
        bar::SPACE_IO
    } else if region.is_prefetchable() {
        bar::MEM_PREFETCH
    } else {
        0
    }
}

/// The sizing mask for the guest-visible BAR register.
///
/// Hardware with a non-power-of-two resource still has to expose a
/// power-of-two BAR, so round up. 16 bytes is the smallest BAR the PCI
/// spec allows.
#[must_use]
pub fn bar_size_mask(size: u64) -> u32 {
    let esize = size.next_power_of_two().max(16);
    !(esize - 1) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::ffi::CString;
    use std::os::fd::FromRawFd;

    use crate::device::pci::caps::{Capabilities, MsixCapability};
    use crate::device::pci::kernel::testing::{FakeKernel, FakeRouter};

    fn create_memfd(size: u64) -> File {
        let fd = unsafe { libc::memfd_create(CString::new("unittest").unwrap().as_ptr(), 0) };
        assert!(fd >= 0, "{}", io::Error::last_os_error());

        // SAFETY: fd is a valid file descriptor, because we created it above.
        let file = unsafe { File::from_raw_fd(fd) };
        file.set_len(size).unwrap();
        file
    }

    fn mem_region(index: usize, base_addr: u64, size: u64) -> HostRegion {
        HostRegion {
            index,
            base_addr,
            size,
            flags: crate::device::pci::constants::resource_flags::MEM,
            resource: create_memfd(size + (base_addr & 0xfff)),
        }
    }

    fn plain_mapper() -> RegionMapper {
        mapper_with_table(None)
    }

    fn mapper_with_table(msix_table_addr: Option<u64>) -> RegionMapper {
        let kernel = Arc::new(FakeKernel::new());
        let router = Arc::new(FakeRouter::default());
        let caps = Capabilities {
            msi: None,
            msix: msix_table_addr.map(|table_addr| MsixCapability {
                offset: 0x60,
                max_vectors: 8,
                table_addr,
            }),
        };
        let engine = InterruptEngine::new(kernel, router, 0, caps, 0, false);

        RegionMapper::new(
            Arc::new(Mutex::new(EmulatedConfig::new())),
            Arc::new(Mutex::new(engine)),
            msix_table_addr,
        )
    }

    #[test]
    fn mapped_regions_read_back_writes() {
        let memfd = create_memfd(0x1000);
        let region = MappedRegion::new(&memfd, 0xfe00_0000, 0x1000).unwrap();

        assert_eq!(region.load(0, RequestSize::Size8), 0);
        region.store(0, RequestSize::Size8, 0xcafe_d00d_feed_face);
        assert_eq!(region.load(0, RequestSize::Size8), 0xcafe_d00d_feed_face);
    }

    #[test]
    fn unaligned_base_addresses_shift_the_mapping() {
        let memfd = create_memfd(0x1040);
        let region = MappedRegion::new(&memfd, 0xfe00_0040, 0x1000).unwrap();

        region.store(0, RequestSize::Size4, 0x1234_5678);

        let mut check = [0u8; 4];
        memfd.read_exact_at(&mut check, 0x40).unwrap();
        assert_eq!(u32::from_le_bytes(check), 0x1234_5678);
    }

    #[test]
    fn page_sized_bars_allow_wide_accesses() {
        let region = mem_region(0, 0xfe00_0000, 0x2000);
        let view = plain_mapper().map(&region).unwrap();

        view.write(Request::new(0x1ff8, RequestSize::Size8), 0xaabb_ccdd_0011_2233);
        assert_eq!(
            view.read(Request::new(0x1ff8, RequestSize::Size8)),
            0xaabb_ccdd_0011_2233
        );
    }

    #[test]
    fn odd_sized_bars_reject_wide_accesses() {
        let region = mem_region(1, 0xfe00_0000, 0x800);
        let view = plain_mapper().map(&region).unwrap();

        view.write(Request::new(0, RequestSize::Size8), 0xaabb_ccdd_0011_2233);
        assert_eq!(view.read(Request::new(0, RequestSize::Size8)), u64::MAX);

        view.write(Request::new(0, RequestSize::Size4), 0x0011_2233);
        assert_eq!(view.read(Request::new(0, RequestSize::Size4)), 0x0011_2233);
    }

    #[test]
    fn port_regions_forward_positioned_io() {
        let file = create_memfd(0x40);
        file.write_all_at(&0xbeefu16.to_le_bytes(), 0x10).unwrap();

        let region = PortIoRegion { file, size: 0x40 };
        assert_eq!(region.read(Request::new(0x10, RequestSize::Size2)), 0xbeef);

        region.write(Request::new(0x20, RequestSize::Size1), 0x42);
        assert_eq!(region.read(Request::new(0x20, RequestSize::Size1)), 0x42);

        assert_eq!(region.read(Request::new(0, RequestSize::Size8)), u64::MAX);
    }

    #[test]
    fn the_msix_trap_shadows_its_page() {
        let region = mem_region(0, 0xfe00_0000, 0x4000);
        let mapper = mapper_with_table(Some(0xfe00_2000));
        let view = mapper.map(&region).unwrap();

        // A write outside the trap page hits the backing memory.
        view.write(Request::new(0x1000, RequestSize::Size4), 0x5555_5555);
        assert_eq!(
            view.read(Request::new(0x1000, RequestSize::Size4)),
            0x5555_5555
        );

        // Reads of the table page come from the shadow table, which has
        // every vector masked, while the backing memory is all zeroes.
        let ctrl = 0x2000 + msix_table::offset::CONTROL as u64;
        assert_eq!(
            view.read(Request::new(ctrl, RequestSize::Size4)),
            msix_table::CONTROL_MASKED.into()
        );

        // A write inside the trap page lands in the shadow table, not
        // the backing.
        view.write(Request::new(ctrl, RequestSize::Size4), 0);
        assert!(!mapper.engine.lock().unwrap().msix_table.is_masked(0));

        // The backing behind the trap page is untouched.
        let mut check = [0u8; 4];
        region
            .resource
            .read_exact_at(&mut check, ctrl)
            .unwrap();
        assert_eq!(u32::from_le_bytes(check), 0);
        assert_eq!(view.read(Request::new(ctrl, RequestSize::Size4)), 0);
    }

    #[test]
    fn the_trap_is_clamped_to_the_region_end() {
        // The table starts 0x800 bytes before the region ends.
        let region = mem_region(0, 0xfe00_0000, 0x1800);
        let mapper = mapper_with_table(Some(0xfe00_1000));

        let view = mapper.map(&region).unwrap();

        // Trap reads work right up to the region end.
        let last = 0x1800 - 4;
        let masked = u64::from(msix_table::CONTROL_MASKED);
        assert_eq!(
            view.read(Request::new(last, RequestSize::Size4)) & masked,
            masked
        );
    }

    #[test]
    fn a_table_outside_the_region_adds_no_trap() {
        let region = mem_region(0, 0xfe00_0000, 0x1000);
        let mapper = mapper_with_table(Some(0xfee0_0000));
        let view = mapper.map(&region).unwrap();

        view.write(Request::new(0, RequestSize::Size4), 0x77);
        assert_eq!(view.read(Request::new(0, RequestSize::Size4)), 0x77);
    }

    #[test]
    fn bar_registers_encode_type_and_size() {
        let region = mem_region(0, 0xfe00_0000, 0x1000);
        assert_eq!(bar_type_bits(&region), 0);
        assert_eq!(bar_size_mask(0x1000), 0xffff_f000);
        // Odd sizes round up, tiny sizes clamp to the spec minimum.
        assert_eq!(bar_size_mask(0x1800), 0xffff_e000);
        assert_eq!(bar_size_mask(4), !0xfu32);
    }
}
