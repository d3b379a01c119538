//! # PCI Constants
//!
//! This module collects PCI related constants. All definitions are derived
//! from the PCI Spec, either the "PCI Local Bus Specification" or newer
//! "PCI Express Base Specification" documents, plus the Linux sysfs
//! resource-flag encoding.

// Allow missing docs to avoid duplicating the PCI spec for all constants.
#![allow(missing_docs)]

/// Constants related to the configuration space.
pub mod config_space {

    /// The config space size of a single PCI device in bytes.
    pub const SIZE: usize = 256;

    /// The maximum number of Base Address Registers (BARs) per device.
    pub const MAX_BARS: usize = 6;

    /// The offsets of various fields in the configuration space.
    pub mod offset {
        pub const VENDOR: usize = 0x0;
        pub const DEVICE: usize = 0x2;
        pub const COMMAND: usize = 0x4;
        pub const STATUS: usize = 0x6;
        pub const REVISION: usize = 0x8;
        pub const PROG_IF: usize = 0x9;
        pub const SUBCLASS: usize = 0xA;
        pub const CLASS: usize = 0xB;
        pub const CACHE_LINE_SIZE: usize = 0xC;
        pub const LATENCY_TIMER: usize = 0xD;
        pub const HEADER_TYPE: usize = 0xE;
        pub const BIST: usize = 0xF;

        pub const BAR_0: usize = 0x10;

        pub const CARDBUS_CIS: usize = 0x28;
        pub const SUBSYSTEM_VENDOR_ID: usize = 0x2C;
        pub const SUBSYSTEM_ID: usize = 0x2E;
        pub const ROM_BAR: usize = 0x30;
        pub const CAPABILITIES_POINTER: usize = 0x34;
        pub const IRQ_LINE: usize = 0x3C;
        pub const IRQ_PIN: usize = 0x3D;
        pub const MIN_GNT: usize = 0x3E;
        pub const MAX_LAT: usize = 0x3F;
    }

    /// Command Register Constants.
    pub mod command {
        pub const BUS_MASTER: u16 = 1 << 2;
        pub const INTX_DISABLE: u16 = 1 << 10;
    }

    /// Status Register Constants.
    pub mod status {
        /// The device has a list of capabilities starting at
        /// [`CAPABILITIES_POINTER`](super::offset::CAPABILITIES_POINTER).
        pub const CAPABILITIES: u16 = 1 << 4;
    }

    /// PCI header type.
    pub mod header_type {
        pub const MULTIFUNCTION: u8 = 1 << 7;
    }

    /// BAR register low-bit encodings.
    pub mod bar {
        pub const SPACE_IO: u32 = 0x1;
        pub const MEM_PREFETCH: u32 = 0x8;
        pub const IO_ADDRESS_MASK: u32 = 0xffff_fffc;
        pub const MEM_ADDRESS_MASK: u32 = 0xffff_fff0;
    }

    /// IDs for PCI Capabilities.
    pub mod capability_id {
        pub const POWER_MANAGEMENT: u8 = 0x01;
        pub const VPD: u8 = 0x03;
        pub const MSI: u8 = 0x05;
        pub const PCI_X: u8 = 0x07;
        pub const VENDOR_SPECIFIC: u8 = 0x09;
        pub const EXPRESS: u8 = 0x10;
        pub const MSI_X: u8 = 0x11;
    }

    /// Markers and layout of the capability list.
    pub mod capability_list {
        /// Hardware read errors show up as an all-ones capability ID.
        pub const INVALID_ID: u8 = 0xFF;

        /// The first config space offset at which capabilities may live.
        pub const FIRST_OFFSET: u8 = 0x40;

        /// Offset of the "next capability" pointer within a capability.
        pub const NEXT: usize = 1;

        /// Hard bound on capability chain walks. Guards against a
        /// malformed or malicious hardware-reported chain.
        pub const MAX_WALK: usize = 48;
    }

    /// Constants for the MSI capability.
    pub mod msi {
        /// Guest-visible size of the capability in bytes (32-bit address,
        /// no per-vector masking).
        pub const SIZE: u8 = 10;

        /// The offset of the message control register.
        pub const FLAGS: usize = 2;
        /// The offset of the lower address part.
        pub const ADDRESS_LO: usize = 4;
        /// The offset of the 32-bit data field.
        pub const DATA_32: usize = 8;

        pub mod flags {
            pub const ENABLE: u16 = 1 << 0;
            /// Multi-message capable field.
            pub const QMASK: u16 = 0x000e;
            /// Multi-message enable field.
            pub const QSIZE: u16 = 0x0070;
        }
    }

    /// Constants for the MSI-X capability.
    pub mod msix {
        /// Guest-visible size of the capability in bytes.
        pub const SIZE: u8 = 12;

        /// The offset of the message control register.
        pub const FLAGS: usize = 2;
        /// The offset of the table offset / BAR indicator register.
        pub const TABLE: usize = 4;

        pub mod flags {
            /// The table size field contains the last valid vector index.
            pub const QSIZE: u16 = 0x07ff;
            pub const MASKALL: u16 = 1 << 14;
            pub const ENABLE: u16 = 1 << 15;
        }

        /// BAR indicator bits in the table register.
        pub const BIR_MASK: u32 = 0x7;
    }

    /// Constants for the Power Management capability.
    pub mod power_management {
        /// Guest-visible size of the capability in bytes.
        pub const SIZE: u8 = 8;

        /// Power Management Capabilities register.
        pub const PMC: usize = 2;
        /// Power Management Control/Status register.
        pub const CTRL: usize = 4;
        pub const PPB_EXTENSIONS: usize = 6;
        pub const DATA_REGISTER: usize = 7;

        pub mod pmc {
            pub const VERSION: u16 = 0x0007;
            pub const DSI: u16 = 0x0020;
        }

        pub mod ctrl {
            pub const NO_SOFT_RESET: u16 = 0x0008;
        }
    }

    /// Constants for the PCI Express capability.
    pub mod express {
        /// Capability size for capability version 1.
        pub const SIZE_V1: u8 = 0x14;
        /// Capability size for capability version 2.
        pub const SIZE_V2: u8 = 0x3c;
        /// Smallest acceptable version-2 size. Some devices (bcm5761)
        /// truncate the register block in violation of PCIe 3.0.
        pub const MIN_SIZE_V2: u8 = 0x34;

        pub const FLAGS: usize = 2;
        pub const DEVCAP: usize = 4;
        pub const DEVCTL: usize = 8;
        pub const DEVSTA: usize = 0xa;
        pub const LNKCAP: usize = 0xc;
        pub const LNKSTA: usize = 0x12;
        pub const SLTCAP: usize = 0x14;
        pub const SLTCTL: usize = 0x18;
        pub const SLTSTA: usize = 0x1a;
        pub const RTCTL: usize = 0x1c;
        pub const RTCAP: usize = 0x1e;
        pub const RTSTA: usize = 0x20;

        pub mod flags {
            pub const VERSION: u16 = 0x000f;
            pub const TYPE: u16 = 0x00f0;
            pub const TYPE_SHIFT: u16 = 4;
        }

        /// Device/port type values from the flags register.
        pub mod device_type {
            pub const ENDPOINT: u16 = 0x0;
            pub const LEGACY_ENDPOINT: u16 = 0x1;
            pub const ROOT_COMPLEX_ENDPOINT: u16 = 0x9;
        }

        pub mod devcap {
            pub const FLR: u32 = 1 << 28;
        }

        pub mod devctl {
            pub const RELAX_EN: u16 = 0x0010;
            pub const PAYLOAD: u16 = 0x00e0;
            pub const AUX_PME: u16 = 0x0400;
            pub const NOSNOOP_EN: u16 = 0x0800;
            pub const READRQ: u16 = 0x7000;
            pub const BCR_FLR: u16 = 0x8000;
        }

        pub mod lnkcap {
            pub const SLS: u32 = 0x0000_000f;
            pub const MLW: u32 = 0x0000_03f0;
            pub const ASPMS: u32 = 0x0000_0c00;
            pub const L0SEL: u32 = 0x0000_7000;
            pub const L1EL: u32 = 0x0003_8000;
        }

        pub mod lnksta {
            pub const CLS: u16 = 0x000f;
            pub const NLW: u16 = 0x03f0;
        }
    }

    /// Constants for the PCI-X capability.
    pub mod pci_x {
        /// Guest-visible size of the capability in bytes (the minimum).
        pub const SIZE: u8 = 8;

        pub const CMD: usize = 2;
        pub const STATUS: usize = 4;

        pub mod cmd {
            pub const DPERR_E: u16 = 0x0001;
            pub const ERO: u16 = 0x0002;
            pub const MAX_READ: u16 = 0x000c;
            pub const MAX_SPLIT: u16 = 0x0070;
        }

        pub mod status {
            pub const DEVFN: u32 = 0x0000_00ff;
            pub const BUS: u32 = 0x0000_ff00;
            pub const SPL_DISC: u32 = 1 << 18;
            pub const UNX_SPL: u32 = 1 << 19;
            pub const SPL_ERR: u32 = 1 << 29;
        }
    }

    /// Constants for the VPD capability.
    pub mod vpd {
        /// Guest-visible size of the capability in bytes.
        pub const SIZE: u8 = 8;
    }

    /// Well-known vendor/device IDs used by hardware quirks.
    pub mod quirk {
        pub const VENDOR_INTEL: u16 = 0x8086;
        /// Intel 82599 VF; reports PCIe capability version 0 but is
        /// really version 2, like its physical function.
        pub const DEVICE_82599_VF: u16 = 0x10ed;
    }
}

/// The MSI-X vector table layout.
pub mod msix_table {
    /// The vector table occupies one page.
    pub const PAGE_SIZE: usize = 0x1000;

    /// The size of a single entry of the MSI-X table in bytes.
    pub const ENTRY_SIZE: usize = 16;

    /// Offsets of fields in an MSI-X table entry.
    pub mod offset {
        pub const ADDRESS_LO: usize = 0;
        pub const ADDRESS_HI: usize = 4;
        pub const DATA: usize = 8;
        pub const CONTROL: usize = 12;
    }

    /// A bit in the control word that indicates whether this vector is
    /// masked.
    pub const CONTROL_MASKED: u32 = 1 << 0;
}

/// Resource-type flags from the host's resource descriptor file.
///
/// These match the Linux `ioport.h` encoding used by pci-sysfs.
pub mod resource_flags {
    pub const IO: u64 = 0x0000_0100;
    pub const MEM: u64 = 0x0000_0200;
    pub const PREFETCH: u64 = 0x0000_2000;
}

/// Host kernel device-assignment interface flags.
pub mod assignment {
    /// Flags for device assignment.
    pub mod device_flags {
        pub const ENABLE_IOMMU: u32 = 1 << 0;
        /// The device supports PCI 2.3 style INTx masking via the
        /// command register.
        pub const PCI_2_3: u32 = 1 << 1;
    }

    /// Flags describing an IRQ assignment, split into the host-side
    /// substrate and the guest-visible delivery type.
    pub mod irq_flags {
        pub const HOST_INTX: u32 = 1 << 0;
        pub const HOST_MSI: u32 = 1 << 1;
        pub const HOST_MSIX: u32 = 1 << 2;
        pub const GUEST_INTX: u32 = 1 << 8;
        pub const GUEST_MSI: u32 = 1 << 9;
        pub const GUEST_MSIX: u32 = 1 << 10;
    }
}
