//! # pciassignd
//!
//! A device-assignment engine that hands a physical PCI device to a guest
//! virtual machine. The engine arbitrates per-byte between emulated and
//! passthrough configuration space, rebuilds the capability chain with
//! per-capability hardware quirks, maps BAR resources into guest-visible
//! regions and virtualizes the INTx/MSI/MSI-X interrupt state machine on
//! top of the host kernel's device-assignment interface.

#![deny(missing_debug_implementations)]

pub mod device;
