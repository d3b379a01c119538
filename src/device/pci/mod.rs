//! # PCI Device Assignment
//!
//! Everything needed to hand a physical PCI device to a guest. The
//! submodules split the problem the way the hardware does.

pub mod assigned;
pub mod caps;
pub mod config_space;
pub mod constants;
pub mod host;
pub mod interrupts;
pub mod kernel;
pub mod regions;
