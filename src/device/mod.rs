//! # Device Passthrough Code
//!
//! This module contains the passthrough device plumbing. It should never
//! depend on guest-CPU or VM-lifecycle specific parts.

#![deny(missing_docs)]
#![deny(rustdoc::all)]
#![deny(missing_debug_implementations)]

pub mod bus;
pub mod pci;
