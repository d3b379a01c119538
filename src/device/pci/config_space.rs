//! # Configuration Space Emulation
//!
//! A passthrough device's configuration space is a patchwork. Some bits
//! must be emulated, because the guest sees different values than the
//! host (BAR addresses, interrupt state). Other bits must go straight to
//! the hardware, because they carry live device state. This module keeps
//! the patchwork honest with a per-bit arbitration table.
//!
//! Each of the 2048 configuration space bits has a read policy and a
//! write policy. A set bit in the respective table means the bit is
//! emulated; a clear bit means it belongs to the hardware.

use crate::device::pci::constants::config_space::SIZE;
use crate::device::pci::host::ConfigResource;

/// Extract the per-bit mask for an access of `len` bytes at `offset` as
/// a little-endian value.
fn mask_of(table: &[u8; SIZE], offset: usize, len: usize) -> u32 {
    let mut mask: u32 = 0;
    for i in 0..len {
        mask |= u32::from(table[offset + i]) << (8 * i);
    }
    mask
}

/// The mask that marks every bit of a `len` byte access.
fn full_mask(len: usize) -> u32 {
    if len == 4 {
        u32::MAX
    } else {
        (1u32 << (8 * len)) - 1
    }
}

/// The guest-visible configuration space and its arbitration tables.
#[derive(Debug, Clone)]
pub struct EmulatedConfig {
    /// The cached guest-visible register values.
    config: [u8; SIZE],
    /// Which emulated bits the guest may change.
    wmask: [u8; SIZE],
    /// Which emulated bits are write-1-to-clear.
    w1cmask: [u8; SIZE],
    /// Which bits are emulated on read.
    emulate_read: [u8; SIZE],
    /// Which bits are emulated on write.
    emulate_write: [u8; SIZE],
}

impl Default for EmulatedConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl EmulatedConfig {
    /// Create a configuration space in which every bit is emulated.
    ///
    /// Callers punch passthrough holes into the tables afterwards. This
    /// direction is the safe one: a forgotten register reads as zero
    /// instead of leaking host state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: [0; SIZE],
            wmask: [0; SIZE],
            w1cmask: [0; SIZE],
            emulate_read: [0xff; SIZE],
            emulate_write: [0xff; SIZE],
        }
    }

    /// Route reads of the given byte range directly to the hardware.
    pub fn direct_read(&mut self, offset: usize, len: usize) {
        self.emulate_read[offset..offset + len].fill(0);
    }

    /// Route writes of the given byte range directly to the hardware.
    pub fn direct_write(&mut self, offset: usize, len: usize) {
        self.emulate_write[offset..offset + len].fill(0);
    }

    /// Route reads and writes of the given byte range directly to the
    /// hardware.
    pub fn direct_readwrite(&mut self, offset: usize, len: usize) {
        self.direct_read(offset, len);
        self.direct_write(offset, len);
    }

    /// Emulate reads of the given byte range.
    pub fn emulate_read(&mut self, offset: usize, len: usize) {
        self.emulate_read[offset..offset + len].fill(0xff);
    }

    /// Emulate writes of the given byte range.
    pub fn emulate_write(&mut self, offset: usize, len: usize) {
        self.emulate_write[offset..offset + len].fill(0xff);
    }

    /// Emulate reads and writes of the given byte range.
    pub fn emulate_readwrite(&mut self, offset: usize, len: usize) {
        self.emulate_read(offset, len);
        self.emulate_write(offset, len);
    }

    /// Emulate reads of single bits within one byte.
    pub fn emulate_read_bits(&mut self, offset: usize, bits: u8) {
        self.emulate_read[offset] |= bits;
    }

    /// Route writes of single bits within one byte directly to the
    /// hardware.
    pub fn direct_write_bits(&mut self, offset: usize, bits: u8) {
        self.emulate_write[offset] &= !bits;
    }

    /// Make the write policy mirror the read policy.
    pub fn copy_read_policy_to_writes(&mut self) {
        self.emulate_write = self.emulate_read;
    }

    /// The cached guest-visible register file.
    #[must_use]
    pub fn bytes(&self) -> &[u8; SIZE] {
        &self.config
    }

    /// Mutable access to the cached register file, for initialization.
    pub fn bytes_mut(&mut self) -> &mut [u8; SIZE] {
        &mut self.config
    }

    /// Mutable access to the write mask, for initialization.
    pub fn wmask_mut(&mut self) -> &mut [u8; SIZE] {
        &mut self.wmask
    }

    /// Mutable access to the write-1-to-clear mask, for initialization.
    pub fn w1cmask_mut(&mut self) -> &mut [u8; SIZE] {
        &mut self.w1cmask
    }

    /// Read a cached byte.
    #[must_use]
    pub fn get_byte(&self, offset: usize) -> u8 {
        self.config[offset]
    }

    /// Read a cached little-endian word.
    #[must_use]
    pub fn get_word(&self, offset: usize) -> u16 {
        u16::from_le_bytes([self.config[offset], self.config[offset + 1]])
    }

    /// Read a cached little-endian doubleword.
    #[must_use]
    pub fn get_long(&self, offset: usize) -> u32 {
        u32::from_le_bytes([
            self.config[offset],
            self.config[offset + 1],
            self.config[offset + 2],
            self.config[offset + 3],
        ])
    }

    /// Overwrite a cached byte, bypassing the write mask.
    pub fn set_byte(&mut self, offset: usize, value: u8) {
        self.config[offset] = value;
    }

    /// Overwrite a cached word, bypassing the write mask.
    pub fn set_word(&mut self, offset: usize, value: u16) {
        self.config[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    }

    /// Overwrite a cached doubleword, bypassing the write mask.
    pub fn set_long(&mut self, offset: usize, value: u32) {
        self.config[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Apply a guest write to the cached register file, honoring the
    /// write and write-1-to-clear masks.
    pub fn apply_masked_write(&mut self, offset: usize, value: u32, len: usize) {
        for i in 0..len {
            let byte = (value >> (8 * i)) as u8;
            let wmask = self.wmask[offset + i];
            let w1cmask = self.w1cmask[offset + i];

            let mut current = self.config[offset + i];
            current = (current & !wmask) | (byte & wmask);
            current &= !(byte & w1cmask);
            self.config[offset + i] = current;
        }
    }

    /// Blend an emulated and a hardware value according to the read
    /// table.
    #[must_use]
    pub fn blend_read(&self, offset: usize, len: usize, real: u32) -> u32 {
        let mask = mask_of(&self.emulate_read, offset, len);
        let virt = mask_of(&self.config, offset, len);
        (virt & mask) | (real & !mask)
    }

    /// Handle a guest read of `len` bytes (1, 2 or 4) at `offset`.
    ///
    /// Hardware is only touched when at least one bit of the access is
    /// routed to it.
    #[must_use]
    pub fn read(&self, host: &ConfigResource, offset: usize, len: usize) -> u32 {
        debug_assert!(matches!(len, 1 | 2 | 4));
        if offset + len > SIZE {
            return full_mask(len);
        }

        let mask = mask_of(&self.emulate_read, offset, len);
        let virt = mask_of(&self.config, offset, len);
        if mask == full_mask(len) {
            return virt;
        }

        let mut real = [0u8; 4];
        host.read(offset as u32, &mut real[..len]);
        let real = u32::from_le_bytes(real);

        (virt & mask) | (real & !mask)
    }

    /// Handle a guest write of `len` bytes (1, 2 or 4) at `offset`.
    ///
    /// Bits routed to the hardware are forwarded, with the hardware's
    /// current value preserved for emulated bits. The cached register
    /// file is updated afterwards.
    pub fn write(&mut self, host: &ConfigResource, offset: usize, value: u32, len: usize) {
        debug_assert!(matches!(len, 1 | 2 | 4));
        if offset + len > SIZE {
            return;
        }

        let mask = mask_of(&self.emulate_write, offset, len);
        if mask != full_mask(len) {
            let mut real = [0u8; 4];
            host.read(offset as u32, &mut real[..len]);
            let real = u32::from_le_bytes(real);

            let merged = (value & !mask) | (real & mask);
            host.write(offset as u32, &merged.to_le_bytes()[..len]);
        }

        self.apply_masked_write(offset, value, len);
    }
}
