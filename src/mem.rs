use crate::{
    cart::Rom,
    error::{Error, Result},
    gfx::Gpu,
};

use std::{cell::RefCell, rc::Rc};

/// One past the last address mapped to the cartridge ROM.
pub const ROM_END: u16 = 0x8000;

/// First address of working RAM.
pub const WRAM_START: u16 = 0xC000;

/// Number of bytes of working RAM.
pub const WRAM_SIZE: usize = 0x2000;

/// One past the last address of working RAM.
pub const WRAM_END: u16 = WRAM_START + WRAM_SIZE as u16;

/// Base address of the high I/O page addressed by the `LDH` instructions.
pub const HIGH_PAGE: u16 = 0xFF00;

/// Builds the full address of an offset into the high page.
pub fn high_page(offset: u8) -> u16 {
    HIGH_PAGE | offset as u16
}

/// Enumerates what a 16-bit address resolves to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Region {
    /// Read-only cartridge ROM, addressed directly.
    Rom(u16),
    /// Working RAM, carrying the offset from [`WRAM_START`].
    WorkRam(u16),
    /// High I/O page, carrying the offset from [`HIGH_PAGE`]. Not backed by anything yet.
    HighPage(u8),
    /// Nothing lives here.
    Unmapped,
}

impl Region {
    /// Resolves the given address into the [`Region`] that backs it.
    pub fn of(address: u16) -> Self {
        match address {
            0x0000..ROM_END => Region::Rom(address),
            WRAM_START..WRAM_END => Region::WorkRam(address - WRAM_START),
            HIGH_PAGE..=0xFFFF => Region::HighPage((address - HIGH_PAGE) as u8),
            _ => Region::Unmapped,
        }
    }
}

/// The [`Mapper`] trait is implemented by anything that can be read from and written to through
/// a 16-bit address.
pub trait Mapper {
    /// Reads a single byte from the given address.
    fn read_u8(&self, address: u16) -> Result<u8>;
    /// Writes a single byte to the given address.
    fn write_u8(&mut self, address: u16, byte: u8);
}

/// [`WorkRam`] is the writable memory of the system. Addresses given to it are offsets from
/// [`WRAM_START`].
#[derive(Debug)]
pub struct WorkRam {
    /// Raw bytes of data contained in memory.
    data: Box<[u8; WRAM_SIZE]>,
}

impl WorkRam {
    /// Creates a new default [`WorkRam`].
    pub fn new() -> Self {
        Self::default()
    }
    /// Reads the byte at the given offset.
    pub fn read_u8(&self, offset: u16) -> u8 {
        self.data[offset as usize % WRAM_SIZE]
    }
    /// Writes the byte at the given offset.
    pub fn write_u8(&mut self, offset: u16, byte: u8) {
        self.data[offset as usize % WRAM_SIZE] = byte;
    }
}

impl Default for WorkRam {
    /// Creates a default [`WorkRam`] which has all data set to zero.
    fn default() -> Self {
        Self {
            data: Box::new([0; WRAM_SIZE]),
        }
    }
}

/// The [`Mmu`] routes reads and writes to the component that backs each address. Writes to ROM or
/// unbacked addresses are dropped; reads from unbacked addresses fail.
pub struct Mmu {
    /// Cartridge the ROM region reads from.
    rom: Rc<dyn Rom>,
    /// Working RAM.
    wram: WorkRam,
    /// Video unit handle, reserved for memory-mapped video registers.
    gpu: Rc<RefCell<Gpu>>,
}

impl Mmu {
    /// Creates a new [`Mmu`] over the given cartridge with cleared working RAM.
    pub fn new(rom: Rc<dyn Rom>, gpu: Rc<RefCell<Gpu>>) -> Self {
        Self {
            rom,
            wram: WorkRam::new(),
            gpu,
        }
    }
    /// Cartridge backing the ROM region.
    pub fn rom(&self) -> &Rc<dyn Rom> {
        &self.rom
    }
    /// Video unit handle.
    pub fn gpu(&self) -> &Rc<RefCell<Gpu>> {
        &self.gpu
    }
    /// Reads the little-endian word at the given address through two byte reads.
    pub fn read_u16(&self, address: u16) -> Result<u16> {
        let low = self.read_u8(address)?;
        let high = self.read_u8(address.wrapping_add(1))?;

        Ok(u16::from_le_bytes([low, high]))
    }
}

impl Mapper for Mmu {
    fn read_u8(&self, address: u16) -> Result<u8> {
        match Region::of(address) {
            Region::Rom(address) => self.rom.read_u8(address),
            Region::WorkRam(offset) => Ok(self.wram.read_u8(offset)),
            Region::HighPage(_) | Region::Unmapped => Err(Error::UnmappedAddress { address }),
        }
    }
    fn write_u8(&mut self, address: u16, byte: u8) {
        match Region::of(address) {
            Region::WorkRam(offset) => self.wram.write_u8(offset, byte),
            Region::Rom(_) => {
                tracing::debug!("ignore write to ROM: {:#06x} = {:#04x}", address, byte)
            }
            Region::HighPage(_) | Region::Unmapped => {
                tracing::debug!("ignore write to unmapped address: {:#06x} = {:#04x}", address, byte)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cart::{Cartridge, test_image};

    fn mmu() -> Mmu {
        let cartridge = Cartridge::from_bytes(test_image(&[0xAB, 0xCD])).expect("valid image");

        Mmu::new(Rc::new(cartridge), Rc::new(RefCell::new(Gpu::new())))
    }

    #[test]
    fn test_region_of() {
        assert_eq!(Region::Rom(0x0000), Region::of(0x0000));
        assert_eq!(Region::Rom(0x7FFF), Region::of(0x7FFF));
        assert_eq!(Region::Unmapped, Region::of(0x8000));
        assert_eq!(Region::Unmapped, Region::of(0xBFFF));
        assert_eq!(Region::WorkRam(0x0000), Region::of(0xC000));
        assert_eq!(Region::WorkRam(0x1FFF), Region::of(0xDFFF));
        assert_eq!(Region::Unmapped, Region::of(0xE000));
        assert_eq!(Region::Unmapped, Region::of(0xFEFF));
        assert_eq!(Region::HighPage(0x00), Region::of(0xFF00));
        assert_eq!(Region::HighPage(0x44), Region::of(high_page(0x44)));
        assert_eq!(Region::HighPage(0xFF), Region::of(0xFFFF));
    }

    #[test]
    fn test_work_ram_default() {
        let wram = WorkRam::default();
        assert_eq!(WRAM_SIZE, wram.data.len());

        let non_zero = wram.data.iter().any(|b| *b != 0);
        assert!(!non_zero);
    }

    #[test]
    fn test_mmu_read_rom() {
        let mmu = mmu();

        assert_eq!(0xAB, mmu.read_u8(0x0150).expect("mapped"));
        assert_eq!(0xCDAB, mmu.read_u16(0x0150).expect("mapped"));
    }

    #[test]
    fn test_mmu_write_rom_ignored() {
        let mut mmu = mmu();
        mmu.write_u8(0x0150, 0x00);

        assert_eq!(0xAB, mmu.read_u8(0x0150).expect("mapped"));
    }

    #[test]
    fn test_mmu_work_ram() {
        let mut mmu = mmu();
        mmu.write_u8(0xC000, 200);
        mmu.write_u8(0xDFFF, 201);

        assert_eq!(200, mmu.read_u8(0xC000).expect("mapped"));
        assert_eq!(201, mmu.read_u8(0xDFFF).expect("mapped"));
    }

    #[test]
    fn test_mmu_unmapped() {
        let mut mmu = mmu();

        for address in [0x8000, 0xA000, 0xE000, 0xFF00, 0xFF44, 0xFFFF] {
            mmu.write_u8(address, 0x12);

            let err = mmu.read_u8(address).expect_err("unmapped");
            assert!(matches!(err, Error::UnmappedAddress { address: a } if a == address));
        }
    }

    #[test]
    fn test_mmu_read_u16_wraps() {
        let mmu = mmu();

        let err = mmu.read_u16(0xFFFF).expect_err("high page unmapped");
        assert!(matches!(err, Error::UnmappedAddress { address: 0xFFFF }));
    }
}
