use crate::error::{Error, Result};

use std::fmt::Display;

/// Address of the header signature word. A valid entry point starts with `NOP; JP nn` which
/// reads back as this little-endian word.
const SIGNATURE_ADDR: usize = 0x0100;

/// Expected value of the little-endian word at [`SIGNATURE_ADDR`].
const SIGNATURE: u16 = 0xC300;

/// Address of the little-endian jump target of the entry point instruction.
const START_VECTOR_ADDR: usize = 0x0102;

/// Address of the first byte of the title.
const TITLE_START_ADDR: usize = 0x0134;

/// Address of the last byte of the title.
const TITLE_END_ADDR: usize = 0x0143;

/// Address of the cartridge type byte.
const TYPE_ADDR: usize = 0x0147;

/// Address of the ROM size byte.
const ROM_SIZE_ADDR: usize = 0x0148;

/// Address of the high byte of the expected global checksum value.
const GLOBAL_CHECKSUM_HIGH_ADDR: usize = 0x014E;

/// Address of the low byte of the expected global checksum value.
const GLOBAL_CHECKSUM_LOW_ADDR: usize = 0x014F;

/// Minimum number of bytes an image needs before the header can be read.
const HEADER_END: usize = 0x0150;

/// Value returned for addresses that fall past the end of the image.
const OPEN_BUS: u8 = 0xFF;

/// Name given to a [`Cartridge`] built straight from bytes.
const UNKNOWN_NAME: &str = "Unknown";

/// The narrow read interface the cpu uses to reach cartridge data. Everything the cpu knows about
/// a cartridge comes through these methods.
pub trait Rom {
    /// Reads the byte at the given address.
    fn read_u8(&self, address: u16) -> Result<u8>;
    /// Reads a little-endian word starting at the given address. The address of the second byte
    /// wraps independently of the first.
    fn read_u16(&self, address: u16) -> Result<u16> {
        let low = self.read_u8(address)?;
        let high = self.read_u8(address.wrapping_add(1))?;

        Ok(u16::from_le_bytes([low, high]))
    }
    /// Returns the address execution starts at once the cpu is reset.
    fn start_vector(&self) -> Result<u16>;
    /// Returns the title of the game stored in the header.
    fn title(&self) -> Result<String>;
}

/// Holds the data that makes up the header of the [`Cartridge`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Header {
    /// Little-endian word at the entry point. Must equal `0xC300` (`NOP; JP`).
    pub signature: u16,
    /// Target of the jump at the entry point.
    pub start_vector: u16,
    /// Title of the game in uppercase ASCII.
    pub title: String,
    /// Cartridge type code. Only `0x00` (ROM only) is supported.
    pub kind: u8,
    /// ROM size code. Only `0x00` (32 KiB, no banking) is supported.
    pub rom_size: u8,
    /// Contains a 16-bit (big-endian) checksum simply computed as the sum of all the bytes of the
    /// cartridge ROM except the two checksum bytes.
    pub expected_checksum: u16,
    /// Contains the computed global checksum.
    pub computed_checksum: u16,
}

impl Header {
    /// Parses the relevant bytes of a cartridge image into a [`Header`]. No validation beyond
    /// making sure the header is present is performed.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_END {
            return Err(Error::ImageTooSmall { len: data.len() });
        }

        let signature = u16::from_le_bytes([data[SIGNATURE_ADDR], data[SIGNATURE_ADDR + 1]]);
        let start_vector =
            u16::from_le_bytes([data[START_VECTOR_ADDR], data[START_VECTOR_ADDR + 1]]);

        let title = data[TITLE_START_ADDR..=TITLE_END_ADDR]
            .iter()
            .take_while(|b| **b != 0)
            .map(|b| char::from(*b))
            .collect();

        let mut computed_checksum: u16 = 0;
        for (address, value) in data.iter().enumerate() {
            if address == GLOBAL_CHECKSUM_LOW_ADDR || address == GLOBAL_CHECKSUM_HIGH_ADDR {
                continue;
            }

            computed_checksum = computed_checksum.wrapping_add(*value as u16);
        }

        let expected_checksum = u16::from_be_bytes([
            data[GLOBAL_CHECKSUM_HIGH_ADDR],
            data[GLOBAL_CHECKSUM_LOW_ADDR],
        ]);

        Ok(Self {
            signature,
            start_vector,
            title,
            kind: data[TYPE_ADDR],
            rom_size: data[ROM_SIZE_ADDR],
            expected_checksum,
            computed_checksum,
        })
    }
    /// Runs the header checks in order: signature, layout, then checksum. The first failing check
    /// is reported.
    pub fn validate(&self) -> Result<()> {
        if self.signature != SIGNATURE {
            return Err(Error::InvalidHeaderSignature {
                found: self.signature,
            });
        }

        if self.kind != 0 || self.rom_size != 0 {
            return Err(Error::UnsupportedCartridgeLayout {
                kind: self.kind,
                rom_size: self.rom_size,
            });
        }

        if self.expected_checksum != self.computed_checksum {
            return Err(Error::ChecksumMismatch {
                expected: self.expected_checksum,
                computed: self.computed_checksum,
            });
        }

        Ok(())
    }
}

impl Display for Header {
    /// Writes a one line summary of the [`Header`] to the formatter.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!(
            "'{}' start={:#06x} type={:#04x} rom_size={:#04x} checksum={:#06x}",
            self.title, self.start_vector, self.kind, self.rom_size, self.expected_checksum
        ))
    }
}

/// The [`Cartridge`] struct represents a validated game image. It is immutable once created.
#[derive(Debug)]
pub struct Cartridge {
    /// Name the cartridge was loaded under.
    name: String,
    /// Header data of the game cartridge.
    header: Header,
    /// Raw bytes of the image.
    data: Vec<u8>,
}

impl Cartridge {
    /// Validates the given image and creates a [`Cartridge`] from it. No cartridge is returned if
    /// any of the header checks fail.
    pub fn from_bytes(data: Vec<u8>) -> Result<Self> {
        let header = Header::parse(&data)?;
        header.validate()?;

        Ok(Self {
            name: String::from(UNKNOWN_NAME),
            header,
            data,
        })
    }
    /// Replaces the name of the [`Cartridge`].
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
    /// Name the cartridge was loaded under.
    pub fn name(&self) -> &str {
        &self.name
    }
    /// Parsed header of the cartridge.
    pub fn header(&self) -> &Header {
        &self.header
    }
    /// Title of the game.
    pub fn title(&self) -> &str {
        &self.header.title
    }
    /// Address execution begins at.
    pub fn start_vector(&self) -> u16 {
        self.header.start_vector
    }
    /// Reads the byte at the given address. The address is truncated to 16 bits the same way the
    /// address bus would truncate it.
    pub fn read_byte(&self, address: u32) -> u8 {
        let address = (address & 0xFFFF) as usize;

        self.data.get(address).copied().unwrap_or(OPEN_BUS)
    }
    /// Reads the little-endian word at the given address. Both byte addresses are truncated.
    pub fn read_word(&self, address: u32) -> u16 {
        let low = self.read_byte(address);
        let high = self.read_byte(address.wrapping_add(1));

        u16::from_le_bytes([low, high])
    }
}

impl Rom for Cartridge {
    fn read_u8(&self, address: u16) -> Result<u8> {
        Ok(self.read_byte(address.into()))
    }
    fn start_vector(&self) -> Result<u16> {
        Ok(self.header.start_vector)
    }
    fn title(&self) -> Result<String> {
        Ok(self.header.title.clone())
    }
}

/// Builds a valid 32 KiB image with `program` placed at `0x0150`, the address the entry point
/// jumps to.
#[cfg(test)]
pub(crate) fn test_image(program: &[u8]) -> Vec<u8> {
    let mut data = vec![0; 0x8000];

    data[SIGNATURE_ADDR..SIGNATURE_ADDR + 4].copy_from_slice(&[0x00, 0xC3, 0x50, 0x01]);
    data[TITLE_START_ADDR..TITLE_START_ADDR + 7].copy_from_slice(b"TESTROM");
    data[HEADER_END..HEADER_END + program.len()].copy_from_slice(program);

    fix_checksum(&mut data);

    data
}

/// Recomputes and stores the global checksum of the image.
#[cfg(test)]
pub(crate) fn fix_checksum(data: &mut [u8]) {
    let checksum = Header::parse(data)
        .expect("image has a header")
        .computed_checksum
        .to_be_bytes();

    data[GLOBAL_CHECKSUM_HIGH_ADDR] = checksum[0];
    data[GLOBAL_CHECKSUM_LOW_ADDR] = checksum[1];
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cartridge_from_bytes() {
        let cartridge = Cartridge::from_bytes(test_image(&[0x00])).expect("valid image");

        assert_eq!("TESTROM", cartridge.title());
        assert_eq!(0x0150, cartridge.start_vector());
        assert_eq!(UNKNOWN_NAME, cartridge.name());
        assert_eq!(0, cartridge.header().kind);
        assert_eq!(0, cartridge.header().rom_size);
        assert_eq!(
            cartridge.header().expected_checksum,
            cartridge.header().computed_checksum
        );
    }

    #[test]
    fn test_cartridge_invalid_signature() {
        let mut data = test_image(&[]);
        data[SIGNATURE_ADDR] = 0xC3;
        data[SIGNATURE_ADDR + 1] = 0x00;
        fix_checksum(&mut data);

        let err = Cartridge::from_bytes(data).expect_err("invalid signature");
        assert!(matches!(
            err,
            Error::InvalidHeaderSignature { found: 0x00C3 }
        ));
    }

    #[test]
    fn test_cartridge_signature_checked_before_checksum() {
        let mut data = test_image(&[]);
        data[SIGNATURE_ADDR + 1] = 0xC2;

        let err = Cartridge::from_bytes(data).expect_err("invalid signature");
        assert!(matches!(err, Error::InvalidHeaderSignature { .. }));
    }

    #[test]
    fn test_cartridge_unsupported_layout() {
        {
            let mut data = test_image(&[]);
            data[TYPE_ADDR] = 0x01;
            fix_checksum(&mut data);

            let err = Cartridge::from_bytes(data).expect_err("mbc1 unsupported");
            assert!(matches!(
                err,
                Error::UnsupportedCartridgeLayout {
                    kind: 0x01,
                    rom_size: 0x00
                }
            ));
        }
        {
            let mut data = test_image(&[]);
            data[ROM_SIZE_ADDR] = 0x01;

            let err = Cartridge::from_bytes(data).expect_err("64 KiB unsupported");
            assert!(matches!(
                err,
                Error::UnsupportedCartridgeLayout {
                    kind: 0x00,
                    rom_size: 0x01
                }
            ));
        }
    }

    #[test]
    fn test_cartridge_checksum_mismatch_on_any_flipped_byte() {
        let original = test_image(&[0x3E, 0x05, 0xAF]);

        for address in [0x0000, 0x0104, 0x0134, 0x014D, 0x0150, 0x0151, 0x4000, 0x7FFF] {
            let mut data = original.clone();
            data[address] ^= 0x01;

            let err = Cartridge::from_bytes(data).expect_err("checksum mismatch");
            assert!(
                matches!(err, Error::ChecksumMismatch { .. }),
                "address {:#06x} gave {}",
                address,
                err
            );
        }
    }

    #[test]
    fn test_cartridge_image_too_small() {
        let err = Cartridge::from_bytes(vec![0; 0x14F]).expect_err("too small");
        assert!(matches!(err, Error::ImageTooSmall { len: 0x14F }));
    }

    #[test]
    fn test_cartridge_title_terminates() {
        {
            let mut data = test_image(&[]);
            data[TITLE_START_ADDR + 3] = 0;
            fix_checksum(&mut data);

            let cartridge = Cartridge::from_bytes(data).expect("valid image");
            assert_eq!("TES", cartridge.title());
        }
        {
            let mut data = test_image(&[]);
            data[TITLE_START_ADDR..=TITLE_END_ADDR].copy_from_slice(b"ABCDEFGHIJKLMNOP");
            data[TITLE_END_ADDR + 1] = b'Q';
            fix_checksum(&mut data);

            let cartridge = Cartridge::from_bytes(data).expect("valid image");
            assert_eq!("ABCDEFGHIJKLMNOP", cartridge.title());
        }
    }

    #[test]
    fn test_cartridge_read_wraps() {
        let mut data = test_image(&[]);
        data[0x0000] = 0x12;
        data[0x0001] = 0x34;
        fix_checksum(&mut data);

        let cartridge = Cartridge::from_bytes(data).expect("valid image");

        assert_eq!(cartridge.read_byte(0x0000), cartridge.read_byte(0x10000));
        assert_eq!(0x12, cartridge.read_byte(0x10000));
        assert_eq!(0x3412, cartridge.read_word(0x10000));
        assert_eq!(0x0150, cartridge.read_word(0x0102));
    }

    #[test]
    fn test_cartridge_read_past_image() {
        let mut data = test_image(&[]);
        data[0x0000] = 0x12;
        fix_checksum(&mut data);

        let cartridge = Cartridge::from_bytes(data).expect("valid image");

        assert_eq!(OPEN_BUS, cartridge.read_byte(0x8000));
        // 0xFFFF is past the image, the high byte wraps back to 0x0000.
        assert_eq!(0x12FF, cartridge.read_word(0xFFFF));
    }

    #[test]
    fn test_rom_trait() {
        let cartridge = Cartridge::from_bytes(test_image(&[0xCD, 0x34, 0x12])).expect("valid");
        let rom: &dyn Rom = &cartridge;

        assert_eq!(0xCD, rom.read_u8(0x0150).expect("read"));
        assert_eq!(0x1234, rom.read_u16(0x0151).expect("read"));
        assert_eq!(0x0150, rom.start_vector().expect("start vector"));
        assert_eq!("TESTROM", rom.title().expect("title"));
    }
}
