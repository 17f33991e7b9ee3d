use thiserror::Error as ThisError;

/// Convenience alias for results produced by the emulator core.
pub type Result<T> = std::result::Result<T, Error>;

/// Enumerates every failure the cartridge loader and the cpu core can report.
#[derive(Debug, ThisError)]
pub enum Error {
    /// The bytes at the entry point do not form the mandatory `NOP; JP` sequence.
    #[error("invalid cartridge header signature: {found:#06x}")]
    InvalidHeaderSignature { found: u16 },
    /// Only the "ROM only, 32 KiB" layout is supported.
    #[error("unsupported cartridge layout: type {kind:#04x}, rom size code {rom_size:#04x}")]
    UnsupportedCartridgeLayout { kind: u8, rom_size: u8 },
    /// The global checksum stored in the header does not match the image contents.
    #[error("cartridge checksum mismatch: expected {expected:#06x}, computed {computed:#06x}")]
    ChecksumMismatch { expected: u16, computed: u16 },
    /// The image is too short to even contain a header.
    #[error("cartridge image too small: {len} bytes")]
    ImageTooSmall { len: usize },
    /// Cartridge data was requested before a cartridge was loaded.
    #[error("no cartridge is loaded")]
    CartridgeNotLoaded,
    /// The bytes for a named ROM could not be retrieved.
    #[error("fetch rom '{name}'")]
    Fetch {
        name: String,
        #[source]
        source: std::io::Error,
    },
    /// A read targeted an address that is not backed by anything.
    #[error("unmapped address: {address:#06x}")]
    UnmappedAddress { address: u16 },
    /// The cpu fetched an op code it has no handler for.
    #[error("unimplemented op code {op_code:#04x} at {address:#06x}")]
    UnimplementedOpcode { op_code: u8, address: u16 },
}
