use crate::{
    cart::{Cartridge, Rom},
    error::{Error, Result},
};

use std::path::PathBuf;

/// Directory ROM images are looked up in when none is given.
pub const DEFAULT_ROM_DIR: &str = "./roms";

/// File extension appended to a logical ROM name.
const ROM_EXTENSION: &str = "gb";

/// The [`RomSource`] trait is the boundary to whatever retrieves the raw bytes of a ROM image.
/// The loader only ever sees the bytes.
pub trait RomSource {
    /// Returns the raw bytes of the ROM with the given logical name.
    fn fetch(&self, name: &str) -> std::io::Result<Vec<u8>>;
}

impl<F> RomSource for F
where
    F: Fn(&str) -> std::io::Result<Vec<u8>>,
{
    fn fetch(&self, name: &str) -> std::io::Result<Vec<u8>> {
        self(name)
    }
}

/// [`RomSource`] that resolves a logical name to `<dir>/<name>.gb` on the local file system.
#[derive(Clone, Debug)]
pub struct DirectorySource {
    /// Directory containing the ROM files.
    dir: PathBuf,
}

impl DirectorySource {
    /// Creates a new [`DirectorySource`] rooted at the given directory.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
    /// Path the given logical name resolves to.
    pub fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(name).with_extension(ROM_EXTENSION)
    }
}

impl Default for DirectorySource {
    fn default() -> Self {
        Self::new(DEFAULT_ROM_DIR)
    }
}

impl RomSource for DirectorySource {
    fn fetch(&self, name: &str) -> std::io::Result<Vec<u8>> {
        let path = self.path_for(name);
        tracing::debug!("read rom file: {:?}", path);

        std::fs::read(path)
    }
}

/// The [`CartridgeLoader`] turns a logical ROM name into a validated [`Cartridge`]. It starts out
/// unloaded and answers [`Rom`] queries only once a load has succeeded.
#[derive(Debug)]
pub struct CartridgeLoader<S> {
    /// Where the raw image bytes come from.
    source: S,
    /// Currently loaded cartridge, if any.
    cartridge: Option<Cartridge>,
}

impl<S: RomSource> CartridgeLoader<S> {
    /// Creates a new, unloaded [`CartridgeLoader`].
    pub fn new(source: S) -> Self {
        Self {
            source,
            cartridge: None,
        }
    }
    /// Fetches the named ROM from the [`RomSource`] and validates it. A failed attempt leaves the
    /// loader as it was.
    pub fn load(&mut self, name: &str) -> Result<&Cartridge> {
        tracing::debug!("load cartridge '{}'", name);

        let data = self.source.fetch(name).map_err(|source| Error::Fetch {
            name: String::from(name),
            source,
        })?;

        self.load_bytes(name, data)
    }
    /// Validates an image that has already been retrieved.
    pub fn load_bytes(&mut self, name: &str, data: Vec<u8>) -> Result<&Cartridge> {
        let cartridge = match Cartridge::from_bytes(data) {
            Ok(cartridge) => cartridge.with_name(name),
            Err(e) => {
                tracing::warn!("reject cartridge '{}': {}", name, e);
                return Err(e);
            }
        };

        tracing::info!("loaded cartridge '{}': {}", name, cartridge.header());

        Ok(&*self.cartridge.insert(cartridge))
    }
    /// Returns the loaded cartridge.
    pub fn cartridge(&self) -> Result<&Cartridge> {
        self.cartridge.as_ref().ok_or(Error::CartridgeNotLoaded)
    }
    /// Returns whether a cartridge has been loaded.
    pub fn is_loaded(&self) -> bool {
        self.cartridge.is_some()
    }
    /// Reads the byte at the given address, truncated to 16 bits.
    pub fn read_byte(&self, address: u32) -> Result<u8> {
        self.cartridge().map(|c| c.read_byte(address))
    }
    /// Reads the little-endian word at the given address, truncated to 16 bits.
    pub fn read_word(&self, address: u32) -> Result<u16> {
        self.cartridge().map(|c| c.read_word(address))
    }
}

impl<S: RomSource> Rom for CartridgeLoader<S> {
    fn read_u8(&self, address: u16) -> Result<u8> {
        self.read_byte(address.into())
    }
    fn start_vector(&self) -> Result<u16> {
        self.cartridge().map(Cartridge::start_vector)
    }
    fn title(&self) -> Result<String> {
        self.cartridge().map(|c| String::from(c.title()))
    }
}
