/// Size of the video memory owned by the [`Gpu`].
pub const VRAM_SIZE: usize = 0x2000;

/// The [`Gpu`] is the handle to the video unit. The cpu accepts one at construction but does not
/// map it into the address space yet, so nothing reads or writes through it.
#[derive(Debug)]
pub struct Gpu {
    /// Video memory of the emulator.
    vram: Box<[u8; VRAM_SIZE]>,
}

impl Gpu {
    /// Creates a new default [`Gpu`].
    pub fn new() -> Self {
        Self::default()
    }
    /// Video memory contents.
    pub fn vram(&self) -> &[u8] {
        self.vram.as_slice()
    }
}

impl Default for Gpu {
    /// Creates a default [`Gpu`] with cleared video memory.
    fn default() -> Self {
        Self {
            vram: Box::new([0; VRAM_SIZE]),
        }
    }
}
