pub mod cart;
pub mod cpu;
pub mod error;
pub mod gfx;
pub mod loader;
pub mod mem;

pub use crate::error::{Error, Result};

use crate::{cart::Rom, cpu::Cpu, gfx::Gpu};

use std::{cell::RefCell, rc::Rc};

/// The [`Emulator`] struct is the container that is responsible for wiring the subsystems
/// together and driving the [`Cpu`] over a loaded cartridge.
pub struct Emulator {
    /// [`Cpu`] that is responsible for reading, decoding and executing instructions.
    cpu: Cpu,
    /// Number of machine cycles elapsed since [`Emulator::begin`].
    ticks: u64,
}

impl Emulator {
    /// Creates a new [`Emulator`] which runs the program held by the given [`Rom`].
    pub fn load(rom: Rc<dyn Rom>) -> Self {
        let gpu = Rc::new(RefCell::new(Gpu::new()));

        Self {
            cpu: Cpu::new(rom, gpu),
            ticks: 0,
        }
    }
    /// Resets the cpu and points it at the start vector of the cartridge.
    pub fn begin(&mut self) -> Result<()> {
        self.ticks = 0;
        self.cpu.begin()
    }
    /// Advances emulation by one machine cycle.
    pub fn tick(&mut self) -> Result<()> {
        self.cpu.tick()?;
        self.ticks += 1;

        Ok(())
    }
    /// Runs the emulator until `max_ticks` machine cycles have elapsed, or forever when no limit
    /// is given. Must be called after [`Emulator::begin`]. Returns the number of elapsed cycles.
    pub fn run(&mut self, max_ticks: Option<u64>) -> Result<u64> {
        while max_ticks.is_none_or(|max| self.ticks < max) {
            self.tick()?;
        }

        Ok(self.ticks)
    }
    /// Number of machine cycles elapsed since [`Emulator::begin`].
    pub fn ticks(&self) -> u64 {
        self.ticks
    }
    /// The [`Cpu`] driven by the emulator.
    pub fn cpu(&self) -> &Cpu {
        &self.cpu
    }
    /// Mutable access to the [`Cpu`], e.g. to install a trace hook.
    pub fn cpu_mut(&mut self) -> &mut Cpu {
        &mut self.cpu
    }
}
