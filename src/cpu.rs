use crate::{
    cart::Rom,
    error::{Error, Result},
    gfx::Gpu,
    mem::{Mapper, Mmu, high_page},
};

use bounded_vec_deque::BoundedVecDeque;
use std::{cell::RefCell, fmt::Display, rc::Rc};

/// Value the stack pointer is reset to. It is one past the end of working RAM so the first push
/// lands on the last byte of it.
pub const STACK_TOP: u16 = 0xE000;

/// Combines a high and a low byte into one 16-bit value.
pub fn pair(high: u8, low: u8) -> u16 {
    (high as u16) << 8 | low as u16
}

/// Splits a 16-bit value into its high and low bytes.
pub fn split(value: u16) -> (u8, u8) {
    ((value >> 8) as u8, value as u8)
}

/// Represents the registers on the cpu. Allows for easy manipulation of combined 16-bit registers
/// as well.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Registers {
    /// A register.
    a: u8,
    /// B register.
    b: u8,
    /// C register.
    c: u8,
    /// D register.
    d: u8,
    /// E register.
    e: u8,
    /// Special flags register.
    f: Flags,
    /// H register.
    h: u8,
    /// L register.
    l: u8,
    /// Program counter.
    pc: u16,
    /// Stack pointer.
    sp: u16,
}

impl Registers {
    /// Returns the value of the a register.
    pub fn a(&self) -> u8 {
        self.a
    }
    /// Returns the value of the b register.
    pub fn b(&self) -> u8 {
        self.b
    }
    /// Returns the value of the c register.
    pub fn c(&self) -> u8 {
        self.c
    }
    /// Returns the value of the d register.
    pub fn d(&self) -> u8 {
        self.d
    }
    /// Returns the value of the e register.
    pub fn e(&self) -> u8 {
        self.e
    }
    /// Returns the flags register.
    pub fn f(&self) -> Flags {
        self.f
    }
    /// Returns the value of the h register.
    pub fn h(&self) -> u8 {
        self.h
    }
    /// Returns the value of the l register.
    pub fn l(&self) -> u8 {
        self.l
    }
    /// Returns the program counter.
    pub fn pc(&self) -> u16 {
        self.pc
    }
    /// Returns the stack pointer.
    pub fn sp(&self) -> u16 {
        self.sp
    }
    /// Returns the combined value of the a and f registers.
    pub fn af(&self) -> u16 {
        pair(self.a, self.f.into())
    }
    /// Returns the combined value of the b and c registers.
    pub fn bc(&self) -> u16 {
        pair(self.b, self.c)
    }
    /// Sets the values of the b and c registers by treating them as one 16 byte value.
    fn set_bc(&mut self, value: u16) {
        (self.b, self.c) = split(value);
    }
    /// Returns the combined value of the d and e registers.
    pub fn de(&self) -> u16 {
        pair(self.d, self.e)
    }
    /// Sets the values of the d and e registers by treating them as one 16 byte value.
    fn set_de(&mut self, value: u16) {
        (self.d, self.e) = split(value);
    }
    /// Returns the combined value of the h and l registers.
    pub fn hl(&self) -> u16 {
        pair(self.h, self.l)
    }
    /// Sets the values of the h and l registers by treating them as one 16 byte value.
    fn set_hl(&mut self, value: u16) {
        (self.h, self.l) = split(value);
    }
    /// Reads the [`Target16Bit`] register.
    fn read_u16(&self, target: Target16Bit) -> u16 {
        match target {
            Target16Bit::BC => self.bc(),
            Target16Bit::DE => self.de(),
            Target16Bit::HL => self.hl(),
            Target16Bit::SP => self.sp,
        }
    }
    /// Writes the [`Target16Bit`] register.
    fn write_u16(&mut self, target: Target16Bit, value: u16) {
        match target {
            Target16Bit::BC => self.set_bc(value),
            Target16Bit::DE => self.set_de(value),
            Target16Bit::HL => self.set_hl(value),
            Target16Bit::SP => self.sp = value,
        }
    }
}

/// Bit position of the carry flag in the [`u8`] representation of [`Flags`].
const FLAGS_CARRY_BIT_POSITION: u8 = 4;

/// Bit position of the half carry flag in the [`u8`] representation of [`Flags`].
const FLAGS_HALF_CARRY_BIT_POSITION: u8 = 5;

/// Bit position of the subtract flag in the [`u8`] representation of [`Flags`].
const FLAGS_SUBTRACT_BIT_POSITION: u8 = 6;

/// Bit position of the zero flag in the [`u8`] representation of [`Flags`].
const FLAGS_ZERO_BIT_POSITION: u8 = 7;

/// Enumerates the flags held in the `F` register.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Flag {
    /// Set when a result is zero.
    Zero,
    /// Set when the last arithmetic operation was a subtraction.
    Subtract,
    /// Set on a carry out of bit 3.
    HalfCarry,
    /// Set on a carry out of bit 7.
    Carry,
}

impl Flag {
    /// Returns the bit mask of the flag within the `F` register.
    fn mask(self) -> u8 {
        let pos = match self {
            Flag::Zero => FLAGS_ZERO_BIT_POSITION,
            Flag::Subtract => FLAGS_SUBTRACT_BIT_POSITION,
            Flag::HalfCarry => FLAGS_HALF_CARRY_BIT_POSITION,
            Flag::Carry => FLAGS_CARRY_BIT_POSITION,
        };

        1 << pos
    }
}

/// Eases the special handling required for the `F` register which uses the top 4 bits for the
/// following flags.
///
/// 76543210 <- Bit position
/// --------
/// 00000000
/// ||||
/// |||-- Carry
/// ||--- Half Carry
/// |---- Subtract
/// ----- Zero
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Flags(u8);

impl Flags {
    /// Creates a new default [`Flags`].
    pub fn new() -> Self {
        Self::default()
    }
    /// Retrieves the current status of the given flag.
    pub fn get(&self, flag: Flag) -> bool {
        self.0 & flag.mask() != 0
    }
    /// Sets the status of the given flag. Every flag update goes through here.
    fn set(&mut self, flag: Flag, on: bool) {
        if on {
            self.0 |= flag.mask();
        } else {
            self.0 &= !flag.mask();
        }
    }
    /// Retrieves the current status of the carry flag.
    pub fn c(&self) -> bool {
        self.get(Flag::Carry)
    }
    /// Sets the status of the carry flag.
    fn set_c(&mut self, on: bool) {
        self.set(Flag::Carry, on);
    }
    /// Retrieves the current status of the half carry flag.
    pub fn h(&self) -> bool {
        self.get(Flag::HalfCarry)
    }
    /// Sets the status of the half carry flag.
    fn set_h(&mut self, on: bool) {
        self.set(Flag::HalfCarry, on);
    }
    /// Retrieves the current status of the subtract flag.
    pub fn n(&self) -> bool {
        self.get(Flag::Subtract)
    }
    /// Sets the status of the substract flag.
    fn set_n(&mut self, on: bool) {
        self.set(Flag::Subtract, on);
    }
    /// Retrieves the current status of the zero flag.
    pub fn z(&self) -> bool {
        self.get(Flag::Zero)
    }
    /// Sets the status of the zero flag.
    fn set_z(&mut self, on: bool) {
        self.set(Flag::Zero, on);
    }
}

impl From<u8> for Flags {
    /// Converts the given [`u8`] into a [`Flags`].
    fn from(value: u8) -> Self {
        Self(value)
    }
}

impl From<Flags> for u8 {
    /// Converts the given [`Flags`] into a [`u8`].
    fn from(value: Flags) -> Self {
        value.0
    }
}

/// Enumeration of the flag conditions available to the conditional jump and return instructions.
#[allow(clippy::upper_case_acronyms)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Condition {
    /// Zero flag not on.
    NZ,
    /// Zero flag on.
    Z,
    /// Carry flag not on.
    NC,
    /// Carry flag on.
    C,
}

impl Condition {
    /// Determines whether the condition holds for the given [`Flags`].
    fn holds(self, flags: Flags) -> bool {
        match self {
            Condition::NZ => !flags.z(),
            Condition::Z => flags.z(),
            Condition::NC => !flags.c(),
            Condition::C => flags.c(),
        }
    }
}

impl Display for Condition {
    /// Writes a string representation of the [`Condition`] to the formatter.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("{:?}", self))
    }
}

/// Enumeration of the 8-bit operands addressable by the three bit register field of an op code.
/// The discriminants match that encoding.
#[allow(clippy::upper_case_acronyms)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Target8Bit {
    /// B register.
    B,
    /// C register.
    C,
    /// D register.
    D,
    /// E register.
    E,
    /// H register.
    H,
    /// L register.
    L,
    /// Byte in memory at the address held in the `HL` register.
    HLMem,
    /// A register.
    A,
}

impl Target8Bit {
    /// Decodes the three bit register field of an op code.
    const fn from_bits(bits: u8) -> Self {
        match bits & 0x07 {
            0 => Target8Bit::B,
            1 => Target8Bit::C,
            2 => Target8Bit::D,
            3 => Target8Bit::E,
            4 => Target8Bit::H,
            5 => Target8Bit::L,
            6 => Target8Bit::HLMem,
            _ => Target8Bit::A,
        }
    }
}

impl Display for Target8Bit {
    /// Writes a string representation of the [`Target8Bit`] to the formatter.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Target8Bit::HLMem => f.write_str("[HL]"),
            _ => f.write_fmt(format_args!("{:?}", self)),
        }
    }
}

/// Enumeration of the valid target 16-bit registers for the cpu instructions.
#[allow(clippy::upper_case_acronyms)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Target16Bit {
    /// Combined BC 16-bit register.
    BC,
    /// Combined DE 16-bit register.
    DE,
    /// Combined HL 16-bit register.
    HL,
    /// Stack pointer.
    SP,
}

impl Target16Bit {
    /// Decodes the two bit register pair field of an op code.
    const fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => Target16Bit::BC,
            1 => Target16Bit::DE,
            2 => Target16Bit::HL,
            _ => Target16Bit::SP,
        }
    }
}

impl Display for Target16Bit {
    /// Writes a string representation of the [`Target16Bit`] to the formatter.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("{:?}", self))
    }
}

/// Source operand of the accumulator operations.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Operand {
    /// Value of a register or of the byte at `[HL]`.
    Target(Target8Bit),
    /// Immediate byte following the op code.
    U8(u8),
}

impl Display for Operand {
    /// Writes a string representation of the [`Operand`] to the formatter.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operand::Target(target) => target.fmt(f),
            Operand::U8(value) => f.write_fmt(format_args!("{:#04x}", value)),
        }
    }
}

/// Entry of the dispatch table. Describes what an op code does before its operands are fetched.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Opcode {
    Nop,
    Jp,
    Jr,
    JrCond(Condition),
    LdU8(Target8Bit),
    LdU16(Target16Bit),
    LdReg { store: Target8Bit, source: Target8Bit },
    LdMemA(Target16Bit),
    LdAMem(Target16Bit),
    LdHlDecA,
    LdhStore,
    LdhLoad,
    Dec(Target8Bit),
    DecU16(Target16Bit),
    Xor(Target8Bit),
    XorU8,
    And(Target8Bit),
    AndU8,
    Cp(Target8Bit),
    CpU8,
    Call,
    Ret,
    RetCond(Condition),
    Di,
    Ei,
}

/// Dispatch table indexed by op code. `None` marks an op code without a handler.
const OPCODES: [Option<Opcode>; 256] = build_opcodes();

/// Builds the dispatch table. Families of op codes that share an encoding are filled in from
/// their register fields.
const fn build_opcodes() -> [Option<Opcode>; 256] {
    let mut table: [Option<Opcode>; 256] = [None; 256];

    table[0x00] = Some(Opcode::Nop);
    table[0xC3] = Some(Opcode::Jp);
    table[0x18] = Some(Opcode::Jr);
    table[0x20] = Some(Opcode::JrCond(Condition::NZ));
    table[0x28] = Some(Opcode::JrCond(Condition::Z));
    table[0x30] = Some(Opcode::JrCond(Condition::NC));
    table[0x38] = Some(Opcode::JrCond(Condition::C));
    table[0x02] = Some(Opcode::LdMemA(Target16Bit::BC));
    table[0x12] = Some(Opcode::LdMemA(Target16Bit::DE));
    table[0x0A] = Some(Opcode::LdAMem(Target16Bit::BC));
    table[0x1A] = Some(Opcode::LdAMem(Target16Bit::DE));
    table[0x32] = Some(Opcode::LdHlDecA);
    table[0xE0] = Some(Opcode::LdhStore);
    table[0xF0] = Some(Opcode::LdhLoad);
    table[0xEE] = Some(Opcode::XorU8);
    table[0xE6] = Some(Opcode::AndU8);
    table[0xFE] = Some(Opcode::CpU8);
    table[0xCD] = Some(Opcode::Call);
    table[0xC9] = Some(Opcode::Ret);
    table[0xC0] = Some(Opcode::RetCond(Condition::NZ));
    table[0xC8] = Some(Opcode::RetCond(Condition::Z));
    table[0xD0] = Some(Opcode::RetCond(Condition::NC));
    table[0xD8] = Some(Opcode::RetCond(Condition::C));
    table[0xF3] = Some(Opcode::Di);
    table[0xFB] = Some(Opcode::Ei);

    // 00rr0001 LD rr, nn / 00rr1011 DEC rr
    let mut rr: usize = 0;
    while rr < 4 {
        let target = Target16Bit::from_bits(rr as u8);
        table[0x01 | (rr << 4)] = Some(Opcode::LdU16(target));
        table[0x0B | (rr << 4)] = Some(Opcode::DecU16(target));
        rr += 1;
    }

    // 00rrr110 LD r, n / 00rrr101 DEC r / 01ddd sss LD d, s / 10xxx sss ALU A, s
    let mut r: usize = 0;
    while r < 8 {
        let target = Target8Bit::from_bits(r as u8);
        table[0x06 | (r << 3)] = Some(Opcode::LdU8(target));
        table[0x05 | (r << 3)] = Some(Opcode::Dec(target));
        table[0xA0 | r] = Some(Opcode::And(target));
        table[0xA8 | r] = Some(Opcode::Xor(target));
        table[0xB8 | r] = Some(Opcode::Cp(target));

        let mut s: usize = 0;
        while s < 8 {
            table[0x40 | (r << 3) | s] = Some(Opcode::LdReg {
                store: target,
                source: Target8Bit::from_bits(s as u8),
            });
            s += 1;
        }

        r += 1;
    }

    // LD [HL], [HL] is HALT.
    table[0x76] = None;

    table
}

/// Enumeration of the operations the [`Cpu`] is capable of executing, with their operands already
/// fetched.
#[allow(clippy::upper_case_acronyms)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Operation {
    /// No operation.
    NOP,
    /// Jumps to an absolute address.
    JP { address: u16 },
    /// Jumps to a relative memory address by advancing the program counter by the offset.
    JR { offset: i8 },
    /// Conditionally jumps to a relative memory address by advancing the program counter by the
    /// offset based on the state of the [`Condition`].
    JRC {
        condition: Condition,
        jump: bool,
        offset: i8,
    },
    /// Loads an immediate [`u8`] into the [`Target8Bit`].
    LDU8 { target: Target8Bit, value: u8 },
    /// Loads an immediate [`u16`] into the [`Target16Bit`] register.
    LDU16 { target: Target16Bit, value: u16 },
    /// Copies the value of the `source` operand into the `store` operand.
    LDREG { store: Target8Bit, source: Target8Bit },
    /// Stores the `A` register at the address held in the [`Target16Bit`] register.
    LDMEMA { target: Target16Bit },
    /// Loads the byte at the address held in the [`Target16Bit`] register into the `A` register.
    LDAMEM { target: Target16Bit },
    /// Stores the `A` register at the address held in `HL`, then decrements `HL`.
    LDHLDECA,
    /// Stores the `A` register in the high page at the offset.
    LDHSTORE { offset: u8 },
    /// Loads the byte in the high page at the offset into the `A` register.
    LDHLOAD { offset: u8 },
    /// Decrements the [`Target8Bit`] by one.
    DEC { target: Target8Bit },
    /// Decrements the [`Target16Bit`] register by one.
    DECU16 { target: Target16Bit },
    /// Exclusive or of the `A` register with the [`Operand`].
    XOR { operand: Operand },
    /// Bitwise and of the `A` register with the [`Operand`].
    AND { operand: Operand },
    /// Compares the `A` register with the [`Operand`] without storing the result.
    CP { operand: Operand },
    /// Pushes the program counter and jumps to the address.
    CALL { address: u16 },
    /// Pops the program counter off the stack.
    RET,
    /// Pops the program counter off the stack when the [`Condition`] holds.
    RETC { condition: Condition, jump: bool },
    /// Disables interrupts.
    DI,
    /// Enables interrupts.
    EI,
}

impl Display for Operation {
    /// Writes a string representation of the [`Operation`] to the formatter.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operation::NOP => f.write_str("NOP"),
            Operation::JP { address } => f.write_fmt(format_args!("JP {:#06x}", address)),
            Operation::JR { offset } => f.write_fmt(format_args!("JR {}", offset)),
            Operation::JRC {
                condition, offset, ..
            } => f.write_fmt(format_args!("JR {}, {}", condition, offset)),
            Operation::LDU8 { target, value } => {
                f.write_fmt(format_args!("LD {}, {:#04x}", target, value))
            }
            Operation::LDU16 { target, value } => {
                f.write_fmt(format_args!("LD {}, {:#06x}", target, value))
            }
            Operation::LDREG { store, source } => {
                f.write_fmt(format_args!("LD {}, {}", store, source))
            }
            Operation::LDMEMA { target } => f.write_fmt(format_args!("LD [{}], A", target)),
            Operation::LDAMEM { target } => f.write_fmt(format_args!("LD A, [{}]", target)),
            Operation::LDHLDECA => f.write_str("LD [HL-], A"),
            Operation::LDHSTORE { offset } => {
                f.write_fmt(format_args!("LDH [{:#06x}], A", high_page(*offset)))
            }
            Operation::LDHLOAD { offset } => {
                f.write_fmt(format_args!("LDH A, [{:#06x}]", high_page(*offset)))
            }
            Operation::DEC { target } => f.write_fmt(format_args!("DEC {}", target)),
            Operation::DECU16 { target } => f.write_fmt(format_args!("DEC {}", target)),
            Operation::XOR { operand } => f.write_fmt(format_args!("XOR A, {}", operand)),
            Operation::AND { operand } => f.write_fmt(format_args!("AND A, {}", operand)),
            Operation::CP { operand } => f.write_fmt(format_args!("CP A, {}", operand)),
            Operation::CALL { address } => f.write_fmt(format_args!("CALL {:#06x}", address)),
            Operation::RET => f.write_str("RET"),
            Operation::RETC { condition, .. } => f.write_fmt(format_args!("RET {}", condition)),
            Operation::DI => f.write_str("DI"),
            Operation::EI => f.write_str("EI"),
        }
    }
}

/// An instruction that is ready to be executed by the [`Cpu`]. It contains not only the
/// [`Operation`] but also where it was fetched from and the number of machine cycles it takes to
/// execute, op code fetch included.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Instruction {
    /// Address the op code was fetched from.
    address: u16,
    /// Op code byte.
    op_code: u8,
    /// Number of machine cycles it takes to execute the instruction.
    cycles: u8,
    /// [`Operation`] which should be executed by the cpu.
    operation: Operation,
}

impl Instruction {
    /// Creates a new [`Instruction`] from the given values.
    fn new(address: u16, op_code: u8, cycles: u8, operation: Operation) -> Self {
        Self {
            address,
            op_code,
            cycles,
            operation,
        }
    }
    /// Address the op code was fetched from.
    pub fn address(&self) -> u16 {
        self.address
    }
    /// Op code byte of the instruction.
    pub fn op_code(&self) -> u8 {
        self.op_code
    }
    /// Number of machine cycles the instruction takes.
    pub fn cycles(&self) -> u8 {
        self.cycles
    }
    /// [`Operation`] performed by the instruction.
    pub fn operation(&self) -> Operation {
        self.operation
    }
}

impl Display for Instruction {
    /// Writes a string representation of the [`Instruction`] to the formatter, prefixed with the
    /// address it was fetched from.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("{:#06x}: {}", self.address, self.operation))
    }
}

/// Machine cycles taken by an 8-bit operand access. Going through `[HL]` costs one more.
fn operand_cycles(target: Target8Bit, base: u8) -> u8 {
    match target {
        Target8Bit::HLMem => base + 1,
        _ => base,
    }
}

/// Callback invoked with every decoded [`Instruction`] before it executes.
pub type TraceHook = Box<dyn FnMut(&Instruction)>;

/// Default value for the maximum number of instructions stored in the instruction execution
/// history of the [`Cpu`].
const DEFAULT_CPU_MAX_HISTORY: usize = 250;

/// Represents the central processing unit of the Game Boy system. It is responsible for reading,
/// decoding and executing instructions which drive the game.
///
/// The cpu is stepped one machine cycle at a time with [`Cpu::tick`]. An instruction runs in full
/// on the tick that fetches it and the remaining cycles of its cost are then spent idling.
pub struct Cpu {
    /// Registers read and written by the instructions.
    registers: Registers,
    /// Interrupt master enable latch.
    ime: bool,
    /// Machine cycles left before the next op code is fetched.
    pending_cycles: u32,
    /// Memory bus holding the cartridge and working RAM.
    mmu: Mmu,
    /// Tracks the history of [`Instruction`]s that were executed by the cpu.
    history: BoundedVecDeque<Instruction>,
    /// Optional observer of decoded instructions.
    trace_hook: Option<TraceHook>,
}

impl Cpu {
    /// Creates a new [`Cpu`] reading its program from the given [`Rom`]. The cpu is left in its
    /// power-on state and [`Cpu::begin`] must be called before the first [`Cpu::tick`].
    pub fn new(rom: Rc<dyn Rom>, gpu: Rc<RefCell<Gpu>>) -> Self {
        Self::with_max_history(rom, gpu, DEFAULT_CPU_MAX_HISTORY)
    }
    /// Creates a new [`Cpu`] with the given max instruction history length.
    pub fn with_max_history(rom: Rc<dyn Rom>, gpu: Rc<RefCell<Gpu>>, max: usize) -> Self {
        let mut cpu = Self {
            registers: Registers::default(),
            ime: false,
            pending_cycles: 0,
            mmu: Mmu::new(rom, gpu),
            history: BoundedVecDeque::with_capacity(max, max),
            trace_hook: None,
        };

        cpu.reset();
        cpu
    }
    /// Returns every register, the flags and the interrupt latch to their power-on values. Working
    /// RAM is left untouched.
    pub fn reset(&mut self) {
        self.registers = Registers {
            sp: STACK_TOP,
            ..Registers::default()
        };
        self.ime = false;
    }
    /// Resets the cpu and points the program counter at the start vector of the cartridge.
    pub fn begin(&mut self) -> Result<()> {
        self.reset();

        self.registers.pc = self.mmu.rom().start_vector()?;
        self.pending_cycles = 0;

        tracing::debug!("begin execution at {:#06x}", self.registers.pc);

        Ok(())
    }
    /// Advances emulation by one machine cycle. When no instruction is in flight, the next one is
    /// fetched and executed in full.
    pub fn tick(&mut self) -> Result<()> {
        if self.pending_cycles > 0 {
            self.pending_cycles -= 1;
            return Ok(());
        }

        let address = self.registers.pc;
        let op_code = self.fetch_u8()?;

        let instruction = self.decode(address, op_code)?;

        if let Some(hook) = self.trace_hook.as_mut() {
            hook(&instruction);
        }

        self.execute(&instruction)?;

        // The op code fetch is the cycle spent by this tick.
        self.pending_cycles = u32::from(instruction.cycles) - 1;

        self.history.push_front(instruction);

        Ok(())
    }
    /// Installs a callback invoked with every decoded instruction before it executes.
    pub fn set_trace_hook(&mut self, hook: impl FnMut(&Instruction) + 'static) {
        self.trace_hook = Some(Box::new(hook));
    }
    /// Removes the trace callback, if any.
    pub fn clear_trace_hook(&mut self) {
        self.trace_hook = None;
    }
    /// Registers of the cpu.
    pub fn registers(&self) -> &Registers {
        &self.registers
    }
    /// State of the interrupt master enable latch.
    pub fn ime(&self) -> bool {
        self.ime
    }
    /// Machine cycles left before the next op code is fetched.
    pub fn pending_cycles(&self) -> u32 {
        self.pending_cycles
    }
    /// Executed instructions, most recent first.
    pub fn history(&self) -> impl Iterator<Item = &Instruction> {
        self.history.iter()
    }
    /// Reads a byte through the memory bus without side effects on the cpu.
    pub fn read_u8(&self, address: u16) -> Result<u8> {
        self.mmu.read_u8(address)
    }
    /// Video unit handle the cpu was created with.
    pub fn gpu(&self) -> &Rc<RefCell<Gpu>> {
        self.mmu.gpu()
    }
    /// Reads the byte at the program counter and advances it.
    fn fetch_u8(&mut self) -> Result<u8> {
        let byte = self.mmu.read_u8(self.registers.pc)?;
        self.registers.pc = self.registers.pc.wrapping_add(1);

        Ok(byte)
    }
    /// Reads the little-endian word at the program counter and advances past it.
    fn fetch_u16(&mut self) -> Result<u16> {
        let low = self.fetch_u8()?;
        let high = self.fetch_u8()?;

        Ok(pair(high, low))
    }
    /// Reads a signed displacement at the program counter and advances past it.
    fn fetch_i8(&mut self) -> Result<i8> {
        Ok(self.fetch_u8()? as i8)
    }
    /// Pushes a 16-bit value onto the stack, high byte first so it ends up at the higher address.
    fn push(&mut self, value: u16) {
        let (high, low) = split(value);

        self.registers.sp = self.registers.sp.wrapping_sub(1);
        self.mmu.write_u8(self.registers.sp, high);
        self.registers.sp = self.registers.sp.wrapping_sub(1);
        self.mmu.write_u8(self.registers.sp, low);
    }
    /// Pops a 16-bit value off the stack.
    fn pop(&mut self) -> Result<u16> {
        let low = self.mmu.read_u8(self.registers.sp)?;
        self.registers.sp = self.registers.sp.wrapping_add(1);
        let high = self.mmu.read_u8(self.registers.sp)?;
        self.registers.sp = self.registers.sp.wrapping_add(1);

        Ok(pair(high, low))
    }
    /// Reads the value of the [`Target8Bit`].
    fn read_target(&self, target: Target8Bit) -> Result<u8> {
        let value = match target {
            Target8Bit::A => self.registers.a,
            Target8Bit::B => self.registers.b,
            Target8Bit::C => self.registers.c,
            Target8Bit::D => self.registers.d,
            Target8Bit::E => self.registers.e,
            Target8Bit::H => self.registers.h,
            Target8Bit::L => self.registers.l,
            Target8Bit::HLMem => self.mmu.read_u8(self.registers.hl())?,
        };

        Ok(value)
    }
    /// Writes the value of the [`Target8Bit`].
    fn write_target(&mut self, target: Target8Bit, value: u8) {
        match target {
            Target8Bit::A => self.registers.a = value,
            Target8Bit::B => self.registers.b = value,
            Target8Bit::C => self.registers.c = value,
            Target8Bit::D => self.registers.d = value,
            Target8Bit::E => self.registers.e = value,
            Target8Bit::H => self.registers.h = value,
            Target8Bit::L => self.registers.l = value,
            Target8Bit::HLMem => self.mmu.write_u8(self.registers.hl(), value),
        }
    }
    /// Reads the value of the [`Operand`].
    fn read_operand(&self, operand: Operand) -> Result<u8> {
        match operand {
            Operand::Target(target) => self.read_target(target),
            Operand::U8(value) => Ok(value),
        }
    }
    /// Looks the op code up in the dispatch table and fetches its operands, producing an
    /// [`Instruction`] which can be executed by the [`Cpu`].
    fn decode(&mut self, address: u16, op_code: u8) -> Result<Instruction> {
        tracing::debug!("decode op code {:#04x} at {:#06x}", op_code, address);

        let Some(opcode) = OPCODES[op_code as usize] else {
            return Err(Error::UnimplementedOpcode { op_code, address });
        };

        let flags = self.registers.f;

        let (cycles, operation) = match opcode {
            Opcode::Nop => (1, Operation::NOP),
            Opcode::Jp => (
                4,
                Operation::JP {
                    address: self.fetch_u16()?,
                },
            ),
            Opcode::Jr => (
                3,
                Operation::JR {
                    offset: self.fetch_i8()?,
                },
            ),
            Opcode::JrCond(condition) => {
                let jump = condition.holds(flags);
                let offset = self.fetch_i8()?;

                (
                    if jump { 3 } else { 2 },
                    Operation::JRC {
                        condition,
                        jump,
                        offset,
                    },
                )
            }
            Opcode::LdU8(target) => (
                operand_cycles(target, 2),
                Operation::LDU8 {
                    target,
                    value: self.fetch_u8()?,
                },
            ),
            Opcode::LdU16(target) => (
                3,
                Operation::LDU16 {
                    target,
                    value: self.fetch_u16()?,
                },
            ),
            Opcode::LdReg { store, source } => {
                let cycles = if store == Target8Bit::HLMem || source == Target8Bit::HLMem {
                    2
                } else {
                    1
                };

                (cycles, Operation::LDREG { store, source })
            }
            Opcode::LdMemA(target) => (2, Operation::LDMEMA { target }),
            Opcode::LdAMem(target) => (2, Operation::LDAMEM { target }),
            Opcode::LdHlDecA => (2, Operation::LDHLDECA),
            Opcode::LdhStore => (
                3,
                Operation::LDHSTORE {
                    offset: self.fetch_u8()?,
                },
            ),
            Opcode::LdhLoad => (
                3,
                Operation::LDHLOAD {
                    offset: self.fetch_u8()?,
                },
            ),
            Opcode::Dec(target) => {
                // Read, modify and write back through [HL].
                let cycles = match target {
                    Target8Bit::HLMem => 3,
                    _ => 1,
                };

                (cycles, Operation::DEC { target })
            }
            Opcode::DecU16(target) => (2, Operation::DECU16 { target }),
            Opcode::Xor(target) => (
                operand_cycles(target, 1),
                Operation::XOR {
                    operand: Operand::Target(target),
                },
            ),
            Opcode::XorU8 => (
                2,
                Operation::XOR {
                    operand: Operand::U8(self.fetch_u8()?),
                },
            ),
            Opcode::And(target) => (
                operand_cycles(target, 1),
                Operation::AND {
                    operand: Operand::Target(target),
                },
            ),
            Opcode::AndU8 => (
                2,
                Operation::AND {
                    operand: Operand::U8(self.fetch_u8()?),
                },
            ),
            Opcode::Cp(target) => (
                operand_cycles(target, 1),
                Operation::CP {
                    operand: Operand::Target(target),
                },
            ),
            Opcode::CpU8 => (
                2,
                Operation::CP {
                    operand: Operand::U8(self.fetch_u8()?),
                },
            ),
            Opcode::Call => (
                6,
                Operation::CALL {
                    address: self.fetch_u16()?,
                },
            ),
            Opcode::Ret => (4, Operation::RET),
            Opcode::RetCond(condition) => {
                let jump = condition.holds(flags);

                (if jump { 5 } else { 2 }, Operation::RETC { condition, jump })
            }
            Opcode::Di => (1, Operation::DI),
            Opcode::Ei => (1, Operation::EI),
        };

        Ok(Instruction::new(address, op_code, cycles, operation))
    }
    /// Executes the given [`Instruction`].
    fn execute(&mut self, instruction: &Instruction) -> Result<()> {
        tracing::debug!("execute instruction '{}'", instruction);

        match instruction.operation {
            Operation::NOP => {}
            Operation::JP { address } => self.registers.pc = address,
            Operation::JR { offset } => {
                self.registers.pc = self.registers.pc.wrapping_add_signed(offset.into());
            }
            Operation::JRC { jump, offset, .. } => {
                if jump {
                    self.registers.pc = self.registers.pc.wrapping_add_signed(offset.into());
                }
            }
            Operation::LDU8 { target, value } => {
                self.write_target(target, value);

                if target != Target8Bit::HLMem {
                    self.registers.f.set_z(value == 0);
                }
            }
            Operation::LDU16 { target, value } => self.registers.write_u16(target, value),
            Operation::LDREG { store, source } => {
                let value = self.read_target(source)?;
                self.write_target(store, value);
            }
            Operation::LDMEMA { target } => {
                let address = self.registers.read_u16(target);
                self.mmu.write_u8(address, self.registers.a);
            }
            Operation::LDAMEM { target } => {
                let address = self.registers.read_u16(target);
                self.registers.a = self.mmu.read_u8(address)?;
            }
            Operation::LDHLDECA => {
                self.mmu.write_u8(self.registers.hl(), self.registers.a);

                let hl = self.registers.hl().wrapping_sub(1);
                self.registers.set_hl(hl);

                self.registers.f.set_z(hl == 0);
                self.registers.f.set_n(true);
            }
            Operation::LDHSTORE { offset } => {
                self.mmu.write_u8(high_page(offset), self.registers.a);
            }
            Operation::LDHLOAD { offset } => {
                self.registers.a = self.mmu.read_u8(high_page(offset))?;
            }
            Operation::DEC { target } => {
                let value = self.read_target(target)?.wrapping_sub(1);
                self.write_target(target, value);

                self.registers.f.set_z(value == 0);
                self.registers.f.set_n(true);
            }
            Operation::DECU16 { target } => {
                let value = self.registers.read_u16(target).wrapping_sub(1);
                self.registers.write_u16(target, value);
            }
            Operation::XOR { operand } => {
                self.registers.a ^= self.read_operand(operand)?;

                self.registers.f.set_z(self.registers.a == 0);
            }
            Operation::AND { operand } => {
                self.registers.a &= self.read_operand(operand)?;

                self.registers.f.set_z(self.registers.a == 0);
                self.registers.f.set_n(false);
                self.registers.f.set_h(true);
                self.registers.f.set_c(false);
            }
            Operation::CP { operand } => {
                let value = self.read_operand(operand)?;

                self.registers.f.set_z(self.registers.a == value);
            }
            Operation::CALL { address } => {
                self.push(self.registers.pc);
                self.registers.pc = address;
            }
            Operation::RET => self.registers.pc = self.pop()?,
            Operation::RETC { jump, .. } => {
                if jump {
                    self.registers.pc = self.pop()?;
                }
            }
            Operation::DI => self.ime = false,
            Operation::EI => self.ime = true,
        }

        Ok(())
    }
}


#[cfg(test)]
mod json_tests {
    use super::*;
    use crate::{
        cart::{Cartridge, fix_checksum, test_image},
        mem::ROM_END,
    };

    use serde::Deserialize;

    /// Fixture file describing single instruction executions.
    const INSTRUCTIONS_JSON: &str = include_str!("../testdata/instructions.json");

    /// Contains the state of the cpu and memory at a point in the test lifecycle.
    #[derive(Debug, Deserialize)]
    struct State {
        pc: u16,
        sp: u16,
        a: u8,
        b: u8,
        c: u8,
        d: u8,
        e: u8,
        f: u8,
        h: u8,
        l: u8,
        #[serde(default)]
        ime: bool,
        ram: Vec<(u16, u8)>,
    }

    /// Contains the input and output data for an instruction op code test.
    #[derive(Debug, Deserialize)]
    struct Test {
        name: String,
        #[serde(rename = "initial")]
        input: State,
        #[serde(rename = "final")]
        output: State,
        cycles: u8,
    }

    /// Executes a [`Test`]. Bytes below [`ROM_END`] are baked into the cartridge image, the rest
    /// are written through the memory bus.
    fn execute(test: Test) {
        println!("execute json test {}", test.name);

        let mut image = test_image(&[]);
        for (address, value) in test.input.ram.iter().copied() {
            if address < ROM_END {
                image[address as usize] = value;
            }
        }
        fix_checksum(&mut image);

        let cartridge = Cartridge::from_bytes(image).expect("valid image");

        let mut cpu = Cpu::new(Rc::new(cartridge), Rc::new(RefCell::new(Gpu::new())));
        for (address, value) in test.input.ram.iter().copied() {
            if address >= ROM_END {
                cpu.mmu.write_u8(address, value);
            }
        }

        cpu.registers.pc = test.input.pc;
        cpu.registers.sp = test.input.sp;
        cpu.registers.a = test.input.a;
        cpu.registers.b = test.input.b;
        cpu.registers.c = test.input.c;
        cpu.registers.d = test.input.d;
        cpu.registers.e = test.input.e;
        cpu.registers.f = test.input.f.into();
        cpu.registers.h = test.input.h;
        cpu.registers.l = test.input.l;
        cpu.ime = test.input.ime;

        cpu.tick().unwrap_or_else(|e| panic!("{}: {}", test.name, e));

        assert_eq!(test.output.pc, cpu.registers.pc, "{}: pc", test.name);
        assert_eq!(test.output.sp, cpu.registers.sp, "{}: sp", test.name);
        assert_eq!(test.output.a, cpu.registers.a, "{}: a", test.name);
        assert_eq!(test.output.b, cpu.registers.b, "{}: b", test.name);
        assert_eq!(test.output.c, cpu.registers.c, "{}: c", test.name);
        assert_eq!(test.output.d, cpu.registers.d, "{}: d", test.name);
        assert_eq!(test.output.e, cpu.registers.e, "{}: e", test.name);
        assert_eq!(test.output.f, u8::from(cpu.registers.f), "{}: f", test.name);
        assert_eq!(test.output.h, cpu.registers.h, "{}: h", test.name);
        assert_eq!(test.output.l, cpu.registers.l, "{}: l", test.name);
        assert_eq!(test.output.ime, cpu.ime, "{}: ime", test.name);
        assert_eq!(
            u32::from(test.cycles) - 1,
            cpu.pending_cycles,
            "{}: cycles",
            test.name
        );

        for (address, expected) in test.output.ram.iter().copied() {
            let actual = cpu.read_u8(address).expect("mapped");

            assert_eq!(expected, actual, "{}: ram {:#06x}", test.name, address);
        }
    }

    #[test]
    fn test_instructions_json() {
        let tests: Vec<Test> = serde_json::from_str(INSTRUCTIONS_JSON).expect("valid test JSON");
        assert!(!tests.is_empty());

        tests.into_iter().for_each(execute);
    }
}
