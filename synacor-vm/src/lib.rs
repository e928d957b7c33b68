//! Synacor virtual machine
#![warn(missing_docs)]
#![forbid(unsafe_code)]

use std::collections::VecDeque;

use log::{debug, log_enabled, trace, Level};
use zerocopy::byteorder::{LittleEndian, U16};
use zerocopy::FromBytes;

/// Number of words in VM memory
pub const MEMORY_SIZE: usize = 1 << 15;

/// Number of general-purpose registers
pub const REGISTER_COUNT: usize = 8;

/// Largest value of a word, which is also the highest memory address
pub const MAX_WORD: u16 = 0x7FFF;

/// Operand encoding of register 0; the other registers follow it
const REGISTER_BASE: u16 = MAX_WORD + 1;
const REGISTER_LAST: u16 = REGISTER_BASE + REGISTER_COUNT as u16 - 1;

/// Word arithmetic is performed modulo this value
const MODULUS: u32 = 1 << 15;

/// Adds two values modulo 32768
#[inline]
const fn wrapping_add(a: u16, b: u16) -> u16 {
    ((a as u32 + b as u32) % MODULUS) as u16
}

/// Multiplies two values modulo 32768
#[inline]
const fn wrapping_mul(a: u16, b: u16) -> u16 {
    ((a as u32 * b as u32) % MODULUS) as u16
}

/// Error which stops the VM
///
/// Every variant records the address of the instruction that faulted.
#[derive(Copy, Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Fault {
    /// `pop` executed with an empty stack
    #[error("pop from empty stack at {pc:#06x}")]
    StackUnderflow {
        /// Address of the faulting instruction
        pc: u16,
    },

    /// The word at the program counter is not a valid opcode
    #[error("unknown opcode {opcode} at {pc:#06x}")]
    UnknownOpcode {
        /// Raw opcode value
        opcode: u16,
        /// Address of the faulting instruction
        pc: u16,
    },

    /// A memory access or jump target is outside of memory
    #[error("invalid memory access to {addr:#06x} at {pc:#06x}")]
    InvalidMemoryAccess {
        /// Offending address
        addr: u16,
        /// Address of the faulting instruction
        pc: u16,
    },

    /// `mod` with a divisor of zero
    #[error("modulo by zero at {pc:#06x}")]
    Arithmetic {
        /// Address of the faulting instruction
        pc: u16,
    },

    /// An operand is neither a literal nor a register
    #[error("invalid operand {operand} at {pc:#06x}")]
    InvalidOperand {
        /// Raw operand value
        operand: u16,
        /// Address of the faulting instruction
        pc: u16,
    },

    /// `in` executed after the input port was closed
    #[error("input closed at {pc:#06x}")]
    InputClosed {
        /// Address of the faulting instruction
        pc: u16,
    },
}

impl Fault {
    /// Returns the address of the instruction which faulted
    pub fn pc(&self) -> u16 {
        match *self {
            Fault::StackUnderflow { pc }
            | Fault::UnknownOpcode { pc, .. }
            | Fault::InvalidMemoryAccess { pc, .. }
            | Fault::Arithmetic { pc }
            | Fault::InvalidOperand { pc, .. }
            | Fault::InputClosed { pc } => pc,
        }
    }
}

/// Execution status of the VM
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Status {
    /// The VM is ready to execute the next instruction
    Running,
    /// The program halted, either with `halt` or with `ret` on an empty stack
    Halted,
    /// The program hit an error
    Faulted(Fault),
}

impl Status {
    /// Checks whether the status is `Halted` or `Faulted`
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Status::Running)
    }

    /// Returns the fault, if there is one
    pub fn fault(&self) -> Option<Fault> {
        match self {
            Status::Faulted(f) => Some(*f),
            _ => None,
        }
    }
}

/// Output port, written by the `out` instruction
pub trait CharacterSink {
    /// Accepts a single character code
    ///
    /// The VM has no way to react to errors, so failures must be handled by
    /// the implementation.
    fn write(&mut self, c: u16);
}

/// Input port, read by the `in` instruction
pub trait CharacterSource {
    /// Produces a single character code, blocking until one is available
    ///
    /// Once a line has been started, the implementation must keep producing
    /// characters until its newline.  Returns `None` if input is closed for
    /// good, which faults the VM.
    fn read(&mut self) -> Option<u16>;
}

impl<T: CharacterSink + ?Sized> CharacterSink for &mut T {
    fn write(&mut self, c: u16) {
        (**self).write(c)
    }
}

impl<T: CharacterSource + ?Sized> CharacterSource for &mut T {
    fn read(&mut self) -> Option<u16> {
        (**self).read()
    }
}

impl CharacterSink for Vec<u16> {
    fn write(&mut self, c: u16) {
        self.push(c);
    }
}

impl CharacterSource for VecDeque<u16> {
    fn read(&mut self) -> Option<u16> {
        self.pop_front()
    }
}

/// Port which does nothing
///
/// Output is discarded and input is always closed.
#[derive(Copy, Clone, Debug, Default)]
pub struct Disconnected;

impl CharacterSink for Disconnected {
    fn write(&mut self, _c: u16) {
        // nothing to do here
    }
}

impl CharacterSource for Disconnected {
    fn read(&mut self) -> Option<u16> {
        None
    }
}

/// Destination of an instruction's result
#[derive(Copy, Clone, Debug)]
enum Dest {
    Register(usize),
    /// Literal destinations are accepted, and the result is dropped
    Discard,
}

/// The virtual machine itself
pub struct Vm<I, O> {
    /// 32K words of VM memory
    memory: Box<[u16; MEMORY_SIZE]>,
    registers: [u16; REGISTER_COUNT],
    /// Unbounded stack, shared by `push` / `pop` and `call` / `ret`
    stack: Vec<u16>,
    pc: u16,
    status: Status,
    input: I,
    output: O,
}

impl<I, O> Vm<I, O> {
    /// Builds a new VM with zeroed state, attached to the given ports
    pub fn new(input: I, output: O) -> Self {
        Self {
            memory: Box::new([0u16; MEMORY_SIZE]),
            registers: [0u16; REGISTER_COUNT],
            stack: vec![],
            pc: 0,
            status: Status::Running,
            input,
            output,
        }
    }

    /// Loads a program image into memory, starting at address 0
    ///
    /// The image is a sequence of little-endian words.  An odd trailing byte
    /// is ignored.  Returns the part of the image that does not fit in memory,
    /// which is empty for images of up to 64 KiB.
    ///
    /// This only touches memory, and must be called before the first step.
    pub fn load<'b>(&mut self, rom: &'b [u8]) -> &'b [u8] {
        let (image, rest) = rom.split_at(rom.len().min(MEMORY_SIZE * 2));

        // `U16` is unaligned and a slice prefix of any length is valid, so
        // this cannot fail; a trailing odd byte is left in the suffix.
        if let Ok((words, _odd)) =
            <[U16<LittleEndian>]>::ref_from_prefix(image)
        {
            for (m, w) in self.memory.iter_mut().zip(words) {
                *m = w.get();
            }
        }
        rest
    }

    /// Returns the current execution status
    #[inline]
    pub fn status(&self) -> Status {
        self.status
    }

    /// Returns a human-readable description of the fault, if there is one
    pub fn diagnostic(&self) -> Option<String> {
        self.status.fault().map(|f| f.to_string())
    }

    /// Returns the program counter
    #[inline]
    pub fn pc(&self) -> u16 {
        self.pc
    }

    /// Shared borrow of the register file
    #[inline]
    pub fn registers(&self) -> &[u16; REGISTER_COUNT] {
        &self.registers
    }

    /// Returns the value of a single register
    ///
    /// # Panics
    /// If `i >= REGISTER_COUNT`
    #[inline]
    pub fn register(&self, i: usize) -> u16 {
        self.registers[i]
    }

    /// Shared borrow of the entire memory array
    #[inline]
    pub fn memory(&self) -> &[u16; MEMORY_SIZE] {
        &self.memory
    }

    /// Shared borrow of the stack, with the top of the stack at the end
    #[inline]
    pub fn stack(&self) -> &[u16] {
        &self.stack
    }

    /// Shared borrow of the input port
    pub fn input(&self) -> &I {
        &self.input
    }

    /// Mutable borrow of the input port
    pub fn input_mut(&mut self) -> &mut I {
        &mut self.input
    }

    /// Shared borrow of the output port
    pub fn output(&self) -> &O {
        &self.output
    }

    /// Mutable borrow of the output port
    pub fn output_mut(&mut self) -> &mut O {
        &mut self.output
    }

    /// Consumes the VM, returning its ports
    pub fn into_ports(self) -> (I, O) {
        (self.input, self.output)
    }

    /// Decodes an operand that is read by an instruction
    ///
    /// Literals evaluate to themselves and register references to the
    /// register's contents.  Returns `None` for operands which are neither.
    #[inline]
    pub fn resolve(&self, operand: u16) -> Option<u16> {
        match operand {
            0..=MAX_WORD => Some(operand),
            REGISTER_BASE..=REGISTER_LAST => {
                Some(self.registers[usize::from(operand - REGISTER_BASE)])
            }
            _ => None,
        }
    }

    /// Reads the `n`th word after the opcode at `pc`
    #[inline]
    fn arg(&self, pc: u16, n: u16) -> u16 {
        self.memory[usize::from(wrapping_add(pc, n))]
    }

    #[inline]
    fn read(&self, pc: u16, operand: u16) -> Result<u16, Fault> {
        self.resolve(operand)
            .ok_or(Fault::InvalidOperand { operand, pc })
    }

    /// Decodes an operand that is written by an instruction
    #[inline]
    fn dest(&self, pc: u16, operand: u16) -> Result<Dest, Fault> {
        match operand {
            0..=MAX_WORD => Ok(Dest::Discard),
            REGISTER_BASE..=REGISTER_LAST => {
                Ok(Dest::Register(usize::from(operand - REGISTER_BASE)))
            }
            _ => Err(Fault::InvalidOperand { operand, pc }),
        }
    }

    #[inline]
    fn store(&mut self, dest: Dest, v: u16) {
        if let Dest::Register(i) = dest {
            self.registers[i] = v;
        }
    }

    /// Checks that a computed address is inside memory
    #[inline]
    fn address(&self, pc: u16, addr: u16) -> Result<u16, Fault> {
        if addr <= MAX_WORD {
            Ok(addr)
        } else {
            Err(Fault::InvalidMemoryAccess { addr, pc })
        }
    }

    #[inline]
    fn fetch(&self, pc: u16) -> Result<u16, Fault> {
        self.memory
            .get(usize::from(pc))
            .copied()
            .ok_or(Fault::InvalidMemoryAccess { addr: pc, pc })
    }
}

impl<I: CharacterSource, O: CharacterSink> Vm<I, O> {
    /// Executes a single instruction, returning the new status
    ///
    /// Once the status is terminal, this does nothing.
    pub fn step(&mut self) -> Status {
        if self.status.is_terminal() {
            debug!("ignoring step in terminal state {:?}", self.status);
            return self.status;
        }
        let pc = self.pc;
        match self.op(pc) {
            Ok(Some(next)) => self.pc = next,
            Ok(None) => {
                debug!("halted at {pc:#06x}");
                self.status = Status::Halted;
            }
            Err(e) => {
                debug!("faulted: {e}");
                self.status = Status::Faulted(e);
            }
        }
        self.status
    }

    /// Steps the VM until it stops or `f` returns `true`
    ///
    /// `f` is called before every instruction with the VM and the number of
    /// instructions executed so far by this call.
    pub fn run_until<F: FnMut(&Self, usize) -> bool>(
        &mut self,
        mut f: F,
    ) -> Status {
        let mut i = 0;
        while !self.status.is_terminal() && !f(self, i) {
            self.step();
            i += 1;
        }
        self.status
    }

    /// Executes the instruction at `pc`
    ///
    /// Returns the next program counter, or `None` if the program halted.
    fn op(&mut self, pc: u16) -> Result<Option<u16>, Fault> {
        let opcode = self.fetch(pc)?;
        if log_enabled!(Level::Trace) {
            if let Some(w) = op::width(opcode) {
                let args: Vec<u16> = (1..w).map(|i| self.arg(pc, i)).collect();
                trace!("{pc:#06x}: {} {args:?}", op::NAMES[usize::from(opcode)]);
            }
        }
        match opcode {
            0 => op::halt(self, pc),
            1 => op::set(self, pc),
            2 => op::push(self, pc),
            3 => op::pop(self, pc),
            4 => op::eq(self, pc),
            5 => op::gt(self, pc),
            6 => op::jmp(self, pc),
            7 => op::jt(self, pc),
            8 => op::jf(self, pc),
            9 => op::add(self, pc),
            10 => op::mult(self, pc),
            11 => op::modulo(self, pc),
            12 => op::and(self, pc),
            13 => op::or(self, pc),
            14 => op::not(self, pc),
            15 => op::rmem(self, pc),
            16 => op::wmem(self, pc),
            17 => op::call(self, pc),
            18 => op::ret(self, pc),
            19 => op::out(self, pc),
            20 => op::inp(self, pc),
            21 => op::noop(self, pc),
            _ => Err(Fault::UnknownOpcode { opcode, pc }),
        }
    }
}

/// Binary operation `op a b c`, storing `f(b, c)` into `a`
macro_rules! op_bin {
    ($vm:ident, $pc:ident, $f:expr) => {{
        let a = $vm.dest($pc, $vm.arg($pc, 1))?;
        let b = $vm.read($pc, $vm.arg($pc, 2))?;
        let c = $vm.read($pc, $vm.arg($pc, 3))?;
        let f: fn(u16, u16) -> u16 = $f;
        $vm.store(a, f(b, c));
        Ok(Some(next($pc, 4)))
    }};
}

/// Opcode implementations and metadata
pub mod op {
    use super::*;

    /// Mnemonics of every opcode, indexed by opcode value
    pub const NAMES: [&str; 22] = [
        "halt", "set", "push", "pop", "eq", "gt", "jmp", "jt", "jf", "add",
        "mult", "mod", "and", "or", "not", "rmem", "wmem", "call", "ret",
        "out", "in", "noop",
    ];

    /// Returns the total width in words (opcode and operands) of an opcode
    ///
    /// Returns `None` for unknown opcodes.
    pub const fn width(opcode: u16) -> Option<u16> {
        Some(match opcode {
            0 | 18 | 21 => 1,
            2 | 3 | 6 | 17 | 19 | 20 => 2,
            1 | 7 | 8 | 14 | 15 | 16 => 3,
            4 | 5 | 9..=13 => 4,
            _ => return None,
        })
    }

    type Next = Result<Option<u16>, Fault>;

    /// Address of the instruction `n` words after `pc`
    #[inline]
    pub(crate) fn next(pc: u16, n: u16) -> u16 {
        wrapping_add(pc, n)
    }

    /// Halt
    ///
    /// ```text
    /// halt: 0
    /// ```
    ///
    /// Stops execution and terminates the program.
    pub(crate) fn halt<I, O>(_: &mut Vm<I, O>, _: u16) -> Next {
        Ok(None)
    }

    /// Set
    ///
    /// ```text
    /// set: 1 a b
    /// ```
    ///
    /// Sets register `a` to the value of `b`.
    pub(crate) fn set<I, O>(vm: &mut Vm<I, O>, pc: u16) -> Next {
        let a = vm.dest(pc, vm.arg(pc, 1))?;
        let b = vm.read(pc, vm.arg(pc, 2))?;
        vm.store(a, b);
        Ok(Some(next(pc, 3)))
    }

    /// Push
    ///
    /// ```text
    /// push: 2 a
    /// ```
    pub(crate) fn push<I, O>(vm: &mut Vm<I, O>, pc: u16) -> Next {
        let a = vm.read(pc, vm.arg(pc, 1))?;
        vm.stack.push(a);
        Ok(Some(next(pc, 2)))
    }

    /// Pop
    ///
    /// ```text
    /// pop: 3 a
    /// ```
    ///
    /// Removes the top element from the stack and writes it into `a`.  Popping
    /// an empty stack is an error.
    pub(crate) fn pop<I, O>(vm: &mut Vm<I, O>, pc: u16) -> Next {
        let a = vm.dest(pc, vm.arg(pc, 1))?;
        let v = vm.stack.pop().ok_or(Fault::StackUnderflow { pc })?;
        vm.store(a, v);
        Ok(Some(next(pc, 2)))
    }

    /// Equal
    ///
    /// ```text
    /// eq: 4 a b c
    /// ```
    ///
    /// Sets `a` to 1 if `b` is equal to `c`, and 0 otherwise.
    pub(crate) fn eq<I, O>(vm: &mut Vm<I, O>, pc: u16) -> Next {
        op_bin!(vm, pc, |b, c| u16::from(b == c))
    }

    /// Greater Than
    ///
    /// ```text
    /// gt: 5 a b c
    /// ```
    ///
    /// Sets `a` to 1 if `b` is greater than `c`, and 0 otherwise.
    pub(crate) fn gt<I, O>(vm: &mut Vm<I, O>, pc: u16) -> Next {
        op_bin!(vm, pc, |b, c| u16::from(b > c))
    }

    /// Jump
    ///
    /// ```text
    /// jmp: 6 a
    /// ```
    pub(crate) fn jmp<I, O>(vm: &mut Vm<I, O>, pc: u16) -> Next {
        let a = vm.read(pc, vm.arg(pc, 1))?;
        vm.address(pc, a).map(Some)
    }

    /// Jump If True
    ///
    /// ```text
    /// jt: 7 a b
    /// ```
    ///
    /// If `a` is nonzero, jumps to `b`.
    pub(crate) fn jt<I, O>(vm: &mut Vm<I, O>, pc: u16) -> Next {
        let a = vm.read(pc, vm.arg(pc, 1))?;
        if a != 0 {
            let b = vm.read(pc, vm.arg(pc, 2))?;
            vm.address(pc, b).map(Some)
        } else {
            Ok(Some(next(pc, 3)))
        }
    }

    /// Jump If False
    ///
    /// ```text
    /// jf: 8 a b
    /// ```
    ///
    /// If `a` is zero, jumps to `b`.
    pub(crate) fn jf<I, O>(vm: &mut Vm<I, O>, pc: u16) -> Next {
        let a = vm.read(pc, vm.arg(pc, 1))?;
        if a == 0 {
            let b = vm.read(pc, vm.arg(pc, 2))?;
            vm.address(pc, b).map(Some)
        } else {
            Ok(Some(next(pc, 3)))
        }
    }

    /// Add
    ///
    /// ```text
    /// add: 9 a b c
    /// ```
    ///
    /// Assigns into `a` the sum of `b` and `c`, modulo 32768.
    pub(crate) fn add<I, O>(vm: &mut Vm<I, O>, pc: u16) -> Next {
        op_bin!(vm, pc, wrapping_add)
    }

    /// Multiply
    ///
    /// ```text
    /// mult: 10 a b c
    /// ```
    ///
    /// Stores into `a` the product of `b` and `c`, modulo 32768.
    pub(crate) fn mult<I, O>(vm: &mut Vm<I, O>, pc: u16) -> Next {
        op_bin!(vm, pc, wrapping_mul)
    }

    /// Modulo
    ///
    /// ```text
    /// mod: 11 a b c
    /// ```
    ///
    /// Stores into `a` the remainder of `b` divided by `c`.  A divisor of zero
    /// is an error.
    pub(crate) fn modulo<I, O>(vm: &mut Vm<I, O>, pc: u16) -> Next {
        let a = vm.dest(pc, vm.arg(pc, 1))?;
        let b = vm.read(pc, vm.arg(pc, 2))?;
        let c = vm.read(pc, vm.arg(pc, 3))?;
        let v = b.checked_rem(c).ok_or(Fault::Arithmetic { pc })?;
        vm.store(a, v);
        Ok(Some(next(pc, 4)))
    }

    /// And
    ///
    /// ```text
    /// and: 12 a b c
    /// ```
    pub(crate) fn and<I, O>(vm: &mut Vm<I, O>, pc: u16) -> Next {
        op_bin!(vm, pc, |b, c| b & c)
    }

    /// Or
    ///
    /// ```text
    /// or: 13 a b c
    /// ```
    pub(crate) fn or<I, O>(vm: &mut Vm<I, O>, pc: u16) -> Next {
        op_bin!(vm, pc, |b, c| b | c)
    }

    /// Not
    ///
    /// ```text
    /// not: 14 a b
    /// ```
    ///
    /// Stores the 15-bit bitwise inverse of `b` in `a`.
    pub(crate) fn not<I, O>(vm: &mut Vm<I, O>, pc: u16) -> Next {
        let a = vm.dest(pc, vm.arg(pc, 1))?;
        let b = vm.read(pc, vm.arg(pc, 2))?;
        vm.store(a, !b & MAX_WORD);
        Ok(Some(next(pc, 3)))
    }

    /// Read Memory
    ///
    /// ```text
    /// rmem: 15 a b
    /// ```
    ///
    /// Reads memory at address `b` and writes it to `a`.
    pub(crate) fn rmem<I, O>(vm: &mut Vm<I, O>, pc: u16) -> Next {
        let a = vm.dest(pc, vm.arg(pc, 1))?;
        let b = vm.read(pc, vm.arg(pc, 2))?;
        let addr = vm.address(pc, b)?;
        let v = vm.memory[usize::from(addr)];
        vm.store(a, v);
        Ok(Some(next(pc, 3)))
    }

    /// Write Memory
    ///
    /// ```text
    /// wmem: 16 a b
    /// ```
    ///
    /// Writes the value from `b` into memory at address `a`.
    pub(crate) fn wmem<I, O>(vm: &mut Vm<I, O>, pc: u16) -> Next {
        let a = vm.read(pc, vm.arg(pc, 1))?;
        let addr = vm.address(pc, a)?;
        let b = vm.read(pc, vm.arg(pc, 2))?;
        vm.memory[usize::from(addr)] = b;
        Ok(Some(next(pc, 3)))
    }

    /// Call
    ///
    /// ```text
    /// call: 17 a
    /// ```
    ///
    /// Writes the address of the next instruction to the stack and jumps to
    /// `a`.
    pub(crate) fn call<I, O>(vm: &mut Vm<I, O>, pc: u16) -> Next {
        let a = vm.read(pc, vm.arg(pc, 1))?;
        let target = vm.address(pc, a)?;
        vm.stack.push(next(pc, 2));
        Ok(Some(target))
    }

    /// Return
    ///
    /// ```text
    /// ret: 18
    /// ```
    ///
    /// Removes the top element from the stack and jumps to it.  Returning with
    /// an empty stack halts the program.
    pub(crate) fn ret<I, O>(vm: &mut Vm<I, O>, pc: u16) -> Next {
        let Some(&v) = vm.stack.last() else {
            return Ok(None);
        };
        let target = vm.address(pc, v)?;
        vm.stack.pop();
        Ok(Some(target))
    }

    /// Output
    ///
    /// ```text
    /// out: 19 a
    /// ```
    ///
    /// Writes the character with code `a` to the output port.
    pub(crate) fn out<I, O: CharacterSink>(vm: &mut Vm<I, O>, pc: u16) -> Next {
        let a = vm.read(pc, vm.arg(pc, 1))?;
        vm.output.write(a);
        Ok(Some(next(pc, 2)))
    }

    /// Input
    ///
    /// ```text
    /// in: 20 a
    /// ```
    ///
    /// Reads a character from the input port and writes its code to `a`.
    pub(crate) fn inp<I: CharacterSource, O>(
        vm: &mut Vm<I, O>,
        pc: u16,
    ) -> Next {
        let a = vm.dest(pc, vm.arg(pc, 1))?;
        let c = vm.input.read().ok_or(Fault::InputClosed { pc })?;
        vm.store(a, c);
        Ok(Some(next(pc, 2)))
    }

    /// No Operation
    ///
    /// ```text
    /// noop: 21
    /// ```
    pub(crate) fn noop<I, O>(_: &mut Vm<I, O>, pc: u16) -> Next {
        Ok(Some(next(pc, 1)))
    }
}
