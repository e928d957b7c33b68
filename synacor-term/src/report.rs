use std::fmt;
use vm::{Status, Vm};

/// Printable summary of the CPU state
///
/// ```text
/// *** CPU STATUS ***
/// Faulted: pop from empty stack at 0x0004
/// R0: 0001
/// ...
/// PC: 0004
/// Stack: 0 item(s)
/// ******************
/// ```
pub struct Report<'a, I, O>(pub &'a Vm<I, O>);

impl<I, O> fmt::Display for Report<'_, I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let vm = self.0;
        writeln!(f, "*** CPU STATUS ***")?;
        match vm.status() {
            Status::Running => writeln!(f, "Running")?,
            Status::Halted => writeln!(f, "Halted")?,
            Status::Faulted(e) => writeln!(f, "Faulted: {e}")?,
        }
        for (i, r) in vm.registers().iter().enumerate() {
            writeln!(f, "R{i}: {r:04X}")?;
        }
        writeln!(f, "PC: {:04X}", vm.pc())?;
        write!(f, "Stack: {} item(s)", vm.stack().len())?;
        if let Some(top) = vm.stack().last() {
            write!(f, ", top {top:04X}")?;
        }
        writeln!(f)?;
        write!(f, "******************")
    }
}
