//! Terminal ports for the Synacor virtual machine
//!
//! The VM itself knows nothing about consoles; this crate provides the
//! [`CharacterSource`](vm::CharacterSource) and
//! [`CharacterSink`](vm::CharacterSink) implementations used to run programs
//! interactively, along with a printable CPU status report.
#![warn(missing_docs)]

mod console;
mod output;
mod report;

pub use console::worker as console_worker;
pub use console::Console;
pub use output::Output;
pub use report::Report;
