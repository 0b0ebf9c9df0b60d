//! A small, dynamically typed scripting language compiled to a stack-based
//! bytecode and executed by a cooperative virtual machine.

#[cfg(feature = "tracing")]
#[macro_use]
extern crate tracing;
#[cfg(not(feature = "tracing"))]
#[macro_use]
mod mock_tracing;

pub mod compiler;
pub mod vm;

pub mod runtime;

#[cfg(test)]
mod tests;

use std::fmt::Display;

use compiler::syntax::Ranged;
pub use refuse;

/// Summarizes an error's kind.
pub trait ErrorKind {
    /// Returns the summary of the error being raised.
    fn kind(&self) -> &'static str;
}

/// One or more errors raised during compilation or execution.
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// A list of compilation errors.
    Compilation(Vec<Ranged<compiler::Error>>),
    /// An execution error.
    Execution(vm::ExecutionError),
}

impl From<Vec<Ranged<compiler::Error>>> for Error {
    fn from(value: Vec<Ranged<compiler::Error>>) -> Self {
        Self::Compilation(value)
    }
}

impl From<vm::ExecutionError> for Error {
    fn from(value: vm::ExecutionError) -> Self {
        Self::Execution(value)
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Compilation(errors) => {
                for (index, error) in errors.iter().enumerate() {
                    if index > 0 {
                        f.write_str("\n")?;
                    }
                    write!(f, "{} at {}", error.0, error.range().start)?;
                }
                Ok(())
            }
            Error::Execution(err) => Display::fmt(err, f),
        }
    }
}

impl std::error::Error for Error {}
