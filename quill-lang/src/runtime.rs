//! Types used by the virtual machine at runtime.

pub mod builtins;
pub mod class;
pub mod exception;
pub mod function;
pub mod object;
pub mod promise;
pub mod symbol;
pub mod value;
