//! Callable values: closures, host functions and bound methods.

use std::fmt::Debug;
use std::sync::Arc;

use parking_lot::Mutex;
use refuse::{ContainsNoRefs, NoMapping, Ref, Trace};

use crate::runtime::symbol::Symbol;
use crate::runtime::value::Value;
use crate::vm::{Code, Fault, VmContext};

/// A shared, mutable storage location for a captured variable.
///
/// A local that any nested function captures is stored in a cell instead of
/// directly in its frame, so the frame and every closure that captured it
/// observe the same value.
#[derive(Debug, Default)]
pub struct Cell(Mutex<Value>);

impl Cell {
    /// Returns a new cell containing `value`.
    #[must_use]
    pub fn new(value: Value) -> Self {
        Self(Mutex::new(value))
    }

    /// Returns the current value.
    #[must_use]
    pub fn get(&self) -> Value {
        *self.0.lock()
    }

    /// Replaces the current value.
    pub fn set(&self, value: Value) {
        *self.0.lock() = value;
    }
}

impl NoMapping for Cell {}

impl Trace for Cell {
    const MAY_CONTAIN_REFERENCES: bool = true;

    fn trace(&self, tracer: &mut refuse::Tracer) {
        self.0.lock().trace(tracer);
    }
}

/// A closure: a compiled function template together with the cells it
/// captured when it was created.
pub struct Function {
    code: Code,
    captures: Vec<Ref<Cell>>,
}

impl Function {
    /// Returns a closure over `code` that captured `captures`.
    #[must_use]
    pub fn new(code: Code, captures: Vec<Ref<Cell>>) -> Self {
        Self { code, captures }
    }

    /// Returns the compiled code of this function.
    #[must_use]
    pub const fn code(&self) -> &Code {
        &self.code
    }

    /// Returns the captured cell at `index`.
    #[must_use]
    pub fn capture(&self, index: usize) -> Option<Ref<Cell>> {
        self.captures.get(index).copied()
    }
}

impl Debug for Function {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Function")
            .field("name", self.code.name())
            .field("captures", &self.captures.len())
            .finish()
    }
}

impl NoMapping for Function {}

impl Trace for Function {
    const MAY_CONTAIN_REFERENCES: bool = true;

    fn trace(&self, tracer: &mut refuse::Tracer) {
        for capture in &self.captures {
            tracer.mark(*capture);
        }
    }
}

/// The number of arguments a function accepts.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Arity {
    /// Exactly this many arguments.
    Fixed(u8),
    /// Any number of arguments.
    Variadic,
}

impl Arity {
    /// Returns true if a call with `count` arguments is accepted.
    #[must_use]
    pub fn accepts(self, count: usize) -> bool {
        match self {
            Arity::Fixed(expected) => usize::from(expected) == count,
            Arity::Variadic => true,
        }
    }
}

/// The signature of a host function.
///
/// For a bound native method, the first argument is `this`.
pub trait NativeFn:
    Fn(&mut VmContext<'_, '_>, &[Value]) -> Result<Value, Fault> + Send + Sync + 'static
{
}

impl<T> NativeFn for T where
    T: Fn(&mut VmContext<'_, '_>, &[Value]) -> Result<Value, Fault> + Send + Sync + 'static
{
}

/// A function implemented by the host.
#[derive(Clone)]
pub struct NativeFunction {
    name: Symbol,
    arity: Arity,
    function: Arc<dyn NativeFn>,
}

impl NativeFunction {
    /// Returns a native function named `name`.
    pub fn new(name: impl Into<Symbol>, arity: Arity, function: impl NativeFn) -> Self {
        Self {
            name: name.into(),
            arity,
            function: Arc::new(function),
        }
    }

    /// Returns the name of this function.
    #[must_use]
    pub const fn name(&self) -> &Symbol {
        &self.name
    }

    /// Returns the number of arguments this function accepts.
    #[must_use]
    pub const fn arity(&self) -> Arity {
        self.arity
    }

    /// Invokes this function without checking its arity.
    pub fn invoke(&self, context: &mut VmContext<'_, '_>, args: &[Value]) -> Result<Value, Fault> {
        (self.function)(context, args)
    }
}

impl Debug for NativeFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeFunction")
            .field("name", &self.name)
            .field("arity", &self.arity)
            .finish_non_exhaustive()
    }
}

impl ContainsNoRefs for NativeFunction {}

impl NoMapping for NativeFunction {}

/// A compiled function bound to the value it was accessed through.
pub struct BoundMethod {
    this: Value,
    function: Ref<Function>,
}

impl BoundMethod {
    /// Binds `function` to `this`.
    #[must_use]
    pub const fn new(this: Value, function: Ref<Function>) -> Self {
        Self { this, function }
    }

    /// Returns the bound receiver.
    #[must_use]
    pub const fn this(&self) -> Value {
        self.this
    }

    /// Returns the underlying function.
    #[must_use]
    pub const fn function(&self) -> Ref<Function> {
        self.function
    }
}

impl NoMapping for BoundMethod {}

impl Trace for BoundMethod {
    const MAY_CONTAIN_REFERENCES: bool = true;

    fn trace(&self, tracer: &mut refuse::Tracer) {
        self.this.trace(tracer);
        tracer.mark(self.function);
    }
}

/// A host function bound to the value it was accessed through.
pub struct BoundNative {
    this: Value,
    function: Ref<NativeFunction>,
}

impl BoundNative {
    /// Binds `function` to `this`.
    #[must_use]
    pub const fn new(this: Value, function: Ref<NativeFunction>) -> Self {
        Self { this, function }
    }

    /// Returns the bound receiver.
    #[must_use]
    pub const fn this(&self) -> Value {
        self.this
    }

    /// Returns the underlying function.
    #[must_use]
    pub const fn function(&self) -> Ref<NativeFunction> {
        self.function
    }
}

impl NoMapping for BoundNative {}

impl Trace for BoundNative {
    const MAY_CONTAIN_REFERENCES: bool = true;

    fn trace(&self, tracer: &mut refuse::Tracer) {
        self.this.trace(tracer);
        tracer.mark(self.function);
    }
}

#[test]
fn arity() {
    assert!(Arity::Fixed(2).accepts(2));
    assert!(!Arity::Fixed(2).accepts(3));
    assert!(Arity::Variadic.accepts(0));
}
