//! The virtual machine that executes compiled [`Code`].
//!
//! Each function activation is a [`Frame`] with its own operand stack and
//! instruction pointer. Frames live in a slab owned by the virtual machine
//! and refer to their caller by id, which lets an async frame outlive the
//! call that created it while it waits in the scheduler.

use std::collections::VecDeque;
use std::fmt::{self, Debug, Display};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use alot::{LotId, Lots};
use kempt::Map;
use parking_lot::{Mutex, MutexGuard};
use refuse::{CollectionGuard, NoMapping, Ref, Root, Trace};

use crate::compiler::syntax::{Ranged, SourceCode};
use crate::compiler::{self, Compiler};
use crate::runtime::builtins::{self, Module, NativeMethods};
use crate::runtime::class::{self, Class, Instance};
use crate::runtime::function::{Arity, Cell, Function, NativeFunction};
use crate::runtime::object::Object;
use crate::runtime::promise::{Promise, PromiseStatus};
use crate::runtime::symbol::{Symbol, SymbolRef};
use crate::runtime::value::{Value, ValueFreed};

pub mod bytecode;
pub mod ops;
mod scheduler;

use bytecode::{Argument, LineEntry, Opcode, Reader};
use scheduler::Task;

/// A virtual machine that executes compiled [`Code`].
///
/// Virtual machines are allocated in the [`refuse`] garbage collector and act
/// as a root for every value reachable from their frames, globals and module
/// table.
#[derive(Clone)]
pub struct Vm {
    memory: Root<VmMemory>,
}

impl Vm {
    /// Returns a new virtual machine with the builtin globals and the `math`
    /// module registered.
    #[must_use]
    pub fn new(guard: &CollectionGuard<'_>) -> Self {
        let mut globals = Map::new();
        for (name, value) in builtins::globals(guard) {
            globals.insert(name, value);
        }
        let mut modules = Map::new();
        modules.insert(Symbol::from("math"), builtins::math().build(guard));

        Self {
            memory: Root::new(
                VmMemory(Mutex::new(VmState {
                    frames: Lots::new(),
                    queue: VecDeque::new(),
                    functions: Vec::new(),
                    globals,
                    modules,
                    methods: NativeMethods::new(guard),
                    result: Value::Null,
                    max_depth: 4096,
                    steps_per_charge: 16,
                    counter: 16,
                    output: Box::new(|line| println!("{line}")),
                })),
                guard,
            ),
        }
    }

    /// Returns an execution context for this virtual machine.
    #[must_use]
    pub fn context<'context, 'guard>(
        &'context self,
        guard: &'context mut CollectionGuard<'guard>,
    ) -> VmContext<'context, 'guard> {
        VmContext::new(self, guard)
    }

    /// Compiles `source` into the function table of this virtual machine.
    pub fn compile<'a>(
        &self,
        source: impl Into<SourceCode<'a>>,
        guard: &mut CollectionGuard<'_>,
    ) -> Result<Code, Vec<Ranged<compiler::Error>>> {
        self.context(guard).compile(source)
    }

    /// Executes `code` as the program's implicit `main` function, drains the
    /// scheduler and returns the program's result.
    pub fn execute(
        &self,
        code: &Code,
        guard: &mut CollectionGuard<'_>,
    ) -> Result<Value, ExecutionError> {
        self.context(guard).execute(code)
    }

    /// Compiles `source`, executes it, and returns the result.
    pub fn compile_and_execute<'a>(
        &self,
        source: impl Into<SourceCode<'a>>,
        guard: &mut CollectionGuard<'_>,
    ) -> Result<Value, crate::Error> {
        let mut context = self.context(guard);
        let code = context.compile(source)?;
        Ok(context.execute(&code)?)
    }

    /// Registers `module` so that programs can `import` it.
    pub fn register_module(&self, module: Module, guard: &mut CollectionGuard<'_>) {
        self.context(guard).register_module(module);
    }
}

struct VmMemory(Mutex<VmState>);

impl Trace for VmMemory {
    const MAY_CONTAIN_REFERENCES: bool = true;

    fn trace(&self, tracer: &mut refuse::Tracer) {
        let state = self.0.lock();
        for frame in state.frames.iter() {
            frame.trace(tracer);
        }
        for task in &state.queue {
            task.trace(tracer);
        }
        for value in state.globals.values().chain(state.modules.values()) {
            value.trace(tracer);
        }
        state.methods.trace(tracer);
        state.result.trace(tracer);
    }
}

impl NoMapping for VmMemory {}

/// The state of a [`Vm`].
pub struct VmState {
    frames: Lots<Frame>,
    queue: VecDeque<Task>,
    functions: Vec<Code>,
    globals: Map<Symbol, Value>,
    modules: Map<Symbol, Value>,
    methods: NativeMethods,
    result: Value,
    max_depth: usize,
    steps_per_charge: u16,
    counter: u16,
    output: Box<dyn FnMut(&str) + Send>,
}

impl VmState {
    /// Sets the number of instructions executed between yields to the
    /// garbage collector.
    pub fn set_steps_per_charge(&mut self, steps: u16) {
        self.steps_per_charge = steps.max(1);
        self.counter = self.counter.min(self.steps_per_charge);
    }

    /// Sets the maximum number of live call frames. Calls beyond this depth
    /// fail with [`ExecutionError::StackOverflow`].
    pub fn set_max_depth(&mut self, depth: usize) {
        self.max_depth = depth;
    }

    /// Replaces the function `print` writes lines to.
    pub fn set_output(&mut self, output: impl FnMut(&str) + Send + 'static) {
        self.output = Box::new(output);
    }

    /// Writes a line to the output.
    pub fn print(&mut self, line: &str) {
        (self.output)(line);
    }

    /// Returns the compiled function templates, in the order they were
    /// registered.
    #[must_use]
    pub fn functions(&self) -> &[Code] {
        &self.functions
    }

    /// Returns true if `name` is a global builtin.
    #[must_use]
    pub fn is_global(&self, name: &Symbol) -> bool {
        self.globals.contains(name)
    }

    pub(crate) fn push_function(&mut self, code: Code) -> usize {
        self.functions.push(code);
        self.functions.len() - 1
    }
}

/// An execution context for a [`Vm`].
///
/// While a context is held and not executing code, the garbage collector
/// cannot run and the virtual machine is exclusively accessible by the
/// current thread.
pub struct VmContext<'a, 'guard> {
    guard: &'a mut CollectionGuard<'guard>,
    vm: MutexGuard<'a, VmState>,
}

/// The id of a call frame.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct FrameId(LotId);

/// The execution state of a frame.
///
/// A frame that completes is removed from the virtual machine.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum FrameState {
    /// Created but not yet executing.
    Idle,
    /// Executing or waiting for a callee to return.
    Running,
    /// Parked on a pending promise.
    Awaiting,
}

enum Local {
    Value(Value),
    Cell(Ref<Cell>),
}

struct Frame {
    function: Ref<Function>,
    code: Code,
    locals: Vec<Local>,
    stack: Vec<Value>,
    ip: usize,
    caller: Option<FrameId>,
    state: FrameState,
    promise: Option<Ref<Promise>>,
    construct: Option<Value>,
}

impl Frame {
    fn trace(&self, tracer: &mut refuse::Tracer) {
        tracer.mark(self.function);
        for local in &self.locals {
            match local {
                Local::Value(value) => value.trace(tracer),
                Local::Cell(cell) => tracer.mark(*cell),
            }
        }
        for value in &self.stack {
            value.trace(tracer);
        }
        if let Some(promise) = self.promise {
            tracer.mark(promise);
        }
        if let Some(instance) = &self.construct {
            instance.trace(tracer);
        }
    }
}

enum Step {
    Next,
    Jump(usize),
    Enter(FrameId),
    Return(Value),
    Suspend(Ref<Promise>),
}

enum Invoked {
    Value(Value),
    Frame(FrameId),
}

#[derive(Default)]
struct Operands<'a> {
    int: i32,
    num: f64,
    str: &'a str,
    jump: usize,
}

impl<'context, 'guard> VmContext<'context, 'guard> {
    /// Returns a new execution context for `vm` using `guard`.
    pub fn new(vm: &'context Vm, guard: &'context mut CollectionGuard<'guard>) -> Self {
        Self {
            guard,
            vm: vm.memory.0.lock(),
        }
    }

    /// Returns an exclusive reference to the collection guard.
    #[must_use]
    pub fn guard_mut(&mut self) -> &mut CollectionGuard<'guard> {
        self.guard
    }

    /// Returns a reference to the collection guard.
    #[must_use]
    pub fn guard(&self) -> &CollectionGuard<'guard> {
        self.guard
    }

    /// Returns a reference to the virtual machine.
    pub fn vm(&mut self) -> &mut VmState {
        &mut self.vm
    }

    /// Compiles `source` into the function table of this virtual machine.
    pub fn compile<'a>(
        &mut self,
        source: impl Into<SourceCode<'a>>,
    ) -> Result<Code, Vec<Ranged<compiler::Error>>> {
        Compiler::compile(source, &mut self.vm)
    }

    /// Registers `module` so that programs can `import` it.
    pub fn register_module(&mut self, module: Module) {
        let name = module.name().clone();
        let value = module.build(self.guard);
        self.vm.modules.insert(name, value);
    }

    /// Executes `code` as the program's implicit `main` function, drains the
    /// scheduler and returns the program's result.
    ///
    /// # Errors
    ///
    /// Returns an [`ExecutionError`] if the code is malformed or exceeds the
    /// maximum call depth. Runtime errors raised by the program are values,
    /// not errors.
    pub fn execute(&mut self, code: &Code) -> Result<Value, ExecutionError> {
        let result = self.execute_main(code);
        if result.is_err() {
            self.vm.frames = Lots::new();
            self.vm.queue.clear();
        }
        result
    }

    fn execute_main(&mut self, code: &Code) -> Result<Value, ExecutionError> {
        if code.params() != 0 {
            return Err(ExecutionError::InvalidEntry {
                params: code.params(),
            });
        }
        let main = Ref::new(Function::new(code.clone(), Vec::new()), self.guard);
        let id = self
            .enter(None, main, Vec::new(), None)?
            .map_err(|_| ExecutionError::InvalidEntry {
                params: code.params(),
            })?;
        self.vm.result = self.run_frame(id)?.unwrap_or_default();
        self.run_scheduler()?;
        Ok(self.vm.result)
    }

    fn budget_and_yield(&mut self) {
        let next_count = self.vm.counter.saturating_sub(1);
        if next_count > 0 {
            self.vm.counter = next_count;
        } else {
            self.vm.counter = self.vm.steps_per_charge;
            trace!("yielding to the collector");
            self.guard
                .coordinated_yield(|yielder| MutexGuard::unlocked(&mut self.vm, || yielder.wait()));
        }
    }

    fn frame(&self, id: FrameId) -> Result<&Frame, ExecutionError> {
        self.vm.frames.get(id.0).ok_or(ExecutionError::InvalidFrame)
    }

    fn frame_mut(&mut self, id: FrameId) -> Result<&mut Frame, ExecutionError> {
        self.vm.frames.get_mut(id.0).ok_or(ExecutionError::InvalidFrame)
    }

    fn push(&mut self, id: FrameId, value: Value) -> Result<(), ExecutionError> {
        self.frame_mut(id)?.stack.push(value);
        Ok(())
    }

    fn pop(&mut self, id: FrameId) -> Result<Value, ExecutionError> {
        let frame = self.frame_mut(id)?;
        frame
            .stack
            .pop()
            .ok_or(ExecutionError::StackUnderflow { offset: frame.ip })
    }

    fn pop_n(&mut self, id: FrameId, count: usize) -> Result<Vec<Value>, ExecutionError> {
        let frame = self.frame_mut(id)?;
        let start = frame
            .stack
            .len()
            .checked_sub(count)
            .ok_or(ExecutionError::StackUnderflow { offset: frame.ip })?;
        Ok(frame.stack.split_off(start))
    }

    fn top_mut(&mut self, id: FrameId) -> Result<&mut Value, ExecutionError> {
        let frame = self.frame_mut(id)?;
        let offset = frame.ip;
        frame
            .stack
            .last_mut()
            .ok_or(ExecutionError::StackUnderflow { offset })
    }

    fn rotate(&mut self, id: FrameId, depth: usize) -> Result<(), ExecutionError> {
        let frame = self.frame_mut(id)?;
        let start = frame
            .stack
            .len()
            .checked_sub(depth)
            .ok_or(ExecutionError::StackUnderflow { offset: frame.ip })?;
        frame.stack[start..].rotate_right(1);
        Ok(())
    }

    fn fault_value(&self, code: &Code, offset: usize, fault: &Fault) -> Value {
        Value::error(
            format!("{}:{}: {fault}", code.file(), code.line_for(offset)),
            self.guard,
        )
    }

    fn push_result(
        &mut self,
        id: FrameId,
        code: &Code,
        offset: usize,
        result: Result<Value, Fault>,
    ) -> Result<(), ExecutionError> {
        let value = result.unwrap_or_else(|fault| self.fault_value(code, offset, &fault));
        self.push(id, value)
    }

    fn pop_pairs(&mut self, id: FrameId, count: i32, offset: usize) -> Result<Vec<(Value, Value)>, ExecutionError> {
        let count = usize::try_from(count)
            .ok()
            .and_then(|count| count.checked_mul(2))
            .ok_or(ExecutionError::InvalidOperand { offset })?;
        let values = self.pop_n(id, count)?;
        Ok(values
            .chunks_exact(2)
            .map(|pair| (pair[0], pair[1]))
            .collect())
    }

    fn local(&self, id: FrameId, slot: i32, offset: usize) -> Result<&Local, ExecutionError> {
        usize::try_from(slot)
            .ok()
            .and_then(|slot| self.frame(id).ok()?.locals.get(slot))
            .ok_or(ExecutionError::InvalidOperand { offset })
    }

    fn capture(&self, id: FrameId, index: usize, offset: usize) -> Result<Ref<Cell>, ExecutionError> {
        self.frame(id)?
            .function
            .load(self.guard)
            .ok_or(ExecutionError::ValueFreed)?
            .capture(index)
            .ok_or(ExecutionError::InvalidCapture { offset })
    }

    fn run_frame(&mut self, start: FrameId) -> Result<Option<Value>, ExecutionError> {
        let mut current = start;
        let mut code = self.begin(current)?;
        loop {
            self.budget_and_yield();
            match self.step(current, &code)? {
                Step::Next | Step::Jump(_) => {}
                Step::Enter(callee) => {
                    current = callee;
                    code = self.begin(callee)?;
                }
                Step::Return(value) => match self.leave(current, value)? {
                    (Some(caller), _) => {
                        current = caller;
                        code = self.frame(caller)?.code.clone();
                    }
                    (None, value) => return Ok(Some(value)),
                },
                Step::Suspend(promise) => match self.suspend(current, promise)? {
                    Some(caller) => {
                        current = caller;
                        code = self.frame(caller)?.code.clone();
                    }
                    None => return Ok(None),
                },
            }
        }
    }

    fn begin(&mut self, id: FrameId) -> Result<Code, ExecutionError> {
        let frame = self.frame_mut(id)?;
        if frame.state == FrameState::Idle {
            frame.state = FrameState::Running;
        }
        Ok(frame.code.clone())
    }

    #[allow(clippy::too_many_lines)]
    fn step(&mut self, id: FrameId, code: &Code) -> Result<Step, ExecutionError> {
        let ip = self.frame(id)?.ip;
        let mut reader = Reader::new(code.bytecode(), ip);
        let op = reader.opcode()?;
        let mut operands = Operands::default();
        for kind in op.operands() {
            match reader.argument(*kind)? {
                Argument::Int(value) => operands.int = value,
                Argument::Num(value) => operands.num = value,
                Argument::Str(value) => operands.str = value,
                Argument::Jump(value) => operands.jump = value,
            }
        }

        let step = match op {
            Opcode::LoadInt => {
                self.push(id, Value::Int(operands.int))?;
                Step::Next
            }
            Opcode::LoadNum => {
                self.push(id, Value::Num(operands.num))?;
                Step::Next
            }
            Opcode::LoadStr => {
                self.push(id, Value::string(operands.str))?;
                Step::Next
            }
            Opcode::LoadTrue => {
                self.push(id, Value::Bool(true))?;
                Step::Next
            }
            Opcode::LoadFalse => {
                self.push(id, Value::Bool(false))?;
                Step::Next
            }
            Opcode::LoadNull => {
                self.push(id, Value::Null)?;
                Step::Next
            }
            Opcode::MakeArray => {
                let count =
                    usize::try_from(operands.int).map_err(|_| ExecutionError::InvalidOperand { offset: ip })?;
                let values = self.pop_n(id, count)?;
                let array = Value::array(values, self.guard);
                self.push(id, array)?;
                Step::Next
            }
            Opcode::MakeObject => {
                let pairs = self.pop_pairs(id, operands.int, ip)?;
                let object = Object::new();
                let result = pairs
                    .into_iter()
                    .try_for_each(|(key, value)| match key {
                        Value::Str(key) => {
                            object.insert(key, value);
                            Ok(())
                        }
                        other => Err(Fault::InvalidKey(other.type_name())),
                    })
                    .map(|()| Value::object(object, self.guard));
                self.push_result(id, code, ip, result)?;
                Step::Next
            }
            Opcode::LoadFunction => {
                let closure = self.make_closure(id, operands.int, ip)?;
                self.push(id, closure)?;
                Step::Next
            }
            Opcode::LoadModule => {
                let result = self
                    .vm
                    .modules
                    .get(&Symbol::from(operands.str))
                    .copied()
                    .ok_or_else(|| Fault::UnknownModule(operands.str.to_string()));
                self.push_result(id, code, ip, result)?;
                Step::Next
            }
            Opcode::LoadName => {
                let result = self
                    .vm
                    .globals
                    .get(&Symbol::from(operands.str))
                    .copied()
                    .ok_or_else(|| Fault::UnknownName(operands.str.to_string()));
                self.push_result(id, code, ip, result)?;
                Step::Next
            }
            Opcode::LoadLocal => {
                let value = match self.local(id, operands.int, ip)? {
                    Local::Value(value) => *value,
                    Local::Cell(cell) => cell.load(self.guard).ok_or(ExecutionError::ValueFreed)?.get(),
                };
                self.push(id, value)?;
                Step::Next
            }
            Opcode::StoreLocal => {
                let value = self.pop(id)?;
                match self.local(id, operands.int, ip)? {
                    Local::Cell(cell) => {
                        cell.load(self.guard).ok_or(ExecutionError::ValueFreed)?.set(value);
                    }
                    Local::Value(_) => {
                        let slot = usize::try_from(operands.int)
                            .map_err(|_| ExecutionError::InvalidOperand { offset: ip })?;
                        self.frame_mut(id)?.locals[slot] = Local::Value(value);
                    }
                }
                Step::Next
            }
            Opcode::LoadCapture => {
                let index =
                    usize::try_from(operands.int).map_err(|_| ExecutionError::InvalidCapture { offset: ip })?;
                let cell = self.capture(id, index, ip)?;
                let value = cell.load(self.guard).ok_or(ExecutionError::ValueFreed)?.get();
                self.push(id, value)?;
                Step::Next
            }
            Opcode::StoreCapture => {
                let index =
                    usize::try_from(operands.int).map_err(|_| ExecutionError::InvalidCapture { offset: ip })?;
                let value = self.pop(id)?;
                let cell = self.capture(id, index, ip)?;
                cell.load(self.guard).ok_or(ExecutionError::ValueFreed)?.set(value);
                Step::Next
            }
            Opcode::Call | Opcode::New => {
                let count =
                    usize::try_from(operands.int).map_err(|_| ExecutionError::InvalidOperand { offset: ip })?;
                self.call(id, code, ip, count, op == Opcode::New)?
            }
            Opcode::Not | Opcode::Neg | Opcode::Pos | Opcode::TypeOf | Opcode::Inc | Opcode::Dec => {
                let operand = self.pop(id)?;
                let result = ops::unary(op, operand, self.guard);
                self.push_result(id, code, ip, result)?;
                Step::Next
            }
            Opcode::Mul
            | Opcode::Div
            | Opcode::Mod
            | Opcode::Add
            | Opcode::Sub
            | Opcode::Shl
            | Opcode::Shr
            | Opcode::BitAnd
            | Opcode::BitOr
            | Opcode::BitXor
            | Opcode::Lt
            | Opcode::Lte
            | Opcode::Gt
            | Opcode::Gte
            | Opcode::Eq
            | Opcode::Ne => {
                let rhs = self.pop(id)?;
                let lhs = self.pop(id)?;
                let result = ops::binary(op, lhs, rhs, self.guard);
                self.push_result(id, code, ip, result)?;
                Step::Next
            }
            Opcode::Index => {
                let key = self.pop(id)?;
                let target = self.pop(id)?;
                let result = ops::index(target, key, self.guard);
                self.push_result(id, code, ip, result)?;
                Step::Next
            }
            Opcode::SetIndex => {
                let value = self.pop(id)?;
                let key = self.pop(id)?;
                let target = self.pop(id)?;
                let result = ops::set_index(target, key, value, self.guard);
                self.push_result(id, code, ip, result)?;
                Step::Next
            }
            Opcode::Pluck => {
                let target = self.pop(id)?;
                let result = ops::attribute(
                    target,
                    SymbolRef::from(operands.str),
                    &self.vm.methods,
                    self.guard,
                );
                self.push_result(id, code, ip, result)?;
                Step::Next
            }
            Opcode::Jump => Step::Jump(operands.jump),
            Opcode::JumpIfFalse | Opcode::JumpIfTrue => {
                let condition = self.pop(id)?.truthy(self.guard);
                if condition == (op == Opcode::JumpIfTrue) {
                    Step::Jump(operands.jump)
                } else {
                    Step::Next
                }
            }
            Opcode::JumpIfFalseOrPop
            | Opcode::JumpIfTrueOrPop
            | Opcode::JumpIfNotNullOrPop
            | Opcode::JumpIfNotErrorOrPop => {
                let top = *self.top_mut(id)?;
                let keep = match op {
                    Opcode::JumpIfFalseOrPop => !top.truthy(self.guard),
                    Opcode::JumpIfTrueOrPop => top.truthy(self.guard),
                    Opcode::JumpIfNotNullOrPop => !top.is_null(),
                    _ => !top.is_error(),
                };
                if keep {
                    Step::Jump(operands.jump)
                } else {
                    self.pop(id)?;
                    Step::Next
                }
            }
            Opcode::Dup => {
                let top = *self.top_mut(id)?;
                self.push(id, top)?;
                Step::Next
            }
            Opcode::Rot2 => {
                self.rotate(id, 2)?;
                Step::Next
            }
            Opcode::Rot3 => {
                self.rotate(id, 3)?;
                Step::Next
            }
            Opcode::Rot4 => {
                self.rotate(id, 4)?;
                Step::Next
            }
            Opcode::Pop => {
                self.pop(id)?;
                Step::Next
            }
            Opcode::MakeClass => {
                let methods = self.pop_pairs(id, operands.int, ip)?;
                let result = self.make_class(operands.str, methods);
                self.push_result(id, code, ip, result)?;
                Step::Next
            }
            Opcode::ExtendClass => {
                let base = self.pop(id)?;
                let derived = self.pop(id)?;
                let result = match (derived, base) {
                    (_, Value::Error(_)) => Ok(base),
                    (Value::Class(derived_class), Value::Class(base_class)) => {
                        class::extend(derived_class, base_class, self.guard).map(|()| derived)
                    }
                    (Value::Class(_), other) => Err(Fault::InvalidBase(other.type_name())),
                    (other, _) => Err(Fault::InvalidOperand {
                        op: op.name(),
                        operand: other.type_name(),
                    }),
                };
                self.push_result(id, code, ip, result)?;
                Step::Next
            }
            Opcode::MakeEnum => {
                let pairs = self.pop_pairs(id, operands.int, ip)?;
                let result = pairs
                    .into_iter()
                    .map(|(name, value)| match name {
                        Value::Str(name) => Ok((name, value)),
                        other => Err(Fault::InvalidKey(other.type_name())),
                    })
                    .collect::<Result<Vec<_>, _>>()
                    .and_then(|members| class::make_enum(operands.str, &members, self.guard));
                self.push_result(id, code, ip, result)?;
                Step::Next
            }
            Opcode::MakeModule => {
                let pairs = self.pop_pairs(id, operands.int, ip)?;
                let module = Object::named(operands.str);
                let result = pairs
                    .into_iter()
                    .try_for_each(|(name, value)| match name {
                        Value::Str(name) => {
                            module.insert(name, value);
                            Ok(())
                        }
                        other => Err(Fault::InvalidKey(other.type_name())),
                    })
                    .map(|()| {
                        module.freeze();
                        Value::object(module, self.guard)
                    });
                self.push_result(id, code, ip, result)?;
                Step::Next
            }
            Opcode::StoreModule => {
                let module = self.pop(id)?;
                self.vm.modules.insert(Symbol::from(operands.str), module);
                Step::Next
            }
            Opcode::Await => {
                if let Value::Promise(promise) = *self.top_mut(id)? {
                    let (status, value) = promise
                        .load(self.guard)
                        .ok_or(ExecutionError::ValueFreed)?
                        .settled();
                    if status == PromiseStatus::Pending {
                        Step::Suspend(promise)
                    } else {
                        *self.top_mut(id)? = value;
                        Step::Next
                    }
                } else {
                    Step::Next
                }
            }
            Opcode::Return => {
                let frame = self.frame_mut(id)?;
                let value = frame
                    .stack
                    .pop()
                    .ok_or(ExecutionError::StackUnderflow { offset: ip })?;
                if !frame.stack.is_empty() {
                    return Err(ExecutionError::StackImbalance {
                        function: frame.code.name().to_string(),
                        depth: frame.stack.len(),
                    });
                }
                Step::Return(value)
            }
        };

        match step {
            Step::Jump(target) => {
                if target >= code.bytecode().len() {
                    return Err(ExecutionError::InvalidJump { offset: ip, target });
                }
                self.frame_mut(id)?.ip = target;
                Ok(Step::Next)
            }
            Step::Return(_) => Ok(step),
            other => {
                self.frame_mut(id)?.ip = reader.offset();
                Ok(other)
            }
        }
    }

    fn make_closure(&mut self, id: FrameId, index: i32, offset: usize) -> Result<Value, ExecutionError> {
        let template = usize::try_from(index)
            .ok()
            .and_then(|index| self.vm.functions.get(index))
            .cloned()
            .ok_or(ExecutionError::UnknownFunction(index))?;
        let mut captures = Vec::with_capacity(template.captures().len());
        for capture in template.captures() {
            let cell = match capture.source {
                CaptureSource::Local(slot) => match self.frame(id)?.locals.get(slot) {
                    Some(Local::Cell(cell)) => *cell,
                    _ => return Err(ExecutionError::InvalidCapture { offset }),
                },
                CaptureSource::Capture(index) => self.capture(id, index, offset)?,
            };
            captures.push(cell);
        }
        Ok(Value::Func(Ref::new(
            Function::new(template, captures),
            self.guard,
        )))
    }

    fn make_class(&mut self, name: &str, methods: Vec<(Value, Value)>) -> Result<Value, Fault> {
        let prototype = Object::new();
        for (method, function) in methods {
            let Value::Str(method) = method else {
                return Err(Fault::InvalidKey(method.type_name()));
            };
            prototype.insert(method, function);
        }
        let prototype = Ref::new(prototype, self.guard);
        Ok(Value::Class(Ref::new(Class::new(name, prototype), self.guard)))
    }

    fn call(
        &mut self,
        id: FrameId,
        code: &Code,
        offset: usize,
        count: usize,
        construct: bool,
    ) -> Result<Step, ExecutionError> {
        let args = self.pop_n(id, count)?;
        let callee = self.pop(id)?;
        match self.invoke(id, callee, args, construct)? {
            Ok(Invoked::Frame(callee)) => Ok(Step::Enter(callee)),
            Ok(Invoked::Value(value)) => {
                self.push(id, value)?;
                Ok(Step::Next)
            }
            Err(fault) => {
                let error = self.fault_value(code, offset, &fault);
                self.push(id, error)?;
                Ok(Step::Next)
            }
        }
    }

    fn invoke(
        &mut self,
        caller: FrameId,
        callee: Value,
        mut args: Vec<Value>,
        construct: bool,
    ) -> Result<Result<Invoked, Fault>, ExecutionError> {
        match callee {
            Value::Error(_) => Ok(Ok(Invoked::Value(callee))),
            Value::Class(class) => self.construct(caller, class, args),
            _ if construct => Ok(Err(Fault::NotAClass(callee.type_name()))),
            Value::Func(function) => {
                Ok(self.enter(Some(caller), function, args, None)?.map(Invoked::Frame))
            }
            Value::Method(method) => {
                let method = method.load(self.guard).ok_or(ExecutionError::ValueFreed)?;
                let function = method.function();
                args.insert(0, method.this());
                Ok(self.enter(Some(caller), function, args, None)?.map(Invoked::Frame))
            }
            Value::NativeFunc(function) => self.call_native(function, &args),
            Value::NativeMethod(method) => {
                let method = method.load(self.guard).ok_or(ExecutionError::ValueFreed)?;
                let function = method.function();
                args.insert(0, method.this());
                self.call_native(function, &args)
            }
            Value::Null
            | Value::Bool(_)
            | Value::Int(_)
            | Value::Num(_)
            | Value::Str(_)
            | Value::Array(_)
            | Value::Object(_)
            | Value::Instance(_)
            | Value::Enum(_)
            | Value::Promise(_) => Ok(Err(Fault::NotCallable(callee.type_name()))),
        }
    }

    fn call_native(
        &mut self,
        function: Ref<NativeFunction>,
        args: &[Value],
    ) -> Result<Result<Invoked, Fault>, ExecutionError> {
        let function = function
            .load(self.guard)
            .ok_or(ExecutionError::ValueFreed)?
            .clone();
        if let Arity::Fixed(expected) = function.arity() {
            if usize::from(expected) != args.len() {
                return Ok(Err(Fault::InvalidArity {
                    name: function.name().to_string(),
                    expected: usize::from(expected),
                    received: args.len(),
                }));
            }
        }
        Ok(function.invoke(self, args).map(Invoked::Value))
    }

    fn construct(
        &mut self,
        caller: FrameId,
        class: Ref<Class>,
        mut args: Vec<Value>,
    ) -> Result<Result<Invoked, Fault>, ExecutionError> {
        let instance = Value::Instance(Ref::new(Instance::new(class), self.guard));
        let init = match class::lookup(class, SymbolRef::from(Symbol::init_symbol()), self.guard) {
            Ok(init) => init,
            Err(fault) => return Ok(Err(fault)),
        };
        match init {
            Some(Value::Func(init)) => {
                args.insert(0, instance);
                Ok(self
                    .enter(Some(caller), init, args, Some(instance))?
                    .map(Invoked::Frame))
            }
            Some(other) => Ok(Err(Fault::InvalidInitializer(other.type_name()))),
            None if args.is_empty() => Ok(Ok(Invoked::Value(instance))),
            None => Ok(Err(Fault::InvalidArity {
                name: class
                    .load(self.guard)
                    .map(|class| class.name().to_string())
                    .unwrap_or_default(),
                expected: 0,
                received: args.len(),
            })),
        }
    }

    fn enter(
        &mut self,
        caller: Option<FrameId>,
        function: Ref<Function>,
        args: Vec<Value>,
        construct: Option<Value>,
    ) -> Result<Result<FrameId, Fault>, ExecutionError> {
        let code = function
            .load(self.guard)
            .ok_or(ExecutionError::ValueFreed)?
            .code()
            .clone();
        if code.params() != args.len() {
            return Ok(Err(Fault::InvalidArity {
                name: code.name().to_string(),
                expected: code.params(),
                received: args.len(),
            }));
        }
        if self.vm.frames.len() >= self.vm.max_depth {
            return Err(ExecutionError::StackOverflow);
        }

        let mut args = args.into_iter();
        let locals = code
            .locals()
            .iter()
            .map(|slot| {
                let value = args.next().unwrap_or_default();
                if slot.captured {
                    Local::Cell(Ref::new(Cell::new(value), self.guard))
                } else {
                    Local::Value(value)
                }
            })
            .collect();
        let promise = code
            .is_async()
            .then(|| Ref::new(Promise::pending(), self.guard));
        let id = FrameId(self.vm.frames.push(Frame {
            function,
            code,
            locals,
            stack: Vec::new(),
            ip: 0,
            caller,
            state: FrameState::Idle,
            promise,
            construct,
        }));
        Ok(Ok(id))
    }

    fn leave(
        &mut self,
        id: FrameId,
        value: Value,
    ) -> Result<(Option<FrameId>, Value), ExecutionError> {
        let frame = self
            .vm
            .frames
            .remove(id.0)
            .ok_or(ExecutionError::InvalidFrame)?;
        let mut result = frame.construct.unwrap_or(value);
        if let Some(promise) = frame.promise {
            self.settle(promise, result)?;
            result = Value::Promise(promise);
        }
        if let Some(caller) = frame.caller {
            self.push(caller, result)?;
        }
        Ok((frame.caller, result))
    }

    fn suspend(
        &mut self,
        id: FrameId,
        awaited: Ref<Promise>,
    ) -> Result<Option<FrameId>, ExecutionError> {
        let frame = self.frame_mut(id)?;
        let own = frame
            .promise
            .ok_or(ExecutionError::InvalidAwait { offset: frame.ip })?;
        frame.state = FrameState::Awaiting;
        let caller = frame.caller.take();
        awaited
            .load(self.guard)
            .ok_or(ExecutionError::ValueFreed)?
            .park(id);
        debug!(frame = ?id, "frame suspended");

        if let Some(caller) = caller {
            self.push(caller, Value::Promise(own))?;
        }
        Ok(caller)
    }
}

impl Deref for VmContext<'_, '_> {
    type Target = VmState;

    fn deref(&self) -> &Self::Target {
        &self.vm
    }
}

impl DerefMut for VmContext<'_, '_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.vm()
    }
}

/// A host-level error that no valid program can cause.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ExecutionError {
    /// An unknown opcode was encountered.
    InvalidOpcode {
        /// The offset of the opcode.
        offset: usize,
        /// The byte that was read.
        byte: u8,
    },
    /// An instruction's operands extend beyond the end of the code.
    TruncatedInstruction {
        /// The offset of the truncated operand.
        offset: usize,
    },
    /// A string operand is not valid UTF-8.
    InvalidString {
        /// The offset of the string.
        offset: usize,
    },
    /// An operand is out of range for its instruction.
    InvalidOperand {
        /// The offset of the instruction.
        offset: usize,
    },
    /// A jump targets an offset outside of the code.
    InvalidJump {
        /// The offset of the jump.
        offset: usize,
        /// The invalid target.
        target: usize,
    },
    /// A closure references a function template that does not exist.
    UnknownFunction(i32),
    /// A closure captures a variable that is not stored in a cell.
    InvalidCapture {
        /// The offset of the instruction.
        offset: usize,
    },
    /// An instruction popped more values than the stack held.
    StackUnderflow {
        /// The offset of the instruction.
        offset: usize,
    },
    /// A function returned with more than one value on its stack.
    StackImbalance {
        /// The name of the function.
        function: String,
        /// The number of values left behind.
        depth: usize,
    },
    /// The maximum call depth was exceeded.
    StackOverflow,
    /// A function that is not async awaited a pending promise.
    InvalidAwait {
        /// The offset of the instruction after the await.
        offset: usize,
    },
    /// The scheduler resumed a frame that was not awaiting a settled promise.
    InvalidResume,
    /// A frame id did not refer to a live frame.
    InvalidFrame,
    /// The entry point of a program must not take parameters.
    InvalidEntry {
        /// The number of parameters the code declares.
        params: usize,
    },
    /// A value was freed while still in use.
    ValueFreed,
}

impl From<ValueFreed> for ExecutionError {
    fn from(_: ValueFreed) -> Self {
        Self::ValueFreed
    }
}

impl Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionError::InvalidOpcode { offset, byte } => {
                write!(f, "invalid opcode {byte:#04x} at offset {offset}")
            }
            ExecutionError::TruncatedInstruction { offset } => {
                write!(f, "truncated instruction at offset {offset}")
            }
            ExecutionError::InvalidString { offset } => {
                write!(f, "invalid string operand at offset {offset}")
            }
            ExecutionError::InvalidOperand { offset } => {
                write!(f, "invalid operand at offset {offset}")
            }
            ExecutionError::InvalidJump { offset, target } => {
                write!(f, "jump at offset {offset} targets invalid offset {target}")
            }
            ExecutionError::UnknownFunction(index) => write!(f, "unknown function {index}"),
            ExecutionError::InvalidCapture { offset } => {
                write!(f, "invalid capture at offset {offset}")
            }
            ExecutionError::StackUnderflow { offset } => {
                write!(f, "stack underflow at offset {offset}")
            }
            ExecutionError::StackImbalance { function, depth } => write!(
                f,
                "{function} returned with {depth} extra values on its stack"
            ),
            ExecutionError::StackOverflow => f.write_str("maximum call depth exceeded"),
            ExecutionError::InvalidAwait { offset } => {
                write!(f, "await outside of an async function at offset {offset}")
            }
            ExecutionError::InvalidResume => {
                f.write_str("resumed a frame that was not awaiting a settled promise")
            }
            ExecutionError::InvalidFrame => f.write_str("invalid frame"),
            ExecutionError::InvalidEntry { params } => {
                write!(f, "entry point takes {params} parameters")
            }
            ExecutionError::ValueFreed => f.write_str("value freed"),
        }
    }
}

impl std::error::Error for ExecutionError {}

/// A runtime error raised by an operation.
///
/// Faults become error values carrying the location that raised them.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Fault {
    /// A binary operator does not support its operands.
    InvalidOperands {
        /// The operator.
        op: &'static str,
        /// The type of the left operand.
        lhs: &'static str,
        /// The type of the right operand.
        rhs: &'static str,
    },
    /// A unary operator does not support its operand.
    InvalidOperand {
        /// The operator.
        op: &'static str,
        /// The type of the operand.
        operand: &'static str,
    },
    /// A division or remainder by zero.
    DivideByZero,
    /// A shift by a negative count.
    NegativeShift,
    /// An index is outside of a collection.
    IndexOutOfBounds {
        /// The attempted index.
        index: i32,
        /// The length of the collection.
        length: usize,
    },
    /// An index is not an integer.
    InvalidIndex {
        /// The type being indexed.
        target: &'static str,
        /// The type of the index.
        key: &'static str,
    },
    /// An object key is not a string.
    InvalidKey(&'static str),
    /// A key is not present.
    KeyNotFound(String),
    /// A value cannot be indexed.
    NotIndexable(&'static str),
    /// An attribute is not present.
    UnknownAttribute {
        /// The type of the target.
        target: &'static str,
        /// The attribute name.
        name: String,
    },
    /// A value cannot be called.
    NotCallable(&'static str),
    /// `new` was used with a value that is not a class.
    NotAClass(&'static str),
    /// A class's `init` is not a function.
    InvalidInitializer(&'static str),
    /// A function was called with the wrong number of arguments.
    InvalidArity {
        /// The function name.
        name: String,
        /// The number of parameters.
        expected: usize,
        /// The number of arguments.
        received: usize,
    },
    /// A native function received an argument of the wrong type.
    InvalidArgument {
        /// The function name.
        function: &'static str,
        /// A description of the expected type.
        expected: &'static str,
        /// The type received.
        received: &'static str,
    },
    /// A module is not registered.
    UnknownModule(String),
    /// A global is not defined.
    UnknownName(String),
    /// `extends` was given a value that is not a class.
    InvalidBase(&'static str),
    /// A class would inherit from itself.
    CyclicInheritance,
    /// A frozen value was modified.
    Frozen(&'static str),
    /// An enum declares a member twice.
    DuplicateEnumMember(String),
    /// Two enum members share a value.
    DuplicateEnumValue(String),
    /// A value was freed while still in use.
    ValueFreed,
}

impl From<ValueFreed> for Fault {
    fn from(_: ValueFreed) -> Self {
        Self::ValueFreed
    }
}

impl Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fault::InvalidOperands { op, lhs, rhs } => {
                write!(f, "unsupported operand types for {op}: {lhs} and {rhs}")
            }
            Fault::InvalidOperand { op, operand } => {
                write!(f, "unsupported operand type for {op}: {operand}")
            }
            Fault::DivideByZero => f.write_str("division by zero"),
            Fault::NegativeShift => f.write_str("negative shift count"),
            Fault::IndexOutOfBounds { index, length } => {
                write!(f, "index out of bounds: {index} (length {length})")
            }
            Fault::InvalidIndex { target, key } => {
                write!(f, "{target} indices must be integers, not {key}")
            }
            Fault::InvalidKey(key) => write!(f, "keys must be strings, not {key}"),
            Fault::KeyNotFound(key) => write!(f, "key not found: {key}"),
            Fault::NotIndexable(target) => write!(f, "{target} is not indexable"),
            Fault::UnknownAttribute { target, name } => {
                write!(f, "{target} has no attribute {name}")
            }
            Fault::NotCallable(target) => write!(f, "{target} is not callable"),
            Fault::NotAClass(target) => write!(f, "{target} is not a class"),
            Fault::InvalidInitializer(kind) => write!(f, "init must be a function, not {kind}"),
            Fault::InvalidArity {
                name,
                expected,
                received,
            } => write!(
                f,
                "{name} expects {expected} arguments but received {received}"
            ),
            Fault::InvalidArgument {
                function,
                expected,
                received,
            } => write!(f, "{function} expects {expected}, not {received}"),
            Fault::UnknownModule(name) => write!(f, "unknown module: {name}"),
            Fault::UnknownName(name) => write!(f, "unknown name: {name}"),
            Fault::InvalidBase(kind) => write!(f, "cannot extend {kind}"),
            Fault::CyclicInheritance => f.write_str("cyclic inheritance"),
            Fault::Frozen(kind) => write!(f, "cannot modify frozen {kind}"),
            Fault::DuplicateEnumMember(name) => write!(f, "duplicate enum member: {name}"),
            Fault::DuplicateEnumValue(name) => write!(f, "duplicate enum value: {name}"),
            Fault::ValueFreed => f.write_str("value freed"),
        }
    }
}

impl std::error::Error for Fault {}

/// A compiled function body ready for execution.
///
/// Code is immutable and cheap to clone. Every closure created from the same
/// function template shares its code.
#[derive(Clone)]
pub struct Code {
    data: Arc<CodeData>,
}

/// The contents of a [`Code`].
#[derive(Debug)]
pub struct CodeData {
    /// The function name.
    pub name: Symbol,
    /// The source file name.
    pub file: Symbol,
    /// True for `async` functions.
    pub is_async: bool,
    /// The number of parameters, including an implicit `this`.
    pub params: usize,
    /// The instruction stream.
    pub bytecode: Vec<u8>,
    /// Source lines, sorted by instruction offset.
    pub lines: Vec<LineEntry>,
    /// The local variable slots. Parameters occupy the first slots.
    pub locals: Vec<LocalSlot>,
    /// The variables captured when a closure is created.
    pub captures: Vec<CaptureSlot>,
}

/// A local variable slot.
#[derive(Debug, Clone)]
pub struct LocalSlot {
    /// The declared name.
    pub name: Symbol,
    /// True if a nested function captures this slot, which stores it in a
    /// shared cell.
    pub captured: bool,
}

/// A captured variable.
#[derive(Debug, Clone)]
pub struct CaptureSlot {
    /// The captured name.
    pub name: Symbol,
    /// Where the cell is found when the closure is created.
    pub source: CaptureSource,
}

/// Where a closure finds a captured cell in the frame that creates it.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum CaptureSource {
    /// A local slot of the creating frame.
    Local(usize),
    /// A capture of the creating frame's function.
    Capture(usize),
}

impl Code {
    /// Returns code wrapping `data`.
    #[must_use]
    pub fn new(data: CodeData) -> Self {
        Self {
            data: Arc::new(data),
        }
    }

    /// Returns the function name.
    #[must_use]
    pub fn name(&self) -> &Symbol {
        &self.data.name
    }

    /// Returns the source file name.
    #[must_use]
    pub fn file(&self) -> &Symbol {
        &self.data.file
    }

    /// Returns true if this is an async function.
    #[must_use]
    pub fn is_async(&self) -> bool {
        self.data.is_async
    }

    /// Returns the number of parameters.
    #[must_use]
    pub fn params(&self) -> usize {
        self.data.params
    }

    /// Returns the instruction stream.
    #[must_use]
    pub fn bytecode(&self) -> &[u8] {
        &self.data.bytecode
    }

    /// Returns the local variable slots.
    #[must_use]
    pub fn locals(&self) -> &[LocalSlot] {
        &self.data.locals
    }

    /// Returns the captured variables.
    #[must_use]
    pub fn captures(&self) -> &[CaptureSlot] {
        &self.data.captures
    }

    /// Returns the source line of the instruction at `offset`.
    #[must_use]
    pub fn line_for(&self, offset: usize) -> usize {
        bytecode::line_for(&self.data.lines, offset)
    }

    /// Returns a listing of this code's instructions.
    #[must_use]
    pub fn disassemble(&self) -> String {
        let mut listing = String::new();
        // Writing to a String cannot fail.
        let _ = bytecode::disassemble(self, &mut listing);
        listing
    }
}

impl Debug for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Code")
            .field("name", self.name())
            .field("file", self.file())
            .field("params", &self.params())
            .field("bytes", &self.bytecode().len())
            .finish_non_exhaustive()
    }
}

impl PartialEq for Code {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }
}
