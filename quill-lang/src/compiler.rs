//! The quill compiler.
//!
//! The compiler walks the syntax tree once and emits one [`Code`] per
//! function. Nested functions are registered in the virtual machine's
//! function table, and the enclosing function loads them by index.

use std::fmt::Display;

use kempt::Map;
use serde::{Deserialize, Serialize};

pub mod syntax;

use syntax::{
    AssignTarget, Assignment, BinaryKind, ClassDefinition, CompareKind, EnumDefinition,
    Expression, ForLoop, FunctionCall, FunctionDefinition, Import, LogicalKind,
    ModuleDefinition, Ranged, SourceCode, SourceRange, Statement, SwitchStatement, UnaryKind,
    Update,
};

use crate::runtime::symbol::Symbol;
use crate::vm::bytecode::{Argument, BytecodeBuilder, EncodeError, Opcode, PatchSite};
use crate::vm::{CaptureSlot, CaptureSource, Code, CodeData, LocalSlot, VmState};

/// The maximum number of arguments a call may pass.
pub const MAX_ARGUMENTS: usize = 255;

/// A quill compiler instance.
pub struct Compiler<'a, 'vm> {
    vm: &'vm mut VmState,
    source: SourceCode<'a>,
    file: Symbol,
    functions: Vec<FunctionState>,
    compiled: Vec<Code>,
    errors: Vec<Ranged<Error>>,
}

struct FunctionState {
    name: Symbol,
    is_async: bool,
    params: usize,
    code: BytecodeBuilder,
    locals: Vec<LocalSlot>,
    captures: Vec<CaptureSlot>,
    scopes: Vec<Map<Symbol, usize>>,
    breakables: Vec<Breakable>,
}

impl FunctionState {
    fn new(name: Symbol, is_async: bool) -> Self {
        Self {
            name,
            is_async,
            params: 0,
            code: BytecodeBuilder::default(),
            locals: Vec::new(),
            captures: Vec::new(),
            scopes: vec![Map::new()],
            breakables: Vec::new(),
        }
    }
}

struct Breakable {
    is_loop: bool,
    continue_target: Option<usize>,
    breaks: Vec<PatchSite>,
    continues: Vec<PatchSite>,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum Binding {
    Local(usize),
    Capture(usize),
}

enum Place {
    Binding(Binding),
    Keyed,
}

/// Where a statement appears, which decides the declarations it may make.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum Context {
    Program,
    Module,
    Nested,
}

impl<'a, 'vm> Compiler<'a, 'vm> {
    /// Returns a compiler for `source` that registers functions in `vm`.
    pub fn new(source: impl Into<SourceCode<'a>>, vm: &'vm mut VmState) -> Self {
        let source = source.into();
        Self {
            vm,
            file: Symbol::from(source.name),
            source,
            functions: Vec::new(),
            compiled: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// Compiles `source` into an implicit `main` function.
    pub fn compile(
        source: impl Into<SourceCode<'a>>,
        vm: &'vm mut VmState,
    ) -> Result<Code, Vec<Ranged<Error>>> {
        Self::new(source, vm).build()
    }

    /// Parses and compiles the source into an implicit `main` function.
    ///
    /// Nested functions are only registered with the virtual machine if the
    /// entire source compiles.
    ///
    /// # Errors
    ///
    /// Returns every error found in the source.
    pub fn build(mut self) -> Result<Code, Vec<Ranged<Error>>> {
        let program = syntax::parse(self.source.code).map_err(|err| vec![err.into()])?;

        self.functions
            .push(FunctionState::new(Symbol::main_symbol().clone(), false));
        let result = self.hidden_local("<result>");
        for statement in &program {
            self.hoist(statement);
        }
        let (functions, statements): (Vec<_>, Vec<_>) = program
            .iter()
            .partition(|statement| matches!(statement.0, Statement::Function(_)));
        for statement in functions.into_iter().chain(statements) {
            self.compile_statement(statement, Context::Program, Some(result));
        }
        self.load(Binding::Local(result), SourceRange::default());
        self.emit(Opcode::Return);

        let Some(main) = self.functions.pop() else {
            return Err(std::mem::take(&mut self.errors));
        };
        if !self.errors.is_empty() {
            return Err(self.errors);
        }
        for code in self.compiled {
            self.vm.push_function(code);
        }
        Ok(finish(main, &self.file))
    }

    fn current(&mut self) -> &mut FunctionState {
        let last = self.functions.len() - 1;
        &mut self.functions[last]
    }

    fn error(&mut self, range: SourceRange, error: Error) {
        self.errors.push(Ranged::new(range, error));
    }

    fn mark(&mut self, range: SourceRange) {
        let (line, _) = self.source.line_column(range.start);
        self.current().code.set_line(line);
    }

    fn emit(&mut self, op: Opcode) {
        self.current().code.emit(op);
    }

    fn emit_int(&mut self, op: Opcode, value: i32) {
        self.current().code.emit_int(op, value);
    }

    fn emit_count(&mut self, op: Opcode, count: usize, range: SourceRange) {
        match i32::try_from(count) {
            Ok(count) => self.emit_int(op, count),
            Err(_) => self.error(range, Error::TooManyValues),
        }
    }

    fn emit_str(&mut self, op: Opcode, text: &str, range: SourceRange) {
        if let Err(err) = self.current().code.emit_str(op, text) {
            self.error(range, err.into());
        }
    }

    fn emit_jump(&mut self, op: Opcode) -> PatchSite {
        self.current().code.emit_jump(op)
    }

    fn jump_to(&mut self, op: Opcode, target: usize, range: SourceRange) {
        if let Err(err) = self.current().code.emit_jump_to(op, target) {
            self.error(range, err.into());
        }
    }

    fn patch(&mut self, site: PatchSite, target: usize, range: SourceRange) {
        if let Err(err) = self.current().code.patch(site, target) {
            self.error(range, err.into());
        }
    }

    fn patch_here(&mut self, site: PatchSite, range: SourceRange) {
        let here = self.offset();
        self.patch(site, here, range);
    }

    fn offset(&mut self) -> usize {
        self.current().code.offset()
    }

    fn enter_scope(&mut self) {
        self.current().scopes.push(Map::new());
    }

    fn exit_scope(&mut self) {
        self.current().scopes.pop();
    }

    fn hidden_local(&mut self, name: &str) -> usize {
        let function = self.current();
        function.locals.push(LocalSlot {
            name: Symbol::from(name),
            captured: false,
        });
        function.locals.len() - 1
    }

    /// Declares `name` in the innermost scope, reusing its slot if it was
    /// already declared there.
    fn declare(&mut self, name: &Symbol) -> usize {
        let function = self.current();
        if let Some(slot) = function.scopes.last().and_then(|scope| scope.get(name)) {
            return *slot;
        }
        let slot = function.locals.len();
        function.locals.push(LocalSlot {
            name: name.clone(),
            captured: false,
        });
        if let Some(scope) = function.scopes.last_mut() {
            scope.insert(name.clone(), slot);
        }
        slot
    }

    fn resolve(&mut self, name: &Symbol) -> Option<Binding> {
        self.resolve_in(self.functions.len() - 1, name)
    }

    fn resolve_in(&mut self, depth: usize, name: &Symbol) -> Option<Binding> {
        let function = &self.functions[depth];
        if let Some(slot) = function
            .scopes
            .iter()
            .rev()
            .find_map(|scope| scope.get(name).copied())
        {
            return Some(Binding::Local(slot));
        }
        if let Some(index) = function
            .captures
            .iter()
            .position(|capture| &capture.name == name)
        {
            return Some(Binding::Capture(index));
        }

        let outer = depth.checked_sub(1)?;
        let source = match self.resolve_in(outer, name)? {
            Binding::Local(slot) => {
                self.functions[outer].locals[slot].captured = true;
                CaptureSource::Local(slot)
            }
            Binding::Capture(index) => CaptureSource::Capture(index),
        };
        let captures = &mut self.functions[depth].captures;
        captures.push(CaptureSlot {
            name: name.clone(),
            source,
        });
        Some(Binding::Capture(captures.len() - 1))
    }

    fn load(&mut self, binding: Binding, range: SourceRange) {
        match binding {
            Binding::Local(slot) => self.emit_count(Opcode::LoadLocal, slot, range),
            Binding::Capture(index) => self.emit_count(Opcode::LoadCapture, index, range),
        }
    }

    fn store(&mut self, binding: Binding, range: SourceRange) {
        match binding {
            Binding::Local(slot) => self.emit_count(Opcode::StoreLocal, slot, range),
            Binding::Capture(index) => self.emit_count(Opcode::StoreCapture, index, range),
        }
    }

    fn resolve_assignable(&mut self, name: &Symbol, range: SourceRange) -> Option<Binding> {
        let binding = self.resolve(name);
        if binding.is_none() {
            let error = if self.vm.is_global(name) {
                Error::AssignToGlobal(name.clone())
            } else {
                Error::Unresolved(name.clone())
            };
            self.error(range, error);
        }
        binding
    }

    /// Declares the names a program-level statement introduces so that every
    /// function in the program can refer to them.
    fn hoist(&mut self, statement: &Ranged<Statement>) {
        let name = match &statement.0 {
            Statement::Var(var) => &var.name.0,
            Statement::Function(function) => match &function.name {
                Some(name) => &name.0,
                None => return,
            },
            Statement::Class(class) => &class.name.0,
            Statement::Enum(definition) => &definition.name.0,
            Statement::Module(module) => &module.name.0,
            Statement::Import(import) => &import.binding().0,
            _ => return,
        };
        self.declare(name);
    }

    #[allow(clippy::too_many_lines)]
    fn compile_statement(
        &mut self,
        statement: &Ranged<Statement>,
        context: Context,
        result: Option<usize>,
    ) {
        let range = statement.range();
        self.mark(range);
        if context == Context::Module
            && !matches!(
                statement.0,
                Statement::Var(_) | Statement::Function(_) | Statement::Empty
            )
        {
            self.error(range, Error::InvalidModuleMember);
            return;
        }

        match &statement.0 {
            Statement::Expression(expression) => {
                self.compile_expression(expression);
                match (context, result) {
                    (Context::Program, Some(result)) => {
                        self.emit_count(Opcode::StoreLocal, result, range);
                    }
                    _ => self.emit(Opcode::Pop),
                }
            }
            Statement::Var(var) => {
                let slot = self.declare(&var.name);
                match &var.value {
                    Some(value) => self.compile_expression(value),
                    None => self.emit(Opcode::LoadNull),
                }
                self.store(Binding::Local(slot), range);
            }
            Statement::Function(function) => {
                if context == Context::Nested {
                    self.error(range, Error::FunctionNotAllowed);
                    return;
                }
                let Some(name) = &function.name else {
                    return;
                };
                let slot = self.declare(name);
                self.compile_function(function, range, false);
                self.store(Binding::Local(slot), range);
            }
            Statement::Class(class) => self.compile_class(class, range),
            Statement::Enum(definition) => self.compile_enum(definition, range),
            Statement::Module(module) => {
                if context == Context::Program {
                    self.compile_module(module, range);
                } else {
                    self.error(range, Error::ModuleNotAllowed);
                }
            }
            Statement::Import(import) => self.compile_import(import, range),
            Statement::Block(statements) => {
                self.enter_scope();
                for statement in statements {
                    self.compile_statement(statement, Context::Nested, None);
                }
                self.exit_scope();
            }
            Statement::If(if_statement) => {
                self.compile_expression(&if_statement.condition);
                let when_false = self.emit_jump(Opcode::JumpIfFalse);
                self.compile_scoped(&if_statement.when_true);
                if let Some(otherwise) = &if_statement.when_false {
                    let end = self.emit_jump(Opcode::Jump);
                    self.patch_here(when_false, range);
                    self.compile_scoped(otherwise);
                    self.patch_here(end, range);
                } else {
                    self.patch_here(when_false, range);
                }
            }
            Statement::While(while_loop) => {
                let top = self.offset();
                self.compile_expression(&while_loop.condition);
                let exit = self.emit_jump(Opcode::JumpIfFalse);
                self.enter_breakable(true, Some(top));
                self.compile_scoped(&while_loop.body);
                self.jump_to(Opcode::Jump, top, range);
                self.patch_here(exit, range);
                self.exit_breakable(range);
            }
            Statement::DoWhile(while_loop) => {
                let top = self.offset();
                self.enter_breakable(true, None);
                self.compile_scoped(&while_loop.body);
                self.patch_continues(range);
                self.compile_expression(&while_loop.condition);
                self.jump_to(Opcode::JumpIfTrue, top, range);
                self.exit_breakable(range);
            }
            Statement::For(for_loop) => self.compile_for(for_loop, range),
            Statement::Switch(switch) => self.compile_switch(switch, range),
            Statement::Break => {
                let site = self.emit_jump(Opcode::Jump);
                match self.current().breakables.last_mut() {
                    Some(breakable) => breakable.breaks.push(site),
                    None => self.error(range, Error::BreakOutsideLoop),
                }
            }
            Statement::Continue => {
                let Some((index, target)) = self
                    .current()
                    .breakables
                    .iter()
                    .enumerate()
                    .rfind(|(_, breakable)| breakable.is_loop)
                    .map(|(index, breakable)| (index, breakable.continue_target))
                else {
                    self.error(range, Error::ContinueOutsideLoop);
                    return;
                };
                if let Some(target) = target {
                    self.jump_to(Opcode::Jump, target, range);
                } else {
                    let site = self.emit_jump(Opcode::Jump);
                    self.current().breakables[index].continues.push(site);
                }
            }
            Statement::Return(value) => {
                match value {
                    Some(value) => self.compile_expression(value),
                    None => self.emit(Opcode::LoadNull),
                }
                self.emit(Opcode::Return);
            }
            Statement::Empty => {}
        }
    }

    fn compile_scoped(&mut self, statement: &Ranged<Statement>) {
        self.enter_scope();
        self.compile_statement(statement, Context::Nested, None);
        self.exit_scope();
    }

    fn enter_breakable(&mut self, is_loop: bool, continue_target: Option<usize>) {
        self.current().breakables.push(Breakable {
            is_loop,
            continue_target,
            breaks: Vec::new(),
            continues: Vec::new(),
        });
    }

    fn patch_continues(&mut self, range: SourceRange) {
        let here = self.offset();
        let continues = self
            .current()
            .breakables
            .last_mut()
            .map(|breakable| std::mem::take(&mut breakable.continues))
            .unwrap_or_default();
        for site in continues {
            self.patch(site, here, range);
        }
    }

    fn exit_breakable(&mut self, range: SourceRange) {
        if let Some(breakable) = self.current().breakables.pop() {
            for site in breakable.breaks {
                self.patch_here(site, range);
            }
        }
    }

    fn compile_for(&mut self, for_loop: &ForLoop, range: SourceRange) {
        self.enter_scope();
        if let Some(initializer) = &for_loop.initializer {
            self.compile_statement(initializer, Context::Nested, None);
        }
        let top = self.offset();
        let exit = for_loop.condition.as_ref().map(|condition| {
            self.compile_expression(condition);
            self.emit_jump(Opcode::JumpIfFalse)
        });
        self.enter_breakable(true, None);
        self.compile_scoped(&for_loop.body);
        self.patch_continues(range);
        if let Some(step) = &for_loop.step {
            self.compile_expression(step);
            self.emit(Opcode::Pop);
        }
        self.jump_to(Opcode::Jump, top, range);
        if let Some(exit) = exit {
            self.patch_here(exit, range);
        }
        self.exit_breakable(range);
        self.exit_scope();
    }

    fn compile_switch(&mut self, switch: &SwitchStatement, range: SourceRange) {
        let subject = self.hidden_local("<switch>");
        self.compile_expression(&switch.subject);
        self.store(Binding::Local(subject), range);

        let mut entries = Vec::with_capacity(switch.cases.len());
        for case in &switch.cases {
            if let Some(value) = &case.value {
                self.load(Binding::Local(subject), range);
                self.compile_expression(value);
                self.emit(Opcode::Eq);
                entries.push(Some(self.emit_jump(Opcode::JumpIfTrue)));
            } else {
                entries.push(None);
            }
        }
        let fallback = self.emit_jump(Opcode::Jump);
        let mut default = None;

        self.enter_breakable(false, None);
        self.enter_scope();
        for (case, entry) in switch.cases.iter().zip(entries) {
            match entry {
                Some(site) => self.patch_here(site, range),
                None => default = Some(self.offset()),
            }
            for statement in &case.body {
                self.compile_statement(statement, Context::Nested, None);
            }
        }
        self.exit_scope();
        match default {
            Some(default) => self.patch(fallback, default, range),
            None => self.patch_here(fallback, range),
        }
        self.exit_breakable(range);
    }

    fn compile_class(&mut self, class: &ClassDefinition, range: SourceRange) {
        let slot = self.declare(&class.name);
        for method in &class.methods {
            let Some(name) = &method.name else {
                continue;
            };
            self.emit_str(Opcode::LoadStr, name, method.range());
            self.compile_function(method, method.range(), true);
        }
        self.mark(range);
        self.emit_named(Opcode::MakeClass, &class.name, class.methods.len(), range);
        if let Some(base) = &class.base {
            self.compile_expression(base);
            self.emit(Opcode::ExtendClass);
        }
        self.store(Binding::Local(slot), range);
    }

    fn compile_enum(&mut self, definition: &EnumDefinition, range: SourceRange) {
        let slot = self.declare(&definition.name);
        let mut next = Some(0_i32);
        for variant in &definition.variants {
            self.emit_str(Opcode::LoadStr, &variant.name, variant.name.range());
            match &variant.value {
                Some(value) => {
                    if let Expression::Int(explicit) = value.0 {
                        next = explicit.checked_add(1);
                    }
                    self.compile_expression(value);
                }
                None => {
                    let Some(value) = next else {
                        self.error(variant.name.range(), Error::TooManyValues);
                        continue;
                    };
                    self.emit_int(Opcode::LoadInt, value);
                    next = value.checked_add(1);
                }
            }
        }
        self.mark(range);
        self.emit_named(Opcode::MakeEnum, &definition.name, definition.variants.len(), range);
        self.store(Binding::Local(slot), range);
    }

    fn emit_named(&mut self, op: Opcode, name: &str, count: usize, range: SourceRange) {
        let Ok(count) = i32::try_from(count) else {
            self.error(range, Error::TooManyValues);
            return;
        };
        let result = self
            .current()
            .code
            .emit_with(op, &[Argument::Str(name), Argument::Int(count)]);
        if let Err(err) = result {
            self.error(range, err.into());
        }
    }

    fn compile_module(&mut self, module: &ModuleDefinition, range: SourceRange) {
        let slot = self.declare(&module.name);
        self.enter_scope();
        let mut members = Vec::new();
        for statement in &module.body {
            let name = match &statement.0 {
                Statement::Var(var) => Some(&var.name),
                Statement::Function(function) => function.name.as_ref(),
                _ => None,
            };
            if let Some(name) = name {
                let member = self.declare(name);
                if !members.iter().any(|(existing, _)| existing == &name.0) {
                    members.push((name.0.clone(), member));
                }
            }
        }
        for statement in &module.body {
            self.compile_statement(statement, Context::Module, None);
        }
        self.exit_scope();

        self.mark(range);
        for (name, member) in &members {
            self.emit_str(Opcode::LoadStr, name, range);
            self.load(Binding::Local(*member), range);
        }
        self.emit_named(Opcode::MakeModule, &module.name, members.len(), range);
        self.emit(Opcode::Dup);
        self.emit_str(Opcode::StoreModule, &module.name, range);
        self.store(Binding::Local(slot), range);
    }

    fn compile_import(&mut self, import: &Import, range: SourceRange) {
        let slot = self.declare(import.binding());
        self.emit_str(Opcode::LoadModule, &import.module, range);
        self.store(Binding::Local(slot), range);
    }

    /// Compiles `function` into its own code and emits the instruction that
    /// creates a closure of it.
    fn compile_function(&mut self, function: &FunctionDefinition, range: SourceRange, method: bool) {
        let name = function
            .name
            .as_ref()
            .map_or_else(|| Symbol::from("<anonymous>"), |name| name.0.clone());
        self.functions
            .push(FunctionState::new(name, function.is_async));
        if method {
            self.declare(Symbol::this_symbol());
        }
        for parameter in &function.parameters {
            if self
                .current()
                .scopes
                .last()
                .is_some_and(|scope| scope.contains(&parameter.0))
            {
                self.error(parameter.range(), Error::DuplicateParameter(parameter.0.clone()));
            }
            self.declare(parameter);
        }
        let params = self.current().locals.len();
        self.current().params = params;

        for statement in &function.body {
            self.compile_statement(statement, Context::Nested, None);
        }
        self.mark(range);
        self.emit(Opcode::LoadNull);
        self.emit(Opcode::Return);

        let Some(state) = self.functions.pop() else {
            return;
        };
        self.compiled.push(finish(state, &self.file));
        let index = self.vm.functions().len() + self.compiled.len() - 1;
        self.mark(range);
        self.emit_count(Opcode::LoadFunction, index, range);
    }

    #[allow(clippy::too_many_lines)]
    fn compile_expression(&mut self, expression: &Ranged<Expression>) {
        let range = expression.range();
        self.mark(range);
        match &expression.0 {
            Expression::Null => self.emit(Opcode::LoadNull),
            Expression::Bool(true) => self.emit(Opcode::LoadTrue),
            Expression::Bool(false) => self.emit(Opcode::LoadFalse),
            Expression::Int(value) => self.emit_int(Opcode::LoadInt, *value),
            Expression::Num(value) => self.current().code.emit_num(Opcode::LoadNum, *value),
            Expression::String(text) => self.emit_str(Opcode::LoadStr, text, range),
            Expression::Array(elements) => {
                for element in elements {
                    self.compile_expression(element);
                }
                self.emit_count(Opcode::MakeArray, elements.len(), range);
            }
            Expression::Object(fields) => {
                for field in fields {
                    self.emit_str(Opcode::LoadStr, &field.key, field.key.range());
                    self.compile_expression(&field.value);
                }
                self.emit_count(Opcode::MakeObject, fields.len(), range);
            }
            Expression::Identifier(name) => {
                if let Some(binding) = self.resolve(name) {
                    self.load(binding, range);
                } else if self.vm.is_global(name) {
                    self.emit_str(Opcode::LoadName, name, range);
                } else {
                    self.error(range, Error::Unresolved(name.clone()));
                }
            }
            Expression::This => match self.resolve(Symbol::this_symbol()) {
                Some(binding) => self.load(binding, range),
                None => self.error(range, Error::ThisOutsideMethod),
            },
            Expression::Function(function) => self.compile_function(function, range, false),
            Expression::Unary(unary) => {
                self.compile_expression(&unary.operand);
                self.emit(match unary.kind {
                    UnaryKind::Not => Opcode::Not,
                    UnaryKind::Negate => Opcode::Neg,
                    UnaryKind::Positive => Opcode::Pos,
                    UnaryKind::TypeOf => Opcode::TypeOf,
                });
            }
            Expression::Binary(binary) => {
                self.compile_expression(&binary.left);
                self.compile_expression(&binary.right);
                self.mark(range);
                self.emit(binary_opcode(binary.kind));
            }
            Expression::Logical(logical) => {
                self.compile_expression(&logical.left);
                let end = self.emit_jump(match logical.kind {
                    LogicalKind::And => Opcode::JumpIfFalseOrPop,
                    LogicalKind::Or => Opcode::JumpIfTrueOrPop,
                    LogicalKind::Coalesce => Opcode::JumpIfNotNullOrPop,
                    LogicalKind::Catch => Opcode::JumpIfNotErrorOrPop,
                });
                self.compile_expression(&logical.right);
                self.patch_here(end, range);
            }
            Expression::Conditional(conditional) => {
                self.compile_expression(&conditional.condition);
                let when_false = self.emit_jump(Opcode::JumpIfFalse);
                self.compile_expression(&conditional.when_true);
                let end = self.emit_jump(Opcode::Jump);
                self.patch_here(when_false, range);
                self.compile_expression(&conditional.when_false);
                self.patch_here(end, range);
            }
            Expression::Assign(assignment) => self.compile_assignment(assignment, range),
            Expression::Update(update) => self.compile_update(update, range),
            Expression::Call(call) => self.compile_call(call, Opcode::Call, range),
            Expression::New(call) => self.compile_call(call, Opcode::New, range),
            Expression::Index(index) => {
                self.compile_expression(&index.target);
                self.compile_expression(&index.index);
                self.mark(range);
                self.emit(Opcode::Index);
            }
            Expression::Attribute(attribute) => {
                self.compile_expression(&attribute.target);
                self.mark(range);
                self.emit_str(Opcode::Pluck, &attribute.name, range);
            }
            Expression::Await(awaited) => {
                if !self.current().is_async {
                    self.error(range, Error::AwaitOutsideAsync);
                }
                self.compile_expression(awaited);
                self.mark(range);
                self.emit(Opcode::Await);
            }
        }
    }

    fn compile_call(&mut self, call: &FunctionCall, op: Opcode, range: SourceRange) {
        self.compile_expression(&call.function);
        for argument in &call.arguments {
            self.compile_expression(argument);
        }
        if call.arguments.len() > MAX_ARGUMENTS {
            self.error(range, Error::TooManyArguments);
            return;
        }
        self.mark(range);
        self.emit_count(op, call.arguments.len(), range);
    }

    /// Compiles the target of an assignment. Keyed targets leave the target
    /// and its key on the stack.
    fn compile_place(&mut self, target: &Ranged<AssignTarget>) -> Option<Place> {
        match &target.0 {
            AssignTarget::Identifier(name) => self
                .resolve_assignable(name, target.range())
                .map(Place::Binding),
            AssignTarget::Index(index) => {
                self.compile_expression(&index.target);
                self.compile_expression(&index.index);
                Some(Place::Keyed)
            }
            AssignTarget::Attribute(attribute) => {
                self.compile_expression(&attribute.target);
                self.emit_str(Opcode::LoadStr, &attribute.name, attribute.name.range());
                Some(Place::Keyed)
            }
        }
    }

    /// Turns `[target key]` into `[target key target key]`.
    fn duplicate_pair(&mut self) {
        for op in [
            Opcode::Rot2,
            Opcode::Dup,
            Opcode::Rot3,
            Opcode::Rot2,
            Opcode::Dup,
            Opcode::Rot3,
        ] {
            self.emit(op);
        }
    }

    fn compile_assignment(&mut self, assignment: &Assignment, range: SourceRange) {
        let Some(place) = self.compile_place(&assignment.target) else {
            return;
        };
        match place {
            Place::Binding(binding) => {
                if let Some(operator) = assignment.operator {
                    self.load(binding, range);
                    self.compile_expression(&assignment.value);
                    self.mark(range);
                    self.emit(binary_opcode(operator));
                } else {
                    self.compile_expression(&assignment.value);
                }
                self.emit(Opcode::Dup);
                self.store(binding, range);
            }
            Place::Keyed => {
                if let Some(operator) = assignment.operator {
                    self.duplicate_pair();
                    self.emit(Opcode::Index);
                    self.compile_expression(&assignment.value);
                    self.mark(range);
                    self.emit(binary_opcode(operator));
                } else {
                    self.compile_expression(&assignment.value);
                }
                self.mark(range);
                self.emit(Opcode::SetIndex);
            }
        }
    }

    fn compile_update(&mut self, update: &Update, range: SourceRange) {
        let Some(place) = self.compile_place(&update.target) else {
            return;
        };
        let step = if update.increment {
            Opcode::Inc
        } else {
            Opcode::Dec
        };
        self.mark(range);
        match place {
            Place::Binding(binding) => {
                self.load(binding, range);
                if update.prefix {
                    self.emit(step);
                    self.emit(Opcode::Dup);
                } else {
                    self.emit(Opcode::Dup);
                    self.emit(step);
                }
                self.store(binding, range);
            }
            Place::Keyed => {
                self.duplicate_pair();
                self.emit(Opcode::Index);
                if update.prefix {
                    self.emit(step);
                    self.emit(Opcode::SetIndex);
                } else {
                    self.emit(Opcode::Dup);
                    self.emit(Opcode::Rot4);
                    self.emit(step);
                    self.emit(Opcode::SetIndex);
                    self.emit(Opcode::Pop);
                }
            }
        }
    }
}

fn finish(state: FunctionState, file: &Symbol) -> Code {
    let (bytecode, lines) = state.code.finish();
    Code::new(CodeData {
        name: state.name,
        file: file.clone(),
        is_async: state.is_async,
        params: state.params,
        bytecode,
        lines,
        locals: state.locals,
        captures: state.captures,
    })
}

fn binary_opcode(kind: BinaryKind) -> Opcode {
    match kind {
        BinaryKind::Add => Opcode::Add,
        BinaryKind::Subtract => Opcode::Sub,
        BinaryKind::Multiply => Opcode::Mul,
        BinaryKind::Divide => Opcode::Div,
        BinaryKind::Remainder => Opcode::Mod,
        BinaryKind::ShiftLeft => Opcode::Shl,
        BinaryKind::ShiftRight => Opcode::Shr,
        BinaryKind::BitwiseAnd => Opcode::BitAnd,
        BinaryKind::BitwiseOr => Opcode::BitOr,
        BinaryKind::BitwiseXor => Opcode::BitXor,
        BinaryKind::Compare(CompareKind::LessThan) => Opcode::Lt,
        BinaryKind::Compare(CompareKind::LessThanOrEqual) => Opcode::Lte,
        BinaryKind::Compare(CompareKind::GreaterThan) => Opcode::Gt,
        BinaryKind::Compare(CompareKind::GreaterThanOrEqual) => Opcode::Gte,
        BinaryKind::Compare(CompareKind::Equal) => Opcode::Eq,
        BinaryKind::Compare(CompareKind::NotEqual) => Opcode::Ne,
    }
}

/// A compilation error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// A syntax error occurred.
    Syntax(syntax::Error),
    /// A name is not declared in any enclosing scope and is not a global.
    Unresolved(Symbol),
    /// A global builtin cannot be reassigned.
    AssignToGlobal(Symbol),
    /// Named functions may only be declared at the top level of a program or
    /// module.
    FunctionNotAllowed,
    /// Modules may only be declared at the top level of a program.
    ModuleNotAllowed,
    /// Modules may only contain `var` and `function` declarations.
    InvalidModuleMember,
    /// `break` outside of a loop or switch.
    BreakOutsideLoop,
    /// `continue` outside of a loop.
    ContinueOutsideLoop,
    /// `this` outside of a class method.
    ThisOutsideMethod,
    /// `await` outside of an async function.
    AwaitOutsideAsync,
    /// A parameter name was repeated.
    DuplicateParameter(Symbol),
    /// A call passes more than [`MAX_ARGUMENTS`] arguments.
    TooManyArguments,
    /// A count or slot does not fit in an operand.
    TooManyValues,
    /// A string literal contains a NUL character.
    NulInString,
    /// A function's bytecode exceeds the addressable size.
    FunctionTooLarge,
}

impl From<EncodeError> for Error {
    fn from(err: EncodeError) -> Self {
        match err {
            EncodeError::NulInString => Self::NulInString,
            EncodeError::OffsetTooLarge | EncodeError::OperandMismatch(_) => {
                Self::FunctionTooLarge
            }
        }
    }
}

impl crate::ErrorKind for Error {
    fn kind(&self) -> &'static str {
        match self {
            Error::Syntax(err) => err.kind(),
            Error::Unresolved(_) => "unresolved name",
            Error::AssignToGlobal(_) => "assign to global",
            Error::FunctionNotAllowed => "function not allowed",
            Error::ModuleNotAllowed => "module not allowed",
            Error::InvalidModuleMember => "invalid module member",
            Error::BreakOutsideLoop => "break outside loop",
            Error::ContinueOutsideLoop => "continue outside loop",
            Error::ThisOutsideMethod => "this outside method",
            Error::AwaitOutsideAsync => "await outside async",
            Error::DuplicateParameter(_) => "duplicate parameter",
            Error::TooManyArguments => "too many arguments",
            Error::TooManyValues => "too many values",
            Error::NulInString => "nul in string",
            Error::FunctionTooLarge => "function too large",
        }
    }
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Syntax(err) => Display::fmt(err, f),
            Error::Unresolved(name) => write!(f, "`{name}` is not declared"),
            Error::AssignToGlobal(name) => write!(f, "the builtin `{name}` cannot be reassigned"),
            Error::FunctionNotAllowed => f.write_str(
                "named functions may only be declared at the top level of a program or module",
            ),
            Error::ModuleNotAllowed => {
                f.write_str("modules may only be declared at the top level of a program")
            }
            Error::InvalidModuleMember => {
                f.write_str("modules may only contain var and function declarations")
            }
            Error::BreakOutsideLoop => f.write_str("break outside of a loop or switch"),
            Error::ContinueOutsideLoop => f.write_str("continue outside of a loop"),
            Error::ThisOutsideMethod => f.write_str("this outside of a class method"),
            Error::AwaitOutsideAsync => f.write_str("await outside of an async function"),
            Error::DuplicateParameter(name) => write!(f, "duplicate parameter `{name}`"),
            Error::TooManyArguments => {
                write!(f, "no more than {MAX_ARGUMENTS} arguments may be passed")
            }
            Error::TooManyValues => f.write_str("too many values"),
            Error::NulInString => f.write_str("strings cannot contain NUL characters"),
            Error::FunctionTooLarge => f.write_str("function body is too large"),
        }
    }
}

impl From<Ranged<syntax::Error>> for Ranged<Error> {
    fn from(err: Ranged<syntax::Error>) -> Self {
        err.map(Error::Syntax)
    }
}

#[cfg(test)]
mod tests {
    use refuse::CollectionGuard;

    use super::Error;
    use crate::vm::Vm;

    fn compile_errors(source: &str) -> Vec<Error> {
        let mut guard = CollectionGuard::acquire();
        let vm = Vm::new(&guard);
        vm.compile(source, &mut guard)
            .expect_err("compilation should fail")
            .into_iter()
            .map(|err| err.0)
            .collect()
    }

    #[test]
    fn unresolved_names() {
        assert_eq!(
            compile_errors("var a = 1; b + a; c;"),
            [
                Error::Unresolved("b".into()),
                Error::Unresolved("c".into())
            ]
        );
    }

    #[test]
    fn builtins_are_read_only() {
        assert_eq!(
            compile_errors("print = 1;"),
            [Error::AssignToGlobal("print".into())]
        );
    }

    #[test]
    fn declaration_placement() {
        assert_eq!(
            compile_errors("if (true) { function f() {} }"),
            [Error::FunctionNotAllowed]
        );
        assert_eq!(
            compile_errors("function f() { module m {} }"),
            [Error::ModuleNotAllowed]
        );
        assert_eq!(
            compile_errors("module m { print(1); }"),
            [Error::InvalidModuleMember]
        );
    }

    #[test]
    fn control_flow_placement() {
        assert_eq!(compile_errors("break;"), [Error::BreakOutsideLoop]);
        assert_eq!(
            compile_errors("switch (1) { case 1: continue; }"),
            [Error::ContinueOutsideLoop]
        );
        assert_eq!(compile_errors("this;"), [Error::ThisOutsideMethod]);
        assert_eq!(
            compile_errors("function f(p) { await p; }"),
            [Error::AwaitOutsideAsync]
        );
        assert_eq!(
            compile_errors("function f(a, a) {}"),
            [Error::DuplicateParameter("a".into())]
        );
    }

    #[test]
    fn nul_in_strings() {
        assert_eq!(compile_errors(r#"var s = "a\0b";"#), [Error::NulInString]);
    }

    #[test]
    fn failed_builds_register_nothing() {
        let mut guard = CollectionGuard::acquire();
        let vm = Vm::new(&guard);
        assert!(vm
            .compile("function f() { return g; }", &mut guard)
            .is_err());
        let mut context = vm.context(&mut guard);
        assert!(context.vm().functions().is_empty());
    }

    #[test]
    fn closures_capture_through_nesting() {
        let mut guard = CollectionGuard::acquire();
        let vm = Vm::new(&guard);
        let code = vm
            .compile(
                "function outer() { var a = 1; return function () { return function () { return a; }; }; }",
                &mut guard,
            )
            .unwrap();
        let mut context = vm.context(&mut guard);
        let functions = context.vm().functions();
        // Functions are registered innermost first.
        assert_eq!(functions.len(), 3);
        assert_eq!(functions[0].captures().len(), 1);
        assert_eq!(functions[1].captures().len(), 1);
        assert!(functions[2].locals()[0].captured);
        assert!(code.locals().iter().any(|slot| slot.name == "outer"));
    }
}
