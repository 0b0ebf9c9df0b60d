//! Host functions available to every program, and the [`Module`] builder
//! used to register native modules.

use std::f64::consts::PI;

use kempt::Map;
use refuse::{CollectionGuard, Ref};

use crate::runtime::function::{Arity, NativeFn, NativeFunction};
use crate::runtime::object::Object;
use crate::runtime::symbol::Symbol;
use crate::runtime::value::Value;
use crate::vm::{Fault, VmContext};

type NativeFnPointer = fn(&mut VmContext<'_, '_>, &[Value]) -> Result<Value, Fault>;

/// A native module under construction.
///
/// Modules are registered by name before a program runs and are visible to
/// `import` statements. Once registered, a module is a frozen object.
#[must_use]
pub struct Module {
    name: Symbol,
    members: Vec<(Symbol, Member)>,
}

enum Member {
    Function(NativeFunction),
    Constant(Constant),
    Module(Module),
}

/// A constant value stored in a [`Module`].
#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    /// `null`
    Null,
    /// A boolean.
    Bool(bool),
    /// An integer.
    Int(i32),
    /// A float.
    Num(f64),
    /// A string.
    Str(Symbol),
}

impl From<bool> for Constant {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i32> for Constant {
    fn from(value: i32) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for Constant {
    fn from(value: f64) -> Self {
        Self::Num(value)
    }
}

impl From<&'_ str> for Constant {
    fn from(value: &'_ str) -> Self {
        Self::Str(Symbol::from(value))
    }
}

impl Module {
    /// Returns an empty module named `name`.
    pub fn new(name: impl Into<Symbol>) -> Self {
        Self {
            name: name.into(),
            members: Vec::new(),
        }
    }

    /// Returns the name of this module.
    #[must_use]
    pub const fn name(&self) -> &Symbol {
        &self.name
    }

    /// Adds a native function.
    pub fn with_function(
        mut self,
        name: impl Into<Symbol>,
        arity: Arity,
        function: impl NativeFn,
    ) -> Self {
        let name = name.into();
        self.members.push((
            name.clone(),
            Member::Function(NativeFunction::new(name, arity, function)),
        ));
        self
    }

    /// Adds a constant.
    pub fn with_constant(mut self, name: impl Into<Symbol>, value: impl Into<Constant>) -> Self {
        self.members
            .push((name.into(), Member::Constant(value.into())));
        self
    }

    /// Adds a nested namespace.
    pub fn with_module(mut self, module: Module) -> Self {
        self.members
            .push((module.name.clone(), Member::Module(module)));
        self
    }

    /// Allocates this module as a frozen object.
    pub fn build(self, guard: &CollectionGuard<'_>) -> Value {
        let object = Object::named(self.name);
        for (name, member) in self.members {
            let value = match member {
                Member::Function(function) => Value::NativeFunc(Ref::new(function, guard)),
                Member::Constant(Constant::Null) => Value::Null,
                Member::Constant(Constant::Bool(value)) => Value::Bool(value),
                Member::Constant(Constant::Int(value)) => Value::Int(value),
                Member::Constant(Constant::Num(value)) => Value::Num(value),
                Member::Constant(Constant::Str(value)) => Value::string(value),
                Member::Module(module) => module.build(guard),
            };
            object.insert(&name, value);
        }
        object.freeze();
        Value::object(object, guard)
    }
}

/// The native methods strings and arrays expose through attribute access.
pub struct NativeMethods {
    string: Map<Symbol, Ref<NativeFunction>>,
    array: Map<Symbol, Ref<NativeFunction>>,
}

impl NativeMethods {
    pub(crate) fn new(guard: &CollectionGuard<'_>) -> Self {
        let mut string = Map::new();
        let mut array = Map::new();
        let define = |table: &mut Map<Symbol, Ref<NativeFunction>>,
                          name: &str,
                          arity: u8,
                          function: NativeFnPointer| {
            let name = Symbol::from(name);
            table.insert(
                name.clone(),
                Ref::new(NativeFunction::new(name, Arity::Fixed(arity), function), guard),
            );
        };
        define(&mut string, "len", 1, len);
        define(&mut string, "upper", 1, |context, args| {
            Ok(Value::string(text_of("upper", context, args)?.to_uppercase()))
        });
        define(&mut string, "lower", 1, |context, args| {
            Ok(Value::string(text_of("lower", context, args)?.to_lowercase()))
        });
        define(&mut array, "len", 1, len);
        define(&mut array, "push", 2, push);
        define(&mut array, "pop", 1, |context, args| {
            let Some(Value::Array(array)) = args.first() else {
                return Err(invalid_argument("pop", "array", args));
            };
            Ok(array
                .load(context.guard())
                .ok_or(Fault::ValueFreed)?
                .pop()
                .unwrap_or_default())
        });
        Self { string, array }
    }

    /// Returns the string method named `name`.
    #[must_use]
    pub fn string(&self, name: &Symbol) -> Option<Ref<NativeFunction>> {
        self.string.get(name).copied()
    }

    /// Returns the array method named `name`.
    #[must_use]
    pub fn array(&self, name: &Symbol) -> Option<Ref<NativeFunction>> {
        self.array.get(name).copied()
    }

    pub(crate) fn trace(&self, tracer: &mut refuse::Tracer) {
        for function in self.string.values().chain(self.array.values()) {
            tracer.mark(*function);
        }
    }
}

fn invalid_argument(function: &'static str, expected: &'static str, args: &[Value]) -> Fault {
    Fault::InvalidArgument {
        function,
        expected,
        received: args.first().map_or("nothing", Value::type_name),
    }
}

fn count(length: usize) -> Value {
    i32::try_from(length).map_or_else(|_| Value::Num(length as f64), Value::Int)
}

fn text_of(
    function: &'static str,
    context: &VmContext<'_, '_>,
    args: &[Value],
) -> Result<String, Fault> {
    match args.first() {
        Some(Value::Str(text)) => Ok(text.try_load(context.guard())?.to_string()),
        _ => Err(invalid_argument(function, "string", args)),
    }
}

fn len(context: &mut VmContext<'_, '_>, args: &[Value]) -> Result<Value, Fault> {
    let guard = context.guard();
    match args.first() {
        Some(Value::Str(text)) => Ok(count(text.try_load(guard)?.chars().count())),
        Some(Value::Array(array)) => Ok(count(array.load(guard).ok_or(Fault::ValueFreed)?.len())),
        Some(Value::Object(object) | Value::Enum(object)) => {
            Ok(count(object.load(guard).ok_or(Fault::ValueFreed)?.len()))
        }
        _ => Err(invalid_argument("len", "string, array or object", args)),
    }
}

fn push(context: &mut VmContext<'_, '_>, args: &[Value]) -> Result<Value, Fault> {
    match args {
        [Value::Array(array), value] => Ok(count(
            array
                .load(context.guard())
                .ok_or(Fault::ValueFreed)?
                .push(*value),
        )),
        _ => Err(invalid_argument("push", "array", args)),
    }
}

fn number(function: &'static str, value: Option<&Value>) -> Result<f64, Fault> {
    value.and_then(Value::as_f64).ok_or(Fault::InvalidArgument {
        function,
        expected: "number",
        received: value.map_or("nothing", Value::type_name),
    })
}

/// Returns the global functions every program can call.
pub(crate) fn globals(guard: &CollectionGuard<'_>) -> Vec<(Symbol, Value)> {
    let mut globals = Vec::new();
    let mut define = |name: &str, arity: Arity, function: NativeFnPointer| {
        let name = Symbol::from(name);
        globals.push((
            name.clone(),
            Value::NativeFunc(Ref::new(NativeFunction::new(name, arity, function), guard)),
        ));
    };

    define("print", Arity::Variadic, |context, args| {
        let mut line = String::new();
        for (index, arg) in args.iter().enumerate() {
            if index > 0 {
                line.push(' ');
            }
            line.push_str(&arg.stringify(context.guard()));
        }
        context.print(&line);
        Ok(Value::Null)
    });
    define("len", Arity::Fixed(1), len);
    define("str", Arity::Fixed(1), |context, args| {
        Ok(Value::string(args[0].stringify(context.guard())))
    });
    define("push", Arity::Fixed(2), push);
    define("error", Arity::Fixed(1), |context, args| {
        let message = args[0].stringify(context.guard());
        Ok(Value::error(message, context.guard()))
    });
    define("is_error", Arity::Fixed(1), |_context, args| {
        Ok(Value::Bool(args[0].is_error()))
    });
    define("defer", Arity::Fixed(1), |context, args| Ok(context.defer(args[0])));

    globals
}

/// Returns the `math` module.
pub fn math() -> Module {
    Module::new("math")
        .with_constant("pi", PI)
        .with_function("abs", Arity::Fixed(1), |_context, args| match args[0] {
            Value::Int(value) => Ok(value
                .checked_abs()
                .map_or_else(|| Value::Num(f64::from(value).abs()), Value::Int)),
            other => Ok(Value::Num(number("abs", Some(&other))?.abs())),
        })
        .with_function("floor", Arity::Fixed(1), |_context, args| {
            Ok(Value::narrowed(number("floor", args.first())?.floor()))
        })
        .with_function("sqrt", Arity::Fixed(1), |_context, args| {
            Ok(Value::narrowed(number("sqrt", args.first())?.sqrt()))
        })
        .with_function("min", Arity::Fixed(2), |_context, args| {
            let (a, b) = (number("min", args.first())?, number("min", args.get(1))?);
            Ok(if b < a { args[1] } else { args[0] })
        })
        .with_function("max", Arity::Fixed(2), |_context, args| {
            let (a, b) = (number("max", args.first())?, number("max", args.get(1))?);
            Ok(if b > a { args[1] } else { args[0] })
        })
}

#[cfg(test)]
mod tests {
    use refuse::CollectionGuard;

    use super::{math, Module};
    use crate::runtime::value::Value;

    #[test]
    fn modules_are_frozen() {
        let guard = CollectionGuard::acquire();
        let module = Module::new("config")
            .with_constant("debug", true)
            .with_module(Module::new("paths").with_constant("root", "/"));
        let Value::Object(object) = module.build(&guard) else {
            unreachable!("modules build into objects")
        };
        let object = object.load(&guard).unwrap();
        assert!(object.is_frozen());
        assert_eq!(object.get("debug"), Some(Value::Bool(true)));
        assert!(matches!(object.get("paths"), Some(Value::Object(_))));
    }

    #[test]
    fn math_constants() {
        let guard = CollectionGuard::acquire();
        let Value::Object(object) = math().build(&guard) else {
            unreachable!("modules build into objects")
        };
        let object = object.load(&guard).unwrap();
        assert_eq!(object.get("pi"), Some(Value::Num(std::f64::consts::PI)));
        assert!(matches!(object.get("sqrt"), Some(Value::NativeFunc(_))));
    }
}
