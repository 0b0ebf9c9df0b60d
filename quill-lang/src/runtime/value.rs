//! The dynamically typed [`Value`] and the rules shared by every operation on
//! it: truthiness, equality, hashing and conversion to text.

use std::fmt::{Debug, Write};
use std::hash::{Hash, Hasher};

use ahash::AHasher;
use refuse::{CollectionGuard, Ref, Trace};

use crate::runtime::class::{Class, Instance};
use crate::runtime::exception::Exception;
use crate::runtime::function::{BoundMethod, BoundNative, Function, NativeFunction};
use crate::runtime::object::{Array, Object};
use crate::runtime::promise::{Promise, PromiseStatus};
use crate::runtime::symbol::SymbolRef;

/// Structural comparisons and text conversion stop descending after this many
/// nested containers.
const MAX_DEPTH: usize = 64;

/// A value in the virtual machine.
///
/// Scalars are stored inline. Every other kind is a handle into the garbage
/// collector, which makes `Value` cheap to copy. Two copies of a handle refer
/// to the same underlying value.
#[derive(Default, Clone, Copy)]
pub enum Value {
    /// The absence of a value.
    #[default]
    Null,
    /// A boolean.
    Bool(bool),
    /// A 32-bit signed integer.
    Int(i32),
    /// A 64-bit floating point number.
    Num(f64),
    /// An interned string.
    Str(SymbolRef),
    /// A growable list of values.
    Array(Ref<Array>),
    /// A string-keyed collection of values, ordered by insertion.
    Object(Ref<Object>),
    /// A compiled function bound to its captured variables.
    Func(Ref<Function>),
    /// A function implemented by the host.
    NativeFunc(Ref<NativeFunction>),
    /// A compiled function bound to a `this` value.
    Method(Ref<BoundMethod>),
    /// A host function bound to a `this` value.
    NativeMethod(Ref<BoundNative>),
    /// A class.
    Class(Ref<Class>),
    /// An instance of a class.
    Instance(Ref<Instance>),
    /// A frozen set of named constants.
    Enum(Ref<Object>),
    /// A runtime error.
    Error(Ref<Exception>),
    /// The eventual result of an async function.
    Promise(Ref<Promise>),
}

impl Value {
    /// Returns a string value.
    pub fn string(value: impl Into<SymbolRef>) -> Self {
        Self::Str(value.into())
    }

    /// Allocates a new array containing `values`.
    #[must_use]
    pub fn array(values: Vec<Value>, guard: &CollectionGuard<'_>) -> Self {
        Self::Array(Ref::new(Array::new(values), guard))
    }

    /// Allocates a new, empty object.
    #[must_use]
    pub fn object(object: Object, guard: &CollectionGuard<'_>) -> Self {
        Self::Object(Ref::new(object, guard))
    }

    /// Allocates a new error value with `message`.
    pub fn error(message: impl Into<String>, guard: &CollectionGuard<'_>) -> Self {
        Self::Error(Ref::new(Exception::new(message), guard))
    }

    /// Returns true if this value is [`Value::Null`].
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Returns true if this value is an [`Value::Error`].
    #[must_use]
    pub const fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    /// Returns true if this value is an `Int` or a `Num`.
    #[must_use]
    pub const fn is_numeric(&self) -> bool {
        matches!(self, Self::Int(_) | Self::Num(_))
    }

    /// Returns this value as an integer, if it is an `Int` or a `Num` that
    /// holds an exact 32-bit integer.
    #[must_use]
    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::Int(value) => Some(*value),
            Value::Num(value) => exact_i32(*value),
            _ => None,
        }
    }

    /// Returns this value as a float if it is numeric.
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(value) => Some(f64::from(*value)),
            Value::Num(value) => Some(*value),
            _ => None,
        }
    }

    /// Returns `value` as an `Int` when it holds an exact 32-bit integer, and
    /// as a `Num` otherwise.
    #[must_use]
    pub fn narrowed(value: f64) -> Self {
        exact_i32(value).map_or(Value::Num(value), Value::Int)
    }

    /// Returns the name of this value's type, as reported by `typeof`.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Num(_) => "number",
            Value::Str(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
            Value::Func(_) | Value::NativeFunc(_) | Value::Method(_) | Value::NativeMethod(_) => {
                "function"
            }
            Value::Class(_) => "class",
            Value::Instance(_) => "instance",
            Value::Enum(_) => "enum",
            Value::Error(_) => "error",
            Value::Promise(_) => "promise",
        }
    }

    /// Returns true if this value is considered true in a boolean context.
    ///
    /// `null`, `false`, zero, `NaN`, the empty string and errors are falsey.
    #[must_use]
    pub fn truthy(&self, guard: &CollectionGuard<'_>) -> bool {
        match self {
            Value::Null | Value::Error(_) => false,
            Value::Bool(value) => *value,
            Value::Int(value) => *value != 0,
            Value::Num(value) => *value != 0. && !value.is_nan(),
            Value::Str(value) => value.load(guard).map_or(false, |s| !s.is_empty()),
            Value::Array(_)
            | Value::Object(_)
            | Value::Func(_)
            | Value::NativeFunc(_)
            | Value::Method(_)
            | Value::NativeMethod(_)
            | Value::Class(_)
            | Value::Instance(_)
            | Value::Enum(_)
            | Value::Promise(_) => true,
        }
    }

    /// Returns true if `self` and `other` are the same value: equal scalars,
    /// the same interned string or handles to the same allocation.
    #[must_use]
    pub fn is_same(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Num(a), Value::Num(b)) => a.to_bits() == b.to_bits(),
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Object(a), Value::Object(b)) | (Value::Enum(a), Value::Enum(b)) => a == b,
            (Value::Func(a), Value::Func(b)) => a == b,
            (Value::NativeFunc(a), Value::NativeFunc(b)) => a == b,
            (Value::Method(a), Value::Method(b)) => a == b,
            (Value::NativeMethod(a), Value::NativeMethod(b)) => a == b,
            (Value::Class(a), Value::Class(b)) => a == b,
            (Value::Instance(a), Value::Instance(b)) => a == b,
            (Value::Error(a), Value::Error(b)) => a == b,
            (Value::Promise(a), Value::Promise(b)) => a == b,
            _ => false,
        }
    }

    /// Compares two values for equality, as the `==` operator does.
    ///
    /// Numbers compare by value regardless of representation. Arrays and
    /// objects compare structurally. Errors compare by message. Every other
    /// composite value compares by identity.
    #[must_use]
    pub fn equals(&self, other: &Self, guard: &CollectionGuard<'_>) -> bool {
        self.equals_at_depth(other, guard, 0)
    }

    fn equals_at_depth(&self, other: &Self, guard: &CollectionGuard<'_>, depth: usize) -> bool {
        if self.is_same(other) {
            return true;
        }
        match (self, other) {
            (Value::Int(_) | Value::Num(_), Value::Int(_) | Value::Num(_)) => {
                self.as_f64() == other.as_f64()
            }
            (Value::Array(a), Value::Array(b)) if depth < MAX_DEPTH => {
                let (Some(a), Some(b)) = (a.load(guard), b.load(guard)) else {
                    return false;
                };
                let (a, b) = (a.to_vec(), b.to_vec());
                a.len() == b.len()
                    && a.iter()
                        .zip(&b)
                        .all(|(a, b)| a.equals_at_depth(b, guard, depth + 1))
            }
            (Value::Object(a), Value::Object(b)) if depth < MAX_DEPTH => {
                if self.hash(guard) != other.hash(guard) {
                    return false;
                }
                let (Some(a), Some(b)) = (a.load(guard), b.load(guard)) else {
                    return false;
                };
                let (a, b) = (a.entries(), b.entries());
                a.len() == b.len()
                    && a.iter().all(|(key, value)| {
                        b.iter().any(|(other_key, other_value)| {
                            key == other_key && value.equals_at_depth(other_value, guard, depth + 1)
                        })
                    })
            }
            (Value::Error(a), Value::Error(b)) => match (a.load(guard), b.load(guard)) {
                (Some(a), Some(b)) => a.message() == b.message(),
                _ => false,
            },
            _ => false,
        }
    }

    /// Returns a hash of this value that is consistent with
    /// [`equals`](Self::equals).
    #[must_use]
    pub fn hash(&self, guard: &CollectionGuard<'_>) -> u64 {
        let mut hasher = AHasher::default();
        self.hash_into(guard, &mut hasher, 0);
        hasher.finish()
    }

    fn hash_into(&self, guard: &CollectionGuard<'_>, hasher: &mut AHasher, depth: usize) {
        match self {
            Value::Int(_) | Value::Num(_) => {
                0_u8.hash(hasher);
                if let Some(int) = self.as_i32() {
                    int.hash(hasher);
                } else if let Some(float) = self.as_f64() {
                    float.to_bits().hash(hasher);
                }
            }
            Value::Null => 1_u8.hash(hasher),
            Value::Bool(value) => value.hash(hasher),
            Value::Str(value) => value.hash(hasher),
            Value::Array(array) => {
                2_u8.hash(hasher);
                if let Some(array) = array.load(guard).filter(|_| depth < MAX_DEPTH) {
                    for value in array.to_vec() {
                        value.hash_into(guard, hasher, depth + 1);
                    }
                }
            }
            Value::Object(object) => {
                3_u8.hash(hasher);
                if let Some(object) = object.load(guard).filter(|_| depth < MAX_DEPTH) {
                    // Field order does not participate in equality.
                    let mut combined = 0_u64;
                    for (key, value) in object.entries() {
                        let mut field = AHasher::default();
                        key.hash(&mut field);
                        value.hash_into(guard, &mut field, depth + 1);
                        combined ^= field.finish();
                    }
                    combined.hash(hasher);
                }
            }
            Value::Error(error) => {
                4_u8.hash(hasher);
                if let Some(error) = error.load(guard) {
                    error.message().hash(hasher);
                }
            }
            Value::Func(r) => r.hash(hasher),
            Value::NativeFunc(r) => r.hash(hasher),
            Value::Method(r) => r.hash(hasher),
            Value::NativeMethod(r) => r.hash(hasher),
            Value::Class(r) => r.hash(hasher),
            Value::Instance(r) => r.hash(hasher),
            Value::Enum(r) => r.hash(hasher),
            Value::Promise(r) => r.hash(hasher),
        }
    }

    /// Converts this value to the text `print` and `str` produce.
    #[must_use]
    pub fn stringify(&self, guard: &CollectionGuard<'_>) -> String {
        let mut out = String::new();
        let mut path = Vec::new();
        self.write_into(&mut out, guard, &mut path, false);
        out
    }

    fn write_into(
        &self,
        out: &mut String,
        guard: &CollectionGuard<'_>,
        path: &mut Vec<Value>,
        quoted: bool,
    ) {
        match self {
            Value::Null => out.push_str("null"),
            Value::Bool(value) => {
                let _ = write!(out, "{value}");
            }
            Value::Int(value) => {
                let _ = write!(out, "{value}");
            }
            Value::Num(value) => {
                let _ = write!(out, "{value}");
            }
            Value::Str(value) => {
                let value = value.load(guard).unwrap_or_default();
                if quoted {
                    let _ = write!(out, "{value:?}");
                } else {
                    out.push_str(value);
                }
            }
            Value::Array(array) => {
                if path.iter().any(|seen| seen.is_same(self)) || path.len() >= MAX_DEPTH {
                    out.push_str("[...]");
                    return;
                }
                let values = array.load(guard).map(Array::to_vec).unwrap_or_default();
                path.push(*self);
                out.push('[');
                for (index, value) in values.iter().enumerate() {
                    if index > 0 {
                        out.push_str(", ");
                    }
                    value.write_into(out, guard, path, true);
                }
                out.push(']');
                path.pop();
            }
            Value::Object(object) | Value::Enum(object) => {
                if path.iter().any(|seen| seen.is_same(self)) || path.len() >= MAX_DEPTH {
                    out.push_str("{...}");
                    return;
                }
                let Some(object) = object.load(guard) else {
                    out.push_str("{}");
                    return;
                };
                if let Some(name) = object.name() {
                    let _ = write!(out, "{name} ");
                }
                let entries = object.entries();
                path.push(*self);
                out.push('{');
                for (index, (key, value)) in entries.iter().enumerate() {
                    if index > 0 {
                        out.push(',');
                    }
                    let _ = write!(out, " {}: ", key.load(guard).unwrap_or_default());
                    value.write_into(out, guard, path, true);
                }
                if !entries.is_empty() {
                    out.push(' ');
                }
                out.push('}');
                path.pop();
            }
            Value::Func(function) => {
                let name = function.load(guard).map(|f| f.code().name().clone());
                let _ = write!(out, "<function {}>", name.as_deref().unwrap_or("?"));
            }
            Value::NativeFunc(function) => {
                let name = function.load(guard).map(|f| f.name().clone());
                let _ = write!(out, "<native function {}>", name.as_deref().unwrap_or("?"));
            }
            Value::Method(method) => {
                let name = method
                    .load(guard)
                    .and_then(|m| m.function().load(guard))
                    .map(|f| f.code().name().clone());
                let _ = write!(out, "<method {}>", name.as_deref().unwrap_or("?"));
            }
            Value::NativeMethod(method) => {
                let name = method
                    .load(guard)
                    .and_then(|m| m.function().load(guard))
                    .map(|f| f.name().clone());
                let _ = write!(out, "<native method {}>", name.as_deref().unwrap_or("?"));
            }
            Value::Class(class) => {
                let name = class.load(guard).map(|c| c.name().clone());
                let _ = write!(out, "<class {}>", name.as_deref().unwrap_or("?"));
            }
            Value::Instance(instance) => {
                let Some(instance) = instance.load(guard) else {
                    out.push_str("<instance>");
                    return;
                };
                let name = instance.class().load(guard).map(|c| c.name().clone());
                let _ = write!(out, "<{} instance>", name.as_deref().unwrap_or("?"));
            }
            Value::Error(error) => {
                let message = error.load(guard).map(|e| e.message().to_string());
                let _ = write!(out, "error: {}", message.unwrap_or_default());
            }
            Value::Promise(promise) => match promise.load(guard).map(Promise::settled) {
                Some((PromiseStatus::Pending, _)) | None => out.push_str("<promise pending>"),
                Some((PromiseStatus::Fulfilled, value)) => {
                    out.push_str("<promise fulfilled: ");
                    value.write_into(out, guard, path, true);
                    out.push('>');
                }
                Some((PromiseStatus::Rejected, value)) => {
                    out.push_str("<promise rejected: ");
                    value.write_into(out, guard, path, true);
                    out.push('>');
                }
            },
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.is_same(other)
    }
}

impl Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => f.write_str("Null"),
            Value::Bool(value) => f.debug_tuple("Bool").field(value).finish(),
            Value::Int(value) => f.debug_tuple("Int").field(value).finish(),
            Value::Num(value) => f.debug_tuple("Num").field(value).finish(),
            Value::Str(value) => f.debug_tuple("Str").field(value).finish(),
            other => write!(f, "{}(..)", other.type_name()),
        }
    }
}

impl Trace for Value {
    const MAY_CONTAIN_REFERENCES: bool = true;

    fn trace(&self, tracer: &mut refuse::Tracer) {
        match self {
            Value::Null | Value::Bool(_) | Value::Int(_) | Value::Num(_) => {}
            Value::Str(value) => value.trace(tracer),
            Value::Array(r) => tracer.mark(*r),
            Value::Object(r) | Value::Enum(r) => tracer.mark(*r),
            Value::Func(r) => tracer.mark(*r),
            Value::NativeFunc(r) => tracer.mark(*r),
            Value::Method(r) => tracer.mark(*r),
            Value::NativeMethod(r) => tracer.mark(*r),
            Value::Class(r) => tracer.mark(*r),
            Value::Instance(r) => tracer.mark(*r),
            Value::Error(r) => tracer.mark(*r),
            Value::Promise(r) => tracer.mark(*r),
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Num(value)
    }
}

/// Returns `value` as an `i32` if it is an exact, finite integer in range.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn exact_i32(value: f64) -> Option<i32> {
    if value.fract() == 0.
        && value >= f64::from(i32::MIN)
        && value <= f64::from(i32::MAX)
        && !(value == 0. && value.is_sign_negative())
    {
        Some(value as i32)
    } else {
        None
    }
}

/// A value was freed by the garbage collector while still being referenced.
///
/// Values reachable from a virtual machine are never freed, so this is only
/// observable through handles kept outside of one.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ValueFreed;

#[cfg(test)]
mod tests {
    use refuse::CollectionGuard;

    use super::{exact_i32, Value};
    use crate::runtime::object::Object;

    #[test]
    fn truthiness() {
        let guard = CollectionGuard::acquire();
        assert!(!Value::Null.truthy(&guard));
        assert!(!Value::Int(0).truthy(&guard));
        assert!(!Value::Num(f64::NAN).truthy(&guard));
        assert!(!Value::string("").truthy(&guard));
        assert!(!Value::error("boom", &guard).truthy(&guard));
        assert!(Value::string("a").truthy(&guard));
        assert!(Value::array(Vec::new(), &guard).truthy(&guard));
    }

    #[test]
    fn structural_equality() {
        let guard = CollectionGuard::acquire();
        let a = Value::array(vec![Value::Int(1), Value::string("x")], &guard);
        let b = Value::array(vec![Value::Num(1.0), Value::string("x")], &guard);
        assert!(a.equals(&b, &guard));
        assert!(!a.is_same(&b));

        let first = Object::new();
        first.insert("a", Value::Int(1));
        first.insert("b", Value::Int(2));
        let second = Object::new();
        second.insert("b", Value::Int(2));
        second.insert("a", Value::Int(1));
        let first = Value::object(first, &guard);
        let second = Value::object(second, &guard);
        assert!(first.equals(&second, &guard));
        assert_eq!(first.hash(&guard), second.hash(&guard));
    }

    #[test]
    fn stringify_handles_cycles() {
        let guard = CollectionGuard::acquire();
        let array = Value::array(vec![Value::Int(1)], &guard);
        let Value::Array(handle) = array else {
            unreachable!()
        };
        handle.load(&guard).unwrap().push(array);
        assert_eq!(array.stringify(&guard), "[1, [...]]");
        assert_eq!(
            Value::array(vec![Value::string("a"), Value::Num(0.5)], &guard).stringify(&guard),
            "[\"a\", 0.5]"
        );
    }

    #[test]
    fn narrowing() {
        assert_eq!(exact_i32(3.0), Some(3));
        assert_eq!(exact_i32(2_147_483_648.0), None);
        assert_eq!(exact_i32(0.5), None);
        assert_eq!(Value::narrowed(-4.0), Value::Int(-4));
    }
}
