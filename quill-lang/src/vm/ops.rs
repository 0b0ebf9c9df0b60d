//! Operation handlers: the dynamically typed semantics behind each opcode
//! family.
//!
//! Every handler is total over [`Value`]. Unsupported combinations return a
//! [`Fault`], which the dispatch loop turns into an error value. When an
//! operand already is an error value, that error is the result.

use std::cmp::Ordering;

use refuse::{CollectionGuard, Ref};

use crate::runtime::builtins::NativeMethods;
use crate::runtime::class;
use crate::runtime::function::{BoundMethod, BoundNative};
use crate::runtime::symbol::SymbolRef;
use crate::runtime::value::Value;
use crate::vm::bytecode::Opcode;
use crate::vm::Fault;

macro_rules! propagate_errors {
    ($($value:expr),+) => {
        $(if $value.is_error() {
            return Ok($value);
        })+
    };
}

/// Applies the binary operator `op`.
pub fn binary(
    op: Opcode,
    lhs: Value,
    rhs: Value,
    guard: &CollectionGuard<'_>,
) -> Result<Value, Fault> {
    propagate_errors!(lhs, rhs);
    match op {
        Opcode::Add => add(lhs, rhs, guard),
        Opcode::Sub => sub(lhs, rhs),
        Opcode::Mul => mul(lhs, rhs),
        Opcode::Div => div(lhs, rhs),
        Opcode::Mod => rem(lhs, rhs),
        Opcode::Shl => shl(lhs, rhs),
        Opcode::Shr => shr(lhs, rhs),
        Opcode::BitAnd => bitwise(op, lhs, rhs, |a, b| a & b),
        Opcode::BitOr => bitwise(op, lhs, rhs, |a, b| a | b),
        Opcode::BitXor => bitwise(op, lhs, rhs, |a, b| a ^ b),
        Opcode::Eq => Ok(Value::Bool(lhs.equals(&rhs, guard))),
        Opcode::Ne => Ok(Value::Bool(!lhs.equals(&rhs, guard))),
        Opcode::Lt | Opcode::Lte | Opcode::Gt | Opcode::Gte => compare(op, lhs, rhs, guard),
        _ => Err(Fault::InvalidOperands {
            op: op.name(),
            lhs: lhs.type_name(),
            rhs: rhs.type_name(),
        }),
    }
}

/// Applies the unary operator `op`.
pub fn unary(op: Opcode, operand: Value, guard: &CollectionGuard<'_>) -> Result<Value, Fault> {
    match op {
        Opcode::Not => return Ok(Value::Bool(!operand.truthy(guard))),
        Opcode::TypeOf => return Ok(Value::string(operand.type_name())),
        _ => {}
    }
    propagate_errors!(operand);
    match (op, operand) {
        (Opcode::Neg, Value::Int(value)) => Ok(value
            .checked_neg()
            .map_or_else(|| Value::Num(-f64::from(value)), Value::Int)),
        (Opcode::Neg, Value::Num(value)) => Ok(Value::Num(-value)),
        (Opcode::Pos, Value::Int(_) | Value::Num(_)) => Ok(operand),
        (Opcode::Inc, _) => binary(Opcode::Add, operand, Value::Int(1), guard),
        (Opcode::Dec, _) => binary(Opcode::Sub, operand, Value::Int(1), guard),
        _ => Err(Fault::InvalidOperand {
            op: op.name(),
            operand: operand.type_name(),
        }),
    }
}

fn numeric(op: Opcode, lhs: Value, rhs: Value) -> Result<(f64, f64), Fault> {
    match (lhs.as_f64(), rhs.as_f64()) {
        (Some(lhs), Some(rhs)) => Ok((lhs, rhs)),
        _ => Err(Fault::InvalidOperands {
            op: op.name(),
            lhs: lhs.type_name(),
            rhs: rhs.type_name(),
        }),
    }
}

fn add(lhs: Value, rhs: Value, guard: &CollectionGuard<'_>) -> Result<Value, Fault> {
    match (lhs, rhs) {
        (Value::Int(a), Value::Int(b)) => {
            let sum = a.wrapping_add(b);
            if ((a ^ sum) & (b ^ sum)) < 0 {
                Ok(Value::Num(f64::from(a) + f64::from(b)))
            } else {
                Ok(Value::Int(sum))
            }
        }
        (Value::Str(a), Value::Str(b)) => {
            let mut joined = String::from(a.try_load(guard)?);
            joined.push_str(b.try_load(guard)?);
            Ok(Value::string(joined))
        }
        (Value::Str(_), _) | (_, Value::Str(_)) => Ok(Value::string(
            lhs.stringify(guard) + &rhs.stringify(guard),
        )),
        _ => {
            let (a, b) = numeric(Opcode::Add, lhs, rhs)?;
            Ok(Value::narrowed(a + b))
        }
    }
}

fn sub(lhs: Value, rhs: Value) -> Result<Value, Fault> {
    if let (Value::Int(a), Value::Int(b)) = (lhs, rhs) {
        let difference = a.wrapping_sub(b);
        return if ((a ^ b) & (a ^ difference)) < 0 {
            Ok(Value::Num(f64::from(a) - f64::from(b)))
        } else {
            Ok(Value::Int(difference))
        };
    }
    let (a, b) = numeric(Opcode::Sub, lhs, rhs)?;
    Ok(Value::narrowed(a - b))
}

fn mul(lhs: Value, rhs: Value) -> Result<Value, Fault> {
    if let (Value::Int(a), Value::Int(b)) = (lhs, rhs) {
        let product = i64::from(a) * i64::from(b);
        return Ok(i32::try_from(product)
            .map_or_else(|_| Value::Num(f64::from(a) * f64::from(b)), Value::Int));
    }
    let (a, b) = numeric(Opcode::Mul, lhs, rhs)?;
    Ok(Value::narrowed(a * b))
}

fn div(lhs: Value, rhs: Value) -> Result<Value, Fault> {
    if let (Value::Int(a), Value::Int(b)) = (lhs, rhs) {
        if b == 0 {
            return Err(Fault::DivideByZero);
        }
        return Ok(match (a.checked_rem(b), a.checked_div(b)) {
            (Some(0), Some(quotient)) => Value::Int(quotient),
            _ => Value::Num(f64::from(a) / f64::from(b)),
        });
    }
    let (a, b) = numeric(Opcode::Div, lhs, rhs)?;
    if b == 0. {
        return Err(Fault::DivideByZero);
    }
    Ok(Value::narrowed(a / b))
}

fn rem(lhs: Value, rhs: Value) -> Result<Value, Fault> {
    if let (Value::Int(a), Value::Int(b)) = (lhs, rhs) {
        if b == 0 {
            return Err(Fault::DivideByZero);
        }
        return Ok(Value::Int(a.checked_rem(b).unwrap_or(0)));
    }
    let (a, b) = numeric(Opcode::Mod, lhs, rhs)?;
    if b == 0. {
        return Err(Fault::DivideByZero);
    }
    Ok(Value::narrowed(a % b))
}

fn integers(op: Opcode, lhs: Value, rhs: Value) -> Result<(i32, i32), Fault> {
    match (lhs.as_i32(), rhs.as_i32()) {
        (Some(lhs), Some(rhs)) => Ok((lhs, rhs)),
        _ => Err(Fault::InvalidOperands {
            op: op.name(),
            lhs: lhs.type_name(),
            rhs: rhs.type_name(),
        }),
    }
}

fn shl(lhs: Value, rhs: Value) -> Result<Value, Fault> {
    let (value, count) = integers(Opcode::Shl, lhs, rhs)?;
    if count < 0 {
        return Err(Fault::NegativeShift);
    }
    if count <= 31 {
        let shifted = i64::from(value) << count;
        Ok(i32::try_from(shifted).map_or_else(|_| Value::Num(shifted as f64), Value::Int))
    } else {
        Ok(Value::Num(f64::from(value) * 2_f64.powi(count)))
    }
}

fn shr(lhs: Value, rhs: Value) -> Result<Value, Fault> {
    let (value, count) = integers(Opcode::Shr, lhs, rhs)?;
    if count < 0 {
        return Err(Fault::NegativeShift);
    }
    Ok(Value::Int(value >> count.min(31)))
}

fn bitwise(op: Opcode, lhs: Value, rhs: Value, f: impl FnOnce(i32, i32) -> i32) -> Result<Value, Fault> {
    let (lhs, rhs) = integers(op, lhs, rhs)?;
    Ok(Value::Int(f(lhs, rhs)))
}

fn compare(op: Opcode, lhs: Value, rhs: Value, guard: &CollectionGuard<'_>) -> Result<Value, Fault> {
    let ordering = match (lhs, rhs) {
        (Value::Int(a), Value::Int(b)) => Some(i64::from(a).cmp(&i64::from(b))),
        (Value::Str(a), Value::Str(b)) => Some(a.try_load(guard)?.cmp(b.try_load(guard)?)),
        _ => {
            let (a, b) = numeric(op, lhs, rhs)?;
            a.partial_cmp(&b)
        }
    };
    let Some(ordering) = ordering else {
        return Ok(Value::Bool(false));
    };
    Ok(Value::Bool(match op {
        Opcode::Lt => ordering == Ordering::Less,
        Opcode::Lte => ordering != Ordering::Greater,
        Opcode::Gt => ordering == Ordering::Greater,
        _ => ordering != Ordering::Less,
    }))
}

fn index_of(target: Value, key: Value) -> Result<i32, Fault> {
    key.as_i32().ok_or(Fault::InvalidIndex {
        target: target.type_name(),
        key: key.type_name(),
    })
}

fn key_of(key: Value) -> Result<SymbolRef, Fault> {
    match key {
        Value::Str(key) => Ok(key),
        other => Err(Fault::InvalidKey(other.type_name())),
    }
}

fn key_not_found(key: SymbolRef, guard: &CollectionGuard<'_>) -> Fault {
    Fault::KeyNotFound(key.load(guard).unwrap_or_default().to_string())
}

/// Returns `target[key]`.
pub fn index(target: Value, key: Value, guard: &CollectionGuard<'_>) -> Result<Value, Fault> {
    propagate_errors!(target, key);
    match target {
        Value::Array(array) => {
            let index = index_of(target, key)?;
            array.load(guard).ok_or(Fault::ValueFreed)?.get(index)
        }
        Value::Str(text) => {
            let index = index_of(target, key)?;
            let text = text.try_load(guard)?;
            usize::try_from(index)
                .ok()
                .and_then(|i| text.chars().nth(i))
                .map(|ch| Value::string(ch.to_string()))
                .ok_or_else(|| Fault::IndexOutOfBounds {
                    index,
                    length: text.chars().count(),
                })
        }
        Value::Object(object) | Value::Enum(object) => {
            let key = key_of(key)?;
            object
                .load(guard)
                .ok_or(Fault::ValueFreed)?
                .get(key)
                .ok_or_else(|| key_not_found(key, guard))
        }
        Value::Instance(instance) => {
            let key = key_of(key)?;
            instance
                .load(guard)
                .ok_or(Fault::ValueFreed)?
                .fields()
                .get(key)
                .ok_or_else(|| key_not_found(key, guard))
        }
        Value::Null
        | Value::Bool(_)
        | Value::Int(_)
        | Value::Num(_)
        | Value::Func(_)
        | Value::NativeFunc(_)
        | Value::Method(_)
        | Value::NativeMethod(_)
        | Value::Class(_)
        | Value::Error(_)
        | Value::Promise(_) => Err(Fault::NotIndexable(target.type_name())),
    }
}

/// Stores `value` at `target[key]` and returns `value`.
pub fn set_index(
    target: Value,
    key: Value,
    value: Value,
    guard: &CollectionGuard<'_>,
) -> Result<Value, Fault> {
    propagate_errors!(target, key);
    match target {
        Value::Array(array) => {
            let index = index_of(target, key)?;
            array.load(guard).ok_or(Fault::ValueFreed)?.set(index, value)?;
        }
        Value::Object(object) => {
            object
                .load(guard)
                .ok_or(Fault::ValueFreed)?
                .set(key_of(key)?, value)?;
        }
        Value::Instance(instance) => {
            instance
                .load(guard)
                .ok_or(Fault::ValueFreed)?
                .fields()
                .set(key_of(key)?, value)?;
        }
        Value::Enum(_) => return Err(Fault::Frozen("enum")),
        Value::Str(_) => return Err(Fault::Frozen("string")),
        Value::Null
        | Value::Bool(_)
        | Value::Int(_)
        | Value::Num(_)
        | Value::Func(_)
        | Value::NativeFunc(_)
        | Value::Method(_)
        | Value::NativeMethod(_)
        | Value::Class(_)
        | Value::Error(_)
        | Value::Promise(_) => return Err(Fault::NotIndexable(target.type_name())),
    }
    Ok(value)
}

/// Returns the attribute `name` of `target`.
///
/// Functions found on an instance's class are bound to the instance, and the
/// native methods of strings and arrays are bound to their receiver.
pub fn attribute(
    target: Value,
    name: SymbolRef,
    methods: &NativeMethods,
    guard: &CollectionGuard<'_>,
) -> Result<Value, Fault> {
    propagate_errors!(target);
    let unknown = || Fault::UnknownAttribute {
        target: target.type_name(),
        name: name.load(guard).unwrap_or_default().to_string(),
    };
    match target {
        Value::Object(object) | Value::Enum(object) => object
            .load(guard)
            .ok_or(Fault::ValueFreed)?
            .get(name)
            .ok_or_else(unknown),
        Value::Instance(instance) => {
            let instance = instance.load(guard).ok_or(Fault::ValueFreed)?;
            if let Some(value) = instance.fields().get(name) {
                return Ok(value);
            }
            match class::lookup(instance.class(), name, guard)? {
                Some(Value::Func(function)) => Ok(Value::Method(Ref::new(
                    BoundMethod::new(target, function),
                    guard,
                ))),
                Some(value) => Ok(value),
                None => Err(unknown()),
            }
        }
        Value::Class(class) => class::lookup(class, name, guard)?.ok_or_else(unknown),
        Value::Str(_) | Value::Array(_) => {
            let name = name.upgrade(guard).ok_or(Fault::ValueFreed)?;
            let method = if matches!(target, Value::Str(_)) {
                methods.string(&name)
            } else {
                methods.array(&name)
            };
            method
                .map(|method| Value::NativeMethod(Ref::new(BoundNative::new(target, method), guard)))
                .ok_or_else(unknown)
        }
        Value::Null
        | Value::Bool(_)
        | Value::Int(_)
        | Value::Num(_)
        | Value::Func(_)
        | Value::NativeFunc(_)
        | Value::Method(_)
        | Value::NativeMethod(_)
        | Value::Error(_)
        | Value::Promise(_) => Err(unknown()),
    }
}

#[cfg(test)]
mod tests {
    use refuse::CollectionGuard;

    use super::{binary, index, unary};
    use crate::runtime::object::Object;
    use crate::runtime::value::Value;
    use crate::vm::bytecode::Opcode;
    use crate::vm::Fault;

    const SAMPLES: [i32; 9] = [
        i32::MIN,
        i32::MIN + 1,
        -65_536,
        -1,
        0,
        1,
        46_341,
        i32::MAX - 1,
        i32::MAX,
    ];

    #[test]
    fn overflow_promotion() {
        let guard = CollectionGuard::acquire();
        for a in SAMPLES {
            for b in SAMPLES {
                let cases = [
                    (Opcode::Add, i64::from(a) + i64::from(b), f64::from(a) + f64::from(b)),
                    (Opcode::Sub, i64::from(a) - i64::from(b), f64::from(a) - f64::from(b)),
                    (Opcode::Mul, i64::from(a) * i64::from(b), f64::from(a) * f64::from(b)),
                ];
                for (op, wide, float) in cases {
                    let expected = i32::try_from(wide).map_or(Value::Num(float), Value::Int);
                    assert_eq!(
                        binary(op, Value::Int(a), Value::Int(b), &guard),
                        Ok(expected),
                        "{a} {op} {b}"
                    );
                }
            }
        }
    }

    #[test]
    fn string_concatenation() {
        let guard = CollectionGuard::acquire();
        let concat = |lhs, rhs| binary(Opcode::Add, lhs, rhs, &guard).unwrap();
        assert_eq!(
            concat(Value::string("a"), Value::string("b")),
            Value::string("ab")
        );
        assert_eq!(concat(Value::string("a"), Value::Int(1)), Value::string("a1"));
        assert_eq!(concat(Value::Int(1), Value::string("a")), Value::string("1a"));
        assert_eq!(
            concat(Value::Null, Value::string("!")),
            Value::string("null!")
        );
    }

    #[test]
    fn division_by_zero() {
        let guard = CollectionGuard::acquire();
        for op in [Opcode::Div, Opcode::Mod] {
            assert_eq!(
                binary(op, Value::Int(1), Value::Int(0), &guard),
                Err(Fault::DivideByZero)
            );
            assert_eq!(
                binary(op, Value::Num(1.), Value::Num(0.), &guard),
                Err(Fault::DivideByZero)
            );
        }
    }

    #[test]
    fn division_narrows() {
        let guard = CollectionGuard::acquire();
        let div = |a, b| binary(Opcode::Div, a, b, &guard).unwrap();
        assert_eq!(div(Value::Int(6), Value::Int(3)), Value::Int(2));
        assert_eq!(div(Value::Int(7), Value::Int(2)), Value::Num(3.5));
        assert_eq!(div(Value::Num(4.), Value::Num(2.)), Value::Int(2));
        assert_eq!(
            div(Value::Int(i32::MIN), Value::Int(-1)),
            Value::Num(2_147_483_648.)
        );
        assert_eq!(
            binary(Opcode::Mod, Value::Int(i32::MIN), Value::Int(-1), &guard),
            Ok(Value::Int(0))
        );
    }

    #[test]
    fn shifts_and_bitwise() {
        let guard = CollectionGuard::acquire();
        assert_eq!(
            binary(Opcode::Shl, Value::Int(1), Value::Int(4), &guard),
            Ok(Value::Int(16))
        );
        assert_eq!(
            binary(Opcode::Shl, Value::Int(1), Value::Int(31), &guard),
            Ok(Value::Num(2_147_483_648.))
        );
        assert_eq!(
            binary(Opcode::Shr, Value::Int(-16), Value::Int(2), &guard),
            Ok(Value::Int(-4))
        );
        assert_eq!(
            binary(Opcode::Shl, Value::Int(1), Value::Int(-1), &guard),
            Err(Fault::NegativeShift)
        );
        assert_eq!(
            binary(Opcode::BitXor, Value::Int(6), Value::Num(3.), &guard),
            Ok(Value::Int(5))
        );
        assert!(binary(Opcode::BitAnd, Value::Int(6), Value::Num(0.5), &guard).is_err());
    }

    #[test]
    fn comparisons() {
        let guard = CollectionGuard::acquire();
        let cmp = |op, a, b| binary(op, a, b, &guard).unwrap();
        assert_eq!(cmp(Opcode::Lt, Value::Int(1), Value::Num(1.5)), Value::Bool(true));
        assert_eq!(cmp(Opcode::Gte, Value::Int(2), Value::Int(2)), Value::Bool(true));
        assert_eq!(
            cmp(Opcode::Lt, Value::string("apple"), Value::string("banana")),
            Value::Bool(true)
        );
        assert_eq!(cmp(Opcode::Eq, Value::Int(1), Value::Num(1.)), Value::Bool(true));
        assert_eq!(cmp(Opcode::Ne, Value::Null, Value::Bool(false)), Value::Bool(true));
        assert!(binary(Opcode::Lt, Value::Null, Value::Int(1), &guard).is_err());
    }

    #[test]
    fn errors_propagate() {
        let guard = CollectionGuard::acquire();
        let error = Value::error("boom", &guard);
        assert_eq!(binary(Opcode::Add, Value::Int(1), error, &guard), Ok(error));
        assert_eq!(unary(Opcode::Neg, error, &guard), Ok(error));
        assert_eq!(unary(Opcode::Not, error, &guard), Ok(Value::Bool(false)));
        assert_eq!(
            unary(Opcode::TypeOf, error, &guard),
            Ok(Value::string("error"))
        );
    }

    #[test]
    fn unary_operators() {
        let guard = CollectionGuard::acquire();
        assert_eq!(
            unary(Opcode::Neg, Value::Int(i32::MIN), &guard),
            Ok(Value::Num(2_147_483_648.))
        );
        assert_eq!(
            unary(Opcode::Inc, Value::Int(i32::MAX), &guard),
            Ok(Value::Num(2_147_483_648.))
        );
        assert_eq!(
            unary(Opcode::Pos, Value::string("1"), &guard),
            Err(Fault::InvalidOperand {
                op: "Pos",
                operand: "string"
            })
        );
    }

    #[test]
    fn indexing() {
        let guard = CollectionGuard::acquire();
        let array = Value::array(vec![Value::Int(1), Value::Int(2), Value::Int(3)], &guard);
        assert_eq!(index(array, Value::Int(1), &guard), Ok(Value::Int(2)));
        assert_eq!(
            index(array, Value::Int(5), &guard),
            Err(Fault::IndexOutOfBounds {
                index: 5,
                length: 3
            })
        );
        assert_eq!(
            index(Value::string("héllo"), Value::Int(1), &guard),
            Ok(Value::string("é"))
        );
        let object = Object::new();
        object.insert("a", Value::Int(1));
        let object = Value::object(object, &guard);
        assert_eq!(index(object, Value::string("a"), &guard), Ok(Value::Int(1)));
        assert_eq!(
            index(object, Value::string("b"), &guard),
            Err(Fault::KeyNotFound(String::from("b")))
        );
        assert_eq!(
            index(Value::Int(1), Value::Int(0), &guard),
            Err(Fault::NotIndexable("int"))
        );
    }
}
