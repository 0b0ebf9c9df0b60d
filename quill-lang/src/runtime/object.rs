//! Arrays and string-keyed objects.

use parking_lot::Mutex;
use refuse::{NoMapping, Trace};

use crate::runtime::symbol::{Symbol, SymbolRef};
use crate::runtime::value::Value;
use crate::vm::Fault;

/// A growable list of values.
#[derive(Debug, Default)]
pub struct Array(Mutex<Vec<Value>>);

impl Array {
    /// Returns an array containing `values`.
    #[must_use]
    pub fn new(values: Vec<Value>) -> Self {
        Self(Mutex::new(values))
    }

    /// Returns the number of values in this array.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    /// Returns true if this array contains no values.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }

    /// Returns the value at `index`.
    ///
    /// # Errors
    ///
    /// Returns [`Fault::IndexOutOfBounds`] if `index` is negative or not less
    /// than the length of the array.
    pub fn get(&self, index: i32) -> Result<Value, Fault> {
        let values = self.0.lock();
        usize::try_from(index)
            .ok()
            .and_then(|i| values.get(i).copied())
            .ok_or(Fault::IndexOutOfBounds {
                index,
                length: values.len(),
            })
    }

    /// Replaces the value at `index`.
    ///
    /// # Errors
    ///
    /// Returns [`Fault::IndexOutOfBounds`] if `index` does not refer to an
    /// existing element.
    pub fn set(&self, index: i32, value: Value) -> Result<(), Fault> {
        let mut values = self.0.lock();
        let length = values.len();
        let slot = usize::try_from(index)
            .ok()
            .and_then(|i| values.get_mut(i))
            .ok_or(Fault::IndexOutOfBounds { index, length })?;
        *slot = value;
        Ok(())
    }

    /// Appends `value` and returns the new length.
    pub fn push(&self, value: Value) -> usize {
        let mut values = self.0.lock();
        values.push(value);
        values.len()
    }

    /// Removes and returns the last value.
    pub fn pop(&self) -> Option<Value> {
        self.0.lock().pop()
    }

    /// Returns a copy of the contained values.
    #[must_use]
    pub fn to_vec(&self) -> Vec<Value> {
        self.0.lock().clone()
    }
}

impl NoMapping for Array {}

impl Trace for Array {
    const MAY_CONTAIN_REFERENCES: bool = true;

    fn trace(&self, tracer: &mut refuse::Tracer) {
        self.0.lock().trace(tracer);
    }
}

/// A collection of values keyed by string, ordered by first insertion.
///
/// Objects back plain object literals, instance fields, class prototypes,
/// module namespaces and enums. Frozen objects reject modification.
#[derive(Debug, Default)]
pub struct Object {
    name: Option<Symbol>,
    fields: Mutex<Fields>,
}

#[derive(Debug, Default)]
struct Fields {
    entries: Vec<(SymbolRef, Value)>,
    frozen: bool,
}

impl Object {
    /// Returns a new, empty object.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a new, empty object with a name, such as a module or an enum.
    #[must_use]
    pub fn named(name: impl Into<Symbol>) -> Self {
        Self {
            name: Some(name.into()),
            fields: Mutex::default(),
        }
    }

    /// Returns the name of this object, if it has one.
    #[must_use]
    pub const fn name(&self) -> Option<&Symbol> {
        self.name.as_ref()
    }

    /// Returns the value stored under `key`.
    pub fn get(&self, key: impl Into<SymbolRef>) -> Option<Value> {
        let key = key.into();
        self.fields
            .lock()
            .entries
            .iter()
            .find_map(|(field, value)| (*field == key).then_some(*value))
    }

    /// Returns true if a value is stored under `key`.
    pub fn contains(&self, key: impl Into<SymbolRef>) -> bool {
        self.get(key).is_some()
    }

    /// Stores `value` under `key`, replacing any existing value.
    ///
    /// # Errors
    ///
    /// Returns [`Fault::Frozen`] if this object has been frozen.
    pub fn set(&self, key: impl Into<SymbolRef>, value: Value) -> Result<(), Fault> {
        let mut fields = self.fields.lock();
        if fields.frozen {
            return Err(Fault::Frozen(if self.name.is_some() {
                "namespace"
            } else {
                "object"
            }));
        }
        fields.upsert(key.into(), value);
        Ok(())
    }

    /// Stores `value` under `key` regardless of whether this object is
    /// frozen. Used while building objects that are frozen once complete.
    pub fn insert(&self, key: impl Into<SymbolRef>, value: Value) {
        self.fields.lock().upsert(key.into(), value);
    }

    /// Prevents further modification of this object.
    pub fn freeze(&self) {
        self.fields.lock().frozen = true;
    }

    /// Returns true if this object has been frozen.
    #[must_use]
    pub fn is_frozen(&self) -> bool {
        self.fields.lock().frozen
    }

    /// Returns the number of fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.lock().entries.len()
    }

    /// Returns true if this object has no fields.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.lock().entries.is_empty()
    }

    /// Returns a copy of the fields in insertion order.
    #[must_use]
    pub fn entries(&self) -> Vec<(SymbolRef, Value)> {
        self.fields.lock().entries.clone()
    }
}

impl Fields {
    fn upsert(&mut self, key: SymbolRef, value: Value) {
        if let Some((_, existing)) = self.entries.iter_mut().find(|(field, _)| *field == key) {
            *existing = value;
        } else {
            self.entries.push((key, value));
        }
    }
}

impl NoMapping for Object {}

impl Trace for Object {
    const MAY_CONTAIN_REFERENCES: bool = true;

    fn trace(&self, tracer: &mut refuse::Tracer) {
        for (key, value) in &self.fields.lock().entries {
            key.trace(tracer);
            value.trace(tracer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Array, Object};
    use crate::runtime::symbol::Symbol;
    use crate::runtime::value::Value;
    use crate::vm::Fault;

    #[test]
    fn bounds_checks() {
        let array = Array::new(vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
        assert_eq!(array.get(2), Ok(Value::Int(3)));
        assert_eq!(
            array.get(5),
            Err(Fault::IndexOutOfBounds {
                index: 5,
                length: 3
            })
        );
        assert!(array.get(-1).is_err());
        assert!(array.set(3, Value::Null).is_err());
    }

    #[test]
    fn insertion_order_and_freezing() {
        let object = Object::named("config");
        object.insert("b", Value::Int(1));
        object.insert("a", Value::Int(2));
        object.insert("b", Value::Int(3));
        let entries = object.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0, Symbol::from("b"));
        assert_eq!(object.get("b"), Some(Value::Int(3)));

        object.freeze();
        assert_eq!(
            object.set("c", Value::Null),
            Err(Fault::Frozen("namespace"))
        );
        assert!(!object.contains("c"));
    }
}
