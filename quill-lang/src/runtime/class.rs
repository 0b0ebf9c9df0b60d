//! Classes, instances and enums.
//!
//! A class owns a prototype [`Object`] holding its methods and an optional
//! base class. Attribute lookup on an instance checks the instance's own
//! fields first and then walks the class chain, so the nearest definition
//! wins.

use parking_lot::Mutex;
use refuse::{CollectionGuard, NoMapping, Ref, Trace};

use crate::runtime::object::Object;
use crate::runtime::symbol::{Symbol, SymbolRef};
use crate::runtime::value::Value;
use crate::vm::Fault;

/// A class declared with `class Name { .. }`.
pub struct Class {
    name: Symbol,
    base: Mutex<Option<Ref<Class>>>,
    prototype: Ref<Object>,
}

impl Class {
    /// Returns a new class without a base class.
    #[must_use]
    pub fn new(name: impl Into<Symbol>, prototype: Ref<Object>) -> Self {
        Self {
            name: name.into(),
            base: Mutex::new(None),
            prototype,
        }
    }

    /// Returns the name of this class.
    #[must_use]
    pub const fn name(&self) -> &Symbol {
        &self.name
    }

    /// Returns the base class, if any.
    #[must_use]
    pub fn base(&self) -> Option<Ref<Class>> {
        *self.base.lock()
    }

    /// Returns the object holding this class's methods.
    #[must_use]
    pub const fn prototype(&self) -> Ref<Object> {
        self.prototype
    }
}

impl NoMapping for Class {}

impl Trace for Class {
    const MAY_CONTAIN_REFERENCES: bool = true;

    fn trace(&self, tracer: &mut refuse::Tracer) {
        if let Some(base) = *self.base.lock() {
            tracer.mark(base);
        }
        tracer.mark(self.prototype);
    }
}

/// Makes `base` the base class of `class`.
///
/// # Errors
///
/// Returns [`Fault::CyclicInheritance`] if `class` already appears in the
/// chain of `base`.
pub fn extend(class: Ref<Class>, base: Ref<Class>, guard: &CollectionGuard<'_>) -> Result<(), Fault> {
    let mut current = Some(base);
    while let Some(ancestor) = current {
        if ancestor == class {
            return Err(Fault::CyclicInheritance);
        }
        current = ancestor.load(guard).ok_or(Fault::ValueFreed)?.base();
    }
    *class.load(guard).ok_or(Fault::ValueFreed)?.base.lock() = Some(base);
    Ok(())
}

/// Looks up `name` in the prototype of `class` and then in each base class.
pub fn lookup(
    class: Ref<Class>,
    name: SymbolRef,
    guard: &CollectionGuard<'_>,
) -> Result<Option<Value>, Fault> {
    let mut current = Some(class);
    while let Some(class) = current {
        let class = class.load(guard).ok_or(Fault::ValueFreed)?;
        let prototype = class.prototype.load(guard).ok_or(Fault::ValueFreed)?;
        if let Some(value) = prototype.get(name) {
            return Ok(Some(value));
        }
        current = class.base();
    }
    Ok(None)
}

/// An instance of a [`Class`].
pub struct Instance {
    class: Ref<Class>,
    fields: Object,
}

impl Instance {
    /// Returns a new instance of `class` without any fields.
    #[must_use]
    pub fn new(class: Ref<Class>) -> Self {
        Self {
            class,
            fields: Object::new(),
        }
    }

    /// Returns the class of this instance.
    #[must_use]
    pub const fn class(&self) -> Ref<Class> {
        self.class
    }

    /// Returns the instance's own fields.
    #[must_use]
    pub const fn fields(&self) -> &Object {
        &self.fields
    }
}

impl NoMapping for Instance {}

impl Trace for Instance {
    const MAY_CONTAIN_REFERENCES: bool = true;

    fn trace(&self, tracer: &mut refuse::Tracer) {
        tracer.mark(self.class);
        self.fields.trace(tracer);
    }
}

/// Builds a frozen enum object named `name` from `members`.
///
/// # Errors
///
/// Returns [`Fault::DuplicateEnumValue`] if two members share a value, and
/// [`Fault::DuplicateEnumMember`] if a name is repeated.
pub fn make_enum(
    name: impl Into<Symbol>,
    members: &[(SymbolRef, Value)],
    guard: &CollectionGuard<'_>,
) -> Result<Value, Fault> {
    let object = Object::named(name);
    for (index, (member, value)) in members.iter().enumerate() {
        let member_name = || member.load(guard).unwrap_or_default().to_string();
        if object.contains(*member) {
            return Err(Fault::DuplicateEnumMember(member_name()));
        }
        if members[..index]
            .iter()
            .any(|(_, earlier)| earlier.equals(value, guard))
        {
            return Err(Fault::DuplicateEnumValue(member_name()));
        }
        object.insert(*member, *value);
    }
    object.freeze();
    Ok(Value::Enum(Ref::new(object, guard)))
}

#[cfg(test)]
mod tests {
    use refuse::{CollectionGuard, Ref};

    use super::{extend, lookup, make_enum, Class};
    use crate::runtime::object::Object;
    use crate::runtime::symbol::SymbolRef;
    use crate::runtime::value::Value;
    use crate::vm::Fault;

    #[test]
    fn lookup_walks_base_chain() {
        let guard = CollectionGuard::acquire();
        let base_methods = Object::new();
        base_methods.insert("greet", Value::Int(1));
        let base = Ref::new(Class::new("A", Ref::new(base_methods, &guard)), &guard);
        let derived = Ref::new(Class::new("B", Ref::new(Object::new(), &guard)), &guard);
        extend(derived, base, &guard).unwrap();

        assert_eq!(
            lookup(derived, SymbolRef::from("greet"), &guard).unwrap(),
            Some(Value::Int(1))
        );
        assert_eq!(lookup(derived, SymbolRef::from("missing"), &guard).unwrap(), None);
        assert_eq!(extend(base, derived, &guard), Err(Fault::CyclicInheritance));
    }

    #[test]
    fn enums_reject_duplicates() {
        let guard = CollectionGuard::acquire();
        let members = [
            (SymbolRef::from("Red"), Value::Int(0)),
            (SymbolRef::from("Green"), Value::Int(0)),
        ];
        assert_eq!(
            make_enum("Color", &members, &guard),
            Err(Fault::DuplicateEnumValue(String::from("Green")))
        );
    }
}
