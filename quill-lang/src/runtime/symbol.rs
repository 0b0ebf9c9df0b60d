//! Interned strings used for identifiers, attribute names and string values.
//!
//! Every unique string exists once in a garbage-collected pool, which makes
//! comparing and hashing symbols a pointer comparison.

use std::fmt::{Debug, Display};
use std::ops::Deref;
use std::sync::OnceLock;

use refuse::{CollectionGuard, Trace};
use refuse_pool::{RefString, RootString};
use serde::de::Visitor;
use serde::{Deserialize, Serialize};

use crate::runtime::value::ValueFreed;

/// A garbage-collected weak reference to a [`Symbol`].
///
/// This is the representation string values use on the operand stack. The
/// virtual machine traces every `SymbolRef` it can reach, keeping the
/// underlying string alive.
#[derive(Debug, Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash, Trace)]
pub struct SymbolRef(RefString);

impl SymbolRef {
    /// Loads the underlying string value of this symbol.
    ///
    /// Returns `None` if the underlying symbol has been freed by the garbage
    /// collector.
    #[must_use]
    pub fn load<'guard>(&self, guard: &'guard CollectionGuard<'_>) -> Option<&'guard str> {
        self.0.load(guard)
    }

    /// Tries to loads the underlying string value of this symbol.
    pub fn try_load<'guard>(
        &self,
        guard: &'guard CollectionGuard<'_>,
    ) -> Result<&'guard str, ValueFreed> {
        self.load(guard).ok_or(ValueFreed)
    }

    /// Upgrades this weak reference to a reference-counted [`Symbol`].
    ///
    /// Returns `None` if the underlying symbol has been freed by the garbage
    /// collector.
    #[must_use]
    pub fn upgrade(&self, guard: &CollectionGuard<'_>) -> Option<Symbol> {
        self.0.as_root(guard).map(Symbol)
    }
}

/// A reference-counted, cheap-to-compare string type.
#[derive(Clone, Trace)]
pub struct Symbol(RootString);

impl Symbol {
    /// Returns a weak reference to this symbol.
    #[must_use]
    pub const fn downgrade(&self) -> SymbolRef {
        SymbolRef(self.0.downgrade())
    }
}

impl Eq for Symbol {}

impl PartialEq for Symbol {
    fn eq(&self, other: &Self) -> bool {
        self.0.downgrade() == other.0.downgrade()
    }
}

impl Ord for Symbol {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.downgrade().cmp(&other.0.downgrade())
    }
}

impl PartialOrd for Symbol {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl std::hash::Hash for Symbol {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.downgrade().hash(state);
    }
}

macro_rules! static_symbols {
    ($($name:ident => $string:literal),+ $(,)?) => {
        impl Symbol {
            $(
                #[doc = concat!("Returns the symbol for \"", $string, "\".")]
                pub fn $name() -> &'static Self {
                static S: OnceLock<Symbol> = OnceLock::new();
                S.get_or_init(|| Symbol::from($string))
            })+
        }
    };
}

static_symbols!(
    empty => "",
    as_symbol => "as",
    async_symbol => "async",
    await_symbol => "await",
    break_symbol => "break",
    case_symbol => "case",
    catch_symbol => "catch",
    class_symbol => "class",
    continue_symbol => "continue",
    default_symbol => "default",
    do_symbol => "do",
    else_symbol => "else",
    enum_symbol => "enum",
    extends_symbol => "extends",
    false_symbol => "false",
    for_symbol => "for",
    function_symbol => "function",
    if_symbol => "if",
    import_symbol => "import",
    init_symbol => "init",
    main_symbol => "main",
    module_symbol => "module",
    new_symbol => "new",
    null_symbol => "null",
    return_symbol => "return",
    switch_symbol => "switch",
    this_symbol => "this",
    true_symbol => "true",
    typeof_symbol => "typeof",
    var_symbol => "var",
    while_symbol => "while",
);

macro_rules! impl_froms {
    ($type:ty, $inner:ty) => {
        impl From<String> for $type {
            fn from(value: String) -> Self {
                Self(<$inner>::from(value))
            }
        }

        impl From<&'_ String> for $type {
            fn from(value: &'_ String) -> Self {
                Self(<$inner>::from(value))
            }
        }

        impl From<&'_ str> for $type {
            fn from(value: &'_ str) -> Self {
                Self(<$inner>::from(value))
            }
        }
    };
}

impl_froms!(Symbol, RootString);
impl_froms!(SymbolRef, RefString);

impl From<&'_ Symbol> for Symbol {
    fn from(value: &'_ Symbol) -> Self {
        value.clone()
    }
}

impl From<&'_ Symbol> for SymbolRef {
    fn from(value: &'_ Symbol) -> Self {
        value.downgrade()
    }
}

impl From<Symbol> for SymbolRef {
    fn from(value: Symbol) -> Self {
        value.downgrade()
    }
}

impl PartialEq<&'_ str> for Symbol {
    fn eq(&self, other: &&'_ str) -> bool {
        self.0 == *other
    }
}

impl PartialEq<str> for Symbol {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<SymbolRef> for Symbol {
    fn eq(&self, other: &SymbolRef) -> bool {
        self.0 == other.0
    }
}

impl PartialEq<Symbol> for SymbolRef {
    fn eq(&self, other: &Symbol) -> bool {
        self.0 == other.0
    }
}

impl Deref for Symbol {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Debug for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(&*self.0, f)
    }
}

impl Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&*self.0, f)
    }
}

impl Serialize for Symbol {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self)
    }
}

impl<'de> Deserialize<'de> for Symbol {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_str(SymbolVisitor)
    }
}

struct SymbolVisitor;

impl<'de> Visitor<'de> for SymbolVisitor {
    type Value = Symbol;

    fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(formatter, "a symbol")
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        Ok(Symbol::from(v))
    }

    fn visit_string<E>(self, v: String) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        Ok(Symbol::from(v))
    }
}

#[test]
fn symbols_are_interned() {
    let a = Symbol::from("quill");
    let b = Symbol::from(String::from("quill"));
    assert_eq!(a, b);
    assert_eq!(a.downgrade(), b.downgrade());
    assert_eq!(a, "quill");
    assert_ne!(a, *Symbol::empty());
}
