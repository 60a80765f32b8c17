//! Dynamic value model for configuration and instance state
//!
//! Layers, merged configuration and expanded instances are all trees of
//! [`Value`]. Expanded trees additionally hold [`Reactive`] handles at their
//! leaves and [`Value::Component`] links to sub-components.

use std::fmt;
use std::rc::Rc;

use fluid_core::reactive::{Derived, ReactiveGraph, Signal};
use indexmap::IndexMap;

use crate::instantiator::Instantiator;
use crate::shadow::ShadowId;

/// Ordered key/value table
pub type Table = IndexMap<String, Value>;

type FnBody = dyn Fn(&Instantiator, &[Value]) -> Value;

/// A named native function callable from configuration
#[derive(Clone)]
pub struct NativeFn {
    name: Rc<str>,
    body: Rc<FnBody>,
}

impl NativeFn {
    pub fn new<F>(name: impl Into<Rc<str>>, body: F) -> Self
    where
        F: Fn(&Instantiator, &[Value]) -> Value + 'static,
    {
        Self {
            name: name.into(),
            body: Rc::new(body),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn call(&self, instantiator: &Instantiator, args: &[Value]) -> Value {
        (self.body)(instantiator, args)
    }

    /// Two handles are the same function only if they share the body
    pub fn ptr_eq(&self, other: &NativeFn) -> bool {
        Rc::ptr_eq(&self.body, &other.body)
    }
}

impl fmt::Debug for NativeFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NativeFn({})", self.name)
    }
}

/// A reactive handle stored inside an expanded tree
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Reactive {
    Cell(Signal<Value>),
    Derived(Derived<Value>),
}

impl Reactive {
    /// Current value, recorded as a dependency of the running computation
    pub fn read(&self, graph: &ReactiveGraph) -> Value {
        let value = match self {
            Reactive::Cell(cell) => graph.get(*cell),
            Reactive::Derived(derived) => graph.get_derived(*derived),
        };
        value.unwrap_or_else(|| Value::unavailable("reactive value has been disposed", None))
    }

    pub fn read_untracked(&self, graph: &ReactiveGraph) -> Value {
        graph.untrack(|| self.read(graph))
    }
}

/// Address of a value inside a component's expanded configuration
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Site {
    pub component: ShadowId,
    /// Tree path of the component when the site was taken
    pub path: String,
    pub segs: Vec<String>,
}

impl Site {
    pub fn new(component: ShadowId, path: impl Into<String>, segs: Vec<String>) -> Self {
        Self {
            component,
            path: path.into(),
            segs,
        }
    }
}

impl fmt::Display for Site {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let path = if self.path.is_empty() { "<root>" } else { &self.path };
        if self.segs.is_empty() {
            write!(f, "{}", path)
        } else {
            write!(f, "{}#{}", path, self.segs.join("."))
        }
    }
}

/// Explicit marker for a value that could not be resolved
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Unavailable {
    pub cause: String,
    pub site: Option<Site>,
}

impl fmt::Display for Unavailable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.site {
            Some(site) => write!(f, "{} (at {})", self.cause, site),
            None => write!(f, "{}", self.cause),
        }
    }
}

/// A configuration or instance value
#[derive(Clone, Debug, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Number(f64),
    String(Rc<str>),
    List(Rc<Vec<Value>>),
    Map(Rc<Table>),
    Func(NativeFn),
    Reactive(Reactive),
    Component(ShadowId),
    Unavailable(Rc<Unavailable>),
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::List(a), Value::List(b)) => Rc::ptr_eq(a, b) || a == b,
            (Value::Map(a), Value::Map(b)) => Rc::ptr_eq(a, b) || a == b,
            (Value::Func(a), Value::Func(b)) => a.ptr_eq(b),
            (Value::Reactive(a), Value::Reactive(b)) => a == b,
            (Value::Component(a), Value::Component(b)) => a == b,
            (Value::Unavailable(a), Value::Unavailable(b)) => a == b,
            _ => false,
        }
    }
}

impl Value {
    pub fn unavailable(cause: impl Into<String>, site: Option<Site>) -> Self {
        Value::Unavailable(Rc::new(Unavailable {
            cause: cause.into(),
            site,
        }))
    }

    pub fn string(s: impl AsRef<str>) -> Self {
        Value::String(Rc::from(s.as_ref()))
    }

    pub fn map(table: Table) -> Self {
        Value::Map(Rc::new(table))
    }

    pub fn list(items: Vec<Value>) -> Self {
        Value::List(Rc::new(items))
    }

    /// Convert a JSON document, keeping object key order
    pub fn from_json(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => Value::String(Rc::from(s)),
            serde_json::Value::Array(items) => {
                Value::list(items.into_iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(entries) => Value::map(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Owned table of a map value
    pub fn into_table(self) -> Option<Table> {
        match self {
            Value::Map(table) => {
                Some(Rc::try_unwrap(table).unwrap_or_else(|shared| (*shared).clone()))
            }
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, Value::Unavailable(_))
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&Table> {
        match self {
            Value::Map(table) => Some(table),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_component(&self) -> Option<ShadowId> {
        match self {
            Value::Component(id) => Some(*id),
            _ => None,
        }
    }

    pub fn as_unavailable(&self) -> Option<&Unavailable> {
        match self {
            Value::Unavailable(u) => Some(u),
            _ => None,
        }
    }

    /// Strings of a list, or a single string promoted to a list
    pub fn string_list(&self) -> Vec<String> {
        match self {
            Value::String(s) => vec![s.to_string()],
            Value::List(items) => items
                .iter()
                .filter_map(|item| item.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Whether a reactive handle lives anywhere in this tree
    pub fn bears_signals(&self) -> bool {
        match self {
            Value::Reactive(_) | Value::Component(_) => true,
            Value::Map(table) => table.values().any(Value::bears_signals),
            Value::List(items) => items.iter().any(Value::bears_signals),
            _ => false,
        }
    }

    /// Short name of the variant, for diagnostics
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Func(_) => "function",
            Value::Reactive(_) => "reactive",
            Value::Component(_) => "component",
            Value::Unavailable(_) => "unavailable",
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(f64::from(n))
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::string(s)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(Rc::from(s))
    }
}

impl From<Table> for Value {
    fn from(table: Table) -> Self {
        Value::map(table)
    }
}

impl From<NativeFn> for Value {
    fn from(f: NativeFn) -> Self {
        Value::Func(f)
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        Value::from_json(json)
    }
}
