//! Context references
//!
//! A reference has the shape `{context}.path.to.value`:
//!
//! - `{self}`: the resolving component
//! - `{/}`: the tree root
//! - `{arguments}`: call arguments, inside method argument lists only
//! - `{name}`: the nearest component visible under `name` in the resolving
//!   component's own scope
//!
//! Resolution is a derived computation. It reads the scope maps, the target
//! component's expanded configuration and every reactive cell on the way, so
//! the same handle follows later changes to any of them. Failures are
//! [`Value::Unavailable`] values, never errors.

use std::fmt;
use std::rc::Rc;

use fluid_core::reactive::{Derived, ReactiveGraph};

use crate::error::{InstantiatorError, Result};
use crate::instantiator::Instantiator;
use crate::shadow::ShadowId;
use crate::value::{Reactive, Site, Value};

/// Whether a string is written as a context reference
pub fn is_reference(source: &str) -> bool {
    source.trim_start().starts_with('{')
}

/// The `{...}` part of a reference
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ContextName {
    /// `{self}`
    This,
    /// `{/}`
    Root,
    /// `{arguments}`
    Arguments,
    Named(String),
}

impl fmt::Display for ContextName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextName::This => f.write_str("self"),
            ContextName::Root => f.write_str("/"),
            ContextName::Arguments => f.write_str("arguments"),
            ContextName::Named(name) => f.write_str(name),
        }
    }
}

/// A parsed reference string
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsedReference {
    pub context: ContextName,
    pub path: Vec<String>,
}

/// Parse `{context}.a.b`; the dot after the context is optional
pub fn parse_reference(source: &str) -> Result<ParsedReference> {
    let malformed = |reason: &str| InstantiatorError::MalformedReference {
        reference: source.to_string(),
        reason: reason.to_string(),
    };

    let trimmed = source.trim();
    let Some(rest) = trimmed.strip_prefix('{') else {
        return Err(malformed("expected '{' at the start"));
    };
    let Some(close) = rest.find('}') else {
        return Err(malformed("missing closing '}'"));
    };
    let context = rest[..close].trim();
    if context.is_empty() {
        return Err(malformed("empty context"));
    }

    let tail = &rest[close + 1..];
    let (dotted, tail) = match tail.strip_prefix('.') {
        Some(stripped) => (true, stripped),
        None => (false, tail),
    };
    if dotted && tail.is_empty() {
        return Err(malformed("empty path segment"));
    }
    let mut path = Vec::new();
    if !tail.is_empty() {
        for segment in tail.split('.') {
            let segment = segment.trim();
            if segment.is_empty() {
                return Err(malformed("empty path segment"));
            }
            path.push(segment.to_string());
        }
    }

    let context = match context {
        "self" => ContextName::This,
        "/" => ContextName::Root,
        "arguments" => ContextName::Arguments,
        name => ContextName::Named(name.to_string()),
    };
    Ok(ParsedReference { context, path })
}

/// A live handle to a referenced value
#[derive(Clone, Debug)]
pub struct Reference {
    pub derived: Derived<Value>,
    pub source: Rc<str>,
    /// Where the reference was written
    pub site: Site,
}

impl Reference {
    /// Current value, tracked by the running computation
    pub fn read(&self, graph: &ReactiveGraph) -> Value {
        Reactive::Derived(self.derived).read(graph)
    }

    pub fn handle(&self) -> Reactive {
        Reactive::Derived(self.derived)
    }

    pub fn dispose(&self, graph: &ReactiveGraph) {
        graph.dispose_derived(self.derived);
    }
}

// =============================================================================
// RESOLUTION
// =============================================================================

/// Resolve a context against `from`'s own scope (tracked)
pub(crate) fn resolve_context(inst: &Instantiator, context: &ContextName, from: ShadowId) -> Value {
    let graph = inst.graph();
    match context {
        ContextName::This => Value::Component(from),
        ContextName::Root => Value::Component(inst.root()),
        ContextName::Arguments => Value::unavailable(
            "{arguments} is only bound inside method arguments",
            site_of(inst, from, Vec::new()),
        ),
        ContextName::Named(name) => {
            let Some(scope_cell) = inst.with_shadow(from, |s| s.scope) else {
                return Value::unavailable("resolving component is gone", None);
            };
            let found = graph
                .get(scope_cell)
                .and_then(|snapshot| snapshot.own_scope.lookup(graph, name));
            match found {
                Some(record) => Value::Component(record.value),
                None => Value::unavailable(
                    format!("context \"{}\" is not in scope", name),
                    site_of(inst, from, Vec::new()),
                ),
            }
        }
    }
}

/// Create a live handle for `source`, resolved from `from`
pub(crate) fn fetch_context_reference(
    inst: &Instantiator,
    source: &str,
    from: ShadowId,
    segs: Vec<String>,
) -> Result<Reference> {
    let parsed = parse_reference(source)?;
    let site = Site::new(from, inst.path_of(from).unwrap_or_default(), segs);
    let this = inst.weak();
    let derived = inst.graph().create_derived(move |graph| {
        let Some(inst) = this.upgrade() else {
            return Value::unavailable("instantiator dropped", None);
        };
        let start = resolve_context(&inst, &parsed.context, from);
        walk(&inst, graph, start, &parsed.path, from)
    });
    Ok(Reference {
        derived,
        source: Rc::from(source),
        site,
    })
}

fn site_of(inst: &Instantiator, component: ShadowId, segs: Vec<String>) -> Option<Site> {
    inst.path_of(component)
        .map(|path| Site::new(component, path, segs))
}

fn walk(
    inst: &Instantiator,
    graph: &ReactiveGraph,
    start: Value,
    path: &[String],
    from: ShadowId,
) -> Value {
    settle(graph, follow(inst, graph, start, path, from))
}

/// Follow `path` from `start`, dereferencing reactive steps on the way
///
/// The value reached is dereferenced but not settled.
pub(crate) fn follow(
    inst: &Instantiator,
    graph: &ReactiveGraph,
    start: Value,
    path: &[String],
    from: ShadowId,
) -> Value {
    let mut current = start;
    for (depth, segment) in path.iter().enumerate() {
        current = match deref(graph, current) {
            Value::Unavailable(u) => return Value::Unavailable(u),
            Value::Component(id) => component_member(inst, graph, id, segment),
            Value::Map(table) => table.get(segment).cloned().unwrap_or_else(|| {
                Value::unavailable(
                    format!("no key \"{}\"", segment),
                    site_of(inst, from, path[..=depth].to_vec()),
                )
            }),
            Value::List(items) => segment
                .parse::<usize>()
                .ok()
                .and_then(|index| items.get(index).cloned())
                .unwrap_or_else(|| {
                    Value::unavailable(
                        format!("no list index \"{}\"", segment),
                        site_of(inst, from, path[..=depth].to_vec()),
                    )
                }),
            other => Value::unavailable(
                format!("cannot read \"{}\" of a {}", segment, other.kind()),
                site_of(inst, from, path[..=depth].to_vec()),
            ),
        };
    }
    deref(graph, current)
}

/// One key of a component: its expanded configuration first, then children
fn component_member(inst: &Instantiator, graph: &ReactiveGraph, id: ShadowId, key: &str) -> Value {
    let Some((expanded, children_version, path)) =
        inst.with_shadow(id, |s| (s.expanded, s.children_version, s.path.clone()))
    else {
        return Value::unavailable("component has been destroyed", None);
    };
    let expanded = graph.get(expanded).unwrap_or_default();
    if let Value::Unavailable(_) = expanded {
        return expanded;
    }
    let member = expanded.as_map().and_then(|table| table.get(key)).cloned();
    let _ = graph.get(children_version);
    if let Some(value) = member {
        return match value {
            Value::Component(child) if !inst.is_alive(child) => Value::unavailable(
                format!("component at \"{}\" has been destroyed", key),
                Some(Site::new(id, path, vec![key.to_string()])),
            ),
            other => other,
        };
    }
    match inst.child_component(id, key) {
        Some(child) => Value::Component(child),
        None => Value::unavailable(
            format!("no key \"{}\"", key),
            Some(Site::new(id, path, vec![key.to_string()])),
        ),
    }
}

/// Read through reactive handles until a non-reactive value is reached
pub fn deref(graph: &ReactiveGraph, value: Value) -> Value {
    let mut value = value;
    while let Value::Reactive(handle) = value {
        value = handle.read(graph);
    }
    value
}

/// Replace every reactive handle in a tree by its current value
///
/// Components stay as handles.
pub fn settle(graph: &ReactiveGraph, value: Value) -> Value {
    match deref(graph, value) {
        Value::Map(table) => Value::map(
            table
                .iter()
                .map(|(key, value)| (key.clone(), settle(graph, value.clone())))
                .collect(),
        ),
        Value::List(items) => Value::list(
            items
                .iter()
                .map(|item| settle(graph, item.clone()))
                .collect(),
        ),
        other => other,
    }
}

impl Instantiator {
    /// Resolve `self`, `/` or a scope name as seen from `from` (tracked)
    pub fn resolve_context(&self, context: &str, from: ShadowId) -> Value {
        let context = match context {
            "self" => ContextName::This,
            "/" => ContextName::Root,
            "arguments" => ContextName::Arguments,
            name => ContextName::Named(name.to_string()),
        };
        resolve_context(self, &context, from)
    }

    /// Live handle to the value `source` names, resolved from `from`
    ///
    /// The handle stays registered until [`release_reference`] is called
    /// with it.
    ///
    /// [`release_reference`]: Instantiator::release_reference
    pub fn fetch_context_reference(&self, source: &str, from: ShadowId) -> Result<Reference> {
        fetch_context_reference(self, source, from, Vec::new())
    }

    pub fn release_reference(&self, reference: &Reference) {
        reference.dispose(self.graph());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_reference_forms() {
        let parsed = parse_reference("{self}.count").unwrap();
        assert_eq!(parsed.context, ContextName::This);
        assert_eq!(parsed.path, vec!["count"]);

        let parsed = parse_reference("{/}app.header").unwrap();
        assert_eq!(parsed.context, ContextName::Root);
        assert_eq!(parsed.path, vec!["app", "header"]);

        let parsed = parse_reference("{ui.card}").unwrap();
        assert_eq!(parsed.context, ContextName::Named("ui.card".into()));
        assert!(parsed.path.is_empty());

        let parsed = parse_reference("{arguments}.1").unwrap();
        assert_eq!(parsed.context, ContextName::Arguments);
        assert_eq!(parsed.path, vec!["1"]);
    }

    #[test]
    fn test_parse_reference_rejects_malformed() {
        for source in ["self.count", "{self.count", "{}.x", "{self}.a..b", "{self}."] {
            let err = parse_reference(source).unwrap_err();
            assert!(
                matches!(err, InstantiatorError::MalformedReference { .. }),
                "{} should be malformed",
                source
            );
        }
    }

    #[test]
    fn test_settle_reads_through_cells() {
        let graph = ReactiveGraph::new();
        let inner = graph.create_signal(Value::from(5));
        let outer = graph.create_signal(Value::Reactive(Reactive::Cell(inner)));

        let mut table = crate::value::Table::new();
        table.insert("n".into(), Value::Reactive(Reactive::Cell(outer)));
        let settled = settle(&graph, Value::map(table));
        assert_eq!(settled.as_map().unwrap()["n"].as_f64(), Some(5.0));
    }
}
