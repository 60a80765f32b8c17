//! Named layers, functions and linkage rules
//!
//! Every registry entry lives in a reactive cell, so a merge or computed
//! binding that looks up a name which is not defined yet reads `None`,
//! records the dependency, and reruns once the name gets defined.

use std::cell::RefCell;
use std::rc::Rc;

use fluid_core::reactive::{ReactiveGraph, Signal};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::layer::{normalize_layer, Layer, LAYERS_KEY};
use crate::shadow::ShadowId;
use crate::value::{NativeFn, Value};

/// Name-addressed reactive slots
struct NamedCells<T: Clone + 'static> {
    graph: Rc<ReactiveGraph>,
    cells: RefCell<FxHashMap<String, Signal<Option<T>>>>,
}

impl<T: Clone + 'static> NamedCells<T> {
    fn new(graph: Rc<ReactiveGraph>) -> Self {
        Self {
            graph,
            cells: RefCell::new(FxHashMap::default()),
        }
    }

    fn cell(&self, name: &str) -> Signal<Option<T>> {
        if let Some(cell) = self.cells.borrow().get(name) {
            return *cell;
        }
        let cell = self.graph.create_signal(None);
        self.cells.borrow_mut().insert(name.to_string(), cell);
        cell
    }

    fn put(&self, name: &str, value: Option<T>) {
        let cell = self.cell(name);
        self.graph.set(cell, value);
    }

    /// Tracked lookup; leaves a placeholder cell behind for unknown names
    fn get(&self, name: &str) -> Option<T> {
        let cell = self.cell(name);
        self.graph.get(cell).flatten()
    }

    fn defined(&self) -> usize {
        let cells: Vec<_> = self.cells.borrow().values().copied().collect();
        cells
            .into_iter()
            .filter(|cell| matches!(self.graph.get_untracked(*cell), Some(Some(_))))
            .count()
    }
}

// =============================================================================
// LAYERS
// =============================================================================

/// Named, inheritable layer definitions
pub struct LayerRegistry {
    entries: NamedCells<Rc<Layer>>,
}

impl LayerRegistry {
    pub fn new(graph: Rc<ReactiveGraph>) -> Self {
        Self {
            entries: NamedCells::new(graph),
        }
    }

    /// Define or redefine a layer; merges that use it rerun
    pub fn define(&self, name: &str, layer: Layer) {
        tracing::debug!("defining layer {:?}", name);
        self.entries.put(name, Some(Rc::new(normalize_layer(&layer))));
    }

    /// Define a layer from a JSON object
    pub fn define_json(&self, name: &str, json: serde_json::Value) {
        self.define(name, Value::from_json(json).into_table().unwrap_or_default());
    }

    pub fn remove(&self, name: &str) {
        self.entries.put(name, None);
    }

    /// Tracked lookup of one layer
    pub fn get(&self, name: &str) -> Option<Rc<Layer>> {
        self.entries.get(name)
    }

    pub fn len(&self) -> usize {
        self.entries.defined()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Expand layer names through `$layers` inheritance
    ///
    /// Returns the chain most-general first with each layer appearing once.
    /// A missing layer or circular inheritance makes the whole chain
    /// unavailable; the error string is the cause.
    pub fn resolve_hierarchy(
        &self,
        names: &[String],
    ) -> std::result::Result<Vec<(String, Rc<Layer>)>, String> {
        let mut chain = Vec::new();
        let mut emitted = FxHashSet::default();
        let mut stack = Vec::new();
        for name in names {
            self.visit(name, &mut stack, &mut emitted, &mut chain)?;
        }
        Ok(chain)
    }

    fn visit(
        &self,
        name: &str,
        stack: &mut Vec<String>,
        emitted: &mut FxHashSet<String>,
        chain: &mut Vec<(String, Rc<Layer>)>,
    ) -> std::result::Result<(), String> {
        if emitted.contains(name) {
            return Ok(());
        }
        if stack.iter().any(|entry| entry == name) {
            stack.push(name.to_string());
            return Err(format!(
                "circular layer inheritance: {}",
                stack.join(" -> ")
            ));
        }
        let Some(layer) = self.get(name) else {
            return Err(format!("layer \"{}\" is not defined", name));
        };

        stack.push(name.to_string());
        if let Some(parents) = layer.get(LAYERS_KEY) {
            for parent in parents.string_list() {
                self.visit(&parent, stack, emitted, chain)?;
            }
        }
        stack.pop();

        emitted.insert(name.to_string());
        chain.push((name.to_string(), layer));
        Ok(())
    }
}

// =============================================================================
// FUNCTIONS
// =============================================================================

/// Native functions addressed by `funcName`
pub struct FunctionRegistry {
    entries: NamedCells<NativeFn>,
}

impl FunctionRegistry {
    pub fn new(graph: Rc<ReactiveGraph>) -> Self {
        Self {
            entries: NamedCells::new(graph),
        }
    }

    pub fn register<F>(&self, name: &str, body: F)
    where
        F: Fn(&crate::Instantiator, &[Value]) -> Value + 'static,
    {
        self.register_fn(NativeFn::new(name, body));
    }

    pub fn register_fn(&self, func: NativeFn) {
        let name = func.name().to_string();
        tracing::debug!("registering function {:?}", name);
        self.entries.put(&name, Some(func));
    }

    pub fn unregister(&self, name: &str) {
        self.entries.put(name, None);
    }

    /// Tracked lookup
    pub fn get(&self, name: &str) -> Option<NativeFn> {
        self.entries.get(name)
    }

    pub fn len(&self) -> usize {
        self.entries.defined()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// =============================================================================
// LINKAGES
// =============================================================================

/// Co-occurrence rule: carrying every input layer adds the output layers
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LinkageRule {
    /// Component whose configuration declared the rule
    pub owner: ShadowId,
    /// Key path of the declaring record inside the owner
    pub key: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
}

impl LinkageRule {
    fn fires(&self, carried: &[String]) -> bool {
        !self.inputs.is_empty() && self.inputs.iter().all(|input| carried.contains(input))
    }
}

/// Reactive list of linkage rules, read by every merge
pub struct LinkageRegistry {
    graph: Rc<ReactiveGraph>,
    rules: Signal<Rc<Vec<LinkageRule>>>,
}

impl LinkageRegistry {
    pub fn new(graph: Rc<ReactiveGraph>) -> Self {
        let rules = graph.create_signal(Rc::new(Vec::new()));
        Self { graph, rules }
    }

    fn current(&self) -> Rc<Vec<LinkageRule>> {
        self.graph.get_untracked(self.rules).unwrap_or_default()
    }

    /// Add or replace the rule declared at `(owner, key)`
    pub fn register(&self, rule: LinkageRule) {
        let current = self.current();
        let existing = current
            .iter()
            .position(|r| r.owner == rule.owner && r.key == rule.key);
        if let Some(index) = existing {
            if current[index] == rule {
                return;
            }
        }
        tracing::debug!(
            "linkage {:?} -> {:?} registered at {:?}",
            rule.inputs,
            rule.outputs,
            rule.key
        );
        let mut next = current.as_ref().clone();
        match existing {
            Some(index) => next[index] = rule,
            None => next.push(rule),
        }
        self.graph.set(self.rules, Rc::new(next));
    }

    pub fn remove(&self, owner: ShadowId, key: &str) {
        self.retain(|r| !(r.owner == owner && r.key == key));
    }

    /// Drop every rule declared by a component
    pub fn remove_owner(&self, owner: ShadowId) {
        self.retain(|r| r.owner != owner);
    }

    fn retain(&self, keep: impl Fn(&LinkageRule) -> bool) {
        let current = self.current();
        if current.iter().all(&keep) {
            return;
        }
        let next: Vec<LinkageRule> = current.iter().filter(|r| keep(r)).cloned().collect();
        self.graph.set(self.rules, Rc::new(next));
    }

    /// Outputs of every rule that fires for `carried` and are not yet carried
    ///
    /// Tracked: a merge that consults linkages reruns when rules change.
    pub fn outputs_for(&self, carried: &[String]) -> Vec<String> {
        let rules = self.graph.get(self.rules).unwrap_or_default();
        let mut outputs = Vec::new();
        for rule in rules.iter().filter(|rule| rule.fires(carried)) {
            for output in &rule.outputs {
                if !carried.contains(output) && !outputs.contains(output) {
                    outputs.push(output.clone());
                }
            }
        }
        outputs
    }

    pub fn len(&self) -> usize {
        self.current().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use slotmap::KeyData;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn chain_names(chain: &[(String, Rc<Layer>)]) -> Vec<&str> {
        chain.iter().map(|(name, _)| name.as_str()).collect()
    }

    #[test]
    fn test_hierarchy_most_general_first() {
        let graph = Rc::new(ReactiveGraph::new());
        let layers = LayerRegistry::new(graph);
        layers.define_json("base", json!({"a": 1}));
        layers.define_json("button", json!({"$layers": "base", "b": 2}));
        layers.define_json("primary", json!({"$layers": ["button", "base"], "c": 3}));

        let chain = layers.resolve_hierarchy(&names(&["primary"])).unwrap();
        assert_eq!(chain_names(&chain), vec!["base", "button", "primary"]);
    }

    #[test]
    fn test_hierarchy_missing_and_circular() {
        let graph = Rc::new(ReactiveGraph::new());
        let layers = LayerRegistry::new(graph);
        layers.define_json("a", json!({"$layers": ["b"]}));
        layers.define_json("b", json!({"$layers": ["a"]}));

        let missing = layers.resolve_hierarchy(&names(&["nope"])).unwrap_err();
        assert!(missing.contains("nope"));

        let cycle = layers.resolve_hierarchy(&names(&["a"])).unwrap_err();
        assert!(cycle.contains("circular"));
    }

    #[test]
    fn test_lookup_of_undefined_layer_is_reactive() {
        let graph = Rc::new(ReactiveGraph::new());
        let layers = Rc::new(LayerRegistry::new(graph.clone()));

        let lookup = layers.clone();
        let found = graph.create_derived(move |_| lookup.get("late").is_some());
        assert_eq!(graph.get_derived(found), Some(false));

        layers.define_json("late", json!({}));
        assert_eq!(graph.get_derived(found), Some(true));
        assert_eq!(layers.len(), 1);
    }

    #[test]
    fn test_linkage_outputs() {
        let graph = Rc::new(ReactiveGraph::new());
        let linkages = LinkageRegistry::new(graph);
        let owner = ShadowId::from(KeyData::from_ffi(1));
        linkages.register(LinkageRule {
            owner,
            key: "rule".into(),
            inputs: names(&["a", "b"]),
            outputs: names(&["ab"]),
        });

        assert!(linkages.outputs_for(&names(&["a"])).is_empty());
        assert_eq!(linkages.outputs_for(&names(&["b", "a"])), names(&["ab"]));
        assert!(linkages.outputs_for(&names(&["a", "b", "ab"])).is_empty());

        linkages.remove_owner(owner);
        assert!(linkages.is_empty());
    }
}
