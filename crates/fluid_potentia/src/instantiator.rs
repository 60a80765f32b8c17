//! Shadow registry and instantiation entry points
//!
//! The [`Instantiator`] is the explicit context object every operation goes
//! through. It owns the reactive graph, the registries, the shadow arena and
//! the path index. Entry points (`push_potentia`, `destroy`, `inject`,
//! proxy writes and calls) run inside one graph batch; structural errors
//! raised by reactive reruns during that batch are collected and the first
//! one is returned by the outermost entry point.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use fluid_core::reactive::ReactiveGraph;
use indexmap::{IndexMap, IndexSet};
use rustc_hash::FxHashMap;
use slotmap::SlotMap;

use crate::config::InstantiatorConfig;
use crate::error::{InstantiatorError, Result};
use crate::events::{LifecycleEvent, LifecycleEventKind, ListenerId, Listeners};
use crate::expand::{self, Expansion};
use crate::layer::{MergeRecord, Potentia};
use crate::merge;
use crate::proxy::Proxy;
use crate::registry::{FunctionRegistry, LayerRegistry, LinkageRegistry};
use crate::scope::{self, Priority, ScopeRecord, ScopeSnapshot};
use crate::shadow::{join_path, last_segment, LifecycleStatus, PathEntry, Shadow, ShadowId};
use crate::value::{Table, Value};

/// Context object for one component tree
pub struct Instantiator {
    this: Weak<Instantiator>,
    graph: Rc<ReactiveGraph>,
    config: InstantiatorConfig,
    layers: LayerRegistry,
    functions: FunctionRegistry,
    linkages: LinkageRegistry,
    pub(crate) shadows: RefCell<SlotMap<ShadowId, Shadow>>,
    pub(crate) paths: RefCell<FxHashMap<String, PathEntry>>,
    root: ShadowId,
    listeners: Listeners,
    faults: RefCell<Vec<InstantiatorError>>,
    proxies: RefCell<FxHashMap<(ShadowId, Vec<String>), Rc<Proxy>>>,
    entry_depth: Cell<u32>,
}

impl Instantiator {
    pub fn new() -> Rc<Self> {
        Self::with_config(InstantiatorConfig::default())
    }

    /// Create an instantiator and record the tree root at path `""`
    pub fn with_config(config: InstantiatorConfig) -> Rc<Self> {
        let graph = Rc::new(ReactiveGraph::with_max_flush_rounds(config.max_flush_rounds));

        let children_version = graph.create_signal(0u64);
        let root_shadow = Shadow {
            path: String::new(),
            key: String::new(),
            member_name: String::new(),
            parent: None,
            child_components: IndexMap::new(),
            injected_children: IndexMap::new(),
            injected_paths: IndexSet::new(),
            status: LifecycleStatus::Live,
            potentia: graph.create_signal(Potentia::default()),
            merge: None,
            scope: graph.create_signal(Rc::new(ScopeSnapshot::root(children_version))),
            children_version,
            expanded: graph.create_signal(Value::map(Table::new())),
            expansion: Expansion::default(),
            framework_effects: Vec::new(),
        };
        let mut shadows = SlotMap::with_key();
        let root = shadows.insert(root_shadow);
        let mut paths = FxHashMap::default();
        paths.insert(
            String::new(),
            PathEntry {
                component: root,
                parent: None,
                key: String::new(),
                created: true,
            },
        );
        tracing::debug!("recorded tree root {:?}", root);

        let layers = LayerRegistry::new(graph.clone());
        let functions = FunctionRegistry::new(graph.clone());
        let linkages = LinkageRegistry::new(graph.clone());

        Rc::new_cyclic(|this| Self {
            this: this.clone(),
            graph,
            config,
            layers,
            functions,
            linkages,
            shadows: RefCell::new(shadows),
            paths: RefCell::new(paths),
            root,
            listeners: Listeners::default(),
            faults: RefCell::new(Vec::new()),
            proxies: RefCell::new(FxHashMap::default()),
            entry_depth: Cell::new(0),
        })
    }

    // =========================================================================
    // ACCESSORS
    // =========================================================================

    pub fn graph(&self) -> &ReactiveGraph {
        &self.graph
    }

    pub fn config(&self) -> &InstantiatorConfig {
        &self.config
    }

    pub fn layers(&self) -> &LayerRegistry {
        &self.layers
    }

    pub fn functions(&self) -> &FunctionRegistry {
        &self.functions
    }

    pub fn linkages(&self) -> &LinkageRegistry {
        &self.linkages
    }

    /// The synthetic tree root
    pub fn root(&self) -> ShadowId {
        self.root
    }

    pub(crate) fn weak(&self) -> Weak<Instantiator> {
        self.this.clone()
    }

    pub(crate) fn with_shadow<R>(&self, id: ShadowId, f: impl FnOnce(&Shadow) -> R) -> Option<R> {
        self.shadows.borrow().get(id).map(f)
    }

    pub(crate) fn with_shadow_mut<R>(
        &self,
        id: ShadowId,
        f: impl FnOnce(&mut Shadow) -> R,
    ) -> Option<R> {
        self.shadows.borrow_mut().get_mut(id).map(f)
    }

    // =========================================================================
    // QUERIES
    // =========================================================================

    /// Component registered at `path`, created or injected
    pub fn component_at(&self, path: &str) -> Option<ShadowId> {
        self.paths.borrow().get(path).map(|entry| entry.component)
    }

    /// Component created or injected under `parent` at `key`
    pub fn child_component(&self, parent: ShadowId, key: &str) -> Option<ShadowId> {
        self.with_shadow(parent, |s| {
            s.child_components
                .get(key)
                .or_else(|| s.injected_children.get(key))
                .copied()
        })
        .flatten()
    }

    /// Children created in place, in creation order
    pub fn children_of(&self, id: ShadowId) -> Vec<(String, ShadowId)> {
        self.with_shadow(id, |s| {
            s.child_components
                .iter()
                .map(|(key, child)| (key.clone(), *child))
                .collect()
        })
        .unwrap_or_default()
    }

    /// Canonical path, where the component was created
    pub fn path_of(&self, id: ShadowId) -> Option<String> {
        self.with_shadow(id, |s| s.path.clone())
    }

    pub fn member_name_of(&self, id: ShadowId) -> Option<String> {
        self.with_shadow(id, |s| s.member_name.clone())
    }

    pub fn parent_of(&self, id: ShadowId) -> Option<ShadowId> {
        self.with_shadow(id, |s| s.parent).flatten()
    }

    pub fn status_of(&self, id: ShadowId) -> Option<LifecycleStatus> {
        self.with_shadow(id, |s| s.status)
    }

    /// Whether the component exists and teardown has not started
    pub fn is_alive(&self, id: ShadowId) -> bool {
        self.status_of(id).map_or(false, |status| !status.is_ending())
    }

    /// Paths other than the canonical one at which the component is visible
    pub fn injected_paths_of(&self, id: ShadowId) -> Vec<String> {
        self.with_shadow(id, |s| s.injected_paths.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Current desired state of a component
    pub fn potentia_of(&self, id: ShadowId) -> Option<Potentia> {
        let cell = self.with_shadow(id, |s| s.potentia)?;
        self.graph.get_untracked(cell)
    }

    /// Expanded configuration of a component (tracked)
    pub fn expanded(&self, id: ShadowId) -> Option<Value> {
        let cell = self.with_shadow(id, |s| s.expanded)?;
        self.graph.get(cell)
    }

    /// Names the component can be found by, with their priority
    pub fn context_names(&self, id: ShadowId) -> Vec<(String, Priority)> {
        let Some(cell) = self.with_shadow(id, |s| s.scope) else {
            return Vec::new();
        };
        self.graph
            .get_untracked(cell)
            .map(|snapshot| {
                snapshot
                    .context_hash
                    .iter()
                    .map(|(name, priority)| (name.clone(), *priority))
                    .collect()
            })
            .unwrap_or_default()
    }

    // =========================================================================
    // LISTENERS & FAULTS
    // =========================================================================

    /// Subscribe to one kind of lifecycle notification
    pub fn on<F>(&self, kind: LifecycleEventKind, listener: F) -> ListenerId
    where
        F: Fn(&Instantiator, &LifecycleEvent) -> anyhow::Result<()> + 'static,
    {
        self.listeners.add(Some(kind), Rc::new(listener))
    }

    /// Subscribe to every lifecycle notification
    pub fn on_any<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&Instantiator, &LifecycleEvent) -> anyhow::Result<()> + 'static,
    {
        self.listeners.add(None, Rc::new(listener))
    }

    pub fn off(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    pub(crate) fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    pub(crate) fn event(
        &self,
        kind: LifecycleEventKind,
        component: ShadowId,
        path: &str,
        key: &str,
        parent: Option<ShadowId>,
        created: bool,
    ) -> LifecycleEvent {
        LifecycleEvent {
            kind,
            component,
            path: path.to_string(),
            member_name: last_segment(key).to_string(),
            parent,
            created,
        }
    }

    pub(crate) fn emit(&self, event: LifecycleEvent) {
        tracing::debug!("{} {:?}", event.kind, event.path);
        for listener in self.listeners.matching(event.kind) {
            if let Err(err) = listener(self, &event) {
                let err = err.context(format!("{} listener for {:?}", event.kind, event.path));
                self.record_fault(InstantiatorError::Hook(err));
            }
        }
    }

    /// Keep a structural error for the outermost entry point
    pub(crate) fn record_fault(&self, error: InstantiatorError) {
        tracing::warn!("{}", error);
        let mut faults = self.faults.borrow_mut();
        if self.entry_depth.get() == 0 {
            let cap = self.config.max_pending_faults;
            if cap == 0 {
                return;
            }
            if faults.len() >= cap {
                let excess = faults.len() + 1 - cap;
                faults.drain(..excess);
            }
        }
        faults.push(error);
    }

    /// Structural errors raised outside any entry point, oldest first
    pub fn take_faults(&self) -> Vec<InstantiatorError> {
        std::mem::take(&mut *self.faults.borrow_mut())
    }

    /// Run an entry point in one batch and surface collected faults
    ///
    /// Only faults raised while this entry point ran are surfaced; older
    /// ones stay queued for `take_faults`.
    pub(crate) fn entry<R>(&self, f: impl FnOnce() -> Result<R>) -> Result<R> {
        let depth = self.entry_depth.get();
        let mark = self.faults.borrow().len();
        self.entry_depth.set(depth + 1);
        let result = self.graph.batch(f);
        self.entry_depth.set(depth);
        if depth > 0 {
            return result;
        }

        let raised = {
            let mut faults = self.faults.borrow_mut();
            let mark = mark.min(faults.len());
            faults.split_off(mark)
        };
        let value = result?;
        match raised.into_iter().next() {
            Some(fault) => Err(fault),
            None => Ok(value),
        }
    }

    // =========================================================================
    // POTENTIA
    // =========================================================================

    /// Push desired state for the position `key` under `parent`
    ///
    /// Creates the component on first push. Later pushes replace records by
    /// type; an empty potentia destroys the component. Returns the live
    /// component's proxy, or `None` when nothing is configured there.
    pub fn push_potentia(
        &self,
        parent: ShadowId,
        key: &str,
        records: Vec<MergeRecord>,
        layer_names: Option<Vec<String>>,
    ) -> Result<Option<Rc<Proxy>>> {
        let id = self.entry(|| self.push_inner(parent, key, records, layer_names))?;
        Ok(id.and_then(|id| self.proxy(id)))
    }

    pub(crate) fn push_inner(
        &self,
        parent: ShadowId,
        key: &str,
        records: Vec<MergeRecord>,
        layer_names: Option<Vec<String>>,
    ) -> Result<Option<ShadowId>> {
        let Some((parent_path, parent_status)) = self.with_shadow(parent, |s| (s.path.clone(), s.status))
        else {
            return Err(InstantiatorError::NotRegistered {
                path: key.to_string(),
            });
        };
        if parent_status.is_ending() {
            return Err(InstantiatorError::AlreadyDestroyed {
                path: parent_path,
                status: parent_status,
            });
        }
        if key.is_empty() || key.split('.').any(str::is_empty) {
            return Err(InstantiatorError::MalformedRecord {
                kind: "component".to_string(),
                site: parent_path,
                reason: format!("invalid member name {:?}", key),
            });
        }

        let path = join_path(&parent_path, key);
        // Nothing configured here: the sentinel for "destroy"
        let sentinel = records.is_empty() && layer_names.as_ref().map_or(true, Vec::is_empty);
        let existing = self.paths.borrow().get(&path).cloned();
        match existing {
            Some(entry) if entry.created && entry.parent == Some(parent) => {
                let id = entry.component;
                let Some((cell, status)) = self.with_shadow(id, |s| (s.potentia, s.status)) else {
                    return Err(InstantiatorError::NotRegistered { path });
                };
                if status.is_ending() {
                    return Err(InstantiatorError::AlreadyDestroyed { path, status });
                }
                let previous = self.graph.get_untracked(cell).unwrap_or_default();
                let mut potentia = previous.clone();
                potentia.absorb(records, layer_names);
                if sentinel || potentia.is_empty() {
                    tracing::debug!("empty potentia pushed at {:?}", path);
                    self.destroy_path(&path)?;
                    return Ok(None);
                }
                if potentia != previous {
                    self.graph.set(cell, potentia);
                }
                Ok(Some(id))
            }
            Some(_) => Err(InstantiatorError::PathOccupied { path }),
            None => {
                let mut potentia = Potentia::default();
                potentia.absorb(records, layer_names);
                if potentia.is_empty() {
                    return Ok(None);
                }
                self.create_shadow(parent, key, path, potentia).map(Some)
            }
        }
    }

    /// Allocate a shadow at its point of construction
    fn create_shadow(
        &self,
        parent: ShadowId,
        key: &str,
        path: String,
        potentia: Potentia,
    ) -> Result<ShadowId> {
        let graph = &*self.graph;
        let shadow = Shadow {
            path: path.clone(),
            key: key.to_string(),
            member_name: last_segment(key).to_string(),
            parent: Some(parent),
            child_components: IndexMap::new(),
            injected_children: IndexMap::new(),
            injected_paths: IndexSet::new(),
            status: LifecycleStatus::Constructing,
            potentia: graph.create_signal(potentia),
            merge: None,
            scope: graph.create_signal(Rc::new(ScopeSnapshot::detached())),
            children_version: graph.create_signal(0u64),
            expanded: graph.create_signal(Value::map(Table::new())),
            expansion: Expansion::default(),
            framework_effects: Vec::new(),
        };
        let potentia_cell = shadow.potentia;
        let id = self.shadows.borrow_mut().insert(shadow);
        self.paths.borrow_mut().insert(
            path.clone(),
            PathEntry {
                component: id,
                parent: Some(parent),
                key: key.to_string(),
                created: true,
            },
        );
        let parent_cells = self.with_shadow_mut(parent, |p| {
            p.child_components.insert(key.to_string(), id);
            (p.children_version, p.scope)
        });
        tracing::debug!("creating component at {:?}", path);

        let merge = merge::create_merge(self, id, potentia_cell);
        self.with_shadow_mut(id, |s| s.merge = Some(merge));

        // Registry and scope are settled before expansion constructs children
        if let Some((children_version, parent_scope)) = parent_cells {
            self.graph.update(children_version, |v| v + 1);
            let names = graph
                .get_derived_untracked(merge)
                .map(|outcome| outcome.direct_names)
                .unwrap_or_default();
            if let Some(parent_snapshot) = graph.get_untracked(parent_scope) {
                scope::rebuild(self, id, &names, &parent_snapshot);
            }
        }
        self.emit(self.event(
            LifecycleEventKind::ComponentAttach,
            id,
            &path,
            key,
            Some(parent),
            true,
        ));
        if !self.is_alive(id) {
            return Ok(id);
        }

        let scope_effect = scope::create_scope_effect(self, id, parent, merge);
        let expand_effect = expand::create_expansion_effect(self, id, merge);
        self.with_shadow_mut(id, |s| {
            s.framework_effects.push(scope_effect);
            s.framework_effects.push(expand_effect);
        });
        Ok(id)
    }

    // =========================================================================
    // INJECTION
    // =========================================================================

    /// Make an existing component visible under `parent` at `key`
    ///
    /// The component keeps its canonical path and is not owned by `parent`.
    pub fn inject(&self, parent: ShadowId, key: &str, component: ShadowId) -> Result<()> {
        self.entry(|| self.record_injection(parent, key, Some(component)))
    }

    /// Point the injection at `key` to `target`, or clear it with `None`
    pub(crate) fn record_injection(
        &self,
        parent: ShadowId,
        key: &str,
        target: Option<ShadowId>,
    ) -> Result<()> {
        let Some(parent_path) = self.path_of(parent) else {
            return Err(InstantiatorError::NotRegistered {
                path: key.to_string(),
            });
        };
        let path = join_path(&parent_path, key);
        let existing = self.paths.borrow().get(&path).cloned();
        if let Some(entry) = existing {
            if Some(entry.component) == target {
                return Ok(());
            }
            if entry.created {
                return Err(InstantiatorError::PathOccupied { path });
            }
            self.remove_injection(&path);
        }
        let Some(target) = target else {
            return Ok(());
        };
        let Some(status) = self.status_of(target) else {
            return Err(InstantiatorError::NotRegistered { path });
        };
        if status.is_ending() {
            return Err(InstantiatorError::AlreadyDestroyed {
                path: self.path_of(target).unwrap_or_default(),
                status,
            });
        }

        self.paths.borrow_mut().insert(
            path.clone(),
            PathEntry {
                component: target,
                parent: Some(parent),
                key: key.to_string(),
                created: false,
            },
        );
        let parent_cells = self.with_shadow_mut(parent, |p| {
            p.injected_children.insert(key.to_string(), target);
            (p.children_version, p.scope)
        });
        self.with_shadow_mut(target, |t| t.injected_paths.insert(path.clone()));
        if let Some((children_version, scope_cell)) = parent_cells {
            if let Some(snapshot) = self.graph.get_untracked(scope_cell) {
                snapshot.children_scope.claim(
                    &self.graph,
                    last_segment(key),
                    ScopeRecord {
                        value: target,
                        priority: Priority::Member,
                    },
                );
            }
            self.graph.update(children_version, |v| v + 1);
        }
        tracing::debug!("injected {:?} at {:?}", self.path_of(target), path);
        self.emit(self.event(
            LifecycleEventKind::ComponentAttach,
            target,
            &path,
            key,
            Some(parent),
            false,
        ));
        Ok(())
    }

    /// Drop an injected occurrence; created paths are left alone
    pub(crate) fn remove_injection(&self, path: &str) -> bool {
        let entry = {
            let mut paths = self.paths.borrow_mut();
            match paths.get(path) {
                Some(entry) if !entry.created => paths.remove(path),
                _ => None,
            }
        };
        let Some(entry) = entry else {
            return false;
        };

        self.with_shadow_mut(entry.component, |t| t.injected_paths.shift_remove(path));
        let parent_cells = entry.parent.and_then(|parent| {
            self.with_shadow_mut(parent, |p| {
                p.injected_children.shift_remove(&entry.key);
                (p.children_version, p.scope)
            })
        });
        if let Some((children_version, scope_cell)) = parent_cells {
            if let Some(snapshot) = self.graph.get_untracked(scope_cell) {
                snapshot.children_scope.release(
                    &self.graph,
                    last_segment(&entry.key),
                    entry.component,
                );
            }
            self.graph.update(children_version, |v| v + 1);
        }
        self.emit(self.event(
            LifecycleEventKind::ComponentClear,
            entry.component,
            path,
            &entry.key,
            entry.parent,
            false,
        ));
        true
    }

    // =========================================================================
    // PROXIES
    // =========================================================================

    /// Read/write facade over a live component
    pub fn proxy(&self, id: ShadowId) -> Option<Rc<Proxy>> {
        if !self.is_alive(id) {
            return None;
        }
        Some(self.proxy_at(id, Vec::new()))
    }

    /// Proxy for `segs` inside a component, memoized per path
    pub(crate) fn proxy_at(&self, id: ShadowId, segs: Vec<String>) -> Rc<Proxy> {
        let key = (id, segs.clone());
        if let Some(proxy) = self.proxies.borrow().get(&key) {
            return proxy.clone();
        }
        let proxy = Rc::new(Proxy::new(self.weak(), id, segs));
        self.proxies.borrow_mut().insert(key, proxy.clone());
        proxy
    }

    pub(crate) fn forget_proxies(&self, id: ShadowId) {
        self.proxies
            .borrow_mut()
            .retain(|(component, _), _| *component != id);
    }

    pub(crate) fn proxy_count(&self) -> usize {
        self.proxies.borrow().len()
    }
}
