//! Scope resolution
//!
//! Every component carries two name maps:
//!
//! - `children_scope`: what its descendants see. Inherits the parent's own
//!   scope; children claim their names into it so siblings can find them.
//! - `own_scope`: what the component itself sees. Inherits `children_scope`
//!   and adds the component's own names (layer names, nicknames, member
//!   name).
//!
//! Lookups miss through to the inherited map. Both maps are rebuilt as a
//! fresh [`ScopeSnapshot`] whenever the component's layer names or the
//! parent's snapshot change; readers holding the previous snapshot keep a
//! stale but consistent view until they rerun.

use std::cell::RefCell;
use std::rc::Rc;

use fluid_core::reactive::{Derived, Effect, ReactiveGraph, Signal};
use indexmap::IndexMap;
use rustc_hash::FxHashMap;

use crate::instantiator::Instantiator;
use crate::merge::MergeOutcome;
use crate::shadow::{last_segment, ShadowId};

/// Strength of a scope claim; higher wins regardless of write order
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    /// Layer names and their nicknames
    Context = 1,
    /// The member name under the parent
    Member = 2,
}

/// One scope entry
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScopeRecord {
    pub value: ShadowId,
    pub priority: Priority,
}

/// A name map with prototype-style inheritance
///
/// Each name holds every claim made on it. The strongest claim is visible,
/// the latest among equals; weaker claims resurface when it is released.
pub struct Scope {
    parent: Option<Rc<Scope>>,
    entries: RefCell<FxHashMap<String, Vec<ScopeRecord>>>,
    /// Read on lookup, bumped whenever a visible claim changes
    version: Option<Signal<u64>>,
}

fn winner(claims: &[ScopeRecord]) -> Option<ScopeRecord> {
    claims.iter().max_by_key(|record| record.priority).copied()
}

impl Scope {
    /// A scope with nothing to inherit
    pub fn root(version: Option<Signal<u64>>) -> Rc<Self> {
        Rc::new(Self {
            parent: None,
            entries: RefCell::new(FxHashMap::default()),
            version,
        })
    }

    pub fn inherit(parent: &Rc<Scope>, version: Option<Signal<u64>>) -> Rc<Self> {
        Rc::new(Self {
            parent: Some(parent.clone()),
            entries: RefCell::new(FxHashMap::default()),
            version,
        })
    }

    pub fn parent(&self) -> Option<&Rc<Scope>> {
        self.parent.as_ref()
    }

    /// Find a name here or in an inherited map
    ///
    /// Tracked: a computation doing the lookup reruns when any map on the
    /// way changes.
    pub fn lookup(&self, graph: &ReactiveGraph, name: &str) -> Option<ScopeRecord> {
        if let Some(version) = self.version {
            let _ = graph.get(version);
        }
        match self.local(name) {
            Some(record) => Some(record),
            None => self.parent.as_ref()?.lookup(graph, name),
        }
    }

    /// Visible claim defined directly in this map
    pub fn local(&self, name: &str) -> Option<ScopeRecord> {
        self.entries
            .borrow()
            .get(name)
            .and_then(|claims| winner(claims))
    }

    /// Add a claim, replacing an earlier claim by the same component
    ///
    /// Returns whether the visible claim changed.
    pub fn claim(&self, graph: &ReactiveGraph, name: &str, record: ScopeRecord) -> bool {
        let changed = {
            let mut entries = self.entries.borrow_mut();
            let claims = entries.entry(name.to_string()).or_default();
            if claims.last() == Some(&record) {
                return false;
            }
            let before = winner(claims);
            claims.retain(|existing| existing.value != record.value);
            claims.push(record);
            winner(claims) != before
        };
        if changed {
            self.bump(graph);
        }
        changed
    }

    /// Withdraw `value`'s claim on a name; returns whether it had one
    pub fn release(&self, graph: &ReactiveGraph, name: &str, value: ShadowId) -> bool {
        let (present, changed) = {
            let mut entries = self.entries.borrow_mut();
            let Some(claims) = entries.get_mut(name) else {
                return false;
            };
            let before = winner(claims);
            let count = claims.len();
            claims.retain(|existing| existing.value != value);
            let present = claims.len() != count;
            let changed = winner(claims) != before;
            if claims.is_empty() {
                entries.remove(name);
            }
            (present, changed)
        };
        if changed {
            self.bump(graph);
        }
        present
    }

    /// Visible local entries sorted by name
    pub fn entries(&self) -> Vec<(String, ScopeRecord)> {
        let mut entries: Vec<_> = self
            .entries
            .borrow()
            .iter()
            .filter_map(|(name, claims)| winner(claims).map(|record| (name.clone(), record)))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    fn bump(&self, graph: &ReactiveGraph) {
        if let Some(version) = self.version {
            graph.update(version, |v| v + 1);
        }
    }
}

/// The scope state of one component at one point in time
pub struct ScopeSnapshot {
    /// Names this component is known by, with their priority
    pub context_hash: IndexMap<String, Priority>,
    pub children_scope: Rc<Scope>,
    pub own_scope: Rc<Scope>,
    /// The parent's `children_scope` the context hash was claimed into
    pub claimed_in: Option<Rc<Scope>>,
}

impl ScopeSnapshot {
    /// Snapshot of the synthetic root
    pub(crate) fn root(children_version: Signal<u64>) -> Self {
        let children_scope = Scope::root(Some(children_version));
        let own_scope = Scope::inherit(&children_scope, None);
        Self {
            context_hash: IndexMap::new(),
            children_scope,
            own_scope,
            claimed_in: None,
        }
    }

    /// Stand-in until the first build; inherits nothing
    pub(crate) fn detached() -> Self {
        let children_scope = Scope::root(None);
        let own_scope = Scope::inherit(&children_scope, None);
        Self {
            context_hash: IndexMap::new(),
            children_scope,
            own_scope,
            claimed_in: None,
        }
    }
}

/// Names a component is known by: layer names and nicknames at context
/// priority, then the member name at member priority
pub fn context_hash(layer_names: &[String], member_name: &str) -> IndexMap<String, Priority> {
    let mut hash = IndexMap::new();
    for name in layer_names {
        hash.insert(name.clone(), Priority::Context);
        let nickname = last_segment(name);
        if nickname != name {
            hash.entry(nickname.to_string()).or_insert(Priority::Context);
        }
    }
    if !member_name.is_empty() {
        hash.insert(member_name.to_string(), Priority::Member);
    }
    hash
}

// =============================================================================
// MAINTENANCE
// =============================================================================

/// Keep a component's snapshot in step with its names and its parent
pub(crate) fn create_scope_effect(
    inst: &Instantiator,
    id: ShadowId,
    parent: ShadowId,
    merge: Derived<MergeOutcome>,
) -> Effect {
    let this = inst.weak();
    inst.graph().create_effect(move |graph| {
        let Some(inst) = this.upgrade() else {
            return;
        };
        let names = graph
            .get_derived(merge)
            .map(|outcome| outcome.direct_names)
            .unwrap_or_default();
        let Some(parent_cell) = inst.with_shadow(parent, |s| s.scope) else {
            return;
        };
        let Some(parent_snapshot) = graph.get(parent_cell) else {
            return;
        };
        graph.untrack(|| rebuild(&inst, id, &names, &parent_snapshot));
    })
}

/// Rebuild a component's snapshot if its names or its parent's scope moved
pub(crate) fn rebuild(
    inst: &Instantiator,
    id: ShadowId,
    layer_names: &[String],
    parent_snapshot: &Rc<ScopeSnapshot>,
) {
    let graph = inst.graph();
    let Some((member_name, parent, scope_cell, children_version, injected)) =
        inst.with_shadow(id, |s| {
            (
                s.member_name.clone(),
                s.parent,
                s.scope,
                s.children_version,
                s.injected_children
                    .iter()
                    .map(|(key, child)| (last_segment(key).to_string(), *child))
                    .collect::<Vec<_>>(),
            )
        })
    else {
        return;
    };
    let Some(previous) = graph.get_untracked(scope_cell) else {
        return;
    };

    let hash = context_hash(layer_names, &member_name);
    let same_parent = previous
        .children_scope
        .parent()
        .map_or(false, |p| Rc::ptr_eq(p, &parent_snapshot.own_scope));
    if same_parent && previous.context_hash == hash {
        return;
    }

    let children_scope = Scope::inherit(&parent_snapshot.own_scope, Some(children_version));
    for (name, child) in injected {
        children_scope.claim(
            graph,
            &name,
            ScopeRecord {
                value: child,
                priority: Priority::Member,
            },
        );
    }

    let own_scope = Scope::inherit(&children_scope, None);
    for (name, priority) in &hash {
        own_scope.claim(
            graph,
            name,
            ScopeRecord {
                value: id,
                priority: *priority,
            },
        );
    }

    // Top-level components are not published into the root
    let claimed_in = match parent {
        Some(parent) if parent != inst.root() => Some(parent_snapshot.children_scope.clone()),
        _ => None,
    };
    if let Some(old_target) = &previous.claimed_in {
        let moved = !claimed_in
            .as_ref()
            .map_or(false, |target| Rc::ptr_eq(target, old_target));
        for name in previous.context_hash.keys() {
            if moved || !hash.contains_key(name) {
                old_target.release(graph, name, id);
            }
        }
    }
    if let Some(target) = &claimed_in {
        for (name, priority) in &hash {
            target.claim(
                graph,
                name,
                ScopeRecord {
                    value: id,
                    priority: *priority,
                },
            );
        }
    }

    tracing::debug!(
        "scope of {:?} rebuilt with names {:?}",
        inst.path_of(id).unwrap_or_default(),
        hash.keys().collect::<Vec<_>>()
    );
    graph.set(
        scope_cell,
        Rc::new(ScopeSnapshot {
            context_hash: hash,
            children_scope,
            own_scope,
            claimed_in,
        }),
    );
}

/// Withdraw a component's claims from its parent's children scope
pub(crate) fn clear_scope(inst: &Instantiator, id: ShadowId) {
    let graph = inst.graph();
    let Some(scope_cell) = inst.with_shadow(id, |s| s.scope) else {
        return;
    };
    let Some(snapshot) = graph.get_untracked(scope_cell) else {
        return;
    };
    if let Some(target) = &snapshot.claimed_in {
        for name in snapshot.context_hash.keys() {
            target.release(graph, name, id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::KeyData;

    fn id(n: u64) -> ShadowId {
        ShadowId::from(KeyData::from_ffi(n))
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_context_hash_member_beats_context() {
        let hash = context_hash(&names(&["ui.button", "card"]), "card");
        assert_eq!(hash.get("ui.button"), Some(&Priority::Context));
        assert_eq!(hash.get("button"), Some(&Priority::Context));
        assert_eq!(hash.get("card"), Some(&Priority::Member));
    }

    #[test]
    fn test_member_claim_wins_in_any_order() {
        let graph = ReactiveGraph::new();
        let member = ScopeRecord {
            value: id(1),
            priority: Priority::Member,
        };
        let context = ScopeRecord {
            value: id(2),
            priority: Priority::Context,
        };

        let first = Scope::root(None);
        first.claim(&graph, "x", context);
        first.claim(&graph, "x", member);
        assert_eq!(first.local("x"), Some(member));

        let second = Scope::root(None);
        second.claim(&graph, "x", member);
        assert!(!second.claim(&graph, "x", context));
        assert_eq!(second.local("x"), Some(member));
    }

    // Equal priority is last-write-wins; pinned here so a change is noticed
    #[test]
    fn test_equal_priority_last_write_wins() {
        let graph = ReactiveGraph::new();
        let scope = Scope::root(None);
        let a = ScopeRecord {
            value: id(1),
            priority: Priority::Context,
        };
        let b = ScopeRecord {
            value: id(2),
            priority: Priority::Context,
        };
        scope.claim(&graph, "shared", a);
        scope.claim(&graph, "shared", b);
        assert_eq!(scope.local("shared"), Some(b));
    }

    #[test]
    fn test_release_only_by_occupant() {
        let graph = ReactiveGraph::new();
        let scope = Scope::root(None);
        let record = ScopeRecord {
            value: id(1),
            priority: Priority::Context,
        };
        scope.claim(&graph, "x", record);

        assert!(!scope.release(&graph, "x", id(2)));
        assert!(scope.release(&graph, "x", id(1)));
        assert!(scope.local("x").is_none());
    }

    // Names keep every claimant, so the next strongest one takes over
    // instead of the name going unresolved until something re-registers
    #[test]
    fn test_weaker_claim_resurfaces_on_release() {
        let graph = ReactiveGraph::new();
        let scope = Scope::root(None);
        let context = ScopeRecord {
            value: id(1),
            priority: Priority::Context,
        };
        let member = ScopeRecord {
            value: id(2),
            priority: Priority::Member,
        };
        scope.claim(&graph, "card", context);
        scope.claim(&graph, "card", member);
        assert_eq!(scope.local("card"), Some(member));

        assert!(scope.release(&graph, "card", id(2)));
        assert_eq!(scope.local("card"), Some(context));
        assert_eq!(scope.entries(), vec![("card".to_string(), context)]);
    }

    #[test]
    fn test_lookup_misses_to_parent_and_tracks() {
        let graph = Rc::new(ReactiveGraph::new());
        let version = graph.create_signal(0u64);
        let parent = Scope::root(Some(version));
        let child = Scope::inherit(&parent, None);

        let scope = child.clone();
        let lookups = graph.create_derived(move |g| scope.lookup(g, "late").map(|r| r.value));
        assert_eq!(graph.get_derived(lookups), Some(None));

        parent.claim(
            &graph,
            "late",
            ScopeRecord {
                value: id(7),
                priority: Priority::Context,
            },
        );
        assert_eq!(graph.get_derived(lookups), Some(Some(id(7))));
    }
}
