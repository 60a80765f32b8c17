//! Per-instance metadata
//!
//! Shadows live in an arena owned by the [`Instantiator`](crate::Instantiator)
//! and refer to each other by [`ShadowId`]. The parent link is a plain
//! lookup used for traversal; ownership runs strictly parent to child
//! through `child_components`.

use std::fmt;
use std::rc::Rc;

use fluid_core::reactive::{Derived, Effect, Signal};
use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use slotmap::new_key_type;

use crate::expand::Expansion;
use crate::layer::Potentia;
use crate::merge::MergeOutcome;
use crate::scope::ScopeSnapshot;
use crate::value::Value;

new_key_type! {
    /// Handle of one component instance
    pub struct ShadowId;
}

/// Where a component is in its life
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleStatus {
    /// Allocated, first expansion pending
    Constructing,
    Live,
    /// Teardown started; hooks may still read the component
    Destroying,
    Destroyed,
}

impl LifecycleStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleStatus::Constructing => "constructing",
            LifecycleStatus::Live => "live",
            LifecycleStatus::Destroying => "destroying",
            LifecycleStatus::Destroyed => "destroyed",
        }
    }

    /// Whether teardown has started
    pub fn is_ending(self) -> bool {
        matches!(self, LifecycleStatus::Destroying | LifecycleStatus::Destroyed)
    }
}

impl fmt::Display for LifecycleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata and reactive pipeline of one component
pub(crate) struct Shadow {
    /// Canonical path, fixed at creation
    pub path: String,
    /// Key under the parent; may itself be dotted for nested records
    pub key: String,
    /// Last segment of `key`
    pub member_name: String,
    pub parent: Option<ShadowId>,
    /// Children created in place, in creation order
    pub child_components: IndexMap<String, ShadowId>,
    /// Components injected under this one, not owned
    pub injected_children: IndexMap<String, ShadowId>,
    /// Other paths at which this component is visible
    pub injected_paths: IndexSet<String>,
    pub status: LifecycleStatus,

    pub potentia: Signal<Potentia>,
    pub merge: Option<Derived<MergeOutcome>>,
    pub scope: Signal<Rc<ScopeSnapshot>>,
    /// Bumped when children or `children_scope` entries change
    pub children_version: Signal<u64>,
    pub expanded: Signal<Value>,
    /// Constructs of the last expansion; taken out while expanding
    pub expansion: Expansion,
    /// Scope and expansion effects owned by this shadow
    pub framework_effects: Vec<Effect>,
}

/// One path in the registry
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct PathEntry {
    pub component: ShadowId,
    pub parent: Option<ShadowId>,
    /// Key under `parent`
    pub key: String,
    /// Whether the component was created here rather than injected
    pub created: bool,
}

/// Join a parent path and a child key
pub(crate) fn join_path(parent: &str, key: &str) -> String {
    if parent.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", parent, key)
    }
}

/// Last dot-separated segment
pub(crate) fn last_segment(key: &str) -> &str {
    key.rsplit('.').next().unwrap_or(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_path() {
        assert_eq!(join_path("", "app"), "app");
        assert_eq!(join_path("app", "header.title"), "app.header.title");
        assert_eq!(last_segment("header.title"), "title");
        assert_eq!(last_segment("app"), "app");
    }

    #[test]
    fn test_status_display() {
        assert_eq!(LifecycleStatus::Destroying.to_string(), "destroying");
        assert!(LifecycleStatus::Destroyed.is_ending());
        assert!(!LifecycleStatus::Live.is_ending());
    }
}
