//! Lifecycle notifications
//!
//! Collaborators (view layer, diagnostics, tests) subscribe to these through
//! [`Instantiator::on`](crate::Instantiator::on). Listeners run synchronously
//! at well-defined points of construction and destruction.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use crate::instantiator::Instantiator;
use crate::shadow::ShadowId;

/// Points in a component's life at which listeners are called
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LifecycleEventKind {
    /// A component became visible at a path (created or injected)
    ComponentAttach,
    /// A component's path and scope entries were cleared
    ComponentClear,
    /// First expansion finished; the component is live
    Create,
    /// Destruction started; the component is still fully readable
    Destroy,
    /// Destruction finished; the path is free again
    AfterDestroy,
}

impl fmt::Display for LifecycleEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleEventKind::ComponentAttach => "onComponentAttach",
            LifecycleEventKind::ComponentClear => "onComponentClear",
            LifecycleEventKind::Create => "onCreate",
            LifecycleEventKind::Destroy => "onDestroy",
            LifecycleEventKind::AfterDestroy => "afterDestroy",
        };
        f.write_str(name)
    }
}

/// Payload handed to listeners
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LifecycleEvent {
    pub kind: LifecycleEventKind,
    pub component: ShadowId,
    /// Path the event concerns; differs from the canonical path for injections
    pub path: String,
    pub member_name: String,
    pub parent: Option<ShadowId>,
    /// Whether `path` is where the component was created
    pub created: bool,
}

/// Lifecycle listener; an error is surfaced after bookkeeping completes
pub type Listener = Rc<dyn Fn(&Instantiator, &LifecycleEvent) -> anyhow::Result<()>>;

/// Handle for removing a listener
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Entry {
    id: ListenerId,
    kind: Option<LifecycleEventKind>,
    listener: Listener,
}

#[derive(Default)]
pub(crate) struct Listeners {
    next_id: Cell<u64>,
    entries: RefCell<Vec<Entry>>,
}

impl Listeners {
    /// Register a listener for one kind, or every kind when `kind` is `None`
    pub(crate) fn add(&self, kind: Option<LifecycleEventKind>, listener: Listener) -> ListenerId {
        let id = ListenerId(self.next_id.get());
        self.next_id.set(id.0 + 1);
        self.entries.borrow_mut().push(Entry { id, kind, listener });
        id
    }

    pub(crate) fn remove(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.borrow_mut();
        let before = entries.len();
        entries.retain(|entry| entry.id != id);
        entries.len() != before
    }

    /// Listeners for `kind` in registration order
    ///
    /// Cloned out so a listener may add or remove listeners while running.
    pub(crate) fn matching(&self, kind: LifecycleEventKind) -> Vec<Listener> {
        self.entries
            .borrow()
            .iter()
            .filter(|entry| entry.kind.map_or(true, |k| k == kind))
            .map(|entry| entry.listener.clone())
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.borrow().len()
    }
}
