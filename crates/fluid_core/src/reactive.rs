//! Fine-grained reactive cell graph
//!
//! A push-pull hybrid reactive system:
//! - Signals push invalidation notifications to subscribers
//! - Derived values pull (lazily compute) their values when accessed
//! - Effects are scheduled and batched, then flushed in dependency-depth order
//!
//! The graph is single-threaded and shared as `Rc<ReactiveGraph>`. Every
//! operation takes `&self`, so compute functions and effects may freely read,
//! write and create nodes while they run.
//!
//! ```ignore
//! use fluid_core::reactive::ReactiveGraph;
//!
//! let graph = ReactiveGraph::new();
//! let count = graph.create_signal(1i32);
//! let doubled = graph.create_derived(move |g| g.get(count).unwrap_or(0) * 2);
//!
//! graph.set(count, 5);
//! assert_eq!(graph.get_derived(doubled), Some(10));
//! ```

use slotmap::{new_key_type, SlotMap};
use smallvec::SmallVec;
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

new_key_type! {
    /// Unique identifier for a signal
    pub struct SignalId;
    /// Unique identifier for a derived/computed value
    pub struct DerivedId;
    /// Unique identifier for an effect
    pub struct EffectId;
}

/// Nodes that can be read as a dependency
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SourceId {
    Signal(SignalId),
    Derived(DerivedId),
}

/// Subscriber types that can react to source changes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SubscriberId {
    Derived(DerivedId),
    Effect(EffectId),
}

/// Disposer returned by a reaction, run before its next run or on disposal
pub type Cleanup = Box<dyn FnOnce()>;

/// Default cap on effect flush rounds before the graph gives up on a cycle
pub const DEFAULT_MAX_FLUSH_ROUNDS: usize = 10_000;

/// A reactive signal handle (cheap to copy)
pub struct Signal<T> {
    id: SignalId,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Signal<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Signal<T> {}

impl<T> PartialEq for Signal<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> Eq for Signal<T> {}

impl<T> Hash for Signal<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl<T> fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Signal").field(&self.id).finish()
    }
}

impl<T> Signal<T> {
    /// Get the signal's internal ID
    pub fn id(&self) -> SignalId {
        self.id
    }
}

/// A derived/computed value handle
pub struct Derived<T> {
    id: DerivedId,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Derived<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Derived<T> {}

impl<T> PartialEq for Derived<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> Eq for Derived<T> {}

impl<T> Hash for Derived<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl<T> fmt::Debug for Derived<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Derived").field(&self.id).finish()
    }
}

impl<T> Derived<T> {
    pub fn id(&self) -> DerivedId {
        self.id
    }
}

/// An effect handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Effect {
    id: EffectId,
}

impl Effect {
    pub fn id(&self) -> EffectId {
        self.id
    }
}

type ComputeFn = Box<dyn Fn(&ReactiveGraph) -> Box<dyn Any>>;
type RunFn = Box<dyn FnMut(&ReactiveGraph) -> Option<Cleanup>>;
type Dependencies = SmallVec<[SourceId; 4]>;
type Frame = SmallVec<[SourceId; 8]>;

/// Internal signal node storage
struct SignalNode {
    /// The signal value (type-erased)
    value: Box<dyn Any>,
    /// Version counter for change detection
    version: u64,
    /// Subscribers to notify on change
    subscribers: SmallVec<[SubscriberId; 4]>,
}

/// Internal derived node storage
struct DerivedNode {
    /// Cached value (if computed)
    value: Option<Box<dyn Any>>,
    /// The compute function, taken out while it runs
    compute: Option<ComputeFn>,
    /// Sources read during the last computation
    dependencies: Dependencies,
    /// Subscribers to notify when this derived is invalidated
    subscribers: SmallVec<[SubscriberId; 4]>,
    /// Whether the cached value is stale
    dirty: bool,
    /// Depth in the dependency graph (for topological ordering)
    depth: u32,
}

/// Internal effect node storage
struct EffectNode {
    /// The effect function, taken out while it runs
    run: Option<RunFn>,
    /// Disposer returned by the last run
    cleanup: Option<Cleanup>,
    /// Sources read during the last run
    dependencies: Dependencies,
    /// Whether the effect needs to run
    dirty: bool,
    /// Depth in the dependency graph
    depth: u32,
}

/// Resets the flushing flag even if an effect panics
struct FlushGuard<'a>(&'a Cell<bool>);

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

/// The reactive graph that manages all signals, derived values, and effects
pub struct ReactiveGraph {
    signals: RefCell<SlotMap<SignalId, SignalNode>>,
    derived: RefCell<SlotMap<DerivedId, DerivedNode>>,
    effects: RefCell<SlotMap<EffectId, EffectNode>>,
    /// Pending effects to run
    pending_effects: RefCell<VecDeque<EffectId>>,
    /// Current batch depth (> 0 means we're in a batch)
    batch_depth: Cell<u32>,
    /// Whether effects are being flushed right now
    flushing: Cell<bool>,
    /// Stack of dependency frames; `None` frames suppress tracking
    tracking: RefCell<Vec<Option<Frame>>>,
    /// Global version counter
    global_version: Cell<u64>,
    max_flush_rounds: usize,
}

impl ReactiveGraph {
    /// Create a new reactive graph
    pub fn new() -> Self {
        Self::with_max_flush_rounds(DEFAULT_MAX_FLUSH_ROUNDS)
    }

    /// Create a graph that abandons effect flushing after `rounds` rounds
    pub fn with_max_flush_rounds(rounds: usize) -> Self {
        Self {
            signals: RefCell::new(SlotMap::with_key()),
            derived: RefCell::new(SlotMap::with_key()),
            effects: RefCell::new(SlotMap::with_key()),
            pending_effects: RefCell::new(VecDeque::new()),
            batch_depth: Cell::new(0),
            flushing: Cell::new(false),
            tracking: RefCell::new(Vec::new()),
            global_version: Cell::new(0),
            max_flush_rounds: rounds.max(1),
        }
    }

    // =========================================================================
    // SIGNALS
    // =========================================================================

    /// Create a new signal with an initial value
    pub fn create_signal<T: 'static>(&self, initial: T) -> Signal<T> {
        let id = self.signals.borrow_mut().insert(SignalNode {
            value: Box::new(initial),
            version: 0,
            subscribers: SmallVec::new(),
        });
        Signal {
            id,
            _marker: PhantomData,
        }
    }

    /// Get the current value of a signal
    ///
    /// If called within a tracking context (effect or derived), this signal
    /// will be recorded as a dependency.
    pub fn get<T: Clone + 'static>(&self, signal: Signal<T>) -> Option<T> {
        self.track(SourceId::Signal(signal.id));
        self.get_untracked(signal)
    }

    /// Get the current value without tracking as a dependency
    pub fn get_untracked<T: Clone + 'static>(&self, signal: Signal<T>) -> Option<T> {
        self.signals
            .borrow()
            .get(signal.id)
            .and_then(|node| node.value.downcast_ref::<T>().cloned())
    }

    /// Set the value of a signal, triggering reactive updates
    pub fn set<T: 'static>(&self, signal: Signal<T>, value: T) {
        let (previous, subscribers) = {
            let mut signals = self.signals.borrow_mut();
            let Some(node) = signals.get_mut(signal.id) else {
                return;
            };
            let previous = std::mem::replace(&mut node.value, Box::new(value));
            node.version += 1;
            (previous, node.subscribers.clone())
        };
        // Old values may own handles whose drop touches the graph
        drop(previous);
        self.global_version.set(self.global_version.get() + 1);

        for sub in subscribers {
            self.mark_dirty(sub);
        }
        self.maybe_flush();
    }

    /// Update a signal using a function
    pub fn update<T: Clone + 'static, F: FnOnce(T) -> T>(&self, signal: Signal<T>, f: F) {
        if let Some(current) = self.get_untracked(signal) {
            self.set(signal, f(current));
        }
    }

    /// Get the version of a signal (for change detection)
    pub fn signal_version(&self, id: SignalId) -> Option<u64> {
        self.signals.borrow().get(id).map(|n| n.version)
    }

    /// Whether the signal is still part of the graph
    pub fn contains_signal(&self, id: SignalId) -> bool {
        self.signals.borrow().contains_key(id)
    }

    /// Remove a signal; its dependents are invalidated so they observe the removal
    pub fn dispose_signal<T>(&self, signal: Signal<T>) {
        let Some(node) = self.signals.borrow_mut().remove(signal.id) else {
            return;
        };
        for &sub in &node.subscribers {
            self.mark_dirty(sub);
        }
        drop(node);
        self.maybe_flush();
    }

    // =========================================================================
    // DERIVED VALUES
    // =========================================================================

    /// Create a derived (computed) value
    pub fn create_derived<T, F>(&self, compute: F) -> Derived<T>
    where
        T: Clone + 'static,
        F: Fn(&ReactiveGraph) -> T + 'static,
    {
        let compute_boxed = move |graph: &ReactiveGraph| -> Box<dyn Any> { Box::new(compute(graph)) };

        let id = self.derived.borrow_mut().insert(DerivedNode {
            value: None,
            compute: Some(Box::new(compute_boxed)),
            dependencies: SmallVec::new(),
            subscribers: SmallVec::new(),
            dirty: true, // Start dirty to force initial computation
            depth: 0,
        });

        Derived {
            id,
            _marker: PhantomData,
        }
    }

    /// Get the value of a derived, computing if necessary
    ///
    /// Inside a tracking context the derived is recorded as a dependency, so
    /// derived values may be chained.
    pub fn get_derived<T: Clone + 'static>(&self, derived: Derived<T>) -> Option<T> {
        self.track(SourceId::Derived(derived.id));
        self.get_derived_untracked(derived)
    }

    /// Get the value of a derived without recording a dependency on it
    pub fn get_derived_untracked<T: Clone + 'static>(&self, derived: Derived<T>) -> Option<T> {
        self.refresh_derived(derived.id)?;
        self.derived
            .borrow()
            .get(derived.id)
            .and_then(|node| node.value.as_ref())
            .and_then(|value| value.downcast_ref::<T>().cloned())
    }

    /// Whether the derived is still part of the graph
    pub fn contains_derived(&self, id: DerivedId) -> bool {
        self.derived.borrow().contains_key(id)
    }

    /// Remove a derived value, invalidating anything that read it
    pub fn dispose_derived<T>(&self, derived: Derived<T>) {
        let Some(node) = self.derived.borrow_mut().remove(derived.id) else {
            return;
        };
        let sub = SubscriberId::Derived(derived.id);
        for &dep in &node.dependencies {
            self.unsubscribe(dep, sub);
        }
        for &subscriber in &node.subscribers {
            self.mark_dirty(subscriber);
        }
        drop(node);
        self.maybe_flush();
    }

    // =========================================================================
    // EFFECTS
    // =========================================================================

    /// Create an effect that runs when its dependencies change
    pub fn create_effect<F>(&self, mut run: F) -> Effect
    where
        F: FnMut(&ReactiveGraph) + 'static,
    {
        self.create_reaction(move |graph| {
            run(graph);
            None
        })
    }

    /// Create a reaction: an effect whose run may return a cleanup that is
    /// invoked before the next run and when the reaction is disposed
    pub fn create_reaction<F>(&self, run: F) -> Effect
    where
        F: FnMut(&ReactiveGraph) -> Option<Cleanup> + 'static,
    {
        let id = self.effects.borrow_mut().insert(EffectNode {
            run: Some(Box::new(run)),
            cleanup: None,
            dependencies: SmallVec::new(),
            dirty: true, // Run immediately
            depth: 0,
        });

        // Schedule initial run
        self.pending_effects.borrow_mut().push_back(id);
        self.maybe_flush();

        Effect { id }
    }

    /// Whether the effect is still part of the graph
    pub fn contains_effect(&self, id: EffectId) -> bool {
        self.effects.borrow().contains_key(id)
    }

    /// Dispose of an effect, removing it from the graph and running its cleanup
    pub fn dispose_effect(&self, effect: Effect) {
        let Some(node) = self.effects.borrow_mut().remove(effect.id) else {
            return;
        };
        let sub = SubscriberId::Effect(effect.id);
        for &dep in &node.dependencies {
            self.unsubscribe(dep, sub);
        }
        if let Some(cleanup) = node.cleanup {
            cleanup();
        }
    }

    // =========================================================================
    // BATCHING & TRACKING
    // =========================================================================

    /// Start a batch - effects won't run until the batch ends
    pub fn batch_start(&self) {
        self.batch_depth.set(self.batch_depth.get() + 1);
    }

    /// End a batch and flush pending effects
    pub fn batch_end(&self) {
        let depth = self.batch_depth.get();
        if depth > 0 {
            self.batch_depth.set(depth - 1);
            if depth == 1 {
                self.flush_effects();
            }
        }
    }

    /// Run a function in a batch context
    pub fn batch<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        self.batch_start();
        let result = f();
        self.batch_end();
        result
    }

    /// Run a function without recording any dependencies for the caller
    pub fn untrack<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        self.tracking.borrow_mut().push(None);
        let result = f();
        self.tracking.borrow_mut().pop();
        result
    }

    /// Whether effects are deferred right now
    pub fn is_batching(&self) -> bool {
        self.batch_depth.get() > 0 || self.flushing.get()
    }

    // =========================================================================
    // INTERNAL
    // =========================================================================

    fn track(&self, source: SourceId) {
        if let Some(Some(frame)) = self.tracking.borrow_mut().last_mut() {
            if !frame.contains(&source) {
                frame.push(source);
            }
        }
    }

    fn maybe_flush(&self) {
        if self.batch_depth.get() == 0 {
            self.flush_effects();
        }
    }

    /// Recompute a derived value if it is stale
    ///
    /// Returns `None` if the derived no longer exists.
    fn refresh_derived(&self, id: DerivedId) -> Option<()> {
        let compute = {
            let mut derived = self.derived.borrow_mut();
            let node = derived.get_mut(id)?;
            if !node.dirty {
                return Some(());
            }
            let Some(compute) = node.compute.take() else {
                tracing::warn!("derived {:?} was invalidated while computing itself", id);
                return None;
            };
            // Cleared up front so invalidation during compute is not lost
            node.dirty = false;
            compute
        };

        self.tracking.borrow_mut().push(Some(SmallVec::new()));
        let value = compute(self);
        let deps = self
            .tracking
            .borrow_mut()
            .pop()
            .flatten()
            .unwrap_or_default();

        let (previous, old_deps) = {
            let mut derived = self.derived.borrow_mut();
            let node = derived.get_mut(id)?;
            node.compute = Some(compute);
            let previous = node.value.replace(value);
            let old_deps = std::mem::replace(&mut node.dependencies, deps.iter().copied().collect());
            (previous, old_deps)
        };
        drop(previous);

        let sub = SubscriberId::Derived(id);
        self.resubscribe(sub, &old_deps, &deps);
        let depth = self.depth_of(&deps);
        if let Some(node) = self.derived.borrow_mut().get_mut(id) {
            node.depth = depth;
        }
        Some(())
    }

    fn depth_of(&self, deps: &[SourceId]) -> u32 {
        let derived = self.derived.borrow();
        deps.iter()
            .map(|dep| match dep {
                SourceId::Signal(_) => 0,
                SourceId::Derived(id) => derived.get(*id).map(|n| n.depth).unwrap_or(0),
            })
            .max()
            .unwrap_or(0)
            + 1
    }

    fn resubscribe(&self, sub: SubscriberId, old: &[SourceId], new: &[SourceId]) {
        for dep in old.iter().filter(|dep| !new.contains(dep)) {
            self.unsubscribe(*dep, sub);
        }
        for dep in new.iter().filter(|dep| !old.contains(dep)) {
            self.subscribe(*dep, sub);
        }
    }

    fn subscribe(&self, source: SourceId, sub: SubscriberId) {
        match source {
            SourceId::Signal(id) => {
                if let Some(node) = self.signals.borrow_mut().get_mut(id) {
                    if !node.subscribers.contains(&sub) {
                        node.subscribers.push(sub);
                    }
                }
            }
            SourceId::Derived(id) => {
                if let Some(node) = self.derived.borrow_mut().get_mut(id) {
                    if !node.subscribers.contains(&sub) {
                        node.subscribers.push(sub);
                    }
                }
            }
        }
    }

    fn unsubscribe(&self, source: SourceId, sub: SubscriberId) {
        match source {
            SourceId::Signal(id) => {
                if let Some(node) = self.signals.borrow_mut().get_mut(id) {
                    node.subscribers.retain(|s| *s != sub);
                }
            }
            SourceId::Derived(id) => {
                if let Some(node) = self.derived.borrow_mut().get_mut(id) {
                    node.subscribers.retain(|s| *s != sub);
                }
            }
        }
    }

    /// Mark a subscriber as dirty
    fn mark_dirty(&self, sub: SubscriberId) {
        match sub {
            SubscriberId::Derived(id) => {
                let subscribers = {
                    let mut derived = self.derived.borrow_mut();
                    let Some(node) = derived.get_mut(id) else {
                        return;
                    };
                    if node.dirty {
                        return;
                    }
                    node.dirty = true;
                    node.subscribers.clone()
                };
                // Propagate to derived's subscribers
                for sub in subscribers {
                    self.mark_dirty(sub);
                }
            }
            SubscriberId::Effect(id) => {
                let mut effects = self.effects.borrow_mut();
                if let Some(node) = effects.get_mut(id) {
                    if !node.dirty {
                        node.dirty = true;
                        self.pending_effects.borrow_mut().push_back(id);
                    }
                }
            }
        }
    }

    /// Flush all pending effects, round by round, until none remain
    fn flush_effects(&self) {
        if self.flushing.get() {
            return;
        }
        self.flushing.set(true);
        let _guard = FlushGuard(&self.flushing);

        let mut rounds = 0usize;
        loop {
            let mut round: Vec<EffectId> = self.pending_effects.borrow_mut().drain(..).collect();
            if round.is_empty() {
                break;
            }
            rounds += 1;
            if rounds > self.max_flush_rounds {
                tracing::error!(
                    "effects still pending after {} flush rounds; dropping {} runs",
                    self.max_flush_rounds,
                    round.len()
                );
                let mut effects = self.effects.borrow_mut();
                for id in round {
                    if let Some(node) = effects.get_mut(id) {
                        node.dirty = false;
                    }
                }
                break;
            }

            // Sort by depth for proper execution order
            {
                let effects = self.effects.borrow();
                round.sort_by_key(|id| effects.get(*id).map(|n| n.depth).unwrap_or(0));
            }
            for effect_id in round {
                self.run_effect(effect_id);
            }
        }
    }

    /// Run a single effect
    fn run_effect(&self, effect_id: EffectId) {
        let (mut run, cleanup) = {
            let mut effects = self.effects.borrow_mut();
            let Some(node) = effects.get_mut(effect_id) else {
                return;
            };
            // Might have been run already this round
            if !node.dirty {
                return;
            }
            let Some(run) = node.run.take() else {
                return;
            };
            node.dirty = false;
            (run, node.cleanup.take())
        };

        if let Some(cleanup) = cleanup {
            cleanup();
        }

        self.tracking.borrow_mut().push(Some(SmallVec::new()));
        let cleanup = run(self);
        let deps = self
            .tracking
            .borrow_mut()
            .pop()
            .flatten()
            .unwrap_or_default();

        let mut effects = self.effects.borrow_mut();
        let Some(node) = effects.get_mut(effect_id) else {
            // Disposed while running
            drop(effects);
            if let Some(cleanup) = cleanup {
                cleanup();
            }
            return;
        };
        node.run = Some(run);
        node.cleanup = cleanup;
        let old_deps = std::mem::replace(&mut node.dependencies, deps.iter().copied().collect());
        drop(effects);

        self.resubscribe(SubscriberId::Effect(effect_id), &old_deps, &deps);
        let depth = self.depth_of(&deps);
        if let Some(node) = self.effects.borrow_mut().get_mut(effect_id) {
            node.depth = depth;
        }
    }

    /// Get statistics about the reactive graph
    pub fn stats(&self) -> ReactiveStats {
        ReactiveStats {
            signal_count: self.signals.borrow().len(),
            derived_count: self.derived.borrow().len(),
            effect_count: self.effects.borrow().len(),
            pending_effects: self.pending_effects.borrow().len(),
            global_version: self.global_version.get(),
        }
    }
}

impl Default for ReactiveGraph {
    fn default() -> Self {
        Self::new()
    }
}

/// Statistics about the reactive graph
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReactiveStats {
    pub signal_count: usize,
    pub derived_count: usize,
    pub effect_count: usize,
    pub pending_effects: usize,
    pub global_version: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    #[test]
    fn test_signal_create_get_set() {
        let graph = ReactiveGraph::new();

        let count = graph.create_signal(0i32);
        assert_eq!(graph.get(count), Some(0));

        graph.set(count, 42);
        assert_eq!(graph.get(count), Some(42));
    }

    #[test]
    fn test_signal_update() {
        let graph = ReactiveGraph::new();

        let count = graph.create_signal(10i32);
        graph.update(count, |x| x + 5);
        assert_eq!(graph.get(count), Some(15));
    }

    #[test]
    fn test_derived_basic() {
        let graph = ReactiveGraph::new();

        let count = graph.create_signal(5i32);
        let doubled = graph.create_derived(move |g| g.get(count).unwrap_or(0) * 2);

        assert_eq!(graph.get_derived(doubled), Some(10));

        graph.set(count, 7);
        assert_eq!(graph.get_derived(doubled), Some(14));
    }

    #[test]
    fn test_derived_caching() {
        let graph = ReactiveGraph::new();
        let compute_count = Rc::new(Cell::new(0));

        let count = graph.create_signal(5i32);
        let counter = compute_count.clone();
        let doubled = graph.create_derived(move |g| {
            counter.set(counter.get() + 1);
            g.get(count).unwrap_or(0) * 2
        });

        // First access computes
        assert_eq!(graph.get_derived(doubled), Some(10));
        assert_eq!(compute_count.get(), 1);

        // Second access uses cache
        assert_eq!(graph.get_derived(doubled), Some(10));
        assert_eq!(compute_count.get(), 1);

        // After signal change, recomputes
        graph.set(count, 7);
        assert_eq!(graph.get_derived(doubled), Some(14));
        assert_eq!(compute_count.get(), 2);
    }

    #[test]
    fn test_derived_chain_tracks_derived() {
        let graph = ReactiveGraph::new();

        let base = graph.create_signal(2i32);
        let squared = graph.create_derived(move |g| {
            let v = g.get(base).unwrap_or(0);
            v * v
        });
        let plus_one = graph.create_derived(move |g| g.get_derived(squared).unwrap_or(0) + 1);

        assert_eq!(graph.get_derived(plus_one), Some(5));
        graph.set(base, 3);
        assert_eq!(graph.get_derived(plus_one), Some(10));
    }

    #[test]
    fn test_diamond_recomputes_once() {
        let graph = ReactiveGraph::new();
        let d_runs = Rc::new(Cell::new(0));

        let a = graph.create_signal(1i32);
        let b = graph.create_derived(move |g| g.get(a).unwrap_or(0) + 1);
        let c = graph.create_derived(move |g| g.get(a).unwrap_or(0) * 10);
        let runs = d_runs.clone();
        let d = graph.create_derived(move |g| {
            runs.set(runs.get() + 1);
            g.get_derived(b).unwrap_or(0) + g.get_derived(c).unwrap_or(0)
        });

        assert_eq!(graph.get_derived(d), Some(12));
        assert_eq!(d_runs.get(), 1);

        graph.set(a, 2);
        assert_eq!(graph.get_derived(d), Some(23));
        assert_eq!(d_runs.get(), 2);

        // Reading again without upstream writes hits the cache
        assert_eq!(graph.get_derived(d), Some(23));
        assert_eq!(d_runs.get(), 2);
    }

    #[test]
    fn test_diamond_effect_runs_once_per_write() {
        let graph = ReactiveGraph::new();
        let seen = Rc::new(RefCell::new(Vec::new()));

        let a = graph.create_signal(1i32);
        let b = graph.create_derived(move |g| g.get(a).unwrap_or(0) + 1);
        let c = graph.create_derived(move |g| g.get(a).unwrap_or(0) * 10);
        let sink = seen.clone();
        let _effect = graph.create_effect(move |g| {
            let total = g.get_derived(b).unwrap_or(0) + g.get_derived(c).unwrap_or(0);
            sink.borrow_mut().push(total);
        });

        graph.set(a, 2);
        assert_eq!(*seen.borrow(), vec![12, 23]);
    }

    #[test]
    fn test_effect_runs_on_change() {
        let graph = ReactiveGraph::new();
        let effect_runs = Rc::new(RefCell::new(Vec::new()));

        let count = graph.create_signal(0i32);
        let runs = effect_runs.clone();

        let _effect = graph.create_effect(move |g| {
            let val = g.get(count).unwrap_or(0);
            runs.borrow_mut().push(val);
        });

        // Effect runs immediately
        assert_eq!(*effect_runs.borrow(), vec![0]);

        // Effect runs on signal change
        graph.set(count, 1);
        assert_eq!(*effect_runs.borrow(), vec![0, 1]);

        graph.set(count, 2);
        assert_eq!(*effect_runs.borrow(), vec![0, 1, 2]);
    }

    #[test]
    fn test_batching() {
        let graph = ReactiveGraph::new();
        let effect_runs = Rc::new(Cell::new(0));

        let a = graph.create_signal(1i32);
        let b = graph.create_signal(2i32);
        let runs = effect_runs.clone();

        let _effect = graph.create_effect(move |g| {
            let _a = g.get(a);
            let _b = g.get(b);
            runs.set(runs.get() + 1);
        });

        // Initial run
        assert_eq!(effect_runs.get(), 1);

        // Without batching, effect runs twice
        effect_runs.set(0);
        graph.set(a, 10);
        graph.set(b, 20);
        assert_eq!(effect_runs.get(), 2);

        // With batching, effect runs once
        effect_runs.set(0);
        graph.batch(|| {
            graph.set(a, 100);
            graph.set(b, 200);
        });
        assert_eq!(effect_runs.get(), 1);
    }

    #[test]
    fn test_effect_may_write_signals() {
        let graph = ReactiveGraph::new();

        let source = graph.create_signal(1i32);
        let mirror = graph.create_signal(0i32);
        let _effect = graph.create_effect(move |g| {
            let v = g.get(source).unwrap_or(0);
            g.set(mirror, v * 100);
        });

        assert_eq!(graph.get(mirror), Some(100));
        graph.set(source, 4);
        assert_eq!(graph.get(mirror), Some(400));
    }

    #[test]
    fn test_dispose_effect() {
        let graph = ReactiveGraph::new();
        let effect_runs = Rc::new(Cell::new(0));

        let count = graph.create_signal(0i32);
        let runs = effect_runs.clone();

        let effect = graph.create_effect(move |g| {
            let _val = g.get(count);
            runs.set(runs.get() + 1);
        });

        assert_eq!(effect_runs.get(), 1);

        graph.set(count, 1);
        assert_eq!(effect_runs.get(), 2);

        // Dispose the effect
        graph.dispose_effect(effect);

        // Effect should no longer run
        graph.set(count, 2);
        assert_eq!(effect_runs.get(), 2);
    }

    #[test]
    fn test_reaction_cleanup_order() {
        let graph = ReactiveGraph::new();
        let log = Rc::new(RefCell::new(Vec::<String>::new()));

        let count = graph.create_signal(0i32);
        let sink = log.clone();
        let reaction = graph.create_reaction(move |g| {
            let v = g.get(count).unwrap_or(0);
            sink.borrow_mut().push(format!("run {}", v));
            let sink = sink.clone();
            Some(Box::new(move || sink.borrow_mut().push(format!("cleanup {}", v))) as Cleanup)
        });

        graph.set(count, 1);
        graph.dispose_effect(reaction);

        assert_eq!(
            *log.borrow(),
            vec!["run 0", "cleanup 0", "run 1", "cleanup 1"]
        );
    }

    #[test]
    fn test_dispose_signal_invalidates_dependents() {
        let graph = ReactiveGraph::new();

        let count = graph.create_signal(3i32);
        let read = graph.create_derived(move |g| g.get(count));
        assert_eq!(graph.get_derived(read), Some(Some(3)));

        graph.dispose_signal(count);
        assert!(!graph.contains_signal(count.id()));
        assert_eq!(graph.get_derived(read), Some(None));
    }

    #[test]
    fn test_untrack_skips_dependency() {
        let graph = ReactiveGraph::new();
        let effect_runs = Rc::new(Cell::new(0));

        let tracked = graph.create_signal(0i32);
        let ignored = graph.create_signal(0i32);
        let runs = effect_runs.clone();
        let _effect = graph.create_effect(move |g| {
            let _ = g.get(tracked);
            let _ = g.untrack(|| g.get(ignored));
            runs.set(runs.get() + 1);
        });

        graph.set(ignored, 1);
        assert_eq!(effect_runs.get(), 1);
        graph.set(tracked, 1);
        assert_eq!(effect_runs.get(), 2);
    }

    #[test]
    fn test_self_read_breaks_cycle() {
        let graph = ReactiveGraph::new();
        let slot: Rc<Cell<Option<Derived<i32>>>> = Rc::new(Cell::new(None));

        let me = slot.clone();
        let looped = graph.create_derived(move |g| match me.get() {
            Some(me) => g.get_derived(me).map_or(-1, |v| v + 1),
            None => 0,
        });
        slot.set(Some(looped));

        assert_eq!(graph.get_derived(looped), Some(-1));
    }

    #[test]
    fn test_runaway_flush_is_cut() {
        let graph = ReactiveGraph::with_max_flush_rounds(16);

        let count = graph.create_signal(0i32);
        let _effect = graph.create_effect(move |g| {
            let v = g.get(count).unwrap_or(0);
            g.set(count, v + 1);
        });

        // First run happens before the effect subscribes, so it settles
        assert_eq!(graph.get(count), Some(1));

        // Once subscribed, the self-triggering effect stops after 16 rounds
        graph.set(count, 10);
        assert_eq!(graph.get(count), Some(26));
        assert_eq!(graph.stats().pending_effects, 0);
    }

    #[test]
    fn test_stats() {
        let graph = ReactiveGraph::new();

        let _s1 = graph.create_signal(1);
        let _s2 = graph.create_signal(2);
        let _d1 = graph.create_derived(|_| 0);

        let stats = graph.stats();
        assert_eq!(stats.signal_count, 2);
        assert_eq!(stats.derived_count, 1);
    }
}
