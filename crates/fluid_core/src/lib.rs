//! Fluid Core Runtime
//!
//! This crate provides the reactive cell graph the Fluid instantiation core is
//! built on:
//!
//! - **Signals**: mutable cells whose reads are tracked as dependencies
//! - **Derived values**: memoized computations, recomputed at most once per
//!   invalidation and chainable through other derived values
//! - **Reactions**: side-effecting runs with an optional cleanup
//! - **Batching**: defer effects until a group of writes has landed
//!
//! # Example
//!
//! ```rust
//! use fluid_core::reactive::ReactiveGraph;
//!
//! let graph = ReactiveGraph::new();
//!
//! // Create a signal
//! let count = graph.create_signal(0i32);
//!
//! // Create a derived value
//! let doubled = graph.create_derived(move |g| g.get(count).unwrap_or(0) * 2);
//!
//! // Create an effect
//! let _effect = graph.create_effect(move |g| {
//!     println!("Count is now: {:?}", g.get(count));
//! });
//!
//! // Update the signal
//! graph.set(count, 5);
//! assert_eq!(graph.get_derived(doubled), Some(10));
//! ```

pub mod reactive;

pub use reactive::{
    Cleanup, Derived, DerivedId, Effect, EffectId, ReactiveGraph, ReactiveStats, Signal,
    SignalId, SourceId, SubscriberId, DEFAULT_MAX_FLUSH_ROUNDS,
};
