//! Fluid Potentia
//!
//! The instantiation core of the Fluid component framework. It turns a tree
//! of *desired* component configurations (potentia) into a live tree of
//! component instances:
//!
//! - **Merge Engine**: flattens layer hierarchies and merge records into one
//!   table per component, recomputed whenever an input changes
//! - **Record Expander**: turns the flat table into reactive cells,
//!   computations, effects, methods, child components and injections
//! - **Scope Resolver**: decides which ancestor a context name refers to
//! - **Context References**: `{context}.path` strings resolved to live handles
//! - **Proxies**: read/write facades whose writes become `live` layers
//! - **Destroy Engine**: ordered, hook-friendly teardown
//!
//! Everything runs on the single-threaded [`fluid_core::reactive`] graph
//! owned by the [`Instantiator`].
//!
//! # Example
//!
//! ```rust
//! use fluid_potentia::{Instantiator, MergeRecord, Value};
//! use serde_json::json;
//!
//! let inst = Instantiator::new();
//! inst.functions().register("double", |_, args| {
//!     let n = args.first().and_then(Value::as_f64).unwrap_or(0.0);
//!     Value::from(n * 2.0)
//! });
//!
//! let counter = inst
//!     .push_potentia(
//!         inst.root(),
//!         "counter",
//!         vec![MergeRecord::from_json(
//!             "user",
//!             json!({
//!                 "count": 5,
//!                 "doubled": {"$compute": "double({self}.count)"}
//!             }),
//!         )],
//!         None,
//!     )?
//!     .expect("component created");
//!
//! assert_eq!(counter.get("doubled").into_value().as_f64(), Some(10.0));
//!
//! // Writes land in the component's `live` layer
//! counter.set("count", 7)?;
//! assert_eq!(counter.get("doubled").into_value().as_f64(), Some(14.0));
//! # Ok::<(), fluid_potentia::InstantiatorError>(())
//! ```

pub mod config;
pub mod diagnostics;
pub mod error;
pub mod events;
pub mod layer;
pub mod merge;
pub mod proxy;
pub mod reference;
pub mod registry;
pub mod scope;
pub mod shadow;
pub mod value;

mod destroy;
mod expand;
mod instantiator;


pub use config::{ConfigError, InstantiatorConfig};
pub use diagnostics::InstantiatorStats;
pub use error::{InstantiatorError, Result};
pub use events::{LifecycleEvent, LifecycleEventKind, Listener, ListenerId};
pub use instantiator::Instantiator;
pub use layer::{record_type, Layer, MergeRecord, Potentia, RecordKind, LAYERS_KEY};
pub use merge::MergeOutcome;
pub use proxy::{Facet, Proxy};
pub use reference::{is_reference, parse_reference, ContextName, ParsedReference, Reference};
pub use registry::{FunctionRegistry, LayerRegistry, LinkageRegistry, LinkageRule};
pub use scope::{Priority, ScopeRecord};
pub use shadow::{LifecycleStatus, ShadowId};
pub use value::{NativeFn, Reactive, Site, Table, Unavailable, Value};
