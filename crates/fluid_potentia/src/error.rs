//! Error types for fluid_potentia

use thiserror::Error;

use crate::shadow::LifecycleStatus;

/// Structural failures of the instantiation core
///
/// Resolution failures are never errors: they travel through the reactive
/// graph as [`Value::Unavailable`](crate::value::Value::Unavailable).
#[derive(Error, Debug)]
pub enum InstantiatorError {
    /// A different component already lives at the target path
    #[error("path \"{path}\" is already occupied by another component (circular or duplicate instantiation)")]
    PathOccupied { path: String },

    /// The path or component was never registered by this instantiator
    #[error("no component is registered at path \"{path}\"")]
    NotRegistered { path: String },

    /// Destruction was requested twice
    #[error("component at \"{path}\" is already {status}")]
    AlreadyDestroyed {
        path: String,
        status: LifecycleStatus,
    },

    /// The synthetic root only goes away with the instantiator
    #[error("the tree root cannot be destroyed")]
    RootDestroy,

    /// Reference string that does not follow `{context}.path`
    #[error("malformed context reference \"{reference}\": {reason}")]
    MalformedReference { reference: String, reason: String },

    /// Configuration record with an unusable shape
    #[error("malformed {kind} record at \"{site}\": {reason}")]
    MalformedRecord {
        kind: String,
        site: String,
        reason: String,
    },

    /// A collaborator's lifecycle listener failed
    #[error("lifecycle hook failed: {0}")]
    Hook(#[from] anyhow::Error),
}

/// Result type for fluid_potentia operations
pub type Result<T> = std::result::Result<T, InstantiatorError>;
