//! The structured error taxonomy shared by every chronotree crate.
//!
//! Each variant corresponds to one of the error kinds in the engine's
//! design: validation, address allocation, tree/node lookup,
//! timeline/time, dimension, and storage. `code()` returns the stable,
//! machine-matchable string a caller can key off of without matching on
//! the full enum shape.

use std::fmt;

/// The single error type returned by every fallible chronotree operation.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// A value failed validation against a dimension's domain, or a
    /// configuration option was malformed.
    #[error("validation failed: {message}")]
    Validation { message: String },

    /// Address parsing failed: empty, non-numeric, over-range, or
    /// over-length segments.
    #[error("invalid address '{address}': {reason}")]
    InvalidAddress { address: String, reason: String },

    /// Allocation of a child address failed: unknown parent, depth
    /// exceeded, fan-out exceeded, or duplicate allocation.
    #[error("address allocation failed for parent '{parent}': {reason}")]
    AddressAllocation { parent: String, reason: String },

    /// No tree with the given id is known to the repository/store.
    #[error("tree '{tree_id}' not found")]
    TreeNotFound { tree_id: String },

    /// No node with the given id is known to the repository.
    #[error("node '{node_id}' not found")]
    NodeNotFound { node_id: String },

    /// A tree was loaded from storage but no node record had a null
    /// `parent_id`, so no root could be identified.
    #[error("tree '{tree_id}' has no root node")]
    NoRoot { tree_id: String },

    /// A write was attempted against a soft-deleted node.
    #[error("node '{node_id}' is inactive")]
    NodeInactive { node_id: String },

    /// A timestamp could not be interpreted (e.g. failed to parse, or
    /// is not representable at millisecond precision).
    #[error("invalid timestamp: {value}")]
    InvalidTimestamp { value: String },

    /// A historical query failed because the underlying storage call
    /// failed; the inner error retains the original storage context.
    #[error("history query failed: {source}")]
    HistoryQuery {
        #[source]
        source: Box<EngineError>,
    },

    /// An operation required a registered dimension descriptor and none
    /// was found under the given name.
    #[error("unknown dimension '{name}'")]
    UnknownDimension { name: String },

    /// A direct write was attempted against a derived dimension.
    #[error("dimension '{name}' is derived and cannot be written directly")]
    DimensionDerived { name: String },

    /// A storage backend operation failed. Carries the operation name
    /// and backend tag so a caller can distinguish "which call, on
    /// which backend" without inspecting the message.
    #[error("storage error during '{operation}' on backend '{backend}': {message}")]
    Storage {
        operation: String,
        backend: String,
        message: String,
    },
}

impl EngineError {
    /// The stable, machine-matchable error code for this variant, as
    /// quoted in the engine's design (`"IP_ALLOCATION"`, `"NODE_INACTIVE"`,
    /// `"DIMENSION_DERIVED"`, `"STORAGE"`, ...).
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Validation { .. } => "VALIDATION",
            EngineError::InvalidAddress { .. } => "INVALID_ADDRESS",
            EngineError::AddressAllocation { .. } => "IP_ALLOCATION",
            EngineError::TreeNotFound { .. } => "TREE_NOT_FOUND",
            EngineError::NodeNotFound { .. } => "NODE_NOT_FOUND",
            EngineError::NoRoot { .. } => "NO_ROOT",
            EngineError::NodeInactive { .. } => "NODE_INACTIVE",
            EngineError::InvalidTimestamp { .. } => "INVALID_TIMESTAMP",
            EngineError::HistoryQuery { .. } => "HISTORY_QUERY",
            EngineError::UnknownDimension { .. } => "UNKNOWN_DIMENSION",
            EngineError::DimensionDerived { .. } => "DIMENSION_DERIVED",
            EngineError::Storage { .. } => "STORAGE",
        }
    }

    pub fn storage(operation: impl Into<String>, backend: impl Into<String>, message: impl fmt::Display) -> Self {
        EngineError::Storage {
            operation: operation.into(),
            backend: backend.into(),
            message: message.to_string(),
        }
    }

    pub fn address_allocation(parent: impl Into<String>, reason: impl Into<String>) -> Self {
        EngineError::AddressAllocation {
            parent: parent.into(),
            reason: reason.into(),
        }
    }

    /// Wrap this error as the source of a `HistoryQuery` failure, used
    /// when a timeline's read path surfaces a storage error to a caller
    /// that would otherwise lose the "this was a history lookup" context.
    pub fn into_history_query(self) -> Self {
        EngineError::HistoryQuery {
            source: Box::new(self),
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
