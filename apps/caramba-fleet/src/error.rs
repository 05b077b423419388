use caramba_db::StoreError;
use thiserror::Error;

use crate::panel::PanelError;

#[derive(Debug, Error)]
pub enum FleetError {
    /// Probe or panel call failed; retried on the next cycle.
    #[error("node {node_id}: transient network error: {message}")]
    TransientNetwork { node_id: i64, message: String },

    /// The node's panel login is missing, malformed or rejected even after
    /// a fresh login. Affects that node only.
    #[error("node {node_id}: {message}")]
    Auth { node_id: i64, message: String },

    #[error("no node with spare capacity in {scope}")]
    CapacityExhausted { scope: String },

    /// New binding is authoritative but the old one could not be released.
    #[error("assignment {assignment_id}: old binding {binding} on node {node_id} not released: {message}")]
    MigrationPartialFailure {
        assignment_id: i64,
        node_id: i64,
        binding: String,
        message: String,
    },

    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    #[error("node {0} is not registered")]
    UnknownNode(i64),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl FleetError {
    pub fn from_panel(node_id: i64, err: PanelError) -> Self {
        match err {
            err @ (PanelError::Unauthorized | PanelError::Credentials(_)) => FleetError::Auth {
                node_id,
                message: err.to_string(),
            },
            other => FleetError::TransientNetwork {
                node_id,
                message: other.to_string(),
            },
        }
    }

    /// Errors that abort a whole cycle rather than one node or assignment.
    pub fn is_cycle_fatal(&self) -> bool {
        matches!(self, FleetError::Store(_) | FleetError::Config(_))
    }

    /// The node cannot be driven through its panel at all until an
    /// administrator fixes its login.
    pub fn is_node_auth(&self) -> bool {
        matches!(self, FleetError::Auth { .. })
    }
}


pub type FleetResult<T> = Result<T, FleetError>;
