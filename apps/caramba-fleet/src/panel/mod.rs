//! Access to the management panel running on each VPN node.

use async_trait::async_trait;
use caramba_db::models::node::Node;
use caramba_shared::panel::{Binding, BindingRef, BindingSpec, PanelStatus};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::error::{FleetError, FleetResult};

pub mod http;

pub use http::{HttpPanelClient, HttpPanelConnector};

#[derive(Debug, Error)]
pub enum PanelError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("panel did not answer in time")]
    Timeout,

    #[error("panel unreachable: {0}")]
    Unreachable(String),

    #[error("panel returned HTTP {0}")]
    Status(u16),

    #[error("panel rejected the request: {0}")]
    Rejected(String),

    #[error("unexpected panel response: {0}")]
    Decode(String),

    #[error("panel rejected credentials")]
    Unauthorized,

    #[error("credentials unavailable: {0}")]
    Credentials(String),
}

/// One remote panel. Implementations keep their own session and
/// re-authenticate when it expires.
#[async_trait]
pub trait PanelClient: Send + Sync {
    async fn login(&self) -> Result<(), PanelError>;

    /// Status and resource metrics come back in a single call.
    async fn get_status(&self) -> Result<PanelStatus, PanelError>;

    async fn list_bindings(&self) -> Result<Vec<Binding>, PanelError>;

    async fn create_binding(&self, spec: &BindingSpec) -> Result<Binding, PanelError>;

    async fn update_binding(
        &self,
        binding: &BindingRef,
        spec: &BindingSpec,
    ) -> Result<(), PanelError>;

    async fn delete_binding(&self, binding: &BindingRef) -> Result<(), PanelError>;
}

/// Resolves the panel client for a node.
pub trait PanelConnector: Send + Sync {
    fn client_for(&self, node: &Node) -> Result<Arc<dyn PanelClient>, PanelError>;

    /// Drops any cached client, e.g. after the node's address changed.
    fn forget(&self, node_id: i64);
}

/// Runs one panel call under `timeout`, mapping failures onto the node.
pub async fn bounded<T, F>(timeout: Duration, node_id: i64, call: F) -> FleetResult<T>
where
    F: Future<Output = Result<T, PanelError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result.map_err(|e| FleetError::from_panel(node_id, e)),
        Err(_) => Err(FleetError::from_panel(node_id, PanelError::Timeout)),
    }
}
