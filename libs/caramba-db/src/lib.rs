pub mod db;
pub mod error;
pub mod memory;
pub mod models;
pub mod repositories;
pub mod store;

pub use error::{StoreError, StoreResult};
pub use memory::MemoryStateStore;
pub use store::{PgStateStore, StateStore};
pub use sqlx;
use anyhow::Result;
use std::time::Duration;

/// Connects with a bounded pool, applies per-statement and acquire timeouts,
/// then runs the embedded migrations.
pub async fn connect(url: &str, timeout: Duration) -> Result<PgStateStore> {
    let pool = db::init_pool(url, timeout).await?;
    Ok(PgStateStore::new(pool))
}
