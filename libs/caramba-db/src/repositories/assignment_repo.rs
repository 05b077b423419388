use sqlx::PgPool;
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::models::assignment::{Assignment, AssignmentStatus};

const ASSIGNMENT_COLUMNS: &str = "id, subscriber_id, service_id, node_id, remote_binding_id, \
     traffic_limit_bytes, expires_at, status, migration_attempts, last_error, \
     migration_started_at, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct AssignmentRepository {
    pool: PgPool,
}

impl AssignmentRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get_by_id(&self, id: i64) -> StoreResult<Option<Assignment>> {
        let sql = format!("SELECT {} FROM assignments WHERE id = $1", ASSIGNMENT_COLUMNS);
        Ok(sqlx::query_as::<_, Assignment>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    pub async fn get_by_node(&self, node_id: i64, status: AssignmentStatus) -> StoreResult<Vec<Assignment>> {
        let sql = format!(
            "SELECT {} FROM assignments WHERE node_id = $1 AND status = $2 ORDER BY id ASC",
            ASSIGNMENT_COLUMNS
        );
        Ok(sqlx::query_as::<_, Assignment>(&sql)
            .bind(node_id)
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?)
    }

    pub async fn get_by_status(&self, status: AssignmentStatus) -> StoreResult<Vec<Assignment>> {
        let sql = format!(
            "SELECT {} FROM assignments WHERE status = $1 ORDER BY id ASC",
            ASSIGNMENT_COLUMNS
        );
        Ok(sqlx::query_as::<_, Assignment>(&sql)
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?)
    }

    pub async fn count_live_on_node(&self, node_id: i64) -> StoreResult<i64> {
        Ok(sqlx::query_scalar(
            "SELECT COUNT(*) FROM assignments WHERE node_id = $1 AND status IN ('active', 'migrating')",
        )
        .bind(node_id)
        .fetch_one(&self.pool)
        .await?)
    }

    pub async fn create(&self, a: &Assignment) -> StoreResult<i64> {
        let id = sqlx::query_scalar(
            r#"
            INSERT INTO assignments (
                subscriber_id, service_id, node_id, remote_binding_id, traffic_limit_bytes,
                expires_at, status, migration_attempts, last_error, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, CURRENT_TIMESTAMP, CURRENT_TIMESTAMP)
            RETURNING id
            "#
        )
        .bind(a.subscriber_id)
        .bind(a.service_id)
        .bind(a.node_id)
        .bind(&a.remote_binding_id)
        .bind(a.traffic_limit_bytes)
        .bind(a.expires_at)
        .bind(a.status.as_str())
        .bind(a.migration_attempts)
        .bind(&a.last_error)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::from_write(e, "assignment"))?;
        Ok(id)
    }

    /// Single-writer gate: flips `expected -> new` only if the row still holds
    /// `expected`. Entering `migrating` stamps `migration_started_at`.
    pub async fn compare_and_set_status(
        &self,
        id: i64,
        expected: AssignmentStatus,
        new: AssignmentStatus,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE assignments
            SET status = $1,
                migration_started_at = CASE WHEN $1::text = 'migrating' THEN CURRENT_TIMESTAMP ELSE NULL END,
                updated_at = CURRENT_TIMESTAMP
            WHERE id = $2 AND status = $3
            "#
        )
        .bind(new.as_str())
        .bind(id)
        .bind(expected.as_str())
        .execute(&self.pool)
        .await?;

        let swapped = result.rows_affected() == 1;
        debug!(assignment_id = id, %expected, %new, swapped, "assignment status CAS");
        Ok(swapped)
    }

    /// Puts a `migrating` row back to `active`, keeping the failure for the
    /// next attempt.
    pub async fn record_migration_failure(&self, id: i64, error: &str) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE assignments
            SET status = 'active',
                migration_attempts = migration_attempts + 1,
                last_error = $1,
                migration_started_at = NULL,
                updated_at = CURRENT_TIMESTAMP
            WHERE id = $2 AND status = 'migrating'
            "#
        )
        .bind(error)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Retires `old_id` and inserts its replacement in one transaction.
    pub async fn complete_migration(&self, old_id: i64, replacement: &Assignment) -> StoreResult<Assignment> {
        let mut tx = self.pool.begin().await?;

        let retired = sqlx::query(
            r#"
            UPDATE assignments
            SET status = 'inactive', migration_started_at = NULL, updated_at = CURRENT_TIMESTAMP
            WHERE id = $1 AND status = 'migrating'
            "#
        )
        .bind(old_id)
        .execute(&mut *tx)
        .await?;

        if retired.rows_affected() != 1 {
            tx.rollback().await?;
            return Err(StoreError::Conflict(format!(
                "assignment {} is no longer migrating",
                old_id
            )));
        }

        let sql = format!(
            r#"
            INSERT INTO assignments (
                subscriber_id, service_id, node_id, remote_binding_id, traffic_limit_bytes,
                expires_at, status, migration_attempts, last_error, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, 'active', 0, NULL, CURRENT_TIMESTAMP, CURRENT_TIMESTAMP)
            RETURNING {}
            "#,
            ASSIGNMENT_COLUMNS
        );
        let created = sqlx::query_as::<_, Assignment>(&sql)
            .bind(replacement.subscriber_id)
            .bind(replacement.service_id)
            .bind(replacement.node_id)
            .bind(&replacement.remote_binding_id)
            .bind(replacement.traffic_limit_bytes)
            .bind(replacement.expires_at)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| StoreError::from_write(e, "replacement assignment"))?;

        tx.commit().await?;
        Ok(created)
    }
}
