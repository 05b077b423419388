use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::error::StoreResult;
use crate::models::monitoring::MonitoringSample;

#[derive(Debug, Clone)]
pub struct SampleRepository {
    pool: PgPool,
}

impl SampleRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn append(&self, samples: &[MonitoringSample]) -> StoreResult<()> {
        if samples.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for s in samples {
            sqlx::query(
                r#"
                INSERT INTO monitoring_samples (
                    node_id, recorded_at, latency_ms, cpu_pct, mem_pct, disk_pct, connections, error
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#
            )
            .bind(s.node_id)
            .bind(s.recorded_at)
            .bind(s.latency_ms)
            .bind(s.cpu_pct)
            .bind(s.mem_pct)
            .bind(s.disk_pct)
            .bind(s.connections)
            .bind(&s.error)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn get_range(
        &self,
        node_id: i64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<MonitoringSample>> {
        Ok(sqlx::query_as::<_, MonitoringSample>(
            r#"
            SELECT id, node_id, recorded_at, latency_ms, cpu_pct, mem_pct, disk_pct, connections, error
            FROM monitoring_samples
            WHERE node_id = $1 AND recorded_at >= $2 AND recorded_at < $3
            ORDER BY recorded_at ASC, id ASC
            "#
        )
        .bind(node_id)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn purge_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM monitoring_samples WHERE recorded_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
