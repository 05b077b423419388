use std::collections::HashMap;

use sqlx::PgPool;
use crate::error::{StoreError, StoreResult};
use crate::models::groups::{NodeGroup, SelectionPolicy};
use crate::models::node::{Node, NodeStatus};

const NODE_COLUMNS: &str = "id, name, address, credentials_ref, inbound_id, capacity, current_load, \
     weight, status, maintenance, last_latency_ms, uptime_pct, last_checked";

#[derive(Debug, Clone)]
pub struct NodeRepository {
    pool: PgPool,
}

impl NodeRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    // ==================== NODES ====================

    pub async fn get_all_nodes(&self) -> StoreResult<Vec<Node>> {
        let sql = format!("SELECT {} FROM fleet_nodes ORDER BY id ASC", NODE_COLUMNS);
        Ok(sqlx::query_as::<_, Node>(&sql).fetch_all(&self.pool).await?)
    }

    pub async fn get_node_by_id(&self, id: i64) -> StoreResult<Option<Node>> {
        let sql = format!("SELECT {} FROM fleet_nodes WHERE id = $1", NODE_COLUMNS);
        Ok(sqlx::query_as::<_, Node>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    pub async fn create_node(&self, node: &Node) -> StoreResult<i64> {
        let id = sqlx::query_scalar(
            r#"
            INSERT INTO fleet_nodes (
                name, address, credentials_ref, inbound_id, capacity, current_load,
                weight, status, maintenance, last_latency_ms, uptime_pct, last_checked
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            RETURNING id
            "#
        )
        .bind(&node.name)
        .bind(&node.address)
        .bind(&node.credentials_ref)
        .bind(node.inbound_id)
        .bind(node.capacity)
        .bind(node.current_load)
        .bind(node.weight)
        .bind(node.status.as_str())
        .bind(node.maintenance)
        .bind(node.last_latency_ms)
        .bind(node.uptime_pct)
        .bind(node.last_checked)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::from_write(e, "node"))?;

        Ok(id)
    }

    pub async fn update_node(&self, node: &Node) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE fleet_nodes
            SET name=$1, address=$2, credentials_ref=$3, inbound_id=$4, capacity=$5, current_load=$6,
                weight=$7, status=$8, maintenance=$9, last_latency_ms=$10, uptime_pct=$11, last_checked=$12
            WHERE id=$13
            "#
        )
        .bind(&node.name)
        .bind(&node.address)
        .bind(&node.credentials_ref)
        .bind(node.inbound_id)
        .bind(node.capacity)
        .bind(node.current_load)
        .bind(node.weight)
        .bind(node.status.as_str())
        .bind(node.maintenance)
        .bind(node.last_latency_ms)
        .bind(node.uptime_pct)
        .bind(node.last_checked)
        .bind(node.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound { entity: "node", id: node.id });
        }
        Ok(())
    }

    /// Writes only the fields owned by health evaluation and load accounting.
    /// The maintenance flag belongs to the administrator and is left alone.
    pub async fn update_health(&self, node: &Node) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE fleet_nodes
            SET status=$1, last_latency_ms=$2, uptime_pct=$3, last_checked=$4, current_load=$5
            WHERE id=$6
            "#
        )
        .bind(node.status.as_str())
        .bind(node.last_latency_ms)
        .bind(node.uptime_pct)
        .bind(node.last_checked)
        .bind(node.current_load)
        .bind(node.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_maintenance(&self, id: i64, on: bool, status: NodeStatus) -> StoreResult<()> {
        let result = sqlx::query("UPDATE fleet_nodes SET maintenance = $1, status = $2 WHERE id = $3")
            .bind(on)
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound { entity: "node", id });
        }
        Ok(())
    }

    pub async fn request_release(&self, id: i64) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO fleet_release_requests (node_id, requested_at) VALUES ($1, CURRENT_TIMESTAMP) ON CONFLICT (node_id) DO NOTHING",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            let missing = matches!(&e, sqlx::Error::Database(db) if db.is_foreign_key_violation());
            if missing {
                StoreError::NotFound { entity: "node", id }
            } else {
                StoreError::from_write(e, "release request")
            }
        })?;
        Ok(())
    }

    pub async fn take_release_requests(&self) -> StoreResult<Vec<i64>> {
        let rows: Vec<(i64,)> =
            sqlx::query_as("DELETE FROM fleet_release_requests RETURNING node_id")
                .fetch_all(&self.pool)
                .await?;
        let mut ids: Vec<i64> = rows.into_iter().map(|(id,)| id).collect();
        ids.sort_unstable();
        Ok(ids)
    }

    pub async fn delete_node(&self, id: i64) -> StoreResult<()> {
        sqlx::query("DELETE FROM fleet_nodes WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ==================== GROUPS ====================

    pub async fn get_all_groups(&self) -> StoreResult<Vec<NodeGroup>> {
        let mut groups = sqlx::query_as::<_, NodeGroup>(
            "SELECT id, name, policy FROM fleet_groups ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        let members: Vec<(i64, i64)> = sqlx::query_as(
            "SELECT group_id, node_id FROM fleet_group_members ORDER BY group_id ASC, node_id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut by_group: HashMap<i64, Vec<i64>> = HashMap::new();
        for (group_id, node_id) in members {
            by_group.entry(group_id).or_default().push(node_id);
        }
        for group in &mut groups {
            group.node_ids = by_group.remove(&group.id).unwrap_or_default();
        }
        Ok(groups)
    }

    pub async fn create_group(&self, name: &str, policy: SelectionPolicy) -> StoreResult<i64> {
        let id = sqlx::query_scalar(
            "INSERT INTO fleet_groups (name, policy, created_at) VALUES ($1, $2, CURRENT_TIMESTAMP) RETURNING id"
        )
        .bind(name)
        .bind(policy.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::from_write(e, "node group"))?;
        Ok(id)
    }

    pub async fn set_group_policy(&self, group_id: i64, policy: SelectionPolicy) -> StoreResult<()> {
        let result = sqlx::query("UPDATE fleet_groups SET policy = $1 WHERE id = $2")
            .bind(policy.as_str())
            .bind(group_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound { entity: "node group", id: group_id });
        }
        Ok(())
    }

    pub async fn add_node_to_group(&self, node_id: i64, group_id: i64) -> StoreResult<()> {
        sqlx::query("INSERT INTO fleet_group_members (node_id, group_id, created_at) VALUES ($1, $2, CURRENT_TIMESTAMP) ON CONFLICT DO NOTHING")
            .bind(node_id)
            .bind(group_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn remove_node_from_group(&self, node_id: i64, group_id: i64) -> StoreResult<()> {
        sqlx::query("DELETE FROM fleet_group_members WHERE node_id = $1 AND group_id = $2")
            .bind(node_id)
            .bind(group_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_group(&self, group_id: i64) -> StoreResult<()> {
        sqlx::query("DELETE FROM fleet_groups WHERE id = $1")
            .bind(group_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
