use anyhow::Context;
use chrono::Utc;
use deadpool_postgres::Pool;
use drover_common::error::{Error, Result};
use tokio_postgres::types::ToSql;
use uuid::Uuid;

use crate::db::truncate_reason;
use crate::models::Node;

const NODE_COLS: &str = "id, name, cluster_id, physical_id, profile_id, status, \
     status_reason, created_time, updated_time";

pub struct NewNode {
    pub id: Uuid,
    pub name: String,
    pub cluster_id: Option<Uuid>,
    pub physical_id: Option<Uuid>,
    pub profile_id: Option<Uuid>,
    pub status: String,
    pub status_reason: Option<String>,
}

#[derive(Default)]
pub struct NodeUpdate {
    pub name: Option<String>,
    pub physical_id: Option<Uuid>,
    pub status: Option<String>,
    pub status_reason: Option<String>,
}

pub async fn node_create(pool: &Pool, values: NewNode) -> Result<Node> {
    let client = pool.get().await.context("failed to get db connection")?;

    let reason = values.status_reason.as_deref().map(truncate_reason);
    let row = client
        .query_one(
            &format!(
                r#"
                INSERT INTO nodes (id, name, cluster_id, physical_id, profile_id, status, status_reason)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                RETURNING {NODE_COLS}
                "#
            ),
            &[
                &values.id,
                &values.name,
                &values.cluster_id,
                &values.physical_id,
                &values.profile_id,
                &values.status,
                &reason,
            ],
        )
        .await
        .context("failed to insert node")?;

    Ok(Node::from_row(&row))
}

pub async fn node_get(pool: &Pool, id: Uuid) -> Result<Node> {
    node_get_opt(pool, id)
        .await?
        .ok_or_else(|| Error::not_found("node", id))
}

pub async fn node_get_opt(pool: &Pool, id: Uuid) -> Result<Option<Node>> {
    let client = pool.get().await.context("failed to get db connection")?;

    let row = client
        .query_opt(
            &format!("SELECT {NODE_COLS} FROM nodes WHERE id = $1"),
            &[&id],
        )
        .await
        .context("failed to query node")?;

    Ok(row.map(|r| Node::from_row(&r)))
}

pub async fn node_get_all_by_cluster(pool: &Pool, cluster_id: Uuid) -> Result<Vec<Node>> {
    let client = pool.get().await.context("failed to get db connection")?;

    let rows = client
        .query(
            &format!(
                "SELECT {NODE_COLS} FROM nodes WHERE cluster_id = $1 ORDER BY name, id"
            ),
            &[&cluster_id],
        )
        .await
        .context("failed to list cluster nodes")?;

    Ok(rows.iter().map(Node::from_row).collect())
}

pub async fn node_get_by_name_and_cluster(
    pool: &Pool,
    name: &str,
    cluster_id: Uuid,
) -> Result<Option<Node>> {
    let client = pool.get().await.context("failed to get db connection")?;

    let row = client
        .query_opt(
            &format!(
                "SELECT {NODE_COLS} FROM nodes WHERE name = $1 AND cluster_id = $2 LIMIT 1"
            ),
            &[&name, &cluster_id],
        )
        .await
        .context("failed to query node by name")?;

    Ok(row.map(|r| Node::from_row(&r)))
}

pub async fn node_get_by_physical_id(pool: &Pool, physical_id: Uuid) -> Result<Option<Node>> {
    let client = pool.get().await.context("failed to get db connection")?;

    let row = client
        .query_opt(
            &format!("SELECT {NODE_COLS} FROM nodes WHERE physical_id = $1 LIMIT 1"),
            &[&physical_id],
        )
        .await
        .context("failed to query node by physical id")?;

    Ok(row.map(|r| Node::from_row(&r)))
}

pub async fn node_update(pool: &Pool, id: Uuid, values: NodeUpdate) -> Result<Node> {
    let client = pool.get().await.context("failed to get db connection")?;

    let mut set_clauses = Vec::new();
    let mut params: Vec<&(dyn ToSql + Sync)> = Vec::new();
    let mut param_idx = 1;

    if let Some(ref n) = values.name {
        set_clauses.push(format!("name = ${}", param_idx));
        params.push(n);
        param_idx += 1;
    }
    if let Some(ref p) = values.physical_id {
        set_clauses.push(format!("physical_id = ${}", param_idx));
        params.push(p);
        param_idx += 1;
    }
    if let Some(ref s) = values.status {
        set_clauses.push(format!("status = ${}", param_idx));
        params.push(s);
        param_idx += 1;
    }
    let reason = values.status_reason.as_deref().map(truncate_reason);
    if let Some(ref r) = reason {
        set_clauses.push(format!("status_reason = ${}", param_idx));
        params.push(r);
        param_idx += 1;
    }

    let updated_time = Utc::now();
    set_clauses.push(format!("updated_time = ${}", param_idx));
    params.push(&updated_time);
    param_idx += 1;

    let query = format!(
        "UPDATE nodes SET {} WHERE id = ${} RETURNING {NODE_COLS}",
        set_clauses.join(", "),
        param_idx
    );
    params.push(&id);

    let row = client
        .query_opt(&query, &params)
        .await
        .context("failed to update node")?;

    match row {
        Some(row) => Ok(Node::from_row(&row)),
        None => Err(Error::not_found("node", id)),
    }
}

/// Remove a node. If it is still a cluster member, the cluster's size is
/// decremented in the same transaction.
pub async fn node_delete(pool: &Pool, id: Uuid) -> Result<()> {
    let mut client = pool.get().await.context("failed to get db connection")?;

    let tx = client
        .transaction()
        .await
        .context("failed to start transaction")?;

    let row = tx
        .query_opt("SELECT cluster_id FROM nodes WHERE id = $1 FOR UPDATE", &[&id])
        .await
        .context("failed to lock node row")?;
    let Some(row) = row else {
        tx.rollback().await.context("failed to rollback")?;
        return Err(Error::not_found("node", id));
    };

    let cluster_id: Option<Uuid> = row.get("cluster_id");
    if let Some(cluster_id) = cluster_id {
        tx.execute(
            "UPDATE clusters SET size = size - 1, updated_time = now() WHERE id = $1",
            &[&cluster_id],
        )
        .await
        .context("failed to decrement cluster size")?;
    }
    tx.execute("DELETE FROM nodes WHERE id = $1", &[&id])
        .await
        .context("failed to delete node")?;

    tx.commit().await.context("failed to commit transaction")?;
    Ok(())
}

/// Move a node between clusters, keeping both size counters honest. A `None`
/// on either side models joining from (or leaving to) the orphan pool.
pub async fn node_migrate(
    pool: &Pool,
    node_id: Uuid,
    from_cluster: Option<Uuid>,
    to_cluster: Option<Uuid>,
) -> Result<()> {
    let mut client = pool.get().await.context("failed to get db connection")?;

    let tx = client
        .transaction()
        .await
        .context("failed to start transaction")?;

    let row = tx
        .query_opt("SELECT id FROM nodes WHERE id = $1 FOR UPDATE", &[&node_id])
        .await
        .context("failed to lock node row")?;
    if row.is_none() {
        tx.rollback().await.context("failed to rollback")?;
        return Err(Error::not_found("node", node_id));
    }

    if let Some(from) = from_cluster {
        tx.execute(
            "UPDATE clusters SET size = size - 1, updated_time = now() WHERE id = $1",
            &[&from],
        )
        .await
        .context("failed to decrement source cluster size")?;
    }
    if let Some(to) = to_cluster {
        tx.execute(
            "UPDATE clusters SET size = size + 1, updated_time = now() WHERE id = $1",
            &[&to],
        )
        .await
        .context("failed to increment destination cluster size")?;
    }
    tx.execute(
        "UPDATE nodes SET cluster_id = $2, updated_time = now() WHERE id = $1",
        &[&node_id, &to_cluster],
    )
    .await
    .context("failed to reassign node")?;

    tx.commit().await.context("failed to commit transaction")?;
    Ok(())
}
