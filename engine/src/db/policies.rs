use anyhow::Context;
use deadpool_postgres::Pool;
use drover_common::error::{Error, Result};
use serde_json::Value;
use uuid::Uuid;

use crate::models::{ClusterPolicy, Policy};

const POLICY_COLS: &str = "id, name, policy_type, spec, created_time, deleted_time";
const BINDING_COLS: &str = "cluster_id, policy_id, enabled, priority, cooldown, level";

pub struct NewPolicy {
    pub id: Uuid,
    pub name: String,
    pub policy_type: String,
    pub spec: Value,
}

/// Binding attributes chosen at attach time.
pub struct PolicyBinding {
    pub enabled: bool,
    pub priority: i32,
    pub cooldown: i32,
    pub level: i32,
}

impl Default for PolicyBinding {
    fn default() -> Self {
        Self {
            enabled: true,
            priority: 50,
            cooldown: 0,
            level: 0,
        }
    }
}

pub async fn policy_create(pool: &Pool, values: NewPolicy) -> Result<Policy> {
    let client = pool.get().await.context("failed to get db connection")?;

    let row = client
        .query_one(
            &format!(
                r#"
                INSERT INTO policies (id, name, policy_type, spec)
                VALUES ($1, $2, $3, $4)
                RETURNING {POLICY_COLS}
                "#
            ),
            &[&values.id, &values.name, &values.policy_type, &values.spec],
        )
        .await
        .context("failed to insert policy")?;

    Ok(Policy::from_row(&row))
}

pub async fn policy_get(pool: &Pool, id: Uuid, show_deleted: bool) -> Result<Policy> {
    let client = pool.get().await.context("failed to get db connection")?;

    let mut sql = format!("SELECT {POLICY_COLS} FROM policies WHERE id = $1");
    if !show_deleted {
        sql.push_str(" AND deleted_time IS NULL");
    }
    let row = client
        .query_opt(&sql, &[&id])
        .await
        .context("failed to query policy")?;

    row.map(|r| Policy::from_row(&r))
        .ok_or_else(|| Error::not_found("policy", id))
}

pub async fn policy_get_all(pool: &Pool, show_deleted: bool) -> Result<Vec<Policy>> {
    let client = pool.get().await.context("failed to get db connection")?;

    let mut sql = format!("SELECT {POLICY_COLS} FROM policies");
    if !show_deleted {
        sql.push_str(" WHERE deleted_time IS NULL");
    }
    sql.push_str(" ORDER BY created_time DESC, id DESC");
    let rows = client
        .query(&sql, &[])
        .await
        .context("failed to list policies")?;

    Ok(rows.iter().map(Policy::from_row).collect())
}

pub async fn policy_update(pool: &Pool, id: Uuid, name: Option<&str>, spec: Option<&Value>) -> Result<Policy> {
    let client = pool.get().await.context("failed to get db connection")?;

    let row = client
        .query_opt(
            &format!(
                r#"
                UPDATE policies
                SET name = COALESCE($2, name), spec = COALESCE($3, spec)
                WHERE id = $1 AND deleted_time IS NULL
                RETURNING {POLICY_COLS}
                "#
            ),
            &[&id, &name, &spec],
        )
        .await
        .context("failed to update policy")?;

    row.map(|r| Policy::from_row(&r))
        .ok_or_else(|| Error::not_found("policy", id))
}

/// Soft-delete a policy. A policy still bound to any cluster must be
/// detached first.
pub async fn policy_delete(pool: &Pool, id: Uuid) -> Result<()> {
    let mut client = pool.get().await.context("failed to get db connection")?;

    let tx = client
        .transaction()
        .await
        .context("failed to start transaction")?;

    let bound: i64 = tx
        .query_one(
            "SELECT COUNT(*) FROM cluster_policies WHERE policy_id = $1",
            &[&id],
        )
        .await
        .context("failed to count policy bindings")?
        .get(0);
    if bound > 0 {
        tx.rollback().await.context("failed to rollback")?;
        return Err(Error::Conflict(format!(
            "policy {id} is attached to {bound} cluster(s)"
        )));
    }

    let affected = tx
        .execute(
            "UPDATE policies SET deleted_time = now() WHERE id = $1 AND deleted_time IS NULL",
            &[&id],
        )
        .await
        .context("failed to soft-delete policy")?;

    tx.commit().await.context("failed to commit transaction")?;

    if affected == 0 {
        return Err(Error::not_found("policy", id));
    }
    Ok(())
}

pub async fn cluster_attach_policy(
    pool: &Pool,
    cluster_id: Uuid,
    policy_id: Uuid,
    values: PolicyBinding,
) -> Result<ClusterPolicy> {
    let client = pool.get().await.context("failed to get db connection")?;

    let row = client
        .query_opt(
            &format!(
                r#"
                INSERT INTO cluster_policies (cluster_id, policy_id, enabled, priority, cooldown, level)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (cluster_id, policy_id) DO NOTHING
                RETURNING {BINDING_COLS}
                "#
            ),
            &[
                &cluster_id,
                &policy_id,
                &values.enabled,
                &values.priority,
                &values.cooldown,
                &values.level,
            ],
        )
        .await
        .context("failed to attach policy")?;

    row.map(|r| ClusterPolicy::from_row(&r)).ok_or_else(|| {
        Error::Conflict(format!(
            "policy {policy_id} is already attached to cluster {cluster_id}"
        ))
    })
}

pub async fn cluster_detach_policy(pool: &Pool, cluster_id: Uuid, policy_id: Uuid) -> Result<()> {
    let client = pool.get().await.context("failed to get db connection")?;

    let affected = client
        .execute(
            "DELETE FROM cluster_policies WHERE cluster_id = $1 AND policy_id = $2",
            &[&cluster_id, &policy_id],
        )
        .await
        .context("failed to detach policy")?;

    if affected == 0 {
        return Err(Error::not_found("cluster policy binding", policy_id));
    }
    Ok(())
}

pub async fn cluster_get_policies(pool: &Pool, cluster_id: Uuid) -> Result<Vec<ClusterPolicy>> {
    let client = pool.get().await.context("failed to get db connection")?;

    let rows = client
        .query(
            &format!(
                "SELECT {BINDING_COLS} FROM cluster_policies WHERE cluster_id = $1 ORDER BY priority, policy_id"
            ),
            &[&cluster_id],
        )
        .await
        .context("failed to list cluster policies")?;

    Ok(rows.iter().map(ClusterPolicy::from_row).collect())
}

async fn set_policy_enabled(
    pool: &Pool,
    cluster_id: Uuid,
    policy_id: Uuid,
    enabled: bool,
) -> Result<ClusterPolicy> {
    let client = pool.get().await.context("failed to get db connection")?;

    let row = client
        .query_opt(
            &format!(
                r#"
                UPDATE cluster_policies SET enabled = $3
                WHERE cluster_id = $1 AND policy_id = $2
                RETURNING {BINDING_COLS}
                "#
            ),
            &[&cluster_id, &policy_id, &enabled],
        )
        .await
        .context("failed to toggle policy binding")?;

    row.map(|r| ClusterPolicy::from_row(&r))
        .ok_or_else(|| Error::not_found("cluster policy binding", policy_id))
}

pub async fn cluster_enable_policy(
    pool: &Pool,
    cluster_id: Uuid,
    policy_id: Uuid,
) -> Result<ClusterPolicy> {
    set_policy_enabled(pool, cluster_id, policy_id, true).await
}

pub async fn cluster_disable_policy(
    pool: &Pool,
    cluster_id: Uuid,
    policy_id: Uuid,
) -> Result<ClusterPolicy> {
    set_policy_enabled(pool, cluster_id, policy_id, false).await
}
