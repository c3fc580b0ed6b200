use anyhow::Context;
use chrono::Utc;
use deadpool_postgres::Pool;
use drover_common::RequestContext;
use drover_common::error::{Error, Result};
use tokio_postgres::types::ToSql;
use uuid::Uuid;

use crate::db::{order_by_clause, parse_sort_dir, sort_columns, truncate_reason};
use crate::models::Cluster;

const CLUSTER_COLS: &str = "id, name, project, parent, profile_id, size, status, \
     status_reason, created_time, updated_time, deleted_time";

/// Caller-visible sort keys for cluster listings.
const SORT_WHITELIST: &[(&str, &str)] = &[
    ("name", "name"),
    ("status", "status"),
    ("created_time", "created_time"),
    ("updated_time", "updated_time"),
];

pub struct NewCluster {
    pub id: Uuid,
    pub name: String,
    pub project: String,
    pub parent: Option<Uuid>,
    pub profile_id: Option<Uuid>,
    pub size: i32,
    pub status: String,
    pub status_reason: Option<String>,
}

#[derive(Default)]
pub struct ClusterUpdate {
    pub name: Option<String>,
    pub size: Option<i32>,
    pub status: Option<String>,
    pub status_reason: Option<String>,
}

#[derive(Default, Clone)]
pub struct ClusterFilters {
    pub name: Option<String>,
    pub status: Option<String>,
}

pub struct ClusterListQuery {
    pub limit: Option<i64>,
    pub marker: Option<Uuid>,
    pub sort_keys: Vec<String>,
    pub sort_dir: Option<String>,
    pub filters: ClusterFilters,
    pub show_nested: bool,
    pub show_deleted: bool,
}

impl Default for ClusterListQuery {
    fn default() -> Self {
        Self {
            limit: None,
            marker: None,
            sort_keys: Vec::new(),
            sort_dir: None,
            filters: ClusterFilters::default(),
            show_nested: false,
            show_deleted: false,
        }
    }
}

pub async fn cluster_create(pool: &Pool, values: NewCluster) -> Result<Cluster> {
    let client = pool.get().await.context("failed to get db connection")?;

    let reason = values.status_reason.as_deref().map(truncate_reason);
    let row = client
        .query_one(
            &format!(
                r#"
                INSERT INTO clusters (id, name, project, parent, profile_id, size, status, status_reason)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                RETURNING {CLUSTER_COLS}
                "#
            ),
            &[
                &values.id,
                &values.name,
                &values.project,
                &values.parent,
                &values.profile_id,
                &values.size,
                &values.status,
                &reason,
            ],
        )
        .await
        .context("failed to insert cluster")?;

    Ok(Cluster::from_row(&row))
}

/// Tenant-safe get: a cluster belonging to another project is reported as
/// absent, not forbidden, so ids can't be probed across projects.
pub async fn cluster_get(
    pool: &Pool,
    ctx: &RequestContext,
    id: Uuid,
    show_deleted: bool,
) -> Result<Option<Cluster>> {
    let client = pool.get().await.context("failed to get db connection")?;

    let row = client
        .query_opt(
            &format!("SELECT {CLUSTER_COLS} FROM clusters WHERE id = $1"),
            &[&id],
        )
        .await
        .context("failed to query cluster")?;

    let Some(row) = row else {
        return Ok(None);
    };
    let cluster = Cluster::from_row(&row);

    if cluster.deleted_time.is_some() && !(show_deleted || ctx.show_deleted) {
        return Ok(None);
    }
    if cluster.project != ctx.project {
        return Ok(None);
    }
    Ok(Some(cluster))
}

/// Unscoped lookup for engine internals (handlers run as the system, not a
/// tenant). Soft-deleted rows are still visible here.
pub async fn cluster_get_unscoped(pool: &Pool, id: Uuid) -> Result<Option<Cluster>> {
    let client = pool.get().await.context("failed to get db connection")?;

    let row = client
        .query_opt(
            &format!("SELECT {CLUSTER_COLS} FROM clusters WHERE id = $1"),
            &[&id],
        )
        .await
        .context("failed to query cluster")?;

    Ok(row.map(|r| Cluster::from_row(&r)))
}

pub async fn cluster_get_by_name(
    pool: &Pool,
    ctx: &RequestContext,
    name: &str,
) -> Result<Option<Cluster>> {
    let client = pool.get().await.context("failed to get db connection")?;

    let row = client
        .query_opt(
            &format!(
                r#"
                SELECT {CLUSTER_COLS} FROM clusters
                WHERE project = $1 AND name = $2 AND deleted_time IS NULL
                ORDER BY created_time, id
                LIMIT 1
                "#
            ),
            &[&ctx.project, &name],
        )
        .await
        .context("failed to query cluster by name")?;

    Ok(row.map(|r| Cluster::from_row(&r)))
}

pub async fn cluster_get_by_name_and_parent(
    pool: &Pool,
    ctx: &RequestContext,
    name: &str,
    parent: Option<Uuid>,
) -> Result<Option<Cluster>> {
    let client = pool.get().await.context("failed to get db connection")?;

    let row = client
        .query_opt(
            &format!(
                r#"
                SELECT {CLUSTER_COLS} FROM clusters
                WHERE project = $1 AND name = $2
                  AND parent IS NOT DISTINCT FROM $3
                  AND deleted_time IS NULL
                ORDER BY created_time, id
                LIMIT 1
                "#
            ),
            &[&ctx.project, &name, &parent],
        )
        .await
        .context("failed to query cluster by name and parent")?;

    Ok(row.map(|r| Cluster::from_row(&r)))
}

pub async fn cluster_get_all_by_parent(pool: &Pool, parent: Uuid) -> Result<Vec<Cluster>> {
    let client = pool.get().await.context("failed to get db connection")?;

    let rows = client
        .query(
            &format!(
                "SELECT {CLUSTER_COLS} FROM clusters WHERE parent = $1 AND deleted_time IS NULL"
            ),
            &[&parent],
        )
        .await
        .context("failed to query child clusters")?;

    Ok(rows.iter().map(Cluster::from_row).collect())
}

/// Paginated listing. Sorting is keyset-stable: `id` is always the final
/// sort key, and `marker` resumes after the row it names in the same total
/// order.
pub async fn cluster_get_all(
    pool: &Pool,
    ctx: &RequestContext,
    q: &ClusterListQuery,
) -> Result<Vec<Cluster>> {
    let client = pool.get().await.context("failed to get db connection")?;

    // Default sort: newest first.
    let (cols, dir) = if q.sort_keys.is_empty() {
        (
            vec!["created_time", "id"],
            match q.sort_dir.as_deref() {
                None => "DESC",
                some => parse_sort_dir(some)?,
            },
        )
    } else {
        (
            sort_columns(&q.sort_keys, SORT_WHITELIST)?,
            parse_sort_dir(q.sort_dir.as_deref())?,
        )
    };

    let mut sql = format!("SELECT {CLUSTER_COLS} FROM clusters WHERE project = $1");
    let mut params: Vec<&(dyn ToSql + Sync)> = vec![&ctx.project];
    let mut idx = 2;

    if !(q.show_deleted || ctx.show_deleted) {
        sql.push_str(" AND deleted_time IS NULL");
    }
    if !q.show_nested {
        sql.push_str(" AND parent IS NULL");
    }
    if let Some(ref name) = q.filters.name {
        sql.push_str(&format!(" AND name = ${idx}"));
        params.push(name);
        idx += 1;
    }
    if let Some(ref status) = q.filters.status {
        sql.push_str(&format!(" AND status = ${idx}"));
        params.push(status);
        idx += 1;
    }
    if let Some(ref marker) = q.marker {
        // Resume strictly after the marker row in the computed order.
        let col_list = cols.join(", ");
        let cmp = if dir == "ASC" { ">" } else { "<" };
        sql.push_str(&format!(
            " AND ({col_list}) {cmp} (SELECT {col_list} FROM clusters WHERE id = ${idx})"
        ));
        params.push(marker);
        idx += 1;
    }

    sql.push_str(&format!(" ORDER BY {}", order_by_clause(&cols, dir)));

    if let Some(ref limit) = q.limit {
        sql.push_str(&format!(" LIMIT ${idx}"));
        params.push(limit);
    }

    let rows = client
        .query(&sql, &params)
        .await
        .context("failed to list clusters")?;

    Ok(rows.iter().map(Cluster::from_row).collect())
}

/// Count of live clusters in the caller's project; used by the admission
/// limit on cluster creation.
pub async fn cluster_count_all(pool: &Pool, ctx: &RequestContext) -> Result<i64> {
    let client = pool.get().await.context("failed to get db connection")?;

    let row = client
        .query_one(
            "SELECT COUNT(*) FROM clusters WHERE project = $1 AND deleted_time IS NULL",
            &[&ctx.project],
        )
        .await
        .context("failed to count clusters")?;

    Ok(row.get(0))
}

pub async fn cluster_update(pool: &Pool, id: Uuid, values: ClusterUpdate) -> Result<Cluster> {
    let client = pool.get().await.context("failed to get db connection")?;

    let mut set_clauses = Vec::new();
    let mut params: Vec<&(dyn ToSql + Sync)> = Vec::new();
    let mut param_idx = 1;

    if let Some(ref n) = values.name {
        set_clauses.push(format!("name = ${}", param_idx));
        params.push(n);
        param_idx += 1;
    }
    if let Some(ref s) = values.size {
        set_clauses.push(format!("size = ${}", param_idx));
        params.push(s);
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
        "UPDATE clusters SET {} WHERE id = ${} AND deleted_time IS NULL RETURNING {CLUSTER_COLS}",
        set_clauses.join(", "),
        param_idx
    );
    params.push(&id);

    let row = client
        .query_opt(&query, &params)
        .await
        .context("failed to update cluster")?;

    match row {
        Some(row) => Ok(Cluster::from_row(&row)),
        None => Err(Error::not_found("cluster", id)),
    }
}

/// Delete a cluster: its member nodes and policy bindings go away and the
/// cluster row itself is soft-deleted, all in one transaction.
pub async fn cluster_delete(pool: &Pool, id: Uuid) -> Result<()> {
    let mut client = pool.get().await.context("failed to get db connection")?;

    let tx = client
        .transaction()
        .await
        .context("failed to start transaction")?;

    let row = tx
        .query_opt(
            "SELECT id FROM clusters WHERE id = $1 AND deleted_time IS NULL FOR UPDATE",
            &[&id],
        )
        .await
        .context("failed to lock cluster row")?;
    if row.is_none() {
        tx.rollback().await.context("failed to rollback")?;
        return Err(Error::not_found("cluster", id));
    }

    tx.execute("DELETE FROM nodes WHERE cluster_id = $1", &[&id])
        .await
        .context("failed to delete member nodes")?;
    tx.execute("DELETE FROM cluster_policies WHERE cluster_id = $1", &[&id])
        .await
        .context("failed to delete policy bindings")?;
    tx.execute(
        "UPDATE clusters SET deleted_time = now(), updated_time = now(), status = 'DELETED' WHERE id = $1",
        &[&id],
    )
    .await
    .context("failed to soft-delete cluster")?;

    tx.commit().await.context("failed to commit transaction")?;
    Ok(())
}
