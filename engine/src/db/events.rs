use anyhow::Context;
use deadpool_postgres::Pool;
use drover_common::error::{Error, Result};
use serde_json::Value;
use uuid::Uuid;

use crate::models::Event;

const EVENT_COLS: &str = "id, obj_id, obj_type, timestamp, level, payload";

pub const OBJ_CLUSTER: &str = "CLUSTER";
pub const OBJ_NODE: &str = "NODE";
pub const OBJ_ACTION: &str = "ACTION";

pub struct NewEvent {
    pub obj_id: Uuid,
    pub obj_type: &'static str,
    pub level: &'static str,
    pub payload: Option<Value>,
}

/// Append an event. When the target is a cluster already at the event cap,
/// the oldest `purge_batch_size` rows for that cluster are dropped in the
/// same transaction, so the cap holds at commit.
pub async fn event_create(
    pool: &Pool,
    values: NewEvent,
    max_events_per_cluster: i64,
    purge_batch_size: i64,
) -> Result<Event> {
    let mut client = pool.get().await.context("failed to get db connection")?;

    let tx = client
        .transaction()
        .await
        .context("failed to start transaction")?;

    if values.obj_type == OBJ_CLUSTER && max_events_per_cluster > 0 {
        let count: i64 = tx
            .query_one(
                "SELECT COUNT(*) FROM events WHERE obj_id = $1 AND obj_type = $2",
                &[&values.obj_id, &OBJ_CLUSTER],
            )
            .await
            .context("failed to count cluster events")?
            .get(0);

        if count >= max_events_per_cluster {
            // Purge enough to get back under the cap; at least one slot must
            // open up for the insert below.
            let excess = count - max_events_per_cluster + 1;
            let batch = purge_batch_size.max(excess);
            tx.execute(
                r#"
                DELETE FROM events WHERE id IN (
                    SELECT id FROM events
                    WHERE obj_id = $1 AND obj_type = $2
                    ORDER BY timestamp ASC, id ASC
                    LIMIT $3
                )
                "#,
                &[&values.obj_id, &OBJ_CLUSTER, &batch],
            )
            .await
            .context("failed to purge old events")?;
        }
    }

    let row = tx
        .query_one(
            &format!(
                r#"
                INSERT INTO events (id, obj_id, obj_type, level, payload)
                VALUES ($1, $2, $3, $4, $5)
                RETURNING {EVENT_COLS}
                "#
            ),
            &[
                &Uuid::new_v4(),
                &values.obj_id,
                &values.obj_type,
                &values.level,
                &values.payload,
            ],
        )
        .await
        .context("failed to insert event")?;

    tx.commit().await.context("failed to commit transaction")?;
    Ok(Event::from_row(&row))
}

pub async fn event_get(pool: &Pool, id: Uuid) -> Result<Event> {
    let client = pool.get().await.context("failed to get db connection")?;

    let row = client
        .query_opt(
            &format!("SELECT {EVENT_COLS} FROM events WHERE id = $1"),
            &[&id],
        )
        .await
        .context("failed to query event")?;

    row.map(|r| Event::from_row(&r))
        .ok_or_else(|| Error::not_found("event", id))
}

/// Newest first; `marker` resumes after the named row, `id` breaks timestamp
/// ties.
pub async fn event_get_all_by_cluster(
    pool: &Pool,
    cluster_id: Uuid,
    limit: Option<i64>,
    marker: Option<Uuid>,
) -> Result<Vec<Event>> {
    let client = pool.get().await.context("failed to get db connection")?;

    let mut sql = format!(
        "SELECT {EVENT_COLS} FROM events WHERE obj_id = $1 AND obj_type = $2"
    );
    let mut params: Vec<&(dyn tokio_postgres::types::ToSql + Sync)> =
        vec![&cluster_id, &OBJ_CLUSTER];
    let mut idx = 3;

    if let Some(ref marker) = marker {
        sql.push_str(&format!(
            " AND (timestamp, id) < (SELECT timestamp, id FROM events WHERE id = ${idx})"
        ));
        params.push(marker);
        idx += 1;
    }
    sql.push_str(" ORDER BY timestamp DESC, id DESC");
    if let Some(ref limit) = limit {
        sql.push_str(&format!(" LIMIT ${idx}"));
        params.push(limit);
    }

    let rows = client
        .query(&sql, &params)
        .await
        .context("failed to list cluster events")?;

    Ok(rows.iter().map(Event::from_row).collect())
}

pub async fn event_count_by_cluster(pool: &Pool, cluster_id: Uuid) -> Result<i64> {
    let client = pool.get().await.context("failed to get db connection")?;

    let row = client
        .query_one(
            "SELECT COUNT(*) FROM events WHERE obj_id = $1 AND obj_type = $2",
            &[&cluster_id, &OBJ_CLUSTER],
        )
        .await
        .context("failed to count cluster events")?;

    Ok(row.get(0))
}
