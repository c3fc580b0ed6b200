use anyhow::Context;
use deadpool_postgres::Pool;
use drover_common::error::Result;
use uuid::Uuid;

/// Outcome of a steal attempt, mirroring what the caller must do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StealResult {
    /// The row was rewritten to the caller; it now owns the lock.
    Stolen,
    /// The row vanished before the steal; the lock is free for a retry.
    Released,
    /// Someone else rewrote the row first; they own it now.
    Owner(Uuid),
}

/// Insert a lock row for `target_id` owned by `worker_id`. Returns `None`
/// on success, or the current holder when the target is already locked.
/// Never blocks on a held lock.
async fn lock_create(
    pool: &Pool,
    table: &str,
    key_col: &str,
    target_id: Uuid,
    worker_id: Uuid,
) -> Result<Option<Uuid>> {
    let mut client = pool.get().await.context("failed to get db connection")?;

    // Two rounds cover the race where the holder releases between our
    // failed insert and the holder lookup.
    for _ in 0..2 {
        let tx = client
            .transaction()
            .await
            .context("failed to start transaction")?;
        let inserted = tx
            .execute(
                &format!(
                    "INSERT INTO {table} ({key_col}, worker_id) VALUES ($1, $2) \
                     ON CONFLICT ({key_col}) DO NOTHING"
                ),
                &[&target_id, &worker_id],
            )
            .await
            .context("failed to insert lock row")?;
        if inserted == 1 {
            tx.commit().await.context("failed to commit transaction")?;
            return Ok(None);
        }
        let row = tx
            .query_opt(
                &format!("SELECT worker_id FROM {table} WHERE {key_col} = $1"),
                &[&target_id],
            )
            .await
            .context("failed to read lock holder")?;
        tx.commit().await.context("failed to commit transaction")?;
        if let Some(row) = row {
            return Ok(Some(row.get(0)));
        }
        // Holder released in the window; take another swing.
    }
    Err(anyhow::anyhow!("lock row for {target_id} kept vanishing during acquire").into())
}

/// Rewrite the lock row from `old_worker` to `new_worker`. The row is read
/// under `FOR UPDATE` so exactly one of the possible outcomes is observed.
async fn lock_steal(
    pool: &Pool,
    table: &str,
    key_col: &str,
    target_id: Uuid,
    old_worker: Uuid,
    new_worker: Uuid,
) -> Result<StealResult> {
    let mut client = pool.get().await.context("failed to get db connection")?;

    let tx = client
        .transaction()
        .await
        .context("failed to start transaction")?;

    let row = tx
        .query_opt(
            &format!("SELECT worker_id FROM {table} WHERE {key_col} = $1 FOR UPDATE"),
            &[&target_id],
        )
        .await
        .context("failed to read lock row")?;

    let result = match row {
        None => StealResult::Released,
        Some(row) => {
            let holder: Uuid = row.get(0);
            if holder == old_worker {
                let affected = tx
                    .execute(
                        &format!(
                            "UPDATE {table} SET worker_id = $1 \
                             WHERE {key_col} = $2 AND worker_id = $3"
                        ),
                        &[&new_worker, &target_id, &old_worker],
                    )
                    .await
                    .context("failed to rewrite lock row")?;
                if affected != 1 {
                    return Err(
                        anyhow::anyhow!("lock row changed under FOR UPDATE during steal").into()
                    );
                }
                StealResult::Stolen
            } else {
                StealResult::Owner(holder)
            }
        }
    };

    tx.commit().await.context("failed to commit transaction")?;
    Ok(result)
}

/// Delete the lock row if the caller still owns it. Returns whether a row
/// was actually removed; `false` means a double release.
async fn lock_release(
    pool: &Pool,
    table: &str,
    key_col: &str,
    target_id: Uuid,
    worker_id: Uuid,
) -> Result<bool> {
    let client = pool.get().await.context("failed to get db connection")?;

    let affected = client
        .execute(
            &format!("DELETE FROM {table} WHERE {key_col} = $1 AND worker_id = $2"),
            &[&target_id, &worker_id],
        )
        .await
        .context("failed to delete lock row")?;

    Ok(affected > 0)
}

pub async fn cluster_lock_create(
    pool: &Pool,
    cluster_id: Uuid,
    worker_id: Uuid,
) -> Result<Option<Uuid>> {
    lock_create(pool, "cluster_locks", "cluster_id", cluster_id, worker_id).await
}

pub async fn cluster_lock_steal(
    pool: &Pool,
    cluster_id: Uuid,
    old_worker: Uuid,
    new_worker: Uuid,
) -> Result<StealResult> {
    lock_steal(
        pool,
        "cluster_locks",
        "cluster_id",
        cluster_id,
        old_worker,
        new_worker,
    )
    .await
}

pub async fn cluster_lock_release(pool: &Pool, cluster_id: Uuid, worker_id: Uuid) -> Result<bool> {
    lock_release(pool, "cluster_locks", "cluster_id", cluster_id, worker_id).await
}

pub async fn node_lock_create(pool: &Pool, node_id: Uuid, worker_id: Uuid) -> Result<Option<Uuid>> {
    lock_create(pool, "node_locks", "node_id", node_id, worker_id).await
}

pub async fn node_lock_steal(
    pool: &Pool,
    node_id: Uuid,
    old_worker: Uuid,
    new_worker: Uuid,
) -> Result<StealResult> {
    lock_steal(pool, "node_locks", "node_id", node_id, old_worker, new_worker).await
}

pub async fn node_lock_release(pool: &Pool, node_id: Uuid, worker_id: Uuid) -> Result<bool> {
    lock_release(pool, "node_locks", "node_id", node_id, worker_id).await
}
