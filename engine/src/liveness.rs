use std::time::Duration;

use anyhow::{Context, Result, bail};
use deadpool_redis::Pool;
use redis::AsyncCommands;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Heartbeat keys expire on their own, so a SIGKILLed engine reads as dead
/// after at most the TTL. Refresh runs at a third of that to ride out a
/// dropped write or two.
const HEARTBEAT_TTL_SECS: u64 = 15;
const HEARTBEAT_REFRESH_SECS: u64 = 5;

fn engine_key(engine_id: Uuid) -> String {
    format!("drover:engine:{engine_id}")
}

/// Keep this engine's liveness key fresh until cancelled. On a graceful
/// exit the key is dropped immediately so peers don't wait out the TTL.
pub async fn run_heartbeat(cancel: CancellationToken, redis: Pool, engine_id: Uuid) -> Result<()> {
    let key = engine_key(engine_id);
    loop {
        {
            let mut conn = redis
                .get()
                .await
                .context("failed to get Redis connection for heartbeat")?;
            conn.set_ex::<_, _, ()>(&key, 1u8, HEARTBEAT_TTL_SECS)
                .await
                .context("failed to refresh heartbeat key")?;
        }
        tokio::select! {
            _ = cancel.cancelled() => {
                if let Ok(mut conn) = redis.get().await {
                    let _: std::result::Result<(), _> = conn.del(&key).await;
                }
                bail!("Context cancelled");
            }
            _ = tokio::time::sleep(Duration::from_secs(HEARTBEAT_REFRESH_SECS)) => {}
        }
    }
}

/// Is `engine_id` serving right now? Bounded by `timeout`; a slow or
/// unreachable probe counts as dead, which is exactly what lock stealing
/// wants.
pub async fn listening(redis: &Pool, engine_id: Uuid, timeout: Duration) -> bool {
    let key = engine_key(engine_id);
    let probe = async {
        let mut conn = redis.get().await.ok()?;
        conn.exists::<_, bool>(&key).await.ok()
    };
    match tokio::time::timeout(timeout, probe).await {
        Ok(Some(alive)) => alive,
        Ok(None) => false,
        Err(_) => {
            tracing::warn!(engine = %engine_id, "liveness probe timed out");
            false
        }
    }
}
