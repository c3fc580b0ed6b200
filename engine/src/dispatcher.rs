use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use bytes::Bytes;
use deadpool_postgres::Pool;
use drover_common::error::Error;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::args::EngineArgs;
use crate::db::actions::{self, REASON_STOLEN, REASON_TIMEOUT};
use crate::db::events::{self, NewEvent, OBJ_CLUSTER, OBJ_NODE};
use crate::db::truncate_reason;
use crate::handlers::{self, HandlerCtx, HandlerOutcome};
use crate::lock::{Acquired, Lock};
use crate::metrics;
use crate::models::{Action, TargetType};
use crate::registry::publish_ready;
use uuid::Uuid;

/// Shared coordinates for one engine's worker pool.
#[derive(Clone)]
pub struct Dispatcher {
    pub pool: Pool,
    pub redis: deadpool_redis::Pool,
    pub engine_id: Uuid,
    pub args: EngineArgs,
}

/// Run `num_engine_workers` workers until cancelled. A Redis subscription
/// on the ready topic turns idle sleeps into prompt wakeups; the periodic
/// scan stays authoritative.
pub async fn run_dispatcher(cancel: CancellationToken, d: Dispatcher) -> Result<()> {
    let (wakeup_tx, _) = broadcast::channel::<Bytes>(64);

    {
        let cancel = cancel.clone();
        let redis_args = d.args.redis.clone();
        let wakeup_tx = wakeup_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = drover_common::redis::listen_topic(
                cancel,
                redis_args,
                wakeup_tx,
                drover_common::READY_TOPIC,
            )
            .await
            {
                tracing::warn!(error = ?e, "ready topic listener stopped");
            }
        });
    }

    let workers = d.args.num_engine_workers.max(1);
    tracing::info!(
        engine = %d.engine_id,
        workers,
        "starting dispatcher"
    );

    let busy = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::with_capacity(workers);
    for worker in 0..workers {
        let cancel = cancel.clone();
        let d = d.clone();
        let wakeup = wakeup_tx.subscribe();
        let busy = busy.clone();
        handles.push(tokio::spawn(worker_loop(cancel, d, wakeup, busy, worker)));
    }

    for handle in handles {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::info!(error = %e, "worker exited"),
            Err(e) => tracing::error!(error = ?e, "worker panicked"),
        }
    }
    Ok(())
}

async fn worker_loop(
    cancel: CancellationToken,
    d: Dispatcher,
    mut wakeup: broadcast::Receiver<Bytes>,
    busy: Arc<AtomicUsize>,
    worker: usize,
) -> Result<()> {
    let poll_interval = Duration::from_secs(d.args.periodic_interval);
    let mut error_streak = 0usize;

    loop {
        if cancel.is_cancelled() {
            bail!("Context cancelled");
        }

        let next = actions::action_get_first_ready(&d.pool, d.args.error_wait_time as f64).await;

        match next {
            Err(e) => {
                tracing::warn!(worker, error = %e, "ready scan failed");
                error_streak += 1;
                drover_common::wait::wait(&cancel, error_streak).await?;
            }
            Ok(None) => {
                error_streak = 0;
                tokio::select! {
                    _ = cancel.cancelled() => bail!("Context cancelled"),
                    _ = tokio::time::sleep(poll_interval) => {}
                    msg = wakeup.recv() => {
                        // Lagged receivers just rescan; nothing is lost.
                        if msg.is_err() {
                            tokio::time::sleep(Duration::from_millis(50)).await;
                        }
                    }
                }
            }
            Ok(Some(action)) => {
                error_streak = 0;
                metrics::workers_busy(busy.fetch_add(1, Ordering::Relaxed) + 1);
                let result = run_one(&cancel, &d, action).await;
                metrics::workers_busy(busy.fetch_sub(1, Ordering::Relaxed) - 1);
                if let Err(e) = result {
                    tracing::warn!(worker, error = %e, "action execution errored");
                    drover_common::wait::wait(&cancel, 1).await?;
                }
            }
        }
    }
}

fn obj_type_for(target_type: TargetType) -> &'static str {
    match target_type {
        TargetType::Cluster => OBJ_CLUSTER,
        TargetType::Node => OBJ_NODE,
    }
}

async fn record_event(d: &Dispatcher, action: &Action, level: &'static str, what: &str) {
    let payload = serde_json::json!({
        "action": action.id,
        "verb": action.verb.as_str(),
        "status": what,
        "engine": d.engine_id,
    });
    if let Err(e) = events::event_create(
        &d.pool,
        NewEvent {
            obj_id: action.target_id,
            obj_type: obj_type_for(action.target_type),
            level,
            payload: Some(payload),
        },
        d.args.max_events_per_cluster,
        d.args.event_purge_batch_size,
    )
    .await
    {
        tracing::warn!(action = %action.id, error = %e, "failed to record event");
    }
}

/// Take one READY action through lock, claim, execution and finalization.
///
/// Failing to get the lock is not an error: the action stays READY for
/// whichever engine can lock the target later.
async fn run_one(cancel: &CancellationToken, d: &Dispatcher, action: Action) -> Result<()> {
    let lock = Lock::new(
        d.pool.clone(),
        d.redis.clone(),
        action.target_type,
        action.target_id,
        d.engine_id,
        Duration::from_secs(d.args.engine_life_check_timeout),
    );

    let acquired = match lock.acquire(true).await {
        Ok(acquired) => acquired,
        Err(Error::ActionInProgress { .. }) => {
            metrics::lock_contended(action.target_type.as_str());
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    // A stolen lock means a dead engine abandoned work on this target.
    // Finalize it before ours starts so the dependency graph moves on.
    if let Acquired::Stolen { from } = acquired {
        let abandoned = actions::action_get_running_on_target(&d.pool, action.target_id, from)
            .await?;
        for stale in abandoned {
            tracing::info!(
                action = %stale.id,
                dead_engine = %from,
                "failing action abandoned by dead engine"
            );
            actions::action_mark_failed(&d.pool, stale.id, REASON_STOLEN)
                .await?;
            record_event(d, &stale, "ERROR", "FAILED").await;
        }
    }

    let action = match actions::action_start_work_on(&d.pool, action.id, d.engine_id).await {
        Ok(action) => action,
        Err(Error::Conflict(_)) => {
            // Another worker claimed it between our scan and our lock.
            lock.release().await?;
            return Ok(());
        }
        Err(e) => {
            lock.release().await.ok();
            return Err(e.into());
        }
    };

    metrics::action_claimed(action.verb.as_str());
    record_event(d, &action, "INFO", "RUNNING").await;
    tracing::info!(
        action = %action.id,
        verb = action.verb.as_str(),
        target = %action.target_id,
        engine = %d.engine_id,
        "action started"
    );

    let handler = handlers::builtin(action.verb);
    let ctx = HandlerCtx {
        pool: d.pool.clone(),
        redis: d.redis.clone(),
        engine_id: d.engine_id,
        life_check_timeout: Duration::from_secs(d.args.engine_life_check_timeout),
    };
    let started = Instant::now();
    let deadline = Duration::from_secs(d.args.default_action_timeout);

    let outcome = tokio::select! {
        res = handler.execute(&ctx, &action) => match res {
            Ok(outcome) => outcome,
            Err(e) => HandlerOutcome::Failed(e.to_string()),
        },
        _ = tokio::time::sleep(deadline) => HandlerOutcome::Failed(REASON_TIMEOUT.to_string()),
        _ = cancel.cancelled() => {
            // Shutdown mid-action: leave it RUNNING under our lock. Our
            // heartbeat lapses and a peer steals and finalizes it.
            bail!("Context cancelled during action execution");
        }
    };
    metrics::action_duration(action.verb.as_str(), started.elapsed().as_secs_f64());

    // If a peer decided we were dead and stole the target, it also
    // finalized this action; the thief's verdict wins.
    let owner = actions::action_lock_check(&d.pool, action.id).await?;
    let current = actions::action_get(&d.pool, action.id).await?;
    if owner != Some(d.engine_id) || current.status.is_terminal() {
        tracing::warn!(
            action = %action.id,
            engine = %d.engine_id,
            "action was preempted while executing, skipping finalization"
        );
        return Ok(());
    }

    match outcome {
        HandlerOutcome::Succeeded => {
            let promoted = actions::action_mark_succeeded(&d.pool, action.id)
                .await?;
            metrics::action_finished(action.verb.as_str(), "succeeded");
            record_event(d, &action, "INFO", "SUCCEEDED").await;
            tracing::info!(action = %action.id, "action succeeded");
            if !promoted.is_empty() {
                publish_ready(&d.redis, &promoted).await;
            }
        }
        HandlerOutcome::Failed(reason) => {
            let reason = truncate_reason(&reason);
            actions::action_mark_failed(&d.pool, action.id, &reason)
                .await?;
            metrics::action_finished(action.verb.as_str(), "failed");
            record_event(d, &action, "ERROR", "FAILED").await;
            tracing::warn!(action = %action.id, reason = %reason, "action failed");
        }
        HandlerOutcome::Cancelled => {
            actions::action_mark_cancelled(&d.pool, action.id, "Cancelled on control signal.")
                .await?;
            metrics::action_finished(action.verb.as_str(), "cancelled");
            record_event(d, &action, "WARN", "CANCELLED").await;
            tracing::info!(action = %action.id, "action cancelled");
        }
    }

    lock.release()
        .await
        .context("failed to release target lock")?;
    Ok(())
}
