use std::future::Future;
use std::time::Duration;

use deadpool_postgres::Pool;
use drover_common::error::{Error, Result};
use uuid::Uuid;

use crate::db::locks::{self, StealResult};
use crate::liveness;
use crate::models::TargetType;

/// How an acquire ended up holding the lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquired {
    /// A fresh lock row was inserted.
    Fresh,
    /// The row was stolen from an engine that stopped answering its
    /// liveness probe. The caller must finalize that engine's abandoned
    /// work on this target before starting its own.
    Stolen { from: Uuid },
}

/// Result of a non-raising scoped lock attempt.
pub enum TryLocked<T> {
    Held(T),
    /// Somebody else holds the lock; here is who.
    Busy(Uuid),
}

/// Exclusive mutation rights on one cluster or node, keyed by the owning
/// engine. All state lives in the lock tables; this type only carries the
/// coordinates.
pub struct Lock {
    pool: Pool,
    redis: deadpool_redis::Pool,
    target_type: TargetType,
    target_id: Uuid,
    engine_id: Uuid,
    life_check_timeout: Duration,
}

impl Lock {
    pub fn new(
        pool: Pool,
        redis: deadpool_redis::Pool,
        target_type: TargetType,
        target_id: Uuid,
        engine_id: Uuid,
        life_check_timeout: Duration,
    ) -> Self {
        Self {
            pool,
            redis,
            target_type,
            target_id,
            engine_id,
            life_check_timeout,
        }
    }

    pub fn target_id(&self) -> Uuid {
        self.target_id
    }

    /// One-shot attempt. `None` means the lock is now held by this engine;
    /// otherwise the current holder is returned. Never probes liveness,
    /// never steals, never blocks.
    pub async fn try_acquire(&self) -> Result<Option<Uuid>> {
        match self.target_type {
            TargetType::Cluster => {
                locks::cluster_lock_create(&self.pool, self.target_id, self.engine_id).await
            }
            TargetType::Node => {
                locks::node_lock_create(&self.pool, self.target_id, self.engine_id).await
            }
        }
    }

    async fn steal(&self, holder: Uuid) -> Result<StealResult> {
        match self.target_type {
            TargetType::Cluster => {
                locks::cluster_lock_steal(&self.pool, self.target_id, holder, self.engine_id).await
            }
            TargetType::Node => {
                locks::node_lock_steal(&self.pool, self.target_id, holder, self.engine_id).await
            }
        }
    }

    fn in_progress(&self, holder: Uuid) -> Error {
        Error::ActionInProgress {
            target_type: self.target_type.as_str(),
            target: self.target_id,
            current: format!("locked by engine {holder}"),
        }
    }

    /// Acquire the lock, stealing it from a dead peer if need be.
    ///
    /// A lock held by a live engine (or by ourselves) is contention and
    /// fails with `ActionInProgress`. A holder that flunks the liveness
    /// probe gets its lock rewritten to us; if the row is released mid
    /// steal we retry the whole dance once.
    pub async fn acquire(&self, retry: bool) -> Result<Acquired> {
        let mut retry = retry;
        loop {
            let Some(holder) = self.try_acquire().await? else {
                tracing::debug!(
                    engine = %self.engine_id,
                    target_type = self.target_type.as_str(),
                    target = %self.target_id,
                    "acquired lock"
                );
                return Ok(Acquired::Fresh);
            };

            if holder == self.engine_id
                || liveness::listening(&self.redis, holder, self.life_check_timeout).await
            {
                tracing::debug!(
                    target_type = self.target_type.as_str(),
                    target = %self.target_id,
                    holder = %holder,
                    "lock is held by a live engine"
                );
                return Err(self.in_progress(holder));
            }

            tracing::info!(
                target_type = self.target_type.as_str(),
                target = %self.target_id,
                holder = %holder,
                engine = %self.engine_id,
                "stale lock detected, attempting steal"
            );
            crate::metrics::lock_steal_attempted(self.target_type.as_str());

            match self.steal(holder).await? {
                StealResult::Stolen => {
                    tracing::info!(
                        target_type = self.target_type.as_str(),
                        target = %self.target_id,
                        engine = %self.engine_id,
                        "lock stolen"
                    );
                    crate::metrics::lock_stolen(self.target_type.as_str());
                    return Ok(Acquired::Stolen { from: holder });
                }
                StealResult::Released => {
                    if retry {
                        retry = false;
                        continue;
                    }
                    return Err(self.in_progress(holder));
                }
                StealResult::Owner(new_holder) => {
                    tracing::info!(
                        target_type = self.target_type.as_str(),
                        target = %self.target_id,
                        holder = %new_holder,
                        "another engine stole the lock first"
                    );
                    return Err(self.in_progress(new_holder));
                }
            }
        }
    }

    /// Release the lock. A release that finds no row owned by this engine
    /// is logged, not raised: it usually means a peer stole the lock while
    /// we were dying.
    pub async fn release(&self) -> Result<()> {
        let released = match self.target_type {
            TargetType::Cluster => {
                locks::cluster_lock_release(&self.pool, self.target_id, self.engine_id).await?
            }
            TargetType::Node => {
                locks::node_lock_release(&self.pool, self.target_id, self.engine_id).await?
            }
        };
        if !released {
            tracing::warn!(
                target_type = self.target_type.as_str(),
                target = %self.target_id,
                engine = %self.engine_id,
                "lock was already released"
            );
        }
        Ok(())
    }

    /// Run `f` with the lock held. On any error inside `f` the lock is
    /// released before the error propagates; on success the lock stays
    /// held, because the caller schedules release at task completion.
    pub async fn thread_lock<T, F, Fut>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.acquire(true).await?;
        match f().await {
            Ok(v) => Ok(v),
            Err(e) => {
                if let Err(release_err) = self.release().await {
                    tracing::warn!(error = ?release_err, "failed to release lock after error");
                }
                Err(e)
            }
        }
    }

    /// Like [`Lock::thread_lock`] but contention is a value, not an error:
    /// the holder id is handed back instead. Errors inside `f` still
    /// release the lock.
    pub async fn try_thread_lock<T, F, Fut>(&self, f: F) -> Result<TryLocked<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if let Some(holder) = self.try_acquire().await? {
            return Ok(TryLocked::Busy(holder));
        }
        match f().await {
            Ok(v) => Ok(TryLocked::Held(v)),
            Err(e) => {
                if let Err(release_err) = self.release().await {
                    tracing::warn!(error = ?release_err, "failed to release lock after error");
                }
                Err(e)
            }
        }
    }
}
