use async_trait::async_trait;
use deadpool_postgres::Pool;
use drover_common::error::{Error, Result};
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

use crate::db::actions;
use crate::db::clusters::{self, ClusterUpdate};
use crate::db::nodes::{self, NewNode, NodeUpdate};
use crate::db::policies::{self, PolicyBinding};
use crate::lock::{Lock, TryLocked};
use crate::models::{Action, ActionVerb, Cluster, ControlSignal, TargetType, status};

/// How a handler run ended. Errors bubbling out of `execute` are folded
/// into `Failed` by the dispatcher, message truncated for `status_reason`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    Succeeded,
    Failed(String),
    Cancelled,
}

/// Verdict of a control poll: either keep going or unwind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    Continue,
    Cancel,
}

/// Everything a handler may touch. Handlers share no memory with each
/// other; the store is the only channel between them.
pub struct HandlerCtx {
    pub pool: Pool,
    pub redis: deadpool_redis::Pool,
    pub engine_id: Uuid,
    pub life_check_timeout: Duration,
}

const SUSPEND_POLL: Duration = Duration::from_secs(1);

impl HandlerCtx {
    /// Child lock for one member node. Cluster-wide handlers already hold
    /// the cluster lock; individual members still get their own.
    pub fn node_lock(&self, node_id: Uuid) -> Lock {
        Lock::new(
            self.pool.clone(),
            self.redis.clone(),
            TargetType::Node,
            node_id,
            self.engine_id,
            self.life_check_timeout,
        )
    }

    pub async fn control_check(&self, action_id: Uuid) -> Result<Option<ControlSignal>> {
        actions::action_control_check(&self.pool, action_id).await
    }

    /// Cooperative poll point. Honors CANCEL immediately; parks while the
    /// action is SUSPENDed; clears a RESUME marker and keeps going.
    pub async fn gate(&self, action_id: Uuid) -> Result<Gate> {
        loop {
            match self.control_check(action_id).await? {
                Some(ControlSignal::Cancel) => return Ok(Gate::Cancel),
                Some(ControlSignal::Suspend) => {
                    tokio::time::sleep(SUSPEND_POLL).await;
                }
                Some(ControlSignal::Resume) => {
                    actions::action_control(&self.pool, action_id, None).await?;
                    return Ok(Gate::Continue);
                }
                None => return Ok(Gate::Continue),
            }
        }
    }
}

#[async_trait]
pub trait Handler: Send + Sync {
    async fn execute(&self, ctx: &HandlerCtx, action: &Action) -> Result<HandlerOutcome>;
}

/// Built-in handler for an action verb. Concrete resource drivers plug in
/// at this seam; the built-ins only mutate the store.
pub fn builtin(verb: ActionVerb) -> &'static dyn Handler {
    match verb {
        ActionVerb::ClusterCreate => &ClusterCreateHandler,
        ActionVerb::ClusterUpdate => &ClusterUpdateHandler,
        ActionVerb::ClusterDelete => &ClusterDeleteHandler,
        ActionVerb::ClusterScale => &ClusterScaleHandler,
        ActionVerb::ClusterSuspend => &ClusterSuspendHandler,
        ActionVerb::ClusterResume => &ClusterResumeHandler,
        ActionVerb::ClusterAttachPolicy => &ClusterAttachPolicyHandler,
        ActionVerb::ClusterDetachPolicy => &ClusterDetachPolicyHandler,
        ActionVerb::NodeCreate => &NodeCreateHandler,
        ActionVerb::NodeUpdate => &NodeUpdateHandler,
        ActionVerb::NodeDelete => &NodeDeleteHandler,
        ActionVerb::NodeJoinCluster => &NodeJoinClusterHandler,
        ActionVerb::NodeLeaveCluster => &NodeLeaveClusterHandler,
    }
}

async fn load_cluster(pool: &Pool, id: Uuid) -> Result<Cluster> {
    clusters::cluster_get_unscoped(pool, id)
        .await?
        .ok_or_else(|| Error::not_found("cluster", id))
}

fn opt_str(inputs: &Value, key: &str) -> Option<String> {
    inputs.get(key).and_then(Value::as_str).map(String::from)
}

fn opt_i64(inputs: &Value, key: &str) -> Option<i64> {
    inputs.get(key).and_then(Value::as_i64)
}

fn opt_uuid(inputs: &Value, key: &str) -> Option<Uuid> {
    inputs
        .get(key)
        .and_then(Value::as_str)
        .and_then(|s| s.parse().ok())
}

struct ClusterCreateHandler;

#[async_trait]
impl Handler for ClusterCreateHandler {
    async fn execute(&self, ctx: &HandlerCtx, action: &Action) -> Result<HandlerOutcome> {
        let cluster = load_cluster(&ctx.pool, action.target_id).await?;
        let desired = opt_i64(&action.inputs, "size").unwrap_or(0);

        for i in 0..desired {
            if ctx.gate(action.id).await? == Gate::Cancel {
                clusters::cluster_update(
                    &ctx.pool,
                    cluster.id,
                    ClusterUpdate {
                        status: Some(status::ERROR.to_string()),
                        status_reason: Some("Creation cancelled.".to_string()),
                        ..Default::default()
                    },
                )
                .await?;
                return Ok(HandlerOutcome::Cancelled);
            }

            let node = nodes::node_create(
                &ctx.pool,
                NewNode {
                    id: Uuid::new_v4(),
                    name: format!("{}-{}", cluster.name, i),
                    cluster_id: None,
                    physical_id: None,
                    profile_id: cluster.profile_id,
                    status: status::ACTIVE.to_string(),
                    status_reason: None,
                },
            )
            .await?;
            nodes::node_migrate(&ctx.pool, node.id, None, Some(cluster.id)).await?;
        }

        clusters::cluster_update(
            &ctx.pool,
            cluster.id,
            ClusterUpdate {
                status: Some(status::ACTIVE.to_string()),
                status_reason: Some("Cluster created.".to_string()),
                ..Default::default()
            },
        )
        .await?;
        Ok(HandlerOutcome::Succeeded)
    }
}

struct ClusterUpdateHandler;

#[async_trait]
impl Handler for ClusterUpdateHandler {
    async fn execute(&self, ctx: &HandlerCtx, action: &Action) -> Result<HandlerOutcome> {
        if ctx.gate(action.id).await? == Gate::Cancel {
            return Ok(HandlerOutcome::Cancelled);
        }
        load_cluster(&ctx.pool, action.target_id).await?;
        clusters::cluster_update(
            &ctx.pool,
            action.target_id,
            ClusterUpdate {
                name: opt_str(&action.inputs, "name"),
                status: Some(status::ACTIVE.to_string()),
                status_reason: Some("Cluster updated.".to_string()),
                ..Default::default()
            },
        )
        .await?;
        Ok(HandlerOutcome::Succeeded)
    }
}

struct ClusterDeleteHandler;

#[async_trait]
impl Handler for ClusterDeleteHandler {
    async fn execute(&self, ctx: &HandlerCtx, action: &Action) -> Result<HandlerOutcome> {
        if ctx.gate(action.id).await? == Gate::Cancel {
            return Ok(HandlerOutcome::Cancelled);
        }
        clusters::cluster_update(
            &ctx.pool,
            action.target_id,
            ClusterUpdate {
                status: Some(status::DELETING.to_string()),
                status_reason: Some("Deletion in progress.".to_string()),
                ..Default::default()
            },
        )
        .await?;
        clusters::cluster_delete(&ctx.pool, action.target_id).await?;
        Ok(HandlerOutcome::Succeeded)
    }
}

struct ClusterScaleHandler;

#[async_trait]
impl Handler for ClusterScaleHandler {
    async fn execute(&self, ctx: &HandlerCtx, action: &Action) -> Result<HandlerOutcome> {
        let cluster = load_cluster(&ctx.pool, action.target_id).await?;
        let Some(desired) = opt_i64(&action.inputs, "size") else {
            return Ok(HandlerOutcome::Failed("missing input: size".to_string()));
        };

        let members = nodes::node_get_all_by_cluster(&ctx.pool, cluster.id).await?;
        let current = members.len() as i64;

        if desired > current {
            for i in current..desired {
                if ctx.gate(action.id).await? == Gate::Cancel {
                    return Ok(HandlerOutcome::Cancelled);
                }
                let node = nodes::node_create(
                    &ctx.pool,
                    NewNode {
                        id: Uuid::new_v4(),
                        name: format!("{}-{}", cluster.name, i),
                        cluster_id: None,
                        physical_id: None,
                        profile_id: cluster.profile_id,
                        status: status::ACTIVE.to_string(),
                        status_reason: None,
                    },
                )
                .await?;
                nodes::node_migrate(&ctx.pool, node.id, None, Some(cluster.id)).await?;
            }
        } else {
            // Shrink from the tail: newest members go first. Each victim is
            // removed under its own node lock.
            for node in members.iter().rev().take((current - desired) as usize) {
                if ctx.gate(action.id).await? == Gate::Cancel {
                    return Ok(HandlerOutcome::Cancelled);
                }
                let lock = ctx.node_lock(node.id);
                match lock
                    .try_thread_lock(|| async { nodes::node_delete(&ctx.pool, node.id).await })
                    .await?
                {
                    TryLocked::Held(()) => lock.release().await?,
                    TryLocked::Busy(holder) => {
                        return Ok(HandlerOutcome::Failed(format!(
                            "node {} is locked by engine {holder}",
                            node.id
                        )));
                    }
                }
            }
        }

        clusters::cluster_update(
            &ctx.pool,
            cluster.id,
            ClusterUpdate {
                status: Some(status::ACTIVE.to_string()),
                status_reason: Some(format!("Scaled to {desired} member(s).")),
                ..Default::default()
            },
        )
        .await?;
        Ok(HandlerOutcome::Succeeded)
    }
}

async fn set_cluster_and_members_status(
    ctx: &HandlerCtx,
    action: &Action,
    node_status: &str,
    cluster_status: &str,
    reason: &str,
) -> Result<HandlerOutcome> {
    let cluster = load_cluster(&ctx.pool, action.target_id).await?;
    for node in nodes::node_get_all_by_cluster(&ctx.pool, cluster.id).await? {
        if ctx.gate(action.id).await? == Gate::Cancel {
            return Ok(HandlerOutcome::Cancelled);
        }
        let lock = ctx.node_lock(node.id);
        let outcome = lock
            .try_thread_lock(|| async {
                nodes::node_update(
                    &ctx.pool,
                    node.id,
                    NodeUpdate {
                        status: Some(node_status.to_string()),
                        ..Default::default()
                    },
                )
                .await
            })
            .await?;
        match outcome {
            TryLocked::Held(_) => lock.release().await?,
            TryLocked::Busy(holder) => {
                return Ok(HandlerOutcome::Failed(format!(
                    "node {} is locked by engine {holder}",
                    node.id
                )));
            }
        }
    }
    clusters::cluster_update(
        &ctx.pool,
        cluster.id,
        ClusterUpdate {
            status: Some(cluster_status.to_string()),
            status_reason: Some(reason.to_string()),
            ..Default::default()
        },
    )
    .await?;
    Ok(HandlerOutcome::Succeeded)
}

struct ClusterSuspendHandler;

#[async_trait]
impl Handler for ClusterSuspendHandler {
    async fn execute(&self, ctx: &HandlerCtx, action: &Action) -> Result<HandlerOutcome> {
        set_cluster_and_members_status(
            ctx,
            action,
            status::SUSPENDED,
            status::SUSPENDED,
            "Cluster suspended.",
        )
        .await
    }
}

struct ClusterResumeHandler;

#[async_trait]
impl Handler for ClusterResumeHandler {
    async fn execute(&self, ctx: &HandlerCtx, action: &Action) -> Result<HandlerOutcome> {
        set_cluster_and_members_status(
            ctx,
            action,
            status::ACTIVE,
            status::ACTIVE,
            "Cluster resumed.",
        )
        .await
    }
}

struct ClusterAttachPolicyHandler;

#[async_trait]
impl Handler for ClusterAttachPolicyHandler {
    async fn execute(&self, ctx: &HandlerCtx, action: &Action) -> Result<HandlerOutcome> {
        if ctx.gate(action.id).await? == Gate::Cancel {
            return Ok(HandlerOutcome::Cancelled);
        }
        let Some(policy_id) = opt_uuid(&action.inputs, "policy_id") else {
            return Ok(HandlerOutcome::Failed("missing input: policy_id".to_string()));
        };
        let binding = PolicyBinding {
            enabled: action
                .inputs
                .get("enabled")
                .and_then(Value::as_bool)
                .unwrap_or(true),
            priority: opt_i64(&action.inputs, "priority").unwrap_or(50) as i32,
            cooldown: opt_i64(&action.inputs, "cooldown").unwrap_or(0) as i32,
            level: opt_i64(&action.inputs, "level").unwrap_or(0) as i32,
        };
        match policies::cluster_attach_policy(&ctx.pool, action.target_id, policy_id, binding).await
        {
            Ok(_) => Ok(HandlerOutcome::Succeeded),
            Err(Error::Conflict(msg)) => Ok(HandlerOutcome::Failed(msg)),
            Err(e) => Err(e),
        }
    }
}

struct ClusterDetachPolicyHandler;

#[async_trait]
impl Handler for ClusterDetachPolicyHandler {
    async fn execute(&self, ctx: &HandlerCtx, action: &Action) -> Result<HandlerOutcome> {
        if ctx.gate(action.id).await? == Gate::Cancel {
            return Ok(HandlerOutcome::Cancelled);
        }
        let Some(policy_id) = opt_uuid(&action.inputs, "policy_id") else {
            return Ok(HandlerOutcome::Failed("missing input: policy_id".to_string()));
        };
        match policies::cluster_detach_policy(&ctx.pool, action.target_id, policy_id).await {
            Ok(()) => Ok(HandlerOutcome::Succeeded),
            Err(Error::NotFound { .. }) => Ok(HandlerOutcome::Failed(format!(
                "policy {policy_id} is not attached"
            ))),
            Err(e) => Err(e),
        }
    }
}

struct NodeCreateHandler;

#[async_trait]
impl Handler for NodeCreateHandler {
    async fn execute(&self, ctx: &HandlerCtx, action: &Action) -> Result<HandlerOutcome> {
        if ctx.gate(action.id).await? == Gate::Cancel {
            return Ok(HandlerOutcome::Cancelled);
        }
        let node = nodes::node_get(&ctx.pool, action.target_id).await?;
        if let Some(cluster_id) = opt_uuid(&action.inputs, "cluster_id") {
            nodes::node_migrate(&ctx.pool, node.id, None, Some(cluster_id)).await?;
        }
        nodes::node_update(
            &ctx.pool,
            node.id,
            NodeUpdate {
                physical_id: Some(Uuid::new_v4()),
                status: Some(status::ACTIVE.to_string()),
                status_reason: Some("Node created.".to_string()),
                ..Default::default()
            },
        )
        .await?;
        Ok(HandlerOutcome::Succeeded)
    }
}

struct NodeUpdateHandler;

#[async_trait]
impl Handler for NodeUpdateHandler {
    async fn execute(&self, ctx: &HandlerCtx, action: &Action) -> Result<HandlerOutcome> {
        if ctx.gate(action.id).await? == Gate::Cancel {
            return Ok(HandlerOutcome::Cancelled);
        }
        nodes::node_update(
            &ctx.pool,
            action.target_id,
            NodeUpdate {
                name: opt_str(&action.inputs, "name"),
                status: Some(status::ACTIVE.to_string()),
                status_reason: Some("Node updated.".to_string()),
                ..Default::default()
            },
        )
        .await?;
        Ok(HandlerOutcome::Succeeded)
    }
}

struct NodeDeleteHandler;

#[async_trait]
impl Handler for NodeDeleteHandler {
    async fn execute(&self, ctx: &HandlerCtx, action: &Action) -> Result<HandlerOutcome> {
        if ctx.gate(action.id).await? == Gate::Cancel {
            return Ok(HandlerOutcome::Cancelled);
        }
        nodes::node_delete(&ctx.pool, action.target_id).await?;
        Ok(HandlerOutcome::Succeeded)
    }
}

struct NodeJoinClusterHandler;

#[async_trait]
impl Handler for NodeJoinClusterHandler {
    async fn execute(&self, ctx: &HandlerCtx, action: &Action) -> Result<HandlerOutcome> {
        if ctx.gate(action.id).await? == Gate::Cancel {
            return Ok(HandlerOutcome::Cancelled);
        }
        let Some(cluster_id) = opt_uuid(&action.inputs, "cluster_id") else {
            return Ok(HandlerOutcome::Failed("missing input: cluster_id".to_string()));
        };
        let node = nodes::node_get(&ctx.pool, action.target_id).await?;
        if let Some(current) = node.cluster_id {
            return Ok(HandlerOutcome::Failed(format!(
                "node {} is already a member of cluster {current}",
                node.id
            )));
        }
        nodes::node_migrate(&ctx.pool, node.id, None, Some(cluster_id)).await?;
        Ok(HandlerOutcome::Succeeded)
    }
}

struct NodeLeaveClusterHandler;

#[async_trait]
impl Handler for NodeLeaveClusterHandler {
    async fn execute(&self, ctx: &HandlerCtx, action: &Action) -> Result<HandlerOutcome> {
        if ctx.gate(action.id).await? == Gate::Cancel {
            return Ok(HandlerOutcome::Cancelled);
        }
        let node = nodes::node_get(&ctx.pool, action.target_id).await?;
        let Some(current) = node.cluster_id else {
            return Ok(HandlerOutcome::Failed(format!(
                "node {} is not a member of any cluster",
                node.id
            )));
        };
        nodes::node_migrate(&ctx.pool, node.id, Some(current), None).await?;
        Ok(HandlerOutcome::Succeeded)
    }
}
