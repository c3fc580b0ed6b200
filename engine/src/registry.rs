use deadpool_postgres::Pool;
use drover_common::error::{Error, Result};
use drover_common::{READY_TOPIC, RequestContext};
use serde_json::Value;
use uuid::Uuid;

use crate::db::actions::{self, NewAction};
use crate::db::clusters::{self, NewCluster};
use crate::db::nodes::{self, NewNode};
use crate::db::policies;
use crate::db::profiles;
use crate::models::{Action, ActionStatus, ActionVerb, ControlSignal, TargetType, status};

/// Admission limits enforced when an action is submitted, before any row is
/// written.
#[derive(Debug, Clone, Copy)]
pub struct AdmissionLimits {
    pub max_members_per_cluster: i64,
    pub max_clusters_per_project: i64,
    pub max_nested_cluster_depth: i64,
}

fn input_str<'a>(inputs: &'a Value, key: &str) -> Result<&'a str> {
    inputs
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Invalid(format!("missing or non-string input: {key}")))
}

fn input_uuid(inputs: &Value, key: &str) -> Result<Uuid> {
    input_str(inputs, key)?
        .parse()
        .map_err(|_| Error::Invalid(format!("input {key} is not a uuid")))
}

fn input_uuid_opt(inputs: &Value, key: &str) -> Result<Option<Uuid>> {
    match inputs.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(_) => input_uuid(inputs, key).map(Some),
    }
}

fn input_i64_opt(inputs: &Value, key: &str) -> Result<Option<i64>> {
    match inputs.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_i64()
            .map(Some)
            .ok_or_else(|| Error::Invalid(format!("input {key} is not an integer"))),
    }
}

fn check_quota(kind: &str, current: i64, max: i64) -> Result<()> {
    if max > 0 && current >= max {
        return Err(Error::Forbidden(format!(
            "{kind} quota exceeded: {current} of {max} in use"
        )));
    }
    Ok(())
}

/// Depth of a cluster hanging off `parent` (a top-level cluster has depth
/// 1). Walks the parent chain through the store.
async fn nested_depth(
    pool: &Pool,
    ctx: &RequestContext,
    mut parent: Option<Uuid>,
) -> Result<i64> {
    let mut depth: i64 = 1;
    while let Some(id) = parent {
        let cluster = clusters::cluster_get(pool, ctx, id, false)
            .await?
            .ok_or_else(|| Error::not_found("cluster", id))?;
        depth += 1;
        parent = cluster.parent;
        if depth > 64 {
            // A chain this long means the data is corrupt, not nested.
            return Err(Error::Invalid("cluster parent chain does not terminate".into()));
        }
    }
    Ok(depth)
}

async fn admit_cluster_create(
    pool: &Pool,
    ctx: &RequestContext,
    limits: &AdmissionLimits,
    target_id: Uuid,
    inputs: &Value,
) -> Result<()> {
    let name = input_str(inputs, "name")?;
    let parent = input_uuid_opt(inputs, "parent")?;

    let count = clusters::cluster_count_all(pool, ctx).await?;
    check_quota("cluster", count, limits.max_clusters_per_project)?;

    let depth = nested_depth(pool, ctx, parent).await?;
    if limits.max_nested_cluster_depth > 0 && depth > limits.max_nested_cluster_depth {
        return Err(Error::Invalid(format!(
            "nesting depth {depth} exceeds the allowed {}",
            limits.max_nested_cluster_depth
        )));
    }

    if clusters::cluster_get_by_name_and_parent(pool, ctx, name, parent)
        .await?
        .is_some()
    {
        return Err(Error::Conflict(format!(
            "a cluster named \"{name}\" already exists in project {}",
            ctx.project
        )));
    }

    let profile_id = input_uuid_opt(inputs, "profile_id")?;
    if let Some(profile_id) = profile_id {
        profiles::profile_get(pool, profile_id).await?;
    }
    let size = input_i64_opt(inputs, "size")?.unwrap_or(0);
    if size < 0 {
        return Err(Error::Invalid("cluster size must be non-negative".into()));
    }
    if limits.max_members_per_cluster > 0 && size > limits.max_members_per_cluster {
        return Err(Error::Forbidden(format!(
            "requested size {size} exceeds max members per cluster {}",
            limits.max_members_per_cluster
        )));
    }

    // The target row is created up front in INIT so every later action on
    // this id has something to look at; the handler materializes it.
    clusters::cluster_create(
        pool,
        NewCluster {
            id: target_id,
            name: name.to_string(),
            project: ctx.project.clone(),
            parent,
            profile_id,
            size: 0,
            status: status::INIT.to_string(),
            status_reason: Some("Cluster creation accepted.".to_string()),
        },
    )
    .await?;
    Ok(())
}

async fn admit_node_create(
    pool: &Pool,
    ctx: &RequestContext,
    limits: &AdmissionLimits,
    target_id: Uuid,
    inputs: &Value,
) -> Result<()> {
    let name = input_str(inputs, "name")?;
    let profile_id = input_uuid_opt(inputs, "profile_id")?;
    if let Some(profile_id) = profile_id {
        profiles::profile_get(pool, profile_id).await?;
    }

    if let Some(cluster_id) = input_uuid_opt(inputs, "cluster_id")? {
        let cluster = clusters::cluster_get(pool, ctx, cluster_id, false)
            .await?
            .ok_or_else(|| Error::not_found("cluster", cluster_id))?;
        check_quota(
            "cluster member",
            cluster.size as i64,
            limits.max_members_per_cluster,
        )?;
    }

    nodes::node_create(
        pool,
        NewNode {
            id: target_id,
            name: name.to_string(),
            // Membership is established by the handler via node_migrate so
            // the size counter moves in the same transaction.
            cluster_id: None,
            physical_id: None,
            profile_id,
            status: status::INIT.to_string(),
            status_reason: Some("Node creation accepted.".to_string()),
        },
    )
    .await?;
    Ok(())
}

async fn admit_existing_target(
    pool: &Pool,
    ctx: &RequestContext,
    limits: &AdmissionLimits,
    verb: ActionVerb,
    target_id: Uuid,
    inputs: &Value,
) -> Result<()> {
    match verb.target_type() {
        TargetType::Cluster => {
            clusters::cluster_get(pool, ctx, target_id, false)
                .await?
                .ok_or_else(|| Error::not_found("cluster", target_id))?;
        }
        TargetType::Node => {
            nodes::node_get(pool, target_id).await?;
        }
    }

    match verb {
        ActionVerb::ClusterScale => {
            let size = input_i64_opt(inputs, "size")?
                .ok_or_else(|| Error::Invalid("missing input: size".into()))?;
            if size < 0 {
                return Err(Error::Invalid("cluster size must be non-negative".into()));
            }
            if limits.max_members_per_cluster > 0 && size > limits.max_members_per_cluster {
                return Err(Error::Forbidden(format!(
                    "requested size {size} exceeds max members per cluster {}",
                    limits.max_members_per_cluster
                )));
            }
        }
        ActionVerb::ClusterAttachPolicy | ActionVerb::ClusterDetachPolicy => {
            let policy_id = input_uuid(inputs, "policy_id")?;
            policies::policy_get(pool, policy_id, false).await?;
        }
        ActionVerb::NodeJoinCluster => {
            let cluster_id = input_uuid(inputs, "cluster_id")?;
            let cluster = clusters::cluster_get(pool, ctx, cluster_id, false)
                .await?
                .ok_or_else(|| Error::not_found("cluster", cluster_id))?;
            check_quota(
                "cluster member",
                cluster.size as i64,
                limits.max_members_per_cluster,
            )?;
        }
        _ => {}
    }
    Ok(())
}

/// Accept one unit of work. Validates the verb against the target, enforces
/// admission limits, writes the action record plus its dependency edges,
/// and wakes idle workers when the action lands READY.
pub async fn submit_action(
    pool: &Pool,
    redis: &deadpool_redis::Pool,
    ctx: &RequestContext,
    limits: &AdmissionLimits,
    verb: &str,
    target_type: &str,
    target_id: Uuid,
    inputs: Value,
    depends_on: Vec<Uuid>,
) -> Result<Action> {
    let verb = ActionVerb::parse(verb).map_err(|e| Error::Invalid(e.to_string()))?;
    let target_type =
        TargetType::parse(target_type).map_err(|e| Error::Invalid(e.to_string()))?;
    if verb.target_type() != target_type {
        return Err(Error::Invalid(format!(
            "verb {} operates on a {}, not a {}",
            verb.as_str(),
            verb.target_type().as_str(),
            target_type.as_str()
        )));
    }

    match verb {
        ActionVerb::ClusterCreate => {
            admit_cluster_create(pool, ctx, limits, target_id, &inputs).await?
        }
        ActionVerb::NodeCreate => {
            admit_node_create(pool, ctx, limits, target_id, &inputs).await?
        }
        _ => admit_existing_target(pool, ctx, limits, verb, target_id, &inputs).await?,
    }

    let action = actions::action_create(
        pool,
        NewAction {
            id: Uuid::new_v4(),
            target_id,
            target_type,
            verb,
            inputs,
            depends_on,
        },
    )
    .await?;

    tracing::info!(
        action = %action.id,
        verb = verb.as_str(),
        target = %target_id,
        status = action.status.as_str(),
        request = %ctx.request_id,
        "action submitted"
    );

    if action.status == ActionStatus::Ready {
        publish_ready(redis, &[action.id]).await;
    }

    Ok(action)
}

/// Cancel an action. A RUNNING action gets the durable CANCEL signal and
/// unwinds at its next control poll; an action that never started is
/// cancelled (and cascaded) outright.
pub async fn cancel_action(pool: &Pool, id: Uuid) -> Result<()> {
    let action = actions::action_get(pool, id).await?;
    match action.status {
        ActionStatus::Running => {
            actions::action_control(pool, id, Some(ControlSignal::Cancel)).await
        }
        ActionStatus::Init | ActionStatus::Waiting | ActionStatus::Ready => {
            actions::action_mark_cancelled(pool, id, "Cancelled before execution.").await?;
            Ok(())
        }
        status => Err(Error::Conflict(format!(
            "action {id} already finished as {}",
            status.as_str()
        ))),
    }
}

pub async fn suspend_action(pool: &Pool, id: Uuid) -> Result<()> {
    actions::action_control(pool, id, Some(ControlSignal::Suspend)).await
}

pub async fn resume_action(pool: &Pool, id: Uuid) -> Result<()> {
    actions::action_control(pool, id, Some(ControlSignal::Resume)).await
}

/// Best-effort wakeup for idle workers across the fleet. Losing a message
/// only costs latency: the periodic scan remains the source of truth.
pub async fn publish_ready(redis: &deadpool_redis::Pool, ids: &[Uuid]) {
    for id in ids {
        if let Err(e) =
            drover_common::redis::publish(redis, READY_TOPIC, id.to_string().as_bytes()).await
        {
            tracing::warn!(action = %id, error = ?e, "failed to publish ready wakeup");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn quota_check_honors_unlimited() {
        assert!(check_quota("cluster", 10_000, 0).is_ok());
        assert!(check_quota("cluster", 99, 100).is_ok());
        let err = check_quota("cluster", 100, 100).unwrap_err();
        assert_eq!(err.tag(), "Forbidden");
    }

    #[test]
    fn input_helpers_validate_shapes() {
        let inputs = json!({
            "name": "web",
            "size": 3,
            "cluster_id": "0a4f4a52-0d3e-4a7c-9d6e-2f3a0c9b1d22",
            "bad_id": "not-a-uuid",
        });
        assert_eq!(input_str(&inputs, "name").unwrap(), "web");
        assert_eq!(input_i64_opt(&inputs, "size").unwrap(), Some(3));
        assert_eq!(input_i64_opt(&inputs, "absent").unwrap(), None);
        assert!(input_uuid(&inputs, "cluster_id").is_ok());
        assert_eq!(input_uuid(&inputs, "bad_id").unwrap_err().tag(), "Invalid");
        assert_eq!(input_str(&inputs, "size").unwrap_err().tag(), "Invalid");
    }

    #[test]
    fn uuid_opt_treats_null_as_absent() {
        let inputs = json!({ "parent": null });
        assert_eq!(input_uuid_opt(&inputs, "parent").unwrap(), None);
        assert_eq!(input_uuid_opt(&inputs, "missing").unwrap(), None);
    }
}
