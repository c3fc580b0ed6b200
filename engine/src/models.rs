use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_postgres::Row;
use uuid::Uuid;

/// Lifecycle states of an action record.
///
/// `Init` is only observable while a submission is still wiring up
/// dependency edges; every other state is reachable from the state machine
/// driven by the dispatcher and the completion hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionStatus {
    Init,
    Waiting,
    Ready,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionStatus::Init => "INIT",
            ActionStatus::Waiting => "WAITING",
            ActionStatus::Ready => "READY",
            ActionStatus::Running => "RUNNING",
            ActionStatus::Succeeded => "SUCCEEDED",
            ActionStatus::Failed => "FAILED",
            ActionStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        Ok(match s {
            "INIT" => ActionStatus::Init,
            "WAITING" => ActionStatus::Waiting,
            "READY" => ActionStatus::Ready,
            "RUNNING" => ActionStatus::Running,
            "SUCCEEDED" => ActionStatus::Succeeded,
            "FAILED" => ActionStatus::Failed,
            "CANCELLED" => ActionStatus::Cancelled,
            other => bail!("unknown action status: {other}"),
        })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ActionStatus::Succeeded | ActionStatus::Failed | ActionStatus::Cancelled
        )
    }
}

/// Control signals carried on the action's control channel, orthogonal to
/// `status`. Handlers poll for these between steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlSignal {
    Cancel,
    Suspend,
    Resume,
}

impl ControlSignal {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlSignal::Cancel => "CANCEL",
            ControlSignal::Suspend => "SUSPEND",
            ControlSignal::Resume => "RESUME",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        Ok(match s {
            "CANCEL" => ControlSignal::Cancel,
            "SUSPEND" => ControlSignal::Suspend,
            "RESUME" => ControlSignal::Resume,
            other => bail!("unknown control signal: {other}"),
        })
    }
}

/// The unit of lock exclusion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetType {
    Cluster,
    Node,
}

impl TargetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetType::Cluster => "cluster",
            TargetType::Node => "node",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        Ok(match s {
            "cluster" => TargetType::Cluster,
            "node" => TargetType::Node,
            other => bail!("unknown target type: {other}"),
        })
    }
}

/// Verbs recognized by the engine. The verb decides which lock is taken
/// and which built-in handler runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionVerb {
    ClusterCreate,
    ClusterUpdate,
    ClusterDelete,
    ClusterScale,
    ClusterSuspend,
    ClusterResume,
    ClusterAttachPolicy,
    ClusterDetachPolicy,
    NodeCreate,
    NodeUpdate,
    NodeDelete,
    NodeJoinCluster,
    NodeLeaveCluster,
}

impl ActionVerb {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionVerb::ClusterCreate => "CLUSTER_CREATE",
            ActionVerb::ClusterUpdate => "CLUSTER_UPDATE",
            ActionVerb::ClusterDelete => "CLUSTER_DELETE",
            ActionVerb::ClusterScale => "CLUSTER_SCALE",
            ActionVerb::ClusterSuspend => "CLUSTER_SUSPEND",
            ActionVerb::ClusterResume => "CLUSTER_RESUME",
            ActionVerb::ClusterAttachPolicy => "CLUSTER_ATTACH_POLICY",
            ActionVerb::ClusterDetachPolicy => "CLUSTER_DETACH_POLICY",
            ActionVerb::NodeCreate => "NODE_CREATE",
            ActionVerb::NodeUpdate => "NODE_UPDATE",
            ActionVerb::NodeDelete => "NODE_DELETE",
            ActionVerb::NodeJoinCluster => "NODE_JOIN_CLUSTER",
            ActionVerb::NodeLeaveCluster => "NODE_LEAVE_CLUSTER",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        Ok(match s {
            "CLUSTER_CREATE" => ActionVerb::ClusterCreate,
            "CLUSTER_UPDATE" => ActionVerb::ClusterUpdate,
            "CLUSTER_DELETE" => ActionVerb::ClusterDelete,
            "CLUSTER_SCALE" => ActionVerb::ClusterScale,
            "CLUSTER_SUSPEND" => ActionVerb::ClusterSuspend,
            "CLUSTER_RESUME" => ActionVerb::ClusterResume,
            "CLUSTER_ATTACH_POLICY" => ActionVerb::ClusterAttachPolicy,
            "CLUSTER_DETACH_POLICY" => ActionVerb::ClusterDetachPolicy,
            "NODE_CREATE" => ActionVerb::NodeCreate,
            "NODE_UPDATE" => ActionVerb::NodeUpdate,
            "NODE_DELETE" => ActionVerb::NodeDelete,
            "NODE_JOIN_CLUSTER" => ActionVerb::NodeJoinCluster,
            "NODE_LEAVE_CLUSTER" => ActionVerb::NodeLeaveCluster,
            other => bail!("unknown action verb: {other}"),
        })
    }

    pub fn target_type(&self) -> TargetType {
        match self {
            ActionVerb::ClusterCreate
            | ActionVerb::ClusterUpdate
            | ActionVerb::ClusterDelete
            | ActionVerb::ClusterScale
            | ActionVerb::ClusterSuspend
            | ActionVerb::ClusterResume
            | ActionVerb::ClusterAttachPolicy
            | ActionVerb::ClusterDetachPolicy => TargetType::Cluster,
            ActionVerb::NodeCreate
            | ActionVerb::NodeUpdate
            | ActionVerb::NodeDelete
            | ActionVerb::NodeJoinCluster
            | ActionVerb::NodeLeaveCluster => TargetType::Node,
        }
    }

    /// DELETE verbs may legitimately outlive their target row.
    pub fn is_delete(&self) -> bool {
        matches!(self, ActionVerb::ClusterDelete | ActionVerb::NodeDelete)
    }
}

/// Cluster and node status strings. Stored as plain text so drivers can
/// introduce their own intermediate states without a schema change.
pub mod status {
    pub const INIT: &str = "INIT";
    pub const ACTIVE: &str = "ACTIVE";
    pub const ERROR: &str = "ERROR";
    pub const DELETING: &str = "DELETING";
    pub const DELETED: &str = "DELETED";
    pub const SUSPENDED: &str = "SUSPENDED";
    pub const UPDATING: &str = "UPDATING";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cluster {
    pub id: Uuid,
    pub name: String,
    pub project: String,
    pub parent: Option<Uuid>,
    pub profile_id: Option<Uuid>,
    pub size: i32,
    pub status: String,
    pub status_reason: Option<String>,
    pub created_time: DateTime<Utc>,
    pub updated_time: Option<DateTime<Utc>>,
    pub deleted_time: Option<DateTime<Utc>>,
}

impl Cluster {
    pub fn from_row(row: &Row) -> Self {
        Self {
            id: row.get("id"),
            name: row.get("name"),
            project: row.get("project"),
            parent: row.get("parent"),
            profile_id: row.get("profile_id"),
            size: row.get("size"),
            status: row.get("status"),
            status_reason: row.get("status_reason"),
            created_time: row.get("created_time"),
            updated_time: row.get("updated_time"),
            deleted_time: row.get("deleted_time"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: Uuid,
    pub name: String,
    pub cluster_id: Option<Uuid>,
    pub physical_id: Option<Uuid>,
    pub profile_id: Option<Uuid>,
    pub status: String,
    pub status_reason: Option<String>,
    pub created_time: DateTime<Utc>,
    pub updated_time: Option<DateTime<Utc>>,
}

impl Node {
    pub fn from_row(row: &Row) -> Self {
        Self {
            id: row.get("id"),
            name: row.get("name"),
            cluster_id: row.get("cluster_id"),
            physical_id: row.get("physical_id"),
            profile_id: row.get("profile_id"),
            status: row.get("status"),
            status_reason: row.get("status_reason"),
            created_time: row.get("created_time"),
            updated_time: row.get("updated_time"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    pub id: Uuid,
    pub name: String,
    pub policy_type: String,
    pub spec: Value,
    pub created_time: DateTime<Utc>,
    pub deleted_time: Option<DateTime<Utc>>,
}

impl Policy {
    pub fn from_row(row: &Row) -> Self {
        Self {
            id: row.get("id"),
            name: row.get("name"),
            policy_type: row.get("policy_type"),
            spec: row.get("spec"),
            created_time: row.get("created_time"),
            deleted_time: row.get("deleted_time"),
        }
    }
}

/// A policy binding on a cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterPolicy {
    pub cluster_id: Uuid,
    pub policy_id: Uuid,
    pub enabled: bool,
    pub priority: i32,
    pub cooldown: i32,
    pub level: i32,
}

impl ClusterPolicy {
    pub fn from_row(row: &Row) -> Self {
        Self {
            cluster_id: row.get("cluster_id"),
            policy_id: row.get("policy_id"),
            enabled: row.get("enabled"),
            priority: row.get("priority"),
            cooldown: row.get("cooldown"),
            level: row.get("level"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub id: Uuid,
    pub name: String,
    pub profile_type: String,
    pub spec: Value,
    pub created_time: DateTime<Utc>,
}

impl Profile {
    pub fn from_row(row: &Row) -> Self {
        Self {
            id: row.get("id"),
            name: row.get("name"),
            profile_type: row.get("profile_type"),
            spec: row.get("spec"),
            created_time: row.get("created_time"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub id: Uuid,
    pub target_id: Uuid,
    pub target_type: TargetType,
    pub verb: ActionVerb,
    pub inputs: Value,
    pub outputs: Option<Value>,
    pub owner: Option<Uuid>,
    pub status: ActionStatus,
    pub status_reason: Option<String>,
    pub control: Option<ControlSignal>,
    pub depends_on: Vec<Uuid>,
    pub depended_by: Vec<Uuid>,
    pub created_time: DateTime<Utc>,
    pub updated_time: Option<DateTime<Utc>>,
    pub finished_time: Option<DateTime<Utc>>,
}

impl Action {
    pub fn from_row(row: &Row) -> Result<Self> {
        let status: String = row.get("status");
        let target_type: String = row.get("target_type");
        let verb: String = row.get("verb");
        let control: Option<String> = row.get("control");
        Ok(Self {
            id: row.get("id"),
            target_id: row.get("target_id"),
            target_type: TargetType::parse(&target_type)?,
            verb: ActionVerb::parse(&verb)?,
            inputs: row.get("inputs"),
            outputs: row.get("outputs"),
            owner: row.get("owner"),
            status: ActionStatus::parse(&status)?,
            status_reason: row.get("status_reason"),
            control: control.as_deref().map(ControlSignal::parse).transpose()?,
            depends_on: ids_from_jsonb(row.get("depends_on"))
                .context("malformed depends_on column")?,
            depended_by: ids_from_jsonb(row.get("depended_by"))
                .context("malformed depended_by column")?,
            created_time: row.get("created_time"),
            updated_time: row.get("updated_time"),
            finished_time: row.get("finished_time"),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub obj_id: Uuid,
    pub obj_type: String,
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub payload: Option<Value>,
}

impl Event {
    pub fn from_row(row: &Row) -> Self {
        Self {
            id: row.get("id"),
            obj_id: row.get("obj_id"),
            obj_type: row.get("obj_type"),
            timestamp: row.get("timestamp"),
            level: row.get("level"),
            payload: row.get("payload"),
        }
    }
}

/// Dependency edge sets are stored as JSONB arrays of uuid strings on the
/// action row, so both directions of an edge can be rewritten in the same
/// statement batch.
pub fn ids_from_jsonb(value: Value) -> Result<Vec<Uuid>> {
    serde_json::from_value(value).context("expected a JSON array of uuids")
}

pub fn ids_to_jsonb(ids: &[Uuid]) -> Value {
    serde_json::to_value(ids).expect("uuid slice serializes")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trip() {
        for s in [
            ActionStatus::Init,
            ActionStatus::Waiting,
            ActionStatus::Ready,
            ActionStatus::Running,
            ActionStatus::Succeeded,
            ActionStatus::Failed,
            ActionStatus::Cancelled,
        ] {
            assert_eq!(ActionStatus::parse(s.as_str()).unwrap(), s);
        }
        assert!(ActionStatus::parse("SLEEPING").is_err());
    }

    #[test]
    fn terminal_states() {
        assert!(ActionStatus::Succeeded.is_terminal());
        assert!(ActionStatus::Failed.is_terminal());
        assert!(ActionStatus::Cancelled.is_terminal());
        assert!(!ActionStatus::Ready.is_terminal());
        assert!(!ActionStatus::Running.is_terminal());
    }

    #[test]
    fn verb_decides_target_type() {
        assert_eq!(
            ActionVerb::ClusterScale.target_type(),
            TargetType::Cluster
        );
        assert_eq!(
            ActionVerb::NodeJoinCluster.target_type(),
            TargetType::Node
        );
        assert_eq!(
            ActionVerb::parse("CLUSTER_ATTACH_POLICY").unwrap(),
            ActionVerb::ClusterAttachPolicy
        );
        assert!(ActionVerb::parse("CLUSTER_EXPLODE").is_err());
    }

    #[test]
    fn edge_sets_round_trip_through_jsonb() {
        let ids = vec![Uuid::new_v4(), Uuid::new_v4()];
        assert_eq!(ids_from_jsonb(ids_to_jsonb(&ids)).unwrap(), ids);
        assert!(ids_from_jsonb(serde_json::json!({"l": []})).is_err());
    }
}
