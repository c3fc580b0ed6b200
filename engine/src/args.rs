use clap::{Parser, Subcommand};
use drover_common::args::{PostgresArgs, RedisArgs};
use uuid::Uuid;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the engine: worker pool, liveness heartbeat, ready-topic listener
    Run(EngineArgs),

    /// Apply pending schema migrations and exit
    Migrate(MigrateArgs),

    /// Submit an action for asynchronous execution
    Submit(SubmitArgs),

    /// Send a control signal (cancel, suspend, resume) to an action
    Control(ControlArgs),

    /// List clusters in a project
    Clusters(ClustersArgs),

    /// Show one action or list a worker's actions
    Actions(ActionsArgs),

    /// List the event log of a cluster
    Events(EventsArgs),

    /// Register a profile
    CreateProfile(CreateProfileArgs),

    /// List profiles
    Profiles(ProfilesArgs),

    /// Register a policy
    CreatePolicy(CreatePolicyArgs),

    /// List policies
    Policies(PoliciesArgs),

    /// Soft-delete a policy (must be detached everywhere first)
    DeletePolicy(DeletePolicyArgs),

    /// Enable or disable a policy binding on a cluster
    SetPolicy(SetPolicyArgs),
}

/// Admission limits enforced at submission time.
#[derive(Parser, Debug, Clone)]
pub struct LimitsArgs {
    /// Maximum members allowed per cluster (0 = unlimited)
    #[arg(long, env = "MAX_MEMBERS_PER_CLUSTER", default_value_t = 1000)]
    pub max_members_per_cluster: i64,

    /// Maximum active clusters per project (0 = unlimited)
    #[arg(long, env = "MAX_CLUSTERS_PER_PROJECT", default_value_t = 100)]
    pub max_clusters_per_project: i64,

    /// Maximum nesting depth for clusters (0 = unlimited)
    #[arg(long, env = "MAX_NESTED_CLUSTER_DEPTH", default_value_t = 3)]
    pub max_nested_cluster_depth: i64,
}

impl LimitsArgs {
    pub fn admission_limits(&self) -> crate::registry::AdmissionLimits {
        crate::registry::AdmissionLimits {
            max_members_per_cluster: self.max_members_per_cluster,
            max_clusters_per_project: self.max_clusters_per_project,
            max_nested_cluster_depth: self.max_nested_cluster_depth,
        }
    }
}

#[derive(Parser, Debug, Clone)]
pub struct EngineArgs {
    #[command(flatten)]
    pub postgres: PostgresArgs,

    #[command(flatten)]
    pub redis: RedisArgs,

    #[command(flatten)]
    pub limits: LimitsArgs,

    /// Seconds to wait for a peer engine's liveness probe before its locks
    /// are considered stale
    #[arg(long, env = "ENGINE_LIFE_CHECK_TIMEOUT", default_value_t = 2)]
    pub engine_life_check_timeout: u64,

    /// Wall-clock limit in seconds for a single action
    #[arg(long, env = "DEFAULT_ACTION_TIMEOUT", default_value_t = 3600)]
    pub default_action_timeout: u64,

    /// Seconds a target stays ineligible for new work after a failed action
    #[arg(long, env = "ERROR_WAIT_TIME", default_value_t = 240)]
    pub error_wait_time: u64,

    /// Worker pool size for this engine
    #[arg(long, env = "NUM_ENGINE_WORKERS", default_value_t = 1)]
    pub num_engine_workers: usize,

    /// Idle poll interval in seconds
    #[arg(long, env = "PERIODIC_INTERVAL", default_value_t = 60)]
    pub periodic_interval: u64,

    /// Maximum events kept per cluster; older events are purged (0 = unlimited)
    #[arg(long, env = "MAX_EVENTS_PER_CLUSTER", default_value_t = 3000)]
    pub max_events_per_cluster: i64,

    /// How many events to purge in one batch when over the cap
    #[arg(long, env = "EVENT_PURGE_BATCH_SIZE", default_value_t = 200)]
    pub event_purge_batch_size: i64,
}

#[derive(Parser, Debug, Clone)]
pub struct MigrateArgs {
    #[command(flatten)]
    pub postgres: PostgresArgs,
}

#[derive(Parser, Debug, Clone)]
pub struct SubmitArgs {
    #[command(flatten)]
    pub postgres: PostgresArgs,

    #[command(flatten)]
    pub redis: RedisArgs,

    #[command(flatten)]
    pub limits: LimitsArgs,

    /// Project to act in
    #[arg(long, env = "DROVER_PROJECT")]
    pub project: String,

    /// Action verb, e.g. CLUSTER_CREATE or NODE_JOIN_CLUSTER
    #[arg(long)]
    pub verb: String,

    /// Target type: cluster or node
    #[arg(long)]
    pub target_type: String,

    /// Target id; omitted for CREATE verbs to mint a fresh one
    #[arg(long)]
    pub target_id: Option<Uuid>,

    /// JSON object with verb-specific inputs
    #[arg(long, default_value = "{}")]
    pub inputs: String,

    /// Actions that must succeed before this one becomes READY
    #[arg(long = "depends-on")]
    pub depends_on: Vec<Uuid>,
}

#[derive(Parser, Debug, Clone)]
pub struct ControlArgs {
    #[command(flatten)]
    pub postgres: PostgresArgs,

    /// Action id
    #[arg(long)]
    pub id: Uuid,

    /// One of: cancel, suspend, resume
    #[arg(long)]
    pub signal: String,
}

#[derive(Parser, Debug, Clone)]
pub struct ClustersArgs {
    #[command(flatten)]
    pub postgres: PostgresArgs,

    #[arg(long, env = "DROVER_PROJECT")]
    pub project: String,

    #[arg(long)]
    pub limit: Option<i64>,

    /// Resume listing after this cluster id
    #[arg(long)]
    pub marker: Option<Uuid>,

    /// Comma-separated sort keys (name, status, created_time, updated_time)
    #[arg(long, value_delimiter = ',')]
    pub sort_keys: Vec<String>,

    /// asc or desc
    #[arg(long)]
    pub sort_dir: Option<String>,

    #[arg(long)]
    pub name: Option<String>,

    #[arg(long)]
    pub status: Option<String>,

    #[arg(long, default_value_t = false)]
    pub show_nested: bool,

    #[arg(long, default_value_t = false)]
    pub show_deleted: bool,
}

#[derive(Parser, Debug, Clone)]
pub struct ActionsArgs {
    #[command(flatten)]
    pub postgres: PostgresArgs,

    /// Show a single action
    #[arg(long)]
    pub id: Option<Uuid>,

    /// List actions owned by this engine
    #[arg(long)]
    pub owner: Option<Uuid>,

    /// With --id: remove the (finished) action record
    #[arg(long, default_value_t = false)]
    pub delete: bool,
}

#[derive(Parser, Debug, Clone)]
pub struct EventsArgs {
    #[command(flatten)]
    pub postgres: PostgresArgs,

    /// Cluster id
    #[arg(long)]
    pub cluster: Uuid,

    #[arg(long)]
    pub limit: Option<i64>,

    /// Resume listing after this event id
    #[arg(long)]
    pub marker: Option<Uuid>,
}

#[derive(Parser, Debug, Clone)]
pub struct CreateProfileArgs {
    #[command(flatten)]
    pub postgres: PostgresArgs,

    #[arg(long)]
    pub name: String,

    /// Type tag, e.g. os.nova.server
    #[arg(long = "type")]
    pub profile_type: String,

    /// JSON blob with the profile spec
    #[arg(long, default_value = "{}")]
    pub spec: String,
}

#[derive(Parser, Debug, Clone)]
pub struct ProfilesArgs {
    #[command(flatten)]
    pub postgres: PostgresArgs,
}

#[derive(Parser, Debug, Clone)]
pub struct CreatePolicyArgs {
    #[command(flatten)]
    pub postgres: PostgresArgs,

    #[arg(long)]
    pub name: String,

    /// Type tag, e.g. placement or scaling
    #[arg(long = "type")]
    pub policy_type: String,

    /// JSON blob with the policy spec
    #[arg(long, default_value = "{}")]
    pub spec: String,
}

#[derive(Parser, Debug, Clone)]
pub struct PoliciesArgs {
    #[command(flatten)]
    pub postgres: PostgresArgs,

    #[arg(long, default_value_t = false)]
    pub show_deleted: bool,
}

#[derive(Parser, Debug, Clone)]
pub struct DeletePolicyArgs {
    #[command(flatten)]
    pub postgres: PostgresArgs,

    #[arg(long)]
    pub id: Uuid,
}

#[derive(Parser, Debug, Clone)]
pub struct SetPolicyArgs {
    #[command(flatten)]
    pub postgres: PostgresArgs,

    #[arg(long)]
    pub cluster: Uuid,

    #[arg(long)]
    pub policy: Uuid,

    /// true to enable, false to disable
    #[arg(long)]
    pub enabled: bool,
}
