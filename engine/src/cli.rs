use anyhow::{Result, bail};
use drover_common::RequestContext;
use uuid::Uuid;

use crate::args::{
    ActionsArgs, ClustersArgs, ControlArgs, CreatePolicyArgs, CreateProfileArgs, DeletePolicyArgs,
    EventsArgs, PoliciesArgs, ProfilesArgs, SetPolicyArgs, SubmitArgs,
};
use crate::db::actions;
use crate::db::clusters::{self, ClusterFilters, ClusterListQuery};
use crate::db::events;
use crate::db::policies::{self, NewPolicy};
use crate::db::profiles::{self, NewProfile};
use crate::registry;

/// Submit one action straight into the store, the same path the API layer
/// takes.
pub async fn run_submit(args: SubmitArgs) -> Result<()> {
    let pool = drover_common::postgres::create_pool(args.postgres.clone()).await;
    let redis = drover_common::redis::init_redis(&args.redis).await;

    let ctx = RequestContext::new(&args.project);
    let inputs: serde_json::Value = serde_json::from_str(&args.inputs)?;
    let target_id = args.target_id.unwrap_or_else(Uuid::new_v4);

    let action = registry::submit_action(
        &pool,
        &redis,
        &ctx,
        &args.limits.admission_limits(),
        &args.verb,
        &args.target_type,
        target_id,
        inputs,
        args.depends_on,
    )
    .await?;

    println!("Submitted action:");
    println!("  ID:     {}", action.id);
    println!("  Verb:   {}", action.verb.as_str());
    println!("  Target: {}", action.target_id);
    println!("  Status: {}", action.status.as_str());
    Ok(())
}

pub async fn run_control(args: ControlArgs) -> Result<()> {
    let pool = drover_common::postgres::create_pool(args.postgres).await;

    match args.signal.to_lowercase().as_str() {
        "cancel" => registry::cancel_action(&pool, args.id).await?,
        "suspend" => registry::suspend_action(&pool, args.id).await?,
        "resume" => registry::resume_action(&pool, args.id).await?,
        other => bail!("unknown control signal: {other}"),
    }
    println!("Sent {} to action {}", args.signal.to_lowercase(), args.id);
    Ok(())
}

pub async fn run_list_clusters(args: ClustersArgs) -> Result<()> {
    let pool = drover_common::postgres::create_pool(args.postgres.clone()).await;

    let ctx = RequestContext::new(&args.project).show_deleted(args.show_deleted);
    let query = ClusterListQuery {
        limit: args.limit,
        marker: args.marker,
        sort_keys: args.sort_keys,
        sort_dir: args.sort_dir,
        filters: ClusterFilters {
            name: args.name,
            status: args.status,
        },
        show_nested: args.show_nested,
        show_deleted: args.show_deleted,
    };
    let rows = clusters::cluster_get_all(&pool, &ctx, &query).await?;

    println!("{} cluster(s):", rows.len());
    for c in rows {
        println!(
            "  {}  {:<24} size={:<4} status={:<10} {}",
            c.id,
            c.name,
            c.size,
            c.status,
            c.status_reason.as_deref().unwrap_or(""),
        );
    }
    Ok(())
}

pub async fn run_list_actions(args: ActionsArgs) -> Result<()> {
    let pool = drover_common::postgres::create_pool(args.postgres.clone()).await;

    if let Some(id) = args.id {
        if args.delete {
            actions::action_delete(&pool, id).await?;
            println!("Deleted action {id}");
            return Ok(());
        }
        let a = actions::action_get(&pool, id).await?;
        println!("Action:");
        println!("  ID:       {}", a.id);
        println!("  Verb:     {}", a.verb.as_str());
        println!("  Target:   {} ({})", a.target_id, a.target_type.as_str());
        println!("  Status:   {}", a.status.as_str());
        println!("  Reason:   {}", a.status_reason.as_deref().unwrap_or(""));
        println!(
            "  Owner:    {}",
            a.owner.map(|o| o.to_string()).unwrap_or_else(|| "-".into())
        );
        println!(
            "  Control:  {}",
            a.control.map(|c| c.as_str()).unwrap_or("-")
        );
        println!("  DependsOn: {:?}", a.depends_on);
        println!("  DependedBy: {:?}", a.depended_by);
        return Ok(());
    }

    if let Some(owner) = args.owner {
        let rows = actions::action_get_all_by_owner(&pool, owner).await?;
        println!("{} action(s) owned by {owner}:", rows.len());
        for a in rows {
            println!(
                "  {}  {:<22} {:<10} target={}",
                a.id,
                a.verb.as_str(),
                a.status.as_str(),
                a.target_id,
            );
        }
        return Ok(());
    }

    bail!("pass --id or --owner");
}

pub async fn run_list_events(args: EventsArgs) -> Result<()> {
    let pool = drover_common::postgres::create_pool(args.postgres.clone()).await;

    let rows = events::event_get_all_by_cluster(&pool, args.cluster, args.limit, args.marker).await?;
    println!("{} event(s):", rows.len());
    for e in rows {
        println!(
            "  {}  {}  {:<5} {}",
            e.timestamp.to_rfc3339(),
            e.id,
            e.level,
            e.payload
                .as_ref()
                .map(|p| p.to_string())
                .unwrap_or_default(),
        );
    }
    Ok(())
}

pub async fn run_create_profile(args: CreateProfileArgs) -> Result<()> {
    let pool = drover_common::postgres::create_pool(args.postgres.clone()).await;

    let spec: serde_json::Value = serde_json::from_str(&args.spec)?;
    let profile = profiles::profile_create(
        &pool,
        NewProfile {
            id: Uuid::new_v4(),
            name: args.name,
            profile_type: args.profile_type,
            spec,
        },
    )
    .await?;

    println!("Created profile {} ({})", profile.id, profile.profile_type);
    Ok(())
}

pub async fn run_list_profiles(args: ProfilesArgs) -> Result<()> {
    let pool = drover_common::postgres::create_pool(args.postgres).await;

    let rows = profiles::profile_get_all(&pool).await?;
    println!("{} profile(s):", rows.len());
    for p in rows {
        println!("  {}  {:<24} {}", p.id, p.name, p.profile_type);
    }
    Ok(())
}

pub async fn run_create_policy(args: CreatePolicyArgs) -> Result<()> {
    let pool = drover_common::postgres::create_pool(args.postgres.clone()).await;

    let spec: serde_json::Value = serde_json::from_str(&args.spec)?;
    let policy = policies::policy_create(
        &pool,
        NewPolicy {
            id: Uuid::new_v4(),
            name: args.name,
            policy_type: args.policy_type,
            spec,
        },
    )
    .await?;

    println!("Created policy {} ({})", policy.id, policy.policy_type);
    Ok(())
}

pub async fn run_list_policies(args: PoliciesArgs) -> Result<()> {
    let pool = drover_common::postgres::create_pool(args.postgres).await;

    let rows = policies::policy_get_all(&pool, args.show_deleted).await?;
    println!("{} policy(ies):", rows.len());
    for p in rows {
        println!(
            "  {}  {:<24} {:<12} {}",
            p.id,
            p.name,
            p.policy_type,
            if p.deleted_time.is_some() { "deleted" } else { "" },
        );
    }
    Ok(())
}

pub async fn run_delete_policy(args: DeletePolicyArgs) -> Result<()> {
    let pool = drover_common::postgres::create_pool(args.postgres).await;

    policies::policy_delete(&pool, args.id).await?;
    println!("Deleted policy {}", args.id);
    Ok(())
}

pub async fn run_set_policy(args: SetPolicyArgs) -> Result<()> {
    let pool = drover_common::postgres::create_pool(args.postgres).await;

    let binding = if args.enabled {
        policies::cluster_enable_policy(&pool, args.cluster, args.policy).await?
    } else {
        policies::cluster_disable_policy(&pool, args.cluster, args.policy).await?
    };
    println!(
        "Policy {} on cluster {} is now {}",
        binding.policy_id,
        binding.cluster_id,
        if binding.enabled { "enabled" } else { "disabled" },
    );

    for b in policies::cluster_get_policies(&pool, args.cluster).await? {
        println!(
            "  {}  enabled={} priority={} cooldown={} level={}",
            b.policy_id, b.enabled, b.priority, b.cooldown, b.level,
        );
    }
    Ok(())
}
