use anyhow::Result;
use clap::Parser;
use owo_colors::OwoColorize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use drover_engine::args::{Cli, Commands, EngineArgs, MigrateArgs};
use drover_engine::dispatcher::{self, Dispatcher};
use drover_engine::{cli, db, liveness};

#[tokio::main]
async fn main() -> Result<()> {
    drover_common::init();

    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => run_engine(args).await,
        Commands::Migrate(args) => run_migrate(args).await,
        Commands::Submit(args) => cli::run_submit(args).await,
        Commands::Control(args) => cli::run_control(args).await,
        Commands::Clusters(args) => cli::run_list_clusters(args).await,
        Commands::Actions(args) => cli::run_list_actions(args).await,
        Commands::Events(args) => cli::run_list_events(args).await,
        Commands::CreateProfile(args) => cli::run_create_profile(args).await,
        Commands::Profiles(args) => cli::run_list_profiles(args).await,
        Commands::CreatePolicy(args) => cli::run_create_policy(args).await,
        Commands::Policies(args) => cli::run_list_policies(args).await,
        Commands::DeletePolicy(args) => cli::run_delete_policy(args).await,
        Commands::SetPolicy(args) => cli::run_set_policy(args).await,
    }
}

async fn run_migrate(args: MigrateArgs) -> Result<()> {
    let pool = drover_common::postgres::create_pool(args.postgres).await;
    db::schema::init_schema(&pool).await?;
    Ok(())
}

async fn run_engine(args: EngineArgs) -> Result<()> {
    let pool = drover_common::postgres::create_pool(args.postgres.clone()).await;
    tracing::info!("connected to Postgres");

    db::schema::init_schema(&pool).await?;

    let redis = drover_common::redis::init_redis(&args.redis).await;

    drover_common::metrics::maybe_spawn_metrics_server();

    let engine_id = Uuid::new_v4();
    println!(
        "{}{}",
        "🚜 Starting engine • id=".green(),
        engine_id.to_string().green().dimmed(),
    );

    let cancel = CancellationToken::new();
    {
        let signal_cancel = cancel.clone();
        tokio::spawn(async move {
            drover_common::shutdown::shutdown_signal().await;
            signal_cancel.cancel();
        });
    }

    // Peers decide whether to steal our locks based on this heartbeat.
    {
        let cancel = cancel.clone();
        let redis = redis.clone();
        tokio::spawn(async move {
            if let Err(e) = liveness::run_heartbeat(cancel, redis, engine_id).await {
                tracing::info!(error = %e, "heartbeat stopped");
            }
        });
    }

    drover_common::signal_ready();

    dispatcher::run_dispatcher(
        cancel,
        Dispatcher {
            pool,
            redis,
            engine_id,
            args,
        },
    )
    .await
}
