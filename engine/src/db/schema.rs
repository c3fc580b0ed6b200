use anyhow::{Context, Result};
use deadpool_postgres::Pool;

/// Ordered, append-only migration list. Each entry runs in its own
/// transaction and is recorded in `schema_migrations`, so restarting an
/// engine against an up-to-date database is a no-op.
const MIGRATIONS: &[(i32, &str)] = &[
    (
        1,
        r#"
        CREATE TABLE clusters (
            id UUID PRIMARY KEY,
            name TEXT NOT NULL,
            project TEXT NOT NULL,
            parent UUID,
            profile_id UUID,
            size INT NOT NULL DEFAULT 0,
            status TEXT NOT NULL,
            status_reason TEXT,
            created_time TIMESTAMPTZ NOT NULL DEFAULT now(),
            updated_time TIMESTAMPTZ,
            deleted_time TIMESTAMPTZ
        );
        CREATE INDEX idx_clusters_project_name ON clusters (project, name);

        CREATE TABLE nodes (
            id UUID PRIMARY KEY,
            name TEXT NOT NULL,
            cluster_id UUID,
            physical_id UUID,
            profile_id UUID,
            status TEXT NOT NULL,
            status_reason TEXT,
            created_time TIMESTAMPTZ NOT NULL DEFAULT now(),
            updated_time TIMESTAMPTZ
        );
        CREATE INDEX idx_nodes_cluster ON nodes (cluster_id);
        CREATE INDEX idx_nodes_physical ON nodes (physical_id);

        CREATE TABLE profiles (
            id UUID PRIMARY KEY,
            name TEXT NOT NULL,
            profile_type TEXT NOT NULL,
            spec JSONB NOT NULL,
            created_time TIMESTAMPTZ NOT NULL DEFAULT now()
        );

        CREATE TABLE policies (
            id UUID PRIMARY KEY,
            name TEXT NOT NULL,
            policy_type TEXT NOT NULL,
            spec JSONB NOT NULL,
            created_time TIMESTAMPTZ NOT NULL DEFAULT now(),
            deleted_time TIMESTAMPTZ
        );

        CREATE TABLE cluster_policies (
            cluster_id UUID NOT NULL REFERENCES clusters (id) ON DELETE CASCADE,
            policy_id UUID NOT NULL REFERENCES policies (id),
            enabled BOOLEAN NOT NULL DEFAULT TRUE,
            priority INT NOT NULL DEFAULT 50,
            cooldown INT NOT NULL DEFAULT 0,
            level INT NOT NULL DEFAULT 0,
            PRIMARY KEY (cluster_id, policy_id)
        );

        CREATE TABLE actions (
            id UUID PRIMARY KEY,
            target_id UUID NOT NULL,
            target_type TEXT NOT NULL,
            verb TEXT NOT NULL,
            inputs JSONB NOT NULL DEFAULT '{}',
            outputs JSONB,
            owner UUID,
            status TEXT NOT NULL,
            status_reason TEXT,
            control TEXT,
            depends_on JSONB NOT NULL DEFAULT '[]',
            depended_by JSONB NOT NULL DEFAULT '[]',
            created_time TIMESTAMPTZ NOT NULL DEFAULT now(),
            updated_time TIMESTAMPTZ,
            finished_time TIMESTAMPTZ
        );
        CREATE INDEX idx_actions_status ON actions (status);
        CREATE INDEX idx_actions_target ON actions (target_id);

        CREATE TABLE cluster_locks (
            cluster_id UUID PRIMARY KEY,
            worker_id UUID NOT NULL
        );

        CREATE TABLE node_locks (
            node_id UUID PRIMARY KEY,
            worker_id UUID NOT NULL
        );

        CREATE TABLE events (
            id UUID PRIMARY KEY,
            obj_id UUID NOT NULL,
            obj_type TEXT NOT NULL,
            timestamp TIMESTAMPTZ NOT NULL DEFAULT now(),
            level TEXT NOT NULL,
            payload JSONB
        );
        CREATE INDEX idx_events_obj ON events (obj_id, obj_type, timestamp);
        "#,
    ),
    (
        2,
        r#"
        CREATE INDEX idx_actions_ready_claim
            ON actions (created_time) WHERE status = 'READY';
        "#,
    ),
];

pub async fn init_schema(pool: &Pool) -> Result<()> {
    let mut client = pool.get().await.context("failed to get db connection")?;

    client
        .execute(
            r#"
            CREATE TABLE IF NOT EXISTS schema_migrations (
                version INT PRIMARY KEY,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
            &[],
        )
        .await
        .context("failed to create schema_migrations table")?;

    let row = client
        .query_one("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", &[])
        .await
        .context("failed to read schema version")?;
    let current: i32 = row.get(0);

    for (version, sql) in MIGRATIONS {
        if *version <= current {
            continue;
        }
        let tx = client
            .transaction()
            .await
            .context("failed to start migration transaction")?;
        tx.batch_execute(sql)
            .await
            .with_context(|| format!("failed to apply migration {version}"))?;
        tx.execute(
            "INSERT INTO schema_migrations (version) VALUES ($1)",
            &[version],
        )
        .await
        .context("failed to record migration")?;
        tx.commit().await.context("failed to commit migration")?;
        tracing::info!(version, "applied schema migration");
    }

    tracing::info!("database schema initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_strictly_increasing() {
        let mut last = 0;
        for (version, _) in MIGRATIONS {
            assert!(*version > last, "migration {version} out of order");
            last = *version;
        }
    }
}
