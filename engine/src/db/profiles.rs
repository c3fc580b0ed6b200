use anyhow::Context;
use deadpool_postgres::Pool;
use drover_common::error::{Error, Result};
use serde_json::Value;
use uuid::Uuid;

use crate::models::Profile;

const PROFILE_COLS: &str = "id, name, profile_type, spec, created_time";

pub struct NewProfile {
    pub id: Uuid,
    pub name: String,
    pub profile_type: String,
    pub spec: Value,
}

pub async fn profile_create(pool: &Pool, values: NewProfile) -> Result<Profile> {
    let client = pool.get().await.context("failed to get db connection")?;

    let row = client
        .query_one(
            &format!(
                r#"
                INSERT INTO profiles (id, name, profile_type, spec)
                VALUES ($1, $2, $3, $4)
                RETURNING {PROFILE_COLS}
                "#
            ),
            &[&values.id, &values.name, &values.profile_type, &values.spec],
        )
        .await
        .context("failed to insert profile")?;

    Ok(Profile::from_row(&row))
}

pub async fn profile_get(pool: &Pool, id: Uuid) -> Result<Profile> {
    let client = pool.get().await.context("failed to get db connection")?;

    let row = client
        .query_opt(
            &format!("SELECT {PROFILE_COLS} FROM profiles WHERE id = $1"),
            &[&id],
        )
        .await
        .context("failed to query profile")?;

    row.map(|r| Profile::from_row(&r))
        .ok_or_else(|| Error::not_found("profile", id))
}

pub async fn profile_get_all(pool: &Pool) -> Result<Vec<Profile>> {
    let client = pool.get().await.context("failed to get db connection")?;

    let rows = client
        .query(
            &format!("SELECT {PROFILE_COLS} FROM profiles ORDER BY created_time DESC, id DESC"),
            &[],
        )
        .await
        .context("failed to list profiles")?;

    Ok(rows.iter().map(Profile::from_row).collect())
}

pub async fn profile_update(
    pool: &Pool,
    id: Uuid,
    name: Option<&str>,
    spec: Option<&Value>,
) -> Result<Profile> {
    let client = pool.get().await.context("failed to get db connection")?;

    let row = client
        .query_opt(
            &format!(
                r#"
                UPDATE profiles
                SET name = COALESCE($2, name), spec = COALESCE($3, spec)
                WHERE id = $1
                RETURNING {PROFILE_COLS}
                "#
            ),
            &[&id, &name, &spec],
        )
        .await
        .context("failed to update profile")?;

    row.map(|r| Profile::from_row(&r))
        .ok_or_else(|| Error::not_found("profile", id))
}
