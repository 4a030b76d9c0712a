//! Database query functions for the `roles` and `flows` registries.

use anyhow::{Context, Result};
use serde_json::Value;
use sqlx::PgPool;

use crate::models::{Flow, Role};

/// Register a role, or update its hint and description.
pub async fn upsert_role(
    pool: &PgPool,
    name: &str,
    claims_from: Option<&str>,
    description: Option<&str>,
) -> Result<Role> {
    let role = sqlx::query_as::<_, Role>(
        "INSERT INTO roles (name, claims_from, description) \
         VALUES ($1, $2, $3) \
         ON CONFLICT (name) DO UPDATE \
         SET claims_from = EXCLUDED.claims_from, \
             description = EXCLUDED.description \
         RETURNING *",
    )
    .bind(name)
    .bind(claims_from)
    .bind(description)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to upsert role {name}"))?;

    Ok(role)
}

/// Fetch a single role by name.
pub async fn get_role(pool: &PgPool, name: &str) -> Result<Option<Role>> {
    let role = sqlx::query_as::<_, Role>("SELECT * FROM roles WHERE name = $1")
        .bind(name)
        .fetch_optional(pool)
        .await
        .with_context(|| format!("failed to fetch role {name}"))?;

    Ok(role)
}

/// List all registered roles, alphabetically.
pub async fn list_roles(pool: &PgPool) -> Result<Vec<Role>> {
    let roles = sqlx::query_as::<_, Role>("SELECT * FROM roles ORDER BY name")
        .fetch_all(pool)
        .await
        .context("failed to list roles")?;

    Ok(roles)
}

/// Count registered roles. Role validation at task creation only applies
/// when this is non-zero.
pub async fn count_roles(pool: &PgPool) -> Result<i64> {
    let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM roles")
        .fetch_one(pool)
        .await
        .context("failed to count roles")?;

    Ok(row.0)
}

/// Register a flow, or replace its definition.
pub async fn upsert_flow(pool: &PgPool, name: &str, definition: &Value) -> Result<Flow> {
    let flow = sqlx::query_as::<_, Flow>(
        "INSERT INTO flows (name, definition) \
         VALUES ($1, $2) \
         ON CONFLICT (name) DO UPDATE \
         SET definition = EXCLUDED.definition \
         RETURNING *",
    )
    .bind(name)
    .bind(definition)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to upsert flow {name}"))?;

    Ok(flow)
}

/// List all registered flows, alphabetically.
pub async fn list_flows(pool: &PgPool) -> Result<Vec<Flow>> {
    let flows = sqlx::query_as::<_, Flow>("SELECT * FROM flows ORDER BY name")
        .fetch_all(pool)
        .await
        .context("failed to list flows")?;

    Ok(flows)
}
