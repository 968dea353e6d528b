//! Ordered schema migrations, recorded in `schema_migrations`.

pub mod migration_trait;

mod v1_files;
mod v2_backends;
mod v3_soft_delete_unlink;
mod v4_cleanup_index;
// Add new migrations mod here

use anyhow::{Context, Result};
use migration_trait::Migration;
use sqlx::PgPool;
use tracing::info;

/// Registered migrations in version order.
pub fn registry() -> Vec<Box<dyn Migration>> {
    let mut migrations: Vec<Box<dyn Migration>> = vec![
        Box::new(v1_files::V1FilesMigration {}),
        Box::new(v2_backends::V2BackendsMigration {}),
        Box::new(v3_soft_delete_unlink::V3SoftDeleteUnlinkMigration {}),
        Box::new(v4_cleanup_index::V4CleanupIndexMigration {}),
    ];
    migrations.sort_by_key(|m| m.version());
    migrations
}

pub fn latest_version() -> i64 {
    registry().last().map(|m| m.version()).unwrap_or(0)
}

/// Advisory lock key held while `schema_migrations` is created.
const CREATE_LOCK_KEY: i64 = 0x626c_6f62_7374_6f72;

/// `CREATE TABLE IF NOT EXISTS` is not safe against a concurrent create of
/// the same table, so runners take an advisory lock around it.
async fn create_migrations_table(pool: &PgPool) -> Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(CREATE_LOCK_KEY)
        .execute(&mut *tx)
        .await?;
    sqlx::query("CREATE TABLE IF NOT EXISTS schema_migrations (id bigint PRIMARY KEY)")
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(())
}

/// Applies every migration not yet recorded. Concurrent runners serialize
/// on an exclusive lock of `schema_migrations`.
pub async fn run(pool: &PgPool) -> Result<Vec<i64>> {
    create_migrations_table(pool)
        .await
        .context("creating schema_migrations")?;

    let mut applied = Vec::new();
    for migration in registry() {
        let version = migration.version();
        let mut tx = pool.begin().await?;
        sqlx::query("LOCK TABLE schema_migrations IN ACCESS EXCLUSIVE MODE")
            .execute(&mut *tx)
            .await?;

        let existing: Option<i64> =
            sqlx::query_scalar("SELECT id FROM schema_migrations WHERE id = $1")
                .bind(version)
                .fetch_optional(&mut *tx)
                .await?;
        if existing.is_some() {
            tx.rollback().await?;
            continue;
        }

        info!(
            "Running migration {}: v{} → v{}",
            migration.name(),
            version - 1,
            version
        );
        migration
            .apply(&mut *tx)
            .await
            .with_context(|| format!("Applying migration to v{version}"))?;

        sqlx::query("INSERT INTO schema_migrations (id) VALUES ($1)")
            .bind(version)
            .execute(&mut *tx)
            .await?;
        sqlx::query("SELECT pg_notify('schema_migrations', $1)")
            .bind(version.to_string())
            .execute(&mut *tx)
            .await?;
        tx.commit()
            .await
            .with_context(|| format!("Committing migration to v{version}"))?;
        applied.push(version);
    }

    if applied.is_empty() {
        info!("Database already at version {}. No migrations needed.", latest_version());
    } else {
        info!("Completed migrations {:?}", applied);
    }
    Ok(applied)
}
