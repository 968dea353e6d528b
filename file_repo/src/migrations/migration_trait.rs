use anyhow::Result;
use async_trait::async_trait;
use sqlx::PgConnection;

/// A forward-only schema migration.
#[async_trait]
pub trait Migration: Send + Sync {
    /// Identifier recorded in `schema_migrations` once applied.
    fn version(&self) -> i64;

    /// Name for logging purposes
    fn name(&self) -> &'static str;

    /// Runs the migration inside the transaction that records it.
    async fn apply(&self, conn: &mut PgConnection) -> Result<()>;
}
