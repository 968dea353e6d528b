use anyhow::Result;
use async_trait::async_trait;
use sqlx::{Executor, PgConnection};
use tracing::info;

use super::migration_trait::Migration;

/// Adds the backend columns. Every existing row lives in `postgres`.
pub struct V2BackendsMigration {}

#[async_trait]
impl Migration for V2BackendsMigration {
    fn version(&self) -> i64 {
        2
    }

    fn name(&self) -> &'static str {
        "Add backend and external_id columns"
    }

    async fn apply(&self, conn: &mut PgConnection) -> Result<()> {
        (&mut *conn)
            .execute(sqlx::raw_sql(
                "ALTER TABLE files ADD COLUMN backend text;
             ALTER TABLE files ADD COLUMN external_id text;",
            ))
            .await?;

        let updated = sqlx::query("UPDATE files SET backend = 'postgres'")
            .execute(&mut *conn)
            .await?
            .rows_affected();
        info!("assigned {} existing files to the postgres backend", updated);

        sqlx::query("ALTER TABLE files ALTER COLUMN backend SET NOT NULL")
            .execute(&mut *conn)
            .await?;
        Ok(())
    }
}
