use anyhow::Result;
use async_trait::async_trait;
use sqlx::PgConnection;

use super::migration_trait::Migration;

pub struct V4CleanupIndexMigration {}

#[async_trait]
impl Migration for V4CleanupIndexMigration {
    fn version(&self) -> i64 {
        4
    }

    fn name(&self) -> &'static str {
        "Index tombstones awaiting cleanup"
    }

    async fn apply(&self, conn: &mut PgConnection) -> Result<()> {
        sqlx::query(
            "CREATE INDEX files_cleanup_idx ON files (deleted_at)
             WHERE deleted_at IS NOT NULL AND external_id IS NOT NULL",
        )
        .execute(conn)
        .await?;
        Ok(())
    }
}
