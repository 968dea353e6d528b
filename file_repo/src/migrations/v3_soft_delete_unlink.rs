use anyhow::Result;
use async_trait::async_trait;
use sqlx::{Executor, PgConnection};

use super::migration_trait::Migration;

/// Soft-deleting a `postgres` row unlinks its large object right away, so
/// those rows never need a cleanup pass.
pub struct V3SoftDeleteUnlinkMigration {}

const SQL: &str = r#"
CREATE FUNCTION unlink_soft_deleted_large_object() RETURNS trigger AS $$
BEGIN
    IF OLD.backend = 'postgres' AND OLD.file_oid IS NOT NULL THEN
        PERFORM lo_unlink(oid) FROM pg_largeobject_metadata WHERE oid = OLD.file_oid;
        NEW.file_oid := NULL;
    END IF;
    RETURN NEW;
END;
$$ LANGUAGE plpgsql;

CREATE TRIGGER files_soft_delete_large_object
    BEFORE UPDATE OF deleted_at ON files
    FOR EACH ROW
    WHEN (OLD.deleted_at IS NULL AND NEW.deleted_at IS NOT NULL)
    EXECUTE PROCEDURE unlink_soft_deleted_large_object();
"#;

#[async_trait]
impl Migration for V3SoftDeleteUnlinkMigration {
    fn version(&self) -> i64 {
        3
    }

    fn name(&self) -> &'static str {
        "Unlink large objects on soft delete"
    }

    async fn apply(&self, conn: &mut PgConnection) -> Result<()> {
        conn.execute(sqlx::raw_sql(SQL)).await?;
        Ok(())
    }
}
