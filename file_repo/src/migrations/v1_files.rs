use anyhow::Result;
use async_trait::async_trait;
use sqlx::{Executor, PgConnection};

use super::migration_trait::Migration;

/// Files table with one live row per name. Hard-deleting a row unlinks its
/// large object.
pub struct V1FilesMigration {}

const SQL: &str = r#"
CREATE TABLE files (
    file_id uuid PRIMARY KEY,
    name text NOT NULL,
    type text,
    size bigint NOT NULL DEFAULT 0,
    sha512 bytea,
    sha512_state bytea,
    file_oid oid,
    created_at timestamptz NOT NULL DEFAULT now(),
    updated_at timestamptz NOT NULL DEFAULT now(),
    deleted_at timestamptz
);

CREATE UNIQUE INDEX files_name_live_idx ON files (name) WHERE deleted_at IS NULL;

CREATE FUNCTION delete_file_large_object() RETURNS trigger AS $$
BEGIN
    IF OLD.file_oid IS NOT NULL THEN
        PERFORM lo_unlink(oid) FROM pg_largeobject_metadata WHERE oid = OLD.file_oid;
    END IF;
    RETURN OLD;
END;
$$ LANGUAGE plpgsql;

CREATE TRIGGER files_delete_large_object
    AFTER DELETE ON files
    FOR EACH ROW EXECUTE PROCEDURE delete_file_large_object();
"#;

#[async_trait]
impl Migration for V1FilesMigration {
    fn version(&self) -> i64 {
        1
    }

    fn name(&self) -> &'static str {
        "Create files table"
    }

    async fn apply(&self, conn: &mut PgConnection) -> Result<()> {
        conn.execute(sqlx::raw_sql(SQL)).await?;
        Ok(())
    }
}
