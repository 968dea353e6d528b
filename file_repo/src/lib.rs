//! Transactional catalog of stored files.
//!
//! Every operation runs in one database transaction that the backend shares
//! for its own bookkeeping. Rows are soft-deleted and never removed; external
//! objects of overwritten or deleted files are removed after commit and, when
//! that fails, by the cleanup worker.

pub mod listing;
pub mod migrations;
pub mod testing;


use blob_store::{
    Backends,
    BlobError,
    BlobResult,
    ByteStream,
    DbTx,
    FileStream,
    SizeOnlyReader,
};
use blobstore_utils::ResumableSha512;
use chrono::{DateTime, Utc};
use data_model::{FileInfo, POSTGRES_BACKEND};
use futures::StreamExt;
use sqlx::{
    postgres::{types::Oid, PgRow},
    PgPool,
    Row,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Upper bound on insert attempts while racing other writers for a name.
const MAX_PUT_ATTEMPTS: usize = 10;

/// Upper bound on reads that find the object of an overwritten row gone.
const MAX_OPEN_ATTEMPTS: usize = 3;

const FILE_COLUMNS: &str = "file_id, name, type, size, sha512, sha512_state, backend, \
                            file_oid, external_id, created_at, updated_at";

/// A file looked up for reading.
#[derive(Debug)]
pub struct File {
    pub info: FileInfo,
    pub stream: FileStream,
}

#[derive(Clone)]
pub struct FileRepo {
    pool: PgPool,
    backends: Backends,
}

fn file_from_row(row: &PgRow) -> BlobResult<FileInfo> {
    let size: i64 = row.try_get("size")?;
    let oid: Option<Oid> = row.try_get("file_oid")?;
    let content_type: Option<String> = row.try_get("type")?;
    Ok(FileInfo {
        id: row.try_get("file_id")?,
        name: row.try_get("name")?,
        content_type: content_type.unwrap_or_default(),
        size: size as u64,
        sha512: row.try_get("sha512")?,
        sha512_state: row.try_get("sha512_state")?,
        backend: row.try_get("backend")?,
        oid: oid.map(|o| o.0),
        external_id: row.try_get("external_id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// `prefix` followed by anything, as a bound parameter rather than a
/// LIKE pattern so names may contain `%` and `_`.
const PREFIX_MATCH: &str = "left(name, length($1)) = $1";

impl FileRepo {
    pub fn new(pool: PgPool, backends: Backends) -> Self {
        Self { pool, backends }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn backends(&self) -> &Backends {
        &self.backends
    }

    async fn select_live(
        &self,
        tx: &DbTx,
        name: &str,
        for_update: bool,
    ) -> BlobResult<Option<FileInfo>> {
        let sql = format!(
            "SELECT {FILE_COLUMNS} FROM files WHERE name = $1 AND deleted_at IS NULL{}",
            if for_update { " FOR UPDATE" } else { "" }
        );
        let mut conn = tx.lock().await?;
        let row = sqlx::query(&sql)
            .bind(name)
            .fetch_optional(&mut **conn)
            .await?;
        row.as_ref().map(file_from_row).transpose()
    }

    /// Inserts a live row for `info.name` unless one exists. Returns whether
    /// the row was inserted.
    async fn insert(&self, tx: &DbTx, info: &FileInfo) -> BlobResult<bool> {
        let mut conn = tx.lock().await?;
        let inserted: Option<Uuid> = sqlx::query_scalar(
            "INSERT INTO files (file_id, name, type, size, sha512, sha512_state, backend) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (name) WHERE deleted_at IS NULL DO NOTHING \
             RETURNING file_id",
        )
        .bind(info.id)
        .bind(&info.name)
        .bind(&info.content_type)
        .bind(info.size as i64)
        .bind(&info.sha512)
        .bind(&info.sha512_state)
        .bind(&info.backend)
        .fetch_optional(&mut **conn)
        .await?;
        Ok(inserted.is_some())
    }

    /// Soft-deletes the live row for `name` and returns it.
    async fn soft_delete_name(&self, tx: &DbTx, name: &str) -> BlobResult<Vec<FileInfo>> {
        let sql = format!(
            "UPDATE files SET deleted_at = now() WHERE name = $1 AND deleted_at IS NULL \
             RETURNING {FILE_COLUMNS}"
        );
        let mut conn = tx.lock().await?;
        let rows = sqlx::query(&sql).bind(name).fetch_all(&mut **conn).await?;
        rows.iter().map(file_from_row).collect()
    }

    /// Looks up a live file. Without `body` the stream only knows the size
    /// and the backend is not contacted.
    ///
    /// The row and a large object body are read from one snapshot. An
    /// external object removed by an overwrite between the row lookup and
    /// the GET is retried against the new row.
    pub async fn get(&self, name: &str, body: bool) -> BlobResult<File> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let tx = DbTx::begin_snapshot(&self.pool).await?;
            let info = self
                .select_live(&tx, name, false)
                .await?
                .ok_or_else(|| BlobError::not_found(name))?;

            if !body {
                tx.rollback().await?;
                let stream = FileStream::Direct(Box::new(SizeOnlyReader::new(info.size)));
                return Ok(File { info, stream });
            }

            let backend = self.backends.get(&info.backend)?;
            match backend.open(tx, &info, true).await {
                Ok(stream) => return Ok(File { info, stream }),
                Err(e) if e.is_not_found() && attempt < MAX_OPEN_ATTEMPTS => {
                    debug!(name = %name, attempt, "object replaced during read, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Immediate children of `dir`, directories with a trailing `/`.
    pub async fn list(&self, dir: &str) -> BlobResult<Vec<String>> {
        let prefix = format!("{}/", listing::normalize_dir(dir));
        let names: Vec<String> = sqlx::query_scalar(&format!(
            "SELECT name FROM files WHERE deleted_at IS NULL AND {PREFIX_MATCH}"
        ))
        .bind(&prefix)
        .fetch_all(&self.pool)
        .await?;
        Ok(listing::children(dir, names))
    }

    /// Creates `dst` as a copy of `src` in the backend that holds `src`.
    /// The source row stays locked until the copy commits.
    pub async fn copy(&self, dst: &str, src: &str) -> BlobResult<FileInfo> {
        let tx = DbTx::begin(&self.pool).await?;
        let src_info = self
            .select_live(&tx, src, true)
            .await?
            .ok_or_else(|| BlobError::not_found(src))?;

        let now = Utc::now();
        let mut dst_info = FileInfo {
            id: Uuid::new_v4(),
            name: dst.to_string(),
            oid: None,
            external_id: None,
            created_at: now,
            updated_at: now,
            ..src_info.clone()
        };
        if !self.insert(&tx, &dst_info).await? {
            return Err(BlobError::Conflict {
                name: dst.to_string(),
            });
        }

        let backend = self.backends.get(&src_info.backend)?;
        backend.copy(&tx, &mut dst_info, &src_info).await?;
        tx.commit().await?;
        info!(src = %src, dst = %dst, backend = %src_info.backend, "copied file");
        Ok(dst_info)
    }

    /// Stores `data` under `name`.
    ///
    /// With `offset == 0` the content replaces any live file. With
    /// `offset > 0` the bytes are appended, and `offset` must equal the
    /// current size. The digest continues from the stored hash state, or
    /// from a re-read of the content when that state is unusable.
    pub async fn put(
        &self,
        name: &str,
        data: ByteStream<'_>,
        offset: u64,
        content_type: &str,
    ) -> BlobResult<FileInfo> {
        let tx = DbTx::begin(&self.pool).await?;
        let mut superseded: Vec<FileInfo> = Vec::new();

        let mut current = None;
        for _ in 0..MAX_PUT_ATTEMPTS {
            let candidate = FileInfo::new(name, content_type, self.backends.default_name());
            if self.insert(&tx, &candidate).await? {
                if offset > 0 {
                    return Err(BlobError::OffsetMismatch { offset, size: 0 });
                }
                current = Some(candidate);
                break;
            }
            if offset == 0 {
                superseded.extend(self.soft_delete_name(&tx, name).await?);
                continue;
            }
            if let Some(existing) = self.select_live(&tx, name, true).await? {
                if existing.size != offset {
                    return Err(BlobError::OffsetMismatch {
                        offset,
                        size: existing.size,
                    });
                }
                current = Some(existing);
                break;
            }
        }
        let mut info = current.ok_or_else(|| BlobError::Conflict {
            name: name.to_string(),
        })?;

        let append = offset > 0;
        let mut hasher = match (append, info.restore_hasher()) {
            (false, _) => ResumableSha512::new(),
            (true, Some(hasher)) => hasher,
            (true, None) => self.rehash(&tx, &info).await?,
        };

        let backend = self.backends.get(&info.backend)?;
        let previous = info.clone();
        {
            let hashed: ByteStream<'_> = Box::pin(data.inspect(|chunk| {
                if let Ok(bytes) = chunk {
                    hasher.update(bytes);
                }
            }));
            backend.put(&tx, &mut info, hashed, append).await?;
        }
        info.record_digest(&hasher);

        {
            let mut conn = tx.lock().await?;
            let updated_at: DateTime<Utc> = sqlx::query_scalar(
                "UPDATE files SET size = $2, sha512 = $3, sha512_state = $4, updated_at = now() \
                 WHERE file_id = $1 RETURNING updated_at",
            )
            .bind(info.id)
            .bind(info.size as i64)
            .bind(&info.sha512)
            .bind(&info.sha512_state)
            .fetch_one(&mut **conn)
            .await?;
            info.updated_at = updated_at;
        }
        tx.commit().await?;
        info!(name = %name, size = info.size, offset, backend = %info.backend, "stored file");

        if append && !previous.is_postgres() && previous.external_id != info.external_id {
            superseded.push(previous);
        }
        for old in superseded {
            if let Err(e) = self.delete_external(&old).await {
                warn!(name = %old.name, "failed to delete superseded object: {}", e);
            }
        }
        Ok(info)
    }

    /// Recomputes the hash state by reading the current content.
    async fn rehash(&self, tx: &DbTx, info: &FileInfo) -> BlobResult<ResumableSha512> {
        warn!(name = %info.name, size = info.size, "hash state unusable, rehashing content");
        let mut hasher = ResumableSha512::new();
        if info.size == 0 {
            return Ok(hasher);
        }
        let backend = self.backends.get(&info.backend)?;
        let stream = backend.open(tx.clone(), info, false).await?;
        let mut bytes = stream.into_byte_stream(Some(info.size));
        while let Some(chunk) = bytes.next().await {
            hasher.update(&chunk?);
        }
        if hasher.len() != info.size {
            return Err(BlobError::backend(format!(
                "read {} of {} bytes while rehashing {}",
                hasher.len(),
                info.size,
                info.name
            )));
        }
        Ok(hasher)
    }

    /// Removes the object of a soft-deleted external row and forgets its
    /// key. Rows in `postgres` are handled by the soft-delete trigger.
    pub async fn delete_external(&self, info: &FileInfo) -> BlobResult<()> {
        if info.is_postgres() || info.external_id.is_none() {
            return Ok(());
        }
        let backend = self.backends.get(&info.backend)?;
        backend.delete(None, info).await?;
        self.mark_cleaned(info.id).await
    }

    /// Soft-deletes `name` and every file below `name/`.
    pub async fn delete(&self, name: &str) -> BlobResult<()> {
        let prefix = format!("{}/", listing::normalize_dir(name));
        let sql = format!(
            "UPDATE files SET deleted_at = now() \
             WHERE deleted_at IS NULL AND (name = $2 OR {PREFIX_MATCH}) \
             RETURNING {FILE_COLUMNS}"
        );

        let tx = DbTx::begin(&self.pool).await?;
        let deleted: Vec<FileInfo> = {
            let mut conn = tx.lock().await?;
            let rows = sqlx::query(&sql)
                .bind(&prefix)
                .bind(name)
                .fetch_all(&mut **conn)
                .await?;
            rows.iter().map(file_from_row).collect::<BlobResult<_>>()?
        };
        if deleted.is_empty() {
            return Err(BlobError::not_found(name));
        }
        tx.commit().await?;
        info!(name = %name, count = deleted.len(), "deleted files");

        let mut first_error = None;
        for file in &deleted {
            if let Err(e) = self.delete_external(file).await {
                error!(name = %file.name, backend = %file.backend, "failed to delete object: {}", e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Live files outside the default backend whose name starts with
    /// `prefix`.
    pub async fn list_files_excluding_default_backend(
        &self,
        prefix: &str,
    ) -> BlobResult<Vec<FileInfo>> {
        let rows = sqlx::query(&format!(
            "SELECT {FILE_COLUMNS} FROM files \
             WHERE deleted_at IS NULL AND {PREFIX_MATCH} AND backend <> $2 ORDER BY name"
        ))
        .bind(prefix)
        .bind(self.backends.default_name())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(file_from_row).collect()
    }

    /// Tombstones whose external object has not been removed yet.
    pub async fn list_deleted_files_for_cleanup(&self) -> BlobResult<Vec<FileInfo>> {
        let rows = sqlx::query(&format!(
            "SELECT {FILE_COLUMNS} FROM files \
             WHERE deleted_at IS NOT NULL AND backend <> $1 AND external_id IS NOT NULL \
             ORDER BY deleted_at"
        ))
        .bind(POSTGRES_BACKEND)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(file_from_row).collect()
    }

    /// Re-reads a live row by id and locks it until `tx` ends. Writers to
    /// the same name wait for the lock.
    pub async fn lock_live(&self, tx: &DbTx, file_id: Uuid) -> BlobResult<Option<FileInfo>> {
        let sql = format!(
            "SELECT {FILE_COLUMNS} FROM files WHERE file_id = $1 AND deleted_at IS NULL FOR UPDATE"
        );
        let mut conn = tx.lock().await?;
        let row = sqlx::query(&sql)
            .bind(file_id)
            .fetch_optional(&mut **conn)
            .await?;
        row.as_ref().map(file_from_row).transpose()
    }

    /// Points a row at another backend, clearing the handle that belongs to
    /// the old one.
    pub async fn set_backend(&self, tx: &DbTx, file_id: Uuid, backend: &str) -> BlobResult<()> {
        let sql = if backend == POSTGRES_BACKEND {
            "UPDATE files SET backend = $2, external_id = NULL WHERE file_id = $1"
        } else {
            "UPDATE files SET backend = $2, file_oid = NULL WHERE file_id = $1"
        };
        let mut conn = tx.lock().await?;
        sqlx::query(sql)
            .bind(file_id)
            .bind(backend)
            .execute(&mut **conn)
            .await?;
        Ok(())
    }

    /// Records that a tombstone's external object is gone.
    pub async fn mark_cleaned(&self, file_id: Uuid) -> BlobResult<()> {
        sqlx::query(
            "UPDATE files SET external_id = NULL WHERE file_id = $1 AND deleted_at IS NOT NULL",
        )
        .bind(file_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
