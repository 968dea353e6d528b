//! Moves files stored outside the default backend into it.

use std::sync::Arc;

use anyhow::Result;
use blob_store::{BlobError, BlobResult, ByteStream, DbTx};
use data_model::FileInfo;
use file_repo::FileRepo;
use futures::StreamExt;
use tokio::{sync::Semaphore, task::JoinSet};
use tracing::{debug, error, info, warn};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MigrationReport {
    pub migrated: usize,
    pub skipped: usize,
    pub errors: usize,
}

#[derive(Clone)]
pub struct Migrator {
    repo: FileRepo,
    concurrency: usize,
    delete_source: bool,
    prefix: String,
}

impl Migrator {
    pub fn new(repo: FileRepo, concurrency: usize, delete_source: bool, prefix: &str) -> Self {
        Self {
            repo,
            concurrency: concurrency.max(1),
            delete_source,
            prefix: prefix.to_string(),
        }
    }

    pub async fn run(&self) -> Result<MigrationReport> {
        let files = self
            .repo
            .list_files_excluding_default_backend(&self.prefix)
            .await?;
        info!(
            count = files.len(),
            target = self.repo.backends().default_name(),
            prefix = %self.prefix,
            "migrating files"
        );

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();
        for file in files {
            let permit = semaphore.clone().acquire_owned().await?;
            let migrator = self.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let name = file.name.clone();
                migrator.migrate_file(file).await.map_err(|e| (name, e))
            });
        }

        let mut report = MigrationReport::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(true)) => report.migrated += 1,
                Ok(Ok(false)) => report.skipped += 1,
                Ok(Err((name, e))) => {
                    error!(name = %name, "failed to migrate file: {}", e);
                    report.errors += 1;
                }
                Err(e) => {
                    error!("migration task failed: {:?}", e);
                    report.errors += 1;
                }
            }
        }
        info!(
            migrated = report.migrated,
            skipped = report.skipped,
            errors = report.errors,
            "migration finished"
        );
        Ok(report)
    }

    /// Moves one file listed by `run`. The row is re-read under a lock, so
    /// a write that committed after the listing is carried over and later
    /// writes wait for the move. Returns false when the file was
    /// overwritten, deleted or already moved in the meantime.
    async fn migrate_file(&self, listed: FileInfo) -> BlobResult<bool> {
        let target = self.repo.backends().default_backend();

        let tx = DbTx::begin(self.repo.pool()).await?;
        let src = match self.repo.lock_live(&tx, listed.id).await? {
            Some(src) if src.backend != target.name() => src,
            _ => {
                tx.rollback().await?;
                debug!(name = %listed.name, "file changed since listing, skipping");
                return Ok(false);
            }
        };
        let source = self.repo.backends().get(&src.backend)?;
        let stream = source.open(tx.clone(), &src, false).await?;

        let mut copied = 0u64;
        let mut dst = src.clone();
        dst.backend = target.name().to_string();
        {
            let data: ByteStream<'_> =
                Box::pin(stream.into_byte_stream(Some(src.size)).inspect(|chunk| {
                    if let Ok(bytes) = chunk {
                        copied += bytes.len() as u64;
                    }
                }));
            target.put(&tx, &mut dst, data, false).await?;
        }
        if copied != src.size {
            return Err(BlobError::backend(format!(
                "copied {} of {} bytes of {}",
                copied, src.size, src.name
            )));
        }
        self.repo.set_backend(&tx, src.id, target.name()).await?;

        if self.delete_source && src.is_postgres() {
            if let Err(e) = source.delete(Some(&tx), &src).await {
                warn!(name = %src.name, "failed to delete source large object: {}", e);
            }
        }
        tx.commit().await?;
        info!(
            name = %src.name,
            from = %src.backend,
            to = target.name(),
            size = src.size,
            "migrated file"
        );

        if self.delete_source && !src.is_postgres() {
            if let Err(e) = source.delete(None, &src).await {
                warn!(name = %src.name, backend = %src.backend, "failed to delete source object: {}", e);
            }
        }
        Ok(true)
    }
}
