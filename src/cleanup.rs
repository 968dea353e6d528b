use std::sync::Arc;

use anyhow::Result;
use file_repo::FileRepo;
use tokio::{sync::Semaphore, task::JoinSet};
use tracing::{error, info};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanupReport {
    pub deleted: usize,
    pub failed: usize,
}

/// Deletes the external objects of soft-deleted files, `concurrency` at a
/// time. Failures are logged and left for the next run.
pub async fn run(repo: &FileRepo, concurrency: usize) -> Result<CleanupReport> {
    let files = repo.list_deleted_files_for_cleanup().await?;
    info!(count = files.len(), "cleaning up deleted files");

    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut tasks = JoinSet::new();
    for file in files {
        let permit = semaphore.clone().acquire_owned().await?;
        let repo = repo.clone();
        tasks.spawn(async move {
            let _permit = permit;
            match repo.delete_external(&file).await {
                Ok(()) => {
                    info!(name = %file.name, backend = %file.backend, "deleted object");
                    true
                }
                Err(e) => {
                    error!(name = %file.name, backend = %file.backend, "failed to delete object: {}", e);
                    false
                }
            }
        });
    }

    let mut report = CleanupReport::default();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(true) => report.deleted += 1,
            Ok(false) => report.failed += 1,
            Err(e) => {
                error!("cleanup task failed: {:?}", e);
                report.failed += 1;
            }
        }
    }
    info!(deleted = report.deleted, failed = report.failed, "cleanup finished");
    Ok(report)
}
