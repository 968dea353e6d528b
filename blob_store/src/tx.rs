use std::sync::Arc;

use sqlx::{PgPool, Postgres, Transaction};
use tokio::sync::{MappedMutexGuard, Mutex, MutexGuard};

use crate::{BlobError, BlobResult};

/// Database transaction shared between the repository, backends and open
/// streams.
///
/// Every statement takes the lock for its own duration only, so a guard must
/// not be held across a poll of a byte stream. The transaction is rolled
/// back when the last clone is dropped without a commit.
#[derive(Clone)]
pub struct DbTx {
    inner: Arc<Mutex<Option<Transaction<'static, Postgres>>>>,
}

impl DbTx {
    pub async fn begin(pool: &PgPool) -> BlobResult<Self> {
        let tx = pool.begin().await?;
        Ok(Self {
            inner: Arc::new(Mutex::new(Some(tx))),
        })
    }

    /// Begins a transaction whose statements all see one snapshot. Reads of
    /// a large object then agree with the row that named it, even when an
    /// overwrite commits in between.
    pub async fn begin_snapshot(pool: &PgPool) -> BlobResult<Self> {
        let mut tx = pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ")
            .execute(&mut *tx)
            .await?;
        Ok(Self {
            inner: Arc::new(Mutex::new(Some(tx))),
        })
    }

    /// Locks the transaction for one or more statements. Execute with
    /// `&mut **guard`.
    pub async fn lock(&self) -> BlobResult<MappedMutexGuard<'_, Transaction<'static, Postgres>>> {
        let guard = self.inner.lock().await;
        MutexGuard::try_map(guard, |tx| tx.as_mut()).map_err(|_| BlobError::TransactionClosed)
    }

    pub async fn commit(&self) -> BlobResult<()> {
        let tx = self.inner.lock().await.take();
        match tx {
            Some(tx) => Ok(tx.commit().await?),
            None => Err(BlobError::TransactionClosed),
        }
    }

    /// Rolls back the transaction. A closed transaction is left alone.
    pub async fn rollback(&self) -> BlobResult<()> {
        let tx = self.inner.lock().await.take();
        if let Some(tx) = tx {
            tx.rollback().await?;
        }
        Ok(())
    }

    pub async fn is_open(&self) -> bool {
        self.inner.lock().await.is_some()
    }

    #[cfg(test)]
    pub(crate) fn closed() -> Self {
        Self {
            inner: Arc::new(Mutex::new(None)),
        }
    }
}
