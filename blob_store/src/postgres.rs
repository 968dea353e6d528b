//! Blob contents stored as PostgreSQL large objects next to the metadata.
//!
//! All large object calls run on the caller's transaction, so the content
//! commits or rolls back together with the row that references it.

use std::io::SeekFrom;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use data_model::{FileInfo, POSTGRES_BACKEND};
use futures::StreamExt;
use sqlx::postgres::types::Oid;
use tracing::debug;
use uuid::Uuid;

use crate::{
    stream::{resolve_seek, BlobReader, FileStream},
    Backend,
    BlobError,
    BlobResult,
    ByteStream,
    DbTx,
    READ_CHUNK,
};

const INV_WRITE: i32 = 0x0002_0000;
const INV_READ: i32 = 0x0004_0000;
const SEEK_SET: i32 = 0;

/// Writes are batched to this size before calling `lowrite`.
const WRITE_CHUNK: usize = 1024 * 1024;

#[derive(Debug, Default)]
pub struct PostgresBackend {}

impl PostgresBackend {
    pub fn new() -> Self {
        Self {}
    }
}

async fn lo_create(tx: &DbTx) -> BlobResult<Oid> {
    let mut conn = tx.lock().await?;
    let oid: Oid = sqlx::query_scalar("SELECT lo_create(0)")
        .fetch_one(&mut **conn)
        .await?;
    Ok(oid)
}

async fn lo_open(tx: &DbTx, oid: Oid, mode: i32) -> BlobResult<i32> {
    let mut conn = tx.lock().await?;
    let fd: i32 = sqlx::query_scalar("SELECT lo_open($1, $2)")
        .bind(oid)
        .bind(mode)
        .fetch_one(&mut **conn)
        .await?;
    Ok(fd)
}

async fn lo_seek(tx: &DbTx, fd: i32, offset: u64) -> BlobResult<u64> {
    let mut conn = tx.lock().await?;
    let pos: i64 = sqlx::query_scalar("SELECT lo_lseek64($1, $2, $3)")
        .bind(fd)
        .bind(offset as i64)
        .bind(SEEK_SET)
        .fetch_one(&mut **conn)
        .await?;
    Ok(pos as u64)
}

async fn lo_read(tx: &DbTx, fd: i32, len: usize) -> BlobResult<Vec<u8>> {
    let mut conn = tx.lock().await?;
    let data: Vec<u8> = sqlx::query_scalar("SELECT loread($1, $2)")
        .bind(fd)
        .bind(len as i32)
        .fetch_one(&mut **conn)
        .await?;
    Ok(data)
}

async fn lo_write(tx: &DbTx, fd: i32, data: &[u8]) -> BlobResult<()> {
    let mut conn = tx.lock().await?;
    let written: i32 = sqlx::query_scalar("SELECT lowrite($1, $2)")
        .bind(fd)
        .bind(data)
        .fetch_one(&mut **conn)
        .await?;
    if written as usize != data.len() {
        return Err(BlobError::backend(format!(
            "short large object write: {} of {} bytes",
            written,
            data.len()
        )));
    }
    Ok(())
}

async fn lo_close(tx: &DbTx, fd: i32) -> BlobResult<()> {
    let mut conn = tx.lock().await?;
    sqlx::query("SELECT lo_close($1)")
        .bind(fd)
        .execute(&mut **conn)
        .await?;
    Ok(())
}

async fn set_file_oid(tx: &DbTx, file_id: Uuid, oid: Option<Oid>) -> BlobResult<()> {
    let mut conn = tx.lock().await?;
    sqlx::query("UPDATE files SET file_oid = $2 WHERE file_id = $1")
        .bind(file_id)
        .bind(oid)
        .execute(&mut **conn)
        .await?;
    Ok(())
}

#[async_trait]
impl Backend for PostgresBackend {
    fn name(&self) -> &str {
        POSTGRES_BACKEND
    }

    async fn put(
        &self,
        tx: &DbTx,
        info: &mut FileInfo,
        mut data: ByteStream<'_>,
        append: bool,
    ) -> BlobResult<()> {
        let oid = match (append, info.oid) {
            (true, Some(oid)) => Oid(oid),
            _ => {
                let oid = lo_create(tx).await?;
                set_file_oid(tx, info.id, Some(oid)).await?;
                info.oid = Some(oid.0);
                oid
            }
        };

        let fd = lo_open(tx, oid, INV_WRITE).await?;
        if append && info.size > 0 {
            lo_seek(tx, fd, info.size).await?;
        }

        let mut buf = BytesMut::with_capacity(WRITE_CHUNK);
        while let Some(chunk) = data.next().await {
            buf.extend_from_slice(&chunk?);
            if buf.len() >= WRITE_CHUNK {
                lo_write(tx, fd, &buf.split()).await?;
            }
        }
        if !buf.is_empty() {
            lo_write(tx, fd, &buf).await?;
        }
        lo_close(tx, fd).await
    }

    async fn open(&self, tx: DbTx, info: &FileInfo, tx_control: bool) -> BlobResult<FileStream> {
        let oid = info
            .oid
            .ok_or_else(|| BlobError::not_found(format!("large object for {}", info.name)))?;
        let fd = lo_open(&tx, Oid(oid), INV_READ).await?;
        Ok(FileStream::Direct(Box::new(LargeObjectReader {
            tx,
            fd: Some(fd),
            size: info.size,
            position: 0,
            fd_position: 0,
            tx_control,
        })))
    }

    async fn copy(&self, tx: &DbTx, dst: &mut FileInfo, src: &FileInfo) -> BlobResult<()> {
        let src_oid = src
            .oid
            .ok_or_else(|| BlobError::not_found(format!("large object for {}", src.name)))?;
        let dst_oid = lo_create(tx).await?;
        let src_fd = lo_open(tx, Oid(src_oid), INV_READ).await?;
        let dst_fd = lo_open(tx, dst_oid, INV_WRITE).await?;
        loop {
            let data = lo_read(tx, src_fd, WRITE_CHUNK).await?;
            if data.is_empty() {
                break;
            }
            lo_write(tx, dst_fd, &data).await?;
        }
        lo_close(tx, src_fd).await?;
        lo_close(tx, dst_fd).await?;

        set_file_oid(tx, dst.id, Some(dst_oid)).await?;
        dst.oid = Some(dst_oid.0);
        Ok(())
    }

    async fn delete(&self, tx: Option<&DbTx>, info: &FileInfo) -> BlobResult<()> {
        let tx = tx.ok_or_else(|| BlobError::unsupported("large object delete outside a transaction"))?;
        let Some(oid) = info.oid else {
            return Ok(());
        };
        {
            let mut conn = tx.lock().await?;
            sqlx::query(
                "SELECT lo_unlink(oid) FROM pg_largeobject_metadata WHERE oid = $1",
            )
            .bind(Oid(oid))
            .execute(&mut **conn)
            .await?;
        }
        debug!(file = %info.name, oid, "unlinked large object");
        set_file_oid(tx, info.id, None).await
    }
}

/// Reader over a large object descriptor.
///
/// Seeks only move the logical position; the descriptor is repositioned
/// before the next read, so seeking to the end costs no round-trip.
pub struct LargeObjectReader {
    tx: DbTx,
    fd: Option<i32>,
    size: u64,
    position: u64,
    fd_position: u64,
    tx_control: bool,
}

#[async_trait]
impl BlobReader for LargeObjectReader {
    async fn read(&mut self, max: usize) -> BlobResult<Option<Bytes>> {
        let fd = self.fd.ok_or_else(|| BlobError::unsupported("read on closed large object"))?;
        if self.position >= self.size || max == 0 {
            return Ok(None);
        }
        if self.fd_position != self.position {
            self.fd_position = lo_seek(&self.tx, fd, self.position).await?;
        }
        let want = max.min(READ_CHUNK).min((self.size - self.position) as usize);
        let data = lo_read(&self.tx, fd, want).await?;
        if data.is_empty() {
            return Ok(None);
        }
        self.position += data.len() as u64;
        self.fd_position = self.position;
        Ok(Some(Bytes::from(data)))
    }

    async fn seek(&mut self, pos: SeekFrom) -> BlobResult<u64> {
        self.position = resolve_seek(pos, self.position, self.size)?;
        Ok(self.position)
    }

    async fn close(&mut self) -> BlobResult<()> {
        if let Some(fd) = self.fd.take() {
            lo_close(&self.tx, fd).await?;
        }
        if self.tx_control {
            self.tx.rollback().await?;
        }
        Ok(())
    }
}
