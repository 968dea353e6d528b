//! Storage backends for blob contents.
//!
//! A [`Backend`] stores the bytes of a file and records its handle (large
//! object oid or external object key) on the file's row, inside the
//! transaction the caller supplies. Backends are built once at startup from
//! configuration into a [`Backends`] set.

mod error;
pub mod objects;
pub mod postgres;
pub mod redirect;
pub mod registry;
pub mod stream;
pub mod swift;
pub mod tx;

use async_trait::async_trait;
use bytes::Bytes;
use data_model::FileInfo;
pub use error::{BlobError, BlobResult};
use futures::stream::BoxStream;
pub use registry::{parse_backend_env, BackendConfig, BackendOptions, Backends};
pub use stream::{BlobReader, FileStream, SizeOnlyReader};
pub use tx::DbTx;
use uuid::Uuid;

/// Size of the chunks readers hand out.
pub const READ_CHUNK: usize = 64 * 1024;

pub type ByteStream<'a> = BoxStream<'a, BlobResult<Bytes>>;

#[async_trait]
pub trait Backend: Send + Sync {
    /// Registered name, stored in the `backend` column.
    fn name(&self) -> &str;

    /// Writes `data` for `info` and records the new handle on its row. With
    /// `append` the bytes extend the existing `info.size` bytes of content.
    async fn put(
        &self,
        tx: &DbTx,
        info: &mut FileInfo,
        data: ByteStream<'_>,
        append: bool,
    ) -> BlobResult<()>;

    /// Opens the content for reading. With `tx_control` the stream owns the
    /// transaction and releases it on close.
    async fn open(&self, tx: DbTx, info: &FileInfo, tx_control: bool) -> BlobResult<FileStream>;

    /// Copies the content of `src` into a new object owned by `dst`.
    async fn copy(&self, tx: &DbTx, dst: &mut FileInfo, src: &FileInfo) -> BlobResult<()>;

    /// Removes the stored object. A missing object is not an error.
    async fn delete(&self, tx: Option<&DbTx>, info: &FileInfo) -> BlobResult<()>;
}

pub(crate) async fn set_external_id(tx: &DbTx, file_id: Uuid, external_id: &str) -> BlobResult<()> {
    let mut conn = tx.lock().await?;
    sqlx::query("UPDATE files SET external_id = $2 WHERE file_id = $1")
        .bind(file_id)
        .bind(external_id)
        .execute(&mut **conn)
        .await?;
    Ok(())
}
