//! Helpers for tests that need a PostgreSQL server.
//!
//! Database tests run against the server named by
//! `BLOBSTORE_TEST_DATABASE_URL`, each in a database of its own, and return
//! early when it is not set.

use anyhow::Result;
use blob_store::{BlobResult, ByteStream, FileStream};
use bytes::Bytes;
use futures::{stream, StreamExt};
use sqlx::{
    postgres::{PgConnectOptions, PgPoolOptions},
    Connection,
    PgConnection,
    PgPool,
};
use uuid::Uuid;

use crate::migrations;

pub const TEST_DATABASE_URL_ENV: &str = "BLOBSTORE_TEST_DATABASE_URL";

pub struct TestDb {
    pub pool: PgPool,
    pub name: String,
}

impl TestDb {
    /// Fresh database with every migration applied.
    pub async fn create() -> Result<Option<Self>> {
        let db = Self::create_empty().await?;
        if let Some(db) = &db {
            migrations::run(&db.pool).await?;
        }
        Ok(db)
    }

    pub async fn create_empty() -> Result<Option<Self>> {
        let Ok(url) = std::env::var(TEST_DATABASE_URL_ENV) else {
            println!("{TEST_DATABASE_URL_ENV} not configured skipping test");
            return Ok(None);
        };
        let options: PgConnectOptions = url.parse()?;
        let name = format!("blobstore_test_{}", Uuid::new_v4().simple());

        let mut admin = PgConnection::connect_with(&options).await?;
        sqlx::query(&format!("CREATE DATABASE {name}"))
            .execute(&mut admin)
            .await?;
        admin.close().await?;

        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect_with(options.database(&name))
            .await?;
        Ok(Some(Self { pool, name }))
    }
}

/// Byte stream yielding `data` in chunks of `chunk_size`.
pub fn chunked(data: &[u8], chunk_size: usize) -> ByteStream<'static> {
    let chunks: Vec<BlobResult<Bytes>> = data
        .chunks(chunk_size.max(1))
        .map(|c| Ok(Bytes::copy_from_slice(c)))
        .collect();
    stream::iter(chunks).boxed()
}

pub fn bytes_of(data: &[u8]) -> ByteStream<'static> {
    chunked(data, 16 * 1024)
}

pub async fn read_all(file: FileStream) -> BlobResult<Vec<u8>> {
    let mut stream = file.into_byte_stream(None);
    let mut out = Vec::new();
    while let Some(chunk) = stream.next().await {
        out.extend_from_slice(&chunk?);
    }
    Ok(out)
}
