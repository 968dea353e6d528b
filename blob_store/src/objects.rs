//! Backends on top of `object_store`: S3 (and S3-compatible stores such as
//! Minio), Google Cloud Storage, Azure Blob Storage and the local
//! filesystem.

use std::{io::SeekFrom, sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use data_model::FileInfo;
use futures::{future::BoxFuture, StreamExt};
use object_store::{
    aws::AmazonS3Builder,
    azure::MicrosoftAzureBuilder,
    gcp::GoogleCloudStorageBuilder,
    local::LocalFileSystem,
    path::Path,
    signer::Signer,
    GetOptions,
    GetRange,
    ObjectStore,
    WriteMultipart,
};
use reqwest::Method;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    redirect::RedirectStream,
    registry::BackendOptions,
    set_external_id,
    stream::{resolve_seek, BlobReader, BufferedBody, FileStream},
    Backend,
    BlobError,
    BlobResult,
    ByteStream,
    DbTx,
};

/// Lifetime of signed GET URLs.
pub const SIGNED_URL_EXPIRY: Duration = Duration::from_secs(10 * 60);

pub struct ObjectStoreBackend {
    name: String,
    store: Arc<dyn ObjectStore>,
    signer: Option<Arc<dyn Signer>>,
    client: reqwest::Client,
}

impl ObjectStoreBackend {
    /// Wraps a store. Without a signer, reads are served directly instead of
    /// through a redirect.
    pub fn new(name: &str, store: Arc<dyn ObjectStore>, signer: Option<Arc<dyn Signer>>) -> Self {
        Self {
            name: name.to_string(),
            store,
            signer,
            client: reqwest::Client::new(),
        }
    }

    pub async fn s3(name: &str, opts: &BackendOptions) -> BlobResult<Self> {
        let mut builder = AmazonS3Builder::new()
            .with_bucket_name(opts.require("bucket")?)
            .with_region(opts.get("region").unwrap_or("us-east-1"));
        if !opts.flag("ec2_role") {
            builder = builder
                .with_access_key_id(opts.require("access_key_id")?)
                .with_secret_access_key(opts.require("secret_access_key")?);
            if let Some(token) = opts.get("session_token") {
                builder = builder.with_token(token);
            }
        }
        if let Some(endpoint) = opts.get("endpoint") {
            builder = builder
                .with_endpoint(endpoint)
                .with_allow_http(endpoint.starts_with("http://"));
        }
        let store = Arc::new(builder.build()?);
        let backend = Self::new(name, store.clone(), Some(store));
        backend.validate().await?;
        Ok(backend)
    }

    pub async fn gcs(name: &str, opts: &BackendOptions) -> BlobResult<Self> {
        let store = Arc::new(
            GoogleCloudStorageBuilder::new()
                .with_bucket_name(opts.require("bucket")?)
                .with_service_account_key(opts.require("key")?)
                .build()?,
        );
        let backend = Self::new(name, store.clone(), Some(store));
        backend.validate().await?;
        Ok(backend)
    }

    pub async fn azure(name: &str, opts: &BackendOptions) -> BlobResult<Self> {
        let store = Arc::new(
            MicrosoftAzureBuilder::new()
                .with_account(opts.require("account_name")?)
                .with_access_key(opts.require("account_key")?)
                .with_container_name(opts.require("container")?)
                .build()?,
        );
        let backend = Self::new(name, store.clone(), Some(store));
        backend.validate().await?;
        Ok(backend)
    }

    pub async fn local(name: &str, opts: &BackendOptions) -> BlobResult<Self> {
        let path = opts.require("path")?;
        tokio::fs::create_dir_all(path).await?;
        let store = LocalFileSystem::new_with_prefix(path)?;
        Ok(Self::new(name, Arc::new(store), None))
    }

    /// Checks the bucket is reachable with the configured credentials.
    async fn validate(&self) -> BlobResult<()> {
        let mut listing = self.store.list(None);
        if let Some(Err(e)) = listing.next().await {
            return Err(BlobError::config(format!(
                "backend {} failed validation: {}",
                self.name, e
            )));
        }
        Ok(())
    }

    /// Uploads `data` under a fresh key, preceded by the object at `prefix`
    /// when given, and returns the key.
    pub async fn write_object(
        &self,
        data: ByteStream<'_>,
        prefix: Option<&str>,
    ) -> BlobResult<String> {
        let mut data: ByteStream<'_> = match prefix {
            Some(existing) => {
                let head = self
                    .store
                    .get(&Path::from(existing))
                    .await?
                    .into_stream()
                    .map(|chunk| chunk.map_err(BlobError::from));
                Box::pin(head.chain(data))
            }
            None => data,
        };

        let key = Uuid::new_v4().to_string();
        let path = Path::from(key.as_str());
        let upload = self.store.put_multipart(&path).await?;
        let mut writer = WriteMultipart::new(upload);
        while let Some(chunk) = data.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    if let Err(abort_err) = writer.abort().await {
                        warn!(key = %key, "failed to abort upload: {:?}", abort_err);
                    }
                    return Err(e);
                }
            };
            writer.wait_for_capacity(1).await?;
            writer.write(&chunk);
        }
        writer.finish().await?;
        debug!(backend = %self.name, key = %key, "stored object");
        Ok(key)
    }

    pub async fn open_object(&self, key: &str, size: u64) -> BlobResult<FileStream> {
        let path = Path::from(key);
        if let Some(signer) = &self.signer {
            let url = signer
                .signed_url(Method::GET, &path, SIGNED_URL_EXPIRY)
                .await?;
            return Ok(FileStream::Redirect(RedirectStream::new(
                self.client.clone(),
                url.to_string(),
            )));
        }
        let mut reader = ObjectReader {
            store: self.store.clone(),
            path,
            size,
            position: 0,
            body: None,
        };
        // A missing object surfaces here rather than mid-response.
        if size > 0 {
            reader.start().await?;
        }
        Ok(FileStream::Direct(Box::new(reader)))
    }

    pub async fn delete_object(&self, key: &str) -> BlobResult<()> {
        match self.store.delete(&Path::from(key)).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn external_id(info: &FileInfo) -> BlobResult<&str> {
    info.external_id
        .as_deref()
        .ok_or_else(|| BlobError::not_found(format!("object for {}", info.name)))
}

#[async_trait]
impl Backend for ObjectStoreBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn put(
        &self,
        tx: &DbTx,
        info: &mut FileInfo,
        data: ByteStream<'_>,
        append: bool,
    ) -> BlobResult<()> {
        let prefix = if append { info.external_id.as_deref() } else { None };
        let key = self.write_object(data, prefix).await?;
        set_external_id(tx, info.id, &key).await?;
        info.external_id = Some(key);
        Ok(())
    }

    async fn open(&self, tx: DbTx, info: &FileInfo, tx_control: bool) -> BlobResult<FileStream> {
        if tx_control {
            tx.rollback().await?;
        }
        self.open_object(external_id(info)?, info.size).await
    }

    async fn copy(&self, tx: &DbTx, dst: &mut FileInfo, src: &FileInfo) -> BlobResult<()> {
        let key = Uuid::new_v4().to_string();
        self.store
            .copy(&Path::from(external_id(src)?), &Path::from(key.as_str()))
            .await?;
        set_external_id(tx, dst.id, &key).await?;
        dst.external_id = Some(key);
        Ok(())
    }

    async fn delete(&self, _tx: Option<&DbTx>, info: &FileInfo) -> BlobResult<()> {
        match info.external_id.as_deref() {
            Some(key) => self.delete_object(key).await,
            None => Ok(()),
        }
    }
}

/// Direct reader for stores without URL signing. Seeks restart the GET
/// from the new offset.
struct ObjectReader {
    store: Arc<dyn ObjectStore>,
    path: Path,
    size: u64,
    position: u64,
    body: Option<BufferedBody>,
}

impl ObjectReader {
    /// Issues the GET for the bytes from the current position on.
    async fn start(&mut self) -> BlobResult<()> {
        let options = GetOptions {
            range: (self.position > 0).then_some(GetRange::Offset(self.position)),
            ..Default::default()
        };
        let stream = self
            .store
            .get_opts(&self.path, options)
            .await?
            .into_stream()
            .map(|chunk| chunk.map_err(BlobError::from))
            .boxed();
        self.body = Some(BufferedBody::new(stream));
        Ok(())
    }
}

#[async_trait]
impl BlobReader for ObjectReader {
    async fn read(&mut self, max: usize) -> BlobResult<Option<Bytes>> {
        if self.position >= self.size {
            return Ok(None);
        }
        if self.body.is_none() {
            self.start().await?;
        }
        let chunk = match self.body.as_mut() {
            Some(body) => body.next(max).await?,
            None => None,
        };
        if let Some(chunk) = &chunk {
            self.position += chunk.len() as u64;
        }
        Ok(chunk)
    }

    async fn seek(&mut self, pos: SeekFrom) -> BlobResult<u64> {
        let target = resolve_seek(pos, self.position, self.size)?;
        if target != self.position {
            self.body = None;
            self.position = target;
        }
        Ok(self.position)
    }

    async fn close(&mut self) -> BlobResult<()> {
        self.body = None;
        Ok(())
    }
}

pub fn construct_s3(
    name: String,
    opts: BackendOptions,
) -> BoxFuture<'static, BlobResult<Arc<dyn Backend>>> {
    Box::pin(async move { Ok(Arc::new(ObjectStoreBackend::s3(&name, &opts).await?) as Arc<dyn Backend>) })
}

pub fn construct_gcs(
    name: String,
    opts: BackendOptions,
) -> BoxFuture<'static, BlobResult<Arc<dyn Backend>>> {
    Box::pin(async move { Ok(Arc::new(ObjectStoreBackend::gcs(&name, &opts).await?) as Arc<dyn Backend>) })
}

pub fn construct_azure(
    name: String,
    opts: BackendOptions,
) -> BoxFuture<'static, BlobResult<Arc<dyn Backend>>> {
    Box::pin(async move { Ok(Arc::new(ObjectStoreBackend::azure(&name, &opts).await?) as Arc<dyn Backend>) })
}

pub fn construct_local(
    name: String,
    opts: BackendOptions,
) -> BoxFuture<'static, BlobResult<Arc<dyn Backend>>> {
    Box::pin(async move { Ok(Arc::new(ObjectStoreBackend::local(&name, &opts).await?) as Arc<dyn Backend>) })
}

#[cfg(test)]
mod tests {
    use futures::stream;
    use object_store::memory::InMemory;

    use super::*;

    fn bytes_stream(parts: &[&'static [u8]]) -> ByteStream<'static> {
        let parts: Vec<BlobResult<Bytes>> = parts
            .iter()
            .map(|p| Ok(Bytes::from_static(p)))
            .collect();
        stream::iter(parts).boxed()
    }

    async fn read_all(file: FileStream) -> BlobResult<Vec<u8>> {
        let mut stream = file.into_byte_stream(None);
        let mut out = Vec::new();
        while let Some(chunk) = stream.next().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(out)
    }

    fn memory_backend() -> ObjectStoreBackend {
        ObjectStoreBackend::new("s3", Arc::new(InMemory::new()), None)
    }

    #[tokio::test]
    async fn test_write_and_read() -> BlobResult<()> {
        let backend = memory_backend();
        let key = backend
            .write_object(bytes_stream(&[b"hello", b" ", b"world"]), None)
            .await?;
        assert!(Uuid::parse_str(&key).is_ok());

        let file = backend.open_object(&key, 11).await?;
        assert!(file.redirect_url().is_none());
        assert_eq!(read_all(file).await?, b"hello world");
        Ok(())
    }

    #[tokio::test]
    async fn test_append_writes_fresh_object() -> BlobResult<()> {
        let backend = memory_backend();
        let first = backend.write_object(bytes_stream(&[b"hello"]), None).await?;
        let second = backend
            .write_object(bytes_stream(&[b" world"]), Some(&first))
            .await?;
        assert_ne!(first, second);

        assert_eq!(read_all(backend.open_object(&second, 11).await?).await?, b"hello world");
        assert_eq!(read_all(backend.open_object(&first, 5).await?).await?, b"hello");
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_stream_aborts() {
        let backend = memory_backend();
        let parts: Vec<BlobResult<Bytes>> = vec![
            Ok(Bytes::from_static(b"partial")),
            Err(BlobError::backend("client went away")),
        ];
        let result = backend.write_object(stream::iter(parts).boxed(), None).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_seek_restarts_from_offset() -> BlobResult<()> {
        let backend = memory_backend();
        let key = backend.write_object(bytes_stream(&[b"0123456789"]), None).await?;

        let mut file = backend.open_object(&key, 10).await?;
        assert_eq!(file.seek(SeekFrom::End(0)).await?, 10);
        file.seek(SeekFrom::Start(4)).await?;
        assert_eq!(read_all(file).await?, b"456789");
        Ok(())
    }

    #[tokio::test]
    async fn test_open_fetches_before_delete() -> BlobResult<()> {
        let backend = memory_backend();
        let key = backend.write_object(bytes_stream(&[b"old body"]), None).await?;

        let file = backend.open_object(&key, 8).await?;
        backend.delete_object(&key).await?;
        assert_eq!(read_all(file).await?, b"old body");

        let missing = backend.open_object(&key, 8).await;
        assert!(matches!(missing, Err(BlobError::NotFound { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_missing_object_succeeds() -> BlobResult<()> {
        let backend = memory_backend();
        let key = backend.write_object(bytes_stream(&[b"x"]), None).await?;
        backend.delete_object(&key).await?;
        backend.delete_object(&key).await?;
        assert!(backend.store.head(&Path::from(key.as_str())).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_local_backend() -> BlobResult<()> {
        let dir = tempfile::tempdir()?;
        let opts: BackendOptions = [("path", dir.path().to_string_lossy().to_string())]
            .into_iter()
            .collect();
        let backend = ObjectStoreBackend::local("local", &opts).await?;
        assert_eq!(backend.name(), "local");

        let key = backend.write_object(bytes_stream(&[b"on disk"]), None).await?;
        assert!(dir.path().join(&key).exists());
        assert_eq!(read_all(backend.open_object(&key, 7).await?).await?, b"on disk");
        Ok(())
    }

    #[tokio::test]
    async fn test_s3_requires_credentials() {
        let opts: BackendOptions = [("bucket", "blobs")].into_iter().collect();
        let err = ObjectStoreBackend::s3("s3", &opts).await.err();
        assert!(matches!(err, Some(BlobError::Config { .. })));
    }

    #[tokio::test]
    async fn test_s3_signed_redirect() -> BlobResult<()> {
        let store = Arc::new(
            AmazonS3Builder::new()
                .with_bucket_name("blobs")
                .with_region("us-east-1")
                .with_access_key_id("AKIA")
                .with_secret_access_key("secret")
                .with_endpoint("http://127.0.0.1:9000")
                .with_allow_http(true)
                .build()?,
        );
        let backend = ObjectStoreBackend::new("s3", store.clone(), Some(store));
        let file = backend.open_object("some-key", 3).await?;
        let url = file.redirect_url().unwrap_or_default().to_string();
        assert!(url.starts_with("http://127.0.0.1:9000/blobs/some-key?"));
        assert!(url.contains("X-Amz-Expires=600"));
        Ok(())
    }
}
