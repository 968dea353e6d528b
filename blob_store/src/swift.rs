//! OpenStack Swift backend over the v1 authentication API.
//!
//! Reads are redirected to temp URLs signed with the account's
//! `Temp-URL-Key`, which must be configured on the account.

use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use data_model::FileInfo;
use futures::{future::BoxFuture, StreamExt};
use hmac::{Hmac, Mac};
use reqwest::{RequestBuilder, Response, StatusCode};
use sha1::Sha1;
use tokio::sync::{mpsc, RwLock};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info};
use url::Url;
use uuid::Uuid;

use crate::{
    objects::SIGNED_URL_EXPIRY,
    redirect::RedirectStream,
    registry::BackendOptions,
    set_external_id,
    stream::FileStream,
    Backend,
    BlobError,
    BlobResult,
    ByteStream,
    DbTx,
};

const AUTH_TOKEN: &str = "X-Auth-Token";
const TEMP_URL_KEY: &str = "X-Account-Meta-Temp-Url-Key";

#[derive(Debug, Clone)]
struct SwiftSession {
    storage_url: String,
    token: String,
}

pub struct SwiftBackend {
    name: String,
    client: reqwest::Client,
    auth_url: String,
    username: String,
    password: String,
    container: String,
    temp_url_key: String,
    session: RwLock<Option<SwiftSession>>,
}

impl SwiftBackend {
    /// Authenticates and checks that the container exists and that the
    /// account can sign temp URLs.
    pub async fn connect(name: &str, opts: &BackendOptions) -> BlobResult<Self> {
        let mut backend = Self {
            name: name.to_string(),
            client: reqwest::Client::new(),
            auth_url: opts.require("auth_url")?.to_string(),
            username: opts.require("username")?.to_string(),
            password: opts.require("password")?.to_string(),
            container: opts.require("container")?.to_string(),
            temp_url_key: String::new(),
            session: RwLock::new(None),
        };

        let account = backend
            .send(|s| backend.client.head(&s.storage_url))
            .await?;
        expect_success(&account, "account lookup")?;
        backend.temp_url_key = account
            .headers()
            .get(TEMP_URL_KEY)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                BlobError::config(format!("swift backend {name}: account has no temp url key"))
            })?
            .to_string();

        let container = backend
            .send(|s| backend.client.head(backend.container_url(s)))
            .await?;
        if !container.status().is_success() {
            return Err(BlobError::config(format!(
                "swift backend {}: container {} unavailable ({})",
                name,
                backend.container,
                container.status()
            )));
        }
        info!(backend = %name, container = %backend.container, "swift backend ready");
        Ok(backend)
    }

    async fn authenticate(&self) -> BlobResult<SwiftSession> {
        let res = self
            .client
            .get(&self.auth_url)
            .header("X-Auth-User", &self.username)
            .header("X-Auth-Key", &self.password)
            .send()
            .await?;
        if !res.status().is_success() {
            return Err(BlobError::config(format!(
                "swift authentication failed: {}",
                res.status()
            )));
        }
        let header = |name: &str| {
            res.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.trim_end_matches('/').to_string())
                .ok_or_else(|| BlobError::backend(format!("swift auth response missing {name}")))
        };
        let session = SwiftSession {
            storage_url: header("X-Storage-Url")?,
            token: header(AUTH_TOKEN)?,
        };
        *self.session.write().await = Some(session.clone());
        Ok(session)
    }

    async fn session(&self) -> BlobResult<SwiftSession> {
        if let Some(session) = self.session.read().await.as_ref() {
            return Ok(session.clone());
        }
        self.authenticate().await
    }

    /// Sends a request, authenticating again once if the token expired.
    async fn send<F>(&self, build: F) -> BlobResult<Response>
    where
        F: Fn(&SwiftSession) -> RequestBuilder,
    {
        let session = self.session().await?;
        let res = build(&session)
            .header(AUTH_TOKEN, &session.token)
            .send()
            .await?;
        if res.status() != StatusCode::UNAUTHORIZED {
            return Ok(res);
        }
        debug!(backend = %self.name, "swift token rejected, authenticating again");
        let session = self.authenticate().await?;
        Ok(build(&session)
            .header(AUTH_TOKEN, &session.token)
            .send()
            .await?)
    }

    fn container_url(&self, session: &SwiftSession) -> String {
        format!("{}/{}", session.storage_url, self.container)
    }

    fn object_url(&self, session: &SwiftSession, key: &str) -> String {
        format!("{}/{}/{}", session.storage_url, self.container, key)
    }

    fn temp_url(&self, session: &SwiftSession, key: &str, expires: u64) -> BlobResult<String> {
        let object_url = self.object_url(session, key);
        let path = Url::parse(&object_url)
            .map_err(|e| BlobError::backend(format!("invalid swift url {object_url}: {e}")))?
            .path()
            .to_string();
        let mut mac = Hmac::<Sha1>::new_from_slice(self.temp_url_key.as_bytes())
            .map_err(|e| BlobError::backend(format!("invalid temp url key: {e}")))?;
        mac.update(format!("GET\n{expires}\n{path}").as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());
        Ok(format!(
            "{object_url}?temp_url_sig={signature}&temp_url_expires={expires}"
        ))
    }

    pub async fn write_object(
        &self,
        data: ByteStream<'_>,
        prefix: Option<&str>,
    ) -> BlobResult<String> {
        let mut data: ByteStream<'_> = match prefix {
            Some(existing) => {
                let res = self
                    .send(|s| self.client.get(self.object_url(s, existing)))
                    .await?;
                expect_success(&res, "read for append")?;
                let head = res.bytes_stream().map(|chunk| chunk.map_err(BlobError::from));
                Box::pin(head.chain(data))
            }
            None => data,
        };

        let session = self.session().await?;
        let key = Uuid::new_v4().to_string();
        let (sender, receiver) = mpsc::channel::<BlobResult<bytes::Bytes>>(4);
        let request = self
            .client
            .put(self.object_url(&session, &key))
            .header(AUTH_TOKEN, &session.token)
            .body(reqwest::Body::wrap_stream(ReceiverStream::new(receiver)))
            .send();
        let pump = async move {
            while let Some(chunk) = data.next().await {
                let failed = chunk.is_err();
                if sender.send(chunk).await.is_err() || failed {
                    break;
                }
            }
        };
        let (res, ()) = tokio::join!(request, pump);
        let res = res?;
        if res.status() == StatusCode::UNAUTHORIZED {
            *self.session.write().await = None;
        }
        expect_success(&res, "upload")?;
        debug!(backend = %self.name, key = %key, "stored object");
        Ok(key)
    }

    pub async fn open_object(&self, key: &str) -> BlobResult<FileStream> {
        let session = self.session().await?;
        let expires = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| BlobError::backend(e.to_string()))?
            .as_secs()
            + SIGNED_URL_EXPIRY.as_secs();
        let url = self.temp_url(&session, key, expires)?;
        Ok(FileStream::Redirect(RedirectStream::new(
            self.client.clone(),
            url,
        )))
    }

    pub async fn copy_object(&self, src: &str) -> BlobResult<String> {
        let key = Uuid::new_v4().to_string();
        let source = format!("{}/{}", self.container, src);
        let res = self
            .send(|s| {
                self.client
                    .put(self.object_url(s, &key))
                    .header("X-Copy-From", &source)
                    .header(reqwest::header::CONTENT_LENGTH, 0)
            })
            .await?;
        expect_success(&res, "copy")?;
        Ok(key)
    }

    pub async fn delete_object(&self, key: &str) -> BlobResult<()> {
        let res = self
            .send(|s| self.client.delete(self.object_url(s, key)))
            .await?;
        if res.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        expect_success(&res, "delete")
    }
}

fn expect_success(res: &Response, operation: &str) -> BlobResult<()> {
    if res.status().is_success() {
        return Ok(());
    }
    Err(BlobError::backend(format!(
        "swift {} failed: {}",
        operation,
        res.status()
    )))
}

fn external_id(info: &FileInfo) -> BlobResult<&str> {
    info.external_id
        .as_deref()
        .ok_or_else(|| BlobError::not_found(format!("object for {}", info.name)))
}

#[async_trait]
impl Backend for SwiftBackend {
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
        self.open_object(external_id(info)?).await
    }

    async fn copy(&self, tx: &DbTx, dst: &mut FileInfo, src: &FileInfo) -> BlobResult<()> {
        let key = self.copy_object(external_id(src)?).await?;
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

pub fn construct(
    name: String,
    opts: BackendOptions,
) -> BoxFuture<'static, BlobResult<Arc<dyn Backend>>> {
    Box::pin(async move { Ok(Arc::new(SwiftBackend::connect(&name, &opts).await?) as Arc<dyn Backend>) })
}
