use std::io::SeekFrom;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use reqwest::StatusCode;
use tracing::debug;

use crate::{
    stream::{BlobReader, BufferedBody},
    BlobError,
    BlobResult,
};

/// Read-only handle over a signed URL.
///
/// The gateway redirects clients to [`RedirectStream::redirect_url`]. Reading
/// fetches the URL on first use and streams the response body, which is what
/// in-process consumers such as the migrator rely on.
pub struct RedirectStream {
    url: String,
    client: reqwest::Client,
    body: Option<BufferedBody>,
}

impl RedirectStream {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client,
            body: None,
        }
    }

    pub fn redirect_url(&self) -> &str {
        &self.url
    }

    async fn open_body(&mut self) -> BlobResult<&mut BufferedBody> {
        if self.body.is_none() {
            debug!(url = %self.url, "fetching redirect stream");
            let res = self.client.get(&self.url).send().await?;
            if res.status() != StatusCode::OK {
                return Err(BlobError::backend(format!(
                    "unexpected status {} fetching {}",
                    res.status(),
                    self.url
                )));
            }
            let stream = res
                .bytes_stream()
                .map(|chunk| chunk.map_err(BlobError::from))
                .boxed();
            self.body = Some(BufferedBody::new(stream));
        }
        self.body
            .as_mut()
            .ok_or_else(|| BlobError::backend("redirect body unavailable"))
    }
}

#[async_trait]
impl BlobReader for RedirectStream {
    async fn read(&mut self, max: usize) -> BlobResult<Option<Bytes>> {
        self.open_body().await?.next(max).await
    }

    async fn seek(&mut self, _pos: SeekFrom) -> BlobResult<u64> {
        Err(BlobError::unsupported("seek on redirect stream"))
    }

    async fn close(&mut self) -> BlobResult<()> {
        self.body = None;
        Ok(())
    }
}
