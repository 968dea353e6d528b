//! Readable handles returned by `Backend::open`.

use std::io::SeekFrom;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{stream::BoxStream, StreamExt};

use crate::{redirect::RedirectStream, BlobError, BlobResult, ByteStream, READ_CHUNK};

/// Sequential reader over a stored blob.
#[async_trait]
pub trait BlobReader: Send {
    /// Reads at most `max` bytes. `None` marks the end of the blob.
    async fn read(&mut self, max: usize) -> BlobResult<Option<Bytes>>;

    /// Moves the read position and returns the new absolute offset.
    async fn seek(&mut self, pos: SeekFrom) -> BlobResult<u64>;

    /// Releases descriptors, bodies and, when owned, the transaction.
    async fn close(&mut self) -> BlobResult<()>;
}

/// Stream handed out by a backend: either bytes served by this process or a
/// signed URL the client should be redirected to.
pub enum FileStream {
    Direct(Box<dyn BlobReader>),
    Redirect(RedirectStream),
}

impl std::fmt::Debug for FileStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FileStream::Direct(_) => f.write_str("FileStream::Direct"),
            FileStream::Redirect(r) => write!(f, "FileStream::Redirect({})", r.redirect_url()),
        }
    }
}

impl FileStream {
    pub fn redirect_url(&self) -> Option<&str> {
        match self {
            FileStream::Direct(_) => None,
            FileStream::Redirect(r) => Some(r.redirect_url()),
        }
    }

    pub async fn seek(&mut self, pos: SeekFrom) -> BlobResult<u64> {
        match self {
            FileStream::Direct(r) => r.seek(pos).await,
            FileStream::Redirect(r) => r.seek(pos).await,
        }
    }

    pub fn into_reader(self) -> Box<dyn BlobReader> {
        match self {
            FileStream::Direct(r) => r,
            FileStream::Redirect(r) => Box::new(r),
        }
    }

    /// Converts the reader into a byte stream yielding at most `limit`
    /// bytes. The reader is closed after the last chunk; on error it is
    /// dropped, which releases an owned transaction by rollback.
    pub fn into_byte_stream(self, limit: Option<u64>) -> ByteStream<'static> {
        let mut reader = self.into_reader();
        Box::pin(async_stream::stream! {
            let mut remaining = limit;
            loop {
                let want = match remaining {
                    Some(0) => break,
                    Some(n) => n.min(READ_CHUNK as u64) as usize,
                    None => READ_CHUNK,
                };
                match reader.read(want).await {
                    Ok(Some(chunk)) => {
                        if let Some(r) = remaining.as_mut() {
                            *r -= chunk.len() as u64;
                        }
                        yield Ok(chunk);
                    }
                    Ok(None) => break,
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                }
            }
            if let Err(e) = reader.close().await {
                yield Err(e);
            }
        })
    }
}

/// Reader that only knows the size of a blob. Used to answer HEAD without
/// touching the backend.
pub struct SizeOnlyReader {
    size: u64,
    position: u64,
}

impl SizeOnlyReader {
    pub fn new(size: u64) -> Self {
        Self { size, position: 0 }
    }
}

#[async_trait]
impl BlobReader for SizeOnlyReader {
    async fn read(&mut self, _max: usize) -> BlobResult<Option<Bytes>> {
        Err(BlobError::unsupported("read on size-only stream"))
    }

    async fn seek(&mut self, pos: SeekFrom) -> BlobResult<u64> {
        self.position = resolve_seek(pos, self.position, self.size)?;
        Ok(self.position)
    }

    async fn close(&mut self) -> BlobResult<()> {
        Ok(())
    }
}

pub(crate) fn resolve_seek(pos: SeekFrom, current: u64, size: u64) -> BlobResult<u64> {
    let target = match pos {
        SeekFrom::Start(n) => Some(n),
        SeekFrom::Current(delta) => current.checked_add_signed(delta),
        SeekFrom::End(delta) => size.checked_add_signed(delta),
    };
    target.ok_or_else(|| BlobError::unsupported("seek before start of blob"))
}

/// Chunked body with leftover handling, so readers can honor `max`.
pub(crate) struct BufferedBody {
    stream: BoxStream<'static, BlobResult<Bytes>>,
    pending: Bytes,
}

impl BufferedBody {
    pub(crate) fn new(stream: BoxStream<'static, BlobResult<Bytes>>) -> Self {
        Self {
            stream,
            pending: Bytes::new(),
        }
    }

    pub(crate) async fn next(&mut self, max: usize) -> BlobResult<Option<Bytes>> {
        while self.pending.is_empty() {
            match self.stream.next().await {
                Some(chunk) => self.pending = chunk?,
                None => return Ok(None),
            }
        }
        let n = max.min(self.pending.len());
        Ok(Some(self.pending.split_to(n)))
    }
}
