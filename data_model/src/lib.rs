use base64::{engine::general_purpose::STANDARD, Engine as _};
use blobstore_utils::{sha512::DIGEST_LEN, ResumableSha512};
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Name of the database-resident backend. It is always registered.
pub const POSTGRES_BACKEND: &str = "postgres";

pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Metadata row of a stored file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub id: Uuid,
    pub name: String,
    pub content_type: String,
    pub size: u64,
    pub sha512: Option<Vec<u8>>,
    pub sha512_state: Option<Vec<u8>>,
    pub backend: String,
    /// Large object handle, set for rows stored in `postgres`.
    pub oid: Option<u32>,
    /// Object key, set for rows stored in an external backend.
    pub external_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FileInfo {
    pub fn new(name: &str, content_type: &str, backend: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            content_type: content_type.to_string(),
            size: 0,
            sha512: None,
            sha512_state: None,
            backend: backend.to_string(),
            oid: None,
            external_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_postgres(&self) -> bool {
        self.backend == POSTGRES_BACKEND
    }

    /// Base64 of the stored SHA-512, empty when no digest was recorded.
    pub fn etag(&self) -> String {
        self.sha512
            .as_deref()
            .map(|digest| STANDARD.encode(digest))
            .unwrap_or_default()
    }

    pub fn quoted_etag(&self) -> String {
        format!("\"{}\"", self.etag())
    }

    /// Resumable hasher positioned at the end of the current content, if the
    /// stored state is usable for it.
    pub fn restore_hasher(&self) -> Option<ResumableSha512> {
        let state = self.sha512_state.as_deref()?;
        let hasher = ResumableSha512::restore(state).ok()?;
        if hasher.len() != self.size {
            return None;
        }
        if let Some(digest) = self.sha512.as_deref() {
            if digest.len() == DIGEST_LEN && hasher.finalize().as_slice() != digest {
                return None;
            }
        }
        Some(hasher)
    }

    pub fn record_digest(&mut self, hasher: &ResumableSha512) {
        self.size = hasher.len();
        self.sha512 = Some(hasher.finalize().to_vec());
        self.sha512_state = Some(hasher.serialize());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_etag_is_base64_digest() {
        let mut info = FileInfo::new("/foo", DEFAULT_CONTENT_TYPE, POSTGRES_BACKEND);
        assert_eq!(info.etag(), "");

        let mut hasher = ResumableSha512::new();
        hasher.update(b"hello");
        info.record_digest(&hasher);
        assert_eq!(info.size, 5);
        assert_eq!(info.etag(), STANDARD.encode(hasher.finalize()));
        assert_eq!(info.quoted_etag(), format!("\"{}\"", info.etag()));
    }

    #[test]
    fn test_restore_hasher_checks_length() {
        let mut info = FileInfo::new("/foo", DEFAULT_CONTENT_TYPE, "s3");
        assert!(info.restore_hasher().is_none());

        let mut hasher = ResumableSha512::new();
        hasher.update(b"hello");
        info.record_digest(&hasher);
        let restored = info.restore_hasher().expect("state should restore");
        assert_eq!(restored.finalize(), hasher.finalize());

        info.size = 6;
        assert!(info.restore_hasher().is_none());

        info.size = 5;
        info.sha512_state = Some(vec![1, 2, 3]);
        assert!(info.restore_hasher().is_none());
    }
}
