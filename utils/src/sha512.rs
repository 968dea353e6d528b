//! SHA-512 whose intermediate state can be serialized and restored.
//!
//! The serialized form is the one Go's `crypto/sha512` produces from
//! `MarshalBinary`: the magic `sha\x07`, the eight chaining words, the
//! pending block buffer padded to 128 bytes and the total input length, all
//! big-endian. Rows written by either implementation can be resumed by the
//! other.

use anyhow::{anyhow, Result};
use sha2::{
    compress512,
    digest::{consts::U128, generic_array::GenericArray},
};

const BLOCK_LEN: usize = 128;
const MAGIC: &[u8; 4] = b"sha\x07";

/// Length of a serialized state.
pub const STATE_LEN: usize = MAGIC.len() + 8 * 8 + BLOCK_LEN + 8;

/// Length of a SHA-512 digest.
pub const DIGEST_LEN: usize = 64;

const IV: [u64; 8] = [
    0x6a09e667f3bcc908,
    0xbb67ae8584caa73b,
    0x3c6ef372fe94f82b,
    0xa54ff53a5f1d36f1,
    0x510e527fade682d1,
    0x9b05688c2b3e6c1f,
    0x1f83d9abfb41bd6b,
    0x5be0cd19137e2179,
];

#[derive(Clone)]
pub struct ResumableSha512 {
    state: [u64; 8],
    buffer: [u8; BLOCK_LEN],
    buffer_len: usize,
    length: u64,
}

impl Default for ResumableSha512 {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ResumableSha512 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResumableSha512")
            .field("length", &self.length)
            .finish()
    }
}

impl ResumableSha512 {
    pub fn new() -> Self {
        Self {
            state: IV,
            buffer: [0; BLOCK_LEN],
            buffer_len: 0,
            length: 0,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Number of bytes consumed so far.
    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn update(&mut self, mut data: &[u8]) {
        self.length += data.len() as u64;

        if self.buffer_len > 0 {
            let n = (BLOCK_LEN - self.buffer_len).min(data.len());
            self.buffer[self.buffer_len..self.buffer_len + n].copy_from_slice(&data[..n]);
            self.buffer_len += n;
            data = &data[n..];
            if self.buffer_len < BLOCK_LEN {
                return;
            }
            let block = self.buffer;
            self.compress(&block);
            self.buffer_len = 0;
        }

        let mut blocks = data.chunks_exact(BLOCK_LEN);
        for block in &mut blocks {
            self.compress(block);
        }
        let rest = blocks.remainder();
        self.buffer[..rest.len()].copy_from_slice(rest);
        self.buffer_len = rest.len();
    }

    /// Digest of everything consumed so far. The hasher can keep absorbing
    /// input afterwards.
    pub fn finalize(&self) -> [u8; DIGEST_LEN] {
        let mut d = self.clone();
        let bit_len = (self.length as u128) << 3;

        let rem = (self.length % BLOCK_LEN as u64) as usize;
        let pad_len = if rem < 112 { 112 - rem } else { 240 - rem };
        let mut padding = [0u8; 2 * BLOCK_LEN];
        padding[0] = 0x80;
        d.update(&padding[..pad_len]);
        d.update(&bit_len.to_be_bytes());
        debug_assert_eq!(d.buffer_len, 0);

        let mut out = [0u8; DIGEST_LEN];
        for (chunk, word) in out.chunks_exact_mut(8).zip(d.state.iter()) {
            chunk.copy_from_slice(&word.to_be_bytes());
        }
        out
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(STATE_LEN);
        out.extend_from_slice(MAGIC);
        for word in self.state {
            out.extend_from_slice(&word.to_be_bytes());
        }
        out.extend_from_slice(&self.buffer[..self.buffer_len]);
        out.resize(out.len() + BLOCK_LEN - self.buffer_len, 0);
        out.extend_from_slice(&self.length.to_be_bytes());
        out
    }

    pub fn restore(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != STATE_LEN {
            return Err(anyhow!(
                "invalid hash state size: expected {}, got {}",
                STATE_LEN,
                bytes.len()
            ));
        }
        let (magic, rest) = bytes.split_at(MAGIC.len());
        if magic != MAGIC {
            return Err(anyhow!("invalid hash state identifier"));
        }

        let (words, rest) = rest.split_at(8 * 8);
        let mut state = [0u64; 8];
        for (word, chunk) in state.iter_mut().zip(words.chunks_exact(8)) {
            *word = u64::from_be_bytes(chunk.try_into()?);
        }

        let (block, length) = rest.split_at(BLOCK_LEN);
        let mut buffer = [0u8; BLOCK_LEN];
        buffer.copy_from_slice(block);
        let length = u64::from_be_bytes(length.try_into()?);

        Ok(Self {
            state,
            buffer,
            buffer_len: (length % BLOCK_LEN as u64) as usize,
            length,
        })
    }

    fn compress(&mut self, block: &[u8]) {
        let block = GenericArray::<u8, U128>::from_slice(block);
        compress512(&mut self.state, std::slice::from_ref(block));
    }
}

#[cfg(test)]
mod tests {
    use sha2::{Digest, Sha512};

    use super::*;

    fn reference(data: &[u8]) -> [u8; DIGEST_LEN] {
        Sha512::digest(data).into()
    }

    #[test]
    fn test_matches_sha512() {
        for size in [0usize, 1, 111, 112, 127, 128, 129, 239, 240, 256, 1000, 70_000] {
            let data: Vec<u8> = (0..size).map(|i| (i * 31 % 251) as u8).collect();
            let mut hasher = ResumableSha512::new();
            hasher.update(&data);
            assert_eq!(hasher.finalize(), reference(&data), "size {size}");
            assert_eq!(hasher.len(), size as u64);
        }
    }

    #[test]
    fn test_known_digest() {
        let mut hasher = ResumableSha512::new();
        hasher.update(b"abc");
        assert_eq!(
            hex::encode(hasher.finalize()),
            "ddaf35a193617abacc417349ae20413112e6fa4e89a97ea20a9eeee64b55d39a\
             2192992a274fc1a836ba3c23a3feebbd454d4423643ce80e2a9ac94fa54ca49f"
        );
    }

    #[test]
    fn test_resume_across_split_points() -> Result<()> {
        let data: Vec<u8> = (0..5000u32).map(|i| (i % 256) as u8).collect();
        let expected = reference(&data);

        for split in [0usize, 1, 5, 127, 128, 129, 1024, 4999, 5000] {
            let mut first = ResumableSha512::new();
            first.update(&data[..split]);
            let state = first.serialize();
            assert_eq!(state.len(), STATE_LEN);

            let mut resumed = ResumableSha512::restore(&state)?;
            assert_eq!(resumed.len(), split as u64);
            resumed.update(&data[split..]);
            assert_eq!(resumed.finalize(), expected, "split {split}");
        }
        Ok(())
    }

    #[test]
    fn test_finalize_does_not_consume() {
        let mut hasher = ResumableSha512::new();
        hasher.update(b"hello");
        assert_eq!(hasher.finalize(), reference(b"hello"));
        hasher.update(b" world");
        assert_eq!(hasher.finalize(), reference(b"hello world"));
    }

    #[test]
    fn test_restore_rejects_garbage() {
        assert!(ResumableSha512::restore(b"").is_err());
        assert!(ResumableSha512::restore(&[0u8; STATE_LEN]).is_err());

        let mut state = ResumableSha512::new().serialize();
        state.pop();
        assert!(ResumableSha512::restore(&state).is_err());
    }

    #[test]
    fn test_reset() {
        let mut hasher = ResumableSha512::new();
        hasher.update(b"data");
        hasher.reset();
        assert!(hasher.is_empty());
        assert_eq!(hasher.finalize(), reference(b""));
    }
}
