//! Binary encoding of the appender state.
//!
//! Layout: ASCII magic `imgv1+compressed+<algo>\0`, four u32-be
//! length-prefixed byte slices (outer hash state, outer digest, content
//! hash state, content digest), then two u64-be values (compressed size,
//! uncompressed size). The format round-trips bit-identically between
//! build actions.

use crate::hash::{HashAlgorithm, HashValue, StateDecodeError};

const MAGIC_PREFIX: &str = "imgv1+compressed+";

/// Errors decoding a persisted appender state.
#[derive(Debug, thiserror::Error)]
pub enum AppenderStateError {
    /// The magic string did not match any known format/algorithm.
    #[error("unrecognized appender state magic")]
    BadMagic,
    /// The blob ended before the encoded structure did.
    #[error("truncated appender state")]
    Truncated,
    /// Trailing bytes after the encoded structure.
    #[error("trailing garbage after appender state")]
    TrailingData,
    /// A hash state inside the blob failed to restore.
    #[error(transparent)]
    Hash(#[from] StateDecodeError),
    /// A digest inside the blob had the wrong length.
    #[error("malformed digest in appender state")]
    BadDigest,
}

/// The persistable state of an [`super::Appender`], captured at finalize.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppenderState {
    /// Hash algorithm for both the outer and the content hash.
    pub algorithm: HashAlgorithm,
    /// Serialized mid-stream state of the outer (compressed-bytes) hash.
    pub outer_state: Vec<u8>,
    /// Digest of all compressed bytes written so far.
    pub outer_digest: HashValue,
    /// Serialized mid-stream state of the content (uncompressed) hash.
    pub content_state: Vec<u8>,
    /// Digest of all uncompressed bytes written so far.
    pub content_digest: HashValue,
    /// Total compressed bytes that reached the sink.
    pub compressed_size: u64,
    /// Total uncompressed bytes written into the pipeline.
    pub uncompressed_size: u64,
}

fn put_slice(out: &mut Vec<u8>, data: &[u8]) {
    out.extend_from_slice(&(data.len() as u32).to_be_bytes());
    out.extend_from_slice(data);
}

struct Cursor<'a>(&'a [u8]);

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], AppenderStateError> {
        if self.0.len() < n {
            return Err(AppenderStateError::Truncated);
        }
        let (head, rest) = self.0.split_at(n);
        self.0 = rest;
        Ok(head)
    }

    fn take_u32(&mut self) -> Result<u32, AppenderStateError> {
        // take() guarantees the length
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn take_u64(&mut self) -> Result<u64, AppenderStateError> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn take_slice(&mut self) -> Result<&'a [u8], AppenderStateError> {
        let len = self.take_u32()? as usize;
        self.take(len)
    }
}

impl AppenderState {
    /// Serialize into the binary on-disk format.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(MAGIC_PREFIX.as_bytes());
        out.extend_from_slice(self.algorithm.name().as_bytes());
        out.push(0);
        put_slice(&mut out, &self.outer_state);
        put_slice(&mut out, self.outer_digest.as_bytes());
        put_slice(&mut out, &self.content_state);
        put_slice(&mut out, self.content_digest.as_bytes());
        out.extend_from_slice(&self.compressed_size.to_be_bytes());
        out.extend_from_slice(&self.uncompressed_size.to_be_bytes());
        out
    }

    /// Decode from the binary on-disk format. Any structural defect is
    /// fatal; there is no best-effort recovery from a corrupt state.
    pub fn decode(data: &[u8]) -> Result<Self, AppenderStateError> {
        let rest = data
            .strip_prefix(MAGIC_PREFIX.as_bytes())
            .ok_or(AppenderStateError::BadMagic)?;
        let nul = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or(AppenderStateError::BadMagic)?;
        let algorithm: HashAlgorithm = std::str::from_utf8(&rest[..nul])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or(AppenderStateError::BadMagic)?;
        let mut cur = Cursor(&rest[nul + 1..]);
        let outer_state = cur.take_slice()?.to_vec();
        let outer_digest = cur.take_slice()?.to_vec();
        let content_state = cur.take_slice()?.to_vec();
        let content_digest = cur.take_slice()?.to_vec();
        let compressed_size = cur.take_u64()?;
        let uncompressed_size = cur.take_u64()?;
        if !cur.0.is_empty() {
            return Err(AppenderStateError::TrailingData);
        }
        // Validate the hash states eagerly so a corrupt state surfaces
        // here and not at the first resumed write.
        algorithm.restore(&outer_state)?;
        algorithm.restore(&content_state)?;
        let outer_digest = HashValue::new(algorithm, outer_digest)
            .map_err(|_| AppenderStateError::BadDigest)?;
        let content_digest = HashValue::new(algorithm, content_digest)
            .map_err(|_| AppenderStateError::BadDigest)?;
        Ok(Self {
            algorithm,
            outer_state,
            outer_digest,
            content_state,
            content_digest,
            compressed_size,
            uncompressed_size,
        })
    }
}
