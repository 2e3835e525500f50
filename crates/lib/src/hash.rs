//! Hash values and resumable hashers.
//!
//! Layer construction can be split across multiple build actions, so every
//! digest computed while streaming a layer must be able to pause and
//! resume: a hasher's internal state serializes to an opaque byte string
//! and restores into a fresh hasher of the same algorithm. The state blob
//! carries a one-byte algorithm tag so that mixing algorithms is rejected
//! at decode time rather than producing a wrong digest.

use std::fmt::{self, Display};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::digest::common::hazmat::{SerializableState, SerializedState};
use sha2::{Digest as _, Sha256, Sha512};

/// Errors decoding serialized hasher state.
#[derive(Debug, thiserror::Error)]
pub enum StateDecodeError {
    /// The state blob was produced by a different hash algorithm.
    #[error("hash state algorithm mismatch: expected {expected}, found tag {found:#04x}")]
    AlgorithmMismatch {
        /// The algorithm the caller asked to restore into.
        expected: HashAlgorithm,
        /// The tag byte found in the state blob.
        found: u8,
    },
    /// The state blob is truncated or otherwise malformed.
    #[error("malformed hash state: expected {expected} bytes, found {found}")]
    Malformed {
        /// Expected serialized length (tag byte excluded).
        expected: usize,
        /// Actual length found.
        found: usize,
    },
    /// The state bytes failed the algorithm's internal validation.
    #[error("invalid hash state for {0}")]
    Invalid(HashAlgorithm),
}

/// A supported digest algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    /// SHA-256, the default for all OCI output.
    Sha256,
    /// SHA-512.
    Sha512,
}

impl HashAlgorithm {
    const SHA256_TAG: u8 = 1;
    const SHA512_TAG: u8 = 2;

    /// The lowercase name as used in textual digests (`sha256:...`).
    pub fn name(&self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Sha512 => "sha512",
        }
    }

    /// Length in bytes of a digest produced by this algorithm.
    pub fn digest_len(&self) -> usize {
        match self {
            Self::Sha256 => 32,
            Self::Sha512 => 64,
        }
    }

    fn state_tag(&self) -> u8 {
        match self {
            Self::Sha256 => Self::SHA256_TAG,
            Self::Sha512 => Self::SHA512_TAG,
        }
    }

    /// Create a fresh hasher.
    pub fn new_hasher(&self) -> ResumableHasher {
        let inner = match self {
            Self::Sha256 => HasherInner::Sha256(Sha256::new()),
            Self::Sha512 => HasherInner::Sha512(Sha512::new()),
        };
        ResumableHasher { inner }
    }

    /// Restore a hasher from a state blob previously produced by
    /// [`ResumableHasher::snapshot`].
    pub fn restore(&self, state: &[u8]) -> Result<ResumableHasher, StateDecodeError> {
        let (&tag, body) = state
            .split_first()
            .ok_or(StateDecodeError::Malformed { expected: 1, found: 0 })?;
        if tag != self.state_tag() {
            return Err(StateDecodeError::AlgorithmMismatch {
                expected: *self,
                found: tag,
            });
        }
        let inner = match self {
            Self::Sha256 => HasherInner::Sha256(restore_typed::<Sha256>(*self, body)?),
            Self::Sha512 => HasherInner::Sha512(restore_typed::<Sha512>(*self, body)?),
        };
        Ok(ResumableHasher { inner })
    }

    /// One-shot digest of a byte slice.
    pub fn digest(&self, data: &[u8]) -> HashValue {
        let mut h = self.new_hasher();
        h.update(data);
        h.finalize()
    }
}

impl Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for HashAlgorithm {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "sha256" => Ok(Self::Sha256),
            "sha512" => Ok(Self::Sha512),
            o => anyhow::bail!("Unsupported hash algorithm: {o}"),
        }
    }
}

fn restore_typed<H>(algorithm: HashAlgorithm, body: &[u8]) -> Result<H, StateDecodeError>
where
    H: SerializableState,
{
    let expected = SerializedState::<H>::default().as_slice().len();
    if body.len() != expected {
        return Err(StateDecodeError::Malformed {
            expected,
            found: body.len(),
        });
    }
    let state = SerializedState::<H>::clone_from_slice(body);
    H::deserialize(&state).map_err(|_| StateDecodeError::Invalid(algorithm))
}

#[derive(Clone)]
enum HasherInner {
    Sha256(Sha256),
    Sha512(Sha512),
}

/// A digest computation whose internal state can be serialized at any
/// point and later restored, reproducing the exact mid-stream state.
#[derive(Clone)]
pub struct ResumableHasher {
    inner: HasherInner,
}

impl std::fmt::Debug for ResumableHasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResumableHasher")
            .field("algorithm", &self.algorithm())
            .finish()
    }
}

impl ResumableHasher {
    /// The algorithm of this hasher.
    pub fn algorithm(&self) -> HashAlgorithm {
        match &self.inner {
            HasherInner::Sha256(_) => HashAlgorithm::Sha256,
            HasherInner::Sha512(_) => HashAlgorithm::Sha512,
        }
    }

    /// Feed bytes into the hash.
    pub fn update(&mut self, data: &[u8]) {
        match &mut self.inner {
            HasherInner::Sha256(h) => h.update(data),
            HasherInner::Sha512(h) => h.update(data),
        }
    }

    /// Serialize the internal state. The result restores via
    /// [`HashAlgorithm::restore`].
    pub fn snapshot(&self) -> Vec<u8> {
        let mut out = vec![self.algorithm().state_tag()];
        match &self.inner {
            HasherInner::Sha256(h) => out.extend_from_slice(h.serialize().as_slice()),
            HasherInner::Sha512(h) => out.extend_from_slice(h.serialize().as_slice()),
        }
        out
    }

    /// The digest of everything written so far, without consuming the
    /// hasher (a clone is finalized).
    pub fn clone_digest(&self) -> HashValue {
        self.clone().finalize()
    }

    /// Consume the hasher, producing the digest.
    pub fn finalize(self) -> HashValue {
        let algorithm = self.algorithm();
        let bytes = match self.inner {
            HasherInner::Sha256(h) => h.finalize().to_vec(),
            HasherInner::Sha512(h) => h.finalize().to_vec(),
        };
        HashValue { algorithm, bytes }
    }
}

impl std::io::Write for ResumableHasher {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// An algorithm plus digest bytes. Equality is bytewise; the textual
/// form is `algo:hex`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HashValue {
    algorithm: HashAlgorithm,
    bytes: Vec<u8>,
}

impl HashValue {
    /// Construct from raw digest bytes; the length must match the
    /// algorithm.
    pub fn new(algorithm: HashAlgorithm, bytes: Vec<u8>) -> anyhow::Result<Self> {
        if bytes.len() != algorithm.digest_len() {
            anyhow::bail!(
                "Invalid {algorithm} digest length {} (expected {})",
                bytes.len(),
                algorithm.digest_len()
            );
        }
        Ok(Self { algorithm, bytes })
    }

    /// The digest algorithm.
    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    /// The raw digest bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// The digest as lowercase hex, without the algorithm prefix.
    pub fn to_hex(&self) -> String {
        hex::encode(&self.bytes)
    }
}

impl Display for HashValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.to_hex())
    }
}

impl fmt::Debug for HashValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HashValue({self})")
    }
}

impl FromStr for HashValue {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let (algo, hex_part) = s
            .split_once(':')
            .ok_or_else(|| anyhow::anyhow!("Missing ':' in digest {s}"))?;
        let algorithm: HashAlgorithm = algo.parse()?;
        let bytes = hex::decode(hex_part)
            .map_err(|e| anyhow::anyhow!("Invalid hex in digest {s}: {e}"))?;
        Self::new(algorithm, bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ABC_SHA256: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";

    #[test]
    fn test_digest() {
        let h = HashAlgorithm::Sha256.digest(b"abc");
        assert_eq!(h.to_hex(), ABC_SHA256);
        assert_eq!(h.to_string(), format!("sha256:{ABC_SHA256}"));
    }

    #[test]
    fn test_parse_roundtrip() {
        let h: HashValue = format!("sha256:{ABC_SHA256}").parse().unwrap();
        assert_eq!(h.algorithm(), HashAlgorithm::Sha256);
        assert_eq!(h, HashAlgorithm::Sha256.digest(b"abc"));
        assert!("sha256".parse::<HashValue>().is_err());
        assert!("md5:abcd".parse::<HashValue>().is_err());
        // Wrong digest length
        assert!("sha256:abcd".parse::<HashValue>().is_err());
    }

    #[test]
    fn test_snapshot_restore() {
        let mut h = HashAlgorithm::Sha256.new_hasher();
        h.update(b"hello ");
        let state = h.snapshot();
        let mut resumed = HashAlgorithm::Sha256.restore(&state).unwrap();
        resumed.update(b"world");
        assert_eq!(
            resumed.finalize(),
            HashAlgorithm::Sha256.digest(b"hello world")
        );
        // The original hasher is unaffected by the snapshot.
        h.update(b"world");
        assert_eq!(h.finalize(), HashAlgorithm::Sha256.digest(b"hello world"));
    }

    #[test]
    fn test_restore_rejects_mixed_algorithms() {
        let h = HashAlgorithm::Sha256.new_hasher();
        let state = h.snapshot();
        let err = HashAlgorithm::Sha512.restore(&state).unwrap_err();
        assert!(matches!(err, StateDecodeError::AlgorithmMismatch { .. }));
    }

    #[test]
    fn test_restore_rejects_truncated() {
        let mut state = HashAlgorithm::Sha256.new_hasher().snapshot();
        state.truncate(state.len() - 1);
        assert!(matches!(
            HashAlgorithm::Sha256.restore(&state),
            Err(StateDecodeError::Malformed { .. })
        ));
        assert!(matches!(
            HashAlgorithm::Sha256.restore(&[]),
            Err(StateDecodeError::Malformed { .. })
        ));
    }

    #[test]
    fn test_clone_digest_is_nondestructive() {
        let mut h = HashAlgorithm::Sha512.new_hasher();
        h.update(b"abc");
        let first = h.clone_digest();
        h.update(b"def");
        let second = h.clone_digest();
        assert_ne!(first, second);
        assert_eq!(second, HashAlgorithm::Sha512.digest(b"abcdef"));
    }
}
