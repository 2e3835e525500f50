//! Resumable append-only compression pipeline.
//!
//! A layer blob is produced by streaming tar bytes through this pipeline:
//!
//! ```text
//! write(b) --> content hash tee --> compressor --> outer hash tee --> sink
//! ```
//!
//! The content hash covers exactly the uncompressed bytes written; the
//! outer hash covers exactly the bytes that reached the sink. Both sizes
//! are counted at their respective ends of the pipeline.
//!
//! [`Appender::finalize`] closes the current gzip member / zstd frame
//! (the trailer is flushed *before* the outer hash is sampled) and returns
//! an [`AppenderState`] which can be persisted between build actions.
//! [`Appender::resume`] restores the hashers and counters from such a
//! state and starts a fresh frame whose output is appended to the sink;
//! because gzip members and zstd frames concatenate into valid streams,
//! a resumed append behaves as if no gap occurred.

use std::io::{self, Write};
use std::str::FromStr;

use anyhow::Result;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};

use crate::hash::{HashAlgorithm, ResumableHasher};

mod state;
pub use state::{AppenderState, AppenderStateError};
pub mod seekable;

/// A supported layer compression algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    /// gzip (one member per append session).
    #[default]
    Gzip,
    /// zstandard (one frame per append session).
    Zstd,
    /// No compression; the pipeline degenerates to a hashing tee.
    None,
}

impl CompressionAlgorithm {
    /// The canonical name used in flags and state magics.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Gzip => "gzip",
            Self::Zstd => "zstd",
            Self::None => "none",
        }
    }

    /// The OCI layer media type for this compression.
    pub fn layer_media_type(&self) -> oci_spec::image::MediaType {
        use oci_spec::image::MediaType;
        match self {
            Self::Gzip => MediaType::ImageLayerGzip,
            Self::Zstd => MediaType::ImageLayerZstd,
            Self::None => MediaType::ImageLayer,
        }
    }
}

impl std::fmt::Display for CompressionAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CompressionAlgorithm {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "gzip" => Ok(Self::Gzip),
            "zstd" => Ok(Self::Zstd),
            "none" => Ok(Self::None),
            o => anyhow::bail!("Unsupported compression algorithm: {o}"),
        }
    }
}

/// Counts and hashes everything that passes through on the way to the
/// inner writer. Sits between the compressor and the sink.
struct HashSink<W: Write> {
    inner: W,
    hasher: ResumableHasher,
    count: u64,
}

impl<W: Write> Write for HashSink<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.count += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

enum Compressor<W: Write> {
    Gzip(GzEncoder<W>),
    Zstd(zstd::stream::write::Encoder<'static, W>),
    None(W),
}

impl<W: Write> Compressor<W> {
    fn new(algorithm: CompressionAlgorithm, w: W) -> io::Result<Self> {
        Ok(match algorithm {
            CompressionAlgorithm::Gzip => {
                Self::Gzip(GzEncoder::new(w, flate2::Compression::default()))
            }
            CompressionAlgorithm::Zstd => Self::Zstd(zstd::stream::write::Encoder::new(w, 0)?),
            CompressionAlgorithm::None => Self::None(w),
        })
    }

    /// Flush the compressor trailer and hand back the sink.
    fn finish(self) -> io::Result<W> {
        match self {
            Self::Gzip(e) => e.finish(),
            Self::Zstd(e) => e.finish(),
            Self::None(w) => Ok(w),
        }
    }

    fn get_ref(&self) -> &W {
        match self {
            Self::Gzip(e) => e.get_ref(),
            Self::Zstd(e) => e.get_ref(),
            Self::None(w) => w,
        }
    }
}

impl<W: Write> Write for Compressor<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Gzip(e) => e.write(buf),
            Self::Zstd(e) => e.write(buf),
            Self::None(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Gzip(e) => e.flush(),
            Self::Zstd(e) => e.flush(),
            Self::None(w) => w.flush(),
        }
    }
}

fn poisoned() -> io::Error {
    io::Error::other("appender poisoned by an earlier frame-boundary failure")
}

/// The append-only compression pipeline.
pub struct Appender<W: Write> {
    compression: CompressionAlgorithm,
    content_hasher: ResumableHasher,
    uncompressed_size: u64,
    // Only None transiently while the frame is rotated at a boundary.
    encoder: Option<Compressor<HashSink<W>>>,
}

impl<W: Write> Appender<W> {
    /// Create a fresh pipeline writing compressed output to `sink`.
    pub fn new(
        hash: HashAlgorithm,
        compression: CompressionAlgorithm,
        sink: W,
    ) -> Result<Self> {
        let outer = HashSink {
            inner: sink,
            hasher: hash.new_hasher(),
            count: 0,
        };
        Ok(Self {
            compression,
            content_hasher: hash.new_hasher(),
            uncompressed_size: 0,
            encoder: Some(Compressor::new(compression, outer)?),
        })
    }

    /// Resume a pipeline from a previously finalized state. The sink must
    /// be positioned at the end of the previously written output; the new
    /// frame is concatenated to it.
    ///
    /// The requested hash algorithm must match the one recorded in the
    /// state; mixing algorithms is rejected here rather than producing a
    /// digest over disjoint byte ranges.
    pub fn resume(
        state: &AppenderState,
        hash: HashAlgorithm,
        compression: CompressionAlgorithm,
        sink: W,
    ) -> Result<Self> {
        if state.algorithm != hash {
            anyhow::bail!(
                "Appender state was produced with {}, not {hash}",
                state.algorithm
            );
        }
        let outer = HashSink {
            inner: sink,
            hasher: state.algorithm.restore(&state.outer_state)?,
            count: state.compressed_size,
        };
        Ok(Self {
            compression,
            content_hasher: state.algorithm.restore(&state.content_state)?,
            uncompressed_size: state.uncompressed_size,
            encoder: Some(Compressor::new(compression, outer)?),
        })
    }

    /// Uncompressed bytes written so far (including resumed history).
    pub fn uncompressed_size(&self) -> u64 {
        self.uncompressed_size
    }

    /// Compressed bytes that reached the sink so far. Note the current
    /// frame may still hold buffered data until a boundary or finalize.
    pub fn compressed_size(&self) -> io::Result<u64> {
        Ok(self.encoder.as_ref().ok_or_else(poisoned)?.get_ref().count)
    }

    /// End the current gzip member / zstd frame and start a new one.
    ///
    /// After a boundary, the sink holds a self-contained prefix: the
    /// concatenation property that makes [`Appender::resume`] work is the
    /// same one exercised here in-process.
    pub fn boundary(&mut self) -> io::Result<()> {
        let encoder = self.encoder.take().ok_or_else(poisoned)?;
        let outer = encoder.finish()?;
        self.encoder = Some(Compressor::new(self.compression, outer)?);
        Ok(())
    }

    /// Flush the compressor trailer, then snapshot hashes and counters
    /// into a persistable [`AppenderState`]. Returns the state and the
    /// sink.
    pub fn finalize(self) -> Result<(AppenderState, W)> {
        self.finalize_with_raw_suffix(&[])
    }

    /// Like [`Appender::finalize`], but appends pre-encoded bytes (a
    /// self-contained compressed member built by the caller) after the
    /// trailer. The suffix passes through the outer hash and the
    /// compressed-size counter, and stays the last bytes of the stream.
    pub(crate) fn finalize_with_raw_suffix(
        mut self,
        suffix: &[u8],
    ) -> Result<(AppenderState, W)> {
        let encoder = self.encoder.take().ok_or_else(poisoned)?;
        // Trailer must hit the outer hash before we sample it.
        let mut outer = encoder.finish()?;
        outer.write_all(suffix)?;
        let state = AppenderState {
            algorithm: self.content_hasher.algorithm(),
            outer_state: outer.hasher.snapshot(),
            outer_digest: outer.hasher.clone_digest(),
            content_state: self.content_hasher.snapshot(),
            content_digest: self.content_hasher.clone_digest(),
            compressed_size: outer.count,
            uncompressed_size: self.uncompressed_size,
        };
        Ok((state, outer.inner))
    }
}

impl<W: Write> Write for Appender<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let encoder = self.encoder.as_mut().ok_or_else(poisoned)?;
        let n = encoder.write(buf)?;
        self.content_hasher.update(&buf[..n]);
        self.uncompressed_size += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.encoder.as_mut().ok_or_else(poisoned)?.flush()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use super::*;
    use crate::hash::HashAlgorithm;

    fn decompress(algorithm: CompressionAlgorithm, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        match algorithm {
            CompressionAlgorithm::Gzip => {
                flate2::read::MultiGzDecoder::new(data)
                    .read_to_end(&mut out)
                    .unwrap();
            }
            CompressionAlgorithm::Zstd => {
                let mut d = zstd::stream::read::Decoder::new(data).unwrap();
                d.read_to_end(&mut out).unwrap();
            }
            CompressionAlgorithm::None => out.extend_from_slice(data),
        }
        out
    }

    fn roundtrip_split(algorithm: CompressionAlgorithm, first: &[u8], second: &[u8]) {
        let mut appender =
            Appender::new(HashAlgorithm::Sha256, algorithm, Vec::new()).unwrap();
        appender.write_all(first).unwrap();
        let (state, sink) = appender.finalize().unwrap();
        assert_eq!(state.uncompressed_size, first.len() as u64);
        assert_eq!(state.compressed_size, sink.len() as u64);
        assert_eq!(
            state.content_digest,
            HashAlgorithm::Sha256.digest(first)
        );
        assert_eq!(state.outer_digest, HashAlgorithm::Sha256.digest(&sink));

        // Round-trip the state through its binary encoding before resuming,
        // as a real multi-action build would.
        let state = AppenderState::decode(&state.encode()).unwrap();
        let mut appender =
            Appender::resume(&state, HashAlgorithm::Sha256, algorithm, sink).unwrap();
        appender.write_all(second).unwrap();
        let (state, sink) = appender.finalize().unwrap();

        let mut full = first.to_vec();
        full.extend_from_slice(second);
        assert_eq!(state.uncompressed_size, full.len() as u64);
        assert_eq!(state.compressed_size, sink.len() as u64);
        assert_eq!(state.content_digest, HashAlgorithm::Sha256.digest(&full));
        assert_eq!(state.outer_digest, HashAlgorithm::Sha256.digest(&sink));
        assert_eq!(decompress(algorithm, &sink), full);
    }

    #[test]
    fn test_resumed_append_gzip() {
        roundtrip_split(CompressionAlgorithm::Gzip, b"hello ", b"world");
    }

    #[test]
    fn test_resumed_append_zstd() {
        roundtrip_split(CompressionAlgorithm::Zstd, b"hello ", b"world");
    }

    #[test]
    fn test_resumed_append_none() {
        roundtrip_split(CompressionAlgorithm::None, b"hello ", b"world");
    }

    #[test]
    fn test_resume_rejects_other_algorithm() {
        let appender = Appender::new(
            HashAlgorithm::Sha256,
            CompressionAlgorithm::Gzip,
            Vec::new(),
        )
        .unwrap();
        let (state, sink) = appender.finalize().unwrap();
        assert!(Appender::resume(
            &state,
            HashAlgorithm::Sha512,
            CompressionAlgorithm::Gzip,
            sink
        )
        .is_err());
    }

    #[test]
    fn test_boundary_keeps_stream_valid() {
        let mut appender = Appender::new(
            HashAlgorithm::Sha256,
            CompressionAlgorithm::Gzip,
            Vec::new(),
        )
        .unwrap();
        appender.write_all(b"first").unwrap();
        appender.boundary().unwrap();
        appender.write_all(b"second").unwrap();
        let (state, sink) = appender.finalize().unwrap();
        assert_eq!(decompress(CompressionAlgorithm::Gzip, &sink), b"firstsecond");
        assert_eq!(
            state.content_digest,
            HashAlgorithm::Sha256.digest(b"firstsecond")
        );
    }

    quickcheck::quickcheck! {
        fn prop_split_roundtrip(first: Vec<u8>, second: Vec<u8>) -> bool {
            let mut appender = Appender::new(
                HashAlgorithm::Sha256,
                CompressionAlgorithm::Gzip,
                Vec::new(),
            )
            .unwrap();
            appender.write_all(&first).unwrap();
            let (state, sink) = appender.finalize().unwrap();
            let mut appender = Appender::resume(
                &state,
                HashAlgorithm::Sha256,
                CompressionAlgorithm::Gzip,
                sink,
            )
            .unwrap();
            appender.write_all(&second).unwrap();
            let (state, sink) = appender.finalize().unwrap();
            let mut full = first.clone();
            full.extend_from_slice(&second);
            decompress(CompressionAlgorithm::Gzip, &sink) == full
                && state.content_digest == HashAlgorithm::Sha256.digest(&full)
                && state.outer_digest == HashAlgorithm::Sha256.digest(&sink)
        }
    }
}
