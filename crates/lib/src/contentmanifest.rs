//! The content-manifest sidecar format.
//!
//! A content manifest is a compact binary record of the blob/node/tree
//! hashes a layer produced, consumed by subsequent layers so that content
//! already stored lower in the image is not emitted again.
//!
//! Layout: ASCII magic `imgv1+contentmanifest+<algo>\0`, then a TOC of
//! three 17-byte records `(kind u8, offset u64-be, size u64-be)` for the
//! kinds `b`, `n`, `t` in that order; the header block is zero padded to
//! 128 bytes. The hash regions follow contiguously from offset 128, each
//! holding `count × hash-length` raw digest bytes in insertion order.

use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

use crate::hash::{HashAlgorithm, HashValue};
use crate::tarcas::{EntryKind, ExportSink, ImportSink, ImportSource};

const MAGIC_PREFIX: &str = "imgv1+contentmanifest+";
const HEADER_LEN: u64 = 128;
const TOC_KINDS: [u8; 3] = [b'b', b'n', b't'];

/// Errors decoding a content manifest.
#[derive(Debug, thiserror::Error)]
pub enum ManifestDecodeError {
    /// The magic string did not match.
    #[error("unrecognized content manifest magic")]
    BadMagic,
    /// The manifest was produced with a different hash algorithm.
    #[error("content manifest algorithm mismatch: expected {expected}, found {found}")]
    AlgorithmMismatch {
        /// Requested algorithm.
        expected: HashAlgorithm,
        /// Algorithm named in the magic.
        found: HashAlgorithm,
    },
    /// A TOC record had an unexpected kind byte or ordering.
    #[error("bad content manifest TOC kind byte {0:#04x}")]
    BadTocKind(u8),
    /// A region size is not a multiple of the hash length.
    #[error("content manifest region size {0} not a multiple of the hash length")]
    BadRegionSize(u64),
    /// The file ended inside a declared region.
    #[error("truncated content manifest")]
    Truncated,
    /// Underlying I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn magic_for(algorithm: HashAlgorithm) -> Vec<u8> {
    let mut m = Vec::new();
    m.extend_from_slice(MAGIC_PREFIX.as_bytes());
    m.extend_from_slice(algorithm.name().as_bytes());
    m.push(0);
    m
}

/// Serializes the three hash lists of a layer.
#[derive(Debug)]
pub struct Writer {
    algorithm: HashAlgorithm,
    lists: [Vec<HashValue>; 3],
    seen: [std::collections::HashSet<Vec<u8>>; 3],
}

impl Writer {
    /// Create an empty writer for the given algorithm.
    pub fn new(algorithm: HashAlgorithm) -> Self {
        Self {
            algorithm,
            lists: Default::default(),
            seen: Default::default(),
        }
    }

    /// Append a hash to the list for `kind`, preserving insertion order.
    /// Duplicates are dropped so the serialized lists never repeat.
    pub fn push(&mut self, kind: EntryKind, hash: &HashValue) -> Result<()> {
        if hash.algorithm() != self.algorithm {
            anyhow::bail!(
                "Cannot record {} hash in {} manifest",
                hash.algorithm(),
                self.algorithm
            );
        }
        let idx = kind as usize;
        if self.seen[idx].insert(hash.as_bytes().to_vec()) {
            self.lists[idx].push(hash.clone());
        }
        Ok(())
    }

    /// Serialize to a writer.
    #[context("Writing content manifest")]
    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        let hash_len = self.algorithm.digest_len() as u64;
        let mut header = magic_for(self.algorithm);
        let mut offset = HEADER_LEN;
        for (kind, list) in TOC_KINDS.iter().zip(&self.lists) {
            let size = list.len() as u64 * hash_len;
            header.push(*kind);
            header.extend_from_slice(&offset.to_be_bytes());
            header.extend_from_slice(&size.to_be_bytes());
            offset += size;
        }
        anyhow::ensure!(header.len() as u64 <= HEADER_LEN, "Header overflow");
        header.resize(HEADER_LEN as usize, 0);
        w.write_all(&header)?;
        for list in &self.lists {
            for hash in list {
                w.write_all(hash.as_bytes())?;
            }
        }
        Ok(())
    }
}

impl ExportSink for Writer {
    fn add(&mut self, kind: EntryKind, hash: &HashValue) -> Result<()> {
        self.push(kind, hash)
    }
}

#[derive(Debug, Clone, Copy)]
struct Region {
    offset: u64,
    size: u64,
}

/// Reads the hash lists of one content manifest.
///
/// The per-kind sequences are lazy and single pass; callers must not
/// assume restartability.
#[derive(Debug)]
pub struct Reader<R> {
    inner: R,
    algorithm: HashAlgorithm,
    regions: [Region; 3],
}

impl<R: Read + Seek> Reader<R> {
    /// Parse the header, validating the magic against the requested
    /// algorithm.
    pub fn new(mut inner: R, algorithm: HashAlgorithm) -> Result<Self, ManifestDecodeError> {
        let mut header = [0u8; HEADER_LEN as usize];
        inner
            .read_exact(&mut header)
            .map_err(|_| ManifestDecodeError::Truncated)?;
        let rest = header
            .strip_prefix(MAGIC_PREFIX.as_bytes())
            .ok_or(ManifestDecodeError::BadMagic)?;
        let nul = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or(ManifestDecodeError::BadMagic)?;
        let found: HashAlgorithm = std::str::from_utf8(&rest[..nul])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or(ManifestDecodeError::BadMagic)?;
        if found != algorithm {
            return Err(ManifestDecodeError::AlgorithmMismatch {
                expected: algorithm,
                found,
            });
        }
        let hash_len = algorithm.digest_len() as u64;
        let mut toc = &rest[nul + 1..];
        let mut regions = [Region { offset: 0, size: 0 }; 3];
        for (expected_kind, region) in TOC_KINDS.iter().zip(regions.iter_mut()) {
            if toc.len() < 17 {
                return Err(ManifestDecodeError::Truncated);
            }
            if toc[0] != *expected_kind {
                return Err(ManifestDecodeError::BadTocKind(toc[0]));
            }
            // Lengths checked just above
            let offset = u64::from_be_bytes(toc[1..9].try_into().unwrap());
            let size = u64::from_be_bytes(toc[9..17].try_into().unwrap());
            if size % hash_len != 0 {
                return Err(ManifestDecodeError::BadRegionSize(size));
            }
            *region = Region { offset, size };
            toc = &toc[17..];
        }
        Ok(Self {
            inner,
            algorithm,
            regions,
        })
    }

    /// Number of hashes recorded for `kind`.
    pub fn count(&self, kind: EntryKind) -> u64 {
        self.regions[kind as usize].size / self.algorithm.digest_len() as u64
    }

    /// Iterate the hashes of `kind` in insertion order.
    pub fn hashes(
        &mut self,
        kind: EntryKind,
    ) -> Result<impl Iterator<Item = Result<HashValue, ManifestDecodeError>> + '_, ManifestDecodeError>
    {
        let region = self.regions[kind as usize];
        let algorithm = self.algorithm;
        self.inner.seek(SeekFrom::Start(region.offset))?;
        let count = region.size / algorithm.digest_len() as u64;
        let inner = &mut self.inner;
        Ok((0..count).map(move |_| {
            let mut buf = vec![0u8; algorithm.digest_len()];
            inner
                .read_exact(&mut buf)
                .map_err(|_| ManifestDecodeError::Truncated)?;
            // Length is correct by construction
            Ok(HashValue::new(algorithm, buf).unwrap())
        }))
    }
}

/// Opens a content manifest file.
#[context("Opening content manifest {path}")]
pub fn open(
    path: &Utf8Path,
    algorithm: HashAlgorithm,
) -> Result<Reader<BufReader<std::fs::File>>> {
    let f = std::fs::File::open(path)?;
    Ok(Reader::new(BufReader::new(f), algorithm)?)
}

/// Concatenates the hash lists of a set of content manifests, optionally
/// extended by a collection file (newline-separated manifest paths).
/// Feeds a tar-CAS [`ImportSource`] so duplicates across layers are
/// skipped in output.
#[derive(Debug)]
pub struct MultiImporter {
    algorithm: HashAlgorithm,
    paths: Vec<Utf8PathBuf>,
}

impl MultiImporter {
    /// Build the importer from explicit manifest paths plus an optional
    /// collection file.
    pub fn new(
        algorithm: HashAlgorithm,
        manifests: impl IntoIterator<Item = Utf8PathBuf>,
        collection: Option<&Utf8Path>,
    ) -> Result<Self> {
        let mut paths: Vec<Utf8PathBuf> = manifests.into_iter().collect();
        if let Some(collection) = collection {
            let f = std::fs::File::open(collection)
                .with_context(|| format!("Opening manifest collection {collection}"))?;
            for line in BufReader::new(f).lines() {
                let line = line?;
                let line = line.trim();
                if !line.is_empty() {
                    paths.push(line.into());
                }
            }
        }
        Ok(Self { algorithm, paths })
    }
}

impl ImportSource for MultiImporter {
    fn visit(&mut self, sink: &mut dyn ImportSink) -> Result<()> {
        for path in &self.paths {
            let mut reader = open(path, self.algorithm)?;
            for kind in [EntryKind::Blob, EntryKind::Node, EntryKind::Tree] {
                // Collect eagerly: the sink borrow and the reader borrow
                // cannot overlap.
                let hashes: Vec<_> = reader
                    .hashes(kind)
                    .with_context(|| format!("Reading {path}"))?
                    .collect::<Result<_, _>>()
                    .with_context(|| format!("Reading {path}"))?;
                for hash in hashes {
                    sink.add(kind, hash);
                }
            }
        }
        Ok(())
    }
}
