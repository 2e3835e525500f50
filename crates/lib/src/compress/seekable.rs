//! Seekable (eStargz-style) layer output.
//!
//! The writer sits *under* the tar layer: it parses the tar stream it is
//! given, starts a fresh gzip member before every entry header, and
//! records per-entry offsets. At finalize it appends a table-of-contents
//! entry (`stargz.index.json`) inside the tar, then the standard 51-byte
//! eStargz footer whose extra field carries the TOC member offset. The
//! TOC and footer bytes pass through the outer hash and the
//! compressed-size counter like any other output.
//!
//! A SOCI-style span table is maintained as a side product: one
//! checkpoint per member boundary, each a (compressed offset,
//! uncompressed offset) pair, serializable as a compact "zinfo" blob for
//! lazy-pulling indexes.

use std::collections::HashMap;
use std::io::{self, Write};

use anyhow::{Context, Result};
use serde::Serialize;

use super::{Appender, AppenderState, CompressionAlgorithm};
use crate::hash::HashAlgorithm;

/// Annotation carrying the digest of the TOC JSON.
pub const TOC_DIGEST_ANNOTATION: &str = "containerd.io/snapshot/stargz/toc.digest";

/// Name of the TOC entry inside the layer tar.
pub const TOC_ENTRY_NAME: &str = "stargz.index.json";

/// Size of the fixed eStargz footer gzip member.
pub const FOOTER_SIZE: usize = 51;

const BLOCK: usize = 512;

#[derive(Debug, Serialize)]
struct Toc {
    version: u32,
    entries: Vec<TocEntry>,
}

/// One record of the layer table of contents.
#[derive(Debug, Clone, Serialize)]
pub struct TocEntry {
    /// Path of the entry inside the layer.
    pub name: String,
    /// Entry kind: `reg`, `dir`, `symlink`, `hardlink`, `char`, `block`,
    /// `fifo`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Payload size in bytes.
    #[serde(skip_serializing_if = "is_zero")]
    pub size: u64,
    /// Offset in the compressed stream of the member holding the entry.
    pub offset: u64,
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

/// One span checkpoint of the SOCI-style index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    /// Offset into the compressed stream of a member boundary.
    pub compressed_offset: u64,
    /// Uncompressed offset corresponding to it.
    pub uncompressed_offset: u64,
}

/// The span table ("zinfo") accumulated by a [`SeekableWriter`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ZinfoTable {
    /// Checkpoints in stream order.
    pub spans: Vec<Span>,
}

impl ZinfoTable {
    /// Serialize as u32-be count followed by (u64-be, u64-be) pairs.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.spans.len() * 16);
        out.extend_from_slice(&(self.spans.len() as u32).to_be_bytes());
        for s in &self.spans {
            out.extend_from_slice(&s.compressed_offset.to_be_bytes());
            out.extend_from_slice(&s.uncompressed_offset.to_be_bytes());
        }
        out
    }
}

/// Everything produced by [`SeekableWriter::finalize`] besides the plain
/// appender state.
#[derive(Debug)]
pub struct SeekableOutput {
    /// OCI annotations to attach to the layer descriptor.
    pub annotations: HashMap<String, String>,
    /// The SOCI-style span table.
    pub zinfo: ZinfoTable,
}

enum ParseState {
    /// The next block is a header (or part of the trailer).
    Header,
    /// Inside an entry payload; `remaining` includes the padding up to
    /// the block boundary.
    Payload { remaining: u64 },
}

fn entry_kind(header: &tar::Header) -> &'static str {
    use tar::EntryType;
    match header.entry_type() {
        EntryType::Directory => "dir",
        EntryType::Symlink => "symlink",
        EntryType::Link => "hardlink",
        EntryType::Char => "char",
        EntryType::Block => "block",
        EntryType::Fifo => "fifo",
        _ => "reg",
    }
}

/// Parse the `path=` record out of a PAX extended header payload.
fn pax_path_override(payload: &[u8]) -> Option<String> {
    let mut rest = payload;
    while !rest.is_empty() {
        let space = rest.iter().position(|&b| b == b' ')?;
        let len: usize = std::str::from_utf8(&rest[..space]).ok()?.parse().ok()?;
        let record = rest.get(space + 1..len.checked_sub(1)?)?;
        if let Some(value) = record.strip_prefix(b"path=") {
            return String::from_utf8(value.to_vec()).ok();
        }
        rest = rest.get(len..)?;
    }
    None
}

/// A tar-parsing gzip writer producing an eStargz-compatible layer.
pub struct SeekableWriter<W: Write> {
    appender: Appender<W>,
    state: ParseState,
    partial: Vec<u8>,
    entries: Vec<TocEntry>,
    spans: Vec<Span>,
    /// Path override from a preceding PAX (`x`) or GNU longname (`L`)
    /// entry, applied to the next regular header.
    name_override: Option<String>,
    /// Payload capture for `x`/`L` entries; the flag marks a GNU
    /// longname.
    capture: Option<(bool, Vec<u8>)>,
    trailer_seen: bool,
}

impl<W: Write> SeekableWriter<W> {
    /// Create a seekable pipeline. Only gzip layers can carry the
    /// eStargz footer; other compression algorithms are rejected.
    pub fn new(
        hash: HashAlgorithm,
        compression: CompressionAlgorithm,
        sink: W,
    ) -> Result<Self> {
        if compression != CompressionAlgorithm::Gzip {
            anyhow::bail!("Seekable output requires gzip, not {compression}");
        }
        Ok(Self {
            appender: Appender::new(hash, compression, sink)?,
            state: ParseState::Header,
            partial: Vec::with_capacity(BLOCK),
            entries: Vec::new(),
            spans: vec![Span {
                compressed_offset: 0,
                uncompressed_offset: 0,
            }],
            name_override: None,
            capture: None,
            trailer_seen: false,
        })
    }

    fn handle_header_block(&mut self, block: &[u8]) -> io::Result<()> {
        if block.iter().all(|&b| b == 0) {
            // Trailer begins; we write our own after the TOC entry.
            self.trailer_seen = true;
            return Ok(());
        }
        // Member boundary in front of every entry header. The stream
        // start is already a boundary; don't emit an empty member there.
        if self.appender.uncompressed_size() > 0 {
            self.appender.boundary()?;
        }
        let compressed_offset = self.appender.compressed_size()?;
        let span = Span {
            compressed_offset,
            uncompressed_offset: self.appender.uncompressed_size(),
        };
        if self.spans.last() != Some(&span) {
            self.spans.push(span);
        }

        let header = tar::Header::from_byte_slice(block);
        let size = header.entry_size().unwrap_or(0);
        let padded = size.div_ceil(BLOCK as u64) * BLOCK as u64;

        match header.entry_type() {
            ty @ (tar::EntryType::XHeader | tar::EntryType::GNULongName) => {
                // Metadata for the following entry; capture the payload
                // instead of recording a TOC row.
                self.capture = Some((
                    ty == tar::EntryType::GNULongName,
                    Vec::with_capacity(size as usize),
                ));
            }
            ty => {
                let name = match self.name_override.take() {
                    Some(n) => n,
                    None => header
                        .path()
                        .map(|p| p.display().to_string())
                        .unwrap_or_default(),
                };
                let payload_size = if ty == tar::EntryType::Regular || ty == tar::EntryType::Continuous {
                    size
                } else {
                    0
                };
                self.entries.push(TocEntry {
                    name,
                    kind: entry_kind(&header),
                    size: payload_size,
                    offset: compressed_offset,
                });
            }
        }

        self.appender.write_all(block)?;
        if padded > 0 {
            self.state = ParseState::Payload { remaining: padded };
        }
        Ok(())
    }

    fn finish_capture(&mut self) {
        if let Some((longname, buf)) = self.capture.take() {
            self.name_override = if longname {
                // GNU longname payload is the raw name, NUL terminated.
                let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
                String::from_utf8(buf[..end].to_vec()).ok()
            } else {
                pax_path_override(&buf)
            };
        }
    }

    /// Append the TOC entry and the footer, then finalize the pipeline.
    pub fn finalize(mut self) -> Result<(AppenderState, SeekableOutput, W)> {
        // The TOC is itself an entry and lives in its own member.
        self.appender.boundary()?;
        let toc_offset = self.appender.compressed_size()?;
        self.spans.push(Span {
            compressed_offset: toc_offset,
            uncompressed_offset: self.appender.uncompressed_size(),
        });

        let toc = Toc {
            version: 1,
            entries: std::mem::take(&mut self.entries),
        };
        let toc_json = serde_json::to_vec(&toc).context("Serializing TOC")?;
        let toc_digest = HashAlgorithm::Sha256.digest(&toc_json);

        let mut header = tar::Header::new_ustar();
        header
            .set_path(TOC_ENTRY_NAME)
            .context("TOC entry name")?;
        header.set_size(toc_json.len() as u64);
        header.set_mode(0o444);
        header.set_entry_type(tar::EntryType::Regular);
        header.set_cksum();
        self.appender.write_all(header.as_bytes())?;
        self.appender.write_all(&toc_json)?;
        let pad = toc_json.len().next_multiple_of(BLOCK) - toc_json.len();
        self.appender.write_all(&vec![0u8; pad])?;
        // Tar stream trailer.
        self.appender.write_all(&[0u8; 2 * BLOCK])?;

        let (state, sink) = self
            .appender
            .finalize_with_raw_suffix(&estargz_footer(toc_offset))?;

        let mut annotations = HashMap::new();
        annotations.insert(TOC_DIGEST_ANNOTATION.to_string(), toc_digest.to_string());
        let output = SeekableOutput {
            annotations,
            zinfo: ZinfoTable { spans: self.spans },
        };
        Ok((state, output, sink))
    }
}

impl<W: Write> Write for SeekableWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let consumed = buf.len();
        let mut buf = buf;
        while !buf.is_empty() {
            match &mut self.state {
                ParseState::Header => {
                    if self.trailer_seen {
                        // Swallow the caller's trailer blocks.
                        break;
                    }
                    let need = BLOCK - self.partial.len();
                    let take = need.min(buf.len());
                    self.partial.extend_from_slice(&buf[..take]);
                    buf = &buf[take..];
                    if self.partial.len() == BLOCK {
                        let block = std::mem::replace(&mut self.partial, Vec::with_capacity(BLOCK));
                        self.handle_header_block(&block)?;
                    }
                }
                ParseState::Payload { remaining } => {
                    let take = (*remaining).min(buf.len() as u64) as usize;
                    if let Some((_, capture)) = &mut self.capture {
                        capture.extend_from_slice(&buf[..take]);
                    }
                    self.appender.write_all(&buf[..take])?;
                    *remaining -= take as u64;
                    buf = &buf[take..];
                    if *remaining == 0 {
                        self.finish_capture();
                        self.state = ParseState::Header;
                    }
                }
            }
        }
        Ok(consumed)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.appender.flush()
    }
}

/// The fixed 51-byte eStargz footer: an empty gzip member whose extra
/// field is `%016xSTARGZ`, the offset of the TOC member.
fn estargz_footer(toc_offset: u64) -> [u8; FOOTER_SIZE] {
    let mut f = [0u8; FOOTER_SIZE];
    // gzip header: magic, deflate, FEXTRA, zero mtime, XFL 0, OS unknown
    f[0] = 0x1f;
    f[1] = 0x8b;
    f[2] = 0x08;
    f[3] = 0x04;
    f[9] = 0xff;
    // XLEN, then subfield SI1='S' SI2='G', LEN=22, payload
    f[10..12].copy_from_slice(&26u16.to_le_bytes());
    f[12] = b'S';
    f[13] = b'G';
    f[14..16].copy_from_slice(&22u16.to_le_bytes());
    let payload = format!("{toc_offset:016x}STARGZ");
    f[16..38].copy_from_slice(payload.as_bytes());
    // Final empty stored deflate block
    f[38] = 0x01;
    f[41] = 0xff;
    f[42] = 0xff;
    // CRC32 and ISIZE of the empty payload are all zero
    f
}
