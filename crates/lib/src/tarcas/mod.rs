//! Content-addressed tar writer.
//!
//! Every regular file routed through this writer is stored exactly once,
//! at a canonical path derived from its hash, and every user-visible
//! occurrence is materialized as a tar hardlink pointing at the canonical
//! entry. Three canonical namespaces exist:
//!
//! - `.cas/blob/<hex>`: content-addressed regular files with canonical
//!   metadata (mode rwxr-xr-x, zero owner/time). Identity is the content
//!   hash.
//! - `.cas/node/<hex>`: regular files whose metadata is significant.
//!   Identity is the hash of the normalized header concatenated with the
//!   content hash, so identical bytes under different modes yield
//!   distinct entries.
//! - `.cas/tree/<hex>`: directory subtrees named by their merkle root,
//!   with regular children deduplicated through the blob namespace.
//!
//! Deduplication also works across layers: [`TarCas::import`] preloads
//! the hash sets from the content manifests of lower layers, so entries
//! already present in the image are skipped here and the hardlinks
//! resolve against the lower layer at extraction time.

use std::collections::HashSet;
use std::io::{Read, Write};

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

use crate::hash::{HashAlgorithm, HashValue};
use crate::treehash;

mod header;
pub(crate) use header::{
    blob_header, cas_dir_header, hardlink_header, is_blob_shaped, strip_writer_records,
};
pub use header::PaxRecords;

/// Canonical path prefix for blob entries.
pub const BLOB_PREFIX: &str = ".cas/blob/";
/// Canonical path prefix for node entries.
pub const NODE_PREFIX: &str = ".cas/node/";
/// Canonical path prefix for tree entries.
pub const TREE_PREFIX: &str = ".cas/tree/";

/// The kind of a CAS entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    /// Content-addressed regular file.
    Blob = 0,
    /// Metadata-bearing regular file.
    Node = 1,
    /// Directory subtree.
    Tree = 2,
}

/// Receives hashes during an import.
pub trait ImportSink {
    /// Record one hash as already present in a lower layer.
    fn add(&mut self, kind: EntryKind, hash: HashValue);
}

/// A supplier of previously exported hash sets (content manifests of
/// lower layers).
pub trait ImportSource {
    /// Feed every hash to the sink.
    fn visit(&mut self, sink: &mut dyn ImportSink) -> Result<()>;
}

/// Receives the accumulated hash lists during an export.
pub trait ExportSink {
    /// Record one emitted hash. Called in insertion order per kind.
    fn add(&mut self, kind: EntryKind, hash: &HashValue) -> Result<()>;
}

/// How non-CAS entries are interleaved with CAS entries in the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StructuralMode {
    /// All CAS entries first; directories, symlinks, and hardlink
    /// materializations are staged in memory and written at close.
    #[default]
    CasFirst,
    /// Entries are written in the order received.
    Intertwined,
    /// Only CAS entries are written; everything else is dropped.
    CasOnly,
}

/// The canonical path of a blob entry.
pub fn blob_path(hash: &HashValue) -> Utf8PathBuf {
    format!("{BLOB_PREFIX}{}", hash.to_hex()).into()
}

/// The canonical path of a node entry.
pub fn node_path(hash: &HashValue) -> Utf8PathBuf {
    format!("{NODE_PREFIX}{}", hash.to_hex()).into()
}

/// The canonical path of a tree root.
pub fn tree_path(hash: &HashValue) -> Utf8PathBuf {
    format!("{TREE_PREFIX}{}", hash.to_hex()).into()
}

struct Pending {
    path: Utf8PathBuf,
    header: tar::Header,
    pax: PaxRecords,
    size: u64,
    buf: Vec<u8>,
}

struct Staged {
    path: Utf8PathBuf,
    header: tar::Header,
    pax: PaxRecords,
    link: Option<Utf8PathBuf>,
}

/// Wraps a reader to count how many bytes were actually produced.
struct CountingReader<R> {
    inner: R,
    count: u64,
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count += n as u64;
        Ok(n)
    }
}

/// The content-addressed tar writer. Single threaded by construction:
/// one writer per output tar.
pub struct TarCas<W: Write> {
    out: tar::Builder<W>,
    algorithm: HashAlgorithm,
    mode: StructuralMode,
    /// Hashes emitted into this tar, in insertion order per kind.
    emitted: [Vec<HashValue>; 3],
    /// Hashes known present: emitted here or imported from lower layers.
    present: [HashSet<Vec<u8>>; 3],
    /// Non-CAS entries staged for close (CAS-first mode). Bounded by the
    /// entry count of the layer; expected tens of thousands at most.
    staged: Vec<Staged>,
    pending: Option<Pending>,
    closed: bool,
}

impl<W: Write> TarCas<W> {
    /// Create a writer emitting tar data to `out`.
    pub fn new(out: W, algorithm: HashAlgorithm, mode: StructuralMode) -> Self {
        Self {
            out: tar::Builder::new(out),
            algorithm,
            mode,
            emitted: Default::default(),
            present: Default::default(),
            staged: Vec::new(),
            pending: None,
            closed: false,
        }
    }

    /// The hash algorithm used for entry identities.
    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    /// Whether a hash is known present (emitted here or imported).
    pub fn contains(&self, kind: EntryKind, hash: &HashValue) -> bool {
        self.present[kind as usize].contains(hash.as_bytes())
    }

    /// Begin an entry, mirroring the streaming tar writer contract: a
    /// regular entry's payload must be fully supplied via
    /// [`TarCas::write_data`] before the next header.
    ///
    /// Regular entries are buffered whole and classified on completion;
    /// other entry types are routed according to the structural mode.
    pub fn write_header(
        &mut self,
        path: &Utf8Path,
        header: &tar::Header,
        pax: PaxRecords,
    ) -> Result<()> {
        self.commit_pending()?;
        let path = img_utils::require_relative(path)?;
        // Directory entries conventionally arrive with a trailing slash;
        // canonical form without it, re-added at emission.
        let path = Utf8Path::new(path.as_str().trim_end_matches('/'));
        use tar::EntryType;
        match header.entry_type() {
            EntryType::Regular | EntryType::Continuous => {
                let size = header.size().context("Reading entry size")?;
                self.pending = Some(Pending {
                    path: path.to_owned(),
                    header: header.clone(),
                    pax,
                    size,
                    buf: Vec::with_capacity(size.min(1 << 20) as usize),
                });
                if size == 0 {
                    self.commit_pending()?;
                }
            }
            _ => {
                let link = match header.link_name().context("Reading link name")? {
                    Some(l) => Some(
                        Utf8Path::from_path(&l)
                            .with_context(|| format!("Non-UTF-8 link target for {path}"))?
                            .to_owned(),
                    ),
                    None => None,
                };
                self.route_structural(Staged {
                    path: path.to_owned(),
                    header: header.clone(),
                    pax,
                    link,
                })?;
            }
        }
        Ok(())
    }

    /// Supply payload bytes for the entry opened by the last
    /// [`TarCas::write_header`]. The entry commits once the declared
    /// size has been received.
    pub fn write_data(&mut self, data: &[u8]) -> Result<()> {
        let pending = self
            .pending
            .as_mut()
            .context("write_data without an open regular entry")?;
        anyhow::ensure!(
            pending.buf.len() as u64 + data.len() as u64 <= pending.size,
            "Payload for {} exceeds declared size {}",
            pending.path,
            pending.size
        );
        pending.buf.extend_from_slice(data);
        if pending.buf.len() as u64 == pending.size {
            self.commit_pending()?;
        }
        Ok(())
    }

    fn commit_pending(&mut self) -> Result<()> {
        let Some(p) = self.pending.take() else {
            return Ok(());
        };
        anyhow::ensure!(
            p.buf.len() as u64 == p.size,
            "Short payload for {}: got {} of {} bytes",
            p.path,
            p.buf.len(),
            p.size
        );
        let content_hash = self.algorithm.digest(&p.buf);
        let cas_path = if header::is_blob_shaped(&p.header, &p.pax) {
            self.ensure_blob(&content_hash, &p.buf)?;
            blob_path(&content_hash)
        } else {
            let mut identity = header::normalized_header_bytes(&p.header, &p.pax);
            identity.extend_from_slice(content_hash.as_bytes());
            let node_hash = self.algorithm.digest(&identity);
            self.ensure_node(&node_hash, &p.header, &p.pax, &p.buf)?;
            node_path(&node_hash)
        };
        if p.path != cas_path {
            self.route_structural(Staged {
                path: p.path,
                header: hardlink_header(),
                pax: PaxRecords::new(),
                link: Some(cas_path),
            })?;
        }
        Ok(())
    }

    /// Pure CAS insert from an arbitrary reader. Returns the canonical
    /// path, the content hash, and the size.
    pub fn store(&mut self, reader: &mut dyn Read) -> Result<(Utf8PathBuf, HashValue, u64)> {
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).context("Reading blob")?;
        let hash = self.algorithm.digest(&buf);
        let size = buf.len() as u64;
        self.ensure_blob(&hash, &buf)?;
        Ok((blob_path(&hash), hash, size))
    }

    /// CAS insert where the caller asserts the hash and size, skipping
    /// the hashing pass and buffering. The reader must produce exactly
    /// `size` bytes.
    #[context("Storing blob with known hash")]
    pub fn store_known_hash_and_size(
        &mut self,
        reader: &mut dyn Read,
        hash: &HashValue,
        size: u64,
    ) -> Result<Utf8PathBuf> {
        let path = blob_path(hash);
        if self.contains(EntryKind::Blob, hash) {
            return Ok(path);
        }
        let mut counting = CountingReader {
            inner: reader.take(size),
            count: 0,
        };
        let mut h = blob_header(size);
        self.out
            .append_data(&mut h, &path, &mut counting)
            .with_context(|| format!("Writing {path}"))?;
        anyhow::ensure!(
            counting.count == size,
            "Blob {hash} ended after {} of {size} bytes",
            counting.count
        );
        self.record(EntryKind::Blob, hash);
        Ok(path)
    }

    /// Store a metadata-bearing regular file as a node entry. Returns
    /// the canonical path and the node hash.
    pub fn store_node(
        &mut self,
        reader: &mut dyn Read,
        header: &tar::Header,
        pax: PaxRecords,
    ) -> Result<(Utf8PathBuf, HashValue)> {
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).context("Reading node payload")?;
        let content_hash = self.algorithm.digest(&buf);
        let mut identity = header::normalized_header_bytes(header, &pax);
        identity.extend_from_slice(content_hash.as_bytes());
        let node_hash = self.algorithm.digest(&identity);
        self.ensure_node(&node_hash, header, &pax, &buf)?;
        Ok((node_path(&node_hash), node_hash))
    }

    /// Store a directory subtree as a tree artifact, returning the path
    /// of the tree root and the merkle root hash.
    pub fn store_tree(&mut self, dir: &Utf8Path) -> Result<(Utf8PathBuf, HashValue)> {
        let scan = treehash::scan(dir, self.algorithm)?;
        let root = scan.root.clone();
        let path = self.store_scanned_tree(&root, scan)?;
        Ok((path, root))
    }

    /// Like [`TarCas::store_tree`] with a caller-asserted root hash (an
    /// upstream cache already computed the subtree identity).
    pub fn store_tree_known_hash(
        &mut self,
        dir: &Utf8Path,
        hash: &HashValue,
    ) -> Result<Utf8PathBuf> {
        if self.contains(EntryKind::Tree, hash) {
            return Ok(tree_path(hash));
        }
        let scan = treehash::scan(dir, self.algorithm)?;
        self.store_scanned_tree(hash, scan)
    }

    #[context("Storing tree")]
    fn store_scanned_tree(
        &mut self,
        root: &HashValue,
        scan: treehash::TreeScan,
    ) -> Result<Utf8PathBuf> {
        let root_path = tree_path(root);
        if self.contains(EntryKind::Tree, root) {
            return Ok(root_path);
        }
        let mut h = cas_dir_header();
        self.out
            .append_data(&mut h, format!("{root_path}/"), &mut std::io::empty())
            .with_context(|| format!("Writing {root_path}"))?;
        for dir in &scan.dirs {
            let mut h = cas_dir_header();
            let path = root_path.join(dir);
            self.out
                .append_data(&mut h, format!("{path}/"), &mut std::io::empty())
                .with_context(|| format!("Writing {path}"))?;
        }
        for file in &scan.files {
            let data = std::fs::read(&file.host)
                .with_context(|| format!("Reading {}", file.host))?;
            self.ensure_blob(&file.hash, &data)?;
            let mut h = hardlink_header();
            let path = root_path.join(&file.rel);
            self.out
                .append_link(&mut h, &path, blob_path(&file.hash))
                .with_context(|| format!("Linking {path}"))?;
        }
        self.record(EntryKind::Tree, root);
        Ok(root_path)
    }

    fn ensure_blob(&mut self, hash: &HashValue, data: &[u8]) -> Result<()> {
        if self.contains(EntryKind::Blob, hash) {
            return Ok(());
        }
        let path = blob_path(hash);
        let mut h = blob_header(data.len() as u64);
        self.out
            .append_data(&mut h, &path, data)
            .with_context(|| format!("Writing {path}"))?;
        self.record(EntryKind::Blob, hash);
        Ok(())
    }

    fn ensure_node(
        &mut self,
        node_hash: &HashValue,
        header: &tar::Header,
        pax: &PaxRecords,
        data: &[u8],
    ) -> Result<()> {
        if self.contains(EntryKind::Node, node_hash) {
            return Ok(());
        }
        let path = node_path(node_hash);
        let significant = strip_writer_records(pax);
        if !significant.is_empty() {
            self.out.append_pax_extensions(
                significant.iter().map(|(k, v)| (k.as_str(), v.as_slice())),
            )?;
        }
        let mut h = header.clone();
        h.set_size(data.len() as u64);
        self.out
            .append_data(&mut h, &path, data)
            .with_context(|| format!("Writing {path}"))?;
        self.record(EntryKind::Node, node_hash);
        Ok(())
    }

    fn record(&mut self, kind: EntryKind, hash: &HashValue) {
        if self.present[kind as usize].insert(hash.as_bytes().to_vec()) {
            self.emitted[kind as usize].push(hash.clone());
        }
    }

    fn route_structural(&mut self, entry: Staged) -> Result<()> {
        match self.mode {
            StructuralMode::CasOnly => Ok(()),
            StructuralMode::Intertwined => self.emit_structural(entry),
            StructuralMode::CasFirst => {
                self.staged.push(entry);
                Ok(())
            }
        }
    }

    fn emit_structural(&mut self, entry: Staged) -> Result<()> {
        let Staged {
            path,
            mut header,
            pax,
            link,
        } = entry;
        let significant = strip_writer_records(&pax);
        if !significant.is_empty() {
            self.out.append_pax_extensions(
                significant.iter().map(|(k, v)| (k.as_str(), v.as_slice())),
            )?;
        }
        match link {
            Some(target) => self
                .out
                .append_link(&mut header, &path, &target)
                .with_context(|| format!("Linking {path} -> {target}"))?,
            None => {
                // Directory names conventionally carry a trailing slash.
                let name = if header.entry_type() == tar::EntryType::Directory {
                    format!("{path}/")
                } else {
                    path.to_string()
                };
                self.out
                    .append_data(&mut header, name, &mut std::io::empty())
                    .with_context(|| format!("Writing {path}"))?
            }
        }
        Ok(())
    }

    /// Preload the "already present" hash sets from prior content
    /// manifests; matching entries will be skipped in output.
    pub fn import(&mut self, source: &mut dyn ImportSource) -> Result<()> {
        source.visit(self)
    }

    /// Emit the accumulated per-kind hash lists, in insertion order.
    /// Imported hashes are not included: they belong to the manifest of
    /// the layer that emitted them.
    pub fn export(&self, sink: &mut dyn ExportSink) -> Result<()> {
        for kind in [EntryKind::Blob, EntryKind::Node, EntryKind::Tree] {
            for hash in &self.emitted[kind as usize] {
                sink.add(kind, hash)?;
            }
        }
        Ok(())
    }

    /// Write the staged non-CAS entries and the tar footer.
    #[context("Closing tar")]
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        anyhow::ensure!(
            self.pending.is_none(),
            "Cannot close with an incomplete regular entry pending"
        );
        for entry in std::mem::take(&mut self.staged) {
            self.emit_structural(entry)?;
        }
        self.out.finish().context("Writing tar footer")?;
        self.closed = true;
        Ok(())
    }

    /// Consume the writer, returning the underlying output. The tar must
    /// have been closed.
    pub fn into_inner(mut self) -> Result<W> {
        self.close()?;
        Ok(self.out.into_inner()?)
    }
}

impl<W: Write> ImportSink for TarCas<W> {
    fn add(&mut self, kind: EntryKind, hash: HashValue) {
        self.present[kind as usize].insert(hash.as_bytes().to_vec());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CollectExport(Vec<(EntryKind, HashValue)>);
    impl ExportSink for CollectExport {
        fn add(&mut self, kind: EntryKind, hash: &HashValue) -> Result<()> {
            self.0.push((kind, hash.clone()));
            Ok(())
        }
    }

    struct FixedImport(Vec<(EntryKind, HashValue)>);
    impl ImportSource for FixedImport {
        fn visit(&mut self, sink: &mut dyn ImportSink) -> Result<()> {
            for (kind, hash) in self.0.drain(..) {
                sink.add(kind, hash);
            }
            Ok(())
        }
    }

    fn entries(tar_bytes: &[u8]) -> Vec<(String, tar::EntryType, Option<String>)> {
        let mut out = Vec::new();
        for entry in tar::Archive::new(tar_bytes).entries().unwrap() {
            let entry = entry.unwrap();
            let path = entry.path().unwrap().display().to_string();
            let link = entry
                .link_name()
                .unwrap()
                .map(|l| l.display().to_string());
            out.push((path, entry.header().entry_type(), link));
        }
        out
    }

    fn write_regular(cas: &mut TarCas<Vec<u8>>, path: &str, mode: u32, data: &[u8]) {
        let mut h = blob_header(data.len() as u64);
        h.set_mode(mode);
        cas.write_header(path.into(), &h, PaxRecords::new()).unwrap();
        cas.write_data(data).unwrap();
    }

    #[test]
    fn test_blob_dedup_with_hardlinks() {
        let mut cas = TarCas::new(Vec::new(), HashAlgorithm::Sha256, StructuralMode::CasFirst);
        write_regular(&mut cas, "a", 0o755, b"abc");
        write_regular(&mut cas, "b", 0o755, b"abc");
        let mut export = CollectExport(Vec::new());
        cas.export(&mut export).unwrap();
        let tar_bytes = cas.into_inner().unwrap();

        let hash = HashAlgorithm::Sha256.digest(b"abc");
        let blob = blob_path(&hash).to_string();
        assert_eq!(
            entries(&tar_bytes),
            vec![
                (blob.clone(), tar::EntryType::Regular, None),
                ("a".to_string(), tar::EntryType::Link, Some(blob.clone())),
                ("b".to_string(), tar::EntryType::Link, Some(blob)),
            ]
        );
        // Exactly one blob exported, zero nodes, zero trees.
        assert_eq!(export.0, vec![(EntryKind::Blob, hash)]);
    }

    #[test]
    fn test_node_identity_differs_by_mode() {
        let mut cas = TarCas::new(Vec::new(), HashAlgorithm::Sha256, StructuralMode::CasFirst);
        write_regular(&mut cas, "x", 0o600, b"abc");
        write_regular(&mut cas, "y", 0o640, b"abc");
        let mut export = CollectExport(Vec::new());
        cas.export(&mut export).unwrap();
        let tar_bytes = cas.into_inner().unwrap();

        let nodes: Vec<_> = entries(&tar_bytes)
            .into_iter()
            .filter(|(p, _, _)| p.starts_with(NODE_PREFIX))
            .collect();
        assert_eq!(nodes.len(), 2, "distinct modes must yield distinct nodes");
        let exported_kinds: Vec<_> = export.0.iter().map(|(k, _)| *k).collect();
        assert_eq!(exported_kinds, vec![EntryKind::Node, EntryKind::Node]);
    }

    #[test]
    fn test_same_node_dedups() {
        let mut cas = TarCas::new(Vec::new(), HashAlgorithm::Sha256, StructuralMode::CasFirst);
        write_regular(&mut cas, "x", 0o600, b"abc");
        write_regular(&mut cas, "y", 0o600, b"abc");
        let tar_bytes = cas.into_inner().unwrap();
        let nodes = entries(&tar_bytes)
            .into_iter()
            .filter(|(p, _, _)| p.starts_with(NODE_PREFIX))
            .count();
        assert_eq!(nodes, 1);
    }

    #[test]
    fn test_import_skips_emission() {
        let hash = HashAlgorithm::Sha256.digest(b"abc");
        let mut cas = TarCas::new(Vec::new(), HashAlgorithm::Sha256, StructuralMode::CasFirst);
        cas.import(&mut FixedImport(vec![(EntryKind::Blob, hash.clone())]))
            .unwrap();
        write_regular(&mut cas, "a", 0o755, b"abc");
        let mut export = CollectExport(Vec::new());
        cas.export(&mut export).unwrap();
        let tar_bytes = cas.into_inner().unwrap();

        // No blob entry, just the hardlink into the lower layer.
        assert_eq!(
            entries(&tar_bytes),
            vec![(
                "a".to_string(),
                tar::EntryType::Link,
                Some(blob_path(&hash).to_string())
            )]
        );
        // Imported hashes are not re-exported.
        assert!(export.0.is_empty());
    }

    #[test]
    fn test_cas_first_ordering() {
        let mut cas = TarCas::new(Vec::new(), HashAlgorithm::Sha256, StructuralMode::CasFirst);
        let mut dir = cas_dir_header();
        dir.set_mode(0o700);
        cas.write_header("etc".into(), &dir, PaxRecords::new()).unwrap();
        write_regular(&mut cas, "etc/motd", 0o755, b"hi");
        let tar_bytes = cas.into_inner().unwrap();

        let got = entries(&tar_bytes);
        assert!(got[0].0.starts_with(BLOB_PREFIX), "CAS entries first: {got:?}");
        assert_eq!(got[1].0, "etc/");
        assert_eq!(got[2].0, "etc/motd");
    }

    #[test]
    fn test_intertwined_ordering() {
        let mut cas =
            TarCas::new(Vec::new(), HashAlgorithm::Sha256, StructuralMode::Intertwined);
        let dir = cas_dir_header();
        cas.write_header("etc".into(), &dir, PaxRecords::new()).unwrap();
        write_regular(&mut cas, "etc/motd", 0o755, b"hi");
        let tar_bytes = cas.into_inner().unwrap();
        let got = entries(&tar_bytes);
        assert_eq!(got[0].0, "etc/");
        assert!(got[1].0.starts_with(BLOB_PREFIX));
        assert_eq!(got[2].0, "etc/motd");
    }

    #[test]
    fn test_cas_only_drops_structure() {
        let mut cas = TarCas::new(Vec::new(), HashAlgorithm::Sha256, StructuralMode::CasOnly);
        let dir = cas_dir_header();
        cas.write_header("etc".into(), &dir, PaxRecords::new()).unwrap();
        write_regular(&mut cas, "etc/motd", 0o755, b"hi");
        let tar_bytes = cas.into_inner().unwrap();
        let got = entries(&tar_bytes);
        assert_eq!(got.len(), 1);
        assert!(got[0].0.starts_with(BLOB_PREFIX));
    }

    #[test]
    fn test_canonical_path_passthrough() {
        let hash = HashAlgorithm::Sha256.digest(b"abc");
        let mut cas = TarCas::new(Vec::new(), HashAlgorithm::Sha256, StructuralMode::CasFirst);
        write_regular(&mut cas, blob_path(&hash).as_str(), 0o755, b"abc");
        let tar_bytes = cas.into_inner().unwrap();
        // Just the blob entry; no self-referential hardlink.
        assert_eq!(entries(&tar_bytes).len(), 1);
    }

    #[test]
    fn test_store_and_known_hash() {
        let mut cas = TarCas::new(Vec::new(), HashAlgorithm::Sha256, StructuralMode::CasFirst);
        let (path, hash, size) = cas.store(&mut &b"payload"[..]).unwrap();
        assert_eq!(size, 7);
        assert_eq!(path, blob_path(&hash));
        // Storing again under a known hash is a no-op.
        let again = cas
            .store_known_hash_and_size(&mut &b"payload"[..], &hash, 7)
            .unwrap();
        assert_eq!(again, path);
        let tar_bytes = cas.into_inner().unwrap();
        assert_eq!(entries(&tar_bytes).len(), 1);
    }

    #[test]
    fn test_store_known_hash_rejects_short_reader() {
        let mut cas = TarCas::new(Vec::new(), HashAlgorithm::Sha256, StructuralMode::CasFirst);
        let hash = HashAlgorithm::Sha256.digest(b"full payload");
        assert!(cas
            .store_known_hash_and_size(&mut &b"short"[..], &hash, 12)
            .is_err());
    }

    #[test]
    fn test_symlink_passthrough() {
        let mut cas = TarCas::new(Vec::new(), HashAlgorithm::Sha256, StructuralMode::CasFirst);
        let mut h = tar::Header::new_ustar();
        h.set_entry_type(tar::EntryType::Symlink);
        h.set_size(0);
        h.set_mode(0o777);
        h.set_link_name("../target").unwrap();
        cas.write_header("link".into(), &h, PaxRecords::new()).unwrap();
        let tar_bytes = cas.into_inner().unwrap();
        assert_eq!(
            entries(&tar_bytes),
            vec![(
                "link".to_string(),
                tar::EntryType::Symlink,
                Some("../target".to_string())
            )]
        );
    }

    #[test]
    fn test_absolute_path_rejected() {
        let mut cas = TarCas::new(Vec::new(), HashAlgorithm::Sha256, StructuralMode::CasFirst);
        let h = blob_header(0);
        assert!(cas
            .write_header("/abs".into(), &h, PaxRecords::new())
            .is_err());
    }

    #[test]
    fn test_store_node_directly() {
        let mut cas = TarCas::new(Vec::new(), HashAlgorithm::Sha256, StructuralMode::CasFirst);
        let mut h = blob_header(3);
        h.set_mode(0o600);
        h.set_uid(1000);
        let (path, node_hash) = cas
            .store_node(&mut &b"abc"[..], &h, PaxRecords::new())
            .unwrap();
        assert_eq!(path, node_path(&node_hash));
        // Same header and payload dedup to the same node.
        let (path2, hash2) = cas
            .store_node(&mut &b"abc"[..], &h, PaxRecords::new())
            .unwrap();
        assert_eq!((path2, hash2), (path, node_hash.clone()));
        let tar_bytes = cas.into_inner().unwrap();
        let got = entries(&tar_bytes);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].0, node_path(&node_hash).to_string());
    }

    #[test]
    fn test_store_tree() {
        let td = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(td.path()).unwrap();
        std::fs::create_dir(root.join("sub")).unwrap();
        std::fs::write(root.join("top.txt"), b"top").unwrap();
        std::fs::write(root.join("sub/inner.txt"), b"inner").unwrap();

        let mut cas = TarCas::new(Vec::new(), HashAlgorithm::Sha256, StructuralMode::CasFirst);
        let (path, hash) = cas.store_tree(root).unwrap();
        assert_eq!(path, tree_path(&hash));
        // Identical tree again: no new entries.
        let (path2, hash2) = cas.store_tree(root).unwrap();
        assert_eq!((path2, hash2), (path.clone(), hash.clone()));

        let mut export = CollectExport(Vec::new());
        cas.export(&mut export).unwrap();
        let tar_bytes = cas.into_inner().unwrap();
        let got = entries(&tar_bytes);

        let tree_root = format!("{path}/");
        assert!(got.iter().any(|(p, t, _)| *p == tree_root
            && *t == tar::EntryType::Directory));
        assert!(got
            .iter()
            .any(|(p, t, _)| *p == format!("{path}/sub/") && *t == tar::EntryType::Directory));
        // Children are hardlinks into the blob namespace.
        let top_blob = blob_path(&HashAlgorithm::Sha256.digest(b"top")).to_string();
        assert!(got
            .iter()
            .any(|(p, t, l)| *p == format!("{path}/top.txt")
                && *t == tar::EntryType::Link
                && l.as_deref() == Some(top_blob.as_str())));
        // Two blobs and one tree exported.
        let kinds: Vec<_> = export.0.iter().map(|(k, _)| *k).collect();
        assert_eq!(
            kinds,
            vec![EntryKind::Blob, EntryKind::Blob, EntryKind::Tree]
        );
    }
}
