//! High-level layer assembly.
//!
//! The recorder translates the operations a build rule asks for (add a
//! file, import a tar, add an executable with its runfiles tree, add a
//! symlink or directory tree) into content-addressed tar writes, and
//! parses the parameter files the build system hands us.

use std::collections::HashSet;
use std::io::{BufReader, Read, Write};

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use serde::Deserialize;

use crate::hash::HashValue;
use crate::tarcas::{
    blob_header, cas_dir_header, hardlink_header, PaxRecords, TarCas,
};

/// Applies user-specified header overrides at write time.
pub trait MetadataProvider {
    /// Adjust the header and PAX records for the entry at `path`.
    fn apply(
        &self,
        path: &Utf8Path,
        header: &mut tar::Header,
        pax: &mut PaxRecords,
    ) -> Result<()>;
}

/// A metadata provider from a static override set, typically parsed
/// from a JSON parameter file.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StaticMetadata {
    /// File mode override (octal string or integer accepted upstream).
    pub mode: Option<u32>,
    /// Owner uid override.
    pub uid: Option<u64>,
    /// Owner gid override.
    pub gid: Option<u64>,
    /// Modification time override, seconds since the epoch.
    pub mtime: Option<u64>,
    /// Extra PAX records (e.g. `SCHILY.xattr.*`).
    #[serde(default)]
    pub pax: std::collections::BTreeMap<String, String>,
}

impl MetadataProvider for StaticMetadata {
    fn apply(
        &self,
        _path: &Utf8Path,
        header: &mut tar::Header,
        pax: &mut PaxRecords,
    ) -> Result<()> {
        if let Some(mode) = self.mode {
            header.set_mode(mode);
        }
        if let Some(uid) = self.uid {
            header.set_uid(uid);
        }
        if let Some(gid) = self.gid {
            header.set_gid(gid);
        }
        if let Some(mtime) = self.mtime {
            header.set_mtime(mtime);
        }
        for (k, v) in &self.pax {
            pax.insert(k.clone(), v.clone().into_bytes());
        }
        Ok(())
    }
}

/// Whether a manifest entry names a file or a directory on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    /// A regular file.
    File,
    /// A directory, to be stored as a tree artifact.
    Directory,
}

/// One line of the file parameter manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileManifestEntry {
    /// Destination path inside the image (relative).
    pub path_in_image: Utf8PathBuf,
    /// File or directory.
    pub kind: EntryType,
    /// Source path on the host.
    pub host: Utf8PathBuf,
}

/// Parse the file list parameter format: one entry per line,
/// `path-in-image NUL <type byte> host-path` with type `f` or `d`.
pub fn parse_file_manifest(data: &str) -> Result<Vec<FileManifestEntry>> {
    let mut out = Vec::new();
    for (lineno, line) in data.lines().enumerate() {
        if line.is_empty() {
            continue;
        }
        let err = || format!("File manifest line {}", lineno + 1);
        let (path, rest) = line.split_once('\0').with_context(err)?;
        if path.is_empty() {
            anyhow::bail!("{}: empty path-in-image", err());
        }
        if path.starts_with('/') {
            anyhow::bail!("{}: absolute path-in-image {path}", err());
        }
        let mut chars = rest.chars();
        let kind = match chars.next() {
            Some('f') => EntryType::File,
            Some('d') => EntryType::Directory,
            other => anyhow::bail!("{}: unknown entry type {other:?}", err()),
        };
        out.push(FileManifestEntry {
            path_in_image: path.into(),
            kind,
            host: chars.as_str().into(),
        });
    }
    Ok(out)
}

/// Parse the symlink list parameter format: `linkname NUL target` per
/// line.
pub fn parse_symlink_manifest(data: &str) -> Result<Vec<(Utf8PathBuf, String)>> {
    let mut out = Vec::new();
    for (lineno, line) in data.lines().enumerate() {
        if line.is_empty() {
            continue;
        }
        let (link, target) = line
            .split_once('\0')
            .with_context(|| format!("Symlink manifest line {}", lineno + 1))?;
        if link.is_empty() {
            anyhow::bail!("Symlink manifest line {}: empty link name", lineno + 1);
        }
        out.push((link.into(), target.to_string()));
    }
    Ok(out)
}

/// A runfile below an executable's runfiles tree.
#[derive(Debug, Clone)]
pub struct Runfile {
    /// Path relative to the runfiles root.
    pub rel: Utf8PathBuf,
    /// Host source path.
    pub host: Utf8PathBuf,
    /// File or directory.
    pub kind: EntryType,
}

/// Translates build-rule operations into tar-CAS writes.
pub struct Recorder<W: Write> {
    cas: TarCas<W>,
    metadata: Option<Box<dyn MetadataProvider>>,
    /// Directories already emitted, to avoid duplicate parent entries.
    dirs: HashSet<Utf8PathBuf>,
    /// Known digests supplied by an upstream cache, keyed by host path.
    known_digests: std::collections::HashMap<Utf8PathBuf, (HashValue, u64)>,
}

impl<W: Write> Recorder<W> {
    /// Wrap a tar-CAS writer.
    pub fn new(cas: TarCas<W>) -> Self {
        Self {
            cas,
            metadata: None,
            dirs: HashSet::new(),
            known_digests: Default::default(),
        }
    }

    /// Attach a metadata provider applied to every emitted header.
    pub fn with_metadata(mut self, provider: Box<dyn MetadataProvider>) -> Self {
        self.metadata = Some(provider);
        self
    }

    /// Register an upstream-cache digest for a host path, enabling the
    /// hash-skipping fast path in [`Recorder::add_file`].
    pub fn register_known_digest(&mut self, host: Utf8PathBuf, hash: HashValue, size: u64) {
        self.known_digests.insert(host, (hash, size));
    }

    fn apply_metadata(
        &self,
        path: &Utf8Path,
        header: &mut tar::Header,
        pax: &mut PaxRecords,
    ) -> Result<()> {
        if let Some(provider) = &self.metadata {
            provider.apply(path, header, pax)?;
        }
        Ok(())
    }

    /// Emit directory entries for all missing ancestors of `path`.
    fn ensure_parent_dirs(&mut self, path: &Utf8Path) -> Result<()> {
        let Some(parent) = path.parent() else {
            return Ok(());
        };
        let mut missing = Vec::new();
        let mut cursor = parent;
        loop {
            if cursor.as_str().is_empty() || self.dirs.contains(cursor) {
                break;
            }
            missing.push(cursor.to_owned());
            match cursor.parent() {
                Some(p) => cursor = p,
                None => break,
            }
        }
        for dir in missing.into_iter().rev() {
            self.add_directory(&dir)?;
        }
        Ok(())
    }

    /// Add an explicit directory entry.
    pub fn add_directory(&mut self, path: &Utf8Path) -> Result<()> {
        if !self.dirs.insert(path.to_owned()) {
            return Ok(());
        }
        let mut header = cas_dir_header();
        let mut pax = PaxRecords::new();
        self.apply_metadata(path, &mut header, &mut pax)?;
        self.cas.write_header(path, &header, pax)
    }

    /// Add a regular file from a host path, constructing a canonical
    /// blob-shaped header. When the digest is known via an upstream
    /// cache and no metadata override applies, the content is streamed
    /// without re-hashing.
    #[context("Adding file {path}")]
    pub fn add_file(&mut self, path: &Utf8Path, host: &Utf8Path) -> Result<()> {
        self.ensure_parent_dirs(path)?;
        let meta = host
            .metadata()
            .with_context(|| format!("Inspecting {host}"))?;
        let size = meta.len();
        let mut header = blob_header(size);
        let mut pax = PaxRecords::new();
        self.apply_metadata(path, &mut header, &mut pax)?;

        let known = self.known_digests.get(host).cloned();
        if let Some((hash, known_size)) = known {
            if crate::tarcas::is_blob_shaped(&header, &pax) {
                anyhow::ensure!(
                    known_size == size,
                    "Cached size for {host} is {known_size}, file has {size} bytes"
                );
                let mut reader = BufReader::new(
                    std::fs::File::open(host).with_context(|| format!("Opening {host}"))?,
                );
                let cas_path = self
                    .cas
                    .store_known_hash_and_size(&mut reader, &hash, size)?;
                let mut link = hardlink_header();
                link.set_link_name_literal(cas_path.as_str())?;
                return self.cas.write_header(path, &link, PaxRecords::new());
            }
        }

        let data = std::fs::read(host).with_context(|| format!("Reading {host}"))?;
        self.cas.write_header(path, &header, pax)?;
        self.cas.write_data(&data)
    }

    /// Add a symlink entry.
    pub fn add_symlink(&mut self, link: &Utf8Path, target: &str) -> Result<()> {
        self.ensure_parent_dirs(link)?;
        let mut header = tar::Header::new_ustar();
        header.set_entry_type(tar::EntryType::Symlink);
        header.set_size(0);
        header.set_mode(0o777);
        header.set_uid(0);
        header.set_gid(0);
        header.set_mtime(0);
        header
            .set_link_name_literal(target)
            .with_context(|| format!("Symlink target {target}"))?;
        let mut pax = PaxRecords::new();
        self.apply_metadata(link, &mut header, &mut pax)?;
        self.cas.write_header(link, &header, pax)
    }

    /// Convert a host directory into a tree artifact and materialize it
    /// at `path` as a symlink to the tree root.
    #[context("Adding tree {path}")]
    pub fn add_tree(&mut self, path: &Utf8Path, host: &Utf8Path) -> Result<()> {
        let known = self.known_digests.get(host).cloned();
        let (tree_root, _hash) = match known {
            Some((hash, _)) => {
                let p = self.cas.store_tree_known_hash(host, &hash)?;
                (p, hash)
            }
            None => self.cas.store_tree(host)?,
        };
        self.add_symlink(path, &format!("/{tree_root}"))
    }

    /// Add an executable at `target` together with its runfiles tree:
    /// the binary itself, a `<target>.runfiles/` directory, and each
    /// runfile beneath it. Directory runfiles become tree artifacts.
    #[context("Adding executable {target}")]
    pub fn add_executable(
        &mut self,
        target: &Utf8Path,
        binary_host: &Utf8Path,
        runfiles: &[Runfile],
    ) -> Result<()> {
        self.add_file(target, binary_host)?;
        let runfiles_root = Utf8PathBuf::from(format!("{target}.runfiles"));
        self.add_directory(&runfiles_root)?;
        for rf in runfiles {
            let dest = runfiles_root.join(&rf.rel);
            match rf.kind {
                EntryType::File => self.add_file(&dest, &rf.host)?,
                EntryType::Directory => self.add_tree(&dest, &rf.host)?,
            }
        }
        Ok(())
    }

    /// Import a tar stream (optionally gzip or zstd compressed): every
    /// regular file routes through CAS dedup, other entries pass
    /// through.
    #[context("Importing tar")]
    pub fn import_tar(&mut self, reader: impl Read) -> Result<()> {
        let mut archive = tar::Archive::new(decompress_reader(reader)?);
        for entry in archive.entries().context("Reading tar entries")? {
            let mut entry = entry.context("Reading tar entry")?;
            let path = entry.path().context("Reading entry path")?;
            let path = Utf8PathBuf::from_path_buf(path.into_owned())
                .map_err(|p| anyhow::anyhow!("Non-UTF-8 path in tar: {p:?}"))?;
            let mut header = entry.header().clone();
            let mut pax = PaxRecords::new();
            if let Some(extensions) = entry.pax_extensions()? {
                for ext in extensions {
                    let ext = ext?;
                    if let Ok(key) = ext.key() {
                        pax.insert(key.to_string(), ext.value_bytes().to_vec());
                    }
                }
            }
            self.apply_metadata(&path, &mut header, &mut pax)?;
            if header.entry_type() == tar::EntryType::Directory {
                self.dirs
                    .insert(Utf8PathBuf::from(path.as_str().trim_end_matches('/')));
            }
            self.cas.write_header(&path, &header, pax)?;
            let mut buf = [0u8; 64 * 1024];
            loop {
                let n = entry.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                self.cas.write_data(&buf[..n])?;
            }
        }
        Ok(())
    }

    /// Finish recording, handing back the tar-CAS writer for export and
    /// close.
    pub fn into_cas(self) -> TarCas<W> {
        self.cas
    }
}

/// Wrap a reader with the right decompressor based on its magic bytes.
pub(crate) fn decompress_reader<'a>(reader: impl Read + 'a) -> Result<Box<dyn Read + 'a>> {
    let mut reader = BufReader::new(Box::new(reader) as Box<dyn Read + 'a>);
    let magic = {
        use std::io::BufRead;
        let buf = reader.fill_buf()?;
        buf.get(..4).map(<[u8]>::to_vec)
    };
    Ok(match magic.as_deref() {
        Some([0x1f, 0x8b, ..]) => Box::new(flate2::read::MultiGzDecoder::new(reader)),
        Some([0x28, 0xb5, 0x2f, 0xfd]) => {
            Box::new(zstd::stream::read::Decoder::new(reader).context("zstd stream")?)
        }
        _ => Box::new(reader),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::HashAlgorithm;
    use crate::tarcas::{blob_path, StructuralMode};

    fn new_recorder() -> Recorder<Vec<u8>> {
        Recorder::new(TarCas::new(
            Vec::new(),
            HashAlgorithm::Sha256,
            StructuralMode::CasFirst,
        ))
    }

    fn entry_names(tar_bytes: &[u8]) -> Vec<String> {
        tar::Archive::new(tar_bytes)
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().display().to_string())
            .collect()
    }

    #[test]
    fn test_parse_file_manifest() {
        let entries =
            parse_file_manifest("usr/bin/tool\0f/build/out/tool\nopt/data\0d/build/data\n")
                .unwrap();
        assert_eq!(
            entries,
            vec![
                FileManifestEntry {
                    path_in_image: "usr/bin/tool".into(),
                    kind: EntryType::File,
                    host: "/build/out/tool".into(),
                },
                FileManifestEntry {
                    path_in_image: "opt/data".into(),
                    kind: EntryType::Directory,
                    host: "/build/data".into(),
                },
            ]
        );
        assert!(parse_file_manifest("/abs\0f/x").is_err());
        assert!(parse_file_manifest("\0f/x").is_err());
        assert!(parse_file_manifest("p\0q/x").is_err());
        assert!(parse_file_manifest("no-separator").is_err());
    }

    #[test]
    fn test_parse_symlink_manifest() {
        let links = parse_symlink_manifest("usr/bin/sh\0/bin/bash\n").unwrap();
        assert_eq!(links, vec![("usr/bin/sh".into(), "/bin/bash".to_string())]);
        assert!(parse_symlink_manifest("\0target").is_err());
        assert!(parse_symlink_manifest("nosep").is_err());
    }

    #[test]
    fn test_add_file_emits_parents_and_dedups() {
        let td = tempfile::tempdir().unwrap();
        let host = Utf8PathBuf::from_path_buf(td.path().join("f1")).unwrap();
        std::fs::write(&host, b"abc").unwrap();

        let mut r = new_recorder();
        r.add_file("a".into(), &host).unwrap();
        r.add_file("b".into(), &host).unwrap();
        let tar_bytes = r.into_cas().into_inner().unwrap();

        let blob = blob_path(&HashAlgorithm::Sha256.digest(b"abc")).to_string();
        assert_eq!(entry_names(&tar_bytes), vec![blob, "a".into(), "b".into()]);
    }

    #[test]
    fn test_known_digest_fast_path() {
        let td = tempfile::tempdir().unwrap();
        let host = Utf8PathBuf::from_path_buf(td.path().join("f1")).unwrap();
        std::fs::write(&host, b"abc").unwrap();
        let hash = HashAlgorithm::Sha256.digest(b"abc");

        let mut r = new_recorder();
        r.register_known_digest(host.clone(), hash.clone(), 3);
        r.add_file("bin/tool".into(), &host).unwrap();
        let tar_bytes = r.into_cas().into_inner().unwrap();
        assert_eq!(
            entry_names(&tar_bytes),
            vec![blob_path(&hash).to_string(), "bin/".into(), "bin/tool".into()]
        );
    }

    #[test]
    fn test_metadata_override_makes_nodes() {
        let td = tempfile::tempdir().unwrap();
        let host = Utf8PathBuf::from_path_buf(td.path().join("f1")).unwrap();
        std::fs::write(&host, b"abc").unwrap();

        let provider = StaticMetadata {
            uid: Some(1000),
            ..Default::default()
        };
        let mut r = new_recorder().with_metadata(Box::new(provider));
        r.add_file("a".into(), &host).unwrap();
        let tar_bytes = r.into_cas().into_inner().unwrap();
        assert!(entry_names(&tar_bytes)[0].starts_with(crate::tarcas::NODE_PREFIX));
    }

    #[test]
    fn test_add_executable_with_runfiles() {
        let td = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(td.path()).unwrap();
        std::fs::write(root.join("tool"), b"#!/bin/true").unwrap();
        std::fs::write(root.join("data.txt"), b"data").unwrap();
        std::fs::create_dir(root.join("assets")).unwrap();
        std::fs::write(root.join("assets/a"), b"a").unwrap();

        let mut r = new_recorder();
        r.add_executable(
            "app/bin/tool".into(),
            &root.join("tool"),
            &[
                Runfile {
                    rel: "data.txt".into(),
                    host: root.join("data.txt"),
                    kind: EntryType::File,
                },
                Runfile {
                    rel: "assets".into(),
                    host: root.join("assets"),
                    kind: EntryType::Directory,
                },
            ],
        )
        .unwrap();
        let tar_bytes = r.into_cas().into_inner().unwrap();
        let names = entry_names(&tar_bytes);
        assert!(names.contains(&"app/bin/tool".to_string()));
        assert!(names.contains(&"app/bin/tool.runfiles/".to_string()));
        assert!(names.contains(&"app/bin/tool.runfiles/data.txt".to_string()));
        // The directory runfile materializes as a symlink to a tree.
        assert!(names.contains(&"app/bin/tool.runfiles/assets".to_string()));
        assert!(names.iter().any(|n| n.starts_with(".cas/tree/")));
    }

    #[test]
    fn test_import_tar_dedups_regular_files() {
        let mut b = tar::Builder::new(Vec::new());
        let mut h = tar::Header::new_ustar();
        h.set_entry_type(tar::EntryType::Regular);
        h.set_size(3);
        h.set_mode(0o755);
        h.set_mtime(0);
        h.set_cksum();
        b.append_data(&mut h.clone(), "one", &b"abc"[..]).unwrap();
        b.append_data(&mut h, "two", &b"abc"[..]).unwrap();
        let plain = b.into_inner().unwrap();

        // Also gzip it to exercise the magic sniffing.
        let mut gz = flate2::write::GzEncoder::new(Vec::new(), Default::default());
        gz.write_all(&plain).unwrap();
        let gzipped = gz.finish().unwrap();

        for input in [plain, gzipped] {
            let mut r = new_recorder();
            r.import_tar(&input[..]).unwrap();
            let tar_bytes = r.into_cas().into_inner().unwrap();
            let names = entry_names(&tar_bytes);
            let blobs = names.iter().filter(|n| n.starts_with(".cas/blob/")).count();
            assert_eq!(blobs, 1);
            assert!(names.contains(&"one".to_string()));
            assert!(names.contains(&"two".to_string()));
        }
    }
}
