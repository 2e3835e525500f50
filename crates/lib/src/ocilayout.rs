//! OCI image layout output.
//!
//! Writes the standard layout: an `oci-layout` version file, an
//! `index.json`, and content-addressed files under `blobs/<algo>/`.
//! Directory output operates on a capability-scoped [`Dir`]; the tar
//! variant emits the same structure as a POSIX tar stream with
//! trailing-slash directory entries.

use std::io::{BufReader, Read, Write};

use anyhow::{Context, Result};
use camino::Utf8Path;
use cap_std_ext::cap_std;
use cap_std_ext::cap_std::fs::Dir;
use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;

use crate::hash::HashValue;

const LAYOUT_VERSION: &str = r#"{"imageLayoutVersion":"1.0.0"}"#;

fn blob_rel_path(digest: &HashValue) -> String {
    format!("blobs/{}/{}", digest.algorithm(), digest.to_hex())
}

/// An OCI image layout directory being assembled.
#[derive(Debug)]
pub struct OciLayout {
    dir: Dir,
}

impl OciLayout {
    /// Open the layout at `path`, creating the standard metadata when
    /// absent.
    #[context("Opening OCI layout {path}")]
    pub fn ensure(path: &Utf8Path) -> Result<Self> {
        std::fs::create_dir_all(path)?;
        let dir = Dir::open_ambient_dir(path, cap_std::ambient_authority())?;
        let mut db = cap_std::fs::DirBuilder::new();
        db.recursive(true);
        dir.ensure_dir_with("blobs", &db)?;
        if !dir.try_exists("oci-layout")? {
            dir.atomic_write("oci-layout", LAYOUT_VERSION)?;
        }
        Ok(Self { dir })
    }

    /// Write `index.json`.
    pub fn write_index(&self, index_json: &[u8]) -> Result<()> {
        self.dir
            .atomic_write("index.json", index_json)
            .context("Writing index.json")
    }

    /// Add a blob from a reader under its digest.
    #[context("Adding blob {digest}")]
    pub fn put_blob(&self, digest: &HashValue, mut reader: impl Read) -> Result<()> {
        let mut db = cap_std::fs::DirBuilder::new();
        db.recursive(true);
        self.dir
            .ensure_dir_with(format!("blobs/{}", digest.algorithm()), &db)?;
        let path = blob_rel_path(digest);
        if self.dir.try_exists(&path)? {
            return Ok(());
        }
        self.dir.atomic_replace_with(&path, |w| {
            std::io::copy(&mut reader, w).map(|_| ())
        })?;
        Ok(())
    }

    /// Add a blob from a file path.
    pub fn put_blob_from_file(&self, digest: &HashValue, src: &Utf8Path) -> Result<()> {
        let f = std::fs::File::open(src).with_context(|| format!("Opening {src}"))?;
        self.put_blob(digest, BufReader::new(f))
    }
}

/// The same layout as a tar stream: `oci-layout`, `index.json`, and the
/// blob files, with explicit directory entries.
pub struct OciLayoutTar<W: Write> {
    builder: tar::Builder<W>,
    dirs_written: std::collections::HashSet<String>,
}

impl<W: Write> OciLayoutTar<W> {
    /// Begin the stream, emitting the layout metadata.
    pub fn new(out: W, index_json: &[u8]) -> Result<Self> {
        let mut this = Self {
            builder: tar::Builder::new(out),
            dirs_written: Default::default(),
        };
        this.append_dir("blobs")?;
        this.append_file("oci-layout", LAYOUT_VERSION.as_bytes())?;
        this.append_file("index.json", index_json)?;
        Ok(this)
    }

    fn append_dir(&mut self, path: &str) -> Result<()> {
        if !self.dirs_written.insert(path.to_string()) {
            return Ok(());
        }
        let mut h = tar::Header::new_ustar();
        h.set_entry_type(tar::EntryType::Directory);
        h.set_size(0);
        h.set_mode(0o755);
        h.set_mtime(0);
        self.builder
            .append_data(&mut h, format!("{path}/"), &mut std::io::empty())
            .with_context(|| format!("Writing {path}/"))
    }

    fn append_file(&mut self, path: &str, data: &[u8]) -> Result<()> {
        let mut h = tar::Header::new_ustar();
        h.set_entry_type(tar::EntryType::Regular);
        h.set_size(data.len() as u64);
        h.set_mode(0o644);
        h.set_mtime(0);
        self.builder
            .append_data(&mut h, path, data)
            .with_context(|| format!("Writing {path}"))
    }

    /// Add one blob.
    pub fn put_blob(&mut self, digest: &HashValue, data: &[u8]) -> Result<()> {
        self.append_dir(&format!("blobs/{}", digest.algorithm()))?;
        self.append_file(&blob_rel_path(digest), data)
    }

    /// Finish the tar stream.
    pub fn finish(mut self) -> Result<W> {
        self.builder.finish().context("Writing tar footer")?;
        Ok(self.builder.into_inner()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::HashAlgorithm;

    #[test]
    fn test_layout_dir() {
        let td = tempfile::tempdir().unwrap();
        let path = Utf8Path::from_path(td.path()).unwrap().join("layout");
        let layout = OciLayout::ensure(&path).unwrap();
        let digest = HashAlgorithm::Sha256.digest(b"blob");
        layout.put_blob(&digest, &b"blob"[..]).unwrap();
        // Idempotent.
        layout.put_blob(&digest, &b"blob"[..]).unwrap();
        layout.write_index(br#"{"schemaVersion":2,"manifests":[]}"#).unwrap();

        assert_eq!(
            std::fs::read_to_string(path.join("oci-layout")).unwrap(),
            LAYOUT_VERSION
        );
        let blob_path = path.join(format!("blobs/sha256/{}", digest.to_hex()));
        assert_eq!(std::fs::read(blob_path).unwrap(), b"blob");
        assert!(path.join("index.json").exists());
    }

    #[test]
    fn test_layout_tar() {
        let digest = HashAlgorithm::Sha256.digest(b"blob");
        let mut layout =
            OciLayoutTar::new(Vec::new(), br#"{"schemaVersion":2,"manifests":[]}"#).unwrap();
        layout.put_blob(&digest, b"blob").unwrap();
        let out = layout.finish().unwrap();

        let mut names = Vec::new();
        for entry in tar::Archive::new(&out[..]).entries().unwrap() {
            names.push(entry.unwrap().path().unwrap().display().to_string());
        }
        assert_eq!(
            names,
            vec![
                "blobs/".to_string(),
                "oci-layout".to_string(),
                "index.json".to_string(),
                "blobs/sha256/".to_string(),
                format!("blobs/sha256/{}", digest.to_hex()),
            ]
        );
    }
}
