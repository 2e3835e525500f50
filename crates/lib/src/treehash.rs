//! Merkle identity of directory subtrees.
//!
//! A tree artifact is named by a hash computed bottom up: per directory,
//! the entries are sorted bytewise by name and each contributes
//! `kind byte ‖ name ‖ NUL ‖ hash`, where the hash is the content hash
//! for regular files, the subtree hash for directories, and the hash of
//! the target string for symlinks. The directory hash is the digest of
//! the concatenation. Equivalent trees therefore hash identically
//! regardless of filesystem enumeration order, and any content change
//! anywhere below the root changes the root.

use std::io::Read;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

use crate::hash::{HashAlgorithm, HashValue};

/// A regular file found below a tree root.
#[derive(Debug, Clone)]
pub struct TreeFile {
    /// Path relative to the tree root.
    pub rel: Utf8PathBuf,
    /// Absolute (host) path the content can be read from.
    pub host: Utf8PathBuf,
    /// Content hash.
    pub hash: HashValue,
    /// Content size in bytes.
    pub size: u64,
}

/// The result of scanning a subtree: its merkle root plus everything
/// needed to materialize it as CAS entries.
#[derive(Debug)]
pub struct TreeScan {
    /// The merkle root hash; the identity of the tree artifact.
    pub root: HashValue,
    /// Subdirectories relative to the root, parents before children,
    /// sorted within each directory.
    pub dirs: Vec<Utf8PathBuf>,
    /// Regular files, in the same deterministic order.
    pub files: Vec<TreeFile>,
}

fn hash_file(path: &Utf8Path, algorithm: HashAlgorithm) -> Result<(HashValue, u64)> {
    let mut f = std::fs::File::open(path).with_context(|| format!("Opening {path}"))?;
    let mut hasher = algorithm.new_hasher();
    let mut buf = [0u8; 64 * 1024];
    let mut size = 0u64;
    loop {
        let n = f.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((hasher.finalize(), size))
}

fn hash_dir(
    root: &Utf8Path,
    rel: &Utf8Path,
    algorithm: HashAlgorithm,
    scan: &mut TreeScan,
) -> Result<HashValue> {
    let host = root.join(rel);
    let mut names: Vec<_> = host
        .read_dir_utf8()
        .with_context(|| format!("Reading {host}"))?
        .map(|e| e.map(|e| e.file_name().to_owned()))
        .collect::<Result<_, _>>()?;
    names.sort();

    let mut encoding = Vec::new();
    for name in names {
        let child_host = host.join(&name);
        let child_rel = rel.join(&name);
        let meta = child_host
            .symlink_metadata()
            .with_context(|| format!("Inspecting {child_host}"))?;
        let (kind, hash) = if meta.is_symlink() {
            let target = child_host
                .read_link_utf8()
                .with_context(|| format!("Reading link {child_host}"))?;
            (b'l', algorithm.digest(target.as_str().as_bytes()))
        } else if meta.is_dir() {
            scan.dirs.push(child_rel.clone());
            (b'd', hash_dir(root, &child_rel, algorithm, scan)?)
        } else if meta.is_file() {
            let (hash, size) = hash_file(&child_host, algorithm)?;
            scan.files.push(TreeFile {
                rel: child_rel,
                host: child_host,
                hash: hash.clone(),
                size,
            });
            (b'f', hash)
        } else {
            // Sockets, fifos, devices: not representable in a tree
            // artifact.
            tracing::debug!("Skipping special file {child_host}");
            continue;
        };
        encoding.push(kind);
        encoding.extend_from_slice(name.as_bytes());
        encoding.push(0);
        encoding.extend_from_slice(hash.as_bytes());
    }
    Ok(algorithm.digest(&encoding))
}

/// Scan a directory subtree, computing its merkle root and collecting
/// its contents. Empty trees are permitted.
#[context("Hashing tree {dir}")]
pub fn scan(dir: &Utf8Path, algorithm: HashAlgorithm) -> Result<TreeScan> {
    let mut result = TreeScan {
        // Placeholder until the walk completes.
        root: algorithm.digest(&[]),
        dirs: Vec::new(),
        files: Vec::new(),
    };
    result.root = hash_dir(dir, Utf8Path::new(""), algorithm, &mut result)?;
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup(root: &Utf8Path) {
        std::fs::create_dir(root.join("sub")).unwrap();
        std::fs::write(root.join("a.txt"), b"alpha").unwrap();
        std::fs::write(root.join("sub/b.txt"), b"beta").unwrap();
        #[cfg(unix)]
        std::os::unix::fs::symlink("a.txt", root.join("link")).unwrap();
    }

    #[test]
    fn test_equivalent_trees_hash_identically() {
        let td1 = tempfile::tempdir().unwrap();
        let td2 = tempfile::tempdir().unwrap();
        let r1 = Utf8Path::from_path(td1.path()).unwrap();
        let r2 = Utf8Path::from_path(td2.path()).unwrap();
        setup(r1);
        setup(r2);
        let s1 = scan(r1, HashAlgorithm::Sha256).unwrap();
        let s2 = scan(r2, HashAlgorithm::Sha256).unwrap();
        assert_eq!(s1.root, s2.root);
        assert_eq!(s1.dirs, vec![Utf8PathBuf::from("sub")]);
        assert_eq!(
            s1.files.iter().map(|f| f.rel.clone()).collect::<Vec<_>>(),
            vec![Utf8PathBuf::from("a.txt"), Utf8PathBuf::from("sub/b.txt")]
        );
    }

    #[test]
    fn test_content_change_changes_root() {
        let td = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(td.path()).unwrap();
        setup(root);
        let before = scan(root, HashAlgorithm::Sha256).unwrap().root;
        std::fs::write(root.join("sub/b.txt"), b"betA").unwrap();
        let after = scan(root, HashAlgorithm::Sha256).unwrap().root;
        assert_ne!(before, after);
    }

    #[test]
    fn test_rename_changes_root() {
        let td = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(td.path()).unwrap();
        setup(root);
        let before = scan(root, HashAlgorithm::Sha256).unwrap().root;
        std::fs::rename(root.join("a.txt"), root.join("z.txt")).unwrap();
        let after = scan(root, HashAlgorithm::Sha256).unwrap().root;
        assert_ne!(before, after);
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_target_changes_root() {
        let td = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(td.path()).unwrap();
        setup(root);
        let before = scan(root, HashAlgorithm::Sha256).unwrap().root;
        std::fs::remove_file(root.join("link")).unwrap();
        std::os::unix::fs::symlink("sub/b.txt", root.join("link")).unwrap();
        let after = scan(root, HashAlgorithm::Sha256).unwrap().root;
        assert_ne!(before, after);
    }

    #[test]
    fn test_empty_tree() {
        let td = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(td.path()).unwrap();
        let s = scan(root, HashAlgorithm::Sha256).unwrap();
        assert_eq!(s.root, HashAlgorithm::Sha256.digest(&[]));
        assert!(s.files.is_empty() && s.dirs.is_empty());
    }
}
