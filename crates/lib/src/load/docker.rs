//! Fallback load via `docker load`.
//!
//! When no containerd socket is reachable, a Docker-compatible tar is
//! streamed to the daemon's `load` command over a pipe: the config
//! blob, each layer, and finally a `manifest.json` naming the config
//! path, the tag list, and the layer paths. Writer and child run
//! concurrently; the first error wins.

use std::io::Write;

use anyhow::{Context, Result};
use oci_spec::image::ImageManifest;
use serde::Serialize;

use crate::deploy::vfs::DeployVfs;
use crate::registry::RegistryApi;

/// One record of the legacy `manifest.json` inside a docker-save tar.
#[derive(Debug, Serialize)]
struct SaveManifestEntry {
    #[serde(rename = "Config")]
    config: String,
    #[serde(rename = "RepoTags")]
    repo_tags: Vec<String>,
    #[serde(rename = "Layers")]
    layers: Vec<String>,
}

fn blob_entry_path(digest: &str) -> String {
    match digest.split_once(':') {
        Some((algo, hex)) => format!("blobs/{algo}/{hex}"),
        None => format!("blobs/{digest}"),
    }
}

fn append_file<W: Write>(
    builder: &mut tar::Builder<W>,
    path: &str,
    data: &[u8],
) -> Result<()> {
    let mut header = tar::Header::new_ustar();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(0);
    builder
        .append_data(&mut header, path, data)
        .with_context(|| format!("Writing {path}"))
}

/// The pieces of one image, pre-fetched for synchronous tar assembly.
pub struct SaveImage {
    /// Normalized reference (with tag) for `RepoTags`.
    pub reference: String,
    /// The image manifest.
    pub manifest: ImageManifest,
    /// Config blob bytes.
    pub config: Vec<u8>,
    /// Layer blob bytes, in manifest order.
    pub layers: Vec<Vec<u8>>,
}

impl SaveImage {
    /// Fetch the config and layers of `manifest` through the VFS.
    pub async fn fetch<R: RegistryApi>(
        vfs: &DeployVfs<R>,
        reference: String,
        manifest: ImageManifest,
    ) -> Result<Self> {
        let config = vfs
            .read_all(&manifest.config().digest().to_string())
            .await?
            .as_ref()
            .clone();
        let mut layers = Vec::with_capacity(manifest.layers().len());
        for layer in manifest.layers() {
            layers.push(
                vfs.read_all(&layer.digest().to_string())
                    .await?
                    .as_ref()
                    .clone(),
            );
        }
        Ok(Self {
            reference,
            manifest,
            config,
            layers,
        })
    }

    /// Write the docker-load tar: config, layers in order, then
    /// `manifest.json`.
    pub fn write_tar<W: Write>(&self, out: W) -> Result<()> {
        let mut builder = tar::Builder::new(out);
        let config_path = blob_entry_path(&self.manifest.config().digest().to_string());
        append_file(&mut builder, &config_path, &self.config)?;

        let mut layer_paths = Vec::new();
        for (descriptor, data) in self.manifest.layers().iter().zip(&self.layers) {
            let path = blob_entry_path(&descriptor.digest().to_string());
            append_file(&mut builder, &path, data)?;
            layer_paths.push(path);
        }

        let manifest_json = serde_json::to_vec(&[SaveManifestEntry {
            config: config_path,
            repo_tags: vec![self.reference.clone()],
            layers: layer_paths,
        }])?;
        append_file(&mut builder, "manifest.json", &manifest_json)?;
        builder.finish().context("Finishing docker-save tar")?;
        Ok(())
    }
}

/// Stream the save tar into `docker load` (or `$LOADER_BINARY`). The
/// tar writer runs on a blocking thread feeding the child's stdin; if
/// either side fails first, that error is reported.
pub async fn docker_load(image: SaveImage) -> Result<()> {
    let loader = std::env::var("LOADER_BINARY").unwrap_or_else(|_| "docker".to_string());
    let mut child = tokio::process::Command::new(&loader)
        .arg("load")
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::null())
        .spawn()
        .with_context(|| format!("Spawning {loader} load"))?;
    let stdin = child.stdin.take().context("Loader stdin unavailable")?;

    let writer = tokio::task::spawn_blocking(move || {
        let bridge = tokio_util::io::SyncIoBridge::new(stdin);
        image.write_tar(bridge)
    });
    let wait = async {
        let status = child.wait().await.context("Waiting for the loader")?;
        anyhow::ensure!(status.success(), "{loader} load exited with {status}");
        Ok(())
    };
    let write = async {
        writer
            .await
            .context("Tar writer task panicked")?
            .context("Streaming image tar")
    };
    tokio::try_join!(write, wait)?;
    Ok(())
}
