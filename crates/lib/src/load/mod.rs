//! Loading images into local daemons.
//!
//! containerd is preferred whenever its socket is reachable; otherwise
//! the image is streamed to `docker load`. Platform selection follows
//! the operation's requested platforms, then `$DOCKER_DEFAULT_PLATFORM`,
//! then `linux/<host-arch>`.

use anyhow::{Context, Result};
use futures_util::future::join_all;

use crate::deploy::vfs::DeployVfs;
use crate::deploy::{DeployManifest, LoadOperation, Operation, RootKind};
use crate::oci::Reference;
use crate::registry::RegistryApi;

pub mod containerd;
pub mod docker;
pub mod platform;

use platform::PlatformSpec;

/// The reference a loaded image is stored under: normalized per the
/// daemon convention, with `latest` applied when no tag or digest was
/// given.
pub(crate) fn normalize_load_reference(name: &str) -> Result<String> {
    let mut reference: Reference = name.parse()?;
    if reference.tag.is_none() && reference.digest.is_none() {
        reference.tag = Some(Reference::DEFAULT_TAG.to_string());
    }
    Ok(reference.normalized_name())
}

/// The containerd socket to try: `$CONTAINERD_ADDRESS`, then the
/// rootless user socket, then the system default.
fn containerd_candidates() -> Vec<String> {
    if let Ok(address) = std::env::var("CONTAINERD_ADDRESS") {
        return vec![address];
    }
    let mut candidates = Vec::new();
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        candidates.push(format!("{runtime_dir}/containerd/containerd.sock"));
    }
    candidates.push("/run/containerd/containerd.sock".to_string());
    candidates
}

/// The platform filter for one load operation.
fn platforms_for(op: &LoadOperation) -> Result<Vec<PlatformSpec>> {
    if op.platforms.is_empty() {
        platform::default_platforms()
    } else {
        op.platforms
            .iter()
            .map(|p| p.parse())
            .collect::<Result<_>>()
            .context("Parsing requested platforms")
    }
}

/// Execute every load operation of a deploy manifest. Independent
/// operations run concurrently; per-operation failures are aggregated.
pub async fn load_all<R: RegistryApi>(
    vfs: &DeployVfs<R>,
    manifest: &DeployManifest,
) -> Result<()> {
    let store = connect_containerd().await;
    let mut futures = Vec::new();
    for (index, op) in manifest.operations.iter().enumerate() {
        let Operation::Load(op) = op else { continue };
        let store = store.as_ref();
        futures.push(async move {
            load_one(vfs, op, store)
                .await
                .with_context(|| format!("Operation {index} ({})", op.reference))
        });
    }
    let results = join_all(futures).await;
    let mut errors = results.into_iter().filter_map(Result::err);
    if let Some(first) = errors.next() {
        let count = 1 + errors.count();
        anyhow::bail!("{count} load operation(s) failed; first: {first:#}");
    }
    Ok(())
}

async fn connect_containerd() -> Option<containerd::ContainerdStore> {
    let namespace =
        std::env::var("CONTAINERD_NAMESPACE").unwrap_or_else(|_| "default".to_string());
    for address in containerd_candidates() {
        if !std::path::Path::new(&address).exists() {
            continue;
        }
        match containerd::ContainerdStore::connect(&address, &namespace).await {
            Ok(store) => {
                tracing::debug!("Using containerd at {address}");
                return Some(store);
            }
            Err(e) => {
                tracing::debug!("containerd at {address} unusable: {e:#}");
            }
        }
    }
    None
}

async fn load_one<R: RegistryApi>(
    vfs: &DeployVfs<R>,
    op: &LoadOperation,
    store: Option<&containerd::ContainerdStore>,
) -> Result<()> {
    let platforms = platforms_for(op)?;
    if let Some(store) = store {
        return containerd::load_operation(vfs, op, &platforms, store).await;
    }
    tracing::debug!("No containerd socket; falling back to docker load");
    let manifest = select_image_manifest(vfs, op, &platforms).await?;
    let reference = normalize_load_reference(&op.reference)?;
    let image = docker::SaveImage::fetch(vfs, reference, manifest).await?;
    docker::docker_load(image).await
}

/// For docker loads a single manifest must be chosen: index roots go
/// through platform selection, manifest roots are used as is.
async fn select_image_manifest<R: RegistryApi>(
    vfs: &DeployVfs<R>,
    op: &LoadOperation,
    platforms: &[PlatformSpec],
) -> Result<oci_spec::image::ImageManifest> {
    let root_digest = op.root.descriptor.digest().to_string();
    match op.root.kind {
        RootKind::Manifest => vfs.image(&root_digest).await,
        RootKind::Index => {
            let index = vfs.image_index(&root_digest).await?;
            let selected = platform::select_manifest(&index, platforms)?;
            vfs.image(&selected.digest().to_string()).await
        }
    }
}
