//! Deploy execution and the `dispatch.json` fast path.
//!
//! When the binary is invoked as a deploy tool by the build system, a
//! `dispatch.json` file sits next to it (or in its runfiles); in that
//! case the deploy manifest it contains is executed directly, without
//! conventional argv parsing.

use std::sync::Arc;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};

use crate::deploy::vfs::DeployVfs;
use crate::deploy::DeployManifest;
use crate::push::{Pusher, DEFAULT_JOBS};
use crate::registry::RegistryClient;
use crate::remotecas::RemoteCasClient;

/// The remote CAS endpoint, if configured in the environment.
fn remote_cas_endpoint() -> Option<String> {
    std::env::var("IMG_REAPI_ENDPOINT")
        .or_else(|_| std::env::var("IMG_BLOB_CACHE_ENDPOINT"))
        .ok()
        .filter(|e| !e.is_empty())
}

async fn connect_remote_cas() -> Option<Arc<RemoteCasClient>> {
    let endpoint = remote_cas_endpoint()?;
    let instance = std::env::var("IMG_REAPI_INSTANCE").unwrap_or_default();
    match RemoteCasClient::connect(&endpoint, &instance).await {
        Ok(client) => Some(Arc::new(client)),
        Err(e) => {
            tracing::warn!("Remote CAS at {endpoint} unavailable: {e:#}");
            None
        }
    }
}

/// Execute every operation of a deploy manifest: pushes first, then
/// daemon loads.
pub async fn execute_deploy(
    manifest: &DeployManifest,
    root: &Utf8Path,
    jobs: usize,
    allow_missing: bool,
) -> Result<()> {
    let registry = Arc::new(RegistryClient::new());
    let remote_cas = connect_remote_cas().await;
    let vfs = Arc::new(
        DeployVfs::new(manifest, root, registry.clone(), remote_cas, allow_missing)
            .context("Resolving deploy inputs")?,
    );

    let has_pushes = manifest
        .operations
        .iter()
        .any(|op| matches!(op, crate::deploy::Operation::Push(_)));
    if has_pushes {
        let pusher = Pusher::new(registry, vfs.clone(), jobs);
        pusher.push_all(manifest).await?;
        pusher.shutdown().await;
    }

    let has_loads = manifest
        .operations
        .iter()
        .any(|op| matches!(op, crate::deploy::Operation::Load(_)));
    if has_loads {
        crate::load::load_all(vfs.as_ref(), manifest).await?;
    }
    Ok(())
}

/// Locations where a dispatch file may sit, relative to the binary.
fn dispatch_candidates() -> Vec<Utf8PathBuf> {
    let mut candidates = Vec::new();
    if let Ok(path) = std::env::var("IMG_DISPATCH_JSON") {
        if !path.is_empty() {
            candidates.push(path.into());
        }
    }
    if let Ok(exe) = std::env::current_exe() {
        if let Ok(exe) = Utf8PathBuf::from_path_buf(exe) {
            candidates.push(Utf8PathBuf::from(format!("{exe}.runfiles/dispatch.json")));
            if let Some(dir) = exe.parent() {
                candidates.push(dir.join("dispatch.json"));
            }
        }
    }
    candidates
}

/// If a dispatch file is present, execute its deploy manifest and
/// return the outcome; otherwise return `None` and let argv parsing
/// proceed.
pub async fn try_dispatch() -> Option<Result<()>> {
    let path = dispatch_candidates().into_iter().find(|p| p.exists())?;
    tracing::debug!("Dispatching deploy manifest {path}");
    Some(run_dispatch(&path).await)
}

async fn run_dispatch(path: &Utf8Path) -> Result<()> {
    let manifest = DeployManifest::from_file(path)?;
    let root = path
        .parent()
        .with_context(|| format!("Dispatch file {path} has no parent directory"))?;
    execute_deploy(&manifest, root, DEFAULT_JOBS, false).await
}
