//! Strategy-driven registry push.
//!
//! Upload ordering per image is layers → config → manifest; for an
//! index, every per-platform manifest (with its blobs) commits before
//! the index itself. Independent operations and independent blobs run
//! concurrently on a bounded worker pool; a blob upload failure aborts
//! its own image but other operations run to completion, and the
//! aggregate error names the failure count and the first message.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::future::join_all;
use tokio::sync::{mpsc, oneshot, watch};

use crate::deploy::vfs::{BlobSource, DeployVfs};
use crate::deploy::{DeployManifest, DeployStrategy, Operation, PushOperation, RootKind};
use crate::registry::RegistryApi;

/// Default worker-pool size.
pub const DEFAULT_JOBS: usize = 4;

type Job = (
    Pin<Box<dyn std::future::Future<Output = Result<()>> + Send>>,
    oneshot::Sender<Result<()>>,
);

/// A bounded pool of upload workers. Submission backpressures once the
/// channel (depth 2 × workers) is full; shutdown drains the channel and
/// joins every worker.
pub struct UploadPool {
    tx: mpsc::Sender<Job>,
    workers: Vec<tokio::task::JoinHandle<()>>,
}

impl UploadPool {
    /// Spawn `workers` upload workers.
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        let (tx, rx) = mpsc::channel::<Job>(workers * 2);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let workers = (0..workers)
            .map(|_| {
                let rx = rx.clone();
                tokio::spawn(async move {
                    loop {
                        let job = rx.lock().await.recv().await;
                        let Some((fut, done)) = job else { break };
                        let result = fut.await;
                        // The submitter may have been cancelled; that is
                        // not the worker's problem.
                        let _ = done.send(result);
                    }
                })
            })
            .collect();
        Self { tx, workers }
    }

    /// Run a job on the pool, awaiting its completion.
    pub async fn run(
        &self,
        fut: impl std::future::Future<Output = Result<()>> + Send + 'static,
    ) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send((Box::pin(fut), done_tx))
            .await
            .map_err(|_| anyhow::anyhow!("Upload pool is shut down"))?;
        done_rx
            .await
            .map_err(|_| anyhow::anyhow!("Upload worker dropped the job"))?
    }

    /// Drain the queue and join all workers.
    pub async fn shutdown(self) {
        drop(self.tx);
        for worker in self.workers {
            let _ = worker.await;
        }
    }
}

enum UploadState {
    Done,
    InFlight(watch::Receiver<bool>),
}

enum Claim {
    AlreadyDone,
    Wait(watch::Receiver<bool>),
    Run(watch::Sender<bool>),
}

/// Deduplicates uploads by key (`<registry>/<repo>@<digest>`): the
/// first claimer runs the transfer, concurrent requests for the same
/// key await its completion, and a failure clears the slot so a retry
/// is possible.
#[derive(Default)]
pub struct UploadTracker {
    inner: std::sync::Mutex<HashMap<String, UploadState>>,
}

impl UploadTracker {
    fn claim(&self, key: &str) -> Claim {
        let mut map = self.inner.lock().expect("upload tracker lock poisoned");
        match map.get(key) {
            Some(UploadState::Done) => Claim::AlreadyDone,
            Some(UploadState::InFlight(rx)) => Claim::Wait(rx.clone()),
            None => {
                let (tx, rx) = watch::channel(false);
                map.insert(key.to_string(), UploadState::InFlight(rx));
                Claim::Run(tx)
            }
        }
    }

    /// Run `f` at most once per key across the process. Concurrent
    /// callers for the same key await the winner.
    pub async fn run_once<F, Fut>(&self, key: &str, f: F) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<()>>,
    {
        let mut f = Some(f);
        loop {
            match self.claim(key) {
                Claim::AlreadyDone => return Ok(()),
                Claim::Wait(mut rx) => {
                    // Drain updates until the sender goes away; the final
                    // value says whether the transfer succeeded.
                    while rx.changed().await.is_ok() {}
                    if *rx.borrow() {
                        return Ok(());
                    }
                    // The winner failed and cleared the slot; try to
                    // claim it ourselves.
                }
                Claim::Run(tx) => {
                    let f = f.take().context("Upload closure re-entered")?;
                    match f().await {
                        Ok(()) => {
                            self.inner
                                .lock()
                                .expect("upload tracker lock poisoned")
                                .insert(key.to_string(), UploadState::Done);
                            let _ = tx.send(true);
                            return Ok(());
                        }
                        Err(e) => {
                            self.inner
                                .lock()
                                .expect("upload tracker lock poisoned")
                                .remove(key);
                            drop(tx);
                            return Err(e);
                        }
                    }
                }
            }
        }
    }

    /// Number of completed or in-flight entries.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("upload tracker lock poisoned").len()
    }

    /// Whether the tracker is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Tracks applied tags (`<registry>/<repo>:<tag>` → digest) so repeated
/// applications of the same digest skip the write.
#[derive(Default)]
pub struct TagTracker {
    inner: std::sync::Mutex<HashMap<String, String>>,
}

impl TagTracker {
    /// Record the intent to tag; returns false when the same digest is
    /// already applied under this tag.
    pub fn needs_write(&self, key: &str, digest: &str) -> bool {
        let mut map = self.inner.lock().expect("tag tracker lock poisoned");
        match map.get(key) {
            Some(existing) if existing == digest => false,
            _ => {
                map.insert(key.to_string(), digest.to_string());
                true
            }
        }
    }
}

/// The push orchestrator.
pub struct Pusher<R> {
    registry: Arc<R>,
    vfs: Arc<DeployVfs<R>>,
    pool: UploadPool,
    uploads: Arc<UploadTracker>,
    tags: Arc<TagTracker>,
}

impl<R: RegistryApi> Pusher<R> {
    /// Create a pusher with `jobs` upload workers.
    pub fn new(registry: Arc<R>, vfs: Arc<DeployVfs<R>>, jobs: usize) -> Self {
        Self {
            registry,
            vfs,
            pool: UploadPool::new(jobs),
            uploads: Arc::new(UploadTracker::default()),
            tags: Arc::new(TagTracker::default()),
        }
    }

    /// The upload dedup tracker (exposed for inspection).
    pub fn uploads(&self) -> &UploadTracker {
        &self.uploads
    }

    /// Execute every push operation of the deploy manifest. Independent
    /// operations run concurrently; the aggregate error reports the
    /// count and the first failure.
    pub async fn push_all(&self, manifest: &DeployManifest) -> Result<()> {
        let mut futures = Vec::new();
        for (index, op) in manifest.operations.iter().enumerate() {
            let Operation::Push(op) = op else { continue };
            let strategy = op.strategy.unwrap_or(manifest.settings.push_strategy);
            futures.push(async move {
                self.push_operation(op, strategy)
                    .await
                    .with_context(|| format!("Operation {index} ({})", op.repository))
            });
        }
        let results = join_all(futures).await;
        let mut errors = results.into_iter().filter_map(Result::err);
        if let Some(first) = errors.next() {
            let count = 1 + errors.count();
            anyhow::bail!("{count} push operation(s) failed; first: {first:#}");
        }
        Ok(())
    }

    async fn push_operation(&self, op: &PushOperation, strategy: DeployStrategy) -> Result<()> {
        if strategy == DeployStrategy::Bes {
            tracing::debug!(
                "Skipping client-side push of {}: deployment rides the build event stream",
                op.repository
            );
            return Ok(());
        }
        for registry in &op.registries {
            self.push_to_registry(registry, op, strategy).await?;
        }
        Ok(())
    }

    async fn push_to_registry(
        &self,
        registry: &str,
        op: &PushOperation,
        strategy: DeployStrategy,
    ) -> Result<()> {
        // Per-platform manifests upload independently, each ordering
        // layers → config → manifest internally. Only layer blobs run
        // through the worker pool and the dedup tracker; the config is a
        // small document committed with the manifest writes.
        let manifest_futures = op.manifests.iter().map(|info| async move {
            if strategy != DeployStrategy::CasRegistry {
                let blob_futures = info.layers.iter().map(|descriptor| {
                    let digest = descriptor.digest().to_string();
                    async move {
                        self.upload_one(registry, &op.repository, &digest, strategy)
                            .await
                    }
                });
                for result in join_all(blob_futures).await {
                    result?;
                }
            }
            let config_digest = info.config.digest().to_string();
            let bytes = self.vfs.read_all(&config_digest).await?;
            self.registry
                .put_blob(
                    registry,
                    &op.repository,
                    &config_digest,
                    bytes.as_ref().clone(),
                )
                .await
                .with_context(|| format!("Writing config {config_digest}"))?;
            self.put_manifest_by_digest(registry, &op.repository, &info.manifest_digest)
                .await
        });
        for result in join_all(manifest_futures).await {
            result?;
        }

        // The root document commits last.
        let root_digest = op.root.descriptor.digest().to_string();
        if op.root.kind == RootKind::Index {
            let bytes = self.vfs.read_all(&root_digest).await?;
            self.registry
                .put_manifest(
                    registry,
                    &op.repository,
                    &root_digest,
                    &op.root.descriptor.media_type().to_string(),
                    bytes.as_ref().clone(),
                )
                .await?;
        }

        for tag in &op.tags {
            let key = format!("{registry}/{}:{tag}", op.repository);
            if !self.tags.needs_write(&key, &root_digest) {
                tracing::debug!("Tag {key} already points at {root_digest}");
                continue;
            }
            let bytes = self.vfs.read_all(&root_digest).await?;
            self.registry
                .put_manifest(
                    registry,
                    &op.repository,
                    tag,
                    &op.root.descriptor.media_type().to_string(),
                    bytes.as_ref().clone(),
                )
                .await
                .with_context(|| format!("Tagging {key}"))?;
        }
        Ok(())
    }

    async fn put_manifest_by_digest(
        &self,
        registry: &str,
        repository: &str,
        digest: &str,
    ) -> Result<()> {
        let bytes = self.vfs.read_all(digest).await?;
        self.registry
            .put_manifest(
                registry,
                repository,
                digest,
                "application/vnd.oci.image.manifest.v1+json",
                bytes.as_ref().clone(),
            )
            .await
            .with_context(|| format!("Writing manifest {digest}"))
    }

    /// Upload one blob, deduplicated process-wide and scheduled on the
    /// worker pool.
    async fn upload_one(
        &self,
        registry: &str,
        repository: &str,
        digest: &str,
        strategy: DeployStrategy,
    ) -> Result<()> {
        let key = format!("{registry}/{repository}@{digest}");
        let entry = self
            .vfs
            .entry(digest)
            .with_context(|| format!("Unresolved blob {digest}"))?;
        // Stub blobs are never uploaded from here; the destination is
        // expected to already hold them.
        if entry.source == BlobSource::Stub {
            return Ok(());
        }
        let size = entry.descriptor.size();

        self.uploads
            .run_once(&key, || {
                let registry_client = self.registry.clone();
                let vfs = self.vfs.clone();
                let registry = registry.to_string();
                let repository = repository.to_string();
                let digest = digest.to_string();
                self.pool.run(async move {
                    if strategy == DeployStrategy::Lazy
                        && registry_client
                            .blob_exists(&registry, &repository, &digest)
                            .await?
                    {
                        tracing::debug!("{registry}/{repository}@{digest} already present");
                        return Ok(());
                    }
                    let reader = vfs.open(&digest).await?;
                    registry_client
                        .upload_blob(&registry, &repository, &digest, size, reader)
                        .await
                })
            })
            .await
    }

    /// Drain the worker pool.
    pub async fn shutdown(self) {
        self.pool.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deploy::vfs::tests::push_fixture;
    use crate::hash::HashAlgorithm;
    use crate::registry::testutil::FakeRegistry;
    use camino::Utf8Path;

    fn vfs_for(
        fixture: &crate::deploy::vfs::tests::Fixture,
        registry: Arc<FakeRegistry>,
    ) -> Arc<DeployVfs<FakeRegistry>> {
        let root = Utf8Path::from_path(fixture.dir.path()).unwrap();
        Arc::new(DeployVfs::new(&fixture.manifest, root, registry, None, false).unwrap())
    }

    #[tokio::test]
    async fn test_eager_push_uploads_everything() {
        let fixture = push_fixture(&[b"l1", b"l2"], &[], DeployStrategy::Eager, &["latest"]);
        let registry = Arc::new(FakeRegistry::default());
        let vfs = vfs_for(&fixture, registry.clone());
        let pusher = Pusher::new(registry.clone(), vfs, DEFAULT_JOBS);
        pusher.push_all(&fixture.manifest).await.unwrap();

        // Two layer uploads; the config goes with the manifest writes.
        assert_eq!(registry.uploads(), 2);
        assert_eq!(
            registry
                .blob_put_count
                .load(std::sync::atomic::Ordering::SeqCst),
            1
        );
        // Manifest by digest + tag.
        assert_eq!(
            registry
                .manifest_put_count
                .load(std::sync::atomic::Ordering::SeqCst),
            2
        );
        let manifests = registry.manifests.lock().unwrap();
        assert!(manifests.contains_key("dest.example/org/app:latest"));
        pusher.shutdown().await;
    }

    /// Shallow base push with the lazy strategy: the destination already
    /// has layer 1 and layer 3; layer 2 is absent everywhere locally and
    /// streams from the original registry.
    #[tokio::test]
    async fn test_lazy_shallow_push() {
        let fixture = push_fixture(
            &[b"l1", b"l2", b"l3"],
            &[1, 2],
            DeployStrategy::Lazy,
            &["latest"],
        );
        let registry = Arc::new(FakeRegistry::default());
        let digest = |data: &[u8]| HashAlgorithm::Sha256.digest(data).to_string();
        // The original registry serves both shallow layers.
        registry.seed_blob("index.docker.io", "library/base", &digest(b"l2"), b"l2");
        registry.seed_blob("index.docker.io", "library/base", &digest(b"l3"), b"l3");
        // The destination already has layers 1 and 3.
        registry.seed_blob("dest.example", "org/app", &digest(b"l1"), b"l1");
        registry.seed_blob("dest.example", "org/app", &digest(b"l3"), b"l3");

        let vfs = vfs_for(&fixture, registry.clone());
        let pusher = Pusher::new(registry.clone(), vfs, DEFAULT_JOBS);
        pusher.push_all(&fixture.manifest).await.unwrap();

        // Exactly one blob upload: layer 2, streamed from the origin.
        assert_eq!(registry.uploads(), 1);
        let blobs = registry.blobs.lock().unwrap();
        assert_eq!(
            blobs
                .get(&FakeRegistry::blob_key(
                    "dest.example",
                    "org/app",
                    &digest(b"l2")
                ))
                .unwrap(),
            b"l2"
        );
        drop(blobs);
        // Dedup map: the three layer entries.
        assert_eq!(pusher.uploads().len(), 3);
        // Config, manifest, and tag were written.
        assert_eq!(
            registry
                .blob_put_count
                .load(std::sync::atomic::Ordering::SeqCst),
            1
        );
        let manifests = registry.manifests.lock().unwrap();
        assert!(manifests.contains_key("dest.example/org/app:latest"));
        drop(manifests);
        pusher.shutdown().await;
    }

    #[tokio::test]
    async fn test_cas_registry_skips_layers() {
        let fixture = push_fixture(&[b"l1"], &[], DeployStrategy::CasRegistry, &[]);
        let registry = Arc::new(FakeRegistry::default());
        let vfs = vfs_for(&fixture, registry.clone());
        let pusher = Pusher::new(registry.clone(), vfs, DEFAULT_JOBS);
        pusher.push_all(&fixture.manifest).await.unwrap();
        // No layer transfers; only the config and manifest are written.
        assert_eq!(registry.uploads(), 0);
        assert_eq!(
            registry
                .blob_put_count
                .load(std::sync::atomic::Ordering::SeqCst),
            1
        );
        pusher.shutdown().await;
    }

    #[tokio::test]
    async fn test_bes_uploads_nothing() {
        let fixture = push_fixture(&[b"l1"], &[], DeployStrategy::Bes, &["latest"]);
        let registry = Arc::new(FakeRegistry::default());
        let vfs = vfs_for(&fixture, registry.clone());
        let pusher = Pusher::new(registry.clone(), vfs, DEFAULT_JOBS);
        pusher.push_all(&fixture.manifest).await.unwrap();
        assert_eq!(registry.uploads(), 0);
        assert_eq!(
            registry
                .blob_put_count
                .load(std::sync::atomic::Ordering::SeqCst),
            0
        );
        assert_eq!(
            registry
                .manifest_put_count
                .load(std::sync::atomic::Ordering::SeqCst),
            0
        );
        pusher.shutdown().await;
    }

    #[tokio::test]
    async fn test_upload_failure_reports_aggregate() {
        let fixture = push_fixture(&[b"l1"], &[], DeployStrategy::Eager, &[]);
        let registry = Arc::new(FakeRegistry::default());
        registry
            .failing
            .lock()
            .unwrap()
            .insert(HashAlgorithm::Sha256.digest(b"l1").to_string());
        let vfs = vfs_for(&fixture, registry.clone());
        let pusher = Pusher::new(registry.clone(), vfs, DEFAULT_JOBS);
        let err = pusher.push_all(&fixture.manifest).await.unwrap_err();
        let msg = format!("{err:#}");
        assert!(msg.contains("1 push operation(s) failed"), "{msg}");
        // Neither the config nor the manifest of the failed image may
        // have been written.
        assert_eq!(
            registry
                .blob_put_count
                .load(std::sync::atomic::Ordering::SeqCst),
            0
        );
        assert_eq!(
            registry
                .manifest_put_count
                .load(std::sync::atomic::Ordering::SeqCst),
            0
        );
        pusher.shutdown().await;
    }

    #[tokio::test]
    async fn test_concurrent_pushes_upload_once() {
        let fixture = push_fixture(&[b"l1"], &[], DeployStrategy::Eager, &[]);
        let registry = Arc::new(FakeRegistry {
            upload_delay: Some(std::time::Duration::from_millis(20)),
            ..Default::default()
        });
        let vfs = vfs_for(&fixture, registry.clone());
        let pusher = Arc::new(Pusher::new(registry.clone(), vfs, DEFAULT_JOBS));

        // Two concurrent pushes of the same manifest share the dedup
        // map: the layer uploads exactly once.
        let (a, b) = tokio::join!(
            pusher.push_all(&fixture.manifest),
            pusher.push_all(&fixture.manifest)
        );
        a.unwrap();
        b.unwrap();
        assert_eq!(registry.uploads(), 1);
    }

    #[tokio::test]
    async fn test_tag_idempotence() {
        let fixture = push_fixture(&[b"l1"], &[], DeployStrategy::Eager, &["latest"]);
        let registry = Arc::new(FakeRegistry::default());
        let vfs = vfs_for(&fixture, registry.clone());
        let pusher = Pusher::new(registry.clone(), vfs, DEFAULT_JOBS);
        pusher.push_all(&fixture.manifest).await.unwrap();
        let puts_after_first = registry
            .manifest_put_count
            .load(std::sync::atomic::Ordering::SeqCst);
        pusher.push_all(&fixture.manifest).await.unwrap();
        // The second run re-puts the digest manifest (idempotent on the
        // registry side) but skips the tag write.
        assert_eq!(
            registry
                .manifest_put_count
                .load(std::sync::atomic::Ordering::SeqCst),
            puts_after_first + 1
        );
        pusher.shutdown().await;
    }

    #[tokio::test]
    async fn test_tracker_retry_after_failure() {
        let tracker = UploadTracker::default();
        let result = tracker
            .run_once("k", || async { anyhow::bail!("boom") })
            .await;
        assert!(result.is_err());
        // The slot is cleared; a retry can claim it.
        tracker.run_once("k", || async { Ok(()) }).await.unwrap();
        assert_eq!(tracker.len(), 1);
    }
}
