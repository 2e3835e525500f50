//! The deploy virtual filesystem.
//!
//! Push and load need the bytes of manifests, configs, and layers, but
//! where those bytes live depends on the deployment strategy: most come
//! from files the build system materialized next to the deploy manifest,
//! shallow base layers come from their original registry, lazily pushed
//! blobs come from the build's remote CAS, and some blobs intentionally
//! have no local source at all. The VFS resolves every digest referenced
//! by a deploy manifest to one such source up front, then serves opens.
//!
//! Local file roles below the VFS root:
//!
//! ```text
//! <op>/index.json
//! <op>/manifests/<m>/manifest.json
//! <op>/manifests/<m>/config.json
//! <op>/manifests/<m>/layer/<l>
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use oci_spec::image::{Descriptor, ImageIndex, ImageManifest};

use crate::deploy::{under_build_system, DeployManifest, DeployStrategy, Operation, RootKind};
use crate::registry::{BlobReader, RegistryApi};
use crate::remotecas::RemoteCasClient;

/// Largest document cached in memory (manifests/configs/indexes).
const METADATA_CACHE_LIMIT: usize = 1 << 20;

/// Where a blob's bytes come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlobSource {
    /// A file the build system materialized.
    File(Utf8PathBuf),
    /// The original registry of a shallow base image.
    Registry {
        /// Registries to try, in order.
        registries: Vec<String>,
        /// Repository of the base image.
        repository: String,
    },
    /// The build's remote content-addressable store.
    RemoteCache,
    /// No source; opening is an error.
    Stub,
}

impl BlobSource {
    /// Upgrade precedence: file > registry ≈ remote_cache > stub.
    fn rank(&self) -> u8 {
        match self {
            BlobSource::File(_) => 3,
            BlobSource::Registry { .. } | BlobSource::RemoteCache => 2,
            BlobSource::Stub => 1,
        }
    }
}

/// One resolved blob.
#[derive(Debug, Clone)]
pub struct BlobEntry {
    /// The descriptor the deploy manifest carried for this digest.
    pub descriptor: Descriptor,
    /// Where to read it from.
    pub source: BlobSource,
}

/// The error raised when a stub blob is opened, with a build-system
/// hint when running under one.
fn missing_blob_error(digest: &str) -> anyhow::Error {
    if under_build_system() {
        anyhow::anyhow!(
            "Blob {digest} has no local source.\n\
             This usually means a shallow base image was configured without\n\
             pull info, or the push strategy expects the remote CAS to hold\n\
             the blob. Either switch the strategy to \"eager\" or make the\n\
             base image rule materialize its layers."
        )
    } else {
        anyhow::anyhow!("Blob {digest} has no local source")
    }
}

/// Resolves each digest a deploy manifest references to a byte source.
/// Constructed per push/load invocation and discarded.
pub struct DeployVfs<R> {
    registry: Arc<R>,
    remote_cache: Option<Arc<RemoteCasClient>>,
    entries: HashMap<String, BlobEntry>,
    metadata_cache: std::sync::RwLock<HashMap<String, Arc<Vec<u8>>>>,
}

impl<R: RegistryApi> DeployVfs<R> {
    /// Walk the deploy manifest and resolve every referenced blob.
    pub fn new(
        manifest: &DeployManifest,
        root: &Utf8Path,
        registry: Arc<R>,
        remote_cache: Option<Arc<RemoteCasClient>>,
        allow_missing: bool,
    ) -> Result<Self> {
        let mut vfs = Self {
            registry,
            remote_cache,
            entries: HashMap::new(),
            metadata_cache: Default::default(),
        };
        for (op_index, op) in manifest.operations.iter().enumerate() {
            let strategy = match op {
                Operation::Push(p) => p.strategy.unwrap_or(manifest.settings.push_strategy),
                Operation::Load(_) => manifest.settings.load_strategy,
            };
            vfs.resolve_operation(op_index, op, strategy, root, allow_missing)
                .with_context(|| format!("Resolving operation {op_index}"))?;
        }
        Ok(vfs)
    }

    fn insert(&mut self, digest: String, entry: BlobEntry) {
        match self.entries.get(&digest) {
            Some(existing) if existing.source.rank() >= entry.source.rank() => {}
            _ => {
                self.entries.insert(digest, entry);
            }
        }
    }

    fn require_file(path: Utf8PathBuf) -> Result<BlobSource> {
        anyhow::ensure!(path.exists(), "Missing deploy input {path}");
        Ok(BlobSource::File(path))
    }

    fn resolve_operation(
        &mut self,
        op_index: usize,
        op: &Operation,
        strategy: DeployStrategy,
        root: &Utf8Path,
        allow_missing: bool,
    ) -> Result<()> {
        let op_dir = root.join(op_index.to_string());
        let root_desc = op.root();
        if root_desc.kind == RootKind::Index {
            self.insert(
                root_desc.descriptor.digest().to_string(),
                BlobEntry {
                    descriptor: root_desc.descriptor.clone(),
                    source: Self::require_file(op_dir.join("index.json"))?,
                },
            );
        }
        for (m_index, info) in op.manifests().iter().enumerate() {
            let m_dir = op_dir.join("manifests").join(m_index.to_string());
            let manifest_descriptor = crate::oci::descriptor(
                oci_spec::image::MediaType::ImageManifest,
                m_dir
                    .join("manifest.json")
                    .metadata()
                    .map(|m| m.len())
                    .unwrap_or(0),
                &crate::oci::parse_digest(&info.manifest_digest)?,
            )?;
            self.insert(
                info.manifest_digest.clone(),
                BlobEntry {
                    descriptor: manifest_descriptor,
                    source: Self::require_file(m_dir.join("manifest.json"))?,
                },
            );
            self.insert(
                info.config.digest().to_string(),
                BlobEntry {
                    descriptor: info.config.clone(),
                    source: Self::require_file(m_dir.join("config.json"))?,
                },
            );
            for (l_index, layer) in info.layers.iter().enumerate() {
                let digest = layer.digest().to_string();
                let path = m_dir.join("layer").join(l_index.to_string());
                let source = if path.exists() {
                    BlobSource::File(path)
                } else if info.missing_blobs.contains(&digest) {
                    match op.pull_info() {
                        Some(pull) if !pull.original_registries.is_empty() => {
                            BlobSource::Registry {
                                registries: pull.original_registries.clone(),
                                repository: pull.repository.clone(),
                            }
                        }
                        _ => self.fallback_source(strategy, allow_missing, &digest)?,
                    }
                } else {
                    self.fallback_source(strategy, allow_missing, &digest)?
                };
                self.insert(
                    digest,
                    BlobEntry {
                        descriptor: layer.clone(),
                        source,
                    },
                );
            }
        }
        Ok(())
    }

    fn fallback_source(
        &self,
        strategy: DeployStrategy,
        allow_missing: bool,
        digest: &str,
    ) -> Result<BlobSource> {
        match strategy {
            DeployStrategy::Lazy if self.remote_cache.is_some() => Ok(BlobSource::RemoteCache),
            DeployStrategy::CasRegistry | DeployStrategy::Bes => Ok(BlobSource::Stub),
            _ if allow_missing => Ok(BlobSource::Stub),
            _ => Err(missing_blob_error(digest)),
        }
    }

    /// The resolved entry for a digest.
    pub fn entry(&self, digest: &str) -> Option<&BlobEntry> {
        self.entries.get(digest)
    }

    /// Every resolved entry.
    pub fn entries(&self) -> impl Iterator<Item = (&String, &BlobEntry)> {
        self.entries.iter()
    }

    /// Open a streaming read of a blob.
    pub async fn open(&self, digest: &str) -> Result<BlobReader> {
        let entry = self
            .entries
            .get(digest)
            .with_context(|| format!("Unresolved blob {digest}"))?;
        match &entry.source {
            BlobSource::File(path) => {
                let file = tokio::fs::File::open(path)
                    .await
                    .with_context(|| format!("Opening {path}"))?;
                Ok(Box::pin(file) as BlobReader)
            }
            BlobSource::Registry {
                registries,
                repository,
            } => {
                let mut last = None;
                for registry in registries {
                    match self
                        .registry
                        .blob_reader(registry, repository, digest)
                        .await
                    {
                        Ok(reader) => return Ok(reader),
                        Err(e) => {
                            tracing::debug!("{registry}/{repository}@{digest}: {e:#}");
                            last = Some(e);
                        }
                    }
                }
                Err(last
                    .unwrap_or_else(|| anyhow::anyhow!("No registries to pull {digest} from")))
            }
            BlobSource::RemoteCache => {
                let cas = self
                    .remote_cache
                    .as_ref()
                    .context("No remote CAS endpoint configured")?;
                let hash = crate::oci::parse_digest(digest)?;
                cas.reader_for_blob(&hash.to_hex(), entry.descriptor.size())
                    .await
            }
            BlobSource::Stub => Err(missing_blob_error(digest)),
        }
    }

    /// Read a whole blob. Small documents (manifests, configs) are
    /// cached; anything above the cache limit is read through.
    pub async fn read_all(&self, digest: &str) -> Result<Arc<Vec<u8>>> {
        if let Some(hit) = self
            .metadata_cache
            .read()
            .expect("metadata cache lock poisoned")
            .get(digest)
        {
            return Ok(hit.clone());
        }
        use tokio::io::AsyncReadExt;
        let mut reader = self.open(digest).await?;
        let mut data = Vec::new();
        reader
            .read_to_end(&mut data)
            .await
            .with_context(|| format!("Reading {digest}"))?;
        let data = Arc::new(data);
        if data.len() <= METADATA_CACHE_LIMIT {
            self.metadata_cache
                .write()
                .expect("metadata cache lock poisoned")
                .insert(digest.to_string(), data.clone());
        }
        Ok(data)
    }

    /// Parse an image manifest.
    pub async fn image(&self, digest: &str) -> Result<ImageManifest> {
        let data = self.read_all(digest).await?;
        serde_json::from_slice(&data).with_context(|| format!("Parsing manifest {digest}"))
    }

    /// Parse an image index.
    pub async fn image_index(&self, digest: &str) -> Result<ImageIndex> {
        let data = self.read_all(digest).await?;
        serde_json::from_slice(&data).with_context(|| format!("Parsing index {digest}"))
    }

    /// Enumerate the layer descriptors referenced below a root manifest
    /// or index.
    pub async fn layers_from_root(&self, root: &crate::deploy::RootDescriptor) -> Result<Vec<Descriptor>> {
        self.walk_root(root, false).await
    }

    /// Like [`DeployVfs::layers_from_root`], additionally including the
    /// config descriptors.
    pub async fn digests_from_root(
        &self,
        root: &crate::deploy::RootDescriptor,
    ) -> Result<Vec<Descriptor>> {
        self.walk_root(root, true).await
    }

    async fn walk_root(
        &self,
        root: &crate::deploy::RootDescriptor,
        include_configs: bool,
    ) -> Result<Vec<Descriptor>> {
        let mut manifests = Vec::new();
        match root.kind {
            RootKind::Manifest => {
                manifests.push(self.image(&root.descriptor.digest().to_string()).await?)
            }
            RootKind::Index => {
                let index = self
                    .image_index(&root.descriptor.digest().to_string())
                    .await?;
                for d in index.manifests() {
                    manifests.push(self.image(&d.digest().to_string()).await?);
                }
            }
        }
        let mut out = Vec::new();
        for manifest in manifests {
            out.extend(manifest.layers().iter().cloned());
            if include_configs {
                out.push(manifest.config().clone());
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::deploy::{
        DeployManifest, ManifestDeployInfo, Operation, PullInfo, PushOperation, RootDescriptor,
        Settings,
    };
    use crate::hash::HashAlgorithm;
    use crate::registry::testutil::FakeRegistry;
    use oci_spec::image::MediaType;

    pub(crate) struct Fixture {
        pub(crate) dir: tempfile::TempDir,
        pub(crate) manifest: DeployManifest,
        pub(crate) manifest_bytes: Vec<u8>,
        pub(crate) config_bytes: Vec<u8>,
        pub(crate) layers: Vec<Vec<u8>>,
    }

    fn desc(data: &[u8], media_type: MediaType) -> Descriptor {
        crate::oci::descriptor(
            media_type,
            data.len() as u64,
            &HashAlgorithm::Sha256.digest(data),
        )
        .unwrap()
    }

    /// Build a one-image push fixture: config + N layers, of which
    /// `missing` (by index) have no local file and carry pull info.
    pub(crate) fn push_fixture(
        layer_payloads: &[&[u8]],
        missing: &[usize],
        strategy: crate::deploy::DeployStrategy,
        tags: &[&str],
    ) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();

        let config_bytes = br#"{"architecture":"amd64","os":"linux","rootfs":{"type":"layers","diff_ids":[]}}"#.to_vec();
        let config = desc(&config_bytes, MediaType::ImageConfig);

        let layers: Vec<Vec<u8>> = layer_payloads.iter().map(|p| p.to_vec()).collect();
        let layer_descs: Vec<Descriptor> = layers
            .iter()
            .map(|l| desc(l, MediaType::ImageLayerGzip))
            .collect();

        let image_manifest = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": "application/vnd.oci.image.manifest.v1+json",
            "config": config,
            "layers": layer_descs,
        });
        let manifest_bytes = serde_json::to_vec(&image_manifest).unwrap();
        let manifest_digest = HashAlgorithm::Sha256.digest(&manifest_bytes);
        let manifest_desc = desc(&manifest_bytes, MediaType::ImageManifest);

        let m_dir = root.join("0/manifests/0");
        std::fs::create_dir_all(m_dir.join("layer")).unwrap();
        std::fs::write(m_dir.join("manifest.json"), &manifest_bytes).unwrap();
        std::fs::write(m_dir.join("config.json"), &config_bytes).unwrap();
        let mut missing_blobs = Vec::new();
        for (i, layer) in layers.iter().enumerate() {
            if missing.contains(&i) {
                missing_blobs.push(layer_descs[i].digest().to_string());
            } else {
                std::fs::write(m_dir.join("layer").join(i.to_string()), layer).unwrap();
            }
        }

        let manifest = DeployManifest {
            operations: vec![Operation::Push(PushOperation {
                registries: vec!["dest.example".into()],
                repository: "org/app".into(),
                tags: tags.iter().map(|t| t.to_string()).collect(),
                root: RootDescriptor {
                    kind: RootKind::Manifest,
                    descriptor: manifest_desc,
                },
                manifests: vec![ManifestDeployInfo {
                    manifest_digest: manifest_digest.to_string(),
                    config,
                    layers: layer_descs,
                    missing_blobs,
                }],
                pull_info: Some(PullInfo {
                    original_registries: vec!["index.docker.io".into()],
                    repository: "library/base".into(),
                    digest: None,
                }),
                strategy: None,
            })],
            settings: Settings {
                push_strategy: strategy,
                ..Default::default()
            },
        };
        Fixture {
            dir,
            manifest,
            manifest_bytes,
            config_bytes,
            layers,
        }
    }

    #[tokio::test]
    async fn test_resolution_precedence() {
        let fixture = push_fixture(
            &[b"l1", b"l2"],
            &[1],
            crate::deploy::DeployStrategy::Lazy,
            &[],
        );
        let root = Utf8Path::from_path(fixture.dir.path()).unwrap();
        let registry = Arc::new(FakeRegistry::default());
        let vfs = DeployVfs::new(&fixture.manifest, root, registry, None, false).unwrap();

        let l1 = HashAlgorithm::Sha256.digest(b"l1").to_string();
        let l2 = HashAlgorithm::Sha256.digest(b"l2").to_string();
        assert!(matches!(
            vfs.entry(&l1).unwrap().source,
            BlobSource::File(_)
        ));
        assert!(matches!(
            vfs.entry(&l2).unwrap().source,
            BlobSource::Registry { .. }
        ));
    }

    #[tokio::test]
    async fn test_open_local_and_registry() {
        let fixture = push_fixture(
            &[b"l1", b"l2"],
            &[1],
            crate::deploy::DeployStrategy::Eager,
            &[],
        );
        let root = Utf8Path::from_path(fixture.dir.path()).unwrap();
        let registry = Arc::new(FakeRegistry::default());
        let l2 = HashAlgorithm::Sha256.digest(b"l2").to_string();
        registry.seed_blob("index.docker.io", "library/base", &l2, b"l2");
        let vfs = DeployVfs::new(&fixture.manifest, root, registry, None, false).unwrap();

        use tokio::io::AsyncReadExt;
        let l1 = HashAlgorithm::Sha256.digest(b"l1").to_string();
        let mut buf = Vec::new();
        vfs.open(&l1).await.unwrap().read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"l1");
        buf.clear();
        vfs.open(&l2).await.unwrap().read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"l2");
    }

    #[tokio::test]
    async fn test_stub_errors_on_open() {
        let fixture = push_fixture(
            &[b"l1"],
            &[],
            crate::deploy::DeployStrategy::CasRegistry,
            &[],
        );
        let root = Utf8Path::from_path(fixture.dir.path()).unwrap();
        // Remove the local layer so the stub fallback kicks in.
        std::fs::remove_file(root.join("0/manifests/0/layer/0")).unwrap();
        let mut manifest = fixture.manifest.clone();
        if let Operation::Push(op) = &mut manifest.operations[0] {
            op.pull_info = None;
        }
        let registry = Arc::new(FakeRegistry::default());
        let vfs = DeployVfs::new(&manifest, root, registry, None, false).unwrap();
        let l1 = HashAlgorithm::Sha256.digest(b"l1").to_string();
        assert!(matches!(vfs.entry(&l1).unwrap().source, BlobSource::Stub));
        assert!(vfs.open(&l1).await.is_err());
    }

    #[tokio::test]
    async fn test_missing_without_allowance_fails_construction() {
        let fixture = push_fixture(
            &[b"l1"],
            &[],
            crate::deploy::DeployStrategy::Eager,
            &[],
        );
        let root = Utf8Path::from_path(fixture.dir.path()).unwrap();
        std::fs::remove_file(root.join("0/manifests/0/layer/0")).unwrap();
        let mut manifest = fixture.manifest.clone();
        if let Operation::Push(op) = &mut manifest.operations[0] {
            op.pull_info = None;
        }
        let registry = Arc::new(FakeRegistry::default());
        assert!(DeployVfs::new(&manifest, root, registry.clone(), None, false).is_err());
        // allow-missing downgrades to a stub.
        let vfs = DeployVfs::new(&manifest, root, registry, None, true).unwrap();
        let l1 = HashAlgorithm::Sha256.digest(b"l1").to_string();
        assert!(matches!(vfs.entry(&l1).unwrap().source, BlobSource::Stub));
    }

    #[tokio::test]
    async fn test_walk_root() {
        let fixture = push_fixture(
            &[b"l1", b"l2"],
            &[],
            crate::deploy::DeployStrategy::Eager,
            &[],
        );
        let root = Utf8Path::from_path(fixture.dir.path()).unwrap();
        let registry = Arc::new(FakeRegistry::default());
        let vfs = DeployVfs::new(&fixture.manifest, root, registry, None, false).unwrap();
        let root_desc = fixture.manifest.operations[0].root();
        let layers = vfs.layers_from_root(root_desc).await.unwrap();
        assert_eq!(layers.len(), 2);
        let digests = vfs.digests_from_root(root_desc).await.unwrap();
        assert_eq!(digests.len(), 3);
    }
}
