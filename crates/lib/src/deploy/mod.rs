//! The deploy manifest: the JSON contract between the build system and
//! the push/load orchestrators.
//!
//! A deploy manifest is an ordered sequence of operations, each either a
//! registry push or a daemon load, plus global strategy settings. Every
//! operation carries the root descriptor (an image manifest or an image
//! index), one record per platform manifest with its config and layer
//! descriptors and the digests known to be absent locally, and -- for
//! shallow base images -- the pull information needed to fetch those
//! absent blobs from their original registry at deploy time.

use std::sync::OnceLock;

use anyhow::{Context, Result};
use camino::Utf8Path;
use oci_spec::image::Descriptor;
use serde::{Deserialize, Serialize};

pub mod vfs;

/// How blobs reach their destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeployStrategy {
    /// Read every blob and stream it to the destination.
    #[default]
    Eager,
    /// Ask the destination which blobs are missing; transfer only those.
    Lazy,
    /// The destination registry is backed by the build CAS; blob
    /// presence is guaranteed, only manifests and configs are written.
    CasRegistry,
    /// Deployment happens out of band via the build event stream; emit
    /// metadata only.
    Bes,
}

/// Global settings of a deploy manifest.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Settings {
    /// Strategy for push operations.
    #[serde(default)]
    pub push_strategy: DeployStrategy,
    /// Strategy for load operations.
    #[serde(default)]
    pub load_strategy: DeployStrategy,
}

/// Whether the root descriptor names a single-platform manifest or a
/// multi-platform index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RootKind {
    /// An image manifest.
    Manifest,
    /// An image index.
    Index,
}

/// The root of an operation: its kind plus the OCI descriptor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RootDescriptor {
    /// Manifest or index.
    pub kind: RootKind,
    /// The descriptor of the root document.
    pub descriptor: Descriptor,
}

/// Per-platform deployment info for one manifest of an operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManifestDeployInfo {
    /// Digest (`algo:hex`) of the image manifest.
    pub manifest_digest: String,
    /// Descriptor of the image config blob.
    pub config: Descriptor,
    /// Layer descriptors in manifest order.
    pub layers: Vec<Descriptor>,
    /// Digests of blobs intentionally absent from the local inputs
    /// (shallow base image layers).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing_blobs: Vec<String>,
}

/// Where the absent blobs of a shallow base image can be fetched from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PullInfo {
    /// Registries hosting the original base image, in preference order.
    pub original_registries: Vec<String>,
    /// Repository of the base image.
    pub repository: String,
    /// Digest of the original base manifest.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

/// A registry push operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PushOperation {
    /// Destination registries; the image is pushed to each.
    pub registries: Vec<String>,
    /// Destination repository.
    pub repository: String,
    /// Tags to apply to the root after the content is committed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// The root manifest or index.
    pub root: RootDescriptor,
    /// One record per platform manifest.
    pub manifests: Vec<ManifestDeployInfo>,
    /// Pull info for shallow base layers, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_info: Option<PullInfo>,
    /// Per-operation strategy override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<DeployStrategy>,
}

/// A daemon load operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoadOperation {
    /// The reference (name[:tag]) the daemon should store the image as.
    pub reference: String,
    /// Requested platforms (`os/arch[/variant]`); empty means the
    /// daemon's default platform.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub platforms: Vec<String>,
    /// The root manifest or index.
    pub root: RootDescriptor,
    /// One record per platform manifest.
    pub manifests: Vec<ManifestDeployInfo>,
    /// Pull info for shallow base layers, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_info: Option<PullInfo>,
}

/// One operation of a deploy manifest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Operation {
    /// Push to a registry.
    Push(PushOperation),
    /// Load into a local daemon.
    Load(LoadOperation),
}

impl Operation {
    /// The root descriptor of the operation.
    pub fn root(&self) -> &RootDescriptor {
        match self {
            Operation::Push(op) => &op.root,
            Operation::Load(op) => &op.root,
        }
    }

    /// The per-platform manifest records.
    pub fn manifests(&self) -> &[ManifestDeployInfo] {
        match self {
            Operation::Push(op) => &op.manifests,
            Operation::Load(op) => &op.manifests,
        }
    }

    /// The shallow-pull info, if any.
    pub fn pull_info(&self) -> Option<&PullInfo> {
        match self {
            Operation::Push(op) => op.pull_info.as_ref(),
            Operation::Load(op) => op.pull_info.as_ref(),
        }
    }
}

/// The deploy manifest.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct DeployManifest {
    /// Operations in order.
    pub operations: Vec<Operation>,
    /// Global strategy settings.
    #[serde(default)]
    pub settings: Settings,
}

impl DeployManifest {
    /// Read a deploy manifest from a JSON file.
    pub fn from_file(path: &Utf8Path) -> Result<Self> {
        let data =
            std::fs::read(path).with_context(|| format!("Reading deploy manifest {path}"))?;
        serde_json::from_slice(&data)
            .with_context(|| format!("Parsing deploy manifest {path}"))
    }

    /// Merge several manifests into one: operations concatenate, and
    /// the settings must agree.
    pub fn merge(manifests: Vec<DeployManifest>) -> Result<Self> {
        let mut iter = manifests.into_iter();
        let mut merged = iter.next().context("No deploy manifests to merge")?;
        for m in iter {
            anyhow::ensure!(
                m.settings == merged.settings,
                "Cannot merge deploy manifests with conflicting settings"
            );
            merged.operations.extend(m.operations);
        }
        Ok(merged)
    }
}

/// Whether we are running under the build system; governs the hint
/// printed for missing-blob conditions. Read once at startup.
pub(crate) fn under_build_system() -> bool {
    static UNDER: OnceLock<bool> = OnceLock::new();
    *UNDER.get_or_init(|| std::env::var_os("RULES_IMG").is_some_and(|v| v == "1"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use oci_spec::image::MediaType;

    pub(crate) fn descriptor_for(data: &[u8], media_type: MediaType) -> Descriptor {
        let digest = crate::hash::HashAlgorithm::Sha256.digest(data);
        crate::oci::descriptor(media_type, data.len() as u64, &digest).unwrap()
    }

    #[test]
    fn test_manifest_roundtrip() {
        let manifest = DeployManifest {
            operations: vec![Operation::Push(PushOperation {
                registries: vec!["quay.io".into()],
                repository: "org/app".into(),
                tags: vec!["latest".into()],
                root: RootDescriptor {
                    kind: RootKind::Manifest,
                    descriptor: descriptor_for(b"m", MediaType::ImageManifest),
                },
                manifests: vec![ManifestDeployInfo {
                    manifest_digest: crate::hash::HashAlgorithm::Sha256
                        .digest(b"m")
                        .to_string(),
                    config: descriptor_for(b"c", MediaType::ImageConfig),
                    layers: vec![descriptor_for(b"l", MediaType::ImageLayerGzip)],
                    missing_blobs: vec![],
                }],
                pull_info: None,
                strategy: None,
            })],
            settings: Settings {
                push_strategy: DeployStrategy::Lazy,
                load_strategy: DeployStrategy::Eager,
            },
        };
        let json = serde_json::to_string_pretty(&manifest).unwrap();
        assert!(json.contains("\"type\": \"push\""));
        assert!(json.contains("\"push_strategy\": \"lazy\""));
        let back: DeployManifest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, manifest);
    }

    #[test]
    fn test_merge() {
        let a = DeployManifest::default();
        let mut b = DeployManifest::default();
        b.operations.push(Operation::Load(LoadOperation {
            reference: "myapp:latest".into(),
            platforms: vec![],
            root: RootDescriptor {
                kind: RootKind::Manifest,
                descriptor: descriptor_for(b"m", MediaType::ImageManifest),
            },
            manifests: vec![],
            pull_info: None,
        }));
        let merged = DeployManifest::merge(vec![a, b]).unwrap();
        assert_eq!(merged.operations.len(), 1);

        let conflicting = DeployManifest {
            settings: Settings {
                push_strategy: DeployStrategy::Bes,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(DeployManifest::merge(vec![DeployManifest::default(), conflicting]).is_err());
        assert!(DeployManifest::merge(vec![]).is_err());
    }
}
