//! OCI helpers: digests, references, descriptor metadata.
//!
//! The JSON schema types themselves come from `oci-spec`; this module
//! adds the conversions and the reference handling the orchestrators
//! need.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::str::FromStr;

use anyhow::{Context, Result};
use oci_spec::image::{Descriptor, MediaType};
use serde::{Deserialize, Serialize};

use crate::hash::HashValue;

/// Parse an OCI digest string (`algo:hex`) into a [`HashValue`].
pub fn parse_digest(digest: &str) -> Result<HashValue> {
    digest
        .parse()
        .with_context(|| format!("Parsing digest {digest}"))
}

/// Build a descriptor for a blob.
pub fn descriptor(media_type: MediaType, size: u64, digest: &HashValue) -> Result<Descriptor> {
    Ok(Descriptor::new(
        media_type,
        size,
        oci_spec::image::Digest::try_from(digest.to_string())?,
    ))
}

/// Whether a media type names an image index / manifest list.
pub fn is_index_media_type(media_type: &MediaType) -> bool {
    match media_type {
        MediaType::ImageIndex => true,
        MediaType::Other(s) => s == "application/vnd.docker.distribution.manifest.list.v2+json",
        _ => false,
    }
}

/// Metadata emitted for every produced blob (layer, config, manifest):
/// the JSON contract between the subcommands of this tool and the build
/// rules that wire their outputs together.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlobMetadata {
    /// Media type of the blob.
    pub media_type: String,
    /// Digest (`algo:hex`) of the blob bytes.
    pub digest: String,
    /// Size of the blob in bytes.
    pub size: u64,
    /// For layers: digest of the uncompressed tar bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diff_id: Option<String>,
    /// Optional descriptor annotations.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl BlobMetadata {
    /// Convert into an OCI descriptor.
    pub fn to_descriptor(&self) -> Result<Descriptor> {
        let mut d = Descriptor::new(
            MediaType::from(self.media_type.as_str()),
            self.size,
            oci_spec::image::Digest::try_from(self.digest.clone())?,
        );
        if !self.annotations.is_empty() {
            d.set_annotations(Some(
                self.annotations
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            ));
        }
        Ok(d)
    }

    /// Read from a JSON file.
    pub fn from_file(path: &camino::Utf8Path) -> Result<Self> {
        let data =
            std::fs::read(path).with_context(|| format!("Reading blob metadata {path}"))?;
        serde_json::from_slice(&data).with_context(|| format!("Parsing blob metadata {path}"))
    }
}

/// A parsed image reference: `[registry/]repository[:tag][@digest]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    /// Registry hostname (with optional port).
    pub registry: String,
    /// Repository path below the registry.
    pub repository: String,
    /// Tag, if present.
    pub tag: Option<String>,
    /// Digest, if present.
    pub digest: Option<String>,
}

impl Reference {
    /// The tag to use when none was given.
    pub const DEFAULT_TAG: &'static str = "latest";

    /// The reference a daemon should store: hostname-qualified, with
    /// the tag preserved. Names without a hostname component gain the
    /// `docker.io` registry (and the `library/` namespace for
    /// single-component names).
    pub fn normalized_name(&self) -> String {
        let mut out = format!("{}/{}", self.registry, self.repository);
        if let Some(tag) = &self.tag {
            out.push(':');
            out.push_str(tag);
        }
        if let Some(digest) = &self.digest {
            out.push('@');
            out.push_str(digest);
        }
        out
    }
}

/// Whether the first path component of a name is a registry hostname:
/// it contains a `.` or `:`, or is exactly `localhost`.
fn is_hostname_component(s: &str) -> bool {
    s == "localhost" || s.contains('.') || s.contains(':')
}

impl FromStr for Reference {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        anyhow::ensure!(!s.is_empty(), "Empty image reference");
        let (rest, digest) = match s.split_once('@') {
            Some((r, d)) => (r, Some(d.to_string())),
            None => (s, None),
        };
        // The tag separator is a ':' after the last '/'.
        let (name, tag) = match rest.rsplit_once(':') {
            Some((n, t)) if !t.contains('/') => (n, Some(t.to_string())),
            _ => (rest, None),
        };
        anyhow::ensure!(!name.is_empty(), "Empty repository in reference {s}");
        let (registry, repository) = match name.split_once('/') {
            Some((first, rest)) if is_hostname_component(first) => {
                (first.to_string(), rest.to_string())
            }
            Some(_) => ("docker.io".to_string(), name.to_string()),
            None => ("docker.io".to_string(), format!("library/{name}")),
        };
        anyhow::ensure!(!repository.is_empty(), "Empty repository in reference {s}");
        Ok(Self {
            registry,
            repository,
            tag,
            digest,
        })
    }
}

impl Display for Reference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.normalized_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_normalization() {
        struct Case {
            input: &'static str,
            normalized: &'static str,
        }
        for case in [
            Case {
                input: "ubuntu",
                normalized: "docker.io/library/ubuntu",
            },
            Case {
                input: "ubuntu:24.04",
                normalized: "docker.io/library/ubuntu:24.04",
            },
            Case {
                input: "myorg/myapp:v1",
                normalized: "docker.io/myorg/myapp:v1",
            },
            Case {
                input: "localhost/myapp",
                normalized: "localhost/myapp",
            },
            Case {
                input: "quay.io/org/app:latest",
                normalized: "quay.io/org/app:latest",
            },
            Case {
                input: "registry:5000/app",
                normalized: "registry:5000/app",
            },
        ] {
            let r: Reference = case.input.parse().unwrap();
            assert_eq!(r.normalized_name(), case.normalized, "{}", case.input);
        }
    }

    #[test]
    fn test_reference_with_digest() {
        let r: Reference = "quay.io/org/app@sha256:abcd".parse().unwrap();
        assert_eq!(r.registry, "quay.io");
        assert_eq!(r.repository, "org/app");
        assert_eq!(r.tag, None);
        assert_eq!(r.digest.as_deref(), Some("sha256:abcd"));
    }

    #[test]
    fn test_reference_rejects_empty() {
        assert!("".parse::<Reference>().is_err());
        assert!(":tag".parse::<Reference>().is_err());
    }

    #[test]
    fn test_blob_metadata_roundtrip() {
        let m = BlobMetadata {
            media_type: "application/vnd.oci.image.layer.v1.tar+gzip".into(),
            digest: crate::hash::HashAlgorithm::Sha256.digest(b"x").to_string(),
            size: 1,
            diff_id: Some(crate::hash::HashAlgorithm::Sha256.digest(b"y").to_string()),
            annotations: BTreeMap::new(),
        };
        let json = serde_json::to_string(&m).unwrap();
        let back: BlobMetadata = serde_json::from_str(&json).unwrap();
        assert_eq!(back, m);
        let d = m.to_descriptor().unwrap();
        assert_eq!(d.size(), 1);
    }
}
