//! Platform selection for daemon loads.

use std::fmt::Display;
use std::str::FromStr;

use anyhow::{Context, Result};
use oci_spec::image::{Descriptor, ImageIndex};

/// A requested platform: `os/arch[/variant]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformSpec {
    /// Operating system, e.g. `linux`.
    pub os: String,
    /// Architecture, e.g. `amd64`.
    pub arch: String,
    /// Optional variant, e.g. `v8`.
    pub variant: Option<String>,
}

impl FromStr for PlatformSpec {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split('/');
        let os = parts.next().filter(|p| !p.is_empty());
        let arch = parts.next().filter(|p| !p.is_empty());
        let variant = parts.next().map(str::to_string);
        anyhow::ensure!(
            parts.next().is_none(),
            "Too many components in platform {s}"
        );
        match (os, arch) {
            (Some(os), Some(arch)) => Ok(Self {
                os: os.to_string(),
                arch: arch.to_string(),
                variant,
            }),
            _ => anyhow::bail!("Invalid platform {s}; expected os/arch[/variant]"),
        }
    }
}

impl Display for PlatformSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.os, self.arch)?;
        if let Some(v) = &self.variant {
            write!(f, "/{v}")?;
        }
        Ok(())
    }
}

impl PlatformSpec {
    /// Whether a descriptor's platform record matches this request. A
    /// request without a variant matches any variant.
    pub fn matches(&self, platform: &oci_spec::image::Platform) -> bool {
        if platform.os().to_string() != self.os
            || platform.architecture().to_string() != self.arch
        {
            return false;
        }
        match &self.variant {
            Some(v) => platform.variant().as_deref() == Some(v.as_str()),
            None => true,
        }
    }
}

/// The host architecture in OCI spelling.
fn host_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "arm" => "arm",
        "s390x" => "s390x",
        "powerpc64" => "ppc64le",
        "riscv64" => "riscv64",
        other => other,
    }
}

/// The platforms to load when none were requested explicitly:
/// `$DOCKER_DEFAULT_PLATFORM`, else `linux/<host-arch>`.
pub fn default_platforms() -> Result<Vec<PlatformSpec>> {
    if let Ok(value) = std::env::var("DOCKER_DEFAULT_PLATFORM") {
        if !value.is_empty() {
            return value
                .split(',')
                .map(|p| p.trim().parse())
                .collect::<Result<_>>()
                .context("Parsing DOCKER_DEFAULT_PLATFORM");
        }
    }
    Ok(vec![PlatformSpec {
        os: "linux".into(),
        arch: host_arch().into(),
        variant: None,
    }])
}

/// Select the single index manifest matching the requested platforms.
/// Entries without a platform record never match.
pub fn select_manifest<'a>(
    index: &'a ImageIndex,
    requested: &[PlatformSpec],
) -> Result<&'a Descriptor> {
    let mut matches = index.manifests().iter().filter(|d| {
        d.platform()
            .as_ref()
            .is_some_and(|p| requested.iter().any(|r| r.matches(p)))
    });
    let selected = matches.next().ok_or_else(|| {
        let available: Vec<String> = index
            .manifests()
            .iter()
            .filter_map(|d| d.platform().as_ref())
            .map(|p| format!("{}/{}", p.os(), p.architecture()))
            .collect();
        anyhow::anyhow!(
            "No manifest matches platform(s) {}; index offers [{}]",
            requested
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", "),
            available.join(", ")
        )
    })?;
    if let Some(extra) = matches.next() {
        tracing::debug!(
            "Multiple manifests match; using {} over {}",
            selected.digest(),
            extra.digest()
        );
    }
    Ok(selected)
}
