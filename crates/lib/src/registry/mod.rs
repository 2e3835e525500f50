//! OCI distribution (registry) client.
//!
//! Implements the subset of the distribution protocol the orchestrators
//! need: blob existence checks, streaming blob reads, monolithic blob
//! uploads (POST then PUT), and manifest reads/writes. Authentication
//! uses the standard token handshake; token fetches are serialized per
//! (registry, repository) so concurrent workers sharing an auth context
//! never stampede the token endpoint.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::TryStreamExt;
use serde::Deserialize;
use tokio::io::AsyncRead;

pub mod auth;

/// A streaming blob body.
pub type BlobReader = Pin<Box<dyn AsyncRead + Send>>;

/// Accept header value covering manifests and indexes of both OCI and
/// Docker flavors.
const MANIFEST_ACCEPT: &str = "application/vnd.oci.image.manifest.v1+json, \
     application/vnd.oci.image.index.v1+json, \
     application/vnd.docker.distribution.manifest.v2+json, \
     application/vnd.docker.distribution.manifest.list.v2+json";

const RETRY_ATTEMPTS: u32 = 3;

/// The registry operations the orchestrators depend on. Concrete
/// transport in [`RegistryClient`]; tests substitute in-process fakes.
pub trait RegistryApi: Send + Sync + 'static {
    /// Whether the registry already has the blob.
    fn blob_exists(
        &self,
        registry: &str,
        repository: &str,
        digest: &str,
    ) -> impl std::future::Future<Output = Result<bool>> + Send;

    /// Open a streaming read of a blob.
    fn blob_reader(
        &self,
        registry: &str,
        repository: &str,
        digest: &str,
    ) -> impl std::future::Future<Output = Result<BlobReader>> + Send;

    /// Upload a blob of known digest and size.
    fn upload_blob(
        &self,
        registry: &str,
        repository: &str,
        digest: &str,
        size: u64,
        reader: BlobReader,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Write a small in-memory blob (an image config). Goes with the
    /// manifest writes rather than the layer transfer machinery.
    fn put_blob(
        &self,
        registry: &str,
        repository: &str,
        digest: &str,
        bytes: Vec<u8>,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Fetch a manifest by tag or digest; returns (bytes, media type).
    fn get_manifest(
        &self,
        registry: &str,
        repository: &str,
        reference: &str,
    ) -> impl std::future::Future<Output = Result<(Vec<u8>, String)>> + Send;

    /// Write a manifest (or index) under a tag or digest reference.
    fn put_manifest(
        &self,
        registry: &str,
        repository: &str,
        reference: &str,
        media_type: &str,
        bytes: Vec<u8>,
    ) -> impl std::future::Future<Output = Result<()>> + Send;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

/// Serializes token refresh per (registry, repository, push) and caches
/// the resulting Authorization header.
#[derive(Default)]
struct AuthSlots {
    inner: std::sync::Mutex<HashMap<(String, String, bool), Arc<tokio::sync::Mutex<Option<String>>>>>,
}

impl AuthSlots {
    fn slot(
        &self,
        registry: &str,
        repository: &str,
        push: bool,
    ) -> Arc<tokio::sync::Mutex<Option<String>>> {
        let mut map = self.inner.lock().expect("auth slot lock poisoned");
        map.entry((registry.to_string(), repository.to_string(), push))
            .or_default()
            .clone()
    }
}

/// The reqwest-backed registry client.
pub struct RegistryClient {
    http: reqwest::Client,
    slots: AuthSlots,
}

impl Default for RegistryClient {
    fn default() -> Self {
        Self::new()
    }
}

/// The API endpoint hostname for a registry name. `docker.io` is an
/// alias that never serves the API itself.
fn endpoint_host(registry: &str) -> &str {
    match registry {
        "docker.io" | "index.docker.io" => "registry-1.docker.io",
        other => other,
    }
}

fn base_url(registry: &str) -> String {
    let host = endpoint_host(registry);
    let insecure = host.starts_with("localhost")
        || host.starts_with("127.0.0.1")
        || host.starts_with("[::1]");
    let scheme = if insecure { "http" } else { "https" };
    format!("{scheme}://{host}")
}

impl RegistryClient {
    /// Create a client with the default connection settings.
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .expect("constructing HTTP client");
        Self {
            http,
            slots: AuthSlots::default(),
        }
    }

    /// The cached Authorization header for a repository scope,
    /// performing the token handshake on first use. Refresh for the
    /// same scope is serialized by the slot mutex.
    async fn auth_header(
        &self,
        registry: &str,
        repository: &str,
        push: bool,
    ) -> Result<Option<String>> {
        let slot = self.slots.slot(registry, repository, push);
        let mut guard = slot.lock().await;
        if let Some(header) = &*guard {
            return Ok(Some(header.clone()));
        }
        let header = self.handshake(registry, repository, push).await?;
        guard.clone_from(&header);
        Ok(header)
    }

    fn invalidate_auth(&self, registry: &str, repository: &str, push: bool) {
        let slot = self.slots.slot(registry, repository, push);
        if let Ok(mut guard) = slot.try_lock() {
            *guard = None;
        }
    }

    async fn handshake(
        &self,
        registry: &str,
        repository: &str,
        push: bool,
    ) -> Result<Option<String>> {
        let ping = self
            .http
            .get(format!("{}/v2/", base_url(registry)))
            .send()
            .await
            .with_context(|| format!("Reaching registry {registry}"))?;
        if ping.status() != reqwest::StatusCode::UNAUTHORIZED {
            return Ok(None);
        }
        let challenge = ping
            .headers()
            .get(reqwest::header::WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .unwrap_or_default();
        let credential = auth::credential_for(registry).await;
        let Some(challenge) = auth::parse_bearer_challenge(&challenge) else {
            // Basic (or unknown) challenge: present the credential
            // directly.
            return Ok(credential.basic_header());
        };
        let scope = if push {
            format!("repository:{repository}:pull,push")
        } else {
            format!("repository:{repository}:pull")
        };
        let mut request = self
            .http
            .get(&challenge.realm)
            .query(&[("scope", scope.as_str())]);
        if let Some(service) = &challenge.service {
            request = request.query(&[("service", service.as_str())]);
        }
        if let Some(basic) = credential.basic_header() {
            request = request.header(reqwest::header::AUTHORIZATION, basic);
        }
        let response = request
            .send()
            .await
            .with_context(|| format!("Fetching token from {}", challenge.realm))?;
        anyhow::ensure!(
            response.status().is_success(),
            "Token endpoint {} answered {}",
            challenge.realm,
            response.status()
        );
        let body = response.bytes().await?;
        let parsed: TokenResponse =
            serde_json::from_slice(&body).context("Parsing token response")?;
        let token = parsed
            .token
            .or(parsed.access_token)
            .context("Token response carried no token")?;
        Ok(Some(format!("Bearer {token}")))
    }

    /// Issue an idempotent request with retries; 401 responses
    /// invalidate the cached token once.
    async fn send_idempotent(
        &self,
        registry: &str,
        repository: &str,
        push: bool,
        build: impl Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    ) -> Result<reqwest::Response> {
        let mut refreshed = false;
        let mut last_err: Option<anyhow::Error> = None;
        for attempt in 0..RETRY_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(100 << attempt)).await;
            }
            let mut request = build(&self.http);
            if let Some(header) = self.auth_header(registry, repository, push).await? {
                request = request.header(reqwest::header::AUTHORIZATION, header);
            }
            match request.send().await {
                Ok(response) if response.status() == reqwest::StatusCode::UNAUTHORIZED => {
                    self.invalidate_auth(registry, repository, push);
                    if refreshed {
                        anyhow::bail!("Registry {registry} rejected our credentials");
                    }
                    refreshed = true;
                }
                Ok(response) => return Ok(response),
                Err(e) => last_err = Some(e.into()),
            }
        }
        Err(last_err
            .unwrap_or_else(|| anyhow::anyhow!("Registry {registry} kept answering 401")))
    }
}

impl RegistryApi for RegistryClient {
    fn blob_exists(
        &self,
        registry: &str,
        repository: &str,
        digest: &str,
    ) -> impl std::future::Future<Output = Result<bool>> + Send {
        async move {
            let url = format!("{}/v2/{repository}/blobs/{digest}", base_url(registry));
            let response = self
                .send_idempotent(registry, repository, false, |c| c.head(&url))
                .await?;
            match response.status() {
                reqwest::StatusCode::OK => Ok(true),
                reqwest::StatusCode::NOT_FOUND => Ok(false),
                status => anyhow::bail!("HEAD {url} answered {status}"),
            }
        }
    }

    fn blob_reader(
        &self,
        registry: &str,
        repository: &str,
        digest: &str,
    ) -> impl std::future::Future<Output = Result<BlobReader>> + Send {
        async move {
            let url = format!("{}/v2/{repository}/blobs/{digest}", base_url(registry));
            let response = self
                .send_idempotent(registry, repository, false, |c| c.get(&url))
                .await?;
            anyhow::ensure!(
                response.status().is_success(),
                "GET {url} answered {}",
                response.status()
            );
            let stream = response.bytes_stream().map_err(std::io::Error::other);
            Ok(Box::pin(tokio_util::io::StreamReader::new(stream)) as BlobReader)
        }
    }

    fn upload_blob(
        &self,
        registry: &str,
        repository: &str,
        digest: &str,
        size: u64,
        reader: BlobReader,
    ) -> impl std::future::Future<Output = Result<()>> + Send {
        async move {
            let start_url = format!("{}/v2/{repository}/blobs/uploads/", base_url(registry));
            let started = self
                .send_idempotent(registry, repository, true, |c| {
                    c.post(&start_url).header(reqwest::header::CONTENT_LENGTH, 0)
                })
                .await?;
            anyhow::ensure!(
                started.status() == reqwest::StatusCode::ACCEPTED,
                "Starting upload at {start_url} answered {}",
                started.status()
            );
            let location = started
                .headers()
                .get(reqwest::header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .context("Upload start response carried no Location")?;
            let location = if location.starts_with("http://") || location.starts_with("https://")
            {
                location.to_string()
            } else {
                format!("{}{location}", base_url(registry))
            };
            let separator = if location.contains('?') { '&' } else { '?' };
            let put_url = format!("{location}{separator}digest={digest}");

            // The body is a one-shot stream; a mid-flight token expiry
            // surfaces as an upload error and the build-level retry
            // starts over.
            let mut request = self
                .http
                .put(&put_url)
                .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
                .header(reqwest::header::CONTENT_LENGTH, size)
                .body(reqwest::Body::wrap_stream(
                    tokio_util::io::ReaderStream::new(reader),
                ));
            if let Some(header) = self.auth_header(registry, repository, true).await? {
                request = request.header(reqwest::header::AUTHORIZATION, header);
            }
            let response = request
                .send()
                .await
                .with_context(|| format!("Uploading {digest} to {registry}/{repository}"))?;
            anyhow::ensure!(
                response.status() == reqwest::StatusCode::CREATED
                    || response.status().is_success(),
                "Committing {digest} answered {}",
                response.status()
            );
            tracing::debug!("Uploaded {digest} to {registry}/{repository}");
            Ok(())
        }
    }

    fn put_blob(
        &self,
        registry: &str,
        repository: &str,
        digest: &str,
        bytes: Vec<u8>,
    ) -> impl std::future::Future<Output = Result<()>> + Send {
        async move {
            let size = bytes.len() as u64;
            let reader = Box::pin(std::io::Cursor::new(bytes)) as BlobReader;
            self.upload_blob(registry, repository, digest, size, reader)
                .await
        }
    }

    fn get_manifest(
        &self,
        registry: &str,
        repository: &str,
        reference: &str,
    ) -> impl std::future::Future<Output = Result<(Vec<u8>, String)>> + Send {
        async move {
            let url = format!(
                "{}/v2/{repository}/manifests/{reference}",
                base_url(registry)
            );
            let response = self
                .send_idempotent(registry, repository, false, |c| {
                    c.get(&url).header(reqwest::header::ACCEPT, MANIFEST_ACCEPT)
                })
                .await?;
            anyhow::ensure!(
                response.status().is_success(),
                "GET {url} answered {}",
                response.status()
            );
            let media_type = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("application/vnd.oci.image.manifest.v1+json")
                .to_string();
            Ok((response.bytes().await?.to_vec(), media_type))
        }
    }

    fn put_manifest(
        &self,
        registry: &str,
        repository: &str,
        reference: &str,
        media_type: &str,
        bytes: Vec<u8>,
    ) -> impl std::future::Future<Output = Result<()>> + Send {
        async move {
            let url = format!(
                "{}/v2/{repository}/manifests/{reference}",
                base_url(registry)
            );
            let media_type = media_type.to_string();
            let response = self
                .send_idempotent(registry, repository, true, |c| {
                    c.put(&url)
                        .header(reqwest::header::CONTENT_TYPE, media_type.clone())
                        .body(bytes.clone())
                })
                .await?;
            anyhow::ensure!(
                response.status().is_success(),
                "PUT {url} answered {}",
                response.status()
            );
            tracing::debug!("Wrote manifest {reference} to {registry}/{repository}");
            Ok(())
        }
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;

    /// An in-process registry fake recording every mutation.
    #[derive(Default)]
    pub(crate) struct FakeRegistry {
        /// Blobs present, keyed `<registry>/<repo>@<digest>`.
        pub(crate) blobs: Mutex<HashMap<String, Vec<u8>>>,
        /// Manifests written, keyed `<registry>/<repo>:<reference>`.
        pub(crate) manifests: Mutex<HashMap<String, Vec<u8>>>,
        /// Number of (layer) blob uploads performed.
        pub(crate) upload_count: AtomicUsize,
        /// Number of small-blob (config) puts performed.
        pub(crate) blob_put_count: AtomicUsize,
        /// Number of manifest puts performed.
        pub(crate) manifest_put_count: AtomicUsize,
        /// Digests whose upload should fail.
        pub(crate) failing: Mutex<HashSet<String>>,
        /// Delay injected into uploads, for concurrency tests.
        pub(crate) upload_delay: Option<std::time::Duration>,
    }

    impl FakeRegistry {
        pub(crate) fn blob_key(registry: &str, repository: &str, digest: &str) -> String {
            format!("{registry}/{repository}@{digest}")
        }

        pub(crate) fn seed_blob(
            &self,
            registry: &str,
            repository: &str,
            digest: &str,
            data: &[u8],
        ) {
            self.blobs
                .lock()
                .unwrap()
                .insert(Self::blob_key(registry, repository, digest), data.to_vec());
        }

        pub(crate) fn uploads(&self) -> usize {
            self.upload_count.load(Ordering::SeqCst)
        }
    }

    impl RegistryApi for FakeRegistry {
        fn blob_exists(
            &self,
            registry: &str,
            repository: &str,
            digest: &str,
        ) -> impl std::future::Future<Output = Result<bool>> + Send {
            let key = Self::blob_key(registry, repository, digest);
            let present = self.blobs.lock().unwrap().contains_key(&key);
            async move { Ok(present) }
        }

        fn blob_reader(
            &self,
            registry: &str,
            repository: &str,
            digest: &str,
        ) -> impl std::future::Future<Output = Result<BlobReader>> + Send {
            let key = Self::blob_key(registry, repository, digest);
            let data = self.blobs.lock().unwrap().get(&key).cloned();
            async move {
                let data = data.with_context(|| format!("Blob {key} not found"))?;
                Ok(Box::pin(std::io::Cursor::new(data)) as BlobReader)
            }
        }

        fn upload_blob(
            &self,
            registry: &str,
            repository: &str,
            digest: &str,
            _size: u64,
            mut reader: BlobReader,
        ) -> impl std::future::Future<Output = Result<()>> + Send {
            let key = Self::blob_key(registry, repository, digest);
            let failing = self.failing.lock().unwrap().contains(digest);
            let delay = self.upload_delay;
            async move {
                use tokio::io::AsyncReadExt;
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                self.upload_count.fetch_add(1, Ordering::SeqCst);
                anyhow::ensure!(!failing, "Injected upload failure for {key}");
                let mut data = Vec::new();
                reader.read_to_end(&mut data).await?;
                self.blobs.lock().unwrap().insert(key, data);
                Ok(())
            }
        }

        fn put_blob(
            &self,
            registry: &str,
            repository: &str,
            digest: &str,
            bytes: Vec<u8>,
        ) -> impl std::future::Future<Output = Result<()>> + Send {
            let key = Self::blob_key(registry, repository, digest);
            self.blob_put_count.fetch_add(1, Ordering::SeqCst);
            self.blobs.lock().unwrap().insert(key, bytes);
            async move { Ok(()) }
        }

        fn get_manifest(
            &self,
            registry: &str,
            repository: &str,
            reference: &str,
        ) -> impl std::future::Future<Output = Result<(Vec<u8>, String)>> + Send {
            let key = format!("{registry}/{repository}:{reference}");
            let found = self.manifests.lock().unwrap().get(&key).cloned();
            async move {
                let bytes = found.with_context(|| format!("Manifest {key} not found"))?;
                Ok((bytes, "application/vnd.oci.image.manifest.v1+json".into()))
            }
        }

        fn put_manifest(
            &self,
            registry: &str,
            repository: &str,
            reference: &str,
            _media_type: &str,
            bytes: Vec<u8>,
        ) -> impl std::future::Future<Output = Result<()>> + Send {
            let key = format!("{registry}/{repository}:{reference}");
            self.manifest_put_count.fetch_add(1, Ordering::SeqCst);
            self.manifests.lock().unwrap().insert(key, bytes);
            async move { Ok(()) }
        }
    }
}
