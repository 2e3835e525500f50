//! Loading images into containerd.
//!
//! Blobs go into the content store under a lease (TTL one hour), with
//! garbage-collection labels tying manifests to their configs and
//! layers and indexes to their manifests; afterwards the image service
//! records the normalized reference pointing at the root descriptor.
//! The content Write protocol streams chunks with a running offset and
//! commits with the expected size and digest; `AlreadyExists` from a
//! commit is success.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use containerd_client::services::v1::content_client::ContentClient;
use containerd_client::services::v1::images_client::ImagesClient;
use containerd_client::services::v1::leases_client::LeasesClient;
use containerd_client::services::v1::{
    CreateImageRequest, Image, UpdateImageRequest, WriteAction, WriteContentRequest,
};
use containerd_client::types::Descriptor as ContainerdDescriptor;
use futures_util::StreamExt;
use oci_spec::image::Descriptor;
use tonic::transport::Channel;
use tonic::Request;

use crate::deploy::vfs::DeployVfs;
use crate::deploy::{LoadOperation, RootKind};
use crate::load::platform::{select_manifest, PlatformSpec};
use crate::registry::RegistryApi;

/// GC label referencing a manifest's config.
const GC_REF_CONFIG: &str = "containerd.io/gc.ref.content.config";
/// Lease expiration label.
const LEASE_EXPIRATION: &str = "containerd.io/lease.expiration";

const WRITE_CHUNK: usize = 256 * 1024;
/// Content-store upload parallelism.
const UPLOAD_WORKERS: usize = 4;

/// The content-store and image-service surface the load path needs.
/// The gRPC transport lives in [`ContainerdStore`]; tests substitute an
/// in-process fake.
pub trait ContentSink: Send + Sync {
    /// Commit one blob with the given GC labels.
    fn upload(
        &self,
        descriptor: &Descriptor,
        labels: BTreeMap<String, String>,
        data: Vec<u8>,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Create or update the image record for `name`.
    fn register_image(
        &self,
        name: &str,
        target: &Descriptor,
    ) -> impl std::future::Future<Output = Result<()>> + Send;
}

/// GC labels for a manifest blob: one per layer plus the config.
pub(crate) fn manifest_labels(
    manifest: &oci_spec::image::ImageManifest,
) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(
        GC_REF_CONFIG.to_string(),
        manifest.config().digest().to_string(),
    );
    for (i, layer) in manifest.layers().iter().enumerate() {
        labels.insert(
            format!("containerd.io/gc.ref.content.l.{i}"),
            layer.digest().to_string(),
        );
    }
    labels
}

/// GC labels for an index blob: one per child manifest.
pub(crate) fn index_labels(index: &oci_spec::image::ImageIndex) -> BTreeMap<String, String> {
    index
        .manifests()
        .iter()
        .enumerate()
        .map(|(i, m)| {
            (
                format!("containerd.io/gc.ref.content.m.{i}"),
                m.digest().to_string(),
            )
        })
        .collect()
}

/// Upload one operation into the content store and register the image.
///
/// With a platform filter and an index root, only the selected
/// platform's subtree is uploaded and the image record points at that
/// manifest; otherwise the whole tree plus the index is stored.
pub async fn load_operation<R: RegistryApi, S: ContentSink>(
    vfs: &DeployVfs<R>,
    op: &LoadOperation,
    platforms: &[PlatformSpec],
    sink: &S,
) -> Result<()> {
    let root_digest = op.root.descriptor.digest().to_string();
    let (register_target, selected, index) = match (op.root.kind, platforms.is_empty()) {
        (RootKind::Index, false) => {
            let index = vfs.image_index(&root_digest).await?;
            let chosen = select_manifest(&index, platforms)?.clone();
            (chosen.clone(), vec![chosen], None)
        }
        (RootKind::Index, true) => {
            let index = vfs.image_index(&root_digest).await?;
            let manifests = index.manifests().to_vec();
            (op.root.descriptor.clone(), manifests, Some(index))
        }
        (RootKind::Manifest, _) => (
            op.root.descriptor.clone(),
            vec![op.root.descriptor.clone()],
            None,
        ),
    };

    for manifest_descriptor in &selected {
        let digest = manifest_descriptor.digest().to_string();
        let manifest = vfs.image(&digest).await?;

        // Layers and config first, in parallel.
        let mut blobs: Vec<Descriptor> = manifest.layers().clone();
        blobs.push(manifest.config().clone());
        let mut uploads = futures_util::stream::iter(blobs.iter().map(|descriptor| {
            let blob_digest = descriptor.digest().to_string();
            async move {
                let data = vfs.read_all(&blob_digest).await?;
                sink.upload(descriptor, BTreeMap::new(), data.as_ref().clone())
                    .await
                    .with_context(|| format!("Storing {blob_digest}"))
            }
        }))
        .buffer_unordered(UPLOAD_WORKERS);
        while let Some(result) = uploads.next().await {
            result?;
        }

        // The manifest itself, carrying the GC references.
        let data = vfs.read_all(&digest).await?;
        sink.upload(
            manifest_descriptor,
            manifest_labels(&manifest),
            data.as_ref().clone(),
        )
        .await
        .with_context(|| format!("Storing manifest {digest}"))?;
    }

    if let Some(index) = &index {
        let data = vfs.read_all(&root_digest).await?;
        sink.upload(&op.root.descriptor, index_labels(index), data.as_ref().clone())
            .await
            .with_context(|| format!("Storing index {root_digest}"))?;
    }

    let name = super::normalize_load_reference(&op.reference)?;
    sink.register_image(&name, &register_target)
        .await
        .with_context(|| format!("Recording image {name}"))
}

fn to_containerd_descriptor(d: &Descriptor) -> ContainerdDescriptor {
    ContainerdDescriptor {
        media_type: d.media_type().to_string(),
        digest: d.digest().to_string(),
        size: d.size() as i64,
        annotations: d
            .annotations()
            .as_ref()
            .map(|a| a.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default(),
    }
}

/// The gRPC-backed containerd store.
pub struct ContainerdStore {
    channel: Channel,
    namespace: String,
    lease_id: String,
}

impl ContainerdStore {
    /// Connect to the containerd socket and open a one-hour lease.
    pub async fn connect(address: &str, namespace: &str) -> Result<Self> {
        let channel = tokio::time::timeout(
            std::time::Duration::from_secs(10),
            containerd_client::connect(address),
        )
        .await
        .map_err(|_| anyhow::anyhow!("Timed out dialing containerd at {address}"))?
        .with_context(|| format!("Dialing containerd at {address}"))?;

        let lease_id = format!("img-load-{}", std::process::id());
        let expiration = (chrono::Utc::now() + chrono::Duration::hours(1)).to_rfc3339();
        let mut leases = LeasesClient::new(channel.clone());
        let request = containerd_client::services::v1::CreateRequest {
            id: lease_id.clone(),
            labels: [(LEASE_EXPIRATION.to_string(), expiration)]
                .into_iter()
                .collect(),
        };
        let response = leases
            .create(Self::decorate(request, namespace, None))
            .await;
        match response {
            Ok(_) => {}
            Err(status) if status.code() == tonic::Code::AlreadyExists => {}
            Err(status) => return Err(status).context("Creating containerd lease"),
        }
        Ok(Self {
            channel,
            namespace: namespace.to_string(),
            lease_id,
        })
    }

    fn decorate<T>(message: T, namespace: &str, lease: Option<&str>) -> Request<T> {
        let mut request = Request::new(message);
        let metadata = request.metadata_mut();
        metadata.insert(
            "containerd-namespace",
            namespace.parse().expect("namespace metadata value"),
        );
        if let Some(lease) = lease {
            metadata.insert(
                "containerd-lease",
                lease.parse().expect("lease metadata value"),
            );
        }
        request
    }

    fn request<T>(&self, message: T) -> Request<T> {
        Self::decorate(message, &self.namespace, Some(&self.lease_id))
    }
}

impl ContentSink for ContainerdStore {
    fn upload(
        &self,
        descriptor: &Descriptor,
        labels: BTreeMap<String, String>,
        data: Vec<u8>,
    ) -> impl std::future::Future<Output = Result<()>> + Send {
        let digest = descriptor.digest().to_string();
        let total = data.len() as i64;
        let reference = format!("img-load-{digest}");
        let mut content = ContentClient::new(self.channel.clone());
        let namespace = self.namespace.clone();
        let lease = self.lease_id.clone();
        async move {
            // Chunked writes followed by a labeled commit, all on one
            // stream.
            let mut requests = Vec::new();
            for (i, chunk) in data.chunks(WRITE_CHUNK).enumerate() {
                requests.push(WriteContentRequest {
                    action: WriteAction::Write as i32,
                    r#ref: reference.clone(),
                    total,
                    expected: digest.clone(),
                    offset: (i * WRITE_CHUNK) as i64,
                    data: chunk.to_vec(),
                    ..Default::default()
                });
            }
            requests.push(WriteContentRequest {
                action: WriteAction::Commit as i32,
                r#ref: reference.clone(),
                total,
                expected: digest.clone(),
                offset: total,
                labels: labels.into_iter().collect(),
                ..Default::default()
            });
            let request = Self::decorate(
                futures_util::stream::iter(requests),
                &namespace,
                Some(&lease),
            );
            let response = match content.write(request).await {
                Ok(response) => response,
                Err(status) if status.code() == tonic::Code::AlreadyExists => {
                    tracing::debug!("{digest} already in the content store");
                    return Ok(());
                }
                Err(status) => {
                    return Err(status).with_context(|| format!("Writing {digest}"))
                }
            };
            // Drain responses until the commit acknowledgement names our
            // digest.
            let mut stream = response.into_inner();
            while let Some(message) = stream.next().await {
                let message = match message {
                    Ok(m) => m,
                    Err(status) if status.code() == tonic::Code::AlreadyExists => return Ok(()),
                    Err(status) => {
                        return Err(status).with_context(|| format!("Committing {digest}"))
                    }
                };
                if message.action == WriteAction::Commit as i32 {
                    anyhow::ensure!(
                        message.digest == digest,
                        "containerd committed {} where {digest} was expected",
                        message.digest
                    );
                    return Ok(());
                }
            }
            anyhow::bail!("containerd closed the write stream for {digest} without a commit")
        }
    }

    fn register_image(
        &self,
        name: &str,
        target: &Descriptor,
    ) -> impl std::future::Future<Output = Result<()>> + Send {
        let mut images = ImagesClient::new(self.channel.clone());
        let image = Image {
            name: name.to_string(),
            target: Some(to_containerd_descriptor(target)),
            ..Default::default()
        };
        let create = self.request(CreateImageRequest {
            image: Some(image.clone()),
            ..Default::default()
        });
        let update = self.request(UpdateImageRequest {
            image: Some(image),
            ..Default::default()
        });
        async move {
            match images.create(create).await {
                Ok(_) => Ok(()),
                Err(status) if status.code() == tonic::Code::AlreadyExists => {
                    images.update(update).await.context("Updating image record")?;
                    Ok(())
                }
                Err(status) => Err(status).context("Creating image record"),
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records every content-store mutation.
    #[derive(Default)]
    pub(crate) struct FakeSink {
        pub(crate) uploads: Mutex<Vec<(String, BTreeMap<String, String>)>>,
        pub(crate) images: Mutex<Vec<(String, String)>>,
    }

    impl ContentSink for FakeSink {
        fn upload(
            &self,
            descriptor: &Descriptor,
            labels: BTreeMap<String, String>,
            _data: Vec<u8>,
        ) -> impl std::future::Future<Output = Result<()>> + Send {
            self.uploads
                .lock()
                .unwrap()
                .push((descriptor.digest().to_string(), labels));
            async { Ok(()) }
        }

        fn register_image(
            &self,
            name: &str,
            target: &Descriptor,
        ) -> impl std::future::Future<Output = Result<()>> + Send {
            self.images
                .lock()
                .unwrap()
                .push((name.to_string(), target.digest().to_string()));
            async { Ok(()) }
        }
    }

    #[test]
    fn test_labels() {
        let manifest: oci_spec::image::ImageManifest = serde_json::from_value(serde_json::json!({
            "schemaVersion": 2,
            "config": {
                "mediaType": "application/vnd.oci.image.config.v1+json",
                "digest": "sha256:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa",
                "size": 2
            },
            "layers": [
                {
                    "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
                    "digest": "sha256:bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb",
                    "size": 2
                },
                {
                    "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
                    "digest": "sha256:cccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccc",
                    "size": 2
                }
            ]
        }))
        .unwrap();
        let labels = manifest_labels(&manifest);
        assert_eq!(
            labels.get(GC_REF_CONFIG).unwrap(),
            &manifest.config().digest().to_string()
        );
        assert_eq!(
            labels.get("containerd.io/gc.ref.content.l.0").unwrap(),
            &manifest.layers()[0].digest().to_string()
        );
        assert_eq!(
            labels.get("containerd.io/gc.ref.content.l.1").unwrap(),
            &manifest.layers()[1].digest().to_string()
        );
    }
}
