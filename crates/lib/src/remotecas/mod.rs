//! Remote content-addressable store client (REAPI).
//!
//! Small blobs travel over the batch RPCs, anything larger over the
//! ByteStream service; the split point is the server's advertised
//! `max_batch_total_size_bytes`, fetched once at construction and
//! clamped to sane bounds for reads. Wire digests are lowercase hex.

use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use futures_util::{StreamExt, TryStreamExt};
use http::uri::PathAndQuery;
use tonic::codec::ProstCodec;
use tonic::transport::Channel;

use crate::registry::BlobReader;

pub mod proto;

const CAS_FIND_MISSING: &str =
    "/build.bazel.remote.execution.v2.ContentAddressableStorage/FindMissingBlobs";
const CAS_BATCH_UPDATE: &str =
    "/build.bazel.remote.execution.v2.ContentAddressableStorage/BatchUpdateBlobs";
const CAS_BATCH_READ: &str =
    "/build.bazel.remote.execution.v2.ContentAddressableStorage/BatchReadBlobs";
const CAPABILITIES_GET: &str = "/build.bazel.remote.execution.v2.Capabilities/GetCapabilities";
const BYTESTREAM_READ: &str = "/google.bytestream.ByteStream/Read";
const BYTESTREAM_WRITE: &str = "/google.bytestream.ByteStream/Write";

/// Default batch ceiling when the server does not advertise one.
const DEFAULT_BATCH_LIMIT: i64 = 1 << 20;
/// Read batches are clamped into this window.
const READ_BATCH_MIN: i64 = 1 << 20;
const READ_BATCH_MAX: i64 = 4 << 20;
/// Headroom subtracted from the server limit for request framing.
const BATCH_OVERHEAD: i64 = 64 << 10;

const STREAM_CHUNK: usize = 1 << 20;

static UPLOAD_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A blob identity on the wire: hex hash plus size.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CasDigest {
    /// Lowercase hex hash.
    pub hash: String,
    /// Blob size in bytes.
    pub size: u64,
}

impl CasDigest {
    fn to_proto(&self) -> proto::Digest {
        proto::Digest {
            hash: self.hash.clone(),
            size_bytes: self.size as i64,
        }
    }
}

/// Translate a `grpc://` / `grpcs://` endpoint to a tonic URI.
fn endpoint_uri(endpoint: &str) -> String {
    if let Some(rest) = endpoint.strip_prefix("grpcs://") {
        format!("https://{rest}")
    } else if let Some(rest) = endpoint.strip_prefix("grpc://") {
        format!("http://{rest}")
    } else {
        endpoint.to_string()
    }
}

/// The remote CAS client.
pub struct RemoteCasClient {
    channel: Channel,
    instance_name: String,
    batch_limit: i64,
}

impl RemoteCasClient {
    /// Connect and negotiate capabilities. A capabilities failure is
    /// not fatal; defaults apply.
    pub async fn connect(endpoint: &str, instance_name: &str) -> Result<Self> {
        let channel = Channel::from_shared(endpoint_uri(endpoint))
            .with_context(|| format!("Invalid remote CAS endpoint {endpoint}"))?
            .connect()
            .await
            .with_context(|| format!("Dialing remote CAS at {endpoint}"))?;
        let mut client = Self {
            channel,
            instance_name: instance_name.to_string(),
            batch_limit: DEFAULT_BATCH_LIMIT,
        };
        match client.fetch_capabilities().await {
            Ok(Some(caps)) => {
                if caps.max_batch_total_size_bytes > 0 {
                    client.batch_limit = caps.max_batch_total_size_bytes;
                }
                if !caps
                    .digest_functions
                    .contains(&proto::DIGEST_FUNCTION_SHA256)
                {
                    tracing::warn!("Remote CAS does not advertise sha256 support");
                }
            }
            Ok(None) => {}
            Err(e) => tracing::debug!("Capabilities probe failed: {e:#}"),
        }
        Ok(client)
    }

    async fn grpc(&self) -> Result<tonic::client::Grpc<Channel>> {
        let mut grpc = tonic::client::Grpc::new(self.channel.clone());
        grpc.ready()
            .await
            .context("Remote CAS connection not ready")?;
        Ok(grpc)
    }

    async fn fetch_capabilities(&self) -> Result<Option<proto::CacheCapabilities>> {
        let mut grpc = self.grpc().await?;
        let codec: ProstCodec<proto::GetCapabilitiesRequest, proto::ServerCapabilities> =
            ProstCodec::default();
        let response = grpc
            .unary(
                tonic::Request::new(proto::GetCapabilitiesRequest {
                    instance_name: self.instance_name.clone(),
                }),
                PathAndQuery::from_static(CAPABILITIES_GET),
                codec,
            )
            .await
            .map_err(|status| anyhow::anyhow!("GetCapabilities: {status}"))?;
        Ok(response.into_inner().cache_capabilities)
    }

    /// The batch ceiling for reads, clamped to 1–4 MiB.
    fn read_batch_limit(&self) -> i64 {
        self.batch_limit.clamp(READ_BATCH_MIN, READ_BATCH_MAX)
    }

    /// The batch ceiling for writes: the server limit minus framing
    /// headroom.
    fn write_batch_limit(&self) -> i64 {
        (self.batch_limit - BATCH_OVERHEAD).max(BATCH_OVERHEAD)
    }

    /// Which of the given blobs the server does not have.
    pub async fn find_missing(&self, digests: &[CasDigest]) -> Result<Vec<CasDigest>> {
        let mut grpc = self.grpc().await?;
        let codec: ProstCodec<proto::FindMissingBlobsRequest, proto::FindMissingBlobsResponse> =
            ProstCodec::default();
        let request = proto::FindMissingBlobsRequest {
            instance_name: self.instance_name.clone(),
            blob_digests: digests.iter().map(CasDigest::to_proto).collect(),
        };
        let response = grpc
            .unary(
                tonic::Request::new(request),
                PathAndQuery::from_static(CAS_FIND_MISSING),
                codec,
            )
            .await
            .map_err(|status| anyhow::anyhow!("FindMissingBlobs: {status}"))?;
        Ok(response
            .into_inner()
            .missing_blob_digests
            .into_iter()
            .map(|d| CasDigest {
                hash: d.hash,
                size: d.size_bytes as u64,
            })
            .collect())
    }

    /// Read a whole blob, choosing batch or stream by size.
    pub async fn read_blob(&self, digest: &CasDigest) -> Result<Vec<u8>> {
        if (digest.size as i64) <= self.read_batch_limit() {
            return self.batch_read(digest).await;
        }
        use tokio::io::AsyncReadExt;
        let mut reader = self.reader_for_blob(&digest.hash, digest.size).await?;
        let mut data = Vec::with_capacity(digest.size as usize);
        reader.read_to_end(&mut data).await?;
        Ok(data)
    }

    async fn batch_read(&self, digest: &CasDigest) -> Result<Vec<u8>> {
        let mut grpc = self.grpc().await?;
        let codec: ProstCodec<proto::BatchReadBlobsRequest, proto::BatchReadBlobsResponse> =
            ProstCodec::default();
        let request = proto::BatchReadBlobsRequest {
            instance_name: self.instance_name.clone(),
            digests: vec![digest.to_proto()],
        };
        let response = grpc
            .unary(
                tonic::Request::new(request),
                PathAndQuery::from_static(CAS_BATCH_READ),
                codec,
            )
            .await
            .map_err(|status| anyhow::anyhow!("BatchReadBlobs: {status}"))?;
        let entry = response
            .into_inner()
            .responses
            .into_iter()
            .next()
            .with_context(|| format!("Empty batch read response for {}", digest.hash))?;
        if let Some(status) = entry.status {
            anyhow::ensure!(
                status.code == 0,
                "Remote CAS read of {} failed: {}",
                digest.hash,
                status.message
            );
        }
        Ok(entry.data)
    }

    /// A streaming reader over a blob. Dropping the reader cancels the
    /// underlying stream.
    pub async fn reader_for_blob(&self, hash: &str, size: u64) -> Result<BlobReader> {
        let mut grpc = self.grpc().await?;
        let codec: ProstCodec<proto::ReadRequest, proto::ReadResponse> = ProstCodec::default();
        let resource_name = format!(
            "{}/blobs/{hash}/{size}",
            self.instance_name.trim_end_matches('/')
        );
        let request = proto::ReadRequest {
            resource_name,
            read_offset: 0,
            read_limit: 0,
        };
        let response = grpc
            .server_streaming(
                tonic::Request::new(request),
                PathAndQuery::from_static(BYTESTREAM_READ),
                codec,
            )
            .await
            .map_err(|status| anyhow::anyhow!("ByteStream read of {hash}: {status}"))?;
        let stream = response
            .into_inner()
            .map_ok(|message| bytes::Bytes::from(message.data))
            .map_err(std::io::Error::other);
        Ok(Box::pin(tokio_util::io::StreamReader::new(stream)) as BlobReader)
    }

    /// Write a whole blob, choosing batch or stream by size.
    pub async fn write_blob(&self, digest: &CasDigest, data: Vec<u8>) -> Result<()> {
        anyhow::ensure!(
            data.len() as u64 == digest.size,
            "Blob {} is {} bytes, digest says {}",
            digest.hash,
            data.len(),
            digest.size
        );
        if (digest.size as i64) <= self.write_batch_limit() {
            return self.batch_write(digest, data).await;
        }
        self.stream_write(digest, data).await
    }

    async fn batch_write(&self, digest: &CasDigest, data: Vec<u8>) -> Result<()> {
        let mut grpc = self.grpc().await?;
        let codec: ProstCodec<proto::BatchUpdateBlobsRequest, proto::BatchUpdateBlobsResponse> =
            ProstCodec::default();
        let request = proto::BatchUpdateBlobsRequest {
            instance_name: self.instance_name.clone(),
            requests: vec![proto::BatchUpdateBlobsRequestEntry {
                digest: Some(digest.to_proto()),
                data,
            }],
        };
        let response = grpc
            .unary(
                tonic::Request::new(request),
                PathAndQuery::from_static(CAS_BATCH_UPDATE),
                codec,
            )
            .await
            .map_err(|status| anyhow::anyhow!("BatchUpdateBlobs: {status}"))?;
        for entry in response.into_inner().responses {
            if let Some(status) = entry.status {
                anyhow::ensure!(
                    status.code == 0,
                    "Remote CAS write of {} failed: {}",
                    digest.hash,
                    status.message
                );
            }
        }
        Ok(())
    }

    async fn stream_write(&self, digest: &CasDigest, data: Vec<u8>) -> Result<()> {
        let mut grpc = self.grpc().await?;
        let codec: ProstCodec<proto::WriteRequest, proto::WriteResponse> = ProstCodec::default();
        let upload_id = format!(
            "{}-{}",
            std::process::id(),
            UPLOAD_COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        let resource_name = format!(
            "{}/uploads/{upload_id}/blobs/{}/{}",
            self.instance_name.trim_end_matches('/'),
            digest.hash,
            digest.size
        );
        let total = data.len();
        let chunks: Vec<proto::WriteRequest> = data
            .chunks(STREAM_CHUNK)
            .enumerate()
            .map(|(i, chunk)| {
                let offset = i * STREAM_CHUNK;
                proto::WriteRequest {
                    resource_name: resource_name.clone(),
                    write_offset: offset as i64,
                    finish_write: offset + chunk.len() == total,
                    data: chunk.to_vec(),
                }
            })
            .collect();
        let chunks = if chunks.is_empty() {
            vec![proto::WriteRequest {
                resource_name: resource_name.clone(),
                write_offset: 0,
                finish_write: true,
                data: Vec::new(),
            }]
        } else {
            chunks
        };
        let response = grpc
            .client_streaming(
                tonic::Request::new(futures_util::stream::iter(chunks)),
                PathAndQuery::from_static(BYTESTREAM_WRITE),
                codec,
            )
            .await
            .map_err(|status| anyhow::anyhow!("ByteStream write of {}: {status}", digest.hash))?;
        let committed = response.into_inner().committed_size;
        anyhow::ensure!(
            committed == total as i64,
            "Remote CAS committed {committed} of {total} bytes for {}",
            digest.hash
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_uri() {
        assert_eq!(endpoint_uri("grpc://cache:9092"), "http://cache:9092");
        assert_eq!(endpoint_uri("grpcs://cache:9092"), "https://cache:9092");
        assert_eq!(endpoint_uri("http://cache:9092"), "http://cache:9092");
    }

    #[test]
    fn test_batch_limits() {
        let make = |batch_limit| RemoteCasClient {
            channel: Channel::from_static("http://unused").connect_lazy(),
            instance_name: String::new(),
            batch_limit,
        };
        // Reads clamp into the 1-4 MiB window.
        assert_eq!(make(512).read_batch_limit(), READ_BATCH_MIN);
        assert_eq!(make(64 << 20).read_batch_limit(), READ_BATCH_MAX);
        assert_eq!(make(2 << 20).read_batch_limit(), 2 << 20);
        // Writes adapt to the server limit with framing headroom.
        assert_eq!(make(1 << 20).write_batch_limit(), (1 << 20) - (64 << 10));
        assert_eq!(make(0).write_batch_limit(), 64 << 10);
    }
}
