//! Target URIs, object store construction, and the archive sink.
//!
//! Targets are either local paths (`file://` or no scheme) or `s3://bucket/key`.
//! Local writes go through a `LocalFileSystem` store rooted at the target's
//! parent directory; S3 writes reuse one client per bucket.

use crate::error::Error;
use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::path::Path as ObjectPath;
use object_store::{ClientOptions, ObjectStore, PutPayload, RetryConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Where a target URI points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    /// Local filesystem path
    Local(PathBuf),
    /// Object in an S3 bucket
    S3 { bucket: String, key: String },
}

/// Parse an S3 URI into bucket and key components.
///
/// Accepts URIs in the format `s3://bucket/key/path`.
pub fn parse_s3_uri(uri: &str) -> Result<(&str, &str)> {
    let without_scheme = uri
        .strip_prefix("s3://")
        .with_context(|| format!("Invalid S3 URI: expected 's3://' prefix in '{}'", uri))?;

    without_scheme
        .split_once('/')
        .with_context(|| format!("Invalid S3 URI: expected 's3://bucket/key' format in '{}'", uri))
}

/// Resolve a target URI to a local path or S3 object.
///
/// `file://./a/b` resolves to `./a/b`; `file:///tmp/a` to `/tmp/a`.
pub fn parse_location(uri: &str) -> Result<Location> {
    if uri.starts_with("s3://") {
        let (bucket, key) = parse_s3_uri(uri)?;
        return Ok(Location::S3 {
            bucket: bucket.to_string(),
            key: key.to_string(),
        });
    }

    if let Some(rest) = uri.strip_prefix("file://") {
        return Ok(Location::Local(PathBuf::from(rest)));
    }

    if let Some((scheme, _)) = uri.split_once("://") {
        anyhow::bail!("Unsupported URI scheme '{}' in '{}'", scheme, uri);
    }

    Ok(Location::Local(PathBuf::from(uri)))
}

/// Append a relative path to a target URI.
pub fn join_uri(base: &str, relative: &str) -> String {
    if base.is_empty() {
        relative.to_string()
    } else if base.ends_with('/') {
        format!("{}{}", base, relative)
    } else {
        format!("{}/{}", base, relative)
    }
}

/// Client options for S3 access.
///
/// Fewer idle connections than a bulk reader needs: archives are written
/// one branch at a time.
fn create_client_options() -> ClientOptions {
    ClientOptions::new()
        .with_connect_timeout(Duration::from_secs(5))
        // Archives can be large; allow a slow upload to finish
        .with_timeout(Duration::from_secs(120))
        .with_pool_idle_timeout(Duration::from_secs(90))
        .with_pool_max_idle_per_host(16)
}

/// Retry configuration for transient failures.
fn create_retry_config() -> RetryConfig {
    RetryConfig {
        max_retries: 3,
        backoff: object_store::BackoffConfig {
            init_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(10),
            base: 2.0,
        },
        retry_timeout: Duration::from_secs(180),
    }
}

/// Create an authenticated S3 client for a bucket.
///
/// Credentials and region are loaded from (in order):
/// - Environment variables (AWS_ACCESS_KEY_ID, AWS_SECRET_ACCESS_KEY, AWS_REGION)
/// - AWS config files (~/.aws/credentials, ~/.aws/config)
/// - EC2 instance profile (IMDS)
pub fn create_s3_store(bucket: &str) -> Result<Arc<dyn ObjectStore>> {
    tracing::info!("Creating S3 client for bucket: {}", bucket);

    let builder = AmazonS3Builder::from_env()
        .with_bucket_name(bucket)
        .with_client_options(create_client_options())
        .with_retry(create_retry_config());

    Ok(Arc::new(builder.build()?))
}

/// Create a local store rooted at `dir`, creating the directory if needed.
pub fn create_local_store(dir: &Path) -> Result<Arc<dyn ObjectStore>> {
    if !dir.exists() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create directory {}", dir.display()))?;
    }
    Ok(Arc::new(LocalFileSystem::new_with_prefix(dir)?))
}

/// Split a local file path into its (existing or creatable) parent and file name.
fn split_local(path: &Path) -> Result<(PathBuf, String)> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("Target '{}' has no file name", path.display()))?
        .to_string();
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    Ok((parent, file_name))
}

/// Read a whole object from a local path or S3 URI.
pub async fn read_uri(uri: &str) -> Result<Bytes> {
    match parse_location(uri)? {
        Location::Local(path) => {
            let data = tokio::fs::read(&path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?;
            Ok(Bytes::from(data))
        }
        Location::S3 { bucket, key } => {
            let store = create_s3_store(&bucket)?;
            let bytes = store
                .get(&ObjectPath::from(key.as_str()))
                .await
                .with_context(|| format!("Failed to get {}", uri))?
                .bytes()
                .await?;
            Ok(bytes)
        }
    }
}

/// Persists archives and manifests.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Write `body` to `target`, replacing any existing object.
    async fn write(&self, body: Bytes, target: &str) -> crate::Result<()>;
}

/// Sink that dispatches on the target URI's scheme.
#[derive(Default)]
pub struct UriSink {
    /// S3 clients keyed by bucket
    buckets: DashMap<String, Arc<dyn ObjectStore>>,
}

impl UriSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn bucket_store(&self, bucket: &str) -> Result<Arc<dyn ObjectStore>> {
        if let Some(store) = self.buckets.get(bucket) {
            return Ok(Arc::clone(store.value()));
        }
        let store = create_s3_store(bucket)?;
        self.buckets.insert(bucket.to_string(), Arc::clone(&store));
        Ok(store)
    }

    async fn put(&self, body: Bytes, target: &str) -> Result<()> {
        let (store, key) = match parse_location(target)? {
            Location::Local(path) => {
                let (dir, file_name) = split_local(&path)?;
                (create_local_store(&dir)?, file_name)
            }
            Location::S3 { bucket, key } => (self.bucket_store(&bucket)?, key),
        };

        let size = body.len();
        store
            .put(&ObjectPath::from(key.as_str()), PutPayload::from(body))
            .await?;
        tracing::debug!("Wrote {} bytes to {}", size, target);
        Ok(())
    }
}

#[async_trait]
impl Sink for UriSink {
    async fn write(&self, body: Bytes, target: &str) -> crate::Result<()> {
        self.put(body, target)
            .await
            .map_err(|e| Error::SinkWriteFailure {
                target: target.to_string(),
                reason: format!("{:#}", e),
            })
    }
}
