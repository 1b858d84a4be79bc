/// Storage sinks: where bundle artifacts live.
///
/// Every sink addresses objects as `<bundle-id>/<component>`; a bundle's manifest is
/// the component named [`MANIFEST_NAME`]. `list` only reports bundles whose manifest
/// exists, so a listed bundle never references an unwritten component.

use async_trait::async_trait;
use regex::Regex;
use s3::bucket::Bucket;
use s3::creds::Credentials;
use s3::region::Region;
use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::bundle::{ArtifactBundle, BundleId, BundleSummary};
use super::error::{OpsError, Result};
use crate::utils::{Backoff, MANIFEST_NAME};

#[async_trait]
pub trait StorageSink: Send + Sync {
    /// Human-readable location, used in logs
    fn describe(&self) -> String;

    async fn put(&self, bundle_id: &BundleId, component: &str, data: &[u8]) -> Result<()>;

    async fn get(&self, bundle_id: &BundleId, component: &str) -> Result<Vec<u8>>;

    /// Bundles with a readable manifest, ordered by creation time
    async fn list(&self) -> Result<Vec<BundleSummary>>;

    /// Remove a bundle and every component stored under it
    async fn delete(&self, bundle_id: &BundleId) -> Result<()>;
}

/// Fetch and parse a bundle's manifest
pub async fn load_manifest(sink: &dyn StorageSink, bundle_id: &BundleId) -> Result<ArtifactBundle> {
    let data = sink
        .get(bundle_id, MANIFEST_NAME)
        .await
        .map_err(|e| match e {
            OpsError::NotFound(_) => OpsError::BundleNotFound(bundle_id.to_string()),
            other => other,
        })?;
    ArtifactBundle::from_manifest(bundle_id, &data)
}

fn sort_summaries(summaries: &mut [BundleSummary]) {
    summaries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
}

fn map_io_error(err: std::io::Error, what: &str) -> OpsError {
    use std::io::ErrorKind;
    match err.kind() {
        ErrorKind::NotFound => OpsError::NotFound(what.to_string()),
        ErrorKind::PermissionDenied => OpsError::StorageAuth(format!("{}: {}", what, err)),
        ErrorKind::Interrupted | ErrorKind::TimedOut | ErrorKind::WouldBlock => {
            OpsError::transient_storage(format!("{}: {}", what, err))
        }
        _ => OpsError::storage(format!("{}: {}", what, err)),
    }
}

/// Filesystem sink: `<root>/<bundle-id>/<component>`
pub struct LocalSink {
    root: PathBuf,
}

impl LocalSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn bundle_dir(&self, bundle_id: &BundleId) -> PathBuf {
        self.root.join(bundle_id.as_str())
    }
}

#[async_trait]
impl StorageSink for LocalSink {
    fn describe(&self) -> String {
        format!("local:{}", self.root.display())
    }

    async fn put(&self, bundle_id: &BundleId, component: &str, data: &[u8]) -> Result<()> {
        let dir = self.bundle_dir(bundle_id);
        let what = format!("{}/{}", bundle_id, component);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| map_io_error(e, &what))?;

        // Write to a temp name and rename so a crash never leaves a truncated artifact
        let target = dir.join(component);
        let partial = dir.join(format!(".{}.partial", component));
        let mut file = fs::File::create(&partial)
            .await
            .map_err(|e| map_io_error(e, &what))?;
        file.write_all(data).await.map_err(|e| map_io_error(e, &what))?;
        file.sync_all().await.map_err(|e| map_io_error(e, &what))?;
        drop(file);
        fs::rename(&partial, &target)
            .await
            .map_err(|e| map_io_error(e, &what))?;

        tracing::debug!(bundle = %bundle_id, component, bytes = data.len(), "stored locally");
        Ok(())
    }

    async fn get(&self, bundle_id: &BundleId, component: &str) -> Result<Vec<u8>> {
        let path = self.bundle_dir(bundle_id).join(component);
        fs::read(&path)
            .await
            .map_err(|e| map_io_error(e, &format!("{}/{}", bundle_id, component)))
    }

    async fn list(&self) -> Result<Vec<BundleSummary>> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(map_io_error(e, &self.root.display().to_string())),
        };

        let mut summaries = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| map_io_error(e, &self.root.display().to_string()))?
        {
            if !entry.path().is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            let Ok(bundle_id) = name.parse::<BundleId>() else {
                continue;
            };

            let manifest_path = entry.path().join(MANIFEST_NAME);
            let data = match fs::read(&manifest_path).await {
                Ok(data) => data,
                // No manifest: capture never finished, not a bundle
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(map_io_error(e, &manifest_path.display().to_string())),
            };
            match ArtifactBundle::from_manifest(&bundle_id, &data) {
                Ok(bundle) => summaries.push(bundle.summary()),
                Err(e) => tracing::warn!(bundle = %bundle_id, error = %e, "skipping unreadable manifest"),
            }
        }

        sort_summaries(&mut summaries);
        Ok(summaries)
    }

    async fn delete(&self, bundle_id: &BundleId) -> Result<()> {
        let dir = self.bundle_dir(bundle_id);
        fs::remove_dir_all(&dir).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => OpsError::BundleNotFound(bundle_id.to_string()),
            _ => map_io_error(e, bundle_id.as_str()),
        })
    }
}

/// Connection settings for an S3-compatible bucket
#[derive(Debug, Clone)]
pub struct S3Settings {
    pub bucket: String,
    pub region: String,
    pub endpoint: Option<String>,
    pub prefix: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
}

/// Remote object storage sink using the rust-s3 client
pub struct S3Sink {
    bucket: Box<Bucket>,
    prefix: Option<String>,
}

impl S3Sink {
    pub fn new(settings: &S3Settings) -> Result<Self> {
        let credentials = match (&settings.access_key, &settings.secret_key) {
            (Some(ak), Some(sk)) => Credentials::new(Some(ak), Some(sk), None, None, None),
            // Fall back to the default chain (env, profile, instance metadata)
            _ => Credentials::default(),
        }
        .map_err(|e| OpsError::PreconditionFailed(format!("invalid storage credentials: {}", e)))?;

        let region = match &settings.endpoint {
            Some(endpoint) => Region::Custom {
                region: settings.region.clone(),
                endpoint: endpoint.clone(),
            },
            None => settings.region.parse().map_err(|_| {
                OpsError::PreconditionFailed(format!("invalid storage region: {}", settings.region))
            })?,
        };

        let bucket = Bucket::new(&settings.bucket, region, credentials).map_err(|e| {
            OpsError::PreconditionFailed(format!("failed to open bucket {}: {}", settings.bucket, e))
        })?;

        // Custom endpoints are MinIO-style and need path-style addressing
        let bucket = if settings.endpoint.is_some() {
            bucket.with_path_style()
        } else {
            bucket
        };

        Ok(Self {
            bucket,
            prefix: settings
                .prefix
                .as_ref()
                .map(|p| p.trim_matches('/').to_string())
                .filter(|p| !p.is_empty()),
        })
    }

    fn bundle_prefix(&self, bundle_id: &BundleId) -> String {
        match &self.prefix {
            Some(prefix) => format!("{}/{}/", prefix, bundle_id),
            None => format!("{}/", bundle_id),
        }
    }

    fn key(&self, bundle_id: &BundleId, component: &str) -> String {
        format!("{}{}", self.bundle_prefix(bundle_id), component)
    }

    fn root_prefix(&self) -> String {
        match &self.prefix {
            Some(prefix) => format!("{}/", prefix),
            None => String::new(),
        }
    }

    /// Only throttling, server-side and network failures are transient; any other
    /// client error is permanent and must not be retried.
    fn classify(err: impl std::fmt::Display, what: &str) -> OpsError {
        let message = err.to_string();
        let detail = format!("{}: {}", what, message);
        let auth_marker = ["AccessDenied", "InvalidAccessKeyId", "SignatureDoesNotMatch"]
            .iter()
            .any(|marker| message.contains(marker));

        match http_status(&message) {
            Some(401) | Some(403) => OpsError::StorageAuth(detail),
            _ if auth_marker => OpsError::StorageAuth(detail),
            // A missing bucket is a configuration problem, not a missing object
            _ if message.contains("NoSuchBucket") => OpsError::storage(detail),
            Some(404) => OpsError::NotFound(what.to_string()),
            _ if message.contains("NoSuchKey") => OpsError::NotFound(what.to_string()),
            Some(429) => OpsError::transient_storage(detail),
            Some(status) if status >= 500 => OpsError::transient_storage(detail),
            Some(_) => OpsError::storage(detail),
            None if is_network_failure(&message) => OpsError::transient_storage(detail),
            None => OpsError::storage(detail),
        }
    }
}

/// Status code from rust-s3's "Got HTTP <code> with content ..." errors
fn http_status(message: &str) -> Option<u16> {
    let re = Regex::new(r"HTTP (\d{3})").ok()?;
    re.captures(message)?.get(1)?.as_str().parse().ok()
}

fn is_network_failure(message: &str) -> bool {
    let lower = message.to_lowercase();
    [
        "timed out",
        "timeout",
        "connection",
        "connect error",
        "dns error",
        "broken pipe",
        "reset by peer",
    ]
    .iter()
    .any(|marker| lower.contains(marker))
}

#[async_trait]
impl StorageSink for S3Sink {
    fn describe(&self) -> String {
        format!("s3://{}/{}", self.bucket.name(), self.root_prefix())
    }

    async fn put(&self, bundle_id: &BundleId, component: &str, data: &[u8]) -> Result<()> {
        let key = self.key(bundle_id, component);
        self.bucket
            .put_object(&key, data)
            .await
            .map_err(|e| Self::classify(e, &key))?;
        tracing::debug!(key = %key, bytes = data.len(), "stored remotely");
        Ok(())
    }

    async fn get(&self, bundle_id: &BundleId, component: &str) -> Result<Vec<u8>> {
        let key = self.key(bundle_id, component);
        let response = self
            .bucket
            .get_object(&key)
            .await
            .map_err(|e| Self::classify(e, &key))?;
        Ok(response.to_vec())
    }

    async fn list(&self) -> Result<Vec<BundleSummary>> {
        let root = self.root_prefix();
        let results = self
            .bucket
            .list(root.clone(), Some("/".to_string()))
            .await
            .map_err(|e| Self::classify(e, &root))?;

        let mut summaries = Vec::new();
        for prefix in results
            .into_iter()
            .flat_map(|r| r.common_prefixes.unwrap_or_default())
        {
            let name = prefix.prefix.trim_start_matches(&root).trim_end_matches('/');
            let Ok(bundle_id) = name.parse::<BundleId>() else {
                continue;
            };
            match load_manifest(self, &bundle_id).await {
                Ok(bundle) => summaries.push(bundle.summary()),
                Err(OpsError::BundleNotFound(_)) => continue,
                Err(OpsError::BundleCorrupt { reason, .. }) => {
                    tracing::warn!(bundle = %bundle_id, reason, "skipping unreadable remote manifest")
                }
                Err(e) => return Err(e),
            }
        }

        sort_summaries(&mut summaries);
        Ok(summaries)
    }

    async fn delete(&self, bundle_id: &BundleId) -> Result<()> {
        let prefix = self.bundle_prefix(bundle_id);
        let results = self
            .bucket
            .list(prefix.clone(), None)
            .await
            .map_err(|e| Self::classify(e, &prefix))?;

        let keys: Vec<String> = results
            .into_iter()
            .flat_map(|r| r.contents)
            .map(|object| object.key)
            .collect();
        if keys.is_empty() {
            return Err(OpsError::BundleNotFound(bundle_id.to_string()));
        }

        // Manifest goes first so a half-deleted bundle is never listed
        let manifest_key = self.key(bundle_id, MANIFEST_NAME);
        let mut ordered: Vec<&String> = keys.iter().filter(|k| **k == manifest_key).collect();
        ordered.extend(keys.iter().filter(|k| **k != manifest_key));

        for key in ordered {
            self.bucket
                .delete_object(key)
                .await
                .map_err(|e| Self::classify(e, key))?;
        }
        Ok(())
    }
}

/// Primary sink plus replicas. Writes and deletes must succeed everywhere, reads
/// fall back to replicas when the primary misses.
pub struct ReplicatedSink {
    primary: Arc<dyn StorageSink>,
    replicas: Vec<Arc<dyn StorageSink>>,
}

impl ReplicatedSink {
    pub fn new(primary: Arc<dyn StorageSink>, replicas: Vec<Arc<dyn StorageSink>>) -> Self {
        Self { primary, replicas }
    }

    fn all(&self) -> impl Iterator<Item = &Arc<dyn StorageSink>> {
        std::iter::once(&self.primary).chain(self.replicas.iter())
    }
}

#[async_trait]
impl StorageSink for ReplicatedSink {
    fn describe(&self) -> String {
        self.all().map(|s| s.describe()).collect::<Vec<_>>().join(" + ")
    }

    async fn put(&self, bundle_id: &BundleId, component: &str, data: &[u8]) -> Result<()> {
        for sink in self.all() {
            sink.put(bundle_id, component, data).await.map_err(|e| match e {
                OpsError::Storage { message, transient } => OpsError::Storage {
                    message: format!("{}: {}", sink.describe(), message),
                    transient,
                },
                other => other,
            })?;
        }
        Ok(())
    }

    async fn get(&self, bundle_id: &BundleId, component: &str) -> Result<Vec<u8>> {
        let mut last_err = None;
        for sink in self.all() {
            match sink.get(bundle_id, component).await {
                Ok(data) => return Ok(data),
                Err(e) => {
                    tracing::debug!(sink = %sink.describe(), bundle = %bundle_id, component, error = %e, "read miss");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| OpsError::NotFound(format!("{}/{}", bundle_id, component))))
    }

    async fn list(&self) -> Result<Vec<BundleSummary>> {
        let mut merged: BTreeMap<BundleId, BundleSummary> = BTreeMap::new();
        let mut listed_any = false;
        let mut last_err = None;

        for sink in self.all() {
            match sink.list().await {
                Ok(summaries) => {
                    listed_any = true;
                    for summary in summaries {
                        merged.entry(summary.id.clone()).or_insert(summary);
                    }
                }
                Err(e) => {
                    tracing::warn!(sink = %sink.describe(), error = %e, "failed to list bundles");
                    last_err = Some(e);
                }
            }
        }

        if !listed_any {
            if let Some(e) = last_err {
                return Err(e);
            }
        }

        let mut summaries: Vec<BundleSummary> = merged.into_values().collect();
        sort_summaries(&mut summaries);
        Ok(summaries)
    }

    async fn delete(&self, bundle_id: &BundleId) -> Result<()> {
        let mut deleted_any = false;
        let mut failure = None;

        for sink in self.all() {
            match sink.delete(bundle_id).await {
                Ok(()) => deleted_any = true,
                Err(OpsError::BundleNotFound(_)) => {}
                Err(e) => {
                    tracing::warn!(sink = %sink.describe(), bundle = %bundle_id, error = %e, "delete failed");
                    failure.get_or_insert(e);
                }
            }
        }

        match failure {
            Some(e) => Err(e),
            None if deleted_any => Ok(()),
            None => Err(OpsError::BundleNotFound(bundle_id.to_string())),
        }
    }
}

/// Bounded retry settings for transient storage errors
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff_min: Duration,
    pub backoff_max: Duration,
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 4,
            backoff_min: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
            jitter: Duration::from_millis(250),
        }
    }
}

/// Retries transient errors of the wrapped sink; authorization and not-found
/// errors surface immediately.
pub struct RetryingSink {
    inner: Arc<dyn StorageSink>,
    policy: RetryPolicy,
}

impl RetryingSink {
    pub fn new(inner: Arc<dyn StorageSink>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    async fn with_retry<T, F, Fut>(&self, op: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        let mut backoff = Backoff::new(self.policy.backoff_min, self.policy.backoff_max)
            .with_jitter(self.policy.jitter);
        let mut attempt = 1;

        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.policy.attempts => {
                    let delay = backoff.next_delay();
                    tracing::warn!(
                        sink = %self.inner.describe(),
                        op,
                        attempt,
                        error = %e,
                        "transient storage error, retrying in {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl StorageSink for RetryingSink {
    fn describe(&self) -> String {
        self.inner.describe()
    }

    async fn put(&self, bundle_id: &BundleId, component: &str, data: &[u8]) -> Result<()> {
        let inner = &self.inner;
        self.with_retry("put", move || inner.put(bundle_id, component, data))
            .await
    }

    async fn get(&self, bundle_id: &BundleId, component: &str) -> Result<Vec<u8>> {
        let inner = &self.inner;
        self.with_retry("get", move || inner.get(bundle_id, component))
            .await
    }

    async fn list(&self) -> Result<Vec<BundleSummary>> {
        let inner = &self.inner;
        self.with_retry("list", move || inner.list()).await
    }

    async fn delete(&self, bundle_id: &BundleId) -> Result<()> {
        let inner = &self.inner;
        self.with_retry("delete", move || inner.delete(bundle_id))
            .await
    }
}
