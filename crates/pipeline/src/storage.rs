//! Remote object storage port.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};

use batchflow_core::{Fingerprint, ObjectPath, StagingObject};

use crate::error::RemoteError;

/// Raw lines of a remote object, read incrementally, without their `\n` or
/// `\r\n` terminator. Lines are not decoded: one that is not valid UTF-8 is
/// the reader's problem, not the end of the stream.
pub type LineStream<'a> = BoxStream<'a, Result<Vec<u8>, RemoteError>>;

/// Drop the `\r` a CRLF terminator leaves behind.
pub fn trim_line_end(mut line: Vec<u8>) -> Vec<u8> {
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    line
}

/// Metadata of a remote object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub path: ObjectPath,
    pub size_bytes: u64,
    /// SHA-256 stored in custom metadata by the uploader, if any.
    pub sha256: Option<String>,
}

impl ObjectMeta {
    pub fn into_staging(self) -> StagingObject {
        StagingObject {
            remote_path: self.path,
            size_bytes: self.size_bytes,
            fingerprint: self.sha256,
        }
    }
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Create the bucket if it does not exist. Succeeds if it already exists.
    async fn ensure_bucket(&self, bucket: &str) -> Result<(), RemoteError>;

    /// Metadata for `path`, or `None` if there is no such object.
    async fn stat(&self, path: &ObjectPath) -> Result<Option<ObjectMeta>, RemoteError>;

    /// Transfer a local file to `path`, recording the fingerprint digest in
    /// object metadata. Implementations resume interrupted transfers.
    async fn upload(
        &self,
        local: &Path,
        path: &ObjectPath,
        fingerprint: &Fingerprint,
    ) -> Result<ObjectMeta, RemoteError>;

    /// Every object whose name starts with `prefix`, ordered by name.
    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectMeta>, RemoteError>;

    /// Stream the object's contents line by line.
    async fn read_lines(&self, path: &ObjectPath) -> Result<LineStream<'static>, RemoteError>;
}

#[async_trait]
impl<S> ObjectStore for Arc<S>
where
    S: ObjectStore + ?Sized,
{
    async fn ensure_bucket(&self, bucket: &str) -> Result<(), RemoteError> {
        (**self).ensure_bucket(bucket).await
    }

    async fn stat(&self, path: &ObjectPath) -> Result<Option<ObjectMeta>, RemoteError> {
        (**self).stat(path).await
    }

    async fn upload(
        &self,
        local: &Path,
        path: &ObjectPath,
        fingerprint: &Fingerprint,
    ) -> Result<ObjectMeta, RemoteError> {
        (**self).upload(local, path, fingerprint).await
    }

    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectMeta>, RemoteError> {
        (**self).list(bucket, prefix).await
    }

    async fn read_lines(&self, path: &ObjectPath) -> Result<LineStream<'static>, RemoteError> {
        (**self).read_lines(path).await
    }
}

#[derive(Debug, Clone)]
struct StoredObject {
    bytes: Vec<u8>,
    sha256: Option<String>,
}

/// In-memory object store for tests/dev.
///
/// Counts transfers and can inject failures: truncated uploads and read
/// errors partway through an object.
#[derive(Debug, Default)]
pub struct InMemoryObjectStore {
    buckets: RwLock<HashMap<String, BTreeMap<String, StoredObject>>>,
    transfers: AtomicUsize,
    bucket_creations: AtomicUsize,
    truncate_uploads: AtomicBool,
    /// Object uri → number of lines served before a read error.
    failing_reads: RwLock<HashMap<String, usize>>,
    unavailable: RwLock<HashSet<&'static str>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Number of completed `upload` calls.
    pub fn transfers(&self) -> usize {
        self.transfers.load(Ordering::SeqCst)
    }

    pub fn bucket_creations(&self) -> usize {
        self.bucket_creations.load(Ordering::SeqCst)
    }

    /// Store an object directly (e.g. simulated batch output).
    pub fn put(&self, path: &ObjectPath, bytes: impl Into<Vec<u8>>) {
        let mut buckets = self.buckets.write().unwrap_or_else(PoisonError::into_inner);
        buckets.entry(path.bucket.clone()).or_default().insert(
            path.name.clone(),
            StoredObject {
                bytes: bytes.into(),
                sha256: None,
            },
        );
    }

    pub fn contents(&self, path: &ObjectPath) -> Option<Vec<u8>> {
        self.buckets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&path.bucket)
            .and_then(|b| b.get(&path.name))
            .map(|o| o.bytes.clone())
    }

    /// Subsequent uploads store one byte less than the source file.
    pub fn truncate_uploads(&self, enabled: bool) {
        self.truncate_uploads.store(enabled, Ordering::SeqCst);
    }

    /// Reading `path` yields `after_lines` lines and then an error.
    pub fn fail_reads(&self, path: &ObjectPath, after_lines: usize) {
        self.failing_reads
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.uri(), after_lines);
    }

    /// Make an operation (`"stat"`, `"list"`, ...) fail with a 503.
    pub fn make_unavailable(&self, operation: &'static str) {
        self.unavailable
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(operation);
    }

    fn check_available(&self, operation: &'static str) -> Result<(), RemoteError> {
        if self.unavailable.read().unwrap_or_else(PoisonError::into_inner).contains(operation) {
            return Err(RemoteError::status(503, format!("{operation} unavailable")));
        }
        Ok(())
    }

    fn meta(path: &ObjectPath, object: &StoredObject) -> ObjectMeta {
        ObjectMeta {
            path: path.clone(),
            size_bytes: object.bytes.len() as u64,
            sha256: object.sha256.clone(),
        }
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn ensure_bucket(&self, bucket: &str) -> Result<(), RemoteError> {
        self.check_available("ensure_bucket")?;
        let mut buckets = self.buckets.write().unwrap_or_else(PoisonError::into_inner);
        if !buckets.contains_key(bucket) {
            buckets.insert(bucket.to_string(), BTreeMap::new());
            self.bucket_creations.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn stat(&self, path: &ObjectPath) -> Result<Option<ObjectMeta>, RemoteError> {
        self.check_available("stat")?;
        let buckets = self.buckets.read().unwrap_or_else(PoisonError::into_inner);
        Ok(buckets
            .get(&path.bucket)
            .and_then(|b| b.get(&path.name))
            .map(|o| Self::meta(path, o)))
    }

    async fn upload(
        &self,
        local: &Path,
        path: &ObjectPath,
        fingerprint: &Fingerprint,
    ) -> Result<ObjectMeta, RemoteError> {
        self.check_available("upload")?;
        let mut bytes = tokio::fs::read(local).await?;
        if self.truncate_uploads.load(Ordering::SeqCst) {
            bytes.pop();
        }

        let object = StoredObject {
            bytes,
            sha256: Some(fingerprint.sha256.clone()),
        };
        let meta = Self::meta(path, &object);

        let mut buckets = self.buckets.write().unwrap_or_else(PoisonError::into_inner);
        let bucket = buckets
            .get_mut(&path.bucket)
            .ok_or_else(|| RemoteError::NotFound(format!("bucket {}", path.bucket)))?;
        bucket.insert(path.name.clone(), object);
        self.transfers.fetch_add(1, Ordering::SeqCst);
        Ok(meta)
    }

    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectMeta>, RemoteError> {
        self.check_available("list")?;
        let buckets = self.buckets.read().unwrap_or_else(PoisonError::into_inner);
        let Some(objects) = buckets.get(bucket) else {
            return Ok(Vec::new());
        };
        Ok(objects
            .iter()
            .filter(|(name, _)| name.starts_with(prefix))
            .map(|(name, o)| Self::meta(&ObjectPath::new(bucket, name.clone()), o))
            .collect())
    }

    async fn read_lines(&self, path: &ObjectPath) -> Result<LineStream<'static>, RemoteError> {
        self.check_available("read_lines")?;
        let bytes = self
            .contents(path)
            .ok_or_else(|| RemoteError::NotFound(path.uri()))?;

        let mut lines: Vec<Result<Vec<u8>, RemoteError>> = bytes
            .split(|b| *b == b'\n')
            .map(|line| Ok(trim_line_end(line.to_vec())))
            .collect();
        // `split` yields an empty tail after the final terminator.
        if bytes.is_empty() || bytes.ends_with(b"\n") {
            lines.pop();
        }

        let failing = self
            .failing_reads
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&path.uri())
            .copied();
        if let Some(after) = failing {
            lines.truncate(after);
            lines.push(Err(RemoteError::transport(format!(
                "connection reset reading {}",
                path.uri()
            ))));
        }
        Ok(stream::iter(lines).boxed())
    }
}
