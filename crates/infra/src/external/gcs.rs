//! Google Cloud Storage JSON API adapter.
//!
//! Uploads use the resumable protocol: a session is opened once, the file is
//! sent in chunks with `Content-Range`, and after a failed chunk the session
//! is queried (`bytes */<total>`) to learn how much the server already has.
//! The manifest digest is stored as custom metadata `sha256`.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::Path;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt, TryStreamExt};
use reqwest::header::{CONTENT_RANGE, LOCATION, RANGE};
use reqwest::{Response, StatusCode, Url};
use serde::Deserialize;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncSeekExt};
use tokio_util::io::StreamReader;
use tracing::{debug, info, instrument, warn};

use batchflow_core::{Fingerprint, ObjectPath};
use batchflow_pipeline::retry::retry;
use batchflow_pipeline::{
    trim_line_end, LineStream, ObjectMeta, ObjectStore, RemoteError, RetryPolicy, Retryable,
};

use super::{check, json, ApiClient};

pub const DEFAULT_ENDPOINT: &str = "https://storage.googleapis.com";
/// Resumable upload chunks other than the last must be a multiple of this.
pub const CHUNK_ALIGN: usize = 256 * 1024;
pub const DEFAULT_CHUNK_SIZE: usize = 32 * CHUNK_ALIGN;

const CONTENT_TYPE: &str = "application/jsonl";
const DIGEST_KEY: &str = "sha256";

#[derive(Debug, Deserialize)]
struct ObjectResource {
    name: String,
    size: String,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

impl ObjectResource {
    fn into_meta(self, bucket: &str) -> Result<ObjectMeta, RemoteError> {
        let size_bytes = self
            .size
            .parse()
            .map_err(|_| {
                RemoteError::protocol(format!("object {} has size {:?}", self.name, self.size))
            })?;
        let mut metadata = self.metadata;
        Ok(ObjectMeta {
            path: ObjectPath::new(bucket, self.name),
            size_bytes,
            sha256: metadata.remove(DIGEST_KEY),
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectList {
    #[serde(default)]
    items: Vec<ObjectResource>,
    #[serde(default)]
    next_page_token: Option<String>,
}

enum ChunkResult {
    Done(ObjectMeta),
    /// Server holds bytes up to (excluding) this offset.
    Resume(u64),
}

#[derive(Debug, Clone)]
pub struct GcsObjectStore {
    client: ApiClient,
    endpoint: Url,
    project: String,
    bucket_location: Option<String>,
    chunk_size: usize,
    retry: RetryPolicy,
}

impl GcsObjectStore {
    pub fn new(client: ApiClient, endpoint: Url, project: impl Into<String>) -> Self {
        Self {
            client,
            endpoint,
            project: project.into(),
            bucket_location: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            retry: RetryPolicy::default(),
        }
    }

    /// Location used when the bucket has to be created.
    pub fn with_bucket_location(mut self, location: Option<String>) -> Self {
        self.bucket_location = location;
        self
    }

    /// Rounded up to the next multiple of [`CHUNK_ALIGN`].
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = aligned_chunk_size(chunk_size);
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// `endpoint` + percent-encoded path segments (object names keep their `/`
    /// inside a single segment).
    fn url(&self, segments: &[&str]) -> Result<Url, RemoteError> {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|_| RemoteError::protocol(format!("{} cannot be a base url", self.endpoint)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn object_url(&self, path: &ObjectPath) -> Result<Url, RemoteError> {
        self.url(&["storage", "v1", "b", &path.bucket, "o", &path.name])
    }

    async fn start_session(
        &self,
        path: &ObjectPath,
        fingerprint: &Fingerprint,
        total: u64,
    ) -> Result<Url, RemoteError> {
        let mut url = self.url(&["upload", "storage", "v1", "b", &path.bucket, "o"])?;
        url.query_pairs_mut()
            .append_pair("uploadType", "resumable")
            .append_pair("name", &path.name);

        let body = json!({
            "name": path.name,
            "contentType": CONTENT_TYPE,
            "metadata": { DIGEST_KEY: fingerprint.sha256 },
        });
        let req = self
            .client
            .http()
            .post(url)
            .header("X-Upload-Content-Type", CONTENT_TYPE)
            .header("X-Upload-Content-Length", total.to_string())
            .json(&body);
        let resp = check(self.client.send(req).await?, &path.uri()).await?;

        let location = resp
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| RemoteError::protocol("resumable session without Location header"))?;
        Url::parse(location)
            .map_err(|e| RemoteError::protocol(format!("session url {location:?}: {e}")))
    }

    async fn put_chunk(
        &self,
        session: &Url,
        bucket: &str,
        chunk: Vec<u8>,
        offset: u64,
        total: u64,
    ) -> Result<ChunkResult, RemoteError> {
        let range = if chunk.is_empty() {
            format!("bytes */{total}")
        } else {
            format!("bytes {}-{}/{}", offset, offset + chunk.len() as u64 - 1, total)
        };
        let req = self
            .client
            .http()
            .put(session.clone())
            .header(CONTENT_RANGE, range)
            .body(chunk);
        let resp = self.client.send(req).await?;
        chunk_result(resp, bucket).await
    }

    /// Ask the server how much of the session it has persisted.
    async fn query_session(
        &self,
        session: &Url,
        bucket: &str,
        total: u64,
    ) -> Result<ChunkResult, RemoteError> {
        let req = self
            .client
            .http()
            .put(session.clone())
            .header(CONTENT_RANGE, format!("bytes */{total}"));
        let resp = self.client.send(req).await?;
        chunk_result(resp, bucket).await
    }
}

fn aligned_chunk_size(requested: usize) -> usize {
    requested
        .max(1)
        .div_ceil(CHUNK_ALIGN)
        .saturating_mul(CHUNK_ALIGN)
}

async fn chunk_result(resp: Response, bucket: &str) -> Result<ChunkResult, RemoteError> {
    if resp.status() == StatusCode::PERMANENT_REDIRECT {
        let next = resp
            .headers()
            .get(RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(|r| r.strip_prefix("bytes=0-"))
            .and_then(|end| end.parse::<u64>().ok())
            .map(|end| end + 1)
            .unwrap_or(0);
        return Ok(ChunkResult::Resume(next));
    }
    let resp = check(resp, "upload session").await?;
    let resource: ObjectResource = json(resp, "upload session").await?;
    Ok(ChunkResult::Done(resource.into_meta(bucket)?))
}

#[async_trait]
impl ObjectStore for GcsObjectStore {
    #[instrument(skip(self), err)]
    async fn ensure_bucket(&self, bucket: &str) -> Result<(), RemoteError> {
        let url = self.url(&["storage", "v1", "b", bucket])?;
        let resp = self.client.send(self.client.http().get(url)).await?;
        match check(resp, bucket).await {
            Ok(_) => return Ok(()),
            Err(RemoteError::NotFound(_)) => {}
            Err(err) => return Err(err),
        }

        let mut url = self.url(&["storage", "v1", "b"])?;
        url.query_pairs_mut().append_pair("project", &self.project);
        let mut body = json!({ "name": bucket });
        if let Some(location) = &self.bucket_location {
            body["location"] = json!(location);
        }
        let resp = self.client.send(self.client.http().post(url).json(&body)).await?;
        match check(resp, bucket).await {
            Ok(_) => {
                info!(bucket, "created bucket");
                Ok(())
            }
            // Someone else created it in the meantime.
            Err(RemoteError::Status { status: 409, .. }) => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn stat(&self, path: &ObjectPath) -> Result<Option<ObjectMeta>, RemoteError> {
        let url = self.object_url(path)?;
        let resp = self.client.send(self.client.http().get(url)).await?;
        match check(resp, &path.uri()).await {
            Ok(resp) => {
                let resource: ObjectResource = json(resp, &path.uri()).await?;
                Ok(Some(resource.into_meta(&path.bucket)?))
            }
            Err(RemoteError::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    #[instrument(skip(self, fingerprint), fields(object = %path), err)]
    async fn upload(
        &self,
        local: &Path,
        path: &ObjectPath,
        fingerprint: &Fingerprint,
    ) -> Result<ObjectMeta, RemoteError> {
        let total = tokio::fs::metadata(local).await?.len();
        let session = retry(&self.retry, "start_upload", || {
            self.start_session(path, fingerprint, total)
        })
        .await?;

        let mut file = tokio::fs::File::open(local).await?;
        let mut offset = 0u64;
        // Failed or non-advancing round trips since the last progress.
        let mut attempt = 0u32;
        loop {
            let len = (total - offset.min(total)).min(self.chunk_size as u64) as usize;
            let mut chunk = vec![0u8; len];
            file.seek(SeekFrom::Start(offset)).await?;
            file.read_exact(&mut chunk).await?;

            let result = match self.put_chunk(&session, &path.bucket, chunk, offset, total).await {
                Ok(result) => result,
                Err(err) if err.is_transient() && self.retry.allows_retry(attempt) => {
                    attempt += 1;
                    let delay = self.retry.delay_before(attempt);
                    warn!(offset, attempt, error = %err, "chunk failed; resuming upload session");
                    tokio::time::sleep(delay).await;
                    match self.query_session(&session, &path.bucket, total).await {
                        Ok(result) => result,
                        Err(err) if err.is_transient() => continue,
                        Err(err) => return Err(err),
                    }
                }
                Err(err) => return Err(err),
            };

            match result {
                ChunkResult::Done(meta) => return Ok(meta),
                ChunkResult::Resume(next) if next > total => {
                    return Err(RemoteError::protocol(format!(
                        "server reports {next} bytes of a {total} byte upload"
                    )));
                }
                ChunkResult::Resume(next) if next > offset => {
                    debug!(next, total, "upload progress");
                    offset = next;
                    attempt = 0;
                }
                ChunkResult::Resume(next) => {
                    if !self.retry.allows_retry(attempt) {
                        return Err(RemoteError::transport(format!(
                            "upload of {path} stalled at {next} of {total} bytes"
                        )));
                    }
                    attempt += 1;
                    offset = next;
                }
            }
        }
    }

    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectMeta>, RemoteError> {
        let mut objects = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut url = self.url(&["storage", "v1", "b", bucket, "o"])?;
            {
                let mut query = url.query_pairs_mut();
                query.append_pair("prefix", prefix);
                if let Some(token) = &page_token {
                    query.append_pair("pageToken", token);
                }
            }
            let resp = check(self.client.send(self.client.http().get(url)).await?, bucket).await?;
            let page: ObjectList = json(resp, bucket).await?;
            for item in page.items {
                objects.push(item.into_meta(bucket)?);
            }
            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }
        objects.sort_by(|a, b| a.path.name.cmp(&b.path.name));
        Ok(objects)
    }

    async fn read_lines(&self, path: &ObjectPath) -> Result<LineStream<'static>, RemoteError> {
        let mut url = self.object_url(path)?;
        url.query_pairs_mut().append_pair("alt", "media");
        let resp = check(self.client.send(self.client.http().get(url)).await?, &path.uri()).await?;

        let body = resp.bytes_stream().map_err(std::io::Error::other);
        let lines = StreamReader::new(Box::pin(body)).split(b'\n');
        let uri = path.uri();
        Ok(stream::try_unfold(lines, move |mut lines| {
            let uri = uri.clone();
            async move {
                match lines.next_segment().await {
                    Ok(Some(line)) => Ok(Some((trim_line_end(line), lines))),
                    Ok(None) => Ok(None),
                    Err(e) => Err(RemoteError::transport(format!("reading {uri}: {e}"))),
                }
            }
        })
        .boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_sizes_round_up_to_the_protocol_granularity() {
        assert_eq!(aligned_chunk_size(0), CHUNK_ALIGN);
        assert_eq!(aligned_chunk_size(4), CHUNK_ALIGN);
        assert_eq!(aligned_chunk_size(CHUNK_ALIGN), CHUNK_ALIGN);
        assert_eq!(aligned_chunk_size(CHUNK_ALIGN + 1), 2 * CHUNK_ALIGN);
        assert_eq!(aligned_chunk_size(DEFAULT_CHUNK_SIZE), DEFAULT_CHUNK_SIZE);
    }
}
