//! GCS adapter against an in-process fake of the JSON API.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use futures_util::TryStreamExt;
use serde_json::{json, Value};

use batchflow_core::{Fingerprint, ObjectPath};
use batchflow_infra::{ApiClient, GcsObjectStore};
use batchflow_pipeline::{ObjectStore, RetryPolicy};

#[derive(Default)]
struct Fake {
    base_url: String,
    buckets: HashSet<String>,
    bucket_creates: usize,
    objects: BTreeMap<(String, String), (Vec<u8>, HashMap<String, String>)>,
    sessions: HashMap<usize, Session>,
    fail_chunks: usize,
    chunk_puts: usize,
}

struct Session {
    bucket: String,
    name: String,
    metadata: HashMap<String, String>,
    data: Vec<u8>,
}

type Shared = Arc<Mutex<Fake>>;

fn resource(name: &str, data: &[u8], metadata: &HashMap<String, String>) -> Value {
    json!({"name": name, "size": data.len().to_string(), "metadata": metadata})
}

async fn get_bucket(State(fake): State<Shared>, Path(bucket): Path<String>) -> StatusCode {
    if fake.lock().unwrap().buckets.contains(&bucket) {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn create_bucket(State(fake): State<Shared>, Json(body): Json<Value>) -> StatusCode {
    let name = body["name"].as_str().unwrap_or_default().to_string();
    let mut fake = fake.lock().unwrap();
    if !fake.buckets.insert(name) {
        return StatusCode::CONFLICT;
    }
    fake.bucket_creates += 1;
    StatusCode::OK
}

async fn list_objects(
    State(fake): State<Shared>,
    Path(bucket): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Json<Value> {
    let fake = fake.lock().unwrap();
    let prefix = query.get("prefix").cloned().unwrap_or_default();
    let start: usize = query.get("pageToken").and_then(|t| t.parse().ok()).unwrap_or(0);
    let matching: Vec<Value> = fake
        .objects
        .iter()
        .filter(|((b, n), _)| *b == bucket && n.starts_with(&prefix))
        .map(|((_, n), (data, meta))| resource(n, data, meta))
        .collect();
    // Two items per page to exercise pagination.
    let page: Vec<Value> = matching.iter().skip(start).take(2).cloned().collect();
    let mut body = json!({"items": page});
    if start + 2 < matching.len() {
        body["nextPageToken"] = json!((start + 2).to_string());
    }
    Json(body)
}

async fn get_object(
    State(fake): State<Shared>,
    Path((bucket, name)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let fake = fake.lock().unwrap();
    let Some((data, meta)) = fake.objects.get(&(bucket, name.clone())) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    if query.get("alt").map(String::as_str) == Some("media") {
        return data.clone().into_response();
    }
    Json(resource(&name, data, meta)).into_response()
}

async fn start_upload(
    State(fake): State<Shared>,
    Path(bucket): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    Json(body): Json<Value>,
) -> Response {
    let mut fake = fake.lock().unwrap();
    let metadata: HashMap<String, String> =
        serde_json::from_value(body["metadata"].clone()).unwrap_or_default();
    let id = fake.sessions.len() + 1;
    fake.sessions.insert(
        id,
        Session {
            bucket,
            name: query.get("name").cloned().unwrap_or_default(),
            metadata,
            data: Vec::new(),
        },
    );
    let location = format!("{}/upload/session/{id}", fake.base_url);
    (StatusCode::OK, [(header::LOCATION, location)]).into_response()
}

async fn put_chunk(
    State(fake): State<Shared>,
    Path(id): Path<usize>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let mut fake = fake.lock().unwrap();
    let range = headers
        .get(header::CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .trim_start_matches("bytes ")
        .to_string();
    let (span, total) = range.split_once('/').unwrap();
    let total: usize = total.parse().unwrap();

    if span != "*" {
        fake.chunk_puts += 1;
        if fake.fail_chunks > 0 && fake.chunk_puts == 2 {
            fake.fail_chunks -= 1;
            fake.chunk_puts -= 1;
            return StatusCode::SERVICE_UNAVAILABLE.into_response();
        }
        let start: usize = span.split_once('-').unwrap().0.parse().unwrap();
        let session = fake.sessions.get_mut(&id).unwrap();
        if start != session.data.len() {
            return StatusCode::BAD_REQUEST.into_response();
        }
        session.data.extend_from_slice(&body);
    }

    let session = fake.sessions.get(&id).unwrap();
    if session.data.len() < total {
        let mut resp = StatusCode::PERMANENT_REDIRECT.into_response();
        if !session.data.is_empty() {
            let range = format!("bytes=0-{}", session.data.len() - 1);
            resp.headers_mut().insert(header::RANGE, range.parse().unwrap());
        }
        return resp;
    }

    let key = (session.bucket.clone(), session.name.clone());
    let value = (session.data.clone(), session.metadata.clone());
    let body = resource(&session.name, &session.data, &session.metadata);
    fake.objects.insert(key, value);
    Json(body).into_response()
}

struct TestServer {
    base_url: String,
    fake: Shared,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn() -> Self {
        let fake: Shared = Arc::default();
        let app = Router::new()
            .route("/storage/v1/b", post(create_bucket))
            .route("/storage/v1/b/:bucket", get(get_bucket))
            .route("/storage/v1/b/:bucket/o", get(list_objects))
            .route("/storage/v1/b/:bucket/o/:name", get(get_object))
            .route("/upload/storage/v1/b/:bucket/o", post(start_upload))
            .route("/upload/session/:id", put(put_chunk))
            .with_state(fake.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        fake.lock().unwrap().base_url = base_url.clone();

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url,
            fake,
            handle,
        }
    }

    fn store(&self) -> GcsObjectStore {
        GcsObjectStore::new(
            ApiClient::new(Some("test-token".into())).unwrap(),
            self.base_url.parse().unwrap(),
            "proj",
        )
        // Rounded up to one 256 KiB chunk.
        .with_chunk_size(1)
        .with_retry_policy(RetryPolicy::constant(3, Duration::from_millis(1)))
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn fingerprint_of(data: &[u8]) -> Fingerprint {
    use sha2::{Digest, Sha256};
    Fingerprint {
        size_bytes: data.len() as u64,
        sha256: format!("{:x}", Sha256::digest(data)),
    }
}

/// 650 000 bytes of manifest lines: two full chunks and a partial one.
fn large_manifest() -> Vec<u8> {
    (0..25_000)
        .flat_map(|i| format!("{{\"key\":\"record-{i:08}\"}}\n").into_bytes())
        .collect()
}

async fn write_manifest(data: &[u8]) -> (tempfile::TempDir, std::path::PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("manifest.jsonl");
    tokio::fs::write(&path, data).await.unwrap();
    (dir, path)
}

#[tokio::test]
async fn ensure_bucket_creates_once() {
    let server = TestServer::spawn().await;
    let store = server.store();

    store.ensure_bucket("staging").await.unwrap();
    store.ensure_bucket("staging").await.unwrap();

    assert_eq!(server.fake.lock().unwrap().bucket_creates, 1);
}

#[tokio::test]
async fn chunked_upload_round_trips_metadata() {
    let server = TestServer::spawn().await;
    let store = server.store();
    let data = large_manifest();
    let (_dir, local) = write_manifest(&data).await;
    let path = ObjectPath::new("staging", "batchflow/input/manifest-1.jsonl");
    let fp = fingerprint_of(&data);

    store.ensure_bucket("staging").await.unwrap();
    let meta = store.upload(&local, &path, &fp).await.unwrap();
    assert_eq!(meta.size_bytes, data.len() as u64);
    assert_eq!(meta.sha256.as_deref(), Some(fp.sha256.as_str()));

    let stat = store.stat(&path).await.unwrap().unwrap();
    assert_eq!(stat, meta);
    assert_eq!(server.fake.lock().unwrap().chunk_puts, 3);
}

#[tokio::test]
async fn failed_chunk_resumes_from_server_offset() {
    let server = TestServer::spawn().await;
    server.fake.lock().unwrap().fail_chunks = 1;
    let store = server.store();
    let data = large_manifest();
    let (_dir, local) = write_manifest(&data).await;
    let path = ObjectPath::new("staging", "m.jsonl");

    store.ensure_bucket("staging").await.unwrap();
    store.upload(&local, &path, &fingerprint_of(&data)).await.unwrap();

    let fake = server.fake.lock().unwrap();
    let key = ("staging".to_string(), "m.jsonl".to_string());
    let (stored, _) = fake.objects.get(&key).unwrap();
    assert_eq!(stored, &data);
}

#[tokio::test]
async fn stat_of_missing_object_is_none() {
    let server = TestServer::spawn().await;
    let missing = ObjectPath::new("staging", "nope.jsonl");
    assert!(server.store().stat(&missing).await.unwrap().is_none());
}

#[tokio::test]
async fn list_follows_pages_and_read_streams_lines() {
    let server = TestServer::spawn().await;
    {
        let mut fake = server.fake.lock().unwrap();
        for i in 0..5 {
            fake.objects.insert(
                ("out".into(), format!("run/part-{i}.jsonl")),
                (format!("line {i}a\nline {i}b\n").into_bytes(), HashMap::new()),
            );
        }
        fake.objects
            .insert(("out".into(), "other/x.jsonl".into()), (b"x\n".to_vec(), HashMap::new()));
    }
    let store = server.store();

    let listed = store.list("out", "run/").await.unwrap();
    assert_eq!(listed.len(), 5);
    assert_eq!(listed[0].path.name, "run/part-0.jsonl");

    let lines: Vec<Vec<u8>> = store
        .read_lines(&listed[3].path)
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    assert_eq!(lines, vec![b"line 3a".to_vec(), b"line 3b".to_vec()]);
}

#[tokio::test]
async fn invalid_utf8_does_not_end_the_line_stream() {
    let server = TestServer::spawn().await;
    server.fake.lock().unwrap().objects.insert(
        ("out".into(), "run/p.jsonl".into()),
        (b"first\r\n\xff\xfe\nlast".to_vec(), HashMap::new()),
    );

    let lines: Vec<Vec<u8>> = server
        .store()
        .read_lines(&ObjectPath::new("out", "run/p.jsonl"))
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    assert_eq!(lines, vec![b"first".to_vec(), b"\xff\xfe".to_vec(), b"last".to_vec()]);
}
