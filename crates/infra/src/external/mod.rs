//! Google Cloud REST clients: object storage and batch prediction.

pub mod gcs;
pub mod vertex;

use std::time::Duration;

use reqwest::{RequestBuilder, Response, StatusCode};

use batchflow_pipeline::RemoteError;

pub use gcs::GcsObjectStore;
pub use vertex::VertexBatchService;

/// Longest error body kept in a `RemoteError`.
const MAX_ERROR_BODY: usize = 512;

/// HTTP client plus the bearer token shared by both services.
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    token: Option<String>,
}

impl ApiClient {
    /// Redirects are not followed: resumable uploads answer `308` to mean
    /// "resume", not "go elsewhere".
    pub fn new(token: Option<String>) -> Result<Self, RemoteError> {
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(transport)?;
        Ok(Self { http, token })
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub(crate) fn authorize(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    /// Send the request, turning transport failures into `RemoteError`.
    pub(crate) async fn send(&self, req: RequestBuilder) -> Result<Response, RemoteError> {
        self.authorize(req).send().await.map_err(transport)
    }
}

pub(crate) fn transport(err: reqwest::Error) -> RemoteError {
    RemoteError::transport(err.to_string())
}

/// Pass successful responses through; read the body of failed ones into the error.
pub(crate) async fn check(resp: Response, what: &str) -> Result<Response, RemoteError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let mut body = resp.text().await.unwrap_or_default();
    if body.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    if status == StatusCode::NOT_FOUND {
        return Err(RemoteError::NotFound(what.to_string()));
    }
    Err(RemoteError::status(status.as_u16(), format!("{what}: {body}")))
}

pub(crate) async fn json<T: serde::de::DeserializeOwned>(
    resp: Response,
    what: &str,
) -> Result<T, RemoteError> {
    resp.json()
        .await
        .map_err(|e| RemoteError::protocol(format!("{what}: {e}")))
}
