//! In-process stub registry.
//!
//! Serves just enough of the distribution API for pull/push round trips
//! (manifests by digest or tag, blobs, monolithic uploads) plus the ECR
//! `GetAuthorizationToken` wire shape on `/token`. State is in-memory; hit
//! counters let tests assert which calls were (not) made.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post, put};
use axum::Router;
use tokio::sync::oneshot;
use uuid::Uuid;

use soci_core::descriptor::Digest;

/// The rejection body ECR produces for registries without OCI artifact
/// support. Kept verbatim so capability-classification tests exercise the
/// real text.
pub const CAPABILITY_REJECTION_BODY: &str = "unsupported: Invalid parameter at 'ImageManifest' \
     failed to satisfy constraint: 'Invalid JSON syntax'";

/// How the stub token endpoint answers.
#[derive(Debug, Clone)]
pub enum TokenMode {
    /// Return this authorization token.
    Token(String),
    /// Return an empty `authorizationData` list.
    EmptyData,
    /// Return one entry with an empty token.
    EmptyToken,
}

#[derive(Debug, Default)]
struct Counters {
    manifest_requests: AtomicUsize,
    manifest_puts: AtomicUsize,
    blob_fetches: AtomicUsize,
    blob_heads: AtomicUsize,
    blob_uploads: AtomicUsize,
    token_requests: AtomicUsize,
}

struct StubState {
    /// Blobs by digest string.
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    /// Manifests by reference (digest string or tag): media type + body.
    manifests: Mutex<HashMap<String, (String, Vec<u8>)>>,
    /// Manifests received via PUT, by reference.
    uploaded_manifests: Mutex<HashMap<String, Vec<u8>>>,
    counters: Counters,
    reject_manifest_put: AtomicBool,
    token_mode: Mutex<TokenMode>,
    /// When set, every `/v2` request must carry exactly this header.
    expected_authorization: Mutex<Option<String>>,
}

/// An image seeded into the stub.
#[derive(Debug, Clone)]
pub struct SeededImage {
    /// Digest of the image manifest.
    pub manifest_digest: Digest,
    /// Raw manifest body.
    pub manifest_bytes: Vec<u8>,
    /// Digests of the config and layer blobs.
    pub blob_digests: Vec<Digest>,
}

/// A stub registry bound to `127.0.0.1:0`.
pub struct StubRegistry {
    addr: SocketAddr,
    state: Arc<StubState>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    _task: tokio::task::JoinHandle<()>,
}

impl StubRegistry {
    /// Starts the stub on an ephemeral port.
    ///
    /// # Errors
    ///
    /// Returns an error when the listener cannot be bound.
    pub async fn start() -> anyhow::Result<Self> {
        let state = Arc::new(StubState {
            blobs: Mutex::new(HashMap::new()),
            manifests: Mutex::new(HashMap::new()),
            uploaded_manifests: Mutex::new(HashMap::new()),
            counters: Counters::default(),
            reject_manifest_put: AtomicBool::new(false),
            token_mode: Mutex::new(TokenMode::Token("QVdTOnRlc3QtdG9rZW4=".to_string())),
            expected_authorization: Mutex::new(None),
        });

        let app = Router::new()
            .route("/token", post(token))
            .route("/v2/:repo/manifests/:reference", get(get_manifest).put(put_manifest))
            .route("/v2/:repo/blobs/uploads/", post(start_upload))
            .route("/v2/:repo/blobs/uploads/:session", put(finish_upload))
            .route("/v2/:repo/blobs/:digest", get(get_blob))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            });
            let _ = server.await;
        });

        Ok(Self {
            addr,
            state,
            shutdown_tx: Some(shutdown_tx),
            _task: task,
        })
    }

    /// Registry host (`127.0.0.1:<port>`), suitable for `RegistryConfig`.
    #[must_use]
    pub fn host(&self) -> String {
        self.addr.to_string()
    }

    /// Base URL (`http://127.0.0.1:<port>`).
    #[must_use]
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// URL of the stub ECR token endpoint.
    #[must_use]
    pub fn token_endpoint(&self) -> String {
        format!("{}/token", self.base_url())
    }

    /// Seeds an image: a config blob, the given layer blobs, and a manifest
    /// referencing them, retrievable by digest.
    pub fn seed_image(&self, config_media_type: &str, layers: &[Vec<u8>]) -> SeededImage {
        let config_bytes = br#"{"architecture":"amd64","os":"linux"}"#.to_vec();
        let config_digest = Digest::sha256_of(&config_bytes);

        let mut blob_digests = vec![config_digest.clone()];
        let mut layer_entries = Vec::new();
        {
            let mut blobs = self.state.blobs.lock().expect("blobs lock");
            blobs.insert(config_digest.to_string(), config_bytes.clone());
            for layer in layers {
                let digest = Digest::sha256_of(layer);
                blobs.insert(digest.to_string(), layer.clone());
                layer_entries.push(serde_json::json!({
                    "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
                    "digest": digest.to_string(),
                    "size": layer.len(),
                }));
                blob_digests.push(digest);
            }
        }

        let manifest = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": "application/vnd.oci.image.manifest.v1+json",
            "config": {
                "mediaType": config_media_type,
                "digest": config_digest.to_string(),
                "size": config_bytes.len(),
            },
            "layers": layer_entries,
        });
        let manifest_bytes = serde_json::to_vec(&manifest).expect("encode manifest");
        let manifest_digest = Digest::sha256_of(&manifest_bytes);

        self.state.manifests.lock().expect("manifests lock").insert(
            manifest_digest.to_string(),
            (
                "application/vnd.oci.image.manifest.v1+json".to_string(),
                manifest_bytes.clone(),
            ),
        );

        SeededImage {
            manifest_digest,
            manifest_bytes,
            blob_digests,
        }
    }

    /// Seeds a raw manifest body under its digest (index documents,
    /// arbitrary artifacts).
    pub fn seed_raw_manifest(&self, media_type: &str, body: &[u8]) -> Digest {
        let digest = Digest::sha256_of(body);
        self.state
            .manifests
            .lock()
            .expect("manifests lock")
            .insert(digest.to_string(), (media_type.to_string(), body.to_vec()));
        digest
    }

    /// Makes an already-seeded manifest resolvable by `tag`.
    pub fn tag_manifest(&self, tag: &str, digest: &Digest) {
        let mut manifests = self.state.manifests.lock().expect("manifests lock");
        if let Some(entry) = manifests.get(&digest.to_string()).cloned() {
            manifests.insert(tag.to_string(), entry);
        }
    }

    /// Requires every `/v2` request to carry exactly this authorization
    /// header.
    pub fn require_authorization(&self, header: impl Into<String>) {
        *self
            .state
            .expected_authorization
            .lock()
            .expect("auth lock") = Some(header.into());
    }

    /// Makes manifest PUTs fail with the ECR capability rejection.
    pub fn reject_manifest_puts(&self, reject: bool) {
        self.state
            .reject_manifest_put
            .store(reject, Ordering::Release);
    }

    /// Changes how the token endpoint answers.
    pub fn set_token_mode(&self, mode: TokenMode) {
        *self.state.token_mode.lock().expect("token lock") = mode;
    }

    /// Returns a blob received or seeded, by digest.
    #[must_use]
    pub fn blob(&self, digest: &Digest) -> Option<Vec<u8>> {
        self.state
            .blobs
            .lock()
            .expect("blobs lock")
            .get(&digest.to_string())
            .cloned()
    }

    /// Returns a manifest received via PUT, by reference.
    #[must_use]
    pub fn uploaded_manifest(&self, reference: &str) -> Option<Vec<u8>> {
        self.state
            .uploaded_manifests
            .lock()
            .expect("uploads lock")
            .get(reference)
            .cloned()
    }

    /// Manifest GET/HEAD count.
    #[must_use]
    pub fn manifest_requests(&self) -> usize {
        self.state.counters.manifest_requests.load(Ordering::Acquire)
    }

    /// Manifest PUT count.
    #[must_use]
    pub fn manifest_puts(&self) -> usize {
        self.state.counters.manifest_puts.load(Ordering::Acquire)
    }

    /// Blob GET count.
    #[must_use]
    pub fn blob_fetches(&self) -> usize {
        self.state.counters.blob_fetches.load(Ordering::Acquire)
    }

    /// Blob upload (PUT) count.
    #[must_use]
    pub fn blob_uploads(&self) -> usize {
        self.state.counters.blob_uploads.load(Ordering::Acquire)
    }

    /// Token exchange count.
    #[must_use]
    pub fn token_requests(&self) -> usize {
        self.state.counters.token_requests.load(Ordering::Acquire)
    }
}

impl Drop for StubRegistry {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

fn authorized(state: &StubState, headers: &HeaderMap) -> bool {
    let expected = state
        .expected_authorization
        .lock()
        .expect("auth lock")
        .clone();
    match expected {
        None => true,
        Some(expected) => headers
            .get("authorization")
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value == expected),
    }
}

async fn token(State(state): State<Arc<StubState>>, headers: HeaderMap) -> impl IntoResponse {
    state.counters.token_requests.fetch_add(1, Ordering::AcqRel);

    // A signed exchange always carries these; reject obviously unsigned calls.
    if headers.get("x-amz-date").is_none() || headers.get("authorization").is_none() {
        return (StatusCode::FORBIDDEN, "unsigned request".to_string()).into_response();
    }

    let mode = state.token_mode.lock().expect("token lock").clone();
    let body = match mode {
        TokenMode::Token(token) => serde_json::json!({
            "authorizationData": [{"authorizationToken": token}]
        }),
        TokenMode::EmptyData => serde_json::json!({"authorizationData": []}),
        TokenMode::EmptyToken => serde_json::json!({
            "authorizationData": [{"authorizationToken": ""}]
        }),
    };
    (StatusCode::OK, body.to_string()).into_response()
}

async fn get_manifest(
    State(state): State<Arc<StubState>>,
    Path((_repo, reference)): Path<(String, String)>,
    headers: HeaderMap,
) -> impl IntoResponse {
    state
        .counters
        .manifest_requests
        .fetch_add(1, Ordering::AcqRel);

    if !authorized(&state, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let entry = state
        .manifests
        .lock()
        .expect("manifests lock")
        .get(&reference)
        .cloned();
    match entry {
        Some((media_type, body)) => {
            let digest = Digest::sha256_of(&body);
            let mut response_headers = HeaderMap::new();
            response_headers.insert(
                "docker-content-digest",
                HeaderValue::from_str(digest.as_str()).expect("digest header"),
            );
            response_headers.insert(
                axum::http::header::CONTENT_TYPE,
                HeaderValue::from_str(&media_type).expect("media type header"),
            );
            (StatusCode::OK, response_headers, body).into_response()
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn put_manifest(
    State(state): State<Arc<StubState>>,
    Path((_repo, reference)): Path<(String, String)>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> impl IntoResponse {
    state.counters.manifest_puts.fetch_add(1, Ordering::AcqRel);

    if !authorized(&state, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    if state.reject_manifest_put.load(Ordering::Acquire) {
        return (
            StatusCode::METHOD_NOT_ALLOWED,
            CAPABILITY_REJECTION_BODY.to_string(),
        )
            .into_response();
    }

    state
        .uploaded_manifests
        .lock()
        .expect("uploads lock")
        .insert(reference, body.to_vec());
    StatusCode::CREATED.into_response()
}

async fn get_blob(
    State(state): State<Arc<StubState>>,
    Path((_repo, digest)): Path<(String, String)>,
    method: Method,
    headers: HeaderMap,
) -> impl IntoResponse {
    if method == Method::HEAD {
        state.counters.blob_heads.fetch_add(1, Ordering::AcqRel);
    } else {
        state.counters.blob_fetches.fetch_add(1, Ordering::AcqRel);
    }

    if !authorized(&state, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let blob = state
        .blobs
        .lock()
        .expect("blobs lock")
        .get(&digest)
        .cloned();
    match blob {
        Some(bytes) => (StatusCode::OK, bytes).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn start_upload(
    State(state): State<Arc<StubState>>,
    Path(repo): Path<String>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if !authorized(&state, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let session = Uuid::new_v4().simple().to_string();
    let mut response_headers = HeaderMap::new();
    response_headers.insert(
        axum::http::header::LOCATION,
        HeaderValue::from_str(&format!("/v2/{repo}/blobs/uploads/{session}"))
            .expect("location header"),
    );
    (StatusCode::ACCEPTED, response_headers).into_response()
}

#[derive(serde::Deserialize)]
struct UploadQuery {
    digest: String,
}

async fn finish_upload(
    State(state): State<Arc<StubState>>,
    Path((_repo, _session)): Path<(String, String)>,
    Query(query): Query<UploadQuery>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> impl IntoResponse {
    state.counters.blob_uploads.fetch_add(1, Ordering::AcqRel);

    if !authorized(&state, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    state
        .blobs
        .lock()
        .expect("blobs lock")
        .insert(query.digest, body.to_vec());
    StatusCode::CREATED.into_response()
}
