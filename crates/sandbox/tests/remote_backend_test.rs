//! Remote backend integration tests.
//!
//! Runs the remote backend against an in-process emulation of the execution
//! service (axum on an ephemeral port). No network access is required.

use std::collections::{HashMap, HashSet};
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Multipart, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures::StreamExt;
use serde_json::{json, Value};

use codebox_sandbox::{
    CodeBox, CodeBoxConfig, Error, HealthStatus, KernelMode, SessionState,
};

const API_KEY: &str = "sk-test";

// =============================================================================
// Emulated Service
// =============================================================================

#[derive(Clone, Default)]
struct FakeService {
    sessions: Arc<Mutex<HashSet<String>>>,
    files: Arc<Mutex<HashMap<String, Bytes>>>,
    allocated: Arc<AtomicUsize>,
    restarts: Arc<AtomicUsize>,
    /// Status polls answered with 503 before the service recovers.
    status_outages: Arc<AtomicUsize>,
    restart_unsupported: Arc<AtomicBool>,
}

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == format!("Bearer {API_KEY}"))
}

fn unauthorized() -> Response {
    (StatusCode::UNAUTHORIZED, Json(json!({"detail": "invalid api key"}))).into_response()
}

fn unknown_session(id: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"detail": format!("codebox {id} not found")})),
    )
        .into_response()
}

impl FakeService {
    fn has(&self, id: &str) -> bool {
        self.sessions.lock().unwrap().contains(id)
    }
}

async fn create(State(svc): State<FakeService>, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }
    assert_eq!(body["factory_id"], "default");
    let n = svc.allocated.fetch_add(1, Ordering::SeqCst) + 1;
    let id = format!("sess-{n}");
    svc.sessions.lock().unwrap().insert(id.clone());
    Json(json!({ "id": id })).into_response()
}

async fn status(State(svc): State<FakeService>, Path(id): Path<String>, headers: HeaderMap) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }
    if !svc.has(&id) {
        return unknown_session(&id);
    }
    let outage = svc
        .status_outages
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();
    if outage {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"detail": "control plane restarting"})),
        )
            .into_response();
    }
    Json(json!({"status": "ready"})).into_response()
}

async fn release(State(svc): State<FakeService>, Path(id): Path<String>, headers: HeaderMap) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }
    if !svc.sessions.lock().unwrap().remove(&id) {
        return unknown_session(&id);
    }
    StatusCode::NO_CONTENT.into_response()
}

async fn exec(
    State(svc): State<FakeService>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }
    if !svc.has(&id) {
        return unknown_session(&id);
    }
    let code = body["code"].as_str().unwrap_or_default().to_string();
    let kernel = body["kernel"].as_str().unwrap_or_default().to_string();

    if kernel == "bash" && code.starts_with("find .") {
        let prefix = format!("{id}/");
        let mut listing: Vec<String> = svc
            .files
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(key, content)| {
                key.strip_prefix(&prefix)
                    .map(|name| format!("{}\t./{}\n", content.len(), name))
            })
            .collect();
        listing.sort();
        return format!("<txt>{}</txt><end/>", listing.concat()).into_response();
    }

    match code.as_str() {
        "flood()" => (
            StatusCode::TOO_MANY_REQUESTS,
            [("retry-after", "2")],
            Json(json!({"detail": "too many executions"})),
        )
            .into_response(),
        "1/0" => "<err>ZeroDivisionError: division by zero</err><end/>".into_response(),
        "plot()" => {
            let parts: Vec<Result<&'static str, Infallible>> = vec![
                Ok("<txt>draw"),
                Ok("ing</txt><im"),
                Ok("g>aGk=</img><e"),
                Ok("nd/>"),
            ];
            Body::from_stream(futures::stream::iter(parts)).into_response()
        }
        _ => format!("<txt>{kernel}:{code}</txt><end/>").into_response(),
    }
}

async fn restart(State(svc): State<FakeService>, Path(id): Path<String>, headers: HeaderMap) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }
    if !svc.has(&id) {
        return unknown_session(&id);
    }
    if svc.restart_unsupported.load(Ordering::SeqCst) {
        return (
            StatusCode::NOT_IMPLEMENTED,
            Json(json!({"detail": "restart is not supported by this factory"})),
        )
            .into_response();
    }
    svc.restarts.fetch_add(1, Ordering::SeqCst);
    Json(json!({"status": "restarted"})).into_response()
}

async fn upload(
    State(svc): State<FakeService>,
    Path(id): Path<String>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }
    while let Ok(Some(field)) = multipart.next_field().await {
        let name = field.file_name().unwrap_or("upload").to_string();
        let data = field.bytes().await.unwrap();
        svc.files.lock().unwrap().insert(format!("{id}/{name}"), data);
    }
    Json(json!({"status": "ok"})).into_response()
}

async fn download(
    State(svc): State<FakeService>,
    Path((id, path)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }
    if !svc.has(&id) {
        return unknown_session(&id);
    }
    if path == "stall.bin" {
        let head = futures::stream::iter(vec![Ok::<_, Infallible>(Bytes::from_static(b"head"))]);
        return Body::from_stream(head.chain(futures::stream::pending())).into_response();
    }
    match svc.files.lock().unwrap().get(&format!("{id}/{path}")) {
        Some(content) => content.clone().into_response(),
        None => (StatusCode::NOT_FOUND, Json(json!({"detail": "file not found"}))).into_response(),
    }
}

async fn spawn_service() -> (String, FakeService) {
    let svc = FakeService::default();
    let app = Router::new()
        .route("/api/v2/codebox", post(create))
        .route("/api/v2/codebox/:id", delete(release))
        .route("/api/v2/codebox/:id/", get(status))
        .route("/api/v2/codebox/:id/exec", post(exec))
        .route("/api/v2/codebox/:id/restart", post(restart))
        .route("/api/v2/codebox/:id/files/upload", post(upload))
        .route("/api/v2/codebox/:id/files/download/*path", get(download))
        .with_state(svc.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}/api/v2"), svc)
}

fn config(base_url: &str) -> CodeBoxConfig {
    CodeBoxConfig::remote(API_KEY)
        .with_base_url(base_url)
        .with_startup_timeout(Duration::from_secs(5))
}

// =============================================================================
// 1. Allocation and execution
// =============================================================================

#[tokio::test]
async fn test_allocates_and_executes() {
    let (url, svc) = spawn_service().await;
    let codebox = CodeBox::new(config(&url)).unwrap();

    let result = codebox.execute("print(1)", KernelMode::Python).await.unwrap();

    assert_eq!(result.text(), "ipython:print(1)");
    assert_eq!(codebox.session_id(), "sess-1");
    assert_eq!(svc.allocated.load(Ordering::SeqCst), 1);
    assert_eq!(codebox.healthcheck().await, HealthStatus::Healthy);
}

#[tokio::test]
async fn test_frames_split_across_network_chunks() {
    let (url, _) = spawn_service().await;
    let codebox = CodeBox::new(config(&url)).unwrap();

    let result = codebox.execute("plot()", KernelMode::Python).await.unwrap();

    assert_eq!(result.text(), "drawing");
    assert_eq!(result.images(), vec!["aGk="]);
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_code_errors_are_results() {
    let (url, _) = spawn_service().await;
    let codebox = CodeBox::new(config(&url)).unwrap();

    let result = codebox.execute("1/0", KernelMode::Python).await.unwrap();

    assert_eq!(result.errors(), vec!["ZeroDivisionError: division by zero"]);
    assert_eq!(codebox.state(), SessionState::Ready);
}

#[tokio::test]
async fn test_bash_kernel_wire_name() {
    let (url, _) = spawn_service().await;
    let codebox = CodeBox::new(config(&url)).unwrap();

    let result = codebox.execute("echo hi", KernelMode::Bash).await.unwrap();
    assert_eq!(result.text(), "bash:echo hi");
}

// =============================================================================
// 2. Service errors
// =============================================================================

#[tokio::test]
async fn test_bad_credential_is_authentication_error() {
    let (url, _) = spawn_service().await;
    let codebox = CodeBox::new(CodeBoxConfig::remote("sk-wrong").with_base_url(url)).unwrap();

    let err = codebox.start().await.unwrap_err();

    assert!(matches!(err, Error::Authentication(ref api) if api.status == 401));
    assert_eq!(codebox.state(), SessionState::Error);
}

#[tokio::test]
async fn test_rate_limit_carries_retry_after() {
    let (url, _) = spawn_service().await;
    let codebox = CodeBox::new(config(&url)).unwrap();

    let err = codebox.execute("flood()", KernelMode::Python).await.unwrap_err();

    match err {
        Error::RateLimit(api) => assert_eq!(api.retry_after(), Some(Duration::from_secs(2))),
        other => panic!("expected rate limit, got {other:?}"),
    }
    assert_eq!(codebox.state(), SessionState::Ready);
}

// =============================================================================
// 3. Resumption
// =============================================================================

#[tokio::test]
async fn test_resume_by_identifier() {
    let (url, svc) = spawn_service().await;
    let first = CodeBox::new(config(&url)).unwrap();
    first.start().await.unwrap();
    let id = first.session_id();

    let resumed = CodeBox::resume(id.clone(), config(&url)).await.unwrap();

    assert_eq!(resumed.session_id(), id);
    assert_eq!(resumed.healthcheck().await, HealthStatus::Healthy);
    assert_eq!(svc.allocated.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_resume_retries_same_session_after_transient_failure() {
    let (url, svc) = spawn_service().await;
    let first = CodeBox::new(config(&url)).unwrap();
    first.start().await.unwrap();
    let id = first.session_id();

    svc.status_outages.store(1, Ordering::SeqCst);
    let resumed = CodeBox::new(config(&url).with_session_id(id.clone())).unwrap();
    assert!(resumed.start().await.is_err());
    assert_eq!(resumed.session_id(), id);

    resumed.start().await.unwrap();
    assert_eq!(resumed.session_id(), id);
    assert_eq!(resumed.state(), SessionState::Ready);
    assert_eq!(svc.allocated.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_resume_unknown_session() {
    let (url, _) = spawn_service().await;

    let err = CodeBox::resume("sess-404", config(&url)).await.err().unwrap();

    assert!(matches!(err, Error::SessionNotFound(_)));
}

// =============================================================================
// 4. Lifecycle
// =============================================================================

#[tokio::test]
async fn test_restart_in_place() {
    let (url, svc) = spawn_service().await;
    let codebox = CodeBox::new(config(&url)).unwrap();
    codebox.start().await.unwrap();

    codebox.restart().await.unwrap();

    assert_eq!(svc.restarts.load(Ordering::SeqCst), 1);
    assert_eq!(svc.allocated.load(Ordering::SeqCst), 1);
    assert_eq!(codebox.state(), SessionState::Ready);
}

#[tokio::test]
async fn test_unsupported_restart_keeps_session_and_files() {
    let (url, svc) = spawn_service().await;
    let codebox = CodeBox::new(config(&url)).unwrap();
    codebox.upload("state.json", "{}").await.unwrap();
    let id = codebox.session_id();
    svc.restart_unsupported.store(true, Ordering::SeqCst);

    let err = codebox.restart().await.unwrap_err();

    assert!(matches!(err, Error::Restart(_)));
    assert_eq!(codebox.session_id(), id);
    assert_eq!(codebox.state(), SessionState::Ready);
    assert_eq!(svc.allocated.load(Ordering::SeqCst), 1);
    let file = codebox.download("state.json").await.unwrap();
    assert_eq!(&file.content().await.unwrap()[..], b"{}");
}

#[tokio::test]
async fn test_stop_releases_server_session() {
    let (url, svc) = spawn_service().await;
    let codebox = CodeBox::new(config(&url)).unwrap();
    codebox.start().await.unwrap();
    assert!(svc.has("sess-1"));

    codebox.stop().await.unwrap();
    codebox.stop().await.unwrap();

    assert!(!svc.has("sess-1"));
    assert_eq!(codebox.state(), SessionState::Stopped);
}

// =============================================================================
// 5. Files
// =============================================================================

#[tokio::test]
async fn test_upload_download_and_list() {
    let (url, _) = spawn_service().await;
    let codebox = CodeBox::new(config(&url).with_transfer_chunk_size(1024)).unwrap();
    let payload: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();

    let uploaded = codebox.upload("blob.bin", payload.clone()).await.unwrap();
    assert_eq!(uploaded.cached_size(), Some(10_000));
    codebox.upload("notes.txt", "hello").await.unwrap();

    let downloaded = codebox.download("blob.bin").await.unwrap();
    assert_eq!(downloaded.content().await.unwrap().to_vec(), payload);

    let files = codebox.list_files().await.unwrap();
    let listing: Vec<_> = files
        .iter()
        .map(|f| (f.path().to_string(), f.cached_size()))
        .collect();
    assert_eq!(
        listing,
        vec![
            ("blob.bin".to_string(), Some(10_000)),
            ("notes.txt".to_string(), Some(5)),
        ]
    );
}

#[tokio::test]
async fn test_download_missing_file() {
    let (url, _) = spawn_service().await;
    let codebox = CodeBox::new(config(&url)).unwrap();

    let err = codebox.download("missing.csv").await.unwrap_err();

    assert!(matches!(err, Error::FileNotFound(_)));
    assert_eq!(codebox.state(), SessionState::Ready);
}

#[tokio::test]
async fn test_save_to_local_path() {
    let (url, _) = spawn_service().await;
    let codebox = CodeBox::new(config(&url)).unwrap();
    codebox.upload("report.txt", "quarterly numbers").await.unwrap();
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("report.txt");

    let written = codebox.file("report.txt").save(&target).await.unwrap();

    assert_eq!(written, 17);
    assert_eq!(std::fs::read_to_string(&target).unwrap(), "quarterly numbers");
}

#[tokio::test]
async fn test_download_deadline_covers_stalled_body() {
    let (url, _) = spawn_service().await;
    let codebox = CodeBox::new(config(&url)).unwrap();

    let mut chunks = codebox
        .stream_download_with("stall.bin", Duration::from_millis(500))
        .await
        .unwrap();
    assert_eq!(&chunks.next().await.unwrap().unwrap()[..], b"head");
    assert!(chunks.next().await.unwrap().unwrap_err().is_timeout());
    assert!(chunks.next().await.is_none());

    let err = codebox
        .download_with("stall.bin", Duration::from_millis(300))
        .await
        .unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(codebox.state(), SessionState::Ready);
}

#[tokio::test]
async fn test_file_access_after_server_reclaimed_session() {
    let (url, svc) = spawn_service().await;
    let codebox = CodeBox::new(config(&url)).unwrap();
    codebox.upload("data.csv", "a,b").await.unwrap();
    svc.sessions.lock().unwrap().clear();

    let err = codebox.download("data.csv").await.unwrap_err();

    assert!(matches!(err, Error::SessionNotFound(_)));
    assert_eq!(codebox.state(), SessionState::Error);
}
