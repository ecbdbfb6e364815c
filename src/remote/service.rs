//! Stage services: one axum router per stage.
//!
//! | Method | Path | Body → Response |
//! |--------|------|-----------------|
//! | `GET`  | `/<stage>/health` | → `{status: "ok"}` |
//! | `POST` | `/load/start` | → `{state, processed}` |
//! | `POST` | `/load/next` | `{limit}` → `{images}` |
//! | `POST` | `/load/status` | → `{state, processed}` |
//! | `POST` | `/modify/next` | `{image, limit}` → `{modified_images}` |
//! | `POST` | `/hash/next` | `{modified_image, limit}` → `{hashes}` |
//! | `POST` | `/match/start` | → `{state, processed}` |
//! | `POST` | `/match/status` | → `{state, processed}` |
//!
//! Each `/next` call is one batch on its own connection: outputs are
//! committed when `limit` is reached or the input's fan-out runs out.
//! Records that already exist are not returned again, so calling `/next`
//! until a short page comes back visits every output exactly once.

use super::wire::{
    ErrorBody, ErrorDetail, HashNext, Hashes, Health, Images, LoadNext, ModifiedImages, ModifyNext,
};
use crate::core::matcher::{MatchConfig, MatchEngine, StatusHandle};
use crate::core::model::{SourceImage, StageState, StageStatus};
use crate::core::scanner::{ImageWalker, ScanConfig, WalkDirScanner};
use crate::core::stage::{Hasher, Loader, Modifier, Stage, StageContext};
use crate::core::store::Session;
use crate::error::{ScanError, StageError};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

/// Shared state of every stage router
#[derive(Clone)]
pub struct ServiceState {
    context: StageContext,
    load: Arc<LoadState>,
    matching: Arc<MatchState>,
}

impl ServiceState {
    pub fn new(
        context: StageContext,
        input: impl Into<PathBuf>,
        scan_config: ScanConfig,
        match_config: MatchConfig,
    ) -> Self {
        Self {
            context,
            load: Arc::new(LoadState {
                input: input.into(),
                scan_config,
                walker: Mutex::new(None),
                status: StatusHandle::new(),
            }),
            matching: Arc::new(MatchState {
                config: match_config,
                status: StatusHandle::new(),
            }),
        }
    }

    /// Handle to the match run's status
    pub fn match_status(&self) -> StatusHandle {
        self.matching.status.clone()
    }

    /// Handle to the input walk's status
    pub fn load_status(&self) -> StatusHandle {
        self.load.status.clone()
    }
}

/// Server-side cursor over the input tree
struct LoadState {
    input: PathBuf,
    scan_config: ScanConfig,
    walker: Mutex<Option<ImageWalker>>,
    status: StatusHandle,
}

impl LoadState {
    fn walker(&self) -> std::sync::MutexGuard<'_, Option<ImageWalker>> {
        self.walker.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Start a new walk unless one is in progress
    fn start(&self) -> Result<StageStatus, ScanError> {
        let started = match self.status.try_begin() {
            Ok(started) => started,
            Err(current) => return Ok(current),
        };

        match WalkDirScanner::new(self.scan_config.clone()).walk(&self.input) {
            Ok(walker) => {
                *self.walker() = Some(walker);
                tracing::info!(input = %self.input.display(), "Input walk started");
                Ok(started)
            }
            Err(e) => {
                self.status.mark_failed();
                Err(e)
            }
        }
    }

    /// Register up to `limit` new images from the walk
    fn next_batch(
        &self,
        context: &StageContext,
        limit: usize,
    ) -> Result<Vec<SourceImage>, ServiceError> {
        if self.status.state() == StageState::Stopped {
            self.start()?;
        }

        let mut walker = self.walker();
        if walker.is_none() {
            return Ok(Vec::new());
        }

        let mut loader = context.loader()?;
        let mut page = Vec::new();
        let mut exhausted = false;

        while page.len() < limit {
            let next = match walker.as_mut() {
                Some(walker) => walker.next(),
                None => None,
            };
            let path = match next {
                Some(Ok(path)) => path,
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "Skipping unreadable entry");
                    continue;
                }
                None => {
                    exhausted = true;
                    break;
                }
            };

            for output in loader.process(&path) {
                match output {
                    Ok(image) => page.push(image),
                    Err(e) if !e.is_fatal() => {
                        tracing::warn!(stage = Loader::NAME, error = %e, "Skipping record")
                    }
                    Err(e) => {
                        self.status.mark_failed();
                        return Err(e.into());
                    }
                }
            }
        }

        loader.flush()?;
        self.status.record_progress(page.len() as u64);
        if exhausted {
            *walker = None;
            self.status.mark_done();
            tracing::info!(
                images = self.status.snapshot().processed,
                "Input walk finished"
            );
        }
        Ok(page)
    }
}

struct MatchState {
    config: MatchConfig,
    status: StatusHandle,
}

// ============ Errors ============

/// Error that converts into a JSON `{error: {code, message}}` response
#[derive(Debug)]
pub struct ServiceError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ServiceError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "bad_request",
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "internal",
            message: message.into(),
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        tracing::error!(code = self.code, message = %self.message, "Request failed");
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<StageError> for ServiceError {
    fn from(error: StageError) -> Self {
        let (status, code) = match &error {
            StageError::Store(e) if e.is_transient() => {
                (StatusCode::SERVICE_UNAVAILABLE, "store_unavailable")
            }
            StageError::NoAlgorithmsRegistered { .. } => {
                (StatusCode::INTERNAL_SERVER_ERROR, "no_algorithms")
            }
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "stage_error"),
        };
        Self {
            status,
            code,
            message: error.to_string(),
        }
    }
}

impl From<ScanError> for ServiceError {
    fn from(error: ScanError) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "scan_error",
            message: error.to_string(),
        }
    }
}

impl From<tokio::task::JoinError> for ServiceError {
    fn from(error: tokio::task::JoinError) -> Self {
        Self::internal(format!("Worker task failed: {}", error))
    }
}

fn check_limit(limit: usize) -> Result<usize, ServiceError> {
    if limit == 0 {
        return Err(ServiceError::bad_request("limit must be > 0"));
    }
    Ok(limit)
}

/// Take successful outputs until `limit` is reached.
///
/// Skippable errors are logged; a fatal one aborts the page.
fn take_page<T>(
    outputs: impl Iterator<Item = Result<T, StageError>>,
    limit: usize,
    stage: &'static str,
) -> Result<Vec<T>, StageError> {
    let mut page = Vec::new();
    for output in outputs {
        match output {
            Ok(record) => {
                page.push(record);
                if page.len() == limit {
                    break;
                }
            }
            Err(e) if !e.is_fatal() => tracing::warn!(stage, error = %e, "Skipping record"),
            Err(e) => return Err(e),
        }
    }
    Ok(page)
}

// ============ Handlers ============

async fn health() -> Json<Health> {
    Json(Health::ok())
}

async fn load_start(State(state): State<ServiceState>) -> Result<Json<StageStatus>, ServiceError> {
    let load = state.load.clone();
    let status = tokio::task::spawn_blocking(move || load.start()).await??;
    Ok(Json(status))
}

async fn load_next(
    State(state): State<ServiceState>,
    Json(request): Json<LoadNext>,
) -> Result<Json<Images>, ServiceError> {
    let limit = check_limit(request.limit)?;
    let images =
        tokio::task::spawn_blocking(move || state.load.next_batch(&state.context, limit)).await??;
    Ok(Json(Images { images }))
}

async fn load_status(State(state): State<ServiceState>) -> Json<StageStatus> {
    Json(state.load.status.snapshot())
}

async fn modify_next(
    State(state): State<ServiceState>,
    Json(request): Json<ModifyNext>,
) -> Result<Json<ModifiedImages>, ServiceError> {
    let limit = check_limit(request.limit)?;
    let context = state.context.clone();
    let modified_images = tokio::task::spawn_blocking(move || -> Result<_, StageError> {
        let mut modifier = context.modifier()?;
        let page = take_page(modifier.process(&request.image), limit, Modifier::NAME)?;
        modifier.flush()?;
        Ok(page)
    })
    .await??;
    Ok(Json(ModifiedImages { modified_images }))
}

async fn hash_next(
    State(state): State<ServiceState>,
    Json(request): Json<HashNext>,
) -> Result<Json<Hashes>, ServiceError> {
    let limit = check_limit(request.limit)?;
    let context = state.context.clone();
    let hashes = tokio::task::spawn_blocking(move || -> Result<_, StageError> {
        let mut hasher = context.hasher()?;
        let page = take_page(hasher.process(&request.modified_image), limit, Hasher::NAME)?;
        hasher.flush()?;
        Ok(page)
    })
    .await??;
    Ok(Json(Hashes { hashes }))
}

/// Start matching unless a run is in progress; either way return the status
async fn match_start(State(state): State<ServiceState>) -> Json<StageStatus> {
    match state.matching.status.try_begin() {
        Ok(started) => {
            tracing::info!("Match run started");
            tokio::spawn(run_match(
                state.context.clone(),
                state.matching.config,
                state.matching.status.clone(),
            ));
            Json(started)
        }
        Err(current) => Json(current),
    }
}

async fn match_status(State(state): State<ServiceState>) -> Json<StageStatus> {
    Json(state.matching.status.snapshot())
}

/// Drive a match run in chunks of `yield_every` comparisons.
///
/// Each chunk runs on the blocking pool and hands the engine back, and the
/// status is updated between chunks, so status requests are served while
/// the run is in progress.
async fn run_match(context: StageContext, config: MatchConfig, status: StatusHandle) {
    let connector = context.connector().clone();
    let store = match tokio::task::spawn_blocking(move || connector.connect()).await {
        Ok(Ok(store)) => store,
        Ok(Err(e)) => {
            tracing::error!(error = %e, "Match run could not open the store");
            status.mark_failed();
            return;
        }
        Err(e) => {
            tracing::error!(error = %e, "Match run crashed");
            status.mark_failed();
            return;
        }
    };

    let mut engine = MatchEngine::new(Session::new(store, config.batch_size), config);
    let steps = config.yield_every.max(1);

    loop {
        let before = engine.summary().persisted;
        let chunk = tokio::task::spawn_blocking(move || {
            let result = engine.run_steps(steps, |_| {});
            (engine, result)
        })
        .await;

        match chunk {
            Ok((returned, Ok(finished))) => {
                engine = returned;
                status.record_progress(engine.summary().persisted - before);
                if finished {
                    let summary = engine.summary();
                    tracing::info!(
                        persisted = summary.persisted,
                        duplicates = summary.duplicates,
                        skipped = summary.skipped,
                        "Match run done"
                    );
                    status.mark_done();
                    return;
                }
                tokio::task::yield_now().await;
            }
            Ok((_, Err(e))) => {
                tracing::error!(error = %e, "Match run failed");
                status.mark_failed();
                return;
            }
            Err(e) => {
                tracing::error!(error = %e, "Match run crashed");
                status.mark_failed();
                return;
            }
        }
    }
}

// ============ Routers ============

pub fn load_router(state: ServiceState) -> Router {
    Router::new()
        .route("/load/health", get(health))
        .route("/load/start", post(load_start))
        .route("/load/next", post(load_next))
        .route("/load/status", post(load_status).get(load_status))
        .with_state(state)
}

pub fn modify_router(state: ServiceState) -> Router {
    Router::new()
        .route("/modify/health", get(health))
        .route("/modify/next", post(modify_next))
        .with_state(state)
}

pub fn hash_router(state: ServiceState) -> Router {
    Router::new()
        .route("/hash/health", get(health))
        .route("/hash/next", post(hash_next))
        .with_state(state)
}

pub fn match_router(state: ServiceState) -> Router {
    Router::new()
        .route("/match/health", get(health))
        .route("/match/start", post(match_start))
        .route("/match/status", post(match_status).get(match_status))
        .with_state(state)
}

/// Every stage on one router
pub fn router(state: ServiceState) -> Router {
    load_router(state.clone())
        .merge(modify_router(state.clone()))
        .merge(hash_router(state.clone()))
        .merge(match_router(state))
}

/// Serve `router` with request tracing until the process stops
pub async fn serve(listener: TcpListener, router: Router) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "Listening");
    }
    axum::serve(listener, router.layer(TraceLayer::new_for_http())).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::stage::test_support::{small_context, write_image};
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::{json, Value};
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn state(dir: &std::path::Path) -> ServiceState {
        ServiceState::new(
            small_context(dir),
            dir.join("in"),
            ScanConfig::default(),
            MatchConfig::default(),
        )
    }

    async fn call(router: Router, method: &str, uri: &str, body: Value) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn every_stage_reports_health() {
        let dir = TempDir::new().unwrap();
        let app = router(state(dir.path()));

        for stage in ["load", "modify", "hash", "match"] {
            let (status, body) = call(app.clone(), "GET", &format!("/{stage}/health"), Value::Null).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body, json!({"status": "ok"}));
        }
    }

    #[tokio::test]
    async fn load_pages_through_the_walk() {
        let dir = TempDir::new().unwrap();
        for (i, name) in ["a", "b", "c"].iter().enumerate() {
            write_image(&dir.path().join(format!("in/alice/{name}.png")), i as u8 * 40);
        }
        let app = load_router(state(dir.path()));

        let (_, first) = call(app.clone(), "POST", "/load/next", json!({"limit": 2})).await;
        assert_eq!(first["images"].as_array().unwrap().len(), 2);
        let (_, status) = call(app.clone(), "POST", "/load/status", Value::Null).await;
        assert_eq!(status["state"], "in_progress");

        let (_, second) = call(app.clone(), "POST", "/load/next", json!({"limit": 2})).await;
        assert_eq!(second["images"].as_array().unwrap().len(), 1);
        let (_, status) = call(app.clone(), "POST", "/load/status", Value::Null).await;
        assert_eq!(status, json!({"state": "done", "processed": 3}));

        let (_, third) = call(app, "POST", "/load/next", json!({"limit": 2})).await;
        assert!(third["images"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn modify_returns_short_page_when_fan_out_is_exhausted() {
        let dir = TempDir::new().unwrap();
        write_image(&dir.path().join("in/bob/x.png"), 7);
        let app = router(state(dir.path()));

        let (_, loaded) = call(app.clone(), "POST", "/load/next", json!({"limit": 5})).await;
        let image = loaded["images"][0].clone();

        let (_, first) = call(
            app.clone(),
            "POST",
            "/modify/next",
            json!({"image": image, "limit": 1}),
        )
        .await;
        assert_eq!(first["modified_images"].as_array().unwrap().len(), 1);

        let (_, second) = call(
            app.clone(),
            "POST",
            "/modify/next",
            json!({"image": image, "limit": 1}),
        )
        .await;
        assert_eq!(second["modified_images"].as_array().unwrap().len(), 1);
        assert_ne!(
            first["modified_images"][0]["id"],
            second["modified_images"][0]["id"]
        );

        let (_, third) = call(app, "POST", "/modify/next", json!({"image": image, "limit": 1})).await;
        assert!(third["modified_images"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn zero_limit_is_a_bad_request() {
        let dir = TempDir::new().unwrap();
        let (status, body) = call(
            load_router(state(dir.path())),
            "POST",
            "/load/next",
            json!({"limit": 0}),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "bad_request");
    }

    #[tokio::test]
    async fn match_start_is_idempotent_while_in_progress() {
        let dir = TempDir::new().unwrap();
        let state = state(dir.path());
        let handle = state.match_status();
        handle.try_begin().unwrap();
        handle.record_progress(7);
        let app = match_router(state);

        let (_, body) = call(app.clone(), "POST", "/match/start", Value::Null).await;
        assert_eq!(body, json!({"state": "in_progress", "processed": 7}));
        let (_, status) = call(app, "POST", "/match/status", Value::Null).await;
        assert_eq!(status["processed"], 7);
    }
}
