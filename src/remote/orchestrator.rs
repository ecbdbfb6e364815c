//! Drives a run across the stage services.
//!
//! ```text
//! load/next → [images] → modify/next → [modified] → hash/next → [hashes] → sink
//! ```
//! Each edge is one task in a `JoinSet`, connected by bounded `mpsc`
//! channels. Closing a channel is the end-of-stream signal: an edge ends
//! once its input channel is closed and drained, which drops its own
//! sender. The first failing edge aborts all the others.

use super::client::{ClientSettings, StageClient};
use super::health::HealthGate;
use super::wire::{Health, RunStatus};
use crate::config::RemoteConfig;
use crate::core::model::{ImageHash, ModifiedImage, SourceImage, StageState};
use crate::core::StatusHandle;
use crate::error::{PipelineError, RemoteError, StageError};
use crate::events::{
    null_sender, Event, EventSender, MatchEvent, MatchProgress, PipelineEvent, PipelinePhase,
    PipelineSummary, StageEvent, StageProgress,
};
use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use uuid::Uuid;

/// Clients for the four stage services
#[derive(Debug, Clone)]
pub struct StageClients {
    pub loader: StageClient,
    pub modifier: StageClient,
    pub hasher: StageClient,
    pub matcher: StageClient,
}

impl StageClients {
    pub fn from_config(config: &RemoteConfig) -> Result<Self, RemoteError> {
        let settings = ClientSettings::from_config(config);
        Ok(Self {
            loader: StageClient::new("load", config.loader_url.as_str(), settings)?,
            modifier: StageClient::new("modify", config.modifier_url.as_str(), settings)?,
            hasher: StageClient::new("hash", config.hasher_url.as_str(), settings)?,
            matcher: StageClient::new("match", config.matcher_url.as_str(), settings)?,
        })
    }

    /// Every stage served from `base_url`
    pub fn single(base_url: &str, settings: ClientSettings) -> Result<Self, RemoteError> {
        Ok(Self {
            loader: StageClient::new("load", base_url, settings)?,
            modifier: StageClient::new("modify", base_url, settings)?,
            hasher: StageClient::new("hash", base_url, settings)?,
            matcher: StageClient::new("match", base_url, settings)?,
        })
    }

    fn all(&self) -> [&StageClient; 4] {
        [&self.loader, &self.modifier, &self.hasher, &self.matcher]
    }
}

/// Orchestrator tuning
#[derive(Debug, Clone, Copy)]
pub struct OrchestratorSettings {
    /// `limit` sent with every `/next` request
    pub page_size: usize,
    /// Wait after an empty loader page before asking again
    pub idle_interval: Duration,
    /// Wait between `/match/status` polls
    pub status_interval: Duration,
    pub image_queue_capacity: usize,
    pub modified_queue_capacity: usize,
    pub hash_queue_capacity: usize,
    pub gate: HealthGate,
}

impl OrchestratorSettings {
    pub fn from_config(config: &RemoteConfig) -> Self {
        Self {
            page_size: config.page_size.max(1),
            idle_interval: Duration::from_millis(config.idle_interval_ms),
            status_interval: Duration::from_millis(config.status_interval_ms),
            image_queue_capacity: config.image_queue_capacity.max(1),
            modified_queue_capacity: config.modified_queue_capacity.max(1),
            hash_queue_capacity: config.hash_queue_capacity.max(1),
            gate: HealthGate::from_config(config),
        }
    }
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from_config(&RemoteConfig::default())
    }
}

/// Result of a remote run
#[derive(Debug, Clone, Serialize)]
pub struct RemoteReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    /// Records relayed on each edge
    pub images: u64,
    pub modified_images: u64,
    pub hashes: u64,
    /// Match rows the matcher reported as persisted
    pub matches: u64,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Edge {
    Load,
    Modify,
    Hash,
    Sink,
}

impl Edge {
    fn name(self) -> &'static str {
        match self {
            Edge::Load => "load",
            Edge::Modify => "modify",
            Edge::Hash => "hash",
            Edge::Sink => "sink",
        }
    }
}

#[derive(Debug, Default)]
struct EdgeCounts {
    images: u64,
    modified_images: u64,
    hashes: u64,
}

/// Where a run reports progress
#[derive(Clone)]
struct Observer {
    events: EventSender,
    status: Option<StatusHandle>,
}

impl Observer {
    fn emit(&self, event: Event) {
        self.events.send(event);
    }

    fn stage_progress(&self, edge: Edge, produced: usize) {
        self.emit(Event::Stage(StageEvent::Progress(StageProgress {
            stage: edge.name().to_string(),
            worker: 0,
            produced: produced as u64,
        })));
    }

    fn processed(&self, count: u64) {
        if let Some(status) = &self.status {
            status.record_progress(count);
        }
    }
}

/// Runs the remote pipeline against four stage services
pub struct Orchestrator {
    clients: StageClients,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    pub fn new(clients: StageClients, settings: OrchestratorSettings) -> Self {
        Self { clients, settings }
    }

    pub fn from_config(config: &RemoteConfig) -> Result<Self, RemoteError> {
        Ok(Self::new(
            StageClients::from_config(config)?,
            OrchestratorSettings::from_config(config),
        ))
    }

    /// Stage everything, then match
    pub async fn run(&self) -> Result<RemoteReport, PipelineError> {
        self.run_with_events(&null_sender()).await
    }

    pub async fn run_with_events(
        &self,
        events: &EventSender,
    ) -> Result<RemoteReport, PipelineError> {
        let observer = Observer {
            events: events.clone(),
            status: None,
        };
        self.execute(&observer).await
    }

    /// Only the match phase, over whatever hashes are already stored
    pub async fn run_match(&self, events: &EventSender) -> Result<u64, PipelineError> {
        let observer = Observer {
            events: events.clone(),
            status: None,
        };
        self.execute_match(&observer).await
    }

    async fn execute(&self, observer: &Observer) -> Result<RemoteReport, PipelineError> {
        let start_time = Instant::now();
        let started_at = Utc::now();
        let run_id = Uuid::new_v4().to_string();
        tracing::info!(run_id = %run_id, "Starting remote run");
        observer.emit(Event::Pipeline(PipelineEvent::Started {
            run_id: run_id.clone(),
        }));

        let result = async {
            self.wait_ready(&self.clients.all()).await?;
            let counts = self.stage_all(observer).await?;
            let matches = self.match_all(observer).await?;
            Ok::<_, PipelineError>((counts, matches))
        }
        .await;

        let (counts, matches) = match result {
            Ok(done) => done,
            Err(error) => {
                tracing::error!(run_id = %run_id, error = %error, "Remote run failed");
                observer.emit(Event::Pipeline(PipelineEvent::Error {
                    stage: error.stage.clone(),
                    message: error.cause.to_string(),
                }));
                return Err(error);
            }
        };

        let report = RemoteReport {
            run_id,
            started_at,
            images: counts.images,
            modified_images: counts.modified_images,
            hashes: counts.hashes,
            matches,
            duration_ms: start_time.elapsed().as_millis() as u64,
        };
        observer.emit(Event::Pipeline(PipelineEvent::Completed {
            summary: PipelineSummary {
                run_id: report.run_id.clone(),
                images: report.images,
                modified_images: report.modified_images,
                hashes: report.hashes,
                matches: report.matches,
                duration_ms: report.duration_ms,
            },
        }));
        tracing::info!(
            run_id = %report.run_id,
            hashes = report.hashes,
            matches = report.matches,
            duration_ms = report.duration_ms,
            "Remote run complete"
        );
        Ok(report)
    }

    async fn execute_match(&self, observer: &Observer) -> Result<u64, PipelineError> {
        let result = async {
            self.wait_ready(&[&self.clients.matcher]).await?;
            self.match_all(observer).await
        }
        .await;

        if let Err(error) = &result {
            observer.emit(Event::Pipeline(PipelineEvent::Error {
                stage: error.stage.clone(),
                message: error.cause.to_string(),
            }));
        }
        result
    }

    /// Health-check `clients` concurrently; the first exhausted gate fails
    async fn wait_ready(&self, clients: &[&StageClient]) -> Result<(), PipelineError> {
        let mut checks = JoinSet::new();
        for client in clients {
            let client = (*client).clone();
            let gate = self.settings.gate;
            checks.spawn(async move {
                gate.wait_ready(&client)
                    .await
                    .map_err(|e| PipelineError::new(client.stage(), e))
            });
        }

        while let Some(joined) = checks.join_next().await {
            let failure = match joined {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e,
                Err(e) => PipelineError::new(
                    "orchestrator",
                    StageError::Crash {
                        stage: "health".to_string(),
                        reason: e.to_string(),
                    },
                ),
            };
            checks.abort_all();
            return Err(failure);
        }
        Ok(())
    }

    async fn stage_all(&self, observer: &Observer) -> Result<EdgeCounts, PipelineError> {
        observer.emit(Event::Pipeline(PipelineEvent::PhaseChanged {
            phase: PipelinePhase::Staging,
        }));

        let started = self
            .clients
            .loader
            .start()
            .await
            .map_err(|e| PipelineError::new(Edge::Load.name(), e))?;
        tracing::debug!(state = ?started.state, "Loader walk started");

        let settings = self.settings;
        let (images_tx, images_rx) = mpsc::channel::<SourceImage>(settings.image_queue_capacity);
        let (modified_tx, modified_rx) =
            mpsc::channel::<ModifiedImage>(settings.modified_queue_capacity);
        let (hashes_tx, hashes_rx) = mpsc::channel::<ImageHash>(settings.hash_queue_capacity);

        let mut edges = JoinSet::new();
        let mut names = HashMap::new();

        let handle = edges.spawn(source_edge(
            self.clients.loader.clone(),
            images_tx,
            settings,
            observer.clone(),
        ));
        names.insert(handle.id(), Edge::Load);

        let modifier = self.clients.modifier.clone();
        let handle = edges.spawn(relay_edge(
            Edge::Modify,
            images_rx,
            modified_tx,
            settings.page_size,
            observer.clone(),
            move |image: SourceImage| {
                let client = modifier.clone();
                async move { client.modify_next(&image, settings.page_size).await }
            },
        ));
        names.insert(handle.id(), Edge::Modify);

        let hasher = self.clients.hasher.clone();
        let handle = edges.spawn(relay_edge(
            Edge::Hash,
            modified_rx,
            hashes_tx,
            settings.page_size,
            observer.clone(),
            move |modified: ModifiedImage| {
                let client = hasher.clone();
                async move { client.hash_next(&modified, settings.page_size).await }
            },
        ));
        names.insert(handle.id(), Edge::Hash);

        let handle = edges.spawn(sink(hashes_rx, observer.clone()));
        names.insert(handle.id(), Edge::Sink);

        let mut counts = EdgeCounts::default();
        while let Some(joined) = edges.join_next_with_id().await {
            let failure = match joined {
                Ok((id, Ok(count))) => {
                    let edge = names.get(&id).copied();
                    tracing::debug!(edge = ?edge, count, "Edge finished");
                    match edge {
                        Some(Edge::Load) => counts.images = count,
                        Some(Edge::Modify) => counts.modified_images = count,
                        Some(Edge::Hash) => counts.hashes = count,
                        Some(Edge::Sink) | None => {}
                    }
                    if let Some(edge) = edge {
                        observer.emit(Event::Stage(StageEvent::Drained {
                            stage: edge.name().to_string(),
                        }));
                    }
                    continue;
                }
                Ok((_, Err(e))) => e,
                Err(e) => {
                    let stage = names.get(&e.id()).map_or("orchestrator", |edge| edge.name());
                    PipelineError::new(
                        stage,
                        StageError::Crash {
                            stage: stage.to_string(),
                            reason: e.to_string(),
                        },
                    )
                }
            };

            tracing::error!(stage = %failure.stage, error = %failure.cause, "Edge failed, aborting run");
            edges.abort_all();
            return Err(failure);
        }

        Ok(counts)
    }

    /// Start matching and poll its status until it is terminal
    async fn match_all(&self, observer: &Observer) -> Result<u64, PipelineError> {
        let matcher = &self.clients.matcher;
        let fail = |e: RemoteError| PipelineError::new(matcher.stage(), e);

        observer.emit(Event::Pipeline(PipelineEvent::PhaseChanged {
            phase: PipelinePhase::Matching,
        }));
        observer.emit(Event::Match(MatchEvent::Started));

        let started = matcher.start().await.map_err(fail)?;
        tracing::info!(state = ?started.state, "Match run requested");

        let mut seen = 0;
        loop {
            let status = matcher.status().await.map_err(fail)?;
            if status.processed > seen {
                observer.processed(status.processed - seen);
                seen = status.processed;
            }
            let progress = MatchProgress {
                persisted: seen,
                ..MatchProgress::default()
            };

            match status.state {
                StageState::Done => {
                    observer.emit(Event::Match(MatchEvent::Completed(progress)));
                    return Ok(seen);
                }
                StageState::Failed => {
                    return Err(fail(RemoteError::StageFailed {
                        stage: matcher.stage().to_string(),
                    }));
                }
                StageState::Stopped | StageState::InProgress => {
                    observer.emit(Event::Match(MatchEvent::Progress(progress)));
                    tokio::time::sleep(self.settings.status_interval).await;
                }
            }
        }
    }
}

/// Page through the loader until it reports its walk is done.
///
/// An empty page only means nothing is available yet; completion is
/// decided by `/load/status`.
async fn source_edge(
    client: StageClient,
    output: mpsc::Sender<SourceImage>,
    settings: OrchestratorSettings,
    observer: Observer,
) -> Result<u64, PipelineError> {
    let fail = |e: RemoteError| PipelineError::new(Edge::Load.name(), e);
    let mut loaded = 0;

    loop {
        let page = client.load_next(settings.page_size).await.map_err(fail)?;
        if page.is_empty() {
            let status = client.status().await.map_err(fail)?;
            match status.state {
                StageState::Done => break,
                StageState::Failed => {
                    return Err(fail(RemoteError::StageFailed {
                        stage: client.stage().to_string(),
                    }))
                }
                StageState::Stopped | StageState::InProgress => {
                    tracing::debug!("Loader has nothing yet, idling");
                    tokio::time::sleep(settings.idle_interval).await;
                    continue;
                }
            }
        }

        observer.stage_progress(Edge::Load, page.len());
        for image in page {
            if output.send(image).await.is_err() {
                return Ok(loaded);
            }
            loaded += 1;
        }
    }

    Ok(loaded)
}

/// For each input, call `fetch` while it keeps returning full pages
async fn relay_edge<I, O, F, Fut>(
    edge: Edge,
    mut input: mpsc::Receiver<I>,
    output: mpsc::Sender<O>,
    page_size: usize,
    observer: Observer,
    fetch: F,
) -> Result<u64, PipelineError>
where
    I: Clone,
    F: Fn(I) -> Fut,
    Fut: Future<Output = Result<Vec<O>, RemoteError>>,
{
    let mut relayed = 0;

    while let Some(record) = input.recv().await {
        loop {
            let page = fetch(record.clone())
                .await
                .map_err(|e| PipelineError::new(edge.name(), e))?;
            let full = page.len() >= page_size;

            observer.stage_progress(edge, page.len());
            for item in page {
                if output.send(item).await.is_err() {
                    return Ok(relayed);
                }
                relayed += 1;
            }
            if !full {
                break;
            }
        }
    }

    Ok(relayed)
}

async fn sink(mut input: mpsc::Receiver<ImageHash>, observer: Observer) -> Result<u64, PipelineError> {
    let mut received = 0;
    while input.recv().await.is_some() {
        received += 1;
        observer.processed(1);
    }
    Ok(received)
}

// ============ Admin service ============

/// State of the orchestrator's own HTTP service
#[derive(Clone)]
pub struct AdminState {
    orchestrator: Arc<Orchestrator>,
    status: StatusHandle,
    last_error: Arc<Mutex<Option<String>>>,
}

impl AdminState {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self {
            orchestrator: Arc::new(orchestrator),
            status: StatusHandle::new(),
            last_error: Arc::new(Mutex::new(None)),
        }
    }

    fn last_error(&self) -> std::sync::MutexGuard<'_, Option<String>> {
        self.last_error.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn run_status(&self) -> RunStatus {
        let snapshot = self.status.snapshot();
        RunStatus {
            state: snapshot.state,
            processed: snapshot.processed,
            error: self.last_error().clone(),
        }
    }

    fn observer(&self) -> Observer {
        Observer {
            events: null_sender(),
            status: Some(self.status.clone()),
        }
    }

    fn finish(&self, result: Result<(), PipelineError>) {
        match result {
            Ok(()) => self.status.mark_done(),
            Err(e) => {
                *self.last_error() = Some(e.to_string());
                self.status.mark_failed();
            }
        }
    }

    /// Spawn `run` unless a run is in progress
    fn launch<F, Fut>(&self, run: F) -> RunStatus
    where
        F: FnOnce(AdminState) -> Fut,
        Fut: Future<Output = Result<(), PipelineError>> + Send + 'static,
    {
        if self.status.try_begin().is_ok() {
            *self.last_error() = None;
            let state = self.clone();
            let future = run(self.clone());
            tokio::spawn(async move {
                let result = future.await;
                state.finish(result);
            });
        }
        self.run_status()
    }
}

async fn admin_health() -> Json<Health> {
    Json(Health::ok())
}

async fn start_all(State(state): State<AdminState>) -> Json<RunStatus> {
    Json(state.launch(|state| async move {
        let observer = state.observer();
        state.orchestrator.execute(&observer).await.map(|_| ())
    }))
}

async fn start_match(State(state): State<AdminState>) -> Json<RunStatus> {
    Json(state.launch(|state| async move {
        let observer = state.observer();
        state.orchestrator.execute_match(&observer).await.map(|_| ())
    }))
}

async fn admin_status(State(state): State<AdminState>) -> Json<RunStatus> {
    Json(state.run_status())
}

pub fn admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/health", get(admin_health))
        .route("/admin/start/all", post(start_all))
        .route("/admin/start/match", post(start_match))
        .route("/admin/status", post(admin_status).get(admin_status))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    /// A localhost port with nothing listening on it
    fn closed_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    fn unreachable_orchestrator() -> Orchestrator {
        let settings = ClientSettings {
            request_timeout: Duration::from_millis(300),
            connect_timeout: Duration::from_millis(100),
            connect_retries: 1,
            retry_delay: Duration::from_millis(1),
        };
        let base = format!("http://127.0.0.1:{}", closed_port());
        let clients = StageClients::single(&base, settings).unwrap();
        Orchestrator::new(
            clients,
            OrchestratorSettings {
                gate: HealthGate::new(1, Duration::from_millis(1)),
                ..OrchestratorSettings::default()
            },
        )
    }

    async fn post_status(router: Router, uri: &str) -> RunStatus {
        let request = Request::builder()
            .method("POST")
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn unreachable_stages_fail_the_health_gate() {
        let error = unreachable_orchestrator().run().await.unwrap_err();
        assert!(matches!(
            error.cause,
            crate::error::FailureCause::Remote(RemoteError::HealthCheck { .. })
        ));
    }

    #[tokio::test]
    async fn admin_run_reports_failure_with_message() {
        let app = admin_router(AdminState::new(unreachable_orchestrator()));

        let started = post_status(app.clone(), "/admin/start/all").await;
        assert_eq!(started.state, StageState::InProgress);

        let mut status = started;
        for _ in 0..200 {
            status = post_status(app.clone(), "/admin/status").await;
            if status.state.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(status.state, StageState::Failed);
        assert!(status.error.unwrap().contains("Failed healthcheck"));
    }
}
