//! Integration tests for the stage services and the orchestrator.
//!
//! Every scenario runs real axum listeners on `127.0.0.1:0` and talks to
//! them with the reqwest-based stage clients.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use image::{DynamicImage, ImageBuffer, Rgb};
use phash_bench::core::hasher::{AverageHasher, DifferenceHasher, HashMethod};
use phash_bench::core::matcher::MatchConfig;
use phash_bench::core::model::StageState;
use phash_bench::core::modifier::{Base, Flip, Modification};
use phash_bench::core::registry::RegistryBuilder;
use phash_bench::core::scanner::ScanConfig;
use phash_bench::core::stage::StageContext;
use phash_bench::core::store::{ReferenceKind, SqliteConnector, Store, Table};
use phash_bench::remote::{
    match_router, router, serve, ClientSettings, HealthGate, Orchestrator, OrchestratorSettings, ServiceState,
    StageClient, StageClients,
};
use serde_json::json;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::net::TcpListener;

fn settings() -> ClientSettings {
    ClientSettings {
        request_timeout: Duration::from_secs(30),
        connect_timeout: Duration::from_secs(1),
        connect_retries: 3,
        retry_delay: Duration::from_millis(50),
    }
}

fn context(root: &Path) -> StageContext {
    let modifications = RegistryBuilder::<dyn Modification>::new()
        .register("base", Arc::new(Base))
        .register("flip", Arc::new(Flip))
        .build()
        .unwrap();
    let methods = RegistryBuilder::<dyn HashMethod>::new()
        .register("averagehash", Arc::new(AverageHasher::new(8)))
        .register("differencehash", Arc::new(DifferenceHasher::new(8)))
        .build()
        .unwrap();

    StageContext::new(
        Arc::new(SqliteConnector::new(root.join("bench.db"))),
        root.join("modified"),
        modifications,
        methods,
    )
    .with_batch_size(2)
}

fn write_corpus(input: &Path) {
    for (i, name) in ["alice/a.png", "alice/b.png", "bob/c.png"].iter().enumerate() {
        let path = input.join(name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let seed = (i as u8 + 1) * 60;
        let img = ImageBuffer::from_fn(24, 24, |x, y| {
            Rgb([(x as u8 * 9).wrapping_add(seed), (y as u8 * 4).wrapping_add(seed), seed])
        });
        DynamicImage::ImageRgb8(img).save(&path).unwrap();
    }
}

fn count(root: &Path, table: Table) -> u64 {
    SqliteConnector::new(root.join("bench.db"))
        .open()
        .unwrap()
        .count(table)
        .unwrap()
}

/// Serve `app` on an ephemeral port and return its base URL
async fn spawn_server(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

async fn spawn_stages(root: &Path) -> String {
    write_corpus(&root.join("in"));
    let state = ServiceState::new(
        context(root),
        root.join("in"),
        ScanConfig::default(),
        MatchConfig {
            page_size: 4,
            batch_size: 5,
            yield_every: 3,
        },
    );
    spawn_server(router(state)).await
}

fn orchestrator(base_url: &str, page_size: usize) -> Orchestrator {
    Orchestrator::new(
        StageClients::single(base_url, settings()).unwrap(),
        OrchestratorSettings {
            page_size,
            idle_interval: Duration::from_millis(20),
            status_interval: Duration::from_millis(20),
            image_queue_capacity: 2,
            modified_queue_capacity: 2,
            hash_queue_capacity: 2,
            gate: HealthGate::new(5, Duration::from_millis(20)),
        },
    )
}

async fn flaky_health(State(calls): State<Arc<AtomicUsize>>) -> Response {
    if calls.fetch_add(1, Ordering::SeqCst) < 3 {
        (StatusCode::OK, "definitely not json").into_response()
    } else {
        Json(json!({"status": "ok"})).into_response()
    }
}

#[tokio::test]
async fn health_gate_retries_malformed_responses() {
    let calls = Arc::new(AtomicUsize::new(0));
    let app = Router::new()
        .route("/load/health", get(flaky_health))
        .with_state(calls.clone());
    let base_url = spawn_server(app).await;

    let client = StageClient::new("load", base_url, settings()).unwrap();
    let gate = HealthGate::new(10, Duration::from_millis(100));

    let started = Instant::now();
    gate.wait_ready(&client).await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert!(elapsed >= Duration::from_millis(300), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_secs(5), "elapsed {elapsed:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn remote_run_matches_local_fan_out() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path();
    let base_url = spawn_stages(root).await;

    // Page size 1 makes every relay edge loop until a short page
    let report = orchestrator(&base_url, 1).run().await.unwrap();

    assert_eq!(report.images, 3);
    assert_eq!(report.modified_images, 6);
    assert_eq!(report.hashes, 12);
    assert_eq!(report.matches, 30);
    assert_eq!(count(root, Table::ModifiedImages), 6);
    assert_eq!(count(root, Table::Hashes), 12);
    assert_eq!(count(root, Table::Matches), 30);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn match_status_is_monotonic_and_restart_adds_nothing() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path();
    let base_url = spawn_stages(root).await;
    orchestrator(&base_url, 4).run().await.unwrap();

    let matcher = StageClient::new("match", base_url.as_str(), settings()).unwrap();
    let restarted = matcher.start().await.unwrap();
    assert_eq!(restarted.state, StageState::InProgress);

    let mut last = 0;
    let status = loop {
        let status = matcher.status().await.unwrap();
        assert!(status.processed >= last, "processed went backwards");
        last = status.processed;
        if status.state.is_terminal() {
            break status;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    };

    // Every pair was already stored by the first run
    assert_eq!(status.state, StageState::Done);
    assert_eq!(status.processed, 0);
    assert_eq!(count(root, Table::Matches), 30);
}

/// Store `count` hashes of one method directly, one modified image each
fn seed_hashes(root: &Path, count: u64) {
    let store = SqliteConnector::new(root.join("bench.db")).open().unwrap();
    store.begin().unwrap();
    let user = store.create_reference(ReferenceKind::User, "seed").unwrap().unwrap();
    let modification = store
        .create_reference(ReferenceKind::Modification, "base")
        .unwrap()
        .unwrap();
    let method = store
        .create_reference(ReferenceKind::HashMethod, "averagehash")
        .unwrap()
        .unwrap();
    for i in 0..count {
        let image = store
            .insert_image(Path::new(&format!("seed/{i}.png")), user)
            .unwrap()
            .unwrap();
        let modified = store
            .insert_modified_image(Path::new(&format!("modified/{i}.png")), image, modification)
            .unwrap()
            .unwrap();
        let value = format!("{:016x}", i.wrapping_mul(0x9e37_79b9_7f4a_7c15));
        store.insert_hash(&value, modified, method).unwrap().unwrap();
    }
    store.commit().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn start_during_a_live_match_run_keeps_its_progress() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path();
    let hashes = 300;
    seed_hashes(root, hashes);

    let state = ServiceState::new(
        context(root).with_batch_size(200),
        root.join("in"),
        ScanConfig::default(),
        MatchConfig {
            page_size: 50,
            batch_size: 200,
            yield_every: 25,
        },
    );
    let base_url = spawn_server(match_router(state)).await;
    let matcher = StageClient::new("match", base_url.as_str(), settings()).unwrap();

    let started = matcher.start().await.unwrap();
    assert_eq!(started.state, StageState::InProgress);

    // Wait for the engine to report some persisted pairs
    let mut last = 0;
    loop {
        let status = matcher.status().await.unwrap();
        assert_eq!(status.state, StageState::InProgress, "run ended too early");
        assert!(status.processed >= last, "processed went backwards");
        last = status.processed;
        if last > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    let restarted = matcher.start().await.unwrap();
    assert_eq!(restarted.state, StageState::InProgress);
    assert!(
        restarted.processed >= last,
        "start reset progress from {last} to {}",
        restarted.processed
    );
    last = restarted.processed;

    let status = loop {
        let status = matcher.status().await.unwrap();
        assert!(status.processed >= last, "processed went backwards");
        last = status.processed;
        if status.state.is_terminal() {
            break status;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    };

    let pairs = hashes * (hashes - 1) / 2;
    assert_eq!(status.state, StageState::Done);
    assert_eq!(status.processed, pairs);
    assert_eq!(count(root, Table::Matches), pairs);
}

#[tokio::test]
async fn unhealthy_stage_fails_the_run_with_its_name() {
    let app = Router::new().route("/load/health", get(|| async { "starting" }));
    let base_url = spawn_server(app).await;

    let mut orchestrator_settings = OrchestratorSettings::default();
    orchestrator_settings.gate = HealthGate::new(2, Duration::from_millis(10));
    let clients = StageClients {
        loader: StageClient::new("load", base_url.as_str(), settings()).unwrap(),
        modifier: StageClient::new("load", base_url.as_str(), settings()).unwrap(),
        hasher: StageClient::new("load", base_url.as_str(), settings()).unwrap(),
        matcher: StageClient::new("load", base_url.as_str(), settings()).unwrap(),
    };

    let error = Orchestrator::new(clients, orchestrator_settings)
        .run()
        .await
        .unwrap_err();
    assert_eq!(error.stage, "load");
    assert!(error.to_string().contains("Failed healthcheck for load"));
}
