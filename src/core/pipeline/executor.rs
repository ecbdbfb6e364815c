//! Pipeline execution implementation.

use super::queue::{stage_queue, Inbox, Interrupted, Outbox, QueueItem};
use super::CancellationToken;
use crate::core::matcher::{Comparison, MatchConfig, MatchEngine, MatchSummary};
use crate::core::model::{ImageHash, ImagePath};
use crate::core::scanner::{ImageWalker, ScanConfig, WalkDirScanner};
use crate::core::stage::{Hasher, Loader, Modifier, Stage, StageContext};
use crate::core::store::Session;
use crate::error::{FailureCause, PipelineError, StageError};
use crate::events::{
    null_sender, Event, EventSender, MatchEvent, MatchProgress, PipelineEvent, PipelinePhase,
    PipelineSummary, StageEvent, StageProgress,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::any::Any;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::thread::{self, Scope};
use std::time::Instant;
use uuid::Uuid;

/// Name used for the input walk in stats, events and errors
pub const SCANNER: &str = "scanner";
/// Name used for the match phase in stats, events and errors
pub const MATCHER: &str = "matcher";
const SINK: &str = "sink";
const PIPELINE: &str = "pipeline";

/// Worker pool size per stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerCounts {
    pub loader: usize,
    pub modifier: usize,
    pub hasher: usize,
}

impl WorkerCounts {
    /// The same pool size for every stage
    pub fn uniform(workers: usize) -> Self {
        Self {
            loader: workers,
            modifier: workers,
            hasher: workers,
        }
    }
}

impl Default for WorkerCounts {
    fn default() -> Self {
        Self {
            loader: 1,
            modifier: 2,
            hasher: 2,
        }
    }
}

/// Per-stage counters of a finished run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageStats {
    pub stage: String,
    pub workers: usize,
    /// Input records taken off the queue
    pub consumed: u64,
    /// Output records pushed downstream
    pub produced: u64,
    /// Records dropped after a per-record error
    pub skipped: u64,
}

/// Result of a local run
#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    /// Scanner first, then loader, modifier and hasher
    pub stages: Vec<StageStats>,
    /// Hashes that reached the end of the pipeline
    pub hashes_produced: u64,
    pub matches: MatchSummary,
    /// Duration in milliseconds
    pub duration_ms: u64,
}

impl PipelineReport {
    /// Stats of one stage by name
    pub fn stage(&self, name: &str) -> Option<&StageStats> {
        self.stages.iter().find(|s| s.stage == name)
    }
}

#[derive(Default)]
struct StageCounters {
    consumed: AtomicU64,
    produced: AtomicU64,
    skipped: AtomicU64,
}

impl StageCounters {
    fn snapshot(&self, stage: &str, workers: usize) -> StageStats {
        StageStats {
            stage: stage.to_string(),
            workers,
            consumed: self.consumed.load(Ordering::Relaxed),
            produced: self.produced.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
        }
    }
}

/// State shared by every thread of one run
struct RunState {
    cancel: CancellationToken,
    failure: Mutex<Option<PipelineError>>,
    events: EventSender,
}

impl RunState {
    /// Record the first fatal error and cancel everything else
    fn fail(&self, stage: &str, cause: impl Into<FailureCause>) {
        let error = PipelineError::new(stage, cause);
        tracing::error!(stage, error = %error.cause, "Stage failed, cancelling run");

        let mut slot = self.failure.lock().unwrap_or_else(|p| p.into_inner());
        if slot.is_none() {
            *slot = Some(error);
        }
        drop(slot);
        self.cancel.cancel();
    }

    fn take_failure(&self) -> Option<PipelineError> {
        self.failure.lock().unwrap_or_else(|p| p.into_inner()).take()
    }
}

/// Cancels the run if the owning thread unwinds
struct PanicGuard<'a> {
    run: &'a RunState,
    stage: &'static str,
}

impl Drop for PanicGuard<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            self.run.fail(
                self.stage,
                StageError::Crash {
                    stage: self.stage.to_string(),
                    reason: "thread panicked".to_string(),
                },
            );
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Why a worker stopped early
enum Halt {
    Interrupted,
    Failed(StageError),
}

impl From<Interrupted> for Halt {
    fn from(_: Interrupted) -> Self {
        Halt::Interrupted
    }
}

impl From<StageError> for Halt {
    fn from(error: StageError) -> Self {
        Halt::Failed(error)
    }
}

/// Pull inputs until an `EndOfStream` arrives.
///
/// Pending writes are committed before any blocking queue operation, so a
/// worker never waits on a queue while it holds the database write lock.
fn run_worker<S: Stage>(
    stage: &mut S,
    worker: usize,
    inbox: &Inbox<S::Input>,
    outbox: &Outbox<S::Output>,
    counters: &StageCounters,
    run: &RunState,
) -> Result<(), Halt> {
    loop {
        let item = match inbox.poll()? {
            Some(item) => item,
            None => {
                stage.flush()?;
                inbox.recv()?
            }
        };
        let input = match item {
            QueueItem::Record(input) => input,
            QueueItem::EndOfStream => break,
        };
        counters.consumed.fetch_add(1, Ordering::Relaxed);

        // Fan-out is bounded by the registry size
        let outputs: Vec<_> = stage.process(&input).collect();

        let mut produced = 0;
        for output in outputs {
            match output {
                Ok(record) => {
                    if let Some(item) = outbox.offer(QueueItem::Record(record))? {
                        stage.flush()?;
                        outbox.send(item)?;
                    }
                    produced += 1;
                }
                Err(e) if !e.is_fatal() => {
                    tracing::warn!(stage = S::NAME, worker, error = %e, "Skipping record");
                    counters.skipped.fetch_add(1, Ordering::Relaxed);
                    run.events.send(Event::Stage(StageEvent::Skipped {
                        stage: S::NAME.to_string(),
                        message: e.to_string(),
                    }));
                }
                Err(e) => return Err(Halt::Failed(e)),
            }
        }

        counters.produced.fetch_add(produced, Ordering::Relaxed);
        run.events.send(Event::Stage(StageEvent::Progress(StageProgress {
            stage: S::NAME.to_string(),
            worker,
            produced,
        })));
    }

    stage.flush()?;
    tracing::debug!(stage = S::NAME, worker, "Worker finished");
    Ok(())
}

/// Spawn one worker per stage instance plus the coordinator that owns the
/// output queue.
///
/// The coordinator joins every worker, and only then sends one
/// `EndOfStream` per downstream consumer. Workers never send sentinels.
fn spawn_stage<'scope, 'env, S>(
    scope: &'scope Scope<'scope, 'env>,
    stages: Vec<S>,
    inbox: Inbox<S::Input>,
    outbox: Outbox<S::Output>,
    consumers: usize,
    counters: &'scope StageCounters,
    run: &'scope RunState,
) where
    S: Stage + 'scope,
{
    scope.spawn(move || {
        let _guard = PanicGuard {
            run,
            stage: S::NAME,
        };

        let workers: Vec<_> = stages
            .into_iter()
            .enumerate()
            .map(|(worker, mut stage)| {
                let inbox = inbox.clone();
                let outbox = outbox.clone();
                scope.spawn(move || {
                    run_worker(&mut stage, worker, &inbox, &outbox, counters, run)
                })
            })
            .collect();
        drop(inbox);

        let mut clean = true;
        for handle in workers {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(Halt::Interrupted)) => clean = false,
                Ok(Err(Halt::Failed(e))) => {
                    clean = false;
                    run.fail(S::NAME, e);
                }
                Err(panic) => {
                    clean = false;
                    run.fail(
                        S::NAME,
                        StageError::Crash {
                            stage: S::NAME.to_string(),
                            reason: panic_message(&*panic),
                        },
                    );
                }
            }
        }

        if clean && outbox.close(consumers).is_ok() {
            tracing::info!(stage = S::NAME, "Stage drained");
            run.events.send(Event::Stage(StageEvent::Drained {
                stage: S::NAME.to_string(),
            }));
        }
    });
}

/// Walk the input tree into the loader queue, then close it
fn spawn_feeder<'scope, 'env>(
    scope: &'scope Scope<'scope, 'env>,
    walker: ImageWalker,
    outbox: Outbox<ImagePath>,
    consumers: usize,
    counters: &'scope StageCounters,
    run: &'scope RunState,
) {
    scope.spawn(move || {
        let _guard = PanicGuard {
            run,
            stage: SCANNER,
        };

        for entry in walker {
            match entry {
                Ok(path) => {
                    if outbox.send(QueueItem::Record(path)).is_err() {
                        return;
                    }
                    counters.produced.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping unreadable entry");
                    counters.skipped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        if outbox.close(consumers).is_ok() {
            tracing::info!(
                images = counters.produced.load(Ordering::Relaxed),
                "Input walk finished"
            );
            run.events.send(Event::Stage(StageEvent::Drained {
                stage: SCANNER.to_string(),
            }));
        }
    });
}

/// Count hashes until the hasher coordinator closes the queue
fn drain_sink(inbox: Inbox<ImageHash>, run: &RunState) -> u64 {
    let _guard = PanicGuard { run, stage: SINK };
    let mut hashes = 0;
    loop {
        match inbox.recv() {
            Ok(QueueItem::Record(_)) => hashes += 1,
            Ok(QueueItem::EndOfStream) | Err(Interrupted) => return hashes,
        }
    }
}

/// Builder for a local pipeline
pub struct LocalPipelineBuilder {
    context: StageContext,
    input: PathBuf,
    workers: WorkerCounts,
    queue_capacity: usize,
    scan_config: ScanConfig,
    match_config: MatchConfig,
    cancel: Option<CancellationToken>,
}

impl LocalPipelineBuilder {
    /// Worker pool sizes
    pub fn workers(mut self, workers: WorkerCounts) -> Self {
        self.workers = workers;
        self
    }

    /// Capacity of every inter-stage queue
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Set scanner configuration
    pub fn scan_config(mut self, config: ScanConfig) -> Self {
        self.scan_config = config;
        self
    }

    /// Paging and batching for the match phase
    pub fn match_config(mut self, config: MatchConfig) -> Self {
        self.match_config = config;
        self
    }

    /// Cancel the run from outside
    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn build(self) -> LocalPipeline {
        LocalPipeline {
            context: self.context,
            input: self.input,
            workers: WorkerCounts {
                loader: self.workers.loader.max(1),
                modifier: self.workers.modifier.max(1),
                hasher: self.workers.hasher.max(1),
            },
            queue_capacity: self.queue_capacity.max(1),
            scan_config: self.scan_config,
            match_config: self.match_config,
            cancel: self.cancel,
        }
    }
}

/// In-process pipeline: scanner → loader → modifier → hasher → sink,
/// followed by the match phase
pub struct LocalPipeline {
    context: StageContext,
    input: PathBuf,
    workers: WorkerCounts,
    queue_capacity: usize,
    scan_config: ScanConfig,
    match_config: MatchConfig,
    cancel: Option<CancellationToken>,
}

impl LocalPipeline {
    /// Create a new pipeline builder
    pub fn builder(context: StageContext, input: impl Into<PathBuf>) -> LocalPipelineBuilder {
        LocalPipelineBuilder {
            context,
            input: input.into(),
            workers: WorkerCounts::default(),
            queue_capacity: 100,
            scan_config: ScanConfig::default(),
            match_config: MatchConfig::default(),
            cancel: None,
        }
    }

    /// Run the pipeline without events
    pub fn run(&self) -> Result<PipelineReport, PipelineError> {
        self.run_with_events(&null_sender())
    }

    /// Run the pipeline with event reporting
    pub fn run_with_events(&self, events: &EventSender) -> Result<PipelineReport, PipelineError> {
        let start_time = Instant::now();
        let started_at = Utc::now();
        let run_id = Uuid::new_v4().to_string();
        let run = RunState {
            cancel: self.cancel.clone().unwrap_or_default(),
            failure: Mutex::new(None),
            events: events.clone(),
        };

        tracing::info!(run_id = %run_id, input = %self.input.display(), "Starting local run");
        events.send(Event::Pipeline(PipelineEvent::Started {
            run_id: run_id.clone(),
        }));

        let result = self
            .stage_all(&run)
            .and_then(|(stages, hashes_produced)| {
                let matches = self.match_all(&run)?;
                Ok((stages, hashes_produced, matches))
            });

        let (stages, hashes_produced, matches) = match result {
            Ok(done) => done,
            Err(error) => {
                match &error.cause {
                    FailureCause::Cancelled => {
                        events.send(Event::Pipeline(PipelineEvent::Cancelled))
                    }
                    _ => events.send(Event::Pipeline(PipelineEvent::Error {
                        stage: error.stage.clone(),
                        message: error.cause.to_string(),
                    })),
                }
                return Err(error);
            }
        };

        let duration_ms = start_time.elapsed().as_millis() as u64;
        let produced = |name: &str| {
            stages
                .iter()
                .find(|s| s.stage == name)
                .map_or(0, |s| s.produced)
        };

        events.send(Event::Pipeline(PipelineEvent::Completed {
            summary: PipelineSummary {
                run_id: run_id.clone(),
                images: produced(Loader::NAME),
                modified_images: produced(Modifier::NAME),
                hashes: produced(Hasher::NAME),
                matches: matches.persisted,
                duration_ms,
            },
        }));
        tracing::info!(run_id = %run_id, duration_ms, hashes = hashes_produced, "Run complete");

        Ok(PipelineReport {
            run_id,
            started_at,
            stages,
            hashes_produced,
            matches,
            duration_ms,
        })
    }

    /// Build one stage instance per worker. Fails before any thread starts.
    fn instances<S>(
        &self,
        count: usize,
        build: impl Fn(&StageContext) -> Result<S, StageError>,
    ) -> Result<Vec<S>, PipelineError>
    where
        S: Stage,
    {
        (0..count)
            .map(|_| build(&self.context).map_err(|e| PipelineError::new(S::NAME, e)))
            .collect()
    }

    /// Load, modify and hash everything under the input root
    fn stage_all(&self, run: &RunState) -> Result<(Vec<StageStats>, u64), PipelineError> {
        let walker = WalkDirScanner::new(self.scan_config.clone())
            .walk(&self.input)
            .map_err(|e| PipelineError::new(SCANNER, e))?;

        let loaders = self.instances(self.workers.loader, StageContext::loader)?;
        let modifiers = self.instances(self.workers.modifier, StageContext::modifier)?;
        let hashers = self.instances(self.workers.hasher, StageContext::hasher)?;

        run.events.send(Event::Pipeline(PipelineEvent::PhaseChanged {
            phase: PipelinePhase::Staging,
        }));

        let scanned = StageCounters::default();
        let loaded = StageCounters::default();
        let modified = StageCounters::default();
        let hashed = StageCounters::default();

        let capacity = self.queue_capacity;
        let (paths_out, paths_in) = stage_queue(capacity, &run.cancel);
        let (images_out, images_in) = stage_queue(capacity, &run.cancel);
        let (modified_out, modified_in) = stage_queue(capacity, &run.cancel);
        let (hashes_out, hashes_in) = stage_queue(capacity, &run.cancel);

        let hashes_produced = thread::scope(|scope| {
            spawn_feeder(
                scope,
                walker,
                paths_out,
                self.workers.loader,
                &scanned,
                run,
            );
            spawn_stage(
                scope,
                loaders,
                paths_in,
                images_out,
                self.workers.modifier,
                &loaded,
                run,
            );
            spawn_stage(
                scope,
                modifiers,
                images_in,
                modified_out,
                self.workers.hasher,
                &modified,
                run,
            );
            spawn_stage(scope, hashers, modified_in, hashes_out, 1, &hashed, run);
            drain_sink(hashes_in, run)
        });

        if let Some(failure) = run.take_failure() {
            return Err(failure);
        }
        if run.cancel.is_cancelled() {
            return Err(PipelineError::new(PIPELINE, FailureCause::Cancelled));
        }

        Ok((
            vec![
                scanned.snapshot(SCANNER, 1),
                loaded.snapshot(Loader::NAME, self.workers.loader),
                modified.snapshot(Modifier::NAME, self.workers.modifier),
                hashed.snapshot(Hasher::NAME, self.workers.hasher),
            ],
            hashes_produced,
        ))
    }

    /// Compare every stored hash pair. Runs only after hashing is done.
    fn match_all(&self, run: &RunState) -> Result<MatchSummary, PipelineError> {
        run.events.send(Event::Pipeline(PipelineEvent::PhaseChanged {
            phase: PipelinePhase::Matching,
        }));
        run.events.send(Event::Match(MatchEvent::Started));

        let store = self
            .context
            .connector()
            .connect()
            .map_err(|e| PipelineError::new(MATCHER, e))?;
        let mut engine = MatchEngine::new(
            Session::new(store, self.match_config.batch_size),
            self.match_config,
        );

        loop {
            if run.cancel.is_cancelled() {
                return Err(PipelineError::new(MATCHER, FailureCause::Cancelled));
            }

            let finished = engine
                .run_steps(self.match_config.yield_every.max(1), |comparison| {
                    if let Comparison::Skipped(e) = comparison {
                        run.events.send(Event::Stage(StageEvent::Skipped {
                            stage: MATCHER.to_string(),
                            message: e.to_string(),
                        }));
                    }
                })
                .map_err(|e| PipelineError::new(MATCHER, e))?;

            let progress = match_progress(engine.summary());
            if finished {
                run.events.send(Event::Match(MatchEvent::Completed(progress)));
                break;
            }
            run.events.send(Event::Match(MatchEvent::Progress(progress)));
        }

        let summary = engine.summary();
        tracing::info!(
            persisted = summary.persisted,
            duplicates = summary.duplicates,
            skipped = summary.skipped,
            "Matching complete"
        );
        Ok(summary)
    }
}

fn match_progress(summary: MatchSummary) -> MatchProgress {
    MatchProgress {
        persisted: summary.persisted,
        duplicates: summary.duplicates,
        skipped: summary.skipped,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::stage::test_support::{small_context, write_image};
    use crate::events::EventChannel;
    use tempfile::TempDir;

    #[test]
    fn missing_input_fails_in_the_scanner() {
        let dir = TempDir::new().unwrap();
        let pipeline = LocalPipeline::builder(small_context(dir.path()), dir.path().join("nope"))
            .build();

        let error = pipeline.run().unwrap_err();
        assert_eq!(error.stage, SCANNER);
        assert!(matches!(error.cause, FailureCause::Scan(_)));
    }

    #[test]
    fn empty_input_produces_an_empty_report() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("in");
        std::fs::create_dir_all(&input).unwrap();

        let report = LocalPipeline::builder(small_context(dir.path()), &input)
            .build()
            .run()
            .unwrap();

        assert_eq!(report.hashes_produced, 0);
        assert_eq!(report.matches, MatchSummary::default());
        assert_eq!(report.stages.len(), 4);
    }

    #[test]
    fn unreadable_images_are_skipped_not_fatal() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("in");
        write_image(&input.join("alice/good.png"), 1);
        std::fs::write(input.join("alice/bad.png"), b"not an image").unwrap();

        let report = LocalPipeline::builder(small_context(dir.path()), &input)
            .workers(WorkerCounts::uniform(2))
            .build()
            .run()
            .unwrap();

        let modifier = report.stage(Modifier::NAME).unwrap();
        assert_eq!(modifier.consumed, 2);
        assert_eq!(modifier.skipped, 1);
        assert_eq!(modifier.produced, 2);
        assert_eq!(report.hashes_produced, 4);
    }

    #[test]
    fn pre_cancelled_run_reports_cancellation() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("in");
        write_image(&input.join("alice/a.png"), 1);
        let token = CancellationToken::new();
        token.cancel();

        let error = LocalPipeline::builder(small_context(dir.path()), &input)
            .cancellation(token)
            .build()
            .run()
            .unwrap_err();

        assert!(matches!(error.cause, FailureCause::Cancelled));
    }

    #[test]
    fn emits_lifecycle_events() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("in");
        write_image(&input.join("bob/a.png"), 2);
        let (sender, receiver) = EventChannel::new();

        LocalPipeline::builder(small_context(dir.path()), &input)
            .build()
            .run_with_events(&sender)
            .unwrap();
        drop(sender);

        let events: Vec<Event> = receiver.iter().collect();
        let drained: Vec<String> = events
            .iter()
            .filter_map(|e| match e {
                Event::Stage(StageEvent::Drained { stage }) => Some(stage.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(drained.len(), 4);
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::Pipeline(PipelineEvent::Completed { .. }))));
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::Match(MatchEvent::Completed(_)))));
    }

    #[test]
    fn panic_message_reads_both_payload_kinds() {
        let owned: Box<dyn Any + Send> = Box::new("boom".to_string());
        let borrowed: Box<dyn Any + Send> = Box::new("bang");
        assert_eq!(panic_message(&*owned), "boom");
        assert_eq!(panic_message(&*borrowed), "bang");
    }
}
