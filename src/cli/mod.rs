//! # CLI Module
//!
//! Command-line interface for the benchmark.
//!
//! ## Usage
//! ```bash
//! # Local run: load, modify, hash, then match
//! phash-bench run --input ~/corpus --workers 4
//!
//! # One stage as an HTTP service
//! phash-bench serve hash --bind 0.0.0.0:8000
//!
//! # Drive a run across the stage services
//! phash-bench orchestrate --output json
//!
//! # Ask a running orchestrator service to re-run matching
//! phash-bench orchestrate --target match --via-service
//!
//! # Row counts in the database
//! phash-bench stats
//! ```

use clap::{Parser, Subcommand, ValueEnum};
use console::{style, Term};
use indicatif::{ProgressBar, ProgressStyle};
use phash_bench::core::model::StageState;
use phash_bench::core::pipeline::LocalPipeline;
use phash_bench::core::scanner::ScanConfig;
use phash_bench::core::stage::{Hasher, Stage};
use phash_bench::core::store::{Store, Table};
use phash_bench::core::{hasher, modifier, PipelineReport};
use phash_bench::events::{Event, EventChannel, EventReceiver, MatchEvent, PipelineEvent, StageEvent};
use phash_bench::error::RemoteError;
use phash_bench::remote::{
    admin_router, hash_router, load_router, match_router, modify_router, router, serve,
    AdminState, ClientSettings, Orchestrator, RemoteReport, RunStatus, ServiceState, StageClient,
};
use phash_bench::{BenchError, Config, Result};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;
use tokio::net::TcpListener;

/// phash-bench - benchmark perceptual hash methods
#[derive(Parser, Debug)]
#[command(name = "phash-bench")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run every stage in this process, then match
    Run {
        /// Input tree, one directory per user
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// SQLite database file
        #[arg(long)]
        database: Option<PathBuf>,

        /// Workers per stage
        #[arg(short, long)]
        workers: Option<usize>,

        /// Output format
        #[arg(short, long, default_value = "pretty")]
        output: OutputFormat,
    },

    /// Serve one stage (or all of them) over HTTP
    Serve {
        #[arg(value_enum)]
        service: Service,

        /// Listen address
        #[arg(long)]
        bind: Option<String>,
    },

    /// Run the pipeline across the stage services
    Orchestrate {
        /// What to run
        #[arg(short, long, default_value = "all")]
        target: Target,

        /// Ask the orchestrator service to run it instead of running here
        #[arg(long)]
        via_service: bool,

        /// Output format
        #[arg(short, long, default_value = "pretty")]
        output: OutputFormat,
    },

    /// List registered modifications and hash methods
    Methods,

    /// Row counts per table
    Stats {
        /// SQLite database file
        #[arg(long)]
        database: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    /// Human-readable output with colors
    Pretty,
    /// JSON output for scripting
    Json,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Target {
    /// Load, modify and hash, then match
    All,
    /// Match the hashes already stored
    Match,
}

impl Target {
    fn as_str(&self) -> &'static str {
        match self {
            Target::All => "all",
            Target::Match => "match",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Service {
    Load,
    Modify,
    Hash,
    Match,
    /// Every stage on one listener
    All,
    /// The `/admin` service that drives remote runs
    Orchestrator,
}

/// Run the CLI
pub fn run() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Run {
            input,
            database,
            workers,
            output,
        } => {
            if let Some(input) = input {
                config.paths.input = input;
            }
            if let Some(database) = database {
                config.paths.database = database;
            }
            if let Some(workers) = workers {
                config.pipeline.loader_workers = workers;
                config.pipeline.modifier_workers = workers;
                config.pipeline.hasher_workers = workers;
            }
            config.validate()?;
            run_local(&config, output)
        }
        Commands::Serve { service, bind } => run_service(&config, service, bind),
        Commands::Orchestrate {
            target,
            via_service,
            output,
        } => run_orchestrator(&config, output, target, via_service),
        Commands::Methods => list_methods(),
        Commands::Stats { database } => {
            if let Some(database) = database {
                config.paths.database = database;
            }
            print_stats(&config)
        }
    }
}

fn print_header(term: &Term, title: &str) {
    term.write_line(&format!(
        "{} {}",
        style(title).bold().cyan(),
        style(concat!("v", env!("CARGO_PKG_VERSION"))).dim()
    ))
    .ok();
    term.write_line("").ok();
}

fn spinner() -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed_precise}] {msg} {pos} records")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.enable_steady_tick(Duration::from_millis(120));
    pb
}

/// Render progress events until every sender is dropped
fn spawn_progress(receiver: EventReceiver, progress: Option<ProgressBar>) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        for event in receiver.iter() {
            let Some(ref pb) = progress else {
                continue;
            };
            match event {
                Event::Pipeline(PipelineEvent::PhaseChanged { phase }) => {
                    pb.set_position(0);
                    pb.set_message(phase.to_string());
                }
                Event::Stage(StageEvent::Progress(p)) if p.stage == Hasher::NAME || p.stage == "hash" => {
                    pb.inc(p.produced);
                }
                Event::Match(MatchEvent::Progress(p)) | Event::Match(MatchEvent::Completed(p)) => {
                    pb.set_position(p.persisted);
                }
                Event::Pipeline(PipelineEvent::Completed { .. })
                | Event::Pipeline(PipelineEvent::Error { .. })
                | Event::Pipeline(PipelineEvent::Cancelled) => {
                    pb.finish_and_clear();
                }
                _ => {}
            }
        }
    })
}

fn run_local(config: &Config, output: OutputFormat) -> Result<()> {
    let term = Term::stderr();
    if matches!(output, OutputFormat::Pretty) {
        print_header(&term, "phash-bench");
    }

    let pipeline = LocalPipeline::builder(config.stage_context()?, &config.paths.input)
        .workers(config.worker_counts())
        .queue_capacity(config.pipeline.queue_capacity)
        .scan_config(ScanConfig::default())
        .match_config(config.match_config())
        .build();

    let (sender, receiver) = EventChannel::new();
    let progress = matches!(output, OutputFormat::Pretty).then(spinner);
    let event_thread = spawn_progress(receiver, progress);

    let result = pipeline.run_with_events(&sender);

    // Drop sender to signal event thread to finish
    drop(sender);
    event_thread.join().ok();

    let report = result?;
    match output {
        OutputFormat::Pretty => print_local_report(&term, &report),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
    }
    Ok(())
}

fn print_local_report(term: &Term, report: &PipelineReport) {
    term.write_line(&format!("{} Run Complete", style("✓").green().bold()))
        .ok();
    term.write_line("").ok();

    term.write_line(&format!(
        "  {:<10} {:>8} {:>10} {:>10} {:>8}",
        style("stage").bold(),
        style("workers").bold(),
        style("consumed").bold(),
        style("produced").bold(),
        style("skipped").bold()
    ))
    .ok();
    for stats in &report.stages {
        let skipped = if stats.skipped > 0 {
            style(stats.skipped).yellow()
        } else {
            style(stats.skipped).dim()
        };
        term.write_line(&format!(
            "  {:<10} {:>8} {:>10} {:>10} {:>8}",
            stats.stage, stats.workers, stats.consumed, stats.produced, skipped
        ))
        .ok();
    }
    term.write_line("").ok();

    term.write_line(&format!(
        "  {} hashes, {} matches persisted ({} already stored, {} skipped)",
        style(report.hashes_produced).cyan(),
        style(report.matches.persisted).cyan(),
        report.matches.duplicates,
        report.matches.skipped
    ))
    .ok();
    term.write_line(&format!(
        "  finished in {:.1}s",
        report.duration_ms as f64 / 1000.0
    ))
    .ok();
}

fn run_service(config: &Config, service: Service, bind: Option<String>) -> Result<()> {
    let addr = bind.unwrap_or_else(|| match service {
        Service::Orchestrator => config.server.orchestrator_bind.clone(),
        _ => config.server.bind.clone(),
    });

    if service == Service::Orchestrator {
        let state = AdminState::new(Orchestrator::from_config(&config.remote)?);
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        return runtime.block_on(async {
            let listener = TcpListener::bind(&addr).await?;
            serve(listener, admin_router(state)).await?;
            Ok::<(), BenchError>(())
        });
    }

    let state = ServiceState::new(
        config.stage_context()?,
        &config.paths.input,
        ScanConfig::default(),
        config.match_config(),
    );
    let app = match service {
        Service::Load => load_router(state),
        Service::Modify => modify_router(state),
        Service::Hash => hash_router(state),
        Service::Match => match_router(state),
        Service::All | Service::Orchestrator => router(state),
    };

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let listener = TcpListener::bind(&addr).await?;
        tracing::info!(service = ?service, "Serving");
        serve(listener, app).await?;
        Ok::<(), BenchError>(())
    })
}

fn run_orchestrator(
    config: &Config,
    output: OutputFormat,
    target: Target,
    via_service: bool,
) -> Result<()> {
    let term = Term::stderr();
    if matches!(output, OutputFormat::Pretty) {
        print_header(&term, "phash-bench orchestrator");
    }

    // Every edge runs as a task on one cooperative thread
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    if via_service {
        let status = runtime.block_on(drive_service(config, target, output))?;
        return print_run_status(&term, &status, output);
    }

    let orchestrator = Orchestrator::from_config(&config.remote)?;
    let (sender, receiver) = EventChannel::new();
    let progress = matches!(output, OutputFormat::Pretty).then(spinner);
    let event_thread = spawn_progress(receiver, progress);

    let result = match target {
        Target::All => runtime
            .block_on(orchestrator.run_with_events(&sender))
            .map(Some),
        Target::Match => runtime
            .block_on(orchestrator.run_match(&sender))
            .map(|matches| {
                tracing::info!(matches, "Match run complete");
                None
            }),
    };

    drop(sender);
    event_thread.join().ok();

    match (result?, output) {
        (Some(report), OutputFormat::Pretty) => print_remote_report(&term, &report),
        (Some(report), OutputFormat::Json) => {
            println!("{}", serde_json::to_string_pretty(&report)?)
        }
        (None, _) => {}
    }
    Ok(())
}

/// Start a run on the orchestrator service and poll it until it ends
async fn drive_service(config: &Config, target: Target, output: OutputFormat) -> Result<RunStatus> {
    let client = StageClient::new(
        "admin",
        config.remote.orchestrator_url.as_str(),
        ClientSettings::from_config(&config.remote),
    )?;
    let interval = Duration::from_millis(config.remote.status_interval_ms);
    let progress = matches!(output, OutputFormat::Pretty).then(spinner);

    let mut status = client.start_run(target.as_str()).await?;
    while !status.state.is_terminal() {
        if let Some(ref pb) = progress {
            pb.set_message(format!("{:?}", status.state));
            pb.set_position(status.processed);
        }
        tokio::time::sleep(interval).await;
        status = client.run_status().await?;
    }

    if let Some(pb) = progress {
        pb.finish_and_clear();
    }
    Ok(status)
}

fn print_run_status(term: &Term, status: &RunStatus, output: OutputFormat) -> Result<()> {
    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(status)?),
        OutputFormat::Pretty => {
            let marker = if status.state == StageState::Done {
                style("✓").green().bold()
            } else {
                style("✗").red().bold()
            };
            term.write_line(&format!(
                "{} Run {:?}: {} processed",
                marker,
                status.state,
                style(status.processed).cyan()
            ))
            .ok();
            if let Some(error) = &status.error {
                term.write_line(&format!("  {}", style(error).red())).ok();
            }
        }
    }

    if status.state == StageState::Failed {
        return Err(RemoteError::StageFailed {
            stage: "orchestrator".to_string(),
        }
        .into());
    }
    Ok(())
}

fn print_remote_report(term: &Term, report: &RemoteReport) {
    term.write_line(&format!("{} Run Complete", style("✓").green().bold()))
        .ok();
    term.write_line("").ok();
    for (label, value) in [
        ("images", report.images),
        ("modified images", report.modified_images),
        ("hashes", report.hashes),
        ("matches", report.matches),
    ] {
        term.write_line(&format!("  {:<16} {}", label, style(value).cyan()))
            .ok();
    }
    term.write_line(&format!(
        "  finished in {:.1}s",
        report.duration_ms as f64 / 1000.0
    ))
    .ok();
}

fn list_methods() -> Result<()> {
    let term = Term::stdout();
    let modifications = modifier::default_registry()?;
    let methods = hasher::default_registry()?;

    term.write_line(&format!("{}", style("Modifications:").bold().underlined()))
        .ok();
    for name in modifications.names() {
        term.write_line(&format!("  {}", name)).ok();
    }
    term.write_line("").ok();
    term.write_line(&format!("{}", style("Hash methods:").bold().underlined()))
        .ok();
    for name in methods.names() {
        term.write_line(&format!("  {}", name)).ok();
    }
    Ok(())
}

fn print_stats(config: &Config) -> Result<()> {
    let term = Term::stdout();
    let store = config.connector().open()?;

    term.write_line(&format!(
        "{} {}",
        style("Database:").bold(),
        config.paths.database.display()
    ))
    .ok();
    for table in Table::ALL {
        term.write_line(&format!(
            "  {:<16} {}",
            table.name(),
            style(store.count(table)?).cyan()
        ))
        .ok();
    }
    Ok(())
}
