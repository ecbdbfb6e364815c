//! # Remote Module
//!
//! The load, modify, hash and match stages as HTTP services, and the async
//! orchestrator that drives a run across them.
//!
//! - [`service`] - axum routers for each stage, backed by the same stage
//!   implementations the local pipeline uses
//! - [`client`] - reqwest client for one stage, with connection retries
//! - [`health`] - readiness gate polled before any work is sent
//! - [`orchestrator`] - bounded per-edge channels, match polling and the
//!   `/admin` service
//! - [`wire`] - JSON bodies

pub mod client;
pub mod health;
pub mod orchestrator;
pub mod service;
pub mod wire;

pub use client::{ClientSettings, StageClient};
pub use health::HealthGate;
pub use orchestrator::{
    admin_router, AdminState, Orchestrator, OrchestratorSettings, RemoteReport, StageClients,
};
pub use service::{
    hash_router, load_router, match_router, modify_router, router, serve, ServiceState,
};
pub use wire::{Health, RunStatus};
