//! tracksync core library
//!
//! Downloads playlist tracks through a chain of interchangeable backends and
//! keeps local playlist folders in step with their upstream sources.
//!
//! # Architecture
//!
//! - [`backend`] - adapters for the external download services and their priority registry
//! - [`download`] - orchestrator, retry controller, rate limiting and backend health
//! - [`proxy`] - scored, self-blacklisting proxy pool
//! - [`integrity`] - file verification, playlist audit and repair
//! - [`playlist`] - playlist and track model, sync deltas
//! - [`store`] / [`db`] - SQLite persistence
//! - [`sync`] - sync state machine and weekly scheduler
//! - [`notify`] - structured notifications for front-ends
//! - [`failure`] - user-facing failure summaries
//! - [`service`] - request/response entry point for front-ends

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod backend;
pub mod db;
pub mod download;
pub mod failure;
pub mod integrity;
pub mod notify;
pub mod playlist;
pub mod proxy;
pub mod service;
pub mod store;
pub mod sync;

// Re-export commonly used types
pub use backend::{Backend, BackendKind, BackendRegistry, BackendSettings, build_default_registry};
pub use db::Database;
pub use download::{
    AttemptOptions, AttemptRecord, FailureKind, HttpClient, Orchestrator, OrchestratorConfig,
    Outcome, RetryPolicy,
};
pub use failure::UserFacingFailure;
pub use integrity::{IntegrityChecker, IntegrityPolicy, VerificationResult};
pub use notify::{Notification, Notifier};
pub use playlist::{Playlist, Track, TrackStatus};
pub use proxy::{ProxyManager, ProxyPolicy};
pub use service::{CoreHandle, CoreRequest, CoreService, DownloadRequest, SyncRequest};
pub use store::{PlaylistStore, SqliteStore, StoreError};
pub use sync::{SyncConfig, SyncEngine, SyncReport, SyncSchedule};
