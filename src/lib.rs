//! # changes-lxc
//!
//! **Ephemeral LXC build environments for Changes CI job steps**
//!
//! This crate provisions a throwaway container per job, runs the build in
//! it, streams the output to the job tracker, watches for remote
//! cancellation, and keeps a bounded local cache of reusable snapshot
//! images.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                           changes-lxc                               │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────────────────────────────────────────────────┐    │
//! │  │                      Orchestrator                           │    │
//! │  │   plan → in_progress → launch → build ⇄ heartbeat → report  │    │
//! │  └─────────────────────────────────────────────────────────────┘    │
//! │          │                     │                      │             │
//! │  ┌───────┴────────┐   ┌────────┴────────┐   ┌─────────┴─────────┐   │
//! │  │   Container    │   │    Heartbeat    │   │    LogShipper     │   │
//! │  │ lifecycle FSM  │   │ remote status   │   │ chunked console   │   │
//! │  │ image caching  │   │ polling         │   │ forwarding        │   │
//! │  └───────┬────────┘   └────────┬────────┘   └─────────┬─────────┘   │
//! │          │                     └──────────┬───────────┘             │
//! ├──────────┼────────────────────────────────┼─────────────────────────┤
//! │  ┌───────┴──────────┐  ┌──────────────┐  ┌┴──────────────────┐      │
//! │  │ ContainerRuntime │  │ ObjectStore  │  │    JobService     │      │
//! │  │   LxcRuntime     │  │ S3SyncStore  │  │  ChangesClient    │      │
//! │  └──────────────────┘  └──────────────┘  └───────────────────┘      │
//! └─────────────────────────────────────────────────────────────────────┘
//!
//!   SnapshotCache (batch): scan cache root → reconcile with catalog → evict
//! ```
//!
//! # Container Lifecycle
//!
//! ```text
//!   ┌───────────┐  launch  ┌─────────────┐  start  ┌─────────┐
//!   │ Uncreated │ ───────► │ Provisioned │ ──────► │ Running │ ◄─┐ run
//!   └───────────┘          └─────────────┘         └────┬────┘ ──┘
//!                                                       │ stop
//!                                                       ▼
//!                          ┌───────────┐  destroy  ┌─────────┐
//!                          │ Destroyed │ ◄──────── │ Stopped │ ─┐ create_image
//!                          └───────────┘           └─────────┘ ◄┘
//! ```
//!
//! # Concurrency
//!
//! One job runs three tasks: the build, the heartbeat and the log shipper's
//! drain loop. The orchestrator races the build against the heartbeat with
//! `tokio::select!`. Cancellation is cooperative: a build still running
//! after the grace period is detached, not killed.
//!
//! # Example
//!
//! ```rust,ignore
//! use changes_lxc::{ChangesClient, JobOptions, LxcRuntime, Orchestrator};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> changes_lxc::Result<()> {
//!     let url = "https://changes.example.com/api/0/";
//!     let service = Arc::new(ChangesClient::new(url)?);
//!     let orchestrator = Orchestrator::new(Arc::new(LxcRuntime::new()))
//!         .with_service(service, url);
//!
//!     let outcome = orchestrator.run_remote("jobstep-id", &JobOptions::default()).await?;
//!     std::process::exit(outcome.exit_code());
//! }
//! ```

pub mod api;
pub mod cache;
pub mod constants;
pub mod container;
pub mod error;
pub mod heartbeat;
pub mod log_shipper;
pub mod orchestrator;
pub mod platform;
pub mod runtime;
pub mod runtimes;
pub mod storage;

// Re-exports
pub use api::{ChangesClient, JobService, JobStep, LogChunk, RetryPolicy, SnapshotRecord};
pub use cache::{EvictionPolicy, EvictionReport, SnapshotCache, SnapshotImage};
pub use container::{Container, ContainerPhase, ContainerSpec, LaunchOptions};
pub use error::{Error, Result};
pub use heartbeat::{Heartbeat, HeartbeatOutcome};
pub use log_shipper::{LogBuffer, LogShipper, TeeSink};
pub use orchestrator::{JobOptions, JobOutcome, JobPlan, Orchestrator, resolve_plan};
pub use platform::Arch;
pub use runtime::{AttachOptions, ContainerRuntime, ContainerStatus, OutputSink, StdoutSink};
pub use runtimes::LxcRuntime;
pub use storage::{ObjectStore, S3SyncStore};
