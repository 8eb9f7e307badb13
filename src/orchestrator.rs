//! # Build Orchestrator
//!
//! Runs one job end to end: resolve the job plan, launch the container,
//! execute the build while watching for remote cancellation and shipping
//! its output, optionally save a snapshot, report the result, tear down.
//!
//! ## Job Flow
//!
//! ```text
//! get_job_step ─▶ resolve_plan ─▶ in_progress ─▶ launch ─┬─▶ build task ──┐
//!                                                         └─▶ heartbeat ───┤ select!
//!                                                                          ▼
//!                        [stop ─▶ create_image ─▶ upload ─▶ image active]
//!                                                                          ▼
//!                         report status ─▶ destroy / keep ─▶ close shipper
//! ```
//!
//! Errors before the plan is resolved (unknown job step, job already
//! finished, contradictory plan) are returned to the caller untouched. From
//! `in_progress` on, every failure is folded into a [`JobOutcome`]; status
//! reporting and teardown always run.
//!
//! ## Plan Precedence
//!
//! 1. descriptor `expectedSnapshot`: build a clean container and save it
//!    under that id
//! 2. descriptor `snapshot`: run on that snapshot, save nothing
//! 3. caller options
//!
//! Saving a snapshot taken from an overlay of another snapshot is refused.
//!
//! ## Cancellation
//!
//! When the heartbeat sees the job step finished remotely, the build task
//! gets [`CANCEL_GRACE_PERIOD`] to exit and is then detached. The build
//! process itself is not killed.

use crate::api::{
    IMAGE_ACTIVE, IMAGE_FAILED, JobService, JobStep, RESULT_FAILED, STATUS_FINISHED,
    STATUS_IN_PROGRESS,
};
use crate::constants::{
    CANCEL_GRACE_PERIOD, CI_CLIENT_BIN, DEFAULT_RELEASE, DEFAULT_USER, HEARTBEAT_INTERVAL,
    SNAPSHOT_CACHE_ROOT,
};
use crate::container::{Container, ContainerSpec, LaunchOptions};
use crate::error::{Error, Result};
use crate::heartbeat::{Heartbeat, HeartbeatOutcome};
use crate::log_shipper::{LogShipper, TeeSink};
use crate::platform::Arch;
use crate::runtime::{ContainerRuntime, OutputSink, StdoutSink};
use crate::storage::ObjectStore;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

// =============================================================================
// Job Parameters
// =============================================================================

/// Caller-supplied job parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOptions {
    pub snapshot: Option<String>,
    pub release: Option<String>,
    pub clean: bool,
    pub save_snapshot: bool,
    /// Keep the container after the job instead of destroying it.
    pub keep: bool,
    pub launch: LaunchOptions,
    /// Command to run. Mutually exclusive with `script`.
    pub command: Vec<String>,
    /// Local script to run. Mutually exclusive with `command`.
    pub script: Option<PathBuf>,
    pub user: String,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            snapshot: None,
            release: None,
            clean: false,
            save_snapshot: false,
            keep: false,
            launch: LaunchOptions::default(),
            command: Vec::new(),
            script: None,
            user: DEFAULT_USER.to_string(),
        }
    }
}

/// Effective image parameters of a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobPlan {
    pub snapshot: Option<String>,
    pub clean: bool,
    pub save_snapshot: bool,
    pub release: String,
}

fn normalize_snapshot_id(id: &str) -> Result<String> {
    Uuid::parse_str(id)
        .map(|u| u.to_string())
        .map_err(|e| Error::InvalidJobPlan(format!("snapshot id '{}' is not a UUID: {}", id, e)))
}

/// Resolves the effective plan from the job step descriptor (if any) and
/// the caller options.
pub fn resolve_plan(step: Option<&JobStep>, opts: &JobOptions) -> Result<JobPlan> {
    let descriptor_snapshots = step.map(|s| (&s.expected_snapshot, &s.snapshot));

    let (snapshot, save_snapshot, clean) = match descriptor_snapshots {
        Some((Some(expected), _)) => (Some(normalize_snapshot_id(&expected.id)?), true, true),
        Some((None, Some(existing))) => (Some(normalize_snapshot_id(&existing.id)?), false, false),
        _ => (
            opts.snapshot.as_deref().map(normalize_snapshot_id).transpose()?,
            opts.save_snapshot,
            opts.clean,
        ),
    };

    let release = step
        .and_then(|s| s.data.release.clone())
        .filter(|r| !r.is_empty())
        .or_else(|| opts.release.clone())
        .unwrap_or_else(|| DEFAULT_RELEASE.to_string());

    if save_snapshot && !clean && snapshot.is_some() {
        return Err(Error::InvalidJobPlan(
            "cannot create a snapshot from an existing snapshot".to_string(),
        ));
    }

    Ok(JobPlan {
        snapshot,
        clean,
        save_snapshot,
        release,
    })
}

/// Terminal result of a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Passed,
    Failed { exit_code: i32, reason: String },
    /// The job step was finished remotely while the build ran.
    Cancelled,
}

impl JobOutcome {
    /// Process exit code mirroring the build.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Passed => 0,
            Self::Failed { exit_code, .. } if *exit_code != 0 => *exit_code,
            Self::Failed { .. } | Self::Cancelled => 1,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Passed)
    }
}

/// What runs inside the container.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Payload {
    Command(Vec<String>),
    Script(PathBuf),
    Nothing,
}

/// How the build task ended.
enum Execution {
    Exited(i32),
    RemoteFinished,
}

// =============================================================================
// Orchestrator
// =============================================================================

/// Runs jobs against a container runtime.
pub struct Orchestrator {
    runtime: Arc<dyn ContainerRuntime>,
    store: Option<Arc<dyn ObjectStore>>,
    service: Option<Arc<dyn JobService>>,
    api_url: Option<String>,
    stdout: Arc<dyn OutputSink>,
    cache_root: PathBuf,
    arch: Arch,
    heartbeat_interval: Duration,
    grace_period: Duration,
}

impl Orchestrator {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            runtime,
            store: None,
            service: None,
            api_url: None,
            stdout: Arc::new(StdoutSink),
            cache_root: PathBuf::from(SNAPSHOT_CACHE_ROOT),
            arch: Arch::detect(),
            heartbeat_interval: HEARTBEAT_INTERVAL,
            grace_period: CANCEL_GRACE_PERIOD,
        }
    }

    /// Object store for snapshot images.
    pub fn with_store(mut self, store: Option<Arc<dyn ObjectStore>>) -> Self {
        self.store = store;
        self
    }

    /// Job service, and the URL the in-container CI client reaches it at.
    pub fn with_service(mut self, service: Arc<dyn JobService>, api_url: impl Into<String>) -> Self {
        self.service = Some(service);
        self.api_url = Some(api_url.into());
        self
    }

    /// Local output destination (stdout by default).
    pub fn with_output(mut self, sink: Arc<dyn OutputSink>) -> Self {
        self.stdout = sink;
        self
    }

    pub fn with_cache_root(mut self, cache_root: impl Into<PathBuf>) -> Self {
        self.cache_root = cache_root.into();
        self
    }

    pub fn with_arch(mut self, arch: Arch) -> Self {
        self.arch = arch;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Runs the job step `job_id` of the configured job service.
    #[instrument(skip(self, opts))]
    pub async fn run_remote(&self, job_id: &str, opts: &JobOptions) -> Result<JobOutcome> {
        let service = self
            .service
            .clone()
            .ok_or_else(|| Error::InvalidJobPlan("job step id given without API URL".to_string()))?;

        let step = service.get_job_step(job_id).await?;
        if step.status.is_finished() {
            return Err(Error::AlreadyFinished(job_id.to_string()));
        }

        let plan = resolve_plan(Some(&step), opts)?;
        info!(?plan, "Resolved job plan");
        self.run_job(Some((service, job_id)), plan, opts).await
    }

    /// Runs a job with no remote job step.
    #[instrument(skip(self, opts))]
    pub async fn run_local(&self, opts: &JobOptions) -> Result<JobOutcome> {
        let plan = resolve_plan(None, opts)?;
        info!(?plan, "Resolved job plan");
        self.run_job(None, plan, opts).await
    }

    fn payload(&self, job_id: Option<&str>, opts: &JobOptions) -> Result<Payload> {
        match (opts.command.is_empty(), &opts.script) {
            (false, Some(_)) => Err(Error::InvalidJobPlan(
                "give either a command or a script, not both".to_string(),
            )),
            (false, None) => Ok(Payload::Command(opts.command.clone())),
            (true, Some(script)) => Ok(Payload::Script(script.clone())),
            (true, None) => match (job_id, &self.api_url) {
                (Some(id), Some(url)) => Ok(Payload::Command(vec![
                    CI_CLIENT_BIN.to_string(),
                    "--server".to_string(),
                    url.clone(),
                    "--jobstep_id".to_string(),
                    id.to_string(),
                ])),
                _ => Ok(Payload::Nothing),
            },
        }
    }

    async fn run_job(
        &self,
        remote: Option<(Arc<dyn JobService>, &str)>,
        plan: JobPlan,
        opts: &JobOptions,
    ) -> Result<JobOutcome> {
        let job_id = remote.as_ref().map(|(_, id)| *id);
        let payload = self.payload(job_id, opts)?;

        let shipper = remote
            .as_ref()
            .map(|(service, id)| Arc::new(LogShipper::spawn(Arc::clone(service), *id)));
        let sink: Arc<dyn OutputSink> = match shipper {
            Some(ref shipper) => Arc::new(
                TeeSink::new()
                    .with(Arc::clone(&self.stdout))
                    .with(Arc::clone(shipper) as Arc<dyn OutputSink>),
            ),
            None => Arc::clone(&self.stdout),
        };

        let spec = ContainerSpec::new(Uuid::new_v4().to_string(), plan.release.clone())
            .with_snapshot(plan.snapshot.clone())
            .with_arch(self.arch)
            .with_cache_root(self.cache_root.clone());
        let container = match Container::new(spec, Arc::clone(&self.runtime), self.store.clone(), Arc::clone(&sink)) {
            Ok(container) => Arc::new(container),
            Err(e) => {
                if let Some(shipper) = shipper {
                    shipper.close().await;
                }
                return Err(e);
            }
        };

        let phase = self
            .execute(remote.as_ref(), &plan, opts, payload, &container, &sink)
            .await;

        let outcome = match phase {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Job failed: {}", e);
                sink.status(&format!("Job failed: {}", e));
                JobOutcome::Failed {
                    exit_code: 1,
                    reason: e.to_string(),
                }
            }
        };

        if let Some((ref service, id)) = remote {
            self.report(service.as_ref(), id, &plan, &outcome).await;
        }

        self.teardown(&container, opts.keep, &sink).await;

        if let Some(shipper) = shipper {
            shipper.close().await;
        }
        Ok(outcome)
    }

    /// Everything between `in_progress` and teardown.
    async fn execute(
        &self,
        remote: Option<&(Arc<dyn JobService>, &str)>,
        plan: &JobPlan,
        opts: &JobOptions,
        payload: Payload,
        container: &Arc<Container>,
        sink: &Arc<dyn OutputSink>,
    ) -> Result<JobOutcome> {
        if let Some((service, id)) = remote {
            service
                .update_job_step(id, &[("status", STATUS_IN_PROGRESS)])
                .await?;
        }

        let launch = LaunchOptions {
            clean: plan.clean,
            ..opts.launch.clone()
        };
        container.launch(&launch).await?;

        let build = {
            let container = Arc::clone(container);
            let user = opts.user.clone();
            tokio::spawn(async move { run_payload(&container, payload, &user).await })
        };

        let execution = match remote {
            Some((service, id)) => {
                let heartbeat = Arc::new(Heartbeat::with_interval(
                    Arc::clone(service),
                    *id,
                    self.heartbeat_interval,
                ));
                self.supervise(build, heartbeat, sink).await?
            }
            None => Execution::Exited(join_build(build.await)?),
        };

        match execution {
            Execution::RemoteFinished => return Ok(JobOutcome::Cancelled),
            Execution::Exited(0) => {}
            Execution::Exited(code) => {
                return Ok(JobOutcome::Failed {
                    exit_code: code,
                    reason: format!("build exited with {}", code),
                });
            }
        }

        if plan.save_snapshot {
            container.stop().await?;
            let snapshot = container.create_image().await?;
            sink.status(&format!("Snapshot saved: {}", snapshot));
            container.upload_image(&snapshot).await?;
            if let Some((service, _)) = remote {
                service
                    .update_snapshot_image(&snapshot, &[("status", IMAGE_ACTIVE)])
                    .await?;
            }
        }

        Ok(JobOutcome::Passed)
    }

    /// Races the build task against the heartbeat.
    async fn supervise(
        &self,
        mut build: tokio::task::JoinHandle<Result<i32>>,
        heartbeat: Arc<Heartbeat>,
        sink: &Arc<dyn OutputSink>,
    ) -> Result<Execution> {
        let mut monitor = {
            let heartbeat = Arc::clone(&heartbeat);
            tokio::spawn(async move { heartbeat.wait().await })
        };

        tokio::select! {
            result = &mut build => {
                heartbeat.close();
                match monitor.await {
                    Ok(Err(e)) => warn!("Heartbeat failed: {}", e),
                    Err(e) => warn!("Heartbeat task failed: {}", e),
                    Ok(Ok(_)) => {}
                }
                Ok(Execution::Exited(join_build(result)?))
            }
            outcome = &mut monitor => {
                match outcome {
                    Ok(Ok(HeartbeatOutcome::RemoteFinished)) => {
                        sink.status("Job step finished remotely, stopping build");
                        self.release_build(build).await;
                        Ok(Execution::RemoteFinished)
                    }
                    Ok(Err(e)) if e.is_cancellation() => {
                        sink.status("Job step removed remotely, stopping build");
                        self.release_build(build).await;
                        Ok(Execution::RemoteFinished)
                    }
                    Ok(Ok(HeartbeatOutcome::Closed)) => {
                        Ok(Execution::Exited(join_build(build.await)?))
                    }
                    Ok(Err(e)) => {
                        warn!("Heartbeat failed, waiting for build alone: {}", e);
                        Ok(Execution::Exited(join_build(build.await)?))
                    }
                    Err(e) => {
                        warn!("Heartbeat task failed, waiting for build alone: {}", e);
                        Ok(Execution::Exited(join_build(build.await)?))
                    }
                }
            }
        }
    }

    /// Gives a build the grace period to exit, then detaches it.
    async fn release_build(&self, mut build: tokio::task::JoinHandle<Result<i32>>) {
        match tokio::time::timeout(self.grace_period, &mut build).await {
            Ok(result) => {
                if let Err(e) = join_build(result) {
                    warn!("Build ended with error after remote finish: {}", e);
                }
            }
            Err(_) => {
                warn!(
                    "Build still running {:?} after remote finish, detaching",
                    self.grace_period
                );
            }
        }
    }

    /// Reports the terminal status. Failures are logged only.
    async fn report(&self, service: &dyn JobService, id: &str, plan: &JobPlan, outcome: &JobOutcome) {
        let result = match outcome {
            JobOutcome::Passed => service.update_job_step(id, &[("status", STATUS_FINISHED)]).await,
            JobOutcome::Failed { .. } => {
                let step = service
                    .update_job_step(id, &[("status", STATUS_FINISHED), ("result", RESULT_FAILED)])
                    .await;
                if plan.save_snapshot
                    && let Some(ref snapshot) = plan.snapshot
                    && let Err(e) = service
                        .update_snapshot_image(snapshot, &[("status", IMAGE_FAILED)])
                        .await
                {
                    warn!("Failed to mark snapshot image {} failed: {}", snapshot, e);
                }
                step
            }
            JobOutcome::Cancelled => Ok(()),
        };

        if let Err(e) = result {
            warn!("Failed to report status of job step {}: {}", id, e);
        }
    }

    async fn teardown(&self, container: &Container, keep: bool, sink: &Arc<dyn OutputSink>) {
        if keep {
            match container.rootfs().await {
                Ok(rootfs) => sink.status(&format!("Container kept at {}", rootfs.display())),
                Err(e) => warn!("Container {} kept, rootfs unknown: {}", container.name(), e),
            }
            sink.status("SSH available via:");
            sink.status(&format!("  $ sudo lxc-attach --name={}", container.name()));
            return;
        }

        if let Err(e) = container.destroy().await {
            error!("Failed to destroy container {}: {}", container.name(), e);
        }
    }
}

fn join_build(
    result: std::result::Result<Result<i32>, tokio::task::JoinError>,
) -> Result<i32> {
    result.map_err(|e| Error::Internal(format!("build task failed: {}", e)))?
}

async fn run_payload(container: &Container, payload: Payload, user: &str) -> Result<i32> {
    match payload {
        Payload::Command(command) => container.run(&command, user).await,
        Payload::Script(script) => match container.run_script(&script, user).await {
            Ok(()) => Ok(0),
            Err(Error::ExecutionFailed { exit_code, .. }) => Ok(exit_code),
            Err(e) => Err(e),
        },
        Payload::Nothing => Ok(0),
    }
}
