//! In-memory fakes of the external collaborators shared by the
//! integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use changes_lxc::api::{IdRef, JobStatus, JobStepData};
use changes_lxc::{
    AttachOptions, ContainerRuntime, ContainerStatus, Error, JobService, JobStep, LogChunk,
    ObjectStore, OutputSink, Result, SnapshotRecord,
};
use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

pub const API_URL: &str = "http://changes.test/api/0/";

pub type Fields = Vec<(String, String)>;

fn owned_fields(fields: &[(&str, &str)]) -> Fields {
    fields
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

// =============================================================================
// Job Service
// =============================================================================

pub struct FakeJobService {
    pub step: Mutex<JobStep>,
    /// Statuses handed out by successive `get_job_step` calls; once empty
    /// the status of `step` repeats.
    pub statuses: Mutex<VecDeque<String>>,
    pub polls: AtomicUsize,
    pub job_updates: Mutex<Vec<(String, Fields)>>,
    pub image_updates: Mutex<Vec<(String, Fields)>>,
    pub logs: Mutex<Vec<LogChunk>>,
    pub catalog: Mutex<Vec<SnapshotRecord>>,
    pub catalog_calls: AtomicUsize,
    pub fail_logs: AtomicBool,
    pub fail_polls: AtomicBool,
    /// `(n, error)`: every `get_job_step` call after the first `n` fails
    /// with `error()`.
    pub fail_after: Mutex<Option<(usize, fn() -> Error)>>,
}

impl FakeJobService {
    pub fn new() -> Self {
        Self::with_step(job_step("queued", None, None))
    }

    pub fn with_step(step: JobStep) -> Self {
        Self {
            step: Mutex::new(step),
            statuses: Mutex::new(VecDeque::new()),
            polls: AtomicUsize::new(0),
            job_updates: Mutex::new(Vec::new()),
            image_updates: Mutex::new(Vec::new()),
            logs: Mutex::new(Vec::new()),
            catalog: Mutex::new(Vec::new()),
            catalog_calls: AtomicUsize::new(0),
            fail_logs: AtomicBool::new(false),
            fail_polls: AtomicBool::new(false),
            fail_after: Mutex::new(None),
        }
    }

    pub fn queue_statuses(&self, statuses: &[&str]) {
        self.statuses
            .lock()
            .unwrap()
            .extend(statuses.iter().map(|s| s.to_string()));
    }

    pub fn fail_after(&self, polls: usize, error: fn() -> Error) {
        *self.fail_after.lock().unwrap() = Some((polls, error));
    }

    pub fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }

    pub fn job_updates(&self) -> Vec<(String, Fields)> {
        self.job_updates.lock().unwrap().clone()
    }

    pub fn image_updates(&self) -> Vec<(String, Fields)> {
        self.image_updates.lock().unwrap().clone()
    }

    pub fn log_text(&self) -> String {
        self.logs
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.text.as_str())
            .collect()
    }
}

#[async_trait]
impl JobService for FakeJobService {
    async fn get_job_step(&self, _id: &str) -> Result<JobStep> {
        let poll = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((after, error)) = *self.fail_after.lock().unwrap() {
            if poll > after {
                return Err(error());
            }
        }
        if self.fail_polls.load(Ordering::SeqCst) {
            return Err(Error::ApiRequestFailed {
                path: "/jobsteps/x/".to_string(),
                attempts: 5,
                reason: "HTTP 502".to_string(),
            });
        }

        let mut step = self.step.lock().unwrap().clone();
        if let Some(status) = self.statuses.lock().unwrap().pop_front() {
            step.status.id = status;
        }
        Ok(step)
    }

    async fn update_job_step(&self, id: &str, fields: &[(&str, &str)]) -> Result<()> {
        self.job_updates
            .lock()
            .unwrap()
            .push((id.to_string(), owned_fields(fields)));
        Ok(())
    }

    async fn update_snapshot_image(&self, id: &str, fields: &[(&str, &str)]) -> Result<()> {
        self.image_updates
            .lock()
            .unwrap()
            .push((id.to_string(), owned_fields(fields)));
        Ok(())
    }

    async fn append_log(&self, _id: &str, chunk: &LogChunk) -> Result<()> {
        if self.fail_logs.load(Ordering::SeqCst) {
            return Err(Error::ApiRequestFailed {
                path: "/logappend/".to_string(),
                attempts: 5,
                reason: "HTTP 503".to_string(),
            });
        }
        self.logs.lock().unwrap().push(chunk.clone());
        Ok(())
    }

    async fn list_snapshots(&self) -> Result<Vec<SnapshotRecord>> {
        self.catalog_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.catalog.lock().unwrap().clone())
    }
}

pub fn job_step(status: &str, expected: Option<&str>, existing: Option<&str>) -> JobStep {
    JobStep {
        status: JobStatus {
            id: status.to_string(),
        },
        data: JobStepData::default(),
        expected_snapshot: expected.map(|id| IdRef { id: id.to_string() }),
        snapshot: existing.map(|id| IdRef { id: id.to_string() }),
    }
}

// =============================================================================
// Container Runtime
// =============================================================================

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub status: ContainerStatus,
    pub config: Vec<(String, String)>,
}

pub struct FakeRuntime {
    base: PathBuf,
    pub containers: Mutex<HashMap<String, FakeContainer>>,
    pub calls: Mutex<Vec<String>>,
    pub commands: Mutex<Vec<(Vec<String>, AttachOptions)>>,
    pub network: Mutex<Option<IpAddr>>,
    /// `(needle, exit code)`: commands containing the needle exit with it.
    pub exit_codes: Mutex<Vec<(String, i32)>>,
    /// Commands containing this needle never finish.
    pub hang_on: Mutex<Option<String>>,
}

impl FakeRuntime {
    /// Creates a runtime keeping container root filesystems under `base`.
    pub fn new(base: &Path) -> Self {
        Self {
            base: base.to_path_buf(),
            containers: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            commands: Mutex::new(Vec::new()),
            network: Mutex::new(Some("10.0.3.15".parse().unwrap())),
            exit_codes: Mutex::new(Vec::new()),
            hang_on: Mutex::new(None),
        }
    }

    fn make_rootfs(&self, name: &str) -> PathBuf {
        let rootfs = self.base.join(name).join("rootfs");
        std::fs::create_dir_all(rootfs.join("etc")).unwrap();
        std::fs::create_dir_all(rootfs.join("tmp")).unwrap();
        rootfs
    }

    /// Defines a stopped container directly.
    pub fn define(&self, name: &str) {
        let rootfs = self.make_rootfs(name);
        self.containers.lock().unwrap().insert(
            name.to_string(),
            FakeContainer {
                status: ContainerStatus::Stopped,
                config: vec![("lxc.rootfs".to_string(), rootfs.display().to_string())],
            },
        );
    }

    pub fn fail_with(&self, needle: &str, code: i32) {
        self.exit_codes
            .lock()
            .unwrap()
            .push((needle.to_string(), code));
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn commands(&self) -> Vec<(Vec<String>, AttachOptions)> {
        self.commands.lock().unwrap().clone()
    }

    pub fn config(&self, name: &str) -> Vec<(String, String)> {
        self.containers
            .lock()
            .unwrap()
            .get(name)
            .map(|c| c.config.clone())
            .unwrap_or_default()
    }

    pub fn defined(&self) -> Vec<String> {
        let mut names: Vec<String> = self.containers.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn missing(name: &str) -> Error {
        Error::RuntimeCommandFailed {
            command: "fake".to_string(),
            reason: format!("container {} not defined", name),
        }
    }

    fn set_status(&self, name: &str, status: ContainerStatus) -> Result<()> {
        let mut containers = self.containers.lock().unwrap();
        let container = containers.get_mut(name).ok_or_else(|| Self::missing(name))?;
        container.status = status;
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    fn name(&self) -> &str {
        "fake"
    }

    async fn is_defined(&self, name: &str) -> Result<bool> {
        Ok(self.containers.lock().unwrap().contains_key(name))
    }

    async fn status(&self, name: &str) -> Result<ContainerStatus> {
        self.containers
            .lock()
            .unwrap()
            .get(name)
            .map(|c| c.status)
            .ok_or_else(|| Self::missing(name))
    }

    async fn create(&self, name: &str, template: &str, args: &[String]) -> Result<()> {
        self.record(format!("create {} {} {}", name, template, args.join(" ")));
        self.define(name);
        Ok(())
    }

    async fn clone_snapshot(&self, base: &str, name: &str) -> Result<()> {
        self.record(format!("clone {} {}", base, name));
        let base_rootfs = {
            let containers = self.containers.lock().unwrap();
            let base_container = containers.get(base).ok_or_else(|| Self::missing(base))?;
            base_container
                .config
                .iter()
                .find(|(k, _)| k == "lxc.rootfs")
                .map(|(_, v)| v.clone())
                .unwrap_or_default()
        };
        let delta = self.make_rootfs(name);
        self.containers.lock().unwrap().insert(
            name.to_string(),
            FakeContainer {
                status: ContainerStatus::Stopped,
                config: vec![(
                    "lxc.rootfs".to_string(),
                    format!("overlayfs:{}:{}", base_rootfs, delta.display()),
                )],
            },
        );
        Ok(())
    }

    async fn start(&self, name: &str) -> Result<()> {
        self.record(format!("start {}", name));
        self.set_status(name, ContainerStatus::Running)
    }

    async fn stop(&self, name: &str) -> Result<()> {
        self.record(format!("stop {}", name));
        self.set_status(name, ContainerStatus::Stopped)
    }

    async fn wait_for_state(
        &self,
        name: &str,
        state: ContainerStatus,
        _timeout: Duration,
    ) -> Result<bool> {
        Ok(self.status(name).await? == state)
    }

    async fn attach_run(
        &self,
        name: &str,
        command: &[String],
        opts: &AttachOptions,
        sink: &dyn OutputSink,
    ) -> Result<i32> {
        if self.status(name).await? != ContainerStatus::Running {
            return Err(Self::missing(name));
        }
        self.commands
            .lock()
            .unwrap()
            .push((command.to_vec(), opts.clone()));

        let joined = command.join(" ");
        sink.write(&format!("ran {}\n", joined));

        let hang = self
            .hang_on
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|needle| joined.contains(needle.as_str()));
        if hang {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }

        let code = self
            .exit_codes
            .lock()
            .unwrap()
            .iter()
            .find(|(needle, _)| joined.contains(needle.as_str()))
            .map(|(_, code)| *code)
            .unwrap_or(0);
        Ok(code)
    }

    async fn network_address(&self, _name: &str, _timeout: Duration) -> Result<Option<IpAddr>> {
        Ok(*self.network.lock().unwrap())
    }

    async fn config_get(&self, name: &str, key: &str) -> Result<Option<String>> {
        Ok(self
            .config(name)
            .into_iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v))
    }

    async fn config_set(&self, name: &str, key: &str, value: &str) -> Result<()> {
        let mut containers = self.containers.lock().unwrap();
        let container = containers.get_mut(name).ok_or_else(|| Self::missing(name))?;
        container.config.retain(|(k, _)| k != key);
        container.config.push((key.to_string(), value.to_string()));
        Ok(())
    }

    async fn config_append(&self, name: &str, key: &str, value: &str) -> Result<()> {
        let mut containers = self.containers.lock().unwrap();
        let container = containers.get_mut(name).ok_or_else(|| Self::missing(name))?;
        container.config.push((key.to_string(), value.to_string()));
        Ok(())
    }

    async fn destroy(&self, name: &str) -> Result<()> {
        self.record(format!("destroy {}", name));
        self.containers
            .lock()
            .unwrap()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Self::missing(name))
    }
}

// =============================================================================
// Object Store
// =============================================================================

#[derive(Default)]
pub struct FakeStore {
    pub pulls: Mutex<Vec<(String, PathBuf)>>,
    pub pushes: Mutex<Vec<(PathBuf, String)>>,
}

impl FakeStore {
    pub fn pulls(&self) -> Vec<(String, PathBuf)> {
        self.pulls.lock().unwrap().clone()
    }

    pub fn pushes(&self) -> Vec<(PathBuf, String)> {
        self.pushes.lock().unwrap().clone()
    }
}

#[async_trait]
impl ObjectStore for FakeStore {
    fn describe(&self, remote_rel: &str) -> String {
        format!("fake://{}", remote_rel)
    }

    async fn pull(&self, remote_rel: &str, local: &Path) -> Result<()> {
        std::fs::create_dir_all(local)?;
        for file in changes_lxc::constants::IMAGE_MANIFEST {
            std::fs::write(local.join(file), file)?;
        }
        self.pulls
            .lock()
            .unwrap()
            .push((remote_rel.to_string(), local.to_path_buf()));
        Ok(())
    }

    async fn push(&self, local: &Path, remote_rel: &str) -> Result<()> {
        self.pushes
            .lock()
            .unwrap()
            .push((local.to_path_buf(), remote_rel.to_string()));
        Ok(())
    }
}

// =============================================================================
// Output
// =============================================================================

#[derive(Default)]
pub struct CaptureSink {
    text: Mutex<String>,
}

impl CaptureSink {
    pub fn text(&self) -> String {
        self.text.lock().unwrap().clone()
    }
}

impl OutputSink for CaptureSink {
    fn write(&self, chunk: &str) {
        self.text.lock().unwrap().push_str(chunk);
    }
}
