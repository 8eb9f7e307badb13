//! # Container Lifecycle Controller
//!
//! Drives one job's container through the runtime and owns the snapshot
//! image handling around it.
//!
//! ## State Machine
//!
//! ```text
//! Uncreated ──launch──▶ Provisioned ──(start)──▶ Running ──stop──▶ Stopped
//!                                                  │  ▲               │
//!                                            run / run_script     create_image
//!                                                                     │
//!                    any state ──────────destroy──────────────▶ Destroyed
//! ```
//!
//! Operations called in the wrong phase fail with [`Error::InvalidState`]
//! and are never retried.
//!
//! ## Launch Paths
//!
//! | Snapshot | Clean | Path                                                  |
//! |----------|-------|-------------------------------------------------------|
//! | yes      | no    | materialize image, create base (`download`), overlay   |
//! | yes      | yes   | fresh `ubuntu` template (the snapshot is an output)   |
//! | no       | any   | fresh `ubuntu` template                               |
//!
//! Every path then relaxes confinement, boots, waits for the network,
//! installs the baseline packages and writes the sudo policy.
//!
//! ## Process Environment
//!
//! Commands run with a cleared environment plus:
//!
//! | Variable          | Value                                   |
//! |-------------------|-----------------------------------------|
//! | `USER`            | run-as user                             |
//! | `HOME`, `PWD`     | `/root` or `/home/<user>`               |
//! | `DEBIAN_FRONTEND` | `noninteractive`                        |
//! | `LXC_NAME`        | container name                          |
//! | `HOST_HOSTNAME`   | host name of the machine running the job|
//! | `PATH`            | [`CONTAINER_PATH`]                      |

use crate::constants::{
    BASELINE_PACKAGES, CLEAN_TEMPLATE, CONTAINER_PATH, CONTAINER_STOP_TIMEOUT, DEFAULT_DIST,
    IMAGE_CONFIG_FILE, IMAGE_ID_MARKER, IMAGE_MANIFEST, IMAGE_ROOTFS_ARCHIVE, IMAGE_XZ_LEVEL,
    LOOP_DEVICE_RULES, LXC_APPARMOR_KEY, LXC_DEVICES_ALLOW_KEY, LXC_ROOTFS_KEY,
    NETWORK_STARTUP_TIMEOUT, SNAPSHOT_CACHE_ROOT, SNAPSHOT_TEMPLATE, SUDOERS_POLICY,
    validate_container_name,
};
use crate::error::{Error, Result};
use crate::platform::Arch;
use crate::runtime::{AttachOptions, ContainerRuntime, ContainerStatus, OutputSink};
use crate::storage::ObjectStore;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

// =============================================================================
// Types
// =============================================================================

/// Lifecycle phase of a [`Container`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerPhase {
    Uncreated,
    Provisioned,
    Running,
    Stopped,
    Destroyed,
}

impl std::fmt::Display for ContainerPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Uncreated => write!(f, "uncreated"),
            Self::Provisioned => write!(f, "provisioned"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Destroyed => write!(f, "destroyed"),
        }
    }
}

/// Identity and image parameters of a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub release: String,
    /// Snapshot to run on (or to produce, for clean launches).
    pub snapshot: Option<String>,
    pub arch: Arch,
    /// Root of the local snapshot cache.
    pub cache_root: PathBuf,
}

impl ContainerSpec {
    pub fn new(name: impl Into<String>, release: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            release: release.into(),
            snapshot: None,
            arch: Arch::detect(),
            cache_root: PathBuf::from(SNAPSHOT_CACHE_ROOT),
        }
    }

    pub fn with_snapshot(mut self, snapshot: Option<String>) -> Self {
        self.snapshot = snapshot;
        self
    }

    pub fn with_arch(mut self, arch: Arch) -> Self {
        self.arch = arch;
        self
    }

    pub fn with_cache_root(mut self, cache_root: impl Into<PathBuf>) -> Self {
        self.cache_root = cache_root.into();
        self
    }
}

/// Per-launch switches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchOptions {
    /// Validate the downloaded image signature.
    pub validate: bool,
    /// Ignore the snapshot and build from the minimal template.
    pub clean: bool,
    /// Force the minimal template to refresh its cache.
    pub flush_cache: bool,
    /// Host shell command run against the rootfs before boot.
    pub pre_launch: Option<String>,
    /// Local script run inside the container as root after boot.
    pub post_launch: Option<PathBuf>,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            validate: true,
            clean: false,
            flush_cache: false,
            pre_launch: None,
            post_launch: None,
        }
    }
}

/// Home directory of `user` inside the container.
pub fn home_dir(user: &str) -> String {
    if user == "root" {
        "/root".to_string()
    } else {
        format!("/home/{}", user)
    }
}

fn host_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string())
}

// =============================================================================
// Container
// =============================================================================

/// Lifecycle controller for one job container.
pub struct Container {
    spec: ContainerSpec,
    utsname: String,
    runtime: Arc<dyn ContainerRuntime>,
    store: Option<Arc<dyn ObjectStore>>,
    sink: Arc<dyn OutputSink>,
    phase: Mutex<ContainerPhase>,
    host_hostname: String,
}

impl Container {
    /// Creates a controller for a container that does not exist yet.
    pub fn new(
        spec: ContainerSpec,
        runtime: Arc<dyn ContainerRuntime>,
        store: Option<Arc<dyn ObjectStore>>,
        sink: Arc<dyn OutputSink>,
    ) -> Result<Self> {
        validate_container_name(&spec.name).map_err(|reason| Error::InvalidContainerName {
            name: spec.name.clone(),
            reason: reason.to_string(),
        })?;
        if let Some(ref snapshot) = spec.snapshot {
            validate_container_name(snapshot).map_err(|reason| Error::InvalidContainerName {
                name: snapshot.clone(),
                reason: reason.to_string(),
            })?;
        }

        // hostname inside the container
        let utsname = spec
            .snapshot
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        Ok(Self {
            spec,
            utsname,
            runtime,
            store,
            sink,
            phase: Mutex::new(ContainerPhase::Uncreated),
            host_hostname: host_hostname(),
        })
    }

    /// Binds a controller to an existing container, deriving its phase from
    /// the runtime.
    pub async fn attach(
        spec: ContainerSpec,
        runtime: Arc<dyn ContainerRuntime>,
        store: Option<Arc<dyn ObjectStore>>,
        sink: Arc<dyn OutputSink>,
    ) -> Result<Self> {
        let container = Self::new(spec, runtime, store, sink)?;
        let phase = if !container.runtime.is_defined(&container.spec.name).await? {
            ContainerPhase::Uncreated
        } else if container.runtime.is_running(&container.spec.name).await? {
            ContainerPhase::Running
        } else {
            ContainerPhase::Stopped
        };
        container.set_phase(phase);
        debug!("Attached to container {} ({})", container.spec.name, phase);
        Ok(container)
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &ContainerSpec {
        &self.spec
    }

    /// Hostname inside the container, recorded in produced images.
    pub fn utsname(&self) -> &str {
        &self.utsname
    }

    pub fn phase(&self) -> ContainerPhase {
        *self.phase.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_phase(&self, phase: ContainerPhase) {
        *self.phase.lock().unwrap_or_else(|e| e.into_inner()) = phase;
    }

    fn require(&self, expected: ContainerPhase) -> Result<()> {
        let phase = self.phase();
        if phase != expected {
            return Err(Error::InvalidState {
                id: self.spec.name.clone(),
                state: phase.to_string(),
                expected: expected.to_string(),
            });
        }
        Ok(())
    }

    fn provisioning(&self, step: &str, err: impl std::fmt::Display) -> Error {
        Error::ProvisioningFailed {
            id: self.spec.name.clone(),
            reason: format!("{}: {}", step, err),
        }
    }

    /// Host path of the root filesystem.
    ///
    /// Overlay roots (`overlayfs:<base>:<delta>`) resolve to the writable
    /// delta directory.
    pub async fn rootfs(&self) -> Result<PathBuf> {
        let value = self
            .runtime
            .config_get(&self.spec.name, LXC_ROOTFS_KEY)
            .await?
            .ok_or_else(|| self.provisioning("rootfs", "no rootfs configured"))?;
        let path = value.rsplit(':').next().unwrap_or(&value);
        Ok(PathBuf::from(path))
    }

    // =========================================================================
    // Image Cache
    // =========================================================================

    /// Cache-relative path of a snapshot (`<dist>/<release>/<arch>/<id>`).
    pub fn image_path(&self, snapshot: &str) -> String {
        format!(
            "{}/{}/{}/{}",
            DEFAULT_DIST,
            self.spec.release,
            self.spec.arch.lxc_name(),
            snapshot
        )
    }

    /// Absolute local path of a snapshot.
    pub fn local_image_path(&self, snapshot: &str) -> PathBuf {
        self.spec.cache_root.join(self.image_path(snapshot))
    }

    /// Returns true if every manifest file of the image is present locally.
    pub async fn is_image_cached(&self, snapshot: &str) -> Result<bool> {
        let local = self.local_image_path(snapshot);
        for file in IMAGE_MANIFEST {
            if !tokio::fs::try_exists(local.join(file)).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn object_store(&self, snapshot: &str) -> Result<&Arc<dyn ObjectStore>> {
        self.store
            .as_ref()
            .ok_or_else(|| Error::ObjectStoreNotConfigured(snapshot.to_string()))
    }

    /// Makes sure the image is fully present locally, fetching it from the
    /// object store otherwise.
    pub async fn ensure_image_cached(&self, snapshot: &str) -> Result<()> {
        if self.is_image_cached(snapshot).await? {
            debug!("Image {} already cached", snapshot);
            return Ok(());
        }

        let store = self.object_store(snapshot)?;
        let local = self.local_image_path(snapshot);
        let remote = self.image_path(snapshot);

        self.sink.status(&format!(
            "Downloading image {} from {}",
            snapshot,
            store.describe(&remote)
        ));
        let start = Instant::now();
        store.pull(&remote, &local).await?;
        self.sink.status(&format!(
            "Image {} downloaded in {:.2}s",
            snapshot,
            start.elapsed().as_secs_f64()
        ));
        Ok(())
    }

    /// Persists a local image to the object store.
    pub async fn upload_image(&self, snapshot: &str) -> Result<()> {
        let store = self.object_store(snapshot)?;
        let local = self.local_image_path(snapshot);
        let remote = self.image_path(snapshot);

        self.sink.status(&format!(
            "Uploading image {} to {}",
            snapshot,
            store.describe(&remote)
        ));
        let start = Instant::now();
        store.push(&local, &remote).await?;
        self.sink.status(&format!(
            "Image {} uploaded in {:.2}s",
            snapshot,
            start.elapsed().as_secs_f64()
        ));
        Ok(())
    }

    // =========================================================================
    // Launch
    // =========================================================================

    /// Provisions, boots and prepares the container.
    pub async fn launch(&self, opts: &LaunchOptions) -> Result<()> {
        self.require(ContainerPhase::Uncreated)?;
        let name = self.spec.name.as_str();
        let arch = self.spec.arch.lxc_name().to_string();

        match self.spec.snapshot {
            Some(ref snapshot) if !opts.clean => {
                if !self.runtime.is_defined(snapshot).await? {
                    self.ensure_image_cached(snapshot).await?;

                    let mut args = vec![
                        "--dist".to_string(),
                        DEFAULT_DIST.to_string(),
                        "--release".to_string(),
                        self.spec.release.clone(),
                        "--arch".to_string(),
                        arch,
                        "--variant".to_string(),
                        snapshot.clone(),
                    ];
                    if !opts.validate {
                        args.push("--no-validate".to_string());
                    }

                    self.runtime
                        .create(snapshot, SNAPSHOT_TEMPLATE, &args)
                        .await
                        .map_err(|e| {
                            self.provisioning(&format!("load cached image {}", snapshot), e)
                        })?;
                }

                self.sink.status(&format!("Overlaying container: {}", snapshot));
                self.runtime
                    .clone_snapshot(snapshot, name)
                    .await
                    .map_err(|e| self.provisioning(&format!("clone {}", snapshot), e))?;
            }
            _ => {
                let mut args = vec![
                    "--release".to_string(),
                    self.spec.release.clone(),
                    "--arch".to_string(),
                    arch,
                ];
                if opts.flush_cache {
                    args.push("--flush-cache".to_string());
                }

                self.sink.status("Creating container");
                self.runtime
                    .create(name, CLEAN_TEMPLATE, &args)
                    .await
                    .map_err(|e| self.provisioning("create", e))?;
            }
        }
        self.set_phase(ContainerPhase::Provisioned);

        if let Some(ref pre) = opts.pre_launch {
            self.run_pre_launch(pre).await?;
        }

        self.relax_confinement().await?;

        self.sink.status("Starting container");
        self.runtime
            .start(name)
            .await
            .map_err(|e| self.provisioning("start", e))?;
        self.set_phase(ContainerPhase::Running);

        self.sink.status("Waiting for container to startup networking");
        let addr = self
            .runtime
            .network_address(name, NETWORK_STARTUP_TIMEOUT)
            .await
            .map_err(|e| self.provisioning("network", e))?;
        match addr {
            Some(addr) => info!("Container {} is up at {}", name, addr),
            None => {
                return Err(Error::StartupTimeout {
                    id: name.to_string(),
                    duration: NETWORK_STARTUP_TIMEOUT,
                });
            }
        }

        self.sink
            .status(&format!("Install {}", BASELINE_PACKAGES.join(" ")));
        let packages: Vec<String> = BASELINE_PACKAGES.iter().map(|p| p.to_string()).collect();
        self.install(&packages).await?;

        self.sink.status("Setting up sudoers");
        self.setup_sudoers().await?;

        if let Some(ref post) = opts.post_launch {
            self.run_script(post, "root")
                .await
                .map_err(|e| self.provisioning("post-launch hook", e))?;
        }

        Ok(())
    }

    async fn run_pre_launch(&self, command: &str) -> Result<()> {
        let rootfs = self.rootfs().await?;
        self.sink.status(&format!("Running pre-launch hook: {}", command));

        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&rootfs)
            .env("LXC_ROOTFS", &rootfs)
            .env("LXC_NAME", &self.spec.name)
            .stdin(std::process::Stdio::null())
            .output()
            .await
            .map_err(|e| self.provisioning("pre-launch hook", e))?;

        self.sink.write(&String::from_utf8_lossy(&output.stdout));
        self.sink.write(&String::from_utf8_lossy(&output.stderr));

        if !output.status.success() {
            return Err(self.provisioning("pre-launch hook", output.status));
        }
        Ok(())
    }

    async fn relax_confinement(&self) -> Result<()> {
        let name = self.spec.name.as_str();
        self.runtime
            .config_set(name, LXC_APPARMOR_KEY, "unconfined")
            .await
            .map_err(|e| self.provisioning("apparmor profile", e))?;
        for rule in LOOP_DEVICE_RULES {
            self.runtime
                .config_append(name, LXC_DEVICES_ALLOW_KEY, rule)
                .await
                .map_err(|e| self.provisioning("device rules", e))?;
        }
        Ok(())
    }

    async fn install(&self, packages: &[String]) -> Result<()> {
        let update = ["apt-get", "update", "-y", "--fix-missing"].map(String::from);
        let code = self.run(&update, "root").await?;
        if code != 0 {
            return Err(self.provisioning("apt-get update", format!("exit code {}", code)));
        }

        let mut install: Vec<String> = ["apt-get", "install", "-y", "--force-yes"]
            .map(String::from)
            .to_vec();
        install.extend_from_slice(packages);
        let code = self.run(&install, "root").await?;
        if code != 0 {
            return Err(self.provisioning("apt-get install", format!("exit code {}", code)));
        }
        Ok(())
    }

    async fn setup_sudoers(&self) -> Result<()> {
        let path = self.rootfs().await?.join("etc").join("sudoers");
        tokio::fs::write(&path, SUDOERS_POLICY)
            .await
            .map_err(|e| self.provisioning("sudoers", e))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o440))
                .await
                .map_err(|e| self.provisioning("sudoers", e))?;
        }
        Ok(())
    }

    // =========================================================================
    // Execution
    // =========================================================================

    /// Runs a command as `user` and returns its exit code.
    ///
    /// A non-zero exit is returned, not raised.
    pub async fn run(&self, command: &[String], user: &str) -> Result<i32> {
        self.exec(command, user, false).await
    }

    async fn exec(&self, command: &[String], user: &str, quiet: bool) -> Result<i32> {
        self.require(ContainerPhase::Running)?;

        let home = home_dir(user);
        let env = vec![
            ("USER".to_string(), user.to_string()),
            ("HOME".to_string(), home.clone()),
            ("PWD".to_string(), home.clone()),
            ("DEBIAN_FRONTEND".to_string(), "noninteractive".to_string()),
            ("LXC_NAME".to_string(), self.spec.name.clone()),
            ("HOST_HOSTNAME".to_string(), self.host_hostname.clone()),
            ("PATH".to_string(), CONTAINER_PATH.to_string()),
        ];

        let argv: Vec<String> = if user == "root" {
            command.to_vec()
        } else {
            ["sudo", "-EHu", user]
                .iter()
                .map(|s| s.to_string())
                .chain(command.iter().cloned())
                .collect()
        };

        if !quiet {
            self.sink.status(&format!("Running: {:?}", command));
        }

        let opts = AttachOptions {
            env,
            cwd: Some(home),
            timeout: None,
        };
        let code = self
            .runtime
            .attach_run(&self.spec.name, &argv, &opts, self.sink.as_ref())
            .await?;

        if !quiet {
            self.sink.status(&format!("Command exited: {}", code));
        }
        Ok(code)
    }

    /// Copies a local script into the container and runs it as `user`.
    ///
    /// A non-zero exit is an [`Error::ExecutionFailed`].
    pub async fn run_script(&self, script: &Path, user: &str) -> Result<()> {
        let is_file = tokio::fs::metadata(script)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false);
        if !is_file {
            return Err(Error::ScriptNotFound(script.to_path_buf()));
        }
        self.require(ContainerPhase::Running)?;

        let target = format!("/tmp/script-{}", Uuid::new_v4().simple());
        self.sink.status(&format!(
            "Writing local script {} as {}",
            script.display(),
            target
        ));
        let host_target = self.rootfs().await?.join(target.trim_start_matches('/'));
        tokio::fs::copy(script, &host_target).await?;

        let chmod = ["chmod", "0755", target.as_str()].map(String::from);
        let code = self.exec(&chmod, "root", true).await?;
        if code != 0 {
            return Err(Error::ExecutionFailed {
                container: self.spec.name.clone(),
                command: chmod.to_vec(),
                exit_code: code,
            });
        }

        let command = vec![target];
        let code = self.run(&command, user).await?;
        if code != 0 {
            return Err(Error::ExecutionFailed {
                container: self.spec.name.clone(),
                command,
                exit_code: code,
            });
        }
        Ok(())
    }

    // =========================================================================
    // Stop / Snapshot / Destroy
    // =========================================================================

    /// Stops the container and waits for it to halt.
    pub async fn stop(&self) -> Result<()> {
        self.require(ContainerPhase::Running)?;

        self.sink.status("Stopping container");
        self.runtime.stop(&self.spec.name).await?;
        let stopped = self
            .runtime
            .wait_for_state(&self.spec.name, ContainerStatus::Stopped, CONTAINER_STOP_TIMEOUT)
            .await?;
        if !stopped {
            return Err(Error::Timeout {
                operation: format!("stop container {}", self.spec.name),
                duration: CONTAINER_STOP_TIMEOUT,
            });
        }

        self.set_phase(ContainerPhase::Stopped);
        Ok(())
    }

    /// Saves the stopped container's root filesystem into the snapshot
    /// cache and returns the snapshot id.
    pub async fn create_image(&self) -> Result<String> {
        self.require(ContainerPhase::Stopped)?;

        let snapshot = self
            .spec
            .snapshot
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let dest = self.local_image_path(&snapshot);

        self.sink
            .status(&format!("Saving snapshot to {}", dest.display()));
        tokio::fs::create_dir_all(&dest).await?;

        self.sink.status("Creating metadata");
        let config = format!(
            "lxc.include = LXC_TEMPLATE_CONFIG/ubuntu.common.conf\nlxc.arch = {}\n",
            self.spec.arch.personality()
        );
        tokio::fs::write(dest.join(IMAGE_CONFIG_FILE), config).await?;

        self.sink.status(&format!("Creating {}", IMAGE_ROOTFS_ARCHIVE));
        let rootfs = self.rootfs().await?;
        let archive = dest.join(IMAGE_ROOTFS_ARCHIVE);
        tokio::task::spawn_blocking(move || archive_rootfs(&rootfs, &archive))
            .await
            .map_err(|e| Error::Internal(format!("archive task failed: {}", e)))??;

        tokio::fs::write(dest.join(IMAGE_ID_MARKER), &self.utsname).await?;

        info!("Saved snapshot {} of {}", snapshot, self.spec.name);
        Ok(snapshot)
    }

    /// Stops (if needed) and removes the container.
    ///
    /// A container that was never defined is left alone.
    pub async fn destroy(&self) -> Result<()> {
        let name = self.spec.name.as_str();
        if !self.runtime.is_defined(name).await? {
            self.sink.status("No container to destroy");
            return Ok(());
        }

        if self.runtime.is_running(name).await? {
            self.sink.status("Container is running, stop it first");
            self.runtime.stop(name).await?;
            self.sink.status("Wait for container to stop");
            let stopped = self
                .runtime
                .wait_for_state(name, ContainerStatus::Stopped, CONTAINER_STOP_TIMEOUT)
                .await?;
            if !stopped {
                warn!("Container {} did not stop within {:?}", name, CONTAINER_STOP_TIMEOUT);
            }
        }

        self.sink.status("Destroying container");
        self.runtime.destroy(name).await?;
        self.set_phase(ContainerPhase::Destroyed);
        Ok(())
    }
}

/// Writes `rootfs` as an xz-compressed tarball rooted at `.`.
fn archive_rootfs(rootfs: &Path, archive: &Path) -> Result<()> {
    let fail = |e: std::io::Error| Error::ArchiveFailed {
        path: rootfs.to_path_buf(),
        reason: e.to_string(),
    };

    let file = std::fs::File::create(archive).map_err(fail)?;
    let encoder = xz2::write::XzEncoder::new(file, IMAGE_XZ_LEVEL);
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);
    builder.append_dir_all(".", rootfs).map_err(fail)?;
    let encoder = builder.into_inner().map_err(fail)?;
    encoder.finish().map_err(fail)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_home_dir() {
        assert_eq!(home_dir("root"), "/root");
        assert_eq!(home_dir("ubuntu"), "/home/ubuntu");
    }

    #[test]
    fn test_archive_rootfs_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let rootfs = dir.path().join("rootfs");
        std::fs::create_dir_all(rootfs.join("etc")).unwrap();
        std::fs::write(rootfs.join("etc").join("hostname"), "box\n").unwrap();

        let archive = dir.path().join(IMAGE_ROOTFS_ARCHIVE);
        archive_rootfs(&rootfs, &archive).unwrap();

        let file = std::fs::File::open(&archive).unwrap();
        let mut tar = tar::Archive::new(xz2::read::XzDecoder::new(file));
        let names: Vec<String> = tar
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        assert!(names.iter().any(|n| n.ends_with("etc/hostname")));
    }
}
