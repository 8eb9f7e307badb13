//! Container runtime trait - the capability interface the lifecycle
//! controller drives.
//!
//! This trait mirrors the primitives a system container manager offers:
//! - `create`: Create a container from a template
//! - `clone_snapshot`: Create a copy-on-write overlay of an existing container
//! - `start` / `stop` / `wait_for_state`: Boot and halt
//! - `attach_run`: Run a process inside a running container
//! - `network_address`: Block until the container has an address
//! - `config_*`: Read and edit the container definition
//! - `destroy`: Remove the container definition and its storage
//!
//! Every blocking primitive takes an explicit timeout, except `attach_run`
//! whose timeout is optional because build commands are unbounded.
//!
//! # Output
//!
//! Processes run through `attach_run` write their stdout and stderr into an
//! [`OutputSink`]. The sink is injected by the caller; nothing in this crate
//! rebinds the process-wide streams.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::net::IpAddr;
use std::time::Duration;

// =============================================================================
// Container Status
// =============================================================================

/// Runtime-reported container status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ContainerStatus {
    /// Container is not running.
    Stopped,
    /// Container is booting.
    Starting,
    /// Container is running.
    Running,
    /// Container is shutting down.
    Stopping,
    /// Container is in a state this crate does not act on (frozen, aborting).
    Other,
}

impl ContainerStatus {
    /// Parses the state names printed by the runtime tools.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_uppercase().as_str() {
            "STOPPED" => Self::Stopped,
            "STARTING" => Self::Starting,
            "RUNNING" => Self::Running,
            "STOPPING" => Self::Stopping,
            _ => Self::Other,
        }
    }
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "STOPPED"),
            Self::Starting => write!(f, "STARTING"),
            Self::Running => write!(f, "RUNNING"),
            Self::Stopping => write!(f, "STOPPING"),
            Self::Other => write!(f, "OTHER"),
        }
    }
}

// =============================================================================
// Output Sinks
// =============================================================================

/// Destination for text produced by a job: build output and progress lines.
///
/// Implementations must tolerate concurrent writers.
pub trait OutputSink: Send + Sync {
    /// Writes one fragment. Fragments need not be newline-terminated.
    fn write(&self, chunk: &str);

    /// Writes a `==> ` progress line.
    fn status(&self, message: &str) {
        self.write(&format!("==> {}\n", message));
    }
}

/// Sink writing to the process stdout.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdoutSink;

impl OutputSink for StdoutSink {
    fn write(&self, chunk: &str) {
        let mut out = std::io::stdout().lock();
        // A closed stdout must not take the job down with it.
        let _ = out.write_all(chunk.as_bytes());
        let _ = out.flush();
    }
}

// =============================================================================
// Attach Options
// =============================================================================

/// Options for running a process inside a container.
#[derive(Debug, Clone, Default)]
pub struct AttachOptions {
    /// Complete environment of the process. Nothing is inherited.
    pub env: Vec<(String, String)>,
    /// Working directory inside the container.
    pub cwd: Option<String>,
    /// Upper bound on the process runtime. `None` waits indefinitely.
    pub timeout: Option<Duration>,
}

// =============================================================================
// Container Runtime Trait
// =============================================================================

/// System container manager interface.
///
/// # Lifecycle
///
/// ```text
/// create | clone_snapshot → start → [attach_run ...] → stop → destroy
/// ```
///
/// # Implementations
///
/// - `LxcRuntime`: the LXC command-line tools
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Returns the runtime name.
    fn name(&self) -> &str;

    /// Returns true if a container with this name is defined.
    async fn is_defined(&self, name: &str) -> Result<bool>;

    /// Returns the current status of a defined container.
    async fn status(&self, name: &str) -> Result<ContainerStatus>;

    /// Returns true if the container is running.
    async fn is_running(&self, name: &str) -> Result<bool> {
        Ok(self.status(name).await? == ContainerStatus::Running)
    }

    /// Creates a container from a template, passing `args` to the template.
    async fn create(&self, name: &str, template: &str, args: &[String]) -> Result<()>;

    /// Clones `base` into `name` as a copy-on-write snapshot, keeping the
    /// base's hostname.
    async fn clone_snapshot(&self, base: &str, name: &str) -> Result<()>;

    /// Starts a defined container in the background.
    async fn start(&self, name: &str) -> Result<()>;

    /// Requests a container to stop. Does not wait.
    async fn stop(&self, name: &str) -> Result<()>;

    /// Waits until the container reaches `state`.
    ///
    /// Returns `false` if `timeout` elapsed first.
    async fn wait_for_state(
        &self,
        name: &str,
        state: ContainerStatus,
        timeout: Duration,
    ) -> Result<bool>;

    /// Runs `command` inside a running container, streaming its output into
    /// `sink`, and returns the exit code.
    ///
    /// A non-zero exit is not an error here; callers interpret it.
    async fn attach_run(
        &self,
        name: &str,
        command: &[String],
        opts: &AttachOptions,
        sink: &dyn OutputSink,
    ) -> Result<i32>;

    /// Waits for the container to obtain an IPv4 address.
    ///
    /// Returns `None` if `timeout` elapsed first.
    async fn network_address(&self, name: &str, timeout: Duration) -> Result<Option<IpAddr>>;

    /// Reads the first value of a configuration key.
    async fn config_get(&self, name: &str, key: &str) -> Result<Option<String>>;

    /// Replaces every value of a configuration key with `value`.
    async fn config_set(&self, name: &str, key: &str, value: &str) -> Result<()>;

    /// Adds another value for a multi-valued configuration key.
    async fn config_append(&self, name: &str, key: &str, value: &str) -> Result<()>;

    /// Removes the container definition and its storage.
    async fn destroy(&self, name: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_status_parsing() {
        assert_eq!(ContainerStatus::parse("RUNNING"), ContainerStatus::Running);
        assert_eq!(ContainerStatus::parse("stopped\n"), ContainerStatus::Stopped);
        assert_eq!(ContainerStatus::parse("FROZEN"), ContainerStatus::Other);
    }

    #[test]
    fn test_status_line_format() {
        struct Capture(Mutex<String>);
        impl OutputSink for Capture {
            fn write(&self, chunk: &str) {
                self.0.lock().unwrap().push_str(chunk);
            }
        }

        let sink = Capture(Mutex::new(String::new()));
        sink.status("Starting container");
        assert_eq!(*sink.0.lock().unwrap(), "==> Starting container\n");
    }
}
