//! Error types for the build-environment layer.

use std::path::PathBuf;

/// Result type alias for build-environment operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while provisioning, running, or caching build
/// environments.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Remote Job Service Errors
    // =========================================================================
    /// The service answered 404: the id or the base URL is wrong.
    #[error("not found: {path}")]
    NotFound { path: String },

    /// The service base URL could not be parsed.
    #[error("invalid API URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    /// The service answered 410: the build was removed upstream.
    #[error("build cancelled upstream")]
    BuildCancelled,

    /// A request kept failing after every retry attempt.
    #[error("request to {path} failed after {attempts} attempt(s): {reason}")]
    ApiRequestFailed {
        path: String,
        attempts: u32,
        reason: String,
    },

    /// The job step is already in a terminal state.
    #[error("job step {0} already marked as finished, aborting")]
    AlreadyFinished(String),

    // =========================================================================
    // Container Lifecycle Errors
    // =========================================================================
    /// Container is in the wrong state for the requested operation.
    #[error("container '{id}' is in state '{state}', expected '{expected}'")]
    InvalidState {
        id: String,
        state: String,
        expected: String,
    },

    /// Container name failed validation.
    #[error("invalid container name '{name}': {reason}")]
    InvalidContainerName { name: String, reason: String },

    /// A provisioning step (create, clone, start, install, hooks) failed.
    #[error("failed to provision container '{id}': {reason}")]
    ProvisioningFailed { id: String, reason: String },

    /// The container never reported network reachability.
    #[error("container '{id}' did not come up within {duration:?}")]
    StartupTimeout {
        id: String,
        duration: std::time::Duration,
    },

    /// A command or script inside the container exited non-zero.
    #[error("command {command:?} in container '{container}' exited with {exit_code}")]
    ExecutionFailed {
        container: String,
        command: Vec<String>,
        exit_code: i32,
    },

    /// The local script to copy into the container does not exist.
    #[error("cannot find local script {0}")]
    ScriptNotFound(PathBuf),

    /// The runtime backend invocation itself failed.
    #[error("runtime command '{command}' failed: {reason}")]
    RuntimeCommandFailed { command: String, reason: String },

    // =========================================================================
    // Job Plan Errors
    // =========================================================================
    /// The resolved job parameters are contradictory.
    #[error("invalid job plan: {0}")]
    InvalidJobPlan(String),

    // =========================================================================
    // Image / Object Store Errors
    // =========================================================================
    /// Image persistence was requested without an object store.
    #[error("missing object store configuration (needed for image {0})")]
    ObjectStoreNotConfigured(String),

    /// Directory sync with the object store failed.
    #[error("failed to sync {from} -> {to}: {reason}")]
    SyncFailed {
        from: String,
        to: String,
        reason: String,
    },

    /// Creating the snapshot archive failed.
    #[error("failed to archive rootfs at {path}: {reason}")]
    ArchiveFailed { path: PathBuf, reason: String },

    // =========================================================================
    // Snapshot Cache Errors
    // =========================================================================
    /// Attempted to evict an active or unknown snapshot.
    #[error("cache integrity violation for snapshot {id}: {reason}")]
    CacheIntegrity { id: String, reason: String },

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    // =========================================================================
    // Timeout Errors
    // =========================================================================
    /// Operation timed out.
    #[error("operation timed out after {duration:?}: {operation}")]
    Timeout {
        operation: String,
        duration: std::time::Duration,
    },

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal error (should not happen).
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns true if a remote call failing with this error may be retried.
    ///
    /// Addressing errors and upstream cancellation are final.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ApiRequestFailed { .. } | Self::Timeout { .. })
    }

    /// Returns true if this error means the build was cancelled upstream.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::BuildCancelled)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
