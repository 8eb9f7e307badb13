//! # Remote Job Service - Changes API Client
//!
//! The build wrapper reports to the Changes job tracker: it reads the job
//! step descriptor, moves the step through its statuses, ships console
//! output, marks produced snapshot images, and (for cache maintenance)
//! downloads the snapshot catalog.
//!
//! ## Endpoints
//!
//! | Operation               | Method | Path                                    |
//! |-------------------------|--------|-----------------------------------------|
//! | `get_job_step`          | GET    | `/jobsteps/{id}/`                       |
//! | `update_job_step`       | POST   | `/jobsteps/{id}/`                       |
//! | `update_snapshot_image` | POST   | `/snapshotimages/{id}/`                 |
//! | `append_log`            | POST   | `/jobsteps/{id}/logappend/`             |
//! | `list_snapshots`        | GET    | `/snapshots/?state=valid&per_page=0`    |
//!
//! Updates are form-encoded. Every response body is JSON.
//!
//! ## Retry Contract
//!
//! Each request is attempted up to [`API_MAX_ATTEMPTS`] times with a
//! quadratic backoff (1s, 4s, 9s, 16s). Two statuses end the request on the
//! first attempt:
//!
//! - `404` → [`Error::NotFound`]: an id or the base URL is wrong
//! - `410` → [`Error::BuildCancelled`]: the build was removed upstream
//!
//! Everything else (connection errors, timeouts, other statuses) is
//! transient and surfaces as [`Error::ApiRequestFailed`] once the attempts
//! run out.

use crate::constants::{API_MAX_ATTEMPTS, API_REQUEST_TIMEOUT, API_RETRY_UNIT};
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

// =============================================================================
// Wire Types
// =============================================================================

/// Status id the service uses for terminal job steps.
pub const STATUS_FINISHED: &str = "finished";

/// Status id set when the build starts.
pub const STATUS_IN_PROGRESS: &str = "in_progress";

/// Result id set when the build fails.
pub const RESULT_FAILED: &str = "failed";

/// Snapshot image status once uploaded.
pub const IMAGE_ACTIVE: &str = "active";

/// Snapshot image status when producing it failed.
pub const IMAGE_FAILED: &str = "failed";

/// `{"id": ...}` reference as embedded by the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdRef {
    pub id: String,
}

/// Job step status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatus {
    pub id: String,
}

impl JobStatus {
    /// Returns true if the step has reached a terminal status.
    pub fn is_finished(&self) -> bool {
        self.id == STATUS_FINISHED
    }
}

/// Free-form job step parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStepData {
    #[serde(default)]
    pub release: Option<String>,
}

/// Job step descriptor returned by `GET /jobsteps/{id}/`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStep {
    pub status: JobStatus,
    #[serde(default)]
    pub data: JobStepData,
    /// Snapshot this step must produce.
    #[serde(default)]
    pub expected_snapshot: Option<IdRef>,
    /// Existing snapshot this step runs on.
    #[serde(default)]
    pub snapshot: Option<IdRef>,
}

/// One console chunk as posted to `logappend`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogChunk {
    pub text: String,
    pub source: String,
}

/// Snapshot entry of the remote catalog.
///
/// One snapshot groups the images built for it (one per architecture or
/// release); cache entries are keyed by image id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotRecord {
    pub id: Uuid,
    pub project: ProjectRef,
    /// Creation time, formatted as [`REMOTE_DATETIME_FORMAT`].
    ///
    /// [`REMOTE_DATETIME_FORMAT`]: crate::constants::REMOTE_DATETIME_FORMAT
    pub date_created: String,
    pub is_active: bool,
    #[serde(default)]
    pub images: Vec<ImageRef>,
}

/// Owning project (the eviction class) of a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectRef {
    pub id: Uuid,
}

/// Image id inside a snapshot record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub id: Uuid,
}

// =============================================================================
// Service Trait
// =============================================================================

/// Remote job-tracking service.
#[async_trait]
pub trait JobService: Send + Sync {
    /// Fetches a job step descriptor.
    async fn get_job_step(&self, id: &str) -> Result<JobStep>;

    /// Updates fields of a job step (`status`, `result`).
    async fn update_job_step(&self, id: &str, fields: &[(&str, &str)]) -> Result<()>;

    /// Updates fields of a snapshot image (`status`).
    async fn update_snapshot_image(&self, id: &str, fields: &[(&str, &str)]) -> Result<()>;

    /// Appends one console chunk to a job step's log.
    async fn append_log(&self, id: &str, chunk: &LogChunk) -> Result<()>;

    /// Lists every valid snapshot with its images.
    async fn list_snapshots(&self) -> Result<Vec<SnapshotRecord>>;
}

// =============================================================================
// Retry
// =============================================================================

/// Why a single request attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestFailure {
    /// The service answered with a non-success status.
    Status(u16),
    /// The request never got a usable answer.
    Transport(String),
}

impl std::fmt::Display for RequestFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Status(code) => write!(f, "HTTP {}", code),
            Self::Transport(reason) => write!(f, "{}", reason),
        }
    }
}

/// Retry policy for remote requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts per request, first try included.
    pub max_attempts: u32,
    /// Backoff unit; the delay after failed attempt `n` is `n² × unit`.
    pub unit: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: API_MAX_ATTEMPTS,
            unit: API_RETRY_UNIT,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no backoff.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Delay after failed attempt `attempt` (1-indexed).
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.unit * attempt.saturating_mul(attempt)
    }
}

/// Maps a final attempt failure onto the crate error.
fn classify(path: &str, failure: &RequestFailure, attempts: u32) -> Error {
    match failure {
        RequestFailure::Status(404) => Error::NotFound {
            path: path.to_string(),
        },
        RequestFailure::Status(410) => Error::BuildCancelled,
        other => Error::ApiRequestFailed {
            path: path.to_string(),
            attempts,
            reason: other.to_string(),
        },
    }
}

/// Runs `request` under `policy`.
///
/// 404 and 410 end the loop immediately; other failures are retried until
/// the attempts run out.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, path: &str, mut request: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, RequestFailure>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match request().await {
            Ok(value) => {
                if attempt > 1 {
                    info!("Request to {} succeeded on attempt {}/{}", path, attempt, max_attempts);
                }
                return Ok(value);
            }
            Err(failure) => {
                if matches!(failure, RequestFailure::Status(404 | 410)) || attempt >= max_attempts {
                    return Err(classify(path, &failure, attempt));
                }

                let delay = policy.backoff(attempt);
                warn!(
                    "API request to {} failed ({}), retrying in {:?} (attempt {}/{})",
                    path,
                    failure,
                    delay,
                    attempt + 1,
                    max_attempts
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

// =============================================================================
// HTTP Client
// =============================================================================

/// HTTP client for the Changes API.
#[derive(Debug, Clone)]
pub struct ChangesClient {
    base_url: String,
    http: reqwest::Client,
    policy: RetryPolicy,
}

impl ChangesClient {
    /// Creates a client for `base_url` (e.g. `https://changes.example.com/api/0/`).
    pub fn new(base_url: &str) -> Result<Self> {
        reqwest::Url::parse(base_url).map_err(|e| Error::InvalidUrl {
            url: base_url.to_string(),
            reason: e.to_string(),
        })?;

        let http = reqwest::Client::builder()
            .timeout(API_REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::Internal(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
            policy: RetryPolicy::default(),
        })
    }

    /// Replaces the retry policy.
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Returns the base URL without trailing slash.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn request<T: DeserializeOwned>(
        &self,
        path: &str,
        form: Option<&[(&str, &str)]>,
    ) -> Result<T> {
        let url = self.url(path);
        debug!("Making request to {}", url);

        let body: serde_json::Value = with_retry(&self.policy, path, || async {
            let builder = match form {
                Some(fields) => self.http.post(&url).form(fields),
                None => self.http.get(&url),
            };
            let response = builder
                .send()
                .await
                .map_err(|e| RequestFailure::Transport(e.to_string()))?;

            let status = response.status();
            if !status.is_success() {
                return Err(RequestFailure::Status(status.as_u16()));
            }

            response
                .json::<serde_json::Value>()
                .await
                .map_err(|e| RequestFailure::Transport(e.to_string()))
        })
        .await?;

        Ok(serde_json::from_value(body)?)
    }
}

#[async_trait]
impl JobService for ChangesClient {
    async fn get_job_step(&self, id: &str) -> Result<JobStep> {
        self.request(&format!("/jobsteps/{}/", id), None).await
    }

    async fn update_job_step(&self, id: &str, fields: &[(&str, &str)]) -> Result<()> {
        self.request::<serde_json::Value>(&format!("/jobsteps/{}/", id), Some(fields))
            .await?;
        Ok(())
    }

    async fn update_snapshot_image(&self, id: &str, fields: &[(&str, &str)]) -> Result<()> {
        self.request::<serde_json::Value>(&format!("/snapshotimages/{}/", id), Some(fields))
            .await?;
        Ok(())
    }

    async fn append_log(&self, id: &str, chunk: &LogChunk) -> Result<()> {
        let fields = [("text", chunk.text.as_str()), ("source", chunk.source.as_str())];
        self.request::<serde_json::Value>(&format!("/jobsteps/{}/logappend/", id), Some(&fields))
            .await?;
        Ok(())
    }

    async fn list_snapshots(&self) -> Result<Vec<SnapshotRecord>> {
        self.request("/snapshots/?state=valid&per_page=0", None).await
    }
}
