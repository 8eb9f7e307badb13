//! # Heartbeat - Remote Cancellation Monitor
//!
//! Polls the job service at a fixed interval and reports when the job step
//! reaches a terminal status on the remote side (cancelled by a user, timed
//! out by the scheduler, ...).
//!
//! [`Heartbeat::wait`] returns on the first of:
//!
//! - a poll observing a terminal status → [`HeartbeatOutcome::RemoteFinished`]
//! - [`Heartbeat::close`] → [`HeartbeatOutcome::Closed`]
//!
//! `close()` sets the finished flag and wakes the waiter. A close racing an
//! in-flight poll lets that poll complete and then returns without issuing
//! another one.

use crate::api::JobService;
use crate::constants::HEARTBEAT_INTERVAL;
use crate::error::Result;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info};

/// Why [`Heartbeat::wait`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    /// The remote side marked the job step finished.
    RemoteFinished,
    /// The monitor was closed locally.
    Closed,
}

/// Fixed-interval remote status poller for one job step.
pub struct Heartbeat {
    service: Arc<dyn JobService>,
    job_id: String,
    interval: Duration,
    finished: AtomicBool,
    wake: Notify,
}

impl Heartbeat {
    pub fn new(service: Arc<dyn JobService>, job_id: impl Into<String>) -> Self {
        Self::with_interval(service, job_id, HEARTBEAT_INTERVAL)
    }

    pub fn with_interval(
        service: Arc<dyn JobService>,
        job_id: impl Into<String>,
        interval: Duration,
    ) -> Self {
        Self {
            service,
            job_id: job_id.into(),
            interval,
            finished: AtomicBool::new(false),
            wake: Notify::new(),
        }
    }

    /// Polls until the job step finishes remotely or the monitor is closed.
    ///
    /// Service errors end the wait; the transport has already retried them.
    pub async fn wait(&self) -> Result<HeartbeatOutcome> {
        loop {
            if self.is_finished() {
                return Ok(HeartbeatOutcome::Closed);
            }

            let step = self.service.get_job_step(&self.job_id).await?;
            if step.status.is_finished() {
                self.finished.store(true, Ordering::Release);
                info!("Job step {} finished remotely", self.job_id);
                return Ok(HeartbeatOutcome::RemoteFinished);
            }
            debug!("Job step {} still {}", self.job_id, step.status.id);

            let _ = tokio::time::timeout(self.interval, self.wake.notified()).await;
        }
    }

    /// Stops the monitor and wakes a pending [`wait`](Self::wait).
    ///
    /// Idempotent.
    pub fn close(&self) {
        self.finished.store(true, Ordering::Release);
        self.wake.notify_one();
    }

    /// Returns true once the job step finished remotely or the monitor was
    /// closed.
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }
}
