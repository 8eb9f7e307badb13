//! # Log Shipper - Console Output Forwarding
//!
//! Everything a job prints is appended to a [`LogBuffer`] by any number of
//! writers. One background task drains the buffer, regroups the fragments
//! into bounded chunks and posts them to the job service in append order.
//!
//! ## Drain Loop
//!
//! ```text
//! loop:
//!     closed? ──read──▶ drain buffer ──▶ chunk ──▶ append_log (in order)
//!     closed && empty ─▶ exit
//!     !closed         ─▶ wait for write/close, at most LOG_FLUSH_INTERVAL
//! ```
//!
//! The closed flag is read before draining, so content written before
//! `close()` is always shipped by the final pass.
//!
//! ## Chunking
//!
//! A chunk ends at the last newline at or before the size bound, or at the
//! bound itself when no newline is in range. Content still unterminated
//! when the buffer runs dry is shipped as a final partial chunk.

use crate::api::{JobService, LogChunk};
use crate::constants::{LOG_CHUNK_SIZE, LOG_FLUSH_INTERVAL, LOG_SOURCE};
use crate::runtime::OutputSink;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

// =============================================================================
// Buffer
// =============================================================================

/// Append-only fragment buffer shared by writers and the drain loop.
#[derive(Debug, Default)]
pub struct LogBuffer {
    fragments: Mutex<VecDeque<String>>,
}

impl LogBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one fragment.
    pub fn push(&self, fragment: &str) {
        if fragment.is_empty() {
            return;
        }
        let mut fragments = self.fragments.lock().unwrap_or_else(|e| e.into_inner());
        fragments.push_back(fragment.to_string());
    }

    /// Removes and returns every buffered fragment, oldest first.
    pub fn drain(&self) -> Vec<String> {
        let mut fragments = self.fragments.lock().unwrap_or_else(|e| e.into_inner());
        fragments.drain(..).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.fragments
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_empty()
    }
}

// =============================================================================
// Chunking
// =============================================================================

/// Largest char boundary at or below `index`.
fn floor_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// Length of the next chunk to cut from `pending`.
fn cut_point(pending: &str, max: usize) -> usize {
    let end = floor_char_boundary(pending, max);
    let cut = match pending[..end].rfind('\n') {
        Some(pos) => pos + 1,
        None => end,
    };
    if cut == 0 {
        // max is smaller than the first character
        pending.chars().next().map_or(0, char::len_utf8)
    } else {
        cut
    }
}

/// Regroups fragments into chunks of at most `max` bytes, preferring to
/// end each chunk on a newline.
pub fn chunked<I>(fragments: I, max: usize) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let max = max.max(1);
    let mut chunks = Vec::new();
    let mut pending = String::new();

    for fragment in fragments {
        pending.push_str(&fragment);
        while pending.contains('\n') || pending.len() > max {
            let cut = cut_point(&pending, max);
            let rest = pending.split_off(cut);
            chunks.push(std::mem::replace(&mut pending, rest));
        }
    }

    if !pending.is_empty() {
        chunks.push(pending);
    }
    chunks
}

// =============================================================================
// Shipper
// =============================================================================

struct Shared {
    buffer: LogBuffer,
    notify: Notify,
    closed: AtomicBool,
    service: Arc<dyn JobService>,
    job_id: String,
    source: String,
    chunk_size: usize,
}

impl Shared {
    async fn ship(&self, fragments: Vec<String>) {
        for text in chunked(fragments, self.chunk_size) {
            let chunk = LogChunk {
                text,
                source: self.source.clone(),
            };
            if let Err(e) = self.service.append_log(&self.job_id, &chunk).await {
                warn!("Failed to ship log chunk for {}: {}", self.job_id, e);
            }
        }
    }
}

async fn drain_loop(shared: Arc<Shared>) {
    loop {
        let closed = shared.closed.load(Ordering::Acquire);

        let fragments = shared.buffer.drain();
        if !fragments.is_empty() {
            shared.ship(fragments).await;
        }

        if closed {
            if shared.buffer.is_empty() {
                break;
            }
            continue;
        }

        let _ = tokio::time::timeout(LOG_FLUSH_INTERVAL, shared.notify.notified()).await;
    }
    debug!("Log shipper for {} drained", shared.job_id);
}

/// Background forwarder of console output to one job step.
pub struct LogShipper {
    shared: Arc<Shared>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl LogShipper {
    /// Starts the drain loop for `job_id` with the default chunk size and
    /// source label.
    pub fn spawn(service: Arc<dyn JobService>, job_id: impl Into<String>) -> Self {
        Self::spawn_with(service, job_id, LOG_SOURCE, LOG_CHUNK_SIZE)
    }

    /// Starts the drain loop with an explicit source label and chunk size.
    pub fn spawn_with(
        service: Arc<dyn JobService>,
        job_id: impl Into<String>,
        source: &str,
        chunk_size: usize,
    ) -> Self {
        let shared = Arc::new(Shared {
            buffer: LogBuffer::new(),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            service,
            job_id: job_id.into(),
            source: source.to_string(),
            chunk_size,
        });
        let task = tokio::spawn(drain_loop(Arc::clone(&shared)));
        Self {
            shared,
            task: tokio::sync::Mutex::new(Some(task)),
        }
    }

    /// Appends output and wakes the drain loop.
    pub fn push(&self, fragment: &str) {
        self.shared.buffer.push(fragment);
        self.shared.notify.notify_one();
    }

    /// Stops the drain loop after one final complete drain.
    ///
    /// Idempotent: later calls return once the first has finished.
    pub async fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.notify.notify_one();

        let mut task = self.task.lock().await;
        if let Some(handle) = task.take()
            && let Err(e) = handle.await
        {
            warn!("Log shipper task for {} failed: {}", self.shared.job_id, e);
        }
    }
}

impl OutputSink for LogShipper {
    fn write(&self, chunk: &str) {
        self.push(chunk);
    }
}

// =============================================================================
// Fan-out Sink
// =============================================================================

/// Sink writing every fragment to several sinks in order.
#[derive(Default, Clone)]
pub struct TeeSink {
    sinks: Vec<Arc<dyn OutputSink>>,
}

impl TeeSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a destination.
    pub fn with(mut self, sink: Arc<dyn OutputSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl OutputSink for TeeSink {
    fn write(&self, chunk: &str) {
        for sink in &self.sinks {
            sink.write(chunk);
        }
    }
}
