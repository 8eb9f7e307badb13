//! Tests for the remote job service client.
//!
//! Covers the retry contract, HTTP status mapping and the wire formats of
//! the descriptors.

use changes_lxc::api::{RequestFailure, RetryPolicy, with_retry};
use changes_lxc::{ChangesClient, Error, JobService, JobStep, SnapshotRecord};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::Instant;

// =============================================================================
// Retry Tests
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_retry_succeeds_on_nth_attempt_with_growing_delays() {
    let attempts = AtomicU32::new(0);
    let mut started = Vec::new();
    let policy = RetryPolicy::default();

    let result: changes_lxc::Result<&str> = with_retry(&policy, "/jobsteps/abc/", || {
        started.push(Instant::now());
        let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
        async move {
            if n < 4 {
                Err(RequestFailure::Status(502))
            } else {
                Ok("ok")
            }
        }
    })
    .await;

    assert_eq!(result.unwrap(), "ok");
    assert_eq!(attempts.load(Ordering::SeqCst), 4);

    let gaps: Vec<Duration> = started.windows(2).map(|w| w[1] - w[0]).collect();
    assert_eq!(
        gaps,
        vec![
            Duration::from_secs(1),
            Duration::from_secs(4),
            Duration::from_secs(9)
        ]
    );
    assert!(gaps.windows(2).all(|w| w[0] < w[1]), "delays must grow");
}

#[tokio::test(start_paused = true)]
async fn test_not_found_is_never_retried() {
    let attempts = AtomicU32::new(0);
    let result: changes_lxc::Result<()> =
        with_retry(&RetryPolicy::default(), "/jobsteps/missing/", || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(RequestFailure::Status(404)) }
        })
        .await;

    assert!(matches!(result, Err(Error::NotFound { ref path }) if path == "/jobsteps/missing/"));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_gone_means_build_cancelled() {
    let attempts = AtomicU32::new(0);
    let result: changes_lxc::Result<()> =
        with_retry(&RetryPolicy::default(), "/jobsteps/gone/", || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(RequestFailure::Status(410)) }
        })
        .await;

    assert!(matches!(result, Err(Error::BuildCancelled)));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_exhaust_attempts() {
    let attempts = AtomicU32::new(0);
    let start = Instant::now();
    let result: changes_lxc::Result<()> =
        with_retry(&RetryPolicy::default(), "/snapshots/", || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(RequestFailure::Transport("connection refused".to_string())) }
        })
        .await;

    match result {
        Err(Error::ApiRequestFailed {
            attempts: reported,
            reason,
            ..
        }) => {
            assert_eq!(reported, 5);
            assert!(reason.contains("connection refused"));
        }
        other => panic!("expected ApiRequestFailed, got {:?}", other),
    }
    assert_eq!(attempts.load(Ordering::SeqCst), 5);
    // 1 + 4 + 9 + 16
    assert_eq!(start.elapsed(), Duration::from_secs(30));
}

#[tokio::test(start_paused = true)]
async fn test_no_retry_policy() {
    let attempts = AtomicU32::new(0);
    let result: changes_lxc::Result<()> = with_retry(&RetryPolicy::no_retry(), "/x/", || {
        attempts.fetch_add(1, Ordering::SeqCst);
        async { Err(RequestFailure::Status(500)) }
    })
    .await;

    assert!(result.unwrap_err().is_retryable());
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}

// =============================================================================
// HTTP Status Tests
// =============================================================================

/// Answers one request with `status` and returns the request head.
async fn serve_once(status: &'static str) -> (SocketAddr, JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut head = Vec::new();
        let mut buf = [0u8; 1024];
        while !head.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = socket.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            head.extend_from_slice(&buf[..n]);
        }
        let response = format!(
            "HTTP/1.1 {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
            status
        );
        socket.write_all(response.as_bytes()).await.unwrap();
        socket.shutdown().await.unwrap();
        String::from_utf8_lossy(&head).into_owned()
    });
    (addr, server)
}

#[tokio::test]
async fn test_http_404_is_not_found() {
    let (addr, server) = serve_once("404 Not Found").await;
    let client = ChangesClient::new(&format!("http://{}/api/0/", addr)).unwrap();

    let err = client.get_job_step("step-1").await.unwrap_err();

    assert!(matches!(err, Error::NotFound { ref path } if path == "/jobsteps/step-1/"));
    let head = server.await.unwrap();
    assert!(head.starts_with("GET /api/0/jobsteps/step-1/ HTTP/1.1\r\n"), "{}", head);
}

#[tokio::test]
async fn test_http_410_is_build_cancelled() {
    let (addr, server) = serve_once("410 Gone").await;
    let client = ChangesClient::new(&format!("http://{}/api/0", addr)).unwrap();

    let err = client.get_job_step("step-1").await.unwrap_err();

    assert!(err.is_cancellation());
    assert!(!err.is_retryable());
    let head = server.await.unwrap();
    assert!(head.starts_with("GET /api/0/jobsteps/step-1/ HTTP/1.1\r\n"), "{}", head);
}

// =============================================================================
// Wire Format Tests
// =============================================================================

#[test]
fn test_job_step_descriptor() {
    let body = r#"{
        "id": "5c3f5a5e-0000-4000-8000-000000000001",
        "status": {"id": "in_progress", "name": "In progress"},
        "data": {"release": "trusty", "cpus": 4},
        "expectedSnapshot": {"id": "311a862b-dd15-4c44-90f1-fa95a7621860"},
        "snapshot": null
    }"#;

    let step: JobStep = serde_json::from_str(body).unwrap();
    assert!(!step.status.is_finished());
    assert_eq!(step.data.release.as_deref(), Some("trusty"));
    assert_eq!(
        step.expected_snapshot.unwrap().id,
        "311a862b-dd15-4c44-90f1-fa95a7621860"
    );
    assert!(step.snapshot.is_none());
}

#[test]
fn test_job_step_minimal_descriptor() {
    let step: JobStep = serde_json::from_str(r#"{"status": {"id": "finished"}}"#).unwrap();
    assert!(step.status.is_finished());
    assert!(step.data.release.is_none());
    assert!(step.expected_snapshot.is_none());
}

#[test]
fn test_snapshot_catalog_entry() {
    let body = r#"[{
        "id": "c9d2d1e0-7a1b-4b4e-9a51-6f1f3d1f2a10",
        "project": {"id": "0b5b2a3c-2f1e-4c9a-8e7d-1a2b3c4d5e6f", "slug": "server"},
        "dateCreated": "2014-06-24T18:49:18.123456",
        "isActive": true,
        "images": [{"id": "311a862b-dd15-4c44-90f1-fa95a7621860", "status": "active"}]
    }]"#;

    let records: Vec<SnapshotRecord> = serde_json::from_str(body).unwrap();
    assert_eq!(records.len(), 1);
    assert!(records[0].is_active);
    assert_eq!(records[0].images.len(), 1);
    assert_eq!(
        records[0].images[0].id.to_string(),
        "311a862b-dd15-4c44-90f1-fa95a7621860"
    );
}
