//! Tests for the log shipper.

mod common;

use changes_lxc::constants::LOG_SOURCE;
use changes_lxc::{LogShipper, OutputSink, TeeSink};
use common::{CaptureSink, FakeJobService};
use std::sync::Arc;
use std::sync::atomic::Ordering;

#[tokio::test]
async fn test_fragments_regrouped_on_newlines() {
    let service = Arc::new(FakeJobService::new());
    let shipper = LogShipper::spawn(service.clone(), "step-1");

    shipper.push("hello ");
    shipper.push("world\n");
    shipper.push("foo bar");
    shipper.close().await;

    let logs = service.logs.lock().unwrap().clone();
    let texts: Vec<&str> = logs.iter().map(|c| c.text.as_str()).collect();
    assert_eq!(texts, vec!["hello world\n", "foo bar"]);
    assert!(logs.iter().all(|c| c.source == LOG_SOURCE));
}

#[tokio::test]
async fn test_close_ships_everything_in_order() {
    let service = Arc::new(FakeJobService::new());
    let shipper = LogShipper::spawn_with(service.clone(), "step-1", "console", 16);

    let mut expected = String::new();
    for i in 0..50 {
        let line = format!("line {}\n", i);
        expected.push_str(&line);
        shipper.push(&line);
        if i % 7 == 0 {
            tokio::task::yield_now().await;
        }
    }
    shipper.close().await;

    assert_eq!(service.log_text(), expected);
    assert!(
        service
            .logs
            .lock()
            .unwrap()
            .iter()
            .all(|c| c.text.len() <= 16)
    );
}

#[tokio::test]
async fn test_close_twice_is_harmless() {
    let service = Arc::new(FakeJobService::new());
    let shipper = LogShipper::spawn(service.clone(), "step-1");

    shipper.push("only once\n");
    shipper.close().await;
    shipper.close().await;

    assert_eq!(service.logs.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_close_without_output_ships_nothing() {
    let service = Arc::new(FakeJobService::new());
    let shipper = LogShipper::spawn(service.clone(), "step-1");
    shipper.close().await;

    assert!(service.logs.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_ship_failures_do_not_stop_the_loop() {
    let service = Arc::new(FakeJobService::new());
    service.fail_logs.store(true, Ordering::SeqCst);
    let shipper = LogShipper::spawn(service.clone(), "step-1");

    shipper.push("lost\n");
    tokio::task::yield_now().await;
    tokio::task::yield_now().await;

    service.fail_logs.store(false, Ordering::SeqCst);
    shipper.push("kept\n");
    shipper.close().await;

    assert!(service.log_text().ends_with("kept\n"));
}

#[tokio::test]
async fn test_tee_sink_writes_to_every_destination() {
    let service = Arc::new(FakeJobService::new());
    let shipper = Arc::new(LogShipper::spawn(service.clone(), "step-1"));
    let local = Arc::new(CaptureSink::default());

    let tee = TeeSink::new()
        .with(local.clone())
        .with(shipper.clone() as Arc<dyn OutputSink>);
    tee.status("Starting container");
    tee.write("build output\n");
    shipper.close().await;

    let expected = "==> Starting container\nbuild output\n";
    assert_eq!(local.text(), expected);
    assert_eq!(service.log_text(), expected);
}
