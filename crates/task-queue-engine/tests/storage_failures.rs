mod common;

use common::harness;
use task_queue_core::{TaskError, TaskSpec, TaskStatus};

fn spec() -> TaskSpec {
    TaskSpec::new("echo", Vec::new())
}

#[tokio::test]
async fn test_transient_write_failures_are_retried() {
    // Three attempts per call, two failures absorbed
    let h = harness();
    let id = h.engine.submit(spec()).await.unwrap();

    h.storage.fail_updates(2);
    let task = h.engine.request_task("w1", &[], &[]).await.unwrap();
    assert_eq!(task.id, id);
    assert_eq!(h.engine.get(id).await.unwrap().status, TaskStatus::Running);
}

#[tokio::test]
async fn test_dispatch_rolls_back_when_storage_is_down() {
    let h = harness();
    let id = h.engine.submit(spec()).await.unwrap();

    h.storage.fail_updates(3);
    assert!(matches!(
        h.engine.request_task("w1", &[], &[]).await,
        Err(TaskError::StorageUnavailable(_))
    ));

    // Nothing half-applied: no lease, still queued, still pending
    assert_eq!(h.engine.queue_stats("default").ready_count, 1);
    assert_eq!(h.engine.queue_stats("default").running_count, 0);
    assert_eq!(h.engine.get(id).await.unwrap().status, TaskStatus::Pending);
    assert!(h.engine.get_worker("w1").unwrap().leased_task.is_none());

    let task = h.engine.request_task("w1", &[], &[]).await.unwrap();
    assert_eq!(task.id, id);
}

#[tokio::test]
async fn test_report_keeps_lease_when_storage_is_down() {
    let h = harness();
    let id = h.engine.submit(spec()).await.unwrap();
    h.engine.request_task("w1", &[], &[]).await.unwrap();

    h.storage.set_down(true);
    assert!(matches!(
        h.engine.report_success(id, "w1", b"ok".to_vec()).await,
        Err(TaskError::StorageUnavailable(_))
    ));

    h.storage.set_down(false);
    assert_eq!(h.engine.queue_stats("default").running_count, 1);
    let done = h
        .engine
        .report_success(id, "w1", b"ok".to_vec())
        .await
        .unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
}

#[tokio::test]
async fn test_submit_fails_cleanly_when_storage_is_down() {
    let h = harness();
    h.storage.set_down(true);

    assert!(matches!(
        h.engine.submit(spec()).await,
        Err(TaskError::StorageUnavailable(_))
    ));
    assert_eq!(h.engine.queue_stats("default").ready_count, 0);
    assert!(h.events.events().is_empty());
}

#[tokio::test]
async fn test_cancel_reports_storage_failure() {
    let h = harness();
    let id = h.engine.submit(spec()).await.unwrap();
    h.engine.request_task("w1", &[], &[]).await.unwrap();

    h.storage.fail_updates(3);
    assert!(matches!(
        h.engine.cancel(id).await,
        Err(TaskError::StorageUnavailable(_))
    ));

    // The worker still owns the attempt
    assert!(h.engine.renew_lease(id, "w1").await.is_ok());
    assert!(h.engine.report_success(id, "w1", Vec::new()).await.is_ok());
}

#[tokio::test]
async fn test_sweep_retries_reclaim_after_outage() {
    let h = harness();
    let id = h
        .engine
        .submit(spec().timeout(std::time::Duration::from_secs(5)))
        .await
        .unwrap();
    h.engine.request_task("w1", &[], &[]).await.unwrap();

    h.advance_ms(5_000);
    h.storage.set_down(true);
    assert_eq!(h.engine.sweep_expired().await, 0);

    h.storage.set_down(false);
    assert_eq!(h.engine.sweep_expired().await, 1);
    assert_eq!(h.engine.get(id).await.unwrap().status, TaskStatus::Retrying);
}
