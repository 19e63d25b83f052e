mod common;

use common::harness;
use task_queue_core::{TaskError, TaskSpec, TaskStatus};

fn spec() -> TaskSpec {
    TaskSpec::new("echo", Vec::new())
}

#[tokio::test]
async fn test_cancel_pending_removes_from_queue() {
    let h = harness();
    let id = h.engine.submit(spec()).await.unwrap();

    let cancelled = h.engine.cancel(id).await.unwrap();
    assert_eq!(cancelled.status, TaskStatus::Cancelled);
    assert_eq!(h.engine.queue_stats("default").ready_count, 0);
    assert_eq!(
        h.engine.request_task("w1", &[], &[]).await,
        Err(TaskError::NoEligibleTask)
    );
}

#[tokio::test]
async fn test_cancel_running_rejects_worker_reports() {
    let h = harness();
    let id = h.engine.submit(spec()).await.unwrap();
    h.engine.request_task("w1", &[], &[]).await.unwrap();

    h.engine.cancel(id).await.unwrap();

    assert_eq!(
        h.engine.renew_lease(id, "w1").await,
        Err(TaskError::TaskCancelled(id))
    );
    assert_eq!(
        h.engine.report_success(id, "w1", Vec::new()).await,
        Err(TaskError::TaskCancelled(id))
    );
    assert_eq!(h.engine.get(id).await.unwrap().status, TaskStatus::Cancelled);

    // The worker is free for new work
    let next = h.engine.submit(spec()).await.unwrap();
    assert_eq!(h.engine.request_task("w1", &[], &[]).await.unwrap().id, next);
}

#[tokio::test]
async fn test_cancel_retrying_task() {
    let h = harness();
    let id = h.engine.submit(spec()).await.unwrap();
    h.engine.request_task("w1", &[], &[]).await.unwrap();
    h.engine.report_failure(id, "w1", "boom").await.unwrap();

    h.engine.cancel(id).await.unwrap();
    assert_eq!(h.engine.queue_stats("default").scheduled_count, 0);

    h.advance_ms(60_000);
    assert_eq!(h.engine.promote_due().await, 0);
    assert_eq!(h.engine.get(id).await.unwrap().status, TaskStatus::Cancelled);
}

#[tokio::test]
async fn test_cancel_terminal_task_is_invalid() {
    let h = harness();
    let id = h.engine.submit(spec()).await.unwrap();
    h.engine.request_task("w1", &[], &[]).await.unwrap();
    h.engine.report_success(id, "w1", Vec::new()).await.unwrap();

    assert!(matches!(
        h.engine.cancel(id).await,
        Err(TaskError::InvalidTransition {
            from: TaskStatus::Completed,
            to: TaskStatus::Cancelled,
            ..
        })
    ));
    assert!(matches!(
        h.engine.cancel(uuid::Uuid::new_v4()).await,
        Err(TaskError::NotFound(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_racing_completion_has_one_winner() {
    for _ in 0..20 {
        let h = harness();
        let id = h.engine.submit(spec()).await.unwrap();
        h.engine.request_task("w1", &[], &[]).await.unwrap();

        let engine = h.engine.clone();
        let report = tokio::spawn(async move { engine.report_success(id, "w1", Vec::new()).await });
        let engine = h.engine.clone();
        let cancel = tokio::spawn(async move { engine.cancel(id).await });

        let report = report.await.unwrap();
        let cancel = cancel.await.unwrap();
        let stored = h.engine.get(id).await.unwrap();

        match stored.status {
            TaskStatus::Completed => {
                assert!(report.is_ok());
                assert!(matches!(cancel, Err(TaskError::InvalidTransition { .. })));
            }
            TaskStatus::Cancelled => {
                assert!(cancel.is_ok());
                assert_eq!(report, Err(TaskError::TaskCancelled(id)));
            }
            other => panic!("unexpected final status {}", other),
        }

        // Exactly one terminal event
        let terminal = h
            .events
            .statuses_of(id)
            .into_iter()
            .filter(|s| s.is_terminal())
            .count();
        assert_eq!(terminal, 1);
    }
}

#[tokio::test]
async fn test_purge_cancels_waiting_tasks_only() {
    let h = harness();
    let running = h.engine.submit(spec()).await.unwrap();
    h.engine.request_task("w1", &[], &[]).await.unwrap();

    let retrying = h.engine.submit(spec()).await.unwrap();
    h.engine.request_task("w2", &[], &[]).await.unwrap();
    h.engine.report_failure(retrying, "w2", "boom").await.unwrap();

    let waiting = h.engine.submit(spec()).await.unwrap();
    let later = h
        .engine
        .submit(spec().scheduled_at(h.now() + chrono::Duration::minutes(5)))
        .await
        .unwrap();
    let other_queue = h.engine.submit(spec().queue("other")).await.unwrap();

    let purged = h.engine.purge_queue("default").await.unwrap();
    assert_eq!(purged, 3);

    for id in [retrying, waiting, later] {
        assert_eq!(h.engine.get(id).await.unwrap().status, TaskStatus::Cancelled);
    }
    assert_eq!(h.engine.get(running).await.unwrap().status, TaskStatus::Running);
    assert_eq!(h.engine.get(other_queue).await.unwrap().status, TaskStatus::Pending);

    let stats = h.engine.queue_stats("default");
    assert_eq!((stats.ready_count, stats.scheduled_count), (0, 0));
    assert_eq!(stats.running_count, 1);
}
