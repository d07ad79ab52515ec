//! Worker/manager runtime tests against `jobq-testing`'s in-memory backend.
//! Pure unit tests of the polling loop and manager facade live here,
//! backend-agnostic; backend-specific SQL behavior belongs to
//! `jobq-postgres`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use jobq_testing::FakeBackend;

use crate::job::{FetchOptions, Policy, QueueOptions, SendOptions};
use crate::manager::{Manager, ManagerConfig};
use crate::worker::{WorkerOptions, WorkerState};

fn test_manager() -> Manager {
    Manager::new(Arc::new(FakeBackend::new()), ManagerConfig::default())
}

/// A fetched job is claimed exclusively — two concurrent fetches on
/// the same queue never return the same row.
#[tokio::test]
async fn claim_is_exclusive_across_concurrent_fetches() {
    let manager = test_manager();
    manager
        .create_queue("exclusive", QueueOptions::default())
        .await
        .unwrap();
    for _ in 0..10 {
        manager
            .send("exclusive", serde_json::json!({}), SendOptions::default())
            .await
            .unwrap();
    }

    let (a, b) = tokio::join!(
        manager.fetch(
            "exclusive",
            FetchOptions {
                batch_size: 5,
                ..FetchOptions::default()
            }
        ),
        manager.fetch(
            "exclusive",
            FetchOptions {
                batch_size: 5,
                ..FetchOptions::default()
            }
        )
    );
    let a = a.unwrap();
    let b = b.unwrap();
    assert_eq!(a.len() + b.len(), 10);
    let a_ids: Vec<_> = a.iter().map(|j| j.id).collect();
    assert!(b.iter().all(|j| !a_ids.contains(&j.id)));
}

/// Completing an already-completed job is a no-op, not an error.
#[tokio::test]
async fn complete_is_idempotent() {
    let manager = test_manager();
    manager
        .create_queue("idempotent", QueueOptions::default())
        .await
        .unwrap();
    manager
        .send("idempotent", serde_json::json!({}), SendOptions::default())
        .await
        .unwrap();
    let batch = manager
        .fetch("idempotent", FetchOptions::default())
        .await
        .unwrap();
    let ids: Vec<_> = batch.iter().map(|j| j.id).collect();

    let first = manager.complete("idempotent", &ids, None).await.unwrap();
    assert_eq!(first.affected, 1);

    let second = manager.complete("idempotent", &ids, None).await.unwrap();
    assert_eq!(second.affected, 0, "completing twice affects nothing the second time");
}

/// `stop()` waits for every worker to reach `Stopped` before returning.
#[tokio::test]
async fn stop_waits_for_workers_to_settle() {
    let manager = test_manager();
    manager
        .create_queue("drain", QueueOptions::default())
        .await
        .unwrap();

    let handler: crate::worker::Handler = Arc::new(|_jobs| {
        Box::pin(async move {
            tokio::time::sleep(StdDuration::from_millis(20)).await;
            Ok(None)
        })
    });
    let id = manager
        .work(
            "drain",
            WorkerOptions {
                interval: StdDuration::from_millis(10),
                ..WorkerOptions::default()
            },
            handler,
        )
        .await
        .unwrap();

    manager.stop().await.unwrap();
    // `stop` removes the handle from the registry only after `join`
    // returns, so there is nothing left to notify.
    manager.notify_worker(id);
}

/// A handler that outlives the batch's `expire_in_seconds` deadline is
/// failed by the loop, not awaited indefinitely, and the loop keeps
/// polling afterward.
#[tokio::test]
async fn handler_exceeding_deadline_is_failed_not_awaited() {
    let manager = test_manager();
    manager
        .create_queue(
            "slow",
            QueueOptions {
                expire_in_seconds: Some(1),
                ..QueueOptions::default()
            },
        )
        .await
        .unwrap();
    let job_id = manager
        .send("slow", serde_json::json!({}), SendOptions::default())
        .await
        .unwrap()
        .unwrap();

    let completions = Arc::new(AtomicUsize::new(0));
    let completions_clone = completions.clone();
    let handler: crate::worker::Handler = Arc::new(move |_jobs| {
        let completions = completions_clone.clone();
        Box::pin(async move {
            tokio::time::sleep(StdDuration::from_secs(3)).await;
            completions.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        })
    });

    let worker_id = manager
        .work(
            "slow",
            WorkerOptions {
                interval: StdDuration::from_millis(10),
                ..WorkerOptions::default()
            },
            handler,
        )
        .await
        .unwrap();

    tokio::time::sleep(StdDuration::from_millis(1200)).await;
    let job = manager.get_job_by_id("slow", job_id, false).await.unwrap().unwrap();
    assert_eq!(job.state, crate::job::JobState::Failed);
    assert_eq!(
        completions.load(Ordering::SeqCst),
        0,
        "handler had not finished yet when the deadline fired"
    );

    manager.off_work(crate::manager::OffWorkSelector::Id(worker_id)).await.unwrap();
}

#[tokio::test]
async fn off_work_transitions_worker_to_stopped() {
    let manager = test_manager();
    manager
        .create_queue("quiet", QueueOptions::default())
        .await
        .unwrap();
    let handler: crate::worker::Handler = Arc::new(|_jobs| Box::pin(async move { Ok(None) }));
    let id = manager
        .work(
            "quiet",
            WorkerOptions {
                interval: StdDuration::from_millis(10),
                ..WorkerOptions::default()
            },
            handler,
        )
        .await
        .unwrap();
    tokio::time::sleep(StdDuration::from_millis(30)).await;
    manager
        .off_work(crate::manager::OffWorkSelector::Id(id))
        .await
        .unwrap();
    // The worker handle is removed from the registry by `off_work`, so a
    // notify against the now-stale id is simply a no-op rather than a panic.
    manager.notify_worker(id);
}

#[tokio::test]
async fn archive_sweep_moves_old_terminal_jobs_out_of_live_queue() {
    let backend = Arc::new(FakeBackend::new());
    let manager = Manager::new(backend.clone(), ManagerConfig::default());
    manager
        .create_queue("sweep", QueueOptions::default())
        .await
        .unwrap();
    let id = manager
        .send("sweep", serde_json::json!({}), SendOptions::default())
        .await
        .unwrap()
        .unwrap();
    manager.fetch("sweep", FetchOptions::default()).await.unwrap();
    manager.complete("sweep", &[id], None).await.unwrap();

    let archived = backend
        .archive_terminal_jobs("sweep", chrono::Utc::now() + chrono::Duration::days(30))
        .await
        .unwrap();
    assert_eq!(archived, 1);
    let live = manager.get_job_by_id("sweep", id, false).await.unwrap();
    assert!(live.is_none());
    let in_archive = manager.get_job_by_id("sweep", id, true).await.unwrap();
    assert!(in_archive.is_some());
}

/// A batch fetch can't activate a second job on a `Singleton` queue while
/// one is already active, even when `batch_size` asks for more than one —
/// the claim collides the same way it would against a real unique index.
#[tokio::test]
async fn singleton_queue_batch_fetch_admits_only_one_active_job() {
    let manager = test_manager();
    manager
        .create_queue(
            "report-build",
            QueueOptions {
                policy: Policy::Singleton,
                ..QueueOptions::default()
            },
        )
        .await
        .unwrap();

    manager
        .send("report-build", serde_json::json!({}), SendOptions::default())
        .await
        .unwrap();
    let claimed = manager.fetch("report-build", FetchOptions::default()).await.unwrap();
    assert_eq!(claimed.len(), 1);

    manager
        .send("report-build", serde_json::json!({}), SendOptions::default())
        .await
        .unwrap();
    let second = manager
        .fetch(
            "report-build",
            FetchOptions {
                batch_size: 2,
                ..FetchOptions::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(
        second.len(),
        0,
        "a second job cannot become active while one is already active"
    );
}

#[tokio::test]
async fn wip_snapshot_reports_in_flight_batch() {
    let manager = test_manager();
    manager
        .create_queue("wip", QueueOptions::default())
        .await
        .unwrap();
    manager
        .send("wip", serde_json::json!({}), SendOptions::default())
        .await
        .unwrap();

    let mut tap = manager.subscribe_events();
    let handler: crate::worker::Handler = Arc::new(|_jobs| {
        Box::pin(async move {
            tokio::time::sleep(StdDuration::from_millis(100)).await;
            Ok(None)
        })
    });
    let id = manager
        .work(
            "wip",
            WorkerOptions {
                interval: StdDuration::from_millis(10),
                ..WorkerOptions::default()
            },
            handler,
        )
        .await
        .unwrap();

    let saw_wip = tokio::time::timeout(StdDuration::from_secs(1), async {
        loop {
            if let Some(crate::pubsub::Event::Wip(snapshots)) = tap.recv().await {
                if snapshots.iter().any(|s| s.name == "wip" && s.count > 0) {
                    return true;
                }
            }
        }
    })
    .await
    .unwrap_or(false);
    assert!(saw_wip, "expected a wip event reporting an in-flight job");

    manager
        .off_work(crate::manager::OffWorkSelector::Id(id))
        .await
        .unwrap();
}
