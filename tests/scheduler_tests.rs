mod common;

use common::{FlakyStore, RecordingNotifier, ScriptedProber};
use portwatch_rs::scheduler::{RunnerState, SchedulerError, SchedulerManager, TriggerOutcome};
use portwatch_rs::store::{InMemoryStore, JobStore, StoreError};
use portwatch_rs::types::{NewJob, ScanQuery};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

const SECOND: Duration = Duration::from_secs(1);

fn secs(n: u64) -> Duration {
    Duration::from_secs(n)
}

async fn scan_ports(store: &dyn JobStore) -> Vec<u16> {
    let q = ScanQuery {
        limit: 10_000,
        ..ScanQuery::default()
    };
    store
        .list_scans(&q)
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.port)
        .collect()
}

#[tokio::test(start_paused = true)]
async fn active_job_sweeps_immediately_then_every_interval() {
    let store = Arc::new(InMemoryStore::new());
    let prober = ScriptedProber::new(Duration::ZERO);
    let manager = SchedulerManager::new(store.clone(), prober.clone());

    let id = manager
        .create_job("127.0.0.1", 8000, 8002, secs(5), true)
        .await
        .unwrap();

    sleep(SECOND).await;
    let first: BTreeSet<u16> = scan_ports(store.as_ref()).await.into_iter().collect();
    assert_eq!(first, BTreeSet::from([8000, 8001, 8002]));
    assert_eq!(store.scan_count().await, 3);

    sleep(secs(5)).await;
    assert_eq!(store.scan_count().await, 6);
    assert_eq!(prober.calls(), 2);

    assert_eq!(manager.live_runner_ids().await, vec![id]);
    manager.stop_all().await;
}

#[tokio::test(start_paused = true)]
async fn slow_sweep_causes_ticks_to_be_skipped() {
    let store = Arc::new(InMemoryStore::new());
    let prober = ScriptedProber::new(secs(12));
    let manager = SchedulerManager::new(store.clone(), prober.clone());

    let id = manager
        .create_job("10.0.0.1", 1, 4, secs(5), true)
        .await
        .unwrap();

    // ticks at 5s and 10s land while the first sweep is still running
    sleep(secs(11)).await;
    assert_eq!(prober.calls(), 1);
    assert_eq!(manager.runner_state(id).await, Some(RunnerState::Executing));
    assert_eq!(manager.trigger_job(id).await.unwrap(), TriggerOutcome::Skipped);

    // first sweep ends at 12s, the 15s tick starts the second
    sleep(secs(5)).await;
    assert_eq!(prober.calls(), 2);
    assert_eq!(prober.max_in_flight(), 1);
    assert_eq!(store.scan_count().await, 4);

    manager.stop_all().await;
    assert_eq!(store.scan_count().await, 8);
}

#[tokio::test(start_paused = true)]
async fn manual_trigger_runs_between_ticks() {
    let store = Arc::new(InMemoryStore::new());
    let prober = ScriptedProber::new(Duration::ZERO);
    let manager = SchedulerManager::new(store.clone(), prober.clone());

    let id = manager
        .create_job("10.0.0.2", 22, 22, secs(60), true)
        .await
        .unwrap();
    sleep(SECOND).await;
    assert_eq!(manager.runner_state(id).await, Some(RunnerState::Running));

    assert_eq!(manager.trigger_job(id).await.unwrap(), TriggerOutcome::Started);
    sleep(SECOND).await;
    assert_eq!(prober.calls(), 2);

    manager.stop_job(id).await.unwrap();
    assert!(matches!(
        manager.trigger_job(id).await,
        Err(SchedulerError::NotRunning(_))
    ));
    manager.stop_all().await;
}

#[tokio::test(start_paused = true)]
async fn stop_job_is_idempotent() {
    let store = Arc::new(InMemoryStore::new());
    let manager = SchedulerManager::new(store.clone(), ScriptedProber::new(Duration::ZERO));

    let id = manager
        .create_job("10.0.0.3", 80, 81, secs(30), true)
        .await
        .unwrap();
    sleep(SECOND).await;

    manager.stop_job(id).await.unwrap();
    manager.stop_job(id).await.unwrap();
    assert!(!store.select_job_by_id(id).await.unwrap().active);
    assert!(manager.live_runner_ids().await.is_empty());

    let idle = manager
        .create_job("10.0.0.4", 80, 81, secs(30), false)
        .await
        .unwrap();
    manager.stop_job(idle).await.unwrap();
    assert!(!store.select_job_by_id(idle).await.unwrap().active);

    // the store itself reports unknown ids
    assert!(matches!(
        manager.stop_job(9_999).await,
        Err(SchedulerError::Store(StoreError::NotFound(_)))
    ));
    manager.stop_all().await;
}

#[tokio::test(start_paused = true)]
async fn stopping_between_ticks_ends_the_loop_promptly() {
    let store = Arc::new(InMemoryStore::new());
    let prober = ScriptedProber::new(Duration::ZERO);
    let manager = SchedulerManager::new(store.clone(), prober.clone());

    let id = manager
        .create_job("10.0.0.5", 80, 80, secs(3600), true)
        .await
        .unwrap();
    sleep(SECOND).await;
    assert_eq!(manager.outstanding_tasks(), 1);

    manager.stop_job(id).await.unwrap();
    sleep(Duration::from_millis(10)).await;
    assert_eq!(manager.outstanding_tasks(), 0);
    assert_eq!(prober.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn stop_lets_in_flight_sweep_finish() {
    let store = Arc::new(InMemoryStore::new());
    let prober = ScriptedProber::new(secs(10));
    let manager = SchedulerManager::new(store.clone(), prober.clone());

    let id = manager
        .create_job("10.0.0.6", 1, 3, secs(5), true)
        .await
        .unwrap();
    sleep(SECOND).await;
    manager.stop_job(id).await.unwrap();
    assert_eq!(store.scan_count().await, 0);

    sleep(secs(10)).await;
    assert_eq!(store.scan_count().await, 3);
    assert_eq!(prober.calls(), 1);
    assert_eq!(manager.outstanding_tasks(), 0);
}

#[tokio::test(start_paused = true)]
async fn start_on_active_job_fails_without_store_mutation() {
    let store = FlakyStore::new();
    let manager = SchedulerManager::new(store.clone(), ScriptedProber::new(Duration::ZERO));

    let id = manager
        .create_job("10.0.0.7", 80, 80, secs(30), true)
        .await
        .unwrap();
    let before = store.set_active_calls();

    let err = manager.start_job_by_id(id).await.unwrap_err();
    assert!(matches!(err, SchedulerError::AlreadyActive(x) if x == id));
    assert_eq!(store.set_active_calls(), before);
    assert_eq!(manager.live_runner_ids().await, vec![id]);
    manager.stop_all().await;
}

#[tokio::test(start_paused = true)]
async fn start_by_id_activates_and_sweeps() {
    let store = Arc::new(InMemoryStore::new());
    let prober = ScriptedProber::new(Duration::ZERO);
    let manager = SchedulerManager::new(store.clone(), prober.clone());

    let id = manager
        .create_job("10.0.0.8", 100, 109, secs(30), false)
        .await
        .unwrap();
    sleep(SECOND).await;
    assert_eq!(prober.calls(), 0);
    assert!(manager.runner_state(id).await.is_none());

    manager.start_job_by_id(id).await.unwrap();
    sleep(SECOND).await;
    assert!(store.select_job_by_id(id).await.unwrap().active);
    assert_eq!(store.scan_count().await, 10);

    assert!(matches!(
        manager.start_job_by_id(424_242).await,
        Err(SchedulerError::Store(StoreError::NotFound(_)))
    ));
    manager.stop_all().await;
}

#[tokio::test(start_paused = true)]
async fn stop_all_leaves_no_tasks_behind() {
    let store = Arc::new(InMemoryStore::new());
    let prober = ScriptedProber::new(secs(3));
    let manager = SchedulerManager::new(store.clone(), prober.clone());

    for i in 0..3u16 {
        manager
            .create_job(format!("10.1.0.{i}"), 1000, 1001, secs(2), true)
            .await
            .unwrap();
    }
    sleep(SECOND).await;
    assert!(manager.outstanding_tasks() >= 3);

    manager.stop_all().await;
    assert_eq!(manager.outstanding_tasks(), 0);
    assert!(manager.live_runner_ids().await.is_empty());
    // sweeps in flight at shutdown still persisted their rows
    assert_eq!(store.scan_count().await, 6);
}

#[tokio::test(start_paused = true)]
async fn runner_start_failure_leaves_job_active_without_runner() {
    let store = Arc::new(InMemoryStore::new());
    let manager = SchedulerManager::new(store.clone(), ScriptedProber::new(Duration::ZERO));
    manager.stop_all().await;

    let id = manager
        .create_job("10.0.0.9", 80, 80, secs(30), true)
        .await
        .expect("runner failures are not returned from create_job");
    assert!(store.select_job_by_id(id).await.unwrap().active);
    assert!(manager.live_runner_ids().await.is_empty());

    let idle = manager
        .create_job("10.0.0.10", 80, 80, secs(30), false)
        .await
        .unwrap();
    assert!(matches!(
        manager.start_job_by_id(idle).await,
        Err(SchedulerError::ShuttingDown)
    ));
    // the store update happened before the runner start
    assert!(store.select_job_by_id(idle).await.unwrap().active);
}

#[tokio::test(start_paused = true)]
async fn load_and_start_all_starts_only_active_rows() {
    let store = Arc::new(InMemoryStore::new());
    let mk = |target: &str, active| NewJob {
        target: target.into(),
        start_port: 1,
        end_port: 2,
        interval_seconds: 10,
        active,
    };
    let a = store.insert_job(mk("a", true)).await.unwrap();
    store.insert_job(mk("b", false)).await.unwrap();
    let c = store.insert_job(mk("c", true)).await.unwrap();

    let prober = ScriptedProber::new(Duration::ZERO);
    let manager = SchedulerManager::new(store.clone(), prober.clone());
    assert_eq!(manager.load_and_start_all().await.unwrap(), 2);
    assert_eq!(manager.live_runner_ids().await, vec![a.id, c.id]);

    // already-running rows are skipped, not fatal
    assert_eq!(manager.load_and_start_all().await.unwrap(), 0);

    sleep(SECOND).await;
    assert_eq!(prober.calls(), 2);
    manager.stop_all().await;
}

#[tokio::test]
async fn load_and_start_all_with_no_active_rows_is_ok() {
    let manager = SchedulerManager::new(
        Arc::new(InMemoryStore::new()),
        ScriptedProber::new(Duration::ZERO),
    );
    assert_eq!(manager.load_and_start_all().await.unwrap(), 0);
    manager.stop_all().await;
}

#[tokio::test(start_paused = true)]
async fn delete_job_stops_runner_and_removes_row() {
    let store = Arc::new(InMemoryStore::new());
    let manager = SchedulerManager::new(store.clone(), ScriptedProber::new(Duration::ZERO));

    let id = manager
        .create_job("10.0.0.11", 80, 80, secs(30), true)
        .await
        .unwrap();
    manager.delete_job(id).await.unwrap();
    assert!(manager.live_runner_ids().await.is_empty());
    assert!(manager.list_jobs().await.unwrap().is_empty());

    assert!(matches!(
        manager.delete_job(id).await,
        Err(SchedulerError::Store(StoreError::NotFound(_)))
    ));
    manager.stop_all().await;
}

#[tokio::test]
async fn create_job_rejects_invalid_fields() {
    let store = Arc::new(InMemoryStore::new());
    let manager = SchedulerManager::new(store.clone(), ScriptedProber::new(Duration::ZERO));

    for (target, start, end, interval) in [
        ("", 1, 2, secs(5)),
        ("h", 0, 2, secs(5)),
        ("h", 1, 0, secs(5)),
        ("h", 5, 2, secs(5)),
        ("h", 1, 2, Duration::ZERO),
    ] {
        let err = manager
            .create_job(target, start, end, interval, true)
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::Validation(_)), "{err}");
    }
    assert!(manager.list_jobs().await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn failed_batch_falls_back_to_row_writes() {
    let store = FlakyStore::failing_batches(Some(8001));
    let notifier = Arc::new(RecordingNotifier::default());
    let manager = SchedulerManager::new(store.clone(), ScriptedProber::new(Duration::ZERO))
        .with_notifier(notifier.clone());

    manager
        .create_job("127.0.0.1", 8000, 8003, secs(30), true)
        .await
        .unwrap();
    sleep(SECOND).await;

    let ports: BTreeSet<u16> = scan_ports(&store.inner).await.into_iter().collect();
    assert_eq!(ports, BTreeSet::from([8000, 8002, 8003]));
    assert_eq!(
        *notifier.failures.lock().unwrap(),
        vec!["127.0.0.1".to_string()]
    );
    manager.stop_all().await;
}

#[tokio::test(start_paused = true)]
async fn subscribers_receive_completed_sweeps() {
    let manager = SchedulerManager::new(
        Arc::new(InMemoryStore::new()),
        ScriptedProber::new(Duration::ZERO),
    );
    let mut events = manager.subscribe();

    let id = manager
        .create_job("127.0.0.1", 8000, 8002, secs(5), true)
        .await
        .unwrap();
    let ev = events.recv().await.unwrap();
    assert_eq!(ev.job_id, Some(id));
    assert_eq!(ev.target, "127.0.0.1");
    assert_eq!(ev.results.len(), 3);
    manager.stop_all().await;
}

#[tokio::test(start_paused = true)]
async fn list_jobs_does_not_reflect_runner_state() {
    let store = Arc::new(InMemoryStore::new());
    let manager = SchedulerManager::new(store.clone(), ScriptedProber::new(Duration::ZERO));
    manager.stop_all().await;

    manager
        .create_job("10.0.0.12", 80, 80, secs(30), true)
        .await
        .unwrap();
    let jobs = manager.list_jobs().await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert!(jobs[0].active);
    assert!(manager.live_runner_ids().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn cancelling_parent_token_stops_runners() {
    let parent = tokio_util::sync::CancellationToken::new();
    let prober = ScriptedProber::new(Duration::ZERO);
    let manager = SchedulerManager::new(Arc::new(InMemoryStore::new()), prober.clone())
        .with_parent_token(&parent);

    let id = manager
        .create_job("10.0.0.13", 80, 80, secs(5), true)
        .await
        .unwrap();
    sleep(SECOND).await;
    parent.cancel();
    sleep(Duration::from_millis(10)).await;
    assert_eq!(manager.outstanding_tasks(), 0);

    assert!(manager.live_runner_ids().await.is_empty());
    assert!(matches!(
        manager.trigger_job(id).await,
        Err(SchedulerError::NotRunning(_))
    ));

    sleep(secs(20)).await;
    assert_eq!(prober.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn oversized_interval_is_rejected_at_creation() {
    let store = Arc::new(InMemoryStore::new());
    let manager = SchedulerManager::new(store.clone(), ScriptedProber::new(Duration::ZERO));

    let err = manager
        .create_job("127.0.0.1", 80, 80, secs(i64::MAX as u64), true)
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::Validation(_)));
    assert!(store.list_jobs().await.unwrap().is_empty());
    assert!(manager.live_runner_ids().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn stored_oversized_interval_does_not_leave_a_phantom_runner() {
    let store = Arc::new(InMemoryStore::new());
    let prober = ScriptedProber::new(Duration::ZERO);
    let job = store
        .insert_job(NewJob {
            target: "127.0.0.1".into(),
            start_port: 80,
            end_port: 80,
            interval_seconds: i64::MAX as u64,
            active: true,
        })
        .await
        .unwrap();
    let manager = SchedulerManager::new(store.clone(), prober.clone());

    assert_eq!(manager.load_and_start_all().await.unwrap(), 1);
    common::settle().await;

    assert_eq!(manager.runner_state(job.id).await, Some(RunnerState::Cancelled));
    assert!(manager.live_runner_ids().await.is_empty());
    assert!(matches!(
        manager.trigger_job(job.id).await,
        Err(SchedulerError::NotRunning(_))
    ));
    assert_eq!(manager.outstanding_tasks(), 0);
    assert_eq!(prober.calls(), 0);
    manager.stop_all().await;
}
