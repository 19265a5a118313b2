//! Integration tests for the release engine over the in-memory backend.
//!
//! These drive the real polling loop with short intervals and a manual
//! clock, covering:
//! 1. Due-job discovery and bounded dispatch
//! 2. The release scenario (grants, notifications, audit, counters)
//! 3. Retry bookkeeping and the attempt-count invariant
//! 4. Condition-check chaining and re-arming
//! 5. Graceful drain on stop, with and without timeout

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use serde_json::{Value, json};
use uuid::Uuid;

use unveil::{
    Clock, ConditionLogic, EngineConfig, EngineError, JobId, JobKind, JobStatus, JobStore, ManualClock,
    MemoryAuditSink, MemoryBackend, MemoryNotifier, ReleaseEngine, ReleaseJob, ReleaseSchedule,
    ScheduleId, ScheduleStatus, ScheduleStore, UserRecord,
};

struct Harness {
    backend: MemoryBackend,
    notifier: MemoryNotifier,
    audit: MemoryAuditSink,
    clock: ManualClock,
    engine: ReleaseEngine<MemoryBackend>,
}

fn fast_config() -> EngineConfig {
    EngineConfig {
        poll_interval: Duration::from_millis(25),
        health_check_interval: Duration::from_secs(1),
        max_concurrent_jobs: 5,
        shutdown_timeout: Duration::from_secs(5),
        drain_poll_interval: Duration::from_millis(20),
        ..EngineConfig::default()
    }
}

fn harness_with(notifier: MemoryNotifier, config: EngineConfig) -> Harness {
    let backend = MemoryBackend::new();
    let audit = MemoryAuditSink::new();
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 4, 1, 9, 0, 0).unwrap());
    let engine = ReleaseEngine::new(
        backend.clone(),
        Arc::new(notifier.clone()),
        Arc::new(audit.clone()),
        Arc::new(clock.clone()),
        config,
    );
    Harness {
        backend,
        notifier,
        audit,
        clock,
        engine,
    }
}

fn harness() -> Harness {
    harness_with(MemoryNotifier::new(), fast_config())
}

fn schedule(conditions: Vec<Value>, logic: ConditionLogic) -> ReleaseSchedule {
    let now = Utc.with_ymd_and_hms(2026, 4, 1, 8, 0, 0).unwrap();
    ReleaseSchedule {
        id: Uuid::new_v4(),
        content_type: "chapter".to_string(),
        content_id: Some("ch-1".to_string()),
        target_audience: None,
        conditions,
        condition_logic: logic,
        execution_count: 0,
        last_executed_at: None,
        max_executions: 10,
        status: ScheduleStatus::Active,
        retry_delay_minutes: 0,
        check_interval_minutes: 60,
        check_jitter_seconds: 0,
        notify_title: None,
        notify_message: None,
        notify_action_url: None,
        personalized_data: None,
        ab_test_variant: None,
        created_at: now,
        updated_at: now,
    }
}

fn job(schedule_id: Uuid, kind: JobKind, scheduled_for: chrono::DateTime<Utc>) -> ReleaseJob {
    ReleaseJob {
        id: Uuid::new_v4(),
        schedule_id,
        kind,
        status: JobStatus::Pending,
        scheduled_for,
        priority: 0,
        attempt_count: 0,
        max_retries: 3,
        retry_delay_minutes: 0,
        payload: json!({}),
        result: None,
        error_message: None,
        started_at: None,
        completed_at: None,
        created_at: scheduled_for,
    }
}

fn seed_users(backend: &MemoryBackend, clock: &ManualClock, count: usize) {
    for i in 0..count {
        backend.add_user(UserRecord {
            id: format!("u{i}"),
            email: Some(format!("u{i}@example.com")),
            is_admin: false,
            email_verified: true,
            created_at: clock.now(),
        });
    }
}

async fn wait_until<F>(mut condition: F, timeout: Duration) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

#[tokio::test]
async fn releases_due_content_to_every_user() {
    let h = harness();
    seed_users(&h.backend, &h.clock, 3);
    let sched = schedule(Vec::new(), ConditionLogic::And);
    h.backend.insert_schedule(&sched).await.unwrap();
    let release = job(sched.id, JobKind::ContentRelease, h.clock.now());
    h.backend.insert_job(&release).await.unwrap();

    h.engine.start().await;
    let done = wait_until(
        || {
            h.backend
                .jobs()
                .iter()
                .all(|j| j.status == JobStatus::Completed)
        },
        Duration::from_secs(2),
    )
    .await;
    h.engine.stop().await;
    assert!(done, "release job never completed");

    let grants = h.backend.grants();
    assert_eq!(grants.len(), 3);
    assert!(grants.iter().all(|g| g.access_method == "scheduled"));

    let schedules = h.backend.schedules();
    assert_eq!(schedules[0].execution_count, 1);

    let entries = h.audit.entries();
    assert_eq!(entries.len(), 1);
    assert!(entries[0].success);
    assert_eq!(entries[0].recipient_count, 3);

    assert_eq!(h.notifier.sent().len(), 3);

    let metrics = h.engine.metrics();
    assert_eq!(metrics.total_jobs_processed, 1);
    assert_eq!(metrics.successful_jobs, 1);
}

#[tokio::test]
async fn future_jobs_are_not_dispatched_early() {
    let h = harness();
    seed_users(&h.backend, &h.clock, 1);
    let sched = schedule(Vec::new(), ConditionLogic::And);
    h.backend.insert_schedule(&sched).await.unwrap();
    let future = h.clock.now() + chrono::Duration::hours(1);
    let release = job(sched.id, JobKind::ContentRelease, future);
    h.backend.insert_job(&release).await.unwrap();

    h.engine.start().await;
    // Let several poll passes run.
    tokio::time::sleep(Duration::from_millis(150)).await;
    h.engine.stop().await;

    let jobs = h.backend.jobs();
    assert_eq!(jobs[0].status, JobStatus::Pending);
    assert_eq!(jobs[0].attempt_count, 0);
    assert!(h.backend.grants().is_empty());
}

#[tokio::test]
async fn failed_jobs_retry_then_fail_with_bounded_attempts() {
    let h = harness();
    // Job pointing at a schedule that does not exist: every attempt fails.
    let mut broken = job(Uuid::new_v4(), JobKind::ContentRelease, h.clock.now());
    broken.max_retries = 1;
    h.backend.insert_job(&broken).await.unwrap();

    h.engine.start().await;
    let done = wait_until(
        || {
            h.backend
                .jobs()
                .iter()
                .all(|j| j.status == JobStatus::Failed)
        },
        Duration::from_secs(2),
    )
    .await;
    h.engine.stop().await;
    assert!(done, "job never reached failed");

    let jobs = h.backend.jobs();
    assert_eq!(jobs[0].attempt_count, 2);
    assert!(jobs[0].attempt_count <= jobs[0].max_retries + 1);

    let entries = h.audit.entries();
    assert_eq!(entries.len(), 2);
    assert!(entries.iter().all(|e| !e.success));

    let metrics = h.engine.metrics();
    assert_eq!(metrics.failed_jobs, 2);
}

#[tokio::test]
async fn terminal_jobs_are_never_picked_up_again() {
    let h = harness();
    seed_users(&h.backend, &h.clock, 1);
    let sched = schedule(Vec::new(), ConditionLogic::And);
    h.backend.insert_schedule(&sched).await.unwrap();
    let release = job(sched.id, JobKind::ContentRelease, h.clock.now());
    h.backend.insert_job(&release).await.unwrap();

    h.engine.start().await;
    assert!(
        wait_until(
            || {
                h.backend
                    .jobs()
                    .iter()
                    .all(|j| j.status == JobStatus::Completed)
            },
            Duration::from_secs(2),
        )
        .await
    );
    // Several more passes over the completed job.
    tokio::time::sleep(Duration::from_millis(150)).await;
    h.engine.stop().await;

    let jobs = h.backend.jobs();
    assert_eq!(jobs[0].attempt_count, 1);
    assert_eq!(h.audit.entries().len(), 1);
}

#[tokio::test]
async fn condition_check_chains_release_under_or_logic() {
    let h = harness();
    seed_users(&h.backend, &h.clock, 2);
    let conditions = vec![
        json!({"type": "custom_sql", "query": "SELECT 1"}),
        json!({
            "type": "time_based", "timeType": "absolute",
            "value": "2026-01-01T00:00:00Z", "operator": "after"
        }),
    ];
    let sched = schedule(conditions, ConditionLogic::Or);
    h.backend.insert_schedule(&sched).await.unwrap();
    let check = job(sched.id, JobKind::ConditionCheck, h.clock.now());
    h.backend.insert_job(&check).await.unwrap();

    h.engine.start().await;
    let done = wait_until(
        || !h.backend.grants().is_empty(),
        Duration::from_secs(2),
    )
    .await;
    h.engine.stop().await;
    assert!(done, "chained release never granted access");

    let releases: Vec<_> = h
        .backend
        .jobs()
        .into_iter()
        .filter(|j| j.kind == JobKind::ContentRelease)
        .collect();
    assert_eq!(releases.len(), 1, "exactly one release job is chained");
    assert_eq!(h.backend.grants().len(), 2);
}

#[tokio::test]
async fn same_conditions_under_and_logic_do_not_release() {
    let h = harness();
    seed_users(&h.backend, &h.clock, 2);
    let conditions = vec![
        json!({"type": "custom_sql", "query": "SELECT 1"}),
        json!({
            "type": "time_based", "timeType": "absolute",
            "value": "2026-01-01T00:00:00Z", "operator": "after"
        }),
    ];
    let sched = schedule(conditions, ConditionLogic::And);
    h.backend.insert_schedule(&sched).await.unwrap();
    let check = job(sched.id, JobKind::ConditionCheck, h.clock.now());
    let check_id = check.id;
    h.backend.insert_job(&check).await.unwrap();

    h.engine.start().await;
    assert!(
        wait_until(
            || {
                h.backend
                    .jobs()
                    .iter()
                    .any(|j| j.id == check_id && j.status == JobStatus::Completed)
            },
            Duration::from_secs(2),
        )
        .await
    );
    h.engine.stop().await;

    assert!(
        h.backend
            .jobs()
            .iter()
            .all(|j| j.kind != JobKind::ContentRelease)
    );
    assert!(h.backend.grants().is_empty());
}

#[tokio::test]
async fn unmet_condition_check_rearms_after_interval() {
    let h = harness();
    // No admin users exist, so the attribute condition stays unmet.
    seed_users(&h.backend, &h.clock, 2);
    let conditions = vec![json!({
        "type": "user_attributes",
        "attribute": "isAdmin", "operator": "eq", "value": true, "threshold": 1
    })];
    let sched = schedule(conditions, ConditionLogic::And);
    h.backend.insert_schedule(&sched).await.unwrap();
    let check = job(sched.id, JobKind::ConditionCheck, h.clock.now());
    let check_id = check.id;
    h.backend.insert_job(&check).await.unwrap();

    h.engine.start().await;
    assert!(
        wait_until(
            || {
                h.backend
                    .jobs()
                    .iter()
                    .any(|j| j.id == check_id && j.status == JobStatus::Completed)
            },
            Duration::from_secs(2),
        )
        .await
    );
    h.engine.stop().await;

    let follow_ups: Vec<_> = h
        .backend
        .jobs()
        .into_iter()
        .filter(|j| j.kind == JobKind::ConditionCheck && j.id != check_id)
        .collect();
    assert_eq!(follow_ups.len(), 1);
    assert_eq!(
        follow_ups[0].scheduled_for,
        h.clock.now() + chrono::Duration::minutes(60)
    );
    assert_eq!(
        follow_ups[0].payload.get("checkAttempt").and_then(Value::as_i64),
        Some(1)
    );
    assert!(h.backend.grants().is_empty());
}

#[tokio::test]
async fn cancelled_job_is_never_dispatched() {
    let h = harness();
    seed_users(&h.backend, &h.clock, 1);
    let sched = schedule(Vec::new(), ConditionLogic::And);
    h.backend.insert_schedule(&sched).await.unwrap();
    let release = job(sched.id, JobKind::ContentRelease, h.clock.now());
    h.backend.insert_job(&release).await.unwrap();

    h.engine.cancel_job(JobId(release.id)).await.unwrap();

    h.engine.start().await;
    tokio::time::sleep(Duration::from_millis(150)).await;
    h.engine.stop().await;

    let jobs = h.backend.jobs();
    assert_eq!(jobs[0].status, JobStatus::Cancelled);
    assert_eq!(jobs[0].attempt_count, 0);
    assert!(h.backend.grants().is_empty());

    // A terminal job cannot be cancelled again, and unknown ids are distinct.
    assert!(matches!(
        h.engine.cancel_job(JobId(release.id)).await,
        Err(EngineError::NotCancellable(_))
    ));
    assert!(matches!(
        h.engine.cancel_job(JobId(Uuid::new_v4())).await,
        Err(EngineError::UnknownJob(_))
    ));
}

#[tokio::test]
async fn stop_waits_for_in_flight_jobs() {
    let notifier = MemoryNotifier::with_delay(Duration::from_millis(300));
    let h = harness_with(notifier, fast_config());
    seed_users(&h.backend, &h.clock, 1);
    let sched = schedule(Vec::new(), ConditionLogic::And);
    h.backend.insert_schedule(&sched).await.unwrap();
    let release = job(sched.id, JobKind::ContentRelease, h.clock.now());
    h.backend.insert_job(&release).await.unwrap();

    h.engine.start().await;
    assert!(
        wait_until(|| h.engine.status().active_job_count > 0, Duration::from_secs(1)).await,
        "job never entered the in-flight set"
    );

    h.engine.stop().await;

    let status = h.engine.status();
    assert!(!status.is_running);
    assert_eq!(status.active_job_count, 0, "drain left jobs in flight");
    let jobs = h.backend.jobs();
    assert_eq!(jobs[0].status, JobStatus::Completed);
}

#[tokio::test]
async fn stop_gives_up_after_the_shutdown_timeout() {
    let notifier = MemoryNotifier::with_delay(Duration::from_secs(3));
    let config = EngineConfig {
        shutdown_timeout: Duration::from_millis(150),
        ..fast_config()
    };
    let h = harness_with(notifier, config);
    seed_users(&h.backend, &h.clock, 1);
    let sched = schedule(Vec::new(), ConditionLogic::And);
    h.backend.insert_schedule(&sched).await.unwrap();
    let release = job(sched.id, JobKind::ContentRelease, h.clock.now());
    h.backend.insert_job(&release).await.unwrap();

    h.engine.start().await;
    assert!(
        wait_until(|| h.engine.status().active_job_count > 0, Duration::from_secs(1)).await
    );

    let started = tokio::time::Instant::now();
    h.engine.stop().await;
    let elapsed = started.elapsed();

    assert!(elapsed < Duration::from_secs(2), "stop did not honor its timeout");
    assert!(
        h.engine.status().active_job_count > 0,
        "the slow job should still be notionally in flight"
    );
}

#[tokio::test]
async fn start_is_idempotent_and_stop_is_too() {
    let h = harness();
    h.engine.start().await;
    h.engine.start().await;
    assert!(h.engine.status().is_running);

    h.engine.stop().await;
    h.engine.stop().await;
    assert!(!h.engine.status().is_running);
}

#[tokio::test]
async fn create_job_validates_the_schedule() {
    let h = harness();
    let result = h
        .engine
        .create_job(unveil::CreateJobParams {
            schedule_id: ScheduleId(Uuid::new_v4()),
            kind: JobKind::ContentRelease,
            scheduled_for: h.clock.now(),
            payload: None,
            priority: None,
            max_retries: None,
            retry_delay_minutes: None,
        })
        .await;
    assert!(matches!(result, Err(EngineError::UnknownSchedule(_))));
}

#[tokio::test]
async fn admin_surface_round_trips_schedules_and_jobs() {
    let h = harness();
    seed_users(&h.backend, &h.clock, 1);

    let schedule_id = h
        .engine
        .create_schedule(unveil::CreateScheduleParams::for_content(
            "certificate",
            Some("cert-1".to_string()),
        ))
        .await
        .unwrap();

    let job_id = h
        .engine
        .create_job(unveil::CreateJobParams {
            schedule_id,
            kind: JobKind::ContentRelease,
            scheduled_for: h.clock.now(),
            payload: None,
            priority: Some(3),
            max_retries: None,
            retry_delay_minutes: None,
        })
        .await
        .unwrap();

    let stored = h.engine.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(stored.priority, 3);
    assert_eq!(stored.status, JobStatus::Pending);

    h.engine.start().await;
    assert!(
        wait_until(
            || {
                h.backend
                    .jobs()
                    .iter()
                    .all(|j| j.status == JobStatus::Completed)
            },
            Duration::from_secs(2),
        )
        .await
    );
    h.engine.stop().await;

    let history = h.engine.audit_history(schedule_id, 10).await.unwrap();
    assert_eq!(history.len(), 1);
    assert!(history[0].success);

    // Pausing the schedule is visible through the store.
    h.engine
        .set_schedule_status(schedule_id, ScheduleStatus::Paused)
        .await
        .unwrap();
    let schedules = h.engine.list_schedules(10, 0).await.unwrap();
    assert_eq!(schedules[0].status, ScheduleStatus::Paused);
}

#[tokio::test]
async fn due_jobs_are_ordered_by_priority_then_due_time() {
    let h = harness();
    let sched = schedule(Vec::new(), ConditionLogic::And);
    h.backend.insert_schedule(&sched).await.unwrap();
    let now = h.clock.now();

    let mut low = job(sched.id, JobKind::Notification, now - chrono::Duration::minutes(5));
    low.priority = 0;
    let mut high = job(sched.id, JobKind::Notification, now);
    high.priority = 10;
    let mut older = job(sched.id, JobKind::Notification, now - chrono::Duration::minutes(10));
    older.priority = 0;
    let future = job(sched.id, JobKind::Notification, now + chrono::Duration::minutes(10));
    for j in [&low, &high, &older, &future] {
        h.backend.insert_job(j).await.unwrap();
    }

    // When capacity only allows one job, the highest priority wins.
    let one = h.backend.find_due_jobs(now, 1).await.unwrap();
    assert_eq!(one.len(), 1);
    assert_eq!(one[0].id, high.id);

    // Equal priority falls back to scheduled_for order, and the future job
    // is excluded outright.
    let all = h.backend.find_due_jobs(now, 10).await.unwrap();
    let ids: Vec<_> = all.iter().map(|j| j.id).collect();
    assert_eq!(ids, vec![high.id, older.id, low.id]);
}
