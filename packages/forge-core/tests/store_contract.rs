//! Behavioral contract of the store procedures, exercised against the
//! in-memory implementation. The scheduling logic is shared with the
//! Postgres implementation, so these assertions describe both.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use serde_json::json;
use uuid::Uuid;

use forge_core::backoff::BackoffPolicy;
use forge_core::error::ErrorKind;
use forge_core::job::{AttemptOutcome, EnqueueJob, JobStatus};
use forge_core::manifest::{ManifestStatus, RunManifest};
use forge_core::memory::MemoryStore;
use forge_core::store::{JobStore, ManifestStore, ReplayStore, StoreError};

fn fast_store() -> MemoryStore {
    MemoryStore::with_backoff(BackoffPolicy::new(
        StdDuration::from_millis(10),
        2.0,
        StdDuration::from_millis(100),
    ))
}

fn enqueue(tenant: Uuid, key: &str) -> EnqueueJob {
    EnqueueJob::builder()
        .tenant_id(tenant)
        .job_type("ops.scan")
        .payload(json!({"a": 1}))
        .idempotency_key(key)
        .trace_id("tr-1")
        .build()
}

fn manifest_for(job: &forge_core::job::Job) -> RunManifest {
    RunManifest::builder()
        .run_id(job.id)
        .tenant_id(job.tenant_id)
        .job_type(job.job_type.clone())
        .inputs_snapshot_hash(forge_core::canonical::hash_canonical(&job.payload))
        .status(ManifestStatus::Complete)
        .build()
}

#[tokio::test]
async fn enqueue_is_idempotent() {
    let store = fast_store();
    let tenant = Uuid::new_v4();

    let first = store.enqueue_job(enqueue(tenant, "k-42")).await.expect("enqueue");
    let second = store.enqueue_job(enqueue(tenant, "k-42")).await.expect("enqueue");

    assert!(first.is_created());
    assert!(!second.is_created());
    assert_eq!(first.job_id(), second.job_id());
    assert_eq!(second.job().attempt_no, 0);
}

#[tokio::test]
async fn concurrent_enqueue_yields_one_row() {
    let store = Arc::new(fast_store());
    let tenant = Uuid::new_v4();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store.enqueue_job(enqueue(tenant, "k-42")).await
        }));
    }
    let mut ids = Vec::new();
    let mut created = 0;
    for handle in handles {
        let result = handle.await.expect("join").expect("enqueue");
        if result.is_created() {
            created += 1;
        }
        ids.push(result.job_id());
    }
    ids.dedup();
    assert_eq!(created, 1);
    assert_eq!(ids.len(), 1);
}

#[tokio::test]
async fn claims_are_exclusive() {
    let store = Arc::new(fast_store());
    let tenant = Uuid::new_v4();
    for i in 0..5 {
        store
            .enqueue_job(enqueue(tenant, &format!("k-{i}")))
            .await
            .expect("enqueue");
    }

    let mut handles = Vec::new();
    for w in 0..4 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store.claim_jobs(Some(tenant), &format!("w-{w}"), 10).await
        }));
    }
    let mut seen = Vec::new();
    for handle in handles {
        for job in handle.await.expect("join").expect("claim") {
            seen.push(job.id);
        }
    }
    seen.sort();
    let before = seen.len();
    seen.dedup();
    assert_eq!(before, 5, "every job claimed exactly once");
    assert_eq!(seen.len(), 5, "no job claimed twice");
}

#[tokio::test]
async fn claim_orders_by_priority_then_age() {
    let store = fast_store();
    let tenant = Uuid::new_v4();

    let mut low = enqueue(tenant, "low");
    low.priority = 1;
    let mut high = enqueue(tenant, "high");
    high.priority = 9;
    store.enqueue_job(low).await.expect("enqueue");
    store.enqueue_job(high).await.expect("enqueue");

    let claimed = store.claim_jobs(Some(tenant), "w-1", 10).await.expect("claim");
    assert_eq!(claimed[0].idempotency_key, "high");
    assert_eq!(claimed[1].idempotency_key, "low");
}

#[tokio::test]
async fn complete_writes_manifest_and_attempt() {
    let store = fast_store();
    let tenant = Uuid::new_v4();
    store.enqueue_job(enqueue(tenant, "k-1")).await.expect("enqueue");

    let claimed = store.claim_jobs(Some(tenant), "w-1", 1).await.expect("claim");
    let job = &claimed[0];
    assert_eq!(job.status, JobStatus::Claimed);
    assert_eq!(job.attempt_no, 1);

    store
        .complete_job(tenant, job.id, "w-1", manifest_for(job))
        .await
        .expect("complete");

    let stored = store.get_job(tenant, job.id).await.expect("get").expect("exists");
    assert_eq!(stored.status, JobStatus::Succeeded);
    assert_eq!(stored.result_id, Some(job.id));

    let attempts = store.list_attempts(tenant, job.id).await.expect("attempts");
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].outcome, Some(AttemptOutcome::Succeeded));

    let manifest = store
        .get_manifest(tenant, job.id)
        .await
        .expect("get manifest")
        .expect("manifest exists");
    assert_eq!(manifest.status, ManifestStatus::Complete);
}

#[tokio::test]
async fn complete_rejects_foreign_worker() {
    let store = fast_store();
    let tenant = Uuid::new_v4();
    store.enqueue_job(enqueue(tenant, "k-1")).await.expect("enqueue");
    let claimed = store.claim_jobs(Some(tenant), "w-1", 1).await.expect("claim");
    let job = &claimed[0];

    let err = store
        .complete_job(tenant, job.id, "w-2", manifest_for(job))
        .await
        .expect_err("other worker must be rejected");
    assert!(matches!(err, StoreError::ClaimLost));
}

#[tokio::test]
async fn retryable_failure_reschedules_with_growing_backoff() {
    let store = fast_store();
    let tenant = Uuid::new_v4();
    store.enqueue_job(enqueue(tenant, "k-1")).await.expect("enqueue");

    // attempt 1 fails
    let job = store.claim_jobs(Some(tenant), "w-1", 1).await.expect("claim")[0].clone();
    store
        .fail_job(tenant, job.id, "w-1", ErrorKind::Timeout, "slow upstream", true)
        .await
        .expect("fail");

    let after_first = store.get_job(tenant, job.id).await.expect("get").expect("exists");
    assert_eq!(after_first.status, JobStatus::Pending);
    assert!(after_first.available_at > Utc::now() - Duration::seconds(1));
    assert!(after_first.claimed_by.is_none());

    // wait for availability, then fail attempt 2
    tokio::time::sleep(StdDuration::from_millis(30)).await;
    let job2 = store.claim_jobs(Some(tenant), "w-1", 1).await.expect("claim")[0].clone();
    assert_eq!(job2.attempt_no, 2);
    store
        .fail_job(tenant, job2.id, "w-1", ErrorKind::Timeout, "slow upstream", true)
        .await
        .expect("fail");

    let after_second = store.get_job(tenant, job.id).await.expect("get").expect("exists");
    // available_at never moves backwards across retries
    assert!(after_second.available_at >= after_first.available_at);
}

#[tokio::test]
async fn non_retryable_failure_is_terminal_with_failed_manifest() {
    let store = fast_store();
    let tenant = Uuid::new_v4();
    store.enqueue_job(enqueue(tenant, "k-1")).await.expect("enqueue");
    let job = store.claim_jobs(Some(tenant), "w-1", 1).await.expect("claim")[0].clone();

    store
        .fail_job(tenant, job.id, "w-1", ErrorKind::Validation, "bad payload", false)
        .await
        .expect("fail");

    let stored = store.get_job(tenant, job.id).await.expect("get").expect("exists");
    assert_eq!(stored.status, JobStatus::Failed);

    let manifest = store
        .get_manifest(tenant, job.id)
        .await
        .expect("get manifest")
        .expect("failed manifest written");
    assert_eq!(manifest.status, ManifestStatus::Failed);
    let error = manifest.error.expect("error recorded");
    assert_eq!(error.kind, ErrorKind::Validation);
}

#[tokio::test]
async fn exhausted_retries_dead_letter() {
    let store = fast_store();
    let tenant = Uuid::new_v4();
    let mut request = enqueue(tenant, "k-1");
    request.max_attempts = 2;
    store.enqueue_job(request).await.expect("enqueue");

    for _ in 0..2 {
        tokio::time::sleep(StdDuration::from_millis(30)).await;
        let job = store.claim_jobs(Some(tenant), "w-1", 1).await.expect("claim")[0].clone();
        store
            .fail_job(tenant, job.id, "w-1", ErrorKind::Transient, "flaky", true)
            .await
            .expect("fail");
    }

    let jobs = store.claim_jobs(Some(tenant), "w-1", 1).await.expect("claim");
    assert!(jobs.is_empty(), "dead jobs are not claimable");
}

#[tokio::test]
async fn reap_returns_stale_jobs_to_pending() {
    let store = fast_store();
    let tenant = Uuid::new_v4();
    store.enqueue_job(enqueue(tenant, "k-1")).await.expect("enqueue");
    let job = store.claim_jobs(Some(tenant), "w-1", 1).await.expect("claim")[0].clone();

    // worker crashes: no heartbeat arrives
    tokio::time::sleep(StdDuration::from_millis(30)).await;
    let reaped = store
        .reap_stuck_jobs(Duration::milliseconds(20))
        .await
        .expect("reap");
    assert_eq!(reaped, 1);

    let stored = store.get_job(tenant, job.id).await.expect("get").expect("exists");
    assert_eq!(stored.status, JobStatus::Pending);
    assert_eq!(stored.attempt_no, 1, "attempt count reflects the lost claim");

    let attempts = store.list_attempts(tenant, job.id).await.expect("attempts");
    assert_eq!(attempts[0].outcome, Some(AttemptOutcome::TimedOut));

    // fresh heartbeats are not reaped
    let reaped_again = store
        .reap_stuck_jobs(Duration::hours(1))
        .await
        .expect("reap");
    assert_eq!(reaped_again, 0);
}

#[tokio::test]
async fn heartbeat_reports_lost_claims() {
    let store = fast_store();
    let tenant = Uuid::new_v4();
    store.enqueue_job(enqueue(tenant, "k-1")).await.expect("enqueue");
    let job = store.claim_jobs(Some(tenant), "w-1", 1).await.expect("claim")[0].clone();

    assert!(store.heartbeat_job(tenant, job.id, "w-1").await.expect("heartbeat"));
    // first heartbeat promotes the claim to running
    let running = store.get_job(tenant, job.id).await.expect("get").expect("exists");
    assert_eq!(running.status, JobStatus::Running);

    assert!(!store.heartbeat_job(tenant, job.id, "w-2").await.expect("heartbeat"));

    tokio::time::sleep(StdDuration::from_millis(30)).await;
    store
        .reap_stuck_jobs(Duration::milliseconds(20))
        .await
        .expect("reap");
    assert!(
        !store.heartbeat_job(tenant, job.id, "w-1").await.expect("heartbeat"),
        "reaped claim is reported lost"
    );
}

#[tokio::test]
async fn tenants_are_isolated() {
    let store = fast_store();
    let tenant_a = Uuid::new_v4();
    let tenant_b = Uuid::new_v4();
    let job_a = store
        .enqueue_job(enqueue(tenant_a, "k-1"))
        .await
        .expect("enqueue")
        .job()
        .clone();
    store.enqueue_job(enqueue(tenant_b, "k-1")).await.expect("enqueue");

    let claimed_b = store.claim_jobs(Some(tenant_b), "w-1", 10).await.expect("claim");
    assert_eq!(claimed_b.len(), 1);
    assert_eq!(claimed_b[0].tenant_id, tenant_b);

    assert!(store
        .get_job(tenant_b, job_a.id)
        .await
        .expect("get")
        .is_none());
    assert!(store
        .get_manifest(tenant_b, job_a.id)
        .await
        .expect("get")
        .is_none());
}

#[tokio::test]
async fn multi_tenant_claim_still_scopes_rows() {
    let store = fast_store();
    let tenant_a = Uuid::new_v4();
    let tenant_b = Uuid::new_v4();
    store.enqueue_job(enqueue(tenant_a, "k-1")).await.expect("enqueue");
    store.enqueue_job(enqueue(tenant_b, "k-1")).await.expect("enqueue");

    let claimed = store.claim_jobs(None, "w-1", 10).await.expect("claim");
    assert_eq!(claimed.len(), 2);
    for job in &claimed {
        assert!(job.tenant_id == tenant_a || job.tenant_id == tenant_b);
    }
}

#[tokio::test]
async fn jti_consumption_is_single_use() {
    let store = fast_store();
    let tenant = Uuid::new_v4();
    let exp = Utc::now() + Duration::hours(1);

    assert!(store
        .consume_jti(tenant, "jti-1", "deploy.apply", Some("svc-a"), exp)
        .await
        .expect("consume"));
    assert!(!store
        .consume_jti(tenant, "jti-1", "deploy.apply", Some("svc-a"), exp)
        .await
        .expect("consume"));
    // a different action/resource pair is a different capability
    assert!(store
        .consume_jti(tenant, "jti-1", "deploy.apply", Some("svc-b"), exp)
        .await
        .expect("consume"));
}

#[tokio::test]
async fn procedures_are_idempotent_under_retry() {
    let store = fast_store();
    let tenant = Uuid::new_v4();
    store.enqueue_job(enqueue(tenant, "k-1")).await.expect("enqueue");
    let job = store.claim_jobs(Some(tenant), "w-1", 1).await.expect("claim")[0].clone();
    let manifest = manifest_for(&job);

    store
        .complete_job(tenant, job.id, "w-1", manifest.clone())
        .await
        .expect("complete");
    store
        .complete_job(tenant, job.id, "w-1", manifest)
        .await
        .expect("retried complete is a no-op");

    let attempts = store.list_attempts(tenant, job.id).await.expect("attempts");
    assert_eq!(attempts.len(), 1);
}

#[tokio::test]
async fn next_available_at_reports_earliest_pending_job() {
    let store = fast_store();
    let tenant = Uuid::new_v4();
    assert!(store.next_available_at(None).await.expect("query").is_none());

    let soon = Utc::now() + Duration::seconds(5);
    let later = Utc::now() + Duration::seconds(60);
    let mut near = enqueue(tenant, "k-near");
    near.available_at = Some(soon);
    let mut far = enqueue(tenant, "k-far");
    far.available_at = Some(later);
    store.enqueue_job(far).await.expect("enqueue");
    store.enqueue_job(near).await.expect("enqueue");

    let next = store
        .next_available_at(Some(tenant))
        .await
        .expect("query")
        .expect("pending jobs exist");
    assert_eq!(next, soon);

    // other tenants see nothing
    assert!(store
        .next_available_at(Some(Uuid::new_v4()))
        .await
        .expect("query")
        .is_none());
}

#[tokio::test]
async fn next_available_at_tracks_reaped_jobs() {
    let store = fast_store();
    let tenant = Uuid::new_v4();
    store.enqueue_job(enqueue(tenant, "k-1")).await.expect("enqueue");
    store.claim_jobs(Some(tenant), "w-1", 1).await.expect("claim");

    // claimed jobs are not pending
    assert!(store.next_available_at(None).await.expect("query").is_none());

    tokio::time::sleep(StdDuration::from_millis(30)).await;
    store
        .reap_stuck_jobs(Duration::milliseconds(20))
        .await
        .expect("reap");

    // the reaped job is pending again with its retry schedule visible
    let next = store
        .next_available_at(Some(tenant))
        .await
        .expect("query")
        .expect("reaped job is pending");
    assert!(next > Utc::now() - Duration::seconds(1));
}
