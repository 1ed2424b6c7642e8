//! Postgres store tests. They need `DATABASE_URL` and run with `cargo test -- --ignored`.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::json;
use sqlx::PgPool;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use render_lease::application::coordinator::{
    CoordinatorConfig, CoordinatorError, LeaseCoordinator, StatusUpdate,
};
use render_lease::application::repos::{
    CasOutcome, Expectation, JobPatch, JobQueryFilter, JobStore, LeaseChange, NewRenderJob,
};
use render_lease::domain::types::JobStatus;
use render_lease::infra::db::PostgresRepositories;

fn lease(expires_in: i64) -> LeaseChange {
    LeaseChange::Set {
        expires_at: OffsetDateTime::now_utc() + Duration::seconds(expires_in),
        token: Uuid::new_v4(),
        seconds: 60,
    }
}

#[ignore]
#[sqlx::test(migrations = "./migrations")]
async fn render_job_indexes_exist(pool: PgPool) {
    let rows: Vec<String> = sqlx::query_scalar(
        "SELECT indexname FROM pg_indexes WHERE schemaname = 'public' AND tablename = 'render_jobs'",
    )
    .fetch_all(&pool)
    .await
    .expect("fetch render job indexes");

    let indexes: HashSet<String> = rows.into_iter().collect();
    assert!(
        indexes.contains("render_jobs_status_created_at_id_idx"),
        "missing render_jobs_status_created_at_id_idx"
    );
    assert!(
        indexes.contains("render_jobs_active_lease_idx"),
        "missing render_jobs_active_lease_idx"
    );
}

#[ignore]
#[sqlx::test(migrations = "./migrations")]
async fn insert_find_and_list(pool: PgPool) {
    let store = PostgresRepositories::new(pool);
    let first = store
        .insert(NewRenderJob::render_part(json!({ "part": 1 })))
        .await
        .expect("insert");
    let second = store
        .insert(NewRenderJob::render_part(json!({ "part": 2 })))
        .await
        .expect("insert");

    let found = store.find(first.id).await.expect("find").expect("exists");
    assert_eq!(found.status, JobStatus::Queued);
    assert_eq!(found.payload["part"], 1);
    assert!(store.find(Uuid::new_v4()).await.expect("find").is_none());

    let listed = store
        .list(&JobQueryFilter {
            status: Some(JobStatus::Queued),
            ..JobQueryFilter::default()
        })
        .await
        .expect("list");
    let ids: Vec<Uuid> = listed.iter().map(|job| job.id).collect();
    assert_eq!(ids, vec![first.id, second.id]);
}

#[ignore]
#[sqlx::test(migrations = "./migrations")]
async fn compare_and_set_reports_mismatches(pool: PgPool) {
    let store = PostgresRepositories::new(pool);
    let job = store
        .insert(NewRenderJob::render_part(json!({})))
        .await
        .expect("insert");

    let claimed = store
        .compare_and_set(
            job.id,
            Expectation::status(JobStatus::Queued),
            JobPatch::to_status(JobStatus::Claimed).with_lease(lease(60)),
        )
        .await
        .expect("cas");
    let claimed = match claimed {
        CasOutcome::Applied(job) => job,
        other => panic!("unexpected outcome: {other:?}"),
    };
    assert!(claimed.lease_token.is_some());
    assert_eq!(claimed.lease_seconds, Some(60));

    let again = store
        .compare_and_set(
            job.id,
            Expectation::status(JobStatus::Queued),
            JobPatch::to_status(JobStatus::Claimed).with_lease(lease(60)),
        )
        .await
        .expect("cas");
    assert_eq!(
        again,
        CasOutcome::StatusMismatch {
            current: JobStatus::Claimed
        }
    );

    let wrong_token = store
        .compare_and_set(
            job.id,
            Expectation::status(JobStatus::Claimed).with_token(Some(Uuid::new_v4())),
            JobPatch::to_status(JobStatus::Rendering),
        )
        .await
        .expect("cas");
    assert_eq!(wrong_token, CasOutcome::LeaseMismatch);

    let missing = store
        .compare_and_set(
            Uuid::new_v4(),
            Expectation::status(JobStatus::Queued),
            JobPatch::default(),
        )
        .await
        .expect("cas");
    assert_eq!(missing, CasOutcome::Missing);
}

#[ignore]
#[sqlx::test(migrations = "./migrations")]
async fn lease_must_match_status(pool: PgPool) {
    let store = PostgresRepositories::new(pool);
    let job = store
        .insert(NewRenderJob::render_part(json!({})))
        .await
        .expect("insert");

    let result = store
        .compare_and_set(
            job.id,
            Expectation::status(JobStatus::Queued),
            JobPatch::to_status(JobStatus::Claimed),
        )
        .await;
    assert!(result.is_err(), "claimed without a lease violates the check");
    let stored = store.find(job.id).await.expect("find").expect("exists");
    assert_eq!(stored.status, JobStatus::Queued);
}

#[ignore]
#[sqlx::test(migrations = "./migrations")]
async fn concurrent_claims_on_postgres_have_one_winner(pool: PgPool) {
    let coordinator = Arc::new(LeaseCoordinator::new(
        Arc::new(PostgresRepositories::new(pool)),
        CoordinatorConfig::default(),
    ));
    let job = coordinator
        .enqueue(NewRenderJob::render_part(json!({})))
        .await
        .expect("enqueue");

    let mut handles = Vec::new();
    for _ in 0..8 {
        let coordinator = coordinator.clone();
        handles.push(tokio::spawn(
            async move { coordinator.claim(job.id, None).await },
        ));
    }

    let mut winners = 0;
    for handle in handles {
        match handle.await.expect("join") {
            Ok(_) => winners += 1,
            Err(CoordinatorError::Conflict { .. }) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(winners, 1);
}

#[ignore]
#[sqlx::test(migrations = "./migrations")]
async fn result_fields_merge_and_expired_leases_are_found(pool: PgPool) {
    let store = Arc::new(PostgresRepositories::new(pool));
    let coordinator = LeaseCoordinator::new(store.clone(), CoordinatorConfig::default());

    let done = coordinator
        .enqueue(NewRenderJob::render_part(json!({})))
        .await
        .expect("enqueue");
    let grant = coordinator.claim(done.id, None).await.expect("claim");
    let token = Some(grant.lease_token);
    coordinator
        .set_status(
            done.id,
            StatusUpdate::new(JobStatus::Rendering).with_token(token),
        )
        .await
        .expect("rendering");
    let mut update = StatusUpdate::new(JobStatus::Rendered).with_token(token);
    update.result.bytes = Some(42);
    let rendered = coordinator.set_status(done.id, update).await.expect("rendered");
    assert_eq!(rendered.result.expect("result")["bytes"], 42);
    assert_eq!(rendered.lease_token, None);

    let stale = coordinator
        .enqueue(NewRenderJob::render_part(json!({})))
        .await
        .expect("enqueue");
    store
        .compare_and_set(
            stale.id,
            Expectation::status(JobStatus::Queued),
            JobPatch::to_status(JobStatus::Claimed).with_lease(lease(-5)),
        )
        .await
        .expect("cas");

    let expired = store
        .expired_leases(OffsetDateTime::now_utc(), 10)
        .await
        .expect("expired");
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].id, stale.id);

    assert_eq!(
        coordinator
            .reap_expired(OffsetDateTime::now_utc(), 10)
            .await
            .expect("reap"),
        1
    );
    let requeued = coordinator.get(stale.id).await.expect("get");
    assert_eq!(requeued.status, JobStatus::Queued);
    assert_eq!(requeued.retries, 1);
}
