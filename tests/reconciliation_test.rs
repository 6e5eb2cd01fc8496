//! Fallback reconciliation job tests: job-state dispatch, recovery-flag
//! handling and abstention when the broker is down.

mod common;

use assert_matches::assert_matches;
use common::{authorization, harness, pending_order, TestHarness};
use chrono::{Duration, Utc};
use order_edit_api::entities::order;
use order_edit_api::errors::ServiceError;
use order_edit_api::events::{Event, EventSender};
use order_edit_api::gateway::AuthorizationStatus;
use order_edit_api::queue::{capture_job_id, CaptureQueue, JobState};
use order_edit_api::services::reconciliation::ReconciliationJob;
use std::sync::Arc;
use uuid::Uuid;

const STALENESS_MINUTES: i64 = 65;

fn job_for(h: &TestHarness, events: EventSender) -> ReconciliationJob {
    ReconciliationJob::new(
        Arc::new(h.store.clone()),
        Arc::new(h.gateway.clone()),
        Arc::new(h.queue.clone()),
        events,
        STALENESS_MINUTES,
    )
}

fn stale_order(auth_id: &str) -> order::Model {
    // pending_order() creates orders two hours old, past the threshold.
    pending_order(Uuid::new_v4(), auth_id, 2200)
}

#[tokio::test]
async fn test_missing_job_is_requeued_exactly_once() {
    let h = harness();
    let (tx, _rx) = tokio::sync::mpsc::channel(16);
    let order = stale_order("auth_r1");
    let order_id = order.id;
    h.store.insert_order(order, vec![]);
    h.gateway.insert_authorization(authorization("auth_r1", 2200));

    let summary = job_for(&h, EventSender::new(tx)).run_once().await.unwrap();

    assert_eq!(summary.requeued, 1);
    assert_eq!(summary.alerts, 0);
    assert_eq!(h.queue.job_ids(), vec![capture_job_id(order_id)]);
    assert_eq!(
        h.queue
            .job_state(&capture_job_id(order_id))
            .await
            .unwrap(),
        JobState::Waiting
    );
}

#[tokio::test]
async fn test_in_flight_jobs_are_left_alone() {
    for state in [JobState::Waiting, JobState::Active, JobState::Delayed] {
        let h = harness();
        let (tx, _rx) = tokio::sync::mpsc::channel(16);
        let order = stale_order("auth_r2");
        let order_id = order.id;
        h.store.insert_order(order, vec![]);
        h.gateway.insert_authorization(authorization("auth_r2", 2200));
        h.queue.set_job_state(&capture_job_id(order_id), state);

        let summary = job_for(&h, EventSender::new(tx)).run_once().await.unwrap();

        assert_eq!(summary.requeued, 0, "state {state} must not requeue");
        assert_eq!(summary.skipped_in_flight, 1);
        assert_eq!(
            h.queue
                .job_state(&capture_job_id(order_id))
                .await
                .unwrap(),
            state
        );
    }
}

#[tokio::test]
async fn test_failed_job_alerts_without_requeueing() {
    let h = harness();
    let (tx, mut rx) = tokio::sync::mpsc::channel(16);
    let order = stale_order("auth_r3");
    let order_id = order.id;
    h.store.insert_order(order, vec![]);
    h.gateway.insert_authorization(authorization("auth_r3", 2200));
    h.queue
        .set_job_state(&capture_job_id(order_id), JobState::Failed);

    let summary = job_for(&h, EventSender::new(tx)).run_once().await.unwrap();

    assert_eq!(summary.alerts, 1);
    assert_eq!(summary.requeued, 0);
    assert_eq!(
        h.queue
            .job_state(&capture_job_id(order_id))
            .await
            .unwrap(),
        JobState::Failed
    );
    assert_matches!(
        rx.try_recv().unwrap(),
        Event::CaptureFailedAlert { order_id: o, .. } if o == order_id
    );
}

#[tokio::test]
async fn test_completed_but_uncaptured_job_is_requeued() {
    let h = harness();
    let (tx, _rx) = tokio::sync::mpsc::channel(16);
    let order = stale_order("auth_r4");
    let order_id = order.id;
    h.store.insert_order(order, vec![]);
    // Job "finished" but the authorization still requires capture.
    h.gateway.insert_authorization(authorization("auth_r4", 2200));
    h.queue
        .set_job_state(&capture_job_id(order_id), JobState::Completed);

    let summary = job_for(&h, EventSender::new(tx)).run_once().await.unwrap();

    assert_eq!(summary.requeued, 1);
    assert_eq!(
        h.queue
            .job_state(&capture_job_id(order_id))
            .await
            .unwrap(),
        JobState::Waiting
    );
}

#[tokio::test]
async fn test_resolved_authorization_is_skipped() {
    let h = harness();
    let (tx, _rx) = tokio::sync::mpsc::channel(16);
    let order = stale_order("auth_r5");
    h.store.insert_order(order, vec![]);
    let mut auth = authorization("auth_r5", 2200);
    auth.status = AuthorizationStatus::Succeeded;
    h.gateway.insert_authorization(auth);

    let summary = job_for(&h, EventSender::new(tx)).run_once().await.unwrap();

    assert_eq!(summary.skipped_resolved, 1);
    assert_eq!(summary.requeued, 0);
    assert!(h.queue.is_empty());
}

#[tokio::test]
async fn test_young_and_canceled_orders_are_not_scanned() {
    let h = harness();
    let (tx, _rx) = tokio::sync::mpsc::channel(16);

    let mut young = pending_order(Uuid::new_v4(), "auth_r6", 2200);
    young.created_at = Utc::now() - Duration::minutes(10);
    h.store.insert_order(young, vec![]);

    let mut canceled = stale_order("auth_r7");
    canceled.status = order::STATUS_CANCELED.to_string();
    h.store.insert_order(canceled, vec![]);

    h.gateway.insert_authorization(authorization("auth_r6", 2200));
    h.gateway.insert_authorization(authorization("auth_r7", 2200));

    let summary = job_for(&h, EventSender::new(tx)).run_once().await.unwrap();

    assert_eq!(summary.scanned, 0);
    assert!(h.queue.is_empty());
}

#[tokio::test]
async fn test_recovery_flagged_order_is_requeued_and_cleared() {
    let h = harness();
    let (tx, _rx) = tokio::sync::mpsc::channel(16);

    let mut flagged = pending_order(Uuid::new_v4(), "auth_r8", 2200);
    // Young order: only the recovery pass may pick it up.
    flagged.created_at = Utc::now() - Duration::minutes(5);
    flagged.metadata = serde_json::json!({
        "authorization_id": "auth_r8",
        "needs_capture_recovery": true,
        "recovery_reason": "queue unreachable at submission",
    });
    let order_id = flagged.id;
    h.store.insert_order(flagged, vec![]);
    h.gateway.insert_authorization(authorization("auth_r8", 2200));

    let summary = job_for(&h, EventSender::new(tx)).run_once().await.unwrap();

    assert_eq!(summary.recovery_cleared, 1);
    assert_eq!(h.queue.job_ids(), vec![capture_job_id(order_id)]);

    let metadata = h.store.get_order(order_id).unwrap().order.order_metadata();
    assert!(!metadata.needs_capture_recovery);
    assert_eq!(metadata.recovery_reason, None);
}

#[tokio::test]
async fn test_unreachable_broker_aborts_without_touching_orders() {
    let h = harness();
    let (tx, _rx) = tokio::sync::mpsc::channel(16);

    let mut flagged = stale_order("auth_r9");
    flagged.metadata = serde_json::json!({
        "authorization_id": "auth_r9",
        "needs_capture_recovery": true,
    });
    let order_id = flagged.id;
    h.store.insert_order(flagged, vec![]);
    h.gateway.insert_authorization(authorization("auth_r9", 2200));
    h.queue.set_unavailable(true);

    let err = job_for(&h, EventSender::new(tx)).run_once().await.unwrap_err();
    assert_matches!(err, ServiceError::QueueUnavailable(_));

    // The flag must survive: nothing was provably scheduled.
    let metadata = h.store.get_order(order_id).unwrap().order.order_metadata();
    assert!(metadata.needs_capture_recovery);
}
