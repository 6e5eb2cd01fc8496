/*!
 * # Fallback Reconciliation Job
 *
 * Hourly scan that finds orders whose authorization still needs capture
 * but whose capture job is missing or finished without capturing, and
 * re-drives the capture through the same queue the request path uses.
 * A failed job is alerted on, never blindly re-run.
 */

use chrono::{Duration as ChronoDuration, Timelike, Utc};
use metrics::counter;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info, instrument, warn};

use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::gateway::AuthorizationGateway;
use crate::queue::{capture_job_id, CaptureJobPayload, CaptureQueue, JobState};
use crate::store::OrderStore;

pub const RECOVERY_SOURCE: &str = "reconciliation";

/// Per-run accounting, exposed for observability and tests.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconciliationSummary {
    pub scanned: usize,
    pub requeued: usize,
    pub alerts: usize,
    pub skipped_in_flight: usize,
    pub skipped_resolved: usize,
    pub recovery_cleared: usize,
    pub errors: usize,
}

pub struct ReconciliationJob {
    store: Arc<dyn OrderStore>,
    gateway: Arc<dyn AuthorizationGateway>,
    queue: Arc<dyn CaptureQueue>,
    events: EventSender,
    /// Orders younger than this are left to the normal capture path.
    staleness: ChronoDuration,
}

impl ReconciliationJob {
    pub fn new(
        store: Arc<dyn OrderStore>,
        gateway: Arc<dyn AuthorizationGateway>,
        queue: Arc<dyn CaptureQueue>,
        events: EventSender,
        staleness_minutes: i64,
    ) -> Self {
        Self {
            store,
            gateway,
            queue,
            events,
            staleness: ChronoDuration::minutes(staleness_minutes),
        }
    }

    /// One reconciliation pass. If the broker is unreachable the run
    /// aborts without touching any order: an order must never be marked
    /// handled unless a job was provably scheduled.
    #[instrument(skip(self))]
    pub async fn run_once(&self) -> Result<ReconciliationSummary, ServiceError> {
        if let Err(e) = self.queue.ping().await {
            error!(error = %e, "capture queue unreachable; skipping reconciliation run");
            return Err(ServiceError::QueueUnavailable(e.to_string()));
        }

        let mut summary = ReconciliationSummary::default();
        let cutoff = Utc::now() - self.staleness;

        for order in self.store.stale_authorized_orders(cutoff).await? {
            let metadata = order.order_metadata();
            let Some(authorization_id) = metadata.authorization_id else {
                continue;
            };
            summary.scanned += 1;

            let authorization = match self.gateway.retrieve(&authorization_id).await {
                Ok(auth) => auth,
                Err(e) => {
                    warn!(
                        order_id = %order.id,
                        authorization_id = %authorization_id,
                        error = %e,
                        "failed to retrieve authorization; leaving order for the next run"
                    );
                    summary.errors += 1;
                    continue;
                }
            };
            if !authorization.requires_capture() {
                summary.skipped_resolved += 1;
                continue;
            }

            let job_id = capture_job_id(order.id);
            let job_state = self
                .queue
                .job_state(&job_id)
                .await
                .map_err(|e| ServiceError::QueueUnavailable(e.to_string()))?;
            match job_state {
                state if state.is_in_flight() => {
                    summary.skipped_in_flight += 1;
                }
                JobState::Failed => {
                    // Re-running a failed capture without diagnosis risks
                    // double-submission; a human gets the alert instead.
                    counter!("order_edit.reconciliation.alerts", 1);
                    error!(
                        critical = true,
                        order_id = %order.id,
                        authorization_id = %authorization_id,
                        "capture job failed; not re-queuing automatically"
                    );
                    if let Err(e) = self
                        .events
                        .send(Event::CaptureFailedAlert {
                            order_id: order.id,
                            authorization_id: authorization_id.clone(),
                        })
                        .await
                    {
                        warn!(error = %e, order_id = %order.id, "failed to send capture alert event");
                    }
                    summary.alerts += 1;
                }
                JobState::Missing | JobState::Completed => {
                    self.enqueue_capture(order.id, &authorization_id).await?;
                    summary.requeued += 1;
                }
                // Covered by the in-flight guard above.
                JobState::Waiting | JobState::Active | JobState::Delayed => unreachable!(),
            }
        }

        // Second pass: orders flagged because an earlier submission
        // could not reach the queue at all.
        for order in self.store.recovery_flagged_orders().await? {
            let mut metadata = order.order_metadata();
            let Some(authorization_id) = metadata.authorization_id.clone() else {
                warn!(order_id = %order.id, "recovery flag set but no authorization id; skipping");
                continue;
            };

            match self.enqueue_capture(order.id, &authorization_id).await {
                Ok(()) => {
                    metadata.needs_capture_recovery = false;
                    metadata.recovery_reason = None;
                    self.store.update_metadata(order.id, &metadata).await?;
                    summary.recovery_cleared += 1;
                }
                Err(e) => {
                    warn!(
                        order_id = %order.id,
                        error = %e,
                        "failed to re-queue capture for flagged order; flag retained"
                    );
                    summary.errors += 1;
                }
            }
        }

        info!(
            scanned = summary.scanned,
            requeued = summary.requeued,
            alerts = summary.alerts,
            recovery_cleared = summary.recovery_cleared,
            "reconciliation run finished"
        );
        Ok(summary)
    }

    async fn enqueue_capture(
        &self,
        order_id: uuid::Uuid,
        authorization_id: &str,
    ) -> Result<(), ServiceError> {
        let payload = CaptureJobPayload {
            order_id,
            authorization_id: authorization_id.to_string(),
            scheduled_at: Utc::now(),
            source: Some(RECOVERY_SOURCE.to_string()),
        };
        self.queue
            .enqueue(payload, None)
            .await
            .map_err(|e| ServiceError::QueueUnavailable(e.to_string()))?;

        counter!("order_edit.reconciliation.requeued", 1);
        info!(order_id = %order_id, "capture job re-queued");
        if let Err(e) = self
            .events
            .send(Event::CaptureRequeued {
                order_id,
                source: RECOVERY_SOURCE.to_string(),
            })
            .await
        {
            warn!(error = %e, order_id = %order_id, "failed to send requeue event");
        }
        Ok(())
    }
}

/// Seconds until the next top of the hour; runs fire at minute 0.
fn seconds_until_next_hour(now: chrono::DateTime<Utc>) -> u64 {
    let elapsed = u64::from(now.minute()) * 60 + u64::from(now.second());
    3600 - elapsed.min(3599)
}

/// Scheduler loop; spawn once from the process entry point. Overlapping
/// runs are prevented by this loop being the only driver.
pub async fn run_scheduler(job: Arc<ReconciliationJob>) {
    loop {
        let wait = seconds_until_next_hour(Utc::now());
        sleep(Duration::from_secs(wait)).await;

        if let Err(e) = job.run_once().await {
            error!(error = %e, "reconciliation run failed");
        }
    }
}
