/*!
 * # Capture Queue Adapter
 *
 * Deduplicated, optionally delayed submission of capture jobs, plus job
 * state lookup. Deduplication is by job id: every capture job for an
 * order is keyed `capture-<orderId>`, so resubmission collides instead
 * of double-scheduling.
 */

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Capture queue errors.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("queue unavailable: {0}")]
    Unavailable(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("job '{job_id}' is {state} and cannot be removed")]
    RemovalRejected { job_id: String, state: JobState },
}

impl From<redis::RedisError> for QueueError {
    fn from(err: redis::RedisError) -> Self {
        QueueError::Unavailable(err.to_string())
    }
}

/// Lifecycle state of a capture job, as reported by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobState {
    Waiting,
    Active,
    Delayed,
    Completed,
    Failed,
    /// The job was never submitted (or has been removed).
    Missing,
}

impl JobState {
    /// States in which the job is still scheduled to run.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, JobState::Waiting | JobState::Active | JobState::Delayed)
    }
}

/// Payload carried by a capture job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureJobPayload {
    pub order_id: Uuid,
    pub authorization_id: String,
    pub scheduled_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// Stable per-order job id; collisions are the deduplication mechanism.
pub fn capture_job_id(order_id: Uuid) -> String {
    format!("capture-{order_id}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued,
    /// An in-flight job with the same id already exists.
    Deduplicated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    Removed,
    /// No scheduled job existed; for cancellation purposes this is success.
    NotFound,
}

/// Capture queue operations the saga and the reconciliation job depend on.
#[async_trait]
pub trait CaptureQueue: Send + Sync {
    /// Broker reachability probe. Callers that cannot prove scheduling
    /// must abstain rather than guess.
    async fn ping(&self) -> Result<(), QueueError>;

    async fn enqueue(
        &self,
        payload: CaptureJobPayload,
        delay: Option<Duration>,
    ) -> Result<EnqueueOutcome, QueueError>;

    async fn job_state(&self, job_id: &str) -> Result<JobState, QueueError>;

    /// Remove a scheduled job. An `active` job cannot be confirmed
    /// stopped and is rejected.
    async fn remove(&self, job_id: &str) -> Result<RemoveOutcome, QueueError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredJob {
    payload: CaptureJobPayload,
    state: JobState,
    available_at: DateTime<Utc>,
}

/// Redis-backed capture queue.
///
/// Jobs live at `<ns>:job:<jobId>` with a scheduling zset at
/// `<ns>:scheduled`; the capture worker consuming them is a separate
/// process.
pub struct RedisCaptureQueue {
    client: Arc<redis::Client>,
    namespace: String,
}

impl RedisCaptureQueue {
    pub fn new(client: Arc<redis::Client>, namespace: String) -> Self {
        Self { client, namespace }
    }

    fn job_key(&self, job_id: &str) -> String {
        format!("{}:job:{}", self.namespace, job_id)
    }

    fn scheduled_key(&self) -> String {
        format!("{}:scheduled", self.namespace)
    }

    async fn connection(&self) -> Result<redis::aio::Connection, QueueError> {
        Ok(self.client.get_async_connection().await?)
    }

    async fn load(
        &self,
        conn: &mut redis::aio::Connection,
        job_id: &str,
    ) -> Result<Option<StoredJob>, QueueError> {
        let raw: Option<String> = conn.get(self.job_key(job_id)).await?;
        match raw {
            None => Ok(None),
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| QueueError::Serialization(e.to_string())),
        }
    }
}

#[async_trait]
impl CaptureQueue for RedisCaptureQueue {
    async fn ping(&self) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await?;
        Ok(())
    }

    async fn enqueue(
        &self,
        payload: CaptureJobPayload,
        delay: Option<Duration>,
    ) -> Result<EnqueueOutcome, QueueError> {
        let job_id = capture_job_id(payload.order_id);
        let mut conn = self.connection().await?;

        if let Some(existing) = self.load(&mut conn, &job_id).await? {
            if existing.state.is_in_flight() {
                return Ok(EnqueueOutcome::Deduplicated);
            }
        }

        let available_at = Utc::now()
            + chrono::Duration::from_std(delay.unwrap_or_default())
                .unwrap_or_else(|_| chrono::Duration::zero());
        let state = if delay.is_some() {
            JobState::Delayed
        } else {
            JobState::Waiting
        };
        let stored = StoredJob {
            payload,
            state,
            available_at,
        };
        let raw =
            serde_json::to_string(&stored).map_err(|e| QueueError::Serialization(e.to_string()))?;

        conn.set::<_, _, ()>(self.job_key(&job_id), raw).await?;
        conn.zadd::<_, _, _, ()>(self.scheduled_key(), &job_id, available_at.timestamp())
            .await?;
        Ok(EnqueueOutcome::Enqueued)
    }

    async fn job_state(&self, job_id: &str) -> Result<JobState, QueueError> {
        let mut conn = self.connection().await?;
        Ok(self
            .load(&mut conn, job_id)
            .await?
            .map(|job| job.state)
            .unwrap_or(JobState::Missing))
    }

    async fn remove(&self, job_id: &str) -> Result<RemoveOutcome, QueueError> {
        let mut conn = self.connection().await?;
        let Some(job) = self.load(&mut conn, job_id).await? else {
            return Ok(RemoveOutcome::NotFound);
        };

        match job.state {
            JobState::Active => Err(QueueError::RemovalRejected {
                job_id: job_id.to_string(),
                state: job.state,
            }),
            JobState::Waiting | JobState::Delayed => {
                conn.del::<_, ()>(self.job_key(job_id)).await?;
                conn.zrem::<_, _, ()>(self.scheduled_key(), job_id).await?;
                Ok(RemoveOutcome::Removed)
            }
            JobState::Completed | JobState::Failed | JobState::Missing => {
                Ok(RemoveOutcome::NotFound)
            }
        }
    }
}

/// In-memory capture queue, used as process-local fallback and in tests.
#[derive(Clone, Default)]
pub struct InMemoryCaptureQueue {
    jobs: Arc<DashMap<String, StoredJob>>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryCaptureQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a broker outage; every operation fails while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Force a job into a given state (test hook mirroring the broker's
    /// own lifecycle transitions).
    pub fn set_job_state(&self, job_id: &str, state: JobState) {
        if let Some(mut job) = self.jobs.get_mut(job_id) {
            job.state = state;
        } else {
            self.jobs.insert(
                job_id.to_string(),
                StoredJob {
                    payload: CaptureJobPayload {
                        order_id: Uuid::nil(),
                        authorization_id: String::new(),
                        scheduled_at: Utc::now(),
                        source: None,
                    },
                    state,
                    available_at: Utc::now(),
                },
            );
        }
    }

    pub fn job_ids(&self) -> Vec<String> {
        self.jobs.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    fn check_available(&self) -> Result<(), QueueError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(QueueError::Unavailable("broker unreachable".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl CaptureQueue for InMemoryCaptureQueue {
    async fn ping(&self) -> Result<(), QueueError> {
        self.check_available()
    }

    async fn enqueue(
        &self,
        payload: CaptureJobPayload,
        delay: Option<Duration>,
    ) -> Result<EnqueueOutcome, QueueError> {
        self.check_available()?;
        let job_id = capture_job_id(payload.order_id);

        if let Some(existing) = self.jobs.get(&job_id) {
            if existing.state.is_in_flight() {
                return Ok(EnqueueOutcome::Deduplicated);
            }
        }

        let available_at = Utc::now()
            + chrono::Duration::from_std(delay.unwrap_or_default())
                .unwrap_or_else(|_| chrono::Duration::zero());
        let state = if delay.is_some() {
            JobState::Delayed
        } else {
            JobState::Waiting
        };
        self.jobs.insert(
            job_id,
            StoredJob {
                payload,
                state,
                available_at,
            },
        );
        Ok(EnqueueOutcome::Enqueued)
    }

    async fn job_state(&self, job_id: &str) -> Result<JobState, QueueError> {
        self.check_available()?;
        Ok(self
            .jobs
            .get(job_id)
            .map(|job| job.state)
            .unwrap_or(JobState::Missing))
    }

    async fn remove(&self, job_id: &str) -> Result<RemoveOutcome, QueueError> {
        self.check_available()?;
        let Some(state) = self.jobs.get(job_id).map(|job| job.state) else {
            return Ok(RemoveOutcome::NotFound);
        };

        match state {
            JobState::Active => Err(QueueError::RemovalRejected {
                job_id: job_id.to_string(),
                state,
            }),
            JobState::Waiting | JobState::Delayed => {
                self.jobs.remove(job_id);
                Ok(RemoveOutcome::Removed)
            }
            JobState::Completed | JobState::Failed | JobState::Missing => {
                Ok(RemoveOutcome::NotFound)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(order_id: Uuid) -> CaptureJobPayload {
        CaptureJobPayload {
            order_id,
            authorization_id: "auth_1".to_string(),
            scheduled_at: Utc::now(),
            source: Some("checkout".to_string()),
        }
    }

    #[tokio::test]
    async fn test_enqueue_deduplicates_by_job_id() {
        let queue = InMemoryCaptureQueue::new();
        let order_id = Uuid::new_v4();

        let first = queue.enqueue(payload(order_id), None).await.unwrap();
        let second = queue.enqueue(payload(order_id), None).await.unwrap();

        assert_eq!(first, EnqueueOutcome::Enqueued);
        assert_eq!(second, EnqueueOutcome::Deduplicated);
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_completed_job_can_be_resubmitted() {
        let queue = InMemoryCaptureQueue::new();
        let order_id = Uuid::new_v4();
        let job_id = capture_job_id(order_id);

        queue.enqueue(payload(order_id), None).await.unwrap();
        queue.set_job_state(&job_id, JobState::Completed);

        let outcome = queue.enqueue(payload(order_id), None).await.unwrap();
        assert_eq!(outcome, EnqueueOutcome::Enqueued);
        assert_eq!(queue.job_state(&job_id).await.unwrap(), JobState::Waiting);
    }

    #[tokio::test]
    async fn test_job_state_missing_when_never_enqueued() {
        let queue = InMemoryCaptureQueue::new();
        let state = queue.job_state("capture-nope").await.unwrap();
        assert_eq!(state, JobState::Missing);
    }

    #[tokio::test]
    async fn test_remove_rejects_active_job() {
        let queue = InMemoryCaptureQueue::new();
        let order_id = Uuid::new_v4();
        let job_id = capture_job_id(order_id);

        queue.enqueue(payload(order_id), None).await.unwrap();
        queue.set_job_state(&job_id, JobState::Active);

        let err = queue.remove(&job_id).await.unwrap_err();
        assert!(matches!(err, QueueError::RemovalRejected { .. }));
    }

    #[tokio::test]
    async fn test_remove_absent_job_is_not_found() {
        let queue = InMemoryCaptureQueue::new();
        let outcome = queue.remove("capture-gone").await.unwrap();
        assert_eq!(outcome, RemoveOutcome::NotFound);
    }

    #[tokio::test]
    async fn test_unavailable_queue_fails_all_operations() {
        let queue = InMemoryCaptureQueue::new();
        queue.set_unavailable(true);

        assert!(queue.ping().await.is_err());
        assert!(queue.enqueue(payload(Uuid::new_v4()), None).await.is_err());
        assert!(queue.job_state("capture-x").await.is_err());
    }

    #[tokio::test]
    async fn test_delayed_enqueue_is_delayed_state() {
        let queue = InMemoryCaptureQueue::new();
        let order_id = Uuid::new_v4();
        queue
            .enqueue(payload(order_id), Some(Duration::from_secs(3600)))
            .await
            .unwrap();
        assert_eq!(
            queue
                .job_state(&capture_job_id(order_id))
                .await
                .unwrap(),
            JobState::Delayed
        );
    }
}
