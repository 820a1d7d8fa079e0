// ============================================================================
// Task Queue
// ============================================================================
//
// Durable-job contract the withdrawal worker runs on. Jobs are keyed by an
// idempotency key: enqueueing a key that is queued, in flight, or finished
// within the retention window is a no-op. A failed job is retried with
// exponential backoff until its attempts run out, then dead-lettered and kept
// for inspection (the most recent MAX_DEAD_LETTERS only).
//
// ============================================================================

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

/// How long a finished job key keeps collapsing duplicates
pub const DEFAULT_KEY_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

pub const MAX_DEAD_LETTERS: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobRetryPolicy {
    /// Total attempts before dead-lettering, including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for JobRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(300),
        }
    }
}

impl JobRetryPolicy {
    /// `base × 2^(attempt−1)`, capped at `max_delay`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        self.base_delay.saturating_mul(1u32 << exp).min(self.max_delay)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueuedJob<T> {
    pub id: String,
    pub payload: T,
    /// Failed attempts so far
    pub attempts: u32,
    pub last_error: Option<String>,
    #[serde(skip)]
    available_at: Option<Instant>,
}

impl<T> QueuedJob<T> {
    fn new(id: &str, payload: T) -> Self {
        Self { id: id.to_string(), payload, attempts: 0, last_error: None, available_at: None }
    }

    fn is_due(&self, now: Instant) -> bool {
        self.available_at.map_or(true, |at| at <= now)
    }
}

/// What the queue did with a failed job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobDisposition {
    Retrying { attempt: u32, delay_ms: u64 },
    DeadLettered { attempts: u32 },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub queued: usize,
    pub in_flight: usize,
    pub completed: usize,
    pub dead_lettered: usize,
}

#[async_trait]
pub trait TaskQueue<T: Clone + Send + Sync + 'static>: Send + Sync {
    /// Add a job; false when the key is queued, in flight, or recently finished
    async fn enqueue(&self, job_id: &str, payload: T) -> bool;

    /// Take the oldest due job, if any
    async fn claim(&self) -> Option<QueuedJob<T>>;

    async fn complete(&self, job_id: &str);

    /// Record a failure; `retryable = false` dead-letters immediately
    async fn fail(&self, job_id: &str, error: &str, retryable: bool) -> JobDisposition;

    /// Wait until a job may be available or `max_wait` passes
    async fn wait(&self, max_wait: Duration);

    async fn dead_letters(&self) -> Vec<QueuedJob<T>>;

    async fn stats(&self) -> QueueStats;
}

// ============================================================================
// IN-MEMORY QUEUE
// ============================================================================

struct QueueState<T> {
    ready: VecDeque<QueuedJob<T>>,
    in_flight: HashMap<String, QueuedJob<T>>,
    dead: VecDeque<QueuedJob<T>>,
    /// Keys queued or in flight
    active: HashSet<String>,
    /// Completed or dead-lettered keys, with when they finished
    finished: HashMap<String, Instant>,
    completed: usize,
}

impl<T> QueueState<T> {
    fn finish(&mut self, job_id: &str) {
        self.active.remove(job_id);
        self.finished.insert(job_id.to_string(), Instant::now());
    }

    fn prune(&mut self, retention: Duration) {
        let now = Instant::now();
        self.finished.retain(|_, at| *at + retention > now);
    }
}

pub struct MemoryTaskQueue<T> {
    policy: JobRetryPolicy,
    retention: Duration,
    state: Mutex<QueueState<T>>,
    notify: Notify,
}

impl<T> MemoryTaskQueue<T> {
    pub fn new(policy: JobRetryPolicy) -> Self {
        Self {
            policy,
            retention: DEFAULT_KEY_RETENTION,
            state: Mutex::new(QueueState {
                ready: VecDeque::new(),
                in_flight: HashMap::new(),
                dead: VecDeque::new(),
                active: HashSet::new(),
                finished: HashMap::new(),
                completed: 0,
            }),
            notify: Notify::new(),
        }
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn policy(&self) -> &JobRetryPolicy {
        &self.policy
    }

    /// Keys currently collapsing duplicates
    pub async fn tracked_keys(&self) -> usize {
        let mut state = self.state.lock().await;
        state.prune(self.retention);
        state.active.len() + state.finished.len()
    }
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> TaskQueue<T> for MemoryTaskQueue<T> {
    async fn enqueue(&self, job_id: &str, payload: T) -> bool {
        let mut state = self.state.lock().await;
        state.prune(self.retention);
        if state.active.contains(job_id) || state.finished.contains_key(job_id) {
            tracing::debug!(job_id, "duplicate job collapsed");
            return false;
        }
        state.active.insert(job_id.to_string());
        state.ready.push_back(QueuedJob::new(job_id, payload));
        drop(state);
        self.notify.notify_one();
        true
    }

    async fn claim(&self) -> Option<QueuedJob<T>> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let index = state.ready.iter().position(|job| job.is_due(now))?;
        let job = state.ready.remove(index)?;
        state.in_flight.insert(job.id.clone(), job.clone());
        Some(job)
    }

    async fn complete(&self, job_id: &str) {
        let mut state = self.state.lock().await;
        if state.in_flight.remove(job_id).is_some() {
            state.completed += 1;
            state.finish(job_id);
        }
    }

    async fn fail(&self, job_id: &str, error: &str, retryable: bool) -> JobDisposition {
        let mut state = self.state.lock().await;
        let Some(mut job) = state.in_flight.remove(job_id) else {
            return JobDisposition::DeadLettered { attempts: 0 };
        };
        job.attempts += 1;
        job.last_error = Some(error.to_string());

        if !retryable || job.attempts >= self.policy.max_attempts {
            let attempts = job.attempts;
            tracing::error!(job_id, attempts, error, "job dead-lettered");
            state.finish(job_id);
            state.dead.push_back(job);
            if state.dead.len() > MAX_DEAD_LETTERS {
                state.dead.pop_front();
            }
            return JobDisposition::DeadLettered { attempts };
        }

        let delay = self.policy.backoff(job.attempts);
        job.available_at = Some(Instant::now() + delay);
        let attempt = job.attempts;
        state.ready.push_back(job);
        drop(state);
        self.notify.notify_one();
        tracing::warn!(job_id, attempt, ?delay, error, "job failed, retrying");
        JobDisposition::Retrying { attempt, delay_ms: delay.as_millis() as u64 }
    }

    async fn wait(&self, max_wait: Duration) {
        let next_due = {
            let state = self.state.lock().await;
            state.ready.iter().map(|j| j.available_at.unwrap_or_else(Instant::now)).min()
        };
        let wait = match next_due {
            Some(at) => at.saturating_duration_since(Instant::now()).min(max_wait),
            None => max_wait,
        };
        if wait.is_zero() {
            return;
        }
        let _ = tokio::time::timeout(wait, self.notify.notified()).await;
    }

    async fn dead_letters(&self) -> Vec<QueuedJob<T>> {
        self.state.lock().await.dead.iter().cloned().collect()
    }

    async fn stats(&self) -> QueueStats {
        let state = self.state.lock().await;
        QueueStats {
            queued: state.ready.len(),
            in_flight: state.in_flight.len(),
            completed: state.completed,
            dead_lettered: state.dead.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instant_retries(max_attempts: u32) -> JobRetryPolicy {
        JobRetryPolicy { max_attempts, base_delay: Duration::ZERO, max_delay: Duration::ZERO }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = JobRetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
        };
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(3), Duration::from_secs(4));
        assert_eq!(policy.backoff(9), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_duplicate_keys_collapse() {
        let queue = MemoryTaskQueue::new(instant_retries(3));
        assert!(queue.enqueue("k1", 50u64).await);
        assert!(!queue.enqueue("k1", 50u64).await);
        assert_eq!(queue.stats().await.queued, 1);

        let job = queue.claim().await.unwrap();
        queue.complete(&job.id).await;
        assert!(!queue.enqueue("k1", 50u64).await);
        assert!(queue.claim().await.is_none());
    }

    #[tokio::test]
    async fn test_retry_then_dead_letter() {
        let queue = MemoryTaskQueue::new(instant_retries(2));
        queue.enqueue("k1", "payload").await;

        let job = queue.claim().await.unwrap();
        let first = queue.fail(&job.id, "provider down", true).await;
        assert!(matches!(first, JobDisposition::Retrying { attempt: 1, .. }));

        let job = queue.claim().await.unwrap();
        assert_eq!(job.attempts, 1);
        let second = queue.fail(&job.id, "provider down", true).await;
        assert_eq!(second, JobDisposition::DeadLettered { attempts: 2 });

        let dead = queue.dead_letters().await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].last_error.as_deref(), Some("provider down"));
        assert!(queue.claim().await.is_none());
    }

    #[tokio::test]
    async fn test_finished_keys_expire_after_retention() {
        let queue = MemoryTaskQueue::new(instant_retries(1)).with_retention(Duration::ZERO);
        queue.enqueue("k1", 1u8).await;
        queue.enqueue("k2", 2u8).await;
        assert_eq!(queue.tracked_keys().await, 2);

        let job = queue.claim().await.unwrap();
        queue.complete(&job.id).await;
        let job = queue.claim().await.unwrap();
        queue.fail(&job.id, "rejected", false).await;
        assert_eq!(queue.tracked_keys().await, 0);

        assert!(queue.enqueue("k1", 1u8).await);
        assert!(!queue.enqueue("k1", 1u8).await);
    }

    #[test]
    fn test_permanent_failure_skips_retries() {
        let queue = MemoryTaskQueue::new(instant_retries(5));
        let disposition = tokio_test::block_on(async {
            queue.enqueue("k1", 1u8).await;
            let job = queue.claim().await.unwrap();
            queue.fail(&job.id, "conflict", false).await
        });
        assert_eq!(disposition, JobDisposition::DeadLettered { attempts: 1 });
        assert_eq!(tokio_test::block_on(queue.stats()).dead_lettered, 1);
    }

    #[tokio::test]
    async fn test_backoff_delays_claim() {
        let policy = JobRetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(60),
        };
        let queue = MemoryTaskQueue::new(policy);
        queue.enqueue("k1", ()).await;
        let job = queue.claim().await.unwrap();
        queue.fail(&job.id, "timeout", true).await;
        assert!(queue.claim().await.is_none());
        assert_eq!(queue.stats().await.queued, 1);
    }
}
