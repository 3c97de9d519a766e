//! In-process [`JobQueue`] implementation: an ordered waiting list under a
//! mutex plus maps of active and terminal jobs. Sufficient for single-node
//! deployments; a broker-backed implementation satisfies the same trait
//! for multi-node ones.

use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use dripflow_core::error::{EngineError, EngineResult};

use crate::job::{JobKind, JobState, NewJob, QueueJob, QueueStats};

pub trait JobQueue: Send + Sync {
    /// Durably stores the job before returning (at-least-once contract).
    fn enqueue(&self, job: NewJob) -> EngineResult<Uuid>;

    /// Jobs whose `not_before <= now`, ordered by priority desc then
    /// `not_before` asc. Returned jobs move to `Active`.
    fn dequeue_ready(&self, max: usize) -> EngineResult<Vec<QueueJob>>;

    fn ack(&self, job_id: Uuid) -> EngineResult<()>;

    /// Reschedules with exponential backoff while attempts remain,
    /// otherwise marks the job failed.
    fn fail(&self, job_id: Uuid, error: &str) -> EngineResult<()>;

    /// Drops waiting jobs matching the predicate; returns how many.
    fn cancel_where(&self, predicate: &dyn Fn(&QueueJob) -> bool) -> EngineResult<usize>;

    fn get(&self, job_id: Uuid) -> Option<QueueJob>;

    fn stats(&self) -> QueueStats;
}

pub struct MemoryJobQueue {
    waiting: Mutex<Vec<QueueJob>>,
    active: DashMap<Uuid, QueueJob>,
    terminal: DashMap<Uuid, QueueJob>,
    retry_delay: Duration,
    retention: Duration,
}

impl MemoryJobQueue {
    pub fn new(retry_delay: Duration, retention: Duration) -> Self {
        Self {
            waiting: Mutex::new(Vec::new()),
            active: DashMap::new(),
            terminal: DashMap::new(),
            retry_delay,
            retention,
        }
    }

    /// Drops terminal jobs older than the retention window. Returns how
    /// many were removed.
    pub fn sweep_expired(&self) -> usize {
        let cutoff = Utc::now() - chrono::Duration::from_std(self.retention).unwrap_or_default();
        let expired: Vec<Uuid> = self
            .terminal
            .iter()
            .filter(|entry| entry.finished_at.map(|t| t < cutoff).unwrap_or(false))
            .map(|entry| entry.id)
            .collect();
        for id in &expired {
            self.terminal.remove(id);
        }
        if !expired.is_empty() {
            debug!(count = expired.len(), "Swept expired terminal jobs");
        }
        expired.len()
    }

    fn backoff_for(&self, attempts: u32) -> chrono::Duration {
        let factor = 2u32.saturating_pow(attempts.saturating_sub(1)).min(64);
        chrono::Duration::from_std(self.retry_delay * factor).unwrap_or(chrono::Duration::zero())
    }
}

impl Default for MemoryJobQueue {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(3600))
    }
}

impl JobQueue for MemoryJobQueue {
    fn enqueue(&self, job: NewJob) -> EngineResult<Uuid> {
        let id = Uuid::new_v4();
        let queued = QueueJob {
            id,
            kind: job.kind,
            payload: job.payload,
            priority: job.priority,
            not_before: job.not_before.unwrap_or_else(Utc::now),
            attempts: 0,
            max_attempts: job.max_attempts,
            state: JobState::Waiting,
            last_error: None,
            created_at: Utc::now(),
            finished_at: None,
        };
        metrics::counter!("queue.enqueued", "kind" => queued.kind.to_string()).increment(1);
        debug!(job_id = %id, kind = %queued.kind, not_before = %queued.not_before, "Job enqueued");
        self.waiting.lock().push(queued);
        Ok(id)
    }

    fn dequeue_ready(&self, max: usize) -> EngineResult<Vec<QueueJob>> {
        let now = Utc::now();
        let mut waiting = self.waiting.lock();
        waiting.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.not_before.cmp(&b.not_before))
        });

        let mut dispatched = Vec::new();
        let mut index = 0;
        while index < waiting.len() && dispatched.len() < max {
            if waiting[index].not_before <= now {
                let mut job = waiting.remove(index);
                job.state = JobState::Active;
                job.attempts += 1;
                self.active.insert(job.id, job.clone());
                dispatched.push(job);
            } else {
                index += 1;
            }
        }
        Ok(dispatched)
    }

    fn ack(&self, job_id: Uuid) -> EngineResult<()> {
        let (_, mut job) = self
            .active
            .remove(&job_id)
            .ok_or_else(|| EngineError::NotFound(format!("Active job {job_id}")))?;
        job.state = JobState::Completed;
        job.finished_at = Some(Utc::now());
        metrics::counter!("queue.completed", "kind" => job.kind.to_string()).increment(1);
        self.terminal.insert(job_id, job);
        Ok(())
    }

    fn fail(&self, job_id: Uuid, error: &str) -> EngineResult<()> {
        let (_, mut job) = self
            .active
            .remove(&job_id)
            .ok_or_else(|| EngineError::NotFound(format!("Active job {job_id}")))?;
        job.last_error = Some(error.to_string());

        if job.attempts < job.max_attempts {
            job.state = JobState::Waiting;
            job.not_before = Utc::now() + self.backoff_for(job.attempts);
            debug!(
                job_id = %job_id,
                attempts = job.attempts,
                retry_at = %job.not_before,
                "Job rescheduled with backoff"
            );
            metrics::counter!("queue.retried", "kind" => job.kind.to_string()).increment(1);
            self.waiting.lock().push(job);
        } else {
            warn!(job_id = %job_id, attempts = job.attempts, error = %error, "Job failed permanently");
            job.state = JobState::Failed;
            job.finished_at = Some(Utc::now());
            metrics::counter!("queue.failed", "kind" => job.kind.to_string()).increment(1);
            self.terminal.insert(job_id, job);
        }
        Ok(())
    }

    fn cancel_where(&self, predicate: &dyn Fn(&QueueJob) -> bool) -> EngineResult<usize> {
        let mut waiting = self.waiting.lock();
        let before = waiting.len();
        waiting.retain(|job| !predicate(job));
        let cancelled = before - waiting.len();
        if cancelled > 0 {
            debug!(count = cancelled, "Cancelled waiting jobs");
        }
        Ok(cancelled)
    }

    fn get(&self, job_id: Uuid) -> Option<QueueJob> {
        if let Some(job) = self.active.get(&job_id) {
            return Some(job.clone());
        }
        if let Some(job) = self.terminal.get(&job_id) {
            return Some(job.clone());
        }
        self.waiting.lock().iter().find(|j| j.id == job_id).cloned()
    }

    fn stats(&self) -> QueueStats {
        let mut stats = QueueStats::default();
        for job in self.waiting.lock().iter() {
            stats.per_kind.entry(job.kind).or_default().waiting += 1;
        }
        for entry in self.active.iter() {
            stats.per_kind.entry(entry.kind).or_default().active += 1;
        }
        for entry in self.terminal.iter() {
            let kind_stats = stats.per_kind.entry(entry.kind).or_default();
            match entry.state {
                JobState::Completed => kind_stats.completed += 1,
                JobState::Failed => kind_stats.failed += 1,
                _ => {}
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn queue() -> MemoryJobQueue {
        MemoryJobQueue::new(Duration::from_millis(100), Duration::from_secs(60))
    }

    #[test]
    fn dequeue_orders_by_priority_then_schedule() {
        let q = queue();
        let low = q
            .enqueue(NewJob::new(JobKind::StepExecution, json!({"n": 1})).with_priority(1))
            .unwrap();
        let high = q
            .enqueue(NewJob::new(JobKind::StepExecution, json!({"n": 2})).with_priority(5))
            .unwrap();

        let ready = q.dequeue_ready(10).unwrap();
        assert_eq!(ready.len(), 2);
        assert_eq!(ready[0].id, high);
        assert_eq!(ready[1].id, low);
        assert!(ready.iter().all(|j| j.state == JobState::Active));
    }

    #[test]
    fn future_jobs_are_not_dispatched_early() {
        let q = queue();
        q.enqueue(
            NewJob::new(JobKind::StepExecution, json!({}))
                .not_before(Utc::now() + chrono::Duration::hours(1)),
        )
        .unwrap();

        assert!(q.dequeue_ready(10).unwrap().is_empty());
        let stats = q.stats();
        assert_eq!(stats.kind(JobKind::StepExecution).waiting, 1);
    }

    #[test]
    fn fail_reschedules_with_backoff_until_exhausted() {
        let q = queue();
        let id = q
            .enqueue(NewJob::new(JobKind::StepExecution, json!({})).with_max_attempts(2))
            .unwrap();

        // First attempt fails -> rescheduled.
        let job = q.dequeue_ready(1).unwrap().remove(0);
        assert_eq!(job.attempts, 1);
        q.fail(id, "transport unavailable").unwrap();
        let rescheduled = q.get(id).unwrap();
        assert_eq!(rescheduled.state, JobState::Waiting);
        assert!(rescheduled.not_before > Utc::now() - chrono::Duration::seconds(1));

        // Second attempt exhausts max_attempts -> failed.
        std::thread::sleep(Duration::from_millis(150));
        let job = q.dequeue_ready(1).unwrap().remove(0);
        assert_eq!(job.attempts, 2);
        q.fail(id, "transport unavailable").unwrap();
        let failed = q.get(id).unwrap();
        assert_eq!(failed.state, JobState::Failed);
        assert_eq!(failed.last_error.as_deref(), Some("transport unavailable"));
    }

    #[test]
    fn ack_moves_job_to_completed() {
        let q = queue();
        let id = q.enqueue(NewJob::new(JobKind::TriggerEvaluation, json!({}))).unwrap();
        q.dequeue_ready(1).unwrap();
        q.ack(id).unwrap();

        let stats = q.stats();
        assert_eq!(stats.kind(JobKind::TriggerEvaluation).completed, 1);
        assert_eq!(stats.kind(JobKind::TriggerEvaluation).active, 0);
    }

    #[test]
    fn cancel_by_predicate_removes_waiting_jobs() {
        let q = queue();
        let automation = Uuid::new_v4();
        q.enqueue(NewJob::new(
            JobKind::StepExecution,
            json!({"automation_id": automation}),
        ))
        .unwrap();
        q.enqueue(NewJob::new(
            JobKind::StepExecution,
            json!({"automation_id": Uuid::new_v4()}),
        ))
        .unwrap();

        let cancelled = q
            .cancel_where(&|job| {
                job.payload.get("automation_id").and_then(|v| v.as_str())
                    == Some(automation.to_string().as_str())
            })
            .unwrap();
        assert_eq!(cancelled, 1);
        assert_eq!(q.stats().kind(JobKind::StepExecution).waiting, 1);
    }

    #[test]
    fn retention_sweep_drops_old_terminal_jobs() {
        let q = MemoryJobQueue::new(Duration::from_millis(10), Duration::from_millis(0));
        let id = q.enqueue(NewJob::new(JobKind::StepExecution, json!({}))).unwrap();
        q.dequeue_ready(1).unwrap();
        q.ack(id).unwrap();

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(q.sweep_expired(), 1);
        assert!(q.get(id).is_none());
    }
}
