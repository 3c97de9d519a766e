use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The kinds of work the pool knows how to dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    StepExecution,
    TriggerEvaluation,
    AbTestEvaluation,
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            JobKind::StepExecution => "step_execution",
            JobKind::TriggerEvaluation => "trigger_evaluation",
            JobKind::AbTestEvaluation => "ab_test_evaluation",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Waiting,
    Active,
    Completed,
    Failed,
}

/// A durable unit of scheduled work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueJob {
    pub id: Uuid,
    pub kind: JobKind,
    pub payload: serde_json::Value,
    pub priority: i32,
    pub not_before: DateTime<Utc>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub state: JobState,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Payload of a `StepExecution` job. Carries the automation id so that
/// pause-time cancellation can match by predicate without loading the
/// execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecutionPayload {
    pub execution_id: Uuid,
    pub automation_id: Uuid,
}

/// Builder-style description of a job to enqueue.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub kind: JobKind,
    pub payload: serde_json::Value,
    pub priority: i32,
    pub not_before: Option<DateTime<Utc>>,
    pub max_attempts: u32,
}

impl NewJob {
    pub fn new(kind: JobKind, payload: serde_json::Value) -> Self {
        Self {
            kind,
            payload,
            priority: 0,
            not_before: None,
            max_attempts: 3,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn not_before(mut self, at: DateTime<Utc>) -> Self {
        self.not_before = Some(at);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }
}

/// Per-kind queue depth counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindStats {
    pub waiting: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
}

/// Queue metrics broken down by job kind.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStats {
    pub per_kind: HashMap<JobKind, KindStats>,
}

impl QueueStats {
    pub fn kind(&self, kind: JobKind) -> KindStats {
        self.per_kind.get(&kind).copied().unwrap_or_default()
    }

    pub fn total_waiting(&self) -> usize {
        self.per_kind.values().map(|s| s.waiting).sum()
    }
}
