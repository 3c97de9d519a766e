use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::predicates::PredicateGroup;

/// An automation definition: a trigger plus a directed step graph that
/// subscribers walk one step at a time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Automation {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub status: AutomationStatus,
    pub trigger: Trigger,
    /// Additional gate evaluated before an execution is created.
    pub entry_condition: Option<PredicateGroup>,
    pub entry_step_id: Uuid,
    pub steps: HashMap<Uuid, Step>,
    /// When false (the default), a subscriber with a non-terminal execution
    /// for this automation is not entered a second time.
    pub allow_re_entry: bool,
    /// Cyclic graphs are rejected at activation unless this cap is set; the
    /// engine then fails any execution that exceeds it.
    pub max_iterations: Option<u32>,
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Automation {
    pub fn step(&self, id: &Uuid) -> Option<&Step> {
        self.steps.get(id)
    }
}

/// Lifecycle status of an automation definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutomationStatus {
    Draft,
    Active,
    Paused,
    Completed,
    Archived,
}

/// What creates executions for an automation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trigger {
    pub kind: TriggerKind,
    /// Event name for event/behavior/time-based triggers; attribute name
    /// for attribute triggers.
    pub event: String,
    /// Optional filter evaluated against the event payload merged with
    /// subscriber attributes.
    pub filter: Option<PredicateGroup>,
    /// Only meaningful for attribute triggers.
    pub change: Option<AttributeChange>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Event,
    Behavior,
    TimeBased,
    Attribute,
}

/// Which attribute transitions fire an attribute trigger.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum AttributeChange {
    Any,
    Specific {
        old_value: serde_json::Value,
        new_value: serde_json::Value,
    },
}

/// A single node in the step graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: Uuid,
    pub kind: StepKind,
}

/// Tagged per-kind configuration. Dispatch matches exhaustively, so an
/// unknown step kind cannot reach the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum StepKind {
    SendMessage {
        template_id: String,
        /// When set and the campaign has a running A/B test, variant
        /// selection overrides `template_id`.
        campaign_id: Option<Uuid>,
        next_step: Uuid,
    },
    Delay {
        duration_secs: u64,
        next_step: Uuid,
    },
    Condition {
        predicate: PredicateGroup,
        on_true: Uuid,
        on_false: Uuid,
    },
    Split {
        arms: Vec<SplitArm>,
    },
    Exit,
}

impl StepKind {
    pub fn label(&self) -> &'static str {
        match self {
            StepKind::SendMessage { .. } => "send_message",
            StepKind::Delay { .. } => "delay",
            StepKind::Condition { .. } => "condition",
            StepKind::Split { .. } => "split",
            StepKind::Exit => "exit",
        }
    }

    /// Step ids this step can transition to.
    pub fn transitions(&self) -> Vec<Uuid> {
        match self {
            StepKind::SendMessage { next_step, .. } | StepKind::Delay { next_step, .. } => {
                vec![*next_step]
            }
            StepKind::Condition {
                on_true, on_false, ..
            } => vec![*on_true, *on_false],
            StepKind::Split { arms } => arms.iter().map(|a| a.next_step).collect(),
            StepKind::Exit => Vec::new(),
        }
    }
}

/// One weighted arm of a traffic split.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitArm {
    pub next_step: Uuid,
    pub percentage: u8,
}

/// One subscriber's live progress through an automation's step graph.
/// Mutated only by the execution engine; terminal states are immutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: Uuid,
    pub automation_id: Uuid,
    pub subscriber_id: String,
    pub current_step_id: Uuid,
    pub status: ExecutionStatus,
    /// Set while waiting on a delay step.
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Accumulated key/value data visible to later steps.
    pub context: serde_json::Value,
    pub attempt_count: u32,
    pub last_error: Option<StepError>,
    pub step_history: Vec<StepRecord>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Execution {
    pub fn new(automation_id: Uuid, subscriber_id: &str, entry_step_id: Uuid, context: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            automation_id,
            subscriber_id: subscriber_id.to_string(),
            current_step_id: entry_step_id,
            status: ExecutionStatus::Pending,
            scheduled_at: None,
            context,
            attempt_count: 0,
            last_error: None,
            step_history: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Runtime status of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Waiting,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }
}

/// Persisted failure detail. Always carries the execution id, step id and
/// attempt count for diagnosability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepError {
    pub execution_id: Uuid,
    pub step_id: Uuid,
    pub attempts: u32,
    pub message: String,
}

/// Record of a step that has run for an execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub step_id: Uuid,
    pub step_kind: String,
    pub executed_at: DateTime<Utc>,
    pub outcome: String,
}

/// A subscriber snapshot as returned by the external subscriber store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscriber {
    pub id: String,
    /// Flat attribute object (plan, country, lifecycle fields, ...).
    pub attributes: serde_json::Value,
}

/// Query for paging through executions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionQuery {
    pub automation_id: Option<Uuid>,
    pub subscriber_id: Option<String>,
    pub status: Option<ExecutionStatus>,
    pub page: Option<usize>,
    pub limit: Option<usize>,
}

/// One page of executions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPage {
    pub executions: Vec<Execution>,
    pub total: usize,
    pub page: usize,
    pub limit: usize,
    pub total_pages: usize,
}
