//! Service surface consumed by the admin layer. Thin orchestration over
//! the execution engine, the queue, and the A/B test engine; validation
//! errors are returned synchronously and never reach the queue.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use dripflow_abtest::{AbTestEngine, AbTestResult};
use dripflow_core::collaborators::SubscriberStore;
use dripflow_core::error::{EngineError, EngineResult};
use dripflow_core::predicates::PredicateGroup;
use dripflow_core::types::{
    Automation, AutomationStatus, ExecutionPage, ExecutionQuery, ExecutionStatus, Step, Trigger,
};
use dripflow_queue::{JobQueue, QueueStats};

use crate::engine::{ExecutionEngine, SimulationReport};
use crate::validate;

/// Definition accepted by `create_automation`.
#[derive(Debug, Clone)]
pub struct NewAutomation {
    pub name: String,
    pub description: String,
    pub trigger: Trigger,
    pub entry_condition: Option<PredicateGroup>,
    pub entry_step_id: Uuid,
    pub steps: HashMap<Uuid, Step>,
    pub allow_re_entry: bool,
    pub max_iterations: Option<u32>,
}

/// What a pause removed from the system.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct PauseSummary {
    pub jobs_cancelled: usize,
    pub executions_cancelled: usize,
}

/// Aggregate execution counts for one automation.
#[derive(Debug, Clone, Serialize)]
pub struct AutomationAnalytics {
    pub automation_id: Uuid,
    pub total_executions: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub in_progress: usize,
    pub completion_rate: f64,
    /// Times each step has run, across all executions.
    pub step_counts: HashMap<Uuid, usize>,
}

pub struct AutomationService {
    engine: Arc<ExecutionEngine>,
    queue: Arc<dyn JobQueue>,
    subscribers: Arc<dyn SubscriberStore>,
    abtests: Arc<AbTestEngine>,
}

impl AutomationService {
    pub fn new(
        engine: Arc<ExecutionEngine>,
        queue: Arc<dyn JobQueue>,
        subscribers: Arc<dyn SubscriberStore>,
        abtests: Arc<AbTestEngine>,
    ) -> Self {
        Self {
            engine,
            queue,
            subscribers,
            abtests,
        }
    }

    /// Validates the graph and stores the automation as a draft.
    pub fn create_automation(&self, definition: NewAutomation) -> EngineResult<Uuid> {
        let now = Utc::now();
        let automation = Automation {
            id: Uuid::new_v4(),
            name: definition.name,
            description: definition.description,
            status: AutomationStatus::Draft,
            trigger: definition.trigger,
            entry_condition: definition.entry_condition,
            entry_step_id: definition.entry_step_id,
            steps: definition.steps,
            allow_re_entry: definition.allow_re_entry,
            max_iterations: definition.max_iterations,
            version: 1,
            created_at: now,
            updated_at: now,
        };
        validate::validate_graph(&automation)?;
        let id = automation.id;
        info!(automation_id = %id, name = %automation.name, "Automation created");
        self.engine.insert_automation(automation);
        Ok(id)
    }

    /// Activates an automation. With `register_existing`, subscribers
    /// already matching the entry condition are back-filled with
    /// executions; returns how many were registered.
    pub fn activate_automation(&self, id: Uuid, register_existing: bool) -> EngineResult<usize> {
        let mut automation = self
            .engine
            .automation(&id)
            .ok_or_else(|| EngineError::NotFound(format!("Automation {id}")))?;
        // Re-validated here: the graph may have been edited since creation.
        validate::validate_graph(&automation)?;
        automation.status = AutomationStatus::Active;
        automation.updated_at = Utc::now();
        self.engine.insert_automation(automation.clone());
        info!(automation_id = %id, "Automation activated");

        let mut registered = 0;
        if register_existing {
            for subscriber in self.subscribers.list_active() {
                if let Some(condition) = &automation.entry_condition {
                    if !condition.evaluate(&subscriber.attributes) {
                        continue;
                    }
                }
                if !automation.allow_re_entry
                    && self.engine.has_open_execution(&id, &subscriber.id)
                {
                    continue;
                }
                if self
                    .engine
                    .start_execution(&automation, &subscriber.id, subscriber.attributes.clone())
                    .is_ok()
                {
                    registered += 1;
                }
            }
            info!(automation_id = %id, registered, "Back-filled existing subscribers");
        }
        Ok(registered)
    }

    /// Pauses an automation. With `cancel_pending`, waiting jobs for it are
    /// dropped from the queue and open executions are cancelled; without,
    /// delayed jobs still fire but abort before side effects because the
    /// automation is no longer active.
    pub fn pause_automation(&self, id: Uuid, cancel_pending: bool) -> EngineResult<PauseSummary> {
        let automation = self
            .engine
            .automation(&id)
            .ok_or_else(|| EngineError::NotFound(format!("Automation {id}")))?;
        if automation.status != AutomationStatus::Active {
            return Err(EngineError::Validation(format!(
                "Automation {id} is not active"
            )));
        }
        self.engine
            .set_automation_status(&id, AutomationStatus::Paused)?;

        let mut summary = PauseSummary {
            jobs_cancelled: 0,
            executions_cancelled: 0,
        };
        if cancel_pending {
            let target = id.to_string();
            summary.jobs_cancelled = self.queue.cancel_where(&|job| {
                job.payload.get("automation_id").and_then(|v| v.as_str())
                    == Some(target.as_str())
            })?;
            summary.executions_cancelled = self.engine.cancel_open_executions(&id);
        }
        info!(
            automation_id = %id,
            jobs_cancelled = summary.jobs_cancelled,
            executions_cancelled = summary.executions_cancelled,
            "Automation paused"
        );
        Ok(summary)
    }

    /// Runs one execution synchronously for a subscriber; with `dry_run`
    /// no messages are sent.
    pub fn test_automation(
        &self,
        id: Uuid,
        subscriber_id: &str,
        dry_run: bool,
    ) -> EngineResult<SimulationReport> {
        self.engine.simulate(&id, subscriber_id, dry_run)
    }

    pub fn get_automation(&self, id: Uuid) -> EngineResult<Automation> {
        self.engine
            .automation(&id)
            .ok_or_else(|| EngineError::NotFound(format!("Automation {id}")))
    }

    pub fn list_automations(&self) -> Vec<Automation> {
        let mut automations = self.engine.automations_snapshot();
        automations.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        automations
    }

    /// Deletes a non-active automation.
    pub fn delete_automation(&self, id: Uuid) -> EngineResult<()> {
        let automation = self
            .engine
            .automation(&id)
            .ok_or_else(|| EngineError::NotFound(format!("Automation {id}")))?;
        if automation.status == AutomationStatus::Active {
            return Err(EngineError::Validation(format!(
                "Automation {id} is active; pause it before deleting"
            )));
        }
        self.engine.remove_automation(&id);
        info!(automation_id = %id, "Automation deleted");
        Ok(())
    }

    /// Pages through executions, newest first.
    pub fn get_executions(&self, query: &ExecutionQuery) -> ExecutionPage {
        let mut matching: Vec<_> = self
            .engine
            .executions_snapshot()
            .into_iter()
            .filter(|e| {
                query
                    .automation_id
                    .map(|id| e.automation_id == id)
                    .unwrap_or(true)
                    && query
                        .subscriber_id
                        .as_deref()
                        .map(|s| e.subscriber_id == s)
                        .unwrap_or(true)
                    && query.status.map(|s| e.status == s).unwrap_or(true)
            })
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let total = matching.len();
        let limit = query.limit.unwrap_or(20).max(1);
        let page = query.page.unwrap_or(1).max(1);
        let total_pages = total.div_ceil(limit);
        let executions = matching
            .into_iter()
            .skip((page - 1) * limit)
            .take(limit)
            .collect();
        ExecutionPage {
            executions,
            total,
            page,
            limit,
            total_pages,
        }
    }

    pub fn get_queue_metrics(&self) -> QueueStats {
        self.queue.stats()
    }

    pub fn get_analytics(&self, automation_id: Uuid) -> EngineResult<AutomationAnalytics> {
        self.get_automation(automation_id)?;
        let executions: Vec<_> = self
            .engine
            .executions_snapshot()
            .into_iter()
            .filter(|e| e.automation_id == automation_id)
            .collect();

        let mut analytics = AutomationAnalytics {
            automation_id,
            total_executions: executions.len(),
            completed: 0,
            failed: 0,
            cancelled: 0,
            in_progress: 0,
            completion_rate: 0.0,
            step_counts: HashMap::new(),
        };
        for execution in &executions {
            match execution.status {
                ExecutionStatus::Completed => analytics.completed += 1,
                ExecutionStatus::Failed => analytics.failed += 1,
                ExecutionStatus::Cancelled => analytics.cancelled += 1,
                _ => analytics.in_progress += 1,
            }
            for record in &execution.step_history {
                *analytics.step_counts.entry(record.step_id).or_default() += 1;
            }
        }
        if analytics.total_executions > 0 {
            analytics.completion_rate =
                analytics.completed as f64 / analytics.total_executions as f64;
        }
        Ok(analytics)
    }

    pub fn get_ab_test_result(&self, campaign_id: Uuid) -> EngineResult<AbTestResult> {
        self.abtests.get_result(&campaign_id)
    }

    pub fn select_winner(&self, campaign_id: Uuid, variant_id: Uuid) -> EngineResult<()> {
        self.abtests.select_winner(&campaign_id, &variant_id)
    }
}
