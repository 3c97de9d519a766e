//! The execution engine proper: owns automation and execution state,
//! advances executions through their step graphs under a per-execution
//! advisory lock, and schedules follow-up work through the job queue.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use dripflow_core::config::EngineConfig;
use dripflow_core::error::{EngineError, EngineResult};
use dripflow_core::types::{
    Automation, AutomationStatus, Execution, ExecutionStatus, StepError, StepRecord,
};
use dripflow_queue::{JobHandler, JobKind, JobQueue, NewJob, QueueJob, StepExecutionPayload};

use crate::evaluator::{StepEvaluator, StepOutcome};
use crate::state_machine;

pub struct ExecutionEngine {
    automations: DashMap<Uuid, Automation>,
    executions: DashMap<Uuid, Execution>,
    /// Advisory locks: presence of an id means a job is running step logic
    /// for that execution right now.
    locks: DashMap<Uuid, ()>,
    evaluator: StepEvaluator,
    queue: Arc<dyn JobQueue>,
    config: EngineConfig,
}

/// Released on drop, so evaluator panics cannot leak a held lock.
struct ExecutionLock<'a> {
    locks: &'a DashMap<Uuid, ()>,
    id: Uuid,
}

impl<'a> ExecutionLock<'a> {
    fn acquire(locks: &'a DashMap<Uuid, ()>, id: Uuid) -> EngineResult<Self> {
        match locks.entry(id) {
            Entry::Occupied(_) => Err(EngineError::Transient(format!(
                "Execution {id} is already being dispatched"
            ))),
            Entry::Vacant(vacant) => {
                vacant.insert(());
                Ok(Self { locks, id })
            }
        }
    }
}

impl Drop for ExecutionLock<'_> {
    fn drop(&mut self) {
        self.locks.remove(&self.id);
    }
}

/// Report of a synchronous test run of an automation.
#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub automation_id: Uuid,
    pub subscriber_id: String,
    pub steps: Vec<StepRecord>,
    pub completed: bool,
}

impl ExecutionEngine {
    pub fn new(evaluator: StepEvaluator, queue: Arc<dyn JobQueue>, config: EngineConfig) -> Self {
        Self {
            automations: DashMap::new(),
            executions: DashMap::new(),
            locks: DashMap::new(),
            evaluator,
            queue,
            config,
        }
    }

    pub fn insert_automation(&self, automation: Automation) {
        self.automations.insert(automation.id, automation);
    }

    pub fn automation(&self, id: &Uuid) -> Option<Automation> {
        self.automations.get(id).map(|a| a.clone())
    }

    pub fn automations_snapshot(&self) -> Vec<Automation> {
        self.automations.iter().map(|a| a.clone()).collect()
    }

    pub fn set_automation_status(
        &self,
        id: &Uuid,
        status: AutomationStatus,
    ) -> EngineResult<()> {
        let mut automation = self
            .automations
            .get_mut(id)
            .ok_or_else(|| EngineError::NotFound(format!("Automation {id}")))?;
        automation.status = status;
        automation.updated_at = Utc::now();
        Ok(())
    }

    pub fn remove_automation(&self, id: &Uuid) -> Option<Automation> {
        self.automations.remove(id).map(|(_, a)| a)
    }

    pub fn execution(&self, id: &Uuid) -> Option<Execution> {
        self.executions.get(id).map(|e| e.clone())
    }

    pub fn executions_snapshot(&self) -> Vec<Execution> {
        self.executions.iter().map(|e| e.clone()).collect()
    }

    pub fn has_open_execution(&self, automation_id: &Uuid, subscriber_id: &str) -> bool {
        self.executions.iter().any(|e| {
            e.automation_id == *automation_id
                && e.subscriber_id == subscriber_id
                && !e.status.is_terminal()
        })
    }

    /// Creates a pending execution at the automation's entry step and
    /// enqueues its first dispatch.
    pub fn start_execution(
        &self,
        automation: &Automation,
        subscriber_id: &str,
        context: serde_json::Value,
    ) -> EngineResult<Uuid> {
        if !automation.allow_re_entry && self.has_open_execution(&automation.id, subscriber_id) {
            return Err(EngineError::Validation(format!(
                "Subscriber {subscriber_id} already has an open execution for automation {}",
                automation.id
            )));
        }
        let execution = Execution::new(automation.id, subscriber_id, automation.entry_step_id, context);
        let id = execution.id;
        // Insert before enqueueing so a fast worker dequeuing the job finds
        // the execution on its first attempt.
        self.executions.insert(id, execution.clone());
        if let Err(e) = self.enqueue_step(&execution, None) {
            self.executions.remove(&id);
            return Err(e);
        }
        info!(
            execution_id = %execution.id,
            automation_id = %automation.id,
            subscriber_id = %subscriber_id,
            "Execution started"
        );
        metrics::counter!("executions.started").increment(1);
        Ok(id)
    }

    /// Cancels every non-terminal execution of the automation. Returns how
    /// many were cancelled.
    pub fn cancel_open_executions(&self, automation_id: &Uuid) -> usize {
        let mut cancelled = 0;
        for mut entry in self.executions.iter_mut() {
            if entry.automation_id == *automation_id && !entry.status.is_terminal() {
                entry.status = ExecutionStatus::Cancelled;
                entry.scheduled_at = None;
                entry.updated_at = Utc::now();
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            metrics::counter!("executions.cancelled").increment(cancelled as u64);
        }
        cancelled
    }

    /// Advances one execution under its advisory lock. `attempt` and
    /// `max_attempts` come from the dispatching job; the queue owns retry
    /// scheduling, the engine only mirrors the bookkeeping.
    pub fn advance(&self, execution_id: Uuid, attempt: u32, max_attempts: u32) -> EngineResult<()> {
        let _lock = ExecutionLock::acquire(&self.locks, execution_id)?;

        let mut execution = self
            .execution(&execution_id)
            .ok_or_else(|| EngineError::NotFound(format!("Execution {execution_id}")))?;
        if execution.status.is_terminal() {
            // Replayed job for a finished execution; ack and move on.
            debug!(execution_id = %execution_id, status = ?execution.status, "Skipping terminal execution");
            return Ok(());
        }

        let result = self.advance_locked(&mut execution, attempt, max_attempts);
        execution.updated_at = Utc::now();
        // Terminal states are immutable; never clobber one written by a
        // concurrent cancellation.
        match self.executions.entry(execution_id) {
            Entry::Occupied(mut occupied) => {
                if !occupied.get().status.is_terminal() {
                    occupied.insert(execution);
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(execution);
            }
        }
        result
    }

    fn advance_locked(
        &self,
        execution: &mut Execution,
        attempt: u32,
        max_attempts: u32,
    ) -> EngineResult<()> {
        execution.attempt_count = attempt;
        state_machine::transition(execution, ExecutionStatus::Running)?;
        execution.scheduled_at = None;

        for _ in 0..self.config.max_steps_per_dispatch {
            // Reload per hop so a pause lands before the next side effect.
            let automation = self
                .automation(&execution.automation_id)
                .ok_or_else(|| EngineError::NotFound(format!("Automation {}", execution.automation_id)))?;
            if automation.status != AutomationStatus::Active {
                state_machine::transition(execution, ExecutionStatus::Cancelled)?;
                info!(
                    execution_id = %execution.id,
                    automation_id = %automation.id,
                    "Automation no longer active, execution cancelled"
                );
                return Ok(());
            }

            if let Some(cap) = automation.max_iterations {
                if execution.step_history.len() as u32 >= cap {
                    return self.fail_execution(
                        execution,
                        attempt,
                        format!("Iteration cap of {cap} steps exceeded"),
                    );
                }
            }

            let step_id = execution.current_step_id;
            let Some(step) = automation.step(&step_id).cloned() else {
                return self.fail_execution(
                    execution,
                    attempt,
                    format!("Step {step_id} missing from automation graph"),
                );
            };

            match self.evaluator.evaluate(&automation, execution, &step, true) {
                Ok(outcome) => {
                    let label = step.kind.label().to_string();
                    match outcome {
                        StepOutcome::Advance(next) => {
                            self.record_step(execution, step_id, &label, "advanced");
                            execution.current_step_id = next;
                        }
                        StepOutcome::Sleep {
                            duration_secs,
                            next_step,
                        } => {
                            self.record_step(execution, step_id, &label, "scheduled");
                            execution.current_step_id = next_step;
                            let wake_at =
                                Utc::now() + chrono::Duration::seconds(duration_secs as i64);
                            execution.scheduled_at = Some(wake_at);
                            state_machine::transition(execution, ExecutionStatus::Waiting)?;
                            self.enqueue_step(execution, Some(wake_at))?;
                            debug!(
                                execution_id = %execution.id,
                                wake_at = %wake_at,
                                "Execution waiting on delay"
                            );
                            return Ok(());
                        }
                        StepOutcome::Finish => {
                            self.record_step(execution, step_id, &label, "completed");
                            state_machine::transition(execution, ExecutionStatus::Completed)?;
                            metrics::counter!("executions.completed").increment(1);
                            info!(execution_id = %execution.id, "Execution completed");
                            return Ok(());
                        }
                    }
                }
                Err(e) => {
                    execution.last_error = Some(StepError {
                        execution_id: execution.id,
                        step_id,
                        attempts: attempt,
                        message: e.to_string(),
                    });
                    if attempt >= max_attempts || !e.is_transient() {
                        state_machine::transition(execution, ExecutionStatus::Failed)?;
                        metrics::counter!("executions.failed").increment(1);
                        warn!(
                            execution_id = %execution.id,
                            step_id = %step_id,
                            attempts = attempt,
                            error = %e,
                            "Execution failed"
                        );
                    }
                    // The pool routes this through queue.fail, which owns
                    // the backoff schedule.
                    return Err(e);
                }
            }
        }

        // Hop guard reached; the rest of the graph continues under a
        // fresh job so one dispatch cannot monopolize a worker.
        self.enqueue_step(execution, None)?;
        Ok(())
    }

    fn fail_execution(
        &self,
        execution: &mut Execution,
        attempt: u32,
        message: String,
    ) -> EngineResult<()> {
        execution.last_error = Some(StepError {
            execution_id: execution.id,
            step_id: execution.current_step_id,
            attempts: attempt,
            message: message.clone(),
        });
        state_machine::transition(execution, ExecutionStatus::Failed)?;
        metrics::counter!("executions.failed").increment(1);
        warn!(execution_id = %execution.id, error = %message, "Execution failed");
        Ok(())
    }

    fn record_step(&self, execution: &mut Execution, step_id: Uuid, kind: &str, outcome: &str) {
        execution.step_history.push(StepRecord {
            step_id,
            step_kind: kind.to_string(),
            executed_at: Utc::now(),
            outcome: outcome.to_string(),
        });
    }

    fn enqueue_step(&self, execution: &Execution, at: Option<DateTime<Utc>>) -> EngineResult<()> {
        let payload = serde_json::to_value(StepExecutionPayload {
            execution_id: execution.id,
            automation_id: execution.automation_id,
        })?;
        let mut job = NewJob::new(JobKind::StepExecution, payload);
        if let Some(at) = at {
            job = job.not_before(at);
        }
        self.queue.enqueue(job)?;
        Ok(())
    }

    /// Walks the automation graph synchronously for one subscriber. Delay
    /// steps are recorded but not waited on. With `dry_run` no messages
    /// leave the process; the execution is never persisted either way.
    pub fn simulate(
        &self,
        automation_id: &Uuid,
        subscriber_id: &str,
        dry_run: bool,
    ) -> EngineResult<SimulationReport> {
        let automation = self
            .automation(automation_id)
            .ok_or_else(|| EngineError::NotFound(format!("Automation {automation_id}")))?;
        let mut execution = Execution::new(
            automation.id,
            subscriber_id,
            automation.entry_step_id,
            json!({}),
        );
        execution.status = ExecutionStatus::Running;

        let cap = automation.max_iterations.unwrap_or(100);
        let mut completed = false;
        while (execution.step_history.len() as u32) < cap {
            let step_id = execution.current_step_id;
            let Some(step) = automation.step(&step_id).cloned() else {
                return Err(EngineError::Validation(format!(
                    "Step {step_id} missing from automation graph"
                )));
            };
            let outcome = self
                .evaluator
                .evaluate(&automation, &mut execution, &step, !dry_run)?;
            let label = step.kind.label().to_string();
            match outcome {
                StepOutcome::Advance(next) => {
                    self.record_step(&mut execution, step_id, &label, "advanced");
                    execution.current_step_id = next;
                }
                StepOutcome::Sleep { next_step, .. } => {
                    self.record_step(&mut execution, step_id, &label, "skipped_delay");
                    execution.current_step_id = next_step;
                }
                StepOutcome::Finish => {
                    self.record_step(&mut execution, step_id, &label, "completed");
                    completed = true;
                    break;
                }
            }
        }

        Ok(SimulationReport {
            automation_id: automation.id,
            subscriber_id: subscriber_id.to_string(),
            steps: execution.step_history,
            completed,
        })
    }
}

/// Queue handler that dispatches step-execution jobs into the engine.
pub struct StepExecutionHandler {
    engine: Arc<ExecutionEngine>,
}

impl StepExecutionHandler {
    pub fn new(engine: Arc<ExecutionEngine>) -> Self {
        Self { engine }
    }
}

impl JobHandler for StepExecutionHandler {
    fn kind(&self) -> JobKind {
        JobKind::StepExecution
    }

    fn handle(&self, job: &QueueJob) -> EngineResult<()> {
        let payload: StepExecutionPayload = serde_json::from_value(job.payload.clone())?;
        self.engine
            .advance(payload.execution_id, job.attempts, job.max_attempts)
    }
}
