//! Step executors. Each step kind resolves to an outcome the engine acts
//! on; the waiting semantics of delay steps live in the engine, not here.

use std::sync::Arc;

use serde_json::json;
use tracing::debug;
use uuid::Uuid;

use dripflow_abtest::assignment::{pick_index, stable_bucket};
use dripflow_abtest::AbTestEngine;
use dripflow_core::collaborators::{MessageSender, SubscriberStore};
use dripflow_core::error::{EngineError, EngineResult};
use dripflow_core::types::{Automation, Execution, Step, StepKind};

/// What the engine should do after a step has run.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// Move to the next step immediately.
    Advance(Uuid),
    /// Park the execution and resume at `next_step` after the delay.
    Sleep { duration_secs: u64, next_step: Uuid },
    /// The execution is complete.
    Finish,
}

pub struct StepEvaluator {
    sender: Arc<dyn MessageSender>,
    subscribers: Arc<dyn SubscriberStore>,
    abtests: Arc<AbTestEngine>,
}

impl StepEvaluator {
    pub fn new(
        sender: Arc<dyn MessageSender>,
        subscribers: Arc<dyn SubscriberStore>,
        abtests: Arc<AbTestEngine>,
    ) -> Self {
        Self {
            sender,
            subscribers,
            abtests,
        }
    }

    /// Runs one step. With `side_effects` off (dry runs) nothing leaves
    /// the process; branching and bucketing still happen for real.
    pub fn evaluate(
        &self,
        _automation: &Automation,
        execution: &mut Execution,
        step: &Step,
        side_effects: bool,
    ) -> EngineResult<StepOutcome> {
        match &step.kind {
            StepKind::SendMessage {
                template_id,
                campaign_id,
                next_step,
            } => {
                let mut template = template_id.clone();
                let mut variant = None;
                if let Some(campaign) = campaign_id {
                    if let Some(assigned) = self.abtests.assign(campaign, &execution.subscriber_id)
                    {
                        debug!(
                            execution_id = %execution.id,
                            campaign_id = %campaign,
                            variant = %assigned.label,
                            "Variant selected for test-enabled campaign"
                        );
                        template = assigned.template_id.clone();
                        variant = Some((*campaign, assigned.variant_id));
                    }
                }

                if side_effects {
                    let outcome =
                        self.sender
                            .send(&execution.subscriber_id, &template, &execution.context)?;
                    if let Some((campaign, variant_id)) = variant {
                        self.abtests.record_sent(&campaign, &variant_id);
                    }
                    if let Some(context) = execution.context.as_object_mut() {
                        context.insert("last_template_id".into(), json!(template));
                        context.insert("last_send_success".into(), json!(outcome.success));
                    }
                }
                Ok(StepOutcome::Advance(*next_step))
            }

            StepKind::Delay {
                duration_secs,
                next_step,
            } => Ok(StepOutcome::Sleep {
                duration_secs: *duration_secs,
                next_step: *next_step,
            }),

            StepKind::Condition {
                predicate,
                on_true,
                on_false,
            } => {
                let merged = self.merged_context(execution)?;
                // Missing fields evaluate to false inside the predicate,
                // so a condition always picks exactly one branch.
                let next = if predicate.evaluate(&merged) {
                    on_true
                } else {
                    on_false
                };
                Ok(StepOutcome::Advance(*next))
            }

            StepKind::Split { arms } => {
                let percentages: Vec<u8> = arms.iter().map(|a| a.percentage).collect();
                let bucket = stable_bucket(&step.id.to_string(), &execution.subscriber_id);
                let arm = &arms[pick_index(bucket, &percentages)];
                Ok(StepOutcome::Advance(arm.next_step))
            }

            StepKind::Exit => Ok(StepOutcome::Finish),
        }
    }

    /// Execution context overlaid on live subscriber attributes; context
    /// values win on key collision. A subscriber missing from the store is
    /// not an error here, conditions just see the context alone.
    fn merged_context(&self, execution: &Execution) -> EngineResult<serde_json::Value> {
        let mut merged = match self.subscribers.get(&execution.subscriber_id) {
            Ok(subscriber) => subscriber.attributes,
            Err(EngineError::NotFound(_)) => json!({}),
            Err(e) => return Err(e),
        };
        if let (Some(base), Some(overlay)) = (merged.as_object_mut(), execution.context.as_object())
        {
            for (key, value) in overlay {
                base.insert(key.clone(), value.clone());
            }
        }
        Ok(merged)
    }
}
