//! Graph validation run at creation and again at activation. Invalid
//! definitions are rejected synchronously and never reach the queue.

use std::collections::HashMap;

use uuid::Uuid;

use dripflow_core::error::{EngineError, EngineResult};
use dripflow_core::types::{Automation, Step, StepKind};

pub fn validate_graph(automation: &Automation) -> EngineResult<()> {
    if automation.steps.is_empty() {
        return Err(EngineError::Validation(
            "Automation has no steps".to_string(),
        ));
    }
    if !automation.steps.contains_key(&automation.entry_step_id) {
        return Err(EngineError::Validation(format!(
            "Entry step {} is not in the step graph",
            automation.entry_step_id
        )));
    }

    for (id, step) in &automation.steps {
        if step.id != *id {
            return Err(EngineError::Validation(format!(
                "Step {} is keyed under a different id {id}",
                step.id
            )));
        }
        for target in step.kind.transitions() {
            if !automation.steps.contains_key(&target) {
                return Err(EngineError::Validation(format!(
                    "Step {id} references missing step {target}"
                )));
            }
        }
        if let StepKind::Split { arms } = &step.kind {
            if arms.is_empty() {
                return Err(EngineError::Validation(format!(
                    "Split step {id} has no arms"
                )));
            }
            let total: u32 = arms.iter().map(|a| a.percentage as u32).sum();
            if total != 100 {
                return Err(EngineError::Validation(format!(
                    "Split step {id} percentages sum to {total}, expected 100"
                )));
            }
        }
    }

    if automation.max_iterations.is_none() && has_cycle(&automation.steps, automation.entry_step_id)
    {
        return Err(EngineError::Validation(
            "Step graph contains a cycle; set max_iterations to allow loops".to_string(),
        ));
    }
    Ok(())
}

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    InProgress,
    Done,
}

fn has_cycle(steps: &HashMap<Uuid, Step>, entry: Uuid) -> bool {
    let mut marks = HashMap::new();
    visit(steps, entry, &mut marks)
}

fn visit(steps: &HashMap<Uuid, Step>, id: Uuid, marks: &mut HashMap<Uuid, Mark>) -> bool {
    match marks.get(&id) {
        Some(Mark::InProgress) => return true,
        Some(Mark::Done) => return false,
        None => {}
    }
    marks.insert(id, Mark::InProgress);
    if let Some(step) = steps.get(&id) {
        for next in step.kind.transitions() {
            if visit(steps, next, marks) {
                return true;
            }
        }
    }
    marks.insert(id, Mark::Done);
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use dripflow_core::types::{
        AutomationStatus, SplitArm, Trigger, TriggerKind,
    };

    fn automation_with(entry: Uuid, steps: Vec<Step>) -> Automation {
        Automation {
            id: Uuid::new_v4(),
            name: "test".into(),
            description: String::new(),
            status: AutomationStatus::Draft,
            trigger: Trigger {
                kind: TriggerKind::Event,
                event: "subscriber.created".into(),
                filter: None,
                change: None,
            },
            entry_condition: None,
            entry_step_id: entry,
            steps: steps.into_iter().map(|s| (s.id, s)).collect(),
            allow_re_entry: false,
            max_iterations: None,
            version: 1,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn send(id: Uuid, next: Uuid) -> Step {
        Step {
            id,
            kind: StepKind::SendMessage {
                template_id: "welcome".into(),
                campaign_id: None,
                next_step: next,
            },
        }
    }

    fn exit(id: Uuid) -> Step {
        Step {
            id,
            kind: StepKind::Exit,
        }
    }

    #[test]
    fn linear_graph_is_valid() {
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let automation = automation_with(a, vec![send(a, b), exit(b)]);
        assert!(validate_graph(&automation).is_ok());
    }

    #[test]
    fn missing_entry_step_is_rejected() {
        let a = Uuid::new_v4();
        let automation = automation_with(Uuid::new_v4(), vec![exit(a)]);
        assert!(matches!(
            validate_graph(&automation),
            Err(EngineError::Validation(_))
        ));
    }

    #[test]
    fn dangling_transition_is_rejected() {
        let a = Uuid::new_v4();
        let automation = automation_with(a, vec![send(a, Uuid::new_v4())]);
        assert!(validate_graph(&automation).is_err());
    }

    #[test]
    fn split_percentages_must_sum_to_100() {
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let split = Step {
            id: a,
            kind: StepKind::Split {
                arms: vec![
                    SplitArm {
                        next_step: b,
                        percentage: 60,
                    },
                    SplitArm {
                        next_step: c,
                        percentage: 30,
                    },
                ],
            },
        };
        let automation = automation_with(a, vec![split, exit(b), exit(c)]);
        assert!(validate_graph(&automation).is_err());
    }

    #[test]
    fn cycle_requires_iteration_cap() {
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        // a -> b -> a
        let mut automation = automation_with(a, vec![send(a, b), send(b, a)]);
        assert!(validate_graph(&automation).is_err());

        automation.max_iterations = Some(10);
        assert!(validate_graph(&automation).is_ok());
    }
}
