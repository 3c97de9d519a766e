//! Execution status transition table. Terminal states accept nothing.

use chrono::Utc;

use dripflow_core::error::{EngineError, EngineResult};
use dripflow_core::types::{Execution, ExecutionStatus};

pub fn can_transition(from: ExecutionStatus, to: ExecutionStatus) -> bool {
    use ExecutionStatus::*;
    matches!(
        (from, to),
        (Pending, Running)
            | (Pending, Cancelled)
            // Running -> Running is the self-loop through consecutive
            // cheap steps within one job dispatch.
            | (Running, Running)
            | (Running, Waiting)
            | (Running, Completed)
            | (Running, Failed)
            | (Running, Cancelled)
            | (Waiting, Running)
            | (Waiting, Cancelled)
    )
}

/// Applies a transition, rejecting anything outside the table.
pub fn transition(execution: &mut Execution, to: ExecutionStatus) -> EngineResult<()> {
    if !can_transition(execution.status, to) {
        return Err(EngineError::Validation(format!(
            "Invalid execution transition {:?} -> {:?} (execution {})",
            execution.status, to, execution.id
        )));
    }
    execution.status = to;
    execution.updated_at = Utc::now();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    #[test]
    fn terminal_states_accept_no_transitions() {
        use ExecutionStatus::*;
        for terminal in [Completed, Failed, Cancelled] {
            for to in [Pending, Running, Waiting, Completed, Failed, Cancelled] {
                assert!(!can_transition(terminal, to), "{terminal:?} -> {to:?}");
            }
        }
    }

    #[test]
    fn lifecycle_paths_are_allowed() {
        use ExecutionStatus::*;
        assert!(can_transition(Pending, Running));
        assert!(can_transition(Running, Waiting));
        assert!(can_transition(Waiting, Running));
        assert!(can_transition(Running, Running));
        assert!(can_transition(Running, Completed));
        assert!(can_transition(Waiting, Cancelled));
        assert!(!can_transition(Pending, Waiting));
        assert!(!can_transition(Waiting, Completed));
    }

    #[test]
    fn transition_rejects_invalid_and_mutates_valid() {
        let mut execution = Execution::new(Uuid::new_v4(), "sub-1", Uuid::new_v4(), json!({}));
        transition(&mut execution, ExecutionStatus::Running).unwrap();
        assert_eq!(execution.status, ExecutionStatus::Running);
        transition(&mut execution, ExecutionStatus::Completed).unwrap();
        assert!(transition(&mut execution, ExecutionStatus::Running).is_err());
    }
}
