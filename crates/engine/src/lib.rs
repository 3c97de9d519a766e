//! Execution engine: the per-subscriber state machine that walks an
//! automation's step graph, plus the trigger listener that creates
//! executions and the service surface consumed by the admin layer.

pub mod engine;
pub mod evaluator;
pub mod service;
pub mod state_machine;
pub mod triggers;
pub mod validate;

pub use engine::{ExecutionEngine, SimulationReport, StepExecutionHandler};
pub use evaluator::{StepEvaluator, StepOutcome};
pub use service::{AutomationAnalytics, AutomationService, NewAutomation, PauseSummary};
pub use triggers::TriggerListener;
