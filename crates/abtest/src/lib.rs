//! A/B test engine: deterministic variant assignment, atomic metric
//! counters, and statistical winner selection under uncertainty.

pub mod assignment;
pub mod engine;
pub mod stats;
pub mod tracking;

pub use assignment::stable_bucket;
pub use engine::{
    AbTest, AbTestEngine, AbTestResult, AbTestSpec, AbTestStatus, AssignedVariant, Significance,
    TestType, Variant, VariantReport, VariantSpec, WinnerCriteria,
};
pub use tracking::EngagementTracker;
