//! Durable, priority-ordered job queue with `not_before` scheduling, and
//! the worker pool that drains it.

pub mod job;
pub mod memory;
pub mod worker;

pub use job::{JobKind, JobState, KindStats, NewJob, QueueJob, QueueStats, StepExecutionPayload};
pub use memory::{JobQueue, MemoryJobQueue};
pub use worker::{JobHandler, WorkerPool};
