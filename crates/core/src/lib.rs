pub mod collaborators;
pub mod config;
pub mod error;
pub mod event_bus;
pub mod predicates;
pub mod types;

pub use error::{EngineError, EngineResult};
