//! Task and workflow execution.
//!
//! Documents come in as JSON or YAML, are validated and expanded, and
//! then driven over the event bus: the engine dispatches `task:assigned`
//! and the assigned agents answer with `task:completed`/`task:failed`.

pub mod document;
pub mod engine;
pub mod expand;
pub mod goal;
pub mod validate;

pub use document::{TaskSpec, WorkflowDocument};
pub use engine::WorkflowEngine;
pub use goal::{Goal, GoalPriority, GoalStatus};
pub use validate::{validate, ValidationMode};
