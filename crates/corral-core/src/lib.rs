//! Shared data model and error taxonomy for the corral runtime.
//!
//! Every record that crosses a component boundary lives here: agents,
//! tasks, workflows, and the bounded histories attached to them. The
//! other crates depend on this one and never on each other's internals.

pub mod agent;
pub mod task;
pub mod workflow;

pub use agent::{
    AgentConfig, AgentEnvironment, AgentErrorEntry, AgentId, AgentMetrics, AgentRecord,
    AgentStatus, Capabilities, ErrorSeverity, ResourceSample, TaskHistoryEntry,
};
pub use task::{TaskRecord, TaskStatus};
pub use workflow::{
    DeclaredAgent, FailurePolicy, RetryPolicy, WorkflowId, WorkflowProgress, WorkflowRecord,
    WorkflowSettings, WorkflowStatus,
};

// --- Error types ---

#[derive(Debug, thiserror::Error)]
pub enum CorralError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Limit exceeded: {0}")]
    LimitExceeded(String),

    #[error("No capacity: {0}")]
    NoCapacity(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Process failed: {0}")]
    ProcessFailed(String),

    #[error("Heartbeat timeout for agent {0}")]
    HeartbeatTimeout(AgentId),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Registry backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type CorralResult<T> = Result<T, CorralError>;

impl CorralError {
    /// Whether a caller may reasonably retry the failed operation.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            CorralError::NoCapacity(_)
                | CorralError::Timeout(_)
                | CorralError::HeartbeatTimeout(_)
                | CorralError::BackendUnavailable(_)
        )
    }
}
