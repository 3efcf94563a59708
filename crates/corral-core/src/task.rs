use crate::agent::AgentId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Ready,
    Assigned,
    Running,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Skipped | TaskStatus::Cancelled
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Ready => "ready",
            TaskStatus::Assigned => "assigned",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Skipped => "skipped",
            TaskStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// A unit of work inside a workflow. Task ids are caller-chosen strings,
/// unique within their workflow; dependencies reference those ids.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub kind: String,
    pub description: String,
    /// Higher priority dispatches earlier within a ready set.
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Hard assignment to a declared agent id; overrides scoring.
    #[serde(default)]
    pub assign_to: Option<String>,
    /// Capability hint used for scoring when no hard assignment exists.
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    pub status: TaskStatus,
    #[serde(default)]
    pub input: serde_json::Value,
    #[serde(default)]
    pub output: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<serde_json::Value>,
    #[serde(default)]
    pub retries_left: u32,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub assigned_agent: Option<AgentId>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskRecord {
    pub fn new(id: impl Into<String>, kind: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            description: description.into(),
            priority: 0,
            dependencies: Vec::new(),
            assign_to: None,
            required_capabilities: Vec::new(),
            status: TaskStatus::Pending,
            input: serde_json::Value::Null,
            output: None,
            error: None,
            retries_left: 0,
            timeout_ms: None,
            assigned_agent: None,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_dependencies(mut self, deps: Vec<String>) -> Self {
        self.dependencies = deps;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_input(mut self, input: serde_json::Value) -> Self {
        self.input = input;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Skipped.is_terminal());
        assert!(!TaskStatus::Ready.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
    }

    #[test]
    fn test_builder_chain() {
        let task = TaskRecord::new("build", "shell", "compile the tree")
            .with_priority(5)
            .with_dependencies(vec!["fetch".into()]);
        assert_eq!(task.priority, 5);
        assert_eq!(task.dependencies, vec!["fetch".to_string()]);
        assert_eq!(task.status, TaskStatus::Pending);
    }

    #[test]
    fn test_roundtrip() {
        let task = TaskRecord::new("a", "analysis", "inspect input")
            .with_input(serde_json::json!({"path": "/tmp/x"}));
        let json = serde_json::to_string(&task).unwrap();
        let parsed: TaskRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.id, "a");
        assert_eq!(parsed.input["path"], "/tmp/x");
    }
}
