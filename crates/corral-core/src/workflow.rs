use crate::task::TaskRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowId(pub Uuid);

impl WorkflowId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for WorkflowId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Stopped,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Stopped
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryPolicy {
    #[default]
    None,
    Immediate,
    Exponential,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    #[default]
    FailFast,
    Continue,
    Ignore,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSettings {
    /// Concurrent task dispatch bound; at least 1.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Wall-clock deadline for the whole workflow; crossing it behaves as
    /// if the fail-fast policy had fired.
    #[serde(default, alias = "timeout")]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub retry_policy: RetryPolicy,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    /// Base delay for exponential retries.
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    /// Cap on exponential retry delay.
    #[serde(default = "default_retry_cap_ms")]
    pub retry_cap_ms: u64,
}

fn default_max_concurrency() -> usize {
    1
}

fn default_retry_base_ms() -> u64 {
    500
}

fn default_retry_cap_ms() -> u64 {
    30_000
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            timeout_ms: None,
            retry_policy: RetryPolicy::default(),
            failure_policy: FailurePolicy::default(),
            retry_base_ms: default_retry_base_ms(),
            retry_cap_ms: default_retry_cap_ms(),
        }
    }
}

/// Aggregate task counters; completed + failed never exceeds total.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowProgress {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// An agent declared inline by a workflow document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeclaredAgent {
    pub id: String,
    #[serde(alias = "type")]
    pub kind: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub config: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRecord {
    pub id: WorkflowId,
    pub name: String,
    #[serde(default)]
    pub variables: HashMap<String, serde_json::Value>,
    pub tasks: Vec<TaskRecord>,
    #[serde(default)]
    pub agents: Vec<DeclaredAgent>,
    pub settings: WorkflowSettings,
    pub status: WorkflowStatus,
    pub progress: WorkflowProgress,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl WorkflowRecord {
    pub fn new(name: impl Into<String>, tasks: Vec<TaskRecord>) -> Self {
        let total = tasks.len();
        Self {
            id: WorkflowId::new(),
            name: name.into(),
            variables: HashMap::new(),
            tasks,
            agents: Vec::new(),
            settings: WorkflowSettings::default(),
            status: WorkflowStatus::Pending,
            progress: WorkflowProgress {
                total,
                ..WorkflowProgress::default()
            },
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn task(&self, id: &str) -> Option<&TaskRecord> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn task_mut(&mut self, id: &str) -> Option<&mut TaskRecord> {
        self.tasks.iter_mut().find(|t| t.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskRecord;

    #[test]
    fn test_new_workflow_counts_tasks() {
        let wf = WorkflowRecord::new(
            "deploy",
            vec![
                TaskRecord::new("build", "shell", "build"),
                TaskRecord::new("ship", "shell", "ship"),
            ],
        );
        assert_eq!(wf.progress.total, 2);
        assert_eq!(wf.status, WorkflowStatus::Pending);
    }

    #[test]
    fn test_settings_defaults() {
        let settings = WorkflowSettings::default();
        assert_eq!(settings.max_concurrency, 1);
        assert_eq!(settings.retry_policy, RetryPolicy::None);
        assert_eq!(settings.failure_policy, FailurePolicy::FailFast);
    }

    #[test]
    fn test_failure_policy_kebab_case() {
        let json = serde_json::to_string(&FailurePolicy::FailFast).unwrap();
        assert_eq!(json, "\"fail-fast\"");
        let parsed: FailurePolicy = serde_json::from_str("\"continue\"").unwrap();
        assert_eq!(parsed, FailurePolicy::Continue);
    }

    #[test]
    fn test_task_lookup() {
        let mut wf = WorkflowRecord::new("w", vec![TaskRecord::new("a", "t", "first")]);
        assert!(wf.task("a").is_some());
        assert!(wf.task("missing").is_none());
        wf.task_mut("a").unwrap().priority = 3;
        assert_eq!(wf.task("a").unwrap().priority, 3);
    }
}
