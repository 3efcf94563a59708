use corral_core::{
    CorralError, CorralResult, DeclaredAgent, TaskRecord, WorkflowRecord, WorkflowSettings,
};
use serde::Deserialize;
use std::collections::HashMap;

/// One task as written in a workflow document.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskSpec {
    pub id: String,
    #[serde(alias = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, alias = "assignTo")]
    pub assign_to: Option<String>,
    #[serde(default, alias = "dependencies")]
    pub depends: Vec<String>,
    #[serde(default)]
    pub input: serde_json::Value,
    #[serde(default, alias = "timeout")]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub priority: i32,
    /// Expanded against the variables map at dispatch; a task whose
    /// condition resolves to `false`, `0`, or an empty string is skipped.
    #[serde(default)]
    pub condition: Option<String>,
    /// Capability hint for agent scoring when `assign_to` is absent.
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// A workflow as submitted by a caller, before validation.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowDocument {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub variables: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub agents: Vec<DeclaredAgent>,
    #[serde(default)]
    pub tasks: Vec<TaskSpec>,
    #[serde(default)]
    pub settings: WorkflowSettings,
}

impl WorkflowDocument {
    pub fn parse_json(text: &str) -> CorralResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn parse_yaml(text: &str) -> CorralResult<Self> {
        serde_yaml::from_str(text)
            .map_err(|e| CorralError::InvalidArgument(format!("workflow YAML: {e}")))
    }

    /// Accepts JSON or YAML, sniffed from the first non-blank character.
    pub fn parse(text: &str) -> CorralResult<Self> {
        if text.trim_start().starts_with(['{', '[']) {
            Self::parse_json(text)
        } else {
            Self::parse_yaml(text)
        }
    }

    /// Build the runtime record. Inputs keep their `${...}` references;
    /// expansion happens when the engine starts the workflow.
    pub fn into_record(self) -> WorkflowRecord {
        let tasks = self
            .tasks
            .into_iter()
            .map(|spec| {
                let mut task = TaskRecord::new(spec.id, spec.kind, spec.description);
                task.dependencies = spec.depends;
                task.assign_to = spec.assign_to;
                task.required_capabilities = spec.capabilities;
                task.input = spec.input;
                task.timeout_ms = spec.timeout_ms;
                task.retries_left = spec.retries;
                task.priority = spec.priority;
                task
            })
            .collect();
        let mut record = WorkflowRecord::new(self.name, tasks);
        record.variables = self.variables;
        record.agents = self.agents;
        record.settings = self.settings;
        record
    }
}
