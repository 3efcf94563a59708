use crate::document::{TaskSpec, WorkflowDocument};
use chrono::{DateTime, Utc};
use corral_core::{TaskStatus, WorkflowRecord, WorkflowSettings, WorkflowStatus};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// High-level objective submitted in prose, decomposed into a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Goal {
    pub id: Uuid,
    pub description: String,
    pub priority: GoalPriority,
    pub status: GoalStatus,
    pub parsed_intent: ParsedIntent,
    pub subtasks: Vec<Subtask>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GoalPriority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl GoalPriority {
    /// Dispatch priority applied to every subtask of the goal.
    pub fn task_priority(&self) -> i32 {
        match self {
            GoalPriority::Low => 0,
            GoalPriority::Medium => 10,
            GoalPriority::High => 20,
            GoalPriority::Critical => 30,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GoalStatus {
    Pending,
    Analyzing,
    Executing,
    Completed,
    Failed,
}

/// What the analysis pass understood from the description. Empty until
/// the goal has been analyzed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParsedIntent {
    /// Leading verb of the first step, lower-cased.
    pub action: String,
    pub entities: Vec<Entity>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub kind: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subtask {
    pub id: String,
    pub description: String,
    pub status: TaskStatus,
}

impl Goal {
    /// Submit a prose objective. The goal sits in `pending` until it is
    /// analyzed.
    pub fn new(description: impl Into<String>, priority: GoalPriority) -> Self {
        Self {
            id: Uuid::new_v4(),
            description: description.into(),
            priority,
            status: GoalStatus::Pending,
            parsed_intent: ParsedIntent::default(),
            subtasks: Vec::new(),
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Decompose the description into an intent and sequential subtasks.
    /// Steps are split on sequencing words ("then", "after that", ";"),
    /// and each step depends on the one before it. Moves the goal from
    /// `pending` to `analyzing`; a no-op in any other state.
    pub fn analyze(&mut self) {
        if self.status != GoalStatus::Pending {
            return;
        }
        self.status = GoalStatus::Analyzing;

        let steps = split_steps(&self.description);
        self.parsed_intent = ParsedIntent {
            action: steps
                .first()
                .and_then(|s| s.split_whitespace().next())
                .map(|w| w.to_lowercase())
                .unwrap_or_default(),
            entities: extract_entities(&self.description),
        };
        self.subtasks = steps
            .iter()
            .enumerate()
            .map(|(i, step)| Subtask {
                id: format!("step-{}", i + 1),
                description: step.clone(),
                status: TaskStatus::Pending,
            })
            .collect();
    }

    /// Lower the goal into a workflow document: one task per subtask,
    /// chained sequentially, carrying the goal priority. A still-pending
    /// goal is analyzed first; dispatching moves it to `executing`.
    pub fn to_workflow(&mut self) -> WorkflowDocument {
        self.analyze();
        self.status = GoalStatus::Executing;

        let tasks = self
            .subtasks
            .iter()
            .enumerate()
            .map(|(i, subtask)| TaskSpec {
                id: subtask.id.clone(),
                kind: self.parsed_intent.action.clone(),
                description: subtask.description.clone(),
                assign_to: None,
                depends: if i == 0 {
                    Vec::new()
                } else {
                    vec![self.subtasks[i - 1].id.clone()]
                },
                input: serde_json::json!({
                    "goal_id": self.id,
                    "step": subtask.description,
                }),
                timeout_ms: None,
                retries: 0,
                priority: self.priority.task_priority(),
                condition: None,
                capabilities: Vec::new(),
            })
            .collect();

        WorkflowDocument {
            name: format!("goal-{}", self.id),
            version: None,
            description: Some(self.description.clone()),
            variables: Default::default(),
            agents: Vec::new(),
            tasks,
            settings: WorkflowSettings::default(),
        }
    }

    /// Fold a finished workflow back into the goal's subtask statuses.
    pub fn absorb_result(&mut self, workflow: &WorkflowRecord) {
        for subtask in &mut self.subtasks {
            if let Some(task) = workflow.task(&subtask.id) {
                subtask.status = task.status;
            }
        }
        self.status = match workflow.status {
            WorkflowStatus::Completed => GoalStatus::Completed,
            WorkflowStatus::Failed | WorkflowStatus::Stopped => GoalStatus::Failed,
            _ => GoalStatus::Executing,
        };
        self.completed_at = workflow.finished_at;
    }
}

/// Split a description into sequential steps.
fn split_steps(description: &str) -> Vec<String> {
    let mut normalized = description.to_string();
    for separator in [" and then ", " then ", " after that ", "; "] {
        normalized = normalized.replace(separator, "\u{1f}");
    }
    let steps: Vec<String> = normalized
        .split('\u{1f}')
        .map(|s| s.trim().trim_end_matches('.').to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if steps.is_empty() {
        vec![description.trim().to_string()]
    } else {
        steps
    }
}

/// Pull recognizable entities out of prose: quoted names, paths, URLs.
fn extract_entities(description: &str) -> Vec<Entity> {
    let mut entities = Vec::new();
    let mut rest = description;
    while let Some(start) = rest.find('"') {
        let Some(len) = rest[start + 1..].find('"') else {
            break;
        };
        entities.push(Entity {
            kind: "name".to_string(),
            value: rest[start + 1..start + 1 + len].to_string(),
        });
        rest = &rest[start + 1 + len + 1..];
    }
    for word in description.split_whitespace() {
        let word = word.trim_end_matches(['.', ',', ';']);
        if word.starts_with("http://") || word.starts_with("https://") {
            entities.push(Entity {
                kind: "url".to_string(),
                value: word.to_string(),
            });
        } else if word.starts_with('/') && word.len() > 1 {
            entities.push(Entity {
                kind: "path".to_string(),
                value: word.to_string(),
            });
        }
    }
    entities
}
