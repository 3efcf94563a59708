use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Upper bound on retained error entries per agent.
pub const ERROR_HISTORY_CAP: usize = 50;
/// Upper bound on retained task outcomes per agent.
pub const TASK_HISTORY_CAP: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentId(pub Uuid);

impl AgentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for AgentId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Initializing,
    Idle,
    Busy,
    Error,
    Terminating,
    Terminated,
    Offline,
}

impl AgentStatus {
    /// Terminated is absorbing; no transition leaves it.
    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentStatus::Terminated)
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AgentStatus::Initializing => "initializing",
            AgentStatus::Idle => "idle",
            AgentStatus::Busy => "busy",
            AgentStatus::Error => "error",
            AgentStatus::Terminating => "terminating",
            AgentStatus::Terminated => "terminated",
            AgentStatus::Offline => "offline",
        };
        write!(f, "{s}")
    }
}

/// Semantic description of what an agent can do, plus its hard limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capabilities {
    #[serde(default)]
    pub languages: Vec<String>,
    #[serde(default)]
    pub frameworks: Vec<String>,
    #[serde(default)]
    pub domains: Vec<String>,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_tasks: u32,
    #[serde(default)]
    pub max_memory_bytes: Option<u64>,
    #[serde(default)]
    pub max_execution_ms: Option<u64>,
    /// Baseline scores in [0, 1] used before any history exists.
    #[serde(default = "default_baseline")]
    pub reliability: f64,
    #[serde(default = "default_baseline")]
    pub speed: f64,
    #[serde(default = "default_baseline")]
    pub quality: f64,
}

fn default_max_concurrent() -> u32 {
    1
}

fn default_baseline() -> f64 {
    0.8
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            languages: Vec::new(),
            frameworks: Vec::new(),
            domains: Vec::new(),
            tools: Vec::new(),
            max_concurrent_tasks: default_max_concurrent(),
            max_memory_bytes: None,
            max_execution_ms: None,
            reliability: default_baseline(),
            speed: default_baseline(),
            quality: default_baseline(),
        }
    }
}

impl Capabilities {
    /// Fraction of `required` capability names this agent satisfies, in [0, 1].
    /// An empty requirement list counts as a full match.
    pub fn match_fraction(&self, required: &[String]) -> f64 {
        if required.is_empty() {
            return 1.0;
        }
        let matched = required
            .iter()
            .filter(|r| {
                self.languages.contains(r)
                    || self.frameworks.contains(r)
                    || self.domains.contains(r)
                    || self.tools.contains(r)
            })
            .count();
        matched as f64 / required.len() as f64
    }
}

/// Per-agent behavioral configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Autonomy level in [0, 1]; 1.0 means no human gate.
    #[serde(default = "default_autonomy")]
    pub autonomy: f64,
    #[serde(default)]
    pub learning_enabled: bool,
    #[serde(default)]
    pub adaptation_enabled: bool,
    #[serde(default)]
    pub max_tasks_per_hour: Option<u32>,
    #[serde(default = "default_task_timeout_ms")]
    pub task_timeout_ms: u64,
    #[serde(default)]
    pub permissions: Vec<String>,
    /// Expertise weights per domain, each in [0, 1].
    #[serde(default)]
    pub expertise: HashMap<String, f64>,
}

fn default_autonomy() -> f64 {
    0.7
}

fn default_task_timeout_ms() -> u64 {
    300_000
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            autonomy: default_autonomy(),
            learning_enabled: false,
            adaptation_enabled: false,
            max_tasks_per_hour: None,
            task_timeout_ms: default_task_timeout_ms(),
            permissions: Vec::new(),
            expertise: HashMap::new(),
        }
    }
}

/// Where and how the agent process runs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentEnvironment {
    #[serde(default)]
    pub runtime: String,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub temp_dir: Option<String>,
    #[serde(default)]
    pub log_dir: Option<String>,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub api_endpoints: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorSeverity::Low => "low",
            ErrorSeverity::Medium => "medium",
            ErrorSeverity::High => "high",
            ErrorSeverity::Critical => "critical",
        };
        write!(f, "{s}")
    }
}

/// One entry in an agent's bounded error history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentErrorEntry {
    pub timestamp: DateTime<Utc>,
    pub kind: String,
    pub message: String,
    #[serde(default)]
    pub context: HashMap<String, String>,
    pub severity: ErrorSeverity,
    #[serde(default)]
    pub resolved: bool,
}

impl AgentErrorEntry {
    pub fn new(kind: impl Into<String>, message: impl Into<String>, severity: ErrorSeverity) -> Self {
        Self {
            timestamp: Utc::now(),
            kind: kind.into(),
            message: message.into(),
            context: HashMap::new(),
            severity,
            resolved: false,
        }
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Outcome of one dispatched task, kept in a bounded ring per agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskHistoryEntry {
    pub task_id: String,
    pub succeeded: bool,
    pub duration_ms: u64,
    pub finished_at: DateTime<Utc>,
}

/// Most recent resource usage as reported in a heartbeat.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ResourceSample {
    /// Each pair is (used, limit); a missing limit means the dimension is unmetered.
    #[serde(default)]
    pub memory: Option<(u64, u64)>,
    #[serde(default)]
    pub cpu: Option<(f64, f64)>,
    #[serde(default)]
    pub disk: Option<(u64, u64)>,
}

/// Rolling counters folded from task completions and heartbeats.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentMetrics {
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    /// Rolling average of task execution time; 0 until the first completion.
    pub avg_execution_ms: f64,
    #[serde(default)]
    pub last_resource_sample: Option<ResourceSample>,
}

impl AgentMetrics {
    /// `completed / (completed + failed)`, or 1.0 with no history.
    pub fn success_rate(&self) -> f64 {
        let total = self.tasks_completed + self.tasks_failed;
        if total == 0 {
            1.0
        } else {
            self.tasks_completed as f64 / total as f64
        }
    }

    pub fn record_task(&mut self, succeeded: bool, duration_ms: u64) {
        if succeeded {
            self.tasks_completed += 1;
        } else {
            self.tasks_failed += 1;
        }
        let n = (self.tasks_completed + self.tasks_failed) as f64;
        self.avg_execution_ms += (duration_ms as f64 - self.avg_execution_ms) / n;
    }
}

/// The authoritative description of one agent. Mutated only by the
/// lifecycle manager; everyone else reads a registry copy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: AgentId,
    pub name: String,
    /// Free-form label drawn from the template the agent was spawned from.
    pub kind: String,
    pub status: AgentStatus,
    pub capabilities: Capabilities,
    pub config: AgentConfig,
    pub environment: AgentEnvironment,
    /// Count of in-flight tasks; never exceeds `capabilities.max_concurrent_tasks`.
    pub workload: u32,
    /// Latest overall health score in [0, 1].
    pub health: f64,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error_history: Vec<AgentErrorEntry>,
    #[serde(default)]
    pub task_history: Vec<TaskHistoryEntry>,
    /// Template provenance so a restart after a crash is deterministic.
    pub template: String,
    pub metrics: AgentMetrics,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

impl AgentRecord {
    pub fn new(name: impl Into<String>, kind: impl Into<String>, template: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: AgentId::new(),
            name: name.into(),
            kind: kind.into(),
            status: AgentStatus::Initializing,
            capabilities: Capabilities::default(),
            config: AgentConfig::default(),
            environment: AgentEnvironment::default(),
            workload: 0,
            health: 1.0,
            last_heartbeat_at: None,
            error_history: Vec::new(),
            task_history: Vec::new(),
            template: template.into(),
            metrics: AgentMetrics::default(),
            created_at: now,
            last_activity_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.last_activity_at = Utc::now();
    }

    /// Append an error, evicting the oldest entry past the cap.
    pub fn record_error(&mut self, entry: AgentErrorEntry) {
        self.error_history.push(entry);
        if self.error_history.len() > ERROR_HISTORY_CAP {
            let excess = self.error_history.len() - ERROR_HISTORY_CAP;
            self.error_history.drain(0..excess);
        }
    }

    /// Fold one task outcome into the metrics and the bounded history.
    pub fn record_task_outcome(&mut self, task_id: impl Into<String>, succeeded: bool, duration_ms: u64) {
        self.metrics.record_task(succeeded, duration_ms);
        self.task_history.push(TaskHistoryEntry {
            task_id: task_id.into(),
            succeeded,
            duration_ms,
            finished_at: Utc::now(),
        });
        if self.task_history.len() > TASK_HISTORY_CAP {
            let excess = self.task_history.len() - TASK_HISTORY_CAP;
            self.task_history.drain(0..excess);
        }
        self.touch();
    }

    /// Mark all unresolved error entries resolved (a healthy heartbeat arrived).
    pub fn resolve_errors(&mut self) {
        for entry in &mut self.error_history {
            entry.resolved = true;
        }
    }
}
