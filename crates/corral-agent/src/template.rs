use corral_core::{AgentConfig, AgentEnvironment, Capabilities, CorralError, CorralResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

/// Named, immutable blueprint from which concrete agents are spawned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTemplate {
    pub name: String,
    /// The `kind` label stamped on agents spawned from this template.
    pub kind: String,
    pub capabilities: Capabilities,
    pub config: AgentConfig,
    pub environment: AgentEnvironment,
    /// Binary or script the supervisor launches.
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,
    #[serde(default = "default_auto_restart")]
    pub auto_restart: bool,
}

fn default_heartbeat_ms() -> u64 {
    10_000
}

fn default_startup_timeout_ms() -> u64 {
    30_000
}

fn default_auto_restart() -> bool {
    true
}

impl AgentTemplate {
    pub fn new(name: impl Into<String>, kind: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            capabilities: Capabilities::default(),
            config: AgentConfig::default(),
            environment: AgentEnvironment::default(),
            program: program.into(),
            args: Vec::new(),
            heartbeat_interval_ms: default_heartbeat_ms(),
            startup_timeout_ms: default_startup_timeout_ms(),
            auto_restart: default_auto_restart(),
        }
    }

    pub fn heartbeat_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn startup_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.startup_timeout_ms)
    }
}

/// Overrides applied on top of a template when creating one agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentOverrides {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub capabilities: Option<Capabilities>,
    #[serde(default)]
    pub config: Option<AgentConfig>,
    #[serde(default)]
    pub environment: Option<AgentEnvironment>,
}

/// The pre-registered blueprint set. Callers register more at startup;
/// the names mirror the three broad worker shapes the runtime dispatches
/// to out of the box.
pub fn default_templates() -> Vec<AgentTemplate> {
    let mut coordinator = AgentTemplate::new("coordinator", "coordinator", "corral-agent-worker");
    coordinator.capabilities.domains = vec!["planning".into(), "delegation".into()];
    coordinator.capabilities.max_concurrent_tasks = 4;

    let mut executor = AgentTemplate::new("executor", "executor", "corral-agent-worker");
    executor.capabilities.domains = vec!["execution".into()];
    executor.capabilities.tools = vec!["shell".into(), "fs".into()];
    executor.capabilities.max_concurrent_tasks = 2;

    let mut specialized = AgentTemplate::new("specialized", "specialized", "corral-agent-worker");
    specialized.capabilities.max_concurrent_tasks = 1;
    specialized.config.autonomy = 0.5;

    vec![coordinator, executor, specialized]
}

/// Registry of immutable templates. Registration of a duplicate name is
/// rejected rather than overwriting the existing blueprint.
pub struct TemplateRegistry {
    templates: RwLock<HashMap<String, AgentTemplate>>,
}

impl TemplateRegistry {
    pub fn new() -> Self {
        let registry = Self {
            templates: RwLock::new(HashMap::new()),
        };
        for template in default_templates() {
            // Defaults never collide with themselves.
            let _ = registry.register(template);
        }
        registry
    }

    pub fn register(&self, template: AgentTemplate) -> CorralResult<()> {
        let mut templates = self
            .templates
            .write()
            .map_err(|_| CorralError::InvalidArgument("template registry poisoned".into()))?;
        if templates.contains_key(&template.name) {
            return Err(CorralError::InvalidArgument(format!(
                "template '{}' is already registered",
                template.name
            )));
        }
        templates.insert(template.name.clone(), template);
        Ok(())
    }

    pub fn get(&self, name: &str) -> CorralResult<AgentTemplate> {
        self.templates
            .read()
            .ok()
            .and_then(|t| t.get(name).cloned())
            .ok_or_else(|| CorralError::NotFound(format!("template '{name}'")))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .templates
            .read()
            .map(|t| t.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }
}

impl Default for TemplateRegistry {
    fn default() -> Self {
        Self::new()
    }
}
