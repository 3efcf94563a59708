use chrono::{DateTime, Utc};
use corral_core::{AgentId, AgentStatus, ErrorSeverity, WorkflowId, WorkflowProgress};
use serde::{Deserialize, Serialize};

/// Every topic the runtime publishes on. Components signal each other
/// exclusively through these; there are no direct cross-component calls
/// besides explicitly returned handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Topic {
    AgentCreated,
    AgentStarted,
    AgentStopped,
    AgentError,
    AgentStatusChanged,
    AgentHeartbeat,
    AgentHeartbeatTimeout,
    AgentReady,
    TaskCreated,
    TaskAssigned,
    TaskCompleted,
    TaskFailed,
    TaskCancelled,
    TaskSkipped,
    TaskCancel,
    WorkflowStarted,
    WorkflowCompleted,
    WorkflowFailed,
    WorkflowStopped,
    WorkflowProgress,
    PoolCreated,
    PoolScaled,
    ProcessExit,
    ProcessError,
    RegistryUpdated,
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Topic::AgentCreated => "agent:created",
            Topic::AgentStarted => "agent:started",
            Topic::AgentStopped => "agent:stopped",
            Topic::AgentError => "agent:error",
            Topic::AgentStatusChanged => "agent:status-changed",
            Topic::AgentHeartbeat => "agent:heartbeat",
            Topic::AgentHeartbeatTimeout => "agent:heartbeat-timeout",
            Topic::AgentReady => "agent:ready",
            Topic::TaskCreated => "task:created",
            Topic::TaskAssigned => "task:assigned",
            Topic::TaskCompleted => "task:completed",
            Topic::TaskFailed => "task:failed",
            Topic::TaskCancelled => "task:cancelled",
            Topic::TaskSkipped => "task:skipped",
            Topic::TaskCancel => "task:cancel",
            Topic::WorkflowStarted => "workflow:started",
            Topic::WorkflowCompleted => "workflow:completed",
            Topic::WorkflowFailed => "workflow:failed",
            Topic::WorkflowStopped => "workflow:stopped",
            Topic::WorkflowProgress => "workflow:progress",
            Topic::PoolCreated => "pool:created",
            Topic::PoolScaled => "pool:scaled",
            Topic::ProcessExit => "process:exit",
            Topic::ProcessError => "process:error",
            Topic::RegistryUpdated => "registry:updated",
        };
        write!(f, "{s}")
    }
}

/// Metrics an agent may attach to a heartbeat.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatMetrics {
    #[serde(default)]
    pub memory_used: Option<u64>,
    #[serde(default)]
    pub memory_limit: Option<u64>,
    #[serde(default)]
    pub cpu_used: Option<f64>,
    #[serde(default)]
    pub cpu_limit: Option<f64>,
    #[serde(default)]
    pub disk_used: Option<u64>,
    #[serde(default)]
    pub disk_limit: Option<u64>,
}

/// Unified event payload carried on the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    AgentCreated {
        agent_id: AgentId,
        template: String,
    },
    AgentStarted {
        agent_id: AgentId,
    },
    AgentStopped {
        agent_id: AgentId,
        reason: String,
    },
    AgentError {
        agent_id: AgentId,
        kind: String,
        message: String,
        severity: ErrorSeverity,
    },
    AgentStatusChanged {
        agent_id: AgentId,
        from: AgentStatus,
        to: AgentStatus,
    },
    AgentHeartbeat {
        agent_id: AgentId,
        timestamp: DateTime<Utc>,
        #[serde(default)]
        metrics: Option<HeartbeatMetrics>,
    },
    AgentHeartbeatTimeout {
        agent_id: AgentId,
        last_seen: Option<DateTime<Utc>>,
    },
    AgentReady {
        agent_id: AgentId,
    },
    TaskCreated {
        workflow_id: WorkflowId,
        task_id: String,
    },
    TaskAssigned {
        agent_id: AgentId,
        workflow_id: WorkflowId,
        task_id: String,
        input: serde_json::Value,
    },
    TaskCompleted {
        agent_id: AgentId,
        task_id: String,
        output: serde_json::Value,
        #[serde(default)]
        duration_ms: Option<u64>,
    },
    TaskFailed {
        agent_id: AgentId,
        task_id: String,
        error: serde_json::Value,
        #[serde(default)]
        duration_ms: Option<u64>,
    },
    TaskCancelled {
        workflow_id: WorkflowId,
        task_id: String,
    },
    TaskSkipped {
        workflow_id: WorkflowId,
        task_id: String,
    },
    /// A request for the assigned agent to abort the named task.
    TaskCancel {
        agent_id: AgentId,
        task_id: String,
    },
    WorkflowStarted {
        workflow_id: WorkflowId,
        name: String,
    },
    WorkflowCompleted {
        workflow_id: WorkflowId,
    },
    WorkflowFailed {
        workflow_id: WorkflowId,
        reason: String,
    },
    WorkflowStopped {
        workflow_id: WorkflowId,
    },
    WorkflowProgress {
        workflow_id: WorkflowId,
        progress: WorkflowProgress,
    },
    PoolCreated {
        pool_id: uuid::Uuid,
        name: String,
        size: usize,
    },
    PoolScaled {
        pool_id: uuid::Uuid,
        from: usize,
        to: usize,
    },
    ProcessExit {
        agent_id: AgentId,
        exit_code: i32,
    },
    ProcessError {
        agent_id: AgentId,
        message: String,
    },
    RegistryUpdated {
        namespace: String,
        id: String,
    },
}

impl Event {
    pub fn topic(&self) -> Topic {
        match self {
            Event::AgentCreated { .. } => Topic::AgentCreated,
            Event::AgentStarted { .. } => Topic::AgentStarted,
            Event::AgentStopped { .. } => Topic::AgentStopped,
            Event::AgentError { .. } => Topic::AgentError,
            Event::AgentStatusChanged { .. } => Topic::AgentStatusChanged,
            Event::AgentHeartbeat { .. } => Topic::AgentHeartbeat,
            Event::AgentHeartbeatTimeout { .. } => Topic::AgentHeartbeatTimeout,
            Event::AgentReady { .. } => Topic::AgentReady,
            Event::TaskCreated { .. } => Topic::TaskCreated,
            Event::TaskAssigned { .. } => Topic::TaskAssigned,
            Event::TaskCompleted { .. } => Topic::TaskCompleted,
            Event::TaskFailed { .. } => Topic::TaskFailed,
            Event::TaskCancelled { .. } => Topic::TaskCancelled,
            Event::TaskSkipped { .. } => Topic::TaskSkipped,
            Event::TaskCancel { .. } => Topic::TaskCancel,
            Event::WorkflowStarted { .. } => Topic::WorkflowStarted,
            Event::WorkflowCompleted { .. } => Topic::WorkflowCompleted,
            Event::WorkflowFailed { .. } => Topic::WorkflowFailed,
            Event::WorkflowStopped { .. } => Topic::WorkflowStopped,
            Event::WorkflowProgress { .. } => Topic::WorkflowProgress,
            Event::PoolCreated { .. } => Topic::PoolCreated,
            Event::PoolScaled { .. } => Topic::PoolScaled,
            Event::ProcessExit { .. } => Topic::ProcessExit,
            Event::ProcessError { .. } => Topic::ProcessError,
            Event::RegistryUpdated { .. } => Topic::RegistryUpdated,
        }
    }

    /// The agent this event concerns, when it concerns exactly one.
    pub fn agent_id(&self) -> Option<AgentId> {
        match self {
            Event::AgentCreated { agent_id, .. }
            | Event::AgentStarted { agent_id }
            | Event::AgentStopped { agent_id, .. }
            | Event::AgentError { agent_id, .. }
            | Event::AgentStatusChanged { agent_id, .. }
            | Event::AgentHeartbeat { agent_id, .. }
            | Event::AgentHeartbeatTimeout { agent_id, .. }
            | Event::AgentReady { agent_id }
            | Event::TaskAssigned { agent_id, .. }
            | Event::TaskCompleted { agent_id, .. }
            | Event::TaskFailed { agent_id, .. }
            | Event::TaskCancel { agent_id, .. }
            | Event::ProcessExit { agent_id, .. }
            | Event::ProcessError { agent_id, .. } => Some(*agent_id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_display() {
        assert_eq!(Topic::AgentHeartbeatTimeout.to_string(), "agent:heartbeat-timeout");
        assert_eq!(Topic::WorkflowProgress.to_string(), "workflow:progress");
        assert_eq!(Topic::ProcessExit.to_string(), "process:exit");
    }

    #[test]
    fn test_event_topic_mapping() {
        let event = Event::AgentReady { agent_id: AgentId::new() };
        assert_eq!(event.topic(), Topic::AgentReady);

        let event = Event::ProcessExit { agent_id: AgentId::new(), exit_code: 0 };
        assert_eq!(event.topic(), Topic::ProcessExit);
    }

    #[test]
    fn test_event_serialization_tag() {
        let id = AgentId::new();
        let json = serde_json::to_string(&Event::AgentStarted { agent_id: id }).unwrap();
        assert!(json.contains("\"type\":\"agent_started\""));
        let parsed: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.agent_id(), Some(id));
    }
}
