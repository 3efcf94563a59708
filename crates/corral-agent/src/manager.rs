use crate::template::{AgentOverrides, AgentTemplate, TemplateRegistry};
use corral_bus::{Event, EventBus, HeartbeatMetrics, Topic};
use corral_core::{
    AgentErrorEntry, AgentId, AgentRecord, AgentStatus, CorralError, CorralResult, ErrorSeverity,
    ResourceSample,
};
use corral_registry::Registry;
use corral_supervisor::{ProcessHandle, SignalKind, SpawnSpec, Supervisor};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Hard cap on concurrently active (non-terminated) agents.
    pub max_agents: usize,
    /// Minimum spacing between restarts of one agent.
    pub restart_min_interval: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_agents: 32,
            restart_min_interval: Duration::from_secs(30),
        }
    }
}

/// Exclusive owner of agent records. Every mutation goes through this
/// manager, which writes the record through to the registry and signals
/// the change on the bus.
pub struct AgentManager {
    bus: EventBus,
    registry: Arc<Registry>,
    supervisor: Arc<Supervisor>,
    templates: TemplateRegistry,
    config: ManagerConfig,
    agents: RwLock<HashMap<AgentId, AgentRecord>>,
    handles: RwLock<HashMap<AgentId, Arc<ProcessHandle>>>,
    last_restart: Mutex<HashMap<AgentId, Instant>>,
    instance_counters: Mutex<HashMap<String, u64>>,
}

impl AgentManager {
    pub fn new(
        bus: EventBus,
        registry: Arc<Registry>,
        supervisor: Arc<Supervisor>,
        config: ManagerConfig,
    ) -> Self {
        Self {
            bus,
            registry,
            supervisor,
            templates: TemplateRegistry::new(),
            config,
            agents: RwLock::new(HashMap::new()),
            handles: RwLock::new(HashMap::new()),
            last_restart: Mutex::new(HashMap::new()),
            instance_counters: Mutex::new(HashMap::new()),
        }
    }

    pub fn templates(&self) -> &TemplateRegistry {
        &self.templates
    }

    pub async fn get_agent(&self, id: AgentId) -> Option<AgentRecord> {
        self.agents.read().await.get(&id).cloned()
    }

    pub async fn list_agents(&self) -> Vec<AgentRecord> {
        let mut agents: Vec<AgentRecord> = self.agents.read().await.values().cloned().collect();
        agents.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        agents
    }

    pub async fn active_count(&self) -> usize {
        self.agents
            .read()
            .await
            .values()
            .filter(|a| a.status != AgentStatus::Terminated)
            .count()
    }

    /// Instantiate a template. Fails with `LimitExceeded` once the active
    /// agent cap is reached; the new record is persisted in
    /// `initializing` and announced with `agent:created`.
    pub async fn create_agent(
        &self,
        template_name: &str,
        overrides: AgentOverrides,
    ) -> CorralResult<AgentId> {
        let template = self.templates.get(template_name)?;

        if self.active_count().await >= self.config.max_agents {
            return Err(CorralError::LimitExceeded(format!(
                "active agent cap {} reached",
                self.config.max_agents
            )));
        }

        let name = match overrides.name {
            Some(name) => name,
            None => {
                let mut counters = self.instance_counters.lock().await;
                let n = counters.entry(template.name.clone()).or_insert(0);
                *n += 1;
                format!("{}-{}", template.name, n)
            }
        };

        let mut record = AgentRecord::new(name, template.kind.clone(), template.name.clone());
        record.capabilities = overrides.capabilities.unwrap_or_else(|| template.capabilities.clone());
        record.config = overrides.config.unwrap_or_else(|| template.config.clone());
        record.environment = overrides.environment.unwrap_or_else(|| template.environment.clone());
        let id = record.id;

        self.registry.put_agent(&record).await?;
        self.agents.write().await.insert(id, record);
        info!(agent_id = %id, template = template_name, "agent created");
        self.bus.publish(Event::AgentCreated {
            agent_id: id,
            template: template_name.to_string(),
        });
        Ok(id)
    }

    /// Spawn the agent process and wait for its `agent:ready` signal.
    /// On failure the record flips to `error` with a critical
    /// `startup_failed` entry and remains inspectable.
    pub async fn start_agent(&self, id: AgentId) -> CorralResult<()> {
        let record = self
            .get_agent(id)
            .await
            .ok_or_else(|| CorralError::NotFound(format!("agent {id}")))?;
        if matches!(record.status, AgentStatus::Idle | AgentStatus::Busy) {
            return Ok(());
        }
        let template = self.templates.get(&record.template)?;

        // Take the receiver before any start side effects so a fast
        // child's ready signal cannot be missed.
        let ready_rx = self.bus.receiver();

        self.set_status(id, AgentStatus::Initializing).await?;
        let spec = self.spawn_spec(&record, &template);
        let handle = match self.supervisor.spawn(spec).await {
            Ok(handle) => Arc::new(handle),
            Err(e) => {
                self.fail_startup(id, &e.to_string()).await;
                return Err(e);
            }
        };
        self.handles.write().await.insert(id, handle.clone());

        match EventBus::wait_on(
            ready_rx,
            Topic::AgentReady,
            |e| e.agent_id() == Some(id),
            template.startup_timeout(),
        )
        .await
        {
            Ok(_) => {
                self.with_agent(id, |agent| {
                    agent.last_heartbeat_at = Some(chrono::Utc::now());
                })
                .await?;
                self.set_status(id, AgentStatus::Idle).await?;
                info!(agent_id = %id, "agent started");
                self.bus.publish(Event::AgentStarted { agent_id: id });
                Ok(())
            }
            Err(_) => {
                let _ = self.supervisor.signal(&handle, SignalKind::Hard);
                self.handles.write().await.remove(&id);
                let message = format!(
                    "no ready signal within {:?}",
                    template.startup_timeout()
                );
                self.fail_startup(id, &message).await;
                Err(CorralError::ProcessFailed(format!("agent {id}: {message}")))
            }
        }
    }

    /// Graceful stop. Stopping an already-terminated agent is a no-op.
    pub async fn stop_agent(&self, id: AgentId, reason: &str) -> CorralResult<()> {
        let record = self
            .get_agent(id)
            .await
            .ok_or_else(|| CorralError::NotFound(format!("agent {id}")))?;
        if record.status == AgentStatus::Terminated {
            return Ok(());
        }

        self.set_status(id, AgentStatus::Terminating).await?;

        if let Some(handle) = self.handles.write().await.remove(&id) {
            if let Err(e) = self.supervisor.stop(&handle).await {
                warn!(agent_id = %id, error = %e, "stopping agent process failed");
            }
        }

        self.with_agent(id, |agent| agent.workload = 0).await?;
        self.set_status(id, AgentStatus::Terminated).await?;
        info!(agent_id = %id, reason, "agent stopped");
        self.bus.publish(Event::AgentStopped {
            agent_id: id,
            reason: reason.to_string(),
        });
        Ok(())
    }

    /// Stop-then-start, rate-limited to one restart per agent per
    /// `restart_min_interval`.
    pub async fn restart_agent(&self, id: AgentId, reason: &str) -> CorralResult<()> {
        {
            let mut marks = self.last_restart.lock().await;
            if let Some(last) = marks.get(&id) {
                if last.elapsed() < self.config.restart_min_interval {
                    return Err(CorralError::LimitExceeded(format!(
                        "agent {id} restarted less than {:?} ago",
                        self.config.restart_min_interval
                    )));
                }
            }
            marks.insert(id, Instant::now());
        }
        info!(agent_id = %id, reason, "restarting agent");
        self.stop_agent(id, reason).await?;
        self.start_agent(id).await
    }

    /// Stop the agent if needed and delete its record, preserving an
    /// archived copy.
    pub async fn remove_agent(&self, id: AgentId) -> CorralResult<()> {
        if self.get_agent(id).await.is_none() {
            return Err(CorralError::NotFound(format!("agent {id}")));
        }
        self.stop_agent(id, "removed").await?;
        self.agents.write().await.remove(&id);
        self.registry
            .delete(corral_registry::Namespace::Agents, &id.to_string(), true)
            .await
    }

    /// Load agent records persisted by an earlier run. Recovered agents
    /// come back `offline` with no workload; their template provenance
    /// makes a subsequent `start_agent` deterministic.
    pub async fn recover_persisted(&self) -> CorralResult<usize> {
        let docs = self
            .registry
            .query(
                corral_registry::Namespace::Agents,
                &corral_registry::QueryPredicate::default().kind("agent"),
            )
            .await?;
        let mut recovered = 0;
        for doc in docs {
            let mut record: AgentRecord = match serde_json::from_value(doc.payload) {
                Ok(record) => record,
                Err(e) => {
                    warn!(id = %doc.id, error = %e, "skipping undecodable persisted agent");
                    continue;
                }
            };
            let mut agents = self.agents.write().await;
            if agents.contains_key(&record.id) {
                continue;
            }
            record.status = AgentStatus::Offline;
            record.workload = 0;
            record.last_heartbeat_at = None;
            info!(agent_id = %record.id, template = %record.template, "recovered persisted agent");
            agents.insert(record.id, record);
            recovered += 1;
        }
        Ok(recovered)
    }

    /// Mark a missed-heartbeat agent as errored. Returns the template's
    /// auto-restart flag so the caller can schedule recovery.
    pub async fn mark_heartbeat_timeout(&self, id: AgentId) -> CorralResult<bool> {
        let record = self
            .get_agent(id)
            .await
            .ok_or_else(|| CorralError::NotFound(format!("agent {id}")))?;
        if !matches!(record.status, AgentStatus::Idle | AgentStatus::Busy) {
            return Ok(false);
        }
        let template = self.templates.get(&record.template)?;

        self.with_agent(id, |agent| {
            agent.record_error(AgentErrorEntry::new(
                "heartbeat_timeout",
                "agent missed three heartbeat intervals",
                ErrorSeverity::High,
            ));
        })
        .await?;
        self.set_status(id, AgentStatus::Error).await?;
        self.bus.publish(Event::AgentHeartbeatTimeout {
            agent_id: id,
            last_seen: record.last_heartbeat_at,
        });
        Ok(template.auto_restart)
    }

    /// Fold a health score computed by the monitor into the record.
    pub async fn update_health(&self, id: AgentId, overall: f64) -> CorralResult<()> {
        self.with_agent(id, |agent| agent.health = overall.clamp(0.0, 1.0))
            .await?;
        Ok(())
    }

    /// Whether a restart would currently pass the rate limit.
    pub async fn restart_allowed(&self, id: AgentId) -> bool {
        let marks = self.last_restart.lock().await;
        marks
            .get(&id)
            .map(|last| last.elapsed() >= self.config.restart_min_interval)
            .unwrap_or(true)
    }

    /// Stop every non-terminated agent, used at shutdown.
    pub async fn stop_all(&self, reason: &str) {
        let ids: Vec<AgentId> = self
            .agents
            .read()
            .await
            .values()
            .filter(|a| a.status != AgentStatus::Terminated)
            .map(|a| a.id)
            .collect();
        for id in ids {
            if let Err(e) = self.stop_agent(id, reason).await {
                warn!(agent_id = %id, error = %e, "shutdown stop failed");
            }
        }
    }

    /// Event intake loop: heartbeats, task accounting, and unexpected
    /// process exits. Runs until the shutdown signal flips.
    pub fn run(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        let mut rx = manager.bus.receiver();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    event = rx.recv() => match event {
                        Ok(event) => manager.handle_event(event).await,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!(skipped = n, "agent manager lagged on bus events");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
            debug!("agent manager event loop stopped");
        })
    }

    async fn handle_event(self: &Arc<Self>, event: Event) {
        match event {
            Event::AgentHeartbeat {
                agent_id,
                timestamp,
                metrics,
            } => self.on_heartbeat(agent_id, timestamp, metrics).await,
            Event::TaskAssigned { agent_id, .. } => {
                if self.get_agent(agent_id).await.is_none() {
                    return;
                }
                let _ = self
                    .with_agent(agent_id, |agent| {
                        agent.workload =
                            (agent.workload + 1).min(agent.capabilities.max_concurrent_tasks);
                        agent.touch();
                    })
                    .await;
                let _ = self.reflect_workload_status(agent_id).await;
            }
            Event::TaskCompleted {
                agent_id,
                task_id,
                duration_ms,
                ..
            } => {
                self.on_task_finished(agent_id, &task_id, true, duration_ms)
                    .await
            }
            Event::TaskFailed {
                agent_id,
                task_id,
                duration_ms,
                ..
            } => {
                self.on_task_finished(agent_id, &task_id, false, duration_ms)
                    .await
            }
            Event::ProcessExit { agent_id, exit_code } => {
                self.on_process_exit(agent_id, exit_code).await
            }
            _ => {}
        }
    }

    async fn on_heartbeat(
        &self,
        id: AgentId,
        timestamp: chrono::DateTime<chrono::Utc>,
        metrics: Option<HeartbeatMetrics>,
    ) {
        let Some(record) = self.get_agent(id).await else {
            return;
        };
        let recovering = record.status == AgentStatus::Error;
        let result = self
            .with_agent(id, |agent| {
                agent.last_heartbeat_at = Some(timestamp);
                agent.touch();
                if let Some(m) = &metrics {
                    agent.metrics.last_resource_sample = Some(ResourceSample {
                        memory: m.memory_used.zip(m.memory_limit),
                        cpu: m.cpu_used.zip(m.cpu_limit),
                        disk: m.disk_used.zip(m.disk_limit),
                    });
                }
                if recovering {
                    agent.resolve_errors();
                }
            })
            .await;
        if result.is_err() {
            return;
        }
        if recovering {
            // A successful heartbeat recovers an errored agent.
            let next = if record.workload > 0 {
                AgentStatus::Busy
            } else {
                AgentStatus::Idle
            };
            if let Err(e) = self.set_status(id, next).await {
                warn!(agent_id = %id, error = %e, "heartbeat recovery failed");
            }
        }
    }

    async fn on_task_finished(&self, id: AgentId, task_id: &str, succeeded: bool, duration_ms: Option<u64>) {
        if self.get_agent(id).await.is_none() {
            return;
        }
        let _ = self
            .with_agent(id, |agent| {
                agent.workload = agent.workload.saturating_sub(1);
                agent.record_task_outcome(task_id, succeeded, duration_ms.unwrap_or(0));
            })
            .await;
        let _ = self.reflect_workload_status(id).await;
    }

    async fn on_process_exit(self: &Arc<Self>, id: AgentId, exit_code: i32) {
        self.handles.write().await.remove(&id);
        let Some(record) = self.get_agent(id).await else {
            return;
        };
        // Expected during stop/restart; only an exit from a live state is a fault.
        if !matches!(record.status, AgentStatus::Idle | AgentStatus::Busy) {
            return;
        }
        error!(agent_id = %id, exit_code, "agent process died unexpectedly");
        let _ = self
            .with_agent(id, |agent| {
                agent.record_error(
                    AgentErrorEntry::new(
                        "process_exit",
                        format!("process exited with code {exit_code}"),
                        ErrorSeverity::Critical,
                    )
                    .with_context("exit_code", exit_code.to_string()),
                );
            })
            .await;
        let _ = self.set_status(id, AgentStatus::Error).await;

        let auto_restart = self
            .templates
            .get(&record.template)
            .map(|t| t.auto_restart)
            .unwrap_or(false);
        if auto_restart && self.restart_allowed(id).await {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(e) = manager.restart_agent(id, "process exit").await {
                    warn!(agent_id = %id, error = %e, "auto-restart after crash failed");
                }
            });
        }
    }

    /// Keep idle/busy in step with the workload counter.
    async fn reflect_workload_status(&self, id: AgentId) -> CorralResult<()> {
        let Some(record) = self.get_agent(id).await else {
            return Ok(());
        };
        match (record.status, record.workload) {
            (AgentStatus::Idle, w) if w > 0 => self.set_status(id, AgentStatus::Busy).await,
            (AgentStatus::Busy, 0) => self.set_status(id, AgentStatus::Idle).await,
            _ => Ok(()),
        }
    }

    async fn set_status(&self, id: AgentId, to: AgentStatus) -> CorralResult<()> {
        let (from, updated) = {
            let mut agents = self.agents.write().await;
            let agent = agents
                .get_mut(&id)
                .ok_or_else(|| CorralError::NotFound(format!("agent {id}")))?;
            let from = agent.status;
            if from == to {
                return Ok(());
            }
            // Terminated is absorbing except for an explicit restart.
            if from == AgentStatus::Terminated && to != AgentStatus::Initializing {
                return Err(CorralError::InvalidArgument(format!(
                    "agent {id} is terminated"
                )));
            }
            agent.status = to;
            agent.touch();
            (from, agent.clone())
        };
        self.registry.put_agent(&updated).await?;
        self.bus.publish(Event::AgentStatusChanged {
            agent_id: id,
            from,
            to,
        });
        Ok(())
    }

    async fn with_agent<F>(&self, id: AgentId, f: F) -> CorralResult<AgentRecord>
    where
        F: FnOnce(&mut AgentRecord),
    {
        let updated = {
            let mut agents = self.agents.write().await;
            let agent = agents
                .get_mut(&id)
                .ok_or_else(|| CorralError::NotFound(format!("agent {id}")))?;
            f(agent);
            agent.clone()
        };
        self.registry.put_agent(&updated).await?;
        Ok(updated)
    }

    async fn fail_startup(&self, id: AgentId, message: &str) {
        error!(agent_id = %id, message, "agent startup failed");
        let _ = self
            .with_agent(id, |agent| {
                agent.record_error(AgentErrorEntry::new(
                    "startup_failed",
                    message,
                    ErrorSeverity::Critical,
                ));
            })
            .await;
        let _ = self.set_status(id, AgentStatus::Error).await;
        self.bus.publish(Event::AgentError {
            agent_id: id,
            kind: "startup_failed".to_string(),
            message: message.to_string(),
            severity: ErrorSeverity::Critical,
        });
    }

    fn spawn_spec(&self, record: &AgentRecord, template: &AgentTemplate) -> SpawnSpec {
        let mut spec = SpawnSpec::new(record.id, template.program.clone());
        spec.args = template.args.clone();
        spec.agent_kind = record.kind.clone();
        spec.agent_name = record.name.clone();
        spec.working_dir = record.environment.working_dir.as_ref().map(PathBuf::from);
        spec.log_dir = record.environment.log_dir.as_ref().map(PathBuf::from);
        spec.config = serde_json::to_value(&record.config).unwrap_or(serde_json::Value::Null);
        spec
    }
}
