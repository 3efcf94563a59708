//! The root of a corral deployment: one explicitly constructed object
//! that owns the bus, registry, supervisor, lifecycle manager, pool
//! controller, and workflow engine, and hands out shared handles.
//! There are no globals; everything is injected from here.

use corral_agent::{AgentManager, AgentOverrides, HealthMonitor, HealthMonitorConfig, ManagerConfig};
use corral_bus::EventBus;
use corral_core::{AgentId, CorralResult, WorkflowRecord};
use corral_engine::{WorkflowDocument, WorkflowEngine};
use corral_pool::PoolController;
use corral_registry::{Registry, RegistryBackend};
use corral_supervisor::Supervisor;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{info, warn};

/// Exit codes for an external control surface driving the runtime.
pub mod exit_code {
    /// Normal shutdown.
    pub const SUCCESS: i32 = 0;
    /// Fatal initialization failure.
    pub const INIT_FAILURE: i32 = 1;
    /// Unrecoverable internal error.
    pub const INTERNAL_ERROR: i32 = 2;
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub max_agents: usize,
    /// Grace window between soft-terminate and hard-kill.
    pub grace_timeout: Duration,
    /// Budget for draining all agents at shutdown.
    pub shutdown_timeout: Duration,
    pub restart_min_interval: Duration,
    pub heartbeat_check_interval: Duration,
    pub health_check_interval: Duration,
    pub baseline_execution_ms: f64,
    pub registry_staleness: Duration,
    pub pool_maintenance_interval: Duration,
    /// Advisory sizing hint; should be at least 10x `max_agents`.
    pub task_queue_size: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_agents: 32,
            grace_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(30),
            restart_min_interval: Duration::from_secs(30),
            heartbeat_check_interval: Duration::from_secs(10),
            health_check_interval: Duration::from_secs(30),
            baseline_execution_ms: 30_000.0,
            registry_staleness: Duration::from_secs(60),
            pool_maintenance_interval: Duration::from_secs(30),
            task_queue_size: 320,
        }
    }
}

/// One orchestrator instance owning local agent processes.
pub struct Runtime {
    bus: EventBus,
    registry: Arc<Registry>,
    supervisor: Arc<Supervisor>,
    manager: Arc<AgentManager>,
    pools: Arc<PoolController>,
    engine: Arc<WorkflowEngine>,
    config: RuntimeConfig,
    shutdown_tx: watch::Sender<bool>,
    loops: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Runtime {
    /// Construct the runtime and start the background loops (event
    /// intake, health monitoring, pool maintenance).
    pub fn new(config: RuntimeConfig, backend: Arc<dyn RegistryBackend>) -> Arc<Self> {
        if config.task_queue_size < 10 * config.max_agents {
            // Advisory only; an undersized queue just risks dispatch stalls.
            warn!(
                task_queue_size = config.task_queue_size,
                max_agents = config.max_agents,
                "task queue size below 10x max agents"
            );
        }

        let bus = EventBus::default();
        let registry = Arc::new(
            Registry::new(backend, bus.clone()).with_staleness(config.registry_staleness),
        );
        let supervisor =
            Arc::new(Supervisor::new(bus.clone()).with_grace_timeout(config.grace_timeout));
        let manager = Arc::new(AgentManager::new(
            bus.clone(),
            Arc::clone(&registry),
            Arc::clone(&supervisor),
            ManagerConfig {
                max_agents: config.max_agents,
                restart_min_interval: config.restart_min_interval,
            },
        ));
        let pools = Arc::new(
            PoolController::new(Arc::clone(&manager), bus.clone())
                .with_maintenance_interval(config.pool_maintenance_interval),
        );
        let engine = Arc::new(WorkflowEngine::new(bus.clone(), Arc::clone(&registry)));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let monitor = Arc::new(HealthMonitor::new(
            Arc::clone(&manager),
            HealthMonitorConfig {
                heartbeat_check_interval: config.heartbeat_check_interval,
                health_check_interval: config.health_check_interval,
                baseline_execution_ms: config.baseline_execution_ms,
            },
        ));

        let loops = vec![
            manager.run(shutdown_rx.clone()),
            monitor.spawn(shutdown_rx.clone()),
            pools.spawn_maintenance(shutdown_rx),
        ];

        info!(max_agents = config.max_agents, "corral runtime started");
        Arc::new(Self {
            bus,
            registry,
            supervisor,
            manager,
            pools,
            engine,
            config,
            shutdown_tx,
            loops: Mutex::new(loops),
        })
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    pub fn manager(&self) -> &Arc<AgentManager> {
        &self.manager
    }

    pub fn pools(&self) -> &Arc<PoolController> {
        &self.pools
    }

    pub fn engine(&self) -> &Arc<WorkflowEngine> {
        &self.engine
    }

    /// Observers can watch this to learn the runtime is going down.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Reload agents persisted by an earlier run; they come back
    /// `offline`, ready for `start_agent`.
    pub async fn recover(&self) -> CorralResult<usize> {
        self.manager.recover_persisted().await
    }

    /// Execute a workflow document, creating and starting one agent per
    /// declared agent entry (its `kind` names the template). Declared
    /// agents are stopped again once the workflow reaches a terminal
    /// status.
    pub async fn execute_workflow(&self, doc: WorkflowDocument) -> CorralResult<WorkflowRecord> {
        let mut declared: HashMap<String, AgentId> = HashMap::new();
        for agent in &doc.agents {
            let overrides = AgentOverrides {
                name: agent.name.clone(),
                ..AgentOverrides::default()
            };
            let started = async {
                let id = self.manager.create_agent(&agent.kind, overrides).await?;
                self.manager.start_agent(id).await?;
                Ok(id)
            }
            .await;
            match started {
                Ok(id) => {
                    declared.insert(agent.id.clone(), id);
                }
                Err(e) => {
                    self.stop_declared(&declared, "startup aborted").await;
                    return Err(e);
                }
            }
        }

        let result = self.engine.execute_with_agents(doc, declared.clone()).await;
        self.stop_declared(&declared, "workflow finished").await;
        result
    }

    async fn stop_declared(&self, declared: &HashMap<String, AgentId>, reason: &str) {
        for id in declared.values() {
            if let Err(e) = self.manager.stop_agent(*id, reason).await {
                warn!(agent_id = %id, error = %e, "stopping declared agent failed");
            }
        }
    }

    /// Orderly shutdown: stop new work, broadcast stop to every agent
    /// with reason `shutdown`, wait out the budget, then force-kill
    /// residuals. Safe to call more than once.
    pub async fn shutdown(&self) {
        if *self.shutdown_tx.borrow() {
            return;
        }
        info!("corral runtime shutting down");
        let _ = self.shutdown_tx.send(true);

        // New work stops first: pool acquires fail with Cancelled.
        self.pools.notify_shutdown().await;

        if tokio::time::timeout(
            self.config.shutdown_timeout,
            self.manager.stop_all("shutdown"),
        )
        .await
        .is_err()
        {
            warn!("shutdown budget exceeded; residual agents were force-killed by their stop protocol");
        }

        let mut loops = self.loops.lock().await;
        for handle in loops.drain(..) {
            handle.abort();
        }
    }
}
