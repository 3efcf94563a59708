use crate::scaling::{default_rules, Metric, ScaleAction, ScalingRule};
use chrono::{DateTime, Utc};
use corral_agent::{AgentManager, AgentOverrides};
use corral_bus::{Event, EventBus};
use corral_core::{AgentId, AgentStatus, CorralError, CorralResult};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex, Notify, RwLock};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct PoolId(pub uuid::Uuid);

impl PoolId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for PoolId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for PoolId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub min_size: usize,
    pub max_size: usize,
    pub auto_scale: bool,
    pub scale_up_at: f64,
    pub scale_down_at: f64,
    /// An agent is destroyed and replaced after this many uses.
    pub recycle_after: u32,
    /// Cooldown between scaling-policy actions.
    pub scale_cooldown: Duration,
    /// Idle agents older than this are recycled by maintenance.
    pub idle_recycle_after: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min_size: 1,
            max_size: 4,
            auto_scale: true,
            scale_up_at: 0.8,
            scale_down_at: 0.25,
            recycle_after: 100,
            scale_cooldown: Duration::from_secs(300),
            idle_recycle_after: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub name: String,
    pub template: String,
    pub min_size: usize,
    pub max_size: usize,
    pub current_size: usize,
    pub available: usize,
    pub busy: usize,
    pub waiters: usize,
    pub utilization: f64,
}

struct PoolState {
    name: String,
    template: String,
    settings: PoolSettings,
    rules: Vec<ScalingRule>,
    /// Idle members, most recently released last.
    available: Vec<AgentId>,
    busy: HashSet<AgentId>,
    /// available + busy, plus in-flight growth reservations.
    current_size: usize,
    use_count: HashMap<AgentId, u32>,
    last_activity: HashMap<AgentId, DateTime<Utc>>,
    waiters: usize,
    last_scale_action: Option<Instant>,
}

impl PoolState {
    fn utilization(&self) -> f64 {
        if self.current_size == 0 {
            0.0
        } else {
            self.busy.len() as f64 / self.current_size as f64
        }
    }
}

struct PoolInner {
    id: PoolId,
    state: Mutex<PoolState>,
    released: Notify,
}

/// Creates pools, hands agents out and back, and runs the maintenance
/// and scaling loops.
pub struct PoolController {
    manager: Arc<AgentManager>,
    bus: EventBus,
    pools: RwLock<HashMap<PoolId, Arc<PoolInner>>>,
    closed: AtomicBool,
    maintenance_interval: Duration,
}

impl PoolController {
    pub fn new(manager: Arc<AgentManager>, bus: EventBus) -> Self {
        Self {
            manager,
            bus,
            pools: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
            maintenance_interval: Duration::from_secs(30),
        }
    }

    pub fn with_maintenance_interval(mut self, interval: Duration) -> Self {
        self.maintenance_interval = interval;
        self
    }

    /// Create a pool and start `min_size` agents into it.
    pub async fn create_pool(
        &self,
        name: impl Into<String>,
        template: &str,
        settings: PoolSettings,
    ) -> CorralResult<PoolId> {
        if settings.min_size > settings.max_size || settings.max_size == 0 {
            return Err(CorralError::InvalidArgument(format!(
                "pool bounds min={} max={} are invalid",
                settings.min_size, settings.max_size
            )));
        }
        // Fails early on an unknown template.
        self.manager.templates().get(template)?;

        let name = name.into();
        let rules = default_rules(settings.scale_up_at, settings.scale_down_at);
        let inner = Arc::new(PoolInner {
            id: PoolId::new(),
            state: Mutex::new(PoolState {
                name: name.clone(),
                template: template.to_string(),
                settings: settings.clone(),
                rules,
                available: Vec::new(),
                busy: HashSet::new(),
                current_size: 0,
                use_count: HashMap::new(),
                last_activity: HashMap::new(),
                waiters: 0,
                last_scale_action: None,
            }),
            released: Notify::new(),
        });

        for _ in 0..settings.min_size {
            let agent_id = match self.spawn_member(template).await {
                Ok(agent_id) => agent_id,
                Err(e) => {
                    // Tear down whatever was already started.
                    let members: Vec<AgentId> =
                        inner.state.lock().await.available.drain(..).collect();
                    for member in members {
                        let _ = self.manager.remove_agent(member).await;
                    }
                    return Err(e);
                }
            };
            let mut st = inner.state.lock().await;
            st.available.push(agent_id);
            st.current_size += 1;
            st.last_activity.insert(agent_id, Utc::now());
        }

        let id = inner.id;
        self.pools.write().await.insert(id, inner);
        info!(pool_id = %id, name, template, size = settings.min_size, "pool created");
        self.bus.publish(Event::PoolCreated {
            pool_id: id.0,
            name,
            size: settings.min_size,
        });
        Ok(id)
    }

    /// Take an agent out of the pool, growing by one when empty, covered
    /// by auto-scale, and under max; otherwise wait for a release up to
    /// `timeout`.
    pub async fn acquire(&self, pool_id: PoolId, timeout: Duration) -> CorralResult<AgentId> {
        let deadline = Instant::now() + timeout;
        let inner = self.pool(pool_id).await?;

        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(CorralError::Cancelled("pool controller is shut down".into()));
            }

            enum Plan {
                Got(AgentId),
                Grow(String),
                Wait,
            }

            let plan = {
                let mut st = inner.state.lock().await;
                if let Some(agent_id) = st.available.pop() {
                    st.busy.insert(agent_id);
                    *st.use_count.entry(agent_id).or_insert(0) += 1;
                    st.last_activity.insert(agent_id, Utc::now());
                    Plan::Got(agent_id)
                } else if st.settings.auto_scale && st.current_size < st.settings.max_size {
                    // Reserve the slot before the slow spawn.
                    st.current_size += 1;
                    Plan::Grow(st.template.clone())
                } else {
                    st.waiters += 1;
                    Plan::Wait
                }
            };

            match plan {
                Plan::Got(agent_id) => {
                    debug!(pool_id = %pool_id, agent_id = %agent_id, "acquired from pool");
                    return Ok(agent_id);
                }
                Plan::Grow(template) => match self.spawn_member(&template).await {
                    Ok(agent_id) => {
                        let mut st = inner.state.lock().await;
                        st.busy.insert(agent_id);
                        st.use_count.insert(agent_id, 1);
                        st.last_activity.insert(agent_id, Utc::now());
                        info!(pool_id = %pool_id, agent_id = %agent_id, size = st.current_size,
                            "pool grew under acquire pressure");
                        return Ok(agent_id);
                    }
                    Err(e) => {
                        let mut st = inner.state.lock().await;
                        st.current_size -= 1;
                        warn!(pool_id = %pool_id, error = %e, "pool growth failed");
                        // Fall through to waiting for a release.
                        st.waiters += 1;
                        drop(st);
                        self.wait_for_release(&inner, deadline).await?;
                    }
                },
                Plan::Wait => {
                    self.wait_for_release(&inner, deadline).await?;
                }
            }
        }
    }

    async fn wait_for_release(&self, inner: &PoolInner, deadline: Instant) -> CorralResult<()> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let result = if remaining.is_zero() {
            Err(())
        } else {
            tokio::time::timeout(remaining, inner.released.notified())
                .await
                .map_err(|_| ())
        };
        {
            let mut st = inner.state.lock().await;
            st.waiters = st.waiters.saturating_sub(1);
        }
        result.map_err(|_| {
            CorralError::NoCapacity(format!("pool {} acquire timed out", inner.id))
        })
    }

    /// Return an agent. Worn-out or dead members are destroyed and, when
    /// that would leave the pool under min, replaced.
    pub async fn release(&self, pool_id: PoolId, agent_id: AgentId) -> CorralResult<()> {
        let inner = self.pool(pool_id).await?;
        let alive = matches!(
            self.manager.get_agent(agent_id).await.map(|a| a.status),
            Some(AgentStatus::Idle) | Some(AgentStatus::Busy)
        );

        let (recycle, need_replace) = {
            let mut st = inner.state.lock().await;
            if !st.busy.remove(&agent_id) {
                return Err(CorralError::NotFound(format!(
                    "agent {agent_id} is not checked out of pool {pool_id}"
                )));
            }
            let worn_out = st
                .use_count
                .get(&agent_id)
                .map(|n| *n >= st.settings.recycle_after)
                .unwrap_or(false);
            if alive && !worn_out {
                st.available.push(agent_id);
                st.last_activity.insert(agent_id, Utc::now());
                (false, false)
            } else {
                st.current_size -= 1;
                st.use_count.remove(&agent_id);
                st.last_activity.remove(&agent_id);
                (true, st.current_size < st.settings.min_size)
            }
        };

        if recycle {
            debug!(pool_id = %pool_id, agent_id = %agent_id, alive, "recycling pool member");
            if let Err(e) = self.manager.remove_agent(agent_id).await {
                warn!(agent_id = %agent_id, error = %e, "destroying pool member failed");
            }
            if need_replace {
                self.replenish_one(&inner).await;
            }
        }

        inner.released.notify_one();
        Ok(())
    }

    /// Resize within [min, max]. Growth keeps template order and stable
    /// instance numbering; shrink takes the least recently used members
    /// of the available set.
    pub async fn scale_pool(&self, pool_id: PoolId, target: usize) -> CorralResult<()> {
        let inner = self.pool(pool_id).await?;

        enum Direction {
            Grow { by: usize, template: String },
            Shrink { victims: Vec<AgentId> },
        }

        let (from, direction) = {
            let mut st = inner.state.lock().await;
            if target < st.settings.min_size || target > st.settings.max_size {
                return Err(CorralError::LimitExceeded(format!(
                    "target {target} outside pool bounds [{}, {}]",
                    st.settings.min_size, st.settings.max_size
                )));
            }
            let from = st.current_size;
            if target >= from {
                st.current_size = target;
                (
                    from,
                    Direction::Grow {
                        by: target - from,
                        template: st.template.clone(),
                    },
                )
            } else {
                let mut idle: Vec<AgentId> = st.available.clone();
                idle.sort_by_key(|id| {
                    st.last_activity
                        .get(id)
                        .copied()
                        .unwrap_or_else(|| DateTime::<Utc>::MIN_UTC)
                });
                let victims: Vec<AgentId> = idle.into_iter().take(from - target).collect();
                st.available.retain(|id| !victims.contains(id));
                st.current_size -= victims.len();
                for id in &victims {
                    st.use_count.remove(id);
                    st.last_activity.remove(id);
                }
                (from, Direction::Shrink { victims })
            }
        };

        match direction {
            Direction::Grow { by, template } => {
                for _ in 0..by {
                    match self.spawn_member(&template).await {
                        Ok(agent_id) => {
                            let mut st = inner.state.lock().await;
                            st.available.push(agent_id);
                            st.last_activity.insert(agent_id, Utc::now());
                            drop(st);
                            inner.released.notify_one();
                        }
                        Err(e) => {
                            let mut st = inner.state.lock().await;
                            st.current_size -= 1;
                            warn!(pool_id = %pool_id, error = %e, "scale-up spawn failed");
                        }
                    }
                }
            }
            Direction::Shrink { victims } => {
                for agent_id in victims {
                    if let Err(e) = self.manager.remove_agent(agent_id).await {
                        warn!(agent_id = %agent_id, error = %e, "scale-down removal failed");
                    }
                }
            }
        }

        let to = inner.state.lock().await.current_size;
        info!(pool_id = %pool_id, from, to, "pool scaled");
        self.bus.publish(Event::PoolScaled {
            pool_id: pool_id.0,
            from,
            to,
        });
        Ok(())
    }

    /// Replace the pool's scaling policy. Rules are evaluated top to
    /// bottom; the first match per cooldown window fires.
    pub async fn set_scaling_rules(
        &self,
        pool_id: PoolId,
        rules: Vec<ScalingRule>,
    ) -> CorralResult<()> {
        let inner = self.pool(pool_id).await?;
        inner.state.lock().await.rules = rules;
        Ok(())
    }

    pub async fn stats(&self, pool_id: PoolId) -> CorralResult<PoolStats> {
        let inner = self.pool(pool_id).await?;
        let st = inner.state.lock().await;
        Ok(PoolStats {
            name: st.name.clone(),
            template: st.template.clone(),
            min_size: st.settings.min_size,
            max_size: st.settings.max_size,
            current_size: st.current_size,
            available: st.available.len(),
            busy: st.busy.len(),
            waiters: st.waiters,
            utilization: st.utilization(),
        })
    }

    pub async fn pool_ids(&self) -> Vec<PoolId> {
        self.pools.read().await.keys().copied().collect()
    }

    /// Stop handing out agents; pending and future acquires fail with
    /// `Cancelled`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub async fn notify_shutdown(&self) {
        self.close();
        for inner in self.pools.read().await.values() {
            inner.released.notify_waiters();
        }
    }

    /// Maintenance loop: dead members are swept out, min size is
    /// replenished, stale idlers recycled, and the scaling policy is
    /// evaluated once per cooldown window.
    pub fn spawn_maintenance(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(controller.maintenance_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = tick.tick() => {
                        let ids = controller.pool_ids().await;
                        for id in ids {
                            controller.maintain_pool(id).await;
                            controller.evaluate_scaling(id).await;
                        }
                    }
                }
            }
            debug!("pool maintenance stopped");
        })
    }

    async fn maintain_pool(&self, pool_id: PoolId) {
        let Ok(inner) = self.pool(pool_id).await else {
            return;
        };

        // Sweep dead and stale-idle members out of the available set.
        let (victims, mut deficit) = {
            let mut st = inner.state.lock().await;
            let now = Utc::now();
            let idle_cutoff =
                chrono::Duration::from_std(st.settings.idle_recycle_after).unwrap_or_else(|_| chrono::Duration::seconds(300));
            let mut victims = Vec::new();
            for agent_id in st.available.clone() {
                let alive = matches!(
                    self.manager.get_agent(agent_id).await.map(|a| a.status),
                    Some(AgentStatus::Idle) | Some(AgentStatus::Busy)
                );
                let stale = st
                    .last_activity
                    .get(&agent_id)
                    .map(|t| now.signed_duration_since(*t) > idle_cutoff)
                    .unwrap_or(false);
                if !alive || stale {
                    victims.push((agent_id, alive));
                }
            }
            for (agent_id, _) in &victims {
                st.available.retain(|id| id != agent_id);
                st.use_count.remove(agent_id);
                st.last_activity.remove(agent_id);
                st.current_size -= 1;
            }
            let deficit = st.settings.min_size.saturating_sub(st.current_size);
            (victims, deficit)
        };

        for (agent_id, alive) in victims {
            debug!(pool_id = %pool_id, agent_id = %agent_id, alive, "maintenance recycling member");
            if let Err(e) = self.manager.remove_agent(agent_id).await {
                warn!(agent_id = %agent_id, error = %e, "maintenance removal failed");
            }
        }

        while deficit > 0 {
            self.replenish_one(&inner).await;
            deficit -= 1;
        }
    }

    async fn evaluate_scaling(&self, pool_id: PoolId) {
        let Ok(inner) = self.pool(pool_id).await else {
            return;
        };
        let decision = {
            let mut st = inner.state.lock().await;
            if !st.settings.auto_scale {
                return;
            }
            if let Some(last) = st.last_scale_action {
                if last.elapsed() < st.settings.scale_cooldown {
                    return;
                }
            }
            let utilization = st.utilization();
            let queue_depth = st.waiters as f64;
            let mut decision = None;
            for rule in &st.rules {
                let value = match rule.metric {
                    Metric::PoolUtilization => utilization,
                    Metric::QueueDepth => queue_depth,
                };
                if rule.matches(value) {
                    let target = match rule.action {
                        ScaleAction::ScaleUp => {
                            (st.current_size + rule.amount).min(st.settings.max_size)
                        }
                        ScaleAction::ScaleDown => {
                            st.current_size
                                .saturating_sub(rule.amount)
                                .max(st.settings.min_size)
                        }
                    };
                    if target != st.current_size {
                        decision = Some(target);
                    }
                    // One action per cooldown window at most.
                    break;
                }
            }
            if decision.is_some() {
                st.last_scale_action = Some(Instant::now());
            }
            decision
        };

        if let Some(target) = decision {
            if let Err(e) = self.scale_pool(pool_id, target).await {
                warn!(pool_id = %pool_id, target, error = %e, "policy scaling failed");
            }
        }
    }

    async fn replenish_one(&self, inner: &PoolInner) {
        let template = {
            let mut st = inner.state.lock().await;
            st.current_size += 1;
            st.template.clone()
        };
        match self.spawn_member(&template).await {
            Ok(agent_id) => {
                let mut st = inner.state.lock().await;
                st.available.push(agent_id);
                st.last_activity.insert(agent_id, Utc::now());
                drop(st);
                inner.released.notify_one();
            }
            Err(e) => {
                let mut st = inner.state.lock().await;
                st.current_size -= 1;
                warn!(pool_id = %inner.id, error = %e, "pool replenishment failed");
            }
        }
    }

    async fn spawn_member(&self, template: &str) -> CorralResult<AgentId> {
        let agent_id = self
            .manager
            .create_agent(template, AgentOverrides::default())
            .await?;
        match self.manager.start_agent(agent_id).await {
            Ok(()) => Ok(agent_id),
            Err(e) => {
                // Leave the errored record inspectable but not pooled.
                warn!(agent_id = %agent_id, error = %e, "pool member failed to start");
                Err(e)
            }
        }
    }

    async fn pool(&self, pool_id: PoolId) -> CorralResult<Arc<PoolInner>> {
        self.pools
            .read()
            .await
            .get(&pool_id)
            .cloned()
            .ok_or_else(|| CorralError::NotFound(format!("pool {pool_id}")))
    }
}
