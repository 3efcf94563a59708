use crate::document::WorkflowDocument;
use crate::expand::{bind_outputs, expand_variables};
use crate::validate::{validate, ValidationMode};
use chrono::Utc;
use corral_bus::{Event, EventBus};
use corral_core::{
    AgentId, CorralError, CorralResult, FailurePolicy, RetryPolicy, TaskStatus, WorkflowId,
    WorkflowProgress, WorkflowRecord, WorkflowStatus,
};
use corral_registry::Registry;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// How long running tasks get to finish after a fail-fast or cancel
/// before the engine marks them cancelled.
const CANCEL_GRACE: Duration = Duration::from_millis(500);
/// Re-dispatch cadence while tasks are starved of agents.
const IDLE_RECHECK: Duration = Duration::from_millis(250);
/// Bound on re-queries when the registry hands back a locally-saturated agent.
const ASSIGN_RETRIES: usize = 5;

struct WorkflowShared {
    cancel_tx: watch::Sender<bool>,
    snapshot: Arc<std::sync::RwLock<(WorkflowStatus, WorkflowProgress)>>,
}

/// Dependency-aware workflow executor. Dispatch goes out as
/// `task:assigned` events; agents answer with `task:completed` or
/// `task:failed`, which drive the engine forward.
pub struct WorkflowEngine {
    bus: EventBus,
    registry: Arc<Registry>,
    mode: ValidationMode,
    workflows: RwLock<HashMap<WorkflowId, WorkflowShared>>,
}

impl WorkflowEngine {
    pub fn new(bus: EventBus, registry: Arc<Registry>) -> Self {
        Self {
            bus,
            registry,
            mode: ValidationMode::Strict,
            workflows: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_validation_mode(mut self, mode: ValidationMode) -> Self {
        self.mode = mode;
        self
    }

    /// Validate without executing. Errors are stable-ordered.
    pub fn check(&self, doc: &WorkflowDocument) -> Vec<String> {
        validate(doc, self.mode)
    }

    /// Run a workflow to completion, choosing agents by registry score.
    pub async fn execute(&self, doc: WorkflowDocument) -> CorralResult<WorkflowRecord> {
        self.execute_with_agents(doc, HashMap::new()).await
    }

    /// Run a workflow with the document's declared agent ids resolved to
    /// live agents. Tasks with `assign_to` are bound to these; everyone
    /// else goes through scoring.
    pub async fn execute_with_agents(
        &self,
        doc: WorkflowDocument,
        declared: HashMap<String, AgentId>,
    ) -> CorralResult<WorkflowRecord> {
        let errors = self.check(&doc);
        if !errors.is_empty() {
            return Err(CorralError::InvalidArgument(errors.join("; ")));
        }

        let conditions: HashMap<String, String> = doc
            .tasks
            .iter()
            .filter_map(|t| t.condition.clone().map(|c| (t.id.clone(), c)))
            .collect();
        let mut wf = doc.into_record();
        let variables = wf.variables.clone();
        for task in &mut wf.tasks {
            task.input = expand_variables(&task.input, &variables);
        }

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let snapshot = Arc::new(std::sync::RwLock::new((wf.status, wf.progress)));
        self.workflows.write().await.insert(
            wf.id,
            WorkflowShared {
                cancel_tx,
                snapshot: snapshot.clone(),
            },
        );

        let run = Run {
            engine: self,
            declared,
            conditions,
            variables,
            snapshot,
            outputs: HashMap::new(),
            attempts: HashMap::new(),
            not_before: HashMap::new(),
            task_deadlines: HashMap::new(),
            inflight: HashMap::new(),
            capacities: HashMap::new(),
        };
        run.drive(&mut wf, cancel_rx).await?;
        Ok(wf)
    }

    /// Request cancellation of a running workflow.
    pub async fn cancel(&self, id: WorkflowId) -> CorralResult<()> {
        let workflows = self.workflows.read().await;
        let shared = workflows
            .get(&id)
            .ok_or_else(|| CorralError::NotFound(format!("workflow {id}")))?;
        let _ = shared.cancel_tx.send(true);
        Ok(())
    }

    /// Status and aggregate progress of a known workflow.
    pub async fn progress(&self, id: WorkflowId) -> Option<(WorkflowStatus, WorkflowProgress)> {
        let workflows = self.workflows.read().await;
        workflows
            .get(&id)
            .and_then(|s| s.snapshot.read().ok().map(|g| *g))
    }
}

/// Per-execution state; one `Run` drives one workflow to a terminal
/// status.
struct Run<'a> {
    engine: &'a WorkflowEngine,
    declared: HashMap<String, AgentId>,
    /// Task conditions from the document, evaluated at dispatch.
    conditions: HashMap<String, String>,
    variables: HashMap<String, serde_json::Value>,
    snapshot: Arc<std::sync::RwLock<(WorkflowStatus, WorkflowProgress)>>,
    outputs: HashMap<String, serde_json::Value>,
    attempts: HashMap<String, u32>,
    not_before: HashMap<String, Instant>,
    task_deadlines: HashMap<String, Instant>,
    inflight: HashMap<AgentId, u32>,
    capacities: HashMap<AgentId, u32>,
}

enum Outcome {
    Completed,
    Failed(String),
    Stopped,
}

impl Run<'_> {
    async fn drive(
        mut self,
        wf: &mut WorkflowRecord,
        mut cancel_rx: watch::Receiver<bool>,
    ) -> CorralResult<()> {
        let mut rx = self.engine.bus.receiver();

        wf.status = WorkflowStatus::Running;
        wf.started_at = Some(Utc::now());
        self.engine.registry.put_workflow(wf).await?;
        self.publish_snapshot(wf);
        self.engine.bus.publish(Event::WorkflowStarted {
            workflow_id: wf.id,
            name: wf.name.clone(),
        });
        for task in &wf.tasks {
            self.engine.bus.publish(Event::TaskCreated {
                workflow_id: wf.id,
                task_id: task.id.clone(),
            });
        }

        let workflow_deadline = wf
            .settings
            .timeout_ms
            .map(|ms| Instant::now() + Duration::from_millis(ms));

        let outcome = loop {
            match wf.settings.failure_policy {
                // Failed dependencies doom their descendants.
                FailurePolicy::Continue => self.propagate_skips(wf, true),
                // Failures stop the workflow anyway, but skipped and
                // cancelled dependencies still doom descendants.
                FailurePolicy::FailFast => self.propagate_skips(wf, false),
                // Descendants proceed as if every dependency succeeded.
                FailurePolicy::Ignore => {}
            }
            self.promote_ready(wf);
            self.dispatch(wf).await;

            if wf.tasks.iter().all(|t| t.status.is_terminal()) {
                break Outcome::Completed;
            }

            if let Some(deadline) = workflow_deadline {
                if Instant::now() >= deadline {
                    break Outcome::Failed("workflow timeout".to_string());
                }
            }

            let wake = self.next_wake(workflow_deadline);
            tokio::select! {
                changed = cancel_rx.changed() => {
                    if changed.is_err() || *cancel_rx.borrow() {
                        break Outcome::Stopped;
                    }
                }
                event = rx.recv() => match event {
                    Ok(event) => {
                        if let Some(outcome) = self.handle_event(wf, event).await {
                            break outcome;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(workflow_id = %wf.id, skipped = n, "engine lagged on bus events");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        break Outcome::Stopped;
                    }
                },
                _ = tokio::time::sleep_until(wake) => {
                    self.expire_overdue_tasks(wf);
                }
            }
        };

        self.wind_down(wf, &mut rx, outcome).await
    }

    /// Pending tasks whose dependencies are all satisfied become ready.
    /// Under the ignore policy any terminal dependency counts.
    fn promote_ready(&self, wf: &mut WorkflowRecord) {
        let statuses: HashMap<String, TaskStatus> =
            wf.tasks.iter().map(|t| (t.id.clone(), t.status)).collect();
        let ignore = wf.settings.failure_policy == FailurePolicy::Ignore;
        for task in &mut wf.tasks {
            if task.status != TaskStatus::Pending {
                continue;
            }
            let satisfied = task.dependencies.iter().all(|dep| {
                match statuses.get(dep) {
                    Some(TaskStatus::Completed) => true,
                    Some(status) if ignore => status.is_terminal(),
                    _ => false,
                }
            });
            if satisfied {
                task.status = TaskStatus::Ready;
            }
        }
    }

    /// Tasks whose dependencies can no longer succeed are skipped,
    /// transitively. Failed dependencies only doom descendants when
    /// `include_failed` is set (the continue policy).
    fn propagate_skips(&mut self, wf: &mut WorkflowRecord, include_failed: bool) {
        loop {
            let doomed: Vec<String> = {
                let statuses: HashMap<String, TaskStatus> =
                    wf.tasks.iter().map(|t| (t.id.clone(), t.status)).collect();
                wf.tasks
                    .iter()
                    .filter(|t| matches!(t.status, TaskStatus::Pending | TaskStatus::Ready))
                    .filter(|t| {
                        t.dependencies.iter().any(|dep| match statuses.get(dep) {
                            Some(TaskStatus::Failed) => include_failed,
                            Some(TaskStatus::Skipped) | Some(TaskStatus::Cancelled) => true,
                            _ => false,
                        })
                    })
                    .map(|t| t.id.clone())
                    .collect()
            };
            if doomed.is_empty() {
                return;
            }
            for task_id in doomed {
                self.mark_skipped(wf, &task_id);
            }
        }
    }

    fn mark_skipped(&mut self, wf: &mut WorkflowRecord, task_id: &str) {
        let workflow_id = wf.id;
        let Some(task) = wf.task_mut(task_id) else {
            return;
        };
        task.status = TaskStatus::Skipped;
        task.completed_at = Some(Utc::now());
        wf.progress.skipped += 1;
        debug!(workflow_id = %workflow_id, task_id, "task skipped");
        self.engine.bus.publish(Event::TaskSkipped {
            workflow_id,
            task_id: task_id.to_string(),
        });
        self.emit_progress(wf);
    }

    /// Dispatch ready tasks in `(−priority, index)` order, bounded by
    /// `max_concurrency`. Tasks that find no agent stay ready and are
    /// revisited after the next completion or status change.
    async fn dispatch(&mut self, wf: &mut WorkflowRecord) {
        let now = Instant::now();
        // Elapsed retry holds are spent.
        self.not_before.retain(|_, at| *at > now);

        loop {
            let running = wf
                .tasks
                .iter()
                .filter(|t| matches!(t.status, TaskStatus::Assigned | TaskStatus::Running))
                .count();
            if running >= wf.settings.max_concurrency.max(1) {
                return;
            }

            let mut candidates: Vec<(usize, String, i32)> = wf
                .tasks
                .iter()
                .enumerate()
                .filter(|(_, t)| t.status == TaskStatus::Ready && !self.not_before.contains_key(&t.id))
                .map(|(i, t)| (i, t.id.clone(), t.priority))
                .collect();
            candidates.sort_by_key(|(index, _, priority)| (-priority, *index));

            let mut dispatched = false;
            for (_, task_id, _) in candidates {
                if self.try_dispatch_one(wf, &task_id).await {
                    dispatched = true;
                    break;
                }
            }
            if !dispatched {
                return;
            }
        }
    }

    async fn try_dispatch_one(&mut self, wf: &mut WorkflowRecord, task_id: &str) -> bool {
        if let Some(condition) = self.conditions.get(task_id).cloned() {
            let expanded =
                expand_variables(&serde_json::Value::String(condition), &self.variables);
            if !truthy(&expanded) {
                self.mark_skipped(wf, task_id);
                return true;
            }
        }

        let (assign_to, required) = {
            let Some(task) = wf.task(task_id) else {
                return false;
            };
            (task.assign_to.clone(), task.required_capabilities.clone())
        };

        let agent = match &assign_to {
            Some(declared_id) => {
                let Some(&agent_id) = self.declared.get(declared_id) else {
                    debug!(task_id, declared = declared_id, "declared agent not resolved yet");
                    return false;
                };
                if !self.agent_has_headroom(agent_id).await {
                    return false;
                }
                Some(agent_id)
            }
            None => self.pick_agent(&required).await,
        };
        let Some(agent_id) = agent else {
            return false;
        };

        let workflow_id = wf.id;
        let Some(task) = wf.task_mut(task_id) else {
            return false;
        };
        let input = bind_outputs(&task.input, &self.outputs);
        task.input = input.clone();
        task.status = TaskStatus::Assigned;
        task.assigned_agent = Some(agent_id);
        task.started_at = Some(Utc::now());
        if let Some(ms) = task.timeout_ms {
            self.task_deadlines.insert(
                task_id.to_string(),
                Instant::now() + Duration::from_millis(ms),
            );
        }
        *self.inflight.entry(agent_id).or_insert(0) += 1;

        info!(workflow_id = %workflow_id, task_id, agent_id = %agent_id, "task dispatched");
        self.engine.bus.publish(Event::TaskAssigned {
            agent_id,
            workflow_id,
            task_id: task_id.to_string(),
            input,
        });
        // The assigned agent is expected to pick the task up immediately.
        if let Some(task) = wf.task_mut(task_id) {
            task.status = TaskStatus::Running;
        }
        true
    }

    /// Best-scored agent with local in-flight headroom. The registry's
    /// workload view can lag the engine's own dispatches, so saturated
    /// picks are excluded and the query retried.
    async fn pick_agent(&mut self, required: &[String]) -> Option<AgentId> {
        let mut exclude: HashSet<AgentId> = self
            .inflight
            .iter()
            .filter(|&(id, n)| {
                let cap = self.capacities.get(id).copied().unwrap_or(1);
                *n >= cap
            })
            .map(|(id, _)| *id)
            .collect();

        for _ in 0..ASSIGN_RETRIES {
            let candidate = self
                .engine
                .registry
                .best_agent(required, &exclude)
                .await
                .ok()
                .flatten()?;
            self.capacities
                .insert(candidate.id, candidate.capabilities.max_concurrent_tasks);
            let local = self.inflight.get(&candidate.id).copied().unwrap_or(0);
            if local < candidate.capabilities.max_concurrent_tasks {
                return Some(candidate.id);
            }
            exclude.insert(candidate.id);
        }
        None
    }

    async fn agent_has_headroom(&mut self, agent_id: AgentId) -> bool {
        let capacity = match self.capacities.get(&agent_id) {
            Some(c) => *c,
            None => {
                let Ok(Some(agent)) = self.engine.registry.get_agent(agent_id).await else {
                    return false;
                };
                self.capacities
                    .insert(agent_id, agent.capabilities.max_concurrent_tasks);
                agent.capabilities.max_concurrent_tasks
            }
        };
        self.inflight.get(&agent_id).copied().unwrap_or(0) < capacity
    }

    fn next_wake(&self, workflow_deadline: Option<Instant>) -> Instant {
        let mut wake = Instant::now() + IDLE_RECHECK;
        if let Some(deadline) = workflow_deadline {
            wake = wake.min(deadline);
        }
        for at in self.task_deadlines.values() {
            wake = wake.min(*at);
        }
        for at in self.not_before.values() {
            wake = wake.min(*at);
        }
        wake
    }

    async fn handle_event(&mut self, wf: &mut WorkflowRecord, event: Event) -> Option<Outcome> {
        match event {
            Event::TaskCompleted {
                agent_id,
                task_id,
                output,
                ..
            } => {
                if self.owns_live_task(wf, &task_id, agent_id) {
                    self.complete_task(wf, &task_id, output).await;
                }
                None
            }
            Event::TaskFailed {
                agent_id,
                task_id,
                error,
                ..
            } => {
                if self.owns_live_task(wf, &task_id, agent_id) {
                    return self.fail_task(wf, &task_id, error).await;
                }
                None
            }
            _ => None,
        }
    }

    fn owns_live_task(&self, wf: &WorkflowRecord, task_id: &str, agent_id: AgentId) -> bool {
        wf.task(task_id)
            .map(|t| {
                matches!(t.status, TaskStatus::Assigned | TaskStatus::Running)
                    && t.assigned_agent == Some(agent_id)
            })
            .unwrap_or(false)
    }

    async fn complete_task(
        &mut self,
        wf: &mut WorkflowRecord,
        task_id: &str,
        output: serde_json::Value,
    ) {
        self.release_task_agent(wf, task_id);
        self.task_deadlines.remove(task_id);
        if let Some(task) = wf.task_mut(task_id) {
            task.status = TaskStatus::Completed;
            task.output = Some(output.clone());
            task.completed_at = Some(Utc::now());
        }
        self.outputs.insert(task_id.to_string(), output);
        wf.progress.completed += 1;
        debug!(workflow_id = %wf.id, task_id, "task completed");
        self.emit_progress(wf);
        let _ = self.engine.registry.put_workflow(wf).await;
    }

    /// Apply retry policy, then failure policy. Returns an outcome when
    /// the whole workflow must stop (fail-fast).
    async fn fail_task(
        &mut self,
        wf: &mut WorkflowRecord,
        task_id: &str,
        error: serde_json::Value,
    ) -> Option<Outcome> {
        self.release_task_agent(wf, task_id);
        self.task_deadlines.remove(task_id);

        let attempt = {
            let counter = self.attempts.entry(task_id.to_string()).or_insert(0);
            *counter += 1;
            *counter
        };

        let retriable = wf
            .task(task_id)
            .map(|t| t.retries_left > 0 && wf.settings.retry_policy != RetryPolicy::None)
            .unwrap_or(false);

        if retriable {
            let delay = match wf.settings.retry_policy {
                RetryPolicy::Immediate => Duration::ZERO,
                RetryPolicy::Exponential => {
                    exponential_delay(wf.settings.retry_base_ms, wf.settings.retry_cap_ms, attempt)
                }
                RetryPolicy::None => unreachable!(),
            };
            let workflow_id = wf.id;
            if let Some(task) = wf.task_mut(task_id) {
                task.retries_left -= 1;
                task.status = TaskStatus::Pending;
                task.assigned_agent = None;
                task.started_at = None;
                info!(
                    workflow_id = %workflow_id,
                    task_id,
                    attempt,
                    retries_left = task.retries_left,
                    delay_ms = delay.as_millis() as u64,
                    "task re-enqueued"
                );
            }
            if delay > Duration::ZERO {
                self.not_before
                    .insert(task_id.to_string(), Instant::now() + delay);
            }
            return None;
        }

        if let Some(task) = wf.task_mut(task_id) {
            task.status = TaskStatus::Failed;
            task.error = Some(error.clone());
            task.completed_at = Some(Utc::now());
        }
        wf.progress.failed += 1;
        warn!(workflow_id = %wf.id, task_id, %error, "task failed terminally");
        self.emit_progress(wf);
        let _ = self.engine.registry.put_workflow(wf).await;

        match wf.settings.failure_policy {
            FailurePolicy::FailFast => Some(Outcome::Failed(format!("task {task_id} failed"))),
            FailurePolicy::Continue => {
                self.propagate_skips(wf, true);
                None
            }
            FailurePolicy::Ignore => None,
        }
    }

    /// Running tasks past their deadline are asked to abort and a
    /// `task:failed {kind: timeout}` is synthesized on the bus. The
    /// engine consumes that event through the ordinary path, so retry
    /// and failure policy apply exactly once; the event is also what
    /// frees the agent in the lifecycle manager's accounting.
    fn expire_overdue_tasks(&mut self, wf: &WorkflowRecord) {
        let now = Instant::now();
        let overdue: Vec<(String, AgentId)> = wf
            .tasks
            .iter()
            .filter(|t| matches!(t.status, TaskStatus::Assigned | TaskStatus::Running))
            .filter_map(|t| {
                let deadline = self.task_deadlines.get(&t.id)?;
                if *deadline <= now {
                    t.assigned_agent.map(|a| (t.id.clone(), a))
                } else {
                    None
                }
            })
            .collect();

        for (task_id, agent_id) in overdue {
            warn!(workflow_id = %wf.id, task_id, agent_id = %agent_id, "task timed out");
            // Guard against re-synthesizing before the event is consumed.
            self.task_deadlines.remove(&task_id);
            self.engine.bus.publish(Event::TaskCancel {
                agent_id,
                task_id: task_id.clone(),
            });
            self.engine.bus.publish(Event::TaskFailed {
                agent_id,
                task_id,
                error: serde_json::json!({"kind": "timeout"}),
                duration_ms: None,
            });
        }
    }

    fn release_task_agent(&mut self, wf: &WorkflowRecord, task_id: &str) {
        if let Some(agent_id) = wf.task(task_id).and_then(|t| t.assigned_agent) {
            if let Some(n) = self.inflight.get_mut(&agent_id) {
                *n = n.saturating_sub(1);
            }
        }
    }

    async fn wind_down(
        mut self,
        wf: &mut WorkflowRecord,
        rx: &mut broadcast::Receiver<Event>,
        outcome: Outcome,
    ) -> CorralResult<()> {
        let failing = !matches!(outcome, Outcome::Completed);

        if failing {
            // Pending and ready tasks are cancelled outright.
            let waiting_ids: Vec<String> = wf
                .tasks
                .iter()
                .filter(|t| matches!(t.status, TaskStatus::Pending | TaskStatus::Ready))
                .map(|t| t.id.clone())
                .collect();
            for task_id in waiting_ids {
                self.cancel_task(wf, &task_id);
            }

            // Running tasks get a grace period, then a cancel request.
            let mut running: HashSet<String> = wf
                .tasks
                .iter()
                .filter(|t| matches!(t.status, TaskStatus::Assigned | TaskStatus::Running))
                .map(|t| t.id.clone())
                .collect();
            for task_id in &running {
                if let Some(agent_id) = wf.task(task_id).and_then(|t| t.assigned_agent) {
                    self.engine.bus.publish(Event::TaskCancel {
                        agent_id,
                        task_id: task_id.clone(),
                    });
                }
            }

            let grace_deadline = Instant::now() + CANCEL_GRACE;
            while !running.is_empty() {
                let remaining = grace_deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                match tokio::time::timeout(remaining, rx.recv()).await {
                    Ok(Ok(Event::TaskCompleted {
                        agent_id,
                        task_id,
                        output,
                        ..
                    })) if running.contains(&task_id)
                        && self.owns_live_task(wf, &task_id, agent_id) =>
                    {
                        self.complete_task(wf, &task_id, output).await;
                        running.remove(&task_id);
                    }
                    Ok(Ok(Event::TaskFailed {
                        agent_id,
                        task_id,
                        error,
                        ..
                    })) if running.contains(&task_id)
                        && self.owns_live_task(wf, &task_id, agent_id) =>
                    {
                        // Terminal regardless of retries during wind-down.
                        self.release_task_agent(wf, &task_id);
                        if let Some(task) = wf.task_mut(&task_id) {
                            task.status = TaskStatus::Failed;
                            task.error = Some(error);
                            task.completed_at = Some(Utc::now());
                        }
                        wf.progress.failed += 1;
                        self.emit_progress(wf);
                        running.remove(&task_id);
                    }
                    Ok(Ok(_)) => {}
                    Ok(Err(_)) | Err(_) => break,
                }
            }
            for task_id in running {
                self.cancel_task(wf, &task_id);
            }
        }

        wf.status = match outcome {
            Outcome::Completed => WorkflowStatus::Completed,
            Outcome::Failed(_) => WorkflowStatus::Failed,
            Outcome::Stopped => WorkflowStatus::Stopped,
        };
        wf.finished_at = Some(Utc::now());
        self.engine.registry.put_workflow(wf).await?;
        self.publish_snapshot(wf);

        match &outcome {
            Outcome::Completed => {
                info!(workflow_id = %wf.id, "workflow completed");
                self.engine
                    .bus
                    .publish(Event::WorkflowCompleted { workflow_id: wf.id });
            }
            Outcome::Failed(reason) => {
                warn!(workflow_id = %wf.id, reason, "workflow failed");
                self.engine.bus.publish(Event::WorkflowFailed {
                    workflow_id: wf.id,
                    reason: reason.clone(),
                });
            }
            Outcome::Stopped => {
                info!(workflow_id = %wf.id, "workflow stopped");
                self.engine
                    .bus
                    .publish(Event::WorkflowStopped { workflow_id: wf.id });
            }
        }
        Ok(())
    }

    fn cancel_task(&mut self, wf: &mut WorkflowRecord, task_id: &str) {
        self.release_task_agent(wf, task_id);
        let workflow_id = wf.id;
        if let Some(task) = wf.task_mut(task_id) {
            task.status = TaskStatus::Cancelled;
            task.completed_at = Some(Utc::now());
            self.engine.bus.publish(Event::TaskCancelled {
                workflow_id,
                task_id: task_id.to_string(),
            });
        }
    }

    fn emit_progress(&self, wf: &WorkflowRecord) {
        self.publish_snapshot(wf);
        self.engine.bus.publish(Event::WorkflowProgress {
            workflow_id: wf.id,
            progress: wf.progress,
        });
    }

    fn publish_snapshot(&self, wf: &WorkflowRecord) {
        if let Ok(mut guard) = self.snapshot.write() {
            *guard = (wf.status, wf.progress);
        }
    }
}

/// A condition holds unless it resolves to null, false, `"false"`,
/// `"0"`, or an empty string.
fn truthy(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => false,
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::String(s) => !(s.is_empty() || s == "false" || s == "0"),
        _ => true,
    }
}

fn exponential_delay(base_ms: u64, cap_ms: u64, attempt: u32) -> Duration {
    let exp = base_ms.saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)));
    let jitter = rand::thread_rng().gen_range(0.8..1.2);
    let delayed = (exp as f64 * jitter) as u64;
    Duration::from_millis(delayed.min(cap_ms))
}
