use crate::manager::AgentManager;
use chrono::{DateTime, Utc};
use corral_core::{AgentId, AgentRecord, AgentStatus, ErrorSeverity};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

/// Scores below these attach an issue to the health report.
const RESPONSIVENESS_THRESHOLD: f64 = 0.5;
const PERFORMANCE_THRESHOLD: f64 = 0.6;
const RESOURCE_THRESHOLD: f64 = 0.4;
/// Overall score below which an auto-restart is issued.
const RESTART_THRESHOLD: f64 = 0.3;
/// Bounded per-agent history of overall scores.
const SCORE_HISTORY_CAP: usize = 100;
/// Minimum per-sample slope for a trend to leave `stable`.
const TREND_SLOPE_THRESHOLD: f64 = 0.005;

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ComponentScores {
    pub responsiveness: f64,
    pub performance: f64,
    pub reliability: f64,
    pub resource: f64,
}

impl ComponentScores {
    pub fn overall(&self) -> f64 {
        (self.responsiveness + self.performance + self.reliability + self.resource) / 4.0
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthIssue {
    pub component: &'static str,
    pub score: f64,
    pub threshold: f64,
    pub severity: ErrorSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthTrend {
    Improving,
    Stable,
    Degrading,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub agent_id: AgentId,
    pub scores: ComponentScores,
    pub overall: f64,
    pub issues: Vec<HealthIssue>,
    pub trend: HealthTrend,
}

#[derive(Debug, Clone)]
pub struct HealthMonitorConfig {
    /// Cadence of the missed-heartbeat sweep.
    pub heartbeat_check_interval: Duration,
    /// Cadence of the full health scoring pass.
    pub health_check_interval: Duration,
    /// Expected task duration; the performance score is baseline over
    /// observed rolling average.
    pub baseline_execution_ms: f64,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            heartbeat_check_interval: Duration::from_secs(10),
            health_check_interval: Duration::from_secs(30),
            baseline_execution_ms: 30_000.0,
        }
    }
}

/// Periodically gauges every agent: a heartbeat sweep that flags agents
/// gone quiet for three intervals, and a scoring pass over four
/// components whose average drives auto-restart decisions.
pub struct HealthMonitor {
    manager: Arc<AgentManager>,
    config: HealthMonitorConfig,
    histories: Mutex<HashMap<AgentId, VecDeque<f64>>>,
}

impl HealthMonitor {
    pub fn new(manager: Arc<AgentManager>, config: HealthMonitorConfig) -> Self {
        Self {
            manager,
            config,
            histories: Mutex::new(HashMap::new()),
        }
    }

    /// Run both loops until the shutdown signal flips.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut heartbeat_tick = tokio::time::interval(self.config.heartbeat_check_interval);
            let mut health_tick = tokio::time::interval(self.config.health_check_interval);
            heartbeat_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            health_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = heartbeat_tick.tick() => self.heartbeat_sweep().await,
                    _ = health_tick.tick() => self.health_sweep().await,
                }
            }
            debug!("health monitor stopped");
        })
    }

    /// Flag agents whose last heartbeat is older than three intervals.
    async fn heartbeat_sweep(&self) {
        let now = Utc::now();
        for agent in self.manager.list_agents().await {
            if !matches!(agent.status, AgentStatus::Idle | AgentStatus::Busy) {
                continue;
            }
            let Ok(template) = self.manager.templates().get(&agent.template) else {
                continue;
            };
            let Some(last) = agent.last_heartbeat_at else {
                continue;
            };
            let age = now.signed_duration_since(last);
            let limit = chrono::Duration::from_std(template.heartbeat_interval() * 3)
                .unwrap_or_else(|_| chrono::Duration::seconds(30));
            if age <= limit {
                continue;
            }
            warn!(agent_id = %agent.id, age_ms = age.num_milliseconds(), "heartbeat timeout");
            match self.manager.mark_heartbeat_timeout(agent.id).await {
                Ok(true) => self.schedule_restart(agent.id, "heartbeat timeout").await,
                Ok(false) => {}
                Err(e) => warn!(agent_id = %agent.id, error = %e, "heartbeat timeout handling failed"),
            }
        }
    }

    async fn health_sweep(&self) {
        for agent in self.manager.list_agents().await {
            if !matches!(
                agent.status,
                AgentStatus::Idle | AgentStatus::Busy | AgentStatus::Error
            ) {
                continue;
            }
            let report = self.report_for(&agent).await;
            let _ = self.manager.update_health(agent.id, report.overall).await;

            if !report.issues.is_empty() {
                debug!(
                    agent_id = %agent.id,
                    overall = report.overall,
                    issues = report.issues.len(),
                    trend = ?report.trend,
                    "health issues detected"
                );
            }

            let auto_restart = self
                .manager
                .templates()
                .get(&agent.template)
                .map(|t| t.auto_restart)
                .unwrap_or(false);
            if report.overall < RESTART_THRESHOLD && auto_restart {
                info!(agent_id = %agent.id, overall = report.overall, "health below restart threshold");
                self.schedule_restart(agent.id, "health degraded").await;
            }
        }
    }

    /// Compute the four-component report and fold the overall score into
    /// the bounded trend history.
    pub async fn report_for(&self, agent: &AgentRecord) -> HealthReport {
        let heartbeat_interval = self
            .manager
            .templates()
            .get(&agent.template)
            .map(|t| t.heartbeat_interval())
            .unwrap_or(Duration::from_secs(10));

        let scores = compute_scores(
            agent,
            heartbeat_interval,
            self.config.baseline_execution_ms,
            Utc::now(),
        );
        let overall = scores.overall();
        let issues = issues_for(&scores);

        let trend = {
            let mut histories = self.histories.lock().await;
            let history = histories.entry(agent.id).or_default();
            history.push_back(overall);
            if history.len() > SCORE_HISTORY_CAP {
                history.pop_front();
            }
            classify_trend(history)
        };

        HealthReport {
            agent_id: agent.id,
            scores,
            overall,
            issues,
            trend,
        }
    }

    async fn schedule_restart(&self, id: AgentId, reason: &str) {
        if !self.manager.restart_allowed(id).await {
            debug!(agent_id = %id, "restart suppressed by rate limit");
            return;
        }
        if let Err(e) = self.manager.restart_agent(id, reason).await {
            warn!(agent_id = %id, error = %e, "auto-restart failed");
        }
    }
}

/// The four component scores, each in [0, 1].
pub fn compute_scores(
    agent: &AgentRecord,
    heartbeat_interval: Duration,
    baseline_execution_ms: f64,
    now: DateTime<Utc>,
) -> ComponentScores {
    let responsiveness = match agent.last_heartbeat_at {
        Some(last) => {
            let age = now.signed_duration_since(last).num_milliseconds().max(0) as u128;
            let interval = heartbeat_interval.as_millis().max(1);
            if age <= interval {
                1.0
            } else if age <= interval * 2 {
                0.5
            } else {
                0.0
            }
        }
        None => 0.0,
    };

    let performance = if agent.metrics.avg_execution_ms > 0.0 {
        (baseline_execution_ms / agent.metrics.avg_execution_ms).clamp(0.0, 1.0)
    } else {
        1.0
    };

    let reliability = agent.metrics.success_rate();

    let resource = match &agent.metrics.last_resource_sample {
        Some(sample) => {
            let mut parts = Vec::new();
            if let Some((used, limit)) = sample.memory {
                if limit > 0 {
                    parts.push(1.0 - (used as f64 / limit as f64).min(1.0));
                }
            }
            if let Some((used, limit)) = sample.cpu {
                if limit > 0.0 {
                    parts.push(1.0 - (used / limit).min(1.0));
                }
            }
            if let Some((used, limit)) = sample.disk {
                if limit > 0 {
                    parts.push(1.0 - (used as f64 / limit as f64).min(1.0));
                }
            }
            if parts.is_empty() {
                1.0
            } else {
                parts.iter().sum::<f64>() / parts.len() as f64
            }
        }
        None => 1.0,
    };

    ComponentScores {
        responsiveness,
        performance,
        reliability,
        resource,
    }
}

fn issues_for(scores: &ComponentScores) -> Vec<HealthIssue> {
    let mut issues = Vec::new();
    for (component, score, threshold) in [
        ("responsiveness", scores.responsiveness, RESPONSIVENESS_THRESHOLD),
        ("performance", scores.performance, PERFORMANCE_THRESHOLD),
        ("resource", scores.resource, RESOURCE_THRESHOLD),
    ] {
        if score < threshold {
            issues.push(HealthIssue {
                component,
                score,
                threshold,
                severity: severity_for(score, threshold),
            });
        }
    }
    issues
}

/// Severity scales with how far below the threshold the score fell.
fn severity_for(score: f64, threshold: f64) -> ErrorSeverity {
    let shortfall = ((threshold - score) / threshold).clamp(0.0, 1.0);
    if shortfall < 0.25 {
        ErrorSeverity::Low
    } else if shortfall < 0.5 {
        ErrorSeverity::Medium
    } else if shortfall < 0.75 {
        ErrorSeverity::High
    } else {
        ErrorSeverity::Critical
    }
}

/// Least-squares slope over the bounded score history, classified by a
/// per-sample threshold.
fn classify_trend(history: &VecDeque<f64>) -> HealthTrend {
    let n = history.len();
    if n < 3 {
        return HealthTrend::Stable;
    }
    let n_f = n as f64;
    let mean_x = (n_f - 1.0) / 2.0;
    let mean_y = history.iter().sum::<f64>() / n_f;
    let mut num = 0.0;
    let mut den = 0.0;
    for (i, y) in history.iter().enumerate() {
        let dx = i as f64 - mean_x;
        num += dx * (y - mean_y);
        den += dx * dx;
    }
    if den == 0.0 {
        return HealthTrend::Stable;
    }
    let slope = num / den;
    if slope > TREND_SLOPE_THRESHOLD {
        HealthTrend::Improving
    } else if slope < -TREND_SLOPE_THRESHOLD {
        HealthTrend::Degrading
    } else {
        HealthTrend::Stable
    }
}
