use serde::{Deserialize, Serialize};

/// Observable a scaling rule tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Metric {
    /// busy / currentSize, in [0, 1].
    PoolUtilization,
    /// Rolling count of callers blocked in `acquire`.
    QueueDepth,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Comparison {
    GreaterThan,
    LessThan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScaleAction {
    ScaleUp,
    ScaleDown,
}

/// One rule of a pool's scaling policy. Rules are evaluated top to
/// bottom on a cooldown timer; the first match fires and ends the pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingRule {
    pub metric: Metric,
    pub comparison: Comparison,
    pub threshold: f64,
    pub action: ScaleAction,
    pub amount: usize,
}

impl ScalingRule {
    pub fn matches(&self, value: f64) -> bool {
        match self.comparison {
            Comparison::GreaterThan => value > self.threshold,
            Comparison::LessThan => value < self.threshold,
        }
    }
}

/// The default policy a pool derives from its settings: grow when
/// utilization crosses `scale_up_at`, shrink when it falls under
/// `scale_down_at`.
pub fn default_rules(scale_up_at: f64, scale_down_at: f64) -> Vec<ScalingRule> {
    vec![
        ScalingRule {
            metric: Metric::PoolUtilization,
            comparison: Comparison::GreaterThan,
            threshold: scale_up_at,
            action: ScaleAction::ScaleUp,
            amount: 1,
        },
        ScalingRule {
            metric: Metric::PoolUtilization,
            comparison: Comparison::LessThan,
            threshold: scale_down_at,
            action: ScaleAction::ScaleDown,
            amount: 1,
        },
    ]
}
