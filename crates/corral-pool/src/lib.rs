//! Elastic pools of homogeneous agents.
//!
//! A pool owns agents of a single template between a min and max size,
//! hands them out with `acquire`/`release`, grows under pressure, and
//! recycles agents that wore out or died.

pub mod controller;
pub mod scaling;

pub use controller::{PoolController, PoolId, PoolSettings, PoolStats};
pub use scaling::{Metric, ScaleAction, ScalingRule};
