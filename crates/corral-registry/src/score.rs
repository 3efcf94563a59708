use corral_core::AgentRecord;

/// Deterministic assignment score over a 0–100 scale:
/// 40 health + 30 success rate + 20 availability + 10 capability match.
pub fn score(agent: &AgentRecord, required_capabilities: &[String]) -> f64 {
    let health = agent.health.clamp(0.0, 1.0);
    let success = agent.metrics.success_rate();
    let max = agent.capabilities.max_concurrent_tasks.max(1) as f64;
    let availability = (1.0 - agent.workload as f64 / max).clamp(0.0, 1.0);
    let capability = agent.capabilities.match_fraction(required_capabilities);

    40.0 * health + 30.0 * success + 20.0 * availability + 10.0 * capability
}

/// Pick the best candidate: highest score, ties broken by older
/// `last_activity_at` (freshness), then lexicographic id.
pub fn best<'a>(
    candidates: impl IntoIterator<Item = &'a AgentRecord>,
    required_capabilities: &[String],
) -> Option<&'a AgentRecord> {
    let mut scored: Vec<(&AgentRecord, f64)> = candidates
        .into_iter()
        .map(|a| (a, score(a, required_capabilities)))
        .collect();
    scored.sort_by(|(a, sa), (b, sb)| {
        sb.partial_cmp(sa)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.last_activity_at.cmp(&b.last_activity_at))
            .then_with(|| a.id.0.cmp(&b.id.0))
    });
    scored.first().map(|(a, _)| *a)
}
