//! Pool behavior under contention, recycling, and explicit scaling.

use corral_agent::{AgentManager, AgentTemplate, ManagerConfig};
use corral_bus::{Event, EventBus};
use corral_core::{AgentStatus, CorralError};
use corral_pool::{PoolController, PoolSettings};
use corral_registry::{MemoryBackend, Registry};
use corral_supervisor::Supervisor;
use std::sync::Arc;
use std::time::Duration;

struct Beacon(tokio::task::JoinHandle<()>);

impl Drop for Beacon {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Answers every spawned agent with an `agent:ready` signal, standing in
/// for the process IPC adapter.
fn ready_beacon(bus: &EventBus, manager: &Arc<AgentManager>) -> Beacon {
    let bus = bus.clone();
    let manager = Arc::clone(manager);
    Beacon(tokio::spawn(async move {
        loop {
            for agent in manager.list_agents().await {
                bus.publish(Event::AgentReady { agent_id: agent.id });
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }))
}

fn harness() -> (EventBus, Arc<AgentManager>, Arc<PoolController>, Beacon) {
    harness_with_maintenance(Duration::from_secs(30))
}

fn harness_with_maintenance(
    maintenance_interval: Duration,
) -> (EventBus, Arc<AgentManager>, Arc<PoolController>, Beacon) {
    let bus = EventBus::default();
    let registry = Arc::new(Registry::new(Arc::new(MemoryBackend::new()), bus.clone()));
    let supervisor =
        Arc::new(Supervisor::new(bus.clone()).with_grace_timeout(Duration::from_millis(500)));
    let manager = Arc::new(AgentManager::new(
        bus.clone(),
        registry,
        supervisor,
        ManagerConfig {
            max_agents: 16,
            restart_min_interval: Duration::from_millis(100),
        },
    ));
    let mut template = AgentTemplate::new("pooled", "worker", "sleep");
    template.args = vec!["60".into()];
    template.startup_timeout_ms = 2_000;
    manager.templates().register(template).unwrap();

    let beacon = ready_beacon(&bus, &manager);
    let controller = Arc::new(
        PoolController::new(Arc::clone(&manager), bus.clone())
            .with_maintenance_interval(maintenance_interval),
    );
    (bus, manager, controller, beacon)
}

fn settings(min: usize, max: usize, auto_scale: bool) -> PoolSettings {
    PoolSettings {
        min_size: min,
        max_size: max,
        auto_scale,
        ..PoolSettings::default()
    }
}

#[tokio::test]
async fn create_pool_starts_min_agents() {
    let (_bus, manager, controller, _beacon) = harness();
    let pool = controller
        .create_pool("workers", "pooled", settings(2, 4, true))
        .await
        .unwrap();

    let stats = controller.stats(pool).await.unwrap();
    assert_eq!(stats.current_size, 2);
    assert_eq!(stats.available, 2);
    assert_eq!(stats.busy, 0);
    assert_eq!(manager.active_count().await, 2);
}

#[tokio::test]
async fn create_pool_rejects_bad_bounds() {
    let (_bus, _manager, controller, _beacon) = harness();
    let err = controller
        .create_pool("broken", "pooled", settings(5, 2, true))
        .await
        .unwrap_err();
    assert!(matches!(err, CorralError::InvalidArgument(_)));
}

#[tokio::test]
async fn concurrent_acquires_grow_to_max_and_then_block() {
    let (_bus, _manager, controller, _beacon) = harness();
    let pool = controller
        .create_pool("workers", "pooled", settings(1, 3, true))
        .await
        .unwrap();

    // Three concurrent acquires: the pool grows to 3 distinct agents.
    let mut handles = Vec::new();
    for _ in 0..3 {
        let controller = Arc::clone(&controller);
        handles.push(tokio::spawn(async move {
            controller.acquire(pool, Duration::from_secs(10)).await
        }));
    }
    let mut acquired = Vec::new();
    for handle in handles {
        acquired.push(handle.await.unwrap().unwrap());
    }
    let distinct: std::collections::HashSet<_> = acquired.iter().collect();
    assert_eq!(distinct.len(), 3);

    let stats = controller.stats(pool).await.unwrap();
    assert_eq!(stats.current_size, 3);
    assert_eq!(stats.busy, 3);
    assert_eq!(stats.current_size, stats.available + stats.busy);

    // A fourth acquire blocks until someone releases.
    let blocked = {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move { controller.acquire(pool, Duration::from_secs(5)).await })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!blocked.is_finished());

    controller.release(pool, acquired[0]).await.unwrap();
    let fourth = blocked.await.unwrap().unwrap();
    assert_eq!(fourth, acquired[0]);
}

#[tokio::test]
async fn acquire_times_out_without_autoscale() {
    let (_bus, _manager, controller, _beacon) = harness();
    let pool = controller
        .create_pool("workers", "pooled", settings(1, 1, false))
        .await
        .unwrap();

    let only = controller.acquire(pool, Duration::from_secs(5)).await.unwrap();
    let err = controller
        .acquire(pool, Duration::from_millis(200))
        .await
        .unwrap_err();
    assert!(matches!(err, CorralError::NoCapacity(_)));

    controller.release(pool, only).await.unwrap();
    // After the release the pool serves again.
    let again = controller.acquire(pool, Duration::from_secs(5)).await.unwrap();
    assert_eq!(again, only);
}

#[tokio::test]
async fn release_recycles_dead_agents_and_replenishes() {
    let (_bus, manager, controller, _beacon) = harness();
    let pool = controller
        .create_pool("workers", "pooled", settings(1, 3, true))
        .await
        .unwrap();

    let agent = controller.acquire(pool, Duration::from_secs(5)).await.unwrap();
    // Kill the member behind the pool's back.
    manager.stop_agent(agent, "simulated death").await.unwrap();
    assert_eq!(manager.get_agent(agent).await.unwrap().status, AgentStatus::Terminated);

    controller.release(pool, agent).await.unwrap();
    // Dead member destroyed, min size preserved with a fresh agent.
    let stats = controller.stats(pool).await.unwrap();
    assert_eq!(stats.current_size, 1);
    assert_eq!(stats.available, 1);

    let replacement = controller.acquire(pool, Duration::from_secs(5)).await.unwrap();
    assert_ne!(replacement, agent);
}

#[tokio::test]
async fn scale_pool_respects_bounds() {
    let (_bus, _manager, controller, _beacon) = harness();
    let pool = controller
        .create_pool("workers", "pooled", settings(1, 3, false))
        .await
        .unwrap();

    controller.scale_pool(pool, 3).await.unwrap();
    assert_eq!(controller.stats(pool).await.unwrap().current_size, 3);

    controller.scale_pool(pool, 1).await.unwrap();
    assert_eq!(controller.stats(pool).await.unwrap().current_size, 1);

    let err = controller.scale_pool(pool, 4).await.unwrap_err();
    assert!(matches!(err, CorralError::LimitExceeded(_)));
    let err = controller.scale_pool(pool, 0).await.unwrap_err();
    assert!(matches!(err, CorralError::LimitExceeded(_)));
}

#[tokio::test]
async fn shutdown_fails_pending_acquires() {
    let (_bus, _manager, controller, _beacon) = harness();
    let pool = controller
        .create_pool("workers", "pooled", settings(1, 1, false))
        .await
        .unwrap();
    let _held = controller.acquire(pool, Duration::from_secs(5)).await.unwrap();

    let blocked = {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move { controller.acquire(pool, Duration::from_secs(10)).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    controller.notify_shutdown().await;
    let result = blocked.await.unwrap();
    assert!(matches!(result, Err(CorralError::Cancelled(_))));
}

#[tokio::test]
async fn scaling_policy_grows_pool_under_utilization() {
    let (_bus, _manager, controller, _beacon) =
        harness_with_maintenance(Duration::from_millis(100));
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let _maintenance = controller.spawn_maintenance(shutdown_rx);

    let pool = controller
        .create_pool(
            "workers",
            "pooled",
            PoolSettings {
                min_size: 1,
                max_size: 3,
                auto_scale: true,
                scale_up_at: 0.8,
                scale_cooldown: Duration::from_millis(100),
                ..PoolSettings::default()
            },
        )
        .await
        .unwrap();

    // Saturate the pool: utilization 1.0 crosses the scale-up threshold.
    let _held = controller.acquire(pool, Duration::from_secs(5)).await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let stats = controller.stats(pool).await.unwrap();
        if stats.current_size > 1 {
            assert!(stats.current_size <= 3);
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "scaling policy never grew the pool"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let _ = shutdown_tx.send(true);
}

#[tokio::test]
async fn maintenance_recycles_stale_idle_members() {
    let (_bus, manager, controller, _beacon) =
        harness_with_maintenance(Duration::from_millis(100));
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let _maintenance = controller.spawn_maintenance(shutdown_rx);

    let pool = controller
        .create_pool(
            "workers",
            "pooled",
            PoolSettings {
                min_size: 1,
                max_size: 2,
                auto_scale: false,
                idle_recycle_after: Duration::from_millis(150),
                ..PoolSettings::default()
            },
        )
        .await
        .unwrap();
    let first = manager.list_agents().await[0].id;

    // The untouched member goes stale, is destroyed, and min size is
    // replenished with a fresh agent.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while manager.get_agent(first).await.is_some() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "stale idle member was never recycled"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let stats_deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let stats = controller.stats(pool).await.unwrap();
        if stats.current_size == 1 && stats.available == 1 {
            let replacement = controller.acquire(pool, Duration::from_secs(5)).await.unwrap();
            assert_ne!(replacement, first);
            controller.release(pool, replacement).await.unwrap();
            break;
        }
        assert!(
            tokio::time::Instant::now() < stats_deadline,
            "pool never replenished to min size"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let _ = shutdown_tx.send(true);
}

#[tokio::test]
async fn steady_state_size_invariant_holds() {
    let (_bus, _manager, controller, _beacon) = harness();
    let pool = controller
        .create_pool("workers", "pooled", settings(2, 4, true))
        .await
        .unwrap();

    let a = controller.acquire(pool, Duration::from_secs(5)).await.unwrap();
    let b = controller.acquire(pool, Duration::from_secs(5)).await.unwrap();
    let stats = controller.stats(pool).await.unwrap();
    assert_eq!(stats.current_size, stats.available + stats.busy);

    controller.release(pool, a).await.unwrap();
    controller.release(pool, b).await.unwrap();
    let stats = controller.stats(pool).await.unwrap();
    assert_eq!(stats.current_size, stats.available + stats.busy);
    assert_eq!(stats.busy, 0);
}
