//! Full-stack smoke test: a workflow with a declared agent runs against
//! a real spawned process, with a scripted IPC stand-in answering
//! readiness, heartbeats, and task dispatch on the bus.

use corral_agent::AgentTemplate;
use corral_bus::{Event, EventBus, Subscription, Topic};
use corral_core::{TaskStatus, WorkflowStatus};
use corral_engine::WorkflowDocument;
use corral_registry::MemoryBackend;
use corral_runtime::{Runtime, RuntimeConfig};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn worker_template() -> AgentTemplate {
    let mut t = AgentTemplate::new("builder", "builder", "sleep");
    t.args = vec!["60".into()];
    t.heartbeat_interval_ms = 500;
    t.startup_timeout_ms = 3_000;
    t
}

/// Scripted agent-side behavior: announce readiness and heartbeats for
/// every agent, and complete every dispatched task with an echo output.
fn fake_agent_ipc(bus: &EventBus, runtime: &Arc<Runtime>) -> (Subscription, tokio::task::JoinHandle<()>) {
    let responder = {
        let publisher = bus.clone();
        bus.subscribe(Topic::TaskAssigned, move |event| {
            if let Event::TaskAssigned { agent_id, task_id, input, .. } = event {
                let publisher = publisher.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    publisher.publish(Event::TaskCompleted {
                        agent_id,
                        task_id,
                        output: json!({"echo": input}),
                        duration_ms: Some(30),
                    });
                });
            }
        })
    };

    let heartbeats = {
        let bus = bus.clone();
        let manager = Arc::clone(runtime.manager());
        tokio::spawn(async move {
            loop {
                for agent in manager.list_agents().await {
                    bus.publish(Event::AgentReady { agent_id: agent.id });
                    bus.publish(Event::AgentHeartbeat {
                        agent_id: agent.id,
                        timestamp: chrono_now(),
                        metrics: None,
                    });
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        })
    };

    (responder, heartbeats)
}

fn chrono_now() -> chrono::DateTime<chrono::Utc> {
    chrono::Utc::now()
}

#[tokio::test]
async fn declared_agent_workflow_runs_end_to_end() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();

    let runtime = Runtime::new(
        RuntimeConfig {
            heartbeat_check_interval: Duration::from_millis(200),
            health_check_interval: Duration::from_secs(60),
            grace_timeout: Duration::from_millis(500),
            ..RuntimeConfig::default()
        },
        Arc::new(MemoryBackend::new()),
    );
    runtime.manager().templates().register(worker_template()).unwrap();
    let (_responder, ipc) = fake_agent_ipc(runtime.bus(), &runtime);

    let doc = WorkflowDocument::parse(
        r#"
name: smoke
variables:
  release: "1.4.0"
agents:
  - id: builder
    type: builder
tasks:
  - id: build
    type: work
    description: build the artifact
    assignTo: builder
    input:
      version: "${release}"
  - id: publish
    type: work
    description: publish the artifact
    depends: [build]
    input:
      artifact: "${build.output}"
settings:
  max_concurrency: 2
"#,
    )
    .unwrap();

    let wf = runtime.execute_workflow(doc).await.unwrap();

    assert_eq!(wf.status, WorkflowStatus::Completed);
    assert_eq!(wf.progress.completed, 2);
    assert_eq!(wf.task("build").unwrap().status, TaskStatus::Completed);
    // The declared agent handled the pinned task.
    assert!(wf.task("build").unwrap().assigned_agent.is_some());
    // The second task saw the first one's echoed output bound in.
    let publish_output = wf.task("publish").unwrap().output.as_ref().unwrap();
    assert_eq!(publish_output["echo"]["artifact"]["echo"]["version"], "1.4.0");

    // Declared agents are wound down after the workflow.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(runtime.manager().active_count().await, 0);

    ipc.abort();
    runtime.shutdown().await;
}
