//! End-to-end engine scenarios: the diamond graph, fail-fast
//! cancellation, retries, timeouts, output binding, and cancel.

use corral_bus::{Event, EventBus, Subscription, Topic};
use corral_core::{AgentId, AgentRecord, AgentStatus, CorralError, TaskStatus, WorkflowStatus};
use corral_engine::{WorkflowDocument, WorkflowEngine};
use corral_registry::{MemoryBackend, Registry};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

enum Reply {
    Complete(Value),
    Fail(Value),
    Ignore,
}

/// A scripted in-process agent: an idle registry record plus a bus
/// handler that answers `task:assigned` events addressed to it.
struct MockAgent {
    id: AgentId,
    _sub: Subscription,
}

async fn mock_agent<F>(
    bus: &EventBus,
    registry: &Registry,
    name: &str,
    capacity: u32,
    behavior: F,
) -> MockAgent
where
    F: Fn(&str, u32) -> Reply + Send + Sync + 'static,
{
    let mut record = AgentRecord::new(name, "executor", "executor");
    record.status = AgentStatus::Idle;
    record.capabilities.max_concurrent_tasks = capacity;
    registry.put_agent(&record).await.unwrap();

    let id = record.id;
    let publisher = bus.clone();
    let attempts: Arc<Mutex<HashMap<String, u32>>> = Arc::new(Mutex::new(HashMap::new()));
    let sub = bus.subscribe(Topic::TaskAssigned, move |event| {
        let Event::TaskAssigned { agent_id, task_id, .. } = event else {
            return;
        };
        if agent_id != id {
            return;
        }
        let attempt = {
            let mut attempts = attempts.lock().unwrap();
            let n = attempts.entry(task_id.clone()).or_insert(0);
            *n += 1;
            *n
        };
        let reply = behavior(&task_id, attempt);
        let publisher = publisher.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            match reply {
                Reply::Complete(output) => publisher.publish(Event::TaskCompleted {
                    agent_id: id,
                    task_id,
                    output,
                    duration_ms: Some(30),
                }),
                Reply::Fail(error) => publisher.publish(Event::TaskFailed {
                    agent_id: id,
                    task_id,
                    error,
                    duration_ms: Some(30),
                }),
                Reply::Ignore => {}
            }
        });
    });

    MockAgent { id, _sub: sub }
}

fn harness() -> (EventBus, Arc<Registry>, WorkflowEngine) {
    let bus = EventBus::default();
    let registry = Arc::new(Registry::new(Arc::new(MemoryBackend::new()), bus.clone()));
    let engine = WorkflowEngine::new(bus.clone(), Arc::clone(&registry));
    (bus, registry, engine)
}

fn diamond(failure_policy: &str) -> WorkflowDocument {
    WorkflowDocument::parse_json(&format!(
        r#"{{
            "name": "diamond",
            "tasks": [
                {{"id": "a", "type": "work", "description": "root"}},
                {{"id": "b", "type": "work", "description": "left", "depends": ["a"]}},
                {{"id": "c", "type": "work", "description": "right", "depends": ["a"]}},
                {{"id": "d", "type": "work", "description": "join", "depends": ["b", "c"]}}
            ],
            "settings": {{"max_concurrency": 2, "failure_policy": "{failure_policy}"}}
        }}"#
    ))
    .unwrap()
}

fn record_dispatch_order(bus: &EventBus) -> (Arc<Mutex<Vec<String>>>, Subscription) {
    let order: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = order.clone();
    let sub = bus.subscribe(Topic::TaskAssigned, move |event| {
        if let Event::TaskAssigned { task_id, .. } = event {
            sink.lock().unwrap().push(task_id);
        }
    });
    (order, sub)
}

#[tokio::test]
async fn diamond_runs_in_dependency_waves() {
    let (bus, registry, engine) = harness();
    let _agent = mock_agent(&bus, &registry, "worker", 2, |_, _| {
        Reply::Complete(json!("ok"))
    })
    .await;
    let (order, _order_sub) = record_dispatch_order(&bus);

    let wf = engine.execute(diamond("continue")).await.unwrap();

    assert_eq!(wf.status, WorkflowStatus::Completed);
    assert_eq!(wf.progress.total, 4);
    assert_eq!(wf.progress.completed, 4);
    assert_eq!(wf.progress.failed, 0);

    let order = order.lock().unwrap().clone();
    assert_eq!(order[0], "a");
    // b and c dispatch concurrently after a, in either order; d is last.
    assert_eq!(order.len(), 4);
    assert!(order[1..3].contains(&"b".to_string()));
    assert!(order[1..3].contains(&"c".to_string()));
    assert_eq!(order[3], "d");

    // Dependencies completed before dependents started.
    let a = wf.task("a").unwrap();
    let d = wf.task("d").unwrap();
    assert!(d.started_at.unwrap() >= a.completed_at.unwrap());
}

#[tokio::test]
async fn fail_fast_cancels_remaining_tasks() {
    let (bus, registry, engine) = harness();
    let _agent = mock_agent(&bus, &registry, "worker", 2, |task_id, _| match task_id {
        "b" => Reply::Fail(json!({"kind": "task_error", "message": "boom"})),
        "c" => Reply::Ignore, // stays running until cancelled
        _ => Reply::Complete(json!("ok")),
    })
    .await;

    let cancels: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = cancels.clone();
    let _cancel_sub = bus.subscribe(Topic::TaskCancel, move |event| {
        if let Event::TaskCancel { task_id, .. } = event {
            sink.lock().unwrap().push(task_id);
        }
    });

    let wf = engine.execute(diamond("fail-fast")).await.unwrap();

    assert_eq!(wf.status, WorkflowStatus::Failed);
    assert!(wf.progress.failed >= 1);
    assert_eq!(wf.task("b").unwrap().status, TaskStatus::Failed);
    assert_eq!(wf.task("c").unwrap().status, TaskStatus::Cancelled);
    assert_eq!(wf.task("d").unwrap().status, TaskStatus::Cancelled);
    // The still-running task was asked to abort.
    assert!(cancels.lock().unwrap().contains(&"c".to_string()));
}

#[tokio::test]
async fn continue_policy_skips_descendants() {
    let (bus, registry, engine) = harness();
    let _agent = mock_agent(&bus, &registry, "worker", 2, |task_id, _| match task_id {
        "b" => Reply::Fail(json!({"message": "broken"})),
        _ => Reply::Complete(json!("ok")),
    })
    .await;

    let wf = engine.execute(diamond("continue")).await.unwrap();

    // b failed; c still completed; d can no longer succeed and is skipped.
    assert_eq!(wf.status, WorkflowStatus::Completed);
    assert_eq!(wf.task("b").unwrap().status, TaskStatus::Failed);
    assert_eq!(wf.task("c").unwrap().status, TaskStatus::Completed);
    assert_eq!(wf.task("d").unwrap().status, TaskStatus::Skipped);
    assert_eq!(wf.progress.completed, 2);
    assert_eq!(wf.progress.failed, 1);
    assert_eq!(wf.progress.skipped, 1);
    assert!(wf.progress.completed + wf.progress.failed <= wf.progress.total);
}

#[tokio::test]
async fn ignore_policy_proceeds_past_failures() {
    let (bus, registry, engine) = harness();
    let inputs: Arc<Mutex<HashMap<String, Value>>> = Arc::new(Mutex::new(HashMap::new()));
    let sink = inputs.clone();
    let _input_sub = bus.subscribe(Topic::TaskAssigned, move |event| {
        if let Event::TaskAssigned { task_id, input, .. } = event {
            sink.lock().unwrap().insert(task_id, input);
        }
    });
    let _agent = mock_agent(&bus, &registry, "worker", 2, |task_id, _| match task_id {
        "a" => Reply::Fail(json!({"message": "broken"})),
        _ => Reply::Complete(json!("ok")),
    })
    .await;

    let doc = WorkflowDocument::parse_json(
        r#"{
            "name": "tolerant",
            "tasks": [
                {"id": "a", "type": "work", "description": "root"},
                {"id": "b", "type": "work", "description": "next", "depends": ["a"],
                 "input": {"upstream": "${a.output}"}}
            ],
            "settings": {"failure_policy": "ignore"}
        }"#,
    )
    .unwrap();

    let wf = engine.execute(doc).await.unwrap();
    assert_eq!(wf.status, WorkflowStatus::Completed);
    assert_eq!(wf.task("a").unwrap().status, TaskStatus::Failed);
    assert_eq!(wf.task("b").unwrap().status, TaskStatus::Completed);
    // The missing upstream output resolved to null.
    assert_eq!(inputs.lock().unwrap()["b"]["upstream"], Value::Null);
}

#[tokio::test]
async fn duplicate_task_id_rejected_before_execution() {
    let (bus, _registry, engine) = harness();
    let doc = WorkflowDocument::parse_json(
        r#"{
            "name": "dup",
            "tasks": [
                {"id": "a", "type": "t", "description": "x"},
                {"id": "b", "type": "t", "description": "y"},
                {"id": "a", "type": "t", "description": "z"}
            ]
        }"#,
    )
    .unwrap();

    let err = engine.execute(doc).await.unwrap_err();
    match err {
        CorralError::InvalidArgument(msg) => assert!(msg.contains("Duplicate task ID: a")),
        other => panic!("unexpected error {other:?}"),
    }
    // No execution began.
    assert_eq!(bus.stats(Topic::TaskAssigned).count, 0);
    assert_eq!(bus.stats(Topic::WorkflowStarted).count, 0);
}

#[tokio::test]
async fn cycle_rejected_in_strict_mode() {
    let (_bus, _registry, engine) = harness();
    let doc = WorkflowDocument::parse_json(
        r#"{
            "name": "cyclic",
            "tasks": [
                {"id": "a", "type": "t", "description": "x", "depends": ["b"]},
                {"id": "b", "type": "t", "description": "y", "depends": ["a"]}
            ]
        }"#,
    )
    .unwrap();

    let err = engine.execute(doc).await.unwrap_err();
    match err {
        CorralError::InvalidArgument(msg) => assert!(msg.contains("Circular dependencies detected")),
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test]
async fn immediate_retry_reassigns_failed_task() {
    let (bus, registry, engine) = harness();
    let _agent = mock_agent(&bus, &registry, "worker", 1, |task_id, attempt| {
        if task_id == "flaky" && attempt == 1 {
            Reply::Fail(json!({"message": "transient"}))
        } else {
            Reply::Complete(json!("ok"))
        }
    })
    .await;

    let doc = WorkflowDocument::parse_json(
        r#"{
            "name": "retrying",
            "tasks": [{"id": "flaky", "type": "work", "description": "sometimes fails", "retries": 2}],
            "settings": {"retry_policy": "immediate"}
        }"#,
    )
    .unwrap();

    let wf = engine.execute(doc).await.unwrap();
    assert_eq!(wf.status, WorkflowStatus::Completed);
    let task = wf.task("flaky").unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.retries_left, 1);
    assert_eq!(wf.progress.completed, 1);
    assert_eq!(wf.progress.failed, 0);
}

#[tokio::test]
async fn task_timeout_fails_with_timeout_kind() {
    let (bus, registry, engine) = harness();
    let _agent = mock_agent(&bus, &registry, "worker", 1, |_, _| Reply::Ignore).await;

    let cancel_rx = bus.receiver();
    let doc = WorkflowDocument::parse_json(
        r#"{
            "name": "slow",
            "tasks": [{"id": "hang", "type": "work", "description": "never answers", "timeout": 200}],
            "settings": {"failure_policy": "continue"}
        }"#,
    )
    .unwrap();

    let wf = engine.execute(doc).await.unwrap();
    let task = wf.task("hang").unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.error.as_ref().unwrap()["kind"], "timeout");

    // The agent was asked to abort the overdue task.
    let event = EventBus::wait_on(cancel_rx, Topic::TaskCancel, |_| true, Duration::from_secs(1))
        .await
        .unwrap();
    match event {
        Event::TaskCancel { task_id, .. } => assert_eq!(task_id, "hang"),
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn workflow_deadline_behaves_like_fail_fast() {
    let (bus, registry, engine) = harness();
    let _agent = mock_agent(&bus, &registry, "worker", 2, |task_id, _| match task_id {
        "quick" => Reply::Complete(json!("ok")),
        _ => Reply::Ignore,
    })
    .await;

    let doc = WorkflowDocument::parse_json(
        r#"{
            "name": "deadline",
            "tasks": [
                {"id": "quick", "type": "work", "description": "finishes"},
                {"id": "hang", "type": "work", "description": "never answers"}
            ],
            "settings": {"max_concurrency": 2, "timeout": 300, "failure_policy": "continue"}
        }"#,
    )
    .unwrap();

    let wf = engine.execute(doc).await.unwrap();
    assert_eq!(wf.status, WorkflowStatus::Failed);
    assert_eq!(wf.task("quick").unwrap().status, TaskStatus::Completed);
    assert_eq!(wf.task("hang").unwrap().status, TaskStatus::Cancelled);
}

#[tokio::test]
async fn outputs_bind_into_dependent_inputs() {
    let (bus, registry, engine) = harness();
    let inputs: Arc<Mutex<HashMap<String, Value>>> = Arc::new(Mutex::new(HashMap::new()));
    let sink = inputs.clone();
    let _input_sub = bus.subscribe(Topic::TaskAssigned, move |event| {
        if let Event::TaskAssigned { task_id, input, .. } = event {
            sink.lock().unwrap().insert(task_id, input);
        }
    });
    let _agent = mock_agent(&bus, &registry, "worker", 1, |task_id, _| match task_id {
        "fetch" => Reply::Complete(json!({"artifact": "bundle.tar"})),
        _ => Reply::Complete(json!("done")),
    })
    .await;

    let doc = WorkflowDocument::parse_json(
        r#"{
            "name": "pipeline",
            "variables": {"env": "prod"},
            "tasks": [
                {"id": "fetch", "type": "work", "description": "download"},
                {"id": "deploy", "type": "work", "description": "ship", "depends": ["fetch"],
                 "input": {"bundle": "${fetch.output}", "target": "${env}"}}
            ]
        }"#,
    )
    .unwrap();

    let wf = engine.execute(doc).await.unwrap();
    assert_eq!(wf.status, WorkflowStatus::Completed);

    let inputs = inputs.lock().unwrap();
    assert_eq!(inputs["deploy"]["bundle"], json!({"artifact": "bundle.tar"}));
    assert_eq!(inputs["deploy"]["target"], "prod");
}

#[tokio::test]
async fn condition_false_skips_task() {
    let (bus, registry, engine) = harness();
    let _agent = mock_agent(&bus, &registry, "worker", 1, |_, _| {
        Reply::Complete(json!("ok"))
    })
    .await;

    let doc = WorkflowDocument::parse_json(
        r#"{
            "name": "conditional",
            "variables": {"deploy_enabled": "false"},
            "tasks": [
                {"id": "build", "type": "work", "description": "compile"},
                {"id": "deploy", "type": "work", "description": "ship", "depends": ["build"],
                 "condition": "${deploy_enabled}"}
            ]
        }"#,
    )
    .unwrap();

    let wf = engine.execute(doc).await.unwrap();
    assert_eq!(wf.status, WorkflowStatus::Completed);
    assert_eq!(wf.task("build").unwrap().status, TaskStatus::Completed);
    assert_eq!(wf.task("deploy").unwrap().status, TaskStatus::Skipped);
    assert_eq!(wf.progress.skipped, 1);
}

#[tokio::test]
async fn assigned_agent_is_used_for_pinned_tasks() {
    let (bus, registry, engine) = harness();
    let pinned = mock_agent(&bus, &registry, "pinned", 1, |_, _| {
        Reply::Complete(json!("pinned did it"))
    })
    .await;
    let _other = mock_agent(&bus, &registry, "other", 4, |_, _| {
        Reply::Complete(json!("other did it"))
    })
    .await;

    let doc = WorkflowDocument::parse_json(
        r#"{
            "name": "pinning",
            "agents": [{"id": "special", "type": "executor"}],
            "tasks": [{"id": "only", "type": "work", "description": "pinned work", "assignTo": "special"}]
        }"#,
    )
    .unwrap();

    let declared = HashMap::from([("special".to_string(), pinned.id)]);
    let wf = engine.execute_with_agents(doc, declared).await.unwrap();
    assert_eq!(wf.task("only").unwrap().assigned_agent, Some(pinned.id));
    assert_eq!(wf.task("only").unwrap().output, Some(json!("pinned did it")));
}

#[tokio::test]
async fn goal_decomposes_and_executes_sequentially() {
    use corral_engine::{Goal, GoalPriority, GoalStatus};

    let (bus, registry, engine) = harness();
    let _agent = mock_agent(&bus, &registry, "worker", 1, |_, _| {
        Reply::Complete(json!("done"))
    })
    .await;
    let (order, _order_sub) = record_dispatch_order(&bus);

    let mut goal = Goal::new(
        "Fetch the dataset then normalize it and then publish a summary",
        GoalPriority::High,
    );
    assert_eq!(goal.status, GoalStatus::Pending);
    goal.analyze();
    assert_eq!(goal.status, GoalStatus::Analyzing);
    assert_eq!(goal.subtasks.len(), 3);

    let doc = goal.to_workflow();
    assert_eq!(goal.status, GoalStatus::Executing);
    let wf = engine.execute(doc).await.unwrap();
    goal.absorb_result(&wf);

    assert_eq!(goal.status, GoalStatus::Completed);
    assert!(goal
        .subtasks
        .iter()
        .all(|s| s.status == corral_core::TaskStatus::Completed));
    assert_eq!(
        order.lock().unwrap().clone(),
        vec!["step-1", "step-2", "step-3"]
    );
}

#[tokio::test]
async fn higher_priority_tasks_dispatch_first() {
    let (bus, registry, engine) = harness();
    let _agent = mock_agent(&bus, &registry, "worker", 1, |_, _| {
        Reply::Complete(json!("ok"))
    })
    .await;
    let (order, _order_sub) = record_dispatch_order(&bus);

    let doc = WorkflowDocument::parse_json(
        r#"{
            "name": "priorities",
            "tasks": [
                {"id": "low", "type": "work", "description": "later", "priority": 1},
                {"id": "high", "type": "work", "description": "first", "priority": 10},
                {"id": "mid-a", "type": "work", "description": "middle", "priority": 5},
                {"id": "mid-b", "type": "work", "description": "middle tie", "priority": 5}
            ],
            "settings": {"max_concurrency": 1}
        }"#,
    )
    .unwrap();

    let wf = engine.execute(doc).await.unwrap();
    assert_eq!(wf.status, WorkflowStatus::Completed);
    // Priority descending, list order breaking the tie.
    assert_eq!(
        order.lock().unwrap().clone(),
        vec!["high", "mid-a", "mid-b", "low"]
    );
}

#[tokio::test]
async fn relaxed_mode_accepts_acyclic_forward_references() {
    let bus = EventBus::default();
    let registry = Arc::new(Registry::new(Arc::new(MemoryBackend::new()), bus.clone()));
    let engine = WorkflowEngine::new(bus.clone(), Arc::clone(&registry))
        .with_validation_mode(corral_engine::ValidationMode::Relaxed);
    let _agent = mock_agent(&bus, &registry, "worker", 1, |_, _| {
        Reply::Complete(json!("ok"))
    })
    .await;

    let doc = WorkflowDocument::parse_json(
        r#"{
            "name": "forward",
            "tasks": [
                {"id": "second", "type": "work", "description": "depends forward", "depends": ["first"]},
                {"id": "first", "type": "work", "description": "declared later"}
            ]
        }"#,
    )
    .unwrap();

    let wf = engine.execute(doc).await.unwrap();
    assert_eq!(wf.status, WorkflowStatus::Completed);
    let first = wf.task("first").unwrap();
    let second = wf.task("second").unwrap();
    assert!(second.started_at.unwrap() >= first.completed_at.unwrap());
}

#[tokio::test]
async fn exponential_retry_delays_reassignment() {
    let (bus, registry, engine) = harness();
    let _agent = mock_agent(&bus, &registry, "worker", 1, |_, attempt| {
        if attempt == 1 {
            Reply::Fail(json!({"message": "transient"}))
        } else {
            Reply::Complete(json!("ok"))
        }
    })
    .await;
    let (order, _order_sub) = record_dispatch_order(&bus);

    let doc = WorkflowDocument::parse_json(
        r#"{
            "name": "backoff",
            "tasks": [{"id": "flaky", "type": "work", "description": "fails once", "retries": 1}],
            "settings": {"retry_policy": "exponential", "retry_base_ms": 200, "retry_cap_ms": 1000}
        }"#,
    )
    .unwrap();

    let started = std::time::Instant::now();
    let wf = engine.execute(doc).await.unwrap();
    assert_eq!(wf.status, WorkflowStatus::Completed);
    assert_eq!(order.lock().unwrap().len(), 2);
    // The second dispatch waited out the backoff (200 ms minus jitter).
    assert!(started.elapsed() >= Duration::from_millis(150));
}

#[tokio::test]
async fn workflow_cancel_stops_execution() {
    let (bus, registry, engine) = harness();
    let engine = Arc::new(engine);
    let _agent = mock_agent(&bus, &registry, "worker", 1, |_, _| Reply::Ignore).await;

    let doc = WorkflowDocument::parse_json(
        r#"{
            "name": "cancellable",
            "tasks": [{"id": "hang", "type": "work", "description": "runs forever"}]
        }"#,
    )
    .unwrap();

    let runner = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.execute(doc).await })
    };
    // Let it dispatch, then cancel.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(bus.stats(Topic::WorkflowStarted).count, 1);

    // The id is not returned until execute resolves; read it back from
    // the registry's workflows namespace.
    let docs = registry
        .query(
            corral_registry::Namespace::Workflows,
            &corral_registry::QueryPredicate::default().kind("workflow"),
        )
        .await
        .unwrap();
    assert_eq!(docs.len(), 1);
    let wf_id: corral_core::WorkflowId = serde_json::from_value(docs[0].payload["id"].clone()).unwrap();

    engine.cancel(wf_id).await.unwrap();
    let wf = runner.await.unwrap().unwrap();
    assert_eq!(wf.status, WorkflowStatus::Stopped);
    assert_eq!(wf.task("hang").unwrap().status, TaskStatus::Cancelled);
    let (status, _) = engine.progress(wf_id).await.unwrap();
    assert_eq!(status, WorkflowStatus::Stopped);
}
