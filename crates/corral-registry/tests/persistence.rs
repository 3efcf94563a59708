//! Round-trip and idempotence laws for the file-backed registry.

use corral_bus::EventBus;
use corral_core::AgentRecord;
use corral_registry::{FileBackend, Namespace, QueryPredicate, Registry, StoredDocument};
use std::sync::Arc;

async fn file_registry(dir: &std::path::Path) -> Registry {
    let backend = Arc::new(FileBackend::new(dir.to_path_buf()).await.unwrap());
    Registry::new(backend, EventBus::default())
}

#[tokio::test]
async fn put_then_get_returns_identical_document() {
    let dir = tempfile::tempdir().unwrap();
    let reg = file_registry(dir.path()).await;

    let doc = StoredDocument::new(
        "w-7",
        "workflow",
        serde_json::json!({
            "name": "nightly-build",
            "status": "pending",
            "variables": {"branch": "main", "jobs": 4},
        }),
        vec!["ci".into(), "nightly".into()],
    );
    reg.put(Namespace::Workflows, doc.clone()).await.unwrap();

    let loaded = reg.get(Namespace::Workflows, "w-7").await.unwrap().unwrap();
    assert_eq!(loaded, doc);
}

#[tokio::test]
async fn records_survive_a_registry_restart() {
    let dir = tempfile::tempdir().unwrap();
    let agent = AgentRecord::new("builder-0", "builder", "builder");

    {
        let reg = file_registry(dir.path()).await;
        reg.put_agent(&agent).await.unwrap();
    }

    // Fresh registry over the same directory: restarts are transparent.
    let reg = file_registry(dir.path()).await;
    let loaded = reg.get_agent(agent.id).await.unwrap().unwrap();
    assert_eq!(loaded.name, "builder-0");
    assert_eq!(loaded.template, "builder");
}

#[tokio::test]
async fn preserve_delete_archives_exactly_one_copy() {
    let dir = tempfile::tempdir().unwrap();
    let reg = file_registry(dir.path()).await;

    let doc = StoredDocument::new("t-1", "task", serde_json::json!({"status": "failed"}), vec![]);
    reg.put(Namespace::Tasks, doc).await.unwrap();
    reg.delete(Namespace::Tasks, "t-1", true).await.unwrap();

    assert!(reg.get(Namespace::Tasks, "t-1").await.unwrap().is_none());
    let archived = reg
        .query(Namespace::Archived, &QueryPredicate::default().kind("task"))
        .await
        .unwrap();
    assert_eq!(archived.len(), 1);
    assert_eq!(archived[0].id, "t-1");
}

#[tokio::test]
async fn delete_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let reg = file_registry(dir.path()).await;

    let doc = StoredDocument::new("t-1", "task", serde_json::json!({}), vec![]);
    reg.put(Namespace::Tasks, doc).await.unwrap();
    reg.delete(Namespace::Tasks, "t-1", false).await.unwrap();
    reg.delete(Namespace::Tasks, "t-1", false).await.unwrap();
    assert!(reg.get(Namespace::Tasks, "t-1").await.unwrap().is_none());
}

#[tokio::test]
async fn query_after_restart_sees_reindexed_records() {
    let dir = tempfile::tempdir().unwrap();
    {
        let reg = file_registry(dir.path()).await;
        for name in ["builder-0", "builder-1", "tester-0"] {
            let doc = StoredDocument::new(
                name,
                "agent",
                serde_json::json!({"name": name, "status": "idle", "health": 1.0}),
                vec![],
            );
            reg.put(Namespace::Agents, doc).await.unwrap();
        }
    }

    let reg = file_registry(dir.path()).await;
    let builders = reg
        .query(
            Namespace::Agents,
            &QueryPredicate::default().kind("agent").name_pattern("builder-*"),
        )
        .await
        .unwrap();
    assert_eq!(builders.len(), 2);
}
