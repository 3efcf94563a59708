use crate::backend::{Namespace, RegistryBackend, StoredDocument};
use crate::query::QueryPredicate;
use crate::score;
use chrono::Utc;
use corral_bus::{Event, EventBus};
use corral_core::{AgentId, AgentRecord, AgentStatus, CorralError, CorralResult, WorkflowRecord};
use rand::Rng;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, warn};

const RETRY_BASE: Duration = Duration::from_millis(100);
const RETRY_CAP: Duration = Duration::from_secs(5);
const RETRY_ATTEMPTS: u32 = 5;
const DEFAULT_STALENESS: Duration = Duration::from_secs(60);

struct CacheEntry {
    doc: StoredDocument,
    fetched_at: Instant,
}

#[derive(Default)]
struct NamespaceIndex {
    hydrated: bool,
    by_kind: HashMap<String, BTreeSet<String>>,
    by_status: HashMap<String, BTreeSet<String>>,
    by_tag: HashMap<String, BTreeSet<String>>,
}

impl NamespaceIndex {
    fn insert(&mut self, doc: &StoredDocument) {
        self.remove(&doc.id);
        self.by_kind.entry(doc.kind.clone()).or_default().insert(doc.id.clone());
        if let Some(status) = doc.payload.get("status").and_then(|v| v.as_str()) {
            self.by_status.entry(status.to_string()).or_default().insert(doc.id.clone());
        }
        for tag in &doc.tags {
            self.by_tag.entry(tag.clone()).or_default().insert(doc.id.clone());
        }
    }

    fn remove(&mut self, id: &str) {
        for set in self.by_kind.values_mut() {
            set.remove(id);
        }
        for set in self.by_status.values_mut() {
            set.remove(id);
        }
        for set in self.by_tag.values_mut() {
            set.remove(id);
        }
    }

    /// Narrow to candidate ids using whichever indexed fields the
    /// predicate sets. None means "no index applies, scan everything".
    fn candidates(&self, pred: &QueryPredicate) -> Option<BTreeSet<String>> {
        let mut sets: Vec<&BTreeSet<String>> = Vec::new();
        static EMPTY: BTreeSet<String> = BTreeSet::new();
        if let Some(kind) = &pred.kind {
            sets.push(self.by_kind.get(kind).unwrap_or(&EMPTY));
        }
        if let Some(status) = &pred.status {
            sets.push(self.by_status.get(status).unwrap_or(&EMPTY));
        }
        if let Some(tag) = &pred.tag {
            sets.push(self.by_tag.get(tag).unwrap_or(&EMPTY));
        }
        let first = sets.first()?;
        let mut out: BTreeSet<String> = (*first).clone();
        for set in &sets[1..] {
            out = out.intersection(set).cloned().collect();
        }
        Some(out)
    }
}

/// Durable, indexed record store. Reads may be served from a bounded-
/// staleness cache; writes go through to the backend (with capped
/// exponential backoff on transient failures) before the cache and the
/// secondary indexes are updated.
pub struct Registry {
    backend: Arc<dyn RegistryBackend>,
    bus: EventBus,
    cache: RwLock<HashMap<(Namespace, String), CacheEntry>>,
    indexes: RwLock<HashMap<Namespace, NamespaceIndex>>,
    staleness: Duration,
}

impl Registry {
    pub fn new(backend: Arc<dyn RegistryBackend>, bus: EventBus) -> Self {
        Self {
            backend,
            bus,
            cache: RwLock::new(HashMap::new()),
            indexes: RwLock::new(HashMap::new()),
            staleness: DEFAULT_STALENESS,
        }
    }

    pub fn with_staleness(mut self, staleness: Duration) -> Self {
        self.staleness = staleness;
        self
    }

    /// Durable write-through. Retries `BackendUnavailable` with capped
    /// exponential backoff (base 100 ms, cap 5 s, jitter ±20 %); other
    /// errors surface immediately. Emits `registry:updated` on success.
    pub async fn put(&self, ns: Namespace, doc: StoredDocument) -> CorralResult<()> {
        self.write_with_retry(|| self.backend.store(ns, &doc)).await?;

        let key = (ns, doc.id.clone());
        {
            let mut cache = self.cache.write().await;
            cache.insert(
                key,
                CacheEntry {
                    doc: doc.clone(),
                    fetched_at: Instant::now(),
                },
            );
        }
        {
            let mut indexes = self.indexes.write().await;
            indexes.entry(ns).or_default().insert(&doc);
        }
        self.bus.publish(Event::RegistryUpdated {
            namespace: ns.as_str().to_string(),
            id: doc.id,
        });
        Ok(())
    }

    pub async fn get(&self, ns: Namespace, id: &str) -> CorralResult<Option<StoredDocument>> {
        {
            let cache = self.cache.read().await;
            if let Some(entry) = cache.get(&(ns, id.to_string())) {
                if entry.fetched_at.elapsed() < self.staleness {
                    return Ok(Some(entry.doc.clone()));
                }
            }
        }
        // Miss or stale: refresh lazily from the backend.
        let loaded = self.backend.load(ns, id).await?;
        let mut cache = self.cache.write().await;
        match &loaded {
            Some(doc) => {
                cache.insert(
                    (ns, id.to_string()),
                    CacheEntry {
                        doc: doc.clone(),
                        fetched_at: Instant::now(),
                    },
                );
            }
            None => {
                cache.remove(&(ns, id.to_string()));
            }
        }
        Ok(loaded)
    }

    /// Delete a record; with `preserve_history` the envelope moves to the
    /// archived namespace stamped with an `archived_at:` tag.
    pub async fn delete(&self, ns: Namespace, id: &str, preserve_history: bool) -> CorralResult<()> {
        let existing = self.get(ns, id).await?;
        self.write_with_retry(|| self.backend.remove(ns, id)).await?;

        {
            let mut cache = self.cache.write().await;
            cache.remove(&(ns, id.to_string()));
        }
        {
            let mut indexes = self.indexes.write().await;
            if let Some(index) = indexes.get_mut(&ns) {
                index.remove(id);
            }
        }

        if preserve_history {
            if let Some(mut doc) = existing {
                doc.tags.push(format!("archived_at:{}", Utc::now().to_rfc3339()));
                doc.tags.push(format!("archived_from:{ns}"));
                self.put(Namespace::Archived, doc).await?;
            }
        }
        Ok(())
    }

    /// Structured query. Indexed fields (kind, status, tag) narrow the
    /// candidate set before the full predicate runs.
    pub async fn query(&self, ns: Namespace, pred: &QueryPredicate) -> CorralResult<Vec<StoredDocument>> {
        self.hydrate_index(ns).await?;

        let candidate_ids = {
            let indexes = self.indexes.read().await;
            indexes.get(&ns).and_then(|i| i.candidates(pred))
        };

        let mut out = Vec::new();
        match candidate_ids {
            Some(ids) => {
                for id in ids {
                    if let Some(doc) = self.get(ns, &id).await? {
                        if pred.matches(&doc) {
                            out.push(doc);
                        }
                    }
                }
            }
            None => {
                for doc in self.backend.list(ns).await? {
                    if pred.matches(&doc) {
                        out.push(doc);
                    }
                }
            }
        }
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    pub async fn count(&self, ns: Namespace) -> CorralResult<usize> {
        Ok(self.backend.list(ns).await?.len())
    }

    pub async fn list_ids(&self, ns: Namespace) -> CorralResult<Vec<String>> {
        let mut ids: Vec<String> = self
            .backend
            .list(ns)
            .await?
            .into_iter()
            .map(|d| d.id)
            .collect();
        ids.sort();
        Ok(ids)
    }

    // --- Typed helpers over the agents namespace ---

    pub async fn put_agent(&self, agent: &AgentRecord) -> CorralResult<()> {
        let doc = StoredDocument::new(
            agent.id.to_string(),
            "agent",
            serde_json::to_value(agent)?,
            vec![agent.kind.clone(), agent.template.clone()],
        );
        self.put(Namespace::Agents, doc).await
    }

    pub async fn get_agent(&self, id: AgentId) -> CorralResult<Option<AgentRecord>> {
        match self.get(Namespace::Agents, &id.to_string()).await? {
            Some(doc) => Ok(Some(serde_json::from_value(doc.payload)?)),
            None => Ok(None),
        }
    }

    pub async fn put_workflow(&self, workflow: &WorkflowRecord) -> CorralResult<()> {
        let doc = StoredDocument::new(
            workflow.id.to_string(),
            "workflow",
            serde_json::to_value(workflow)?,
            vec![workflow.name.clone()],
        );
        self.put(Namespace::Workflows, doc).await
    }

    /// Pick the best idle-or-busy agent for a capability set using the
    /// deterministic assignment score. Agents at their concurrency limit
    /// and the `exclude` set are filtered out.
    pub async fn best_agent(
        &self,
        required_capabilities: &[String],
        exclude: &HashSet<AgentId>,
    ) -> CorralResult<Option<AgentRecord>> {
        let docs = self
            .query(Namespace::Agents, &QueryPredicate::default().kind("agent"))
            .await?;
        let mut agents: Vec<AgentRecord> = Vec::with_capacity(docs.len());
        for doc in docs {
            match serde_json::from_value::<AgentRecord>(doc.payload) {
                Ok(agent) => agents.push(agent),
                Err(e) => warn!(id = %doc.id, error = %e, "skipping undecodable agent record"),
            }
        }
        let eligible: Vec<&AgentRecord> = agents
            .iter()
            .filter(|a| {
                matches!(a.status, AgentStatus::Idle | AgentStatus::Busy)
                    && a.workload < a.capabilities.max_concurrent_tasks
                    && !exclude.contains(&a.id)
            })
            .collect();
        Ok(score::best(eligible, required_capabilities).cloned())
    }

    async fn hydrate_index(&self, ns: Namespace) -> CorralResult<()> {
        {
            let indexes = self.indexes.read().await;
            if indexes.get(&ns).map(|i| i.hydrated).unwrap_or(false) {
                return Ok(());
            }
        }
        let docs = self.backend.list(ns).await?;
        let mut indexes = self.indexes.write().await;
        let index = indexes.entry(ns).or_default();
        if !index.hydrated {
            for doc in &docs {
                index.insert(doc);
            }
            index.hydrated = true;
            debug!(namespace = %ns, records = docs.len(), "hydrated registry index");
        }
        Ok(())
    }

    async fn write_with_retry<F, Fut>(&self, op: F) -> CorralResult<()>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = CorralResult<()>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(()) => return Ok(()),
                Err(CorralError::BackendUnavailable(msg)) => {
                    attempt += 1;
                    if attempt >= RETRY_ATTEMPTS {
                        return Err(CorralError::BackendUnavailable(msg));
                    }
                    let backoff = RETRY_BASE
                        .saturating_mul(2u32.saturating_pow(attempt - 1))
                        .min(RETRY_CAP);
                    let jitter = rand::thread_rng().gen_range(0.8..1.2);
                    let delay = backoff.mul_f64(jitter);
                    warn!(attempt, delay_ms = delay.as_millis() as u64, error = %msg,
                        "registry backend unavailable, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(other) => return Err(other),
            }
        }
    }
}
