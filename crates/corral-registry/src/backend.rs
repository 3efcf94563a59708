use async_trait::async_trait;
use corral_core::{CorralError, CorralResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;

/// The four logical collections a backend must hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Namespace {
    Agents,
    Tasks,
    Workflows,
    Archived,
}

impl Namespace {
    pub fn as_str(&self) -> &'static str {
        match self {
            Namespace::Agents => "agents",
            Namespace::Tasks => "tasks",
            Namespace::Workflows => "workflows",
            Namespace::Archived => "archived",
        }
    }
}

impl std::fmt::Display for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Self-describing record envelope. On-disk representation is backend
/// specific but must round-trip through put/get bit-stably.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredDocument {
    pub id: String,
    pub kind: String,
    pub version: u32,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl StoredDocument {
    pub fn new(
        id: impl Into<String>,
        kind: impl Into<String>,
        payload: serde_json::Value,
        tags: Vec<String>,
    ) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            version: 1,
            payload,
            tags,
        }
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

/// Storage engine behind the registry. The registry defines the
/// semantics; engines only move envelopes.
#[async_trait]
pub trait RegistryBackend: Send + Sync {
    async fn load(&self, ns: Namespace, id: &str) -> CorralResult<Option<StoredDocument>>;
    async fn store(&self, ns: Namespace, doc: &StoredDocument) -> CorralResult<()>;
    async fn remove(&self, ns: Namespace, id: &str) -> CorralResult<()>;
    async fn list(&self, ns: Namespace) -> CorralResult<Vec<StoredDocument>>;
}

/// Purely in-memory backend; the default for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryBackend {
    records: RwLock<HashMap<(Namespace, String), StoredDocument>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RegistryBackend for MemoryBackend {
    async fn load(&self, ns: Namespace, id: &str) -> CorralResult<Option<StoredDocument>> {
        let records = self.records.read().await;
        Ok(records.get(&(ns, id.to_string())).cloned())
    }

    async fn store(&self, ns: Namespace, doc: &StoredDocument) -> CorralResult<()> {
        let mut records = self.records.write().await;
        records.insert((ns, doc.id.clone()), doc.clone());
        Ok(())
    }

    async fn remove(&self, ns: Namespace, id: &str) -> CorralResult<()> {
        let mut records = self.records.write().await;
        records.remove(&(ns, id.to_string()));
        Ok(())
    }

    async fn list(&self, ns: Namespace) -> CorralResult<Vec<StoredDocument>> {
        let records = self.records.read().await;
        Ok(records
            .iter()
            .filter(|((n, _), _)| *n == ns)
            .map(|(_, doc)| doc.clone())
            .collect())
    }
}

/// File-based backend: one JSON document per record under
/// `<dir>/<namespace>/<id>.json`.
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    pub async fn new(dir: PathBuf) -> CorralResult<Self> {
        for ns in [
            Namespace::Agents,
            Namespace::Tasks,
            Namespace::Workflows,
            Namespace::Archived,
        ] {
            tokio::fs::create_dir_all(dir.join(ns.as_str()))
                .await
                .map_err(|e| CorralError::BackendUnavailable(format!("create {ns}: {e}")))?;
        }
        Ok(Self { dir })
    }

    fn path(&self, ns: Namespace, id: &str) -> PathBuf {
        self.dir.join(ns.as_str()).join(format!("{id}.json"))
    }
}

#[async_trait]
impl RegistryBackend for FileBackend {
    async fn load(&self, ns: Namespace, id: &str) -> CorralResult<Option<StoredDocument>> {
        let path = self.path(ns, id);
        if !path.exists() {
            return Ok(None);
        }
        let data = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| CorralError::BackendUnavailable(format!("read {}: {e}", path.display())))?;
        let doc: StoredDocument = serde_json::from_str(&data)?;
        Ok(Some(doc))
    }

    async fn store(&self, ns: Namespace, doc: &StoredDocument) -> CorralResult<()> {
        let path = self.path(ns, &doc.id);
        let json = serde_json::to_string_pretty(doc)?;
        tokio::fs::write(&path, json)
            .await
            .map_err(|e| CorralError::BackendUnavailable(format!("write {}: {e}", path.display())))
    }

    async fn remove(&self, ns: Namespace, id: &str) -> CorralResult<()> {
        let path = self.path(ns, id);
        if path.exists() {
            tokio::fs::remove_file(&path).await.map_err(|e| {
                CorralError::BackendUnavailable(format!("remove {}: {e}", path.display()))
            })?;
        }
        Ok(())
    }

    async fn list(&self, ns: Namespace) -> CorralResult<Vec<StoredDocument>> {
        let dir = self.dir.join(ns.as_str());
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| CorralError::BackendUnavailable(format!("list {ns}: {e}")))?;
        let mut docs = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| CorralError::BackendUnavailable(format!("list {ns}: {e}")))?
        {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.ends_with(".json") {
                continue;
            }
            let data = tokio::fs::read_to_string(entry.path()).await.map_err(|e| {
                CorralError::BackendUnavailable(format!("read {}: {e}", name))
            })?;
            match serde_json::from_str(&data) {
                Ok(doc) => docs.push(doc),
                Err(e) => tracing::warn!(file = name, error = %e, "skipping unreadable record"),
            }
        }
        Ok(docs)
    }
}

/// Two backends composed into one: writes fan out to both, reads hit
/// the primary and fall back to the secondary. Typical pairing is a
/// fast `MemoryBackend` over a durable `FileBackend`.
pub struct TieredBackend {
    primary: Arc<dyn RegistryBackend>,
    secondary: Arc<dyn RegistryBackend>,
}

impl TieredBackend {
    pub fn new(primary: Arc<dyn RegistryBackend>, secondary: Arc<dyn RegistryBackend>) -> Self {
        Self { primary, secondary }
    }
}

#[async_trait]
impl RegistryBackend for TieredBackend {
    async fn load(&self, ns: Namespace, id: &str) -> CorralResult<Option<StoredDocument>> {
        match self.primary.load(ns, id).await {
            Ok(Some(doc)) => Ok(Some(doc)),
            Ok(None) => self.secondary.load(ns, id).await,
            Err(e) => {
                tracing::warn!(namespace = %ns, id, error = %e, "primary backend read failed, falling back");
                self.secondary.load(ns, id).await
            }
        }
    }

    async fn store(&self, ns: Namespace, doc: &StoredDocument) -> CorralResult<()> {
        // Both writes must land; a lost secondary write would silently
        // drop durability.
        self.primary.store(ns, doc).await?;
        self.secondary.store(ns, doc).await
    }

    async fn remove(&self, ns: Namespace, id: &str) -> CorralResult<()> {
        self.primary.remove(ns, id).await?;
        self.secondary.remove(ns, id).await
    }

    async fn list(&self, ns: Namespace) -> CorralResult<Vec<StoredDocument>> {
        // The secondary is the durable superset; merge anything the
        // primary has not seen yet.
        let mut docs = self.secondary.list(ns).await?;
        let known: std::collections::HashSet<String> = docs.iter().map(|d| d.id.clone()).collect();
        for doc in self.primary.list(ns).await? {
            if !known.contains(&doc.id) {
                docs.push(doc);
            }
        }
        Ok(docs)
    }
}
