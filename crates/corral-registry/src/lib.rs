//! Durable, indexed store of agents, tasks, and workflows.
//!
//! The registry defines the storage semantics; engines plug in behind
//! [`RegistryBackend`]. Reads may be served from a bounded-staleness
//! cache, writes always go through to the backend first.

pub mod backend;
pub mod query;
pub mod registry;
pub mod score;

pub use backend::{
    FileBackend, MemoryBackend, Namespace, RegistryBackend, StoredDocument, TieredBackend,
};
pub use query::QueryPredicate;
pub use registry::Registry;
