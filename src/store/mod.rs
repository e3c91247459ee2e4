//! Persistent store access
//!
//! The worker reads declared configuration through [`CatalogStore`] and
//! drives work items through [`TaskStore`]. Both are implemented by the
//! in-memory [`MemoryStore`] and the Postgres-backed [`PostgresStore`].

pub mod memory;
pub mod model;
pub mod postgres;

pub use memory::MemoryStore;
pub use model::{
    Application, Cluster, EnvBinding, ProbeConfig, RegistryCredential, Service, ServiceBundle,
};
pub use postgres::PostgresStore;

use crate::error::Result;
use crate::task::{Task, TaskStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Read access to declared configuration
#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Load a cluster by ID
    async fn cluster(&self, id: &str) -> Result<Option<Cluster>>;

    /// Load a service with its application, cluster, credentials and env
    async fn service_bundle(&self, service_id: &str) -> Result<Option<ServiceBundle>>;
}

/// Work item queue with status and append-only log
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Enqueue a task
    async fn insert_task(&self, task: &Task) -> Result<()>;

    /// Load a task by ID
    async fn task(&self, id: &str) -> Result<Option<Task>>;

    /// Oldest task still waiting, by creation time
    async fn oldest_waiting(&self) -> Result<Option<Task>>;

    /// Move a task from WAITING to EXECUTING and stamp `started_at`
    ///
    /// The transition is conditional on the current status, so of several
    /// concurrent callers exactly one gets `true`.
    async fn claim(&self, id: &str, started_at: DateTime<Utc>) -> Result<bool>;

    /// Append one line to the task log
    async fn append_log(&self, id: &str, line: &str) -> Result<()>;

    /// Move an executing task to a terminal status and stamp `finished_at`
    async fn finish(&self, id: &str, status: TaskStatus, finished_at: DateTime<Utc>) -> Result<()>;
}
