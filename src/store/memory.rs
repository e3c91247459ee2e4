//! In-memory store
//!
//! Keeps catalog records and tasks in lock-guarded maps. Used for tests and
//! for embedding the worker without a database.

use super::model::{Application, Cluster, EnvBinding, RegistryCredential, Service, ServiceBundle};
use super::{CatalogStore, TaskStore};
use crate::error::{DeckhandError, Result};
use crate::task::{Task, TaskStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Default)]
struct State {
    clusters: HashMap<String, Cluster>,
    applications: HashMap<String, Application>,
    services: HashMap<String, Service>,
    registry_credentials: HashMap<String, Vec<RegistryCredential>>,
    env_bindings: HashMap<String, Vec<EnvBinding>>,
    tasks: HashMap<String, Task>,
}

/// Lock-guarded in-memory store
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<State>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>> {
        self.state
            .read()
            .map_err(|_| DeckhandError::Store("Failed to acquire read lock".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>> {
        self.state
            .write()
            .map_err(|_| DeckhandError::Store("Failed to acquire write lock".to_string()))
    }

    /// Add or replace a cluster
    pub fn put_cluster(&self, cluster: Cluster) -> Result<()> {
        self.write()?.clusters.insert(cluster.id.clone(), cluster);
        Ok(())
    }

    /// Add or replace an application
    pub fn put_application(&self, application: Application) -> Result<()> {
        self.write()?
            .applications
            .insert(application.id.clone(), application);
        Ok(())
    }

    /// Add or replace a service
    pub fn put_service(&self, service: Service) -> Result<()> {
        self.write()?.services.insert(service.id.clone(), service);
        Ok(())
    }

    /// Associate a registry credential with a service
    pub fn attach_registry_credential(
        &self,
        service_id: &str,
        credential: RegistryCredential,
    ) -> Result<()> {
        self.write()?
            .registry_credentials
            .entry(service_id.to_string())
            .or_default()
            .push(credential);
        Ok(())
    }

    /// Associate an env binding with a service
    pub fn attach_env_binding(&self, service_id: &str, binding: EnvBinding) -> Result<()> {
        self.write()?
            .env_bindings
            .entry(service_id.to_string())
            .or_default()
            .push(binding);
        Ok(())
    }

    /// Modify a stored service in place
    pub fn update_service<F>(&self, service_id: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut Service),
    {
        let mut state = self.write()?;
        let service = state
            .services
            .get_mut(service_id)
            .ok_or_else(|| DeckhandError::Store(format!("Service {} not stored", service_id)))?;
        f(service);
        Ok(())
    }
}

#[async_trait]
impl CatalogStore for MemoryStore {
    async fn cluster(&self, id: &str) -> Result<Option<Cluster>> {
        Ok(self.read()?.clusters.get(id).cloned())
    }

    async fn service_bundle(&self, service_id: &str) -> Result<Option<ServiceBundle>> {
        let state = self.read()?;

        let Some(service) = state.services.get(service_id) else {
            return Ok(None);
        };
        let application = state
            .applications
            .get(&service.application_id)
            .cloned()
            .ok_or_else(|| {
                DeckhandError::Store(format!(
                    "Application {} of service {} not stored",
                    service.application_id, service_id
                ))
            })?;
        let cluster = application
            .cluster_id
            .as_ref()
            .and_then(|id| state.clusters.get(id))
            .cloned();

        Ok(Some(ServiceBundle {
            service: service.clone(),
            application,
            cluster,
            registry_credentials: state
                .registry_credentials
                .get(service_id)
                .cloned()
                .unwrap_or_default(),
            env_bindings: state
                .env_bindings
                .get(service_id)
                .cloned()
                .unwrap_or_default(),
        }))
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn insert_task(&self, task: &Task) -> Result<()> {
        self.write()?.tasks.insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn task(&self, id: &str) -> Result<Option<Task>> {
        Ok(self.read()?.tasks.get(id).cloned())
    }

    async fn oldest_waiting(&self) -> Result<Option<Task>> {
        Ok(self
            .read()?
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Waiting)
            .min_by_key(|t| t.created_at)
            .cloned())
    }

    async fn claim(&self, id: &str, started_at: DateTime<Utc>) -> Result<bool> {
        let mut state = self.write()?;
        let task = state
            .tasks
            .get_mut(id)
            .ok_or_else(|| DeckhandError::TaskNotFound(id.to_string()))?;

        if task.status != TaskStatus::Waiting {
            return Ok(false);
        }
        task.transition(TaskStatus::Executing, started_at)?;
        Ok(true)
    }

    async fn append_log(&self, id: &str, line: &str) -> Result<()> {
        let mut state = self.write()?;
        let task = state
            .tasks
            .get_mut(id)
            .ok_or_else(|| DeckhandError::TaskNotFound(id.to_string()))?;
        task.log.push(line.to_string());
        Ok(())
    }

    async fn finish(&self, id: &str, status: TaskStatus, finished_at: DateTime<Utc>) -> Result<()> {
        let mut state = self.write()?;
        let task = state
            .tasks
            .get_mut(id)
            .ok_or_else(|| DeckhandError::TaskNotFound(id.to_string()))?;

        if !status.is_terminal() {
            return Err(DeckhandError::InvalidTransition {
                task_id: id.to_string(),
                from: task.status.to_string(),
                to: status.to_string(),
            });
        }
        task.transition(status, finished_at)
    }
}
