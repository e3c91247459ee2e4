//! Postgres-backed store
//!
//! Reads the tables described in `sql/schema.sql`. The management front end
//! owns the schema; the worker only reads catalog rows and updates tasks.

use super::model::{
    Application, Cluster, EnvBinding, ProbeConfig, RegistryCredential, Service, ServiceBundle,
};
use super::{CatalogStore, TaskStore};
use crate::error::{DeckhandError, Result};
use crate::task::{Task, TaskStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::debug;

const SERVICE_COLUMNS: &str = "id, application_id, name, replicas, container_port, \
     cpu_request, cpu_limit, memory_request, memory_limit, \
     liveness_probe_path, liveness_probe_initial_delay_seconds, liveness_probe_period_seconds, \
     liveness_probe_timeout_seconds, liveness_probe_success_threshold, liveness_probe_failure_threshold, \
     readiness_probe_path, readiness_probe_initial_delay_seconds, readiness_probe_period_seconds, \
     readiness_probe_timeout_seconds, readiness_probe_success_threshold, readiness_probe_failure_threshold, \
     ingress_url, max_surge, max_unavailable";

const TASK_COLUMNS: &str = "id, service_id, meta, status, log, created_at, started_at, finished_at";

/// Postgres store
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect to the database
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        debug!("Connected to postgres store");
        Ok(Self { pool })
    }

    /// Wrap an existing pool
    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn probe_from_row(row: &PgRow, prefix: &str) -> Result<Option<ProbeConfig>> {
    let path: Option<String> = row.try_get(format!("{}_path", prefix).as_str())?;
    let Some(path) = path.filter(|p| !p.is_empty()) else {
        return Ok(None);
    };

    let field = |name: &str| -> Result<Option<i32>> {
        Ok(row.try_get(format!("{}_{}", prefix, name).as_str())?)
    };

    Ok(Some(ProbeConfig {
        path,
        initial_delay_seconds: field("initial_delay_seconds")?,
        period_seconds: field("period_seconds")?,
        timeout_seconds: field("timeout_seconds")?,
        success_threshold: field("success_threshold")?,
        failure_threshold: field("failure_threshold")?,
    }))
}

fn service_from_row(row: &PgRow) -> Result<Service> {
    Ok(Service {
        id: row.try_get("id")?,
        application_id: row.try_get("application_id")?,
        name: row.try_get("name")?,
        replicas: row.try_get("replicas")?,
        container_port: row.try_get("container_port")?,
        cpu_request: row.try_get("cpu_request")?,
        cpu_limit: row.try_get("cpu_limit")?,
        memory_request: row.try_get("memory_request")?,
        memory_limit: row.try_get("memory_limit")?,
        liveness_probe: probe_from_row(row, "liveness_probe")?,
        readiness_probe: probe_from_row(row, "readiness_probe")?,
        ingress_url: row.try_get("ingress_url")?,
        max_surge: row.try_get("max_surge")?,
        max_unavailable: row.try_get("max_unavailable")?,
    })
}

fn task_from_row(row: &PgRow) -> Result<Task> {
    let status: String = row.try_get("status")?;
    Ok(Task {
        id: row.try_get("id")?,
        service_id: row.try_get("service_id")?,
        payload: row.try_get("meta")?,
        status: status.parse()?,
        log: row.try_get("log")?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
    })
}

fn cluster_from_row(row: &PgRow) -> Result<Cluster> {
    Ok(Cluster {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        kubeconfig: row.try_get("kubeconfig")?,
    })
}

#[async_trait]
impl CatalogStore for PostgresStore {
    async fn cluster(&self, id: &str) -> Result<Option<Cluster>> {
        let row = sqlx::query("SELECT id, name, kubeconfig FROM clusters WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(cluster_from_row).transpose()
    }

    async fn service_bundle(&self, service_id: &str) -> Result<Option<ServiceBundle>> {
        let sql = format!("SELECT {} FROM services WHERE id = $1", SERVICE_COLUMNS);
        let Some(row) = sqlx::query(&sql)
            .bind(service_id)
            .fetch_optional(&self.pool)
            .await?
        else {
            return Ok(None);
        };
        let service = service_from_row(&row)?;

        let row = sqlx::query(
            "SELECT id, name, namespace, cluster_id FROM applications WHERE id = $1",
        )
        .bind(&service.application_id)
        .fetch_one(&self.pool)
        .await?;
        let application = Application {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            namespace: row.try_get("namespace")?,
            cluster_id: row.try_get("cluster_id")?,
        };

        let cluster = match &application.cluster_id {
            Some(id) => self.cluster(id).await?,
            None => None,
        };

        let registry_credentials = sqlx::query(
            "SELECT r.id, r.name, r.server, r.username, r.password
             FROM registry_credentials r
             JOIN service_registry_credentials s ON s.registry_credential_id = r.id
             WHERE s.service_id = $1
             ORDER BY r.name",
        )
        .bind(service_id)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(|row| {
            Ok(RegistryCredential {
                id: row.try_get("id")?,
                name: row.try_get("name")?,
                server: row.try_get("server")?,
                username: row.try_get("username")?,
                password: row.try_get("password")?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

        let env_bindings = sqlx::query(
            "SELECT e.id, e.key, e.value
             FROM env_bindings e
             JOIN service_env_bindings s ON s.env_binding_id = e.id
             WHERE s.service_id = $1
             ORDER BY e.key",
        )
        .bind(service_id)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(|row| {
            Ok(EnvBinding {
                id: row.try_get("id")?,
                key: row.try_get("key")?,
                value: row.try_get("value")?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

        Ok(Some(ServiceBundle {
            service,
            application,
            cluster,
            registry_credentials,
            env_bindings,
        }))
    }
}

#[async_trait]
impl TaskStore for PostgresStore {
    async fn insert_task(&self, task: &Task) -> Result<()> {
        sqlx::query(
            "INSERT INTO tasks (id, service_id, meta, status, log, created_at, started_at, finished_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(&task.id)
        .bind(&task.service_id)
        .bind(&task.payload)
        .bind(task.status.as_str())
        .bind(&task.log)
        .bind(task.created_at)
        .bind(task.started_at)
        .bind(task.finished_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn task(&self, id: &str) -> Result<Option<Task>> {
        let sql = format!("SELECT {} FROM tasks WHERE id = $1", TASK_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(task_from_row).transpose()
    }

    async fn oldest_waiting(&self) -> Result<Option<Task>> {
        let sql = format!(
            "SELECT {} FROM tasks WHERE status = 'WAITING' ORDER BY created_at ASC LIMIT 1",
            TASK_COLUMNS
        );
        let row = sqlx::query(&sql).fetch_optional(&self.pool).await?;
        row.as_ref().map(task_from_row).transpose()
    }

    async fn claim(&self, id: &str, started_at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE tasks SET status = 'EXECUTING', started_at = $2
             WHERE id = $1 AND status = 'WAITING'",
        )
        .bind(id)
        .bind(started_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn append_log(&self, id: &str, line: &str) -> Result<()> {
        let result = sqlx::query("UPDATE tasks SET log = array_append(log, $2) WHERE id = $1")
            .bind(id)
            .bind(line)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DeckhandError::TaskNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn finish(&self, id: &str, status: TaskStatus, finished_at: DateTime<Utc>) -> Result<()> {
        if status.is_terminal() {
            let result = sqlx::query(
                "UPDATE tasks SET status = $2, finished_at = $3
                 WHERE id = $1 AND status = 'EXECUTING'",
            )
            .bind(id)
            .bind(status.as_str())
            .bind(finished_at)
            .execute(&self.pool)
            .await?;
            if result.rows_affected() == 1 {
                return Ok(());
            }
        }

        let current = self
            .task(id)
            .await?
            .ok_or_else(|| DeckhandError::TaskNotFound(id.to_string()))?;
        Err(DeckhandError::InvalidTransition {
            task_id: id.to_string(),
            from: current.status.to_string(),
            to: status.to_string(),
        })
    }
}
