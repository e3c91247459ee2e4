//! Reconciliation engine
//!
//! Drives one task to completion: claims it, loads the declared service and
//! converges the namespace, pull secrets, deployment, network service and
//! ingress onto it. Every object goes through the same read, then replace or
//! create, step; a 404 on the read is the only condition that selects the
//! create branch. Any other control-plane error aborts the run.

pub mod manifest;

use crate::cluster::{ClusterClientFactory, ClusterHandles};
use crate::crypto::CredentialCipher;
use crate::error::{DeckhandError, Result};
use crate::naming::{k8s_name, sanitize, DEFAULT_MAX_LEN};
use crate::store::{CatalogStore, ServiceBundle, TaskStore};
use crate::task::{Task, TaskJournal, TaskPayload};
use chrono::Utc;
use k8s_openapi::api::core::v1::EnvVar;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use url::Url;
use zeroize::Zeroizing;

/// Reconciles tasks against clusters
#[derive(Clone)]
pub struct Reconciler {
    catalog: Arc<dyn CatalogStore>,
    tasks: Arc<dyn TaskStore>,
    factory: ClusterClientFactory,
    cipher: CredentialCipher,
    timeout: Option<Duration>,
}

/// Resolved identity of one reconciliation target
struct Target<'a> {
    bundle: &'a ServiceBundle,
    image: &'a str,
    namespace: String,
    name: String,
}

impl Reconciler {
    /// Create a new reconciler
    pub fn new(
        catalog: Arc<dyn CatalogStore>,
        tasks: Arc<dyn TaskStore>,
        factory: ClusterClientFactory,
        cipher: CredentialCipher,
    ) -> Self {
        Self {
            catalog,
            tasks,
            factory,
            cipher,
            timeout: None,
        }
    }

    /// Fail runs whose work takes longer than `timeout` after the claim
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Journal writing to the task's log
    pub fn journal(&self, task_id: &str) -> TaskJournal {
        TaskJournal::new(self.tasks.clone(), task_id)
    }

    /// Run a task
    ///
    /// Returns without side effects if another worker claimed the task first.
    /// The optional timeout starts once the claim has succeeded.
    /// Fatal errors are written to the task log, the task is marked failed and
    /// the error is returned.
    pub async fn run(&self, task: &Task) -> Result<()> {
        if !self.tasks.claim(&task.id, Utc::now()).await? {
            info!("Task {} already claimed, skipping", task.id);
            return Ok(());
        }

        let journal = self.journal(&task.id);
        let outcome = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, self.execute(task, &journal))
                .await
                .unwrap_or_else(|_| {
                    Err(DeckhandError::Timeout {
                        secs: limit.as_secs(),
                    })
                }),
            None => self.execute(task, &journal).await,
        };

        match outcome {
            Ok(()) => {
                journal.finish_done().await?;
                info!("Task {} completed", task.id);
                Ok(())
            }
            Err(err) => {
                if let Err(store_err) = journal.finish_failed(&err).await {
                    error!("Failed to record failure of task {}: {}", task.id, store_err);
                }
                Err(err)
            }
        }
    }

    async fn execute(&self, task: &Task, journal: &TaskJournal) -> Result<()> {
        journal
            .log(format!("Starting deployment task {}", task.id))
            .await?;

        let payload = TaskPayload::decode(task)?;
        let TaskPayload::Deploy { image, .. } = &payload;
        journal
            .log(format!("Task type: {}", payload.label()))
            .await?;
        journal.log(format!("Image: {}", image)).await?;

        journal.log("Loading service configuration...").await?;
        let bundle = self
            .catalog
            .service_bundle(&task.service_id)
            .await?
            .ok_or_else(|| DeckhandError::ServiceNotFound(task.id.clone()))?;

        journal
            .log(format!("Service: {}", bundle.service.name))
            .await?;
        journal
            .log(format!("Application: {}", bundle.application.name))
            .await?;
        journal
            .log(format!("Namespace: {}", bundle.application.namespace))
            .await?;

        let cluster = bundle.cluster.as_ref().ok_or_else(|| {
            DeckhandError::ApplicationClusterMissing(bundle.application.id.clone())
        })?;
        journal.log(format!("Cluster: {}", cluster.name)).await?;

        journal.log("Loading Kubernetes configuration...").await?;
        let handles = self.factory.resolve(&cluster.id).await?;
        journal.log("✓ Kubernetes configuration loaded").await?;

        let target = Target {
            bundle: &bundle,
            image,
            namespace: sanitize(&bundle.application.namespace, DEFAULT_MAX_LEN),
            name: k8s_name(&bundle.service.name),
        };

        self.ensure_namespace(&target, &handles, journal).await?;
        let pull_secrets = self
            .ensure_registry_secrets(&target, &handles, journal)
            .await?;
        let env = self.decrypt_env(&target, journal).await?;
        self.upsert_deployment(&target, &handles, &pull_secrets, env, journal)
            .await?;
        self.upsert_service(&target, &handles, journal).await?;
        self.reconcile_ingress(&target, &handles, journal).await?;

        journal.log("✓ Deployment completed successfully").await
    }

    async fn ensure_namespace(
        &self,
        target: &Target<'_>,
        handles: &ClusterHandles,
        journal: &TaskJournal,
    ) -> Result<()> {
        let namespace = &target.namespace;
        let existing = handles.core.list_namespaces().await?;
        if existing.iter().any(|ns| ns == namespace) {
            return journal
                .log(format!(
                    "Namespace {} already exists, skipping creation",
                    namespace
                ))
                .await;
        }

        journal
            .log(format!("Creating namespace {}...", namespace))
            .await?;
        handles
            .core
            .create_namespace(&manifest::namespace(namespace))
            .await?;
        journal
            .log(format!("✓ Namespace {} created successfully", namespace))
            .await
    }

    /// Create missing pull secrets and return their names
    ///
    /// Secrets that already exist are left untouched, even when the stored
    /// credential has changed since they were created.
    async fn ensure_registry_secrets(
        &self,
        target: &Target<'_>,
        handles: &ClusterHandles,
        journal: &TaskJournal,
    ) -> Result<Vec<String>> {
        let credentials = &target.bundle.registry_credentials;
        if credentials.is_empty() {
            journal.log("No Docker secrets configured").await?;
            return Ok(Vec::new());
        }

        journal
            .log(format!(
                "Processing {} Docker secret(s)...",
                credentials.len()
            ))
            .await?;

        let namespace = &target.namespace;
        let mut names = Vec::with_capacity(credentials.len());
        for credential in credentials {
            let name = k8s_name(&credential.name);

            match handles.core.read_secret(namespace, &name).await {
                Ok(_) => {
                    journal
                        .log(format!(
                            "Docker secret {} already exists in {}, skipping creation",
                            name, namespace
                        ))
                        .await?;
                }
                Err(e) if e.is_not_found() => {
                    journal
                        .log(format!(
                            "Creating Docker secret {} for registry {}...",
                            name, credential.server
                        ))
                        .await?;
                    let password = Zeroizing::new(self.cipher.decrypt(&credential.password)?);
                    let secret = manifest::registry_secret(
                        &name,
                        namespace,
                        &credential.server,
                        &credential.username,
                        &password,
                    )?;
                    handles.core.create_secret(namespace, &secret).await?;
                    journal
                        .log(format!(
                            "✓ Docker secret {} created successfully in {}",
                            name, namespace
                        ))
                        .await?;
                }
                Err(e) => return Err(e.into()),
            }

            names.push(name);
        }

        Ok(names)
    }

    /// Decrypt env bindings, skipping the ones that fail
    async fn decrypt_env(&self, target: &Target<'_>, journal: &TaskJournal) -> Result<Vec<EnvVar>> {
        let bindings = &target.bundle.env_bindings;
        journal
            .log(format!(
                "Processing {} environment variable(s)...",
                bindings.len()
            ))
            .await?;

        let mut env = Vec::with_capacity(bindings.len());
        for binding in bindings {
            match self.cipher.decrypt(&binding.value) {
                Ok(value) => {
                    env.push(EnvVar {
                        name: binding.key.clone(),
                        value: Some(value),
                        ..EnvVar::default()
                    });
                    journal.log(format!("  ✓ {}", binding.key)).await?;
                }
                Err(source) => {
                    let err = DeckhandError::EnvDecryptFailure {
                        key: binding.key.clone(),
                        source,
                    };
                    tolerate(Err(err), journal).await?;
                }
            }
        }

        Ok(env)
    }

    async fn upsert_deployment(
        &self,
        target: &Target<'_>,
        handles: &ClusterHandles,
        pull_secrets: &[String],
        env: Vec<EnvVar>,
        journal: &TaskJournal,
    ) -> Result<()> {
        journal.log("Creating/updating deployment...").await?;

        let (namespace, name) = (&target.namespace, &target.name);
        let service = &target.bundle.service;
        let env_count = env.len();
        let mut desired =
            manifest::deployment(name, namespace, target.image, service, pull_secrets, env);

        let existing = match handles.workloads.read_deployment(namespace, name).await {
            Ok(existing) => Some(existing),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e.into()),
        };

        match existing {
            Some(existing) => {
                journal
                    .log(format!("Deployment {} already exists, updating...", name))
                    .await?;
                self.log_deployment_details(target, env_count, pull_secrets.len(), journal)
                    .await?;
                desired.metadata.resource_version = existing.metadata.resource_version;
                handles
                    .workloads
                    .replace_deployment(namespace, name, &desired)
                    .await?;
                journal
                    .log(format!(
                        "✓ Deployment {} updated successfully in {}",
                        name, namespace
                    ))
                    .await
            }
            None => {
                journal
                    .log(format!("Creating deployment {}...", name))
                    .await?;
                self.log_deployment_details(target, env_count, pull_secrets.len(), journal)
                    .await?;
                handles
                    .workloads
                    .create_deployment(namespace, &desired)
                    .await?;
                journal
                    .log(format!(
                        "✓ Deployment {} created successfully in {}",
                        name, namespace
                    ))
                    .await
            }
        }
    }

    async fn log_deployment_details(
        &self,
        target: &Target<'_>,
        env_count: usize,
        pull_secret_count: usize,
        journal: &TaskJournal,
    ) -> Result<()> {
        let service = &target.bundle.service;
        journal.log(format!("  Image: {}", target.image)).await?;
        journal
            .log(format!("  Replicas: {}", service.replicas))
            .await?;
        journal
            .log(format!("  Container Port: {}", service.container_port))
            .await?;
        if let Some(probe) = &service.liveness_probe {
            journal
                .log(format!("  Liveness Probe: {}", probe.path))
                .await?;
        }
        if let Some(probe) = &service.readiness_probe {
            journal
                .log(format!("  Readiness Probe: {}", probe.path))
                .await?;
        }
        let max_surge = manifest::non_empty(&service.max_surge);
        let max_unavailable = manifest::non_empty(&service.max_unavailable);
        if max_surge.is_some() || max_unavailable.is_some() {
            journal
                .log(format!(
                    "  Rolling Update: maxSurge={}, maxUnavailable={}",
                    max_surge.unwrap_or("default"),
                    max_unavailable.unwrap_or("default"),
                ))
                .await?;
        }
        if env_count > 0 {
            journal
                .log(format!("  Environment Variables: {}", env_count))
                .await?;
        }
        if pull_secret_count > 0 {
            journal
                .log(format!("  Image Pull Secrets: {}", pull_secret_count))
                .await?;
        }
        Ok(())
    }

    async fn upsert_service(
        &self,
        target: &Target<'_>,
        handles: &ClusterHandles,
        journal: &TaskJournal,
    ) -> Result<()> {
        journal.log("Creating Kubernetes service...").await?;

        let (namespace, name) = (&target.namespace, &target.name);
        let port = target.bundle.service.container_port;
        let mut desired = manifest::network_service(name, namespace, port);

        let existing = match handles.core.read_service(namespace, name).await {
            Ok(existing) => Some(existing),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e.into()),
        };

        match existing {
            Some(existing) => {
                journal
                    .log(format!("Service {} already exists, updating...", name))
                    .await?;
                // The allocated cluster IP is immutable
                if let (Some(spec), Some(live)) = (desired.spec.as_mut(), existing.spec) {
                    spec.cluster_ip = live.cluster_ip;
                    spec.cluster_ips = live.cluster_ips;
                }
                desired.metadata.resource_version = existing.metadata.resource_version;
                handles
                    .core
                    .replace_service(namespace, name, &desired)
                    .await?;
                journal
                    .log(format!(
                        "✓ Service {} updated successfully in {}",
                        name, namespace
                    ))
                    .await
            }
            None => {
                journal
                    .log(format!(
                        "Creating Kubernetes service {} on port {}...",
                        name, port
                    ))
                    .await?;
                handles.core.create_service(namespace, &desired).await?;
                journal
                    .log(format!(
                        "✓ Service {} created successfully in {}",
                        name, namespace
                    ))
                    .await
            }
        }
    }

    async fn reconcile_ingress(
        &self,
        target: &Target<'_>,
        handles: &ClusterHandles,
        journal: &TaskJournal,
    ) -> Result<()> {
        let ingress_url = target
            .bundle
            .service
            .ingress_url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty());

        match ingress_url {
            Some(url) => {
                journal.log("Creating/updating ingress...").await?;
                match ingress_host(url) {
                    Ok(host) => self.upsert_ingress(target, handles, &host, journal).await,
                    Err(err) => tolerate(Err(err), journal).await,
                }
            }
            None => {
                journal
                    .log("No ingress URL configured, checking for existing ingress to delete...")
                    .await?;
                tolerate(self.delete_ingress(target, handles, journal).await, journal).await
            }
        }
    }

    async fn upsert_ingress(
        &self,
        target: &Target<'_>,
        handles: &ClusterHandles,
        host: &str,
        journal: &TaskJournal,
    ) -> Result<()> {
        let (namespace, name) = (&target.namespace, &target.name);
        let port = target.bundle.service.container_port;
        let mut desired = manifest::ingress(name, namespace, host, name, port);

        let existing = match handles.network.read_ingress(namespace, name).await {
            Ok(existing) => Some(existing),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e.into()),
        };

        match existing {
            Some(existing) => {
                journal
                    .log(format!("Ingress {} already exists, updating...", name))
                    .await?;
                journal.log(format!("  Host: {}", host)).await?;
                desired.metadata.resource_version = existing.metadata.resource_version;
                handles
                    .network
                    .replace_ingress(namespace, name, &desired)
                    .await?;
                journal
                    .log(format!(
                        "✓ Ingress {} updated successfully in {}",
                        name, namespace
                    ))
                    .await
            }
            None => {
                journal
                    .log(format!("Creating ingress {} for host {}...", name, host))
                    .await?;
                handles.network.create_ingress(namespace, &desired).await?;
                journal
                    .log(format!(
                        "✓ Ingress {} created successfully in {}",
                        name, namespace
                    ))
                    .await
            }
        }
    }

    async fn delete_ingress(
        &self,
        target: &Target<'_>,
        handles: &ClusterHandles,
        journal: &TaskJournal,
    ) -> Result<()> {
        let (namespace, name) = (&target.namespace, &target.name);
        journal
            .log(format!("Deleting ingress {} from {}...", name, namespace))
            .await?;

        match handles.network.delete_ingress(namespace, name).await {
            Ok(()) => {
                journal
                    .log(format!(
                        "✓ Ingress {} deleted successfully from {}",
                        name, namespace
                    ))
                    .await
            }
            Err(e) if e.is_not_found() => {
                journal
                    .log(format!(
                        "Ingress {} does not exist in {}, skipping deletion",
                        name, namespace
                    ))
                    .await
            }
            Err(e) => Err(DeckhandError::IngressDeleteFailed {
                name: name.clone(),
                source: e,
            }),
        }
    }
}

/// Log a non-fatal error as a warning and carry on; fatal errors pass through
async fn tolerate(result: Result<()>, journal: &TaskJournal) -> Result<()> {
    match result {
        Err(err) if err.is_non_fatal() => journal.warn(&err).await,
        other => other,
    }
}

/// Extract the host an ingress should route
fn ingress_host(ingress_url: &str) -> Result<String> {
    let invalid = |reason: String| DeckhandError::IngressUrlInvalid {
        url: ingress_url.to_string(),
        reason,
    };

    let url = Url::parse(ingress_url).map_err(|e| invalid(e.to_string()))?;
    match url.host_str() {
        Some(host) if !host.is_empty() => Ok(host.to_string()),
        _ => Err(invalid("URL has no host".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::fake::{FakeCluster, FakeConnector};
    use crate::cluster::ClusterApiError;
    use crate::crypto::CipherKey;
    use crate::store::{
        Application, Cluster, EnvBinding, MemoryStore, ProbeConfig, RegistryCredential, Service,
    };
    use crate::task::TaskStatus;
    use k8s_openapi::api::core::v1::Secret;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    struct Harness {
        store: Arc<MemoryStore>,
        cluster: FakeCluster,
        cipher: CredentialCipher,
        reconciler: Reconciler,
    }

    impl Harness {
        fn new() -> Self {
            let store = Arc::new(MemoryStore::new());
            let cluster = FakeCluster::new();
            let cipher = CredentialCipher::new(CipherKey::from_master_key("test-master").unwrap());
            let connector = Arc::new(FakeConnector::new(cluster.clone()));
            let factory = ClusterClientFactory::new(store.clone(), connector, cipher.clone());
            let reconciler =
                Reconciler::new(store.clone(), store.clone(), factory, cipher.clone());

            store
                .put_cluster(Cluster {
                    id: "cluster-1".to_string(),
                    name: "production".to_string(),
                    kubeconfig: cipher.encrypt("apiVersion: v1").unwrap(),
                })
                .unwrap();
            store
                .put_application(Application {
                    id: "app-1".to_string(),
                    name: "shop".to_string(),
                    namespace: "Shop".to_string(),
                    cluster_id: Some("cluster-1".to_string()),
                })
                .unwrap();

            let mut service = Service::new("svc-1", "app-1", "Web", 8080);
            service.replicas = 2;
            service.ingress_url = Some("https://app.example.com".to_string());
            service.readiness_probe = Some(ProbeConfig::on_path("/ready"));
            store.put_service(service).unwrap();
            store
                .attach_registry_credential(
                    "svc-1",
                    RegistryCredential {
                        id: "cred-1".to_string(),
                        name: "GHCR Bot".to_string(),
                        server: "ghcr.io".to_string(),
                        username: "bot".to_string(),
                        password: cipher.encrypt("hunter2").unwrap(),
                    },
                )
                .unwrap();

            Self {
                store,
                cluster,
                cipher,
                reconciler,
            }
        }

        fn add_env(&self, key: &str, value: &str) {
            self.store
                .attach_env_binding(
                    "svc-1",
                    EnvBinding {
                        id: format!("env-{}", key),
                        key: key.to_string(),
                        value: self.cipher.encrypt(value).unwrap(),
                    },
                )
                .unwrap();
        }

        async fn enqueue(&self, task: Task) -> Task {
            self.store.insert_task(&task).await.unwrap();
            task
        }

        async fn deploy(&self, image: &str) -> (Task, Result<()>) {
            let task = self.enqueue(Task::deploy("svc-1", image)).await;
            let result = self.reconciler.run(&task).await;
            (self.store.task(&task.id).await.unwrap().unwrap(), result)
        }
    }

    fn position(log: &[String], needle: &str) -> usize {
        log.iter()
            .position(|line| line.contains(needle))
            .unwrap_or_else(|| panic!("missing log line containing {:?}", needle))
    }

    #[tokio::test]
    async fn test_deploy_creates_all_objects_in_order() {
        let harness = Harness::new();
        harness.add_env("MODE", "production");

        let (task, result) = harness.deploy("registry/app:v2").await;
        result.unwrap();

        assert_eq!(task.status, TaskStatus::Done);
        assert!(task.started_at.is_some());
        assert!(task.finished_at.is_some());

        let cluster = &harness.cluster;
        assert_eq!(cluster.namespace_names(), vec!["shop".to_string()]);

        let secret = cluster.secret("shop", "ghcr-bot").unwrap();
        let data = secret.data.unwrap();
        let document: serde_json::Value =
            serde_json::from_slice(&data[manifest::DOCKER_CONFIG_JSON_KEY].0).unwrap();
        assert_eq!(document["auths"]["ghcr.io"]["password"], "hunter2");

        let deployment = cluster.deployment("shop", "web").unwrap();
        let spec = deployment.spec.unwrap();
        assert_eq!(spec.replicas, Some(2));
        let pod = spec.template.spec.unwrap();
        assert_eq!(pod.image_pull_secrets.unwrap()[0].name, "ghcr-bot");
        let container = &pod.containers[0];
        assert_eq!(container.image.as_deref(), Some("registry/app:v2"));
        assert_eq!(container.ports.as_ref().unwrap()[0].container_port, 8080);
        assert_eq!(container.env.as_ref().unwrap()[0].name, "MODE");

        let service = cluster.service("shop", "web").unwrap();
        let selector = service.spec.unwrap().selector.unwrap();
        assert_eq!(selector.get("app").map(String::as_str), Some("web"));

        let ingress = cluster.ingress("shop", "web").unwrap();
        let rule = &ingress.spec.unwrap().rules.unwrap()[0];
        assert_eq!(rule.host.as_deref(), Some("app.example.com"));
        let backend = rule.http.as_ref().unwrap().paths[0]
            .backend
            .service
            .clone()
            .unwrap();
        assert_eq!(backend.name, "web");
        assert_eq!(backend.port.unwrap().number, Some(8080));

        let log = &task.log;
        let steps = [
            position(log, "Creating namespace shop"),
            position(log, "Creating Docker secret ghcr-bot"),
            position(log, "Creating deployment web"),
            position(log, "Creating Kubernetes service web"),
            position(log, "Creating ingress web"),
            position(log, "✓ Deployment completed successfully"),
        ];
        assert!(steps.windows(2).all(|w| w[0] < w[1]), "{:?}", log);

        assert_eq!(
            cluster.writes(),
            vec![
                "create_namespace shop",
                "create_secret shop/ghcr-bot",
                "create_deployment shop/web",
                "create_service shop/web",
                "create_ingress shop/web",
            ]
        );
    }

    #[tokio::test]
    async fn test_rerun_converges_with_replace() {
        let harness = Harness::new();
        harness.deploy("registry/app:v1").await.1.unwrap();
        let first = harness.cluster.deployment("shop", "web").unwrap();

        let (task, result) = harness.deploy("registry/app:v2").await;
        result.unwrap();
        assert_eq!(task.status, TaskStatus::Done);

        let writes = harness.cluster.writes();
        assert_eq!(
            &writes[5..],
            &[
                "replace_deployment shop/web",
                "replace_service shop/web",
                "replace_ingress shop/web",
            ]
        );
        assert_eq!(harness.cluster.namespace_names().len(), 1);

        let second = harness.cluster.deployment("shop", "web").unwrap();
        assert_ne!(
            first.metadata.resource_version,
            second.metadata.resource_version
        );
        let mut first_spec = first.spec.unwrap();
        let second_spec = second.spec.unwrap();
        first_spec.template.spec.as_mut().unwrap().containers[0].image =
            Some("registry/app:v2".to_string());
        assert_eq!(first_spec, second_spec);

        assert!(task.log.iter().any(|l| l.contains("already exists, skipping creation")));
        assert!(task
            .log
            .iter()
            .any(|l| l == "Deployment web already exists, updating..."));
    }

    #[tokio::test]
    async fn test_existing_secret_is_not_replaced() {
        let harness = Harness::new();
        harness.cluster.seed_namespace("shop");
        harness.cluster.seed_secret(
            "shop",
            Secret {
                metadata: ObjectMeta {
                    name: Some("ghcr-bot".to_string()),
                    ..ObjectMeta::default()
                },
                ..Secret::default()
            },
        );

        harness.deploy("registry/app:v2").await.1.unwrap();

        let writes = harness.cluster.writes();
        assert!(!writes.iter().any(|w| w.contains("_secret")));
        assert!(harness.cluster.secret("shop", "ghcr-bot").unwrap().data.is_none());
    }

    #[tokio::test]
    async fn test_cleared_ingress_url_retracts_route() {
        let harness = Harness::new();
        harness.deploy("registry/app:v1").await.1.unwrap();
        assert!(harness.cluster.ingress("shop", "web").is_some());

        harness
            .store
            .update_service("svc-1", |s| s.ingress_url = None)
            .unwrap();
        let (task, result) = harness.deploy("registry/app:v1").await;
        result.unwrap();
        assert_eq!(task.status, TaskStatus::Done);
        assert!(harness.cluster.ingress("shop", "web").is_none());
        assert!(task
            .log
            .iter()
            .any(|l| l == "✓ Ingress web deleted successfully from shop"));

        // Already absent
        let (task, result) = harness.deploy("registry/app:v1").await;
        result.unwrap();
        assert_eq!(task.status, TaskStatus::Done);
        assert!(task
            .log
            .iter()
            .any(|l| l == "Ingress web does not exist in shop, skipping deletion"));
    }

    #[tokio::test]
    async fn test_undecryptable_env_binding_is_skipped() {
        let harness = Harness::new();
        harness.add_env("A", "1");
        harness
            .store
            .attach_env_binding(
                "svc-1",
                EnvBinding {
                    id: "env-broken".to_string(),
                    key: "BROKEN".to_string(),
                    value: "not-a-cipher-frame".to_string(),
                },
            )
            .unwrap();
        harness.add_env("C", "3");

        let (task, result) = harness.deploy("registry/app:v2").await;
        result.unwrap();
        assert_eq!(task.status, TaskStatus::Done);

        let deployment = harness.cluster.deployment("shop", "web").unwrap();
        let env = deployment.spec.unwrap().template.spec.unwrap().containers[0]
            .env
            .clone()
            .unwrap();
        let names: Vec<_> = env.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["A", "C"]);

        let warnings: Vec<_> = task
            .log
            .iter()
            .filter(|l| l.starts_with("✗ Warning:"))
            .collect();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("BROKEN"));
        assert!(!task.log.iter().any(|l| l.contains("not-a-cipher-frame")));
    }

    #[tokio::test]
    async fn test_unknown_payload_fails_without_cluster_calls() {
        let harness = Harness::new();
        let task = harness
            .enqueue(Task::new(
                "svc-1",
                serde_json::json!({ "kind": "unrecognized" }),
            ))
            .await;

        let err = harness.reconciler.run(&task).await.unwrap_err();
        assert!(matches!(err, DeckhandError::UnknownPayload { .. }));

        let stored = harness.store.task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert!(stored.finished_at.is_some());
        assert!(stored
            .log
            .last()
            .unwrap()
            .starts_with("✗ Deployment failed: Unknown task payload"));
        assert_eq!(harness.cluster.call_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_service_fails() {
        let harness = Harness::new();
        let task = harness.enqueue(Task::deploy("svc-missing", "img")).await;

        let err = harness.reconciler.run(&task).await.unwrap_err();
        assert!(matches!(err, DeckhandError::ServiceNotFound(_)));

        let stored = harness.store.task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert_eq!(harness.cluster.call_count(), 0);
    }

    #[tokio::test]
    async fn test_application_without_cluster_fails() {
        let harness = Harness::new();
        harness
            .store
            .put_application(Application {
                id: "app-1".to_string(),
                name: "shop".to_string(),
                namespace: "Shop".to_string(),
                cluster_id: None,
            })
            .unwrap();

        let (task, result) = harness.deploy("img").await;
        assert!(matches!(
            result.unwrap_err(),
            DeckhandError::ApplicationClusterMissing(id) if id == "app-1"
        ));
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(harness.cluster.call_count(), 0);
    }

    #[tokio::test]
    async fn test_api_error_aborts_run() {
        let harness = Harness::new();
        harness.cluster.fail_on(
            "read_deployment",
            ClusterApiError::with_status(403, "Forbidden", "deployments is forbidden"),
        );

        let (task, result) = harness.deploy("registry/app:v2").await;
        let err = result.unwrap_err();
        assert!(matches!(err, DeckhandError::ClusterApi(ref e) if e.status == Some(403)));
        assert_eq!(task.status, TaskStatus::Failed);

        // Earlier steps are not rolled back, later ones never run
        let writes = harness.cluster.writes();
        assert_eq!(
            writes,
            vec!["create_namespace shop", "create_secret shop/ghcr-bot"]
        );
        assert!(task
            .log
            .iter()
            .any(|l| l.starts_with("✗ Deployment failed:") && l.contains("forbidden")));
    }

    #[tokio::test]
    async fn test_ingress_delete_error_is_a_warning() {
        let harness = Harness::new();
        harness
            .store
            .update_service("svc-1", |s| s.ingress_url = None)
            .unwrap();
        harness.cluster.fail_on(
            "delete_ingress",
            ClusterApiError::with_status(500, "InternalError", "etcd unavailable"),
        );

        let (task, result) = harness.deploy("img").await;
        assert!(result.is_ok());
        assert_eq!(task.status, TaskStatus::Done);

        let warnings: Vec<_> = task
            .log
            .iter()
            .filter(|l| l.starts_with("✗ Warning:"))
            .collect();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("Failed to delete ingress"));
        assert!(warnings[0].contains("etcd unavailable"));
        assert!(!task.log.iter().any(|l| l.starts_with("✗ Deployment failed")));
    }

    #[tokio::test]
    async fn test_blank_rolling_update_bounds_are_not_reported() {
        let harness = Harness::new();
        harness
            .store
            .update_service("svc-1", |s| {
                s.max_surge = Some("  ".to_string());
                s.max_unavailable = None;
            })
            .unwrap();

        let (task, result) = harness.deploy("img").await;
        assert!(result.is_ok());
        assert!(!task.log.iter().any(|l| l.contains("Rolling Update")));

        let deployment = harness.cluster.deployment("shop", "web").unwrap();
        assert!(deployment.spec.unwrap().strategy.is_none());
    }

    #[tokio::test]
    async fn test_ingress_read_error_is_fatal() {
        let harness = Harness::new();
        harness.cluster.fail_on(
            "read_ingress",
            ClusterApiError::with_status(500, "InternalError", "etcd unavailable"),
        );

        let (task, result) = harness.deploy("img").await;
        assert!(result.is_err());
        assert_eq!(task.status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn test_invalid_ingress_url_is_a_warning() {
        let harness = Harness::new();
        harness
            .store
            .update_service("svc-1", |s| s.ingress_url = Some("not a url".to_string()))
            .unwrap();

        let (task, result) = harness.deploy("registry/app:v2").await;
        result.unwrap();
        assert_eq!(task.status, TaskStatus::Done);
        assert!(harness.cluster.ingress("shop", "web").is_none());
        assert!(task
            .log
            .iter()
            .any(|l| l.starts_with("✗ Warning: Invalid ingress URL not a url")));
    }

    #[tokio::test]
    async fn test_claimed_task_is_skipped() {
        let harness = Harness::new();
        let task = harness.enqueue(Task::deploy("svc-1", "img")).await;
        harness.store.claim(&task.id, Utc::now()).await.unwrap();

        harness.reconciler.run(&task).await.unwrap();

        let stored = harness.store.task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Executing);
        assert!(stored.log.is_empty());
        assert_eq!(harness.cluster.call_count(), 0);
    }

    #[test]
    fn test_ingress_host() {
        assert_eq!(
            ingress_host("https://app.example.com/path?q=1").unwrap(),
            "app.example.com"
        );
        assert_eq!(
            ingress_host("http://api.example.com:8443").unwrap(),
            "api.example.com"
        );
        assert!(ingress_host("app.example.com").is_err());
        assert!(ingress_host("mailto:ops@example.com").is_err());
    }
}
