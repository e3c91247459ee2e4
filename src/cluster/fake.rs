//! In-memory cluster for tests

use super::{
    ApiResult, ClusterApiError, ClusterConnector, ClusterHandles, CoreApi, LogOptions, NetworkApi,
    WorkloadApi,
};
use crate::error::Result;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Namespace, Pod, Secret, Service as K8sService};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::Metadata;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

type Key = (String, String);

#[derive(Default)]
struct State {
    namespaces: BTreeMap<String, Namespace>,
    secrets: BTreeMap<Key, Secret>,
    services: BTreeMap<Key, K8sService>,
    deployments: BTreeMap<Key, Deployment>,
    ingresses: BTreeMap<Key, Ingress>,
    pods: BTreeMap<Key, Pod>,
    pod_logs: HashMap<Key, String>,
    faults: HashMap<String, ClusterApiError>,
    calls: Vec<String>,
    revision: u64,
}

impl State {
    fn record(&mut self, op: &str, target: &str) -> ApiResult<()> {
        self.calls.push(format!("{} {}", op, target));
        match self.faults.get(op) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn next_revision(&mut self) -> String {
        self.revision += 1;
        self.revision.to_string()
    }
}

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

fn object_name<T: Metadata<Ty = k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta>>(
    object: &T,
) -> String {
    object.metadata().name.clone().unwrap_or_default()
}

fn read<T: Clone>(map: &BTreeMap<Key, T>, kind: &str, namespace: &str, name: &str) -> ApiResult<T> {
    map.get(&key(namespace, name))
        .cloned()
        .ok_or_else(|| ClusterApiError::not_found(kind, name))
}

/// Shared in-memory cluster; clones see the same state
#[derive(Clone, Default)]
pub struct FakeCluster {
    state: Arc<Mutex<State>>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Capability handles backed by this cluster
    pub fn handles(&self) -> ClusterHandles {
        ClusterHandles {
            core: Arc::new(self.clone()),
            workloads: Arc::new(self.clone()),
            network: Arc::new(self.clone()),
        }
    }

    /// Make every call of `op` fail with `err`
    pub fn fail_on(&self, op: &str, err: ClusterApiError) {
        self.lock().faults.insert(op.to_string(), err);
    }

    /// Every call so far, as `"<op> <namespace>/<name>"`
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn call_count(&self) -> usize {
        self.lock().calls.len()
    }

    /// Calls that changed state
    pub fn writes(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| {
                c.starts_with("create_") || c.starts_with("replace_") || c.starts_with("delete_")
            })
            .collect()
    }

    pub fn namespace_names(&self) -> Vec<String> {
        self.lock().namespaces.keys().cloned().collect()
    }

    pub fn secret(&self, namespace: &str, name: &str) -> Option<Secret> {
        self.lock().secrets.get(&key(namespace, name)).cloned()
    }

    pub fn deployment(&self, namespace: &str, name: &str) -> Option<Deployment> {
        self.lock().deployments.get(&key(namespace, name)).cloned()
    }

    pub fn service(&self, namespace: &str, name: &str) -> Option<K8sService> {
        self.lock().services.get(&key(namespace, name)).cloned()
    }

    pub fn ingress(&self, namespace: &str, name: &str) -> Option<Ingress> {
        self.lock().ingresses.get(&key(namespace, name)).cloned()
    }

    pub fn seed_namespace(&self, name: &str) {
        let mut namespace = Namespace::default();
        namespace.metadata.name = Some(name.to_string());
        self.lock().namespaces.insert(name.to_string(), namespace);
    }

    pub fn seed_secret(&self, namespace: &str, secret: Secret) {
        let name = object_name(&secret);
        self.lock().secrets.insert(key(namespace, &name), secret);
    }

    pub fn seed_deployment(&self, namespace: &str, deployment: Deployment) {
        let name = object_name(&deployment);
        self.lock()
            .deployments
            .insert(key(namespace, &name), deployment);
    }

    pub fn seed_pod(&self, namespace: &str, pod: Pod) {
        let name = object_name(&pod);
        self.lock().pods.insert(key(namespace, &name), pod);
    }

    pub fn seed_pod_logs(&self, namespace: &str, pod: &str, logs: &str) {
        self.lock()
            .pod_logs
            .insert(key(namespace, pod), logs.to_string());
    }
}

macro_rules! create_object {
    ($state:expr, $map:ident, $kind:expr, $namespace:expr, $object:expr) => {{
        let name = object_name($object);
        let mut stored = $object.clone();
        if $state.$map.contains_key(&key($namespace, &name)) {
            return Err(ClusterApiError::with_status(
                409,
                "AlreadyExists",
                format!("{} \"{}\" already exists", $kind, name),
            ));
        }
        stored.metadata.resource_version = Some($state.next_revision());
        $state.$map.insert(key($namespace, &name), stored.clone());
        Ok(stored)
    }};
}

macro_rules! replace_object {
    ($state:expr, $map:ident, $kind:expr, $namespace:expr, $name:expr, $object:expr) => {{
        if !$state.$map.contains_key(&key($namespace, $name)) {
            return Err(ClusterApiError::not_found($kind, $name));
        }
        let mut stored = $object.clone();
        stored.metadata.resource_version = Some($state.next_revision());
        $state.$map.insert(key($namespace, $name), stored.clone());
        Ok(stored)
    }};
}

#[async_trait]
impl CoreApi for FakeCluster {
    async fn list_namespaces(&self) -> ApiResult<Vec<String>> {
        let mut state = self.lock();
        state.record("list_namespaces", "*")?;
        Ok(state.namespaces.keys().cloned().collect())
    }

    async fn read_namespace(&self, name: &str) -> ApiResult<Namespace> {
        let mut state = self.lock();
        state.record("read_namespace", name)?;
        state
            .namespaces
            .get(name)
            .cloned()
            .ok_or_else(|| ClusterApiError::not_found("namespaces", name))
    }

    async fn create_namespace(&self, namespace: &Namespace) -> ApiResult<Namespace> {
        let mut state = self.lock();
        let name = object_name(namespace);
        state.record("create_namespace", &name)?;
        if state.namespaces.contains_key(&name) {
            return Err(ClusterApiError::with_status(
                409,
                "AlreadyExists",
                format!("namespaces \"{}\" already exists", name),
            ));
        }
        state.namespaces.insert(name, namespace.clone());
        Ok(namespace.clone())
    }

    async fn read_secret(&self, namespace: &str, name: &str) -> ApiResult<Secret> {
        let mut state = self.lock();
        state.record("read_secret", &format!("{}/{}", namespace, name))?;
        read(&state.secrets, "secrets", namespace, name)
    }

    async fn create_secret(&self, namespace: &str, secret: &Secret) -> ApiResult<Secret> {
        let mut state = self.lock();
        state.record(
            "create_secret",
            &format!("{}/{}", namespace, object_name(secret)),
        )?;
        create_object!(state, secrets, "secrets", namespace, secret)
    }

    async fn replace_secret(
        &self,
        namespace: &str,
        name: &str,
        secret: &Secret,
    ) -> ApiResult<Secret> {
        let mut state = self.lock();
        state.record("replace_secret", &format!("{}/{}", namespace, name))?;
        replace_object!(state, secrets, "secrets", namespace, name, secret)
    }

    async fn read_service(&self, namespace: &str, name: &str) -> ApiResult<K8sService> {
        let mut state = self.lock();
        state.record("read_service", &format!("{}/{}", namespace, name))?;
        read(&state.services, "services", namespace, name)
    }

    async fn create_service(
        &self,
        namespace: &str,
        service: &K8sService,
    ) -> ApiResult<K8sService> {
        let mut state = self.lock();
        state.record(
            "create_service",
            &format!("{}/{}", namespace, object_name(service)),
        )?;
        create_object!(state, services, "services", namespace, service)
    }

    async fn replace_service(
        &self,
        namespace: &str,
        name: &str,
        service: &K8sService,
    ) -> ApiResult<K8sService> {
        let mut state = self.lock();
        state.record("replace_service", &format!("{}/{}", namespace, name))?;
        replace_object!(state, services, "services", namespace, name, service)
    }

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> ApiResult<Vec<Pod>> {
        let mut state = self.lock();
        state.record("list_pods", &format!("{}/{}", namespace, label_selector))?;
        let (label, value) = label_selector.split_once('=').unwrap_or((label_selector, ""));
        Ok(state
            .pods
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, pod)| pod)
            .filter(|pod| {
                pod.metadata
                    .labels
                    .as_ref()
                    .and_then(|l| l.get(label))
                    .is_some_and(|v| v == value)
            })
            .cloned()
            .collect())
    }

    async fn pod_logs(
        &self,
        namespace: &str,
        pod: &str,
        _options: &LogOptions,
    ) -> ApiResult<String> {
        let mut state = self.lock();
        state.record("pod_logs", &format!("{}/{}", namespace, pod))?;
        if !state.pods.contains_key(&key(namespace, pod)) {
            return Err(ClusterApiError::not_found("pods", pod));
        }
        Ok(state
            .pod_logs
            .get(&key(namespace, pod))
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl WorkloadApi for FakeCluster {
    async fn read_deployment(&self, namespace: &str, name: &str) -> ApiResult<Deployment> {
        let mut state = self.lock();
        state.record("read_deployment", &format!("{}/{}", namespace, name))?;
        read(&state.deployments, "deployments.apps", namespace, name)
    }

    async fn create_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> ApiResult<Deployment> {
        let mut state = self.lock();
        state.record(
            "create_deployment",
            &format!("{}/{}", namespace, object_name(deployment)),
        )?;
        create_object!(state, deployments, "deployments.apps", namespace, deployment)
    }

    async fn replace_deployment(
        &self,
        namespace: &str,
        name: &str,
        deployment: &Deployment,
    ) -> ApiResult<Deployment> {
        let mut state = self.lock();
        state.record("replace_deployment", &format!("{}/{}", namespace, name))?;
        replace_object!(
            state,
            deployments,
            "deployments.apps",
            namespace,
            name,
            deployment
        )
    }
}

#[async_trait]
impl NetworkApi for FakeCluster {
    async fn read_ingress(&self, namespace: &str, name: &str) -> ApiResult<Ingress> {
        let mut state = self.lock();
        state.record("read_ingress", &format!("{}/{}", namespace, name))?;
        read(&state.ingresses, "ingresses.networking.k8s.io", namespace, name)
    }

    async fn create_ingress(&self, namespace: &str, ingress: &Ingress) -> ApiResult<Ingress> {
        let mut state = self.lock();
        state.record(
            "create_ingress",
            &format!("{}/{}", namespace, object_name(ingress)),
        )?;
        create_object!(
            state,
            ingresses,
            "ingresses.networking.k8s.io",
            namespace,
            ingress
        )
    }

    async fn replace_ingress(
        &self,
        namespace: &str,
        name: &str,
        ingress: &Ingress,
    ) -> ApiResult<Ingress> {
        let mut state = self.lock();
        state.record("replace_ingress", &format!("{}/{}", namespace, name))?;
        replace_object!(
            state,
            ingresses,
            "ingresses.networking.k8s.io",
            namespace,
            name,
            ingress
        )
    }

    async fn delete_ingress(&self, namespace: &str, name: &str) -> ApiResult<()> {
        let mut state = self.lock();
        state.record("delete_ingress", &format!("{}/{}", namespace, name))?;
        state
            .ingresses
            .remove(&key(namespace, name))
            .map(|_| ())
            .ok_or_else(|| ClusterApiError::not_found("ingresses.networking.k8s.io", name))
    }
}

/// Connector that always hands out the same fake cluster
pub struct FakeConnector {
    cluster: FakeCluster,
    connects: Mutex<Vec<String>>,
}

impl FakeConnector {
    pub fn new(cluster: FakeCluster) -> Self {
        Self {
            cluster,
            connects: Mutex::new(Vec::new()),
        }
    }

    /// Kubeconfigs passed to `connect`, in order
    pub fn connects(&self) -> Vec<String> {
        self.connects.lock().unwrap().clone()
    }
}

#[async_trait]
impl ClusterConnector for FakeConnector {
    async fn connect(&self, kubeconfig: &str) -> Result<ClusterHandles> {
        self.connects.lock().unwrap().push(kubeconfig.to_string());
        Ok(self.cluster.handles())
    }
}
