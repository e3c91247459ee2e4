//! Kubernetes backend for the cluster capability traits

use super::{
    ApiResult, ClusterApiError, ClusterConnector, ClusterHandles, CoreApi, LogOptions, NetworkApi,
    WorkloadApi,
};
use crate::error::{DeckhandError, Result};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Namespace, Pod, Secret, Service as K8sService};
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::{Api, DeleteParams, ListParams, LogParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config, ResourceExt};
use std::sync::Arc;
use tracing::debug;

impl From<kube::Error> for ClusterApiError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(response) => ClusterApiError {
                status: Some(response.code),
                reason: Some(response.reason),
                message: response.message,
            },
            other => ClusterApiError::transport(other.to_string()),
        }
    }
}

/// Connects to clusters described by kubeconfig YAML
#[derive(Debug, Clone, Default)]
pub struct KubeConnector;

impl KubeConnector {
    /// Create a new connector
    pub fn new() -> Self {
        Self
    }

    /// Build a client from kubeconfig YAML
    pub async fn client(kubeconfig: &str) -> Result<Client> {
        let parsed = Kubeconfig::from_yaml(kubeconfig)
            .map_err(|e| DeckhandError::Kubeconfig(e.to_string()))?;
        let config = Config::from_custom_kubeconfig(parsed, &KubeConfigOptions::default())
            .await
            .map_err(|e| DeckhandError::Kubeconfig(e.to_string()))?;
        debug!("Kubernetes API server: {}", config.cluster_url);

        Client::try_from(config).map_err(|e| DeckhandError::Kubeconfig(e.to_string()))
    }
}

#[async_trait]
impl ClusterConnector for KubeConnector {
    async fn connect(&self, kubeconfig: &str) -> Result<ClusterHandles> {
        let client = Self::client(kubeconfig).await?;
        Ok(ClusterHandles {
            core: Arc::new(KubeCore::new(client.clone())),
            workloads: Arc::new(KubeWorkloads::new(client.clone())),
            network: Arc::new(KubeNetwork::new(client)),
        })
    }
}

/// Core API group
#[derive(Clone)]
pub struct KubeCore {
    client: Client,
}

impl KubeCore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn secrets(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn services(&self, namespace: &str) -> Api<K8sService> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl CoreApi for KubeCore {
    async fn list_namespaces(&self) -> ApiResult<Vec<String>> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let list = api.list(&ListParams::default()).await?;
        Ok(list.items.iter().map(|ns| ns.name_any()).collect())
    }

    async fn read_namespace(&self, name: &str) -> ApiResult<Namespace> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        Ok(api.get(name).await?)
    }

    async fn create_namespace(&self, namespace: &Namespace) -> ApiResult<Namespace> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        Ok(api.create(&PostParams::default(), namespace).await?)
    }

    async fn read_secret(&self, namespace: &str, name: &str) -> ApiResult<Secret> {
        Ok(self.secrets(namespace).get(name).await?)
    }

    async fn create_secret(&self, namespace: &str, secret: &Secret) -> ApiResult<Secret> {
        Ok(self
            .secrets(namespace)
            .create(&PostParams::default(), secret)
            .await?)
    }

    async fn replace_secret(
        &self,
        namespace: &str,
        name: &str,
        secret: &Secret,
    ) -> ApiResult<Secret> {
        Ok(self
            .secrets(namespace)
            .replace(name, &PostParams::default(), secret)
            .await?)
    }

    async fn read_service(&self, namespace: &str, name: &str) -> ApiResult<K8sService> {
        Ok(self.services(namespace).get(name).await?)
    }

    async fn create_service(
        &self,
        namespace: &str,
        service: &K8sService,
    ) -> ApiResult<K8sService> {
        Ok(self
            .services(namespace)
            .create(&PostParams::default(), service)
            .await?)
    }

    async fn replace_service(
        &self,
        namespace: &str,
        name: &str,
        service: &K8sService,
    ) -> ApiResult<K8sService> {
        Ok(self
            .services(namespace)
            .replace(name, &PostParams::default(), service)
            .await?)
    }

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> ApiResult<Vec<Pod>> {
        let params = ListParams::default().labels(label_selector);
        Ok(self.pods(namespace).list(&params).await?.items)
    }

    async fn pod_logs(
        &self,
        namespace: &str,
        pod: &str,
        options: &LogOptions,
    ) -> ApiResult<String> {
        let params = LogParams {
            container: options.container.clone(),
            tail_lines: options.tail_lines,
            previous: options.previous,
            ..LogParams::default()
        };
        Ok(self.pods(namespace).logs(pod, &params).await?)
    }
}

/// Apps API group
#[derive(Clone)]
pub struct KubeWorkloads {
    client: Client,
}

impl KubeWorkloads {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn deployments(&self, namespace: &str) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl WorkloadApi for KubeWorkloads {
    async fn read_deployment(&self, namespace: &str, name: &str) -> ApiResult<Deployment> {
        Ok(self.deployments(namespace).get(name).await?)
    }

    async fn create_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> ApiResult<Deployment> {
        Ok(self
            .deployments(namespace)
            .create(&PostParams::default(), deployment)
            .await?)
    }

    async fn replace_deployment(
        &self,
        namespace: &str,
        name: &str,
        deployment: &Deployment,
    ) -> ApiResult<Deployment> {
        Ok(self
            .deployments(namespace)
            .replace(name, &PostParams::default(), deployment)
            .await?)
    }
}

/// Networking API group
#[derive(Clone)]
pub struct KubeNetwork {
    client: Client,
}

impl KubeNetwork {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn ingresses(&self, namespace: &str) -> Api<Ingress> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl NetworkApi for KubeNetwork {
    async fn read_ingress(&self, namespace: &str, name: &str) -> ApiResult<Ingress> {
        Ok(self.ingresses(namespace).get(name).await?)
    }

    async fn create_ingress(&self, namespace: &str, ingress: &Ingress) -> ApiResult<Ingress> {
        Ok(self
            .ingresses(namespace)
            .create(&PostParams::default(), ingress)
            .await?)
    }

    async fn replace_ingress(
        &self,
        namespace: &str,
        name: &str,
        ingress: &Ingress,
    ) -> ApiResult<Ingress> {
        Ok(self
            .ingresses(namespace)
            .replace(name, &PostParams::default(), ingress)
            .await?)
    }

    async fn delete_ingress(&self, namespace: &str, name: &str) -> ApiResult<()> {
        self.ingresses(namespace)
            .delete(name, &DeleteParams::default())
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    #[test]
    fn test_api_error_keeps_status() {
        let err = kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "deployments.apps \"web\" not found".to_string(),
            reason: "NotFound".to_string(),
            code: 404,
        });

        let converted = ClusterApiError::from(err);
        assert!(converted.is_not_found());
        assert_eq!(converted.reason.as_deref(), Some("NotFound"));
    }

    #[tokio::test]
    async fn test_connect_rejects_malformed_kubeconfig() {
        let err = KubeConnector::new()
            .connect("clusters: [not: valid")
            .await
            .err()
            .unwrap();
        assert!(matches!(err, DeckhandError::Kubeconfig(_)));
    }
}
