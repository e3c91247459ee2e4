//! Cluster control-plane access
//!
//! The reconciler talks to a cluster through three capability handles:
//! [`CoreApi`] (namespaces, secrets, services, pods), [`WorkloadApi`]
//! (deployments) and [`NetworkApi`] (ingresses). All reads report a missing
//! object as a 404 [`ClusterApiError`], which is the only condition callers
//! branch on.

pub mod factory;
pub mod kubernetes;
pub mod status;

#[cfg(test)]
pub(crate) mod fake;

pub use factory::ClusterClientFactory;
pub use kubernetes::KubeConnector;
pub use status::{LogOptions, PodInfo, ServiceStatus};

use crate::error::Result;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Namespace, Pod, Secret, Service as K8sService};
use k8s_openapi::api::networking::v1::Ingress;
use std::fmt;
use std::sync::Arc;

/// Result type for control-plane calls
pub type ApiResult<T> = std::result::Result<T, ClusterApiError>;

/// Error returned by the cluster control plane
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterApiError {
    /// HTTP status, when the API answered
    pub status: Option<u16>,
    /// Machine-readable reason
    pub reason: Option<String>,
    /// Message
    pub message: String,
}

impl ClusterApiError {
    /// Error without an HTTP status (transport, TLS, decoding)
    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            status: None,
            reason: None,
            message: message.into(),
        }
    }

    /// Error with an HTTP status
    pub fn with_status(status: u16, reason: &str, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            reason: Some(reason.to_string()),
            message: message.into(),
        }
    }

    /// 404 for a named object
    pub fn not_found(kind: &str, name: &str) -> Self {
        Self::with_status(404, "NotFound", format!("{} \"{}\" not found", kind, name))
    }

    /// Check if the object does not exist
    pub fn is_not_found(&self) -> bool {
        self.status == Some(404)
    }
}

impl fmt::Display for ClusterApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "{} (HTTP {})", self.message, status),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for ClusterApiError {}

/// Namespaces, secrets, network services and pods
#[async_trait]
pub trait CoreApi: Send + Sync {
    /// Names of all namespaces
    async fn list_namespaces(&self) -> ApiResult<Vec<String>>;

    async fn read_namespace(&self, name: &str) -> ApiResult<Namespace>;

    async fn create_namespace(&self, namespace: &Namespace) -> ApiResult<Namespace>;

    async fn read_secret(&self, namespace: &str, name: &str) -> ApiResult<Secret>;

    async fn create_secret(&self, namespace: &str, secret: &Secret) -> ApiResult<Secret>;

    async fn replace_secret(&self, namespace: &str, name: &str, secret: &Secret)
        -> ApiResult<Secret>;

    async fn read_service(&self, namespace: &str, name: &str) -> ApiResult<K8sService>;

    async fn create_service(&self, namespace: &str, service: &K8sService)
        -> ApiResult<K8sService>;

    async fn replace_service(
        &self,
        namespace: &str,
        name: &str,
        service: &K8sService,
    ) -> ApiResult<K8sService>;

    /// Pods matching a label selector such as `app=web`
    async fn list_pods(&self, namespace: &str, label_selector: &str) -> ApiResult<Vec<Pod>>;

    /// Log output of a pod
    async fn pod_logs(&self, namespace: &str, pod: &str, options: &LogOptions)
        -> ApiResult<String>;
}

/// Replicated workloads
#[async_trait]
pub trait WorkloadApi: Send + Sync {
    async fn read_deployment(&self, namespace: &str, name: &str) -> ApiResult<Deployment>;

    async fn create_deployment(&self, namespace: &str, deployment: &Deployment)
        -> ApiResult<Deployment>;

    async fn replace_deployment(
        &self,
        namespace: &str,
        name: &str,
        deployment: &Deployment,
    ) -> ApiResult<Deployment>;
}

/// External routes
#[async_trait]
pub trait NetworkApi: Send + Sync {
    async fn read_ingress(&self, namespace: &str, name: &str) -> ApiResult<Ingress>;

    async fn create_ingress(&self, namespace: &str, ingress: &Ingress) -> ApiResult<Ingress>;

    async fn replace_ingress(&self, namespace: &str, name: &str, ingress: &Ingress)
        -> ApiResult<Ingress>;

    async fn delete_ingress(&self, namespace: &str, name: &str) -> ApiResult<()>;
}

/// Capability handles for one cluster
#[derive(Clone)]
pub struct ClusterHandles {
    pub core: Arc<dyn CoreApi>,
    pub workloads: Arc<dyn WorkloadApi>,
    pub network: Arc<dyn NetworkApi>,
}

/// Turns a decrypted kubeconfig into capability handles
#[async_trait]
pub trait ClusterConnector: Send + Sync {
    async fn connect(&self, kubeconfig: &str) -> Result<ClusterHandles>;
}
