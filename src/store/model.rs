//! Declared configuration records
//!
//! These mirror the rows the management front end writes. Secret-bearing
//! fields (`kubeconfig`, `password`, `value`) always hold cipher frames.

use serde::{Deserialize, Serialize};

/// Target Kubernetes cluster
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cluster {
    /// Cluster ID
    pub id: String,
    /// Display name
    pub name: String,
    /// Encrypted kubeconfig
    pub kubeconfig: String,
}

/// Application grouping services into one namespace
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Application {
    /// Application ID
    pub id: String,
    /// Globally unique name
    pub name: String,
    /// Target namespace (display form, sanitized at use)
    pub namespace: String,
    /// Owning cluster
    pub cluster_id: Option<String>,
}

/// HTTP probe configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// HTTP path to probe
    pub path: String,
    pub initial_delay_seconds: Option<i32>,
    pub period_seconds: Option<i32>,
    pub timeout_seconds: Option<i32>,
    pub success_threshold: Option<i32>,
    pub failure_threshold: Option<i32>,
}

impl ProbeConfig {
    /// Create a probe on a path with default timings
    pub fn on_path(path: &str) -> Self {
        Self {
            path: path.to_string(),
            ..Self::default()
        }
    }
}

/// Declared service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Service {
    /// Service ID
    pub id: String,
    /// Owning application
    pub application_id: String,
    /// Name, unique within the application
    pub name: String,
    /// Desired replica count
    pub replicas: i32,
    /// Container port
    pub container_port: i32,
    /// CPU request in millicores
    pub cpu_request: Option<i32>,
    /// CPU limit in millicores
    pub cpu_limit: Option<i32>,
    /// Memory request in MiB
    pub memory_request: Option<i32>,
    /// Memory limit in MiB
    pub memory_limit: Option<i32>,
    /// Liveness probe
    pub liveness_probe: Option<ProbeConfig>,
    /// Readiness probe
    pub readiness_probe: Option<ProbeConfig>,
    /// Public URL routed through an ingress
    pub ingress_url: Option<String>,
    /// Rolling update surge (count or percentage)
    pub max_surge: Option<String>,
    /// Rolling update unavailability (count or percentage)
    pub max_unavailable: Option<String>,
}

impl Service {
    /// Create a service with one replica and no optional settings
    pub fn new(id: &str, application_id: &str, name: &str, container_port: i32) -> Self {
        Self {
            id: id.to_string(),
            application_id: application_id.to_string(),
            name: name.to_string(),
            replicas: 1,
            container_port,
            cpu_request: None,
            cpu_limit: None,
            memory_request: None,
            memory_limit: None,
            liveness_probe: None,
            readiness_probe: None,
            ingress_url: None,
            max_surge: None,
            max_unavailable: None,
        }
    }
}

/// Private registry credentials
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryCredential {
    /// Credential ID
    pub id: String,
    /// Name, used for the pull secret
    pub name: String,
    /// Registry host
    pub server: String,
    /// Username
    pub username: String,
    /// Encrypted password
    pub password: String,
}

/// Environment variable binding
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvBinding {
    /// Binding ID
    pub id: String,
    /// Variable name
    pub key: String,
    /// Encrypted value
    pub value: String,
}

/// A service with everything needed to reconcile it
#[derive(Debug, Clone)]
pub struct ServiceBundle {
    pub service: Service,
    pub application: Application,
    pub cluster: Option<Cluster>,
    pub registry_credentials: Vec<RegistryCredential>,
    pub env_bindings: Vec<EnvBinding>,
}
