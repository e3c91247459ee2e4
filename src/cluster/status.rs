//! Read-only views of a deployed service

use super::ClusterHandles;
use crate::error::{DeckhandError, Result};
use crate::naming::{k8s_name, sanitize, DEFAULT_MAX_LEN};
use crate::store::ServiceBundle;
use chrono::{DateTime, Duration, Utc};
use k8s_openapi::api::core::v1::Pod;
use serde::{Deserialize, Serialize};

/// Options for reading pod logs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogOptions {
    /// Container to read, when the pod has several
    pub container: Option<String>,
    /// Only return the last N lines
    pub tail_lines: Option<i64>,
    /// Read the previous container instance
    pub previous: bool,
}

/// Observed state of one pod
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodInfo {
    pub name: String,
    pub namespace: String,
    /// Summarized status, see [`pod_status`]
    pub status: String,
    pub phase: String,
    /// All containers report ready
    pub ready: bool,
    /// Restarts summed over containers
    pub restarts: i32,
    pub age: String,
    pub node_name: Option<String>,
    pub image: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

/// Observed state of a deployed service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    pub service_name: String,
    pub namespace: String,
    pub deployment_name: String,
    pub desired_replicas: i32,
    pub ready_replicas: i32,
    pub available_replicas: i32,
    pub pods: Vec<PodInfo>,
}

/// Read the deployment and pods of a service
///
/// A service that was never deployed reports its declared replica count and
/// no pods.
pub async fn service_status(
    bundle: &ServiceBundle,
    handles: &ClusterHandles,
) -> Result<ServiceStatus> {
    let namespace = sanitize(&bundle.application.namespace, DEFAULT_MAX_LEN);
    let deployment_name = k8s_name(&bundle.service.name);

    let mut status = ServiceStatus {
        service_name: bundle.service.name.clone(),
        namespace: namespace.clone(),
        deployment_name: deployment_name.clone(),
        desired_replicas: bundle.service.replicas,
        ready_replicas: 0,
        available_replicas: 0,
        pods: Vec::new(),
    };

    let deployment = match handles
        .workloads
        .read_deployment(&namespace, &deployment_name)
        .await
    {
        Ok(deployment) => deployment,
        Err(e) if e.is_not_found() => return Ok(status),
        Err(e) => return Err(e.into()),
    };

    status.desired_replicas = deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(0);
    if let Some(observed) = &deployment.status {
        status.ready_replicas = observed.ready_replicas.unwrap_or(0);
        status.available_replicas = observed.available_replicas.unwrap_or(0);
    }

    let selector = format!("app={}", deployment_name);
    let now = Utc::now();
    status.pods = handles
        .core
        .list_pods(&namespace, &selector)
        .await?
        .iter()
        .map(|pod| pod_info(pod, &namespace, now))
        .collect();

    Ok(status)
}

/// Read the logs of a pod in the service's namespace
pub async fn pod_logs(
    handles: &ClusterHandles,
    namespace: &str,
    pod: &str,
    options: &LogOptions,
) -> Result<String> {
    let pod = pod.trim();
    if pod.is_empty() {
        return Err(DeckhandError::InvalidInput(
            "Pod name is required and must be a non-empty string".to_string(),
        ));
    }

    handles
        .core
        .pod_logs(namespace, pod, options)
        .await
        .map_err(|e| {
            if e.is_not_found() {
                DeckhandError::PodNotFound {
                    pod: pod.to_string(),
                    namespace: namespace.to_string(),
                }
            } else {
                e.into()
            }
        })
}

fn pod_info(pod: &Pod, namespace: &str, now: DateTime<Utc>) -> PodInfo {
    let statuses = pod
        .status
        .as_ref()
        .and_then(|s| s.container_statuses.as_deref())
        .unwrap_or_default();
    let created_at = pod.metadata.creation_timestamp.as_ref().map(|t| t.0);

    PodInfo {
        name: pod
            .metadata
            .name
            .clone()
            .unwrap_or_else(|| "Unknown".to_string()),
        namespace: pod
            .metadata
            .namespace
            .clone()
            .unwrap_or_else(|| namespace.to_string()),
        status: pod_status(pod),
        phase: pod
            .status
            .as_ref()
            .and_then(|s| s.phase.clone())
            .unwrap_or_else(|| "Unknown".to_string()),
        ready: !statuses.is_empty() && statuses.iter().all(|cs| cs.ready),
        restarts: statuses.iter().map(|cs| cs.restart_count).sum(),
        age: created_at
            .map(|t| format_age(now - t))
            .unwrap_or_else(|| "Unknown".to_string()),
        node_name: pod.spec.as_ref().and_then(|s| s.node_name.clone()),
        image: pod
            .spec
            .as_ref()
            .and_then(|s| s.containers.first())
            .and_then(|c| c.image.clone()),
        created_at,
    }
}

/// Summarize a pod the way `kubectl get pods` does
pub fn pod_status(pod: &Pod) -> String {
    let Some(status) = &pod.status else {
        return "Unknown".to_string();
    };

    let ready = status
        .conditions
        .iter()
        .flatten()
        .any(|c| c.type_ == "Ready" && c.status == "True");
    if ready {
        return "Running".to_string();
    }

    if let Some(phase @ ("Pending" | "Failed" | "Succeeded")) = status.phase.as_deref() {
        return phase.to_string();
    }

    let containers = status.container_statuses.as_deref().unwrap_or_default();
    if let Some(waiting) = containers
        .iter()
        .find_map(|cs| cs.state.as_ref().and_then(|s| s.waiting.as_ref()))
    {
        return waiting.reason.clone().unwrap_or_else(|| "Waiting".to_string());
    }
    if let Some(terminated) = containers
        .iter()
        .find_map(|cs| cs.state.as_ref().and_then(|s| s.terminated.as_ref()))
    {
        return terminated
            .reason
            .clone()
            .unwrap_or_else(|| "Terminated".to_string());
    }

    status.phase.clone().unwrap_or_else(|| "Unknown".to_string())
}

/// Format an age in its largest whole unit
pub fn format_age(age: Duration) -> String {
    let secs = age.num_seconds().max(0);
    let (mins, hours, days) = (secs / 60, secs / 3600, secs / 86400);

    if days > 0 {
        format!("{}d", days)
    } else if hours > 0 {
        format!("{}h", hours)
    } else if mins > 0 {
        format!("{}m", mins)
    } else {
        format!("{}s", secs)
    }
}
