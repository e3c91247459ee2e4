//! Desired cluster objects for a declared service
//!
//! Builders take already-sanitized names. Every object carries only the
//! fields the worker manages, so a replace converges the live object onto
//! the declared configuration.

use crate::error::Result;
use crate::store::{ProbeConfig, Service};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use k8s_openapi::api::apps::v1::{
    Deployment, DeploymentSpec, DeploymentStrategy, RollingUpdateDeployment,
};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, HTTPGetAction, LocalObjectReference, Namespace, PodSpec,
    PodTemplateSpec, Probe, ResourceRequirements, Secret, Service as K8sService, ServicePort,
    ServiceSpec,
};
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::ByteString;
use std::collections::BTreeMap;

/// Label tying pods to their deployment and service
pub const APP_LABEL: &str = "app";

/// Secret type for registry pull credentials
pub const DOCKER_CONFIG_JSON_TYPE: &str = "kubernetes.io/dockerconfigjson";

/// Data key holding the registry auth document
pub const DOCKER_CONFIG_JSON_KEY: &str = ".dockerconfigjson";

/// Probe timings used where a field is not configured
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeDefaults {
    pub initial_delay_seconds: i32,
    pub period_seconds: i32,
    pub timeout_seconds: i32,
    pub success_threshold: i32,
    pub failure_threshold: i32,
}

pub const LIVENESS_DEFAULTS: ProbeDefaults = ProbeDefaults {
    initial_delay_seconds: 30,
    period_seconds: 10,
    timeout_seconds: 5,
    success_threshold: 1,
    failure_threshold: 3,
};

pub const READINESS_DEFAULTS: ProbeDefaults = ProbeDefaults {
    initial_delay_seconds: 5,
    period_seconds: 10,
    timeout_seconds: 5,
    success_threshold: 1,
    failure_threshold: 3,
};

fn app_labels(name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(APP_LABEL.to_string(), name.to_string())])
}

fn metadata(name: &str, namespace: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        ..ObjectMeta::default()
    }
}

/// Namespace object
pub fn namespace(name: &str) -> Namespace {
    Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..ObjectMeta::default()
        },
        ..Namespace::default()
    }
}

/// Registry pull secret in `.dockerconfigjson` form
pub fn registry_secret(
    name: &str,
    namespace: &str,
    server: &str,
    username: &str,
    password: &str,
) -> Result<Secret> {
    let auth = BASE64.encode(format!("{}:{}", username, password));
    let document = serde_json::json!({
        "auths": {
            server: {
                "username": username,
                "password": password,
                "auth": auth,
            }
        }
    });

    Ok(Secret {
        metadata: metadata(name, namespace),
        type_: Some(DOCKER_CONFIG_JSON_TYPE.to_string()),
        data: Some(BTreeMap::from([(
            DOCKER_CONFIG_JSON_KEY.to_string(),
            ByteString(serde_json::to_vec(&document)?),
        )])),
        ..Secret::default()
    })
}

/// HTTP GET probe against the container port
pub fn probe(config: &ProbeConfig, port: i32, defaults: ProbeDefaults) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some(config.path.clone()),
            port: IntOrString::Int(port),
            ..HTTPGetAction::default()
        }),
        initial_delay_seconds: Some(
            config
                .initial_delay_seconds
                .unwrap_or(defaults.initial_delay_seconds),
        ),
        period_seconds: Some(config.period_seconds.unwrap_or(defaults.period_seconds)),
        timeout_seconds: Some(config.timeout_seconds.unwrap_or(defaults.timeout_seconds)),
        success_threshold: Some(
            config
                .success_threshold
                .unwrap_or(defaults.success_threshold),
        ),
        failure_threshold: Some(
            config
                .failure_threshold
                .unwrap_or(defaults.failure_threshold),
        ),
        ..Probe::default()
    }
}

/// Parse a rolling-update bound: `"2"` is a count, `"25%"` a percentage
pub fn int_or_string(value: &str) -> IntOrString {
    let value = value.trim();
    match value.parse::<i32>() {
        Ok(n) => IntOrString::Int(n),
        Err(_) => IntOrString::String(value.to_string()),
    }
}

pub(crate) fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Rolling-update strategy, present only when a bound is configured
pub fn strategy(service: &Service) -> Option<DeploymentStrategy> {
    let max_surge = non_empty(&service.max_surge);
    let max_unavailable = non_empty(&service.max_unavailable);
    if max_surge.is_none() && max_unavailable.is_none() {
        return None;
    }

    Some(DeploymentStrategy {
        type_: Some("RollingUpdate".to_string()),
        rolling_update: Some(RollingUpdateDeployment {
            max_surge: max_surge.map(int_or_string),
            max_unavailable: max_unavailable.map(int_or_string),
        }),
    })
}

/// Requests and limits; CPU in millicores, memory in MiB
pub fn resources(service: &Service) -> Option<ResourceRequirements> {
    fn quantities(cpu: Option<i32>, memory: Option<i32>) -> Option<BTreeMap<String, Quantity>> {
        let mut map = BTreeMap::new();
        if let Some(cpu) = cpu.filter(|v| *v > 0) {
            map.insert("cpu".to_string(), Quantity(format!("{}m", cpu)));
        }
        if let Some(memory) = memory.filter(|v| *v > 0) {
            map.insert("memory".to_string(), Quantity(format!("{}Mi", memory)));
        }
        (!map.is_empty()).then_some(map)
    }

    let requests = quantities(service.cpu_request, service.memory_request);
    let limits = quantities(service.cpu_limit, service.memory_limit);
    if requests.is_none() && limits.is_none() {
        return None;
    }

    Some(ResourceRequirements {
        requests,
        limits,
        ..ResourceRequirements::default()
    })
}

fn probe_on_path(config: &Option<ProbeConfig>) -> Option<&ProbeConfig> {
    config.as_ref().filter(|p| !p.path.trim().is_empty())
}

/// Deployment running `image` for a service
pub fn deployment(
    name: &str,
    namespace: &str,
    image: &str,
    service: &Service,
    pull_secrets: &[String],
    env: Vec<EnvVar>,
) -> Deployment {
    let port = service.container_port;
    let container = Container {
        name: name.to_string(),
        image: Some(image.to_string()),
        ports: Some(vec![ContainerPort {
            container_port: port,
            protocol: Some("TCP".to_string()),
            ..ContainerPort::default()
        }]),
        env: (!env.is_empty()).then_some(env),
        resources: resources(service),
        liveness_probe: probe_on_path(&service.liveness_probe)
            .map(|p| probe(p, port, LIVENESS_DEFAULTS)),
        readiness_probe: probe_on_path(&service.readiness_probe)
            .map(|p| probe(p, port, READINESS_DEFAULTS)),
        ..Container::default()
    };

    let image_pull_secrets = (!pull_secrets.is_empty()).then(|| {
        pull_secrets
            .iter()
            .map(|name| LocalObjectReference { name: name.clone() })
            .collect()
    });

    Deployment {
        metadata: metadata(name, namespace),
        spec: Some(DeploymentSpec {
            replicas: Some(service.replicas),
            strategy: strategy(service),
            selector: LabelSelector {
                match_labels: Some(app_labels(name)),
                ..LabelSelector::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(app_labels(name)),
                    ..ObjectMeta::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    image_pull_secrets,
                    ..PodSpec::default()
                }),
            },
            ..DeploymentSpec::default()
        }),
        ..Deployment::default()
    }
}

/// ClusterIP service routing `port` to the deployment's pods
pub fn network_service(name: &str, namespace: &str, port: i32) -> K8sService {
    K8sService {
        metadata: metadata(name, namespace),
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: Some(app_labels(name)),
            ports: Some(vec![ServicePort {
                port,
                target_port: Some(IntOrString::Int(port)),
                protocol: Some("TCP".to_string()),
                ..ServicePort::default()
            }]),
            ..ServiceSpec::default()
        }),
        ..K8sService::default()
    }
}

/// Single-host ingress sending every path to a service port
pub fn ingress(name: &str, namespace: &str, host: &str, service_name: &str, port: i32) -> Ingress {
    Ingress {
        metadata: metadata(name, namespace),
        spec: Some(IngressSpec {
            rules: Some(vec![IngressRule {
                host: Some(host.to_string()),
                http: Some(HTTPIngressRuleValue {
                    paths: vec![HTTPIngressPath {
                        path: Some("/".to_string()),
                        path_type: "Prefix".to_string(),
                        backend: IngressBackend {
                            service: Some(IngressServiceBackend {
                                name: service_name.to_string(),
                                port: Some(ServiceBackendPort {
                                    number: Some(port),
                                    name: None,
                                }),
                            }),
                            resource: None,
                        },
                    }],
                }),
            }]),
            ..IngressSpec::default()
        }),
        ..Ingress::default()
    }
}
