//! Declarative cluster resources for a deployed artifact
//!
//! [`ResourceCompiler`] turns a tag, a built image and a memory estimate into
//! the four per-artifact resources:
//! - Deployment: one container, fixed probe and CPU request, sized memory
//! - Service: ClusterIP, port 80 → container port
//! - HorizontalPodAutoscaler: 2..5 replicas on CPU
//! - Ingress: `<tag>.<domain>` → the Service
//!
//! [`build_secret`] builds the shared environment Secret used by the upsert path.
//! Everything here is pure; nothing talks to the cluster.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::autoscaling::v1::{
    CrossVersionObjectReference, HorizontalPodAutoscaler, HorizontalPodAutoscalerSpec,
};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, EnvVarSource, HTTPGetAction, PodSpec, PodTemplateSpec,
    Probe, ResourceRequirements, Secret, SecretKeySelector, Service, ServicePort, ServiceSpec,
};
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::ByteString;

use crate::image::ImageReference;
use crate::sizing::MemoryEstimate;
use crate::{
    APP_LABEL, AUTOSCALER_MAX_REPLICAS, AUTOSCALER_MIN_REPLICAS, AUTOSCALER_TARGET_CPU,
    CONTAINER_PORT, CPU_REQUEST, HEALTH_PATH, INITIAL_REPLICAS, NO_SECRETS_ENV, SERVICE_PORT,
};

// =============================================================================
// Liveness probe policy
// =============================================================================

const PROBE_FAILURE_THRESHOLD: i32 = 3;
const PROBE_PERIOD_SECONDS: i32 = 3;
const PROBE_INITIAL_DELAY_SECONDS: i32 = 7;
const PROBE_TIMEOUT_SECONDS: i32 = 2;

/// Reference to an existing Secret whose keys become container env vars
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SecretRef {
    /// Secret name
    pub name: String,
    /// Keys present in the Secret, in key order
    pub keys: Vec<String>,
}

impl SecretRef {
    /// Build a reference from a Secret read back from the cluster
    pub fn from_secret(name: impl Into<String>, secret: &Secret) -> Self {
        let keys = secret
            .data
            .as_ref()
            .map(|data| data.keys().cloned().collect())
            .unwrap_or_default();
        Self {
            name: name.into(),
            keys,
        }
    }
}

/// The four resources reconciled for one tag
#[derive(Clone, Debug, PartialEq)]
pub struct CompiledResources {
    /// ClusterIP service
    pub service: Service,
    /// Single-container deployment
    pub deployment: Deployment,
    /// CPU autoscaler targeting the deployment
    pub autoscaler: HorizontalPodAutoscaler,
    /// Host rule for `<tag>.<domain>`
    pub ingress: Ingress,
}

/// Compiles per-artifact resources within a fixed namespace and domain
#[derive(Clone, Debug)]
pub struct ResourceCompiler {
    namespace: String,
    domain: String,
}

impl ResourceCompiler {
    /// Create a compiler for the given namespace and ingress domain
    pub fn new(namespace: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            domain: domain.into(),
        }
    }

    /// Externally reachable name for a tag
    pub fn fqdn(&self, tag: &str) -> String {
        format!("{}.{}", tag, self.domain)
    }

    /// Compile every resource for a tag
    pub fn compile(
        &self,
        tag: &str,
        image: &ImageReference,
        memory: &MemoryEstimate,
        secret: Option<&SecretRef>,
    ) -> CompiledResources {
        CompiledResources {
            service: self.compile_service(tag),
            deployment: self.compile_deployment(tag, image, memory, secret),
            autoscaler: self.compile_autoscaler(tag),
            ingress: self.compile_ingress(tag),
        }
    }

    fn metadata(&self, name: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(self.namespace.clone()),
            ..Default::default()
        }
    }

    fn compile_service(&self, tag: &str) -> Service {
        Service {
            metadata: self.metadata(tag),
            spec: Some(ServiceSpec {
                type_: Some("ClusterIP".to_string()),
                selector: Some(app_selector(tag)),
                ports: Some(vec![ServicePort {
                    protocol: Some("TCP".to_string()),
                    port: SERVICE_PORT,
                    target_port: Some(IntOrString::Int(CONTAINER_PORT)),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn compile_deployment(
        &self,
        tag: &str,
        image: &ImageReference,
        memory: &MemoryEstimate,
        secret: Option<&SecretRef>,
    ) -> Deployment {
        // Request and limit are the same value: no limit headroom
        let memory = Quantity(memory.quantity());
        let requests = BTreeMap::from([
            ("memory".to_string(), memory.clone()),
            ("cpu".to_string(), Quantity(CPU_REQUEST.to_string())),
        ]);
        let limits = BTreeMap::from([("memory".to_string(), memory)]);

        let container = Container {
            name: tag.to_string(),
            image: Some(image.full_name()),
            image_pull_policy: Some("IfNotPresent".to_string()),
            liveness_probe: Some(liveness_probe()),
            resources: Some(ResourceRequirements {
                requests: Some(requests),
                limits: Some(limits),
                ..Default::default()
            }),
            ports: Some(vec![ContainerPort {
                container_port: CONTAINER_PORT,
                ..Default::default()
            }]),
            env: Some(compile_env(secret)),
            ..Default::default()
        };

        Deployment {
            metadata: self.metadata(tag),
            spec: Some(DeploymentSpec {
                replicas: Some(INITIAL_REPLICAS),
                selector: LabelSelector {
                    match_labels: Some(app_selector(tag)),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(app_selector(tag)),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![container],
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn compile_autoscaler(&self, tag: &str) -> HorizontalPodAutoscaler {
        HorizontalPodAutoscaler {
            metadata: self.metadata(tag),
            spec: Some(HorizontalPodAutoscalerSpec {
                min_replicas: Some(AUTOSCALER_MIN_REPLICAS),
                max_replicas: AUTOSCALER_MAX_REPLICAS,
                target_cpu_utilization_percentage: Some(AUTOSCALER_TARGET_CPU),
                scale_target_ref: CrossVersionObjectReference {
                    api_version: Some("apps/v1".to_string()),
                    kind: "Deployment".to_string(),
                    name: tag.to_string(),
                },
            }),
            ..Default::default()
        }
    }

    fn compile_ingress(&self, tag: &str) -> Ingress {
        let backend = IngressBackend {
            service: Some(IngressServiceBackend {
                name: tag.to_string(),
                port: Some(ServiceBackendPort {
                    number: Some(SERVICE_PORT),
                    ..Default::default()
                }),
            }),
            ..Default::default()
        };

        Ingress {
            metadata: self.metadata(tag),
            spec: Some(IngressSpec {
                rules: Some(vec![IngressRule {
                    host: Some(self.fqdn(tag)),
                    http: Some(HTTPIngressRuleValue {
                        paths: vec![HTTPIngressPath {
                            path: Some("/".to_string()),
                            path_type: "Prefix".to_string(),
                            backend,
                        }],
                    }),
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

fn app_selector(tag: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(APP_LABEL.to_string(), tag.to_string())])
}

fn liveness_probe() -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some(HEALTH_PATH.to_string()),
            port: IntOrString::Int(CONTAINER_PORT),
            ..Default::default()
        }),
        failure_threshold: Some(PROBE_FAILURE_THRESHOLD),
        period_seconds: Some(PROBE_PERIOD_SECONDS),
        initial_delay_seconds: Some(PROBE_INITIAL_DELAY_SECONDS),
        timeout_seconds: Some(PROBE_TIMEOUT_SECONDS),
        ..Default::default()
    }
}

/// One env var per secret key, always sourced by reference, never inlined.
///
/// A missing Secret and a Secret with no keys both yield the placeholder, so
/// the container never starts with an empty environment.
fn compile_env(secret: Option<&SecretRef>) -> Vec<EnvVar> {
    match secret.filter(|secret| !secret.keys.is_empty()) {
        Some(secret) => secret
            .keys
            .iter()
            .map(|key| EnvVar {
                name: key.clone(),
                value_from: Some(EnvVarSource {
                    secret_key_ref: Some(SecretKeySelector {
                        name: secret.name.clone(),
                        key: key.clone(),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            })
            .collect(),
        None => vec![EnvVar {
            name: NO_SECRETS_ENV.to_string(),
            value: Some("true".to_string()),
            ..Default::default()
        }],
    }
}

/// Build an Opaque Secret holding the given plaintext values.
///
/// Values are stored as raw bytes in `data`; they are base64-encoded on the
/// wire, which is how Kubernetes expects Secret data.
pub fn build_secret(name: &str, namespace: &str, values: &BTreeMap<String, String>) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        data: Some(encode_values(values)),
        ..Default::default()
    }
}

/// Convert plaintext values into Secret data entries
pub fn encode_values(values: &BTreeMap<String, String>) -> BTreeMap<String, ByteString> {
    values
        .iter()
        .map(|(k, v)| (k.clone(), ByteString(v.as_bytes().to_vec())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sizing::MemoryPolicy;
    use base64::{engine::general_purpose::STANDARD, Engine};

    fn compiler() -> ResourceCompiler {
        ResourceCompiler::new("nlu", "bots.example.com")
    }

    fn image() -> ImageReference {
        ImageReference::for_build("registry.example.com/bots", "acme-bot", 1_700_000_000)
    }

    fn compile(secret: Option<&SecretRef>) -> CompiledResources {
        let memory = MemoryPolicy::default().estimate(1_000_000);
        compiler().compile("acme-bot", &image(), &memory, secret)
    }

    fn container(resources: &CompiledResources) -> &Container {
        &resources
            .deployment
            .spec
            .as_ref()
            .unwrap()
            .template
            .spec
            .as_ref()
            .unwrap()
            .containers[0]
    }

    // =========================================================================
    // Story: Every resource is named by the tag in the fixed namespace
    // =========================================================================

    #[test]
    fn story_all_resources_share_tag_and_namespace() {
        let r = compile(None);
        for meta in [
            &r.service.metadata,
            &r.deployment.metadata,
            &r.autoscaler.metadata,
            &r.ingress.metadata,
        ] {
            assert_eq!(meta.name.as_deref(), Some("acme-bot"));
            assert_eq!(meta.namespace.as_deref(), Some("nlu"));
        }
    }

    // =========================================================================
    // Story: Deployment policy
    // =========================================================================

    #[test]
    fn story_deployment_starts_with_one_replica_and_sized_memory() {
        let r = compile(None);
        let spec = r.deployment.spec.as_ref().unwrap();
        assert_eq!(spec.replicas, Some(1));

        let resources = container(&r).resources.as_ref().unwrap();
        let requests = resources.requests.as_ref().unwrap();
        let limits = resources.limits.as_ref().unwrap();
        assert_eq!(requests["memory"], Quantity("129Mi".to_string()));
        assert_eq!(limits["memory"], Quantity("129Mi".to_string()));
        assert_eq!(requests["cpu"], Quantity("80m".to_string()));
        assert!(!limits.contains_key("cpu"));
    }

    #[test]
    fn story_deployment_runs_the_built_image() {
        let r = compile(None);
        let c = container(&r);
        assert_eq!(
            c.image.as_deref(),
            Some("registry.example.com/bots:acme-bot-1700000000")
        );
        assert_eq!(c.name, "acme-bot");
        assert_eq!(c.ports.as_ref().unwrap()[0].container_port, 5000);
    }

    #[test]
    fn story_liveness_probe_hits_the_health_endpoint() {
        let r = compile(None);
        let probe = container(&r).liveness_probe.as_ref().unwrap();
        let http = probe.http_get.as_ref().unwrap();
        assert_eq!(http.path.as_deref(), Some("/healthcheck"));
        assert_eq!(http.port, IntOrString::Int(5000));
        assert_eq!(probe.failure_threshold, Some(3));
        assert_eq!(probe.period_seconds, Some(3));
        assert_eq!(probe.initial_delay_seconds, Some(7));
        assert_eq!(probe.timeout_seconds, Some(2));
    }

    #[test]
    fn story_selector_and_pod_labels_agree_with_service() {
        let r = compile(None);
        let spec = r.deployment.spec.as_ref().unwrap();
        let expected = Some(app_selector("acme-bot"));
        assert_eq!(spec.selector.match_labels, expected);
        assert_eq!(
            spec.template.metadata.as_ref().unwrap().labels,
            expected
        );
        assert_eq!(r.service.spec.as_ref().unwrap().selector, expected);
    }

    // =========================================================================
    // Story: Environment comes from the secret, never inlined
    // =========================================================================

    #[test]
    fn story_without_secret_a_single_placeholder_env_var() {
        let r = compile(None);
        let env = container(&r).env.as_ref().unwrap();
        assert_eq!(env.len(), 1);
        assert_eq!(env[0].name, "no-nlu-variables");
        assert_eq!(env[0].value.as_deref(), Some("true"));
    }

    #[test]
    fn story_secret_without_keys_falls_back_to_the_placeholder() {
        let secret = SecretRef {
            name: "nlu-vars".to_string(),
            keys: vec![],
        };
        let r = compile(Some(&secret));
        let env = container(&r).env.as_ref().unwrap();
        assert_eq!(env.len(), 1);
        assert_eq!(env[0].name, "no-nlu-variables");
        assert_eq!(env[0].value.as_deref(), Some("true"));
        assert!(env[0].value_from.is_none());
    }

    #[test]
    fn story_with_secret_one_reference_per_key() {
        let secret = SecretRef {
            name: "nlu-vars".to_string(),
            keys: vec!["API_KEY".to_string(), "DB_URL".to_string()],
        };
        let r = compile(Some(&secret));
        let env = container(&r).env.as_ref().unwrap();
        assert_eq!(env.len(), 2);
        for (var, key) in env.iter().zip(["API_KEY", "DB_URL"]) {
            assert_eq!(var.name, key);
            assert!(var.value.is_none());
            let selector = var
                .value_from
                .as_ref()
                .unwrap()
                .secret_key_ref
                .as_ref()
                .unwrap();
            assert_eq!(selector.name, "nlu-vars");
            assert_eq!(selector.key, key);
        }
    }

    #[test]
    fn story_secret_ref_reads_keys_in_order() {
        let values = BTreeMap::from([
            ("ZED".to_string(), "z".to_string()),
            ("ALPHA".to_string(), "a".to_string()),
        ]);
        let secret = build_secret("nlu-vars", "nlu", &values);
        let reference = SecretRef::from_secret("nlu-vars", &secret);
        assert_eq!(reference.keys, vec!["ALPHA".to_string(), "ZED".to_string()]);
    }

    // =========================================================================
    // Story: Service, autoscaler and ingress policy
    // =========================================================================

    #[test]
    fn story_service_routes_port_80_to_container() {
        let r = compile(None);
        let spec = r.service.spec.as_ref().unwrap();
        assert_eq!(spec.type_.as_deref(), Some("ClusterIP"));
        let port = &spec.ports.as_ref().unwrap()[0];
        assert_eq!(port.port, 80);
        assert_eq!(port.target_port, Some(IntOrString::Int(5000)));
    }

    #[test]
    fn story_autoscaler_targets_the_deployment() {
        let r = compile(None);
        let spec = r.autoscaler.spec.as_ref().unwrap();
        assert_eq!(spec.min_replicas, Some(2));
        assert_eq!(spec.max_replicas, 5);
        assert_eq!(spec.target_cpu_utilization_percentage, Some(100));
        assert_eq!(spec.scale_target_ref.kind, "Deployment");
        assert_eq!(spec.scale_target_ref.name, "acme-bot");
    }

    #[test]
    fn story_ingress_host_is_tag_under_domain() {
        let r = compile(None);
        let rules = r.ingress.spec.as_ref().unwrap().rules.as_ref().unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].host.as_deref(), Some("acme-bot.bots.example.com"));

        let path = &rules[0].http.as_ref().unwrap().paths[0];
        let backend = path.backend.service.as_ref().unwrap();
        assert_eq!(backend.name, "acme-bot");
        assert_eq!(backend.port.as_ref().unwrap().number, Some(80));
    }

    // =========================================================================
    // Story: Secret construction
    // =========================================================================

    #[test]
    fn story_secret_is_opaque_and_base64_on_the_wire() {
        let values = BTreeMap::from([("API_KEY".to_string(), "hunter2".to_string())]);
        let secret = build_secret("nlu-vars", "nlu", &values);
        assert_eq!(secret.type_.as_deref(), Some("Opaque"));

        let json = serde_json::to_value(&secret).unwrap();
        assert_eq!(json["data"]["API_KEY"], STANDARD.encode("hunter2"));
    }
}
