//! Gateway builders
//!
//! A shared NGINX front-end that URL-routes to the per-profile services
//! based on each profile's endpoint name, restricted to the exposed OSRM
//! services. The rendered config lives in a ConfigMap; its logical version
//! is hashed into a pod-template annotation so the gateway rolls whenever
//! the routing table changes (Kubernetes does not roll pods on ConfigMap
//! updates by itself).

use crate::crd::OSRMCluster;
use crate::status::ObservedChildren;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, Service, ServicePort, ServiceSpec,
    Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use super::{
    child_resource_name, profile_workloads_ready, selector_name, standard_labels,
    CONFIG_MAP_SUFFIX, DEPLOYMENT_SUFFIX, SERVICE_SUFFIX,
};

/// Pod-template annotation carrying the gateway's logical config version.
pub const GATEWAY_CONFIG_VERSION_ANNOTATION: &str = "gatewayConfigVersion";

const GATEWAY_IMAGE: &str = "nginx:1.27";
const NGINX_CONF_KEY: &str = "nginx.conf";

/// Stable short digest over the routing table: profiles in declaration order
/// plus the exposed services sorted and deduplicated. Reordering
/// `exposingServices` does not change the version; adding a profile or
/// editing an endpoint name does.
pub fn gateway_config_version(cluster: &OSRMCluster) -> String {
    let mut hasher = Sha256::new();
    for profile in &cluster.spec.profiles {
        hasher.update(profile.name.as_bytes());
        hasher.update(b"|");
        hasher.update(profile.endpoint_name.as_bytes());
        hasher.update(b"|");
        hasher.update(profile.internal_endpoint().as_bytes());
        hasher.update(b"\n");
    }
    hasher.update(b"--\n");
    for service in sorted_exposing_services(cluster) {
        hasher.update(service.as_bytes());
        hasher.update(b"\n");
    }
    let digest = hasher.finalize();
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    hex[..12].to_string()
}

/// Renders the NGINX routing table: one location per (exposed service ×
/// profile) pair, proxying the external endpoint name to the profile's
/// internal service DNS and OSRM profile name.
pub fn render_nginx_conf(cluster: &OSRMCluster) -> String {
    let cluster_name = cluster.name_any();
    let namespace = cluster.namespace().unwrap_or_else(|| "default".to_string());

    let mut locations = String::new();
    for service in sorted_exposing_services(cluster) {
        for profile in &cluster.spec.profiles {
            let upstream = child_resource_name(&cluster_name, &profile.name, SERVICE_SUFFIX);
            locations.push_str(&format!(
                "        location /{service}/v1/{endpoint} {{\n\
                 \x20           proxy_pass http://{upstream}.{namespace}.svc.cluster.local/{service}/v1/{internal};\n\
                 \x20       }}\n",
                service = service,
                endpoint = profile.endpoint_name,
                upstream = upstream,
                namespace = namespace,
                internal = profile.internal_endpoint(),
            ));
        }
    }

    format!(
        "worker_processes auto;\n\
         events {{\n\
         \x20   worker_connections 1024;\n\
         }}\n\
         http {{\n\
         \x20   server {{\n\
         \x20       listen 80;\n\
         \x20       location = /healthz {{\n\
         \x20           return 200 'ok';\n\
         \x20       }}\n\
         {locations}\
         \x20   }}\n\
         }}\n",
        locations = locations
    )
}

fn sorted_exposing_services(cluster: &OSRMCluster) -> Vec<String> {
    let mut services = cluster.spec.service.exposing_services.clone();
    services.sort();
    services.dedup();
    services
}

// ============================================================================
// ConfigMap
// ============================================================================

pub struct GatewayConfigMapBuilder<'a> {
    pub cluster: &'a OSRMCluster,
}

impl GatewayConfigMapBuilder<'_> {
    pub fn name(&self) -> String {
        child_resource_name(&self.cluster.name_any(), "", CONFIG_MAP_SUFFIX)
    }

    pub fn build(&self) -> ConfigMap {
        let mut cm = ConfigMap::default();
        cm.metadata.name = Some(self.name());
        cm.metadata.namespace = self.cluster.namespace();
        cm
    }

    pub fn update(&self, cm: &mut ConfigMap) {
        cm.metadata.labels = Some(standard_labels(self.cluster));

        let mut data = BTreeMap::new();
        data.insert(NGINX_CONF_KEY.to_string(), render_nginx_conf(self.cluster));
        cm.data = Some(data);
    }

    pub fn should_deploy(&self, _observed: &ObservedChildren) -> bool {
        true
    }
}

// ============================================================================
// Service
// ============================================================================

pub struct GatewayServiceBuilder<'a> {
    pub cluster: &'a OSRMCluster,
}

impl GatewayServiceBuilder<'_> {
    pub fn name(&self) -> String {
        child_resource_name(&self.cluster.name_any(), "", SERVICE_SUFFIX)
    }

    pub fn build(&self) -> Service {
        let mut service = Service::default();
        service.metadata.name = Some(self.name());
        service.metadata.namespace = self.cluster.namespace();
        service
    }

    pub fn update(&self, service: &mut Service) {
        let name = self.name();
        let mut selector = BTreeMap::new();
        selector.insert(
            "app".to_string(),
            selector_name(&self.cluster.name_any(), ""),
        );

        service.metadata.labels = Some(standard_labels(self.cluster));

        // clusterIP and friends are platform-set and left untouched
        let spec = service.spec.get_or_insert_with(ServiceSpec::default);
        spec.type_ = Some("ClusterIP".to_string());
        spec.selector = Some(selector);
        spec.ports = Some(vec![ServicePort {
            name: Some(format!("{}-port", name)),
            protocol: Some("TCP".to_string()),
            port: 80,
            target_port: Some(IntOrString::Int(80)),
            ..Default::default()
        }]);
    }

    pub fn should_deploy(&self, observed: &ObservedChildren) -> bool {
        any_profile_ready(self.cluster, observed)
    }
}

// ============================================================================
// Deployment
// ============================================================================

pub struct GatewayDeploymentBuilder<'a> {
    pub cluster: &'a OSRMCluster,
}

impl GatewayDeploymentBuilder<'_> {
    pub fn name(&self) -> String {
        child_resource_name(&self.cluster.name_any(), "", DEPLOYMENT_SUFFIX)
    }

    pub fn build(&self) -> Deployment {
        let mut deployment = Deployment::default();
        deployment.metadata.name = Some(self.name());
        deployment.metadata.namespace = self.cluster.namespace();
        deployment
    }

    /// Writes the operator-owned projection; the config-version annotation
    /// on the pod template is what forces a rolling restart when the routing
    /// table changes.
    pub fn update(&self, deployment: &mut Deployment) {
        let app = selector_name(&self.cluster.name_any(), "");
        let mut pod_labels = BTreeMap::new();
        pod_labels.insert("app".to_string(), app);

        deployment.metadata.labels = Some(standard_labels(self.cluster));

        let spec = deployment.spec.get_or_insert_with(Default::default);
        if spec.replicas.is_none() {
            spec.replicas = Some(1);
        }
        spec.selector.match_labels = Some(pod_labels.clone());

        let template_meta = spec.template.metadata.get_or_insert_with(Default::default);
        template_meta.labels = Some(pod_labels);
        template_meta
            .annotations
            .get_or_insert_with(Default::default)
            .insert(
                GATEWAY_CONFIG_VERSION_ANNOTATION.to_string(),
                gateway_config_version(self.cluster),
            );

        let pod = spec.template.spec.get_or_insert_with(Default::default);
        if pod.containers.is_empty() {
            pod.containers.push(Container::default());
        }
        let container = &mut pod.containers[0];
        container.name = "gateway".to_string();
        container.image = Some(GATEWAY_IMAGE.to_string());
        container
            .image_pull_policy
            .get_or_insert_with(|| "IfNotPresent".to_string());
        container.ports = Some(vec![ContainerPort {
            container_port: 80,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]);
        container.volume_mounts = Some(vec![VolumeMount {
            name: "nginx-config".to_string(),
            mount_path: "/etc/nginx/nginx.conf".to_string(),
            sub_path: Some(NGINX_CONF_KEY.to_string()),
            read_only: Some(true),
            ..Default::default()
        }]);

        pod.volumes = Some(vec![Volume {
            name: "nginx-config".to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: child_resource_name(&self.cluster.name_any(), "", CONFIG_MAP_SUFFIX),
                ..Default::default()
            }),
            ..Default::default()
        }]);
    }

    pub fn should_deploy(&self, observed: &ObservedChildren) -> bool {
        any_profile_ready(self.cluster, observed)
    }
}

/// The gateway exists as soon as a single profile can serve traffic.
fn any_profile_ready(cluster: &OSRMCluster, observed: &ObservedChildren) -> bool {
    cluster
        .spec
        .profiles
        .iter()
        .any(|profile| profile_workloads_ready(cluster, &profile.name, observed))
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{cluster_from, sample_cluster};
    use super::*;

    #[test]
    fn test_config_version_is_deterministic() {
        let cluster = sample_cluster();
        let first = gateway_config_version(&cluster);
        let second = gateway_config_version(&cluster);
        assert_eq!(first, second);
        assert_eq!(first.len(), 12);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_config_version_stable_under_service_reordering() {
        let mut cluster = sample_cluster();
        cluster.spec.service.exposing_services =
            vec!["table".to_string(), "route".to_string()];
        let forward = gateway_config_version(&cluster);

        cluster.spec.service.exposing_services =
            vec!["route".to_string(), "table".to_string()];
        assert_eq!(gateway_config_version(&cluster), forward);
    }

    #[test]
    fn test_config_version_changes_on_new_profile() {
        let mut cluster = sample_cluster();
        let before = gateway_config_version(&cluster);

        cluster.spec.profiles.push(
            serde_json::from_value(serde_json::json!({
                "name": "new-profile",
                "endpointName": "custom-endpoint"
            }))
            .unwrap(),
        );
        assert_ne!(gateway_config_version(&cluster), before);
    }

    #[test]
    fn test_config_version_changes_on_endpoint_rename() {
        let mut cluster = sample_cluster();
        let before = gateway_config_version(&cluster);

        cluster.spec.profiles[0].endpoint_name = "ankri".to_string();
        assert_ne!(gateway_config_version(&cluster), before);
    }

    #[test]
    fn test_config_version_changes_on_exposing_services_edit() {
        let mut cluster = sample_cluster();
        let before = gateway_config_version(&cluster);

        cluster.spec.service.exposing_services.push("table".to_string());
        assert_ne!(gateway_config_version(&cluster), before);
    }

    #[test]
    fn test_nginx_conf_routes_endpoint_to_internal_service() {
        let cluster = cluster_from(serde_json::json!({
            "pbfUrl": "https://example.com/map.osm.pbf",
            "profiles": [{
                "name": "car",
                "endpointName": "driving"
            }, {
                "name": "new-profile",
                "endpointName": "custom-endpoint",
                "internalEndpoint": "walking"
            }],
            "service": {"exposingServices": ["route"]}
        }));

        let conf = render_nginx_conf(&cluster);
        assert!(conf.contains("location /route/v1/driving"));
        assert!(conf.contains(
            "proxy_pass http://rr-config-car-svc.default.svc.cluster.local/route/v1/car"
        ));
        assert!(conf.contains("location /route/v1/custom-endpoint"));
        assert!(conf.contains(
            "proxy_pass http://rr-config-new-profile-svc.default.svc.cluster.local/route/v1/walking"
        ));
    }

    #[test]
    fn test_nginx_conf_restricted_to_exposing_services() {
        let cluster = sample_cluster();
        let conf = render_nginx_conf(&cluster);
        assert!(conf.contains("/route/v1/driving"));
        assert!(!conf.contains("/table/"));
        assert!(!conf.contains("/match/"));
    }

    #[test]
    fn test_config_map_carries_rendered_conf() {
        let cluster = sample_cluster();
        let builder = GatewayConfigMapBuilder { cluster: &cluster };
        assert_eq!(builder.name(), "rr-config-cm");

        let mut cm = builder.build();
        builder.update(&mut cm);
        let data = cm.data.unwrap();
        assert_eq!(data["nginx.conf"], render_nginx_conf(&cluster));
    }

    #[test]
    fn test_gateway_deployment_annotation_matches_hash() {
        let cluster = sample_cluster();
        let builder = GatewayDeploymentBuilder { cluster: &cluster };
        assert_eq!(builder.name(), "rr-config-deployment");

        let mut deployment = builder.build();
        builder.update(&mut deployment);

        let annotations = deployment
            .spec
            .unwrap()
            .template
            .metadata
            .unwrap()
            .annotations
            .unwrap();
        assert_eq!(
            annotations[GATEWAY_CONFIG_VERSION_ANNOTATION],
            gateway_config_version(&cluster)
        );
    }

    #[test]
    fn test_gateway_deployment_mounts_config_map() {
        let cluster = sample_cluster();
        let builder = GatewayDeploymentBuilder { cluster: &cluster };

        let mut deployment = builder.build();
        builder.update(&mut deployment);

        let pod = deployment.spec.unwrap().template.spec.unwrap();
        let volume = &pod.volumes.as_ref().unwrap()[0];
        assert_eq!(volume.config_map.as_ref().unwrap().name, "rr-config-cm");
        let mount = &pod.containers[0].volume_mounts.as_ref().unwrap()[0];
        assert_eq!(mount.mount_path, "/etc/nginx/nginx.conf");
        assert_eq!(mount.sub_path.as_deref(), Some("nginx.conf"));
    }

    #[test]
    fn test_gateway_service_selects_gateway_pods() {
        let cluster = sample_cluster();
        let builder = GatewayServiceBuilder { cluster: &cluster };
        assert_eq!(builder.name(), "rr-config-svc");

        let mut service = builder.build();
        builder.update(&mut service);
        let spec = service.spec.unwrap();
        assert_eq!(spec.selector.unwrap()["app"], "rr-config-gateway");
        assert_eq!(spec.ports.unwrap()[0].target_port, Some(IntOrString::Int(80)));
    }

    #[test]
    fn test_gateway_gated_on_first_ready_profile() {
        use k8s_openapi::api::batch::v1::{Job, JobCondition, JobStatus};
        use k8s_openapi::api::core::v1::{PersistentVolumeClaim, PersistentVolumeClaimStatus};
        use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

        let cluster = sample_cluster();
        let builder = GatewayDeploymentBuilder { cluster: &cluster };

        assert!(!builder.should_deploy(&ObservedChildren::default()));

        let observed = ObservedChildren {
            persistent_volume_claims: vec![PersistentVolumeClaim {
                metadata: ObjectMeta {
                    name: Some("rr-config-car-pvc".to_string()),
                    ..Default::default()
                },
                status: Some(PersistentVolumeClaimStatus {
                    phase: Some("Bound".to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            jobs: vec![Job {
                metadata: ObjectMeta {
                    name: Some("rr-config-car-job".to_string()),
                    ..Default::default()
                },
                status: Some(JobStatus {
                    conditions: Some(vec![JobCondition {
                        type_: "Complete".to_string(),
                        status: "True".to_string(),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            ..Default::default()
        };
        assert!(builder.should_deploy(&observed));
    }
}
