//! Routing Deployment builder
//!
//! One `osrm-routed` deployment per profile, serving the preprocessed graph
//! from the profile's volume over HTTP on port 5000.

use crate::crd::{OSRMCluster, ProfileSpec};
use crate::status::ObservedChildren;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, PersistentVolumeClaimVolumeSource, Probe, ResourceRequirements,
    TCPSocketAction, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use std::collections::BTreeMap;

use super::{
    child_resource_name, profile_workloads_ready, selector_name, standard_labels, DATA_DIR,
    DATA_VOLUME, DEFAULT_IMAGE, DEPLOYMENT_SUFFIX, OSRM_CONTAINER_NAME, OSRM_PORT,
    PERSISTENT_VOLUME_CLAIM_SUFFIX,
};

pub struct DeploymentBuilder<'a> {
    pub cluster: &'a OSRMCluster,
    pub profile: &'a ProfileSpec,
}

impl DeploymentBuilder<'_> {
    pub fn name(&self) -> String {
        child_resource_name(
            &self.cluster.name_any(),
            &self.profile.name,
            DEPLOYMENT_SUFFIX,
        )
    }

    pub fn build(&self) -> Deployment {
        let mut deployment = Deployment::default();
        deployment.metadata.name = Some(self.name());
        deployment.metadata.namespace = self.cluster.namespace();
        deployment
    }

    /// Writes the operator-owned projection into the deployment. Fields the
    /// platform fills in (strategy, probe thresholds, replica count once the
    /// HPA has taken over) are left as read.
    pub fn update(&self, deployment: &mut Deployment) {
        let app = selector_name(&self.cluster.name_any(), &self.profile.name);
        let mut pod_labels = BTreeMap::new();
        pod_labels.insert("app".to_string(), app);

        deployment.metadata.labels = Some(standard_labels(self.cluster));

        let spec = deployment.spec.get_or_insert_with(Default::default);

        // Replicas are initialized to minReplicas; afterwards the HPA owns them
        if spec.replicas.is_none() {
            spec.replicas = Some(self.profile.min_replicas());
        }
        spec.selector.match_labels = Some(pod_labels.clone());

        let template_meta = spec.template.metadata.get_or_insert_with(Default::default);
        template_meta.labels = Some(pod_labels);

        let pod = spec.template.spec.get_or_insert_with(Default::default);
        if pod.containers.is_empty() {
            pod.containers.push(Container::default());
        }
        let container = &mut pod.containers[0];
        container.name = OSRM_CONTAINER_NAME.to_string();
        container.image = Some(self.image());
        container
            .image_pull_policy
            .get_or_insert_with(|| "IfNotPresent".to_string());
        container.command = Some(vec![
            "osrm-routed".to_string(),
            "--algorithm".to_string(),
            "mld".to_string(),
        ]);
        container.args = Some(vec![format!(
            "{}/{}.osrm",
            DATA_DIR,
            self.cluster.spec.map_name()
        )]);
        container.ports = Some(vec![ContainerPort {
            container_port: OSRM_PORT,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]);
        container.resources = Some(self.resources());
        container.volume_mounts = Some(vec![VolumeMount {
            name: DATA_VOLUME.to_string(),
            mount_path: DATA_DIR.to_string(),
            read_only: Some(true),
            ..Default::default()
        }]);

        let probe = Probe {
            tcp_socket: Some(TCPSocketAction {
                port: IntOrString::Int(OSRM_PORT),
                ..Default::default()
            }),
            initial_delay_seconds: Some(5),
            period_seconds: Some(10),
            ..Default::default()
        };
        if container.readiness_probe.is_none() {
            container.readiness_probe = Some(probe.clone());
        }
        if container.liveness_probe.is_none() {
            container.liveness_probe = Some(probe);
        }

        pod.volumes = Some(vec![Volume {
            name: DATA_VOLUME.to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: child_resource_name(
                    &self.cluster.name_any(),
                    &self.profile.name,
                    PERSISTENT_VOLUME_CLAIM_SUFFIX,
                ),
                ..Default::default()
            }),
            ..Default::default()
        }]);
    }

    pub fn should_deploy(&self, observed: &ObservedChildren) -> bool {
        profile_workloads_ready(self.cluster, &self.profile.name, observed)
    }

    fn image(&self) -> String {
        self.cluster
            .spec
            .image
            .clone()
            .unwrap_or_else(|| DEFAULT_IMAGE.to_string())
    }

    /// Profile resources, or the documented default for routing servers
    /// (1 CPU and 100Mi requested, no limits).
    fn resources(&self) -> ResourceRequirements {
        match &self.profile.resources {
            Some(spec) => {
                let to_list = |list: &crate::crd::ResourceList| {
                    let mut quantities = BTreeMap::new();
                    if let Some(cpu) = &list.cpu {
                        quantities.insert("cpu".to_string(), Quantity(cpu.clone()));
                    }
                    if let Some(memory) = &list.memory {
                        quantities.insert("memory".to_string(), Quantity(memory.clone()));
                    }
                    quantities
                };
                let limits = to_list(&spec.limits);
                let requests = to_list(&spec.requests);
                ResourceRequirements {
                    limits: if limits.is_empty() { None } else { Some(limits) },
                    requests: if requests.is_empty() {
                        None
                    } else {
                        Some(requests)
                    },
                    ..Default::default()
                }
            }
            None => {
                let mut requests = BTreeMap::new();
                requests.insert("cpu".to_string(), Quantity("1".to_string()));
                requests.insert("memory".to_string(), Quantity("100Mi".to_string()));
                ResourceRequirements {
                    requests: Some(requests),
                    ..Default::default()
                }
            }
        }
    }
}
