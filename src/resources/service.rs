//! Profile Service builder
//!
//! ClusterIP (or the configured type) in front of each profile's routing
//! deployment; port 80 forwards to the OSRM container port.

use crate::crd::{OSRMCluster, ProfileSpec};
use crate::status::ObservedChildren;
use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use std::collections::BTreeMap;

use super::{
    child_resource_name, profile_workloads_ready, selector_name, standard_labels, OSRM_PORT,
    SERVICE_SUFFIX,
};

pub struct ServiceBuilder<'a> {
    pub cluster: &'a OSRMCluster,
    pub profile: &'a ProfileSpec,
}

impl ServiceBuilder<'_> {
    pub fn name(&self) -> String {
        child_resource_name(
            &self.cluster.name_any(),
            &self.profile.name,
            SERVICE_SUFFIX,
        )
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
            selector_name(&self.cluster.name_any(), &self.profile.name),
        );

        service.metadata.labels = Some(standard_labels(self.cluster));
        if let Some(annotations) = &self.cluster.spec.service.annotations {
            let existing = service
                .metadata
                .annotations
                .get_or_insert_with(Default::default);
            for (key, value) in annotations {
                existing.insert(key.clone(), value.clone());
            }
        }

        // Only the operator-owned projection is written; platform-set fields
        // like clusterIP and an allocated nodePort stay as they were read.
        let spec = service.spec.get_or_insert_with(ServiceSpec::default);
        let node_port = spec
            .ports
            .as_ref()
            .and_then(|ports| ports.first())
            .and_then(|port| port.node_port);
        spec.type_ = Some(self.cluster.spec.service.get_type().to_string());
        spec.selector = Some(selector);
        spec.ports = Some(vec![ServicePort {
            name: Some(format!("{}-port", name)),
            protocol: Some("TCP".to_string()),
            port: 80,
            target_port: Some(IntOrString::Int(OSRM_PORT)),
            node_port,
            ..Default::default()
        }]);
    }

    pub fn should_deploy(&self, observed: &ObservedChildren) -> bool {
        profile_workloads_ready(self.cluster, &self.profile.name, observed)
    }
}
