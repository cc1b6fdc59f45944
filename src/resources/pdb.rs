//! PodDisruptionBudget builder
//!
//! Keeps at least one routing pod per profile alive through voluntary
//! disruptions (node drains, rollouts).

use crate::crd::{OSRMCluster, ProfileSpec};
use crate::status::ObservedChildren;
use k8s_openapi::api::policy::v1::{PodDisruptionBudget, PodDisruptionBudgetSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use std::collections::BTreeMap;

use super::{
    child_resource_name, profile_workloads_ready, selector_name, standard_labels,
    POD_DISRUPTION_BUDGET_SUFFIX,
};

pub struct PodDisruptionBudgetBuilder<'a> {
    pub cluster: &'a OSRMCluster,
    pub profile: &'a ProfileSpec,
}

impl PodDisruptionBudgetBuilder<'_> {
    pub fn name(&self) -> String {
        child_resource_name(
            &self.cluster.name_any(),
            &self.profile.name,
            POD_DISRUPTION_BUDGET_SUFFIX,
        )
    }

    pub fn build(&self) -> PodDisruptionBudget {
        let mut pdb = PodDisruptionBudget::default();
        pdb.metadata.name = Some(self.name());
        pdb.metadata.namespace = self.cluster.namespace();
        pdb
    }

    pub fn update(&self, pdb: &mut PodDisruptionBudget) {
        let mut selector = BTreeMap::new();
        selector.insert(
            "app".to_string(),
            selector_name(&self.cluster.name_any(), &self.profile.name),
        );

        pdb.metadata.labels = Some(standard_labels(self.cluster));
        pdb.spec = Some(PodDisruptionBudgetSpec {
            min_available: Some(IntOrString::Int(1)),
            selector: Some(LabelSelector {
                match_labels: Some(selector),
                ..Default::default()
            }),
            ..Default::default()
        });
    }

    pub fn should_deploy(&self, observed: &ObservedChildren) -> bool {
        profile_workloads_ready(self.cluster, &self.profile.name, observed)
    }
}
