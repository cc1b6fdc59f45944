//! HorizontalPodAutoscaler builder
//!
//! One HPA per profile, scaling the routing deployment between the profile's
//! replica bounds on CPU utilization.

use crate::crd::{OSRMCluster, ProfileSpec};
use crate::status::ObservedChildren;
use k8s_openapi::api::autoscaling::v2::{
    CrossVersionObjectReference, HorizontalPodAutoscaler, HorizontalPodAutoscalerSpec,
    MetricSpec, MetricTarget, ResourceMetricSource,
};
use kube::ResourceExt;

use super::{
    child_resource_name, profile_workloads_ready, standard_labels, DEPLOYMENT_SUFFIX,
    HORIZONTAL_POD_AUTOSCALER_SUFFIX,
};

const TARGET_CPU_UTILIZATION: i32 = 80;

pub struct HorizontalPodAutoscalerBuilder<'a> {
    pub cluster: &'a OSRMCluster,
    pub profile: &'a ProfileSpec,
}

impl HorizontalPodAutoscalerBuilder<'_> {
    pub fn name(&self) -> String {
        child_resource_name(
            &self.cluster.name_any(),
            &self.profile.name,
            HORIZONTAL_POD_AUTOSCALER_SUFFIX,
        )
    }

    pub fn build(&self) -> HorizontalPodAutoscaler {
        let mut hpa = HorizontalPodAutoscaler::default();
        hpa.metadata.name = Some(self.name());
        hpa.metadata.namespace = self.cluster.namespace();
        hpa
    }

    pub fn update(&self, hpa: &mut HorizontalPodAutoscaler) {
        hpa.metadata.labels = Some(standard_labels(self.cluster));

        hpa.spec = Some(HorizontalPodAutoscalerSpec {
            scale_target_ref: CrossVersionObjectReference {
                api_version: Some("apps/v1".to_string()),
                kind: "Deployment".to_string(),
                name: child_resource_name(
                    &self.cluster.name_any(),
                    &self.profile.name,
                    DEPLOYMENT_SUFFIX,
                ),
            },
            min_replicas: Some(self.profile.min_replicas()),
            max_replicas: self.profile.max_replicas(),
            metrics: Some(vec![MetricSpec {
                type_: "Resource".to_string(),
                resource: Some(ResourceMetricSource {
                    name: "cpu".to_string(),
                    target: MetricTarget {
                        type_: "Utilization".to_string(),
                        average_utilization: Some(TARGET_CPU_UTILIZATION),
                        ..Default::default()
                    },
                }),
                ..Default::default()
            }]),
            ..Default::default()
        });
    }

    pub fn should_deploy(&self, observed: &ObservedChildren) -> bool {
        profile_workloads_ready(self.cluster, &self.profile.name, observed)
    }
}
