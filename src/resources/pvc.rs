//! PersistentVolumeClaim builder
//!
//! One claim per profile; holds the downloaded extract and the preprocessed
//! graph shared between the map-preparation job and the routing servers.

use crate::crd::{OSRMCluster, ProfileSpec};
use crate::status::ObservedChildren;
use k8s_openapi::api::core::v1::{
    PersistentVolumeClaim, PersistentVolumeClaimSpec, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::ResourceExt;
use std::collections::BTreeMap;

use super::{child_resource_name, standard_labels, PERSISTENT_VOLUME_CLAIM_SUFFIX};

pub struct PersistentVolumeClaimBuilder<'a> {
    pub cluster: &'a OSRMCluster,
    pub profile: &'a ProfileSpec,
}

impl PersistentVolumeClaimBuilder<'_> {
    pub fn name(&self) -> String {
        child_resource_name(
            &self.cluster.name_any(),
            &self.profile.name,
            PERSISTENT_VOLUME_CLAIM_SUFFIX,
        )
    }

    pub fn build(&self) -> PersistentVolumeClaim {
        let mut pvc = PersistentVolumeClaim::default();
        pvc.metadata.name = Some(self.name());
        pvc.metadata.namespace = self.cluster.namespace();
        pvc
    }

    pub fn update(&self, pvc: &mut PersistentVolumeClaim) {
        let persistence = &self.cluster.spec.persistence;

        pvc.metadata.labels = Some(standard_labels(self.cluster));

        let mut requests = BTreeMap::new();
        requests.insert("storage".to_string(), Quantity(persistence.storage.clone()));

        // Volume spec fields are immutable after creation apart from the
        // storage request, so only write them the first time around.
        let spec = pvc.spec.get_or_insert_with(PersistentVolumeClaimSpec::default);
        if spec.access_modes.is_none() {
            spec.access_modes = Some(vec![persistence.access_mode().to_string()]);
        }
        if spec.storage_class_name.is_none() {
            spec.storage_class_name = persistence.storage_class_name.clone();
        }
        spec.resources = Some(VolumeResourceRequirements {
            requests: Some(requests),
            ..Default::default()
        });
    }

    pub fn should_deploy(&self, _observed: &ObservedChildren) -> bool {
        true
    }
}
