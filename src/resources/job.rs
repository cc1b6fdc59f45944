//! Map-preparation Job builder
//!
//! One single-shot Job per profile: downloads the PBF extract onto the
//! profile's volume and runs the OSRM preprocessing pipeline
//! (extract, partition, customize) so the routing servers can load the
//! multi-level Dijkstra dataset.

use crate::crd::{OSRMCluster, ProfileSpec};
use crate::status::ObservedChildren;
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, PersistentVolumeClaimVolumeSource, PodSpec, PodTemplateSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use std::collections::BTreeMap;

use super::{
    child_resource_name, standard_labels, DATA_DIR, DATA_VOLUME, DEFAULT_IMAGE, JOB_SUFFIX,
    PERSISTENT_VOLUME_CLAIM_SUFFIX,
};

pub struct JobBuilder<'a> {
    pub cluster: &'a OSRMCluster,
    pub profile: &'a ProfileSpec,
}

impl JobBuilder<'_> {
    pub fn name(&self) -> String {
        child_resource_name(&self.cluster.name_any(), &self.profile.name, JOB_SUFFIX)
    }

    pub fn build(&self) -> Job {
        let mut job = Job::default();
        job.metadata.name = Some(self.name());
        job.metadata.namespace = self.cluster.namespace();
        job
    }

    pub fn update(&self, job: &mut Job) {
        job.metadata.labels = Some(standard_labels(self.cluster));

        // A Job's template is immutable after creation; an existing Job only
        // gets its metadata refreshed so GC keeps its hands off it.
        if job.spec.is_some() {
            return;
        }

        let name = self.name();
        let mut pod_labels = BTreeMap::new();
        pod_labels.insert("app".to_string(), name);

        job.spec = Some(JobSpec {
            backoff_limit: Some(3),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    restart_policy: Some("Never".to_string()),
                    containers: vec![Container {
                        name: "map-builder".to_string(),
                        image: Some(self.image()),
                        command: Some(vec![
                            "sh".to_string(),
                            "-c".to_string(),
                            self.build_script(),
                        ]),
                        volume_mounts: Some(vec![VolumeMount {
                            name: DATA_VOLUME.to_string(),
                            mount_path: DATA_DIR.to_string(),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }],
                    volumes: Some(vec![Volume {
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
                    }]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        });
    }

    pub fn should_deploy(&self, observed: &ObservedChildren) -> bool {
        observed.is_pvc_bound(&child_resource_name(
            &self.cluster.name_any(),
            &self.profile.name,
            PERSISTENT_VOLUME_CLAIM_SUFFIX,
        ))
    }

    fn image(&self) -> String {
        self.cluster
            .spec
            .image
            .clone()
            .unwrap_or_else(|| DEFAULT_IMAGE.to_string())
    }

    fn build_script(&self) -> String {
        let map = self.cluster.spec.map_name();
        format!(
            "set -e\n\
             cd {data}\n\
             if [ ! -f {map}.osm.pbf ]; then wget -O {map}.osm.pbf {url}; fi\n\
             osrm-extract -p /opt/{profile}.lua {map}.osm.pbf\n\
             osrm-partition {map}.osrm\n\
             osrm-customize {map}.osrm",
            data = DATA_DIR,
            map = map,
            url = self.cluster.spec.pbf_url,
            profile = self.profile.osrm_profile(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{cluster_from, sample_cluster};
    use super::*;
    use k8s_openapi::api::core::v1::PersistentVolumeClaim;
    use k8s_openapi::api::core::v1::PersistentVolumeClaimStatus;

    fn bound_pvc(name: &str) -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            status: Some(PersistentVolumeClaimStatus {
                phase: Some("Bound".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_job_runs_osrm_pipeline() {
        let cluster = sample_cluster();
        let builder = JobBuilder {
            cluster: &cluster,
            profile: &cluster.spec.profiles[0],
        };

        let mut job = builder.build();
        builder.update(&mut job);

        let spec = job.spec.unwrap();
        assert_eq!(spec.backoff_limit, Some(3));
        let pod = spec.template.spec.unwrap();
        assert_eq!(pod.restart_policy.as_deref(), Some("Never"));

        let script = &pod.containers[0].command.as_ref().unwrap()[2];
        assert!(script.contains("wget -O berlin-latest.osm.pbf"));
        assert!(script.contains("osrm-extract -p /opt/car.lua berlin-latest.osm.pbf"));
        assert!(script.contains("osrm-partition berlin-latest.osrm"));
        assert!(script.contains("osrm-customize berlin-latest.osrm"));
    }

    #[test]
    fn test_job_uses_custom_lua_profile() {
        let cluster = cluster_from(serde_json::json!({
            "pbfUrl": "https://example.com/extract.osm.pbf",
            "profiles": [{
                "name": "new-profile",
                "endpointName": "custom-endpoint",
                "internalEndpoint": "walking",
                "osrmProfile": "foot"
            }]
        }));
        let builder = JobBuilder {
            cluster: &cluster,
            profile: &cluster.spec.profiles[0],
        };

        let mut job = builder.build();
        builder.update(&mut job);
        let pod = job.spec.unwrap().template.spec.unwrap();
        let script = &pod.containers[0].command.as_ref().unwrap()[2];
        assert!(script.contains("-p /opt/foot.lua"));
    }

    #[test]
    fn test_job_mounts_profile_volume() {
        let cluster = sample_cluster();
        let builder = JobBuilder {
            cluster: &cluster,
            profile: &cluster.spec.profiles[0],
        };

        let mut job = builder.build();
        builder.update(&mut job);
        let pod = job.spec.unwrap().template.spec.unwrap();
        let claim = pod.volumes.unwrap()[0]
            .persistent_volume_claim
            .clone()
            .unwrap();
        assert_eq!(claim.claim_name, "rr-config-car-pvc");
    }

    #[test]
    fn test_update_leaves_existing_template_untouched() {
        let cluster = sample_cluster();
        let builder = JobBuilder {
            cluster: &cluster,
            profile: &cluster.spec.profiles[0],
        };

        let mut job = builder.build();
        builder.update(&mut job);
        let original_spec = job.spec.clone();

        // Simulate a spec edit that would otherwise rewrite the template
        builder.update(&mut job);
        assert_eq!(
            serde_json::to_value(&job.spec).unwrap(),
            serde_json::to_value(&original_spec).unwrap()
        );
    }

    #[test]
    fn test_gated_on_pvc_bound() {
        let cluster = sample_cluster();
        let builder = JobBuilder {
            cluster: &cluster,
            profile: &cluster.spec.profiles[0],
        };

        assert!(!builder.should_deploy(&ObservedChildren::default()));

        let observed = ObservedChildren {
            persistent_volume_claims: vec![bound_pvc("rr-config-car-pvc")],
            ..Default::default()
        };
        assert!(builder.should_deploy(&observed));
    }
}
