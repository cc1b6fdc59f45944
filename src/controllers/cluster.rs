//! Cluster Controller
//!
//! Reconciles OSRMCluster custom resources into their child topology:
//! per-profile map-preparation Jobs, PVCs, routing Deployments, Services,
//! HPAs and PDBs, plus the shared gateway. Children are applied in
//! dependency order behind readiness gates, stale children are collected by
//! generation label, and the observed state is folded into the cluster's
//! status conditions.

use crate::conditions::CLUSTER_FINALIZER;
use crate::controllers::error_policy_backoff;
use crate::crd::OSRMCluster;
use crate::error::{OperatorError, Result};
use crate::resources::{
    is_owned_by, is_stale_generation, owner_reference, resource_builders, standard_labels,
    ResourceBuilder, GENERATION_LABEL_KEY,
};
use crate::status::{aggregate_status, ApplyOutcome, ObservedChildren};
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Service};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher::Config;
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const FIELD_MANAGER: &str = "osrm-operator";

/// Poll interval while a readiness gate is closed; the Job-completion wait is
/// watch-driven, this only covers transitions the watches cannot see (e.g. a
/// PVC binding without a spec change).
const GATE_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Context for the cluster controller
pub struct ClusterController {
    client: Client,
    namespace: Option<String>,
}

impl ClusterController {
    /// Create a new cluster controller watching all namespaces.
    pub fn new(client: Client) -> Self {
        Self {
            client,
            namespace: None,
        }
    }

    /// Create a controller restricted to a single namespace.
    pub fn namespaced(client: Client, namespace: &str) -> Self {
        Self {
            client,
            namespace: Some(namespace.to_string()),
        }
    }

    fn watch_api<K>(&self) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
    {
        match &self.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }

    /// Run the cluster controller until shutdown. Child kinds are registered
    /// as owned watches so child deletion or Job completion re-triggers
    /// reconciliation immediately.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let clusters: Api<OSRMCluster> = self.watch_api();

        info!("Starting OSRMCluster controller");

        Controller::new(clusters, Config::default())
            .owns(self.watch_api::<Deployment>(), Config::default())
            .owns(self.watch_api::<Service>(), Config::default())
            .owns(self.watch_api::<ConfigMap>(), Config::default())
            .owns(self.watch_api::<PersistentVolumeClaim>(), Config::default())
            .owns(self.watch_api::<Job>(), Config::default())
            .owns(self.watch_api::<HorizontalPodAutoscaler>(), Config::default())
            .owns(self.watch_api::<PodDisruptionBudget>(), Config::default())
            .shutdown_on_signal()
            .run(
                |cluster, ctx| async move { ctx.reconcile(cluster).await },
                |cluster, error, ctx| {
                    error!("Reconciliation error: {:?}", error);
                    error_policy_backoff(cluster, error, ctx)
                },
                Arc::clone(&self),
            )
            .for_each(|result| async move {
                match result {
                    Ok((obj, _action)) => {
                        info!("Reconciled cluster: {}", obj.name);
                    }
                    Err(e) => {
                        error!("Reconciliation failed: {:?}", e);
                    }
                }
            })
            .await;

        Ok(())
    }

    /// Reconcile one OSRMCluster event.
    async fn reconcile(
        &self,
        cluster: Arc<OSRMCluster>,
    ) -> std::result::Result<Action, OperatorError> {
        let name = cluster.name_any();
        let namespace = cluster.namespace().unwrap_or_else(|| "default".to_string());

        info!("Reconciling OSRMCluster {}/{}", namespace, name);

        // Handle deletion with finalizer
        if cluster.metadata.deletion_timestamp.is_some() {
            return self.handle_deletion(&cluster, &namespace).await;
        }

        // Pause check: no mutation at all while the annotation is set; the
        // annotation edit that clears it is itself a watch event.
        if cluster.paused() {
            info!(
                "Reconciliation of OSRMCluster {}/{} is paused by annotation",
                namespace, name
            );
            return Ok(Action::await_change());
        }

        // Ensure finalizer is set
        self.ensure_finalizer(&cluster, &namespace).await?;

        let mut outcome = ApplyOutcome::default();

        // Validation failures surface in ReconcileSuccess without touching
        // any child resource.
        if let Err(message) = cluster.spec.validate() {
            warn!(
                "OSRMCluster {}/{} failed validation: {}",
                namespace, name, message
            );
            outcome.record_error(OperatorError::Validation(message));
            let observed = self.observe(&cluster, &namespace).await?;
            let status = aggregate_status(&cluster, &observed, &outcome);
            self.update_status(&cluster, &namespace, status).await?;
            return Err(outcome.first_error.take().unwrap_or_else(|| {
                OperatorError::Reconciliation("validation failed".to_string())
            }));
        }

        // Apply phase: builders run in dependency order; gated builders are
        // skipped and retried on the next pass. Errors are collected so one
        // failing child does not starve the rest.
        let observed = self.observe(&cluster, &namespace).await?;
        for builder in resource_builders(&cluster) {
            if !builder.should_deploy(&observed) {
                debug!(
                    "Skipping {} {}: prerequisites not ready",
                    builder.kind(),
                    builder.name()
                );
                outcome.any_gate_closed = true;
                continue;
            }

            let result = match &builder {
                ResourceBuilder::PersistentVolumeClaim(b) => {
                    self.apply(&namespace, &cluster, &b.name(), || b.build(), |o| b.update(o))
                        .await
                }
                ResourceBuilder::Job(b) => {
                    self.apply(&namespace, &cluster, &b.name(), || b.build(), |o| b.update(o))
                        .await
                }
                ResourceBuilder::Deployment(b) => {
                    self.apply(&namespace, &cluster, &b.name(), || b.build(), |o| b.update(o))
                        .await
                }
                ResourceBuilder::Service(b) => {
                    self.apply(&namespace, &cluster, &b.name(), || b.build(), |o| b.update(o))
                        .await
                }
                ResourceBuilder::HorizontalPodAutoscaler(b) => {
                    self.apply(&namespace, &cluster, &b.name(), || b.build(), |o| b.update(o))
                        .await
                }
                ResourceBuilder::PodDisruptionBudget(b) => {
                    self.apply(&namespace, &cluster, &b.name(), || b.build(), |o| b.update(o))
                        .await
                }
                ResourceBuilder::GatewayConfigMap(b) => {
                    self.apply(&namespace, &cluster, &b.name(), || b.build(), |o| b.update(o))
                        .await
                }
                ResourceBuilder::GatewayService(b) => {
                    self.apply(&namespace, &cluster, &b.name(), || b.build(), |o| b.update(o))
                        .await
                }
                ResourceBuilder::GatewayDeployment(b) => {
                    self.apply(&namespace, &cluster, &b.name(), || b.build(), |o| b.update(o))
                        .await
                }
            };

            if let Err(e) = result {
                warn!(
                    "Failed to apply {} {}: {}",
                    builder.kind(),
                    builder.name(),
                    e
                );
                outcome.record_error(e);
            }
        }

        // GC phase: only after a clean apply pass, so a child whose refresh
        // failed is never collected for carrying a stale generation label.
        if outcome.first_error.is_none() {
            if let Err(e) = self.collect_garbage(&cluster, &namespace).await {
                warn!("Garbage collection failed for {}/{}: {}", namespace, name, e);
                outcome.record_error(e);
            }
        }

        // Status phase uses the post-apply snapshot.
        let observed = self.observe(&cluster, &namespace).await?;
        let status = aggregate_status(&cluster, &observed, &outcome);
        self.update_status(&cluster, &namespace, status).await?;

        match outcome.first_error {
            Some(err) => Err(err),
            None if outcome.any_gate_closed => Ok(Action::requeue(GATE_POLL_INTERVAL)),
            None => Ok(Action::await_change()),
        }
    }

    /// Create-or-update a single child idempotently. Only the operator-owned
    /// projection is written; a second pass with unchanged inputs performs
    /// zero writes.
    async fn apply<K>(
        &self,
        namespace: &str,
        cluster: &OSRMCluster,
        name: &str,
        build: impl Fn() -> K,
        update: impl Fn(&mut K),
    ) -> Result<()>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + Debug
            + DeserializeOwned
            + Serialize,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);

        let existing = match api.get_opt(name).await? {
            Some(existing) => existing,
            None => {
                let mut fresh = build();
                update(&mut fresh);
                stamp_child(&mut fresh, cluster);

                match api.create(&PostParams::default(), &fresh).await {
                    Ok(_) => {
                        info!("Created {} {}/{}", K::kind(&()), namespace, name);
                        return Ok(());
                    }
                    // Lost a create race; re-read and fall through to update
                    Err(kube::Error::Api(ae)) if ae.code == 409 => api.get(name).await?,
                    Err(e) => return Err(e.into()),
                }
            }
        };

        let uid = cluster.metadata.uid.as_deref().unwrap_or_default();
        if !is_owned_by(existing.meta(), uid) {
            return Err(OperatorError::ForeignObject(format!(
                "{} {}/{} exists but is not owned by OSRMCluster {}",
                K::kind(&()),
                namespace,
                name,
                cluster.name_any()
            )));
        }

        let mut desired = existing.clone();
        update(&mut desired);
        stamp_child(&mut desired, cluster);

        if serde_json::to_value(&desired)? != serde_json::to_value(&existing)? {
            // resourceVersion carried over from the read; a conflicting
            // concurrent write surfaces as 409 and the pass is requeued.
            api.replace(name, &PostParams::default(), &desired).await?;
            info!("Updated {} {}/{}", K::kind(&()), namespace, name);
        }

        Ok(())
    }

    /// Snapshot every owned child of this cluster, listed per kind by
    /// instance label and filtered on owner UID.
    async fn observe(&self, cluster: &OSRMCluster, namespace: &str) -> Result<ObservedChildren> {
        let uid = cluster.metadata.uid.clone().unwrap_or_default();
        let lp = instance_list_params(cluster);

        Ok(ObservedChildren {
            deployments: self.list_owned(namespace, &lp, &uid).await?,
            services: self.list_owned(namespace, &lp, &uid).await?,
            config_maps: self.list_owned(namespace, &lp, &uid).await?,
            persistent_volume_claims: self.list_owned(namespace, &lp, &uid).await?,
            jobs: self.list_owned(namespace, &lp, &uid).await?,
            horizontal_pod_autoscalers: self.list_owned(namespace, &lp, &uid).await?,
            pod_disruption_budgets: self.list_owned(namespace, &lp, &uid).await?,
        })
    }

    async fn list_owned<K>(
        &self,
        namespace: &str,
        lp: &ListParams,
        owner_uid: &str,
    ) -> Result<Vec<K>>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + Debug
            + DeserializeOwned,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        let list = api.list(lp).await?;
        Ok(list
            .items
            .into_iter()
            .filter(|item| is_owned_by(item.meta(), owner_uid))
            .collect())
    }

    /// Delete every owned child whose generation label does not match the
    /// cluster's current generation. Handles profile removals and renames;
    /// children of other clusters are never touched (owner-UID filter).
    async fn collect_garbage(&self, cluster: &OSRMCluster, namespace: &str) -> Result<()> {
        self.gc_kind::<Deployment>(cluster, namespace).await?;
        self.gc_kind::<Service>(cluster, namespace).await?;
        self.gc_kind::<ConfigMap>(cluster, namespace).await?;
        self.gc_kind::<HorizontalPodAutoscaler>(cluster, namespace)
            .await?;
        self.gc_kind::<PodDisruptionBudget>(cluster, namespace)
            .await?;
        self.gc_kind::<Job>(cluster, namespace).await?;
        // PVC deletion may hang on volume finalizers; issue the delete and
        // move on, never block the reconcile on its disappearance.
        self.gc_kind::<PersistentVolumeClaim>(cluster, namespace)
            .await?;
        Ok(())
    }

    async fn gc_kind<K>(&self, cluster: &OSRMCluster, namespace: &str) -> Result<()>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + Debug
            + DeserializeOwned,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        let uid = cluster.metadata.uid.clone().unwrap_or_default();
        let generation = cluster.metadata.generation.unwrap_or(0);

        let list = api.list(&instance_list_params(cluster)).await?;
        for item in list.items {
            if !is_owned_by(item.meta(), &uid) || !is_stale_generation(item.meta(), generation) {
                continue;
            }
            let name = item.name_any();
            info!(
                "Collecting stale {} {}/{} (cluster generation {})",
                K::kind(&()),
                namespace,
                name,
                generation
            );
            match api.delete(&name, &DeleteParams::background()).await {
                Ok(_) => {}
                Err(kube::Error::Api(ae)) if ae.code == 404 => {}
                Err(e) => return Err(e.into()),
            }
        }

        Ok(())
    }

    /// Ensure the finalizer is present on the resource
    async fn ensure_finalizer(&self, cluster: &OSRMCluster, namespace: &str) -> Result<()> {
        let finalizers = cluster.metadata.finalizers.as_deref().unwrap_or_default();
        if finalizers.contains(&CLUSTER_FINALIZER.to_string()) {
            return Ok(());
        }

        let clusters: Api<OSRMCluster> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({
            "apiVersion": OSRMCluster::api_version(&()),
            "kind": OSRMCluster::kind(&()),
            "metadata": {
                "finalizers": [CLUSTER_FINALIZER]
            }
        });
        clusters
            .patch(
                &cluster.name_any(),
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&patch),
            )
            .await?;

        Ok(())
    }

    /// Handle deletion: children cascade through their owner references, so
    /// only the finalizer needs removing.
    async fn handle_deletion(
        &self,
        cluster: &OSRMCluster,
        namespace: &str,
    ) -> std::result::Result<Action, OperatorError> {
        let name = cluster.name_any();
        info!("Handling deletion of OSRMCluster {}/{}", namespace, name);

        let clusters: Api<OSRMCluster> = Api::namespaced(self.client.clone(), namespace);
        let finalizers: Vec<String> = cluster
            .metadata
            .finalizers
            .as_deref()
            .unwrap_or_default()
            .iter()
            .filter(|f| f.as_str() != CLUSTER_FINALIZER)
            .cloned()
            .collect();

        let patch = serde_json::json!({
            "metadata": {
                "finalizers": finalizers
            }
        });
        clusters
            .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;

        info!("Finalizer removed for OSRMCluster {}/{}", namespace, name);
        Ok(Action::await_change())
    }

    /// Write the status subresource; a conflict is retried once, then
    /// deferred to the next reconcile.
    async fn update_status(
        &self,
        cluster: &OSRMCluster,
        namespace: &str,
        status: crate::crd::ClusterStatus,
    ) -> Result<()> {
        let clusters: Api<OSRMCluster> = Api::namespaced(self.client.clone(), namespace);
        let name = cluster.name_any();
        let patch = serde_json::json!({ "status": status });

        match clusters
            .patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                clusters
                    .patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
                    .await?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn instance_list_params(cluster: &OSRMCluster) -> ListParams {
    ListParams::default().labels(&format!(
        "app.kubernetes.io/instance={}",
        cluster.name_any()
    ))
}

/// Stamp the metadata every child must carry: standard labels, the cluster's
/// current generation, and the controller owner reference.
fn stamp_child<K>(obj: &mut K, cluster: &OSRMCluster)
where
    K: Resource<DynamicType = ()>,
{
    let generation = cluster.metadata.generation.unwrap_or(0);
    let meta = obj.meta_mut();
    let labels = meta.labels.get_or_insert_with(Default::default);
    for (key, value) in standard_labels(cluster) {
        labels.insert(key, value);
    }
    labels.insert(GENERATION_LABEL_KEY.to_string(), generation.to_string());
    meta.owner_references = Some(vec![owner_reference(cluster)]);
}
