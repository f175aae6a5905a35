//! Handshake with AKO on a workload cluster before its finalizer is released.
//!
//! AKO owns the virtual services and pools it created on AVI. The operator
//! only asks it to delete them and waits until it reports completion.

use std::time::Duration;

use futures::{FutureExt, future::BoxFuture};
use k8s_openapi::api::{apps::v1::StatefulSet, core::v1::ConfigMap};
use kube::{
    Api, ResourceExt,
    api::{Patch, PatchParams},
};
use serde_json::json;
use tracing::*;

use crate::{
    Error, Result, addon,
    crd::{
        AKODeploymentConfig, AVI_NAMESPACE, AVI_RESOURCE_CLEANUP_REASON,
        AVI_RESOURCE_CLEANUP_SUCCEEDED, AVI_USER_CLEANUP_SUCCEEDED, CLUSTER_FINALIZER, Cluster,
    },
    events_helper::emit_info,
    phases::{PhaseContext, ReconcileResult},
    remote, selector,
};

pub const AKO_STATEFULSET_NAME: &str = "ako";
pub const AKO_CONFIGMAP_NAME: &str = "avi-k8s-config";
pub const DELETE_CONFIG_KEY: &str = "deleteConfig";
pub const DELETION_STATUS_ANNOTATION: &str = "AviObjectDeletionStatus";
pub const DELETION_DONE: &str = "Done";

/// Older AKO releases report completion through a StatefulSet condition instead
const AKO_CONDITION_TYPE: &str = "akoStatus";
const AKO_DELETION_DONE_MESSAGE: &str = "objDeletionDone";

/// Poll interval while AKO is still deleting
pub const CLEANUP_REQUEUE: Duration = Duration::from_secs(1);

/// Whether AKO finished deleting its AVI objects; an absent StatefulSet counts as finished.
pub fn deletion_finished(statefulset: Option<&StatefulSet>) -> bool {
    let Some(sts) = statefulset else {
        return true;
    };
    if sts
        .annotations()
        .get(DELETION_STATUS_ANNOTATION)
        .is_some_and(|v| v == DELETION_DONE)
    {
        return true;
    }
    sts.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions.iter().any(|c| {
                c.type_ == AKO_CONDITION_TYPE
                    && c.message.as_deref() == Some(AKO_DELETION_DONE_MESSAGE)
            })
        })
}

/// Whether the AKO ConfigMap still needs `deleteConfig` set.
pub fn needs_delete_flag(cm: &ConfigMap) -> bool {
    cm.data
        .as_ref()
        .and_then(|d| d.get(DELETE_CONFIG_KEY))
        .is_none_or(|v| v != "true")
}

/// Cluster phase: signals AKO to clean up and records when it is done.
pub fn reconcile_resource_cleanup<'a>(
    ctx: &'a PhaseContext,
    adc: &'a AKODeploymentConfig,
    cluster: &'a mut Cluster,
) -> BoxFuture<'a, Result<ReconcileResult>> {
    async move {
        let name = cluster.namespaced_name();
        if cluster.is_condition_true(AVI_RESOURCE_CLEANUP_SUCCEEDED) {
            return Ok(ReconcileResult::done());
        }
        if cluster.get_condition(AVI_RESOURCE_CLEANUP_SUCCEEDED).is_none() {
            cluster.mark_false(
                AVI_RESOURCE_CLEANUP_SUCCEEDED,
                AVI_RESOURCE_CLEANUP_REASON,
                "Info",
                "Cleaning up the AVI load balancing resources before deletion",
            );
            info!(cluster = %name, "triggering AKO cleanup");
            emit_info(
                &ctx.recorder,
                adc,
                "AviResourceCleanup",
                "CleanupAviResources",
                Some(format!("cleaning up AVI resources of cluster {name}")),
            )
            .await;
        }

        let remote = remote::workload_client(
            &ctx.client,
            &cluster.namespace().unwrap_or_default(),
            &cluster.name_any(),
        )
        .await?;

        let configmaps: Api<ConfigMap> = Api::namespaced(remote.clone(), AVI_NAMESPACE);
        let finished = match configmaps
            .get_opt(AKO_CONFIGMAP_NAME)
            .await
            .map_err(Error::KubeError)?
        {
            None => {
                info!(cluster = %name, "AKO ConfigMap not found, considering cleanup finished");
                true
            }
            Some(cm) => {
                if needs_delete_flag(&cm) {
                    let patch = json!({ "data": { DELETE_CONFIG_KEY: "true" } });
                    configmaps
                        .patch(AKO_CONFIGMAP_NAME, &PatchParams::default(), &Patch::Merge(&patch))
                        .await
                        .map_err(Error::KubeError)?;
                    debug!(cluster = %name, "set deleteConfig in AKO ConfigMap");
                }
                let sts = Api::<StatefulSet>::namespaced(remote, AVI_NAMESPACE)
                    .get_opt(AKO_STATEFULSET_NAME)
                    .await
                    .map_err(Error::KubeError)?;
                deletion_finished(sts.as_ref())
            }
        };

        if !finished {
            debug!(cluster = %name, "AKO deletion in progress");
            return Ok(ReconcileResult::requeue_after(CLEANUP_REQUEUE));
        }
        info!(cluster = %name, "AKO finished cleanup");
        cluster.mark_true(AVI_RESOURCE_CLEANUP_SUCCEEDED);
        Ok(ReconcileResult::done())
    }
    .boxed()
}

/// Cluster phase: drops the cluster finalizer once AKO and the AVI user are cleaned up.
///
/// When the ADC is going away while the cluster stays, the cluster is also
/// detached: labels, add-on secret and cleanup conditions are removed.
pub fn release_cluster<'a>(
    ctx: &'a PhaseContext,
    _adc: &'a AKODeploymentConfig,
    cluster: &'a mut Cluster,
) -> BoxFuture<'a, Result<ReconcileResult>> {
    async move {
        if !cluster.is_condition_true(AVI_RESOURCE_CLEANUP_SUCCEEDED)
            || !cluster.is_condition_true(AVI_USER_CLEANUP_SUCCEEDED)
        {
            return Ok(ReconcileResult::done());
        }
        let name = cluster.namespaced_name();
        if !cluster.is_deleting() {
            addon::delete_addon_secret(&ctx.client, cluster).await?;
            selector::remove_cluster_label(cluster);
            cluster.remove_condition(AVI_RESOURCE_CLEANUP_SUCCEEDED);
            cluster.remove_condition(AVI_USER_CLEANUP_SUCCEEDED);
            info!(cluster = %name, "cluster detached from AKODeploymentConfig");
        }
        let finalizers = cluster.finalizers_mut();
        if let Some(pos) = finalizers.iter().position(|f| f == CLUSTER_FINALIZER) {
            finalizers.remove(pos);
            info!(cluster = %name, "removed finalizer");
        }
        Ok(ReconcileResult::done())
    }
    .boxed()
}
