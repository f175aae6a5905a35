//! Reconciles AKODeploymentConfigs: AVI-side configuration first, then every
//! selected cluster.

use std::{sync::Arc, time::Duration};

use futures::{FutureExt, future::BoxFuture};
use kube::{
    Api, ResourceExt,
    api::{Patch, PatchParams},
};
use serde_json::json;
use tracing::*;

use crate::{
    Error, Result, addon, cleanup,
    conditions::{Conditions, READY, REASON_RECONCILE_FAILED, REASON_RECONCILE_SUCCEEDED},
    crd::{ADC_FINALIZER, AKODeploymentConfig},
    network, patch,
    phases::{
        ClusterPhase, Phase, PhaseContext, ReconcileResult, Shared, labeled_clusters,
        reconcile_clusters, run_phases,
    },
    user,
};

mod main;
pub use main::*;

/// Requeue while clusters are still being released from a deleted ADC
pub const DRAIN_REQUEUE: Duration = Duration::from_secs(5);

pub static CLUSTER_PHASES: [ClusterPhase; 3] = [
    addon::add_cluster_finalizer,
    user::reconcile_avi_user,
    addon::reconcile_addon_secret,
];

pub static CLUSTER_DELETE_PHASES: [ClusterPhase; 4] = [
    addon::reconcile_addon_secret_delete,
    cleanup::reconcile_resource_cleanup,
    user::reconcile_avi_user_delete,
    cleanup::release_cluster,
];

pub static ADC_PHASES: [Phase; 5] = [
    init_avi,
    network::reconcile_network_subnets,
    network::reconcile_cloud_usable_network,
    network::reconcile_avi_infra_setting,
    reconcile_selected_clusters,
];

pub static ADC_DELETE_PHASES: [Phase; 2] = [
    network::reconcile_avi_infra_setting_delete,
    reconcile_selected_clusters_delete,
];

/// Opens the AVI session and backfills the controller version into `spec.controllerVersion`.
pub fn init_avi<'a>(
    ctx: &'a PhaseContext,
    adc: &'a AKODeploymentConfig,
) -> BoxFuture<'a, Result<ReconcileResult>> {
    async move {
        let avi = ctx.avi_client(adc).await?;
        if adc.spec.controller_version.as_deref().is_some_and(|v| !v.is_empty()) {
            return Ok(ReconcileResult::done());
        }
        let version = avi.controller_version().await?;
        let patch = json!({ "spec": { "controllerVersion": version } });
        Api::<AKODeploymentConfig>::all(ctx.client.clone())
            .patch(&adc.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(Error::KubeError)?;
        info!(adc = %adc.name_any(), %version, "recorded AVI controller version");
        Ok(ReconcileResult::done())
    }
    .boxed()
}

fn reconcile_selected_clusters<'a>(
    ctx: &'a PhaseContext,
    adc: &'a AKODeploymentConfig,
) -> BoxFuture<'a, Result<ReconcileResult>> {
    reconcile_clusters(ctx, adc, &CLUSTER_PHASES, &CLUSTER_DELETE_PHASES).boxed()
}

fn reconcile_selected_clusters_delete<'a>(
    ctx: &'a PhaseContext,
    adc: &'a AKODeploymentConfig,
) -> BoxFuture<'a, Result<ReconcileResult>> {
    reconcile_clusters(ctx, adc, &CLUSTER_DELETE_PHASES, &CLUSTER_DELETE_PHASES).boxed()
}

fn has_finalizer(adc: &AKODeploymentConfig) -> bool {
    adc.finalizers().iter().any(|f| f == ADC_FINALIZER)
}

/// Records the outcome of a pass in the ADC status.
pub fn set_ready(adc: &mut AKODeploymentConfig, outcome: &Result<ReconcileResult>) {
    let generation = adc.metadata.generation.unwrap_or_default();
    let status = adc.status.get_or_insert_with(Default::default);
    match outcome {
        Ok(_) => {
            status.upsert_bool(READY, true, REASON_RECONCILE_SUCCEEDED, None, generation);
            status.observed_generation = Some(generation);
        }
        Err(e) => {
            let message = e.to_string();
            status.upsert_bool(READY, false, REASON_RECONCILE_FAILED, Some(&message), generation);
        }
    }
}

/// One reconcile pass for an ADC; returns the merged phase result.
pub async fn reconcile_adc_phases(
    client: kube::Client,
    recorder: kube::runtime::events::Recorder,
    shared: Arc<Shared>,
    adc: &AKODeploymentConfig,
) -> Result<ReconcileResult> {
    let api: Api<AKODeploymentConfig> = Api::all(client.clone());
    let phase_ctx = PhaseContext::new(client.clone(), recorder, shared);
    let name = adc.name_any();
    let mut original = adc.clone();
    let mut adc = adc.clone();

    if adc.metadata.deletion_timestamp.is_none() {
        if !has_finalizer(&adc) {
            adc.finalizers_mut().push(ADC_FINALIZER.to_string());
            patch::patch_object(&api, &original, &adc).await?;
            debug!(adc = %name, "finalizer added");
            original = adc.clone();
        }
        let outcome = run_phases(&phase_ctx, &adc, &ADC_PHASES).await;
        set_ready(&mut adc, &outcome);
        patch::patch_object(&api, &original, &adc).await?;
        return outcome;
    }

    if !has_finalizer(&adc) {
        return Ok(ReconcileResult::done());
    }
    info!(adc = %name, "releasing clusters before deletion");
    let mut outcome = run_phases(&phase_ctx, &adc, &ADC_DELETE_PHASES).await;
    if outcome.is_ok() {
        if labeled_clusters(&client, &adc).await?.is_empty() {
            adc.finalizers_mut().retain(|f| f != ADC_FINALIZER);
            info!(adc = %name, "all clusters released, removing finalizer");
        } else {
            outcome = outcome.map(|r| r.merge(ReconcileResult::requeue_after(DRAIN_REQUEUE)));
        }
    }
    patch::patch_object(&api, &original, &adc).await?;
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_condition_tracks_outcome() {
        let mut adc = AKODeploymentConfig::new("ako-a", Default::default());
        adc.metadata.generation = Some(3);

        set_ready(&mut adc, &Err(Error::PreconditionNotMet("cloud has no IPAM".into())));
        let status = adc.status.as_ref().unwrap();
        let ready = status.get_condition(READY).unwrap();
        assert_eq!(ready.status, "False");
        assert_eq!(ready.reason, REASON_RECONCILE_FAILED);
        assert!(ready.message.contains("cloud has no IPAM"));
        assert_eq!(status.observed_generation, None);

        set_ready(&mut adc, &Ok(ReconcileResult::done()));
        let status = adc.status.as_ref().unwrap();
        assert!(status.is_condition_true(READY));
        assert_eq!(status.observed_generation, Some(3));
    }
}
