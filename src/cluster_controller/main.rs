use std::sync::Arc;

use k8s_openapi::api::core::v1::Service;
use kube::{
    Api, ResourceExt,
    runtime::{Controller, controller::Action, watcher},
};
use tracing::*;

use super::{Membership, relabel};
use crate::{
    Error, Result, addon,
    crd::{AKODeploymentConfig, CLUSTER_FINALIZER, Cluster},
    events_helper::emit_info,
    haprovider, patch,
    phases::{ReconcileResult, Shared},
    selector,
};

crate::controller_scaffold! {
    controller_ty: Cluster,
    reporter: "cluster-controller",
    run_fn: run_cluster,
    reconcile_fn: reconcile_cluster,
    error_policy_fn: cluster_error_policy,
    error_requeue_secs: 10,
    api_builder: |client: kube::Client| kube::Api::<Cluster>::all(client),
    watcher_config: kube::runtime::watcher::Config::default().any_semantic(),
    watches: |controller: Controller<Cluster>, client: kube::Client, _shared: Arc<Shared>| {
        controller.watches(
            Api::<Service>::all(client),
            watcher::Config::default(),
            |service: Service| selector::cluster_for_service(&service),
        )
    },
    preflight: |api: kube::Api<Cluster>| async move {
        if let Err(e) = api.list(&kube::api::ListParams::default().limit(1)).await {
            error!("Cluster API is not queryable; {e:?}. Is Cluster API installed?");
            std::process::exit(1);
        }
    }
}

async fn reconcile_cluster(cluster: Arc<Cluster>, ctx: Arc<Context>) -> Result<Action> {
    ctx.touch().await;
    let ns = cluster.namespace().unwrap_or_default();
    let name = cluster.namespaced_name();
    let api: Api<Cluster> = Api::namespaced(ctx.client.clone(), &ns);
    let config = ctx.shared.config.clone();

    let original = (*cluster).clone();
    let mut cluster = original.clone();
    let mut errors = Vec::new();
    let mut result = ReconcileResult::done();

    let adcs = Api::<AKODeploymentConfig>::all(ctx.client.clone())
        .list(&Default::default())
        .await
        .map_err(Error::KubeError)?
        .items;

    if cluster.is_control_plane_vip_provider(&config)? {
        if cluster.is_deleting() {
            if let Err(e) = haprovider::reconcile_ha_service_delete(&ctx.client, &cluster).await {
                errors.push(e);
            }
        } else {
            let adc = selector::adc_for_cluster(&adcs, &cluster);
            match haprovider::reconcile_ha_service(&ctx.client, &config, &mut cluster, adc).await {
                Ok(r) => result = result.merge(r),
                Err(e) => errors.push(e),
            }
            let host = |c: &Cluster| c.spec.control_plane_endpoint.as_ref().map(|e| e.host.clone());
            if let Some(endpoint) = host(&cluster).filter(|h| Some(h) != host(&original).as_ref()) {
                emit_info(
                    &ctx.recorder,
                    &cluster,
                    "ControlPlaneEndpointSet",
                    "ReconcileHAService",
                    Some(format!("control plane endpoint set to {endpoint}")),
                )
                .await;
            }
        }
    }

    if !config.bootstrap_cluster {
        match relabel(&adcs, &mut cluster) {
            Membership::Unmanaged => {
                debug!(cluster = %name, "cluster is not managed by any AKODeploymentConfig");
            }
            Membership::Orphaned => {
                info!(cluster = %name, "no AKODeploymentConfig selects the cluster, detaching");
                cluster.finalizers_mut().retain(|f| f != CLUSTER_FINALIZER);
                if let Err(e) = addon::delete_addon_secret(&ctx.client, &cluster).await {
                    errors.push(e);
                }
            }
            Membership::DefaultOnly => {
                debug!(cluster = %name, "cluster falls back to the default AKODeploymentConfig");
            }
            Membership::Claimed(adc) => {
                debug!(cluster = %name, %adc, "cluster claimed by AKODeploymentConfig");
            }
        }
    }

    if let Err(e) = patch::patch_object(&api, &original, &cluster).await {
        errors.push(e);
    }
    match Error::aggregate(errors) {
        Some(e) => Err(e),
        None => Ok(result.into_action()),
    }
}
