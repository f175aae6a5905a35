use std::sync::Arc;

use k8s_openapi::api::core::v1::Secret;
use kube::{
    Api, ResourceExt,
    runtime::{Controller, controller::Action, watcher},
};
use tracing::*;

use crate::{
    Result,
    crd::{AKODeploymentConfig, Cluster},
    phases::Shared,
    selector,
};

crate::controller_scaffold! {
    controller_ty: AKODeploymentConfig,
    reporter: "akodeploymentconfig-controller",
    run_fn: run_adc,
    reconcile_fn: reconcile_adc,
    error_policy_fn: adc_error_policy,
    error_requeue_secs: 10,
    api_builder: |client: kube::Client| kube::Api::<AKODeploymentConfig>::all(client),
    watcher_config: kube::runtime::watcher::Config::default().any_semantic(),
    watches: |controller: Controller<AKODeploymentConfig>, client: kube::Client, shared: Arc<Shared>| {
        let clusters_store = controller.store();
        let secrets_store = controller.store();
        controller
            .watches(
                Api::<Cluster>::all(client.clone()),
                watcher::Config::default(),
                move |cluster: Cluster| {
                    let adcs: Vec<AKODeploymentConfig> =
                        clusters_store.state().iter().map(|a| (**a).clone()).collect();
                    selector::adcs_for_cluster(&adcs, &cluster, &shared.config)
                },
            )
            .watches(
                Api::<Secret>::all(client),
                watcher::Config::default(),
                move |secret: Secret| {
                    let adcs: Vec<AKODeploymentConfig> =
                        secrets_store.state().iter().map(|a| (**a).clone()).collect();
                    selector::adcs_for_secret(&adcs, &secret)
                },
            )
    },
    preflight: |api: kube::Api<AKODeploymentConfig>| async move {
        if let Err(e) = api.list(&kube::api::ListParams::default().limit(1)).await {
            error!("AKODeploymentConfig CRD is not queryable; {e:?}. Is the CRD installed?");
            info!("Installation: cargo run --bin gencrd | kubectl apply -f -");
            std::process::exit(1);
        }
    }
}

async fn reconcile_adc(adc: Arc<AKODeploymentConfig>, ctx: Arc<Context>) -> Result<Action> {
    ctx.touch().await;
    info!("Reconciling AKODeploymentConfig \"{}\"", adc.name_any());
    let result = super::reconcile_adc_phases(
        ctx.client.clone(),
        ctx.recorder.clone(),
        ctx.shared.clone(),
        &adc,
    )
    .await?;
    Ok(result.into_action())
}
