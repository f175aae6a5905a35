use std::{sync::Arc, time::Duration};

use futures::future::BoxFuture;
use kube::{
    Api, Client, ResourceExt,
    api::ListParams,
    runtime::{controller::Action, events::Recorder},
};
use tokio::sync::OnceCell;
use tracing::*;

use crate::{
    Error, ErrorKind, Result,
    avi::{AviClient, AviClientConfig, AviClientPool},
    config::OperatorConfig,
    crd::{AKODeploymentConfig, AVI_CLUSTER_LABEL, Cluster},
    helper, patch, selector,
};

/// Default resync period after a clean pass
pub const RESYNC_PERIOD: Duration = Duration::from_secs(5 * 60);

/// State shared by every controller in the process.
pub struct Shared {
    pub config: OperatorConfig,
    pub avi_pool: AviClientPool,
}

impl Shared {
    pub fn new(config: OperatorConfig) -> Self {
        Self {
            config,
            avi_pool: AviClientPool::default(),
        }
    }
}

/// Outcome of one phase; errors travel separately.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReconcileResult {
    pub requeue_after: Option<Duration>,
}

impl ReconcileResult {
    pub fn done() -> Self {
        Self::default()
    }

    pub fn requeue_after(after: Duration) -> Self {
        Self {
            requeue_after: Some(after),
        }
    }

    /// Keeps the lowest non-zero requeue of the two.
    pub fn merge(self, other: Self) -> Self {
        let pick = match (self.requeue_after, other.requeue_after) {
            (None, b) => b,
            (a, None) => a,
            (Some(a), Some(b)) if a.is_zero() => Some(b),
            (Some(a), Some(b)) if b.is_zero() => Some(a),
            (Some(a), Some(b)) => Some(a.min(b)),
        };
        Self {
            requeue_after: pick.filter(|d| !d.is_zero()),
        }
    }

    pub fn into_action(self) -> Action {
        Action::requeue(self.requeue_after.unwrap_or(RESYNC_PERIOD))
    }
}

/// Everything a phase may need for one ADC reconcile pass.
pub struct PhaseContext {
    pub client: Client,
    pub recorder: Recorder,
    pub shared: Arc<Shared>,
    avi: OnceCell<Arc<dyn AviClient>>,
}

impl PhaseContext {
    pub fn new(client: Client, recorder: Recorder, shared: Arc<Shared>) -> Self {
        Self {
            client,
            recorder,
            shared,
            avi: OnceCell::new(),
        }
    }

    pub fn config(&self) -> &OperatorConfig {
        &self.shared.config
    }

    /// AVI session for the ADC's controller, created on first use.
    pub async fn avi_client(&self, adc: &AKODeploymentConfig) -> Result<Arc<dyn AviClient>> {
        self.avi
            .get_or_try_init(|| async {
                let (username, password) = helper::admin_credentials(&self.client, adc).await?;
                let ca = helper::controller_ca(&self.client, adc).await?;
                let version = adc
                    .spec
                    .controller_version
                    .clone()
                    .filter(|v| !v.is_empty())
                    .or_else(|| self.config().avi_controller_version.clone());
                let config = AviClientConfig {
                    controller: adc.spec.controller.clone(),
                    username,
                    password,
                    ca,
                    version,
                    tenant: adc.tenant_name().to_string(),
                };
                let client = self.shared.avi_pool.get_or_create(config).await?;
                info!(adc = %adc.name_any(), "AVI client initialized");
                Ok::<_, Error>(client)
            })
            .await
            .cloned()
    }
}

/// A step of the ADC pipeline.
pub type Phase<C = PhaseContext> =
    for<'a> fn(&'a C, &'a AKODeploymentConfig) -> BoxFuture<'a, Result<ReconcileResult>>;

/// A step of the per-cluster pipeline; mutations to the cluster are persisted after the pipeline.
pub type ClusterPhase<C = PhaseContext> = for<'a> fn(
    &'a C,
    &'a AKODeploymentConfig,
    &'a mut Cluster,
) -> BoxFuture<'a, Result<ReconcileResult>>;

fn collect(errors: Vec<Error>, result: ReconcileResult) -> Result<ReconcileResult> {
    match Error::aggregate(errors) {
        Some(e) => Err(e),
        None => Ok(result),
    }
}

/// Runs every phase in order, even after a failure, and aggregates the errors.
///
/// Only a `Fatal` error stops the pipeline early.
pub async fn run_phases<C>(
    ctx: &C,
    adc: &AKODeploymentConfig,
    phases: &[Phase<C>],
) -> Result<ReconcileResult> {
    let mut result = ReconcileResult::done();
    let mut errors = Vec::new();
    for phase in phases {
        match phase(ctx, adc).await {
            Ok(r) => result = result.merge(r),
            Err(e) => {
                let fatal = e.kind() == ErrorKind::Fatal;
                errors.push(e);
                if fatal {
                    break;
                }
            }
        }
    }
    collect(errors, result)
}

/// Runs the normal or the delete pipeline for one cluster depending on its deletion state.
pub async fn run_cluster_pipeline<C>(
    ctx: &C,
    adc: &AKODeploymentConfig,
    cluster: &mut Cluster,
    normal: &[ClusterPhase<C>],
    delete: &[ClusterPhase<C>],
) -> Result<ReconcileResult> {
    let phases = if cluster.is_deleting() { delete } else { normal };
    let mut result = ReconcileResult::done();
    let mut errors = Vec::new();
    for phase in phases {
        match phase(ctx, adc, cluster).await {
            Ok(r) => result = result.merge(r),
            Err(e) => {
                let fatal = e.kind() == ErrorKind::Fatal;
                errors.push(e);
                if fatal {
                    break;
                }
            }
        }
    }
    collect(errors, result)
}

/// Clusters currently carrying `adc`'s label, selected or not.
pub async fn labeled_clusters(client: &Client, adc: &AKODeploymentConfig) -> Result<Vec<Cluster>> {
    let selector = format!("{AVI_CLUSTER_LABEL}={}", adc.name_any());
    Ok(Api::<Cluster>::all(client.clone())
        .list(&ListParams::default().labels(&selector))
        .await
        .map_err(Error::KubeError)?
        .items)
}

/// Runs the cluster pipelines for every cluster the ADC is authoritative for,
/// persisting each cluster at its own exit.
pub async fn reconcile_clusters(
    ctx: &PhaseContext,
    adc: &AKODeploymentConfig,
    normal: &[ClusterPhase],
    delete: &[ClusterPhase],
) -> Result<ReconcileResult> {
    let api: Api<Cluster> = Api::all(ctx.client.clone());
    let all = api
        .list(&ListParams::default())
        .await
        .map_err(Error::KubeError)?
        .items;
    let clusters = selector::select_clusters(adc, all, ctx.config())?;
    if clusters.is_empty() {
        debug!(adc = %adc.name_any(), "no cluster matches the selector");
        return Ok(ReconcileResult::done());
    }

    let mut result = ReconcileResult::done();
    let mut errors = Vec::new();
    for original in clusters {
        let name = original.namespaced_name();
        match original.is_load_balancer_provider() {
            Ok(true) => {}
            Ok(false) => {
                info!(cluster = %name, "cluster uses kube-vip for load balancer services, skipping");
                continue;
            }
            Err(e) => {
                errors.push(e);
                continue;
            }
        }

        let mut cluster = original.clone();
        selector::apply_cluster_label(&mut cluster, adc);
        let outcome = run_cluster_pipeline(ctx, adc, &mut cluster, normal, delete).await;
        let ns = cluster.namespace().unwrap_or_default();
        let persisted = patch::patch_object(
            &Api::<Cluster>::namespaced(ctx.client.clone(), &ns),
            &original,
            &cluster,
        )
        .await;

        match outcome {
            Ok(r) => result = result.merge(r),
            Err(e) => {
                warn!(cluster = %name, "cluster pipeline failed: {e}");
                errors.push(e);
            }
        }
        if let Err(e) = persisted {
            error!(cluster = %name, "patch failed: {e}");
            errors.push(e);
        }
    }
    collect(errors, result)
}
