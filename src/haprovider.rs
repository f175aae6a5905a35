//! Control plane HA through AVI: a LoadBalancer Service per cluster whose VIP
//! becomes the cluster's control plane endpoint.

use std::{collections::BTreeMap, net::IpAddr};

use k8s_openapi::{
    api::core::v1::{
        EndpointAddress, EndpointPort, EndpointSubset, Endpoints, Service, ServicePort, ServiceSpec,
    },
    apimachinery::pkg::util::intstr::IntOrString,
};
use kube::{
    Api, Client, Resource, ResourceExt,
    api::{DeleteParams, ObjectMeta, Patch, PatchParams, PostParams},
};
use serde_json::json;
use tracing::*;

use crate::{
    Error, Result,
    config::OperatorConfig,
    crd::{
        AKODeploymentConfig, AviInfraSetting, Cluster, HA_SERVICE_DEFERRED_REQUEUE, MANAGER_NAME,
        TKG_SYSTEM_NAMESPACE,
    },
    phases::ReconcileResult,
};

pub const HA_SERVICE_SUFFIX: &str = "control-plane";
pub const HA_SKIP_NODEPORT_ANNOTATION: &str = "skipnodeport.ako.vmware.com/enabled";
pub const HA_AVI_INFRA_SETTING_ANNOTATION: &str = "aviinfrasetting.ako.vmware.com/name";
pub const HA_SERVICE_CLUSTER_NAME_ANNOTATION: &str = "tkg.tanzu.vmware.com/cluster-name";
pub const HA_SERVICE_CLUSTER_NAMESPACE_ANNOTATION: &str = "tkg.tanzu.vmware.com/cluster-namespace";
pub const HA_SERVICE_BOOTSTRAP_FINALIZER: &str = "ako-operator.network.tkg.tanzu.vmware.com/ha-service";

pub fn ha_service_name(cluster: &Cluster) -> String {
    format!("{}-{HA_SERVICE_SUFFIX}", cluster.namespaced_name())
}

/// Whether the Service must survive a pivot away from the bootstrap cluster.
fn keeps_bootstrap_finalizer(cluster: &Cluster, config: &OperatorConfig) -> bool {
    config.bootstrap_cluster || cluster.namespace().as_deref() == Some(TKG_SYSTEM_NAMESPACE)
}

/// Desired HA Service for `cluster` exposing `port`.
pub fn ha_service(
    cluster: &Cluster,
    port: i32,
    infra_setting: Option<&str>,
    bootstrap: bool,
) -> Service {
    let mut annotations = BTreeMap::from([
        (HA_SKIP_NODEPORT_ANNOTATION.to_string(), "true".to_string()),
        (HA_SERVICE_CLUSTER_NAME_ANNOTATION.to_string(), cluster.name_any()),
        (
            HA_SERVICE_CLUSTER_NAMESPACE_ANNOTATION.to_string(),
            cluster.namespace().unwrap_or_default(),
        ),
    ]);
    if let Some(name) = infra_setting {
        annotations.insert(HA_AVI_INFRA_SETTING_ANNOTATION.to_string(), name.to_string());
    }

    let (finalizers, owner_references) = if bootstrap {
        (Some(vec![HA_SERVICE_BOOTSTRAP_FINALIZER.to_string()]), None)
    } else {
        (None, cluster.owner_ref(&()).map(|o| vec![o]))
    };

    // an IP or a hostname
    let load_balancer_ip = cluster
        .control_plane_endpoint()
        .ok()
        .filter(|ip| !ip.is_empty());

    Service {
        metadata: ObjectMeta {
            name: Some(ha_service_name(cluster)),
            namespace: cluster.namespace(),
            annotations: Some(annotations),
            finalizers,
            owner_references,
            ..ObjectMeta::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("LoadBalancer".to_string()),
            ports: Some(vec![ServicePort {
                protocol: Some("TCP".to_string()),
                port,
                target_port: Some(IntOrString::Int(port)),
                ..ServicePort::default()
            }]),
            load_balancer_ip,
            ..ServiceSpec::default()
        }),
        ..Service::default()
    }
}

/// First load balancer ingress address that is a literal IP.
pub fn service_external_ip(service: &Service) -> Option<String> {
    service
        .status
        .as_ref()?
        .load_balancer
        .as_ref()?
        .ingress
        .as_ref()?
        .iter()
        .filter_map(|i| i.ip.as_deref())
        .find(|ip| ip.parse::<IpAddr>().is_ok())
        .map(str::to_string)
}

pub fn ha_endpoints(service: &Service, ip: &str, port: i32) -> Endpoints {
    Endpoints {
        metadata: ObjectMeta {
            name: service.metadata.name.clone(),
            namespace: service.metadata.namespace.clone(),
            ..ObjectMeta::default()
        },
        subsets: Some(vec![EndpointSubset {
            addresses: Some(vec![EndpointAddress {
                ip: ip.to_string(),
                ..EndpointAddress::default()
            }]),
            ports: Some(vec![EndpointPort {
                port,
                protocol: Some("TCP".to_string()),
                ..EndpointPort::default()
            }]),
            ..EndpointSubset::default()
        }]),
        ..Endpoints::default()
    }
}

/// Sets the cluster's control plane endpoint to the VIP unless one is already set.
///
/// Returns whether the cluster changed.
pub fn set_control_plane_endpoint(cluster: &mut Cluster, ip: &str, port: i32) -> bool {
    let current = cluster.spec.control_plane_endpoint.get_or_insert_default();
    if !current.host.is_empty() {
        return false;
    }
    current.host = ip.to_string();
    current.port = port;
    cluster.set_control_plane_endpoint_variable(ip);
    true
}

/// Name of the ADC's AviInfraSetting when the HA Service should use it and it exists.
async fn infra_setting_for(
    client: &Client,
    adc: Option<&AKODeploymentConfig>,
    config: &OperatorConfig,
) -> Result<(Option<String>, bool)> {
    let Some(adc) = adc.filter(|a| a.has_distinct_control_plane_network()) else {
        return Ok((None, false));
    };
    if config.bootstrap_cluster {
        return Ok((None, false));
    }
    let name = adc.infra_setting_name();
    let found = Api::<AviInfraSetting>::all(client.clone())
        .get_opt(&name)
        .await
        .map_err(Error::KubeError)?;
    match found {
        Some(_) => Ok((Some(name), false)),
        None => {
            info!(setting = %name, "AviInfraSetting not created yet, HA service annotation deferred");
            Ok((None, true))
        }
    }
}

/// Ensures the HA Service and Endpoints for `cluster` and points the cluster at the VIP.
pub async fn reconcile_ha_service(
    client: &Client,
    config: &OperatorConfig,
    cluster: &mut Cluster,
    adc: Option<&AKODeploymentConfig>,
) -> Result<ReconcileResult> {
    let ns = cluster.namespace().unwrap_or_default();
    let port = cluster.control_plane_endpoint_port(config)?;
    let (infra_setting, deferred) = infra_setting_for(client, adc, config).await?;
    let services: Api<Service> = Api::namespaced(client.clone(), &ns);
    let name = ha_service_name(cluster);

    let service = match services.get_opt(&name).await.map_err(Error::KubeError)? {
        None => {
            let desired = ha_service(
                cluster,
                port,
                infra_setting.as_deref(),
                keeps_bootstrap_finalizer(cluster, config),
            );
            info!(service = %name, "creating HA service");
            services
                .create(&PostParams::default(), &desired)
                .await
                .map_err(Error::KubeError)?
        }
        Some(existing) => match infra_setting.as_deref() {
            Some(setting)
                if existing.annotations().get(HA_AVI_INFRA_SETTING_ANNOTATION).map(String::as_str)
                    != Some(setting) =>
            {
                let patch = json!({
                    "metadata": { "annotations": { HA_AVI_INFRA_SETTING_ANNOTATION: setting } }
                });
                services
                    .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
                    .await
                    .map_err(Error::KubeError)?
            }
            _ => existing,
        },
    };

    let Some(ip) = service_external_ip(&service) else {
        return Err(Error::PreconditionNotMet(format!(
            "{name} service external ip is not ready"
        )));
    };

    let endpoints = ha_endpoints(&service, &ip, port);
    Api::<Endpoints>::namespaced(client.clone(), &ns)
        .patch(
            &name,
            &PatchParams::apply(MANAGER_NAME).force(),
            &Patch::Apply(&endpoints),
        )
        .await
        .map_err(Error::KubeError)?;

    if set_control_plane_endpoint(cluster, &ip, port) {
        info!(cluster = %cluster.namespaced_name(), endpoint = %ip, "control plane endpoint set");
    }

    Ok(ha_service_result(deferred))
}

fn ha_service_result(deferred: bool) -> ReconcileResult {
    if deferred {
        ReconcileResult::requeue_after(HA_SERVICE_DEFERRED_REQUEUE)
    } else {
        ReconcileResult::done()
    }
}

/// Tears down a bootstrap-held HA Service once its cluster is deleted.
pub async fn reconcile_ha_service_delete(client: &Client, cluster: &Cluster) -> Result<()> {
    let ns = cluster.namespace().unwrap_or_default();
    let name = ha_service_name(cluster);
    let services: Api<Service> = Api::namespaced(client.clone(), &ns);
    let Some(service) = services.get_opt(&name).await.map_err(Error::KubeError)? else {
        return Ok(());
    };
    if !service.finalizers().iter().any(|f| f == HA_SERVICE_BOOTSTRAP_FINALIZER) {
        return Ok(());
    }

    match Api::<Endpoints>::namespaced(client.clone(), &ns)
        .delete(&name, &DeleteParams::default())
        .await
    {
        Ok(_) => {}
        Err(kube::Error::Api(resp)) if resp.code == 404 => {}
        Err(e) => return Err(Error::KubeError(e)),
    }

    let remaining: Vec<&String> = service
        .finalizers()
        .iter()
        .filter(|f| *f != HA_SERVICE_BOOTSTRAP_FINALIZER)
        .collect();
    let patch = json!({ "metadata": { "finalizers": remaining } });
    services
        .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
        .map_err(Error::KubeError)?;

    match services.delete(&name, &DeleteParams::default()).await {
        Ok(_) => {}
        Err(kube::Error::Api(resp)) if resp.code == 404 => {}
        Err(e) => return Err(Error::KubeError(e)),
    }
    info!(service = %name, "HA service removed");
    Ok(())
}
