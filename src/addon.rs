//! The add-on secret carrying AKO's data values for a cluster.

use std::collections::BTreeMap;

use futures::{FutureExt, future::BoxFuture};
use ipnet::IpNet;
use k8s_openapi::api::core::v1::Secret;
use kube::{
    Api, Client, ResourceExt,
    api::{DeleteParams, ObjectMeta, Patch, PatchParams},
};
use serde_json::json;
use tracing::*;

use crate::{
    Error, Result,
    crd::{
        AKODeploymentConfig, CLUSTER_FINALIZER, CLUSTER_IP_FAMILY_VALIDATION_REASON,
        CLUSTER_IP_FAMILY_VALIDATION_SUCCEEDED, Cluster, IpFamily, MANAGER_NAME,
    },
    events_helper::{emit_info, emit_warning},
    helper,
    phases::{PhaseContext, ReconcileResult},
    user,
    values::{AddonValues, set_delete_config},
};

pub const ADDON_NAME: &str = "load-balancer-and-ingress-service";
pub const ADDON_SECRET_TYPE: &str = "tkg.tanzu.vmware.com/addon";
pub const ADDON_TYPE_ANNOTATION: &str = "tkg.tanzu.vmware.com/addon-type";
pub const ADDON_TYPE: &str = "networking/load-balancer-and-ingress-service";
pub const ADDON_NAME_LABEL: &str = "tkg.tanzu.vmware.com/addon-name";
pub const CLUSTER_NAME_LABEL: &str = "tkg.tanzu.vmware.com/cluster-name";
pub const CLUSTERCTL_MOVE_LABEL: &str = "clusterctl.cluster.x-k8s.io/move";
pub const SKIP_PACKAGE_DELETION_ANNOTATION: &str = "tkg.tanzu.vmware.com/skip-packageinstall-deletion";
pub const VALUES_KEY: &str = "values.yaml";

pub fn addon_secret_name(cluster_name: &str) -> String {
    format!("{cluster_name}-{ADDON_NAME}-addon")
}

/// Add-on secret for `cluster` with `values` rendered into `values.yaml`.
pub fn addon_secret(cluster: &Cluster, values: &AddonValues) -> Result<Secret> {
    let name = cluster.name_any();
    Ok(Secret {
        metadata: ObjectMeta {
            name: Some(addon_secret_name(&name)),
            namespace: cluster.namespace(),
            annotations: Some(BTreeMap::from([(
                ADDON_TYPE_ANNOTATION.to_string(),
                ADDON_TYPE.to_string(),
            )])),
            labels: Some(BTreeMap::from([
                (ADDON_NAME_LABEL.to_string(), ADDON_NAME.to_string()),
                (CLUSTER_NAME_LABEL.to_string(), name),
                (CLUSTERCTL_MOVE_LABEL.to_string(), String::new()),
            ])),
            ..ObjectMeta::default()
        },
        type_: Some(ADDON_SECRET_TYPE.to_string()),
        string_data: Some(BTreeMap::from([(VALUES_KEY.to_string(), values.render()?)])),
        ..Secret::default()
    })
}

/// Checks that the cluster's primary IP family matches the ADC data network.
pub fn validate_ip_family(cluster: &Cluster, adc: &AKODeploymentConfig) -> Result<IpFamily> {
    let cluster_family = cluster.primary_ip_family()?;
    let cidr = &adc.spec.data_network.cidr;
    let net: IpNet = cidr
        .parse()
        .map_err(|e| Error::InvalidInput(format!("data network CIDR {cidr}: {e}")))?;
    let network_family = IpFamily::of(&net.addr());
    if cluster_family != network_family {
        return Err(Error::InvalidInput(format!(
            "cluster primary IP family {} does not match data network IP family {}",
            cluster_family.as_str(),
            network_family.as_str()
        )));
    }
    Ok(cluster_family)
}

pub fn add_cluster_finalizer<'a>(
    _ctx: &'a PhaseContext,
    _adc: &'a AKODeploymentConfig,
    cluster: &'a mut Cluster,
) -> BoxFuture<'a, Result<ReconcileResult>> {
    async move {
        if !cluster.finalizers().iter().any(|f| f == CLUSTER_FINALIZER) {
            debug!(cluster = %cluster.namespaced_name(), "adding finalizer");
            cluster.finalizers_mut().push(CLUSTER_FINALIZER.to_string());
        }
        Ok(ReconcileResult::done())
    }
    .boxed()
}

/// Cluster phase: renders and applies the add-on secret after validating the IP family.
pub fn reconcile_addon_secret<'a>(
    ctx: &'a PhaseContext,
    adc: &'a AKODeploymentConfig,
    cluster: &'a mut Cluster,
) -> BoxFuture<'a, Result<ReconcileResult>> {
    async move {
        let name = cluster.namespaced_name();
        if let Err(e) = validate_ip_family(cluster, adc) {
            cluster.mark_false(
                CLUSTER_IP_FAMILY_VALIDATION_SUCCEEDED,
                CLUSTER_IP_FAMILY_VALIDATION_REASON,
                "Warning",
                &e.to_string(),
            );
            emit_warning(
                &ctx.recorder,
                adc,
                "ClusterIpFamilyMismatch",
                "ValidateCluster",
                Some(format!("{name}: {e}")),
            )
            .await;
            return Err(e);
        }
        cluster.mark_true(CLUSTER_IP_FAMILY_VALIDATION_SUCCEEDED);

        let credentials = user::cluster_credentials(&ctx.client, adc, cluster).await?;
        let values = AddonValues::for_cluster(
            adc,
            &cluster.namespace().unwrap_or_default(),
            &cluster.name_any(),
        )?
        .with_credentials(credentials);
        let secret = addon_secret(cluster, &values)?;
        let secret_name = secret.name_any();

        let api: Api<Secret> =
            Api::namespaced(ctx.client.clone(), &cluster.namespace().unwrap_or_default());
        let existing = api.get_opt(&secret_name).await.map_err(Error::KubeError)?;
        let unchanged = existing.as_ref().is_some_and(|s| {
            helper::secret_string(s, VALUES_KEY).is_ok_and(|v| Some(&v) == secret_values(&secret))
        });
        if unchanged {
            return Ok(ReconcileResult::done());
        }

        api.patch(
            &secret_name,
            &PatchParams::apply(MANAGER_NAME).force(),
            &Patch::Apply(&secret),
        )
        .await
        .map_err(Error::KubeError)?;
        info!(cluster = %name, secret = %secret_name, "add-on secret applied");
        emit_info(
            &ctx.recorder,
            adc,
            "AddonSecretApplied",
            "ApplyAddonSecret",
            Some(format!("add-on secret {secret_name} applied for cluster {name}")),
        )
        .await;
        Ok(ReconcileResult::done())
    }
    .boxed()
}

fn secret_values(secret: &Secret) -> Option<&String> {
    secret.string_data.as_ref()?.get(VALUES_KEY)
}

/// Cluster phase: tells AKO to delete its AVI objects by flipping `delete_config`.
///
/// A cluster annotated to keep its package only gets the annotation copied to
/// the secret; the package itself is never touched here.
pub fn reconcile_addon_secret_delete<'a>(
    ctx: &'a PhaseContext,
    _adc: &'a AKODeploymentConfig,
    cluster: &'a mut Cluster,
) -> BoxFuture<'a, Result<ReconcileResult>> {
    async move {
        let namespace = cluster.namespace().unwrap_or_default();
        let secret_name = addon_secret_name(&cluster.name_any());
        let api: Api<Secret> = Api::namespaced(ctx.client.clone(), &namespace);
        let Some(secret) = api.get_opt(&secret_name).await.map_err(Error::KubeError)? else {
            debug!(cluster = %cluster.namespaced_name(), "add-on secret already deleted");
            return Ok(ReconcileResult::done());
        };

        let current = helper::secret_string(&secret, VALUES_KEY)?;
        let flipped = set_delete_config(&current)?;
        let skip_package_deletion = cluster.annotations().get(SKIP_PACKAGE_DELETION_ANNOTATION);
        let annotation_missing = skip_package_deletion
            .is_some_and(|_| !secret.annotations().contains_key(SKIP_PACKAGE_DELETION_ANNOTATION));
        if flipped == current && !annotation_missing {
            return Ok(ReconcileResult::done());
        }

        let mut patch = json!({ "stringData": { VALUES_KEY: flipped } });
        if let Some(value) = skip_package_deletion {
            patch["metadata"] = json!({ "annotations": { SKIP_PACKAGE_DELETION_ANNOTATION: value } });
        }
        api.patch(&secret_name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(Error::KubeError)?;
        info!(cluster = %cluster.namespaced_name(), "set delete_config in add-on secret");
        Ok(ReconcileResult::done())
    }
    .boxed()
}

/// Deletes the cluster's add-on secret; an absent secret is fine.
pub async fn delete_addon_secret(client: &Client, cluster: &Cluster) -> Result<()> {
    let namespace = cluster.namespace().unwrap_or_default();
    let secret_name = addon_secret_name(&cluster.name_any());
    match Api::<Secret>::namespaced(client.clone(), &namespace)
        .delete(&secret_name, &DeleteParams::default())
        .await
    {
        Ok(_) => {
            info!(cluster = %cluster.namespaced_name(), "add-on secret deleted");
            Ok(())
        }
        Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(()),
        Err(e) => Err(Error::KubeError(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ClusterNetwork, DataNetwork, NetworkRanges};

    fn cluster(pods: &[&str]) -> Cluster {
        let mut c = Cluster::new("wc1", Default::default());
        c.metadata.namespace = Some("ns1".into());
        if !pods.is_empty() {
            c.spec.cluster_network = Some(ClusterNetwork {
                pods: Some(NetworkRanges {
                    cidr_blocks: pods.iter().map(|s| s.to_string()).collect(),
                }),
                ..ClusterNetwork::default()
            });
        }
        c
    }

    fn adc(cidr: &str) -> AKODeploymentConfig {
        let mut adc = AKODeploymentConfig::new("ako-a", Default::default());
        adc.spec.data_network = DataNetwork {
            name: "vip".into(),
            cidr: cidr.into(),
            ip_pools: vec![],
        };
        adc
    }

    #[test]
    fn secret_carries_addon_metadata() {
        let c = cluster(&[]);
        let values = AddonValues::for_cluster(&adc("10.0.0.0/24"), "ns1", "wc1").unwrap();
        let secret = addon_secret(&c, &values).unwrap();

        assert_eq!(secret.name_any(), "wc1-load-balancer-and-ingress-service-addon");
        assert_eq!(secret.namespace().as_deref(), Some("ns1"));
        assert_eq!(secret.type_.as_deref(), Some(ADDON_SECRET_TYPE));
        assert_eq!(
            secret.annotations().get(ADDON_TYPE_ANNOTATION).map(String::as_str),
            Some(ADDON_TYPE)
        );
        let labels = secret.labels();
        assert_eq!(labels.get(ADDON_NAME_LABEL).map(String::as_str), Some(ADDON_NAME));
        assert_eq!(labels.get(CLUSTER_NAME_LABEL).map(String::as_str), Some("wc1"));
        assert_eq!(labels.get(CLUSTERCTL_MOVE_LABEL).map(String::as_str), Some(""));

        let rendered = secret_values(&secret).unwrap();
        assert!(rendered.starts_with("#@data/values\n"));
        assert!(rendered.contains("ako-ns1-wc1"));
    }

    #[test]
    fn ip_family_defaults_to_v4() {
        assert_eq!(validate_ip_family(&cluster(&[]), &adc("10.0.0.0/24")).unwrap(), IpFamily::V4);
    }

    #[test]
    fn ipv6_cluster_needs_ipv6_network() {
        let c = cluster(&["fd00:100:96::/48"]);
        assert!(matches!(
            validate_ip_family(&c, &adc("10.0.0.0/24")),
            Err(Error::InvalidInput(_))
        ));
        assert_eq!(validate_ip_family(&c, &adc("fd00::/64")).unwrap(), IpFamily::V6);
    }

    #[test]
    fn unparsable_network_is_invalid() {
        assert!(matches!(
            validate_ip_family(&cluster(&[]), &adc("bogus")),
            Err(Error::InvalidInput(_))
        ));
    }
}
