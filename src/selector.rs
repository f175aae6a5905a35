//! Decides which ADC is authoritative for which cluster.

use std::collections::BTreeMap;

use k8s_openapi::{
    api::core::v1::{Secret, Service},
    apimachinery::pkg::apis::meta::v1::LabelSelector,
};
use kube::{ResourceExt, runtime::reflector::ObjectRef};
use tracing::*;

use crate::{
    Error, Result,
    config::OperatorConfig,
    crd::{
        AKODeploymentConfig, AVI_CLUSTER_LABEL, AVI_SKIP_DEFAULT_ADC_LABEL, Cluster,
        READY_CONDITION, TKG_SYSTEM_NAMESPACE, WORKLOAD_CLUSTER_DEFAULT_ADC,
    },
    haprovider::{HA_SERVICE_CLUSTER_NAME_ANNOTATION, HA_SERVICE_CLUSTER_NAMESPACE_ANNOTATION},
};

pub fn is_empty(selector: &LabelSelector) -> bool {
    selector.match_labels.as_ref().is_none_or(|m| m.is_empty())
        && selector.match_expressions.as_ref().is_none_or(|e| e.is_empty())
}

/// Rejects selectors the API server would refuse to evaluate.
pub fn validate(selector: &LabelSelector) -> Result<()> {
    for expr in selector.match_expressions.iter().flatten() {
        if expr.key.is_empty() {
            return Err(Error::InvalidInput("label selector key must not be empty".into()));
        }
        let values = expr.values.as_deref().unwrap_or_default();
        match expr.operator.as_str() {
            "In" | "NotIn" if values.is_empty() => {
                return Err(Error::InvalidInput(format!(
                    "operator {} on {} requires at least one value",
                    expr.operator, expr.key
                )));
            }
            "Exists" | "DoesNotExist" if !values.is_empty() => {
                return Err(Error::InvalidInput(format!(
                    "operator {} on {} takes no values",
                    expr.operator, expr.key
                )));
            }
            "In" | "NotIn" | "Exists" | "DoesNotExist" => {}
            other => {
                return Err(Error::InvalidInput(format!(
                    "unknown label selector operator {other}"
                )));
            }
        }
    }
    Ok(())
}

/// Label selector evaluation; an empty selector matches everything.
pub fn matches(selector: &LabelSelector, labels: &BTreeMap<String, String>) -> Result<bool> {
    validate(selector)?;
    let labels_match = selector
        .match_labels
        .iter()
        .flatten()
        .all(|(k, v)| labels.get(k) == Some(v));
    let expressions_match = selector.match_expressions.iter().flatten().all(|expr| {
        let value = labels.get(&expr.key);
        let values = expr.values.as_deref().unwrap_or_default();
        match expr.operator.as_str() {
            "In" => value.is_some_and(|v| values.contains(v)),
            "NotIn" => value.is_none_or(|v| !values.contains(v)),
            "Exists" => value.is_some(),
            _ => value.is_none(),
        }
    });
    Ok(labels_match && expressions_match)
}

/// Clusters that are not ready are left alone unless they are going away.
pub fn skip_cluster(cluster: &Cluster, config: &OperatorConfig) -> bool {
    cluster.is_condition_false(READY_CONDITION) && !cluster.is_deleting() && !config.bootstrap_cluster
}

pub fn cluster_adc_label(cluster: &Cluster) -> Option<&str> {
    cluster.labels().get(AVI_CLUSTER_LABEL).map(String::as_str)
}

pub fn apply_cluster_label(cluster: &mut Cluster, adc: &AKODeploymentConfig) {
    let name = adc.name_any();
    let labels = cluster.labels_mut();
    match labels.get(AVI_CLUSTER_LABEL) {
        None => debug!("adding label {AVI_CLUSTER_LABEL}={name}"),
        Some(current) if *current != name => {
            info!("relabeling cluster from {current} to {name}")
        }
        _ => {}
    }
    labels.insert(AVI_CLUSTER_LABEL.to_string(), name);
    if adc.is_default() {
        labels.remove(AVI_SKIP_DEFAULT_ADC_LABEL);
    } else {
        labels.insert(AVI_SKIP_DEFAULT_ADC_LABEL.to_string(), "true".to_string());
    }
}

pub fn remove_cluster_label(cluster: &mut Cluster) {
    let labels = cluster.labels_mut();
    if labels.remove(AVI_CLUSTER_LABEL).is_some() {
        debug!("removed label {AVI_CLUSTER_LABEL}");
    }
    labels.remove(AVI_SKIP_DEFAULT_ADC_LABEL);
}

/// Filters `clusters` down to those `adc` is authoritative for.
///
/// A cluster already claimed by another non-default ADC stays with that ADC; a
/// cluster held by the default ADC is taken over. The management cluster
/// namespace belongs to the management ADC only.
pub fn select_clusters(
    adc: &AKODeploymentConfig,
    clusters: Vec<Cluster>,
    config: &OperatorConfig,
) -> Result<Vec<Cluster>> {
    let name = adc.name_any();
    let mut selected = Vec::new();
    for cluster in clusters {
        if skip_cluster(&cluster, config) {
            debug!(cluster = %cluster.namespaced_name(), "cluster is not ready, skipping");
            continue;
        }
        if !matches(&adc.spec.cluster_selector, cluster.labels())? {
            continue;
        }
        // The default ADC yields to any matching custom ADC whatever its own selector is.
        if let Some(owner) = cluster_adc_label(&cluster)
            && owner != name
            && owner != WORKLOAD_CLUSTER_DEFAULT_ADC
        {
            continue;
        }
        if cluster.namespace().as_deref() == Some(TKG_SYSTEM_NAMESPACE) && !adc.is_management() {
            continue;
        }
        selected.push(cluster);
    }
    Ok(selected)
}

/// The single ADC a cluster belongs to, if any.
///
/// A custom label owner wins when it still matches; otherwise the first
/// matching custom ADC, then the default ADC.
pub fn adc_for_cluster<'a>(
    adcs: &'a [AKODeploymentConfig],
    cluster: &Cluster,
) -> Option<&'a AKODeploymentConfig> {
    let in_management_ns = cluster.namespace().as_deref() == Some(TKG_SYSTEM_NAMESPACE);
    let mut candidates: Vec<&AKODeploymentConfig> = adcs
        .iter()
        .filter(|adc| !in_management_ns || adc.is_management())
        .collect();
    candidates.sort_by_key(|adc| adc.name_any());

    let mut default = None;
    let mut matched = Vec::new();
    for adc in candidates {
        if adc.has_empty_selector() {
            if adc.is_default() {
                default = Some(adc);
            } else if adc.is_management() {
                if in_management_ns {
                    matched.push(adc);
                }
            } else {
                warn!(adc = %adc.name_any(), "non default AKODeploymentConfig has an empty cluster selector");
            }
            continue;
        }
        match matches(&adc.spec.cluster_selector, cluster.labels()) {
            Ok(true) => matched.push(adc),
            Ok(false) => {}
            Err(e) => warn!(adc = %adc.name_any(), "invalid cluster selector: {e}"),
        }
    }

    let owner = cluster_adc_label(cluster);
    matched
        .iter()
        .find(|adc| !adc.is_default() && Some(adc.name_any().as_str()) == owner)
        .or_else(|| matched.iter().find(|adc| !adc.is_default()))
        .or_else(|| matched.first())
        .copied()
        .or(default)
}

/// ADCs to enqueue for a Cluster event: the authoritative ADC plus the
/// previous label owner so it can release the cluster.
pub fn adcs_for_cluster(
    adcs: &[AKODeploymentConfig],
    cluster: &Cluster,
    config: &OperatorConfig,
) -> Vec<ObjectRef<AKODeploymentConfig>> {
    if skip_cluster(cluster, config) {
        return Vec::new();
    }
    let mut refs: Vec<ObjectRef<AKODeploymentConfig>> = adc_for_cluster(adcs, cluster)
        .map(|adc| ObjectRef::new(&adc.name_any()))
        .into_iter()
        .collect();
    if let Some(owner) = cluster_adc_label(cluster)
        && !refs.iter().any(|r| r.name == owner)
        && adcs.iter().any(|adc| adc.name_any() == owner)
    {
        refs.push(ObjectRef::new(owner));
    }
    refs
}

/// ADCs to enqueue when one of their admin credential or CA secrets changes.
pub fn adcs_for_secret(
    adcs: &[AKODeploymentConfig],
    secret: &Secret,
) -> Vec<ObjectRef<AKODeploymentConfig>> {
    let Some(namespace) = secret.namespace() else {
        return Vec::new();
    };
    let name = secret.name_any();
    adcs.iter()
        .filter(|adc| adc.references_secret(&namespace, &name))
        .map(|adc| ObjectRef::new(&adc.name_any()))
        .collect()
}

/// Cluster owning an HA control-plane Service, read from its back-reference annotations.
pub fn cluster_for_service(service: &Service) -> Option<ObjectRef<Cluster>> {
    let is_lb = service
        .spec
        .as_ref()
        .and_then(|s| s.type_.as_deref())
        == Some("LoadBalancer");
    if !is_lb || !service.name_any().ends_with("-control-plane") {
        return None;
    }
    let annotations = service.annotations();
    let name = annotations.get(HA_SERVICE_CLUSTER_NAME_ANNOTATION)?;
    let namespace = annotations.get(HA_SERVICE_CLUSTER_NAMESPACE_ANNOTATION)?;
    Some(ObjectRef::new(name).within(namespace))
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelectorRequirement;
    use serde_json::json;

    fn adc(name: &str, match_labels: serde_json::Value) -> AKODeploymentConfig {
        serde_json::from_value(json!({
            "apiVersion": "networking.tkg.tanzu.vmware.com/v1alpha1",
            "kind": "AKODeploymentConfig",
            "metadata": {"name": name},
            "spec": {
                "cloudName": "Default-Cloud",
                "controller": "10.23.122.1",
                "serviceEngineGroup": "Default-SEG",
                "clusterSelector": {"matchLabels": match_labels},
                "adminCredentialRef": {"name": "avi-controller-credentials", "namespace": "tkg-system-networking"},
                "certificateAuthorityRef": {"name": "avi-controller-ca", "namespace": "tkg-system-networking"},
                "dataNetwork": {"name": "vip-net", "cidr": "10.0.0.0/24"}
            }
        }))
        .expect("adc")
    }

    fn cluster(ns: &str, name: &str, labels: serde_json::Value) -> Cluster {
        serde_json::from_value(json!({
            "apiVersion": "cluster.x-k8s.io/v1beta1",
            "kind": "Cluster",
            "metadata": {"name": name, "namespace": ns, "labels": labels},
            "spec": {}
        }))
        .expect("cluster")
    }

    #[test]
    fn selector_operators() {
        let labels = BTreeMap::from([("env".to_string(), "prod".to_string())]);
        let mut sel = LabelSelector::default();
        assert!(matches(&sel, &labels).unwrap());

        sel.match_expressions = Some(vec![LabelSelectorRequirement {
            key: "env".into(),
            operator: "In".into(),
            values: Some(vec!["prod".into(), "staging".into()]),
        }]);
        assert!(matches(&sel, &labels).unwrap());

        sel.match_expressions = Some(vec![LabelSelectorRequirement {
            key: "team".into(),
            operator: "DoesNotExist".into(),
            values: None,
        }]);
        assert!(matches(&sel, &labels).unwrap());

        sel.match_expressions = Some(vec![LabelSelectorRequirement {
            key: "env".into(),
            operator: "NotIn".into(),
            values: Some(vec!["prod".into()]),
        }]);
        assert!(!matches(&sel, &labels).unwrap());

        sel.match_expressions = Some(vec![LabelSelectorRequirement {
            key: "env".into(),
            operator: "Near".into(),
            values: None,
        }]);
        assert!(matches(&sel, &labels).is_err());
    }

    #[test]
    fn cluster_owned_by_custom_adc_is_not_taken() {
        let a = adc("adc-a", json!({"team": "a"}));
        let clusters = vec![
            cluster("default", "c1", json!({"team": "a"})),
            cluster("default", "c2", json!({"team": "a", AVI_CLUSTER_LABEL: "adc-b"})),
            cluster("default", "c3", json!({"team": "a", AVI_CLUSTER_LABEL: WORKLOAD_CLUSTER_DEFAULT_ADC})),
            cluster("default", "c4", json!({"team": "b"})),
            cluster(TKG_SYSTEM_NAMESPACE, "mgmt", json!({"team": "a"})),
        ];
        let names: Vec<String> = select_clusters(&a, clusters, &OperatorConfig::default())
            .unwrap()
            .iter()
            .map(|c| c.name_any())
            .collect();
        assert_eq!(names, vec!["c1", "c3"]);
    }

    #[test]
    fn default_with_selector_still_yields_to_custom_adc() {
        let a = adc("adc-a", json!({"team": "a"}));
        let c = cluster(
            "default",
            "c1",
            json!({"team": "a", "env": "dev", AVI_CLUSTER_LABEL: WORKLOAD_CLUSTER_DEFAULT_ADC}),
        );
        let adcs = vec![adc(WORKLOAD_CLUSTER_DEFAULT_ADC, json!({"env": "dev"})), a.clone()];
        assert_eq!(adc_for_cluster(&adcs, &c).unwrap().name_any(), "adc-a");
        assert_eq!(select_clusters(&a, vec![c], &OperatorConfig::default()).unwrap().len(), 1);
    }

    #[test]
    fn unready_cluster_is_skipped_unless_deleting_or_bootstrap() {
        let a = adc(WORKLOAD_CLUSTER_DEFAULT_ADC, json!({}));
        let mut c = cluster("default", "c1", json!({}));
        c.mark_false(READY_CONDITION, "WaitingForControlPlane", "Info", "");
        let cfg = OperatorConfig::default();
        assert!(select_clusters(&a, vec![c.clone()], &cfg).unwrap().is_empty());

        let bootstrap = OperatorConfig {
            bootstrap_cluster: true,
            ..Default::default()
        };
        assert_eq!(select_clusters(&a, vec![c.clone()], &bootstrap).unwrap().len(), 1);

        c.metadata.deletion_timestamp = Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
            chrono::Utc::now(),
        ));
        assert_eq!(select_clusters(&a, vec![c], &cfg).unwrap().len(), 1);
    }

    #[test]
    fn custom_adc_beats_default() {
        let adcs = vec![
            adc(WORKLOAD_CLUSTER_DEFAULT_ADC, json!({})),
            adc("adc-a", json!({"team": "a"})),
        ];
        let c = cluster("default", "c1", json!({"team": "a"}));
        assert_eq!(adc_for_cluster(&adcs, &c).unwrap().name_any(), "adc-a");

        let other = cluster("default", "c2", json!({"team": "z"}));
        assert_eq!(
            adc_for_cluster(&adcs, &other).unwrap().name_any(),
            WORKLOAD_CLUSTER_DEFAULT_ADC
        );
    }

    #[test]
    fn existing_owner_wins_among_matches() {
        let adcs = vec![adc("adc-a", json!({"team": "a"})), adc("adc-b", json!({"env": "prod"}))];
        let c = cluster("default", "c1", json!({"team": "a", "env": "prod", AVI_CLUSTER_LABEL: "adc-b"}));
        assert_eq!(adc_for_cluster(&adcs, &c).unwrap().name_any(), "adc-b");
    }

    #[test]
    fn nothing_matches_without_default() {
        let adcs = vec![adc("adc-a", json!({"team": "a"}))];
        let c = cluster("default", "c1", json!({}));
        assert!(adc_for_cluster(&adcs, &c).is_none());
        assert!(adcs_for_cluster(&adcs, &c, &OperatorConfig::default()).is_empty());
    }

    #[test]
    fn management_namespace_only_routes_to_management_adc() {
        let adcs = vec![
            adc(WORKLOAD_CLUSTER_DEFAULT_ADC, json!({})),
            adc(crate::crd::MANAGEMENT_CLUSTER_ADC, json!({})),
        ];
        let c = cluster(TKG_SYSTEM_NAMESPACE, "mgmt", json!({}));
        assert_eq!(
            adc_for_cluster(&adcs, &c).unwrap().name_any(),
            crate::crd::MANAGEMENT_CLUSTER_ADC
        );
    }

    #[test]
    fn previous_owner_is_also_enqueued() {
        let adcs = vec![
            adc(WORKLOAD_CLUSTER_DEFAULT_ADC, json!({})),
            adc("adc-a", json!({"team": "a"})),
        ];
        let c = cluster("default", "c1", json!({AVI_CLUSTER_LABEL: "adc-a"}));
        let refs: Vec<String> = adcs_for_cluster(&adcs, &c, &OperatorConfig::default())
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(refs, vec![WORKLOAD_CLUSTER_DEFAULT_ADC.to_string(), "adc-a".to_string()]);
    }

    #[test]
    fn label_helpers_track_skip_default() {
        let mut c = cluster("default", "c1", json!({}));
        apply_cluster_label(&mut c, &adc("adc-a", json!({"team": "a"})));
        assert_eq!(cluster_adc_label(&c), Some("adc-a"));
        assert_eq!(c.labels().get(AVI_SKIP_DEFAULT_ADC_LABEL).map(String::as_str), Some("true"));

        apply_cluster_label(&mut c, &adc(WORKLOAD_CLUSTER_DEFAULT_ADC, json!({})));
        assert!(!c.labels().contains_key(AVI_SKIP_DEFAULT_ADC_LABEL));

        remove_cluster_label(&mut c);
        assert_eq!(cluster_adc_label(&c), None);
    }

    #[test]
    fn secret_routes_to_referencing_adcs() {
        let adcs = vec![adc("adc-a", json!({"team": "a"}))];
        let mut secret = Secret::default();
        secret.metadata.name = Some("avi-controller-ca".into());
        secret.metadata.namespace = Some("tkg-system-networking".into());
        assert_eq!(adcs_for_secret(&adcs, &secret).len(), 1);
        secret.metadata.namespace = Some("default".into());
        assert!(adcs_for_secret(&adcs, &secret).is_empty());
    }
}
