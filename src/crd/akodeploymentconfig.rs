use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, LabelSelector};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

use crate::conditions::DeriveConditions;

pub static ADC_FINALIZER: &str = "akodeploymentconfig.ako-operator.network.tkg.tanzu.vmware.com";
pub static CLUSTER_FINALIZER: &str = "ako-operator.network.tkg.tanzu.vmware.com";
pub static MANAGER_NAME: &str = "ako-operator";

/// Label on a Cluster naming the ADC that manages it
pub static AVI_CLUSTER_LABEL: &str = "cluster-service.network.tkg.tanzu.vmware.com/avi";
pub static AVI_SKIP_DEFAULT_ADC_LABEL: &str =
    "cluster-service.network.tkg.tanzu.vmware.com/avi-skip-default-adc";

pub static MANAGEMENT_CLUSTER_ADC: &str = "install-ako-for-management-cluster";
pub static WORKLOAD_CLUSTER_DEFAULT_ADC: &str = "install-ako-for-all";
pub static TKG_SYSTEM_NAMESPACE: &str = "tkg-system";

pub static AVI_NAMESPACE: &str = "avi-system";
pub static AVI_SECRET_NAME: &str = "avi-secret";
pub static AVI_CLUSTER_SECRET_TYPE: &str = "avi.cluster.x-k8s.io/secret";
pub static AVI_CERTIFICATE_KEY: &str = "certificateAuthorityData";
pub static AVI_USERNAME_KEY: &str = "username";
pub static AVI_PASSWORD_KEY: &str = "password";
pub static DEFAULT_AVI_TENANT: &str = "admin";

/// Retry interval while the HA Service waits on its AviInfraSetting
pub const HA_SERVICE_DEFERRED_REQUEUE: std::time::Duration = std::time::Duration::from_secs(10);

/// Binds a set of workload clusters to an AVI controller, cloud and network.
#[skip_serializing_none]
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
#[kube(
    group = "networking.tkg.tanzu.vmware.com",
    version = "v1alpha1",
    kind = "AKODeploymentConfig",
    plural = "akodeploymentconfigs",
    shortname = "adc",
    derive = "Default",
    status = "AKODeploymentConfigStatus",
    printcolumn = r#"{"name":"Controller", "type":"string", "jsonPath":".spec.controller"}"#,
    printcolumn = r#"{"name":"Cloud", "type":"string", "jsonPath":".spec.cloudName"}"#
)]
pub struct AKODeploymentConfigSpec {
    pub cloud_name: String,
    /// AVI controller address, host or IP with optional port
    pub controller: String,
    /// Pinned AVI API version; backfilled with the detected version when empty
    pub controller_version: Option<String>,
    pub service_engine_group: String,
    #[serde(default)]
    pub tenant: AviTenant,
    #[serde(default)]
    pub cluster_selector: LabelSelector,
    pub workload_credential_ref: Option<SecretReference>,
    pub admin_credential_ref: SecretReference,
    pub certificate_authority_ref: SecretReference,
    pub data_network: DataNetwork,
    pub control_plane_network: Option<ControlPlaneNetwork>,
    #[serde(default)]
    pub extra_configs: ExtraConfigs,
}

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AviTenant {
    #[serde(default)]
    pub name: String,
    pub context: Option<TenantContext>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum TenantContext {
    #[default]
    Provider,
    Tenant,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct SecretReference {
    pub name: String,
    pub namespace: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DataNetwork {
    pub name: String,
    pub cidr: String,
    #[serde(default)]
    pub ip_pools: Vec<IpPool>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct IpPool {
    pub start: String,
    pub end: String,
    #[serde(rename = "type")]
    pub type_: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct ControlPlaneNetwork {
    pub name: String,
    pub cidr: String,
}

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExtraConfigs {
    #[serde(default)]
    pub image: AkoImageConfig,
    #[serde(default)]
    pub log: AkoLogConfig,
    #[serde(default)]
    pub rbac: AkoRbacConfig,
    pub log_level: Option<LogLevel>,
    pub full_sync_frequency: Option<String>,
    pub api_server_port: Option<i32>,
    pub disable_static_route_sync: Option<bool>,
    pub cni_plugin: Option<CniPlugin>,
    #[serde(rename = "enableEVH")]
    pub enable_evh: Option<bool>,
    pub layer7_only: Option<bool>,
    #[serde(rename = "servicesAPI")]
    pub services_api: Option<bool>,
    pub istio_enabled: Option<bool>,
    pub vip_per_namespace: Option<bool>,
    pub namespace_selector: Option<NamespaceSelector>,
    #[serde(default)]
    pub ingress: AkoIngressConfig,
    #[serde(rename = "l4Config", default)]
    pub l4_config: AkoL4Config,
    #[serde(default)]
    pub networks_config: NetworksConfig,
}

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AkoImageConfig {
    pub repository: Option<String>,
    pub pull_policy: Option<String>,
    pub version: Option<String>,
}

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AkoLogConfig {
    pub persistent_volume_claim: Option<String>,
    pub mount_path: Option<String>,
    pub log_file: Option<String>,
}

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AkoRbacConfig {
    #[serde(default)]
    pub psp_enabled: bool,
    #[serde(rename = "pspPolicyAPIVersion")]
    pub psp_policy_api_version: Option<String>,
}

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AkoIngressConfig {
    pub disable_ingress_class: Option<bool>,
    pub default_ingress_controller: Option<bool>,
    pub service_type: Option<ServiceType>,
    #[serde(rename = "shardVSSize")]
    pub shard_vs_size: Option<ShardSize>,
    pub passthrough_shard_size: Option<PassthroughShardSize>,
    #[serde(default)]
    pub node_network_list: Vec<NodeNetwork>,
    #[serde(rename = "noPGForSNI")]
    pub no_pg_for_sni: Option<bool>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeNetwork {
    pub network_name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cidrs: Vec<String>,
}

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AkoL4Config {
    pub default_domain: Option<String>,
    #[serde(rename = "autoFQDN")]
    pub auto_fqdn: Option<String>,
}

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NetworksConfig {
    #[serde(rename = "enableRHI")]
    pub enable_rhi: Option<bool>,
    #[serde(rename = "nsxtT1LR")]
    pub nsxt_t1_lr: Option<String>,
    #[serde(default)]
    pub bgp_peer_labels: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceSelector {
    pub label_key: String,
    pub label_value: String,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum ServiceType {
    #[default]
    NodePort,
    ClusterIP,
    NodePortLocal,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum ShardSize {
    #[default]
    Small,
    Medium,
    Large,
    Dedicated,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum PassthroughShardSize {
    #[default]
    Small,
    Medium,
    Large,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    #[default]
    Info,
    Debug,
    Warn,
    Error,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum CniPlugin {
    Antrea,
    Calico,
    Canal,
    Flannel,
    Openshift,
    Ncp,
}

macro_rules! wire_name {
    ($ty:ty) => {
        impl $ty {
            /// Name used on the wire and in the rendered values
            pub fn as_str(&self) -> String {
                serde_json::to_value(self)
                    .ok()
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_default()
            }
        }
    };
}
wire_name!(ServiceType);
wire_name!(ShardSize);
wire_name!(PassthroughShardSize);
wire_name!(LogLevel);
wire_name!(CniPlugin);
wire_name!(TenantContext);

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, DeriveConditions)]
#[serde(rename_all = "camelCase")]
pub struct AKODeploymentConfigStatus {
    pub observed_generation: Option<i64>,
    pub conditions: Option<Vec<Condition>>,
}

impl AKODeploymentConfig {
    pub fn is_default(&self) -> bool {
        self.name_any() == WORKLOAD_CLUSTER_DEFAULT_ADC
    }

    pub fn is_management(&self) -> bool {
        self.name_any() == MANAGEMENT_CLUSTER_ADC
    }

    pub fn has_empty_selector(&self) -> bool {
        let selector = &self.spec.cluster_selector;
        selector.match_labels.as_ref().is_none_or(|m| m.is_empty())
            && selector
                .match_expressions
                .as_ref()
                .is_none_or(|e| e.is_empty())
    }

    pub fn tenant_name(&self) -> &str {
        if self.spec.tenant.name.is_empty() {
            DEFAULT_AVI_TENANT
        } else {
            &self.spec.tenant.name
        }
    }

    /// Name of the AviInfraSetting created for the control plane network
    pub fn infra_setting_name(&self) -> String {
        format!("{}-ais", self.name_any())
    }

    /// A control plane network is only meaningful when it names a network
    pub fn control_plane_network(&self) -> Option<&ControlPlaneNetwork> {
        self.spec
            .control_plane_network
            .as_ref()
            .filter(|n| !n.name.is_empty())
    }

    /// True when the control plane VIP comes from a network distinct from the data network
    pub fn has_distinct_control_plane_network(&self) -> bool {
        self.control_plane_network().is_some_and(|n| {
            n.name != self.spec.data_network.name || n.cidr != self.spec.data_network.cidr
        })
    }

    pub fn references_secret(&self, namespace: &str, name: &str) -> bool {
        let hits = |r: &SecretReference| r.namespace == namespace && r.name == name;
        hits(&self.spec.admin_credential_ref) || hits(&self.spec.certificate_authority_ref)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn adc_from_json(value: serde_json::Value) -> AKODeploymentConfig {
        serde_json::from_value(value).expect("valid adc")
    }

    fn base_json() -> serde_json::Value {
        serde_json::json!({
            "apiVersion": "networking.tkg.tanzu.vmware.com/v1alpha1",
            "kind": "AKODeploymentConfig",
            "metadata": {"name": "ako-a"},
            "spec": {
                "cloudName": "Default-Cloud",
                "controller": "10.23.122.1",
                "serviceEngineGroup": "Default-SEG",
                "adminCredentialRef": {"name": "avi-controller-credentials", "namespace": "tkg-system-networking"},
                "certificateAuthorityRef": {"name": "avi-controller-ca", "namespace": "tkg-system-networking"},
                "dataNetwork": {
                    "name": "vip-net",
                    "cidr": "10.0.0.0/24",
                    "ipPools": [{"start": "10.0.0.3", "end": "10.0.0.7", "type": "V4"}]
                },
                "extraConfigs": {
                    "ingress": {"serviceType": "NodePortLocal", "shardVSSize": "MEDIUM", "noPGForSNI": true},
                    "cniPlugin": "antrea",
                    "enableEVH": true
                }
            }
        })
    }

    #[test]
    fn deserializes_wire_names() {
        let adc = adc_from_json(base_json());
        let ingress = &adc.spec.extra_configs.ingress;
        assert_eq!(ingress.service_type, Some(ServiceType::NodePortLocal));
        assert_eq!(ingress.shard_vs_size, Some(ShardSize::Medium));
        assert_eq!(ingress.no_pg_for_sni, Some(true));
        assert_eq!(adc.spec.extra_configs.cni_plugin, Some(CniPlugin::Antrea));
        assert_eq!(adc.spec.extra_configs.enable_evh, Some(true));
        assert_eq!(adc.spec.data_network.ip_pools[0].type_, "V4");
        assert!(adc.has_empty_selector());
        assert_eq!(adc.tenant_name(), "admin");
    }

    #[test]
    fn enum_wire_names() {
        assert_eq!(ShardSize::Dedicated.as_str(), "DEDICATED");
        assert_eq!(ServiceType::ClusterIP.as_str(), "ClusterIP");
        assert_eq!(CniPlugin::Openshift.as_str(), "openshift");
        assert_eq!(LogLevel::Warn.as_str(), "WARN");
        assert_eq!(TenantContext::Provider.as_str(), "Provider");
    }

    #[test]
    fn control_plane_network_distinct_from_data_network() {
        let mut adc = adc_from_json(base_json());
        assert!(!adc.has_distinct_control_plane_network());
        adc.spec.control_plane_network = Some(ControlPlaneNetwork {
            name: "vip-net".into(),
            cidr: "10.0.0.0/24".into(),
        });
        assert!(!adc.has_distinct_control_plane_network());
        adc.spec.control_plane_network = Some(ControlPlaneNetwork {
            name: "cp-net".into(),
            cidr: "10.1.0.0/24".into(),
        });
        assert!(adc.has_distinct_control_plane_network());
        adc.spec.control_plane_network = Some(ControlPlaneNetwork::default());
        assert!(adc.control_plane_network().is_none());
    }

    #[test]
    fn selector_with_labels_is_not_empty() {
        let mut adc = adc_from_json(base_json());
        adc.spec.cluster_selector.match_labels =
            Some(BTreeMap::from([("team".to_string(), "a".to_string())]));
        assert!(!adc.has_empty_selector());
    }

    #[test]
    fn references_admin_and_ca_secrets() {
        let adc = adc_from_json(base_json());
        assert!(adc.references_secret("tkg-system-networking", "avi-controller-ca"));
        assert!(adc.references_secret("tkg-system-networking", "avi-controller-credentials"));
        assert!(!adc.references_secret("default", "avi-controller-ca"));
    }
}
