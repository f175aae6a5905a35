use std::net::IpAddr;

use chrono::Utc;
use ipnet::IpNet;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_with::skip_serializing_none;

use crate::{
    Error, Result,
    config::{OperatorConfig, is_valid_port},
};

pub static CLUSTER_CONTROL_PLANE_ANNOTATION: &str =
    "tkg.tanzu.vmware.com/cluster-controlplane-endpoint";

pub static AVI_API_SERVER_HA_PROVIDER_VAR: &str = "aviAPIServerHAProvider";
pub static KUBE_VIP_LOAD_BALANCER_PROVIDER_VAR: &str = "kubeVipLoadBalancerProvider";
pub static API_SERVER_ENDPOINT_VAR: &str = "apiServerEndpoint";
pub static API_SERVER_PORT_VAR: &str = "apiServerPort";

pub static READY_CONDITION: &str = "Ready";
pub static AVI_RESOURCE_CLEANUP_SUCCEEDED: &str = "AviResourceCleanupSucceeded";
pub static AVI_USER_CLEANUP_SUCCEEDED: &str = "AviUserCleanupSucceeded";
pub static CLUSTER_IP_FAMILY_VALIDATION_SUCCEEDED: &str = "ClusterIpFamilyValidationSucceeded";
pub static AVI_RESOURCE_CLEANUP_REASON: &str = "AviResourceCleanup";
pub static AVI_USER_CLEANUP_REASON: &str = "AviUserCleanup";
pub static CLUSTER_IP_FAMILY_VALIDATION_REASON: &str = "ClusterIpFamilyValidation";

/// The subset of the Cluster API `Cluster` the operator reads and writes.
#[skip_serializing_none]
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
#[kube(
    group = "cluster.x-k8s.io",
    version = "v1beta1",
    kind = "Cluster",
    namespaced,
    derive = "Default",
    status = "ClusterStatus",
    schema = "disabled"
)]
pub struct ClusterSpec {
    pub paused: Option<bool>,
    pub cluster_network: Option<ClusterNetwork>,
    pub control_plane_endpoint: Option<ApiEndpoint>,
    pub control_plane_ref: Option<serde_json::Value>,
    pub infrastructure_ref: Option<serde_json::Value>,
    pub topology: Option<Topology>,
}

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterNetwork {
    pub api_server_port: Option<i32>,
    pub services: Option<NetworkRanges>,
    pub pods: Option<NetworkRanges>,
    pub service_domain: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkRanges {
    #[serde(default)]
    pub cidr_blocks: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct ApiEndpoint {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: i32,
}

impl ApiEndpoint {
    pub fn is_zero(&self) -> bool {
        self.host.is_empty() && self.port == 0
    }
}

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct Topology {
    pub class: String,
    pub version: String,
    pub control_plane: Option<serde_json::Value>,
    pub workers: Option<serde_json::Value>,
    #[serde(default)]
    pub variables: Vec<ClusterVariable>,
}

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterVariable {
    pub name: String,
    pub definition_from: Option<String>,
    pub value: serde_json::Value,
}

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    pub phase: Option<String>,
    pub infrastructure_ready: Option<bool>,
    pub control_plane_ready: Option<bool>,
    pub observed_generation: Option<i64>,
    pub conditions: Option<Vec<ClusterCondition>>,
}

/// Cluster API condition; unlike meta/v1 conditions, reason and message are optional.
#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterCondition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    pub severity: Option<String>,
    pub last_transition_time: Option<Time>,
    pub reason: Option<String>,
    pub message: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IpFamily {
    V4,
    V6,
}

impl IpFamily {
    pub fn of(ip: &IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => IpFamily::V4,
            IpAddr::V6(v6) if v6.to_ipv4_mapped().is_some() => IpFamily::V4,
            IpAddr::V6(_) => IpFamily::V6,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IpFamily::V4 => "V4",
            IpFamily::V6 => "V6",
        }
    }

    /// Family of the first CIDR in a list of at most two.
    pub fn of_cidrs(cidrs: &[String]) -> Result<Self> {
        if cidrs.len() > 2 {
            return Err(Error::InvalidInput("too many CIDRs specified".into()));
        }
        let first = cidrs
            .first()
            .ok_or_else(|| Error::InvalidInput("no CIDR specified".into()))?;
        let net: IpNet = first
            .parse()
            .map_err(|e| Error::InvalidInput(format!("could not parse CIDR {first}: {e}")))?;
        Ok(Self::of(&net.addr()))
    }
}

impl Cluster {
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn is_cluster_class_based(&self) -> bool {
        self.spec.topology.is_some()
    }

    /// `<namespace>-<name>`, the identity used by AKO and for the HA service name
    pub fn namespaced_name(&self) -> String {
        format!("{}-{}", self.namespace().unwrap_or_default(), self.name_any())
    }

    pub fn get_condition(&self, type_: &str) -> Option<&ClusterCondition> {
        self.status
            .as_ref()?
            .conditions
            .as_ref()?
            .iter()
            .find(|c| c.type_ == type_)
    }

    pub fn is_condition_true(&self, type_: &str) -> bool {
        self.get_condition(type_).is_some_and(|c| c.status == "True")
    }

    /// False only when the condition is present with status False
    pub fn is_condition_false(&self, type_: &str) -> bool {
        self.get_condition(type_).is_some_and(|c| c.status == "False")
    }

    pub fn mark_true(&mut self, type_: &str) {
        self.set_condition(ClusterCondition {
            type_: type_.to_string(),
            status: "True".to_string(),
            ..Default::default()
        });
    }

    pub fn mark_false(&mut self, type_: &str, reason: &str, severity: &str, message: &str) {
        self.set_condition(ClusterCondition {
            type_: type_.to_string(),
            status: "False".to_string(),
            severity: Some(severity.to_string()),
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
            ..Default::default()
        });
    }

    /// Upserts a condition, keeping the transition time when the status is unchanged.
    pub fn set_condition(&mut self, mut cond: ClusterCondition) {
        let conditions = self
            .status
            .get_or_insert_with(ClusterStatus::default)
            .conditions
            .get_or_insert_with(Vec::new);
        match conditions.iter_mut().find(|c| c.type_ == cond.type_) {
            Some(existing) => {
                if existing.status == cond.status {
                    cond.last_transition_time = existing.last_transition_time.clone();
                } else {
                    cond.last_transition_time = Some(Time(Utc::now()));
                }
                *existing = cond;
            }
            None => {
                cond.last_transition_time = Some(Time(Utc::now()));
                conditions.push(cond);
            }
        }
    }

    pub fn remove_condition(&mut self, type_: &str) {
        if let Some(conditions) = self.status.as_mut().and_then(|s| s.conditions.as_mut()) {
            conditions.retain(|c| c.type_ != type_);
        }
    }

    fn topology_variable<T: DeserializeOwned>(&self, name: &str) -> Option<Result<T>> {
        let var = self
            .spec
            .topology
            .as_ref()?
            .variables
            .iter()
            .find(|v| v.name == name)?;
        Some(serde_json::from_value(var.value.clone()).map_err(Error::SerializationError))
    }

    /// Whether AVI fronts this cluster's API server.
    pub fn is_control_plane_vip_provider(&self, cfg: &OperatorConfig) -> Result<bool> {
        match self.topology_variable::<bool>(AVI_API_SERVER_HA_PROVIDER_VAR) {
            Some(v) => v,
            None => Ok(cfg.ha_provider),
        }
    }

    /// Whether AVI implements LoadBalancer services; false when kube-vip does.
    pub fn is_load_balancer_provider(&self) -> Result<bool> {
        match self.topology_variable::<bool>(KUBE_VIP_LOAD_BALANCER_PROVIDER_VAR) {
            Some(v) => v.map(|kube_vip| !kube_vip),
            None => Ok(true),
        }
    }

    pub fn control_plane_endpoint(&self) -> Result<String> {
        match self.topology_variable::<String>(API_SERVER_ENDPOINT_VAR) {
            Some(v) => v,
            None => Ok(self
                .annotations()
                .get(CLUSTER_CONTROL_PLANE_ANNOTATION)
                .cloned()
                .unwrap_or_default()),
        }
    }

    /// Records the endpoint as a topology variable; no-op for legacy clusters.
    pub fn set_control_plane_endpoint_variable(&mut self, endpoint: &str) {
        let Some(topology) = self.spec.topology.as_mut() else {
            return;
        };
        let value = serde_json::Value::String(endpoint.to_string());
        match topology
            .variables
            .iter_mut()
            .find(|v| v.name == API_SERVER_ENDPOINT_VAR)
        {
            Some(var) => var.value = value,
            None => topology.variables.push(ClusterVariable {
                name: API_SERVER_ENDPOINT_VAR.to_string(),
                definition_from: None,
                value,
            }),
        }
    }

    pub fn control_plane_endpoint_port(&self, cfg: &OperatorConfig) -> Result<i32> {
        if !self.is_cluster_class_based() {
            return Ok(cfg.control_plane_endpoint_port);
        }
        match self.topology_variable::<i64>(API_SERVER_PORT_VAR) {
            None => Ok(crate::config::DEFAULT_CONTROL_PLANE_ENDPOINT_PORT),
            Some(port) => {
                let port = port?;
                if is_valid_port(port) {
                    Ok(port as i32)
                } else {
                    Err(Error::InvalidInput(format!(
                        "port number {port} is not in valid range [1,65535]"
                    )))
                }
            }
        }
    }

    /// Primary IP family derived from the pod and service CIDRs, V4 when unset.
    pub fn primary_ip_family(&self) -> Result<IpFamily> {
        let network = self.spec.cluster_network.as_ref();
        let pods = network
            .and_then(|n| n.pods.as_ref())
            .map(|r| r.cidr_blocks.as_slice())
            .unwrap_or_default();
        let services = network
            .and_then(|n| n.services.as_ref())
            .map(|r| r.cidr_blocks.as_slice())
            .unwrap_or_default();

        let pods_family = if pods.is_empty() {
            None
        } else {
            Some(IpFamily::of_cidrs(pods).map_err(|e| Error::InvalidInput(format!("pods: {e}")))?)
        };
        let services_family = if services.is_empty() {
            None
        } else {
            Some(
                IpFamily::of_cidrs(services)
                    .map_err(|e| Error::InvalidInput(format!("services: {e}")))?,
            )
        };

        match (pods_family, services_family) {
            (None, None) => Ok(IpFamily::V4),
            (Some(p), Some(s)) if p != s => Err(Error::InvalidInput(
                "pods and services IP family mismatch".into(),
            )),
            (Some(p), _) => Ok(p),
            (None, Some(s)) => Ok(s),
        }
    }
}
