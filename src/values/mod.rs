//! Data values for the load-balancer-and-ingress-service add-on.
//!
//! Field order is the order of the rendered document; booleans are carried as
//! `"true"`/`"false"` strings because the package schema declares them that way.

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::{
    Error, Result,
    crd::{AKODeploymentConfig, AVI_NAMESPACE, NodeNetwork, ShardSize, ServiceType},
};

mod render;
pub use render::*;

pub const DEFAULT_LOG_LEVEL: &str = "INFO";
pub const DEFAULT_FULL_SYNC_FREQUENCY: &str = "1800";
pub const DEFAULT_API_SERVER_PORT: i32 = 8080;

fn flag(value: bool) -> String {
    value.to_string()
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct AddonValues {
    #[serde(rename = "loadBalancerAndIngressService")]
    pub load_balancer_and_ingress_service: LoadBalancerAndIngressService,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct LoadBalancerAndIngressService {
    pub name: String,
    pub namespace: String,
    pub config: Config,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Config {
    pub is_cluster_service: String,
    pub replica_count: i32,
    pub image_settings: ImageSettings,
    pub ako_settings: AkoSettings,
    pub network_settings: NetworkSettings,
    pub l7_settings: L7Settings,
    pub l4_settings: L4Settings,
    pub controller_settings: ControllerSettings,
    pub nodeport_selector: NodePortSelector,
    pub resources: Resources,
    pub rbac: Rbac,
    pub avi_credentials: AviCredentials,
    pub persistent_volume_claim: String,
    pub mount_path: String,
    pub log_file: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct ImageSettings {
    pub repository: String,
    pub pull_policy: String,
    pub version: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct AkoSettings {
    pub log_level: String,
    pub full_sync_frequency: String,
    pub api_server_port: i32,
    pub delete_config: String,
    pub disable_static_route_sync: String,
    pub cluster_name: String,
    pub cni_plugin: String,
    pub sync_namespace: String,
    pub enable_evh: String,
    pub layer_7_only: String,
    pub services_api: String,
    pub istio_enabled: String,
    pub vip_per_namespace: String,
    pub namespace_selector: NamespaceSelectorSettings,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct NamespaceSelectorSettings {
    pub label_key: String,
    pub label_value: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct NetworkSettings {
    pub subnet_ip: String,
    pub subnet_prefix: String,
    pub network_name: String,
    pub node_network_list: String,
    pub vip_network_list: String,
    pub enable_rhi: String,
    pub nsxt_t1_lr: String,
    pub bgp_peer_labels: Vec<String>,
    pub control_plane_network_name: String,
    pub control_plane_network_cidr: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct L7Settings {
    pub disable_ingress_class: String,
    pub default_ing_controller: String,
    pub l7_sharding_scheme: String,
    pub service_type: String,
    pub shard_vs_size: String,
    pub pass_through_shardsize: String,
    pub no_pg_for_sni: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct L4Settings {
    pub default_domain: String,
    pub auto_fqdn: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct ControllerSettings {
    pub service_engine_group_name: String,
    pub controller_version: String,
    pub cloud_name: String,
    pub controller_ip: String,
    pub tenant_name: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct NodePortSelector {
    pub key: String,
    pub value: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Resources {
    pub limits: ResourceAmounts,
    pub request: ResourceAmounts,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ResourceAmounts {
    pub cpu: String,
    pub memory: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct Rbac {
    pub psp_enabled: String,
    pub psp_policy_api_version: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct AviCredentials {
    pub username: String,
    pub password: String,
    pub certificate_authority_data: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct VipNetwork<'a> {
    network_name: &'a str,
    cidr: &'a str,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            is_cluster_service: String::new(),
            replica_count: 1,
            image_settings: ImageSettings::default(),
            ako_settings: AkoSettings {
                log_level: DEFAULT_LOG_LEVEL.to_string(),
                full_sync_frequency: DEFAULT_FULL_SYNC_FREQUENCY.to_string(),
                api_server_port: DEFAULT_API_SERVER_PORT,
                delete_config: flag(false),
                disable_static_route_sync: flag(true),
                cluster_name: String::new(),
                cni_plugin: String::new(),
                sync_namespace: String::new(),
                enable_evh: flag(false),
                layer_7_only: flag(false),
                services_api: flag(false),
                istio_enabled: flag(false),
                vip_per_namespace: flag(false),
                namespace_selector: NamespaceSelectorSettings::default(),
            },
            network_settings: NetworkSettings {
                enable_rhi: flag(false),
                ..Default::default()
            },
            l7_settings: L7Settings {
                disable_ingress_class: flag(false),
                default_ing_controller: flag(false),
                l7_sharding_scheme: String::new(),
                service_type: ServiceType::NodePort.as_str(),
                shard_vs_size: ShardSize::Small.as_str(),
                pass_through_shardsize: String::new(),
                no_pg_for_sni: flag(false),
            },
            l4_settings: L4Settings::default(),
            controller_settings: ControllerSettings::default(),
            nodeport_selector: NodePortSelector::default(),
            resources: Resources {
                limits: ResourceAmounts {
                    cpu: "250m".to_string(),
                    memory: "300Mi".to_string(),
                },
                request: ResourceAmounts {
                    cpu: "100m".to_string(),
                    memory: "200Mi".to_string(),
                },
            },
            rbac: Rbac {
                psp_enabled: flag(false),
                psp_policy_api_version: String::new(),
            },
            avi_credentials: AviCredentials::default(),
            persistent_volume_claim: String::new(),
            mount_path: String::new(),
            log_file: String::new(),
        }
    }
}

/// `(address, prefix length)` of a CIDR such as `10.0.0.0/24`.
pub fn parse_cidr(cidr: &str) -> Result<(String, u8)> {
    let net: IpNet = cidr
        .trim()
        .parse()
        .map_err(|e| Error::InvalidInput(format!("invalid CIDR {cidr:?}: {e}")))?;
    Ok((net.addr().to_string(), net.prefix_len()))
}

fn node_network_list_json(networks: &[NodeNetwork]) -> Result<String> {
    if networks.is_empty() {
        return Ok(String::new());
    }
    serde_json::to_string(networks).map_err(Error::SerializationError)
}

impl AddonValues {
    /// Values for the cluster `namespace/name` under `adc`, without credentials.
    pub fn for_cluster(adc: &AKODeploymentConfig, namespace: &str, name: &str) -> Result<Self> {
        let spec = &adc.spec;
        let extra = &spec.extra_configs;
        let cluster_name = format!("{namespace}-{name}");
        let mut config = Config::default();

        config.image_settings = ImageSettings {
            repository: extra.image.repository.clone().unwrap_or_default(),
            pull_policy: extra.image.pull_policy.clone().unwrap_or_default(),
            version: extra.image.version.clone().unwrap_or_default(),
        };

        let ako = &mut config.ako_settings;
        if let Some(level) = extra.log_level {
            ako.log_level = level.as_str();
        }
        if let Some(freq) = extra.full_sync_frequency.as_ref().filter(|f| !f.is_empty()) {
            ako.full_sync_frequency = freq.clone();
        }
        if let Some(port) = extra.api_server_port.filter(|p| *p > 0) {
            ako.api_server_port = port;
        }
        if let Some(disable) = extra.disable_static_route_sync {
            ako.disable_static_route_sync = flag(disable);
        }
        ako.cluster_name = cluster_name.clone();
        ako.cni_plugin = extra.cni_plugin.map(|c| c.as_str()).unwrap_or_default();
        ako.enable_evh = flag(extra.enable_evh.unwrap_or_default());
        ako.layer_7_only = flag(extra.layer7_only.unwrap_or_default());
        ako.services_api = flag(extra.services_api.unwrap_or_default());
        ako.istio_enabled = flag(extra.istio_enabled.unwrap_or_default());
        ako.vip_per_namespace = flag(extra.vip_per_namespace.unwrap_or_default());
        if let Some(sel) = &extra.namespace_selector {
            ako.namespace_selector = NamespaceSelectorSettings {
                label_key: sel.label_key.clone(),
                label_value: sel.label_value.clone(),
            };
        }

        let (subnet_ip, prefix) = parse_cidr(&spec.data_network.cidr)?;
        let vip_networks = vec![VipNetwork {
            network_name: &spec.data_network.name,
            cidr: &spec.data_network.cidr,
        }];
        let networks = &extra.networks_config;
        let cp = adc.control_plane_network();
        config.network_settings = NetworkSettings {
            subnet_ip,
            subnet_prefix: prefix.to_string(),
            network_name: spec.data_network.name.clone(),
            node_network_list: node_network_list_json(&extra.ingress.node_network_list)?,
            vip_network_list: serde_json::to_string(&vip_networks)
                .map_err(Error::SerializationError)?,
            enable_rhi: flag(networks.enable_rhi.unwrap_or_default()),
            nsxt_t1_lr: networks.nsxt_t1_lr.clone().unwrap_or_default(),
            bgp_peer_labels: networks.bgp_peer_labels.clone(),
            control_plane_network_name: cp.map(|n| n.name.clone()).unwrap_or_default(),
            control_plane_network_cidr: cp.map(|n| n.cidr.clone()).unwrap_or_default(),
        };

        let ingress = &extra.ingress;
        let l7 = &mut config.l7_settings;
        l7.disable_ingress_class = flag(ingress.disable_ingress_class.unwrap_or_default());
        l7.default_ing_controller = flag(ingress.default_ingress_controller.unwrap_or_default());
        if let Some(t) = ingress.service_type {
            l7.service_type = t.as_str();
        }
        if let Some(size) = ingress.shard_vs_size {
            l7.shard_vs_size = size.as_str();
        }
        l7.pass_through_shardsize = ingress
            .passthrough_shard_size
            .map(|s| s.as_str())
            .unwrap_or_default();
        l7.no_pg_for_sni = flag(ingress.no_pg_for_sni.unwrap_or_default());

        config.l4_settings = L4Settings {
            default_domain: extra.l4_config.default_domain.clone().unwrap_or_default(),
            auto_fqdn: extra.l4_config.auto_fqdn.clone().unwrap_or_default(),
        };

        config.controller_settings = ControllerSettings {
            service_engine_group_name: spec.service_engine_group.clone(),
            controller_version: spec.controller_version.clone().unwrap_or_default(),
            cloud_name: spec.cloud_name.clone(),
            controller_ip: spec.controller.clone(),
            tenant_name: adc.tenant_name().to_string(),
        };

        config.rbac = Rbac {
            psp_enabled: flag(extra.rbac.psp_enabled),
            psp_policy_api_version: extra.rbac.psp_policy_api_version.clone().unwrap_or_default(),
        };
        config.persistent_volume_claim = extra.log.persistent_volume_claim.clone().unwrap_or_default();
        config.mount_path = extra.log.mount_path.clone().unwrap_or_default();
        config.log_file = extra.log.log_file.clone().unwrap_or_default();

        Ok(Self {
            load_balancer_and_ingress_service: LoadBalancerAndIngressService {
                name: format!("ako-{cluster_name}"),
                namespace: AVI_NAMESPACE.to_string(),
                config,
            },
        })
    }

    pub fn with_credentials(mut self, credentials: AviCredentials) -> Self {
        self.config_mut().avi_credentials = credentials;
        self
    }

    pub fn with_delete_config(mut self, delete: bool) -> Self {
        self.config_mut().ako_settings.delete_config = flag(delete);
        self
    }

    pub fn config(&self) -> &Config {
        &self.load_balancer_and_ingress_service.config
    }

    fn config_mut(&mut self) -> &mut Config {
        &mut self.load_balancer_and_ingress_service.config
    }
}

#[cfg(test)]
mod tests;
