use kube::{CustomResource, Resource, api::ObjectMeta};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

use super::akodeploymentconfig::{AKODeploymentConfig, ShardSize};

/// AKO's `AviInfraSetting`, selecting the SE group and VIP network for a cluster.
#[skip_serializing_none]
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
#[kube(
    group = "ako.vmware.com",
    version = "v1alpha1",
    kind = "AviInfraSetting",
    derive = "Default",
    derive = "PartialEq",
    schema = "disabled"
)]
pub struct AviInfraSettingSpec {
    pub se_group: AviInfraSettingSeGroup,
    pub network: AviInfraSettingNetwork,
    pub l7_settings: Option<AviInfraL7Settings>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct AviInfraSettingSeGroup {
    pub name: String,
}

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AviInfraSettingNetwork {
    #[serde(default)]
    pub vip_networks: Vec<AviInfraSettingVipNetwork>,
    #[serde(rename = "enableRhi")]
    pub enable_rhi: Option<bool>,
}

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AviInfraSettingVipNetwork {
    pub network_name: String,
    pub cidr: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AviInfraL7Settings {
    pub shard_size: String,
}

impl AviInfraSetting {
    /// Desired setting for the ADC's control plane network, owned by the ADC.
    /// `None` when the ADC names no control plane network.
    pub fn for_adc(adc: &AKODeploymentConfig) -> Option<Self> {
        let network = adc.control_plane_network()?;
        let shard_size = adc
            .spec
            .extra_configs
            .ingress
            .shard_vs_size
            .unwrap_or(ShardSize::Small);
        Some(AviInfraSetting {
            metadata: ObjectMeta {
                name: Some(adc.infra_setting_name()),
                owner_references: adc.controller_owner_ref(&()).map(|o| vec![o]),
                ..ObjectMeta::default()
            },
            spec: AviInfraSettingSpec {
                se_group: AviInfraSettingSeGroup {
                    name: adc.spec.service_engine_group.clone(),
                },
                network: AviInfraSettingNetwork {
                    vip_networks: vec![AviInfraSettingVipNetwork {
                        network_name: network.name.clone(),
                        cidr: Some(network.cidr.clone()).filter(|c| !c.is_empty()),
                    }],
                    enable_rhi: None,
                },
                l7_settings: Some(AviInfraL7Settings {
                    shard_size: shard_size.as_str(),
                }),
            },
        })
    }
}
