use super::*;
use crate::crd::{ControlPlaneNetwork, LogLevel, NodeNetwork};
use serde_json::json;

fn adc() -> AKODeploymentConfig {
    serde_json::from_value(json!({
        "apiVersion": "networking.tkg.tanzu.vmware.com/v1alpha1",
        "kind": "AKODeploymentConfig",
        "metadata": {"name": "ako-a"},
        "spec": {
            "cloudName": "Default-Cloud",
            "controller": "10.23.122.1",
            "controllerVersion": "22.1.3",
            "serviceEngineGroup": "Default-SEG",
            "adminCredentialRef": {"name": "creds", "namespace": "tkg-system-networking"},
            "certificateAuthorityRef": {"name": "ca", "namespace": "tkg-system-networking"},
            "dataNetwork": {"name": "vip-net", "cidr": "10.0.0.0/24"}
        }
    }))
    .expect("valid adc")
}

#[test]
fn defaults_fill_unset_settings() {
    let values = AddonValues::for_cluster(&adc(), "default", "wc1").unwrap();
    let lbis = &values.load_balancer_and_ingress_service;
    assert_eq!(lbis.name, "ako-default-wc1");
    assert_eq!(lbis.namespace, "avi-system");

    let cfg = values.config();
    assert_eq!(cfg.replica_count, 1);
    assert_eq!(cfg.ako_settings.log_level, "INFO");
    assert_eq!(cfg.ako_settings.full_sync_frequency, "1800");
    assert_eq!(cfg.ako_settings.api_server_port, 8080);
    assert_eq!(cfg.ako_settings.delete_config, "false");
    assert_eq!(cfg.ako_settings.disable_static_route_sync, "true");
    assert_eq!(cfg.ako_settings.cluster_name, "default-wc1");
    assert_eq!(cfg.l7_settings.service_type, "NodePort");
    assert_eq!(cfg.l7_settings.shard_vs_size, "SMALL");
    assert_eq!(cfg.resources.limits.cpu, "250m");
    assert_eq!(cfg.resources.request.memory, "200Mi");
    assert_eq!(cfg.controller_settings.tenant_name, "admin");
    assert_eq!(cfg.controller_settings.controller_version, "22.1.3");
    assert_eq!(cfg.network_settings.node_network_list, "");
}

#[test]
fn data_network_is_split_into_address_and_prefix() {
    let values = AddonValues::for_cluster(&adc(), "default", "wc1").unwrap();
    let net = &values.config().network_settings;
    assert_eq!(net.subnet_ip, "10.0.0.0");
    assert_eq!(net.subnet_prefix, "24");
    assert_eq!(net.network_name, "vip-net");
    let vips: serde_json::Value = serde_json::from_str(&net.vip_network_list).unwrap();
    assert_eq!(vips, json!([{"networkName": "vip-net", "cidr": "10.0.0.0/24"}]));
}

#[test]
fn extra_configs_override_defaults() {
    let mut adc = adc();
    let extra = &mut adc.spec.extra_configs;
    extra.log_level = Some(LogLevel::Debug);
    extra.enable_evh = Some(true);
    extra.ingress.node_network_list = vec![NodeNetwork {
        network_name: "node-net".into(),
        cidrs: vec!["10.1.0.0/16".into()],
    }];
    adc.spec.control_plane_network = Some(ControlPlaneNetwork {
        name: "cp-net".into(),
        cidr: "10.2.0.0/24".into(),
    });

    let values = AddonValues::for_cluster(&adc, "ns", "c").unwrap();
    let cfg = values.config();
    assert_eq!(cfg.ako_settings.log_level, "DEBUG");
    assert_eq!(cfg.ako_settings.enable_evh, "true");
    assert_eq!(
        cfg.network_settings.node_network_list,
        r#"[{"networkName":"node-net","cidrs":["10.1.0.0/16"]}]"#
    );
    assert_eq!(cfg.network_settings.control_plane_network_name, "cp-net");
    assert_eq!(cfg.network_settings.control_plane_network_cidr, "10.2.0.0/24");
}

#[test]
fn invalid_data_network_cidr_is_rejected() {
    let mut adc = adc();
    adc.spec.data_network.cidr = "10.0.0.0/40".into();
    let err = AddonValues::for_cluster(&adc, "ns", "c").unwrap_err();
    assert_eq!(err.kind(), crate::ErrorKind::InvalidInput);
}

#[test]
fn ipv6_cidr_parses() {
    assert_eq!(parse_cidr("fd00::/64").unwrap(), ("fd00::".to_string(), 64));
}

#[test]
fn rendered_document_starts_with_directives() {
    let values = AddonValues::for_cluster(&adc(), "default", "wc1")
        .unwrap()
        .with_credentials(AviCredentials {
            username: "ako-default-wc1".into(),
            password: "pw".into(),
            certificate_authority_data: "CA".into(),
        });
    let doc = values.render().unwrap();
    assert!(doc.starts_with(DATA_VALUES_HEADER));
    assert_eq!(AddonValues::parse(&doc).unwrap(), values);
}

#[test]
fn delete_config_flip_keeps_other_values() {
    let values = AddonValues::for_cluster(&adc(), "default", "wc1").unwrap();
    let doc = set_delete_config(&values.render().unwrap()).unwrap();
    assert!(doc.starts_with(DATA_VALUES_HEADER));
    let parsed = AddonValues::parse(&doc).unwrap();
    assert_eq!(parsed.config().ako_settings.delete_config, "true");
    assert_eq!(parsed, values.with_delete_config(true));
}

#[test]
fn delete_config_flip_needs_ako_settings() {
    assert!(set_delete_config("foo: bar\n").is_err());
}
