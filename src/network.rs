//! Data network configuration on the AVI controller and the control plane
//! AviInfraSetting owned by the ADC.

use std::{net::IpAddr, time::Duration};

use futures::{FutureExt, future::BoxFuture};
use ipnet::IpNet;
use kube::{
    Api, ResourceExt,
    api::{DeleteParams, Patch, PatchParams},
};
use tracing::*;

use crate::{
    Error, Result,
    avi::{self, AviClient, IpAddrPrefix, IpAddrRange, Network, Subnet},
    crd::{AKODeploymentConfig, AviInfraSetting, IpPool, MANAGER_NAME},
    events_helper::emit_info,
    phases::{PhaseContext, ReconcileResult, labeled_clusters},
};

/// Requeue used while the cloud or its IPAM profile is missing
pub const INFRA_REQUEUE: Duration = Duration::from_secs(60);

/// Attempts at a read-modify-write against the controller before giving up on
/// concurrent updates
const AVI_CONFLICT_RETRIES: usize = 3;

fn addr_type(addr: &IpAddr) -> &'static str {
    match addr {
        IpAddr::V4(_) => "V4",
        IpAddr::V6(_) => "V6",
    }
}

fn pool_type(pool: &IpPool) -> String {
    if !pool.type_.is_empty() {
        return pool.type_.clone();
    }
    pool.start
        .parse::<IpAddr>()
        .map(|a| addr_type(&a).to_string())
        .unwrap_or_else(|_| "V4".to_string())
}

pub fn static_ranges_from_pools(pools: &[IpPool]) -> Vec<IpAddrRange> {
    pools
        .iter()
        .map(|pool| {
            let type_ = pool_type(pool);
            IpAddrRange {
                begin: avi::IpAddr::new(&pool.start, &type_),
                end: avi::IpAddr::new(&pool.end, type_),
            }
        })
        .collect()
}

// v4 addresses compare in their v6-mapped form so mixed lists still order
fn addr_key(addr: &str) -> Option<[u8; 16]> {
    addr.parse::<IpAddr>().ok().map(|ip| match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
        IpAddr::V6(v6) => v6.octets(),
    })
}

pub fn sort_static_ranges(ranges: &mut [IpAddrRange]) {
    ranges.sort_by(|a, b| addr_key(&a.begin.addr).cmp(&addr_key(&b.begin.addr)));
}

/// Order-insensitive comparison of the `(begin, end)` pairs.
pub fn is_static_range_equal(a: &[IpAddrRange], b: &[IpAddrRange]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut a = a.to_vec();
    let mut b = b.to_vec();
    sort_static_ranges(&mut a);
    sort_static_ranges(&mut b);
    a.iter()
        .zip(&b)
        .all(|(x, y)| x.begin.addr == y.begin.addr && x.end.addr == y.end.addr)
}

/// Replaces the subnet's static ranges with the pools when they differ.
/// An empty pool list leaves the subnet alone.
pub fn ensure_static_ranges(subnet: &mut Subnet, pools: &[IpPool]) -> bool {
    if pools.is_empty() {
        return false;
    }
    let desired = static_ranges_from_pools(pools);
    let current = subnet.static_ranges.as_deref().unwrap_or_default();
    if is_static_range_equal(&desired, current) {
        return false;
    }
    subnet.static_ranges = Some(desired);
    true
}

/// Makes sure `network` has a subnet for `cidr` carrying the pools as static ranges.
///
/// Returns whether the network was modified.
pub fn ensure_subnet(network: &mut Network, cidr: &IpNet, pools: &[IpPool]) -> bool {
    let prefix_addr = cidr.network().to_string();
    let mask = i32::from(cidr.prefix_len());
    if let Some(subnet) = network
        .configured_subnets
        .iter_mut()
        .find(|s| s.prefix.ip_addr.addr == prefix_addr && s.prefix.mask == mask)
    {
        return ensure_static_ranges(subnet, pools);
    }

    let ranges = static_ranges_from_pools(pools);
    network.configured_subnets.push(Subnet {
        prefix: IpAddrPrefix {
            ip_addr: avi::IpAddr::new(prefix_addr, addr_type(&cidr.addr())),
            mask,
        },
        static_ranges: (!ranges.is_empty()).then_some(ranges),
        ..Subnet::default()
    });
    true
}

/// Brings the data network's subnet in line with the ADC. Returns whether an update was sent.
pub async fn sync_network_subnets(avi: &dyn AviClient, adc: &AKODeploymentConfig) -> Result<bool> {
    let data_network = &adc.spec.data_network;
    let cidr: IpNet = data_network.cidr.parse().map_err(|e| {
        Error::InvalidInput(format!("data network cidr {:?}: {e}", data_network.cidr))
    })?;

    let mut attempt = 0;
    loop {
        attempt += 1;
        let mut network = match avi
            .network_get_by_name(&data_network.name, &adc.spec.cloud_name)
            .await
        {
            Ok(n) => n,
            Err(e) if e.is_not_found() => {
                warn!(network = %data_network.name, "data network not found on the AVI controller, skipping");
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };

        if !ensure_subnet(&mut network, &cidr, &data_network.ip_pools) {
            debug!(network = %data_network.name, "no change detected for network");
            return Ok(false);
        }
        match avi.network_update(&network).await {
            Ok(_) => {
                info!(network = %data_network.name, subnets = network.configured_subnets.len(), "network updated");
                return Ok(true);
            }
            Err(e) if e.is_conflict() && attempt < AVI_CONFLICT_RETRIES => {
                debug!(network = %data_network.name, "concurrent network update, retrying ({attempt}/{AVI_CONFLICT_RETRIES})");
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Attaches the data network to the cloud's IPAM profile.
pub async fn attach_usable_network(
    avi: &dyn AviClient,
    adc: &AKODeploymentConfig,
) -> Result<ReconcileResult> {
    let cloud_name = &adc.spec.cloud_name;
    let network_name = &adc.spec.data_network.name;
    let requeue = ReconcileResult::requeue_after(INFRA_REQUEUE);

    let network = match avi.network_get_by_name(network_name, cloud_name).await {
        Ok(n) => n,
        Err(e) if e.is_not_found() => {
            warn!(network = %network_name, "data network not found, requeue");
            return Ok(requeue);
        }
        Err(e) => return Err(e.into()),
    };
    let Some(network_url) = network.url.clone() else {
        warn!(network = %network_name, "network has no url, requeue");
        return Ok(requeue);
    };

    let cloud = match avi.cloud_get_by_name(cloud_name).await {
        Ok(c) => c,
        Err(e) if e.is_not_found() => {
            warn!(cloud = %cloud_name, "cloud not found, requeue");
            return Ok(requeue);
        }
        Err(e) => return Err(e.into()),
    };
    let Some(ipam_ref) = cloud.ipam_provider_ref.as_deref() else {
        info!(cloud = %cloud_name, "no IPAM provider registered for the cloud, requeue");
        return Ok(requeue);
    };

    let ipam_uuid = avi::uuid_from_ref(ipam_ref);
    let mut attempt = 0;
    loop {
        attempt += 1;
        let mut profile = match avi.ipam_profile_get(ipam_uuid).await {
            Ok(p) => p,
            Err(e) if e.is_not_found() => {
                warn!(cloud = %cloud_name, ipam = %ipam_ref, "IPAM profile not found, requeue");
                return Ok(requeue);
            }
            Err(e) => return Err(e.into()),
        };

        if !profile.add_usable_network(&network_url) {
            debug!(cloud = %cloud_name, network = %network_name, "network already usable");
            return Ok(ReconcileResult::done());
        }
        match avi.ipam_profile_update(&profile).await {
            Ok(_) => {
                info!(cloud = %cloud_name, network = %network_name, "added usable network to IPAM profile");
                return Ok(ReconcileResult::done());
            }
            Err(e) if e.is_conflict() && attempt < AVI_CONFLICT_RETRIES => {
                debug!(ipam = %ipam_ref, "concurrent IPAM profile update, retrying ({attempt}/{AVI_CONFLICT_RETRIES})");
            }
            Err(e) => return Err(e.into()),
        }
    }
}

pub fn reconcile_network_subnets<'a>(
    ctx: &'a PhaseContext,
    adc: &'a AKODeploymentConfig,
) -> BoxFuture<'a, Result<ReconcileResult>> {
    async move {
        let avi = ctx.avi_client(adc).await?;
        if sync_network_subnets(avi.as_ref(), adc).await? {
            emit_info(
                &ctx.recorder,
                adc,
                "AviNetworkUpdated",
                "UpdateNetwork",
                Some(format!("static ranges of {} updated", adc.spec.data_network.name)),
            )
            .await;
        }
        Ok(ReconcileResult::done())
    }
    .boxed()
}

pub fn reconcile_cloud_usable_network<'a>(
    ctx: &'a PhaseContext,
    adc: &'a AKODeploymentConfig,
) -> BoxFuture<'a, Result<ReconcileResult>> {
    async move {
        let avi = ctx.avi_client(adc).await?;
        attach_usable_network(avi.as_ref(), adc).await
    }
    .boxed()
}

pub fn reconcile_avi_infra_setting<'a>(
    ctx: &'a PhaseContext,
    adc: &'a AKODeploymentConfig,
) -> BoxFuture<'a, Result<ReconcileResult>> {
    async move {
        let Some(desired) = AviInfraSetting::for_adc(adc) else {
            debug!(adc = %adc.name_any(), "no control plane network, skipping AviInfraSetting");
            return Ok(ReconcileResult::done());
        };
        let api: Api<AviInfraSetting> = Api::all(ctx.client.clone());
        api.patch(
            &desired.name_any(),
            &PatchParams::apply(MANAGER_NAME).force(),
            &Patch::Apply(&desired),
        )
        .await
        .map_err(Error::KubeError)?;
        debug!(adc = %adc.name_any(), setting = %desired.name_any(), "AviInfraSetting applied");
        Ok(ReconcileResult::done())
    }
    .boxed()
}

/// Removes the AviInfraSetting once no cluster is labeled for the ADC.
pub fn reconcile_avi_infra_setting_delete<'a>(
    ctx: &'a PhaseContext,
    adc: &'a AKODeploymentConfig,
) -> BoxFuture<'a, Result<ReconcileResult>> {
    async move {
        let labeled = labeled_clusters(&ctx.client, adc).await?;
        if !labeled.is_empty() {
            info!(
                adc = %adc.name_any(),
                clusters = labeled.len(),
                "clusters still managed by the ADC, keeping AviInfraSetting"
            );
            return Ok(ReconcileResult::done());
        }

        let api: Api<AviInfraSetting> = Api::all(ctx.client.clone());
        match api.delete(&adc.infra_setting_name(), &DeleteParams::default()).await {
            Ok(_) => info!(adc = %adc.name_any(), "AviInfraSetting deleted"),
            Err(kube::Error::Api(resp)) if resp.code == 404 => {}
            Err(e) => return Err(Error::KubeError(e)),
        }
        Ok(ReconcileResult::done())
    }
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::avi::{AviError, Cloud, IpamDnsProviderProfile, MockAviClient};
    use crate::crd::DataNetwork;

    fn pool(start: &str, end: &str) -> IpPool {
        IpPool {
            start: start.into(),
            end: end.into(),
            type_: "V4".into(),
        }
    }

    fn range(begin: &str, end: &str) -> IpAddrRange {
        IpAddrRange {
            begin: avi::IpAddr::new(begin, "V4"),
            end: avi::IpAddr::new(end, "V4"),
        }
    }

    fn subnet(addr: &str, mask: i32, ranges: Vec<IpAddrRange>) -> Subnet {
        Subnet {
            prefix: IpAddrPrefix {
                ip_addr: avi::IpAddr::new(addr, "V4"),
                mask,
            },
            static_ranges: Some(ranges),
            ..Subnet::default()
        }
    }

    fn cidr(s: &str) -> IpNet {
        s.parse().unwrap()
    }

    fn adc() -> AKODeploymentConfig {
        let mut adc = AKODeploymentConfig::new("ako-a", Default::default());
        adc.spec.cloud_name = "Default-Cloud".into();
        adc.spec.data_network = DataNetwork {
            name: "vip-net".into(),
            cidr: "10.0.0.0/24".into(),
            ip_pools: vec![pool("10.0.0.3", "10.0.0.7")],
        };
        adc
    }

    fn not_found(kind: &str, name: &str) -> AviError {
        AviError::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    #[test]
    fn range_equality_ignores_order() {
        let a = vec![range("1.1.1.1", "1.1.1.3"), range("1.1.1.5", "1.1.1.7")];
        let b = vec![range("1.1.1.5", "1.1.1.7"), range("1.1.1.1", "1.1.1.3")];
        assert!(is_static_range_equal(&a, &a));
        assert!(is_static_range_equal(&a, &b));
        assert!(!is_static_range_equal(&a, &a[..1]));
        assert!(!is_static_range_equal(&a, &[range("1.1.1.1", "1.1.1.4"), range("1.1.1.5", "1.1.1.7")]));
    }

    #[test]
    fn sort_uses_numeric_order() {
        let mut ranges = vec![range("10.0.0.20", "10.0.0.30"), range("10.0.0.3", "10.0.0.7")];
        sort_static_ranges(&mut ranges);
        assert_eq!(ranges[0].begin.addr, "10.0.0.3");
    }

    #[test]
    fn missing_subnet_is_appended() {
        let mut network = Network::default();
        assert!(ensure_subnet(&mut network, &cidr("10.0.0.0/24"), &[pool("10.0.0.3", "10.0.0.7")]));
        let s = &network.configured_subnets[0];
        assert_eq!(s.prefix.ip_addr, avi::IpAddr::new("10.0.0.0", "V4"));
        assert_eq!(s.prefix.mask, 24);
        assert_eq!(s.static_ranges.as_deref(), Some(&[range("10.0.0.3", "10.0.0.7")][..]));
        // second pass is a no-op
        assert!(!ensure_subnet(&mut network, &cidr("10.0.0.0/24"), &[pool("10.0.0.3", "10.0.0.7")]));
    }

    #[test]
    fn same_pools_in_other_order_do_not_modify() {
        let mut network = Network {
            configured_subnets: vec![subnet(
                "1.1.1.0",
                24,
                vec![range("1.1.1.1", "1.1.1.3"), range("1.1.1.5", "1.1.1.7")],
            )],
            ..Network::default()
        };
        let pools = [pool("1.1.1.5", "1.1.1.7"), pool("1.1.1.1", "1.1.1.3")];
        assert!(!ensure_subnet(&mut network, &cidr("1.1.1.0/24"), &pools));
    }

    #[test]
    fn pools_replace_existing_ranges() {
        let mut network = Network {
            configured_subnets: vec![subnet("1.1.1.0", 24, vec![range("1.1.1.1", "1.1.1.3")])],
            ..Network::default()
        };
        let pools = [pool("1.1.1.1", "1.1.1.3"), pool("1.1.1.10", "1.1.1.20")];
        assert!(ensure_subnet(&mut network, &cidr("1.1.1.0/24"), &pools));
        assert_eq!(network.configured_subnets.len(), 1);
        assert_eq!(
            network.configured_subnets[0].static_ranges.as_ref().map(Vec::len),
            Some(2)
        );
    }

    #[test]
    fn empty_pools_leave_ranges_untouched() {
        let existing = vec![range("1.1.1.1", "1.1.1.3")];
        let mut network = Network {
            configured_subnets: vec![subnet("1.1.1.0", 24, existing.clone())],
            ..Network::default()
        };
        assert!(!ensure_subnet(&mut network, &cidr("1.1.1.0/24"), &[]));
        assert_eq!(network.configured_subnets[0].static_ranges, Some(existing));
    }

    #[test]
    fn empty_ranges_are_populated() {
        let mut s = Subnet::default();
        assert!(ensure_static_ranges(&mut s, &[pool("1.1.1.1", "1.1.1.3")]));
        assert_eq!(s.static_ranges, Some(vec![range("1.1.1.1", "1.1.1.3")]));
    }

    #[test]
    fn subnet_matches_on_network_address() {
        let mut network = Network {
            configured_subnets: vec![subnet("10.0.0.0", 24, vec![])],
            ..Network::default()
        };
        // host bits in the CIDR are masked off before matching
        assert!(ensure_subnet(&mut network, &cidr("10.0.0.5/24"), &[pool("10.0.0.3", "10.0.0.7")]));
        assert_eq!(network.configured_subnets.len(), 1);
    }

    #[test]
    fn v6_pools_get_v6_type() {
        let pools = [IpPool {
            start: "fd00::10".into(),
            end: "fd00::20".into(),
            type_: String::new(),
        }];
        assert_eq!(static_ranges_from_pools(&pools)[0].begin.type_, "V6");
    }

    #[tokio::test]
    async fn network_update_only_on_change() {
        let mut avi = MockAviClient::new();
        avi.expect_network_get_by_name()
            .withf(|name, cloud| name == "vip-net" && cloud == "Default-Cloud")
            .times(1)
            .returning(|_, _| Ok(Network { name: "vip-net".into(), ..Network::default() }));
        avi.expect_network_update()
            .withf(|n| n.configured_subnets.len() == 1)
            .times(1)
            .returning(|n| Ok(n.clone()));
        assert!(sync_network_subnets(&avi, &adc()).await.unwrap());
    }

    fn concurrent_update() -> AviError {
        AviError::Api {
            status: 412,
            message: "Concurrent Update Error".into(),
        }
    }

    #[tokio::test]
    async fn network_update_retries_after_conflict() {
        let mut avi = MockAviClient::new();
        avi.expect_network_get_by_name()
            .times(2)
            .returning(|_, _| Ok(Network { name: "vip-net".into(), ..Network::default() }));
        let mut seq = mockall::Sequence::new();
        avi.expect_network_update()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(concurrent_update()));
        avi.expect_network_update()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|n| Ok(n.clone()));
        assert!(sync_network_subnets(&avi, &adc()).await.unwrap());
    }

    #[tokio::test]
    async fn network_update_gives_up_on_persistent_conflict() {
        let mut avi = MockAviClient::new();
        avi.expect_network_get_by_name()
            .times(AVI_CONFLICT_RETRIES)
            .returning(|_, _| Ok(Network::default()));
        avi.expect_network_update()
            .times(AVI_CONFLICT_RETRIES)
            .returning(|_| Err(concurrent_update()));
        let err = sync_network_subnets(&avi, &adc()).await.unwrap_err();
        assert!(matches!(err, Error::AviError(ref e) if e.is_conflict()));
    }

    #[tokio::test]
    async fn unparsable_cidr_is_invalid_input() {
        let mut avi = MockAviClient::new();
        avi.expect_network_get_by_name().never();
        avi.expect_network_update().never();
        let mut bad = adc();
        bad.spec.data_network.cidr = "10.0.0.0/33".into();
        let err = sync_network_subnets(&avi, &bad).await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn missing_network_is_skipped() {
        let mut avi = MockAviClient::new();
        avi.expect_network_get_by_name()
            .returning(|name, _| Err(not_found("network", name)));
        avi.expect_network_update().never();
        assert!(!sync_network_subnets(&avi, &adc()).await.unwrap());
    }

    #[tokio::test]
    async fn usable_network_added_when_missing() {
        let mut avi = MockAviClient::new();
        avi.expect_network_get_by_name().returning(|_, _| {
            Ok(Network {
                name: "vip-net".into(),
                url: Some("https://avi/api/network/net-1".into()),
                ..Network::default()
            })
        });
        avi.expect_cloud_get_by_name().returning(|_| {
            Ok(Cloud {
                name: "Default-Cloud".into(),
                ipam_provider_ref: Some("https://avi/api/ipamdnsproviderprofile/ipam-1".into()),
                ..Cloud::default()
            })
        });
        avi.expect_ipam_profile_get()
            .withf(|uuid| uuid == "ipam-1")
            .returning(|_| Ok(IpamDnsProviderProfile::default()));
        avi.expect_ipam_profile_update()
            .withf(|p| p.has_usable_network("https://avi/api/network/net-1"))
            .times(1)
            .returning(|p| Ok(p.clone()));
        let result = attach_usable_network(&avi, &adc()).await.unwrap();
        assert_eq!(result, ReconcileResult::done());
    }

    #[tokio::test]
    async fn ipam_profile_update_retries_after_conflict() {
        let mut avi = MockAviClient::new();
        avi.expect_network_get_by_name().returning(|_, _| {
            Ok(Network {
                url: Some("https://avi/api/network/net-1".into()),
                ..Network::default()
            })
        });
        avi.expect_cloud_get_by_name().returning(|_| {
            Ok(Cloud {
                ipam_provider_ref: Some("https://avi/api/ipamdnsproviderprofile/ipam-1".into()),
                ..Cloud::default()
            })
        });
        avi.expect_ipam_profile_get()
            .times(2)
            .returning(|_| Ok(IpamDnsProviderProfile::default()));
        let mut seq = mockall::Sequence::new();
        avi.expect_ipam_profile_update()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(concurrent_update()));
        avi.expect_ipam_profile_update()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|p| Ok(p.clone()));
        let result = attach_usable_network(&avi, &adc()).await.unwrap();
        assert_eq!(result, ReconcileResult::done());
    }

    #[tokio::test]
    async fn cloud_without_ipam_requeues() {
        let mut avi = MockAviClient::new();
        avi.expect_network_get_by_name().returning(|_, _| {
            Ok(Network {
                url: Some("https://avi/api/network/net-1".into()),
                ..Network::default()
            })
        });
        avi.expect_cloud_get_by_name().returning(|_| Ok(Cloud::default()));
        avi.expect_ipam_profile_get().never();
        let result = attach_usable_network(&avi, &adc()).await.unwrap();
        assert_eq!(result.requeue_after, Some(INFRA_REQUEUE));
    }

    #[tokio::test]
    async fn missing_cloud_requeues() {
        let mut avi = MockAviClient::new();
        avi.expect_network_get_by_name().returning(|_, _| {
            Ok(Network {
                url: Some("https://avi/api/network/net-1".into()),
                ..Network::default()
            })
        });
        avi.expect_cloud_get_by_name()
            .returning(|name| Err(not_found("cloud", name)));
        let result = attach_usable_network(&avi, &adc()).await.unwrap();
        assert_eq!(result.requeue_after, Some(INFRA_REQUEUE));
    }
}
