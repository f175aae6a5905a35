//! Keeps a Cluster consistent with the ADC that currently claims it, and
//! provides its control plane VIP when AVI is the HA provider.

mod main;
pub use main::*;

use crate::{
    crd::{AKODeploymentConfig, Cluster},
    selector,
};

/// What the Cluster controller does with a labeled cluster after re-matching it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Membership {
    /// The cluster carries no ADC label
    Unmanaged,
    /// No ADC selects it any more; detach it
    Orphaned,
    /// Only the default ADC matches; it must not be skipped by the default
    DefaultOnly,
    /// Claimed by this non-default ADC
    Claimed(String),
}

pub fn membership(adcs: &[AKODeploymentConfig], cluster: &Cluster) -> Membership {
    if selector::cluster_adc_label(cluster).is_none() {
        return Membership::Unmanaged;
    }
    match selector::adc_for_cluster(adcs, cluster) {
        None => Membership::Orphaned,
        Some(adc) if adc.is_default() => Membership::DefaultOnly,
        Some(adc) => Membership::Claimed(kube::ResourceExt::name_any(adc)),
    }
}

/// Re-matches a labeled cluster and points its ADC label at the winner.
///
/// An orphaned cluster loses both labels so the default ADC can pick it up.
pub fn relabel(adcs: &[AKODeploymentConfig], cluster: &mut Cluster) -> Membership {
    let membership = membership(adcs, cluster);
    match &membership {
        Membership::Unmanaged => {}
        Membership::Orphaned => selector::remove_cluster_label(cluster),
        Membership::DefaultOnly | Membership::Claimed(_) => {
            if let Some(adc) = selector::adc_for_cluster(adcs, cluster) {
                selector::apply_cluster_label(cluster, adc);
            }
        }
    }
    membership
}
