//! Admission rules for AKODeploymentConfig.

use std::net::IpAddr;

use ipnet::IpNet;
use kube::{
    ResourceExt,
    core::{
        DynamicObject,
        admission::{AdmissionRequest, AdmissionResponse, Operation},
    },
};
use tracing::*;

use crate::{
    crd::{AKODeploymentConfig, IpPool},
    selector,
};

/// One rejected field with the reason.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldError {
    pub path: String,
    pub reason: String,
}

impl FieldError {
    fn new(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for FieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path, self.reason)
    }
}

fn parse_cidr(path: &str, cidr: &str, errors: &mut Vec<FieldError>) -> Option<IpNet> {
    match cidr.parse::<IpNet>() {
        Ok(net) => Some(net),
        Err(e) => {
            errors.push(FieldError::new(path, format!("invalid CIDR {cidr:?}: {e}")));
            None
        }
    }
}

fn validate_pool(index: usize, pool: &IpPool, net: Option<&IpNet>, errors: &mut Vec<FieldError>) {
    let path = format!("spec.dataNetwork.ipPools[{index}]");
    let start = pool.start.parse::<IpAddr>();
    let end = pool.end.parse::<IpAddr>();
    let (Ok(start), Ok(end)) = (start, end) else {
        errors.push(FieldError::new(
            path,
            format!("invalid address range {}-{}", pool.start, pool.end),
        ));
        return;
    };
    if start > end {
        errors.push(FieldError::new(&path, "start is after end"));
    }
    if let Some(net) = net
        && (!net.contains(&start) || !net.contains(&end))
    {
        errors.push(FieldError::new(&path, format!("range is outside {net}")));
    }
}

/// Violations of the create rules.
pub fn validate_create(adc: &AKODeploymentConfig) -> Vec<FieldError> {
    let mut errors = Vec::new();

    if let Err(e) = selector::validate(&adc.spec.cluster_selector) {
        errors.push(FieldError::new("spec.clusterSelector", e.to_string()));
    } else if !adc.is_default() && !adc.is_management() && adc.has_empty_selector() {
        errors.push(FieldError::new(
            "spec.clusterSelector",
            "must not be empty for a non default AKODeploymentConfig",
        ));
    }

    let net = parse_cidr("spec.dataNetwork.cidr", &adc.spec.data_network.cidr, &mut errors);
    for (i, pool) in adc.spec.data_network.ip_pools.iter().enumerate() {
        validate_pool(i, pool, net.as_ref(), &mut errors);
    }

    if let Some(cp) = adc.control_plane_network()
        && !cp.cidr.is_empty()
    {
        parse_cidr("spec.controlPlaneNetwork.cidr", &cp.cidr, &mut errors);
    }
    errors
}

/// Violations of the update rules: the create rules plus the immutable fields.
pub fn validate_update(old: &AKODeploymentConfig, new: &AKODeploymentConfig) -> Vec<FieldError> {
    let mut errors = validate_create(new);
    let (o, n) = (&old.spec, &new.spec);

    if o.cluster_selector != n.cluster_selector {
        errors.push(FieldError::new("spec.clusterSelector", "field is immutable"));
    }
    if o.data_network.name != n.data_network.name {
        errors.push(FieldError::new("spec.dataNetwork.name", "field is immutable"));
    }
    if o.data_network.cidr != n.data_network.cidr {
        errors.push(FieldError::new("spec.dataNetwork.cidr", "field is immutable"));
    }
    let cp_name = |a: &AKODeploymentConfig| a.spec.control_plane_network.as_ref().map(|c| c.name.clone());
    let cp_cidr = |a: &AKODeploymentConfig| a.spec.control_plane_network.as_ref().map(|c| c.cidr.clone());
    if cp_name(old) != cp_name(new) {
        errors.push(FieldError::new("spec.controlPlaneNetwork.name", "field is immutable"));
    }
    if cp_cidr(old) != cp_cidr(new) {
        errors.push(FieldError::new("spec.controlPlaneNetwork.cidr", "field is immutable"));
    }
    if o.tenant.name != n.tenant.name {
        errors.push(FieldError::new("spec.tenant.name", "field is immutable"));
    }
    if o.tenant.context != n.tenant.context {
        errors.push(FieldError::new("spec.tenant.context", "field is immutable"));
    }
    errors
}

fn parse_adc(obj: &DynamicObject) -> Result<AKODeploymentConfig, String> {
    obj.clone().try_parse::<AKODeploymentConfig>().map_err(|e| e.to_string())
}

/// Answers one admission request for an AKODeploymentConfig.
pub fn review(req: &AdmissionRequest<DynamicObject>) -> AdmissionResponse {
    let res = AdmissionResponse::from(req);
    let errors = match (&req.operation, &req.object, &req.old_object) {
        (Operation::Delete | Operation::Connect, _, _) => return res,
        (Operation::Create, Some(obj), _) => parse_adc(obj).map(|adc| validate_create(&adc)),
        (Operation::Update, Some(obj), Some(old)) => parse_adc(obj)
            .and_then(|new| parse_adc(old).map(|old| validate_update(&old, &new))),
        _ => Err("request carries no object".to_string()),
    };

    let name = req.object.as_ref().map(|o| o.name_any()).unwrap_or_default();
    match errors {
        Ok(errors) if errors.is_empty() => {
            debug!("accepted: {:?} on {}", req.operation, name);
            res
        }
        Ok(errors) => {
            let message = errors
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ");
            warn!("denied: {:?} on {} ({})", req.operation, name, message);
            res.deny(message)
        }
        Err(e) => {
            warn!("denied: {:?} on {} ({})", req.operation, name, e);
            res.deny(e)
        }
    }
}
