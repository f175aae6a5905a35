use std::{cmp::Ordering, fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use serde_with::skip_serializing_none;

/// Implemented by every record addressable under `/api/<kind>`.
pub trait AviObject {
    const KIND: &'static str;
    fn uuid(&self) -> Option<&str>;
}

macro_rules! avi_object {
    ($ty:ty, $kind:literal) => {
        impl AviObject for $ty {
            const KIND: &'static str = $kind;
            fn uuid(&self) -> Option<&str> {
                self.uuid.as_deref()
            }
        }
    };
}

/// Query envelope returned by list and get-by-name calls
#[derive(Deserialize, Debug)]
pub struct Collection<T> {
    #[serde(default)]
    pub count: usize,
    #[serde(default = "Vec::new")]
    pub results: Vec<T>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct IpAddr {
    pub addr: String,
    #[serde(rename = "type")]
    pub type_: String,
}

impl IpAddr {
    pub fn new(addr: impl Into<String>, type_: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            type_: type_.into(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct IpAddrPrefix {
    pub ip_addr: IpAddr,
    pub mask: i32,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct IpAddrRange {
    pub begin: IpAddr,
    pub end: IpAddr,
}

#[skip_serializing_none]
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct Subnet {
    pub prefix: IpAddrPrefix,
    pub static_ranges: Option<Vec<IpAddrRange>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[skip_serializing_none]
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct Network {
    pub uuid: Option<String>,
    pub url: Option<String>,
    pub name: String,
    pub cloud_ref: Option<String>,
    #[serde(default)]
    pub configured_subnets: Vec<Subnet>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}
avi_object!(Network, "network");

#[skip_serializing_none]
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct Cloud {
    pub uuid: Option<String>,
    pub url: Option<String>,
    pub name: String,
    pub ipam_provider_ref: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}
avi_object!(Cloud, "cloud");

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct IpamUsableNetwork {
    pub nw_ref: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct IpamDnsInternalProfile {
    #[serde(default)]
    pub usable_networks: Vec<IpamUsableNetwork>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[skip_serializing_none]
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct IpamDnsProviderProfile {
    pub uuid: Option<String>,
    pub url: Option<String>,
    pub name: String,
    #[serde(rename = "type")]
    pub type_: Option<String>,
    pub internal_profile: Option<IpamDnsInternalProfile>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}
avi_object!(IpamDnsProviderProfile, "ipamdnsproviderprofile");

impl IpamDnsProviderProfile {
    pub fn has_usable_network(&self, network_url: &str) -> bool {
        self.internal_profile
            .as_ref()
            .is_some_and(|p| p.usable_networks.iter().any(|n| n.nw_ref == network_url))
    }

    /// Returns true when the network was added.
    pub fn add_usable_network(&mut self, network_url: &str) -> bool {
        if self.has_usable_network(network_url) {
            return false;
        }
        self.internal_profile
            .get_or_insert_with(IpamDnsInternalProfile::default)
            .usable_networks
            .push(IpamUsableNetwork {
                nw_ref: network_url.to_string(),
                extra: Map::new(),
            });
        true
    }
}

#[skip_serializing_none]
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct Tenant {
    pub uuid: Option<String>,
    pub url: Option<String>,
    pub name: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}
avi_object!(Tenant, "tenant");

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct Permission {
    pub resource: String,
    #[serde(rename = "type")]
    pub type_: String,
}

#[skip_serializing_none]
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct Role {
    pub uuid: Option<String>,
    pub url: Option<String>,
    pub name: String,
    pub tenant_ref: Option<String>,
    #[serde(default)]
    pub privileges: Vec<Permission>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}
avi_object!(Role, "role");

#[skip_serializing_none]
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct UserRole {
    pub tenant_ref: Option<String>,
    pub role_ref: Option<String>,
    pub all_tenants: Option<bool>,
}

#[skip_serializing_none]
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct User {
    pub uuid: Option<String>,
    pub url: Option<String>,
    pub name: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub default_tenant_ref: Option<String>,
    #[serde(default)]
    pub access: Vec<UserRole>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}
avi_object!(User, "user");

/// Last path segment of an AVI reference URL, which is the referenced object's uuid.
pub fn uuid_from_ref(reference: &str) -> &str {
    let trimmed = reference.split('#').next().unwrap_or(reference);
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}

/// Dotted AVI controller version such as `22.1.3` or `21.1.4-2p3`.
#[derive(Clone, Debug)]
pub struct ControllerVersion(Vec<u32>);

impl ControllerVersion {
    pub fn new(parts: &[u32]) -> Self {
        Self(parts.to_vec())
    }
}

impl FromStr for ControllerVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let core = s.trim().split(['-', '+']).next().unwrap_or_default();
        let parts = core
            .split('.')
            .map(|p| {
                let digits: String = p.chars().take_while(char::is_ascii_digit).collect();
                digits
                    .parse::<u32>()
                    .map_err(|_| format!("invalid controller version {s:?}"))
            })
            .collect::<Result<Vec<_>, _>>()?;
        if parts.is_empty() {
            return Err(format!("invalid controller version {s:?}"));
        }
        Ok(Self(parts))
    }
}

impl Ord for ControllerVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.0.len().max(other.0.len());
        (0..len)
            .map(|i| {
                let a = self.0.get(i).copied().unwrap_or(0);
                let b = other.0.get(i).copied().unwrap_or(0);
                a.cmp(&b)
            })
            .find(|o| o.is_ne())
            .unwrap_or(Ordering::Equal)
    }
}

impl PartialEq for ControllerVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other).is_eq()
    }
}

impl Eq for ControllerVersion {}

impl PartialOrd for ControllerVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ControllerVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(u32::to_string).collect();
        write!(f, "{}", parts.join("."))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unknown_fields_survive_round_trip() {
        let raw = json!({
            "uuid": "network-1",
            "url": "https://10.0.0.1/api/network/network-1",
            "name": "vip-net",
            "dhcp_enabled": false,
            "configured_subnets": [{
                "prefix": {"ip_addr": {"addr": "10.0.0.0", "type": "V4"}, "mask": 24},
                "static_ranges": [{"begin": {"addr": "10.0.0.3", "type": "V4"}, "end": {"addr": "10.0.0.7", "type": "V4"}}],
                "static_ip_ranges": []
            }]
        });
        let network: Network = serde_json::from_value(raw.clone()).expect("network");
        assert_eq!(network.uuid(), Some("network-1"));
        assert_eq!(network.configured_subnets[0].prefix.mask, 24);
        assert_eq!(serde_json::to_value(&network).expect("json"), raw);
    }

    #[test]
    fn uuid_is_last_ref_segment() {
        assert_eq!(
            uuid_from_ref("https://10.0.0.1/api/ipamdnsproviderprofile/ipam-abc"),
            "ipam-abc"
        );
        assert_eq!(
            uuid_from_ref("https://10.0.0.1/api/tenant/admin#admin"),
            "admin"
        );
        assert_eq!(uuid_from_ref("plain"), "plain");
    }

    #[test]
    fn usable_network_added_once() {
        let mut profile = IpamDnsProviderProfile::default();
        assert!(profile.add_usable_network("https://avi/api/network/n1"));
        assert!(!profile.add_usable_network("https://avi/api/network/n1"));
        assert!(profile.has_usable_network("https://avi/api/network/n1"));
    }

    #[test]
    fn controller_versions_order_numerically() {
        let v = |s: &str| s.parse::<ControllerVersion>().expect("version");
        assert!(v("21.1.4") >= ControllerVersion::new(&[21, 1, 4]));
        assert!(v("21.1.10") > v("21.1.4"));
        assert!(v("20.1.7-9000") < v("21.1.4"));
        assert!(v("30.1.1") >= v("30.0.0"));
        assert_eq!(v("22.1"), v("22.1.0"));
        assert_eq!(v("22.1.3-2p1").to_string(), "22.1.3");
        assert!("abc".parse::<ControllerVersion>().is_err());
    }
}
