use crate::avi::{ControllerVersion, Permission};

pub const AKO_ROLE_NAME: &str = "ako-essential-role";

pub const WRITE_ACCESS: &str = "WRITE_ACCESS";
pub const READ_ACCESS: &str = "READ_ACCESS";
pub const NO_ACCESS: &str = "NO_ACCESS";

/// One entry of the role's resource to access map.
#[derive(Clone, Copy, Debug)]
pub struct RolePermission {
    pub resource: &'static str,
    pub access: &'static str,
    /// First controller version that no longer knows the resource
    pub deprecated_since: Option<[u32; 3]>,
}

impl RolePermission {
    const fn new(resource: &'static str, access: &'static str) -> Self {
        Self {
            resource,
            access,
            deprecated_since: None,
        }
    }

    const fn deprecated(self, since: [u32; 3]) -> Self {
        Self {
            deprecated_since: Some(since),
            ..self
        }
    }

    pub fn is_deprecated_at(&self, version: &ControllerVersion) -> bool {
        self.deprecated_since
            .is_some_and(|since| *version >= ControllerVersion::new(&since))
    }
}

const ENTERPRISE_30: [u32; 3] = [30, 0, 0];

pub static AKO_ROLE_PERMISSIONS: [RolePermission; 57] = [
    RolePermission::new("PERMISSION_VIRTUALSERVICE", WRITE_ACCESS),
    RolePermission::new("PERMISSION_POOL", WRITE_ACCESS),
    RolePermission::new("PERMISSION_POOLGROUP", WRITE_ACCESS),
    RolePermission::new("PERMISSION_HTTPPOLICYSET", WRITE_ACCESS),
    RolePermission::new("PERMISSION_NETWORKSECURITYPOLICY", WRITE_ACCESS),
    RolePermission::new("PERMISSION_AUTOSCALE", WRITE_ACCESS),
    RolePermission::new("PERMISSION_DNSPOLICY", WRITE_ACCESS),
    RolePermission::new("PERMISSION_NETWORKPROFILE", WRITE_ACCESS),
    RolePermission::new("PERMISSION_APPLICATIONPROFILE", WRITE_ACCESS),
    RolePermission::new("PERMISSION_APPLICATIONPERSISTENCEPROFILE", WRITE_ACCESS),
    RolePermission::new("PERMISSION_HEALTHMONITOR", WRITE_ACCESS),
    RolePermission::new("PERMISSION_ANALYTICSPROFILE", WRITE_ACCESS),
    RolePermission::new("PERMISSION_IPAMDNSPROVIDERPROFILE", WRITE_ACCESS),
    RolePermission::new("PERMISSION_CUSTOMIPAMDNSPROFILE", WRITE_ACCESS),
    RolePermission::new("PERMISSION_TRAFFICCLONEPROFILE", WRITE_ACCESS),
    RolePermission::new("PERMISSION_VSDATASCRIPTSET", WRITE_ACCESS),
    RolePermission::new("PERMISSION_PKIPROFILE", WRITE_ACCESS),
    RolePermission::new("PERMISSION_SSLKEYANDCERTIFICATE", WRITE_ACCESS),
    RolePermission::new("PERMISSION_SERVICEENGINEGROUP", WRITE_ACCESS),
    RolePermission::new("PERMISSION_NETWORK", WRITE_ACCESS),
    RolePermission::new("PERMISSION_VRFCONTEXT", WRITE_ACCESS),
    RolePermission::new("PERMISSION_L4POLICYSET", WRITE_ACCESS),
    RolePermission::new("PERMISSION_IPADDRGROUP", READ_ACCESS),
    RolePermission::new("PERMISSION_STRINGGROUP", READ_ACCESS),
    RolePermission::new("PERMISSION_PROTOCOLPARSER", READ_ACCESS),
    RolePermission::new("PERMISSION_SSLPROFILE", READ_ACCESS),
    RolePermission::new("PERMISSION_AUTHPROFILE", READ_ACCESS),
    RolePermission::new("PERMISSION_PINGACCESSAGENT", READ_ACCESS).deprecated(ENTERPRISE_30),
    RolePermission::new("PERMISSION_CERTIFICATEMANAGEMENTPROFILE", READ_ACCESS),
    RolePermission::new("PERMISSION_HARDWARESECURITYMODULEGROUP", READ_ACCESS)
        .deprecated(ENTERPRISE_30),
    RolePermission::new("PERMISSION_SSOPOLICY", READ_ACCESS),
    RolePermission::new("PERMISSION_WAFPROFILE", READ_ACCESS),
    RolePermission::new("PERMISSION_WAFPOLICY", READ_ACCESS),
    RolePermission::new("PERMISSION_CLOUD", READ_ACCESS),
    RolePermission::new("PERMISSION_SERVICEENGINE", READ_ACCESS),
    RolePermission::new("PERMISSION_SYSTEMCONFIGURATION", READ_ACCESS),
    RolePermission::new("PERMISSION_TENANT", READ_ACCESS),
    RolePermission::new("PERMISSION_NATPOLICY", NO_ACCESS),
    RolePermission::new("PERMISSION_WAFPOLICYPSMGROUP", NO_ACCESS),
    RolePermission::new("PERMISSION_ERRORPAGEPROFILE", NO_ACCESS),
    RolePermission::new("PERMISSION_ERRORPAGEBODY", NO_ACCESS),
    RolePermission::new("PERMISSION_ALERTCONFIG", NO_ACCESS),
    RolePermission::new("PERMISSION_ALERT", NO_ACCESS),
    RolePermission::new("PERMISSION_ACTIONGROUPCONFIG", NO_ACCESS),
    RolePermission::new("PERMISSION_ALERTSYSLOGCONFIG", NO_ACCESS),
    RolePermission::new("PERMISSION_ALERTEMAILCONFIG", NO_ACCESS),
    RolePermission::new("PERMISSION_SNMPTRAPPROFILE", NO_ACCESS),
    RolePermission::new("PERMISSION_TRAFFIC_CAPTURE", NO_ACCESS),
    RolePermission::new("PERMISSION_USER_CREDENTIAL", NO_ACCESS),
    RolePermission::new("PERMISSION_CONTROLLER", NO_ACCESS),
    RolePermission::new("PERMISSION_REBOOT", NO_ACCESS),
    RolePermission::new("PERMISSION_UPGRADE", NO_ACCESS),
    RolePermission::new("PERMISSION_TECHSUPPORT", NO_ACCESS),
    RolePermission::new("PERMISSION_CONTROLLERSITE", NO_ACCESS),
    RolePermission::new("PERMISSION_IMAGE", NO_ACCESS),
    RolePermission::new("PERMISSION_USER", NO_ACCESS),
    RolePermission::new("PERMISSION_ROLE", NO_ACCESS),
];

/// Privileges for a role created against `version`; an unknown version keeps every entry.
pub fn role_permissions(version: Option<&ControllerVersion>) -> Vec<Permission> {
    AKO_ROLE_PERMISSIONS
        .iter()
        .filter(|p| version.is_none_or(|v| !p.is_deprecated_at(v)))
        .map(|p| Permission {
            resource: p.resource.to_string(),
            type_: p.access.to_string(),
        })
        .collect()
}

/// Brings `existing` in line with `desired`: missing entries are added and wrong
/// access types corrected. Entries unknown to `desired` are kept unless they were
/// deprecated at `version`.
///
/// Returns whether anything changed.
pub fn reconcile_privileges(
    existing: &mut Vec<Permission>,
    desired: &[Permission],
    version: Option<&ControllerVersion>,
) -> bool {
    let mut changed = false;

    if let Some(v) = version {
        let before = existing.len();
        existing.retain(|p| {
            !AKO_ROLE_PERMISSIONS
                .iter()
                .any(|r| r.resource == p.resource && r.is_deprecated_at(v))
        });
        changed |= existing.len() != before;
    }

    for want in desired {
        match existing.iter_mut().find(|p| p.resource == want.resource) {
            Some(have) if have.type_ == want.type_ => {}
            Some(have) => {
                have.type_ = want.type_.clone();
                changed = true;
            }
            None => {
                existing.push(want.clone());
                changed = true;
            }
        }
    }
    changed
}
