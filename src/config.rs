use tracing::*;

pub const DEPLOY_IN_BOOTSTRAP_CLUSTER: &str = "bootstrap_cluster";
pub const IS_CONTROL_PLANE_HA_PROVIDER: &str = "avi_control_plane_ha_provider";
pub const MANAGEMENT_CLUSTER_NAME: &str = "tkg_management_cluster_name";
pub const CONTROL_PLANE_ENDPOINT_PORT: &str = "control_plane_endpoint_port";
pub const AVI_CONTROLLER_VERSION: &str = "avi_controller_version";
pub const HEALTH_ADDR: &str = "AKO_OPERATOR_HEALTH_ADDR";
pub const LOG_FORMAT: &str = "AKO_OPERATOR_LOG_FORMAT";

pub const DEFAULT_CONTROL_PLANE_ENDPOINT_PORT: i32 = 6443;
pub const DEFAULT_HEALTH_ADDR: &str = "0.0.0.0:8080";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

/// Process-wide settings, read once at startup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperatorConfig {
    pub bootstrap_cluster: bool,
    pub ha_provider: bool,
    pub management_cluster_name: Option<String>,
    pub control_plane_endpoint_port: i32,
    pub avi_controller_version: Option<String>,
    pub health_addr: String,
    pub log_format: LogFormat,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            bootstrap_cluster: false,
            ha_provider: false,
            management_cluster_name: None,
            control_plane_endpoint_port: DEFAULT_CONTROL_PLANE_ENDPOINT_PORT,
            avi_controller_version: None,
            health_addr: DEFAULT_HEALTH_ADDR.to_string(),
            log_format: LogFormat::Compact,
        }
    }
}

pub fn is_valid_port(port: i64) -> bool {
    (1..=65535).contains(&port)
}

impl OperatorConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from an arbitrary key lookup so tests need not touch the process env.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let flag = |key: &str| lookup(key).is_some_and(|v| v == "True");
        let non_empty = |key: &str| lookup(key).filter(|v| !v.is_empty());

        let control_plane_endpoint_port = match lookup(CONTROL_PLANE_ENDPOINT_PORT) {
            None => DEFAULT_CONTROL_PLANE_ENDPOINT_PORT,
            Some(raw) => match raw.trim().parse::<i64>() {
                Ok(port) if is_valid_port(port) => port as i32,
                Ok(port) => {
                    error!("port number {port} is not in valid range [1,65535], using default");
                    DEFAULT_CONTROL_PLANE_ENDPOINT_PORT
                }
                Err(e) => {
                    error!("invalid {CONTROL_PLANE_ENDPOINT_PORT} {raw:?}: {e}, using default");
                    DEFAULT_CONTROL_PLANE_ENDPOINT_PORT
                }
            },
        };

        let log_format = match lookup(LOG_FORMAT).as_deref() {
            Some("json") => LogFormat::Json,
            _ => LogFormat::Compact,
        };

        Self {
            bootstrap_cluster: flag(DEPLOY_IN_BOOTSTRAP_CLUSTER),
            ha_provider: flag(IS_CONTROL_PLANE_HA_PROVIDER),
            management_cluster_name: non_empty(MANAGEMENT_CLUSTER_NAME),
            control_plane_endpoint_port,
            avi_controller_version: non_empty(AVI_CONTROLLER_VERSION),
            health_addr: non_empty(HEALTH_ADDR).unwrap_or_else(|| DEFAULT_HEALTH_ADDR.to_string()),
            log_format,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> OperatorConfig {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        OperatorConfig::from_lookup(|k| env.get(k).cloned())
    }

    #[test]
    fn empty_environment_yields_defaults() {
        assert_eq!(config_from(&[]), OperatorConfig::default());
    }

    #[test]
    fn flags_require_exact_true() {
        let cfg = config_from(&[
            (DEPLOY_IN_BOOTSTRAP_CLUSTER, "True"),
            (IS_CONTROL_PLANE_HA_PROVIDER, "true"),
        ]);
        assert!(cfg.bootstrap_cluster);
        assert!(!cfg.ha_provider);
    }

    #[test]
    fn out_of_range_port_falls_back_to_default() {
        assert_eq!(
            config_from(&[(CONTROL_PLANE_ENDPOINT_PORT, "70000")]).control_plane_endpoint_port,
            6443
        );
        assert_eq!(
            config_from(&[(CONTROL_PLANE_ENDPOINT_PORT, "abc")]).control_plane_endpoint_port,
            6443
        );
        assert_eq!(
            config_from(&[(CONTROL_PLANE_ENDPOINT_PORT, "8443")]).control_plane_endpoint_port,
            8443
        );
    }

    #[test]
    fn optional_strings_ignore_empty_values() {
        let cfg = config_from(&[
            (MANAGEMENT_CLUSTER_NAME, "mgmt"),
            (AVI_CONTROLLER_VERSION, ""),
            (LOG_FORMAT, "json"),
        ]);
        assert_eq!(cfg.management_cluster_name.as_deref(), Some("mgmt"));
        assert_eq!(cfg.avi_controller_version, None);
        assert_eq!(cfg.log_format, LogFormat::Json);
    }
}
