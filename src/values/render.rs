use serde_yaml::Value;

use super::AddonValues;
use crate::{Error, Result};

/// ytt directives that mark the document as data values for the package
pub const DATA_VALUES_HEADER: &str =
    "#@data/values\n#@overlay/match-child-defaults missing_ok=True\n---\n";

impl AddonValues {
    pub fn render(&self) -> Result<String> {
        let body = serde_yaml::to_string(self).map_err(Error::YamlError)?;
        Ok(format!("{DATA_VALUES_HEADER}{body}"))
    }

    /// Parses a rendered document, ignoring the leading directives.
    pub fn parse(doc: &str) -> Result<Self> {
        serde_yaml::from_str(strip_header(doc)).map_err(Error::YamlError)
    }
}

fn strip_header(doc: &str) -> &str {
    doc.strip_prefix(DATA_VALUES_HEADER).unwrap_or(doc)
}

/// Flips `ako_settings.delete_config` to `"true"` in an already rendered document.
///
/// Works on the untyped tree so that values written by an older operator
/// survive untouched.
pub fn set_delete_config(doc: &str) -> Result<String> {
    let mut value: Value = serde_yaml::from_str(strip_header(doc)).map_err(Error::YamlError)?;
    let settings = value
        .get_mut("loadBalancerAndIngressService")
        .and_then(|v| v.get_mut("config"))
        .and_then(|v| v.get_mut("ako_settings"))
        .and_then(Value::as_mapping_mut)
        .ok_or_else(|| {
            Error::InvalidInput("values document has no ako_settings section".to_string())
        })?;
    settings.insert(
        Value::String("delete_config".to_string()),
        Value::String("true".to_string()),
    );
    let body = serde_yaml::to_string(&value).map_err(Error::YamlError)?;
    Ok(format!("{DATA_VALUES_HEADER}{body}"))
}
