//! Version helpers for upgradeability checks

use semver::Version;
use serde::Deserialize;
use serde_json::Value;

use crate::error::{Error, Result};

/// Bundle property declaring the newest cluster version an operator supports
pub const MAX_OPENSHIFT_VERSION_PROPERTY: &str = "olm.maxOpenShiftVersion";

/// Parse `MAJOR[.MINOR[.PATCH]][-PRE][+BUILD]`, filling missing components with 0.
///
/// A leading `v` and surrounding whitespace are rejected.
pub fn parse_tolerant(raw: &str) -> Result<Version> {
    if raw.is_empty() {
        return Err(Error::ConfigError("empty version".to_string()));
    }
    if raw.trim() != raw || raw.starts_with('v') || raw.starts_with('V') {
        return Err(Error::ConfigError(format!("invalid version {raw:?}")));
    }

    let split = raw.find(|c: char| c == '-' || c == '+').unwrap_or(raw.len());
    let (core, suffix) = raw.split_at(split);
    let padded = match core.split('.').count() {
        1 => format!("{core}.0.0{suffix}"),
        2 => format!("{core}.0{suffix}"),
        _ => raw.to_string(),
    };
    Version::parse(&padded).map_err(|e| Error::ConfigError(format!("invalid version {raw:?}: {e}")))
}

/// First version of the following minor release: `4.18.2` becomes `4.19.0`
pub fn next_minor(version: &Version) -> Version {
    Version::new(version.major, version.minor + 1, 0)
}

/// Whether an operator declaring `max` survives an upgrade away from `current`.
/// Only major and minor are compared.
pub fn is_compatible(max: &Version, current: &Version) -> bool {
    (max.major, max.minor) > (current.major, current.minor)
}

#[derive(Deserialize)]
struct Property {
    #[serde(rename = "type")]
    type_: String,
    value: Value,
}

/// Extract `olm.maxOpenShiftVersion` from a bundle's `olm.properties` JSON array.
///
/// Returns `None` when the property is absent. The value may be a JSON string or a
/// bare number (`4.17`). More than one occurrence is an error.
pub fn parse_max_openshift_version(properties: &str) -> Result<Option<Version>> {
    if properties.trim().is_empty() {
        return Ok(None);
    }
    let properties: Vec<Property> = serde_json::from_str(properties)
        .map_err(|e| Error::ExtensionMetadata(format!("could not parse olm.properties: {e}")))?;

    let mut matches = properties
        .into_iter()
        .filter(|p| p.type_ == MAX_OPENSHIFT_VERSION_PROPERTY);
    let Some(found) = matches.next() else {
        return Ok(None);
    };
    if matches.next().is_some() {
        return Err(Error::ExtensionMetadata(format!(
            "more than one {MAX_OPENSHIFT_VERSION_PROPERTY} property"
        )));
    }

    let raw = match found.value {
        Value::String(s) => s,
        Value::Number(n) => n.to_string(),
        other => {
            return Err(Error::ExtensionMetadata(format!(
                "{MAX_OPENSHIFT_VERSION_PROPERTY} has unsupported value {other}"
            )))
        }
    };
    let version = parse_tolerant(&raw).map_err(|e| {
        Error::ExtensionMetadata(format!("{MAX_OPENSHIFT_VERSION_PROPERTY} {raw:?}: {e}"))
    })?;
    Ok(Some(version))
}
