// src/property.rs

//! Bundle properties
//!
//! A property is a typed fact about a bundle, serialized on the wire as
//! `{"type": ..., "value": ...}`. The kinds the graph engine inspects get
//! their own variants; every other kind is carried opaquely so unknown
//! properties survive a round trip through storage untouched.

use crate::error::GraphError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Package identity property type
pub const PACKAGE_TYPE: &str = "olm.package";

/// Provided capability (group/version/kind) property type
pub const GVK_TYPE: &str = "olm.gvk";

/// Primary manifest annotation carrying a JSON property list
pub const PROPERTIES_ANNOTATION: &str = "operatorframework.io/properties";

/// Identity of the package a bundle belongs to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageProperty {
    #[serde(rename = "packageName")]
    pub package_name: String,
    pub version: String,
}

/// An API the bundle provides
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GvkProperty {
    pub group: String,
    pub kind: String,
    pub version: String,
}

/// Wire form of a property
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawProperty {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: serde_json::Value,
}

/// A requirement a bundle places on other bundles.
///
/// Shares the property wire form; the catalog stores dependencies without
/// interpreting them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dependency {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: serde_json::Value,
}

/// A typed property
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawProperty", into = "RawProperty")]
pub enum Property {
    Package(PackageProperty),
    Gvk(GvkProperty),
    /// Any other kind; `value` holds the JSON encoding of the value
    Opaque { kind: String, value: Vec<u8> },
}

impl Property {
    pub fn package(package_name: impl Into<String>, version: impl Into<String>) -> Self {
        Property::Package(PackageProperty {
            package_name: package_name.into(),
            version: version.into(),
        })
    }

    pub fn gvk(group: impl Into<String>, version: impl Into<String>, kind: impl Into<String>) -> Self {
        Property::Gvk(GvkProperty {
            group: group.into(),
            kind: kind.into(),
            version: version.into(),
        })
    }

    /// The property type string
    pub fn kind(&self) -> &str {
        match self {
            Property::Package(_) => PACKAGE_TYPE,
            Property::Gvk(_) => GVK_TYPE,
            Property::Opaque { kind, .. } => kind,
        }
    }

    /// Canonical `(type, value)` serialization used for deduplication
    pub fn canonical(&self) -> String {
        let value = match self {
            Property::Package(p) => serde_json::to_string(p).unwrap_or_default(),
            Property::Gvk(g) => serde_json::to_string(g).unwrap_or_default(),
            // Re-encode so key order and whitespace do not matter
            Property::Opaque { value, .. } => match serde_json::from_slice::<serde_json::Value>(value) {
                Ok(parsed) => parsed.to_string(),
                Err(_) => String::from_utf8_lossy(value).into_owned(),
            },
        };
        format!("{}:{}", self.kind(), value)
    }
}

impl fmt::Display for Property {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

impl TryFrom<RawProperty> for Property {
    type Error = GraphError;

    fn try_from(raw: RawProperty) -> std::result::Result<Self, Self::Error> {
        let invalid = |e: serde_json::Error| GraphError::InvalidProperty {
            kind: raw.kind.clone(),
            reason: e.to_string(),
        };

        match raw.kind.as_str() {
            PACKAGE_TYPE => Ok(Property::Package(
                serde_json::from_value(raw.value.clone()).map_err(invalid)?,
            )),
            GVK_TYPE => Ok(Property::Gvk(
                serde_json::from_value(raw.value.clone()).map_err(invalid)?,
            )),
            _ => Ok(Property::Opaque {
                value: serde_json::to_vec(&raw.value).map_err(invalid)?,
                kind: raw.kind,
            }),
        }
    }
}

impl From<Property> for RawProperty {
    fn from(property: Property) -> Self {
        let kind = property.kind().to_string();
        let value = match property {
            Property::Package(p) => serde_json::to_value(p).unwrap_or_default(),
            Property::Gvk(g) => serde_json::to_value(g).unwrap_or_default(),
            Property::Opaque { value, .. } => serde_json::from_slice(&value)
                .unwrap_or_else(|_| serde_json::Value::String(String::from_utf8_lossy(&value).into_owned())),
        };
        RawProperty { kind, value }
    }
}

/// Deduplicate properties by canonical serialization, preserving order.
///
/// Only the first package identity property is retained, whatever its value.
pub fn join_properties(properties: impl IntoIterator<Item = Property>) -> Vec<Property> {
    let mut found_package = false;
    let mut visited = HashSet::new();
    let mut joined = Vec::new();

    for property in properties {
        if !visited.insert(property.canonical()) {
            continue;
        }
        if let Property::Package(_) = property {
            if found_package {
                continue;
            }
            found_package = true;
        }
        joined.push(property);
    }

    joined
}

/// Validate a bundle's property set and return its package identity.
///
/// Exactly one package property must be present and its version must equal
/// the version declared by the bundle's primary manifest.
pub fn expand_properties(
    properties: &[Property],
    manifest_version: &str,
) -> std::result::Result<PackageProperty, GraphError> {
    let mut packages = properties.iter().filter_map(|p| match p {
        Property::Package(pkg) => Some(pkg),
        _ => None,
    });

    let package = packages.next().ok_or(GraphError::MissingPackageProperty)?;
    if packages.next().is_some() {
        return Err(GraphError::TooManyPackageProperties);
    }

    if package.version != manifest_version {
        return Err(GraphError::VersionMismatch {
            property: package.version.clone(),
            bundle: manifest_version.to_string(),
        });
    }

    Ok(package.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn opaque(kind: &str, value: serde_json::Value) -> Property {
        Property::try_from(RawProperty {
            kind: kind.to_string(),
            value,
        })
        .unwrap()
    }

    #[test]
    fn test_raw_property_dispatch() {
        let pkg = opaque(PACKAGE_TYPE, json!({"packageName": "etcd", "version": "0.9.2"}));
        assert_eq!(pkg, Property::package("etcd", "0.9.2"));

        let gvk = opaque(GVK_TYPE, json!({"group": "etcd.database.coreos.com", "kind": "EtcdCluster", "version": "v1beta2"}));
        assert_eq!(gvk, Property::gvk("etcd.database.coreos.com", "v1beta2", "EtcdCluster"));

        let label = opaque("olm.label", json!({"label": "testlabel"}));
        assert_eq!(label.kind(), "olm.label");
        assert!(matches!(label, Property::Opaque { .. }));
    }

    #[test]
    fn test_malformed_package_property_is_rejected() {
        let result = Property::try_from(RawProperty {
            kind: PACKAGE_TYPE.to_string(),
            value: json!("etcd"),
        });
        assert!(matches!(result, Err(GraphError::InvalidProperty { .. })));
    }

    #[test]
    fn test_opaque_canonical_ignores_key_order() {
        let a = Property::Opaque {
            kind: "olm.label".to_string(),
            value: br#"{"b": 1, "a": 2}"#.to_vec(),
        };
        let b = Property::Opaque {
            kind: "olm.label".to_string(),
            value: br#"{"a":2,"b":1}"#.to_vec(),
        };
        assert_eq!(a.canonical(), b.canonical());
    }

    #[test]
    fn test_wire_round_trip_keeps_opaque_value() {
        let wire = r#"[{"type":"olm.package","value":{"packageName":"etcd","version":"0.9.2"}},{"type":"olm.maxOpenShiftVersion","value":"4.8"}]"#;
        let properties: Vec<Property> = serde_json::from_str(wire).unwrap();
        assert_eq!(properties.len(), 2);

        let encoded = serde_json::to_value(&properties).unwrap();
        assert_eq!(encoded[1], json!({"type": "olm.maxOpenShiftVersion", "value": "4.8"}));
    }

    #[test]
    fn test_join_keeps_first_package_and_distinct_values() {
        let joined = join_properties(vec![
            Property::package("etcd", "0.9.2"),
            opaque("olm.label", json!("a")),
            Property::package("etcd", "0.9.4"),
            opaque("olm.label", json!("a")),
            opaque("olm.label", json!("b")),
            Property::package("etcd", "0.9.2"),
        ]);

        assert_eq!(
            joined,
            vec![
                Property::package("etcd", "0.9.2"),
                opaque("olm.label", json!("a")),
                opaque("olm.label", json!("b")),
            ]
        );
    }

    #[test]
    fn test_expand_requires_exactly_one_package() {
        let none = expand_properties(&[Property::gvk("g", "v1", "K")], "1.0.0");
        assert_eq!(none, Err(GraphError::MissingPackageProperty));

        let two = expand_properties(
            &[Property::package("etcd", "1.0.0"), Property::package("other", "1.0.0")],
            "1.0.0",
        );
        assert_eq!(two, Err(GraphError::TooManyPackageProperties));
    }

    #[test]
    fn test_expand_checks_version() {
        let mismatch = expand_properties(&[Property::package("etcd", "0.9.0")], "0.9.2");
        assert!(matches!(mismatch, Err(GraphError::VersionMismatch { .. })));

        let ok = expand_properties(&[Property::package("etcd", "0.9.2")], "0.9.2").unwrap();
        assert_eq!(ok.package_name, "etcd");
    }
}
