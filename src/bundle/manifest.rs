// src/bundle/manifest.rs

//! Serde models for the documents inside a bundle directory
//!
//! Only the fields the catalog cares about are modelled; everything else in
//! a document is ignored.

use crate::property::{Dependency, RawProperty};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;

/// Kind of the primary manifest within `manifests/`
pub const PRIMARY_MANIFEST_KIND: &str = "ClusterServiceVersion";

/// Primary manifest annotation holding the skip range
pub const SKIP_RANGE_ANNOTATION: &str = "olm.skipRange";

pub const PACKAGE_ANNOTATION: &str = "operators.operatorframework.io.bundle.package.v1";
pub const CHANNELS_ANNOTATION: &str = "operators.operatorframework.io.bundle.channels.v1";
pub const DEFAULT_CHANNEL_ANNOTATION: &str = "operators.operatorframework.io.bundle.channel.default.v1";

/// The primary manifest describing one release
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PrimaryManifest {
    pub metadata: ManifestMetadata,
    #[serde(default)]
    pub spec: ManifestSpec,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ManifestMetadata {
    pub name: String,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ManifestSpec {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub replaces: Option<String>,
    #[serde(default)]
    pub skips: Vec<String>,
    #[serde(default, rename = "customresourcedefinitions")]
    pub apis: OwnedApis,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OwnedApis {
    #[serde(default)]
    pub owned: Vec<ApiDescription>,
}

/// An API a manifest declares as owned
#[derive(Debug, Clone, Deserialize)]
pub struct ApiDescription {
    /// `<plural>.<group>`
    pub name: String,
    pub version: String,
    pub kind: String,
}

impl ApiDescription {
    /// API group, taken from the part of `name` after the first dot
    pub fn group(&self) -> &str {
        self.name.split_once('.').map(|(_, group)| group).unwrap_or("")
    }

    /// Key of the API; `None` when `name` is not `<plural>.<group>`
    pub fn api_key(&self) -> Option<ApiKey> {
        let (plural, group) = self.name.split_once('.')?;
        Some(ApiKey {
            group: group.to_string(),
            version: self.version.clone(),
            kind: self.kind.clone(),
            plural: plural.to_string(),
        })
    }
}

/// Identity of one served API version
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ApiKey {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub plural: String,
}

impl fmt::Display for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}, Kind={} ({})", self.group, self.version, self.kind, self.plural)
    }
}

/// A custom resource definition document
#[derive(Debug, Clone, Deserialize)]
pub struct CrdDocument {
    pub spec: CrdSpec,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CrdSpec {
    pub group: String,
    /// Single served version of older documents
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub versions: Vec<CrdVersion>,
    pub names: CrdNames,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CrdVersion {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CrdNames {
    pub kind: String,
    pub plural: String,
}

impl CrdDocument {
    /// One key per served version; `spec.version` stands in for an empty list
    pub fn api_keys(&self) -> Vec<ApiKey> {
        let spec = &self.spec;
        let mut versions: Vec<&str> = spec.versions.iter().map(|v| v.name.as_str()).collect();
        if versions.is_empty() {
            versions.extend(spec.version.as_deref().filter(|v| !v.is_empty()));
        }
        versions
            .into_iter()
            .map(|version| ApiKey {
                group: spec.group.clone(),
                version: version.to_string(),
                kind: spec.names.kind.clone(),
                plural: spec.names.plural.clone(),
            })
            .collect()
    }
}

impl PrimaryManifest {
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn version(&self) -> &str {
        &self.spec.version
    }

    /// Replaced bundle name, with empty strings treated as absent
    pub fn replaces(&self) -> Option<&str> {
        self.spec.replaces.as_deref().filter(|r| !r.is_empty())
    }

    pub fn skips(&self) -> Vec<String> {
        self.spec.skips.iter().filter(|s| !s.is_empty()).cloned().collect()
    }

    pub fn skip_range(&self) -> Option<&str> {
        self.metadata
            .annotations
            .get(SKIP_RANGE_ANNOTATION)
            .map(String::as_str)
            .filter(|r| !r.trim().is_empty())
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.metadata.annotations.get(key).map(String::as_str)
    }
}

/// `metadata/annotations` document
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AnnotationsFile {
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

impl AnnotationsFile {
    pub fn package_name(&self) -> Option<&str> {
        self.annotations
            .get(PACKAGE_ANNOTATION)
            .map(String::as_str)
            .filter(|p| !p.is_empty())
    }

    pub fn channels(&self) -> Vec<String> {
        self.annotations
            .get(CHANNELS_ANNOTATION)
            .map(|list| {
                list.split(',')
                    .map(str::trim)
                    .filter(|c| !c.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn default_channel(&self) -> Option<&str> {
        self.annotations
            .get(DEFAULT_CHANNEL_ANNOTATION)
            .map(String::as_str)
            .filter(|c| !c.is_empty())
    }

    pub fn is_empty(&self) -> bool {
        self.package_name().is_none() && self.channels().is_empty()
    }
}

/// `metadata/properties` document
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PropertiesFile {
    #[serde(default)]
    pub properties: Vec<RawProperty>,
}

/// `metadata/dependencies` document
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DependenciesFile {
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
}
