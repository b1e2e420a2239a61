// src/bundle/mod.rs

//! Bundle records
//!
//! A bundle is one versioned release of a package. Records are produced once
//! by [`parser::BundleParser`] and are immutable afterwards; the catalog
//! either persists them or discards them.

pub mod manifest;
pub mod parser;

pub use parser::{BundleParser, ImageInput};

use crate::error::{GraphError, Result};
use crate::property::{Dependency, GvkProperty, PackageProperty, Property};
use crate::version::{SkipRange, parse_version};
use semver::Version;

/// One release of a package
#[derive(Debug, Clone, PartialEq)]
pub struct Bundle {
    /// Bundle name, unique within its package
    pub name: String,
    pub package: String,
    pub version: String,
    /// Image reference the bundle was loaded from
    pub bundle_image: String,
    pub replaces: Option<String>,
    pub skips: Vec<String>,
    pub skip_range: Option<String>,
    pub channels: Vec<String>,
    /// Default channel requested by the bundle's annotations
    pub default_channel: Option<String>,
    pub properties: Vec<Property>,
    /// Requirements on other bundles, stored but not interpreted
    pub dependencies: Vec<Dependency>,
}

impl Bundle {
    /// Create a bundle with no predecessor, skips or properties
    pub fn new(
        package: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
        channels: &[&str],
    ) -> Self {
        Self {
            name: name.into(),
            package: package.into(),
            version: version.into(),
            bundle_image: String::new(),
            replaces: None,
            skips: Vec::new(),
            skip_range: None,
            channels: channels.iter().map(|c| c.to_string()).collect(),
            default_channel: None,
            properties: Vec::new(),
            dependencies: Vec::new(),
        }
    }

    pub fn with_replaces(mut self, replaces: impl Into<String>) -> Self {
        self.replaces = Some(replaces.into());
        self
    }

    pub fn with_skips(mut self, skips: &[&str]) -> Self {
        self.skips = skips.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_skip_range(mut self, range: impl Into<String>) -> Self {
        self.skip_range = Some(range.into());
        self
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.bundle_image = image.into();
        self
    }

    pub fn with_default_channel(mut self, channel: impl Into<String>) -> Self {
        self.default_channel = Some(channel.into());
        self
    }

    /// Semantic version of the bundle
    pub fn semver(&self) -> std::result::Result<Version, GraphError> {
        parse_version(&self.version).map_err(|e| GraphError::InvalidVersion {
            bundle: self.name.clone(),
            version: self.version.clone(),
            reason: e.to_string(),
        })
    }

    /// Semantic version if the bundle declares a valid one
    pub fn semver_opt(&self) -> Option<Version> {
        parse_version(&self.version).ok()
    }

    /// Parsed skip range, if one is declared
    pub fn parsed_skip_range(&self) -> std::result::Result<Option<SkipRange>, GraphError> {
        match self.skip_range.as_deref().filter(|r| !r.trim().is_empty()) {
            None => Ok(None),
            Some(raw) => raw
                .parse::<SkipRange>()
                .map(Some)
                .map_err(|reason| GraphError::InvalidSkipRange {
                    bundle: self.name.clone(),
                    range: raw.to_string(),
                    reason,
                }),
        }
    }

    /// The package identity property, if present
    pub fn package_property(&self) -> Option<&PackageProperty> {
        self.properties.iter().find_map(|p| match p {
            Property::Package(pkg) => Some(pkg),
            _ => None,
        })
    }

    /// Capabilities the bundle provides
    pub fn provided_apis(&self) -> impl Iterator<Item = &GvkProperty> {
        self.properties.iter().filter_map(|p| match p {
            Property::Gvk(gvk) => Some(gvk),
            _ => None,
        })
    }

    pub fn in_channel(&self, channel: &str) -> bool {
        self.channels.iter().any(|c| c == channel)
    }

    /// Serialize the property list to its JSON wire form
    pub fn properties_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.properties)?)
    }

    pub fn dependencies_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.dependencies)?)
    }
}
