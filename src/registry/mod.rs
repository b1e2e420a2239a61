// src/registry/mod.rs

//! Catalog capabilities and batch population
//!
//! Storage is reached only through three capabilities: [`Load`] mutates,
//! [`Query`] reads and [`GraphLoader`] materializes a package's current
//! update graph. [`DirectoryPopulator`] drives a batch of bundle directories
//! through them; [`ManifestListPopulator`] loads a manifest list document.

mod manifests;
mod populator;

pub use manifests::{ManifestListPopulator, ManifestLists};
pub use populator::{DirectoryPopulator, PopulateSummary};

use crate::bundle::Bundle;
use crate::error::{Error, Result};
use crate::graph::UpdateGraph;
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;

/// A channel and the bundle currently at its head
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
pub struct PackageChannel {
    pub name: String,
    #[serde(rename = "currentCSV")]
    pub current: String,
}

/// Package-level view of channels and their heads
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct PackageManifest {
    #[serde(rename = "packageName")]
    pub package_name: String,
    #[serde(rename = "defaultChannel", default)]
    pub default_channel_name: Option<String>,
    #[serde(default)]
    pub channels: Vec<PackageChannel>,
}

impl PackageManifest {
    /// Overlay `bundle` as head of its channels on top of `existing` heads
    pub fn translate(bundle: &Bundle, existing: Vec<PackageChannel>) -> Self {
        let mut channels: Vec<PackageChannel> = existing
            .into_iter()
            .filter(|c| !bundle.in_channel(&c.name))
            .collect();
        channels.extend(bundle.channels.iter().map(|name| PackageChannel {
            name: name.clone(),
            current: bundle.name.clone(),
        }));
        channels.sort();
        channels.dedup();

        Self {
            package_name: bundle.package.clone(),
            default_channel_name: bundle.default_channel.clone().filter(|c| !c.is_empty()),
            channels,
        }
    }

    pub fn channel(&self, name: &str) -> Option<&PackageChannel> {
        self.channels.iter().find(|c| c.name == name)
    }
}

/// How bundles are ordered within a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Explicit replaces and skip declarations
    #[default]
    Replaces,
    /// Semantic version order
    SemVer,
    /// Semantic version order with patch skipping
    SkipPatch,
}

impl Mode {
    pub fn as_str(&self) -> &str {
        match self {
            Mode::Replaces => "replaces",
            Mode::SemVer => "semver",
            Mode::SkipPatch => "semver-skippatch",
        }
    }
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "replaces" => Ok(Mode::Replaces),
            "semver" => Ok(Mode::SemVer),
            "semver-skippatch" => Ok(Mode::SkipPatch),
            _ => Err(Error::UnsupportedMode(s.to_string())),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Options for one populate call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PopulateOptions {
    pub mode: Mode,
    /// Allow replacing the payload of a current channel head
    pub overwrite: bool,
}

/// Write access to the catalog
pub trait Load {
    /// Store a bundle payload without touching any channel
    fn add_operator_bundle(&self, bundle: &Bundle) -> Result<()>;

    /// Store a bundle and extend its package's replaces graph with it
    fn add_bundle_package_channels(&self, manifest: &PackageManifest, bundle: &Bundle) -> Result<()>;

    /// Remove a bundle payload, keeping its place in the graph
    fn clear_bundle(&self, package: &str, bundle_name: &str) -> Result<()>;

    /// Prune the payload of every bundle that heads no channel
    fn clear_non_head_bundles(&self) -> Result<()>;

    /// Store a bundle and replace its package's graph with `graph`
    fn add_bundle_semver(&self, graph: &UpdateGraph, bundle: &Bundle) -> Result<()>;

    /// Record channel heads and the default channel of a package
    fn add_package_channels(&self, manifest: &PackageManifest) -> Result<()>;
}

/// Read access to the catalog
pub trait Query {
    /// Channel names of a package; empty for an unknown package
    fn list_channels(&self, package: &str) -> Result<Vec<String>>;

    /// Head of a channel; [`Error::ChannelNotFound`] if the channel does not exist
    fn get_current_bundle_name_for_channel(&self, package: &str, channel: &str) -> Result<String>;

    /// A bundle of a channel, `None` if it is not a member
    fn get_bundle(&self, package: &str, channel: &str, name: &str) -> Result<Option<Bundle>>;

    /// The bundle replacing `name` in a channel, `None` if nothing does
    fn get_bundle_that_replaces(&self, name: &str, package: &str, channel: &str)
    -> Result<Option<Bundle>>;

    /// Image paths of every stored bundle of a package
    fn get_bundle_paths_for_package(&self, package: &str) -> Result<Vec<String>>;

    /// Default channel of a package; [`Error::PackageNotInDatabase`] if unknown
    fn get_default_channel_for_package(&self, package: &str) -> Result<Option<String>>;
}

/// Materializes a package's current update graph
pub trait GraphLoader {
    /// Fails with [`Error::PackageNotInDatabase`] for a package never loaded
    fn generate(&self, package: &str) -> Result<UpdateGraph>;
}

/// Generate a graph, treating an unknown package as an empty graph
pub fn generate_or_empty(loader: &dyn GraphLoader, package: &str) -> Result<UpdateGraph> {
    match loader.generate(package) {
        Err(Error::PackageNotInDatabase(_)) => Ok(UpdateGraph::new(package)),
        other => other,
    }
}
