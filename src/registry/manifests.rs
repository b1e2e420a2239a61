// src/registry/manifests.rs

//! Population from manifest lists
//!
//! A manifest list document carries three lists side by side: custom
//! resource definitions, primary manifests and package manifests. Primary
//! manifests become bundles of the package whose channels reach them, and
//! the package manifests then record channel heads. Unlike a directory
//! batch, failures are collected and reported together rather than stopping
//! at the first one.

use super::{Load, PackageManifest};
use crate::bundle::Bundle;
use crate::bundle::manifest::{ApiKey, CrdDocument, PrimaryManifest};
use crate::error::{Error, Result};
use crate::property::{Property, join_properties};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tracing::{debug, info};

pub const CRD_LIST_KEY: &str = "customResourceDefinitions";
pub const MANIFEST_LIST_KEY: &str = "clusterServiceVersions";
pub const PACKAGE_LIST_KEY: &str = "packages";

/// The three lists of a manifest list document; absent keys stay `None`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestLists {
    pub custom_resource_definitions: Option<Vec<CrdDocument>>,
    pub cluster_service_versions: Option<Vec<PrimaryManifest>>,
    pub packages: Option<Vec<PackageManifest>>,
}

/// Package and channels a primary manifest was reached from
struct Membership<'m> {
    package: &'m str,
    channels: BTreeSet<&'m str>,
}

/// Loads manifest lists into the catalog
pub struct ManifestListPopulator<'a> {
    loader: &'a dyn Load,
    lists: ManifestLists,
}

impl<'a> ManifestListPopulator<'a> {
    pub fn new(loader: &'a dyn Load, lists: ManifestLists) -> Self {
        Self { loader, lists }
    }

    /// Load every list and return the names of the bundles stored.
    ///
    /// A missing definition list fails before anything is read. Every other
    /// failure is collected; bundles and packages that load cleanly stay
    /// committed.
    pub fn populate(&self) -> Result<Vec<String>> {
        info!("Loading custom resource definitions");
        let crds = self
            .lists
            .custom_resource_definitions
            .as_ref()
            .ok_or_else(|| missing_key(CRD_LIST_KEY))?;

        let mut errors = Vec::new();
        let mut known: HashSet<ApiKey> = HashSet::new();
        for crd in crds {
            for key in crd.api_keys() {
                debug!("Loading definition {}", key);
                if !known.insert(key.clone()) {
                    errors.push(Error::ManifestList(format!(
                        "can't add the same definition twice: {}",
                        key
                    )));
                }
            }
        }

        info!("Loading bundles");
        let Some(manifests) = self.lists.cluster_service_versions.as_ref() else {
            errors.push(missing_key(MANIFEST_LIST_KEY));
            return Error::from_errors(errors).map(|()| Vec::new());
        };
        let Some(packages) = self.lists.packages.as_ref() else {
            errors.push(missing_key(PACKAGE_LIST_KEY));
            return Error::from_errors(errors).map(|()| Vec::new());
        };

        let memberships = attribute(manifests, packages, &mut errors);

        let mut loaded = Vec::new();
        for manifest in manifests {
            let Some(membership) = memberships.get(manifest.name()) else {
                errors.push(Error::ManifestList(format!(
                    "bundle {} is not reachable from any package channel",
                    manifest.name()
                )));
                continue;
            };

            let bundle = self.bundle(manifest, membership, &known, &mut errors);
            match self.loader.add_operator_bundle(&bundle) {
                Ok(()) => loaded.push(bundle.name),
                Err(e) => errors.push(Error::ManifestList(format!(
                    "error adding bundle {}: {}",
                    bundle.name, e
                ))),
            }
        }

        info!("Loading packages");
        for package in packages {
            debug!("Loading package {}", package.package_name);
            if let Err(e) = self.loader.add_package_channels(package) {
                errors.push(Error::ManifestList(format!(
                    "error loading package {}: {}",
                    package.package_name, e
                )));
            }
        }

        Error::from_errors(errors)?;
        info!("Loaded {} bundle(s) from {} package(s)", loaded.len(), packages.len());
        Ok(loaded)
    }

    /// Bundle record for a primary manifest, with its package and API properties
    fn bundle(
        &self,
        manifest: &PrimaryManifest,
        membership: &Membership<'_>,
        known: &HashSet<ApiKey>,
        errors: &mut Vec<Error>,
    ) -> Bundle {
        let channels: Vec<&str> = membership.channels.iter().copied().collect();
        let mut bundle = Bundle::new(membership.package, manifest.name(), manifest.version(), &channels);
        bundle.replaces = manifest.replaces().map(str::to_string);
        bundle.skips = manifest.skips();
        bundle.skip_range = manifest.skip_range().map(str::to_string);

        let mut properties = vec![Property::package(membership.package, manifest.version())];
        for owned in &manifest.spec.apis.owned {
            match owned.api_key() {
                None => errors.push(Error::ManifestList(format!(
                    "error parsing owned name {:?} of {}",
                    owned.name,
                    manifest.name()
                ))),
                Some(key) if !known.contains(&key) => errors.push(Error::ManifestList(format!(
                    "couldn't find owned definition {} of {}",
                    key,
                    manifest.name()
                ))),
                Some(key) => properties.push(Property::gvk(key.group, key.version, key.kind)),
            }
        }
        bundle.properties = join_properties(properties);
        bundle
    }
}

/// Attribute primary manifests to packages by walking each channel's
/// replaces chain from its head. The first package to reach a manifest owns
/// it.
fn attribute<'m>(
    manifests: &'m [PrimaryManifest],
    packages: &'m [PackageManifest],
    errors: &mut Vec<Error>,
) -> BTreeMap<&'m str, Membership<'m>> {
    let by_name: BTreeMap<&str, &PrimaryManifest> =
        manifests.iter().map(|m| (m.name(), m)).collect();
    let mut memberships: BTreeMap<&str, Membership<'m>> = BTreeMap::new();

    for package in packages {
        for channel in &package.channels {
            let mut visited = HashSet::new();
            let mut next = Some(channel.current.as_str());

            while let Some(name) = next {
                // Unknown heads and predecessors are reported by the store
                let Some(&manifest) = by_name.get(name) else {
                    break;
                };
                if !visited.insert(name) {
                    break;
                }

                let membership = memberships.entry(manifest.name()).or_insert_with(|| Membership {
                    package: &package.package_name,
                    channels: BTreeSet::new(),
                });
                if membership.package != package.package_name {
                    errors.push(Error::ManifestList(format!(
                        "bundle {} is reached from packages {} and {}",
                        name, membership.package, package.package_name
                    )));
                    break;
                }
                membership.channels.insert(&channel.name);
                next = manifest.replaces();
            }
        }
    }

    memberships
}

fn missing_key(key: &str) -> Error {
    Error::ManifestList(format!("couldn't find expected key {}", key))
}
