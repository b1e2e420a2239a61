// src/bundle/parser.rs

//! Bundle directory parser
//!
//! A bundle directory holds `manifests/` (the primary manifest plus any
//! other documents) and `metadata/` (annotations plus optional properties
//! and dependencies files). Documents are JSON; files that cannot be read as
//! JSON are skipped.

use super::Bundle;
use super::manifest::{
    AnnotationsFile, DependenciesFile, PRIMARY_MANIFEST_KIND, PrimaryManifest, PropertiesFile,
};
use crate::error::{Error, Result};
use crate::property::{
    PROPERTIES_ANNOTATION, Property, RawProperty, expand_properties, join_properties,
};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const MANIFESTS_DIR: &str = "manifests";
const METADATA_DIR: &str = "metadata";

/// A parsed bundle together with where it came from
#[derive(Debug, Clone)]
pub struct ImageInput {
    /// Target image reference
    pub to: String,
    /// Source directory
    pub from: PathBuf,
    pub bundle: Bundle,
}

impl ImageInput {
    /// Parse the bundle directory `from` as image `to`
    pub fn new(to: impl Into<String>, from: impl Into<PathBuf>) -> Result<Self> {
        let to = to.into();
        let from = from.into();
        let bundle = BundleParser::new().parse(&from, &to)?;
        Ok(Self { to, from, bundle })
    }
}

/// Documents found under `metadata/`
struct Metadata {
    annotations: AnnotationsFile,
    properties: Option<PropertiesFile>,
    dependencies: Option<DependenciesFile>,
}

/// Parses bundle directories into bundle records
#[derive(Debug, Default)]
pub struct BundleParser;

impl BundleParser {
    pub fn new() -> Self {
        Self
    }

    /// Parse the bundle rooted at `root`, recording `image` as its reference
    pub fn parse(&self, root: &Path, image: &str) -> Result<Bundle> {
        debug!("Parsing bundle {} from {}", image, root.display());

        let manifest = self.primary_manifest(&root.join(MANIFESTS_DIR))?;
        let Metadata {
            annotations,
            properties: properties_file,
            dependencies,
        } = self.metadata(&root.join(METADATA_DIR))?;

        let channels = annotations.channels();
        if channels.is_empty() {
            return Err(Error::parse(root.display(), "annotations declare no channels"));
        }

        let mut explicit = Vec::new();
        if let Some(file) = properties_file {
            for raw in file.properties {
                explicit.push(Property::try_from(raw).map_err(|e| Error::parse(root.display(), e))?);
            }
        } else {
            info!("Could not find optional properties file in {}", root.display());
        }

        let dependencies = match dependencies {
            Some(file) => file.dependencies,
            None => {
                info!("Could not find optional dependencies file in {}", root.display());
                Vec::new()
            }
        };

        let derived = self.derived_properties(&manifest, &annotations);
        let properties = join_properties(explicit.into_iter().chain(derived));

        let package = expand_properties(&properties, manifest.version()).map_err(|e| {
            Error::parse(
                root.display(),
                format!("property expansion failed for {}: {}", manifest.name(), e),
            )
        })?;

        Ok(Bundle {
            name: manifest.name().to_string(),
            package: package.package_name,
            version: manifest.version().to_string(),
            bundle_image: image.to_string(),
            replaces: manifest.replaces().map(str::to_string),
            skips: manifest.skips(),
            skip_range: manifest.skip_range().map(str::to_string),
            channels,
            default_channel: annotations.default_channel().map(str::to_string),
            properties,
            dependencies,
        })
    }

    /// Find the first primary manifest under `manifests/`
    fn primary_manifest(&self, dir: &Path) -> Result<PrimaryManifest> {
        let mut documents = 0;

        for path in visible_files(dir)? {
            let Some(document) = read_json(&path) else {
                continue;
            };
            documents += 1;

            let kind = document.get("kind").and_then(serde_json::Value::as_str);
            if kind != Some(PRIMARY_MANIFEST_KIND) {
                continue;
            }

            let manifest: PrimaryManifest = serde_json::from_value(document)
                .map_err(|e| Error::parse(path.display(), e))?;
            if manifest.name().is_empty() {
                return Err(Error::parse(path.display(), "primary manifest has no name"));
            }
            return Ok(manifest);
        }

        if documents == 0 {
            return Err(Error::parse(dir.display(), "no bundle objects found"));
        }
        Err(Error::parse(dir.display(), "no primary manifest in bundle"))
    }

    /// Read the annotations (required), properties and dependencies documents
    fn metadata(&self, dir: &Path) -> Result<Metadata> {
        let mut annotations = None;
        let mut properties = None;
        let mut dependencies = None;

        for path in visible_files(dir)? {
            let Some(value) = read_json(&path) else {
                continue;
            };

            if annotations.is_none() && value.get("annotations").is_some() {
                let decoded: AnnotationsFile = serde_json::from_value(value.clone())
                    .map_err(|e| Error::parse(path.display(), e))?;
                if !decoded.is_empty() {
                    annotations = Some(decoded);
                }
            }
            if properties.is_none() && value.get("properties").is_some() {
                let decoded: PropertiesFile = serde_json::from_value(value.clone())
                    .map_err(|e| Error::parse(path.display(), e))?;
                if !decoded.properties.is_empty() {
                    properties = Some(decoded);
                }
            }
            if dependencies.is_none() && value.get("dependencies").is_some() {
                let decoded: DependenciesFile = serde_json::from_value(value)
                    .map_err(|e| Error::parse(path.display(), e))?;
                if !decoded.dependencies.is_empty() {
                    dependencies = Some(decoded);
                }
            }
        }

        let annotations =
            annotations.ok_or_else(|| Error::parse(dir.display(), "could not find annotations file"))?;
        Ok(Metadata {
            annotations,
            properties,
            dependencies,
        })
    }

    /// Properties implied by the manifest and annotations.
    ///
    /// The synthesized package property comes first, then properties from
    /// the manifest annotation, then one capability per owned API.
    fn derived_properties(
        &self,
        manifest: &PrimaryManifest,
        annotations: &AnnotationsFile,
    ) -> Vec<Property> {
        let mut derived = Vec::new();

        if let Some(package) = annotations.package_name() {
            derived.push(Property::package(package, manifest.version()));
        }

        if let Some(raw) = manifest.annotation(PROPERTIES_ANNOTATION) {
            match serde_json::from_str::<Vec<RawProperty>>(raw) {
                Ok(list) => {
                    for raw in list {
                        match Property::try_from(raw) {
                            Ok(property) => derived.push(property),
                            Err(e) => warn!("Ignoring manifest annotation property: {}", e),
                        }
                    }
                }
                Err(e) => warn!("Failed to unmarshal manifest annotation properties: {}", e),
            }
        }

        let owned: BTreeSet<(String, String, String)> = manifest
            .spec
            .apis
            .owned
            .iter()
            .map(|api| (api.group().to_string(), api.version.clone(), api.kind.clone()))
            .collect();
        for (group, version, kind) in owned {
            derived.push(Property::gvk(group, version, kind));
        }

        join_properties(derived)
    }
}

/// Read a file as a JSON document, `None` if it is unreadable or not JSON
fn read_json(path: &Path) -> Option<serde_json::Value> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("Failed to read {}: {}", path.display(), e);
            return None;
        }
    };
    match serde_json::from_slice(&bytes) {
        Ok(value) => Some(value),
        Err(e) => {
            debug!("Skipping undecodable file {}: {}", path.display(), e);
            None
        }
    }
}

/// Regular, non-hidden files of a directory in name order
fn visible_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = fs::read_dir(dir)
        .map_err(|e| Error::parse(dir.display(), format!("unable to read directory: {}", e)))?;

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        let hidden = entry.file_name().to_string_lossy().starts_with('.');
        if hidden {
            debug!("Skipping hidden file {}", path.display());
            continue;
        }
        if entry.file_type()?.is_dir() {
            debug!("Skipping directory {}", path.display());
            continue;
        }
        files.push(path);
    }

    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn write_json(path: &Path, value: serde_json::Value) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, serde_json::to_string_pretty(&value).unwrap()).unwrap();
    }

    fn write_bundle(root: &Path, version: &str, extra_properties: Option<serde_json::Value>) {
        write_json(
            &root.join("manifests/csv.json"),
            json!({
                "kind": "ClusterServiceVersion",
                "metadata": {
                    "name": format!("etcdoperator.v{}", version),
                    "annotations": {
                        "operatorframework.io/properties":
                            r#"[{"type":"olm.label","value":"from-manifest"}]"#
                    }
                },
                "spec": {
                    "version": version,
                    "replaces": "etcdoperator.v0.9.0",
                    "customresourcedefinitions": {"owned": [
                        {"name": "etcdclusters.etcd.database.coreos.com", "version": "v1beta2", "kind": "EtcdCluster"},
                        {"name": "etcdbackups.etcd.database.coreos.com", "version": "v1beta2", "kind": "EtcdBackup"}
                    ]}
                }
            }),
        );
        write_json(
            &root.join("manifests/crd.json"),
            json!({"kind": "CustomResourceDefinition", "metadata": {"name": "etcdclusters.etcd.database.coreos.com"}}),
        );
        fs::write(root.join("manifests/.hidden"), "not json").unwrap();
        write_json(
            &root.join("metadata/annotations.json"),
            json!({"annotations": {
                "operators.operatorframework.io.bundle.package.v1": "etcd",
                "operators.operatorframework.io.bundle.channels.v1": "alpha,stable",
                "operators.operatorframework.io.bundle.channel.default.v1": "stable"
            }}),
        );
        if let Some(properties) = extra_properties {
            write_json(&root.join("metadata/properties.json"), json!({ "properties": properties }));
        }
    }

    #[test]
    fn test_parse_bundle_directory() {
        let dir = tempfile::tempdir().unwrap();
        write_bundle(dir.path(), "0.9.2", None);

        let bundle = BundleParser::new().parse(dir.path(), "quay.io/test/etcd:0.9.2").unwrap();

        assert_eq!(bundle.name, "etcdoperator.v0.9.2");
        assert_eq!(bundle.package, "etcd");
        assert_eq!(bundle.bundle_image, "quay.io/test/etcd:0.9.2");
        assert_eq!(bundle.replaces.as_deref(), Some("etcdoperator.v0.9.0"));
        assert_eq!(bundle.channels, vec!["alpha".to_string(), "stable".to_string()]);
        assert_eq!(bundle.default_channel.as_deref(), Some("stable"));

        // package first, then manifest annotation, then capabilities in sorted order
        assert_eq!(bundle.properties[0], Property::package("etcd", "0.9.2"));
        assert_eq!(bundle.properties[1].kind(), "olm.label");
        let kinds: Vec<&str> = bundle.provided_apis().map(|g| g.kind.as_str()).collect();
        assert_eq!(kinds, vec!["EtcdBackup", "EtcdCluster"]);
    }

    #[test]
    fn test_properties_file_wins_on_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        write_bundle(
            dir.path(),
            "0.9.2",
            Some(json!([
                {"type": "olm.label", "value": "from-manifest"},
                {"type": "olm.label", "value": "from-file"}
            ])),
        );

        let bundle = BundleParser::new().parse(dir.path(), "img").unwrap();
        let labels: Vec<String> = bundle
            .properties
            .iter()
            .filter(|p| p.kind() == "olm.label")
            .map(|p| p.canonical())
            .collect();

        assert_eq!(labels, vec!["olm.label:\"from-manifest\"", "olm.label:\"from-file\""]);
        assert_eq!(bundle.properties[0].kind(), "olm.label");
        assert_eq!(bundle.package_property().unwrap().version, "0.9.2");
    }

    #[test]
    fn test_mismatched_package_property_fails_once() {
        let dir = tempfile::tempdir().unwrap();
        write_bundle(
            dir.path(),
            "0.9.2",
            Some(json!([{"type": "olm.package", "value": {"packageName": "etcd", "version": "0.9.0"}}])),
        );

        let err = BundleParser::new().parse(dir.path(), "img").unwrap_err();
        assert!(matches!(err, Error::Parse { .. }));
        assert_eq!(err.cause_count(), 1);
        assert!(err.to_string().contains("does not match"));
    }

    #[test]
    fn test_missing_annotations_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        write_bundle(dir.path(), "0.9.2", None);
        fs::remove_file(dir.path().join("metadata/annotations.json")).unwrap();

        let err = BundleParser::new().parse(dir.path(), "img").unwrap_err();
        assert!(err.to_string().contains("annotations"));
    }

    #[test]
    fn test_no_primary_manifest() {
        let dir = tempfile::tempdir().unwrap();
        write_bundle(dir.path(), "0.9.2", None);
        fs::remove_file(dir.path().join("manifests/csv.json")).unwrap();

        let err = ImageInput::new("img", dir.path()).unwrap_err();
        assert!(err.to_string().contains("no primary manifest"));
    }

    #[test]
    fn test_binary_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write_bundle(dir.path(), "0.9.2", None);
        // Sorts ahead of the manifest and annotations
        fs::write(dir.path().join("manifests/00-icon.bin"), [0xff, 0xfe, 0x00, 0x80]).unwrap();
        fs::write(dir.path().join("metadata/00-logo.bin"), [0xc3, 0x28, 0xa0, 0xa1]).unwrap();

        let bundle = BundleParser::new().parse(dir.path(), "img").unwrap();
        assert_eq!(bundle.name, "etcdoperator.v0.9.2");
        assert_eq!(bundle.channels.len(), 2);
    }

    #[test]
    fn test_dependencies_file_is_read() {
        let dir = tempfile::tempdir().unwrap();
        write_bundle(dir.path(), "0.9.2", None);
        write_json(
            &dir.path().join("metadata/dependencies.json"),
            json!({"dependencies": [
                {"type": "olm.package", "value": {"packageName": "prometheus", "version": ">0.27.0"}},
                {"type": "olm.gvk", "value": {"group": "monitoring.coreos.com", "kind": "Prometheus", "version": "v1"}}
            ]}),
        );

        let bundle = BundleParser::new().parse(dir.path(), "img").unwrap();
        assert_eq!(bundle.dependencies.len(), 2);
        assert_eq!(bundle.dependencies[0].kind, "olm.package");
        assert_eq!(bundle.dependencies[1].value["kind"], "Prometheus");
        // Dependencies never become properties
        assert!(bundle.package_property().is_some());
        assert_eq!(bundle.provided_apis().count(), 2);
    }

    #[test]
    fn test_dependencies_are_optional() {
        let dir = tempfile::tempdir().unwrap();
        write_bundle(dir.path(), "0.9.2", None);

        let bundle = BundleParser::new().parse(dir.path(), "img").unwrap();
        assert!(bundle.dependencies.is_empty());
    }
}
