// src/db/store.rs

//! SQLite-backed catalog
//!
//! Implements the [`Load`], [`Query`] and [`GraphLoader`] capabilities on
//! the tables of [`super::schema`]. Every write runs in its own transaction.

use super::models::{BundleRecord, ChannelEdge, ChannelEntry, ChannelRecord, PackageRecord};
use super::transaction;
use crate::bundle::Bundle;
use crate::error::{Error, GraphError, Result};
use crate::graph::{BundleNode, EdgeKind, ReplacesGraphLoader, UpdateGraph};
use crate::registry::{GraphLoader, Load, PackageManifest, Query};
use crate::version::parse_version;
use rusqlite::Connection;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

/// Catalog stored in a SQLite database
pub struct SqliteStore {
    conn: RefCell<Connection>,
}

impl SqliteStore {
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: RefCell::new(conn),
        }
    }

    /// Open the catalog at `db_path`, which must have been initialized
    pub fn open(db_path: &str) -> Result<Self> {
        Ok(Self::new(super::open(db_path)?))
    }

    fn read<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.borrow();
        f(&conn)
    }

    fn write<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.borrow_mut();
        transaction(&mut conn, |tx| {
            let conn: &Connection = tx;
            f(conn)
        })
    }
}

/// Rebuild a package's update graph from its channel rows
fn load_graph(conn: &Connection, package: &str) -> Result<UpdateGraph> {
    let record = PackageRecord::find_by_name(conn, package)?
        .ok_or_else(|| Error::PackageNotInDatabase(package.to_string()))?;

    let versions: HashMap<String, String> = BundleRecord::find_by_package(conn, package)?
        .into_iter()
        .map(|b| (b.name, b.version))
        .collect();

    let mut graph = UpdateGraph::new(package);
    graph.default_channel = record.default_channel;

    for channel in ChannelRecord::find_by_package(conn, package)? {
        let cg = graph.channel_entry(&channel.name);
        for entry in ChannelEntry::find_by_channel(conn, package, &channel.name)? {
            let version = versions.get(&entry.bundle).and_then(|v| parse_version(v).ok());
            cg.add_bundle(BundleNode::new(entry.bundle, version));
        }
        for edge in ChannelEdge::find_by_channel(conn, package, &channel.name)? {
            cg.add_edge(&channel.name, &edge.from_bundle, &edge.to_bundle, edge.kind)?;
        }
        cg.set_head(&channel.name, &channel.head)?;
    }

    Ok(graph)
}

/// Replace a package's channel rows with the contents of `graph`
fn write_graph(conn: &Connection, graph: &UpdateGraph) -> Result<()> {
    graph.validate()?;

    PackageRecord::new(&graph.package, graph.default_channel.clone()).upsert(conn)?;
    ChannelRecord::delete_by_package(conn, &graph.package)?;

    for (name, cg) in graph.channels() {
        let Some(head) = cg.head() else {
            continue;
        };
        ChannelRecord::new(&graph.package, name, &head.name).upsert(conn)?;
        for node in cg.bundles() {
            ChannelEntry::new(&graph.package, name, &node.name).insert(conn)?;
        }
        for (from, to, kind) in cg.edges() {
            ChannelEdge::new(&graph.package, name, from, to, kind).insert(conn)?;
        }
    }

    debug!(
        "Wrote {} channel(s) of package {}",
        graph.channel_names().len(),
        graph.package
    );
    Ok(())
}

/// Record the replaces chain ending at `head` as members of a channel.
///
/// Walks stored payloads from `head` through their replaces-names and stops
/// after linking to a bundle the channel already holds.
fn link_channel(conn: &Connection, package: &str, channel: &str, head: &str) -> Result<()> {
    let mut visited = HashSet::new();
    let mut current = head.to_string();

    loop {
        if !visited.insert(current.clone()) {
            return Err(GraphError::Cycle {
                bundle: current.clone(),
                replaces: current,
                channel: channel.to_string(),
            }
            .into());
        }
        if !ChannelEntry::new(package, channel, &current).insert(conn)? {
            return Ok(());
        }

        let record = BundleRecord::find(conn, package, &current)?.ok_or_else(|| {
            GraphError::UnknownBundle {
                bundle: current.clone(),
                channel: channel.to_string(),
            }
        })?;
        let Some(replaces) = record.replaces else {
            return Ok(());
        };
        ChannelEdge::new(package, channel, &current, &replaces, EdgeKind::Replaces).insert(conn)?;
        current = replaces;
    }
}

fn insert_bundle(conn: &Connection, bundle: &Bundle) -> Result<()> {
    PackageRecord::new(&bundle.package, None).upsert(conn)?;
    BundleRecord::from_bundle(bundle)?.upsert(conn)?;
    Ok(())
}

fn find_bundle(conn: &Connection, package: &str, name: &str) -> Result<Option<Bundle>> {
    let channels = ChannelEntry::channels_of(conn, package, name)?;
    if channels.is_empty() {
        return Ok(None);
    }
    match BundleRecord::find(conn, package, name)? {
        Some(record) => Ok(Some(record.into_bundle(channels)?)),
        None => {
            // Graph member whose payload was cleared
            let mut bundle = Bundle::new(package, name, "", &[]);
            bundle.channels = channels;
            Ok(Some(bundle))
        }
    }
}

impl Load for SqliteStore {
    fn add_operator_bundle(&self, bundle: &Bundle) -> Result<()> {
        self.write(|conn| insert_bundle(conn, bundle))?;
        debug!("Stored bundle {} of package {}", bundle.name, bundle.package);
        Ok(())
    }

    fn add_bundle_package_channels(&self, manifest: &PackageManifest, bundle: &Bundle) -> Result<()> {
        self.write(|conn| {
            let mut graph = match load_graph(conn, &manifest.package_name) {
                Err(Error::PackageNotInDatabase(_)) => UpdateGraph::new(&manifest.package_name),
                other => other?,
            };

            ReplacesGraphLoader::new().add(bundle, &mut graph)?;

            for channel in &manifest.channels {
                let found = graph.channel(&channel.name).and_then(|c| c.head());
                match found {
                    Some(head) if head.name == channel.current => {}
                    _ => {
                        return Err(GraphError::HeadMismatch {
                            channel: channel.name.clone(),
                            expected: channel.current.clone(),
                            found: found.map(|h| h.name.clone()).unwrap_or_default(),
                        }
                        .into());
                    }
                }
            }
            graph.resolve_default_channel(manifest.default_channel_name.as_deref())?;

            write_graph(conn, &graph)?;
            insert_bundle(conn, bundle)
        })?;

        info!("Added {} to package {}", bundle.name, manifest.package_name);
        Ok(())
    }

    fn clear_bundle(&self, package: &str, bundle_name: &str) -> Result<()> {
        self.write(|conn| BundleRecord::delete(conn, package, bundle_name))
    }

    fn clear_non_head_bundles(&self) -> Result<()> {
        let pruned = self.write(BundleRecord::prune_non_heads)?;
        info!("Pruned {} non-head bundle(s)", pruned);
        Ok(())
    }

    fn add_bundle_semver(&self, graph: &UpdateGraph, bundle: &Bundle) -> Result<()> {
        self.write(|conn| {
            write_graph(conn, graph)?;
            insert_bundle(conn, bundle)
        })
    }

    fn add_package_channels(&self, manifest: &PackageManifest) -> Result<()> {
        self.write(|conn| {
            let package = &manifest.package_name;
            PackageRecord::new(package, None).upsert(conn)?;
            for channel in &manifest.channels {
                ChannelRecord::new(package, &channel.name, &channel.current).upsert(conn)?;
                link_channel(conn, package, &channel.name, &channel.current)?;
            }

            let mut graph = load_graph(conn, package)?;
            graph.resolve_default_channel(manifest.default_channel_name.as_deref())?;
            graph.validate()?;
            PackageRecord::new(package, graph.default_channel.clone()).upsert(conn)
        })?;

        debug!(
            "Recorded {} channel(s) of package {}",
            manifest.channels.len(),
            manifest.package_name
        );
        Ok(())
    }
}

impl Query for SqliteStore {
    fn list_channels(&self, package: &str) -> Result<Vec<String>> {
        self.read(|conn| {
            Ok(ChannelRecord::find_by_package(conn, package)?
                .into_iter()
                .map(|c| c.name)
                .collect())
        })
    }

    fn get_current_bundle_name_for_channel(&self, package: &str, channel: &str) -> Result<String> {
        self.read(|conn| {
            ChannelRecord::find(conn, package, channel)?
                .map(|c| c.head)
                .ok_or_else(|| Error::ChannelNotFound {
                    package: package.to_string(),
                    channel: channel.to_string(),
                })
        })
    }

    fn get_bundle(&self, package: &str, channel: &str, name: &str) -> Result<Option<Bundle>> {
        self.read(|conn| {
            let bundle = find_bundle(conn, package, name)?;
            Ok(bundle.filter(|b| b.in_channel(channel)))
        })
    }

    fn get_bundle_that_replaces(
        &self,
        name: &str,
        package: &str,
        channel: &str,
    ) -> Result<Option<Bundle>> {
        self.read(|conn| match ChannelEdge::find_replacing(conn, package, channel, name)? {
            Some(replacing) => find_bundle(conn, package, &replacing),
            None => Ok(None),
        })
    }

    fn get_bundle_paths_for_package(&self, package: &str) -> Result<Vec<String>> {
        self.read(|conn| BundleRecord::find_paths_by_package(conn, package))
    }

    fn get_default_channel_for_package(&self, package: &str) -> Result<Option<String>> {
        self.read(|conn| {
            PackageRecord::find_by_name(conn, package)?
                .map(|p| p.default_channel)
                .ok_or_else(|| Error::PackageNotInDatabase(package.to_string()))
        })
    }
}

impl GraphLoader for SqliteStore {
    fn generate(&self, package: &str) -> Result<UpdateGraph> {
        self.read(|conn| load_graph(conn, package))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::graph::SemverGraphLoader;
    use crate::property::Property;
    use crate::registry::PackageChannel;
    use tempfile::TempDir;

    fn create_test_store() -> (TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("bundles.db");
        let db_path = db_path.to_str().unwrap();
        db::init(db_path).unwrap();
        (dir, SqliteStore::open(db_path).unwrap())
    }

    fn etcd(version: &str) -> Bundle {
        let mut bundle = Bundle::new("etcd", format!("etcdoperator.v{}", version), version, &["alpha"])
            .with_image(format!("quay.io/test/etcd:{}", version))
            .with_default_channel("alpha");
        bundle.properties = vec![Property::package("etcd", version)];
        bundle
    }

    fn add_replaces(store: &SqliteStore, bundle: &Bundle) -> Result<()> {
        let existing = store
            .list_channels(&bundle.package)?
            .into_iter()
            .map(|name| -> Result<PackageChannel> {
                let current = store.get_current_bundle_name_for_channel(&bundle.package, &name)?;
                Ok(PackageChannel { name, current })
            })
            .collect::<Result<Vec<_>>>()?;
        let manifest = PackageManifest::translate(bundle, existing);
        store.add_bundle_package_channels(&manifest, bundle)
    }

    #[test]
    fn test_generate_unknown_package() {
        let (_dir, store) = create_test_store();
        let err = store.generate("etcd").unwrap_err();
        assert!(err.is_not_found());
        assert!(matches!(
            store.get_default_channel_for_package("etcd"),
            Err(Error::PackageNotInDatabase(_))
        ));
        assert!(store.list_channels("etcd").unwrap().is_empty());
        assert!(store.get_bundle_paths_for_package("etcd").unwrap().is_empty());
    }

    #[test]
    fn test_replaces_round_trip_through_tables() {
        let (_dir, store) = create_test_store();
        add_replaces(&store, &etcd("0.9.0")).unwrap();
        add_replaces(&store, &etcd("0.9.2").with_replaces("etcdoperator.v0.9.0")).unwrap();

        let graph = store.generate("etcd").unwrap();
        let alpha = graph.channel("alpha").unwrap();
        assert_eq!(alpha.head().unwrap().name, "etcdoperator.v0.9.2");
        assert_eq!(
            alpha.replaces("etcdoperator.v0.9.2").unwrap().name,
            "etcdoperator.v0.9.0"
        );
        assert_eq!(graph.default_channel.as_deref(), Some("alpha"));

        let replacing = store
            .get_bundle_that_replaces("etcdoperator.v0.9.0", "etcd", "alpha")
            .unwrap()
            .unwrap();
        assert_eq!(replacing.name, "etcdoperator.v0.9.2");
        assert!(store
            .get_bundle_that_replaces("etcdoperator.v0.9.2", "etcd", "alpha")
            .unwrap()
            .is_none());

        let bundle = store.get_bundle("etcd", "alpha", "etcdoperator.v0.9.0").unwrap().unwrap();
        assert_eq!(bundle.bundle_image, "quay.io/test/etcd:0.9.0");
        assert!(store.get_bundle("etcd", "beta", "etcdoperator.v0.9.0").unwrap().is_none());
    }

    #[test]
    fn test_failed_add_leaves_tables_unchanged() {
        let (_dir, store) = create_test_store();
        add_replaces(&store, &etcd("0.9.0")).unwrap();
        add_replaces(&store, &etcd("0.9.2").with_replaces("etcdoperator.v0.9.0")).unwrap();

        // Forks the chain at a non-head bundle
        let fork = etcd("0.9.4").with_replaces("etcdoperator.v0.9.0");
        assert!(add_replaces(&store, &fork).is_err());

        assert_eq!(
            store.get_current_bundle_name_for_channel("etcd", "alpha").unwrap(),
            "etcdoperator.v0.9.2"
        );
        assert_eq!(store.get_bundle_paths_for_package("etcd").unwrap().len(), 2);
    }

    #[test]
    fn test_semver_graph_is_written() {
        let (_dir, store) = create_test_store();
        let loader = SemverGraphLoader::new();

        for version in ["0.9.2", "0.9.0", "0.9.4"] {
            let bundle = etcd(version);
            let graph = match store.generate("etcd") {
                Err(e) if e.is_not_found() => UpdateGraph::new("etcd"),
                other => other.unwrap(),
            };
            let graph = loader
                .add_bundle_to_graph(&bundle, graph, Some("alpha"), true)
                .unwrap();
            store.add_bundle_semver(&graph, &bundle).unwrap();
        }

        let graph = store.generate("etcd").unwrap();
        let alpha = graph.channel("alpha").unwrap();
        let chain: Vec<&str> = alpha.replace_chain().iter().map(|n| n.name.as_str()).collect();
        assert_eq!(
            chain,
            vec!["etcdoperator.v0.9.4", "etcdoperator.v0.9.2", "etcdoperator.v0.9.0"]
        );
        assert!(alpha
            .edges()
            .any(|(from, to, kind)| from == "etcdoperator.v0.9.4"
                && to == "etcdoperator.v0.9.0"
                && kind == EdgeKind::Skips));
    }

    #[test]
    fn test_clear_non_head_bundles_keeps_graph() {
        let (_dir, store) = create_test_store();
        add_replaces(&store, &etcd("0.9.0")).unwrap();
        add_replaces(&store, &etcd("0.9.2").with_replaces("etcdoperator.v0.9.0")).unwrap();

        store.clear_non_head_bundles().unwrap();

        let old = store.get_bundle("etcd", "alpha", "etcdoperator.v0.9.0").unwrap().unwrap();
        let head = store.get_bundle("etcd", "alpha", "etcdoperator.v0.9.2").unwrap().unwrap();
        assert!(old.properties.is_empty());
        assert_eq!(old.version, "0.9.0");
        assert_eq!(head.properties.len(), 1);
        assert_eq!(store.generate("etcd").unwrap().channel("alpha").unwrap().len(), 2);
    }

    fn manifest(channels: &[(&str, &str)], default_channel: Option<&str>) -> PackageManifest {
        PackageManifest {
            package_name: "etcd".to_string(),
            default_channel_name: default_channel.map(str::to_string),
            channels: channels
                .iter()
                .map(|(name, current)| PackageChannel {
                    name: name.to_string(),
                    current: current.to_string(),
                })
                .collect(),
        }
    }

    #[test]
    fn test_package_channels_follow_stored_replaces() {
        let (_dir, store) = create_test_store();
        store.add_operator_bundle(&etcd("0.9.0")).unwrap();
        store
            .add_operator_bundle(&etcd("0.9.2").with_replaces("etcdoperator.v0.9.0"))
            .unwrap();
        store
            .add_operator_bundle(&etcd("0.9.4").with_replaces("etcdoperator.v0.9.2"))
            .unwrap();

        store
            .add_package_channels(&manifest(
                &[("alpha", "etcdoperator.v0.9.4"), ("stable", "etcdoperator.v0.9.2")],
                Some("stable"),
            ))
            .unwrap();

        let graph = store.generate("etcd").unwrap();
        assert_eq!(graph.channel("alpha").unwrap().len(), 3);
        assert_eq!(graph.channel("stable").unwrap().len(), 2);
        assert_eq!(graph.default_channel.as_deref(), Some("stable"));
        assert_eq!(
            store
                .get_bundle_that_replaces("etcdoperator.v0.9.2", "etcd", "alpha")
                .unwrap()
                .unwrap()
                .name,
            "etcdoperator.v0.9.4"
        );
    }

    #[test]
    fn test_package_channels_reject_unknown_head() {
        let (_dir, store) = create_test_store();
        store.add_operator_bundle(&etcd("0.9.0")).unwrap();

        let err = store
            .add_package_channels(&manifest(&[("alpha", "etcdoperator.v1.0.0")], None))
            .unwrap_err();
        assert!(matches!(err, Error::Graph(GraphError::UnknownBundle { .. })));
        assert!(store.list_channels("etcd").unwrap().is_empty());
    }

    #[test]
    fn test_package_channels_reject_duplicate_versions() {
        let (_dir, store) = create_test_store();
        store.add_operator_bundle(&etcd("0.9.2")).unwrap();
        let mut twin = etcd("0.9.2").with_replaces("etcdoperator.v0.9.2");
        twin.name = "etcdoperator.v0.9.2-twin".to_string();
        store.add_operator_bundle(&twin).unwrap();

        let err = store
            .add_package_channels(&manifest(&[("alpha", "etcdoperator.v0.9.2-twin")], None))
            .unwrap_err();
        assert!(matches!(err, Error::Graph(GraphError::DuplicateVersion { .. })));
        assert!(store.list_channels("etcd").unwrap().is_empty());
    }

    #[test]
    fn test_package_channels_reject_replaces_loop() {
        let (_dir, store) = create_test_store();
        store
            .add_operator_bundle(&etcd("0.9.0").with_replaces("etcdoperator.v0.9.2"))
            .unwrap();
        store
            .add_operator_bundle(&etcd("0.9.2").with_replaces("etcdoperator.v0.9.0"))
            .unwrap();

        let err = store
            .add_package_channels(&manifest(&[("alpha", "etcdoperator.v0.9.2")], None))
            .unwrap_err();
        assert!(matches!(err, Error::Graph(GraphError::Cycle { .. })));
        assert!(store.list_channels("etcd").unwrap().is_empty());
    }

    #[test]
    fn test_package_channels_keep_existing_chain() {
        let (_dir, store) = create_test_store();
        add_replaces(&store, &etcd("0.9.0")).unwrap();
        add_replaces(&store, &etcd("0.9.2").with_replaces("etcdoperator.v0.9.0")).unwrap();

        store
            .add_package_channels(&manifest(&[("alpha", "etcdoperator.v0.9.2")], None))
            .unwrap();

        let graph = store.generate("etcd").unwrap();
        assert_eq!(graph.channel("alpha").unwrap().len(), 2);
        assert_eq!(graph.default_channel.as_deref(), Some("alpha"));
    }

    #[test]
    fn test_clear_bundle_keeps_channel_membership() {
        let (_dir, store) = create_test_store();
        add_replaces(&store, &etcd("0.9.0")).unwrap();

        store.clear_bundle("etcd", "etcdoperator.v0.9.0").unwrap();
        assert!(store.get_bundle_paths_for_package("etcd").unwrap().is_empty());

        let cleared = store.get_bundle("etcd", "alpha", "etcdoperator.v0.9.0").unwrap().unwrap();
        assert!(cleared.bundle_image.is_empty());

        store.add_operator_bundle(&etcd("0.9.0")).unwrap();
        assert_eq!(store.get_bundle_paths_for_package("etcd").unwrap().len(), 1);
    }
}
