// src/db/models.rs

//! Data models for catalog database entities
//!
//! This module defines Rust structs that correspond to database tables
//! and provides methods for creating, reading, updating, and deleting records.

use crate::bundle::Bundle;
use crate::error::Result;
use crate::graph::EdgeKind;
use crate::property::{Dependency, Property};
use rusqlite::{Connection, OptionalExtension, Row, params};

/// A package and its default channel
#[derive(Debug, Clone, PartialEq)]
pub struct PackageRecord {
    pub name: String,
    pub default_channel: Option<String>,
}

impl PackageRecord {
    pub fn new(name: impl Into<String>, default_channel: Option<String>) -> Self {
        Self {
            name: name.into(),
            default_channel,
        }
    }

    /// Insert the package, or update its default channel if it exists.
    ///
    /// A `None` default channel never clears a stored one.
    pub fn upsert(&self, conn: &Connection) -> Result<()> {
        conn.execute(
            "INSERT INTO packages (name, default_channel) VALUES (?1, ?2)
             ON CONFLICT(name) DO UPDATE SET
                default_channel = COALESCE(excluded.default_channel, packages.default_channel)",
            params![&self.name, &self.default_channel],
        )?;
        Ok(())
    }

    pub fn find_by_name(conn: &Connection, name: &str) -> Result<Option<Self>> {
        let mut stmt = conn.prepare("SELECT name, default_channel FROM packages WHERE name = ?1")?;
        let package = stmt.query_row([name], Self::from_row).optional()?;
        Ok(package)
    }

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            name: row.get(0)?,
            default_channel: row.get(1)?,
        })
    }
}

/// Stored payload of one bundle
#[derive(Debug, Clone, PartialEq)]
pub struct BundleRecord {
    pub id: Option<i64>,
    pub package: String,
    pub name: String,
    pub version: String,
    pub bundle_path: Option<String>,
    pub replaces: Option<String>,
    pub skips: Vec<String>,
    pub skip_range: Option<String>,
    /// Property list as JSON; `None` once the bundle has been pruned
    pub properties: Option<String>,
    pub dependencies: Vec<Dependency>,
}

const BUNDLE_COLUMNS: &str =
    "id, package, name, version, bundle_path, replaces, skips, skip_range, properties, dependencies";

impl BundleRecord {
    /// Build the record for a parsed bundle
    pub fn from_bundle(bundle: &Bundle) -> Result<Self> {
        Ok(Self {
            id: None,
            package: bundle.package.clone(),
            name: bundle.name.clone(),
            version: bundle.version.clone(),
            bundle_path: Some(bundle.bundle_image.clone()).filter(|p| !p.is_empty()),
            replaces: bundle.replaces.clone().filter(|r| !r.is_empty()),
            skips: bundle.skips.clone(),
            skip_range: bundle.skip_range.clone().filter(|r| !r.is_empty()),
            properties: Some(bundle.properties_json()?),
            dependencies: bundle.dependencies.clone(),
        })
    }

    /// Insert this bundle, replacing any stored payload of the same name
    pub fn upsert(&mut self, conn: &Connection) -> Result<i64> {
        let skips = serde_json::to_string(&self.skips)?;
        let dependencies = serde_json::to_string(&self.dependencies)?;
        conn.execute(
            "INSERT INTO bundles (package, name, version, bundle_path, replaces, skips, skip_range, properties, dependencies)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(package, name) DO UPDATE SET
                version = excluded.version,
                bundle_path = excluded.bundle_path,
                replaces = excluded.replaces,
                skips = excluded.skips,
                skip_range = excluded.skip_range,
                properties = excluded.properties,
                dependencies = excluded.dependencies",
            params![
                &self.package,
                &self.name,
                &self.version,
                &self.bundle_path,
                &self.replaces,
                &skips,
                &self.skip_range,
                &self.properties,
                &dependencies,
            ],
        )?;

        let id = conn.query_row(
            "SELECT id FROM bundles WHERE package = ?1 AND name = ?2",
            params![&self.package, &self.name],
            |row| row.get(0),
        )?;
        self.id = Some(id);
        Ok(id)
    }

    pub fn find(conn: &Connection, package: &str, name: &str) -> Result<Option<Self>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM bundles WHERE package = ?1 AND name = ?2",
            BUNDLE_COLUMNS
        ))?;
        let bundle = stmt
            .query_row(params![package, name], Self::from_row)
            .optional()?;
        Ok(bundle)
    }

    /// Find bundles of a package
    pub fn find_by_package(conn: &Connection, package: &str) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM bundles WHERE package = ?1 ORDER BY name",
            BUNDLE_COLUMNS
        ))?;
        let bundles = stmt
            .query_map([package], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(bundles)
    }

    /// Image paths of every stored bundle of a package
    pub fn find_paths_by_package(conn: &Connection, package: &str) -> Result<Vec<String>> {
        let mut stmt = conn.prepare(
            "SELECT bundle_path FROM bundles
             WHERE package = ?1 AND bundle_path IS NOT NULL AND bundle_path != ''
             ORDER BY bundle_path",
        )?;
        let paths = stmt
            .query_map([package], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(paths)
    }

    pub fn delete(conn: &Connection, package: &str, name: &str) -> Result<()> {
        conn.execute(
            "DELETE FROM bundles WHERE package = ?1 AND name = ?2",
            params![package, name],
        )?;
        Ok(())
    }

    /// Null the properties of every bundle that heads no channel; returns the count
    pub fn prune_non_heads(conn: &Connection) -> Result<usize> {
        let pruned = conn.execute(
            "UPDATE bundles SET properties = NULL
             WHERE properties IS NOT NULL
               AND NOT EXISTS (
                   SELECT 1 FROM channels c
                   WHERE c.package = bundles.package AND c.head = bundles.name
               )",
            [],
        )?;
        Ok(pruned)
    }

    /// Rebuild the bundle record for the given channel memberships
    pub fn into_bundle(self, channels: Vec<String>) -> Result<Bundle> {
        let properties: Vec<Property> = match &self.properties {
            Some(json) => serde_json::from_str(json)?,
            None => Vec::new(),
        };
        Ok(Bundle {
            name: self.name,
            package: self.package,
            version: self.version,
            bundle_image: self.bundle_path.unwrap_or_default(),
            replaces: self.replaces,
            skips: self.skips,
            skip_range: self.skip_range,
            channels,
            default_channel: None,
            properties,
            dependencies: self.dependencies,
        })
    }

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let skips_json: String = row.get(6)?;
        let skips = serde_json::from_str(&skips_json).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, Box::new(e))
        })?;

        let dependencies_json: String = row.get(9)?;
        let dependencies = serde_json::from_str(&dependencies_json).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(9, rusqlite::types::Type::Text, Box::new(e))
        })?;

        Ok(Self {
            id: Some(row.get(0)?),
            package: row.get(1)?,
            name: row.get(2)?,
            version: row.get(3)?,
            bundle_path: row.get(4)?,
            replaces: row.get(5)?,
            skips,
            skip_range: row.get(7)?,
            properties: row.get(8)?,
            dependencies,
        })
    }
}

/// A channel of a package and its head
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelRecord {
    pub package: String,
    pub name: String,
    pub head: String,
}

impl ChannelRecord {
    pub fn new(package: impl Into<String>, name: impl Into<String>, head: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            name: name.into(),
            head: head.into(),
        }
    }

    /// Insert the channel, or move its head if it exists
    pub fn upsert(&self, conn: &Connection) -> Result<()> {
        conn.execute(
            "INSERT INTO channels (package, name, head) VALUES (?1, ?2, ?3)
             ON CONFLICT(package, name) DO UPDATE SET head = excluded.head",
            params![&self.package, &self.name, &self.head],
        )?;
        Ok(())
    }

    pub fn find(conn: &Connection, package: &str, name: &str) -> Result<Option<Self>> {
        let mut stmt =
            conn.prepare("SELECT package, name, head FROM channels WHERE package = ?1 AND name = ?2")?;
        let channel = stmt
            .query_row(params![package, name], Self::from_row)
            .optional()?;
        Ok(channel)
    }

    /// Channels of a package in name order
    pub fn find_by_package(conn: &Connection, package: &str) -> Result<Vec<Self>> {
        let mut stmt =
            conn.prepare("SELECT package, name, head FROM channels WHERE package = ?1 ORDER BY name")?;
        let channels = stmt
            .query_map([package], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(channels)
    }

    /// Delete every channel of a package with its entries and edges
    pub fn delete_by_package(conn: &Connection, package: &str) -> Result<()> {
        conn.execute("DELETE FROM channel_edges WHERE package = ?1", [package])?;
        conn.execute("DELETE FROM channel_entries WHERE package = ?1", [package])?;
        conn.execute("DELETE FROM channels WHERE package = ?1", [package])?;
        Ok(())
    }

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            package: row.get(0)?,
            name: row.get(1)?,
            head: row.get(2)?,
        })
    }
}

/// Membership of a bundle in a channel
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelEntry {
    pub package: String,
    pub channel: String,
    pub bundle: String,
}

impl ChannelEntry {
    pub fn new(package: impl Into<String>, channel: impl Into<String>, bundle: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            channel: channel.into(),
            bundle: bundle.into(),
        }
    }

    /// Insert the membership; returns whether it was not already recorded
    pub fn insert(&self, conn: &Connection) -> Result<bool> {
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO channel_entries (package, channel, bundle) VALUES (?1, ?2, ?3)",
            params![&self.package, &self.channel, &self.bundle],
        )?;
        Ok(inserted > 0)
    }

    pub fn find_by_channel(conn: &Connection, package: &str, channel: &str) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT package, channel, bundle FROM channel_entries
             WHERE package = ?1 AND channel = ?2 ORDER BY bundle",
        )?;
        let entries = stmt
            .query_map(params![package, channel], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Channels a bundle belongs to, in name order
    pub fn channels_of(conn: &Connection, package: &str, bundle: &str) -> Result<Vec<String>> {
        let mut stmt = conn.prepare(
            "SELECT channel FROM channel_entries WHERE package = ?1 AND bundle = ?2 ORDER BY channel",
        )?;
        let channels = stmt
            .query_map(params![package, bundle], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(channels)
    }

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            package: row.get(0)?,
            channel: row.get(1)?,
            bundle: row.get(2)?,
        })
    }
}

/// A replaces or skips edge within a channel
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelEdge {
    pub package: String,
    pub channel: String,
    pub from_bundle: String,
    pub to_bundle: String,
    pub kind: EdgeKind,
}

impl ChannelEdge {
    pub fn new(
        package: impl Into<String>,
        channel: impl Into<String>,
        from_bundle: impl Into<String>,
        to_bundle: impl Into<String>,
        kind: EdgeKind,
    ) -> Self {
        Self {
            package: package.into(),
            channel: channel.into(),
            from_bundle: from_bundle.into(),
            to_bundle: to_bundle.into(),
            kind,
        }
    }

    pub fn insert(&self, conn: &Connection) -> Result<()> {
        conn.execute(
            "INSERT OR IGNORE INTO channel_edges (package, channel, from_bundle, to_bundle, kind)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                &self.package,
                &self.channel,
                &self.from_bundle,
                &self.to_bundle,
                self.kind.as_str(),
            ],
        )?;
        Ok(())
    }

    pub fn find_by_channel(conn: &Connection, package: &str, channel: &str) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT package, channel, from_bundle, to_bundle, kind FROM channel_edges
             WHERE package = ?1 AND channel = ?2 ORDER BY from_bundle, to_bundle, kind",
        )?;
        let edges = stmt
            .query_map(params![package, channel], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(edges)
    }

    /// The bundle whose replaces edge points at `bundle`, if any
    pub fn find_replacing(
        conn: &Connection,
        package: &str,
        channel: &str,
        bundle: &str,
    ) -> Result<Option<String>> {
        let replacing = conn
            .query_row(
                "SELECT from_bundle FROM channel_edges
                 WHERE package = ?1 AND channel = ?2 AND to_bundle = ?3 AND kind = 'replaces'",
                params![package, channel, bundle],
                |row| row.get(0),
            )
            .optional()?;
        Ok(replacing)
    }

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let kind_str: String = row.get(4)?;
        let kind = kind_str.parse::<EdgeKind>().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                4,
                rusqlite::types::Type::Text,
                Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
            )
        })?;

        Ok(Self {
            package: row.get(0)?,
            channel: row.get(1)?,
            from_bundle: row.get(2)?,
            to_bundle: row.get(3)?,
            kind,
        })
    }
}
