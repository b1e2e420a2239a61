// src/db/schema.rs

//! Database schema definitions and migrations for bundlereg
//!
//! This module defines the SQLite schema for the catalog tables and provides
//! a migration system to evolve the schema over time.

use crate::error::{Error, Result};
use rusqlite::Connection;
use tracing::{debug, info};

/// Current schema version
pub const SCHEMA_VERSION: i32 = 3;

/// Initialize the schema version tracking table
fn init_schema_version(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;
    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> Result<i32> {
    init_schema_version(conn)?;

    let version = conn
        .query_row(
            "SELECT version FROM schema_version ORDER BY version DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    Ok(version)
}

/// Set the schema version
fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])?;
    Ok(())
}

/// Apply all pending migrations to bring the database up to date
pub fn migrate(conn: &Connection) -> Result<()> {
    let current_version = get_schema_version(conn)?;
    info!("Current schema version: {}", current_version);

    if current_version >= SCHEMA_VERSION {
        info!("Schema is up to date");
        return Ok(());
    }

    for version in (current_version + 1)..=SCHEMA_VERSION {
        info!("Applying migration to version {}", version);
        apply_migration(conn, version)?;
        set_schema_version(conn, version)?;
    }

    info!("Schema migration complete. Now at version {}", SCHEMA_VERSION);
    Ok(())
}

/// Apply a specific migration version
fn apply_migration(conn: &Connection, version: i32) -> Result<()> {
    match version {
        1 => migrate_v1(conn),
        2 => migrate_v2(conn),
        3 => migrate_v3(conn),
        _ => Err(Error::InitError(format!(
            "Unknown migration version: {}",
            version
        ))),
    }
}

/// Initial schema - Version 1
///
/// Creates the catalog tables:
/// - packages: package names and their default channel
/// - bundles: bundle payloads (properties are nulled once pruned)
/// - channels: one row per channel with its head
/// - channel_entries: channel membership
/// - channel_edges: replaces and skips edges within a channel
fn migrate_v1(conn: &Connection) -> Result<()> {
    debug!("Creating schema version 1");

    conn.execute_batch(
        "
        CREATE TABLE packages (
            name TEXT PRIMARY KEY,
            default_channel TEXT
        );

        CREATE TABLE bundles (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            package TEXT NOT NULL,
            name TEXT NOT NULL,
            version TEXT NOT NULL,
            bundle_path TEXT,
            replaces TEXT,
            skips TEXT NOT NULL DEFAULT '[]',
            skip_range TEXT,
            properties TEXT,
            UNIQUE(package, name),
            FOREIGN KEY (package) REFERENCES packages(name) ON DELETE CASCADE
        );

        CREATE INDEX idx_bundles_path ON bundles(bundle_path);

        CREATE TABLE channels (
            package TEXT NOT NULL,
            name TEXT NOT NULL,
            head TEXT NOT NULL,
            PRIMARY KEY (package, name),
            FOREIGN KEY (package) REFERENCES packages(name) ON DELETE CASCADE
        );

        CREATE TABLE channel_entries (
            package TEXT NOT NULL,
            channel TEXT NOT NULL,
            bundle TEXT NOT NULL,
            PRIMARY KEY (package, channel, bundle),
            FOREIGN KEY (package, channel) REFERENCES channels(package, name) ON DELETE CASCADE
        );

        CREATE TABLE channel_edges (
            package TEXT NOT NULL,
            channel TEXT NOT NULL,
            from_bundle TEXT NOT NULL,
            to_bundle TEXT NOT NULL,
            kind TEXT NOT NULL CHECK(kind IN ('replaces', 'skips')),
            PRIMARY KEY (package, channel, from_bundle, to_bundle, kind),
            FOREIGN KEY (package, channel) REFERENCES channels(package, name) ON DELETE CASCADE
        );
        ",
    )?;

    info!("Schema version 1 created successfully");
    Ok(())
}

/// Version 2: lookups by edge target
///
/// "What replaces X" is answered from the target side of the edge table.
fn migrate_v2(conn: &Connection) -> Result<()> {
    debug!("Migrating to schema version 2");

    conn.execute_batch(
        "
        CREATE INDEX idx_channel_edges_target ON channel_edges(package, channel, to_bundle, kind);
        CREATE INDEX idx_channel_entries_bundle ON channel_entries(package, bundle);
        ",
    )?;

    info!("Schema version 2 applied successfully");
    Ok(())
}

/// Version 3: bundle dependencies as a JSON list
fn migrate_v3(conn: &Connection) -> Result<()> {
    debug!("Migrating to schema version 3");

    conn.execute_batch(
        "ALTER TABLE bundles ADD COLUMN dependencies TEXT NOT NULL DEFAULT '[]';",
    )?;

    info!("Schema version 3 applied successfully");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn create_test_db() -> (NamedTempFile, Connection) {
        let temp_file = NamedTempFile::new().unwrap();
        let conn = Connection::open(temp_file.path()).unwrap();
        conn.execute_batch("PRAGMA foreign_keys = ON;").unwrap();
        (temp_file, conn)
    }

    #[test]
    fn test_schema_version_tracking() {
        let (_temp, conn) = create_test_db();

        let version = get_schema_version(&conn).unwrap();
        assert_eq!(version, 0);

        set_schema_version(&conn, 1).unwrap();
        let version = get_schema_version(&conn).unwrap();
        assert_eq!(version, 1);
    }

    #[test]
    fn test_migrate_creates_all_tables() {
        let (_temp, conn) = create_test_db();

        migrate(&conn).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap();

        for table in [
            "packages",
            "bundles",
            "channels",
            "channel_entries",
            "channel_edges",
            "schema_version",
        ] {
            assert!(tables.contains(&table.to_string()), "missing table {}", table);
        }
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let (_temp, conn) = create_test_db();

        migrate(&conn).unwrap();
        let version1 = get_schema_version(&conn).unwrap();

        migrate(&conn).unwrap();
        let version2 = get_schema_version(&conn).unwrap();

        assert_eq!(version1, version2);
        assert_eq!(version1, SCHEMA_VERSION);
    }

    #[test]
    fn test_bundles_unique_per_package() {
        let (_temp, conn) = create_test_db();
        migrate(&conn).unwrap();

        conn.execute("INSERT INTO packages (name) VALUES ('etcd')", [])
            .unwrap();
        conn.execute(
            "INSERT INTO bundles (package, name, version) VALUES (?1, ?2, ?3)",
            ["etcd", "etcdoperator.v0.9.2", "0.9.2"],
        )
        .unwrap();

        let result = conn.execute(
            "INSERT INTO bundles (package, name, version) VALUES (?1, ?2, ?3)",
            ["etcd", "etcdoperator.v0.9.2", "0.9.2"],
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_v2_database_gains_dependencies_column() {
        let (_temp, conn) = create_test_db();
        init_schema_version(&conn).unwrap();
        for version in 1..=2 {
            apply_migration(&conn, version).unwrap();
            set_schema_version(&conn, version).unwrap();
        }
        conn.execute("INSERT INTO packages (name) VALUES ('etcd')", [])
            .unwrap();
        conn.execute(
            "INSERT INTO bundles (package, name, version) VALUES ('etcd', 'etcdoperator.v0.9.0', '0.9.0')",
            [],
        )
        .unwrap();

        migrate(&conn).unwrap();

        let dependencies: String = conn
            .query_row("SELECT dependencies FROM bundles", [], |row| row.get(0))
            .unwrap();
        assert_eq!(dependencies, "[]");
        assert_eq!(get_schema_version(&conn).unwrap(), 3);
    }

    #[test]
    fn test_edge_kind_constraint() {
        let (_temp, conn) = create_test_db();
        migrate(&conn).unwrap();

        conn.execute("INSERT INTO packages (name) VALUES ('etcd')", [])
            .unwrap();
        conn.execute(
            "INSERT INTO channels (package, name, head) VALUES ('etcd', 'alpha', 'b')",
            [],
        )
        .unwrap();

        let result = conn.execute(
            "INSERT INTO channel_edges (package, channel, from_bundle, to_bundle, kind)
             VALUES ('etcd', 'alpha', 'b', 'a', 'upgrades')",
            [],
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_foreign_key_constraints() {
        let (_temp, conn) = create_test_db();
        migrate(&conn).unwrap();

        let result = conn.execute(
            "INSERT INTO channels (package, name, head) VALUES ('missing', 'alpha', 'b')",
            [],
        );
        assert!(result.is_err());
    }
}
