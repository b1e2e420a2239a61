// src/lib.rs

//! Bundlereg bundle catalog
//!
//! Maintains a catalog of versioned bundles grouped into packages and
//! organized into upgrade channels, with per-channel update graphs built
//! either from explicit replaces declarations or from semantic versions.
//!
//! # Architecture
//!
//! - Database-first: all catalog state in SQLite, no config files
//! - Graphs are regenerated from storage for every insertion, never cached
//! - Storage is reached through the `Load`, `Query` and `GraphLoader` traits
//! - Batches are parsed in parallel and inserted sequentially

pub mod bundle;
pub mod db;
mod error;
pub mod graph;
pub mod property;
pub mod registry;
pub mod version;

pub use error::{Error, GraphError, Result};
