// src/main.rs

use anyhow::Result;
use bundlereg::db::SqliteStore;
use bundlereg::registry::{
    DirectoryPopulator, GraphLoader, ManifestListPopulator, ManifestLists, Mode, PopulateOptions,
    Query,
};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(name = "bundlereg")]
#[command(author, version, about = "Bundle catalog with channel upgrade graphs", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the catalog database
    Init {
        /// Database path
        #[arg(short, long, default_value = "bundles.db")]
        db_path: String,
    },
    /// Add bundle directories to the catalog
    Add {
        /// Bundles as IMAGE=DIR pairs
        #[arg(required = true, value_parser = parse_image_pair)]
        bundles: Vec<(String, PathBuf)>,
        /// Update mode: replaces, semver or semver-skippatch
        #[arg(short, long, default_value = "replaces")]
        mode: Mode,
        /// Overwrite the payload of a current channel head
        #[arg(long)]
        overwrite: bool,
        /// Database path
        #[arg(short, long, default_value = "bundles.db")]
        db_path: String,
    },
    /// Load a manifest list document (definitions, manifests, packages)
    LoadManifests {
        /// JSON file with customResourceDefinitions, clusterServiceVersions and packages
        file: PathBuf,
        /// Database path
        #[arg(short, long, default_value = "bundles.db")]
        db_path: String,
    },
    /// Show the channels of a package with their replace chains
    Channels {
        /// Package name
        package: String,
        /// Database path
        #[arg(short, long, default_value = "bundles.db")]
        db_path: String,
    },
}

/// Split an `IMAGE=DIR` argument
fn parse_image_pair(arg: &str) -> std::result::Result<(String, PathBuf), String> {
    let (image, dir) = arg
        .split_once('=')
        .ok_or_else(|| format!("expected IMAGE=DIR, got {:?}", arg))?;
    if image.is_empty() || dir.is_empty() {
        return Err(format!("expected IMAGE=DIR, got {:?}", arg));
    }
    Ok((image.to_string(), PathBuf::from(dir)))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Init { db_path }) => {
            info!("Initializing catalog database at: {}", db_path);
            bundlereg::db::init(&db_path)?;
            println!("Database initialized successfully at: {}", db_path);
            Ok(())
        }
        Some(Commands::Add {
            bundles,
            mode,
            overwrite,
            db_path,
        }) => {
            let options = PopulateOptions { mode, overwrite };
            info!("Adding {} bundle(s) to {}", bundles.len(), db_path);

            let store = SqliteStore::open(&db_path)?;
            let summary = DirectoryPopulator::new(&store, &store, &store, bundles).populate(options)?;

            for name in &summary.overwrites {
                println!("Overwrote: {}", name);
            }
            for name in &summary.inserted {
                println!("Added: {}", name);
            }
            println!(
                "\nTotal: {} bundle(s) in {} pass(es)",
                summary.inserted.len() + summary.overwrites.len(),
                summary.passes
            );
            Ok(())
        }
        Some(Commands::LoadManifests { file, db_path }) => {
            info!("Loading manifest lists from {}", file.display());
            let lists: ManifestLists = serde_json::from_str(&std::fs::read_to_string(&file)?)?;

            let store = SqliteStore::open(&db_path)?;
            let loaded = ManifestListPopulator::new(&store, lists).populate()?;
            for name in &loaded {
                println!("Added: {}", name);
            }
            println!("\nTotal: {} bundle(s)", loaded.len());
            Ok(())
        }
        Some(Commands::Channels { package, db_path }) => {
            let store = SqliteStore::open(&db_path)?;
            let graph = store.generate(&package)?;
            let default_channel = store.get_default_channel_for_package(&package)?;

            println!("Package: {}", graph.package);
            for (name, channel) in graph.channels() {
                let marker = if default_channel.as_deref() == Some(name) {
                    " (default)"
                } else {
                    ""
                };
                let chain: Vec<String> = channel
                    .replace_chain()
                    .iter()
                    .map(|node| node.to_string())
                    .collect();
                println!("  {}{}: {}", name, marker, chain.join(" -> "));
            }
            Ok(())
        }
        None => {
            println!("bundlereg v{}", env!("CARGO_PKG_VERSION"));
            println!("Run 'bundlereg --help' for usage information");
            Ok(())
        }
    }
}
