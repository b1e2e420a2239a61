// src/graph/semver.rs

//! Semver-mode graph builder
//!
//! Channels are ordered purely by version: every bundle replaces the nearest
//! lower version in the channel and the highest version is the head. The
//! chain is recomputed from the sorted members on every insertion, so the
//! result does not depend on insertion order.

use super::{BundleNode, ChannelGraph, EdgeKind, UpdateGraph};
use crate::bundle::Bundle;
use crate::error::GraphError;
use crate::version::{cmp_precedence, is_patch_predecessor, same_precedence};
use ::semver::Version;
use tracing::debug;

/// Inserts bundles by semantic version order
#[derive(Debug, Default)]
pub struct SemverGraphLoader;

impl SemverGraphLoader {
    pub fn new() -> Self {
        Self
    }

    /// Insert `bundle` into every channel it declares.
    ///
    /// With `skip_patch`, each bundle may additionally be reached directly
    /// from every earlier patch release of its major.minor. The graph is
    /// returned only if every channel accepted the bundle and the default
    /// channel names an existing channel.
    pub fn add_bundle_to_graph(
        &self,
        bundle: &Bundle,
        mut graph: UpdateGraph,
        default_channel: Option<&str>,
        skip_patch: bool,
    ) -> Result<UpdateGraph, GraphError> {
        if bundle.channels.is_empty() {
            return Err(GraphError::NoChannels {
                bundle: bundle.name.clone(),
            });
        }
        let version = bundle.semver()?;

        for channel in &bundle.channels {
            if let Some(existing) = graph.channel(channel) {
                check_new_member(bundle, &version, channel, &graph.package, existing)?;
            }
        }

        for channel in &bundle.channels {
            let cg = graph.channel_entry(channel);
            cg.add_bundle(BundleNode::new(&bundle.name, Some(version.clone())));
            rebuild_channel(cg, channel, skip_patch)?;
            debug!(
                "Inserted {} ({}) into channel {} by version",
                bundle.name, version, channel
            );
        }

        graph.resolve_default_channel(default_channel)?;
        Ok(graph)
    }
}

fn check_new_member(
    bundle: &Bundle,
    version: &Version,
    channel: &str,
    package: &str,
    cg: &ChannelGraph,
) -> Result<(), GraphError> {
    let duplicate_version = cg
        .bundles()
        .filter_map(|b| b.version.as_ref())
        .any(|v| same_precedence(v, version));
    if duplicate_version {
        return Err(GraphError::DuplicateVersion {
            package: package.to_string(),
            channel: channel.to_string(),
            version: version.to_string(),
        });
    }
    if cg.contains(&bundle.name) {
        return Err(GraphError::DuplicateBundle {
            bundle: bundle.name.clone(),
            channel: channel.to_string(),
        });
    }
    Ok(())
}

/// Recompute a channel's edges and head from its members' versions
fn rebuild_channel(cg: &mut ChannelGraph, channel: &str, skip_patch: bool) -> Result<(), GraphError> {
    let mut members: Vec<(String, Version)> = Vec::with_capacity(cg.len());
    for node in cg.bundles() {
        let version = node.version.clone().ok_or_else(|| GraphError::InvalidVersion {
            bundle: node.name.clone(),
            version: String::new(),
            reason: "semver ordering requires a version".to_string(),
        })?;
        members.push((node.name.clone(), version));
    }
    members.sort_by(|a, b| cmp_precedence(&a.1, &b.1));

    cg.clear_edges();
    for (i, (name, version)) in members.iter().enumerate() {
        if i == 0 {
            continue;
        }
        cg.add_edge(channel, name, &members[i - 1].0, EdgeKind::Replaces)?;

        if skip_patch {
            for (lower, lower_version) in &members[..i - 1] {
                if is_patch_predecessor(lower_version, version) {
                    cg.add_edge(channel, name, lower, EdgeKind::Skips)?;
                }
            }
        }
    }

    if let Some((head, _)) = members.last() {
        cg.set_head(channel, head)?;
    }
    Ok(())
}
