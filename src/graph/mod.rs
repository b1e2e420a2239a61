// src/graph/mod.rs

//! Per-package update graphs
//!
//! An [`UpdateGraph`] holds one [`ChannelGraph`] per channel. Each channel is
//! a petgraph arena of bundle nodes with edges pointing from a newer bundle
//! to the bundle it replaces (primary) or may skip-upgrade from (secondary).
//! Graphs have no resident lifetime: they are regenerated from storage,
//! mutated in memory by one of the builders, and handed back to storage.

pub mod replaces;
pub mod semver;

pub use self::replaces::ReplacesGraphLoader;
pub use self::semver::SemverGraphLoader;

use crate::error::GraphError;
use crate::version::same_precedence;
use ::semver::Version;
use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

/// Kind of an upgrade edge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EdgeKind {
    /// Primary edge to the replaced bundle
    Replaces,
    /// Secondary edge to a bundle that may upgrade directly
    Skips,
}

impl EdgeKind {
    pub fn as_str(&self) -> &str {
        match self {
            EdgeKind::Replaces => "replaces",
            EdgeKind::Skips => "skips",
        }
    }
}

impl FromStr for EdgeKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "replaces" => Ok(EdgeKind::Replaces),
            "skips" => Ok(EdgeKind::Skips),
            _ => Err(format!("Invalid edge kind: {}", s)),
        }
    }
}

/// A bundle as seen by the graph
#[derive(Debug, Clone, PartialEq)]
pub struct BundleNode {
    pub name: String,
    /// Parsed version; `None` when the stored version is not valid semver
    pub version: Option<Version>,
}

impl BundleNode {
    pub fn new(name: impl Into<String>, version: Option<Version>) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }
}

impl fmt::Display for BundleNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version {
            Some(v) => write!(f, "{}@{}", self.name, v),
            None => f.write_str(&self.name),
        }
    }
}

/// Upgrade graph of a single channel
#[derive(Debug, Clone, Default)]
pub struct ChannelGraph {
    graph: DiGraph<BundleNode, EdgeKind>,
    index: HashMap<String, NodeIndex>,
    head: Option<NodeIndex>,
}

impl ChannelGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a bundle node; adding an existing name returns its index unchanged
    pub fn add_bundle(&mut self, node: BundleNode) -> NodeIndex {
        if let Some(idx) = self.index.get(&node.name) {
            return *idx;
        }
        let name = node.name.clone();
        let idx = self.graph.add_node(node);
        self.index.insert(name, idx);
        idx
    }

    /// Add an edge between two bundles already in the channel
    pub fn add_edge(
        &mut self,
        channel: &str,
        from: &str,
        to: &str,
        kind: EdgeKind,
    ) -> std::result::Result<(), GraphError> {
        let from_idx = self.lookup(channel, from)?;
        let to_idx = self.lookup(channel, to)?;
        let exists = self
            .graph
            .edges_connecting(from_idx, to_idx)
            .any(|e| *e.weight() == kind);
        if !exists {
            self.graph.add_edge(from_idx, to_idx, kind);
        }
        Ok(())
    }

    pub fn set_head(&mut self, channel: &str, name: &str) -> std::result::Result<(), GraphError> {
        self.head = Some(self.lookup(channel, name)?);
        Ok(())
    }

    /// Drop every edge, keeping the nodes
    pub fn clear_edges(&mut self) {
        self.graph.clear_edges();
    }

    pub fn head(&self) -> Option<&BundleNode> {
        self.head.and_then(|idx| self.graph.node_weight(idx))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&BundleNode> {
        self.index.get(name).and_then(|idx| self.graph.node_weight(*idx))
    }

    pub fn bundles(&self) -> impl Iterator<Item = &BundleNode> {
        self.graph.node_weights()
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// All edges as `(from, to, kind)`
    pub fn edges(&self) -> impl Iterator<Item = (&str, &str, EdgeKind)> {
        self.graph.edge_references().map(|e| {
            (
                self.graph[e.source()].name.as_str(),
                self.graph[e.target()].name.as_str(),
                *e.weight(),
            )
        })
    }

    /// The bundle `name` replaces in this channel
    pub fn replaces(&self, name: &str) -> Option<&BundleNode> {
        self.neighbor(name, Direction::Outgoing, EdgeKind::Replaces)
            .into_iter()
            .next()
    }

    /// The bundle replacing `name` in this channel
    pub fn replaced_by(&self, name: &str) -> Option<&BundleNode> {
        self.neighbor(name, Direction::Incoming, EdgeKind::Replaces)
            .into_iter()
            .next()
    }

    /// Bundles `name` may be upgraded to from, bypassing its predecessor
    pub fn skips(&self, name: &str) -> Vec<&BundleNode> {
        let mut skipped = self.neighbor(name, Direction::Outgoing, EdgeKind::Skips);
        skipped.sort_by(|a, b| a.name.cmp(&b.name));
        skipped
    }

    /// Names reachable from `name` along replaces edges, excluding `name`
    pub fn ancestors(&self, name: &str) -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut current = self.replaces(name);
        while let Some(node) = current {
            if !seen.insert(node.name.clone()) {
                break;
            }
            current = self.replaces(&node.name);
        }
        seen
    }

    /// The replace chain walked from the head, newest first
    pub fn replace_chain(&self) -> Vec<&BundleNode> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut current = self.head();
        while let Some(node) = current {
            if !seen.insert(node.name.as_str()) {
                break;
            }
            chain.push(node);
            current = self.replaces(&node.name);
        }
        chain
    }

    /// Bundles nothing in the channel replaces
    pub fn tips(&self) -> Vec<&BundleNode> {
        self.graph
            .node_indices()
            .filter(|idx| {
                !self
                    .graph
                    .edges_directed(*idx, Direction::Incoming)
                    .any(|e| *e.weight() == EdgeKind::Replaces)
            })
            .map(|idx| &self.graph[idx])
            .collect()
    }

    /// Check the single-head, unique-version and chain-coverage invariants
    pub fn validate(&self, package: &str, channel: &str) -> std::result::Result<(), GraphError> {
        if self.is_empty() {
            return Ok(());
        }

        let tips = self.tips();
        let head = match (self.head(), tips.as_slice()) {
            (Some(head), [tip]) if tip.name == head.name => head,
            _ => {
                return Err(GraphError::HeadCount {
                    channel: channel.to_string(),
                    heads: tips.len(),
                });
            }
        };

        let versions: Vec<&Version> = self.bundles().filter_map(|b| b.version.as_ref()).collect();
        for (i, a) in versions.iter().enumerate() {
            if let Some(b) = versions[i + 1..].iter().find(|b| same_precedence(a, b)) {
                return Err(GraphError::DuplicateVersion {
                    package: package.to_string(),
                    channel: channel.to_string(),
                    version: b.to_string(),
                });
            }
        }

        if self.replace_chain().len() != self.len() {
            return Err(GraphError::BrokenChain {
                channel: channel.to_string(),
                head: head.name.clone(),
            });
        }

        Ok(())
    }

    fn lookup(&self, channel: &str, name: &str) -> std::result::Result<NodeIndex, GraphError> {
        self.index
            .get(name)
            .copied()
            .ok_or_else(|| GraphError::UnknownBundle {
                bundle: name.to_string(),
                channel: channel.to_string(),
            })
    }

    fn neighbor(&self, name: &str, direction: Direction, kind: EdgeKind) -> Vec<&BundleNode> {
        let Some(idx) = self.index.get(name) else {
            return Vec::new();
        };
        self.graph
            .edges_directed(*idx, direction)
            .filter(|e| *e.weight() == kind)
            .map(|e| match direction {
                Direction::Outgoing => &self.graph[e.target()],
                Direction::Incoming => &self.graph[e.source()],
            })
            .collect()
    }
}

/// Update graph of one package: one channel graph per channel
#[derive(Debug, Clone, Default)]
pub struct UpdateGraph {
    pub package: String,
    pub default_channel: Option<String>,
    channels: BTreeMap<String, ChannelGraph>,
}

impl UpdateGraph {
    pub fn new(package: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            default_channel: None,
            channels: BTreeMap::new(),
        }
    }

    pub fn channel(&self, name: &str) -> Option<&ChannelGraph> {
        self.channels.get(name)
    }

    /// The named channel, created empty if missing
    pub fn channel_entry(&mut self, name: &str) -> &mut ChannelGraph {
        self.channels.entry(name.to_string()).or_default()
    }

    /// Channels in name order
    pub fn channels(&self) -> impl Iterator<Item = (&str, &ChannelGraph)> {
        self.channels.iter().map(|(name, graph)| (name.as_str(), graph))
    }

    pub fn channel_names(&self) -> Vec<String> {
        self.channels.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.values().all(ChannelGraph::is_empty)
    }

    /// Find a bundle by name in any channel
    pub fn find_bundle(&self, name: &str) -> Option<&BundleNode> {
        self.channels.values().find_map(|c| c.get(name))
    }

    /// Adopt `requested` as default channel if given, then require that it exists.
    ///
    /// A package with a single channel and no default adopts that channel.
    pub fn resolve_default_channel(
        &mut self,
        requested: Option<&str>,
    ) -> std::result::Result<(), GraphError> {
        if let Some(channel) = requested.filter(|c| !c.is_empty()) {
            self.default_channel = Some(channel.to_string());
        }
        if self.default_channel.is_none() && self.channels.len() == 1 {
            self.default_channel = self.channels.keys().next().cloned();
        }
        match self.default_channel.as_deref() {
            Some(channel) if self.channels.contains_key(channel) => Ok(()),
            other => Err(GraphError::DefaultChannelMissing {
                package: self.package.clone(),
                channel: other.unwrap_or_default().to_string(),
            }),
        }
    }

    /// Validate every channel
    pub fn validate(&self) -> std::result::Result<(), GraphError> {
        for (name, channel) in &self.channels {
            channel.validate(&self.package, name)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::parse_version;

    fn node(name: &str, version: &str) -> BundleNode {
        BundleNode::new(name, parse_version(version).ok())
    }

    fn chain(names: &[(&str, &str)]) -> ChannelGraph {
        let mut channel = ChannelGraph::new();
        for (name, version) in names {
            channel.add_bundle(node(name, version));
        }
        for pair in names.windows(2) {
            channel.add_edge("stable", pair[1].0, pair[0].0, EdgeKind::Replaces).unwrap();
        }
        channel.set_head("stable", names[names.len() - 1].0).unwrap();
        channel
    }

    #[test]
    fn test_add_bundle_is_idempotent() {
        let mut channel = ChannelGraph::new();
        let a = channel.add_bundle(node("a", "1.0.0"));
        let again = channel.add_bundle(node("a", "1.0.0"));
        assert_eq!(a, again);
        assert_eq!(channel.len(), 1);
    }

    #[test]
    fn test_chain_navigation() {
        let channel = chain(&[("a", "1.0.0"), ("b", "1.1.0"), ("c", "1.2.0")]);

        assert_eq!(channel.head().unwrap().name, "c");
        assert_eq!(channel.replaces("c").unwrap().name, "b");
        assert_eq!(channel.replaced_by("a").unwrap().name, "b");
        assert!(channel.replaced_by("c").is_none());

        let names: Vec<&str> = channel.replace_chain().iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["c", "b", "a"]);

        let ancestors = channel.ancestors("c");
        assert!(ancestors.contains("a") && ancestors.contains("b"));
        assert!(!ancestors.contains("c"));
        assert!(channel.validate("pkg", "stable").is_ok());
    }

    #[test]
    fn test_unknown_bundle_edge() {
        let mut channel = chain(&[("a", "1.0.0")]);
        let err = channel.add_edge("stable", "a", "ghost", EdgeKind::Replaces).unwrap_err();
        assert!(matches!(err, GraphError::UnknownBundle { .. }));
    }

    #[test]
    fn test_validate_detects_two_heads() {
        let mut channel = chain(&[("a", "1.0.0"), ("b", "1.1.0")]);
        channel.add_bundle(node("x", "2.0.0"));
        let err = channel.validate("pkg", "stable").unwrap_err();
        assert_eq!(
            err,
            GraphError::HeadCount {
                channel: "stable".to_string(),
                heads: 2
            }
        );
    }

    #[test]
    fn test_validate_detects_duplicate_versions() {
        let mut channel = ChannelGraph::new();
        channel.add_bundle(node("a", "1.0.0+one"));
        channel.add_bundle(node("b", "1.0.0+two"));
        channel.add_edge("stable", "b", "a", EdgeKind::Replaces).unwrap();
        channel.set_head("stable", "b").unwrap();

        let err = channel.validate("pkg", "stable").unwrap_err();
        assert!(matches!(err, GraphError::DuplicateVersion { .. }));
    }

    #[test]
    fn test_skip_edges_do_not_affect_chain() {
        let mut channel = chain(&[("a", "1.0.0"), ("b", "1.1.0"), ("c", "1.2.0")]);
        channel.add_edge("stable", "c", "a", EdgeKind::Skips).unwrap();
        channel.add_edge("stable", "c", "a", EdgeKind::Skips).unwrap();

        assert_eq!(channel.skips("c").len(), 1);
        assert_eq!(channel.replace_chain().len(), 3);
        assert_eq!(channel.edges().count(), 3);
    }

    #[test]
    fn test_default_channel_must_exist() {
        let mut graph = UpdateGraph::new("etcd");
        graph.channel_entry("alpha").add_bundle(node("a", "1.0.0"));

        assert!(graph.resolve_default_channel(Some("alpha")).is_ok());
        assert!(matches!(
            graph.resolve_default_channel(Some("beta")),
            Err(GraphError::DefaultChannelMissing { .. })
        ));

        let mut empty = UpdateGraph::new("etcd");
        assert!(empty.resolve_default_channel(None).is_err());
        assert!(empty.is_empty());
    }
}
