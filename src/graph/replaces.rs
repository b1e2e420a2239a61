// src/graph/replaces.rs

//! Replaces-mode graph builder
//!
//! Bundles join a channel through their explicit predecessor (the
//! replaces-name) or, lacking one, through a skip range covering the current
//! head. A bundle whose predecessor is not in the graph yet is not an error:
//! it waits until a later pass has inserted the predecessor.

use super::{BundleNode, ChannelGraph, EdgeKind, UpdateGraph};
use crate::bundle::Bundle;
use crate::error::GraphError;
use crate::version::{SkipRange, cmp_precedence, same_precedence};
use std::cmp::Ordering;
use tracing::debug;

/// Outcome of checking a bundle against a graph
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// Every claimed channel can take the bundle now
    Ready,
    /// A predecessor is missing; the reason is reported if it never arrives
    Waiting(GraphError),
}

/// How the bundle joins one channel
#[derive(Debug, Clone)]
enum Placement {
    /// Channel is new or empty; the bundle becomes its only member
    Seed,
    /// Replace the channel's current head
    Extend { predecessor: String },
    /// New channel starting from a predecessor found in another channel
    Branch { predecessor: BundleNode },
}

/// Inserts bundles along explicit replaces and skip declarations
#[derive(Debug, Default)]
pub struct ReplacesGraphLoader;

impl ReplacesGraphLoader {
    pub fn new() -> Self {
        Self
    }

    /// Whether `bundle` can be inserted into `graph` now.
    ///
    /// Returns `Ok(false)` while a predecessor is absent and an error when the
    /// insertion would break the graph (cycle, duplicate, fork).
    pub fn can_add(&self, bundle: &Bundle, graph: &UpdateGraph) -> Result<bool, GraphError> {
        Ok(self.check(bundle, graph)? == Admission::Ready)
    }

    /// Like [`can_add`](Self::can_add), keeping the reason a bundle has to wait
    pub fn check(&self, bundle: &Bundle, graph: &UpdateGraph) -> Result<Admission, GraphError> {
        Ok(match self.plan(bundle, graph)? {
            Ok(_) => Admission::Ready,
            Err(reason) => Admission::Waiting(reason),
        })
    }

    /// Insert `bundle`, making it the head of every channel it claims
    pub fn add(&self, bundle: &Bundle, graph: &mut UpdateGraph) -> Result<(), GraphError> {
        let placements = self.plan(bundle, graph)??;
        let version = bundle.semver_opt();
        let range = bundle.parsed_skip_range()?;

        for (channel, placement) in placements {
            let cg = graph.channel_entry(&channel);
            cg.add_bundle(BundleNode::new(&bundle.name, version.clone()));

            let predecessor = match placement {
                Placement::Seed => None,
                Placement::Extend { predecessor } => Some(predecessor),
                Placement::Branch { predecessor } => {
                    let name = predecessor.name.clone();
                    cg.add_bundle(predecessor);
                    Some(name)
                }
            };
            if let Some(predecessor) = &predecessor {
                cg.add_edge(&channel, &bundle.name, predecessor, EdgeKind::Replaces)?;
            }
            cg.set_head(&channel, &bundle.name)?;

            for skipped in skip_targets(cg, bundle, range.as_ref(), predecessor.as_deref()) {
                cg.add_edge(&channel, &bundle.name, &skipped, EdgeKind::Skips)?;
            }

            debug!(
                "Added {} to channel {} of {} replacing {:?}",
                bundle.name, channel, graph.package, predecessor
            );
        }

        Ok(())
    }

    /// Whether `bundle` can take the place of the stored bundle of the same name.
    ///
    /// Channel membership and edges stay as stored, so only versions are
    /// checked: the bundle must still be newer than what it replaces, older
    /// than what replaces it, and distinct from every other member.
    pub fn check_overwrite(&self, bundle: &Bundle, graph: &UpdateGraph) -> Result<(), GraphError> {
        let Some(version) = bundle.semver_opt() else {
            return Ok(());
        };

        for (channel, cg) in graph.channels() {
            if !cg.contains(&bundle.name) {
                continue;
            }
            if let Some(predecessor) = cg.replaces(&bundle.name) {
                check_increasing(bundle, predecessor)?;
            }
            if let Some(successor) = cg.replaced_by(&bundle.name) {
                let newer = successor
                    .version
                    .as_ref()
                    .is_none_or(|v| cmp_precedence(v, &version) == Ordering::Greater);
                if !newer {
                    return Err(GraphError::VersionNotIncreasing {
                        bundle: successor.name.clone(),
                        version: successor.version.as_ref().map(|v| v.to_string()).unwrap_or_default(),
                        replaces: bundle.name.clone(),
                        replaces_version: version.to_string(),
                    });
                }
            }

            let duplicate = cg
                .bundles()
                .filter(|b| b.name != bundle.name)
                .filter_map(|b| b.version.as_ref())
                .any(|v| same_precedence(v, &version));
            if duplicate {
                return Err(GraphError::DuplicateVersion {
                    package: graph.package.clone(),
                    channel: channel.to_string(),
                    version: version.to_string(),
                });
            }
        }

        Ok(())
    }

    /// Decide how the bundle joins each claimed channel.
    ///
    /// The outer result carries structural errors, the inner one the reason
    /// the bundle must wait.
    fn plan(
        &self,
        bundle: &Bundle,
        graph: &UpdateGraph,
    ) -> Result<Result<Vec<(String, Placement)>, GraphError>, GraphError> {
        if bundle.channels.is_empty() {
            return Err(GraphError::NoChannels {
                bundle: bundle.name.clone(),
            });
        }
        let range = bundle.parsed_skip_range()?;
        let replaces = bundle.replaces.as_deref().filter(|r| !r.is_empty());

        if let Some(replaces) = replaces {
            check_cycle(bundle, replaces, graph)?;
        }

        let mut channels: Vec<&String> = bundle.channels.iter().collect();
        channels.sort();
        channels.dedup();

        let mut placements = Vec::new();
        let mut waiting = None;

        for channel in channels {
            let existing = graph.channel(channel).filter(|c| !c.is_empty());
            let placement = match existing {
                Some(cg) => {
                    if cg.contains(&bundle.name) {
                        return Err(GraphError::DuplicateBundle {
                            bundle: bundle.name.clone(),
                            channel: channel.clone(),
                        });
                    }
                    match predecessor_in_channel(bundle, replaces, range.as_ref(), channel, cg) {
                        Ok(predecessor) => {
                            check_extend(bundle, &predecessor, channel, &graph.package, cg)?;
                            Placement::Extend { predecessor }
                        }
                        Err(reason) => {
                            waiting.get_or_insert(reason);
                            continue;
                        }
                    }
                }
                None => match replaces {
                    None => Placement::Seed,
                    Some(replaces) => match graph.find_bundle(replaces) {
                        Some(node) => {
                            check_increasing(bundle, node)?;
                            Placement::Branch {
                                predecessor: node.clone(),
                            }
                        }
                        None => {
                            waiting.get_or_insert(GraphError::MissingReplacement {
                                bundle: bundle.name.clone(),
                                replaces: replaces.to_string(),
                            });
                            continue;
                        }
                    },
                },
            };
            placements.push((channel.clone(), placement));
        }

        Ok(match waiting {
            Some(reason) => Err(reason),
            None => Ok(placements),
        })
    }
}

/// Reject a replaces-name that is the bundle itself or one of its ancestors
fn check_cycle(bundle: &Bundle, replaces: &str, graph: &UpdateGraph) -> Result<(), GraphError> {
    let cycle = |channel: &str| GraphError::Cycle {
        bundle: bundle.name.clone(),
        replaces: replaces.to_string(),
        channel: channel.to_string(),
    };

    if replaces == bundle.name {
        return Err(cycle(bundle.channels.first().map(String::as_str).unwrap_or_default()));
    }
    for (channel, cg) in graph.channels() {
        if cg.contains(replaces) && cg.ancestors(replaces).contains(&bundle.name) {
            return Err(cycle(channel));
        }
    }
    Ok(())
}

/// Resolve the predecessor within an existing channel
fn predecessor_in_channel(
    bundle: &Bundle,
    replaces: Option<&str>,
    range: Option<&SkipRange>,
    channel: &str,
    cg: &ChannelGraph,
) -> Result<String, GraphError> {
    if let Some(replaces) = replaces {
        return if cg.contains(replaces) {
            Ok(replaces.to_string())
        } else {
            Err(GraphError::MissingReplacement {
                bundle: bundle.name.clone(),
                replaces: replaces.to_string(),
            })
        };
    }

    let head = cg.head();
    let in_range = match (range, head.and_then(|h| h.version.as_ref())) {
        (Some(range), Some(version)) => range.contains(version),
        _ => false,
    };
    match head {
        Some(head) if in_range => Ok(head.name.clone()),
        _ => Err(GraphError::MissingPredecessor {
            bundle: bundle.name.clone(),
            channel: channel.to_string(),
            head: head.map(|h| h.name.clone()).unwrap_or_default(),
        }),
    }
}

/// Structural checks for replacing `predecessor` inside an existing channel
fn check_extend(
    bundle: &Bundle,
    predecessor: &str,
    channel: &str,
    package: &str,
    cg: &ChannelGraph,
) -> Result<(), GraphError> {
    if let Some(replaced_by) = cg.replaced_by(predecessor) {
        return Err(GraphError::AlreadyReplaced {
            bundle: bundle.name.clone(),
            replaces: predecessor.to_string(),
            replaced_by: replaced_by.name.clone(),
            channel: channel.to_string(),
        });
    }

    if let Some(version) = bundle.semver_opt() {
        let duplicate = cg
            .bundles()
            .filter_map(|b| b.version.as_ref())
            .any(|v| same_precedence(v, &version));
        if duplicate {
            return Err(GraphError::DuplicateVersion {
                package: package.to_string(),
                channel: channel.to_string(),
                version: version.to_string(),
            });
        }
    }

    match cg.get(predecessor) {
        Some(node) => check_increasing(bundle, node),
        None => Ok(()),
    }
}

/// A bundle must be newer than the bundle it replaces when both are versioned
fn check_increasing(bundle: &Bundle, predecessor: &BundleNode) -> Result<(), GraphError> {
    if let (Some(version), Some(previous)) = (bundle.semver_opt(), predecessor.version.as_ref()) {
        if cmp_precedence(&version, previous) != Ordering::Greater {
            return Err(GraphError::VersionNotIncreasing {
                bundle: bundle.name.clone(),
                version: version.to_string(),
                replaces: predecessor.name.clone(),
                replaces_version: previous.to_string(),
            });
        }
    }
    Ok(())
}

/// Channel members the bundle may be upgraded to from directly
fn skip_targets(
    cg: &ChannelGraph,
    bundle: &Bundle,
    range: Option<&SkipRange>,
    predecessor: Option<&str>,
) -> Vec<String> {
    let eligible = |name: &str| name != bundle.name && Some(name) != predecessor;

    let mut targets: Vec<String> = bundle
        .skips
        .iter()
        .filter(|s| cg.contains(s) && eligible(s.as_str()))
        .cloned()
        .collect();

    if let Some(range) = range {
        for node in cg.bundles() {
            let covered = node.version.as_ref().is_some_and(|v| range.contains(v));
            if covered && eligible(node.name.as_str()) && !targets.contains(&node.name) {
                targets.push(node.name.clone());
            }
        }
    }

    targets.sort();
    targets
}
