// src/version.rs

//! Version handling for bundles
//!
//! Bundle versions follow semantic versioning. Ordering uses semver
//! precedence (major, minor, patch, then pre-release); build metadata never
//! distinguishes two versions. Skip ranges are space-separated comparator
//! sets with optional `||` alternatives, e.g. `>=1.0.0 <1.2.0`.

use semver::{Version, VersionReq};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Parse a bundle version, tolerating a leading `v`
pub fn parse_version(raw: &str) -> std::result::Result<Version, semver::Error> {
    let trimmed = raw.trim();
    let trimmed = trimmed.strip_prefix('v').unwrap_or(trimmed);
    Version::parse(trimmed)
}

/// Compare two versions by semver precedence, ignoring build metadata
pub fn cmp_precedence(a: &Version, b: &Version) -> Ordering {
    (a.major, a.minor, a.patch)
        .cmp(&(b.major, b.minor, b.patch))
        .then_with(|| a.pre.cmp(&b.pre))
}

/// Whether two versions have equal precedence
pub fn same_precedence(a: &Version, b: &Version) -> bool {
    cmp_precedence(a, b) == Ordering::Equal
}

/// Whether `lower` is an earlier patch release of the same major.minor as `upper`
pub fn is_patch_predecessor(lower: &Version, upper: &Version) -> bool {
    lower.major == upper.major
        && lower.minor == upper.minor
        && cmp_precedence(lower, upper) == Ordering::Less
}

/// A version interval a bundle declares it can upgrade from
#[derive(Debug, Clone, PartialEq)]
pub struct SkipRange {
    raw: String,
    alternatives: Vec<VersionReq>,
}

impl SkipRange {
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Whether the version falls inside any alternative of the range
    pub fn contains(&self, version: &Version) -> bool {
        // Comparators never admit build metadata mismatches, strip it first
        let mut bare = version.clone();
        bare.build = semver::BuildMetadata::EMPTY;
        self.alternatives.iter().any(|req| matches_req(req, &bare))
    }
}

// VersionReq::matches rejects pre-releases unless a comparator names the same
// major.minor.patch; skip ranges treat pre-releases like any other version.
fn matches_req(req: &VersionReq, version: &Version) -> bool {
    req.comparators.iter().all(|cmp| {
        let bound = Version {
            major: cmp.major,
            minor: cmp.minor.unwrap_or(0),
            patch: cmp.patch.unwrap_or(0),
            pre: cmp.pre.clone(),
            build: semver::BuildMetadata::EMPTY,
        };
        let ord = cmp_precedence(version, &bound);
        match cmp.op {
            semver::Op::Exact => ord == Ordering::Equal,
            semver::Op::Greater => ord == Ordering::Greater,
            semver::Op::GreaterEq => ord != Ordering::Less,
            semver::Op::Less => ord == Ordering::Less,
            semver::Op::LessEq => ord != Ordering::Greater,
            _ => {
                let mut plain = version.clone();
                plain.pre = semver::Prerelease::EMPTY;
                semver::Comparator::matches(cmp, &plain)
            }
        }
    })
}

impl FromStr for SkipRange {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let mut alternatives = Vec::new();
        for alternative in s.split("||") {
            let comparators = join_comparators(alternative);
            if comparators.is_empty() {
                return Err(format!("empty range in {:?}", s));
            }
            let req = VersionReq::parse(&comparators.join(", ")).map_err(|e| e.to_string())?;
            alternatives.push(req);
        }

        Ok(Self {
            raw: s.trim().to_string(),
            alternatives,
        })
    }
}

impl fmt::Display for SkipRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Split a comparator set on whitespace, gluing bare operators to their operand
fn join_comparators(set: &str) -> Vec<String> {
    let mut comparators: Vec<String> = Vec::new();
    let mut pending_op: Option<&str> = None;

    for token in set.split_whitespace() {
        if token.chars().all(|c| matches!(c, '<' | '>' | '=' | '~' | '^')) {
            pending_op = Some(token);
            continue;
        }
        match pending_op.take() {
            Some(op) => comparators.push(format!("{}{}", op, token)),
            None => comparators.push(token.to_string()),
        }
    }

    comparators
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        parse_version(s).unwrap()
    }

    #[test]
    fn test_parse_version_strips_prefix() {
        assert_eq!(v("v1.2.3"), Version::new(1, 2, 3));
        assert!(parse_version("not-a-version").is_err());
    }

    #[test]
    fn test_precedence_ignores_build_metadata() {
        assert!(same_precedence(&v("1.0.0+build1"), &v("1.0.0+build2")));
        assert_eq!(cmp_precedence(&v("1.0.0-alpha"), &v("1.0.0")), Ordering::Less);
        assert_eq!(cmp_precedence(&v("0.22.2"), &v("0.15.0")), Ordering::Greater);
    }

    #[test]
    fn test_patch_predecessor() {
        assert!(is_patch_predecessor(&v("1.2.0"), &v("1.2.3")));
        assert!(!is_patch_predecessor(&v("1.1.9"), &v("1.2.3")));
        assert!(!is_patch_predecessor(&v("1.2.3"), &v("1.2.3")));
    }

    #[test]
    fn test_skip_range_conjunction() {
        let range: SkipRange = ">=1.0.0 <1.2.0".parse().unwrap();
        assert!(range.contains(&v("1.0.0")));
        assert!(range.contains(&v("1.1.7")));
        assert!(!range.contains(&v("1.2.0")));
        assert!(!range.contains(&v("0.9.0")));
        assert_eq!(range.to_string(), ">=1.0.0 <1.2.0");
    }

    #[test]
    fn test_skip_range_alternatives_and_spacing() {
        let range: SkipRange = "< 0.5.0 || >=2.0.0".parse().unwrap();
        assert!(range.contains(&v("0.4.1")));
        assert!(range.contains(&v("2.3.0")));
        assert!(!range.contains(&v("1.0.0")));
    }

    #[test]
    fn test_skip_range_admits_prereleases() {
        let range: SkipRange = ">=1.0.0 <2.0.0".parse().unwrap();
        assert!(range.contains(&v("1.5.0-rc.1")));
    }

    #[test]
    fn test_skip_range_rejects_garbage() {
        assert!("".parse::<SkipRange>().is_err());
        assert!(">=banana".parse::<SkipRange>().is_err());
    }
}
