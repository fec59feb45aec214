//! Release tags and version comparison.
//!
//! Versions in config and state are strings: a concrete tag (`v1.2.0` or
//! `1.2.0`), the `stable` sentinel, or empty. `stable` and empty compare as
//! newer than every concrete version.

use crate::error::{Result, RolloutError};
use semver::Version;
use std::cmp::Ordering;

pub const STABLE: &str = "stable";

/// `true` for the `stable` sentinel and for an empty version.
pub fn is_stable(version: &str) -> bool {
    let v = version.trim();
    v.is_empty() || v == STABLE
}

/// Parse a release tag into a semantic version.
///
/// A leading `v` is ignored and missing minor/patch components are padded,
/// so `v1`, `v1.2` and `1.2.0` are all accepted.
pub fn parse_version(raw: &str) -> Result<Version> {
    let trimmed = raw.trim().trim_start_matches('v');
    if let Ok(v) = Version::parse(trimmed) {
        return Ok(v);
    }
    let core_len = trimmed
        .find(|c: char| c == '-' || c == '+')
        .unwrap_or(trimmed.len());
    let (core, rest) = trimmed.split_at(core_len);
    let parts = core.split('.').count();
    if !core.is_empty() && parts < 3 && core.split('.').all(|p| p.parse::<u64>().is_ok()) {
        let padded = format!("{core}{}{rest}", ".0".repeat(3 - parts));
        if let Ok(v) = Version::parse(&padded) {
            return Ok(v);
        }
    }
    Err(RolloutError::MalformedVersion(raw.to_string()))
}

/// A release: the tag as published plus its parsed version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Release {
    pub tag: String,
    pub version: Version,
}

impl Release {
    pub fn parse(tag: &str) -> Result<Self> {
        Ok(Self {
            tag: tag.trim().to_string(),
            version: parse_version(tag)?,
        })
    }
}

impl PartialOrd for Release {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Release {
    fn cmp(&self, other: &Self) -> Ordering {
        self.version
            .cmp(&other.version)
            .then_with(|| self.tag.cmp(&other.tag))
    }
}

impl std::fmt::Display for Release {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.tag)
    }
}

/// Compare two version strings where `stable`/empty is the newest.
pub fn compare(a: &str, b: &str) -> Result<Ordering> {
    match (is_stable(a), is_stable(b)) {
        (true, true) => Ok(Ordering::Equal),
        (true, false) => Ok(Ordering::Greater),
        (false, true) => Ok(Ordering::Less),
        (false, false) => Ok(parse_version(a)?.cmp(&parse_version(b)?)),
    }
}

/// The older of two version strings. `stable` never wins against a
/// concrete version.
pub fn older(a: &str, b: &str) -> Result<String> {
    Ok(match compare(a, b)? {
        Ordering::Greater => normalize(b),
        _ => normalize(a),
    })
}

/// The newer of two version strings; `stable` always wins.
pub fn newer(a: &str, b: &str) -> Result<String> {
    Ok(match compare(a, b)? {
        Ordering::Less => normalize(b),
        _ => normalize(a),
    })
}

fn normalize(v: &str) -> String {
    if is_stable(v) {
        STABLE.to_string()
    } else {
        v.trim().to_string()
    }
}
