//! Semantic dataset versions and version-request resolution.
//!
//! A dataset declares one canonical version plus a list of supported legacy
//! versions it can still read. A request such as `1.2.*`, `1`, `1.0.0` or
//! `experimental_latest` is resolved against that list by [`VersionSet`].

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{DatasetError, Result};

/// Request string selecting the highest declared version, canonical or not.
pub const EXPERIMENTAL_LATEST: &str = "experimental_latest";

/// An immutable `major.minor.patch` dataset version.
///
/// Ordering and equality only consider the numeric triple. The optional
/// prepare marker names the last code revision able to generate data at
/// this version; a version carrying one can be read but not regenerated.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    prepare_marker: Option<String>,
}

impl Version {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
            prepare_marker: None,
        }
    }

    /// Mark this version as only generatable by code at or before `marker`.
    pub fn with_prepare_marker(mut self, marker: impl Into<String>) -> Self {
        self.prepare_marker = Some(marker.into());
        self
    }

    pub fn prepare_marker(&self) -> Option<&str> {
        self.prepare_marker.as_deref()
    }

    fn triple(&self) -> (u32, u32, u32) {
        (self.major, self.minor, self.patch)
    }

    /// Whether this version satisfies `request` (wildcards match anything).
    pub fn matches(&self, request: &VersionPattern) -> bool {
        request.major.is_none_or(|m| m == self.major)
            && request.minor.is_none_or(|m| m == self.minor)
            && request.patch.is_none_or(|p| p == self.patch)
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.triple() == other.triple()
    }
}

impl Eq for Version {}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.triple().cmp(&other.triple())
    }
}

impl std::hash::Hash for Version {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.triple().hash(state);
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for Version {
    type Err = DatasetError;

    /// Parses a complete `X.Y.Z` version. Wildcards are rejected here; use
    /// [`VersionPattern`] for requests.
    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split('.').collect();
        if parts.len() != 3 {
            return Err(DatasetError::invalid_version(s, "expected X.Y.Z"));
        }
        let mut nums = [0u32; 3];
        for (slot, part) in nums.iter_mut().zip(&parts) {
            *slot = parse_component(s, part)?;
        }
        Ok(Self::new(nums[0], nums[1], nums[2]))
    }
}

impl TryFrom<String> for Version {
    type Error = DatasetError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Version> for String {
    fn from(v: Version) -> Self {
        v.to_string()
    }
}

fn parse_component(input: &str, part: &str) -> Result<u32> {
    if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
        return Err(DatasetError::invalid_version(
            input,
            format!("component '{part}' is not a number"),
        ));
    }
    part.parse()
        .map_err(|_| DatasetError::invalid_version(input, format!("component '{part}' overflows")))
}

/// A version request with optional wildcard components.
///
/// `1.2.*`, `1.2` and `1` are all accepted; an omitted component or `*`
/// matches any value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VersionPattern {
    pub major: Option<u32>,
    pub minor: Option<u32>,
    pub patch: Option<u32>,
}

impl FromStr for VersionPattern {
    type Err = DatasetError;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split('.').collect();
        if parts.is_empty() || parts.len() > 3 {
            return Err(DatasetError::invalid_version(
                s,
                "expected at most three components",
            ));
        }
        let mut slots = [None; 3];
        for (slot, part) in slots.iter_mut().zip(&parts) {
            *slot = match *part {
                "*" => None,
                other => Some(parse_component(s, other)?),
            };
        }
        Ok(Self {
            major: slots[0],
            minor: slots[1],
            patch: slots[2],
        })
    }
}

/// The canonical version of a dataset plus its supported legacy versions.
#[derive(Debug, Clone)]
pub struct VersionSet {
    dataset: String,
    canonical: Version,
    supported: Vec<Version>,
}

impl VersionSet {
    pub fn new(dataset: impl Into<String>, canonical: Version, supported: Vec<Version>) -> Self {
        Self {
            dataset: dataset.into(),
            canonical,
            supported,
        }
    }

    pub fn canonical(&self) -> &Version {
        &self.canonical
    }

    pub fn supported(&self) -> &[Version] {
        &self.supported
    }

    /// Candidates in preference order: canonical first, then supported.
    pub fn candidates(&self) -> impl Iterator<Item = &Version> {
        std::iter::once(&self.canonical).chain(self.supported.iter())
    }

    /// The highest candidate by version order.
    pub fn latest(&self) -> &Version {
        self.candidates().max().unwrap_or(&self.canonical)
    }

    /// Versions the current code may generate: the canonical one and the
    /// highest supported one, sorted and deduplicated.
    pub fn generatable(&self) -> Vec<Version> {
        let mut out = vec![self.canonical.clone(), self.latest().clone()];
        out.sort();
        out.dedup();
        out
    }

    /// Resolve a request to one concrete version.
    ///
    /// `None` selects the canonical version; [`EXPERIMENTAL_LATEST`] selects
    /// the maximum; anything else picks the first candidate matching the
    /// pattern.
    pub fn resolve(&self, requested: Option<&str>) -> Result<Version> {
        let Some(requested) = requested else {
            return Ok(self.canonical.clone());
        };
        if requested == EXPERIMENTAL_LATEST {
            return Ok(self.latest().clone());
        }
        let pattern: VersionPattern = requested.parse()?;
        self.candidates()
            .find(|v| v.matches(&pattern))
            .cloned()
            .ok_or_else(|| DatasetError::VersionResolution {
                dataset: self.dataset.clone(),
                requested: requested.to_string(),
                available: self.candidates().map(|v| v.to_string()).collect(),
            })
    }
}
