//! Where a dataset version lives on disk.
//!
//! A version directory is `<root>/<name>[/<config>]/<version>`. Several roots
//! may be scanned for existing data; the resolver either reuses the single
//! root that already holds the requested version, refuses to guess when more
//! than one does, or falls back to the default root for a fresh build
//! (warning if some other version of the dataset is around).

use std::fs;
use std::path::{Path, PathBuf};

use crate::catalog::is_complete_version_dir;
use crate::config::Settings;
use crate::error::{DatasetError, Result};
use crate::version::Version;

/// Name, optional config and resolved version of a dataset.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DatasetIdentity {
    pub name: String,
    pub config: Option<String>,
    pub version: Version,
}

impl DatasetIdentity {
    pub fn new(name: impl Into<String>, config: Option<String>, version: Version) -> Self {
        Self {
            name: name.into(),
            config,
            version,
        }
    }

    /// `name[/config]`, the directory holding every version.
    pub fn unversioned_dir(&self) -> PathBuf {
        let mut dir = PathBuf::from(&self.name);
        if let Some(config) = &self.config {
            dir.push(config);
        }
        dir
    }

    /// `name[/config]/version`.
    pub fn versioned_dir(&self) -> PathBuf {
        self.unversioned_dir().join(self.version.to_string())
    }
}

/// Result of resolving a dataset's location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    /// Root the data lives under, or will be written under.
    pub root: PathBuf,
    /// Full version directory.
    pub path: PathBuf,
    /// Whether a complete copy of the requested version is already there.
    pub exists: bool,
    /// Complete directories of other versions found while scanning.
    pub other_versions: Vec<PathBuf>,
}

/// Complete version directories directly under `builder_dir`.
///
/// Entries whose name is not an `X.Y.Z` version (staging directories,
/// leftovers) and version directories without complete metadata are
/// skipped.
pub fn list_version_dirs(builder_dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(builder_dir) else {
        return Vec::new();
    };
    let mut dirs: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.file_name()
                .to_str()
                .is_some_and(|n| n.parse::<Version>().is_ok())
        })
        .map(|e| e.path())
        .filter(|p| is_complete_version_dir(p))
        .collect();
    dirs.sort();
    dirs
}

/// Resolves dataset identities against a set of candidate roots.
#[derive(Debug, Clone)]
pub struct LocationResolver {
    default_root: PathBuf,
    candidate_roots: Vec<PathBuf>,
}

impl LocationResolver {
    /// `default_root` is always scanned, first.
    pub fn new(default_root: PathBuf, candidate_roots: Vec<PathBuf>) -> Self {
        let mut roots = vec![default_root.clone()];
        for root in candidate_roots {
            if !roots.contains(&root) {
                roots.push(root);
            }
        }
        Self {
            default_root,
            candidate_roots: roots,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(settings.data_dir.clone(), settings.candidate_roots())
    }

    pub fn default_root(&self) -> &Path {
        &self.default_root
    }

    /// Decide where `identity` lives.
    ///
    /// With `explicit_root`, only that root is consulted and it is also the
    /// default for a fresh build.
    pub fn locate(&self, identity: &DatasetIdentity, explicit_root: Option<&Path>) -> Result<Location> {
        let (default_root, roots) = match explicit_root {
            Some(root) => (root.to_path_buf(), vec![root.to_path_buf()]),
            None => (self.default_root.clone(), self.candidate_roots.clone()),
        };
        let unversioned = identity.unversioned_dir();
        let versioned = identity.versioned_dir();

        let mut all_versions = Vec::new();
        let mut matches = Vec::new();
        for root in &roots {
            let found = list_version_dirs(&root.join(&unversioned));
            let requested = root.join(&versioned);
            if found.contains(&requested) {
                matches.push((root.clone(), requested));
            }
            all_versions.extend(found);
        }

        if matches.len() > 1 {
            return Err(DatasetError::AmbiguousLocation {
                matches: matches.into_iter().map(|(_, p)| p).collect(),
            });
        }
        let other_versions: Vec<PathBuf> = all_versions
            .into_iter()
            .filter(|p| !matches.iter().any(|(_, m)| m == p))
            .collect();

        if let Some((root, path)) = matches.pop() {
            return Ok(Location {
                root,
                path,
                exists: true,
                other_versions,
            });
        }

        let path = default_root.join(&versioned);
        if !other_versions.is_empty() {
            tracing::warn!(
                found = ?other_versions,
                using = %path.display(),
                "found a different version of the requested dataset"
            );
        }
        Ok(Location {
            root: default_root,
            path,
            exists: false,
            other_versions,
        })
    }
}
