//! Split catalog and the persisted dataset metadata file.
//!
//! A version directory holds exactly one `dataset_info.json` describing the
//! dataset and every split generated for it (shard lengths, byte sizes,
//! statistics). The directory counts as a complete version only when that
//! file and every shard it references exist.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DatasetError, Result};
use crate::persistence;
use crate::statistics::SplitStatistics;
use crate::version::Version;
use crate::writer::shard_filenames;

/// Metadata file name inside a version directory.
pub const METADATA_FILE: &str = "dataset_info.json";

/// Split name meaning "the union of all splits" at read time.
pub const ALL_SPLITS: &str = "all";

/// One named partition of a dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitInfo {
    pub name: String,
    /// Example count declared ahead of generation, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_examples: Option<u64>,
    /// Examples per shard, in shard-index order.
    #[serde(default)]
    pub shard_lengths: Vec<u64>,
    /// Total encoded size of the split.
    #[serde(default)]
    pub num_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statistics: Option<SplitStatistics>,
}

impl SplitInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            expected_examples: None,
            shard_lengths: Vec::new(),
            num_bytes: 0,
            statistics: None,
        }
    }

    pub fn with_expected_examples(mut self, n: u64) -> Self {
        self.expected_examples = Some(n);
        self
    }

    pub fn num_shards(&self) -> usize {
        self.shard_lengths.len()
    }

    /// Examples actually written, or the declared count before generation.
    pub fn num_examples(&self) -> u64 {
        if self.shard_lengths.is_empty() {
            self.expected_examples.unwrap_or(0)
        } else {
            self.shard_lengths.iter().sum()
        }
    }

    /// Shard file paths of this split inside `data_dir`.
    pub fn shard_paths(&self, dataset: &str, data_dir: &Path) -> Vec<PathBuf> {
        shard_filenames(dataset, &self.name, self.num_shards())
            .into_iter()
            .map(|f| data_dir.join(f))
            .collect()
    }
}

/// Every split generated for one dataset version, in generation order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SplitCatalog {
    splits: Vec<SplitInfo>,
}

impl SplitCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a split; `all` and names already present are rejected.
    pub fn add(&mut self, info: SplitInfo) -> Result<()> {
        if info.name.eq_ignore_ascii_case(ALL_SPLITS) {
            return Err(DatasetError::ReservedSplitName { name: info.name });
        }
        if self.get(&info.name).is_some() {
            return Err(DatasetError::DuplicateSplit { name: info.name });
        }
        self.splits.push(info);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&SplitInfo> {
        self.splits.iter().find(|s| s.name == name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut SplitInfo> {
        self.splits.iter_mut().find(|s| s.name == name)
    }

    /// Look up a split or fail listing the available names.
    pub fn require(&self, name: &str) -> Result<&SplitInfo> {
        self.get(name).ok_or_else(|| DatasetError::UnknownSplit {
            name: name.to_string(),
            available: self.names(),
        })
    }

    pub fn names(&self) -> Vec<String> {
        self.splits.iter().map(|s| s.name.clone()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SplitInfo> {
        self.splits.iter()
    }

    pub fn len(&self) -> usize {
        self.splits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.splits.is_empty()
    }

    pub fn total_num_examples(&self) -> u64 {
        self.splits.iter().map(SplitInfo::num_examples).sum()
    }

    pub fn total_bytes(&self) -> u64 {
        self.splits.iter().map(|s| s.num_bytes).sum()
    }

    /// Accept a freshly generated catalog in place of this one.
    ///
    /// An empty catalog accepts anything. Otherwise both must name the same
    /// set of splits: a different set means the generator changed without a
    /// version bump.
    pub fn reconcile(&mut self, dataset: &str, generated: SplitCatalog) -> Result<()> {
        if !self.is_empty() {
            let persisted: BTreeSet<String> = self.names().into_iter().collect();
            let fresh: BTreeSet<String> = generated.names().into_iter().collect();
            if persisted != fresh {
                return Err(DatasetError::InconsistentSplits {
                    dataset: dataset.to_string(),
                    persisted: persisted.into_iter().collect(),
                    generated: fresh.into_iter().collect(),
                });
            }
        }
        *self = generated;
        Ok(())
    }
}

/// Everything persisted about one dataset version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<String>,
    pub version: Version,
    #[serde(default)]
    pub description: String,
    /// `(input, label)` feature names for supervised reads.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supervised_keys: Option<(String, String)>,
    /// Expected download volume, refined with the actual size after a build.
    #[serde(default)]
    pub download_size: u64,
    /// Generated size estimate used by the disk-space check before a build.
    #[serde(default)]
    pub expected_dataset_size: u64,
    #[serde(default)]
    pub splits: SplitCatalog,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl DatasetInfo {
    pub fn new(name: impl Into<String>, version: Version) -> Self {
        Self {
            name: name.into(),
            config: None,
            version,
            description: String::new(),
            supervised_keys: None,
            download_size: 0,
            expected_dataset_size: 0,
            splits: SplitCatalog::new(),
            created_at: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_supervised_keys(mut self, input: impl Into<String>, label: impl Into<String>) -> Self {
        self.supervised_keys = Some((input.into(), label.into()));
        self
    }

    /// `name[/config]:version`, used in log and error messages.
    pub fn full_name(&self) -> String {
        match &self.config {
            Some(config) => format!("{}/{}:{}", self.name, config, self.version),
            None => format!("{}:{}", self.name, self.version),
        }
    }

    /// Bytes of generated data: the recorded split sizes once generated,
    /// the declared estimate before.
    pub fn dataset_size(&self) -> u64 {
        match self.splits.total_bytes() {
            0 => self.expected_dataset_size,
            n => n,
        }
    }

    pub fn write_to_directory(&self, dir: &Path) -> Result<()> {
        persistence::atomic_write_json(&dir.join(METADATA_FILE), self)
    }

    pub fn read_from_directory(dir: &Path) -> Result<Self> {
        let path = dir.join(METADATA_FILE);
        persistence::load_json(&path)?
            .ok_or_else(|| DatasetError::corrupt(&path, "metadata file is missing"))
    }
}

/// Whether `dir` holds a complete version: metadata plus every shard file.
pub fn is_complete_version_dir(dir: &Path) -> bool {
    let Ok(info) = DatasetInfo::read_from_directory(dir) else {
        return false;
    };
    info.splits
        .iter()
        .flat_map(|s| s.shard_paths(&info.name, dir))
        .all(|p| p.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn catalog(names: &[&str]) -> SplitCatalog {
        let mut c = SplitCatalog::new();
        for n in names {
            c.add(SplitInfo::new(*n)).unwrap();
        }
        c
    }

    #[test]
    fn test_add_rejects_all_and_duplicates() {
        let mut c = catalog(&["train"]);
        assert!(matches!(
            c.add(SplitInfo::new("ALL")),
            Err(DatasetError::ReservedSplitName { .. })
        ));
        assert!(matches!(
            c.add(SplitInfo::new("train")),
            Err(DatasetError::DuplicateSplit { .. })
        ));
        assert_eq!(c.names(), vec!["train".to_string()]);
    }

    #[test]
    fn test_num_examples_prefers_written_shards() {
        let mut info = SplitInfo::new("train").with_expected_examples(10);
        assert_eq!(info.num_examples(), 10);
        info.shard_lengths = vec![4, 5];
        assert_eq!(info.num_examples(), 9);
        assert_eq!(info.num_shards(), 2);
    }

    #[test]
    fn test_reconcile_accepts_when_empty_and_same_names() {
        let mut persisted = SplitCatalog::new();
        persisted.reconcile("d", catalog(&["train", "test"])).unwrap();
        assert_eq!(persisted.len(), 2);

        let mut regenerated = catalog(&["test", "train"]);
        regenerated.get_mut("train").unwrap().num_bytes = 7;
        persisted.reconcile("d", regenerated).unwrap();
        assert_eq!(persisted.get("train").unwrap().num_bytes, 7);
    }

    #[test]
    fn test_reconcile_rejects_changed_names() {
        let mut persisted = catalog(&["train", "test"]);
        let err = persisted
            .reconcile("d", catalog(&["train", "validation"]))
            .unwrap_err();
        match err {
            DatasetError::InconsistentSplits {
                persisted: p,
                generated: g,
                ..
            } => {
                assert_eq!(p, vec!["test".to_string(), "train".to_string()]);
                assert_eq!(g, vec!["train".to_string(), "validation".to_string()]);
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(persisted.names(), vec!["train".to_string(), "test".to_string()]);
    }

    #[test]
    fn test_metadata_roundtrip_and_completeness() {
        let dir = TempDir::new().unwrap();
        let mut info = DatasetInfo::new("mnist", Version::new(1, 0, 0))
            .with_supervised_keys("image", "label");
        let mut train = SplitInfo::new("train");
        train.shard_lengths = vec![2, 1];
        train.num_bytes = 30;
        info.splits.add(train).unwrap();
        info.write_to_directory(dir.path()).unwrap();

        let back = DatasetInfo::read_from_directory(dir.path()).unwrap();
        assert_eq!(back, info);
        assert_eq!(back.dataset_size(), 30);
        assert!(!is_complete_version_dir(dir.path()));

        for p in info.splits.get("train").unwrap().shard_paths("mnist", dir.path()) {
            std::fs::write(p, b"").unwrap();
        }
        assert!(is_complete_version_dir(dir.path()));
    }

    #[test]
    fn test_full_name() {
        let mut info = DatasetInfo::new("wiki", Version::new(2, 0, 1));
        assert_eq!(info.full_name(), "wiki:2.0.1");
        info.config = Some("en".into());
        assert_eq!(info.full_name(), "wiki/en:2.0.1");
    }
}
