//! Configuration for shardsmith.
//!
//! Uses `figment` for layered settings: defaults -> user config file ->
//! explicit config file -> environment. The user file lives at
//! `~/.config/shardsmith/config.toml` (platform equivalent via `directories`).
//! Per-call options for generation and reading are plain structs
//! ([`DownloadConfig`], [`ReadConfig`]).

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

use crate::engine::ExecutionEngine;
use crate::error::{DatasetError, Result};

/// One mebibyte.
pub const MIB: u64 = 1 << 20;

/// Process-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Default root under which datasets are written.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Additional roots scanned for already prepared datasets.
    #[serde(default)]
    pub extra_data_dirs: Vec<PathBuf>,
    #[serde(default)]
    pub writer: WriterSettings,
    #[serde(default)]
    pub reader: ReaderSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            extra_data_dirs: Vec::new(),
            writer: WriterSettings::default(),
            reader: ReaderSettings::default(),
        }
    }
}

impl Settings {
    /// Every root scanned for existing data; the default root comes first.
    pub fn candidate_roots(&self) -> Vec<PathBuf> {
        let mut roots = vec![self.data_dir.clone()];
        for dir in &self.extra_data_dirs {
            if !roots.contains(dir) {
                roots.push(dir.clone());
            }
        }
        roots
    }
}

fn default_data_dir() -> PathBuf {
    directories::BaseDirs::new()
        .map(|d| d.home_dir().join("shardsmith_datasets"))
        .unwrap_or_else(|| PathBuf::from("shardsmith_datasets"))
}

/// Shard sizing and shuffle buffering for the split writer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriterSettings {
    /// Lower bound on the size of a shard, in bytes.
    #[serde(default = "default_min_shard_bytes")]
    pub min_shard_bytes: u64,
    /// Upper bound on the size of a shard, in bytes.
    #[serde(default = "default_max_shard_bytes")]
    pub max_shard_bytes: u64,
    /// Shard count used for the common mid-sized case.
    #[serde(default = "default_max_shards")]
    pub max_shards: u64,
    /// Bytes buffered in memory before the shuffler spills to disk.
    #[serde(default = "default_shuffle_memory_bytes")]
    pub shuffle_memory_bytes: u64,
}

impl Default for WriterSettings {
    fn default() -> Self {
        Self {
            min_shard_bytes: default_min_shard_bytes(),
            max_shard_bytes: default_max_shard_bytes(),
            max_shards: default_max_shards(),
            shuffle_memory_bytes: default_shuffle_memory_bytes(),
        }
    }
}

fn default_min_shard_bytes() -> u64 {
    64 * MIB
}

fn default_max_shard_bytes() -> u64 {
    1024 * MIB
}

fn default_max_shards() -> u64 {
    1024
}

fn default_shuffle_memory_bytes() -> u64 {
    1024 * MIB
}

/// Defaults applied when a [`ReadConfig`] leaves a knob unset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaderSettings {
    #[serde(default = "default_prefetch_buffer")]
    pub prefetch_buffer: usize,
    #[serde(default = "default_parallel_reads")]
    pub num_parallel_reads: usize,
}

impl Default for ReaderSettings {
    fn default() -> Self {
        Self {
            prefetch_buffer: default_prefetch_buffer(),
            num_parallel_reads: default_parallel_reads(),
        }
    }
}

fn default_prefetch_buffer() -> usize {
    16
}

fn default_parallel_reads() -> usize {
    4
}

/// Load settings from layered sources.
///
/// Priority (highest to lowest):
/// 1. Environment variables (`SHARDSMITH_DATA_DIR`, `SHARDSMITH_WRITER__MAX_SHARDS`, ...)
/// 2. Explicit config file, when given
/// 3. User config (`~/.config/shardsmith/config.toml`)
/// 4. Built-in defaults
pub fn load_settings(explicit: Option<&Path>) -> Result<Settings> {
    let mut figment = Figment::from(Serialized::defaults(Settings::default()));

    if let Some(dirs) = directories::ProjectDirs::from("dev", "shardsmith", "shardsmith") {
        let user_config = dirs.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(path) = explicit {
        figment = figment.merge(Toml::file(path));
    }

    figment = figment.merge(Env::prefixed("SHARDSMITH_").split("__"));

    figment
        .extract()
        .map_err(|e| DatasetError::from(Box::new(e)))
}

/// What to do when data or downloads already exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerateMode {
    /// Reuse a prepared dataset if present, otherwise generate it.
    #[default]
    ReuseDatasetIfExists,
    /// Regenerate the dataset but reuse cached downloads.
    ReuseCacheIfExists,
    /// Download and extract again, then regenerate.
    ForceRedownload,
}

/// When to compute per-split statistics after generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComputeStatsMode {
    /// Compute only if statistics are not already present.
    #[default]
    Auto,
    Force,
    Skip,
}

/// Options for a single `download_and_prepare` call.
#[derive(Clone, Default)]
pub struct DownloadConfig {
    pub mode: GenerateMode,
    pub compute_stats: ComputeStatsMode,
    /// Cap each sequential generator at this many examples.
    pub max_examples_per_split: Option<usize>,
    pub download_dir: Option<PathBuf>,
    pub extract_dir: Option<PathBuf>,
    pub manual_dir: Option<PathBuf>,
    /// Engine used by datasets that produce examples in parallel.
    pub engine: Option<Arc<dyn ExecutionEngine>>,
}

impl fmt::Debug for DownloadConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadConfig")
            .field("mode", &self.mode)
            .field("compute_stats", &self.compute_stats)
            .field("max_examples_per_split", &self.max_examples_per_split)
            .field("download_dir", &self.download_dir)
            .field("extract_dir", &self.extract_dir)
            .field("manual_dir", &self.manual_dir)
            .field("engine", &self.engine.as_ref().map(|e| e.name()))
            .finish()
    }
}

/// Options for composing a read pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadConfig {
    /// Seed for shard-order shuffling. Random when unset.
    #[serde(default)]
    pub shuffle_seed: Option<u64>,
    /// `Some(false)` keeps one shard order across iterations.
    #[serde(default)]
    pub reshuffle_each_iteration: Option<bool>,
    #[serde(default = "default_true")]
    pub try_autocache: bool,
    /// Explicit determinism request; `None` lets the composer decide.
    #[serde(default)]
    pub deterministic: Option<bool>,
    #[serde(default)]
    pub prefetch_buffer: Option<usize>,
    #[serde(default)]
    pub num_parallel_reads: Option<usize>,
}

impl Default for ReadConfig {
    fn default() -> Self {
        Self {
            shuffle_seed: None,
            reshuffle_each_iteration: None,
            try_autocache: true,
            deterministic: None,
            prefetch_buffer: None,
            num_parallel_reads: None,
        }
    }
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_writer_defaults() {
        let w = WriterSettings::default();
        assert_eq!(w.min_shard_bytes, 64 * MIB);
        assert_eq!(w.max_shard_bytes, 1024 * MIB);
        assert_eq!(w.max_shards, 1024);
    }

    #[test]
    fn test_candidate_roots_dedup() {
        let settings = Settings {
            data_dir: PathBuf::from("/a"),
            extra_data_dirs: vec![PathBuf::from("/b"), PathBuf::from("/a")],
            ..Settings::default()
        };
        assert_eq!(
            settings.candidate_roots(),
            vec![PathBuf::from("/a"), PathBuf::from("/b")]
        );
    }

    #[test]
    fn test_explicit_file_overrides_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.toml");
        std::fs::write(
            &path,
            "data_dir = \"/srv/datasets\"\n[writer]\nmax_shards = 8\n",
        )
        .unwrap();

        let settings = load_settings(Some(&path)).unwrap();
        assert_eq!(settings.writer.max_shards, 8);
        assert_eq!(settings.writer.min_shard_bytes, 64 * MIB);
        // SHARDSMITH_DATA_DIR in the environment would take precedence.
        if std::env::var_os("SHARDSMITH_DATA_DIR").is_none() {
            assert_eq!(settings.data_dir, PathBuf::from("/srv/datasets"));
        }
    }

    #[test]
    fn test_read_config_defaults() {
        let rc = ReadConfig::default();
        assert!(rc.try_autocache);
        assert!(rc.shuffle_seed.is_none());
        assert!(rc.deterministic.is_none());
    }
}
