//! Dataset definitions.
//!
//! A dataset is code: it implements [`Dataset`], declares its versions and
//! builder configs, and produces split generators on demand. The builder
//! only ever talks to a dataset through this trait.

use std::path::Path;
use std::sync::Arc;

use crate::catalog::{DatasetInfo, SplitInfo};
use crate::download::DownloadManager;
use crate::engine::PartitionedSource;
use crate::error::{DatasetError, Result};
use crate::example::{Example, ExampleCodec, ExampleKey, JsonCodec};
use crate::location::DatasetIdentity;
use crate::reader::{ShardSource, SplitRead, SplitSource};
use crate::version::{Version, VersionSet};

/// A named variant of a dataset (a sub-corpus, an encoding choice, ...).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuilderConfig {
    pub name: String,
    pub version: Option<Version>,
    pub supported_versions: Vec<Version>,
    pub description: Option<String>,
}

impl BuilderConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: None,
            supported_versions: Vec::new(),
            description: None,
        }
    }

    pub fn with_version(mut self, version: Version) -> Self {
        self.version = Some(version);
        self
    }

    pub fn with_supported_versions(mut self, versions: Vec<Version>) -> Self {
        self.supported_versions = versions;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Which config to build: one of the dataset's own, or a caller-made one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigChoice {
    Named(String),
    Custom(BuilderConfig),
}

impl From<&str> for ConfigChoice {
    fn from(name: &str) -> Self {
        ConfigChoice::Named(name.to_string())
    }
}

impl From<String> for ConfigChoice {
    fn from(name: String) -> Self {
        ConfigChoice::Named(name)
    }
}

impl From<BuilderConfig> for ConfigChoice {
    fn from(config: BuilderConfig) -> Self {
        ConfigChoice::Custom(config)
    }
}

/// Examples of one split, as a generator provides them.
pub enum ExampleSource {
    /// Lazy, finite, consumed exactly once by the split writer.
    Sequential(Box<dyn Iterator<Item = Result<(ExampleKey, Example)>> + Send>),
    /// Partitions plus a transform, run by an execution engine.
    Partitioned(PartitionedSource),
}

/// A split to generate: its declared info and where its examples come from.
pub struct SplitGenerator {
    pub info: SplitInfo,
    pub source: ExampleSource,
}

impl SplitGenerator {
    pub fn sequential<I>(info: SplitInfo, examples: I) -> Self
    where
        I: IntoIterator<Item = Result<(ExampleKey, Example)>>,
        I::IntoIter: Send + 'static,
    {
        Self {
            info,
            source: ExampleSource::Sequential(Box::new(examples.into_iter())),
        }
    }

    pub fn partitioned(info: SplitInfo, source: PartitionedSource) -> Self {
        Self {
            info,
            source: ExampleSource::Partitioned(source),
        }
    }
}

/// What a dataset sees while its splits are being generated.
///
/// `data_dir` is the staging directory of the running build, never the
/// final version directory.
pub struct GenerationContext<'a> {
    pub identity: &'a DatasetIdentity,
    pub config: Option<&'a BuilderConfig>,
    pub data_dir: &'a Path,
    pub downloads: &'a DownloadManager,
}

/// A dataset definition.
pub trait Dataset: Send + Sync {
    fn name(&self) -> &str;

    /// Canonical version when the dataset has no builder configs.
    fn version(&self) -> Option<Version> {
        None
    }

    /// Older versions that can still be read.
    fn supported_versions(&self) -> Vec<Version> {
        Vec::new()
    }

    fn builder_configs(&self) -> Vec<BuilderConfig> {
        Vec::new()
    }

    /// Set when some source files must be downloaded by hand.
    fn manual_download_instructions(&self) -> Option<String> {
        None
    }

    fn codec(&self) -> Arc<dyn ExampleCodec> {
        Arc::new(JsonCodec)
    }

    /// Static metadata: description, supervised keys, expected sizes and the
    /// splits the dataset intends to produce. Name, config and version are
    /// filled in by the builder.
    fn produce_info(&self, config: Option<&BuilderConfig>) -> DatasetInfo;

    /// One generator per split.
    fn build_splits(&self, ctx: &GenerationContext<'_>) -> Result<Vec<SplitGenerator>>;

    /// Base example stream of one split (or of `all`).
    fn read_split(&self, request: SplitRead<'_>) -> Result<Box<dyn SplitSource>> {
        Ok(Box::new(ShardSource::new(request)))
    }
}

/// Check a dataset's registered configs: non-empty unique names, each with
/// a version and a description.
pub fn validate_builder_configs(dataset: &str, configs: &[BuilderConfig]) -> Result<()> {
    let mut names: Vec<String> = configs.iter().map(|c| c.name.clone()).collect();
    names.sort();
    let before = names.len();
    names.dedup();
    if names.len() != before {
        return Err(DatasetError::DuplicateConfig {
            names: configs.iter().map(|c| c.name.clone()).collect(),
        });
    }
    for config in configs {
        if config.name.is_empty() {
            return Err(DatasetError::InvalidConfig(format!(
                "{dataset} has a builder config without a name"
            )));
        }
        if config.version.is_none() {
            return Err(DatasetError::InvalidConfig(format!(
                "builder config {} of {dataset} must declare a version",
                config.name
            )));
        }
        if config.description.as_deref().is_none_or(str::is_empty) {
            return Err(DatasetError::InvalidConfig(format!(
                "builder config {} of {dataset} must have a description",
                config.name
            )));
        }
    }
    Ok(())
}

/// Turn a config choice into the config to build, once.
///
/// With no choice, the first registered config is used (if any).
pub fn resolve_config(
    dataset: &dyn Dataset,
    choice: Option<ConfigChoice>,
) -> Result<Option<BuilderConfig>> {
    let configs = dataset.builder_configs();
    validate_builder_configs(dataset.name(), &configs)?;

    match choice {
        None => {
            let first = configs.into_iter().next();
            if let Some(config) = &first {
                tracing::info!(
                    dataset = dataset.name(),
                    config = %config.name,
                    "no config specified, defaulting to first"
                );
            }
            Ok(first)
        }
        Some(ConfigChoice::Named(name)) => {
            let available: Vec<String> = configs.iter().map(|c| c.name.clone()).collect();
            configs
                .into_iter()
                .find(|c| c.name == name)
                .map(Some)
                .ok_or(DatasetError::UnknownConfig { name, available })
        }
        Some(ConfigChoice::Custom(config)) => {
            if config.name.is_empty() {
                return Err(DatasetError::InvalidConfig(
                    "a custom builder config needs a name".to_string(),
                ));
            }
            if configs.iter().any(|c| c.name == config.name) {
                return Err(DatasetError::InvalidConfig(format!(
                    "custom config '{}' has the name of a registered config of {}; pass the name instead",
                    config.name,
                    dataset.name()
                )));
            }
            if config.version.is_none() {
                return Err(DatasetError::MissingVersion {
                    dataset: dataset.name().to_string(),
                });
            }
            if config.description.is_none() {
                tracing::warn!(
                    dataset = dataset.name(),
                    config = %config.name,
                    "custom builder config has no description"
                );
            }
            tracing::warn!(
                dataset = dataset.name(),
                config = %config.name,
                "using a custom builder config"
            );
            Ok(Some(config))
        }
    }
}

/// Canonical and supported versions of `dataset` under `config`.
pub fn version_set(dataset: &dyn Dataset, config: Option<&BuilderConfig>) -> Result<VersionSet> {
    let (canonical, supported) = match config.and_then(|c| c.version.clone().map(|v| (v, c))) {
        Some((version, config)) => (version, config.supported_versions.clone()),
        None => match dataset.version() {
            Some(version) => (version, dataset.supported_versions()),
            None => {
                return Err(DatasetError::MissingVersion {
                    dataset: dataset.name().to_string(),
                });
            }
        },
    };
    Ok(VersionSet::new(dataset.name(), canonical, supported))
}
