//! Dataset builder: resolve, prepare, read.
//!
//! A [`DatasetBuilder`] binds one [`Dataset`] to a config, a resolved
//! version and an on-disk location. `download_and_prepare` runs the
//! pre-flight checks and generates every split inside a
//! [`BuildTransaction`]; `as_dataset` composes read pipelines over the
//! committed shards.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;

use crate::catalog::{DatasetInfo, SplitCatalog, SplitInfo, is_complete_version_dir};
use crate::config::{ComputeStatsMode, DownloadConfig, GenerateMode, Settings};
use crate::dataset::{
    BuilderConfig, ConfigChoice, Dataset, ExampleSource, GenerationContext, SplitGenerator,
    resolve_config, version_set,
};
use crate::disk::{SpaceProbe, StatvfsProbe, ensure_space};
use crate::download::{DownloadManager, Fetcher, LocalFetcher};
use crate::engine::{ExecutionPlan, SplitStage};
use crate::error::{DatasetError, Result};
use crate::location::{DatasetIdentity, Location, LocationResolver};
use crate::reader::{ReadComposer, ReadOptions, ReadOutput, SplitSelector};
use crate::statistics::compute_split_statistics;
use crate::transaction::BuildTransaction;
use crate::version::{Version, VersionSet};
use crate::writer::{ConcurrentSplitWriter, SplitOutcome, SplitWriter};

/// How to construct a builder.
#[derive(Debug, Clone, Default)]
pub struct BuilderOptions {
    pub config: Option<ConfigChoice>,
    /// Version request: `X.Y.Z`, a pattern such as `1.*`, or
    /// `experimental_latest`. Canonical when unset.
    pub version: Option<String>,
    /// Only root to read from and write to, overriding the settings.
    pub data_dir: Option<PathBuf>,
    pub settings: Settings,
}

pub struct DatasetBuilder {
    dataset: Arc<dyn Dataset>,
    config: Option<BuilderConfig>,
    versions: VersionSet,
    identity: DatasetIdentity,
    location: Location,
    settings: Settings,
    info: DatasetInfo,
    fetcher: Arc<dyn Fetcher>,
    space_probe: Arc<dyn SpaceProbe>,
}

impl DatasetBuilder {
    pub fn new(dataset: Arc<dyn Dataset>, options: BuilderOptions) -> Result<Self> {
        let config = resolve_config(dataset.as_ref(), options.config)?;
        let versions = version_set(dataset.as_ref(), config.as_ref())?;
        let version = versions.resolve(options.version.as_deref())?;
        let identity = DatasetIdentity::new(
            dataset.name(),
            config.as_ref().map(|c| c.name.clone()),
            version,
        );

        let location = LocationResolver::from_settings(&options.settings)
            .locate(&identity, options.data_dir.as_deref())?;

        let info = if location.exists {
            tracing::info!(
                dataset = %identity.name,
                path = %location.path.display(),
                "loading metadata of prepared dataset"
            );
            DatasetInfo::read_from_directory(&location.path)?
        } else {
            declared_info(dataset.as_ref(), config.as_ref(), &identity)
        };

        Ok(Self {
            dataset,
            config,
            versions,
            identity,
            location,
            settings: options.settings,
            info,
            fetcher: Arc::new(LocalFetcher),
            space_probe: Arc::new(StatvfsProbe),
        })
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    pub fn with_space_probe(mut self, probe: Arc<dyn SpaceProbe>) -> Self {
        self.space_probe = probe;
        self
    }

    pub fn name(&self) -> &str {
        self.dataset.name()
    }

    pub fn version(&self) -> &Version {
        &self.identity.version
    }

    pub fn versions(&self) -> &VersionSet {
        &self.versions
    }

    pub fn config(&self) -> Option<&BuilderConfig> {
        self.config.as_ref()
    }

    pub fn identity(&self) -> &DatasetIdentity {
        &self.identity
    }

    pub fn info(&self) -> &DatasetInfo {
        &self.info
    }

    /// Version directory, whether or not it has been prepared yet.
    pub fn data_dir(&self) -> &Path {
        &self.location.path
    }

    pub fn data_root(&self) -> &Path {
        &self.location.root
    }

    pub fn is_prepared(&self) -> bool {
        is_complete_version_dir(&self.location.path)
    }

    /// Generate the dataset unless it is already there.
    pub fn download_and_prepare(&mut self, download: &DownloadConfig) -> Result<()> {
        let final_path = self.location.path.clone();
        let exists = final_path.exists();
        if exists && download.mode == GenerateMode::ReuseDatasetIfExists {
            tracing::info!(
                dataset = %self.info.full_name(),
                path = %final_path.display(),
                "reusing dataset"
            );
            return Ok(());
        }

        self.check_generatable()?;
        if exists {
            return Err(DatasetError::AlreadyExists {
                dataset: self.identity.name.clone(),
                version: self.identity.version.to_string(),
                path: final_path,
            });
        }
        ensure_space(
            self.space_probe.as_ref(),
            &self.location.root,
            self.info.download_size,
            self.info.dataset_size(),
        )?;

        let downloads = self.download_manager(download);
        tracing::info!(
            dataset = %self.info.full_name(),
            path = %final_path.display(),
            "generating dataset"
        );

        let transaction = BuildTransaction::new(
            self.info.full_name(),
            self.identity.version.to_string(),
            final_path,
        );
        let info = transaction.run(|staging| self.prepare_into(staging, &downloads, download))?;

        self.info = info;
        self.location.exists = true;
        Ok(())
    }

    /// Compose read pipelines over the prepared data.
    ///
    /// `split: None` returns every split keyed by name.
    pub fn as_dataset(&self, split: Option<SplitSelector>, options: &ReadOptions) -> Result<ReadOutput> {
        if !self.is_prepared() {
            return Err(DatasetError::NotFound {
                dataset: self.dataset.name().to_string(),
                root: self.location.root.clone(),
            });
        }
        tracing::info!(
            dataset = %self.info.full_name(),
            split = ?split,
            path = %self.location.path.display(),
            "constructing dataset reader"
        );
        ReadComposer::new(
            self.dataset.as_ref(),
            &self.info,
            &self.location.path,
            &self.settings.reader,
        )
        .compose(split, options)
    }

    /// A version may be generated only if it carries no prepare marker and
    /// is either the canonical or the highest known version.
    fn check_generatable(&self) -> Result<()> {
        let version = &self.identity.version;
        let resolved = self
            .versions
            .candidates()
            .find(|v| *v == version)
            .unwrap_or(version);
        if let Some(marker) = resolved.prepare_marker() {
            return Err(DatasetError::VersionTooOld {
                dataset: self.identity.name.clone(),
                version: version.to_string(),
                marker: marker.to_string(),
                available: self
                    .versions
                    .candidates()
                    .filter(|v| v.prepare_marker().is_none())
                    .map(Version::to_string)
                    .collect(),
            });
        }
        let generatable = self.versions.generatable();
        if !generatable.contains(version) {
            return Err(DatasetError::VersionNotGeneratable {
                dataset: self.info.full_name(),
                version: version.to_string(),
                available: generatable.iter().map(Version::to_string).collect(),
            });
        }
        Ok(())
    }

    fn download_manager(&self, download: &DownloadConfig) -> DownloadManager {
        let download_dir = download
            .download_dir
            .clone()
            .unwrap_or_else(|| self.location.root.join("downloads"));
        let mut manager = DownloadManager::new(
            self.dataset.name(),
            download_dir.clone(),
            Arc::clone(&self.fetcher),
        )
        .with_force(download.mode == GenerateMode::ForceRedownload);
        if let Some(extract_dir) = &download.extract_dir {
            manager = manager.with_extract_dir(extract_dir.clone());
        }
        if let Some(instructions) = self.dataset.manual_download_instructions() {
            let manual_dir = download
                .manual_dir
                .clone()
                .unwrap_or_else(|| download_dir.join("manual"));
            manager = manager.with_manual_dir(manual_dir, Some(instructions));
        }
        manager
    }

    /// Generate every split into `staging` and write the metadata there.
    fn prepare_into(
        &self,
        staging: &Path,
        downloads: &DownloadManager,
        download: &DownloadConfig,
    ) -> Result<DatasetInfo> {
        let ctx = GenerationContext {
            identity: &self.identity,
            config: self.config.as_ref(),
            data_dir: staging,
            downloads,
        };
        let generators = self.dataset.build_splits(&ctx)?;

        // Reject `all` and duplicates before anything is written.
        let mut declared = SplitCatalog::new();
        for generator in &generators {
            declared.add(generator.info.clone())?;
        }

        let outcomes = self.write_splits(staging, generators, download)?;

        let mut catalog = SplitCatalog::new();
        for (mut info, outcome) in outcomes {
            info.shard_lengths = outcome.shard_lengths;
            info.num_bytes = outcome.num_bytes;
            catalog.add(info)?;
        }

        self.compute_statistics(&mut catalog, staging, download.compute_stats)?;

        let mut info = self.info.clone();
        info.splits.reconcile(&self.info.full_name(), catalog)?;
        let downloaded = downloads.downloaded_size();
        if downloaded > 0 {
            info.download_size = downloaded;
        }
        info.created_at = Some(Utc::now());
        info.write_to_directory(staging)?;
        Ok(info)
    }

    /// Sequential splits are written one after another; partitioned splits
    /// are submitted together as one plan. Outcomes come back in generator
    /// order, and only once every split has been finalized.
    fn write_splits(
        &self,
        staging: &Path,
        generators: Vec<SplitGenerator>,
        download: &DownloadConfig,
    ) -> Result<Vec<(SplitInfo, SplitOutcome)>> {
        let name = self.dataset.name();
        let codec = self.dataset.codec();
        let writer_settings = &self.settings.writer;

        let mut outcomes: Vec<Option<SplitOutcome>> = Vec::with_capacity(generators.len());
        let mut infos = Vec::with_capacity(generators.len());
        let mut plan = ExecutionPlan::default();
        let mut parallel = Vec::new();

        for (index, generator) in generators.into_iter().enumerate() {
            let split = generator.info.name.clone();
            infos.push(generator.info);
            match generator.source {
                ExampleSource::Sequential(examples) => {
                    tracing::info!(dataset = name, split = %split, "generating split");
                    let writer = SplitWriter::new(name, &split, staging, writer_settings);
                    let outcome = match download.max_examples_per_split {
                        Some(cap) => {
                            tracing::warn!(
                                split = %split,
                                cap,
                                "splits capped at max_examples_per_split"
                            );
                            writer.write_all(examples.take(cap), codec.as_ref())?
                        }
                        None => writer.write_all(examples, codec.as_ref())?,
                    };
                    outcomes.push(Some(outcome));
                }
                ExampleSource::Partitioned(source) => {
                    let sink = Arc::new(ConcurrentSplitWriter::new(SplitWriter::new(
                        name,
                        &split,
                        staging,
                        writer_settings,
                    )));
                    parallel.push((index, Arc::clone(&sink)));
                    plan.stages.push(SplitStage {
                        split,
                        source,
                        codec: Arc::clone(&codec),
                        sink,
                    });
                    outcomes.push(None);
                }
            }
        }

        if !plan.stages.is_empty() {
            let engine = download
                .engine
                .as_ref()
                .ok_or_else(|| DatasetError::EngineRequired {
                    dataset: name.to_string(),
                })?;
            tracing::info!(
                dataset = name,
                engine = engine.name(),
                splits = plan.stages.len(),
                "running parallel generation"
            );
            engine.submit(plan)?.wait()?;
            for (index, sink) in parallel {
                outcomes[index] = Some(sink.finalize()?);
            }
        }

        infos
            .into_iter()
            .zip(outcomes)
            .map(|(info, outcome)| {
                let outcome = outcome.ok_or_else(|| {
                    DatasetError::engine(format!("split '{}' was never finalized", info.name))
                })?;
                Ok((info, outcome))
            })
            .collect()
    }

    fn compute_statistics(
        &self,
        catalog: &mut SplitCatalog,
        staging: &Path,
        mode: ComputeStatsMode,
    ) -> Result<()> {
        let already = catalog.iter().next().is_some_and(|s| s.statistics.is_some());
        let compute = match mode {
            ComputeStatsMode::Skip => false,
            ComputeStatsMode::Auto => !already,
            ComputeStatsMode::Force => true,
        };
        if !compute {
            tracing::info!(mode = ?mode, "skipping statistics");
            return Ok(());
        }
        tracing::info!("computing statistics");
        let codec = self.dataset.codec();
        for name in catalog.names() {
            let Some(split) = catalog.get_mut(&name) else {
                continue;
            };
            let stats =
                compute_split_statistics(self.dataset.name(), split, staging, codec.as_ref())?;
            split.statistics = Some(stats);
        }
        Ok(())
    }
}

/// Metadata a dataset declares before anything is generated.
fn declared_info(
    dataset: &dyn Dataset,
    config: Option<&BuilderConfig>,
    identity: &DatasetIdentity,
) -> DatasetInfo {
    let mut info = dataset.produce_info(config);
    info.name = identity.name.clone();
    info.config = identity.config.clone();
    info.version = identity.version.clone();
    if info.description.is_empty() {
        if let Some(description) = config.and_then(|c| c.description.clone()) {
            info.description = description;
        }
    }
    info
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::example::{ExampleKey, Feature, example};
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    struct Numbers {
        versions: (Version, Vec<Version>),
    }

    impl Dataset for Numbers {
        fn name(&self) -> &str {
            "numbers"
        }

        fn version(&self) -> Option<Version> {
            Some(self.versions.0.clone())
        }

        fn supported_versions(&self) -> Vec<Version> {
            self.versions.1.clone()
        }

        fn produce_info(&self, _config: Option<&BuilderConfig>) -> DatasetInfo {
            DatasetInfo::new("numbers", Version::new(0, 0, 0))
                .with_description("integers and their squares")
                .with_supervised_keys("x", "y")
        }

        fn build_splits(&self, _ctx: &GenerationContext<'_>) -> Result<Vec<SplitGenerator>> {
            let rows = |range: std::ops::Range<i64>| {
                range
                    .map(|k| {
                        Ok((
                            ExampleKey::Int(k),
                            example([("x", Feature::Int(k)), ("y", Feature::Int(k * k))]),
                        ))
                    })
                    .collect::<Vec<_>>()
            };
            Ok(vec![
                SplitGenerator::sequential(SplitInfo::new("train"), rows(0..6)),
                SplitGenerator::sequential(SplitInfo::new("test"), rows(6..8)),
            ])
        }
    }

    fn builder(root: &Path, version: Option<&str>, versions: (Version, Vec<Version>)) -> Result<DatasetBuilder> {
        DatasetBuilder::new(
            Arc::new(Numbers { versions }),
            BuilderOptions {
                version: version.map(str::to_string),
                data_dir: Some(root.to_path_buf()),
                ..BuilderOptions::default()
            },
        )
    }

    fn plain() -> (Version, Vec<Version>) {
        (Version::new(1, 0, 0), vec![Version::new(0, 9, 0)])
    }

    #[test]
    fn test_prepare_then_reuse() {
        let root = TempDir::new().unwrap();
        let mut b = builder(root.path(), None, plain()).unwrap();
        assert!(!b.is_prepared());
        b.download_and_prepare(&DownloadConfig::default()).unwrap();
        assert!(b.is_prepared());
        assert_eq!(b.info().splits.names(), vec!["train".to_string(), "test".to_string()]);
        assert!(b.info().created_at.is_some());
        assert_eq!(
            b.info().splits.get("train").unwrap().statistics.as_ref().unwrap().num_examples,
            6
        );

        // Default mode reuses without error.
        b.download_and_prepare(&DownloadConfig::default()).unwrap();

        let again = builder(root.path(), None, plain()).unwrap();
        assert!(again.is_prepared());
        assert_eq!(again.info(), b.info());

        let regenerate = DownloadConfig {
            mode: GenerateMode::ReuseCacheIfExists,
            ..DownloadConfig::default()
        };
        let mut third = builder(root.path(), None, plain()).unwrap();
        assert!(matches!(
            third.download_and_prepare(&regenerate),
            Err(DatasetError::AlreadyExists { .. })
        ));
    }

    #[test]
    fn test_supported_version_is_not_generatable() {
        let root = TempDir::new().unwrap();
        let mut b = builder(root.path(), Some("0.9.0"), plain()).unwrap();
        match b.download_and_prepare(&DownloadConfig::default()) {
            Err(DatasetError::VersionNotGeneratable { available, .. }) => {
                assert_eq!(available, vec!["1.0.0".to_string()]);
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(!b.data_dir().exists());
    }

    #[test]
    fn test_marked_version_is_too_old() {
        let root = TempDir::new().unwrap();
        let versions = (
            Version::new(2, 0, 0).with_prepare_marker("v1.3"),
            vec![Version::new(1, 0, 0)],
        );
        let mut b = builder(root.path(), None, versions).unwrap();
        match b.download_and_prepare(&DownloadConfig::default()) {
            Err(DatasetError::VersionTooOld { marker, available, .. }) => {
                assert_eq!(marker, "v1.3");
                assert_eq!(available, vec!["1.0.0".to_string()]);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_insufficient_space_is_fatal_before_staging() {
        struct Full;
        impl SpaceProbe for Full {
            fn available_bytes(&self, _path: &Path) -> Option<u64> {
                Some(0)
            }
        }

        let root = TempDir::new().unwrap();
        let mut b = builder(root.path(), None, plain())
            .unwrap()
            .with_space_probe(Arc::new(Full));
        b.info.download_size = 10;
        assert!(matches!(
            b.download_and_prepare(&DownloadConfig::default()),
            Err(DatasetError::InsufficientSpace { .. })
        ));
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_max_examples_per_split_caps_sequential_splits() {
        let root = TempDir::new().unwrap();
        let mut b = builder(root.path(), None, plain()).unwrap();
        b.download_and_prepare(&DownloadConfig {
            max_examples_per_split: Some(1),
            compute_stats: ComputeStatsMode::Skip,
            ..DownloadConfig::default()
        })
        .unwrap();
        assert_eq!(b.info().splits.total_num_examples(), 2);
        assert!(b.info().splits.get("train").unwrap().statistics.is_none());
    }
}
