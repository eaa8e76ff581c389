//! # Shardsmith Core
//!
//! Versioned, immutable datasets on local disk.
//! Resolves which version of a dataset to use and where it lives, builds it
//! atomically into sharded record files, and composes read pipelines over
//! the committed shards.

pub mod builder;
pub mod catalog;
pub mod config;
pub mod dataset;
pub mod disk;
pub mod download;
pub mod engine;
pub mod error;
pub mod example;
pub mod location;
pub mod persistence;
pub mod reader;
pub mod records;
pub mod registry;
pub mod shuffle;
pub mod statistics;
pub mod transaction;
pub mod version;
pub mod writer;

// Re-export commonly used types at the crate root.
pub use builder::{BuilderOptions, DatasetBuilder};
pub use catalog::{ALL_SPLITS, DatasetInfo, METADATA_FILE, SplitCatalog, SplitInfo};
pub use config::{
    ComputeStatsMode, DownloadConfig, GenerateMode, ReadConfig, Settings, load_settings,
};
pub use dataset::{
    BuilderConfig, ConfigChoice, Dataset, ExampleSource, GenerationContext, SplitGenerator,
};
pub use disk::{SpaceProbe, StatvfsProbe};
pub use download::{DownloadManager, Fetcher, LocalFetcher};
pub use engine::{ExecutionEngine, ExecutionHandle, PartitionedSource, ThreadPoolEngine};
pub use error::{DatasetError, Result};
pub use example::{Example, ExampleCodec, ExampleKey, Feature, JsonCodec};
pub use location::{DatasetIdentity, Location, LocationResolver};
pub use reader::{BatchSize, Element, ReadOptions, ReadOutput, SplitDataset, SplitSelector};
pub use registry::{DatasetRegistry, DatasetSpec};
pub use transaction::{BuildTransaction, sweep_staging_dirs};
pub use version::{EXPERIMENTAL_LATEST, Version, VersionSet};
pub use writer::{ConcurrentSplitWriter, SplitWriter};
