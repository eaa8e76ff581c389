//! Error types for shardsmith.
//!
//! Uses `thiserror` for a single public error enum. Every failure category a
//! caller has to tell apart (version resolution, ambiguous locations,
//! pre-flight checks, inconsistent regeneration, ...) is its own variant so
//! it can be matched on rather than parsed out of a message.

use std::path::PathBuf;

/// Top-level error type for dataset resolution, generation and reading.
#[derive(Debug, thiserror::Error)]
pub enum DatasetError {
    #[error("Dataset {dataset} cannot be loaded at version {requested}, only: {}.", available.join(", "))]
    VersionResolution {
        dataset: String,
        requested: String,
        available: Vec<String>,
    },

    #[error("Invalid version '{input}': {reason}")]
    InvalidVersion { input: String, reason: String },

    #[error(
        "Dataset {dataset} does not have a defined version. Declare a version on the dataset or on each of its configs."
    )]
    MissingVersion { dataset: String },

    #[error(
        "Dataset was found in more than one directory: {}. Resolve the ambiguity by passing an explicit data directory.",
        format_paths(matches)
    )]
    AmbiguousLocation { matches: Vec<PathBuf> },

    #[error(
        "Trying to overwrite an existing dataset {dataset} at {}. A dataset with the same version {version} already exists. If the dataset has changed, update the version number.",
        path.display()
    )]
    AlreadyExists {
        dataset: String,
        version: String,
        path: PathBuf,
    },

    #[error(
        "The version of the dataset you are trying to use ({dataset}:{version}) can only be generated using code synced @ {marker} or earlier. Available for generation: {}",
        available.join(", ")
    )]
    VersionTooOld {
        dataset: String,
        version: String,
        marker: String,
        available: Vec<String>,
    },

    #[error(
        "The version of the dataset you are trying to use ({dataset}:{version}) is too old for this code, so it cannot be generated. Available for generation: {}",
        available.join(", ")
    )]
    VersionNotGeneratable {
        dataset: String,
        version: String,
        available: Vec<String>,
    },

    #[error("Not enough disk space. Needed: {needed} bytes (download: {download} bytes, generated: {generated} bytes), available: {available} bytes")]
    InsufficientSpace {
        needed: u64,
        download: u64,
        generated: u64,
        available: u64,
    },

    #[error("Duplicate key '{key}' found in split '{split}'. Keys must be unique within a split.")]
    DuplicateKey { split: String, key: String },

    #[error(
        "Split names for {dataset} changed without a version bump: persisted [{}], generated [{}]",
        persisted.join(", "),
        generated.join(", ")
    )]
    InconsistentSplits {
        dataset: String,
        persisted: Vec<String>,
        generated: Vec<String>,
    },

    #[error("Supervised (input, label) read requested but {dataset} does not declare supervised keys")]
    NotSupervised { dataset: String },

    #[error("Dataset {dataset}: could not find data in {}. Prepare the dataset before reading it.", root.display())]
    NotFound { dataset: String, root: PathBuf },

    #[error("BuilderConfig {name} not found. Available: [{}]", available.join(", "))]
    UnknownConfig { name: String, available: Vec<String> },

    #[error("Names of builder configs must not be duplicated. Got [{}]", names.join(", "))]
    DuplicateConfig { names: Vec<String> },

    #[error("Invalid builder config: {0}")]
    InvalidConfig(String),

    #[error("Dataset {name} is not registered. Available: [{}]", available.join(", "))]
    UnknownDataset { name: String, available: Vec<String> },

    #[error("Dataset {name} is already registered")]
    AlreadyRegistered { name: String },

    #[error("Invalid dataset spec '{input}': {reason}")]
    InvalidSpec { input: String, reason: String },

    #[error("'{name}' is a reserved split name and cannot be generated")]
    ReservedSplitName { name: String },

    #[error("Split '{name}' was added twice")]
    DuplicateSplit { name: String },

    #[error("Unknown split '{name}'. Available: [{}]", available.join(", "))]
    UnknownSplit { name: String, available: Vec<String> },

    #[error("Dataset {dataset} generates examples in parallel and needs an execution engine")]
    EngineRequired { dataset: String },

    #[error("Execution engine failure: {0}")]
    Engine(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Download error: {0}")]
    Download(String),

    #[error("Corrupt data at {}: {reason}", path.display())]
    Corrupt { path: PathBuf, reason: String },

    #[error("Settings error: {0}")]
    Settings(#[from] Box<figment::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DatasetError {
    pub fn codec(msg: impl Into<String>) -> Self {
        Self::Codec(msg.into())
    }

    pub fn engine(msg: impl Into<String>) -> Self {
        Self::Engine(msg.into())
    }

    pub fn download(msg: impl Into<String>) -> Self {
        Self::Download(msg.into())
    }

    pub fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_version(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidVersion {
            input: input.into(),
            reason: reason.into(),
        }
    }
}

fn format_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// A type alias for results using `DatasetError`.
pub type Result<T> = std::result::Result<T, DatasetError>;
