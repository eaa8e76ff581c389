//! Download boundary.
//!
//! Fetching, extraction and checksum verification live behind the
//! [`Fetcher`] trait. [`DownloadManager`] owns the directory layout and
//! tallies how many bytes were fetched, which ends up in the dataset
//! metadata.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use sha2::{Digest, Sha256};

use crate::error::{DatasetError, Result};

/// Retrieves one resource into `download_dir` and returns its local path.
pub trait Fetcher: Send + Sync {
    fn fetch(&self, resource: &str, download_dir: &Path, force: bool) -> Result<PathBuf>;
}

/// Fetcher for resources already on the local filesystem (`file://` or
/// plain paths). Files are copied into the download directory under a name
/// derived from the resource, and reused unless `force` is set.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFetcher;

impl Fetcher for LocalFetcher {
    fn fetch(&self, resource: &str, download_dir: &Path, force: bool) -> Result<PathBuf> {
        let source = PathBuf::from(resource.strip_prefix("file://").unwrap_or(resource));
        if !source.is_file() {
            return Err(DatasetError::download(format!(
                "resource {resource} is not a local file"
            )));
        }
        let file_name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "resource".to_string());
        let digest = Sha256::digest(resource.as_bytes());
        let target = download_dir.join(format!("{digest:x}_{file_name}"));
        if target.exists() && !force {
            tracing::debug!(resource, "reusing cached download");
            return Ok(target);
        }
        fs::create_dir_all(download_dir)?;
        fs::copy(&source, &target)?;
        Ok(target)
    }
}

/// Directory layout and bookkeeping handed to split generators.
pub struct DownloadManager {
    dataset: String,
    download_dir: PathBuf,
    extract_dir: PathBuf,
    manual_dir: Option<PathBuf>,
    manual_instructions: Option<String>,
    force: bool,
    fetcher: Arc<dyn Fetcher>,
    downloaded: AtomicU64,
}

impl DownloadManager {
    pub fn new(dataset: impl Into<String>, download_dir: PathBuf, fetcher: Arc<dyn Fetcher>) -> Self {
        let extract_dir = download_dir.join("extracted");
        Self {
            dataset: dataset.into(),
            download_dir,
            extract_dir,
            manual_dir: None,
            manual_instructions: None,
            force: false,
            fetcher,
            downloaded: AtomicU64::new(0),
        }
    }

    pub fn with_extract_dir(mut self, dir: PathBuf) -> Self {
        self.extract_dir = dir;
        self
    }

    pub fn with_manual_dir(mut self, dir: PathBuf, instructions: Option<String>) -> Self {
        self.manual_dir = Some(dir);
        self.manual_instructions = instructions;
        self
    }

    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    pub fn extract_dir(&self) -> &Path {
        &self.extract_dir
    }

    /// Fetch one resource, counting its size toward the download total.
    pub fn download(&self, resource: &str) -> Result<PathBuf> {
        let path = self.fetcher.fetch(resource, &self.download_dir, self.force)?;
        let size = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        self.downloaded.fetch_add(size, Ordering::Relaxed);
        tracing::debug!(dataset = %self.dataset, resource, size, "fetched resource");
        Ok(path)
    }

    pub fn download_all(&self, resources: &[&str]) -> Result<Vec<PathBuf>> {
        resources.iter().map(|r| self.download(r)).collect()
    }

    /// Directory holding manually downloaded files; it must exist.
    pub fn manual_dir(&self) -> Result<&Path> {
        let instructions = self.manual_instructions.as_deref().unwrap_or("");
        match &self.manual_dir {
            Some(dir) if dir.is_dir() => Ok(dir),
            Some(dir) => Err(DatasetError::download(format!(
                "manual directory {} does not exist. {instructions}",
                dir.display()
            ))),
            None => Err(DatasetError::download(format!(
                "dataset {} does not use manual downloads",
                self.dataset
            ))),
        }
    }

    pub fn downloaded_size(&self) -> u64 {
        self.downloaded.load(Ordering::Relaxed)
    }
}
