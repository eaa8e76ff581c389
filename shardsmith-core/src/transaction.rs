//! Stage-then-promote build transactions.
//!
//! A build writes into a sibling staging directory named
//! `<version>.incomplete.<uuid>` and renames it onto the version directory
//! only when every step succeeded. Staging names never parse as versions, so
//! location resolution cannot see a build in progress. A failed or
//! panicking build removes its staging directory before the error reaches
//! the caller.

use std::fs;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::error::{DatasetError, Result};

const STAGING_INFIX: &str = ".incomplete.";

/// Fresh staging path next to `final_path`.
pub fn staging_path(final_path: &Path) -> PathBuf {
    let name = final_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    final_path.with_file_name(format!(
        "{name}{STAGING_INFIX}{}",
        uuid::Uuid::new_v4().simple()
    ))
}

/// Whether `path` names a staging directory.
pub fn is_staging_path(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.contains(STAGING_INFIX))
}

/// Atomic build of one dataset version directory.
#[derive(Debug, Clone)]
pub struct BuildTransaction {
    dataset: String,
    version: String,
    final_path: PathBuf,
}

impl BuildTransaction {
    pub fn new(dataset: impl Into<String>, version: impl Into<String>, final_path: PathBuf) -> Self {
        Self {
            dataset: dataset.into(),
            version: version.into(),
            final_path,
        }
    }

    pub fn final_path(&self) -> &Path {
        &self.final_path
    }

    fn already_exists(&self) -> DatasetError {
        DatasetError::AlreadyExists {
            dataset: self.dataset.clone(),
            version: self.version.clone(),
            path: self.final_path.clone(),
        }
    }

    /// Run `body` against a staging directory and promote it on success.
    ///
    /// `final_path` must not exist beforehand; published versions are
    /// immutable.
    pub fn run<T, F>(&self, body: F) -> Result<T>
    where
        F: FnOnce(&Path) -> Result<T>,
    {
        if self.final_path.exists() {
            return Err(self.already_exists());
        }
        if let Some(parent) = self.final_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let staging = StagingDir::create(staging_path(&self.final_path))?;
        tracing::debug!(staging = %staging.path.display(), "opened build transaction");

        let value = body(&staging.path)?;

        if self.final_path.exists() {
            // Another build of the same version won the race.
            return Err(self.already_exists());
        }
        fs::rename(&staging.path, &self.final_path).map_err(|e| {
            if self.final_path.exists() {
                self.already_exists()
            } else {
                DatasetError::Io(e)
            }
        })?;
        staging.disarm();

        tracing::info!(
            dataset = %self.dataset,
            version = %self.version,
            path = %self.final_path.display(),
            "published dataset version"
        );
        Ok(value)
    }
}

/// Removes the staging directory unless disarmed after promotion.
struct StagingDir {
    path: PathBuf,
    armed: bool,
}

impl StagingDir {
    fn create(path: PathBuf) -> Result<Self> {
        fs::create_dir(&path)?;
        Ok(Self { path, armed: true })
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for StagingDir {
    fn drop(&mut self) {
        if self.armed && self.path.exists() {
            if let Err(e) = fs::remove_dir_all(&self.path) {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "failed to remove staging directory"
                );
            }
        }
    }
}

/// Remove staging directories left under `root` by crashed or losing
/// builds. Returns what was removed.
pub fn sweep_staging_dirs(root: &Path) -> Result<Vec<PathBuf>> {
    let mut removed = Vec::new();
    if !root.is_dir() {
        return Ok(removed);
    }
    let mut walker = WalkDir::new(root).min_depth(1).into_iter();
    while let Some(entry) = walker.next() {
        let entry = entry.map_err(|e| {
            DatasetError::Io(
                e.into_io_error()
                    .unwrap_or_else(|| std::io::Error::other("filesystem loop")),
            )
        })?;
        if entry.file_type().is_dir() && is_staging_path(entry.path()) {
            walker.skip_current_dir();
            fs::remove_dir_all(entry.path())?;
            tracing::info!(path = %entry.path().display(), "removed orphaned staging directory");
            removed.push(entry.path().to_path_buf());
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_success_promotes_staging() {
        let root = TempDir::new().unwrap();
        let final_path = root.path().join("d").join("1.0.0");
        let tx = BuildTransaction::new("d", "1.0.0", final_path.clone());

        let seen = tx
            .run(|staging| {
                assert_ne!(staging, final_path.as_path());
                assert!(!final_path.exists());
                fs::write(staging.join("payload"), b"data")?;
                Ok(staging.to_path_buf())
            })
            .unwrap();

        assert!(!seen.exists());
        assert_eq!(fs::read(final_path.join("payload")).unwrap(), b"data");
        assert_eq!(entries(&root.path().join("d")), vec!["1.0.0".to_string()]);
    }

    #[test]
    fn test_failure_leaves_nothing() {
        let root = TempDir::new().unwrap();
        let final_path = root.path().join("d").join("1.0.0");
        let tx = BuildTransaction::new("d", "1.0.0", final_path.clone());

        let err = tx
            .run(|staging| -> Result<()> {
                fs::write(staging.join("half"), b"x")?;
                Err(DatasetError::download("connection reset"))
            })
            .unwrap_err();

        assert!(matches!(err, DatasetError::Download(_)));
        assert!(!final_path.exists());
        assert!(entries(&root.path().join("d")).is_empty());
    }

    #[test]
    fn test_panic_in_body_removes_staging() {
        let root = TempDir::new().unwrap();
        let final_path = root.path().join("d").join("1.0.0");
        let tx = BuildTransaction::new("d", "1.0.0", final_path.clone());

        let outcome = std::panic::catch_unwind(|| {
            let _ = tx.run(|_staging| -> Result<()> { panic!("generator bug") });
        });
        assert!(outcome.is_err());
        assert!(!final_path.exists());
        assert!(entries(&root.path().join("d")).is_empty());
    }

    #[test]
    fn test_existing_version_is_rejected() {
        let root = TempDir::new().unwrap();
        let final_path = root.path().join("d").join("1.0.0");
        fs::create_dir_all(&final_path).unwrap();
        let tx = BuildTransaction::new("d", "1.0.0", final_path.clone());

        let mut ran = false;
        let err = tx
            .run(|_| {
                ran = true;
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(err, DatasetError::AlreadyExists { .. }));
        assert!(!ran);
    }

    #[test]
    fn test_sweep_removes_only_staging_dirs() {
        let root = TempDir::new().unwrap();
        let keep = root.path().join("d").join("1.0.0");
        let orphan = staging_path(&root.path().join("d").join("2.0.0"));
        fs::create_dir_all(&keep).unwrap();
        fs::create_dir_all(orphan.join("nested")).unwrap();

        let removed = sweep_staging_dirs(root.path()).unwrap();
        assert_eq!(removed, vec![orphan.clone()]);
        assert!(keep.exists());
        assert!(!orphan.exists());
        assert!(sweep_staging_dirs(&root.path().join("missing")).unwrap().is_empty());
    }

    #[test]
    fn test_staging_names_are_not_versions() {
        let staged = staging_path(Path::new("/data/d/1.0.0"));
        assert!(is_staging_path(&staged));
        let name = staged.file_name().unwrap().to_str().unwrap();
        assert!(name.parse::<crate::version::Version>().is_err());
    }
}
