//! Free-space accounting before a build.

use std::path::{Path, PathBuf};

use crate::error::{DatasetError, Result};

/// Reports free bytes on the filesystem holding a path.
pub trait SpaceProbe: Send + Sync {
    /// `None` when the amount cannot be determined.
    fn available_bytes(&self, path: &Path) -> Option<u64>;
}

/// Probe backed by `statvfs(3)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatvfsProbe;

impl SpaceProbe for StatvfsProbe {
    fn available_bytes(&self, path: &Path) -> Option<u64> {
        let existing = nearest_existing(path)?;
        statvfs_available(&existing)
    }
}

/// The target directory usually does not exist yet; walk up to one that does.
fn nearest_existing(path: &Path) -> Option<PathBuf> {
    path.ancestors().find(|p| p.exists()).map(Path::to_path_buf)
}

#[cfg(unix)]
fn statvfs_available(path: &Path) -> Option<u64> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes()).ok()?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return None;
    }
    #[allow(clippy::unnecessary_cast)]
    Some(stat.f_bavail as u64 * stat.f_frsize as u64)
}

#[cfg(not(unix))]
fn statvfs_available(path: &Path) -> Option<u64> {
    let _ = path;
    None
}

/// Fail unless `download + generated` bytes fit under `dir`.
///
/// An unknown amount of free space passes.
pub fn ensure_space(probe: &dyn SpaceProbe, dir: &Path, download: u64, generated: u64) -> Result<()> {
    let needed = download.saturating_add(generated);
    let Some(available) = probe.available_bytes(dir) else {
        tracing::debug!(dir = %dir.display(), "free space unknown, skipping check");
        return Ok(());
    };
    if needed > available {
        return Err(DatasetError::InsufficientSpace {
            needed,
            download,
            generated,
            available,
        });
    }
    Ok(())
}
