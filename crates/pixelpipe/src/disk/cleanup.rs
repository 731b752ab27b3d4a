use std::fs::{read_dir, remove_dir, remove_file};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use crate::metric;

use super::fs::catch_not_found;

/// Outcome of one scan.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupStats {
    pub removed_dirs: usize,
    pub removed_files: usize,
    pub removed_bytes: u64,

    pub retained_files: usize,
    pub retained_bytes: u64,
}

/// Retention of the disk cache.
#[derive(Debug, Clone, Copy)]
pub struct Retention {
    /// Maximum time since last access.
    pub ttl: Duration,
    /// Size budget in bytes.
    pub max_size: u64,
}

impl Retention {
    /// The size an over-budget scan shrinks the cache to, 80% of the budget.
    ///
    /// Shrinking below the budget keeps every following write from triggering a scan.
    pub fn low_watermark(&self) -> u64 {
        (self.max_size as u128 * 8 / 10) as u64
    }
}

struct CacheFile {
    path: PathBuf,
    size: u64,
    accessed: SystemTime,
}

/// Evicts files below `root` by TTL first, then least recently used until the cache
/// fits [`Retention::low_watermark`].
///
/// Last access is the file's modification time, which readers bump. Failures on single
/// files are logged and skipped, the scan itself only fails if `root` is unreadable.
pub fn scan(root: &Path, retention: Retention, now: SystemTime) -> io::Result<CleanupStats> {
    tracing::debug!("Scanning disk cache `{}`", root.display());

    let mut stats = CleanupStats::default();
    if catch_not_found(|| read_dir(root))?.is_none() {
        return Ok(stats);
    }

    let mut files = Vec::new();
    collect_recursive(root, retention.ttl, now, &mut files, &mut stats);

    let mut total: u64 = files.iter().map(|f| f.size).sum();
    let mut retained_files = files.len();
    if total > retention.max_size {
        let target = retention.low_watermark();
        files.sort_by_key(|f| f.accessed);
        for file in &files {
            if total <= target {
                break;
            }
            tracing::debug!("Evicting file `{}`", file.path.display());
            if let Err(e) = catch_not_found(|| remove_file(&file.path)) {
                tracing::error!(path = %file.path.display(), "Failed to evict cache file: {:?}", e);
                continue;
            }
            total -= file.size;
            retained_files -= 1;
            stats.removed_files += 1;
            stats.removed_bytes += file.size;
        }
    }

    stats.retained_files = retained_files;
    stats.retained_bytes = total;
    remove_empty_dirs(root, &mut stats);

    tracing::info!(
        "Retained {} files, totaling {} bytes",
        stats.retained_files,
        stats.retained_bytes,
    );
    tracing::info!(
        "Removed {} directories and {} files, totaling {} bytes",
        stats.removed_dirs,
        stats.removed_files,
        stats.removed_bytes
    );

    metric!(gauge("disk.size.files") = stats.retained_files as u64);
    metric!(gauge("disk.size.bytes") = stats.retained_bytes);
    metric!(counter("disk.size.files_removed") += stats.removed_files as i64);
    metric!(counter("disk.size.bytes_removed") += stats.removed_bytes as i64);

    Ok(stats)
}

/// Deletes every file below `root` along with the directories holding them.
pub fn clear(root: &Path) -> io::Result<()> {
    match catch_not_found(|| std::fs::remove_dir_all(root))? {
        Some(()) => tracing::info!("Cleared disk cache `{}`", root.display()),
        None => tracing::debug!("Disk cache `{}` already empty", root.display()),
    }
    Ok(())
}

/// Removes expired files and collects the others.
fn collect_recursive(
    directory: &Path,
    ttl: Duration,
    now: SystemTime,
    files: &mut Vec<CacheFile>,
    stats: &mut CleanupStats,
) {
    let entries = match read_dir(directory) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::error!(path = %directory.display(), "Failed to read cache directory: {:?}", e);
            return;
        }
    };

    for entry in entries {
        let path = match entry {
            Ok(entry) => entry.path(),
            Err(e) => {
                tracing::error!(path = %directory.display(), "Failed to read cache directory: {:?}", e);
                continue;
            }
        };
        if path.is_dir() {
            collect_recursive(&path, ttl, now, files, stats);
            continue;
        }

        if let Err(e) = check_file(path, ttl, now, files, stats) {
            tracing::error!("Failed to clean cache file: {:?}", e);
        }
    }
}

/// Deletes the file at `path` if it expired, remembers it otherwise.
fn check_file(
    path: PathBuf,
    ttl: Duration,
    now: SystemTime,
    files: &mut Vec<CacheFile>,
    stats: &mut CleanupStats,
) -> io::Result<()> {
    tracing::trace!("Checking file `{}`", path.display());
    let Some(metadata) = catch_not_found(|| path.metadata())? else {
        return Ok(());
    };
    let size = metadata.len();
    let accessed = metadata.modified()?;
    // files from the future count as fresh
    let idle = now.duration_since(accessed).unwrap_or_default();

    if idle > ttl {
        tracing::debug!("Removing expired file `{}`", path.display());
        catch_not_found(|| remove_file(&path))?;
        stats.removed_files += 1;
        stats.removed_bytes += size;
        return Ok(());
    }

    files.push(CacheFile {
        path,
        size,
        accessed,
    });
    Ok(())
}

/// Removes emptied directories below `directory`, returning whether it is empty itself.
fn remove_empty_dirs(directory: &Path, stats: &mut CleanupStats) -> bool {
    let Ok(entries) = read_dir(directory) else {
        return false;
    };

    let mut is_empty = true;
    for entry in entries {
        let Ok(entry) = entry else {
            is_empty = false;
            continue;
        };
        let path = entry.path();
        if !path.is_dir() || !remove_empty_dirs(&path, stats) {
            is_empty = false;
            continue;
        }

        tracing::debug!("Removing directory `{}`", path.display());
        match remove_dir(&path) {
            Ok(()) => stats.removed_dirs += 1,
            Err(e) => {
                tracing::error!(path = %path.display(), "Failed to clean cache directory: {:?}", e);
                is_empty = false;
            }
        }
    }
    is_empty
}
