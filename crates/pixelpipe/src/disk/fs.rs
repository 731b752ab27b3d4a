use std::fs::File;
use std::io;
use std::path::Path;

use filetime::FileTime;
use tempfile::NamedTempFile;

/// The cleanup scan could potentially remove the parent directories we are operating in,
/// so the fs operations below are retried this many times.
const MAX_RETRIES: usize = 2;

pub(crate) fn catch_not_found<F, R>(f: F) -> io::Result<Option<R>>
where
    F: FnOnce() -> io::Result<R>,
{
    match f() {
        Ok(x) => Ok(Some(x)),
        Err(e) => match e.kind() {
            io::ErrorKind::NotFound => Ok(None),
            _ => Err(e),
        },
    }
}

/// Removes and recreates the temp directory.
///
/// Temp files of transfers that were running during a crash would otherwise stay
/// around forever.
pub(crate) fn clear_tmp(tmp_dir: &Path) -> io::Result<()> {
    if tmp_dir.exists() {
        std::fs::remove_dir_all(tmp_dir)?;
    }
    std::fs::create_dir_all(tmp_dir)
}

/// Creates a new temp file in `tmp_dir`, recreating the directory if needed.
pub(crate) fn tempfile_in(tmp_dir: &Path) -> io::Result<NamedTempFile> {
    let mut retries = 0;
    loop {
        retries += 1;

        if let Err(e) = std::fs::create_dir_all(tmp_dir) {
            tracing::error!(path = %tmp_dir.display(), "Failed to create temp directory: {:?}", e);
            if retries > MAX_RETRIES {
                return Err(e);
            }
            continue;
        }

        match tempfile::Builder::new().prefix("tmp").tempfile_in(tmp_dir) {
            Ok(temp_file) => return Ok(temp_file),
            Err(e) => {
                tracing::error!(path = %tmp_dir.display(), "Failed to create temp file: {:?}", e);
                if retries > MAX_RETRIES {
                    return Err(e);
                }
            }
        }
    }
}

/// Atomically moves a fully written temp file to its place in the cache.
pub(crate) fn persist_tempfile(mut temp_file: NamedTempFile, cache_path: &Path) -> io::Result<File> {
    let parent = cache_path
        .parent()
        .ok_or_else(|| io::Error::other("no parent directory to persist item"))?;

    let mut retries = 0;
    loop {
        retries += 1;

        if let Err(e) = std::fs::create_dir_all(parent) {
            tracing::error!(path = %parent.display(), "Failed to create cache directory: {:?}", e);
            if retries > MAX_RETRIES {
                return Err(e);
            }
            continue;
        }

        match temp_file.persist(cache_path) {
            Ok(file) => return Ok(file),
            Err(e) => {
                temp_file = e.file;
                let err = e.error;
                tracing::error!(path = %cache_path.display(), "Failed to persist cache file: {:?}", err);
                if retries > MAX_RETRIES {
                    return Err(err);
                }
            }
        }
    }
}

/// Marks `path` as just used. The scan evicts by modification time.
pub(crate) fn touch(path: &Path) -> io::Result<()> {
    filetime::set_file_mtime(path, FileTime::now())
}
