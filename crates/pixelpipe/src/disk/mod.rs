//! The persistent tier: encoded image files at content-addressed paths.
//!
//! All file system work of the cache (lookups, decodes, scans and clears) runs on one
//! [`Sequencer`], so a scan never deletes a file while a lookup decodes it.
//!
//! Files live at `<cache_dir>/v1/aa/bbccdd/eeff..` (see [`CacheKey`]). Next to the
//! version directory are `tmp/`, holding downloads in progress, and `state.json`, the
//! [`CacheState`] that survives restarts.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use crate::buffer::PixelBuffer;
use crate::config::DiskCacheConfig;
use crate::decode::Decoder;
use crate::metric;
use crate::pool::BufferPool;
use crate::request::ImageRequest;
use crate::spec::Spec;
use crate::stats::{Stats, bump};
use crate::utils::sequencer::Sequencer;

mod cache_key;
pub mod cleanup;
pub(crate) mod fs;
mod state;

pub use cache_key::{CacheKey, CacheKeyBuilder};
pub use cleanup::{CleanupStats, Retention};
pub use state::CacheState;

/// Version of the on-disk layout. Bumping it orphans all existing files.
pub const CACHE_VERSION: u32 = 1;

/// The result of [`DiskCache::get_async`].
#[derive(Debug, Default)]
pub struct DiskLookup {
    /// The decoded buffer. Its spec is the alt spec if only the alt file existed.
    pub buffer: Option<Arc<PixelBuffer>>,
    /// The request became invalid before the decode started.
    pub canceled: bool,
}

/// Maps `(uri, spec)` to cache files and answers lookups off the calling thread.
#[derive(Debug, Clone)]
pub struct DiskCache {
    inner: Arc<DiskCacheInner>,
}

#[derive(Debug)]
struct DiskCacheInner {
    cache_dir: PathBuf,
    tmp_dir: PathBuf,
    state_path: PathBuf,
    retention: Retention,
    scan_interval: Duration,
    sequencer: Sequencer,
    state: Mutex<CacheState>,
    scan_queued: AtomicBool,
    stats: Arc<Stats>,
}

impl DiskCache {
    /// Opens the cache in `cache_dir`, creating it if needed.
    ///
    /// Leftover temp files of a previous process are removed and the persisted
    /// [`CacheState`] is loaded.
    pub fn open(
        cache_dir: &Path,
        config: &DiskCacheConfig,
        sequencer: Sequencer,
        stats: Arc<Stats>,
    ) -> io::Result<Self> {
        let tmp_dir = cache_dir.join("tmp");
        let state_path = cache_dir.join("state.json");

        std::fs::create_dir_all(cache_dir.join(format!("v{CACHE_VERSION}")))?;
        fs::clear_tmp(&tmp_dir)?;

        let state = CacheState::load(&state_path);
        stats
            .disk_size
            .store(state.total_size, Ordering::Relaxed);
        tracing::debug!(
            cache_dir = %cache_dir.display(),
            total_size = state.total_size,
            "opened disk cache"
        );

        Ok(Self {
            inner: Arc::new(DiskCacheInner {
                cache_dir: cache_dir.to_owned(),
                tmp_dir,
                state_path,
                retention: Retention {
                    ttl: config.ttl,
                    max_size: config.max_size,
                },
                scan_interval: config.scan_interval,
                sequencer,
                state: Mutex::new(state),
                scan_queued: AtomicBool::new(false),
                stats,
            }),
        })
    }

    pub fn cache_dir(&self) -> &Path {
        &self.inner.cache_dir
    }

    /// The directory downloads are written to before they are persisted.
    pub fn tmp_dir(&self) -> &Path {
        &self.inner.tmp_dir
    }

    /// The file holding `uri` encoded for `spec`. Stable across restarts.
    pub fn cache_path(&self, uri: &str, spec: &Spec) -> PathBuf {
        let key = CacheKey::for_image(uri, spec);
        self.inner.cache_dir.join(key.cache_path(CACHE_VERSION))
    }

    /// The persisted counters, as of now.
    pub fn state(&self) -> CacheState {
        *self.inner.state.lock().unwrap()
    }

    /// Looks up the request's file, falling back to the file of `alt_spec`, and decodes
    /// whichever exists first.
    ///
    /// Runs on the disk sequencer. `callback` is invoked exactly once, from that
    /// sequencer, unless the cache is shutting down. A request that became invalid
    /// before the decode started is reported as canceled. An undecodable file counts as
    /// a miss.
    pub fn get_async<F>(
        &self,
        request: Arc<ImageRequest>,
        alt_spec: Option<Spec>,
        decoder: Decoder,
        pool: Arc<BufferPool>,
        callback: F,
    ) where
        F: FnOnce(DiskLookup) + Send + 'static,
    {
        let cache = self.clone();
        self.inner.sequencer.submit(move || {
            let lookup = cache.lookup(&request, alt_spec, decoder, &pool);
            callback(lookup);
        });
    }

    /// Reports whether `path` is a cached file, from the disk sequencer.
    pub fn contains_async<F>(&self, path: PathBuf, callback: F)
    where
        F: FnOnce(bool) + Send + 'static,
    {
        self.inner.sequencer.submit(move || callback(path.is_file()));
    }

    fn lookup(
        &self,
        request: &ImageRequest,
        alt_spec: Option<Spec>,
        decoder: Decoder,
        pool: &BufferPool,
    ) -> DiskLookup {
        let primary = request.cache_file();
        let found = if primary.is_file() {
            Some((primary.to_owned(), request.spec().clone()))
        } else {
            alt_spec.and_then(|alt| {
                let path = self.cache_path(request.uri(), &alt);
                path.is_file().then_some((path, alt))
            })
        };

        let Some((path, spec)) = found else {
            self.record_miss();
            return DiskLookup::default();
        };

        if !request.is_valid() {
            tracing::trace!(request = %request.key(), "skipping decode of abandoned request");
            return DiskLookup {
                buffer: None,
                canceled: true,
            };
        }

        match decoder.decode(pool, request.uri(), &path, &spec) {
            Ok(buffer) => {
                if let Err(e) = fs::touch(&path) {
                    tracing::warn!(path = %path.display(), "Failed to touch cache file: {:?}", e);
                }
                bump(&self.inner.stats.disk_hit);
                metric!(counter("disk.hit") += 1, "spec" => spec.key());
                DiskLookup {
                    buffer: Some(buffer),
                    canceled: false,
                }
            }
            Err(e) => {
                tracing::warn!(
                    error = &e as &dyn std::error::Error,
                    uri = %request.uri(),
                    path = %path.display(),
                    "Failed to decode cached image"
                );
                self.record_miss();
                DiskLookup::default()
            }
        }
    }

    fn record_miss(&self) {
        bump(&self.inner.stats.disk_miss);
        metric!(counter("disk.miss") += 1);
    }

    /// Accounts for a new file of `size` bytes, triggering a scan when one is due.
    ///
    /// A scan is due if the cache was never scanned, the scan interval elapsed, or the
    /// running total exceeds the budget. At most one scan is queued at a time.
    pub fn image_added(&self, size: u64) {
        let inner = &self.inner;
        let due = {
            let mut state = inner.state.lock().unwrap();
            state.total_size += size;
            inner.stats.disk_size.store(state.total_size, Ordering::Relaxed);
            state.needs_scan(inner.retention.max_size, inner.scan_interval, SystemTime::now())
        };

        if due && !inner.scan_queued.swap(true, Ordering::AcqRel) {
            let cache = self.clone();
            inner.sequencer.submit(move || cache.run_scan());
        }
    }

    fn run_scan(&self) {
        let inner = &self.inner;
        let root = inner.cache_dir.join(format!("v{CACHE_VERSION}"));
        let now = SystemTime::now();

        match cleanup::scan(&root, inner.retention, now) {
            Ok(stats) => {
                bump(&inner.stats.disk_scans);
                metric!(counter("disk.scan") += 1);
                let mut state = inner.state.lock().unwrap();
                state.last_scan = Some(now);
                state.total_size = stats.retained_bytes;
                inner.stats.disk_size.store(state.total_size, Ordering::Relaxed);
                self.save_state(&state);
            }
            Err(e) => {
                tracing::error!(
                    error = &e as &dyn std::error::Error,
                    path = %root.display(),
                    "Failed to scan disk cache"
                );
            }
        }
        inner.scan_queued.store(false, Ordering::Release);
    }

    /// Deletes all cached files and resets the running total, off the calling thread.
    pub fn clear(&self) {
        let cache = self.clone();
        self.inner.sequencer.submit(move || {
            let inner = &cache.inner;
            let root = inner.cache_dir.join(format!("v{CACHE_VERSION}"));
            if let Err(e) = cleanup::clear(&root).and_then(|_| std::fs::create_dir_all(&root)) {
                tracing::error!(
                    error = &e as &dyn std::error::Error,
                    path = %root.display(),
                    "Failed to clear disk cache"
                );
            }
            let mut state = inner.state.lock().unwrap();
            state.total_size = 0;
            inner.stats.disk_size.store(0, Ordering::Relaxed);
            cache.save_state(&state);
        });
    }

    /// Writes the current counters to disk, off the calling thread.
    pub fn persist_state(&self) {
        let cache = self.clone();
        self.inner.sequencer.submit(move || {
            let state = cache.state();
            cache.save_state(&state);
        });
    }

    fn save_state(&self, state: &CacheState) {
        if let Err(e) = state.save(&self.inner.state_path) {
            tracing::error!(
                error = &e as &dyn std::error::Error,
                path = %self.inner.state_path.display(),
                "Failed to persist disk cache state"
            );
        }
    }

    /// Resolves once every job queued on the disk sequencer so far has finished.
    pub async fn flush(&self) {
        let (tx, rx) = tokio::sync::oneshot::channel();
        if self.inner.sequencer.submit(move || {
            let _ = tx.send(());
        }) {
            let _ = rx.await;
        }
    }
}

#[cfg(test)]
mod tests;
