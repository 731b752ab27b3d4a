//! The network tier.
//!
//! Downloads run on two lanes with separate concurrency limits, so prefetching never
//! competes with loads somebody is waiting for. Bodies are streamed into a temp file
//! through recycled copy buffers and atomically moved into the disk cache once complete.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::runtime::Handle;
use tokio::sync::Semaphore;

use crate::buffer::PixelBuffer;
use crate::config::DownloadConfig;
use crate::decode::Decoder;
use crate::disk::fs::{persist_tempfile, tempfile_in};
use crate::error::{DecodeError, LoadError};
use crate::metric;
use crate::pool::BufferPool;
use crate::request::ImageRequest;
use crate::stats::{Stats, bump};

mod http;
mod transport;

pub use http::{DownloadTimeouts, HttpTransport, create_client};
pub use transport::{IdentityAdapter, Response, Transport, UriAdapter};

/// The worker lane a download is submitted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lane {
    /// Loads with at least one waiting target.
    Foreground,
    /// Cache warming without a target.
    Prefetch,
}

impl AsRef<str> for Lane {
    fn as_ref(&self) -> &str {
        match self {
            Self::Foreground => "foreground",
            Self::Prefetch => "prefetch",
        }
    }
}

/// A finished transfer.
#[derive(Debug)]
pub struct Downloaded {
    /// Size of the persisted file in bytes.
    pub size: u64,
    /// The decoded image, if somebody was waiting for it when the transfer finished.
    pub decoded: Option<Result<Arc<PixelBuffer>, DecodeError>>,
}

/// Fetches images into the disk cache.
#[derive(Clone)]
pub struct Downloader {
    inner: Arc<DownloaderInner>,
}

struct DownloaderInner {
    transport: Arc<dyn Transport>,
    foreground: Semaphore,
    prefetch: Semaphore,
    scratch: Arc<ScratchPool>,
    tmp_dir: PathBuf,
    decoder: Decoder,
    pool: Arc<BufferPool>,
    stats: Arc<Stats>,
    runtime: Handle,
}

impl fmt::Debug for Downloader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Downloader")
            .field("tmp_dir", &self.inner.tmp_dir)
            .field("foreground_permits", &self.inner.foreground.available_permits())
            .field("prefetch_permits", &self.inner.prefetch.available_permits())
            .finish_non_exhaustive()
    }
}

impl Downloader {
    pub fn new(
        transport: Arc<dyn Transport>,
        config: &DownloadConfig,
        tmp_dir: PathBuf,
        decoder: Decoder,
        pool: Arc<BufferPool>,
        stats: Arc<Stats>,
        runtime: Handle,
    ) -> Self {
        Self {
            inner: Arc::new(DownloaderInner {
                transport,
                foreground: Semaphore::new(config.foreground_threads.max(1)),
                prefetch: Semaphore::new(config.prefetch_threads.max(1)),
                scratch: Arc::new(ScratchPool::new(config.chunk_size, config.scratch_buffers)),
                tmp_dir,
                decoder,
                pool,
                stats,
                runtime,
            }),
        }
    }

    /// Queues a download of `request` on `lane`.
    ///
    /// A request may be submitted several times, for example as a prefetch and then again
    /// once somebody waits for it. Only the first submission to get a worker transfers
    /// anything, the others return without invoking `callback`.
    ///
    /// `progress` is called after every chunk with the bytes written so far and the
    /// announced length.
    pub fn download_async<P, F>(&self, request: Arc<ImageRequest>, lane: Lane, progress: P, callback: F)
    where
        P: Fn(u64, Option<u64>) + Send + 'static,
        F: FnOnce(Result<Downloaded, LoadError>) + Send + 'static,
    {
        let inner = self.inner.clone();
        self.inner.runtime.spawn(async move {
            let semaphore = match lane {
                Lane::Foreground => &inner.foreground,
                Lane::Prefetch => &inner.prefetch,
            };
            let Ok(_permit) = semaphore.acquire().await else {
                return;
            };
            if !request.try_start_download() {
                tracing::trace!(request = %request.key(), lane = lane.as_ref(), "download already started");
                return;
            }

            tracing::debug!(request = %request.key(), lane = lane.as_ref(), "downloading");
            let result = inner.download(&request, progress).await;
            match &result {
                Ok(downloaded) => {
                    bump(&inner.stats.network_success);
                    metric!(counter("download.success") += 1, "lane" => lane.as_ref());
                    metric!(time_raw("download.size") = downloaded.size);
                }
                Err(LoadError::Canceled) => {
                    bump(&inner.stats.network_canceled);
                    metric!(counter("download.canceled") += 1, "lane" => lane.as_ref());
                }
                Err(e) => {
                    tracing::warn!(
                        error = e as &dyn std::error::Error,
                        uri = %request.network_uri(),
                        "Failed to download image"
                    );
                    bump(&inner.stats.network_failure);
                    metric!(counter("download.failure") += 1, "lane" => lane.as_ref());
                }
            }
            callback(result);
        });
    }
}

impl DownloaderInner {
    async fn download<P>(&self, request: &Arc<ImageRequest>, progress: P) -> Result<Downloaded, LoadError>
    where
        P: Fn(u64, Option<u64>) + Send,
    {
        let response = self.transport.execute(request.network_uri()).await?;
        if !response.is_success() {
            return Err(LoadError::Transport(format!(
                "{} {}",
                response.status, response.message
            )));
        }

        let total = response.content_length;
        let mut body = response.body;
        let temp_file = tempfile_in(&self.tmp_dir)?;
        let mut file = tokio::fs::File::from_std(temp_file.as_file().try_clone()?);
        let mut scratch = self.scratch.take();
        let mut written = 0u64;

        loop {
            let n = body
                .read(&mut scratch)
                .await
                .map_err(|e| LoadError::Transport(e.to_string()))?;
            if n == 0 {
                break;
            }
            file.write_all(&scratch[..n]).await?;
            written += n as u64;
            progress(written, total);

            if !request.is_valid() && is_cancelable(written, total) {
                tracing::debug!(request = %request.key(), written, ?total, "abandoning download");
                // dropping the temp file deletes it
                return Err(LoadError::Canceled);
            }
        }
        drop(scratch);
        file.flush().await?;
        drop(file);

        let request = request.clone();
        let decoder = self.decoder;
        let pool = self.pool.clone();
        let finish = move || -> Result<Downloaded, LoadError> {
            persist_tempfile(temp_file, request.cache_file())?;

            let decoded = (!request.is_prefetch() && request.is_valid()).then(|| {
                decoder.decode(&pool, request.uri(), request.cache_file(), request.spec())
            });
            Ok(Downloaded {
                size: written,
                decoded,
            })
        };
        self.runtime
            .spawn_blocking(finish)
            .await
            .map_err(LoadError::from_std_error)?
    }
}

/// Whether an abandoned transfer that wrote `written` bytes so far should stop.
///
/// Transfers past half of their announced length complete anyway. Without a length
/// there is no way to tell, so they always stop. [`create_client`] does not ask for
/// compressed bodies, which would lose the length.
pub fn is_cancelable(written: u64, total: Option<u64>) -> bool {
    match total {
        Some(total) => written.saturating_mul(2) < total,
        None => true,
    }
}

/// Recycled copy buffers for the download loop.
#[derive(Debug)]
struct ScratchPool {
    buffers: Mutex<Vec<Vec<u8>>>,
    chunk_size: usize,
    capacity: usize,
}

impl ScratchPool {
    fn new(chunk_size: usize, capacity: usize) -> Self {
        Self {
            buffers: Mutex::new(Vec::with_capacity(capacity)),
            chunk_size: chunk_size.max(1),
            capacity,
        }
    }

    fn take(self: &Arc<Self>) -> Scratch {
        let buffer = self.buffers.lock().unwrap().pop();
        Scratch {
            buffer: buffer.unwrap_or_else(|| vec![0; self.chunk_size]),
            pool: self.clone(),
        }
    }
}

/// A copy buffer, going back to its pool when dropped.
struct Scratch {
    buffer: Vec<u8>,
    pool: Arc<ScratchPool>,
}

impl Deref for Scratch {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buffer
    }
}

impl DerefMut for Scratch {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        let mut buffers = self.pool.buffers.lock().unwrap();
        if buffers.len() < self.pool.capacity {
            buffers.push(std::mem::take(&mut self.buffer));
        }
    }
}
