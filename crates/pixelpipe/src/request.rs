use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::buffer::PixelBuffer;
use crate::spec::Spec;

/// The tier that satisfied a load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoadedFrom {
    Memory,
    Disk,
    Network,
}

impl AsRef<str> for LoadedFrom {
    fn as_ref(&self) -> &str {
        match self {
            Self::Memory => "memory",
            Self::Disk => "disk",
            Self::Network => "network",
        }
    }
}

impl fmt::Display for LoadedFrom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_ref())
    }
}

/// A consumer waiting for one `(uri, spec)`.
///
/// The pipeline only keeps weak references to targets. A target that is dropped, or
/// whose [`uri`](Self::uri) changed to something else, no longer counts as waiting.
///
/// Callbacks are invoked from the loader's coordination task, except for the
/// synchronous memory hit which is delivered on the thread calling
/// [`ImageLoader::load`](crate::ImageLoader::load).
pub trait Target: Send + Sync {
    /// The uri this target currently wants, if any.
    fn uri(&self) -> Option<String>;

    /// The key of the spec this target wants.
    fn spec_key(&self) -> String;

    /// Download progress. `total` is `None` when the remote did not announce a length.
    fn on_downloading(&self, downloaded: u64, total: Option<u64>);

    fn on_loaded(&self, buffer: Arc<PixelBuffer>, source: LoadedFrom);

    fn on_failed(&self);
}

/// The deduplication key of an [`ImageRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
    pub uri: Arc<str>,
    pub spec: Spec,
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.uri, self.spec)
    }
}

/// The single in-flight unit of work for one `(uri, spec)`.
///
/// Owned by the coordinator, shared read-mostly with the disk and network workers so
/// they can check [`is_valid`](Self::is_valid) without a round trip.
pub struct ImageRequest {
    key: RequestKey,
    network_uri: String,
    cache_file: PathBuf,
    is_prefetch: AtomicBool,
    targets: Mutex<Vec<Weak<dyn Target>>>,
    download_started: AtomicBool,
}

impl ImageRequest {
    pub fn new(key: RequestKey, network_uri: String, cache_file: PathBuf) -> Arc<Self> {
        Arc::new(Self {
            key,
            network_uri,
            cache_file,
            is_prefetch: AtomicBool::new(false),
            targets: Mutex::new(Vec::new()),
            download_started: AtomicBool::new(false),
        })
    }

    pub fn key(&self) -> &RequestKey {
        &self.key
    }

    pub fn uri(&self) -> &Arc<str> {
        &self.key.uri
    }

    pub fn spec(&self) -> &Spec {
        &self.key.spec
    }

    /// The uri to fetch over the network, as rewritten by the uri adapter.
    pub fn network_uri(&self) -> &str {
        &self.network_uri
    }

    pub fn cache_file(&self) -> &Path {
        &self.cache_file
    }

    pub fn is_prefetch(&self) -> bool {
        self.is_prefetch.load(Ordering::Acquire)
    }

    pub(crate) fn set_prefetch(&self, value: bool) {
        self.is_prefetch.store(value, Ordering::Release);
    }

    pub fn download_started(&self) -> bool {
        self.download_started.load(Ordering::Acquire)
    }

    /// Claims the network transfer. Only the first caller gets `true`.
    pub(crate) fn try_start_download(&self) -> bool {
        self.download_started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Allows another transfer after the previous one ended without a usable file.
    pub(crate) fn reset_download(&self) {
        self.download_started.store(false, Ordering::Release);
    }

    /// Registers a target. Adding the same target twice is a no-op.
    pub(crate) fn add_target(&self, target: Weak<dyn Target>) {
        let mut targets = self.targets.lock().unwrap();
        if !targets.iter().any(|t| Weak::ptr_eq(t, &target)) {
            targets.push(target);
        }
    }

    /// The targets still waiting for this request, in registration order.
    ///
    /// Dead targets are pruned as a side effect.
    pub fn valid_targets(&self) -> Vec<Arc<dyn Target>> {
        let mut targets = self.targets.lock().unwrap();
        targets.retain(|t| t.strong_count() > 0);
        targets
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|t| t.uri().as_deref() == Some(&*self.key.uri))
            .collect()
    }

    /// A request is worth working on while it is a prefetch or someone still waits for it.
    pub fn is_valid(&self) -> bool {
        self.is_prefetch() || !self.valid_targets().is_empty()
    }
}

impl fmt::Debug for ImageRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageRequest")
            .field("key", &self.key)
            .field("cache_file", &self.cache_file)
            .field("is_prefetch", &self.is_prefetch())
            .field("download_started", &self.download_started())
            .finish_non_exhaustive()
    }
}
