//! The public entry point of the pipeline.
//!
//! [`ImageLoader::load`] answers from the buffer pool right away when it can. Everything
//! else is handed to the coordinator task, which deduplicates concurrent loads of the
//! same `(uri, spec)` and walks them through the disk and network tiers.

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tempfile::TempDir;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::decode::Decoder;
use crate::disk::DiskCache;
use crate::download::{
    DownloadTimeouts, Downloader, HttpTransport, IdentityAdapter, Transport, UriAdapter,
};
use crate::error::LoadError;
use crate::metric;
use crate::pool::{BufferPool, TrimLevel};
use crate::request::{LoadedFrom, Target};
use crate::spec::{Spec, Specs};
use crate::stats::{Stats, StatsSnapshot};
use crate::utils::sequencer::Sequencer;

mod coordinator;

use coordinator::{Command, Coordinator};

/// Loads images into [`Target`]s through the memory, disk and network tiers.
///
/// Cheap to clone, all clones share the same pipeline.
#[derive(Clone)]
pub struct ImageLoader {
    inner: Arc<LoaderInner>,
}

struct LoaderInner {
    specs: Specs,
    pool: Arc<BufferPool>,
    disk: DiskCache,
    stats: Arc<Stats>,
    commands: mpsc::UnboundedSender<Command>,
    coordinator: Mutex<Option<JoinHandle<()>>>,
    is_shutdown: AtomicBool,
    // removed on drop, after the disk cache is done with it
    _temp_cache_dir: Option<TempDir>,
}

impl Drop for LoaderInner {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

impl fmt::Debug for ImageLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageLoader")
            .field("specs", &self.inner.specs)
            .field("cache_dir", &self.inner.disk.cache_dir())
            .field("is_shutdown", &self.inner.is_shutdown.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Assembles an [`ImageLoader`].
pub struct ImageLoaderBuilder {
    config: Config,
    specs: Vec<Spec>,
    transport: Option<Arc<dyn Transport>>,
    adapter: Arc<dyn UriAdapter>,
    runtime: Option<Handle>,
}

impl ImageLoaderBuilder {
    /// Registers a spec in addition to the ones of the config.
    pub fn spec(mut self, spec: Spec) -> Self {
        self.specs.push(spec);
        self
    }

    /// Replaces the HTTP transport.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn uri_adapter(mut self, adapter: impl UriAdapter) -> Self {
        self.adapter = Arc::new(adapter);
        self
    }

    /// The runtime to run workers on. Defaults to the current one.
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn build(self) -> Result<ImageLoader, LoadError> {
        let Self {
            config,
            specs: extra_specs,
            transport,
            adapter,
            runtime,
        } = self;

        let runtime = match runtime {
            Some(runtime) => runtime,
            None => Handle::try_current()
                .map_err(|_| LoadError::State("no tokio runtime to run the loader on".into()))?,
        };

        let mut specs = config.build_specs()?;
        for spec in extra_specs {
            specs.register(spec)?;
        }

        let (cache_dir, temp_cache_dir) = match &config.cache_dir {
            Some(cache_dir) => (cache_dir.clone(), None),
            None => {
                let dir = tempfile::Builder::new().prefix("pixelpipe").tempdir()?;
                (dir.path().to_owned(), Some(dir))
            }
        };

        let transport = match transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::new(DownloadTimeouts::from_config(
                &config.downloads,
            ))?),
        };

        let stats = Arc::new(Stats::default());
        let pool = Arc::new(BufferPool::new(config.pool.unbounded_grace, stats.clone()));
        let disk = DiskCache::open(
            &cache_dir,
            &config.disk_cache,
            Sequencer::new("disk", &runtime),
            stats.clone(),
        )?;
        let downloader = Downloader::new(
            transport,
            &config.downloads,
            disk.tmp_dir().to_owned(),
            Decoder,
            pool.clone(),
            stats.clone(),
            runtime.clone(),
        );

        let (commands, receiver) = mpsc::unbounded_channel();
        let coordinator = Coordinator::new(
            pool.clone(),
            disk.clone(),
            downloader,
            adapter,
            commands.clone(),
        );
        let handle = runtime.spawn(coordinator.run(receiver));

        tracing::info!(
            cache_dir = %cache_dir.display(),
            specs = specs.len(),
            "image loader started"
        );

        Ok(ImageLoader {
            inner: Arc::new(LoaderInner {
                specs,
                pool,
                disk,
                stats,
                commands,
                coordinator: Mutex::new(Some(handle)),
                is_shutdown: AtomicBool::new(false),
                _temp_cache_dir: temp_cache_dir,
            }),
        })
    }
}

impl ImageLoader {
    pub fn builder(config: Config) -> ImageLoaderBuilder {
        ImageLoaderBuilder {
            config,
            specs: Vec::new(),
            transport: None,
            adapter: Arc::new(IdentityAdapter),
            runtime: None,
        }
    }

    /// Looks up a registered spec.
    pub fn spec(&self, key: &str) -> Result<&Spec, LoadError> {
        self.inner.specs.get(key)
    }

    pub fn specs(&self) -> &Specs {
        &self.inner.specs
    }

    /// Loads the image `target` currently wants, in the spec it names.
    ///
    /// A buffer already in memory is delivered before this returns. Otherwise the
    /// target is notified later, from the coordinator. If `alt_spec_key` is given, a
    /// buffer or file of that spec is delivered first while the primary one loads.
    ///
    /// Never fails, problems are reported through [`Target::on_failed`].
    pub fn load(&self, target: Arc<dyn Target>, alt_spec_key: Option<&str>) {
        if let Err(e) = self.try_load(&target, alt_spec_key) {
            tracing::debug!(
                error = &e as &dyn std::error::Error,
                spec = %target.spec_key(),
                "load rejected"
            );
            target.on_failed();
        }
    }

    fn try_load(&self, target: &Arc<dyn Target>, alt_spec_key: Option<&str>) -> Result<(), LoadError> {
        self.ensure_running()?;

        let spec = self.inner.specs.get(&target.spec_key())?.clone();
        let mut alt_spec = alt_spec_key
            .map(|key| self.inner.specs.get(key).cloned())
            .transpose()?;
        let uri: Arc<str> = target
            .uri()
            .ok_or_else(|| LoadError::InvalidArgument("target has no uri".into()))?
            .into();

        if let Some(buffer) = self.inner.pool.get(&uri, &spec, alt_spec.as_ref()) {
            let exact = buffer.spec() == &spec;
            metric!(counter("loader.load") += 1, "source" => LoadedFrom::Memory.as_ref());
            target.on_loaded(buffer, LoadedFrom::Memory);
            if exact {
                return Ok(());
            }
            // the alt spec already showed up
            alt_spec = None;
        }

        metric!(counter("loader.load") += 1, "source" => "queued");
        self.send(Command::Load {
            target: target.clone(),
            uri,
            spec,
            alt_spec,
        })
    }

    /// Warms the disk cache with `uri` in the spec `spec_key`, without decoding it.
    ///
    /// Does nothing if the file is already cached or being loaded.
    pub fn prefetch(&self, uri: &str, spec_key: &str) -> Result<(), LoadError> {
        self.ensure_running()?;
        let spec = self.inner.specs.get(spec_key)?.clone();
        self.send(Command::Prefetch {
            uri: uri.into(),
            spec,
        })
    }

    /// Removes every cached file.
    pub fn clear_disk_cache(&self) {
        self.inner.disk.clear();
    }

    /// Reclaims idle buffers according to `level`.
    pub fn on_trim_memory(&self, level: TrimLevel) {
        self.inner.pool.on_trim_memory(level);
    }

    /// Reclaims every idle buffer.
    pub fn clear_memory(&self) {
        self.inner.pool.clear();
    }

    pub fn pool(&self) -> &BufferPool {
        &self.inner.pool
    }

    pub fn disk_cache(&self) -> &DiskCache {
        &self.inner.disk
    }

    /// The cache file of `uri` in the spec `spec_key`.
    pub fn cache_path(&self, uri: &str, spec_key: &str) -> Result<PathBuf, LoadError> {
        let spec = self.inner.specs.get(spec_key)?;
        Ok(self.inner.disk.cache_path(uri, spec))
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// A human readable summary of [`stats`](Self::stats), one line per tier.
    pub fn stats_report(&self) -> String {
        self.inner.stats.report()
    }

    /// Stops the coordinator and waits for it.
    ///
    /// Targets of loads still in flight are failed and the disk cache state is
    /// persisted. Loads issued afterwards fail right away.
    pub async fn shutdown(&self) {
        if self.inner.is_shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.inner.commands.send(Command::Shutdown);

        let handle = self.inner.coordinator.lock().unwrap().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!(error = &e as &dyn std::error::Error, "image loader crashed");
            }
        }
        self.inner.disk.flush().await;
    }

    fn ensure_running(&self) -> Result<(), LoadError> {
        match self.inner.is_shutdown.load(Ordering::Acquire) {
            true => Err(LoadError::State("image loader is shut down".into())),
            false => Ok(()),
        }
    }

    fn send(&self, command: Command) -> Result<(), LoadError> {
        self.inner
            .commands
            .send(command)
            .map_err(|_| LoadError::State("image loader is shut down".into()))
    }
}
