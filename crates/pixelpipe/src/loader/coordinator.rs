//! The coordination sequence.
//!
//! A single task owns the map of in-flight requests. Every mutation of that map and
//! every fan-out to targets happens here, in the order commands were posted, so one
//! `(uri, spec)` never sees two concurrent state changes. Disk and network workers report
//! back by posting commands.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::buffer::PixelBuffer;
use crate::decode::Decoder;
use crate::disk::{DiskCache, DiskLookup};
use crate::download::{Downloaded, Downloader, Lane, UriAdapter};
use crate::error::LoadError;
use crate::pool::BufferPool;
use crate::request::{ImageRequest, LoadedFrom, RequestKey, Target};
use crate::spec::Spec;

/// How often a disk lookup is repeated because a target attached while it was canceled.
const MAX_DISK_RETRIES: u32 = 3;

pub(super) enum Command {
    Load {
        target: Arc<dyn Target>,
        uri: Arc<str>,
        spec: Spec,
        alt_spec: Option<Spec>,
    },
    Prefetch {
        uri: Arc<str>,
        spec: Spec,
    },
    PrefetchChecked {
        uri: Arc<str>,
        spec: Spec,
        cached: bool,
    },
    DiskDone {
        request: Arc<ImageRequest>,
        lookup: DiskLookup,
    },
    DownloadDone {
        request: Arc<ImageRequest>,
        result: Result<Downloaded, LoadError>,
    },
    Progress {
        request: Arc<ImageRequest>,
        downloaded: u64,
        total: Option<u64>,
    },
    Shutdown,
}

struct InFlight {
    request: Arc<ImageRequest>,
    alt_spec: Option<Spec>,
    disk_retries: u32,
}

pub(super) struct Coordinator {
    inflight: HashMap<RequestKey, InFlight>,
    pool: Arc<BufferPool>,
    disk: DiskCache,
    downloader: Downloader,
    decoder: Decoder,
    adapter: Arc<dyn UriAdapter>,
    commands: mpsc::UnboundedSender<Command>,
}

impl Coordinator {
    pub(super) fn new(
        pool: Arc<BufferPool>,
        disk: DiskCache,
        downloader: Downloader,
        adapter: Arc<dyn UriAdapter>,
        commands: mpsc::UnboundedSender<Command>,
    ) -> Self {
        Self {
            inflight: HashMap::new(),
            pool,
            disk,
            downloader,
            decoder: Decoder,
            adapter,
            commands,
        }
    }

    pub(super) async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = commands.recv().await {
            match command {
                Command::Load {
                    target,
                    uri,
                    spec,
                    alt_spec,
                } => self.handle_load(target, uri, spec, alt_spec),
                Command::Prefetch { uri, spec } => self.handle_prefetch(uri, spec),
                Command::PrefetchChecked { uri, spec, cached } => {
                    self.handle_prefetch_checked(uri, spec, cached)
                }
                Command::DiskDone { request, lookup } => self.handle_disk_done(request, lookup),
                Command::DownloadDone { request, result } => {
                    self.handle_download_done(request, result)
                }
                Command::Progress {
                    request,
                    downloaded,
                    total,
                } => {
                    for target in request.valid_targets() {
                        notify(&request, || target.on_downloading(downloaded, total));
                    }
                }
                Command::Shutdown => break,
            }
        }

        let abandoned = self.inflight.len();
        for (_, entry) in self.inflight.drain() {
            fail_targets(&entry.request);
        }
        self.disk.persist_state();
        tracing::debug!(abandoned, "image loader stopped");
    }

    fn handle_load(
        &mut self,
        target: Arc<dyn Target>,
        uri: Arc<str>,
        spec: Spec,
        alt_spec: Option<Spec>,
    ) {
        let key = RequestKey { uri, spec };

        if let Some(entry) = self.inflight.get(&key) {
            let request = entry.request.clone();
            request.add_target(Arc::downgrade(&target));
            tracing::trace!(request = %key, "joined in-flight request");

            // a queued prefetch could sit behind other prefetches, move it to the
            // foreground lane
            if request.is_prefetch() && !request.download_started() {
                tracing::debug!(request = %key, "promoting prefetch");
                request.set_prefetch(false);
                self.start_download(request, Lane::Foreground);
            }
            return;
        }

        let request = self.new_request(key.clone());
        request.add_target(Arc::downgrade(&target));
        self.inflight.insert(
            key,
            InFlight {
                request: request.clone(),
                alt_spec: alt_spec.clone(),
                disk_retries: 0,
            },
        );
        self.lookup_disk(request, alt_spec);
    }

    /// Checks for the cache file on the disk sequencer, the prefetch continues in
    /// [`handle_prefetch_checked`](Self::handle_prefetch_checked).
    fn handle_prefetch(&mut self, uri: Arc<str>, spec: Spec) {
        let key = RequestKey { uri, spec };
        if self.inflight.contains_key(&key) {
            return;
        }

        let commands = self.commands.clone();
        let path = self.disk.cache_path(&key.uri, &key.spec);
        self.disk.contains_async(path, move |cached| {
            let _ = commands.send(Command::PrefetchChecked {
                uri: key.uri,
                spec: key.spec,
                cached,
            });
        });
    }

    fn handle_prefetch_checked(&mut self, uri: Arc<str>, spec: Spec, cached: bool) {
        let key = RequestKey { uri, spec };
        if cached {
            tracing::trace!(request = %key, "prefetch already cached");
            return;
        }
        // a load or another prefetch got there first
        if self.inflight.contains_key(&key) {
            return;
        }

        let request = self.new_request(key.clone());
        tracing::debug!(request = %key, "prefetching");
        request.set_prefetch(true);
        self.inflight.insert(
            key,
            InFlight {
                request: request.clone(),
                alt_spec: None,
                disk_retries: 0,
            },
        );
        self.start_download(request, Lane::Prefetch);
    }

    fn handle_disk_done(&mut self, request: Arc<ImageRequest>, lookup: DiskLookup) {
        if !self.is_registered(&request) {
            return;
        }

        if let Some(buffer) = &lookup.buffer {
            self.pool.set(buffer.clone());
        }

        if lookup.canceled {
            self.retry_disk_lookup(request);
            return;
        }

        if !request.is_valid() {
            self.remove(&request);
            return;
        }

        if let Some(buffer) = lookup.buffer {
            let is_primary = buffer.spec() == request.spec();
            fan_out(&request, &buffer, LoadedFrom::Disk);
            if is_primary {
                self.remove(&request);
                return;
            }
        }

        // nothing transfers this request right now
        request.reset_download();
        let lane = match request.is_prefetch() {
            true => Lane::Prefetch,
            false => Lane::Foreground,
        };
        self.start_download(request, lane);
    }

    fn handle_download_done(
        &mut self,
        request: Arc<ImageRequest>,
        result: Result<Downloaded, LoadError>,
    ) {
        if !self.is_registered(&request) {
            return;
        }

        match result {
            Ok(downloaded) => {
                self.disk.image_added(downloaded.size);
                match downloaded.decoded {
                    Some(Ok(buffer)) => {
                        self.pool.set(buffer.clone());
                        fan_out(&request, &buffer, LoadedFrom::Network);
                        self.remove(&request);
                    }
                    Some(Err(e)) => {
                        tracing::warn!(
                            error = &e as &dyn std::error::Error,
                            request = %request.key(),
                            "Failed to decode downloaded image"
                        );
                        fail_targets(&request);
                        self.remove(&request);
                    }
                    // targets attached to a running prefetch, serve them from disk
                    None if !request.valid_targets().is_empty() => {
                        request.set_prefetch(false);
                        self.lookup_disk(request, None);
                    }
                    None => self.remove(&request),
                }
            }
            Err(LoadError::Canceled) => self.retry_disk_lookup(request),
            Err(e) => {
                tracing::debug!(
                    error = &e as &dyn std::error::Error,
                    request = %request.key(),
                    "load failed"
                );
                fail_targets(&request);
                self.remove(&request);
            }
        }
    }

    fn new_request(&self, key: RequestKey) -> Arc<ImageRequest> {
        let network_uri = self.adapter.convert(&key.uri, &key.spec);
        let cache_file = self.disk.cache_path(&key.uri, &key.spec);
        ImageRequest::new(key, network_uri, cache_file)
    }

    /// Whether `request` is still the one registered for its key.
    fn is_registered(&self, request: &Arc<ImageRequest>) -> bool {
        self.inflight
            .get(request.key())
            .is_some_and(|entry| Arc::ptr_eq(&entry.request, request))
    }

    /// Looks up the disk again when a target attached after the request was canceled,
    /// otherwise drops the request.
    ///
    /// Targets still waiting once the retries are used up are failed.
    fn retry_disk_lookup(&mut self, request: Arc<ImageRequest>) {
        if !request.is_valid() {
            self.remove(&request);
            return;
        }

        let retry = match self.inflight.get_mut(request.key()) {
            Some(entry) if entry.disk_retries < MAX_DISK_RETRIES => {
                entry.disk_retries += 1;
                Some(entry.alt_spec.clone())
            }
            _ => None,
        };

        match retry {
            Some(alt_spec) => {
                tracing::trace!(request = %request.key(), "retrying disk lookup");
                self.lookup_disk(request, alt_spec);
            }
            None => {
                tracing::debug!(
                    request = %request.key(),
                    retries = MAX_DISK_RETRIES,
                    "giving up on canceled request"
                );
                fail_targets(&request);
                self.remove(&request);
            }
        }
    }

    fn remove(&mut self, request: &ImageRequest) {
        self.inflight.remove(request.key());
    }

    fn lookup_disk(&self, request: Arc<ImageRequest>, alt_spec: Option<Spec>) {
        let commands = self.commands.clone();
        let done = request.clone();
        self.disk.get_async(
            request,
            alt_spec,
            self.decoder,
            self.pool.clone(),
            move |lookup| {
                let _ = commands.send(Command::DiskDone {
                    request: done,
                    lookup,
                });
            },
        );
    }

    fn start_download(&self, request: Arc<ImageRequest>, lane: Lane) {
        let progress = {
            let commands = self.commands.clone();
            let request = request.clone();
            move |downloaded, total| {
                let _ = commands.send(Command::Progress {
                    request: request.clone(),
                    downloaded,
                    total,
                });
            }
        };
        let done = {
            let commands = self.commands.clone();
            let request = request.clone();
            move |result| {
                let _ = commands.send(Command::DownloadDone { request, result });
            }
        };
        self.downloader.download_async(request, lane, progress, done);
    }
}

fn fan_out(request: &ImageRequest, buffer: &Arc<PixelBuffer>, source: LoadedFrom) {
    for target in request.valid_targets() {
        notify(request, || target.on_loaded(buffer.clone(), source));
    }
}

fn fail_targets(request: &ImageRequest) {
    for target in request.valid_targets() {
        notify(request, || target.on_failed());
    }
}

/// Runs a target callback. A panicking target is logged and skipped, the coordinator
/// keeps serving every other request.
fn notify<F: FnOnce()>(request: &ImageRequest, callback: F) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(callback)) {
        tracing::error!(
            request = %request.key(),
            panic = panic_message(&*payload),
            "Target callback panicked"
        );
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}
