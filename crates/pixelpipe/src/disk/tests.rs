use std::sync::Arc;

use tempfile::TempDir;
use tokio::runtime::Handle;
use tokio::sync::oneshot;

use crate::request::{RequestKey, Target};
use crate::test::{self, RecordingTarget, small_spec, thumb_spec};

use super::*;

const URI: &str = "http://x/img.jpg";

struct Harness {
    dir: TempDir,
    stats: Arc<Stats>,
    pool: Arc<BufferPool>,
    cache: DiskCache,
}

impl Harness {
    fn new(config: DiskCacheConfig) -> Self {
        test::setup();
        let dir = test::tempdir();
        let stats = Arc::new(Stats::default());
        let cache = Self::open(&dir, &config, &stats);
        Self {
            pool: Arc::new(BufferPool::new(2, stats.clone())),
            dir,
            stats,
            cache,
        }
    }

    fn open(dir: &TempDir, config: &DiskCacheConfig, stats: &Arc<Stats>) -> DiskCache {
        let sequencer = Sequencer::new("disk", &Handle::current());
        DiskCache::open(dir.path(), config, sequencer, stats.clone()).unwrap()
    }

    fn store(&self, spec: &Spec, bytes: &[u8]) -> PathBuf {
        let path = self.cache.cache_path(URI, spec);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, bytes).unwrap();
        path
    }

    fn request(&self, target: &Arc<dyn Target>) -> Arc<ImageRequest> {
        let spec = thumb_spec();
        let key = RequestKey {
            uri: URI.into(),
            spec: spec.clone(),
        };
        let request = ImageRequest::new(key, URI.into(), self.cache.cache_path(URI, &spec));
        request.add_target(Arc::downgrade(target));
        request
    }

    async fn lookup(&self, request: Arc<ImageRequest>, alt_spec: Option<Spec>) -> DiskLookup {
        let (tx, rx) = oneshot::channel();
        self.cache
            .get_async(request, alt_spec, Decoder, self.pool.clone(), move |lookup| {
                let _ = tx.send(lookup);
            });
        rx.await.unwrap()
    }
}

fn target() -> Arc<dyn Target> {
    RecordingTarget::new(URI, "A")
}

#[tokio::test]
async fn test_cache_path_is_stable_and_inside_cache_dir() {
    let harness = Harness::new(DiskCacheConfig::default());
    let path = harness.cache.cache_path(URI, &thumb_spec());

    assert!(path.starts_with(harness.dir.path().join("v1")));
    assert_eq!(path, harness.cache.cache_path(URI, &thumb_spec()));
    assert_ne!(path, harness.cache.cache_path(URI, &small_spec()));
}

#[tokio::test]
async fn test_primary_hit() {
    let harness = Harness::new(DiskCacheConfig::default());
    harness.store(&thumb_spec(), &test::png_bytes(100, 100, [0, 255, 0, 255]));
    harness.store(&small_spec(), &test::png_bytes(50, 50, [0, 255, 0, 255]));

    let target = target();
    let lookup = harness
        .lookup(harness.request(&target), Some(small_spec()))
        .await;

    assert!(!lookup.canceled);
    let buffer = lookup.buffer.unwrap();
    assert_eq!(buffer.spec(), &thumb_spec());
    assert_eq!(buffer.bound_uri().as_deref(), Some(URI));
    assert_eq!(harness.stats.snapshot().disk_hit, 1);
}

#[tokio::test]
async fn test_alt_hit() {
    let harness = Harness::new(DiskCacheConfig::default());
    harness.store(&small_spec(), &test::png_bytes(50, 50, [0, 255, 0, 255]));

    let target = target();
    let lookup = harness
        .lookup(harness.request(&target), Some(small_spec()))
        .await;

    let buffer = lookup.buffer.unwrap();
    assert_eq!(buffer.spec(), &small_spec());
    assert_eq!((buffer.width(), buffer.height()), (50, 50));
}

#[tokio::test]
async fn test_miss() {
    let harness = Harness::new(DiskCacheConfig::default());

    let target = target();
    let lookup = harness
        .lookup(harness.request(&target), Some(small_spec()))
        .await;

    assert!(lookup.buffer.is_none());
    assert!(!lookup.canceled);
    assert_eq!(harness.stats.snapshot().disk_miss, 1);
}

#[tokio::test]
async fn test_contains() {
    let harness = Harness::new(DiskCacheConfig::default());
    let path = harness.store(&thumb_spec(), b"bytes");

    let contains = |path: PathBuf| {
        let (tx, rx) = oneshot::channel();
        harness.cache.contains_async(path, move |cached| {
            let _ = tx.send(cached);
        });
        rx
    };
    assert!(contains(path).await.unwrap());
    let missing = harness.cache.cache_path(URI, &small_spec());
    assert!(!contains(missing).await.unwrap());
    // existence checks are no lookups
    assert_eq!(harness.stats.snapshot().disk_miss, 0);
}

#[tokio::test]
async fn test_abandoned_request_is_canceled() {
    let harness = Harness::new(DiskCacheConfig::default());
    harness.store(&thumb_spec(), &test::png_bytes(100, 100, [0, 255, 0, 255]));

    let target = target();
    let request = harness.request(&target);
    drop(target);

    let lookup = harness.lookup(request, None).await;
    assert!(lookup.buffer.is_none());
    assert!(lookup.canceled);
}

#[tokio::test]
async fn test_corrupt_file_is_a_miss() {
    let harness = Harness::new(DiskCacheConfig::default());
    let path = harness.store(&thumb_spec(), b"garbage");

    let target = target();
    let lookup = harness.lookup(harness.request(&target), None).await;

    assert!(lookup.buffer.is_none());
    assert!(!lookup.canceled);
    assert_eq!(harness.stats.snapshot().disk_miss, 1);
    // left to age out
    assert!(path.exists());
}

#[tokio::test]
async fn test_first_image_triggers_scan() {
    let harness = Harness::new(DiskCacheConfig::default());
    harness.store(&thumb_spec(), &[0; 300]);

    harness.cache.image_added(300);
    harness.cache.flush().await;

    let state = harness.cache.state();
    assert!(state.last_scan.is_some());
    assert_eq!(state.total_size, 300);
    assert_eq!(harness.stats.snapshot().disk_scans, 1);
    assert_eq!(CacheState::load(&harness.dir.path().join("state.json")), state);

    // the interval did not elapse and the budget is fine
    harness.cache.image_added(10);
    harness.cache.flush().await;
    assert_eq!(harness.stats.snapshot().disk_scans, 1);
    assert_eq!(harness.cache.state().total_size, 310);
}

#[tokio::test]
async fn test_over_budget_triggers_scan() {
    let config = DiskCacheConfig {
        max_size: 1000,
        ..Default::default()
    };
    let harness = Harness::new(config);
    harness.cache.image_added(0);
    harness.cache.flush().await;
    assert_eq!(harness.stats.snapshot().disk_scans, 1);

    let path = harness.store(&thumb_spec(), &[0; 1200]);
    harness.cache.image_added(1200);
    harness.cache.flush().await;

    assert_eq!(harness.stats.snapshot().disk_scans, 2);
    assert!(!path.exists());
    assert_eq!(harness.cache.state().total_size, 0);
}

#[tokio::test]
async fn test_state_survives_reopen() {
    let harness = Harness::new(DiskCacheConfig::default());
    harness.store(&thumb_spec(), &[0; 300]);
    harness.cache.image_added(300);
    harness.cache.flush().await;
    let state = harness.cache.state();

    let stats = Arc::new(Stats::default());
    let reopened = Harness::open(&harness.dir, &DiskCacheConfig::default(), &stats);
    assert_eq!(reopened.state(), state);
    assert_eq!(stats.snapshot().disk_size, 300);
}

#[tokio::test]
async fn test_clear() {
    let harness = Harness::new(DiskCacheConfig::default());
    let path = harness.store(&thumb_spec(), &[0; 300]);
    harness.cache.image_added(300);

    harness.cache.clear();
    harness.cache.flush().await;

    assert!(!path.exists());
    assert!(harness.dir.path().join("v1").is_dir());
    assert_eq!(harness.cache.state().total_size, 0);
    assert_eq!(harness.stats.snapshot().disk_size, 0);
}
