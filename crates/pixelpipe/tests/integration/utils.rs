use std::sync::{Arc, Mutex};
use std::time::Duration;

use pixelpipe::{Config, ImageLoader, LoadedFrom, PixelBuffer, Target};
use pixelpipe_test::TempDir;
use tokio::sync::Notify;

/// Builds a loader caching into a fresh temp dir, with the `thumb` (100x100) and
/// `small` (50x50) specs registered.
pub fn setup_loader<F>(configure: F) -> (ImageLoader, TempDir)
where
    F: FnOnce(&mut Config),
{
    pixelpipe_test::setup();
    let cache_dir = pixelpipe_test::tempdir();
    let loader = build_loader(&cache_dir, configure);
    (loader, cache_dir)
}

pub fn build_loader<F>(cache_dir: &TempDir, configure: F) -> ImageLoader
where
    F: FnOnce(&mut Config),
{
    let mut config: Config = serde_yaml::from_str(
        r#"
        specs:
          thumb: { width: 100, height: 100, format: argb8888 }
          small: { width: 50, height: 50, format: rgb565 }
        "#,
    )
    .unwrap();
    config.cache_dir = Some(cache_dir.path().to_owned());
    config.metrics.statsd = None;
    configure(&mut config);

    ImageLoader::builder(config).build().unwrap()
}

#[derive(Debug, Clone)]
pub enum Outcome {
    Loaded(Arc<PixelBuffer>, LoadedFrom),
    Failed,
}

/// A target that records what it was told.
#[derive(Debug)]
pub struct Recorder {
    uri: String,
    spec_key: String,
    outcomes: Mutex<Vec<Outcome>>,
    changed: Notify,
}

impl Recorder {
    pub fn new(uri: &str, spec_key: &str) -> Arc<Self> {
        Arc::new(Self {
            uri: uri.into(),
            spec_key: spec_key.into(),
            outcomes: Mutex::new(Vec::new()),
            changed: Notify::new(),
        })
    }

    pub fn outcomes(&self) -> Vec<Outcome> {
        self.outcomes.lock().unwrap().clone()
    }

    /// Waits for the `n`th outcome and returns it.
    pub async fn wait(&self, n: usize) -> Outcome {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let changed = self.changed.notified();
                if let Some(outcome) = self.outcomes.lock().unwrap().get(n - 1) {
                    return outcome.clone();
                }
                changed.await;
            }
        })
        .await
        .expect("target was not notified in time")
    }

    /// Waits for the first outcome and expects it to be a load.
    pub async fn loaded(&self) -> (Arc<PixelBuffer>, LoadedFrom) {
        match self.wait(1).await {
            Outcome::Loaded(buffer, source) => (buffer, source),
            Outcome::Failed => panic!("load of `{}` failed", self.uri),
        }
    }

    /// Starts loading into this target and waits for a successful result.
    pub async fn loaded_via(self: Arc<Self>, loader: &ImageLoader) -> (Arc<PixelBuffer>, LoadedFrom) {
        loader.load(self.clone(), None);
        self.loaded().await
    }

    fn push(&self, outcome: Outcome) {
        self.outcomes.lock().unwrap().push(outcome);
        self.changed.notify_waiters();
    }
}

impl Target for Recorder {
    fn uri(&self) -> Option<String> {
        Some(self.uri.clone())
    }

    fn spec_key(&self) -> String {
        self.spec_key.clone()
    }

    fn on_downloading(&self, _downloaded: u64, _total: Option<u64>) {}

    fn on_loaded(&self, buffer: Arc<PixelBuffer>, source: LoadedFrom) {
        self.push(Outcome::Loaded(buffer, source));
    }

    fn on_failed(&self) {
        self.push(Outcome::Failed);
    }
}

/// Loads `uri` into a fresh [`Recorder`] and waits for the outcome.
pub async fn load(loader: &ImageLoader, uri: &str, spec_key: &str) -> Outcome {
    let target = Recorder::new(uri, spec_key);
    loader.load(target.clone(), None);
    target.wait(1).await
}

/// Polls `done` until it holds.
pub async fn eventually<F>(done: F)
where
    F: Fn() -> bool,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        while !done() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition did not hold in time");
}
