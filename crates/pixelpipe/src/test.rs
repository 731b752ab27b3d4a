//! Helpers for testing the pipeline.
//!
//! # Fakes
//!
//! - [`FakeTransport`] serves canned responses per uri, optionally pausing the body at
//!   a [`Gate`] until the test opens it, and counts calls.
//! - [`RecordingTarget`] records every callback it receives and lets tests wait for them.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::{Notify, Semaphore};
use tokio_util::io::StreamReader;

use crate::buffer::PixelBuffer;
use crate::download::{Response, Transport};
use crate::error::LoadError;
use crate::request::{LoadedFrom, Target};
use crate::spec::{PixelFormat, Spec};

pub use pixelpipe_test::{png_bytes, setup, tempdir};

const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Spec `A`: 100x100 rgb565.
pub fn thumb_spec() -> Spec {
    Spec::builder("A")
        .size(100, 100)
        .pixel_format(PixelFormat::Rgb565)
        .build()
        .unwrap()
}

/// Spec `B`: 50x50 rgb565, used as the alt spec of [`thumb_spec`].
pub fn small_spec() -> Spec {
    Spec::builder("B")
        .size(50, 50)
        .pixel_format(PixelFormat::Rgb565)
        .build()
        .unwrap()
}

/// Holds back the rest of a [`FakeTransport`] body until opened.
#[derive(Debug, Clone)]
pub struct Gate(Arc<Semaphore>);

impl Gate {
    pub fn open(&self) {
        self.0.add_permits(1024);
    }
}

#[derive(Debug, Clone)]
struct FakeResponse {
    status: u16,
    message: String,
    body: Bytes,
    chunk_size: usize,
    announce_length: bool,
    gate: Option<(usize, Gate)>,
}

/// A [`Transport`] answering from memory.
///
/// Unknown uris are answered with `404 Not Found`.
#[derive(Debug, Default)]
pub struct FakeTransport {
    responses: Mutex<HashMap<String, FakeResponse>>,
    calls: Mutex<Vec<String>>,
    called: Notify,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::default()
    }

    /// Serves `body` in one chunk.
    pub fn serve(&self, uri: &str, body: Vec<u8>) {
        let chunk_size = body.len().max(1);
        self.insert(uri, FakeResponse {
            status: 200,
            message: "OK".into(),
            body: body.into(),
            chunk_size,
            announce_length: true,
            gate: None,
        });
    }

    /// Serves `body` in chunks of `chunk_size`, stopping before the chunk at `pause_at`
    /// until the returned gate is opened.
    pub fn serve_gated(&self, uri: &str, body: Vec<u8>, chunk_size: usize, pause_at: usize) -> Gate {
        let gate = Gate(Arc::new(Semaphore::new(0)));
        self.insert(uri, FakeResponse {
            status: 200,
            message: "OK".into(),
            body: body.into(),
            chunk_size,
            announce_length: true,
            gate: Some((pause_at, gate.clone())),
        });
        gate
    }

    /// Like [`serve_gated`](Self::serve_gated), without announcing a content length.
    pub fn serve_gated_unknown_length(
        &self,
        uri: &str,
        body: Vec<u8>,
        chunk_size: usize,
        pause_at: usize,
    ) -> Gate {
        let gate = self.serve_gated(uri, body, chunk_size, pause_at);
        if let Some(response) = self.responses.lock().unwrap().get_mut(uri) {
            response.announce_length = false;
        }
        gate
    }

    /// Answers `uri` with an error status.
    pub fn fail(&self, uri: &str, status: u16, message: &str) {
        self.insert(uri, FakeResponse {
            status,
            message: message.into(),
            body: Bytes::new(),
            chunk_size: 1,
            announce_length: true,
            gate: None,
        });
    }

    fn insert(&self, uri: &str, response: FakeResponse) {
        self.responses.lock().unwrap().insert(uri.into(), response);
    }

    /// Number of times `uri` was requested.
    pub fn calls(&self, uri: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| *c == uri).count()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Waits until `uri` was requested `n` times.
    pub async fn wait_for_calls(&self, uri: &str, n: usize) {
        tokio::time::timeout(WAIT_TIMEOUT, async {
            loop {
                let called = self.called.notified();
                if self.calls(uri) >= n {
                    return;
                }
                called.await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("`{uri}` was not requested {n} times"));
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn execute(&self, uri: &str) -> Result<Response, LoadError> {
        self.calls.lock().unwrap().push(uri.into());
        self.called.notify_waiters();

        let response = self.responses.lock().unwrap().get(uri).cloned();
        let Some(response) = response else {
            return Ok(Response {
                status: 404,
                message: "Not Found".into(),
                content_length: None,
                body: Box::new(tokio::io::empty()),
            });
        };

        let content_length = response.announce_length.then_some(response.body.len() as u64);
        let chunks: Vec<(usize, Bytes)> = (0..response.body.len())
            .step_by(response.chunk_size)
            .map(|offset| {
                let end = (offset + response.chunk_size).min(response.body.len());
                (offset, response.body.slice(offset..end))
            })
            .collect();

        let gate = response.gate;
        let stream = futures::stream::iter(chunks)
            .then(move |(offset, chunk)| {
                let gate = gate.clone();
                async move {
                    if let Some((pause_at, gate)) = gate {
                        if offset >= pause_at {
                            let _permit = gate.0.acquire().await;
                        }
                    }
                    Ok::<_, io::Error>(chunk)
                }
            })
            .boxed();

        Ok(Response {
            status: response.status,
            message: response.message,
            content_length,
            body: Box::new(StreamReader::new(stream)),
        })
    }
}

/// A callback received by a [`RecordingTarget`].
#[derive(Debug, Clone)]
pub enum Event {
    Downloading(u64, Option<u64>),
    Loaded(Arc<PixelBuffer>, LoadedFrom),
    Failed,
}

/// A [`Target`] recording its callbacks.
#[derive(Debug)]
pub struct RecordingTarget {
    uri: Mutex<Option<String>>,
    spec_key: String,
    events: Mutex<Vec<Event>>,
    changed: Notify,
}

impl RecordingTarget {
    pub fn new(uri: &str, spec_key: &str) -> Arc<Self> {
        Arc::new(Self {
            uri: Mutex::new(Some(uri.into())),
            spec_key: spec_key.into(),
            events: Mutex::new(Vec::new()),
            changed: Notify::new(),
        })
    }

    /// Points the target at another uri, or at nothing.
    pub fn set_uri(&self, uri: Option<&str>) {
        *self.uri.lock().unwrap() = uri.map(Into::into);
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    /// All `on_loaded` calls so far.
    pub fn loaded(&self) -> Vec<(Arc<PixelBuffer>, LoadedFrom)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Loaded(buffer, source) => Some((buffer, source)),
                _ => None,
            })
            .collect()
    }

    pub fn failures(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, Event::Failed))
            .count()
    }

    /// Waits until the recorded events satisfy `done`.
    pub async fn wait_until<F>(&self, done: F)
    where
        F: Fn(&[Event]) -> bool,
    {
        tokio::time::timeout(WAIT_TIMEOUT, async {
            loop {
                let changed = self.changed.notified();
                if done(&self.events.lock().unwrap()) {
                    return;
                }
                changed.await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for target, got {:?}", self.events()));
    }

    /// Waits for the `n`th `on_loaded` call and returns it.
    pub async fn wait_loaded(&self, n: usize) -> (Arc<PixelBuffer>, LoadedFrom) {
        self.wait_until(|events| {
            events
                .iter()
                .filter(|e| matches!(e, Event::Loaded(..)))
                .count()
                >= n
        })
        .await;
        self.loaded().swap_remove(n - 1)
    }

    pub async fn wait_failed(&self) {
        self.wait_until(|events| events.iter().any(|e| matches!(e, Event::Failed)))
            .await;
    }

    fn record(&self, event: Event) {
        self.events.lock().unwrap().push(event);
        self.changed.notify_waiters();
    }
}

impl Target for RecordingTarget {
    fn uri(&self) -> Option<String> {
        self.uri.lock().unwrap().clone()
    }

    fn spec_key(&self) -> String {
        self.spec_key.clone()
    }

    fn on_downloading(&self, downloaded: u64, total: Option<u64>) {
        self.record(Event::Downloading(downloaded, total));
    }

    fn on_loaded(&self, buffer: Arc<PixelBuffer>, source: LoadedFrom) {
        self.record(Event::Loaded(buffer, source));
    }

    fn on_failed(&self) {
        self.record(Event::Failed);
    }
}
