//! Helpers for testing the image pipeline.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory is held for the
//!    entire lifetime of the test. When dropped too early, the loader keeps writing into a
//!    directory that no longer exists.
//!
//!  - When using [`ImageServer`], make sure that the server is held until all requests to
//!    the server have been made. It stops serving when dropped.

use std::collections::BTreeMap;
use std::io::{Cursor, Write};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::Router;
use axum::extract;
use axum::http::{HeaderMap, StatusCode, header};
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use bytes::Bytes;
use flate2::Compression;
use flate2::write::GzEncoder;
use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

pub use tempfile::TempDir;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `pixelpipe` crate and mutes all
///    other logs (such as hyper or reqwest).
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("pixelpipe=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped. Use it as a guard to
/// automatically clean up after tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// Encodes a `width` x `height` PNG filled with `color` (RGBA).
pub fn png_bytes(width: u32, height: u32, color: [u8; 4]) -> Vec<u8> {
    let image = RgbaImage::from_pixel(width, height, Rgba(color));
    let mut out = Vec::new();
    DynamicImage::ImageRgba8(image)
        .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
        .unwrap();
    out
}

/// A test server that binds to a random port and serves a web app.
///
/// This server requires a `tokio` runtime and is supposed to be run in a `tokio::test`. It
/// automatically stops serving when dropped.
#[derive(Debug)]
pub struct Server {
    pub handle: tokio::task::JoinHandle<()>,
    pub socket: SocketAddr,
}

impl Server {
    pub fn with_router(router: Router) -> Self {
        let addr = SocketAddr::from(([127, 0, 0, 1], 0));
        let listener = std::net::TcpListener::bind(addr).unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            let listener = tokio::net::TcpListener::from_std(listener).unwrap();
            axum::serve(listener, router).await.unwrap();
        });

        Self { handle, socket }
    }

    /// Returns the socket address that this server listens on.
    pub fn addr(&self) -> SocketAddr {
        self.socket
    }

    /// Returns the port that this server listens on.
    pub fn port(&self) -> u16 {
        self.addr().port()
    }

    /// Returns a full URL pointing to the given path.
    ///
    /// This URL uses `localhost` as hostname.
    pub fn url(&self, path: &str) -> String {
        let path = path.trim_start_matches('/');
        format!("http://localhost:{}/{}", self.port(), path)
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Serves generated images and counts requests per path.
///
/// Routes:
///
///  - `/png/:width/:height/*name`: a PNG of that size. The color is derived from `name`,
///    so different names yield different pixels.
///  - `/slow/:time/:width/:height/*name`: the same PNG, with the response delayed by a
///    humantime duration.
///  - `/compressible/:width/:height/*name`: the same PNG, gzip encoded if the client
///    accepts it.
///  - `/respond_statuscode/:num/*tail`: an empty response with that status.
///  - `/garbage_data/*tail`: bytes that are no image.
///  - `/redirect/*path`: a redirect to `/path`.
pub struct ImageServer {
    server: Server,
    hits: Arc<Mutex<BTreeMap<String, usize>>>,
}

impl ImageServer {
    pub fn new() -> Self {
        let hits = Arc::new(Mutex::new(BTreeMap::new()));

        let hitcounter = {
            let hits = hits.clone();
            move |extract::OriginalUri(uri): extract::OriginalUri,
                  req: extract::Request,
                  next: middleware::Next| {
                let hits = hits.clone();
                async move {
                    {
                        let mut hits = hits.lock().unwrap();
                        let hits = hits.entry(uri.path().to_owned()).or_default();
                        *hits += 1;
                    }

                    next.run(req).await
                }
            }
        };

        let router = Router::new()
            .route(
                "/png/:width/:height/*name",
                get(
                    |extract::Path((width, height, name)): extract::Path<(u32, u32, String)>| async move {
                        png_response(width, height, &name)
                    },
                ),
            )
            .route(
                "/slow/:time/:width/:height/*name",
                get(
                    |extract::Path((time, width, height, name)): extract::Path<(
                        String,
                        u32,
                        u32,
                        String,
                    )>| async move {
                        let duration = humantime::parse_duration(&time).unwrap();
                        tokio::time::sleep(duration).await;
                        png_response(width, height, &name)
                    },
                ),
            )
            .route(
                "/compressible/:width/:height/*name",
                get(
                    |headers: HeaderMap,
                     extract::Path((width, height, name)): extract::Path<(u32, u32, String)>| async move {
                        let accepts_gzip = headers
                            .get(header::ACCEPT_ENCODING)
                            .and_then(|value| value.to_str().ok())
                            .is_some_and(|value| value.contains("gzip"));
                        if !accepts_gzip {
                            return png_response(width, height, &name);
                        }

                        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
                        encoder.write_all(&png_body(width, height, &name)).unwrap();
                        let body = encoder.finish().unwrap();
                        (
                            [
                                (header::CONTENT_TYPE, "image/png"),
                                (header::CONTENT_ENCODING, "gzip"),
                            ],
                            body,
                        )
                            .into_response()
                    },
                ),
            )
            .route(
                "/respond_statuscode/:num/*tail",
                get(
                    |extract::Path((num, _)): extract::Path<(u16, String)>| async move {
                        StatusCode::from_u16(num).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
                    },
                ),
            )
            .route(
                "/garbage_data/*tail",
                get(|extract::Path(tail): extract::Path<String>| async move { tail }),
            )
            .route(
                "/redirect/*path",
                get(|extract::Path(path): extract::Path<String>| async move {
                    (StatusCode::FOUND, [(header::LOCATION, format!("/{path}"))])
                }),
            )
            .layer(middleware::from_fn(hitcounter));

        let server = Server::with_router(router);

        Self { server, hits }
    }

    /// Number of requests to `path` so far.
    pub fn hits(&self, path: &str) -> usize {
        let path = format!("/{}", path.trim_start_matches('/'));
        self.hits.lock().unwrap().get(&path).copied().unwrap_or(0)
    }

    /// Total number of requests so far.
    pub fn accesses(&self) -> usize {
        self.hits.lock().unwrap().values().sum()
    }

    pub fn url(&self, path: &str) -> String {
        self.server.url(path)
    }
}

impl Default for ImageServer {
    fn default() -> Self {
        Self::new()
    }
}

fn png_body(width: u32, height: u32, name: &str) -> Vec<u8> {
    let seed = name.bytes().fold(0u8, |acc, b| acc.wrapping_mul(31).wrapping_add(b));
    png_bytes(width, height, [seed, 255 - seed, 128, 255])
}

fn png_response(width: u32, height: u32, name: &str) -> Response {
    let body = Bytes::from(png_body(width, height, name));
    ([(header::CONTENT_TYPE, "image/png")], body).into_response()
}
