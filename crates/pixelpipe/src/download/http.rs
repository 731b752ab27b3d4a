use std::io;
use std::time::Duration;

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use tokio_util::io::StreamReader;

use crate::config::DownloadConfig;
use crate::error::LoadError;

use super::transport::{Response, Transport};

/// Various timeouts of a [`HttpTransport`].
///
/// A zero duration disables the timeout.
#[derive(Copy, Clone, Debug)]
pub struct DownloadTimeouts {
    /// The timeout for establishing a connection.
    pub connect: Duration,
    /// The timeout for receiving the response head.
    pub head: Duration,
    /// Global timeout for one download, including the body.
    pub max_download: Duration,
}

impl DownloadTimeouts {
    pub fn from_config(config: &DownloadConfig) -> Self {
        Self {
            connect: config.connect_timeout,
            head: config.head_timeout,
            max_download: config.max_download_timeout,
        }
    }
}

impl Default for DownloadTimeouts {
    fn default() -> Self {
        Self::from_config(&DownloadConfig::default())
    }
}

/// Creates a [`reqwest::Client`] with the provided timeouts.
///
/// Compressed transfer encodings are not requested. Image formats are compressed
/// already, and a decompressed body has no known length, which would make every
/// abandoned transfer cancelable.
pub fn create_client(timeouts: &DownloadTimeouts) -> Result<reqwest::Client, LoadError> {
    let mut builder = reqwest::ClientBuilder::new().pool_idle_timeout(Duration::from_secs(30));
    if !timeouts.connect.is_zero() {
        builder = builder.connect_timeout(timeouts.connect);
    }
    if !timeouts.max_download.is_zero() {
        builder = builder.timeout(timeouts.max_download);
    }
    builder.build().map_err(LoadError::from)
}

/// The default [`Transport`], plain HTTP GET requests with [`reqwest`].
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    timeouts: DownloadTimeouts,
}

impl HttpTransport {
    pub fn new(timeouts: DownloadTimeouts) -> Result<Self, LoadError> {
        Ok(Self {
            client: create_client(&timeouts)?,
            timeouts,
        })
    }

    /// Uses an existing client. Only the head timeout is applied on top of its settings.
    pub fn with_client(client: reqwest::Client, timeouts: DownloadTimeouts) -> Self {
        Self { client, timeouts }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn execute(&self, uri: &str) -> Result<Response, LoadError> {
        let request = self.client.get(uri).send();
        let response = if self.timeouts.head.is_zero() {
            request.await?
        } else {
            tokio::time::timeout(self.timeouts.head, request)
                .await
                .map_err(|_| {
                    LoadError::Transport(format!(
                        "no response head within {}",
                        humantime::format_duration(self.timeouts.head)
                    ))
                })??
        };

        let status = response.status();
        if !status.is_success() {
            tracing::debug!(uri, %status, "Unexpected status code");
        }

        let content_length = response.content_length();
        let stream = response
            .bytes_stream()
            .map_err(io::Error::other)
            .boxed();

        Ok(Response {
            status: status.as_u16(),
            message: status.canonical_reason().unwrap_or_default().to_owned(),
            content_length,
            body: Box::new(StreamReader::new(stream)),
        })
    }
}
