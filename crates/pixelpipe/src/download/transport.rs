use std::fmt;

use async_trait::async_trait;
use tokio::io::AsyncRead;

use crate::error::LoadError;
use crate::spec::Spec;

/// The answer of a [`Transport`].
pub struct Response {
    /// The HTTP status code.
    pub status: u16,
    /// The reason phrase or error message that came with the status.
    pub message: String,
    /// The announced body length, if any.
    pub content_length: Option<u64>,
    pub body: Box<dyn AsyncRead + Send + Unpin>,
}

impl Response {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("message", &self.message)
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// Fetches the bytes behind a uri.
///
/// One call per transfer. Implementations must be usable from several downloads at once.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn execute(&self, uri: &str) -> Result<Response, LoadError>;
}

/// Rewrites a uri before it is fetched, for example to ask an image service for the
/// spec's size.
///
/// Only the network fetch sees the rewritten uri. Cache files and pool entries are
/// keyed by the original one.
pub trait UriAdapter: Send + Sync + 'static {
    fn convert(&self, uri: &str, spec: &Spec) -> String;
}

/// Fetches uris unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityAdapter;

impl UriAdapter for IdentityAdapter {
    fn convert(&self, uri: &str, _spec: &Spec) -> String {
        uri.to_owned()
    }
}

impl<F> UriAdapter for F
where
    F: Fn(&str, &Spec) -> String + Send + Sync + 'static,
{
    fn convert(&self, uri: &str, spec: &Spec) -> String {
        self(uri, spec)
    }
}
