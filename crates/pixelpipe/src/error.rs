use std::io;

use thiserror::Error;

/// An error that happens while loading an image through the pipeline.
///
/// Most of these are reported to targets as a single `on_failed()` call and never
/// returned across a thread boundary. [`NotFound`](Self::NotFound) and
/// [`Canceled`](Self::Canceled) are not failures at all, they steer the cascade.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    /// Bad configuration, for example a spec with a zero width.
    ///
    /// Raised at construction time and never retried.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// A memory or disk miss.
    #[error("not found")]
    NotFound,
    /// The cached bytes could not be decoded.
    ///
    /// Treated like a disk miss, the file is left to age out.
    #[error("decode failed: {0}")]
    Decode(#[from] DecodeError),
    /// The remote answered with a non-success status, or the transfer failed.
    ///
    /// The attached string contains the status code and the remote's message.
    #[error("download failed: {0}")]
    Transport(String),
    /// The request lost all of its targets while work was pending.
    #[error("canceled")]
    Canceled,
    /// A precondition was violated, like a duplicate spec or a shut down loader.
    #[error("invalid state: {0}")]
    State(String),
    /// An unexpected error in the pipeline itself.
    #[error("internal error")]
    InternalError,
}

impl From<io::Error> for LoadError {
    #[track_caller]
    fn from(err: io::Error) -> Self {
        Self::from_std_error(err)
    }
}

impl From<reqwest::Error> for LoadError {
    fn from(error: reqwest::Error) -> Self {
        let mut source: &dyn std::error::Error = &error;
        while let Some(inner) = source.source() {
            source = inner;
        }
        Self::Transport(source.to_string())
    }
}

impl LoadError {
    #[track_caller]
    pub fn from_std_error<E: std::error::Error + 'static>(e: E) -> Self {
        let dynerr: &dyn std::error::Error = &e; // tracing expects a `&dyn Error`
        tracing::error!(error = dynerr);
        Self::InternalError
    }

    /// Whether this error is an actual failure that should be reported to targets.
    pub fn is_failure(&self) -> bool {
        !matches!(self, Self::NotFound | Self::Canceled)
    }
}

/// An error turning cached bytes into pixels.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// The file could not be read.
    #[error("failed to read image file: {0}")]
    Io(String),
    /// The file contents are not a supported or valid image.
    #[error("malformed image: {0}")]
    Malformed(String),
}

impl From<io::Error> for DecodeError {
    fn from(error: io::Error) -> Self {
        Self::Io(error.to_string())
    }
}

impl From<image::ImageError> for DecodeError {
    fn from(error: image::ImageError) -> Self {
        match error {
            image::ImageError::IoError(e) => Self::Io(e.to_string()),
            other => Self::Malformed(other.to_string()),
        }
    }
}
