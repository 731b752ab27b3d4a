//! An image loading pipeline.
//!
//! [`ImageLoader`] turns `(uri, spec)` pairs into decoded [`PixelBuffer`]s. Lookups cascade
//! from a pool of recycled buffers to a content-addressed disk cache to the network, and
//! concurrent loads of the same pair share one unit of work.

#[macro_use]
pub mod metrics;

pub mod binding;
pub mod buffer;
pub mod config;
pub mod decode;
pub mod disk;
pub mod download;
pub mod error;
pub mod loader;
pub mod logging;
pub mod pool;
pub mod request;
pub mod spec;
pub mod stats;
pub mod utils;

#[cfg(test)]
#[allow(unused)]
pub mod test;

pub use binding::{Display, DisplayTarget};
pub use buffer::PixelBuffer;
pub use config::Config;
pub use error::{DecodeError, LoadError};
pub use loader::{ImageLoader, ImageLoaderBuilder};
pub use pool::TrimLevel;
pub use request::{LoadedFrom, Target};
pub use spec::{PixelFormat, Spec};
pub use stats::StatsSnapshot;
