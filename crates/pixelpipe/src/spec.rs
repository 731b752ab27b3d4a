//! Image specs: the fixed `(width, height, pixel format)` contract of a decoded image.
//!
//! A [`Spec`] decides which buffers are interchangeable. Two buffers with equal specs
//! share one bucket in the [`BufferPool`](crate::pool::BufferPool), and the spec's
//! description is part of the on-disk cache key.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::Deserialize;

use crate::error::LoadError;

/// The in-memory layout of one pixel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// 16 bits per pixel, 5 bits red, 6 bits green, 5 bits blue, little endian.
    Rgb565,
    /// 32 bits per pixel, stored as `r, g, b, a` bytes.
    Argb8888,
    /// 8 bits per pixel, alpha channel only.
    Alpha8,
}

impl PixelFormat {
    /// Number of bytes a single pixel occupies.
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            Self::Rgb565 => 2,
            Self::Argb8888 => 4,
            Self::Alpha8 => 1,
        }
    }
}

impl AsRef<str> for PixelFormat {
    fn as_ref(&self) -> &str {
        match self {
            Self::Rgb565 => "rgb565",
            Self::Argb8888 => "argb8888",
            Self::Alpha8 => "alpha8",
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_ref())
    }
}

/// An immutable image spec.
///
/// Specs are cheap to clone. Equality covers every field.
#[derive(Debug, Clone)]
pub struct Spec {
    key: Arc<str>,
    width: u32,
    height: u32,
    pixel_format: PixelFormat,
    max_density: f32,
}

impl Spec {
    /// Marks a dimension as unbounded, the size is then taken from the image itself.
    pub const UNBOUNDED: u32 = u32::MAX;

    /// Starts building a spec that will be registered under `key`.
    pub fn builder(key: impl Into<Arc<str>>) -> SpecBuilder {
        SpecBuilder {
            key: key.into(),
            width: None,
            height: None,
            pixel_format: PixelFormat::Argb8888,
            max_density: 1.0,
        }
    }

    /// The stable identity of this spec.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.pixel_format
    }

    pub fn max_density(&self) -> f32 {
        self.max_density
    }

    /// Whether both dimensions are fixed.
    ///
    /// Buffers of unbounded specs are expensive to hold and rarely match a later
    /// request, so the pool does not hand them out for reuse.
    pub fn size_bounded(&self) -> bool {
        self.width != Self::UNBOUNDED && self.height != Self::UNBOUNDED
    }

    /// Size in bytes of a buffer holding exactly this spec, if bounded.
    pub fn byte_size(&self) -> Option<usize> {
        self.size_bounded().then(|| {
            self.width as usize * self.height as usize * self.pixel_format.bytes_per_pixel()
        })
    }
}

impl PartialEq for Spec {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
            && self.width == other.width
            && self.height == other.height
            && self.pixel_format == other.pixel_format
            && self.max_density.to_bits() == other.max_density.to_bits()
    }
}

impl Eq for Spec {}

impl Hash for Spec {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
        self.width.hash(state);
        self.height.hash(state);
        self.pixel_format.hash(state);
        self.max_density.to_bits().hash(state);
    }
}

impl fmt::Display for Spec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ", self.key)?;
        match self.size_bounded() {
            true => write!(f, "{}x{}", self.width, self.height)?,
            false => f.write_str("unbounded")?,
        }
        write!(f, " {} @{}", self.pixel_format, self.max_density)
    }
}

/// Builder for [`Spec`], validating the values on [`build`](Self::build).
#[derive(Debug, Clone)]
pub struct SpecBuilder {
    key: Arc<str>,
    width: Option<u32>,
    height: Option<u32>,
    pixel_format: PixelFormat,
    max_density: f32,
}

impl SpecBuilder {
    pub fn size(mut self, width: u32, height: u32) -> Self {
        self.width = Some(width);
        self.height = Some(height);
        self
    }

    pub fn unbounded(mut self) -> Self {
        self.width = Some(Spec::UNBOUNDED);
        self.height = Some(Spec::UNBOUNDED);
        self
    }

    pub fn pixel_format(mut self, pixel_format: PixelFormat) -> Self {
        self.pixel_format = pixel_format;
        self
    }

    pub fn max_density(mut self, max_density: f32) -> Self {
        self.max_density = max_density;
        self
    }

    pub fn build(self) -> Result<Spec, LoadError> {
        if self.key.is_empty() {
            return Err(LoadError::InvalidArgument("spec key is empty".into()));
        }
        let (Some(width), Some(height)) = (self.width, self.height) else {
            return Err(LoadError::InvalidArgument(format!(
                "spec `{}` has no size, use `size` or `unbounded`",
                self.key
            )));
        };
        if width == 0 || height == 0 {
            return Err(LoadError::InvalidArgument(format!(
                "spec `{}` has a zero dimension ({width}x{height})",
                self.key
            )));
        }
        if !self.max_density.is_finite() || self.max_density <= 0.0 {
            return Err(LoadError::InvalidArgument(format!(
                "spec `{}` has an invalid max density {}",
                self.key, self.max_density
            )));
        }

        Ok(Spec {
            key: self.key,
            width,
            height,
            pixel_format: self.pixel_format,
            max_density: self.max_density,
        })
    }
}

/// The table of registered specs, keyed by [`Spec::key`].
#[derive(Debug, Clone, Default)]
pub struct Specs {
    specs: BTreeMap<Arc<str>, Spec>,
}

impl Specs {
    /// Registers a spec. Registering the same key twice is a precondition violation.
    pub fn register(&mut self, spec: Spec) -> Result<(), LoadError> {
        if self.specs.contains_key(spec.key()) {
            return Err(LoadError::State(format!(
                "spec `{}` is already registered",
                spec.key()
            )));
        }
        self.specs.insert(spec.key.clone(), spec);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Result<&Spec, LoadError> {
        self.specs
            .get(key)
            .ok_or_else(|| LoadError::State(format!("unknown spec `{key}`")))
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Spec> {
        self.specs.values()
    }
}
