use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard};

use crate::spec::Spec;

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

/// A reusable pixel allocation.
///
/// Buffers are shared as `Arc<PixelBuffer>` between the pool, in-flight requests and
/// consumers. The [`use_count`](Self::use_count) is the single source of truth for
/// "in use": consumers increment it while they display the buffer, and the pool never
/// hands out or reclaims a buffer while it is positive.
pub struct PixelBuffer {
    id: u64,
    spec: Spec,
    width: u32,
    height: u32,
    pixels: RwLock<Vec<u8>>,
    bound_uri: Mutex<Option<Arc<str>>>,
    use_count: AtomicI32,
    in_decode_use: AtomicBool,
    closed: AtomicBool,
}

impl PixelBuffer {
    /// Wraps an allocation holding `width * height` pixels of the spec's format.
    pub fn new(spec: Spec, width: u32, height: u32, pixels: Vec<u8>) -> Arc<Self> {
        debug_assert_eq!(
            pixels.len(),
            width as usize * height as usize * spec.pixel_format().bytes_per_pixel()
        );
        Arc::new(Self {
            id: NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed),
            spec,
            width,
            height,
            pixels: RwLock::new(pixels),
            bound_uri: Mutex::new(None),
            use_count: AtomicI32::new(0),
            in_decode_use: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    /// A process-unique id, for logs.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The spec this buffer was decoded for. Decides its pool bucket.
    pub fn spec(&self) -> &Spec {
        &self.spec
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Size of the pixel allocation in bytes.
    pub fn byte_size(&self) -> usize {
        self.width as usize * self.height as usize * self.spec.pixel_format().bytes_per_pixel()
    }

    /// Read access to the pixels. Empty once the buffer is closed.
    pub fn pixels(&self) -> RwLockReadGuard<'_, Vec<u8>> {
        self.pixels.read().unwrap()
    }

    /// Overwrites the pixels in place, without reallocating.
    pub(crate) fn write_pixels<F>(&self, f: F)
    where
        F: FnOnce(&mut [u8]),
    {
        let mut pixels = self.pixels.write().unwrap();
        f(pixels.as_mut_slice());
    }

    /// The uri whose content currently occupies this buffer.
    pub fn bound_uri(&self) -> Option<Arc<str>> {
        self.bound_uri.lock().unwrap().clone()
    }

    pub(crate) fn is_bound_to(&self, uri: &str) -> bool {
        self.bound_uri.lock().unwrap().as_deref() == Some(uri)
    }

    pub(crate) fn bind(&self, uri: Arc<str>) {
        *self.bound_uri.lock().unwrap() = Some(uri);
    }

    pub fn use_count(&self) -> i32 {
        self.use_count.load(Ordering::Acquire)
    }

    /// Marks the buffer as used by one more consumer.
    pub fn acquire(&self) -> i32 {
        self.use_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Releases one consumer's use of this buffer.
    pub fn release(&self) -> i32 {
        let previous = self.use_count.fetch_sub(1, Ordering::AcqRel);
        if previous <= 0 {
            tracing::error!(buffer = self.id, "pixel buffer released more often than acquired");
            self.use_count.fetch_add(1, Ordering::AcqRel);
            return 0;
        }
        previous - 1
    }

    pub fn in_decode_use(&self) -> bool {
        self.in_decode_use.load(Ordering::Acquire)
    }

    pub(crate) fn set_in_decode_use(&self, value: bool) {
        self.in_decode_use.store(value, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Whether this buffer may be released or handed out for reuse.
    pub fn is_idle(&self) -> bool {
        self.use_count() == 0 && !self.in_decode_use() && !self.is_closed()
    }

    /// Releases the allocation. Terminal.
    pub(crate) fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut pixels = self.pixels.write().unwrap();
        *pixels = Vec::new();
        *self.bound_uri.lock().unwrap() = None;
    }
}

impl fmt::Debug for PixelBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PixelBuffer")
            .field("id", &self.id)
            .field("spec", &self.spec.key())
            .field("size", &format_args!("{}x{}", self.width, self.height))
            .field("bound_uri", &self.bound_uri())
            .field("use_count", &self.use_count())
            .field("in_decode_use", &self.in_decode_use())
            .field("closed", &self.is_closed())
            .finish()
    }
}
