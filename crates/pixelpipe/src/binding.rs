//! Binds loads to something that shows pixels.
//!
//! A UI toolkit implements [`Display`] once. [`DisplayTarget`] does the bookkeeping
//! every view needs: it remembers which uri the view wants, drops results that arrive
//! for a uri the view no longer shows, and keeps the shown buffer's
//! [`use_count`](PixelBuffer::use_count) raised so the pool does not recycle it
//! underneath the view.

use std::fmt;
use std::sync::{Arc, Mutex};

use crate::buffer::PixelBuffer;
use crate::loader::ImageLoader;
use crate::request::{LoadedFrom, Target};

/// What a view must be able to do to show loaded images.
pub trait Display: Send + Sync + 'static {
    /// Removes whatever is shown, for example by showing a placeholder.
    fn clear_display(&self);

    /// Shows `buffer`. Called again when a better spec or a newer image arrives.
    fn show_buffer(&self, buffer: &Arc<PixelBuffer>, source: LoadedFrom);
}

#[derive(Default)]
struct Binding {
    uri: Option<String>,
    shown: Option<Arc<PixelBuffer>>,
}

impl Binding {
    /// Forgets the shown buffer, giving up this target's use of it.
    fn release(&mut self) -> bool {
        match self.shown.take() {
            Some(buffer) => {
                buffer.release();
                true
            }
            None => false,
        }
    }
}

/// A [`Target`] driving a [`Display`].
pub struct DisplayTarget<D> {
    display: D,
    spec_key: String,
    binding: Mutex<Binding>,
}

impl<D: Display> DisplayTarget<D> {
    pub fn new(display: D, spec_key: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            display,
            spec_key: spec_key.into(),
            binding: Mutex::default(),
        })
    }

    pub fn display(&self) -> &D {
        &self.display
    }

    /// The buffer currently shown.
    pub fn shown(&self) -> Option<Arc<PixelBuffer>> {
        self.binding.lock().unwrap().shown.clone()
    }

    /// Points the view at `uri` and starts loading it.
    ///
    /// Switching to another uri clears the display right away, results for the old uri
    /// that are still in flight are dropped when they arrive.
    pub fn bind(self: &Arc<Self>, loader: &ImageLoader, uri: &str, alt_spec_key: Option<&str>) {
        let cleared = {
            let mut binding = self.binding.lock().unwrap();
            if binding.uri.as_deref() == Some(uri) && binding.shown.is_some() {
                return;
            }
            binding.uri = Some(uri.to_owned());
            binding.release()
        };
        if cleared {
            self.display.clear_display();
        }

        loader.load(self.clone(), alt_spec_key);
    }

    /// Stops wanting any image, for example when the view is recycled.
    pub fn unbind(&self) {
        {
            let mut binding = self.binding.lock().unwrap();
            binding.uri = None;
            binding.release();
        }
        self.display.clear_display();
    }
}

impl<D: Display> Target for DisplayTarget<D> {
    fn uri(&self) -> Option<String> {
        self.binding.lock().unwrap().uri.clone()
    }

    fn spec_key(&self) -> String {
        self.spec_key.clone()
    }

    fn on_downloading(&self, downloaded: u64, total: Option<u64>) {
        tracing::trace!(downloaded, total, spec = %self.spec_key, "downloading");
    }

    fn on_loaded(&self, buffer: Arc<PixelBuffer>, source: LoadedFrom) {
        {
            let mut binding = self.binding.lock().unwrap();
            let wanted = binding.uri.as_deref();
            if wanted.is_none() || buffer.bound_uri().as_deref() != wanted {
                tracing::trace!(buffer = buffer.id(), "dropping stale image");
                return;
            }
            if binding
                .shown
                .as_ref()
                .is_some_and(|shown| Arc::ptr_eq(shown, &buffer))
            {
                return;
            }

            buffer.acquire();
            binding.release();
            binding.shown = Some(buffer.clone());
        }
        self.display.show_buffer(&buffer, source);
    }

    fn on_failed(&self) {
        let cleared = self.binding.lock().unwrap().release();
        if cleared {
            self.display.clear_display();
        }
    }
}

impl<D> Drop for DisplayTarget<D> {
    fn drop(&mut self) {
        if let Ok(binding) = self.binding.get_mut() {
            binding.release();
        }
    }
}

impl<D: fmt::Debug> fmt::Debug for DisplayTarget<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let binding = self.binding.lock().unwrap();
        f.debug_struct("DisplayTarget")
            .field("display", &self.display)
            .field("spec_key", &self.spec_key)
            .field("uri", &binding.uri)
            .field("shown", &binding.shown.as_ref().map(|b| b.id()))
            .finish()
    }
}
