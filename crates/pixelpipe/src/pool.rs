//! The in-memory tier: decoded pixel buffers bucketed by [`Spec`].
//!
//! Each bucket holds the buffers of one spec in insertion order. Buckets are expected to
//! stay small, they contain one buffer per distinct live uri of a spec, so every
//! operation is a linear scan under a single mutex.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use crate::buffer::PixelBuffer;
use crate::metric;
use crate::spec::Spec;
use crate::stats::{Stats, bump};

/// How hard the pool should shed idle buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrimLevel {
    /// Memory is getting scarce, keep a few idle buffers per spec.
    Moderate,
    /// Memory is low, keep a single idle buffer per spec.
    Low,
    /// Drop every idle buffer.
    Complete,
}

impl TrimLevel {
    /// Number of idle buffers per bucket that survive a trim at this level.
    pub fn grace(self) -> usize {
        match self {
            Self::Moderate => 2,
            Self::Low => 1,
            Self::Complete => 0,
        }
    }
}

type Bucket = VecDeque<Arc<PixelBuffer>>;

/// Holds idle and in-use pixel buffers and serves reuse requests.
#[derive(Debug)]
pub struct BufferPool {
    buckets: Mutex<HashMap<Spec, Bucket>>,
    unbounded_grace: usize,
    stats: Arc<Stats>,
}

impl BufferPool {
    pub fn new(unbounded_grace: usize, stats: Arc<Stats>) -> Self {
        Self {
            buckets: Default::default(),
            unbounded_grace,
            stats,
        }
    }

    /// Looks up the buffer currently holding `uri`, first for `spec`, then for `alt_spec`.
    ///
    /// A found buffer is moved to the tail of its bucket. It is not marked as in use.
    pub fn get(
        &self,
        uri: &str,
        spec: &Spec,
        alt_spec: Option<&Spec>,
    ) -> Option<Arc<PixelBuffer>> {
        let mut buckets = self.buckets.lock().unwrap();

        let found = std::iter::once(spec)
            .chain(alt_spec)
            .find_map(|spec| take_bound(buckets.get_mut(spec)?, uri));

        match found {
            Some(buffer) => {
                let bucket = buckets.entry(buffer.spec().clone()).or_default();
                bucket.push_back(buffer.clone());
                drop(buckets);

                bump(&self.stats.memory_hit);
                metric!(counter("pool.hit") += 1, "exact" => if buffer.spec() == spec { "true" } else { "false" });
                Some(buffer)
            }
            None => {
                drop(buckets);
                bump(&self.stats.memory_miss);
                metric!(counter("pool.miss") += 1);
                None
            }
        }
    }

    /// Inserts a buffer at the head of its spec's bucket.
    ///
    /// Inserting a buffer that is already pooled moves it to the head instead.
    pub fn set(&self, buffer: Arc<PixelBuffer>) {
        let mut buckets = self.buckets.lock().unwrap();
        let bucket = buckets.entry(buffer.spec().clone()).or_default();
        bucket.retain(|b| !Arc::ptr_eq(b, &buffer));
        bucket.push_front(buffer);
    }

    /// Claims an idle buffer of `spec` as the target of a decode.
    ///
    /// The claimed buffer leaves its bucket and is flagged as `in_decode_use` until
    /// the decode either finishes or the buffer is given back with
    /// [`return_unused`](Self::return_unused).
    ///
    /// Buffers of unbounded specs are never handed out. Instead, idle buffers beyond the
    /// configured grace window are reclaimed.
    pub fn get_unused(&self, spec: &Spec) -> Option<Arc<PixelBuffer>> {
        let mut buckets = self.buckets.lock().unwrap();
        let bucket = buckets.get_mut(spec)?;

        if !spec.size_bounded() {
            let thrown = reclaim(bucket, self.unbounded_grace);
            drop(buckets);
            self.record_thrown(thrown);
            return None;
        }

        let index = bucket.iter().position(|b| b.is_idle())?;
        let buffer = bucket.remove(index)?;
        buffer.set_in_decode_use(true);
        drop(buckets);

        bump(&self.stats.memory_reuse);
        metric!(counter("pool.reuse") += 1);
        Some(buffer)
    }

    /// Gives back a buffer claimed with [`get_unused`](Self::get_unused) that the decode
    /// could not use.
    ///
    /// The buffer goes back to the head of its bucket, or is closed if the bucket was
    /// trimmed away in the meantime.
    pub fn return_unused(&self, buffer: Arc<PixelBuffer>) {
        buffer.set_in_decode_use(false);

        let mut buckets = self.buckets.lock().unwrap();
        match buckets.get_mut(buffer.spec()) {
            Some(bucket) => {
                bucket.retain(|b| !Arc::ptr_eq(b, &buffer));
                bucket.push_front(buffer);
                drop(buckets);
                bump(&self.stats.memory_returned);
                metric!(counter("pool.returned") += 1);
            }
            None => {
                drop(buckets);
                buffer.close();
                self.record_thrown(1);
            }
        }
    }

    /// Reclaims idle buffers, keeping [`TrimLevel::grace`] idle buffers per spec.
    ///
    /// Buffers that are in use are never touched.
    pub fn on_trim_memory(&self, level: TrimLevel) {
        let grace = level.grace();
        let mut buckets = self.buckets.lock().unwrap();
        let mut thrown = 0;
        for bucket in buckets.values_mut() {
            thrown += reclaim(bucket, grace);
        }
        buckets.retain(|_, bucket| !bucket.is_empty());
        drop(buckets);

        tracing::debug!(?level, thrown, "trimmed buffer pool");
        self.record_thrown(thrown);
    }

    /// Reclaims every idle buffer.
    pub fn clear(&self) {
        self.on_trim_memory(TrimLevel::Complete);
    }

    /// Number of buffers currently pooled for `spec`.
    pub fn bucket_len(&self, spec: &Spec) -> usize {
        let buckets = self.buckets.lock().unwrap();
        buckets.get(spec).map_or(0, |b| b.len())
    }

    /// Total number of pooled buffers.
    pub fn len(&self) -> usize {
        let buckets = self.buckets.lock().unwrap();
        buckets.values().map(|b| b.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn record_thrown(&self, thrown: usize) {
        if thrown > 0 {
            self.stats
                .memory_thrown
                .fetch_add(thrown as u64, std::sync::atomic::Ordering::Relaxed);
            metric!(counter("pool.thrown") += thrown as i64);
        }
    }
}

/// Removes and returns the live buffer bound to `uri`.
fn take_bound(bucket: &mut Bucket, uri: &str) -> Option<Arc<PixelBuffer>> {
    let index = bucket
        .iter()
        .position(|b| !b.is_closed() && b.is_bound_to(uri))?;
    bucket.remove(index)
}

/// Closes idle buffers beyond the first `grace` idle ones, counting from the most
/// recently used end of the bucket. Returns the number of closed buffers.
fn reclaim(bucket: &mut Bucket, grace: usize) -> usize {
    let mut idle_seen = 0;
    let mut thrown = 0;
    let mut kept = VecDeque::with_capacity(bucket.len());

    while let Some(buffer) = bucket.pop_back() {
        if buffer.is_closed() {
            continue;
        }
        if buffer.is_idle() {
            idle_seen += 1;
            if idle_seen > grace {
                buffer.close();
                thrown += 1;
                continue;
            }
        }
        kept.push_front(buffer);
    }

    *bucket = kept;
    thrown
}
