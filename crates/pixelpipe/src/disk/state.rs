use std::fs;
use std::io;
use std::path::Path;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use super::fs::catch_not_found;

/// Counters of the disk cache that survive restarts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheState {
    /// When the last scan finished. `None` if the cache was never scanned.
    pub last_scan: Option<SystemTime>,
    /// Running total of bytes in the cache.
    pub total_size: u64,
}

impl CacheState {
    /// Loads the state file, falling back to an empty state if it is missing or corrupt.
    pub fn load(path: &Path) -> Self {
        let bytes = match catch_not_found(|| fs::read(path)) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return Self::default(),
            Err(e) => {
                tracing::warn!(
                    error = &e as &dyn std::error::Error,
                    path = %path.display(),
                    "Failed to read disk cache state"
                );
                return Self::default();
            }
        };

        match serde_json::from_slice(&bytes) {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!(
                    error = &e as &dyn std::error::Error,
                    path = %path.display(),
                    "Discarding malformed disk cache state"
                );
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> io::Result<()> {
        let bytes = serde_json::to_vec(self).map_err(io::Error::other)?;
        fs::write(path, bytes)
    }

    /// Whether a scan is due when the cache grew, given its budget and scan interval.
    pub fn needs_scan(&self, max_size: u64, scan_interval: Duration, now: SystemTime) -> bool {
        let Some(last_scan) = self.last_scan else {
            return true;
        };
        // a clock that went backwards counts as an elapsed interval
        let interval_elapsed = now
            .duration_since(last_scan)
            .map_or(true, |elapsed| elapsed >= scan_interval);
        interval_elapsed || self.total_size > max_size
    }
}
