#![forbid(unsafe_code)]
//! Shared identifiers, extents, and configuration for obcache.
//!
//! Defines the newtypes used across the workspace, the object-extent
//! description produced by striping, the `SharedBuf` read target, and the
//! validated cache configuration.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Dense identifier of a registered image. Slots are never renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ImageId(pub u16);

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Index of a page descriptor in the cache's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PageId(pub u32);

/// Index of a physical page frame inside the region slabs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FrameId(pub u32);

/// Snapshot identifier passed through to the object backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SnapId(pub u64);

impl SnapId {
    pub const HEAD: SnapId = SnapId(u64::MAX);
}

/// Snapshot context attached to every object write.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapContext {
    pub seq: u64,
    pub snaps: Vec<SnapId>,
}

/// Name of a backend object.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectName(pub String);

impl fmt::Display for ObjectName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One object-aligned piece of an image byte range, carrying the pages that
/// back it.
///
/// `pages` holds `(object_offset, page)` pairs in ascending object offset,
/// one per page, covering `[offset, offset + length)` without gaps.
#[derive(Debug, Clone)]
pub struct ObjectExtent {
    pub oid: ObjectName,
    pub object_no: u64,
    /// Byte offset of this extent within the object.
    pub offset: u64,
    /// Extent length in bytes (a multiple of the page size).
    pub length: u64,
    pub pages: Vec<(u64, PageId)>,
}

/// Shared destination buffer for an asynchronous read.
///
/// The cache fills slices of it from hit pages and from backend completions
/// running on arbitrary threads, so the storage sits behind a mutex. The
/// caller reads it back after its completion fired.
#[derive(Debug, Clone)]
pub struct SharedBuf {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl SharedBuf {
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(vec![0_u8; len])),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Copy `src` into the buffer at `offset`, clamped to the buffer end.
    pub fn copy_in(&self, offset: usize, src: &[u8]) {
        let mut guard = self.inner.lock();
        let end = offset.saturating_add(src.len()).min(guard.len());
        if offset < end {
            let n = end - offset;
            guard[offset..end].copy_from_slice(&src[..n]);
        }
    }

    /// Zero `len` bytes starting at `offset`, clamped to the buffer end.
    pub fn fill_zero(&self, offset: usize, len: usize) {
        let mut guard = self.inner.lock();
        let end = offset.saturating_add(len).min(guard.len());
        if offset < end {
            guard[offset..end].fill(0);
        }
    }

    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        self.inner.lock().clone()
    }
}

/// Configuration error raised by [`CacheConfig::validate`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
}

/// Cache sizing and writeback policy knobs.
///
/// All byte values are converted to page counts once at validation; the
/// derived counts are what the cache actually runs on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Total bytes of page buffers the cache may own.
    pub cache_bytes: u64,
    /// Page size in bytes; power of two.
    pub page_bytes: u64,
    /// Maximum pages claimed per region growth.
    pub region_pages: u32,
    /// Dirty bytes above which the flusher starts writing back.
    pub target_dirty_bytes: u64,
    /// Dirty bytes above which writers wait on the flusher; 0 means
    /// writethrough.
    pub max_dirty_bytes: u64,
    /// Oldest age a dirty page may reach before a full writeback.
    pub max_dirty_age: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_bytes: 32 << 20,
            page_bytes: 4096,
            region_pages: 1024,
            target_dirty_bytes: 8 << 20,
            max_dirty_bytes: 16 << 20,
            max_dirty_age: Duration::from_secs(5),
        }
    }
}

impl CacheConfig {
    /// Check field consistency and return the derived page counts.
    pub fn validate(&self) -> Result<CacheShape, ConfigError> {
        if self.page_bytes == 0 || !self.page_bytes.is_power_of_two() {
            return Err(ConfigError::InvalidField {
                field: "page_bytes",
                reason: "must be a power of two",
            });
        }
        if self.cache_bytes < self.page_bytes {
            return Err(ConfigError::InvalidField {
                field: "cache_bytes",
                reason: "must hold at least one page",
            });
        }
        if self.region_pages == 0 {
            return Err(ConfigError::InvalidField {
                field: "region_pages",
                reason: "must be > 0",
            });
        }
        if self.max_dirty_bytes > self.cache_bytes {
            return Err(ConfigError::InvalidField {
                field: "max_dirty_bytes",
                reason: "must not exceed cache_bytes",
            });
        }
        if self.target_dirty_bytes > self.max_dirty_bytes {
            return Err(ConfigError::InvalidField {
                field: "target_dirty_bytes",
                reason: "must not exceed max_dirty_bytes",
            });
        }
        let data_pages = u32::try_from(self.cache_bytes / self.page_bytes).map_err(|_| {
            ConfigError::InvalidField {
                field: "cache_bytes",
                reason: "page count does not fit u32",
            }
        })?;
        Ok(CacheShape {
            data_pages,
            page_bytes: self.page_bytes,
            region_pages: self.region_pages.min(data_pages),
            target_pages: (self.target_dirty_bytes / self.page_bytes) as u32,
            max_dirty_pages: (self.max_dirty_bytes / self.page_bytes) as u32,
            max_dirty_age: self.max_dirty_age,
        })
    }
}

/// Derived page-count view of a validated [`CacheConfig`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheShape {
    pub data_pages: u32,
    pub page_bytes: u64,
    pub region_pages: u32,
    pub target_pages: u32,
    pub max_dirty_pages: u32,
    pub max_dirty_age: Duration,
}
