// Copyright 2026 flashkv Project Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::time::Duration;

use flashkv_common::error::{Error, Result};
use serde::{Deserialize, Serialize};

use crate::{entry::HEADER_SIZE, page::TRAILER_SIZE, protocol::CacheMode};

/// Configuration of an object cache instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Name of the instance, used as the metrics label.
    pub name: String,
    /// Total bytes of the page arena, split evenly across slabs.
    pub size_limit: usize,
    /// Size of one page, trailer included.
    pub page_size: usize,
    /// Requested bucket count. Rounded up to a multiple of `slabs`.
    pub buckets: usize,
    /// Slab count, the lock granularity.
    pub slabs: usize,
    /// Largest accepted key.
    pub max_key_size: usize,
    /// Largest accepted value.
    pub max_object_size: usize,
    /// Write policy.
    pub mode: CacheMode,
    /// Fraction of a slab's capacity allowed to be dirty before writes start flushing.
    pub modified_fraction: f64,
    /// Dirty entries one write may flush to get back under the modified limit.
    pub max_flushes_per_call: usize,
    /// Concurrent bucket flushes of all cache flushes.
    pub flush_tokens: usize,
    /// Concurrent bucket flushes of the background flusher.
    pub background_flush_tokens: usize,
    /// Idle interval of the background flusher after a pass found nothing dirty.
    pub background_sleep: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            name: "flashkv".to_string(),
            size_limit: 64 * 1024 * 1024,
            page_size: 4096,
            buckets: 1 << 16,
            slabs: 16,
            max_key_size: 256,
            max_object_size: 1024 * 1024,
            mode: CacheMode::WriteBack,
            modified_fraction: 0.5,
            max_flushes_per_call: 8,
            flush_tokens: 16,
            background_flush_tokens: 4,
            background_sleep: Duration::from_millis(1000),
        }
    }
}

/// Derived sizes of a validated configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub slabs: usize,
    pub buckets: usize,
    pub buckets_per_slab: usize,
    pub pages_per_slab: usize,
    pub page_size: usize,
}

impl Layout {
    pub fn page_data_size(&self) -> usize {
        self.page_size - TRAILER_SIZE
    }

    pub fn slab_capacity(&self) -> usize {
        self.pages_per_slab * self.page_data_size()
    }
}

/// Check that `fraction` is a usable modified limit.
pub fn validate_modified_fraction(fraction: f64) -> Result<()> {
    if fraction.is_finite() && fraction > 0.0 && fraction <= 1.0 {
        Ok(())
    } else {
        Err(Error::config("modified fraction must be in (0, 1]").with_context("modified_fraction", fraction))
    }
}

impl CacheConfig {
    /// Validate the configuration and compute the slab layout.
    pub fn layout(&self) -> Result<Layout> {
        if self.slabs == 0 {
            return Err(Error::config("slab count must be positive"));
        }
        if self.page_size <= HEADER_SIZE + TRAILER_SIZE || self.page_size % TRAILER_SIZE != 0 {
            return Err(Error::config("page size must be a multiple of 8 larger than the entry header")
                .with_context("page_size", self.page_size));
        }
        if self.max_key_size == 0 {
            return Err(Error::config("max key size must be positive"));
        }
        // Entry headers store both sizes as `u32`.
        if self.max_key_size > u32::MAX as usize || self.max_object_size > u32::MAX as usize {
            return Err(Error::config("max key and object sizes must fit in 32 bits")
                .with_context("max_key_size", self.max_key_size)
                .with_context("max_object_size", self.max_object_size));
        }
        if self.flush_tokens == 0 || self.background_flush_tokens == 0 {
            return Err(Error::config("token pools must not be empty")
                .with_context("flush_tokens", self.flush_tokens)
                .with_context("background_flush_tokens", self.background_flush_tokens));
        }
        validate_modified_fraction(self.modified_fraction)?;

        let buckets_per_slab = self.buckets.max(1).div_ceil(self.slabs);
        let pages_per_slab = self.size_limit / self.page_size / self.slabs;

        let page_data_size = self.page_size - TRAILER_SIZE;
        let max_pages = (HEADER_SIZE + self.max_key_size + self.max_object_size).div_ceil(page_data_size);
        if pages_per_slab < max_pages {
            return Err(Error::config("slab is too small to hold one object of the max size")
                .with_context("pages_per_slab", pages_per_slab)
                .with_context("required", max_pages));
        }

        Ok(Layout {
            slabs: self.slabs,
            buckets: buckets_per_slab * self.slabs,
            buckets_per_slab,
            pages_per_slab,
            page_size: self.page_size,
        })
    }
}
