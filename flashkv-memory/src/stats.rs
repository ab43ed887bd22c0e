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

use flashkv_common::error::{Error, ErrorKind, Result};
use serde::{Deserialize, Serialize};

use crate::{cache::Cache, slab::SlabCounters};

/// Statistics of one slab.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlabStats {
    /// Slab index.
    pub index: usize,
    /// Page count.
    pub pages: usize,
    /// Free page count.
    pub free_pages: usize,
    /// Running counters.
    pub counters: SlabCounters,
}

/// Statistics of a cache instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Counters summed over all slabs.
    pub total: SlabCounters,
    /// Page count of all slabs.
    pub pages: usize,
    /// Free pages of all slabs.
    pub free_pages: usize,
    /// Remote requests queued and not applied yet.
    pub pending_remote_requests: usize,
    /// Size of the flush token pool.
    pub flush_tokens: usize,
    /// Size of the background flush token pool.
    pub background_flush_tokens: usize,
    /// Per-slab statistics.
    pub slabs: Vec<SlabStats>,
}

impl std::ops::AddAssign<&SlabCounters> for SlabCounters {
    fn add_assign(&mut self, rhs: &SlabCounters) {
        self.objects += rhs.objects;
        self.bytes_w_keys += rhs.bytes_w_keys;
        self.bytes_wo_keys += rhs.bytes_wo_keys;
        self.modified_objects += rhs.modified_objects;
        self.modsize_w_keys += rhs.modsize_w_keys;
        self.modsize_wo_keys += rhs.modsize_wo_keys;
        self.evictions += rhs.evictions;
        self.writebacks += rhs.writebacks;
        self.flushes += rhs.flushes;
        self.background_flushes += rhs.background_flushes;
        self.modified_limit_flushes += rhs.modified_limit_flushes;
    }
}

impl Cache {
    /// Collect statistics, locking each slab in turn.
    pub fn stats(&self) -> CacheStats {
        let mut stats = CacheStats {
            flush_tokens: self.inner.flush_tokens.size(),
            background_flush_tokens: self.inner.background_flush_tokens.size(),
            ..Default::default()
        };
        for slab in 0..self.slabs() {
            let guard = self.lock(slab);
            let s = SlabStats {
                index: slab,
                pages: guard.slab.arena().pages(),
                free_pages: guard.slab.arena().free_pages(),
                counters: *guard.slab.counters(),
            };
            drop(guard);

            stats.total += &s.counters;
            stats.pages += s.pages;
            stats.free_pages += s.free_pages;
            stats.slabs.push(s);
        }
        stats.pending_remote_requests = self.pending_remote_requests();
        stats
    }

    /// Audit the slab owning `bucket`.
    ///
    /// On failure the offending list is logged and [`ErrorKind::Corrupted`] is returned.
    pub fn check_heap(&self, bucket: usize) -> Result<()> {
        if bucket >= self.buckets() {
            return Err(Error::new(ErrorKind::Invalid, "bucket out of range")
                .with_context("bucket", bucket)
                .with_context("buckets", self.buckets()));
        }
        self.lock(self.slab_of(bucket)).check()
    }
}
