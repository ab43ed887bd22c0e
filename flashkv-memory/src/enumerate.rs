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

use serde::{Deserialize, Serialize};

use crate::{
    cache::{Cache, SlabGuard},
    entry::{EntryFlags, ObjectKey},
    protocol::CacheState,
};

/// Stateful cursor over all cached objects, bucket by bucket.
///
/// Objects already returned are marked, so the cursor can unlock between calls and pick up where it stopped. Marks
/// are cleared once a bucket is exhausted and when the enumeration ends.
#[derive(Debug)]
pub struct Enumeration<'a> {
    cache: &'a Cache,
    cguid: Option<u64>,
    bucket: usize,
}

impl Cache {
    /// Start enumerating cached objects, optionally only those of one container.
    pub fn start_enumeration(&self, cguid: Option<u64>) -> Enumeration<'_> {
        Enumeration {
            cache: self,
            cguid,
            bucket: 0,
        }
    }
}

impl SlabGuard<'_> {
    fn enumerate_next(&mut self, bucket: usize, cguid: Option<u64>) -> Option<ObjectKey> {
        let next = self.slab.bucket_entries(bucket).into_iter().find(|&i| {
            let meta = self.slab.meta(i);
            !meta.flags.contains(EntryFlags::ENUMERATED) && cguid.is_none_or(|cguid| cguid == meta.header.cguid)
        })?;
        self.slab.set_flags(next, EntryFlags::ENUMERATED, true);
        Some(self.slab.object_key(next))
    }

    fn clear_enumerated(&mut self, bucket: usize) {
        for i in self.slab.bucket_entries(bucket) {
            self.slab.set_flags(i, EntryFlags::ENUMERATED, false);
        }
    }
}

impl Iterator for Enumeration<'_> {
    type Item = ObjectKey;

    fn next(&mut self) -> Option<Self::Item> {
        while self.bucket < self.cache.buckets() {
            let mut guard = self.cache.lock(self.cache.slab_of(self.bucket));
            if let Some(key) = guard.enumerate_next(self.bucket, self.cguid) {
                return Some(key);
            }
            guard.clear_enumerated(self.bucket);
            self.bucket += 1;
        }
        None
    }
}

impl Enumeration<'_> {
    /// End the enumeration and clear the marks of the current bucket.
    pub fn end(self) {}
}

impl Drop for Enumeration<'_> {
    fn drop(&mut self) {
        if self.bucket < self.cache.buckets() {
            let mut guard = self.cache.lock(self.cache.slab_of(self.bucket));
            guard.clear_enumerated(self.bucket);
        }
    }
}

/// A dirty object returned by [`Cache::get_modified_objects`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModifiedObject {
    /// Key of the object.
    pub key: ObjectKey,
    /// Current value.
    pub value: Vec<u8>,
    /// Creation time.
    pub created: u32,
    /// Expiry time, `0` for never.
    pub expiry: u32,
}

/// Resumable position of [`Cache::get_modified_objects`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModifiedCursor {
    bucket: usize,
}

impl ModifiedCursor {
    /// Cursor at the first bucket.
    pub fn new() -> Self {
        Self::default()
    }

    /// Next bucket to scan.
    pub fn bucket(&self) -> usize {
        self.bucket
    }

    /// Rewind to the first bucket.
    pub fn cleanup(&mut self) {
        self.bucket = 0;
    }
}

impl Cache {
    /// Collect dirty objects from the cursor position on, whole buckets at a time, until at least `max` objects are
    /// collected or the table ends. An empty result means the scan is complete.
    pub fn get_modified_objects(&self, cursor: &mut ModifiedCursor, max: usize) -> Vec<ModifiedObject> {
        let mut objects = vec![];
        while cursor.bucket < self.buckets() && objects.len() < max {
            let guard = self.lock(self.slab_of(cursor.bucket));
            for i in guard.slab.bucket_entries(cursor.bucket) {
                if guard.slab.meta(i).state != CacheState::Modified {
                    continue;
                }
                let view = guard.slab.view(i);
                objects.push(ModifiedObject {
                    key: view.key,
                    value: view.value,
                    created: view.created,
                    expiry: view.expiry,
                });
            }
            cursor.bucket += 1;
        }
        objects
    }
}
