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

use std::{fmt::Write, ops::Range, sync::Arc};

use flashkv_common::{
    error::{Error, ErrorKind, Result},
    metrics::Metrics,
};
use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::{
    backend::Backend,
    entry::{EntryFlags, EntryHeader, EntryMeta, EntryRef, EntryView, ObjectKey, HEADER_SIZE},
    list::{IndexList, Link, Nodes, LRU, MODLRU},
    page::PageArena,
    protocol::CacheState,
};

/// Longest rendering of one entry in a diagnostic dump.
const DESCRIBE_MAX_LEN: usize = 256;

/// Running counters of one slab.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlabCounters {
    /// Resident objects.
    pub objects: usize,
    /// Key and value bytes of resident objects.
    pub bytes_w_keys: usize,
    /// Value bytes of resident objects.
    pub bytes_wo_keys: usize,
    /// Resident objects in the `Modified` state.
    pub modified_objects: usize,
    /// Key and value bytes of modified objects.
    pub modsize_w_keys: usize,
    /// Value bytes of modified objects.
    pub modsize_wo_keys: usize,
    /// Objects evicted to make room.
    pub evictions: usize,
    /// Modified objects written back on eviction.
    pub writebacks: usize,
    /// Modified objects persisted by explicit flushes.
    pub flushes: usize,
    /// Modified objects persisted by background flushes.
    pub background_flushes: usize,
    /// Modified objects persisted to respect the modified limit.
    pub modified_limit_flushes: usize,
}

static UNLINKED: Link = Link {
    prev: None,
    next: None,
    is_linked: false,
};

/// Entry metadata indexed by head page.
#[derive(Debug)]
pub struct EntryTable(Vec<Option<EntryMeta>>);

impl EntryTable {
    fn get(&self, index: usize) -> Option<&EntryMeta> {
        self.0.get(index).and_then(|meta| meta.as_ref())
    }

    fn get_mut(&mut self, index: usize) -> Option<&mut EntryMeta> {
        self.0.get_mut(index).and_then(|meta| meta.as_mut())
    }

    /// Metadata of a live entry. Indices held by the slab always refer to live entries.
    fn live(&self, index: usize) -> &EntryMeta {
        match self.get(index) {
            Some(meta) => meta,
            None => panic!("no entry at page {index}"),
        }
    }

    fn live_mut(&mut self, index: usize) -> &mut EntryMeta {
        match self.get_mut(index) {
            Some(meta) => meta,
            None => panic!("no entry at page {index}"),
        }
    }
}

// A missing node reads as unlinked, so walks over a corrupted list terminate instead of panicking.
impl Nodes<LRU> for EntryTable {
    fn link(&self, index: usize) -> &Link {
        self.get(index).map(|meta| &meta.lru).unwrap_or(&UNLINKED)
    }

    fn link_mut(&mut self, index: usize) -> &mut Link {
        &mut self.live_mut(index).lru
    }
}

impl Nodes<MODLRU> for EntryTable {
    fn link(&self, index: usize) -> &Link {
        self.get(index).map(|meta| &meta.modlru).unwrap_or(&UNLINKED)
    }

    fn link_mut(&mut self, index: usize) -> &mut Link {
        &mut self.live_mut(index).modlru
    }
}

/// A partition of the cache: a page run, the buckets it owns, eviction lists and counters.
///
/// Every method requires exclusive access, which the slab lock provides.
pub struct Slab {
    index: usize,
    arena: PageArena,
    table: EntryTable,

    bucket_base: usize,
    buckets: Vec<Option<usize>>,

    lru: IndexList<LRU>,
    modlru: IndexList<MODLRU>,
    transients: Vec<usize>,

    counters: SlabCounters,
    next_generation: u64,

    backend: Arc<dyn Backend>,
    metrics: Arc<Metrics>,
}

impl std::fmt::Debug for Slab {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Slab")
            .field("index", &self.index)
            .field("arena", &self.arena)
            .field("buckets", &self.bucket_range())
            .field("counters", &self.counters)
            .finish()
    }
}

impl Slab {
    pub fn new(
        index: usize,
        arena: PageArena,
        buckets: Range<usize>,
        backend: Arc<dyn Backend>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let pages = arena.pages();
        Self {
            index,
            arena,
            table: EntryTable((0..pages).map(|_| None).collect()),
            bucket_base: buckets.start,
            buckets: vec![None; buckets.len()],
            lru: IndexList::new(),
            modlru: IndexList::new(),
            transients: vec![],
            counters: SlabCounters::default(),
            next_generation: 0,
            backend,
            metrics,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn counters(&self) -> &SlabCounters {
        &self.counters
    }

    pub fn counters_mut(&mut self) -> &mut SlabCounters {
        &mut self.counters
    }

    pub fn arena(&self) -> &PageArena {
        &self.arena
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn bucket_range(&self) -> Range<usize> {
        self.bucket_base..self.bucket_base + self.buckets.len()
    }

    pub fn transients(&self) -> usize {
        self.transients.len()
    }

    /// Bytes that fit in the page run, excluding trailers.
    pub fn capacity(&self) -> usize {
        self.arena.pages() * self.arena.page_data_size()
    }

    pub fn meta(&self, index: usize) -> &EntryMeta {
        self.table.live(index)
    }

    fn meta_mut(&mut self, index: usize) -> &mut EntryMeta {
        self.table.live_mut(index)
    }

    /// Resolve a handle, rejecting handles of entries that no longer exist.
    pub fn resolve(&self, entry: EntryRef) -> Result<usize> {
        match self.table.get(entry.page) {
            Some(meta) if entry.slab == self.index && meta.generation == entry.generation => Ok(entry.page),
            _ => Err(Error::new(ErrorKind::Stale, "entry no longer exists")
                .with_context("slab", entry.slab)
                .with_context("page", entry.page)),
        }
    }

    pub fn entry_ref(&self, index: usize) -> EntryRef {
        EntryRef {
            slab: self.index,
            page: index,
            generation: self.meta(index).generation,
        }
    }

    /// Head of the chain of `bucket`.
    pub fn bucket_head(&self, bucket: usize) -> Option<usize> {
        self.buckets[bucket - self.bucket_base]
    }

    /// Entries of `bucket`, in chain order.
    pub fn bucket_entries(&self, bucket: usize) -> Vec<usize> {
        std::iter::successors(self.bucket_head(bucket), |&i| self.meta(i).next_in_bucket)
            .take(self.arena.pages())
            .collect()
    }

    /// Find the resident entry of `key` in `bucket`.
    pub fn lookup(&self, bucket: usize, key: &ObjectKey) -> Option<usize> {
        let syndrome = key.syndrome();
        self.bucket_entries(bucket).into_iter().find(|&i| {
            let meta = self.meta(i);
            meta.header.syndrome == syndrome
                && meta.header.cguid == key.cguid
                && meta.kind == key.kind
                && meta.key_len() == key.key.len()
                && self.read_key(i) == key.key
        })
    }

    pub fn read_key(&self, index: usize) -> Vec<u8> {
        let mut key = vec![0; self.meta(index).key_len()];
        self.arena.read(index, HEADER_SIZE, &mut key);
        key
    }

    pub fn read_value(&self, index: usize) -> Vec<u8> {
        let meta = self.meta(index);
        let mut value = vec![0; meta.obj_size()];
        self.arena.read(index, HEADER_SIZE + meta.key_len(), &mut value);
        value
    }

    pub fn write_value(&mut self, index: usize, offset: usize, data: &[u8]) {
        let key_len = self.meta(index).key_len();
        self.arena.write(index, HEADER_SIZE + key_len + offset, data);
    }

    pub fn object_key(&self, index: usize) -> ObjectKey {
        let meta = self.meta(index);
        ObjectKey::new(meta.header.cguid, meta.kind, self.read_key(index))
    }

    pub fn view(&self, index: usize) -> EntryView {
        let meta = self.meta(index);
        EntryView {
            key: self.object_key(index),
            value: self.read_value(index),
            state: meta.state,
            created: meta.header.created,
            expiry: meta.header.expiry,
        }
    }

    fn write_header(&mut self, index: usize) {
        let mut buf = [0u8; HEADER_SIZE];
        self.meta(index).header.write(&mut buf);
        self.arena.write(index, 0, &buf);
    }

    pub fn set_expiry(&mut self, index: usize, expiry: u32) {
        self.meta_mut(index).header.expiry = expiry;
        self.write_header(index);
    }

    /// Pop a chain of `pages` pages, evicting from the LRU tail while the free list is short.
    pub fn allocate(&mut self, pages: usize) -> Result<usize> {
        self.reserve(pages, None)?;
        self.pop_reserved(pages)
    }

    /// Evict from the LRU tail until `pages` pages are free. `keep` is never chosen as a victim.
    ///
    /// Evicted entries stay evicted if the reservation fails, nothing else changes.
    fn reserve(&mut self, pages: usize, keep: Option<usize>) -> Result<()> {
        while self.arena.free_pages() < pages {
            if !self.evict_tail(keep)? {
                return Err(Error::no_space(self.index, self.arena.pages(), pages)
                    .with_context("free", self.arena.free_pages()));
            }
        }
        Ok(())
    }

    fn pop_reserved(&mut self, pages: usize) -> Result<usize> {
        self.arena.pop_chain(pages).ok_or_else(|| {
            Error::no_space(self.index, self.arena.pages(), pages).with_context("free", self.arena.free_pages())
        })
    }

    /// Evict the least recently used entry other than `keep`. A dirty victim is written back first.
    ///
    /// Returns `false` if there is no such entry.
    fn evict_tail(&mut self, keep: Option<usize>) -> Result<bool> {
        let victim = self
            .lru
            .iter_rev(&self.table, self.arena.pages())
            .find(|&i| Some(i) != keep);
        let Some(victim) = victim else {
            return Ok(false);
        };

        if self.meta(victim).state == CacheState::Modified {
            let view = self.view(victim);
            self.backend.write_back(&view)?;
            self.counters.writebacks += 1;
            self.metrics.cache_writeback.increase(1);
        }

        tracing::trace!("[slab]: slab {} evicts entry at page {victim}", self.index);

        let freed = self.remove(victim)?;
        self.counters.evictions += 1;
        self.metrics.cache_evict.increase(1);
        debug_assert!(freed > 0);
        Ok(true)
    }

    /// Allocate a transient entry holding only the key. It is not linked anywhere until promoted.
    pub fn insert_transient(&mut self, bucket: usize, key: &ObjectKey, now: u32) -> Result<usize> {
        let header = EntryHeader {
            key_len: key.key.len() as u32,
            obj_size: 0,
            cguid: key.cguid,
            syndrome: key.syndrome(),
            created: now,
            expiry: 0,
            kind: key.kind.into(),
        };
        let pages = self.arena.pages_for(header.footprint());
        let head = self.allocate(pages)?;

        self.install(head, pages, header, key, bucket, EntryFlags::TRANSIENT);
        self.arena.write(head, HEADER_SIZE, &key.key);
        self.transients.push(head);
        Ok(head)
    }

    fn install(
        &mut self,
        head: usize,
        pages: usize,
        header: EntryHeader,
        key: &ObjectKey,
        bucket: usize,
        flags: EntryFlags,
    ) {
        self.next_generation += 1;
        self.table.0[head] = Some(EntryMeta {
            generation: self.next_generation,
            state: CacheState::Invalid,
            flags,
            header,
            kind: key.kind,
            bucket,
            next_in_bucket: None,
            lru: Link::default(),
            modlru: Link::default(),
            pages,
        });
        self.write_header(head);
    }

    /// Replace the chain of an entry with one sized for `obj_size` bytes of value.
    ///
    /// The key, flags, timestamps and the value prefix that still fits are kept. A transient entry stays transient, a
    /// resident entry is relinked at the head of its lists with its state preserved. Returns the new head page.
    ///
    /// Pages for the new chain are reserved before the entry is detached, so on failure the entry is left as it was.
    pub fn reshape(&mut self, index: usize, obj_size: usize) -> Result<usize> {
        let meta = self.meta(index).clone();
        let header = EntryHeader {
            obj_size: obj_size as u32,
            ..meta.header
        };
        let pages = self.arena.pages_for(header.footprint());
        self.reserve(pages.saturating_sub(meta.pages), Some(index))?;

        let key = self.object_key(index);
        let mut value = self.read_value(index);
        value.truncate(obj_size);

        let transient = meta.is_transient();
        self.remove(index)?;
        let head = self.pop_reserved(pages)?;

        self.install(head, pages, header, &key, meta.bucket, meta.flags);
        self.arena.write(head, HEADER_SIZE, &key.key);
        self.write_value(head, 0, &value);

        if transient {
            self.transients.push(head);
        } else {
            self.meta_mut(head).flags.remove(EntryFlags::TRANSIENT);
            self.link(head);
            self.set_state(head, meta.state);
        }
        Ok(head)
    }

    /// Link a transient entry into its bucket and the LRU head.
    pub fn promote(&mut self, index: usize) {
        debug_assert!(self.meta(index).is_transient());
        self.transients.retain(|&t| t != index);
        self.meta_mut(index).flags.remove(EntryFlags::TRANSIENT);
        self.link(index);
    }

    fn link(&mut self, index: usize) {
        let meta = self.meta(index);
        let slot = meta.bucket - self.bucket_base;
        let (w_key, wo_key) = (meta.size_w_key(), meta.obj_size());

        let head = self.buckets[slot];
        self.meta_mut(index).next_in_bucket = head;
        self.buckets[slot] = Some(index);

        self.lru.push_front(&mut self.table, index);

        self.counters.objects += 1;
        self.counters.bytes_w_keys += w_key;
        self.counters.bytes_wo_keys += wo_key;
        self.metrics.cache_usage.increase(w_key as _);
    }

    fn unlink(&mut self, index: usize) -> Result<()> {
        let meta = self.meta(index);
        let (bucket, next) = (meta.bucket, meta.next_in_bucket);
        let slot = bucket - self.bucket_base;

        let prev = if self.buckets[slot] == Some(index) {
            None
        } else {
            let entries = self.bucket_entries(bucket);
            let prev = entries.iter().copied().find(|&i| self.meta(i).next_in_bucket == Some(index));
            if prev.is_none() {
                return Err(self.corrupted(format!("entry at page {index} not found in bucket {bucket}"), &entries));
            }
            prev
        };
        match prev {
            Some(prev) => self.meta_mut(prev).next_in_bucket = next,
            None => self.buckets[slot] = next,
        }

        self.set_state(index, CacheState::Invalid);
        self.lru.remove(&mut self.table, index);
        self.meta_mut(index).next_in_bucket = None;

        let meta = self.meta(index);
        let (w_key, wo_key) = (meta.size_w_key(), meta.obj_size());
        self.counters.objects -= 1;
        self.counters.bytes_w_keys -= w_key;
        self.counters.bytes_wo_keys -= wo_key;
        self.metrics.cache_usage.decrease(w_key as _);
        Ok(())
    }

    /// Remove an entry, resident or transient, and return its pages to the free list.
    ///
    /// Returns the number of pages freed. Fails with [`ErrorKind::Corrupted`] if a resident entry is missing from its
    /// own bucket chain, the entry is left in place then.
    pub fn remove(&mut self, index: usize) -> Result<usize> {
        if self.meta(index).is_transient() {
            self.transients.retain(|&t| t != index);
        } else {
            self.unlink(index)?;
        }
        Ok(self.free_entry(index))
    }

    fn free_entry(&mut self, index: usize) -> usize {
        self.table.0[index] = None;
        self.arena.free_chain(index)
    }

    /// Free every transient entry.
    pub fn release_transients(&mut self) -> usize {
        let transients = std::mem::take(&mut self.transients);
        transients.into_iter().map(|t| self.free_entry(t)).sum()
    }

    /// Set the coherency state, keeping the modified list and its counters in step.
    pub fn set_state(&mut self, index: usize, state: CacheState) {
        let meta = self.meta(index);
        let old = meta.state;
        let (w_key, wo_key) = (meta.size_w_key(), meta.obj_size());
        let resident = !meta.is_transient();
        self.meta_mut(index).state = state;

        if !resident || old == state {
            return;
        }
        if old == CacheState::Modified {
            self.modlru.remove(&mut self.table, index);
            self.counters.modified_objects -= 1;
            self.counters.modsize_w_keys -= w_key;
            self.counters.modsize_wo_keys -= wo_key;
            self.metrics.cache_modified_usage.decrease(w_key as _);
        }
        if state == CacheState::Modified {
            self.modlru.push_front(&mut self.table, index);
            self.counters.modified_objects += 1;
            self.counters.modsize_w_keys += w_key;
            self.counters.modsize_wo_keys += wo_key;
            self.metrics.cache_modified_usage.increase(w_key as _);
        }
    }

    /// Move a resident entry to the head of the LRU list, and of the modified list if it is dirty.
    pub fn touch(&mut self, index: usize) {
        self.lru.move_to_front(&mut self.table, index);
        if self.meta(index).state == CacheState::Modified {
            self.modlru.move_to_front(&mut self.table, index);
        }
    }

    pub fn set_flags(&mut self, index: usize, flags: EntryFlags, set: bool) {
        self.meta_mut(index).flags.set(flags, set);
    }

    /// Persist dirty entries from the modified tail until the dirty bytes fit in `limit` or `max_flushes` entries
    /// have been flushed.
    ///
    /// Returns the number of entries flushed.
    pub fn enforce_modified_limit(&mut self, limit: usize, max_flushes: usize) -> Result<usize> {
        let mut flushed = 0;
        while self.counters.modsize_w_keys > limit && flushed < max_flushes {
            let Some(tail) = self.modlru.tail() else {
                break;
            };
            let view = self.view(tail);
            self.backend.write_back(&view)?;
            self.set_state(tail, CacheState::Shared);
            self.counters.modified_limit_flushes += 1;
            self.metrics.cache_modified_limit_flush.increase(1);
            flushed += 1;
        }
        if flushed > 0 {
            tracing::trace!(
                "[slab]: slab {} flushed {flushed} entries over the modified limit {limit}",
                self.index
            );
        }
        Ok(flushed)
    }

    /// Resident entries, most recently used first.
    pub fn lru_entries(&self) -> Vec<usize> {
        self.lru.iter(&self.table, self.arena.pages()).collect()
    }

    /// Modified entries, most recently used first.
    pub fn modified_entries(&self) -> Vec<usize> {
        self.modlru.iter(&self.table, self.arena.pages()).collect()
    }

    /// Remove every entry without persisting anything.
    pub fn clear(&mut self) -> Result<usize> {
        let mut freed = self.release_transients();
        while let Some(tail) = self.lru.tail() {
            freed += self.remove(tail)?;
        }
        Ok(freed)
    }

    fn describe(&self, index: usize) -> String {
        match self.table.get(index) {
            Some(meta) if self.arena.chain_len(index) == Some(meta.pages) => {
                format!("page {index}: {}", self.backend.describe(&self.view(index), DESCRIBE_MAX_LEN))
            }
            Some(meta) => format!("page {index}: <broken chain of {} pages>", meta.pages),
            None => format!("page {index}: <missing>"),
        }
    }

    /// Render a list of entries for a diagnostic dump.
    pub fn dump(&self, entries: &[usize]) -> String {
        let mut out = String::new();
        for &i in entries {
            let _ = writeln!(out, "  {}", self.describe(i));
        }
        out
    }

    fn corrupted(&self, what: impl Into<String>, entries: &[usize]) -> Error {
        let what = what.into();
        tracing::error!(
            "[slab]: heap check of slab {} failed, {what}, counters: {:?}\n{}",
            self.index,
            self.counters,
            self.dump(entries)
        );
        Error::new(ErrorKind::Corrupted, what).with_context("slab", self.index)
    }

    /// Audit page accounting, both eviction lists, the bucket chains and every page chain of the slab.
    pub fn check(&self) -> Result<()> {
        let pages = self.arena.pages();
        let mut owned = vec![false; pages];
        let mut claim = |page: usize| -> bool {
            if page >= pages || owned[page] {
                return false;
            }
            owned[page] = true;
            true
        };

        let free = self.arena.free_list().collect_vec();
        if free.len() != self.arena.free_pages() || !free.iter().all(|&p| claim(p)) {
            return Err(self.corrupted(
                format!("free list holds {} pages, {} expected", free.len(), self.arena.free_pages()),
                &[],
            ));
        }

        let forward = self.lru.iter(&self.table, pages + 1).collect_vec();
        let mut backward = self.lru.iter_rev(&self.table, pages + 1).collect_vec();
        backward.reverse();
        if forward.len() != self.counters.objects
            || forward.len() != self.lru.len()
            || forward.last().copied() != self.lru.tail()
            || forward != backward
        {
            return Err(self.corrupted(
                format!(
                    "lru walk reached {} entries, {} objects counted",
                    forward.len(),
                    self.counters.objects
                ),
                &forward,
            ));
        }

        let mut counters = SlabCounters::default();
        for &i in forward.iter() {
            let Some(meta) = self.table.get(i) else {
                return Err(self.corrupted(format!("lru links missing entry at page {i}"), &forward));
            };
            if meta.is_transient() || meta.state == CacheState::Bad {
                return Err(self.corrupted(format!("lru links entry at page {i} in {:?}", meta.state), &forward));
            }
            if self.arena.chain_len(i) != Some(meta.pages) || self.arena.pages_for(meta.header.footprint()) != meta.pages
            {
                return Err(self.corrupted(format!("page chain of entry at page {i} has a wrong length"), &[i]));
            }
            if !self.arena.chain(i).all(&mut claim) {
                return Err(self.corrupted(format!("pages of entry at page {i} are shared"), &[i]));
            }
            let mut raw = [0u8; HEADER_SIZE];
            self.arena.read(i, 0, &mut raw);
            if EntryHeader::read(&raw) != meta.header {
                return Err(self.corrupted(format!("header of entry at page {i} mismatches"), &[i]));
            }
            let modified = meta.state == CacheState::Modified;
            if modified != meta.modlru.is_linked {
                return Err(self.corrupted(
                    format!("entry at page {i} in {:?} has modified link {}", meta.state, meta.modlru.is_linked),
                    &self.modified_entries(),
                ));
            }

            counters.objects += 1;
            counters.bytes_w_keys += meta.size_w_key();
            counters.bytes_wo_keys += meta.obj_size();
            if modified {
                counters.modified_objects += 1;
                counters.modsize_w_keys += meta.size_w_key();
                counters.modsize_wo_keys += meta.obj_size();
            }
        }

        let modified = self.modlru.iter(&self.table, pages + 1).collect_vec();
        let mut modified_rev = self.modlru.iter_rev(&self.table, pages + 1).collect_vec();
        modified_rev.reverse();
        if modified.len() != counters.modified_objects || modified.len() != self.modlru.len() || modified != modified_rev
        {
            return Err(self.corrupted(
                format!(
                    "modified walk reached {} entries, {} modified entries found",
                    modified.len(),
                    counters.modified_objects
                ),
                &modified,
            ));
        }

        let expected = SlabCounters {
            evictions: self.counters.evictions,
            writebacks: self.counters.writebacks,
            flushes: self.counters.flushes,
            background_flushes: self.counters.background_flushes,
            modified_limit_flushes: self.counters.modified_limit_flushes,
            ..counters
        };
        if expected != self.counters {
            return Err(self.corrupted(format!("counters mismatch, walked: {counters:?}"), &modified));
        }

        for &t in self.transients.iter() {
            let valid = self.table.get(t).is_some_and(|meta| {
                meta.is_transient() && self.arena.chain_len(t) == Some(meta.pages)
            });
            if !valid || !self.arena.chain(t).all(&mut claim) {
                return Err(self.corrupted(format!("transient entry at page {t} is broken"), &self.transients));
            }
        }

        if owned.iter().any(|o| !o) {
            let lost = owned.iter().positions(|o| !o).collect_vec();
            return Err(self.corrupted(format!("pages {lost:?} are neither free nor owned"), &[]));
        }

        let mut chained = 0;
        for bucket in self.bucket_range() {
            let mut cursor = self.bucket_head(bucket);
            let mut steps = 0;
            while let Some(i) = cursor {
                let valid = self
                    .table
                    .get(i)
                    .is_some_and(|meta| !meta.is_transient() && meta.lru.is_linked && meta.bucket == bucket);
                if !valid || steps > pages {
                    let entries = std::iter::successors(self.bucket_head(bucket), |&i| {
                        self.table.get(i).and_then(|m| m.next_in_bucket)
                    })
                    .take(pages)
                    .collect_vec();
                    return Err(self.corrupted(format!("bucket {bucket} chain is broken at page {i}"), &entries));
                }
                steps += 1;
                chained += 1;
                cursor = self.meta(i).next_in_bucket;
            }
        }
        if chained != self.counters.objects {
            return Err(self.corrupted(
                format!("bucket chains hold {chained} entries, {} objects counted", self.counters.objects),
                &forward,
            ));
        }

        Ok(())
    }
}
