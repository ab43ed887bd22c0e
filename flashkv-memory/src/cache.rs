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

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use flashkv_common::{
    error::{Error, ErrorKind, Result},
    metrics::{registry::noop::NoopMetricsRegistry, BoxedRegistry, Metrics},
};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};

use crate::{
    backend::{Backend, StateInitializer},
    config::{validate_modified_fraction, CacheConfig, Layout},
    entry::{EntryRef, EntryView, ObjectKey},
    flush::TokenPool,
    page::PageArena,
    protocol::{Action, CacheMode, CacheState, ProtocolTable, Request, Transition},
    slab::{Slab, SlabCounters},
};

/// Result of a dispatched request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Nothing was done.
    Nothing,
    /// The value, served from the cache or filled from the backing store.
    Hit(Vec<u8>),
    /// The object is neither cached nor persisted.
    Miss,
    /// The payload is stored in the cache.
    Stored,
    /// The cached value is persisted.
    Flushed,
    /// The cached value is dropped.
    Invalidated,
    /// The object is deleted.
    Deleted,
    /// The cached value had expired and is deleted.
    Expired,
    /// Creation rejected, the object exists.
    Exists,
}

/// A request from a peer, applied by the slab of its key before any later local request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRequest {
    /// One of the remote request types.
    pub request: Request,
    /// Key of the object.
    pub key: ObjectKey,
    /// Payload of a remote update.
    pub value: Option<Vec<u8>>,
    /// Expiry of the payload, `0` for never.
    pub expiry: u32,
    /// Time the request was issued.
    pub now: u32,
}

/// Entry found or created by `get_or_create`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lookup {
    /// Handle of the entry.
    pub entry: EntryRef,
    /// Bucket of the key.
    pub bucket: usize,
    /// Whether the entry is a new transient entry.
    pub is_new: bool,
}

pub(crate) struct CacheInner {
    pub(crate) config: CacheConfig,
    pub(crate) layout: Layout,

    pub(crate) slabs: Vec<Mutex<Slab>>,
    pub(crate) queues: Vec<Mutex<VecDeque<RemoteRequest>>>,
    pub(crate) pending: AtomicUsize,

    pub(crate) modified_fraction: AtomicU64,
    pub(crate) flush_tokens: TokenPool,
    pub(crate) background_flush_tokens: TokenPool,
    pub(crate) background_sleep_ms: AtomicU64,

    pub(crate) backend: Arc<dyn Backend>,
    pub(crate) initializer: Arc<dyn StateInitializer>,
    pub(crate) metrics: Arc<Metrics>,
}

impl CacheInner {
    pub(crate) fn bucket_of(&self, key: &ObjectKey) -> usize {
        (key.hash() % self.layout.buckets as u64) as usize
    }

    pub(crate) fn slab_of(&self, bucket: usize) -> usize {
        bucket / self.layout.buckets_per_slab
    }

    fn modified_limit(&self) -> usize {
        let fraction = f64::from_bits(self.modified_fraction.load(Ordering::Relaxed));
        (fraction * self.layout.slab_capacity() as f64) as usize
    }

    fn lock(&self, slab: usize) -> SlabGuard<'_> {
        let mut guard = SlabGuard {
            cache: self,
            slab: self.slabs[slab].lock(),
        };
        guard.drain();
        guard
    }

    fn try_lock(&self, slab: usize) -> Option<SlabGuard<'_>> {
        let mut guard = SlabGuard {
            cache: self,
            slab: self.slabs[slab].try_lock()?,
        };
        guard.drain();
        Some(guard)
    }
}

/// Object cache in front of a flash-backed store.
///
/// The cache is cheap to clone, clones share the same instance.
#[derive(Clone)]
pub struct Cache {
    pub(crate) inner: Arc<CacheInner>,
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("name", &self.inner.config.name)
            .field("layout", &self.inner.layout)
            .field("mode", &self.inner.config.mode)
            .finish()
    }
}

/// Builder of [`Cache`].
pub struct CacheBuilder {
    config: CacheConfig,
    backend: Option<Arc<dyn Backend>>,
    initializer: Option<Arc<dyn StateInitializer>>,
    registry: BoxedRegistry,
}

impl CacheBuilder {
    /// Create a builder with a page arena of `size_limit` bytes and default settings otherwise.
    pub fn new(size_limit: usize) -> Self {
        Self::from_config(CacheConfig {
            size_limit,
            ..Default::default()
        })
    }

    /// Create a builder from a complete configuration.
    pub fn from_config(config: CacheConfig) -> Self {
        Self {
            config,
            backend: None,
            initializer: None,
            registry: Box::new(NoopMetricsRegistry),
        }
    }

    /// Set the instance name, used as the metrics label.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    /// Set the page size. Every entry occupies a whole number of pages.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.config.page_size = page_size;
        self
    }

    /// Set the bucket count. It is rounded up to a multiple of the slab count.
    pub fn with_buckets(mut self, buckets: usize) -> Self {
        self.config.buckets = buckets;
        self
    }

    /// Set the slab count. Slabs are locked independently.
    pub fn with_slabs(mut self, slabs: usize) -> Self {
        self.config.slabs = slabs;
        self
    }

    /// Set the largest accepted key.
    pub fn with_max_key_size(mut self, max_key_size: usize) -> Self {
        self.config.max_key_size = max_key_size;
        self
    }

    /// Set the largest accepted value. Each slab must fit at least one object of this size.
    pub fn with_max_object_size(mut self, max_object_size: usize) -> Self {
        self.config.max_object_size = max_object_size;
        self
    }

    /// Set the write policy.
    pub fn with_mode(mut self, mode: CacheMode) -> Self {
        self.config.mode = mode;
        self
    }

    /// Set the fraction of a slab that may be dirty.
    ///
    /// The default value is 0.5.
    pub fn with_modified_fraction(mut self, fraction: f64) -> Self {
        self.config.modified_fraction = fraction;
        self
    }

    /// Set how many dirty entries one write may flush to respect the modified fraction.
    pub fn with_max_flushes_per_call(mut self, max_flushes_per_call: usize) -> Self {
        self.config.max_flushes_per_call = max_flushes_per_call;
        self
    }

    /// Set the flush token pool size.
    pub fn with_flush_tokens(mut self, tokens: usize) -> Self {
        self.config.flush_tokens = tokens;
        self
    }

    /// Set the background flush token pool size.
    pub fn with_background_flush_tokens(mut self, tokens: usize) -> Self {
        self.config.background_flush_tokens = tokens;
        self
    }

    /// Set the idle interval of the background flusher.
    pub fn with_background_sleep(mut self, sleep: Duration) -> Self {
        self.config.background_sleep = sleep;
        self
    }

    /// Set the backing store. Required.
    pub fn with_backend(mut self, backend: impl Backend) -> Self {
        self.backend = Some(Arc::new(backend));
        self
    }

    /// Set the initializer of promoted entries.
    ///
    /// By default entries start `Modified` in write-back mode and `Shared` in write-through mode.
    pub fn with_state_initializer(mut self, initializer: impl StateInitializer) -> Self {
        self.initializer = Some(Arc::new(initializer));
        self
    }

    /// Set the metrics registry.
    pub fn with_metrics_registry(mut self, registry: BoxedRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Build the cache. The page arena of every slab is allocated here.
    pub fn build(self) -> Result<Cache> {
        let layout = self.config.layout()?;
        let backend = self
            .backend
            .ok_or_else(|| Error::config("a backend is required to build the cache"))?;
        let mode = self.config.mode;
        let initializer = self
            .initializer
            .unwrap_or_else(|| Arc::new(move |_: &EntryView, _: u32| mode.initial_state()) as Arc<dyn StateInitializer>);
        let metrics = Arc::new(Metrics::new(&self.config.name, &*self.registry));

        let slabs = (0..layout.slabs)
            .map(|i| {
                let buckets = i * layout.buckets_per_slab..(i + 1) * layout.buckets_per_slab;
                let arena = PageArena::new(layout.page_size, layout.pages_per_slab);
                Mutex::new(Slab::new(i, arena, buckets, backend.clone(), metrics.clone()))
            })
            .collect();
        let queues = (0..layout.slabs).map(|_| Mutex::new(VecDeque::new())).collect();

        tracing::info!(
            "[cache]: build object cache {} in {:?} mode with layout {:?}",
            self.config.name,
            mode,
            layout
        );

        let inner = CacheInner {
            layout,
            slabs,
            queues,
            pending: AtomicUsize::new(0),
            modified_fraction: AtomicU64::new(self.config.modified_fraction.to_bits()),
            flush_tokens: TokenPool::new(self.config.flush_tokens),
            background_flush_tokens: TokenPool::new(self.config.background_flush_tokens),
            background_sleep_ms: AtomicU64::new(self.config.background_sleep.as_millis() as u64),
            backend,
            initializer,
            metrics,
            config: self.config,
        };
        Ok(Cache { inner: Arc::new(inner) })
    }
}

impl Cache {
    /// Configuration the cache was built with.
    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Bucket count, after rounding to a multiple of the slab count.
    pub fn buckets(&self) -> usize {
        self.inner.layout.buckets
    }

    /// Slab count.
    pub fn slabs(&self) -> usize {
        self.inner.layout.slabs
    }

    /// Pages of every slab.
    pub fn pages_per_slab(&self) -> usize {
        self.inner.layout.pages_per_slab
    }

    /// Bucket of `key`.
    pub fn bucket_of(&self, key: &ObjectKey) -> usize {
        self.inner.bucket_of(key)
    }

    /// Slab owning `bucket`.
    pub fn slab_of(&self, bucket: usize) -> usize {
        self.inner.slab_of(bucket)
    }

    /// Lock a slab, then apply its deferred remote requests.
    pub fn lock(&self, slab: usize) -> SlabGuard<'_> {
        self.inner.lock(slab)
    }

    /// Lock a slab if no one holds it.
    pub fn try_lock(&self, slab: usize) -> Option<SlabGuard<'_>> {
        self.inner.try_lock(slab)
    }

    /// Lock the slab of `key` and find its entry, or create a transient entry for it.
    pub fn get_or_create(&self, key: &ObjectKey, now: u32) -> Result<(SlabGuard<'_>, Lookup)> {
        let mut guard = self.lock(self.slab_of(self.bucket_of(key)));
        let lookup = guard.get_or_create(key, now)?;
        Ok((guard, lookup))
    }

    /// Like [`Cache::get_or_create`], but returns `Ok(None)` if the slab is contended.
    pub fn try_get_or_create(&self, key: &ObjectKey, now: u32) -> Result<Option<(SlabGuard<'_>, Lookup)>> {
        let Some(mut guard) = self.try_lock(self.slab_of(self.bucket_of(key))) else {
            return Ok(None);
        };
        let lookup = guard.get_or_create(key, now)?;
        Ok(Some((guard, lookup)))
    }

    /// Queue a request from a peer on the slab of its key.
    ///
    /// The request is applied before the next local request on that slab. If the slab is free it is applied right
    /// away.
    pub fn post_remote_request(&self, request: RemoteRequest) -> Result<()> {
        if !request.request.is_remote() {
            return Err(Error::new(ErrorKind::Invalid, "not a remote request")
                .with_context("request", format!("{:?}", request.request)));
        }
        let slab = self.slab_of(self.bucket_of(&request.key));

        self.inner.queues[slab].lock().push_back(request);
        self.inner.pending.fetch_add(1, Ordering::Relaxed);
        self.inner.metrics.cache_remote.increase(1);

        // Draining happens on lock.
        drop(self.try_lock(slab));
        Ok(())
    }

    /// Remote requests queued and not applied yet.
    pub fn pending_remote_requests(&self) -> usize {
        self.inner.pending.load(Ordering::Relaxed)
    }

    fn dispatch(&self, request: Request, key: &ObjectKey, value: Option<&[u8]>, expiry: u32, now: u32) -> Result<Outcome> {
        let mut guard = self.lock(self.slab_of(self.bucket_of(key)));
        guard.dispatch(request, key, value, expiry, now)
    }

    /// Create an object. Returns [`Outcome::Exists`] if it is cached already.
    pub fn create(&self, key: &ObjectKey, value: &[u8], expiry: u32, now: u32) -> Result<Outcome> {
        self.dispatch(Request::Create, key, Some(value), expiry, now)
    }

    /// Create or replace an object.
    pub fn put(&self, key: &ObjectKey, value: &[u8], expiry: u32, now: u32) -> Result<Outcome> {
        self.dispatch(Request::Put, key, Some(value), expiry, now)
    }

    /// Read an object, filling it from the backing store on a miss.
    pub fn get(&self, key: &ObjectKey, now: u32) -> Result<Outcome> {
        self.dispatch(Request::Get, key, None, 0, now)
    }

    /// Delete an object from the cache and the backing store.
    pub fn delete(&self, key: &ObjectKey, now: u32) -> Result<Outcome> {
        self.dispatch(Request::Delete, key, None, 0, now)
    }

    /// Persist a dirty object and keep it cached.
    pub fn flush_object(&self, key: &ObjectKey, now: u32) -> Result<Outcome> {
        self.dispatch(Request::Flush, key, None, 0, now)
    }

    /// Drop an object from the cache, persisting it first if `flush` is set.
    pub fn invalidate(&self, key: &ObjectKey, flush: bool, now: u32) -> Result<Outcome> {
        let request = if flush {
            Request::FlushInvalidate
        } else {
            Request::Invalidate
        };
        self.dispatch(request, key, None, 0, now)
    }

    /// Change the fraction of every slab that may be dirty.
    pub fn set_modified_limit(&self, fraction: f64) -> Result<()> {
        validate_modified_fraction(fraction)?;
        self.inner.modified_fraction.store(fraction.to_bits(), Ordering::Relaxed);
        tracing::info!("[cache]: modified limit set to {fraction}");
        Ok(())
    }

    /// Drop every cached object without persisting anything. The cache stays usable.
    pub fn destroy(&self) -> Result<()> {
        let mut freed = 0;
        for slab in 0..self.slabs() {
            let mut guard = self.lock(slab);
            freed += guard.slab.clear()?;
        }
        tracing::info!("[cache]: object cache {} destroyed, {freed} pages freed", self.inner.config.name);
        Ok(())
    }
}

/// Exclusive access to one slab.
///
/// Deferred remote requests of the slab are applied when the guard is acquired. Transient entries left over when the
/// guard drops are freed.
pub struct SlabGuard<'a> {
    pub(crate) cache: &'a CacheInner,
    pub(crate) slab: MutexGuard<'a, Slab>,
}

impl Drop for SlabGuard<'_> {
    fn drop(&mut self) {
        let freed = self.slab.release_transients();
        if freed > 0 {
            tracing::trace!("[slab]: release {freed} pages of transient entries of slab {}", self.slab.index());
        }
        #[cfg(feature = "strict_assertions")]
        flashkv_common::strict_assert!(self.slab.check().is_ok(), "heap check of slab {} failed", self.slab.index());
    }
}

impl SlabGuard<'_> {
    /// Index of the locked slab.
    pub fn index(&self) -> usize {
        self.slab.index()
    }

    /// Counters of the locked slab.
    pub fn counters(&self) -> SlabCounters {
        *self.slab.counters()
    }

    /// Free pages of the locked slab.
    pub fn free_pages(&self) -> usize {
        self.slab.arena().free_pages()
    }

    fn drain(&mut self) {
        let queue = &self.cache.queues[self.slab.index()];
        loop {
            let request = queue.lock().pop_front();
            let Some(request) = request else {
                break;
            };
            self.cache.pending.fetch_sub(1, Ordering::Relaxed);
            if let Err(e) = self.dispatch(
                request.request,
                &request.key,
                request.value.as_deref(),
                request.expiry,
                request.now,
            ) {
                tracing::error!("[slab]: apply remote request {:?} failed: {e}", request.request);
            }
        }
    }

    fn check_key(&self, key: &ObjectKey) -> Result<usize> {
        if key.key.len() > self.cache.config.max_key_size {
            return Err(Error::new(ErrorKind::TooLarge, "key exceeds the max key size")
                .with_context("len", key.key.len())
                .with_context("max", self.cache.config.max_key_size));
        }
        let bucket = self.cache.bucket_of(key);
        if self.cache.slab_of(bucket) != self.slab.index() {
            return Err(Error::new(ErrorKind::Invalid, "key belongs to another slab")
                .with_context("bucket", bucket)
                .with_context("slab", self.slab.index()));
        }
        Ok(bucket)
    }

    fn check_size(&self, size: usize) -> Result<()> {
        if size > self.cache.config.max_object_size {
            return Err(Error::new(ErrorKind::TooLarge, "object exceeds the max object size")
                .with_context("size", size)
                .with_context("max", self.cache.config.max_object_size));
        }
        Ok(())
    }

    /// Find the resident entry of `key`.
    pub fn get(&self, key: &ObjectKey) -> Result<Option<EntryRef>> {
        let bucket = self.check_key(key)?;
        Ok(self.slab.lookup(bucket, key).map(|i| self.slab.entry_ref(i)))
    }

    /// Find the resident entry of `key`, or create a transient entry holding only the key.
    ///
    /// A transient entry is freed when the guard drops unless [`SlabGuard::create_object`] promotes it.
    pub fn get_or_create(&mut self, key: &ObjectKey, now: u32) -> Result<Lookup> {
        let bucket = self.check_key(key)?;
        if let Some(i) = self.slab.lookup(bucket, key) {
            return Ok(Lookup {
                entry: self.slab.entry_ref(i),
                bucket,
                is_new: false,
            });
        }
        let i = self.slab.insert_transient(bucket, key, now)?;
        Ok(Lookup {
            entry: self.slab.entry_ref(i),
            bucket,
            is_new: true,
        })
    }

    /// Snapshot of an entry.
    pub fn entry(&self, entry: EntryRef) -> Result<EntryView> {
        let i = self.slab.resolve(entry)?;
        Ok(self.slab.view(i))
    }

    /// Coherency state of an entry.
    pub fn state(&self, entry: EntryRef) -> Result<CacheState> {
        let i = self.slab.resolve(entry)?;
        Ok(self.slab.meta(i).state)
    }

    /// Remove an entry and free its pages, writing it back first if `write_back` is set and it is dirty.
    ///
    /// Removing an entry that no longer exists frees nothing and returns `0`.
    pub fn remove(&mut self, entry: EntryRef, write_back: bool) -> Result<usize> {
        let Ok(i) = self.slab.resolve(entry) else {
            return Ok(0);
        };
        if write_back && self.slab.meta(i).state == CacheState::Modified {
            let view = self.slab.view(i);
            self.slab.backend().write_back(&view)?;
            self.slab.counters_mut().writebacks += 1;
            self.cache.metrics.cache_writeback.increase(1);
        }
        let resident = !self.slab.meta(i).is_transient();
        let freed = self.slab.remove(i)?;
        if resident {
            self.cache.metrics.cache_remove.increase(1);
        }
        Ok(freed)
    }

    /// Size a transient entry for `size` bytes of value and promote it into its bucket and the LRU list.
    ///
    /// The state initializer runs once here. Returns the handle of the promoted entry, the transient handle is stale
    /// afterwards.
    pub fn create_object(&mut self, entry: EntryRef, size: usize) -> Result<EntryRef> {
        let i = self.slab.resolve(entry)?;
        if !self.slab.meta(i).is_transient() {
            return Err(Error::new(ErrorKind::Invalid, "entry is resident already").with_context("page", i));
        }
        self.check_size(size)?;
        let i = self.promote(i, size)?;
        Ok(self.slab.entry_ref(i))
    }

    fn promote(&mut self, transient: usize, size: usize) -> Result<usize> {
        let i = self.slab.reshape(transient, size)?;
        self.slab.promote(i);

        let view = self.slab.view(i);
        let state = self.cache.initializer.init(&view, view.created);
        self.slab.set_state(i, state);
        self.cache.metrics.cache_insert.increase(1);
        Ok(i)
    }

    /// Resize a resident entry for `size` bytes of value. State, flags and timestamps are kept, the value prefix that
    /// still fits is kept.
    ///
    /// Returns the new handle, the old handle is stale afterwards.
    pub fn overwrite_object(&mut self, entry: EntryRef, size: usize) -> Result<EntryRef> {
        let i = self.slab.resolve(entry)?;
        if self.slab.meta(i).is_transient() {
            return Err(Error::new(ErrorKind::Invalid, "entry is not resident").with_context("page", i));
        }
        self.check_size(size)?;
        let i = self.slab.reshape(i, size)?;
        self.cache.metrics.cache_overwrite.increase(1);
        Ok(self.slab.entry_ref(i))
    }

    /// Copy `data` into the value of an entry at `offset`.
    pub fn copy_into_object(&mut self, entry: EntryRef, offset: usize, data: &[u8]) -> Result<()> {
        let i = self.slab.resolve(entry)?;
        let size = self.slab.meta(i).obj_size();
        if offset + data.len() > size {
            return Err(Error::new(ErrorKind::Invalid, "copy exceeds the object size")
                .with_context("offset", offset)
                .with_context("len", data.len())
                .with_context("size", size));
        }
        self.slab.write_value(i, offset, data);
        Ok(())
    }

    /// Copy the value of an entry out of the cache.
    pub fn copy_out_of_object(&self, entry: EntryRef) -> Result<Vec<u8>> {
        let i = self.slab.resolve(entry)?;
        Ok(self.slab.read_value(i))
    }

    /// Audit the locked slab.
    pub fn check(&self) -> Result<()> {
        self.slab.check()
    }

    /// Drive a request through the coherency table of the cache mode.
    pub fn dispatch(
        &mut self,
        request: Request,
        key: &ObjectKey,
        value: Option<&[u8]>,
        expiry: u32,
        now: u32,
    ) -> Result<Outcome> {
        let bucket = self.check_key(key)?;
        if let Some(value) = value {
            self.check_size(value.len())?;
        }

        let resident = self.slab.lookup(bucket, key);
        let (state, expired) = match resident {
            Some(i) => {
                let meta = self.slab.meta(i);
                (meta.state, meta.is_expired(now))
            }
            None => (CacheState::Invalid, false),
        };
        let table = self.cache.config.mode.table(expired);
        let Transition { action, next } = table.lookup(request, state);

        tracing::trace!(
            "[dispatch]: {} table, {request:?} in {state:?} -> {action:?} then {next:?}",
            table.name()
        );

        let outcome = match action {
            Action::Noop => Outcome::Nothing,
            Action::Serve => {
                let i = self.required(resident, table, request, state)?;
                self.slab.touch(i);
                self.cache.metrics.cache_hit.increase(1);
                Outcome::Hit(self.slab.read_value(i))
            }
            Action::Fill => {
                self.cache.metrics.cache_miss.increase(1);
                let fetched = self.slab.backend().fetch(key)?;
                match fetched {
                    Some(value) => {
                        self.check_size(value.len())?;
                        self.store(bucket, key, resident, &value, 0, now, next)?;
                        Outcome::Hit(value)
                    }
                    None => Outcome::Miss,
                }
            }
            Action::WriteBack => {
                let value = payload(value, request)?;
                self.store(bucket, key, resident, value, expiry, now, next)?;
                // The value is stored at this point. Whatever stays over the limit is retried on the next write.
                if let Err(e) = self
                    .slab
                    .enforce_modified_limit(self.cache.modified_limit(), self.cache.config.max_flushes_per_call)
                {
                    tracing::warn!("[slab]: enforce modified limit of slab {} failed: {e}", self.slab.index());
                }
                Outcome::Stored
            }
            Action::WriteThrough => {
                let value = payload(value, request)?;
                let i = self.store(bucket, key, resident, value, expiry, now, next)?;
                let view = self.slab.view(i);
                if let Err(e) = self.slab.backend().write_back(&view) {
                    self.slab.remove(i)?;
                    return Err(e);
                }
                Outcome::Stored
            }
            Action::Flush => {
                let i = self.required(resident, table, request, state)?;
                let view = self.slab.view(i);
                self.slab.backend().write_back(&view)?;
                self.slab.set_state(i, next);
                self.slab.counters_mut().flushes += 1;
                self.cache.metrics.cache_flush.increase(1);
                Outcome::Flushed
            }
            Action::Invalidate => {
                let i = self.required(resident, table, request, state)?;
                self.slab.remove(i)?;
                self.cache.metrics.cache_remove.increase(1);
                Outcome::Invalidated
            }
            Action::FlushInvalidate => {
                let i = self.required(resident, table, request, state)?;
                let view = self.slab.view(i);
                self.slab.backend().write_back(&view)?;
                self.slab.counters_mut().flushes += 1;
                self.cache.metrics.cache_flush.increase(1);
                self.slab.remove(i)?;
                self.cache.metrics.cache_remove.increase(1);
                Outcome::Invalidated
            }
            Action::Delete => {
                self.slab.backend().delete(key)?;
                if let Some(i) = resident {
                    self.slab.remove(i)?;
                    self.cache.metrics.cache_remove.increase(1);
                }
                Outcome::Deleted
            }
            Action::Expire => {
                let i = self.required(resident, table, request, state)?;
                self.slab.backend().delete(key)?;
                self.slab.remove(i)?;
                self.cache.metrics.cache_expire.increase(1);
                Outcome::Expired
            }
            Action::Install => {
                let value = payload(value, request)?;
                self.store(bucket, key, resident, value, expiry, now, next)?;
                Outcome::Stored
            }
            Action::Exists => Outcome::Exists,
            Action::Bad => return Err(self.violation(bucket, table, request, state)),
        };
        Ok(outcome)
    }

    /// Write `value` into the entry of `key`, creating, resizing or reusing it, and move it to `next`.
    #[expect(clippy::too_many_arguments)]
    fn store(
        &mut self,
        bucket: usize,
        key: &ObjectKey,
        resident: Option<usize>,
        value: &[u8],
        expiry: u32,
        now: u32,
        next: CacheState,
    ) -> Result<usize> {
        let i = match resident {
            Some(i) if self.slab.meta(i).obj_size() == value.len() => {
                self.slab.touch(i);
                i
            }
            Some(i) => {
                let i = self.slab.reshape(i, value.len())?;
                self.cache.metrics.cache_overwrite.increase(1);
                i
            }
            None => {
                let transient = self.slab.insert_transient(bucket, key, now)?;
                self.promote(transient, value.len())?
            }
        };
        self.slab.write_value(i, 0, value);
        self.slab.set_expiry(i, expiry);
        self.slab.set_state(i, next);
        Ok(i)
    }

    fn required(
        &self,
        resident: Option<usize>,
        table: &ProtocolTable,
        request: Request,
        state: CacheState,
    ) -> Result<usize> {
        resident.ok_or_else(|| {
            Error::new(ErrorKind::Protocol, "action requires a resident entry")
                .with_context("table", table.name())
                .with_context("request", format!("{request:?}"))
                .with_context("state", format!("{state:?}"))
        })
    }

    fn violation(&self, bucket: usize, table: &ProtocolTable, request: Request, state: CacheState) -> Error {
        tracing::error!(
            "[dispatch]: protocol violation in {} table, {request:?} in {state:?}, bucket {bucket}:\n{}",
            table.name(),
            self.slab.dump(&self.slab.bucket_entries(bucket))
        );
        Error::new(ErrorKind::Protocol, "request reached the bad state")
            .with_context("table", table.name())
            .with_context("request", format!("{request:?}"))
            .with_context("state", format!("{state:?}"))
    }
}

fn payload(value: Option<&[u8]>, request: Request) -> Result<&[u8]> {
    value.ok_or_else(|| {
        Error::new(ErrorKind::Invalid, "request requires a value").with_context("request", format!("{request:?}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::{BackendOp, MemoryBackend},
        entry::ContainerKind,
    };

    const PAGE_SIZE: usize = 64;

    fn cache(mode: CacheMode) -> (Cache, MemoryBackend) {
        let backend = MemoryBackend::new();
        let cache = CacheBuilder::new(PAGE_SIZE * 64)
            .with_name("test")
            .with_page_size(PAGE_SIZE)
            .with_slabs(1)
            .with_buckets(8)
            .with_max_key_size(16)
            .with_max_object_size(200)
            .with_mode(mode)
            .with_modified_fraction(1.0)
            .with_backend(backend.clone())
            .build()
            .unwrap();
        (cache, backend)
    }

    fn key(k: &str) -> ObjectKey {
        ObjectKey::new(1, ContainerKind::Object, k.as_bytes().to_vec())
    }

    fn state_of(cache: &Cache, k: &ObjectKey) -> Option<CacheState> {
        let guard = cache.lock(0);
        let entry = guard.get(k).unwrap()?;
        Some(guard.state(entry).unwrap())
    }

    #[test]
    fn test_build_requires_backend() {
        let err = CacheBuilder::new(1 << 20).build().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[test_log::test]
    fn test_put_get_sizes() {
        let (cache, backend) = cache(CacheMode::WriteBack);

        // Zero bytes, within one page, and across several pages.
        for (i, size) in [0, 1, 10, 150].into_iter().enumerate() {
            let k = key(&format!("k{i}"));
            let value = (0..size).map(|b| b as u8).collect::<Vec<_>>();
            assert_eq!(cache.put(&k, &value, 0, 1).unwrap(), Outcome::Stored);
            assert_eq!(cache.get(&k, 2).unwrap(), Outcome::Hit(value));
            assert_eq!(state_of(&cache, &k), Some(CacheState::Modified));
        }
        assert!(backend.is_empty());
        cache.lock(0).check().unwrap();
    }

    #[test_log::test]
    fn test_overwrite_resizes() {
        let (cache, _) = cache(CacheMode::WriteBack);
        let k = key("k");

        cache.put(&k, &[1; 150], 0, 1).unwrap();
        let used = cache.lock(0).free_pages();
        cache.put(&k, &[2; 5], 0, 2).unwrap();
        assert!(cache.lock(0).free_pages() > used);
        assert_eq!(cache.get(&k, 3).unwrap(), Outcome::Hit(vec![2; 5]));

        let counters = cache.lock(0).counters();
        assert_eq!(counters.objects, 1);
        assert_eq!(counters.bytes_wo_keys, 5);
        assert_eq!(counters.modsize_wo_keys, 5);
    }

    #[test_log::test]
    fn test_create_exists() {
        let (cache, _) = cache(CacheMode::WriteBack);
        let k = key("k");

        assert_eq!(cache.create(&k, b"v1", 0, 1).unwrap(), Outcome::Stored);
        assert_eq!(cache.create(&k, b"v2", 0, 2).unwrap(), Outcome::Exists);
        assert_eq!(cache.get(&k, 3).unwrap(), Outcome::Hit(b"v1".to_vec()));
    }

    #[test_log::test]
    fn test_get_fills_from_backend() {
        let (cache, backend) = cache(CacheMode::WriteBack);
        let k = key("k");

        assert_eq!(cache.get(&k, 1).unwrap(), Outcome::Miss);
        assert_eq!(cache.lock(0).counters().objects, 0);

        backend.insert(k.clone(), b"persisted".to_vec());
        assert_eq!(cache.get(&k, 2).unwrap(), Outcome::Hit(b"persisted".to_vec()));
        assert_eq!(state_of(&cache, &k), Some(CacheState::Shared));

        backend.clear_ops();
        assert_eq!(cache.get(&k, 3).unwrap(), Outcome::Hit(b"persisted".to_vec()));
        assert!(backend.ops().is_empty());
    }

    #[test_log::test]
    fn test_flush_and_invalidate() {
        let (cache, backend) = cache(CacheMode::WriteBack);
        let (a, b, c) = (key("a"), key("b"), key("c"));
        for k in [&a, &b, &c] {
            cache.put(k, b"value", 0, 1).unwrap();
        }
        assert_eq!(cache.lock(0).counters().modified_objects, 3);

        assert_eq!(cache.flush_object(&a, 2).unwrap(), Outcome::Flushed);
        assert_eq!(state_of(&cache, &a), Some(CacheState::Shared));
        assert_eq!(backend.get(&a), Some(b"value".to_vec()));
        assert_eq!(cache.flush_object(&a, 2).unwrap(), Outcome::Nothing);

        assert_eq!(cache.invalidate(&b, false, 3).unwrap(), Outcome::Invalidated);
        assert_eq!(backend.get(&b), None);
        assert_eq!(state_of(&cache, &b), None);

        assert_eq!(cache.invalidate(&c, true, 3).unwrap(), Outcome::Invalidated);
        assert_eq!(backend.get(&c), Some(b"value".to_vec()));
        assert_eq!(state_of(&cache, &c), None);

        let counters = cache.lock(0).counters();
        assert_eq!(counters.objects, 1);
        assert_eq!(counters.modified_objects, 0);
        assert_eq!(counters.modsize_w_keys, 0);
        assert_eq!(counters.flushes, 2);
    }

    #[test_log::test]
    fn test_delete() {
        let (cache, backend) = cache(CacheMode::WriteBack);
        let k = key("k");
        backend.insert(k.clone(), b"old".to_vec());

        cache.put(&k, b"new", 0, 1).unwrap();
        assert_eq!(cache.delete(&k, 2).unwrap(), Outcome::Deleted);
        assert_eq!(state_of(&cache, &k), None);
        assert!(backend.is_empty());
        assert_eq!(backend.ops(), vec![BackendOp::Delete(k.clone())]);

        // Deleting an uncached object still reaches the backing store.
        assert_eq!(cache.delete(&k, 3).unwrap(), Outcome::Deleted);
        assert_eq!(backend.ops().len(), 2);
    }

    #[test_log::test]
    fn test_expiry() {
        let (cache, backend) = cache(CacheMode::WriteBack);
        let k = key("k");

        cache.put(&k, b"value", 10, 1).unwrap();
        assert_eq!(cache.get(&k, 9).unwrap(), Outcome::Hit(b"value".to_vec()));
        assert_eq!(cache.get(&k, 10).unwrap(), Outcome::Expired);
        assert_eq!(state_of(&cache, &k), None);
        assert_eq!(backend.ops(), vec![BackendOp::Delete(k.clone())]);

        // An expired object is replaced by a create.
        cache.put(&k, b"value", 10, 11).unwrap();
        assert_eq!(cache.create(&k, b"fresh", 0, 20).unwrap(), Outcome::Stored);
        assert_eq!(cache.get(&k, 30).unwrap(), Outcome::Hit(b"fresh".to_vec()));
    }

    #[test_log::test]
    fn test_write_through() {
        let (cache, backend) = cache(CacheMode::WriteThrough);
        let k = key("k");

        assert_eq!(cache.put(&k, b"v1", 0, 1).unwrap(), Outcome::Stored);
        assert_eq!(backend.get(&k), Some(b"v1".to_vec()));
        assert_eq!(state_of(&cache, &k), Some(CacheState::Shared));
        assert_eq!(cache.lock(0).counters().modified_objects, 0);

        backend.set_fail_writes(true);
        let err = cache.put(&k, b"v2", 0, 2).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::External);
        assert_eq!(state_of(&cache, &k), None);
        backend.set_fail_writes(false);

        assert_eq!(cache.get(&k, 3).unwrap(), Outcome::Hit(b"v1".to_vec()));
    }

    #[test_log::test]
    fn test_remote_update_on_modified_is_bad() {
        let (cache, _) = cache(CacheMode::WriteBack);
        let k = key("k");
        cache.put(&k, b"dirty", 0, 1).unwrap();

        let mut guard = cache.lock(0);
        let err = guard
            .dispatch(Request::RemoteUpdate, &k, Some(b"remote"), 0, 2)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
        let entry = guard.get(&k).unwrap().unwrap();
        assert_eq!(guard.copy_out_of_object(entry).unwrap(), b"dirty".to_vec());
    }

    #[test_log::test]
    fn test_remote_requests_apply_in_order() {
        let (cache, _) = cache(CacheMode::WriteBack);
        let k = key("k");
        let remote = |request, value: Option<&[u8]>| RemoteRequest {
            request,
            key: k.clone(),
            value: value.map(|v| v.to_vec()),
            expiry: 0,
            now: 1,
        };

        let err = cache.post_remote_request(remote(Request::Put, Some(b"v"))).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Invalid);

        let guard = cache.lock(0);
        cache
            .post_remote_request(remote(Request::RemoteUpdate, Some(b"v1")))
            .unwrap();
        cache
            .post_remote_request(remote(Request::RemoteUpdate, Some(b"v2")))
            .unwrap();
        assert_eq!(cache.pending_remote_requests(), 2);
        drop(guard);

        assert_eq!(cache.get(&k, 2).unwrap(), Outcome::Hit(b"v2".to_vec()));
        assert_eq!(cache.pending_remote_requests(), 0);
        assert_eq!(state_of(&cache, &k), Some(CacheState::Shared));

        // The slab is free, so the request is applied right away.
        cache.post_remote_request(remote(Request::RemoteInvalidate, None)).unwrap();
        assert_eq!(cache.pending_remote_requests(), 0);
        assert_eq!(state_of(&cache, &k), None);
    }

    #[test_log::test]
    fn test_too_large() {
        let (cache, _) = cache(CacheMode::WriteBack);

        let err = cache.put(&key("a-key-longer-than-16"), b"v", 0, 1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TooLarge);
        let err = cache.put(&key("k"), &[0; 201], 0, 1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TooLarge);
        assert_eq!(cache.lock(0).counters().objects, 0);
    }

    #[test_log::test]
    fn test_transient_lifecycle() {
        let (cache, _) = cache(CacheMode::WriteBack);
        let k = key("k");
        let free = cache.lock(0).free_pages();

        {
            let (guard, lookup) = cache.get_or_create(&k, 1).unwrap();
            assert!(lookup.is_new);
            assert!(guard.free_pages() < free);
            assert_eq!(guard.get(&k).unwrap(), None);
        }
        assert_eq!(cache.lock(0).free_pages(), free);

        let (mut guard, lookup) = cache.get_or_create(&k, 1).unwrap();
        let entry = guard.create_object(lookup.entry, 100).unwrap();
        assert_eq!(guard.state(lookup.entry).unwrap_err().kind(), ErrorKind::Stale);
        assert_eq!(guard.state(entry).unwrap(), CacheState::Modified);

        guard.copy_into_object(entry, 0, &[1; 60]).unwrap();
        guard.copy_into_object(entry, 60, &[2; 40]).unwrap();
        let err = guard.copy_into_object(entry, 90, &[3; 20]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Invalid);

        let value = guard.copy_out_of_object(entry).unwrap();
        assert_eq!(&value[..60], &[1; 60]);
        assert_eq!(&value[60..], &[2; 40]);

        let err = guard.create_object(entry, 10).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Invalid);
        drop(guard);

        let (guard, lookup) = cache.get_or_create(&k, 2).unwrap();
        assert!(!lookup.is_new);
        assert_eq!(lookup.entry, entry);
        assert_eq!(guard.entry(entry).unwrap().value.len(), 100);
    }

    #[test_log::test]
    fn test_remove_idempotent() {
        let (cache, backend) = cache(CacheMode::WriteBack);
        let k = key("k");
        cache.put(&k, b"dirty", 0, 1).unwrap();

        let mut guard = cache.lock(0);
        let entry = guard.get(&k).unwrap().unwrap();
        assert!(guard.remove(entry, true).unwrap() > 0);
        assert_eq!(guard.remove(entry, true).unwrap(), 0);
        drop(guard);

        assert_eq!(backend.get(&k), Some(b"dirty".to_vec()));
        assert_eq!(cache.lock(0).counters().objects, 0);
    }

    #[test_log::test]
    fn test_overwrite_object_keeps_state() {
        let (cache, _) = cache(CacheMode::WriteBack);
        let k = key("k");
        cache.put(&k, b"abcdef", 0, 1).unwrap();

        let mut guard = cache.lock(0);
        let entry = guard.get(&k).unwrap().unwrap();
        let resized = guard.overwrite_object(entry, 100).unwrap();
        assert_eq!(guard.state(resized).unwrap(), CacheState::Modified);
        assert_eq!(&guard.copy_out_of_object(resized).unwrap()[..6], b"abcdef");

        let resized = guard.overwrite_object(resized, 3).unwrap();
        assert_eq!(guard.copy_out_of_object(resized).unwrap(), b"abc".to_vec());
        assert_eq!(guard.counters().modsize_wo_keys, 3);
        guard.check().unwrap();
    }

    #[test_log::test]
    fn test_try_lock_contended() {
        let (cache, _) = cache(CacheMode::WriteBack);
        let k = key("k");

        let guard = cache.lock(0);
        assert!(cache.try_get_or_create(&k, 1).unwrap().is_none());
        drop(guard);
        assert!(cache.try_get_or_create(&k, 1).unwrap().is_some());
    }

    #[test_log::test]
    fn test_state_initializer() {
        let backend = MemoryBackend::new();
        let cache = CacheBuilder::new(PAGE_SIZE * 64)
            .with_page_size(PAGE_SIZE)
            .with_slabs(1)
            .with_max_key_size(16)
            .with_max_object_size(200)
            .with_state_initializer(|entry: &EntryView, _: u32| {
                if entry.key.key.starts_with(b"clean") {
                    CacheState::Shared
                } else {
                    CacheState::Modified
                }
            })
            .with_backend(backend)
            .build()
            .unwrap();

        for k in ["clean-1", "dirty-1"] {
            let (mut guard, lookup) = cache.get_or_create(&key(k), 1).unwrap();
            guard.create_object(lookup.entry, 8).unwrap();
        }
        assert_eq!(state_of(&cache, &key("clean-1")), Some(CacheState::Shared));
        assert_eq!(state_of(&cache, &key("dirty-1")), Some(CacheState::Modified));
    }

    #[test_log::test]
    fn test_modified_limit() {
        let (cache, backend) = cache(CacheMode::WriteBack);
        cache.set_modified_limit(1e-6).unwrap();
        assert_eq!(cache.set_modified_limit(1.5).unwrap_err().kind(), ErrorKind::Config);

        let k = key("k");
        cache.put(&k, b"value", 0, 1).unwrap();
        assert_eq!(state_of(&cache, &k), Some(CacheState::Shared));
        assert_eq!(backend.get(&k), Some(b"value".to_vec()));
        assert_eq!(cache.lock(0).counters().modified_limit_flushes, 1);
    }

    #[test_log::test]
    fn test_modified_limit_flush_failure_keeps_put() {
        let (cache, backend) = cache(CacheMode::WriteBack);
        cache.set_modified_limit(1e-6).unwrap();
        backend.set_fail_writes(true);

        let k = key("k");
        assert_eq!(cache.put(&k, b"new", 0, 1).unwrap(), Outcome::Stored);
        assert_eq!(cache.get(&k, 2).unwrap(), Outcome::Hit(b"new".to_vec()));
        assert_eq!(state_of(&cache, &k), Some(CacheState::Modified));
        assert_eq!(cache.lock(0).counters().modified_limit_flushes, 0);

        // The excess is flushed by the next write once the store recovers.
        backend.set_fail_writes(false);
        cache.put(&key("j"), b"other", 0, 3).unwrap();
        assert_eq!(backend.get(&k), Some(b"new".to_vec()));
        assert_eq!(state_of(&cache, &k), Some(CacheState::Shared));
    }

    #[test_log::test]
    fn test_destroy() {
        let (cache, backend) = cache(CacheMode::WriteBack);
        let free = cache.lock(0).free_pages();
        for i in 0..5 {
            cache.put(&key(&format!("k{i}")), &[0; 50], 0, 1).unwrap();
        }
        cache.destroy().unwrap();
        assert_eq!(cache.lock(0).free_pages(), free);
        assert_eq!(cache.lock(0).counters().objects, 0);
        assert!(backend.is_empty());
        cache.put(&key("k"), b"v", 0, 2).unwrap();
    }
}
