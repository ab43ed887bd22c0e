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

use std::{any::Any, collections::HashMap, fmt::Debug, sync::Arc};

use flashkv_common::error::{Error, ErrorKind, Result};
use parking_lot::Mutex;

use crate::{
    entry::{EntryView, ObjectKey},
    protocol::CacheState,
};

/// Task-local context passed to [`Backend::flush`].
///
/// The background flusher builds its own context once, with the setup closure given to
/// [`Cache::start_background_flusher`](crate::Cache::start_background_flusher).
#[derive(Default)]
pub struct FlushContext {
    inner: Option<Box<dyn Any + Send>>,
}

impl Debug for FlushContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlushContext").field("set", &self.inner.is_some()).finish()
    }
}

impl FlushContext {
    /// Wrap a backend specific context.
    pub fn new<T: Any + Send>(ctx: T) -> Self {
        Self {
            inner: Some(Box::new(ctx)),
        }
    }

    /// Get the wrapped context, if it has type `T`.
    pub fn get_mut<T: Any + Send>(&mut self) -> Option<&mut T> {
        self.inner.as_mut().and_then(|ctx| ctx.downcast_mut())
    }
}

/// The backing store the cache sits in front of.
///
/// All calls are made while the slab lock of the entry is held, so they must not call back into the cache.
pub trait Backend: Send + Sync + 'static + Debug {
    /// Durably persist the current key and value of a dirty entry. Called on eviction and forced flush.
    fn write_back(&self, entry: &EntryView) -> Result<()>;

    /// Persist an entry during a cache flush. Same durability contract as [`Backend::write_back`].
    fn flush(&self, entry: &EntryView, ctx: &mut FlushContext, background: bool) -> Result<()> {
        let _ = (ctx, background);
        self.write_back(entry)
    }

    /// Read an object that missed the cache.
    fn fetch(&self, key: &ObjectKey) -> Result<Option<Vec<u8>>> {
        let _ = key;
        Ok(None)
    }

    /// Delete an object from the backing store.
    fn delete(&self, key: &ObjectKey) -> Result<()> {
        let _ = key;
        Ok(())
    }

    /// Render an entry for diagnostic dumps, at most `max_len` bytes.
    fn describe(&self, entry: &EntryView, max_len: usize) -> String {
        let mut s = format!(
            "{{cguid: {}, kind: {:?}, key: {:?}, size: {}, state: {:?}}}",
            entry.key.cguid,
            entry.key.kind,
            String::from_utf8_lossy(&entry.key.key),
            entry.value.len(),
            entry.state
        );
        if s.len() > max_len {
            let mut end = max_len;
            while !s.is_char_boundary(end) {
                end -= 1;
            }
            s.truncate(end);
        }
        s
    }
}

/// Picks the initial coherency state of an entry when it is promoted into the cache.
///
/// Invoked exactly once per entry with the entry snapshot and the creation time.
pub trait StateInitializer: Send + Sync + 'static {
    /// Pick the state.
    fn init(&self, entry: &EntryView, now: u32) -> CacheState;
}

impl<F> StateInitializer for F
where
    F: Fn(&EntryView, u32) -> CacheState + Send + Sync + 'static,
{
    fn init(&self, entry: &EntryView, now: u32) -> CacheState {
        self(entry, now)
    }
}

/// Operation recorded by [`MemoryBackend`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendOp {
    /// [`Backend::write_back`] was called.
    WriteBack(ObjectKey),
    /// [`Backend::flush`] was called.
    Flush {
        /// Key of the flushed entry.
        key: ObjectKey,
        /// Whether the call came from the background flusher.
        background: bool,
    },
    /// [`Backend::fetch`] was called.
    Fetch(ObjectKey),
    /// [`Backend::delete`] was called.
    Delete(ObjectKey),
}

#[derive(Debug, Default)]
struct MemoryBackendInner {
    store: HashMap<ObjectKey, Vec<u8>>,
    ops: Vec<BackendOp>,
    fail_writes: bool,
}

/// Backing store kept in a hash map, recording every call it receives.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<Mutex<MemoryBackendInner>>,
}

impl MemoryBackend {
    /// Create an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Persisted value of `key`.
    pub fn get(&self, key: &ObjectKey) -> Option<Vec<u8>> {
        self.inner.lock().store.get(key).cloned()
    }

    /// Store a value directly, bypassing the cache.
    pub fn insert(&self, key: ObjectKey, value: Vec<u8>) {
        self.inner.lock().store.insert(key, value);
    }

    /// Number of persisted objects.
    pub fn len(&self) -> usize {
        self.inner.lock().store.len()
    }

    /// Whether nothing has been persisted.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Recorded operations, oldest first.
    pub fn ops(&self) -> Vec<BackendOp> {
        self.inner.lock().ops.clone()
    }

    /// Forget the recorded operations.
    pub fn clear_ops(&self) {
        self.inner.lock().ops.clear();
    }

    /// Make every subsequent write fail.
    pub fn set_fail_writes(&self, fail: bool) {
        self.inner.lock().fail_writes = fail;
    }

    fn persist(inner: &mut MemoryBackendInner, entry: &EntryView) -> Result<()> {
        if inner.fail_writes {
            return Err(Error::new(ErrorKind::External, "injected write failure")
                .with_context("key", String::from_utf8_lossy(&entry.key.key)));
        }
        inner.store.insert(entry.key.clone(), entry.value.clone());
        Ok(())
    }
}

impl Backend for MemoryBackend {
    fn write_back(&self, entry: &EntryView) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.ops.push(BackendOp::WriteBack(entry.key.clone()));
        Self::persist(&mut inner, entry)
    }

    fn flush(&self, entry: &EntryView, _: &mut FlushContext, background: bool) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.ops.push(BackendOp::Flush {
            key: entry.key.clone(),
            background,
        });
        Self::persist(&mut inner, entry)
    }

    fn fetch(&self, key: &ObjectKey) -> Result<Option<Vec<u8>>> {
        let mut inner = self.inner.lock();
        inner.ops.push(BackendOp::Fetch(key.clone()));
        Ok(inner.store.get(key).cloned())
    }

    fn delete(&self, key: &ObjectKey) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.ops.push(BackendOp::Delete(key.clone()));
        inner.store.remove(key);
        Ok(())
    }
}
