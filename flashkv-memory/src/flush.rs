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
    sync::atomic::{AtomicUsize, Ordering},
    time::{Duration, Instant},
};

use flashkv_common::error::{Error, ErrorKind, Result};
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{oneshot, Semaphore, SemaphorePermit},
    task::JoinHandle,
};

use crate::{
    backend::FlushContext,
    cache::{Cache, SlabGuard},
    protocol::CacheState,
};

/// Counting admission control over concurrent bucket flushes.
///
/// Shrinking a pool whose tokens are in use records a debt that returning tokens pay off.
#[derive(Debug)]
pub struct TokenPool {
    semaphore: Semaphore,
    size: AtomicUsize,
    debt: AtomicUsize,
}

/// A token acquired from a [`TokenPool`], returned on drop.
#[derive(Debug)]
pub struct Token<'a> {
    permit: Option<SemaphorePermit<'a>>,
    pool: &'a TokenPool,
}

impl Drop for Token<'_> {
    fn drop(&mut self) {
        if let Some(permit) = self.permit.take() {
            if self.pool.pay_debt() {
                permit.forget();
            }
        }
    }
}

impl TokenPool {
    /// Create a pool of `size` tokens.
    pub fn new(size: usize) -> Self {
        Self {
            semaphore: Semaphore::new(size),
            size: AtomicUsize::new(size),
            debt: AtomicUsize::new(0),
        }
    }

    /// Configured token count.
    pub fn size(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    /// Tokens not in use.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Wait for a token.
    pub async fn acquire(&self) -> Result<Token<'_>> {
        let permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|e| Error::new(ErrorKind::Closed, "token pool closed").with_source(e))?;
        Ok(Token {
            permit: Some(permit),
            pool: self,
        })
    }

    /// Change the token count.
    pub fn resize(&self, size: usize) -> Result<()> {
        if size == 0 {
            return Err(Error::config("token pool must not be empty"));
        }
        let old = self.size.swap(size, Ordering::Relaxed);
        if size > old {
            let mut grow = size - old;
            while grow > 0 && self.pay_debt() {
                grow -= 1;
            }
            self.semaphore.add_permits(grow);
        } else {
            let shrink = old - size;
            let forgotten = self.semaphore.forget_permits(shrink);
            self.debt.fetch_add(shrink - forgotten, Ordering::Relaxed);
        }
        Ok(())
    }

    fn pay_debt(&self) -> bool {
        self.debt
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |debt| debt.checked_sub(1))
            .is_ok()
    }
}

/// Selection and behavior of [`Cache::flush_cache`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushOptions {
    /// Only objects of this container.
    pub cguid: Option<u64>,
    /// Only objects whose key starts with this prefix.
    pub prefix: Option<Vec<u8>>,
    /// Persist matching dirty objects.
    pub flush: bool,
    /// Drop matching objects from the cache.
    pub invalidate: bool,
    /// The flush is a background sweep and also takes background tokens.
    pub background: bool,
}

/// Summary of a [`Cache::flush_cache`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushReport {
    /// Dirty objects persisted.
    pub flushed: usize,
    /// Objects dropped from the cache.
    pub invalidated: usize,
    /// Slabs with nothing to flush, skipped by the bucket pass.
    pub skipped_slabs: usize,
}

impl SlabGuard<'_> {
    fn matches(&self, index: usize, options: &FlushOptions) -> bool {
        let meta = self.slab.meta(index);
        if options.cguid.is_some_and(|cguid| cguid != meta.header.cguid) {
            return false;
        }
        match options.prefix.as_deref() {
            Some(prefix) => self.slab.read_key(index).starts_with(prefix),
            None => true,
        }
    }

    /// Drop matching objects that need no write-back: all of them without `flush`, the clean ones with it.
    fn invalidate_matching(&mut self, options: &FlushOptions) -> Result<usize> {
        if !options.invalidate {
            return Ok(0);
        }
        let mut invalidated = 0;
        for i in self.slab.lru_entries() {
            if !self.matches(i, options) || (options.flush && self.slab.meta(i).state == CacheState::Modified) {
                continue;
            }
            self.slab.remove(i)?;
            self.cache.metrics.cache_remove.increase(1);
            invalidated += 1;
        }
        Ok(invalidated)
    }

    /// Persist the matching dirty objects of `bucket`, dropping them afterwards with `invalidate`.
    fn flush_bucket(&mut self, bucket: usize, options: &FlushOptions, ctx: &mut FlushContext) -> Result<(usize, usize)> {
        let (mut flushed, mut invalidated) = (0, 0);
        for i in self.slab.bucket_entries(bucket) {
            if self.slab.meta(i).state != CacheState::Modified || !self.matches(i, options) {
                continue;
            }
            let view = self.slab.view(i);
            self.slab.backend().flush(&view, ctx, options.background)?;
            self.slab.set_state(i, CacheState::Shared);
            if options.background {
                self.slab.counters_mut().background_flushes += 1;
                self.cache.metrics.cache_background_flush.increase(1);
            } else {
                self.slab.counters_mut().flushes += 1;
                self.cache.metrics.cache_flush.increase(1);
            }
            flushed += 1;

            if options.invalidate {
                self.slab.remove(i)?;
                self.cache.metrics.cache_remove.increase(1);
                invalidated += 1;
            }
        }
        Ok((flushed, invalidated))
    }
}

impl Cache {
    /// Persist and/or drop every matching object.
    ///
    /// The first pass visits every slab once: it applies deferred requests, drops objects that need no write-back
    /// and notes the slabs without dirty data. The second pass visits buckets row by row, round robin across the
    /// remaining slabs, taking one flush token (and one background token for background sweeps) per bucket before
    /// locking its slab. `progress` receives the completed percentage after each row.
    pub async fn flush_cache(
        &self,
        options: &FlushOptions,
        mut progress: Option<&mut (dyn FnMut(u32) + Send)>,
        ctx: &mut FlushContext,
    ) -> Result<FlushReport> {
        let start = Instant::now();
        let mut report = FlushReport::default();

        let mut slabs = Vec::with_capacity(self.slabs());
        for slab in 0..self.slabs() {
            let mut guard = self.lock(slab);
            report.invalidated += guard.invalidate_matching(options)?;
            let counters = guard.counters();
            if options.flush && counters.objects > 0 && counters.modified_objects > 0 {
                slabs.push(slab);
            } else {
                report.skipped_slabs += 1;
            }
        }

        let rows = self.inner.layout.buckets_per_slab;
        let mut reported = 0;
        if !slabs.is_empty() {
            for row in 0..rows {
                for &slab in slabs.iter() {
                    let _token = self.inner.flush_tokens.acquire().await?;
                    let _background_token = if options.background {
                        Some(self.inner.background_flush_tokens.acquire().await?)
                    } else {
                        None
                    };
                    let (flushed, invalidated) = {
                        let mut guard = self.lock(slab);
                        guard.flush_bucket(slab * rows + row, options, ctx)?
                    };
                    report.flushed += flushed;
                    report.invalidated += invalidated;
                }

                let percent = ((row + 1) * 100 / rows) as u32;
                if percent != reported {
                    reported = percent;
                    if let Some(progress) = progress.as_mut() {
                        progress(percent);
                    }
                }
            }
        }
        if reported != 100 {
            if let Some(progress) = progress.as_mut() {
                progress(100);
            }
        }

        let elapsed = start.elapsed().as_secs_f64();
        if options.background {
            self.inner.metrics.cache_background_flush_duration.record(elapsed);
        } else {
            self.inner.metrics.cache_flush_duration.record(elapsed);
        }
        tracing::debug!("[flusher]: flush cache with {options:?} done in {elapsed:.3}s, {report:?}");

        Ok(report)
    }

    /// Change the size of the flush token pool.
    pub fn set_flush_tokens(&self, tokens: usize) -> Result<()> {
        self.inner.flush_tokens.resize(tokens)?;
        tracing::info!("[flusher]: flush tokens set to {tokens}");
        Ok(())
    }

    /// Change the size of the background token pool and the idle interval of the background flusher.
    pub fn set_background_flush_tokens(&self, tokens: usize, sleep: Duration) -> Result<()> {
        self.inner.background_flush_tokens.resize(tokens)?;
        self.inner
            .background_sleep_ms
            .store(sleep.as_millis() as u64, Ordering::Relaxed);
        tracing::info!("[flusher]: background flush tokens set to {tokens}, idle sleep {sleep:?}");
        Ok(())
    }

    fn background_sleep(&self) -> Duration {
        Duration::from_millis(self.inner.background_sleep_ms.load(Ordering::Relaxed))
    }

    /// Spawn the background flusher on the current tokio runtime.
    ///
    /// `setup` runs once inside the task and builds the context passed to every background flush.
    pub fn start_background_flusher<F>(&self, setup: F) -> BackgroundFlusher
    where
        F: FnOnce() -> Result<FlushContext> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let cache = self.clone();
        let handle = tokio::spawn(async move { cache.run_background_flusher(setup, rx).await });
        BackgroundFlusher {
            stop: Some(tx),
            handle: Some(handle),
        }
    }

    async fn run_background_flusher<F>(self, setup: F, mut stop: oneshot::Receiver<()>)
    where
        F: FnOnce() -> Result<FlushContext> + Send + 'static,
    {
        let mut ctx = match setup() {
            Ok(ctx) => ctx,
            Err(e) => {
                tracing::error!("[flusher]: background flusher setup failed: {e}");
                return;
            }
        };
        tracing::info!("[flusher]: background flusher of {} started", self.inner.config.name);

        let options = FlushOptions {
            flush: true,
            background: true,
            ..Default::default()
        };
        loop {
            if !matches!(stop.try_recv(), Err(oneshot::error::TryRecvError::Empty)) {
                break;
            }
            let flushed = match self.flush_cache(&options, None, &mut ctx).await {
                Ok(report) => report.flushed,
                Err(e) => {
                    tracing::error!("[flusher]: background flush failed: {e}");
                    0
                }
            };
            if flushed == 0 {
                tokio::select! {
                    _ = &mut stop => break,
                    _ = tokio::time::sleep(self.background_sleep()) => {}
                }
            } else {
                tokio::task::yield_now().await;
            }
        }

        tracing::info!("[flusher]: background flusher of {} stopped", self.inner.config.name);
    }
}

/// Handle of a running background flusher. Dropping it also stops the flusher.
#[derive(Debug)]
pub struct BackgroundFlusher {
    stop: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl BackgroundFlusher {
    /// Stop the flusher and wait for its task. A pass in progress runs to completion first.
    pub async fn close(mut self) -> Result<()> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.handle.take() {
            handle
                .await
                .map_err(|e| Error::new(ErrorKind::Closed, "background flusher task failed").with_source(e))?;
        }
        Ok(())
    }
}
