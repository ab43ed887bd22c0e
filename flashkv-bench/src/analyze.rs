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
    fmt::Display,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use bytesize::ByteSize;
use flashkv_memory::{Cache, CacheStats};
use hdrhistogram::Histogram;
use parking_lot::RwLock;
use tokio::sync::broadcast;

const LATENCY_MAX_US: u64 = 10_000_000;

fn histogram() -> anyhow::Result<Histogram<u64>> {
    Ok(Histogram::new_with_bounds(1, LATENCY_MAX_US, 2)?)
}

#[derive(Debug)]
pub struct MetricsInner {
    pub put_ios: AtomicU64,
    pub put_bytes: AtomicU64,
    pub get_ios: AtomicU64,
    pub get_miss_ios: AtomicU64,
    pub get_bytes: AtomicU64,

    pub put_lats: RwLock<Histogram<u64>>,
    pub get_lats: RwLock<Histogram<u64>>,
}

/// Operation counters and latency histograms shared by all bench tasks.
#[derive(Debug, Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

impl std::ops::Deref for Metrics {
    type Target = MetricsInner;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        Ok(Self {
            inner: Arc::new(MetricsInner {
                put_ios: AtomicU64::default(),
                put_bytes: AtomicU64::default(),
                get_ios: AtomicU64::default(),
                get_miss_ios: AtomicU64::default(),
                get_bytes: AtomicU64::default(),
                put_lats: RwLock::new(histogram()?),
                get_lats: RwLock::new(histogram()?),
            }),
        })
    }

    pub fn record_put(&self, bytes: usize, lat: Duration) {
        self.put_ios.fetch_add(1, Ordering::Relaxed);
        self.put_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        let lat = (lat.as_micros() as u64).clamp(1, LATENCY_MAX_US);
        if let Err(e) = self.put_lats.write().record(lat) {
            tracing::error!("metrics error: {e:?}, value: {lat}");
        }
    }

    pub fn record_get(&self, bytes: Option<usize>, lat: Duration) {
        self.get_ios.fetch_add(1, Ordering::Relaxed);
        match bytes {
            Some(bytes) => self.get_bytes.fetch_add(bytes as u64, Ordering::Relaxed),
            None => self.get_miss_ios.fetch_add(1, Ordering::Relaxed),
        };
        let lat = (lat.as_micros() as u64).clamp(1, LATENCY_MAX_US);
        if let Err(e) = self.get_lats.write().record(lat) {
            tracing::error!("metrics error: {e:?}, value: {lat}");
        }
    }

    pub fn dump(&self) -> MetricsDump {
        MetricsDump {
            put_ios: self.put_ios.load(Ordering::Relaxed),
            put_bytes: self.put_bytes.load(Ordering::Relaxed),
            get_ios: self.get_ios.load(Ordering::Relaxed),
            get_miss_ios: self.get_miss_ios.load(Ordering::Relaxed),
            get_bytes: self.get_bytes.load(Ordering::Relaxed),
            put_lats: self.put_lats.read().clone(),
            get_lats: self.get_lats.read().clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MetricsDump {
    pub put_ios: u64,
    pub put_bytes: u64,
    pub get_ios: u64,
    pub get_miss_ios: u64,
    pub get_bytes: u64,
    pub put_lats: Histogram<u64>,
    pub get_lats: Histogram<u64>,
}

#[derive(Debug)]
pub struct Analysis {
    elapsed: Duration,
    dump: MetricsDump,
    stats: CacheStats,
}

fn per_sec(v: u64, secs: f64) -> f64 {
    if secs == 0.0 {
        0.0
    } else {
        v as f64 / secs
    }
}

fn percentiles(f: &mut std::fmt::Formatter<'_>, name: &str, histogram: &Histogram<u64>) -> std::fmt::Result {
    writeln!(
        f,
        "{name} lat p50: {}us, p90: {}us, p99: {}us, p999: {}us, max: {}us",
        histogram.value_at_quantile(0.5),
        histogram.value_at_quantile(0.9),
        histogram.value_at_quantile(0.99),
        histogram.value_at_quantile(0.999),
        histogram.max()
    )
}

impl Display for Analysis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let secs = self.elapsed.as_secs_f64();
        let d = &self.dump;
        let miss_ratio = if d.get_ios == 0 {
            0.0
        } else {
            d.get_miss_ios as f64 / d.get_ios as f64
        };

        writeln!(f, "elapsed: {:?}", self.elapsed)?;
        writeln!(
            f,
            "put iops: {:.0}/s, throughput: {}/s",
            per_sec(d.put_ios, secs),
            ByteSize(per_sec(d.put_bytes, secs) as u64)
        )?;
        writeln!(
            f,
            "get iops: {:.0}/s, throughput: {}/s, miss ratio: {:.2}%",
            per_sec(d.get_ios, secs),
            ByteSize(per_sec(d.get_bytes, secs) as u64),
            miss_ratio * 100.0
        )?;
        percentiles(f, "put", &d.put_lats)?;
        percentiles(f, "get", &d.get_lats)?;

        let t = &self.stats.total;
        writeln!(
            f,
            "objects: {}, size: {}, modified: {} ({}), free pages: {}/{}",
            t.objects,
            ByteSize(t.bytes_w_keys as u64),
            t.modified_objects,
            ByteSize(t.modsize_w_keys as u64),
            self.stats.free_pages,
            self.stats.pages
        )?;
        writeln!(
            f,
            "evictions: {}, write backs: {}, flushes: {}, background flushes: {}, modified limit flushes: {}",
            t.evictions, t.writebacks, t.flushes, t.background_flushes, t.modified_limit_flushes
        )
    }
}

pub fn analyze(elapsed: Duration, dump: MetricsDump, stats: CacheStats) -> Analysis {
    Analysis { elapsed, dump, stats }
}

/// Print throughput and cache usage every `interval` until stopped.
pub async fn monitor(cache: Cache, metrics: Metrics, interval: Duration, mut stop: broadcast::Receiver<()>) {
    let mut last = metrics.dump();
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = stop.recv() => return,
        }

        let now = metrics.dump();
        let secs = interval.as_secs_f64();
        let stats = cache.stats();
        println!(
            "put: {:.0}/s, get: {:.0}/s, miss: {:.0}/s, objects: {}, modified: {}, free pages: {}",
            per_sec(now.put_ios - last.put_ios, secs),
            per_sec(now.get_ios - last.get_ios, secs),
            per_sec(now.get_miss_ios - last.get_miss_ios, secs),
            stats.total.objects,
            stats.total.modified_objects,
            stats.free_pages,
        );
        last = now;
    }
}
