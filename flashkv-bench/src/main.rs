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

//! Bench tool of the flashkv object cache.

mod analyze;
mod exporter;

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use analyze::{analyze, monitor, Metrics};
use anyhow::{anyhow, Context as _};
use bytesize::MIB;
use clap::Parser;
use exporter::PrometheusExporter;
use flashkv_memory::{
    Cache, CacheBuilder, CacheMode, ContainerKind, FlushContext, FlushOptions, MemoryBackend, ObjectKey, Outcome,
    PrometheusMetricsRegistry,
};
use futures_util::future::join_all;
use itertools::Itertools;
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::{Distribution, Zipf};
use tokio::sync::broadcast;

#[cfg(all(feature = "jemalloc", not(target_env = "msvc")))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

const CGUID: u64 = 1;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about)]
pub struct Args {
    /// Page arena capacity. (MiB)
    #[arg(long, default_value_t = 256)]
    mem: usize,

    /// Page size. (B)
    #[arg(long, default_value_t = 4096)]
    page_size: usize,

    /// Slab count.
    #[arg(long, default_value_t = 16)]
    slabs: usize,

    /// Bucket count.
    #[arg(long, default_value_t = 1 << 16)]
    buckets: usize,

    /// Write policy of the cache.
    #[arg(long, value_enum, default_value_t = CacheMode::WriteBack)]
    mode: CacheMode,

    /// Fraction of each slab that may be dirty.
    #[arg(long, default_value_t = 0.5)]
    modified_fraction: f64,

    /// Min entry size. (B)
    #[arg(long, default_value_t = 1024)]
    entry_size_min: usize,

    /// Max entry size. (B)
    #[arg(long, default_value_t = 16 * 1024)]
    entry_size_max: usize,

    /// Reader lookup key range.
    #[arg(long, default_value_t = 10000)]
    get_range: u64,

    /// Zipf exponent of reader lookups, `0` for uniform lookups.
    #[arg(long, default_value_t = 0.0)]
    zipf_s: f64,

    /// Writer count.
    #[arg(long, default_value_t = 8)]
    writers: usize,

    /// Reader count.
    #[arg(long, default_value_t = 8)]
    readers: usize,

    /// Bench duration, warm up excluded.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "60s")]
    time: Duration,

    #[arg(long, value_parser = humantime::parse_duration, default_value = "2s")]
    warm_up: Duration,

    #[arg(long, value_parser = humantime::parse_duration, default_value = "2s")]
    report_interval: Duration,

    /// Run the background flusher.
    #[arg(long, default_value_t = false)]
    background_flush: bool,

    #[arg(long, value_parser = humantime::parse_duration, default_value = "100ms")]
    background_sleep: Duration,

    #[arg(long, default_value_t = 16)]
    flush_tokens: usize,

    #[arg(long, default_value_t = 4)]
    background_flush_tokens: usize,

    /// Flush the whole cache when the bench ends.
    #[arg(long, default_value_t = false)]
    final_flush: bool,

    /// Serve prometheus metrics.
    #[arg(long, default_value_t = false)]
    metrics: bool,

    #[arg(long, default_value = "0.0.0.0:19970")]
    metrics_addr: SocketAddr,
}

struct Context {
    counts: Vec<AtomicU64>,
    entry_size_range: std::ops::RangeInclusive<usize>,
    get_range: u64,
    zipf_s: f64,
    time: Duration,
    warm_up: Duration,
    metrics: Metrics,
}

fn init_logger() {
    use tracing_subscriber::{prelude::*, EnvFilter};

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_line_number(true))
        .with(EnvFilter::from_default_env())
        .init();
}

fn key(idx: u64) -> ObjectKey {
    ObjectKey::new(CGUID, ContainerKind::Object, format!("bench-{idx:016x}"))
}

/// Deterministic value of `len` bytes for key `idx`, so reads can be verified.
fn value(idx: u64, len: usize) -> Vec<u8> {
    idx.to_le_bytes().iter().copied().cycle().take(len).collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logger();

    #[cfg(feature = "deadlock")]
    {
        std::thread::spawn(move || loop {
            std::thread::sleep(Duration::from_secs(1));
            let deadlocks = parking_lot::deadlock::check_deadlock();
            if deadlocks.is_empty() {
                continue;
            }

            println!("{} deadlocks detected", deadlocks.len());
            for (i, threads) in deadlocks.iter().enumerate() {
                println!("Deadlock #{}", i);
                for t in threads {
                    println!("Thread Id {:#?}", t.thread_id());
                    println!("{:#?}", t.backtrace());
                }
            }
            panic!()
        });
    }

    let args = Args::parse();
    println!("{:#?}", args);
    if args.get_range == 0 || args.writers == 0 {
        return Err(anyhow!("\"--get-range\" and \"--writers\" must be greater than 0"));
    }
    if args.entry_size_min > args.entry_size_max {
        return Err(anyhow!("\"--entry-size-min\" must not exceed \"--entry-size-max\""));
    }
    let registry = prometheus::Registry::new();
    if args.metrics {
        PrometheusExporter::new(registry.clone(), args.metrics_addr).run().await?;
    }

    let backend = MemoryBackend::new();
    let cache = CacheBuilder::new(args.mem * MIB as usize)
        .with_name("bench")
        .with_page_size(args.page_size)
        .with_slabs(args.slabs)
        .with_buckets(args.buckets)
        .with_max_key_size(64)
        .with_max_object_size(args.entry_size_max)
        .with_mode(args.mode)
        .with_modified_fraction(args.modified_fraction)
        .with_flush_tokens(args.flush_tokens)
        .with_background_flush_tokens(args.background_flush_tokens)
        .with_background_sleep(args.background_sleep)
        .with_metrics_registry(Box::new(PrometheusMetricsRegistry::new(registry)))
        .with_backend(backend.clone())
        .build()
        .context("build cache")?;

    let flusher = args
        .background_flush
        .then(|| cache.start_background_flusher(|| Ok(FlushContext::default())));

    let metrics = Metrics::new()?;
    let (stop_tx, _) = broadcast::channel(4096);

    let handle_monitor = tokio::spawn(monitor(
        cache.clone(),
        metrics.clone(),
        args.report_interval,
        stop_tx.subscribe(),
    ));
    let handle_signal = tokio::spawn({
        let stop_tx = stop_tx.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("flashkv-bench is cancelled with CTRL-C");
                let _ = stop_tx.send(());
            }
        }
    });

    let time = Instant::now();
    bench(&args, cache.clone(), metrics.clone(), &stop_tx).await;
    let elapsed = time.elapsed();
    let _ = stop_tx.send(());

    if let Some(flusher) = flusher {
        flusher.close().await?;
    }
    if args.final_flush {
        let options = FlushOptions {
            flush: true,
            ..Default::default()
        };
        let mut progress = |percent: u32| {
            if percent % 10 == 0 {
                println!("final flush: {percent}%");
            }
        };
        let report = cache
            .flush_cache(&options, Some(&mut progress), &mut FlushContext::default())
            .await?;
        println!("final flush: {report:?}, {} objects persisted", backend.len());
    }

    for bucket in (0..cache.buckets()).step_by(cache.buckets() / cache.slabs()) {
        cache.check_heap(bucket)?;
    }

    let analysis = analyze(elapsed, metrics.dump(), cache.stats());

    handle_monitor.abort();
    handle_signal.abort();

    println!("\nTotal:\n{}", analysis);
    Ok(())
}

async fn bench(args: &Args, cache: Cache, metrics: Metrics, stop_tx: &broadcast::Sender<()>) {
    let context = Arc::new(Context {
        counts: (0..args.writers).map(|_| AtomicU64::default()).collect_vec(),
        entry_size_range: args.entry_size_min..=args.entry_size_max,
        get_range: args.get_range,
        zipf_s: args.zipf_s,
        time: args.time,
        warm_up: args.warm_up,
        metrics,
    });

    let w_handles = (0..args.writers)
        .map(|id| tokio::spawn(write(id as u64, cache.clone(), context.clone(), stop_tx.subscribe())))
        .collect_vec();
    let r_handles = (0..args.readers)
        .map(|id| tokio::spawn(read(id as u64, cache.clone(), context.clone(), stop_tx.subscribe())))
        .collect_vec();

    for res in join_all(w_handles.into_iter().chain(r_handles)).await {
        if let Err(e) = res {
            tracing::error!("bench task failed: {e}");
        }
    }
}

fn stopped(start: Instant, context: &Context, stop: &mut broadcast::Receiver<()>) -> bool {
    !matches!(stop.try_recv(), Err(broadcast::error::TryRecvError::Empty))
        || start.elapsed() >= context.time + context.warm_up
}

async fn write(id: u64, cache: Cache, context: Arc<Context>, mut stop: broadcast::Receiver<()>) {
    let start = Instant::now();
    let step = context.counts.len() as u64;
    let mut rng = StdRng::seed_from_u64(id);

    let mut c = 0;
    while !stopped(start, &context, &mut stop) {
        let idx = id + step * c;
        let len = rng.random_range(context.entry_size_range.clone());
        let data = value(idx, len);
        let now = start.elapsed().as_secs() as u32;

        let time = Instant::now();
        if let Err(e) = cache.put(&key(idx), &data, 0, now) {
            tracing::error!("put {idx} failed: {e}");
            return;
        }
        if start.elapsed() > context.warm_up {
            context.metrics.record_put(len, time.elapsed());
        }
        context.counts[id as usize].fetch_add(1, Ordering::Relaxed);

        c += 1;
        tokio::task::consume_budget().await;
    }
}

async fn read(id: u64, cache: Cache, context: Arc<Context>, mut stop: broadcast::Receiver<()>) {
    let start = Instant::now();
    let step = context.counts.len() as u64;
    let window = (context.get_range / step).max(1);
    let zipf = match context.zipf_s {
        s if s > 0.0 => Some(Zipf::new(window as f64, s).expect("invalid zipf exponent")),
        _ => None,
    };
    let mut rng = StdRng::seed_from_u64(u64::MAX - id);

    while !stopped(start, &context, &mut stop) {
        // Pick a writer to read from.
        let w = rng.random_range(0..step);
        let c_w = context.counts[w as usize].load(Ordering::Relaxed);
        if c_w == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
            continue;
        }
        // Recent keys of the writer, the newest first under zipf.
        let back = match &zipf {
            Some(zipf) => zipf.sample(&mut rng) as u64 - 1,
            None => rng.random_range(0..window),
        };
        let c = c_w - 1 - back.min(c_w - 1);
        let idx = w + c * step;
        let now = start.elapsed().as_secs() as u32;

        let time = Instant::now();
        let res = match cache.get(&key(idx), now) {
            Ok(res) => res,
            Err(e) => {
                tracing::error!("get {idx} failed: {e}");
                return;
            }
        };
        let lat = time.elapsed();

        let bytes = match res {
            Outcome::Hit(data) => {
                assert_eq!(data, value(idx, data.len()), "value mismatch, key: {idx}");
                Some(data.len())
            }
            _ => None,
        };
        if start.elapsed() > context.warm_up {
            context.metrics.record_get(bytes, lat);
        }

        tokio::task::consume_budget().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mode() {
        let args = Args::try_parse_from(["flashkv-bench"]).unwrap();
        assert_eq!(args.mode, CacheMode::WriteBack);

        let args = Args::try_parse_from(["flashkv-bench", "--mode", "write-through"]).unwrap();
        assert_eq!(args.mode, CacheMode::WriteThrough);

        assert!(Args::try_parse_from(["flashkv-bench", "--mode", "write-around"]).is_err());
    }
}
