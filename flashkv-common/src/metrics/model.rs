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

use super::{BoxedCounter, BoxedGauge, BoxedHistogram, RegistryOps};

// FIXME: https://github.com/rust-lang/rust-analyzer/issues/17685
// #[expect(missing_docs)]
/// Metrics of an object cache instance.
#[derive(Debug)]
pub struct Metrics {
    /* object operations */
    /// Objects created in the cache.
    pub cache_insert: BoxedCounter,
    /// Objects overwritten in place.
    pub cache_overwrite: BoxedCounter,
    /// Lookups served from the cache.
    pub cache_hit: BoxedCounter,
    /// Lookups that missed the cache.
    pub cache_miss: BoxedCounter,
    /// Objects removed from the cache.
    pub cache_remove: BoxedCounter,
    /// Objects evicted to make room.
    pub cache_evict: BoxedCounter,
    /// Objects expired on access.
    pub cache_expire: BoxedCounter,
    /// Requests posted to the deferred queue of a busy slab.
    pub cache_remote: BoxedCounter,

    /* write back */
    /// Modified objects written back on eviction.
    pub cache_writeback: BoxedCounter,
    /// Modified objects written back by an explicit flush.
    pub cache_flush: BoxedCounter,
    /// Modified objects written back by the background flusher.
    pub cache_background_flush: BoxedCounter,
    /// Modified objects written back to respect the modified limit.
    pub cache_modified_limit_flush: BoxedCounter,

    /// Bytes (with keys) held by resident objects.
    pub cache_usage: BoxedGauge,
    /// Bytes (with keys) held by modified objects.
    pub cache_modified_usage: BoxedGauge,

    /// Duration of full cache flush passes, in seconds.
    pub cache_flush_duration: BoxedHistogram,
    /// Duration of background flusher passes, in seconds.
    pub cache_background_flush_duration: BoxedHistogram,
}

impl Metrics {
    /// Create a new metric with the given name.
    pub fn new<R>(name: &str, registry: &R) -> Self
    where
        R: RegistryOps + ?Sized,
    {
        let flashkv_cache_op_total =
            registry.register_counter_vec("flashkv_cache_op_total", "flashkv object cache operations", &[
                "name", "op",
            ]);
        let flashkv_cache_usage_bytes =
            registry.register_gauge_vec("flashkv_cache_usage_bytes", "flashkv object cache usage", &["name", "type"]);
        let flashkv_cache_flush_duration = registry.register_histogram_vec(
            "flashkv_cache_flush_duration",
            "flashkv object cache flush durations",
            &["name", "op"],
        );

        let cache_insert = flashkv_cache_op_total.counter(&[name, "insert"]);
        let cache_overwrite = flashkv_cache_op_total.counter(&[name, "overwrite"]);
        let cache_hit = flashkv_cache_op_total.counter(&[name, "hit"]);
        let cache_miss = flashkv_cache_op_total.counter(&[name, "miss"]);
        let cache_remove = flashkv_cache_op_total.counter(&[name, "remove"]);
        let cache_evict = flashkv_cache_op_total.counter(&[name, "evict"]);
        let cache_expire = flashkv_cache_op_total.counter(&[name, "expire"]);
        let cache_remote = flashkv_cache_op_total.counter(&[name, "remote"]);

        let cache_writeback = flashkv_cache_op_total.counter(&[name, "writeback"]);
        let cache_flush = flashkv_cache_op_total.counter(&[name, "flush"]);
        let cache_background_flush = flashkv_cache_op_total.counter(&[name, "background_flush"]);
        let cache_modified_limit_flush = flashkv_cache_op_total.counter(&[name, "modified_limit_flush"]);

        let cache_usage = flashkv_cache_usage_bytes.gauge(&[name, "total"]);
        let cache_modified_usage = flashkv_cache_usage_bytes.gauge(&[name, "modified"]);

        let cache_flush_duration = flashkv_cache_flush_duration.histogram(&[name, "flush"]);
        let cache_background_flush_duration = flashkv_cache_flush_duration.histogram(&[name, "background_flush"]);

        Self {
            cache_insert,
            cache_overwrite,
            cache_hit,
            cache_miss,
            cache_remove,
            cache_evict,
            cache_expire,
            cache_remote,
            cache_writeback,
            cache_flush,
            cache_background_flush,
            cache_modified_limit_flush,
            cache_usage,
            cache_modified_usage,
            cache_flush_duration,
            cache_background_flush_duration,
        }
    }

    /// Build noop metrics.
    ///
    /// Note: `noop` is only supposed to be called by other flashkv components.
    #[doc(hidden)]
    pub fn noop() -> Self {
        use super::registry::noop::NoopMetricsRegistry;

        Self::new("test", &NoopMetricsRegistry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::registry::noop::NoopMetricsRegistry;

    fn case(registry: &impl RegistryOps) {
        let metrics = Metrics::new("test", registry);
        metrics.cache_insert.increase(1);
        metrics.cache_usage.absolute(4096);
        metrics.cache_flush_duration.record(0.5);
    }

    #[test]
    fn test_metrics_noop() {
        case(&NoopMetricsRegistry);
    }

    #[cfg(feature = "prometheus")]
    #[test]
    fn test_metrics_prometheus() {
        use crate::metrics::registry::prometheus::PrometheusMetricsRegistry;

        case(&PrometheusMetricsRegistry::new(prometheus::Registry::new()));
    }
}
