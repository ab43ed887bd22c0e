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

//! Fuzzy test of the object cache against a model of the visible values.

use std::collections::HashMap;

use flashkv_memory::{Cache, CacheBuilder, ContainerKind, Error, ErrorKind, MemoryBackend, ObjectKey, Outcome};
use rand::{rngs::StdRng, Rng, SeedableRng};

const KEYS: usize = 64;
const OPS: usize = 20_000;
const MAX_OBJECT_SIZE: usize = 200;

fn key(i: usize) -> ObjectKey {
    ObjectKey::new((i % 3) as u64, ContainerKind::Object, format!("key-{i:04}"))
}

fn audit(cache: &Cache) {
    for slab in 0..cache.slabs() {
        cache.lock(slab).check().unwrap();
    }
    let stats = cache.stats();
    assert!(stats.free_pages <= stats.pages);
    assert!(stats.total.modsize_w_keys <= stats.total.bytes_w_keys);
}

fn run(seed: u64, fraction: f64, faults: bool) {
    let mut rng = StdRng::seed_from_u64(seed);
    let backend = MemoryBackend::new();
    let cache = CacheBuilder::new(64 * 64)
        .with_page_size(64)
        .with_slabs(2)
        .with_buckets(8)
        .with_max_key_size(16)
        .with_max_object_size(MAX_OBJECT_SIZE)
        .with_modified_fraction(fraction)
        .with_max_flushes_per_call(2)
        .with_backend(backend.clone())
        .build()
        .unwrap();

    // Value a read of each key must observe.
    let mut model: HashMap<usize, Vec<u8>> = HashMap::new();
    let mut failing = false;

    for op in 0..OPS {
        let i = rng.random_range(0..KEYS);
        let k = key(i);
        let now = op as u32;

        if faults && rng.random_bool(0.02) {
            failing = !failing;
            backend.set_fail_writes(failing);
        }
        // A failed operation must leave every visible value as it was.
        let failed = |e: Error| {
            assert!(failing, "seed: {seed}, op: {op}, key: {i}, unexpected error: {e}");
            assert_eq!(e.kind(), ErrorKind::External, "seed: {seed}, op: {op}, key: {i}");
        };

        match rng.random_range(0..100) {
            0..40 => {
                let len = rng.random_range(0..=MAX_OBJECT_SIZE);
                let value = vec![rng.random::<u8>(); len];
                match cache.put(&k, &value, 0, now) {
                    Ok(outcome) => {
                        assert_eq!(outcome, Outcome::Stored);
                        model.insert(i, value);
                    }
                    Err(e) => failed(e),
                }
            }
            40..75 => {
                let expected = match model.get(&i) {
                    Some(value) => Outcome::Hit(value.clone()),
                    None => Outcome::Miss,
                };
                match cache.get(&k, now) {
                    Ok(outcome) => assert_eq!(outcome, expected, "seed: {seed}, op: {op}, key: {i}"),
                    Err(e) => failed(e),
                }
            }
            75..85 => {
                cache.delete(&k, now).unwrap();
                model.remove(&i);
            }
            85..92 => {
                if let Err(e) = cache.flush_object(&k, now) {
                    failed(e);
                }
            }
            _ => {
                let flush = rng.random_bool(0.5);
                match cache.invalidate(&k, flush, now) {
                    Ok(_) => match backend.get(&k) {
                        Some(value) => model.insert(i, value),
                        None => model.remove(&i),
                    },
                    Err(e) => {
                        failed(e);
                        None
                    }
                };
            }
        }

        if op % 100 == 0 {
            audit(&cache);
        }
    }
    backend.set_fail_writes(false);
    audit(&cache);
    for (&i, value) in model.iter() {
        assert_eq!(cache.get(&key(i), OPS as u32).unwrap(), Outcome::Hit(value.clone()), "seed: {seed}, key: {i}");
    }

    let stats = cache.stats();
    assert!(stats.total.evictions > 0, "seed: {seed}, the workload must overflow the cache");

    cache.destroy().unwrap();
    let stats = cache.stats();
    assert_eq!(stats.free_pages, stats.pages);
    assert_eq!(stats.total.objects, 0);
}

#[test_log::test]
fn test_cache_fuzzy_write_back() {
    for seed in 0..4 {
        run(seed, 1.0, false);
    }
}

#[test_log::test]
fn test_cache_fuzzy_modified_limit() {
    for seed in 4..8 {
        run(seed, 0.25, false);
    }
}

#[test_log::test]
fn test_cache_fuzzy_write_failures() {
    for seed in 8..12 {
        run(seed, 0.25, true);
    }
}
