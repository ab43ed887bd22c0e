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

//! End-to-end tests of the object cache through its public surface.

use std::time::Duration;

use flashkv_memory::{
    BackendOp, Cache, CacheBuilder, CacheMode, CacheState, ContainerKind, ErrorKind, FlushContext, FlushOptions,
    MemoryBackend, ModifiedCursor, ObjectKey, Outcome,
};

const PAGE_SIZE: usize = 64;
const MAX_KEY_SIZE: usize = 8;
const MAX_OBJECT_SIZE: usize = 160;
// (header 40 + key 8 + value 160) / 56 bytes of data per page.
const MAX_OBJECT_PAGES: usize = 4;

fn key(cguid: u64, i: usize) -> ObjectKey {
    ObjectKey::new(cguid, ContainerKind::Object, format!("key-{i:04}"))
}

fn builder(pages: usize, backend: &MemoryBackend) -> CacheBuilder {
    CacheBuilder::new(PAGE_SIZE * pages)
        .with_name("test")
        .with_page_size(PAGE_SIZE)
        .with_slabs(1)
        .with_buckets(16)
        .with_max_key_size(MAX_KEY_SIZE)
        .with_max_object_size(MAX_OBJECT_SIZE)
        .with_modified_fraction(1.0)
        .with_backend(backend.clone())
}

fn state(cache: &Cache, key: &ObjectKey) -> Option<CacheState> {
    let guard = cache.lock(cache.slab_of(cache.bucket_of(key)));
    let entry = guard.get(key).unwrap()?;
    Some(guard.state(entry).unwrap())
}

#[test_log::test]
fn test_evict_lru_tail_when_full() {
    let backend = MemoryBackend::new();
    let cache = builder(3 * MAX_OBJECT_PAGES, &backend).build().unwrap();
    let keys = (0..4).map(|i| key(1, i)).collect::<Vec<_>>();

    for (i, k) in keys.iter().take(3).enumerate() {
        cache.create(k, &[i as u8; MAX_OBJECT_SIZE], 0, i as u32).unwrap();
    }
    assert_eq!(cache.stats().free_pages, 0);
    assert!(backend.ops().is_empty());

    assert_eq!(
        cache.create(&keys[3], &[3; MAX_OBJECT_SIZE], 0, 3).unwrap(),
        Outcome::Stored
    );

    // Only the oldest object is reclaimed, and it is persisted before its pages are reused.
    assert_eq!(state(&cache, &keys[0]), None);
    assert_eq!(backend.ops(), vec![BackendOp::WriteBack(keys[0].clone())]);
    assert_eq!(backend.get(&keys[0]), Some(vec![0; MAX_OBJECT_SIZE]));
    for k in &keys[1..] {
        assert_eq!(state(&cache, k), Some(CacheState::Modified));
    }

    let stats = cache.stats();
    assert_eq!(stats.total.objects, 3);
    assert_eq!(stats.total.evictions, 1);
    assert_eq!(stats.total.writebacks, 1);
    assert_eq!(stats.free_pages, 0);
    cache.check_heap(0).unwrap();
}

#[test_log::test]
fn test_evict_clean_victim_without_write_back() {
    let backend = MemoryBackend::new();
    let cache = builder(3 * MAX_OBJECT_PAGES, &backend)
        .with_mode(CacheMode::WriteThrough)
        .build()
        .unwrap();
    let keys = (0..4).map(|i| key(1, i)).collect::<Vec<_>>();

    for k in &keys {
        cache.put(k, &[7; MAX_OBJECT_SIZE], 0, 1).unwrap();
    }
    assert_eq!(state(&cache, &keys[0]), None);
    // Every write went through on its own, the clean victim is dropped without another write.
    assert_eq!(
        backend.ops(),
        keys.iter().cloned().map(BackendOp::WriteBack).collect::<Vec<_>>()
    );
    assert_eq!(backend.len(), 4);
    assert_eq!(cache.stats().total.writebacks, 0);
}

#[test_log::test]
fn test_failed_resize_keeps_dirty_value() {
    let backend = MemoryBackend::new();
    let cache = builder(3 * MAX_OBJECT_PAGES, &backend).build().unwrap();
    let (a, b, c, d) = (key(1, 0), key(1, 1), key(1, 2), key(1, 3));

    // 1 + 4 + 4 + 2 pages, one page left.
    cache.put(&a, b"A", 0, 1).unwrap();
    cache.put(&b, &[2; MAX_OBJECT_SIZE], 0, 2).unwrap();
    cache.put(&c, &[3; MAX_OBJECT_SIZE], 0, 3).unwrap();
    cache.put(&d, &[4; 60], 0, 4).unwrap();
    assert_eq!(cache.stats().free_pages, 1);

    // Growing `a` needs the dirty `b` evicted, and its write-back fails.
    backend.set_fail_writes(true);
    let err = cache.put(&a, &[9; MAX_OBJECT_SIZE], 0, 5).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::External);
    assert_eq!(cache.get(&a, 6).unwrap(), Outcome::Hit(b"A".to_vec()));
    assert_eq!(state(&cache, &a), Some(CacheState::Modified));
    assert_eq!(state(&cache, &b), Some(CacheState::Modified));
    assert!(backend.is_empty());
    assert_eq!(cache.stats().free_pages, 1);
    cache.check_heap(0).unwrap();

    backend.set_fail_writes(false);
    assert_eq!(cache.put(&a, &[9; MAX_OBJECT_SIZE], 0, 7).unwrap(), Outcome::Stored);
    assert_eq!(cache.get(&a, 8).unwrap(), Outcome::Hit(vec![9; MAX_OBJECT_SIZE]));
    assert_eq!(state(&cache, &b), None);
    assert_eq!(backend.get(&b), Some(vec![2; MAX_OBJECT_SIZE]));
    cache.check_heap(0).unwrap();
}

#[test_log::test]
fn test_failed_limit_flush_keeps_put() {
    let backend = MemoryBackend::new();
    let cache = builder(64, &backend).with_modified_fraction(0.001).build().unwrap();
    let k = key(1, 0);

    backend.set_fail_writes(true);
    assert_eq!(cache.put(&k, b"new", 0, 1).unwrap(), Outcome::Stored);
    assert_eq!(cache.get(&k, 2).unwrap(), Outcome::Hit(b"new".to_vec()));
    assert_eq!(state(&cache, &k), Some(CacheState::Modified));
    assert_eq!(cache.stats().total.modified_limit_flushes, 0);
    cache.check_heap(0).unwrap();
}

#[test_log::test(tokio::test)]
async fn test_flush_keeps_objects_clean() {
    let backend = MemoryBackend::new();
    let cache = builder(64, &backend).build().unwrap();
    let k = key(1, 0);

    cache.create(&k, b"value", 0, 1).unwrap();
    assert_eq!(state(&cache, &k), Some(CacheState::Modified));
    let before = cache.stats().total.modsize_w_keys;
    assert_eq!(before, k.key.len() + 5);

    let options = FlushOptions {
        flush: true,
        ..Default::default()
    };
    let report = cache
        .flush_cache(&options, None, &mut FlushContext::default())
        .await
        .unwrap();
    assert_eq!(report.flushed, 1);
    assert_eq!(report.invalidated, 0);

    assert_eq!(state(&cache, &k), Some(CacheState::Shared));
    assert_eq!(cache.stats().total.modsize_w_keys, 0);
    assert_eq!(cache.get(&k, 2).unwrap(), Outcome::Hit(b"value".to_vec()));
    assert_eq!(backend.ops(), vec![BackendOp::Flush {
        key: k.clone(),
        background: false
    }]);
}

#[test_log::test(tokio::test)]
async fn test_invalidate_without_flush() {
    let backend = MemoryBackend::new();
    let cache = builder(64, &backend).build().unwrap();
    let free = cache.stats().free_pages;
    let k = key(1, 0);

    cache.create(&k, &[1; 100], 0, 1).unwrap();
    assert!(cache.stats().free_pages < free);

    let options = FlushOptions {
        invalidate: true,
        ..Default::default()
    };
    let report = cache
        .flush_cache(&options, None, &mut FlushContext::default())
        .await
        .unwrap();
    assert_eq!(report.invalidated, 1);
    assert_eq!(report.flushed, 0);
    assert_eq!(report.skipped_slabs, 1);

    assert_eq!(state(&cache, &k), None);
    assert_eq!(cache.stats().free_pages, free);
    assert!(backend.ops().is_empty());
    cache.check_heap(cache.bucket_of(&k)).unwrap();
}

#[test_log::test]
fn test_enumerate_empty_cache() {
    let backend = MemoryBackend::new();
    let cache = builder(64, &backend).build().unwrap();

    let mut enumeration = cache.start_enumeration(None);
    assert_eq!(enumeration.next(), None);
    enumeration.end();
}

#[test_log::test(tokio::test)]
async fn test_flush_filters_and_progress() {
    let backend = MemoryBackend::new();
    let cache = CacheBuilder::new(PAGE_SIZE * 256)
        .with_page_size(PAGE_SIZE)
        .with_slabs(4)
        .with_buckets(16)
        .with_max_key_size(16)
        .with_max_object_size(MAX_OBJECT_SIZE)
        .with_modified_fraction(1.0)
        .with_flush_tokens(2)
        .with_backend(backend.clone())
        .build()
        .unwrap();

    for i in 0..20 {
        cache.put(&key(1, i), b"one", 0, 1).unwrap();
        cache.put(&key(2, i), b"two", 0, 1).unwrap();
    }
    let prefixed = ObjectKey::new(2, ContainerKind::Object, "tmp-0");
    cache.put(&prefixed, b"tmp", 0, 1).unwrap();

    let mut percents = vec![];
    let mut progress = |percent: u32| percents.push(percent);
    let options = FlushOptions {
        cguid: Some(1),
        flush: true,
        ..Default::default()
    };
    let report = cache
        .flush_cache(&options, Some(&mut progress), &mut FlushContext::default())
        .await
        .unwrap();
    assert_eq!(report.flushed, 20);
    assert_eq!(percents.last(), Some(&100));
    assert!(percents.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(cache.stats().total.modified_objects, 21);
    assert_eq!(cache.stats().flush_tokens, 2);

    let options = FlushOptions {
        prefix: Some(b"tmp-".to_vec()),
        flush: true,
        invalidate: true,
        ..Default::default()
    };
    let report = cache
        .flush_cache(&options, None, &mut FlushContext::default())
        .await
        .unwrap();
    assert_eq!(report.flushed, 1);
    assert_eq!(report.invalidated, 1);
    assert_eq!(state(&cache, &prefixed), None);
    assert_eq!(backend.get(&prefixed), Some(b"tmp".to_vec()));
    assert_eq!(state(&cache, &key(2, 0)), Some(CacheState::Modified));

    for slab in 0..cache.slabs() {
        cache.lock(slab).check().unwrap();
    }
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn test_background_flusher() {
    let backend = MemoryBackend::new();
    let cache = builder(64, &backend)
        .with_background_sleep(Duration::from_millis(10))
        .build()
        .unwrap();

    let flusher = cache.start_background_flusher(|| Ok(FlushContext::new(42u64)));
    for i in 0..8 {
        cache.put(&key(1, i), b"value", 0, 1).unwrap();
    }

    let mut clean = false;
    for _ in 0..500 {
        if cache.stats().total.modified_objects == 0 {
            clean = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(clean);
    flusher.close().await.unwrap();

    assert_eq!(backend.len(), 8);
    assert!(backend
        .ops()
        .iter()
        .all(|op| matches!(op, BackendOp::Flush { background: true, .. })));
    assert_eq!(cache.stats().total.background_flushes, 8);

    cache
        .set_background_flush_tokens(1, Duration::from_millis(5))
        .unwrap();
    assert_eq!(cache.stats().background_flush_tokens, 1);
    assert_eq!(cache.set_flush_tokens(0).unwrap_err().kind(), ErrorKind::Config);
}

#[test_log::test]
fn test_enumerate_all_and_filtered() {
    let backend = MemoryBackend::new();
    let cache = builder(256, &backend).build().unwrap();

    let mut expected = vec![];
    for i in 0..10 {
        for cguid in [1, 2] {
            let k = key(cguid, i);
            cache.put(&k, b"v", 0, 1).unwrap();
            expected.push(k);
        }
    }

    let mut all = cache.start_enumeration(None).collect::<Vec<_>>();
    all.sort_by(|a, b| (a.cguid, &a.key).cmp(&(b.cguid, &b.key)));
    expected.sort_by(|a, b| (a.cguid, &a.key).cmp(&(b.cguid, &b.key)));
    assert_eq!(all, expected);

    let filtered = cache.start_enumeration(Some(2)).collect::<Vec<_>>();
    assert_eq!(filtered.len(), 10);
    assert!(filtered.iter().all(|k| k.cguid == 2));

    // Ending early clears the marks, so a new pass sees everything again.
    let mut partial = cache.start_enumeration(None);
    assert!(partial.next().is_some());
    partial.end();
    assert_eq!(cache.start_enumeration(None).count(), 20);
}

#[test_log::test]
fn test_get_modified_objects() {
    let backend = MemoryBackend::new();
    let cache = builder(256, &backend).build().unwrap();

    for i in 0..12 {
        cache.put(&key(1, i), format!("value-{i}").as_bytes(), 0, i as u32).unwrap();
    }
    cache.flush_object(&key(1, 0), 20).unwrap();
    cache.flush_object(&key(1, 1), 20).unwrap();

    let mut cursor = ModifiedCursor::new();
    let mut collected = vec![];
    loop {
        let batch = cache.get_modified_objects(&mut cursor, 3);
        if batch.is_empty() {
            break;
        }
        collected.extend(batch);
    }
    assert_eq!(cursor.bucket(), cache.buckets());
    assert_eq!(collected.len(), 10);
    for object in &collected {
        let i = (2..12).find(|&i| key(1, i) == object.key).unwrap();
        assert_eq!(object.value, format!("value-{i}").into_bytes());
        assert_eq!(object.created, i as u32);
    }

    cursor.cleanup();
    assert_eq!(cursor.bucket(), 0);
    assert_eq!(cache.get_modified_objects(&mut cursor, usize::MAX).len(), 10);
}

#[test_log::test]
fn test_stats_and_check_heap() {
    let backend = MemoryBackend::new();
    let cache = builder(64, &backend).build().unwrap();

    cache.put(&key(1, 0), &[0; 100], 0, 1).unwrap();
    cache.put(&key(1, 1), &[0; 10], 0, 1).unwrap();

    let stats = cache.stats();
    assert_eq!(stats.pages, 64);
    assert_eq!(stats.slabs.len(), 1);
    assert_eq!(stats.total.objects, 2);
    assert_eq!(stats.total.bytes_wo_keys, 110);
    assert_eq!(stats.total.bytes_w_keys, 110 + 16);
    // 3 pages for (40 + 8 + 100) bytes, 2 pages for (40 + 8 + 10) bytes.
    assert_eq!(stats.free_pages, 64 - 5);
    assert_eq!(stats.pending_remote_requests, 0);

    let json = serde_json::to_string(&stats).unwrap();
    assert!(json.contains("\"free_pages\":59"));

    cache.check_heap(0).unwrap();
    assert_eq!(cache.check_heap(cache.buckets()).unwrap_err().kind(), ErrorKind::Invalid);
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_concurrent_writers_and_flush() {
    let backend = MemoryBackend::new();
    let cache = CacheBuilder::new(PAGE_SIZE * 2048)
        .with_page_size(PAGE_SIZE)
        .with_slabs(4)
        .with_buckets(64)
        .with_max_key_size(MAX_KEY_SIZE)
        .with_max_object_size(MAX_OBJECT_SIZE)
        .with_modified_fraction(1.0)
        .with_flush_tokens(1)
        .with_backend(backend.clone())
        .build()
        .unwrap();

    let writers = (0..4u64).map(|cguid| {
        let cache = cache.clone();
        tokio::spawn(async move {
            for i in 0..50 {
                cache.put(&key(cguid, i), &[cguid as u8; 16], 0, 1).unwrap();
                if i % 10 == 0 {
                    tokio::task::yield_now().await;
                }
            }
        })
    });
    let flusher = {
        let cache = cache.clone();
        tokio::spawn(async move {
            let options = FlushOptions {
                flush: true,
                ..Default::default()
            };
            cache
                .flush_cache(&options, None, &mut FlushContext::default())
                .await
                .unwrap()
        })
    };
    for result in futures_util::future::join_all(writers).await {
        result.unwrap();
    }
    flusher.await.unwrap();

    let options = FlushOptions {
        flush: true,
        ..Default::default()
    };
    cache
        .flush_cache(&options, None, &mut FlushContext::default())
        .await
        .unwrap();

    let stats = cache.stats();
    assert_eq!(stats.total.objects, 200);
    assert_eq!(stats.total.modified_objects, 0);
    assert_eq!(backend.len(), 200);
    for slab in 0..cache.slabs() {
        cache.lock(slab).check().unwrap();
    }
}
