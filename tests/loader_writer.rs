//! System-of-record integration: read-through loads, synchronous
//! write-through, and the deferred write-behind path.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use stratacache::prelude::*;

/// In-memory system of record that records every call.
#[derive(Default)]
struct RecordingStore {
    store: Mutex<HashMap<u64, String>>,
    writes: Mutex<Vec<(u64, String)>>,
    deletes: Mutex<Vec<u64>>,
    fail_writes: AtomicU32,
    fail_loads: AtomicBool,
}

impl RecordingStore {
    fn with_entry(key: u64, value: &str) -> Self {
        let store = Self::default();
        store.store.lock().insert(key, value.to_string());
        store
    }
}

impl CacheLoaderWriter<u64, String> for RecordingStore {
    fn load(&self, key: &u64) -> Result<Option<String>, CacheError> {
        if self.fail_loads.load(Ordering::SeqCst) {
            return Err(CacheError::loader("backing store offline"));
        }
        Ok(self.store.lock().get(key).cloned())
    }

    fn write(&self, key: &u64, value: &String) -> Result<(), CacheError> {
        let remaining = self.fail_writes.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_writes.store(remaining - 1, Ordering::SeqCst);
            return Err(CacheError::write_through("injected write failure"));
        }
        self.store.lock().insert(*key, value.clone());
        self.writes.lock().push((*key, value.clone()));
        Ok(())
    }

    fn delete(&self, key: &u64) -> Result<(), CacheError> {
        self.store.lock().remove(key);
        self.deletes.lock().push(*key);
        Ok(())
    }
}

fn cache_with(store: Arc<RecordingStore>) -> Stratacache<u64, String> {
    let _ = env_logger::builder().is_test(true).try_init();
    Stratacache::builder()
        .resource_pools(ResourcePoolsBuilder::new().heap_entries(16).build())
        .loader_writer(store)
        .build()
        .unwrap()
}

#[test]
fn miss_consults_the_loader_and_caches_the_result() {
    let store = Arc::new(RecordingStore::with_entry(1, "from-sor"));
    let cache = cache_with(Arc::clone(&store));
    assert_eq!(cache.get(&1).unwrap(), Some("from-sor".to_string()));
    // The loaded value is now resident; removing it from the backing
    // store must not affect reads.
    store.store.lock().remove(&1);
    assert_eq!(cache.get(&1).unwrap(), Some("from-sor".to_string()));
    cache.close();
}

#[test]
fn loader_miss_is_a_plain_miss() {
    let store = Arc::new(RecordingStore::default());
    let cache = cache_with(Arc::clone(&store));
    assert_eq!(cache.get(&404).unwrap(), None);
    cache.close();
}

#[test]
fn loader_failure_propagates_and_caches_nothing() {
    let store = Arc::new(RecordingStore::with_entry(1, "unreachable"));
    store.fail_loads.store(true, Ordering::SeqCst);
    let cache = cache_with(Arc::clone(&store));
    assert!(matches!(cache.get(&1), Err(CacheError::LoaderFailure(_))));
    store.fail_loads.store(false, Ordering::SeqCst);
    assert_eq!(cache.get(&1).unwrap(), Some("unreachable".to_string()));
    cache.close();
}

#[test]
fn put_writes_through_synchronously() {
    let store = Arc::new(RecordingStore::default());
    let cache = cache_with(Arc::clone(&store));
    cache.put(7, "seven".to_string()).unwrap();
    // No flush: write-through completes within put.
    assert_eq!(
        store.store.lock().get(&7).map(String::as_str),
        Some("seven")
    );
    assert_eq!(store.writes.lock().len(), 1);
    cache.close();
}

#[test]
fn write_through_failure_keeps_the_local_value() {
    let store = Arc::new(RecordingStore::default());
    store.fail_writes.store(1, Ordering::SeqCst);
    let cache = cache_with(Arc::clone(&store));
    assert!(matches!(
        cache.put(7, "seven".to_string()),
        Err(CacheError::WriteThroughFailure(_))
    ));
    // The tiers and the backing store have diverged, in the cache's favor.
    assert_eq!(cache.get(&7).unwrap(), Some("seven".to_string()));
    assert!(store.store.lock().get(&7).is_none());
    cache.close();
}

#[test]
fn remove_propagates_the_delete() {
    let store = Arc::new(RecordingStore::with_entry(3, "stale"));
    let cache = cache_with(Arc::clone(&store));
    assert_eq!(cache.get(&3).unwrap(), Some("stale".to_string()));
    cache.remove(&3).unwrap();
    assert_eq!(store.deletes.lock().as_slice(), &[3]);
    // The loader now has nothing to resurrect.
    assert_eq!(cache.get(&3).unwrap(), None);
    cache.close();
}

#[test]
fn removing_an_absent_key_still_deletes_from_the_store() {
    let store = Arc::new(RecordingStore::with_entry(9, "orphan"));
    let cache = cache_with(Arc::clone(&store));
    assert_eq!(cache.remove(&9).unwrap(), None);
    assert_eq!(store.deletes.lock().as_slice(), &[9]);
    assert!(store.store.lock().is_empty());
    cache.close();
}

fn write_behind_cache(
    store: Arc<RecordingStore>,
    config: WriteBehindConfig,
) -> Stratacache<u64, String> {
    Stratacache::builder()
        .resource_pools(ResourcePoolsBuilder::new().heap_entries(64).build())
        .loader_writer(store)
        .write_behind(config)
        .build()
        .unwrap()
}

#[test]
fn write_behind_defers_until_flush() {
    let store = Arc::new(RecordingStore::default());
    let cache = write_behind_cache(
        Arc::clone(&store),
        WriteBehindConfig::batched(8, Duration::from_millis(20)),
    );
    for key in 0..5u64 {
        cache.put(key, format!("v{}", key)).unwrap();
    }
    cache.flush().unwrap();
    assert_eq!(store.writes.lock().len(), 5);
    assert_eq!(store.store.lock().len(), 5);
    cache.close();
}

#[test]
fn coalescing_collapses_rapid_updates() {
    let store = Arc::new(RecordingStore::default());
    let cache = write_behind_cache(
        Arc::clone(&store),
        WriteBehindConfig::batched(16, Duration::from_millis(100)).coalescing(true),
    );
    cache.put(42, "one".to_string()).unwrap();
    cache.put(42, "two".to_string()).unwrap();
    cache.put(42, "three".to_string()).unwrap();
    cache.flush().unwrap();
    let writes = store.writes.lock();
    let for_key: Vec<_> = writes.iter().filter(|(k, _)| *k == 42).collect();
    assert_eq!(for_key.len(), 1);
    assert_eq!(for_key[0].1, "three");
    cache.close();
}

#[test]
fn exhausted_retries_reach_the_failure_handler_not_the_caller() {
    let store = Arc::new(RecordingStore::default());
    store.fail_writes.store(u32::MAX, Ordering::SeqCst);
    let failures: Arc<Mutex<Vec<FailedWrite<u64, String>>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&failures);
    let cache = Stratacache::builder()
        .resource_pools(ResourcePoolsBuilder::new().heap_entries(16).build())
        .loader_writer(Arc::clone(&store) as Arc<dyn CacheLoaderWriter<u64, String>>)
        .write_behind(
            WriteBehindConfig::batched(1, Duration::from_millis(5)).max_retries(1),
        )
        .write_behind_failure_handler(Arc::new(move |failed| sink.lock().push(failed)))
        .build()
        .unwrap();
    // The deferred path never fails the mutating call.
    cache.put(9, "doomed".to_string()).unwrap();
    cache.flush().unwrap();
    let failures = failures.lock();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].key, 9);
    assert_eq!(failures[0].attempts, 2);
    assert!(matches!(failures[0].op, WriteOp::Write(_)));
    cache.close();
}

#[test]
fn close_drains_the_queue_before_returning() {
    let store = Arc::new(RecordingStore::default());
    let cache = write_behind_cache(
        Arc::clone(&store),
        WriteBehindConfig::batched(4, Duration::from_millis(10)),
    );
    for key in 0..12u64 {
        cache.put(key, format!("v{}", key)).unwrap();
    }
    cache.close();
    assert_eq!(store.writes.lock().len(), 12);
    assert!(matches!(
        cache.put(99, "late".to_string()),
        Err(CacheError::CacheClosed)
    ));
}

#[test]
fn deferred_deletes_keep_per_key_order() {
    let store = Arc::new(RecordingStore::default());
    let cache = write_behind_cache(
        Arc::clone(&store),
        WriteBehindConfig::batched(8, Duration::from_millis(20)),
    );
    cache.put(5, "first".to_string()).unwrap();
    cache.remove(&5).unwrap();
    cache.put(5, "second".to_string()).unwrap();
    cache.flush().unwrap();
    assert_eq!(
        store.store.lock().get(&5).map(String::as_str),
        Some("second")
    );
    cache.close();
}
