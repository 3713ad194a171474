//! Write-behind queue
//!
//! Buffers mutations bound for the system of record and drains them from
//! a fixed set of worker threads. Tasks are routed to a worker by key
//! hash, so mutations for one key always drain in order at any
//! concurrency level. A batch closes when it reaches the configured item
//! count or when the delay window elapses, whichever comes first. With
//! coalescing enabled, a pending task for the same key is replaced in
//! place so only the final state reaches the writer.
//!
//! Task failures never propagate to the mutating caller: a batch retries
//! whole up to the bounded retry count, then each task is reported
//! through the failure handler and dropped. The drop is always
//! observable, via the handler or the log.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use super::error::CacheError;
use super::events::key_partition;
use super::tier::next_tick;
use super::traits::{CacheKey, CacheLoaderWriter, CacheValue};

/// Behavior of `enqueue` when the queue is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FullQueuePolicy {
    /// Apply backpressure: the mutating call blocks until a drain worker
    /// frees space.
    Block,
    /// Fail the mutating call with `WriteBehindSaturated`.
    Reject,
}

/// Write-behind tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteBehindConfig {
    /// Maximum queued tasks across all drain workers.
    pub queue_capacity: usize,
    pub full_queue_policy: FullQueuePolicy,
    /// A batch closes at this many items...
    pub batch_size: usize,
    /// ...or when this much time passes with the batch still open.
    pub max_delay: Duration,
    /// Number of drain workers.
    pub concurrency: usize,
    /// Collapse queued tasks for the same key to the most recent one.
    pub coalescing: bool,
    /// Retries per batch after the first failed attempt.
    pub max_retries: u32,
}

impl Default for WriteBehindConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            full_queue_policy: FullQueuePolicy::Block,
            batch_size: 16,
            max_delay: Duration::from_secs(1),
            concurrency: 1,
            coalescing: false,
            max_retries: 3,
        }
    }
}

impl WriteBehindConfig {
    /// Batched configuration: batches close at `batch_size` items or
    /// after `max_delay`, whichever first.
    pub fn batched(batch_size: usize, max_delay: Duration) -> Self {
        Self {
            batch_size: batch_size.max(1),
            max_delay,
            ..Self::default()
        }
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    pub fn full_queue_policy(mut self, policy: FullQueuePolicy) -> Self {
        self.full_queue_policy = policy;
        self
    }

    pub fn concurrency(mut self, workers: usize) -> Self {
        self.concurrency = workers.max(1);
        self
    }

    pub fn coalescing(mut self, enabled: bool) -> Self {
        self.coalescing = enabled;
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }
}

/// Deferred mutation kind.
#[derive(Debug, Clone)]
pub enum WriteOp<V> {
    Write(V),
    Delete,
}

#[derive(Debug, Clone)]
struct WriteBehindTask<K, V> {
    key: K,
    op: WriteOp<V>,
    enqueued_tick: u64,
}

/// A task dropped after exhausting its retries, as handed to the failure
/// handler.
#[derive(Debug, Clone)]
pub struct FailedWrite<K, V> {
    pub key: K,
    pub op: WriteOp<V>,
    pub error: CacheError,
    /// Total dispatch attempts made, including the first.
    pub attempts: u32,
}

/// Out-of-band sink for write-behind tasks that exhausted their retries.
pub type WriteBehindFailureHandler<K, V> = Arc<dyn Fn(FailedWrite<K, V>) + Send + Sync>;

struct ShardState<K, V> {
    queue: VecDeque<WriteBehindTask<K, V>>,
    in_flight: usize,
    closed: bool,
}

struct Shard<K, V> {
    state: Mutex<ShardState<K, V>>,
    not_empty: Condvar,
    not_full: Condvar,
    drained: Condvar,
}

impl<K, V> Shard<K, V> {
    fn new() -> Self {
        Self {
            state: Mutex::new(ShardState {
                queue: VecDeque::new(),
                in_flight: 0,
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            drained: Condvar::new(),
        }
    }
}

/// The write-behind queue plus its drain workers.
pub(crate) struct WriteBehindQueue<K, V> {
    shards: Vec<Arc<Shard<K, V>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    per_shard_capacity: usize,
    coalescing: bool,
    full_queue_policy: FullQueuePolicy,
}

impl<K: CacheKey, V: CacheValue> WriteBehindQueue<K, V> {
    pub(crate) fn new(
        config: &WriteBehindConfig,
        writer: Arc<dyn CacheLoaderWriter<K, V>>,
        failure_handler: Option<WriteBehindFailureHandler<K, V>>,
    ) -> Result<Self, CacheError> {
        let concurrency = config.concurrency.max(1);
        let per_shard_capacity = (config.queue_capacity / concurrency).max(1);
        let mut shards = Vec::with_capacity(concurrency);
        let mut workers = Vec::with_capacity(concurrency);
        for worker_idx in 0..concurrency {
            let shard = Arc::new(Shard::new());
            shards.push(Arc::clone(&shard));
            let writer = Arc::clone(&writer);
            let failure_handler = failure_handler.clone();
            let batch_size = config.batch_size.max(1);
            let max_delay = config.max_delay;
            let max_retries = config.max_retries;
            let worker = std::thread::Builder::new()
                .name(format!("stratacache-writebehind-{}", worker_idx))
                .spawn(move || {
                    drain_loop(
                        shard,
                        writer,
                        batch_size,
                        max_delay,
                        max_retries,
                        failure_handler,
                    )
                })?;
            workers.push(worker);
        }
        Ok(Self {
            shards,
            workers: Mutex::new(workers),
            per_shard_capacity,
            coalescing: config.coalescing,
            full_queue_policy: config.full_queue_policy,
        })
    }

    /// Queue a deferred mutation. Blocks or rejects at capacity per the
    /// configured full-queue policy.
    pub(crate) fn enqueue(&self, key: K, op: WriteOp<V>) -> Result<(), CacheError> {
        let shard = &self.shards[key_partition(&key, self.shards.len())];
        let mut state = shard.state.lock();
        loop {
            if state.closed {
                return Err(CacheError::CacheClosed);
            }
            if self.coalescing {
                if let Some(pending) = state.queue.iter_mut().rev().find(|task| task.key == key) {
                    pending.op = op;
                    pending.enqueued_tick = next_tick();
                    shard.not_empty.notify_one();
                    return Ok(());
                }
            }
            if state.queue.len() < self.per_shard_capacity {
                break;
            }
            match self.full_queue_policy {
                FullQueuePolicy::Reject => return Err(CacheError::WriteBehindSaturated),
                FullQueuePolicy::Block => {
                    shard.not_full.wait(&mut state);
                }
            }
        }
        state.queue.push_back(WriteBehindTask {
            key,
            op,
            enqueued_tick: next_tick(),
        });
        shard.not_empty.notify_one();
        Ok(())
    }

    /// Block until every queued and in-flight task has been dispatched.
    pub(crate) fn flush(&self) {
        for shard in &self.shards {
            let mut state = shard.state.lock();
            while !(state.queue.is_empty() && state.in_flight == 0) {
                shard.drained.wait(&mut state);
            }
        }
    }

    /// Drain-then-stop: mark every shard closed, let the workers empty
    /// their queues, and join them.
    pub(crate) fn close(&self) {
        for shard in &self.shards {
            let mut state = shard.state.lock();
            state.closed = true;
            shard.not_empty.notify_all();
            shard.not_full.notify_all();
        }
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if worker.join().is_err() {
                log::error!("write-behind drain worker panicked before shutdown");
            }
        }
    }

    #[cfg(test)]
    fn queued(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.state.lock().queue.len())
            .sum()
    }
}

fn drain_loop<K: CacheKey, V: CacheValue>(
    shard: Arc<Shard<K, V>>,
    writer: Arc<dyn CacheLoaderWriter<K, V>>,
    batch_size: usize,
    max_delay: Duration,
    max_retries: u32,
    failure_handler: Option<WriteBehindFailureHandler<K, V>>,
) {
    loop {
        let batch = {
            let mut state = shard.state.lock();
            loop {
                if !state.queue.is_empty() {
                    break;
                }
                if state.closed {
                    shard.drained.notify_all();
                    return;
                }
                shard.not_empty.wait(&mut state);
            }
            // Keep the batch open until it fills or the window elapses.
            let deadline = Instant::now() + max_delay;
            while state.queue.len() < batch_size && !state.closed {
                if shard
                    .not_empty
                    .wait_until(&mut state, deadline)
                    .timed_out()
                {
                    break;
                }
            }
            let take = state.queue.len().min(batch_size);
            let batch: Vec<WriteBehindTask<K, V>> = state.queue.drain(..take).collect();
            state.in_flight += batch.len();
            shard.not_full.notify_all();
            batch
        };
        let batch_len = batch.len();
        dispatch_batch(writer.as_ref(), batch, max_retries, failure_handler.as_ref());
        let mut state = shard.state.lock();
        state.in_flight = state.in_flight.saturating_sub(batch_len);
        if state.queue.is_empty() && state.in_flight == 0 {
            shard.drained.notify_all();
        }
    }
}

/// Dispatch one batch, splitting it into maximal same-operation segments
/// so interleaved writes and deletes keep their relative order.
fn dispatch_batch<K: CacheKey, V: CacheValue>(
    writer: &dyn CacheLoaderWriter<K, V>,
    batch: Vec<WriteBehindTask<K, V>>,
    max_retries: u32,
    failure_handler: Option<&WriteBehindFailureHandler<K, V>>,
) {
    let mut start = 0;
    while start < batch.len() {
        let is_write = matches!(batch[start].op, WriteOp::Write(_));
        let mut end = start + 1;
        while end < batch.len() && matches!(batch[end].op, WriteOp::Write(_)) == is_write {
            end += 1;
        }
        dispatch_segment(
            writer,
            &batch[start..end],
            is_write,
            max_retries,
            failure_handler,
        );
        start = end;
    }
}

fn dispatch_segment<K: CacheKey, V: CacheValue>(
    writer: &dyn CacheLoaderWriter<K, V>,
    segment: &[WriteBehindTask<K, V>],
    is_write: bool,
    max_retries: u32,
    failure_handler: Option<&WriteBehindFailureHandler<K, V>>,
) {
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        let outcome = if is_write {
            let pairs: Vec<(K, V)> = segment
                .iter()
                .filter_map(|task| match &task.op {
                    WriteOp::Write(value) => Some((task.key.clone(), value.clone())),
                    WriteOp::Delete => None,
                })
                .collect();
            writer.write_all(&pairs)
        } else {
            let keys: Vec<K> = segment.iter().map(|task| task.key.clone()).collect();
            writer.delete_all(&keys)
        };
        match outcome {
            Ok(()) => return,
            Err(err) if attempts <= max_retries => {
                log::warn!(
                    "write-behind batch of {} failed on attempt {}, retrying: {}",
                    segment.len(),
                    attempts,
                    err
                );
            }
            Err(err) => {
                log::error!(
                    "write-behind batch of {} dropped after {} attempts: {}",
                    segment.len(),
                    attempts,
                    err
                );
                for task in segment {
                    match failure_handler {
                        Some(handler) => handler(FailedWrite {
                            key: task.key.clone(),
                            op: task.op.clone(),
                            error: err.clone(),
                            attempts,
                        }),
                        None => log::error!(
                            "dropping write-behind task for key {:?} (enqueued at tick {})",
                            task.key,
                            task.enqueued_tick
                        ),
                    }
                }
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct RecordingWriter {
        store: PlMutex<HashMap<u64, String>>,
        writes: PlMutex<Vec<(u64, String)>>,
        deletes: PlMutex<Vec<u64>>,
        fail_attempts: AtomicU32,
    }

    impl RecordingWriter {
        fn failing(times: u32) -> Self {
            let writer = Self::default();
            writer.fail_attempts.store(times, Ordering::SeqCst);
            writer
        }
    }

    impl CacheLoaderWriter<u64, String> for RecordingWriter {
        fn load(&self, key: &u64) -> Result<Option<String>, CacheError> {
            Ok(self.store.lock().get(key).cloned())
        }

        fn write(&self, key: &u64, value: &String) -> Result<(), CacheError> {
            let remaining = self.fail_attempts.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_attempts.store(remaining - 1, Ordering::SeqCst);
                return Err(CacheError::write_through("injected failure"));
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

    fn queue(
        config: WriteBehindConfig,
        writer: Arc<RecordingWriter>,
        handler: Option<WriteBehindFailureHandler<u64, String>>,
    ) -> WriteBehindQueue<u64, String> {
        WriteBehindQueue::new(&config, writer, handler).unwrap()
    }

    #[test]
    fn coalescing_keeps_only_the_final_state() {
        let writer = Arc::new(RecordingWriter::default());
        let config = WriteBehindConfig::batched(8, Duration::from_millis(50)).coalescing(true);
        let queue = queue(config, Arc::clone(&writer), None);
        queue.enqueue(42, WriteOp::Write("one".to_string())).unwrap();
        queue.enqueue(42, WriteOp::Write("two".to_string())).unwrap();
        queue
            .enqueue(42, WriteOp::Write("three".to_string()))
            .unwrap();
        queue.flush();
        let writes = writer.writes.lock();
        let for_key: Vec<_> = writes.iter().filter(|(k, _)| *k == 42).collect();
        assert_eq!(for_key.len(), 1);
        assert_eq!(for_key[0].1, "three");
        queue.close();
    }

    #[test]
    fn every_task_reaches_the_writer_without_coalescing() {
        let writer = Arc::new(RecordingWriter::default());
        let config = WriteBehindConfig::batched(4, Duration::from_millis(10)).concurrency(2);
        let queue = queue(config, Arc::clone(&writer), None);
        for key in 0..32u64 {
            queue
                .enqueue(key, WriteOp::Write(format!("value-{}", key)))
                .unwrap();
        }
        queue.flush();
        assert_eq!(writer.writes.lock().len(), 32);
        queue.close();
    }

    #[test]
    fn interleaved_write_delete_for_one_key_keeps_order() {
        let writer = Arc::new(RecordingWriter::default());
        let config = WriteBehindConfig::batched(8, Duration::from_millis(20));
        let queue = queue(config, Arc::clone(&writer), None);
        queue.enqueue(7, WriteOp::Write("a".to_string())).unwrap();
        queue.enqueue(7, WriteOp::Delete).unwrap();
        queue.enqueue(7, WriteOp::Write("b".to_string())).unwrap();
        queue.flush();
        assert_eq!(writer.store.lock().get(&7).map(String::as_str), Some("b"));
        queue.close();
    }

    #[test]
    fn exhausted_retries_surface_through_the_handler() {
        // Fails every attempt for the single task: 1 + 2 retries = 3.
        let writer = Arc::new(RecordingWriter::failing(u32::MAX));
        let failures: Arc<PlMutex<Vec<FailedWrite<u64, String>>>> =
            Arc::new(PlMutex::new(Vec::new()));
        let sink = Arc::clone(&failures);
        let handler: WriteBehindFailureHandler<u64, String> =
            Arc::new(move |failed| sink.lock().push(failed));
        let config = WriteBehindConfig::batched(1, Duration::from_millis(5)).max_retries(2);
        let queue = queue(config, Arc::clone(&writer), Some(handler));
        queue.enqueue(9, WriteOp::Write("lost".to_string())).unwrap();
        queue.flush();
        let failures = failures.lock();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].key, 9);
        assert_eq!(failures[0].attempts, 3);
        queue.close();
    }

    #[test]
    fn reject_policy_surfaces_saturation() {
        let writer = Arc::new(RecordingWriter::default());
        // Single worker, capacity 2, and a huge delay so nothing drains
        // while we overfill.
        let config = WriteBehindConfig::batched(64, Duration::from_secs(30))
            .queue_capacity(2)
            .full_queue_policy(FullQueuePolicy::Reject);
        let queue = queue(config, Arc::clone(&writer), None);
        queue.enqueue(1, WriteOp::Write("a".to_string())).unwrap();
        queue.enqueue(2, WriteOp::Write("b".to_string())).unwrap();
        // The worker may have pulled some tasks into its open batch, so
        // saturation can take a few extra enqueues; it must appear before
        // the batch size is reachable.
        let mut saturated = false;
        for key in 3..64u64 {
            match queue.enqueue(key, WriteOp::Write("x".to_string())) {
                Ok(()) => {}
                Err(CacheError::WriteBehindSaturated) => {
                    saturated = true;
                    break;
                }
                Err(other) => panic!("unexpected error: {}", other),
            }
        }
        assert!(saturated);
        queue.close();
    }

    #[test]
    fn close_drains_pending_tasks() {
        let writer = Arc::new(RecordingWriter::default());
        let config = WriteBehindConfig::batched(4, Duration::from_millis(10));
        let queue = queue(config, Arc::clone(&writer), None);
        for key in 0..8u64 {
            queue
                .enqueue(key, WriteOp::Write(format!("v{}", key)))
                .unwrap();
        }
        queue.close();
        assert_eq!(writer.writes.lock().len(), 8);
        assert_eq!(queue.queued(), 0);
        let err = queue
            .enqueue(99, WriteOp::Write("late".to_string()))
            .unwrap_err();
        assert!(matches!(err, CacheError::CacheClosed));
    }
}
