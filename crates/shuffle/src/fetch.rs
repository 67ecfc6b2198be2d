use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use rand::Rng;
use reqwest::blocking::{Client, Response};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use capstan_common::metrics::global_metrics;
use capstan_common::{CapstanError, Result, ShuffleConfig, ShuffleId};

use crate::codec::RecordReader;
use crate::layout::{block_count_url, block_url};
use crate::pool::FetchPool;
use crate::writer::MapOutputLocation;

/// Sentinel for "sidecar not yet fetched".
const BLOCKS_UNKNOWN: i64 = -1;

/// Pulls every producer's blocks for output partition `reduce_id` and merges
/// the fetched pairs into the per-partition combiner map.
///
/// At most `max_connections` fetches run concurrently; the admission loop
/// wakes every `min_knock_interval_ms` to top the pool back up, choosing
/// uniformly at random among producers that are neither drained nor already
/// being fetched. A failed fetch only releases the producer's in-flight slot;
/// the producer is re-selected in a later cycle, so a single fetch error
/// never fails the reducer.
pub fn fetch_partition<K, C, MC>(
    config: &ShuffleConfig,
    shuffle: ShuffleId,
    reduce_id: usize,
    output_locs: &[MapOutputLocation],
    merge_combiners: MC,
) -> Result<HashMap<K, C>>
where
    K: Hash + Eq + DeserializeOwned + Send + 'static,
    C: DeserializeOwned + Send + 'static,
    MC: Fn(C, C) -> C + Send + Sync + 'static,
{
    let total_splits = output_locs.len();
    let tracker: Arc<SplitTracker<K, C>> = Arc::new(SplitTracker::new(total_splits));
    let pool = FetchPool::new(config.max_connections);
    let client = Arc::new(
        Client::builder()
            .build()
            .map_err(|e| CapstanError::Fetch(format!("http client build failed: {e}")))?,
    );
    let merge = Arc::new(merge_combiners);
    let slot_budget = total_splits.min(config.max_connections);

    debug!(%shuffle, reduce_id, total_splits, "reduce fetch starting");
    while tracker.has_splits() < total_splits {
        let mut slots = slot_budget.saturating_sub(pool.active());
        while slots > 0 && tracker.has_splits() < total_splits {
            let Some(slot) = tracker.select_random_split() else {
                break;
            };
            tracker.mark_in_flight(slot);
            let task_tracker = Arc::clone(&tracker);
            let task_client = Arc::clone(&client);
            let task_merge = Arc::clone(&merge);
            let loc = output_locs[slot].clone();
            pool.submit(move || {
                run_client_task(
                    task_tracker,
                    task_client,
                    shuffle,
                    reduce_id,
                    loc,
                    slot,
                    task_merge,
                );
            });
            slots -= 1;
        }
        global_metrics().set_active_fetches(shuffle.0, reduce_id as u64, pool.active() as u64);
        thread::sleep(Duration::from_millis(config.min_knock_interval_ms));
    }
    global_metrics().set_active_fetches(shuffle.0, reduce_id as u64, 0);
    debug_assert!(lock(&tracker.done).all_set());
    debug!(%shuffle, reduce_id, "reduce fetch complete");

    let combiners = std::mem::take(&mut *lock(&tracker.combiners));
    Ok(combiners)
}

/// One-shot fetch unit against a single producer.
///
/// Learns the producer's block count on first contact, then consumes the
/// next unread block, folding records into the shared combiner map. The
/// in-flight slot is released on every exit path by the drop guard; an
/// unsuccessful attempt leaves the producer eligible for re-selection with
/// its block index unchanged.
fn run_client_task<K, C, MC>(
    tracker: Arc<SplitTracker<K, C>>,
    client: Arc<Client>,
    shuffle: ShuffleId,
    reduce_id: usize,
    loc: MapOutputLocation,
    slot: usize,
    merge: Arc<MC>,
) where
    K: Hash + Eq + DeserializeOwned,
    C: DeserializeOwned,
    MC: Fn(C, C) -> C,
{
    let _release = SlotRelease {
        tracker: Arc::clone(&tracker),
        slot,
    };
    if let Err(e) = drain_next_block(
        &tracker,
        &client,
        shuffle,
        reduce_id,
        &loc,
        slot,
        merge.as_ref(),
    ) {
        warn!(
            %shuffle,
            reduce_id,
            map_id = loc.map_id,
            error = %e,
            "shuffle fetch attempt failed; producer stays eligible for retry"
        );
        global_metrics().inc_fetch_retry(shuffle.0, reduce_id as u64);
    }
}

fn drain_next_block<K, C, MC>(
    tracker: &SplitTracker<K, C>,
    client: &Client,
    shuffle: ShuffleId,
    reduce_id: usize,
    loc: &MapOutputLocation,
    slot: usize,
    merge: &MC,
) -> Result<()>
where
    K: Hash + Eq + DeserializeOwned,
    C: DeserializeOwned,
    MC: Fn(C, C) -> C,
{
    // The in-flight bit serves as this producer's mutex: only the task
    // holding it reads or writes total_blocks[slot] / has_blocks[slot].
    if tracker.total_blocks[slot].load(Ordering::Acquire) == BLOCKS_UNKNOWN {
        let url = block_count_url(&loc.server_uri, shuffle, loc.map_id, reduce_id);
        let mut reader = RecordReader::new(http_get(client, &url)?);
        let count: u64 = reader
            .read()?
            .ok_or_else(|| CapstanError::Fetch(format!("empty block-count stream at {url}")))?;
        tracker.total_blocks[slot].store(count as i64, Ordering::Release);
        debug!(%shuffle, reduce_id, map_id = loc.map_id, blocks = count, "learned block count");
    }

    let total = tracker.total_blocks[slot].load(Ordering::Acquire);
    let next = tracker.has_blocks[slot].load(Ordering::Acquire);
    if (next as i64) >= total {
        // producer advertises no unread blocks; all-empty producers drain here
        tracker.mark_split_done(slot);
        return Ok(());
    }

    let started = Instant::now();
    let url = block_url(&loc.server_uri, shuffle, loc.map_id, reduce_id, next);
    let response = http_get(client, &url)?;
    let bytes_hint = response.content_length().unwrap_or(0);
    let mut reader = RecordReader::new(response);
    while let Some((key, combiner)) = reader.read::<(K, C)>()? {
        let mut combiners = lock(&tracker.combiners);
        if let Some(existing) = combiners.remove(&key) {
            combiners.insert(key, merge(existing, combiner));
        } else {
            combiners.insert(key, combiner);
        }
    }

    // clean end-of-stream: this block is fully consumed
    let consumed = tracker.has_blocks[slot].fetch_add(1, Ordering::AcqRel) + 1;
    global_metrics().record_block_read(
        shuffle.0,
        reduce_id as u64,
        bytes_hint,
        started.elapsed().as_secs_f64(),
    );
    if consumed as i64 == total {
        tracker.mark_split_done(slot);
        debug!(%shuffle, reduce_id, map_id = loc.map_id, "producer drained");
    }
    Ok(())
}

fn http_get(client: &Client, url: &str) -> Result<Response> {
    let response = client
        .get(url)
        .send()
        .map_err(|e| CapstanError::Fetch(format!("GET {url} failed: {e}")))?;
    if !response.status().is_success() {
        return Err(CapstanError::Fetch(format!(
            "GET {url} returned status {}",
            response.status()
        )));
    }
    Ok(response)
}

/// Per-reducer transport state shared between the admission loop and client
/// tasks. Created at reducer start and discarded with its completion.
///
/// The two bit vectors and the combiner map each sit behind their own lock;
/// no lock is held across network or file I/O and locks are acquired one at
/// a time, never nested.
struct SplitTracker<K, C> {
    total_splits: usize,
    /// Bit p set iff producer p is fully drained.
    done: Mutex<BitVector>,
    /// Bit p set iff a fetch against producer p is in flight.
    in_flight: Mutex<BitVector>,
    /// Block count per producer, [`BLOCKS_UNKNOWN`] until first contact.
    total_blocks: Vec<AtomicI64>,
    /// Blocks already consumed per producer.
    has_blocks: Vec<AtomicUsize>,
    combiners: Mutex<HashMap<K, C>>,
}

impl<K, C> SplitTracker<K, C> {
    fn new(total_splits: usize) -> Self {
        Self {
            total_splits,
            done: Mutex::new(BitVector::new(total_splits)),
            in_flight: Mutex::new(BitVector::new(total_splits)),
            total_blocks: (0..total_splits).map(|_| AtomicI64::new(BLOCKS_UNKNOWN)).collect(),
            has_blocks: (0..total_splits).map(|_| AtomicUsize::new(0)).collect(),
            combiners: Mutex::new(HashMap::new()),
        }
    }

    /// Count of fully drained producers.
    fn has_splits(&self) -> usize {
        lock(&self.done).count_ones()
    }

    /// Uniform random pick among producers clear in both bit vectors, or
    /// `None` when no producer is eligible.
    ///
    /// Snapshots are taken one lock at a time. The in-flight snapshot is read
    /// first: a bit set there can only be cleared concurrently (the admission
    /// loop is the sole setter), so a stale exclusion merely defers that
    /// producer to the next cycle, while a producer clear in the snapshot has
    /// no task that could change its done bit underneath us.
    fn select_random_split(&self) -> Option<usize> {
        let requested: Vec<bool> = {
            let in_flight = lock(&self.in_flight);
            (0..self.total_splits).map(|p| in_flight.get(p)).collect()
        };
        let eligible: Vec<usize> = {
            let done = lock(&self.done);
            (0..self.total_splits)
                .filter(|&p| !requested[p] && !done.get(p))
                .collect()
        };
        if eligible.is_empty() {
            None
        } else {
            Some(eligible[rand::rng().random_range(0..eligible.len())])
        }
    }

    fn mark_in_flight(&self, slot: usize) {
        lock(&self.in_flight).set(slot);
    }

    fn release_in_flight(&self, slot: usize) {
        lock(&self.in_flight).clear(slot);
    }

    fn mark_split_done(&self, slot: usize) {
        lock(&self.done).set(slot);
    }
}

/// Clears the producer's in-flight bit when the task ends, success or not.
struct SlotRelease<K, C> {
    tracker: Arc<SplitTracker<K, C>>,
    slot: usize,
}

impl<K, C> Drop for SlotRelease<K, C> {
    fn drop(&mut self) {
        self.tracker.release_in_flight(self.slot);
    }
}

// Slot release must also run while unwinding from a poisoned-lock panic, so
// poisoning is recovered rather than propagated.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Fixed-width bit vector with a maintained ones count.
#[derive(Debug)]
struct BitVector {
    words: Vec<u64>,
    len: usize,
    ones: usize,
}

impl BitVector {
    fn new(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(64)],
            len,
            ones: 0,
        }
    }

    fn get(&self, bit: usize) -> bool {
        debug_assert!(bit < self.len);
        self.words[bit / 64] >> (bit % 64) & 1 == 1
    }

    fn set(&mut self, bit: usize) {
        debug_assert!(bit < self.len);
        let word = bit / 64;
        let mask = 1u64 << (bit % 64);
        if self.words[word] & mask == 0 {
            self.words[word] |= mask;
            self.ones += 1;
        }
    }

    fn clear(&mut self, bit: usize) {
        debug_assert!(bit < self.len);
        let word = bit / 64;
        let mask = 1u64 << (bit % 64);
        if self.words[word] & mask != 0 {
            self.words[word] &= !mask;
            self.ones -= 1;
        }
    }

    fn count_ones(&self) -> usize {
        self.ones
    }

    fn all_set(&self) -> bool {
        self.ones == self.len
    }
}
