use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::fs::File;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use tracing::debug;

use capstan_common::metrics::global_metrics;
use capstan_common::{Result, ShuffleConfig, ShuffleId};

use crate::codec::RecordWriter;
use crate::store::ShuffleStore;

/// Location of one map task's output, as collected by the driver and handed
/// to reducers. `map_id` is the 0-based input partition index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapOutputLocation {
    pub map_id: usize,
    pub server_uri: String,
}

/// Routes a signed key hash to a bucket in `0..num_splits`.
///
/// Double mod keeps negative hashes in range.
pub fn bucket_for_hash(hash: i64, num_splits: usize) -> usize {
    let n = num_splits as i64;
    (((hash % n) + n) % n) as usize
}

fn key_hash<K: Hash>(key: &K) -> i64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish() as i64
}

/// Partitions and combines one map task's input, persisting each bucket as
/// an ordered sequence of size-bounded block files plus a BLOCKNUM sidecar.
///
/// Combination holds one partition's working set in memory: each bucket maps
/// key to combiner, built with `create_combiner` on first sight of a key and
/// extended with `merge_value` afterwards. Any I/O failure is fatal for the
/// map task; nothing is advertised to reducers (the sidecar is written after
/// the bucket's blocks, and locations are only published once the whole map
/// stage completes).
pub fn write_map_output<K, V, C, I, CC, MV>(
    store: &ShuffleStore,
    config: &ShuffleConfig,
    shuffle: ShuffleId,
    map_id: usize,
    input: I,
    num_output_splits: usize,
    create_combiner: CC,
    merge_value: MV,
) -> Result<MapOutputLocation>
where
    K: Hash + Eq + Serialize,
    C: Serialize,
    I: IntoIterator<Item = (K, V)>,
    CC: Fn(V) -> C,
    MV: Fn(C, V) -> C,
{
    let mut buckets: Vec<HashMap<K, C>> = (0..num_output_splits).map(|_| HashMap::new()).collect();
    for (k, v) in input {
        let bucket = &mut buckets[bucket_for_hash(key_hash(&k), num_output_splits)];
        if let Some(c) = bucket.remove(&k) {
            bucket.insert(k, merge_value(c, v));
        } else {
            bucket.insert(k, create_combiner(v));
        }
    }

    let block_size_bytes = config.block_size_bytes();
    for (reduce, bucket) in buckets.iter().enumerate() {
        write_bucket(store, shuffle, map_id, reduce, bucket, block_size_bytes)?;
    }

    Ok(MapOutputLocation {
        map_id,
        server_uri: store.server_uri().to_string(),
    })
}

fn write_bucket<K, C>(
    store: &ShuffleStore,
    shuffle: ShuffleId,
    map_id: usize,
    reduce: usize,
    bucket: &HashMap<K, C>,
    block_size_bytes: u64,
) -> Result<()>
where
    K: Serialize,
    C: Serialize,
{
    store.ensure_map_task_dir(shuffle, map_id)?;

    let mut block_seq = 0usize;
    let mut current: Option<RecordWriter<File>> = None;
    let mut bytes = 0u64;
    let mut records = 0u64;
    for (k, c) in bucket {
        if current.is_none() {
            let path = store.block_path(shuffle, map_id, reduce, block_seq);
            current = Some(RecordWriter::new(File::create(path)?));
        }
        if let Some(writer) = current.as_mut() {
            writer.write(&(k, c))?;
            writer.flush()?;
            records += 1;

            // Threshold applies to file length as reported by the filesystem,
            // checked after the write, so a block may overshoot by one record.
            let len = writer.get_ref().metadata()?.len();
            if len > block_size_bytes {
                bytes += len;
                current = None;
                block_seq += 1;
            }
        }
    }
    if let Some(w) = current.take() {
        bytes += w.get_ref().metadata()?.len();
        block_seq += 1;
    }

    let mut sidecar = RecordWriter::new(File::create(
        store.block_count_path(shuffle, map_id, reduce),
    )?);
    sidecar.write(&(block_seq as u64))?;
    sidecar.flush()?;

    debug!(
        %shuffle,
        map_id,
        reduce,
        blocks = block_seq,
        bytes,
        records,
        "map bucket flushed"
    );
    global_metrics().record_map_output(shuffle.0, map_id as u64, block_seq as u64, bytes, records);
    Ok(())
}
