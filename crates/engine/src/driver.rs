use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::thread;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::info;

use capstan_common::{CapstanError, Result, ShuffleConfig, new_shuffle_id};
use capstan_shuffle::store::global_store;
use capstan_shuffle::{MapOutputLocation, fetch_partition, write_map_output};

use crate::aggregate::Aggregator;

/// Runs one shuffle end to end inside this process.
///
/// Each input partition becomes a map task on its own thread; once the whole
/// map stage has completed, the collected `(map_id, server_uri)` locations
/// are handed to `num_output_splits` reducer tasks, each pulling and merging
/// its output partition. Results come back indexed by output partition, for
/// the caller to flatten downstream.
///
/// A failed map task fails the job: its sidecars would be unadvertised, and
/// rescheduling is the caller's concern.
pub fn run_shuffle_job<K, V, C, A>(
    config: &ShuffleConfig,
    partitions: Vec<Vec<(K, V)>>,
    num_output_splits: usize,
    aggregator: A,
) -> Result<Vec<HashMap<K, C>>>
where
    K: Hash + Eq + Serialize + DeserializeOwned + Send + 'static,
    V: Send + 'static,
    C: Serialize + DeserializeOwned + Send + 'static,
    A: Aggregator<V, C> + 'static,
{
    let store = global_store(config)?;
    let shuffle = new_shuffle_id();
    let aggregator = Arc::new(aggregator);
    info!(
        %shuffle,
        maps = partitions.len(),
        reducers = num_output_splits,
        "starting local shuffle job"
    );

    let locations = thread::scope(|s| -> Result<Vec<MapOutputLocation>> {
        let handles: Vec<_> = partitions
            .into_iter()
            .enumerate()
            .map(|(map_id, pairs)| {
                let aggregator = Arc::clone(&aggregator);
                s.spawn(move || {
                    write_map_output(
                        store,
                        config,
                        shuffle,
                        map_id,
                        pairs,
                        num_output_splits,
                        |v| aggregator.create_combiner(v),
                        |c, v| aggregator.merge_value(c, v),
                    )
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| {
                handle
                    .join()
                    .map_err(|_| CapstanError::Execution("map task panicked".to_string()))?
            })
            .collect()
    })?;

    let results = thread::scope(|s| -> Result<Vec<HashMap<K, C>>> {
        let handles: Vec<_> = (0..num_output_splits)
            .map(|reduce_id| {
                let aggregator = Arc::clone(&aggregator);
                let locations = &locations;
                s.spawn(move || {
                    fetch_partition(config, shuffle, reduce_id, locations, move |a, b| {
                        aggregator.merge_combiners(a, b)
                    })
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| {
                handle
                    .join()
                    .map_err(|_| CapstanError::Execution("reduce task panicked".to_string()))?
            })
            .collect()
    })?;

    info!(%shuffle, "local shuffle job complete");
    Ok(results)
}
