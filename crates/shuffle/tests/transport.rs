use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use capstan_common::{ShuffleConfig, ShuffleId, new_shuffle_id};
use capstan_shuffle::store::ShuffleStore;
use capstan_shuffle::{fetch_partition, write_map_output};

fn init_logs() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn temp_local_dir() -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    std::env::temp_dir().join(format!("capstan_transport_test_{nanos}"))
}

fn test_config(local_dir: &PathBuf) -> ShuffleConfig {
    ShuffleConfig {
        block_size_kb: 1,
        min_knock_interval_ms: 10,
        max_knock_interval_ms: 50,
        max_connections: 2,
        local_dir: local_dir.to_string_lossy().into_owned(),
        ..ShuffleConfig::default()
    }
}

fn write_producer(
    store: &ShuffleStore,
    config: &ShuffleConfig,
    shuffle: ShuffleId,
    map_id: usize,
    pairs: Vec<(String, u64)>,
    num_output_splits: usize,
) -> capstan_shuffle::MapOutputLocation {
    write_map_output(
        store,
        config,
        shuffle,
        map_id,
        pairs,
        num_output_splits,
        |v| v,
        |c, v| c + v,
    )
    .expect("map output")
}

fn fetch_all_partitions(
    config: &ShuffleConfig,
    shuffle: ShuffleId,
    locs: &[capstan_shuffle::MapOutputLocation],
    num_output_splits: usize,
) -> Vec<HashMap<String, u64>> {
    (0..num_output_splits)
        .map(|reduce_id| {
            fetch_partition(config, shuffle, reduce_id, locs, |a: u64, b: u64| a + b)
                .expect("fetch partition")
        })
        .collect()
}

fn expected_sums(inputs: &[Vec<(String, u64)>]) -> HashMap<String, u64> {
    let mut out = HashMap::new();
    for pairs in inputs {
        for (k, v) in pairs {
            *out.entry(k.clone()).or_insert(0) += v;
        }
    }
    out
}

#[test]
fn fetches_union_across_producers() {
    let base = temp_local_dir();
    let config = test_config(&base);
    let store = ShuffleStore::initialize(&config).expect("store");
    let shuffle = new_shuffle_id();
    let splits = 2;

    let inputs = vec![
        vec![
            ("apple".to_string(), 1),
            ("banana".to_string(), 2),
            ("apple".to_string(), 3),
        ],
        vec![
            ("banana".to_string(), 4),
            ("cherry".to_string(), 1),
            ("apple".to_string(), 2),
        ],
    ];
    let locs: Vec<_> = inputs
        .iter()
        .enumerate()
        .map(|(map_id, pairs)| {
            write_producer(&store, &config, shuffle, map_id, pairs.clone(), splits)
        })
        .collect();

    let partitions = fetch_all_partitions(&config, shuffle, &locs, splits);

    // partitions are disjoint and their union is the per-key fold
    let mut union = HashMap::new();
    for partition in &partitions {
        for (k, v) in partition {
            assert!(
                union.insert(k.clone(), *v).is_none(),
                "key {k} appeared in more than one partition"
            );
        }
    }
    assert_eq!(union, expected_sums(&inputs));

    let _ = fs::remove_dir_all(base);
}

#[test]
fn drains_multiple_blocks_per_producer() {
    let base = temp_local_dir();
    let config = test_config(&base);
    let store = ShuffleStore::initialize(&config).expect("store");
    let shuffle = new_shuffle_id();

    // ~600-byte values against a 1 KB threshold: every producer spills
    // several blocks for the single output partition
    let value = "v".repeat(600);
    let inputs: Vec<Vec<(String, u64)>> = (0..2)
        .map(|producer| {
            (0..4)
                .map(|i| (format!("p{producer}-k{i}-{value}"), 1))
                .collect()
        })
        .collect();
    let locs: Vec<_> = inputs
        .iter()
        .enumerate()
        .map(|(map_id, pairs)| write_producer(&store, &config, shuffle, map_id, pairs.clone(), 1))
        .collect();

    for map_id in 0..2 {
        let sidecar = fs::read(store.block_count_path(shuffle, map_id, 0)).expect("sidecar");
        // 4-byte prefix + u64 payload; block count sits in the payload head
        assert!(sidecar.len() > 4);
        let blocks = u64::from_le_bytes(sidecar[4..12].try_into().expect("payload"));
        assert!(blocks >= 2, "producer {map_id} wrote {blocks} blocks");
    }

    let result = fetch_all_partitions(&config, shuffle, &locs, 1).remove(0);
    assert_eq!(result, expected_sums(&inputs));

    let _ = fs::remove_dir_all(base);
}

#[test]
fn flapping_producer_is_retried_until_available() {
    init_logs();
    let base = temp_local_dir();
    let config = test_config(&base);
    let store = ShuffleStore::initialize(&config).expect("store");
    let shuffle = new_shuffle_id();

    let inputs: Vec<Vec<(String, u64)>> = (0..3)
        .map(|producer| vec![(format!("key-{producer}"), producer + 10), ("shared".to_string(), 1)])
        .collect();
    let locs: Vec<_> = inputs
        .iter()
        .enumerate()
        .map(|(map_id, pairs)| write_producer(&store, &config, shuffle, map_id, pairs.clone(), 1))
        .collect();

    // hide producer 1's sidecar so its first fetches fail, then restore it
    let sidecar = store.block_count_path(shuffle, 1, 0);
    let hidden = sidecar.with_extension("hidden");
    fs::rename(&sidecar, &hidden).expect("hide sidecar");
    let restore = thread::spawn(move || {
        thread::sleep(Duration::from_millis(120));
        fs::rename(&hidden, &sidecar).expect("restore sidecar");
    });

    let result = fetch_all_partitions(&config, shuffle, &locs, 1).remove(0);
    restore.join().expect("restore thread");
    assert_eq!(result, expected_sums(&inputs));

    let _ = fs::remove_dir_all(base);
}

#[test]
fn empty_producers_drain_without_blocks() {
    let base = temp_local_dir();
    let config = test_config(&base);
    let store = ShuffleStore::initialize(&config).expect("store");
    let shuffle = new_shuffle_id();
    let splits = 3;

    let locs: Vec<_> = (0..2)
        .map(|map_id| write_producer(&store, &config, shuffle, map_id, Vec::new(), splits))
        .collect();

    for partition in fetch_all_partitions(&config, shuffle, &locs, splits) {
        assert!(partition.is_empty());
    }

    let _ = fs::remove_dir_all(base);
}
