use capstan_common::ShuffleId;

pub fn block_rel_path(shuffle: ShuffleId, map_id: usize, reduce: usize, seq: usize) -> String {
    format!("shuffle/{shuffle}/{map_id}/{reduce}-{seq}")
}

pub fn block_count_rel_path(shuffle: ShuffleId, map_id: usize, reduce: usize) -> String {
    format!("shuffle/{shuffle}/{map_id}/BLOCKNUM-{reduce}")
}

pub fn map_task_rel_dir(shuffle: ShuffleId, map_id: usize) -> String {
    format!("shuffle/{shuffle}/{map_id}")
}

pub fn block_url(
    server_uri: &str,
    shuffle: ShuffleId,
    map_id: usize,
    reduce: usize,
    seq: usize,
) -> String {
    format!(
        "{}/{}",
        server_uri.trim_end_matches('/'),
        block_rel_path(shuffle, map_id, reduce, seq)
    )
}

pub fn block_count_url(server_uri: &str, shuffle: ShuffleId, map_id: usize, reduce: usize) -> String {
    format!(
        "{}/{}",
        server_uri.trim_end_matches('/'),
        block_count_rel_path(shuffle, map_id, reduce)
    )
}
