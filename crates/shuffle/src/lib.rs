//! Blocked, pull-based shuffle transport.
//!
//! Map tasks hash-partition and combine their input, persisting each bucket
//! as size-bounded block files plus a BLOCKNUM sidecar beneath the local
//! store, which a read-only HTTP endpoint advertises. Reduce tasks pull each
//! partition's blocks from all producers under a bounded connection budget
//! and merge the fetched pairs into a per-partition combiner map.

pub mod codec;
pub mod fetch;
pub mod layout;
pub mod pool;
pub mod store;
pub mod writer;

pub use fetch::fetch_partition;
pub use layout::*;
pub use pool::FetchPool;
pub use store::{ShuffleStore, global_store};
pub use writer::{MapOutputLocation, write_map_output};
