//! Driver glue for the Capstan shuffle transport.
//!
//! Responsibilities:
//! - run the map stage over partitioned input and collect
//!   `(map_id, server_uri)` output locations;
//! - launch one reducer task per output partition, each driving the
//!   bounded-concurrency fetcher;
//! - hand back per-partition combiner maps in partition order.

pub mod aggregate;
pub mod driver;

pub use aggregate::{Aggregator, FnAggregator};
pub use driver::run_shuffle_job;
