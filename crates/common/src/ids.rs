//! Typed identifiers shared across shuffle components.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Stable shuffle identifier, unique within the process lifetime.
///
/// Namespaces every block file and fetch URL belonging to one shuffle.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ShuffleId(
    /// Raw numeric id value.
    pub u64,
);

impl fmt::Display for ShuffleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

static NEXT_SHUFFLE_ID: AtomicU64 = AtomicU64::new(0);

/// Allocates the next process-wide shuffle id.
///
/// Ids are strictly increasing, never reused, and safe to allocate
/// concurrently.
pub fn new_shuffle_id() -> ShuffleId {
    ShuffleId(NEXT_SHUFFLE_ID.fetch_add(1, Ordering::SeqCst))
}
