//! Quota management for a string key-value store.
//!
//! The [QuotaTracker] measures how many bytes a [KeyValueStore] holds and, once usage crosses a
//! threshold fraction of a hard cap, runs the [EvictionSweeper] to delete the oldest entries
//! until usage is back under the target.

#[cfg(feature = "dashmap")]
#[cfg_attr(docsrs, doc(cfg(feature = "dashmap")))]
mod memory;
mod quota;
#[cfg(feature = "redis")]
#[cfg_attr(docsrs, doc(cfg(feature = "redis")))]
pub mod redis;
mod sweeper;

#[cfg(feature = "dashmap")]
pub use memory::InMemoryStore;
pub use quota::{
    CleanupOutcome, QuotaTracker, QuotaTrackerBuilder, DEFAULT_CLEANUP_THRESHOLD,
    DEFAULT_HARD_CAP_BYTES,
};
pub use sweeper::{
    recency_signal, EvictionSweeper, SweepReport, UntimestampedRecency, UNTIMESTAMPED_RECENCY,
};

use std::future::Future;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The capabilities the quota tracker needs from a persistent string store.
///
/// Clones must refer to the same underlying store.
pub trait KeyValueStore: Clone {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Every key currently in the store, in the store's enumeration order.
    fn list_keys(&self) -> impl Future<Output = Result<Vec<String>, Self::Error>>;

    fn get(&self, key: &str) -> impl Future<Output = Result<Option<String>, Self::Error>>;

    fn set(&self, key: &str, value: String) -> impl Future<Output = Result<(), Self::Error>>;

    fn remove(&self, key: &str) -> impl Future<Output = Result<(), Self::Error>>;

    /// Bytes in use as reported by the platform, when it has such an API.
    ///
    /// Returning `None` makes the tracker sum the value lengths itself.
    fn estimate_usage(&self) -> impl Future<Output = Result<Option<u64>, Self::Error>> {
        async { Ok(None) }
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Unable to enumerate stored keys: {0}")]
    List(#[source] BoxError),
    #[error("Unable to read {key:?}: {source}")]
    Read {
        key: String,
        #[source]
        source: BoxError,
    },
    #[error("Unable to write {key:?}: {source}")]
    Write {
        key: String,
        #[source]
        source: BoxError,
    },
    #[error("Unable to remove {key:?}: {source}")]
    Remove {
        key: String,
        #[source]
        source: BoxError,
    },
    #[error("Unable to estimate storage usage: {0}")]
    Estimate(#[source] BoxError),
}

impl StorageError {
    pub(crate) fn list<E: std::error::Error + Send + Sync + 'static>(e: E) -> Self {
        Self::List(Box::new(e))
    }

    pub(crate) fn read<E: std::error::Error + Send + Sync + 'static>(key: &str, e: E) -> Self {
        Self::Read {
            key: key.to_owned(),
            source: Box::new(e),
        }
    }

    pub(crate) fn write<E: std::error::Error + Send + Sync + 'static>(key: &str, e: E) -> Self {
        Self::Write {
            key: key.to_owned(),
            source: Box::new(e),
        }
    }

    pub(crate) fn remove<E: std::error::Error + Send + Sync + 'static>(key: &str, e: E) -> Self {
        Self::Remove {
            key: key.to_owned(),
            source: Box::new(e),
        }
    }
}

/// A stored value as seen by one scan of the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEntry {
    pub key: String,
    /// UTF-8 byte length of the stored value.
    pub size: u64,
    /// Best effort last access time in Unix milliseconds, see [recency_signal].
    pub last_accessed: i64,
}

/// Current wall clock time in Unix milliseconds.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
