use crate::storage::{
    EvictionSweeper, KeyValueStore, StorageError, SweepReport, UntimestampedRecency,
    UNTIMESTAMPED_RECENCY,
};

/// 5 MiB.
pub const DEFAULT_HARD_CAP_BYTES: u64 = 5 * 1024 * 1024;

/// Fraction of the hard cap at which a cleanup is triggered.
pub const DEFAULT_CLEANUP_THRESHOLD: f64 = 0.8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupOutcome {
    /// Usage was below the trigger, nothing was removed.
    NotNeeded { usage: u64 },
    Swept(SweepReport),
}

impl CleanupOutcome {
    pub fn removed(&self) -> &[String] {
        match self {
            CleanupOutcome::NotNeeded { .. } => &[],
            CleanupOutcome::Swept(report) => &report.removed,
        }
    }
}

/// Keeps a [KeyValueStore] under a hard byte cap.
///
/// Usage is checked lazily: callers run [QuotaTracker::cleanup_if_needed] around their writes.
/// Two trackers sweeping the same store at once are not coordinated; a key removed by one is
/// simply skipped by the other.
#[derive(Clone)]
pub struct QuotaTracker<S> {
    store: S,
    hard_cap: u64,
    trigger_bytes: u64,
    sweeper: EvictionSweeper,
}

impl<S: KeyValueStore> QuotaTracker<S> {
    pub fn builder(store: S) -> QuotaTrackerBuilder<S> {
        QuotaTrackerBuilder {
            store,
            hard_cap: DEFAULT_HARD_CAP_BYTES,
            threshold: DEFAULT_CLEANUP_THRESHOLD,
            untimestamped: UNTIMESTAMPED_RECENCY,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn hard_cap(&self) -> u64 {
        self.hard_cap
    }

    /// Usage at or above which a cleanup runs.
    pub fn trigger_bytes(&self) -> u64 {
        self.trigger_bytes
    }

    /// Usage a cleanup sweeps down to.
    pub fn target_bytes(&self) -> u64 {
        self.sweeper.target_bytes()
    }

    /// Total bytes held by the store.
    ///
    /// Prefers the store's own estimate; otherwise reads every value and sums their lengths.
    pub async fn measure_usage(&self) -> Result<u64, StorageError> {
        if let Some(estimate) = self
            .store
            .estimate_usage()
            .await
            .map_err(|e| StorageError::Estimate(Box::new(e)))?
        {
            return Ok(estimate);
        }
        let keys = self.store.list_keys().await.map_err(StorageError::list)?;
        let mut total = 0u64;
        for key in keys {
            let value = self
                .store
                .get(&key)
                .await
                .map_err(|e| StorageError::read(&key, e))?;
            total += value.map_or(0, |v| v.len() as u64);
        }
        Ok(total)
    }

    /// Sweep the store if usage has reached the trigger.
    pub async fn cleanup_if_needed(&self) -> Result<CleanupOutcome, StorageError> {
        let usage = self.measure_usage().await?;
        if usage < self.trigger_bytes {
            return Ok(CleanupOutcome::NotNeeded { usage });
        }
        log::info!(
            "Storage usage {usage} bytes reached {} of the {} byte cap, sweeping",
            self.trigger_bytes,
            self.hard_cap
        );
        self.sweeper.sweep(&self.store).await.map(CleanupOutcome::Swept)
    }

    /// [QuotaTracker::cleanup_if_needed], with failures logged and reported as no cleanup.
    pub async fn cleanup_if_needed_or_log(&self) -> Option<SweepReport> {
        match self.cleanup_if_needed().await {
            Ok(CleanupOutcome::Swept(report)) => Some(report),
            Ok(CleanupOutcome::NotNeeded { .. }) => None,
            Err(e) => {
                log::error!("Storage cleanup skipped: {e}");
                None
            }
        }
    }

    /// Write a value and then run [QuotaTracker::cleanup_if_needed_or_log].
    ///
    /// The write itself is not absorbed: if it fails the error is returned and no cleanup runs.
    pub async fn set(&self, key: &str, value: String) -> Result<(), StorageError> {
        self.store
            .set(key, value)
            .await
            .map_err(|e| StorageError::write(key, e))?;
        self.cleanup_if_needed_or_log().await;
        Ok(())
    }
}

pub struct QuotaTrackerBuilder<S> {
    store: S,
    hard_cap: u64,
    threshold: f64,
    untimestamped: UntimestampedRecency,
}

impl<S: KeyValueStore> QuotaTrackerBuilder<S> {
    /// Override the hard cap (5 MiB by default).
    pub fn hard_cap(mut self, bytes: u64) -> Self {
        self.hard_cap = bytes;
        self
    }

    /// Override the fraction of the cap that triggers a cleanup (0.8 by default).
    ///
    /// A cleanup sweeps usage down to the remaining fraction, `hard_cap × (1 − threshold)`.
    pub fn cleanup_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    /// Override how entries without a readable timestamp are ranked for eviction.
    pub fn untimestamped(mut self, policy: UntimestampedRecency) -> Self {
        self.untimestamped = policy;
        self
    }

    pub fn build(self) -> QuotaTracker<S> {
        assert!(self.hard_cap > 0, "Hard cap must be non-zero");
        assert!(
            self.threshold > 0f64 && self.threshold <= 1f64,
            "Cleanup threshold must be within (0, 1]"
        );
        // Whole bytes, so that e.g. 1000 × (1 − 0.8) is exactly 200
        let trigger_bytes = (self.hard_cap as f64 * self.threshold).round() as u64;
        let target_bytes = self.hard_cap - trigger_bytes.min(self.hard_cap);
        let sweeper = EvictionSweeper::new(target_bytes).untimestamped(self.untimestamped);
        QuotaTracker {
            store: self.store,
            hard_cap: self.hard_cap,
            trigger_bytes,
            sweeper,
        }
    }
}
