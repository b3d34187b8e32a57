use crate::storage::{now_millis, KeyValueStore, StorageEntry, StorageError};

/// How an entry without a readable `timestamp` is ranked for eviction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UntimestampedRecency {
    /// Ranked as accessed at scan time, so it goes after every entry with a past timestamp.
    #[default]
    ScanTime,
    /// Ranked before everything else.
    Oldest,
}

/// Entries whose value is not JSON, or has no usable `timestamp`, are treated as freshly
/// accessed. Stale entries of that kind are therefore never prioritised for removal.
pub const UNTIMESTAMPED_RECENCY: UntimestampedRecency = UntimestampedRecency::ScanTime;

/// Recover the recency signal of a stored value.
///
/// The value is parsed as a JSON object and its `timestamp` field read as Unix milliseconds,
/// either as a number or a numeric string. Anything else falls back to `policy`.
pub fn recency_signal(value: &str, now: i64, policy: UntimestampedRecency) -> i64 {
    parse_timestamp(value).unwrap_or(match policy {
        UntimestampedRecency::ScanTime => now,
        UntimestampedRecency::Oldest => i64::MIN,
    })
}

fn parse_timestamp(value: &str) -> Option<i64> {
    let parsed: serde_json::Value = serde_json::from_str(value).ok()?;
    match parsed.get("timestamp")? {
        serde_json::Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        serde_json::Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().filter(|f| f.is_finite()).map(|f| f as i64))
        }
        _ => None,
    }
}

/// Outcome of one eviction sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Keys removed, in the order they were removed.
    pub removed: Vec<String>,
    pub reclaimed_bytes: u64,
    /// Bytes left in the scanned entries after the sweep.
    pub remaining_bytes: u64,
    pub target_bytes: u64,
}

impl SweepReport {
    /// Whether usage ended at or below the target.
    pub fn reached_target(&self) -> bool {
        self.remaining_bytes <= self.target_bytes
    }
}

/// Deletes the oldest entries of a store until its usage is at or below a target.
#[derive(Debug, Clone, Copy)]
pub struct EvictionSweeper {
    target_bytes: u64,
    untimestamped: UntimestampedRecency,
}

impl EvictionSweeper {
    pub fn new(target_bytes: u64) -> Self {
        Self {
            target_bytes,
            untimestamped: UNTIMESTAMPED_RECENCY,
        }
    }

    /// Override how entries without a timestamp are ranked.
    pub fn untimestamped(mut self, policy: UntimestampedRecency) -> Self {
        self.untimestamped = policy;
        self
    }

    pub fn target_bytes(&self) -> u64 {
        self.target_bytes
    }

    /// Run a sweep using the current wall clock for untimestamped entries.
    pub async fn sweep<S: KeyValueStore>(&self, store: &S) -> Result<SweepReport, StorageError> {
        self.sweep_at(store, now_millis()).await
    }

    /// Run a sweep as if the scan happened at `now` (Unix milliseconds).
    ///
    /// Entries are removed oldest first; equal signals keep the store's enumeration order. The
    /// first failed read or removal aborts the rest of the sweep.
    pub async fn sweep_at<S: KeyValueStore>(
        &self,
        store: &S,
        now: i64,
    ) -> Result<SweepReport, StorageError> {
        let mut entries = self.scan(store, now).await?;
        // Stable, so ties keep enumeration order
        entries.sort_by_key(|e| e.last_accessed);

        let mut report = SweepReport {
            remaining_bytes: entries.iter().map(|e| e.size).sum(),
            target_bytes: self.target_bytes,
            ..SweepReport::default()
        };

        for entry in entries {
            if report.remaining_bytes <= self.target_bytes {
                break;
            }
            store
                .remove(&entry.key)
                .await
                .map_err(|e| StorageError::remove(&entry.key, e))?;
            log::debug!(
                "Evicted {:?} ({} bytes, last accessed {})",
                entry.key,
                entry.size,
                entry.last_accessed
            );
            report.remaining_bytes -= entry.size;
            report.reclaimed_bytes += entry.size;
            report.removed.push(entry.key);
        }

        log::info!(
            "Eviction sweep removed {} entries ({} bytes), {} bytes remain against a target of {}",
            report.removed.len(),
            report.reclaimed_bytes,
            report.remaining_bytes,
            report.target_bytes
        );
        Ok(report)
    }

    async fn scan<S: KeyValueStore>(
        &self,
        store: &S,
        now: i64,
    ) -> Result<Vec<StorageEntry>, StorageError> {
        let keys = store.list_keys().await.map_err(StorageError::list)?;
        let mut entries = Vec::with_capacity(keys.len());
        for key in keys {
            let value = store
                .get(&key)
                .await
                .map_err(|e| StorageError::read(&key, e))?;
            // Removed since enumeration
            let Some(value) = value else { continue };
            entries.push(StorageEntry {
                size: value.len() as u64,
                last_accessed: recency_signal(&value, now, self.untimestamped),
                key,
            });
        }
        Ok(entries)
    }
}
