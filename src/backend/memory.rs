use crate::backend::{Backend, Decision, FixedWindowBackend, FixedWindowInput, FixedWindowOutput};
use actix_web::rt::task::JoinHandle;
use actix_web::rt::time::Instant;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_GC_INTERVAL_SECONDS: u64 = 60 * 10;

/// A fixed window rate limiter [Backend] that keeps one window per identity in a
/// [DashMap](dashmap::DashMap).
///
/// The read-modify-write of a window happens while its map entry is locked, so concurrent
/// requests for the same identity are counted exactly.
///
/// Like any fixed window counter this admits up to twice the limit across a window boundary:
/// `max_requests` just before the reset and `max_requests` again immediately after it.
#[derive(Clone)]
pub struct InMemoryBackend {
    map: Arc<DashMap<String, Window>>,
    gc_handle: Option<Arc<JoinHandle<()>>>,
}

struct Window {
    reset: Instant,
    count: u64,
}

/// Identifies the window an admission was taken from.
#[derive(Debug, Clone)]
pub struct WindowToken {
    key: String,
    reset: Instant,
}

impl InMemoryBackend {
    pub fn builder() -> InMemoryBackendBuilder {
        InMemoryBackendBuilder {
            gc_interval: Some(Duration::from_secs(DEFAULT_GC_INTERVAL_SECONDS)),
        }
    }

    /// Number of identities currently holding a window.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    fn garbage_collector(map: Arc<DashMap<String, Window>>, interval: Duration) -> JoinHandle<()> {
        assert!(
            interval.as_secs_f64() > 0f64,
            "GC interval must be non-zero"
        );
        actix_web::rt::spawn(async move {
            loop {
                let now = Instant::now();
                let before = map.len();
                // A window is still live at the exact reset instant
                map.retain(|_k, w| w.reset >= now);
                let dropped = before.saturating_sub(map.len());
                if dropped > 0 {
                    log::debug!("Discarded {dropped} expired rate limit windows");
                }
                actix_web::rt::time::sleep_until(now + interval).await;
            }
        })
    }
}

impl Backend<FixedWindowInput> for InMemoryBackend {
    type Output = FixedWindowOutput;
    type RollbackToken = WindowToken;
    type Error = actix_web::Error;

    async fn request(
        &self,
        input: FixedWindowInput,
    ) -> Result<(Decision, Self::Output, Self::RollbackToken), Self::Error> {
        let now = Instant::now();
        let expiry = now
            .checked_add(input.interval)
            .expect("Interval unexpectedly large");
        let opening = u64::from(input.max_requests > 0);

        let mut count = opening;
        let mut reset = expiry;
        let mut allowed = opening > 0;
        self.map
            .entry(input.key.clone())
            .and_modify(|w| {
                if now > w.reset {
                    // Expired: open a fresh window regardless of earlier denials
                    w.count = opening;
                    w.reset = expiry;
                } else if w.count < input.max_requests {
                    w.count += 1;
                    count = w.count;
                    reset = w.reset;
                } else {
                    // Denied requests are not counted
                    allowed = false;
                    count = w.count;
                    reset = w.reset;
                }
            })
            .or_insert_with(|| Window {
                reset: expiry,
                count: opening,
            });

        let output = FixedWindowOutput {
            limit: input.max_requests,
            remaining: input.max_requests.saturating_sub(count),
            reset,
        };
        let token = WindowToken {
            key: input.key,
            reset,
        };
        Ok((Decision::from_allowed(allowed), output, token))
    }

    async fn rollback(&self, token: Self::RollbackToken) -> Result<(), Self::Error> {
        self.map.entry(token.key).and_modify(|w| {
            // Only give the admission back to the window it was taken from
            if w.reset == token.reset {
                w.count = w.count.saturating_sub(1);
            }
        });
        Ok(())
    }
}

impl FixedWindowBackend for InMemoryBackend {
    async fn remove_key(&self, key: &str) -> Result<(), Self::Error> {
        self.map.remove(key);
        Ok(())
    }
}

impl Drop for InMemoryBackend {
    fn drop(&mut self) {
        // Only the last clone stops the collector
        if let Some(handle) = self.gc_handle.take() {
            if let Ok(handle) = Arc::try_unwrap(handle) {
                handle.abort();
            }
        }
    }
}

pub struct InMemoryBackendBuilder {
    gc_interval: Option<Duration>,
}

impl InMemoryBackendBuilder {
    /// Override the default garbage collector interval.
    ///
    /// Set to None to disable garbage collection.
    ///
    /// The garbage collector periodically removes windows that have expired, so identities that
    /// stop sending requests do not keep their entry forever.
    pub fn with_gc_interval(mut self, interval: Option<Duration>) -> Self {
        self.gc_interval = interval;
        self
    }

    pub fn build(self) -> InMemoryBackend {
        let map = Arc::new(DashMap::<String, Window>::new());
        let gc_handle = self.gc_interval.map(|gc_interval| {
            Arc::new(InMemoryBackend::garbage_collector(map.clone(), gc_interval))
        });
        InMemoryBackend { map, gc_handle }
    }
}
