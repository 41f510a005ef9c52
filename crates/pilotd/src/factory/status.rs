//! Shared, staleness-bounded cache of batch-system and WMS state.
//!
//! Each distinct connection signature gets exactly one background poller
//! task; all queues that declare that signature read from the same capture
//! instead of issuing their own external queries. Staleness is a property of
//! the read request: callers pass the maximum capture age they accept.

use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::common::timeutils::now_monotonic;
use crate::factory::interface::{BatchCapture, BatchEndpoint, WmsCapture, WmsEndpoint};
use crate::Map;

/// Aggregate counts of one queue's pilots in the batch system.
/// Absent states default to zero. A snapshot is immutable once captured.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchQueueSnapshot {
    pub pending: u64,
    pub running: u64,
    pub suspended: u64,
    pub error: u64,
    pub unknown: u64,
    pub done: u64,
}

impl BatchQueueSnapshot {
    /// Pilots the batch system is still holding or executing.
    pub fn active(&self) -> u64 {
        self.pending + self.running
    }
}

/// Aggregate counts of WMS jobs targeting one queue's logical destination.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct WmsQueueSnapshot {
    pub not_ready: u64,
    pub ready: u64,
    pub running: u64,
    pub done: u64,
    pub failed: u64,
    pub unknown: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SiteStatus {
    Online,
    Offline,
    Test,
}

/// Latest capture of one signature. The whole `(capture, captured_at)` pair
/// is replaced atomically on refresh, so readers never observe a torn value.
struct CacheSlot<T> {
    latest: RwLock<Option<(Arc<T>, Instant)>>,
}

impl<T> CacheSlot<T> {
    fn new() -> Self {
        Self {
            latest: RwLock::new(None),
        }
    }

    fn store(&self, value: T) {
        self.store_at(value, now_monotonic());
    }

    fn store_at(&self, value: T, captured_at: Instant) {
        let mut latest = self.latest.write().unwrap();
        *latest = Some((Arc::new(value), captured_at));
    }

    fn load(&self, max_age: Duration) -> Option<Arc<T>> {
        let latest = self.latest.read().unwrap();
        let (capture, captured_at) = latest.as_ref()?;
        if now_monotonic().saturating_duration_since(*captured_at) > max_age {
            return None;
        }
        Some(capture.clone())
    }
}

/// Shared status provider for all queue workers.
///
/// Signatures are registered explicitly: the first registration of a
/// signature creates its slot and spawns its poller, later registrations
/// reuse both. Readers never block waiting for a refresh; a missing or
/// too-old capture is reported as `None`.
pub struct StatusCache {
    batch: Mutex<Map<String, Arc<CacheSlot<BatchCapture>>>>,
    wms: Mutex<Map<String, Arc<CacheSlot<WmsCapture>>>>,
}

impl StatusCache {
    pub fn new() -> Self {
        Self {
            batch: Mutex::new(Map::default()),
            wms: Mutex::new(Map::default()),
        }
    }

    /// Makes sure a poller runs for the endpoint's signature. The poller is
    /// spawned only for a signature seen for the first time.
    pub fn ensure_batch_poller(
        &self,
        endpoint: Arc<dyn BatchEndpoint>,
        interval: Duration,
        shutdown: &CancellationToken,
    ) {
        let signature = endpoint.signature().to_string();
        let mut slots = self.batch.lock().unwrap();
        if slots.contains_key(&signature) {
            return;
        }
        let slot = Arc::new(CacheSlot::new());
        slots.insert(signature.clone(), slot.clone());
        drop(slots);

        let token = shutdown.child_token();
        tokio::spawn(async move {
            log::debug!("Starting batch-status poller for `{signature}`");
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        // A failed poll keeps the previous capture; staleness
                        // is handled on the read side.
                        match endpoint.poll().await {
                            Ok(capture) => slot.store(capture),
                            Err(error) => {
                                log::warn!(
                                    "Polling batch status of `{signature}` failed: {error:?}"
                                );
                            }
                        }
                    }
                    _ = token.cancelled() => break,
                }
            }
            log::debug!("Batch-status poller for `{signature}` finished");
        });
    }

    pub fn ensure_wms_poller(
        &self,
        endpoint: Arc<dyn WmsEndpoint>,
        interval: Duration,
        shutdown: &CancellationToken,
    ) {
        let signature = endpoint.signature().to_string();
        let mut slots = self.wms.lock().unwrap();
        if slots.contains_key(&signature) {
            return;
        }
        let slot = Arc::new(CacheSlot::new());
        slots.insert(signature.clone(), slot.clone());
        drop(slots);

        let token = shutdown.child_token();
        tokio::spawn(async move {
            log::debug!("Starting WMS-status poller for `{signature}`");
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        match endpoint.poll().await {
                            Ok(capture) => slot.store(capture),
                            Err(error) => {
                                log::warn!(
                                    "Polling WMS status of `{signature}` failed: {error:?}"
                                );
                            }
                        }
                    }
                    _ = token.cancelled() => break,
                }
            }
            log::debug!("WMS-status poller for `{signature}` finished");
        });
    }

    /// Batch snapshot of `queue`, or `None` if the signature was never
    /// captured or the capture is older than `max_age`. A queue absent from
    /// a fresh capture reads as an all-zero snapshot.
    pub fn batch_info(
        &self,
        signature: &str,
        queue: &str,
        max_age: Duration,
    ) -> Option<BatchQueueSnapshot> {
        let slot = self.batch.lock().unwrap().get(signature).cloned()?;
        let capture = slot.load(max_age)?;
        Some(capture.queues.get(queue).copied().unwrap_or_default())
    }

    pub fn wms_info(
        &self,
        signature: &str,
        queue: &str,
        max_age: Duration,
    ) -> Option<WmsQueueSnapshot> {
        let slot = self.wms.lock().unwrap().get(signature).cloned()?;
        let capture = slot.load(max_age)?;
        Some(capture.queues.get(queue).copied().unwrap_or_default())
    }

    /// Site status from the WMS capture. Unlike per-queue counts, an unknown
    /// site has no meaningful default, so it also reads as `None`.
    pub fn site_info(&self, signature: &str, site: &str, max_age: Duration) -> Option<SiteStatus> {
        let slot = self.wms.lock().unwrap().get(signature).cloned()?;
        let capture = slot.load(max_age)?;
        capture.sites.get(site).copied()
    }

    #[cfg(test)]
    pub(crate) fn inject_batch_at(
        &self,
        signature: &str,
        capture: BatchCapture,
        captured_at: Instant,
    ) {
        let slot = self
            .batch
            .lock()
            .unwrap()
            .entry(signature.to_string())
            .or_insert_with(|| Arc::new(CacheSlot::new()))
            .clone();
        slot.store_at(capture, captured_at);
    }

    #[cfg(test)]
    pub(crate) fn inject_wms_at(&self, signature: &str, capture: WmsCapture, captured_at: Instant) {
        let slot = self
            .wms
            .lock()
            .unwrap()
            .entry(signature.to_string())
            .or_insert_with(|| Arc::new(CacheSlot::new()))
            .clone();
        slot.store_at(capture, captured_at);
    }
}

impl Default for StatusCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::interface::{BatchCapture, BoxFuture};
    use crate::factory::FactoryResult;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct CountingEndpoint {
        signature: String,
        polls: AtomicU64,
    }

    impl BatchEndpoint for CountingEndpoint {
        fn signature(&self) -> &str {
            &self.signature
        }

        fn poll(&self) -> BoxFuture<'_, FactoryResult<BatchCapture>> {
            Box::pin(async move {
                self.polls.fetch_add(1, Ordering::SeqCst);
                let mut capture = BatchCapture::default();
                capture.queues.insert(
                    "q1".to_string(),
                    BatchQueueSnapshot {
                        pending: 3,
                        running: 7,
                        ..Default::default()
                    },
                );
                Ok(capture)
            })
        }
    }

    fn capture_with(queue: &str, snapshot: BatchQueueSnapshot) -> BatchCapture {
        let mut capture = BatchCapture::default();
        capture.queues.insert(queue.to_string(), snapshot);
        capture
    }

    #[test]
    fn missing_signature_reads_as_none() {
        let cache = StatusCache::new();
        assert_eq!(
            cache.batch_info("nope", "q1", Duration::from_secs(60)),
            None
        );
        assert_eq!(cache.wms_info("nope", "q1", Duration::from_secs(60)), None);
        assert_eq!(cache.site_info("nope", "s1", Duration::from_secs(60)), None);
    }

    #[test]
    fn fresh_capture_is_served() {
        let cache = StatusCache::new();
        let snapshot = BatchQueueSnapshot {
            pending: 2,
            running: 5,
            ..Default::default()
        };
        cache.inject_batch_at("sig", capture_with("q1", snapshot), now_monotonic());
        assert_eq!(
            cache.batch_info("sig", "q1", Duration::from_secs(60)),
            Some(snapshot)
        );
    }

    #[test]
    fn queue_missing_from_capture_reads_as_zero() {
        let cache = StatusCache::new();
        cache.inject_batch_at(
            "sig",
            capture_with("other", BatchQueueSnapshot::default()),
            now_monotonic(),
        );
        assert_eq!(
            cache.batch_info("sig", "q1", Duration::from_secs(60)),
            Some(BatchQueueSnapshot::default())
        );
    }

    #[test]
    fn stale_capture_reads_as_none() {
        let cache = StatusCache::new();
        let captured_at = now_monotonic() - Duration::from_secs(120);
        cache.inject_batch_at(
            "sig",
            capture_with("q1", BatchQueueSnapshot::default()),
            captured_at,
        );
        // Staleness is decided per request: the same capture can be usable
        // for one caller and expired for another.
        assert!(cache
            .batch_info("sig", "q1", Duration::from_secs(300))
            .is_some());
        assert!(cache
            .batch_info("sig", "q1", Duration::from_secs(60))
            .is_none());
        assert!(cache.batch_info("sig", "q1", Duration::ZERO).is_none());
    }

    #[test]
    fn site_status_lookup() {
        let cache = StatusCache::new();
        let mut capture = WmsCapture::default();
        capture.sites.insert("SITE_A".to_string(), SiteStatus::Offline);
        cache.inject_wms_at("wms", capture, now_monotonic());
        assert_eq!(
            cache.site_info("wms", "SITE_A", Duration::from_secs(60)),
            Some(SiteStatus::Offline)
        );
        assert_eq!(cache.site_info("wms", "SITE_B", Duration::from_secs(60)), None);
    }

    #[tokio::test(start_paused = true)]
    async fn one_poller_per_signature() {
        let cache = StatusCache::new();
        let endpoint = Arc::new(CountingEndpoint {
            signature: "shared".to_string(),
            polls: AtomicU64::new(0),
        });
        let shutdown = CancellationToken::new();

        // Two queues sharing a signature register the same endpoint twice.
        cache.ensure_batch_poller(endpoint.clone(), Duration::from_secs(30), &shutdown);
        cache.ensure_batch_poller(endpoint.clone(), Duration::from_secs(30), &shutdown);

        tokio::time::sleep(Duration::from_secs(95)).await;
        shutdown.cancel();
        tokio::time::sleep(Duration::from_millis(10)).await;

        // One immediate refresh plus one per elapsed interval; a second
        // poller would have doubled this.
        let polls = endpoint.polls.load(Ordering::SeqCst);
        assert_eq!(polls, 4);
        assert!(cache
            .batch_info("shared", "q1", Duration::from_secs(3600))
            .is_some());
    }
}
