//! Contracts of the external collaborators the factory core drives.
//!
//! Concrete batch/WMS backends live outside this crate; the core only talks
//! to them through the traits below. Async operations use the boxed-future
//! form so that the traits stay object safe.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::config::QueueSpec;
use crate::factory::status::{BatchQueueSnapshot, SiteStatus, WmsQueueSnapshot};
use crate::factory::FactoryResult;
use crate::Map;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// One endpoint-wide refresh of batch-system state, keyed by queue name.
#[derive(Debug, Clone, Default)]
pub struct BatchCapture {
    pub queues: Map<String, BatchQueueSnapshot>,
}

/// One endpoint-wide refresh of WMS state: per-queue job counts plus
/// per-site statuses.
#[derive(Debug, Clone, Default)]
pub struct WmsCapture {
    pub queues: Map<String, WmsQueueSnapshot>,
    pub sites: Map<String, SiteStatus>,
}

/// A source of batch-system status, identified by its connection signature.
/// Queues that declare the same signature share a single poller.
pub trait BatchEndpoint: Send + Sync {
    fn signature(&self) -> &str;

    /// Query the endpoint for the current state of all its queues.
    fn poll(&self) -> BoxFuture<'_, FactoryResult<BatchCapture>>;
}

/// A source of workload-management-system status.
pub trait WmsEndpoint: Send + Sync {
    fn signature(&self) -> &str;

    fn poll(&self) -> BoxFuture<'_, FactoryResult<WmsCapture>>;
}

/// A single pilot handed to the batch system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionRecord {
    /// Batch-system identifier of the submitted pilot.
    pub id: String,
    pub submitted_at: SystemTime,
}

impl SubmissionRecord {
    pub fn new(id: String) -> Self {
        Self {
            id,
            submitted_at: SystemTime::now(),
        }
    }
}

/// Dispatches pilot submissions into the batch system.
pub trait SubmissionBackend: Send + Sync {
    /// Submit `count` pilots. Partial failure is not an error: the backend
    /// returns whatever succeeded and logs the rest. `Err` means the batch
    /// system could not be reached at all; the worker logs it and retries
    /// next cycle.
    fn submit(&self, count: u64) -> BoxFuture<'_, FactoryResult<Vec<SubmissionRecord>>>;

    /// Idempotent housekeeping, invoked every cycle regardless of whether
    /// anything was submitted.
    fn cleanup(&self) -> BoxFuture<'_, ()>;
}

/// Best-effort sink for per-cycle reports. Failures must never reach the
/// queue worker, so both operations are infallible from its point of view.
pub trait MonitorSink: Send + Sync {
    fn register_submissions(&self, queue: &str, records: &[SubmissionRecord]);

    fn update_label(&self, queue: &str, label: &str);
}

/// Recently completed pilots of one queue, as seen by a history source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompletionStats {
    pub total: u64,
    /// Completions whose lifetime was unusually short (the source decides
    /// what counts as short).
    pub short_lived: u64,
}

/// Supplies completion history for the throttle stage.
pub trait HistorySource: Send + Sync {
    fn recent_completions(&self, queue: &str, window: Duration) -> FactoryResult<CompletionStats>;
}

/// Supplies the periodically refreshed queue configuration set.
pub trait ConfigSource: Send + Sync {
    fn load(&self) -> FactoryResult<Map<String, QueueSpec>>;
}

/// Resolves the collaborator identifiers in a [`QueueSpec`] to concrete
/// instances. Registered once at startup; an identifier that cannot be
/// resolved fails construction of that queue only.
#[derive(Default)]
pub struct EndpointRegistry {
    batch: Map<String, Arc<dyn BatchEndpoint>>,
    wms: Map<String, Arc<dyn WmsEndpoint>>,
    submission: Map<String, Arc<dyn SubmissionBackend>>,
    monitors: Map<String, Arc<dyn MonitorSink>>,
    history: Map<String, Arc<dyn HistorySource>>,
}

impl EndpointRegistry {
    pub fn register_batch(&mut self, endpoint: Arc<dyn BatchEndpoint>) {
        self.batch.insert(endpoint.signature().to_string(), endpoint);
    }

    pub fn register_wms(&mut self, endpoint: Arc<dyn WmsEndpoint>) {
        self.wms.insert(endpoint.signature().to_string(), endpoint);
    }

    pub fn register_submission(&mut self, id: &str, backend: Arc<dyn SubmissionBackend>) {
        self.submission.insert(id.to_string(), backend);
    }

    pub fn register_monitor(&mut self, id: &str, monitor: Arc<dyn MonitorSink>) {
        self.monitors.insert(id.to_string(), monitor);
    }

    pub fn register_history(&mut self, id: &str, source: Arc<dyn HistorySource>) {
        self.history.insert(id.to_string(), source);
    }

    pub fn batch(&self, signature: &str) -> FactoryResult<Arc<dyn BatchEndpoint>> {
        self.batch
            .get(signature)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("Unknown batch-status source `{signature}`"))
    }

    pub fn wms(&self, signature: &str) -> FactoryResult<Arc<dyn WmsEndpoint>> {
        self.wms
            .get(signature)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("Unknown WMS-status source `{signature}`"))
    }

    pub fn submission(&self, id: &str) -> FactoryResult<Arc<dyn SubmissionBackend>> {
        self.submission
            .get(id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("Unknown submission backend `{id}`"))
    }

    pub fn monitor(&self, id: &str) -> FactoryResult<Arc<dyn MonitorSink>> {
        self.monitors
            .get(id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("Unknown monitor `{id}`"))
    }

    pub fn history(&self, id: &str) -> FactoryResult<Arc<dyn HistorySource>> {
        self.history
            .get(id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("Unknown history source `{id}`"))
    }
}

/// Monitor that just writes the reports to the log.
pub struct LoggingMonitor;

impl MonitorSink for LoggingMonitor {
    fn register_submissions(&self, queue: &str, records: &[SubmissionRecord]) {
        if !records.is_empty() {
            log::info!(
                "Queue {queue}: submitted {} pilot(s): {}",
                records.len(),
                records
                    .iter()
                    .map(|r| r.id.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }
    }

    fn update_label(&self, queue: &str, label: &str) {
        log::info!("Queue {queue}: {label}");
    }
}
