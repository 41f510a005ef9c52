//! Dry-run collaborators: enough to run the daemon without any real site
//! backends. The batch/WMS endpoints report empty captures and the
//! submission backend only fabricates records and logs them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::factory::interface::{
    BatchCapture, BatchEndpoint, BoxFuture, CompletionStats, HistorySource, SubmissionBackend,
    SubmissionRecord, WmsCapture, WmsEndpoint,
};
use crate::factory::FactoryResult;

pub struct IdleBatchEndpoint {
    signature: String,
}

impl IdleBatchEndpoint {
    pub fn new(signature: &str) -> Self {
        Self {
            signature: signature.to_string(),
        }
    }
}

impl BatchEndpoint for IdleBatchEndpoint {
    fn signature(&self) -> &str {
        &self.signature
    }

    fn poll(&self) -> BoxFuture<'_, FactoryResult<BatchCapture>> {
        Box::pin(async { Ok(BatchCapture::default()) })
    }
}

pub struct IdleWmsEndpoint {
    signature: String,
}

impl IdleWmsEndpoint {
    pub fn new(signature: &str) -> Self {
        Self {
            signature: signature.to_string(),
        }
    }
}

impl WmsEndpoint for IdleWmsEndpoint {
    fn signature(&self) -> &str {
        &self.signature
    }

    fn poll(&self) -> BoxFuture<'_, FactoryResult<WmsCapture>> {
        Box::pin(async { Ok(WmsCapture::default()) })
    }
}

/// Accepts every submission without talking to any batch system.
#[derive(Default)]
pub struct DryRunBackend {
    counter: AtomicU64,
}

impl SubmissionBackend for DryRunBackend {
    fn submit(&self, count: u64) -> BoxFuture<'_, FactoryResult<Vec<SubmissionRecord>>> {
        Box::pin(async move {
            let first = self.counter.fetch_add(count, Ordering::SeqCst);
            log::info!("Dry run: accepting {count} pilot(s)");
            Ok((first..first + count)
                .map(|id| SubmissionRecord::new(format!("dry-{id}")))
                .collect())
        })
    }

    fn cleanup(&self) -> BoxFuture<'_, ()> {
        Box::pin(async {
            log::debug!("Dry run: cleanup");
        })
    }
}

/// History source with no completions, so throttling never engages.
pub struct EmptyHistory;

impl HistorySource for EmptyHistory {
    fn recent_completions(&self, _queue: &str, _window: Duration) -> FactoryResult<CompletionStats> {
        Ok(CompletionStats::default())
    }
}
