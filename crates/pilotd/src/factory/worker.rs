//! Per-queue worker: one task per configured queue, running the scheduling
//! pipeline on its own cadence and dispatching submissions.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{FactorySettings, QueueSpec};
use crate::factory::interface::{
    EndpointRegistry, HistorySource, MonitorSink, SubmissionBackend,
};
use crate::factory::sched::{SchedContext, SchedPipeline};
use crate::factory::status::StatusCache;
use crate::factory::FactoryResult;
use crate::Map;

/// Lifecycle of a queue worker. `Stopping -> Terminated` only happens once
/// the in-flight cycle (if any) has completed; the reconciler relies on that
/// to never run two workers for one queue name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Created,
    Running,
    Stopping,
    Terminated,
}

/// Latest pending+running totals published by every worker of this factory
/// process, read by the `max_per_factory` stage. Aggregation is across the
/// queues' own cached values, never across signatures.
#[derive(Default)]
pub struct FactoryCounters {
    active: Mutex<Map<String, u64>>,
}

impl FactoryCounters {
    pub fn publish(&self, queue: &str, active: u64) {
        self.active.lock().unwrap().insert(queue.to_string(), active);
    }

    pub fn forget(&self, queue: &str) {
        self.active.lock().unwrap().remove(queue);
    }

    pub fn total(&self) -> u64 {
        self.active.lock().unwrap().values().sum()
    }
}

/// Shared dependencies handed to every worker at construction.
pub struct FactoryEnv {
    pub cache: Arc<StatusCache>,
    pub registry: Arc<EndpointRegistry>,
    pub counters: Arc<FactoryCounters>,
    pub settings: FactorySettings,
    pub shutdown: CancellationToken,
}

/// Handle owned by the reconciler for one running worker.
pub struct WorkerHandle {
    stop: CancellationToken,
    join: JoinHandle<()>,
    state: Arc<Mutex<WorkerState>>,
}

impl WorkerHandle {
    pub fn state(&self) -> WorkerState {
        *self.state.lock().unwrap()
    }

    /// Requests a stop and waits until the worker has fully terminated.
    /// The running cycle is allowed to finish; only the sleep is preempted.
    pub async fn stop_and_wait(self) {
        self.stop.cancel();
        self.wait().await;
    }

    /// Waits for the worker to terminate on its own (e.g. cycle limit).
    pub async fn wait(self) {
        if let Err(error) = self.join.await {
            log::error!("Queue worker task panicked: {error:?}");
        }
    }
}

/// Builds a worker from its spec, resolving collaborator identifiers and
/// making sure status pollers exist for its signatures, then starts it.
/// A resolution failure is a construction error for this queue only.
pub fn spawn_worker(spec: QueueSpec, env: &FactoryEnv) -> FactoryResult<WorkerHandle> {
    let submission = env.registry.submission(&spec.submission)?;
    let monitors = spec
        .monitors
        .iter()
        .map(|id| env.registry.monitor(id))
        .collect::<FactoryResult<Vec<_>>>()?;
    let history = spec
        .history
        .as_deref()
        .map(|id| env.registry.history(id))
        .transpose()?;

    let batch_endpoint = env.registry.batch(&spec.batch_source)?;
    let wms_endpoint = env.registry.wms(&spec.wms_source)?;
    env.cache
        .ensure_batch_poller(batch_endpoint, env.settings.batch_poll_interval, &env.shutdown);
    env.cache
        .ensure_wms_poller(wms_endpoint, env.settings.wms_poll_interval, &env.shutdown);

    let pipeline = SchedPipeline::new(&spec.stages);
    if pipeline.is_empty() {
        log::warn!(
            "Queue {}: no scheduling stages configured, nothing will ever be submitted",
            spec.name
        );
    }

    let state = Arc::new(Mutex::new(WorkerState::Created));
    let stop = env.shutdown.child_token();
    let worker = QueueWorker {
        spec,
        pipeline,
        cache: env.cache.clone(),
        submission,
        monitors,
        history,
        counters: env.counters.clone(),
        max_age: env.settings.max_snapshot_age,
        state: state.clone(),
        cycle: 0,
    };
    let join = tokio::spawn(worker.run(stop.clone()));
    Ok(WorkerHandle { stop, join, state })
}

/// What one successful cycle did.
#[derive(Debug, Clone, Copy)]
pub struct CycleOutcome {
    /// Count the pipeline decided on, after the final clamp to zero.
    pub requested: u64,
    /// Pilots the backend actually accepted.
    pub submitted: usize,
}

struct QueueWorker {
    spec: QueueSpec,
    pipeline: SchedPipeline,
    cache: Arc<StatusCache>,
    submission: Arc<dyn SubmissionBackend>,
    monitors: Vec<Arc<dyn MonitorSink>>,
    history: Option<Arc<dyn HistorySource>>,
    counters: Arc<FactoryCounters>,
    max_age: Duration,
    state: Arc<Mutex<WorkerState>>,
    cycle: u64,
}

impl QueueWorker {
    async fn run(mut self, stop: CancellationToken) {
        self.set_state(WorkerState::Running);
        log::info!("Queue {}: worker started", self.spec.name);
        loop {
            // Checked before the cycle runs, so `max_cycles = 0` submits
            // nothing at all.
            if self.spec.max_cycles.is_some_and(|max| self.cycle >= max) {
                log::info!(
                    "Queue {}: reached the cycle limit after {} cycle(s)",
                    self.spec.name,
                    self.cycle
                );
                break;
            }
            // The sleep separates cycles; the first one starts immediately.
            if self.cycle > 0 {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(self.spec.sleep) => {}
                }
            }
            let cycle = self.cycle;
            // The cycle boundary is the error boundary: whatever goes wrong
            // inside is logged with context and the worker lives on.
            match self.run_cycle().await {
                Ok(outcome) => {
                    log::debug!(
                        "Queue {}: cycle {cycle} requested {} pilot(s), {} submitted",
                        self.spec.name,
                        outcome.requested,
                        outcome.submitted
                    );
                }
                Err(error) => {
                    log::error!("Queue {}: cycle {cycle} failed: {error:?}", self.spec.name);
                }
            }
            self.cycle += 1;
        }
        self.set_state(WorkerState::Stopping);
        self.counters.forget(&self.spec.name);
        self.set_state(WorkerState::Terminated);
        log::info!("Queue {}: worker terminated", self.spec.name);
    }

    async fn run_cycle(&mut self) -> FactoryResult<CycleOutcome> {
        let ctx = self.collect_context();
        let decision = self.pipeline.run(&ctx);
        let count = decision.submit_count();

        let submitted = if count > 0 {
            self.submission.submit(count).await
        } else {
            Ok(Vec::new())
        };
        // Cleanup runs every cycle, whatever the submission step did.
        self.submission.cleanup().await;
        let records = submitted?;

        let label = decision.label();
        for monitor in &self.monitors {
            monitor.register_submissions(&self.spec.name, &records);
            monitor.update_label(&self.spec.name, &label);
        }

        Ok(CycleOutcome {
            requested: count,
            submitted: records.len(),
        })
    }

    /// Gathers this cycle's inputs from the shared caches. Missing or stale
    /// data stays `None`; the stages decide what that means for them.
    fn collect_context(&self) -> SchedContext {
        let spec = &self.spec;
        let batch = self
            .cache
            .batch_info(&spec.batch_source, &spec.name, self.max_age);
        if let Some(snapshot) = batch {
            self.counters.publish(&spec.name, snapshot.active());
        }
        let wms = self.cache.wms_info(&spec.wms_source, &spec.name, self.max_age);
        let site = self
            .cache
            .site_info(&spec.wms_source, spec.site_name(), self.max_age);

        let completions = self.pipeline.history_window().and_then(|window| {
            let source = self.history.as_ref()?;
            match source.recent_completions(&spec.name, window) {
                Ok(stats) => Some(stats),
                Err(error) => {
                    log::warn!(
                        "Queue {}: polling completion history failed: {error:?}",
                        spec.name
                    );
                    None
                }
            }
        });

        SchedContext {
            queue: spec.name.clone(),
            batch,
            wms,
            site,
            factory_active: self.counters.total(),
            completions,
        }
    }

    fn set_state(&self, state: WorkerState) {
        *self.state.lock().unwrap() = state;
    }
}
