//! Diffing a freshly loaded queue configuration set against the running one
//! and starting/stopping workers accordingly.

use crate::config::QueueSpec;
use crate::factory::worker::{spawn_worker, FactoryEnv, WorkerHandle, WorkerState};
use crate::{Map, Set};

/// Partition of all queue names seen in the old or new spec set. The four
/// sets are pairwise disjoint and together cover the union of both key sets.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReconciliationDiff {
    pub added: Set<String>,
    pub removed: Set<String>,
    pub modified: Set<String>,
    pub unchanged: Set<String>,
}

/// Classifies every queue name. Any spec difference counts as MODIFIED:
/// workers cannot be reconfigured in place, so the comparison is
/// deliberately the full structural equality of the spec.
pub fn compute_diff(
    old: &Map<String, QueueSpec>,
    new: &Map<String, QueueSpec>,
) -> ReconciliationDiff {
    let mut diff = ReconciliationDiff::default();
    for (name, old_spec) in old {
        match new.get(name) {
            None => {
                diff.removed.insert(name.clone());
            }
            Some(new_spec) if new_spec == old_spec => {
                diff.unchanged.insert(name.clone());
            }
            Some(_) => {
                diff.modified.insert(name.clone());
            }
        }
    }
    for name in new.keys() {
        if !old.contains_key(name) {
            diff.added.insert(name.clone());
        }
    }
    diff
}

/// Owns the worker registry and the currently applied spec set.
///
/// Only the factory process task calls into the reconciler, so passes are
/// naturally serialized; workers never touch the registry.
pub struct Reconciler {
    env: FactoryEnv,
    specs: Map<String, QueueSpec>,
    workers: Map<String, WorkerHandle>,
}

impl Reconciler {
    pub fn new(env: FactoryEnv) -> Self {
        Self {
            env,
            specs: Map::default(),
            workers: Map::default(),
        }
    }

    pub fn specs(&self) -> &Map<String, QueueSpec> {
        &self.specs
    }

    pub fn worker_states(&self) -> Map<String, WorkerState> {
        self.workers
            .iter()
            .map(|(name, handle)| (name.clone(), handle.state()))
            .collect()
    }

    /// Applies a new spec set: stops workers of removed and modified queues
    /// (waiting for full termination), then starts workers for added and
    /// modified queues. Unchanged workers keep running untouched, including
    /// their cycle counters.
    pub async fn reconcile(&mut self, new_specs: Map<String, QueueSpec>) {
        let diff = compute_diff(&self.specs, &new_specs);
        log::info!(
            "Reconciling queues: {} added, {} removed, {} modified, {} unchanged",
            diff.added.len(),
            diff.removed.len(),
            diff.modified.len(),
            diff.unchanged.len()
        );

        for name in diff.removed.iter().chain(&diff.modified) {
            self.stop_worker(name).await;
        }
        // A modified worker has fully terminated above before its
        // replacement starts; there is never a moment with two workers
        // submitting for one queue.
        for name in diff.added.iter().chain(&diff.modified) {
            let spec = match new_specs.get(name) {
                Some(spec) => spec.clone(),
                None => continue,
            };
            self.start_worker(spec);
        }

        self.specs = new_specs;
    }

    /// Stops every worker and forgets the applied spec set. Cancelling the
    /// shared shutdown token also winds down the status pollers.
    pub async fn shutdown_all(&mut self) {
        let names: Vec<String> = self.workers.keys().cloned().collect();
        for name in names {
            self.stop_worker(&name).await;
        }
        self.specs.clear();
        self.env.shutdown.cancel();
    }

    async fn stop_worker(&mut self, name: &str) {
        if let Some(handle) = self.workers.remove(name) {
            log::debug!("Stopping worker of queue {name}");
            handle.stop_and_wait().await;
            self.env.counters.forget(name);
        }
    }

    fn start_worker(&mut self, spec: QueueSpec) {
        if !spec.enabled {
            log::info!("Queue {} is disabled, not starting a worker", spec.name);
            return;
        }
        let name = spec.name.clone();
        match spawn_worker(spec, &self.env) {
            Ok(handle) => {
                self.workers.insert(name, handle);
            }
            Err(error) => {
                // One broken queue never prevents the others from running.
                log::error!("Could not construct a worker for queue {name}: {error:?}");
            }
        }
    }
}
