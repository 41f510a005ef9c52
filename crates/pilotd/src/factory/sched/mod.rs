//! The scheduling pipeline: an ordered list of stages folded over a
//! candidate submission count.

pub mod stages;

use std::time::Duration;

use crate::factory::interface::CompletionStats;
use crate::factory::status::{BatchQueueSnapshot, SiteStatus, WmsQueueSnapshot};
use stages::StageSpec;

/// Per-cycle inputs of the pipeline. Built at the start of a cycle from the
/// status cache and discarded at the end.
///
/// `None` snapshots mean "missing or stale data"; each stage interprets that
/// according to its own policy, the pipeline itself never aborts on it.
#[derive(Debug, Clone, Default)]
pub struct SchedContext {
    pub queue: String,
    pub batch: Option<BatchQueueSnapshot>,
    pub wms: Option<WmsQueueSnapshot>,
    pub site: Option<SiteStatus>,
    /// Sum of pending+running over all queues of this factory process.
    pub factory_active: u64,
    /// Recent completion history, when a throttle stage asked for it.
    pub completions: Option<CompletionStats>,
}

/// One transformation of the candidate count. Stages are pure given the
/// context; all state they consult arrives through [`SchedContext`].
pub trait SchedStage: Send + Sync {
    fn name(&self) -> &'static str;

    /// Returns the next candidate count and a diagnostic message.
    fn compute(&self, n: i64, ctx: &SchedContext) -> (i64, String);

    /// History window this stage wants prefetched, if any.
    fn history_window(&self) -> Option<Duration> {
        None
    }
}

/// Result of one pipeline run. The count may be negative; the clamp to zero
/// happens once, in [`SchedDecision::submit_count`], so that negative
/// intermediate values can still flow between stages.
#[derive(Debug, Clone)]
pub struct SchedDecision {
    pub count: i64,
    pub trace: Vec<String>,
}

impl SchedDecision {
    /// The count actually handed to the submission backend.
    pub fn submit_count(&self) -> u64 {
        self.count.max(0) as u64
    }

    /// Human-readable per-cycle label for monitors.
    pub fn label(&self) -> String {
        self.trace.join(" | ")
    }
}

/// Ordered stage list of one queue, built once at worker construction.
pub struct SchedPipeline {
    stages: Vec<Box<dyn SchedStage>>,
}

impl SchedPipeline {
    pub fn new(specs: &[StageSpec]) -> Self {
        Self {
            stages: specs.iter().map(|spec| spec.build()).collect(),
        }
    }

    /// Folds a starting count of 0 through every stage in configured order.
    /// Every stage always runs, regardless of earlier outputs.
    pub fn run(&self, ctx: &SchedContext) -> SchedDecision {
        let mut count = 0;
        let mut trace = Vec::with_capacity(self.stages.len());
        for stage in &self.stages {
            let (next, msg) = stage.compute(count, ctx);
            trace.push(format!("{}: {msg}", stage.name()));
            count = next;
        }
        SchedDecision { count, trace }
    }

    /// Largest history window any stage asks for, if one does. Completion
    /// stats are fetched once per cycle, for this widest window; a throttle
    /// stage configured with a narrower window sees those wider stats.
    pub fn history_window(&self) -> Option<Duration> {
        self.stages
            .iter()
            .filter_map(|stage| stage.history_window())
            .max()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}
