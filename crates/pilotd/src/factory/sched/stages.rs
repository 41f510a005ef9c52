//! The stage catalogue.
//!
//! [`StageSpec`] is the configuration-facing, serde-tagged form of a stage;
//! [`StageSpec::build`] is the static registry that turns a tag into the
//! stage implementation. Adding a stage kind means adding a variant here,
//! there is no runtime lookup by name.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::factory::sched::{SchedContext, SchedStage};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StageSpec {
    /// Returns a configured constant, ignoring the incoming count.
    Fixed {
        #[serde(default)]
        value: Option<i64>,
    },
    /// Caps the count per cycle.
    MaxPerCycle {
        #[serde(default)]
        max: Option<i64>,
    },
    /// Raises the count to a per-cycle floor.
    MinPerCycle {
        #[serde(default)]
        min: Option<i64>,
    },
    /// Caps the count so that pending+running never exceeds a total.
    MaxToRun { max_to_run: i64 },
    /// Caps the count by the room left below a pending ceiling. A negative
    /// result may flow to the next stage unless `floor_at_zero` is set.
    MaxPending {
        #[serde(default)]
        max_pending: Option<i64>,
        #[serde(default)]
        floor_at_zero: bool,
    },
    /// Raises the count so that at least `min_pending` pilots are pending.
    MinPending {
        #[serde(default)]
        min_pending: Option<i64>,
    },
    /// Caps the count by the room left below a factory-wide active total.
    MaxPerFactory {
        #[serde(default)]
        maximum: Option<i64>,
    },
    /// Multiplies the count by a factor, rounding up.
    Scale {
        #[serde(default = "default_factor")]
        factor: f64,
    },
    /// Demand-driven: submit for activated WMS jobs not yet covered by
    /// pending pilots.
    Ready {
        #[serde(default)]
        offset: i64,
    },
    /// Weighted variant of `Ready`.
    WeightedActivated {
        #[serde(default = "default_weight")]
        w_activated: f64,
        #[serde(default = "default_weight")]
        w_pending: f64,
        #[serde(default)]
        default: i64,
    },
    /// Keeps a number of pilots running; negative outputs are a legitimate
    /// "too many already" signal for downstream stages.
    KeepNRunning {
        #[serde(default)]
        target: Option<i64>,
    },
    /// Overrides the count when the WMS site status is `offline`.
    StatusOffline {
        #[serde(default)]
        pilots: i64,
    },
    /// Overrides the count when the WMS site status is `test`.
    StatusTest {
        #[serde(default)]
        pilots: i64,
    },
    /// Caps the count at a probe value when too many recent completions were
    /// unusually short-lived. Fails open when history is unavailable.
    Throttle {
        #[serde(
            with = "crate::common::timeutils::duration_humantime",
            default = "default_throttle_window"
        )]
        window: Duration,
        #[serde(default = "default_throttle_threshold")]
        threshold: f64,
        #[serde(default = "default_throttle_probe")]
        probe: i64,
    },
    /// Always returns 0.
    Null,
}

fn default_factor() -> f64 {
    1.0
}

fn default_weight() -> f64 {
    1.0
}

fn default_throttle_window() -> Duration {
    Duration::from_secs(3600)
}

fn default_throttle_threshold() -> f64 {
    0.5
}

fn default_throttle_probe() -> i64 {
    1
}

impl StageSpec {
    /// The stage constructor table.
    pub fn build(&self) -> Box<dyn SchedStage> {
        match *self {
            StageSpec::Fixed { value } => Box::new(Fixed { value }),
            StageSpec::MaxPerCycle { max } => Box::new(MaxPerCycle { max }),
            StageSpec::MinPerCycle { min } => Box::new(MinPerCycle { min }),
            StageSpec::MaxToRun { max_to_run } => Box::new(MaxToRun { max_to_run }),
            StageSpec::MaxPending {
                max_pending,
                floor_at_zero,
            } => Box::new(MaxPending {
                max_pending,
                floor_at_zero,
            }),
            StageSpec::MinPending { min_pending } => Box::new(MinPending { min_pending }),
            StageSpec::MaxPerFactory { maximum } => Box::new(MaxPerFactory { maximum }),
            StageSpec::Scale { factor } => Box::new(Scale { factor }),
            StageSpec::Ready { offset } => Box::new(Ready { offset }),
            StageSpec::WeightedActivated {
                w_activated,
                w_pending,
                default,
            } => Box::new(WeightedActivated {
                w_activated,
                w_pending,
                default,
            }),
            StageSpec::KeepNRunning { target } => Box::new(KeepNRunning { target }),
            StageSpec::StatusOffline { pilots } => Box::new(StatusOverride {
                name: "status_offline",
                status: crate::factory::status::SiteStatus::Offline,
                pilots,
            }),
            StageSpec::StatusTest { pilots } => Box::new(StatusOverride {
                name: "status_test",
                status: crate::factory::status::SiteStatus::Test,
                pilots,
            }),
            StageSpec::Throttle {
                window,
                threshold,
                probe,
            } => Box::new(Throttle {
                window,
                threshold,
                probe,
            }),
            StageSpec::Null => Box::new(Null),
        }
    }
}

struct Fixed {
    value: Option<i64>,
}

impl SchedStage for Fixed {
    fn name(&self) -> &'static str {
        "fixed"
    }

    fn compute(&self, n: i64, _ctx: &SchedContext) -> (i64, String) {
        let out = self.value.unwrap_or(0);
        (out, format!("{n} -> {out}"))
    }
}

struct MaxPerCycle {
    max: Option<i64>,
}

impl SchedStage for MaxPerCycle {
    fn name(&self) -> &'static str {
        "max_per_cycle"
    }

    fn compute(&self, n: i64, _ctx: &SchedContext) -> (i64, String) {
        match self.max {
            Some(max) => {
                let out = n.min(max);
                (out, format!("{n} -> {out} (max={max})"))
            }
            None => (n, format!("{n} (no max configured)")),
        }
    }
}

struct MinPerCycle {
    min: Option<i64>,
}

impl SchedStage for MinPerCycle {
    fn name(&self) -> &'static str {
        "min_per_cycle"
    }

    fn compute(&self, n: i64, _ctx: &SchedContext) -> (i64, String) {
        match self.min {
            Some(min) => {
                let out = n.max(min);
                (out, format!("{n} -> {out} (min={min})"))
            }
            None => (n, format!("{n} (no min configured)")),
        }
    }
}

struct MaxToRun {
    max_to_run: i64,
}

impl SchedStage for MaxToRun {
    fn name(&self) -> &'static str {
        "max_to_run"
    }

    fn compute(&self, n: i64, ctx: &SchedContext) -> (i64, String) {
        let Some(batch) = ctx.batch else {
            return (0, format!("{n} -> 0 (batch status unavailable)"));
        };
        let active = batch.active() as i64;
        let out = n.min(self.max_to_run - active);
        (
            out,
            format!("{n} -> {out} (max_to_run={}, active={active})", self.max_to_run),
        )
    }
}

struct MaxPending {
    max_pending: Option<i64>,
    floor_at_zero: bool,
}

impl SchedStage for MaxPending {
    fn name(&self) -> &'static str {
        "max_pending"
    }

    fn compute(&self, n: i64, ctx: &SchedContext) -> (i64, String) {
        let Some(max_pending) = self.max_pending else {
            return (n, format!("{n} (no max_pending configured)"));
        };
        let Some(batch) = ctx.batch else {
            return (n, format!("{n} (batch status unavailable)"));
        };
        let pending = batch.pending as i64;
        if pending == 0 {
            // No pilots waiting at all; the ceiling does not apply since
            // there may be free capacity to fill.
            return (n, format!("{n} (nothing pending)"));
        }
        let mut out = n.min(max_pending - pending);
        if self.floor_at_zero {
            out = out.max(0);
        }
        (
            out,
            format!("{n} -> {out} (max_pending={max_pending}, pending={pending})"),
        )
    }
}

struct MinPending {
    min_pending: Option<i64>,
}

impl SchedStage for MinPending {
    fn name(&self) -> &'static str {
        "min_pending"
    }

    fn compute(&self, n: i64, ctx: &SchedContext) -> (i64, String) {
        let Some(min_pending) = self.min_pending else {
            return (n, format!("{n} (no min_pending configured)"));
        };
        let Some(batch) = ctx.batch else {
            return (n, format!("{n} (batch status unavailable)"));
        };
        let pending = batch.pending as i64;
        let out = n.max(min_pending - pending);
        (
            out,
            format!("{n} -> {out} (min_pending={min_pending}, pending={pending})"),
        )
    }
}

struct MaxPerFactory {
    maximum: Option<i64>,
}

impl SchedStage for MaxPerFactory {
    fn name(&self) -> &'static str {
        "max_per_factory"
    }

    fn compute(&self, n: i64, ctx: &SchedContext) -> (i64, String) {
        let Some(maximum) = self.maximum else {
            return (n, format!("{n} (no factory-wide max configured)"));
        };
        let total = ctx.factory_active as i64;
        let out = if total > maximum {
            0
        } else if n + total > maximum {
            maximum - total
        } else {
            n
        };
        (
            out,
            format!("{n} -> {out} (factory max={maximum}, factory active={total})"),
        )
    }
}

struct Scale {
    factor: f64,
}

impl SchedStage for Scale {
    fn name(&self) -> &'static str {
        "scale"
    }

    fn compute(&self, n: i64, _ctx: &SchedContext) -> (i64, String) {
        let out = (n as f64 * self.factor).ceil() as i64;
        (out, format!("{n} -> {out} (factor={})", self.factor))
    }
}

struct Ready {
    offset: i64,
}

impl SchedStage for Ready {
    fn name(&self) -> &'static str {
        "ready"
    }

    fn compute(&self, n: i64, ctx: &SchedContext) -> (i64, String) {
        let (Some(batch), Some(wms)) = (ctx.batch, ctx.wms) else {
            return (0, format!("{n} -> 0 (status unavailable)"));
        };
        let activated = wms.ready as i64;
        let pending = batch.pending as i64;
        let out = ((activated - self.offset) - pending).max(0);
        (
            out,
            format!(
                "{n} -> {out} (activated={activated}, offset={}, pending={pending})",
                self.offset
            ),
        )
    }
}

struct WeightedActivated {
    w_activated: f64,
    w_pending: f64,
    default: i64,
}

impl SchedStage for WeightedActivated {
    fn name(&self) -> &'static str {
        "weighted_activated"
    }

    fn compute(&self, n: i64, ctx: &SchedContext) -> (i64, String) {
        let (Some(batch), Some(wms)) = (ctx.batch, ctx.wms) else {
            return (
                self.default,
                format!("{n} -> {} (status unavailable, using default)", self.default),
            );
        };
        let weighted_activated = (wms.ready as f64 * self.w_activated).floor() as i64;
        let weighted_pending = (batch.pending as f64 * self.w_pending).floor() as i64;
        let out = (weighted_activated - weighted_pending).max(0);
        (
            out,
            format!(
                "{n} -> {out} (activated {} x {} vs pending {} x {})",
                wms.ready, self.w_activated, batch.pending, self.w_pending
            ),
        )
    }
}

struct KeepNRunning {
    target: Option<i64>,
}

impl SchedStage for KeepNRunning {
    fn name(&self) -> &'static str {
        "keep_n_running"
    }

    fn compute(&self, n: i64, ctx: &SchedContext) -> (i64, String) {
        let Some(batch) = ctx.batch else {
            return (0, format!("{n} -> 0 (batch status unavailable)"));
        };
        // Retiring/suspended pilots are deliberately not counted here.
        let active = (batch.pending + batch.running) as i64;
        match self.target {
            Some(target) => {
                let out = target - active;
                (out, format!("{n} -> {out} (target={target}, active={active})"))
            }
            None => {
                let out = n - active;
                (out, format!("{n} -> {out} (relative, active={active})"))
            }
        }
    }
}

struct StatusOverride {
    name: &'static str,
    status: crate::factory::status::SiteStatus,
    pilots: i64,
}

impl SchedStage for StatusOverride {
    fn name(&self) -> &'static str {
        self.name
    }

    fn compute(&self, n: i64, ctx: &SchedContext) -> (i64, String) {
        let Some(site) = ctx.site else {
            return (0, format!("{n} -> 0 (site status unavailable)"));
        };
        if site == self.status {
            (
                self.pilots,
                format!("{n} -> {} (site is {site:?})", self.pilots),
            )
        } else {
            (n, format!("{n} (site is {site:?})"))
        }
    }
}

struct Throttle {
    window: Duration,
    threshold: f64,
    probe: i64,
}

impl SchedStage for Throttle {
    fn name(&self) -> &'static str {
        "throttle"
    }

    fn compute(&self, n: i64, ctx: &SchedContext) -> (i64, String) {
        // Fail open: a history outage must not block submission.
        let Some(stats) = ctx.completions else {
            return (n, format!("{n} (history unavailable)"));
        };
        if stats.total == 0 {
            return (n, format!("{n} (no recent completions)"));
        }
        let ratio = stats.short_lived as f64 / stats.total as f64;
        if ratio > self.threshold {
            let out = n.min(self.probe);
            (
                out,
                format!(
                    "{n} -> {out} (short-lived ratio {:.2} > {:.2}, probing)",
                    ratio, self.threshold
                ),
            )
        } else {
            (n, format!("{n} (short-lived ratio {ratio:.2})"))
        }
    }

    fn history_window(&self) -> Option<Duration> {
        Some(self.window)
    }
}

struct Null;

impl SchedStage for Null {
    fn name(&self) -> &'static str {
        "null"
    }

    fn compute(&self, n: i64, _ctx: &SchedContext) -> (i64, String) {
        (0, format!("{n} -> 0"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::interface::CompletionStats;
    use crate::factory::status::{BatchQueueSnapshot, SiteStatus, WmsQueueSnapshot};

    fn empty_ctx() -> SchedContext {
        SchedContext::default()
    }

    fn ctx(pending: u64, running: u64) -> SchedContext {
        SchedContext {
            batch: Some(BatchQueueSnapshot {
                pending,
                running,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn compute(spec: StageSpec, n: i64, ctx: &SchedContext) -> i64 {
        spec.build().compute(n, ctx).0
    }

    #[test]
    fn fixed_returns_constant() {
        assert_eq!(compute(StageSpec::Fixed { value: Some(7) }, 100, &empty_ctx()), 7);
        assert_eq!(compute(StageSpec::Fixed { value: None }, 100, &empty_ctx()), 0);
    }

    #[test]
    fn max_per_cycle_clamps() {
        let spec = StageSpec::MaxPerCycle { max: Some(10) };
        assert_eq!(compute(spec.clone(), 25, &empty_ctx()), 10);
        assert_eq!(compute(spec.clone(), 3, &empty_ctx()), 3);
        assert_eq!(compute(StageSpec::MaxPerCycle { max: None }, 25, &empty_ctx()), 25);
    }

    #[test]
    fn max_per_cycle_is_idempotent() {
        let stage = StageSpec::MaxPerCycle { max: Some(10) }.build();
        for n in [0, 1, 9, 10, 11, 1000] {
            let (once, _) = stage.compute(n, &empty_ctx());
            let (twice, _) = stage.compute(once, &empty_ctx());
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn min_per_cycle_raises() {
        let spec = StageSpec::MinPerCycle { min: Some(5) };
        assert_eq!(compute(spec.clone(), 0, &empty_ctx()), 5);
        assert_eq!(compute(spec, 8, &empty_ctx()), 8);
        assert_eq!(compute(StageSpec::MinPerCycle { min: None }, 2, &empty_ctx()), 2);
    }

    #[test]
    fn max_to_run_accounts_for_active() {
        let spec = StageSpec::MaxToRun { max_to_run: 12 };
        assert_eq!(compute(spec.clone(), 5, &ctx(0, 10)), 2);
        assert_eq!(compute(spec.clone(), 1, &ctx(0, 10)), 1);
        // Missing batch snapshot means no submission.
        assert_eq!(compute(spec, 5, &empty_ctx()), 0);
    }

    #[test]
    fn max_pending_passthrough_with_zero_pending() {
        let spec = StageSpec::MaxPending {
            max_pending: Some(2),
            floor_at_zero: false,
        };
        // No ceiling applies when nothing is pending, whatever the max.
        assert_eq!(compute(spec, 50, &ctx(0, 10)), 50);
    }

    #[test]
    fn max_pending_limits_and_may_go_negative() {
        let spec = StageSpec::MaxPending {
            max_pending: Some(5),
            floor_at_zero: false,
        };
        assert_eq!(compute(spec.clone(), 10, &ctx(3, 0)), 2);
        assert_eq!(compute(spec, 10, &ctx(8, 0)), -3);

        let floored = StageSpec::MaxPending {
            max_pending: Some(5),
            floor_at_zero: true,
        };
        assert_eq!(compute(floored, 10, &ctx(8, 0)), 0);

        let unset = StageSpec::MaxPending {
            max_pending: None,
            floor_at_zero: false,
        };
        assert_eq!(compute(unset, 10, &ctx(8, 0)), 10);
    }

    #[test]
    fn min_pending_tops_up() {
        let spec = StageSpec::MinPending {
            min_pending: Some(6),
        };
        assert_eq!(compute(spec.clone(), 1, &ctx(2, 0)), 4);
        assert_eq!(compute(spec, 10, &ctx(2, 0)), 10);
    }

    #[test]
    fn max_per_factory_branches() {
        let spec = StageSpec::MaxPerFactory { maximum: Some(100) };
        let mut context = empty_ctx();
        context.factory_active = 120;
        assert_eq!(compute(spec.clone(), 10, &context), 0);
        context.factory_active = 95;
        assert_eq!(compute(spec.clone(), 10, &context), 5);
        context.factory_active = 50;
        assert_eq!(compute(spec, 10, &context), 10);

        let unset = StageSpec::MaxPerFactory { maximum: None };
        assert_eq!(compute(unset, 10, &context), 10);
    }

    #[test]
    fn scale_rounds_up() {
        assert_eq!(compute(StageSpec::Scale { factor: 0.5 }, 3, &empty_ctx()), 2);
        assert_eq!(compute(StageSpec::Scale { factor: 0.5 }, 4, &empty_ctx()), 2);
        assert_eq!(compute(StageSpec::Scale { factor: 2.5 }, 0, &empty_ctx()), 0);
        assert_eq!(compute(StageSpec::Scale { factor: 1.2 }, 10, &empty_ctx()), 12);
    }

    #[test]
    fn ready_submits_for_uncovered_activated_jobs() {
        let spec = StageSpec::Ready { offset: 2 };
        let mut context = ctx(3, 0);
        context.wms = Some(WmsQueueSnapshot {
            ready: 10,
            ..Default::default()
        });
        // (10 - 2) - 3
        assert_eq!(compute(spec.clone(), 0, &context), 5);

        context.wms = Some(WmsQueueSnapshot {
            ready: 4,
            ..Default::default()
        });
        assert_eq!(compute(spec.clone(), 0, &context), 0);

        assert_eq!(compute(spec, 7, &empty_ctx()), 0);
    }

    #[test]
    fn weighted_activated_uses_floors_and_default() {
        let spec = StageSpec::WeightedActivated {
            w_activated: 0.5,
            w_pending: 1.0,
            default: 3,
        };
        let mut context = ctx(2, 0);
        context.wms = Some(WmsQueueSnapshot {
            ready: 9,
            ..Default::default()
        });
        // floor(9 * 0.5) - floor(2 * 1.0) = 4 - 2
        assert_eq!(compute(spec.clone(), 0, &context), 2);
        assert_eq!(compute(spec, 0, &empty_ctx()), 3);
    }

    #[test]
    fn keep_n_running_modes() {
        let absolute = StageSpec::KeepNRunning { target: Some(20) };
        assert_eq!(compute(absolute.clone(), 0, &ctx(4, 6)), 10);
        // Negative output signals "too many already".
        assert_eq!(compute(absolute, 0, &ctx(10, 15)), -5);

        let relative = StageSpec::KeepNRunning { target: None };
        assert_eq!(compute(relative, 12, &ctx(4, 6)), 2);
    }

    #[test]
    fn status_overrides() {
        let offline = StageSpec::StatusOffline { pilots: 0 };
        let mut context = empty_ctx();
        context.site = Some(SiteStatus::Offline);
        assert_eq!(compute(offline.clone(), 40, &context), 0);
        context.site = Some(SiteStatus::Online);
        assert_eq!(compute(offline.clone(), 40, &context), 40);
        context.site = None;
        assert_eq!(compute(offline, 40, &context), 0);

        let test = StageSpec::StatusTest { pilots: 2 };
        context.site = Some(SiteStatus::Test);
        assert_eq!(compute(test.clone(), 40, &context), 2);
        context.site = Some(SiteStatus::Online);
        assert_eq!(compute(test, 40, &context), 40);
    }

    #[test]
    fn throttle_caps_on_bad_ratio_and_fails_open() {
        let spec = StageSpec::Throttle {
            window: Duration::from_secs(3600),
            threshold: 0.5,
            probe: 1,
        };
        let mut context = empty_ctx();

        context.completions = Some(CompletionStats {
            total: 10,
            short_lived: 8,
        });
        assert_eq!(compute(spec.clone(), 40, &context), 1);

        context.completions = Some(CompletionStats {
            total: 10,
            short_lived: 2,
        });
        assert_eq!(compute(spec.clone(), 40, &context), 40);

        context.completions = Some(CompletionStats::default());
        assert_eq!(compute(spec.clone(), 40, &context), 40);

        context.completions = None;
        assert_eq!(compute(spec, 40, &context), 40);
    }

    #[test]
    fn null_always_zero() {
        assert_eq!(compute(StageSpec::Null, 123, &empty_ctx()), 0);
    }
}
