pub mod file;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::factory::sched::stages::StageSpec;

/// One configured logical queue ("APF queue").
///
/// A spec is replaced wholesale whenever any of its fields changes between two
/// reconfiguration passes; the reconciler compares specs with `==` and treats
/// any difference as a stop-and-restart of the queue's worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueSpec {
    /// Unique queue name, used as the registry key.
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// How long the queue worker sleeps between two cycles.
    #[serde(with = "crate::common::timeutils::duration_humantime", default = "default_sleep")]
    pub sleep: Duration,
    /// If set, the worker stops on its own after this many cycles.
    #[serde(default)]
    pub max_cycles: Option<u64>,
    /// Signature of the batch-status endpoint this queue reads from.
    pub batch_source: String,
    /// Signature of the workload-management-status endpoint.
    pub wms_source: String,
    /// Site name for WMS site-status lookups. Defaults to the queue name.
    #[serde(default)]
    pub site: Option<String>,
    /// Identifier of the submission backend.
    pub submission: String,
    /// Identifiers of monitor sinks that receive per-cycle reports.
    #[serde(default)]
    pub monitors: Vec<String>,
    /// Identifier of the completion-history source (used by the throttle stage).
    #[serde(default)]
    pub history: Option<String>,
    /// Ordered scheduling pipeline. Order is significant and preserved exactly.
    #[serde(default)]
    pub stages: Vec<StageSpec>,
}

impl QueueSpec {
    /// Site name used for WMS site-status lookups.
    pub fn site_name(&self) -> &str {
        self.site.as_deref().unwrap_or(&self.name)
    }
}

fn default_true() -> bool {
    true
}

fn default_sleep() -> Duration {
    Duration::from_secs(60)
}

/// Factory-wide settings from the `[factory]` table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FactorySettings {
    /// How often each batch-status poller refreshes its capture.
    #[serde(with = "crate::common::timeutils::duration_humantime")]
    pub batch_poll_interval: Duration,
    /// How often each WMS-status poller refreshes its capture.
    #[serde(with = "crate::common::timeutils::duration_humantime")]
    pub wms_poll_interval: Duration,
    /// How often the queue configuration is reloaded and reconciled.
    #[serde(with = "crate::common::timeutils::duration_humantime")]
    pub reconfig_interval: Duration,
    /// Maximum age of a cached status capture that workers still accept.
    #[serde(with = "crate::common::timeutils::duration_humantime")]
    pub max_snapshot_age: Duration,
}

impl Default for FactorySettings {
    fn default() -> Self {
        Self {
            batch_poll_interval: Duration::from_secs(60),
            wms_poll_interval: Duration::from_secs(60),
            reconfig_interval: Duration::from_secs(300),
            max_snapshot_age: Duration::from_secs(360),
        }
    }
}

/// The whole configuration file: `[factory]` settings plus `[[queue]]` tables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FactoryConfig {
    #[serde(default)]
    pub factory: FactorySettings,
    #[serde(default, rename = "queue")]
    pub queues: Vec<QueueSpec>,
}
