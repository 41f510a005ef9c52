//! The pilot factory core: for every configured queue, a worker task
//! periodically decides how many pilots to submit into the external batch
//! system and dispatches that submission.
//!
//! The term `pilot` refers to a placeholder batch job that, once running,
//! pulls real work from the workload-management system.
pub mod dryrun;
pub mod interface;
pub mod process;
pub mod reconcile;
pub mod sched;
pub mod service;
pub mod status;
pub mod worker;

pub type FactoryResult<T> = anyhow::Result<T>;

pub use process::factory_process;
pub use reconcile::{compute_diff, ReconciliationDiff, Reconciler};
pub use service::{create_factory_service, FactoryService};
pub use status::{BatchQueueSnapshot, SiteStatus, StatusCache, WmsQueueSnapshot};
pub use worker::{FactoryCounters, WorkerState};
