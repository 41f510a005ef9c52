use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::config::QueueSpec;
use crate::factory::interface::ConfigSource;
use crate::factory::process::factory_process;
use crate::factory::reconcile::Reconciler;
use crate::factory::worker::{FactoryEnv, WorkerState};
use crate::Map;

/// Messages understood by the factory process. Requests carry the oneshot
/// sender their answer goes back through.
pub enum FactoryMessage {
    /// Reload the queue configuration and reconcile immediately.
    Reconfigure,
    GetQueues(oneshot::Sender<Map<String, QueueSpec>>),
    GetWorkerStates(oneshot::Sender<Map<String, WorkerState>>),
    QuitService,
}

/// Handle for talking to the running factory process.
pub struct FactoryService {
    sender: mpsc::UnboundedSender<FactoryMessage>,
}

impl FactoryService {
    pub fn trigger_reconfigure(&self) {
        self.send(FactoryMessage::Reconfigure);
    }

    pub async fn get_queues(&self) -> Map<String, QueueSpec> {
        self.request(FactoryMessage::GetQueues).await
    }

    pub async fn get_worker_states(&self) -> Map<String, WorkerState> {
        self.request(FactoryMessage::GetWorkerStates).await
    }

    pub fn quit(&self) {
        self.send(FactoryMessage::QuitService);
    }

    async fn request<T>(&self, message: impl FnOnce(oneshot::Sender<T>) -> FactoryMessage) -> T {
        let (tx, rx) = oneshot::channel();
        self.send(message(tx));
        rx.await.expect("The factory process is gone")
    }

    fn send(&self, msg: FactoryMessage) {
        let _ = self.sender.send(msg);
    }
}

/// Creates the factory service together with the future running its event
/// loop. The future must be awaited (or spawned) for the service to work.
pub fn create_factory_service(
    env: FactoryEnv,
    config_source: Arc<dyn ConfigSource>,
    reconfig_interval: Duration,
) -> (FactoryService, impl Future<Output = ()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let reconciler = Reconciler::new(env);
    let process = factory_process(config_source, reconciler, reconfig_interval, rx);
    let service = FactoryService { sender: tx };
    (service, process)
}
