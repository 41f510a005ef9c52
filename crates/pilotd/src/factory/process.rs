//! The factory event loop: periodically reloads the queue configuration,
//! reconciles workers, and reacts to service messages.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::factory::interface::ConfigSource;
use crate::factory::reconcile::Reconciler;
use crate::factory::service::FactoryMessage;

pub async fn factory_process(
    config_source: Arc<dyn ConfigSource>,
    mut reconciler: Reconciler,
    reconfig_interval: Duration,
    mut receiver: mpsc::UnboundedReceiver<FactoryMessage>,
) {
    // The initial load happens before any message is served, so that early
    // requests already observe the configured queue set.
    reconfigure(&*config_source, &mut reconciler).await;

    let mut reconfig_timer = tokio::time::interval_at(
        tokio::time::Instant::now() + reconfig_interval,
        reconfig_interval,
    );
    reconfig_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = reconfig_timer.tick() => {
                reconfigure(&*config_source, &mut reconciler).await;
            }
            msg = receiver.recv() => {
                match msg {
                    None | Some(FactoryMessage::QuitService) => break,
                    Some(FactoryMessage::Reconfigure) => {
                        reconfigure(&*config_source, &mut reconciler).await;
                    }
                    Some(FactoryMessage::GetQueues(response)) => {
                        respond(response, reconciler.specs().clone());
                    }
                    Some(FactoryMessage::GetWorkerStates(response)) => {
                        respond(response, reconciler.worker_states());
                    }
                }
            }
        }
    }
    log::debug!("Ending pilot factory, stopping all queue workers");
    reconciler.shutdown_all().await;
}

fn respond<T>(channel: oneshot::Sender<T>, answer: T) {
    if channel.send(answer).is_err() {
        log::warn!("A service request was abandoned before its answer arrived");
    }
}

/// One reconfiguration pass. A configuration that fails to load is surfaced
/// to the operator but never retracts already-running workers.
async fn reconfigure(config_source: &dyn ConfigSource, reconciler: &mut Reconciler) {
    match config_source.load() {
        Ok(specs) => {
            log::debug!("Loaded {} queue definition(s)", specs.len());
            reconciler.reconcile(specs).await;
        }
        Err(error) => {
            log::error!("Loading queue configuration failed: {error:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueSpec;
    use crate::factory::service::{create_factory_service, FactoryService};
    use crate::factory::worker::tests::{test_env, TestSpecBuilder};
    use crate::factory::worker::WorkerState;
    use crate::factory::FactoryResult;
    use crate::Map;
    use std::sync::Mutex;

    struct StaticConfig {
        specs: Mutex<FactoryResult<Map<String, QueueSpec>>>,
    }

    impl StaticConfig {
        fn with(specs: Vec<QueueSpec>) -> Arc<Self> {
            Arc::new(Self {
                specs: Mutex::new(Ok(specs
                    .into_iter()
                    .map(|s| (s.name.clone(), s))
                    .collect())),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                specs: Mutex::new(Err(anyhow::anyhow!("config file unreadable"))),
            })
        }

        fn set(&self, specs: Vec<QueueSpec>) {
            *self.specs.lock().unwrap() =
                Ok(specs.into_iter().map(|s| (s.name.clone(), s)).collect());
        }
    }

    impl ConfigSource for StaticConfig {
        fn load(&self) -> FactoryResult<Map<String, QueueSpec>> {
            match &*self.specs.lock().unwrap() {
                Ok(specs) => Ok(specs.clone()),
                Err(error) => Err(anyhow::anyhow!("{error}")),
            }
        }
    }

    fn long_lived(name: &str) -> QueueSpec {
        let mut spec = TestSpecBuilder::default()
            .sleep(std::time::Duration::from_secs(3600))
            .max_cycles(None)
            .into_spec();
        spec.name = name.to_string();
        spec
    }

    async fn run_service_test<F, Fut>(config: Arc<StaticConfig>, f: F)
    where
        F: FnOnce(FactoryService) -> Fut,
        Fut: Future<Output = ()>,
    {
        let harness = test_env();
        let (service, process) = create_factory_service(
            harness.env,
            config,
            std::time::Duration::from_secs(3600),
        );
        let process = tokio::spawn(process);
        f(service).await;
        process.await.unwrap();
    }

    #[tokio::test]
    async fn initial_load_starts_workers() {
        let config = StaticConfig::with(vec![long_lived("a"), long_lived("b")]);
        run_service_test(config, |service| async move {
            let states = service.get_worker_states().await;
            assert_eq!(states.len(), 2);
            assert!(states.values().all(|s| *s == WorkerState::Running));
            service.quit();
        })
        .await;
    }

    #[tokio::test]
    async fn explicit_reconfigure_applies_new_specs() {
        let config = StaticConfig::with(vec![long_lived("a")]);
        let config2 = config.clone();
        run_service_test(config, |service| async move {
            assert_eq!(service.get_queues().await.len(), 1);

            config2.set(vec![long_lived("a"), long_lived("c")]);
            service.trigger_reconfigure();

            let queues = service.get_queues().await;
            assert_eq!(queues.len(), 2);
            assert!(queues.contains_key("c"));
            service.quit();
        })
        .await;
    }

    #[tokio::test]
    async fn failed_load_keeps_running_workers() {
        let config = StaticConfig::with(vec![long_lived("a")]);
        let config2 = config.clone();
        run_service_test(config, |service| async move {
            assert_eq!(service.get_worker_states().await.len(), 1);

            *config2.specs.lock().unwrap() = Err(anyhow::anyhow!("config file unreadable"));
            service.trigger_reconfigure();

            let states = service.get_worker_states().await;
            assert_eq!(states.len(), 1);
            assert!(states.values().all(|s| *s == WorkerState::Running));
            service.quit();
        })
        .await;
    }

    #[tokio::test]
    async fn quit_terminates_all_workers() {
        let config = StaticConfig::with(vec![long_lived("a")]);
        let harness = test_env();
        let (service, process) = create_factory_service(
            harness.env,
            config,
            std::time::Duration::from_secs(3600),
        );
        let process = tokio::spawn(process);
        let states = service.get_worker_states().await;
        assert_eq!(states.len(), 1);
        service.quit();
        // The process only resolves once every worker reached Terminated.
        process.await.unwrap();
    }

    #[tokio::test]
    async fn process_survives_initially_broken_config() {
        let config = StaticConfig::failing();
        run_service_test(config, |service| async move {
            assert!(service.get_worker_states().await.is_empty());
            service.quit();
        })
        .await;
    }
}
