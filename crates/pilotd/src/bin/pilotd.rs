use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

use pilotd::common::setup::setup_logging;
use pilotd::config::file::{load_factory_config, FileConfigSource};
use pilotd::config::FactoryConfig;
use pilotd::factory::dryrun::{DryRunBackend, EmptyHistory, IdleBatchEndpoint, IdleWmsEndpoint};
use pilotd::factory::interface::{EndpointRegistry, LoggingMonitor};
use pilotd::factory::worker::FactoryEnv;
use pilotd::factory::{create_factory_service, FactoryCounters, StatusCache};

#[derive(Parser)]
#[command(
    name = "pilotd",
    about = "Pilot factory daemon: keeps a configured backlog of pilots flowing into batch systems"
)]
struct Opts {
    /// Path to the factory configuration file
    #[arg(long, env = "PILOTD_CONFIG", default_value = "factory.toml")]
    config: PathBuf,

    /// Enable debug output
    #[arg(short, long)]
    verbose: bool,

    /// Stop every queue worker after this many cycles
    #[arg(long)]
    cycles: Option<u64>,

    /// Override the sleep interval of every queue (e.g. `30s`)
    #[arg(long, value_parser = humantime::parse_duration)]
    sleep: Option<Duration>,

    /// Override how often the configuration is reloaded
    #[arg(long, value_parser = humantime::parse_duration)]
    reconfig_interval: Option<Duration>,
}

fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();
    setup_logging(opts.verbose);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run_factory(opts))
}

async fn run_factory(opts: Opts) -> anyhow::Result<()> {
    let config = load_factory_config(&opts.config)?;
    let settings = config.factory.clone();
    log::info!(
        "Starting pilot factory with {} configured queue(s) from {}",
        config.queues.len(),
        opts.config.display()
    );

    let env = FactoryEnv {
        cache: Arc::new(StatusCache::new()),
        registry: Arc::new(build_registry(&config)),
        counters: Arc::new(FactoryCounters::default()),
        settings: settings.clone(),
        shutdown: CancellationToken::new(),
    };
    let config_source = Arc::new(
        FileConfigSource::new(&opts.config)
            .with_sleep_override(opts.sleep)
            .with_max_cycles_override(opts.cycles),
    );
    let reconfig_interval = opts.reconfig_interval.unwrap_or(settings.reconfig_interval);

    let (service, process) = create_factory_service(env, config_source, reconfig_interval);

    let mut hangup = signal(SignalKind::hangup())?;
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::pin!(process);
    loop {
        tokio::select! {
            _ = &mut process => break,
            _ = tokio::signal::ctrl_c() => {
                log::info!("Received interrupt, shutting down");
                service.quit();
            }
            _ = terminate.recv() => {
                log::info!("Received SIGTERM, shutting down");
                service.quit();
            }
            _ = hangup.recv() => {
                log::info!("Received SIGHUP, reloading configuration");
                service.trigger_reconfigure();
            }
        }
    }
    log::info!("Pilot factory stopped");
    Ok(())
}

/// Registers dry-run collaborators for every identifier the configuration
/// mentions. Real deployments embed the library instead and register their
/// site-specific endpoint implementations here.
fn build_registry(config: &FactoryConfig) -> EndpointRegistry {
    let mut registry = EndpointRegistry::default();
    for queue in &config.queues {
        registry.register_batch(Arc::new(IdleBatchEndpoint::new(&queue.batch_source)));
        registry.register_wms(Arc::new(IdleWmsEndpoint::new(&queue.wms_source)));
        registry.register_submission(&queue.submission, Arc::new(DryRunBackend::default()));
        for monitor in &queue.monitors {
            registry.register_monitor(monitor, Arc::new(LoggingMonitor));
        }
        if let Some(history) = &queue.history {
            registry.register_history(history, Arc::new(EmptyHistory));
        }
    }
    registry
}
