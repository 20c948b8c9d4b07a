use anyhow::{bail, Context};
use clap::Parser;
use harvester::collectors::{Collector, CollectorRegistry, HttpCollector, ProcessCollector, PROCESS_COLLECTOR};
use harvester::config::AppConfig;
use harvester::health::{
    BasicCheck, ConfigCheck, ConnectivityCheck, HealthAggregator, HealthStatus, RegistryCheck, SchedulerCheck,
};
use harvester::resilience::CircuitBreaker;
use harvester::scheduler::Scheduler;
use harvester::{RegistryError, SERVICE_NAME, VERSION};
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Name of the HTTP probe collector section
const HTTP_COLLECTOR: &str = "http";

/// How long shutdown waits for running jobs
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

/// Command-line arguments for the metrics agent
#[derive(Parser)]
#[command(
    name = "harvester",
    version,
    about = "Metrics agent - schedules collectors with retries, circuit breakers and health reporting",
    long_about = "Runs a set of metric collectors against their targets on fixed intervals, \
                  retrying transient failures with backoff, protecting failing dependencies with \
                  circuit breakers and reporting the aggregated health of the agent."
)]
struct Cli {
    /// Path to configuration file
    #[arg(
        short,
        long,
        value_name = "FILE",
        help = "Configuration file path (TOML format)"
    )]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(
        short,
        long,
        help = "Enable verbose logging output (sets RUST_LOG=debug)"
    )]
    verbose: bool,

    /// Only validate the configuration
    #[arg(long, help = "Validate the configuration and exit")]
    validate: bool,
}

impl Cli {
    /// Reject a configuration path that exists but is not a regular file
    ///
    /// Missing files are fine; the defaults are used instead.
    fn check_config_path(&self) -> anyhow::Result<()> {
        if let Some(path) = &self.config {
            if path.exists() && !path.is_file() {
                bail!("Configuration path is not a file: {}", path.display());
            }
        }
        Ok(())
    }
}

/// The running agent: collectors, scheduler and health reporting
struct Agent {
    config: AppConfig,
    registry: Arc<CollectorRegistry>,
    scheduler: Scheduler,
    health: HealthAggregator,
    token: CancellationToken,
}

impl Agent {
    /// Build every component from the configuration
    ///
    /// Collector sections with an unknown name are skipped with a warning.
    fn new(config: AppConfig) -> anyhow::Result<Self> {
        let registry = Arc::new(CollectorRegistry::new());
        for (name, _) in config.enabled_collectors() {
            match build_collector(&config, name)? {
                Some(collector) => registry
                    .register(collector)
                    .with_context(|| format!("Failed to register collector {}", name))?,
                None => warn!("Unknown collector '{}' in configuration, skipping", name),
            }
        }

        let scheduler = Scheduler::new(config.scheduler_config(), Arc::clone(&registry));
        let health =
            HealthAggregator::new(config.service.name.as_str(), VERSION).with_check_timeout(config.check_timeout());

        health.register_check(Arc::new(BasicCheck::new(config.service.name.as_str(), VERSION)));
        health.register_check(Arc::new(SchedulerCheck::new(scheduler.clone())));
        health.register_check(Arc::new(RegistryCheck::new(Arc::clone(&registry))));
        health.register_check(Arc::new(ConfigCheck::new(config.issues())));
        if !config.health.endpoints.is_empty() {
            let connectivity = ConnectivityCheck::new(config.health.endpoints.clone(), config.check_timeout())
                .context("Failed to create connectivity check")?;
            health.register_check(Arc::new(connectivity));
        }

        Ok(Self {
            config,
            registry,
            scheduler,
            health,
            token: CancellationToken::new(),
        })
    }

    /// Start collectors, scheduler and health checks
    ///
    /// Collectors that fail to start are logged and left in their error
    /// state; their jobs are still scheduled and reported as failing.
    async fn start(&self) -> anyhow::Result<()> {
        match self.registry.start_all(&self.token).await {
            Ok(()) => {}
            Err(RegistryError::StartFailed(failures)) => {
                for (name, e) in failures {
                    error!("Collector {} failed to start: {}", name, e);
                }
            }
            Err(e) => return Err(e).context("Failed to start collectors"),
        }

        self.scheduler.start().context("Failed to start scheduler")?;

        for name in self.registry.names() {
            let Some(collector) = self.config.collector_config(&name) else {
                continue;
            };
            let ids = self
                .scheduler
                .schedule(&name, &collector.targets, collector.interval)
                .with_context(|| format!("Failed to schedule collector {}", name))?;
            info!("Collector {} scheduled as {} jobs", name, ids.len());
        }

        self.health
            .start(self.config.health_interval())
            .context("Failed to start health checks")?;
        Ok(())
    }

    /// Log the overall health periodically until `shutdown` is cancelled
    async fn run(&self, shutdown: &CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.health_interval());
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.log_health(),
            }
        }
    }

    fn log_health(&self) {
        let health = self.health.get_health();
        let scheduler = self.scheduler.status();
        let message = format!(
            "Health {}: {} (jobs: {}, active: {}, completed: {}, failed: {})",
            health.status,
            health.summary,
            scheduler.job_count,
            scheduler.active_jobs,
            scheduler.completed_jobs,
            scheduler.failed_jobs
        );
        match health.status {
            HealthStatus::Healthy => info!("{}", message),
            HealthStatus::Degraded | HealthStatus::Unknown => warn!("{}", message),
            HealthStatus::Unhealthy => error!("{}", message),
        }
    }

    /// Stop health checks, then the scheduler, then the collectors
    async fn stop(&self) {
        self.health.stop().await;

        if let Err(e) = self.scheduler.stop(SHUTDOWN_DEADLINE).await {
            error!("Scheduler did not stop cleanly: {}", e);
        }

        self.token.cancel();
        if let Err(e) = self.registry.stop_all(&CancellationToken::new()).await {
            error!("Error stopping collectors: {}", e);
        }
    }
}

/// Instantiate the collector configured under `name`
fn build_collector(config: &AppConfig, name: &str) -> anyhow::Result<Option<Arc<dyn Collector>>> {
    let Some(collector_config) = config.collector_config(name) else {
        return Ok(None);
    };
    let breaker = config
        .circuit_breaker_config()
        .map(|breaker_config| Arc::new(CircuitBreaker::new(name, breaker_config)));

    let collector: Arc<dyn Collector> = match name {
        PROCESS_COLLECTOR => {
            let collector = ProcessCollector::new(collector_config);
            match breaker {
                Some(breaker) => Arc::new(collector.with_circuit_breaker(breaker)),
                None => Arc::new(collector),
            }
        }
        HTTP_COLLECTOR => {
            let collector = HttpCollector::new(name, collector_config)
                .with_context(|| format!("Failed to create collector {}", name))?;
            match breaker {
                Some(breaker) => Arc::new(collector.with_circuit_breaker(breaker)),
                None => Arc::new(collector),
            }
        }
        _ => return Ok(None),
    };
    Ok(Some(collector))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        std::env::set_var("RUST_LOG", "debug");
    }
    env_logger::init();

    cli.check_config_path()?;

    let config = AppConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;
    for issue in config.issues() {
        warn!("Configuration issue: {}", issue);
    }

    if cli.validate {
        info!("Configuration is valid");
        return Ok(());
    }

    info!("Starting {} {} as '{}'", SERVICE_NAME, VERSION, config.service.name);
    let agent = Agent::new(config)?;
    agent.start().await?;

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    ctrlc::set_handler(move || {
        info!("Received interrupt signal (SIGINT), shutting down gracefully...");
        signal.cancel();
    })
    .context("Error setting SIGINT handler for graceful shutdown")?;

    info!("Agent is running. Press Ctrl+C to stop.");
    agent.run(&shutdown).await;

    agent.stop().await;
    info!("Agent shutdown complete");
    Ok(())
}
