//! rollout-router server binary
//!
//! Loads configuration, wires the routing engine, the legacy provider and
//! the canary controller, and serves the HTTP API until Ctrl-C.
//!
//! ## Environment Variables
//!
//! - `LOG_FORMAT=json` — structured JSON output (production)
//! - `RUST_LOG=info` — log level filter
//! - `ROUTER_API_KEY`, `BACKEND_ENDPOINT`, `BACKEND_API_KEY`, `ROUTER_REGION`,
//!   `DEPLOY_*` — override the matching config values

use clap::Parser;
use rollout_router::alerting::{AlertDispatcher, AlertSink, LogAlertSink, WebhookAlertSink};
use rollout_router::api::{self, AppState};
use rollout_router::config::{self, loader, BackendKind, ClassifierKind, RouterConfig};
use rollout_router::provider::{Executor, LegacyProvider, Provider};
use rollout_router::routing::{
    Classifier, DeploymentRegistry, HeuristicClassifier, ModelClassifier, PricingTable,
};
use rollout_router::{
    init_tracing, metrics, Coordinator, EchoBackend, HttpBackend, MetricsCollector, ModelBackend,
    ResilientClient, RollbackController, RoutingEngine, SharedCanaryState, TrafficSplitter,
};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// Classification-driven model router with automatic canary rollback
#[derive(Parser)]
#[command(name = "rollout-router")]
#[command(version)]
struct Cli {
    /// Configuration file path (defaults and environment only when absent)
    #[arg(short, long, value_name = "FILE", env = "ROUTER_CONFIG")]
    config: Option<PathBuf>,

    /// Print the configuration JSON schema and exit
    #[arg(long)]
    print_schema: bool,

    /// Load and validate the configuration, then exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.print_schema {
        match config::schema() {
            Ok(schema) => println!("{schema}"),
            Err(e) => {
                eprintln!("failed to render schema: {e}");
                process::exit(1);
            }
        }
        return;
    }

    let _ = init_tracing();

    let loaded = match &cli.config {
        Some(path) => loader::load_from_file(path),
        None => loader::load_from_env(),
    };
    let config = match loaded {
        Ok(config) => config,
        Err(e) => {
            error!("failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    if cli.check {
        info!("configuration is valid");
        return;
    }

    if let Err(e) = serve(config).await {
        error!("server failed: {}", e);
        process::exit(1);
    }
    info!("shutdown complete");
}

async fn serve(config: RouterConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    metrics::prometheus::init_metrics()?;

    info!(
        region = %config.routing.region,
        phase = %config.rollout.initial_phase,
        "starting rollout-router v{}",
        env!("CARGO_PKG_VERSION")
    );

    let backend: Arc<dyn ModelBackend> = match config.backend.kind {
        BackendKind::Http => Arc::new(
            HttpBackend::new(&config.backend.endpoint, &config.backend.api_key)
                .with_timeout(Duration::from_secs(config.backend.timeout_secs)),
        ),
        BackendKind::Echo => Arc::new(EchoBackend::new()),
    };

    let client = Arc::new(ResilientClient::new(
        Arc::clone(&backend),
        config.resilience.settings(),
    ));
    let pricing = Arc::new(PricingTable::new(&config.pricing.models));
    let executor = Executor::new(
        Arc::clone(&client),
        pricing,
        config.backend.completion_settings(),
    );

    let classifier: Arc<dyn Classifier> = match config.routing.classifier {
        ClassifierKind::Heuristic => Arc::new(HeuristicClassifier::new()),
        ClassifierKind::Model => Arc::new(ModelClassifier::new(
            Arc::clone(&backend),
            &config.routing.classifier_deployment,
        )),
    };
    let registry = Arc::new(DeploymentRegistry::new(
        &config.routing.region,
        &config.routing.effective_rules(),
    )?);

    let new_provider: Arc<dyn Provider> = Arc::new(RoutingEngine::new(
        classifier,
        registry,
        executor.clone(),
    ));
    let legacy_provider: Arc<dyn Provider> = Arc::new(LegacyProvider::new(
        config.routing.legacy_deployment(),
        &config.routing.region,
        executor,
    ));

    let state = Arc::new(SharedCanaryState::new(
        config.rollout.initial_phase,
        chrono::Utc::now(),
    ));
    let collector = MetricsCollector::with_window(config.rollout.metrics_window);

    let mut sinks: Vec<Arc<dyn AlertSink>> = vec![Arc::new(LogAlertSink)];
    if let Some(url) = &config.alerting.webhook_url {
        sinks.push(Arc::new(WebhookAlertSink::new(url)));
    }
    let alerts = Arc::new(AlertDispatcher::new(sinks, config.alerting.cooldown()));

    let controller = Arc::new(RollbackController::new(
        Arc::clone(&state),
        collector.clone(),
        alerts,
        config.controller_settings(),
    ));

    let coordinator = Arc::new(
        Coordinator::new(
            TrafficSplitter::new(state),
            new_provider,
            legacy_provider,
            collector,
        )
        .with_fallback(config.rollout.fallback_enabled),
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let monitor = Arc::clone(&controller).spawn_health_monitor(shutdown_rx);

    let app_state = Arc::new(AppState::new(
        coordinator,
        controller,
        client,
        &config.routing.region,
        &config.server.api_key,
    ));

    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("shutdown requested"),
            Err(e) => error!("failed to listen for Ctrl-C: {}", e),
        }
    };
    let served = api::run_until(&config.server, app_state, &shutdown_tx, ctrl_c).await;

    if let Err(e) = monitor.await {
        error!("health monitor task failed: {}", e);
    }
    served?;
    Ok(())
}
