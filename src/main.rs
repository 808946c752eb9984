//! Funding-rate arbitrage keeper binary: wires the component graph, runs
//! startup reconciliation, spawns the scheduler's loops, and serves the
//! diagnostics HTTP surface until shutdown.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use funding_keeper::cache::MarketStateCache;
use funding_keeper::circuit_breaker::CircuitBreaker;
use funding_keeper::config::Config;
use funding_keeper::domain::Venue;
use funding_keeper::evaluator::OpportunityEvaluator;
use funding_keeper::executor::OrderExecutor;
use funding_keeper::guardian::Guardian;
use funding_keeper::lock_registry::ExecutionLockRegistry;
use funding_keeper::orchestrator::Orchestrator;
use funding_keeper::performance::PerformanceLogger;
use funding_keeper::position_store::PositionStateStore;
use funding_keeper::prediction::NaivePredictionService;
use funding_keeper::reconciler::Reconciler;
use funding_keeper::scheduler::Scheduler;
use funding_keeper::venue::mock::MockVenueAdapter;
use funding_keeper::venue::VenueAdapter;

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_env("KEEPER_LOG").unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Real per-venue REST/WebSocket adapters are an external collaborator (see
/// `venue::VenueAdapter`'s doc comment). Until one is wired in, every venue
/// is backed by the in-memory mock so the keeper's own logic runs end to
/// end against deterministic, operator-controlled prices and funding rates.
fn build_adapters() -> HashMap<Venue, Arc<dyn VenueAdapter>> {
    let mut adapters: HashMap<Venue, Arc<dyn VenueAdapter>> = HashMap::new();
    adapters.insert(Venue::Hl, Arc::new(MockVenueAdapter::new(Venue::Hl)));
    adapters.insert(Venue::L, Arc::new(MockVenueAdapter::new(Venue::L)));
    adapters.insert(Venue::A, Arc::new(MockVenueAdapter::new(Venue::A)));
    adapters
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = Config::from_env().context("loading configuration")?;
    info!(symbols = ?config.keeper_symbols, "starting funding-rate keeper");

    let adapters = build_adapters();
    let adapter_list: Vec<Arc<dyn VenueAdapter>> = adapters.values().cloned().collect();

    let registry = Arc::new(ExecutionLockRegistry::new());
    let cache = Arc::new(MarketStateCache::new(adapter_list));
    let store = Arc::new(
        PositionStateStore::open(&config.position_state_dir)
            .await
            .context("opening position state store")?,
    );
    let evaluator = Arc::new(OpportunityEvaluator::new(config.clone()));
    let executor = Arc::new(OrderExecutor::new(Arc::clone(&registry), adapters.clone(), &config));
    let performance = Arc::new(
        PerformanceLogger::open(&format!("{}/performance.sqlite3", config.position_state_dir))
            .context("opening performance ledger")?,
    );
    let prediction = Arc::new(NaivePredictionService);
    let reconciler = Arc::new(Reconciler::new(
        Arc::clone(&registry),
        Arc::clone(&cache),
        Arc::clone(&store),
        adapters.clone(),
        Arc::clone(&executor),
        Arc::clone(&evaluator),
        Arc::clone(&performance),
        Arc::clone(&prediction),
        config.clone(),
    ));
    let guardian = Arc::new(Guardian::new(
        Arc::clone(&registry),
        adapters.clone(),
        Arc::clone(&executor),
        Arc::clone(&cache),
        Arc::clone(&reconciler),
        &config,
    ));
    let circuit_breaker = Arc::new(CircuitBreaker::new(&config));

    let orchestrator = Arc::new(Orchestrator {
        registry: Arc::clone(&registry),
        cache,
        store,
        adapters,
        executor,
        evaluator,
        guardian,
        reconciler,
        performance,
        circuit_breaker,
        prediction,
        config: config.clone(),
    });

    orchestrator.run_startup_sequence().await.context("startup reconciliation")?;

    let scheduler = Scheduler::new(Arc::clone(&orchestrator), registry);
    let _loop_handles = scheduler.spawn_all();

    let app = funding_keeper::api::build_router(orchestrator);
    let listener = TcpListener::bind(("0.0.0.0", config.http_port))
        .await
        .with_context(|| format!("binding diagnostics HTTP port {}", config.http_port))?;
    info!(port = config.http_port, "diagnostics HTTP surface listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving diagnostics HTTP surface")?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received, draining in-flight work");
}
