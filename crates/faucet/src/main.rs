//! Faucet service binary

use clap::Parser;
use quota_common::utils::logging::init_logging;
use quota_faucet::api::{router, AppState};
use quota_faucet::{
    FaucetConfig, FaucetMetrics, GrantAuthorizer, InMemoryLedger, Ledger, LimitLedger, QuotaEngine,
    RpcLedger,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

/// Faucet service CLI
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Server address
    #[arg(long)]
    server_addr: Option<String>,

    /// Limit ledger database path
    #[arg(long)]
    db_path: Option<String>,

    /// Remote ledger RPC URL
    #[arg(long)]
    ledger_rpc_url: Option<String>,

    /// Admin key (repeatable)
    #[arg(long = "admin-key")]
    admin_keys: Vec<String>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = FaucetConfig::load(args.config.as_ref())?;

    // Override with CLI arguments
    if let Some(addr) = args.server_addr {
        config.server_addr = addr;
    }

    if let Some(db_path) = args.db_path {
        config.db_path = db_path;
    }

    if let Some(rpc_url) = args.ledger_rpc_url {
        config.ledger_rpc_url = Some(rpc_url);
    }

    if !args.admin_keys.is_empty() {
        config.admin_keys = args.admin_keys;
    }

    if args.debug {
        config.logging.level = "debug".to_string();
    }

    init_logging(&config.logging).map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    info!("Starting Quota Faucet Service v{}", env!("CARGO_PKG_VERSION"));

    config.validate()?;
    let faucet_account = config.faucet_account()?;
    let admin_keyset = config.admin_keyset()?;

    info!("Configuration:");
    info!("  Server address: {}", config.server_addr);
    info!("  Faucet account: {}", faucet_account);
    info!("  Default request limit: {}", config.default_request_limit);
    info!("  Default account limit: {}", config.default_account_limit);
    info!("  Return policy: {:?}", config.return_policy);
    info!("  Rate limit: {} requests / minute", config.max_requests_per_minute);

    // Initialize limit ledger
    let limits = Arc::new(LimitLedger::open(&config.db_path, config.global_policy())?);
    let policy = limits.policy();
    if policy != config.global_policy() {
        warn!(
            "Using persisted default limits (request {}, account {}) over configured ones",
            policy.default_request_limit, policy.default_account_limit
        );
    }

    let stats = limits.statistics()?;
    info!("Previous statistics:");
    info!("  Accounts: {}", stats.accounts);
    info!("  Total disbursed: {}", stats.total_disbursed);
    info!("  Total returned: {}", stats.total_returned);

    // External ledger
    let ledger: Arc<dyn Ledger> = match &config.ledger_rpc_url {
        Some(url) => {
            info!("  Ledger RPC: {}", url);
            Arc::new(RpcLedger::new(url.clone()))
        }
        None => {
            warn!(
                "No ledger RPC configured; using in-memory ledger with faucet balance {}",
                config.initial_faucet_balance
            );
            Arc::new(InMemoryLedger::with_account(
                faucet_account.clone(),
                admin_keyset.clone(),
                config.initial_faucet_balance,
            ))
        }
    };

    let engine = Arc::new(QuotaEngine::new(
        faucet_account,
        limits.clone(),
        ledger,
        Arc::new(GrantAuthorizer::new(admin_keyset)),
        config.return_policy,
        Arc::new(FaucetMetrics::new()?),
    ));
    info!("Quota engine initialized");

    let mut app = router(AppState::new(
        engine,
        config.max_requests_per_minute,
        config.metrics_enabled,
    ));

    // Add CORS if enabled
    if config.cors_enabled {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        app = app.layer(cors);
        info!("CORS enabled");
    }

    // Start server
    let addr: SocketAddr = config.server_addr.parse()?;
    info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    limits.flush().await?;
    info!("Shutting down gracefully");
    Ok(())
}

/// Graceful shutdown signal
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C");
        },
        _ = terminate => {
            info!("Received terminate signal");
        },
    }
}
