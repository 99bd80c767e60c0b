#![allow(clippy::manual_unwrap_or_default)]
#![allow(clippy::manual_unwrap_or)]
use thinkwire::cancel::CancelSource;
use thinkwire::db::init_db;
use thinkwire::hardening::{CircuitBreaker, RetryPolicy};
use thinkwire::store::SqliteStore;
use thinkwire::upstream::HttpUpstream;
use thinkwire::*;

use clap::Parser;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let args = Arc::new(Args::parse());

    let _guard = thinkwire::logging::init_tracing(&args.log_dir, "thinkwire.log");
    thinkwire::logging::setup_panic_hook();

    let db = match init_db(&args.database).await {
        Ok(pool) => pool,
        Err(e) => {
            eprintln!("Failed to initialize database: {}", e);
            std::process::exit(1);
        }
    };

    let api_key = match std::env::var("UPSTREAM_API_KEY") {
        Ok(k) if !k.is_empty() => k,
        _ => {
            eprintln!("Error: UPSTREAM_API_KEY environment variable is missing or empty.");
            eprintln!("Please set it in your .env file or environment.");
            std::process::exit(1);
        }
    };

    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(args.request_timeout_secs))
        .connect_timeout(Duration::from_secs(args.connect_timeout_secs))
        .pool_idle_timeout(Duration::from_secs(90))
        .pool_max_idle_per_host(10)
        .tcp_keepalive(Some(Duration::from_secs(60)))
        .build()
    {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to build HTTP client: {}", e);
            std::process::exit(1);
        }
    };

    let health = Arc::new(UpstreamHealth::default());
    let upstream = HttpUpstream::new(
        client,
        args.upstream_url.clone(),
        api_key,
        args.channel_map(),
        args.default_max_tokens,
        RetryPolicy::new(args.max_retries, 500),
        CircuitBreaker::new(args.circuit_breaker_threshold, Duration::from_secs(30)),
        health.clone(),
    );
    let store = SqliteStore::new(db);

    let state = Arc::new(AppState::new(
        Arc::new(upstream),
        Arc::new(store),
        args.clone(),
        health,
    ));
    let app = thinkwire::handlers::router(state.clone());

    let addr = format!("{}:{}", args.host, args.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!("Failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    tracing::info!(
        "Thinkwire listening on {} (upstream {}, channels {:?})",
        addr,
        args.upstream_url,
        args.channel_map()
    );

    let shutdown_turns = state.turns.clone();
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for shutdown signal: {}", e);
            return;
        }
        let cancelled = shutdown_turns.cancel_all(CancelSource::Shutdown);
        tracing::info!("Shutdown requested; cancelled {} active turns", cancelled);
    });

    if let Err(e) = server.await {
        tracing::error!("Server error: {}", e);
        std::process::exit(1);
    }
}
