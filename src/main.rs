// Prediction Settlement Engine - Main Entry Point
// LMSR trading, resolution, settlement and withdrawals behind one HTTP API

use std::sync::Arc;

use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::EnvFilter;

use prediction_settlement_engine::app_state::{AppState, SharedState};
use prediction_settlement_engine::config::EngineConfig;
use prediction_settlement_engine::events::spawn_notifier;
use prediction_settlement_engine::handlers::router;
use prediction_settlement_engine::settlement::spawn_settlement_dispatcher;
use prediction_settlement_engine::solvency::spawn_monitor;
use prediction_settlement_engine::withdrawals::WithdrawalWorker;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    println!("\n═══════════════════════════════════════════════");
    println!("     🎲 Prediction Market Settlement Engine");
    println!("═══════════════════════════════════════════════\n");

    let config = EngineConfig::from_env();
    config.fees.validate()?;
    let bind_addr = config.bind_addr.clone();

    // Initialize application state
    let state: SharedState = Arc::new(AppState::new(config));
    if std::env::var("ENGINE_SEED_DEMO").map(|v| v != "0" && v != "false").unwrap_or(true) {
        state.seed_demo()?;
    }

    // ===== BACKGROUND TASKS =====
    let notifier = spawn_notifier(state.store.events(), state.activity.clone());
    let dispatcher = spawn_settlement_dispatcher(Arc::clone(&state.store), state.config.transaction_retry);
    let monitor = spawn_monitor(Arc::clone(&state.store), Arc::clone(&state.config));
    let worker = Arc::new(WithdrawalWorker::new(
        Arc::clone(&state.store),
        Arc::clone(&state.queue),
        Arc::clone(&state.provider),
        Arc::clone(&state.config),
    ));
    let worker = tokio::spawn(worker.run());
    println!("🔄 Settlement dispatcher, solvency monitor and withdrawal worker started");

    let app = router(state.clone()).layer(
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any),
    );

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;

    println!("\n╔════════════════════════════════════════════╗");
    println!("║   🚀 SERVER RUNNING                        ║");
    println!("╚════════════════════════════════════════════╝");
    println!("   📡 http://{}\n", bind_addr);

    println!("📋 Available Endpoints:");
    println!("   GET  /markets/:id                          - Market and options");
    println!("   POST /markets/:id/trade                    - Buy or sell shares");
    println!("   POST /markets/:id/resolve                  - Submit a resolution");
    println!("   POST /markets/:id/submissions/:sid/approve - Admin approval");
    println!("   GET  /markets/:id/disputes                 - Pending disputes");
    println!("   POST /markets/:id/disputes                 - File a dispute");
    println!("   POST /disputes/:id/adjudicate              - Admin ruling");
    println!("   POST /options/:id/claim                    - Claim skipped winnings");
    println!("   GET  /markets/:id/solvency                 - Reserve check");
    println!("   POST /withdrawals                          - Request a withdrawal");
    println!("   GET  /withdrawals/:id                      - Withdrawal status");
    println!("   GET  /health                               - Health check\n");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to install CTRL+C handler");
            }
            println!("\n\n🛑 Shutdown signal received...");
        })
        .await?;

    worker.abort();
    monitor.abort();
    dispatcher.abort();
    notifier.abort();
    println!("👋 Goodbye!\n");
    Ok(())
}
