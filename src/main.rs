use std::sync::Arc;

use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod ledger;
mod models;
mod services;
mod store;

#[cfg(test)]
mod testutil;

use crate::config::AppConfig;
use crate::ledger::{HttpLedgerClient, LedgerClient, OfflineLedgerClient};
use crate::services::matching::MatchingEngine;
use crate::services::orders::OrderService;
use crate::services::projections::{LedgerEvent, ProjectionRunner};
use crate::services::reconciliation::Reconciler;
use crate::services::settlement::SettlementEngine;
use crate::store::Database;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pebble_backend=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();
    let config = AppConfig::load()?;

    tracing::info!("Starting Pebble trading core v{}", env!("CARGO_PKG_VERSION"));

    let db = Database::connect(&config.database_url).await?;
    db.migrate().await?;
    let repos = db.repositories();
    tracing::info!("Database connected");

    let ledger: Arc<dyn LedgerClient> = if config.ledger_offline {
        tracing::warn!("Ledger is OFFLINE: all ledger calls return synthetic results");
        Arc::new(OfflineLedgerClient)
    } else {
        tracing::info!("Ledger JSON API at {}", config.ledger_api_url);
        Arc::new(HttpLedgerClient::new(&config.ledger_api_url))
    };

    // Matching engine, rehydrated from orders that still rest on the book or
    // still carry unsettled trades.
    let engine = Arc::new(MatchingEngine::new());
    let resting = repos.orders.resting_orders().await?;
    let unsettled = repos.orders.orders_with_unsettled_trades().await?;
    let restored = engine.rehydrate(&resting) + engine.rehydrate(&unsettled);
    if restored > 0 {
        tracing::info!("Recovered {restored} resting orders to the book");
    } else {
        tracing::info!("No open orders to recover");
    }

    // The RPC surface that drives order placement lives outside the core;
    // constructing the service here exercises the full saga wiring at boot.
    let _order_service = Arc::new(OrderService::new(
        config.order.clone(),
        repos.clone(),
        ledger.clone(),
        engine.clone(),
    ));
    tracing::info!("Order service initialized");

    // Settlement engine: recovery then the batching loop.
    let settlement = SettlementEngine::new(config.settlement.clone(), repos.clone(), ledger.clone());
    settlement.start().await?;
    tracing::info!(
        "Settlement engine started (interval {}ms, batch size {})",
        config.settlement.batch_interval_ms,
        config.settlement.max_batch_size
    );

    // Projection runner fed by the ledger event stream. The transport that
    // fills this channel lives outside the trading core.
    let (event_sender, event_receiver) = mpsc::channel::<LedgerEvent>(1024);
    let projection_handle =
        ProjectionRunner::new(repos.accounts.clone(), repos.positions.clone())
            .spawn(event_receiver);
    tracing::info!("Projection runner started");

    let reconciler = Reconciler::new(config.reconciliation.clone(), repos.clone(), ledger.clone());
    reconciler.start().await;
    tracing::info!(
        "Reconciler started (interval {}ms, stale threshold {}min)",
        config.reconciliation.interval_ms,
        config.reconciliation.stale_threshold_minutes
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received, draining");

    drop(event_sender);
    settlement.shutdown().await;
    reconciler.shutdown().await;
    let _ = projection_handle.await;

    tracing::info!("Shutdown complete");
    Ok(())
}
