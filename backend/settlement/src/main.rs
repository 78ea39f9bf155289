//! Slot settlement service entry point.
//!
//! Receives payment provider webhooks and admin approvals of manual payments,
//! and settles both through one engine: account activation with referral
//! payout, or slot purchases that advance a project's funding state. Ledger
//! state lives in SQLite.

mod api;
mod config;
mod db;
mod engine;
mod errors;
mod idempotency;
#[cfg(test)]
mod invariants;
mod manual;
mod models;
mod signature;
mod slots;
mod store;
mod webhook;

use std::sync::Arc;

use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use config::Config;
use db::SqliteStore;
use engine::SettlementEngine;
use signature::SignatureVerifier;
use store::LedgerStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise structured logging (RUST_LOG controls verbosity).
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // Load optional .env file (ignored if missing).
    let _ = dotenvy::dotenv();

    let config = Config::from_env().map_err(|e| anyhow::anyhow!("{e}"))?;

    // A bad webhook secret is fatal here rather than a 401 on every request.
    let signature = SignatureVerifier::new(config.webhook_secret.as_bytes())?;

    let pool = db::init_pool(&config.database_url).await?;
    let store: Arc<dyn LedgerStore> = Arc::new(SqliteStore::new(pool));

    let engine = SettlementEngine::new(store.clone(), config.settlement);
    info!(
        registration_fee = config.settlement.registration_fee,
        referral_bonus = config.settlement.referral_bonus,
        "Settlement engine ready"
    );

    let state = Arc::new(api::ApiState::new(
        store,
        engine,
        signature,
        &config.admin_api_token,
        config.settlement_timeout,
    ));

    let app = api::router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.api_port);
    info!("API listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
