use crate::alpaca::AlpacaClient;
use crate::config::EngineRuntimeSettings;
use crate::context::AppContext;
use crate::reconciler::Reconciler;
use crate::server::{self, ServerState};
use crate::stream::{run_trade_updates_stream, StreamConfig};
use anyhow::{Context, Result};
use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const STREAM_CHANNEL_CAPACITY: usize = 256;

/// Runs the engine: the webhook server, the broker trade-updates stream and
/// the periodic pull sync, until interrupted. Ingestion and derivation
/// refresh run on separate tasks so a slow report or rebuild never blocks
/// order submission.
pub async fn run(app: &AppContext) -> Result<()> {
    let db = app.database().await?;
    db.init_schema().await?;
    let settings_map = db.get_all_settings().await?;
    let settings = Arc::new(EngineRuntimeSettings::from_settings_map(&settings_map)?);
    let settings_map = Arc::new(settings_map);
    drop(db);

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(settings.broker_request_timeout_secs))
        .build()
        .context("failed to construct HTTP client")?;

    let reconciler = Arc::new(Reconciler::new(app.database().await?));

    let (tx, mut rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
    match settings.stream_url.clone() {
        Some(url) => {
            let config = StreamConfig {
                url,
                api_key: settings.broker_api_key.clone(),
                api_secret: settings.broker_api_secret.clone(),
            };
            tokio::spawn(async move {
                if let Err(err) = run_trade_updates_stream(config, tx).await {
                    warn!("Trade updates stream stopped: {}", err);
                }
            });
        }
        None => {
            drop(tx);
            info!("No ALPACA_STREAM_URL configured; relying on pull sync alone");
        }
    }

    // Push events from the stream.
    {
        let reconciler = Arc::clone(&reconciler);
        tokio::spawn(async move {
            while let Some(update) = rx.recv().await {
                if let Err(err) = reconciler.ingest(&update).await {
                    warn!(
                        "Failed to ingest stream update for broker order {}: {}",
                        update.broker_order_id, err
                    );
                }
            }
        });
    }

    // Periodic pull sync plus derivation refresh for changed strategies.
    {
        let reconciler = Arc::clone(&reconciler);
        let settings = Arc::clone(&settings);
        let settings_map = Arc::clone(&settings_map);
        let http = http.clone();
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_secs(settings.order_sync_interval_secs));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match AlpacaClient::new(&http, &settings.broker_credentials(), &settings_map) {
                    Ok(alpaca) => {
                        if let Err(err) = reconciler
                            .pull_sync(&alpaca, settings.order_sync_lookback_days)
                            .await
                        {
                            warn!("Pull sync failed: {}", err);
                        }
                    }
                    Err(err) => {
                        warn!("Broker client unavailable for pull sync: {}", err);
                    }
                }
                if let Err(err) = reconciler.refresh_dirty_derivations().await {
                    warn!("Derivation refresh failed: {}", err);
                }
            }
        });
    }

    let state = ServerState {
        app: app.clone(),
        settings,
        settings_map,
        http,
    };
    server::serve(state).await
}
