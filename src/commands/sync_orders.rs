use crate::alpaca::AlpacaClient;
use crate::config::EngineRuntimeSettings;
use crate::context::AppContext;
use crate::reconciler::Reconciler;
use crate::retry::retry_db_operation;
use anyhow::{Context, Result};
use log::info;
use std::time::Duration;

/// One-shot pull reconciliation of all non-terminal orders against the
/// broker, followed by a derivation refresh for every strategy that gained
/// fills.
pub async fn run(app: &AppContext) -> Result<()> {
    let db = app.database().await?;
    let settings_map = db.get_all_settings().await?;
    let settings = EngineRuntimeSettings::from_settings_map(&settings_map)?;

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(settings.broker_request_timeout_secs))
        .build()
        .context("failed to construct HTTP client")?;
    let alpaca = AlpacaClient::new(&http, &settings.broker_credentials(), &settings_map)?;

    let reconciler = Reconciler::new(db);
    let stats = retry_db_operation!(
        "order pull sync",
        reconciler.pull_sync(&alpaca, settings.order_sync_lookback_days)
    )?;

    let refreshed = reconciler.refresh_dirty_derivations().await?;
    info!(
        "Sync complete: {} applied, {} stale, {} conflicts; refreshed {} strategy derivation{}",
        stats.applied,
        stats.stale,
        stats.conflicts,
        refreshed,
        if refreshed == 1 { "" } else { "s" }
    );

    Ok(())
}
