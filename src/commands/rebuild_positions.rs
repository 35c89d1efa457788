use crate::context::AppContext;
use crate::models::{Fill, Position, RoundTrip};
use crate::positions::replay_strategy;
use anyhow::{Context, Result};
use log::info;
use rayon::prelude::*;

/// Rebuilds every derived position and round trip from the full fill
/// ledger. Pairs are independent units of derivation, so strategies replay
/// in parallel; writes stay transactional per strategy.
pub async fn run(app: &AppContext) -> Result<()> {
    let mut db = app.database().await?;
    let strategy_ids = db.get_strategy_ids_with_fills().await?;
    if strategy_ids.is_empty() {
        info!("No fills recorded; nothing to rebuild");
        return Ok(());
    }

    let mut ledgers: Vec<(String, Vec<Fill>)> = Vec::with_capacity(strategy_ids.len());
    for strategy_id in &strategy_ids {
        let fills = db.get_fills_for_strategy(strategy_id).await?;
        ledgers.push((strategy_id.clone(), fills));
    }

    let cpu_budget = num_cpus::get().saturating_sub(1).max(1);
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(cpu_budget)
        .build()
        .context("failed to build replay thread pool")?;

    let derived: Vec<(String, Vec<Position>, Vec<RoundTrip>)> =
        tokio::task::spawn_blocking(move || {
            pool.install(|| {
                ledgers
                    .par_iter()
                    .map(|(strategy_id, fills)| {
                        let (positions, round_trips) = replay_strategy(strategy_id, fills);
                        (strategy_id.clone(), positions, round_trips)
                    })
                    .collect()
            })
        })
        .await
        .context("replay worker panicked")?;

    let mut total_positions = 0usize;
    let mut total_trips = 0usize;
    for (strategy_id, positions, round_trips) in &derived {
        db.replace_strategy_derivation(strategy_id, positions, round_trips)
            .await?;
        total_positions += positions.len();
        total_trips += round_trips.len();
    }

    info!(
        "Rebuilt {} position(s) and {} round trip(s) across {} strateg{}",
        total_positions,
        total_trips,
        derived.len(),
        if derived.len() == 1 { "y" } else { "ies" }
    );

    Ok(())
}
