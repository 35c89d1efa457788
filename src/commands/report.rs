use crate::context::AppContext;
use crate::performance::{PerformanceCalculator, StrategyReport};
use anyhow::{anyhow, Result};
use log::info;

/// Prints the aggregated performance report for one strategy (or all of
/// them) as JSON on stdout.
pub async fn run(app: &AppContext, strategy_id: Option<&str>) -> Result<()> {
    let db = app.database().await?;

    let strategies = match strategy_id {
        Some(id) => {
            let strategy = db
                .get_strategy(id)
                .await?
                .ok_or_else(|| anyhow!("strategy {} not found", id))?;
            vec![strategy]
        }
        None => db.get_strategies(false).await?,
    };

    if strategies.is_empty() {
        info!("No strategies recorded");
        return Ok(());
    }

    let mut reports = Vec::with_capacity(strategies.len());
    for strategy in strategies {
        let signals = db.get_signals_for_strategy(&strategy.id).await?;
        let positions = db.get_positions(Some(&strategy.id)).await?;
        let round_trips = db.get_round_trips(Some(&strategy.id)).await?;
        let performance = PerformanceCalculator::calculate_strategy(
            &strategy,
            &round_trips,
            &positions,
            &signals,
            None,
        );
        reports.push(StrategyReport {
            strategy,
            performance,
            positions,
            trades: round_trips,
        });
    }

    println!("{}", serde_json::to_string_pretty(&reports)?);
    Ok(())
}
