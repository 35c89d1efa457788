use crate::alpaca::AlpacaClient;
use crate::database::{Database, ReconcileOutcome};
use crate::error::EngineError;
use crate::models::OrderUpdate;
use crate::positions;
use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use log::{info, warn};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Counters for one pull-sync round.
#[derive(Debug, Default)]
pub struct SyncStats {
    pub applied: usize,
    pub stale: usize,
    pub conflicts: usize,
    pub unknown: usize,
    pub errors: usize,
}

/// Owns the order state machine. Broker updates from the push stream and
/// the pull sync both land in `ingest`, which serializes per trade id
/// in-process and per row in the store, so two concurrent events for the
/// same order can never interleave their read-modify-write of filled_qty.
pub struct Reconciler {
    db: Mutex<Database>,
    trade_locks: DashMap<String, Arc<Mutex<()>>>,
    /// Strategies whose fill ledger changed since the last derivation
    /// refresh. Derived state is rebuildable, so this is just a cache
    /// invalidation set.
    dirty_strategies: DashMap<String, ()>,
}

impl Reconciler {
    pub fn new(db: Database) -> Self {
        Self {
            db: Mutex::new(db),
            trade_locks: DashMap::new(),
            dirty_strategies: DashMap::new(),
        }
    }

    /// Applies one broker update. Regressions keep local state and are
    /// logged as reconciliation conflicts; unknown orders (manual trades,
    /// other systems) are skipped.
    pub async fn ingest(&self, update: &OrderUpdate) -> Result<ReconcileOutcome> {
        let lock_key = update
            .trade_id
            .clone()
            .unwrap_or_else(|| update.broker_order_id.clone());
        let lock = self
            .trade_locks
            .entry(lock_key)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        let outcome = {
            let mut db = self.db.lock().await;
            db.reconcile_order_update(update).await?
        };

        match &outcome {
            ReconcileOutcome::Applied { order, new_fill } => {
                if let Some(fill) = new_fill {
                    info!(
                        "Recorded fill of {} {} @ {} for trade {} ({})",
                        fill.qty,
                        fill.symbol,
                        fill.price,
                        fill.trade_id,
                        order.status.as_str()
                    );
                    self.dirty_strategies.insert(order.strategy_id.clone(), ());
                } else {
                    info!(
                        "Order {} advanced to {}",
                        order.trade_id,
                        order.status.as_str()
                    );
                }
            }
            ReconcileOutcome::Stale => {}
            ReconcileOutcome::Conflict { trade_id, detail } => {
                let conflict = EngineError::ReconciliationConflict {
                    trade_id: trade_id.clone(),
                    detail: detail.clone(),
                };
                warn!("{} (keeping local state)", conflict);
                let db = self.db.lock().await;
                if let Err(err) = db
                    .insert_system_log(
                        "reconciler",
                        "warn",
                        &conflict.to_string(),
                        Some(json!({ "tradeId": trade_id, "detail": detail })),
                    )
                    .await
                {
                    warn!("Failed to persist conflict log: {}", err);
                }
            }
            ReconcileOutcome::UnknownOrder => {
                warn!(
                    "Ignoring broker update for unknown order {} (client id {:?})",
                    update.broker_order_id, update.trade_id
                );
            }
        }

        Ok(outcome)
    }

    /// Pull reconciliation: asks the broker for every order in the lookback
    /// window and merges each one, then chases local orders still waiting
    /// for an acknowledgment by their client order id. Closes every gap a
    /// missed push event can leave.
    pub async fn pull_sync(
        &self,
        alpaca: &AlpacaClient<'_>,
        lookback_days: i64,
    ) -> Result<SyncStats> {
        let mut stats = SyncStats::default();
        let after = Utc::now() - ChronoDuration::days(lookback_days.max(1));

        let broker_orders = alpaca.fetch_orders_since(after).await?;
        let mut updates = Vec::with_capacity(broker_orders.len());
        for order in &broker_orders {
            match order.to_update() {
                Ok(update) => updates.push(update),
                Err(err) => {
                    stats.errors += 1;
                    warn!("Skipping unparseable broker order: {}", err);
                }
            }
        }

        for update in &updates {
            self.apply_counted(update, &mut stats).await;
        }

        // Orders submitted but never acknowledged (e.g. a timeout mid
        // submission): the broker may still know them under our client
        // order id.
        let pending = {
            let db = self.db.lock().await;
            db.get_open_orders().await?
        };
        let synced: std::collections::HashSet<String> = updates
            .iter()
            .filter_map(|u| u.trade_id.clone())
            .collect();
        for order in pending {
            if synced.contains(&order.trade_id) {
                continue;
            }
            let lookup = match order.broker_order_id.as_deref() {
                Some(broker_id) => alpaca.fetch_order(broker_id).await,
                None => alpaca.fetch_order_by_client_id(&order.trade_id).await,
            };
            match lookup {
                Ok(Some(broker_order)) => match broker_order.to_update() {
                    Ok(mut update) => {
                        update.trade_id.get_or_insert_with(|| order.trade_id.clone());
                        self.apply_counted(&update, &mut stats).await;
                    }
                    Err(err) => {
                        stats.errors += 1;
                        warn!(
                            "Skipping unparseable broker order for trade {}: {}",
                            order.trade_id, err
                        );
                    }
                },
                Ok(None) => {}
                Err(err) => {
                    stats.errors += 1;
                    warn!("Failed to look up trade {}: {}", order.trade_id, err);
                }
            }
        }

        info!(
            "Pull sync applied {} update{} ({} stale, {} conflicts, {} unknown, {} errors)",
            stats.applied,
            if stats.applied == 1 { "" } else { "s" },
            stats.stale,
            stats.conflicts,
            stats.unknown,
            stats.errors
        );

        Ok(stats)
    }

    async fn apply_counted(&self, update: &OrderUpdate, stats: &mut SyncStats) {
        match self.ingest(update).await {
            Ok(ReconcileOutcome::Applied { .. }) => stats.applied += 1,
            Ok(ReconcileOutcome::Stale) => stats.stale += 1,
            Ok(ReconcileOutcome::Conflict { .. }) => stats.conflicts += 1,
            Ok(ReconcileOutcome::UnknownOrder) => stats.unknown += 1,
            Err(err) => {
                stats.errors += 1;
                warn!(
                    "Failed to reconcile update for broker order {}: {}",
                    update.broker_order_id, err
                );
            }
        }
    }

    /// Rebuilds the derived tables for every strategy whose ledger changed
    /// since the last refresh. Runs as background work so a slow report
    /// never blocks ingestion.
    pub async fn refresh_dirty_derivations(&self) -> Result<usize> {
        let dirty: Vec<String> = self
            .dirty_strategies
            .iter()
            .map(|entry| entry.key().clone())
            .collect();

        for strategy_id in &dirty {
            self.refresh_strategy_derivation(strategy_id).await?;
            self.dirty_strategies.remove(strategy_id);
        }

        Ok(dirty.len())
    }

    /// Replays the full fill ledger for one strategy and rewrites its
    /// derived positions and round trips.
    pub async fn refresh_strategy_derivation(&self, strategy_id: &str) -> Result<()> {
        let mut db = self.db.lock().await;
        let fills = db.get_fills_for_strategy(strategy_id).await?;
        let (positions, round_trips) = positions::replay_strategy(strategy_id, &fills);
        db.replace_strategy_derivation(strategy_id, &positions, &round_trips)
            .await?;
        info!(
            "Refreshed derivation for strategy {}: {} position(s), {} round trip(s)",
            strategy_id,
            positions.len(),
            round_trips.len()
        );
        Ok(())
    }
}
