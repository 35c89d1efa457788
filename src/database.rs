use crate::models::*;
use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use log::{error, warn};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::str::FromStr;
use tokio_postgres::{Client, NoTls, Row};

const ENCRYPTION_PREFIX: &str = "enc:v1:";
const ENCRYPTION_IV_LENGTH: usize = 12;
const DATABASE_KEY_ENV_VAR: &str = "DATABASE_KEY";

/// What happened to a broker update after the per-order locked merge.
#[derive(Debug)]
pub enum ReconcileOutcome {
    /// The update advanced local state; `new_fill` is present when new
    /// quantity was executed.
    Applied { order: Order, new_fill: Option<Fill> },
    /// Duplicate delivery; nothing changed.
    Stale,
    /// The update was older than local state; local state kept.
    Conflict { trade_id: String, detail: String },
    /// No local order matches the update.
    UnknownOrder,
}

pub struct Database {
    client: Client,
}

impl Database {
    pub async fn new<S: AsRef<str>>(database_url: S) -> Result<Self> {
        let database_url = database_url.as_ref().to_string();
        let (client, connection) = tokio_postgres::connect(&database_url, NoTls)
            .await
            .with_context(|| format!("failed to connect to PostgreSQL at {}", database_url))?;

        tokio::spawn(async move {
            if let Err(err) = connection.await {
                error!("PostgreSQL connection error: {}", err);
            }
        });

        Ok(Self { client })
    }

    /// Creates every table and index the engine needs. Idempotent.
    pub async fn init_schema(&self) -> Result<()> {
        self.client
            .batch_execute(
                "CREATE TABLE IF NOT EXISTS settings (
                     setting_key TEXT PRIMARY KEY,
                     value TEXT NOT NULL
                 );
                 CREATE TABLE IF NOT EXISTS strategies (
                     id TEXT PRIMARY KEY,
                     name TEXT NOT NULL,
                     description TEXT,
                     is_active BOOLEAN NOT NULL DEFAULT TRUE,
                     sizing_type TEXT NOT NULL,
                     sizing_value DOUBLE PRECISION NOT NULL,
                     created_at TIMESTAMPTZ NOT NULL
                 );
                 CREATE TABLE IF NOT EXISTS signals (
                     trade_id TEXT PRIMARY KEY,
                     strategy_id TEXT NOT NULL,
                     symbol TEXT NOT NULL,
                     side TEXT NOT NULL,
                     event TEXT NOT NULL,
                     signal_time TIMESTAMPTZ NOT NULL,
                     signal_price DOUBLE PRECISION,
                     requested_qty DOUBLE PRECISION,
                     requested_notional DOUBLE PRECISION,
                     payload_json TEXT NOT NULL,
                     received_at TIMESTAMPTZ NOT NULL
                 );
                 CREATE INDEX IF NOT EXISTS idx_signals_strategy ON signals (strategy_id, symbol);
                 CREATE TABLE IF NOT EXISTS orders (
                     trade_id TEXT PRIMARY KEY REFERENCES signals (trade_id),
                     strategy_id TEXT NOT NULL,
                     symbol TEXT NOT NULL,
                     side TEXT NOT NULL,
                     status TEXT NOT NULL,
                     broker_order_id TEXT,
                     submitted_qty DOUBLE PRECISION,
                     submitted_notional DOUBLE PRECISION,
                     filled_qty DOUBLE PRECISION NOT NULL DEFAULT 0,
                     filled_avg_price DOUBLE PRECISION,
                     update_seq TIMESTAMPTZ,
                     submitted_at TIMESTAMPTZ,
                     filled_at TIMESTAMPTZ,
                     last_error TEXT,
                     raw_response_json TEXT
                 );
                 CREATE INDEX IF NOT EXISTS idx_orders_broker ON orders (broker_order_id);
                 CREATE INDEX IF NOT EXISTS idx_orders_strategy ON orders (strategy_id, symbol);
                 CREATE TABLE IF NOT EXISTS fills (
                     id BIGSERIAL PRIMARY KEY,
                     trade_id TEXT NOT NULL,
                     broker_order_id TEXT NOT NULL,
                     seq INTEGER NOT NULL,
                     strategy_id TEXT NOT NULL,
                     symbol TEXT NOT NULL,
                     side TEXT NOT NULL,
                     qty DOUBLE PRECISION NOT NULL,
                     price DOUBLE PRECISION NOT NULL,
                     filled_at TIMESTAMPTZ NOT NULL,
                     UNIQUE (broker_order_id, seq)
                 );
                 CREATE INDEX IF NOT EXISTS idx_fills_pair ON fills (strategy_id, symbol, filled_at);
                 CREATE TABLE IF NOT EXISTS positions (
                     strategy_id TEXT NOT NULL,
                     symbol TEXT NOT NULL,
                     qty DOUBLE PRECISION NOT NULL,
                     avg_entry_price DOUBLE PRECISION NOT NULL,
                     realized_pnl DOUBLE PRECISION NOT NULL,
                     open_time TIMESTAMPTZ,
                     updated_at TIMESTAMPTZ NOT NULL,
                     PRIMARY KEY (strategy_id, symbol)
                 );
                 CREATE TABLE IF NOT EXISTS round_trips (
                     id BIGSERIAL PRIMARY KEY,
                     strategy_id TEXT NOT NULL,
                     symbol TEXT NOT NULL,
                     seq_no INTEGER NOT NULL,
                     direction TEXT NOT NULL,
                     entry_time TIMESTAMPTZ NOT NULL,
                     exit_time TIMESTAMPTZ NOT NULL,
                     avg_entry_price DOUBLE PRECISION NOT NULL,
                     avg_exit_price DOUBLE PRECISION NOT NULL,
                     entry_notional DOUBLE PRECISION NOT NULL,
                     net_pnl DOUBLE PRECISION NOT NULL,
                     net_pnl_pct DOUBLE PRECISION,
                     cumulative_pnl DOUBLE PRECISION NOT NULL,
                     UNIQUE (strategy_id, seq_no)
                 );
                 CREATE TABLE IF NOT EXISTS webhook_request_logs (
                     id BIGSERIAL PRIMARY KEY,
                     received_at TIMESTAMPTZ NOT NULL,
                     remote_ip TEXT,
                     user_agent TEXT,
                     ok BOOLEAN NOT NULL,
                     reason TEXT
                 );
                 CREATE TABLE IF NOT EXISTS system_logs (
                     id BIGSERIAL PRIMARY KEY,
                     source TEXT NOT NULL,
                     level TEXT NOT NULL,
                     message TEXT NOT NULL,
                     metadata TEXT,
                     created_at TIMESTAMPTZ NOT NULL
                 );",
            )
            .await
            .context("failed to initialize schema")?;
        Ok(())
    }

    pub async fn get_all_settings(&self) -> Result<HashMap<String, String>> {
        let rows = self
            .client
            .query("SELECT setting_key, value FROM settings", &[])
            .await?;
        let mut settings = HashMap::with_capacity(rows.len());
        for row in rows {
            let key: String = row.get(0);
            let raw_value: String = row.get(1);
            let value = decrypt_database_value(&raw_value)
                .with_context(|| format!("failed to decrypt setting {}", key))?;
            settings.insert(key, value);
        }
        Ok(settings)
    }

    pub async fn insert_system_log(
        &self,
        source: &str,
        level: &str,
        message: &str,
        metadata: Option<Value>,
    ) -> Result<()> {
        let created_at = Utc::now();
        let metadata_text = metadata.map(|value| value.to_string());

        self.client
            .execute(
                "INSERT INTO system_logs (source, level, message, metadata, created_at)
                 VALUES ($1, $2, $3, $4, $5)",
                &[&source, &level, &message, &metadata_text, &created_at],
            )
            .await?;

        Ok(())
    }

    /// Best-effort strategy-scoped operational log; failures are warned, not
    /// propagated, so logging never fails a reconciliation.
    pub async fn persist_strategy_event(
        &self,
        strategy_id: &str,
        level: &str,
        message: impl Into<String>,
        metadata: Value,
    ) {
        let text = message.into();
        let mut merged = Map::new();
        merged.insert(
            "strategyId".to_string(),
            Value::String(strategy_id.to_string()),
        );
        match metadata {
            Value::Object(map) => {
                for (key, value) in map {
                    merged.insert(key, value);
                }
            }
            other => {
                merged.insert("details".to_string(), other);
            }
        }

        if let Err(err) = self
            .insert_system_log("engine", level, &text, Some(Value::Object(merged)))
            .await
        {
            warn!(
                "Failed to persist strategy log for {}: {}",
                strategy_id, err
            );
        }
    }

    pub async fn insert_webhook_log(&self, log: &WebhookRequestLog) -> Result<()> {
        self.client
            .execute(
                "INSERT INTO webhook_request_logs (received_at, remote_ip, user_agent, ok, reason)
                 VALUES ($1, $2, $3, $4, $5)",
                &[
                    &log.received_at,
                    &log.remote_ip,
                    &log.user_agent,
                    &log.ok,
                    &log.reason,
                ],
            )
            .await?;
        Ok(())
    }

    /// Inserts the strategy if it is not yet known and returns the stored
    /// row either way. Sizing is immutable after creation.
    pub async fn ensure_strategy(&self, strategy: &Strategy) -> Result<Strategy> {
        let (sizing_type, sizing_value) = strategy.sizing.to_parts();
        self.client
            .execute(
                "INSERT INTO strategies (id, name, description, is_active, sizing_type, sizing_value, created_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)
                 ON CONFLICT (id) DO NOTHING",
                &[
                    &strategy.id,
                    &strategy.name,
                    &strategy.description,
                    &strategy.is_active,
                    &sizing_type,
                    &sizing_value,
                    &strategy.created_at,
                ],
            )
            .await?;

        self.get_strategy(&strategy.id)
            .await?
            .ok_or_else(|| anyhow!("strategy {} missing after insert", strategy.id))
    }

    pub async fn get_strategy(&self, strategy_id: &str) -> Result<Option<Strategy>> {
        let row = self
            .client
            .query_opt(
                "SELECT id, name, description, is_active, sizing_type, sizing_value, created_at
                 FROM strategies WHERE id = $1",
                &[&strategy_id],
            )
            .await?;
        row.map(|row| map_strategy_row(&row)).transpose()
    }

    pub async fn get_strategies(&self, active_only: bool) -> Result<Vec<Strategy>> {
        let query = if active_only {
            "SELECT id, name, description, is_active, sizing_type, sizing_value, created_at
             FROM strategies WHERE is_active ORDER BY id"
        } else {
            "SELECT id, name, description, is_active, sizing_type, sizing_value, created_at
             FROM strategies ORDER BY id"
        };
        let rows = self.client.query(query, &[]).await?;
        rows.iter().map(map_strategy_row).collect()
    }

    /// Returns true when the signal was newly recorded; false means the same
    /// trade_id was already stored and this delivery is a duplicate.
    pub async fn insert_signal(&self, signal: &Signal) -> Result<bool> {
        let inserted = self
            .client
            .execute(
                "INSERT INTO signals (trade_id, strategy_id, symbol, side, event, signal_time,
                                      signal_price, requested_qty, requested_notional, payload_json, received_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                 ON CONFLICT (trade_id) DO NOTHING",
                &[
                    &signal.trade_id,
                    &signal.strategy_id,
                    &signal.symbol,
                    &signal.side.as_str(),
                    &signal.event.as_str(),
                    &signal.signal_time,
                    &signal.signal_price,
                    &signal.requested_qty,
                    &signal.requested_notional,
                    &signal.payload_json,
                    &signal.received_at,
                ],
            )
            .await?;
        Ok(inserted > 0)
    }

    pub async fn get_signal(&self, trade_id: &str) -> Result<Option<Signal>> {
        let row = self
            .client
            .query_opt(
                "SELECT trade_id, strategy_id, symbol, side, event, signal_time, signal_price,
                        requested_qty, requested_notional, payload_json, received_at
                 FROM signals WHERE trade_id = $1",
                &[&trade_id],
            )
            .await?;
        row.map(|row| map_signal_row(&row)).transpose()
    }

    pub async fn get_signals_for_strategy(&self, strategy_id: &str) -> Result<Vec<Signal>> {
        let rows = self
            .client
            .query(
                "SELECT trade_id, strategy_id, symbol, side, event, signal_time, signal_price,
                        requested_qty, requested_notional, payload_json, received_at
                 FROM signals WHERE strategy_id = $1
                 ORDER BY signal_time",
                &[&strategy_id],
            )
            .await?;
        rows.iter().map(map_signal_row).collect()
    }

    pub async fn get_recent_signals(&self, limit: i64) -> Result<Vec<Signal>> {
        let rows = self
            .client
            .query(
                "SELECT trade_id, strategy_id, symbol, side, event, signal_time, signal_price,
                        requested_qty, requested_notional, payload_json, received_at
                 FROM signals
                 ORDER BY received_at DESC
                 LIMIT $1",
                &[&limit],
            )
            .await?;
        rows.iter().map(map_signal_row).collect()
    }

    /// Creates the order row in its initial state. Idempotent on trade_id;
    /// returns false when an order already exists for the trade.
    pub async fn insert_order(&self, order: &Order) -> Result<bool> {
        let inserted = self
            .client
            .execute(
                "INSERT INTO orders (trade_id, strategy_id, symbol, side, status, broker_order_id,
                                     submitted_qty, submitted_notional, filled_qty, filled_avg_price,
                                     update_seq, submitted_at, filled_at, last_error)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
                 ON CONFLICT (trade_id) DO NOTHING",
                &[
                    &order.trade_id,
                    &order.strategy_id,
                    &order.symbol,
                    &order.side.as_str(),
                    &order.status.as_str(),
                    &order.broker_order_id,
                    &order.submitted_qty,
                    &order.submitted_notional,
                    &order.filled_qty,
                    &order.filled_avg_price,
                    &order.update_seq,
                    &order.submitted_at,
                    &order.filled_at,
                    &order.last_error,
                ],
            )
            .await?;
        Ok(inserted > 0)
    }

    pub async fn get_order(&self, trade_id: &str) -> Result<Option<Order>> {
        let row = self
            .client
            .query_opt(
                format!("{} WHERE trade_id = $1", ORDER_SELECT).as_str(),
                &[&trade_id],
            )
            .await?;
        row.map(|row| map_order_row(&row)).transpose()
    }

    pub async fn get_orders_for_strategy(&self, strategy_id: &str) -> Result<Vec<Order>> {
        let rows = self
            .client
            .query(
                format!(
                    "{} WHERE strategy_id = $1 ORDER BY submitted_at NULLS LAST",
                    ORDER_SELECT
                )
                .as_str(),
                &[&strategy_id],
            )
            .await?;
        rows.iter().map(map_order_row).collect()
    }

    /// Orders the pull sync still needs to resolve: everything not yet in a
    /// terminal state.
    pub async fn get_open_orders(&self) -> Result<Vec<Order>> {
        let rows = self
            .client
            .query(
                format!(
                    "{} WHERE status IN ('submitted', 'accepted', 'partially_filled')
                     ORDER BY submitted_at NULLS FIRST",
                    ORDER_SELECT
                )
                .as_str(),
                &[],
            )
            .await?;
        rows.iter().map(map_order_row).collect()
    }

    /// Records the broker's acknowledgment of a submission.
    pub async fn record_submission_ack(
        &self,
        trade_id: &str,
        broker_order_id: &str,
        status: OrderStatus,
        submitted_at: Option<DateTime<Utc>>,
        raw_response_json: &str,
    ) -> Result<()> {
        self.client
            .execute(
                "UPDATE orders
                 SET broker_order_id = $1,
                     status = $2,
                     submitted_at = COALESCE($3, submitted_at),
                     raw_response_json = $4
                 WHERE trade_id = $5",
                &[
                    &broker_order_id,
                    &status.as_str(),
                    &submitted_at,
                    &raw_response_json,
                    &trade_id,
                ],
            )
            .await?;
        Ok(())
    }

    /// Marks an order terminally failed at submission time. The signal row
    /// is preserved for audit.
    pub async fn record_submission_failure(
        &self,
        trade_id: &str,
        status: OrderStatus,
        last_error: &str,
    ) -> Result<()> {
        self.client
            .execute(
                "UPDATE orders SET status = $1, last_error = $2 WHERE trade_id = $3",
                &[&status.as_str(), &last_error, &trade_id],
            )
            .await?;
        Ok(())
    }

    /// Applies one broker update under the per-order row lock. The lock plus
    /// the single UPDATE make concurrent deliveries for the same order
    /// serialize, so filled_qty is never double-counted.
    pub async fn reconcile_order_update(
        &mut self,
        update: &OrderUpdate,
    ) -> Result<ReconcileOutcome> {
        let tx = self.client.transaction().await?;

        let row = match update.trade_id.as_deref() {
            Some(trade_id) => {
                tx.query_opt(
                    format!("{} WHERE trade_id = $1 FOR UPDATE", ORDER_SELECT).as_str(),
                    &[&trade_id],
                )
                .await?
            }
            None => None,
        };
        let row = match row {
            Some(row) => Some(row),
            None => {
                tx.query_opt(
                    format!("{} WHERE broker_order_id = $1 FOR UPDATE", ORDER_SELECT).as_str(),
                    &[&update.broker_order_id],
                )
                .await?
            }
        };

        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(ReconcileOutcome::UnknownOrder);
        };
        let mut order = map_order_row(&row)?;

        match order.merge_decision(update) {
            MergeDecision::Stale => {
                tx.rollback().await?;
                return Ok(ReconcileOutcome::Stale);
            }
            MergeDecision::Regression => {
                tx.rollback().await?;
                return Ok(ReconcileOutcome::Conflict {
                    trade_id: order.trade_id,
                    detail: format!(
                        "broker reported {} behind local {}",
                        update.status.as_str(),
                        order.status.as_str()
                    ),
                });
            }
            MergeDecision::Apply => {}
        }

        let delta = order.fill_delta(update);
        let new_fill = match delta {
            Some(delta) => {
                let seq: i32 = tx
                    .query_one(
                        "SELECT COALESCE(MAX(seq), 0) + 1 FROM fills WHERE broker_order_id = $1",
                        &[&update.broker_order_id],
                    )
                    .await?
                    .get(0);
                let fill = Fill {
                    trade_id: order.trade_id.clone(),
                    broker_order_id: update.broker_order_id.clone(),
                    seq,
                    strategy_id: order.strategy_id.clone(),
                    symbol: order.symbol.clone(),
                    side: order.side.broker_side(),
                    qty: delta.qty,
                    price: delta.price,
                    filled_at: update.filled_at.or(update.updated_at).unwrap_or_else(Utc::now),
                };
                tx.execute(
                    "INSERT INTO fills (trade_id, broker_order_id, seq, strategy_id, symbol, side, qty, price, filled_at)
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                     ON CONFLICT (broker_order_id, seq) DO NOTHING",
                    &[
                        &fill.trade_id,
                        &fill.broker_order_id,
                        &fill.seq,
                        &fill.strategy_id,
                        &fill.symbol,
                        &fill.side.as_str(),
                        &fill.qty,
                        &fill.price,
                        &fill.filled_at,
                    ],
                )
                .await?;
                Some(fill)
            }
            None => None,
        };

        // An update can report new quantity without an average price; the
        // fill is unpriceable then, so the order keeps its old fill figures
        // until a complete payload arrives (same status + more quantity
        // still merges). Otherwise order totals and the fill ledger would
        // drift apart.
        let fill_figures_current =
            new_fill.is_some() || update.filled_qty - order.filled_qty <= QTY_EPSILON;

        order.status = update.status;
        order.broker_order_id = Some(update.broker_order_id.clone());
        if fill_figures_current {
            order.filled_qty = update.filled_qty;
            if update.filled_avg_price.is_some() {
                order.filled_avg_price = update.filled_avg_price;
            }
        }
        if update.updated_at.is_some() {
            order.update_seq = update.updated_at;
        }
        if update.filled_at.is_some() {
            order.filled_at = update.filled_at;
        }

        tx.execute(
            "UPDATE orders
             SET status = $1,
                 broker_order_id = $2,
                 filled_qty = $3,
                 filled_avg_price = $4,
                 update_seq = $5,
                 filled_at = $6,
                 raw_response_json = $7
             WHERE trade_id = $8",
            &[
                &order.status.as_str(),
                &order.broker_order_id,
                &order.filled_qty,
                &order.filled_avg_price,
                &order.update_seq,
                &order.filled_at,
                &update.raw_json,
                &order.trade_id,
            ],
        )
        .await?;

        tx.commit().await?;
        Ok(ReconcileOutcome::Applied { order, new_fill })
    }

    pub async fn get_fills_for_pair(&self, strategy_id: &str, symbol: &str) -> Result<Vec<Fill>> {
        let rows = self
            .client
            .query(
                format!(
                    "{} WHERE strategy_id = $1 AND symbol = $2 ORDER BY filled_at, broker_order_id, seq",
                    FILL_SELECT
                )
                .as_str(),
                &[&strategy_id, &symbol],
            )
            .await?;
        rows.iter().map(map_fill_row).collect()
    }

    pub async fn get_fills_for_strategy(&self, strategy_id: &str) -> Result<Vec<Fill>> {
        let rows = self
            .client
            .query(
                format!(
                    "{} WHERE strategy_id = $1 ORDER BY filled_at, broker_order_id, seq",
                    FILL_SELECT
                )
                .as_str(),
                &[&strategy_id],
            )
            .await?;
        rows.iter().map(map_fill_row).collect()
    }

    /// Strategies that have at least one fill recorded.
    pub async fn get_strategy_ids_with_fills(&self) -> Result<Vec<String>> {
        let rows = self
            .client
            .query("SELECT DISTINCT strategy_id FROM fills ORDER BY strategy_id", &[])
            .await?;
        Ok(rows.into_iter().map(|row| row.get(0)).collect())
    }

    /// Rewrites the derived tables for one strategy in a single transaction.
    /// The derived rows are pure projections of the fill ledger, so a full
    /// replace is always safe.
    pub async fn replace_strategy_derivation(
        &mut self,
        strategy_id: &str,
        positions: &[Position],
        round_trips: &[RoundTrip],
    ) -> Result<()> {
        let updated_at = Utc::now();
        let tx = self.client.transaction().await?;

        tx.execute("DELETE FROM positions WHERE strategy_id = $1", &[&strategy_id])
            .await?;
        tx.execute(
            "DELETE FROM round_trips WHERE strategy_id = $1",
            &[&strategy_id],
        )
        .await?;

        let position_stmt = tx
            .prepare(
                "INSERT INTO positions (strategy_id, symbol, qty, avg_entry_price, realized_pnl, open_time, updated_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
            )
            .await?;
        for position in positions {
            tx.execute(
                &position_stmt,
                &[
                    &position.strategy_id,
                    &position.symbol,
                    &position.qty,
                    &position.avg_entry_price,
                    &position.realized_pnl,
                    &position.open_time,
                    &updated_at,
                ],
            )
            .await?;
        }

        let trip_stmt = tx
            .prepare(
                "INSERT INTO round_trips (strategy_id, symbol, seq_no, direction, entry_time, exit_time,
                                          avg_entry_price, avg_exit_price, entry_notional, net_pnl,
                                          net_pnl_pct, cumulative_pnl)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
            )
            .await?;
        for trip in round_trips {
            tx.execute(
                &trip_stmt,
                &[
                    &trip.strategy_id,
                    &trip.symbol,
                    &trip.seq_no,
                    &trip.direction.as_str(),
                    &trip.entry_time,
                    &trip.exit_time,
                    &trip.avg_entry_price,
                    &trip.avg_exit_price,
                    &trip.entry_notional,
                    &trip.net_pnl,
                    &trip.net_pnl_pct,
                    &trip.cumulative_pnl,
                ],
            )
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn get_positions(&self, strategy_id: Option<&str>) -> Result<Vec<Position>> {
        let rows = match strategy_id {
            Some(strategy_id) => {
                self.client
                    .query(
                        "SELECT strategy_id, symbol, qty, avg_entry_price, realized_pnl, open_time
                         FROM positions WHERE strategy_id = $1 ORDER BY symbol",
                        &[&strategy_id],
                    )
                    .await?
            }
            None => {
                self.client
                    .query(
                        "SELECT strategy_id, symbol, qty, avg_entry_price, realized_pnl, open_time
                         FROM positions ORDER BY strategy_id, symbol",
                        &[],
                    )
                    .await?
            }
        };
        Ok(rows
            .into_iter()
            .map(|row| Position {
                strategy_id: row.get(0),
                symbol: row.get(1),
                qty: row.get(2),
                avg_entry_price: row.get(3),
                realized_pnl: row.get(4),
                open_time: row.get(5),
            })
            .collect())
    }

    pub async fn get_round_trips(&self, strategy_id: Option<&str>) -> Result<Vec<RoundTrip>> {
        let rows = match strategy_id {
            Some(strategy_id) => {
                self.client
                    .query(
                        format!(
                            "{} WHERE strategy_id = $1 ORDER BY seq_no",
                            ROUND_TRIP_SELECT
                        )
                        .as_str(),
                        &[&strategy_id],
                    )
                    .await?
            }
            None => {
                self.client
                    .query(
                        format!("{} ORDER BY strategy_id, seq_no", ROUND_TRIP_SELECT).as_str(),
                        &[],
                    )
                    .await?
            }
        };
        rows.iter().map(map_round_trip_row).collect()
    }
}

const ORDER_SELECT: &str = "SELECT trade_id, strategy_id, symbol, side, status, broker_order_id,
        submitted_qty, submitted_notional, filled_qty, filled_avg_price,
        update_seq, submitted_at, filled_at, last_error
 FROM orders";

const FILL_SELECT: &str = "SELECT trade_id, broker_order_id, seq, strategy_id, symbol, side, qty, price, filled_at
 FROM fills";

const ROUND_TRIP_SELECT: &str = "SELECT strategy_id, symbol, seq_no, direction, entry_time, exit_time,
        avg_entry_price, avg_exit_price, entry_notional, net_pnl, net_pnl_pct, cumulative_pnl
 FROM round_trips";

fn map_strategy_row(row: &Row) -> Result<Strategy> {
    let sizing_type: String = row.get(4);
    let sizing_value: f64 = row.get(5);
    Ok(Strategy {
        id: row.get(0),
        name: row.get(1),
        description: row.get(2),
        is_active: row.get(3),
        sizing: SizingPolicy::from_parts(&sizing_type, sizing_value)?,
        created_at: row.get(6),
    })
}

fn map_signal_row(row: &Row) -> Result<Signal> {
    let side: String = row.get(3);
    let event: String = row.get(4);
    Ok(Signal {
        trade_id: row.get(0),
        strategy_id: row.get(1),
        symbol: row.get(2),
        side: SignalSide::from_str(&side)?,
        event: SignalEvent::from_str(&event)?,
        signal_time: row.get(5),
        signal_price: row.get(6),
        requested_qty: row.get(7),
        requested_notional: row.get(8),
        payload_json: row.get(9),
        received_at: row.get(10),
    })
}

fn map_order_row(row: &Row) -> Result<Order> {
    let side: String = row.get(3);
    let status: String = row.get(4);
    Ok(Order {
        trade_id: row.get(0),
        strategy_id: row.get(1),
        symbol: row.get(2),
        side: SignalSide::from_str(&side)?,
        status: OrderStatus::from_str(&status)?,
        broker_order_id: row.get(5),
        submitted_qty: row.get(6),
        submitted_notional: row.get(7),
        filled_qty: row.get(8),
        filled_avg_price: row.get(9),
        update_seq: row.get(10),
        submitted_at: row.get(11),
        filled_at: row.get(12),
        last_error: row.get(13),
    })
}

fn map_fill_row(row: &Row) -> Result<Fill> {
    let side: String = row.get(5);
    Ok(Fill {
        trade_id: row.get(0),
        broker_order_id: row.get(1),
        seq: row.get(2),
        strategy_id: row.get(3),
        symbol: row.get(4),
        side: OrderSide::from_str(&side)?,
        qty: row.get(6),
        price: row.get(7),
        filled_at: row.get(8),
    })
}

fn map_round_trip_row(row: &Row) -> Result<RoundTrip> {
    let direction: String = row.get(3);
    Ok(RoundTrip {
        strategy_id: row.get(0),
        symbol: row.get(1),
        seq_no: row.get(2),
        direction: TradeDirection::from_str(&direction)?,
        entry_time: row.get(4),
        exit_time: row.get(5),
        avg_entry_price: row.get(6),
        avg_exit_price: row.get(7),
        entry_notional: row.get(8),
        net_pnl: row.get(9),
        net_pnl_pct: row.get(10),
        cumulative_pnl: row.get(11),
    })
}

fn load_database_key() -> Result<[u8; 32]> {
    let raw = std::env::var(DATABASE_KEY_ENV_VAR)
        .map_err(|_| anyhow!("{} must be set to read encrypted settings", DATABASE_KEY_ENV_VAR))?;
    let bytes = hex::decode(raw.trim())
        .map_err(|_| anyhow!("{} must be a hex-encoded 32-byte key", DATABASE_KEY_ENV_VAR))?;
    bytes
        .try_into()
        .map_err(|_| anyhow!("{} must decode to exactly 32 bytes", DATABASE_KEY_ENV_VAR))
}

/// Settings values may be stored as `enc:v1:<iv>:<data>:<tag>` (AES-256-GCM,
/// base64 parts). Plaintext values pass through unchanged.
fn decrypt_database_value(value: &str) -> Result<String> {
    if value.is_empty() || !value.starts_with(ENCRYPTION_PREFIX) {
        return Ok(value.to_string());
    }

    let key = load_database_key()?;
    let payload = value
        .strip_prefix(ENCRYPTION_PREFIX)
        .ok_or_else(|| anyhow!("Encrypted value has an invalid format."))?;
    let parts: Vec<&str> = payload.split(':').collect();
    if parts.len() != 3 {
        return Err(anyhow!("Encrypted value has an invalid format."));
    }

    let iv = BASE64_STANDARD
        .decode(parts[0])
        .map_err(|_| anyhow!("Encrypted value payload is invalid."))?;
    let data = BASE64_STANDARD
        .decode(parts[1])
        .map_err(|_| anyhow!("Encrypted value payload is invalid."))?;
    let tag = BASE64_STANDARD
        .decode(parts[2])
        .map_err(|_| anyhow!("Encrypted value payload is invalid."))?;

    if iv.len() != ENCRYPTION_IV_LENGTH || tag.is_empty() {
        return Err(anyhow!("Encrypted value payload is invalid."));
    }

    let cipher =
        Aes256Gcm::new_from_slice(&key).map_err(|_| anyhow!("Failed to initialize cipher."))?;
    let nonce = Nonce::from_slice(&iv);
    let mut encrypted = Vec::with_capacity(data.len() + tag.len());
    encrypted.extend_from_slice(&data);
    encrypted.extend_from_slice(&tag);
    let plaintext = cipher
        .decrypt(nonce, encrypted.as_ref())
        .map_err(|_| anyhow!("Failed to decrypt encrypted value."))?;

    String::from_utf8(plaintext).context("Decrypted value is not valid UTF-8.")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex, OnceLock};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    const TEST_DATABASE_KEY_HEX: &str =
        "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

    fn encrypt_test_value(value: &str, key: &[u8; 32]) -> String {
        let cipher = Aes256Gcm::new_from_slice(key).expect("test key should initialize");
        let iv = [7u8; ENCRYPTION_IV_LENGTH];
        let nonce = Nonce::from_slice(&iv);
        let sealed = cipher
            .encrypt(nonce, value.as_bytes())
            .expect("test encryption should succeed");
        let (data, tag) = sealed.split_at(sealed.len() - 16);
        format!(
            "{}{}:{}:{}",
            ENCRYPTION_PREFIX,
            BASE64_STANDARD.encode(iv),
            BASE64_STANDARD.encode(data),
            BASE64_STANDARD.encode(tag)
        )
    }

    #[test]
    fn decrypt_database_value_returns_plaintext_when_not_encrypted() {
        let plaintext = "paper-key";
        let decrypted = decrypt_database_value(plaintext).expect("plaintext should pass through");
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn decrypt_database_value_decrypts_enc_v1_payload() {
        let guard = ENV_LOCK
            .get_or_init(|| Mutex::new(()))
            .lock()
            .expect("env lock should not be poisoned");
        std::env::set_var(DATABASE_KEY_ENV_VAR, TEST_DATABASE_KEY_HEX);

        let key_bytes = hex::decode(TEST_DATABASE_KEY_HEX).expect("test key should decode");
        let key: [u8; 32] = key_bytes
            .try_into()
            .expect("test key should contain exactly 32 bytes");
        let encrypted = encrypt_test_value("super-secret", &key);
        let decrypted = decrypt_database_value(&encrypted).expect("ciphertext should decrypt");
        assert_eq!(decrypted, "super-secret");

        std::env::remove_var(DATABASE_KEY_ENV_VAR);
        drop(guard);
    }

    #[test]
    fn decrypt_database_value_requires_database_key_for_encrypted_values() {
        let guard = ENV_LOCK
            .get_or_init(|| Mutex::new(()))
            .lock()
            .expect("env lock should not be poisoned");
        std::env::remove_var(DATABASE_KEY_ENV_VAR);

        let error = decrypt_database_value("enc:v1:iv:data:tag")
            .expect_err("encrypted values should fail without DATABASE_KEY");
        assert!(error.to_string().contains(DATABASE_KEY_ENV_VAR));
        drop(guard);
    }
}
