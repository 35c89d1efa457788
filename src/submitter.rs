use crate::alpaca::{AlpacaClient, NewOrderRequest};
use crate::database::Database;
use crate::error::EngineError;
use crate::models::{Order, OrderStatus, Signal, SignalSide, Strategy, QTY_EPSILON};
use crate::positions;
use anyhow::{Context, Result};
use chrono::Utc;
use log::{info, warn};
use serde_json::json;

/// Turns a persisted signal into at most one broker order. The trade id is
/// both the local join key and the broker's client order id, so every layer
/// de-duplicates on it.
pub struct OrderSubmitter<'a> {
    db: &'a Database,
    alpaca: &'a AlpacaClient<'a>,
}

/// How an order should be sized before it goes to the broker.
#[derive(Debug, Clone, Copy, PartialEq)]
enum OrderSizing {
    Shares(f64),
    Notional(f64),
}

impl<'a> OrderSubmitter<'a> {
    pub fn new(db: &'a Database, alpaca: &'a AlpacaClient<'a>) -> Self {
        Self { db, alpaca }
    }

    /// Idempotent submission: if an order already exists for the signal's
    /// trade id it is returned unchanged and the broker is not contacted.
    pub async fn submit(&self, strategy: &Strategy, signal: &Signal) -> Result<Order> {
        if let Some(existing) = self.db.get_order(&signal.trade_id).await? {
            info!(
                "Order already exists for trade {} (status {}); skipping submission",
                signal.trade_id,
                existing.status.as_str()
            );
            return Ok(existing);
        }

        let sizing = match self.size_order(strategy, signal).await? {
            Ok(sizing) => sizing,
            Err(reason) => {
                // No position to exit or no sizing available: record a
                // rejected order so the signal stays auditable.
                let (order, _) = self
                    .insert_initial_order(signal, None, None, OrderStatus::Rejected, Some(&reason))
                    .await?;
                self.db
                    .persist_strategy_event(
                        &signal.strategy_id,
                        "warn",
                        format!("Signal {} not submitted: {}", signal.trade_id, reason),
                        json!({ "operation": "order_submission", "tradeId": signal.trade_id }),
                    )
                    .await;
                return Ok(order);
            }
        };

        let (qty, notional) = match sizing {
            OrderSizing::Shares(qty) => (Some(qty), None),
            OrderSizing::Notional(usd) => (None, Some(usd)),
        };

        // The order row is durable in `submitted` state before the network
        // call resolves; a crash mid-call is recovered by the pull sync.
        let (order, freshly_inserted) = self
            .insert_initial_order(signal, qty, notional, OrderStatus::Submitted, None)
            .await?;
        if !freshly_inserted {
            // Lost a race with a concurrent delivery of the same alert; the
            // winner owns the broker call.
            return Ok(order);
        }

        let request = NewOrderRequest {
            symbol: signal.symbol.clone(),
            side: signal.side.broker_side(),
            client_order_id: signal.trade_id.clone(),
            qty,
            notional,
        };

        match self.alpaca.submit_market_order(&request).await {
            Ok(ack) => {
                let status = match ack.normalized_status() {
                    Ok(status) => status,
                    Err(err) => {
                        warn!(
                            "Broker acknowledged order {} with unrecognized status: {}",
                            signal.trade_id, err
                        );
                        OrderStatus::Submitted
                    }
                };
                let broker_order_id = ack.broker_id().context("broker ack without an order id")?;
                let raw = serde_json::json!({
                    "id": broker_order_id,
                    "status": ack.status,
                    "client_order_id": ack.client_order_id,
                })
                .to_string();
                self.db
                    .record_submission_ack(
                        &signal.trade_id,
                        &broker_order_id,
                        status,
                        ack.submitted_timestamp().or_else(|| Some(Utc::now())),
                        &raw,
                    )
                    .await?;
                info!(
                    "Submitted order {} for {} {} ({})",
                    signal.trade_id,
                    signal.side.as_str(),
                    signal.symbol,
                    status.as_str()
                );
            }
            Err(EngineError::BrokerRejected(detail)) => {
                warn!("Broker rejected order {}: {}", signal.trade_id, detail);
                self.db
                    .record_submission_failure(&signal.trade_id, OrderStatus::Rejected, &detail)
                    .await?;
                self.db
                    .persist_strategy_event(
                        &signal.strategy_id,
                        "warn",
                        format!("Broker rejected order for trade {}", signal.trade_id),
                        json!({
                            "operation": "order_submission",
                            "tradeId": signal.trade_id,
                            "detail": detail,
                        }),
                    )
                    .await;
            }
            Err(EngineError::BrokerTransport(detail)) => {
                // The broker may have accepted the order despite the failed
                // response; the order stays `submitted` and the pull sync
                // resolves it by client order id. Never re-submit blindly.
                warn!(
                    "Transport failure submitting order {} (left in submitted state): {}",
                    signal.trade_id, detail
                );
                self.db
                    .persist_strategy_event(
                        &signal.strategy_id,
                        "warn",
                        format!(
                            "Transport failure submitting trade {}; awaiting pull sync",
                            signal.trade_id
                        ),
                        json!({
                            "operation": "order_submission",
                            "tradeId": signal.trade_id,
                            "detail": detail,
                        }),
                    )
                    .await;
            }
            Err(other) => {
                warn!(
                    "Unexpected failure submitting order {}: {}",
                    signal.trade_id, other
                );
                self.db
                    .record_submission_failure(
                        &signal.trade_id,
                        OrderStatus::Error,
                        &other.to_string(),
                    )
                    .await?;
            }
        }

        self.db
            .get_order(&signal.trade_id)
            .await?
            .context("order row missing after submission")
    }

    /// Entry orders size from the alert's intent fields, falling back to the
    /// strategy's policy. Exit orders size from the derived strategy-scoped
    /// position so that one strategy's exit can never touch another
    /// strategy's share of the broker's net position.
    async fn size_order(
        &self,
        strategy: &Strategy,
        signal: &Signal,
    ) -> Result<std::result::Result<OrderSizing, String>> {
        if signal.side.is_entry() {
            if let Some(qty) = signal.requested_qty.filter(|q| *q > 0.0) {
                return Ok(Ok(OrderSizing::Shares(qty)));
            }
            if let Some(usd) = signal.requested_notional.filter(|n| *n > 0.0) {
                return Ok(Ok(OrderSizing::Notional(usd)));
            }
            return Ok(match strategy.sizing {
                crate::models::SizingPolicy::FixedShares(qty) if qty > 0.0 => {
                    Ok(OrderSizing::Shares(qty))
                }
                crate::models::SizingPolicy::FixedNotional(usd) if usd > 0.0 => {
                    Ok(OrderSizing::Notional(usd))
                }
                _ => Err("no usable sizing on the signal or the strategy".to_string()),
            });
        }

        let fills = self
            .db
            .get_fills_for_pair(&signal.strategy_id, &signal.symbol)
            .await?;
        let replay = positions::replay_pair(&signal.strategy_id, &signal.symbol, &fills);
        let position = replay.position;

        let open_qty = match signal.side {
            SignalSide::Sell => {
                if position.qty > QTY_EPSILON {
                    position.qty
                } else {
                    return Ok(Err(format!(
                        "no open long position in {} for this strategy",
                        signal.symbol
                    )));
                }
            }
            SignalSide::Cover => {
                if position.qty < -QTY_EPSILON {
                    -position.qty
                } else {
                    return Ok(Err(format!(
                        "no open short position in {} for this strategy",
                        signal.symbol
                    )));
                }
            }
            SignalSide::Buy | SignalSide::Short => unreachable!("entries handled above"),
        };

        Ok(Ok(OrderSizing::Shares(open_qty)))
    }

    /// Returns the order row plus whether this call created it. Only the
    /// creator may talk to the broker.
    async fn insert_initial_order(
        &self,
        signal: &Signal,
        qty: Option<f64>,
        notional: Option<f64>,
        status: OrderStatus,
        last_error: Option<&str>,
    ) -> Result<(Order, bool)> {
        let order = Order {
            trade_id: signal.trade_id.clone(),
            strategy_id: signal.strategy_id.clone(),
            symbol: signal.symbol.clone(),
            side: signal.side,
            status,
            broker_order_id: None,
            submitted_qty: qty,
            submitted_notional: notional,
            filled_qty: 0.0,
            filled_avg_price: None,
            update_seq: None,
            submitted_at: Some(Utc::now()),
            filled_at: None,
            last_error: last_error.map(str::to_string),
        };

        if self.db.insert_order(&order).await? {
            Ok((order, true))
        } else {
            let existing = self
                .db
                .get_order(&signal.trade_id)
                .await?
                .context("order row vanished after conflicting insert")?;
            Ok((existing, false))
        }
    }
}
