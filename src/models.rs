use anyhow::{anyhow, Result as AnyResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Cumulative fill quantities from the broker are decimal strings; treat
/// differences below this as noise rather than a new partial fill.
pub const QTY_EPSILON: f64 = 1e-9;

/// Direction of the signal as emitted by the charting platform. `Buy` and
/// `Short` open positions, `Sell` and `Cover` close them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalSide {
    Buy,
    Sell,
    Short,
    Cover,
}

impl SignalSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalSide::Buy => "buy",
            SignalSide::Sell => "sell",
            SignalSide::Short => "short",
            SignalSide::Cover => "cover",
        }
    }

    pub fn is_entry(&self) -> bool {
        matches!(self, SignalSide::Buy | SignalSide::Short)
    }

    /// The side the broker order is placed with. Shorting sells, covering
    /// buys back.
    pub fn broker_side(&self) -> OrderSide {
        match self {
            SignalSide::Buy | SignalSide::Cover => OrderSide::Buy,
            SignalSide::Sell | SignalSide::Short => OrderSide::Sell,
        }
    }
}

impl FromStr for SignalSide {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "buy" | "long" => Ok(SignalSide::Buy),
            "sell" => Ok(SignalSide::Sell),
            "short" | "sell_short" => Ok(SignalSide::Short),
            "cover" | "buy_to_cover" => Ok(SignalSide::Cover),
            other => Err(anyhow!("Unknown signal side '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalEvent {
    Entry,
    Exit,
}

impl SignalEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalEvent::Entry => "entry",
            SignalEvent::Exit => "exit",
        }
    }
}

impl FromStr for SignalEvent {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "entry" | "open" => Ok(SignalEvent::Entry),
            "exit" | "close" => Ok(SignalEvent::Exit),
            other => Err(anyhow!("Unknown signal event '{}'", other)),
        }
    }
}

/// Broker-facing order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "buy",
            OrderSide::Sell => "sell",
        }
    }

    /// Sign applied to fill quantities when replaying the ledger.
    pub fn signed(&self, qty: f64) -> f64 {
        match self {
            OrderSide::Buy => qty,
            OrderSide::Sell => -qty,
        }
    }
}

impl FromStr for OrderSide {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "buy" => Ok(OrderSide::Buy),
            "sell" => Ok(OrderSide::Sell),
            other => Err(anyhow!("Unknown order side '{}'", other)),
        }
    }
}

/// Order lifecycle owned by the reconciler. `Filled`, `Canceled`, `Rejected`
/// and `Error` are terminal; everything else may still advance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Submitted,
    Accepted,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Error,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Submitted => "submitted",
            OrderStatus::Accepted => "accepted",
            OrderStatus::PartiallyFilled => "partially_filled",
            OrderStatus::Filled => "filled",
            OrderStatus::Canceled => "canceled",
            OrderStatus::Rejected => "rejected",
            OrderStatus::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled
                | OrderStatus::Canceled
                | OrderStatus::Rejected
                | OrderStatus::Error
        )
    }

    /// Causal ordering of the lifecycle. Terminal states share the top rank;
    /// a terminal order never transitions again.
    pub fn rank(&self) -> u8 {
        match self {
            OrderStatus::Submitted => 0,
            OrderStatus::Accepted => 1,
            OrderStatus::PartiallyFilled => 2,
            OrderStatus::Filled
            | OrderStatus::Canceled
            | OrderStatus::Rejected
            | OrderStatus::Error => 3,
        }
    }
}

impl FromStr for OrderStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "submitted" => Ok(OrderStatus::Submitted),
            "accepted" => Ok(OrderStatus::Accepted),
            "partially_filled" => Ok(OrderStatus::PartiallyFilled),
            "filled" => Ok(OrderStatus::Filled),
            "canceled" => Ok(OrderStatus::Canceled),
            "rejected" => Ok(OrderStatus::Rejected),
            "error" => Ok(OrderStatus::Error),
            other => Err(anyhow!("Unknown order status '{}'", other)),
        }
    }
}

/// Per-symbol order sizing configured on the strategy. Exits are always
/// sized from the derived strategy-scoped position, never from this policy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum SizingPolicy {
    FixedShares(f64),
    FixedNotional(f64),
}

impl SizingPolicy {
    pub fn to_parts(&self) -> (&'static str, f64) {
        match self {
            SizingPolicy::FixedShares(qty) => ("fixed_shares", *qty),
            SizingPolicy::FixedNotional(usd) => ("fixed_notional_usd", *usd),
        }
    }

    pub fn from_parts(sizing_type: &str, value: f64) -> AnyResult<Self> {
        match sizing_type.trim().to_lowercase().as_str() {
            "fixed_shares" => Ok(SizingPolicy::FixedShares(value)),
            "fixed_notional_usd" => Ok(SizingPolicy::FixedNotional(value)),
            other => Err(anyhow!("Unknown sizing type '{}'", other)),
        }
    }

    /// USD committed per symbol, used as the buy-and-hold capital basis.
    pub fn basis_usd(&self, reference_price: Option<f64>) -> Option<f64> {
        match self {
            SizingPolicy::FixedNotional(usd) => Some(*usd),
            SizingPolicy::FixedShares(qty) => reference_price.map(|px| qty * px),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Strategy {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub is_active: bool,
    pub sizing: SizingPolicy,
    pub created_at: DateTime<Utc>,
}

/// Immutable record of one inbound alert. `trade_id` is the idempotency key
/// threaded through the order and the broker's client order id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub trade_id: String,
    pub strategy_id: String,
    pub symbol: String,
    pub side: SignalSide,
    pub event: SignalEvent,
    pub signal_time: DateTime<Utc>,
    pub signal_price: Option<f64>,
    pub requested_qty: Option<f64>,
    pub requested_notional: Option<f64>,
    pub payload_json: String,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub trade_id: String,
    pub strategy_id: String,
    pub symbol: String,
    pub side: SignalSide,
    pub status: OrderStatus,
    pub broker_order_id: Option<String>,
    pub submitted_qty: Option<f64>,
    pub submitted_notional: Option<f64>,
    pub filled_qty: f64,
    pub filled_avg_price: Option<f64>,
    /// Broker's own `updated_at` of the last update applied locally; the
    /// causal clock for same-status refreshes.
    pub update_seq: Option<DateTime<Utc>>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub filled_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// A broker-reported status change, from either the push stream or the pull
/// sync. Both sources funnel through the same merge rule.
#[derive(Debug, Clone)]
pub struct OrderUpdate {
    pub trade_id: Option<String>,
    pub broker_order_id: String,
    pub status: OrderStatus,
    pub filled_qty: f64,
    pub filled_avg_price: Option<f64>,
    pub updated_at: Option<DateTime<Utc>>,
    pub filled_at: Option<DateTime<Utc>>,
    pub raw_json: String,
}

/// Outcome of comparing an incoming broker update against local state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeDecision {
    /// Causally later than local state; apply it.
    Apply,
    /// Duplicate or same-age delivery; silently ignore.
    Stale,
    /// Older than local state; keep local state and log the conflict.
    Regression,
}

/// Quantity newly filled since the last applied update, with the price
/// implied by the broker's cumulative weighted average.
#[derive(Debug, Clone, Copy)]
pub struct FillDelta {
    pub qty: f64,
    pub price: f64,
}

impl Order {
    /// Merge rule for broker updates: apply only what is causally later than
    /// local state, using the lifecycle rank first and the broker's own
    /// update timestamp (never arrival order) to break same-status ties.
    pub fn merge_decision(&self, update: &OrderUpdate) -> MergeDecision {
        if update.status == self.status {
            if update.filled_qty < self.filled_qty - QTY_EPSILON {
                return MergeDecision::Regression;
            }
            if update.filled_qty > self.filled_qty + QTY_EPSILON {
                return MergeDecision::Apply;
            }
            if self.newer_seq(update) {
                return MergeDecision::Apply;
            }
            return MergeDecision::Stale;
        }

        if self.status.is_terminal() {
            return MergeDecision::Regression;
        }

        if update.status.rank() > self.status.rank() {
            MergeDecision::Apply
        } else {
            MergeDecision::Regression
        }
    }

    fn newer_seq(&self, update: &OrderUpdate) -> bool {
        match (self.update_seq, update.updated_at) {
            (Some(local), Some(incoming)) => incoming > local,
            (None, Some(_)) => true,
            _ => false,
        }
    }

    /// Quantity filled beyond what is already recorded, priced from the
    /// change in the broker's cumulative average. Returns `None` when the
    /// update carries no new fill.
    pub fn fill_delta(&self, update: &OrderUpdate) -> Option<FillDelta> {
        let delta_qty = update.filled_qty - self.filled_qty;
        if delta_qty <= QTY_EPSILON {
            return None;
        }

        let new_avg = update.filled_avg_price?;
        let old_qty = self.filled_qty;
        let old_avg = self.filled_avg_price.unwrap_or(0.0);
        let implied = (new_avg * update.filled_qty - old_avg * old_qty) / delta_qty;
        let price = if implied.is_finite() && implied > 0.0 {
            implied
        } else {
            new_avg
        };

        Some(FillDelta {
            qty: delta_qty,
            price,
        })
    }
}

/// One executed slice of an order, denormalized with the strategy/symbol
/// pair so the deriver can replay without joins. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub trade_id: String,
    pub broker_order_id: String,
    /// Stable per-order sequence; the replay tiebreaker for equal fill
    /// timestamps.
    pub seq: i32,
    pub strategy_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub qty: f64,
    pub price: f64,
    pub filled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeDirection {
    Long,
    Short,
}

impl TradeDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeDirection::Long => "long",
            TradeDirection::Short => "short",
        }
    }
}

impl FromStr for TradeDirection {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "long" => Ok(TradeDirection::Long),
            "short" => Ok(TradeDirection::Short),
            other => Err(anyhow!("Unknown trade direction '{}'", other)),
        }
    }
}

/// Derived strategy-scoped position: always the signed sum of fills to date
/// for its (strategy, symbol) pair, rebuildable from the ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub strategy_id: String,
    pub symbol: String,
    pub qty: f64,
    pub avg_entry_price: f64,
    pub realized_pnl: f64,
    pub open_time: Option<DateTime<Utc>>,
}

impl Position {
    pub fn is_flat(&self) -> bool {
        self.qty.abs() <= QTY_EPSILON
    }
}

/// One closed entry-to-flat cycle for a (strategy, symbol) pair. Immutable
/// once materialized; `seq_no` and `cumulative_pnl` are assigned in
/// strategy-wide exit-time order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundTrip {
    pub strategy_id: String,
    pub symbol: String,
    pub seq_no: i32,
    pub direction: TradeDirection,
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    pub avg_entry_price: f64,
    pub avg_exit_price: f64,
    /// Sum of entry legs, abs(qty) * price, while the cycle was open.
    pub entry_notional: f64,
    pub net_pnl: f64,
    pub net_pnl_pct: Option<f64>,
    pub cumulative_pnl: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookRequestLog {
    pub received_at: DateTime<Utc>,
    pub remote_ip: Option<String>,
    pub user_agent: Option<String>,
    pub ok: bool,
    pub reason: Option<String>,
}

/// Deterministic trade id for alerts that do not carry one. Minute
/// truncation collapses at-least-once re-deliveries of the same alert while
/// keeping distinct bars on the same day distinct; collisions merge into one
/// trade rather than duplicating.
pub fn derive_trade_id(
    strategy_id: &str,
    symbol: &str,
    event: SignalEvent,
    signal_time: DateTime<Utc>,
) -> String {
    format!(
        "{}_{}_{}_{}",
        strategy_id,
        symbol,
        event.as_str(),
        signal_time.format("%Y%m%d%H%M")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 15, minute, 0).unwrap()
    }

    fn order_with(status: OrderStatus, filled_qty: f64, seq: Option<DateTime<Utc>>) -> Order {
        Order {
            trade_id: "s1_NVDA_entry_202403011500".to_string(),
            strategy_id: "s1".to_string(),
            symbol: "NVDA".to_string(),
            side: SignalSide::Buy,
            status,
            broker_order_id: Some("b-1".to_string()),
            submitted_qty: Some(10.0),
            submitted_notional: None,
            filled_qty,
            filled_avg_price: if filled_qty > 0.0 { Some(150.0) } else { None },
            update_seq: seq,
            submitted_at: Some(ts(0)),
            filled_at: None,
            last_error: None,
        }
    }

    fn update_with(status: OrderStatus, filled_qty: f64, updated_at: DateTime<Utc>) -> OrderUpdate {
        OrderUpdate {
            trade_id: Some("s1_NVDA_entry_202403011500".to_string()),
            broker_order_id: "b-1".to_string(),
            status,
            filled_qty,
            filled_avg_price: if filled_qty > 0.0 { Some(150.0) } else { None },
            updated_at: Some(updated_at),
            filled_at: None,
            raw_json: String::new(),
        }
    }

    #[test]
    fn derives_stable_trade_ids_at_minute_granularity() {
        let a = derive_trade_id("s1", "NVDA", SignalEvent::Entry, ts(30));
        let b = derive_trade_id(
            "s1",
            "NVDA",
            SignalEvent::Entry,
            ts(30) + chrono::Duration::seconds(45),
        );
        assert_eq!(a, "s1_NVDA_entry_202403011530");
        assert_eq!(a, b);

        let other_event = derive_trade_id("s1", "NVDA", SignalEvent::Exit, ts(30));
        assert_ne!(a, other_event);
    }

    #[test]
    fn forward_transition_applies() {
        let order = order_with(OrderStatus::Submitted, 0.0, None);
        let update = update_with(OrderStatus::Accepted, 0.0, ts(1));
        assert_eq!(order.merge_decision(&update), MergeDecision::Apply);
    }

    #[test]
    fn pull_reporting_accepted_after_filled_is_a_regression() {
        let order = order_with(OrderStatus::Filled, 10.0, Some(ts(5)));
        let update = update_with(OrderStatus::Accepted, 0.0, ts(9));
        assert_eq!(order.merge_decision(&update), MergeDecision::Regression);
    }

    #[test]
    fn duplicate_filled_event_is_stale() {
        let order = order_with(OrderStatus::Filled, 10.0, Some(ts(5)));
        let update = update_with(OrderStatus::Filled, 10.0, ts(5));
        assert_eq!(order.merge_decision(&update), MergeDecision::Stale);
    }

    #[test]
    fn same_status_with_more_quantity_applies() {
        let order = order_with(OrderStatus::PartiallyFilled, 4.0, Some(ts(2)));
        let update = update_with(OrderStatus::PartiallyFilled, 7.0, ts(3));
        assert_eq!(order.merge_decision(&update), MergeDecision::Apply);
    }

    #[test]
    fn same_status_with_less_quantity_is_a_regression() {
        let order = order_with(OrderStatus::PartiallyFilled, 7.0, Some(ts(3)));
        let update = update_with(OrderStatus::PartiallyFilled, 4.0, ts(4));
        assert_eq!(order.merge_decision(&update), MergeDecision::Regression);
    }

    #[test]
    fn fill_delta_prices_the_increment_from_the_cumulative_average() {
        let mut order = order_with(OrderStatus::PartiallyFilled, 4.0, Some(ts(2)));
        order.filled_avg_price = Some(100.0);

        let mut update = update_with(OrderStatus::Filled, 10.0, ts(3));
        // 4 @ 100 plus 6 @ 110 gives a cumulative average of 106.
        update.filled_avg_price = Some(106.0);

        let delta = order.fill_delta(&update).expect("new quantity was filled");
        assert!((delta.qty - 6.0).abs() < 1e-9);
        assert!((delta.price - 110.0).abs() < 1e-6);
    }

    #[test]
    fn fill_delta_is_none_without_new_quantity() {
        let order = order_with(OrderStatus::Filled, 10.0, Some(ts(5)));
        let update = update_with(OrderStatus::Filled, 10.0, ts(6));
        assert!(order.fill_delta(&update).is_none());
    }

    #[test]
    fn signal_sides_map_to_broker_sides() {
        assert_eq!(SignalSide::Buy.broker_side(), OrderSide::Buy);
        assert_eq!(SignalSide::Short.broker_side(), OrderSide::Sell);
        assert_eq!(SignalSide::Sell.broker_side(), OrderSide::Sell);
        assert_eq!(SignalSide::Cover.broker_side(), OrderSide::Buy);
        assert_eq!(
            "sell_short".parse::<SignalSide>().unwrap(),
            SignalSide::Short
        );
    }
}
