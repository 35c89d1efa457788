use crate::models::{Fill, Position, RoundTrip, TradeDirection, QTY_EPSILON};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// Result of replaying one (strategy, symbol) fill history.
#[derive(Debug, Clone)]
pub struct PairReplay {
    pub position: Position,
    pub round_trips: Vec<PairRoundTrip>,
}

/// A closed cycle before strategy-wide numbering. `seq_no` and the running
/// cumulative are assigned across symbols in exit-time order.
#[derive(Debug, Clone)]
pub struct PairRoundTrip {
    pub symbol: String,
    pub direction: TradeDirection,
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    pub avg_entry_price: f64,
    pub avg_exit_price: f64,
    pub entry_notional: f64,
    pub net_pnl: f64,
    pub net_pnl_pct: Option<f64>,
}

struct OpenCycle {
    entry_time: DateTime<Utc>,
    entry_notional: f64,
    exit_qty: f64,
    exit_value: f64,
    realized: f64,
}

impl OpenCycle {
    fn start(time: DateTime<Utc>, qty: f64, price: f64) -> Self {
        Self {
            entry_time: time,
            entry_notional: qty.abs() * price,
            exit_qty: 0.0,
            exit_value: 0.0,
            realized: 0.0,
        }
    }

    fn close(&self, symbol: &str, direction: TradeDirection, entry_avg: f64, exit_time: DateTime<Utc>) -> PairRoundTrip {
        let avg_exit_price = if self.exit_qty > QTY_EPSILON {
            self.exit_value / self.exit_qty
        } else {
            entry_avg
        };
        let net_pnl_pct = if self.entry_notional > QTY_EPSILON {
            Some(self.realized / self.entry_notional)
        } else {
            None
        };
        PairRoundTrip {
            symbol: symbol.to_string(),
            direction,
            entry_time: self.entry_time,
            exit_time,
            avg_entry_price: entry_avg,
            avg_exit_price,
            entry_notional: self.entry_notional,
            net_pnl: self.realized,
            net_pnl_pct,
        }
    }
}

/// Replays the fill history of one (strategy, symbol) pair in fill-time
/// order and derives the current position plus every closed round trip.
///
/// Pure over its input: rerunning on the same ledger reproduces the same
/// output bit-for-bit, so the derived tables can always be rebuilt after a
/// reconciliation bug.
pub fn replay_pair(strategy_id: &str, symbol: &str, fills: &[Fill]) -> PairReplay {
    let mut ordered: Vec<&Fill> = fills.iter().collect();
    // Fill time first; the per-order sequence and order id break ties so the
    // outcome never depends on delivery order.
    ordered.sort_by(|a, b| {
        a.filled_at
            .cmp(&b.filled_at)
            .then_with(|| a.broker_order_id.cmp(&b.broker_order_id))
            .then_with(|| a.seq.cmp(&b.seq))
    });

    let mut qty = 0.0_f64;
    let mut avg = 0.0_f64;
    let mut realized_total = 0.0_f64;
    let mut cycle: Option<OpenCycle> = None;
    let mut round_trips = Vec::new();

    for fill in ordered {
        let delta = fill.side.signed(fill.qty);
        if delta.abs() <= QTY_EPSILON {
            continue;
        }
        let price = fill.price;
        let time = fill.filled_at;

        // Opening from flat.
        if qty.abs() <= QTY_EPSILON {
            qty = delta;
            avg = price;
            cycle = Some(OpenCycle::start(time, delta, price));
            continue;
        }

        // Adding in the same direction: fold into the weighted entry price.
        if (qty > 0.0) == (delta > 0.0) {
            let new_abs = qty.abs() + delta.abs();
            avg = (qty.abs() * avg + delta.abs() * price) / new_abs;
            qty += delta;
            if let Some(open) = cycle.as_mut() {
                open.entry_notional += delta.abs() * price;
            }
            continue;
        }

        // Reducing or flipping: realize P&L on the closed quantity.
        let closing_qty = qty.abs().min(delta.abs());
        let realized = if qty > 0.0 {
            closing_qty * (price - avg)
        } else {
            closing_qty * (avg - price)
        };
        realized_total += realized;
        let direction = if qty > 0.0 {
            TradeDirection::Long
        } else {
            TradeDirection::Short
        };
        if let Some(open) = cycle.as_mut() {
            open.realized += realized;
            open.exit_qty += closing_qty;
            open.exit_value += closing_qty * price;
        }

        let new_qty = qty + delta;

        // A flip closes the cycle and opens the opposite direction within
        // the same fill.
        if new_qty.abs() > QTY_EPSILON && (new_qty > 0.0) != (qty > 0.0) {
            if let Some(open) = cycle.take() {
                round_trips.push(open.close(symbol, direction, avg, time));
            }
            qty = new_qty;
            avg = price;
            cycle = Some(OpenCycle::start(time, new_qty, price));
            continue;
        }

        if new_qty.abs() <= QTY_EPSILON {
            if let Some(open) = cycle.take() {
                round_trips.push(open.close(symbol, direction, avg, time));
            }
            qty = 0.0;
            avg = 0.0;
            continue;
        }

        // Partial reduction: remaining quantity keeps its entry average.
        qty = new_qty;
    }

    let position = Position {
        strategy_id: strategy_id.to_string(),
        symbol: symbol.to_string(),
        qty: if qty.abs() <= QTY_EPSILON { 0.0 } else { qty },
        avg_entry_price: if qty.abs() <= QTY_EPSILON { 0.0 } else { avg },
        realized_pnl: realized_total,
        open_time: cycle.as_ref().map(|open| open.entry_time),
    };

    PairReplay {
        position,
        round_trips,
    }
}

/// Numbers round trips across a strategy's symbols in close-time order and
/// threads the running cumulative P&L through them.
pub fn number_round_trips(strategy_id: &str, mut trips: Vec<PairRoundTrip>) -> Vec<RoundTrip> {
    trips.sort_by(|a, b| {
        a.exit_time
            .cmp(&b.exit_time)
            .then_with(|| a.symbol.cmp(&b.symbol))
            .then_with(|| a.entry_time.cmp(&b.entry_time))
    });

    let mut cumulative = 0.0;
    trips
        .into_iter()
        .enumerate()
        .map(|(index, trip)| {
            cumulative += trip.net_pnl;
            RoundTrip {
                strategy_id: strategy_id.to_string(),
                symbol: trip.symbol,
                seq_no: index as i32 + 1,
                direction: trip.direction,
                entry_time: trip.entry_time,
                exit_time: trip.exit_time,
                avg_entry_price: trip.avg_entry_price,
                avg_exit_price: trip.avg_exit_price,
                entry_notional: trip.entry_notional,
                net_pnl: trip.net_pnl,
                net_pnl_pct: trip.net_pnl_pct,
                cumulative_pnl: cumulative,
            }
        })
        .collect()
}

/// Full derivation for one strategy: groups its fills by symbol, replays
/// each pair independently, then numbers the combined round-trip ledger.
pub fn replay_strategy(strategy_id: &str, fills: &[Fill]) -> (Vec<Position>, Vec<RoundTrip>) {
    let mut by_symbol: BTreeMap<&str, Vec<Fill>> = BTreeMap::new();
    for fill in fills {
        if fill.strategy_id == strategy_id {
            by_symbol
                .entry(fill.symbol.as_str())
                .or_default()
                .push(fill.clone());
        }
    }

    let mut positions = Vec::new();
    let mut trips = Vec::new();
    for (symbol, pair_fills) in by_symbol {
        let replay = replay_pair(strategy_id, symbol, &pair_fills);
        trips.extend(replay.round_trips);
        positions.push(replay.position);
    }

    (positions, number_round_trips(strategy_id, trips))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OrderSide;
    use chrono::{TimeZone, Utc};

    fn fill(minute: u32, side: OrderSide, qty: f64, price: f64) -> Fill {
        Fill {
            trade_id: format!("s1_NVDA_x_{}", minute),
            broker_order_id: format!("b-{}", minute),
            seq: 1,
            strategy_id: "s1".to_string(),
            symbol: "NVDA".to_string(),
            side,
            qty,
            price,
            filled_at: Utc.with_ymd_and_hms(2024, 3, 1, 15, minute, 0).unwrap(),
        }
    }

    #[test]
    fn scaling_in_keeps_a_weighted_entry_price() {
        let fills = vec![
            fill(0, OrderSide::Buy, 10.0, 100.0),
            fill(1, OrderSide::Buy, 10.0, 110.0),
        ];
        let replay = replay_pair("s1", "NVDA", &fills);

        assert!((replay.position.qty - 20.0).abs() < 1e-9);
        assert!((replay.position.avg_entry_price - 105.0).abs() < 1e-9);
        assert!(replay.round_trips.is_empty());
    }

    #[test]
    fn closing_to_flat_materializes_one_round_trip() {
        let fills = vec![
            fill(0, OrderSide::Buy, 10.0, 100.0),
            fill(1, OrderSide::Buy, 10.0, 110.0),
            fill(2, OrderSide::Sell, 20.0, 120.0),
        ];
        let replay = replay_pair("s1", "NVDA", &fills);

        assert!(replay.position.is_flat());
        assert_eq!(replay.round_trips.len(), 1);
        let trip = &replay.round_trips[0];
        assert_eq!(trip.direction, TradeDirection::Long);
        assert!((trip.net_pnl - 300.0).abs() < 1e-9);
        assert!((trip.avg_entry_price - 105.0).abs() < 1e-9);
        assert!((trip.avg_exit_price - 120.0).abs() < 1e-9);
    }

    #[test]
    fn partial_close_realizes_proportionally_and_keeps_the_rest_open() {
        let fills = vec![
            fill(0, OrderSide::Buy, 10.0, 100.0),
            fill(1, OrderSide::Sell, 4.0, 110.0),
        ];
        let replay = replay_pair("s1", "NVDA", &fills);

        assert!((replay.position.qty - 6.0).abs() < 1e-9);
        assert!((replay.position.avg_entry_price - 100.0).abs() < 1e-9);
        assert!((replay.position.realized_pnl - 40.0).abs() < 1e-9);
        assert!(replay.round_trips.is_empty());
    }

    #[test]
    fn staged_exit_reports_a_weighted_exit_price() {
        let fills = vec![
            fill(0, OrderSide::Buy, 10.0, 100.0),
            fill(1, OrderSide::Sell, 4.0, 110.0),
            fill(2, OrderSide::Sell, 6.0, 120.0),
        ];
        let replay = replay_pair("s1", "NVDA", &fills);

        assert!(replay.position.is_flat());
        let trip = &replay.round_trips[0];
        assert!((trip.net_pnl - 160.0).abs() < 1e-9);
        assert!((trip.avg_exit_price - 116.0).abs() < 1e-9);
        // Conservation: exit proceeds minus entry cost equals net P&L.
        let exit_notional = trip.avg_exit_price * 10.0;
        assert!((exit_notional - trip.entry_notional - trip.net_pnl).abs() < 1e-9);
    }

    #[test]
    fn reversal_closes_the_cycle_and_opens_the_opposite_direction() {
        let fills = vec![
            fill(0, OrderSide::Buy, 10.0, 100.0),
            fill(1, OrderSide::Sell, 15.0, 110.0),
        ];
        let replay = replay_pair("s1", "NVDA", &fills);

        assert_eq!(replay.round_trips.len(), 1);
        let trip = &replay.round_trips[0];
        assert_eq!(trip.direction, TradeDirection::Long);
        assert!((trip.net_pnl - 100.0).abs() < 1e-9);

        assert!((replay.position.qty + 5.0).abs() < 1e-9);
        assert!((replay.position.avg_entry_price - 110.0).abs() < 1e-9);
    }

    #[test]
    fn short_round_trip_realizes_on_the_way_down() {
        let fills = vec![
            fill(0, OrderSide::Sell, 10.0, 50.0),
            fill(1, OrderSide::Buy, 10.0, 45.0),
        ];
        let replay = replay_pair("s1", "NVDA", &fills);

        assert!(replay.position.is_flat());
        let trip = &replay.round_trips[0];
        assert_eq!(trip.direction, TradeDirection::Short);
        assert!((trip.net_pnl - 50.0).abs() < 1e-9);
    }

    #[test]
    fn replay_is_deterministic_under_shuffled_input_order() {
        let fills = vec![
            fill(0, OrderSide::Buy, 10.0, 100.0),
            fill(1, OrderSide::Buy, 5.0, 104.0),
            fill(2, OrderSide::Sell, 15.0, 110.0),
            fill(3, OrderSide::Sell, 8.0, 112.0),
            fill(4, OrderSide::Buy, 8.0, 105.0),
        ];

        let baseline = replay_pair("s1", "NVDA", &fills);

        let mut shuffled = fills.clone();
        shuffled.reverse();
        shuffled.swap(0, 2);
        let replayed = replay_pair("s1", "NVDA", &shuffled);

        assert_eq!(baseline.round_trips.len(), replayed.round_trips.len());
        assert!((baseline.position.qty - replayed.position.qty).abs() < 1e-9);
        assert!(
            (baseline.position.realized_pnl - replayed.position.realized_pnl).abs() < 1e-9
        );
        for (a, b) in baseline.round_trips.iter().zip(replayed.round_trips.iter()) {
            assert!((a.net_pnl - b.net_pnl).abs() < 1e-9);
            assert_eq!(a.entry_time, b.entry_time);
            assert_eq!(a.exit_time, b.exit_time);
        }
    }

    #[test]
    fn numbering_orders_by_exit_time_and_accumulates() {
        let early = PairRoundTrip {
            symbol: "AAPL".to_string(),
            direction: TradeDirection::Long,
            entry_time: Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap(),
            exit_time: Utc.with_ymd_and_hms(2024, 3, 1, 11, 0, 0).unwrap(),
            avg_entry_price: 10.0,
            avg_exit_price: 11.0,
            entry_notional: 100.0,
            net_pnl: 10.0,
            net_pnl_pct: Some(0.1),
        };
        let late = PairRoundTrip {
            symbol: "NVDA".to_string(),
            exit_time: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
            net_pnl: -4.0,
            ..early.clone()
        };

        let numbered = number_round_trips("s1", vec![late, early]);
        assert_eq!(numbered[0].symbol, "AAPL");
        assert_eq!(numbered[0].seq_no, 1);
        assert!((numbered[0].cumulative_pnl - 10.0).abs() < 1e-9);
        assert_eq!(numbered[1].seq_no, 2);
        assert!((numbered[1].cumulative_pnl - 6.0).abs() < 1e-9);
    }
}
