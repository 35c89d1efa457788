//! End-to-end pipeline checks over synthetic fill histories: ledger ->
//! deriver -> aggregator, without a database or broker in the loop.

use chrono::{DateTime, TimeZone, Utc};
use forward_engine::models::{
    Fill, MergeDecision, Order, OrderSide, OrderStatus, OrderUpdate, Signal, SignalEvent,
    SignalSide, SizingPolicy, Strategy,
};
use forward_engine::performance::PerformanceCalculator;
use forward_engine::positions::{replay_pair, replay_strategy};

fn ts(minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 14, 0, 0).unwrap() + chrono::Duration::minutes(minute as i64)
}

fn fill(
    strategy_id: &str,
    symbol: &str,
    minute: u32,
    side: OrderSide,
    qty: f64,
    price: f64,
) -> Fill {
    Fill {
        trade_id: format!("{}_{}_{}_{}", strategy_id, symbol, side.as_str(), minute),
        broker_order_id: format!("{}-{}-{}", strategy_id, symbol, minute),
        seq: 1,
        strategy_id: strategy_id.to_string(),
        symbol: symbol.to_string(),
        side,
        qty,
        price,
        filled_at: ts(minute),
    }
}

fn strategy(id: &str) -> Strategy {
    Strategy {
        id: id.to_string(),
        name: id.to_string(),
        description: None,
        is_active: true,
        sizing: SizingPolicy::FixedNotional(1000.0),
        created_at: ts(0),
    }
}

fn signal(strategy_id: &str, symbol: &str, minute: u32, price: f64) -> Signal {
    Signal {
        trade_id: format!("{}_{}_entry_{}", strategy_id, symbol, minute),
        strategy_id: strategy_id.to_string(),
        symbol: symbol.to_string(),
        side: SignalSide::Buy,
        event: SignalEvent::Entry,
        signal_time: ts(minute),
        signal_price: Some(price),
        requested_qty: None,
        requested_notional: Some(1000.0),
        payload_json: String::new(),
        received_at: ts(minute),
    }
}

#[test]
fn ledger_to_report_for_one_strategy() {
    // NVDA: buy 10 @ 100, add 10 @ 110, sell 20 @ 120 (round trip +300);
    // AAPL: short 5 @ 200, cover 5 @ 210 (round trip -50).
    let fills = vec![
        fill("s1", "NVDA", 0, OrderSide::Buy, 10.0, 100.0),
        fill("s1", "NVDA", 5, OrderSide::Buy, 10.0, 110.0),
        fill("s1", "NVDA", 10, OrderSide::Sell, 20.0, 120.0),
        fill("s1", "AAPL", 2, OrderSide::Sell, 5.0, 200.0),
        fill("s1", "AAPL", 12, OrderSide::Buy, 5.0, 210.0),
    ];

    let (positions, round_trips) = replay_strategy("s1", &fills);

    assert_eq!(positions.len(), 2);
    assert!(positions.iter().all(|p| p.is_flat()));

    assert_eq!(round_trips.len(), 2);
    // Numbered in close-time order: NVDA closed at minute 10, AAPL at 12.
    assert_eq!(round_trips[0].symbol, "NVDA");
    assert_eq!(round_trips[0].seq_no, 1);
    assert!((round_trips[0].net_pnl - 300.0).abs() < 1e-9);
    assert_eq!(round_trips[1].symbol, "AAPL");
    assert!((round_trips[1].net_pnl + 50.0).abs() < 1e-9);
    assert!((round_trips[1].cumulative_pnl - 250.0).abs() < 1e-9);

    let signals = vec![
        signal("s1", "NVDA", 0, 100.0),
        signal("s1", "NVDA", 10, 120.0),
        signal("s1", "AAPL", 2, 200.0),
        signal("s1", "AAPL", 12, 210.0),
    ];
    let perf = PerformanceCalculator::calculate_strategy(
        &strategy("s1"),
        &round_trips,
        &positions,
        &signals,
        Some(10_000.0),
    );

    assert_eq!(perf.trades_total, 2);
    assert_eq!(perf.wins, 1);
    assert_eq!(perf.losses, 1);
    assert!((perf.net_pnl_usd - 250.0).abs() < 1e-9);
    assert!((perf.gross_profit_usd - 300.0).abs() < 1e-9);
    assert!((perf.gross_loss_usd + 50.0).abs() < 1e-9);
    assert!((perf.profit_factor.unwrap() - 6.0).abs() < 1e-9);
    assert!((perf.net_pnl_pct.unwrap() - 0.025).abs() < 1e-9);

    // Strategy gross figures equal the per-symbol sums.
    let symbol_profit: f64 = perf.by_symbol.iter().map(|s| s.gross_profit_usd).sum();
    let symbol_loss: f64 = perf.by_symbol.iter().map(|s| s.gross_loss_usd).sum();
    assert!((symbol_profit - perf.gross_profit_usd).abs() < 1e-9);
    assert!((symbol_loss - perf.gross_loss_usd).abs() < 1e-9);

    // Buy & hold: NVDA 100 -> 120 on 1000 basis (+200), AAPL 200 -> 210
    // (+50); capital-weighted rollup over 2000 of basis.
    assert!((perf.buy_hold_basis_usd.unwrap() - 2000.0).abs() < 1e-9);
    assert!((perf.buy_hold_pnl_usd.unwrap() - 250.0).abs() < 1e-9);
    assert!((perf.buy_hold_pct.unwrap() - 0.125).abs() < 1e-9);
}

#[test]
fn strategies_sharing_a_symbol_stay_independent() {
    // Two strategies both trade NVDA. Closing s1's position must leave s2's
    // untouched even though the broker nets them in one account.
    let fills = vec![
        fill("s1", "NVDA", 0, OrderSide::Buy, 10.0, 100.0),
        fill("s2", "NVDA", 1, OrderSide::Buy, 7.0, 101.0),
        fill("s1", "NVDA", 5, OrderSide::Sell, 10.0, 110.0),
    ];

    let (s1_positions, s1_trips) = replay_strategy("s1", &fills);
    let (s2_positions, s2_trips) = replay_strategy("s2", &fills);

    assert!(s1_positions[0].is_flat());
    assert_eq!(s1_trips.len(), 1);
    assert!((s1_trips[0].net_pnl - 100.0).abs() < 1e-9);

    assert_eq!(s2_positions.len(), 1);
    assert!((s2_positions[0].qty - 7.0).abs() < 1e-9);
    assert!((s2_positions[0].avg_entry_price - 101.0).abs() < 1e-9);
    assert!(s2_trips.is_empty());
}

#[test]
fn replay_is_identical_for_reordered_but_timestamped_history() {
    let fills = vec![
        fill("s1", "NVDA", 0, OrderSide::Buy, 10.0, 100.0),
        fill("s1", "NVDA", 3, OrderSide::Buy, 6.0, 103.0),
        fill("s1", "NVDA", 7, OrderSide::Sell, 16.0, 108.0),
        fill("s1", "NVDA", 9, OrderSide::Sell, 4.0, 109.0),
        fill("s1", "NVDA", 15, OrderSide::Buy, 4.0, 101.0),
    ];

    let baseline = replay_pair("s1", "NVDA", &fills);

    // Simulate out-of-order delivery into the ledger.
    let mut scrambled = fills.clone();
    scrambled.swap(0, 4);
    scrambled.swap(1, 3);
    let replayed = replay_pair("s1", "NVDA", &scrambled);

    assert!((baseline.position.qty - replayed.position.qty).abs() < 1e-12);
    assert!(
        (baseline.position.realized_pnl - replayed.position.realized_pnl).abs() < 1e-12
    );
    assert_eq!(baseline.round_trips.len(), replayed.round_trips.len());
    for (a, b) in baseline.round_trips.iter().zip(replayed.round_trips.iter()) {
        assert!((a.net_pnl - b.net_pnl).abs() < 1e-12);
        assert!((a.avg_entry_price - b.avg_entry_price).abs() < 1e-12);
        assert!((a.avg_exit_price - b.avg_exit_price).abs() < 1e-12);
        assert_eq!(a.entry_time, b.entry_time);
        assert_eq!(a.exit_time, b.exit_time);
    }
}

#[test]
fn conservation_holds_for_every_closed_round_trip() {
    let fills = vec![
        fill("s1", "NVDA", 0, OrderSide::Buy, 10.0, 100.0),
        fill("s1", "NVDA", 2, OrderSide::Buy, 5.0, 106.0),
        fill("s1", "NVDA", 4, OrderSide::Sell, 9.0, 111.0),
        fill("s1", "NVDA", 6, OrderSide::Sell, 6.0, 104.0),
        fill("s1", "NVDA", 8, OrderSide::Sell, 8.0, 103.0),
        fill("s1", "NVDA", 11, OrderSide::Buy, 8.0, 99.0),
    ];

    let (_, round_trips) = replay_strategy("s1", &fills);
    assert_eq!(round_trips.len(), 2);

    for trip in &round_trips {
        // Entry notional minus exit notional, signed by direction, equals
        // the reported net P&L before costs.
        let closed_qty = trip.entry_notional / trip.avg_entry_price;
        let exit_notional = trip.avg_exit_price * closed_qty;
        let expected = match trip.direction {
            forward_engine::models::TradeDirection::Long => exit_notional - trip.entry_notional,
            forward_engine::models::TradeDirection::Short => trip.entry_notional - exit_notional,
        };
        assert!(
            (expected - trip.net_pnl).abs() < 1e-9,
            "conservation violated for trip {}: {} vs {}",
            trip.seq_no,
            expected,
            trip.net_pnl
        );
    }
}

#[test]
fn duplicate_submission_settles_at_a_single_fill() {
    // Duplicate alerts collapse onto one order upstream; here we check the
    // order-level arithmetic: one broker fill of 10 @ 150 yields exactly one
    // ledger fill regardless of how many times the same update is delivered.
    let order = Order {
        trade_id: "s1_NVDA_entry_202403011400".to_string(),
        strategy_id: "s1".to_string(),
        symbol: "NVDA".to_string(),
        side: SignalSide::Buy,
        status: OrderStatus::Accepted,
        broker_order_id: Some("b-1".to_string()),
        submitted_qty: Some(10.0),
        submitted_notional: None,
        filled_qty: 0.0,
        filled_avg_price: None,
        update_seq: Some(ts(0)),
        submitted_at: Some(ts(0)),
        filled_at: None,
        last_error: None,
    };

    let update = OrderUpdate {
        trade_id: Some(order.trade_id.clone()),
        broker_order_id: "b-1".to_string(),
        status: OrderStatus::Filled,
        filled_qty: 10.0,
        filled_avg_price: Some(150.0),
        updated_at: Some(ts(1)),
        filled_at: Some(ts(1)),
        raw_json: String::new(),
    };

    assert_eq!(order.merge_decision(&update), MergeDecision::Apply);
    let delta = order.fill_delta(&update).expect("first delivery fills");
    assert!((delta.qty - 10.0).abs() < 1e-9);
    assert!((delta.price - 150.0).abs() < 1e-9);

    // Apply the update, then deliver it again: no second fill.
    let mut settled = order.clone();
    settled.status = OrderStatus::Filled;
    settled.filled_qty = 10.0;
    settled.filled_avg_price = Some(150.0);
    settled.update_seq = Some(ts(1));

    assert_eq!(settled.merge_decision(&update), MergeDecision::Stale);
    assert!(settled.fill_delta(&update).is_none());

    // A later pull reporting an earlier lifecycle stage must not regress.
    let stale_pull = OrderUpdate {
        status: OrderStatus::Accepted,
        filled_qty: 0.0,
        filled_avg_price: None,
        updated_at: Some(ts(2)),
        ..update
    };
    assert_eq!(settled.merge_decision(&stale_pull), MergeDecision::Regression);
}
