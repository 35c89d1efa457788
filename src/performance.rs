use crate::models::{Position, RoundTrip, Signal, Strategy, QTY_EPSILON};
use chrono::{DateTime, Utc};
use serde::Serialize;
use statrs::statistics::Statistics;

/// Buy-and-hold baseline for one symbol: what the strategy's own capital
/// basis would have returned holding the instrument flat over the window
/// bounded by its first and last observed signal price.
#[derive(Debug, Clone, Serialize)]
pub struct BuyHold {
    pub basis_usd: f64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub start_price: f64,
    pub end_price: f64,
    pub pct: f64,
    pub pnl_usd: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SymbolPerformance {
    pub symbol: String,
    pub trades_total: i32,
    pub wins: i32,
    pub losses: i32,
    pub win_rate: Option<f64>,
    pub net_pnl_usd: f64,
    pub gross_profit_usd: f64,
    pub gross_loss_usd: f64,
    pub profit_factor: Option<f64>,
    pub avg_trade_usd: Option<f64>,
    pub max_drawdown_usd: f64,
    pub max_drawdown_pct: Option<f64>,
    pub sharpe_ratio: Option<f64>,
    pub sortino_ratio: Option<f64>,
    pub open_qty: f64,
    pub avg_entry_price: Option<f64>,
    pub buy_hold: Option<BuyHold>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StrategyPerformance {
    pub strategy_id: String,
    pub trades_total: i32,
    pub wins: i32,
    pub losses: i32,
    pub win_rate: Option<f64>,
    pub net_pnl_usd: f64,
    pub net_pnl_pct: Option<f64>,
    pub gross_profit_usd: f64,
    pub gross_loss_usd: f64,
    pub profit_factor: Option<f64>,
    pub avg_trade_usd: Option<f64>,
    pub largest_win_usd: Option<f64>,
    pub largest_loss_usd: Option<f64>,
    pub max_drawdown_usd: f64,
    pub max_drawdown_pct: Option<f64>,
    pub sharpe_ratio: Option<f64>,
    pub sortino_ratio: Option<f64>,
    pub open_positions_count: i32,
    pub initial_capital_usd: Option<f64>,
    pub buy_hold_basis_usd: Option<f64>,
    pub buy_hold_pnl_usd: Option<f64>,
    pub buy_hold_pct: Option<f64>,
    pub outperformance_usd: Option<f64>,
    pub by_symbol: Vec<SymbolPerformance>,
    pub last_updated: DateTime<Utc>,
}

/// Full report payload for one strategy, as served by the reporting surface.
#[derive(Debug, Clone, Serialize)]
pub struct StrategyReport {
    pub strategy: Strategy,
    pub performance: StrategyPerformance,
    pub positions: Vec<Position>,
    pub trades: Vec<RoundTrip>,
}

#[derive(Debug, Clone, Copy)]
struct DrawdownInfo {
    max_drawdown: f64,
    max_drawdown_pct: Option<f64>,
}

pub struct PerformanceCalculator;

impl PerformanceCalculator {
    /// Computes per-symbol metrics first, then rolls them up to the
    /// strategy. Ratio metrics at the strategy level are recomputed from the
    /// rolled-up gross figures, never averaged across symbols.
    pub fn calculate_strategy(
        strategy: &Strategy,
        round_trips: &[RoundTrip],
        positions: &[Position],
        signals: &[Signal],
        initial_capital_usd: Option<f64>,
    ) -> StrategyPerformance {
        let mut symbols: Vec<String> = round_trips
            .iter()
            .map(|t| t.symbol.clone())
            .chain(positions.iter().map(|p| p.symbol.clone()))
            .chain(signals.iter().map(|s| s.symbol.clone()))
            .collect();
        symbols.sort();
        symbols.dedup();

        let mut by_symbol = Vec::with_capacity(symbols.len());
        for symbol in &symbols {
            let trips: Vec<&RoundTrip> = round_trips
                .iter()
                .filter(|t| &t.symbol == symbol)
                .collect();
            let position = positions.iter().find(|p| &p.symbol == symbol);
            let buy_hold = Self::buy_hold_for_symbol(strategy, symbol, signals);
            by_symbol.push(Self::calculate_symbol(symbol, &trips, position, buy_hold));
        }

        let trades_total = round_trips.len() as i32;
        let wins = round_trips.iter().filter(|t| t.net_pnl > 0.0).count() as i32;
        let losses = round_trips.iter().filter(|t| t.net_pnl < 0.0).count() as i32;
        let win_rate = if trades_total > 0 {
            Some(wins as f64 / trades_total as f64)
        } else {
            None
        };

        let gross_profit_usd: f64 = round_trips
            .iter()
            .map(|t| t.net_pnl)
            .filter(|pnl| *pnl > 0.0)
            .sum();
        let gross_loss_usd: f64 = round_trips
            .iter()
            .map(|t| t.net_pnl)
            .filter(|pnl| *pnl < 0.0)
            .sum();
        let net_pnl_usd = gross_profit_usd + gross_loss_usd;
        let profit_factor = Self::profit_factor(gross_profit_usd, gross_loss_usd);

        let pnls: Vec<f64> = round_trips.iter().map(|t| t.net_pnl).collect();
        let avg_trade_usd = Self::average(&pnls);
        let largest_win_usd = pnls
            .iter()
            .copied()
            .filter(|pnl| *pnl > 0.0)
            .fold(None, |best: Option<f64>, pnl| {
                Some(best.map_or(pnl, |b| b.max(pnl)))
            });
        let largest_loss_usd = pnls
            .iter()
            .copied()
            .filter(|pnl| *pnl < 0.0)
            .fold(None, |worst: Option<f64>, pnl| {
                Some(worst.map_or(pnl, |w| w.min(pnl)))
            });

        // The strategy-wide drawdown walks all round trips in close-time
        // order, across symbols.
        let drawdown = Self::drawdown_from_trips(round_trips);
        let returns = Self::trade_returns(round_trips);
        let sharpe_ratio = Self::sharpe(&returns);
        let sortino_ratio = Self::sortino(&returns);

        let open_positions_count = positions.iter().filter(|p| !p.is_flat()).count() as i32;

        let mut buy_hold_basis = 0.0;
        let mut buy_hold_pnl = 0.0;
        for entry in by_symbol.iter().filter_map(|s| s.buy_hold.as_ref()) {
            buy_hold_basis += entry.basis_usd;
            buy_hold_pnl += entry.pnl_usd;
        }
        let (buy_hold_basis_usd, buy_hold_pnl_usd, buy_hold_pct) = if buy_hold_basis > 0.0 {
            (
                Some(buy_hold_basis),
                Some(buy_hold_pnl),
                Some(buy_hold_pnl / buy_hold_basis),
            )
        } else {
            (None, None, None)
        };
        let outperformance_usd = buy_hold_pnl_usd.map(|bh| net_pnl_usd - bh);

        let net_pnl_pct = initial_capital_usd
            .filter(|capital| *capital > 0.0)
            .map(|capital| net_pnl_usd / capital);

        StrategyPerformance {
            strategy_id: strategy.id.clone(),
            trades_total,
            wins,
            losses,
            win_rate,
            net_pnl_usd,
            net_pnl_pct,
            gross_profit_usd,
            gross_loss_usd,
            profit_factor,
            avg_trade_usd,
            largest_win_usd,
            largest_loss_usd,
            max_drawdown_usd: drawdown.max_drawdown,
            max_drawdown_pct: drawdown.max_drawdown_pct,
            sharpe_ratio,
            sortino_ratio,
            open_positions_count,
            initial_capital_usd,
            buy_hold_basis_usd,
            buy_hold_pnl_usd,
            buy_hold_pct,
            outperformance_usd,
            by_symbol,
            last_updated: Utc::now(),
        }
    }

    fn calculate_symbol(
        symbol: &str,
        trips: &[&RoundTrip],
        position: Option<&Position>,
        buy_hold: Option<BuyHold>,
    ) -> SymbolPerformance {
        let trades_total = trips.len() as i32;
        let wins = trips.iter().filter(|t| t.net_pnl > 0.0).count() as i32;
        let losses = trips.iter().filter(|t| t.net_pnl < 0.0).count() as i32;
        let win_rate = if trades_total > 0 {
            Some(wins as f64 / trades_total as f64)
        } else {
            None
        };

        let gross_profit_usd: f64 = trips
            .iter()
            .map(|t| t.net_pnl)
            .filter(|pnl| *pnl > 0.0)
            .sum();
        let gross_loss_usd: f64 = trips
            .iter()
            .map(|t| t.net_pnl)
            .filter(|pnl| *pnl < 0.0)
            .sum();

        let pnls: Vec<f64> = trips.iter().map(|t| t.net_pnl).collect();
        let owned: Vec<RoundTrip> = trips.iter().map(|t| (*t).clone()).collect();
        let drawdown = Self::drawdown_from_trips(&owned);
        let returns = Self::trade_returns(&owned);

        let open_qty = position.map(|p| p.qty).unwrap_or(0.0);
        let avg_entry_price = position
            .filter(|p| !p.is_flat())
            .map(|p| p.avg_entry_price);

        SymbolPerformance {
            symbol: symbol.to_string(),
            trades_total,
            wins,
            losses,
            win_rate,
            net_pnl_usd: gross_profit_usd + gross_loss_usd,
            gross_profit_usd,
            gross_loss_usd,
            profit_factor: Self::profit_factor(gross_profit_usd, gross_loss_usd),
            avg_trade_usd: Self::average(&pnls),
            max_drawdown_usd: drawdown.max_drawdown,
            max_drawdown_pct: drawdown.max_drawdown_pct,
            sharpe_ratio: Self::sharpe(&returns),
            sortino_ratio: Self::sortino(&returns),
            open_qty,
            avg_entry_price,
            buy_hold,
        }
    }

    fn profit_factor(gross_profit: f64, gross_loss: f64) -> Option<f64> {
        if gross_loss.abs() <= f64::EPSILON {
            return None;
        }
        Some(gross_profit / gross_loss.abs())
    }

    fn average(values: &[f64]) -> Option<f64> {
        let finite: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
        if finite.is_empty() {
            return None;
        }
        Some(finite.iter().sum::<f64>() / finite.len() as f64)
    }

    /// Per-trade return series: net P&L over the capital the trade actually
    /// committed. Forward tests trade irregularly, so risk ratios use the
    /// per-trade basis rather than calendar-period returns.
    fn trade_returns(trips: &[RoundTrip]) -> Vec<f64> {
        let mut ordered: Vec<&RoundTrip> = trips.iter().collect();
        ordered.sort_by(|a, b| a.exit_time.cmp(&b.exit_time).then(a.seq_no.cmp(&b.seq_no)));
        ordered
            .iter()
            .filter_map(|t| t.net_pnl_pct)
            .filter(|r| r.is_finite())
            .collect()
    }

    fn sharpe(returns: &[f64]) -> Option<f64> {
        if returns.len() < 2 {
            return None;
        }
        let mean = returns.to_vec().mean();
        let std_dev = returns.to_vec().std_dev();
        if !std_dev.is_finite() || std_dev <= f64::EPSILON {
            return None;
        }
        Some(mean / std_dev)
    }

    fn sortino(returns: &[f64]) -> Option<f64> {
        if returns.len() < 2 {
            return None;
        }
        let mean = returns.to_vec().mean();
        let downside_sq: f64 = returns
            .iter()
            .map(|r| r.min(0.0).powi(2))
            .sum::<f64>()
            / returns.len() as f64;
        let downside = downside_sq.sqrt();
        if downside <= f64::EPSILON {
            return None;
        }
        Some(mean / downside)
    }

    /// Peak-to-trough decline of the cumulative P&L curve built by walking
    /// round trips in close-time order. The curve starts at zero.
    fn drawdown_from_trips(trips: &[RoundTrip]) -> DrawdownInfo {
        let mut ordered: Vec<&RoundTrip> = trips.iter().collect();
        ordered.sort_by(|a, b| a.exit_time.cmp(&b.exit_time).then(a.seq_no.cmp(&b.seq_no)));

        let mut equity = 0.0_f64;
        let mut peak = 0.0_f64;
        let mut max_drawdown = 0.0_f64;
        let mut max_drawdown_pct: Option<f64> = None;

        for trip in ordered {
            equity += trip.net_pnl;
            if equity > peak {
                peak = equity;
            }
            let drawdown = peak - equity;
            if drawdown > max_drawdown {
                max_drawdown = drawdown;
                if peak > QTY_EPSILON {
                    max_drawdown_pct = Some(drawdown / peak);
                }
            }
        }

        DrawdownInfo {
            max_drawdown,
            max_drawdown_pct,
        }
    }

    /// Buy & hold over the identical first-signal-to-last-observation window
    /// for one symbol, on the capital basis the strategy commits per symbol.
    fn buy_hold_for_symbol(
        strategy: &Strategy,
        symbol: &str,
        signals: &[Signal],
    ) -> Option<BuyHold> {
        let mut priced: Vec<&Signal> = signals
            .iter()
            .filter(|s| s.symbol == symbol)
            .filter(|s| s.signal_price.map(|p| p > 0.0).unwrap_or(false))
            .collect();
        if priced.is_empty() {
            return None;
        }
        priced.sort_by(|a, b| a.signal_time.cmp(&b.signal_time));

        let first = priced.first()?;
        let last = priced.last()?;
        let start_price = first.signal_price?;
        let end_price = last.signal_price?;
        let basis_usd = strategy.sizing.basis_usd(Some(start_price))?;
        if basis_usd <= 0.0 {
            return None;
        }

        let pct = end_price / start_price - 1.0;
        Some(BuyHold {
            basis_usd,
            start_time: first.signal_time,
            end_time: last.signal_time,
            start_price,
            end_price,
            pct,
            pnl_usd: basis_usd * pct,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{SignalEvent, SignalSide, SizingPolicy, TradeDirection};
    use chrono::TimeZone;

    fn ts(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, hour, 0, 0).unwrap()
    }

    fn strategy() -> Strategy {
        Strategy {
            id: "s1".to_string(),
            name: "Test".to_string(),
            description: None,
            is_active: true,
            sizing: SizingPolicy::FixedNotional(1000.0),
            created_at: ts(0),
        }
    }

    fn trip(symbol: &str, seq_no: i32, exit_hour: u32, net_pnl: f64, notional: f64) -> RoundTrip {
        RoundTrip {
            strategy_id: "s1".to_string(),
            symbol: symbol.to_string(),
            seq_no,
            direction: TradeDirection::Long,
            entry_time: ts(exit_hour.saturating_sub(1)),
            exit_time: ts(exit_hour),
            avg_entry_price: 100.0,
            avg_exit_price: 100.0 + net_pnl / (notional / 100.0),
            entry_notional: notional,
            net_pnl,
            net_pnl_pct: Some(net_pnl / notional),
            cumulative_pnl: 0.0,
        }
    }

    fn signal(symbol: &str, hour: u32, price: f64) -> Signal {
        Signal {
            trade_id: format!("s1_{}_entry_{}", symbol, hour),
            strategy_id: "s1".to_string(),
            symbol: symbol.to_string(),
            side: SignalSide::Buy,
            event: SignalEvent::Entry,
            signal_time: ts(hour),
            signal_price: Some(price),
            requested_qty: None,
            requested_notional: Some(1000.0),
            payload_json: String::new(),
            received_at: ts(hour),
        }
    }

    #[test]
    fn rollup_sums_currency_metrics_and_recomputes_ratios() {
        // AAPL: one big win, one small loss. NVDA: one small win, one big
        // loss. The rolled-up profit factor must come from the combined
        // gross figures, not the mean of the per-symbol factors.
        let trips = vec![
            trip("AAPL", 1, 1, 400.0, 1000.0),
            trip("AAPL", 2, 2, -100.0, 1000.0),
            trip("NVDA", 3, 3, 50.0, 1000.0),
            trip("NVDA", 4, 4, -200.0, 1000.0),
        ];

        let perf = PerformanceCalculator::calculate_strategy(&strategy(), &trips, &[], &[], None);

        assert!((perf.gross_profit_usd - 450.0).abs() < 1e-9);
        assert!((perf.gross_loss_usd + 300.0).abs() < 1e-9);
        let rolled = perf.profit_factor.unwrap();
        assert!((rolled - 1.5).abs() < 1e-9);

        let per_symbol_sum: f64 = perf
            .by_symbol
            .iter()
            .map(|s| s.gross_profit_usd)
            .sum();
        assert!((per_symbol_sum - perf.gross_profit_usd).abs() < 1e-9);

        let mean_of_factors: f64 = perf
            .by_symbol
            .iter()
            .filter_map(|s| s.profit_factor)
            .sum::<f64>()
            / 2.0;
        assert!((rolled - mean_of_factors).abs() > 0.1);

        assert_eq!(perf.trades_total, 4);
        assert_eq!(perf.wins, 2);
        assert!((perf.win_rate.unwrap() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn profit_factor_is_undefined_without_losses() {
        let trips = vec![trip("AAPL", 1, 1, 100.0, 1000.0)];
        let perf = PerformanceCalculator::calculate_strategy(&strategy(), &trips, &[], &[], None);
        assert!(perf.profit_factor.is_none());
        assert!((perf.net_pnl_usd - 100.0).abs() < 1e-9);
    }

    #[test]
    fn drawdown_walks_the_cumulative_curve_in_close_order() {
        let trips = vec![
            trip("AAPL", 1, 1, 100.0, 1000.0),
            trip("AAPL", 2, 2, -60.0, 1000.0),
            trip("AAPL", 3, 3, -30.0, 1000.0),
            trip("AAPL", 4, 4, 50.0, 1000.0),
        ];
        let perf = PerformanceCalculator::calculate_strategy(&strategy(), &trips, &[], &[], None);

        // Peak 100 after the first close, trough 10 after the third.
        assert!((perf.max_drawdown_usd - 90.0).abs() < 1e-9);
        assert!((perf.max_drawdown_pct.unwrap() - 0.9).abs() < 1e-9);
    }

    #[test]
    fn buy_hold_uses_first_and_last_signal_price_per_symbol() {
        let signals = vec![
            signal("AAPL", 1, 100.0),
            signal("AAPL", 5, 110.0),
            signal("NVDA", 2, 50.0),
            signal("NVDA", 6, 45.0),
        ];
        let perf =
            PerformanceCalculator::calculate_strategy(&strategy(), &[], &[], &signals, None);

        let aapl = perf
            .by_symbol
            .iter()
            .find(|s| s.symbol == "AAPL")
            .and_then(|s| s.buy_hold.as_ref())
            .expect("AAPL baseline");
        assert!((aapl.pct - 0.10).abs() < 1e-9);
        assert!((aapl.pnl_usd - 100.0).abs() < 1e-9);

        // Rollup is capital-weighted: (100 - 100) over 2000 of basis.
        assert!((perf.buy_hold_basis_usd.unwrap() - 2000.0).abs() < 1e-9);
        assert!(perf.buy_hold_pnl_usd.unwrap().abs() < 1e-9);
    }

    #[test]
    fn risk_ratios_need_at_least_two_trades_and_some_variance() {
        let one = vec![trip("AAPL", 1, 1, 100.0, 1000.0)];
        let perf = PerformanceCalculator::calculate_strategy(&strategy(), &one, &[], &[], None);
        assert!(perf.sharpe_ratio.is_none());

        let flat = vec![
            trip("AAPL", 1, 1, 100.0, 1000.0),
            trip("AAPL", 2, 2, 100.0, 1000.0),
        ];
        let perf = PerformanceCalculator::calculate_strategy(&strategy(), &flat, &[], &[], None);
        // Identical returns: no variance, no downside.
        assert!(perf.sharpe_ratio.is_none());
        assert!(perf.sortino_ratio.is_none());

        let mixed = vec![
            trip("AAPL", 1, 1, 100.0, 1000.0),
            trip("AAPL", 2, 2, -50.0, 1000.0),
            trip("AAPL", 3, 3, 80.0, 1000.0),
        ];
        let perf = PerformanceCalculator::calculate_strategy(&strategy(), &mixed, &[], &[], None);
        assert!(perf.sharpe_ratio.unwrap() > 0.0);
        assert!(perf.sortino_ratio.unwrap() > 0.0);
    }

    #[test]
    fn net_pnl_pct_uses_the_initial_capital_when_provided() {
        let trips = vec![trip("AAPL", 1, 1, 500.0, 1000.0)];
        let perf = PerformanceCalculator::calculate_strategy(
            &strategy(),
            &trips,
            &[],
            &[],
            Some(10_000.0),
        );
        assert!((perf.net_pnl_pct.unwrap() - 0.05).abs() < 1e-9);
    }
}
