use crate::alpaca::AlpacaClient;
use crate::config::EngineRuntimeSettings;
use crate::context::AppContext;
use crate::database::Database;
use crate::models::{
    derive_trade_id, Order, Position, RoundTrip, Signal, SignalEvent, SignalSide, SizingPolicy,
    Strategy, WebhookRequestLog,
};
use crate::performance::{PerformanceCalculator, StrategyReport};
use crate::submitter::OrderSubmitter;
use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

const DEFAULT_STRATEGY_NOTIONAL_USD: f64 = 1000.0;
const TRADE_LIST_LIMIT: i64 = 200;

#[derive(Clone)]
pub struct ServerState {
    pub app: AppContext,
    pub settings: Arc<EngineRuntimeSettings>,
    pub settings_map: Arc<HashMap<String, String>>,
    pub http: reqwest::Client,
}

pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhook", post(webhook))
        .route("/positions", get(list_positions))
        .route("/round-trips", get(list_round_trips))
        .route("/trades", get(list_trades))
        .route("/strategies", get(list_strategies))
        .route("/strategies/:id/report", get(strategy_report))
        .with_state(state)
}

pub async fn serve(state: ServerState) -> Result<()> {
    let bind_addr = state.settings.bind_addr.clone();
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("Webhook server listening on {}", bind_addr);
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok", "service": "forward-engine" }))
}

/// Alert fields after lenient parsing. The charting platform sends numbers
/// as strings and sometimes leaves template placeholders in numeric fields.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedAlert {
    pub token: String,
    pub strategy_id: String,
    pub strategy_name: Option<String>,
    pub symbol: String,
    pub side: SignalSide,
    pub event: SignalEvent,
    pub signal_price: Option<f64>,
    pub requested_qty: Option<f64>,
    pub requested_notional: Option<f64>,
    pub signal_time: DateTime<Utc>,
    pub trade_id: String,
}

/// Accepts numbers or numeric strings; placeholders like "#close#" become
/// `None` rather than an error.
pub fn lenient_f64(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64().filter(|v| v.is_finite()),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
        _ => None,
    }
}

fn lenient_datetime(value: Option<&Value>, fallback: DateTime<Utc>) -> DateTime<Utc> {
    let Some(Value::String(raw)) = value else {
        return fallback;
    };
    let normalized = raw.trim().replace(' ', "T");
    if let Ok(dt) = DateTime::parse_from_rfc3339(&normalized) {
        return dt.with_timezone(&Utc);
    }
    // Bare timestamps without an offset are taken as UTC.
    if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(&normalized, "%Y-%m-%dT%H:%M:%S") {
        return naive.and_utc();
    }
    fallback
}

fn str_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Parses an inbound webhook body. Returns a human-readable reason when the
/// payload cannot describe a signal.
pub fn parse_webhook_alert(
    body: &Value,
    received_at: DateTime<Utc>,
) -> std::result::Result<ParsedAlert, String> {
    let token = str_field(body, "token").unwrap_or("").to_string();

    let strategy_id = str_field(body, "strategy_id")
        .or_else(|| str_field(body, "strategy"))
        .ok_or("missing strategy_id")?
        .to_string();
    let strategy_name = str_field(body, "strategy_name").map(str::to_string);

    let symbol = str_field(body, "symbol")
        .map(|s| s.to_uppercase())
        .ok_or("missing symbol")?;

    let side_raw = str_field(body, "side")
        .or_else(|| str_field(body, "action"))
        .ok_or("missing side")?;
    let side = SignalSide::from_str(side_raw).map_err(|err| err.to_string())?;

    let event = match str_field(body, "event") {
        Some(raw) => SignalEvent::from_str(raw).map_err(|err| err.to_string())?,
        None => {
            if side.is_entry() {
                SignalEvent::Entry
            } else {
                SignalEvent::Exit
            }
        }
    };

    let signal_price = lenient_f64(body.get("signal_price").or_else(|| body.get("price")));

    let qty_type = str_field(body, "intent_qty_type").unwrap_or("");
    let qty_value = lenient_f64(body.get("intent_qty_value").or_else(|| body.get("quantity")));
    let (requested_qty, requested_notional) = match qty_type {
        "notional_usd" => (None, qty_value),
        "shares" => (qty_value, None),
        _ => (qty_value, None),
    };

    let signal_time = lenient_datetime(
        body.get("signal_time").or_else(|| body.get("timestamp")),
        received_at,
    );

    let trade_id = match str_field(body, "trade_id").or_else(|| str_field(body, "alert_id")) {
        Some(explicit) => explicit.to_string(),
        None => derive_trade_id(&strategy_id, &symbol, event, signal_time),
    };

    Ok(ParsedAlert {
        token,
        strategy_id,
        strategy_name,
        symbol,
        side,
        event,
        signal_price,
        requested_qty,
        requested_notional,
        signal_time,
        trade_id,
    })
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "ok": false, "error": message }))).into_response()
}

fn storage_unavailable() -> Response {
    // Fail closed: without durability nothing is accepted.
    error_response(StatusCode::SERVICE_UNAVAILABLE, "storage unavailable")
}

async fn log_webhook_request(
    db: &Database,
    headers: &HeaderMap,
    received_at: DateTime<Utc>,
    ok: bool,
    reason: &str,
) {
    let log = WebhookRequestLog {
        received_at,
        remote_ip: headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        user_agent: headers
            .get("user-agent")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        ok,
        reason: Some(reason.to_string()),
    };
    if let Err(err) = db.insert_webhook_log(&log).await {
        warn!("Failed to persist webhook request log: {}", err);
    }
}

async fn webhook(
    State(state): State<ServerState>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let received_at = Utc::now();

    let content_type = headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !content_type.to_lowercase().contains("application/json") {
        return error_response(
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "Content-Type must be application/json",
        );
    }

    let Ok(db) = state.app.database().await else {
        return storage_unavailable();
    };

    let parsed: Value = match serde_json::from_str(&body) {
        Ok(value) => value,
        Err(err) => {
            log_webhook_request(&db, &headers, received_at, false, "malformed_json").await;
            return error_response(StatusCode::BAD_REQUEST, &format!("invalid JSON: {}", err));
        }
    };

    let alert = match parse_webhook_alert(&parsed, received_at) {
        Ok(alert) => alert,
        Err(reason) => {
            log_webhook_request(&db, &headers, received_at, false, &reason).await;
            return error_response(StatusCode::BAD_REQUEST, &reason);
        }
    };

    if alert.token != state.settings.webhook_token {
        log_webhook_request(&db, &headers, received_at, false, "invalid_token").await;
        return error_response(StatusCode::UNAUTHORIZED, "invalid token");
    }

    // Auto-create unknown strategies, sized from the alert's intent fields.
    let sizing = if let Some(usd) = alert.requested_notional.filter(|v| *v > 0.0) {
        SizingPolicy::FixedNotional(usd)
    } else if let Some(qty) = alert.requested_qty.filter(|v| *v > 0.0) {
        SizingPolicy::FixedShares(qty)
    } else {
        SizingPolicy::FixedNotional(DEFAULT_STRATEGY_NOTIONAL_USD)
    };
    let strategy = match db
        .ensure_strategy(&Strategy {
            id: alert.strategy_id.clone(),
            name: alert
                .strategy_name
                .clone()
                .unwrap_or_else(|| alert.strategy_id.clone()),
            description: None,
            is_active: true,
            sizing,
            created_at: received_at,
        })
        .await
    {
        Ok(strategy) => strategy,
        Err(err) => {
            warn!("Failed to ensure strategy {}: {}", alert.strategy_id, err);
            return storage_unavailable();
        }
    };

    let signal = Signal {
        trade_id: alert.trade_id.clone(),
        strategy_id: alert.strategy_id.clone(),
        symbol: alert.symbol.clone(),
        side: alert.side,
        event: alert.event,
        signal_time: alert.signal_time,
        signal_price: alert.signal_price,
        requested_qty: alert.requested_qty,
        requested_notional: alert.requested_notional,
        payload_json: body,
        received_at,
    };

    let newly_recorded = match db.insert_signal(&signal).await {
        Ok(inserted) => inserted,
        Err(err) => {
            warn!("Failed to persist signal {}: {}", signal.trade_id, err);
            return storage_unavailable();
        }
    };

    let duplicate = !newly_recorded;
    // On re-delivery the stored signal is authoritative; a mutated duplicate
    // must not change what gets submitted.
    let signal = if duplicate {
        match db.get_signal(&signal.trade_id).await {
            Ok(Some(stored)) => stored,
            _ => signal,
        }
    } else {
        signal
    };

    // The submitter is idempotent on trade_id, so duplicates (at-least-once
    // delivery) fall through the same path: an existing order is returned
    // unchanged and the broker is not contacted again.
    let alpaca = match AlpacaClient::new(
        &state.http,
        &state.settings.broker_credentials(),
        &state.settings_map,
    ) {
        Ok(client) => client,
        Err(err) => {
            warn!("Broker client unavailable: {}", err);
            log_webhook_request(&db, &headers, received_at, true, "broker_unavailable").await;
            let order = db.get_order(&signal.trade_id).await.ok().flatten();
            return (
                StatusCode::OK,
                Json(webhook_response(&signal.trade_id, duplicate, order.as_ref())),
            )
                .into_response();
        }
    };

    let submitter = OrderSubmitter::new(&db, &alpaca);
    let order = match submitter.submit(&strategy, &signal).await {
        Ok(order) => Some(order),
        Err(err) => {
            warn!("Order submission failed for {}: {}", signal.trade_id, err);
            None
        }
    };

    let reason = if duplicate { "duplicate" } else { "ok" };
    log_webhook_request(&db, &headers, received_at, true, reason).await;
    (
        StatusCode::OK,
        Json(webhook_response(&signal.trade_id, duplicate, order.as_ref())),
    )
        .into_response()
}

fn webhook_response(trade_id: &str, duplicate: bool, order: Option<&Order>) -> Value {
    json!({
        "ok": true,
        "trade_id": trade_id,
        "duplicate": duplicate,
        "order": order.map(|o| json!({
            "status": o.status.as_str(),
            "broker_order_id": o.broker_order_id,
            "filled_qty": o.filled_qty,
            "filled_avg_price": o.filled_avg_price,
            "error": o.last_error,
        })),
    })
}

#[derive(Debug, Deserialize)]
struct ScopeQuery {
    strategy_id: Option<String>,
    symbol: Option<String>,
}

async fn list_positions(
    State(state): State<ServerState>,
    Query(scope): Query<ScopeQuery>,
) -> Response {
    let Ok(db) = state.app.database().await else {
        return storage_unavailable();
    };
    let positions = match db.get_positions(scope.strategy_id.as_deref()).await {
        Ok(positions) => positions,
        Err(err) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()),
    };
    let positions: Vec<Position> = match scope.symbol {
        Some(symbol) => positions
            .into_iter()
            .filter(|p| p.symbol == symbol)
            .collect(),
        None => positions,
    };

    // Best-effort mark-to-market from the broker's account-wide positions.
    // Broker positions net every strategy together, so only the price is
    // taken from them, never the quantity.
    let price_by_symbol = broker_prices(&state).await;
    let rows: Vec<Value> = positions
        .iter()
        .map(|p| {
            let current_price = price_by_symbol.get(&p.symbol).copied();
            let unrealized = current_price
                .filter(|_| !p.is_flat())
                .map(|px| (px - p.avg_entry_price) * p.qty);
            json!({
                "strategy_id": p.strategy_id,
                "symbol": p.symbol,
                "qty": p.qty,
                "avg_entry_price": if p.is_flat() { None } else { Some(p.avg_entry_price) },
                "realized_pnl_usd": p.realized_pnl,
                "open_time": p.open_time,
                "status": if p.is_flat() { "flat" } else { "open" },
                "current_price": current_price,
                "unrealized_pl_usd": unrealized,
            })
        })
        .collect();

    (StatusCode::OK, Json(rows)).into_response()
}

/// Latest prices from the broker's position listing, keyed by symbol.
/// Empty when the broker is unreachable; reporting still works.
async fn broker_prices(state: &ServerState) -> HashMap<String, f64> {
    let Ok(alpaca) = AlpacaClient::new(
        &state.http,
        &state.settings.broker_credentials(),
        &state.settings_map,
    ) else {
        return HashMap::new();
    };
    match alpaca.fetch_positions().await {
        Ok(positions) => positions
            .into_iter()
            .filter_map(|p| {
                let symbol = p.symbol?;
                let price = p.current_price.filter(|px| px.is_finite() && *px > 0.0)?;
                Some((symbol.trim().to_uppercase(), price))
            })
            .collect(),
        Err(err) => {
            warn!("Failed to fetch broker positions for enrichment: {}", err);
            HashMap::new()
        }
    }
}

async fn list_round_trips(
    State(state): State<ServerState>,
    Query(scope): Query<ScopeQuery>,
) -> Response {
    let Ok(db) = state.app.database().await else {
        return storage_unavailable();
    };
    match db.get_round_trips(scope.strategy_id.as_deref()).await {
        Ok(trips) => {
            let trips: Vec<RoundTrip> = match scope.symbol {
                Some(symbol) => trips.into_iter().filter(|t| t.symbol == symbol).collect(),
                None => trips,
            };
            (StatusCode::OK, Json(trips)).into_response()
        }
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()),
    }
}

#[derive(Debug, Serialize)]
struct TradeView {
    trade_id: String,
    strategy_id: String,
    symbol: String,
    side: &'static str,
    event: &'static str,
    signal_time: DateTime<Utc>,
    signal_price: Option<f64>,
    order: Option<Value>,
}

/// Signal/order pairs joined on trade_id, newest first.
async fn list_trades(
    State(state): State<ServerState>,
    Query(scope): Query<ScopeQuery>,
) -> Response {
    let Ok(db) = state.app.database().await else {
        return storage_unavailable();
    };

    let (signals, mut preloaded) = match scope.strategy_id.as_deref() {
        Some(strategy_id) => {
            let signals = db.get_signals_for_strategy(strategy_id).await;
            let orders = db.get_orders_for_strategy(strategy_id).await;
            match (signals, orders) {
                (Ok(signals), Ok(orders)) => {
                    let by_trade: HashMap<String, Order> = orders
                        .into_iter()
                        .map(|o| (o.trade_id.clone(), o))
                        .collect();
                    (signals, Some(by_trade))
                }
                (Err(err), _) | (_, Err(err)) => {
                    return error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string())
                }
            }
        }
        None => match db.get_recent_signals(TRADE_LIST_LIMIT).await {
            Ok(signals) => (signals, None),
            Err(err) => {
                return error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string())
            }
        },
    };

    let mut rows = Vec::with_capacity(signals.len());
    for signal in signals {
        if let Some(symbol) = scope.symbol.as_deref() {
            if signal.symbol != symbol {
                continue;
            }
        }
        let order = match preloaded.as_mut() {
            Some(by_trade) => by_trade.remove(&signal.trade_id),
            None => match db.get_order(&signal.trade_id).await {
                Ok(order) => order,
                Err(err) => {
                    return error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string())
                }
            },
        };
        rows.push(TradeView {
            trade_id: signal.trade_id,
            strategy_id: signal.strategy_id,
            symbol: signal.symbol,
            side: signal.side.as_str(),
            event: signal.event.as_str(),
            signal_time: signal.signal_time,
            signal_price: signal.signal_price,
            order: order.map(|o| {
                json!({
                    "status": o.status.as_str(),
                    "broker_order_id": o.broker_order_id,
                    "submitted_at": o.submitted_at,
                    "filled_at": o.filled_at,
                    "filled_qty": o.filled_qty,
                    "filled_avg_price": o.filled_avg_price,
                    "error": o.last_error,
                })
            }),
        });
    }
    rows.sort_by(|a, b| b.signal_time.cmp(&a.signal_time));

    (StatusCode::OK, Json(rows)).into_response()
}

async fn list_strategies(State(state): State<ServerState>) -> Response {
    let Ok(db) = state.app.database().await else {
        return storage_unavailable();
    };
    let strategies = match db.get_strategies(false).await {
        Ok(strategies) => strategies,
        Err(err) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()),
    };

    let mut rows = Vec::with_capacity(strategies.len());
    for strategy in strategies {
        match build_report(&db, &state, &strategy).await {
            Ok(report) => rows.push(json!({
                "id": report.strategy.id,
                "name": report.strategy.name,
                "is_active": report.strategy.is_active,
                "open_positions_count": report.performance.open_positions_count,
                "trades_total": report.performance.trades_total,
                "wins": report.performance.wins,
                "losses": report.performance.losses,
                "win_rate": report.performance.win_rate,
                "net_pnl_usd": report.performance.net_pnl_usd,
                "profit_factor": report.performance.profit_factor,
                "max_drawdown_pct": report.performance.max_drawdown_pct,
                "buy_hold_pct": report.performance.buy_hold_pct,
            })),
            Err(err) => {
                return error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string())
            }
        }
    }

    (StatusCode::OK, Json(rows)).into_response()
}

async fn strategy_report(
    State(state): State<ServerState>,
    Path(strategy_id): Path<String>,
) -> Response {
    let Ok(db) = state.app.database().await else {
        return storage_unavailable();
    };
    let strategy = match db.get_strategy(&strategy_id).await {
        Ok(Some(strategy)) => strategy,
        Ok(None) => return error_response(StatusCode::NOT_FOUND, "strategy not found"),
        Err(err) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()),
    };

    match build_report(&db, &state, &strategy).await {
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()),
    }
}

async fn build_report(
    db: &Database,
    state: &ServerState,
    strategy: &Strategy,
) -> Result<StrategyReport> {
    let signals = db.get_signals_for_strategy(&strategy.id).await?;
    let positions = db.get_positions(Some(&strategy.id)).await?;
    let round_trips = db.get_round_trips(Some(&strategy.id)).await?;
    let initial_capital = account_equity(state).await;

    let performance = PerformanceCalculator::calculate_strategy(
        strategy,
        &round_trips,
        &positions,
        &signals,
        initial_capital,
    );

    Ok(StrategyReport {
        strategy: strategy.clone(),
        performance,
        positions,
        trades: round_trips,
    })
}

/// Start-of-day account equity, used as the comparable initial capital for
/// percentage metrics. Best effort: reporting works without the broker.
async fn account_equity(state: &ServerState) -> Option<f64> {
    let alpaca = AlpacaClient::new(
        &state.http,
        &state.settings.broker_credentials(),
        &state.settings_map,
    )
    .ok()?;
    match alpaca.fetch_account().await {
        Ok(account) => account.last_equity.or(account.equity),
        Err(err) => {
            warn!("Failed to fetch account equity: {}", err);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn received() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 15, 30, 45).unwrap()
    }

    #[test]
    fn parses_a_full_alert() {
        let body = json!({
            "token": "secret",
            "strategy_id": "s1",
            "strategy_name": "RSI Pullback",
            "symbol": "nvda",
            "side": "buy",
            "event": "entry",
            "intent_qty_type": "shares",
            "intent_qty_value": "10",
            "signal_price": "150.00",
            "signal_time": "2024-03-01T15:30:00Z",
            "trade_id": "t-1"
        });
        let alert = parse_webhook_alert(&body, received()).unwrap();
        assert_eq!(alert.symbol, "NVDA");
        assert_eq!(alert.side, SignalSide::Buy);
        assert_eq!(alert.event, SignalEvent::Entry);
        assert_eq!(alert.requested_qty, Some(10.0));
        assert_eq!(alert.requested_notional, None);
        assert_eq!(alert.signal_price, Some(150.0));
        assert_eq!(alert.trade_id, "t-1");
    }

    #[test]
    fn placeholders_in_numeric_fields_become_none() {
        let body = json!({
            "token": "secret",
            "strategy_id": "s1",
            "symbol": "NVDA",
            "side": "buy",
            "signal_price": "#close#",
        });
        let alert = parse_webhook_alert(&body, received()).unwrap();
        assert_eq!(alert.signal_price, None);
    }

    #[test]
    fn derives_a_trade_id_when_the_alert_omits_one() {
        let body = json!({
            "token": "secret",
            "strategy_id": "s1",
            "symbol": "NVDA",
            "side": "buy",
            "signal_time": "2024-03-01T15:30:05Z",
        });
        let alert = parse_webhook_alert(&body, received()).unwrap();
        assert_eq!(alert.trade_id, "s1_NVDA_entry_202403011530");

        // A second delivery of the same alert derives the same id.
        let again = parse_webhook_alert(&body, received()).unwrap();
        assert_eq!(alert.trade_id, again.trade_id);
    }

    #[test]
    fn event_defaults_follow_the_side() {
        let entry = json!({
            "token": "t", "strategy_id": "s1", "symbol": "NVDA", "side": "short"
        });
        assert_eq!(
            parse_webhook_alert(&entry, received()).unwrap().event,
            SignalEvent::Entry
        );

        let exit = json!({
            "token": "t", "strategy_id": "s1", "symbol": "NVDA", "side": "cover"
        });
        assert_eq!(
            parse_webhook_alert(&exit, received()).unwrap().event,
            SignalEvent::Exit
        );
    }

    #[test]
    fn missing_symbol_or_side_is_rejected() {
        let no_symbol = json!({ "token": "t", "strategy_id": "s1", "side": "buy" });
        assert!(parse_webhook_alert(&no_symbol, received()).is_err());

        let no_side = json!({ "token": "t", "strategy_id": "s1", "symbol": "NVDA" });
        assert!(parse_webhook_alert(&no_side, received()).is_err());

        let bad_side = json!({
            "token": "t", "strategy_id": "s1", "symbol": "NVDA", "side": "hold"
        });
        assert!(parse_webhook_alert(&bad_side, received()).is_err());
    }

    #[test]
    fn legacy_field_names_are_accepted() {
        let body = json!({
            "token": "secret",
            "strategy": "rsi_pullback",
            "symbol": "NVDA",
            "action": "sell_short",
            "price": 99.5,
            "quantity": 5,
            "timestamp": "2024-03-01 15:30:00",
        });
        let alert = parse_webhook_alert(&body, received()).unwrap();
        assert_eq!(alert.strategy_id, "rsi_pullback");
        assert_eq!(alert.side, SignalSide::Short);
        assert_eq!(alert.requested_qty, Some(5.0));
        assert_eq!(alert.signal_price, Some(99.5));
        assert_eq!(
            alert.signal_time,
            Utc.with_ymd_and_hms(2024, 3, 1, 15, 30, 0).unwrap()
        );
    }
}
