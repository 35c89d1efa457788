use crate::error::EngineError;
use crate::models::{OrderSide, OrderStatus, OrderUpdate};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use log::warn;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Client, StatusCode};
use serde::de::{self, DeserializeOwned, Deserializer, Visitor};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tokio::time::sleep;

const ALPACA_PAPER_URL_SETTING: &str = "ALPACA_PAPER_URL";
const ALPACA_LIVE_URL_SETTING: &str = "ALPACA_LIVE_URL";
const ORDER_QUERY_LIMIT: &str = "500";
const ORDER_QUERY_LIMIT_NUM: usize = 500;
const ORDER_MAX_PAGES: usize = 100;
const REQUEST_DELAY: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct BrokerCredentials {
    pub environment: String,
    pub api_key: String,
    pub api_secret: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct NewOrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    /// The trade id; the broker treats retried submissions with the same
    /// client order id as the same order.
    pub client_order_id: String,
    pub qty: Option<f64>,
    pub notional: Option<f64>,
}

pub struct AlpacaClient<'a> {
    http: &'a Client,
    base_url: String,
    headers: HeaderMap,
}

impl<'a> AlpacaClient<'a> {
    pub fn new(
        http: &'a Client,
        creds: &BrokerCredentials,
        settings: &HashMap<String, String>,
    ) -> Result<Self> {
        let base_url = resolve_alpaca_base_url(&creds.environment, settings)?;

        let mut headers = HeaderMap::new();
        headers.insert(
            "APCA-API-KEY-ID",
            HeaderValue::from_str(&creds.api_key).context("invalid Alpaca API key")?,
        );
        headers.insert(
            "APCA-API-SECRET-KEY",
            HeaderValue::from_str(&creds.api_secret).context("invalid Alpaca API secret")?,
        );

        Ok(Self {
            http,
            base_url,
            headers,
        })
    }

    /// Submits a day market order. Safe to retry: the broker collapses
    /// repeated submissions carrying the same client order id into one
    /// order. Rejections are terminal; transport failures are transient and
    /// left for the pull sync to resolve.
    pub async fn submit_market_order(
        &self,
        request: &NewOrderRequest,
    ) -> Result<AlpacaOrder, EngineError> {
        let mut body = serde_json::json!({
            "symbol": request.symbol,
            "side": request.side.as_str(),
            "type": "market",
            "time_in_force": "day",
            "client_order_id": request.client_order_id,
        });
        if let Some(qty) = request.qty {
            body["qty"] = serde_json::json!(format!("{}", qty));
        } else if let Some(notional) = request.notional {
            body["notional"] = serde_json::json!(format!("{}", notional));
        }

        let url = format!("{}/orders", self.base_url);
        let response = self
            .http
            .post(url)
            .headers(self.headers.clone())
            .json(&body)
            .send()
            .await
            .map_err(|err| EngineError::BrokerTransport(err.to_string()))?;

        let status = response.status();
        if status.is_client_error() {
            let detail = response
                .text()
                .await
                .unwrap_or_else(|_| status.to_string());
            return Err(EngineError::BrokerRejected(detail));
        }
        if !status.is_success() {
            let detail = response
                .text()
                .await
                .unwrap_or_else(|_| status.to_string());
            return Err(EngineError::BrokerTransport(detail));
        }

        response
            .json::<AlpacaOrder>()
            .await
            .map_err(|err| EngineError::BrokerTransport(format!("invalid order response: {}", err)))
    }

    /// Looks an order up by the client order id (our trade id), falling back
    /// to the broker-assigned id path for orders created before the client
    /// id was recorded.
    pub async fn fetch_order_by_client_id(&self, client_order_id: &str) -> Result<Option<AlpacaOrder>> {
        let trimmed = client_order_id.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }
        self.get_optional(&format!("/orders:by_client_order_id/{}", trimmed))
            .await
    }

    pub async fn fetch_order(&self, broker_order_id: &str) -> Result<Option<AlpacaOrder>> {
        let trimmed = broker_order_id.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }
        self.get_optional(&format!("/orders/{}", trimmed)).await
    }

    /// All orders the broker reports for the sync window, paged. Includes
    /// closed orders so fills missed by the push stream are recovered.
    pub async fn fetch_orders_since(&self, after: DateTime<Utc>) -> Result<Vec<AlpacaOrder>> {
        let mut all_orders = Vec::new();
        let mut after_order_id: Option<String> = None;
        let mut pages = 0usize;
        let after_param = after.to_rfc3339();

        loop {
            if pages >= ORDER_MAX_PAGES {
                break;
            }
            pages += 1;

            let mut query_params = vec![
                ("status", "all"),
                ("direction", "asc"),
                ("limit", ORDER_QUERY_LIMIT),
                ("nested", "false"),
                ("after", after_param.as_str()),
            ];
            if let Some(after_id) = after_order_id.as_deref() {
                query_params.push(("after_order_id", after_id));
            }

            let entries: Vec<AlpacaOrder> = self.get_with_query("/orders", &query_params).await?;
            if entries.is_empty() {
                break;
            }

            let is_last_page = entries.len() < ORDER_QUERY_LIMIT_NUM;
            let last_id = entries.iter().rev().find_map(|entry| {
                entry
                    .id
                    .as_deref()
                    .map(str::trim)
                    .filter(|id| !id.is_empty())
                    .map(str::to_string)
            });
            all_orders.extend(entries);

            if is_last_page {
                break;
            }

            if let Some(last_id) = last_id {
                after_order_id = Some(last_id);
            } else {
                break;
            }
        }

        Ok(all_orders)
    }

    /// Account-wide broker positions. These net every strategy together and
    /// are only used for price enrichment, never for strategy accounting.
    pub async fn fetch_positions(&self) -> Result<Vec<AlpacaPosition>> {
        self.get("/positions").await
    }

    pub async fn fetch_account(&self) -> Result<AlpacaAccount> {
        self.get("/account").await
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        sleep(REQUEST_DELAY).await;
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .http
            .get(url)
            .headers(self.headers.clone())
            .send()
            .await
            .with_context(|| format!("GET {}{} failed", self.base_url, path))?
            .error_for_status()
            .with_context(|| format!("GET {}{} returned error", self.base_url, path))?;
        let value = response
            .json::<T>()
            .await
            .context("failed to parse Alpaca response")?;
        Ok(value)
    }

    async fn get_optional<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        sleep(REQUEST_DELAY).await;
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .http
            .get(url)
            .headers(self.headers.clone())
            .send()
            .await
            .with_context(|| format!("request {} failed", path))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let response = response.error_for_status()?;
        let payload = response
            .json::<T>()
            .await
            .context("failed to parse Alpaca response")?;
        Ok(Some(payload))
    }

    async fn get_with_query<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T> {
        sleep(REQUEST_DELAY).await;
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .http
            .get(url)
            .headers(self.headers.clone())
            .query(query)
            .send()
            .await
            .with_context(|| format!("GET {}{} with query failed", self.base_url, path))?
            .error_for_status()
            .with_context(|| format!("GET {}{} returned error", self.base_url, path))?;
        let value = response
            .json::<T>()
            .await
            .context("failed to parse Alpaca response")?;
        Ok(value)
    }
}

fn resolve_alpaca_base_url(
    environment: &str,
    settings: &HashMap<String, String>,
) -> Result<String> {
    let is_live = environment.trim().eq_ignore_ascii_case("live");
    let setting_key = if is_live {
        ALPACA_LIVE_URL_SETTING
    } else {
        ALPACA_PAPER_URL_SETTING
    };
    let configured = settings
        .get(setting_key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty());
    match configured {
        Some(value) => Ok(value.trim_end_matches('/').to_string()),
        None => Err(anyhow!("Missing required setting {}", setting_key)),
    }
}

#[derive(Debug, Deserialize)]
pub struct AlpacaAccount {
    #[serde(default, deserialize_with = "deserialize_f64_opt")]
    pub cash: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_f64_opt")]
    pub equity: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_f64_opt")]
    pub last_equity: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct AlpacaPosition {
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub side: Option<String>,
    #[serde(default, deserialize_with = "deserialize_f64_opt")]
    pub qty: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_f64_opt")]
    pub avg_entry_price: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_f64_opt")]
    pub current_price: Option<f64>,
}

/// Broker order payload. Every field is optional and numbers may arrive as
/// strings; `to_update` is the typed boundary where unknown statuses fail
/// loudly instead of defaulting.
#[derive(Debug, Clone, Deserialize)]
pub struct AlpacaOrder {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub client_order_id: Option<String>,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub side: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default, deserialize_with = "deserialize_f64_opt")]
    pub qty: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_f64_opt")]
    pub filled_qty: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_f64_opt")]
    pub filled_avg_price: Option<f64>,
    #[serde(default)]
    pub submitted_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub filled_at: Option<String>,
}

impl AlpacaOrder {
    pub fn normalized_status(&self) -> Result<OrderStatus> {
        let raw = self
            .status
            .as_deref()
            .unwrap_or("unknown")
            .trim()
            .to_lowercase();
        match raw.as_str() {
            "new" | "accepted" | "pending_new" | "accepted_for_bidding" | "calculated" => {
                Ok(OrderStatus::Accepted)
            }
            "partially_filled" => Ok(OrderStatus::PartiallyFilled),
            "filled" | "done_for_day" => Ok(OrderStatus::Filled),
            "canceled" | "cancelled" | "expired" | "stopped" | "suspended" | "pending_cancel"
            | "replaced" | "pending_replace" => Ok(OrderStatus::Canceled),
            "rejected" => Ok(OrderStatus::Rejected),
            other => Err(anyhow!("Unknown broker order status '{}'", other)),
        }
    }

    pub fn broker_id(&self) -> Result<String> {
        self.id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .ok_or_else(|| anyhow!("broker order payload is missing an id"))
    }

    pub fn submitted_timestamp(&self) -> Option<DateTime<Utc>> {
        parse_timestamp(self.submitted_at.as_deref())
    }

    /// Converts the payload into the reconciler's update type. Returns an
    /// error for unknown statuses or a missing order id.
    pub fn to_update(&self) -> Result<OrderUpdate> {
        let status = self.normalized_status()?;
        let broker_order_id = self.broker_id()?;
        let raw_json = serde_json::json!({
            "id": broker_order_id,
            "client_order_id": self.client_order_id,
            "status": self.status,
            "filled_qty": self.filled_qty,
            "filled_avg_price": self.filled_avg_price,
            "updated_at": self.updated_at,
        })
        .to_string();

        Ok(OrderUpdate {
            trade_id: self
                .client_order_id
                .as_deref()
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(str::to_string),
            broker_order_id,
            status,
            filled_qty: self.filled_qty.unwrap_or(0.0),
            filled_avg_price: self.filled_avg_price,
            updated_at: parse_timestamp(self.updated_at.as_deref()),
            filled_at: parse_timestamp(self.filled_at.as_deref()),
            raw_json,
        })
    }
}

fn deserialize_f64_opt<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    struct F64OptVisitor;

    impl<'de> Visitor<'de> for F64OptVisitor {
        type Value = Option<f64>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a number or string")
        }

        fn visit_none<E>(self) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(None)
        }

        fn visit_unit<E>(self) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(None)
        }

        fn visit_f64<E>(self, value: f64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(Some(value))
        }

        fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(Some(value as f64))
        }

        fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(Some(value as f64))
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(value.trim().parse::<f64>().ok())
        }

        fn visit_string<E>(self, value: String) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(value.trim().parse::<f64>().ok())
        }
    }

    deserializer.deserialize_any(F64OptVisitor)
}

fn parse_timestamp(raw: Option<&str>) -> Option<DateTime<Utc>> {
    raw.and_then(|value| {
        DateTime::parse_from_rfc3339(value)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
    })
}

/// Parses one `trade_updates` stream payload into an order update. The
/// stream wraps the order in `{"stream": "trade_updates", "data": {"event":
/// ..., "order": {...}}}`.
pub fn parse_stream_update(raw: &str) -> Result<Option<OrderUpdate>> {
    let value: serde_json::Value =
        serde_json::from_str(raw).context("trade update payload is not valid JSON")?;

    let stream = value.get("stream").and_then(|s| s.as_str()).unwrap_or("");
    if stream != "trade_updates" {
        return Ok(None);
    }

    let Some(order_value) = value.pointer("/data/order") else {
        warn!("trade_updates payload without an order object: {}", raw);
        return Ok(None);
    };

    let order: AlpacaOrder = serde_json::from_value(order_value.clone())
        .context("trade update order payload has an unexpected shape")?;
    order.to_update().map(Some)
}
