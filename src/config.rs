use crate::alpaca::BrokerCredentials;
use anyhow::{anyhow, Result};
use std::collections::HashMap;

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_SYNC_INTERVAL_SECS: u64 = 60;
const DEFAULT_SYNC_LOOKBACK_DAYS: i64 = 10;
const DEFAULT_BROKER_TIMEOUT_SECS: u64 = 30;

/// Typed view of the `settings` table. Secrets may be stored encrypted; by
/// the time they reach this struct they are plaintext.
#[derive(Debug, Clone)]
pub struct EngineRuntimeSettings {
    pub webhook_token: String,
    pub bind_addr: String,
    pub broker_environment: String,
    pub broker_api_key: String,
    pub broker_api_secret: String,
    /// Cadence of the pull sync that closes gaps left by missed push
    /// events.
    pub order_sync_interval_secs: u64,
    /// How far back the pull sync asks the broker for orders.
    pub order_sync_lookback_days: i64,
    pub broker_request_timeout_secs: u64,
    /// Websocket endpoint for trade updates. When absent the engine runs on
    /// pull sync alone.
    pub stream_url: Option<String>,
}

impl EngineRuntimeSettings {
    pub fn from_settings_map(settings: &HashMap<String, String>) -> Result<Self> {
        let webhook_token = require_setting(settings, "WEBHOOK_TOKEN")?.to_string();
        let broker_api_key = require_setting(settings, "ALPACA_API_KEY")?.to_string();
        let broker_api_secret = require_setting(settings, "ALPACA_API_SECRET")?.to_string();
        let broker_environment =
            optional_setting(settings, "ALPACA_ENVIRONMENT", "paper").to_string();
        let bind_addr = optional_setting(settings, "WEBHOOK_BIND_ADDR", DEFAULT_BIND_ADDR).to_string();
        let order_sync_interval_secs = optional_setting_u64(
            settings,
            "ORDER_SYNC_INTERVAL_SECS",
            DEFAULT_SYNC_INTERVAL_SECS,
        )?;
        let order_sync_lookback_days = optional_setting_u64(
            settings,
            "ORDER_SYNC_LOOKBACK_DAYS",
            DEFAULT_SYNC_LOOKBACK_DAYS as u64,
        )? as i64;
        let broker_request_timeout_secs = optional_setting_u64(
            settings,
            "BROKER_REQUEST_TIMEOUT_SECS",
            DEFAULT_BROKER_TIMEOUT_SECS,
        )?;
        let stream_url = settings
            .get("ALPACA_STREAM_URL")
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());

        if order_sync_interval_secs == 0 {
            return Err(anyhow!("ORDER_SYNC_INTERVAL_SECS must be greater than zero"));
        }

        Ok(Self {
            webhook_token,
            bind_addr,
            broker_environment,
            broker_api_key,
            broker_api_secret,
            order_sync_interval_secs,
            order_sync_lookback_days,
            broker_request_timeout_secs,
            stream_url,
        })
    }

    pub fn broker_credentials(&self) -> BrokerCredentials {
        BrokerCredentials {
            environment: self.broker_environment.clone(),
            api_key: self.broker_api_key.clone(),
            api_secret: self.broker_api_secret.clone(),
        }
    }
}

fn require_setting<'a>(settings: &'a HashMap<String, String>, key: &str) -> Result<&'a str> {
    settings
        .get(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| anyhow!("Missing required setting {}", key))
}

fn optional_setting<'a>(
    settings: &'a HashMap<String, String>,
    key: &str,
    default: &'a str,
) -> &'a str {
    settings
        .get(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .unwrap_or(default)
}

fn optional_setting_u64(
    settings: &HashMap<String, String>,
    key: &str,
    default: u64,
) -> Result<u64> {
    let Some(raw) = settings
        .get(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
    else {
        return Ok(default);
    };
    raw.parse::<u64>()
        .map_err(|_| anyhow!("Setting {} must be a non-negative integer (value: {})", key, raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_settings() -> HashMap<String, String> {
        let mut settings = HashMap::new();
        settings.insert("WEBHOOK_TOKEN".to_string(), "secret".to_string());
        settings.insert("ALPACA_API_KEY".to_string(), "key".to_string());
        settings.insert("ALPACA_API_SECRET".to_string(), "sec".to_string());
        settings
    }

    #[test]
    fn defaults_apply_when_optional_settings_are_absent() {
        let parsed = EngineRuntimeSettings::from_settings_map(&base_settings()).unwrap();
        assert_eq!(parsed.broker_environment, "paper");
        assert_eq!(parsed.bind_addr, DEFAULT_BIND_ADDR);
        assert_eq!(parsed.order_sync_interval_secs, DEFAULT_SYNC_INTERVAL_SECS);
        assert!(parsed.stream_url.is_none());
    }

    #[test]
    fn missing_webhook_token_is_an_error() {
        let mut settings = base_settings();
        settings.remove("WEBHOOK_TOKEN");
        let error = EngineRuntimeSettings::from_settings_map(&settings).unwrap_err();
        assert!(error.to_string().contains("WEBHOOK_TOKEN"));
    }

    #[test]
    fn malformed_interval_is_an_error() {
        let mut settings = base_settings();
        settings.insert(
            "ORDER_SYNC_INTERVAL_SECS".to_string(),
            "soon".to_string(),
        );
        assert!(EngineRuntimeSettings::from_settings_map(&settings).is_err());
    }
}
