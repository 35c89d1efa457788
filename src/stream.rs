use crate::alpaca::parse_stream_update;
use crate::models::OrderUpdate;
use crate::retry::reconnect_backoff;
use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use log::{info, warn};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::connect_async;

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub url: String,
    pub api_key: String,
    pub api_secret: String,
}

/// Consumes the broker's `trade_updates` websocket and forwards every order
/// update to the reconciler. Reconnects forever with capped backoff; missed
/// events while disconnected are recovered by the periodic pull sync.
pub async fn run_trade_updates_stream(
    config: StreamConfig,
    tx: mpsc::Sender<OrderUpdate>,
) -> Result<()> {
    let mut attempt: u32 = 0;

    loop {
        match listen_once(&config, &tx).await {
            Ok(()) => {
                // Receiver dropped: the engine is shutting down.
                return Ok(());
            }
            Err(err) => {
                let delay = reconnect_backoff(attempt);
                warn!(
                    "Trade updates stream disconnected: {}. Reconnecting in {:.0?}.",
                    err, delay
                );
                tokio::time::sleep(delay).await;
                attempt = attempt.saturating_add(1).min(10);
            }
        }
    }
}

async fn listen_once(config: &StreamConfig, tx: &mpsc::Sender<OrderUpdate>) -> Result<()> {
    let (ws, _) = connect_async(config.url.as_str())
        .await
        .with_context(|| format!("failed to connect to {}", config.url))?;
    let (mut write, mut read) = ws.split();

    let auth = json!({
        "action": "auth",
        "key": config.api_key,
        "secret": config.api_secret,
    });
    write
        .send(Message::Text(auth.to_string()))
        .await
        .context("failed to send auth frame")?;

    let listen = json!({
        "action": "listen",
        "data": { "streams": ["trade_updates"] },
    });
    write
        .send(Message::Text(listen.to_string()))
        .await
        .context("failed to subscribe to trade_updates")?;

    info!("Listening for trade updates on {}", config.url);

    while let Some(frame) = read.next().await {
        let frame = frame.context("trade updates stream read failed")?;
        match frame {
            Message::Text(text) => match parse_stream_update(&text) {
                Ok(Some(update)) => {
                    if tx.send(update).await.is_err() {
                        return Ok(());
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    warn!("Dropping unparseable trade update: {}", err);
                }
            },
            Message::Binary(bytes) => {
                // Alpaca occasionally frames JSON as binary.
                match std::str::from_utf8(&bytes) {
                    Ok(text) => match parse_stream_update(text) {
                        Ok(Some(update)) => {
                            if tx.send(update).await.is_err() {
                                return Ok(());
                            }
                        }
                        Ok(None) => {}
                        Err(err) => {
                            warn!("Dropping unparseable trade update: {}", err);
                        }
                    },
                    Err(_) => warn!("Dropping non-UTF-8 binary frame from stream"),
                }
            }
            Message::Ping(payload) => {
                write
                    .send(Message::Pong(payload))
                    .await
                    .context("failed to answer ping")?;
            }
            Message::Close(frame) => {
                return Err(anyhow::anyhow!("stream closed by broker: {:?}", frame));
            }
            Message::Pong(_) | Message::Frame(_) => {}
        }
    }

    Err(anyhow::anyhow!("stream ended without a close frame"))
}
