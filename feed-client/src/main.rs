use anyhow::{Context, Result};
use feed_client::{ClientConfig, ConnectionManager, Reading, ReadingObserver};
use futures::SinkExt;
use pulse::wire::{self, Frame};
use rand::Rng;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "feed_client=info".into()),
        )
        .init();

    let config = ClientConfig::from_env()?;

    let mut args = std::env::args().skip(1);
    let mode = args.next().unwrap_or_else(|| "tap".to_string());
    let symbol = args.next();

    match mode.as_str() {
        "tap" => tap(config, symbol.as_deref()).await,
        "emit" => emit(config, symbol.as_deref()).await,
        other => anyhow::bail!("Unknown mode '{}', expected 'tap' or 'emit'", other),
    }
}

/// Follow the feed and log each new matching reading.
async fn tap(config: ClientConfig, symbol: Option<&str>) -> Result<()> {
    info!(url = %config.relay_url, symbol = ?symbol, "Tapping the feed");

    let manager = Arc::new(ConnectionManager::new(config));
    let observer = ReadingObserver::new(Arc::clone(&manager), symbol);

    let mut last: Option<Reading> = None;
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let current = observer.reading();
                if current != last {
                    if let Some(reading) = &current {
                        info!(
                            symbol = ?reading.symbol,
                            status = ?observer.status(),
                            fields = %serde_json::Value::Object(reading.fields.clone()),
                            "Reading"
                        );
                    }
                    last = current;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                manager.disconnect();
                return Ok(());
            }
        }
    }
}

/// Emit synthetic readings so a relay (and anything tapping it) has data.
async fn emit(config: ClientConfig, symbol: Option<&str>) -> Result<()> {
    let count: u32 = std::env::var("FEED_EMIT_COUNT")
        .unwrap_or_else(|_| "10".to_string())
        .parse()
        .context("FEED_EMIT_COUNT must be a number")?;
    let interval_seconds: u64 = std::env::var("FEED_EMIT_INTERVAL_SECONDS")
        .unwrap_or_else(|_| "5".to_string())
        .parse()
        .context("FEED_EMIT_INTERVAL_SECONDS must be a number")?;

    info!(
        url = %config.relay_url,
        count,
        interval_seconds,
        "Emitting synthetic readings"
    );

    let (mut stream, _) = connect_async(config.relay_url.as_str())
        .await
        .context("Failed to connect to relay")?;

    for sequence in 0..count {
        let frame = synthetic_reading(symbol, sequence);
        let payload = wire::encode(&frame);
        stream
            .send(Message::text(payload.clone()))
            .await
            .context("Failed to send reading")?;
        info!(sequence, payload = %payload, "Reading sent");

        if sequence + 1 < count {
            tokio::time::sleep(Duration::from_secs(interval_seconds)).await;
        }
    }

    stream.close(None).await.ok();
    Ok(())
}

/// One synthetic environment reading, rounded the way the hardware reports.
fn synthetic_reading(symbol: Option<&str>, sequence: u32) -> Frame {
    let mut rng = rand::thread_rng();
    let mut fields = serde_json::Map::new();
    fields.insert(
        "temperature".to_string(),
        json!(round2(rng.gen_range(18.0..32.0))),
    );
    fields.insert(
        "humidity".to_string(),
        json!(round2(rng.gen_range(30.0..80.0))),
    );
    fields.insert(
        "light".to_string(),
        json!(round2(rng.gen_range(100.0..1000.0))),
    );
    fields.insert("sequence".to_string(), json!(sequence));
    fields.insert("timestamp".to_string(), json!(chrono::Utc::now().to_rfc3339()));

    Frame::Emit(Reading {
        symbol: symbol.map(str::to_string),
        fields,
    })
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
