//! Device Telemetry Example
//!
//! Subscribes to the latest time series of one device and prints every update
//! until Ctrl-C.
//!
//! Run with:
//! `TB_API=https://iot.example.com TB_TOKEN=<jwt> TB_DEVICE=<uuid> cargo run -p telemetry-ws --example device_telemetry`

use std::sync::Arc;

use telemetry_ws::{
    Command, ConnectionStatus, EntityRef, StaticTokenProvider, Subscriber, TelemetryClient,
    TelemetryConfig,
};

fn env(name: &str) -> Result<String, Box<dyn std::error::Error>> {
    std::env::var(name).map_err(|_| format!("{name} is not set").into())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = TelemetryConfig::from_api_endpoint(&env("TB_API")?)?;
    let tokens = Arc::new(StaticTokenProvider::new(env("TB_TOKEN")?));
    let client = TelemetryClient::with_tungstenite(config, tokens)?;

    client.add_status_listener(|status: ConnectionStatus| println!("status: {status}"));

    let device = EntityRef::device(env("TB_DEVICE")?);
    let _guard = client
        .subscribe(
            Subscriber::new([
                Command::timeseries(device.clone(), &["temperature", "humidity"]),
                Command::attributes(device, "SERVER_SCOPE", &["active", "lastActivityTime"]),
            ])
            .on_data(|msg| {
                if let Some(data) = &msg.data {
                    println!("update: {data}");
                }
            })
            .on_reconnected(|| println!("reconnected; cached values discarded")),
        )
        .await?;

    tokio::signal::ctrl_c().await?;
    client.close().await?;
    Ok(())
}
