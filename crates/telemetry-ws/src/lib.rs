//! # telemetry-ws
//!
//! Real-time subscriptions for IoT telemetry over a single WebSocket.
//!
//! Many independent subscriptions (time series, attributes, entity-data and
//! alarm queries, counters, notifications) share one authenticated
//! connection. The engine allocates command ids, batches outbound commands,
//! routes inbound updates back to their subscriber, and on connection loss
//! reconnects and re-issues every live subscription under fresh ids.
//!
//! ## Features
//!
//! - **Multiplexing**: one socket, any number of subscribers, each with
//!   optional data/update/reconnected callbacks
//! - **Resilience**: automatic reconnect with configurable backoff, token
//!   refresh through a pluggable [`TokenProvider`], forced reconnect on
//!   in-band session errors
//! - **Observability**: [`ConnectionStatus`] listeners and structured
//!   `tracing` logs
//! - **Pluggable transport**: [`Connector`] seam with a `tokio-tungstenite`
//!   implementation
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use telemetry_ws::{
//!     Command, ConnectionStatus, EntityRef, StaticTokenProvider, Subscriber, TelemetryClient,
//!     TelemetryConfig,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = TelemetryConfig::from_api_endpoint("https://iot.example.com")?;
//!     let client = TelemetryClient::with_tungstenite(
//!         config,
//!         Arc::new(StaticTokenProvider::new("eyJhbGciOi...")),
//!     )?;
//!
//!     client.add_status_listener(|status: ConnectionStatus| println!("status: {status}"));
//!
//!     let _guard = client
//!         .subscribe(
//!             Subscriber::new([Command::timeseries(
//!                 EntityRef::device("0d4c6f0e-5e0b-11ef-9c3a-0242ac120002"),
//!                 &["temperature", "humidity"],
//!             )])
//!             .on_data(|msg| println!("latest: {:?}", msg.data))
//!             .on_reconnected(|| println!("connection restored")),
//!         )
//!         .await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     client.close().await?;
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod client;
pub mod command;
pub mod config;
mod engine;
pub mod error;
mod queue;
mod reconnect;
mod registry;
mod router;
pub mod status;
pub mod subscriber;
pub mod transport;

// Re-export commonly used types
pub use auth::{StaticTokenProvider, TokenProvider};
pub use client::{SubscriptionGuard, TelemetryClient};
pub use command::{Command, CommandId, CommandKind, EntityRef, Envelope, UnsubscribeForm};
pub use config::{TelemetryConfig, telemetry_url};
pub use engine::ConnectionEpoch;
pub use error::{TelemetryError, TelemetryResult};
pub use router::InboundMessage;
pub use status::{ConnectionStatus, ListenerId, StatusBroadcaster};
pub use subscriber::{Subscriber, SubscriberId};
pub use transport::{Connector, FrameStream, FrameWriter, TungsteniteConnector, WsMessage};
