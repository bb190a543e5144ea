//! Fluentd Forwarder Library
//!
//! This library relays container log lines to a Fluentd collector:
//!
//! - **config**: Environment-based configuration for the connector
//! - **route**: Collector route parsing (`fluentd://host:port`)
//! - **message**: Inbound container messages and outbound records
//! - **transform**: Blank-line filtering, routing tags and record construction
//! - **probe**: Bounded-retry startup dial of the collector
//! - **sender**: Fluentd forward protocol client with buffering and retry
//! - **forwarder**: The loop draining an inbound stream into the sender
//! - **connector**: Startup wiring of probe, sender and loop
//!
//! # Example
//!
//! ```no_run
//! use fluentd_forwarder::config::ConnectorConfig;
//! use fluentd_forwarder::connector::Connector;
//! use fluentd_forwarder::message::InboundMessage;
//! use fluentd_forwarder::route::Route;
//! use tokio::sync::mpsc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = ConnectorConfig::from_env().expect("Failed to load config");
//!     let route = Route::parse("fluentd://localhost:24224").expect("Invalid route");
//!
//!     let connector = Connector::new(route, config)
//!         .await
//!         .expect("Collector unavailable");
//!
//!     let (tx, rx) = mpsc::channel(1000);
//!     tx.send(InboundMessage::new("abc123", "web1", "hello")).await.ok();
//!     drop(tx);
//!
//!     connector.stream(rx).await;
//! }
//! ```

// Module declarations
pub mod config;
pub mod connector;
pub mod forwarder;
pub mod message;
pub mod probe;
pub mod route;
pub mod sender;
pub mod transform;

// Re-export commonly used types at crate root for convenience
pub use config::{ConfigError, ConnectorConfig};
pub use connector::{Connector, ConnectorError};
pub use forwarder::ForwardStats;
pub use message::{InboundMessage, Record};
pub use probe::{Dial, ProbeError, TransportDialer};
pub use route::{Route, Transport};
pub use sender::{FluentSender, SendError, Sender, SenderConfig, SenderStats};
pub use transform::{transform, Envelope};
