//! Startup wiring for one collector route.
//!
//! [`Connector::new`] probes the collector, builds the sender and returns a
//! connector ready to drain inbound streams. Any startup failure means no
//! connector is created.

use tokio::sync::mpsc;
use tracing::info;

use crate::config::{ConfigError, ConnectorConfig};
use crate::forwarder::{self, ForwardStats};
use crate::message::InboundMessage;
use crate::probe::{probe, Dial, ProbeError, TransportDialer};
use crate::route::Route;
use crate::sender::{FluentSender, Sender, SenderConfig};

/// Errors that prevent a connector from being created.
#[derive(Debug)]
pub enum ConnectorError {
    /// Malformed configuration or route
    Config(ConfigError),

    /// The collector could not be reached at startup
    ConnectionUnavailable(ProbeError),
}

impl std::fmt::Display for ConnectorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectorError::Config(e) => write!(f, "{}", e),
            ConnectorError::ConnectionUnavailable(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ConnectorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConnectorError::Config(e) => Some(e),
            ConnectorError::ConnectionUnavailable(e) => Some(e),
        }
    }
}

impl From<ConfigError> for ConnectorError {
    fn from(err: ConfigError) -> Self {
        ConnectorError::Config(err)
    }
}

impl From<ProbeError> for ConnectorError {
    fn from(err: ProbeError) -> Self {
        ConnectorError::ConnectionUnavailable(err)
    }
}

/// Forwards inbound streams to one collector.
pub struct Connector<S = FluentSender> {
    route: Route,
    config: ConnectorConfig,
    sender: S,
}

impl Connector<FluentSender> {
    /// Probe the collector and build a Fluentd sender for `route`.
    ///
    /// # Errors
    ///
    /// Returns `ConnectorError::ConnectionUnavailable` when every startup dial
    /// attempt fails.
    pub async fn new(route: Route, config: ConnectorConfig) -> Result<Self, ConnectorError> {
        Self::with_dialer(route, config, &TransportDialer).await
    }

    /// Like [`Connector::new`], probing with a custom dialer.
    pub async fn with_dialer<D>(
        route: Route,
        config: ConnectorConfig,
        dialer: &D,
    ) -> Result<Self, ConnectorError>
    where
        D: Dial + ?Sized,
    {
        probe(
            dialer,
            &route,
            config.connection_max_retries,
            config.connection_retry_wait,
        )
        .await?;

        let sender_config = SenderConfig::new(&route, &config);
        info!(
            route = %route,
            buffer_limit = sender_config.buffer_limit,
            retry_wait_ms = sender_config.retry_wait.as_millis() as u64,
            max_retries = sender_config.max_retries,
            async_connect = sender_config.async_connect,
            subsecond_precision = sender_config.subsecond_precision,
            request_ack = sender_config.request_ack,
            write_timeout_secs = sender_config.write_timeout.as_secs(),
            "Fluentd sender configured"
        );

        Ok(Self::with_sender(
            route,
            config,
            FluentSender::new(sender_config),
        ))
    }
}

impl<S: Sender> Connector<S> {
    /// Build a connector around an existing sender, without probing.
    pub fn with_sender(route: Route, config: ConnectorConfig, sender: S) -> Self {
        Self {
            route,
            config,
            sender,
        }
    }

    /// Forward `inbound` until the producer closes it.
    pub async fn stream(&self, inbound: mpsc::Receiver<InboundMessage>) -> ForwardStats {
        forwarder::run(inbound, &self.config, &self.sender).await
    }

    /// Get the collector route.
    pub fn route(&self) -> &Route {
        &self.route
    }

    /// Get the connector configuration.
    pub fn config(&self) -> &ConnectorConfig {
        &self.config
    }

    /// Get the sender.
    pub fn sender(&self) -> &S {
        &self.sender
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sender::codec::decode_message;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn fast_config() -> ConnectorConfig {
        ConnectorConfig {
            connection_max_retries: 1,
            connection_retry_wait: Duration::from_millis(10),
            retry_wait: Duration::from_millis(10),
            max_retries: 2,
            ..ConnectorConfig::default()
        }
    }

    #[tokio::test]
    async fn test_unreachable_collector_fails_startup() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let result = Connector::new(Route::parse(&address).unwrap(), fast_config()).await;

        match result {
            Err(ConnectorError::ConnectionUnavailable(ProbeError::ConnectionUnavailable {
                attempts,
                ..
            })) => assert_eq!(attempts, 2),
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("connector should not be created"),
        }
    }

    #[tokio::test]
    async fn test_connector_forwards_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let collector = tokio::spawn(async move {
            let mut received = Vec::new();
            // The first connection is the startup probe.
            loop {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut buf = Vec::new();
                socket.read_to_end(&mut buf).await.unwrap();
                let mut rd = buf.as_slice();
                while let Some(msg) = decode_message(&mut rd) {
                    received.push(msg);
                }
                if !received.is_empty() {
                    return received;
                }
            }
        });

        let config = ConnectorConfig {
            tag_suffix_label: "svc".to_string(),
            ..fast_config()
        };
        let connector = Connector::new(Route::parse(&address).unwrap(), config)
            .await
            .unwrap();

        let (tx, rx) = mpsc::channel(8);
        tx.send(InboundMessage::new("c1", "web1", "hello").with_label("svc", "api"))
            .await
            .unwrap();
        tx.send(InboundMessage::new("c1", "web1", "  ")).await.unwrap();
        drop(tx);

        let stats = connector.stream(rx).await;
        assert_eq!(stats.posted, 1);
        assert_eq!(stats.skipped, 1);
        connector.sender().close().await.unwrap();

        let received = collector.await.unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].tag, "docker.api");
        assert_eq!(received[0].record[0].1, "hello");
    }

    #[test]
    fn test_connector_error_display() {
        let err: ConnectorError = ConfigError::new("invalid fluentd address x").into();
        assert_eq!(
            err.to_string(),
            "Configuration error: invalid fluentd address x"
        );
    }
}
