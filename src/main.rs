//! Fluentd Forwarder - relays container logs to a Fluentd collector
//!
//! The host process writes one JSON-encoded container message per line to
//! stdin. Each non-blank message is tagged and forwarded to the collector named
//! by the route argument:
//!
//! ```text
//! fluentd-forwarder fluentd://<FLUENTD_IP>:<FLUENTD_PORT>
//! ```
//!
//! ## Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! - `CONNECTION_MAX_RETRIES`, `CONNECTION_RETRY_WAIT`: startup dial policy
//! - `FLUENTD_BUFFER_LIMIT`, `FLUENTD_RETRY_WAIT`, `FLUENTD_MAX_RETRIES`:
//!   sender buffering and retry
//! - `FLUENTD_ASYNC_CONNECT`, `FLUENTD_SUBSECOND_PRECISION`,
//!   `FLUENTD_REQUEST_ACK`, `FLUENTD_WRITE_TIMEOUT`: sender behavior
//! - `TAG_PREFIX`, `TAG_SUFFIX_LABEL`: routing tag
//! - `RUST_LOG`: Logging level filter (default: info, or debug with `DEBUG=true`)

use std::future::Future;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use fluentd_forwarder::config::ConnectorConfig;
use fluentd_forwarder::connector::Connector;
use fluentd_forwarder::message::InboundMessage;
use fluentd_forwarder::route::Route;

/// Channel capacity between the stdin reader and the forwarding loop
const CHANNEL_CAPACITY: usize = 1000;

/// Time allowed for flushing buffered records on shutdown
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() {
    init_tracing();

    let Some(uri) = std::env::args().nth(1) else {
        error!("Usage: fluentd-forwarder <fluentd://host:port>");
        std::process::exit(2);
    };

    let route = match Route::parse(&uri) {
        Ok(route) => route,
        Err(e) => {
            error!(error = %e, route = %uri, "Invalid route");
            std::process::exit(1);
        }
    };

    let config = match ConnectorConfig::from_env() {
        Ok(config) => {
            info!(
                tag_prefix = %config.tag_prefix,
                tag_suffix_label = %config.tag_suffix_label,
                connection_max_retries = config.connection_max_retries,
                "Configuration loaded"
            );
            config
        }
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            std::process::exit(1);
        }
    };

    let connector = match Connector::new(route, config).await {
        Ok(connector) => connector,
        Err(e) => {
            error!(error = %e, "Failed to start forwarder");
            std::process::exit(1);
        }
    };

    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

    let producer_handle = tokio::spawn(async move {
        run_producer(tokio::io::stdin(), tx).await;
    });

    info!(route = %connector.route(), "Forwarder running. Press Ctrl+C to stop.");
    let forward = connector.stream(rx);
    tokio::pin!(forward);

    tokio::select! {
        _ = &mut forward => {
            if let Err(e) = producer_handle.await {
                warn!(error = %e, "Producer task panicked");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received, closing inbound stream");
            producer_handle.abort();

            // Drain what is already queued, bounded by the shutdown timeout. A
            // second Ctrl+C exits without waiting.
            tokio::select! {
                _ = drain(&mut forward, SHUTDOWN_TIMEOUT) => {}
                _ = tokio::signal::ctrl_c() => {
                    warn!("Second shutdown signal received, exiting without flushing");
                    std::process::exit(130);
                }
            }
        }
    }

    match tokio::time::timeout(SHUTDOWN_TIMEOUT, connector.sender().close()).await {
        Ok(Ok(())) => info!("Sender flushed and closed"),
        Ok(Err(e)) => warn!(error = %e, "Sender closed with unflushed records"),
        Err(_) => warn!("Sender shutdown timed out after {:?}", SHUTDOWN_TIMEOUT),
    }

    let stats = connector.sender().stats();
    info!(
        frames_sent = stats.frames_sent,
        frames_dropped = stats.frames_dropped,
        write_failures = stats.write_failures,
        "Forwarder stopped"
    );

    // The stdin reader runs on a blocking thread that would keep the runtime
    // alive after an interrupt.
    std::process::exit(0);
}

/// Initialize the tracing subscriber with environment-based filtering.
fn init_tracing() {
    let debug = std::env::var("DEBUG").map(|v| v == "true").unwrap_or(false);
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(debug)));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();
}

fn default_filter(debug: bool) -> &'static str {
    if debug {
        "debug"
    } else {
        "info"
    }
}

/// Wait for the forwarding loop to finish, giving up after `limit`.
async fn drain<F: Future>(forward: F, limit: Duration) -> Option<F::Output> {
    match tokio::time::timeout(limit, forward).await {
        Ok(output) => Some(output),
        Err(_) => {
            warn!("Inbound stream drain timed out after {:?}", limit);
            None
        }
    }
}

/// Read JSON-lines messages from `input` into the inbound channel.
///
/// Blank and undecodable lines are skipped. Returns, closing the channel, on
/// end of input, a read error, or when the forwarding loop has gone away.
async fn run_producer<R>(input: R, tx: mpsc::Sender<InboundMessage>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(input).lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => continue,
            Ok(Some(line)) => match serde_json::from_str::<InboundMessage>(&line) {
                Ok(message) => {
                    if tx.send(message).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!(error = %e, "Skipping undecodable input line"),
            },
            Ok(None) => {
                info!("End of input, closing inbound stream");
                break;
            }
            Err(e) => {
                error!(error = %e, "Failed to read input");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter() {
        assert_eq!(default_filter(true), "debug");
        assert_eq!(default_filter(false), "info");
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_gives_up_after_limit() {
        let start = tokio::time::Instant::now();

        let result = drain(std::future::pending::<()>(), SHUTDOWN_TIMEOUT).await;

        assert!(result.is_none());
        assert!(start.elapsed() >= SHUTDOWN_TIMEOUT);
    }

    #[tokio::test]
    async fn test_drain_returns_loop_output() {
        assert_eq!(drain(async { 7 }, SHUTDOWN_TIMEOUT).await, Some(7));
    }

    #[tokio::test]
    async fn test_producer_skips_blank_and_undecodable_lines() {
        let input = concat!(
            r#"{"container_id":"c1","container_name":"web1","data":"first","timestamp":"2024-05-01T12:00:00Z"}"#,
            "\n",
            "   \n",
            "not json\n",
            r#"{"container_id":"c1"}"#,
            "\n",
            r#"{"container_id":"c2","container_name":"web2","container_labels":{"svc":"api"},"data":"second","source":"stderr","timestamp":"2024-05-01T12:00:01Z"}"#,
            "\n",
        );
        let (tx, mut rx) = mpsc::channel(8);

        run_producer(input.as_bytes(), tx).await;

        let first = rx.recv().await.unwrap();
        assert_eq!(first.container_id, "c1");
        assert_eq!(first.data, "first");
        assert_eq!(first.source, "");

        let second = rx.recv().await.unwrap();
        assert_eq!(second.container_name, "web2");
        assert_eq!(second.container_labels.get("svc").map(String::as_str), Some("api"));
        assert_eq!(second.source, "stderr");

        // End of input drops the sender and closes the channel.
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_producer_stops_when_receiver_is_gone() {
        let line = r#"{"container_id":"c1","container_name":"web1","data":"x","timestamp":"2024-05-01T12:00:00Z"}"#;
        let input = format!("{}\n", line).repeat(4);
        let (tx, rx) = mpsc::channel(1);
        drop(rx);

        tokio::time::timeout(Duration::from_secs(1), run_producer(input.as_bytes(), tx))
            .await
            .unwrap();
    }
}
