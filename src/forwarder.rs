//! The forwarding loop.
//!
//! Drains the inbound channel one message at a time, transforms each message
//! and hands it to the sender. A failed delivery is logged and the message is
//! dropped; the loop only ends when the producer closes the channel.

use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::config::ConnectorConfig;
use crate::message::InboundMessage;
use crate::sender::Sender;
use crate::transform::transform;

/// Counts of what happened to the messages of one stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForwardStats {
    /// Messages taken from the inbound channel
    pub received: u64,

    /// Blank messages dropped without sending
    pub skipped: u64,

    /// Messages accepted by the sender
    pub posted: u64,

    /// Messages dropped after a delivery error
    pub failed: u64,
}

/// Forward every message from `inbound` until the channel is closed.
///
/// Messages are posted in arrival order; each one is fully handled before the
/// next is received.
pub async fn run<S>(
    mut inbound: mpsc::Receiver<InboundMessage>,
    config: &ConnectorConfig,
    sender: &S,
) -> ForwardStats
where
    S: Sender + ?Sized,
{
    let mut stats = ForwardStats::default();

    while let Some(message) = inbound.recv().await {
        stats.received += 1;
        debug!(
            container_id = %message.container_id,
            container_name = %message.container_name,
            "Received message from container"
        );

        let Some(envelope) = transform(&message, config) else {
            stats.skipped += 1;
            debug!(container_id = %message.container_id, "Skipping empty message");
            continue;
        };

        match sender
            .post(&envelope.tag, envelope.timestamp, &envelope.record)
            .await
        {
            Ok(()) => stats.posted += 1,
            Err(e) => {
                stats.failed += 1;
                error!(
                    error = %e,
                    tag = %envelope.tag,
                    container_id = %message.container_id,
                    "Failed to forward message, dropping it"
                );
            }
        }
    }

    info!(
        received = stats.received,
        skipped = stats.skipped,
        posted = stats.posted,
        failed = stats.failed,
        "Inbound stream closed"
    );
    stats
}
