//! Delivery of records to the collector.
//!
//! The forwarding loop only knows the [`Sender`] trait. [`FluentSender`] is the
//! network implementation speaking the Fluentd forward protocol; tests swap in
//! in-memory doubles.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::config::ConnectorConfig;
use crate::message::Record;
use crate::route::{Route, Transport};

pub mod codec;
pub mod fluent;

pub use fluent::{FluentSender, SenderStats};

/// Growth factor applied to the retry wait on every attempt.
const RETRY_WAIT_INCREASE_RATE: f64 = 1.5;

/// Maximum delay between retries (in milliseconds).
const MAX_RETRY_WAIT_MS: u64 = 60_000;

/// A capability that delivers one record to the collector.
///
/// Implementations own their buffering and retry policy; callers treat any
/// error as final for that record. `post` may be called concurrently.
#[async_trait]
pub trait Sender: Send + Sync {
    /// Deliver `record` under `tag` with the given event time.
    async fn post(
        &self,
        tag: &str,
        timestamp: DateTime<Utc>,
        record: &Record,
    ) -> Result<(), SendError>;
}

/// Settings for a [`FluentSender`], derived from the route and the
/// connector configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderConfig {
    /// Collector `host:port`
    pub address: String,

    /// Transport used for the connection
    pub transport: Transport,

    /// Maximum bytes held in the pending buffer
    pub buffer_limit: usize,

    /// Base backoff between retries
    pub retry_wait: Duration,

    /// Maximum retries per flush
    pub max_retries: u32,

    /// Connect and reconnect in a background task
    pub async_connect: bool,

    /// Encode event times with nanosecond precision
    pub subsecond_precision: bool,

    /// Request an acknowledgment for every record
    pub request_ack: bool,

    /// Timeout for each write (and ack read); zero disables it
    pub write_timeout: Duration,
}

impl SenderConfig {
    /// Build the sender settings for `route`.
    pub fn new(route: &Route, config: &ConnectorConfig) -> Self {
        Self {
            address: route.address.clone(),
            transport: route.transport,
            buffer_limit: config.buffer_limit,
            retry_wait: config.retry_wait,
            max_retries: config.max_retries,
            async_connect: config.async_connect,
            subsecond_precision: config.subsecond_precision,
            request_ack: config.request_ack,
            write_timeout: config.write_timeout,
        }
    }
}

/// Errors that can occur while delivering a record.
#[derive(Debug)]
pub enum SendError {
    /// Connection or write failed
    Io(io::Error),

    /// A write or ack read did not finish within the write timeout
    Timeout,

    /// The collector acknowledged a different chunk
    AckMismatch {
        expected: String,
        received: String,
    },

    /// The record could not be encoded
    Encode(String),

    /// A single record is larger than the whole buffer
    BufferFull {
        size: usize,
        limit: usize,
    },

    /// All retry attempts exhausted
    RetriesExhausted {
        attempts: u32,
        last_error: String,
    },

    /// The sender has been closed
    Closed,
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SendError::Io(e) => write!(f, "Connection error: {}", e),
            SendError::Timeout => write!(f, "Write timed out"),
            SendError::AckMismatch { expected, received } => write!(
                f,
                "Ack mismatch: expected {}, received {}",
                expected, received
            ),
            SendError::Encode(e) => write!(f, "Failed to encode record: {}", e),
            SendError::BufferFull { size, limit } => write!(
                f,
                "Record of {} bytes exceeds buffer limit of {} bytes",
                size, limit
            ),
            SendError::RetriesExhausted {
                attempts,
                last_error,
            } => write!(
                f,
                "All {} retry attempts exhausted. Last error: {}",
                attempts, last_error
            ),
            SendError::Closed => write!(f, "Sender has been closed"),
        }
    }
}

impl std::error::Error for SendError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SendError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for SendError {
    fn from(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::TimedOut {
            SendError::Timeout
        } else {
            SendError::Io(err)
        }
    }
}

/// Calculate the backoff delay for a given retry attempt.
///
/// delay = min(retry_wait * 1.5^attempt + jitter, 60s), with jitter up to 25%
/// of the exponential delay.
pub fn backoff_delay(retry_wait: Duration, attempt: u32) -> Duration {
    let base_delay = retry_wait.as_millis().min(u128::from(MAX_RETRY_WAIT_MS)) as f64;

    let exponential_delay = (base_delay * RETRY_WAIT_INCREASE_RATE.powi(attempt.min(64) as i32))
        .min(MAX_RETRY_WAIT_MS as f64) as u64;

    let jitter = rand::random::<u64>() % (exponential_delay / 4 + 1);

    Duration::from_millis(exponential_delay.saturating_add(jitter).min(MAX_RETRY_WAIT_MS))
}
