//! Fluentd forward protocol client.
//!
//! Encoded records are appended to a byte-bounded pending queue and flushed
//! over a single TCP connection. When appending would exceed the buffer limit
//! the oldest queued records are dropped. Write failures close the connection
//! and are retried with exponential backoff, either inline (`post` blocks) or,
//! with `async_connect`, in a background reconnect task.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::codec::{encode_message, read_ack};
use super::{backoff_delay, SendError, Sender, SenderConfig};
use crate::message::Record;
use crate::route::Transport;

/// Upper bound for establishing a connection.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Statistics about sender operations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SenderStats {
    /// Records written (and acked, if requested)
    pub frames_sent: u64,

    /// Records dropped from the pending buffer to make room
    pub frames_dropped: u64,

    /// Failed connect, write or ack attempts
    pub write_failures: u64,

    /// Connections established
    pub reconnects: u64,
}

#[derive(Default)]
struct Counters {
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
    write_failures: AtomicU64,
    reconnects: AtomicU64,
}

/// One encoded record waiting to be written.
struct Frame {
    bytes: Vec<u8>,
    chunk: Option<String>,
}

struct State {
    conn: Option<TcpStream>,
    pending: VecDeque<Frame>,
    pending_bytes: usize,
    closed: bool,
}

impl State {
    /// Queue `frame`, evicting the oldest frames until it fits.
    ///
    /// Returns the number of evicted frames.
    fn enqueue(&mut self, frame: Frame, limit: usize) -> u64 {
        let mut dropped = 0;
        while self.pending_bytes + frame.bytes.len() > limit {
            match self.pending.pop_front() {
                Some(old) => {
                    self.pending_bytes -= old.bytes.len();
                    dropped += 1;
                }
                None => break,
            }
        }
        self.pending_bytes += frame.bytes.len();
        self.pending.push_back(frame);
        dropped
    }
}

struct Inner {
    config: SenderConfig,
    state: Mutex<State>,
    reconnecting: AtomicBool,
    counters: Counters,
}

/// Sender speaking the Fluentd forward protocol.
///
/// Cheap to clone; clones share the connection and pending buffer.
#[derive(Clone)]
pub struct FluentSender {
    inner: Arc<Inner>,
}

impl FluentSender {
    /// Create a sender. No connection is opened until the first `post`.
    pub fn new(config: SenderConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(State {
                    conn: None,
                    pending: VecDeque::new(),
                    pending_bytes: 0,
                    closed: false,
                }),
                reconnecting: AtomicBool::new(false),
                counters: Counters::default(),
            }),
        }
    }

    /// Get the sender configuration.
    pub fn config(&self) -> &SenderConfig {
        &self.inner.config
    }

    /// Get current sender statistics.
    pub fn stats(&self) -> SenderStats {
        let counters = &self.inner.counters;
        SenderStats {
            frames_sent: counters.frames_sent.load(Ordering::Relaxed),
            frames_dropped: counters.frames_dropped.load(Ordering::Relaxed),
            write_failures: counters.write_failures.load(Ordering::Relaxed),
            reconnects: counters.reconnects.load(Ordering::Relaxed),
        }
    }

    /// Number of bytes waiting to be written.
    pub async fn pending_bytes(&self) -> usize {
        self.inner.state.lock().await.pending_bytes
    }

    /// Flush pending records once and close the connection.
    ///
    /// Later `post` calls fail with [`SendError::Closed`].
    pub async fn close(&self) -> Result<(), SendError> {
        let mut state = self.inner.state.lock().await;
        state.closed = true;

        let result = if state.pending.is_empty() {
            Ok(())
        } else {
            self.inner.try_flush(&mut state).await
        };

        if let Err(e) = &result {
            warn!(
                error = %e,
                pending = state.pending.len(),
                "Failed to flush pending records on close"
            );
        }

        if let Some(mut conn) = state.conn.take() {
            let _ = conn.shutdown().await;
        }
        result
    }
}

#[async_trait]
impl Sender for FluentSender {
    async fn post(
        &self,
        tag: &str,
        timestamp: DateTime<Utc>,
        record: &Record,
    ) -> Result<(), SendError> {
        let config = &self.inner.config;

        let chunk = config.request_ack.then(|| Uuid::new_v4().to_string());
        let bytes = encode_message(
            tag,
            timestamp,
            record,
            config.subsecond_precision,
            chunk.as_deref(),
        )?;
        if bytes.len() > config.buffer_limit {
            return Err(SendError::BufferFull {
                size: bytes.len(),
                limit: config.buffer_limit,
            });
        }

        let mut state = self.inner.state.lock().await;
        if state.closed {
            return Err(SendError::Closed);
        }

        let dropped = state.enqueue(Frame { bytes, chunk }, config.buffer_limit);
        if dropped > 0 {
            self.inner
                .counters
                .frames_dropped
                .fetch_add(dropped, Ordering::Relaxed);
            warn!(
                dropped = dropped,
                buffer_limit = config.buffer_limit,
                "Buffer limit reached: dropping oldest records"
            );
        }

        if config.async_connect {
            if state.conn.is_none() {
                Inner::spawn_reconnect(&self.inner);
                return Ok(());
            }
            if let Err(e) = self.inner.try_flush(&mut state).await {
                warn!(error = %e, "Write failed, reconnecting in background");
                Inner::spawn_reconnect(&self.inner);
            }
            return Ok(());
        }

        self.inner.flush_with_retry(&mut state).await
    }
}

impl Inner {
    /// Flush the pending queue, reconnecting and backing off on failure.
    async fn flush_with_retry(&self, state: &mut State) -> Result<(), SendError> {
        let mut attempt: u32 = 0;

        loop {
            let error = match self.try_flush(state).await {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };

            if attempt >= self.config.max_retries {
                error!(
                    error = %error,
                    attempts = attempt + 1,
                    pending = state.pending.len(),
                    "Failed to flush records to fluentd"
                );
                return Err(SendError::RetriesExhausted {
                    attempts: attempt + 1,
                    last_error: error.to_string(),
                });
            }

            let delay = backoff_delay(self.config.retry_wait, attempt);
            warn!(
                error = %error,
                attempt = attempt + 1,
                max_retries = self.config.max_retries,
                delay_ms = delay.as_millis() as u64,
                "Write failed, will retry"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// Connect if needed and write every pending frame in order.
    ///
    /// Any failure closes the connection; unwritten frames stay queued.
    async fn try_flush(&self, state: &mut State) -> Result<(), SendError> {
        let result = self.write_pending(state).await;
        if result.is_err() {
            state.conn = None;
            self.counters.write_failures.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    async fn write_pending(&self, state: &mut State) -> Result<(), SendError> {
        let conn = match state.conn.take() {
            Some(conn) => conn,
            None => self.connect().await?,
        };
        let conn = state.conn.insert(conn);

        while let Some(frame) = state.pending.front() {
            within(self.config.write_timeout, conn.write_all(&frame.bytes)).await?;

            if let Some(expected) = &frame.chunk {
                let response = within(self.config.write_timeout, read_ack(conn)).await?;
                if &response.ack != expected {
                    return Err(SendError::AckMismatch {
                        expected: expected.clone(),
                        received: response.ack,
                    });
                }
            }

            state.pending_bytes -= frame.bytes.len();
            state.pending.pop_front();
            self.counters.frames_sent.fetch_add(1, Ordering::Relaxed);
        }

        Ok(())
    }

    async fn connect(&self) -> Result<TcpStream, SendError> {
        let stream = match self.config.transport {
            Transport::Tcp => timeout(CONNECT_TIMEOUT, TcpStream::connect(&self.config.address))
                .await
                .map_err(|_| SendError::Timeout)??,
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Failed to set TCP_NODELAY, continuing with default buffering");
        }

        self.counters.reconnects.fetch_add(1, Ordering::Relaxed);
        debug!(address = %self.config.address, "Connected to fluentd");
        Ok(stream)
    }

    /// Start the background reconnect task unless one is already running.
    fn spawn_reconnect(inner: &Arc<Inner>) {
        if inner.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }

        let inner = Arc::clone(inner);
        tokio::spawn(async move {
            let _state = inner.reconnect_and_flush().await;
            inner.reconnecting.store(false, Ordering::SeqCst);
        });
    }

    /// Reconnect and flush until the queue is written, retries run out or the
    /// sender is closed.
    ///
    /// Returns holding the state lock, so the caller can clear `reconnecting`
    /// before any `post` observes the final connection state.
    async fn reconnect_and_flush(&self) -> MutexGuard<'_, State> {
        let mut attempt: u32 = 0;

        loop {
            match self.connect().await {
                Ok(stream) => {
                    let mut state = self.state.lock().await;
                    if state.closed {
                        return state;
                    }
                    state.conn = Some(stream);
                    match self.try_flush(&mut state).await {
                        Ok(()) => {
                            info!(address = %self.config.address, "Reconnected to fluentd");
                            return state;
                        }
                        Err(e) => warn!(error = %e, "Flush after reconnect failed"),
                    }
                }
                Err(e) => {
                    self.counters.write_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        address = %self.config.address,
                        attempt = attempt + 1,
                        error = %e,
                        "Background connect failed"
                    );
                }
            }

            if attempt >= self.config.max_retries {
                error!(
                    address = %self.config.address,
                    attempts = attempt + 1,
                    "Giving up reconnecting to fluentd until the next record"
                );
                return self.state.lock().await;
            }

            tokio::time::sleep(backoff_delay(self.config.retry_wait, attempt)).await;
            attempt += 1;

            let state = self.state.lock().await;
            if state.closed {
                return state;
            }
        }
    }
}

/// Run `fut` under `limit`; a zero limit disables the timeout.
async fn within<F, T, E>(limit: Duration, fut: F) -> Result<T, SendError>
where
    F: Future<Output = Result<T, E>>,
    E: Into<SendError>,
{
    if limit.is_zero() {
        return fut.await.map_err(Into::into);
    }
    match timeout(limit, fut).await {
        Ok(result) => result.map_err(Into::into),
        Err(_) => Err(SendError::Timeout),
    }
}
