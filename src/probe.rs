//! Startup connection probe.
//!
//! Before the forwarder accepts any message it dials the collector with a
//! bounded number of attempts. The probe connection is discarded; the sender
//! opens its own connection afterwards.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::route::{Route, Transport};

/// Upper bound for a single dial attempt.
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Something that can open a transport-level connection to a route.
#[async_trait]
pub trait Dial: Send + Sync {
    /// Open and immediately discard a connection to `route`.
    async fn dial(&self, route: &Route) -> io::Result<()>;
}

/// Dials the route with the transport it names.
#[derive(Debug, Clone, Default)]
pub struct TransportDialer;

#[async_trait]
impl Dial for TransportDialer {
    async fn dial(&self, route: &Route) -> io::Result<()> {
        match route.transport {
            Transport::Tcp => {
                let stream = timeout(DIAL_TIMEOUT, TcpStream::connect(&route.address))
                    .await
                    .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "dial timed out"))??;
                drop(stream);
                Ok(())
            }
        }
    }
}

/// Errors returned by [`probe`].
#[derive(Debug)]
pub enum ProbeError {
    /// Every dial attempt failed
    ConnectionUnavailable {
        address: String,
        attempts: u32,
        source: io::Error,
    },
}

impl std::fmt::Display for ProbeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeError::ConnectionUnavailable {
                address,
                attempts,
                source,
            } => write!(
                f,
                "Collector at {} unavailable after {} attempts: {}",
                address, attempts, source
            ),
        }
    }
}

impl std::error::Error for ProbeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProbeError::ConnectionUnavailable { source, .. } => Some(source),
        }
    }
}

/// Dial `route` up to `max_retries + 1` times, sleeping `retry_wait` between
/// failed attempts.
///
/// Returns the number of attempts used on success. There is no sleep after the
/// final failed attempt.
pub async fn probe<D>(
    dialer: &D,
    route: &Route,
    max_retries: u32,
    retry_wait: Duration,
) -> Result<u32, ProbeError>
where
    D: Dial + ?Sized,
{
    let mut attempt: u32 = 0;

    loop {
        match dialer.dial(route).await {
            Ok(()) => {
                info!(
                    address = %route.address,
                    attempts = attempt + 1,
                    "Connectivity successful to fluentd"
                );
                return Ok(attempt + 1);
            }
            Err(e) if attempt >= max_retries => {
                error!(
                    address = %route.address,
                    attempts = attempt + 1,
                    error = %e,
                    "Unable to reach fluentd, giving up"
                );
                return Err(ProbeError::ConnectionUnavailable {
                    address: route.address.clone(),
                    attempts: attempt + 1,
                    source: e,
                });
            }
            Err(e) => {
                warn!(
                    address = %route.address,
                    attempt = attempt + 1,
                    max_retries = max_retries,
                    retry_wait_secs = retry_wait.as_secs(),
                    error = %e,
                    "Dial failed, retrying"
                );
                tokio::time::sleep(retry_wait).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::net::TcpListener;
    use tokio::time::Instant;

    /// Fails the first `failures` dials, then succeeds.
    struct FlakyDialer {
        failures: u32,
        calls: AtomicU32,
    }

    impl FlakyDialer {
        fn new(failures: u32) -> Self {
            Self {
                failures,
                calls: AtomicU32::new(0),
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Dial for FlakyDialer {
        async fn dial(&self, _route: &Route) -> io::Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"))
            } else {
                Ok(())
            }
        }
    }

    fn route() -> Route {
        Route::parse("fluentd://127.0.0.1:24224").unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_retries_fails_immediately() {
        let dialer = FlakyDialer::new(u32::MAX);
        let start = Instant::now();

        let result = probe(&dialer, &route(), 0, Duration::from_secs(5)).await;

        assert!(matches!(
            result,
            Err(ProbeError::ConnectionUnavailable { attempts: 1, .. })
        ));
        assert_eq!(dialer.calls(), 1);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_two_failures() {
        let dialer = FlakyDialer::new(2);
        let wait = Duration::from_secs(1);
        let start = Instant::now();

        let attempts = probe(&dialer, &route(), 3, wait).await.unwrap();

        assert_eq!(attempts, 3);
        assert_eq!(dialer.calls(), 3);
        let elapsed = start.elapsed();
        assert!(elapsed >= wait * 2 && elapsed < wait * 3, "{:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_all_attempts() {
        let dialer = FlakyDialer::new(u32::MAX);
        let wait = Duration::from_secs(2);
        let start = Instant::now();

        let err = probe(&dialer, &route(), 3, wait).await.unwrap_err();

        assert_eq!(dialer.calls(), 4);
        let elapsed = start.elapsed();
        assert!(elapsed >= wait * 3 && elapsed < wait * 4, "{:?}", elapsed);
        assert!(err.to_string().contains("after 4 attempts"));
    }

    #[tokio::test]
    async fn test_transport_dialer_reaches_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let route = Route::parse(&address).unwrap();

        let attempts = probe(&TransportDialer, &route, 0, Duration::ZERO).await;
        assert_eq!(attempts.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_transport_dialer_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);
        let route = Route::parse(&address).unwrap();

        let result = probe(&TransportDialer, &route, 1, Duration::from_millis(10)).await;
        assert!(matches!(
            result,
            Err(ProbeError::ConnectionUnavailable { attempts: 2, .. })
        ));
    }
}
