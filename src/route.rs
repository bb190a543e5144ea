//! Route parsing for the collector target.
//!
//! A route names the adapter, an optional transport and the collector address,
//! e.g. `fluentd://10.0.0.5:24224` or `fluentd+tcp://collector:24224`.

use std::fmt;

use crate::config::ConfigError;

/// Transport used to reach the collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp,
}

impl Transport {
    fn lookup(name: &str) -> Option<Self> {
        match name {
            "tcp" => Some(Transport::Tcp),
            _ => None,
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Tcp => write!(f, "tcp"),
        }
    }
}

/// Adapter name accepted in the route scheme.
const ADAPTER: &str = "fluentd";

/// A validated collector route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Original `host:port` address
    pub address: String,

    /// Host part of the address
    pub host: String,

    /// Port part of the address
    pub port: u16,

    /// Transport used to dial the address
    pub transport: Transport,
}

impl Route {
    /// Parse a route URI or a bare `host:port` address.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` when the adapter is not `fluentd`, the transport
    /// is unknown or the address does not split into a host and a numeric port.
    pub fn parse(uri: &str) -> Result<Self, ConfigError> {
        let (scheme, address) = match uri.split_once("://") {
            Some((scheme, address)) => (Some(scheme), address),
            None => (None, uri),
        };

        let transport = match scheme {
            Some(scheme) => {
                let (adapter, transport) = match scheme.split_once('+') {
                    Some((adapter, name)) => (adapter, Some(name)),
                    None => (scheme, None),
                };
                if adapter != ADAPTER {
                    return Err(ConfigError::new(format!("unknown adapter: {}", adapter)));
                }
                match transport {
                    Some(name) => Transport::lookup(name).ok_or_else(|| {
                        ConfigError::new(format!("unable to find adapter transport: {}", name))
                    })?,
                    None => Transport::Tcp,
                }
            }
            None => Transport::Tcp,
        };

        let address = address.trim_end_matches('/');
        let (host, port) = split_host_port(address)?;

        Ok(Self {
            address: address.to_string(),
            host,
            port,
            transport,
        })
    }
}

/// Split `host:port`, accepting bracketed IPv6 hosts.
fn split_host_port(address: &str) -> Result<(String, u16), ConfigError> {
    let invalid = || ConfigError::new(format!("invalid fluentd address {}", address));

    let (host, port) = address.rsplit_once(':').ok_or_else(invalid)?;
    let host = match host.strip_prefix('[') {
        Some(inner) => inner.strip_suffix(']').ok_or_else(invalid)?,
        None if host.contains(':') => return Err(invalid()),
        None => host,
    };

    let port: u16 = port.parse().map_err(|_| invalid())?;
    Ok((host.to_string(), port))
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fluentd+{}://{}", self.transport, self.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_default_transport() {
        let route = Route::parse("fluentd://10.0.0.5:24224").unwrap();
        assert_eq!(route.address, "10.0.0.5:24224");
        assert_eq!(route.host, "10.0.0.5");
        assert_eq!(route.port, 24224);
        assert_eq!(route.transport, Transport::Tcp);
    }

    #[test]
    fn test_parse_explicit_tcp() {
        let route = Route::parse("fluentd+tcp://collector.local:24224/").unwrap();
        assert_eq!(route.host, "collector.local");
        assert_eq!(route.address, "collector.local:24224");
    }

    #[test]
    fn test_parse_bare_address() {
        let route = Route::parse("localhost:5170").unwrap();
        assert_eq!(route.host, "localhost");
        assert_eq!(route.port, 5170);
    }

    #[test]
    fn test_parse_ipv6() {
        let route = Route::parse("fluentd://[::1]:24224").unwrap();
        assert_eq!(route.host, "::1");
        assert_eq!(route.port, 24224);
    }

    #[test]
    fn test_unknown_transport() {
        let err = Route::parse("fluentd+udp://localhost:24224").unwrap_err();
        assert!(err.message.contains("unable to find adapter transport"));
    }

    #[test]
    fn test_unknown_adapter() {
        for uri in ["http://host:1", "syslog+tcp://host:514", "://host:24224"] {
            let err = Route::parse(uri).unwrap_err();
            assert!(err.message.contains("unknown adapter"), "{}", uri);
        }
    }

    #[test]
    fn test_invalid_address() {
        assert!(Route::parse("fluentd://localhost").is_err());
        assert!(Route::parse("fluentd://localhost:port").is_err());
        assert!(Route::parse("fluentd://localhost:70000").is_err());
        assert!(Route::parse("fluentd://::1:24224").is_err());
    }

    #[test]
    fn test_display() {
        let route = Route::parse("fluentd://localhost:24224").unwrap();
        assert_eq!(route.to_string(), "fluentd+tcp://localhost:24224");
    }
}
