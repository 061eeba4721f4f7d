//! Server configuration.

use std::time::Duration;

/// Address used when none is configured: port 80 on every IPv4 interface.
///
/// IPv6 is not included. Configure `[::]:80` to listen on IPv6 as well,
/// which is dual-stack where the OS allows it.
pub const DEFAULT_ADDR: &str = "0.0.0.0:80";

/// Configuration for a [`GracefulServer`](crate::GracefulServer).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GracefulConfig {
    /// Address to bind. `None` or an empty string means [`DEFAULT_ADDR`].
    pub addr: Option<String>,

    /// Upper bound on the drain phase. `None` waits forever.
    pub drain_timeout: Option<Duration>,
}

impl GracefulConfig {
    /// Configuration with the given bind address and an unbounded drain.
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: Some(addr.into()),
            drain_timeout: None,
        }
    }

    /// Create from `WADDLE_GRACEFUL_ADDR` and `WADDLE_DRAIN_TIMEOUT_SECS`.
    ///
    /// Missing or unparsable values fall back to the defaults.
    pub fn from_env() -> Self {
        let addr = std::env::var("WADDLE_GRACEFUL_ADDR")
            .ok()
            .filter(|v| !v.is_empty());

        let drain_timeout = std::env::var("WADDLE_DRAIN_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs);

        Self {
            addr,
            drain_timeout,
        }
    }

    /// Set the bind address.
    pub fn with_addr(mut self, addr: impl Into<String>) -> Self {
        self.addr = Some(addr.into());
        self
    }

    /// Bound the drain phase.
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = Some(timeout);
        self
    }

    /// The address to bind, falling back to [`DEFAULT_ADDR`] when unset or empty.
    pub fn resolved_addr(&self) -> &str {
        self.addr
            .as_deref()
            .filter(|a| !a.is_empty())
            .unwrap_or(DEFAULT_ADDR)
    }
}
