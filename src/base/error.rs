//! Error taxonomy for the collection client.
//!
//! Every failure a caller can recover from is an error value; the single
//! non-recoverable case (exchanging on a client that was never wired to a
//! transport) panics instead, because continuing would corrupt request state.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// The set of configuration fields that failed validation.
///
/// Validation is batch-reported: every violated field appears here, not just
/// the first one found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigViolations(pub Vec<String>);

impl fmt::Display for ConfigViolations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("; "))
    }
}

#[derive(Debug, Error)]
pub enum GatherError {
    /// A configuration update was rejected; the previously active profile
    /// remains in effect.
    #[error("invalid configuration: {0}")]
    InvalidConfig(ConfigViolations),

    /// The proxy address could not be parsed into a usable proxy target.
    #[error("invalid proxy address `{url}`: {reason}")]
    InvalidProxy { url: String, reason: String },

    /// Building the TLS/dial layer failed; no usable transport was produced.
    #[error("failed to build transport: {0}")]
    TransportBuild(String),

    /// No pooled instance became free within the acquisition budget.
    #[error("timed out, no free client found")]
    NoFreeClient,

    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// The URL lacks a host or resolvable port.
    #[error("URL has no usable host/port: {0}")]
    UnsupportedUrl(String),

    /// TCP dial failed or did not complete within the dial budget.
    #[error("dial to {target} failed within {timeout:?}: {source}")]
    Dial {
        target: String,
        timeout: Duration,
        #[source]
        source: std::io::Error,
    },

    /// TLS handshake with the target (or proxy) failed.
    #[error("TLS handshake with {host} failed: {reason}")]
    Handshake { host: String, reason: String },

    /// The proxy refused to establish a tunnel to the target.
    #[error("proxy tunnel to {target} refused: {status_line}")]
    TunnelRefused { target: String, status_line: String },

    /// The server did not start sending response headers in time.
    #[error("timed out waiting for response headers from {target}")]
    ResponseHeaderTimeout { target: String },

    /// The whole exchange exceeded the caller's total timeout.
    #[error("request to {target} exceeded the total timeout of {timeout:?}")]
    RequestTimeout { target: String, timeout: Duration },

    /// The server answered with a non-2xx status.
    #[error("server returned HTTP status {0}")]
    Status(u16),

    /// A protocol-level failure during one exchange phase.
    #[error("request failed while {phase} ({target}): {source}")]
    Exchange {
        phase: &'static str,
        target: String,
        #[source]
        source: hyper::Error,
    },

    /// An I/O failure during one exchange phase.
    #[error("{phase} failed for {target}: {source}")]
    Io {
        phase: &'static str,
        target: String,
        #[source]
        source: std::io::Error,
    },

    #[error("stopped after {0} redirects")]
    TooManyRedirects(u8),

    #[error("invalid request: {0}")]
    Request(#[from] http::Error),

    #[error("failed to serialize request payload: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl GatherError {
    /// True when the error is the acquisition-timeout sentinel, as opposed
    /// to a network failure on an acquired instance.
    pub fn is_no_free_client(&self) -> bool {
        matches!(self, GatherError::NoFreeClient)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn violations_join_all_fields() {
        let v = ConfigViolations(vec![
            "max_idle_conns must be > 0 (got 0)".to_string(),
            "keep_alive must be > 0".to_string(),
        ]);
        let err = GatherError::InvalidConfig(v);
        let msg = err.to_string();
        assert!(msg.contains("max_idle_conns"));
        assert!(msg.contains("keep_alive"));
    }

    #[test]
    fn no_free_client_is_distinguishable() {
        assert!(GatherError::NoFreeClient.is_no_free_client());
        assert!(!GatherError::Status(404).is_no_free_client());
    }
}
