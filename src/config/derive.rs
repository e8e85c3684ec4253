//! Timeout-budget derivation.
//!
//! One user-supplied total timeout is split into per-phase sub-timeouts:
//! dial 20%, TLS handshake 20%, expect-continue 10%, response headers 40%,
//! each floored so a tiny total never starves a phase below a usable
//! minimum. The patient profile additionally makes the response-header wait
//! unbounded and lets the total timeout alone cap latency, which is what
//! lets slow-to-respond servers still succeed.

use std::time::Duration;

use crate::base::{ConfigViolations, GatherError};
use crate::config::Configuration;

/// Connection profile: how aggressively to give up on a slow server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnProfile {
    /// Slow/anti-scraping targets: wait as long as the total budget allows,
    /// keep compression on, linger on close, stay on HTTP/1.1.
    Patient,
    /// Fast targets: fail fast, skip compression, prefer HTTP/2, close
    /// immediately.
    Snappy,
}

const MIN_DIAL: Duration = Duration::from_secs(1);
const MIN_TLS: Duration = Duration::from_secs(1);
const MIN_EXPECT: Duration = Duration::from_millis(500);
const MIN_RESPONSE_HEADER: Duration = Duration::from_secs(2);

const DIAL_RATIO: f64 = 0.2;
const TLS_RATIO: f64 = 0.2;
const EXPECT_RATIO: f64 = 0.1;
const RESPONSE_HEADER_RATIO: f64 = 0.4;

fn scaled(total: Duration, ratio: f64, floor: Duration) -> Duration {
    total.mul_f64(ratio).max(floor)
}

/// Derive a full [`Configuration`] from a total timeout and a profile.
///
/// `total` must be strictly positive; a zero total is a caller error and is
/// rejected rather than substituted with a default.
pub fn derive_configuration(
    total: Duration,
    profile: ConnProfile,
    tls_insecure: bool,
) -> Result<Configuration, GatherError> {
    if total.is_zero() {
        return Err(GatherError::InvalidConfig(ConfigViolations(vec![
            "total timeout must be > 0".to_string(),
        ])));
    }

    let dial_timeout = scaled(total, DIAL_RATIO, MIN_DIAL);
    let tls_handshake_timeout = scaled(total, TLS_RATIO, MIN_TLS);
    let expect_continue_timeout = scaled(total, EXPECT_RATIO, MIN_EXPECT);

    let response_header_timeout = match profile {
        // Unbounded: the total timeout is solely responsible for capping
        // the exchange.
        ConnProfile::Patient => None,
        ConnProfile::Snappy => Some(scaled(total, RESPONSE_HEADER_RATIO, MIN_RESPONSE_HEADER)),
    };

    let cfg = match profile {
        ConnProfile::Patient => Configuration {
            max_idle_conns: 100,
            max_idle_per_host_ratio: 1.0,
            tls_insecure_skip_verify: tls_insecure,
            dial_timeout,
            tls_handshake_timeout,
            expect_continue_timeout,
            response_header_timeout,
            idle_conn_timeout: Duration::from_secs(90),
            keep_alive: Duration::from_secs(60),
            disable_compression: false,
            force_http2: false,
            tcp_linger: Duration::from_secs(1),
        },
        ConnProfile::Snappy => Configuration {
            max_idle_conns: 100,
            max_idle_per_host_ratio: 1.0,
            tls_insecure_skip_verify: tls_insecure,
            dial_timeout,
            tls_handshake_timeout,
            expect_continue_timeout,
            response_header_timeout,
            idle_conn_timeout: Duration::from_secs(30),
            keep_alive: Duration::from_secs(30),
            disable_compression: true,
            force_http2: true,
            tcp_linger: Duration::ZERO,
        },
    };

    Ok(cfg)
}
