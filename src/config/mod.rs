//! Behavioral configuration and the process-wide registry.
//!
//! A [`Configuration`] is an immutable value object describing connection
//! pooling, TLS policy, and per-phase timeouts. The [`ConfigRegistry`] holds
//! the currently active profile behind a read/write lock and bumps a version
//! counter on every swap; the transport factory uses that version to
//! invalidate its cached no-proxy transport lazily. Transport building never
//! reads ambient global state: it always takes an explicit snapshot.

pub mod derive;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, RwLock};
use std::time::Duration;

use crate::base::{ConfigViolations, GatherError};

pub use derive::{derive_configuration, ConnProfile};

/// Connection/timeout parameters for one transport.
///
/// All fields are captured at transport build time; swapping the active
/// profile afterwards does not retroactively change existing transports.
#[derive(Debug, Clone, PartialEq)]
pub struct Configuration {
    /// Pool-wide cap on idle connections kept across all hosts.
    pub max_idle_conns: usize,
    /// Fraction of `max_idle_conns` a single host may keep idle, in (0, 1].
    pub max_idle_per_host_ratio: f64,
    /// Skip TLS certificate verification (self-signed/intranet targets).
    pub tls_insecure_skip_verify: bool,
    /// TCP dial budget.
    pub dial_timeout: Duration,
    /// TLS handshake budget.
    pub tls_handshake_timeout: Duration,
    /// Budget for the connection to become writable before a body is sent.
    pub expect_continue_timeout: Duration,
    /// Budget for the server to start emitting response headers.
    /// `None` means the phase never times out on its own; only the caller's
    /// total timeout bounds the exchange.
    pub response_header_timeout: Option<Duration>,
    /// How long an idle connection may sit parked before it is discarded.
    pub idle_conn_timeout: Duration,
    /// TCP keep-alive probe interval.
    pub keep_alive: Duration,
    /// Do not advertise `Accept-Encoding: gzip`.
    pub disable_compression: bool,
    /// Offer `h2` during ALPN on TLS connections.
    pub force_http2: bool,
    /// SO_LINGER applied after connect; zero closes immediately.
    pub tcp_linger: Duration,
}

impl Configuration {
    /// Validate every field, collecting all violations.
    ///
    /// This is the hard-reject path: an invalid configuration is reported in
    /// full and never silently clamped. (Pool sizing is the one place with
    /// silent auto-correction, see [`crate::pool::PoolConfig`].)
    pub fn validate(&self) -> Result<(), GatherError> {
        let mut violations = Vec::new();

        if self.max_idle_conns == 0 {
            violations.push("max_idle_conns must be > 0 (got 0)".to_string());
        }
        if !(self.max_idle_per_host_ratio > 0.0 && self.max_idle_per_host_ratio <= 1.0) {
            violations.push(format!(
                "max_idle_per_host_ratio must be in (0, 1] (got {})",
                self.max_idle_per_host_ratio
            ));
        }
        if self.dial_timeout.is_zero() {
            violations.push("dial_timeout must be > 0".to_string());
        }
        if self.tls_handshake_timeout.is_zero() {
            violations.push("tls_handshake_timeout must be > 0".to_string());
        }
        if self.expect_continue_timeout.is_zero() {
            violations.push("expect_continue_timeout must be > 0".to_string());
        }
        if let Some(t) = self.response_header_timeout {
            if t.is_zero() {
                violations.push(
                    "response_header_timeout must be > 0 (use None for unbounded)".to_string(),
                );
            }
        }
        if self.idle_conn_timeout.is_zero() {
            violations.push("idle_conn_timeout must be > 0".to_string());
        }
        if self.keep_alive.is_zero() {
            violations.push("keep_alive must be > 0".to_string());
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(GatherError::InvalidConfig(ConfigViolations(violations)))
        }
    }

    /// Per-host idle budget, floored at one connection.
    pub fn max_idle_per_host(&self) -> usize {
        let per_host = (self.max_idle_conns as f64 * self.max_idle_per_host_ratio) as usize;
        per_host.max(1)
    }

    /// Copy of this configuration with pool-proportional idle sizing.
    pub(crate) fn with_idle_budget(&self, max_idle: usize, ratio: f64) -> Configuration {
        Configuration {
            max_idle_conns: max_idle.max(1),
            max_idle_per_host_ratio: ratio,
            ..self.clone()
        }
    }
}

impl Default for Configuration {
    /// The patient preset with a ten-minute total budget, matching the
    /// registry's initial state.
    fn default() -> Self {
        derive_configuration(Duration::from_secs(600), ConnProfile::Patient, true)
            .unwrap_or_else(|_| unreachable!("patient preset is always valid"))
    }
}

/// Holds the active [`Configuration`] and a version counter.
///
/// Reads vastly outnumber writes; snapshots are cheap `Arc` clones taken
/// under the read lock.
pub struct ConfigRegistry {
    active: RwLock<Arc<Configuration>>,
    version: AtomicU64,
}

impl Default for ConfigRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigRegistry {
    /// Registry starting on the patient preset.
    pub fn new() -> Self {
        Self {
            active: RwLock::new(Arc::new(Configuration::default())),
            version: AtomicU64::new(0),
        }
    }

    /// The process-wide registry used by the convenience constructors.
    /// Tests that need isolation create their own registry instead.
    pub fn global() -> &'static ConfigRegistry {
        static GLOBAL: OnceLock<ConfigRegistry> = OnceLock::new();
        GLOBAL.get_or_init(ConfigRegistry::new)
    }

    /// Validate and atomically install a new active profile.
    ///
    /// On validation failure nothing changes and the error lists every
    /// violated field. On success the version bump invalidates the cached
    /// no-proxy transport; proxy-keyed transports are left intact since
    /// proxies rotate independently of the global profile.
    pub fn set_configuration(&self, cfg: Configuration) -> Result<(), GatherError> {
        cfg.validate()?;
        let mut active = self
            .active
            .write()
            .expect("configuration registry lock poisoned");
        *active = Arc::new(cfg);
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::debug!(version, "configuration profile swapped");
        Ok(())
    }

    /// The active profile as an immutable snapshot.
    pub fn snapshot(&self) -> Arc<Configuration> {
        self.active
            .read()
            .expect("configuration registry lock poisoned")
            .clone()
    }

    /// Monotonic counter identifying the active profile.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    /// Derive and install a configuration from a total timeout.
    pub fn set_by_total_timeout(
        &self,
        total: Duration,
        profile: ConnProfile,
        tls_insecure: bool,
    ) -> Result<(), GatherError> {
        self.set_configuration(derive_configuration(total, profile, tls_insecure)?)
    }

    /// Switch to the patient preset: ten-minute budget, unbounded
    /// response-header wait, compression on, linger on close.
    pub fn use_patient_profile(&self) {
        // The preset is a fixed valid configuration; installation cannot fail.
        let _ = self.set_by_total_timeout(Duration::from_secs(600), ConnProfile::Patient, true);
    }

    /// Switch to the snappy preset: thirty-second budget, bounded
    /// response-header wait, compression off, immediate close.
    pub fn use_snappy_profile(&self) {
        let _ = self.set_by_total_timeout(Duration::from_secs(30), ConnProfile::Snappy, true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> Configuration {
        Configuration::default()
    }

    #[test]
    fn default_configuration_is_valid() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn all_violations_are_reported_together() {
        let cfg = Configuration {
            max_idle_conns: 0,
            max_idle_per_host_ratio: 3.0,
            idle_conn_timeout: Duration::ZERO,
            keep_alive: Duration::ZERO,
            ..valid()
        };
        let err = cfg.validate().unwrap_err();
        match err {
            GatherError::InvalidConfig(v) => {
                assert_eq!(v.0.len(), 4, "expected four violations, got: {v}");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn rejected_update_leaves_registry_untouched() {
        let registry = ConfigRegistry::new();
        let before = registry.snapshot();
        let before_version = registry.version();

        let bad = Configuration {
            keep_alive: Duration::ZERO,
            ..valid()
        };
        assert!(registry.set_configuration(bad).is_err());

        assert_eq!(*registry.snapshot(), *before);
        assert_eq!(registry.version(), before_version);
    }

    #[test]
    fn successful_update_bumps_version() {
        let registry = ConfigRegistry::new();
        let v0 = registry.version();
        registry.use_snappy_profile();
        assert_eq!(registry.version(), v0 + 1);
        assert!(registry.snapshot().force_http2);
        registry.use_patient_profile();
        assert_eq!(registry.version(), v0 + 2);
        assert_eq!(registry.snapshot().response_header_timeout, None);
    }

    #[test]
    fn per_host_budget_floors_at_one() {
        let cfg = Configuration {
            max_idle_conns: 2,
            max_idle_per_host_ratio: 0.2,
            ..valid()
        };
        assert_eq!(cfg.max_idle_per_host(), 1);

        let cfg = Configuration {
            max_idle_conns: 100,
            max_idle_per_host_ratio: 0.2,
            ..valid()
        };
        assert_eq!(cfg.max_idle_per_host(), 20);
    }
}
