//! Transport construction and caching.
//!
//! Direct (no-proxy) traffic shares a single transport for as long as the
//! active configuration stays at the same version; bumping the registry
//! version retires it lazily on next access. Proxied traffic gets one cached
//! transport per distinct proxy target, linearized through the map's entry
//! API so two racing callers always observe the same instance.

use std::sync::{Arc, Mutex, OnceLock};

use dashmap::DashMap;

use crate::base::GatherError;
use crate::config::Configuration;
use crate::socket::ProxySettings;
use crate::transport::Transport;

struct DirectSlot {
    version: u64,
    transport: Arc<Transport>,
}

/// Process-wide transport cache.
pub struct TransportFactory {
    direct: Mutex<Option<DirectSlot>>,
    proxied: DashMap<String, Arc<Transport>>,
}

static FACTORY: OnceLock<TransportFactory> = OnceLock::new();

impl TransportFactory {
    pub fn new() -> Self {
        Self {
            direct: Mutex::new(None),
            proxied: DashMap::new(),
        }
    }

    /// The factory shared by all clients in this process.
    pub fn global() -> &'static TransportFactory {
        FACTORY.get_or_init(TransportFactory::new)
    }

    /// The shared no-proxy transport for the given configuration version.
    ///
    /// A stale slot (older version) is replaced in place; concurrent callers
    /// serialize on the slot lock, so exactly one of them builds.
    pub fn direct(
        &self,
        cfg: Arc<Configuration>,
        version: u64,
    ) -> Result<Arc<Transport>, GatherError> {
        let mut slot = self.direct.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(held) = slot.as_ref() {
            if held.version == version {
                return Ok(Arc::clone(&held.transport));
            }
        }
        let transport = Arc::new(Transport::build(cfg, None)?);
        tracing::debug!(version, "direct transport (re)built");
        *slot = Some(DirectSlot {
            version,
            transport: Arc::clone(&transport),
        });
        Ok(transport)
    }

    /// The shared transport for one proxy target.
    pub fn proxied(
        &self,
        settings: ProxySettings,
        cfg: Arc<Configuration>,
    ) -> Result<Arc<Transport>, GatherError> {
        let key = settings.cache_key();
        if let Some(existing) = self.proxied.get(&key) {
            return Ok(Arc::clone(existing.value()));
        }
        // entry() holds the shard lock across the check-then-create, so a
        // racing caller either finds our transport or we find theirs.
        match self.proxied.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(occupied) => {
                Ok(Arc::clone(occupied.get()))
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                let transport = Arc::new(Transport::build(cfg, Some(settings))?);
                vacant.insert(Arc::clone(&transport));
                Ok(transport)
            }
        }
    }

    /// Dispatch on the proxy key: empty means direct.
    pub fn transport_for(
        &self,
        proxy: &str,
        cfg: Arc<Configuration>,
        version: u64,
    ) -> Result<Arc<Transport>, GatherError> {
        if proxy.is_empty() {
            self.direct(cfg, version)
        } else {
            self.proxied(ProxySettings::parse(proxy)?, cfg)
        }
    }

    /// An uncached transport, for callers that size their own idle budgets.
    pub fn build_dedicated(
        &self,
        cfg: Arc<Configuration>,
        proxy: Option<ProxySettings>,
    ) -> Result<Arc<Transport>, GatherError> {
        Ok(Arc::new(Transport::build(cfg, proxy)?))
    }

    /// Drop every cached transport.
    pub fn clear(&self) {
        self.clear_direct();
        self.proxied.clear();
    }

    /// Drop only the shared no-proxy transport.
    pub fn clear_direct(&self) {
        let mut slot = self.direct.lock().unwrap_or_else(|e| e.into_inner());
        *slot = None;
    }
}

impl Default for TransportFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Arc<Configuration> {
        Arc::new(Configuration::default())
    }

    #[test]
    fn direct_is_shared_within_a_version() {
        let factory = TransportFactory::new();
        let a = factory.direct(test_config(), 1).unwrap();
        let b = factory.direct(test_config(), 1).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn version_bump_replaces_the_direct_transport() {
        let factory = TransportFactory::new();
        let a = factory.direct(test_config(), 1).unwrap();
        let b = factory.direct(test_config(), 2).unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        // And the new version is sticky.
        let c = factory.direct(test_config(), 2).unwrap();
        assert!(Arc::ptr_eq(&b, &c));
    }

    #[test]
    fn proxied_transports_are_keyed_by_target() {
        let factory = TransportFactory::new();
        let a = factory
            .proxied(ProxySettings::parse("127.0.0.1:8080").unwrap(), test_config())
            .unwrap();
        let b = factory
            .proxied(ProxySettings::parse("127.0.0.1:8080").unwrap(), test_config())
            .unwrap();
        let c = factory
            .proxied(ProxySettings::parse("127.0.0.1:9090").unwrap(), test_config())
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn empty_proxy_key_dispatches_to_direct() {
        let factory = TransportFactory::new();
        let direct = factory.direct(test_config(), 7).unwrap();
        let routed = factory.transport_for("", test_config(), 7).unwrap();
        assert!(Arc::ptr_eq(&direct, &routed));
    }

    #[test]
    fn dedicated_transports_are_never_cached() {
        let factory = TransportFactory::new();
        let a = factory.build_dedicated(test_config(), None).unwrap();
        let b = factory.build_dedicated(test_config(), None).unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
    }
}
