//! Per-client cookie storage.
//!
//! Each client instance carries its own jar so that sessions collected
//! through different instances never bleed into one another. Cookies are
//! grouped by domain; matching follows RFC 6265 host/domain and path rules
//! closely enough for collection work without a full public-suffix pass.

use cookie::Cookie;
use dashmap::DashMap;
use http::header::SET_COOKIE;
use http::HeaderMap;
use time::OffsetDateTime;
use url::Url;

/// One cookie as held by the jar.
#[derive(Debug, Clone)]
struct StoredCookie {
    name: String,
    value: String,
    path: String,
    /// Set when the cookie carried no `Domain` attribute; such cookies only
    /// match the exact host that set them.
    host_only: bool,
    secure: bool,
    expires: Option<OffsetDateTime>,
}

impl StoredCookie {
    fn is_expired(&self, now: OffsetDateTime) -> bool {
        matches!(self.expires, Some(expiry) if expiry <= now)
    }

    fn matches_path(&self, request_path: &str) -> bool {
        if self.path == "/" || request_path == self.path {
            return true;
        }
        request_path.starts_with(&self.path)
            && (self.path.ends_with('/')
                || request_path.as_bytes().get(self.path.len()) == Some(&b'/'))
    }
}

/// A thread-safe cookie jar keyed by cookie domain.
#[derive(Debug, Default)]
pub struct CookieJar {
    store: DashMap<String, Vec<StoredCookie>>,
    log_changes: bool,
}

impl CookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    /// A jar that traces every stored and expired cookie.
    pub fn with_change_logging() -> Self {
        Self {
            store: DashMap::new(),
            log_changes: true,
        }
    }

    /// Record every `Set-Cookie` header from a response.
    pub fn record_response(&self, url: &Url, headers: &HeaderMap) {
        for value in headers.get_all(SET_COOKIE) {
            if let Ok(line) = value.to_str() {
                self.record(url, line);
            }
        }
    }

    /// Record one `Set-Cookie` line. Malformed lines are dropped silently;
    /// an empty value or a past expiry removes the cookie.
    pub fn record(&self, url: &Url, set_cookie_line: &str) {
        let Ok(parsed) = Cookie::parse(set_cookie_line.to_string()) else {
            return;
        };
        let Some(request_host) = url.host_str() else {
            return;
        };
        let request_host = request_host.to_ascii_lowercase();

        let (domain, host_only) = match parsed.domain() {
            Some(d) => {
                let d = d.trim_start_matches('.').to_ascii_lowercase();
                // A cookie may only be scoped to the host that set it or a
                // parent of it.
                if request_host != d && !request_host.ends_with(&format!(".{d}")) {
                    return;
                }
                (d, false)
            }
            None => (request_host, true),
        };

        let now = OffsetDateTime::now_utc();
        let expires = match parsed.max_age() {
            Some(max_age) => Some(now + max_age),
            None => parsed.expires_datetime(),
        };

        let stored = StoredCookie {
            name: parsed.name().to_string(),
            value: parsed.value().to_string(),
            path: match parsed.path() {
                Some(p) if p.starts_with('/') => p.to_string(),
                _ => "/".to_string(),
            },
            host_only,
            secure: parsed.secure().unwrap_or(false),
            expires,
        };

        let removing = stored.value.is_empty() || stored.is_expired(now);
        if self.log_changes {
            tracing::debug!(
                domain = %domain,
                name = %stored.name,
                removing,
                "cookie jar update"
            );
        }

        let mut slot = self.store.entry(domain).or_default();
        slot.retain(|c| !(c.name == stored.name && c.path == stored.path));
        if !removing {
            slot.push(stored);
        }
    }

    /// Build the `Cookie` header value for a request, or `None` when no
    /// stored cookie matches.
    pub fn header_for(&self, url: &Url) -> Option<String> {
        let request_host = url.host_str()?.to_ascii_lowercase();
        let request_path = if url.path().is_empty() { "/" } else { url.path() };
        let is_secure = url.scheme() == "https";
        let now = OffsetDateTime::now_utc();

        let mut pairs = Vec::new();
        for entry in self.store.iter() {
            let domain = entry.key();
            let exact = *domain == request_host;
            let suffix = request_host.ends_with(&format!(".{domain}"));
            if !exact && !suffix {
                continue;
            }
            for cookie in entry.value().iter() {
                if cookie.host_only && !exact {
                    continue;
                }
                if cookie.secure && !is_secure {
                    continue;
                }
                if cookie.is_expired(now) || !cookie.matches_path(request_path) {
                    continue;
                }
                pairs.push(format!("{}={}", cookie.name, cookie.value));
            }
        }

        if pairs.is_empty() {
            None
        } else {
            Some(pairs.join("; "))
        }
    }

    /// Drop expired cookies and empty domain groups.
    pub fn evict_expired(&self) {
        let now = OffsetDateTime::now_utc();
        self.store.retain(|_, cookies| {
            cookies.retain(|c| !c.is_expired(now));
            !cookies.is_empty()
        });
    }

    /// Remove every stored cookie.
    pub fn clear(&self) {
        self.store.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn set_and_send_round_trip() {
        let jar = CookieJar::new();
        let u = url("https://example.com/login");
        jar.record(&u, "session=abc123; Path=/");
        assert_eq!(jar.header_for(&u).as_deref(), Some("session=abc123"));
    }

    #[test]
    fn host_only_cookies_stay_on_their_host() {
        let jar = CookieJar::new();
        jar.record(&url("https://example.com/"), "a=1");
        assert!(jar.header_for(&url("https://sub.example.com/")).is_none());
        assert!(jar.header_for(&url("https://example.com/")).is_some());
    }

    #[test]
    fn domain_cookies_cover_subdomains() {
        let jar = CookieJar::new();
        jar.record(&url("https://example.com/"), "a=1; Domain=example.com");
        assert_eq!(
            jar.header_for(&url("https://sub.example.com/")).as_deref(),
            Some("a=1")
        );
    }

    #[test]
    fn foreign_domain_attributes_are_rejected() {
        let jar = CookieJar::new();
        jar.record(&url("https://example.com/"), "a=1; Domain=evil.com");
        assert!(jar.is_empty());
    }

    #[test]
    fn path_scoping_is_enforced() {
        let jar = CookieJar::new();
        jar.record(&url("https://example.com/app"), "a=1; Path=/app");
        assert!(jar.header_for(&url("https://example.com/app/page")).is_some());
        assert!(jar.header_for(&url("https://example.com/other")).is_none());
    }

    #[test]
    fn secure_cookies_never_go_over_http() {
        let jar = CookieJar::new();
        jar.record(&url("https://example.com/"), "a=1; Secure");
        assert!(jar.header_for(&url("http://example.com/")).is_none());
        assert!(jar.header_for(&url("https://example.com/")).is_some());
    }

    #[test]
    fn zero_max_age_removes_the_cookie() {
        let jar = CookieJar::new();
        let u = url("https://example.com/");
        jar.record(&u, "a=1");
        jar.record(&u, "a=gone; Max-Age=0");
        assert!(jar.header_for(&u).is_none());
    }

    #[test]
    fn newer_values_replace_older_ones() {
        let jar = CookieJar::new();
        let u = url("https://example.com/");
        jar.record(&u, "a=old");
        jar.record(&u, "a=new");
        assert_eq!(jar.header_for(&u).as_deref(), Some("a=new"));
    }
}
