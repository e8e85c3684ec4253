//! Browser header presets and per-request header assembly.
//!
//! A client that is handed only a `User-Agent` gets the rest of a plausible
//! browser fingerprint filled in; anything richer is taken verbatim as the
//! caller's own fingerprint.

use dashmap::DashMap;
use http::header::{HeaderName, HeaderValue};
use http::HeaderMap;
use url::Url;

const UA_CHROME: &str = "Mozilla/5.0 (Windows NT 6.1; Win64; x64) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/56.0.2924.87 Safari/537.36";
const UA_BAIDU: &str =
    "Mozilla/5.0 (compatible; Baiduspider/2.0;++http://www.baidu.com/search/spider.html)";
const UA_GOOGLE: &str =
    "Mozilla/5.0 (compatible; Googlebot/2.1;+http://www.google.com/bot.html)";
const UA_BING: &str = "Mozilla/5.0 (compatible; bingbot/2.0;+http://www.bing.com/bingbot.htm)";
const UA_360: &str = "Mozilla/5.0 (Windows NT 6.1; WOW64) AppleWebKit/537.36 \
                      (KHTML, like Gecko) Chrome/45.0.2454.101 Safari/537.36";
const UA_IE9: &str = "Mozilla/5.0 (compatible; MSIE 9.0; Windows NT 6.1; Win64; x64; Trident/5.0)";

/// Resolve a user-agent preset name to a concrete UA string.
///
/// Unknown names pass through as literal user-agent values, so callers can
/// hand in a full UA string directly. The empty string maps to Chrome.
pub fn resolve_user_agent(preset: &str) -> &str {
    match preset.to_ascii_lowercase().as_str() {
        "baidu" => UA_BAIDU,
        "google" => UA_GOOGLE,
        "bing" => UA_BING,
        "chrome" | "" => UA_CHROME,
        "360" => UA_360,
        "ie" | "ie9" => UA_IE9,
        _ => return preset,
    }
}

/// Fill in default browser headers when the caller supplied only a
/// `User-Agent`. Richer header maps pass through untouched.
pub fn complete_browser_headers(
    headers: &DashMap<String, String>,
) -> DashMap<String, String> {
    let only_user_agent = headers.len() == 1
        && headers
            .iter()
            .all(|e| e.key().eq_ignore_ascii_case("user-agent"));

    if !only_user_agent {
        let out = DashMap::new();
        for entry in headers.iter() {
            out.insert(entry.key().clone(), entry.value().clone());
        }
        return out;
    }

    let preset = headers
        .iter()
        .next()
        .map(|e| e.value().clone())
        .unwrap_or_default();

    let defaults = DashMap::new();
    defaults.insert(
        "Accept".to_string(),
        "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8".to_string(),
    );
    defaults.insert(
        "Accept-Encoding".to_string(),
        "gzip, deflate, sdch".to_string(),
    );
    defaults.insert("Accept-Language".to_string(), "zh-CN,zh;q=0.8".to_string());
    defaults.insert("Connection".to_string(), "keep-alive".to_string());
    defaults.insert("Upgrade-Insecure-Requests".to_string(), "1".to_string());
    defaults.insert(
        "User-Agent".to_string(),
        resolve_user_agent(&preset).to_string(),
    );
    defaults
}

/// Assemble the header map for one outgoing request.
///
/// Layering, lowest first: the client's stored headers, then the referer,
/// then the cookie line (stored jar value or a caller override), then any
/// per-request extras. Names or values the `http` types reject are skipped
/// rather than failing the request.
pub fn assemble_request_headers(
    stored: &DashMap<String, String>,
    referer: &str,
    cookie_line: Option<&str>,
    extras: &[(&str, &str)],
) -> HeaderMap {
    let mut map = HeaderMap::new();

    for entry in stored.iter() {
        insert_checked(&mut map, entry.key(), entry.value());
    }
    if !referer.is_empty() {
        insert_checked(&mut map, "Referer", referer);
    }
    if let Some(cookie) = cookie_line {
        if !cookie.is_empty() {
            insert_checked(&mut map, "Cookie", cookie);
        }
    }
    for (name, value) in extras {
        insert_checked(&mut map, name, value);
    }

    map
}

fn insert_checked(map: &mut HeaderMap, name: &str, value: &str) {
    let Ok(name) = HeaderName::try_from(name) else {
        tracing::debug!(name, "skipping invalid header name");
        return;
    };
    let Ok(value) = HeaderValue::from_str(value) else {
        tracing::debug!(name = %name, "skipping invalid header value");
        return;
    };
    map.insert(name, value);
}

/// Pick the cookie line for a request: an explicit non-empty override wins
/// over whatever the jar holds.
pub fn effective_cookie<'a>(
    override_cookie: &'a str,
    jar_cookie: &'a Option<String>,
) -> Option<&'a str> {
    if !override_cookie.is_empty() {
        Some(override_cookie)
    } else {
        jar_cookie.as_deref()
    }
}

/// Whether a redirect target stays on the same registrable scheme+host, used
/// to decide if stored auth-bearing headers keep flowing.
pub fn same_origin(a: &Url, b: &Url) -> bool {
    a.scheme() == b.scheme() && a.host_str() == b.host_str() && a.port() == b.port()
}
