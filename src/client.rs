//! Browser-emulating client instances.
//!
//! A [`GatherClient`] couples a shared [`Transport`] with per-instance state:
//! a header fingerprint, a cookie jar, an overall deadline, and a lock that
//! serializes the instance's requests. Collection methods return the decoded
//! page text together with the URL that finally served it, since redirects
//! routinely land somewhere other than the URL that was asked for.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use http::{header, Method};
use tokio::time::timeout;
use url::Url;

use crate::base::GatherError;
use crate::config::ConfigRegistry;
use crate::cookies::CookieJar;
use crate::headers::{
    assemble_request_headers, complete_browser_headers, effective_cookie, same_origin,
};
use crate::http::decode::decode_body;
use crate::http::multipart::Form;
use crate::socket::ProxySettings;
use crate::transport::{Transport, TransportFactory};

const DEFAULT_TOTAL_TIMEOUT: Duration = Duration::from_secs(300);
const MAX_REDIRECTS: u8 = 20;

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded; charset=utf-8";
const XML_CONTENT_TYPE: &str = "application/xml; charset=utf-8";
#[cfg(feature = "json")]
const JSON_CONTENT_TYPE: &str = "application/json; charset=utf-8";
const BYTES_CONTENT_TYPE: &str = "application/octet-stream";

/// One collection session: headers, cookies, deadline, and a transport.
pub struct GatherClient {
    /// `None` only for `Default`-constructed husks; every real constructor
    /// fills this in, and request methods abort loudly if it is missing.
    transport: Option<Arc<Transport>>,
    headers: DashMap<String, String>,
    jar: Arc<CookieJar>,
    total_timeout: Option<Duration>,
    lock: tokio::sync::Mutex<()>,
}

impl Default for GatherClient {
    /// A detached instance with no transport. Using it for requests panics;
    /// it exists so containers of clients can be pre-sized.
    fn default() -> Self {
        Self {
            transport: None,
            headers: DashMap::new(),
            jar: Arc::new(CookieJar::new()),
            total_timeout: None,
            lock: tokio::sync::Mutex::new(()),
        }
    }
}

impl std::fmt::Debug for GatherClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatherClient")
            .field("attached", &self.transport.is_some())
            .field("headers", &self.headers.len())
            .field("total_timeout", &self.total_timeout)
            .finish()
    }
}

impl GatherClient {
    /// A no-proxy client using the active configuration and the shared
    /// direct transport.
    ///
    /// `user_agent` is a preset name (`"chrome"`, `"baidu"`, `"google"`,
    /// `"bing"`, `"360"`, `"ie"`, empty for Chrome) or a literal UA string.
    pub fn new(user_agent: &str, cookie_log: bool) -> Result<Self, GatherError> {
        Self::with_options(user_agent, "", DEFAULT_TOTAL_TIMEOUT.as_secs(), cookie_log)
    }

    /// A client routing through an HTTP proxy. `proxy_url` may be a bare
    /// `host:port`; credentials may be embedded in the URL.
    pub fn with_proxy(
        user_agent: &str,
        proxy_url: &str,
        cookie_log: bool,
    ) -> Result<Self, GatherError> {
        Self::with_options(
            user_agent,
            proxy_url,
            DEFAULT_TOTAL_TIMEOUT.as_secs(),
            cookie_log,
        )
    }

    /// A client routing through a proxy that requires explicit credentials.
    ///
    /// The credentials become part of the proxy identity, so the cached
    /// transport is keyed per credential set and every request through it
    /// carries `Proxy-Authorization`.
    pub fn with_proxy_auth(
        user_agent: &str,
        proxy_url: &str,
        user: &str,
        pass: &str,
        cookie_log: bool,
    ) -> Result<Self, GatherError> {
        let headers = DashMap::new();
        headers.insert("User-Agent".to_string(), user_agent.to_string());
        Self::with_headers_proxy_auth(
            headers,
            proxy_url,
            user,
            pass,
            DEFAULT_TOTAL_TIMEOUT.as_secs(),
            cookie_log,
        )
    }

    /// Like [`with_proxy_auth`](Self::with_proxy_auth) with a caller-built
    /// header map and an explicit total timeout in seconds (0 disables the
    /// overall deadline).
    pub fn with_headers_proxy_auth(
        headers: DashMap<String, String>,
        proxy_url: &str,
        user: &str,
        pass: &str,
        timeout_secs: u64,
        cookie_log: bool,
    ) -> Result<Self, GatherError> {
        let settings = ProxySettings::parse(proxy_url)?.with_auth(user, pass);
        let transport = TransportFactory::global()
            .proxied(settings, ConfigRegistry::global().snapshot())?;
        Ok(Self::from_transport(
            transport,
            headers,
            (timeout_secs > 0).then(|| Duration::from_secs(timeout_secs)),
            cookie_log,
        ))
    }

    /// A Chrome-fingerprint client with default settings.
    pub fn chrome() -> Result<Self, GatherError> {
        Self::new("chrome", false)
    }

    /// Full-control constructor: UA preset, optional proxy, total timeout in
    /// seconds (0 disables the overall deadline), cookie change logging.
    pub fn with_options(
        user_agent: &str,
        proxy_url: &str,
        timeout_secs: u64,
        cookie_log: bool,
    ) -> Result<Self, GatherError> {
        let headers = DashMap::new();
        headers.insert("User-Agent".to_string(), user_agent.to_string());
        Self::with_headers(headers, proxy_url, timeout_secs, cookie_log)
    }

    /// Like [`with_options`](Self::with_options) but with a caller-built
    /// header map. A map holding only `User-Agent` is completed to a full
    /// browser fingerprint; anything richer is used verbatim.
    pub fn with_headers(
        headers: DashMap<String, String>,
        proxy_url: &str,
        timeout_secs: u64,
        cookie_log: bool,
    ) -> Result<Self, GatherError> {
        let registry = ConfigRegistry::global();
        let transport = TransportFactory::global().transport_for(
            proxy_url,
            registry.snapshot(),
            registry.version(),
        )?;
        Ok(Self::from_transport(
            transport,
            headers,
            (timeout_secs > 0).then(|| Duration::from_secs(timeout_secs)),
            cookie_log,
        ))
    }

    /// Attach an instance to an already-built transport. The pool uses this
    /// to hand dedicated transports to its members.
    pub(crate) fn from_transport(
        transport: Arc<Transport>,
        headers: DashMap<String, String>,
        total_timeout: Option<Duration>,
        cookie_log: bool,
    ) -> Self {
        let jar = if cookie_log {
            CookieJar::with_change_logging()
        } else {
            CookieJar::new()
        };
        Self {
            transport: Some(transport),
            headers: complete_browser_headers(&headers),
            jar: Arc::new(jar),
            total_timeout,
            lock: tokio::sync::Mutex::new(()),
        }
    }

    fn transport(&self) -> &Arc<Transport> {
        self.transport
            .as_ref()
            .expect("GatherClient has no transport; construct it with GatherClient::new or a ClientPool")
    }

    /// Replace the overall deadline. Zero disables it.
    pub fn set_total_timeout(&mut self, timeout: Duration) {
        self.total_timeout = (!timeout.is_zero()).then_some(timeout);
    }

    /// Set or replace one stored header for all future requests.
    pub fn set_header(&self, name: &str, value: &str) {
        self.headers.insert(name.to_string(), value.to_string());
    }

    /// The instance's cookie jar.
    pub fn cookies(&self) -> &Arc<CookieJar> {
        &self.jar
    }

    /// GET a page, inheriting the jar's cookies.
    pub async fn get(&self, url: &str, referer: &str) -> Result<(String, String), GatherError> {
        self.get_with_cookies(url, referer, "").await
    }

    /// GET a page with an explicit cookie line overriding the jar.
    pub async fn get_with_cookies(
        &self,
        url: &str,
        referer: &str,
        cookies: &str,
    ) -> Result<(String, String), GatherError> {
        self.collect(Method::GET, url, referer, cookies, None, Bytes::new())
            .await
    }

    /// POST an urlencoded form.
    pub async fn post(
        &self,
        url: &str,
        referer: &str,
        form: &[(&str, &str)],
    ) -> Result<(String, String), GatherError> {
        self.post_with_cookies(url, referer, "", form).await
    }

    /// POST an urlencoded form with an explicit cookie line.
    pub async fn post_with_cookies(
        &self,
        url: &str,
        referer: &str,
        cookies: &str,
        form: &[(&str, &str)],
    ) -> Result<(String, String), GatherError> {
        let mut encoded = url::form_urlencoded::Serializer::new(String::new());
        for (name, value) in form {
            encoded.append_pair(name, value);
        }
        self.collect(
            Method::POST,
            url,
            referer,
            cookies,
            Some(FORM_CONTENT_TYPE),
            Bytes::from(encoded.finish()),
        )
        .await
    }

    /// POST a raw byte payload, `application/octet-stream` unless the stored
    /// headers say otherwise.
    pub async fn post_bytes(
        &self,
        url: &str,
        referer: &str,
        cookies: &str,
        body: Bytes,
    ) -> Result<(String, String), GatherError> {
        self.collect(
            Method::POST,
            url,
            referer,
            cookies,
            Some(BYTES_CONTENT_TYPE),
            body,
        )
        .await
    }

    /// POST an XML document.
    pub async fn post_xml(
        &self,
        url: &str,
        referer: &str,
        xml: &str,
    ) -> Result<(String, String), GatherError> {
        self.post_xml_with_cookies(url, referer, "", xml).await
    }

    /// POST an XML document with an explicit cookie line.
    pub async fn post_xml_with_cookies(
        &self,
        url: &str,
        referer: &str,
        cookies: &str,
        xml: &str,
    ) -> Result<(String, String), GatherError> {
        self.collect(
            Method::POST,
            url,
            referer,
            cookies,
            Some(XML_CONTENT_TYPE),
            Bytes::from(xml.to_string()),
        )
        .await
    }

    /// POST a value serialized as JSON.
    #[cfg(feature = "json")]
    pub async fn post_json<T: serde::Serialize>(
        &self,
        url: &str,
        referer: &str,
        payload: &T,
    ) -> Result<(String, String), GatherError> {
        self.post_json_with_cookies(url, referer, "", payload).await
    }

    /// POST a value serialized as JSON, with an explicit cookie line.
    #[cfg(feature = "json")]
    pub async fn post_json_with_cookies<T: serde::Serialize>(
        &self,
        url: &str,
        referer: &str,
        cookies: &str,
        payload: &T,
    ) -> Result<(String, String), GatherError> {
        let body = serde_json::to_vec(payload)?;
        self.collect(
            Method::POST,
            url,
            referer,
            cookies,
            Some(JSON_CONTENT_TYPE),
            Bytes::from(body),
        )
        .await
    }

    /// POST a multipart form (text fields plus file uploads).
    pub async fn post_multipart(
        &self,
        url: &str,
        referer: &str,
        cookies: &str,
        form: Form,
    ) -> Result<(String, String), GatherError> {
        let content_type = form.content_type();
        self.collect(
            Method::POST,
            url,
            referer,
            cookies,
            Some(content_type.as_str()),
            form.into_body(),
        )
        .await
    }

    /// Run one collection under the instance lock and the overall deadline.
    async fn collect(
        &self,
        method: Method,
        url: &str,
        referer: &str,
        cookies: &str,
        default_content_type: Option<&str>,
        body: Bytes,
    ) -> Result<(String, String), GatherError> {
        let transport = Arc::clone(self.transport());
        let _guard = self.lock.lock().await;

        let parsed = Url::parse(url)?;
        match parsed.scheme() {
            "http" | "https" => {}
            other => {
                return Err(GatherError::UnsupportedUrl(format!(
                    "{other} scheme in {url}"
                )))
            }
        }

        let drive = self.drive(
            &transport,
            method,
            parsed,
            referer,
            cookies,
            default_content_type,
            body,
        );
        match self.total_timeout {
            Some(budget) => match timeout(budget, drive).await {
                Ok(result) => result,
                Err(_) => Err(GatherError::RequestTimeout {
                    target: url.to_string(),
                    timeout: budget,
                }),
            },
            None => drive.await,
        }
    }

    /// The redirect-following request loop.
    #[allow(clippy::too_many_arguments)]
    async fn drive(
        &self,
        transport: &Transport,
        method: Method,
        url: Url,
        referer: &str,
        manual_cookie: &str,
        default_content_type: Option<&str>,
        body: Bytes,
    ) -> Result<(String, String), GatherError> {
        let origin = url.clone();
        let mut current = url;
        let mut method = method;
        let mut body = body;
        let mut content_type = default_content_type.map(str::to_string);
        let mut referer = referer.to_string();

        let stored_content_type = self
            .headers
            .iter()
            .any(|e| e.key().eq_ignore_ascii_case("content-type"));

        for _ in 0..MAX_REDIRECTS {
            // The manual cookie override only flows while we stay on the
            // origin the caller addressed; elsewhere the jar decides.
            let manual = if same_origin(&origin, &current) {
                manual_cookie
            } else {
                ""
            };
            let jar_cookie = self.jar.header_for(&current);
            let cookie = effective_cookie(manual, &jar_cookie);

            let mut extras: Vec<(&str, &str)> = Vec::new();
            if let Some(ct) = content_type.as_deref() {
                if !stored_content_type {
                    extras.push(("Content-Type", ct));
                }
            }
            let headers = assemble_request_headers(&self.headers, &referer, cookie, &extras);

            let (parts, bytes) = transport
                .exchange(method.clone(), &current, headers, body.clone())
                .await?;
            self.jar.record_response(&current, &parts.headers);

            let status = parts.status;
            if status.is_redirection() {
                let location = parts
                    .headers
                    .get(header::LOCATION)
                    .and_then(|v| v.to_str().ok());
                if let (Some(location), true) = (
                    location,
                    matches!(status.as_u16(), 301 | 302 | 303 | 307 | 308),
                ) {
                    let next = current.join(location)?;
                    tracing::debug!(status = status.as_u16(), from = %current, to = %next, "following redirect");
                    if matches!(status.as_u16(), 301 | 302 | 303) {
                        // Downgrade to a body-less GET, as browsers do.
                        method = Method::GET;
                        body = Bytes::new();
                        content_type = None;
                    }
                    referer = current.to_string();
                    current = next;
                    continue;
                }
            }

            if !status.is_success() {
                return Err(GatherError::Status(status.as_u16()));
            }
            return Ok((decode_body(&bytes), current.to_string()));
        }

        Err(GatherError::TooManyRedirects(MAX_REDIRECTS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[should_panic(expected = "no transport")]
    async fn detached_instances_abort_loudly() {
        let client = GatherClient::default();
        let _ = client.get("https://example.com/", "").await;
    }

    #[test]
    fn default_is_detached() {
        let client = GatherClient::default();
        assert!(client.transport.is_none());
    }

    #[test]
    fn zero_timeout_disables_the_deadline() {
        let mut client = GatherClient::default();
        client.set_total_timeout(Duration::from_secs(10));
        assert_eq!(client.total_timeout, Some(Duration::from_secs(10)));
        client.set_total_timeout(Duration::ZERO);
        assert_eq!(client.total_timeout, None);
    }
}
