//! Connection-pooled dial/TLS transports.
//!
//! A [`Transport`] owns everything needed to perform single HTTP exchanges
//! against arbitrary hosts: a TLS connector, an optional proxy target, and a
//! per-(scheme, host, port) store of idle hyper connections. All behavior is
//! fixed by the [`Configuration`] snapshot captured when the transport was
//! built; later profile swaps produce new transports instead of mutating
//! existing ones.

pub mod factory;

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use dashmap::DashMap;
use http::{header, HeaderMap, HeaderValue, Method, Request, Response, Version};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::client::conn::{http1, http2};
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::time::timeout;
use url::Url;

use crate::base::GatherError;
use crate::config::Configuration;
use crate::socket::{dial, proxy::ProxySettings, tls};

pub use factory::TransportFactory;

/// Identifies one connection group.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ConnKey {
    scheme: String,
    host: String,
    port: u16,
}

impl ConnKey {
    fn from_url(url: &Url) -> Result<Self, GatherError> {
        let host = url
            .host_str()
            .ok_or_else(|| GatherError::UnsupportedUrl(url.to_string()))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| GatherError::UnsupportedUrl(url.to_string()))?;
        Ok(Self {
            scheme: url.scheme().to_string(),
            host: host.to_string(),
            port,
        })
    }

    fn target(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// A live client connection, HTTP/1.1 or HTTP/2.
enum ConnHandle {
    H1(http1::SendRequest<Full<Bytes>>),
    H2(http2::SendRequest<Full<Bytes>>),
}

impl ConnHandle {
    fn is_h2(&self) -> bool {
        matches!(self, ConnHandle::H2(_))
    }

    fn is_closed(&self) -> bool {
        match self {
            ConnHandle::H1(s) => s.is_closed(),
            ConnHandle::H2(s) => s.is_closed(),
        }
    }

    async fn ready(&mut self) -> Result<(), hyper::Error> {
        match self {
            ConnHandle::H1(s) => s.ready().await,
            ConnHandle::H2(s) => s.ready().await,
        }
    }

    async fn send(
        &mut self,
        req: Request<Full<Bytes>>,
    ) -> Result<Response<Incoming>, hyper::Error> {
        match self {
            ConnHandle::H1(s) => s.send_request(req).await,
            ConnHandle::H2(s) => s.send_request(req).await,
        }
    }
}

struct IdleConn {
    conn: ConnHandle,
    parked_at: Instant,
}

/// A connection-pooled dial/TLS layer reused across many requests.
pub struct Transport {
    cfg: Arc<Configuration>,
    tls: boring::ssl::SslConnector,
    proxy: Option<ProxySettings>,
    idle: DashMap<ConnKey, Vec<IdleConn>>,
    idle_total: AtomicUsize,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("proxy", &self.proxy.as_ref().map(|p| p.host().to_string()))
            .field("max_idle_conns", &self.cfg.max_idle_conns)
            .field("idle_total", &self.idle_total.load(Ordering::Relaxed))
            .finish()
    }
}

impl Transport {
    /// Build a transport from a configuration snapshot.
    ///
    /// Construction failure is reported to the caller; this never hands back
    /// a non-functional transport.
    pub fn build(
        cfg: Arc<Configuration>,
        proxy: Option<ProxySettings>,
    ) -> Result<Self, GatherError> {
        let tls = tls::build_connector(&cfg)?;
        tracing::debug!(
            proxied = proxy.is_some(),
            force_http2 = cfg.force_http2,
            "transport built"
        );
        Ok(Self {
            cfg,
            tls,
            proxy,
            idle: DashMap::new(),
            idle_total: AtomicUsize::new(0),
        })
    }

    /// The configuration snapshot this transport was built from.
    pub fn config(&self) -> &Configuration {
        &self.cfg
    }

    /// Perform one HTTP exchange and collect the full response body.
    ///
    /// Redirects are not followed here; the client layer owns that loop.
    pub async fn exchange(
        &self,
        method: Method,
        url: &Url,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<(http::response::Parts, Bytes), GatherError> {
        let key = ConnKey::from_url(url)?;
        let target = key.target();

        let checked_out = self.checkout(&key);
        let reused = checked_out.is_some();
        let mut conn = match checked_out {
            Some(c) => c,
            None => self.open(&key).await?,
        };

        match self
            .send_once(&mut conn, &method, url, &key, &headers, body.clone(), &target)
            .await
        {
            Ok(out) => {
                self.checkin(key, conn);
                Ok(out)
            }
            // A pooled connection can go stale between exchanges; retry the
            // request once on a freshly opened one.
            Err(GatherError::Exchange { .. }) if reused => {
                tracing::debug!(target = %target, "pooled connection failed, retrying fresh");
                let mut conn = self.open(&key).await?;
                let out = self
                    .send_once(&mut conn, &method, url, &key, &headers, body, &target)
                    .await?;
                self.checkin(key, conn);
                Ok(out)
            }
            Err(e) => Err(e),
        }
    }

    async fn send_once(
        &self,
        conn: &mut ConnHandle,
        method: &Method,
        url: &Url,
        key: &ConnKey,
        headers: &HeaderMap,
        body: Bytes,
        target: &str,
    ) -> Result<(http::response::Parts, Bytes), GatherError> {
        let has_body = !body.is_empty();
        let req = self.build_request(method, url, key, headers, conn.is_h2(), body)?;

        // When a body is about to go out, bound the readiness wait by the
        // expect-continue budget.
        let ready_result = if has_body {
            match timeout(self.cfg.expect_continue_timeout, conn.ready()).await {
                Ok(r) => r,
                Err(_) => {
                    return Err(GatherError::Io {
                        phase: "waiting for request readiness",
                        target: target.to_string(),
                        source: io::Error::new(
                            io::ErrorKind::TimedOut,
                            "expect-continue budget exhausted",
                        ),
                    })
                }
            }
        } else {
            conn.ready().await
        };
        ready_result.map_err(|e| GatherError::Exchange {
            phase: "preparing connection",
            target: target.to_string(),
            source: e,
        })?;

        let send = conn.send(req);
        let response = match self.cfg.response_header_timeout {
            Some(budget) => timeout(budget, send)
                .await
                .map_err(|_| GatherError::ResponseHeaderTimeout {
                    target: target.to_string(),
                })?,
            // Unbounded: the caller's total timeout caps the exchange.
            None => send.await,
        }
        .map_err(|e| GatherError::Exchange {
            phase: "awaiting response headers",
            target: target.to_string(),
            source: e,
        })?;

        let (parts, incoming) = response.into_parts();
        let collected = incoming
            .collect()
            .await
            .map_err(|e| GatherError::Exchange {
                phase: "reading response body",
                target: target.to_string(),
                source: e,
            })?;

        Ok((parts, collected.to_bytes()))
    }

    fn build_request(
        &self,
        method: &Method,
        url: &Url,
        key: &ConnKey,
        headers: &HeaderMap,
        is_h2: bool,
        body: Bytes,
    ) -> Result<Request<Full<Bytes>>, GatherError> {
        // Plain-http targets reached through a proxy are not tunneled; the
        // request goes to the proxy itself in absolute form, with credentials
        // in Proxy-Authorization.
        let proxied_plain = self.proxy.is_some() && url.scheme() == "http";

        let builder = if is_h2 {
            Request::builder()
                .method(method.clone())
                .uri(url.as_str())
                .version(Version::HTTP_2)
        } else if proxied_plain {
            Request::builder()
                .method(method.clone())
                .uri(url.as_str())
                .version(Version::HTTP_11)
        } else {
            let mut path = url.path().to_string();
            if let Some(query) = url.query() {
                path.push('?');
                path.push_str(query);
            }
            Request::builder()
                .method(method.clone())
                .uri(path)
                .version(Version::HTTP_11)
        };

        let mut req = builder.body(Full::new(body))?;
        *req.headers_mut() = headers.clone();

        if proxied_plain {
            if let Some(auth) = self.proxy.as_ref().and_then(|p| p.auth_header()) {
                let value = HeaderValue::from_str(&auth)
                    .map_err(|e| GatherError::Request(http::Error::from(e)))?;
                req.headers_mut().insert(header::PROXY_AUTHORIZATION, value);
            }
        }

        if !is_h2 && !req.headers().contains_key(header::HOST) {
            let is_default_port = url.port().is_none();
            let host_value = if is_default_port {
                key.host.clone()
            } else {
                key.target()
            };
            let value = HeaderValue::from_str(&host_value)
                .map_err(|e| GatherError::Request(http::Error::from(e)))?;
            req.headers_mut().insert(header::HOST, value);
        }

        Ok(req)
    }

    /// Pop a live idle connection for the group, discarding dead or expired
    /// ones along the way. Groups drained to empty are dropped from the map.
    fn checkout(&self, key: &ConnKey) -> Option<ConnHandle> {
        let mut found = None;
        if let Some(mut slot) = self.idle.get_mut(key) {
            while let Some(parked) = slot.pop() {
                self.idle_total.fetch_sub(1, Ordering::Relaxed);
                if parked.parked_at.elapsed() < self.cfg.idle_conn_timeout
                    && !parked.conn.is_closed()
                {
                    tracing::trace!(target = %key.target(), "reusing pooled connection");
                    found = Some(parked.conn);
                    break;
                }
            }
        }
        // The shard guard is released above; removing while it is held would
        // deadlock on the same shard.
        self.idle.remove_if(key, |_, parked| parked.is_empty());
        found
    }

    /// Park a connection for reuse, respecting the per-host and pool-wide
    /// idle budgets.
    fn checkin(&self, key: ConnKey, conn: ConnHandle) {
        if conn.is_closed() {
            return;
        }
        if self.idle_total.load(Ordering::Relaxed) >= self.cfg.max_idle_conns {
            return;
        }

        let mut slot = self.idle.entry(key).or_default();

        // Sweep expired entries while the shard lock is held.
        let idle_timeout = self.cfg.idle_conn_timeout;
        let before = slot.len();
        slot.retain(|parked| parked.parked_at.elapsed() < idle_timeout);
        let swept = before - slot.len();
        if swept > 0 {
            self.idle_total.fetch_sub(swept, Ordering::Relaxed);
        }

        if slot.len() >= self.cfg.max_idle_per_host() {
            return;
        }
        slot.push(IdleConn {
            conn,
            parked_at: Instant::now(),
        });
        self.idle_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Dial, optionally handshake TLS, and set up a hyper client connection.
    ///
    /// Only TLS targets tunnel through a proxy; plain http ones talk to the
    /// proxy directly.
    async fn open(&self, key: &ConnKey) -> Result<ConnHandle, GatherError> {
        let target = key.target();
        let tunnel = key.scheme == "https";
        let stream =
            dial::dial(&key.host, key.port, self.proxy.as_ref(), &self.cfg, tunnel).await?;

        if key.scheme == "https" {
            let tls_stream = tls::handshake(&self.tls, &key.host, stream, &self.cfg).await?;
            if tls::negotiated_h2(&tls_stream) {
                handshake_h2(TokioIo::new(tls_stream), &target).await
            } else {
                handshake_h1(TokioIo::new(tls_stream), &target).await
            }
        } else {
            handshake_h1(TokioIo::new(stream), &target).await
        }
    }
}

async fn handshake_h1<T>(io: T, target: &str) -> Result<ConnHandle, GatherError>
where
    T: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    let (sender, conn): (http1::SendRequest<Full<Bytes>>, _) =
        http1::handshake(io).await.map_err(|e| GatherError::Exchange {
            phase: "http/1.1 handshake",
            target: target.to_string(),
            source: e,
        })?;

    tokio::spawn(async move {
        if let Err(err) = conn.await {
            tracing::debug!(%err, "http/1.1 connection ended with error");
        }
    });

    Ok(ConnHandle::H1(sender))
}

async fn handshake_h2<T>(io: T, target: &str) -> Result<ConnHandle, GatherError>
where
    T: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    let (sender, conn): (http2::SendRequest<Full<Bytes>>, _) =
        http2::handshake(TokioExecutor::new(), io)
            .await
            .map_err(|e| GatherError::Exchange {
                phase: "http/2 handshake",
                target: target.to_string(),
                source: e,
            })?;

    tokio::spawn(async move {
        if let Err(err) = conn.await {
            tracing::debug!(%err, "http/2 connection ended with error");
        }
    });

    Ok(ConnHandle::H2(sender))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conn_key_includes_default_ports() {
        let url = Url::parse("https://example.com/page").unwrap();
        let key = ConnKey::from_url(&url).unwrap();
        assert_eq!(key.scheme, "https");
        assert_eq!(key.port, 443);

        let url = Url::parse("http://example.com:8080/x").unwrap();
        let key = ConnKey::from_url(&url).unwrap();
        assert_eq!(key.target(), "example.com:8080");
    }

    #[test]
    fn urls_without_hosts_are_rejected() {
        let url = Url::parse("data:text/plain,hello").unwrap();
        assert!(ConnKey::from_url(&url).is_err());
    }

    #[test]
    fn plain_targets_go_absolute_form_through_a_proxy() {
        let settings = ProxySettings::parse("127.0.0.1:9")
            .unwrap()
            .with_auth("admin", "secret");
        let transport = Transport::build(Arc::new(Configuration::default()), Some(settings)).unwrap();

        let url = Url::parse("http://upstream.test:8080/data?q=1").unwrap();
        let key = ConnKey::from_url(&url).unwrap();
        let req = transport
            .build_request(&Method::GET, &url, &key, &HeaderMap::new(), false, Bytes::new())
            .unwrap();

        assert_eq!(req.uri().to_string(), "http://upstream.test:8080/data?q=1");
        assert_eq!(
            req.headers()[header::PROXY_AUTHORIZATION],
            "Basic YWRtaW46c2VjcmV0"
        );
        assert_eq!(req.headers()[header::HOST], "upstream.test:8080");
    }

    #[test]
    fn tls_targets_keep_origin_form_for_the_tunnel() {
        let settings = ProxySettings::parse("127.0.0.1:9")
            .unwrap()
            .with_auth("admin", "secret");
        let transport = Transport::build(Arc::new(Configuration::default()), Some(settings)).unwrap();

        let url = Url::parse("https://upstream.test/data").unwrap();
        let key = ConnKey::from_url(&url).unwrap();
        let req = transport
            .build_request(&Method::GET, &url, &key, &HeaderMap::new(), false, Bytes::new())
            .unwrap();

        assert_eq!(req.uri().to_string(), "/data");
        assert!(!req.headers().contains_key(header::PROXY_AUTHORIZATION));
    }

    #[tokio::test]
    async fn drained_idle_groups_are_removed_from_the_map() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            std::future::pending::<()>().await;
        });

        let transport = Transport::build(Arc::new(Configuration::default()), None).unwrap();
        let url = Url::parse(&format!("http://{addr}/")).unwrap();
        let key = ConnKey::from_url(&url).unwrap();

        let conn = transport.open(&key).await.unwrap();
        transport.checkin(key.clone(), conn);
        assert_eq!(transport.idle.len(), 1);

        assert!(transport.checkout(&key).is_some());
        assert!(transport.idle.is_empty());

        assert!(transport.checkout(&key).is_none());
        assert!(transport.idle.is_empty());
    }
}
