//! # gathernet
//!
//! A pooled, browser-emulating HTTP collection client.
//!
//! The crate pairs a process-wide, versioned timeout configuration with
//! cached dial/TLS transports, and layers browser-fingerprint clients and a
//! bounded client pool on top:
//!
//! - [`config`]: the active timeout profile ("patient" for slow public
//!   sites, "snappy" for responsive endpoints), derived from one total
//!   timeout and validated in full before it takes effect.
//! - [`transport`]: connection-pooled dial/TLS layers, shared per proxy
//!   identity and rebuilt lazily when the configuration version moves.
//! - [`client`]: one collection session each, with persistent headers, an
//!   automatic cookie jar, redirect following, and gzip-sniffing body
//!   decode.
//! - [`pool`]: a bounded set of clients leased one exchange at a time.
//!
//! ## Example
//! ```ignore
//! use gathernet::GatherClient;
//!
//! # async fn run() -> Result<(), gathernet::GatherError> {
//! let client = GatherClient::new("chrome", false)?;
//! let (html, final_url) = client.get("https://example.com/", "").await?;
//! println!("{final_url}: {} bytes", html.len());
//! # Ok(())
//! # }
//! ```
//!
//! Pooled use for concurrent collection:
//! ```ignore
//! use dashmap::DashMap;
//! use gathernet::ClientPool;
//!
//! # async fn run() -> Result<(), gathernet::GatherError> {
//! let headers = DashMap::new();
//! headers.insert("User-Agent".to_string(), "chrome".to_string());
//! let pool = ClientPool::new(headers, "", 30, false, 8)?;
//! let (body, _) = pool.get("http://10.0.0.7:8080/status", "").await?;
//! # Ok(())
//! # }
//! ```

pub mod base;
pub mod client;
pub mod config;
pub mod cookies;
pub mod headers;
pub mod http;
pub mod pool;
pub mod socket;
pub mod transport;

pub use base::{ConfigViolations, GatherError};
pub use client::GatherClient;
pub use config::{ConfigRegistry, Configuration, ConnProfile};
pub use cookies::CookieJar;
pub use http::multipart::{Form, Part};
pub use pool::{ClientPool, LeasedClient, PoolConfig};
pub use socket::ProxySettings;
pub use transport::{Transport, TransportFactory};
