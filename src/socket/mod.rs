//! Dial and TLS plumbing for transports.
//!
//! - [`dial`]: DNS → TCP (with dial budget, keep-alive, linger) → optional
//!   HTTP CONNECT tunnel
//! - [`tls`]: BoringSSL connector setup and handshake
//! - [`proxy`]: proxy target parsing and credentials

pub mod dial;
pub mod proxy;
pub mod tls;

pub use proxy::ProxySettings;
