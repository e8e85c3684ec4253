//! BoringSSL connector setup and handshake.
//!
//! One [`SslConnector`] is built per transport from the configuration
//! snapshot: TLS 1.2 floor, verification per the insecure flag, and ALPN
//! derived from the HTTP/2 preference.

use boring::ssl::{SslConnector, SslMethod, SslVerifyMode, SslVersion};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_boring::SslStream;

use crate::base::GatherError;
use crate::config::Configuration;

/// ALPN wire format: length-prefixed protocol names.
const ALPN_H2_H1: &[u8] = b"\x02h2\x08http/1.1";
const ALPN_H1_ONLY: &[u8] = b"\x08http/1.1";

/// Build the connector for one transport.
pub(crate) fn build_connector(cfg: &Configuration) -> Result<SslConnector, GatherError> {
    let mut builder = SslConnector::builder(SslMethod::tls())
        .map_err(|e| GatherError::TransportBuild(format!("ssl connector: {e}")))?;

    builder
        .set_min_proto_version(Some(SslVersion::TLS1_2))
        .map_err(|e| GatherError::TransportBuild(format!("tls minimum version: {e}")))?;

    let alpn = if cfg.force_http2 {
        ALPN_H2_H1
    } else {
        ALPN_H1_ONLY
    };
    builder
        .set_alpn_protos(alpn)
        .map_err(|e| GatherError::TransportBuild(format!("alpn: {e}")))?;

    if cfg.tls_insecure_skip_verify {
        builder.set_verify(SslVerifyMode::NONE);
    } else {
        builder.set_verify(SslVerifyMode::PEER);
    }

    Ok(builder.build())
}

/// Run the TLS handshake within the configured handshake budget.
pub(crate) async fn handshake(
    connector: &SslConnector,
    host: &str,
    stream: TcpStream,
    cfg: &Configuration,
) -> Result<SslStream<TcpStream>, GatherError> {
    let mut config = connector
        .configure()
        .map_err(|e| GatherError::Handshake {
            host: host.to_string(),
            reason: e.to_string(),
        })?;

    if cfg.tls_insecure_skip_verify {
        config.set_verify_hostname(false);
    }

    let budget = cfg.tls_handshake_timeout;
    let tls_stream = timeout(budget, tokio_boring::connect(config, host, stream))
        .await
        .map_err(|_| GatherError::Handshake {
            host: host.to_string(),
            reason: format!("handshake did not complete within {budget:?}"),
        })?
        .map_err(|e| GatherError::Handshake {
            host: host.to_string(),
            reason: format!("{e:?}"),
        })?;

    Ok(tls_stream)
}

/// Whether ALPN selected HTTP/2 on this stream.
pub(crate) fn negotiated_h2(stream: &SslStream<TcpStream>) -> bool {
    stream.ssl().selected_alpn_protocol() == Some(b"h2".as_slice())
}
