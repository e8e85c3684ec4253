//! The dial step: DNS resolution, TCP connect within the dial budget,
//! socket-option tuning, and HTTP CONNECT tunneling through a proxy.

use std::io;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::base::GatherError;
use crate::config::Configuration;
use crate::socket::proxy::ProxySettings;

fn timed_out(target: &str, budget: Duration) -> GatherError {
    GatherError::Dial {
        target: target.to_string(),
        timeout: budget,
        source: io::Error::new(io::ErrorKind::TimedOut, "dial budget exhausted"),
    }
}

/// Dial a TCP connection to `host:port`, applying the configuration's dial
/// timeout, keep-alive interval, and post-connect linger.
///
/// When a proxy is given, the connection goes to the proxy instead. `tunnel`
/// decides what happens next: `true` issues a CONNECT to `host:port` (TLS
/// targets), `false` leaves the stream pointed at the proxy so the caller can
/// speak plain HTTP in absolute form.
pub(crate) async fn dial(
    host: &str,
    port: u16,
    proxy: Option<&ProxySettings>,
    cfg: &Configuration,
    tunnel: bool,
) -> Result<TcpStream, GatherError> {
    let (connect_host, connect_port) = match proxy {
        Some(p) => (p.host().to_string(), p.port()),
        None => (host.to_string(), port),
    };
    let connect_addr = format!("{connect_host}:{connect_port}");
    let budget = cfg.dial_timeout;

    let stream = timeout(budget, connect_any(&connect_addr))
        .await
        .map_err(|_| timed_out(&connect_addr, budget))?
        .map_err(|e| GatherError::Dial {
            target: connect_addr.clone(),
            timeout: budget,
            source: e,
        })?;

    tune_socket(&stream, cfg).map_err(|e| GatherError::Io {
        phase: "setting socket options",
        target: connect_addr.clone(),
        source: e,
    })?;

    tracing::debug!(target = %connect_addr, reused = false, "dialed connection");

    let mut stream = stream;
    if let Some(p) = proxy {
        if tunnel {
            establish_tunnel(&mut stream, host, port, p).await?;
        }
    }

    Ok(stream)
}

async fn connect_any(addr: &str) -> io::Result<TcpStream> {
    let addrs = tokio::net::lookup_host(addr).await?;

    let mut last_err = None;
    for sockaddr in addrs {
        match TcpStream::connect(sockaddr).await {
            Ok(s) => return Ok(s),
            Err(e) => last_err = Some(e),
        }
    }

    Err(last_err
        .unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no addresses resolved")))
}

fn tune_socket(stream: &TcpStream, cfg: &Configuration) -> io::Result<()> {
    let sock = SockRef::from(stream);
    sock.set_tcp_keepalive(&TcpKeepalive::new().with_time(cfg.keep_alive))?;
    sock.set_linger(Some(cfg.tcp_linger))?;
    Ok(())
}

/// Issue `CONNECT host:port` through an already-dialed proxy connection.
async fn establish_tunnel(
    stream: &mut TcpStream,
    host: &str,
    port: u16,
    proxy: &ProxySettings,
) -> Result<(), GatherError> {
    let target = format!("{host}:{port}");

    let mut request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n");
    if let Some(auth) = proxy.auth_header() {
        request.push_str(&format!("Proxy-Authorization: {auth}\r\n"));
    }
    request.push_str("\r\n");

    stream
        .write_all(request.as_bytes())
        .await
        .map_err(|e| GatherError::Io {
            phase: "sending CONNECT",
            target: target.clone(),
            source: e,
        })?;

    // Read until the end of the proxy's header block.
    let mut response = Vec::with_capacity(256);
    let mut buf = [0u8; 512];
    loop {
        let n = stream.read(&mut buf).await.map_err(|e| GatherError::Io {
            phase: "reading CONNECT response",
            target: target.clone(),
            source: e,
        })?;
        if n == 0 {
            return Err(GatherError::TunnelRefused {
                target,
                status_line: "proxy closed the connection".to_string(),
            });
        }
        response.extend_from_slice(&buf[..n]);
        if response.windows(4).any(|w| w == b"\r\n\r\n") || response.len() > 8 * 1024 {
            break;
        }
    }

    let head = String::from_utf8_lossy(&response);
    let status_line = head.lines().next().unwrap_or("").to_string();
    let established = status_line.starts_with("HTTP/1.1 200") || status_line.starts_with("HTTP/1.0 200");
    if !established {
        return Err(GatherError::TunnelRefused {
            target,
            status_line,
        });
    }

    tracing::debug!(target = %target, proxy = %proxy.host(), "proxy tunnel established");
    Ok(())
}
