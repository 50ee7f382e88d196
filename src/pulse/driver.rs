//! Probe drivers.
//!
//! A driver performs one health check and reports the outcome; the
//! supervisor owns scheduling, metrics and publication. Drivers are
//! stateless across calls.

use super::metrics::Status;
use super::options::{PulseKind, PulseOptions};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// Per-probe I/O timeout, applied to connects, writes and reads.
pub const CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// A single-shot health probe against one backend endpoint.
#[derive(Debug, Clone)]
pub enum Checker {
    /// TCP connect probe; up on a successful connect.
    Tcp {
        /// Backend endpoint.
        endpoint: SocketAddr,
    },
    /// Raw HTTP/1.1 request probe; up when the response status matches.
    /// Redirects are never followed, so a 3xx only passes an explicit
    /// 3xx expectation.
    Http {
        /// Backend endpoint.
        endpoint: SocketAddr,
        /// Request method.
        method: String,
        /// Request path.
        path: String,
        /// Expected response status code.
        expect: u16,
    },
    /// Probing disabled; always reports up.
    None,
}

impl Checker {
    /// Builds a checker for `ip:port` from validated pulse options.
    #[must_use]
    pub fn build(ip: IpAddr, port: u16, opts: &PulseOptions) -> Self {
        let endpoint = SocketAddr::new(ip, port);
        match opts.kind {
            PulseKind::Tcp => Self::Tcp { endpoint },
            PulseKind::Http => {
                let mut path = opts.args.get_str("path", "/");
                if !path.starts_with('/') {
                    path.insert(0, '/');
                }
                Self::Http {
                    endpoint,
                    method: opts.args.get_str("method", "GET"),
                    path,
                    expect: opts.args.get_u16("expect", 200),
                }
            }
            PulseKind::None => Self::None,
        }
    }

    /// Runs one probe and reports the backend status.
    pub async fn check(&self) -> Status {
        match self {
            Self::Tcp { endpoint } => check_tcp(*endpoint).await,
            Self::Http {
                endpoint,
                method,
                path,
                expect,
            } => check_http(*endpoint, method, path, *expect).await,
            Self::None => Status::Up,
        }
    }
}

async fn check_tcp(endpoint: SocketAddr) -> Status {
    match timeout(CHECK_TIMEOUT, TcpStream::connect(endpoint)).await {
        Ok(Ok(_)) => Status::Up,
        Ok(Err(e)) => {
            debug!(backend = %endpoint, error = %e, "TCP probe failed");
            Status::Down
        }
        Err(_) => {
            debug!(backend = %endpoint, "TCP probe timed out");
            Status::Down
        }
    }
}

async fn check_http(endpoint: SocketAddr, method: &str, path: &str, expect: u16) -> Status {
    let stream = match timeout(CHECK_TIMEOUT, TcpStream::connect(endpoint)).await {
        Ok(Ok(s)) => s,
        Ok(Err(e)) => {
            debug!(backend = %endpoint, error = %e, "HTTP probe connect failed");
            return Status::Down;
        }
        Err(_) => {
            debug!(backend = %endpoint, "HTTP probe timed out");
            return Status::Down;
        }
    };

    match http_status(stream, endpoint, method, path).await {
        Ok(code) if code == expect => Status::Up,
        Ok(code) => {
            debug!(backend = %endpoint, code, expect, "HTTP probe status mismatch");
            Status::Down
        }
        Err(reason) => {
            debug!(backend = %endpoint, reason, "HTTP probe failed");
            Status::Down
        }
    }
}

/// Issues a minimal HTTP/1.1 request and parses the response status code.
async fn http_status(
    mut stream: TcpStream,
    endpoint: SocketAddr,
    method: &str,
    path: &str,
) -> Result<u16, &'static str> {
    let request = format!(
        "{method} {path} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        endpoint.ip()
    );

    match timeout(CHECK_TIMEOUT, stream.write_all(request.as_bytes())).await {
        Ok(Ok(())) => {}
        Ok(Err(_)) => return Err("request write failed"),
        Err(_) => return Err("request write timed out"),
    }

    let mut reader = BufReader::new(stream);
    let mut status_line = String::new();
    match timeout(CHECK_TIMEOUT, reader.read_line(&mut status_line)).await {
        Ok(Ok(_)) => {}
        Ok(Err(_)) => return Err("response read failed"),
        Err(_) => return Err("response read timed out"),
    }

    status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .ok_or("malformed status line")
}
