//! `host:port` address strings, resolved to IPv4.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use crate::error::TetherError;

/// A parsed and resolved TCP endpoint address.
///
/// The input format is `host:port`, split at the *last* colon. A host
/// that is not a dotted-decimal IPv4 literal is resolved via DNS; only
/// IPv4 results are considered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpAddress {
    host: Ipv4Addr,
    port: u16,
}

impl TcpAddress {
    /// Parses and (if needed) resolves `address`.
    pub async fn resolve(address: &str) -> Result<Self, TetherError> {
        let (host, port) = split_host_port(address)?;

        let host = match host.parse::<Ipv4Addr>() {
            Ok(ip) => ip,
            Err(_) => resolve_name(host, port).await?,
        };

        Ok(Self { host, port })
    }

    pub fn host(&self) -> Ipv4Addr {
        self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// The resolved address as a connectable `SocketAddr`.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.host, self.port))
    }
}

impl std::fmt::Display for TcpAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Splits `host:port` at the last colon. Fails with `InvalidAddress`
/// when the colon is missing or either side is empty or the port is
/// not a decimal number.
pub fn split_host_port(address: &str) -> Result<(&str, u16), TetherError> {
    let pos = address
        .rfind(':')
        .ok_or_else(|| TetherError::InvalidAddress(format!("{address}, port not specified")))?;

    let (host, port) = (&address[..pos], &address[pos + 1..]);

    if host.is_empty() {
        return Err(TetherError::InvalidAddress(format!(
            "{address}, host name not specified"
        )));
    }
    if port.is_empty() {
        return Err(TetherError::InvalidAddress(format!(
            "{address}, port not specified"
        )));
    }

    let port = port
        .parse::<u16>()
        .map_err(|_| TetherError::InvalidAddress(format!("{address}, bad port number")))?;

    Ok((host, port))
}

/// Resolves a hostname via DNS, keeping the first IPv4 result.
async fn resolve_name(host: &str, port: u16) -> Result<Ipv4Addr, TetherError> {
    let addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|_| TetherError::ResolutionError(host.to_string()))?;

    for addr in addrs {
        if let SocketAddr::V4(v4) = addr {
            return Ok(*v4.ip());
        }
    }

    Err(TetherError::ResolutionError(host.to_string()))
}
