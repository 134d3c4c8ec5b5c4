use std::fmt;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

use log::*;
use tokio::net::lookup_host;

pub const DNS_PORT: u16 = 53;
pub const PROXY_PORT: u16 = 7890;

/// A `host:port` pair. The host is kept as given (name or IP literal) so it
/// can be forwarded to a SOCKS5 proxy unresolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    host: String,
    port: u16,
}

#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    #[error("Empty host in endpoint: {0:?}")]
    EmptyHost(String),
    #[error("Invalid port in endpoint: {0:?}")]
    InvalidPort(String),
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Endpoint {
            host: host.into(),
            port,
        }
    }

    pub fn dns_server(input: &str) -> Result<Self, EndpointError> {
        Self::parse(input, DNS_PORT)
    }

    pub fn proxy(input: &str) -> Result<Self, EndpointError> {
        Self::parse(input, PROXY_PORT)
    }

    /// Parses `host`, `host:port`, `ipv6`, `[ipv6]` or `[ipv6]:port`,
    /// filling in `default_port` when no port is present.
    pub fn parse(input: &str, default_port: u16) -> Result<Self, EndpointError> {
        let input = input.trim();
        if let Ok(ip) = Ipv6Addr::from_str(input) {
            return Ok(Endpoint::new(ip.to_string(), default_port));
        }

        let (host, port) = if let Some(rest) = input.strip_prefix('[') {
            let Some((host, tail)) = rest.split_once(']') else {
                return Err(EndpointError::InvalidPort(input.into()));
            };
            match tail {
                "" => (host, None),
                _ => match tail.strip_prefix(':') {
                    Some(port) => (host, Some(port)),
                    None => return Err(EndpointError::InvalidPort(input.into())),
                },
            }
        } else {
            match input.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (input, None),
            }
        };

        if host.is_empty() {
            return Err(EndpointError::EmptyHost(input.into()));
        }
        let port = match port {
            Some(port) => port
                .parse::<u16>()
                .map_err(|_| EndpointError::InvalidPort(input.into()))?,
            None => default_port,
        };
        Ok(Endpoint::new(host, port))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn ip(&self) -> Option<IpAddr> {
        self.host.parse().ok()
    }

    /// Resolves to the first socket address the system resolver returns.
    pub async fn resolve(&self) -> std::io::Result<SocketAddr> {
        if let Some(ip) = self.ip() {
            return Ok(SocketAddr::new(ip, self.port));
        }
        let addr = lookup_host((self.host.as_str(), self.port))
            .await?
            .next()
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("Failed to resolve {}", self.host),
                )
            })?;
        trace!("Resolved {self} => {addr}");
        Ok(addr)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Endpoint::new(addr.ip().to_string(), addr.port())
    }
}
