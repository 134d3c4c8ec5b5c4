//! Client side of SOCKS5 (RFC 1928): no-auth greeting, UDP ASSOCIATE and
//! the UDP request header wrapped around every relayed datagram.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use log::*;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::endpoint::Endpoint;
use crate::util::u8s_to_u16;

pub(crate) const SOCKS_VERSION: u8 = 0x05;
pub(crate) const SOCKS_UDP_ASSOCIATE: u8 = 0x03;
pub(crate) const NO_AUTH: u8 = 0x00;
pub(crate) const NO_ACCEPTABLE_METHODS: u8 = 0xFF;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SocksResponseCode {
    Success = 0x00,
    Failure = 0x01,
    NotAllowed = 0x02,
    NetworkUnreachable = 0x03,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    TtlExpired = 0x06,
    CommandNotSupported = 0x07,
    AddrTypeNotSupported = 0x08,
}

impl SocksResponseCode {
    fn parse(n: u8) -> Option<SocksResponseCode> {
        let codes = [
            SocksResponseCode::Success,
            SocksResponseCode::Failure,
            SocksResponseCode::NotAllowed,
            SocksResponseCode::NetworkUnreachable,
            SocksResponseCode::HostUnreachable,
            SocksResponseCode::ConnectionRefused,
            SocksResponseCode::TtlExpired,
            SocksResponseCode::CommandNotSupported,
            SocksResponseCode::AddrTypeNotSupported,
        ];
        codes.into_iter().find(|&c| c as u8 == n)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SocksError {
    #[error("Unsupported SOCKS version: {0}")]
    UnsupportedVersion(u8),
    #[error("Proxy rejected no-auth negotiation (method {0:#04x})")]
    AuthRejected(u8),
    #[error("Proxy refused request: {0:?}")]
    Refused(SocksResponseCode),
    #[error("Proxy replied with unknown code: {0}")]
    UnknownReply(u8),
    #[error("Unsupported AddrType: {0}")]
    UnsupportedAddrType(u8),
    #[error("Domain name too long for SOCKS5: {0}")]
    DomainTooLong(String),
    #[error("Fragmented datagram (frag {0}) is not supported")]
    Fragmented(u8),
    #[error("Truncated SOCKS5 UDP header")]
    Truncated,
    #[error("IO Error: {0}")]
    IO(#[from] io::Error),
}

impl From<SocksError> for io::Error {
    fn from(value: SocksError) -> Self {
        if let SocksError::IO(io_err) = value {
            io_err
        } else {
            io::Error::new(io::ErrorKind::InvalidData, value.to_string())
        }
    }
}

#[derive(Debug, Copy, Clone)]
enum AddrType {
    V4 = 1,
    V6 = 4,
    Domain = 3,
}

impl AddrType {
    fn parse(n: u8) -> Option<AddrType> {
        let types = [AddrType::V4, AddrType::Domain, AddrType::V6];
        types.into_iter().find(|&t| t as u8 == n)
    }
}

/// DST/BND address as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl TargetAddr {
    pub fn port(&self) -> u16 {
        match self {
            TargetAddr::Ip(addr) => addr.port(),
            TargetAddr::Domain(_, port) => *port,
        }
    }

    fn write_to(&self, buf: &mut Vec<u8>) -> Result<(), SocksError> {
        match self {
            TargetAddr::Ip(SocketAddr::V4(addr)) => {
                buf.push(AddrType::V4 as u8);
                buf.extend_from_slice(&addr.ip().octets());
            }
            TargetAddr::Ip(SocketAddr::V6(addr)) => {
                buf.push(AddrType::V6 as u8);
                buf.extend_from_slice(&addr.ip().octets());
            }
            TargetAddr::Domain(host, _) => {
                let len = u8::try_from(host.len())
                    .map_err(|_| SocksError::DomainTooLong(host.clone()))?;
                buf.push(AddrType::Domain as u8);
                buf.push(len);
                buf.extend_from_slice(host.as_bytes());
            }
        }
        buf.extend_from_slice(&self.port().to_be_bytes());
        Ok(())
    }

    /// Reads ATYP, address and port from a stream.
    pub(crate) async fn read_from<S: AsyncRead + Unpin>(
        stream: &mut S,
    ) -> Result<TargetAddr, SocksError> {
        let addr_type = stream.read_u8().await?;
        let Some(addr_type) = AddrType::parse(addr_type) else {
            return Err(SocksError::UnsupportedAddrType(addr_type));
        };
        let mut addr = match addr_type {
            AddrType::V4 => vec![0u8; 4],
            AddrType::V6 => vec![0u8; 16],
            AddrType::Domain => vec![0u8; stream.read_u8().await? as usize],
        };
        stream.read_exact(&mut addr).await?;
        let port = u8s_to_u16(stream.read_u8().await?, stream.read_u8().await?);
        Ok(Self::from_parts(addr_type, &addr, port))
    }

    /// Decodes ATYP, address and port from the front of `buf`, returning the
    /// address and the number of bytes consumed.
    fn decode(buf: &[u8]) -> Result<(TargetAddr, usize), SocksError> {
        let (&addr_type, rest) = buf.split_first().ok_or(SocksError::Truncated)?;
        let Some(addr_type) = AddrType::parse(addr_type) else {
            return Err(SocksError::UnsupportedAddrType(addr_type));
        };
        let (start, len) = match addr_type {
            AddrType::V4 => (0, 4),
            AddrType::V6 => (0, 16),
            AddrType::Domain => (1, *rest.first().ok_or(SocksError::Truncated)? as usize),
        };
        let end = start + len;
        if rest.len() < end + 2 {
            return Err(SocksError::Truncated);
        }
        let port = u8s_to_u16(rest[end], rest[end + 1]);
        let addr = Self::from_parts(addr_type, &rest[start..end], port);
        Ok((addr, 1 + end + 2))
    }

    fn from_parts(addr_type: AddrType, addr: &[u8], port: u16) -> TargetAddr {
        match addr_type {
            AddrType::V4 => {
                let ip = Ipv4Addr::new(addr[0], addr[1], addr[2], addr[3]);
                TargetAddr::Ip(SocketAddr::new(IpAddr::V4(ip), port))
            }
            AddrType::V6 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(addr);
                TargetAddr::Ip(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
            }
            AddrType::Domain => {
                TargetAddr::Domain(String::from_utf8_lossy(addr).into_owned(), port)
            }
        }
    }
}

impl From<&Endpoint> for TargetAddr {
    fn from(endpoint: &Endpoint) -> Self {
        match endpoint.ip() {
            Some(ip) => TargetAddr::Ip(SocketAddr::new(ip, endpoint.port())),
            None => TargetAddr::Domain(endpoint.host().to_string(), endpoint.port()),
        }
    }
}

/// Offers only the no-auth method and expects the proxy to accept it.
pub async fn handshake<S>(stream: &mut S) -> Result<(), SocksError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&[SOCKS_VERSION, 1, NO_AUTH]).await?;

    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;
    let [protocol, method] = header;
    trace!("Protocol: {protocol}, Method: {method}");
    if protocol != SOCKS_VERSION {
        return Err(SocksError::UnsupportedVersion(protocol));
    }
    if method != NO_AUTH {
        if method == NO_ACCEPTABLE_METHODS {
            warn!("Proxy accepts none of the offered auth methods");
        }
        return Err(SocksError::AuthRejected(method));
    }
    Ok(())
}

/// Sends UDP ASSOCIATE and returns the relay address (BND.ADDR/BND.PORT).
pub async fn udp_associate<S>(stream: &mut S, bind: SocketAddr) -> Result<TargetAddr, SocksError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut request = vec![SOCKS_VERSION, SOCKS_UDP_ASSOCIATE, 0];
    TargetAddr::Ip(bind).write_to(&mut request)?;
    stream.write_all(&request).await?;

    let mut header = [0u8; 3];
    stream.read_exact(&mut header).await?;
    let [socks, reply, _] = header;
    if socks != SOCKS_VERSION {
        return Err(SocksError::UnsupportedVersion(socks));
    }
    match SocksResponseCode::parse(reply) {
        Some(SocksResponseCode::Success) => {}
        Some(code) => return Err(SocksError::Refused(code)),
        None => return Err(SocksError::UnknownReply(reply)),
    }
    let relay = TargetAddr::read_from(stream).await?;
    debug!("UDP ASSOCIATE accepted, relay at {relay:?}");
    Ok(relay)
}

/// Prefixes `payload` with the RFC 1928 §7 UDP request header.
pub fn encode_udp_datagram(target: &TargetAddr, payload: &[u8]) -> Result<Vec<u8>, SocksError> {
    let mut datagram = Vec::with_capacity(payload.len() + 22);
    datagram.extend_from_slice(&[0, 0, 0]);
    target.write_to(&mut datagram)?;
    datagram.extend_from_slice(payload);
    Ok(datagram)
}

/// Splits a relayed datagram into its source address and payload.
pub fn decode_udp_datagram(datagram: &[u8]) -> Result<(TargetAddr, &[u8]), SocksError> {
    if datagram.len() < 4 {
        return Err(SocksError::Truncated);
    }
    let frag = datagram[2];
    if frag != 0 {
        return Err(SocksError::Fragmented(frag));
    }
    let (addr, consumed) = TargetAddr::decode(&datagram[3..])?;
    Ok((addr, &datagram[3 + consumed..]))
}
