use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::*;
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::Instant;

use crate::endpoint::Endpoint;
use crate::socks::{self, SocksError, TargetAddr};

/// Room for the largest SOCKS5 UDP header (domain ATYP).
const SOCKS_UDP_HEADER_MAX: usize = 3 + 1 + 1 + 255 + 2;

/// A connected datagram conduit to one DNS server.
#[async_trait]
pub trait Channel: Send {
    async fn send(&mut self, datagram: &[u8]) -> io::Result<usize>;

    /// Receives one datagram, failing with `TimedOut` once the channel's
    /// receive timeout expires.
    async fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Failed to resolve {0}: {1}")]
    Resolve(Endpoint, io::Error),
    #[error("Failed to open UDP socket: {0}")]
    Socket(io::Error),
    #[error("Failed to connect to proxy {0}: {1}")]
    ProxyConnect(Endpoint, io::Error),
    #[error("Proxy {0} failed: {1}")]
    Proxy(Endpoint, SocksError),
    #[error("Timed out negotiating with proxy {0}")]
    ProxyTimeout(Endpoint),
}

/// Counts channels that are open right now; each channel holds a guard
/// that decrements the count when dropped.
#[derive(Debug, Clone, Default)]
pub struct OpenChannels(Arc<AtomicUsize>);

impl OpenChannels {
    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    fn track(&self) -> ChannelGuard {
        self.0.fetch_add(1, Ordering::SeqCst);
        ChannelGuard(self.0.clone())
    }
}

#[derive(Debug)]
struct ChannelGuard(Arc<AtomicUsize>);

impl Drop for ChannelGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Opens a channel to `server`, relayed through `proxy` when one is given.
pub async fn open(
    server: &Endpoint,
    proxy: Option<&Endpoint>,
    timeout: Duration,
    open_channels: &OpenChannels,
) -> Result<Box<dyn Channel>, ConnectionError> {
    let channel: Box<dyn Channel> = match proxy {
        None => Box::new(DirectChannel::open(server, timeout, open_channels).await?),
        Some(proxy) => Box::new(SocksChannel::open(server, proxy, timeout, open_channels).await?),
    };
    Ok(channel)
}

fn unspecified_for(addr: &SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
    }
}

async fn connected_udp(peer: SocketAddr) -> Result<UdpSocket, ConnectionError> {
    let socket = UdpSocket::bind(unspecified_for(&peer))
        .await
        .map_err(ConnectionError::Socket)?;
    socket
        .connect(peer)
        .await
        .map_err(ConnectionError::Socket)?;
    Ok(socket)
}

async fn recv_until(socket: &UdpSocket, buf: &mut [u8], deadline: Instant) -> io::Result<usize> {
    match tokio::time::timeout_at(deadline, socket.recv(buf)).await {
        Ok(received) => received,
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "No reply in time")),
    }
}

pub struct DirectChannel {
    socket: UdpSocket,
    timeout: Duration,
    _guard: ChannelGuard,
}

impl DirectChannel {
    async fn open(
        server: &Endpoint,
        timeout: Duration,
        open_channels: &OpenChannels,
    ) -> Result<Self, ConnectionError> {
        let server_addr = server
            .resolve()
            .await
            .map_err(|e| ConnectionError::Resolve(server.clone(), e))?;
        let socket = connected_udp(server_addr).await?;
        let local_addr = socket.local_addr().map_err(ConnectionError::Socket)?;
        debug!("Direct channel {local_addr} => {server_addr}");
        Ok(DirectChannel {
            socket,
            timeout,
            _guard: open_channels.track(),
        })
    }
}

#[async_trait]
impl Channel for DirectChannel {
    async fn send(&mut self, datagram: &[u8]) -> io::Result<usize> {
        self.socket.send(datagram).await
    }

    async fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        recv_until(&self.socket, buf, Instant::now() + self.timeout).await
    }
}

/// UDP relayed through a SOCKS5 UDP-associate session. The TCP control
/// connection must stay open for as long as the association is used.
pub struct SocksChannel {
    _control: TcpStream,
    socket: UdpSocket,
    target: TargetAddr,
    timeout: Duration,
    _guard: ChannelGuard,
}

impl SocksChannel {
    async fn open(
        server: &Endpoint,
        proxy: &Endpoint,
        timeout: Duration,
        open_channels: &OpenChannels,
    ) -> Result<Self, ConnectionError> {
        let proxy_addr = proxy
            .resolve()
            .await
            .map_err(|e| ConnectionError::Resolve(proxy.clone(), e))?;

        let (control, relay) = tokio::time::timeout(timeout, async {
            let mut control = TcpStream::connect(proxy_addr)
                .await
                .map_err(|e| ConnectionError::ProxyConnect(proxy.clone(), e))?;
            let relay = Self::negotiate(&mut control, proxy_addr)
                .await
                .map_err(|e| ConnectionError::Proxy(proxy.clone(), e))?;
            Ok::<_, ConnectionError>((control, relay))
        })
        .await
        .map_err(|_| ConnectionError::ProxyTimeout(proxy.clone()))??;

        let socket = connected_udp(relay).await?;
        debug!("Socks channel via {proxy} (relay {relay}) => {server}");
        Ok(SocksChannel {
            _control: control,
            socket,
            target: TargetAddr::from(server),
            timeout,
            _guard: open_channels.track(),
        })
    }

    async fn negotiate(
        control: &mut TcpStream,
        proxy_addr: SocketAddr,
    ) -> Result<SocketAddr, SocksError> {
        socks::handshake(control).await?;
        let relay = socks::udp_associate(control, unspecified_for(&proxy_addr)).await?;
        let relay = match relay {
            TargetAddr::Ip(addr) if addr.ip().is_unspecified() => {
                SocketAddr::new(proxy_addr.ip(), addr.port())
            }
            TargetAddr::Ip(addr) => addr,
            TargetAddr::Domain(host, port) => Endpoint::new(host, port).resolve().await?,
        };
        Ok(relay)
    }

    /// Relays report the source as an IP; a target given by name can only
    /// be matched on its port.
    fn is_from_target(&self, source: &TargetAddr) -> bool {
        match (&self.target, source) {
            (TargetAddr::Ip(target), TargetAddr::Ip(source)) => target == source,
            (TargetAddr::Domain(host, port), TargetAddr::Domain(source_host, source_port)) => {
                host.eq_ignore_ascii_case(source_host) && port == source_port
            }
            (TargetAddr::Domain(_, port), TargetAddr::Ip(source)) => *port == source.port(),
            (TargetAddr::Ip(_), TargetAddr::Domain(..)) => false,
        }
    }
}

#[async_trait]
impl Channel for SocksChannel {
    async fn send(&mut self, datagram: &[u8]) -> io::Result<usize> {
        let wrapped = socks::encode_udp_datagram(&self.target, datagram)?;
        self.socket.send(&wrapped).await?;
        Ok(datagram.len())
    }

    async fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut wrapped = vec![0u8; buf.len() + SOCKS_UDP_HEADER_MAX];
        let deadline = Instant::now() + self.timeout;
        loop {
            let n = recv_until(&self.socket, &mut wrapped, deadline).await?;
            let (source, payload) = socks::decode_udp_datagram(&wrapped[..n])?;
            if !self.is_from_target(&source) {
                warn!(
                    "Dropping {} relayed bytes from {source:?}, expected {:?}",
                    payload.len(),
                    self.target
                );
                continue;
            }
            trace!("Relayed {} bytes from {source:?}", payload.len());
            let len = payload.len().min(buf.len());
            buf[..len].copy_from_slice(&payload[..len]);
            return Ok(len);
        }
    }
}
