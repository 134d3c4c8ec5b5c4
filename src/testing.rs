//! Loopback DNS server and SOCKS5 UDP relay used by the tests.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hickory_proto::op::{Message, MessageType};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{RData, Record};
use log::*;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::endpoint::Endpoint;
use crate::socks::{
    decode_udp_datagram, encode_udp_datagram, TargetAddr, NO_ACCEPTABLE_METHODS, NO_AUTH,
    SOCKS_UDP_ASSOCIATE, SOCKS_VERSION,
};

type Responder = Box<dyn Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync>;

pub struct MockDns {
    addr: SocketAddr,
    received: Arc<Mutex<Vec<Vec<u8>>>>,
    task: JoinHandle<()>,
}

impl MockDns {
    pub async fn start(respond: Responder) -> io::Result<Self> {
        let socket = UdpSocket::bind("127.0.0.1:0").await?;
        let addr = socket.local_addr()?;
        let received = Arc::new(Mutex::new(Vec::new()));
        let log = received.clone();
        let task = tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            while let Ok((n, peer)) = socket.recv_from(&mut buf).await {
                log.lock().unwrap().push(buf[..n].to_vec());
                if let Some(reply) = respond(&buf[..n]) {
                    socket.send_to(&reply, peer).await.ok();
                }
            }
        });
        Ok(MockDns {
            addr,
            received,
            task,
        })
    }

    pub async fn echo() -> io::Result<Self> {
        Self::start(Box::new(|datagram| Some(datagram.to_vec()))).await
    }

    /// Answers every A query with `addrs`, in order.
    pub async fn answering(addrs: Vec<Ipv4Addr>) -> io::Result<Self> {
        Self::start(Box::new(move |datagram| answer(datagram, &addrs))).await
    }

    pub async fn replying(bytes: Vec<u8>) -> io::Result<Self> {
        Self::start(Box::new(move |_| Some(bytes.clone()))).await
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::from(self.addr)
    }

    pub fn received(&self) -> usize {
        self.received.lock().unwrap().len()
    }

    pub fn queries(&self) -> Vec<Vec<u8>> {
        self.received.lock().unwrap().clone()
    }
}

impl Drop for MockDns {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn answer(query: &[u8], addrs: &[Ipv4Addr]) -> Option<Vec<u8>> {
    let request = Message::from_vec(query).ok()?;
    let name = request.queries().first()?.name().clone();
    let mut reply = Message::new();
    reply
        .set_id(request.id())
        .set_message_type(MessageType::Response)
        .set_recursion_desired(request.recursion_desired())
        .set_recursion_available(true)
        .add_queries(request.queries().to_vec());
    for addr in addrs {
        reply.add_answer(Record::from_rdata(name.clone(), 60, RData::A(A(*addr))));
    }
    reply.to_vec().ok()
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Mode {
    Relay,
    /// Replies to UDP ASSOCIATE with BND.ADDR 0.0.0.0.
    RelayUnspecified,
    /// Precedes every reply with a datagram from an unrelated source.
    InjectStray,
    /// Reads the greeting and never answers.
    Silent,
    RefuseAuth,
    RefuseAssociate,
}

/// Minimal SOCKS5 proxy that only understands UDP ASSOCIATE.
pub struct MockSocks5 {
    addr: SocketAddr,
    targets: Arc<Mutex<Vec<TargetAddr>>>,
    closed: watch::Receiver<usize>,
    task: JoinHandle<()>,
}

impl MockSocks5 {
    pub async fn start() -> io::Result<Self> {
        Self::with_mode(Mode::Relay).await
    }

    pub async fn unspecified_relay() -> io::Result<Self> {
        Self::with_mode(Mode::RelayUnspecified).await
    }

    pub async fn injecting_stray() -> io::Result<Self> {
        Self::with_mode(Mode::InjectStray).await
    }

    pub async fn silent() -> io::Result<Self> {
        Self::with_mode(Mode::Silent).await
    }

    pub async fn refusing_auth() -> io::Result<Self> {
        Self::with_mode(Mode::RefuseAuth).await
    }

    pub async fn refusing_associate() -> io::Result<Self> {
        Self::with_mode(Mode::RefuseAssociate).await
    }

    async fn with_mode(mode: Mode) -> io::Result<Self> {
        let tcp_listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = tcp_listener.local_addr()?;
        let targets = Arc::new(Mutex::new(Vec::new()));
        let (closed_tx, closed) = watch::channel(0usize);
        let closed_tx = Arc::new(closed_tx);

        let session_targets = targets.clone();
        let task = tokio::spawn(async move {
            while let Ok((tcp_stream, peer)) = tcp_listener.accept().await {
                debug!("Mock proxy accepted {peer}");
                let targets = session_targets.clone();
                let closed_tx = closed_tx.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_client(tcp_stream, mode, targets).await {
                        warn!("{peer} => {e:?}");
                    }
                    closed_tx.send_modify(|closed| *closed += 1);
                });
            }
        });
        Ok(MockSocks5 {
            addr,
            targets,
            closed,
            task,
        })
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::from(self.addr)
    }

    /// Destinations of every datagram relayed so far.
    pub fn targets(&self) -> Vec<TargetAddr> {
        self.targets.lock().unwrap().clone()
    }

    /// Waits until `sessions` control connections have been closed.
    pub async fn wait_closed(&self, sessions: usize) {
        let mut closed = self.closed.clone();
        tokio::time::timeout(Duration::from_secs(2), closed.wait_for(|&n| n >= sessions))
            .await
            .expect("control connection was not closed")
            .expect("mock proxy stopped");
    }
}

impl Drop for MockSocks5 {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn handle_client(
    mut tcp_stream: TcpStream,
    mode: Mode,
    targets: Arc<Mutex<Vec<TargetAddr>>>,
) -> io::Result<()> {
    let mut header = [0u8; 2];
    tcp_stream.read_exact(&mut header).await?;
    let [protocol, auth_methods] = header;
    let mut methods = vec![0u8; auth_methods as usize];
    tcp_stream.read_exact(&mut methods).await?;
    trace!("Protocol: {protocol}, Methods: {methods:?}");

    if mode == Mode::Silent {
        let mut rest = Vec::new();
        tcp_stream.read_to_end(&mut rest).await?;
        return Ok(());
    }

    if mode == Mode::RefuseAuth || !methods.contains(&NO_AUTH) {
        return tcp_stream
            .write_all(&[SOCKS_VERSION, NO_ACCEPTABLE_METHODS])
            .await;
    }
    tcp_stream.write_all(&[SOCKS_VERSION, NO_AUTH]).await?;

    let mut request = [0u8; 3];
    tcp_stream.read_exact(&mut request).await?;
    let client_hint = TargetAddr::read_from(&mut tcp_stream).await?;
    trace!("Request: {request:?}, client hint: {client_hint:?}");
    if request[1] != SOCKS_UDP_ASSOCIATE || mode == Mode::RefuseAssociate {
        return tcp_stream
            .write_all(&[SOCKS_VERSION, 0x07, 0, 1, 0, 0, 0, 0, 0, 0])
            .await;
    }

    let relay = UdpSocket::bind("127.0.0.1:0").await?;
    let upstream = UdpSocket::bind("127.0.0.1:0").await?;
    let relay_addr = relay.local_addr()?;
    let bound_ip = match mode {
        Mode::RelayUnspecified => [0, 0, 0, 0],
        _ => [127, 0, 0, 1],
    };
    let mut reply = vec![SOCKS_VERSION, 0, 0, 1];
    reply.extend_from_slice(&bound_ip);
    reply.extend_from_slice(&relay_addr.port().to_be_bytes());
    tcp_stream.write_all(&reply).await?;

    let mut client: Option<SocketAddr> = None;
    let mut probe = [0u8; 1];
    let mut buf = vec![0u8; 4096];
    let mut reply_buf = vec![0u8; 4096];
    loop {
        tokio::select! {
            read = tcp_stream.read(&mut probe) => {
                if matches!(read, Ok(0) | Err(_)) {
                    break;
                }
            }
            received = relay.recv_from(&mut buf) => {
                let (n, peer) = received?;
                client = Some(peer);
                let (target, payload) = decode_udp_datagram(&buf[..n])?;
                targets.lock().unwrap().push(target.clone());
                if let TargetAddr::Ip(target) = target {
                    upstream.send_to(payload, target).await?;
                }
            }
            received = upstream.recv_from(&mut reply_buf) => {
                let (n, source) = received?;
                if let Some(client) = client {
                    if mode == Mode::InjectStray {
                        let stray = TargetAddr::Ip(SocketAddr::from(([192, 0, 2, 1], 53)));
                        relay.send_to(&encode_udp_datagram(&stray, b"stray")?, client).await?;
                    }
                    let wrapped = encode_udp_datagram(&TargetAddr::Ip(source), &reply_buf[..n])?;
                    relay.send_to(&wrapped, client).await?;
                }
            }
        }
    }
    Ok(())
}
