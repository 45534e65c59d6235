//! LAN rendezvous: UDP broadcast beacons plus TCP connections.
//!
//! Server-mode members listen on an ephemeral TCP port and periodically
//! broadcast a beacon carrying the topic's discovery key, their peer id and
//! that port. Client-mode members listen for beacons (and dial configured
//! static peers), connect over TCP and exchange a framed hello that confirms
//! both sides joined the same topic.

use super::framing::{read_frame, write_frame, FrameDecoder};
use super::{ConnectionCallback, JoinMode, Membership, PeerConnection, PeerId, Rendezvous, RendezvousError, Topic};
use crate::config::RendezvousConfig;
use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashSet;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};

const BEACON_VERSION: u8 = 1;

/// Discovery datagram sent by server-mode members
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Beacon {
    pub v: u8,
    pub key: String,
    pub peer: String,
    pub port: u16,
}

impl Beacon {
    fn new(topic: &Topic, peer: &PeerId, port: u16) -> Self {
        Self {
            v: BEACON_VERSION,
            key: format!("{:016x}", topic.discovery_key()),
            peer: peer.as_str().to_string(),
            port,
        }
    }

    fn matches(&self, topic: &Topic) -> bool {
        self.v == BEACON_VERSION && self.key == format!("{:016x}", topic.discovery_key())
    }
}

/// First frame on every TCP connection
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Hello {
    peer: String,
    key: String,
}

/// Set of peers with a live connection; entries drop with their stream.
#[derive(Clone, Default)]
struct LiveSet(Arc<Mutex<HashSet<PeerId>>>);

impl LiveSet {
    fn claim(&self, id: &PeerId) -> Option<LiveGuard> {
        if self.0.lock().insert(id.clone()) {
            Some(LiveGuard { id: id.clone(), set: self.clone() })
        } else {
            None
        }
    }
}

struct LiveGuard {
    id: PeerId,
    set: LiveSet,
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.set.0.lock().remove(&self.id);
    }
}

/// TCP stream that releases its live-set entry when dropped.
///
/// Bytes the handshake read past the hello are replayed before the socket.
struct TrackedStream {
    inner: TcpStream,
    pending: BytesMut,
    _guard: LiveGuard,
}

impl AsyncRead for TrackedStream {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        if !self.pending.is_empty() {
            let n = self.pending.len().min(buf.remaining());
            buf.put_slice(&self.pending[..n]);
            self.pending.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for TrackedStream {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Everything a background discovery task needs
#[derive(Clone)]
struct JoinContext {
    topic: Topic,
    local_id: PeerId,
    mode: JoinMode,
    live: LiveSet,
    on_connection: ConnectionCallback,
    handshake_timeout: Duration,
}

impl JoinContext {
    /// Exchange hellos. Returns the remote id and whatever followed the
    /// remote hello in the same reads.
    async fn handshake(&self, stream: &mut TcpStream) -> Result<(PeerId, BytesMut), RendezvousError> {
        let hello = Hello {
            peer: self.local_id.as_str().to_string(),
            key: format!("{:016x}", self.topic.discovery_key()),
        };
        let payload = serde_json::to_vec(&hello).map_err(|e| RendezvousError::Handshake(e.to_string()))?;

        let mut decoder = FrameDecoder::new();
        let exchange = async {
            write_frame(stream, &payload).await?;
            read_frame(stream, &mut decoder).await
        };
        let frame = tokio::time::timeout(self.handshake_timeout, exchange)
            .await
            .map_err(|_| RendezvousError::Handshake("timed out".to_string()))?
            .map_err(|e| RendezvousError::Handshake(e.to_string()))?
            .ok_or_else(|| RendezvousError::Handshake("closed before hello".to_string()))?;

        let remote: Hello = serde_json::from_slice(&frame).map_err(|e| RendezvousError::Handshake(e.to_string()))?;
        if remote.key != hello.key {
            return Err(RendezvousError::Handshake("topic mismatch".to_string()));
        }
        let remote_id = PeerId::new(remote.peer);
        if remote_id == self.local_id {
            return Err(RendezvousError::Handshake("connected to self".to_string()));
        }
        Ok((remote_id, decoder.take_remaining()))
    }

    fn deliver(&self, remote_id: PeerId, stream: TcpStream, pending: BytesMut, guard: LiveGuard) {
        let _ = stream.set_nodelay(true);
        info!("Rendezvous connection established with {}", remote_id.short());
        (self.on_connection)(PeerConnection {
            remote_id,
            stream: Box::new(TrackedStream { inner: stream, pending, _guard: guard }),
        });
    }

    async fn accept(self, mut stream: TcpStream, addr: SocketAddr) {
        let (remote_id, pending) = match self.handshake(&mut stream).await {
            Ok(handshake) => handshake,
            Err(e) => {
                debug!("Rejected inbound connection from {}: {}", addr, e);
                return;
            }
        };
        match self.live.claim(&remote_id) {
            Some(guard) => self.deliver(remote_id, stream, pending, guard),
            None => debug!("Duplicate inbound connection from {}, dropping", remote_id.short()),
        }
    }

    async fn dial(self, addr: SocketAddr, expected: Option<PeerId>) {
        let guard = match &expected {
            Some(id) => match self.live.claim(id) {
                Some(guard) => Some(guard),
                None => return,
            },
            None => None,
        };

        let mut stream = match TcpStream::connect(addr).await {
            Ok(stream) => stream,
            Err(e) => {
                debug!("Dial {} failed: {}", addr, e);
                return;
            }
        };
        let (remote_id, pending) = match self.handshake(&mut stream).await {
            Ok(handshake) => handshake,
            Err(e) => {
                warn!("Handshake with {} failed: {}", addr, e);
                return;
            }
        };

        let guard = match guard {
            Some(guard) if Some(&remote_id) == expected.as_ref() => guard,
            Some(_) => {
                warn!("Peer at {} answered with an unexpected id", addr);
                return;
            }
            None => match self.live.claim(&remote_id) {
                Some(guard) => guard,
                None => return,
            },
        };
        self.deliver(remote_id, stream, pending, guard);
    }

    /// Whether a beacon from `remote` should be dialed by this member.
    ///
    /// Beacons come only from server-mode members; when both ends are servers
    /// only the lower id dials so each pair connects once.
    fn should_dial(&self, remote: &PeerId) -> bool {
        remote != &self.local_id && (!self.mode.is_server() || self.local_id < *remote)
    }
}

/// Bind the beacon listener so several members on one host can share the
/// well-known port.
fn bind_beacon_listener(addr: SocketAddr) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    socket.set_reuse_port(true)?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    UdpSocket::from_std(socket.into())
}

/// Rendezvous over the local network.
pub struct LanRendezvous {
    config: RendezvousConfig,
    local_id: PeerId,
}

impl LanRendezvous {
    pub fn new(config: RendezvousConfig) -> Self {
        Self { config, local_id: PeerId::random() }
    }

    fn bind_ip(&self) -> Result<IpAddr, RendezvousError> {
        self.config
            .bind_host
            .parse()
            .map_err(|_| RendezvousError::Unavailable(format!("invalid bind host {}", self.config.bind_host)))
    }
}

#[async_trait]
impl Rendezvous for LanRendezvous {
    fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    async fn join(
        &self,
        topic: &Topic,
        mode: JoinMode,
        on_connection: ConnectionCallback,
    ) -> Result<Membership, RendezvousError> {
        let bind_ip = self.bind_ip()?;
        let ctx = JoinContext {
            topic: *topic,
            local_id: self.local_id.clone(),
            mode,
            live: LiveSet::default(),
            on_connection,
            handshake_timeout: Duration::from_millis(self.config.handshake_timeout_ms),
        };
        let announce_every = Duration::from_millis(self.config.announce_interval_ms);
        let mut membership = Membership::new(*topic);

        if mode.is_server() {
            let listen_addr = SocketAddr::new(bind_ip, 0);
            let listener = TcpListener::bind(listen_addr)
                .await
                .map_err(|e| RendezvousError::Bind(listen_addr.to_string(), e))?;
            let port = listener.local_addr()?.port();

            let accept_ctx = ctx.clone();
            membership = membership.with_task(tokio::spawn(async move {
                loop {
                    match listener.accept().await {
                        Ok((stream, addr)) => {
                            tokio::spawn(accept_ctx.clone().accept(stream, addr));
                        }
                        Err(e) => {
                            warn!("Rendezvous accept failed: {}", e);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
            }));

            let beacon_socket = UdpSocket::bind(SocketAddr::new(bind_ip, 0))
                .await
                .map_err(|e| RendezvousError::Bind("beacon sender".to_string(), e))?;
            beacon_socket.set_broadcast(true)?;
            let target = format!("{}:{}", self.config.beacon_addr, self.config.beacon_port);
            let beacon = serde_json::to_vec(&Beacon::new(topic, &self.local_id, port))
                .map_err(|e| RendezvousError::Unavailable(e.to_string()))?;
            membership = membership.with_task(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(announce_every);
                loop {
                    ticker.tick().await;
                    if let Err(e) = beacon_socket.send_to(&beacon, &target).await {
                        debug!("Beacon send to {} failed: {}", target, e);
                    }
                }
            }));
            info!("Announcing topic on TCP port {}", port);
        }

        let beacon_addr = SocketAddr::new(bind_ip, self.config.beacon_port);
        match bind_beacon_listener(beacon_addr) {
            Ok(socket) => {
                let listen_ctx = ctx.clone();
                membership = membership.with_task(tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    loop {
                        let (len, src) = match socket.recv_from(&mut buf).await {
                            Ok(received) => received,
                            Err(e) => {
                                debug!("Beacon receive failed: {}", e);
                                continue;
                            }
                        };
                        let beacon: Beacon = match serde_json::from_slice(&buf[..len]) {
                            Ok(beacon) => beacon,
                            Err(_) => continue,
                        };
                        if !beacon.matches(&listen_ctx.topic) {
                            continue;
                        }
                        let remote = PeerId::new(beacon.peer);
                        if listen_ctx.should_dial(&remote) {
                            let addr = SocketAddr::new(src.ip(), beacon.port);
                            tokio::spawn(listen_ctx.clone().dial(addr, Some(remote)));
                        }
                    }
                }));
            }
            Err(e) if mode.is_server() || !self.config.static_peers.is_empty() => {
                warn!("Beacon listener unavailable on {}: {}", beacon_addr, e);
            }
            Err(e) => return Err(RendezvousError::Bind(beacon_addr.to_string(), e)),
        }

        let static_peers: Vec<SocketAddr> = self
            .config
            .static_peers
            .iter()
            .filter_map(|p| p.parse().ok())
            .collect();
        if !static_peers.is_empty() {
            let dial_ctx = ctx.clone();
            membership = membership.with_task(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(announce_every);
                loop {
                    ticker.tick().await;
                    for addr in &static_peers {
                        tokio::spawn(dial_ctx.clone().dial(*addr, None));
                    }
                }
            }));
        }

        Ok(membership)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::framing::frame_packet;
    use tokio::io::AsyncWriteExt;
    use tokio::sync::mpsc;

    fn ctx(mode: JoinMode, topic: Topic, id: &str) -> (JoinContext, mpsc::UnboundedReceiver<PeerConnection>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let ctx = JoinContext {
            topic,
            local_id: PeerId::new(id),
            mode,
            live: LiveSet::default(),
            on_connection: Arc::new(move |conn| {
                let _ = tx.send(conn);
            }),
            handshake_timeout: Duration::from_secs(2),
        };
        (ctx, rx)
    }

    #[test]
    fn beacon_matches_topic() {
        let topic = Topic::random();
        let beacon = Beacon::new(&topic, &PeerId::new("aa"), 4000);
        assert!(beacon.matches(&topic));
        assert!(!beacon.matches(&Topic::random()));
    }

    #[test]
    fn only_lower_server_dials_another_server() {
        let topic = Topic::random();
        let (low, _) = ctx(JoinMode::ClientAndServer, topic, "11");
        let (client, _) = ctx(JoinMode::Client, topic, "ff");
        assert!(low.should_dial(&PeerId::new("22")));
        assert!(!low.should_dial(&PeerId::new("00")));
        assert!(!low.should_dial(&PeerId::new("11")));
        assert!(client.should_dial(&PeerId::new("00")));
    }

    #[test]
    fn live_set_releases_on_drop() {
        let live = LiveSet::default();
        let id = PeerId::new("ab");
        let guard = live.claim(&id).unwrap();
        assert!(live.claim(&id).is_none());
        drop(guard);
        assert!(live.claim(&id).is_some());
    }

    #[tokio::test]
    async fn tcp_handshake_delivers_both_sides() {
        let topic = Topic::random();
        let (server, mut server_rx) = ctx(JoinMode::ClientAndServer, topic, "aaaa");
        let (client, mut client_rx) = ctx(JoinMode::Client, topic, "bbbb");

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            server.accept(stream, peer).await;
        });
        client.dial(addr, Some(PeerId::new("aaaa"))).await;
        accept.await.unwrap();

        assert_eq!(server_rx.recv().await.unwrap().remote_id, PeerId::new("bbbb"));
        assert_eq!(client_rx.recv().await.unwrap().remote_id, PeerId::new("aaaa"));
    }

    #[tokio::test]
    async fn tcp_handshake_rejects_other_topic() {
        let (server, mut server_rx) = ctx(JoinMode::ClientAndServer, Topic::random(), "aaaa");
        let (client, mut client_rx) = ctx(JoinMode::Client, Topic::random(), "bbbb");

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            server.accept(stream, peer).await;
        });
        client.dial(addr, None).await;
        accept.await.unwrap();

        assert!(server_rx.try_recv().is_err());
        assert!(client_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn frames_sent_with_hello_reach_the_connection() {
        let topic = Topic::random();
        let (client, mut client_rx) = ctx(JoinMode::Client, topic, "bbbb");
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let hello = Hello { peer: "aaaa".to_string(), key: format!("{:016x}", topic.discovery_key()) };
        let offer: &[u8] = br#"{"type":"offer","sdp":"v=0"}"#;
        let user_info = frame_packet(br#"{"type":"user-info","username":"alpha","timestamp":1}"#).unwrap();
        let server = tokio::spawn({
            let user_info = user_info.clone();
            async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            // hello, a whole frame and half a frame in one write
            let mut burst = frame_packet(&serde_json::to_vec(&hello).unwrap()).unwrap().to_vec();
            burst.extend_from_slice(&frame_packet(offer).unwrap());
            burst.extend_from_slice(&user_info[..6]);
            stream.write_all(&burst).await.unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
            stream.write_all(&user_info[6..]).await.unwrap();
            stream
            }
        });

        client.dial(addr, Some(PeerId::new("aaaa"))).await;
        let mut conn = client_rx.recv().await.unwrap();
        assert_eq!(conn.remote_id, PeerId::new("aaaa"));
        let _server_stream = server.await.unwrap();

        let mut decoder = FrameDecoder::new();
        let first = tokio::time::timeout(Duration::from_secs(2), read_frame(&mut conn.stream, &mut decoder))
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(&first[..], offer);
        let second = tokio::time::timeout(Duration::from_secs(2), read_frame(&mut conn.stream, &mut decoder))
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(&second[..], &user_info[4..]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn beacon_port_is_shared_on_one_host() {
        let first = bind_beacon_listener("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = first.local_addr().unwrap();
        let second = bind_beacon_listener(addr).unwrap();
        assert_eq!(second.local_addr().unwrap(), addr);
    }
}
