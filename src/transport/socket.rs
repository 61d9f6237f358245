//! Direct socket transport with local multicast discovery.
//!
//! Connections are plain TCP with one payload stream. When multicast is on,
//! every node periodically announces its identity and listening port to a
//! link-local group; peers learn the routable address from the packet source.

use crate::identity::{Address, PeerId, TransportKind};
use crate::transport::{
    emit, ensure_kind, Connection, ConnectionState, DiscoveredPeer, Stream, Transport,
    TransportEvent, TransportRuntime, PAYLOAD_STREAM,
};
use crate::utils::{NetworkError, Result, SocketConfig};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;

const ANNOUNCEMENT_VERSION: u8 = 1;
const MAX_DATAGRAM: usize = 1024;
/// Announcements missed before a peer is dropped from discovery
const MISSED_ANNOUNCEMENTS: u32 = 3;

#[derive(Debug, Serialize, Deserialize)]
struct Announcement {
    version: u8,
    peer: PeerId,
    port: u16,
}

/// Turn a received datagram into a discovery, ignoring our own beacons
fn decode_announcement(bytes: &[u8], from: SocketAddr, local: &PeerId) -> Option<DiscoveredPeer> {
    let announcement: Announcement = bincode::deserialize(bytes).ok()?;
    if announcement.version != ANNOUNCEMENT_VERSION || &announcement.peer == local {
        return None;
    }
    if announcement.port == 0 {
        return None;
    }
    let address = Address::Socket {
        host: from.ip().to_string(),
        port: announcement.port,
    };
    Some(DiscoveredPeer::now(announcement.peer, address, None))
}

fn multicast_socket(config: &SocketConfig) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.multicast_port)).into())?;
    socket.join_multicast_v4(&config.multicast_group, &Ipv4Addr::UNSPECIFIED)?;
    socket.set_multicast_ttl_v4(1)?;
    socket.set_multicast_loop_v4(true)?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into())
}

fn open_connection(stream: TcpStream, remote: SocketAddr, max_frame: usize) -> Result<Connection> {
    if let Err(e) = stream.set_nodelay(true) {
        log::debug!("set_nodelay failed for {remote}: {e}");
    }
    let connection = Connection::new(
        TransportKind::Socket,
        Address::Socket {
            host: remote.ip().to_string(),
            port: remote.port(),
        },
    );
    connection.add_stream(Stream::new(PAYLOAD_STREAM, Box::new(stream), max_frame));
    connection.transition(ConnectionState::Open)?;
    Ok(connection)
}

type SeenPeers = Arc<Mutex<HashMap<PeerId, DiscoveredPeer>>>;

/// TCP transport
pub struct SocketTransport {
    config: SocketConfig,
    local: PeerId,
    max_frame: usize,
    bound: Mutex<Option<SocketAddr>>,
    seen: SeenPeers,
    runtime: TransportRuntime,
}

impl SocketTransport {
    /// Create a socket transport
    ///
    /// # Arguments
    ///
    /// * `config` - Listener and multicast settings
    /// * `local` - Identity announced over multicast
    /// * `max_frame` - Largest frame accepted
    pub fn new(config: SocketConfig, local: PeerId, max_frame: usize) -> Self {
        Self {
            config,
            local,
            max_frame,
            bound: Mutex::new(None),
            seen: Arc::new(Mutex::new(HashMap::new())),
            runtime: TransportRuntime::new(TransportKind::Socket),
        }
    }

    /// Address the listener actually bound, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.bound.lock()
    }

    fn peer_timeout(&self) -> chrono::Duration {
        let millis = self
            .config
            .announce_interval_ms
            .saturating_mul(u64::from(MISSED_ANNOUNCEMENTS));
        chrono::Duration::milliseconds(i64::try_from(millis).unwrap_or(i64::MAX))
    }

    fn start_multicast(&self, port: u16, events: mpsc::Sender<TransportEvent>) -> Result<()> {
        let socket = Arc::new(multicast_socket(&self.config)?);
        let group = SocketAddr::from((self.config.multicast_group, self.config.multicast_port));
        let beacon = bincode::serialize(&Announcement {
            version: ANNOUNCEMENT_VERSION,
            peer: self.local.clone(),
            port,
        })?;

        let interval = Duration::from_millis(self.config.announce_interval_ms);
        let sender = socket.clone();
        self.runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(e) = sender.send_to(&beacon, group).await {
                    log::debug!("Multicast announce failed: {e}");
                }
            }
        });

        let local = self.local.clone();
        let seen = self.seen.clone();
        self.runtime.spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((len, from)) => {
                        if let Some(peer) = decode_announcement(&buf[..len], from, &local) {
                            let fresh = seen.lock().insert(peer.peer.clone(), peer.clone()).is_none();
                            if fresh {
                                log::info!("Discovered {} at {}", peer.peer, from.ip());
                            }
                            emit(&events, TransportEvent::PeerDiscovered(peer)).await;
                        }
                    }
                    Err(e) => {
                        log::warn!("Multicast receive failed: {e}");
                        tokio::time::sleep(interval).await;
                    }
                }
            }
        });
        Ok(())
    }
}

#[async_trait]
impl Transport for SocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Socket
    }

    async fn init(&self, events: mpsc::Sender<TransportEvent>) -> Result<()> {
        self.runtime.attach(events);
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        if !self.runtime.begin()? {
            return Ok(());
        }
        let events = self.runtime.sender()?;
        let listener = match TcpListener::bind(self.config.listen_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                self.runtime.shutdown();
                return Err(NetworkError::Transport {
                    reason: format!("bind {}: {e}", self.config.listen_addr),
                }
                .into());
            }
        };
        let bound = listener.local_addr()?;
        *self.bound.lock() = Some(bound);
        log::info!("Socket transport listening on {bound}");

        let max_frame = self.max_frame;
        let accept_events = events.clone();
        self.runtime.spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => match open_connection(stream, remote, max_frame) {
                        Ok(connection) => {
                            log::debug!("Accepted connection from {remote}");
                            emit(&accept_events, TransportEvent::IncomingConnection(connection))
                                .await;
                        }
                        Err(e) => log::warn!("Inbound connection from {remote} failed: {e}"),
                    },
                    Err(e) => {
                        log::warn!("Accept failed: {e}");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        });

        if self.config.enable_multicast {
            if let Err(e) = self.start_multicast(bound.port(), events) {
                log::warn!("Multicast discovery unavailable: {e}");
            }
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.runtime.shutdown();
        *self.bound.lock() = None;
        Ok(())
    }

    async fn dial(&self, address: &Address) -> Result<Connection> {
        ensure_kind(TransportKind::Socket, address)?;
        self.runtime.require_started()?;
        let target = address
            .socket_target()
            .ok_or_else(|| NetworkError::UnsupportedAddress {
                transport: TransportKind::Socket.to_string(),
                address: address.to_string(),
            })?;

        let stream = TcpStream::connect(&target)
            .await
            .map_err(|e| NetworkError::ConnectionFailed {
                peer: address.to_string(),
                reason: e.to_string(),
            })?;
        let remote = stream.peer_addr()?;
        let connection = open_connection(stream, remote, self.max_frame)?;
        log::debug!("Connected to {address}");
        Ok(connection)
    }

    /// Unspecified binds are reported as loopback; remote peers learn the
    /// routable address from announcements instead.
    fn listen_addresses(&self) -> Vec<Address> {
        let Some(bound) = self.local_addr() else {
            return Vec::new();
        };
        let ip = match bound.ip() {
            IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(std::net::Ipv6Addr::LOCALHOST),
            ip => ip,
        };
        vec![Address::Socket {
            host: ip.to_string(),
            port: bound.port(),
        }]
    }

    async fn discover(&self) -> Result<Vec<DiscoveredPeer>> {
        self.runtime.require_started()?;
        let cutoff = Utc::now() - self.peer_timeout();
        let mut seen = self.seen.lock();
        seen.retain(|peer, entry| {
            let alive = entry.last_seen >= cutoff;
            if !alive {
                log::info!("Peer {peer} stopped announcing");
            }
            alive
        });
        Ok(seen.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::ChainType;

    fn loopback_config() -> SocketConfig {
        SocketConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            enable_multicast: false,
            ..SocketConfig::default()
        }
    }

    async fn started(name: &str) -> (SocketTransport, mpsc::Receiver<TransportEvent>) {
        let peer = PeerId::new(format!("0x{name}"), ChainType::Ethereum, name);
        let transport = SocketTransport::new(loopback_config(), peer, 4096);
        let (tx, rx) = mpsc::channel(16);
        transport.init(tx).await.unwrap();
        transport.start().await.unwrap();
        (transport, rx)
    }

    #[tokio::test]
    async fn test_dial_and_accept() {
        let (alice, _alice_events) = started("a11ce").await;
        let (bob, mut bob_events) = started("b0b").await;

        let bob_address = bob.listen_addresses().remove(0);
        assert!(bob_address.to_string().starts_with("tcp/127.0.0.1/"));

        let connection = alice.dial(&bob_address).await.unwrap();
        assert!(connection.is_open());
        let incoming = match bob_events.recv().await.unwrap() {
            TransportEvent::IncomingConnection(c) => c,
            other => panic!("unexpected event {other:?}"),
        };

        let mut a = connection.take_stream(PAYLOAD_STREAM).unwrap();
        let mut b = incoming.take_stream(PAYLOAD_STREAM).unwrap();
        a.send(b"hello over tcp").await.unwrap();
        assert_eq!(b.recv().await.unwrap().unwrap(), b"hello over tcp");
        a.close_write().await.unwrap();
        assert!(b.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dial_refused_is_recoverable() {
        let (alice, _events) = started("a11ce").await;
        let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = unused.local_addr().unwrap().port();
        drop(unused);

        let err = alice
            .dial(&Address::Socket {
                host: "127.0.0.1".to_string(),
                port,
            })
            .await
            .unwrap_err();
        assert!(err.is_recoverable());
    }

    #[tokio::test]
    async fn test_dial_before_start() {
        let peer = PeerId::new("0xa11ce", ChainType::Ethereum, "a");
        let transport = SocketTransport::new(loopback_config(), peer, 4096);
        let err = transport
            .dial(&Address::Socket {
                host: "127.0.0.1".to_string(),
                port: 1,
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            crate::utils::MessengerError::Network(NetworkError::NotStarted { .. })
        ));
    }

    #[test]
    fn test_announcement_decoding() {
        let local = PeerId::new("0xa11ce", ChainType::Ethereum, "a");
        let bob = PeerId::new("0xb0b", ChainType::Ethereum, "b");
        let from: SocketAddr = "192.168.1.20:45454".parse().unwrap();

        let beacon = bincode::serialize(&Announcement {
            version: ANNOUNCEMENT_VERSION,
            peer: bob.clone(),
            port: 4001,
        })
        .unwrap();
        let found = decode_announcement(&beacon, from, &local).unwrap();
        assert_eq!(found.peer, bob);
        assert_eq!(found.addresses[0].to_string(), "tcp/192.168.1.20/4001");

        let own = bincode::serialize(&Announcement {
            version: ANNOUNCEMENT_VERSION,
            peer: local.clone(),
            port: 4001,
        })
        .unwrap();
        assert!(decode_announcement(&own, from, &local).is_none());
        assert!(decode_announcement(b"garbage", from, &local).is_none());
    }

    #[tokio::test]
    async fn test_discover_prunes_silent_peers() {
        let (alice, _events) = started("a11ce").await;
        let bob = PeerId::new("0xb0b", ChainType::Ethereum, "b");
        let mut stale = DiscoveredPeer::now(
            bob.clone(),
            Address::Socket {
                host: "10.0.0.2".to_string(),
                port: 4001,
            },
            None,
        );
        stale.last_seen = Utc::now() - chrono::Duration::hours(1);
        alice.seen.lock().insert(bob.clone(), stale);
        let carol = PeerId::new("0xc4r01", ChainType::Ethereum, "c");
        alice.seen.lock().insert(
            carol.clone(),
            DiscoveredPeer::now(
                carol.clone(),
                Address::Socket {
                    host: "10.0.0.3".to_string(),
                    port: 4001,
                },
                None,
            ),
        );

        let peers = alice.discover().await.unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].peer, carol);
    }
}
