//! LAN transport: TCP for connections, UDP multicast probe/announce for discovery.
//!
//! `scan` multicasts a probe and collects unicast announcements for a short window;
//! `advertise` starts (once) a responder that answers probes with the current service
//! record. Peer addresses are `ip:port` of the peer's TCP listener.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use p2share_core::{
    BoxConnection, DiscoveredDevice, Inbound, PeerAddress, ServiceRecord, Transport,
    TransportError, PROTOCOL_VERSION,
};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 60, 60);
/// How long a scan waits for announcements.
const PROBE_WINDOW: Duration = Duration::from_secs(2);
const MAX_DATAGRAM: usize = 2048;

/// Discovery datagram, JSON encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
enum Datagram {
    Probe {
        instance: Uuid,
    },
    Announce {
        instance: Uuid,
        service_id: Uuid,
        #[serde(default)]
        version: u8,
        name: String,
        port: u16,
    },
}

pub struct LanTransport {
    /// Distinguishes this process's own announcements from other hosts'.
    instance: Uuid,
    discovery_port: u16,
    transport_port: u16,
    record: Arc<Mutex<Option<ServiceRecord>>>,
    responder: Mutex<Option<JoinHandle<()>>>,
}

impl LanTransport {
    pub fn new(discovery_port: u16, transport_port: u16) -> Self {
        Self {
            instance: Uuid::new_v4(),
            discovery_port,
            transport_port,
            record: Arc::new(Mutex::new(None)),
            responder: Mutex::new(None),
        }
    }

    fn group(&self) -> SocketAddr {
        SocketAddr::from((MULTICAST_GROUP, self.discovery_port))
    }
}

impl Drop for LanTransport {
    fn drop(&mut self) {
        if let Some(task) = self
            .responder
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }
}

async fn make_multicast_socket(discovery_port: u16) -> std::io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, discovery_port))?;
    std_sock.join_multicast_v4(&MULTICAST_GROUP, &Ipv4Addr::UNSPECIFIED)?;
    std_sock.set_multicast_ttl_v4(1)?;
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}

fn encode(datagram: &Datagram) -> std::io::Result<Vec<u8>> {
    serde_json::to_vec(datagram).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

fn decode(bytes: &[u8]) -> Option<Datagram> {
    serde_json::from_slice(bytes).ok()
}

/// Device described by an announcement from `from`, unless it is our own or speaks
/// another protocol version.
fn announced_device(datagram: Datagram, from: SocketAddr, own: Uuid) -> Option<DiscoveredDevice> {
    let Datagram::Announce {
        instance,
        service_id,
        version,
        name,
        port,
    } = datagram
    else {
        return None;
    };
    if instance == own {
        return None;
    }
    if version != PROTOCOL_VERSION {
        debug!(from = %from, version, "ignoring announcement for another protocol version");
        return None;
    }
    Some(DiscoveredDevice {
        address: PeerAddress::new(SocketAddr::new(from.ip(), port).to_string()),
        name,
        service_ids: vec![service_id],
    })
}

async fn respond_loop(
    socket: UdpSocket,
    instance: Uuid,
    port: u16,
    record: Arc<Mutex<Option<ServiceRecord>>>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (n, from) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                warn!(error = %e, "discovery socket failed");
                return;
            }
        };
        let Some(Datagram::Probe { instance: prober }) = decode(&buf[..n]) else {
            continue;
        };
        if prober == instance {
            continue;
        }
        let current = record.lock().unwrap_or_else(PoisonError::into_inner).clone();
        let Some(current) = current else {
            continue;
        };
        let announce = Datagram::Announce {
            instance,
            service_id: current.service_id,
            version: current.protocol_version,
            name: current.display_name,
            port,
        };
        match encode(&announce) {
            Ok(bytes) => {
                if let Err(e) = socket.send_to(&bytes, from).await {
                    debug!(to = %from, error = %e, "announce failed");
                }
            }
            Err(e) => warn!(error = %e, "cannot encode announcement"),
        }
    }
}

#[async_trait]
impl Transport for LanTransport {
    async fn scan(&self) -> Result<BoxStream<'static, DiscoveredDevice>, TransportError> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        socket.set_multicast_ttl_v4(1)?;
        let probe = encode(&Datagram::Probe {
            instance: self.instance,
        })?;
        socket.send_to(&probe, self.group()).await?;

        let own = self.instance;
        let deadline = Instant::now() + PROBE_WINDOW;
        let replies = stream::unfold(
            (socket, vec![0u8; MAX_DATAGRAM]),
            move |(socket, mut buf)| async move {
                loop {
                    let (n, from) =
                        match tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await {
                            Ok(Ok(received)) => received,
                            Ok(Err(e)) => {
                                debug!(error = %e, "scan socket failed");
                                return None;
                            }
                            Err(_) => return None,
                        };
                    if let Some(device) =
                        decode(&buf[..n]).and_then(|d| announced_device(d, from, own))
                    {
                        return Some((device, (socket, buf)));
                    }
                }
            },
        );
        Ok(replies.boxed())
    }

    async fn advertise(&self, service: &ServiceRecord) -> Result<(), TransportError> {
        *self.record.lock().unwrap_or_else(PoisonError::into_inner) = Some(service.clone());
        let running = self
            .responder
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|task| !task.is_finished());
        if running {
            return Ok(());
        }
        let socket = make_multicast_socket(self.discovery_port)
            .await
            .map_err(|e| TransportError::Unavailable(format!("discovery port {}: {e}", self.discovery_port)))?;
        let task = tokio::spawn(respond_loop(
            socket,
            self.instance,
            self.transport_port,
            self.record.clone(),
        ));
        *self.responder.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
        Ok(())
    }

    async fn listen(
        &self,
    ) -> Result<BoxStream<'static, Result<Inbound, TransportError>>, TransportError> {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, self.transport_port)).await?;
        debug!(port = self.transport_port, "tcp listener bound");
        let incoming = stream::unfold(listener, |listener| async move {
            let accepted = match listener.accept().await {
                Ok((stream, from)) => {
                    let _ = stream.set_nodelay(true);
                    Ok(Inbound {
                        peer: PeerAddress::new(from.to_string()),
                        connection: Box::new(stream),
                    })
                }
                Err(e) => Err(TransportError::Io(e)),
            };
            Some((accepted, listener))
        });
        Ok(incoming.boxed())
    }

    async fn connect(&self, address: &PeerAddress) -> Result<BoxConnection, TransportError> {
        let addr: SocketAddr = address
            .as_str()
            .parse()
            .map_err(|_| TransportError::Unreachable(address.clone()))?;
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| TransportError::Connect {
                address: address.clone(),
                source,
            })?;
        let _ = stream.set_nodelay(true);
        Ok(Box::new(stream))
    }
}
