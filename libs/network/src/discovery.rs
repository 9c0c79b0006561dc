//! Peer Discovery
//!
//! Containers meet on a UDP multicast rendezvous and answer each other's
//! "who hosts actor X?" searches. Four datagram kinds exist: a container
//! announces itself and its hosted actors, searches for an actor by id,
//! answers a search it can satisfy, and says goodbye when stopping.
//!
//! Discovery does not touch the registry itself: received announcements and
//! answers are forwarded as `DiscoveryEvent`s, and the container classifies
//! them LOCAL or REMOTE by comparing peer and local IPs. Searches this
//! container can satisfy are answered from a lookup closure over its hosted
//! actors.
//!
//! The rendezvous socket binds with `SO_REUSEADDR`/`SO_REUSEPORT` so
//! several containers on one host share the port, and answers go back over
//! multicast so every one of them hears the result.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use colony_types::NetInfo;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Result, TransportError};
use crate::MAX_DATAGRAM_BYTES;

/// Resolve a searched aid against this container's hosted actors,
/// returning the full id to answer with.
pub type HostedLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Datagrams exchanged on the rendezvous.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DiscoveryMessage {
    /// Presence of a container and the bare ids of its hosted actors.
    Announce {
        container: NetInfo,
        actors: Vec<String>,
    },
    /// Who hosts `aid`?
    Search { aid: String },
    /// `container` hosts `aid` (fully qualified).
    Answer { aid: String, container: NetInfo },
    /// A container left the rendezvous.
    Leave { container_id: String },
    /// Message kind introduced by a newer peer; skipped on receive.
    #[serde(other)]
    Unknown,
}

/// What discovery tells the container.
#[derive(Debug)]
pub enum DiscoveryEvent {
    /// A peer announced itself with its hosted actors (bare ids).
    PeerActors {
        container: NetInfo,
        actors: Vec<String>,
    },
    /// A peer answered a search with a fully-qualified aid.
    Answer { aid: String, container: NetInfo },
    /// A peer left; its registry entries should go.
    PeerLeft { container_id: String },
}

struct DiscoveryInner {
    events: mpsc::UnboundedSender<DiscoveryEvent>,
    hosted: HostedLookup,
    socket: parking_lot::RwLock<Option<Arc<UdpSocket>>>,
    addrs: parking_lot::RwLock<Vec<SocketAddr>>,
    local: parking_lot::RwLock<Option<NetInfo>>,
    recv_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    running: AtomicBool,
}

/// Multicast discovery endpoint of one container.
pub struct Discovery {
    inner: Arc<DiscoveryInner>,
}

impl Discovery {
    /// Create a discovery endpoint pushing into `events`; `hosted` answers
    /// searches for actors this container hosts.
    pub fn new(events: mpsc::UnboundedSender<DiscoveryEvent>, hosted: HostedLookup) -> Self {
        Self {
            inner: Arc::new(DiscoveryInner {
                events,
                hosted,
                socket: parking_lot::RwLock::new(None),
                addrs: parking_lot::RwLock::new(Vec::new()),
                local: parking_lot::RwLock::new(None),
                recv_task: parking_lot::Mutex::new(None),
                running: AtomicBool::new(false),
            }),
        }
    }

    /// Join the rendezvous and announce presence.
    pub async fn start(
        &self,
        group: Ipv4Addr,
        port: u16,
        local: NetInfo,
        hosted_actors: Vec<String>,
    ) -> Result<()> {
        if !group.is_multicast() {
            return Err(TransportError::configuration(
                format!("{group} is not a multicast group"),
                Some("discovery_addr"),
            ));
        }

        let socket = bind_rendezvous(group, port)?;
        let socket = Arc::new(socket);

        *self.inner.socket.write() = Some(Arc::clone(&socket));
        *self.inner.addrs.write() = vec![SocketAddr::new(IpAddr::V4(group), port)];
        *self.inner.local.write() = Some(local.clone());
        self.inner.running.store(true, Ordering::SeqCst);

        let inner = Arc::clone(&self.inner);
        let recv_loop = tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM_BYTES];
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((len, src)) => handle_datagram(&inner, &buf[..len], src).await,
                    Err(e) => {
                        warn!(error = %e, "discovery receive failed, leaving rendezvous");
                        break;
                    }
                }
            }
        });
        *self.inner.recv_task.lock() = Some(recv_loop);

        self.broadcast(&DiscoveryMessage::Announce {
            container: local.clone(),
            actors: hosted_actors,
        })
        .await;

        info!(group = %group, port, container = %local.id, "joined discovery rendezvous");
        Ok(())
    }

    /// Re-announce presence, typically after an actor was added.
    pub async fn announce(&self, hosted_actors: Vec<String>) {
        let Some(local) = self.inner.local.read().clone() else {
            return;
        };
        self.broadcast(&DiscoveryMessage::Announce {
            container: local,
            actors: hosted_actors,
        })
        .await;
    }

    /// Broadcast a search for `aid`. Idempotent; answers come back as
    /// `DiscoveryEvent::Answer`. No-op when discovery is not running.
    pub async fn notify_searched(&self, aid: &str) {
        if !self.inner.running.load(Ordering::SeqCst) {
            return;
        }
        debug!(aid, "broadcasting actor search");
        self.broadcast(&DiscoveryMessage::Search {
            aid: aid.to_string(),
        })
        .await;
    }

    /// Announce leave and close the rendezvous socket.
    pub async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(local) = self.inner.local.read().clone() {
            self.broadcast(&DiscoveryMessage::Leave {
                container_id: local.id,
            })
            .await;
        }
        if let Some(task) = self.inner.recv_task.lock().take() {
            task.abort();
        }
        *self.inner.socket.write() = None;
        info!("left discovery rendezvous");
    }

    /// Replace the rendezvous address list used for broadcasts.
    pub fn set_discovery_addrs(&self, addrs: Vec<SocketAddr>) {
        *self.inner.addrs.write() = addrs;
    }

    async fn broadcast(&self, message: &DiscoveryMessage) {
        let Some(socket) = self.inner.socket.read().clone() else {
            return;
        };
        let payload = match serde_json::to_vec(message) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "failed to encode discovery message");
                return;
            }
        };
        if payload.len() > MAX_DATAGRAM_BYTES {
            warn!(size = payload.len(), "discovery message exceeds datagram cap, skipped");
            return;
        }
        let addrs = self.inner.addrs.read().clone();
        for addr in addrs {
            if let Err(e) = socket.send_to(&payload, addr).await {
                warn!(addr = %addr, error = %e, "discovery send failed");
            }
        }
    }
}

/// Bind the shared rendezvous socket and join the group.
fn bind_rendezvous(group: Ipv4Addr, port: u16) -> Result<UdpSocket> {
    let socket = socket2::Socket::new(
        socket2::Domain::IPV4,
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.bind(&SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port).into())?;
    socket.set_nonblocking(true)?;

    let socket = UdpSocket::from_std(socket.into())
        .map_err(|e| TransportError::network_with_source("failed to adopt rendezvous socket", e))?;
    socket
        .join_multicast_v4(group, Ipv4Addr::UNSPECIFIED)
        .map_err(|e| {
            TransportError::network_with_source(format!("failed to join group {group}"), e)
        })?;
    // Loopback so containers on this host hear each other (and us).
    socket.set_multicast_loop_v4(true)?;
    socket.set_multicast_ttl_v4(1)?;
    Ok(socket)
}

async fn handle_datagram(inner: &Arc<DiscoveryInner>, payload: &[u8], src: SocketAddr) {
    let message: DiscoveryMessage = match serde_json::from_slice(payload) {
        Ok(m) => m,
        Err(e) => {
            debug!(src = %src, error = %e, "unparseable discovery datagram skipped");
            return;
        }
    };

    let local_id = inner.local.read().as_ref().map(|l| l.id.clone());

    match message {
        DiscoveryMessage::Announce { container, actors } => {
            if Some(&container.id) == local_id.as_ref() {
                return;
            }
            debug!(peer = %container.id, actors = actors.len(), "peer announced");
            let _ = inner
                .events
                .send(DiscoveryEvent::PeerActors { container, actors });
        }
        DiscoveryMessage::Search { aid } => {
            let Some(full) = (inner.hosted.as_ref())(&aid) else {
                return;
            };
            let Some(local) = inner.local.read().clone() else {
                return;
            };
            debug!(aid = %aid, answer = %full, "answering actor search");
            let answer = DiscoveryMessage::Answer {
                aid: full,
                container: local,
            };
            let payload = match serde_json::to_vec(&answer) {
                Ok(p) => p,
                Err(_) => return,
            };
            let socket = inner.socket.read().clone();
            let addrs = inner.addrs.read().clone();
            if let Some(socket) = socket {
                for addr in addrs {
                    if let Err(e) = socket.send_to(&payload, addr).await {
                        warn!(addr = %addr, error = %e, "search answer send failed");
                    }
                }
            }
        }
        DiscoveryMessage::Answer { aid, container } => {
            if Some(&container.id) == local_id.as_ref() {
                return;
            }
            debug!(aid = %aid, peer = %container.id, "received search answer");
            let _ = inner.events.send(DiscoveryEvent::Answer { aid, container });
        }
        DiscoveryMessage::Leave { container_id } => {
            if Some(&container_id) == local_id.as_ref() {
                return;
            }
            debug!(peer = %container_id, "peer left rendezvous");
            let _ = inner.events.send(DiscoveryEvent::PeerLeft { container_id });
        }
        DiscoveryMessage::Unknown => {
            debug!(src = %src, "discovery message of unknown kind skipped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wire_messages_roundtrip() {
        let msg = DiscoveryMessage::Announce {
            container: NetInfo {
                id: "c-1".into(),
                ip: "10.0.0.1".parse().unwrap(),
                pid: 7,
                port: 9000,
            },
            actors: vec!["ping".into(), "pong".into()],
        };
        let bytes = serde_json::to_vec(&msg).unwrap();
        match serde_json::from_slice(&bytes).unwrap() {
            DiscoveryMessage::Announce { container, actors } => {
                assert_eq!(container.id, "c-1");
                assert_eq!(actors, vec!["ping", "pong"]);
            }
            other => panic!("expected Announce, got {other:?}"),
        }
    }

    #[test]
    fn unknown_kinds_are_tolerated() {
        let raw = json!({"kind": "handover", "payload": {"x": 1}});
        let msg: DiscoveryMessage = serde_json::from_value(raw).unwrap();
        assert!(matches!(msg, DiscoveryMessage::Unknown));
    }

    #[tokio::test]
    async fn non_multicast_group_is_rejected() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let discovery = Discovery::new(tx, Arc::new(|_| None));
        let err = discovery
            .start(
                Ipv4Addr::new(10, 0, 0, 1),
                5555,
                NetInfo {
                    id: "c-1".into(),
                    ip: "127.0.0.1".parse().unwrap(),
                    pid: 1,
                    port: 0,
                },
                vec![],
            )
            .await
            .unwrap_err();
        assert_eq!(err.category(), "configuration");
    }
}
