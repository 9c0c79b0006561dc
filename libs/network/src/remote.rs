//! Remote Peer Transport
//!
//! Framed TCP between containers. One listening endpoint per container;
//! outbound connections are opened on demand and kept in a peer table keyed
//! by container id, so later requests to the same peer reuse the
//! connection. Inbound connections join the table once the peer's `Hello`
//! arrives.
//!
//! Delivery failures never surface as errors on the send path: any connect
//! failure, unknown peer, or write error becomes a `Dropped` event so the
//! router can re-resolve and retry while the request deadline allows.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use colony_types::{NetInfo, Request};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Result, TransportError};
use crate::event::{EventSender, Responder, TransportEvent};
use crate::frame::{read_frame, write_frame, Frame};
use crate::CONNECT_TIMEOUT_MS;

/// Writer handle for one peer connection.
#[derive(Debug, Clone)]
struct PeerHandle {
    writer: mpsc::UnboundedSender<Frame>,
}

struct RemoteInner {
    events: EventSender,
    local: parking_lot::RwLock<Option<NetInfo>>,
    peers: parking_lot::RwLock<HashMap<String, PeerHandle>>,
    listener_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    conn_tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

/// Peer-to-peer transport between containers.
pub struct RemoteTransport {
    inner: Arc<RemoteInner>,
}

impl RemoteTransport {
    /// Create a transport that pushes its events into `events`.
    pub fn new(events: EventSender) -> Self {
        Self {
            inner: Arc::new(RemoteInner {
                events,
                local: parking_lot::RwLock::new(None),
                peers: parking_lot::RwLock::new(HashMap::new()),
                listener_task: parking_lot::Mutex::new(None),
                conn_tasks: parking_lot::Mutex::new(Vec::new()),
                running: AtomicBool::new(false),
            }),
        }
    }

    /// Bind the listening endpoint and start accepting peers.
    ///
    /// `local.port` may be 0 to let the OS choose; the returned `NetInfo`
    /// carries the bound port.
    pub async fn start(&self, mut local: NetInfo) -> Result<NetInfo> {
        let bind_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), local.port);
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| TransportError::network_with_source("failed to bind listener", e))?;
        let bound = listener
            .local_addr()
            .map_err(|e| TransportError::network_with_source("failed to read bound address", e))?;
        local.port = bound.port();

        *self.inner.local.write() = Some(local.clone());
        self.inner.running.store(true, Ordering::SeqCst);

        let inner = Arc::clone(&self.inner);
        let accept_loop = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer_addr)) => {
                        debug!(peer = %peer_addr, "accepted peer connection");
                        spawn_connection(Arc::clone(&inner), stream, None);
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed, listener closing");
                        break;
                    }
                }
            }
        });
        *self.inner.listener_task.lock() = Some(accept_loop);

        info!(port = local.port, container = %local.id, "remote transport listening");
        Ok(local)
    }

    /// Close the listener and tear down peer connections.
    ///
    /// Queued frames drain best-effort: dropping the peer handles closes
    /// each writer channel, and writers exit after flushing what they
    /// already hold.
    pub async fn stop(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        if let Some(task) = self.inner.listener_task.lock().take() {
            task.abort();
        }
        self.inner.peers.write().clear();

        tokio::time::sleep(Duration::from_millis(50)).await;
        for task in self.inner.conn_tasks.lock().drain(..) {
            task.abort();
        }
        info!("remote transport stopped");
    }

    /// Deliver a request to a peer container.
    ///
    /// Failures emit `TransportEvent::Dropped` instead of returning an
    /// error; the router owns the retry policy.
    pub async fn send(&self, peer: &NetInfo, request: Request) {
        if !self.inner.running.load(Ordering::SeqCst) {
            warn!(request_id = %request.id, "remote transport not started, dropping");
            self.emit_dropped(request);
            return;
        }

        let handle = self.inner.peers.read().get(&peer.id).cloned();
        let handle = match handle {
            Some(h) => h,
            None => match self.connect(peer).await {
                Ok(h) => h,
                Err(e) => {
                    warn!(
                        peer = %peer.id,
                        error = %e,
                        request_id = %request.id,
                        "peer connect failed, dropping request"
                    );
                    self.emit_dropped(request);
                    return;
                }
            },
        };

        let from_container = match self.inner.local.read().as_ref() {
            Some(local) => local.id.clone(),
            None => {
                self.emit_dropped(request);
                return;
            }
        };

        let frame = Frame::Req {
            from_container,
            request: request.clone(),
        };
        if handle.writer.send(frame).is_err() {
            self.inner.peers.write().remove(&peer.id);
            debug!(peer = %peer.id, request_id = %request.id, "peer writer gone, dropping");
            self.emit_dropped(request);
        }
    }

    /// Open a connection to a peer and register it.
    async fn connect(&self, peer: &NetInfo) -> Result<PeerHandle> {
        let addr = SocketAddr::new(peer.ip, peer.port);
        let stream = tokio::time::timeout(
            Duration::from_millis(CONNECT_TIMEOUT_MS),
            TcpStream::connect(addr),
        )
        .await
        .map_err(|_| TransportError::timeout("peer connect", CONNECT_TIMEOUT_MS))?
        .map_err(|e| TransportError::network_with_source("failed to connect to peer", e))?;

        if let Err(e) = stream.set_nodelay(true) {
            warn!(error = %e, "failed to set TCP_NODELAY");
        }

        let handle = spawn_connection(Arc::clone(&self.inner), stream, Some(peer.id.clone()));
        debug!(peer = %peer.id, addr = %addr, "connected to peer");
        Ok(handle)
    }

    fn emit_dropped(&self, request: Request) {
        if self.inner.events.send(TransportEvent::Dropped(request)).is_err() {
            warn!("container loop gone, drop event discarded");
        }
    }
}

/// Spawn reader and writer tasks for one connection. Returns the writer
/// handle; when `peer_id` is known (outbound) the peer is registered and
/// greeted immediately, otherwise registration waits for the peer's Hello.
fn spawn_connection(
    inner: Arc<RemoteInner>,
    stream: TcpStream,
    peer_id: Option<String>,
) -> PeerHandle {
    let (read_half, write_half) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel::<Frame>();
    let handle = PeerHandle { writer: tx.clone() };

    if let Some(id) = &peer_id {
        inner.peers.write().insert(id.clone(), handle.clone());
        if let Some(local) = inner.local.read().clone() {
            let _ = tx.send(Frame::Hello { container: local });
        }
    }

    let writer_task = tokio::spawn(run_writer(Arc::clone(&inner), write_half, rx));
    let reader_task = tokio::spawn(run_reader(Arc::clone(&inner), read_half, tx, peer_id));

    let mut tasks = inner.conn_tasks.lock();
    tasks.retain(|t| !t.is_finished());
    tasks.push(writer_task);
    tasks.push(reader_task);

    handle
}

/// Drain the writer channel onto the socket. A failed `Req` write becomes
/// a drop event so the router can retry elsewhere.
async fn run_writer(
    inner: Arc<RemoteInner>,
    mut write_half: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Frame>,
) {
    while let Some(frame) = rx.recv().await {
        let pending_request = match &frame {
            Frame::Req { request, .. } => Some(request.clone()),
            _ => None,
        };
        if let Err(e) = write_frame(&mut write_half, &frame).await {
            warn!(error = %e, "peer write failed, closing connection");
            if let Some(request) = pending_request {
                let _ = inner.events.send(TransportEvent::Dropped(request));
            }
            break;
        }
    }
}

/// Parse inbound frames and forward them to the container loop.
async fn run_reader(
    inner: Arc<RemoteInner>,
    mut read_half: tokio::net::tcp::OwnedReadHalf,
    writer: mpsc::UnboundedSender<Frame>,
    mut peer_id: Option<String>,
) {
    loop {
        match read_frame(&mut read_half).await {
            Ok(Some(Frame::Hello { container })) => {
                debug!(peer = %container.id, "peer identified");
                peer_id = Some(container.id.clone());
                inner.peers.write().insert(
                    container.id,
                    PeerHandle {
                        writer: writer.clone(),
                    },
                );
            }
            Ok(Some(Frame::Req { request, .. })) => {
                let event = TransportEvent::Request {
                    request,
                    responder: Responder::for_connection(writer.clone()),
                };
                if inner.events.send(event).is_err() {
                    break;
                }
            }
            Ok(Some(Frame::Res { response })) => {
                if inner.events.send(TransportEvent::Response(response)).is_err() {
                    break;
                }
            }
            Ok(Some(Frame::Unknown)) => {
                debug!("skipping frame of unknown kind");
            }
            Ok(None) => {
                debug!(peer = ?peer_id, "peer closed connection");
                break;
            }
            Err(e) => {
                warn!(peer = ?peer_id, error = %e, "peer read failed, closing connection");
                break;
            }
        }
    }

    if let Some(id) = peer_id {
        let mut peers = inner.peers.write();
        if peers
            .get(&id)
            .is_some_and(|h| h.writer.same_channel(&writer))
        {
            peers.remove(&id);
        }
    }
}
