//! Container Facade
//!
//! The public face of the runtime: lifecycle, actor add/remove, middleware
//! registration, tunable properties, and the send pipeline with
//! correlation, timeout and retry-on-drop.
//!
//! One logical loop owns all shared state. Transports and discovery run
//! their I/O on background tasks but everything they learn re-enters
//! through the event pumps before touching the registry or the
//! correlation tables.
//!
//! Request lifecycle, end to end:
//!
//! ```text
//! send/call ──▶ validate ──▶ mw(REQ_OUT) ──▶ search ──▶ transport by scope
//!                                                │            │ drop
//!                                                ▼            ▼
//!                                            discovery    retry until
//!                                                         deadline
//! peer: mw(REQ_IN) ──▶ handler ──▶ reply ──▶ mw(RES_OUT) ──▶ transport
//! origin: mw(RES_IN) ──▶ caller completes (response, TIMEOUT or NOTFOUND)
//! ```

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use colony_network::{
    resolve_local_ip, Discovery, DiscoveryEvent, RemoteTransport, Responder, TransportEvent,
    DEFAULT_DISCOVERY_PORT,
};
use colony_types::{
    now_ms, validate_request, ActorId, ErrorInfo, Headers, MessageKind, NetInfo, Request, Response,
    StartOptions, DEFAULT_SEND_TIMEOUT_MS, MAX_SEND_TIMEOUT_MS, RESEARCH_TIMEOUT_MS,
    RETRY_DELAY_MS,
};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::behavior::{ActorBehavior, Delivery, ReplyClosure};
use crate::correlation::Correlation;
use crate::inproc::InprocTransport;
use crate::metrics::{ContainerMetrics, ContainerStats};
use crate::middleware::{run_chain, Middleware, PipelineMessage, ReplySlot};
use crate::registry::{ActorEntry, ContainerEvent, Registry, Scope};

/// Tunable property keys understood by `set`.
pub const PROP_RETRY_DELAY: &str = "retryDelay";
pub const PROP_RESEARCH_TIMEOUT: &str = "researchTimeout";
pub const PROP_DEFAULT_SEND_TIMEOUT: &str = "defaultSendTimeout";
pub const PROP_MAX_SEND_TIMEOUT: &str = "maxSendTimeout";
pub const PROP_DISCOVERY_ADDRS: &str = "discoveryAddrs";

/// Per-send options: deadline override and extra headers.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Time-to-deadline in ms. Zero or absent falls back to the default
    /// send timeout for awaited requests and the max send timeout for
    /// fire-and-forget ones.
    pub timeout: Option<u64>,
    pub headers: Option<Headers>,
}

impl SendOptions {
    pub fn with_timeout(ms: u64) -> Self {
        Self {
            timeout: Some(ms),
            ..Default::default()
        }
    }

    pub fn with_headers(headers: Headers) -> Self {
        Self {
            headers: Some(headers),
            ..Default::default()
        }
    }
}

/// Lifecycle of the container facade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Idle,
    Locking,
    Started,
}

type ResultWaiter = oneshot::Sender<Result<Response, ErrorInfo>>;

/// A send captured before the container started.
struct QueuedSend {
    from: String,
    to: String,
    content: Value,
    options: SendOptions,
    waiter: Option<ResultWaiter>,
}

/// Context handed to actor handlers: the actor's identity plus a send
/// capability into the container. Holds a weak handle, so an actor never
/// keeps its container alive.
#[derive(Clone)]
pub struct ActorContext {
    pub id: ActorId,
    pub(crate) container: Weak<ContainerInner>,
}

impl ActorContext {
    /// Fire-and-forget send with this actor as the source.
    pub async fn send(
        &self,
        to: &str,
        content: Value,
        options: SendOptions,
    ) -> Result<(), ErrorInfo> {
        let inner = self
            .container
            .upgrade()
            .ok_or_else(|| ErrorInfo::techerr("container gone"))?;
        inner
            .submit(self.id.to_string(), to.to_string(), content, options, None)
            .await;
        Ok(())
    }

    /// Request/response with this actor as the source.
    pub async fn call(
        &self,
        to: &str,
        content: Value,
        options: SendOptions,
    ) -> Result<Response, ErrorInfo> {
        let inner = self
            .container
            .upgrade()
            .ok_or_else(|| ErrorInfo::techerr("container gone"))?;
        ContainerInner::call_through(&inner, self.id.to_string(), to, content, options).await
    }

    /// Network identity of the hosting container, once started.
    pub fn net_info(&self) -> Option<NetInfo> {
        self.container.upgrade().and_then(|c| c.net_info.read().clone())
    }
}

impl std::fmt::Debug for ActorContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActorContext")
            .field("id", &self.id.to_string())
            .finish()
    }
}

pub(crate) struct ContainerInner {
    id: String,
    self_ref: Weak<ContainerInner>,
    state: Mutex<Lifecycle>,
    has_stopped: AtomicBool,
    props: RwLock<HashMap<String, Value>>,
    registry: Arc<Registry>,
    correlation: Correlation,
    middleware: RwLock<Vec<Arc<dyn Middleware>>>,
    starting_queue: Mutex<Vec<QueuedSend>>,
    net_info: RwLock<Option<NetInfo>>,
    metrics: ContainerMetrics,
    inproc: InprocTransport,
    remote: RemoteTransport,
    discovery: Discovery,
}

/// A process-local actor container.
///
/// Cheap to clone; all clones share the same runtime. Must be created
/// inside a tokio runtime, since the event pumps spawn immediately.
#[derive(Clone)]
pub struct Container {
    inner: Arc<ContainerInner>,
}

impl Container {
    pub fn new() -> Self {
        let id = Uuid::new_v4().to_string();
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (discovery_tx, discovery_rx) = mpsc::unbounded_channel();

        let registry = Arc::new(Registry::new());
        let hosted = {
            let registry = Arc::clone(&registry);
            Arc::new(move |aid: &str| registry.hosted_answer(aid))
        };

        let inner = Arc::new_cyclic(|self_ref: &Weak<ContainerInner>| ContainerInner {
            id: id.clone(),
            self_ref: self_ref.clone(),
            state: Mutex::new(Lifecycle::Idle),
            has_stopped: AtomicBool::new(false),
            props: RwLock::new(HashMap::new()),
            registry,
            correlation: Correlation::new(),
            middleware: RwLock::new(Vec::new()),
            starting_queue: Mutex::new(Vec::new()),
            net_info: RwLock::new(None),
            metrics: ContainerMetrics::new(),
            inproc: InprocTransport::new(transport_tx.clone()),
            remote: RemoteTransport::new(transport_tx),
            discovery: Discovery::new(discovery_tx, hosted),
        });

        spawn_transport_pump(Arc::downgrade(&inner), transport_rx);
        spawn_discovery_pump(Arc::downgrade(&inner), discovery_rx);

        info!(container = %id, "container created");
        Self { inner }
    }

    /// Container id (also the `NetInfo` id once started).
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Network identity, available once started.
    pub fn net_info(&self) -> Option<NetInfo> {
        self.inner.net_info.read().clone()
    }

    /// Subscribe to `actor added` / `actor removed` events. Any number of
    /// subscribers is fine.
    pub fn subscribe(&self) -> broadcast::Receiver<ContainerEvent> {
        self.inner.registry.subscribe()
    }

    /// Runtime counters; all zero unless started with `stats: on`.
    pub fn stats(&self) -> ContainerStats {
        self.inner.metrics.snapshot()
    }

    /// The actor registry. Mostly useful for diagnostics and for seeding
    /// known peers without discovery.
    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.inner.registry)
    }

    /// Start the container: bind the remote transport, join discovery when
    /// configured, then drain the starting queue in insertion order.
    ///
    /// A start while started or while a transition is in flight is logged
    /// and ignored. Invalid options fail with `TECHERR`.
    pub async fn start(&self, options: StartOptions) -> Result<(), ErrorInfo> {
        {
            let mut state = self.inner.state.lock();
            match *state {
                Lifecycle::Idle => *state = Lifecycle::Locking,
                _ => {
                    warn!(
                        container = %self.inner.id,
                        "start ignored, already started or transition in flight"
                    );
                    return Ok(());
                }
            }
        }

        match self.inner.do_start(options).await {
            Ok(()) => {
                // The drain runs while the state is still Locking, so a
                // send racing it keeps landing in the queue; the drain
                // itself flips to Started once the queue is empty.
                self.inner.has_stopped.store(false, Ordering::SeqCst);
                self.inner.drain_starting_queue().await;
                info!(container = %self.inner.id, "container started");
                Ok(())
            }
            Err(e) => {
                *self.inner.state.lock() = Lifecycle::Idle;
                warn!(container = %self.inner.id, error = %e, "start failed");
                Err(e)
            }
        }
    }

    /// `start` with untyped parameters; unrecognized keys fail the schema
    /// check with `TECHERR`.
    pub async fn start_with_value(&self, params: Value) -> Result<(), ErrorInfo> {
        let options = StartOptions::from_value(params).map_err(ErrorInfo::from)?;
        self.start(options).await
    }

    /// Stop discovery, then the remote transport. In-flight requests are
    /// not cancelled; they complete through their own deadlines.
    pub async fn stop(&self) -> Result<(), ErrorInfo> {
        {
            let mut state = self.inner.state.lock();
            match *state {
                Lifecycle::Started => *state = Lifecycle::Locking,
                _ => {
                    warn!(
                        container = %self.inner.id,
                        "stop ignored, not started or transition in flight"
                    );
                    return Ok(());
                }
            }
        }

        self.inner.discovery.stop().await;
        self.inner.remote.stop().await;
        self.inner.has_stopped.store(true, Ordering::SeqCst);
        *self.inner.state.lock() = Lifecycle::Idle;
        info!(container = %self.inner.id, "container stopped");
        Ok(())
    }

    /// Host an actor. A bare id gets a fresh UUID resource; the returned
    /// id is the fully-qualified one the actor is registered under.
    pub fn add_actor(
        &self,
        aid: &str,
        behavior: impl ActorBehavior,
    ) -> Result<ActorId, ErrorInfo> {
        self.add_actor_arc(aid, Arc::new(behavior))
    }

    pub fn add_actor_arc(
        &self,
        aid: &str,
        behavior: Arc<dyn ActorBehavior>,
    ) -> Result<ActorId, ErrorInfo> {
        let parsed = ActorId::parse(aid).map_err(|e| ErrorInfo::techerr(e.to_string()))?;
        let full = if parsed.is_bare() {
            parsed
                .qualified(&Uuid::new_v4().to_string())
                .map_err(|e| ErrorInfo::techerr(e.to_string()))?
        } else {
            parsed
        };

        let container = self.inner.net_info.read().clone().unwrap_or(NetInfo {
            id: self.inner.id.clone(),
            ip: std::net::IpAddr::V4(Ipv4Addr::LOCALHOST),
            pid: std::process::id(),
            port: 0,
        });

        // One task per hosted actor drains its mailbox, so deliveries to
        // an actor keep their order and handler failures stay contained.
        let (mailbox, mut deliveries) = mpsc::unbounded_channel::<(ActorContext, Delivery)>();
        {
            let aid = full.clone();
            tokio::spawn(async move {
                while let Some((ctx, delivery)) = deliveries.recv().await {
                    if let Err(e) = behavior.on_message(ctx, delivery).await {
                        warn!(aid = %aid, error = %e, "actor handler failed");
                    }
                }
                debug!(aid = %aid, "actor task ended");
            });
        }

        self.inner.registry.add(ActorEntry {
            id: full.clone(),
            container,
            scope: Scope::Process,
            mailbox: Some(mailbox),
        });
        self.inner.correlation.notify_found_entry(&full);
        info!(aid = %full, container = %self.inner.id, "actor added");

        // Keep peers current when discovery is already running.
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            inner.discovery.announce(inner.registry.hosted_bare_ids()).await;
        });

        Ok(full)
    }

    /// Remove a hosted actor by its exact id. Idempotent.
    pub fn remove_actor(&self, aid: &str) -> Result<(), ErrorInfo> {
        let parsed = ActorId::parse(aid).map_err(|e| ErrorInfo::techerr(e.to_string()))?;
        if self.inner.registry.remove(&parsed, Scope::Process).is_none() {
            debug!(aid = %parsed, "remove of unknown actor ignored");
        }
        Ok(())
    }

    /// Append a middleware to the pipeline. Chains run in registration
    /// order at every station.
    pub fn use_middleware(&self, middleware: impl Middleware) -> &Self {
        self.inner.middleware.write().push(Arc::new(middleware));
        self
    }

    /// Update a tunable property. `discoveryAddrs` is delegated to
    /// discovery; every other key lands in the properties map.
    pub fn set(&self, key: &str, value: Value) -> &Self {
        if key == PROP_DISCOVERY_ADDRS {
            self.inner
                .discovery
                .set_discovery_addrs(parse_addr_list(&value));
        } else {
            self.inner.props.write().insert(key.to_string(), value);
        }
        self
    }

    /// Fire-and-forget send. Before start the send is queued; after stop
    /// it is a logged no-op.
    pub async fn send(&self, from: &str, to: &str, content: Value, options: SendOptions) {
        self.inner
            .submit(from.to_string(), to.to_string(), content, options, None)
            .await;
    }

    /// Send expecting a response. Resolves exactly once: with the
    /// response, or with `TIMEOUT`, `NOTFOUND`, `DROPPED` or `TECHERR`.
    pub async fn call(
        &self,
        from: &str,
        to: &str,
        content: Value,
        options: SendOptions,
    ) -> Result<Response, ErrorInfo> {
        ContainerInner::call_through(&self.inner, from.to_string(), to, content, options).await
    }
}

impl Default for Container {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("id", &self.inner.id)
            .field("state", &*self.inner.state.lock())
            .finish()
    }
}

impl ContainerInner {
    async fn do_start(&self, options: StartOptions) -> Result<(), ErrorInfo> {
        let ip = options.ip.unwrap_or_else(resolve_local_ip);
        let net = NetInfo {
            id: self.id.clone(),
            ip,
            pid: std::process::id(),
            port: 0,
        };

        let net = self
            .remote
            .start(net)
            .await
            .map_err(|e| ErrorInfo::techerr(e.to_string()))?;
        *self.net_info.write() = Some(net.clone());

        if let Some(addr) = &options.discovery_addr {
            let group = match parse_discovery_group(addr) {
                Some(group) => group,
                None => {
                    self.remote.stop().await;
                    return Err(ErrorInfo::techerr(format!(
                        "invalid discovery address '{addr}'"
                    )));
                }
            };
            let port = options.discovery_port.unwrap_or(DEFAULT_DISCOVERY_PORT);
            if let Err(e) = self
                .discovery
                .start(group, port, net, self.registry.hosted_bare_ids())
                .await
            {
                self.remote.stop().await;
                return Err(ErrorInfo::techerr(e.to_string()));
            }
        }

        self.metrics.set_enabled(options.stats_enabled());
        Ok(())
    }

    /// Drain queued sends in insertion order, then transition to Started.
    ///
    /// Runs with the lifecycle still Locking: a concurrent `submit` keeps
    /// queueing behind the entries being drained. Each pass takes the
    /// whole queue; the Started flip happens under the queue lock on an
    /// empty pass, so nothing can slip in between the last drain and the
    /// flip. Lock order is starting_queue, then state, here and in
    /// `submit`.
    async fn drain_starting_queue(&self) {
        loop {
            let queued: Vec<QueuedSend> = {
                let mut queue = self.starting_queue.lock();
                if queue.is_empty() {
                    *self.state.lock() = Lifecycle::Started;
                    return;
                }
                std::mem::take(&mut *queue)
            };
            info!(count = queued.len(), "draining starting queue");
            for q in queued {
                self.dispatch_send(q.from, q.to, q.content, q.options, q.waiter)
                    .await;
            }
        }
    }

    async fn call_through(
        inner: &Arc<ContainerInner>,
        from: String,
        to: &str,
        content: Value,
        options: SendOptions,
    ) -> Result<Response, ErrorInfo> {
        let (tx, rx) = oneshot::channel();
        inner
            .submit(from, to.to_string(), content, options, Some(tx))
            .await;
        rx.await
            .unwrap_or_else(|_| Err(ErrorInfo::techerr("container gone before completion")))
    }

    /// Entry point of every send: queue before start, refuse after stop,
    /// dispatch when started.
    async fn submit(
        &self,
        from: String,
        to: String,
        content: Value,
        options: SendOptions,
        waiter: Option<ResultWaiter>,
    ) {
        // The state is read under the queue lock (queue, then state, same
        // order as the drain) so a send racing the start drain either
        // joins the queue or runs strictly after the drain finished.
        let waiter = {
            let mut queue = self.starting_queue.lock();
            let started = matches!(*self.state.lock(), Lifecycle::Started);
            if !started {
                if self.has_stopped.load(Ordering::SeqCst) {
                    drop(queue);
                    warn!(to = %to, "send ignored, container stopped");
                    if let Some(w) = waiter {
                        let _ = w.send(Err(ErrorInfo::techerr("container stopped")));
                    }
                    return;
                }
                debug!(to = %to, "container not started, queueing send");
                queue.push(QueuedSend {
                    from,
                    to,
                    content,
                    options,
                    waiter,
                });
                return;
            }
            waiter
        };
        self.dispatch_send(from, to, content, options, waiter).await;
    }

    /// Build, validate and launch a request.
    async fn dispatch_send(
        &self,
        from: String,
        to: String,
        content: Value,
        options: SendOptions,
        waiter: Option<ResultWaiter>,
    ) {
        let has_waiter = waiter.is_some();
        let timeout = match options.timeout.filter(|t| *t > 0) {
            Some(t) => t,
            None if has_waiter => self.prop_u64(PROP_DEFAULT_SEND_TIMEOUT, DEFAULT_SEND_TIMEOUT_MS),
            None => self.prop_u64(PROP_MAX_SEND_TIMEOUT, MAX_SEND_TIMEOUT_MS),
        };

        let request = Request {
            id: Uuid::new_v4().to_string(),
            from: self.qualify_from(&from),
            to,
            content,
            headers: options.headers.unwrap_or_default(),
            date: now_ms(),
            timeout,
            cb: has_waiter,
        };

        if let Err(e) = validate_request(&request) {
            warn!(error = %e, "send rejected by validation");
            if let Some(w) = waiter {
                let _ = w.send(Err(e.into()));
            }
            return;
        }
        self.metrics.record_send();

        let chain = self.middleware_chain();
        let mut slot = ReplySlot::empty();
        let msg = run_chain(
            &chain,
            MessageKind::ReqOut,
            PipelineMessage::Request(request.clone()),
            &mut slot,
        )
        .await;
        let request = match msg {
            Some(PipelineMessage::Request(req)) => req,
            _ => {
                // Silent policy drop; an awaiting caller still completes
                // through its deadline.
                debug!(request_id = %request.id, "outgoing request halted by middleware");
                if let Some(w) = waiter {
                    let timeout = request.timeout;
                    tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_millis(timeout)).await;
                        let _ = w.send(Err(ErrorInfo::timeout()));
                    });
                }
                return;
            }
        };

        if let Some(w) = waiter {
            self.arm_request(&request, w);
        }
        self.internal_send(request).await;
    }

    /// Arm correlation for an awaited request: the response waiter, the
    /// deadline timer, and the drop supervisor that retries until the
    /// deadline.
    fn arm_request(&self, request: &Request, waiter: ResultWaiter) {
        let Some(inner) = self.self_ref.upgrade() else {
            return;
        };

        let response_rx = self.correlation.await_response(&request.id);
        let drop_rx = self.correlation.arm_drop(&request.id);

        // Completion: first response wins, then all state is released.
        {
            let inner = Arc::clone(&inner);
            let id = request.id.clone();
            tokio::spawn(async move {
                let outcome = match response_rx.await {
                    Ok(res) => match &res.err {
                        Some(err) => Err(err.clone()),
                        None => Ok(res),
                    },
                    Err(_) => Err(ErrorInfo::techerr("container gone before completion")),
                };
                inner.correlation.release(&id);
                let _ = waiter.send(outcome);
            });
        }

        // Deadline: synthesize TIMEOUT unless a response already won.
        {
            let inner = Arc::clone(&inner);
            let request = request.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(request.timeout)).await;
                let synthetic = Response::synthetic(&request, ErrorInfo::timeout());
                if inner.correlation.complete_response(synthetic) {
                    inner.metrics.record_timeout();
                    debug!(request_id = %request.id, "request timed out");
                }
            });
        }

        // Drop supervisor: re-resolve and retry while the deadline allows.
        // Retries reuse the original target so a new discovery round may
        // land on a different peer.
        {
            let pristine = request.clone();
            let mut drop_rx = drop_rx;
            tokio::spawn(async move {
                while drop_rx.recv().await.is_some() {
                    inner.metrics.record_drop();
                    if pristine.expired(now_ms()) {
                        let synthetic = Response::synthetic(&pristine, ErrorInfo::dropped());
                        if inner.correlation.complete_response(synthetic) {
                            debug!(request_id = %pristine.id, "dropped past deadline");
                        }
                        break;
                    }
                    let delay = inner.prop_u64(PROP_RETRY_DELAY, RETRY_DELAY_MS);
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    if pristine.expired(now_ms()) {
                        break; // timeout path completes the caller
                    }
                    inner.metrics.record_retry();
                    debug!(request_id = %pristine.id, "retrying after drop");
                    inner.internal_send(pristine.clone()).await;
                }
            });
        }
    }

    /// Resolve the target and hand the request to the scope's transport.
    ///
    /// A registry hit resolves inline, so requests to known actors keep
    /// their send order. An unknown target moves to a background search
    /// bounded by the research timeout; the caller is never blocked on it.
    async fn internal_send(&self, request: Request) {
        self.metrics.record_search();
        let Ok(aid) = ActorId::parse(&request.to) else {
            debug!(to = %request.to, "unparseable target id, discarding");
            return;
        };

        if let Some(found) = self.registry.pick(&aid) {
            // Fulfil concurrent searches for the same id, and keep
            // broadcasting so peers learn the interest either way.
            self.correlation.notify_found_key(&request.to, &found);
            self.discovery.notify_searched(&request.to).await;
            self.deliver(request, found);
            return;
        }

        let Some(inner) = self.self_ref.upgrade() else {
            return;
        };
        tokio::spawn(async move { inner.search_and_deliver(request).await });
    }

    /// Slow path: wait for discovery to turn the target up, then deliver;
    /// give up with NOTFOUND once the research timeout passes.
    async fn search_and_deliver(&self, request: Request) {
        let to = request.to.clone();
        let found_rx = self.correlation.await_found(&to);
        self.discovery.notify_searched(&to).await;

        let research = self.prop_u64(PROP_RESEARCH_TIMEOUT, RESEARCH_TIMEOUT_MS);
        match tokio::time::timeout(Duration::from_millis(research), found_rx).await {
            Ok(Ok(found)) => self.deliver(request, found),
            _ => {
                self.correlation.prune_found(&to);
                debug!(request_id = %request.id, to = %to, "actor not found");
                // Synthetic completion, same as the timeout and drop
                // paths: no transport was involved, so the incoming
                // middleware never sees it.
                let synthetic = Response::synthetic(&request, ErrorInfo::notfound(&to));
                if !self.correlation.complete_response(synthetic) {
                    debug!(request_id = %request.id, "notfound with no waiting caller");
                }
            }
        }
    }

    /// Hand a resolved request to the transport matching the actor's scope.
    fn deliver(&self, mut request: Request, found: ActorId) {
        if request.expired(now_ms()) {
            debug!(request_id = %request.id, "deadline passed during resolution, discarding");
            return;
        }

        let Some(entry) = self.registry.get(&found, None) else {
            debug!(request_id = %request.id, aid = %found, "resolved actor vanished, dropping");
            self.on_drop(request);
            return;
        };

        request.to = entry.id.to_string();
        match entry.scope {
            Scope::Process => self.inproc.send(request),
            Scope::Local | Scope::Remote => {
                // Connect latency must not stall the sender; drops come
                // back through the event pump either way.
                let Some(inner) = self.self_ref.upgrade() else {
                    return;
                };
                let peer = entry.container.clone();
                tokio::spawn(async move { inner.remote.send(&peer, request).await });
            }
        }
    }

    /// Incoming request: resolve the hosted actor, run the incoming
    /// middleware, then dispatch to the handler one tick deferred.
    async fn on_req(&self, mut request: Request, responder: Responder) {
        let Ok(target) = ActorId::parse(&request.to) else {
            warn!(to = %request.to, "incoming request with invalid target id");
            return;
        };
        let Some(entry) = self.registry.resolve_process(&target) else {
            warn!(to = %request.to, "no hosted actor for incoming request");
            return;
        };
        let Some(mailbox) = entry.mailbox.clone() else {
            return;
        };
        request.to = entry.id.to_string();
        self.metrics.record_delivery();

        // One reply across middleware and handler: the responder sits in a
        // shared slot consumed by the first taker.
        let sink = Arc::new(Mutex::new(Some(responder)));
        let reply: ReplyClosure = {
            let weak = self.self_ref.clone();
            let request = request.clone();
            let sink = Arc::clone(&sink);
            Arc::new(move |result| {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                inner.spawn_reply(request.clone(), Arc::clone(&sink), result);
            })
        };

        let chain = self.middleware_chain();
        let mut slot = ReplySlot::with({
            let reply = Arc::clone(&reply);
            Box::new(move |result| (reply.as_ref())(result))
        });
        let msg = run_chain(
            &chain,
            MessageKind::ReqIn,
            PipelineMessage::Request(request),
            &mut slot,
        )
        .await;
        let request = match msg {
            Some(PipelineMessage::Request(req)) => req,
            _ => {
                debug!("incoming request halted by middleware");
                return;
            }
        };

        let ctx = ActorContext {
            id: entry.id.clone(),
            container: self.self_ref.clone(),
        };
        let delivery = Delivery::new(request, reply);
        // The mailbox is the deferral: the actor's task picks the message
        // up on a later tick, never inside this dispatch.
        if mailbox.send((ctx, delivery)).is_err() {
            warn!(aid = %entry.id, "actor task gone, request discarded");
        }
    }

    /// Build the response for a handled request and return it through the
    /// outgoing middleware and the transport responder.
    fn spawn_reply(
        &self,
        request: Request,
        sink: Arc<Mutex<Option<Responder>>>,
        result: Result<Value, ErrorInfo>,
    ) {
        let Some(responder) = sink.lock().take() else {
            debug!(request_id = %request.id, "request already answered, reply ignored");
            return;
        };
        let Some(inner) = self.self_ref.upgrade() else {
            return;
        };

        tokio::spawn(async move {
            let response = Response::to_request(&request, result);
            let chain = inner.middleware_chain();

            // RES_OUT short-circuit goes through the same once-only slot
            // as the normal delivery below.
            let direct = Arc::new(Mutex::new(Some(responder)));
            let mut slot = ReplySlot::with({
                let direct = Arc::clone(&direct);
                let request = request.clone();
                Box::new(move |result| {
                    if let Some(responder) = direct.lock().take() {
                        responder.reply(Response::to_request(&request, result));
                    }
                })
            });

            match run_chain(
                &chain,
                MessageKind::ResOut,
                PipelineMessage::Response(response),
                &mut slot,
            )
            .await
            {
                Some(PipelineMessage::Response(res)) => {
                    if let Some(responder) = direct.lock().take() {
                        inner.metrics.record_response_sent();
                        responder.reply(res);
                    }
                }
                None => debug!("outgoing response halted by middleware"),
                Some(PipelineMessage::Request(_)) => {}
            }
        });
    }

    /// Incoming response: run the incoming middleware, then complete the
    /// caller exactly once.
    async fn on_res(&self, response: Response) {
        let chain = self.middleware_chain();
        let mut slot = ReplySlot::empty();
        match run_chain(
            &chain,
            MessageKind::ResIn,
            PipelineMessage::Response(response),
            &mut slot,
        )
        .await
        {
            Some(PipelineMessage::Response(res)) => {
                let id = res.id.clone();
                if self.correlation.complete_response(res) {
                    self.metrics.record_response_received();
                } else {
                    debug!(request_id = %id, "response without a waiting caller");
                }
            }
            None => debug!("incoming response halted by middleware"),
            Some(PipelineMessage::Request(_)) => {}
        }
    }

    /// A transport could not deliver: wake the request's retry supervisor,
    /// or just log for fire-and-forget requests.
    fn on_drop(&self, request: Request) {
        if !self.correlation.notify_drop(&request.id) {
            self.metrics.record_drop();
            debug!(request_id = %request.id, "request dropped with no retry listener");
        }
    }

    /// Qualify a bare `from` with the matching hosted actor, so replies
    /// can route back to a concrete instance.
    fn qualify_from(&self, from: &str) -> String {
        let Ok(aid) = ActorId::parse(from) else {
            return from.to_string();
        };
        if !aid.is_bare() {
            return from.to_string();
        }
        match self.registry.resolve_process(&aid) {
            Some(entry) => entry.id.to_string(),
            None => from.to_string(),
        }
    }

    fn middleware_chain(&self) -> Vec<Arc<dyn Middleware>> {
        self.middleware.read().clone()
    }

    fn prop_u64(&self, key: &str, default: u64) -> u64 {
        self.props
            .read()
            .get(key)
            .and_then(Value::as_u64)
            .unwrap_or(default)
    }

    /// Integrate a peer announcement or search answer into the registry.
    fn integrate_peer_actor(&self, aid: &str, container: NetInfo) {
        let Ok(id) = ActorId::parse(aid) else {
            debug!(aid, "peer advertised an invalid actor id, skipped");
            return;
        };
        let scope = self.classify(&container);
        self.registry.add(ActorEntry {
            id: id.clone(),
            container,
            scope,
            mailbox: None,
        });
        self.correlation.notify_found_entry(&id);
    }

    /// LOCAL when the peer shares this host's IP, REMOTE otherwise.
    fn classify(&self, peer: &NetInfo) -> Scope {
        let local_ip = self.net_info.read().as_ref().map(|n| n.ip);
        if local_ip == Some(peer.ip) {
            Scope::Local
        } else {
            Scope::Remote
        }
    }
}

fn spawn_transport_pump(
    inner: Weak<ContainerInner>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) {
    // Events are handled inline: the pump is the container's logical loop,
    // so registry and correlation state see one mutator and incoming
    // requests keep their arrival order. Handlers themselves are spawned
    // off the loop in `on_req`.
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let Some(inner) = inner.upgrade() else {
                break;
            };
            match event {
                TransportEvent::Request { request, responder } => {
                    inner.on_req(request, responder).await;
                }
                TransportEvent::Response(response) => inner.on_res(response).await,
                TransportEvent::Dropped(request) => inner.on_drop(request),
            }
        }
    });
}

fn spawn_discovery_pump(
    inner: Weak<ContainerInner>,
    mut events: mpsc::UnboundedReceiver<DiscoveryEvent>,
) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let Some(inner) = inner.upgrade() else {
                break;
            };
            match event {
                DiscoveryEvent::PeerActors { container, actors } => {
                    for aid in actors {
                        inner.integrate_peer_actor(&aid, container.clone());
                    }
                }
                DiscoveryEvent::Answer { aid, container } => {
                    inner.integrate_peer_actor(&aid, container);
                }
                DiscoveryEvent::PeerLeft { container_id } => {
                    inner.registry.remove_container(&container_id);
                }
            }
        }
    });
}

/// Parse a discovery group address, tolerating a scheme prefix
/// (`udp://224.0.0.1`).
fn parse_discovery_group(addr: &str) -> Option<Ipv4Addr> {
    let bare = addr.rsplit("://").next().unwrap_or(addr);
    bare.parse().ok()
}

/// Parse the `discoveryAddrs` property value: an array of
/// `"group:port"` strings, scheme prefixes tolerated.
fn parse_addr_list(value: &Value) -> Vec<SocketAddr> {
    let Some(items) = value.as_array() else {
        warn!("discoveryAddrs must be an array of address strings");
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let s = item.as_str()?;
            let bare = s.rsplit("://").next().unwrap_or(s);
            match bare.parse() {
                Ok(addr) => Some(addr),
                Err(_) => {
                    warn!(addr = s, "ignoring unparseable discovery address");
                    None
                }
            }
        })
        .collect()
}
