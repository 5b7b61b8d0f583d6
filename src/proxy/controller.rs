//! Reload state machine for one worker.
//!
//! All transitions run on a single actor task. `fetch` is reentrant: each
//! call asks the actor for a [`Release`] and then forwards on its own task.
//! While the worker reloads, callers wait in a FIFO queue. When the worker
//! settles, every queued caller is released at once against the new upstream.
//! Released callers issue their requests in arrival order, but none waits for
//! another's response.

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Request, State};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::listener::Listener;
use super::live_reload::{self, LiveReloadHub, LIVE_RELOAD_PATH};
use super::{Bundle, Phase, ProxyData, ProxyError};
use crate::config::WorkerConfig;
use crate::forward::Forwarder;
use crate::inspector::InspectorProxy;
use crate::registry::{DevRegistry, Heartbeat, WorkerDescriptor};
use crate::resolver::{gateway, BindingResolver};

/// Host the outbound gateway binds to; it is only meant for the local runtime.
const OUTBOUND_IP: &str = "127.0.0.1";

/// Upstream snapshot handed to a released request.
#[derive(Debug, Clone)]
struct Upstream {
    origin: String,
    headers: BTreeMap<String, String>,
    live_reload: bool,
}

impl Upstream {
    fn from_proxy_data(data: &ProxyData) -> Self {
        Self {
            origin: data.user_worker_url.trim_end_matches('/').to_string(),
            headers: data.headers.clone(),
            live_reload: data.live_reload,
        }
    }
}

/// How long a released request holds back its successor if the runtime has
/// not answered yet.
const ISSUE_GRACE: Duration = Duration::from_millis(25);

/// A caller's place in the issue order of a flush.
///
/// A request starts once its predecessor is issued, meaning the response
/// head arrived or `ISSUE_GRACE` passed. Nobody waits on a whole response,
/// so a request that calls back into this worker cannot block itself.
struct Turn {
    after: Option<oneshot::Receiver<()>>,
    issued: oneshot::Sender<()>,
}

impl Turn {
    async fn run<F: Future>(self, send: F) -> F::Output {
        if let Some(after) = self.after {
            // A dropped predecessor counts as issued.
            let _ = after.await;
        }
        let mut issued = Some(self.issued);
        let grace = tokio::time::sleep(ISSUE_GRACE);
        tokio::pin!(send, grace);
        loop {
            tokio::select! {
                // Dropping `issued` here releases the successor.
                output = &mut send => return output,
                _ = &mut grace, if issued.is_some() => {
                    if let Some(issued) = issued.take() {
                        let _ = issued.send(());
                    }
                }
            }
        }
    }
}

struct Release {
    upstream: Upstream,
    turn: Option<Turn>,
}

/// A caller parked until the next flush.
struct BufferedRequest {
    seq: u64,
    reply: oneshot::Sender<Result<Release, ProxyError>>,
}

enum Command {
    ConfigUpdate {
        config: Box<WorkerConfig>,
        reply: oneshot::Sender<Result<(), ProxyError>>,
    },
    ReloadStart(Bundle),
    ReloadComplete(ProxyData),
    Settled {
        epoch: u64,
    },
    Acquire {
        reply: oneshot::Sender<Result<Release, ProxyError>>,
    },
    Snapshot {
        reply: oneshot::Sender<ProxySnapshot>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Point-in-time view of the controller, for tooling and tests.
#[derive(Debug, Clone, Serialize)]
pub struct ProxySnapshot {
    pub name: String,
    pub phase: Phase,
    pub bundle_version: u64,
    pub queued: usize,
    pub upstream: Option<String>,
    pub public_addr: SocketAddr,
    pub inspector_addr: SocketAddr,
    pub outbound_addr: SocketAddr,
}

struct Shared {
    name: String,
    forwarder: Forwarder,
    resolver: BindingResolver,
    inspector: InspectorProxy,
    live_reload: LiveReloadHub,
}

/// Handle to a running worker front end. Cheap to clone.
#[derive(Clone)]
pub struct ProxyController {
    commands: mpsc::UnboundedSender<Command>,
    shared: Arc<Shared>,
}

impl ProxyController {
    /// Bind the worker's listeners, publish it to the registry and start the
    /// actor. The worker starts in `Idle`: requests wait for the first reload.
    pub async fn start(config: WorkerConfig, registry: DevRegistry) -> Result<Self, ProxyError> {
        let forwarder = Forwarder::new()?;
        let resolver = BindingResolver::new(&config, registry.clone(), forwarder.clone());
        let inspector = InspectorProxy::new();
        inspector.add_worker(&config.name);

        let (commands, rx) = mpsc::unbounded_channel();
        let controller = Self {
            commands: commands.clone(),
            shared: Arc::new(Shared {
                name: config.name.clone(),
                forwarder,
                resolver: resolver.clone(),
                inspector: inspector.clone(),
                live_reload: LiveReloadHub::new(),
            }),
        };

        let public = Listener::bind(
            "public",
            &config.dev.ip,
            config.dev.port,
            public_router(controller.clone()),
        )
        .await?;
        let inspector_listener = match Listener::bind(
            "inspector",
            &config.dev.ip,
            config.dev.inspector_port,
            inspector.router(),
        )
        .await
        {
            Ok(listener) => listener,
            Err(e) => {
                public.stop().await;
                return Err(e);
            }
        };
        let outbound = match Listener::bind(
            "outbound",
            OUTBOUND_IP,
            config.dev.outbound_port,
            gateway::build_router(resolver),
        )
        .await
        {
            Ok(listener) => listener,
            Err(e) => {
                public.stop().await;
                inspector_listener.stop().await;
                return Err(e);
            }
        };

        let actor = Actor {
            controller: controller.clone(),
            commands,
            config,
            registry,
            phase: Phase::Idle,
            bundle_version: 0,
            epoch: 0,
            proxy_data: None,
            upstream: None,
            queue: VecDeque::new(),
            last_turn: None,
            next_seq: 0,
            public,
            inspector_listener,
            outbound,
        };
        if let Err(e) = actor.publish().await {
            actor.stop_listeners().await;
            return Err(e);
        }
        tokio::spawn(actor.run(rx));

        Ok(controller)
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Resolver for this worker's outbound bindings.
    pub fn resolver(&self) -> &BindingResolver {
        &self.shared.resolver
    }

    pub fn inspector(&self) -> &InspectorProxy {
        &self.shared.inspector
    }

    /// Apply a new config. Rebinds listeners whose port changed and
    /// republishes the worker. A bind failure is returned and the old
    /// listener keeps serving.
    pub async fn config_update(&self, config: WorkerConfig) -> Result<(), ProxyError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::ConfigUpdate {
            config: Box::new(config),
            reply,
        })?;
        rx.await.map_err(|_| ProxyError::ShuttingDown)?
    }

    pub fn reload_start(&self, bundle: Bundle) -> Result<(), ProxyError> {
        self.send(Command::ReloadStart(bundle))
    }

    pub fn reload_complete(&self, data: ProxyData) -> Result<(), ProxyError> {
        self.send(Command::ReloadComplete(data))
    }

    pub async fn snapshot(&self) -> Result<ProxySnapshot, ProxyError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Snapshot { reply })?;
        rx.await.map_err(|_| ProxyError::ShuttingDown)
    }

    /// Reject waiting requests, stop listeners and remove the registry entry.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.send(Command::Shutdown { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    /// Serve one inbound request per the current phase.
    pub async fn fetch(&self, request: Request) -> Response {
        let inject_allowed = request.method() != Method::HEAD;
        let Release { upstream, turn } = match self.acquire().await {
            Ok(release) => release,
            Err(e) => {
                warn!(worker = %self.shared.name, error = %e, "request rejected");
                return e.into_response();
            }
        };

        let send = self
            .shared
            .forwarder
            .send(&upstream.origin, &upstream.headers, request);
        let result = match turn {
            Some(turn) => turn.run(send).await,
            None => send.await,
        };

        match result {
            Ok(response) => {
                let status = response.status();
                let inject = upstream.live_reload
                    && inject_allowed
                    && status != StatusCode::NO_CONTENT
                    && status != StatusCode::NOT_MODIFIED;
                live_reload::render(response, inject).await
            }
            Err(e) => {
                warn!(worker = %self.shared.name, error = %e, "upstream unavailable");
                ProxyError::Upstream(e).into_response()
            }
        }
    }

    async fn acquire(&self) -> Result<Release, ProxyError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Acquire { reply })?;
        rx.await.map_err(|_| ProxyError::ShuttingDown)?
    }

    fn send(&self, command: Command) -> Result<(), ProxyError> {
        self.commands
            .send(command)
            .map_err(|_| ProxyError::ShuttingDown)
    }
}

fn public_router(controller: ProxyController) -> Router {
    Router::new()
        .route(LIVE_RELOAD_PATH, get(live_reload_socket))
        .fallback(proxy_fetch)
        .with_state(controller)
}

async fn proxy_fetch(State(controller): State<ProxyController>, request: Request) -> Response {
    controller.fetch(request).await
}

async fn live_reload_socket(
    State(controller): State<ProxyController>,
    upgrade: WebSocketUpgrade,
) -> Response {
    let reloads = controller.shared.live_reload.subscribe();
    upgrade.on_upgrade(move |socket| live_reload::serve_socket(socket, reloads))
}

struct Actor {
    controller: ProxyController,
    commands: mpsc::UnboundedSender<Command>,
    config: WorkerConfig,
    registry: DevRegistry,
    phase: Phase,
    bundle_version: u64,
    /// Bumped by every reload event; a settle timer only applies if no event
    /// arrived after it was armed.
    epoch: u64,
    proxy_data: Option<ProxyData>,
    /// Only `Some` while `phase == Ready`.
    upstream: Option<Upstream>,
    queue: VecDeque<BufferedRequest>,
    /// Issue signal of the most recently released caller that had to keep
    /// its place in line.
    last_turn: Option<oneshot::Receiver<()>>,
    next_seq: u64,
    public: Listener,
    inspector_listener: Listener,
    outbound: Listener,
}

impl Actor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        let name = self.config.name.clone();
        let mut heartbeat = interval(self.config.registry.heartbeat_interval());
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.tick().await;

        loop {
            tokio::select! {
                command = rx.recv() => {
                    let Some(command) = command else { break };
                    if let Command::Shutdown { reply } = command {
                        // Refuse new work before draining the listeners, whose
                        // in-flight requests may still be waiting on us.
                        rx.close();
                        while let Ok(command) = rx.try_recv() {
                            reject(command);
                        }
                        self.shutdown().await;
                        let _ = reply.send(());
                        break;
                    }
                    self.handle(command).await;
                }
                _ = heartbeat.tick() => self.heartbeat().await,
            }
        }
        info!(worker = %name, "controller stopped");
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::ConfigUpdate { config, reply } => {
                let result = self.on_config_update(*config).await;
                let _ = reply.send(result);
            }
            Command::ReloadStart(bundle) => self.on_reload_start(bundle),
            Command::ReloadComplete(data) => self.on_reload_complete(data),
            Command::Settled { epoch } => self.on_settled(epoch),
            Command::Acquire { reply } => self.on_acquire(reply),
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            Command::Shutdown { .. } => unreachable!("shutdown handled in run loop"),
        }
    }

    async fn on_config_update(&mut self, config: WorkerConfig) -> Result<(), ProxyError> {
        let published_addr = self.public.local_addr();
        if let Err(e) = self.rebind_listeners(&config).await {
            error!(worker = %self.config.name, error = %e, "listener rebind failed, keeping previous config");
            // Callers must not keep resolving a port that no longer listens.
            if self.public.local_addr() != published_addr {
                if let Err(e) = self.publish().await {
                    error!(worker = %self.config.name, error = %e, "republish after partial rebind failed");
                }
            }
            return Err(e);
        }

        let old = std::mem::replace(&mut self.config, config);
        self.controller.shared.resolver.update(&self.config);
        if old.name != self.config.name {
            // The registry key follows the worker name.
            let _ = self.registry.unregister(&old.name).await;
            self.controller.shared.inspector.remove_worker(&old.name);
            self.controller.shared.inspector.add_worker(&self.config.name);
        }
        self.publish().await
    }

    /// Move every listener whose address changed. A listener that fails to
    /// move keeps serving on its old address; ones already moved are recorded
    /// so a retry only touches the rest.
    async fn rebind_listeners(&mut self, config: &WorkerConfig) -> Result<(), ProxyError> {
        let new = &config.dev;
        let ip_changed = self.config.dev.ip != new.ip;

        if ip_changed || self.config.dev.port != new.port {
            let router = public_router(self.controller.clone());
            self.public.rebind(&new.ip, new.port, router).await?;
            self.config.dev.port = new.port;
        }
        if ip_changed || self.config.dev.inspector_port != new.inspector_port {
            let router = self.controller.shared.inspector.router();
            self.inspector_listener
                .rebind(&new.ip, new.inspector_port, router)
                .await?;
            self.config.dev.inspector_port = new.inspector_port;
        }
        if self.config.dev.outbound_port != new.outbound_port {
            let router = gateway::build_router(self.controller.shared.resolver.clone());
            self.outbound
                .rebind(OUTBOUND_IP, new.outbound_port, router)
                .await?;
            self.config.dev.outbound_port = new.outbound_port;
        }
        Ok(())
    }

    fn on_reload_start(&mut self, bundle: Bundle) {
        self.phase = Phase::Reloading;
        self.bundle_version += 1;
        self.epoch += 1;
        self.upstream = None;
        self.controller
            .shared
            .inspector
            .set_reloading(&self.config.name);
        info!(
            worker = %self.config.name,
            version = self.bundle_version,
            entrypoint = %bundle.entrypoint.display(),
            format = ?bundle.format,
            "reload started"
        );
    }

    fn on_reload_complete(&mut self, data: ProxyData) {
        self.epoch += 1;
        let epoch = self.epoch;
        self.controller
            .shared
            .inspector
            .set_upstream(&self.config.name, data.user_worker_inspector_url.clone());
        debug!(worker = %self.config.name, upstream = %data.user_worker_url, "reload complete, settling");
        self.proxy_data = Some(data);

        let settle = self.config.proxy.settle_delay();
        if settle.is_zero() {
            self.on_settled(epoch);
        } else {
            let commands = self.commands.clone();
            tokio::spawn(async move {
                tokio::time::sleep(settle).await;
                let _ = commands.send(Command::Settled { epoch });
            });
        }
    }

    fn on_settled(&mut self, epoch: u64) {
        if epoch != self.epoch {
            debug!(epoch, current = self.epoch, "superseded settle ignored");
            return;
        }
        let Some(data) = &self.proxy_data else {
            return;
        };
        let upstream = Upstream::from_proxy_data(data);
        info!(
            worker = %self.config.name,
            upstream = %upstream.origin,
            queued = self.queue.len(),
            "worker ready"
        );
        if upstream.live_reload {
            self.controller.shared.live_reload.notify();
        }
        self.upstream = Some(upstream);
        self.phase = Phase::Ready;
        self.flush();
    }

    fn on_acquire(&mut self, reply: oneshot::Sender<Result<Release, ProxyError>>) {
        if self.phase == Phase::Ready {
            if let Some(upstream) = self.upstream.clone() {
                // Only a flush that has not finished issuing holds us back.
                let turn = self.line_pending().then(|| self.next_turn());
                let _ = reply.send(Ok(Release { upstream, turn }));
                return;
            }
        }

        let limit = self.config.proxy.max_buffered;
        if self.queue.len() >= limit {
            warn!(worker = %self.config.name, limit, "request buffer full");
            let _ = reply.send(Err(ProxyError::BufferFull(self.queue.len())));
            return;
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        debug!(worker = %self.config.name, seq, depth = self.queue.len() + 1, phase = ?self.phase, "request buffered");
        self.queue.push_back(BufferedRequest { seq, reply });
    }

    /// Release every queued caller against the current upstream. Each gets
    /// a turn so requests reach the runtime in arrival order.
    fn flush(&mut self) {
        if self.phase != Phase::Ready {
            return;
        }
        let Some(upstream) = self.upstream.clone() else {
            return;
        };
        if self.queue.is_empty() {
            return;
        }

        debug!(worker = %self.config.name, count = self.queue.len(), upstream = %upstream.origin, "releasing buffered requests");
        while let Some(next) = self.queue.pop_front() {
            let release = Release {
                upstream: upstream.clone(),
                turn: Some(self.next_turn()),
            };
            // A caller that gave up drops its turn, which unblocks the next.
            let _ = next.reply.send(Ok(release));
        }
    }

    fn next_turn(&mut self) -> Turn {
        let (issued, tail) = oneshot::channel();
        Turn {
            after: self.last_turn.replace(tail),
            issued,
        }
    }

    /// Whether some released caller has yet to issue its request.
    fn line_pending(&mut self) -> bool {
        let pending = matches!(
            self.last_turn.as_mut().map(|tail| tail.try_recv()),
            Some(Err(oneshot::error::TryRecvError::Empty))
        );
        if !pending {
            self.last_turn = None;
        }
        pending
    }

    fn descriptor(&self) -> WorkerDescriptor {
        let addr = self.public.local_addr();
        let host = if addr.ip().is_unspecified() {
            "127.0.0.1".to_string()
        } else {
            addr.ip().to_string()
        };
        WorkerDescriptor::new(self.config.name.clone(), host, addr.port())
            .with_durable_objects(self.config.exported_classes())
            .with_headers(self.config.dev.headers.clone())
    }

    async fn publish(&self) -> Result<(), ProxyError> {
        self.registry.register(self.descriptor()).await?;
        Ok(())
    }

    async fn heartbeat(&self) {
        match self.registry.heartbeat(&self.config.name).await {
            Ok(Heartbeat::Refreshed) => {}
            Ok(Heartbeat::Missing) => {
                warn!(worker = %self.config.name, "registry entry vanished, re-registering");
                if let Err(e) = self.publish().await {
                    error!(worker = %self.config.name, error = %e, "re-registration failed");
                }
            }
            Ok(Heartbeat::Displaced(owner)) => {
                warn!(worker = %self.config.name, pid = owner.pid, "registry entry owned by another process");
            }
            Err(e) => warn!(worker = %self.config.name, error = %e, "heartbeat failed"),
        }
    }

    fn snapshot(&self) -> ProxySnapshot {
        ProxySnapshot {
            name: self.config.name.clone(),
            phase: self.phase,
            bundle_version: self.bundle_version,
            queued: self.queue.len(),
            upstream: self.upstream.as_ref().map(|u| u.origin.clone()),
            public_addr: self.public.local_addr(),
            inspector_addr: self.inspector_listener.local_addr(),
            outbound_addr: self.outbound.local_addr(),
        }
    }

    async fn shutdown(mut self) {
        info!(worker = %self.config.name, queued = self.queue.len(), "shutting down");
        for waiting in self.queue.drain(..) {
            let _ = waiting.reply.send(Err(ProxyError::ShuttingDown));
        }
        self.controller
            .shared
            .inspector
            .remove_worker(&self.config.name);
        if let Err(e) = self.registry.unregister(&self.config.name).await {
            warn!(worker = %self.config.name, error = %e, "failed to unregister");
        }
        self.stop_listeners().await;
    }

    async fn stop_listeners(self) {
        tokio::join!(
            self.public.stop(),
            self.inspector_listener.stop(),
            self.outbound.stop()
        );
    }
}

fn reject(command: Command) {
    match command {
        Command::Acquire { reply } => {
            let _ = reply.send(Err(ProxyError::ShuttingDown));
        }
        Command::ConfigUpdate { reply, .. } => {
            let _ = reply.send(Err(ProxyError::ShuttingDown));
        }
        Command::Shutdown { reply } => {
            let _ = reply.send(());
        }
        _ => {}
    }
}
