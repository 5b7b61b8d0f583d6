use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet, VecDeque};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as RuntimeMessage};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::TargetState;

type RuntimeSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Client frames held while no runtime is attached. Oldest frames go first.
const MAX_PENDING_FRAMES: usize = 1024;

/// Ids for replayed commands live far above anything a DevTools client sends,
/// so their replies can be recognized and swallowed.
const REPLAY_ID_BASE: u64 = 1 << 48;

/// The runtime side of a session. Replaced on every reload; remembers which
/// protocol domains the client enabled so a fresh runtime emits the same
/// events without the client asking again.
struct RuntimeLeg {
    name: String,
    socket: Option<RuntimeSocket>,
    url: Option<String>,
    pending: VecDeque<RuntimeMessage>,
    /// `Domain.enable` method to the params it was first sent with.
    enabled: BTreeMap<String, Value>,
    replay_ids: HashSet<u64>,
    next_replay_id: u64,
}

impl RuntimeLeg {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            socket: None,
            url: None,
            pending: VecDeque::new(),
            enabled: BTreeMap::new(),
            replay_ids: HashSet::new(),
            next_replay_id: REPLAY_ID_BASE,
        }
    }

    fn is_connected(&self) -> bool {
        self.socket.is_some()
    }

    fn is_attached_to(&self, url: &str) -> bool {
        self.socket.is_some() && self.url.as_deref() == Some(url)
    }

    /// Connect to a runtime debugger, replay enabled domains, then flush
    /// frames the client sent while detached.
    async fn attach(&mut self, url: String) -> Result<(), WsError> {
        self.detach().await;
        let (socket, _) = connect_async(url.as_str()).await?;
        self.socket = Some(socket);
        self.url = Some(url);
        self.replay_ids.clear();

        let replays: Vec<(String, Value)> = self
            .enabled
            .iter()
            .map(|(method, params)| (method.clone(), params.clone()))
            .collect();
        for (method, params) in replays {
            let id = self.next_replay_id;
            self.next_replay_id += 1;
            let command = json!({ "id": id, "method": method, "params": params });
            if !self.write(RuntimeMessage::Text(command.to_string())).await {
                return Ok(());
            }
            self.replay_ids.insert(id);
            debug!(worker = %self.name, method = %method, "replayed domain enable");
        }

        while let Some(frame) = self.pending.pop_front() {
            if !self.forward(frame).await {
                break;
            }
        }
        Ok(())
    }

    async fn detach(&mut self) {
        if let Some(mut socket) = self.socket.take() {
            let _ = socket.close(None).await;
        }
    }

    /// Send a client frame upstream, or hold it until the next attach.
    /// Returns false if the runtime leg broke while sending.
    async fn forward(&mut self, frame: RuntimeMessage) -> bool {
        if self.socket.is_none() {
            self.hold(frame);
            return true;
        }
        let sent = frame.clone();
        if !self.write(frame).await {
            self.pending.push_front(sent);
            return false;
        }
        if let RuntimeMessage::Text(text) = &sent {
            self.track_domains(text);
        }
        true
    }

    async fn write(&mut self, frame: RuntimeMessage) -> bool {
        let Some(socket) = self.socket.as_mut() else {
            return false;
        };
        match socket.send(frame).await {
            Ok(()) => true,
            Err(e) => {
                debug!(worker = %self.name, error = %e, "runtime send failed");
                self.socket = None;
                false
            }
        }
    }

    fn hold(&mut self, frame: RuntimeMessage) {
        if self.pending.len() >= MAX_PENDING_FRAMES {
            warn!(worker = %self.name, limit = MAX_PENDING_FRAMES, "debugger frame buffer full, dropping oldest");
            self.pending.pop_front();
        }
        self.pending.push_back(frame);
    }

    fn track_domains(&mut self, text: &str) {
        let Ok(command) = serde_json::from_str::<Value>(text) else {
            return;
        };
        let Some(method) = command.get("method").and_then(Value::as_str) else {
            return;
        };
        if method.ends_with(".enable") {
            let params = command.get("params").cloned().unwrap_or_else(|| json!({}));
            self.enabled.entry(method.to_string()).or_insert(params);
        } else if let Some(domain) = method.strip_suffix(".disable") {
            self.enabled.remove(&format!("{}.enable", domain));
        }
    }

    /// Replies to replayed commands are ours, not the client's.
    fn is_replay_reply(&mut self, text: &str) -> bool {
        if self.replay_ids.is_empty() {
            return false;
        }
        let id = serde_json::from_str::<Value>(text)
            .ok()
            .and_then(|reply| reply.get("id").and_then(Value::as_u64));
        match id {
            Some(id) => self.replay_ids.remove(&id),
            None => false,
        }
    }

    async fn next_frame(&mut self) -> Option<Result<RuntimeMessage, WsError>> {
        match self.socket.as_mut() {
            Some(socket) => socket.next().await,
            None => std::future::pending().await,
        }
    }
}

/// Relay one DevTools client to the worker's runtime until either side ends
/// the session. The runtime leg is replaced whenever the worker reloads; the
/// client leg is never reopened.
pub(super) async fn run_session(
    name: String,
    mut client: WebSocket,
    mut target: watch::Receiver<TargetState>,
) {
    let mut runtime = RuntimeLeg::new(&name);

    let initial = target.borrow_and_update().clone();
    if let (Some(url), false) = (initial.url, initial.reloading) {
        if let Err(e) = runtime.attach(url.clone()).await {
            warn!(worker = %name, url = %url, error = %e, "runtime debugger unreachable");
            close(client, close_code::ERROR, "runtime debugger unreachable").await;
            return;
        }
    }

    loop {
        tokio::select! {
            incoming = client.recv() => {
                let frame = match incoming {
                    Some(Ok(Message::Text(text))) => RuntimeMessage::Text(text),
                    Some(Ok(Message::Binary(data))) => RuntimeMessage::Binary(data),
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                        debug!(worker = %name, "debugger client left");
                        break;
                    }
                };
                if runtime.is_connected() {
                    if !runtime.forward(frame).await && !drop_expected(&target) {
                        info!(worker = %name, "runtime debugger closed, ending session");
                        close(client, close_code::AWAY, "runtime debugger closed").await;
                        return;
                    }
                } else {
                    runtime.hold(frame);
                }
            }
            frame = runtime.next_frame(), if runtime.is_connected() => {
                match frame {
                    Some(Ok(RuntimeMessage::Text(text))) => {
                        if runtime.is_replay_reply(&text) {
                            continue;
                        }
                        if client.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                        continue;
                    }
                    Some(Ok(RuntimeMessage::Binary(data))) => {
                        if client.send(Message::Binary(data)).await.is_err() {
                            break;
                        }
                        continue;
                    }
                    Some(Ok(RuntimeMessage::Close(_))) | Some(Err(_)) | None => {}
                    Some(Ok(_)) => continue,
                }

                runtime.socket = None;
                if drop_expected(&target) {
                    debug!(worker = %name, "runtime debugger dropped during reload");
                } else {
                    info!(worker = %name, "runtime debugger closed, ending session");
                    close(client, close_code::AWAY, "runtime debugger closed").await;
                    return;
                }
            }
            changed = target.changed() => {
                if changed.is_err() {
                    info!(worker = %name, "worker gone, ending debugger session");
                    close(client, close_code::AWAY, "worker stopped").await;
                    return;
                }
                let state = target.borrow_and_update().clone();
                if state.reloading {
                    continue;
                }
                let Some(url) = state.url else { continue };
                if runtime.is_attached_to(&url) {
                    continue;
                }

                match runtime.attach(url.clone()).await {
                    Ok(()) => info!(worker = %name, url = %url, "runtime debugger reconnected"),
                    Err(e) => {
                        warn!(worker = %name, url = %url, error = %e, "runtime debugger unreachable");
                        close(client, close_code::ERROR, "runtime debugger unreachable").await;
                        return;
                    }
                }
            }
        }
    }

    runtime.detach().await;
}

/// A newer state we have not looked at yet may explain an upstream drop.
fn drop_expected(target: &watch::Receiver<TargetState>) -> bool {
    target.borrow().reloading || target.has_changed().unwrap_or(false)
}

async fn close(mut client: WebSocket, code: u16, reason: &'static str) {
    let _ = client
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}
