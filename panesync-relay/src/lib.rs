use std::{collections::HashMap, sync::Arc, time::Duration};

use axum::{
    Json, Router,
    extract::{State, WebSocketUpgrade, ws::Message},
    response::IntoResponse,
    routing::get,
};
use futures::{SinkExt, StreamExt};
use panesync_core::{
    ControlMessage, EventFrame, Hello, MAX_FRAME_BYTES, MAX_WINDOWS_PER_SESSION, SessionId,
    Welcome, WindowLabel, WindowList, WireMessage, decode_frame, encode_frame, validate_label,
};
use tokio::{
    net::TcpListener,
    sync::{RwLock, mpsc},
};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
struct Connection {
    tx: mpsc::UnboundedSender<Message>,
}

#[derive(Debug, Default)]
struct Session {
    windows: HashMap<WindowLabel, Connection>,
}

impl Session {
    fn labels(&self) -> Vec<WindowLabel> {
        let mut labels = self.windows.keys().cloned().collect::<Vec<_>>();
        labels.sort();
        labels
    }

    fn recipients(&self) -> Vec<mpsc::UnboundedSender<Message>> {
        self.windows.values().map(|conn| conn.tx.clone()).collect()
    }
}

#[derive(Debug, Default)]
struct RelayState {
    sessions: HashMap<SessionId, Session>,
}

#[derive(Debug, Clone)]
pub struct AppState {
    inner: Arc<RwLock<RelayState>>,
}

impl AppState {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(RelayState::default())),
        }
    }

    /// Labels currently connected in `session_id`, sorted.
    pub async fn windows(&self, session_id: &str) -> Vec<WindowLabel> {
        let relay = self.inner.read().await;
        relay
            .sessions
            .get(session_id)
            .map(Session::labels)
            .unwrap_or_default()
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/healthz", get(healthz_handler))
        .with_state(state)
}

pub async fn serve(listener: TcpListener, state: AppState) -> Result<(), String> {
    info!(
        "relay listening on {}",
        listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_owned())
    );
    axum::serve(listener, build_router(state))
        .await
        .map_err(|err| err.to_string())
}

async fn healthz_handler() -> impl IntoResponse {
    Json(serde_json::json!({"ok": true}))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.max_frame_size(MAX_FRAME_BYTES + 5)
        .on_upgrade(move |socket| async move {
            if let Err(err) = handle_socket(state, socket).await {
                warn!("window session ended with error: {}", err);
            }
        })
}

async fn handle_socket(
    state: AppState,
    socket: axum::extract::ws::WebSocket,
) -> Result<(), String> {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

    // Pongs queued by the read half only leave when the write half sends,
    // so the write half pings on its own schedule.
    const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

    let send_task = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(KEEPALIVE_INTERVAL);
        ping_interval.tick().await;

        loop {
            tokio::select! {
                msg = outbound_rx.recv() => {
                    match msg {
                        Some(message) => {
                            let closing = matches!(message, Message::Close(_));
                            if ws_sender.send(message).await.is_err() || closing {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let first_message = ws_receiver
        .next()
        .await
        .ok_or_else(|| "window disconnected before hello".to_owned())
        .and_then(|result| result.map_err(|err| err.to_string()))?;

    let hello = match parse_hello_message(&first_message) {
        Ok(hello) => hello,
        Err(err) => {
            reject(&outbound_tx, &err);
            return Err(err);
        }
    };

    let session_id = hello.session_id.clone();
    let label = hello.label.clone();

    if let Err(err) = register_window(
        &state,
        &session_id,
        &label,
        Connection {
            tx: outbound_tx.clone(),
        },
    )
    .await
    {
        reject(&outbound_tx, &err);
        return Err(err);
    }

    info!(session_id = %session_id, label = %label, "window joined");

    while let Some(next_message) = ws_receiver.next().await {
        let message = match next_message {
            Ok(message) => message,
            Err(err) => {
                warn!("websocket receive error: {}", err);
                break;
            }
        };

        match message {
            Message::Binary(data) => {
                let wire = match decode_frame(&data) {
                    Ok(wire) => wire,
                    Err(err) => {
                        warn!(label = %label, "failed to decode frame: {}", err);
                        continue;
                    }
                };

                match wire {
                    WireMessage::Event(event) => {
                        if event.source != label {
                            warn!(label = %label, source = %event.source, "event source mismatch");
                            continue;
                        }
                        route_event(&state, &session_id, event).await;
                    }
                    WireMessage::Control(_) => {
                        warn!(label = %label, "unexpected control message after hello");
                    }
                }
            }
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) | Message::Text(_) => {}
        }
    }

    unregister_window(&state, &session_id, &label).await;
    send_task.abort();
    info!(session_id = %session_id, label = %label, "window left");
    Ok(())
}

fn parse_hello_message(message: &Message) -> Result<Hello, String> {
    let data = match message {
        Message::Binary(data) => data,
        _ => return Err("first message must be binary hello frame".to_owned()),
    };

    let frame = decode_frame(data).map_err(|err| format!("invalid hello frame: {}", err))?;
    match frame {
        WireMessage::Control(ControlMessage::Hello(hello)) => {
            if hello.session_id.trim().is_empty() {
                return Err("session_id cannot be empty".to_owned());
            }
            validate_label(&hello.label).map_err(|err| err.to_string())?;
            Ok(hello)
        }
        _ => Err("first control message must be Hello".to_owned()),
    }
}

fn reject(tx: &mpsc::UnboundedSender<Message>, reason: &str) {
    send_control(
        std::slice::from_ref(tx),
        ControlMessage::Error {
            message: reason.to_owned(),
        },
    );
    let _ = tx.send(Message::Close(None));
}

async fn register_window(
    state: &AppState,
    session_id: &SessionId,
    label: &WindowLabel,
    connection: Connection,
) -> Result<(), String> {
    let mut relay = state.inner.write().await;
    let session = relay.sessions.entry(session_id.clone()).or_default();
    if session.windows.contains_key(label) {
        return Err(format!(
            "window label {} is already in use in session {}",
            label, session_id
        ));
    }
    if session.windows.len() >= MAX_WINDOWS_PER_SESSION {
        return Err(format!(
            "session {} is full (max {})",
            session_id, MAX_WINDOWS_PER_SESSION
        ));
    }
    session.windows.insert(label.clone(), connection.clone());

    let windows = session.labels();
    let recipients = session.recipients();
    drop(relay);

    send_control(
        std::slice::from_ref(&connection.tx),
        ControlMessage::Welcome(Welcome {
            session_id: session_id.clone(),
            windows: windows.clone(),
        }),
    );
    send_control(
        &recipients,
        ControlMessage::WindowList(WindowList {
            session_id: session_id.clone(),
            windows,
        }),
    );

    Ok(())
}

async fn unregister_window(state: &AppState, session_id: &SessionId, label: &WindowLabel) {
    let mut relay = state.inner.write().await;
    let mut recipients = Vec::new();
    let mut windows = Vec::new();
    if let Some(session) = relay.sessions.get_mut(session_id) {
        session.windows.remove(label);
        recipients = session.recipients();
        windows = session.labels();
        if session.windows.is_empty() {
            relay.sessions.remove(session_id);
        }
    }
    drop(relay);

    if recipients.is_empty() {
        return;
    }

    send_control(
        &recipients,
        ControlMessage::WindowList(WindowList {
            session_id: session_id.clone(),
            windows,
        }),
    );
}

async fn route_event(state: &AppState, session_id: &SessionId, event: EventFrame) {
    let recipients = {
        let relay = state.inner.read().await;
        let Some(session) = relay.sessions.get(session_id) else {
            return;
        };
        match &event.target {
            Some(target) => session
                .windows
                .get(target)
                .map(|conn| vec![conn.tx.clone()])
                .unwrap_or_default(),
            None => session.recipients(),
        }
    };

    if recipients.is_empty() {
        debug!(
            topic = %event.topic,
            recipient = ?event.target,
            "no recipient for event, dropping"
        );
        return;
    }

    match encode_frame(&WireMessage::Event(event)) {
        Ok(frame) => {
            for tx in recipients {
                let _ = tx.send(Message::Binary(frame.clone().into()));
            }
        }
        Err(err) => warn!("failed to re-encode event: {}", err),
    }
}

fn send_control(recipients: &[mpsc::UnboundedSender<Message>], control: ControlMessage) {
    let frame = match encode_frame(&WireMessage::Control(control)) {
        Ok(frame) => frame,
        Err(err) => {
            error!("failed to serialize control message: {}", err);
            return;
        }
    };

    for tx in recipients {
        let _ = tx.send(Message::Binary(frame.clone().into()));
    }
}
