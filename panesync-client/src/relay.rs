use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use futures::{SinkExt, StreamExt};
use panesync_core::{
    ControlMessage, EventFrame, Hello, SessionId, WindowLabel, WireMessage, decode_frame,
    encode_frame, validate_label,
};
use serde_json::Value;
use tokio::{sync::mpsc, task::JoinHandle, time::timeout};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::channel::{ChannelError, Event, ListenerTable, MessageChannel, Subscription, lock};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;
type WsWrite = futures::stream::SplitSink<WsStream, Message>;
type WsRead = futures::stream::SplitStream<WsStream>;

#[derive(Debug, Clone)]
pub struct RelayOptions {
    pub server_url: String,
    pub session_id: SessionId,
    pub label: WindowLabel,
    pub connect_timeout: Duration,
    pub max_attempts: u32,
}

impl RelayOptions {
    pub fn new(session_id: impl Into<SessionId>, label: impl Into<WindowLabel>) -> Self {
        Self {
            session_id: session_id.into(),
            label: label.into(),
            ..Self::default()
        }
    }

    pub fn with_server_url(mut self, server_url: impl Into<String>) -> Self {
        self.server_url = server_url.into();
        self
    }
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:7878/ws".to_owned(),
            session_id: "default".to_owned(),
            label: "main".to_owned(),
            connect_timeout: Duration::from_secs(5),
            max_attempts: 3,
        }
    }
}

/// A window endpoint whose events travel through a `panesync-relay`.
#[derive(Debug)]
pub struct RelayChannel {
    label: WindowLabel,
    session_id: SessionId,
    outgoing: mpsc::UnboundedSender<WireMessage>,
    listeners: Arc<ListenerTable>,
    windows: Arc<Mutex<Vec<WindowLabel>>>,
    tasks: Vec<JoinHandle<()>>,
}

impl RelayChannel {
    /// Dials the relay, registers `options.label` and waits for the relay to
    /// acknowledge it.
    pub async fn connect(options: RelayOptions) -> Result<Self, ChannelError> {
        const BACKOFF_BASE_MS: u64 = 200;

        validate_label(&options.label)?;
        if let Err(err) = Url::parse(&options.server_url) {
            return Err(ChannelError::InvalidUrl {
                url: options.server_url.clone(),
                reason: err.to_string(),
            });
        }

        let max_attempts = options.max_attempts.max(1);
        let ws_stream = {
            let mut attempt: u32 = 1;
            loop {
                info!(
                    attempt,
                    max_attempts,
                    server_url = %options.server_url,
                    label = %options.label,
                    "connecting to relay"
                );

                let failure =
                    match timeout(options.connect_timeout, connect_async(&options.server_url)).await
                    {
                        Ok(Ok((stream, _))) => break stream,
                        Ok(Err(err)) => format!("connect failed: {err}"),
                        Err(_) => format!("connect timed out after {:?}", options.connect_timeout),
                    };
                error!(attempt, server_url = %options.server_url, "{failure}");
                if attempt >= max_attempts {
                    return Err(ChannelError::Connect(failure));
                }

                let backoff_ms = BACKOFF_BASE_MS.saturating_mul(1_u64 << (attempt - 1).min(16));
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                attempt += 1;
            }
        };

        let (mut write_half, mut read_half) = ws_stream.split();

        let hello = WireMessage::Control(ControlMessage::Hello(Hello {
            session_id: options.session_id.clone(),
            label: options.label.clone(),
        }));
        let frame = encode_frame(&hello).map_err(|err| ChannelError::Connect(err.to_string()))?;
        write_half
            .send(Message::Binary(frame.into()))
            .await
            .map_err(|err| ChannelError::Connect(err.to_string()))?;

        let initial_windows = match timeout(options.connect_timeout, await_welcome(&mut read_half))
            .await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(ChannelError::Connect(format!(
                    "relay did not acknowledge window within {:?}",
                    options.connect_timeout
                )));
            }
        };

        info!(
            session_id = %options.session_id,
            label = %options.label,
            windows = ?initial_windows,
            "registered with relay"
        );

        let listeners = Arc::new(ListenerTable::default());
        let windows = Arc::new(Mutex::new(initial_windows));
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel::<WireMessage>();

        let send_task = tokio::spawn(network_send_task(write_half, outgoing_rx));
        let receive_task = tokio::spawn(network_receive_task(
            read_half,
            Arc::clone(&listeners),
            Arc::clone(&windows),
        ));

        Ok(Self {
            label: options.label,
            session_id: options.session_id,
            outgoing,
            listeners,
            windows,
            tasks: vec![send_task, receive_task],
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Windows connected to the same session, as last reported by the relay.
    pub fn windows(&self) -> Vec<WindowLabel> {
        lock(&self.windows).clone()
    }

    pub fn is_connected(&self) -> bool {
        !self.outgoing.is_closed() && self.tasks.iter().all(|task| !task.is_finished())
    }

    fn send_event(&self, target: Option<&str>, topic: &str, payload: Value) -> Result<(), ChannelError> {
        self.outgoing
            .send(WireMessage::Event(EventFrame {
                topic: topic.to_owned(),
                source: self.label.clone(),
                target: target.map(str::to_owned),
                payload,
            }))
            .map_err(|_| ChannelError::Closed)
    }
}

impl MessageChannel for RelayChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn emit(&self, topic: &str, payload: Value) -> Result<(), ChannelError> {
        self.send_event(None, topic, payload)
    }

    fn emit_to(&self, target: &str, topic: &str, payload: Value) -> Result<(), ChannelError> {
        self.send_event(Some(target), topic, payload)
    }

    fn listen(&self, topic: &str) -> Subscription {
        self.listeners.listen(topic)
    }
}

impl Drop for RelayChannel {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn await_welcome(read_half: &mut WsRead) -> Result<Vec<WindowLabel>, ChannelError> {
    while let Some(next) = read_half.next().await {
        let message = next.map_err(|err| ChannelError::Connect(err.to_string()))?;
        let data = match message {
            Message::Binary(data) => data,
            Message::Close(_) => break,
            _ => continue,
        };
        match decode_frame(&data) {
            Ok(WireMessage::Control(ControlMessage::Welcome(welcome))) => {
                return Ok(welcome.windows);
            }
            Ok(WireMessage::Control(ControlMessage::Error { message })) => {
                return Err(ChannelError::Rejected(message));
            }
            Ok(other) => debug!("ignoring frame before welcome: {:?}", other),
            Err(err) => warn!("failed to decode frame before welcome: {}", err),
        }
    }
    Err(ChannelError::Connect(
        "relay closed the connection before welcome".to_owned(),
    ))
}

async fn network_send_task(mut ws_write: WsWrite, mut outgoing_rx: mpsc::UnboundedReceiver<WireMessage>) {
    while let Some(message) = outgoing_rx.recv().await {
        match encode_frame(&message) {
            Ok(frame) => {
                if ws_write.send(Message::Binary(frame.into())).await.is_err() {
                    break;
                }
            }
            Err(err) => warn!("failed to encode outgoing frame: {}", err),
        }
    }
}

async fn network_receive_task(
    mut ws_read: WsRead,
    listeners: Arc<ListenerTable>,
    windows: Arc<Mutex<Vec<WindowLabel>>>,
) {
    while let Some(next) = ws_read.next().await {
        let message = match next {
            Ok(message) => message,
            Err(err) => {
                warn!("relay receive error: {}", err);
                break;
            }
        };

        let data = match message {
            Message::Binary(data) => data,
            Message::Close(_) => break,
            _ => continue,
        };

        match decode_frame(&data) {
            Ok(WireMessage::Event(frame)) => {
                let event = Event {
                    topic: frame.topic,
                    source: frame.source,
                    payload: frame.payload,
                };
                if listeners.dispatch(&event) == 0 {
                    debug!(topic = %event.topic, "no listener for relayed event");
                }
            }
            Ok(WireMessage::Control(ControlMessage::WindowList(list))) => {
                *lock(&windows) = list.windows;
            }
            Ok(WireMessage::Control(ControlMessage::Error { message })) => {
                warn!("relay reported error: {}", message);
            }
            Ok(WireMessage::Control(other)) => debug!("ignoring control frame: {:?}", other),
            Err(err) => warn!("failed to decode relayed frame: {}", err),
        }
    }
    warn!("relay connection closed");
}
