use std::time::Duration;

use futures::{SinkExt, StreamExt};
use panesync_core::{
    ControlMessage, EventFrame, Hello, STATE_SYNC_TOPIC, WireMessage, decode_frame, encode_frame,
};
use panesync_relay::{AppState, build_router};
use serde_json::json;
use tokio::{net::TcpListener, sync::oneshot, time::timeout};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;
type WsWrite = futures::stream::SplitSink<WsStream, Message>;
type WsRead = futures::stream::SplitStream<WsStream>;

struct TestWindow {
    write: WsWrite,
    read: WsRead,
}

#[tokio::test]
async fn broadcast_event_reaches_every_window_including_sender() {
    let (address, state, shutdown_tx) = start_relay().await;

    let mut main = connect_window(&address, "app-1", "main").await;
    let mut notify = connect_window(&address, "app-1", "notify").await;
    wait_for_windows(&state, "app-1", 2).await;
    drain_control(&mut main).await;
    drain_control(&mut notify).await;

    let event = event_frame("main", None, json!({"storeId": "chat"}));
    send_event(&mut main, &event).await;

    let received_notify = recv_event(&mut notify, Duration::from_secs(2)).await;
    assert_eq!(received_notify, Some(event.clone()));
    let received_main = recv_event(&mut main, Duration::from_secs(2)).await;
    assert_eq!(received_main, Some(event));

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn targeted_event_reaches_only_its_target() {
    let (address, state, shutdown_tx) = start_relay().await;

    let mut main = connect_window(&address, "app-2", "main").await;
    let mut call = connect_window(&address, "app-2", "call").await;
    let mut notify = connect_window(&address, "app-2", "notify").await;
    wait_for_windows(&state, "app-2", 3).await;
    for window in [&mut main, &mut call, &mut notify] {
        drain_control(window).await;
    }

    let event = event_frame("main", Some("call"), json!({"roomId": "r1"}));
    send_event(&mut main, &event).await;

    assert_eq!(
        recv_event(&mut call, Duration::from_secs(2)).await,
        Some(event)
    );
    assert!(
        recv_event(&mut notify, Duration::from_millis(300))
            .await
            .is_none(),
        "untargeted window received a targeted event"
    );
    assert!(
        recv_event(&mut main, Duration::from_millis(300))
            .await
            .is_none(),
        "sender received its own targeted event"
    );

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn event_for_absent_window_is_dropped() {
    let (address, state, shutdown_tx) = start_relay().await;

    let mut main = connect_window(&address, "app-3", "main").await;
    let mut notify = connect_window(&address, "app-3", "notify").await;
    wait_for_windows(&state, "app-3", 2).await;
    drain_control(&mut main).await;
    drain_control(&mut notify).await;

    let event = event_frame("main", Some("call"), json!({}));
    send_event(&mut main, &event).await;

    assert!(
        recv_event(&mut notify, Duration::from_millis(300))
            .await
            .is_none()
    );
    assert!(
        recv_event(&mut main, Duration::from_millis(300))
            .await
            .is_none()
    );

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn spoofed_source_is_dropped() {
    let (address, state, shutdown_tx) = start_relay().await;

    let mut main = connect_window(&address, "app-4", "main").await;
    let mut notify = connect_window(&address, "app-4", "notify").await;
    wait_for_windows(&state, "app-4", 2).await;
    drain_control(&mut main).await;
    drain_control(&mut notify).await;

    let spoofed = event_frame("login", None, json!({"theme": "dark"}));
    send_event(&mut main, &spoofed).await;

    assert!(
        recv_event(&mut notify, Duration::from_millis(400))
            .await
            .is_none(),
        "peer received an event with a spoofed source"
    );

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn duplicate_label_is_rejected() {
    let (address, state, shutdown_tx) = start_relay().await;

    let mut first = connect_window(&address, "app-5", "call").await;
    wait_for_windows(&state, "app-5", 1).await;
    drain_control(&mut first).await;

    let mut second = connect_window(&address, "app-5", "call").await;
    let reply = recv_next_wire_message(&mut second, Duration::from_secs(2)).await;
    match reply {
        Some(WireMessage::Control(ControlMessage::Error { message })) => {
            assert!(message.contains("already in use"), "unexpected error: {message}");
        }
        other => panic!("expected error control frame, got {other:?}"),
    }

    assert_eq!(state.windows("app-5").await, vec!["call".to_owned()]);

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn welcome_and_window_list_track_membership() {
    let (address, state, shutdown_tx) = start_relay().await;

    let mut main = connect_window(&address, "app-6", "main").await;
    match recv_next_wire_message(&mut main, Duration::from_secs(2)).await {
        Some(WireMessage::Control(ControlMessage::Welcome(welcome))) => {
            assert_eq!(welcome.windows, vec!["main".to_owned()]);
        }
        other => panic!("expected welcome, got {other:?}"),
    }
    drain_control(&mut main).await;

    let preview = connect_window(&address, "app-6", "preview_media").await;
    wait_for_windows(&state, "app-6", 2).await;
    assert_eq!(
        recv_window_list(&mut main, Duration::from_secs(2)).await,
        Some(vec!["main".to_owned(), "preview_media".to_owned()])
    );

    drop(preview);
    assert_eq!(
        recv_window_list(&mut main, Duration::from_secs(2)).await,
        Some(vec!["main".to_owned()])
    );

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn invalid_first_frame_is_rejected() {
    let (address, _state, shutdown_tx) = start_relay().await;

    let (ws_stream, _) = connect_async(&address).await.expect("connect websocket");
    let (mut write, mut read) = ws_stream.split();

    let frame = encode_frame(&WireMessage::Event(event_frame("main", None, json!({}))))
        .expect("encode event");
    write
        .send(Message::Binary(frame.into()))
        .await
        .expect("send invalid first frame");

    let mut terminated = false;
    for _ in 0..4 {
        match timeout(Duration::from_secs(2), read.next()).await {
            Ok(None) | Ok(Some(Err(_))) | Ok(Some(Ok(Message::Close(_)))) => {
                terminated = true;
                break;
            }
            Ok(Some(Ok(_))) => continue,
            Err(_) => break,
        }
    }
    assert!(terminated, "expected websocket termination after invalid first frame");

    let _ = shutdown_tx.send(());
}

fn event_frame(source: &str, target: Option<&str>, payload: serde_json::Value) -> EventFrame {
    EventFrame {
        topic: STATE_SYNC_TOPIC.to_owned(),
        source: source.to_owned(),
        target: target.map(str::to_owned),
        payload,
    }
}

async fn start_relay() -> (String, AppState, oneshot::Sender<()>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral relay socket");
    let address = listener.local_addr().expect("relay local addr");
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let state = AppState::new();

    let server =
        axum::serve(listener, build_router(state.clone())).with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        });
    tokio::spawn(async move {
        let _ = server.await;
    });

    (format!("ws://{}/ws", address), state, shutdown_tx)
}

async fn connect_window(ws_url: &str, session_id: &str, label: &str) -> TestWindow {
    let (ws_stream, _) = connect_async(ws_url).await.expect("connect websocket");
    let (mut write, read) = ws_stream.split();

    let hello = WireMessage::Control(ControlMessage::Hello(Hello {
        session_id: session_id.to_owned(),
        label: label.to_owned(),
    }));
    let frame = encode_frame(&hello).expect("encode hello");
    write
        .send(Message::Binary(frame.into()))
        .await
        .expect("send hello");

    TestWindow { write, read }
}

async fn wait_for_windows(state: &AppState, session_id: &str, count: usize) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while state.windows(session_id).await.len() < count {
        assert!(
            tokio::time::Instant::now() < deadline,
            "windows never registered in {session_id}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn send_event(window: &mut TestWindow, event: &EventFrame) {
    let frame = encode_frame(&WireMessage::Event(event.clone())).expect("encode event");
    window
        .write
        .send(Message::Binary(frame.into()))
        .await
        .expect("send event");
}

async fn drain_control(window: &mut TestWindow) {
    while let Some(message) = recv_next_wire_message(window, Duration::from_millis(60)).await {
        if let WireMessage::Event(event) = message {
            panic!("unexpected event while draining: {event:?}");
        }
    }
}

async fn recv_event(window: &mut TestWindow, wait: Duration) -> Option<EventFrame> {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        let remaining = deadline.checked_duration_since(tokio::time::Instant::now())?;
        match recv_next_wire_message(window, remaining).await {
            Some(WireMessage::Event(event)) => return Some(event),
            Some(WireMessage::Control(_)) => continue,
            None => return None,
        }
    }
}

async fn recv_window_list(window: &mut TestWindow, wait: Duration) -> Option<Vec<String>> {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        let remaining = deadline.checked_duration_since(tokio::time::Instant::now())?;
        match recv_next_wire_message(window, remaining).await {
            Some(WireMessage::Control(ControlMessage::WindowList(list))) => {
                return Some(list.windows);
            }
            Some(_) => continue,
            None => return None,
        }
    }
}

async fn recv_next_wire_message(window: &mut TestWindow, wait: Duration) -> Option<WireMessage> {
    let next = timeout(wait, window.read.next()).await.ok()?;
    let ws_result = next?;
    let message = ws_result.ok()?;

    match message {
        Message::Binary(bytes) => decode_frame(&bytes).ok(),
        _ => None,
    }
}
