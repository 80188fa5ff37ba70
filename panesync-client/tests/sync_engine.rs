use std::{
    sync::{
        Arc, Barrier,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use panesync_client::{
    JsonStore, ListenerId, LocalBus, MessageChannel, MessageChannelExt, ReactiveStore,
    StoreListener, Subscription, SyncError, SyncOptions, SyncPlugin, SyncRole,
};
use panesync_core::{
    CoreError, STATE_SYNC_REQUEST_TOPIC, STATE_SYNC_TOPIC, StatePatch, SyncMessage,
    SyncRequestMessage,
};
use serde_json::{Value, json};
use tokio::time::{Instant, sleep};

fn open(bus: &LocalBus, label: &str) -> Arc<dyn MessageChannel> {
    Arc::new(bus.open(label).expect("open window"))
}

fn drain_sync_messages(sub: &mut Subscription) -> Vec<SyncMessage> {
    let mut messages = Vec::new();
    while let Some(event) = sub.try_recv() {
        messages.push(event.decode().expect("decode sync message"));
    }
    messages
}

#[tokio::test(start_paused = true)]
async fn rapid_changes_coalesce_into_one_message() {
    let bus = LocalBus::new();
    let main = open(&bus, "main");
    let observer = open(&bus, "notify");
    let mut observed = observer.listen(STATE_SYNC_TOPIC);

    let store = Arc::new(JsonStore::new(
        "call",
        json!({"friendInfo": null, "roomId": "", "muted": false}),
    ));
    let plugin = SyncPlugin::new(Arc::clone(&main), SyncOptions::default());
    let engine = plugin
        .attach(store.clone(), &SyncOptions::with_paths(["friendInfo", "roomId"]))
        .expect("attach")
        .expect("engine for non-empty paths");
    assert_eq!(engine.role(), SyncRole::Peer);

    // Initial reconciliation is sent right away.
    let initial = drain_sync_messages(&mut observed);
    assert_eq!(initial.len(), 1);
    assert_eq!(initial[0].state["roomId"], json!(""));

    let started = Instant::now();
    store.set("friendInfo", json!({"id": 1})).unwrap();
    sleep(Duration::from_millis(10)).await;
    store.set("roomId", json!("r1")).unwrap();
    assert!(observed.try_recv().is_none(), "flushed before the debounce elapsed");

    let event = observed.recv().await.expect("debounced flush");
    let elapsed = started.elapsed();
    assert!(
        elapsed >= Duration::from_millis(50) && elapsed < Duration::from_millis(100),
        "flush after {elapsed:?}"
    );

    let message: SyncMessage = event.decode().unwrap();
    let mut expected = StatePatch::new();
    expected.insert("friendInfo".to_owned(), json!({"id": 1}));
    expected.insert("roomId".to_owned(), json!("r1"));
    assert_eq!(message, SyncMessage::new("call", expected, "main", &[]));

    sleep(Duration::from_millis(200)).await;
    assert!(drain_sync_messages(&mut observed).is_empty());
    assert!(engine.pending_paths().is_empty());
}

#[tokio::test(start_paused = true)]
async fn follower_requests_state_and_never_publishes() {
    let bus = LocalBus::new();
    let main = open(&bus, "main");
    let login = open(&bus, "login");
    let mut requests = main.listen(STATE_SYNC_REQUEST_TOPIC);
    let mut updates = main.listen(STATE_SYNC_TOPIC);

    let store = Arc::new(JsonStore::new("settings", json!({"theme": "light"})));
    let plugin = SyncPlugin::new(Arc::clone(&login), SyncOptions::default());
    let engine = plugin
        .attach(
            store.clone(),
            &SyncOptions::with_paths(["theme"]).source_window("main"),
        )
        .unwrap()
        .unwrap();
    assert_eq!(engine.role(), SyncRole::Follower);

    let request: SyncRequestMessage = requests
        .try_recv()
        .expect("request sent on attach")
        .decode()
        .unwrap();
    assert_eq!(request.store_id, "settings");
    assert_eq!(request.from, "login");
    assert_eq!(request.to, "main");
    assert_eq!(request.paths, Some(vec!["theme".to_owned()]));

    store.set("theme", json!("blue")).unwrap();
    sleep(Duration::from_millis(500)).await;
    assert!(drain_sync_messages(&mut updates).is_empty());
    assert!(requests.try_recv().is_none());
}

#[tokio::test(start_paused = true)]
async fn source_answers_follower_with_targeted_reply() {
    let bus = LocalBus::new();
    let main = open(&bus, "main");
    let login = open(&bus, "login");
    let observer = open(&bus, "notify");
    let mut observed = observer.listen(STATE_SYNC_TOPIC);

    let options = SyncOptions::with_paths(["theme"]).source_window("main");

    let main_store = Arc::new(JsonStore::new("settings", json!({"theme": "dark"})));
    let _main_engine = SyncPlugin::new(Arc::clone(&main), SyncOptions::default())
        .attach(main_store.clone(), &options)
        .unwrap()
        .unwrap();
    // The source's own initial broadcast.
    assert_eq!(drain_sync_messages(&mut observed).len(), 1);

    let login_store = Arc::new(JsonStore::new("settings", json!({"theme": "light"})));
    let login_engine = SyncPlugin::new(Arc::clone(&login), SyncOptions::default())
        .attach(login_store.clone(), &options)
        .unwrap()
        .unwrap();

    sleep(Duration::from_millis(5)).await;
    assert_eq!(login_store.get("theme"), Some(json!("dark")));
    assert!(
        drain_sync_messages(&mut observed).is_empty(),
        "reply leaked to a window that did not ask"
    );

    // Applying the reply must not schedule a broadcast from the follower.
    assert!(login_engine.pending_paths().is_empty());

    // Changes on the source reach the follower.
    main_store.set("theme", json!("solarized")).unwrap();
    sleep(Duration::from_millis(100)).await;
    assert_eq!(login_store.get("theme"), Some(json!("solarized")));
}

#[tokio::test(start_paused = true)]
async fn mirrored_peers_do_not_ping_pong() {
    let bus = LocalBus::new();
    let main = open(&bus, "main");
    let call = open(&bus, "call");
    let observer = open(&bus, "notify");
    let mut observed = observer.listen(STATE_SYNC_TOPIC);

    let options = SyncOptions::with_paths(["roomId"]);
    let main_store = Arc::new(JsonStore::new("call", json!({"roomId": ""})));
    let call_store = Arc::new(JsonStore::new("call", json!({"roomId": ""})));
    let _main_engine = SyncPlugin::new(Arc::clone(&main), SyncOptions::default())
        .attach(main_store.clone(), &options)
        .unwrap()
        .unwrap();
    let _call_engine = SyncPlugin::new(Arc::clone(&call), SyncOptions::default())
        .attach(call_store.clone(), &options)
        .unwrap()
        .unwrap();

    sleep(Duration::from_millis(200)).await;
    let initial = drain_sync_messages(&mut observed);
    assert_eq!(initial.len(), 2, "one initial broadcast per window");

    main_store.set("roomId", json!("r1")).unwrap();
    sleep(Duration::from_millis(500)).await;

    assert_eq!(call_store.get("roomId"), Some(json!("r1")));
    let after = drain_sync_messages(&mut observed);
    assert_eq!(after.len(), 1);
    assert_eq!(after[0].from, "main");
}

#[tokio::test(start_paused = true)]
async fn receiver_can_change_a_value_it_was_sent() {
    let bus = LocalBus::new();
    let main = open(&bus, "main");
    let call = open(&bus, "call");
    let observer = open(&bus, "notify");
    let mut observed = observer.listen(STATE_SYNC_TOPIC);

    let options = SyncOptions::with_paths(["roomId"]);
    let main_store = Arc::new(JsonStore::new("call", json!({"roomId": ""})));
    let call_store = Arc::new(JsonStore::new("call", json!({"roomId": ""})));
    let _main_engine = SyncPlugin::new(Arc::clone(&main), SyncOptions::default())
        .attach(main_store.clone(), &options)
        .unwrap()
        .unwrap();
    let _call_engine = SyncPlugin::new(Arc::clone(&call), SyncOptions::default())
        .attach(call_store.clone(), &options)
        .unwrap()
        .unwrap();
    sleep(Duration::from_millis(200)).await;
    drain_sync_messages(&mut observed);

    main_store.set("roomId", json!("r1")).unwrap();
    sleep(Duration::from_millis(500)).await;
    assert_eq!(call_store.get("roomId"), Some(json!("r1")));
    drain_sync_messages(&mut observed);

    call_store.set("roomId", json!("r2")).unwrap();
    sleep(Duration::from_millis(500)).await;

    assert_eq!(main_store.get("roomId"), Some(json!("r2")));
    assert_eq!(call_store.get("roomId"), Some(json!("r2")));
    let after = drain_sync_messages(&mut observed);
    assert_eq!(after.len(), 1, "unexpected traffic: {after:?}");
    assert_eq!(after[0].from, "call");
    assert_eq!(after[0].state["roomId"], json!("r2"));
}

/// Store whose next `patch` parks on `gate` twice before applying, so a
/// test can act while a remote update is mid-apply.
struct GatedStore {
    inner: JsonStore,
    armed: AtomicBool,
    gate: Arc<Barrier>,
}

impl ReactiveStore for GatedStore {
    fn id(&self) -> &str {
        self.inner.id()
    }

    fn state(&self) -> Value {
        self.inner.state()
    }

    fn subscribe(&self, listener: StoreListener) -> ListenerId {
        self.inner.subscribe(listener)
    }

    fn unsubscribe(&self, id: ListenerId) {
        self.inner.unsubscribe(id)
    }

    fn patch(&self, partial: &StatePatch) -> Result<(), CoreError> {
        if self.armed.swap(false, Ordering::SeqCst) {
            self.gate.wait();
            self.gate.wait();
        }
        self.inner.patch(partial)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn local_edit_during_remote_apply_is_still_published() {
    let bus = LocalBus::new();
    let main = open(&bus, "main");
    let call = open(&bus, "call");
    let observer = open(&bus, "notify");
    let mut observed = observer.listen(STATE_SYNC_TOPIC);

    let gate = Arc::new(Barrier::new(2));
    let store = Arc::new(GatedStore {
        inner: JsonStore::new("call", json!({"roomId": "", "topic": ""})),
        armed: AtomicBool::new(false),
        gate: Arc::clone(&gate),
    });
    let _engine = SyncPlugin::new(Arc::clone(&main), SyncOptions::default())
        .attach(store.clone(), &SyncOptions::with_paths(["roomId", "topic"]))
        .unwrap()
        .unwrap();
    assert_eq!(drain_sync_messages(&mut observed).len(), 1);

    store.armed.store(true, Ordering::SeqCst);
    let mut remote = StatePatch::new();
    remote.insert("roomId".to_owned(), json!("r9"));
    call.emit_json(STATE_SYNC_TOPIC, &SyncMessage::new("call", remote, "call", &[]))
        .unwrap();

    // The engine is now parked inside `patch` on a worker thread.
    let entered = Arc::clone(&gate);
    tokio::task::spawn_blocking(move || entered.wait()).await.unwrap();
    store.inner.set("topic", json!("local-edit")).unwrap();
    let release = Arc::clone(&gate);
    tokio::task::spawn_blocking(move || release.wait()).await.unwrap();

    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let message: SyncMessage = observed.recv().await.expect("channel open").decode().unwrap();
            if message.from == "main" && message.state.get("topic") == Some(&json!("local-edit")) {
                return;
            }
        }
    })
    .await
    .expect("local edit was never broadcast");

    assert_eq!(store.inner.get("roomId"), Some(json!("r9")));
}

#[tokio::test(start_paused = true)]
async fn message_addressed_elsewhere_is_ignored() {
    let bus = LocalBus::new();
    let main = open(&bus, "main");
    let call = open(&bus, "call");
    let notify = open(&bus, "notify");

    let options = SyncOptions::with_paths(["roomId"]);
    let call_store = Arc::new(JsonStore::new("call", json!({"roomId": ""})));
    let notify_store = Arc::new(JsonStore::new("call", json!({"roomId": ""})));
    let _call_engine = SyncPlugin::new(Arc::clone(&call), SyncOptions::default())
        .attach(call_store.clone(), &options)
        .unwrap()
        .unwrap();
    let _notify_engine = SyncPlugin::new(Arc::clone(&notify), SyncOptions::default())
        .attach(notify_store.clone(), &options)
        .unwrap()
        .unwrap();
    sleep(Duration::from_millis(100)).await;

    let mut state = StatePatch::new();
    state.insert("roomId".to_owned(), json!("r9"));
    main.emit_json(
        STATE_SYNC_TOPIC,
        &SyncMessage::new("call", state, "main", &["call".to_owned()]),
    )
    .unwrap();
    sleep(Duration::from_millis(10)).await;

    assert_eq!(call_store.get("roomId"), Some(json!("r9")));
    assert_eq!(notify_store.get("roomId"), Some(json!("")));
}

#[tokio::test(start_paused = true)]
async fn target_windows_restrict_recipients() {
    let bus = LocalBus::new();
    let main = open(&bus, "main");
    let notify = open(&bus, "notify");
    let call = open(&bus, "call");
    let mut notify_updates = notify.listen(STATE_SYNC_TOPIC);
    let mut call_updates = call.listen(STATE_SYNC_TOPIC);

    let store = Arc::new(JsonStore::new("chat", json!({"unread": 0})));
    let _engine = SyncPlugin::new(Arc::clone(&main), SyncOptions::default())
        .attach(
            store.clone(),
            &SyncOptions::with_paths(["unread"]).target_windows(["notify"]),
        )
        .unwrap()
        .unwrap();

    store.set("unread", json!(3)).unwrap();
    sleep(Duration::from_millis(100)).await;

    let received = drain_sync_messages(&mut notify_updates);
    assert_eq!(received.len(), 2);
    assert_eq!(received[1].state["unread"], json!(3));
    assert_eq!(received[1].to, Some(vec!["notify".to_owned()]));
    assert!(drain_sync_messages(&mut call_updates).is_empty());
}

#[tokio::test(start_paused = true)]
async fn empty_paths_leave_the_store_alone() {
    let bus = LocalBus::new();
    let main = open(&bus, "main");
    let mut updates = main.listen(STATE_SYNC_TOPIC);
    let store = Arc::new(JsonStore::new("user", json!({"name": "a"})));

    let plugin = SyncPlugin::new(main, SyncOptions::default());
    let engine = plugin.attach(store.clone(), &SyncOptions::default()).unwrap();

    assert!(engine.is_none());
    assert_eq!(store.listener_count(), 0);
    assert!(!plugin.is_attached("user"));
    assert!(updates.try_recv().is_none());
}

#[tokio::test(start_paused = true)]
async fn attaching_twice_is_rejected_until_detached() {
    let bus = LocalBus::new();
    let plugin = SyncPlugin::new(open(&bus, "main"), SyncOptions::default());
    let store = Arc::new(JsonStore::new("call", json!({"roomId": ""})));
    let options = SyncOptions::with_paths(["roomId"]);

    let engine = plugin.attach(store.clone(), &options).unwrap().unwrap();
    assert!(matches!(
        plugin.attach(store.clone(), &options),
        Err(SyncError::AlreadyAttached(id)) if id == "call"
    ));

    drop(engine);
    assert_eq!(store.listener_count(), 0);
    assert!(plugin.attach(store, &options).unwrap().is_some());
}

#[tokio::test(start_paused = true)]
async fn detached_engine_stops_publishing() {
    let bus = LocalBus::new();
    let main = open(&bus, "main");
    let mut updates = main.listen(STATE_SYNC_TOPIC);
    let store = Arc::new(JsonStore::new("call", json!({"roomId": ""})));

    let engine = SyncPlugin::new(Arc::clone(&main), SyncOptions::default())
        .attach(store.clone(), &SyncOptions::with_paths(["roomId"]))
        .unwrap()
        .unwrap();
    drain_sync_messages(&mut updates);

    store.set("roomId", json!("r1")).unwrap();
    drop(engine);
    sleep(Duration::from_millis(200)).await;
    assert!(drain_sync_messages(&mut updates).is_empty());
}

#[tokio::test(start_paused = true)]
async fn sync_now_skips_the_debounce() {
    let bus = LocalBus::new();
    let main = open(&bus, "main");
    let login = open(&bus, "login");
    let mut updates = main.listen(STATE_SYNC_TOPIC);
    let mut requests = main.listen(STATE_SYNC_REQUEST_TOPIC);

    let peer_store = Arc::new(JsonStore::new("call", json!({"roomId": "r1"})));
    let peer = SyncPlugin::new(Arc::clone(&main), SyncOptions::default())
        .attach(peer_store, &SyncOptions::with_paths(["roomId"]))
        .unwrap()
        .unwrap();
    drain_sync_messages(&mut updates);
    peer.sync_now();
    assert_eq!(drain_sync_messages(&mut updates).len(), 1);

    let follower_store = Arc::new(JsonStore::new("settings", json!({"theme": "light"})));
    let follower = SyncPlugin::new(Arc::clone(&login), SyncOptions::default())
        .attach(
            follower_store,
            &SyncOptions::with_paths(["theme"]).source_window("main"),
        )
        .unwrap()
        .unwrap();
    assert!(requests.try_recv().is_some());
    follower.sync_now();
    assert!(requests.try_recv().is_some());
}

#[tokio::test(start_paused = true)]
async fn plugin_defaults_apply_under_store_options() {
    let bus = LocalBus::new();
    let main = open(&bus, "main");
    let defaults = SyncOptions::default().debounce_ms(200);
    let plugin = SyncPlugin::new(main, defaults);
    let store = Arc::new(JsonStore::new("call", json!({"roomId": ""})));

    let engine = plugin
        .attach(store, &SyncOptions::with_paths(["roomId"]))
        .unwrap()
        .unwrap();
    assert_eq!(engine.config().debounce, Duration::from_millis(200));
    assert_eq!(engine.label(), "main");
}

#[test]
fn attach_outside_runtime_fails() {
    let bus = LocalBus::new();
    let plugin = SyncPlugin::new(open(&bus, "main"), SyncOptions::default());
    let store = Arc::new(JsonStore::new("call", json!({"roomId": ""})));

    let err = plugin
        .attach(store.clone(), &SyncOptions::with_paths(["roomId"]))
        .unwrap_err();
    assert!(matches!(err, SyncError::NoRuntime));
    assert_eq!(store.listener_count(), 0);
    assert!(!plugin.is_attached(store.id()));
}
