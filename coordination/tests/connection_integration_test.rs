//! Integration tests for the cluster connection state machine
//!
//! Drives `Connection` through an in-memory outbox the way a transport
//! would, validating handshake, identify, dispatch, close codes and the
//! interaction with the shared coordinator.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use coordination::{
    dispatch, CloseCode, CloseFrame, ClusterLink, Connection, ConnectionState, Coordinator,
    GatewayConfig, NotifyError, Outbound, Outbox, PanicNotifier, Request, SharedCoordinator,
    UNASSIGNED,
};
use serde_json::{json, Value};
use tokio::sync::mpsc::UnboundedReceiver;

const TOKEN: &str = "cluster-secret";

/// Notifier that records every call
#[derive(Default)]
struct Recorder {
    calls: Mutex<Vec<(String, String)>>,
}

impl Recorder {
    fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl PanicNotifier for Recorder {
    async fn notify(&self, identifier: &str, message: &str) -> Result<(), NotifyError> {
        self.calls
            .lock()
            .unwrap()
            .push((identifier.to_string(), message.to_string()));
        Ok(())
    }
}

struct Gateway {
    coordinator: SharedCoordinator,
    recorder: Arc<Recorder>,
    crash_dir: tempfile::TempDir,
}

fn gateway(clusters: usize) -> Gateway {
    let crash_dir = tempfile::tempdir().unwrap();
    let config = GatewayConfig {
        clusters,
        shards: 4,
        tokens: vec![TOKEN.to_string()],
        crash_dir: crash_dir.path().to_path_buf(),
        host_name: "gateway-test".to_string(),
        ..Default::default()
    };
    let recorder = Arc::new(Recorder::default());
    let coordinator = Coordinator::new(config, recorder.clone()).shared();
    Gateway {
        coordinator,
        recorder,
        crash_dir,
    }
}

struct Client {
    conn: Connection,
    rx: UnboundedReceiver<Outbound>,
}

impl Client {
    /// Accept a transport and run the handshake
    fn open(gateway: &Gateway) -> Self {
        let (outbox, rx) = Outbox::channel();
        let mut conn = Connection::new(gateway.coordinator.clone(), outbox, "127.0.0.1:40000");
        conn.on_open();
        Self { conn, rx }
    }

    async fn send(&mut self, payload: Value) {
        self.conn.on_message(&payload.to_string()).await;
    }

    async fn identify(&mut self) {
        let identifier = self.conn.identifier();
        self.send(json!({"op": 1, "data": {"authorization": TOKEN, "identifier": identifier}}))
            .await;
        assert_eq!(self.conn.state(), ConnectionState::Identified);
    }

    /// Drain everything queued so far
    fn drain(&mut self) -> Vec<Outbound> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    fn texts(&mut self) -> Vec<Value> {
        self.drain()
            .into_iter()
            .filter_map(|frame| match frame {
                Outbound::Text(text) => Some(serde_json::from_str(&text).unwrap()),
                Outbound::Close(_) => None,
            })
            .collect()
    }

    fn closed_with(&mut self) -> Option<CloseFrame> {
        self.drain().into_iter().find_map(|frame| match frame {
            Outbound::Close(close) => Some(close),
            Outbound::Text(_) => None,
        })
    }
}

/// Let spawned notification tasks run
async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

/// Test: Handshake assigns an identifier and sends hello as frame 1
#[tokio::test]
async fn test_handshake_sends_hello() {
    let gw = gateway(3);
    let mut client = Client::open(&gw);

    assert_eq!(client.conn.identifier(), "A");
    assert_eq!(client.conn.state(), ConnectionState::Connected);

    let frames = client.texts();
    assert_eq!(frames.len(), 1);
    let hello = &frames[0];
    assert_eq!(hello["op"], json!(0));
    assert_eq!(hello["seq"], json!(1));
    assert_eq!(hello["data"]["id"], json!(client.conn.session_id().unwrap()));
    assert_eq!(hello["data"]["host"], json!("gateway-test"));
    assert_eq!(hello["data"]["heartbeat"], json!(30));
    assert_eq!(hello["data"]["cluster"], json!("A"));
    assert_eq!(hello["data"]["total"], json!(3));
    assert_eq!(hello["data"]["shard"], json!(4));
}

/// Test: Successful identify registers the cluster and is acked
#[tokio::test]
async fn test_identify_success() {
    let gw = gateway(2);
    let mut client = Client::open(&gw);
    client.drain();

    client.identify().await;

    let frames = client.texts();
    assert_eq!(frames, vec![json!({"op": 4, "seq": 2, "data": {"received": 1}})]);
    let members = gw.coordinator.members();
    assert_eq!(members.len(), 1);
    assert!(members[0].identified);
    assert_eq!(members[0].identifier, 'A');
}

/// Test: A bad token closes with the auth-failure code and does not identify
#[tokio::test]
async fn test_identify_bad_token() {
    let gw = gateway(2);
    let mut client = Client::open(&gw);

    client
        .send(json!({"op": 1, "data": {"authorization": "bad", "identifier": "A"}}))
        .await;

    assert_eq!(client.closed_with().unwrap().code, CloseCode::AuthFailed);
    assert_eq!(client.conn.state(), ConnectionState::Closed);
    assert!(!gw.coordinator.members()[0].identified);
}

/// Test: Echoing the wrong identifier is an auth failure
#[tokio::test]
async fn test_identify_wrong_identifier() {
    let gw = gateway(2);
    let mut client = Client::open(&gw);

    client
        .send(json!({"op": 1, "data": {"authorization": TOKEN, "identifier": "B"}}))
        .await;

    let close = client.closed_with().unwrap();
    assert_eq!(close.code, CloseCode::AuthFailed);
    assert_eq!(close.reason, "Identifier does not match");
}

/// Test: Identifying twice is not acceptable
#[tokio::test]
async fn test_second_identify_rejected() {
    let gw = gateway(2);
    let mut client = Client::open(&gw);
    client.identify().await;

    client
        .send(json!({"op": 1, "data": {"authorization": TOKEN, "identifier": "A"}}))
        .await;

    assert_eq!(client.closed_with().unwrap().code, CloseCode::InvalidOpcode);
}

/// Test: Any opcode other than identify before identification is rejected
#[tokio::test]
async fn test_unauthenticated_opcodes_rejected() {
    for payload in [
        json!({"op": 2, "data": {}}),
        json!({"op": 3, "data": {"intent": "x", "content": {}}}),
        json!({"op": 5, "data": {"scope": "s", "content": "h", "req": 1}}),
        json!({"op": 7, "data": {"error": "boom"}}),
    ] {
        let gw = gateway(1);
        let mut client = Client::open(&gw);
        client.send(payload.clone()).await;
        assert_eq!(
            client.closed_with().unwrap().code,
            CloseCode::NotAuthenticated,
            "{payload}"
        );
    }
}

/// Test: Malformed payloads close with their specific codes
#[tokio::test]
async fn test_malformed_payloads() {
    let cases = [
        (r#"{"data": {}}"#, CloseCode::MissingField),
        (r#"{"op": 99, "data": {}}"#, CloseCode::InvalidOpcode),
        (r#"{"op": "two", "data": {}}"#, CloseCode::BadOpcode),
        (r#"{"op": 2}"#, CloseCode::MissingField),
        ("not json at all", CloseCode::MissingField),
    ];
    for (raw, code) in cases {
        let gw = gateway(1);
        let mut client = Client::open(&gw);
        client.identify().await;
        client.drain();

        client.conn.on_message(raw).await;
        assert_eq!(client.closed_with().unwrap().code, code, "{raw}");
        assert_eq!(client.conn.state(), ConnectionState::Closed);
    }
}

/// Test: Missing broadcast fields close with the missing-field code
#[tokio::test]
async fn test_broadcast_missing_content() {
    let gw = gateway(1);
    let mut client = Client::open(&gw);
    client.identify().await;

    client.send(json!({"op": 3, "data": {"intent": "x"}})).await;

    let close = client.closed_with().unwrap();
    assert_eq!(close.code, CloseCode::MissingField);
    assert_eq!(close.reason, "No content provided");
}

/// Test: Dedupe answers false then true, echoing the request id
#[tokio::test]
async fn test_dedupe_round_trip() {
    let gw = gateway(2);
    let mut client = Client::open(&gw);
    client.identify().await;
    client.drain();

    let request = json!({"op": 5, "data": {"scope": "s", "content": "h1", "req": 1}});
    client.send(request.clone()).await;
    client.send(request).await;

    let frames = client.texts();
    let data: Vec<&Value> = frames.iter().map(|f| &f["data"]).collect();
    assert_eq!(
        data,
        vec![
            &json!({"duplicate": false, "req": 1}),
            &json!({"received": 5}),
            &json!({"duplicate": true, "req": 1}),
            &json!({"received": 5}),
        ]
    );
    assert_eq!(frames[0]["op"], json!(5));
    assert_eq!(frames[1]["op"], json!(4));
}

/// Test: Dedupe state is shared between clusters
#[tokio::test]
async fn test_dedupe_across_clusters() {
    let gw = gateway(2);
    let mut a = Client::open(&gw);
    let mut b = Client::open(&gw);
    a.identify().await;
    b.identify().await;
    a.drain();
    b.drain();

    a.send(json!({"op": 5, "data": {"scope": "welcome", "content": "m1", "req": "a-1"}}))
        .await;
    b.send(json!({"op": 5, "data": {"scope": "welcome", "content": "m1", "req": "b-1"}}))
        .await;

    assert_eq!(a.texts()[0]["data"], json!({"duplicate": false, "req": "a-1"}));
    assert_eq!(b.texts()[0]["data"], json!({"duplicate": true, "req": "b-1"}));
}

/// Test: Numeric dedupe content is accepted and kept apart from its string form
#[tokio::test]
async fn test_dedupe_numeric_content() {
    let gw = gateway(1);
    let mut client = Client::open(&gw);
    client.identify().await;
    client.drain();

    client
        .send(json!({"op": 5, "data": {"scope": "s", "content": 7, "req": 1}}))
        .await;
    client
        .send(json!({"op": 5, "data": {"scope": "s", "content": "7", "req": 2}}))
        .await;
    client
        .send(json!({"op": 5, "data": {"scope": "s", "content": 7, "req": 3}}))
        .await;

    let replies: Vec<Value> = client
        .texts()
        .into_iter()
        .filter(|f| f["op"] == json!(5))
        .map(|f| f["data"].clone())
        .collect();
    assert_eq!(
        replies,
        vec![
            json!({"duplicate": false, "req": 1}),
            json!({"duplicate": false, "req": 2}),
            json!({"duplicate": true, "req": 3}),
        ]
    );
    assert_eq!(client.conn.state(), ConnectionState::Identified);
}

/// Test: Identify on a link closed underneath it never registers a broadcast target
#[tokio::test]
async fn test_identify_on_closed_link_not_registered() {
    let gw = gateway(2);
    let (outbox, _rx) = Outbox::channel();
    let identifier = gw.coordinator.assign_identifier("s1", &outbox).unwrap();
    let link = Arc::new(ClusterLink::new(identifier, "s1", outbox));
    link.close(CloseFrame::new(CloseCode::HeartbeatTimeout, "No heartbeat received"));

    let request = Request::Identify {
        authorization: TOKEN.to_string(),
        identifier: identifier.to_string(),
    };
    assert!(dispatch(&gw.coordinator, &link, request).await.is_ok());

    assert_eq!(link.state(), ConnectionState::Closed);
    assert!(!gw.coordinator.members()[0].identified);
}

/// Test: Broadcast reaches every other identified cluster, never the sender
#[tokio::test]
async fn test_broadcast_fan_out() {
    let gw = gateway(3);
    let mut a = Client::open(&gw);
    let mut b = Client::open(&gw);
    let mut c = Client::open(&gw);
    for client in [&mut a, &mut b, &mut c] {
        client.identify().await;
        client.drain();
    }

    a.send(json!({"op": 3, "data": {"intent": "reload_config", "content": {"key": "prefix"}}}))
        .await;

    assert_eq!(a.texts(), vec![json!({"op": 4, "seq": 3, "data": {"received": 3}})]);
    for peer in [&mut b, &mut c] {
        let frames = peer.texts();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["op"], json!(6));
        assert_eq!(
            frames[0]["data"],
            json!({"intent": "RELOAD_CONFIG", "content": {"key": "prefix"}})
        );
    }
}

/// Test: The diagnostic event opcode is acked with no other effect
#[tokio::test]
async fn test_event_passthrough() {
    let gw = gateway(2);
    let mut a = Client::open(&gw);
    let mut b = Client::open(&gw);
    a.identify().await;
    b.identify().await;
    a.drain();
    b.drain();

    a.send(json!({"op": 6, "data": {"intent": "debug"}})).await;

    assert_eq!(a.texts()[0]["data"], json!({"received": 6}));
    assert!(b.texts().is_empty());
    assert_eq!(a.conn.state(), ConnectionState::Identified);
}

/// Test: A panic report writes a crash log, closes with 4999 and notifies
#[tokio::test]
async fn test_panic_report() {
    let gw = gateway(2);
    let mut client = Client::open(&gw);
    client.identify().await;
    client.drain();

    client
        .send(json!({"op": 7, "data": {"error": "KeyError", "traceback": "Traceback..."}}))
        .await;

    let frames = client.drain();
    assert_eq!(
        frames,
        vec![Outbound::Close(CloseFrame::new(
            CloseCode::ClientException,
            "Client exception thrown"
        ))]
    );

    let reports: Vec<_> = std::fs::read_dir(gw.crash_dir.path())
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect();
    assert_eq!(reports.len(), 1);
    assert!(reports[0]
        .file_name()
        .unwrap()
        .to_string_lossy()
        .starts_with("Cluster A crash at "));
    assert_eq!(
        std::fs::read_to_string(&reports[0]).unwrap(),
        "KeyError\nTraceback..."
    );

    settle().await;
    assert_eq!(
        gw.recorder.calls(),
        vec![("A".to_string(), "Cluster A Has crashed KeyError".to_string())]
    );

    // Teardown after 4999 notifies again: the code is not an expected one
    client.conn.on_close(true, None);
    settle().await;
    assert_eq!(gw.recorder.calls().len(), 2);
    assert!(gw.coordinator.is_empty());
}

/// Test: The pool refuses connections beyond the cluster count
#[tokio::test]
async fn test_pool_full_refusal() {
    let gw = gateway(2);
    let _a = Client::open(&gw);
    let _b = Client::open(&gw);
    let mut c = Client::open(&gw);

    assert_eq!(c.conn.identifier(), UNASSIGNED);
    assert_eq!(c.conn.state(), ConnectionState::Closed);
    assert_eq!(
        c.drain(),
        vec![Outbound::Close(CloseFrame::new(CloseCode::PoolFull, "Too many clusters"))]
    );
    assert_eq!(gw.coordinator.len(), 2);

    // Messages on a refused connection are ignored
    c.send(json!({"op": 1, "data": {"authorization": TOKEN, "identifier": "A"}}))
        .await;
    assert!(c.drain().is_empty());

    // A refused teardown is expected and does not notify
    c.conn.on_close(true, None);
    settle().await;
    assert!(gw.recorder.calls().is_empty());
}

/// Test: Identifiers are released on close and reused first-available
#[tokio::test]
async fn test_identifier_reuse_after_close() {
    let gw = gateway(3);
    let mut a = Client::open(&gw);
    let b = Client::open(&gw);
    assert_eq!(b.conn.identifier(), "B");

    a.conn
        .on_close(true, Some(CloseFrame::new(CloseCode::Normal, "shutdown")));
    let c = Client::open(&gw);
    assert_eq!(c.conn.identifier(), "A");

    let ids: Vec<char> = gw.coordinator.members().iter().map(|m| m.identifier).collect();
    assert_eq!(ids.len(), 2);
    assert!(ids.contains(&'A') && ids.contains(&'B'));
}

/// Test: Identifiers stay unique under any open/close sequence
#[tokio::test]
async fn test_identifiers_unique_under_churn() {
    let gw = gateway(4);
    let mut live: Vec<Client> = Vec::new();
    for round in 0..20 {
        if round % 3 == 2 && !live.is_empty() {
            let mut gone = live.remove(round % live.len());
            gone.conn.on_close(true, Some(CloseFrame::new(CloseCode::Normal, "")));
        }
        let client = Client::open(&gw);
        if client.conn.state() != ConnectionState::Closed {
            live.push(client);
        }

        let mut ids: Vec<char> = gw.coordinator.members().iter().map(|m| m.identifier).collect();
        let total = ids.len();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), total, "duplicate identifier in round {round}");
        assert!(total <= 4);
        assert!(ids.iter().all(|id| ('A'..='D').contains(id)));
    }
}

/// Test: Clean normal closure does not notify, an unclean drop does
#[tokio::test]
async fn test_close_notifications() {
    let gw = gateway(2);
    let mut a = Client::open(&gw);
    let mut b = Client::open(&gw);
    a.identify().await;
    b.identify().await;

    a.conn
        .on_close(true, Some(CloseFrame::new(CloseCode::Normal, "bye")));
    settle().await;
    assert!(gw.recorder.calls().is_empty());

    b.conn.on_close(false, None);
    settle().await;
    let calls = gw.recorder.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, "B");
    assert!(calls[0].1.contains("1006"));

    // Teardown runs once
    b.conn.on_close(false, None);
    settle().await;
    assert_eq!(gw.recorder.calls().len(), 1);
    assert!(gw.coordinator.is_empty());
}

/// Test: A connection that stops acking is closed with the heartbeat code
#[tokio::test(start_paused = true)]
async fn test_heartbeat_timeout_closes_connection() {
    let gw = gateway(2);
    let mut client = Client::open(&gw);
    client.identify().await;
    client.drain();

    tokio::time::sleep(Duration::from_secs(34)).await;
    assert_eq!(client.conn.state(), ConnectionState::Identified);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(
        client.closed_with(),
        Some(CloseFrame::new(CloseCode::HeartbeatTimeout, "No heartbeat received"))
    );

    client.conn.on_close(true, None);
    settle().await;
    assert_eq!(gw.recorder.calls().len(), 1);
    assert!(gw.coordinator.is_empty());
}

/// Test: A connection that acks every interval is never closed
#[tokio::test(start_paused = true)]
async fn test_heartbeat_acks_keep_connection_open() {
    let gw = gateway(2);
    let mut client = Client::open(&gw);
    client.identify().await;

    for _ in 0..6 {
        tokio::time::sleep(Duration::from_secs(30)).await;
        client.send(json!({"op": 2, "data": {}})).await;
    }

    assert_eq!(client.conn.state(), ConnectionState::Identified);
    assert!(client.closed_with().is_none());
}

/// Test: Sequence numbers increase by one per frame sent
#[tokio::test]
async fn test_sequence_is_monotonic() {
    let gw = gateway(1);
    let mut client = Client::open(&gw);
    client.identify().await;
    for _ in 0..3 {
        client.send(json!({"op": 2, "data": {}})).await;
    }

    let seqs: Vec<u64> = client
        .texts()
        .iter()
        .map(|f| f["seq"].as_u64().unwrap())
        .collect();
    assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
}
