//! Unit tests for request correlation and the router tasks

use super::*;
use serde_json::json;
use tether_proto::BackendKind;
use tokio::io::{duplex, DuplexStream, ReadHalf, WriteHalf};

fn greeting() -> Greeting {
    Greeting {
        version: "2.0".into(),
        relay_version: "0.1.0".into(),
        pid: 99,
        platform: "linux".into(),
        arch: "x86_64".into(),
        pty_available: false,
        shell: "/bin/sh".into(),
        home: None,
    }
}

fn frame(id: &MessageId, event: &SessionEvent) -> Message {
    Message::response(Some(id.clone()), serde_json::to_value(event).unwrap())
}

/// Relay end of an in-memory connection, scripted by each test
struct FakeRelay {
    reader: ReadHalf<DuplexStream>,
    writer: WriteHalf<DuplexStream>,
    codec: MessageCodec,
}

impl FakeRelay {
    fn new() -> (DuplexStream, Self) {
        let (client, relay) = duplex(64 * 1024);
        let (reader, writer) = tokio::io::split(relay);
        (
            client,
            Self {
                reader,
                writer,
                codec: MessageCodec::new(),
            },
        )
    }

    async fn send(&mut self, message: Message) {
        self.codec.write_message(&mut self.writer, &message).await.unwrap();
    }

    async fn greet(&mut self) {
        let greeting = serde_json::to_value(greeting()).unwrap();
        self.send(Message::response(Some(MessageId::greeting()), greeting)).await;
    }

    async fn recv(&mut self) -> Message {
        self.codec.read_message(&mut self.reader).await.unwrap().unwrap()
    }
}

async fn connected() -> (Router, FakeRelay) {
    let (client, mut relay) = FakeRelay::new();
    let start = tokio::spawn(Router::start(client, Duration::from_secs(30), Duration::from_secs(5)));
    relay.greet().await;
    let (router, greeting) = start.await.unwrap().unwrap();
    assert_eq!(greeting.pid, 99);
    (router, relay)
}

#[test]
fn test_id_spaces_are_disjoint() {
    let mut table = PendingTable::new();
    let (a, _a) = table.register_single().unwrap();
    let (b, _b) = table.register_single().unwrap();
    let (s, _s) = table.register_stream().unwrap();
    let (t, _t) = table.register_stream().unwrap();

    assert_eq!(a, MessageId::Number(1));
    assert_eq!(b, MessageId::Number(2));
    assert_eq!(s, MessageId::String("term-1".into()));
    assert_eq!(t, MessageId::String("term-2".into()));
    assert_eq!(table.len(), 4);
}

#[tokio::test]
async fn test_single_resolves_exactly_once() {
    let mut table = PendingTable::new();
    let (id, rx) = table.register_single().unwrap();

    let response = Message::response(Some(id.clone()), json!({"content": "hi"}));
    assert_eq!(table.dispatch(response.clone()), Dispatch::Resolved);
    assert!(table.is_empty());
    assert_eq!(rx.await.unwrap().unwrap(), json!({"content": "hi"}));

    // a duplicate finds nothing
    assert_eq!(table.dispatch(response), Dispatch::Unmatched);
}

#[tokio::test]
async fn test_single_error_reply() {
    let mut table = PendingTable::new();
    let (id, rx) = table.register_single().unwrap();

    let details = ErrorDetails::new(ErrorCode::NotFound, "/nope: not found");
    table.dispatch(Message::error(Some(id), details.clone()));

    assert_eq!(rx.await.unwrap().unwrap_err(), details);
}

#[tokio::test]
async fn test_stream_frames_until_exit() {
    let mut table = PendingTable::new();
    let (key, mut rx) = table.register_stream().unwrap();

    let ready = SessionEvent::Ready {
        pid: Some(10),
        shell: "/bin/sh".into(),
        backend: BackendKind::Spawn,
    };
    let data = SessionEvent::Data { data: "hello\r\n".into() };
    let exit = SessionEvent::Exit {
        exit_code: Some(0),
        signal: None,
    };

    assert_eq!(table.dispatch(frame(&key, &ready)), Dispatch::Streamed);
    assert_eq!(table.dispatch(frame(&key, &data)), Dispatch::Streamed);
    assert!(table.contains(&key));
    assert_eq!(table.dispatch(frame(&key, &exit)), Dispatch::Finished);
    assert!(!table.contains(&key));

    // nothing for the key after exit
    assert_eq!(table.dispatch(frame(&key, &data)), Dispatch::Unmatched);

    assert_eq!(rx.recv().await, Some(StreamFrame::Event(ready)));
    assert_eq!(rx.recv().await, Some(StreamFrame::Event(data)));
    assert_eq!(rx.recv().await, Some(StreamFrame::Event(exit)));
    assert_eq!(rx.recv().await, None);
}

#[tokio::test]
async fn test_stream_error_ends_stream() {
    let mut table = PendingTable::new();
    let (key, mut rx) = table.register_stream().unwrap();

    let details = ErrorDetails::new(ErrorCode::SessionCreate, "no backend");
    assert_eq!(table.dispatch(Message::error(Some(key), details.clone())), Dispatch::Finished);
    assert_eq!(rx.recv().await, Some(StreamFrame::Failed(details)));
    assert!(table.is_empty());
}

#[tokio::test]
async fn test_malformed_frame_keeps_stream() {
    let mut table = PendingTable::new();
    let (key, _rx) = table.register_stream().unwrap();

    let odd = Message::response(Some(key.clone()), json!({"type": "bogus"}));
    assert_eq!(table.dispatch(odd), Dispatch::Unmatched);
    assert!(table.contains(&key));
}

#[tokio::test]
async fn test_fail_all_closes_table() {
    let mut table = PendingTable::new();
    let (_, single) = table.register_single().unwrap();
    let (_, mut stream) = table.register_stream().unwrap();

    assert_eq!(table.fail_all(closed_error("bye")), 2);
    assert!(table.is_closed());
    assert_eq!(single.await.unwrap().unwrap_err().code, ErrorCode::Closed);
    assert!(matches!(stream.recv().await, Some(StreamFrame::Failed(_))));
    assert!(matches!(table.register_single(), Err(TetherError::Closed)));
}

#[test]
fn test_expire_and_reject() {
    let mut table = PendingTable::new();
    let (a, _a) = table.register_single().unwrap();
    let (b, mut b_rx) = table.register_single().unwrap();

    assert!(table.expire(&a));
    assert!(!table.expire(&a));
    assert!(table.reject(&b, ErrorDetails::new(ErrorCode::InternalError, "too big")));
    assert!(b_rx.try_recv().unwrap().is_err());
    assert!(table.is_empty());
}

#[tokio::test]
async fn test_call_round_trip() {
    let (router, mut relay) = connected().await;

    let call = {
        let router = router.clone();
        tokio::spawn(async move { router.call(Method::ReadFile, json!({"path": "/etc/hostname"})).await })
    };

    let request = relay.recv().await;
    assert_eq!(request.method.as_deref(), Some("fs.readFile"));
    assert_eq!(request.id, Some(MessageId::Number(1)));
    relay
        .send(Message::response(request.id, json!({"content": "box\n"})))
        .await;

    assert_eq!(call.await.unwrap().unwrap(), json!({"content": "box\n"}));
    assert_eq!(router.pending_count().await, 0);
}

#[tokio::test]
async fn test_notification_has_null_id() {
    let (router, mut relay) = connected().await;

    router
        .notify(Method::TerminalInput, json!({"sessionId": "term-1", "data": "ls\n"}))
        .unwrap();

    let message = relay.recv().await;
    assert_eq!(message.method.as_deref(), Some("terminal.input"));
    assert_eq!(message.id, None);
}

#[tokio::test(start_paused = true)]
async fn test_call_times_out_once() {
    let (router, mut relay) = connected().await;

    let call = {
        let router = router.clone();
        tokio::spawn(async move { router.call(Method::Stat, json!({"path": "/slow"})).await })
    };
    let request = relay.recv().await;

    let err = call.await.unwrap().unwrap_err();
    assert!(matches!(err, TetherError::Timeout { duration } if duration == Duration::from_secs(30)));
    assert_eq!(router.pending_count().await, 0);

    // the late answer is dropped on the floor
    relay.send(Message::response(request.id, json!({}))).await;
    tokio::task::yield_now().await;
    assert_eq!(router.pending_count().await, 0);
    assert!(!router.is_closed());
}

#[tokio::test(start_paused = true)]
async fn test_missing_greeting_fails_handshake() {
    let (client, _relay) = FakeRelay::new();

    let result = Router::start(client, Duration::from_secs(30), Duration::from_secs(5)).await;

    assert!(matches!(result, Err(TetherError::Handshake(_))));
}

#[tokio::test]
async fn test_close_fails_outstanding_calls() {
    let (router, mut relay) = connected().await;

    let call = {
        let router = router.clone();
        tokio::spawn(async move { router.call(Method::SystemInfo, json!({})).await })
    };
    relay.recv().await;

    router.close().await;

    assert!(matches!(call.await.unwrap(), Err(TetherError::Closed)));
    assert!(router.is_closed());
    assert!(matches!(router.call(Method::SystemInfo, json!({})).await, Err(TetherError::Closed)));
}

#[tokio::test]
async fn test_relay_eof_fails_streams() {
    let (router, mut relay) = connected().await;

    let (key, mut frames) = router.open_stream(Method::TerminalCreate, json!({})).await.unwrap();
    assert_eq!(key, MessageId::String("term-1".into()));
    assert_eq!(relay.recv().await.id, Some(key));

    drop(relay);

    match frames.recv().await {
        Some(StreamFrame::Failed(details)) => assert_eq!(details.code, ErrorCode::Closed),
        other => panic!("unexpected frame: {:?}", other),
    }
}
