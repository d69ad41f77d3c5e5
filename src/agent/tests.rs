//! Forwarding agent tests against a scripted leader socket

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use crate::checkpoint::{CheckpointStore, Position};
use crate::codec::{self, Command, Frame, FrameAssembler, AGENT_ASSEMBLY_LIMIT};
use crate::sink::{EventSink, SinkSet};

use super::{AgentStatus, ForwardingAgent, LeaderResolver};

// ============================================================
// Helpers
// ============================================================

#[derive(Default)]
struct CaptureSink {
    events: Mutex<Vec<(String, Vec<u8>)>>,
}

impl CaptureSink {
    fn events(&self) -> Vec<(String, Vec<u8>)> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl EventSink for CaptureSink {
    fn name(&self) -> &str {
        "capture"
    }

    async fn send_all(&self, table: &str, payload: &[u8]) -> bool {
        self.events.lock().push((table.to_string(), payload.to_vec()));
        true
    }
}

struct FixedResolver {
    addr: Mutex<Option<(String, u16)>>,
}

#[async_trait]
impl LeaderResolver for FixedResolver {
    async fn leader_addr(&self) -> Option<(String, u16)> {
        self.addr.lock().clone()
    }
}

struct Harness {
    agent: Arc<ForwardingAgent>,
    sink: Arc<CaptureSink>,
    checkpoint: Arc<CheckpointStore>,
    _dir: TempDir,
}

fn harness(leader: Option<(String, u16)>, own_addr: Option<(String, u16)>) -> Harness {
    let dir = TempDir::new().expect("tempdir");
    let checkpoint = Arc::new(
        CheckpointStore::open(dir.path().join("position.chk")).expect("checkpoint"),
    );
    let sinks = Arc::new(SinkSet::new());
    let sink = Arc::new(CaptureSink::default());
    sinks.register(sink.clone());
    let resolver = Arc::new(FixedResolver {
        addr: Mutex::new(leader),
    });
    let agent = Arc::new(ForwardingAgent::new(
        sinks,
        checkpoint.clone(),
        resolver,
        own_addr,
    ));
    Harness {
        agent,
        sink,
        checkpoint,
        _dir: dir,
    }
}

async fn read_frame(stream: &mut TcpStream, assembler: &mut FrameAssembler) -> Frame {
    let mut buf = BytesMut::with_capacity(4096);
    loop {
        let n = timeout(Duration::from_secs(5), stream.read_buf(&mut buf))
            .await
            .expect("read timed out")
            .expect("read");
        assert!(n > 0, "connection closed while awaiting a frame");
        let frames = assembler.feed(&buf);
        buf.clear();
        if let Some(frame) = frames.into_iter().next() {
            return frame;
        }
    }
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition not reached in time");
}

const EVENT_JSON: &[u8] = br#"{"database":"shop","event":{"data":{"id":7},"event_type":"insert","time":1700000000},"event_index":3,"table":"orders"}"#;

// ============================================================
// Relay behavior
// ============================================================

#[tokio::test]
async fn test_agent_registers_and_relays_events_and_positions() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();
    let harness = harness(Some(("127.0.0.1".to_string(), port)), None);

    assert!(harness.agent.start());

    let (mut stream, _) = timeout(Duration::from_secs(5), listener.accept())
        .await
        .expect("accept timed out")
        .expect("accept");
    let mut assembler = FrameAssembler::new(AGENT_ASSEMBLY_LIMIT);

    let hello = read_frame(&mut stream, &mut assembler).await;
    assert_eq!(hello.kind(), Some(Command::Agent));
    assert!(hello.payload.is_empty());
    stream
        .write_all(&codec::pack_str(Command::Agent, "ok"))
        .await
        .expect("handshake reply");

    wait_for(|| harness.agent.status() == AgentStatus::Connected).await;

    stream
        .write_all(&codec::pack(Command::Event, EVENT_JSON))
        .await
        .expect("event write");
    wait_for(|| harness.sink.events().len() == 1).await;
    let events = harness.sink.events();
    assert_eq!(events[0].0, "shop.orders");
    assert_eq!(events[0].1, EVENT_JSON);

    let position = Position::new("binlog.000007", 98, 52);
    stream
        .write_all(&codec::pack(Command::Pos, &position.encode()))
        .await
        .expect("position write");
    wait_for(|| harness.checkpoint.load() == position).await;

    harness.agent.close();
    wait_for(|| harness.agent.status() == AgentStatus::Offline).await;
}

#[tokio::test]
async fn test_agent_drops_undecodable_events_but_keeps_the_connection() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();
    let harness = harness(Some(("127.0.0.1".to_string(), port)), None);
    assert!(harness.agent.start());

    let (mut stream, _) = timeout(Duration::from_secs(5), listener.accept())
        .await
        .expect("accept timed out")
        .expect("accept");
    let mut assembler = FrameAssembler::new(AGENT_ASSEMBLY_LIMIT);
    let _ = read_frame(&mut stream, &mut assembler).await;

    stream
        .write_all(&codec::pack(Command::Event, b"not json"))
        .await
        .expect("garbage write");
    stream
        .write_all(&codec::pack(Command::Event, EVENT_JSON))
        .await
        .expect("event write");

    wait_for(|| harness.sink.events().len() == 1).await;
    assert_eq!(harness.sink.events()[0].0, "shop.orders");

    harness.agent.close();
}

// ============================================================
// Leader resolution
// ============================================================

#[tokio::test]
async fn test_agent_never_mirrors_its_own_address() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();
    let own = ("127.0.0.1".to_string(), port);
    let harness = harness(Some(own.clone()), Some(own));

    assert!(harness.agent.start());
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(harness.agent.status(), AgentStatus::Disconnected);
    assert!(
        timeout(Duration::from_millis(300), listener.accept())
            .await
            .is_err(),
        "the agent dialed its own broker"
    );
    harness.agent.close();
}

// ============================================================
// Lifecycle
// ============================================================

#[tokio::test]
async fn test_start_and_close_transitions() {
    let harness = harness(None, None);

    assert_eq!(harness.agent.status(), AgentStatus::Offline);
    assert!(harness.agent.start());
    assert!(!harness.agent.start(), "doubled start must be rejected");
    assert_eq!(harness.agent.status(), AgentStatus::Disconnected);

    harness.agent.close();
    assert_eq!(harness.agent.status(), AgentStatus::Offline);

    assert!(harness.agent.start(), "a closed agent must be restartable");
    harness.agent.close();
}
