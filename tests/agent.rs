//! Leader-to-follower relay tests
//!
//! These tests run a real broker as the leader and a forwarding agent as
//! the follower side, and verify that events and positions flow from the
//! leader's sinks into the follower's, including across a leader change.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::TempDir;

use rowcast::checkpoint::{CheckpointStore, Position};
use rowcast::config::{BrokerConfig, GroupConfig, GroupMode};
use rowcast::sink::{EventSink, SinkSet};
use rowcast::{AgentStatus, Broker, ForwardingAgent, LeaderResolver};

// Atomic port counter to avoid port conflicts between tests
static PORT_COUNTER: AtomicU16 = AtomicU16::new(19400);

fn next_port() -> u16 {
    PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

const EVENT_JSON: &[u8] = br#"{"database":"shop","event":{"data":{"id":9},"event_type":"delete","time":1700000100},"event_index":4,"table":"carts"}"#;

async fn start_leader(port: u16) -> Arc<Broker> {
    let config = BrokerConfig {
        enable: true,
        listen: "127.0.0.1".to_string(),
        port,
        send_queue_capacity: 64,
        groups: vec![GroupConfig {
            name: "workers".to_string(),
            mode: GroupMode::Broadcast,
            filter: vec!["shop\\.orders".to_string()],
        }],
    };
    let broker = Arc::new(Broker::new(&config).expect("broker config"));
    let accept = broker.clone();
    tokio::spawn(async move {
        let _ = accept.run().await;
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    broker
}

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

struct SwitchableResolver {
    addr: Mutex<Option<(String, u16)>>,
}

impl SwitchableResolver {
    fn new(addr: Option<(String, u16)>) -> Arc<Self> {
        Arc::new(Self {
            addr: Mutex::new(addr),
        })
    }

    fn set(&self, addr: Option<(String, u16)>) {
        *self.addr.lock() = addr;
    }
}

#[async_trait]
impl LeaderResolver for SwitchableResolver {
    async fn leader_addr(&self) -> Option<(String, u16)> {
        self.addr.lock().clone()
    }
}

struct Follower {
    agent: Arc<ForwardingAgent>,
    sink: Arc<CaptureSink>,
    checkpoint: Arc<CheckpointStore>,
    resolver: Arc<SwitchableResolver>,
    _dir: TempDir,
}

fn follower(leader_port: u16) -> Follower {
    let dir = TempDir::new().expect("tempdir");
    let checkpoint = Arc::new(
        CheckpointStore::open(dir.path().join("position.chk")).expect("checkpoint"),
    );
    let sinks = Arc::new(SinkSet::new());
    let sink = Arc::new(CaptureSink::default());
    sinks.register(sink.clone());
    let resolver = SwitchableResolver::new(Some(("127.0.0.1".to_string(), leader_port)));
    let agent = Arc::new(ForwardingAgent::new(
        sinks,
        checkpoint.clone(),
        resolver.clone(),
        None,
    ));
    Follower {
        agent,
        sink,
        checkpoint,
        resolver,
        _dir: dir,
    }
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn test_agent_mirrors_leader_events_into_local_sinks() {
    let port = next_port();
    let leader = start_leader(port).await;
    let follower = follower(port);

    assert!(follower.agent.start());
    wait_for(|| follower.agent.status() == AgentStatus::Connected).await;
    wait_for(|| leader.subscriber_count() == 1).await;

    // The leader's group filter would reject this table; the mirror link
    // must carry it regardless, and the agent re-routes by the payload.
    assert!(leader.send_all("shop.carts", EVENT_JSON).await);
    wait_for(|| follower.sink.events().len() == 1).await;
    let events = follower.sink.events();
    assert_eq!(events[0].0, "shop.carts");
    assert_eq!(events[0].1, EVENT_JSON);

    follower.agent.close();
}

#[tokio::test]
async fn test_leader_position_broadcast_updates_follower_checkpoint() {
    let port = next_port();
    let leader = start_leader(port).await;
    let follower = follower(port);

    assert!(follower.agent.start());
    wait_for(|| leader.subscriber_count() == 1).await;

    let position = Position::new("binlog.000019", 777, 31);
    assert!(leader.send_pos(&position.encode()).await);
    wait_for(|| follower.checkpoint.load() == position).await;

    follower.agent.close();
}

#[tokio::test]
async fn test_agent_follows_a_leader_change() {
    let first_port = next_port();
    let second_port = next_port();
    let first_leader = start_leader(first_port).await;
    let follower = follower(first_port);

    assert!(follower.agent.start());
    wait_for(|| first_leader.subscriber_count() == 1).await;

    // The old leader goes away; the agent must re-resolve and re-register
    // with its successor within the reconnect backoff.
    let second_leader = start_leader(second_port).await;
    follower
        .resolver
        .set(Some(("127.0.0.1".to_string(), second_port)));
    first_leader.shutdown();

    wait_for(|| second_leader.subscriber_count() == 1).await;

    assert!(second_leader.send_all("shop.carts", EVENT_JSON).await);
    wait_for(|| !follower.sink.events().is_empty()).await;

    follower.agent.close();
}
