//! End-to-end replication tests over real WebSocket links.
//!
//! Each test spins up in-process peers on ephemeral localhost ports and
//! polls the stores until they converge; nothing here depends on message
//! ordering across links.

use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::time::{sleep, timeout, Instant};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use pluresdb_core::{NodeRecord, Store, StoreOptions};
use pluresdb_sync::{MeshMessage, MeshReplicator, MeshServer};

const CONVERGENCE_TIMEOUT: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(25);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

async fn peer(peer_id: &str) -> (Store, MeshReplicator) {
    let store = Store::open(StoreOptions::in_memory().peer_id(peer_id))
        .await
        .unwrap();
    let mesh = MeshReplicator::new(store.clone());
    (store, mesh)
}

fn any_port() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

fn url(server: &MeshServer) -> String {
    format!("ws://{}/sync", server.local_addr())
}

async fn wait_for_record(
    store: &Store,
    id: &str,
    pred: impl Fn(&NodeRecord) -> bool,
) -> NodeRecord {
    let deadline = Instant::now() + CONVERGENCE_TIMEOUT;
    loop {
        if let Some(record) = store.get(id).await.unwrap() {
            if pred(&record) {
                return record;
            }
        }
        assert!(
            Instant::now() < deadline,
            "store {} never reached the expected state for '{id}'",
            store.peer_id()
        );
        sleep(POLL_INTERVAL).await;
    }
}

async fn wait_for_absent(store: &Store, id: &str) {
    let deadline = Instant::now() + CONVERGENCE_TIMEOUT;
    while store.get(id).await.unwrap().is_some() {
        assert!(
            Instant::now() < deadline,
            "record '{id}' was never deleted on {}",
            store.peer_id()
        );
        sleep(POLL_INTERVAL).await;
    }
}

#[tokio::test]
async fn fresh_peers_exchange_full_state_on_connect() {
    init_tracing();
    let (a, mesh_a) = peer("A").await;
    let (b, mesh_b) = peer("B").await;

    // Divergent writes to the same record before the peers ever meet.
    a.put("k1", json!({"x": 1})).await.unwrap();
    b.put("k1", json!({"y": 2})).await.unwrap();

    let server = mesh_a.serve(any_port()).await.unwrap();
    mesh_b.dial(&url(&server)).await.unwrap();

    for store in [&a, &b] {
        let record = wait_for_record(store, "k1", |r| r.data.len() == 2).await;
        assert_eq!(record.data["x"], json!(1));
        assert_eq!(record.data["y"], json!(2));
        assert_eq!(record.vector_clock.get("A"), 1);
        assert_eq!(record.vector_clock.get("B"), 1);
        assert!(record.state.contains_key("x"));
        assert!(record.state.contains_key("y"));
    }
}

#[tokio::test]
async fn later_write_wins_conflicting_field_across_peers() {
    init_tracing();
    let (a, mesh_a) = peer("A").await;
    let (b, mesh_b) = peer("B").await;

    a.put("k2", json!({"v": "from-A"})).await.unwrap();
    // Make sure B's write carries a strictly later wall-clock stamp.
    sleep(Duration::from_millis(5)).await;
    b.put("k2", json!({"v": "from-B"})).await.unwrap();

    let server = mesh_a.serve(any_port()).await.unwrap();
    mesh_b.dial(&url(&server)).await.unwrap();

    for store in [&a, &b] {
        let record =
            wait_for_record(store, "k2", |r| r.data["v"] == json!("from-B")).await;
        assert_eq!(record.state["v"], record.timestamp);
    }
}

#[tokio::test]
async fn live_updates_flow_both_ways() {
    init_tracing();
    let (a, mesh_a) = peer("A").await;
    let (b, mesh_b) = peer("B").await;

    let server = mesh_a.serve(any_port()).await.unwrap();
    mesh_b.dial(&url(&server)).await.unwrap();

    // Server-side write reaches the dialer.
    a.put("k3", json!({"from": "A"})).await.unwrap();
    wait_for_record(&b, "k3", |r| r.data["from"] == json!("A")).await;

    // Dialer-side write reaches the server.
    b.put("k4", json!({"from": "B"})).await.unwrap();
    wait_for_record(&a, "k4", |r| r.data["from"] == json!("B")).await;
}

#[tokio::test]
async fn deletes_propagate_and_peers_agree_after_delete_put_race() {
    init_tracing();
    let (a, mesh_a) = peer("A").await;
    let (b, mesh_b) = peer("B").await;

    let server = mesh_a.serve(any_port()).await.unwrap();
    mesh_b.dial(&url(&server)).await.unwrap();

    a.put("k5", json!({"v": 1})).await.unwrap();
    wait_for_record(&b, "k5", |r| r.data["v"] == json!(1)).await;

    b.delete("k5").await.unwrap();
    wait_for_absent(&a, "k5").await;

    // A later put resurrects the record everywhere; the important part is
    // that both sides end up agreeing.
    a.put("k5", json!({"v": 2})).await.unwrap();
    wait_for_record(&b, "k5", |r| r.data["v"] == json!(2)).await;
    let on_a = wait_for_record(&a, "k5", |r| r.data["v"] == json!(2)).await;
    assert_eq!(on_a.data["v"], json!(2));
}

#[tokio::test]
async fn hub_relays_between_served_links_without_reflecting_origin() {
    init_tracing();
    let (hub, mesh_hub) = peer("H").await;
    let (b, mesh_b) = peer("B").await;

    let server = mesh_hub.serve(any_port()).await.unwrap();
    mesh_b.dial(&url(&server)).await.unwrap();

    // A bare client plays peer "A" on a second served link so every frame
    // the hub sends back to it can be inspected.
    let (socket, _) = connect_async(url(&server)).await.unwrap();
    let (mut sink, mut stream) = socket.split();

    let put = json!({
        "type": "put",
        "originId": "A",
        "node": {
            "id": "k6",
            "data": {"v": 1},
            "timestamp": 50,
            "state": {"v": 50},
            "vectorClock": {"A": 1},
            "writerId": "A"
        }
    });
    sink.send(WsMessage::Text(put.to_string().into()))
        .await
        .unwrap();

    // The hub merges the record and relays it across its other served
    // link, so the dialing peer converges.
    wait_for_record(&hub, "k6", |r| r.data["v"] == json!(1)).await;
    wait_for_record(&b, "k6", |r| r.data["v"] == json!(1)).await;

    // Nothing the hub sends back on the source link may originate from
    // "A" itself: the source link is excluded from the relay set.
    let drain_deadline = Instant::now() + Duration::from_millis(500);
    while Instant::now() < drain_deadline {
        let Ok(Some(Ok(frame))) = timeout(Duration::from_millis(100), stream.next()).await
        else {
            continue;
        };
        if let WsMessage::Text(text) = frame {
            if let Ok(message) = serde_json::from_str::<MeshMessage>(text.as_str()) {
                assert_ne!(
                    message.origin_id(),
                    "A",
                    "hub reflected a frame back to its origin: {message:?}"
                );
            }
        }
    }
}

#[tokio::test]
async fn sync_request_streams_current_state_to_late_joiner() {
    init_tracing();
    let (a, mesh_a) = peer("A").await;

    for i in 0..5 {
        a.put(format!("record-{i}"), json!({"i": i})).await.unwrap();
    }

    let server = mesh_a.serve(any_port()).await.unwrap();

    let (late, mesh_late) = peer("L").await;
    mesh_late.dial(&url(&server)).await.unwrap();

    for i in 0..5 {
        wait_for_record(&late, &format!("record-{i}"), |r| r.data["i"] == json!(i)).await;
    }
    assert_eq!(mesh_a.link_count(), 1);
    assert_eq!(mesh_late.link_count(), 1);
}
