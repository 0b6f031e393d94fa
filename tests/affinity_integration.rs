//! Multi-instance tests: two nodes sharing one ownership cache
//!
//! Each node listens on its own loopback port and advertises that address.
//! Requests are sent to the "wrong" node on purpose to check forwarding.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use mcp_affinity::affinity::{
    AffinityError, CacheSessionStore, ListenerAddresses, RecordFactory, SessionOwnershipStore,
    SessionAffinityOptions,
};
use mcp_affinity::cache::{MemoryCache, SharedCache};
use mcp_affinity::node::{node_router, NodeState, INSTANCE_HEADER};
use mcp_affinity::{build_with_cache, OwnerId, OwnershipRecord};
use serde_json::{json, Value};

struct Node {
    url: String,
}

async fn start_node(name: &str, cache: Arc<dyn SharedCache>) -> Node {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();

    let addresses = Arc::new(ListenerAddresses::new());
    addresses.record("http", addr);

    let owner = OwnerId::from(name);
    let filter = build_with_cache(
        &SessionAffinityOptions::default(),
        owner.clone(),
        addresses,
        cache,
    )
    .unwrap();
    let app = node_router(
        NodeState::new(owner)
            .with_affinity(filter)
            .with_heartbeat(Duration::from_millis(50)),
    );

    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    Node {
        url: format!("http://{}", addr),
    }
}

struct Cluster {
    a: Node,
    b: Node,
    store: CacheSessionStore,
    client: reqwest::Client,
}

async fn cluster() -> Cluster {
    let cache: Arc<dyn SharedCache> = Arc::new(MemoryCache::default());
    let a = start_node("node-a", cache.clone()).await;
    let b = start_node("node-b", cache.clone()).await;
    let client = reqwest::Client::builder().no_proxy().build().unwrap();

    Cluster {
        a,
        b,
        store: CacheSessionStore::new(cache),
        client,
    }
}

impl Cluster {
    async fn initialize(&self, node: &Node) -> String {
        let response = self
            .client
            .post(format!("{}/mcp", node.url))
            .json(&json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": "initialize",
                "params": {"clientInfo": {"name": "it", "version": "1.0"}}
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        response.headers()["mcp-session-id"].to_str().unwrap().to_string()
    }

    async fn ping(&self, node: &Node, session: &str) -> reqwest::Response {
        self.client
            .post(format!("{}/mcp", node.url))
            .header("mcp-session-id", session)
            .json(&json!({"jsonrpc": "2.0", "id": 2, "method": "ping"}))
            .send()
            .await
            .unwrap()
    }
}

#[tokio::test]
async fn test_session_created_on_a_is_served_by_a_via_b() {
    let cluster = cluster().await;
    let session = cluster.initialize(&cluster.a).await;

    let record = cluster.store.get(&session).await.unwrap().unwrap();
    assert_eq!(record.owner_id, OwnerId::from("node-a"));
    assert_eq!(record.address, cluster.a.url);

    for _ in 0..3 {
        let response = cluster.ping(&cluster.b, &session).await;
        assert_eq!(response.status(), 200);
        assert_eq!(response.headers()[INSTANCE_HEADER], "node-a");
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["result"], json!({}));
    }
}

#[tokio::test]
async fn test_event_stream_is_relayed_from_owner() {
    let cluster = cluster().await;
    let session = cluster.initialize(&cluster.a).await;

    let response = cluster
        .client
        .get(format!("{}/mcp", cluster.b.url))
        .header("mcp-session-id", session.as_str())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()[INSTANCE_HEADER], "node-a");

    let mut stream = response.bytes_stream();
    let mut seen = String::new();
    while !seen.contains("event: heartbeat") {
        let chunk = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("event stream stalled")
            .unwrap()
            .unwrap();
        seen.push_str(&String::from_utf8_lossy(&chunk));
    }
    assert!(seen.contains("event: ready"));
    assert!(seen.contains("node-a"));
}

#[tokio::test]
async fn test_owner_forgetting_session_evicts_record() {
    let cluster = cluster().await;
    let session = cluster.initialize(&cluster.a).await;

    let response = cluster
        .client
        .delete(format!("{}/mcp", cluster.a.url))
        .header("mcp-session-id", session.as_str())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 204);

    let response = cluster.ping(&cluster.b, &session).await;
    assert_eq!(response.status(), 404);
    assert_eq!(response.headers()[INSTANCE_HEADER], "node-a");
    assert!(cluster.store.get(&session).await.unwrap().is_none());
}

#[tokio::test]
async fn test_unreachable_owner_is_bad_gateway() {
    let cluster = cluster().await;

    let dead = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_url = format!("http://{}", dead.local_addr().unwrap());
    drop(dead);

    let record = OwnershipRecord::claim(OwnerId::from("node-gone"), dead_url.clone());
    let factory: RecordFactory<'_> = Box::new(move || -> BoxFuture<'static, Result<OwnershipRecord, AffinityError>> {
        async move { Ok(record) }.boxed()
    });
    cluster.store.get_or_claim("ghost", factory).await.unwrap();

    let response = cluster.ping(&cluster.b, "ghost").await;
    assert_eq!(response.status(), 502);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["session_id"], "ghost");

    let record = cluster.store.get("ghost").await.unwrap().unwrap();
    assert_eq!(record.address, dead_url);
}

#[tokio::test]
async fn test_requests_without_session_stay_local() {
    let cluster = cluster().await;

    let response = cluster
        .client
        .get(format!("{}/health", cluster.b.url))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()[INSTANCE_HEADER], "node-b");
}
