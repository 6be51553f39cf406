use chrono::{DateTime, TimeZone, Utc};
use pointgraph_core::node::{NODE_TYPE_DEVICE, NODE_TYPE_GROUP, NODE_TYPE_USER};
use pointgraph_core::{HashMode, Point, PointType};
use pointgraph_proto::{parse_ack, NodeFilter};
use pointgraph_server::client::decode_upstream;
use pointgraph_server::{
    runtime, Bus, Client, ClientError, LocalBus, MqttBus, ServerConfig, ServerHandle, Store,
    StoreType, Subscription,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const TIMEOUT: Duration = Duration::from_secs(2);

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

fn config() -> ServerConfig {
    ServerConfig {
        store_type: StoreType::Memory,
        metrics_interval: None,
        transport_uri: "tcp://edge.example:1883".to_string(),
        request_timeout: TIMEOUT,
        ..ServerConfig::default()
    }
}

async fn serve() -> (LocalBus, ServerHandle, Client<LocalBus>, Arc<Store>) {
    let bus = LocalBus::new();
    let store = Arc::new(Store::in_memory(HashMode::Timestamps));
    let handle = runtime::start(Arc::clone(&store), bus.clone(), &config())
        .await
        .unwrap();
    let client = Client::from_config(bus.clone(), &config());
    (bus, handle, client, store)
}

fn live() -> Point {
    Point::value(PointType::Tombstone, 0.0)
}

async fn drain(sub: &mut Subscription) -> Vec<String> {
    let mut subjects = Vec::new();
    while let Ok(Some(msg)) = tokio::time::timeout(Duration::from_millis(100), sub.next()).await {
        subjects.push(msg.subject);
    }
    subjects
}

#[tokio::test]
async fn update_reaches_every_ancestor() {
    let (bus, handle, client, _store) = serve().await;

    client
        .send_node_points("R", vec![Point::text(PointType::Description, "root")], true)
        .await
        .unwrap();
    for (node, parent) in [("A", "R"), ("B", "R"), ("C", "A"), ("C", "B")] {
        client
            .send_edge_points(node, parent, vec![live()], true)
            .await
            .unwrap();
    }

    let mut sub = bus.subscribe("upstream.>").await.unwrap();
    client
        .send_node_points("C", vec![Point::value(PointType::Value, 21.5)], true)
        .await
        .unwrap();

    let subjects = drain(&mut sub).await;
    let seen: HashSet<&str> = subjects.iter().map(String::as_str).collect();
    for expected in ["upstream.C.C", "upstream.A.C", "upstream.B.C", "upstream.R.C"] {
        assert!(seen.contains(expected), "missing {expected} in {subjects:?}");
    }
    assert!(subjects.iter().all(|s| !s.starts_with("upstream.none")));

    handle.shutdown().await;
}

#[tokio::test]
async fn fan_out_carries_the_same_points() {
    let (bus, handle, client, _store) = serve().await;
    client
        .send_node_points("R", vec![Point::text(PointType::Description, "root")], true)
        .await
        .unwrap();
    client
        .send_edge_points("N1", "R", vec![live()], true)
        .await
        .unwrap();

    let mut sub = bus.subscribe("upstream.R.>").await.unwrap();
    let point = Point::value(PointType::Value, 3.0).with_time(at(5));
    client
        .send_edge_points("N1", "R", vec![point.clone()], true)
        .await
        .unwrap();

    let msg = tokio::time::timeout(TIMEOUT, sub.next()).await.unwrap().unwrap();
    assert_eq!(msg.subject, "upstream.R.N1.R");
    assert_eq!(decode_upstream(&msg.payload).unwrap(), vec![point]);

    handle.shutdown().await;
}

#[tokio::test]
async fn stale_points_and_tombstones() {
    let (_bus, handle, client, _store) = serve().await;
    client
        .send_node_points("R", vec![Point::text(PointType::Description, "root")], true)
        .await
        .unwrap();
    client
        .send_edge_points("N1", "R", vec![live().with_time(at(0))], true)
        .await
        .unwrap();

    client
        .send_node_points("N1", vec![Point::value(PointType::Value, 1.0).with_time(at(10))], true)
        .await
        .unwrap();
    client
        .send_node_points("N1", vec![Point::value(PointType::Value, 7.0).with_time(at(5))], true)
        .await
        .unwrap();

    let found = client.get_nodes("R", "N1", &NodeFilter::default()).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].points.value(&PointType::Value), Some(1.0));

    client
        .send_edge_points(
            "N1",
            "R",
            vec![Point::value(PointType::Tombstone, 1.0).with_time(at(20))],
            true,
        )
        .await
        .unwrap();
    assert!(client
        .get_nodes("R", "N1", &NodeFilter::default())
        .await
        .unwrap()
        .is_empty());
    let with_deleted = NodeFilter {
        include_deleted: true,
        ..NodeFilter::default()
    };
    assert_eq!(client.get_nodes("R", "N1", &with_deleted).await.unwrap().len(), 1);

    client
        .send_edge_points("N1", "R", vec![live().with_time(at(30))], true)
        .await
        .unwrap();
    let children = client.get_children("R", None, false).await.unwrap();
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].points.value(&PointType::Value), Some(1.0));

    handle.shutdown().await;
}

#[tokio::test]
async fn rejected_updates_reply_with_errors() {
    let (bus, handle, client, _store) = serve().await;
    client
        .send_node_points("R", vec![Point::text(PointType::Description, "root")], true)
        .await
        .unwrap();

    let err = client.delete_node("R", "none").await.unwrap_err();
    assert!(matches!(err, ClientError::Remote(msg) if msg.contains("root")));

    let reply = bus
        .request("points.N1", vec![0xff, 0x00, 0x13], TIMEOUT)
        .await
        .unwrap();
    assert!(parse_ack(&reply).is_err());

    client
        .send_edge_points("A", "R", vec![live()], true)
        .await
        .unwrap();
    let err = client
        .send_edge_points("R", "A", vec![live()], true)
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Remote(msg) if msg.contains("cycle")));

    let err = client.get_node("missing").await.unwrap_err();
    assert!(matches!(err, ClientError::Remote(_)));

    handle.shutdown().await;
}

#[tokio::test]
async fn move_and_mirror() {
    let (_bus, handle, client, store) = serve().await;
    client
        .send_node_points("R", vec![Point::text(PointType::Description, "root")], true)
        .await
        .unwrap();
    for group in ["G1", "G2"] {
        client.mirror_node(group, "R").await.unwrap();
    }
    client.mirror_node("D", "G1").await.unwrap();
    let types = [
        ("G1", NODE_TYPE_GROUP),
        ("G2", NODE_TYPE_GROUP),
        ("D", NODE_TYPE_DEVICE),
    ];
    for (node, typ) in types {
        client
            .send_node_points(node, vec![Point::text(PointType::NodeType, typ)], true)
            .await
            .unwrap();
    }
    let groups = client.get_children("R", Some(NODE_TYPE_GROUP), false).await.unwrap();
    assert_eq!(groups.len(), 2);
    assert!(client
        .get_children("R", Some(NODE_TYPE_DEVICE), false)
        .await
        .unwrap()
        .is_empty());

    client.move_node("D", "G1", "G2").await.unwrap();
    assert!(client.get_children("G1", None, false).await.unwrap().is_empty());
    let devices = client.get_children("G2", Some(NODE_TYPE_DEVICE), false).await.unwrap();
    assert_eq!(devices[0].id, "D");
    assert_eq!(devices[0].typ, NODE_TYPE_DEVICE);

    client.mirror_node("D", "G1").await.unwrap();
    assert_eq!(store.parents("D", false), vec!["G1".to_string(), "G2".to_string()]);

    handle.shutdown().await;
}

#[tokio::test]
async fn auth_and_admin_requests() {
    let (_bus, handle, client, _store) = serve().await;
    client
        .send_node_points("R", vec![Point::text(PointType::Description, "root")], true)
        .await
        .unwrap();
    client
        .send_edge_points(
            "U1",
            "R",
            vec![live(), Point::text(PointType::NodeType, NODE_TYPE_USER)],
            true,
        )
        .await
        .unwrap();
    client
        .send_node_points(
            "U1",
            vec![
                Point::text(PointType::Email, "ops@example.com"),
                Point::text(PointType::Pass, "hunter2"),
            ],
            true,
        )
        .await
        .unwrap();

    let users = client.user_check("ops@example.com", "hunter2").await.unwrap();
    assert_eq!(users.len(), 1);
    assert_eq!(users[0].id, "U1");
    assert!(client
        .user_check("ops@example.com", "wrong")
        .await
        .unwrap()
        .is_empty());

    assert_eq!(client.transport_uri().await.unwrap(), "tcp://edge.example:1883");

    let verify = client.store_verify().await.unwrap();
    assert_eq!(verify.checked, 2);
    assert!(verify.mismatches.is_empty());
    let maint = client.store_maint().await.unwrap();
    assert!(!maint.repaired);

    handle.shutdown().await;
}

#[tokio::test]
async fn shutdown_drops_subscriptions() {
    let (bus, handle, client, _store) = serve().await;
    assert!(bus.subscription_count() >= 7);
    client
        .send_node_points("R", vec![Point::value(PointType::Value, 1.0)], false)
        .await
        .unwrap();
    handle.shutdown().await;
    assert_eq!(bus.subscription_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn mqtt_roundtrip() {
    if std::env::var("POINTGRAPH_INTEGRATION").is_err() {
        eprintln!("Skipping integration test; set POINTGRAPH_INTEGRATION=1 to run");
        return;
    }

    let broker = std::env::var("POINTGRAPH_MQTT_BROKER")
        .unwrap_or_else(|_| "tcp://localhost:1883".to_string());
    let prefix = format!("it{}", Uuid::new_v4().simple());

    let (server_bus, server_loop) =
        MqttBus::connect(&broker, &format!("server-{}", Uuid::new_v4())).unwrap();
    let store = Arc::new(Store::in_memory(HashMode::Timestamps));
    let config = ServerConfig {
        subject_prefix: Some(prefix),
        request_timeout: Duration::from_secs(5),
        ..config()
    };
    let handle = runtime::start(store, server_bus, &config).await.unwrap();

    let (client_bus, client_loop) =
        MqttBus::connect(&broker, &format!("client-{}", Uuid::new_v4())).unwrap();
    let client = Client::from_config(client_bus, &config);

    tokio::time::sleep(Duration::from_millis(500)).await;

    client
        .send_node_points("R", vec![Point::value(PointType::Value, 42.0)], true)
        .await
        .unwrap();
    let node = client.get_node("R").await.unwrap();
    assert_eq!(node.points.value(&PointType::Value), Some(42.0));

    handle.shutdown().await;
    server_loop.abort();
    client_loop.abort();
}
