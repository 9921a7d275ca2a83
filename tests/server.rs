use std::net::SocketAddr;
use std::time::Duration;

use kvbus::{client, config::Config, server};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

async fn start_server(config: Config) -> (SocketAddr, JoinHandle<kvbus::Result<()>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = tokio::spawn(async move { server::run(listener, config, std::future::pending::<()>()).await });

    (addr, handle)
}

fn config_with_snapshot(path: std::path::PathBuf) -> Config {
    Config {
        snapshot_path: path,
        ..Config::default()
    }
}

#[tokio::test]
async fn basic_set_and_get() {
    let dir = tempfile::tempdir().unwrap();
    let (addr, _handle) = start_server(config_with_snapshot(dir.path().join("state.json"))).await;

    let mut conn = client::connect(addr).await.unwrap();

    let reply = conn.get("hello").await.unwrap();
    assert_eq!(reply, json!({ "result": null, "ttl_remaining": null }));

    let reply = conn.set("hello", "world").await.unwrap();
    assert_eq!(reply, json!({ "result": "OK" }));

    let reply = conn.get("hello").await.unwrap();
    assert_eq!(reply, json!({ "result": "world", "ttl_remaining": null }));
}

#[tokio::test]
async fn delete_reports_key_not_found_when_absent() {
    let dir = tempfile::tempdir().unwrap();
    let (addr, _handle) = start_server(config_with_snapshot(dir.path().join("state.json"))).await;
    let mut conn = client::connect(addr).await.unwrap();

    let reply = conn.delete("missing").await.unwrap();
    assert_eq!(reply, json!({ "result": "Key not found" }));

    conn.set("k", "v").await.unwrap();
    let reply = conn.delete("k").await.unwrap();
    assert_eq!(reply, json!({ "result": "OK" }));
}

#[tokio::test]
async fn set_with_ttl_expires_and_is_swept() {
    let dir = tempfile::tempdir().unwrap();
    let (addr, _handle) = start_server(config_with_snapshot(dir.path().join("state.json"))).await;
    let mut conn = client::connect(addr).await.unwrap();

    let reply = conn.set_with_ttl("k", "v", 1).await.unwrap();
    assert_eq!(reply, json!({ "result": "OK", "ttl_set": 1 }));

    let reply = conn.get("k").await.unwrap();
    assert_eq!(reply["result"], json!("v"));

    tokio::time::sleep(Duration::from_millis(1100)).await;

    let reply = conn.get("k").await.unwrap();
    assert_eq!(reply, json!({ "result": null, "ttl_remaining": null }));
}

#[tokio::test]
async fn set_with_ttl_rejects_missing_or_non_integer_ttl() {
    let dir = tempfile::tempdir().unwrap();
    let (addr, _handle) = start_server(config_with_snapshot(dir.path().join("state.json"))).await;
    let mut conn = client::connect(addr).await.unwrap();

    let reply = conn.call(json!({ "action": "set_with_ttl", "key": "k", "value": "v" })).await.unwrap();
    assert_eq!(reply, json!({ "error": "TTL not provided" }));

    let reply = conn
        .call(json!({ "action": "set_with_ttl", "key": "k", "value": "v", "ttl": "soon" }))
        .await
        .unwrap();
    assert_eq!(reply, json!({ "error": "TTL must be an integer" }));
}

#[tokio::test]
async fn publish_with_no_subscribers_reports_error() {
    let dir = tempfile::tempdir().unwrap();
    let (addr, _handle) = start_server(config_with_snapshot(dir.path().join("state.json"))).await;
    let mut conn = client::connect(addr).await.unwrap();

    let reply = conn.publish("news", json!("hi")).await.unwrap();
    assert_eq!(reply, json!({ "result": "ERROR", "action": "publish", "channel": "news" }));
}

#[tokio::test]
async fn subscriber_receives_published_message() {
    let dir = tempfile::tempdir().unwrap();
    let (addr, _handle) = start_server(config_with_snapshot(dir.path().join("state.json"))).await;

    let mut subscriber = client::connect(addr).await.unwrap();
    subscriber.subscribe("news").await.unwrap();

    let mut publisher = client::connect(addr).await.unwrap();
    let reply = publisher.publish("news", json!("hello subscribers")).await.unwrap();
    assert_eq!(reply, json!({ "result": "OK", "action": "publish", "channel": "news" }));

    let pushed = subscriber.recv_push().await.unwrap().unwrap();
    assert_eq!(pushed, json!({ "channel": "news", "message": "hello subscribers" }));
}

#[tokio::test]
async fn mutations_auto_publish_on_db_updates() {
    let dir = tempfile::tempdir().unwrap();
    let (addr, _handle) = start_server(config_with_snapshot(dir.path().join("state.json"))).await;

    let mut subscriber = client::connect(addr).await.unwrap();
    subscriber.subscribe("db_updates").await.unwrap();

    let mut writer = client::connect(addr).await.unwrap();
    writer.set("tracked", "1").await.unwrap();

    let pushed = subscriber.recv_push().await.unwrap().unwrap();
    assert_eq!(pushed["channel"], json!("db_updates"));
    assert_eq!(pushed["message"]["operation"], json!("set"));
    assert_eq!(pushed["message"]["key"], json!("tracked"));

    writer.set_with_ttl("timed", "2", 60).await.unwrap();
    let pushed = subscriber.recv_push().await.unwrap().unwrap();
    assert_eq!(pushed["message"]["operation"], json!("set_with_ttl"));
    assert_eq!(pushed["message"]["key"], json!("timed"));
}

#[tokio::test]
async fn snapshot_persists_across_restart_excluding_ttl_keys() {
    let dir = tempfile::tempdir().unwrap();
    let snapshot_path = dir.path().join("state.json");

    {
        let (addr, handle) = start_server(config_with_snapshot(snapshot_path.clone())).await;
        let mut conn = client::connect(addr).await.unwrap();
        conn.set("durable", "kept").await.unwrap();
        conn.set_with_ttl("temporary", "gone", 3600).await.unwrap();
        // `set` triggers an inline save; give the spawned save task a beat.
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.abort();
    }

    let (addr, _handle) = start_server(config_with_snapshot(snapshot_path)).await;
    let mut conn = client::connect(addr).await.unwrap();

    let reply = conn.get("durable").await.unwrap();
    assert_eq!(reply["result"], json!("kept"));

    let reply = conn.get("temporary").await.unwrap();
    assert_eq!(reply["result"], json!(null));
}
