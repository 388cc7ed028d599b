//! HTTP surface: NDJSON streaming and the JSON control endpoints.

mod common;

use common::*;
use palaver::server;
use serde_json::{Value, json};

/// Serve the router on an ephemeral port and return its base URL.
async fn spawn_server(provider: std::sync::Arc<StubProvider>) -> String {
    let relay = relay_with(provider, funded_store(), &test_config());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, server::router(relay)).await.unwrap();
    });
    format!("http://{addr}")
}

fn ndjson(body: &str) -> Vec<Value> {
    body.lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).unwrap())
        .collect()
}

#[tokio::test]
async fn generate_streams_ndjson_records() {
    let base = spawn_server(StubProvider::new(Script::Reply(vec!["Hi", "Hi there"]))).await;

    let resp = reqwest::Client::new()
        .post(format!("{base}/api/chat/generate"))
        .json(&json!({
            "message": "hello",
            "model": MODEL,
            "conversation_id": "conv-http",
            "user_id": "alice",
            "message_id": "m-http",
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
    assert_eq!(
        resp.headers()["content-type"].to_str().unwrap(),
        "application/x-ndjson"
    );
    let records = ndjson(&resp.text().await.unwrap());

    assert_eq!(records.len(), 4);
    assert_eq!(records[0]["started"], true);
    assert_eq!(records[0]["message_id"], "m-http");
    assert_eq!(records[2]["text"], "Hi there");
    assert!(records[2].get("started").is_none());
    assert_eq!(records[3]["finished"], true);
}

#[tokio::test]
async fn generate_assigns_message_id_when_missing() {
    let base = spawn_server(StubProvider::new(Script::Reply(vec!["ok"]))).await;

    let body = reqwest::Client::new()
        .post(format!("{base}/api/chat/generate"))
        .json(&json!({
            "message": "hello",
            "model": MODEL,
            "conversation_id": "conv-http",
            "user_id": "alice",
        }))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();

    let records = ndjson(&body);
    let id = records[0]["message_id"].as_str().unwrap();
    assert_eq!(id.len(), 36);
    assert!(records.iter().all(|r| r["message_id"] == id));
}

#[tokio::test]
async fn control_endpoints_report_idle_state() {
    let base = spawn_server(StubProvider::new(Script::Reply(vec!["ok"]))).await;
    let client = reqwest::Client::new();

    let active: Value = client
        .get(format!("{base}/api/chat/active_responses?user_id=alice"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(active, json!({}));

    let stopped: Value = client
        .post(format!("{base}/api/chat/stop"))
        .json(&json!({ "message_id": "nobody" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stopped, json!({ "success": false }));

    let resp = client
        .post(format!("{base}/api/chat/empty-conv/title"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().starts_with("not found"));
}

#[tokio::test]
async fn models_lists_catalog() {
    let base = spawn_server(StubProvider::new(Script::Reply(vec!["ok"]))).await;

    let models: Vec<Value> = reqwest::get(format!("{base}/api/models"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let names: Vec<&str> = models.iter().filter_map(|m| m["name"].as_str()).collect();
    assert_eq!(names, vec![MODEL, VISION_MODEL, TOKEN_MODEL]);
}
