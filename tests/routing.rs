//! Web-search routing: routing call, search backend, then the streamed answer.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use palaver::config::Config;
use palaver::dispatch::registry::Registry;
use palaver::dispatch::routing::{SEARCH_TOOL, search_tools};
use palaver::dispatch::search::SearchClient;
use palaver::dispatch::{ChatCall, ChatMessage, ChatProvider, DeltaSink, Frame};
use palaver::store::Role;

async fn read_request(socket: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = socket.read(&mut chunk).await.unwrap();
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        let text = String::from_utf8_lossy(&buf);
        if let Some(head_end) = text.find("\r\n\r\n") {
            let content_length = text[..head_end]
                .lines()
                .find_map(|l| {
                    let (name, value) = l.split_once(':')?;
                    name.eq_ignore_ascii_case("content-length")
                        .then(|| value.trim().parse::<usize>().ok())
                        .flatten()
                })
                .unwrap_or(0);
            if buf.len() >= head_end + 4 + content_length {
                break;
            }
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

fn body_json(request: &str) -> serde_json::Value {
    let body = request.split_once("\r\n\r\n").map(|(_, b)| b).unwrap_or("");
    serde_json::from_str(body).unwrap()
}

fn json_response(body: &serde_json::Value) -> String {
    let body = body.to_string();
    format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    )
}

fn sse_answer(text: &str) -> String {
    let chunk = serde_json::json!({"choices": [{"delta": {"content": text}}]});
    format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nConnection: close\r\n\r\ndata: {chunk}\n\ndata: [DONE]\n\n"
    )
}

fn tool_call_reply(arguments: &str) -> serde_json::Value {
    serde_json::json!({
        "choices": [{"message": {
            "content": "",
            "tool_calls": [{
                "id": "call_7",
                "type": "function",
                "function": {"name": SEARCH_TOOL, "arguments": arguments}
            }]
        }}]
    })
}

/// Upstream that answers each accepted connection with the next canned
/// response and hands back the requests it saw.
async fn scripted_upstream(
    responses: Vec<String>,
) -> (String, tokio::task::JoinHandle<Vec<String>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = tokio::spawn(async move {
        let mut seen = Vec::new();
        for response in responses {
            let (mut socket, _) = listener.accept().await.unwrap();
            seen.push(read_request(&mut socket).await);
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
        }
        seen
    });
    (format!("http://127.0.0.1:{port}"), handle)
}

fn config(llm: &str, search: &str, key_env: &str) -> Config {
    Config::from_toml_str(&format!(
        r#"
        routing_model = "Router"

        [search]
        base_url = "{search}/search"
        max_results = 5

        [providers.mock]
        base_url = "{llm}/v1/chat/completions"
        api_key_env = "{key_env}"

        [[models]]
        name = "Router"
        id = "router-id"
        provider = "mock"

        [[models]]
        name = "Answerer"
        id = "answerer-id"
        provider = "mock"
        "#
    ))
    .unwrap()
}

fn call(web_search: bool) -> ChatCall {
    ChatCall {
        model: "Answerer".to_string(),
        messages: vec![ChatMessage::text(Role::User, "what happened in rust today?")],
        image: None,
        web_search,
        max_tokens: 1024,
    }
}

fn drain(rx: &mut mpsc::UnboundedReceiver<Frame>) -> Vec<Frame> {
    let mut frames = Vec::new();
    while let Ok(f) = rx.try_recv() {
        frames.push(f);
    }
    frames
}

#[test]
fn search_tool_schema_requires_query() {
    let tools = search_tools();
    assert_eq!(tools[0]["function"]["name"], SEARCH_TOOL);
    assert_eq!(tools[0]["function"]["parameters"]["required"][0], "query");
}

#[tokio::test]
async fn search_results_lead_the_answer() {
    let (search_url, search) = scripted_upstream(vec![json_response(&serde_json::json!({
        "results": [
            {"title": "Rust 2.0", "url": "https://blog.example/rust", "content": "big news"},
            {"title": "no link"},
        ]
    }))])
    .await;
    let (llm_url, llm) = scripted_upstream(vec![
        json_response(&tool_call_reply(r#"{"query":"rust news","num":3}"#)),
        sse_answer("Rust shipped."),
    ])
    .await;

    // SAFETY: each test uses its own variable name.
    unsafe { std::env::set_var("PALAVER_TEST_KEY_ROUTE", "sk-route") };
    let registry = Registry::from_config(&config(&llm_url, &search_url, "PALAVER_TEST_KEY_ROUTE"))
        .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let outcome = registry
        .stream(call(true), &DeltaSink::new(tx), &CancellationToken::new())
        .await;

    let block = r#"<search>[{"href":"https://blog.example/rust","title":"Rust 2.0"}]</search>"#;
    assert_eq!(outcome.text, format!("{block}Rust shipped."));
    assert_eq!(
        drain(&mut rx),
        vec![
            Frame::Snapshot(block.to_string()),
            Frame::Snapshot(format!("{block}Rust shipped.")),
        ]
    );

    let search_requests = search.await.unwrap();
    assert!(search_requests[0].starts_with("GET /search?q=rust+news&format=json"));

    let llm_requests = llm.await.unwrap();
    let routing = body_json(&llm_requests[0]);
    assert_eq!(routing["model"], "router-id");
    assert_eq!(routing["tools"], search_tools());
    assert_eq!(routing["messages"][0]["role"], "system");

    let answer = body_json(&llm_requests[1]);
    assert_eq!(answer["model"], "answerer-id");
    let roles: Vec<&str> = answer["messages"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["role"].as_str().unwrap())
        .collect();
    assert_eq!(roles, vec!["system", "user", "assistant", "tool", "system"]);
    assert_eq!(answer["messages"][2]["tool_calls"][0]["id"], "call_7");
    assert_eq!(answer["messages"][3]["tool_call_id"], "call_7");
    let tool_output: serde_json::Value =
        serde_json::from_str(answer["messages"][3]["content"].as_str().unwrap()).unwrap();
    assert_eq!(tool_output[0]["body"], "big news");
}

#[tokio::test]
async fn declined_routing_streams_plain_answer() {
    let (search_url, search) = scripted_upstream(vec![]).await;
    let (llm_url, llm) = scripted_upstream(vec![
        json_response(&serde_json::json!({
            "choices": [{"message": {"content": "no search needed"}}]
        })),
        sse_answer("Plain."),
    ])
    .await;

    // SAFETY: each test uses its own variable name.
    unsafe { std::env::set_var("PALAVER_TEST_KEY_DECLINE", "sk-decline") };
    let registry =
        Registry::from_config(&config(&llm_url, &search_url, "PALAVER_TEST_KEY_DECLINE")).unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let outcome = registry
        .stream(call(true), &DeltaSink::new(tx), &CancellationToken::new())
        .await;

    assert_eq!(outcome.text, "Plain.");
    assert_eq!(drain(&mut rx), vec![Frame::Snapshot("Plain.".to_string())]);
    assert_eq!(llm.await.unwrap().len(), 2);
    assert!(search.await.unwrap().is_empty());
}

#[tokio::test]
async fn failing_search_falls_back_to_plain_answer() {
    let (search_url, search) = scripted_upstream(vec![
        "HTTP/1.1 502 Bad Gateway\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_string(),
    ])
    .await;
    let (llm_url, llm) = scripted_upstream(vec![
        json_response(&tool_call_reply(r#"{"query":"rust"}"#)),
        sse_answer("Anyway."),
    ])
    .await;

    // SAFETY: each test uses its own variable name.
    unsafe { std::env::set_var("PALAVER_TEST_KEY_FALLBACK", "sk-fallback") };
    let registry =
        Registry::from_config(&config(&llm_url, &search_url, "PALAVER_TEST_KEY_FALLBACK")).unwrap();

    let (tx, _rx) = mpsc::unbounded_channel();
    let outcome = registry
        .stream(call(true), &DeltaSink::new(tx), &CancellationToken::new())
        .await;

    assert_eq!(outcome.text, "Anyway.");
    let answer = body_json(&llm.await.unwrap()[1]);
    assert_eq!(answer["messages"].as_array().unwrap().len(), 2);
    search.await.unwrap();
}

#[tokio::test]
async fn search_client_caps_results_and_accepts_href_fields() {
    let (url, server) = scripted_upstream(vec![json_response(&serde_json::json!({
        "results": [
            {"title": "a", "href": "https://a.example", "body": "first"},
            {"title": "b", "url": "https://b.example", "content": "second"},
            {"title": "c", "url": "https://c.example"},
        ]
    }))])
    .await;

    let client = SearchClient::new(format!("{url}/search"), Some(2)).unwrap();
    let results = tokio::time::timeout(Duration::from_secs(5), client.search("q", Some(10)))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(results.len(), 2);
    assert_eq!(results[0].href, "https://a.example");
    assert_eq!(results[0].body, "first");
    assert_eq!(results[1].body, "second");
    server.await.unwrap();
}
