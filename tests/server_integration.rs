mod common;

use agent_lab::catalog::Catalog;
use agent_lab::config::Config;
use agent_lab::server::{AppState, router};
use common::{MockOpenRouter, Reply, text_reply, tool_call_reply};
use reqwest::StatusCode;
use serde_json::{Value, json};
use std::sync::Arc;
use tempfile::TempDir;

struct TestServer {
    base: String,
    http: reqwest::Client,
    data: TempDir,
}

async fn start(replies: Vec<Reply>) -> (TestServer, MockOpenRouter) {
    let mock = MockOpenRouter::start(replies).await;
    let data = TempDir::new().unwrap();
    let mut config = Config::default();
    config.storage.data_dir = data.path().to_path_buf();
    let state = Arc::new(AppState::new(config, mock.client(), Catalog::builtin()).unwrap());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router(state)).await.unwrap();
    });
    let server = TestServer {
        base: format!("http://{addr}"),
        http: reqwest::Client::new(),
        data,
    };
    (server, mock)
}

impl TestServer {
    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    async fn post(&self, path: &str, body: Value) -> reqwest::Response {
        self.http.post(self.url(path)).json(&body).send().await.unwrap()
    }

    async fn get(&self, path: &str) -> reqwest::Response {
        self.http.get(self.url(path)).send().await.unwrap()
    }
}

/// Split an SSE body into `(event name, JSON data)` pairs.
fn parse_sse(body: &str) -> Vec<(String, Value)> {
    let mut out = Vec::new();
    for block in body.split("\n\n") {
        let mut name = String::from("message");
        let mut data = String::new();
        for line in block.lines() {
            if let Some(rest) = line.strip_prefix("event:") {
                name = rest.trim().to_string();
            } else if let Some(rest) = line.strip_prefix("data:") {
                data.push_str(rest.trim());
            }
        }
        // A trailing partial block simply fails to parse.
        if let Ok(value) = serde_json::from_str(&data) {
            out.push((name, value));
        }
    }
    out
}

#[tokio::test]
async fn health_index_and_models() {
    let (server, _mock) = start(vec![]).await;

    let resp = server.get("/health").await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.text().await.unwrap(), "OK");

    let html = server.get("/").await.text().await.unwrap();
    assert!(html.contains("<title>Agent Lab</title>"));
    assert!(html.contains("calculator"));

    let models: Vec<Value> = server.get("/api/models").await.json().await.unwrap();
    assert_eq!(models.len(), Catalog::builtin().models().len());
    assert!(models.iter().any(|m| m["id"] == "anthropic/claude-3.5-haiku"));
}

#[tokio::test]
async fn recommend_and_cheapest() {
    let (server, _mock) = start(vec![]).await;

    let resp = server.post("/api/recommend", json!({"profile": "coding"})).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["profile"], "coding");
    assert!(body["params"]["temperature"].as_f64().unwrap() < 0.3);

    let resp = server.post("/api/recommend", json!({"profile": "poetry"})).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = server
        .post("/api/cheapest-model", json!({"needs_tools": true, "expected_prompt_tokens": 1000}))
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let pick: Value = resp.json().await.unwrap();
    assert_eq!(pick["model"]["id"], "google/gemini-flash-1.5");

    let resp = server
        .post("/api/cheapest-model", json!({"min_context": 10_000_000}))
        .await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn chat_rejects_bad_input_with_400() {
    let (server, mock) = start(vec![]).await;

    let resp = server
        .post(
            "/api/chat",
            json!({"message": "hi", "params": {"temperature": 5.0, "top_p": 0.0}}),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = resp.json().await.unwrap();
    let fields: Vec<&str> = body["violations"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v["field"].as_str().unwrap())
        .collect();
    assert_eq!(fields, vec!["temperature", "top_p"]);

    let resp = server.post("/api/chat", json!({"message": "   "})).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = server
        .post(
            "/api/chat",
            json!({"message": "hi", "session_id": "00000000-0000-4000-8000-000000000000"}),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    assert!(mock.requests().is_empty());
}

#[tokio::test]
async fn cancel_unknown_run_is_404() {
    let (server, _mock) = start(vec![]).await;
    let resp = server
        .post("/api/runs/7d1f6f43-2c55-4b0f-9a9e-0c3e4a1f2b6d/cancel", json!({}))
        .await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let resp = server.post("/api/runs/not-a-uuid/cancel", json!({})).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn chat_streams_events_and_records_the_session() {
    let (server, _mock) = start(vec![
        tool_call_reply("call_1", "calculator", &["{\"expression\":\"2^10\"}"]),
        text_reply(&["It is ", "1024."], 40, 5),
        text_reply(&["Still 1024."], 60, 3),
    ])
    .await;

    let resp = server
        .post("/api/chat", json!({"message": "What is 2^10?", "params": {"temperature": 0.2}}))
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(
        resp.headers()["content-type"]
            .to_str()
            .unwrap()
            .starts_with("text/event-stream")
    );
    let events = parse_sse(&resp.text().await.unwrap());
    let names: Vec<&str> = events.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(names.first(), Some(&"run"));
    assert_eq!(names.last(), Some(&"done"));
    assert!(names.contains(&"tool_call"));
    assert!(names.contains(&"tool_result"));

    let text: String = events
        .iter()
        .filter(|(n, _)| n == "token")
        .map(|(_, v)| v["text"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(text, "It is 1024.");

    let (_, done) = events.last().unwrap();
    assert_eq!(done["status"], "ok");
    assert_eq!(done["saved"], true);
    assert_eq!(done["turns"], 2);
    let session_id = done["session_id"].as_str().unwrap().to_string();

    // Continue the same session.
    let resp = server
        .post("/api/chat", json!({"message": "And again?", "session_id": session_id}))
        .await;
    let events = parse_sse(&resp.text().await.unwrap());
    assert_eq!(events.last().unwrap().1["status"], "ok");

    let sessions: Vec<Value> = server.get("/api/sessions").await.json().await.unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0]["title"], "What is 2^10?");

    let session: Value = server
        .get(&format!("/api/sessions/{session_id}"))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(session["format_version"], 2);
    assert!((session["params"]["temperature"].as_f64().unwrap() - 0.2).abs() < 1e-6);
    assert_eq!(session["messages"].as_array().unwrap().len(), 6);

    let usage: Value = server.get("/api/usage").await.json().await.unwrap();
    assert_eq!(usage["requests"], 3);
    assert_eq!(usage["models"][0]["model"], common::MODEL);

    let resp = server
        .http
        .delete(server.url(&format!("/api/sessions/{session_id}")))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    let resp = server.get(&format!("/api/sessions/{session_id}")).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

/// Read SSE chunks until the `run` event and a first token have arrived; returns the `run` payload.
async fn wait_for_first_token(resp: &mut reqwest::Response, body: &mut String) -> Value {
    loop {
        let chunk = resp.chunk().await.unwrap().expect("stream ended early");
        body.push_str(&String::from_utf8_lossy(&chunk));
        let events = parse_sse(body);
        let started = events.iter().find(|(n, _)| n == "run").map(|(_, v)| v.clone());
        let has_token = events.iter().any(|(n, _)| n == "token");
        if let (Some(run), true) = (started, has_token) {
            return run;
        }
    }
}

fn completion_body(content: &str) -> String {
    json!({
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": content},
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 30, "completion_tokens": 12, "total_tokens": 42}
    })
    .to_string()
}

#[tokio::test]
async fn active_run_blocks_a_second_chat_and_delete_with_409() {
    let (server, mock) = start(vec![Reply::Hang(common::text_deltas(&["Thinking"]))]).await;

    let mut resp = server.post("/api/chat", json!({"message": "long task"})).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let mut body = String::new();
    let run = wait_for_first_token(&mut resp, &mut body).await;
    let run_id = run["run_id"].as_str().unwrap().to_string();
    let session_id = run["session_id"].as_str().unwrap().to_string();

    let second = server
        .post("/api/chat", json!({"message": "me too", "session_id": session_id}))
        .await;
    assert_eq!(second.status(), StatusCode::CONFLICT);
    let err: Value = second.json().await.unwrap();
    assert!(err["error"].as_str().unwrap().contains("already active"));

    let delete = server
        .http
        .delete(server.url(&format!("/api/sessions/{session_id}")))
        .send()
        .await
        .unwrap();
    assert_eq!(delete.status(), StatusCode::CONFLICT);
    assert_eq!(mock.requests().len(), 1);

    let cancel = server.post(&format!("/api/runs/{run_id}/cancel"), json!({})).await;
    assert_eq!(cancel.status(), StatusCode::ACCEPTED);
    while let Some(chunk) = resp.chunk().await.unwrap() {
        body.push_str(&String::from_utf8_lossy(&chunk));
    }
    let events = parse_sse(&body);
    assert_eq!(events.last().unwrap().1["status"], "cancelled");

    // Released once the run is done.
    let delete = server
        .http
        .delete(server.url(&format!("/api/sessions/{session_id}")))
        .send()
        .await
        .unwrap();
    assert_eq!(delete.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn optimize_prompt_maps_unparseable_replies_to_502() {
    let suggestion = json!({
        "improved_prompt": "List three Rust web frameworks as a markdown table.",
        "changes": ["asked for a format"]
    });
    let (server, _mock) = start(vec![
        Reply::Status(200, completion_body(&format!("```json\n{suggestion}\n```"))),
        Reply::Status(200, completion_body("Sorry, I would rather chat.")),
    ])
    .await;

    let resp = server
        .post("/api/optimize-prompt", json!({"prompt": "rust web stuff"}))
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["improved_prompt"], suggestion["improved_prompt"]);
    assert_eq!(body["changes"][0], "asked for a format");

    let resp = server
        .post("/api/optimize-prompt", json!({"prompt": "rust web stuff"}))
        .await;
    assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);

    let resp = server.post("/api/optimize-prompt", json!({"prompt": "  "})).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn legacy_session_files_are_422_and_left_out_of_listings() {
    let (server, _mock) = start(vec![]).await;
    let id = "3f2b8c4e-9d1a-4e6f-8b7c-2a5d9e0f1c3b";
    let dir = server.data.path().join("sessions");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(
        dir.join(format!("{id}.json")),
        r#"[{"role": "user", "content": "hello from the old format"}]"#,
    )
    .unwrap();

    let resp = server.get(&format!("/api/sessions/{id}")).await;
    assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);

    let sessions: Vec<Value> = server.get("/api/sessions").await.json().await.unwrap();
    assert!(sessions.is_empty());
}

#[tokio::test]
async fn chat_run_can_be_cancelled_over_http() {
    let (server, _mock) = start(vec![Reply::Hang(common::text_deltas(&["Once upon"]))]).await;

    let mut resp = server.post("/api/chat", json!({"message": "story"})).await;
    assert_eq!(resp.status(), StatusCode::OK);

    let mut body = String::new();
    let run = wait_for_first_token(&mut resp, &mut body).await;
    let run_id = run["run_id"].as_str().unwrap().to_string();

    let cancel = server.post(&format!("/api/runs/{run_id}/cancel"), json!({})).await;
    assert_eq!(cancel.status(), StatusCode::ACCEPTED);

    while let Some(chunk) = resp.chunk().await.unwrap() {
        body.push_str(&String::from_utf8_lossy(&chunk));
    }
    let events = parse_sse(&body);
    let (name, done) = events.last().unwrap();
    assert_eq!(name, "done");
    assert_eq!(done["status"], "cancelled");
    assert!(done["final_text"].as_str().unwrap().starts_with("Once upon"));

    // The run is gone once finished.
    let again = server.post(&format!("/api/runs/{run_id}/cancel"), json!({})).await;
    assert_eq!(again.status(), StatusCode::NOT_FOUND);
}
