//! Local stand-ins for the OpenRouter chat completions endpoint and for
//! pages fetched by `web_fetch`.
#![allow(dead_code)]

use agent_lab::llm::{LlmClient, Provider};
use axum::{
    Json, Router,
    body::Body,
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures::{StreamExt, stream};
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

pub const MODEL: &str = "openai/gpt-4o-mini";

pub enum Reply {
    /// Stream these SSE chunks, then close.
    Sse(Vec<String>),
    /// Stream these SSE chunks, then keep the connection open forever.
    Hang(Vec<String>),
    Status(u16, String),
}

#[derive(Clone, Default)]
struct MockState {
    replies: Arc<Mutex<VecDeque<Reply>>>,
    requests: Arc<Mutex<Vec<Value>>>,
}

pub struct MockOpenRouter {
    pub base_url: String,
    requests: Arc<Mutex<Vec<Value>>>,
}

impl MockOpenRouter {
    pub async fn start(replies: Vec<Reply>) -> Self {
        let state = MockState {
            replies: Arc::new(Mutex::new(replies.into())),
            requests: Arc::default(),
        };
        let requests = state.requests.clone();
        let app = Router::new()
            .route("/api/v1/chat/completions", post(completions))
            .route("/api/v1/models", get(models))
            .with_state(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self {
            base_url: format!("http://{addr}/api/v1"),
            requests,
        }
    }

    pub fn requests(&self) -> Vec<Value> {
        self.requests.lock().unwrap().clone()
    }

    pub fn client(&self) -> LlmClient {
        LlmClient::new(
            Provider::OpenRouter,
            "test-key".into(),
            MODEL.into(),
            256,
            Some(self.base_url.clone()),
        )
        .unwrap()
    }
}

async fn completions(State(state): State<MockState>, Json(body): Json<Value>) -> Response {
    state.requests.lock().unwrap().push(body);
    let reply = state.replies.lock().unwrap().pop_front();
    match reply {
        None => (StatusCode::INTERNAL_SERVER_ERROR, "no scripted reply").into_response(),
        Some(Reply::Status(code, body)) => {
            (StatusCode::from_u16(code).unwrap(), body).into_response()
        }
        Some(Reply::Sse(chunks)) => sse_response(Body::from(chunks.concat())),
        Some(Reply::Hang(chunks)) => {
            let head = stream::iter(chunks.into_iter().map(Ok::<String, std::io::Error>));
            sse_response(Body::from_stream(head.chain(stream::pending())))
        }
    }
}

async fn models() -> Json<Value> {
    Json(json!({
        "data": [
            {
                "id": MODEL,
                "name": "GPT-4o mini",
                "context_length": 128000,
                "pricing": {"prompt": "0.00000015", "completion": "0.0000006"},
                "supported_parameters": ["tools", "temperature"]
            }
        ]
    }))
}

fn sse_response(body: Body) -> Response {
    Response::builder()
        .header("content-type", "text/event-stream")
        .body(body)
        .unwrap()
}

// -- Chunk builders --

pub fn chunk(value: Value) -> String {
    format!("data: {value}\n\n")
}

pub fn done() -> String {
    "data: [DONE]\n\n".to_string()
}

pub fn usage(prompt: u32, completion: u32) -> String {
    chunk(json!({
        "choices": [],
        "usage": {
            "prompt_tokens": prompt,
            "completion_tokens": completion,
            "total_tokens": prompt + completion
        }
    }))
}

pub fn text_deltas(parts: &[&str]) -> Vec<String> {
    parts
        .iter()
        .map(|p| chunk(json!({"model": MODEL, "choices": [{"index": 0, "delta": {"content": p}}]})))
        .collect()
}

/// A complete streamed text answer.
pub fn text_reply(parts: &[&str], prompt: u32, completion: u32) -> Reply {
    let mut chunks = vec![": OPENROUTER PROCESSING\n\n".to_string()];
    chunks.extend(text_deltas(parts));
    chunks.push(chunk(
        json!({"choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}]}),
    ));
    chunks.push(usage(prompt, completion));
    chunks.push(done());
    Reply::Sse(chunks)
}

/// A streamed tool call whose arguments arrive in fragments.
pub fn tool_call_reply(id: &str, name: &str, argument_parts: &[&str]) -> Reply {
    let mut chunks = vec![chunk(json!({
        "model": MODEL,
        "choices": [{"index": 0, "delta": {
            "role": "assistant",
            "content": null,
            "tool_calls": [{"index": 0, "id": id, "type": "function",
                            "function": {"name": name, "arguments": ""}}]
        }}]
    }))];
    for part in argument_parts {
        chunks.push(chunk(json!({
            "choices": [{"index": 0, "delta": {
                "tool_calls": [{"index": 0, "function": {"arguments": part}}]
            }}]
        })));
    }
    chunks.push(chunk(
        json!({"choices": [{"index": 0, "delta": {}, "finish_reason": "tool_calls"}]}),
    ));
    chunks.push(usage(100, 20));
    chunks.push(done());
    Reply::Sse(chunks)
}

// -- Pages for web_fetch --

pub const ARTICLE_SENTENCE: &str = "Rust keeps memory safe without a garbage collector. ";

/// Serves a handful of fixed pages on 127.0.0.1.
pub struct PageServer {
    pub addr: SocketAddr,
}

impl PageServer {
    pub async fn start() -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new()
            .route("/article", get(article))
            .route("/fragment", get(fragment))
            .route("/plain", get(plain))
            .route("/huge", get(huge))
            .route("/hop", get(hop))
            .route("/away", get(away))
            .route("/slow", get(slow))
            .with_state(addr);
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self { addr }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }
}

async fn article() -> Response {
    let html = format!(
        "<!DOCTYPE html><html><head><title>Borrowing</title>\
         <style>p {{ color: red }}</style><script>var tracking = true;</script></head>\
         <body><h1>Ownership</h1><p>{}</p></body></html>",
        ARTICLE_SENTENCE.repeat(40)
    );
    ([(header::CONTENT_TYPE, "text/html; charset=utf-8")], html).into_response()
}

/// An HTML fragment served without any content type.
async fn fragment() -> Response {
    Response::builder()
        .body(Body::from("<div><script>steal()</script>hi there</div>"))
        .unwrap()
}

async fn plain() -> Response {
    ([(header::CONTENT_TYPE, "text/plain")], "<b>not   markup</b>").into_response()
}

async fn huge() -> Response {
    ([(header::CONTENT_TYPE, "text/plain")], "a".repeat(2 * 1024 * 1024)).into_response()
}

async fn hop() -> Response {
    (StatusCode::FOUND, [(header::LOCATION, "/article")]).into_response()
}

/// Redirects to the same server under a host name that is not allow-listed.
async fn away(State(addr): State<SocketAddr>) -> Response {
    let target = format!("http://localhost:{}/article", addr.port());
    (StatusCode::FOUND, [(header::LOCATION, target)]).into_response()
}

async fn slow() -> Response {
    std::future::pending::<()>().await;
    StatusCode::OK.into_response()
}
