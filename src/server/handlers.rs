use super::{SharedState, page};
use crate::advisor::{self, ParamViolation, Requirements, TaskProfile};
use crate::agent::{Agent, AgentEvent, RunOutcome};
use crate::catalog::ModelInfo;
use crate::error::Error;
use crate::llm::SamplingParams;
use crate::session::{ModelUsage, Session, SessionSummary};
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::{
        Html, IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
};
use futures::{Stream, StreamExt, stream};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::convert::Infallible;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};
use uuid::Uuid;

const MAX_MESSAGE_CHARS: usize = 32_000;

// -- Errors --

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
    violations: Vec<ParamViolation>,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            violations: Vec::new(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn invalid_params(violations: Vec<ParamViolation>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: "invalid parameters".into(),
            violations,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        let status = match &e {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::LegacySession(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Error::Config(_) => StatusCode::BAD_REQUEST,
            Error::RateLimit { .. } => StatusCode::TOO_MANY_REQUESTS,
            Error::Http(_) | Error::Api { .. } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(status = %self.status, error = %self.message, "request failed");
        }
        let body = if self.violations.is_empty() {
            json!({ "error": self.message })
        } else {
            json!({ "error": self.message, "violations": self.violations })
        };
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

// -- Pages and metadata --

pub(super) async fn index(State(state): State<SharedState>) -> ApiResult<Html<String>> {
    let params = SamplingParams {
        max_tokens: state.config.llm.max_tokens,
        ..SamplingParams::default()
    };
    let mut tools = state.tools.definitions().into_iter().map(|d| d.name).collect::<Vec<_>>();
    tools.sort();
    let html = page::render_index(
        state.catalog.models(),
        state.llm.model(),
        params,
        tools,
        state.config.agent.max_turns,
        state.config.agent.cost_limit_usd,
    )?;
    Ok(Html(html))
}

pub(super) async fn health() -> &'static str {
    "OK"
}

pub(super) async fn models(State(state): State<SharedState>) -> Json<Vec<ModelInfo>> {
    Json(state.catalog.models().to_vec())
}

#[derive(Deserialize)]
pub(super) struct RecommendRequest {
    profile: String,
}

pub(super) async fn recommend(Json(req): Json<RecommendRequest>) -> ApiResult<impl IntoResponse> {
    let profile = TaskProfile::from_name(&req.profile).ok_or_else(|| {
        ApiError::bad_request(format!(
            "unknown profile '{}': expected factual, coding, creative, or chat",
            req.profile
        ))
    })?;
    Ok(Json(advisor::recommend(profile)))
}

pub(super) async fn cheapest(
    State(state): State<SharedState>,
    Json(req): Json<Requirements>,
) -> ApiResult<Response> {
    match advisor::cheapest_model(&state.catalog, &req) {
        Some(pick) => Ok(Json(pick).into_response()),
        None => Err(ApiError::new(
            StatusCode::NOT_FOUND,
            "no model in the catalog meets the requirements",
        )),
    }
}

#[derive(Deserialize)]
pub(super) struct OptimizeRequest {
    prompt: String,
}

pub(super) async fn optimize(
    State(state): State<SharedState>,
    Json(req): Json<OptimizeRequest>,
) -> ApiResult<impl IntoResponse> {
    if req.prompt.trim().is_empty() {
        return Err(ApiError::bad_request("prompt must not be empty"));
    }
    let suggestion = advisor::optimize_prompt(&state.llm, &req.prompt)
        .await
        .map_err(|e| match e {
            // An unparseable model reply is still an upstream failure.
            Error::Parse(msg) => ApiError::new(StatusCode::BAD_GATEWAY, msg),
            other => other.into(),
        })?;
    Ok(Json(suggestion))
}

// -- Chat --

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub session_id: Option<Uuid>,
    #[serde(default)]
    pub model: Option<String>,
    pub message: String,
    #[serde(default)]
    pub params: Option<SamplingParams>,
}

#[derive(Serialize)]
struct RunStarted {
    run_id: Uuid,
    session_id: Uuid,
    model: String,
}

#[derive(Serialize)]
struct RunDone {
    run_id: Uuid,
    session_id: Uuid,
    saved: bool,
    #[serde(flatten)]
    outcome: RunOutcome,
}

fn event_name(event: &AgentEvent) -> &'static str {
    match event {
        AgentEvent::Token { .. } => "token",
        AgentEvent::ToolCall { .. } => "tool_call",
        AgentEvent::ToolResult { .. } => "tool_result",
        AgentEvent::Notice { .. } => "notice",
        AgentEvent::Error { .. } => "error",
    }
}

fn sse_event<T: Serialize>(name: &str, payload: &T) -> Event {
    match Event::default().event(name).json_data(payload) {
        Ok(event) => event,
        Err(e) => Event::default()
            .event("error")
            .data(json!({ "type": "error", "message": format!("serialize {name}: {e}") }).to_string()),
    }
}

pub(super) async fn chat(
    State(state): State<SharedState>,
    Json(req): Json<ChatRequest>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let message = req.message.trim().to_string();
    if message.is_empty() {
        return Err(ApiError::bad_request("message must not be empty"));
    }
    if message.chars().count() > MAX_MESSAGE_CHARS {
        return Err(ApiError::bad_request(format!(
            "message longer than {MAX_MESSAGE_CHARS} characters"
        )));
    }
    if let Some(model) = &req.model
        && model.trim().is_empty()
    {
        return Err(ApiError::bad_request("model must not be empty"));
    }

    let session_id = req.session_id.unwrap_or_else(Uuid::new_v4);
    let guard = state.try_lock_session(&session_id).ok_or_else(|| {
        ApiError::new(StatusCode::CONFLICT, "a run is already active for this session")
    })?;

    let mut session = match req.session_id {
        Some(id) => state.store.load(&id)?,
        None => {
            let params = SamplingParams {
                max_tokens: state.config.llm.max_tokens,
                ..SamplingParams::default()
            };
            let mut session = Session::new(state.llm.model(), params);
            session.id = session_id;
            session
        }
    };
    if let Some(model) = req.model {
        session.model = model.trim().to_string();
    }
    if let Some(params) = req.params {
        session.params = params;
    }

    let violations = advisor::validate_params(&session.params, state.catalog.get(&session.model));
    if !violations.is_empty() {
        return Err(ApiError::invalid_params(violations));
    }
    if state.catalog.get(&session.model).is_none() {
        warn!(model = %session.model, "model not in catalog, cost will be recorded as 0");
    }

    let (run_id, cancel) = state.register_run();
    let started = sse_event(
        "run",
        &RunStarted {
            run_id,
            session_id: session.id,
            model: session.model.clone(),
        },
    );
    info!(run = %run_id, session = %session.id, model = %session.model, "chat run started");

    let (tx, rx) = mpsc::unbounded_channel::<AgentEvent>();
    let (done_tx, done_rx) = oneshot::channel::<RunDone>();
    let task_state = state.clone();
    tokio::spawn(async move {
        let agent = Agent::new(
            &task_state.llm,
            &task_state.tools,
            &task_state.config.agent,
            &task_state.catalog,
        )
        .with_usage_log(&task_state.usage);
        let outcome = agent.run(&mut session, &message, &tx, &cancel).await;

        let saved = match task_state.store.save(&session) {
            Ok(_) => true,
            Err(e) => {
                error!(session = %session.id, error = %e, "failed to save session");
                false
            }
        };
        task_state.finish_run(&run_id);
        // Release before `done` so a follow-up message is not refused.
        drop(guard);
        drop(tx);
        let _ = done_tx.send(RunDone {
            run_id,
            session_id: session.id,
            saved,
            outcome,
        });
    });

    let events = stream::unfold(rx, |mut rx| async move {
        rx.recv()
            .await
            .map(|event| (sse_event(event_name(&event), &event), rx))
    });
    let done = stream::once(async move {
        match done_rx.await {
            Ok(done) => sse_event("done", &done),
            Err(_) => sse_event(
                "error",
                &AgentEvent::Error {
                    message: "run ended unexpectedly".into(),
                },
            ),
        }
    });
    let body = stream::once(async move { started })
        .chain(events)
        .chain(done)
        .map(Ok::<Event, Infallible>);

    Ok(Sse::new(body).keep_alive(KeepAlive::default()))
}

pub(super) async fn cancel_run(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    if !state.cancel_run(&id) {
        return Err(Error::not_found(format!("run {id}")).into());
    }
    info!(run = %id, "cancel requested");
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "run_id": id, "cancelled": true })),
    ))
}

// -- Sessions and usage --

pub(super) async fn list_sessions(
    State(state): State<SharedState>,
) -> ApiResult<Json<Vec<SessionSummary>>> {
    Ok(Json(state.store.list()?))
}

pub(super) async fn get_session(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Session>> {
    Ok(Json(state.store.load(&id)?))
}

pub(super) async fn delete_session(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    let _guard = state.try_lock_session(&id).ok_or_else(|| {
        ApiError::new(StatusCode::CONFLICT, "a run is active for this session")
    })?;
    state.store.delete(&id)?;
    info!(session = %id, "session deleted");
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Serialize)]
pub(super) struct UsageReport {
    models: Vec<ModelUsage>,
    requests: u32,
    total_cost_usd: f64,
}

pub(super) async fn usage(State(state): State<SharedState>) -> ApiResult<Json<UsageReport>> {
    let models = state.usage.summary()?;
    Ok(Json(UsageReport {
        requests: models.iter().map(|m| m.requests).sum(),
        total_cost_usd: models.iter().map(|m| m.cost_usd).sum(),
        models,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_map_to_status_codes() {
        let cases = [
            (Error::not_found("session x"), StatusCode::NOT_FOUND),
            (Error::LegacySession("x.json".into()), StatusCode::UNPROCESSABLE_ENTITY),
            (Error::api_with_status("openrouter", "boom", 500), StatusCode::BAD_GATEWAY),
            (
                Error::RateLimit {
                    platform: "openrouter".into(),
                    retry_after_secs: Some(5),
                },
                StatusCode::TOO_MANY_REQUESTS,
            ),
            (Error::parse("bad"), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status(), status);
        }
    }

    #[test]
    fn event_names_match_wire_tags() {
        let events = [
            AgentEvent::Token { text: "a".into() },
            AgentEvent::Notice {
                message: "n".into(),
            },
            AgentEvent::Error {
                message: "e".into(),
            },
        ];
        for event in events {
            let tag = serde_json::to_value(&event).unwrap()["type"].clone();
            assert_eq!(tag, event_name(&event));
        }
    }

    #[test]
    fn chat_request_defaults_optional_fields() {
        let req: ChatRequest = serde_json::from_str(r#"{"message": "hi"}"#).unwrap();
        assert!(req.session_id.is_none());
        assert!(req.params.is_none());
        let req: ChatRequest =
            serde_json::from_str(r#"{"message": "hi", "params": {"temperature": 0.2}}"#).unwrap();
        assert_eq!(req.params.unwrap().max_tokens, 1024);
    }
}
