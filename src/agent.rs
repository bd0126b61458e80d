//! Streamed multi-turn agent loop.
//!
//! Each turn streams the conversation to the model, forwards text deltas as
//! events, executes any requested tools, appends the results, and repeats
//! until the model answers without tools or a hard stop is hit (max turns,
//! cost limit, cancellation, upstream failure).

use crate::cancel::CancelToken;
use crate::catalog::Catalog;
use crate::config::AgentConfig;
use crate::llm::{ChatMessage, FinishReason, LlmClient, ToolCall, ToolDef, Usage};
use crate::session::{RunStatus, Session, UsageLog, UsageRow};
use crate::tools::ToolBox;
use chrono::Utc;
use serde::Serialize;
use std::time::Instant;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

pub const CANCELLED_MARKER: &str = "[cancelled]";

/// Progress reported to the caller while a run is in flight.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    Token {
        text: String,
    },
    ToolCall {
        id: String,
        name: String,
        arguments: String,
    },
    ToolResult {
        id: String,
        name: String,
        output: String,
        is_error: bool,
    },
    Notice {
        message: String,
    },
    Error {
        message: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub turns: u32,
    pub tool_calls: u32,
    pub usage: Usage,
    pub cost_usd: f64,
    pub final_text: String,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunOutcome {
    fn new(model: &str) -> Self {
        Self {
            status: RunStatus::Ok,
            turns: 0,
            tool_calls: 0,
            usage: Usage::default(),
            cost_usd: 0.0,
            final_text: String::new(),
            model: model.to_string(),
            error: None,
        }
    }
}

pub struct Agent<'a> {
    llm: &'a LlmClient,
    tools: &'a ToolBox,
    config: &'a AgentConfig,
    catalog: &'a Catalog,
    usage_log: Option<&'a UsageLog>,
}

impl<'a> Agent<'a> {
    pub fn new(
        llm: &'a LlmClient,
        tools: &'a ToolBox,
        config: &'a AgentConfig,
        catalog: &'a Catalog,
    ) -> Self {
        Self {
            llm,
            tools,
            config,
            catalog,
            usage_log: None,
        }
    }

    pub fn with_usage_log(mut self, log: &'a UsageLog) -> Self {
        self.usage_log = Some(log);
        self
    }

    /// Tools are withheld from models the catalog knows cannot call them.
    fn tools_for(&self, model: &str) -> Vec<ToolDef> {
        match self.catalog.get(model) {
            Some(info) if !info.supports_tools => {
                debug!(model, "model does not support tools, sending none");
                Vec::new()
            }
            _ => self.tools.definitions(),
        }
    }

    /// Run one user message to completion against `session`.
    ///
    /// Never fails: upstream errors are reported through `events` and the outcome,
    /// and the transcript keeps everything received before the stop.
    pub async fn run(
        &self,
        session: &mut Session,
        user_message: &str,
        events: &UnboundedSender<AgentEvent>,
        cancel: &CancelToken,
    ) -> RunOutcome {
        let llm = self.llm.with_model(&session.model);
        let tools = self.tools_for(&session.model);
        let mut outcome = RunOutcome::new(&session.model);

        session.push(ChatMessage::user(user_message));

        info!(
            session = %session.id,
            model = %session.model,
            max_turns = self.config.max_turns,
            cost_limit = self.config.cost_limit_usd,
            "starting agent run"
        );

        loop {
            if events.is_closed() {
                cancel.cancel();
            }
            if cancel.is_cancelled() {
                info!(session = %session.id, turns = outcome.turns, "run cancelled between turns");
                session.push(ChatMessage::assistant(CANCELLED_MARKER.to_string()));
                outcome.status = RunStatus::Cancelled;
                break;
            }
            if outcome.turns >= self.config.max_turns {
                warn!(turns = outcome.turns, "hit max turns limit");
                self.hard_stop(
                    session,
                    events,
                    format!("Stopped: reached the limit of {} turns.", self.config.max_turns),
                );
                break;
            }
            if outcome.cost_usd >= self.config.cost_limit_usd && outcome.turns > 0 {
                warn!(
                    cost = outcome.cost_usd,
                    limit = self.config.cost_limit_usd,
                    "hit cost limit"
                );
                self.hard_stop(
                    session,
                    events,
                    format!(
                        "Stopped: cost ${:.4} reached the ${:.2} limit.",
                        outcome.cost_usd, self.config.cost_limit_usd
                    ),
                );
                break;
            }

            let messages = session.chat_messages(&self.config.system_prompt);
            let started = Instant::now();
            let result = llm
                .stream_chat(
                    &messages,
                    &tools,
                    &session.params,
                    |delta| {
                        emit(
                            events,
                            cancel,
                            AgentEvent::Token {
                                text: delta.to_string(),
                            },
                        )
                    },
                    cancel,
                )
                .await;
            let latency_ms = started.elapsed().as_millis() as u64;

            let turn = match result {
                Ok(turn) => turn,
                Err(e) => {
                    warn!(error = %e, session = %session.id, "LLM stream failed");
                    let message = if e.is_upstream() {
                        format!("Request to the model failed: {e}")
                    } else {
                        e.to_string()
                    };
                    let _ = events.send(AgentEvent::Error {
                        message: message.clone(),
                    });
                    self.log_usage(session, &Usage::default(), 0.0, latency_ms, 0, RunStatus::Error);
                    outcome.status = RunStatus::Error;
                    outcome.error = Some(message);
                    break;
                }
            };

            outcome.turns += 1;
            outcome.usage.add(&turn.usage);
            let cost = self.catalog.estimate_cost_usd(&turn.usage, &session.model);
            outcome.cost_usd += cost;
            session.record_usage(&turn.usage, cost);

            debug!(
                turn = outcome.turns,
                finish = ?turn.finish,
                cost = format!("${:.4}", outcome.cost_usd),
                "agent turn"
            );

            if turn.finish == FinishReason::Cancelled {
                info!(session = %session.id, "run cancelled");
                let text = if turn.content.is_empty() {
                    CANCELLED_MARKER.to_string()
                } else {
                    format!("{} {CANCELLED_MARKER}", turn.content)
                };
                session.push(ChatMessage::assistant(text));
                outcome.final_text = turn.content;
                outcome.status = RunStatus::Cancelled;
                self.log_usage(session, &turn.usage, cost, latency_ms, 0, RunStatus::Cancelled);
                break;
            }

            if !turn.tool_calls.is_empty() {
                let calls = turn.tool_calls.clone();
                session.push(ChatMessage::assistant_tool_calls(
                    turn.content,
                    turn.tool_calls,
                ));
                let completed = self.execute_tools(session, &calls, events, cancel).await;
                outcome.tool_calls += calls.len() as u32;
                if !completed {
                    outcome.status = RunStatus::Cancelled;
                    self.log_usage(
                        session,
                        &turn.usage,
                        cost,
                        latency_ms,
                        calls.len() as u32,
                        RunStatus::Cancelled,
                    );
                    break;
                }
                self.log_usage(
                    session,
                    &turn.usage,
                    cost,
                    latency_ms,
                    calls.len() as u32,
                    RunStatus::Ok,
                );
                continue;
            }

            if turn.finish == FinishReason::Length {
                let _ = events.send(AgentEvent::Notice {
                    message: "Response was cut off at max_tokens.".into(),
                });
            }
            session.push(ChatMessage::assistant(turn.content.clone()));
            outcome.final_text = turn.content;
            self.log_usage(session, &turn.usage, cost, latency_ms, 0, RunStatus::Ok);
            break;
        }

        info!(
            session = %session.id,
            status = ?outcome.status,
            turns = outcome.turns,
            tool_calls = outcome.tool_calls,
            cost = format!("${:.4}", outcome.cost_usd),
            "agent run complete"
        );
        outcome
    }

    /// Execute each call and append its result. Returns false if cancelled part-way.
    ///
    /// Every call gets a result message, even after cancellation, so the
    /// transcript stays valid for the next request.
    async fn execute_tools(
        &self,
        session: &mut Session,
        calls: &[ToolCall],
        events: &UnboundedSender<AgentEvent>,
        cancel: &CancelToken,
    ) -> bool {
        let mut completed = true;
        for call in calls {
            emit(
                events,
                cancel,
                AgentEvent::ToolCall {
                    id: call.id.clone(),
                    name: call.function.name.clone(),
                    arguments: call.function.arguments.clone(),
                },
            );

            let (output, is_error) = if cancel.is_cancelled() {
                completed = false;
                (CANCELLED_MARKER.to_string(), true)
            } else {
                match call.parsed_arguments() {
                    Err(e) => (format!("Invalid JSON arguments: {e}"), true),
                    Ok(input) => {
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => {
                                completed = false;
                                (CANCELLED_MARKER.to_string(), true)
                            }
                            result = self.tools.dispatch(&call.function.name, &input) => result,
                        }
                    }
                }
            };
            debug!(tool = %call.function.name, is_error, "tool finished");

            emit(
                events,
                cancel,
                AgentEvent::ToolResult {
                    id: call.id.clone(),
                    name: call.function.name.clone(),
                    output: output.clone(),
                    is_error,
                },
            );
            session.push(ChatMessage::tool_result(call, output));
        }
        completed
    }

    fn hard_stop(&self, session: &mut Session, events: &UnboundedSender<AgentEvent>, message: String) {
        let _ = events.send(AgentEvent::Notice {
            message: message.clone(),
        });
        session.push(ChatMessage::assistant(format!("[{message}]")));
    }

    fn log_usage(
        &self,
        session: &Session,
        usage: &Usage,
        cost_usd: f64,
        latency_ms: u64,
        tool_calls: u32,
        status: RunStatus,
    ) {
        let Some(log) = self.usage_log else { return };
        let row = UsageRow {
            timestamp: Utc::now(),
            session_id: session.id.to_string(),
            model: session.model.clone(),
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
            cost_usd,
            latency_ms,
            tool_calls,
            status,
        };
        if let Err(e) = log.append(&row) {
            warn!(error = %e, path = %log.path().display(), "failed to append usage row");
        }
    }
}

/// Forward an event. A closed receiver means the client went away, so the run cancels.
fn emit(events: &UnboundedSender<AgentEvent>, cancel: &CancelToken, event: AgentEvent) {
    if events.send(event).is_err() {
        cancel.cancel();
    }
}
