pub mod stream;
pub mod types;

pub use types::{
    ChatMessage, FinishReason, FunctionCall, Role, SamplingParams, ToolCall, ToolDef,
    TurnResponse, Usage,
};

use crate::cancel::CancelToken;
use crate::config::LlmConfig;
use crate::error::{Error, Result};
use crate::http::HttpClient;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use stream::{DONE_SENTINEL, SseParser, TurnAccumulator};
use tracing::{debug, warn};
use types::WireTool;

const USER_AGENT: &str = concat!("agent-lab/", env!("CARGO_PKG_VERSION"));
const APP_TITLE: &str = "Agent Lab";
const APP_REFERER: &str = "http://localhost:7860";

/// LLM provider. Determines endpoint and key lookup. Both speak the OpenAI chat format.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    #[default]
    OpenRouter,
    /// Any OpenAI-compatible API (together.ai, local ollama, etc.)
    #[serde(rename = "openai")]
    OpenAi,
}

impl Provider {
    pub fn default_base_url(&self) -> &'static str {
        match self {
            Self::OpenRouter => "https://openrouter.ai/api/v1",
            Self::OpenAi => "http://localhost:11434/v1",
        }
    }

    pub fn default_api_key_env(&self) -> &'static str {
        match self {
            Self::OpenRouter => "OPENROUTER_API_KEY",
            Self::OpenAi => "OPENAI_API_KEY",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "openrouter" => Some(Self::OpenRouter),
            "openai" => Some(Self::OpenAi),
            _ => None,
        }
    }
}

#[derive(Clone)]
pub struct LlmClient {
    provider: Provider,
    api_key: String,
    model: String,
    max_tokens: u32,
    base_url: String,
    http: HttpClient,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool<'a>>,
    max_tokens: u32,
    temperature: f32,
    top_p: f32,
    frequency_penalty: f32,
    presence_penalty: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
}

#[derive(Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCall>>,
}

impl LlmClient {
    pub fn new(
        provider: Provider,
        api_key: String,
        model: String,
        max_tokens: u32,
        base_url: Option<String>,
    ) -> Result<Self> {
        Self::with_timeout(
            provider,
            api_key,
            model,
            max_tokens,
            base_url,
            Duration::from_secs(300),
        )
    }

    pub fn with_timeout(
        provider: Provider,
        api_key: String,
        model: String,
        max_tokens: u32,
        base_url: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let http = HttpClient::new(USER_AGENT, timeout)?;
        let base_url = base_url
            .unwrap_or_else(|| provider.default_base_url().into())
            .trim_end_matches('/')
            .to_string();
        Ok(Self {
            provider,
            api_key,
            model,
            max_tokens,
            base_url,
            http,
        })
    }

    /// Build from config, reading the API key from the configured env var.
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        let api_key = std::env::var(config.api_key_env()).unwrap_or_default();
        Self::with_timeout(
            config.provider.clone(),
            api_key,
            config.model.clone(),
            config.max_tokens,
            config.base_url.clone(),
            Duration::from_secs(config.request_timeout_secs),
        )
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn has_api_key(&self) -> bool {
        !self.api_key.is_empty()
    }

    /// Same credentials and transport, different model.
    pub fn with_model(&self, model: &str) -> Self {
        let mut client = self.clone();
        client.model = model.to_string();
        client
    }

    pub(crate) fn http(&self) -> &HttpClient {
        &self.http
    }

    pub(crate) fn api_key(&self) -> &str {
        &self.api_key
    }

    fn auth_header(&self) -> String {
        format!("Bearer {}", self.api_key)
    }

    fn headers<'a>(&self, auth: &'a str) -> Vec<(&'a str, &'a str)> {
        let mut headers = vec![("Authorization", auth)];
        if self.provider == Provider::OpenRouter {
            headers.push(("HTTP-Referer", APP_REFERER));
            headers.push(("X-Title", APP_TITLE));
        }
        headers
    }

    fn request_body(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDef],
        params: &SamplingParams,
        stream: bool,
    ) -> Result<String> {
        let request = ChatRequest {
            model: &self.model,
            messages,
            tools: tools.iter().map(WireTool::from).collect(),
            max_tokens: params.max_tokens,
            temperature: params.temperature,
            top_p: params.top_p,
            frequency_penalty: params.frequency_penalty,
            presence_penalty: params.presence_penalty,
            seed: params.seed,
            stream,
            stream_options: stream.then_some(StreamOptions {
                include_usage: true,
            }),
        };
        serde_json::to_string(&request).map_err(|e| Error::parse(format!("serialize request: {e}")))
    }

    pub async fn complete(&self, system: &str, user_message: &str) -> Result<String> {
        let messages = [ChatMessage::system(system), ChatMessage::user(user_message)];
        let params = SamplingParams {
            max_tokens: self.max_tokens,
            ..SamplingParams::default()
        };
        let turn = self.converse(&messages, &[], &params).await?;
        if turn.content.is_empty() {
            return Err(Error::parse("empty response from LLM"));
        }
        Ok(turn.content)
    }

    /// Send a prompt and parse the response as JSON, stripping markdown fences if present.
    pub async fn complete_json<T: serde::de::DeserializeOwned>(
        &self,
        system: &str,
        user_message: &str,
    ) -> Result<T> {
        let text = self.complete(system, user_message).await?;
        let json_str = extract_json(&text);
        serde_json::from_str(json_str)
            .map_err(|e| Error::parse(format!("parse LLM JSON: {e}\nraw: {text}")))
    }

    /// One non-streamed, tool-capable turn.
    pub async fn converse(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDef],
        params: &SamplingParams,
    ) -> Result<TurnResponse> {
        debug!(provider = ?self.provider, model = %self.model, "sending LLM request");

        let body = self.request_body(messages, tools, params, false)?;
        let url = format!("{}/chat/completions", self.base_url);
        let auth = self.auth_header();
        let response_text = self
            .http
            .post_json_raw(&url, &body, &self.headers(&auth))
            .await
            .map_err(|e| {
                warn!("LLM API error: {e}");
                e
            })?;

        let resp: ChatResponse = serde_json::from_str(&response_text)
            .map_err(|e| Error::parse(format!("parse LLM response: {e}")))?;

        let choice = resp
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| Error::parse("empty response from LLM"))?;
        let tool_calls = choice.message.tool_calls.unwrap_or_default();
        let finish = if tool_calls.is_empty() {
            FinishReason::from_wire(choice.finish_reason.as_deref())
        } else {
            FinishReason::ToolCalls
        };
        let mut usage = resp.usage.unwrap_or_default();
        if usage.total_tokens == 0 {
            usage.total_tokens = usage.prompt_tokens + usage.completion_tokens;
        }

        Ok(TurnResponse {
            content: choice.message.content.unwrap_or_default(),
            tool_calls,
            usage,
            finish,
            model: resp.model,
        })
    }

    /// One streamed turn. Text deltas go to `on_delta` as they arrive.
    ///
    /// Every network read races `cancel`; a cancelled turn returns what was
    /// received so far with `FinishReason::Cancelled` instead of an error.
    pub async fn stream_chat<F>(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDef],
        params: &SamplingParams,
        mut on_delta: F,
        cancel: &CancelToken,
    ) -> Result<TurnResponse>
    where
        F: FnMut(&str),
    {
        if cancel.is_cancelled() {
            return Ok(TurnAccumulator::default().finish(true));
        }

        debug!(provider = ?self.provider, model = %self.model, "opening LLM stream");
        let body = self.request_body(messages, tools, params, true)?;
        let url = format!("{}/chat/completions", self.base_url);
        let auth = self.auth_header();
        let headers = self.headers(&auth);

        let resp = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(TurnAccumulator::default().finish(true)),
            resp = self.http.post_stream(&url, &body, &headers) => resp.map_err(|e| {
                warn!("LLM API error: {e}");
                e
            })?,
        };

        let mut acc = TurnAccumulator::default();
        let mut parser = SseParser::default();
        let mut bytes = resp.bytes_stream();

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(received = acc.content().len(), "stream cancelled");
                    return Ok(acc.finish(true));
                }
                next = bytes.next() => next,
            };
            let Some(chunk) = next else { break };
            let chunk = chunk.map_err(|e| Error::http(format!("stream read: {e}")))?;

            for event in parser.feed(&chunk) {
                if event == DONE_SENTINEL {
                    return Ok(acc.finish(false));
                }
                if let Some(delta) = acc.apply(&event)? {
                    on_delta(&delta);
                }
            }
        }

        for event in parser.finish() {
            if event == DONE_SENTINEL {
                break;
            }
            if let Some(delta) = acc.apply(&event)? {
                on_delta(&delta);
            }
        }
        Ok(acc.finish(false))
    }
}

/// Extract JSON from a response that might be wrapped in markdown code fences.
pub fn extract_json(text: &str) -> &str {
    if let Some(start) = text.find("```json") {
        let content = &text[start + 7..];
        if let Some(end) = content.find("```") {
            return content[..end].trim();
        }
    }
    if let Some(start) = text.find("```") {
        let content = &text[start + 3..];
        if let Some(end) = content.find("```") {
            let inner = content[..end].trim();
            if inner.starts_with('{') || inner.starts_with('[') {
                return inner;
            }
        }
    }
    if let Some(start) = text.find('{')
        && let Some(end) = text.rfind('}')
    {
        return &text[start..=end];
    }
    text
}
