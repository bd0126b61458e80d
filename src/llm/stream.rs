//! Server-sent event framing and streamed chat-completion deltas.
//!
//! `SseParser` turns arbitrary byte chunks into complete `data:` payloads.
//! `TurnAccumulator` folds those payloads (OpenAI streaming chunk JSON) into
//! a `TurnResponse`, stitching tool-call fragments back together by index.

use super::types::{FinishReason, ToolCall, TurnResponse, Usage};
use crate::error::{Error, Result};
use serde::Deserialize;

pub const DONE_SENTINEL: &str = "[DONE]";

#[derive(Debug, Default)]
pub struct SseParser {
    buf: Vec<u8>,
    data: Option<String>,
}

impl SseParser {
    /// Feed one network chunk, returning every event payload it completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buf.drain(..=pos).collect();
            // A line ends at an ASCII newline, so it never splits a UTF-8 sequence.
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);
            self.handle_line(line, &mut events);
        }

        events
    }

    /// Flush a trailing event that was not terminated by a blank line.
    pub fn finish(&mut self) -> Vec<String> {
        let mut events = Vec::new();
        if !self.buf.is_empty() {
            let raw = std::mem::take(&mut self.buf);
            let line = String::from_utf8_lossy(&raw).trim_end_matches('\r').to_string();
            self.handle_line(&line, &mut events);
        }
        if let Some(data) = self.data.take() {
            events.push(data);
        }
        events
    }

    fn handle_line(&mut self, line: &str, events: &mut Vec<String>) {
        if line.is_empty() {
            if let Some(data) = self.data.take() {
                events.push(data);
            }
            return;
        }
        // Comment lines, e.g. ": OPENROUTER PROCESSING" keep-alives.
        if line.starts_with(':') {
            return;
        }
        if let Some(rest) = line.strip_prefix("data:") {
            let rest = rest.strip_prefix(' ').unwrap_or(rest);
            match &mut self.data {
                Some(data) => {
                    data.push('\n');
                    data.push_str(rest);
                }
                None => self.data = Some(rest.to_string()),
            }
        }
    }
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<Usage>,
    #[serde(default)]
    error: Option<WireError>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Option<Delta>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Deserialize)]
struct ToolCallDelta {
    #[serde(default)]
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<FunctionDelta>,
}

#[derive(Deserialize)]
struct FunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Deserialize)]
pub(crate) struct WireError {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub code: Option<serde_json::Value>,
}

#[derive(Debug, Default)]
struct PartialToolCall {
    index: usize,
    id: String,
    name: String,
    arguments: String,
}

#[derive(Debug, Default)]
pub struct TurnAccumulator {
    content: String,
    tool_calls: Vec<PartialToolCall>,
    usage: Option<Usage>,
    finish: Option<String>,
    model: Option<String>,
}

impl TurnAccumulator {
    /// Apply one event payload. Returns the text delta it carried, if any.
    pub fn apply(&mut self, payload: &str) -> Result<Option<String>> {
        let chunk: StreamChunk = serde_json::from_str(payload)
            .map_err(|e| Error::parse(format!("parse stream chunk: {e}\nraw: {payload}")))?;

        if let Some(err) = chunk.error {
            let code = err.code.map(|c| c.to_string()).unwrap_or_default();
            return Err(Error::api(
                "openrouter",
                format!("stream error {code}: {}", err.message),
            ));
        }

        if chunk.model.is_some() {
            self.model = chunk.model;
        }
        if let Some(usage) = chunk.usage {
            self.usage = Some(usage);
        }

        let mut text = String::new();
        for choice in chunk.choices {
            if let Some(reason) = choice.finish_reason {
                self.finish = Some(reason);
            }
            let Some(delta) = choice.delta else { continue };
            if let Some(content) = delta.content {
                text.push_str(&content);
            }
            for call in delta.tool_calls.unwrap_or_default() {
                self.merge_tool_call(call);
            }
        }

        if text.is_empty() {
            return Ok(None);
        }
        self.content.push_str(&text);
        Ok(Some(text))
    }

    fn merge_tool_call(&mut self, delta: ToolCallDelta) {
        let slot = match self.tool_calls.iter_mut().position(|c| c.index == delta.index) {
            Some(i) => &mut self.tool_calls[i],
            None => {
                self.tool_calls.push(PartialToolCall {
                    index: delta.index,
                    ..Default::default()
                });
                let last = self.tool_calls.len() - 1;
                &mut self.tool_calls[last]
            }
        };
        if let Some(id) = delta.id
            && !id.is_empty()
        {
            slot.id = id;
        }
        if let Some(function) = delta.function {
            if let Some(name) = function.name {
                slot.name.push_str(&name);
            }
            if let Some(args) = function.arguments {
                slot.arguments.push_str(&args);
            }
        }
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    /// Close the turn. A cancelled turn keeps its partial text but drops half-built tool calls.
    pub fn finish(self, cancelled: bool) -> TurnResponse {
        let mut calls = self.tool_calls;
        calls.sort_by_key(|c| c.index);
        let tool_calls: Vec<ToolCall> = if cancelled {
            Vec::new()
        } else {
            calls
                .into_iter()
                .filter(|c| !c.name.is_empty())
                .map(|c| {
                    let id = if c.id.is_empty() {
                        format!("call_{}", c.index)
                    } else {
                        c.id
                    };
                    ToolCall::new(id, c.name, c.arguments)
                })
                .collect()
        };

        let finish = if cancelled {
            FinishReason::Cancelled
        } else if !tool_calls.is_empty() {
            FinishReason::ToolCalls
        } else {
            FinishReason::from_wire(self.finish.as_deref())
        };

        let mut usage = self.usage.unwrap_or_default();
        if usage.total_tokens == 0 {
            usage.total_tokens = usage.prompt_tokens + usage.completion_tokens;
        }

        TurnResponse {
            content: self.content,
            tool_calls,
            usage,
            finish,
            model: self.model,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parser_handles_split_lines_and_comments() {
        let mut parser = SseParser::default();
        assert!(parser.feed(b": OPENROUTER PROCESSING\n\nda").is_empty());
        assert!(parser.feed(b"ta: {\"a\":1}").is_empty());
        let events = parser.feed(b"\r\n\r\ndata: [DONE]\n\n");
        assert_eq!(events, vec![r#"{"a":1}"#.to_string(), DONE_SENTINEL.to_string()]);
    }

    #[test]
    fn parser_joins_multiline_data_and_flushes_tail() {
        let mut parser = SseParser::default();
        assert!(parser.feed(b"data: one\ndata: two\n").is_empty());
        assert_eq!(parser.finish(), vec!["one\ntwo".to_string()]);
    }

    #[test]
    fn parser_survives_utf8_split_across_chunks() {
        let payload = "data: caf\u{e9}\n\n".as_bytes();
        let (a, b) = payload.split_at(10);
        let mut parser = SseParser::default();
        assert!(parser.feed(a).is_empty());
        assert_eq!(parser.feed(b), vec!["caf\u{e9}".to_string()]);
    }

    #[test]
    fn accumulator_stitches_tool_call_fragments() {
        let mut acc = TurnAccumulator::default();
        let chunks = [
            r#"{"model":"openai/gpt-4o-mini","choices":[{"index":0,"delta":{"role":"assistant","content":null,"tool_calls":[{"index":0,"id":"call_a","type":"function","function":{"name":"calculator","arguments":""}}]}}]}"#,
            r#"{"choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"expression\":"}}]}}]}"#,
            r#"{"choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"function":{"arguments":"\"2*21\"}"}}]},"finish_reason":"tool_calls"}]}"#,
            r#"{"choices":[],"usage":{"prompt_tokens":50,"completion_tokens":12,"total_tokens":62}}"#,
        ];
        for c in chunks {
            assert!(acc.apply(c).unwrap().is_none());
        }
        let turn = acc.finish(false);
        assert_eq!(turn.finish, FinishReason::ToolCalls);
        assert_eq!(turn.tool_calls.len(), 1);
        assert_eq!(turn.tool_calls[0].id, "call_a");
        assert_eq!(
            turn.tool_calls[0].function.arguments,
            r#"{"expression":"2*21"}"#
        );
        assert_eq!(turn.usage.total_tokens, 62);
        assert_eq!(turn.model.as_deref(), Some("openai/gpt-4o-mini"));
    }

    #[test]
    fn accumulator_returns_text_deltas() {
        let mut acc = TurnAccumulator::default();
        let d = acc
            .apply(r#"{"choices":[{"delta":{"content":"Hel"}}]}"#)
            .unwrap();
        assert_eq!(d.as_deref(), Some("Hel"));
        acc.apply(r#"{"choices":[{"delta":{"content":"lo"},"finish_reason":"stop"}]}"#)
            .unwrap();
        let turn = acc.finish(false);
        assert_eq!(turn.content, "Hello");
        assert_eq!(turn.finish, FinishReason::Stop);
    }

    #[test]
    fn cancelled_turn_keeps_text_and_drops_calls() {
        let mut acc = TurnAccumulator::default();
        acc.apply(r#"{"choices":[{"delta":{"content":"partial","tool_calls":[{"index":0,"id":"x","function":{"name":"web_fetch","arguments":"{\"ur"}}]}}]}"#)
            .unwrap();
        let turn = acc.finish(true);
        assert_eq!(turn.finish, FinishReason::Cancelled);
        assert_eq!(turn.content, "partial");
        assert!(turn.tool_calls.is_empty());
    }

    #[test]
    fn mid_stream_error_becomes_api_error() {
        let mut acc = TurnAccumulator::default();
        let err = acc
            .apply(r#"{"error":{"code":502,"message":"provider disconnected"}}"#)
            .unwrap_err();
        assert!(err.to_string().contains("provider disconnected"));
    }
}
