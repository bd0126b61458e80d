//! Tools the agent may call: `calculator`, `current_time`, and `web_fetch`.
//!
//! Every input is validated before use. Failures are returned to the model
//! as error text so the conversation can continue.

pub mod math;
pub mod time;
pub mod web;

use crate::config::ToolsConfig;
use crate::error::{Error, Result};
use crate::llm::ToolDef;
use chrono::Utc;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::debug;
use web::{DomainAllowList, WebFetcher};

pub const CALCULATOR: &str = "calculator";
pub const CURRENT_TIME: &str = "current_time";
pub const WEB_FETCH: &str = "web_fetch";

pub const KNOWN_TOOLS: &[&str] = &[CALCULATOR, CURRENT_TIME, WEB_FETCH];

const MAX_URL_LEN: usize = 2048;

#[derive(Clone)]
pub struct ToolBox {
    enabled: Vec<String>,
    web: WebFetcher,
}

impl ToolBox {
    pub fn from_config(config: &ToolsConfig) -> Result<Self> {
        if let Some(unknown) = config
            .enabled
            .iter()
            .find(|t| !KNOWN_TOOLS.contains(&t.as_str()))
        {
            return Err(Error::config(format!("unknown tool in tools.enabled: {unknown}")));
        }
        if config.max_fetch_chars == 0 {
            return Err(Error::config("tools.max_fetch_chars must be positive"));
        }
        let web = WebFetcher::new(
            DomainAllowList::new(&config.allowed_domains),
            config.max_fetch_chars,
            Duration::from_secs(config.fetch_timeout_secs),
        )?;
        Ok(Self {
            enabled: config.enabled.clone(),
            web,
        })
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.enabled.iter().any(|t| t == name)
    }

    /// Definitions for the enabled tools, in a stable order.
    pub fn definitions(&self) -> Vec<ToolDef> {
        let allowed = self.web.allow_list().domains().join(", ");
        let mut defs = Vec::new();

        if self.is_enabled(CALCULATOR) {
            defs.push(ToolDef {
                name: CALCULATOR.into(),
                description: "Evaluate an arithmetic expression. Supports + - * / % ^, \
                              parentheses, pi, e, and sqrt abs ln log10 sin cos tan floor \
                              ceil round min max."
                    .into(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "expression": {
                            "type": "string",
                            "description": "Expression to evaluate, e.g. '(3 + 4) * 2 ^ 3'."
                        }
                    },
                    "required": ["expression"]
                }),
            });
        }
        if self.is_enabled(CURRENT_TIME) {
            defs.push(ToolDef {
                name: CURRENT_TIME.into(),
                description: "Get the current date and time.".into(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "timezone": {
                            "type": "string",
                            "description": "'UTC' (default) or a fixed offset like '+05:30'."
                        }
                    }
                }),
            });
        }
        if self.is_enabled(WEB_FETCH) {
            defs.push(ToolDef {
                name: WEB_FETCH.into(),
                description: format!(
                    "Fetch a web page and return its visible text (truncated). Only these \
                     domains and their subdomains are allowed: {allowed}."
                ),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "url": {
                            "type": "string",
                            "description": "Absolute http(s) URL."
                        }
                    },
                    "required": ["url"]
                }),
            });
        }
        defs
    }

    /// Dispatch a tool call by name. Returns `(result_text, is_error)`.
    pub async fn dispatch(&self, tool_name: &str, input: &Value) -> (String, bool) {
        if !KNOWN_TOOLS.contains(&tool_name) {
            return (format!("Unknown tool: {tool_name}"), true);
        }
        if !self.is_enabled(tool_name) {
            return (format!("Tool not enabled: {tool_name}"), true);
        }
        if !input.is_object() {
            return ("Tool input must be a JSON object".into(), true);
        }
        debug!(tool = tool_name, "dispatching tool");

        match tool_name {
            CALCULATOR => handle_calculator(input),
            CURRENT_TIME => handle_current_time(input),
            WEB_FETCH => self.handle_web_fetch(input).await,
            _ => (format!("Unknown tool: {tool_name}"), true),
        }
    }

    async fn handle_web_fetch(&self, input: &Value) -> (String, bool) {
        let url = match input["url"].as_str() {
            Some(u) if !u.trim().is_empty() => u,
            _ => return ("Missing 'url' parameter".into(), true),
        };
        if url.len() > MAX_URL_LEN {
            return (format!("URL longer than {MAX_URL_LEN} characters"), true);
        }
        self.web.fetch(url).await
    }
}

fn handle_calculator(input: &Value) -> (String, bool) {
    let expression = match input["expression"].as_str() {
        Some(e) => e,
        None => return ("Missing 'expression' parameter".into(), true),
    };
    match math::evaluate(expression) {
        Ok(v) => (math::format_number(v), false),
        Err(e) => (format!("Invalid expression: {e}"), true),
    }
}

fn handle_current_time(input: &Value) -> (String, bool) {
    let zone = match &input["timezone"] {
        Value::Null => None,
        Value::String(s) => Some(s.as_str()),
        _ => return ("'timezone' must be a string".into(), true),
    };
    match time::describe(Utc::now(), zone) {
        Ok(s) => (s, false),
        Err(e) => (e, true),
    }
}
