//! Model catalog: ids, context windows, and pricing used for cost accounting.

use crate::error::{Error, Result};
use crate::llm::{LlmClient, Usage};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub name: String,
    pub context_length: u32,
    /// USD per million prompt tokens.
    pub prompt_price: f64,
    /// USD per million completion tokens.
    pub completion_price: f64,
    pub supports_tools: bool,
}

impl ModelInfo {
    fn builtin(
        id: &str,
        name: &str,
        context_length: u32,
        prompt_price: f64,
        completion_price: f64,
        supports_tools: bool,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            context_length,
            prompt_price,
            completion_price,
            supports_tools,
        }
    }

    pub fn is_free(&self) -> bool {
        self.prompt_price == 0.0 && self.completion_price == 0.0
    }

    pub fn cost_usd(&self, usage: &Usage) -> f64 {
        (f64::from(usage.prompt_tokens) * self.prompt_price
            + f64::from(usage.completion_tokens) * self.completion_price)
            / 1_000_000.0
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Catalog {
    models: Vec<ModelInfo>,
}

// -- OpenRouter /models format --

#[derive(Deserialize)]
struct ModelsResponse {
    data: Vec<WireModel>,
}

#[derive(Deserialize)]
struct WireModel {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    context_length: Option<u32>,
    #[serde(default)]
    pricing: Option<WirePricing>,
    #[serde(default)]
    supported_parameters: Option<Vec<String>>,
}

/// Prices arrive as decimal strings in USD per token.
#[derive(Deserialize)]
struct WirePricing {
    #[serde(default)]
    prompt: Option<String>,
    #[serde(default)]
    completion: Option<String>,
}

fn per_token_to_per_million(price: Option<&str>) -> f64 {
    price
        .and_then(|p| p.trim().parse::<f64>().ok())
        .filter(|p| p.is_finite() && *p >= 0.0)
        .map(|p| p * 1_000_000.0)
        .unwrap_or(0.0)
}

impl Catalog {
    pub fn new(models: Vec<ModelInfo>) -> Self {
        Self { models }
    }

    pub fn builtin() -> Self {
        Self::new(vec![
            ModelInfo::builtin("openai/gpt-4o-mini", "OpenAI: GPT-4o-mini", 128_000, 0.15, 0.60, true),
            ModelInfo::builtin("openai/gpt-4o", "OpenAI: GPT-4o", 128_000, 2.50, 10.00, true),
            ModelInfo::builtin(
                "anthropic/claude-3.5-haiku",
                "Anthropic: Claude 3.5 Haiku",
                200_000,
                0.80,
                4.00,
                true,
            ),
            ModelInfo::builtin(
                "anthropic/claude-3.5-sonnet",
                "Anthropic: Claude 3.5 Sonnet",
                200_000,
                3.00,
                15.00,
                true,
            ),
            ModelInfo::builtin(
                "google/gemini-flash-1.5",
                "Google: Gemini Flash 1.5",
                1_000_000,
                0.075,
                0.30,
                true,
            ),
            ModelInfo::builtin(
                "meta-llama/llama-3.1-8b-instruct",
                "Meta: Llama 3.1 8B Instruct",
                131_072,
                0.02,
                0.05,
                false,
            ),
            ModelInfo::builtin(
                "mistralai/mistral-7b-instruct:free",
                "Mistral: Mistral 7B Instruct (free)",
                32_768,
                0.0,
                0.0,
                false,
            ),
        ])
    }

    /// Parse an OpenRouter `/models` body.
    pub fn from_openrouter_json(body: &str) -> Result<Self> {
        let resp: ModelsResponse = serde_json::from_str(body)
            .map_err(|e| Error::parse(format!("parse model list: {e}")))?;
        let models = resp
            .data
            .into_iter()
            .map(|m| {
                let pricing = m.pricing.as_ref();
                ModelInfo {
                    name: m.name.unwrap_or_else(|| m.id.clone()),
                    context_length: m.context_length.unwrap_or(0),
                    prompt_price: per_token_to_per_million(
                        pricing.and_then(|p| p.prompt.as_deref()),
                    ),
                    completion_price: per_token_to_per_million(
                        pricing.and_then(|p| p.completion.as_deref()),
                    ),
                    supports_tools: m
                        .supported_parameters
                        .is_some_and(|params| params.iter().any(|p| p == "tools")),
                    id: m.id,
                }
            })
            .collect();
        Ok(Self::new(models))
    }

    /// Load `GET {base}/models` from the provider.
    pub async fn fetch(llm: &LlmClient) -> Result<Self> {
        let url = format!("{}/models", llm.base_url());
        let body = llm.http().get_text_authed(&url, llm.api_key()).await?;
        Self::from_openrouter_json(&body)
    }

    /// Fetch the live model list, falling back to the built-in catalog on any failure.
    pub async fn fetch_or_builtin(llm: &LlmClient) -> Self {
        match Self::fetch(llm).await {
            Ok(catalog) if !catalog.models.is_empty() => {
                info!(count = catalog.models.len(), "loaded model catalog");
                catalog
            }
            Ok(_) => {
                warn!("model list was empty, using built-in catalog");
                Self::builtin()
            }
            Err(e) => {
                warn!(error = %e, "failed to fetch model list, using built-in catalog");
                Self::builtin()
            }
        }
    }

    pub fn models(&self) -> &[ModelInfo] {
        &self.models
    }

    pub fn get(&self, id: &str) -> Option<&ModelInfo> {
        self.models.iter().find(|m| m.id == id)
    }

    /// Estimated cost of `usage` on `model`. Unknown and `:free` models cost nothing.
    pub fn estimate_cost_usd(&self, usage: &Usage, model: &str) -> f64 {
        if model.ends_with(":free") {
            return 0.0;
        }
        self.get(model).map(|m| m.cost_usd(usage)).unwrap_or(0.0)
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Self::builtin()
    }
}
