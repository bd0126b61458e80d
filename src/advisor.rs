//! Parameter validation, task-profile recommendations, and the cost optimizer.

use crate::catalog::{Catalog, ModelInfo};
use crate::error::Result;
use crate::llm::{LlmClient, SamplingParams, Usage};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

pub const MAX_TOKENS_CEILING: u32 = 32_768;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParamViolation {
    pub field: &'static str,
    pub message: String,
}

impl std::fmt::Display for ParamViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Check every parameter and report all violations.
pub fn validate_params(params: &SamplingParams, model: Option<&ModelInfo>) -> Vec<ParamViolation> {
    let mut out = Vec::new();
    let mut check = |ok: bool, field: &'static str, message: String| {
        if !ok {
            out.push(ParamViolation { field, message });
        }
    };

    check(
        params.temperature.is_finite() && (0.0..=2.0).contains(&params.temperature),
        "temperature",
        format!("{} is outside [0, 2]", params.temperature),
    );
    check(
        params.top_p.is_finite() && params.top_p > 0.0 && params.top_p <= 1.0,
        "top_p",
        format!("{} is outside (0, 1]", params.top_p),
    );
    check(
        (1..=MAX_TOKENS_CEILING).contains(&params.max_tokens),
        "max_tokens",
        format!("{} is outside [1, {MAX_TOKENS_CEILING}]", params.max_tokens),
    );
    check(
        params.frequency_penalty.is_finite() && (-2.0..=2.0).contains(&params.frequency_penalty),
        "frequency_penalty",
        format!("{} is outside [-2, 2]", params.frequency_penalty),
    );
    check(
        params.presence_penalty.is_finite() && (-2.0..=2.0).contains(&params.presence_penalty),
        "presence_penalty",
        format!("{} is outside [-2, 2]", params.presence_penalty),
    );
    if let Some(m) = model
        && m.context_length > 0
    {
        check(
            params.max_tokens <= m.context_length,
            "max_tokens",
            format!(
                "{} exceeds the {} token context of {}",
                params.max_tokens, m.context_length, m.id
            ),
        );
    }

    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskProfile {
    Factual,
    Coding,
    Creative,
    Chat,
}

impl TaskProfile {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "factual" => Some(Self::Factual),
            "coding" | "code" => Some(Self::Coding),
            "creative" => Some(Self::Creative),
            "chat" => Some(Self::Chat),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Recommendation {
    pub profile: TaskProfile,
    pub params: SamplingParams,
    pub rationale: &'static str,
}

pub fn recommend(profile: TaskProfile) -> Recommendation {
    let base = SamplingParams::default();
    let (params, rationale) = match profile {
        TaskProfile::Factual => (
            SamplingParams {
                temperature: 0.1,
                top_p: 0.9,
                max_tokens: 1024,
                ..base
            },
            "Low temperature keeps answers grounded and repeatable.",
        ),
        TaskProfile::Coding => (
            SamplingParams {
                temperature: 0.2,
                top_p: 0.95,
                max_tokens: 4096,
                ..base
            },
            "Near-deterministic sampling with room for longer code blocks.",
        ),
        TaskProfile::Creative => (
            SamplingParams {
                temperature: 1.0,
                top_p: 0.95,
                max_tokens: 2048,
                frequency_penalty: 0.5,
                presence_penalty: 0.3,
                ..base
            },
            "Higher temperature and repetition penalties encourage varied prose.",
        ),
        TaskProfile::Chat => (
            SamplingParams {
                temperature: 0.7,
                top_p: 1.0,
                max_tokens: 1024,
                ..base
            },
            "Balanced defaults for conversational turns.",
        ),
    };
    Recommendation {
        profile,
        params,
        rationale,
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Requirements {
    pub min_context: u32,
    pub needs_tools: bool,
    pub expected_prompt_tokens: u32,
    pub expected_completion_tokens: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct CostPick<'a> {
    pub model: &'a ModelInfo,
    pub estimated_cost_usd: f64,
}

/// Cheapest model meeting the requirements. Ties go to the larger context, then the lower id.
pub fn cheapest_model<'a>(catalog: &'a Catalog, req: &Requirements) -> Option<CostPick<'a>> {
    let usage = Usage {
        prompt_tokens: req.expected_prompt_tokens,
        completion_tokens: req.expected_completion_tokens,
        total_tokens: req.expected_prompt_tokens + req.expected_completion_tokens,
    };
    catalog
        .models()
        .iter()
        .filter(|m| m.context_length >= req.min_context)
        .filter(|m| !req.needs_tools || m.supports_tools)
        .map(|m| CostPick {
            model: m,
            estimated_cost_usd: m.cost_usd(&usage),
        })
        .min_by(|a, b| {
            a.estimated_cost_usd
                .partial_cmp(&b.estimated_cost_usd)
                .unwrap_or(Ordering::Equal)
                .then_with(|| b.model.context_length.cmp(&a.model.context_length))
                .then_with(|| a.model.id.cmp(&b.model.id))
        })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptSuggestion {
    pub improved_prompt: String,
    #[serde(default)]
    pub changes: Vec<String>,
}

const OPTIMIZER_PROMPT: &str = r#"You improve prompts for large language models. Rewrite the user's prompt so it is specific, unambiguous, and states the desired output format. Keep the user's intent and language.

Respond with JSON only:
{"improved_prompt": "...", "changes": ["short description of each change"]}"#;

/// Ask the model for a tighter version of `prompt`.
pub async fn optimize_prompt(llm: &LlmClient, prompt: &str) -> Result<PromptSuggestion> {
    llm.complete_json(OPTIMIZER_PROMPT, prompt).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(validate_params(&SamplingParams::default(), None).is_empty());
    }

    #[test]
    fn reports_every_violation() {
        let params = SamplingParams {
            temperature: 3.0,
            top_p: 0.0,
            max_tokens: 0,
            frequency_penalty: -5.0,
            presence_penalty: f32::NAN,
            seed: None,
        };
        let fields: Vec<_> = validate_params(&params, None)
            .into_iter()
            .map(|v| v.field)
            .collect();
        assert_eq!(
            fields,
            vec![
                "temperature",
                "top_p",
                "max_tokens",
                "frequency_penalty",
                "presence_penalty"
            ]
        );
    }

    #[test]
    fn max_tokens_bounded_by_model_context() {
        let catalog = Catalog::builtin();
        let model = catalog.get("mistralai/mistral-7b-instruct:free");
        let params = SamplingParams {
            max_tokens: 32_768,
            ..SamplingParams::default()
        };
        assert!(validate_params(&params, model).is_empty());

        let tiny = ModelInfo {
            context_length: 4096,
            ..catalog.get("openai/gpt-4o-mini").unwrap().clone()
        };
        let violations = validate_params(&params, Some(&tiny));
        assert_eq!(violations.len(), 1);
        assert!(violations[0].message.contains("4096"));
    }

    #[test]
    fn recommendations_pass_validation() {
        for profile in [
            TaskProfile::Factual,
            TaskProfile::Coding,
            TaskProfile::Creative,
            TaskProfile::Chat,
        ] {
            let rec = recommend(profile);
            assert!(validate_params(&rec.params, None).is_empty(), "{profile:?}");
        }
        assert!(recommend(TaskProfile::Factual).params.temperature < recommend(TaskProfile::Creative).params.temperature);
    }

    #[test]
    fn cheapest_respects_tool_and_context_requirements() {
        let catalog = Catalog::builtin();
        let any = cheapest_model(
            &catalog,
            &Requirements {
                expected_prompt_tokens: 1000,
                expected_completion_tokens: 500,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(any.model.id, "mistralai/mistral-7b-instruct:free");

        let tools = cheapest_model(
            &catalog,
            &Requirements {
                needs_tools: true,
                expected_prompt_tokens: 1000,
                expected_completion_tokens: 500,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(tools.model.id, "google/gemini-flash-1.5");

        assert!(
            cheapest_model(
                &catalog,
                &Requirements {
                    min_context: 2_000_000,
                    ..Default::default()
                }
            )
            .is_none()
        );
    }

    #[test]
    fn zero_usage_tie_prefers_larger_context() {
        let catalog = Catalog::builtin();
        let pick = cheapest_model(&catalog, &Requirements::default()).unwrap();
        assert_eq!(pick.model.id, "google/gemini-flash-1.5");
    }

    #[test]
    fn profile_names() {
        assert_eq!(TaskProfile::from_name("Code"), Some(TaskProfile::Coding));
        assert_eq!(TaskProfile::from_name("poetry"), None);
    }
}
