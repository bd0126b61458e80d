use crate::catalog::ModelInfo;
use crate::error::{Error, Result};
use crate::llm::SamplingParams;
use askama::Template;

#[derive(Template)]
#[template(path = "index.html")]
struct IndexPage {
    version: &'static str,
    models: Vec<ModelOption>,
    params: SamplingParams,
    tools: Vec<String>,
    max_turns: u32,
    cost_limit: String,
}

#[allow(dead_code)] // fields used by Askama template
struct ModelOption {
    id: String,
    label: String,
    selected: bool,
}

fn model_label(m: &ModelInfo) -> String {
    let price = if m.is_free() {
        "free".to_string()
    } else {
        format!("${:.2}/${:.2} per Mtok", m.prompt_price, m.completion_price)
    };
    let tools = if m.supports_tools { "" } else { ", no tools" };
    format!("{} ({price}{tools})", m.name)
}

pub(super) fn render_index(
    models: &[ModelInfo],
    default_model: &str,
    params: SamplingParams,
    tools: Vec<String>,
    max_turns: u32,
    cost_limit_usd: f64,
) -> Result<String> {
    let mut options: Vec<ModelOption> = models
        .iter()
        .map(|m| ModelOption {
            id: m.id.clone(),
            label: model_label(m),
            selected: m.id == default_model,
        })
        .collect();
    if !options.iter().any(|o| o.selected) {
        options.insert(
            0,
            ModelOption {
                id: default_model.to_string(),
                label: default_model.to_string(),
                selected: true,
            },
        );
    }

    IndexPage {
        version: env!("CARGO_PKG_VERSION"),
        models: options,
        params,
        tools,
        max_turns,
        cost_limit: format!("{cost_limit_usd:.2}"),
    }
    .render()
    .map_err(|e| Error::Template(e.to_string()))
}
