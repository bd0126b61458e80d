use agent_lab::advisor::{self, Requirements, TaskProfile};
use agent_lab::agent::{Agent, AgentEvent};
use agent_lab::cancel::CancelToken;
use agent_lab::catalog::Catalog;
use agent_lab::config::Config;
use agent_lab::llm::{LlmClient, Provider, SamplingParams};
use agent_lab::server::{self, AppState};
use agent_lab::session::{RunStatus, Session, SessionStore, UsageLog};
use agent_lab::tools::ToolBox;
use anyhow::{Context, Result, bail};
use clap::Parser;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

#[derive(Parser)]
#[command(
    name = "agent-lab",
    version,
    about = "Configure, stream, and record OpenRouter-hosted LLM agents with tools"
)]
struct Cli {
    /// Path to config file (missing file means defaults)
    #[arg(short, long, global = true, default_value = "agent-lab.toml")]
    config: PathBuf,

    /// LLM provider override: openrouter, openai
    #[arg(long, global = true)]
    provider: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Serve the web UI and JSON API
    Serve {
        /// Bind host (overrides config and GRADIO_SERVER_HOST)
        #[arg(long)]
        host: Option<String>,

        /// Bind port (overrides config and GRADIO_SERVER_PORT)
        #[arg(long)]
        port: Option<u16>,
    },

    /// Send one message through the agent loop, streaming the reply to stdout
    Chat {
        message: String,

        /// Model override
        #[arg(long)]
        model: Option<String>,

        /// Continue an existing session
        #[arg(long)]
        session: Option<Uuid>,

        /// Task profile whose recommended parameters to use: factual, coding, creative, chat
        #[arg(long)]
        profile: Option<String>,

        #[arg(long)]
        temperature: Option<f32>,

        #[arg(long)]
        max_tokens: Option<u32>,
    },

    /// List the model catalog with pricing
    Models {
        /// Only models that support tool calls
        #[arg(long)]
        tools: bool,
    },

    /// Show the cheapest model meeting the given requirements
    Cheapest {
        #[arg(long, default_value_t = 0)]
        min_context: u32,

        #[arg(long)]
        tools: bool,

        #[arg(long, default_value_t = 1000)]
        prompt_tokens: u32,

        #[arg(long, default_value_t = 500)]
        completion_tokens: u32,
    },

    /// Suggest an improved version of a prompt
    Optimize { prompt: String },

    /// List recorded sessions, newest first
    Sessions,

    /// Print one session transcript as JSON
    Show { id: Uuid },

    /// Per-model usage totals from the CSV log
    Usage,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "agent_lab=info,tower_http=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let mut config = Config::from_env_and_file(Some(&cli.config))?;
    if let Some(name) = &cli.provider {
        config.llm.provider =
            Provider::from_name(name).with_context(|| format!("unknown provider '{name}'"))?;
    }

    match cli.command {
        Command::Serve { host, port } => {
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            config.validate()?;
            if let Err(e) = config.validate_api_key() {
                warn!("{e}; chat requests will fail until a key is set");
            }
            let state = Arc::new(AppState::from_config(config).await?);
            server::serve(state).await?;
            Ok(())
        }
        Command::Chat {
            message,
            model,
            session,
            profile,
            temperature,
            max_tokens,
        } => {
            config.validate()?;
            config.validate_api_key()?;
            run_chat(&config, message, model, session, profile, temperature, max_tokens).await
        }
        Command::Models { tools } => {
            let llm = LlmClient::from_config(&config.llm)?;
            let catalog = if llm.has_api_key() {
                Catalog::fetch_or_builtin(&llm).await
            } else {
                Catalog::builtin()
            };
            for m in catalog.models().iter().filter(|m| !tools || m.supports_tools) {
                println!(
                    "{:<45} {:>9} ctx  ${:>7.3}/${:>7.3} per Mtok{}",
                    m.id,
                    m.context_length,
                    m.prompt_price,
                    m.completion_price,
                    if m.supports_tools { "  tools" } else { "" }
                );
            }
            Ok(())
        }
        Command::Cheapest {
            min_context,
            tools,
            prompt_tokens,
            completion_tokens,
        } => {
            let catalog = Catalog::builtin();
            let req = Requirements {
                min_context,
                needs_tools: tools,
                expected_prompt_tokens: prompt_tokens,
                expected_completion_tokens: completion_tokens,
            };
            match advisor::cheapest_model(&catalog, &req) {
                Some(pick) => println!("{}", serde_json::to_string_pretty(&pick)?),
                None => bail!("no model in the catalog meets the requirements"),
            }
            Ok(())
        }
        Command::Optimize { prompt } => {
            config.validate_api_key()?;
            let llm = LlmClient::from_config(&config.llm)?;
            let suggestion = advisor::optimize_prompt(&llm, &prompt).await?;
            println!("{}", serde_json::to_string_pretty(&suggestion)?);
            Ok(())
        }
        Command::Sessions => {
            let store = SessionStore::new(&config.storage.data_dir);
            for s in store.list()? {
                println!(
                    "{}  {}  {:<30} {:>3} msgs  ${:.5}  {}",
                    s.id,
                    s.updated_at.format("%Y-%m-%d %H:%M"),
                    s.model,
                    s.message_count,
                    s.cost_usd,
                    s.title
                );
            }
            Ok(())
        }
        Command::Show { id } => {
            let store = SessionStore::new(&config.storage.data_dir);
            let session = store.load(&id)?;
            println!("{}", serde_json::to_string_pretty(&session)?);
            Ok(())
        }
        Command::Usage => {
            let log = UsageLog::new(config.storage.usage_log_path());
            let summary = log.summary()?;
            if summary.is_empty() {
                eprintln!("No usage recorded in {}", log.path().display());
            }
            for m in &summary {
                println!(
                    "{:<45} {:>5} req  {:>9} in  {:>9} out  ${:.5}",
                    m.model, m.requests, m.prompt_tokens, m.completion_tokens, m.cost_usd
                );
            }
            Ok(())
        }
    }
}

async fn run_chat(
    config: &Config,
    message: String,
    model: Option<String>,
    session_id: Option<Uuid>,
    profile: Option<String>,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
) -> Result<()> {
    let llm = LlmClient::from_config(&config.llm)?;
    let tools = ToolBox::from_config(&config.tools)?;
    let catalog = Catalog::fetch_or_builtin(&llm).await;
    let store = SessionStore::new(&config.storage.data_dir);
    let usage = UsageLog::new(config.storage.usage_log_path());

    let mut session = match session_id {
        Some(id) => store.load(&id).with_context(|| format!("loading session {id}"))?,
        None => Session::new(
            llm.model(),
            SamplingParams {
                max_tokens: config.llm.max_tokens,
                ..SamplingParams::default()
            },
        ),
    };
    if let Some(model) = model {
        session.model = model;
    }
    if let Some(name) = profile {
        let profile = TaskProfile::from_name(&name)
            .with_context(|| format!("unknown profile '{name}'"))?;
        session.params = advisor::recommend(profile).params;
    }
    if let Some(t) = temperature {
        session.params.temperature = t;
    }
    if let Some(n) = max_tokens {
        session.params.max_tokens = n;
    }
    let violations = advisor::validate_params(&session.params, catalog.get(&session.model));
    if !violations.is_empty() {
        let list: Vec<String> = violations.iter().map(|v| v.to_string()).collect();
        bail!("invalid parameters: {}", list.join("; "));
    }

    let cancel = CancelToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    let (tx, mut rx) = mpsc::unbounded_channel::<AgentEvent>();
    let printer = tokio::spawn(async move {
        let mut stdout = std::io::stdout();
        while let Some(event) = rx.recv().await {
            match event {
                AgentEvent::Token { text } => {
                    print!("{text}");
                    let _ = stdout.flush();
                }
                AgentEvent::ToolCall { name, arguments, .. } => {
                    eprintln!("\n[tool] {name}({arguments})");
                }
                AgentEvent::ToolResult {
                    output, is_error, ..
                } => {
                    let tag = if is_error { "tool error" } else { "tool result" };
                    eprintln!("[{tag}] {output}");
                }
                AgentEvent::Notice { message } => eprintln!("\n[notice] {message}"),
                AgentEvent::Error { message } => eprintln!("\n[error] {message}"),
            }
        }
        println!();
    });

    let agent = Agent::new(&llm, &tools, &config.agent, &catalog).with_usage_log(&usage);
    let outcome = agent.run(&mut session, &message, &tx, &cancel).await;
    drop(tx);
    let _ = printer.await;

    let path = store.save(&session)?;
    eprintln!(
        "[{:?}] {} turns, {} tokens, ${:.5} · session {} saved to {}",
        outcome.status,
        outcome.turns,
        outcome.usage.total_tokens,
        outcome.cost_usd,
        session.id,
        path.display()
    );
    if outcome.status == RunStatus::Error {
        bail!(outcome.error.unwrap_or_else(|| "run failed".into()));
    }
    Ok(())
}
