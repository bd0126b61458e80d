//! Session transcripts (one JSON file per session) and the CSV usage log.

use crate::error::{Error, Result};
use crate::llm::{ChatMessage, Role, SamplingParams, Usage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;
use walkdir::WalkDir;

pub const FORMAT_VERSION: u32 = 2;
const TITLE_CHARS: usize = 60;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    #[serde(flatten)]
    pub message: ChatMessage,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionTotals {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cost_usd: f64,
    pub requests: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub format_version: u32,
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub title: String,
    pub model: String,
    #[serde(default)]
    pub params: SamplingParams,
    #[serde(default)]
    pub messages: Vec<TranscriptEntry>,
    #[serde(default)]
    pub totals: SessionTotals,
}

impl Session {
    pub fn new(model: impl Into<String>, params: SamplingParams) -> Self {
        let now = Utc::now();
        Self {
            format_version: FORMAT_VERSION,
            id: Uuid::new_v4(),
            created_at: now,
            updated_at: now,
            title: String::new(),
            model: model.into(),
            params,
            messages: Vec::new(),
            totals: SessionTotals::default(),
        }
    }

    /// Append a message. The first user message also becomes the title.
    pub fn push(&mut self, message: ChatMessage) {
        if self.title.is_empty() && message.role == Role::User {
            self.title = make_title(message.text());
        }
        let now = Utc::now();
        self.updated_at = now;
        self.messages.push(TranscriptEntry {
            message,
            timestamp: now,
        });
    }

    pub fn record_usage(&mut self, usage: &Usage, cost_usd: f64) {
        self.totals.prompt_tokens += u64::from(usage.prompt_tokens);
        self.totals.completion_tokens += u64::from(usage.completion_tokens);
        self.totals.cost_usd += cost_usd;
        self.totals.requests += 1;
        self.updated_at = Utc::now();
    }

    /// Conversation to send upstream: the system prompt followed by the transcript.
    pub fn chat_messages(&self, system_prompt: &str) -> Vec<ChatMessage> {
        let mut out = Vec::with_capacity(self.messages.len() + 1);
        if !system_prompt.trim().is_empty() {
            out.push(ChatMessage::system(system_prompt));
        }
        out.extend(
            self.messages
                .iter()
                .filter(|e| e.message.role != Role::System)
                .map(|e| e.message.clone()),
        );
        out
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id,
            title: self.title.clone(),
            model: self.model.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            message_count: self.messages.len(),
            cost_usd: self.totals.cost_usd,
        }
    }
}

fn make_title(text: &str) -> String {
    let line = text.lines().next().unwrap_or("").trim();
    if line.chars().count() <= TITLE_CHARS {
        return line.to_string();
    }
    let mut title: String = line.chars().take(TITLE_CHARS - 1).collect();
    title.push('…');
    title
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: Uuid,
    pub title: String,
    pub model: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub message_count: usize,
    pub cost_usd: f64,
}

/// Parse a session file, rejecting older layouts instead of guessing at them.
pub fn parse_session(text: &str, origin: &str) -> Result<Session> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| Error::parse(format!("{origin}: invalid JSON: {e}")))?;
    let version = match &value {
        Value::Object(map) => map.get("format_version").and_then(Value::as_u64),
        _ => None,
    };
    match version {
        None => Err(Error::LegacySession(origin.to_string())),
        Some(v) if v > u64::from(FORMAT_VERSION) => Err(Error::parse(format!(
            "{origin}: format_version {v} is newer than supported {FORMAT_VERSION}"
        ))),
        Some(v) if v < u64::from(FORMAT_VERSION) => Err(Error::LegacySession(origin.to_string())),
        Some(_) => serde_json::from_value(value)
            .map_err(|e| Error::parse(format!("{origin}: {e}"))),
    }
}

#[derive(Debug, Clone)]
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            dir: data_dir.join("sessions"),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &Uuid) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    /// Write via a temp file and rename so a crash never leaves half a transcript.
    pub fn save(&self, session: &Session) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path_for(&session.id);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(session)
            .map_err(|e| Error::parse(format!("serialize session: {e}")))?;
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &path)?;
        debug!(id = %session.id, path = %path.display(), "session saved");
        Ok(path)
    }

    pub fn load(&self, id: &Uuid) -> Result<Session> {
        let path = self.path_for(id);
        let text = match std::fs::read_to_string(&path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::not_found(format!("session {id}")));
            }
            Err(e) => return Err(e.into()),
        };
        parse_session(&text, &path.display().to_string())
    }

    /// Summaries newest first. Unreadable and legacy files are skipped.
    pub fn list(&self) -> Result<Vec<SessionSummary>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in WalkDir::new(&self.dir)
            .max_depth(1)
            .follow_links(false)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let path = entry.path();
            if !path.is_file() || path.extension().is_none_or(|e| e != "json") {
                continue;
            }
            let origin = path.display().to_string();
            let parsed = std::fs::read_to_string(path)
                .map_err(Error::from)
                .and_then(|text| parse_session(&text, &origin));
            match parsed {
                Ok(session) => out.push(session.summary()),
                Err(e) => warn!(path = %origin, error = %e, "skipping session file"),
            }
        }
        out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(out)
    }

    pub fn delete(&self, id: &Uuid) -> Result<()> {
        match std::fs::remove_file(self.path_for(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::not_found(format!("session {id}")))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Ok,
    Cancelled,
    Error,
}

/// One CSV row per model request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRow {
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    pub model: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    pub cost_usd: f64,
    pub latency_ms: u64,
    pub tool_calls: u32,
    pub status: RunStatus,
}

impl UsageRow {
    fn validate(&self) -> Result<()> {
        if self.session_id.trim().is_empty() {
            return Err(Error::parse("usage row is missing session_id"));
        }
        if self.model.trim().is_empty() {
            return Err(Error::parse("usage row is missing model"));
        }
        if !self.cost_usd.is_finite() || self.cost_usd < 0.0 {
            return Err(Error::parse(format!("usage row has invalid cost {}", self.cost_usd)));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ModelUsage {
    pub model: String,
    pub requests: u32,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cost_usd: f64,
}

#[derive(Debug)]
pub struct UsageLog {
    path: PathBuf,
    lock: Mutex<()>,
}

impl UsageLog {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one row, writing the header only when the file is new or empty.
    pub fn append(&self, row: &UsageRow) -> Result<()> {
        row.validate()?;
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let needs_header = file.metadata()?.len() == 0;

        let mut wtr = csv::WriterBuilder::new()
            .has_headers(needs_header)
            .from_writer(file);
        wtr.serialize(row)?;
        wtr.flush()?;
        Ok(())
    }

    pub fn read_all(&self) -> Result<Vec<UsageRow>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        let mut rdr = csv::Reader::from_path(&self.path)?;
        let mut rows = Vec::new();
        for row in rdr.deserialize() {
            let row: UsageRow = row?;
            rows.push(row);
        }
        Ok(rows)
    }

    /// Totals per model, most expensive first.
    pub fn summary(&self) -> Result<Vec<ModelUsage>> {
        let mut by_model: BTreeMap<String, ModelUsage> = BTreeMap::new();
        for row in self.read_all()? {
            let entry = by_model.entry(row.model.clone()).or_insert_with(|| ModelUsage {
                model: row.model.clone(),
                ..Default::default()
            });
            entry.requests += 1;
            entry.prompt_tokens += u64::from(row.prompt_tokens);
            entry.completion_tokens += u64::from(row.completion_tokens);
            entry.cost_usd += row.cost_usd;
        }
        let mut out: Vec<ModelUsage> = by_model.into_values().collect();
        out.sort_by(|a, b| {
            b.cost_usd
                .partial_cmp(&a.cost_usd)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.model.cmp(&b.model))
        });
        Ok(out)
    }
}
