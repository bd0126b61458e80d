//! HTTP surface: the browser UI, a JSON API over catalog/sessions/usage, and
//! the streamed chat endpoint.

mod handlers;
mod page;

pub use handlers::{ApiError, ChatRequest};

use crate::cancel::CancelToken;
use crate::catalog::Catalog;
use crate::config::Config;
use crate::error::Result;
use crate::llm::LlmClient;
use crate::session::{SessionStore, UsageLog};
use crate::tools::ToolBox;
use axum::{
    Router,
    routing::{get, post},
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

pub type SharedState = Arc<AppState>;

pub struct AppState {
    pub config: Config,
    pub llm: LlmClient,
    pub tools: ToolBox,
    pub catalog: Catalog,
    pub store: SessionStore,
    pub usage: UsageLog,
    runs: Mutex<HashMap<Uuid, CancelToken>>,
    session_locks: Mutex<HashMap<Uuid, Arc<SessionMutex>>>,
}

type SessionMutex = tokio::sync::Mutex<()>;

/// Exclusive hold on one session for the length of a run or delete.
pub struct SessionGuard {
    state: SharedState,
    id: Uuid,
    guard: Option<tokio::sync::OwnedMutexGuard<()>>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        // Release first so the strong count no longer includes this guard.
        drop(self.guard.take());
        self.state.prune_session_lock(&self.id);
    }
}

impl AppState {
    pub fn new(config: Config, llm: LlmClient, catalog: Catalog) -> Result<Self> {
        let tools = ToolBox::from_config(&config.tools)?;
        let store = SessionStore::new(&config.storage.data_dir);
        let usage = UsageLog::new(config.storage.usage_log_path());
        Ok(Self {
            config,
            llm,
            tools,
            catalog,
            store,
            usage,
            runs: Mutex::new(HashMap::new()),
            session_locks: Mutex::new(HashMap::new()),
        })
    }

    /// Build the client from config and load the live catalog when a key is available.
    pub async fn from_config(config: Config) -> Result<Self> {
        let llm = LlmClient::from_config(&config.llm)?;
        let catalog = if llm.has_api_key() {
            Catalog::fetch_or_builtin(&llm).await
        } else {
            warn!("no API key configured, using built-in model catalog");
            Catalog::builtin()
        };
        Self::new(config, llm, catalog)
    }

    pub fn register_run(&self) -> (Uuid, CancelToken) {
        let id = Uuid::new_v4();
        let token = CancelToken::new();
        self.lock_runs().insert(id, token.clone());
        (id, token)
    }

    /// Returns false if no such run is active.
    pub fn cancel_run(&self, id: &Uuid) -> bool {
        match self.lock_runs().get(id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn finish_run(&self, id: &Uuid) {
        self.lock_runs().remove(id);
    }

    pub fn active_runs(&self) -> usize {
        self.lock_runs().len()
    }

    pub fn cancel_all(&self) {
        for token in self.lock_runs().values() {
            token.cancel();
        }
    }

    /// Take the per-session lock so load-modify-save never races. `None` if held.
    ///
    /// The map entry is removed when the guard drops.
    pub fn try_lock_session(self: &Arc<Self>, id: &Uuid) -> Option<SessionGuard> {
        let lock = self.lock_sessions().entry(*id).or_default().clone();
        let guard = lock.try_lock_owned().ok()?;
        Some(SessionGuard {
            state: self.clone(),
            id: *id,
            guard: Some(guard),
        })
    }

    pub fn locked_sessions(&self) -> usize {
        self.lock_sessions().len()
    }

    /// Drop the entry if only the map still references it.
    fn prune_session_lock(&self, id: &Uuid) {
        let mut locks = self.lock_sessions();
        if locks.get(id).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(id);
        }
    }

    fn lock_sessions(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, Arc<SessionMutex>>> {
        self.session_locks.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn lock_runs(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, CancelToken>> {
        self.runs.lock().unwrap_or_else(|p| p.into_inner())
    }
}

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/", get(handlers::index))
        .route("/health", get(handlers::health))
        .route("/api/models", get(handlers::models))
        .route("/api/recommend", post(handlers::recommend))
        .route("/api/cheapest-model", post(handlers::cheapest))
        .route("/api/optimize-prompt", post(handlers::optimize))
        .route("/api/chat", post(handlers::chat))
        .route("/api/runs/{id}/cancel", post(handlers::cancel_run))
        .route("/api/sessions", get(handlers::list_sessions))
        .route(
            "/api/sessions/{id}",
            get(handlers::get_session).delete(handlers::delete_session),
        )
        .route("/api/usage", get(handlers::usage))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve until Ctrl-C, cancelling in-flight runs on the way out.
pub async fn serve(state: SharedState) -> Result<()> {
    let addr = state.config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(
        address = %listener.local_addr()?,
        model = %state.llm.model(),
        models = state.catalog.models().len(),
        "Agent Lab listening"
    );

    let shutdown_state = state.clone();
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
            info!(active = shutdown_state.active_runs(), "shutting down");
            shutdown_state.cancel_all();
        })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::Provider;
    use tempfile::TempDir;

    fn state(dir: &TempDir) -> AppState {
        let mut config = Config::default();
        config.storage.data_dir = dir.path().to_path_buf();
        let llm = LlmClient::new(
            Provider::OpenRouter,
            String::new(),
            config.llm.model.clone(),
            256,
            Some("http://127.0.0.1:9".into()),
        )
        .unwrap();
        AppState::new(config, llm, Catalog::builtin()).unwrap()
    }

    #[test]
    fn runs_register_cancel_and_finish() {
        let dir = TempDir::new().unwrap();
        let s = state(&dir);
        let (id, token) = s.register_run();
        assert_eq!(s.active_runs(), 1);
        assert!(s.cancel_run(&id));
        assert!(token.is_cancelled());
        s.finish_run(&id);
        assert!(!s.cancel_run(&id));
        assert_eq!(s.active_runs(), 0);
    }

    #[test]
    fn session_lock_is_exclusive_and_pruned_on_release() {
        let dir = TempDir::new().unwrap();
        let s = Arc::new(state(&dir));
        let id = Uuid::new_v4();

        let held = s.try_lock_session(&id).unwrap();
        assert!(s.try_lock_session(&id).is_none());
        assert_eq!(s.locked_sessions(), 1);

        drop(held);
        assert_eq!(s.locked_sessions(), 0);
        let again = s.try_lock_session(&id).unwrap();
        drop(again);
        assert_eq!(s.locked_sessions(), 0);
    }

    #[test]
    fn many_sessions_leave_no_locks_behind() {
        let dir = TempDir::new().unwrap();
        let s = Arc::new(state(&dir));
        let guards: Vec<_> = (0..50)
            .map(|_| s.try_lock_session(&Uuid::new_v4()).unwrap())
            .collect();
        assert_eq!(s.locked_sessions(), 50);
        drop(guards);
        assert_eq!(s.locked_sessions(), 0);
    }
}
