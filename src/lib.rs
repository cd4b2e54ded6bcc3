//! Source sheets library - re-exports for testing and external use.
//!
//! This module wires the resolver, the stores and the edit sessions into the
//! shared application state used by the HTTP handlers.

use sled::Db;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex as AsyncMutex, RwLock};
use tokio::time::Instant;

pub mod assistant;
pub mod auth;
pub mod citation;
pub mod config;
pub mod corpus;
pub mod disambiguation;
pub mod error;
pub mod handlers;
pub mod history;
pub mod models;
pub mod persistence;
pub mod resolver;
pub mod session;
pub mod store;

use assistant::{Assistant, HttpAssistant};
use config::Config;
use corpus::CorpusClient;
use error::{StartupError, StoreError};
use persistence::{Identity, PersistenceCoordinator, Phase, WriteOutcome};
use resolver::ReferenceResolver;
use session::EditSession;
use store::{DocumentStore, LocalCache, SledDocumentStore, SledLocalCache};

// ============================================================================
// Rate Limiting
// ============================================================================

/// Failed sign-in attempts, shared by every caller since there is a single
/// password. Five misses lock sign-in for 1s, doubling per further miss up to 64s.
pub struct LoginRateLimit {
    pub failures: u32,
    pub locked_until: Option<DateTime<Utc>>,
}

impl LoginRateLimit {
    pub fn new() -> Self {
        Self {
            failures: 0,
            locked_until: None,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked_until.is_some_and(|until| Utc::now() < until)
    }

    pub fn record_failure(&mut self) {
        self.failures += 1;
        if self.failures >= 5 {
            let delay_secs = 1i64 << (self.failures - 5).min(6);
            self.locked_until = Some(Utc::now() + chrono::Duration::seconds(delay_secs));
        }
    }

    /// A correct password clears the count.
    pub fn reset(&mut self) {
        self.failures = 0;
        self.locked_until = None;
    }
}

impl Default for LoginRateLimit {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Application State
// ============================================================================

pub type SharedSession = Arc<AsyncMutex<EditSession>>;

/// How often idle edit sessions are looked for.
pub const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// An open edit session and when its browser last used it.
pub struct SessionSlot {
    pub session: SharedSession,
    last_seen: Mutex<Instant>,
}

impl SessionSlot {
    fn new(session: SharedSession) -> Self {
        Self {
            session,
            last_seen: Mutex::new(Instant::now()),
        }
    }

    fn touch(&self) {
        *self.last_seen.lock().unwrap_or_else(|p| p.into_inner()) = Instant::now();
    }

    fn idle_for(&self, now: Instant) -> Duration {
        let last_seen = *self.last_seen.lock().unwrap_or_else(|p| p.into_inner());
        now.saturating_duration_since(last_seen)
    }
}

pub struct AppState {
    pub config: Config,
    pub db: Db,
    pub store: Arc<dyn DocumentStore>,
    pub resolver: Arc<ReferenceResolver>,
    pub assistant: Option<Arc<dyn Assistant>>,
    pub sessions: RwLock<HashMap<String, SessionSlot>>,
    pub login_rate_limit: Mutex<LoginRateLimit>,
}

impl AppState {
    /// Open the database and build the service clients from `config`.
    pub fn new(config: Config) -> Result<Self, StartupError> {
        let db = sled::open(&config.db_path)?;
        let store: Arc<dyn DocumentStore> = Arc::new(SledDocumentStore::open(&db)?);

        let corpus = CorpusClient::new(&config.corpus_url, config.http_timeout)?;
        let resolver = Arc::new(ReferenceResolver::new(
            Arc::new(corpus),
            config.completion_limit,
            config.search_size,
        ));

        let assistant = match &config.assistant_url {
            Some(url) => {
                let client: Arc<dyn Assistant> =
                    Arc::new(HttpAssistant::new(url, config.http_timeout)?);
                Some(client)
            }
            None => None,
        };

        Ok(Self::with_parts(config, db, store, resolver, assistant))
    }

    pub fn with_parts(
        config: Config,
        db: Db,
        store: Arc<dyn DocumentStore>,
        resolver: Arc<ReferenceResolver>,
        assistant: Option<Arc<dyn Assistant>>,
    ) -> Self {
        Self {
            config,
            db,
            store,
            resolver,
            assistant,
            sessions: RwLock::new(HashMap::new()),
            login_rate_limit: Mutex::new(LoginRateLimit::new()),
        }
    }

    pub fn secret(&self) -> Option<&[u8]> {
        self.config.secret.as_deref().map(str::as_bytes)
    }

    /// The edit session for this browser and identity, created and loaded on
    /// first use. Guest content cached by this browser is offered to the
    /// account when a user signs in.
    pub async fn session_for(
        &self,
        identity: Identity,
        guest_id: &str,
    ) -> Result<SharedSession, StoreError> {
        let key = match &identity {
            Identity::Guest => format!("guest:{}", guest_id),
            Identity::User(user) => format!("user:{}:{}", user, guest_id),
        };
        if let Some(slot) = self.sessions.read().await.get(&key) {
            slot.touch();
            return Ok(slot.session.clone());
        }

        let mut sessions = self.sessions.write().await;
        if let Some(slot) = sessions.get(&key) {
            slot.touch();
            return Ok(slot.session.clone());
        }

        let cache: Arc<dyn LocalCache> = Arc::new(SledLocalCache::open(&self.db, guest_id)?);
        let coordinator = PersistenceCoordinator::new(
            identity,
            self.store.clone(),
            cache,
            self.config.save_debounce,
        );
        let session = Arc::new(AsyncMutex::new(EditSession::new(
            self.resolver.clone(),
            coordinator,
            self.assistant.clone(),
        )));
        let mut guard = session.clone().lock_owned().await;
        sessions.insert(key.clone(), SessionSlot::new(session.clone()));
        drop(sessions);

        if guard.coordinator().status().phase == Phase::NotInitialized {
            if let Err(e) = guard.load(None, false).await {
                tracing::warn!(session = %key, error = %e, "initial load failed");
            }
        }
        tracing::debug!(session = %key, "edit session opened");
        Ok(session)
    }

    /// Close sessions unused for `idle`, saving any edits they still hold.
    /// Returns how many were closed.
    pub async fn evict_idle(&self, idle: Duration) -> usize {
        let now = Instant::now();
        let evicted: Vec<(String, SessionSlot)> = {
            let mut sessions = self.sessions.write().await;
            let stale: Vec<String> = sessions
                .iter()
                .filter(|(_, slot)| slot.idle_for(now) >= idle)
                .map(|(key, _)| key.clone())
                .collect();
            stale
                .into_iter()
                .filter_map(|key| sessions.remove(&key).map(|slot| (key, slot)))
                .collect()
        };

        for (key, slot) in &evicted {
            let session = slot.session.lock().await;
            let coordinator = session.coordinator();
            if coordinator.status().dirty && coordinator.flush().await == WriteOutcome::Failed {
                tracing::warn!(session = %key, "closing idle session with unsaved edits");
            }
            tracing::debug!(session = %key, "idle edit session closed");
        }
        evicted.len()
    }

    /// Forget the sessions of a signed-out browser.
    pub async fn drop_sessions(&self, guest_id: &str) {
        let suffix = format!(":{}", guest_id);
        self.sessions
            .write()
            .await
            .retain(|key, _| !key.ends_with(&suffix));
    }
}

/// Periodically close sessions idle for longer than the configured limit.
pub fn spawn_session_sweeper(state: Arc<AppState>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SESSION_SWEEP_INTERVAL);
        loop {
            ticker.tick().await;
            let closed = state.evict_idle(state.config.session_idle).await;
            if closed > 0 {
                tracing::info!(closed, "closed idle edit sessions");
            }
        }
    });
}

// Re-export commonly used types
pub use models::{
    ChatMessage, DisambiguationRequest, ResolvedSource, Sheet, SheetEntry, SheetSummary,
    TextBody, TextSource, VersionInfo, ViewMode,
};

pub use resolver::{Resolution, ResolveFailure};

pub use session::{AddOutcome, SessionView};
