//! Persistence coordinator: keeps the durable copy of a sheet in step with
//! the in-memory one.
//!
//! The coordinator is an explicit state machine over
//! `NotInitialized -> Loading -> Ready <-> Saving`, crossed with a dirty flag.
//! Edits land in a latest-state cell and mark the sheet dirty immediately;
//! writes are debounced, coalesced, and always serialize whatever the cell
//! holds when the timer fires. Guests write to their local cache, signed-in
//! users to the document store.
//!
//! Rules:
//! - a never-written sheet is written without delay, established sheets after the debounce
//! - at most one write in flight; a timer firing mid-write asks for a rerun
//! - loads wait until no write is in flight, and save the outgoing sheet's edits first
//! - blank sheets (no entries, only the welcome message) are never written
//! - failed writes stay dirty and are not retried until the next edit

use crate::error::PersistenceError;
use crate::models::Sheet;
use crate::store::{clear_cache, read_sheet_from_cache, write_sheet_to_cache, DocumentStore, LocalCache};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    NotInitialized,
    Loading,
    Ready,
    Saving,
}

/// Where the sheet's durable copy lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistMode {
    Unsaved,
    Local,
    Remote,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    Guest,
    User(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HydrationSource {
    Remote,
    Local,
    Default,
}

#[derive(Debug, Clone)]
pub struct LoadOutcome {
    pub sheet: Sheet,
    pub source: HydrationSource,
    /// Set when hydration fell back to a default sheet because of a failure.
    pub error: Option<PersistenceError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    Failed,
    /// Loading or not initialized.
    Skipped,
    /// Another write was in flight; it will run again when done.
    Deferred,
    Clean,
    /// Blank sheets are never written.
    Suppressed,
}

/// What stands between the current sheet and its replacement.
enum Handover {
    /// A write is in flight.
    Busy,
    Unsaved,
    Clear,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinatorStatus {
    pub phase: Phase,
    pub dirty: bool,
    pub mode: PersistMode,
    pub sheet_id: Option<String>,
    pub last_error: Option<String>,
}

struct Status {
    phase: Phase,
    dirty: bool,
    mode: PersistMode,
    /// Bumped on every edit; a write only clears `dirty` if none happened meanwhile.
    revision: u64,
    /// Bumped whenever the sheet is replaced (load, new); stale writes are ignored.
    epoch: u64,
    rerun: bool,
    ever_written: bool,
    /// Guest content adopted by a signed-in user, cleared from the cache once saved remotely.
    adopted_local: bool,
    last_error: Option<PersistenceError>,
}

struct Shared {
    identity: Identity,
    store: Arc<dyn DocumentStore>,
    cache: Arc<dyn LocalCache>,
    debounce: Duration,
    latest: Mutex<Sheet>,
    status: Mutex<Status>,
    schedule_generation: AtomicU64,
    load_generation: AtomicU64,
    phase_tx: watch::Sender<Phase>,
    id_tx: watch::Sender<Option<String>>,
}

#[derive(Clone)]
pub struct PersistenceCoordinator {
    shared: Arc<Shared>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl PersistenceCoordinator {
    pub fn new(
        identity: Identity,
        store: Arc<dyn DocumentStore>,
        cache: Arc<dyn LocalCache>,
        debounce: Duration,
    ) -> Self {
        let (phase_tx, _) = watch::channel(Phase::NotInitialized);
        let (id_tx, _) = watch::channel(None);
        Self {
            shared: Arc::new(Shared {
                identity,
                store,
                cache,
                debounce,
                latest: Mutex::new(Sheet::new()),
                status: Mutex::new(Status {
                    phase: Phase::NotInitialized,
                    dirty: false,
                    mode: PersistMode::Unsaved,
                    revision: 0,
                    epoch: 0,
                    rerun: false,
                    ever_written: false,
                    adopted_local: false,
                    last_error: None,
                }),
                schedule_generation: AtomicU64::new(0),
                load_generation: AtomicU64::new(0),
                phase_tx,
                id_tx,
            }),
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.shared.identity
    }

    pub fn status(&self) -> CoordinatorStatus {
        let status = lock(&self.shared.status);
        CoordinatorStatus {
            phase: status.phase,
            dirty: status.dirty,
            mode: status.mode,
            sheet_id: self.sheet_id(),
            last_error: status.last_error.as_ref().map(|e| e.to_string()),
        }
    }

    pub fn sheet_id(&self) -> Option<String> {
        lock(&self.shared.latest).id.clone()
    }

    /// Fires whenever the sheet gains (or loses) its durable id.
    pub fn watch_sheet_id(&self) -> watch::Receiver<Option<String>> {
        self.shared.id_tx.subscribe()
    }

    pub fn latest(&self) -> Sheet {
        lock(&self.shared.latest).clone()
    }

    fn set_phase(&self, status: &mut Status, phase: Phase) {
        status.phase = phase;
        self.shared.phase_tx.send_replace(phase);
    }

    fn publish_id(&self, id: Option<String>) {
        self.shared.id_tx.send_if_modified(|current| {
            if *current == id {
                false
            } else {
                *current = id;
                true
            }
        });
    }

    // ========================================================================
    // Loading
    // ========================================================================

    /// Hydrate from durable storage.
    ///
    /// Waits for an in-flight write first. A load overtaken by a newer one
    /// returns `Superseded` and leaves the state to the newer load.
    pub async fn load(
        &self,
        sheet_id: Option<&str>,
        is_new: bool,
    ) -> Result<LoadOutcome, PersistenceError> {
        let generation = self.shared.load_generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.hand_over(true).await?;

        let (sheet, source, error) = self.hydrate(sheet_id, is_new).await;

        if self.shared.load_generation.load(Ordering::SeqCst) != generation {
            tracing::debug!(?sheet_id, "discarding superseded load");
            return Err(PersistenceError::Superseded);
        }

        let adopt = matches!(self.shared.identity, Identity::User(_))
            && source == HydrationSource::Local
            && !sheet.is_blank();
        {
            let mut status = lock(&self.shared.status);
            *lock(&self.shared.latest) = sheet.clone();
            status.revision += 1;
            status.epoch += 1;
            status.dirty = adopt;
            status.adopted_local = adopt;
            status.rerun = false;
            status.ever_written = match source {
                HydrationSource::Remote | HydrationSource::Local => sheet.id.is_some() || !adopt,
                HydrationSource::Default => false,
            };
            status.mode = match source {
                HydrationSource::Remote => PersistMode::Remote,
                HydrationSource::Local if !adopt => PersistMode::Local,
                _ => PersistMode::Unsaved,
            };
            status.last_error = error.clone();
            self.set_phase(&mut status, Phase::Ready);
        }
        self.publish_id(sheet.id.clone());
        tracing::info!(?source, id = ?sheet.id, entries = sheet.entries.len(), "sheet loaded");

        if adopt {
            self.schedule_write();
        }

        Ok(LoadOutcome {
            sheet,
            source,
            error,
        })
    }

    /// Enter `Loading` once no write is in flight. With `keep_outgoing`, the
    /// outgoing sheet's unsaved edits are written first; a write that fails
    /// is logged and does not hold up the replacement.
    async fn hand_over(&self, keep_outgoing: bool) -> Result<(), PersistenceError> {
        let mut phase_rx = self.shared.phase_tx.subscribe();
        let mut keep_outgoing = keep_outgoing;
        loop {
            if phase_rx
                .wait_for(|phase| *phase != Phase::Saving)
                .await
                .is_err()
            {
                return Err(PersistenceError::Load("coordinator shut down".to_string()));
            }
            match self.begin_loading(keep_outgoing) {
                Handover::Busy => continue,
                Handover::Unsaved => match self.flush().await {
                    WriteOutcome::Failed | WriteOutcome::Skipped => {
                        tracing::warn!("replacing a sheet whose last edits were not saved");
                        keep_outgoing = false;
                    }
                    _ => {}
                },
                Handover::Clear => {
                    // Pending timers belong to the sheet being replaced.
                    self.shared.schedule_generation.fetch_add(1, Ordering::SeqCst);
                    return Ok(());
                }
            }
        }
    }

    fn begin_loading(&self, keep_outgoing: bool) -> Handover {
        let mut status = lock(&self.shared.status);
        if status.phase == Phase::Saving {
            return Handover::Busy;
        }
        if keep_outgoing
            && status.phase == Phase::Ready
            && status.dirty
            && !lock(&self.shared.latest).is_blank()
        {
            return Handover::Unsaved;
        }
        self.set_phase(&mut status, Phase::Loading);
        Handover::Clear
    }

    async fn hydrate(
        &self,
        sheet_id: Option<&str>,
        is_new: bool,
    ) -> (Sheet, HydrationSource, Option<PersistenceError>) {
        if let (Identity::User(owner), Some(id)) = (&self.shared.identity, sheet_id) {
            match self.fetch_remote(owner, id).await {
                Ok(Some(sheet)) => return (sheet, HydrationSource::Remote, None),
                Ok(None) if is_new => {}
                Ok(None) => {
                    let error = PersistenceError::Load(format!("sheet {} not found", id));
                    return (Sheet::new(), HydrationSource::Default, Some(error));
                }
                Err(error) => {
                    tracing::warn!(id, %error, "remote load failed");
                    return (Sheet::new(), HydrationSource::Default, Some(error));
                }
            }
        }

        match read_sheet_from_cache(self.shared.cache.as_ref()) {
            Ok(Some(sheet)) => (sheet, HydrationSource::Local, None),
            Ok(None) => (Sheet::new(), HydrationSource::Default, None),
            Err(e) => {
                tracing::warn!(error = %e, "local cache unreadable");
                let error = PersistenceError::Load(e.to_string());
                (Sheet::new(), HydrationSource::Default, Some(error))
            }
        }
    }

    async fn fetch_remote(&self, owner: &str, id: &str) -> Result<Option<Sheet>, PersistenceError> {
        let store = &self.shared.store;
        match store.owner_of(id).await {
            Ok(Some(found)) if found != owner => {
                return Err(PersistenceError::Load(format!(
                    "sheet {} belongs to another account",
                    id
                )))
            }
            Ok(None) => return Ok(None),
            Ok(Some(_)) => {}
            Err(e) => return Err(PersistenceError::Load(e.to_string())),
        }
        store
            .get(id)
            .await
            .map_err(|e| PersistenceError::Load(e.to_string()))
    }

    // ========================================================================
    // Editing
    // ========================================================================

    /// Record an edit: the sheet becomes the latest state, dirty at once,
    /// and a write is scheduled.
    pub fn mark_changed(&self, mut sheet: Sheet) {
        {
            let mut status = lock(&self.shared.status);
            let mut latest = lock(&self.shared.latest);
            // The caller's copy may predate the id a write just assigned.
            if sheet.id.is_none() {
                sheet.id = latest.id.clone();
            }
            *latest = sheet;
            status.revision += 1;
            status.dirty = true;
            if status.phase == Phase::NotInitialized {
                tracing::debug!("edit before the sheet was loaded");
            }
        }
        self.schedule_write();
    }

    /// Debounced write; supersedes any write scheduled before it.
    fn schedule_write(&self) {
        let generation = self.shared.schedule_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = if lock(&self.shared.status).ever_written {
            self.shared.debounce
        } else {
            Duration::ZERO
        };

        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if this.shared.schedule_generation.load(Ordering::SeqCst) != generation {
                return;
            }
            this.execute_write().await;
        });
    }

    /// Cancel the pending timer and write now.
    pub async fn flush(&self) -> WriteOutcome {
        self.shared.schedule_generation.fetch_add(1, Ordering::SeqCst);
        self.execute_write().await
    }

    pub async fn execute_write(&self) -> WriteOutcome {
        let (snapshot, revision, epoch) = {
            let mut status = lock(&self.shared.status);
            match status.phase {
                Phase::NotInitialized | Phase::Loading => return WriteOutcome::Skipped,
                Phase::Saving => {
                    status.rerun = true;
                    return WriteOutcome::Deferred;
                }
                Phase::Ready => {}
            }
            if !status.dirty {
                return WriteOutcome::Clean;
            }
            let snapshot = lock(&self.shared.latest).clone();
            if snapshot.is_blank() {
                tracing::debug!("blank sheet, not writing");
                status.dirty = false;
                return WriteOutcome::Suppressed;
            }
            self.set_phase(&mut status, Phase::Saving);
            (snapshot, status.revision, status.epoch)
        };

        let result = self.write_snapshot(&snapshot).await;

        let (outcome, rerun, assigned_id) = {
            let mut status = lock(&self.shared.status);
            let current = status.epoch == epoch;
            let mut assigned_id = None;
            let outcome = match result {
                Ok(id) if current => {
                    status.ever_written = true;
                    status.last_error = None;
                    status.mode = match self.shared.identity {
                        Identity::Guest => PersistMode::Local,
                        Identity::User(_) => PersistMode::Remote,
                    };
                    if let Some(id) = id {
                        let mut latest = lock(&self.shared.latest);
                        if latest.id.is_none() {
                            latest.id = Some(id.clone());
                            assigned_id = Some(id);
                        }
                    }
                    if status.revision == revision {
                        status.dirty = false;
                    }
                    if std::mem::take(&mut status.adopted_local) {
                        if let Err(e) = clear_cache(self.shared.cache.as_ref()) {
                            tracing::warn!(error = %e, "could not clear adopted guest cache");
                        }
                    }
                    WriteOutcome::Written
                }
                Ok(_) => {
                    tracing::debug!("write finished for a replaced sheet");
                    WriteOutcome::Written
                }
                Err(error) => {
                    tracing::warn!(%error, "sheet write failed");
                    if current {
                        status.last_error = Some(error);
                    }
                    WriteOutcome::Failed
                }
            };
            self.set_phase(&mut status, Phase::Ready);
            let rerun = std::mem::take(&mut status.rerun) && status.dirty;
            (outcome, rerun, assigned_id)
        };

        if let Some(id) = assigned_id {
            tracing::info!(%id, "sheet saved for the first time");
            self.publish_id(Some(id));
        }
        if rerun {
            self.schedule_write();
        }
        outcome
    }

    async fn write_snapshot(&self, sheet: &Sheet) -> Result<Option<String>, PersistenceError> {
        match &self.shared.identity {
            Identity::Guest => write_sheet_to_cache(self.shared.cache.as_ref(), sheet)
                .map(|_| None)
                .map_err(|e| PersistenceError::Write(e.to_string())),
            Identity::User(owner) => self
                .shared
                .store
                .save(owner, sheet)
                .await
                .map(Some)
                .map_err(|e| PersistenceError::Write(e.to_string())),
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Replace the sheet with a fresh blank one. A signed-in user's pending
    /// edits are saved first; guests lose their cached copy.
    pub async fn start_new(&self) -> Result<Sheet, PersistenceError> {
        self.hand_over(self.shared.identity != Identity::Guest).await?;
        Ok(self.reset())
    }

    /// Destroy the durable copy, then start over with a blank sheet.
    pub async fn delete(&self) -> Result<Sheet, PersistenceError> {
        self.hand_over(false).await?;
        if let (Identity::User(_), Some(id)) = (&self.shared.identity, self.sheet_id()) {
            if let Err(e) = self.shared.store.delete(&id).await {
                self.resume();
                return Err(PersistenceError::Write(e.to_string()));
            }
            tracing::info!(%id, "sheet deleted");
        }
        Ok(self.reset())
    }

    fn reset(&self) -> Sheet {
        let sheet = Sheet::new();
        {
            let mut status = lock(&self.shared.status);
            *lock(&self.shared.latest) = sheet.clone();
            status.revision += 1;
            status.epoch += 1;
            status.dirty = false;
            status.rerun = false;
            status.ever_written = false;
            status.adopted_local = false;
            status.mode = PersistMode::Unsaved;
            status.last_error = None;
            self.set_phase(&mut status, Phase::Ready);
        }
        if self.shared.identity == Identity::Guest {
            if let Err(e) = clear_cache(self.shared.cache.as_ref()) {
                tracing::warn!(error = %e, "could not clear guest cache");
            }
        }
        self.publish_id(None);
        sheet
    }

    /// Back to `Ready` with the current sheet after an aborted replacement.
    fn resume(&self) {
        let dirty = {
            let mut status = lock(&self.shared.status);
            self.set_phase(&mut status, Phase::Ready);
            status.dirty
        };
        if dirty {
            self.schedule_write();
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
