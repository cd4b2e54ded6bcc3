//! Edit session: one user's open sheet.
//!
//! The session owns the in-memory sheet, its undo history and the
//! disambiguation gate. Every mutation updates history synchronously and then
//! hands the new state to the persistence coordinator, which marks it dirty
//! and schedules the write.

use crate::assistant::Assistant;
use crate::corpus::fetch_version;
use crate::disambiguation::{DisambiguationGate, GateState};
use crate::error::{AssistantError, SessionError};
use crate::history::EditHistory;
use crate::models::{
    AssistantReply, ChatMessage, DisambiguationRequest, NoteEntry, ResolvedSource, Role,
    SectionHeader, Sheet, SheetEntry, TextBody, TextSource, ViewMode,
};
use crate::persistence::{CoordinatorStatus, LoadOutcome, PersistenceCoordinator};
use crate::resolver::{FailureReason, ReferenceResolver, Resolution, ResolveFailure};
use crate::store::generate_id;
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "data", rename_all = "snake_case")]
pub enum AddOutcome {
    Added(SheetEntry),
    NeedsDisambiguation(DisambiguationRequest),
    NotFound(ResolveFailure),
}

/// Everything a client needs to render the session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub sheet: Sheet,
    pub can_undo: bool,
    pub can_redo: bool,
    pub disambiguation: GateState,
    pub persistence: CoordinatorStatus,
}

pub struct EditSession {
    sheet: Sheet,
    history: EditHistory<Vec<SheetEntry>>,
    gate: DisambiguationGate,
    resolver: Arc<ReferenceResolver>,
    coordinator: PersistenceCoordinator,
    assistant: Option<Arc<dyn Assistant>>,
}

impl EditSession {
    pub fn new(
        resolver: Arc<ReferenceResolver>,
        coordinator: PersistenceCoordinator,
        assistant: Option<Arc<dyn Assistant>>,
    ) -> Self {
        let sheet = Sheet::new();
        Self {
            history: EditHistory::new(sheet.entries.clone()),
            sheet,
            gate: DisambiguationGate::new(),
            resolver,
            coordinator,
            assistant,
        }
    }

    pub fn sheet(&self) -> &Sheet {
        &self.sheet
    }

    pub fn coordinator(&self) -> &PersistenceCoordinator {
        &self.coordinator
    }

    pub fn view(&mut self) -> SessionView {
        self.sync_id();
        SessionView {
            sheet: self.sheet.clone(),
            can_undo: self.history.can_undo(),
            can_redo: self.history.can_redo(),
            disambiguation: self.gate.state().clone(),
            persistence: self.coordinator.status(),
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Hydrate from storage; history starts over from the loaded entries.
    pub async fn load(
        &mut self,
        sheet_id: Option<&str>,
        is_new: bool,
    ) -> Result<LoadOutcome, SessionError> {
        let outcome = self.coordinator.load(sheet_id, is_new).await?;
        self.replace_sheet(outcome.sheet.clone());
        Ok(outcome)
    }

    pub async fn start_new(&mut self) -> Result<(), SessionError> {
        let sheet = self.coordinator.start_new().await?;
        self.replace_sheet(sheet);
        Ok(())
    }

    pub async fn delete(&mut self) -> Result<(), SessionError> {
        let sheet = self.coordinator.delete().await?;
        self.replace_sheet(sheet);
        Ok(())
    }

    fn replace_sheet(&mut self, sheet: Sheet) {
        self.history.reset(sheet.entries.clone());
        self.sheet = sheet;
        if self.gate.is_open() {
            self.gate.cancel().ok();
        }
    }

    // ========================================================================
    // Adding sources
    // ========================================================================

    /// Resolve a citation and append it, or open the gate when the citation
    /// is ambiguous. Rejected while another disambiguation is pending.
    pub async fn add_source(
        &mut self,
        citation: &str,
        view_mode: ViewMode,
    ) -> Result<AddOutcome, SessionError> {
        let citation = citation.trim();
        if citation.is_empty() {
            return Err(SessionError::EmptyInput("citation"));
        }
        if let Some(pending) = self.gate.pending() {
            return Err(SessionError::DisambiguationPending(
                pending.original_ref.clone(),
            ));
        }

        match self.resolver.resolve(citation).await {
            Resolution::Resolved(source) => {
                let entry = self.append_source(source, generate_id(), view_mode)?;
                Ok(AddOutcome::Added(entry))
            }
            Resolution::Ambiguous {
                original_ref,
                candidates,
            } => {
                let request = DisambiguationRequest {
                    pending_entry: SheetEntry::TextSource(placeholder(&original_ref, view_mode)),
                    original_ref,
                    candidates,
                };
                self.gate.open(request.clone())?;
                Ok(AddOutcome::NeedsDisambiguation(request))
            }
            Resolution::Failed(failure) => Ok(AddOutcome::NotFound(failure)),
        }
    }

    /// Fill the pending entry from the chosen candidate.
    pub async fn select_candidate(&mut self, reference: &str) -> Result<AddOutcome, SessionError> {
        let selection = self.gate.select(&self.resolver, reference).await?;
        let (id, view_mode) = match selection.pending_entry {
            SheetEntry::TextSource(pending) => (pending.id, pending.view_mode),
            other => (other.id().to_string(), ViewMode::default()),
        };

        match selection.resolution {
            Resolution::Resolved(source) => {
                let entry = self.append_source(source, id, view_mode)?;
                Ok(AddOutcome::Added(entry))
            }
            Resolution::Failed(failure) => Ok(AddOutcome::NotFound(failure)),
            Resolution::Ambiguous { original_ref, .. } => {
                tracing::warn!(reference, "selected candidate came back ambiguous");
                Ok(AddOutcome::NotFound(ResolveFailure {
                    reason: FailureReason::NotFound,
                    citation: original_ref,
                }))
            }
        }
    }

    pub fn cancel_disambiguation(&mut self) -> Result<(), SessionError> {
        self.gate.cancel().map(|_| ())
    }

    fn append_source(
        &mut self,
        source: ResolvedSource,
        id: String,
        view_mode: ViewMode,
    ) -> Result<SheetEntry, SessionError> {
        if !source.has_text() {
            return Err(SessionError::EmptySource(source.reference));
        }
        let entry = SheetEntry::TextSource(source.into_entry(id, view_mode));
        self.sheet.entries.push(entry.clone());
        self.commit();
        Ok(entry)
    }

    // ========================================================================
    // Other entries
    // ========================================================================

    pub fn add_note(&mut self, title: Option<&str>, body: &str) -> Result<SheetEntry, SessionError> {
        let body = ammonia::clean(body);
        if body.trim().is_empty() {
            return Err(SessionError::EmptyInput("note"));
        }
        let entry = SheetEntry::Note(NoteEntry {
            id: generate_id(),
            title: title
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string),
            body,
        });
        self.sheet.entries.push(entry.clone());
        self.commit();
        Ok(entry)
    }

    pub fn add_header(&mut self, label: &str) -> Result<SheetEntry, SessionError> {
        let label = label.trim();
        if label.is_empty() {
            return Err(SessionError::EmptyInput("header"));
        }
        let entry = SheetEntry::SectionHeader(SectionHeader {
            id: generate_id(),
            label: label.to_string(),
        });
        self.sheet.entries.push(entry.clone());
        self.commit();
        Ok(entry)
    }

    pub fn remove_entry(&mut self, id: &str) -> Result<SheetEntry, SessionError> {
        let index = self.position(id)?;
        let removed = self.sheet.entries.remove(index);
        self.commit();
        Ok(removed)
    }

    /// Move an entry to `to_index`, clamped to the end of the sheet.
    pub fn move_entry(&mut self, id: &str, to_index: usize) -> Result<(), SessionError> {
        let from = self.position(id)?;
        let to = to_index.min(self.sheet.entries.len() - 1);
        if from == to {
            return Ok(());
        }
        let entry = self.sheet.entries.remove(from);
        self.sheet.entries.insert(to, entry);
        self.commit();
        Ok(())
    }

    pub fn set_view_mode(&mut self, id: &str, view_mode: ViewMode) -> Result<(), SessionError> {
        let source = self.text_source_mut(id)?;
        if source.view_mode == view_mode {
            return Ok(());
        }
        source.view_mode = view_mode;
        self.commit();
        Ok(())
    }

    /// Swap the English body of a source for another listed edition.
    pub async fn change_version(
        &mut self,
        id: &str,
        version_title: &str,
    ) -> Result<SheetEntry, SessionError> {
        let reference = {
            let source = self.text_source_mut(id)?;
            if !source
                .available_versions
                .iter()
                .any(|v| v.version_title == version_title)
            {
                return Err(SessionError::VersionUnavailable(version_title.to_string()));
            }
            source.reference.clone()
        };

        let body = fetch_version(self.resolver.corpus(), &reference, version_title)
            .await
            .filter(|body| !body.is_empty())
            .ok_or_else(|| SessionError::VersionUnavailable(version_title.to_string()))?;

        // The entry may have gone while the corpus answered.
        let source = self.text_source_mut(id)?;
        source.english_text = body;
        source.version_title = Some(version_title.to_string());
        let entry = SheetEntry::TextSource(source.clone());
        self.commit();
        Ok(entry)
    }

    fn position(&self, id: &str) -> Result<usize, SessionError> {
        self.sheet
            .entries
            .iter()
            .position(|e| e.id() == id)
            .ok_or_else(|| SessionError::EntryNotFound(id.to_string()))
    }

    fn text_source_mut(&mut self, id: &str) -> Result<&mut TextSource, SessionError> {
        let index = self.position(id)?;
        match &mut self.sheet.entries[index] {
            SheetEntry::TextSource(source) => Ok(source),
            _ => Err(SessionError::NotATextSource(id.to_string())),
        }
    }

    // ========================================================================
    // Title, history, conversation
    // ========================================================================

    pub fn set_title(&mut self, title: &str) -> Result<(), SessionError> {
        let title = title.trim();
        if title.is_empty() {
            return Err(SessionError::EmptyInput("title"));
        }
        self.sheet.title = title.to_string();
        self.persist();
        Ok(())
    }

    pub fn undo(&mut self) -> bool {
        match self.history.undo() {
            Some(entries) => {
                self.sheet.entries = entries.clone();
                self.persist();
                true
            }
            None => false,
        }
    }

    pub fn redo(&mut self) -> bool {
        match self.history.redo() {
            Some(entries) => {
                self.sheet.entries = entries.clone();
                self.persist();
                true
            }
            None => false,
        }
    }

    /// Ask the assistant. Both sides of the exchange join the conversation,
    /// and a suggested title replaces the default one.
    pub async fn chat(&mut self, message: &str) -> Result<AssistantReply, SessionError> {
        let message = message.trim();
        if message.is_empty() {
            return Err(SessionError::EmptyInput("message"));
        }
        let assistant = self
            .assistant
            .clone()
            .ok_or_else(|| SessionError::Assistant(AssistantError::NotConfigured.to_string()))?;

        let reply = assistant
            .ask(message, &self.sheet.messages)
            .await
            .map_err(|e| SessionError::Assistant(e.to_string()))?;

        self.sheet.messages.push(ChatMessage {
            role: Role::User,
            content: message.to_string(),
        });
        self.sheet.messages.push(ChatMessage {
            role: Role::Assistant,
            content: reply.content.clone(),
        });
        if let Some(title) = reply.suggested_title.as_deref().map(str::trim) {
            if !title.is_empty() && self.sheet.has_default_title() {
                self.sheet.title = title.to_string();
            }
        }
        self.persist();
        Ok(reply)
    }

    // ========================================================================
    // Persistence hand-off
    // ========================================================================

    fn commit(&mut self) {
        self.history.push(self.sheet.entries.clone());
        self.persist();
    }

    fn persist(&mut self) {
        self.sync_id();
        self.coordinator.mark_changed(self.sheet.clone());
    }

    fn sync_id(&mut self) {
        if let Some(id) = self.coordinator.sheet_id() {
            self.sheet.id = Some(id);
        }
    }
}

/// Stand-in entry for a citation awaiting a disambiguation choice.
fn placeholder(citation: &str, view_mode: ViewMode) -> TextSource {
    TextSource {
        id: generate_id(),
        reference: citation.to_string(),
        hebrew_text: TextBody::default(),
        english_text: TextBody::default(),
        version_title: None,
        available_versions: Vec::new(),
        view_mode,
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assistant::mock::ScriptedAssistant;
    use crate::corpus::mock::MockCorpus;
    use crate::models::{VersionInfo, DEFAULT_TITLE};
    use crate::persistence::{Identity, Phase};
    use crate::store::memory::{MemoryCache, MemoryStore};
    use std::time::Duration;

    const RADBAZ: &str = "Radbaz on Mishneh Torah, Gifts to the Poor 7:3";

    struct Harness {
        session: EditSession,
        store: Arc<MemoryStore>,
        cache: Arc<MemoryCache>,
    }

    async fn harness(corpus: MockCorpus, identity: Identity) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(MemoryCache::default());
        let coordinator = PersistenceCoordinator::new(
            identity,
            store.clone(),
            cache.clone(),
            Duration::from_secs(2),
        );
        let resolver = Arc::new(ReferenceResolver::new(Arc::new(corpus), 10, 10));
        let assistant: Arc<dyn Assistant> = Arc::new(ScriptedAssistant::new(
            "Here are some sources on charity.",
            &["Deuteronomy 15:7"],
            Some("Charity"),
        ));
        let mut session = EditSession::new(resolver, coordinator, Some(assistant));
        session.load(None, true).await.unwrap();
        Harness {
            session,
            store,
            cache,
        }
    }

    fn user() -> Identity {
        Identity::User("alice".to_string())
    }

    fn genesis() -> MockCorpus {
        MockCorpus::new().with_text(
            "Genesis 1:1",
            "Genesis 1:1",
            "בְּרֵאשִׁית בָּרָא אֱלֹהִים",
            "In the beginning God created the heaven and the earth.",
        )
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    fn source_refs(session: &EditSession) -> Vec<String> {
        session
            .sheet()
            .entries
            .iter()
            .filter_map(|e| match e {
                SheetEntry::TextSource(s) => Some(s.reference.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_genesis_added_and_saved_with_stable_id() {
        let mut h = harness(genesis(), user()).await;

        let outcome = h
            .session
            .add_source("Genesis 1:1", ViewMode::Bilingual)
            .await
            .unwrap();
        assert!(matches!(outcome, AddOutcome::Added(_)));
        assert!(h.session.view().persistence.dirty);

        settle().await;
        assert_eq!(h.store.save_count(), 1);
        let view = h.session.view();
        assert!(!view.persistence.dirty);
        let id = view.sheet.id.clone().expect("sheet has an id after its first write");

        h.session.set_title("Creation").unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(h.store.save_count(), 2);
        assert_eq!(h.store.last_saved().unwrap().id, Some(id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_radbaz_opens_gate_and_cancel_adds_nothing() {
        let corpus = MockCorpus::new().with_search(
            RADBAZ,
            &[
                "Radbaz on Mishneh Torah, Gifts to Poor 7:3",
                "Mishneh Torah, Gifts to the Poor 7:3",
            ],
        );
        let mut h = harness(corpus, user()).await;

        match h.session.add_source(RADBAZ, ViewMode::English).await.unwrap() {
            AddOutcome::NeedsDisambiguation(request) => {
                assert_eq!(request.candidates.len(), 2);
                assert_eq!(request.original_ref, RADBAZ);
            }
            other => panic!("expected disambiguation, got {:?}", other),
        }
        assert!(matches!(h.session.view().disambiguation, GateState::Open(_)));

        let err = h
            .session
            .add_source("Genesis 1:1", ViewMode::Bilingual)
            .await
            .unwrap_err();
        assert_eq!(err, SessionError::DisambiguationPending(RADBAZ.to_string()));

        h.session.cancel_disambiguation().unwrap();
        settle().await;
        let view = h.session.view();
        assert_eq!(view.disambiguation, GateState::Closed);
        assert!(view.sheet.entries.is_empty());
        assert_eq!(h.store.attempt_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_selected_candidate_fills_pending_entry() {
        let corpus = MockCorpus::new()
            .with_search(RADBAZ, &["Mishneh Torah, Gifts to the Poor 7:3"])
            .with_text(
                "Mishneh Torah, Gifts to the Poor 7:3",
                "Mishneh Torah, Gifts to the Poor 7:3",
                "חייב אדם",
                "A person is obligated",
            );
        let mut h = harness(corpus, user()).await;

        let pending_id = match h.session.add_source(RADBAZ, ViewMode::Hebrew).await.unwrap() {
            AddOutcome::NeedsDisambiguation(request) => request.pending_entry.id().to_string(),
            other => panic!("expected disambiguation, got {:?}", other),
        };

        let outcome = h
            .session
            .select_candidate("Mishneh Torah, Gifts to the Poor 7:3")
            .await
            .unwrap();
        match outcome {
            AddOutcome::Added(SheetEntry::TextSource(source)) => {
                assert_eq!(source.id, pending_id);
                assert_eq!(source.view_mode, ViewMode::Hebrew);
                assert_eq!(source.reference, "Mishneh Torah, Gifts to the Poor 7:3");
            }
            other => panic!("expected an added source, got {:?}", other),
        }
        assert_eq!(h.session.view().disambiguation, GateState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresolvable_citation_is_reported() {
        let mut h = harness(MockCorpus::new(), user()).await;
        let outcome = h
            .session
            .add_source("Nonexistent Book 3:4", ViewMode::Bilingual)
            .await
            .unwrap();
        assert!(matches!(outcome, AddOutcome::NotFound(_)));
        assert!(h.session.sheet().entries.is_empty());
        assert!(!h.session.view().can_undo);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_citation_is_rejected() {
        let mut h = harness(MockCorpus::new(), user()).await;
        let err = h.session.add_source("  ", ViewMode::Bilingual).await.unwrap_err();
        assert_eq!(err, SessionError::EmptyInput("citation"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_undo_redo_restores_entries() {
        let mut h = harness(genesis(), Identity::Guest).await;
        h.session
            .add_source("Genesis 1:1", ViewMode::Bilingual)
            .await
            .unwrap();
        h.session.add_header("Creation").unwrap();
        assert_eq!(h.session.sheet().entries.len(), 2);

        assert!(h.session.undo());
        assert_eq!(h.session.sheet().entries.len(), 1);
        assert!(h.session.undo());
        assert!(h.session.sheet().entries.is_empty());
        assert!(!h.session.undo());

        assert!(h.session.redo());
        assert_eq!(source_refs(&h.session), vec!["Genesis 1:1".to_string()]);

        h.session.add_header("Light").unwrap();
        assert!(!h.session.view().can_redo);
    }

    #[tokio::test(start_paused = true)]
    async fn test_notes_are_sanitized() {
        let mut h = harness(MockCorpus::new(), Identity::Guest).await;
        let entry = h
            .session
            .add_note(Some(" Thoughts "), "<p>Give freely</p><script>alert(1)</script>")
            .unwrap();
        match entry {
            SheetEntry::Note(note) => {
                assert_eq!(note.title.as_deref(), Some("Thoughts"));
                assert!(note.body.contains("<p>Give freely</p>"));
                assert!(!note.body.contains("script"));
            }
            other => panic!("expected a note, got {:?}", other),
        }

        let err = h.session.add_note(None, "<script>x</script>").unwrap_err();
        assert_eq!(err, SessionError::EmptyInput("note"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_guest_edits_reach_local_cache() {
        let mut h = harness(genesis(), Identity::Guest).await;
        h.session.add_header("Intro").unwrap();
        settle().await;
        assert!(h.cache.write_count() > 0);
        assert_eq!(h.store.attempt_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_move_and_remove_entries() {
        let mut h = harness(MockCorpus::new(), Identity::Guest).await;
        let a = h.session.add_header("A").unwrap().id().to_string();
        let b = h.session.add_header("B").unwrap().id().to_string();
        let c = h.session.add_header("C").unwrap().id().to_string();

        h.session.move_entry(&c, 0).unwrap();
        h.session.move_entry(&a, 99).unwrap();
        let order: Vec<&str> = h.session.sheet().entries.iter().map(|e| e.id()).collect();
        assert_eq!(order, vec![c.as_str(), b.as_str(), a.as_str()]);

        h.session.remove_entry(&b).unwrap();
        assert_eq!(h.session.sheet().entries.len(), 2);
        assert_eq!(
            h.session.remove_entry(&b).unwrap_err(),
            SessionError::EntryNotFound(b.clone())
        );
        assert_eq!(
            h.session.set_view_mode(&a, ViewMode::Hebrew).unwrap_err(),
            SessionError::NotATextSource(a.clone())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_change_version_swaps_english_body() {
        let mut corpus = genesis();
        if let Some(response) = corpus.texts.get_mut("Genesis 1:1") {
            response.versions = vec![VersionInfo {
                version_title: "JPS 1917".to_string(),
                language: "en".to_string(),
            }];
        }
        let corpus = corpus.with_version(
            "Genesis 1:1",
            "JPS 1917",
            TextBody::Text("In the beginning God created".to_string()),
        );
        let mut h = harness(corpus, Identity::Guest).await;
        let id = match h
            .session
            .add_source("Genesis 1:1", ViewMode::Bilingual)
            .await
            .unwrap()
        {
            AddOutcome::Added(entry) => entry.id().to_string(),
            other => panic!("expected an added source, got {:?}", other),
        };

        match h.session.change_version(&id, "JPS 1917").await.unwrap() {
            SheetEntry::TextSource(source) => {
                assert_eq!(source.version_title.as_deref(), Some("JPS 1917"));
                assert_eq!(
                    source.english_text.segments(),
                    vec!["In the beginning God created".to_string()]
                );
            }
            other => panic!("expected a source, got {:?}", other),
        }

        let err = h.session.change_version(&id, "Unlisted").await.unwrap_err();
        assert_eq!(err, SessionError::VersionUnavailable("Unlisted".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_chat_records_exchange_and_suggests_title() {
        let mut h = harness(MockCorpus::new(), user()).await;
        let reply = h.session.chat("Sources on charity").await.unwrap();
        assert_eq!(reply.suggested_sources[0].reference, "Deuteronomy 15:7");

        let sheet = h.session.sheet();
        assert_eq!(sheet.title, "Charity");
        assert_eq!(sheet.messages.len(), 3);
        assert_eq!(sheet.messages[1].role, Role::User);

        settle().await;
        assert_eq!(h.store.save_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_chat_keeps_user_title() {
        let mut h = harness(MockCorpus::new(), Identity::Guest).await;
        h.session.set_title("My own title").unwrap();
        h.session.chat("Sources on charity").await.unwrap();
        assert_eq!(h.session.sheet().title, "My own title");
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_new_resets_everything() {
        let mut h = harness(genesis(), user()).await;
        h.session
            .add_source("Genesis 1:1", ViewMode::Bilingual)
            .await
            .unwrap();
        settle().await;
        assert!(h.session.view().sheet.id.is_some());

        h.session.start_new().await.unwrap();
        let view = h.session.view();
        assert!(view.sheet.id.is_none());
        assert!(view.sheet.entries.is_empty());
        assert_eq!(view.sheet.title, DEFAULT_TITLE);
        assert!(!view.can_undo);
        assert_eq!(view.persistence.phase, Phase::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_new_keeps_unsaved_edits() {
        let mut h = harness(genesis(), user()).await;
        h.session
            .add_source("Genesis 1:1", ViewMode::Bilingual)
            .await
            .unwrap();
        settle().await;
        h.session.add_header("Creation").unwrap();

        h.session.start_new().await.unwrap();
        assert_eq!(h.store.save_count(), 2);
        assert_eq!(h.store.last_saved().unwrap().entries.len(), 2);
        assert!(h.session.sheet().entries.is_empty());
    }

    #[tokio::test]
    async fn test_chat_without_assistant() {
        let coordinator = PersistenceCoordinator::new(
            Identity::Guest,
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryCache::default()),
            Duration::from_secs(2),
        );
        let resolver = Arc::new(ReferenceResolver::new(Arc::new(MockCorpus::new()), 10, 10));
        let mut session = EditSession::new(resolver, coordinator, None);
        session.load(None, false).await.unwrap();

        let err = session.chat("Sources on charity").await.unwrap_err();
        assert_eq!(
            err,
            SessionError::Assistant(AssistantError::NotConfigured.to_string())
        );
        assert_eq!(session.sheet().messages.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reload_resets_history() {
        let mut h = harness(genesis(), user()).await;
        h.session
            .add_source("Genesis 1:1", ViewMode::Bilingual)
            .await
            .unwrap();
        settle().await;
        let id = h.session.view().sheet.id.unwrap();

        let outcome = h.session.load(Some(&id), false).await.unwrap();
        assert_eq!(outcome.sheet.entries.len(), 1);
        let view = h.session.view();
        assert!(!view.can_undo);
        assert_eq!(source_refs(&h.session), vec!["Genesis 1:1".to_string()]);
    }
}
