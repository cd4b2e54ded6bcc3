//! Durable storage for sheets.
//!
//! Two stores, both backed by sled:
//! - `DocumentStore`: account-owned sheets keyed by a stable id, with
//!   per-owner listing and live change notifications
//! - `LocalCache`: the guest's string-keyed cache holding one sheet under
//!   fixed keys

use crate::error::StoreError;
use crate::models::{ChatMessage, Sheet, SheetEntry, SheetSummary};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

pub const CACHE_SOURCES: &str = "sources";
pub const CACHE_MESSAGES: &str = "messages";
pub const CACHE_TITLE: &str = "title";

const DOC_TREE: &str = "sheets:doc";
const GUEST_TREE: &str = "sheets:guest";

// ============================================================================
// Document Store
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum StoreEventKind {
    Saved(SheetSummary),
    Deleted(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoreEvent {
    pub owner_id: String,
    pub kind: StoreEventKind,
}

/// Change feed for one owner's sheets.
pub struct OwnerSubscription {
    owner_id: String,
    rx: broadcast::Receiver<StoreEvent>,
}

impl OwnerSubscription {
    pub fn new(owner_id: &str, rx: broadcast::Receiver<StoreEvent>) -> Self {
        Self {
            owner_id: owner_id.to_string(),
            rx,
        }
    }

    /// Next event for this owner. `None` once the store is gone.
    pub async fn recv(&mut self) -> Option<StoreEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.owner_id == self.owner_id => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(owner = %self.owner_id, skipped, "subscription lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Write the sheet for `owner_id`, assigning an id on first save. A sheet
    /// carrying an id that is no longer stored is refused with `NotFound`.
    async fn save(&self, owner_id: &str, sheet: &Sheet) -> Result<String, StoreError>;

    async fn get(&self, id: &str) -> Result<Option<Sheet>, StoreError>;

    /// Owner of a stored sheet, if it exists.
    async fn owner_of(&self, id: &str) -> Result<Option<String>, StoreError>;

    async fn list(&self, owner_id: &str) -> Result<Vec<SheetSummary>, StoreError>;

    async fn delete(&self, id: &str) -> Result<(), StoreError>;

    fn subscribe(&self, owner_id: &str) -> OwnerSubscription;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredSheet {
    owner_id: String,
    sheet: Sheet,
}

pub struct SledDocumentStore {
    docs: sled::Tree,
    db: sled::Db,
    events: broadcast::Sender<StoreEvent>,
}

fn owner_tree(db: &sled::Db, owner_id: &str) -> Result<sled::Tree, StoreError> {
    Ok(db.open_tree(format!("sheets:owner:{}", owner_id))?)
}

/// Random 128-bit hex id.
pub fn generate_id() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let bytes: [u8; 16] = rng.gen();
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn summary_of(id: &str, sheet: &Sheet) -> SheetSummary {
    SheetSummary {
        id: id.to_string(),
        title: sheet.title.clone(),
        source_count: sheet.source_count(),
        updated_at: sheet.updated_at,
    }
}

impl SledDocumentStore {
    pub fn open(db: &sled::Db) -> Result<Self, StoreError> {
        let (events, _) = broadcast::channel(256);
        Ok(Self {
            docs: db.open_tree(DOC_TREE)?,
            db: db.clone(),
            events,
        })
    }

    fn load_record(&self, id: &str) -> Result<Option<StoredSheet>, StoreError> {
        match self.docs.get(id.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl DocumentStore for SledDocumentStore {
    async fn save(&self, owner_id: &str, sheet: &Sheet) -> Result<String, StoreError> {
        let id = match sheet.id.as_deref() {
            Some(id) => match self.load_record(id)? {
                Some(existing) if existing.owner_id != owner_id => {
                    return Err(StoreError::Forbidden(id.to_string()))
                }
                Some(_) => id.to_string(),
                // Deleted since it was opened; only a fresh save may create a record.
                None => return Err(StoreError::NotFound(id.to_string())),
            },
            None => generate_id(),
        };

        let mut stored = sheet.clone();
        stored.id = Some(id.clone());
        stored.updated_at = Utc::now();
        let record = StoredSheet {
            owner_id: owner_id.to_string(),
            sheet: stored,
        };

        self.docs
            .insert(id.as_bytes(), serde_json::to_vec(&record)?)?;
        owner_tree(&self.db, owner_id)?.insert(id.as_bytes(), Vec::<u8>::new())?;
        self.docs.flush_async().await?;

        self.events
            .send(StoreEvent {
                owner_id: owner_id.to_string(),
                kind: StoreEventKind::Saved(summary_of(&id, &record.sheet)),
            })
            .ok();
        Ok(id)
    }

    async fn get(&self, id: &str) -> Result<Option<Sheet>, StoreError> {
        Ok(self.load_record(id)?.map(|r| r.sheet))
    }

    async fn owner_of(&self, id: &str) -> Result<Option<String>, StoreError> {
        Ok(self.load_record(id)?.map(|r| r.owner_id))
    }

    async fn list(&self, owner_id: &str) -> Result<Vec<SheetSummary>, StoreError> {
        let mut summaries = Vec::new();
        for key in owner_tree(&self.db, owner_id)?.iter().keys() {
            let key = key?;
            let id = String::from_utf8_lossy(&key).to_string();
            if let Some(record) = self.load_record(&id)? {
                summaries.push(summary_of(&id, &record.sheet));
            }
        }
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(summaries)
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        if let Some(record) = self.load_record(id)? {
            self.docs.remove(id.as_bytes())?;
            owner_tree(&self.db, &record.owner_id)?.remove(id.as_bytes())?;
            self.events
                .send(StoreEvent {
                    owner_id: record.owner_id,
                    kind: StoreEventKind::Deleted(id.to_string()),
                })
                .ok();
        }
        Ok(())
    }

    fn subscribe(&self, owner_id: &str) -> OwnerSubscription {
        OwnerSubscription::new(owner_id, self.events.subscribe())
    }
}

// ============================================================================
// Local Cache
// ============================================================================

pub trait LocalCache: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    fn remove(&self, key: &str) -> Result<(), StoreError>;
}

/// One guest's cache. All guests share a tree, keyed `{guest_id}/{key}`, so
/// a guest that never writes leaves nothing behind.
pub struct SledLocalCache {
    tree: sled::Tree,
    prefix: String,
}

impl SledLocalCache {
    pub fn open(db: &sled::Db, guest_id: &str) -> Result<Self, StoreError> {
        Ok(Self {
            tree: db.open_tree(GUEST_TREE)?,
            prefix: format!("{}/", guest_id),
        })
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }
}

impl LocalCache for SledLocalCache {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .tree
            .get(self.key(key).as_bytes())?
            .map(|v| String::from_utf8_lossy(&v).to_string()))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.tree.insert(self.key(key).as_bytes(), value.as_bytes())?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.tree.remove(self.key(key).as_bytes())?;
        Ok(())
    }
}

pub fn write_sheet_to_cache(cache: &dyn LocalCache, sheet: &Sheet) -> Result<(), StoreError> {
    cache.set(CACHE_SOURCES, &serde_json::to_string(&sheet.entries)?)?;
    cache.set(CACHE_MESSAGES, &serde_json::to_string(&sheet.messages)?)?;
    cache.set(CACHE_TITLE, &sheet.title)?;
    Ok(())
}

/// Rebuild the guest sheet. `None` when the cache holds nothing at all.
pub fn read_sheet_from_cache(cache: &dyn LocalCache) -> Result<Option<Sheet>, StoreError> {
    let sources = cache.get(CACHE_SOURCES)?;
    let messages = cache.get(CACHE_MESSAGES)?;
    let title = cache.get(CACHE_TITLE)?;
    if sources.is_none() && messages.is_none() && title.is_none() {
        return Ok(None);
    }

    let mut sheet = Sheet::new();
    if let Some(raw) = sources {
        sheet.entries = serde_json::from_str::<Vec<SheetEntry>>(&raw)?;
    }
    if let Some(raw) = messages {
        let messages: Vec<ChatMessage> = serde_json::from_str(&raw)?;
        if !messages.is_empty() {
            sheet.messages = messages;
        }
    }
    if let Some(title) = title.filter(|t| !t.trim().is_empty()) {
        sheet.title = title;
    }
    Ok(Some(sheet))
}

pub fn clear_cache(cache: &dyn LocalCache) -> Result<(), StoreError> {
    for key in [CACHE_SOURCES, CACHE_MESSAGES, CACHE_TITLE] {
        cache.remove(key)?;
    }
    Ok(())
}

// ============================================================================
// In-memory stores for tests
// ============================================================================


// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NoteEntry, Role, SectionHeader};

    fn temp_db() -> sled::Db {
        sled::Config::new().temporary(true).open().unwrap()
    }

    fn sheet_with_header(label: &str) -> Sheet {
        let mut sheet = Sheet::new();
        sheet.entries.push(SheetEntry::SectionHeader(SectionHeader {
            id: "h1".to_string(),
            label: label.to_string(),
        }));
        sheet
    }

    #[tokio::test]
    async fn test_save_assigns_stable_id() {
        let db = temp_db();
        let store = SledDocumentStore::open(&db).unwrap();
        let mut sheet = sheet_with_header("Charity");

        let id = store.save("alice", &sheet).await.unwrap();
        assert_eq!(id.len(), 32);

        sheet.id = Some(id.clone());
        sheet.title = "Renamed".to_string();
        let again = store.save("alice", &sheet).await.unwrap();
        assert_eq!(again, id);

        let loaded = store.get(&id).await.unwrap().unwrap();
        assert_eq!(loaded.title, "Renamed");
        assert_eq!(loaded.id.as_deref(), Some(id.as_str()));
    }

    #[tokio::test]
    async fn test_get_missing_is_none() {
        let db = temp_db();
        let store = SledDocumentStore::open(&db).unwrap();
        assert!(store.get("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_rejects_foreign_sheet() {
        let db = temp_db();
        let store = SledDocumentStore::open(&db).unwrap();
        let mut sheet = sheet_with_header("Mine");
        sheet.id = Some(store.save("alice", &sheet).await.unwrap());

        let err = store.save("mallory", &sheet).await.unwrap_err();
        assert!(matches!(err, StoreError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_list_is_owner_scoped() {
        let db = temp_db();
        let store = SledDocumentStore::open(&db).unwrap();
        store.save("alice", &sheet_with_header("A1")).await.unwrap();
        store.save("alice", &sheet_with_header("A2")).await.unwrap();
        store.save("bob", &sheet_with_header("B1")).await.unwrap();

        let alice = store.list("alice").await.unwrap();
        assert_eq!(alice.len(), 2);
        assert!(alice.iter().all(|s| s.source_count == 0));
        assert_eq!(store.list("bob").await.unwrap().len(), 1);
        assert!(store.list("carol").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_removes_from_listing() {
        let db = temp_db();
        let store = SledDocumentStore::open(&db).unwrap();
        let id = store.save("alice", &sheet_with_header("Gone")).await.unwrap();
        store.delete(&id).await.unwrap();
        assert!(store.get(&id).await.unwrap().is_none());
        assert!(store.list("alice").await.unwrap().is_empty());
        store.delete(&id).await.unwrap();
    }

    #[tokio::test]
    async fn test_subscription_sees_only_owner_events() {
        let db = temp_db();
        let store = SledDocumentStore::open(&db).unwrap();
        let mut alice = store.subscribe("alice");

        store.save("bob", &sheet_with_header("Bob's")).await.unwrap();
        let id = store.save("alice", &sheet_with_header("Alice's")).await.unwrap();

        match alice.recv().await.unwrap().kind {
            StoreEventKind::Saved(summary) => {
                assert_eq!(summary.id, id);
                assert_eq!(summary.title, "Untitled Source Sheet");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_cache_round_trip() {
        let db = temp_db();
        let cache = SledLocalCache::open(&db, "guest-1").unwrap();
        assert!(read_sheet_from_cache(&cache).unwrap().is_none());

        let mut sheet = sheet_with_header("Intro");
        sheet.title = "Guest sheet".to_string();
        sheet.entries.push(SheetEntry::Note(NoteEntry {
            id: "n1".to_string(),
            title: None,
            body: "<p>hi</p>".to_string(),
        }));
        sheet.messages.push(ChatMessage {
            role: Role::User,
            content: "hello".to_string(),
        });
        write_sheet_to_cache(&cache, &sheet).unwrap();

        let loaded = read_sheet_from_cache(&cache).unwrap().unwrap();
        assert_eq!(loaded.title, "Guest sheet");
        assert_eq!(loaded.entries, sheet.entries);
        assert_eq!(loaded.messages.len(), 2);
        assert!(loaded.id.is_none());
    }

    #[test]
    fn test_caches_are_per_guest() {
        let db = temp_db();
        let one = SledLocalCache::open(&db, "one").unwrap();
        let two = SledLocalCache::open(&db, "two").unwrap();
        one.set(CACHE_TITLE, "Mine").unwrap();
        assert!(two.get(CACHE_TITLE).unwrap().is_none());
    }

    #[test]
    fn test_reading_an_empty_cache_stores_nothing() {
        let db = temp_db();
        let cache = SledLocalCache::open(&db, "drive-by").unwrap();
        assert!(read_sheet_from_cache(&cache).unwrap().is_none());
        assert!(db.open_tree(GUEST_TREE).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_save_refuses_deleted_sheet() {
        let db = temp_db();
        let store = SledDocumentStore::open(&db).unwrap();
        let mut sheet = sheet_with_header("Gone soon");
        let id = store.save("alice", &sheet).await.unwrap();
        store.delete(&id).await.unwrap();

        sheet.id = Some(id.clone());
        let err = store.save("alice", &sheet).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(ref missing) if *missing == id));
        assert!(store.get(&id).await.unwrap().is_none());
        assert!(store.list("alice").await.unwrap().is_empty());
    }

    #[test]
    fn test_clear_cache() {
        let db = temp_db();
        let cache = SledLocalCache::open(&db, "g").unwrap();
        write_sheet_to_cache(&cache, &sheet_with_header("x")).unwrap();
        clear_cache(&cache).unwrap();
        assert!(read_sheet_from_cache(&cache).unwrap().is_none());
    }

    #[test]
    fn test_corrupt_cache_is_an_error() {
        let db = temp_db();
        let cache = SledLocalCache::open(&db, "g").unwrap();
        cache.set(CACHE_SOURCES, "{not json").unwrap();
        assert!(matches!(
            read_sheet_from_cache(&cache),
            Err(StoreError::Corrupt(_))
        ));
    }

    #[test]
    fn test_generate_id_is_hex() {
        let id = generate_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, generate_id());
    }
}
