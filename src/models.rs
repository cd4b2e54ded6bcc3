//! Data models for source sheets.
//!
//! This module contains the core data structures shared by the resolver, the
//! edit session and the persistence layer: sheet entries, text bodies,
//! versions, the sheet itself, and the request/response shapes of the corpus
//! and assistant services.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Greeting every fresh sheet starts its conversation with.
pub const WELCOME_MESSAGE: &str =
    "Welcome! Tell me what you're studying and I'll suggest sources for your sheet.";

/// Title given to sheets the user has not named yet.
pub const DEFAULT_TITLE: &str = "Untitled Source Sheet";

// ============================================================================
// Text Bodies
// ============================================================================

/// Text of a passage: either one string or an ordered list of segments.
///
/// Multi-segment passages may contain nulls (missing segments) and, for
/// ranges spanning chapters, nested segment lists.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum TextBody {
    Text(String),
    Segments(Vec<Option<TextBody>>),
}

impl Default for TextBody {
    fn default() -> Self {
        TextBody::Text(String::new())
    }
}

impl TextBody {
    /// True when every segment is null or blank.
    pub fn is_empty(&self) -> bool {
        match self {
            TextBody::Text(s) => s.trim().is_empty(),
            TextBody::Segments(segments) => segments
                .iter()
                .all(|s| s.as_ref().map_or(true, TextBody::is_empty)),
        }
    }

    /// Non-blank segments in reading order, nested ranges flattened.
    pub fn segments(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_segments(&mut out);
        out
    }

    fn collect_segments(&self, out: &mut Vec<String>) {
        match self {
            TextBody::Text(s) => {
                if !s.trim().is_empty() {
                    out.push(s.clone());
                }
            }
            TextBody::Segments(segments) => {
                for segment in segments.iter().flatten() {
                    segment.collect_segments(out);
                }
            }
        }
    }
}

// ============================================================================
// Versions
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VersionInfo {
    pub version_title: String,
    #[serde(default)]
    pub language: String,
}

impl VersionInfo {
    pub fn is_english(&self) -> bool {
        self.language.eq_ignore_ascii_case("en")
    }
}

// ============================================================================
// Sheet Entries
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ViewMode {
    #[default]
    Bilingual,
    Hebrew,
    English,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TextSource {
    pub id: String,
    #[serde(rename = "ref")]
    pub reference: String,
    pub hebrew_text: TextBody,
    pub english_text: TextBody,
    pub version_title: Option<String>,
    #[serde(default)]
    pub available_versions: Vec<VersionInfo>,
    #[serde(default)]
    pub view_mode: ViewMode,
}

impl TextSource {
    pub fn has_text(&self) -> bool {
        !(self.hebrew_text.is_empty() && self.english_text.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NoteEntry {
    pub id: String,
    pub title: Option<String>,
    /// Sanitized HTML.
    pub body: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SectionHeader {
    pub id: String,
    pub label: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SheetEntry {
    TextSource(TextSource),
    Note(NoteEntry),
    SectionHeader(SectionHeader),
}

impl SheetEntry {
    pub fn id(&self) -> &str {
        match self {
            SheetEntry::TextSource(s) => &s.id,
            SheetEntry::Note(n) => &n.id,
            SheetEntry::SectionHeader(h) => &h.id,
        }
    }

    /// Whether this entry may be written to durable storage.
    pub fn is_persistable(&self) -> bool {
        match self {
            SheetEntry::TextSource(s) => s.has_text(),
            _ => true,
        }
    }
}

/// A source as the resolver returns it, before the session gives it an id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedSource {
    #[serde(rename = "ref")]
    pub reference: String,
    pub hebrew_text: TextBody,
    pub english_text: TextBody,
    pub version_title: Option<String>,
    pub available_versions: Vec<VersionInfo>,
}

impl ResolvedSource {
    pub fn has_text(&self) -> bool {
        !(self.hebrew_text.is_empty() && self.english_text.is_empty())
    }

    pub fn into_entry(self, id: String, view_mode: ViewMode) -> TextSource {
        TextSource {
            id,
            reference: self.reference,
            hebrew_text: self.hebrew_text,
            english_text: self.english_text,
            version_title: self.version_title,
            available_versions: self.available_versions,
            view_mode,
        }
    }
}

// ============================================================================
// Conversation
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn welcome() -> Self {
        ChatMessage {
            role: Role::Assistant,
            content: WELCOME_MESSAGE.to_string(),
        }
    }

    pub fn is_welcome(&self) -> bool {
        self.role == Role::Assistant && self.content == WELCOME_MESSAGE
    }
}

// ============================================================================
// Sheet
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GoogleDocLink {
    pub id: String,
    pub url: String,
    pub last_synced_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Sheet {
    pub id: Option<String>,
    pub title: String,
    pub entries: Vec<SheetEntry>,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub google_doc_link: Option<GoogleDocLink>,
}

impl Sheet {
    pub fn new() -> Self {
        Sheet {
            id: None,
            title: DEFAULT_TITLE.to_string(),
            entries: Vec::new(),
            messages: vec![ChatMessage::welcome()],
            updated_at: Utc::now(),
            google_doc_link: None,
        }
    }

    /// No entries and nothing in the conversation beyond the welcome message.
    pub fn is_blank(&self) -> bool {
        self.entries.is_empty() && self.messages.iter().all(ChatMessage::is_welcome)
    }

    pub fn has_default_title(&self) -> bool {
        self.title.trim().is_empty() || self.title == DEFAULT_TITLE
    }

    pub fn source_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| matches!(e, SheetEntry::TextSource(_)))
            .count()
    }
}

impl Default for Sheet {
    fn default() -> Self {
        Self::new()
    }
}

/// Listing row for an owner's sheets.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SheetSummary {
    pub id: String,
    pub title: String,
    pub source_count: usize,
    pub updated_at: DateTime<Utc>,
}

// ============================================================================
// Disambiguation
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DisambiguationRequest {
    pub original_ref: String,
    pub candidates: Vec<ResolvedSource>,
    pub pending_entry: SheetEntry,
}

// ============================================================================
// Corpus API Shapes
// ============================================================================

/// Body of `GET /texts/{ref}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TextResponse {
    #[serde(rename = "ref", default)]
    pub reference: String,
    #[serde(default)]
    pub he: Option<TextBody>,
    #[serde(default)]
    pub text: Option<TextBody>,
    #[serde(default)]
    pub versions: Vec<VersionInfo>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompletionObject {
    pub key: String,
    #[serde(rename = "type", default)]
    pub kind: String,
}

/// Body of `GET /name/{term}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct NameCompletion {
    #[serde(default)]
    pub completion_objects: Vec<CompletionObject>,
    #[serde(default)]
    pub is_ref: bool,
    #[serde(rename = "ref", default)]
    pub reference: Option<String>,
}

/// One candidate of the broad search.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchHit {
    #[serde(rename = "ref")]
    pub reference: String,
    #[serde(default)]
    pub he: Option<String>,
    #[serde(default)]
    pub en: Option<String>,
}

// ============================================================================
// Assistant API Shapes
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SuggestedSource {
    #[serde(rename = "ref")]
    pub reference: String,
    #[serde(default)]
    pub summary: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssistantReply {
    pub content: String,
    #[serde(default)]
    pub suggested_sources: Vec<SuggestedSource>,
    #[serde(default)]
    pub suggested_title: Option<String>,
}

// ============================================================================
// Tests
// ============================================================================
