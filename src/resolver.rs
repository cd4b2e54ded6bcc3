//! Reference resolution: turn a possibly misspelled citation into verified
//! bilingual text.
//!
//! Tiers, in order:
//! 1. direct lookup of the citation as typed
//! 2. fuzzy name completion on the title term, locator glued back on, looked up again
//! 3. alternate English editions when the default translation is empty
//! 4. broad search, surfaced as an ambiguous match for the user to choose from
//!
//! Nothing here returns an error: transport failures and genuine absence both
//! count as "not found" for the tier that hit them.

use crate::citation::normalize_citation;
use crate::corpus::{fetch_version, TextCorpus};
use crate::error::CorpusError;
use crate::models::{ResolvedSource, SearchHit, TextBody, VersionInfo};
use serde::Serialize;
use std::sync::Arc;

#[cfg(test)]
#[path = "resolver_test.rs"]
mod resolver_test;

/// Depth of a re-resolution started from a disambiguation choice. Broad
/// search is skipped at this depth so a bad candidate cannot reopen the gate.
pub const SELECTION_DEPTH: usize = 1;

/// Completion object types that name a text (as opposed to topics, people...).
const TEXT_COMPLETION_TYPES: &[&str] = &["ref", "reference", "index"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolveFailure {
    pub reason: FailureReason,
    pub citation: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Resolution {
    Resolved(ResolvedSource),
    Ambiguous {
        original_ref: String,
        candidates: Vec<ResolvedSource>,
    },
    Failed(ResolveFailure),
}

pub struct ReferenceResolver {
    corpus: Arc<dyn TextCorpus>,
    completion_limit: usize,
    search_size: usize,
}

impl ReferenceResolver {
    pub fn new(corpus: Arc<dyn TextCorpus>, completion_limit: usize, search_size: usize) -> Self {
        Self {
            corpus,
            completion_limit,
            search_size,
        }
    }

    pub fn corpus(&self) -> &dyn TextCorpus {
        self.corpus.as_ref()
    }

    pub async fn resolve(&self, citation: &str) -> Resolution {
        self.resolve_at_depth(citation, 0).await
    }

    /// Resolve a reference the user picked from a disambiguation list.
    pub async fn resolve_selected(&self, reference: &str) -> Resolution {
        self.resolve_at_depth(reference, SELECTION_DEPTH).await
    }

    async fn resolve_at_depth(&self, citation: &str, depth: usize) -> Resolution {
        let citation = citation.trim();
        if citation.is_empty() {
            return not_found(citation);
        }

        if let Some(source) = self.lookup(citation).await {
            return Resolution::Resolved(source);
        }

        // One fuzzy pass per call, never more.
        if let Some(candidate) = self.fuzzy_candidate(citation).await {
            tracing::debug!(citation, candidate = %candidate, "retrying with completed title");
            if let Some(source) = self.lookup(&candidate).await {
                return Resolution::Resolved(source);
            }
        }

        if depth < SELECTION_DEPTH {
            let candidates = self.broad_search(citation).await;
            if !candidates.is_empty() {
                tracing::info!(citation, count = candidates.len(), "citation is ambiguous");
                return Resolution::Ambiguous {
                    original_ref: citation.to_string(),
                    candidates,
                };
            }
        }

        tracing::info!(citation, "citation not found");
        not_found(citation)
    }

    /// Direct lookup. `None` unless the result has text in some language.
    async fn lookup(&self, reference: &str) -> Option<ResolvedSource> {
        let response = match self.corpus.fetch_text(reference).await {
            Ok(r) => r,
            Err(e) => {
                log_fetch_error(reference, &e);
                return None;
            }
        };
        if let Some(error) = response.error.as_ref().filter(|e| !e.trim().is_empty()) {
            tracing::debug!(reference, error = %error, "corpus reported an error");
            return None;
        }

        let canonical = if response.reference.trim().is_empty() {
            reference.to_string()
        } else {
            response.reference
        };
        let english_versions: Vec<VersionInfo> = response
            .versions
            .into_iter()
            .filter(VersionInfo::is_english)
            .collect();

        let mut english_text = response.text.unwrap_or_default();
        let mut version_title = None;
        if english_text.is_empty() && !english_versions.is_empty() {
            if let Some((title, body)) = self.first_english_version(&canonical, &english_versions).await
            {
                english_text = body;
                version_title = Some(title);
            }
        }

        let source = ResolvedSource {
            reference: canonical,
            hebrew_text: response.he.unwrap_or_default(),
            english_text,
            version_title,
            available_versions: english_versions,
        };

        if source.has_text() {
            Some(source)
        } else {
            tracing::debug!(reference, "lookup returned no text");
            None
        }
    }

    /// First edition, in listed order, with at least one non-blank segment.
    async fn first_english_version(
        &self,
        canonical_ref: &str,
        versions: &[VersionInfo],
    ) -> Option<(String, TextBody)> {
        for version in versions {
            let title = &version.version_title;
            match fetch_version(self.corpus(), canonical_ref, title).await {
                Some(body) if !body.is_empty() => return Some((title.clone(), body)),
                _ => tracing::debug!(reference = canonical_ref, version = %title, "edition has no English text"),
            }
        }
        None
    }

    /// Canonical title from name completion with the locator glued back on.
    async fn fuzzy_candidate(&self, citation: &str) -> Option<String> {
        let normalized = normalize_citation(citation);
        if normalized.title_term.is_empty() {
            return None;
        }

        let completion = match self
            .corpus
            .complete_name(&normalized.title_term, self.completion_limit)
            .await
        {
            Ok(c) => c,
            Err(e) => {
                log_fetch_error(&normalized.title_term, &e);
                return None;
            }
        };

        completion
            .completion_objects
            .iter()
            .find(|c| {
                TEXT_COMPLETION_TYPES
                    .iter()
                    .any(|t| c.kind.eq_ignore_ascii_case(t))
            })
            .map(|top| normalized.with_title(&top.key))
    }

    async fn broad_search(&self, citation: &str) -> Vec<ResolvedSource> {
        match self.corpus.search(citation, self.search_size).await {
            Ok(hits) => hits.into_iter().map(candidate_from_hit).collect(),
            Err(e) => {
                log_fetch_error(citation, &e);
                Vec::new()
            }
        }
    }
}

fn candidate_from_hit(hit: SearchHit) -> ResolvedSource {
    ResolvedSource {
        reference: hit.reference,
        hebrew_text: hit.he.map(TextBody::Text).unwrap_or_default(),
        english_text: hit.en.map(TextBody::Text).unwrap_or_default(),
        version_title: None,
        available_versions: Vec::new(),
    }
}

fn not_found(citation: &str) -> Resolution {
    Resolution::Failed(ResolveFailure {
        reason: FailureReason::NotFound,
        citation: citation.to_string(),
    })
}

fn log_fetch_error(what: &str, error: &CorpusError) {
    match error {
        CorpusError::NotFound(_) => tracing::debug!(what, error = %error, "not in corpus"),
        _ => tracing::warn!(what, error = %error, "corpus request failed"),
    }
}
