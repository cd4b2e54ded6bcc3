//! Text corpus client.
//!
//! This module wraps the four corpus endpoints the resolver needs:
//! - direct text lookup by reference
//! - fuzzy name completion for book titles
//! - broad free-text search (disambiguation fallback)
//! - versioned text lookup (Version Selector)
//!
//! The `TextCorpus` trait is the seam between the resolver and the network.

use crate::error::CorpusError;
use crate::models::{NameCompletion, SearchHit, TextBody, TextResponse};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashSet;
use std::time::Duration;
use url::Url;

#[async_trait]
pub trait TextCorpus: Send + Sync {
    /// `GET /texts/{ref}?context=0`
    async fn fetch_text(&self, reference: &str) -> Result<TextResponse, CorpusError>;

    /// `GET /name/{term}?limit=N`
    async fn complete_name(&self, term: &str, limit: usize)
        -> Result<NameCompletion, CorpusError>;

    /// Broad search returning scored candidate references, best first.
    async fn search(&self, query: &str, size: usize) -> Result<Vec<SearchHit>, CorpusError>;

    /// `GET /texts/{ref}?context=0&version=en|{title}`
    async fn fetch_version_text(
        &self,
        reference: &str,
        version_title: &str,
    ) -> Result<TextBody, CorpusError>;
}

// ============================================================================
// Version Selector
// ============================================================================

/// Fetch one English edition of an already-resolved reference.
///
/// Never fails: transport and decoding problems come back as `None`.
pub async fn fetch_version(
    corpus: &dyn TextCorpus,
    canonical_ref: &str,
    version_title: &str,
) -> Option<TextBody> {
    match corpus.fetch_version_text(canonical_ref, version_title).await {
        Ok(body) => Some(body),
        Err(e) => {
            tracing::debug!(reference = canonical_ref, version = version_title, error = %e, "version fetch failed");
            None
        }
    }
}

// ============================================================================
// HTTP Client
// ============================================================================

pub struct CorpusClient {
    client: reqwest::Client,
    base: String,
}

impl CorpusClient {
    pub fn new(base: &Url, timeout: Duration) -> Result<Self, CorpusError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent("SourceSheets/1.0")
            .build()?;
        Ok(Self {
            client,
            base: base.as_str().trim_end_matches('/').to_string(),
        })
    }

    pub fn text_url(&self, reference: &str) -> String {
        format!(
            "{}/texts/{}?context=0",
            self.base,
            urlencoding::encode(reference)
        )
    }

    pub fn version_url(&self, reference: &str, version_title: &str) -> String {
        format!(
            "{}&version=en|{}",
            self.text_url(reference),
            urlencoding::encode(version_title)
        )
    }

    pub fn name_url(&self, term: &str, limit: usize) -> String {
        format!(
            "{}/name/{}?limit={}",
            self.base,
            urlencoding::encode(term),
            limit
        )
    }

    pub fn search_url(&self, query: &str, size: usize) -> String {
        format!(
            "{}/search?q={}&size={}",
            self.base,
            urlencoding::encode(query),
            size
        )
    }

    async fn get_json(&self, url: &str) -> Result<Value, CorpusError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(CorpusError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        let body = response.text().await?;
        Ok(serde_json::from_str(&body)?)
    }
}

#[async_trait]
impl TextCorpus for CorpusClient {
    async fn fetch_text(&self, reference: &str) -> Result<TextResponse, CorpusError> {
        let json = self.get_json(&self.text_url(reference)).await?;
        parse_text_response(json)
    }

    async fn complete_name(
        &self,
        term: &str,
        limit: usize,
    ) -> Result<NameCompletion, CorpusError> {
        let json = self.get_json(&self.name_url(term, limit)).await?;
        Ok(serde_json::from_value(json)?)
    }

    async fn search(&self, query: &str, size: usize) -> Result<Vec<SearchHit>, CorpusError> {
        let json = self.get_json(&self.search_url(query, size)).await?;
        Ok(parse_search_hits(&json, size))
    }

    async fn fetch_version_text(
        &self,
        reference: &str,
        version_title: &str,
    ) -> Result<TextBody, CorpusError> {
        let json = self
            .get_json(&self.version_url(reference, version_title))
            .await?;
        parse_version_text(json)
    }
}

// ============================================================================
// Response Parsing
// ============================================================================

/// Decode a text lookup. An `error` field in the body means "not found".
pub fn parse_text_response(json: Value) -> Result<TextResponse, CorpusError> {
    let response: TextResponse = serde_json::from_value(json)?;
    if let Some(error) = response.error.as_ref().filter(|e| !e.trim().is_empty()) {
        return Err(CorpusError::NotFound(error.clone()));
    }
    Ok(response)
}

pub fn parse_version_text(json: Value) -> Result<TextBody, CorpusError> {
    if let Some(error) = json.get("error").and_then(|e| e.as_str()) {
        return Err(CorpusError::NotFound(error.to_string()));
    }
    match json.get("text") {
        None | Some(Value::Null) => Ok(TextBody::default()),
        Some(text) => Ok(serde_json::from_value(text.clone())?),
    }
}

/// Decode search candidates, best first, de-duplicated by reference.
///
/// Accepts a plain array of `{ref, he?, en?}` or an Elasticsearch-style
/// `{hits: {hits: [{_source: {...}, highlight: {...}}]}}` body.
pub fn parse_search_hits(json: &Value, size: usize) -> Vec<SearchHit> {
    let raw: Vec<SearchHit> = if let Some(items) = json.as_array() {
        items
            .iter()
            .filter_map(|item| serde_json::from_value(item.clone()).ok())
            .collect()
    } else {
        json.get("hits")
            .and_then(|h| h.get("hits"))
            .and_then(|h| h.as_array())
            .map(|hits| hits.iter().filter_map(hit_from_es).collect())
            .unwrap_or_default()
    };

    let mut seen = HashSet::new();
    raw.into_iter()
        .filter(|hit| !hit.reference.trim().is_empty())
        .filter(|hit| seen.insert(hit.reference.clone()))
        .take(size)
        .collect()
}

fn hit_from_es(hit: &Value) -> Option<SearchHit> {
    let source = hit.get("_source")?;
    let reference = source.get("ref")?.as_str()?.to_string();
    let snippet = hit
        .get("highlight")
        .and_then(|h| h.as_object())
        .and_then(|h| h.values().next())
        .and_then(|v| v.as_array())
        .and_then(|v| v.first())
        .and_then(|v| v.as_str())
        .or_else(|| source.get("exact").and_then(|e| e.as_str()))
        .map(|s| s.to_string());
    let hebrew = source
        .get("lang")
        .and_then(|l| l.as_str())
        .map(|l| l == "he")
        .unwrap_or(false);

    Some(SearchHit {
        reference,
        he: if hebrew { snippet.clone() } else { None },
        en: if hebrew { None } else { snippet },
    })
}

// ============================================================================
// In-memory corpus for tests
// ============================================================================

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Corpus backed by maps; unknown keys behave like the real "not found".
    #[derive(Default)]
    pub struct MockCorpus {
        pub texts: HashMap<String, TextResponse>,
        pub versions: HashMap<(String, String), TextBody>,
        pub completions: HashMap<String, NameCompletion>,
        pub search_hits: HashMap<String, Vec<SearchHit>>,
        pub calls: Mutex<Vec<String>>,
    }

    impl MockCorpus {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_text(mut self, lookup: &str, canonical: &str, he: &str, en: &str) -> Self {
            self.texts.insert(
                lookup.to_string(),
                TextResponse {
                    reference: canonical.to_string(),
                    he: Some(TextBody::Text(he.to_string())),
                    text: Some(TextBody::Text(en.to_string())),
                    versions: vec![],
                    error: None,
                },
            );
            self
        }

        pub fn with_response(mut self, lookup: &str, response: TextResponse) -> Self {
            self.texts.insert(lookup.to_string(), response);
            self
        }

        pub fn with_version(mut self, reference: &str, title: &str, body: TextBody) -> Self {
            self.versions
                .insert((reference.to_string(), title.to_string()), body);
            self
        }

        pub fn with_completion(mut self, term: &str, key: &str, kind: &str) -> Self {
            self.completions.insert(
                term.to_string(),
                NameCompletion {
                    completion_objects: vec![crate::models::CompletionObject {
                        key: key.to_string(),
                        kind: kind.to_string(),
                    }],
                    is_ref: false,
                    reference: None,
                },
            );
            self
        }

        pub fn with_search(mut self, query: &str, refs: &[&str]) -> Self {
            self.search_hits.insert(
                query.to_string(),
                refs.iter()
                    .map(|r| SearchHit {
                        reference: r.to_string(),
                        he: None,
                        en: Some(format!("snippet of {}", r)),
                    })
                    .collect(),
            );
            self
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
    }

    #[async_trait]
    impl TextCorpus for MockCorpus {
        async fn fetch_text(&self, reference: &str) -> Result<TextResponse, CorpusError> {
            self.record(format!("text:{}", reference));
            self.texts
                .get(reference)
                .cloned()
                .ok_or_else(|| CorpusError::NotFound(reference.to_string()))
        }

        async fn complete_name(
            &self,
            term: &str,
            _limit: usize,
        ) -> Result<NameCompletion, CorpusError> {
            self.record(format!("name:{}", term));
            Ok(self.completions.get(term).cloned().unwrap_or_default())
        }

        async fn search(
            &self,
            query: &str,
            size: usize,
        ) -> Result<Vec<SearchHit>, CorpusError> {
            self.record(format!("search:{}", query));
            Ok(self
                .search_hits
                .get(query)
                .map(|hits| hits.iter().take(size).cloned().collect())
                .unwrap_or_default())
        }

        async fn fetch_version_text(
            &self,
            reference: &str,
            version_title: &str,
        ) -> Result<TextBody, CorpusError> {
            self.record(format!("version:{}|{}", reference, version_title));
            self.versions
                .get(&(reference.to_string(), version_title.to_string()))
                .cloned()
                .ok_or_else(|| CorpusError::NotFound(version_title.to_string()))
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
