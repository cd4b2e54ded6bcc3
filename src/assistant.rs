//! Client for the conversational assistant.
//!
//! The assistant is an opaque service: it takes the user's message plus the
//! conversation so far and answers with text, suggested references and
//! optionally a title for the sheet.

use crate::error::AssistantError;
use crate::models::{AssistantReply, ChatMessage};
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use url::Url;

#[async_trait]
pub trait Assistant: Send + Sync {
    async fn ask(
        &self,
        message: &str,
        history: &[ChatMessage],
    ) -> Result<AssistantReply, AssistantError>;
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    message: &'a str,
    history: &'a [ChatMessage],
}

pub struct HttpAssistant {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpAssistant {
    pub fn new(base: &Url, timeout: Duration) -> Result<Self, AssistantError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent("SourceSheets/1.0")
            .build()?;
        Ok(Self {
            client,
            endpoint: chat_url(base),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

pub fn chat_url(base: &Url) -> String {
    format!("{}/chat", base.as_str().trim_end_matches('/'))
}

#[async_trait]
impl Assistant for HttpAssistant {
    async fn ask(
        &self,
        message: &str,
        history: &[ChatMessage],
    ) -> Result<AssistantReply, AssistantError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&ChatRequest { message, history })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            tracing::warn!(status = status.as_u16(), "assistant request rejected");
            return Err(AssistantError::Status(status.as_u16()));
        }
        Ok(response.json::<AssistantReply>().await?)
    }
}
