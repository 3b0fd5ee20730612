use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("chat webhook request failed: {0}")]
    Request(String),

    #[error("chat webhook rejected message with status {0}")]
    Rejected(u16),
}

#[async_trait]
pub trait ChatGateway: Send + Sync {
    async fn post_message(&self, text: &str) -> Result<(), ChatError>;
}

/// Posts `{"text": ...}` to an incoming-webhook URL.
pub struct WebhookChatGateway {
    client: Client,
    url: String,
}

impl WebhookChatGateway {
    pub fn new(url: String, timeout: Duration) -> Result<Self, ChatError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| ChatError::Request(err.to_string()))?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl ChatGateway for WebhookChatGateway {
    async fn post_message(&self, text: &str) -> Result<(), ChatError> {
        let response = self
            .client
            .post(&self.url)
            .json(&json!({ "text": text }))
            .send()
            .await
            .map_err(|err| ChatError::Request(err.to_string()))?;

        if !response.status().is_success() {
            return Err(ChatError::Rejected(response.status().as_u16()));
        }
        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
pub struct LogChatGateway;

#[async_trait]
impl ChatGateway for LogChatGateway {
    async fn post_message(&self, text: &str) -> Result<(), ChatError> {
        info!(alert = %text, "chat alert");
        Ok(())
    }
}
