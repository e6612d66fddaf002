//! Telegram Bot API notifier.
//!
//! Sends operator notifications (digests, approval requests) as plain text
//! messages. Delivery failures are logged, never raised.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::warn;

use super::Notifier;
use crate::config::TelegramSettings;

const DEFAULT_API_BASE: &str = "https://api.telegram.org";

/// Telegram messages are capped at 4096 characters
const MAX_MESSAGE_CHARS: usize = 4096;

/// Response from Telegram API
#[derive(Debug, Deserialize)]
struct TelegramResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

/// Message result from sendMessage
#[derive(Debug, Deserialize)]
struct MessageResult {
    message_id: i64,
}

pub struct TelegramNotifier {
    api_base: String,
    bot_token: String,
    chat_id: String,
    client: reqwest::Client,
}

impl TelegramNotifier {
    pub fn new(settings: TelegramSettings) -> Self {
        Self::with_api_base(settings, DEFAULT_API_BASE)
    }

    /// Point at a different API host (self-hosted Bot API server, tests)
    pub fn with_api_base(settings: TelegramSettings, api_base: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            bot_token: settings.bot_token,
            chat_id: settings.chat_id,
            client: reqwest::Client::new(),
        }
    }

    fn api_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, self.bot_token, method)
    }

    /// Send a text message, returning its id
    pub async fn send_message(&self, text: &str) -> Result<i64> {
        let text: String = text.chars().take(MAX_MESSAGE_CHARS).collect();

        let response = self
            .client
            .post(self.api_url("sendMessage"))
            .json(&serde_json::json!({
                "chat_id": self.chat_id,
                "text": text,
            }))
            .send()
            .await
            .context("Failed to send Telegram message")?;

        let result: TelegramResponse<MessageResult> = response
            .json()
            .await
            .context("Failed to parse Telegram response")?;

        if !result.ok {
            anyhow::bail!(
                "Telegram API error: {}",
                result.description.unwrap_or_default()
            );
        }

        Ok(result.result.map(|r| r.message_id).unwrap_or(0))
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify(&self, subject: &str, body: &str) {
        let text = format!("{subject}\n\n{body}");
        if let Err(e) = self.send_message(&text).await {
            warn!(subject, error = %e, "Telegram notification failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn settings() -> TelegramSettings {
        TelegramSettings {
            bot_token: "TOKEN".to_string(),
            chat_id: "42".to_string(),
        }
    }

    #[test]
    fn test_api_url() {
        let notifier = TelegramNotifier::new(settings());
        assert_eq!(
            notifier.api_url("sendMessage"),
            "https://api.telegram.org/botTOKEN/sendMessage"
        );
    }

    #[tokio::test]
    async fn test_send_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/botTOKEN/sendMessage"))
            .and(body_partial_json(serde_json::json!({ "chat_id": "42" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "ok": true,
                "result": { "message_id": 7 }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let notifier = TelegramNotifier::with_api_base(settings(), server.uri());
        assert_eq!(notifier.send_message("hello").await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_notify_swallows_api_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "ok": false,
                "description": "chat not found"
            })))
            .mount(&server)
            .await;

        let notifier = TelegramNotifier::with_api_base(settings(), server.uri());
        assert!(notifier.send_message("hello").await.is_err());
        notifier.notify("Digest", "all quiet").await;
    }
}
