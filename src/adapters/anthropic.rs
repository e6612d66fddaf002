//! Anthropic Messages API backend (metered).

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{Generation, InferenceBackend, Prompt};

const API_VERSION: &str = "2023-06-01";

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    messages: Vec<Message<'a>>,
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'static str,
    content: Vec<ContentBlock<'a>>,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock<'a> {
    Text { text: &'a str },
    Image { source: ImageSource<'a> },
}

#[derive(Serialize)]
struct ImageSource<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    media_type: &'static str,
    data: &'a str,
}

#[derive(Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    model: Option<String>,
    content: Vec<ResponseBlock>,
    usage: Usage,
}

#[derive(Deserialize)]
struct ResponseBlock {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    input_tokens: u64,
    output_tokens: u64,
}

/// Cloud inference through the Anthropic Messages API
pub struct AnthropicBackend {
    client: Client,
    base_url: String,
    api_key: String,
}

impl AnthropicBackend {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        })
    }
}

#[async_trait]
impl InferenceBackend for AnthropicBackend {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn generate(&self, model: &str, prompt: &Prompt) -> Result<Generation> {
        let mut content: Vec<ContentBlock<'_>> = prompt
            .images
            .iter()
            .map(|data| ContentBlock::Image {
                source: ImageSource {
                    kind: "base64",
                    media_type: "image/png",
                    data,
                },
            })
            .collect();
        content.push(ContentBlock::Text { text: &prompt.text });

        let body = MessagesRequest {
            model,
            max_tokens: prompt.max_tokens,
            system: prompt.system.as_deref(),
            messages: vec![Message {
                role: "user",
                content,
            }],
        };

        debug!(model, prompt_len = prompt.text.len(), "Sending Anthropic request");

        let resp = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await
            .context("Failed to send request to Anthropic")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!("Anthropic returned {status}: {body}");
        }

        let parsed: MessagesResponse = resp
            .json()
            .await
            .context("Failed to parse Anthropic response")?;

        let text: String = parsed
            .content
            .into_iter()
            .filter_map(|block| block.text)
            .collect();

        Ok(Generation {
            text,
            model: parsed.model.unwrap_or_else(|| model.to_string()),
            input_tokens: parsed.usage.input_tokens,
            output_tokens: parsed.usage.output_tokens,
        })
    }

    async fn health_check(&self) -> Result<()> {
        let resp = self
            .client
            .get(format!("{}/v1/models", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .send()
            .await
            .context("Failed to reach Anthropic")?;
        if !resp.status().is_success() {
            bail!("Anthropic health check failed: {}", resp.status());
        }
        Ok(())
    }
}
