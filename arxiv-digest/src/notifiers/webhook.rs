use crate::config::WebhookConfig;
use crate::types::{BodyFormat, DigestError, NotificationChannel, RenderedDigest, Result, WebhookFormat};
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use std::time::Duration;
use tracing::info;

/// Posts the digest to a Teams or Slack incoming webhook.
pub struct WebhookChannel {
    client: Client,
    url: String,
    format: WebhookFormat,
}

impl WebhookChannel {
    pub fn new(config: &WebhookConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| DigestError::config(format!("Failed to create webhook HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url: config.url.clone(),
            format: config.format,
        })
    }

    fn body_format(&self) -> BodyFormat {
        match self.format {
            WebhookFormat::Teams => BodyFormat::AdaptiveCard,
            WebhookFormat::Slack => BodyFormat::Slack,
        }
    }
}

#[async_trait]
impl NotificationChannel for WebhookChannel {
    fn channel_name(&self) -> String {
        match self.format {
            WebhookFormat::Teams => "webhook:teams".to_string(),
            WebhookFormat::Slack => "webhook:slack".to_string(),
        }
    }

    fn body_formats(&self) -> Vec<BodyFormat> {
        vec![self.body_format()]
    }

    async fn send(&self, rendered: &RenderedDigest) -> Result<()> {
        let channel = self.channel_name();
        let payload = rendered.body(self.body_format()).ok_or_else(|| {
            DigestError::delivery(&channel, format!("digest was not rendered as {:?}", self.body_format()))
        })?;

        let response = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, "application/json")
            .body(payload.to_string())
            .send()
            .await
            .map_err(|e| DigestError::delivery(&channel, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(DigestError::delivery(
                &channel,
                format!("HTTP {}: {}", status.as_u16(), detail.chars().take(200).collect::<String>()),
            ));
        }

        info!("Posted digest to {} webhook", channel);
        Ok(())
    }
}
