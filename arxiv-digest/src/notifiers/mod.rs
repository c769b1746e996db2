pub mod email;
pub mod webhook;

pub use email::EmailChannel;
pub use webhook::WebhookChannel;

use crate::config::Config;
use crate::types::{BodyFormat, DigestError, NotificationChannel, RenderedDigest, Result};
use futures::future::join_all;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, warn};

/// Per-channel result of one dispatch.
#[derive(Debug, Clone, Default)]
pub struct DispatchOutcome {
    pub delivered: Vec<String>,
    /// (channel, error message)
    pub failed: Vec<(String, String)>,
}

impl DispatchOutcome {
    pub fn any_delivered(&self) -> bool {
        !self.delivered.is_empty()
    }

    /// `DeliveryFailed` naming every channel when nothing was delivered.
    pub fn into_result(self) -> Result<Self> {
        if self.any_delivered() {
            return Ok(self);
        }
        let channels = self
            .failed
            .iter()
            .map(|(channel, _)| channel.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        let reasons = self
            .failed
            .iter()
            .map(|(channel, reason)| format!("{}: {}", channel, reason))
            .collect::<Vec<_>>()
            .join("; ");
        Err(DigestError::delivery(channels, reasons))
    }
}

/// Sends one rendered digest through every configured channel.
pub struct NotificationDispatcher {
    channels: Vec<Arc<dyn NotificationChannel>>,
}

impl NotificationDispatcher {
    pub fn new(channels: Vec<Arc<dyn NotificationChannel>>) -> Result<Self> {
        if channels.is_empty() {
            return Err(DigestError::config("at least one notification channel is required"));
        }
        Ok(Self { channels })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let mut channels: Vec<Arc<dyn NotificationChannel>> = Vec::new();
        if let Some(email) = &config.email {
            channels.push(Arc::new(EmailChannel::new(email)?));
        }
        if let Some(webhook) = &config.webhook {
            channels.push(Arc::new(WebhookChannel::new(webhook)?));
        }
        Self::new(channels)
    }

    pub fn channel_names(&self) -> Vec<String> {
        self.channels.iter().map(|channel| channel.channel_name()).collect()
    }

    /// Union of the body formats every channel needs.
    pub fn body_formats(&self) -> Vec<BodyFormat> {
        self.channels
            .iter()
            .flat_map(|channel| channel.body_formats())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Attempt every channel concurrently. A failing channel never stops the others.
    pub async fn dispatch(&self, rendered: &RenderedDigest) -> DispatchOutcome {
        let sends = self.channels.iter().map(|channel| async move {
            (channel.channel_name(), channel.send(rendered).await)
        });

        let mut outcome = DispatchOutcome::default();
        for (channel, result) in join_all(sends).await {
            match result {
                Ok(()) => outcome.delivered.push(channel),
                Err(e) => {
                    warn!("Delivery through {} failed: {}", channel, e);
                    outcome.failed.push((channel, e.to_string()));
                }
            }
        }

        info!(
            "Dispatch finished: {} delivered, {} failed",
            outcome.delivered.len(),
            outcome.failed.len()
        );
        outcome
    }
}
