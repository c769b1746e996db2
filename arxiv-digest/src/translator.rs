use crate::retry::RetryPolicy;
use crate::types::{DigestError, LanguageModel, PaperCandidate, Result, TranslatedSummary, TranslationService};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Rewrites summaries into the target language, keeping the original text when the service fails.
pub struct Translator {
    service: Option<Arc<dyn TranslationService>>,
    retry: RetryPolicy,
    source_language: String,
    target_language: String,
    concurrency: usize,
}

impl Translator {
    pub fn new(
        service: Arc<dyn TranslationService>,
        retry: RetryPolicy,
        source_language: impl Into<String>,
        target_language: impl Into<String>,
    ) -> Self {
        Self {
            service: Some(service),
            retry,
            source_language: source_language.into(),
            target_language: target_language.into(),
            concurrency: 4,
        }
    }

    /// Translator that returns every text unchanged.
    pub fn identity(language: impl Into<String>) -> Self {
        let language = language.into();
        Self {
            service: None,
            retry: RetryPolicy::default(),
            source_language: language.clone(),
            target_language: language,
            concurrency: 1,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn is_identity(&self) -> bool {
        self.service.is_none() || self.source_language.eq_ignore_ascii_case(&self.target_language)
    }

    fn untranslated(&self, text: &str, degraded: bool) -> TranslatedSummary {
        TranslatedSummary {
            text: text.to_string(),
            language: self.source_language.clone(),
            degraded,
        }
    }

    pub async fn translate(&self, text: &str) -> TranslatedSummary {
        let service = match &self.service {
            Some(service) if !self.is_identity() && !text.trim().is_empty() => service,
            _ => return self.untranslated(text, false),
        };

        let label = format!("translation via {}", service.service_name());
        let result = self
            .retry
            .run(&label, || {
                service.translate(text, &self.source_language, &self.target_language)
            })
            .await;

        match result {
            Ok(translated) => TranslatedSummary {
                text: translated,
                language: self.target_language.clone(),
                degraded: false,
            },
            Err(e) => {
                warn!("Keeping untranslated summary: {}", e);
                self.untranslated(text, true)
            }
        }
    }

    /// Translate the summary of each paper once, keyed by paper id.
    pub async fn translate_papers(&self, papers: &[&PaperCandidate]) -> HashMap<String, TranslatedSummary> {
        if !self.is_identity() {
            info!(
                "Translating {} summaries {} -> {}",
                papers.len(),
                self.source_language,
                self.target_language
            );
        }

        stream::iter(papers.iter().copied())
            .map(|paper| async move { (paper.id.clone(), self.translate(&paper.summary).await) })
            .buffer_unordered(self.concurrency)
            .collect()
            .await
    }
}

#[derive(Debug, Serialize)]
struct LibreTranslateRequest<'a> {
    q: &'a str,
    source: &'a str,
    target: &'a str,
    format: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    api_key: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LibreTranslateResponse {
    translated_text: String,
}

/// Client for a LibreTranslate-compatible `/translate` endpoint.
pub struct LibreTranslateService {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
}

impl LibreTranslateService {
    pub fn new(endpoint: &str, api_key: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| DigestError::config(format!("Failed to create translation HTTP client: {}", e)))?;

        let base = endpoint.trim_end_matches('/');
        let endpoint = if base.ends_with("/translate") {
            base.to_string()
        } else {
            format!("{}/translate", base)
        };

        Ok(Self {
            client,
            endpoint,
            api_key,
        })
    }
}

#[async_trait]
impl TranslationService for LibreTranslateService {
    fn service_name(&self) -> String {
        "libretranslate".to_string()
    }

    async fn translate(
        &self,
        text: &str,
        source_language: &str,
        target_language: &str,
    ) -> Result<String> {
        let body = LibreTranslateRequest {
            q: text,
            source: source_language,
            target: target_language,
            format: "text",
            api_key: self.api_key.as_deref(),
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| DigestError::translation(format!("request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DigestError::translation(format!("HTTP {}", status.as_u16())));
        }

        let parsed: LibreTranslateResponse = response
            .json()
            .await
            .map_err(|e| DigestError::translation(format!("malformed response: {}", e)))?;
        Ok(parsed.translated_text)
    }
}

/// Translation through the configured language model.
pub struct ModelTranslationService {
    model: Arc<dyn LanguageModel>,
}

impl ModelTranslationService {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self { model }
    }
}

#[async_trait]
impl TranslationService for ModelTranslationService {
    fn service_name(&self) -> String {
        format!("model:{}", self.model.model_id())
    }

    async fn translate(
        &self,
        text: &str,
        source_language: &str,
        target_language: &str,
    ) -> Result<String> {
        let prompt = format!(
            "Translate the following text from language code '{}' into language code '{}'. \
             Reply with the translation only.\n\n{}",
            source_language, target_language, text
        );

        let translated = self
            .model
            .complete(&prompt)
            .await
            .map_err(|e| DigestError::translation(e.to_string()))?;

        let translated = translated.trim();
        if translated.is_empty() {
            return Err(DigestError::translation("model returned an empty translation"));
        }
        Ok(translated.to_string())
    }
}
