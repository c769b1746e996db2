//! Run configuration, read from environment-style key/value pairs.
//!
//! Every recognized key has a default except `STATE_STORE_URL` and the
//! notification channels, of which at least one must be configured.
//! [`Config::validate`] runs before any external call is made.

use crate::retry::RetryPolicy;
use crate::types::{DigestError, FetchConfig, Result, SmtpTls, TopicQuery, WebhookFormat};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

/// Upper bound for `DAYS_BACK` and `MAX_LOOKBACK_DAYS`.
pub const MAX_WINDOW_DAYS: i64 = 3650;

const DEFAULT_CATEGORIES: &[&str] = &[
    "econ.EM", "econ.GN", "cs.CE", "cs.LG", "cs.GT", "math.OC", "math.CO", "stat.AP", "eess.SY",
];
const DEFAULT_TOPICS: &[&str] = &["electricity market", "energy market"];

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub model: String,
    pub api_base: String,
    pub api_key: Option<String>,
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct TranslationConfig {
    pub source_language: String,
    pub target_language: String,
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
}

impl TranslationConfig {
    pub fn is_enabled(&self) -> bool {
        !self.source_language.eq_ignore_ascii_case(&self.target_language)
    }
}

#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub recipient: String,
    pub sender: String,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub tls: SmtpTls,
}

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub url: String,
    pub format: WebhookFormat,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub categories: Vec<String>,
    pub topics: Vec<String>,
    pub llm: LlmConfig,
    pub translation: TranslationConfig,
    pub email: Option<EmailConfig>,
    pub webhook: Option<WebhookConfig>,
    pub state_store_url: String,
    pub fetch: FetchConfig,
    pub days_back: i64,
    pub max_lookback_days: i64,
    pub relevance_threshold: f64,
    pub max_papers_per_topic: Option<usize>,
    pub evaluation_concurrency: usize,
    pub evaluation_attempts: u32,
    pub retry: RetryPolicy,
    pub run_timeout: Duration,
    pub notify_on_failure: bool,
}

struct Vars(HashMap<String, String>);

impl Vars {
    fn get(&self, key: &str) -> Option<String> {
        self.0
            .get(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn list(&self, key: &str, default: &[&str]) -> Vec<String> {
        match self.get(key) {
            Some(raw) => raw
                .split(',')
                .map(|item| item.trim().to_string())
                .filter(|item| !item.is_empty())
                .collect(),
            None => default.iter().map(|item| item.to_string()).collect(),
        }
    }

    fn parse<T: FromStr>(&self, key: &str, default: T) -> Result<T> {
        match self.get(key) {
            Some(raw) => raw
                .parse()
                .map_err(|_| DigestError::config(format!("{} has an invalid value: {:?}", key, raw))),
            None => Ok(default),
        }
    }

    fn flag(&self, key: &str, default: bool) -> Result<bool> {
        match self.get(key).map(|raw| raw.to_ascii_lowercase()) {
            None => Ok(default),
            Some(raw) => match raw.as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(DigestError::config(format!("{} must be a boolean, got {:?}", key, raw))),
            },
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_vars(std::env::vars())
    }

    pub fn from_vars<I, K, V>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars = Vars(
            vars.into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        );

        let email = match vars.get("EMAIL_RECIPIENT") {
            Some(recipient) => Some(EmailConfig {
                sender: vars.get("EMAIL_SENDER").unwrap_or_else(|| recipient.clone()),
                recipient,
                smtp_host: vars.get("SMTP_HOST").unwrap_or_else(|| "localhost".to_string()),
                smtp_port: vars.parse("SMTP_PORT", 587)?,
                username: vars.get("SMTP_USERNAME"),
                password: vars.get("SMTP_PASSWORD"),
                tls: parse_smtp_tls(vars.get("SMTP_TLS").as_deref())?,
            }),
            None => None,
        };

        let webhook = match vars.get("WEBHOOK_URL") {
            Some(url) => Some(WebhookConfig {
                url,
                format: parse_webhook_format(vars.get("WEBHOOK_FORMAT").as_deref())?,
            }),
            None => None,
        };

        let defaults = FetchConfig::default();
        let fetch = FetchConfig {
            base_url: vars.get("ARXIV_API_URL").unwrap_or(defaults.base_url),
            max_results_per_topic: vars.parse("MAX_RESULTS_PER_TOPIC", defaults.max_results_per_topic)?,
            page_size: vars.parse("ARXIV_PAGE_SIZE", defaults.page_size)?,
            min_request_interval_ms: vars.parse("ARXIV_REQUEST_INTERVAL_MS", defaults.min_request_interval_ms)?,
            ..defaults
        };

        let retry = RetryPolicy::new(
            vars.parse("RETRY_MAX_ATTEMPTS", 3u32)?,
            Duration::from_millis(vars.parse("RETRY_BASE_DELAY_MS", 1000u64)?),
        );

        let max_papers_per_topic = match vars.get("MAX_PAPERS_PER_TOPIC") {
            Some(_) => Some(vars.parse("MAX_PAPERS_PER_TOPIC", 0usize)?),
            None => None,
        };

        Ok(Self {
            categories: vars.list("ARXIV_CATEGORIES", DEFAULT_CATEGORIES),
            topics: vars.list("RESEARCH_TOPICS", DEFAULT_TOPICS),
            llm: LlmConfig {
                model: vars.get("LLM_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_string()),
                api_base: vars
                    .get("LLM_API_BASE")
                    .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
                api_key: vars.get("LLM_API_KEY"),
                timeout_seconds: vars.parse("LLM_TIMEOUT_SECS", 60)?,
            },
            translation: TranslationConfig {
                source_language: vars
                    .get("TRANSLATE_SOURCE_LANGUAGE")
                    .unwrap_or_else(|| "en".to_string()),
                target_language: vars
                    .get("TRANSLATE_TARGET_LANGUAGE")
                    .unwrap_or_else(|| "ja".to_string()),
                endpoint: vars.get("TRANSLATE_ENDPOINT"),
                api_key: vars.get("TRANSLATE_API_KEY"),
            },
            email,
            webhook,
            state_store_url: vars.get("STATE_STORE_URL").unwrap_or_default(),
            fetch,
            days_back: vars.parse("DAYS_BACK", 3)?,
            max_lookback_days: vars.parse("MAX_LOOKBACK_DAYS", 14)?,
            relevance_threshold: vars.parse("RELEVANCE_THRESHOLD", 0.7)?,
            max_papers_per_topic,
            evaluation_concurrency: vars.parse("EVALUATION_CONCURRENCY", 4)?,
            evaluation_attempts: vars.parse("EVALUATION_ATTEMPTS", 3)?,
            retry,
            run_timeout: Duration::from_secs(vars.parse("RUN_TIMEOUT_SECS", 840)?),
            notify_on_failure: vars.flag("NOTIFY_ON_FAILURE", true)?,
        })
    }

    /// Reject configurations that cannot produce a delivered digest.
    pub fn validate(&self) -> Result<()> {
        if self.topics.is_empty() {
            return Err(DigestError::config("RESEARCH_TOPICS must name at least one topic"));
        }
        if self.categories.is_empty() {
            return Err(DigestError::config("ARXIV_CATEGORIES must name at least one category"));
        }
        if self.email.is_none() && self.webhook.is_none() {
            return Err(DigestError::config(
                "at least one notification channel is required (EMAIL_RECIPIENT or WEBHOOK_URL)",
            ));
        }
        if self.state_store_url.is_empty() {
            return Err(DigestError::config("STATE_STORE_URL is required"));
        }
        if self.llm.model.is_empty() {
            return Err(DigestError::config("LLM_MODEL must not be empty"));
        }
        if !(0.0..=1.0).contains(&self.relevance_threshold) {
            return Err(DigestError::config("RELEVANCE_THRESHOLD must be between 0.0 and 1.0"));
        }
        if self.evaluation_concurrency == 0 {
            return Err(DigestError::config("EVALUATION_CONCURRENCY must be at least 1"));
        }
        if self.evaluation_attempts == 0 {
            return Err(DigestError::config("EVALUATION_ATTEMPTS must be at least 1"));
        }
        if self.days_back <= 0 || self.max_lookback_days < self.days_back {
            return Err(DigestError::config(
                "DAYS_BACK must be positive and not larger than MAX_LOOKBACK_DAYS",
            ));
        }
        if self.max_lookback_days > MAX_WINDOW_DAYS {
            return Err(DigestError::config(format!(
                "MAX_LOOKBACK_DAYS must be at most {}",
                MAX_WINDOW_DAYS
            )));
        }
        if self.max_papers_per_topic == Some(0) {
            return Err(DigestError::config(
                "MAX_PAPERS_PER_TOPIC must be at least 1; leave it unset for no limit",
            ));
        }
        if self.fetch.page_size == 0 || self.fetch.max_results_per_topic == 0 {
            return Err(DigestError::config("ARXIV_PAGE_SIZE and MAX_RESULTS_PER_TOPIC must be positive"));
        }
        if self.run_timeout.is_zero() {
            return Err(DigestError::config("RUN_TIMEOUT_SECS must be positive"));
        }

        if let Some(email) = &self.email {
            for (key, address) in [("EMAIL_RECIPIENT", &email.recipient), ("EMAIL_SENDER", &email.sender)] {
                address
                    .parse::<lettre::message::Mailbox>()
                    .map_err(|e| DigestError::config(format!("{} is not a valid address: {}", key, e)))?;
            }
        }

        if let Some(webhook) = &self.webhook {
            let url = url::Url::parse(&webhook.url)
                .map_err(|e| DigestError::config(format!("WEBHOOK_URL is invalid: {}", e)))?;
            if url.scheme() != "http" && url.scheme() != "https" {
                return Err(DigestError::config("WEBHOOK_URL must use http or https"));
            }
        }

        if let Some(endpoint) = &self.translation.endpoint {
            url::Url::parse(endpoint)
                .map_err(|e| DigestError::config(format!("TRANSLATE_ENDPOINT is invalid: {}", e)))?;
        }

        Ok(())
    }

    /// Every topic is searched within the full category list.
    pub fn topic_queries(&self) -> Vec<TopicQuery> {
        self.topics
            .iter()
            .map(|topic| TopicQuery::new(topic.clone(), self.categories.clone()))
            .collect()
    }
}

fn parse_smtp_tls(raw: Option<&str>) -> Result<SmtpTls> {
    match raw.map(|s| s.to_ascii_lowercase()).as_deref() {
        None | Some("starttls") => Ok(SmtpTls::StartTls),
        Some("tls") => Ok(SmtpTls::Tls),
        Some("none") => Ok(SmtpTls::None),
        Some(other) => Err(DigestError::config(format!(
            "SMTP_TLS must be one of tls, starttls, none; got {:?}",
            other
        ))),
    }
}

fn parse_webhook_format(raw: Option<&str>) -> Result<WebhookFormat> {
    match raw.map(|s| s.to_ascii_lowercase()).as_deref() {
        None | Some("teams") => Ok(WebhookFormat::Teams),
        Some("slack") => Ok(WebhookFormat::Slack),
        Some(other) => Err(DigestError::config(format!(
            "WEBHOOK_FORMAT must be teams or slack; got {:?}",
            other
        ))),
    }
}
