// Core types live in the interfaces crate
pub use interfaces::defs::{
    BodyFormat, Digest, DigestEntry, DigestSection, LanguageModel, NotificationChannel,
    PaperCandidate, PaperSource, RelevanceVerdict, RenderedDigest, RunWindow, SeenRecord,
    SeenSnapshot, SeenStore, TopicQuery, TranslatedSummary, TranslationService,
};
pub use interfaces::error::{DigestError, Result};

pub const ARXIV_API_URL: &str = "http://export.arxiv.org/api/query";

#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub base_url: String,
    pub user_agent: String,
    pub timeout_seconds: u64,
    pub page_size: usize,
    pub max_results_per_topic: usize,
    /// Minimum spacing between two requests to the same host.
    pub min_request_interval_ms: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            base_url: ARXIV_API_URL.to_string(),
            user_agent: "arxiv-digest/0.1".to_string(),
            timeout_seconds: 30,
            page_size: 50,
            max_results_per_topic: 50,
            min_request_interval_ms: 3000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookFormat {
    Teams,
    Slack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmtpTls {
    Tls,
    StartTls,
    None,
}
