use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DigestError, Result};

/// A topic of interest and the source categories it is searched within.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicQuery {
    pub topic: String,
    pub categories: Vec<String>,
}

impl TopicQuery {
    pub fn new(topic: impl Into<String>, categories: Vec<String>) -> Self {
        Self {
            topic: topic.into(),
            categories,
        }
    }
}

/// Publication-time window `[start, end)` eligible for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl RunWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        if start >= end {
            return Err(DigestError::config(format!(
                "run window start {} is not before end {}",
                start, end
            )));
        }
        Ok(Self { start, end })
    }

    /// End is exclusive so consecutive windows never overlap.
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at < self.end
    }
}

/// A paper fetched during the current run. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaperCandidate {
    pub id: String,
    pub title: String,
    pub summary: String,
    pub authors: Vec<String>,
    pub published: DateTime<Utc>,
    pub updated: Option<DateTime<Utc>>,
    pub categories: Vec<String>,
    pub url: String,
    /// Configured topics whose query returned this paper, in topic order.
    pub matched_topics: Vec<String>,
}

/// Outcome of scoring one (paper, topic) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelevanceVerdict {
    pub paper_id: String,
    pub topic: String,
    pub accepted: bool,
    pub score: Option<f64>,
    pub rationale: String,
    pub model: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeenRecord {
    pub paper_id: String,
    pub first_seen: DateTime<Utc>,
}

/// State of the seen set as of run start. Every read in a run goes through one snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeenSnapshot {
    pub seen: HashSet<String>,
    pub last_window_end: Option<DateTime<Utc>>,
}

impl SeenSnapshot {
    pub fn contains(&self, paper_id: &str) -> bool {
        self.seen.contains(paper_id)
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranslatedSummary {
    pub text: String,
    pub language: String,
    /// Set when translation was requested but the service failed and the original text was kept.
    pub degraded: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DigestEntry {
    pub paper: PaperCandidate,
    pub topic: String,
    pub verdict: RelevanceVerdict,
    pub summary: TranslatedSummary,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DigestSection {
    pub topic: String,
    pub entries: Vec<DigestEntry>,
}

/// Accepted papers for one run, grouped by topic in configured topic order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Digest {
    pub window: RunWindow,
    pub topics: Vec<String>,
    pub sections: Vec<DigestSection>,
}

impl Digest {
    pub fn entry_count(&self) -> usize {
        self.sections.iter().map(|section| section.entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entry_count() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BodyFormat {
    PlainText,
    Html,
    AdaptiveCard,
    Slack,
}

/// A digest rendered into every format the active channels asked for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedDigest {
    pub subject: String,
    pub bodies: BTreeMap<BodyFormat, String>,
}

impl RenderedDigest {
    pub fn body(&self, format: BodyFormat) -> Option<&str> {
        self.bodies.get(&format).map(String::as_str)
    }
}

// Object style note:
// Implementations of these traits are driven by a short lived single-run
// process. They hold connection handles and configuration, never run state;
// anything that has to survive the process goes through `SeenStore`.

/// Read-only, paginated query interface of the paper source.
#[async_trait]
pub trait PaperSource: Send + Sync {
    fn source_name(&self) -> String;

    /// Fetch one page of papers for `query` within `window`.
    /// A page shorter than `limit` means the result set is exhausted.
    async fn fetch_page(
        &self,
        query: &TopicQuery,
        window: &RunWindow,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<PaperCandidate>>;
}

/// Durable home of the seen set.
#[async_trait]
pub trait SeenStore: Send + Sync {
    fn backend_name(&self) -> String;

    async fn load_snapshot(&self) -> Result<SeenSnapshot>;

    /// Record `records` and the successful window end in one atomic write.
    /// Ids already present keep their original first-seen timestamp.
    async fn commit(&self, records: &[SeenRecord], window_end: DateTime<Utc>) -> Result<()>;
}

/// Single request/response text completion.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn model_id(&self) -> String;

    async fn complete(&self, prompt: &str) -> Result<String>;
}

#[async_trait]
pub trait TranslationService: Send + Sync {
    fn service_name(&self) -> String;

    async fn translate(&self, text: &str, source_language: &str, target_language: &str)
        -> Result<String>;
}

#[async_trait]
pub trait NotificationChannel: Send + Sync {
    fn channel_name(&self) -> String;

    /// Formats this channel needs rendered before `send` is called.
    fn body_formats(&self) -> Vec<BodyFormat>;

    async fn send(&self, rendered: &RenderedDigest) -> Result<()>;
}
