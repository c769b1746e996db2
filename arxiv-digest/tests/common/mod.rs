#![allow(dead_code)]

use arxiv_digest::{
    types::*, DedupStore, MockLanguageModel, NotificationDispatcher, PipelineOrchestrator,
    PipelineSettings, RelevanceEvaluator, RetryPolicy, SourceClient, Translator,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const RELEVANT: &str = r#"{"is_relevant": true, "relevance_score": 0.9, "reason": "Directly about market design."}"#;
pub const IRRELEVANT: &str = r#"{"is_relevant": false, "relevance_score": 0.1, "reason": "Unrelated field."}"#;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .try_init();
}

pub fn at(year: i32, month: u32, day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, day, hour, 0, 0)
        .single()
        .expect("valid test timestamp")
}

pub fn date(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).expect("valid test date")
}

/// Paper whose title is "Paper <id>".
pub fn paper(id: &str, published: DateTime<Utc>) -> PaperCandidate {
    PaperCandidate {
        id: id.to_string(),
        title: format!("Paper {}", id),
        summary: format!("Abstract of paper {}.", id),
        authors: vec!["Ada Lovelace".to_string(), "Alan Turing".to_string()],
        published,
        updated: None,
        categories: vec!["econ.EM".to_string()],
        url: format!("https://arxiv.org/abs/{}", id),
        matched_topics: Vec::new(),
    }
}

pub fn topics(names: &[&str]) -> Vec<TopicQuery> {
    names
        .iter()
        .map(|name| TopicQuery::new(*name, vec!["econ.EM".to_string()]))
        .collect()
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(3, Duration::from_millis(1))
}

/// Source serving fixed per-topic result lists, page by page.
#[derive(Default)]
pub struct FakeSource {
    results: HashMap<String, Vec<PaperCandidate>>,
    failures_left: AtomicUsize,
    delay: Option<Duration>,
    requests: Mutex<Vec<(String, usize, usize)>>,
}

impl FakeSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_topic(mut self, topic: &str, papers: Vec<PaperCandidate>) -> Self {
        self.results.insert(topic.to_string(), papers);
        self
    }

    /// Fail the next `count` requests with `SourceUnavailable`.
    pub fn failing(self, count: usize) -> Self {
        self.failures_left.store(count, Ordering::SeqCst);
        self
    }

    /// Sleep before answering each request.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// (topic, offset, limit) of every request, in order.
    pub fn requests(&self) -> Vec<(String, usize, usize)> {
        self.requests.lock().expect("requests lock").clone()
    }
}

#[async_trait]
impl PaperSource for FakeSource {
    fn source_name(&self) -> String {
        "fake".to_string()
    }

    async fn fetch_page(
        &self,
        query: &TopicQuery,
        _window: &RunWindow,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<PaperCandidate>> {
        self.requests
            .lock()
            .expect("requests lock")
            .push((query.topic.clone(), offset, limit));

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
        {
            return Err(DigestError::source("connection reset"));
        }

        let papers = self.results.get(&query.topic).cloned().unwrap_or_default();
        Ok(papers.into_iter().skip(offset).take(limit).collect())
    }
}

/// Channel that records what it was asked to send.
pub struct FakeChannel {
    name: String,
    formats: Vec<BodyFormat>,
    fail: bool,
    sent: Mutex<Vec<RenderedDigest>>,
}

impl FakeChannel {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            formats: vec![BodyFormat::PlainText, BodyFormat::Html],
            fail: false,
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(name: &str) -> Self {
        Self {
            fail: true,
            ..Self::new(name)
        }
    }

    pub fn with_formats(mut self, formats: Vec<BodyFormat>) -> Self {
        self.formats = formats;
        self
    }

    pub fn sent(&self) -> Vec<RenderedDigest> {
        self.sent.lock().expect("sent lock").clone()
    }
}

#[async_trait]
impl NotificationChannel for FakeChannel {
    fn channel_name(&self) -> String {
        self.name.clone()
    }

    fn body_formats(&self) -> Vec<BodyFormat> {
        self.formats.clone()
    }

    async fn send(&self, rendered: &RenderedDigest) -> Result<()> {
        self.sent.lock().expect("sent lock").push(rendered.clone());
        if self.fail {
            return Err(DigestError::delivery(&self.name, "connection refused"));
        }
        Ok(())
    }
}

/// Store that fails on load, on commit, or both.
pub struct FailingSeenStore {
    fail_load: bool,
    fail_commit: bool,
    commits: AtomicUsize,
}

impl FailingSeenStore {
    pub fn on_load() -> Self {
        Self {
            fail_load: true,
            fail_commit: true,
            commits: AtomicUsize::new(0),
        }
    }

    pub fn on_commit() -> Self {
        Self {
            fail_load: false,
            fail_commit: true,
            commits: AtomicUsize::new(0),
        }
    }

    /// Commit attempts, failed or not.
    pub fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SeenStore for FailingSeenStore {
    fn backend_name(&self) -> String {
        "failing".to_string()
    }

    async fn load_snapshot(&self) -> Result<SeenSnapshot> {
        if self.fail_load {
            return Err(DigestError::store("database is down"));
        }
        Ok(SeenSnapshot::default())
    }

    async fn commit(&self, _records: &[SeenRecord], _window_end: DateTime<Utc>) -> Result<()> {
        self.commits.fetch_add(1, Ordering::SeqCst);
        if self.fail_commit {
            return Err(DigestError::store("database is down"));
        }
        Ok(())
    }
}

/// Topic named in an evaluation prompt.
pub fn prompt_topic(prompt: &str) -> String {
    prompt
        .split("on the topic \"")
        .nth(1)
        .and_then(|rest| rest.split('"').next())
        .unwrap_or_default()
        .to_string()
}

/// Title line of an evaluation prompt.
pub fn prompt_title(prompt: &str) -> String {
    prompt
        .lines()
        .find_map(|line| line.strip_prefix("Title: "))
        .unwrap_or_default()
        .to_string()
}

/// Model answering from a (title, topic) table, irrelevant for anything else.
pub fn scripted_model(answers: &[(&str, &str, &str)]) -> MockLanguageModel {
    let table: HashMap<(String, String), String> = answers
        .iter()
        .map(|(title, topic, answer)| ((title.to_string(), topic.to_string()), answer.to_string()))
        .collect();

    MockLanguageModel::new("scripted", move |prompt| {
        let key = (prompt_title(prompt), prompt_topic(prompt));
        Ok(table.get(&key).cloned().unwrap_or_else(|| IRRELEVANT.to_string()))
    })
}

pub fn settings(topic_queries: Vec<TopicQuery>) -> PipelineSettings {
    PipelineSettings {
        topics: topic_queries,
        days_back: 3,
        max_lookback_days: 14,
        max_papers_per_topic: None,
        run_timeout: Duration::from_secs(30),
        notify_on_failure: false,
    }
}

pub fn orchestrator(
    source: Arc<FakeSource>,
    store: Arc<dyn SeenStore>,
    model: Arc<MockLanguageModel>,
    channels: Vec<Arc<FakeChannel>>,
    settings: PipelineSettings,
) -> PipelineOrchestrator {
    let channels: Vec<Arc<dyn NotificationChannel>> = channels
        .into_iter()
        .map(|channel| channel as Arc<dyn NotificationChannel>)
        .collect();

    PipelineOrchestrator::new(
        SourceClient::new(source, fast_retry(), 2, 50),
        DedupStore::new(store),
        RelevanceEvaluator::new(model, fast_retry(), 0.7).with_attempts(3),
        Translator::identity("en"),
        NotificationDispatcher::new(channels).expect("at least one channel"),
        settings,
    )
}
