use crate::config::Config;
use crate::digest::NotificationComposer;
use crate::evaluator::RelevanceEvaluator;
use crate::fetcher::ArxivFetcher;
use crate::llm_adapter::OpenAiCompatibleModel;
use crate::notifiers::NotificationDispatcher;
use crate::source::SourceClient;
use crate::state::{open_store, DedupStore};
use crate::translator::{LibreTranslateService, ModelTranslationService, Translator};
use crate::types::{
    BodyFormat, DigestError, LanguageModel, PaperCandidate, RenderedDigest, Result, RunWindow, TopicQuery,
    TranslationService,
};
use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStage {
    Idle,
    Fetching,
    Filtering,
    Evaluating,
    Translating,
    Composing,
    Dispatching,
    Committing,
    Done,
    Failed,
}

impl fmt::Display for RunStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Fetching => "fetching",
            Self::Filtering => "filtering",
            Self::Evaluating => "evaluating",
            Self::Translating => "translating",
            Self::Composing => "composing",
            Self::Dispatching => "dispatching",
            Self::Committing => "committing",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    DryRun,
    Failed,
}

/// Counters collected while a run progresses.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunDiagnostics {
    pub fetched: usize,
    pub skipped_seen: usize,
    pub unseen: usize,
    pub evaluated: usize,
    pub accepted: usize,
    pub evaluation_failures: usize,
    pub digest_entries: usize,
    pub translation_degraded: usize,
    pub delivered: Vec<String>,
    pub failed_channels: Vec<String>,
    pub committed: usize,
    /// Error tallies keyed by error kind.
    pub errors: BTreeMap<String, usize>,
}

impl RunDiagnostics {
    fn record_error(&mut self, kind: &str, count: usize) {
        if count > 0 {
            *self.errors.entry(kind.to_string()).or_insert(0) += count;
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub status: RunStatus,
    /// `Done` or `Failed`.
    pub stage: RunStage,
    /// Stage that was active when the run failed.
    pub failed_stage: Option<RunStage>,
    pub window: Option<RunWindow>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub subject: Option<String>,
    pub error: Option<String>,
    pub diagnostics: RunDiagnostics,
    /// Rendered digest, kept for dry runs only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rendered: Option<RenderedDigest>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.status != RunStatus::Failed
    }

    /// One-line summary for log scraping.
    pub fn summary_line(&self) -> String {
        let d = &self.diagnostics;
        let errors = d
            .errors
            .iter()
            .map(|(kind, count)| format!("{}={}", kind, count))
            .collect::<Vec<_>>()
            .join(",");
        format!(
            "PROCESSING_SUMMARY run_id={} status={:?} stage={} fetched={} unseen={} evaluated={} accepted={} digest_entries={} evaluation_failures={} translation_degraded={} delivered={} failed_channels={} committed={} errors=[{}]",
            self.run_id,
            self.status,
            self.failed_stage.unwrap_or(self.stage),
            d.fetched,
            d.unseen,
            d.evaluated,
            d.accepted,
            d.digest_entries,
            d.evaluation_failures,
            d.translation_degraded,
            d.delivered.len(),
            d.failed_channels.len(),
            d.committed,
            errors
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Last day (inclusive, UTC) of the window. `None` ends the window now.
    pub end_date: Option<NaiveDate>,
    /// Compose the digest without dispatching or committing.
    pub dry_run: bool,
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub topics: Vec<TopicQuery>,
    pub days_back: i64,
    pub max_lookback_days: i64,
    pub max_papers_per_topic: Option<usize>,
    pub run_timeout: std::time::Duration,
    pub notify_on_failure: bool,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            topics: config.topic_queries(),
            days_back: config.days_back,
            max_lookback_days: config.max_lookback_days,
            max_papers_per_topic: config.max_papers_per_topic,
            run_timeout: config.run_timeout,
            notify_on_failure: config.notify_on_failure,
        }
    }

    fn topic_names(&self) -> Vec<String> {
        self.topics.iter().map(|query| query.topic.clone()).collect()
    }
}

/// Compute the effective window for a run.
///
/// With an explicit end date the window ends at the start of the following
/// day and spans `days_back` days. Without one it ends at `now`, and when
/// the last successful window ended earlier than `now - days_back` the start
/// moves back to it, never further than `max_lookback_days`.
pub fn resolve_window(
    end_date: Option<NaiveDate>,
    now: DateTime<Utc>,
    last_window_end: Option<DateTime<Utc>>,
    days_back: i64,
    max_lookback_days: i64,
) -> Result<RunWindow> {
    let end = match end_date {
        Some(date) => {
            let next_day = date
                .succ_opt()
                .and_then(|day| day.and_hms_opt(0, 0, 0))
                .ok_or_else(|| DigestError::config(format!("end date {} is out of range", date)))?;
            Utc.from_utc_datetime(&next_day)
        }
        None => now,
    };

    let mut start = days_before(end, days_back)?;
    if end_date.is_none() {
        if let Some(last_end) = last_window_end.filter(|last_end| *last_end < start) {
            let floor = days_before(end, max_lookback_days.max(days_back))?;
            start = last_end.max(floor);
            info!("Extending window start back to {} to cover missed runs", start);
        }
    }

    RunWindow::new(start, end)
}

fn days_before(end: DateTime<Utc>, days: i64) -> Result<DateTime<Utc>> {
    Duration::try_days(days)
        .and_then(|span| end.checked_sub_signed(span))
        .ok_or_else(|| DigestError::config(format!("a window of {} days before {} is out of range", days, end)))
}

struct RunTracker {
    stage: RunStage,
    window: Option<RunWindow>,
    subject: Option<String>,
    rendered: Option<RenderedDigest>,
    diagnostics: RunDiagnostics,
}

impl RunTracker {
    fn enter(&mut self, stage: RunStage) {
        info!("Stage {} -> {}", self.stage, stage);
        self.stage = stage;
    }
}

struct PendingCommit {
    paper_ids: Vec<String>,
    window_end: DateTime<Utc>,
}

/// Wires the components into one run and owns the run state machine.
pub struct PipelineOrchestrator {
    source: SourceClient,
    dedup: DedupStore,
    evaluator: RelevanceEvaluator,
    translator: Translator,
    dispatcher: NotificationDispatcher,
    settings: PipelineSettings,
}

impl PipelineOrchestrator {
    pub fn new(
        source: SourceClient,
        dedup: DedupStore,
        evaluator: RelevanceEvaluator,
        translator: Translator,
        dispatcher: NotificationDispatcher,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            source,
            dedup,
            evaluator,
            translator,
            dispatcher,
            settings,
        }
    }

    /// Build the production pipeline: ArXiv, an OpenAI-compatible model and the configured store and channels.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let fetcher = ArxivFetcher::new(config.fetch.clone())?;
        let source = SourceClient::new(
            Arc::new(fetcher),
            config.retry.clone(),
            config.fetch.page_size,
            config.fetch.max_results_per_topic,
        );

        let store = open_store(&config.state_store_url).await?;
        let model: Arc<dyn LanguageModel> = Arc::new(OpenAiCompatibleModel::new(&config.llm)?);

        let evaluator = RelevanceEvaluator::new(model.clone(), config.retry.clone(), config.relevance_threshold)
            .with_attempts(config.evaluation_attempts)
            .with_concurrency(config.evaluation_concurrency);

        let translation = &config.translation;
        let translator = if translation.is_enabled() {
            let service: Arc<dyn TranslationService> = match &translation.endpoint {
                Some(endpoint) => Arc::new(LibreTranslateService::new(endpoint, translation.api_key.clone())?),
                None => Arc::new(ModelTranslationService::new(model)),
            };
            Translator::new(
                service,
                config.retry.clone(),
                &translation.source_language,
                &translation.target_language,
            )
            .with_concurrency(config.evaluation_concurrency)
        } else {
            Translator::identity(&translation.source_language)
        };

        Ok(Self::new(
            source,
            DedupStore::new(store),
            evaluator,
            translator,
            NotificationDispatcher::from_config(config)?,
            PipelineSettings::from_config(config),
        ))
    }

    pub async fn run(&self, options: RunOptions) -> RunReport {
        self.run_at(options, Utc::now()).await
    }

    /// Run once as if the current time were `now`.
    pub async fn run_at(&self, options: RunOptions, now: DateTime<Utc>) -> RunReport {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(
            "Starting digest run {} for topics [{}] (dry run: {})",
            run_id,
            self.settings.topic_names().join(", "),
            options.dry_run
        );

        let mut tracker = RunTracker {
            stage: RunStage::Idle,
            window: None,
            subject: None,
            rendered: None,
            diagnostics: RunDiagnostics::default(),
        };

        let timeout = self.settings.run_timeout;
        let delivered = match tokio::time::timeout(timeout, self.deliver(&mut tracker, &options, now)).await {
            Ok(result) => result,
            Err(_) => Err(DigestError::RunTimeout {
                seconds: timeout.as_secs(),
            }),
        };

        let result = match delivered {
            Ok(Some(pending)) => self.commit(&mut tracker, pending).await,
            Ok(None) => Ok(()),
            Err(e) => Err(e),
        };

        let (status, stage, failed_stage, error) = match result {
            Ok(()) => {
                tracker.enter(RunStage::Done);
                let status = if options.dry_run {
                    RunStatus::DryRun
                } else {
                    RunStatus::Succeeded
                };
                (status, RunStage::Done, None, None)
            }
            Err(e) => {
                let failed_stage = tracker.stage;
                error!("Run {} failed during {}: {}", run_id, failed_stage, e);
                // Per-channel delivery failures are already tallied
                if !matches!(e, DigestError::DeliveryFailed { .. }) {
                    tracker.diagnostics.record_error(e.kind(), 1);
                }
                if self.settings.notify_on_failure && !options.dry_run {
                    self.notify_failure(run_id, failed_stage, &e).await;
                }
                tracker.enter(RunStage::Failed);
                (RunStatus::Failed, RunStage::Failed, Some(failed_stage), Some(e.to_string()))
            }
        };

        let report = RunReport {
            run_id,
            status,
            stage,
            failed_stage,
            window: tracker.window,
            started_at,
            finished_at: Utc::now(),
            subject: tracker.subject,
            error,
            diagnostics: tracker.diagnostics,
            rendered: if options.dry_run { tracker.rendered } else { None },
        };
        info!("{}", report.summary_line());
        report
    }

    /// Everything up to and including dispatch. Returns what to commit, or
    /// `None` for a dry run.
    async fn deliver(
        &self,
        tracker: &mut RunTracker,
        options: &RunOptions,
        now: DateTime<Utc>,
    ) -> Result<Option<PendingCommit>> {
        tracker.enter(RunStage::Fetching);
        let snapshot = self.dedup.snapshot().await?;
        let window = resolve_window(
            options.end_date,
            now,
            snapshot.last_window_end,
            self.settings.days_back,
            self.settings.max_lookback_days,
        )?;
        tracker.window = Some(window);
        info!("Run window {} to {}", window.start, window.end);

        let candidates = self.source.fetch_candidates(&self.settings.topics, &window).await?;
        tracker.diagnostics.fetched = candidates.len();

        tracker.enter(RunStage::Filtering);
        let (unseen, skipped) = DedupStore::filter_unseen(&snapshot, candidates);
        tracker.diagnostics.skipped_seen = skipped;
        tracker.diagnostics.unseen = unseen.len();
        info!("{} unseen candidates ({} already notified)", unseen.len(), skipped);

        tracker.enter(RunStage::Evaluating);
        let evaluation = self.evaluator.evaluate_all(&unseen).await?;
        tracker.diagnostics.evaluated = evaluation.verdicts.len();
        tracker.diagnostics.accepted = evaluation.accepted().count();
        tracker.diagnostics.evaluation_failures = evaluation.failures.len();
        tracker
            .diagnostics
            .record_error("evaluation_error", evaluation.failures.len());

        tracker.enter(RunStage::Translating);
        let accepted_ids: HashSet<&str> = evaluation
            .accepted()
            .map(|verdict| verdict.paper_id.as_str())
            .collect();
        let accepted_papers: Vec<&PaperCandidate> = unseen
            .iter()
            .filter(|paper| accepted_ids.contains(paper.id.as_str()))
            .collect();
        let summaries = self.translator.translate_papers(&accepted_papers).await;
        let degraded = summaries.values().filter(|summary| summary.degraded).count();
        tracker.diagnostics.translation_degraded = degraded;
        tracker.diagnostics.record_error("translation_unavailable", degraded);

        tracker.enter(RunStage::Composing);
        let digest = NotificationComposer::build_digest(
            window,
            &self.settings.topic_names(),
            &unseen,
            &evaluation.verdicts,
            &summaries,
            self.settings.max_papers_per_topic,
        );
        tracker.diagnostics.digest_entries = digest.entry_count();
        let mut formats = self.dispatcher.body_formats();
        if options.dry_run && !formats.contains(&BodyFormat::PlainText) {
            formats.push(BodyFormat::PlainText);
        }
        let rendered = NotificationComposer::compose(&digest, &formats);
        tracker.subject = Some(rendered.subject.clone());

        if options.dry_run {
            info!("Dry run: skipping dispatch and commit for \"{}\"", rendered.subject);
            tracker.rendered = Some(rendered);
            return Ok(None);
        }

        tracker.enter(RunStage::Dispatching);
        let outcome = self.dispatcher.dispatch(&rendered).await;
        tracker.diagnostics.delivered = outcome.delivered.clone();
        tracker.diagnostics.failed_channels = outcome
            .failed
            .iter()
            .map(|(channel, _)| channel.clone())
            .collect();
        tracker
            .diagnostics
            .record_error("delivery_failed", outcome.failed.len());
        if !outcome.failed.is_empty() && outcome.any_delivered() {
            warn!(
                "Partial delivery: {} of {} channels failed",
                outcome.failed.len(),
                outcome.failed.len() + outcome.delivered.len()
            );
        }
        outcome.into_result()?;

        Ok(Some(PendingCommit {
            paper_ids: unseen.into_iter().map(|paper| paper.id).collect(),
            window_end: window.end,
        }))
    }

    async fn commit(&self, tracker: &mut RunTracker, pending: PendingCommit) -> Result<()> {
        tracker.enter(RunStage::Committing);
        self.dedup
            .commit(&pending.paper_ids, Utc::now(), pending.window_end)
            .await?;
        tracker.diagnostics.committed = pending.paper_ids.len();
        Ok(())
    }

    async fn notify_failure(&self, run_id: Uuid, stage: RunStage, failure: &DigestError) {
        // Channels that just failed to deliver will not carry a notice either
        if matches!(failure, DigestError::DeliveryFailed { .. }) {
            return;
        }

        let notice = NotificationComposer::compose_failure(
            &self.settings.topic_names(),
            &stage.to_string(),
            &failure.to_string(),
            &run_id.to_string(),
            &self.dispatcher.body_formats(),
        );
        let outcome = self.dispatcher.dispatch(&notice).await;
        if outcome.any_delivered() {
            info!("Failure notice sent through {}", outcome.delivered.join(", "));
        } else {
            warn!("Failure notice could not be delivered");
        }
    }
}
