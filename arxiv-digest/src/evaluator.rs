use crate::retry::RetryPolicy;
use crate::types::{DigestError, LanguageModel, PaperCandidate, RelevanceVerdict, Result};
use futures::stream::{self, StreamExt, TryStreamExt};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Model output after parsing. Parsing never fails; it reports what it could not read.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedResponse {
    Verdict {
        is_relevant: bool,
        score: Option<f64>,
        reason: String,
    },
    ParseFailure {
        reason: String,
    },
}

/// A (paper, topic) pair dropped after every parse attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvaluationFailure {
    pub paper_id: String,
    pub topic: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct EvaluationOutcome {
    /// Sorted by (paper id, topic).
    pub verdicts: Vec<RelevanceVerdict>,
    pub failures: Vec<EvaluationFailure>,
}

impl EvaluationOutcome {
    pub fn accepted(&self) -> impl Iterator<Item = &RelevanceVerdict> {
        self.verdicts.iter().filter(|verdict| verdict.accepted)
    }
}

/// Scores each candidate against each topic that returned it.
pub struct RelevanceEvaluator {
    model: Arc<dyn LanguageModel>,
    retry: RetryPolicy,
    threshold: f64,
    attempts: u32,
    concurrency: usize,
}

impl RelevanceEvaluator {
    pub fn new(model: Arc<dyn LanguageModel>, retry: RetryPolicy, threshold: f64) -> Self {
        Self {
            model,
            retry,
            threshold,
            attempts: 3,
            concurrency: 4,
        }
    }

    /// Number of complete-and-parse attempts per pair before it is dropped.
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn build_prompt(paper: &PaperCandidate, topic: &str) -> String {
        format!(
            "You are screening newly published research papers for a digest on the topic \"{topic}\".\n\
             Decide whether the paper below is relevant to that topic.\n\n\
             Title: {title}\n\
             Categories: {categories}\n\
             Abstract: {summary}\n\n\
             Respond with a single JSON object and nothing else:\n\
             {{\"is_relevant\": true or false, \"relevance_score\": a number between 0.0 and 1.0, \"reason\": \"one or two sentences\"}}",
            topic = topic,
            title = paper.title,
            categories = paper.categories.join(", "),
            summary = paper.summary,
        )
    }

    pub fn parse_response(raw: &str) -> ParsedResponse {
        let text = strip_code_fence(raw.trim());

        let Some(object) = outermost_object(text) else {
            return ParsedResponse::ParseFailure {
                reason: "no JSON object in response".to_string(),
            };
        };

        let value: Value = match serde_json::from_str(object) {
            Ok(value) => value,
            Err(e) => {
                return ParsedResponse::ParseFailure {
                    reason: format!("invalid JSON: {}", e),
                }
            }
        };

        let Some(is_relevant) = value.get("is_relevant").and_then(Value::as_bool) else {
            return ParsedResponse::ParseFailure {
                reason: "missing boolean is_relevant".to_string(),
            };
        };

        let score = match value.get("relevance_score") {
            None | Some(Value::Null) => None,
            Some(raw_score) => match raw_score.as_f64() {
                Some(score) if (0.0..=1.0).contains(&score) => Some(score),
                _ => {
                    return ParsedResponse::ParseFailure {
                        reason: format!("relevance_score out of range: {}", raw_score),
                    }
                }
            },
        };

        let reason = value
            .get("reason")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim()
            .to_string();

        ParsedResponse::Verdict {
            is_relevant,
            score,
            reason,
        }
    }

    fn is_accepted(&self, is_relevant: bool, score: Option<f64>) -> bool {
        is_relevant && score.map_or(true, |score| score >= self.threshold)
    }

    /// Evaluate one pair.
    ///
    /// Model call failures go through the shared retry policy and are
    /// returned once it is spent. Unparseable responses are re-requested up
    /// to the attempt budget and then reported as `EvaluationError`.
    pub async fn evaluate(&self, paper: &PaperCandidate, topic: &str) -> Result<RelevanceVerdict> {
        let prompt = Self::build_prompt(paper, topic);
        let label = format!("evaluation of {} under '{}'", paper.id, topic);
        let mut last_reason = String::new();

        for attempt in 1..=self.attempts {
            let raw = self.retry.run(&label, || self.model.complete(&prompt)).await?;

            match Self::parse_response(&raw) {
                ParsedResponse::Verdict {
                    is_relevant,
                    score,
                    reason,
                } => {
                    let accepted = self.is_accepted(is_relevant, score);
                    debug!(
                        "Verdict for {} under '{}': relevant={} score={:?} accepted={}",
                        paper.id, topic, is_relevant, score, accepted
                    );
                    return Ok(RelevanceVerdict {
                        paper_id: paper.id.clone(),
                        topic: topic.to_string(),
                        accepted,
                        score,
                        rationale: reason,
                        model: self.model.model_id(),
                    });
                }
                ParsedResponse::ParseFailure { reason } => {
                    warn!(
                        "Unparseable response for {} (attempt {}/{}): {}",
                        label, attempt, self.attempts, reason
                    );
                    last_reason = reason;
                }
            }
        }

        Err(DigestError::EvaluationError {
            paper_id: paper.id.clone(),
            topic: topic.to_string(),
            reason: last_reason,
        })
    }

    /// Evaluate every (candidate, matched topic) pair with bounded concurrency.
    ///
    /// Pairs that exhaust their parse attempts are dropped and listed in
    /// `failures`; any other error ends the stage.
    pub async fn evaluate_all(&self, candidates: &[PaperCandidate]) -> Result<EvaluationOutcome> {
        let pairs: Vec<(&PaperCandidate, &str)> = candidates
            .iter()
            .flat_map(|paper| {
                paper
                    .matched_topics
                    .iter()
                    .map(move |topic| (paper, topic.as_str()))
            })
            .collect();

        info!(
            "Evaluating {} (paper, topic) pairs with {} using concurrency {}",
            pairs.len(),
            self.model.model_id(),
            self.concurrency
        );

        // The first fatal error drops the stream and cancels pairs still in flight
        let results: Vec<std::result::Result<RelevanceVerdict, EvaluationFailure>> = stream::iter(pairs)
            .map(|(paper, topic)| async move {
                match self.evaluate(paper, topic).await {
                    Ok(verdict) => Ok(Ok(verdict)),
                    Err(DigestError::EvaluationError {
                        paper_id,
                        topic,
                        reason,
                    }) => Ok(Err(EvaluationFailure {
                        paper_id,
                        topic,
                        reason,
                    })),
                    Err(e) => Err(e),
                }
            })
            .buffer_unordered(self.concurrency)
            .try_collect()
            .await?;

        let mut outcome = EvaluationOutcome::default();
        for result in results {
            match result {
                Ok(verdict) => outcome.verdicts.push(verdict),
                Err(failure) => outcome.failures.push(failure),
            }
        }

        outcome
            .verdicts
            .sort_by(|a, b| (&a.paper_id, &a.topic).cmp(&(&b.paper_id, &b.topic)));
        outcome
            .failures
            .sort_by(|a, b| (&a.paper_id, &a.topic).cmp(&(&b.paper_id, &b.topic)));

        info!(
            "Evaluation finished: {} verdicts, {} accepted, {} dropped",
            outcome.verdicts.len(),
            outcome.accepted().count(),
            outcome.failures.len()
        );
        Ok(outcome)
    }
}

fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    // Drop the info string (```json) on the opening line
    let body = match rest.find('\n') {
        Some(pos) => &rest[pos + 1..],
        None => rest,
    };
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

fn outermost_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}
