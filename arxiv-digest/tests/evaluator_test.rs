mod common;

use arxiv_digest::{types::*, MockLanguageModel, ParsedResponse, RelevanceEvaluator};
use common::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[test]
fn test_parse_plain_json() {
    let parsed = RelevanceEvaluator::parse_response(RELEVANT);
    assert_eq!(
        parsed,
        ParsedResponse::Verdict {
            is_relevant: true,
            score: Some(0.9),
            reason: "Directly about market design.".to_string(),
        }
    );
}

#[test]
fn test_parse_fenced_json_with_chatter() {
    let raw = "Here is my assessment:\n```json\n{\"is_relevant\": false, \"relevance_score\": 0.2, \"reason\": \"About {weather}.\"}\n```\n";
    let parsed = RelevanceEvaluator::parse_response(raw);
    assert_eq!(
        parsed,
        ParsedResponse::Verdict {
            is_relevant: false,
            score: Some(0.2),
            reason: "About {weather}.".to_string(),
        }
    );

    let fenced = "```\n{\"is_relevant\": true}\n```";
    assert_eq!(
        RelevanceEvaluator::parse_response(fenced),
        ParsedResponse::Verdict {
            is_relevant: true,
            score: None,
            reason: String::new(),
        }
    );
}

#[test]
fn test_parse_failures() {
    let cases = [
        "Yes, this paper is relevant.",
        "{\"relevance_score\": 0.9, \"reason\": \"missing flag\"}",
        "{\"is_relevant\": \"yes\"}",
        "{\"is_relevant\": true, \"relevance_score\": 7}",
        "{\"is_relevant\": true,",
    ];
    for raw in cases {
        assert!(
            matches!(RelevanceEvaluator::parse_response(raw), ParsedResponse::ParseFailure { .. }),
            "expected parse failure for {:?}",
            raw
        );
    }
}

#[test]
fn test_prompt_is_deterministic() {
    let candidate = paper("2404.00001", at(2024, 4, 30, 12));
    let first = RelevanceEvaluator::build_prompt(&candidate, "energy market");
    let second = RelevanceEvaluator::build_prompt(&candidate, "energy market");
    assert_eq!(first, second);
    assert!(first.contains("\"energy market\""));
    assert!(first.contains("Title: Paper 2404.00001"));
    assert!(first.contains("Abstract of paper 2404.00001."));
    assert!(first.contains("is_relevant"));
}

#[tokio::test]
async fn test_threshold_decides_acceptance() -> Result<()> {
    let model = Arc::new(MockLanguageModel::fixed(
        r#"{"is_relevant": true, "relevance_score": 0.6, "reason": "tangential"}"#,
    ));
    let evaluator = RelevanceEvaluator::new(model, fast_retry(), 0.7);

    let verdict = evaluator
        .evaluate(&paper("K", at(2024, 4, 30, 12)), "energy market")
        .await?;
    assert!(!verdict.accepted);
    assert_eq!(verdict.score, Some(0.6));
    assert_eq!(verdict.rationale, "tangential");
    assert_eq!(verdict.model, "mock");
    Ok(())
}

#[tokio::test]
async fn test_parse_failure_is_retried_then_succeeds() -> Result<()> {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let model = Arc::new(MockLanguageModel::new("flaky", move |_| {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            Ok("not json at all".to_string())
        } else {
            Ok(RELEVANT.to_string())
        }
    }));
    let evaluator = RelevanceEvaluator::new(model.clone(), fast_retry(), 0.7).with_attempts(3);

    let verdict = evaluator
        .evaluate(&paper("L", at(2024, 4, 30, 12)), "energy market")
        .await?;
    assert!(verdict.accepted);
    assert_eq!(model.calls(), 2);
    Ok(())
}

#[tokio::test]
async fn test_model_outage_is_fatal_after_retries() {
    let model = Arc::new(MockLanguageModel::new("down", |_| {
        Err(DigestError::model("HTTP 503"))
    }));
    let mut candidate = paper("M", at(2024, 4, 30, 12));
    candidate.matched_topics = vec!["energy market".to_string()];
    let evaluator = RelevanceEvaluator::new(model.clone(), fast_retry(), 0.7);

    let result = evaluator.evaluate_all(&[candidate]).await;
    assert!(matches!(result, Err(DigestError::ModelUnavailable { .. })));
    assert_eq!(model.calls(), 3);
}

#[tokio::test]
async fn test_model_outage_stops_remaining_pairs() {
    let model = Arc::new(MockLanguageModel::new("down", |_| {
        Err(DigestError::model("HTTP 503"))
    }));
    let candidates: Vec<PaperCandidate> = (0..10)
        .map(|i| {
            let mut candidate = paper(&format!("N{}", i), at(2024, 4, 30, 12));
            candidate.matched_topics = vec!["energy market".to_string()];
            candidate
        })
        .collect();
    let evaluator = RelevanceEvaluator::new(model.clone(), fast_retry(), 0.7).with_concurrency(1);

    let result = evaluator.evaluate_all(&candidates).await;
    assert!(matches!(result, Err(DigestError::ModelUnavailable { .. })));
    assert_eq!(model.calls(), 3, "only the first pair spends its retries");
}

#[tokio::test]
async fn test_evaluate_all_orders_by_paper_and_topic() -> Result<()> {
    init_tracing();

    let published = at(2024, 4, 30, 12);
    let mut b = paper("B", published);
    b.matched_topics = vec!["energy market".to_string(), "electricity market".to_string()];
    let mut a = paper("A", published);
    a.matched_topics = vec!["energy market".to_string()];
    let mut d = paper("D", published);
    d.matched_topics = vec!["energy market".to_string()];

    let model = Arc::new(MockLanguageModel::new("scripted", |prompt| {
        if prompt_title(prompt) == "Paper D" {
            Ok("garbage".to_string())
        } else {
            Ok(RELEVANT.to_string())
        }
    }));
    let evaluator = RelevanceEvaluator::new(model, fast_retry(), 0.7).with_concurrency(3);

    let outcome = evaluator.evaluate_all(&[b, a, d]).await?;
    let keys: Vec<(&str, &str)> = outcome
        .verdicts
        .iter()
        .map(|v| (v.paper_id.as_str(), v.topic.as_str()))
        .collect();
    assert_eq!(
        keys,
        vec![
            ("A", "energy market"),
            ("B", "electricity market"),
            ("B", "energy market"),
        ]
    );
    assert_eq!(outcome.failures.len(), 1);
    assert_eq!(outcome.failures[0].paper_id, "D");
    assert_eq!(outcome.accepted().count(), 3);
    Ok(())
}
