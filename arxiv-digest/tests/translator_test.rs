mod common;

use arxiv_digest::{types::*, MockLanguageModel, ModelTranslationService, Translator};
use async_trait::async_trait;
use common::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Service that upper-cases text, or always fails.
struct FakeTranslation {
    fail: bool,
    calls: AtomicUsize,
}

impl FakeTranslation {
    fn new(fail: bool) -> Self {
        Self {
            fail,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl TranslationService for FakeTranslation {
    fn service_name(&self) -> String {
        "fake".to_string()
    }

    async fn translate(&self, text: &str, _source: &str, target: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(DigestError::translation("service down"));
        }
        Ok(format!("[{}] {}", target, text.to_uppercase()))
    }
}

#[tokio::test]
async fn test_same_language_is_a_no_op() {
    let service = Arc::new(FakeTranslation::new(false));
    let translator = Translator::new(service.clone(), fast_retry(), "en", "EN");

    assert!(translator.is_identity());
    let summary = translator.translate("An abstract.").await;
    assert_eq!(summary.text, "An abstract.");
    assert!(!summary.degraded);
    assert_eq!(service.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_identity_translator() {
    let translator = Translator::identity("en");
    let summary = translator.translate("Unchanged.").await;
    assert_eq!(summary.text, "Unchanged.");
    assert_eq!(summary.language, "en");
    assert!(!summary.degraded);
}

#[tokio::test]
async fn test_translation_success() {
    let service = Arc::new(FakeTranslation::new(false));
    let translator = Translator::new(service.clone(), fast_retry(), "en", "ja");

    let summary = translator.translate("An abstract.").await;
    assert_eq!(summary.text, "[ja] AN ABSTRACT.");
    assert_eq!(summary.language, "ja");
    assert!(!summary.degraded);

    let blank = translator.translate("   ").await;
    assert!(!blank.degraded);
    assert_eq!(service.calls.load(Ordering::SeqCst), 1, "blank text is not sent");
}

#[tokio::test]
async fn test_unavailable_service_degrades() {
    init_tracing();

    let service = Arc::new(FakeTranslation::new(true));
    let translator = Translator::new(service.clone(), fast_retry(), "en", "ja");

    let summary = translator.translate("An abstract.").await;
    assert_eq!(summary.text, "An abstract.");
    assert_eq!(summary.language, "en");
    assert!(summary.degraded);
    assert_eq!(service.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_translate_papers_keys_by_id() {
    let service = Arc::new(FakeTranslation::new(false));
    let translator = Translator::new(service, fast_retry(), "en", "ja").with_concurrency(2);

    let first = paper("P1", at(2024, 4, 30, 12));
    let second = paper("P2", at(2024, 4, 30, 12));
    let summaries = translator.translate_papers(&[&first, &second]).await;

    assert_eq!(summaries.len(), 2);
    assert_eq!(summaries["P1"].text, "[ja] ABSTRACT OF PAPER P1.");
    assert_eq!(summaries["P2"].text, "[ja] ABSTRACT OF PAPER P2.");
}

#[tokio::test]
async fn test_model_translation_service() -> Result<()> {
    let model = Arc::new(MockLanguageModel::fixed("  電力市場に関する論文  "));
    let service = ModelTranslationService::new(model.clone());

    let translated = service.translate("A paper on power markets.", "en", "ja").await?;
    assert_eq!(translated, "電力市場に関する論文");
    assert!(model.prompts()[0].contains("'ja'"));
    assert!(model.prompts()[0].contains("A paper on power markets."));
    Ok(())
}
