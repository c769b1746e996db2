pub mod types;
pub mod config;
pub mod retry;
pub mod parser;
pub mod fetcher;
pub mod source;
pub mod state;
pub mod llm_adapter;
pub mod evaluator;
pub mod translator;
pub mod digest;
pub mod notifiers;
pub mod pipeline;

pub use types::*;
pub use config::Config;
pub use retry::RetryPolicy;
pub use parser::ArxivParser;
pub use fetcher::ArxivFetcher;
pub use source::SourceClient;
pub use state::{open_store, DedupStore, JsonFileSeenStore, MemorySeenStore, PgSeenStore};
pub use llm_adapter::{MockLanguageModel, OpenAiCompatibleModel};
pub use evaluator::{EvaluationOutcome, ParsedResponse, RelevanceEvaluator};
pub use translator::{LibreTranslateService, ModelTranslationService, Translator};
pub use digest::NotificationComposer;
pub use notifiers::{DispatchOutcome, NotificationDispatcher};
pub use pipeline::{PipelineOrchestrator, PipelineSettings, RunOptions, RunReport, RunStage, RunStatus};
