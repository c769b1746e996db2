use std::time::Duration;

/// Failure taxonomy shared by every stage of a digest run.
///
/// Adapters classify transport errors into these variants at their boundary,
/// so the pipeline can decide per variant whether to retry, degrade, drop an
/// item or abort the run.
#[derive(Debug, thiserror::Error)]
pub enum DigestError {
    #[error("Paper source unavailable: {reason}")]
    SourceUnavailable { reason: String },

    #[error("Paper source quota exceeded (retry after {retry_after_secs:?}s)")]
    SourceQuotaExceeded { retry_after_secs: Option<u64> },

    #[error("Language model unavailable: {reason}")]
    ModelUnavailable { reason: String },

    #[error("Evaluation failed for {paper_id} under '{topic}': {reason}")]
    EvaluationError {
        paper_id: String,
        topic: String,
        reason: String,
    },

    #[error("Translation unavailable: {reason}")]
    TranslationUnavailable { reason: String },

    #[error("Delivery failed on channel {channel}: {reason}")]
    DeliveryFailed { channel: String, reason: String },

    #[error("Invalid configuration: {reason}")]
    ConfigurationInvalid { reason: String },

    #[error("State store unavailable: {reason}")]
    StateStoreUnavailable { reason: String },

    #[error("Run exceeded its time budget of {seconds}s")]
    RunTimeout { seconds: u64 },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, DigestError>;

impl DigestError {
    pub fn config(reason: impl Into<String>) -> Self {
        Self::ConfigurationInvalid {
            reason: reason.into(),
        }
    }

    pub fn source(reason: impl Into<String>) -> Self {
        Self::SourceUnavailable {
            reason: reason.into(),
        }
    }

    pub fn model(reason: impl Into<String>) -> Self {
        Self::ModelUnavailable {
            reason: reason.into(),
        }
    }

    pub fn translation(reason: impl Into<String>) -> Self {
        Self::TranslationUnavailable {
            reason: reason.into(),
        }
    }

    pub fn store(reason: impl Into<String>) -> Self {
        Self::StateStoreUnavailable {
            reason: reason.into(),
        }
    }

    pub fn delivery(channel: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::DeliveryFailed {
            channel: channel.into(),
            reason: reason.into(),
        }
    }

    /// Transient failures worth another attempt under the shared backoff policy.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::SourceUnavailable { .. }
                | Self::SourceQuotaExceeded { .. }
                | Self::ModelUnavailable { .. }
                | Self::EvaluationError { .. }
                | Self::TranslationUnavailable { .. }
        )
    }

    /// Server-provided wait hint, when the failure carried one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::SourceQuotaExceeded {
                retry_after_secs: Some(secs),
            } => Some(Duration::from_secs(*secs)),
            _ => None,
        }
    }

    /// Short stable label used in run diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SourceUnavailable { .. } => "source_unavailable",
            Self::SourceQuotaExceeded { .. } => "source_quota_exceeded",
            Self::ModelUnavailable { .. } => "model_unavailable",
            Self::EvaluationError { .. } => "evaluation_error",
            Self::TranslationUnavailable { .. } => "translation_unavailable",
            Self::DeliveryFailed { .. } => "delivery_failed",
            Self::ConfigurationInvalid { .. } => "configuration_invalid",
            Self::StateStoreUnavailable { .. } => "state_store_unavailable",
            Self::RunTimeout { .. } => "run_timeout",
            Self::Serialization(_) => "serialization",
        }
    }
}
