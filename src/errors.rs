use thiserror::Error;

/// Classified failure kinds for the pipeline. Jobs and services bubble these
/// through `anyhow` so call sites can downcast when the kind matters.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("missing input: {0}")]
    MissingInput(String),

    #[error("parse failure: {0}")]
    ParseFailure(String),

    #[error("external source unavailable: {0}")]
    ExternalUnavailable(String),

    #[error("schema validation failed for {card_type}: {detail}")]
    SchemaValidation { card_type: String, detail: String },

    #[error("store integrity violation: {0}")]
    StoreIntegrity(String),

    #[error("cancelled")]
    Cancelled,
}
