use miette::Diagnostic;
use thiserror::Error;

/// Failure reported by one of the external engines (matrix, HDF5, RDS).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct EngineError(pub String);

impl EngineError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum ScError {
    #[error("format mismatch: {0}")]
    FormatMismatch(String),

    #[error("unknown schema or object type: {0}")]
    SchemaUnknown(String),

    #[error("required field missing: {0}")]
    RequiredFieldMissing(String),

    #[error("dimension mismatch: {0}")]
    DimensionMismatch(String),

    #[error("invalid selector: {0}")]
    SelectorInvalid(String),

    #[error("unsupported delayed operation: {0}")]
    DelayedUnsupported(String),

    #[error("engine failure: {0}")]
    Resource(#[from] EngineError),

    #[error("invalid file reference: {0}")]
    InvalidFile(String),

    #[error("invalid options: {0}")]
    Config(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("failed to parse JSON at {path}: {message}")]
    Json { path: String, message: String },

    #[error("archive error: {0}")]
    Archive(String),

    #[error("failed to decode text from {name}: {message}")]
    Text { name: String, message: String },
}

impl ScError {
    pub(crate) fn json(path: impl Into<String>, err: serde_json::Error) -> Self {
        ScError::Json {
            path: path.into(),
            message: err.to_string(),
        }
    }
}
