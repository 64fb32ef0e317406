use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("parse error at line {line}, column {col}: {message}")]
    Parse {
        line: usize,
        col: usize,
        message: String,
    },

    #[error("parse error near {snippet:?}: {message}")]
    ParseSnippet { snippet: String, message: String },

    #[error("expression parse error in {text:?}: {message}")]
    ExpressionParse { text: String, message: String },

    #[error("expression evaluation error in {text:?}: {message}")]
    ExpressionEval { text: String, message: String },

    #[error("unknown reference from fragment {fragment_id:?} to {target_name:?}")]
    UnknownReference {
        fragment_id: String,
        target_name: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;
