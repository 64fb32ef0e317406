use std::path::PathBuf;
use stsvideo_core::CoreError;
use thiserror::Error;

/// The exit-code class an error maps to for external drivers (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitClass {
    UserError = 1,
    ExternalToolFailure = 2,
    Cancelled = 3,
}

#[derive(Debug, Error)]
pub enum CompileError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("fragment {fragment_id:?} references unknown target {target_name:?}")]
    UnknownReference {
        fragment_id: String,
        target_name: String,
    },

    #[error("asset file missing: {0}")]
    AssetMissing(PathBuf),

    #[error("probing asset {path:?} failed: {message}")]
    AssetProbeFailed { path: PathBuf, message: String },

    #[error("expressions did not converge to a fixed point for fragments {0:?}")]
    UnresolvableExpression(Vec<String>),

    #[error("fragment {fragment_id:?} requests {requested_ms}ms but only {available_ms}ms is available")]
    DurationOverflow {
        fragment_id: String,
        requested_ms: i64,
        available_ms: i64,
    },

    #[error("invalid inputs to filter {filter_name}: {details}")]
    InvalidFilterInputs { filter_name: String, details: String },

    #[error("fragment {fragment_id:?} has an invalid target: {detail}")]
    InvalidFragmentTarget { fragment_id: String, detail: String },

    #[error("output {name:?} is invalid: {detail}")]
    InvalidOutput { name: String, detail: String },

    #[error("app {0:?} did not signal render completion within the timeout")]
    AppRenderTimeout(String),

    #[error("container {container_id:?} failed to render: {message}")]
    ContainerRenderFailed { container_id: String, message: String },

    #[error("encoder binary not found on PATH")]
    EncoderNotFound,

    #[error("probe binary not found on PATH")]
    ProbeNotFound,

    #[error("encoder exited with code {exit_code}: {tail}")]
    EncoderFailed { exit_code: i32, tail: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CompileError {
    pub fn exit_class(&self) -> ExitClass {
        match self {
            CompileError::Cancelled => ExitClass::Cancelled,
            CompileError::EncoderNotFound
            | CompileError::ProbeNotFound
            | CompileError::EncoderFailed { .. }
            | CompileError::AppRenderTimeout(_)
            | CompileError::ContainerRenderFailed { .. } => ExitClass::ExternalToolFailure,
            _ => ExitClass::UserError,
        }
    }
}

pub type Result<T> = std::result::Result<T, CompileError>;
