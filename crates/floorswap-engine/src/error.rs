use std::fmt;

use thiserror::Error;

/// Input sizes attached to call failures so they can be diagnosed without
/// re-running the request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallContext {
    pub model: String,
    pub room_bytes: usize,
    pub reference_bytes: Vec<usize>,
    pub mask_present: bool,
}

impl fmt::Display for CallContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let references = self
            .reference_bytes
            .iter()
            .map(usize::to_string)
            .collect::<Vec<_>>()
            .join(",");
        write!(
            f,
            "model={} room_bytes={} reference_bytes=[{}] mask={}",
            self.model,
            self.room_bytes,
            references,
            if self.mask_present { "yes" } else { "no" }
        )
    }
}

#[derive(Debug, Error)]
pub enum FloorError {
    #[error("image could not be decoded ({what}): {source}")]
    Decode {
        what: String,
        #[source]
        source: image::ImageError,
    },

    #[error("image could not be encoded: {0}")]
    Encode(#[source] image::ImageError),

    #[error("invalid path {input:?}: {reason}")]
    InvalidPath { input: String, reason: String },

    /// Carries only the caller's input so disallowed targets are not disclosed.
    #[error("path {input:?} is outside the allowed directories")]
    PathNotAllowed { input: String },

    #[error("file not found: {input:?}")]
    FileNotFound { input: String },

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("generation failed ({context}): {message}")]
    Generation {
        message: String,
        context: CallContext,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("generation timed out after {seconds}s ({context})")]
    Timeout { seconds: u64, context: CallContext },

    #[error("Model returned no image output ({context})")]
    EmptyResult { context: CallContext },

    #[error("invalid job: {0}")]
    InvalidJob(String),

    #[error("{what}: {source}")]
    Io {
        what: String,
        #[source]
        source: std::io::Error,
    },
}

impl FloorError {
    pub fn io(what: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            what: what.into(),
            source,
        }
    }

    pub fn generation(message: impl Into<String>, context: CallContext) -> Self {
        Self::Generation {
            message: message.into(),
            context,
            source: None,
        }
    }

    /// Attach call context to errors raised before it was known.
    pub fn with_context(self, call: &CallContext) -> Self {
        match self {
            Self::Generation {
                message, source, ..
            } => Self::Generation {
                message,
                context: call.clone(),
                source,
            },
            Self::Timeout { seconds, .. } => Self::Timeout {
                seconds,
                context: call.clone(),
            },
            Self::EmptyResult { .. } => Self::EmptyResult {
                context: call.clone(),
            },
            other => other,
        }
    }

    pub fn is_path_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidPath { .. } | Self::PathNotAllowed { .. } | Self::FileNotFound { .. }
        )
    }
}

pub type Result<T, E = FloorError> = std::result::Result<T, E>;
