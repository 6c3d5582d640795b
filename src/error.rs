#![forbid(unsafe_code)]

use thiserror::Error;

/// Failure taxonomy shared by both conversion handlers and the artifact store.
///
/// `ConversionFailed` carries the real cause for logging while its display
/// text stays generic, so nothing about the tooling leaks to clients.
#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("{0}")]
    InvalidRequest(String),
    #[error("{message}")]
    ConversionFailed {
        message: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("{0}")]
    NotFound(String),
}

impl ConvertError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    pub fn failed(message: impl Into<String>, source: anyhow::Error) -> Self {
        Self::ConversionFailed {
            message: message.into(),
            source,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    /// Machine readable tag exposed next to the human readable message.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::ConversionFailed { .. } => "conversion_failed",
            Self::NotFound(_) => "not_found",
        }
    }
}

pub type ConvertResult<T> = Result<T, ConvertError>;
