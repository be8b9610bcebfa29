use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

pub(crate) const UNKNOWN_ERROR: &str = "Unknown error.";

pub type RpcResult<T = serde_json::Value> = Result<T, RpcError>;

/// Everything that can settle a call or a request unsuccessfully.
///
/// Lookup and validation errors are scoped to a single call. Transport
/// errors are cloned onto every call of the batch that failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RpcError {
    #[error("IRPC can not be found.")]
    NotFound { name: String },

    #[error("IRPC has no handler.")]
    NoHandler { name: String },

    #[error("stub '{name}' was not defined by this module")]
    InvalidStub { name: String },

    #[error("Invalid arguments.")]
    InvalidArguments,

    #[error("{0}")]
    Validation(String),

    #[error("Transport not found.")]
    TransportNotFound,

    #[error("IRPC call timed out after {}ms.", .0.as_millis())]
    Timeout(Duration),

    #[error("transport failure: {0}")]
    TransportFailure(String),

    /// An error line streamed back by the remote side.
    #[error("{0}")]
    Remote(String),

    #[error(transparent)]
    Handler(#[from] HandlerError),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl From<serde_json::Error> for RpcError {
    fn from(error: serde_json::Error) -> Self {
        RpcError::Codec(error.to_string())
    }
}

/// Rejection raised by a handler or middleware.
///
/// A rejection without a message is reported as `Unknown error.`.
#[derive(Debug, Clone, Default, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("{}", .message.as_deref().unwrap_or(UNKNOWN_ERROR))]
pub struct HandlerError {
    message: Option<String>,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
        }
    }

    pub fn unknown() -> Self {
        Self::default()
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_messages() {
        let not_found = RpcError::NotFound {
            name: "nope".into(),
        };
        assert_eq!(not_found.to_string(), "IRPC can not be found.");
        assert_eq!(RpcError::InvalidArguments.to_string(), "Invalid arguments.");
        assert_eq!(
            RpcError::Timeout(Duration::from_millis(250)).to_string(),
            "IRPC call timed out after 250ms."
        );
    }

    #[test]
    fn handler_error_without_message() {
        assert_eq!(HandlerError::unknown().to_string(), "Unknown error.");
        assert_eq!(
            RpcError::from(HandlerError::from("boom")).to_string(),
            "boom"
        );
    }
}
