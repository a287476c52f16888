use std::fmt;
use std::sync::PoisonError;

use indexmap::IndexMap;
use strata_common::error::CommonError;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinError;

pub type ControllerResult<T> = Result<T, ControllerError>;

/// Structured attributes attached to a terminal operation error.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorAttributes(IndexMap<String, String>);

impl ErrorAttributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.0.insert(key.into(), value.to_string());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(|x| x.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }
}

impl fmt::Display for ErrorAttributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (key, value) in self.0.iter() {
            if !first {
                write!(f, ", ")?;
            }
            first = false;
            write!(f, "{key}={value}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("internal error: {0}")]
    InternalError(String),
    #[error("operation failed: {message} ({attributes})")]
    OperationFailed {
        message: String,
        attributes: ErrorAttributes,
    },
    #[error("snapshot error: {0}")]
    SnapshotError(String),
    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("error in config: {0}")]
    CommonError(#[from] CommonError),
    #[error("failed to send actor message: {0}")]
    ActorSendError(String),
}

impl ControllerError {
    pub fn invalid(message: impl Into<String>) -> Self {
        ControllerError::InvalidArgument(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        ControllerError::InternalError(message.into())
    }

    pub fn operation_failed(message: impl Into<String>, attributes: ErrorAttributes) -> Self {
        ControllerError::OperationFailed {
            message: message.into(),
            attributes,
        }
    }

    /// Converts the error into the single terminal error reported for the operation.
    pub fn into_operation_failure(self) -> Self {
        match self {
            x @ ControllerError::OperationFailed { .. } => x,
            ControllerError::InternalError(message) => ControllerError::OperationFailed {
                message: "controller invariant violated".to_string(),
                attributes: ErrorAttributes::new()
                    .with("kind", "internal")
                    .with("detail", message),
            },
            x => ControllerError::OperationFailed {
                message: "controller error".to_string(),
                attributes: ErrorAttributes::new().with("detail", x),
            },
        }
    }
}

impl<T> From<mpsc::error::SendError<T>> for ControllerError {
    fn from(error: mpsc::error::SendError<T>) -> Self {
        ControllerError::ActorSendError(error.to_string())
    }
}

impl From<JoinError> for ControllerError {
    fn from(error: JoinError) -> Self {
        ControllerError::InternalError(error.to_string())
    }
}

impl<T> From<PoisonError<T>> for ControllerError {
    fn from(error: PoisonError<T>) -> Self {
        ControllerError::InternalError(error.to_string())
    }
}
